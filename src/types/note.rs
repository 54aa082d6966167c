//! Note and wallet-state types for the value transfer protocol
//!
//! This module defines the `Note` (an indivisible unit of value) and the
//! `PartyState` ledger snapshot each agent keeps for its own wallet.

use std::collections::HashSet;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::error::ValueTransferError;
use super::transaction::{Did, TransactionId};

/// An indivisible unit of value
///
/// The commitment scheme backing a note is external; the protocol core only
/// tracks its identity, value and current owner.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Note {
    /// Unique note identifier
    pub id: String,

    /// Face value of the note
    pub value: Decimal,

    /// DID that currently owns the note
    pub owner: Did,
}

impl Note {
    /// Create a fresh note with a random id
    pub fn new(value: Decimal, owner: Did) -> Self {
        Note {
            id: Uuid::new_v4().to_string(),
            value,
            owner,
        }
    }
}

/// Sum of note values
pub fn total_value(notes: &[Note]) -> Decimal {
    notes.iter().map(|n| n.value).sum()
}

/// Every note must carry positive value under an id not repeated in `notes`
///
/// # Errors
///
/// * `InvalidAmount` - For the first note valued zero or less
/// * `DuplicateNote` - For the first id seen twice
pub fn check_notes(id: impl ToString, notes: &[Note]) -> Result<(), ValueTransferError> {
    let mut seen = HashSet::new();
    for note in notes {
        if note.value <= Decimal::ZERO {
            return Err(ValueTransferError::InvalidAmount { amount: note.value });
        }
        if !seen.insert(note.id.as_str()) {
            return Err(ValueTransferError::DuplicateNote {
                id: id.to_string(),
                note: note.id.clone(),
            });
        }
    }
    Ok(())
}

/// A note held in the local wallet, possibly reserved by an in-flight transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OwnedNote {
    pub note: Note,

    /// Transaction that selected this note, if any
    ///
    /// Reserved notes cannot be selected by another transaction, which is
    /// what keeps two concurrent payments from spending the same note.
    pub reserved_by: Option<TransactionId>,
}

/// Per-wallet ledger snapshot
///
/// Exactly one `PartyState` exists per agent. It is created at bootstrap,
/// updated on every committed cash movement and never deleted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PartyState {
    /// Notes owned by this party
    pub notes: Vec<OwnedNote>,

    /// Monotonically advancing mutation counter
    pub sequence: u64,
}

impl PartyState {
    /// Create a party state owning the given notes
    pub fn with_notes(notes: Vec<Note>) -> Self {
        PartyState {
            notes: notes
                .into_iter()
                .map(|note| OwnedNote {
                    note,
                    reserved_by: None,
                })
                .collect(),
            sequence: 0,
        }
    }

    /// Total value of all owned notes, reserved or not
    pub fn balance(&self) -> Decimal {
        self.notes.iter().map(|n| n.note.value).sum()
    }

    /// Value of notes not reserved by any transaction
    pub fn available_balance(&self) -> Decimal {
        self.notes
            .iter()
            .filter(|n| n.reserved_by.is_none())
            .map(|n| n.note.value)
            .sum()
    }

    pub fn contains(&self, note_id: &str) -> bool {
        self.notes.iter().any(|n| n.note.id == note_id)
    }

    /// Reserve unreserved notes covering `amount` for transaction `tx`
    ///
    /// Notes already reserved by `tx` are returned again so that a retried
    /// acceptance selects the same notes.
    ///
    /// # Returns
    ///
    /// * `Ok(Vec<Note>)` - The selected notes; their sum is at least `amount`
    /// * `Err(ValueTransferError::InsufficientFunds)` - If unreserved notes do not cover `amount`
    pub fn select_notes(
        &mut self,
        amount: Decimal,
        tx: &TransactionId,
    ) -> Result<Vec<Note>, ValueTransferError> {
        let already: Vec<Note> = self
            .notes
            .iter()
            .filter(|n| n.reserved_by.as_ref() == Some(tx))
            .map(|n| n.note.clone())
            .collect();
        if !already.is_empty() && total_value(&already) >= amount {
            return Ok(already);
        }

        let available = self.available_balance() + total_value(&already);
        if available < amount {
            return Err(ValueTransferError::insufficient_funds(available, amount));
        }

        let mut covered = total_value(&already);
        for owned in self.notes.iter_mut() {
            if covered >= amount {
                break;
            }
            if owned.reserved_by.is_none() {
                owned.reserved_by = Some(tx.clone());
                covered += owned.note.value;
            }
        }
        self.sequence += 1;

        Ok(self
            .notes
            .iter()
            .filter(|n| n.reserved_by.as_ref() == Some(tx))
            .map(|n| n.note.clone())
            .collect())
    }

    /// Reserve exactly `notes` for `tx`, all or nothing
    ///
    /// Each note must be held with the same value, owned by `owner` and not
    /// reserved by another transaction.
    pub fn reserve(
        &mut self,
        notes: &[Note],
        owner: &Did,
        tx: &TransactionId,
    ) -> Result<(), ValueTransferError> {
        for note in notes {
            let held = self.notes.iter().find(|n| n.note.id == note.id);
            let spendable = held.is_some_and(|n| {
                n.note.value == note.value
                    && &n.note.owner == owner
                    && n.reserved_by.as_ref().map_or(true, |r| r == tx)
            });
            if !spendable {
                return Err(ValueTransferError::UnknownNote {
                    note: note.id.clone(),
                    owner: owner.clone(),
                });
            }
        }
        for owned in self.notes.iter_mut() {
            if notes.iter().any(|n| n.id == owned.note.id) {
                owned.reserved_by = Some(tx.clone());
            }
        }
        self.sequence += 1;
        Ok(())
    }

    /// Drop every reservation held by `tx`
    pub fn release(&mut self, tx: &TransactionId) {
        let mut changed = false;
        for owned in self.notes.iter_mut() {
            if owned.reserved_by.as_ref() == Some(tx) {
                owned.reserved_by = None;
                changed = true;
            }
        }
        if changed {
            self.sequence += 1;
        }
    }

    /// Remove notes by id, returning the total value removed
    ///
    /// Unknown ids are skipped, so consuming the same notes twice is a no-op.
    pub fn consume(&mut self, note_ids: &[String]) -> Decimal {
        let before = self.balance();
        self.notes.retain(|n| !note_ids.contains(&n.note.id));
        let removed = before - self.balance();
        if !removed.is_zero() {
            self.sequence += 1;
        }
        removed
    }

    /// Add notes to the wallet, skipping ids already held
    pub fn receive(&mut self, notes: &[Note]) -> Decimal {
        let mut added = Decimal::ZERO;
        for note in notes {
            if !self.contains(&note.id) {
                self.notes.push(OwnedNote {
                    note: note.clone(),
                    reserved_by: None,
                });
                added += note.value;
            }
        }
        if !added.is_zero() {
            self.sequence += 1;
        }
        added
    }
}
