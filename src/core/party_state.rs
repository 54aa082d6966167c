//! Wallet-level party state management
//!
//! This module provides the `PartyStateStore`, the single lock-guarded owner
//! of the agent's [`PartyState`]. All reads-modify-writes go through
//! [`PartyStateStore::use_party_state`].
//!
//! # Design
//!
//! The store keeps the state behind a `tokio::sync::Mutex` (the wallet lock).
//! A mutation runs against a copy of the state and is committed only if the
//! closure succeeds, so a failed note selection leaves the wallet untouched.
//! Entering the critical section requires a [`TransactionGuard`], which makes
//! the transaction lock a prerequisite of the wallet lock.

use tokio::sync::Mutex;
use tracing::debug;

use super::lock_manager::TransactionGuard;
use crate::types::{Note, PartyState, ValueTransferError};
use rust_decimal::Decimal;

/// Process-wide owner of the local party state
#[derive(Debug, Default)]
pub struct PartyStateStore {
    state: Mutex<PartyState>,
}

impl PartyStateStore {
    /// Create a store with an empty wallet
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store seeded with notes at agent bootstrap
    pub fn bootstrap(notes: Vec<Note>) -> Self {
        PartyStateStore {
            state: Mutex::new(PartyState::with_notes(notes)),
        }
    }

    /// Atomic read-modify-write of the party state
    ///
    /// The closure receives a mutable copy; the copy replaces the stored
    /// state only when the closure returns `Ok`.
    ///
    /// # Arguments
    ///
    /// * `guard` - The transaction lock held by the caller
    /// * `f` - The mutation to apply
    pub async fn use_party_state<F, R>(
        &self,
        guard: &TransactionGuard,
        f: F,
    ) -> Result<R, ValueTransferError>
    where
        F: FnOnce(&mut PartyState) -> Result<R, ValueTransferError>,
    {
        let mut state = self.state.lock().await;
        let mut working = state.clone();
        let result = f(&mut working)?;
        if working != *state {
            debug!(
                thid = %guard.id(),
                sequence = working.sequence,
                balance = %working.balance(),
                "party state committed"
            );
            *state = working;
        }
        Ok(result)
    }

    /// Copy of the current state
    pub async fn snapshot(&self) -> PartyState {
        self.state.lock().await.clone()
    }

    pub async fn balance(&self) -> Decimal {
        self.state.lock().await.balance()
    }
}
