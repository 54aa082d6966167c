//! Witness coordinator
//!
//! The witness is the only role that moves note ownership in its ledger. It
//! notarizes the giver's acceptance after checking that the committed notes
//! exist, belong to the giver and conserve value, and on the getter's cash
//! acceptance it moves the notes and issues the receipts. It also records
//! mints.
//!
//! Intermediate steps send before persisting, so a delivery failure leaves the
//! transaction where it was and the counterpart can retry. The final cash
//! commit and the mint persist first and then report delivery failures: the
//! ledger change is authoritative once made.

use chrono::Utc;
use rust_decimal::Decimal;
use tracing::{info, warn};

use super::party::PartyCoordinator;
use crate::core::TransactionGuard;
use crate::types::{
    check_notes, total_value, CashAcceptance, CashRemoval, Did, MessageBody, MintRequest, MintResponse,
    Note, PaymentRequest, ProtocolMessage, Receipt, RequestAcceptance, Role, TransactionId,
    TransactionState, ValueTransferError, ValueTransferRecord, WitnessedAcceptance, WitnessedCash,
};

pub struct WitnessCoordinator {
    party: PartyCoordinator,
}

impl WitnessCoordinator {
    pub fn new(party: PartyCoordinator) -> Self {
        WitnessCoordinator { party }
    }

    /// Inbound `Request` naming this agent as witness
    ///
    /// Registers the transaction so that the giver's acceptance is checked
    /// against what the getter asked for.
    pub async fn process_request(
        &self,
        from: &Did,
        thid: &TransactionId,
        request: PaymentRequest,
    ) -> Result<ValueTransferRecord, ValueTransferError> {
        if &request.getter != from {
            return Err(ValueTransferError::did_mismatch(thid, &request.getter, from));
        }
        self.ensure_named(thid, &request)?;

        let guard = self.party.lock(thid).await;
        if let Some(record) = self.party.find(&guard).await {
            return Ok(self.party.ignore(record, "request"));
        }

        let amount = request.amount;
        let record = self.register(&guard, request).await?;
        if amount > Decimal::ZERO {
            return Ok(record);
        }
        let outcome = Err(ValueTransferError::InvalidAmount { amount });
        self.party.settle(&guard, record, outcome, Some(from)).await
    }

    fn ensure_named(
        &self,
        thid: &TransactionId,
        request: &PaymentRequest,
    ) -> Result<(), ValueTransferError> {
        let me = self.party.did();
        match &request.witness {
            Some(witness) if witness == me => Ok(()),
            Some(witness) => Err(ValueTransferError::did_mismatch(thid, witness, me)),
            None => Err(ValueTransferError::missing_party(thid, "witness")),
        }
    }

    async fn register(
        &self,
        guard: &TransactionGuard,
        request: PaymentRequest,
    ) -> Result<ValueTransferRecord, ValueTransferError> {
        let mut record = self.party.new_record(
            Role::Witness,
            guard.id().clone(),
            TransactionState::RequestReceived,
            request.amount,
        );
        let tx = &mut record.transaction;
        tx.unit_of_amount = request.unit_of_amount;
        tx.getter = Some(request.getter);
        tx.giver = request.giver.clone();
        tx.witness = Some(self.party.did().clone());
        tx.timeouts = request.timeouts;
        tx.expected_recipient_did = request.giver;

        self.party.create(guard, record).await
    }

    /// Inbound `RequestAccepted` from the giver
    ///
    /// Validates the committed notes, reserves them in the ledger and forwards
    /// the notarized acceptance to the getter. Any check failing moves the
    /// transaction to `Failed` and reports to both parties. The getter's
    /// `Request` must have registered the transaction first; acceptances for
    /// unknown transactions are dropped with `TransactionNotFound`.
    pub async fn process_request_accepted(
        &self,
        from: &Did,
        thid: &TransactionId,
        acceptance: RequestAcceptance,
    ) -> Result<ValueTransferRecord, ValueTransferError> {
        let guard = self.party.lock(thid).await;
        let record = self.party.load(&guard, "process_request_accepted").await?;
        if record.role != Role::Witness || record.state() != TransactionState::RequestReceived {
            return Ok(self.party.ignore(record, "request-accepted"));
        }

        let outcome = self
            .notarize_acceptance(&guard, record.clone(), from, acceptance)
            .await;
        self.party.settle(&guard, record, outcome, Some(from)).await
    }

    async fn notarize_acceptance(
        &self,
        guard: &TransactionGuard,
        record: ValueTransferRecord,
        from: &Did,
        acceptance: RequestAcceptance,
    ) -> Result<ValueTransferRecord, ValueTransferError> {
        let tx = &record.transaction;
        let id = record.id.clone();
        self.party.verify_sender(&record, from, tx.giver.as_ref())?;
        self.party
            .verify_sender(&record, from, acceptance.request.giver.as_ref())?;
        let getter = tx
            .getter
            .clone()
            .ok_or_else(|| ValueTransferError::missing_party(&id, "getter"))?;
        self.party
            .verify_sender(&record, &acceptance.request.getter, Some(&getter))?;
        if acceptance.request.amount != tx.amount {
            return Err(ValueTransferError::amount_mismatch(
                &id,
                tx.amount,
                acceptance.request.amount,
            ));
        }
        if tx.timeouts.giver_expired(Utc::now()) {
            return Err(ValueTransferError::expired(&id, "giver"));
        }
        check_conservation(&id, tx.amount, &getter, from, &acceptance)?;

        let RequestAcceptance {
            request,
            inputs,
            outputs,
        } = acceptance;
        self.party
            .context()
            .ledger
            .use_party_state(guard, |ledger| {
                if let Some(taken) = outputs.iter().find(|n| ledger.contains(&n.id)) {
                    return Err(ValueTransferError::UnknownNote {
                        note: taken.id.clone(),
                        owner: taken.owner.clone(),
                    });
                }
                ledger.reserve(&inputs, from, &id)
            })
            .await?;

        let witnessed = WitnessedAcceptance {
            amount: tx.amount,
            giver: from.clone(),
            witness: self.party.did().clone(),
            outputs: outputs.clone(),
        };
        let message = ProtocolMessage::new(
            id.clone(),
            MessageBody::RequestAcceptedWitnessed(witnessed),
        );
        if let Err(error) = self.party.send(&getter, message, None).await {
            self.party
                .context()
                .ledger
                .use_party_state(guard, |ledger| {
                    ledger.release(&id);
                    Ok(())
                })
                .await?;
            return Err(error);
        }

        self.party
            .transition(guard, record, TransactionState::RequestAcceptedWitnessed, |tx| {
                tx.giver = Some(from.clone());
                tx.inputs = inputs;
                tx.outputs = outputs;
                if request.timeouts.witness.is_some() {
                    tx.timeouts.witness = request.timeouts.witness;
                }
                tx.expected_recipient_did = Some(getter);
            })
            .await
    }

    /// Inbound `CashAccepted` from the getter
    ///
    /// Moves the notes in the ledger and walks the transaction through
    /// `CashAcceptedWitnessed` and `CashRemoved` to `Completed`, then tells
    /// the giver and sends both receipts.
    ///
    /// # Errors
    ///
    /// `Delivery` if any of the closing messages could not be sent. The
    /// transfer is committed regardless.
    pub async fn process_cash_accepted(
        &self,
        from: &Did,
        thid: &TransactionId,
        acceptance: CashAcceptance,
    ) -> Result<ValueTransferRecord, ValueTransferError> {
        let guard = self.party.lock(thid).await;
        let record = self.party.load(&guard, "process_cash_accepted").await?;
        if record.role != Role::Witness
            || record.state() != TransactionState::RequestAcceptedWitnessed
        {
            return Ok(self.party.ignore(record, "cash-accepted"));
        }

        let outcome = self
            .commit_transfer(&guard, record.clone(), from, acceptance)
            .await;
        self.party.settle(&guard, record, outcome, Some(from)).await
    }

    async fn commit_transfer(
        &self,
        guard: &TransactionGuard,
        record: ValueTransferRecord,
        from: &Did,
        acceptance: CashAcceptance,
    ) -> Result<ValueTransferRecord, ValueTransferError> {
        let id = record.id.clone();
        let tx = record.transaction.clone();
        self.party.verify_sender(&record, from, tx.getter.as_ref())?;
        if acceptance.amount != tx.amount {
            return Err(ValueTransferError::amount_mismatch(
                &id,
                tx.amount,
                acceptance.amount,
            ));
        }
        let now = Utc::now();
        if tx.timeouts.witness_expired(now) {
            return Err(ValueTransferError::expired(&id, "witness"));
        }
        let (getter, giver) = match (tx.getter.clone(), tx.giver.clone()) {
            (Some(getter), Some(giver)) => (getter, giver),
            (None, _) => return Err(ValueTransferError::missing_party(&id, "getter")),
            (_, None) => return Err(ValueTransferError::missing_party(&id, "giver")),
        };

        let spent: Vec<String> = tx.inputs.iter().map(|n| n.id.clone()).collect();
        let committed = total_value(&tx.inputs);
        self.party
            .context()
            .ledger
            .use_party_state(guard, |ledger| {
                let removed = ledger.consume(&spent);
                if removed != committed || committed != total_value(&tx.outputs) {
                    return Err(ValueTransferError::amount_mismatch(&id, committed, removed));
                }
                ledger.receive(&tx.outputs);
                Ok(())
            })
            .await?;
        info!(thid = %id, moved = %committed, notes_in = spent.len(), notes_out = tx.outputs.len(), "notes moved");

        let receipt = Receipt {
            thid: id.clone(),
            amount: tx.amount,
            unit_of_amount: tx.unit_of_amount.clone(),
            getter: getter.clone(),
            giver: giver.clone(),
            witness: self.party.did().clone(),
            inputs: tx.inputs.clone(),
            outputs: tx.outputs.clone(),
            issued_at: now,
        };

        let record = self
            .party
            .transition(guard, record, TransactionState::CashAcceptedWitnessed, |tx| {
                tx.expected_recipient_did = None;
            })
            .await?;
        let record = self
            .party
            .transition(guard, record, TransactionState::CashRemoved, |tx| {
                tx.cash_settled = true;
            })
            .await?;
        let record = self
            .party
            .transition(guard, record, TransactionState::Completed, |tx| {
                tx.receipt = Some(receipt.clone());
            })
            .await?;

        let change: Vec<Note> = tx
            .outputs
            .iter()
            .filter(|n| n.owner == giver)
            .cloned()
            .collect();
        let closing = [
            (
                &giver,
                MessageBody::CashAcceptedWitnessed(WitnessedCash {
                    amount: tx.amount,
                    witnessed_at: now,
                }),
            ),
            (
                &giver,
                MessageBody::CashRemoved(CashRemoval {
                    removed: spent,
                    change,
                }),
            ),
            (&giver, MessageBody::GiverReceipt(receipt.clone())),
            (&getter, MessageBody::GetterReceipt(receipt)),
        ];
        let mut undelivered = None;
        for (to, body) in closing {
            if let Err(error) = self
                .party
                .send(to, ProtocolMessage::new(id.clone(), body), None)
                .await
            {
                undelivered.get_or_insert(error);
            }
        }

        match undelivered {
            Some(error) => {
                warn!(thid = %id, %error, "transfer committed but not every party was told");
                Err(error)
            }
            None => Ok(record),
        }
    }

    /// Inbound `Mint` from an issuer
    ///
    /// Records the new notes in the ledger and confirms with a `MintResponse`.
    ///
    /// # Errors
    ///
    /// * `DidMismatch` - If the sender is not the named issuer; nothing is recorded
    /// * `Delivery` - If the confirmation could not be sent; the mint stands
    pub async fn process_mint(
        &self,
        from: &Did,
        thid: &TransactionId,
        mint: MintRequest,
    ) -> Result<ValueTransferRecord, ValueTransferError> {
        if &mint.issuer != from {
            return Err(ValueTransferError::did_mismatch(thid, &mint.issuer, from));
        }

        let guard = self.party.lock(thid).await;
        if let Some(record) = self.party.find(&guard).await {
            return Ok(self.party.ignore(record, "mint"));
        }

        let mut record = self.party.new_record(
            Role::Witness,
            thid.clone(),
            TransactionState::RequestReceived,
            mint.amount,
        );
        record.transaction.unit_of_amount = mint.unit_of_amount.clone();
        record.transaction.getter = Some(mint.issuer.clone());
        record.transaction.witness = Some(self.party.did().clone());
        let record = self.party.create(&guard, record).await?;

        let outcome = self.record_mint(&guard, record.clone(), mint).await;
        self.party.settle(&guard, record, outcome, Some(from)).await
    }

    async fn record_mint(
        &self,
        guard: &TransactionGuard,
        record: ValueTransferRecord,
        mint: MintRequest,
    ) -> Result<ValueTransferRecord, ValueTransferError> {
        let id = record.id.clone();
        check_notes(&id, &mint.notes)?;
        let minted = total_value(&mint.notes);
        if minted != mint.amount || mint.notes.is_empty() {
            return Err(ValueTransferError::amount_mismatch(&id, mint.amount, minted));
        }
        if let Some(foreign) = mint.notes.iter().find(|n| n.owner != mint.issuer) {
            return Err(ValueTransferError::did_mismatch(&id, &mint.issuer, &foreign.owner));
        }

        let notes = mint.notes;
        self.party
            .context()
            .ledger
            .use_party_state(guard, |ledger| {
                if let Some(known) = notes.iter().find(|n| ledger.contains(&n.id)) {
                    return Err(ValueTransferError::UnknownNote {
                        note: known.id.clone(),
                        owner: known.owner.clone(),
                    });
                }
                Ok(ledger.receive(&notes))
            })
            .await?;
        info!(thid = %id, issuer = %mint.issuer, amount = %minted, "mint recorded");

        let note_ids = notes.iter().map(|n| n.id.clone()).collect();
        let record = self
            .party
            .transition(guard, record, TransactionState::Completed, |tx| {
                tx.outputs = notes;
                tx.cash_settled = true;
            })
            .await?;

        let response = ProtocolMessage::new(
            id,
            MessageBody::MintResponse(MintResponse { note_ids }),
        );
        self.party.send(&mint.issuer, response, None).await?;
        Ok(record)
    }
}

/// Value in must equal value out, and the getter must receive exactly `amount`
///
/// Outputs may only go to the getter (payment) or the giver (change). Every
/// note must carry positive value and appear once.
fn check_conservation(
    id: &TransactionId,
    amount: Decimal,
    getter: &Did,
    giver: &Did,
    acceptance: &RequestAcceptance,
) -> Result<(), ValueTransferError> {
    check_notes(id, &acceptance.inputs)?;
    check_notes(id, &acceptance.outputs)?;
    let value_in = total_value(&acceptance.inputs);
    let value_out = total_value(&acceptance.outputs);
    if value_in != value_out {
        return Err(ValueTransferError::amount_mismatch(id, value_in, value_out));
    }
    if let Some(stray) = acceptance
        .outputs
        .iter()
        .find(|n| &n.owner != getter && &n.owner != giver)
    {
        return Err(ValueTransferError::did_mismatch(id, getter, &stray.owner));
    }
    let paid: Decimal = acceptance
        .outputs
        .iter()
        .filter(|n| &n.owner == getter)
        .map(|n| n.value)
        .sum();
    if paid != amount {
        return Err(ValueTransferError::amount_mismatch(id, amount, paid));
    }
    Ok(())
}
