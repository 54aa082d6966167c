//! Giver coordinator
//!
//! The giver sends value. It answers payment requests (or the request that
//! answers its own offer) by committing notes from its wallet and asking the
//! witness to notarize the move. The wallet effect (spent inputs out, change
//! in) is applied once, on `CashRemoved` or on the receipt, whichever arrives
//! first.

use chrono::Utc;
use rust_decimal::Decimal;
use tracing::info;

use super::party::PartyCoordinator;
use crate::core::{TransactionGuard, TransportHint};
use crate::types::{
    total_value, CashRemoval, Did, MessageBody, Note, PaymentOffer, PaymentRequest,
    ProtocolMessage, Receipt, RequestAcceptance, Role, Timeouts, TransactionId, TransactionState,
    ValueTransferError, ValueTransferRecord, WitnessedCash,
};

pub struct GiverCoordinator {
    party: PartyCoordinator,
}

impl GiverCoordinator {
    pub fn new(party: PartyCoordinator) -> Self {
        GiverCoordinator { party }
    }

    /// Offer `amount` to a getter
    ///
    /// Sent right away when the getter is known; otherwise the returned
    /// message is for out-of-band delivery.
    ///
    /// # Errors
    ///
    /// * `InvalidAmount` - If `amount` is not positive
    /// * `InsufficientFunds` - If the unreserved balance cannot cover `amount`
    /// * `Delivery` - If the offer could not be sent; nothing is persisted
    pub async fn offer_payment(
        &self,
        amount: Decimal,
        getter: Option<Did>,
        witness: Option<Did>,
        timeouts: Option<Timeouts>,
        hint: Option<TransportHint>,
    ) -> Result<(ValueTransferRecord, ProtocolMessage), ValueTransferError> {
        if amount <= Decimal::ZERO {
            return Err(ValueTransferError::InvalidAmount { amount });
        }
        let ctx = self.party.context();
        let available = ctx.wallet.snapshot().await.available_balance();
        if available < amount {
            return Err(ValueTransferError::insufficient_funds(available, amount));
        }

        let me = self.party.did().clone();
        let witness = witness.or_else(|| ctx.config.witness_did.clone());
        let timeouts = timeouts.unwrap_or_default();
        let id = TransactionId::generate();
        let guard = self.party.lock(&id).await;

        let offer = PaymentOffer {
            amount,
            unit_of_amount: ctx.config.unit_of_amount.clone(),
            giver: me.clone(),
            getter: getter.clone(),
            witness: witness.clone(),
            timeouts: timeouts.clone(),
        };
        let message = ProtocolMessage::new(id.clone(), MessageBody::Offer(offer));
        if let Some(getter) = &getter {
            self.party.send(getter, message.clone(), hint).await?;
        }

        let mut record = self
            .party
            .new_record(Role::Giver, id, TransactionState::OfferSent, amount);
        let tx = &mut record.transaction;
        tx.giver = Some(me);
        tx.getter = getter.clone();
        tx.witness = witness;
        tx.timeouts = timeouts;
        tx.second_party_did = getter.clone();
        tx.expected_recipient_did = getter;

        let record = self.party.create(&guard, record).await?;
        Ok((record, message))
    }

    /// Inbound `Request`
    ///
    /// A request for an unknown transaction is registered in
    /// `RequestReceived`; a request answering our own offer moves it to
    /// `RequestForOfferReceived`. Either is accepted right away when the
    /// matching auto-accept setting is on.
    ///
    /// # Errors
    ///
    /// `DidMismatch` without any record change when the request was not sent
    /// by its getter or names a different giver.
    pub async fn process_payment_request(
        &self,
        from: &Did,
        thid: &TransactionId,
        request: PaymentRequest,
    ) -> Result<ValueTransferRecord, ValueTransferError> {
        let me = self.party.did();
        if &request.getter != from {
            return Err(ValueTransferError::did_mismatch(thid, &request.getter, from));
        }
        if let Some(giver) = request.giver.as_ref().filter(|giver| *giver != me) {
            return Err(ValueTransferError::did_mismatch(thid, giver, me));
        }

        let config = &self.party.context().config;
        let guard = self.party.lock(thid).await;
        match self.party.find(&guard).await {
            None => {
                let record = self.register_request(&guard, request).await?;
                if config.auto_accept_payment_request.is_always() {
                    return self.accept_request_locked(&guard, thid, None).await;
                }
                Ok(record)
            }
            Some(record)
                if record.role == Role::Giver && record.state() == TransactionState::OfferSent =>
            {
                let outcome = self.answer_offer(&guard, record.clone(), from, request).await;
                let record = self.party.settle(&guard, record, outcome, Some(from)).await?;
                if record.state() == TransactionState::RequestForOfferReceived
                    && config.auto_accept_offered_payment_request.is_always()
                {
                    return self.accept_request_locked(&guard, thid, None).await;
                }
                Ok(record)
            }
            Some(record) => Ok(self.party.ignore(record, "request")),
        }
    }

    async fn register_request(
        &self,
        guard: &TransactionGuard,
        request: PaymentRequest,
    ) -> Result<ValueTransferRecord, ValueTransferError> {
        if request.amount <= Decimal::ZERO {
            return Err(ValueTransferError::InvalidAmount {
                amount: request.amount,
            });
        }

        let mut record = self.party.new_record(
            Role::Giver,
            guard.id().clone(),
            TransactionState::RequestReceived,
            request.amount,
        );
        let tx = &mut record.transaction;
        tx.unit_of_amount = request.unit_of_amount;
        tx.getter = Some(request.getter.clone());
        tx.giver = Some(self.party.did().clone());
        tx.witness = request
            .witness
            .or_else(|| self.party.context().config.witness_did.clone());
        tx.timeouts = request.timeouts;
        tx.second_party_did = Some(request.getter);

        self.party.create(guard, record).await
    }

    async fn answer_offer(
        &self,
        guard: &TransactionGuard,
        record: ValueTransferRecord,
        from: &Did,
        request: PaymentRequest,
    ) -> Result<ValueTransferRecord, ValueTransferError> {
        self.party
            .verify_sender(&record, from, record.transaction.getter.as_ref())?;
        if request.amount != record.transaction.amount {
            return Err(ValueTransferError::amount_mismatch(
                &record.id,
                record.transaction.amount,
                request.amount,
            ));
        }

        self.party
            .transition(
                guard,
                record,
                TransactionState::RequestForOfferReceived,
                |tx| {
                    tx.getter = Some(request.getter.clone());
                    tx.witness = request.witness.or(tx.witness.take());
                    tx.timeouts = request.timeouts;
                    tx.second_party_did = Some(request.getter);
                    tx.expected_recipient_did = None;
                },
            )
            .await
    }

    /// Check that a request can be answered with notes from the wallet
    pub async fn verify_request_can_be_accepted(
        &self,
        record: &ValueTransferRecord,
    ) -> Result<(), ValueTransferError> {
        if !matches!(
            record.state(),
            TransactionState::RequestReceived | TransactionState::RequestForOfferReceived
        ) {
            return Err(ValueTransferError::invalid_state(
                &record.id,
                record.state(),
                "accept request",
            ));
        }
        let tx = &record.transaction;
        if tx.getter.is_none() {
            return Err(ValueTransferError::missing_party(&record.id, "getter"));
        }
        if tx.witness.is_none() {
            return Err(ValueTransferError::missing_party(&record.id, "witness"));
        }
        if tx.timeouts.giver_expired(Utc::now()) {
            return Err(ValueTransferError::expired(&record.id, "giver"));
        }
        let available = self.party.context().wallet.snapshot().await.available_balance();
        if available < tx.amount {
            return Err(ValueTransferError::insufficient_funds(available, tx.amount));
        }
        Ok(())
    }

    /// Accept a received request
    ///
    /// # Arguments
    ///
    /// * `record_id` - Transaction in `RequestReceived` or `RequestForOfferReceived`
    /// * `timeouts` - A witness deadline here replaces the requested one
    pub async fn accept_request(
        &self,
        record_id: &TransactionId,
        timeouts: Option<Timeouts>,
    ) -> Result<ValueTransferRecord, ValueTransferError> {
        let guard = self.party.lock(record_id).await;
        self.accept_request_locked(&guard, record_id, timeouts).await
    }

    /// Accept a request while already holding its lock
    ///
    /// Selects and reserves notes, sends `RequestAccepted` to the witness and
    /// moves to `RequestAcceptedSent`. A delivery failure releases the notes
    /// and leaves the state unchanged.
    pub async fn accept_request_locked(
        &self,
        guard: &TransactionGuard,
        record_id: &TransactionId,
        timeouts: Option<Timeouts>,
    ) -> Result<ValueTransferRecord, ValueTransferError> {
        guard.ensure_for(record_id)?;
        let record = self.party.load(guard, "accept_request").await?;
        if !matches!(
            record.state(),
            TransactionState::RequestReceived | TransactionState::RequestForOfferReceived
        ) {
            return Err(ValueTransferError::invalid_state(
                &record.id,
                record.state(),
                "accept request",
            ));
        }

        let outcome = self.commit_notes(guard, record.clone(), timeouts).await;
        self.party.settle(guard, record, outcome, None).await
    }

    async fn commit_notes(
        &self,
        guard: &TransactionGuard,
        record: ValueTransferRecord,
        timeouts: Option<Timeouts>,
    ) -> Result<ValueTransferRecord, ValueTransferError> {
        self.verify_request_can_be_accepted(&record).await?;
        let ctx = self.party.context();
        let me = self.party.did().clone();
        let tx = &record.transaction;
        let id = record.id.clone();
        let amount = tx.amount;
        let getter = tx
            .getter
            .clone()
            .ok_or_else(|| ValueTransferError::missing_party(&id, "getter"))?;
        let witness = tx
            .witness
            .clone()
            .ok_or_else(|| ValueTransferError::missing_party(&id, "witness"))?;
        let mut negotiated = tx.timeouts.clone();
        if let Some(deadline) = timeouts.and_then(|t| t.witness) {
            negotiated.witness = Some(deadline);
        }

        let inputs = ctx
            .wallet
            .use_party_state(guard, |state| state.select_notes(amount, &id))
            .await?;
        let change = total_value(&inputs) - amount;
        let mut outputs = vec![Note::new(amount, getter.clone())];
        if change > Decimal::ZERO {
            outputs.push(Note::new(change, me.clone()));
        }

        let acceptance = RequestAcceptance {
            request: PaymentRequest {
                amount,
                unit_of_amount: tx.unit_of_amount.clone(),
                getter,
                giver: Some(me),
                witness: Some(witness.clone()),
                timeouts: negotiated.clone(),
            },
            inputs: inputs.clone(),
            outputs: outputs.clone(),
        };
        let message = ProtocolMessage::new(id.clone(), MessageBody::RequestAccepted(acceptance));
        if let Err(error) = self.party.send(&witness, message, None).await {
            ctx.wallet
                .use_party_state(guard, |state| {
                    state.release(&id);
                    Ok(())
                })
                .await?;
            return Err(error);
        }

        info!(thid = %id, inputs = inputs.len(), %change, "notes committed");
        self.party
            .transition(guard, record, TransactionState::RequestAcceptedSent, |tx| {
                tx.inputs = inputs;
                tx.outputs = outputs;
                tx.timeouts = negotiated;
                tx.expected_recipient_did = Some(witness);
            })
            .await
    }

    /// Inbound `CashAcceptedWitnessed` from the witness
    pub async fn process_cash_acceptance_witnessed(
        &self,
        from: &Did,
        thid: &TransactionId,
        witnessed: WitnessedCash,
    ) -> Result<ValueTransferRecord, ValueTransferError> {
        let guard = self.party.lock(thid).await;
        let record = self
            .party
            .load(&guard, "process_cash_acceptance_witnessed")
            .await?;
        if record.role != Role::Giver || record.state() != TransactionState::RequestAcceptedSent {
            return Ok(self.party.ignore(record, "cash-accepted-witnessed"));
        }

        let outcome = async {
            self.party
                .verify_sender(&record, from, record.transaction.witness.as_ref())?;
            if witnessed.amount != record.transaction.amount {
                return Err(ValueTransferError::amount_mismatch(
                    &record.id,
                    record.transaction.amount,
                    witnessed.amount,
                ));
            }
            self.party
                .transition(
                    &guard,
                    record.clone(),
                    TransactionState::CashAcceptedReceived,
                    |_| {},
                )
                .await
        }
        .await;
        self.party.settle(&guard, record, outcome, Some(from)).await
    }

    /// Inbound `CashRemoved` from the witness
    ///
    /// Removes the spent notes and credits the change. Idempotent with the
    /// receipt: whichever arrives first applies the wallet effect.
    pub async fn process_cash_removed(
        &self,
        from: &Did,
        thid: &TransactionId,
        removal: CashRemoval,
    ) -> Result<ValueTransferRecord, ValueTransferError> {
        let guard = self.party.lock(thid).await;
        let record = self.party.load(&guard, "process_cash_removed").await?;
        if record.role != Role::Giver
            || !matches!(
                record.state(),
                TransactionState::RequestAcceptedSent | TransactionState::CashAcceptedReceived
            )
        {
            return Ok(self.party.ignore(record, "cash-removed"));
        }

        let outcome = self
            .remove_cash(&guard, record.clone(), from, removal)
            .await;
        self.party.settle(&guard, record, outcome, Some(from)).await
    }

    async fn remove_cash(
        &self,
        guard: &TransactionGuard,
        record: ValueTransferRecord,
        from: &Did,
        removal: CashRemoval,
    ) -> Result<ValueTransferRecord, ValueTransferError> {
        let me = self.party.did().clone();
        self.party
            .verify_sender(&record, from, record.transaction.witness.as_ref())?;
        let inputs = &record.transaction.inputs;
        let unmatched = inputs
            .iter()
            .map(|n| &n.id)
            .find(|id| !removal.removed.contains(id))
            .or_else(|| removal.removed.iter().find(|id| !inputs.iter().any(|n| &n.id == *id)));
        if let Some(note) = unmatched {
            return Err(ValueTransferError::UnknownNote {
                note: note.clone(),
                owner: me,
            });
        }

        if !record.transaction.cash_settled {
            let change: Vec<Note> = removal
                .change
                .iter()
                .filter(|n| n.owner == me)
                .cloned()
                .collect();
            let removed = removal.removed.clone();
            self.party
                .context()
                .wallet
                .use_party_state(guard, |state| {
                    state.consume(&removed);
                    Ok(state.receive(&change))
                })
                .await?;
        }

        self.party
            .transition(guard, record, TransactionState::CashRemoved, |tx| {
                tx.cash_settled = true;
            })
            .await
    }

    /// Inbound `GiverReceipt`; settles the wallet if needed and completes
    pub async fn process_receipt(
        &self,
        from: &Did,
        thid: &TransactionId,
        receipt: Receipt,
    ) -> Result<ValueTransferRecord, ValueTransferError> {
        self.party
            .process_receipt(Role::Giver, from, thid, receipt)
            .await
    }
}
