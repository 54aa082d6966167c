//! Getter coordinator
//!
//! The getter receives value. It either opens a transaction with a payment
//! request or answers a giver's offer, then accepts the cash once the witness
//! has notarized the giver's acceptance.
//!
//! ```text
//! create_request ──► RequestSent ──(witnessed acceptance)──► RequestAcceptedReceived
//!                        ▲   │ counter-offer                      │ accept_cash
//!          accept_offer  │   ▼                                    ▼
//! process_offer ──► OfferReceived                          CashAcceptedSent ──(receipt)──► Completed
//! ```

use chrono::Utc;
use rust_decimal::Decimal;
use tracing::info;

use super::party::PartyCoordinator;
use crate::core::{TransactionGuard, TransportHint};
use crate::types::{
    check_notes, total_value, CashAcceptance, Did, MessageBody, PaymentOffer, PaymentRequest, ProtocolMessage,
    Receipt, Role, Timeouts, TransactionId, TransactionState, ValueTransferError,
    ValueTransferRecord, WitnessedAcceptance,
};

pub struct GetterCoordinator {
    party: PartyCoordinator,
}

impl GetterCoordinator {
    pub fn new(party: PartyCoordinator) -> Self {
        GetterCoordinator { party }
    }

    /// Open a transaction by asking for `amount`
    ///
    /// The request always goes to the witness. When the giver is known it is
    /// sent there too; otherwise the returned message is meant for
    /// out-of-band delivery (QR code, NFC) and the record waits for whoever
    /// answers.
    ///
    /// # Arguments
    ///
    /// * `amount` - Value requested, must be positive
    /// * `witness` - Witness to use; falls back to the configured default
    /// * `giver` - Giver to ask, if known
    /// * `timeouts` - Deadlines for the giver and witness stages
    /// * `hint` - Transport hint for the outbound request
    ///
    /// # Errors
    ///
    /// * `InvalidAmount` - If `amount` is not positive
    /// * `MissingParty` - If no witness is named or configured
    /// * `Delivery` - If the request could not be sent; nothing is persisted
    pub async fn create_request(
        &self,
        amount: Decimal,
        witness: Option<Did>,
        giver: Option<Did>,
        timeouts: Option<Timeouts>,
        hint: Option<TransportHint>,
    ) -> Result<(ValueTransferRecord, ProtocolMessage), ValueTransferError> {
        if amount <= Decimal::ZERO {
            return Err(ValueTransferError::InvalidAmount { amount });
        }
        let ctx = self.party.context();
        let me = self.party.did().clone();
        let id = TransactionId::generate();
        let witness = witness
            .or_else(|| ctx.config.witness_did.clone())
            .ok_or_else(|| ValueTransferError::missing_party(&id, "witness"))?;
        let timeouts = timeouts.unwrap_or_default();

        let guard = self.party.lock(&id).await;

        let request = PaymentRequest {
            amount,
            unit_of_amount: ctx.config.unit_of_amount.clone(),
            getter: me.clone(),
            giver: giver.clone(),
            witness: Some(witness.clone()),
            timeouts: timeouts.clone(),
        };
        let message = ProtocolMessage::new(id.clone(), MessageBody::Request(request));
        self.send_request(&message, &witness, giver.as_ref(), hint)
            .await?;

        let mut record = self
            .party
            .new_record(Role::Getter, id, TransactionState::RequestSent, amount);
        let tx = &mut record.transaction;
        tx.getter = Some(me);
        tx.giver = giver.clone();
        tx.witness = Some(witness.clone());
        tx.timeouts = timeouts;
        tx.second_party_did = giver;
        tx.expected_recipient_did = Some(witness);

        let record = self.party.create(&guard, record).await?;
        Ok((record, message))
    }

    /// Deliver a request to the witness, then to the giver when known
    ///
    /// The witness must have registered the transaction before the giver's
    /// acceptance reaches it.
    async fn send_request(
        &self,
        message: &ProtocolMessage,
        witness: &Did,
        giver: Option<&Did>,
        hint: Option<TransportHint>,
    ) -> Result<(), ValueTransferError> {
        self.party.send(witness, message.clone(), hint).await?;
        if let Some(giver) = giver {
            self.party.send(giver, message.clone(), hint).await?;
        }
        Ok(())
    }

    /// Inbound `Offer`
    ///
    /// Registers a new transaction in `OfferReceived`, or replaces the terms
    /// of an outstanding request (a counter-offer). Accepts the offer right
    /// away when `auto_accept_payment_offer` is set.
    pub async fn process_offer(
        &self,
        from: &Did,
        thid: &TransactionId,
        offer: PaymentOffer,
    ) -> Result<ValueTransferRecord, ValueTransferError> {
        let guard = self.party.lock(thid).await;
        let record = match self.party.find(&guard).await {
            None => self.register_offer(&guard, from, offer).await?,
            Some(record)
                if record.role == Role::Getter
                    && record.state() == TransactionState::RequestSent =>
            {
                let outcome = self.counter_offer(&guard, record.clone(), from, offer).await;
                self.party.settle(&guard, record, outcome, Some(from)).await?
            }
            Some(record) => return Ok(self.party.ignore(record, "offer")),
        };

        if record.state() == TransactionState::OfferReceived
            && self.party.context().config.auto_accept_payment_offer.is_always()
        {
            return self.accept_offer_locked(&guard, record, None, None).await;
        }
        Ok(record)
    }

    async fn register_offer(
        &self,
        guard: &TransactionGuard,
        from: &Did,
        offer: PaymentOffer,
    ) -> Result<ValueTransferRecord, ValueTransferError> {
        let me = self.party.did().clone();
        if &offer.giver != from {
            return Err(ValueTransferError::did_mismatch(guard.id(), &offer.giver, from));
        }
        if let Some(getter) = &offer.getter {
            if getter != &me {
                return Err(ValueTransferError::did_mismatch(guard.id(), getter, &me));
            }
        }
        if offer.amount <= Decimal::ZERO {
            return Err(ValueTransferError::InvalidAmount {
                amount: offer.amount,
            });
        }

        let mut record = self.party.new_record(
            Role::Getter,
            guard.id().clone(),
            TransactionState::OfferReceived,
            offer.amount,
        );
        let tx = &mut record.transaction;
        tx.unit_of_amount = offer.unit_of_amount;
        tx.getter = Some(me);
        tx.giver = Some(offer.giver.clone());
        tx.witness = offer
            .witness
            .or_else(|| self.party.context().config.witness_did.clone());
        tx.timeouts = offer.timeouts;
        tx.second_party_did = Some(offer.giver.clone());
        tx.expected_recipient_did = Some(offer.giver);

        self.party.create(guard, record).await
    }

    async fn counter_offer(
        &self,
        guard: &TransactionGuard,
        record: ValueTransferRecord,
        from: &Did,
        offer: PaymentOffer,
    ) -> Result<ValueTransferRecord, ValueTransferError> {
        self.party
            .verify_sender(&record, from, record.transaction.giver.as_ref())?;
        self.party.verify_sender(&record, from, Some(&offer.giver))?;
        if offer.amount <= Decimal::ZERO {
            return Err(ValueTransferError::amount_mismatch(
                &record.id,
                record.transaction.amount,
                offer.amount,
            ));
        }

        info!(thid = %record.id, requested = %record.transaction.amount, offered = %offer.amount, "counter-offer received");
        self.party
            .transition(guard, record, TransactionState::OfferReceived, |tx| {
                tx.amount = offer.amount;
                tx.giver = Some(offer.giver.clone());
                tx.witness = offer.witness.or(tx.witness.take());
                tx.timeouts = offer.timeouts;
                tx.second_party_did = Some(offer.giver.clone());
                tx.expected_recipient_did = Some(offer.giver);
            })
            .await
    }

    /// Check that an offer can be answered with a request
    pub fn verify_offer_can_be_accepted(
        &self,
        record: &ValueTransferRecord,
    ) -> Result<(), ValueTransferError> {
        if record.state() != TransactionState::OfferReceived {
            return Err(ValueTransferError::invalid_state(
                &record.id,
                record.state(),
                "accept offer",
            ));
        }
        if record.transaction.giver.is_none() {
            return Err(ValueTransferError::missing_party(&record.id, "giver"));
        }
        if record.transaction.timeouts.giver_expired(Utc::now()) {
            return Err(ValueTransferError::expired(&record.id, "giver"));
        }
        Ok(())
    }

    /// Accept a received offer by sending a request back to the giver
    ///
    /// # Arguments
    ///
    /// * `record_id` - Transaction in `OfferReceived`
    /// * `witness` - Overrides the witness named in the offer
    /// * `timeouts` - Overrides the deadlines named in the offer
    ///
    /// # Errors
    ///
    /// * `InvalidState` - If the transaction is not in `OfferReceived`
    /// * `Delivery` - If the request could not be sent; the state is unchanged
    pub async fn accept_offer(
        &self,
        record_id: &TransactionId,
        witness: Option<Did>,
        timeouts: Option<Timeouts>,
    ) -> Result<ValueTransferRecord, ValueTransferError> {
        let guard = self.party.lock(record_id).await;
        let record = self.party.load(&guard, "accept_offer").await?;
        self.accept_offer_locked(&guard, record, witness, timeouts)
            .await
    }

    async fn accept_offer_locked(
        &self,
        guard: &TransactionGuard,
        record: ValueTransferRecord,
        witness: Option<Did>,
        timeouts: Option<Timeouts>,
    ) -> Result<ValueTransferRecord, ValueTransferError> {
        if record.state() != TransactionState::OfferReceived {
            return Err(ValueTransferError::invalid_state(
                &record.id,
                record.state(),
                "accept offer",
            ));
        }
        let outcome = self
            .send_request_for_offer(guard, record.clone(), witness, timeouts)
            .await;
        self.party.settle(guard, record, outcome, None).await
    }

    async fn send_request_for_offer(
        &self,
        guard: &TransactionGuard,
        record: ValueTransferRecord,
        witness: Option<Did>,
        timeouts: Option<Timeouts>,
    ) -> Result<ValueTransferRecord, ValueTransferError> {
        self.verify_offer_can_be_accepted(&record)?;
        let tx = &record.transaction;
        let giver = tx
            .giver
            .clone()
            .ok_or_else(|| ValueTransferError::missing_party(&record.id, "giver"))?;
        let witness = witness
            .or_else(|| tx.witness.clone())
            .or_else(|| self.party.context().config.witness_did.clone())
            .ok_or_else(|| ValueTransferError::missing_party(&record.id, "witness"))?;
        let timeouts = timeouts.unwrap_or_else(|| tx.timeouts.clone());

        let request = PaymentRequest {
            amount: tx.amount,
            unit_of_amount: tx.unit_of_amount.clone(),
            getter: self.party.did().clone(),
            giver: Some(giver.clone()),
            witness: Some(witness.clone()),
            timeouts: timeouts.clone(),
        };
        let message = ProtocolMessage::new(record.id.clone(), MessageBody::Request(request));
        self.send_request(&message, &witness, Some(&giver), None)
            .await?;

        self.party
            .transition(guard, record, TransactionState::RequestSent, |tx| {
                tx.witness = Some(witness.clone());
                tx.timeouts = timeouts;
                tx.expected_recipient_did = Some(witness);
            })
            .await
    }

    /// Inbound `RequestAcceptedWitnessed` from the witness
    ///
    /// Checks the notarized terms against the request, then accepts the cash.
    pub async fn process_request_acceptance_witnessed(
        &self,
        from: &Did,
        thid: &TransactionId,
        acceptance: WitnessedAcceptance,
    ) -> Result<ValueTransferRecord, ValueTransferError> {
        let guard = self.party.lock(thid).await;
        let record = self
            .party
            .load(&guard, "process_request_acceptance_witnessed")
            .await?;
        if record.role != Role::Getter || record.state() != TransactionState::RequestSent {
            return Ok(self.party.ignore(record, "request-accepted-witnessed"));
        }

        let outcome = self
            .receive_witnessed_acceptance(&guard, record.clone(), from, acceptance)
            .await;
        let record = self.party.settle(&guard, record, outcome, Some(from)).await?;
        if record.state() != TransactionState::RequestAcceptedReceived {
            return Ok(record);
        }
        self.accept_cash_locked(&guard, record).await
    }

    async fn receive_witnessed_acceptance(
        &self,
        guard: &TransactionGuard,
        record: ValueTransferRecord,
        from: &Did,
        acceptance: WitnessedAcceptance,
    ) -> Result<ValueTransferRecord, ValueTransferError> {
        let tx = &record.transaction;
        self.party.verify_sender(&record, from, tx.witness.as_ref())?;
        self.party
            .verify_sender(&record, from, Some(&acceptance.witness))?;
        self.party
            .verify_sender(&record, &acceptance.giver, tx.giver.as_ref())?;
        if acceptance.amount != tx.amount {
            return Err(ValueTransferError::amount_mismatch(
                &record.id,
                tx.amount,
                acceptance.amount,
            ));
        }
        check_notes(&record.id, &acceptance.outputs)?;
        let me = self.party.did();
        let mine: Vec<_> = acceptance
            .outputs
            .iter()
            .filter(|n| &n.owner == me)
            .cloned()
            .collect();
        if total_value(&mine) != tx.amount {
            return Err(ValueTransferError::amount_mismatch(
                &record.id,
                tx.amount,
                total_value(&mine),
            ));
        }

        self.party
            .transition(
                guard,
                record,
                TransactionState::RequestAcceptedReceived,
                |tx| {
                    tx.witness = Some(acceptance.witness.clone());
                    tx.giver = Some(acceptance.giver);
                    tx.outputs = acceptance.outputs;
                    tx.expected_recipient_did = Some(acceptance.witness);
                },
            )
            .await
    }

    /// Accept the notarized cash, sending `CashAccepted` to the witness
    ///
    /// Runs automatically after a witnessed acceptance; callable again after
    /// a delivery failure left the transaction in `RequestAcceptedReceived`.
    pub async fn accept_cash(
        &self,
        record_id: &TransactionId,
    ) -> Result<ValueTransferRecord, ValueTransferError> {
        let guard = self.party.lock(record_id).await;
        let record = self.party.load(&guard, "accept_cash").await?;
        if record.state() != TransactionState::RequestAcceptedReceived {
            return Err(ValueTransferError::invalid_state(
                &record.id,
                record.state(),
                "accept cash",
            ));
        }
        self.accept_cash_locked(&guard, record).await
    }

    async fn accept_cash_locked(
        &self,
        guard: &TransactionGuard,
        record: ValueTransferRecord,
    ) -> Result<ValueTransferRecord, ValueTransferError> {
        let outcome = self.send_cash_acceptance(guard, record.clone()).await;
        self.party.settle(guard, record, outcome, None).await
    }

    async fn send_cash_acceptance(
        &self,
        guard: &TransactionGuard,
        record: ValueTransferRecord,
    ) -> Result<ValueTransferRecord, ValueTransferError> {
        let witness = record
            .transaction
            .witness
            .clone()
            .ok_or_else(|| ValueTransferError::missing_party(&record.id, "witness"))?;
        let now = Utc::now();
        if record.transaction.timeouts.witness_expired(now) {
            return Err(ValueTransferError::expired(&record.id, "witness"));
        }

        let acceptance = CashAcceptance {
            amount: record.transaction.amount,
            accepted_at: now,
        };
        self.party
            .send(
                &witness,
                ProtocolMessage::new(record.id.clone(), MessageBody::CashAccepted(acceptance)),
                None,
            )
            .await?;

        self.party
            .transition(guard, record, TransactionState::CashAcceptedSent, |_| {})
            .await
    }

    /// Inbound `GetterReceipt`; credits the received notes and completes
    pub async fn process_receipt(
        &self,
        from: &Did,
        thid: &TransactionId,
        receipt: Receipt,
    ) -> Result<ValueTransferRecord, ValueTransferError> {
        self.party
            .process_receipt(Role::Getter, from, thid, receipt)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use crate::config::{AgentConfig, AutoAccept};
    use crate::core::{Envelope, InMemoryNetwork};
    use crate::roles::party::test_support::context;
    use crate::types::{codes, Note};
    use std::sync::Arc;
    use tokio::sync::mpsc::UnboundedReceiver;
    use TransactionState::*;

    struct Fixture {
        network: Arc<InMemoryNetwork>,
        getter: GetterCoordinator,
        giver: Did,
        witness: Did,
        witness_inbox: UnboundedReceiver<Envelope>,
    }

    fn fixture(config: AgentConfig) -> Fixture {
        let network = InMemoryNetwork::new();
        let witness = Did::from("did:peer:witness");
        let witness_inbox = network.register(&witness);
        let getter = GetterCoordinator::new(PartyCoordinator::new(context(&network, config, &[])));
        Fixture {
            network,
            getter,
            giver: Did::from("did:peer:giver"),
            witness,
            witness_inbox,
        }
    }

    fn witnessed(f: &Fixture, amount: i64) -> WitnessedAcceptance {
        WitnessedAcceptance {
            amount: Decimal::new(amount, 0),
            giver: f.giver.clone(),
            witness: f.witness.clone(),
            outputs: vec![Note::new(Decimal::new(amount, 0), f.getter.party.did().clone())],
        }
    }

    #[tokio::test]
    async fn test_create_request_sends_to_witness_and_giver() {
        let mut f = fixture(AgentConfig::new("did:peer:getter").with_witness("did:peer:witness"));
        let mut giver_inbox = f.network.register(&f.giver);

        let (record, message) = f
            .getter
            .create_request(Decimal::TEN, None, Some(f.giver.clone()), None, None)
            .await
            .unwrap();

        assert_eq!(record.state(), RequestSent);
        assert_eq!(record.transaction.witness, Some(f.witness.clone()));
        assert_eq!(record.transaction.expected_recipient_did, Some(f.witness.clone()));
        let (from, delivered) = giver_inbox.recv().await.unwrap();
        assert_eq!(&from, f.getter.party.did());
        assert_eq!(delivered, message);
        let (_, witnessed) = f.witness_inbox.recv().await.unwrap();
        assert_eq!(witnessed, message);
    }

    #[tokio::test]
    async fn test_create_request_delivery_failure_persists_nothing() {
        let f = fixture(AgentConfig::new("did:peer:getter").with_witness("did:peer:witness"));

        let result = f
            .getter
            .create_request(Decimal::TEN, None, Some(f.giver.clone()), None, None)
            .await;

        assert!(matches!(result, Err(ValueTransferError::Delivery(_))));
        assert!(f.getter.party.context().repository.list().await.is_empty());
    }

    #[tokio::test]
    async fn test_create_request_rejects_non_positive_amount() {
        let f = fixture(AgentConfig::new("did:peer:getter"));
        let result = f
            .getter
            .create_request(Decimal::ZERO, None, None, None, None)
            .await;
        assert!(matches!(result, Err(ValueTransferError::InvalidAmount { .. })));
    }

    #[tokio::test]
    async fn test_create_request_requires_witness() {
        let f = fixture(AgentConfig::new("did:peer:getter"));
        let _giver_inbox = f.network.register(&f.giver);

        let result = f
            .getter
            .create_request(Decimal::TEN, None, Some(f.giver.clone()), None, None)
            .await;

        assert!(matches!(result, Err(ValueTransferError::MissingParty { .. })));
        assert!(f.getter.party.context().repository.list().await.is_empty());
    }

    #[tokio::test]
    async fn test_offer_registered_then_accepted() {
        let f = fixture(AgentConfig::new("did:peer:getter").with_witness("did:peer:witness"));
        let mut giver_inbox = f.network.register(&f.giver);
        let thid = TransactionId::generate();
        let offer = PaymentOffer {
            amount: Decimal::new(3, 0),
            unit_of_amount: "credit".to_string(),
            giver: f.giver.clone(),
            getter: None,
            witness: None,
            timeouts: Timeouts::default(),
        };

        let record = f.getter.process_offer(&f.giver, &thid, offer).await.unwrap();
        assert_eq!(record.state(), OfferReceived);

        let accepted = f.getter.accept_offer(&thid, None, None).await.unwrap();
        assert_eq!(accepted.state(), RequestSent);
        let (_, message) = giver_inbox.recv().await.unwrap();
        match message.body {
            MessageBody::Request(request) => {
                assert_eq!(request.amount, Decimal::new(3, 0));
                assert_eq!(request.witness, Some(f.witness.clone()));
            }
            other => panic!("Expected request, got {:?}", other),
        }

        let again = f.getter.accept_offer(&thid, None, None).await;
        assert!(matches!(again, Err(ValueTransferError::InvalidState { .. })));
    }

    #[tokio::test]
    async fn test_offer_auto_accepted() {
        let config = AgentConfig {
            auto_accept_payment_offer: AutoAccept::Always,
            ..AgentConfig::new("did:peer:getter").with_witness("did:peer:witness")
        };
        let f = fixture(config);
        let _giver_inbox = f.network.register(&f.giver);
        let offer = PaymentOffer {
            amount: Decimal::ONE,
            unit_of_amount: "credit".to_string(),
            giver: f.giver.clone(),
            getter: Some(f.getter.party.did().clone()),
            witness: None,
            timeouts: Timeouts::default(),
        };

        let record = f
            .getter
            .process_offer(&f.giver, &TransactionId::generate(), offer)
            .await
            .unwrap();

        assert_eq!(record.state(), RequestSent);
    }

    #[tokio::test]
    async fn test_counter_offer_replaces_terms() {
        let f = fixture(AgentConfig::new("did:peer:getter").with_witness("did:peer:witness"));
        let _giver_inbox = f.network.register(&f.giver);
        let (record, _) = f
            .getter
            .create_request(Decimal::TEN, None, Some(f.giver.clone()), None, None)
            .await
            .unwrap();

        let offer = PaymentOffer {
            amount: Decimal::new(8, 0),
            unit_of_amount: "credit".to_string(),
            giver: f.giver.clone(),
            getter: None,
            witness: None,
            timeouts: Timeouts::default(),
        };
        let countered = f.getter.process_offer(&f.giver, &record.id, offer).await.unwrap();

        assert_eq!(countered.state(), OfferReceived);
        assert_eq!(countered.transaction.amount, Decimal::new(8, 0));
        assert_eq!(countered.transaction.witness, Some(f.witness.clone()));
    }

    #[tokio::test]
    async fn test_witnessed_acceptance_sends_cash_acceptance() {
        let mut f = fixture(AgentConfig::new("did:peer:getter").with_witness("did:peer:witness"));
        let _giver_inbox = f.network.register(&f.giver);
        let (record, _) = f
            .getter
            .create_request(Decimal::TEN, None, Some(f.giver.clone()), None, None)
            .await
            .unwrap();

        let updated = f
            .getter
            .process_request_acceptance_witnessed(&f.witness, &record.id, witnessed(&f, 10))
            .await
            .unwrap();

        assert_eq!(updated.state(), CashAcceptedSent);
        let (_, request) = f.witness_inbox.recv().await.unwrap();
        assert!(matches!(request.body, MessageBody::Request(_)));
        let (_, message) = f.witness_inbox.recv().await.unwrap();
        assert!(matches!(message.body, MessageBody::CashAccepted(c) if c.amount == Decimal::TEN));

        let duplicate = f
            .getter
            .process_request_acceptance_witnessed(&f.witness, &record.id, witnessed(&f, 10))
            .await
            .unwrap();
        assert_eq!(duplicate.state(), CashAcceptedSent);
    }

    #[tokio::test]
    async fn test_witnessed_acceptance_from_impostor_fails() {
        let f = fixture(AgentConfig::new("did:peer:getter").with_witness("did:peer:witness"));
        let _giver_inbox = f.network.register(&f.giver);
        let mallory = Did::from("did:peer:mallory");
        let mut mallory_inbox = f.network.register(&mallory);
        let (record, _) = f
            .getter
            .create_request(Decimal::TEN, None, Some(f.giver.clone()), None, None)
            .await
            .unwrap();

        let failed = f
            .getter
            .process_request_acceptance_witnessed(&mallory, &record.id, witnessed(&f, 10))
            .await
            .unwrap();

        assert_eq!(failed.state(), Failed);
        assert_eq!(failed.transaction.error.unwrap().code, codes::DID_MISMATCH);
        let (_, report) = mallory_inbox.recv().await.unwrap();
        assert!(matches!(report.body, MessageBody::ProblemReport(_)));
    }

    #[tokio::test]
    async fn test_witnessed_acceptance_with_short_outputs_fails() {
        let f = fixture(AgentConfig::new("did:peer:getter").with_witness("did:peer:witness"));
        let _giver_inbox = f.network.register(&f.giver);
        let (record, _) = f
            .getter
            .create_request(Decimal::TEN, None, Some(f.giver.clone()), None, None)
            .await
            .unwrap();
        let mut acceptance = witnessed(&f, 10);
        acceptance.outputs[0].value = Decimal::new(9, 0);

        let failed = f
            .getter
            .process_request_acceptance_witnessed(&f.witness, &record.id, acceptance)
            .await
            .unwrap();

        assert_eq!(failed.state(), Failed);
        assert_eq!(failed.transaction.error.unwrap().code, codes::AMOUNT_MISMATCH);
    }

    #[rstest]
    #[case::negative_change(vec![(10, true), (-5, false)])]
    #[case::zero_note(vec![(10, true), (0, true)])]
    #[tokio::test]
    async fn test_witnessed_acceptance_with_invalid_note_fails(#[case] outputs: Vec<(i64, bool)>) {
        let f = fixture(AgentConfig::new("did:peer:getter").with_witness("did:peer:witness"));
        let _giver_inbox = f.network.register(&f.giver);
        let (record, _) = f
            .getter
            .create_request(Decimal::TEN, None, Some(f.giver.clone()), None, None)
            .await
            .unwrap();
        let mut acceptance = witnessed(&f, 10);
        acceptance.outputs = outputs
            .into_iter()
            .map(|(value, to_getter)| {
                let owner = if to_getter { f.getter.party.did() } else { &f.giver };
                Note::new(Decimal::new(value, 0), owner.clone())
            })
            .collect();

        let failed = f
            .getter
            .process_request_acceptance_witnessed(&f.witness, &record.id, acceptance)
            .await
            .unwrap();

        assert_eq!(failed.state(), Failed);
        assert_eq!(failed.transaction.error.unwrap().code, codes::INVALID_AMOUNT);
    }

    #[tokio::test]
    async fn test_witnessed_acceptance_with_repeated_note_fails() {
        let f = fixture(AgentConfig::new("did:peer:getter").with_witness("did:peer:witness"));
        let _giver_inbox = f.network.register(&f.giver);
        let (record, _) = f
            .getter
            .create_request(Decimal::TEN, None, Some(f.giver.clone()), None, None)
            .await
            .unwrap();
        let half = Note::new(Decimal::new(5, 0), f.getter.party.did().clone());
        let mut acceptance = witnessed(&f, 10);
        acceptance.outputs = vec![half.clone(), half];

        let failed = f
            .getter
            .process_request_acceptance_witnessed(&f.witness, &record.id, acceptance)
            .await
            .unwrap();

        assert_eq!(failed.state(), Failed);
        assert_eq!(failed.transaction.error.unwrap().code, codes::DUPLICATE_NOTE);
        assert_eq!(f.getter.party.context().wallet.balance().await, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_unknown_transaction_is_dropped() {
        let f = fixture(AgentConfig::new("did:peer:getter"));
        let result = f
            .getter
            .process_request_acceptance_witnessed(&f.witness, &TransactionId::generate(), witnessed(&f, 1))
            .await;
        assert!(matches!(result, Err(ValueTransferError::TransactionNotFound { .. })));
    }
}
