//! Issuer coordinator
//!
//! Mints new notes for the local agent through a witness. The caller either
//! waits for the witness to confirm (bounded by a timeout) or credits the
//! notes immediately.

use std::time::Duration;

use rust_decimal::Decimal;
use tracing::{info, warn};

use super::party::PartyCoordinator;
use crate::core::{TransactionGuard, TransferEvent};
use crate::types::{
    Did, MessageBody, MintRequest, MintResponse, Note, ProtocolMessage, Role, TransactionId,
    TransactionState, ValueTransferError, ValueTransferRecord,
};

pub struct IssuerCoordinator {
    party: PartyCoordinator,
}

impl IssuerCoordinator {
    pub fn new(party: PartyCoordinator) -> Self {
        IssuerCoordinator { party }
    }

    /// Mint `amount` into the local wallet
    ///
    /// # Arguments
    ///
    /// * `amount` - Value to mint, must be positive
    /// * `witness` - Witness recording the mint; falls back to the configured default
    /// * `send` - Send the `Mint` message; when false it is only returned
    /// * `await_response` - Wait for the witness's `MintResponse` before
    ///   returning; when false the notes are credited right away
    /// * `timeout` - Bound on the wait; defaults to the configured mint wait
    ///
    /// # Returns
    ///
    /// The record and the `Mint` message. A wait that times out is logged and
    /// returns the record still in `RequestSent`; the wallet is unchanged until
    /// the confirmation arrives.
    ///
    /// # Errors
    ///
    /// * `InvalidAmount` - If `amount` is not positive
    /// * `MissingParty` - If no witness is named or configured
    /// * `Delivery` - If the mint could not be sent; nothing is persisted
    pub async fn mint_cash(
        &self,
        amount: Decimal,
        witness: Option<Did>,
        send: bool,
        await_response: bool,
        timeout: Option<Duration>,
    ) -> Result<(ValueTransferRecord, ProtocolMessage), ValueTransferError> {
        if amount <= Decimal::ZERO {
            return Err(ValueTransferError::InvalidAmount { amount });
        }
        let ctx = self.party.context();
        let id = TransactionId::generate();
        let witness = witness
            .or_else(|| ctx.config.witness_did.clone())
            .ok_or_else(|| ValueTransferError::missing_party(&id, "witness"))?;
        let me = self.party.did().clone();
        let notes = vec![Note::new(amount, me.clone())];

        let guard = self.party.lock(&id).await;
        let mint = MintRequest {
            amount,
            unit_of_amount: ctx.config.unit_of_amount.clone(),
            issuer: me.clone(),
            notes: notes.clone(),
        };
        let message = ProtocolMessage::new(id.clone(), MessageBody::Mint(mint));

        // Subscribe before sending so the confirmation cannot be missed.
        let events = ctx.events.subscribe();
        if send {
            self.party.send(&witness, message.clone(), None).await?;
        }

        let mut record = self
            .party
            .new_record(Role::Issuer, id.clone(), TransactionState::RequestSent, amount);
        let tx = &mut record.transaction;
        tx.getter = Some(me);
        tx.witness = Some(witness.clone());
        tx.outputs = notes;
        tx.second_party_did = Some(witness.clone());
        tx.expected_recipient_did = Some(witness);
        let record = self.party.create(&guard, record).await?;

        if !await_response {
            let record = self.credit(&guard, record).await?;
            return Ok((record, message));
        }
        if !send {
            return Ok((record, message));
        }

        drop(guard);
        let wait = timeout.unwrap_or_else(|| ctx.config.mint_wait());
        match ctx.events.wait_for_mint(events, &id, wait).await {
            Ok(()) => {
                let record = ctx
                    .repository
                    .get(&id)
                    .await
                    .ok_or_else(|| ValueTransferError::transaction_not_found(&id, "mint_cash"))?;
                Ok((record, message))
            }
            Err(error) => {
                warn!(thid = %id, %error, "mint not confirmed by witness");
                Ok((record, message))
            }
        }
    }

    /// Inbound `MintResponse` from the witness
    pub async fn process_cash_mint_response(
        &self,
        from: &Did,
        thid: &TransactionId,
        response: MintResponse,
    ) -> Result<ValueTransferRecord, ValueTransferError> {
        let guard = self.party.lock(thid).await;
        let record = self
            .party
            .load(&guard, "process_cash_mint_response")
            .await?;
        if record.role != Role::Issuer || record.state() != TransactionState::RequestSent {
            return Ok(self.party.ignore(record, "mint-response"));
        }

        let outcome = async {
            self.party
                .verify_sender(&record, from, record.transaction.witness.as_ref())?;
            let minted = &record.transaction.outputs;
            let unmatched = minted
                .iter()
                .find(|n| !response.note_ids.contains(&n.id))
                .map(|n| n.id.clone())
                .or_else(|| {
                    response
                        .note_ids
                        .iter()
                        .find(|id| !minted.iter().any(|n| &n.id == *id))
                        .cloned()
                });
            if let Some(note) = unmatched {
                return Err(ValueTransferError::UnknownNote {
                    note,
                    owner: self.party.did().clone(),
                });
            }
            self.credit(&guard, record.clone()).await
        }
        .await;
        self.party.settle(&guard, record, outcome, Some(from)).await
    }

    /// Add the minted notes to the wallet and complete
    async fn credit(
        &self,
        guard: &TransactionGuard,
        record: ValueTransferRecord,
    ) -> Result<ValueTransferRecord, ValueTransferError> {
        let ctx = self.party.context();
        let notes = record.transaction.outputs.clone();
        let credited = ctx
            .wallet
            .use_party_state(guard, |state| Ok(state.receive(&notes)))
            .await?;

        let record = self
            .party
            .transition(guard, record, TransactionState::Completed, |tx| {
                tx.cash_settled = true;
                tx.expected_recipient_did = None;
            })
            .await?;
        info!(thid = %record.id, %credited, "cash minted");
        ctx.events.publish(TransferEvent::CashMinted {
            thid: record.id.clone(),
        });
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentConfig;
    use crate::core::InMemoryNetwork;
    use crate::roles::party::test_support::context;
    use crate::types::codes;
    use std::sync::Arc;

    fn issuer(network: &Arc<InMemoryNetwork>) -> Arc<IssuerCoordinator> {
        let config = AgentConfig::new("did:peer:issuer").with_witness("did:peer:witness");
        Arc::new(IssuerCoordinator::new(PartyCoordinator::new(context(
            network, config, &[],
        ))))
    }

    fn note_ids(message: &ProtocolMessage) -> Vec<String> {
        match &message.body {
            MessageBody::Mint(mint) => mint.notes.iter().map(|n| n.id.clone()).collect(),
            other => panic!("Expected mint, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_mint_without_waiting_credits_immediately() {
        let network = InMemoryNetwork::new();
        let mut witness_inbox = network.register(&Did::from("did:peer:witness"));
        let issuer = issuer(&network);

        let (record, message) = issuer
            .mint_cash(Decimal::new(50, 0), None, true, false, None)
            .await
            .unwrap();

        assert_eq!(record.state(), TransactionState::Completed);
        assert_eq!(issuer.party.context().wallet.balance().await, Decimal::new(50, 0));
        let (_, sent) = witness_inbox.recv().await.unwrap();
        assert_eq!(sent, message);
    }

    #[tokio::test]
    async fn test_mint_wait_times_out_without_failing() {
        let network = InMemoryNetwork::new();
        let _witness_inbox = network.register(&Did::from("did:peer:witness"));
        let issuer = issuer(&network);

        let (record, _) = issuer
            .mint_cash(
                Decimal::TEN,
                None,
                true,
                true,
                Some(Duration::from_millis(20)),
            )
            .await
            .unwrap();

        assert_eq!(record.state(), TransactionState::RequestSent);
        assert_eq!(issuer.party.context().wallet.balance().await, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_mint_waits_for_confirmation() {
        let network = InMemoryNetwork::new();
        let witness = Did::from("did:peer:witness");
        let mut witness_inbox = network.register(&witness);
        let issuer = issuer(&network);

        let responder = {
            let issuer = Arc::clone(&issuer);
            tokio::spawn(async move {
                let (_, mint) = witness_inbox.recv().await.unwrap();
                let response = MintResponse {
                    note_ids: note_ids(&mint),
                };
                issuer
                    .process_cash_mint_response(&witness, &mint.thid, response)
                    .await
                    .unwrap()
            })
        };

        let (record, _) = issuer
            .mint_cash(Decimal::TEN, None, true, true, Some(Duration::from_secs(5)))
            .await
            .unwrap();

        assert_eq!(record.state(), TransactionState::Completed);
        assert_eq!(responder.await.unwrap().state(), TransactionState::Completed);
        assert_eq!(issuer.party.context().wallet.balance().await, Decimal::TEN);
    }

    #[tokio::test]
    async fn test_mint_response_from_impostor_fails() {
        let network = InMemoryNetwork::new();
        let _witness_inbox = network.register(&Did::from("did:peer:witness"));
        let issuer = issuer(&network);
        let (record, message) = issuer
            .mint_cash(Decimal::TEN, None, false, true, None)
            .await
            .unwrap();
        assert_eq!(record.state(), TransactionState::RequestSent);

        let response = MintResponse {
            note_ids: note_ids(&message),
        };
        let failed = issuer
            .process_cash_mint_response(&Did::from("did:peer:mallory"), &record.id, response)
            .await
            .unwrap();

        assert_eq!(failed.state(), TransactionState::Failed);
        assert_eq!(failed.transaction.error.unwrap().code, codes::DID_MISMATCH);
        assert_eq!(issuer.party.context().wallet.balance().await, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_mint_requires_witness() {
        let network = InMemoryNetwork::new();
        let config = AgentConfig::new("did:peer:issuer");
        let issuer = IssuerCoordinator::new(PartyCoordinator::new(context(&network, config, &[])));

        let result = issuer
            .mint_cash(Decimal::ONE, None, true, true, None)
            .await;
        assert!(matches!(result, Err(ValueTransferError::MissingParty { .. })));
    }
}
