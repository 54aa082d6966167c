//! Shared coordinator mechanics
//!
//! Every role coordinator follows the same sequence for a step of the
//! protocol: take the transaction lock, load the record, check the state
//! precondition and the sender, apply the change, persist, publish. This
//! module holds that sequence once; the role modules only decide which state
//! comes next and which messages go out.
//!
//! # Outcomes
//!
//! - Validation errors (DID mismatch, amount mismatch, expired deadline,
//!   unknown note) move the transaction to `Failed` and notify the known
//!   participants with a `ProblemReport`. The failed record is returned.
//! - Delivery errors are returned to the caller and nothing is persisted, so
//!   the transaction stays in its pre-send state.
//! - An inbound message whose state precondition does not hold (duplicate,
//!   late or out of order) is logged and ignored.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::config::AgentConfig;
use crate::core::{
    EventBus, LockManager, PartyStateStore, TransactionGuard, TransactionRepository,
    TransportAdapter, TransportChannel, TransportHint,
};
use crate::types::{
    codes, total_value, Did, ProblemError, ProblemReport, ProtocolMessage, Receipt, Role,
    Transaction, TransactionId, TransactionState, ValueTransferError, ValueTransferRecord,
};

/// Everything a coordinator needs, shared by all roles of one agent
pub struct CoordinatorContext {
    pub config: AgentConfig,
    pub repository: Arc<dyn TransactionRepository>,

    /// The agent's own wallet
    pub wallet: Arc<PartyStateStore>,

    /// Notes notarized by this agent when it acts as a witness
    pub ledger: Arc<PartyStateStore>,

    pub locks: LockManager,
    pub events: Arc<EventBus>,
    pub transport: Arc<TransportAdapter>,
}

impl CoordinatorContext {
    pub fn new(
        config: AgentConfig,
        channel: Arc<dyn TransportChannel>,
        repository: Arc<dyn TransactionRepository>,
        wallet: PartyStateStore,
    ) -> Self {
        let events = Arc::new(EventBus::new(
            Arc::clone(&repository),
            config.event_capacity,
        ));
        let transport = Arc::new(TransportAdapter::new(channel, config.default_transport));
        CoordinatorContext {
            locks: LockManager::new(config.lock_transactions),
            wallet: Arc::new(wallet),
            ledger: Arc::new(PartyStateStore::new()),
            events,
            transport,
            repository,
            config,
        }
    }

    /// DID of the local agent
    pub fn did(&self) -> &Did {
        &self.config.did
    }
}

/// Protocol mechanics shared by the getter, giver, witness and issuer
#[derive(Clone)]
pub struct PartyCoordinator {
    ctx: Arc<CoordinatorContext>,
}

impl PartyCoordinator {
    pub fn new(ctx: Arc<CoordinatorContext>) -> Self {
        PartyCoordinator { ctx }
    }

    pub fn context(&self) -> &CoordinatorContext {
        &self.ctx
    }

    pub fn did(&self) -> &Did {
        self.ctx.did()
    }

    pub(crate) async fn lock(&self, id: &TransactionId) -> TransactionGuard {
        self.ctx.locks.lock_transaction(id).await
    }

    /// Record for the locked transaction, if any
    pub(crate) async fn find(&self, guard: &TransactionGuard) -> Option<ValueTransferRecord> {
        self.ctx.repository.get(guard.id()).await
    }

    /// Record for the locked transaction
    ///
    /// # Errors
    ///
    /// `TransactionNotFound` when no record exists; for inbound messages this
    /// means the message is dropped.
    pub(crate) async fn load(
        &self,
        guard: &TransactionGuard,
        operation: &str,
    ) -> Result<ValueTransferRecord, ValueTransferError> {
        self.find(guard).await.ok_or_else(|| {
            debug!(thid = %guard.id(), operation, "no record, message dropped");
            ValueTransferError::transaction_not_found(guard.id(), operation)
        })
    }

    /// Start a new transaction record for `role`
    pub(crate) fn new_record(
        &self,
        role: Role,
        id: TransactionId,
        state: TransactionState,
        amount: rust_decimal::Decimal,
    ) -> ValueTransferRecord {
        let transaction = Transaction::new(id, state, amount, &self.ctx.config.unit_of_amount);
        ValueTransferRecord::new(role, transaction, self.did())
    }

    /// Persist a new record and publish it
    pub(crate) async fn create(
        &self,
        guard: &TransactionGuard,
        record: ValueTransferRecord,
    ) -> Result<ValueTransferRecord, ValueTransferError> {
        guard.ensure_for(&record.id)?;
        self.ctx.repository.create(record.clone()).await?;
        self.ctx.events.emit_state_changed(&record.id).await?;
        info!(
            thid = %record.id,
            role = %record.role,
            state = %record.state(),
            amount = %record.transaction.amount,
            "transaction created"
        );
        Ok(record)
    }

    /// Move a record to `next`, persist and publish
    ///
    /// `apply` runs before the state changes, for the fields that move
    /// together with the state.
    ///
    /// # Errors
    ///
    /// `InvalidState` when `next` is not a legal successor of the current state.
    pub(crate) async fn transition<F>(
        &self,
        guard: &TransactionGuard,
        mut record: ValueTransferRecord,
        next: TransactionState,
        apply: F,
    ) -> Result<ValueTransferRecord, ValueTransferError>
    where
        F: FnOnce(&mut Transaction),
    {
        guard.ensure_for(&record.id)?;
        let current = record.state();
        if !current.can_transition_to(next) {
            return Err(ValueTransferError::invalid_state(
                &record.id,
                current,
                &format!("move to {next}"),
            ));
        }

        apply(&mut record.transaction);
        record.transaction.state = next;
        record.updated_at = Utc::now();
        self.ctx.repository.update(record.clone()).await?;
        self.ctx.events.emit_state_changed(&record.id).await?;

        info!(thid = %record.id, role = %record.role, from = %current, to = %next, "transition");
        Ok(record)
    }

    /// Log and return a record whose state precondition did not hold
    pub(crate) fn ignore(&self, record: ValueTransferRecord, kind: &str) -> ValueTransferRecord {
        if record.is_terminal() {
            info!(thid = %record.id, state = %record.state(), kind, "transaction is terminal, message ignored");
        } else {
            debug!(thid = %record.id, state = %record.state(), kind, "duplicate or out-of-order message ignored");
        }
        record
    }

    /// Check that `from` is the party this step expects
    ///
    /// An unknown expected party (`None`) accepts any sender; the caller
    /// binds it.
    pub(crate) fn verify_sender(
        &self,
        record: &ValueTransferRecord,
        from: &Did,
        expected: Option<&Did>,
    ) -> Result<(), ValueTransferError> {
        match expected {
            Some(expected) if expected != from => {
                Err(ValueTransferError::did_mismatch(&record.id, expected, from))
            }
            _ => Ok(()),
        }
    }

    /// Send through the agent's transport
    pub(crate) async fn send(
        &self,
        to: &Did,
        message: ProtocolMessage,
        hint: Option<TransportHint>,
    ) -> Result<(), ValueTransferError> {
        self.ctx.transport.send(to, message, hint).await?;
        Ok(())
    }

    /// Map a step outcome onto the transaction
    ///
    /// Validation errors fail `record` and notify its participants (and the
    /// sender `from`, if it is not one); any other error is returned as is.
    pub(crate) async fn settle(
        &self,
        guard: &TransactionGuard,
        record: ValueTransferRecord,
        outcome: Result<ValueTransferRecord, ValueTransferError>,
        from: Option<&Did>,
    ) -> Result<ValueTransferRecord, ValueTransferError> {
        match outcome {
            Err(error) if error.is_validation() => {
                warn!(thid = %record.id, role = %record.role, %error, "validation failed");
                let mut recipients: Vec<Did> = record.transaction.participants().cloned().collect();
                if let Some(from) = from {
                    if !recipients.contains(from) {
                        recipients.push(from.clone());
                    }
                }
                let problem = ProblemError {
                    code: error.problem_code().to_string(),
                    comment: error.to_string(),
                };
                self.fail(guard, record, problem, recipients).await
            }
            other => other,
        }
    }

    /// Move a record to `Failed` and send a `ProblemReport` to `recipients`
    ///
    /// Reservations held by the transaction are released in both the wallet
    /// and the witness ledger. Already terminal records are returned unchanged.
    /// Undeliverable reports are logged; the failure itself is committed.
    pub(crate) async fn fail(
        &self,
        guard: &TransactionGuard,
        record: ValueTransferRecord,
        problem: ProblemError,
        recipients: Vec<Did>,
    ) -> Result<ValueTransferRecord, ValueTransferError> {
        if record.is_terminal() {
            return Ok(record);
        }

        let id = record.id.clone();
        for store in [&self.ctx.wallet, &self.ctx.ledger] {
            store
                .use_party_state(guard, |state| {
                    state.release(&id);
                    Ok(())
                })
                .await?;
        }

        let report = ProblemReport {
            code: problem.code.clone(),
            comment: problem.comment.clone(),
        };
        let failed = self
            .transition(guard, record, TransactionState::Failed, |tx| {
                tx.error = Some(problem);
                tx.expected_recipient_did = None;
            })
            .await?;

        for did in recipients.iter().filter(|did| *did != self.did()) {
            let message = ProtocolMessage::problem_report(id.clone(), &report.code, &report.comment);
            if let Err(error) = self.send(did, message, None).await {
                warn!(thid = %id, to = %did, %error, "problem report not delivered");
            }
        }
        Ok(failed)
    }

    /// Inbound `GetterReceipt` or `GiverReceipt` from the witness
    ///
    /// Applies the wallet effect if it was not applied on `CashRemoved`
    /// already, stores the receipt and completes the transaction.
    pub async fn process_receipt(
        &self,
        role: Role,
        from: &Did,
        thid: &TransactionId,
        receipt: Receipt,
    ) -> Result<ValueTransferRecord, ValueTransferError> {
        let guard = self.lock(thid).await;
        let record = self.load(&guard, "process_receipt").await?;
        if record.role != role || !record.state().can_transition_to(TransactionState::Completed) {
            return Ok(self.ignore(record, "receipt"));
        }

        let outcome = self
            .complete_with_receipt(&guard, record.clone(), from, receipt)
            .await;
        self.settle(&guard, record, outcome, Some(from)).await
    }

    async fn complete_with_receipt(
        &self,
        guard: &TransactionGuard,
        record: ValueTransferRecord,
        from: &Did,
        receipt: Receipt,
    ) -> Result<ValueTransferRecord, ValueTransferError> {
        self.verify_sender(&record, from, record.transaction.witness.as_ref())?;
        if receipt.amount != record.transaction.amount {
            return Err(ValueTransferError::amount_mismatch(
                &record.id,
                record.transaction.amount,
                receipt.amount,
            ));
        }

        if !record.transaction.cash_settled {
            self.settle_wallet(guard, &record, &receipt).await?;
        }

        self.transition(guard, record, TransactionState::Completed, |tx| {
            tx.receipt = Some(receipt);
            tx.cash_settled = true;
            tx.expected_recipient_did = None;
        })
        .await
    }

    /// Wallet effect of a completed transfer for the local party
    async fn settle_wallet(
        &self,
        guard: &TransactionGuard,
        record: &ValueTransferRecord,
        receipt: &Receipt,
    ) -> Result<(), ValueTransferError> {
        let me = self.did().clone();
        let mine = receipt.notes_for(&me);
        match record.role {
            Role::Getter => {
                let received = total_value(&mine);
                if received != record.transaction.amount {
                    return Err(ValueTransferError::amount_mismatch(
                        &record.id,
                        record.transaction.amount,
                        received,
                    ));
                }
                self.ctx
                    .wallet
                    .use_party_state(guard, |state| Ok(state.receive(&mine)))
                    .await?;
            }
            Role::Giver => {
                let spent: Vec<String> = receipt.inputs.iter().map(|n| n.id.clone()).collect();
                self.ctx
                    .wallet
                    .use_party_state(guard, |state| {
                        state.consume(&spent);
                        Ok(state.receive(&mine))
                    })
                    .await?;
            }
            Role::Witness | Role::Issuer => {}
        }
        Ok(())
    }

    /// Inbound `ProblemReport`
    ///
    /// Accepted only from a participant of the transaction. The witness
    /// relays the report to the other participants.
    pub async fn process_problem_report(
        &self,
        from: &Did,
        thid: &TransactionId,
        report: ProblemReport,
    ) -> Result<ValueTransferRecord, ValueTransferError> {
        let guard = self.lock(thid).await;
        let record = self.load(&guard, "process_problem_report").await?;
        if record.is_terminal() {
            return Ok(self.ignore(record, "problem-report"));
        }
        if !record.transaction.is_participant(from) {
            warn!(thid = %thid, %from, code = %report.code, "problem report from non-participant dropped");
            return Ok(record);
        }

        warn!(thid = %thid, %from, code = %report.code, comment = %report.comment, "problem report received");
        let recipients = if record.role == Role::Witness {
            record
                .transaction
                .participants()
                .filter(|did| *did != from)
                .cloned()
                .collect()
        } else {
            Vec::new()
        };
        let problem = ProblemError {
            code: report.code,
            comment: report.comment,
        };
        self.fail(&guard, record, problem, recipients).await
    }

    /// Locally abort a transaction and tell every participant
    ///
    /// # Errors
    ///
    /// `Terminal` if the transaction already completed or failed.
    pub async fn abort(
        &self,
        record_id: &TransactionId,
        code: Option<&str>,
        comment: &str,
    ) -> Result<ValueTransferRecord, ValueTransferError> {
        let guard = self.lock(record_id).await;
        let record = self.load(&guard, "abort").await?;
        if record.is_terminal() {
            return Err(ValueTransferError::Terminal {
                id: record.id.to_string(),
                state: record.state(),
            });
        }

        info!(thid = %record_id, comment, "transaction aborted");
        let recipients = record.transaction.participants().cloned().collect();
        let problem = ProblemError {
            code: code.unwrap_or(codes::ABORTED).to_string(),
            comment: comment.to_string(),
        };
        self.fail(&guard, record, problem, recipients).await
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::core::{InMemoryNetwork, InMemoryTransactionRepository};
    use crate::types::Note;
    use rust_decimal::Decimal;

    /// Context for `config` on `network`, with a wallet of the given note values
    pub(crate) fn context(
        network: &Arc<InMemoryNetwork>,
        config: AgentConfig,
        notes: &[i64],
    ) -> Arc<CoordinatorContext> {
        let wallet = PartyStateStore::bootstrap(
            notes
                .iter()
                .map(|v| Note::new(Decimal::new(*v, 0), config.did.clone()))
                .collect(),
        );
        Arc::new(CoordinatorContext::new(
            config.clone(),
            network.channel(&config.did),
            Arc::new(InMemoryTransactionRepository::new()),
            wallet,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::context;
    use super::*;
    use crate::core::InMemoryNetwork;
    use crate::types::MessageBody;
    use rust_decimal::Decimal;
    use TransactionState::*;

    async fn seeded(
        party: &PartyCoordinator,
        state: TransactionState,
        witness: &Did,
        counterpart: &Did,
    ) -> ValueTransferRecord {
        let id = TransactionId::generate();
        let guard = party.lock(&id).await;
        let mut record = party.new_record(Role::Getter, id, state, Decimal::TEN);
        record.transaction.getter = Some(party.did().clone());
        record.transaction.giver = Some(counterpart.clone());
        record.transaction.witness = Some(witness.clone());
        party.create(&guard, record).await.unwrap()
    }

    #[tokio::test]
    async fn test_transition_rejects_illegal_edge() {
        let network = InMemoryNetwork::new();
        let party = PartyCoordinator::new(context(&network, "did:peer:g".into(), &[]));
        let record = seeded(&party, RequestSent, &Did::from("did:peer:w"), &Did::from("did:peer:v")).await;

        let guard = party.lock(&record.id).await;
        let result = party.transition(&guard, record.clone(), CashRemoved, |_| {}).await;

        assert!(matches!(result, Err(ValueTransferError::InvalidState { .. })));
        drop(guard);
        let stored = party.context().repository.get(&record.id).await.unwrap();
        assert_eq!(stored.state(), RequestSent);
    }

    #[tokio::test]
    async fn test_transition_requires_matching_guard() {
        let network = InMemoryNetwork::new();
        let party = PartyCoordinator::new(context(&network, "did:peer:g".into(), &[]));
        let record = seeded(&party, RequestSent, &Did::from("did:peer:w"), &Did::from("did:peer:v")).await;

        let other = party.lock(&TransactionId::generate()).await;
        let result = party.transition(&other, record, Failed, |_| {}).await;

        assert!(matches!(result, Err(ValueTransferError::LockMismatch { .. })));
    }

    #[tokio::test]
    async fn test_problem_report_from_participant_fails_transaction() {
        let network = InMemoryNetwork::new();
        let witness = Did::from("did:peer:w");
        let party = PartyCoordinator::new(context(&network, "did:peer:g".into(), &[]));
        let record = seeded(&party, RequestSent, &witness, &Did::from("did:peer:v")).await;

        let report = ProblemReport {
            code: codes::EXPIRED.to_string(),
            comment: "too late".to_string(),
        };
        let failed = party
            .process_problem_report(&witness, &record.id, report)
            .await
            .unwrap();

        assert_eq!(failed.state(), Failed);
        let error = failed.transaction.error.unwrap();
        assert_eq!(error.code, codes::EXPIRED);
        assert_eq!(error.comment, "too late");
    }

    #[tokio::test]
    async fn test_problem_report_from_stranger_is_dropped() {
        let network = InMemoryNetwork::new();
        let party = PartyCoordinator::new(context(&network, "did:peer:g".into(), &[]));
        let record = seeded(&party, RequestSent, &Did::from("did:peer:w"), &Did::from("did:peer:v")).await;

        let report = ProblemReport {
            code: codes::ABORTED.to_string(),
            comment: "hijack".to_string(),
        };
        let unchanged = party
            .process_problem_report(&Did::from("did:peer:mallory"), &record.id, report)
            .await
            .unwrap();

        assert_eq!(unchanged.state(), RequestSent);
    }

    #[tokio::test]
    async fn test_abort_notifies_participants() {
        let network = InMemoryNetwork::new();
        let witness = Did::from("did:peer:w");
        let giver = Did::from("did:peer:v");
        let mut witness_inbox = network.register(&witness);
        let mut giver_inbox = network.register(&giver);
        let party = PartyCoordinator::new(context(&network, "did:peer:g".into(), &[]));
        let record = seeded(&party, RequestSent, &witness, &giver).await;

        let aborted = party.abort(&record.id, None, "changed my mind").await.unwrap();
        assert_eq!(aborted.state(), Failed);

        for inbox in [&mut witness_inbox, &mut giver_inbox] {
            let (from, message) = inbox.recv().await.unwrap();
            assert_eq!(&from, party.did());
            match message.body {
                MessageBody::ProblemReport(report) => assert_eq!(report.code, codes::ABORTED),
                other => panic!("Expected problem report, got {:?}", other),
            }
        }

        let again = party.abort(&record.id, None, "twice").await;
        assert!(matches!(again, Err(ValueTransferError::Terminal { .. })));
    }

    #[tokio::test]
    async fn test_fail_releases_reserved_notes() {
        let network = InMemoryNetwork::new();
        let party = PartyCoordinator::new(context(&network, "did:peer:v".into(), &[4, 6]));
        let record = seeded(&party, RequestSent, &Did::from("did:peer:w"), &Did::from("did:peer:g")).await;

        let guard = party.lock(&record.id).await;
        party
            .context()
            .wallet
            .use_party_state(&guard, |state| state.select_notes(Decimal::new(5, 0), &record.id))
            .await
            .unwrap();
        assert!(party.context().wallet.snapshot().await.available_balance() < Decimal::TEN);

        let problem = ProblemError {
            code: codes::INTERNAL.to_string(),
            comment: "test".to_string(),
        };
        party.fail(&guard, record, problem, Vec::new()).await.unwrap();

        assert_eq!(
            party.context().wallet.snapshot().await.available_balance(),
            Decimal::TEN
        );
    }
}
