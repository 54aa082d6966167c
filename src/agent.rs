//! Agent facade
//!
//! An `Agent` is one participant on the network. It owns the shared
//! coordinator context, one coordinator per role and the witness directory,
//! and routes every inbound message to the coordinator responsible for it.

use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::AgentConfig;
use crate::core::{
    Envelope, EventBus, InMemoryTransactionRepository, PartyStateStore, TransactionRepository,
    TransportChannel, WitnessDirectory,
};
use crate::roles::{
    CoordinatorContext, GetterCoordinator, GiverCoordinator, IssuerCoordinator, PartyCoordinator,
    WitnessCoordinator,
};
use crate::types::{
    Did, MessageBody, Note, PartyState, PaymentRequest, ProtocolMessage, TransactionId,
    ValueTransferError, ValueTransferRecord, WitnessInfo,
};

pub struct Agent {
    context: Arc<CoordinatorContext>,
    party: PartyCoordinator,
    getter: GetterCoordinator,
    giver: GiverCoordinator,
    witness: WitnessCoordinator,
    issuer: IssuerCoordinator,
    directory: WitnessDirectory,
}

impl Agent {
    /// Create an agent with an in-memory record store and an empty wallet
    pub fn new(
        config: AgentConfig,
        channel: Arc<dyn TransportChannel>,
    ) -> Result<Self, ValueTransferError> {
        Self::with_parts(
            config,
            channel,
            Arc::new(InMemoryTransactionRepository::new()),
            Vec::new(),
        )
    }

    /// Create an agent from explicit parts
    ///
    /// # Arguments
    ///
    /// * `config` - Validated before anything is built
    /// * `channel` - Outbound transport
    /// * `repository` - Record store
    /// * `notes` - Wallet contents at bootstrap
    ///
    /// # Errors
    ///
    /// `InvalidConfig` if the configuration is rejected.
    pub fn with_parts(
        config: AgentConfig,
        channel: Arc<dyn TransportChannel>,
        repository: Arc<dyn TransactionRepository>,
        notes: Vec<Note>,
    ) -> Result<Self, ValueTransferError> {
        config.validate()?;
        let context = Arc::new(CoordinatorContext::new(
            config,
            channel,
            repository,
            PartyStateStore::bootstrap(notes),
        ));
        let party = PartyCoordinator::new(Arc::clone(&context));
        let directory =
            WitnessDirectory::new(Arc::clone(&context.events), Arc::clone(&context.transport));
        if context.config.is_witness {
            directory.register(WitnessInfo::new(context.did().clone()));
        }

        info!(
            did = %context.did(),
            is_witness = context.config.is_witness,
            witness = ?context.config.witness_did,
            "agent started"
        );
        Ok(Agent {
            getter: GetterCoordinator::new(party.clone()),
            giver: GiverCoordinator::new(party.clone()),
            witness: WitnessCoordinator::new(party.clone()),
            issuer: IssuerCoordinator::new(party.clone()),
            party,
            directory,
            context,
        })
    }

    pub fn did(&self) -> &Did {
        self.context.did()
    }

    pub fn config(&self) -> &AgentConfig {
        &self.context.config
    }

    pub fn getter(&self) -> &GetterCoordinator {
        &self.getter
    }

    pub fn giver(&self) -> &GiverCoordinator {
        &self.giver
    }

    pub fn witness(&self) -> &WitnessCoordinator {
        &self.witness
    }

    pub fn issuer(&self) -> &IssuerCoordinator {
        &self.issuer
    }

    pub fn directory(&self) -> &WitnessDirectory {
        &self.directory
    }

    /// State-change notifications for every transaction of this agent
    pub fn events(&self) -> &EventBus {
        &self.context.events
    }

    pub async fn record(&self, id: &TransactionId) -> Option<ValueTransferRecord> {
        self.context.repository.get(id).await
    }

    pub async fn records(&self) -> Vec<ValueTransferRecord> {
        self.context.repository.list().await
    }

    /// Administrative removal of a record
    pub async fn purge(&self, id: &TransactionId) -> Option<ValueTransferRecord> {
        let purged = self.context.repository.purge(id).await;
        if purged.is_some() {
            info!(thid = %id, "record purged");
        }
        purged
    }

    /// Total value held in the wallet
    pub async fn balance(&self) -> Decimal {
        self.context.wallet.balance().await
    }

    pub async fn party_state(&self) -> PartyState {
        self.context.wallet.snapshot().await
    }

    /// Notes notarized by this agent as a witness
    pub async fn ledger(&self) -> PartyState {
        self.context.ledger.snapshot().await
    }

    /// Wait until a transaction completes or fails
    ///
    /// A timeout says nothing about the protocol outcome; the transaction
    /// may still complete afterwards.
    pub async fn wait_until_terminal(
        &self,
        id: &TransactionId,
        timeout: Option<Duration>,
    ) -> Result<ValueTransferRecord, ValueTransferError> {
        let timeout = timeout.unwrap_or_else(|| self.config().terminal_wait());
        self.context.events.wait_until_terminal(id, timeout).await
    }

    /// Abort a transaction locally and notify its participants
    pub async fn abort(
        &self,
        id: &TransactionId,
        code: Option<&str>,
        comment: &str,
    ) -> Result<ValueTransferRecord, ValueTransferError> {
        self.party.abort(id, code, comment).await
    }

    /// Dispatch one inbound message
    ///
    /// `from` is the authenticated sender DID supplied by the transport.
    ///
    /// # Returns
    ///
    /// * `Ok(Some(record))` - The record after the message was applied (or ignored)
    /// * `Ok(None)` - Directory messages, and witness-only messages reaching a non-witness
    /// * `Err(TransactionNotFound)` - A non-initiating message for an unknown transaction, dropped
    pub async fn receive(
        &self,
        from: &Did,
        message: ProtocolMessage,
    ) -> Result<Option<ValueTransferRecord>, ValueTransferError> {
        let ProtocolMessage { thid, body } = message;
        debug!(%from, %thid, kind = body.kind(), "message received");
        if self.needs_witness(&body) && !self.config().is_witness {
            warn!(%from, %thid, kind = body.kind(), "witness message reached a non-witness, dropped");
            return Ok(None);
        }

        let record = match body {
            MessageBody::Request(request) => {
                if self.is_witness_for(&request) {
                    self.witness.process_request(from, &thid, request).await?
                } else {
                    self.giver
                        .process_payment_request(from, &thid, request)
                        .await?
                }
            }
            MessageBody::Offer(offer) => self.getter.process_offer(from, &thid, offer).await?,
            MessageBody::RequestAccepted(acceptance) => {
                self.witness
                    .process_request_accepted(from, &thid, acceptance)
                    .await?
            }
            MessageBody::RequestAcceptedWitnessed(acceptance) => {
                self.getter
                    .process_request_acceptance_witnessed(from, &thid, acceptance)
                    .await?
            }
            MessageBody::CashAccepted(acceptance) => {
                self.witness
                    .process_cash_accepted(from, &thid, acceptance)
                    .await?
            }
            MessageBody::CashAcceptedWitnessed(witnessed) => {
                self.giver
                    .process_cash_acceptance_witnessed(from, &thid, witnessed)
                    .await?
            }
            MessageBody::CashRemoved(removal) => {
                self.giver.process_cash_removed(from, &thid, removal).await?
            }
            MessageBody::GetterReceipt(receipt) => {
                self.getter.process_receipt(from, &thid, receipt).await?
            }
            MessageBody::GiverReceipt(receipt) => {
                self.giver.process_receipt(from, &thid, receipt).await?
            }
            MessageBody::Mint(mint) => self.witness.process_mint(from, &thid, mint).await?,
            MessageBody::MintResponse(response) => {
                self.issuer
                    .process_cash_mint_response(from, &thid, response)
                    .await?
            }
            MessageBody::ProblemReport(report) => {
                self.party
                    .process_problem_report(from, &thid, report)
                    .await?
            }
            MessageBody::WitnessTable(table) => {
                self.directory.on_table_received(from, table);
                return Ok(None);
            }
            MessageBody::WitnessTableQuery => {
                self.directory.process_query(from).await?;
                return Ok(None);
            }
        };
        Ok(Some(record))
    }

    fn needs_witness(&self, body: &MessageBody) -> bool {
        matches!(
            body,
            MessageBody::RequestAccepted(_) | MessageBody::CashAccepted(_) | MessageBody::Mint(_)
        )
    }

    /// A request naming us as witness, and not as one of the parties
    fn is_witness_for(&self, request: &PaymentRequest) -> bool {
        let me = self.did();
        self.config().is_witness
            && request.witness.as_ref() == Some(me)
            && request.giver.as_ref() != Some(me)
            && &request.getter != me
    }

    /// Consume an inbox, handling each message on its own task
    ///
    /// Messages for different transactions proceed in parallel; messages for
    /// the same transaction serialize on its lock.
    pub fn spawn_inbox(self: &Arc<Self>, mut inbox: UnboundedReceiver<Envelope>) -> JoinHandle<()> {
        let agent = Arc::clone(self);
        tokio::spawn(async move {
            while let Some((from, message)) = inbox.recv().await {
                let agent = Arc::clone(&agent);
                tokio::spawn(async move {
                    let thid = message.thid.clone();
                    let kind = message.kind();
                    match agent.receive(&from, message).await {
                        Ok(_) => {}
                        Err(ValueTransferError::TransactionNotFound { .. }) => {
                            debug!(%from, %thid, kind, "message for unknown transaction dropped")
                        }
                        Err(error) => warn!(%from, %thid, kind, %error, "inbound message not applied"),
                    }
                });
            }
            debug!(did = %agent.did(), "inbox closed");
        })
    }
}
