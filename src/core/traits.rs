//! Core traits for transaction persistence and message transport
//!
//! This module defines the trait abstractions at the two external seams of
//! the protocol core: the keyed record store and the transport channel.
//! In-memory implementations live alongside; production deployments plug in
//! their own storage and DIDComm delivery.

use async_trait::async_trait;

use crate::types::{
    DeliveryError, Did, ProtocolMessage, TransactionId, ValueTransferError, ValueTransferRecord,
};

/// Trait for storing and retrieving transaction records
///
/// Provides create/update/find over records keyed by transaction id and
/// queryable by thread id. Implementations must be safe to share across
/// tasks; mutual exclusion per transaction is provided by the lock manager,
/// not by the store.
#[async_trait]
pub trait TransactionRepository: Send + Sync {
    /// Insert a new record, failing if the id already exists
    async fn create(&self, record: ValueTransferRecord) -> Result<(), ValueTransferError>;

    /// Replace an existing record, failing if it does not exist
    async fn update(&self, record: ValueTransferRecord) -> Result<(), ValueTransferError>;

    /// Get a record by transaction id
    async fn get(&self, id: &TransactionId) -> Option<ValueTransferRecord>;

    /// Get a record by DIDComm thread id
    async fn find_by_thread_id(&self, thid: &TransactionId) -> Option<ValueTransferRecord>;

    /// All records, in no particular order
    async fn list(&self) -> Vec<ValueTransferRecord>;

    /// Administrative removal of a record
    async fn purge(&self, id: &TransactionId) -> Option<ValueTransferRecord>;
}

/// Transport hint selecting a delivery channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportHint {
    Http,
    WebSocket,
    Nfc,
    Proximity,
}

/// Trait for delivering protocol messages to a DID
///
/// Envelope encryption, signing and routing are the channel's concern. The
/// inbound side is the dispatcher calling [`crate::Agent::receive`] once the
/// envelope has been verified.
#[async_trait]
pub trait TransportChannel: Send + Sync {
    async fn send(
        &self,
        to: &Did,
        message: ProtocolMessage,
        hint: Option<TransportHint>,
    ) -> Result<(), DeliveryError>;
}
