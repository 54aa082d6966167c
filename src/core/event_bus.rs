//! State-change notifications and completion waits
//!
//! The `EventBus` publishes every committed transition so observers (UIs,
//! callers awaiting a payment) can follow protocol progress without polling.
//!
//! Uses `tokio::sync::broadcast` for multi-producer, multi-consumer
//! semantics. A waiter subscribes before it reads the current record, so a
//! transition that lands between the read and the first `recv` is never lost.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::Instant;
use tracing::{debug, trace};

use super::traits::TransactionRepository;
use crate::types::{
    TransactionId, TransactionState, ValueTransferError, ValueTransferRecord, WitnessTable,
};

/// Default number of buffered events per subscriber
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Events published by the protocol core
#[derive(Debug, Clone)]
pub enum TransferEvent {
    /// A record was persisted in a new state
    StateChanged(ValueTransferRecord),

    /// An issuer's mint was confirmed by its witness
    CashMinted { thid: TransactionId },

    /// A fresh witness table replaced the local cache
    WitnessTableReceived(WitnessTable),
}

/// In-process event bus
pub struct EventBus {
    sender: broadcast::Sender<TransferEvent>,
    repository: Arc<dyn TransactionRepository>,
    events_published: AtomicU64,
}

impl EventBus {
    pub fn new(repository: Arc<dyn TransactionRepository>, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        EventBus {
            sender,
            repository,
            events_published: AtomicU64::new(0),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransferEvent> {
        self.sender.subscribe()
    }

    /// Publish an event, returning the number of subscribers that received it
    pub fn publish(&self, event: TransferEvent) -> usize {
        self.events_published.fetch_add(1, Ordering::Relaxed);
        // No receivers is the normal case when nobody is watching.
        self.sender.send(event).unwrap_or(0)
    }

    /// Load the current record and publish it
    pub async fn emit_state_changed(
        &self,
        id: &TransactionId,
    ) -> Result<ValueTransferRecord, ValueTransferError> {
        let record = self
            .repository
            .get(id)
            .await
            .ok_or_else(|| ValueTransferError::transaction_not_found(id, "emit_state_changed"))?;
        let receivers = self.publish(TransferEvent::StateChanged(record.clone()));
        trace!(thid = %id, state = %record.state(), receivers, "state change published");
        Ok(record)
    }

    /// Wait until the transaction reaches `Completed` or `Failed`
    ///
    /// # Returns
    ///
    /// * `Ok(record)` - The first terminal record observed
    /// * `Err(ValueTransferError::Timeout)` - No terminal state within `timeout`.
    ///   The outcome is unknown, not failed: the protocol keeps running and a
    ///   later read may show the transaction completed.
    /// * `Err(ValueTransferError::TransactionNotFound)` - No such record
    pub async fn wait_until_terminal(
        &self,
        id: &TransactionId,
        timeout: Duration,
    ) -> Result<ValueTransferRecord, ValueTransferError> {
        let mut events = self.subscribe();
        let deadline = Instant::now() + timeout;

        let current = self
            .repository
            .get(id)
            .await
            .ok_or_else(|| ValueTransferError::transaction_not_found(id, "wait_until_terminal"))?;
        if current.is_terminal() {
            return Ok(current);
        }

        loop {
            match tokio::time::timeout_at(deadline, events.recv()).await {
                Err(_) => {
                    debug!(thid = %id, waited_ms = timeout.as_millis() as u64, "terminal wait timed out");
                    return Err(ValueTransferError::Timeout {
                        id: id.to_string(),
                        waited_ms: timeout.as_millis() as u64,
                    });
                }
                Ok(Ok(TransferEvent::StateChanged(record))) => {
                    if &record.id == id && record.is_terminal() {
                        return Ok(record);
                    }
                }
                Ok(Ok(_)) => {}
                Ok(Err(RecvError::Lagged(skipped))) => {
                    // Missed events may include ours; fall back to the store.
                    debug!(thid = %id, skipped, "terminal waiter lagged");
                    if let Some(record) = self.repository.get(id).await {
                        if record.is_terminal() {
                            return Ok(record);
                        }
                    }
                }
                Ok(Err(RecvError::Closed)) => {
                    return Err(ValueTransferError::transaction_not_found(
                        id,
                        "wait_until_terminal",
                    ))
                }
            }
        }
    }

    /// Wait on an existing subscription for the `CashMinted` event of `thid`
    ///
    /// The caller subscribes before sending the mint so the response cannot
    /// race ahead of the wait. A lagged subscription may have dropped the
    /// event, so the issuer's record is read back and a `Completed` mint
    /// counts as confirmed.
    pub async fn wait_for_mint(
        &self,
        mut events: broadcast::Receiver<TransferEvent>,
        thid: &TransactionId,
        timeout: Duration,
    ) -> Result<(), ValueTransferError> {
        let wait = async {
            loop {
                match events.recv().await {
                    Ok(TransferEvent::CashMinted { thid: minted }) if &minted == thid => {
                        return true
                    }
                    Ok(_) => continue,
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(thid = %thid, skipped, "mint waiter lagged");
                        let minted = self.repository.get(thid).await.map(|r| r.state());
                        if minted == Some(TransactionState::Completed) {
                            return true;
                        }
                    }
                    Err(RecvError::Closed) => return false,
                }
            }
        };

        match tokio::time::timeout(timeout, wait).await {
            Ok(true) => Ok(()),
            Ok(false) | Err(_) => Err(ValueTransferError::Timeout {
                id: thid.to_string(),
                waited_ms: timeout.as_millis() as u64,
            }),
        }
    }

    pub fn events_published(&self) -> u64 {
        self.events_published.load(Ordering::Relaxed)
    }
}
