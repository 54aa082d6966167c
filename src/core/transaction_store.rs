//! Thread-safe transaction record storage
//!
//! This module provides the `InMemoryTransactionRepository` struct, which
//! stores value transfer records using concurrent data structures to enable
//! safe multi-task access.
//!
//! # Design
//!
//! The repository uses `DashMap` (a concurrent HashMap) for the primary
//! record map and a second `DashMap` as the thread-id index. Records for
//! different transactions can be read and written concurrently; the
//! read-modify-write of a single transaction is serialized one level up by
//! the [`LockManager`](super::LockManager).
//!
//! # Purpose
//!
//! Records are the audit trail of every protocol run. They are created on the
//! first message or local call that opens a transaction, updated on every
//! transition and never removed except through [`purge`](TransactionRepository::purge).

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::debug;

use super::traits::TransactionRepository;
use crate::types::{TransactionId, ValueTransferError, ValueTransferRecord};

/// Thread-safe in-memory record store
///
/// # Thread Safety
///
/// All methods are safe to call from multiple tasks concurrently. The
/// internal `DashMap` ensures that:
/// - Concurrent reads of different records don't block each other
/// - Concurrent writes of different records don't block each other
/// - Inserting the same id twice from two tasks lets exactly one win
#[derive(Debug, Default)]
pub struct InMemoryTransactionRepository {
    /// Records by transaction id
    records: DashMap<TransactionId, ValueTransferRecord>,

    /// Thread id -> transaction id
    threads: DashMap<TransactionId, TransactionId>,
}

impl InMemoryTransactionRepository {
    /// Create a new empty repository
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl TransactionRepository for InMemoryTransactionRepository {
    /// Store a new record
    ///
    /// # Returns
    ///
    /// * `Ok(())` - If the record was inserted
    /// * `Err(ValueTransferError::DuplicateTransaction)` - If the id is already present
    async fn create(&self, record: ValueTransferRecord) -> Result<(), ValueTransferError> {
        use dashmap::mapref::entry::Entry;

        match self.records.entry(record.id.clone()) {
            Entry::Occupied(_) => Err(ValueTransferError::DuplicateTransaction {
                id: record.id.to_string(),
            }),
            Entry::Vacant(slot) => {
                self.threads
                    .insert(record.thread_id.clone(), record.id.clone());
                debug!(thid = %record.id, state = %record.state(), "record created");
                slot.insert(record);
                Ok(())
            }
        }
    }

    /// Replace an existing record
    ///
    /// # Returns
    ///
    /// * `Ok(())` - If the record existed and was replaced
    /// * `Err(ValueTransferError::TransactionNotFound)` - If no record has this id
    async fn update(&self, record: ValueTransferRecord) -> Result<(), ValueTransferError> {
        match self.records.get_mut(&record.id) {
            Some(mut entry) => {
                *entry.value_mut() = record;
                Ok(())
            }
            None => Err(ValueTransferError::transaction_not_found(&record.id, "update")),
        }
    }

    async fn get(&self, id: &TransactionId) -> Option<ValueTransferRecord> {
        self.records.get(id).map(|entry| entry.value().clone())
    }

    async fn find_by_thread_id(&self, thid: &TransactionId) -> Option<ValueTransferRecord> {
        let id = self.threads.get(thid).map(|entry| entry.value().clone())?;
        self.get(&id).await
    }

    async fn list(&self) -> Vec<ValueTransferRecord> {
        self.records
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    async fn purge(&self, id: &TransactionId) -> Option<ValueTransferRecord> {
        let (_, record) = self.records.remove(id)?;
        self.threads.remove(&record.thread_id);
        debug!(thid = %id, "record purged");
        Some(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Did, Role, Transaction, TransactionState};
    use rust_decimal::Decimal;
    use std::sync::Arc;

    fn record(state: TransactionState) -> ValueTransferRecord {
        let tx = Transaction::new(TransactionId::generate(), state, Decimal::ONE, "credit");
        ValueTransferRecord::new(Role::Getter, tx, &Did::from("did:peer:getter"))
    }

    #[tokio::test]
    async fn test_create_and_retrieve_record() {
        let repo = InMemoryTransactionRepository::new();
        let rec = record(TransactionState::RequestSent);

        repo.create(rec.clone()).await.unwrap();

        assert_eq!(repo.get(&rec.id).await, Some(rec.clone()));
        assert_eq!(repo.find_by_thread_id(&rec.thread_id).await, Some(rec));
    }

    #[tokio::test]
    async fn test_create_rejects_duplicate_id() {
        let repo = InMemoryTransactionRepository::new();
        let rec = record(TransactionState::RequestSent);
        repo.create(rec.clone()).await.unwrap();

        let mut other = rec.clone();
        other.transaction.state = TransactionState::Completed;
        let result = repo.create(other).await;

        assert!(matches!(
            result,
            Err(ValueTransferError::DuplicateTransaction { .. })
        ));
        assert_eq!(repo.get(&rec.id).await.unwrap().state(), TransactionState::RequestSent);
    }

    #[tokio::test]
    async fn test_update_nonexistent_record() {
        let repo = InMemoryTransactionRepository::new();

        match repo.update(record(TransactionState::RequestSent)).await {
            Err(ValueTransferError::TransactionNotFound { operation, .. }) => {
                assert_eq!(operation, "update");
            }
            other => panic!("Expected TransactionNotFound error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_update_and_purge() {
        let repo = InMemoryTransactionRepository::new();
        let mut rec = record(TransactionState::RequestSent);
        repo.create(rec.clone()).await.unwrap();

        rec.transaction.state = TransactionState::Completed;
        repo.update(rec.clone()).await.unwrap();
        assert_eq!(repo.list().await.len(), 1);
        assert_eq!(repo.get(&rec.id).await.unwrap().state(), TransactionState::Completed);

        assert!(repo.purge(&rec.id).await.is_some());
        assert!(repo.find_by_thread_id(&rec.thread_id).await.is_none());
        assert!(repo.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_create_single_winner() {
        let repo = Arc::new(InMemoryTransactionRepository::new());
        let rec = record(TransactionState::RequestReceived);

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let repo = Arc::clone(&repo);
                let rec = rec.clone();
                tokio::spawn(async move { repo.create(rec).await.is_ok() })
            })
            .collect();

        let wins = futures::future::join_all(tasks)
            .await
            .into_iter()
            .filter(|r| matches!(r, Ok(true)))
            .count();

        assert_eq!(wins, 1);
        assert_eq!(repo.len(), 1);
    }
}
