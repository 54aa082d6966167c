//! Per-transaction mutual exclusion
//!
//! This module provides the `LockManager`, which hands out one async lock per
//! transaction id. Every coordinator operation that mutates a transaction
//! holds its [`TransactionGuard`] for the whole check-transition-persist
//! sequence, so transitions for one id are applied one at a time while
//! unrelated transactions proceed in parallel.
//!
//! # Lock order
//!
//! The wallet lock inside [`PartyStateStore`](super::PartyStateStore) can
//! only be taken by presenting a `TransactionGuard`, which makes the global
//! order (transaction lock first, wallet lock second) a type-level rule.
//!
//! # Reentrancy
//!
//! Locks are not recursive. An operation that continues under a lock its
//! caller already holds receives the caller's guard and checks it with
//! [`TransactionGuard::ensure_for`] instead of locking again.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{trace, warn};

use crate::types::{TransactionId, ValueTransferError};

type LockTable = DashMap<TransactionId, Arc<Mutex<()>>>;

/// Issues per-transaction locks
#[derive(Debug)]
pub struct LockManager {
    enabled: bool,
    locks: Arc<LockTable>,
}

impl LockManager {
    /// Create a lock manager
    ///
    /// With `enabled = false` guards are issued without any mutual exclusion.
    /// That is only sound for single-threaded test harnesses.
    pub fn new(enabled: bool) -> Self {
        if !enabled {
            warn!("transaction locking disabled");
        }
        LockManager {
            enabled,
            locks: Arc::new(DashMap::new()),
        }
    }

    /// Acquire the lock for a transaction id, waiting if another task holds it
    pub async fn lock_transaction(&self, id: &TransactionId) -> TransactionGuard {
        if !self.enabled {
            return TransactionGuard {
                id: id.clone(),
                guard: None,
                locks: Arc::clone(&self.locks),
            };
        }

        let mutex = Arc::clone(
            &self
                .locks
                .entry(id.clone())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        );
        let guard = mutex.lock_owned().await;
        trace!(thid = %id, "transaction lock acquired");

        TransactionGuard {
            id: id.clone(),
            guard: Some(guard),
            locks: Arc::clone(&self.locks),
        }
    }

    /// Number of ids that currently have a lock entry
    pub fn active_locks(&self) -> usize {
        self.locks.len()
    }
}

/// Proof that the holder owns the lock of one transaction
///
/// Dropping the guard releases the lock on every exit path, including early
/// returns with `?`.
#[derive(Debug)]
pub struct TransactionGuard {
    id: TransactionId,
    guard: Option<OwnedMutexGuard<()>>,
    locks: Arc<LockTable>,
}

impl TransactionGuard {
    pub fn id(&self) -> &TransactionId {
        &self.id
    }

    /// Check that this guard covers `id`
    pub fn ensure_for(&self, id: &TransactionId) -> Result<(), ValueTransferError> {
        if &self.id == id {
            Ok(())
        } else {
            Err(ValueTransferError::LockMismatch {
                held: self.id.to_string(),
                requested: id.to_string(),
            })
        }
    }
}

impl Drop for TransactionGuard {
    fn drop(&mut self) {
        if let Some(guard) = self.guard.take() {
            drop(guard);
            // Only the table's own reference left: nobody holds or awaits it.
            self.locks
                .remove_if(&self.id, |_, mutex| Arc::strong_count(mutex) == 1);
            trace!(thid = %self.id, "transaction lock released");
        }
    }
}
