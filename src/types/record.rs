//! Persistence view of a transaction
//!
//! A `ValueTransferRecord` wraps a [`Transaction`] with the role it is held
//! under locally, its thread id and role-local bookkeeping. There is exactly
//! one record per transaction id; records are kept as an audit trail after
//! completion and only removed by an explicit purge.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::transaction::{Did, Role, Transaction, TransactionId, TransactionState};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueTransferRecord {
    pub id: TransactionId,

    /// DIDComm thread id; equal to `id` for every protocol run
    pub thread_id: TransactionId,

    /// Role the local agent plays in this transaction
    pub role: Role,

    pub transaction: Transaction,

    /// Local DID representations used on this thread
    #[serde(default)]
    pub used_dids: Vec<Did>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ValueTransferRecord {
    pub fn new(role: Role, transaction: Transaction, local_did: &Did) -> Self {
        let now = Utc::now();
        ValueTransferRecord {
            id: transaction.id.clone(),
            thread_id: transaction.id.clone(),
            role,
            transaction,
            used_dids: vec![local_did.clone()],
            created_at: now,
            updated_at: now,
        }
    }

    pub fn state(&self) -> TransactionState {
        self.transaction.state
    }

    pub fn is_terminal(&self) -> bool {
        self.transaction.state.is_terminal()
    }
}
