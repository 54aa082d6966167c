//! Error types for the value transfer protocol
//!
//! This module defines all error types that can occur while coordinating a
//! transfer. Errors are designed to be descriptive for logs and to map onto
//! the problem report codes sent to protocol peers.
//!
//! # Error Categories
//!
//! - **Validation Errors**: Amount mismatch, DID mismatch, expired deadline, unknown or
//!   duplicate note, non-positive amount
//! - **State Errors**: Operation not allowed in the current transaction state
//! - **Delivery Errors**: The transport could not reach a DID
//! - **Timeout Errors**: A caller's wait elapsed before a terminal state was observed
//! - **Programmer Errors**: Missing records, invalid configuration, lock misuse

use rust_decimal::Decimal;
use thiserror::Error;

use super::message::codes;
use super::transaction::{Did, TransactionState};

/// Error returned by a transport channel
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    /// No route to the recipient DID
    #[error("No route to {did}")]
    Unreachable { did: String },

    /// The recipient's channel has shut down
    #[error("Channel to {did} is closed")]
    ChannelClosed { did: String },
}

/// Main error type for the value transfer core
///
/// This enum represents all possible errors that can occur while creating
/// or processing protocol messages. Each variant includes relevant context
/// to help diagnose and resolve the issue.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValueTransferError {
    /// No record exists for the transaction
    ///
    /// For inbound non-initiating messages this means the message is dropped.
    #[error("Transaction {id} not found for {operation}")]
    TransactionNotFound {
        /// Transaction ID that was not found
        id: String,
        /// Operation that failed
        operation: String,
    },

    /// A record with this id already exists
    #[error("Duplicate transaction {id}")]
    DuplicateTransaction { id: String },

    /// The operation's state precondition does not hold
    #[error("Transaction {id} is in state {state}, cannot {operation}")]
    InvalidState {
        id: String,
        state: TransactionState,
        operation: String,
    },

    /// The transaction already reached `Completed` or `Failed`
    #[error("Transaction {id} is already terminal ({state})")]
    Terminal { id: String, state: TransactionState },

    /// A message arrived from a DID other than the expected counterpart
    #[error("DID mismatch on transaction {id}: expected {expected}, got {actual}")]
    DidMismatch {
        id: String,
        expected: Did,
        actual: Did,
    },

    /// Amounts disagree (request vs offer, or notes in vs notes out)
    #[error("Amount mismatch on transaction {id}: expected {expected}, got {actual}")]
    AmountMismatch {
        id: String,
        expected: Decimal,
        actual: Decimal,
    },

    /// Wallet cannot cover the requested amount
    #[error("Insufficient funds: available {available}, requested {requested}")]
    InsufficientFunds {
        available: Decimal,
        requested: Decimal,
    },

    /// Amount is zero or negative
    #[error("Invalid amount {amount}")]
    InvalidAmount { amount: Decimal },

    /// The same note id appears twice in one note list
    #[error("Note {note} appears more than once in transaction {id}")]
    DuplicateNote { id: String, note: String },

    /// A note is unknown to the ledger or not owned by the claimed holder
    #[error("Note {note} is not spendable by {owner}")]
    UnknownNote { note: String, owner: Did },

    /// A negotiated deadline has passed
    #[error("Transaction {id} expired at the {stage} stage")]
    Expired { id: String, stage: String },

    /// A required party is not known yet
    #[error("Transaction {id} has no {party} DID")]
    MissingParty { id: String, party: String },

    /// Transport send failed; the transaction stays in its pre-send state
    #[error("Delivery failed: {0}")]
    Delivery(#[from] DeliveryError),

    /// A caller's wait elapsed; the protocol outcome is unknown, not failed
    #[error("Timed out after {waited_ms}ms waiting on {id}")]
    Timeout { id: String, waited_ms: u64 },

    /// Configuration rejected at startup
    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    /// A lock guard was presented for a different key
    #[error("Lock held for {held} cannot be used for {requested}")]
    LockMismatch { held: String, requested: String },
}

// Helper functions for creating common errors

impl ValueTransferError {
    /// Create a TransactionNotFound error
    pub fn transaction_not_found(id: impl ToString, operation: &str) -> Self {
        ValueTransferError::TransactionNotFound {
            id: id.to_string(),
            operation: operation.to_string(),
        }
    }

    /// Create an InvalidState error
    pub fn invalid_state(id: impl ToString, state: TransactionState, operation: &str) -> Self {
        ValueTransferError::InvalidState {
            id: id.to_string(),
            state,
            operation: operation.to_string(),
        }
    }

    /// Create a DidMismatch error
    pub fn did_mismatch(id: impl ToString, expected: &Did, actual: &Did) -> Self {
        ValueTransferError::DidMismatch {
            id: id.to_string(),
            expected: expected.clone(),
            actual: actual.clone(),
        }
    }

    /// Create an AmountMismatch error
    pub fn amount_mismatch(id: impl ToString, expected: Decimal, actual: Decimal) -> Self {
        ValueTransferError::AmountMismatch {
            id: id.to_string(),
            expected,
            actual,
        }
    }

    /// Create an InsufficientFunds error
    pub fn insufficient_funds(available: Decimal, requested: Decimal) -> Self {
        ValueTransferError::InsufficientFunds {
            available,
            requested,
        }
    }

    /// Create an Expired error
    pub fn expired(id: impl ToString, stage: &str) -> Self {
        ValueTransferError::Expired {
            id: id.to_string(),
            stage: stage.to_string(),
        }
    }

    /// Create a MissingParty error
    pub fn missing_party(id: impl ToString, party: &str) -> Self {
        ValueTransferError::MissingParty {
            id: id.to_string(),
            party: party.to_string(),
        }
    }

    /// Create an InvalidConfig error
    pub fn invalid_config(message: impl Into<String>) -> Self {
        ValueTransferError::InvalidConfig {
            message: message.into(),
        }
    }

    /// Problem report code sent to peers when this error fails a transaction
    pub fn problem_code(&self) -> &'static str {
        match self {
            ValueTransferError::DidMismatch { .. } => codes::DID_MISMATCH,
            ValueTransferError::AmountMismatch { .. } => codes::AMOUNT_MISMATCH,
            ValueTransferError::InsufficientFunds { .. } => codes::INSUFFICIENT_FUNDS,
            ValueTransferError::UnknownNote { .. } => codes::UNKNOWN_NOTE,
            ValueTransferError::InvalidAmount { .. } => codes::INVALID_AMOUNT,
            ValueTransferError::DuplicateNote { .. } => codes::DUPLICATE_NOTE,
            ValueTransferError::Expired { .. } => codes::EXPIRED,
            ValueTransferError::InvalidState { .. } | ValueTransferError::Terminal { .. } => {
                codes::INVALID_STATE
            }
            _ => codes::INTERNAL,
        }
    }

    /// Whether this error should fail the transaction it occurred on
    ///
    /// Validation errors are fatal to the transaction; delivery and timeout
    /// errors are surfaced to the caller and leave the transaction untouched.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            ValueTransferError::DidMismatch { .. }
                | ValueTransferError::AmountMismatch { .. }
                | ValueTransferError::InsufficientFunds { .. }
                | ValueTransferError::InvalidAmount { .. }
                | ValueTransferError::DuplicateNote { .. }
                | ValueTransferError::UnknownNote { .. }
                | ValueTransferError::Expired { .. }
                | ValueTransferError::MissingParty { .. }
        )
    }
}
