//! Types module
//!
//! Contains core data structures used throughout the crate.
//! This module organizes types into logical submodules:
//! - `transaction`: identifiers, the shared state machine and `Transaction`
//! - `record`: the persisted `ValueTransferRecord`
//! - `note`: notes and the per-wallet `PartyState`
//! - `message`: protocol messages
//! - `witness_table`: gossip table of known witnesses
//! - `error`: error types for the protocol core

pub mod error;
pub mod message;
pub mod note;
pub mod record;
pub mod transaction;
pub mod witness_table;

pub use error::{DeliveryError, ValueTransferError};
pub use message::{
    codes, CashAcceptance, CashRemoval, MessageBody, MintRequest, MintResponse, PaymentOffer,
    PaymentRequest, ProblemReport, ProtocolMessage, Receipt, RequestAcceptance,
    WitnessedAcceptance, WitnessedCash,
};
pub use note::{check_notes, total_value, Note, OwnedNote, PartyState};
pub use record::ValueTransferRecord;
pub use transaction::{
    Did, ProblemError, Role, Timeouts, Transaction, TransactionId, TransactionState,
};
pub use witness_table::{WitnessInfo, WitnessTable};
