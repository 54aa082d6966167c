//! Value Transfer Protocol Library
//! # Overview
//!
//! This library coordinates peer-to-peer transfers of digital cash between
//! DID-identified agents. A transfer is notarized by a witness, which is the
//! only party allowed to move note ownership.
//!
//! # Architecture
//!
//! The system is organized into several key components:
//!
//! - [`types`] - Core data types (Transaction, Note, ProtocolMessage, etc.)
//! - [`core`] - Shared infrastructure:
//!   - [`core::transaction_store`] - Records keyed by transaction id
//!   - [`core::lock_manager`] - Per-transaction mutual exclusion
//!   - [`core::party_state`] - Lock-guarded wallet state
//!   - [`core::event_bus`] - State-change notifications and completion waits
//!   - [`core::transport`] - Outbound delivery and the in-process network
//!   - [`core::witness_directory`] - Witness table cache and gossip
//! - [`roles`] - One coordinator per protocol role
//! - [`agent`] - The per-participant facade routing inbound messages
//! - [`config`] - Agent configuration
//! - [`logging`] - `tracing` subscriber setup
//!
//! # Roles
//!
//! - **Getter**: Requests value (or accepts an offer) and accepts the cash
//! - **Giver**: Commits notes from its wallet to pay a request
//! - **Witness**: Validates and moves notes, issues receipts, records mints
//! - **Issuer**: Mints new notes through a witness
//!
//! # Happy Path
//!
//! ```text
//! Getter ── Request ──────────────────► Witness, Giver
//! Giver  ── RequestAccepted ──────────► Witness
//! Witness ─ RequestAcceptedWitnessed ─► Getter
//! Getter ── CashAccepted ─────────────► Witness
//! Witness ─ CashAcceptedWitnessed, CashRemoved, GiverReceipt ─► Giver
//! Witness ─ GetterReceipt ────────────► Getter
//! ```

pub mod agent;
pub mod config;
pub mod core;
pub mod logging;
pub mod roles;
pub mod types;

pub use agent::Agent;
pub use config::{AgentConfig, AutoAccept};
pub use core::{
    InMemoryNetwork, InMemoryTransactionRepository, TransactionRepository, TransferEvent,
    TransportChannel, TransportHint,
};
pub use logging::{init_logging, LogFormat};
pub use types::{
    Did, MessageBody, Note, ProtocolMessage, Role, Timeouts, TransactionId, TransactionState,
    ValueTransferError, ValueTransferRecord,
};
