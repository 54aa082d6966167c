//! Core infrastructure module
//!
//! This module contains the shared components the role coordinators are
//! built on:
//! - `traits` - Trait abstractions for storage and transport
//! - `transaction_store` - Concurrent record store
//! - `party_state` - Lock-guarded wallet state
//! - `lock_manager` - Per-transaction locks
//! - `event_bus` - State-change notifications and completion waits
//! - `transport` - Outbound delivery and the in-process network
//! - `witness_directory` - Witness table cache and gossip

pub mod event_bus;
pub mod lock_manager;
pub mod party_state;
pub mod traits;
pub mod transaction_store;
pub mod transport;
pub mod witness_directory;

pub use event_bus::{EventBus, TransferEvent, DEFAULT_EVENT_CAPACITY};
pub use lock_manager::{LockManager, TransactionGuard};
pub use party_state::PartyStateStore;
pub use traits::{TransactionRepository, TransportChannel, TransportHint};
pub use transaction_store::InMemoryTransactionRepository;
pub use transport::{Envelope, InMemoryNetwork, TransportAdapter};
pub use witness_directory::WitnessDirectory;
