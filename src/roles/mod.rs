//! Role coordinators
//!
//! One coordinator per protocol role, all sharing the mechanics in `party`:
//! - `getter` - Requests value and accepts witnessed cash
//! - `giver` - Answers requests, commits notes and settles its wallet
//! - `witness` - Validates and moves notes, issues receipts, records mints
//! - `issuer` - Mints new notes through a witness

pub mod getter;
pub mod giver;
pub mod issuer;
pub mod party;
pub mod witness;

pub use getter::GetterCoordinator;
pub use giver::GiverCoordinator;
pub use issuer::IssuerCoordinator;
pub use party::{CoordinatorContext, PartyCoordinator};
pub use witness::WitnessCoordinator;
