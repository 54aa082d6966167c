//! Agent configuration
//!
//! Controls which witness is used by default, which inbound requests and
//! offers are accepted without caller confirmation, and how long callers wait
//! on protocol completion.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::core::{TransportHint, DEFAULT_EVENT_CAPACITY};
use crate::types::{Did, ValueTransferError};

/// Default wait for a transaction to reach a terminal state
pub const DEFAULT_TERMINAL_WAIT_MS: u64 = 120_000;

/// Default wait for a witness to confirm a mint
pub const DEFAULT_MINT_WAIT_MS: u64 = 20_000;

/// Whether an inbound request or offer is accepted without the caller
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AutoAccept {
    #[default]
    Never,
    Always,
}

impl AutoAccept {
    pub fn is_always(self) -> bool {
        self == AutoAccept::Always
    }
}

/// Configuration of one agent instance
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AgentConfig {
    /// DID of this agent
    pub did: Did,

    /// Default witness when an operation does not name one
    #[serde(default)]
    pub witness_did: Option<Did>,

    /// Giver side: accept inbound payment requests automatically
    #[serde(default)]
    pub auto_accept_payment_request: AutoAccept,

    /// Getter side: accept inbound payment offers automatically
    #[serde(default)]
    pub auto_accept_payment_offer: AutoAccept,

    /// Giver side: accept a request that answers one of our own offers
    #[serde(default = "default_offered_request")]
    pub auto_accept_offered_payment_request: AutoAccept,

    /// Per-transaction locking; disabling is only safe in single-threaded harnesses
    #[serde(default = "default_true")]
    pub lock_transactions: bool,

    /// Whether this agent notarizes transfers and mints as a witness
    #[serde(default)]
    pub is_witness: bool,

    #[serde(default = "default_unit")]
    pub unit_of_amount: String,

    #[serde(default)]
    pub default_transport: Option<TransportHint>,

    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,

    #[serde(default = "default_terminal_wait_ms")]
    pub terminal_wait_ms: u64,

    #[serde(default = "default_mint_wait_ms")]
    pub mint_wait_ms: u64,
}

fn default_offered_request() -> AutoAccept {
    AutoAccept::Always
}

fn default_true() -> bool {
    true
}

fn default_unit() -> String {
    "credit".to_string()
}

fn default_event_capacity() -> usize {
    DEFAULT_EVENT_CAPACITY
}

fn default_terminal_wait_ms() -> u64 {
    DEFAULT_TERMINAL_WAIT_MS
}

fn default_mint_wait_ms() -> u64 {
    DEFAULT_MINT_WAIT_MS
}

impl AgentConfig {
    /// Create a configuration with defaults for everything but the DID
    pub fn new(did: impl Into<Did>) -> Self {
        AgentConfig {
            did: did.into(),
            witness_did: None,
            auto_accept_payment_request: AutoAccept::Never,
            auto_accept_payment_offer: AutoAccept::Never,
            auto_accept_offered_payment_request: default_offered_request(),
            lock_transactions: true,
            is_witness: false,
            unit_of_amount: default_unit(),
            default_transport: None,
            event_capacity: DEFAULT_EVENT_CAPACITY,
            terminal_wait_ms: DEFAULT_TERMINAL_WAIT_MS,
            mint_wait_ms: DEFAULT_MINT_WAIT_MS,
        }
    }

    pub fn with_witness(mut self, witness: impl Into<Did>) -> Self {
        self.witness_did = Some(witness.into());
        self
    }

    pub fn as_witness(mut self) -> Self {
        self.is_witness = true;
        self
    }

    pub fn terminal_wait(&self) -> Duration {
        Duration::from_millis(self.terminal_wait_ms)
    }

    pub fn mint_wait(&self) -> Duration {
        Duration::from_millis(self.mint_wait_ms)
    }

    /// Check the configuration before an agent is built
    ///
    /// Invalid configuration is a programmer error and is reported, never
    /// silently corrected.
    pub fn validate(&self) -> Result<(), ValueTransferError> {
        if !self.did.as_str().starts_with("did:") {
            return Err(ValueTransferError::invalid_config(format!(
                "agent DID '{}' is not a DID",
                self.did
            )));
        }
        if let Some(witness) = &self.witness_did {
            if !witness.as_str().starts_with("did:") {
                return Err(ValueTransferError::invalid_config(format!(
                    "witness DID '{}' is not a DID",
                    witness
                )));
            }
        }
        if self.unit_of_amount.trim().is_empty() {
            return Err(ValueTransferError::invalid_config("unit_of_amount is empty"));
        }
        if self.event_capacity == 0 {
            return Err(ValueTransferError::invalid_config("event_capacity must be positive"));
        }
        if !self.lock_transactions {
            warn!(did = %self.did, "lock_transactions is off; concurrent delivery is unsafe");
        }
        Ok(())
    }
}

impl From<&str> for AgentConfig {
    fn from(did: &str) -> Self {
        AgentConfig::new(did)
    }
}
