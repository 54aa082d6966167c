//! Witness table types
//!
//! The witness table maps each known witness DID to its routing metadata.
//! It is exchanged by the gossip layer and always replaced as a whole.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::transaction::Did;

/// Routing metadata for one witness
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WitnessInfo {
    pub did: Did,
    pub label: Option<String>,
    /// Transport endpoints the witness can be reached on
    #[serde(default)]
    pub endpoints: Vec<String>,
}

impl WitnessInfo {
    pub fn new(did: Did) -> Self {
        WitnessInfo {
            did,
            label: None,
            endpoints: Vec::new(),
        }
    }
}

/// Known witnesses keyed by DID
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WitnessTable {
    pub entries: BTreeMap<Did, WitnessInfo>,
}

impl WitnessTable {
    pub fn from_entries(entries: impl IntoIterator<Item = WitnessInfo>) -> Self {
        WitnessTable {
            entries: entries.into_iter().map(|e| (e.did.clone(), e)).collect(),
        }
    }

    pub fn get(&self, did: &Did) -> Option<&WitnessInfo> {
        self.entries.get(did)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
