//! Core identifier types for the agent mesh.

use serde::{Deserialize, Serialize};
use std::fmt;

/// AgentId: numeric identity derived from an agent's public signing key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AgentId(pub u64);

impl AgentId {
    /// Derive the id from the public signing key (first 8 bytes of its blake3 hash).
    pub fn from_public_key(signing_key: &[u8; 32]) -> Self {
        let hash = blake3::hash(signing_key);
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&hash.as_bytes()[..8]);
        AgentId(u64::from_be_bytes(prefix))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0.to_be_bytes())
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// NodeId: handle of a peer node in the overlay
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u64);

impl NodeId {
    pub fn random() -> Self {
        NodeId(rand::random())
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node-{}", hex::encode(self.0.to_be_bytes()))
    }
}

/// MessageId: random id of a single message
pub type MessageId = u64;

/// TopicId: numeric topic handle for broadcast fan-out
pub type TopicId = u64;

/// Wall-clock milliseconds since the unix epoch.
pub fn now_millis() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}
