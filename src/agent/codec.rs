//! Serialized form of agents.

use crate::agent::Agent;
use crate::error::NodeError;

/// Converts agents to and from bytes. Decoded agents are always locked, and
/// the encoding never carries cleartext private keys.
pub trait AgentCodec: Send + Sync {
    fn encode(&self, agent: &Agent) -> Result<Vec<u8>, NodeError>;
    fn decode(&self, bytes: &[u8]) -> Result<Agent, NodeError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonAgentCodec;

impl AgentCodec for JsonAgentCodec {
    fn encode(&self, agent: &Agent) -> Result<Vec<u8>, NodeError> {
        Ok(serde_json::to_vec(&agent.clone_locked())?)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Agent, NodeError> {
        let agent: Agent = serde_json::from_slice(bytes)?;
        Ok(agent.clone_locked())
    }
}
