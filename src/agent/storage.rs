//! Agent storage: lookup of agents by id.

use crate::agent::Agent;
use crate::error::NodeError;
use crate::types::AgentId;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Read port for agents. Implementations always hand out locked copies.
pub trait AgentStorage: Send + Sync {
    fn get_agent(&self, id: AgentId) -> Result<Agent, NodeError>;
    fn has_agent(&self, id: AgentId) -> bool;
}

/// In-memory agent cache with an optional backing storage.
///
/// Registered agents are kept as locked clones, so unlocking a fetched copy
/// never affects the cached one.
#[derive(Default)]
pub struct BasicAgentStorage {
    agents: RwLock<HashMap<AgentId, Agent>>,
    backup: Option<Arc<dyn AgentStorage>>,
}

impl BasicAgentStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_backup(backup: Arc<dyn AgentStorage>) -> Self {
        Self {
            agents: RwLock::new(HashMap::new()),
            backup: Some(backup),
        }
    }

    pub fn register_agent(&self, agent: &Agent) {
        self.agents.write().insert(agent.id(), agent.clone_locked());
    }

    pub fn unregister_agent(&self, id: AgentId) -> bool {
        self.agents.write().remove(&id).is_some()
    }

    pub fn len(&self) -> usize {
        self.agents.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl AgentStorage for BasicAgentStorage {
    fn get_agent(&self, id: AgentId) -> Result<Agent, NodeError> {
        if let Some(agent) = self.agents.read().get(&id) {
            return Ok(agent.clone_locked());
        }
        match &self.backup {
            Some(backup) => backup.get_agent(id),
            None => Err(NodeError::IdentityNotFound(id.to_string())),
        }
    }

    fn has_agent(&self, id: AgentId) -> bool {
        self.agents.read().contains_key(&id)
            || self.backup.as_ref().is_some_and(|b| b.has_agent(id))
    }
}
