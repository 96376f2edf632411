//! Agents persisted as signed, unencrypted envelopes.

use crate::agent::codec::AgentCodec;
use crate::agent::storage::AgentStorage;
use crate::agent::Agent;
use crate::envelope::{EnvelopeStore, ReaderChange};
use crate::error::NodeError;
use crate::types::AgentId;
use std::sync::Arc;
use tracing::info;

const AGENT_PREFIX: &str = "AGENT-";

/// Network-visible agent directory backed by the envelope store.
pub struct EnvelopeAgentRepository {
    envelopes: Arc<EnvelopeStore>,
    codec: Arc<dyn AgentCodec>,
}

impl EnvelopeAgentRepository {
    pub fn new(envelopes: Arc<EnvelopeStore>, codec: Arc<dyn AgentCodec>) -> Self {
        Self { envelopes, codec }
    }

    fn identifier(id: AgentId) -> String {
        format!("{}{}", AGENT_PREFIX, id)
    }

    /// Publish a new agent. The agent signs its own record, so it must be
    /// unlocked.
    pub fn store_agent(&self, agent: &Agent) -> Result<(), NodeError> {
        agent.key_pair()?;
        let envelope = self
            .envelopes
            .create_unencrypted_envelope(&Self::identifier(agent.id()), &self.codec.encode(agent)?);
        match self.envelopes.store(envelope, agent) {
            Err(NodeError::Collision(_)) => Err(NodeError::AlreadyRegistered(agent.id())),
            Err(e) => Err(e),
            Ok(_) => {
                info!(agent_id = %agent.id(), kind = ?agent.kind(), "Stored agent");
                Ok(())
            }
        }
    }

    /// Replace a stored agent with a new version. Only the agent itself may
    /// sign the update.
    pub fn update_agent(&self, agent: &Agent) -> Result<(), NodeError> {
        agent.key_pair()?;
        let previous = match self.envelopes.fetch(&Self::identifier(agent.id())) {
            Err(NodeError::EnvelopeNotFound(_)) => {
                return Err(NodeError::IdentityNotFound(agent.id().to_string()))
            }
            other => other?,
        };
        let next = self.envelopes.create_next_version(
            &previous,
            &self.codec.encode(agent)?,
            ReaderChange::Inherit,
        )?;
        self.envelopes.store(next, agent)?;
        info!(agent_id = %agent.id(), "Updated agent");
        Ok(())
    }
}

impl AgentStorage for EnvelopeAgentRepository {
    fn get_agent(&self, id: AgentId) -> Result<Agent, NodeError> {
        let envelope = match self.envelopes.fetch(&Self::identifier(id)) {
            Err(NodeError::EnvelopeNotFound(_)) => {
                return Err(NodeError::IdentityNotFound(id.to_string()))
            }
            other => other?,
        };
        if envelope.signature().map(|s| s.signer) != Some(id) {
            return Err(NodeError::Serialization(format!(
                "record of agent {} is not self-signed",
                id
            )));
        }
        let bytes = envelope.plain_content().ok_or_else(|| {
            NodeError::Serialization(format!("record of agent {} is encrypted", id))
        })?;
        let agent = self.codec.decode(bytes)?;
        if agent.id() != id {
            return Err(NodeError::Serialization(format!(
                "record for {} decodes to agent {}",
                id,
                agent.id()
            )));
        }
        Ok(agent)
    }

    fn has_agent(&self, id: AgentId) -> bool {
        self.envelopes.fetch(&Self::identifier(id)).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{JsonAgentCodec, UserAgent};
    use crate::crypto::KdfParams;
    use crate::envelope::MemoryStore;

    fn repository() -> EnvelopeAgentRepository {
        EnvelopeAgentRepository::new(
            Arc::new(EnvelopeStore::new(Arc::new(MemoryStore::new()))),
            Arc::new(JsonAgentCodec),
        )
    }

    fn user() -> UserAgent {
        UserAgent::create_with_kdf("pass", KdfParams::new(256, 1, 1)).unwrap()
    }

    #[test]
    fn test_store_and_get() {
        let repo = repository();
        let agent: Agent = user().into();
        repo.store_agent(&agent).unwrap();

        assert!(repo.has_agent(agent.id()));
        let fetched = repo.get_agent(agent.id()).unwrap();
        assert!(fetched.is_locked());
        assert_eq!(fetched.id(), agent.id());
    }

    #[test]
    fn test_duplicate_store_is_rejected() {
        let repo = repository();
        let agent: Agent = user().into();
        repo.store_agent(&agent).unwrap();
        assert!(matches!(
            repo.store_agent(&agent),
            Err(NodeError::AlreadyRegistered(_))
        ));
    }

    #[test]
    fn test_locked_agent_cannot_be_stored() {
        let repo = repository();
        let agent: Agent = user().into();
        assert!(matches!(
            repo.store_agent(&agent.clone_locked()),
            Err(NodeError::AccessDenied(_))
        ));
    }

    #[test]
    fn test_update_agent() {
        let repo = repository();
        let mut user = user();
        let id = user.id();
        repo.store_agent(&Agent::from(user.clone())).unwrap();

        user.set_login("alice").unwrap();
        repo.update_agent(&Agent::from(user)).unwrap();
        let fetched = repo.get_agent(id).unwrap();
        assert_eq!(fetched.as_user().unwrap().login(), Some("alice"));
    }

    #[test]
    fn test_unknown_agent() {
        assert!(matches!(
            repository().get_agent(AgentId(7)),
            Err(NodeError::IdentityNotFound(_))
        ));
    }
}
