//! The agent capability surface shared by all identity variants.

use crate::agent::group::GroupAgent;
use crate::agent::service::ServiceAgent;
use crate::agent::user::{MonitoringAgent, UserAgent};
use crate::crypto::{self, KeyPair, PublicKeys};
use crate::error::NodeError;
use crate::types::AgentId;
use serde::{Deserialize, Serialize};

/// Whether private key material is currently available
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockState {
    Locked,
    Unlocked,
}

/// Identity variant tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AgentKind {
    User,
    Service,
    Group,
    Monitoring,
}

/// Public identity plus the private key pair while unlocked
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentKeys {
    id: AgentId,
    public: PublicKeys,
    #[serde(skip)]
    private: Option<KeyPair>,
}

impl AgentKeys {
    pub(crate) fn unlocked(pair: KeyPair) -> Self {
        let public = pair.public_keys();
        Self {
            id: AgentId::from_public_key(&public.signing),
            public,
            private: Some(pair),
        }
    }

    pub fn id(&self) -> AgentId {
        self.id
    }

    pub fn public_keys(&self) -> &PublicKeys {
        &self.public
    }

    pub fn is_locked(&self) -> bool {
        self.private.is_none()
    }

    pub(crate) fn lock(&mut self) {
        self.private = None;
    }

    pub(crate) fn key_pair(&self) -> Result<&KeyPair, NodeError> {
        self.private
            .as_ref()
            .ok_or_else(|| NodeError::AccessDenied(format!("agent {} is locked", self.id)))
    }

    /// Install recovered key material after checking it belongs to this identity.
    pub(crate) fn install(&mut self, pair: KeyPair) -> Result<(), NodeError> {
        if pair.public_keys() != self.public {
            return Err(NodeError::AccessDenied(format!(
                "recovered key does not match agent {}",
                self.id
            )));
        }
        self.private = Some(pair);
        Ok(())
    }

    pub(crate) fn locked_copy(&self) -> Self {
        Self {
            id: self.id,
            public: self.public,
            private: None,
        }
    }
}

/// An identity in the mesh
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Agent {
    User(UserAgent),
    Service(ServiceAgent),
    Group(GroupAgent),
    Monitoring(MonitoringAgent),
}

impl Agent {
    pub(crate) fn keys(&self) -> &AgentKeys {
        match self {
            Agent::User(a) => a.keys(),
            Agent::Service(a) => a.keys(),
            Agent::Group(a) => a.keys(),
            Agent::Monitoring(a) => a.keys(),
        }
    }

    pub fn id(&self) -> AgentId {
        self.keys().id()
    }

    pub fn kind(&self) -> AgentKind {
        match self {
            Agent::User(_) => AgentKind::User,
            Agent::Service(_) => AgentKind::Service,
            Agent::Group(_) => AgentKind::Group,
            Agent::Monitoring(_) => AgentKind::Monitoring,
        }
    }

    pub fn public_keys(&self) -> &PublicKeys {
        self.keys().public_keys()
    }

    pub fn is_locked(&self) -> bool {
        self.keys().is_locked()
    }

    pub fn lock_state(&self) -> LockState {
        if self.is_locked() {
            LockState::Locked
        } else {
            LockState::Unlocked
        }
    }

    pub fn lock(&mut self) {
        match self {
            Agent::User(a) => a.lock(),
            Agent::Service(a) => a.lock(),
            Agent::Group(a) => a.lock(),
            Agent::Monitoring(a) => a.lock(),
        }
    }

    /// Unlock a passphrase agent. Groups are unlocked through a member instead.
    pub fn unlock(&mut self, passphrase: &str) -> Result<(), NodeError> {
        match self {
            Agent::User(a) => a.unlock(passphrase),
            Agent::Service(a) => a.unlock(passphrase),
            Agent::Monitoring(a) => a.unlock(passphrase),
            Agent::Group(g) => Err(NodeError::InvalidArgument(format!(
                "group {} is unlocked through a member, not a passphrase",
                g.id()
            ))),
        }
    }

    /// Passphrase remembered from the last successful unlock, if any.
    pub fn passphrase(&self) -> Option<&str> {
        match self {
            Agent::User(a) => a.passphrase(),
            Agent::Service(a) => a.passphrase(),
            Agent::Monitoring(a) => a.passphrase(),
            Agent::Group(_) => None,
        }
    }

    pub fn is_passphrase_agent(&self) -> bool {
        !matches!(self, Agent::Group(_))
    }

    /// Read access to the private key pair; fails while locked.
    pub fn key_pair(&self) -> Result<&KeyPair, NodeError> {
        self.keys().key_pair()
    }

    pub fn sign(&self, message: &[u8]) -> Result<Vec<u8>, NodeError> {
        Ok(self.key_pair()?.sign(message))
    }

    pub fn verify(&self, message: &[u8], signature: &[u8]) -> Result<(), NodeError> {
        crypto::verify(self.public_keys(), message, signature).map_err(NodeError::from)
    }

    /// A copy without private key material and without any live instance.
    pub fn clone_locked(&self) -> Agent {
        match self {
            Agent::User(a) => Agent::User(a.locked_copy()),
            Agent::Service(a) => Agent::Service(a.locked_copy()),
            Agent::Group(a) => Agent::Group(a.locked_copy()),
            Agent::Monitoring(a) => Agent::Monitoring(a.locked_copy()),
        }
    }

    /// A copy in the current lock state. Used where a node caches a live
    /// agent; everything handed out beyond the node goes through
    /// [`clone_locked`](Self::clone_locked).
    pub fn clone_preserving_lock_state(&self) -> Agent {
        self.clone()
    }

    pub fn as_user(&self) -> Option<&UserAgent> {
        match self {
            Agent::User(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_user_mut(&mut self) -> Option<&mut UserAgent> {
        match self {
            Agent::User(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_group(&self) -> Option<&GroupAgent> {
        match self {
            Agent::Group(g) => Some(g),
            _ => None,
        }
    }

    pub fn as_group_mut(&mut self) -> Option<&mut GroupAgent> {
        match self {
            Agent::Group(g) => Some(g),
            _ => None,
        }
    }

    pub fn as_service(&self) -> Option<&ServiceAgent> {
        match self {
            Agent::Service(s) => Some(s),
            _ => None,
        }
    }
}

impl From<UserAgent> for Agent {
    fn from(agent: UserAgent) -> Self {
        Agent::User(agent)
    }
}

impl From<GroupAgent> for Agent {
    fn from(agent: GroupAgent) -> Self {
        Agent::Group(agent)
    }
}

impl From<ServiceAgent> for Agent {
    fn from(agent: ServiceAgent) -> Self {
        Agent::Service(agent)
    }
}

impl From<MonitoringAgent> for Agent {
    fn from(agent: MonitoringAgent) -> Self {
        Agent::Monitoring(agent)
    }
}
