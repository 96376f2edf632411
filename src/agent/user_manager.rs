//! Login name and email lookup for user agents.
//!
//! Each claimed login or email is an unencrypted envelope whose content is
//! the owning agent's id. The first writer of an identifier wins; any other
//! agent claiming it afterwards gets a `Collision`.

use crate::agent::user::ANONYMOUS_LOGIN;
use crate::agent::Agent;
use crate::envelope::EnvelopeStore;
use crate::error::NodeError;
use crate::types::AgentId;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, warn};

const LOGIN_PREFIX: &str = "USER_NAME-";
const EMAIL_PREFIX: &str = "USER_MAIL-";

/// Identifiers newly claimed by one registration.
#[derive(Debug, Default)]
pub struct UserClaims(Vec<String>);

impl UserClaims {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

pub struct UserAgentManager {
    envelopes: Arc<EnvelopeStore>,
    anonymous: RwLock<Option<AgentId>>,
}

impl UserAgentManager {
    pub fn new(envelopes: Arc<EnvelopeStore>) -> Self {
        Self {
            envelopes,
            anonymous: RwLock::new(None),
        }
    }

    pub fn set_anonymous(&self, id: AgentId) {
        *self.anonymous.write() = Some(id);
    }

    /// Claim the login and email of a user agent. Non-user agents and users
    /// without either are accepted as no-ops. Returns the identifiers this
    /// call claimed; a failed claim releases the ones before it.
    pub fn register_user_agent(&self, agent: &Agent) -> Result<UserClaims, NodeError> {
        let mut claims = UserClaims::default();
        let Some(user) = agent.as_user() else {
            return Ok(claims);
        };
        if user.is_anonymous() {
            return Ok(claims);
        }
        agent.key_pair()?;
        let wanted = [
            user.login().map(|login| (Self::login_identifier(login), "login name")),
            user.email().map(|email| (Self::email_identifier(email), "email")),
        ];
        for (identifier, what) in wanted.into_iter().flatten() {
            match self.claim(&identifier, agent, what) {
                Ok(true) => claims.0.push(identifier),
                Ok(false) => {}
                Err(e) => {
                    self.release(claims);
                    return Err(e);
                }
            }
        }
        Ok(claims)
    }

    /// Give back identifiers claimed by a registration that did not complete.
    pub fn release(&self, claims: UserClaims) {
        for identifier in claims.0 {
            match self.envelopes.remove(&identifier) {
                Ok(()) => debug!(identifier = %identifier, "Released user identifier"),
                Err(e) => warn!(identifier = %identifier, error = %e, "Failed to release user identifier"),
            }
        }
    }

    /// Returns whether `identifier` was newly claimed.
    fn claim(&self, identifier: &str, agent: &Agent, what: &str) -> Result<bool, NodeError> {
        match self.owner_of(identifier) {
            Ok(owner) if owner == agent.id() => return Ok(false),
            Ok(owner) => {
                return Err(NodeError::Collision(format!(
                    "{} already registered by agent {}",
                    what, owner
                )))
            }
            Err(NodeError::EnvelopeNotFound(_)) => {}
            Err(e) => return Err(e),
        }
        let envelope = self
            .envelopes
            .create_unencrypted_envelope(identifier, &agent.id().0.to_be_bytes());
        match self.envelopes.store(envelope, agent) {
            Ok(_) => {
                debug!(identifier, agent_id = %agent.id(), "Claimed user identifier");
                Ok(true)
            }
            Err(NodeError::Collision(_)) => Err(NodeError::Collision(format!(
                "{} was claimed concurrently",
                what
            ))),
            Err(e) => Err(e),
        }
    }

    fn owner_of(&self, identifier: &str) -> Result<AgentId, NodeError> {
        let envelope = self.envelopes.fetch(identifier)?;
        let bytes: [u8; 8] = envelope
            .plain_content()
            .and_then(|c| c.try_into().ok())
            .ok_or_else(|| {
                NodeError::Serialization(format!("malformed user registration '{}'", identifier))
            })?;
        Ok(AgentId(u64::from_be_bytes(bytes)))
    }

    pub fn get_agent_id_by_login(&self, login: &str) -> Result<AgentId, NodeError> {
        if login.eq_ignore_ascii_case(ANONYMOUS_LOGIN) {
            if let Some(id) = *self.anonymous.read() {
                return Ok(id);
            }
        }
        self.owner_of(&Self::login_identifier(login))
            .map_err(|e| Self::not_found(e, login))
    }

    pub fn get_agent_id_by_email(&self, email: &str) -> Result<AgentId, NodeError> {
        self.owner_of(&Self::email_identifier(email))
            .map_err(|e| Self::not_found(e, email))
    }

    fn not_found(err: NodeError, key: &str) -> NodeError {
        match err {
            NodeError::EnvelopeNotFound(_) => NodeError::IdentityNotFound(key.to_string()),
            other => other,
        }
    }

    fn login_identifier(login: &str) -> String {
        format!("{}{}", LOGIN_PREFIX, login.to_lowercase())
    }

    fn email_identifier(email: &str) -> String {
        format!("{}{}", EMAIL_PREFIX, email.to_lowercase())
    }
}
