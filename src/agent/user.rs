//! User and monitoring agents.

use crate::agent::identity::AgentKeys;
use crate::agent::passphrase::PassphraseKeys;
use crate::crypto::KdfParams;
use crate::error::NodeError;
use crate::types::AgentId;
use serde::{Deserialize, Serialize};

/// Login reserved for the node's anonymous agent
pub const ANONYMOUS_LOGIN: &str = "anonymous";
pub const ANONYMOUS_PASSPHRASE: &str = "anonymous";

const MIN_LOGIN_LEN: usize = 4;

/// A human user of the mesh
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserAgent {
    keys: PassphraseKeys,
    login: Option<String>,
    email: Option<String>,
    #[serde(default)]
    user_data: Option<serde_json::Value>,
}

impl UserAgent {
    /// Create an unlocked user with a fresh key pair.
    pub fn create(passphrase: &str) -> Result<Self, NodeError> {
        Self::create_with_kdf(passphrase, KdfParams::default())
    }

    pub fn create_with_kdf(passphrase: &str, kdf: KdfParams) -> Result<Self, NodeError> {
        Ok(Self {
            keys: PassphraseKeys::generate(passphrase, kdf)?,
            login: None,
            email: None,
            user_data: None,
        })
    }

    /// The unlocked anonymous user every node hands out.
    pub fn anonymous(kdf: KdfParams) -> Result<Self, NodeError> {
        let mut agent = Self::create_with_kdf(ANONYMOUS_PASSPHRASE, kdf)?;
        agent.login = Some(ANONYMOUS_LOGIN.to_string());
        Ok(agent)
    }

    pub(crate) fn keys(&self) -> &AgentKeys {
        self.keys.keys()
    }

    pub fn id(&self) -> AgentId {
        self.keys().id()
    }

    pub fn is_locked(&self) -> bool {
        self.keys().is_locked()
    }

    pub fn unlock(&mut self, passphrase: &str) -> Result<(), NodeError> {
        self.keys.unlock(passphrase)
    }

    pub fn lock(&mut self) {
        self.keys.lock();
    }

    pub fn passphrase(&self) -> Option<&str> {
        self.keys.passphrase()
    }

    pub fn change_passphrase(&mut self, passphrase: &str) -> Result<(), NodeError> {
        self.keys.change_passphrase(passphrase)
    }

    pub fn login(&self) -> Option<&str> {
        self.login.as_deref()
    }

    pub fn email(&self) -> Option<&str> {
        self.email.as_deref()
    }

    pub fn user_data(&self) -> Option<&serde_json::Value> {
        self.user_data.as_ref()
    }

    pub fn is_anonymous(&self) -> bool {
        self.login.as_deref() == Some(ANONYMOUS_LOGIN)
    }

    pub fn set_login(&mut self, login: &str) -> Result<(), NodeError> {
        self.require_unlocked()?;
        if login.chars().count() < MIN_LOGIN_LEN {
            return Err(NodeError::InvalidArgument(format!(
                "login must be at least {} characters",
                MIN_LOGIN_LEN
            )));
        }
        if !login.chars().next().is_some_and(|c| c.is_ascii_alphabetic()) {
            return Err(NodeError::InvalidArgument(
                "login must start with a letter".to_string(),
            ));
        }
        if login.eq_ignore_ascii_case(ANONYMOUS_LOGIN) {
            return Err(NodeError::InvalidArgument(format!(
                "login '{}' is reserved",
                ANONYMOUS_LOGIN
            )));
        }
        self.login = Some(login.to_string());
        Ok(())
    }

    pub fn set_email(&mut self, email: &str) -> Result<(), NodeError> {
        self.require_unlocked()?;
        let valid = match email.split_once('@') {
            Some((local, domain)) => {
                !local.is_empty()
                    && !domain.is_empty()
                    && !domain.contains('@')
                    && !email.chars().any(char::is_whitespace)
            }
            None => false,
        };
        if !valid {
            return Err(NodeError::InvalidArgument(format!(
                "'{}' is not a valid email address",
                email
            )));
        }
        self.email = Some(email.to_lowercase());
        Ok(())
    }

    pub fn set_user_data(&mut self, data: serde_json::Value) -> Result<(), NodeError> {
        self.require_unlocked()?;
        self.user_data = Some(data);
        Ok(())
    }

    fn require_unlocked(&self) -> Result<(), NodeError> {
        self.keys().key_pair().map(|_| ())
    }

    pub(crate) fn locked_copy(&self) -> Self {
        Self {
            keys: self.keys.locked_copy(),
            login: self.login.clone(),
            email: self.email.clone(),
            user_data: self.user_data.clone(),
        }
    }
}

/// Agent used by monitoring observers to report node events
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringAgent {
    keys: PassphraseKeys,
}

impl MonitoringAgent {
    pub fn create(passphrase: &str) -> Result<Self, NodeError> {
        Self::create_with_kdf(passphrase, KdfParams::default())
    }

    pub fn create_with_kdf(passphrase: &str, kdf: KdfParams) -> Result<Self, NodeError> {
        Ok(Self {
            keys: PassphraseKeys::generate(passphrase, kdf)?,
        })
    }

    pub(crate) fn keys(&self) -> &AgentKeys {
        self.keys.keys()
    }

    pub fn id(&self) -> AgentId {
        self.keys().id()
    }

    pub fn unlock(&mut self, passphrase: &str) -> Result<(), NodeError> {
        self.keys.unlock(passphrase)
    }

    pub fn lock(&mut self) {
        self.keys.lock();
    }

    pub fn passphrase(&self) -> Option<&str> {
        self.keys.passphrase()
    }

    pub(crate) fn locked_copy(&self) -> Self {
        Self {
            keys: self.keys.locked_copy(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::Agent;

    fn kdf() -> KdfParams {
        KdfParams::new(256, 1, 1)
    }

    #[test]
    fn test_lock_and_unlock() {
        let mut agent: Agent = UserAgent::create_with_kdf("secret", kdf()).unwrap().into();
        assert!(!agent.is_locked());
        assert!(agent.sign(b"data").is_ok());

        agent.lock();
        assert!(agent.is_locked());
        assert!(matches!(agent.key_pair(), Err(NodeError::AccessDenied(_))));
        assert!(matches!(agent.sign(b"data"), Err(NodeError::AccessDenied(_))));

        agent.unlock("secret").unwrap();
        assert!(!agent.is_locked());
    }

    #[test]
    fn test_wrong_passphrase_leaves_agent_locked() {
        let mut agent: Agent = UserAgent::create_with_kdf("secret", kdf()).unwrap().into();
        agent.lock();
        assert!(matches!(agent.unlock("guess"), Err(NodeError::AccessDenied(_))));
        assert!(agent.is_locked());
        assert!(agent.passphrase().is_none());
    }

    #[test]
    fn test_clone_locked_has_no_private_material() {
        let agent: Agent = UserAgent::create_with_kdf("secret", kdf()).unwrap().into();
        let copy = agent.clone_locked();
        assert!(copy.is_locked());
        assert_eq!(copy.id(), agent.id());
        assert!(!agent.is_locked());
        assert!(!agent.clone_preserving_lock_state().is_locked());
    }

    #[test]
    fn test_signature_verifies_on_locked_copy() {
        let agent: Agent = UserAgent::create_with_kdf("secret", kdf()).unwrap().into();
        let sig = agent.sign(b"payload").unwrap();
        assert!(agent.clone_locked().verify(b"payload", &sig).is_ok());
    }

    #[test]
    fn test_setters_require_unlock() {
        let mut user = UserAgent::create_with_kdf("secret", kdf()).unwrap();
        user.lock();
        assert!(matches!(user.set_login("alice"), Err(NodeError::AccessDenied(_))));
        assert!(matches!(
            user.set_email("a@example.org"),
            Err(NodeError::AccessDenied(_))
        ));
    }

    #[test]
    fn test_login_validation() {
        let mut user = UserAgent::create_with_kdf("secret", kdf()).unwrap();
        assert!(user.set_login("abc").is_err());
        assert!(user.set_login("1abcd").is_err());
        assert!(user.set_login("Anonymous").is_err());
        user.set_login("alice").unwrap();
        assert_eq!(user.login(), Some("alice"));
    }

    #[test]
    fn test_email_is_lowercased() {
        let mut user = UserAgent::create_with_kdf("secret", kdf()).unwrap();
        assert!(user.set_email("not-an-address").is_err());
        user.set_email("Alice@Example.ORG").unwrap();
        assert_eq!(user.email(), Some("alice@example.org"));
    }

    #[test]
    fn test_passphrase_change() {
        let mut user = UserAgent::create_with_kdf("old", kdf()).unwrap();
        user.change_passphrase("new").unwrap();
        user.lock();
        assert!(user.unlock("old").is_err());
        user.unlock("new").unwrap();
    }
}
