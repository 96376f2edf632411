//! Passphrase-sealed key material shared by user, monitoring and service agents.

use crate::agent::identity::AgentKeys;
use crate::crypto::{self, KdfParams, KeyPair, SealedKey};
use crate::error::NodeError;
use serde::{Deserialize, Serialize};
use tracing::debug;
use zeroize::Zeroizing;

#[derive(Clone, Serialize, Deserialize)]
pub struct PassphraseKeys {
    keys: AgentKeys,
    sealed: SealedKey,
    #[serde(skip)]
    passphrase: Option<Zeroizing<String>>,
}

impl std::fmt::Debug for PassphraseKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PassphraseKeys")
            .field("keys", &self.keys)
            .field("kdf", &self.sealed.kdf)
            .finish_non_exhaustive()
    }
}

impl PassphraseKeys {
    /// Generate a fresh key pair sealed under `passphrase`. The result is unlocked.
    pub fn generate(passphrase: &str, kdf: KdfParams) -> Result<Self, NodeError> {
        let pair = KeyPair::generate();
        let sealed = crypto::seal_with_passphrase(&pair.secret_bytes(), passphrase, kdf)?;
        Ok(Self {
            keys: AgentKeys::unlocked(pair),
            sealed,
            passphrase: Some(Zeroizing::new(passphrase.to_string())),
        })
    }

    pub fn keys(&self) -> &AgentKeys {
        &self.keys
    }

    pub fn unlock(&mut self, passphrase: &str) -> Result<(), NodeError> {
        let secret = crypto::open_with_passphrase(&self.sealed, passphrase).map_err(|_| {
            NodeError::AccessDenied(format!("wrong passphrase for agent {}", self.keys.id()))
        })?;
        self.keys.install(KeyPair::from_secret_bytes(&secret))?;
        self.passphrase = Some(Zeroizing::new(passphrase.to_string()));
        debug!(agent_id = %self.keys.id(), "Agent unlocked");
        Ok(())
    }

    pub fn lock(&mut self) {
        self.keys.lock();
        self.passphrase = None;
    }

    /// Re-seal the key under a new passphrase. Requires the agent unlocked.
    pub fn change_passphrase(&mut self, passphrase: &str) -> Result<(), NodeError> {
        let secret = self.keys.key_pair()?.secret_bytes();
        self.sealed = crypto::seal_with_passphrase(&secret, passphrase, self.sealed.kdf)?;
        self.passphrase = Some(Zeroizing::new(passphrase.to_string()));
        Ok(())
    }

    pub fn passphrase(&self) -> Option<&str> {
        self.passphrase.as_ref().map(|p| p.as_str())
    }

    pub fn locked_copy(&self) -> Self {
        Self {
            keys: self.keys.locked_copy(),
            sealed: self.sealed.clone(),
            passphrase: None,
        }
    }
}
