//! Envelopes: versioned containers readable by a set of agents.
//!
//! Content is encrypted once with a fresh symmetric key per version, and that
//! key is wrapped for every reader's encryption key. Unencrypted envelopes
//! carry plain content and no readers; they back public lookup tables such as
//! login name registrations.

pub mod persistence;
pub mod store;

pub use persistence::{MemoryStore, PersistentStore, SledStore};
pub use store::EnvelopeStore;

use crate::agent::Agent;
use crate::crypto::{self, KeyPair, PublicKeys, SealedBox, WrappedKey};
use crate::error::NodeError;
use crate::types::AgentId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Versions start at 1; 0 never exists.
pub const START_VERSION: u64 = 1;

/// Public identity of an envelope reader
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reader {
    pub id: AgentId,
    pub public: PublicKeys,
}

impl Reader {
    pub fn of(agent: &Agent) -> Self {
        Self {
            id: agent.id(),
            public: *agent.public_keys(),
        }
    }
}

/// How a new version derives its reader set from the previous one
#[derive(Debug, Clone, Default)]
pub enum ReaderChange {
    #[default]
    Inherit,
    Modify {
        add: Vec<Reader>,
        revoke: Vec<AgentId>,
    },
    Replace(Vec<Reader>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReaderKey {
    pub agent_id: AgentId,
    pub public: PublicKeys,
    pub wrapped: WrappedKey,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnvelopeContent {
    Plain(Vec<u8>),
    Encrypted(SealedBox),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvelopeSignature {
    pub signer: AgentId,
    pub public: PublicKeys,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    identifier: String,
    version: u64,
    content: EnvelopeContent,
    /// Keyed by the reader's public encryption key
    readers: BTreeMap<[u8; 32], ReaderKey>,
    signature: Option<EnvelopeSignature>,
}

impl Envelope {
    /// A first version readable by `readers`.
    pub fn create(identifier: &str, content: &[u8], readers: &[Reader]) -> Result<Self, NodeError> {
        Self::sealed(identifier, START_VERSION, content, readers)
    }

    pub fn create_unencrypted(identifier: &str, content: &[u8]) -> Self {
        Self {
            identifier: identifier.to_string(),
            version: START_VERSION,
            content: EnvelopeContent::Plain(content.to_vec()),
            readers: BTreeMap::new(),
            signature: None,
        }
    }

    fn sealed(
        identifier: &str,
        version: u64,
        content: &[u8],
        readers: &[Reader],
    ) -> Result<Self, NodeError> {
        if readers.is_empty() {
            return Err(NodeError::InvalidArgument(format!(
                "encrypted envelope '{}' needs at least one reader",
                identifier
            )));
        }
        let key = crypto::random_key();
        let sealed = crypto::encrypt(&key, content)?;
        let mut reader_keys = BTreeMap::new();
        for reader in readers {
            reader_keys.insert(
                reader.public.encryption,
                ReaderKey {
                    agent_id: reader.id,
                    public: reader.public,
                    wrapped: crypto::wrap_key(&key, &reader.public)?,
                },
            );
        }
        Ok(Self {
            identifier: identifier.to_string(),
            version,
            content: EnvelopeContent::Encrypted(sealed),
            readers: reader_keys,
            signature: None,
        })
    }

    /// The next version with new content. Readers follow `change`.
    pub fn next_version(&self, content: &[u8], change: ReaderChange) -> Result<Self, NodeError> {
        let version = self.version + 1;
        if !self.is_encrypted() {
            if !matches!(change, ReaderChange::Inherit) {
                return Err(NodeError::InvalidArgument(format!(
                    "envelope '{}' is unencrypted and has no readers",
                    self.identifier
                )));
            }
            let mut next = Self::create_unencrypted(&self.identifier, content);
            next.version = version;
            return Ok(next);
        }

        let readers: Vec<Reader> = match change {
            ReaderChange::Inherit => self.readers(),
            ReaderChange::Modify { add, revoke } => {
                let mut readers: Vec<Reader> = self
                    .readers()
                    .into_iter()
                    .filter(|r| !revoke.contains(&r.id))
                    .collect();
                for reader in add {
                    if !readers.iter().any(|r| r.id == reader.id) {
                        readers.push(reader);
                    }
                }
                readers
            }
            ReaderChange::Replace(readers) => readers,
        };
        Self::sealed(&self.identifier, version, content, &readers)
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn is_encrypted(&self) -> bool {
        matches!(self.content, EnvelopeContent::Encrypted(_))
    }

    pub fn plain_content(&self) -> Option<&[u8]> {
        match &self.content {
            EnvelopeContent::Plain(bytes) => Some(bytes),
            EnvelopeContent::Encrypted(_) => None,
        }
    }

    pub fn readers(&self) -> Vec<Reader> {
        self.readers
            .values()
            .map(|k| Reader {
                id: k.agent_id,
                public: k.public,
            })
            .collect()
    }

    pub fn reader_ids(&self) -> impl Iterator<Item = AgentId> + '_ {
        self.readers.values().map(|k| k.agent_id)
    }

    pub fn has_reader(&self, id: AgentId) -> bool {
        self.readers.values().any(|k| k.agent_id == id)
    }

    pub fn signature(&self) -> Option<&EnvelopeSignature> {
        self.signature.as_ref()
    }

    fn signing_bytes(&self) -> Result<Vec<u8>, NodeError> {
        let readers: Vec<(&AgentId, &[u8; 32])> = self
            .readers
            .values()
            .map(|k| (&k.agent_id, &k.public.encryption))
            .collect();
        let encoded = bincode::serialize(&(&self.identifier, self.version, &self.content, readers))?;
        Ok(blake3::hash(&encoded).as_bytes().to_vec())
    }

    pub(crate) fn sign(&mut self, signer: &Agent) -> Result<(), NodeError> {
        let bytes = signer.sign(&self.signing_bytes()?)?;
        self.signature = Some(EnvelopeSignature {
            signer: signer.id(),
            public: *signer.public_keys(),
            bytes,
        });
        Ok(())
    }

    pub fn verify_signature(&self) -> Result<(), NodeError> {
        let signature = self.signature.as_ref().ok_or_else(|| {
            NodeError::Serialization(format!("envelope '{}' is not signed", self.identifier))
        })?;
        crypto::verify(&signature.public, &self.signing_bytes()?, &signature.bytes).map_err(|_| {
            NodeError::Serialization(format!(
                "signature of envelope '{}' v{} does not match",
                self.identifier, self.version
            ))
        })
    }

    /// Decrypt with the reader's own key. Group paths are resolved by
    /// [`EnvelopeStore::open`].
    pub fn open(&self, reader: &Agent) -> Result<Vec<u8>, NodeError> {
        match &self.content {
            EnvelopeContent::Plain(bytes) => Ok(bytes.clone()),
            EnvelopeContent::Encrypted(sealed) => {
                let entry = self
                    .readers
                    .get(&reader.public_keys().encryption)
                    .ok_or_else(|| {
                        NodeError::AccessDenied(format!(
                            "agent {} is not a reader of '{}'",
                            reader.id(),
                            self.identifier
                        ))
                    })?;
                Self::open_with(reader.key_pair()?, entry, sealed)
            }
        }
    }

    fn open_with(pair: &KeyPair, entry: &ReaderKey, sealed: &SealedBox) -> Result<Vec<u8>, NodeError> {
        let key = pair.unwrap_key(&entry.wrapped)?;
        Ok(crypto::decrypt(&key, sealed)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::UserAgent;
    use crate::crypto::KdfParams;

    fn user() -> Agent {
        UserAgent::create_with_kdf("pass", KdfParams::new(256, 1, 1))
            .unwrap()
            .into()
    }

    #[test]
    fn test_every_reader_can_open() {
        let alice = user();
        let bob = user();
        let carol = user();
        let env = Envelope::create("doc", b"payload", &[Reader::of(&alice), Reader::of(&bob)])
            .unwrap();

        assert_eq!(env.open(&alice).unwrap(), b"payload");
        assert_eq!(env.open(&bob).unwrap(), b"payload");
        assert!(matches!(env.open(&carol), Err(NodeError::AccessDenied(_))));
    }

    #[test]
    fn test_locked_reader_cannot_open() {
        let alice = user();
        let env = Envelope::create("doc", b"payload", &[Reader::of(&alice)]).unwrap();
        assert!(matches!(
            env.open(&alice.clone_locked()),
            Err(NodeError::AccessDenied(_))
        ));
    }

    #[test]
    fn test_empty_reader_set_rejected() {
        assert!(matches!(
            Envelope::create("doc", b"x", &[]),
            Err(NodeError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_next_version_inherits_and_modifies_readers() {
        let alice = user();
        let bob = user();
        let v1 = Envelope::create("doc", b"one", &[Reader::of(&alice)]).unwrap();

        let v2 = v1.next_version(b"two", ReaderChange::Inherit).unwrap();
        assert_eq!(v2.version(), 2);
        assert_eq!(v2.open(&alice).unwrap(), b"two");

        let v3 = v2
            .next_version(
                b"three",
                ReaderChange::Modify {
                    add: vec![Reader::of(&bob)],
                    revoke: vec![alice.id()],
                },
            )
            .unwrap();
        assert!(v3.open(&alice).is_err());
        assert_eq!(v3.open(&bob).unwrap(), b"three");

        assert!(v3
            .next_version(b"four", ReaderChange::Modify { add: vec![], revoke: vec![bob.id()] })
            .is_err());
    }

    #[test]
    fn test_signature_covers_content() {
        let alice = user();
        let mut env = Envelope::create_unencrypted("USER_NAME-alice", b"1234");
        env.sign(&alice).unwrap();
        env.verify_signature().unwrap();

        env.content = EnvelopeContent::Plain(b"9999".to_vec());
        assert!(env.verify_signature().is_err());
    }
}
