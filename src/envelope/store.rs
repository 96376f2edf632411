//! Envelope store: signing, optimistic versioning and reader resolution on
//! top of a [`PersistentStore`].

use crate::agent::group::unlock_for;
use crate::agent::{Agent, AgentStorage};
use crate::envelope::{Envelope, PersistentStore, Reader, ReaderChange};
use crate::error::{NodeError, StorageError};
use std::sync::Arc;
use tracing::{debug, warn};

pub const DEFAULT_MAX_COLLISION_RETRIES: usize = 5;

pub struct EnvelopeStore {
    backend: Arc<dyn PersistentStore>,
    max_collision_retries: usize,
}

impl EnvelopeStore {
    pub fn new(backend: Arc<dyn PersistentStore>) -> Self {
        Self::with_collision_retries(backend, DEFAULT_MAX_COLLISION_RETRIES)
    }

    pub fn with_collision_retries(backend: Arc<dyn PersistentStore>, max: usize) -> Self {
        Self {
            backend,
            max_collision_retries: max,
        }
    }

    pub fn create_envelope(
        &self,
        identifier: &str,
        content: &[u8],
        readers: &[&Agent],
    ) -> Result<Envelope, NodeError> {
        let readers: Vec<Reader> = readers.iter().map(|a| Reader::of(a)).collect();
        Envelope::create(identifier, content, &readers)
    }

    pub fn create_unencrypted_envelope(&self, identifier: &str, content: &[u8]) -> Envelope {
        Envelope::create_unencrypted(identifier, content)
    }

    pub fn create_next_version(
        &self,
        previous: &Envelope,
        content: &[u8],
        change: ReaderChange,
    ) -> Result<Envelope, NodeError> {
        previous.next_version(content, change)
    }

    /// Sign and persist. An existing version at or above this one is a
    /// `Collision`.
    pub fn store(&self, mut envelope: Envelope, signer: &Agent) -> Result<Envelope, NodeError> {
        envelope.sign(signer)?;
        let blob = bincode::serialize(&envelope)?;
        match self
            .backend
            .put(envelope.identifier(), envelope.version(), blob)
        {
            Ok(()) => {
                debug!(
                    identifier = envelope.identifier(),
                    version = envelope.version(),
                    signer = %signer.id(),
                    "Stored envelope"
                );
                Ok(envelope)
            }
            Err(StorageError::VersionExists {
                identifier,
                version,
            }) => Err(NodeError::Collision(format!(
                "version {} of '{}' already exists",
                version, identifier
            ))),
            Err(e) => Err(e.into()),
        }
    }

    /// Store, resolving collisions by merging. `merge` receives the stored
    /// head and the envelope that failed, and returns the merged content.
    /// The merged content is written as the version after the head, keeping
    /// the attempted envelope's readers.
    pub fn store_with_collision_handler<F>(
        &self,
        envelope: Envelope,
        signer: &Agent,
        mut merge: F,
    ) -> Result<Envelope, NodeError>
    where
        F: FnMut(&Envelope, &Envelope) -> Result<Vec<u8>, NodeError>,
    {
        let mut attempt = envelope;
        for round in 0..=self.max_collision_retries {
            match self.store(attempt.clone(), signer) {
                Err(NodeError::Collision(reason)) => {
                    warn!(
                        identifier = attempt.identifier(),
                        round,
                        reason = %reason,
                        "Envelope collision, merging with stored head"
                    );
                    let stored = self.fetch(attempt.identifier())?;
                    let merged = merge(&stored, &attempt)?;
                    let change = if attempt.is_encrypted() {
                        ReaderChange::Replace(attempt.readers())
                    } else {
                        ReaderChange::Inherit
                    };
                    attempt = stored.next_version(&merged, change)?;
                }
                result => return result,
            }
        }
        Err(NodeError::Collision(format!(
            "gave up on '{}' after {} merge attempts",
            attempt.identifier(),
            self.max_collision_retries
        )))
    }

    pub fn fetch(&self, identifier: &str) -> Result<Envelope, NodeError> {
        let blob = self
            .backend
            .get(identifier)?
            .ok_or_else(|| NodeError::EnvelopeNotFound(identifier.to_string()))?;
        Self::decode(&blob)
    }

    pub fn fetch_version(&self, identifier: &str, version: u64) -> Result<Envelope, NodeError> {
        let blob = self
            .backend
            .get_version(identifier, version)?
            .ok_or_else(|| {
                NodeError::EnvelopeNotFound(format!("{} (version {})", identifier, version))
            })?;
        Self::decode(&blob)
    }

    fn decode(blob: &[u8]) -> Result<Envelope, NodeError> {
        let envelope: Envelope = bincode::deserialize(blob)?;
        envelope.verify_signature()?;
        Ok(envelope)
    }

    /// Decrypt for `reader`: directly, or through a group reader the agent
    /// belongs to (possibly via nested groups).
    pub fn open(
        &self,
        envelope: &Envelope,
        reader: &Agent,
        agents: &dyn AgentStorage,
    ) -> Result<Vec<u8>, NodeError> {
        match envelope.open(reader) {
            Err(NodeError::AccessDenied(reason)) if envelope.is_encrypted() && !reader.is_locked() => {
                for group_id in envelope.reader_ids() {
                    let Ok(Agent::Group(mut group)) = agents.get_agent(group_id) else {
                        continue;
                    };
                    if unlock_for(&mut group, reader, agents).is_ok() {
                        debug!(
                            identifier = envelope.identifier(),
                            reader = %reader.id(),
                            group = %group_id,
                            "Opened envelope through group"
                        );
                        return envelope.open(&Agent::Group(group));
                    }
                }
                Err(NodeError::AccessDenied(reason))
            }
            other => other,
        }
    }

    pub fn fetch_and_open(
        &self,
        identifier: &str,
        reader: &Agent,
        agents: &dyn AgentStorage,
    ) -> Result<Vec<u8>, NodeError> {
        let envelope = self.fetch(identifier)?;
        self.open(&envelope, reader, agents)
    }

    pub fn remove(&self, identifier: &str) -> Result<(), NodeError> {
        if self.backend.delete(identifier)? {
            Ok(())
        } else {
            Err(NodeError::EnvelopeNotFound(identifier.to_string()))
        }
    }
}
