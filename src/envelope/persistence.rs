//! Versioned blob persistence behind the envelope store.
//!
//! Each identifier has a head (its latest version) and a set of versioned
//! blobs. `put` only succeeds for a version strictly above the current head.

use crate::error::StorageError;
use parking_lot::RwLock;
use sled::transaction::{ConflictableTransactionError, TransactionError};
use sled::Transactional;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

pub trait PersistentStore: Send + Sync {
    /// Store `blob` as `version` of `identifier`. Fails with
    /// `VersionExists` when the head is already at or above `version`.
    fn put(&self, identifier: &str, version: u64, blob: Vec<u8>) -> Result<(), StorageError>;

    /// Latest version of `identifier`.
    fn get(&self, identifier: &str) -> Result<Option<Vec<u8>>, StorageError>;

    fn get_version(&self, identifier: &str, version: u64)
        -> Result<Option<Vec<u8>>, StorageError>;

    fn head(&self, identifier: &str) -> Result<Option<u64>, StorageError>;

    /// Remove every version of `identifier`. Returns whether anything existed.
    fn delete(&self, identifier: &str) -> Result<bool, StorageError>;
}

/// In-memory store, shared between nodes of an in-process network.
#[derive(Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, BTreeMap<u64, Vec<u8>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PersistentStore for MemoryStore {
    fn put(&self, identifier: &str, version: u64, blob: Vec<u8>) -> Result<(), StorageError> {
        let mut entries = self.entries.write();
        let versions = entries.entry(identifier.to_string()).or_default();
        if let Some((&head, _)) = versions.last_key_value() {
            if head >= version {
                return Err(StorageError::VersionExists {
                    identifier: identifier.to_string(),
                    version,
                });
            }
        }
        versions.insert(version, blob);
        Ok(())
    }

    fn get(&self, identifier: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self
            .entries
            .read()
            .get(identifier)
            .and_then(|v| v.last_key_value())
            .map(|(_, blob)| blob.clone()))
    }

    fn get_version(
        &self,
        identifier: &str,
        version: u64,
    ) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self
            .entries
            .read()
            .get(identifier)
            .and_then(|v| v.get(&version))
            .cloned())
    }

    fn head(&self, identifier: &str) -> Result<Option<u64>, StorageError> {
        Ok(self
            .entries
            .read()
            .get(identifier)
            .and_then(|v| v.last_key_value())
            .map(|(version, _)| *version))
    }

    fn delete(&self, identifier: &str) -> Result<bool, StorageError> {
        Ok(self.entries.write().remove(identifier).is_some())
    }
}

const HEADS_TREE: &str = "envelope_heads";
const BLOBS_TREE: &str = "envelope_blobs";

/// Sled-backed store. Heads live in their own tree and are advanced with
/// compare-and-swap, so concurrent writers of one identifier cannot both win.
pub struct SledStore {
    heads: sled::Tree,
    blobs: sled::Tree,
}

impl SledStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        Self::from_db(sled::open(path)?)
    }

    pub fn from_db(db: sled::Db) -> Result<Self, StorageError> {
        Ok(Self {
            heads: db.open_tree(HEADS_TREE)?,
            blobs: db.open_tree(BLOBS_TREE)?,
        })
    }

    fn blob_key(identifier: &str, version: u64) -> Vec<u8> {
        let mut key = Self::blob_prefix(identifier);
        key.extend_from_slice(&version.to_be_bytes());
        key
    }

    /// Length-prefixed so no identifier's prefix covers another's keys.
    fn blob_prefix(identifier: &str) -> Vec<u8> {
        let mut key = Vec::with_capacity(identifier.len() + 12);
        key.extend_from_slice(&(identifier.len() as u32).to_be_bytes());
        key.extend_from_slice(identifier.as_bytes());
        key
    }

    fn decode_head(bytes: &[u8]) -> Result<u64, StorageError> {
        let raw: [u8; 8] = bytes
            .try_into()
            .map_err(|_| StorageError::Corrupt("head is not 8 bytes".to_string()))?;
        Ok(u64::from_be_bytes(raw))
    }
}

impl PersistentStore for SledStore {
    fn put(&self, identifier: &str, version: u64, blob: Vec<u8>) -> Result<(), StorageError> {
        // Blob and head move together; a reader never sees a head without
        // its blob.
        let key = Self::blob_key(identifier, version);
        let result = (&self.heads, &self.blobs).transaction(|(heads, blobs)| {
            if let Some(bytes) = heads.get(identifier)? {
                let head = Self::decode_head(&bytes).map_err(ConflictableTransactionError::Abort)?;
                if head >= version {
                    return Err(ConflictableTransactionError::Abort(StorageError::VersionExists {
                        identifier: identifier.to_string(),
                        version,
                    }));
                }
            }
            blobs.insert(key.as_slice(), blob.as_slice())?;
            heads.insert(identifier.as_bytes(), &version.to_be_bytes()[..])?;
            Ok(())
        });
        match result {
            Ok(()) => {}
            Err(TransactionError::Abort(e)) => return Err(e),
            Err(TransactionError::Storage(e)) => return Err(e.into()),
        }
        self.blobs.flush()?;
        Ok(())
    }

    fn get(&self, identifier: &str) -> Result<Option<Vec<u8>>, StorageError> {
        match self.head(identifier)? {
            Some(version) => self.get_version(identifier, version),
            None => Ok(None),
        }
    }

    fn get_version(
        &self,
        identifier: &str,
        version: u64,
    ) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self
            .blobs
            .get(Self::blob_key(identifier, version))?
            .map(|v| v.to_vec()))
    }

    fn head(&self, identifier: &str) -> Result<Option<u64>, StorageError> {
        self.heads
            .get(identifier)?
            .map(|bytes| Self::decode_head(&bytes))
            .transpose()
    }

    fn delete(&self, identifier: &str) -> Result<bool, StorageError> {
        let existed = self.heads.remove(identifier)?.is_some();
        for entry in self.blobs.scan_prefix(Self::blob_prefix(identifier)) {
            let (key, _) = entry?;
            self.blobs.remove(key)?;
        }
        Ok(existed)
    }
}
