//! Error types for the agent mesh.
//!
//! `NodeError` is the taxonomy surfaced by the node API. `StorageError` and
//! `CryptoError` are leaf errors of the persistence and key handling layers and
//! convert into `NodeError` at the boundary.

use crate::node::NodeStatus;
use crate::service::ServiceFault;
use crate::types::{AgentId, NodeId, TopicId};
use thiserror::Error;

/// Key handling failures
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("Encryption failed")]
    Encrypt,

    #[error("Decryption failed")]
    Decrypt,

    #[error("Invalid key material: {0}")]
    InvalidKey(String),

    #[error("Signature verification failed")]
    BadSignature,
}

/// Persistent store failures
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Sled error: {0}")]
    Sled(#[from] sled::Error),

    #[error("Encoding error: {0}")]
    Encoding(#[from] bincode::Error),

    #[error("Version {version} of '{identifier}' already exists")]
    VersionExists { identifier: String, version: u64 },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Corrupt record: {0}")]
    Corrupt(String),
}

/// Errors surfaced by node, identity and envelope operations
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("Identity not found: {0}")]
    IdentityNotFound(String),

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Service not found: {0}")]
    ServiceNotFound(String),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("No method {method}({signature}) on service {service}")]
    MethodNotFound {
        service: String,
        method: String,
        signature: String,
    },

    #[error("Internal failure in service {service}: {fault}")]
    InternalServiceFailure {
        service: String,
        #[source]
        fault: ServiceFault,
    },

    #[error("Failure reported by {node}: {source}")]
    RemoteFailure {
        node: NodeId,
        #[source]
        source: Box<NodeError>,
    },

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Executing agent must be unlocked at {node}")]
    UnlockNeeded { node: NodeId },

    #[error("Collision: {0}")]
    Collision(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Envelope not found: {0}")]
    EnvelopeNotFound(String),

    #[error("No receiver registered for topic {0}")]
    NoReceiver(TopicId),

    #[error("Node not found: {0}")]
    NodeNotFound(NodeId),

    #[error("Node is not running (status: {0:?})")]
    NotRunning(NodeStatus),

    #[error("Agent {0} is already registered")]
    AlreadyRegistered(AgentId),

    #[error("Invocation failed after {attempts} attempts: {last}")]
    InvocationFailed {
        attempts: usize,
        #[source]
        last: Box<NodeError>,
    },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl NodeError {
    /// Errors after which the invocation loop invalidates the resolved
    /// instance and tries again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            NodeError::Timeout(_) | NodeError::NodeNotFound(_) | NodeError::ServiceUnavailable(_)
        )
    }

    pub fn is_access_denied(&self) -> bool {
        matches!(self, NodeError::AccessDenied(_))
    }
}

impl From<CryptoError> for NodeError {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::Decrypt | CryptoError::BadSignature => {
                NodeError::AccessDenied(err.to_string())
            }
            CryptoError::KeyDerivation(_) | CryptoError::Encrypt | CryptoError::InvalidKey(_) => {
                NodeError::Serialization(err.to_string())
            }
        }
    }
}

impl From<bincode::Error> for NodeError {
    fn from(err: bincode::Error) -> Self {
        NodeError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for NodeError {
    fn from(err: serde_json::Error) -> Self {
        NodeError::Serialization(err.to_string())
    }
}
