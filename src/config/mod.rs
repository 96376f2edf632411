//! Node configuration.
//!
//! Layers, lowest first: compiled-in defaults, the user's `config.toml`, then
//! `AGENTMESH__SECTION__KEY` environment variables.

pub mod facade;
pub mod merge;
pub mod sources;

pub use crate::logging::LoggingConfig;
pub use facade::ConfigLoader;

use crate::crypto::KdfParams;
use crate::error::NodeError;
use crate::node::service_cache::ServiceCacheSettings;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MeshConfig {
    #[serde(default)]
    pub node: NodeSettings,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl MeshConfig {
    pub fn validate(&self) -> Result<(), NodeError> {
        self.node.validate()
    }
}

/// Tunables of a single node
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeSettings {
    pub service_cache_lifetime_secs: u64,
    pub service_cache_negative_lifetime_secs: u64,
    /// Candidates requested per directory search
    pub service_cache_result_count: usize,
    pub tidy_up_interval_secs: u64,
    pub agent_context_lifetime_secs: u64,
    pub invocation_retry_count: usize,
    pub message_timeout_ms: u64,
    /// Seal the executing agent's passphrase into remote invocations
    pub forward_passphrase: bool,
    pub mediator_auto_acknowledge: bool,
    pub max_collision_retries: usize,
    /// Argon2 memory cost for agents the node creates itself
    pub kdf_memory_kib: u32,
    pub kdf_iterations: u32,
}

impl Default for NodeSettings {
    fn default() -> Self {
        let kdf = KdfParams::default();
        Self {
            service_cache_lifetime_secs: 60,
            service_cache_negative_lifetime_secs: 10,
            service_cache_result_count: 3,
            tidy_up_interval_secs: 60,
            agent_context_lifetime_secs: 60,
            invocation_retry_count: 3,
            message_timeout_ms: 30_000,
            forward_passphrase: true,
            mediator_auto_acknowledge: true,
            max_collision_retries: 5,
            kdf_memory_kib: kdf.memory_kib,
            kdf_iterations: kdf.iterations,
        }
    }
}

impl NodeSettings {
    pub fn validate(&self) -> Result<(), NodeError> {
        if self.invocation_retry_count == 0 {
            return Err(NodeError::Config(
                "node.invocation_retry_count must be at least 1".to_string(),
            ));
        }
        if self.service_cache_result_count == 0 {
            return Err(NodeError::Config(
                "node.service_cache_result_count must be at least 1".to_string(),
            ));
        }
        if self.tidy_up_interval_secs == 0 {
            return Err(NodeError::Config(
                "node.tidy_up_interval_secs must be at least 1".to_string(),
            ));
        }
        if self.message_timeout_ms == 0 {
            return Err(NodeError::Config("node.message_timeout_ms must be positive".to_string()));
        }
        Ok(())
    }

    pub fn message_timeout(&self) -> Duration {
        Duration::from_millis(self.message_timeout_ms)
    }

    pub fn tidy_up_interval(&self) -> Duration {
        Duration::from_secs(self.tidy_up_interval_secs)
    }

    pub fn agent_context_lifetime(&self) -> Duration {
        Duration::from_secs(self.agent_context_lifetime_secs)
    }

    pub fn kdf(&self) -> KdfParams {
        KdfParams::new(self.kdf_memory_kib, self.kdf_iterations, 1)
    }

    pub fn service_cache(&self) -> ServiceCacheSettings {
        ServiceCacheSettings {
            lifetime: Duration::from_secs(self.service_cache_lifetime_secs),
            negative_lifetime: Duration::from_secs(self.service_cache_negative_lifetime_secs),
            result_count: self.service_cache_result_count,
        }
    }
}
