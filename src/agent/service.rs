//! Service agents: the identity a running service acts under.

use crate::agent::identity::AgentKeys;
use crate::agent::passphrase::PassphraseKeys;
use crate::crypto::KdfParams;
use crate::error::NodeError;
use crate::service::{Service, ServiceNameVersion};
use crate::types::AgentId;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Clone, Serialize, Deserialize)]
pub struct ServiceAgent {
    keys: PassphraseKeys,
    service: ServiceNameVersion,
    #[serde(skip)]
    instance: Option<Arc<dyn Service>>,
}

impl std::fmt::Debug for ServiceAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceAgent")
            .field("id", &self.id())
            .field("service", &self.service)
            .field("running", &self.instance.is_some())
            .finish()
    }
}

impl ServiceAgent {
    pub fn create(service: ServiceNameVersion, passphrase: &str) -> Result<Self, NodeError> {
        Self::create_with_kdf(service, passphrase, KdfParams::default())
    }

    pub fn create_with_kdf(
        service: ServiceNameVersion,
        passphrase: &str,
        kdf: KdfParams,
    ) -> Result<Self, NodeError> {
        Ok(Self {
            keys: PassphraseKeys::generate(passphrase, kdf)?,
            service,
            instance: None,
        })
    }

    /// Create an agent for `instance` and launch it in one step.
    pub fn for_instance(
        instance: Arc<dyn Service>,
        passphrase: &str,
        kdf: KdfParams,
    ) -> Result<Self, NodeError> {
        let mut agent = Self::create_with_kdf(instance.name_version(), passphrase, kdf)?;
        agent.launch(instance)?;
        Ok(agent)
    }

    pub(crate) fn keys(&self) -> &AgentKeys {
        self.keys.keys()
    }

    pub fn id(&self) -> AgentId {
        self.keys().id()
    }

    pub fn service(&self) -> &ServiceNameVersion {
        &self.service
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

    /// Attach the live service instance. The agent must be unlocked and the
    /// instance must declare the same name and version.
    pub fn launch(&mut self, instance: Arc<dyn Service>) -> Result<(), NodeError> {
        self.keys().key_pair()?;
        let declared = instance.name_version();
        if declared != self.service {
            return Err(NodeError::InvalidArgument(format!(
                "instance declares {} but agent is bound to {}",
                declared, self.service
            )));
        }
        instance.on_start(self.id());
        self.instance = Some(instance);
        Ok(())
    }

    pub fn stop(&mut self) -> Option<Arc<dyn Service>> {
        let instance = self.instance.take();
        if let Some(instance) = &instance {
            instance.on_stop();
        }
        instance
    }

    pub fn instance(&self) -> Option<&Arc<dyn Service>> {
        self.instance.as_ref()
    }

    pub fn is_running(&self) -> bool {
        self.instance.is_some()
    }

    pub(crate) fn locked_copy(&self) -> Self {
        Self {
            keys: self.keys.locked_copy(),
            service: self.service.clone(),
            instance: None,
        }
    }
}
