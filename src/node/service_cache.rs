//! Service location cache.
//!
//! Resolves a requested `name@version` to a running instance: local
//! instances first, then remote records younger than their lifetime, then a
//! directory search. Failed searches are remembered for a shorter lifetime.

use crate::error::NodeError;
use crate::node::transport::{ServiceAnnouncement, ServiceDirectory};
use crate::service::ServiceNameVersion;
use crate::types::{AgentId, NodeId};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Locality {
    Local,
    Remote(NodeId),
}

/// A resolved service instance
#[derive(Debug, Clone)]
pub struct ServiceInstance {
    pub service: ServiceNameVersion,
    pub locality: Locality,
    pub agent: AgentId,
    pub refreshed: Instant,
}

impl ServiceInstance {
    pub fn is_local(&self) -> bool {
        self.locality == Locality::Local
    }
}

#[derive(Debug, Clone)]
pub struct ServiceCacheSettings {
    pub lifetime: Duration,
    pub negative_lifetime: Duration,
    pub result_count: usize,
}

pub struct ServiceCache {
    local_node: NodeId,
    directory: Arc<dyn ServiceDirectory>,
    settings: ServiceCacheSettings,
    local: RwLock<Vec<ServiceInstance>>,
    remote: RwLock<HashMap<String, Vec<ServiceInstance>>>,
    negative: RwLock<HashMap<(ServiceNameVersion, bool), Instant>>,
    searches: AtomicUsize,
}

fn matches(requested: &ServiceNameVersion, exact: bool, available: &ServiceNameVersion) -> bool {
    if exact {
        requested == available
    } else {
        requested.fits(available)
    }
}

/// Highest matching version among `candidates`.
fn best_match<'a>(
    candidates: impl Iterator<Item = &'a ServiceInstance>,
    requested: &ServiceNameVersion,
    exact: bool,
) -> Option<ServiceInstance> {
    candidates
        .filter(|c| matches(requested, exact, &c.service))
        .max_by(|a, b| a.service.version().cmp(b.service.version()))
        .cloned()
}

impl ServiceCache {
    pub fn new(
        local_node: NodeId,
        directory: Arc<dyn ServiceDirectory>,
        settings: ServiceCacheSettings,
    ) -> Self {
        Self {
            local_node,
            directory,
            settings,
            local: RwLock::new(Vec::new()),
            remote: RwLock::new(HashMap::new()),
            negative: RwLock::new(HashMap::new()),
            searches: AtomicUsize::new(0),
        }
    }

    pub fn register_local(&self, service: ServiceNameVersion, agent: AgentId) {
        let mut local = self.local.write();
        local.retain(|i| i.agent != agent);
        local.push(ServiceInstance {
            service,
            locality: Locality::Local,
            agent,
            refreshed: Instant::now(),
        });
        // A new local instance may satisfy requests that failed before.
        self.negative.write().clear();
    }

    pub fn unregister_local(&self, agent: AgentId) -> bool {
        let mut local = self.local.write();
        let before = local.len();
        local.retain(|i| i.agent != agent);
        before != local.len()
    }

    pub fn local_instances(&self) -> Vec<ServiceInstance> {
        self.local.read().clone()
    }

    /// Number of directory searches performed so far.
    pub fn network_searches(&self) -> usize {
        self.searches.load(Ordering::SeqCst)
    }

    pub async fn resolve(
        &self,
        requested: &ServiceNameVersion,
        exact_version: bool,
        local_only: bool,
        acting: AgentId,
    ) -> Result<ServiceInstance, NodeError> {
        if let Some(found) = best_match(self.local.read().iter(), requested, exact_version) {
            return Ok(found);
        }
        if local_only {
            return Err(NodeError::ServiceNotFound(format!("{} (local only)", requested)));
        }

        let key = (requested.clone(), exact_version);
        if let Some(failed_at) = self.negative.read().get(&key) {
            if failed_at.elapsed() < self.settings.negative_lifetime {
                debug!(service = %requested, "Negative cache hit");
                return Err(NodeError::ServiceNotFound(requested.to_string()));
            }
        }

        if let Some(found) = self.cached_remote(requested, exact_version) {
            return Ok(found);
        }

        self.searches.fetch_add(1, Ordering::SeqCst);
        let announcements = self
            .directory
            .find_service_instances(requested.name(), self.settings.result_count)
            .await?;
        debug!(
            service = %requested,
            acting_agent = %acting,
            candidates = announcements.len(),
            "Searched service directory"
        );
        self.remember(requested.name(), announcements);

        match self.cached_remote(requested, exact_version) {
            Some(found) => Ok(found),
            None => {
                self.negative.write().insert(key, Instant::now());
                Err(NodeError::ServiceNotFound(requested.to_string()))
            }
        }
    }

    fn cached_remote(&self, requested: &ServiceNameVersion, exact: bool) -> Option<ServiceInstance> {
        let remote = self.remote.read();
        let fresh = remote
            .get(requested.name())?
            .iter()
            .filter(|i| i.refreshed.elapsed() < self.settings.lifetime);
        best_match(fresh, requested, exact)
    }

    fn remember(&self, name: &str, announcements: Vec<ServiceAnnouncement>) {
        let now = Instant::now();
        let mut remote = self.remote.write();
        let entries = remote.entry(name.to_string()).or_default();
        for announcement in announcements {
            if announcement.node == self.local_node {
                continue;
            }
            let locality = Locality::Remote(announcement.node);
            entries.retain(|e| !(e.agent == announcement.agent && e.locality == locality));
            entries.push(ServiceInstance {
                service: announcement.service,
                locality,
                agent: announcement.agent,
                refreshed: now,
            });
        }
    }

    /// Forget a remote instance so the next resolution searches again.
    pub fn invalidate(&self, instance: &ServiceInstance) {
        if instance.is_local() {
            return;
        }
        let mut remote = self.remote.write();
        if let Some(entries) = remote.get_mut(instance.service.name()) {
            entries.retain(|e| !(e.agent == instance.agent && e.locality == instance.locality));
        }
        info!(service = %instance.service, locality = ?instance.locality, "Invalidated service instance");
    }

    pub fn clear(&self) {
        self.local.write().clear();
        self.remote.write().clear();
        self.negative.write().clear();
    }
}
