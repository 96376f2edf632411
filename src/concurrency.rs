//! Per-agent locking
//!
//! Group unlock and membership changes mutate shared key-wrapping state. The
//! node serializes writes to the same agent through these locks while letting
//! different agents proceed concurrently.

use crate::types::AgentId;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;

/// Lazily created lock per agent id
pub struct AgentLockManager {
    locks: RwLock<HashMap<AgentId, Arc<Mutex<()>>>>,
}

impl AgentLockManager {
    pub fn new() -> Self {
        Self {
            locks: RwLock::new(HashMap::new()),
        }
    }

    /// Get or create the lock for `agent`.
    pub fn get_lock(&self, agent: AgentId) -> Arc<Mutex<()>> {
        {
            let map = self.locks.read();
            if let Some(lock) = map.get(&agent) {
                return lock.clone();
            }
        }

        let mut map = self.locks.write();
        // Double-check after acquiring write lock
        map.entry(agent)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drop locks nobody holds any more.
    pub fn prune(&self) -> usize {
        let mut map = self.locks.write();
        let before = map.len();
        map.retain(|_, lock| Arc::strong_count(lock) > 1);
        before - map.len()
    }

    pub fn len(&self) -> usize {
        self.locks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.read().is_empty()
    }
}

impl Default for AgentLockManager {
    fn default() -> Self {
        Self::new()
    }
}
