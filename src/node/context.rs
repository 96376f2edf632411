//! Execution contexts.
//!
//! An [`AgentContext`] is cached per agent and per node. It holds the agent's
//! unlocked copy, the groups it has opened and a private single-worker task
//! queue. An [`ExecutionContext`] is created for each local invocation and is
//! what service code sees.

use crate::agent::group::unlock_for;
use crate::agent::{Agent, AgentStorage};
use crate::envelope::{Envelope, ReaderChange};
use crate::error::NodeError;
use crate::node::Node;
use crate::service::Value;
use crate::types::AgentId;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, warn};

type Task = Box<dyn FnOnce() + Send + 'static>;

/// Per-agent state kept between invocations
pub struct AgentContext {
    agent: Agent,
    groups: RwLock<HashMap<AgentId, Agent>>,
    last_used: Mutex<Instant>,
    tasks: Mutex<Option<mpsc::UnboundedSender<Task>>>,
}

impl AgentContext {
    fn new(agent: Agent) -> Self {
        Self {
            agent,
            groups: RwLock::new(HashMap::new()),
            last_used: Mutex::new(Instant::now()),
            tasks: Mutex::new(None),
        }
    }

    pub fn agent(&self) -> &Agent {
        &self.agent
    }

    pub fn touch(&self) {
        *self.last_used.lock() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_used.lock().elapsed()
    }

    /// Queue `task` behind every task previously queued for this agent.
    pub fn spawn_task(&self, task: impl FnOnce() + Send + 'static) -> Result<(), NodeError> {
        let mut tasks = self.tasks.lock();
        if tasks.is_none() {
            let handle = Handle::try_current()
                .map_err(|e| NodeError::InvalidArgument(format!("no runtime for task queue: {}", e)))?;
            let (tx, rx) = mpsc::unbounded_channel();
            handle.spawn(run_queue(self.agent.id(), rx));
            *tasks = Some(tx);
        }
        let sender = tasks
            .as_ref()
            .ok_or_else(|| NodeError::InvalidArgument("task queue closed".to_string()))?;
        sender
            .send(Box::new(task))
            .map_err(|_| NodeError::InvalidArgument("task queue closed".to_string()))
    }

    /// Close the queue. Queued tasks still run; new ones are refused.
    fn close(&self) {
        self.tasks.lock().take();
    }

    /// Unlock the group `id` with this context's agent, possibly through
    /// nested groups. Opened groups are kept for later calls.
    pub fn request_group(&self, id: AgentId, storage: &dyn AgentStorage) -> Result<Agent, NodeError> {
        if let Some(group) = self.groups.read().get(&id) {
            return Ok(group.clone());
        }
        let Agent::Group(mut group) = storage.get_agent(id)? else {
            return Err(NodeError::InvalidArgument(format!("agent {} is not a group", id)));
        };
        unlock_for(&mut group, &self.agent, storage)?;
        let group = Agent::Group(group);
        self.groups.write().insert(id, group.clone());
        Ok(group)
    }

    pub fn has_access(&self, id: AgentId, storage: &dyn AgentStorage) -> bool {
        id == self.agent.id() || self.request_group(id, storage).is_ok()
    }
}

async fn run_queue(agent: AgentId, mut rx: mpsc::UnboundedReceiver<Task>) {
    while let Some(task) = rx.recv().await {
        if let Err(e) = tokio::task::spawn_blocking(task).await {
            warn!(agent_id = %agent, error = %e, "Queued task panicked");
        }
    }
    debug!(agent_id = %agent, "Task queue drained");
}

/// Node-wide cache of agent contexts
#[derive(Default)]
pub struct ContextCache {
    contexts: RwLock<HashMap<AgentId, Arc<AgentContext>>>,
}

impl ContextCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Context for `agent`, created on first use. The agent must be unlocked.
    pub fn get_or_create(&self, agent: &Agent) -> Result<Arc<AgentContext>, NodeError> {
        agent.key_pair()?;
        {
            let map = self.contexts.read();
            if let Some(context) = map.get(&agent.id()) {
                context.touch();
                return Ok(context.clone());
            }
        }

        let mut map = self.contexts.write();
        let context = map
            .entry(agent.id())
            .or_insert_with(|| Arc::new(AgentContext::new(agent.clone_preserving_lock_state())))
            .clone();
        context.touch();
        Ok(context)
    }

    pub fn get(&self, id: AgentId) -> Option<Arc<AgentContext>> {
        self.contexts.read().get(&id).cloned()
    }

    /// Remove contexts idle longer than `lifetime`. In-flight calls keep
    /// their own handle and are not affected.
    pub fn evict_idle(&self, lifetime: Duration) -> usize {
        let mut map = self.contexts.write();
        let before = map.len();
        map.retain(|_, context| {
            let keep = context.idle_for() < lifetime;
            if !keep {
                context.close();
            }
            keep
        });
        before - map.len()
    }

    pub fn len(&self) -> usize {
        self.contexts.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.read().is_empty()
    }

    pub fn clear(&self) {
        let mut map = self.contexts.write();
        for context in map.values() {
            context.close();
        }
        map.clear();
    }
}

/// What a service method sees while it runs
pub struct ExecutionContext {
    caller: Arc<AgentContext>,
    service_agent: Agent,
    node: Arc<Node>,
    handle: Handle,
}

impl ExecutionContext {
    pub(crate) fn new(
        caller: Arc<AgentContext>,
        service_agent: Agent,
        node: Arc<Node>,
        handle: Handle,
    ) -> Self {
        Self {
            caller,
            service_agent,
            node,
            handle,
        }
    }

    /// The agent on whose behalf the call runs.
    pub fn caller(&self) -> &Agent {
        self.caller.agent()
    }

    pub fn caller_context(&self) -> &Arc<AgentContext> {
        &self.caller
    }

    pub fn service_agent(&self) -> &Agent {
        &self.service_agent
    }

    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }

    /// Nested invocation on behalf of the caller. Blocks the worker thread.
    pub fn invoke(&self, service: &str, method: &str, params: Vec<Value>) -> Result<Value, NodeError> {
        let caller = self.caller.agent().clone_preserving_lock_state();
        self.block_on_invoke(caller, service, method, params)
    }

    /// Nested invocation as the acting service agent.
    pub fn invoke_as_service(
        &self,
        service: &str,
        method: &str,
        params: Vec<Value>,
    ) -> Result<Value, NodeError> {
        let agent = self.service_agent.clone_preserving_lock_state();
        self.block_on_invoke(agent, service, method, params)
    }

    fn block_on_invoke(
        &self,
        agent: Agent,
        service: &str,
        method: &str,
        params: Vec<Value>,
    ) -> Result<Value, NodeError> {
        let node = self.node.clone();
        self.handle
            .block_on(async move { node.invoke(&agent, service, method, params, false, false).await })
    }

    pub fn request_group(&self, id: AgentId) -> Result<Agent, NodeError> {
        self.caller.request_group(id, self.node.agent_storage().as_ref())
    }

    pub fn has_access(&self, id: AgentId) -> bool {
        self.caller.has_access(id, self.node.agent_storage().as_ref())
    }

    /// Run `task` on the caller's private queue after the call returns.
    pub fn spawn_task(&self, task: impl FnOnce() + Send + 'static) -> Result<(), NodeError> {
        self.caller.spawn_task(task)
    }

    /// Fetch and decrypt an envelope as the caller.
    pub fn fetch_envelope(&self, identifier: &str) -> Result<Vec<u8>, NodeError> {
        self.node.envelopes().fetch_and_open(
            identifier,
            self.caller.agent(),
            self.node.agent_storage().as_ref(),
        )
    }

    /// Store `content` under `identifier`, readable by the caller. An
    /// existing envelope gets a new version keeping its reader set.
    pub fn store_envelope(&self, identifier: &str, content: &[u8]) -> Result<Envelope, NodeError> {
        let envelopes = self.node.envelopes();
        let envelope = match envelopes.fetch(identifier) {
            Ok(previous) => envelopes.create_next_version(&previous, content, ReaderChange::Inherit)?,
            Err(NodeError::EnvelopeNotFound(_)) => {
                envelopes.create_envelope(identifier, content, &[self.caller.agent()])?
            }
            Err(e) => return Err(e),
        };
        envelopes.store(envelope, self.caller.agent())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{BasicAgentStorage, GroupAgent, UserAgent};
    use crate::crypto::KdfParams;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn user() -> Agent {
        UserAgent::create_with_kdf("p", KdfParams::new(256, 1, 1))
            .unwrap()
            .into()
    }

    #[test]
    fn test_contexts_are_reused_and_evicted() {
        let cache = ContextCache::new();
        let agent = user();
        let first = cache.get_or_create(&agent).unwrap();
        let second = cache.get_or_create(&agent).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(!first.agent().is_locked());

        assert_eq!(cache.evict_idle(Duration::from_secs(60)), 0);
        assert_eq!(cache.evict_idle(Duration::ZERO), 1);
        assert!(cache.is_empty());
        // An evicted context stays usable by whoever still holds it
        assert_eq!(first.agent().id(), agent.id());
    }

    #[test]
    fn test_locked_agent_has_no_context() {
        let cache = ContextCache::new();
        assert!(cache.get_or_create(&user().clone_locked()).is_err());
    }

    #[test]
    fn test_request_group_through_storage() {
        let agent = user();
        let group: Agent = GroupAgent::create(&[&agent]).unwrap().into();
        let storage = BasicAgentStorage::new();
        storage.register_agent(&group);

        let cache = ContextCache::new();
        let context = cache.get_or_create(&agent).unwrap();
        let opened = context.request_group(group.id(), &storage).unwrap();
        assert!(!opened.is_locked());
        assert!(context.has_access(group.id(), &storage));
        assert!(!context.has_access(AgentId(42), &storage));
    }

    #[tokio::test]
    async fn test_task_queue_runs_in_order() {
        let cache = ContextCache::new();
        let context = cache.get_or_create(&user()).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let done = Arc::new(AtomicUsize::new(0));
        for i in 0..5 {
            let seen = seen.clone();
            let done = done.clone();
            context
                .spawn_task(move || {
                    seen.lock().push(i);
                    done.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
        }
        // Closing drains what was queued
        cache.clear();
        for _ in 0..100 {
            if done.load(Ordering::SeqCst) == 5 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(*seen.lock(), vec![0, 1, 2, 3, 4]);
    }
}
