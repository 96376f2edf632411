//! Node event observers.
//!
//! The node notifies a snapshot of its observer list, so observers may be
//! added or removed while events are being dispatched.

use crate::types::{now_millis, AgentId, NodeId};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

/// Observable node events with stable numeric codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Event {
    NodeStatusChange,
    AgentRegistered,
    AgentUnregistered,
    TopicSubscribed,
    TopicUnsubscribed,
    InvocationStarted,
    InvocationSucceeded,
    InvocationRetry,
    InvocationFailed,
    MessageSent,
    MessageReceived,
    MessageFailed,
    ServiceCacheInvalidated,
}

impl Event {
    pub fn code(&self) -> u16 {
        match self {
            Event::NodeStatusChange => 1000,
            Event::AgentRegistered => 2000,
            Event::AgentUnregistered => 2010,
            Event::TopicSubscribed => 2100,
            Event::TopicUnsubscribed => 2110,
            Event::InvocationStarted => 3000,
            Event::InvocationSucceeded => 3010,
            Event::InvocationRetry => 3020,
            Event::InvocationFailed => 3030,
            Event::MessageSent => 4000,
            Event::MessageReceived => 4010,
            Event::MessageFailed => 4020,
            Event::ServiceCacheInvalidated => 5000,
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Event::InvocationFailed | Event::MessageFailed)
    }
}

#[derive(Debug, Clone)]
pub struct NodeEvent {
    pub event: Event,
    pub node: NodeId,
    pub agent: Option<AgentId>,
    pub remote_node: Option<NodeId>,
    pub detail: String,
    pub timestamp: u64,
}

impl NodeEvent {
    pub fn new(event: Event, node: NodeId) -> Self {
        Self {
            event,
            node,
            agent: None,
            remote_node: None,
            detail: String::new(),
            timestamp: now_millis(),
        }
    }

    pub fn agent(mut self, agent: AgentId) -> Self {
        self.agent = Some(agent);
        self
    }

    pub fn remote_node(mut self, node: NodeId) -> Self {
        self.remote_node = Some(node);
        self
    }

    pub fn detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = detail.into();
        self
    }
}

pub trait NodeObserver: Send + Sync {
    fn log(&self, event: &NodeEvent);
}

/// Forwards node events to `tracing`.
#[derive(Debug, Default)]
pub struct TracingObserver;

impl NodeObserver for TracingObserver {
    fn log(&self, event: &NodeEvent) {
        let agent = event.agent.map(|a| a.to_hex()).unwrap_or_default();
        let remote = event.remote_node.map(|n| n.to_string()).unwrap_or_default();
        if event.event.is_failure() {
            warn!(
                code = event.event.code(),
                event = ?event.event,
                node = %event.node,
                agent = %agent,
                remote_node = %remote,
                detail = %event.detail,
                "Node event"
            );
        } else if event.event == Event::NodeStatusChange {
            info!(code = event.event.code(), node = %event.node, detail = %event.detail, "Node status changed");
        } else {
            debug!(
                code = event.event.code(),
                event = ?event.event,
                node = %event.node,
                agent = %agent,
                remote_node = %remote,
                detail = %event.detail,
                "Node event"
            );
        }
    }
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct MemoryObserver {
    events: Mutex<Vec<NodeEvent>>,
}

impl MemoryObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<NodeEvent> {
        self.events.lock().clone()
    }

    pub fn count(&self, event: Event) -> usize {
        self.events.lock().iter().filter(|e| e.event == event).count()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl NodeObserver for MemoryObserver {
    fn log(&self, event: &NodeEvent) {
        self.events.lock().push(event.clone());
    }
}
