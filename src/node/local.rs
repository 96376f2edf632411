//! In-process overlay: several nodes sharing one envelope store and one
//! service directory, with links that can be cut or silenced.
//!
//! Used by the CLI demo and by tests that need more than one node.

use crate::config::NodeSettings;
use crate::envelope::MemoryStore;
use crate::error::NodeError;
use crate::message::Message;
use crate::node::transport::{ServiceAnnouncement, ServiceDirectory, Transport};
use crate::node::Node;
use crate::types::{AgentId, NodeId};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};
use tracing::{debug, trace};

/// Reachability of a node from the rest of the network
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Up,
    /// Sends fail with `NodeNotFound`
    Down,
    /// Sends succeed but the message is dropped
    Silent,
}

struct NetworkInner {
    nodes: RwLock<BTreeMap<NodeId, Weak<Node>>>,
    links: RwLock<HashMap<NodeId, LinkState>>,
    store: Arc<MemoryStore>,
    directory: Arc<LocalDirectory>,
}

impl NetworkInner {
    fn link(&self, node: NodeId) -> LinkState {
        self.links.read().get(&node).copied().unwrap_or(LinkState::Up)
    }

    fn running_node(&self, id: NodeId) -> Option<Arc<Node>> {
        self.nodes
            .read()
            .get(&id)
            .and_then(Weak::upgrade)
            .filter(|n| n.is_running())
    }

    /// Running nodes other than `except` that host `agent`, in id order.
    fn holders(&self, agent: AgentId, except: NodeId) -> Vec<Arc<Node>> {
        self.nodes
            .read()
            .iter()
            .filter(|(id, _)| **id != except)
            .filter_map(|(_, node)| node.upgrade())
            .filter(|node| node.is_running() && node.has_local_agent(agent))
            .collect()
    }

    /// Hand `message` to `target` unless its link says otherwise.
    fn deliver(&self, message: Message, target: Arc<Node>) -> Result<(), NodeError> {
        match self.link(target.id()) {
            LinkState::Down => Err(NodeError::NodeNotFound(target.id())),
            LinkState::Silent => {
                trace!(node = %target.id(), message_id = message.id(), "Link silent, dropping message");
                Ok(())
            }
            LinkState::Up => {
                tokio::spawn(async move { target.receive_message(message).await });
                Ok(())
            }
        }
    }
}

/// A set of nodes wired together in one process
#[derive(Clone)]
pub struct LocalNetwork {
    inner: Arc<NetworkInner>,
}

impl Default for LocalNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(NetworkInner {
                nodes: RwLock::new(BTreeMap::new()),
                links: RwLock::new(HashMap::new()),
                store: Arc::new(MemoryStore::new()),
                directory: Arc::new(LocalDirectory::default()),
            }),
        }
    }

    pub fn store(&self) -> Arc<MemoryStore> {
        self.inner.store.clone()
    }

    pub fn directory(&self) -> Arc<LocalDirectory> {
        self.inner.directory.clone()
    }

    /// Create a configured, not yet launched node attached to this network.
    pub fn create_node(&self, settings: NodeSettings) -> Result<Arc<Node>, NodeError> {
        let id = NodeId::random();
        let transport = Arc::new(LocalTransport {
            node: id,
            network: self.inner.clone(),
        });
        let node = Arc::new(Node::new(
            settings,
            transport,
            self.inner.directory.clone(),
            self.inner.store.clone(),
        )?);
        self.inner.nodes.write().insert(id, Arc::downgrade(&node));
        debug!(node = %id, "Node joined local network");
        Ok(node)
    }

    pub fn set_link(&self, node: NodeId, state: LinkState) {
        self.inner.links.write().insert(node, state);
    }

    /// Ids of the nodes still alive, in id order.
    pub fn nodes(&self) -> Vec<NodeId> {
        self.inner
            .nodes
            .read()
            .iter()
            .filter(|(_, node)| node.strong_count() > 0)
            .map(|(id, _)| *id)
            .collect()
    }
}

struct LocalTransport {
    node: NodeId,
    network: Arc<NetworkInner>,
}

#[async_trait]
impl Transport for LocalTransport {
    fn local_node_id(&self) -> NodeId {
        self.node
    }

    async fn send_direct(&self, message: Message, node: NodeId) -> Result<(), NodeError> {
        let target = self
            .network
            .running_node(node)
            .ok_or(NodeError::NodeNotFound(node))?;
        self.network.deliver(message, target)
    }

    async fn send_anycast(&self, message: Message) -> Result<NodeId, NodeError> {
        let recipient = message
            .recipient()
            .ok_or_else(|| NodeError::InvalidArgument("anycast needs a recipient".to_string()))?;
        let target = self
            .network
            .holders(recipient, self.node)
            .into_iter()
            .find(|n| self.network.link(n.id()) != LinkState::Down)
            .ok_or_else(|| NodeError::IdentityNotFound(recipient.to_string()))?;
        let id = target.id();
        self.network.deliver(message, target)?;
        Ok(id)
    }

    async fn send_broadcast(&self, message: Message) -> Result<usize, NodeError> {
        let recipient = message
            .recipient()
            .ok_or_else(|| NodeError::InvalidArgument("broadcast needs a recipient".to_string()))?;
        let mut reached = 0;
        for target in self.network.holders(recipient, self.node) {
            if self.network.deliver(message.clone(), target).is_ok() {
                reached += 1;
            }
        }
        Ok(reached)
    }

    async fn lookup(&self, node: NodeId) -> Result<(), NodeError> {
        match self.network.running_node(node) {
            Some(_) if self.network.link(node) != LinkState::Down => Ok(()),
            _ => Err(NodeError::NodeNotFound(node)),
        }
    }
}

/// Service directory shared by every node of a [`LocalNetwork`]
#[derive(Default)]
pub struct LocalDirectory {
    announcements: RwLock<Vec<ServiceAnnouncement>>,
}

impl LocalDirectory {
    pub fn len(&self) -> usize {
        self.announcements.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.announcements.read().is_empty()
    }
}

#[async_trait]
impl ServiceDirectory for LocalDirectory {
    async fn announce(&self, announcement: ServiceAnnouncement) -> Result<(), NodeError> {
        let mut announcements = self.announcements.write();
        announcements.retain(|a| !(a.agent == announcement.agent && a.node == announcement.node));
        announcements.push(announcement);
        Ok(())
    }

    async fn withdraw(&self, agent: AgentId, node: NodeId) -> Result<(), NodeError> {
        self.announcements
            .write()
            .retain(|a| !(a.agent == agent && a.node == node));
        Ok(())
    }

    async fn find_service_instances(
        &self,
        name: &str,
        max: usize,
    ) -> Result<Vec<ServiceAnnouncement>, NodeError> {
        let mut found: Vec<ServiceAnnouncement> = self
            .announcements
            .read()
            .iter()
            .filter(|a| a.service.name() == name)
            .cloned()
            .collect();
        found.sort_by(|a, b| b.service.version().cmp(a.service.version()));
        found.truncate(max);
        Ok(found)
    }
}
