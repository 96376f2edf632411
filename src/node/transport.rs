//! Overlay collaborators consumed by the node.
//!
//! Delivery is best effort. Retries, timeouts and answer matching are the
//! node's job.

use crate::error::NodeError;
use crate::message::Message;
use crate::service::ServiceNameVersion;
use crate::types::{AgentId, NodeId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[async_trait]
pub trait Transport: Send + Sync {
    fn local_node_id(&self) -> NodeId;

    /// Deliver to one specific node.
    async fn send_direct(&self, message: Message, node: NodeId) -> Result<(), NodeError>;

    /// Deliver to one remote node hosting the recipient. Returns that node.
    async fn send_anycast(&self, message: Message) -> Result<NodeId, NodeError>;

    /// Deliver to every remote node hosting the recipient. Returns how many
    /// holders were reached.
    async fn send_broadcast(&self, message: Message) -> Result<usize, NodeError>;

    /// `Ok` when `node` is reachable, `NodeNotFound` otherwise.
    async fn lookup(&self, node: NodeId) -> Result<(), NodeError>;
}

/// One running service instance as published to the overlay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceAnnouncement {
    pub service: ServiceNameVersion,
    pub node: NodeId,
    pub agent: AgentId,
}

#[async_trait]
pub trait ServiceDirectory: Send + Sync {
    async fn announce(&self, announcement: ServiceAnnouncement) -> Result<(), NodeError>;

    async fn withdraw(&self, agent: AgentId, node: NodeId) -> Result<(), NodeError>;

    /// Up to `max` running instances of any version of `name`.
    async fn find_service_instances(
        &self,
        name: &str,
        max: usize,
    ) -> Result<Vec<ServiceAnnouncement>, NodeError>;
}
