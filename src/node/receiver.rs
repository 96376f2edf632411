//! Message receivers registered at a node.

use crate::agent::Agent;
use crate::error::NodeError;
use crate::message::{Message, MessageContent, RemoteFault, RmiTask};
use crate::node::Node;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};

#[async_trait]
pub trait MessageReceiver: Send + Sync {
    /// The unlocked agent this receiver acts for.
    fn agent(&self) -> &Agent;

    async fn receive_message(&self, message: Message, node: Arc<Node>) -> Result<(), NodeError>;

    /// Called before the receiver becomes visible. An error aborts the
    /// registration.
    fn notify_registration(&self, _node: &Node) -> Result<(), NodeError> {
        Ok(())
    }

    fn notify_unregister(&self) {}
}

/// Receiver for an agent hosted directly by the node. Service agents answer
/// remote invocations; every agent answers pings.
pub struct AgentReceiver {
    agent: Agent,
}

impl AgentReceiver {
    pub fn new(agent: Agent) -> Result<Self, NodeError> {
        agent.key_pair()?;
        Ok(Self { agent })
    }

    async fn handle_rmi(&self, message: &Message, task: RmiTask, node: &Arc<Node>) -> Result<(), NodeError> {
        let service_agent = self
            .agent
            .as_service()
            .ok_or_else(|| NodeError::InvalidArgument(format!("agent {} hosts no service", self.agent.id())))?;

        let content = match self.executing_agent(message, &task, node) {
            Ok(Some(executing)) => {
                let result = node
                    .invoke_local_instance(&executing, &self.agent, &task.method, task.params)
                    .await;
                match result {
                    Ok(value) => MessageContent::RmiResult(value),
                    Err(err) => {
                        debug!(
                            service = %service_agent.service(),
                            method = %task.method,
                            error = %err,
                            "Remote invocation failed"
                        );
                        MessageContent::RmiException(RemoteFault::from_error(&err))
                    }
                }
            }
            Ok(None) => MessageContent::RmiUnlock { node: node.id() },
            Err(err) => MessageContent::RmiException(RemoteFault::from_error(&err)),
        };

        let answer = message.response(&self.agent, content, message.remaining())?;
        node.send_response(answer, message).await
    }

    /// Unlocked copy of the message sender, or `None` if this node cannot
    /// unlock it.
    fn executing_agent(&self, message: &Message, task: &RmiTask, node: &Node) -> Result<Option<Agent>, NodeError> {
        if let Some(local) = node.local_agent(message.sender()) {
            message.verify(local.public_keys())?;
            return Ok(Some(local));
        }
        let mut sender = node.get_agent(message.sender())?;
        message.verify(sender.public_keys())?;

        let Some(sealed) = &task.passphrase else {
            return Ok(None);
        };
        let passphrase = match self.agent.key_pair()?.open_box(sealed) {
            Ok(bytes) => String::from_utf8(bytes)
                .map_err(|_| NodeError::Serialization("forwarded passphrase is not utf-8".to_string()))?,
            Err(e) => {
                warn!(sender = %message.sender(), error = %e, "Cannot open forwarded passphrase");
                return Ok(None);
            }
        };
        match sender.unlock(&passphrase) {
            Ok(()) => Ok(Some(sender)),
            Err(_) => Ok(None),
        }
    }
}

#[async_trait]
impl MessageReceiver for AgentReceiver {
    fn agent(&self) -> &Agent {
        &self.agent
    }

    async fn receive_message(&self, message: Message, node: Arc<Node>) -> Result<(), NodeError> {
        match message.content().clone() {
            MessageContent::Rmi(task) => self.handle_rmi(&message, task, &node).await,
            MessageContent::Ping(stamp) => {
                let answer = message.response(&self.agent, MessageContent::Pong(stamp), message.remaining())?;
                node.send_response(answer, &message).await
            }
            other => {
                debug!(
                    agent_id = %self.agent.id(),
                    sender = %message.sender(),
                    content = ?other,
                    "Ignoring message without handler"
                );
                Ok(())
            }
        }
    }

    fn notify_registration(&self, _node: &Node) -> Result<(), NodeError> {
        if let Agent::Service(service) = &self.agent {
            if !service.is_running() {
                return Err(NodeError::InvalidArgument(format!(
                    "service agent {} has no running instance",
                    service.id()
                )));
            }
        }
        Ok(())
    }

    fn notify_unregister(&self) {
        if let Some(instance) = self.agent.as_service().and_then(|s| s.instance()) {
            instance.on_stop();
        }
    }
}
