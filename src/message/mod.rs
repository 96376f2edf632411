//! Messages exchanged between agents, and the listeners that collect answers.

pub mod listener;

pub use listener::{ListenerStatus, ResultListener};

use crate::agent::Agent;
use crate::crypto::{self, PublicKeys, RecipientBox};
use crate::error::NodeError;
use crate::service::{ServiceFault, Value};
use crate::types::{now_millis, AgentId, MessageId, NodeId, TopicId};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Content of the automatic acknowledgement sent by mediators
pub const ACKNOWLEDGEMENT: &str = "thank you";

/// A remote method invocation request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RmiTask {
    pub service: String,
    pub method: String,
    pub params: Vec<Value>,
    /// Executing agent's passphrase, sealed for the target service agent
    pub passphrase: Option<RecipientBox>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoteFaultKind {
    Security,
    Service,
    Other,
}

/// A failure reported back by the node that executed a call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteFault {
    pub kind: RemoteFaultKind,
    pub message: String,
}

impl RemoteFault {
    pub fn from_error(err: &NodeError) -> Self {
        let kind = match err {
            NodeError::AccessDenied(_) => RemoteFaultKind::Security,
            NodeError::InternalServiceFailure { .. } => RemoteFaultKind::Service,
            _ => RemoteFaultKind::Other,
        };
        let message = match err {
            NodeError::InternalServiceFailure { fault, .. } => fault.message.clone(),
            other => other.to_string(),
        };
        Self { kind, message }
    }

    /// Rebuild the caller-side error. Security failures keep their kind;
    /// everything else is marked as reported by `node`.
    pub fn into_error(self, node: NodeId, service: &str) -> NodeError {
        match self.kind {
            RemoteFaultKind::Security => NodeError::AccessDenied(self.message),
            RemoteFaultKind::Service | RemoteFaultKind::Other => NodeError::RemoteFailure {
                node,
                source: Box::new(NodeError::InternalServiceFailure {
                    service: service.to_string(),
                    fault: ServiceFault::application(self.message),
                }),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MessageContent {
    Rmi(RmiTask),
    RmiResult(Value),
    RmiException(RemoteFault),
    RmiUnlock { node: NodeId },
    Ping(u64),
    Pong(u64),
    Text(String),
    Bytes(Vec<u8>),
}

impl MessageContent {
    pub fn is_acknowledgement(&self) -> bool {
        matches!(self, MessageContent::Text(t) if t == ACKNOWLEDGEMENT)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    id: MessageId,
    sender: AgentId,
    recipient: Option<AgentId>,
    topic: Option<TopicId>,
    content: MessageContent,
    sending_node: Option<NodeId>,
    timestamp: u64,
    timeout_at: u64,
    response_to: Option<MessageId>,
    signature: Vec<u8>,
}

impl Message {
    /// A direct message from an unlocked sender.
    pub fn new(
        sender: &Agent,
        recipient: AgentId,
        content: MessageContent,
        timeout: Duration,
    ) -> Result<Self, NodeError> {
        Self::build(sender, Some(recipient), None, None, content, timeout)
    }

    pub fn to_topic(
        sender: &Agent,
        topic: TopicId,
        content: MessageContent,
        timeout: Duration,
    ) -> Result<Self, NodeError> {
        Self::build(sender, None, Some(topic), None, content, timeout)
    }

    /// An answer to `self`, addressed to its sender.
    pub fn response(
        &self,
        sender: &Agent,
        content: MessageContent,
        timeout: Duration,
    ) -> Result<Self, NodeError> {
        let mut answer = Self::build(sender, Some(self.sender), None, Some(self.id), content, timeout)?;
        answer.sending_node = None;
        Ok(answer)
    }

    fn build(
        sender: &Agent,
        recipient: Option<AgentId>,
        topic: Option<TopicId>,
        response_to: Option<MessageId>,
        content: MessageContent,
        timeout: Duration,
    ) -> Result<Self, NodeError> {
        let timestamp = now_millis();
        let mut message = Self {
            id: rand::random(),
            sender: sender.id(),
            recipient,
            topic,
            content,
            sending_node: None,
            timestamp,
            timeout_at: timestamp.saturating_add(timeout.as_millis() as u64),
            response_to,
            signature: Vec::new(),
        };
        message.signature = sender.sign(&message.signing_bytes()?)?;
        Ok(message)
    }

    fn signing_bytes(&self) -> Result<Vec<u8>, NodeError> {
        // Topic deliveries rewrite the recipient, so it is only covered for
        // direct messages.
        let recipient = if self.topic.is_some() { None } else { self.recipient };
        Ok(bincode::serialize(&(
            self.id,
            self.sender,
            recipient,
            self.topic,
            &self.content,
            self.timestamp,
            self.timeout_at,
            self.response_to,
        ))?)
    }

    pub fn verify(&self, sender: &PublicKeys) -> Result<(), NodeError> {
        crypto::verify(sender, &self.signing_bytes()?, &self.signature).map_err(NodeError::from)
    }

    pub fn id(&self) -> MessageId {
        self.id
    }

    pub fn sender(&self) -> AgentId {
        self.sender
    }

    pub fn recipient(&self) -> Option<AgentId> {
        self.recipient
    }

    pub fn topic(&self) -> Option<TopicId> {
        self.topic
    }

    pub fn is_topic(&self) -> bool {
        self.topic.is_some()
    }

    pub fn content(&self) -> &MessageContent {
        &self.content
    }

    pub fn into_content(self) -> MessageContent {
        self.content
    }

    pub fn sending_node(&self) -> Option<NodeId> {
        self.sending_node
    }

    pub(crate) fn set_sending_node(&mut self, node: NodeId) {
        self.sending_node = Some(node);
    }

    pub fn response_to(&self) -> Option<MessageId> {
        self.response_to
    }

    pub fn is_response(&self) -> bool {
        self.response_to.is_some()
    }

    pub fn timeout_at(&self) -> u64 {
        self.timeout_at
    }

    /// Time left until the message expires.
    pub fn remaining(&self) -> Duration {
        Duration::from_millis(self.timeout_at.saturating_sub(now_millis()))
    }

    pub fn is_expired(&self) -> bool {
        now_millis() > self.timeout_at
    }

    /// Copy of a topic message addressed to one subscriber.
    pub(crate) fn for_recipient(&self, recipient: AgentId) -> Self {
        let mut copy = self.clone();
        copy.recipient = Some(recipient);
        copy
    }

    pub(crate) fn set_recipient(&mut self, recipient: AgentId) {
        self.recipient = Some(recipient);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::UserAgent;
    use crate::crypto::KdfParams;

    fn user() -> Agent {
        UserAgent::create_with_kdf("pass", KdfParams::new(256, 1, 1))
            .unwrap()
            .into()
    }

    #[test]
    fn test_signed_by_sender() {
        let alice = user();
        let bob = user();
        let msg = Message::new(
            &alice,
            bob.id(),
            MessageContent::Text("hi".into()),
            Duration::from_secs(5),
        )
        .unwrap();
        msg.verify(alice.public_keys()).unwrap();
        assert!(msg.verify(bob.public_keys()).is_err());
        assert!(!msg.is_expired());
    }

    #[test]
    fn test_locked_sender_cannot_send() {
        let alice = user().clone_locked();
        assert!(matches!(
            Message::new(&alice, AgentId(1), MessageContent::Ping(0), Duration::from_secs(1)),
            Err(NodeError::AccessDenied(_))
        ));
    }

    #[test]
    fn test_response_links_to_request() {
        let alice = user();
        let bob = user();
        let request =
            Message::new(&alice, bob.id(), MessageContent::Ping(1), Duration::from_secs(5)).unwrap();
        let answer = request
            .response(&bob, MessageContent::Pong(1), Duration::from_secs(5))
            .unwrap();
        assert_eq!(answer.response_to(), Some(request.id()));
        assert_eq!(answer.recipient(), Some(alice.id()));
    }

    #[test]
    fn test_topic_copies_keep_valid_signature() {
        let alice = user();
        let msg = Message::to_topic(&alice, 7, MessageContent::Text("all".into()), Duration::from_secs(5))
            .unwrap();
        let copy = msg.for_recipient(AgentId(3));
        assert_eq!(copy.recipient(), Some(AgentId(3)));
        assert_eq!(copy.id(), msg.id());
        copy.verify(alice.public_keys()).unwrap();
    }

    #[test]
    fn test_remote_fault_kinds() {
        let err = RemoteFault::from_error(&NodeError::AccessDenied("no".into()))
            .into_error(NodeId(1), "svc");
        assert!(err.is_access_denied());

        let err = RemoteFault::from_error(&NodeError::InternalServiceFailure {
            service: "svc".into(),
            fault: ServiceFault::application("boom"),
        })
        .into_error(NodeId(1), "svc");
        assert!(matches!(err, NodeError::RemoteFailure { node: NodeId(1), .. }));
    }
}
