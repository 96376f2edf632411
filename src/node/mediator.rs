//! Mediators: receivers for agents that are not hosted as live receivers.
//!
//! Handlers run in registration order and the first one that reports the
//! message as handled ends the chain. Unhandled messages wait in a pending
//! queue until the owner collects them.

use crate::agent::Agent;
use crate::error::NodeError;
use crate::message::{Message, MessageContent, ACKNOWLEDGEMENT};
use crate::node::receiver::MessageReceiver;
use crate::node::Node;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, error};

pub trait MessageHandler: Send + Sync {
    /// `Ok(true)` when the message was consumed.
    fn handle(&self, message: &Message) -> Result<bool, NodeError>;
}

impl<F> MessageHandler for F
where
    F: Fn(&Message) -> Result<bool, NodeError> + Send + Sync,
{
    fn handle(&self, message: &Message) -> Result<bool, NodeError> {
        self(message)
    }
}

pub struct Mediator {
    agent: Agent,
    pending: Mutex<VecDeque<Message>>,
    handlers: RwLock<Vec<Arc<dyn MessageHandler>>>,
    auto_acknowledge: bool,
}

impl Mediator {
    pub fn new(agent: Agent, auto_acknowledge: bool) -> Result<Self, NodeError> {
        agent.key_pair()?;
        Ok(Self {
            agent,
            pending: Mutex::new(VecDeque::new()),
            handlers: RwLock::new(Vec::new()),
            auto_acknowledge,
        })
    }

    pub fn register_handler(&self, handler: Arc<dyn MessageHandler>) {
        self.handlers.write().push(handler);
    }

    pub fn unregister_handler(&self, handler: &Arc<dyn MessageHandler>) -> bool {
        let mut handlers = self.handlers.write();
        let before = handlers.len();
        handlers.retain(|h| !Arc::ptr_eq(h, handler));
        before != handlers.len()
    }

    pub fn has_messages(&self) -> bool {
        !self.pending.lock().is_empty()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn next_message(&self) -> Option<Message> {
        self.pending.lock().pop_front()
    }

    /// Run the handler chain; queue the message if nobody takes it.
    fn dispatch(&self, message: Message) -> bool {
        let handlers: Vec<Arc<dyn MessageHandler>> = self.handlers.read().clone();
        for (index, handler) in handlers.iter().enumerate() {
            match handler.handle(&message) {
                Ok(true) => return true,
                Ok(false) => {}
                Err(e) => error!(
                    agent_id = %self.agent.id(),
                    handler = index,
                    error = %e,
                    "Message handler failed"
                ),
            }
        }
        self.pending.lock().push_back(message);
        false
    }
}

#[async_trait]
impl MessageReceiver for Mediator {
    fn agent(&self) -> &Agent {
        &self.agent
    }

    async fn receive_message(&self, message: Message, node: Arc<Node>) -> Result<(), NodeError> {
        let acknowledge = self.auto_acknowledge
            && !message.is_topic()
            && !message.content().is_acknowledgement();
        let original = acknowledge.then(|| message.clone());

        let handled = self.dispatch(message);
        debug!(agent_id = %self.agent.id(), handled, "Mediator received message");

        if let Some(original) = original {
            let answer = original.response(
                &self.agent,
                MessageContent::Text(ACKNOWLEDGEMENT.to_string()),
                original.remaining(),
            )?;
            node.send_response(answer, &original).await?;
        }
        Ok(())
    }
}
