//! The node: hosts receivers, routes messages and runs invocations.
//!
//! All registries are owned by the node and guarded per structure: receivers
//! and observers by read-write locks, topic subscriptions and pending answer
//! listeners by mutexes. Locks are never held across an await.

pub mod context;
pub mod invocation;
pub mod local;
pub mod mediator;
pub mod observer;
pub mod receiver;
pub mod service_cache;
pub mod topics;
pub mod transport;

pub use context::{AgentContext, ExecutionContext};
pub use local::{LinkState, LocalNetwork};
pub use mediator::{Mediator, MessageHandler};
pub use observer::{Event, MemoryObserver, NodeEvent, NodeObserver, TracingObserver};
pub use receiver::{AgentReceiver, MessageReceiver};
pub use service_cache::{Locality, ServiceCache, ServiceInstance};
pub use transport::{ServiceAnnouncement, ServiceDirectory, Transport};

use crate::agent::{
    Agent, AgentStorage, BasicAgentStorage, EnvelopeAgentRepository, JsonAgentCodec, ServiceAgent,
    UserAgent, UserAgentManager,
};
use crate::concurrency::AgentLockManager;
use crate::config::NodeSettings;
use crate::envelope::{EnvelopeStore, PersistentStore};
use crate::error::NodeError;
use crate::message::{ListenerStatus, Message, ResultListener};
use crate::service::Service;
use crate::types::{AgentId, MessageId, NodeId, TopicId};
use context::ContextCache;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use topics::TopicRegistry;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    Unconfigured,
    Configured,
    Starting,
    Running,
    Closing,
    Closed,
}

/// How a direct message finds its recipient
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendMode {
    /// One holder of the recipient
    Anycast,
    /// Every known holder of the recipient; one answer expected per holder
    Broadcast,
}

pub struct Node {
    id: NodeId,
    settings: NodeSettings,
    status: RwLock<NodeStatus>,
    transport: Arc<dyn Transport>,
    directory: Arc<dyn ServiceDirectory>,
    envelopes: Arc<EnvelopeStore>,
    repository: Arc<EnvelopeAgentRepository>,
    agent_cache: Arc<BasicAgentStorage>,
    agent_storage: Arc<dyn AgentStorage>,
    user_manager: UserAgentManager,
    receivers: RwLock<HashMap<AgentId, Arc<dyn MessageReceiver>>>,
    topics: TopicRegistry,
    listeners: Mutex<HashMap<MessageId, Arc<ResultListener>>>,
    service_cache: ServiceCache,
    contexts: ContextCache,
    agent_locks: AgentLockManager,
    observers: RwLock<Vec<Arc<dyn NodeObserver>>>,
    anonymous: RwLock<Option<Agent>>,
    tidy_up: Mutex<Option<watch::Sender<bool>>>,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("status", &self.status())
            .field("receivers", &self.receivers.read().len())
            .finish()
    }
}

impl Node {
    pub fn new(
        settings: NodeSettings,
        transport: Arc<dyn Transport>,
        directory: Arc<dyn ServiceDirectory>,
        store: Arc<dyn PersistentStore>,
    ) -> Result<Self, NodeError> {
        settings.validate()?;
        let id = transport.local_node_id();
        let envelopes = Arc::new(EnvelopeStore::with_collision_retries(
            store,
            settings.max_collision_retries,
        ));
        let repository = Arc::new(EnvelopeAgentRepository::new(
            envelopes.clone(),
            Arc::new(JsonAgentCodec),
        ));
        let agent_cache = Arc::new(BasicAgentStorage::with_backup(repository.clone()));
        let service_cache = ServiceCache::new(id, directory.clone(), settings.service_cache());

        Ok(Self {
            id,
            status: RwLock::new(NodeStatus::Configured),
            transport,
            directory,
            user_manager: UserAgentManager::new(envelopes.clone()),
            envelopes,
            repository,
            agent_storage: agent_cache.clone(),
            agent_cache,
            receivers: RwLock::new(HashMap::new()),
            topics: TopicRegistry::new(),
            listeners: Mutex::new(HashMap::new()),
            service_cache,
            contexts: ContextCache::new(),
            agent_locks: AgentLockManager::new(),
            observers: RwLock::new(vec![Arc::new(TracingObserver)]),
            anonymous: RwLock::new(None),
            tidy_up: Mutex::new(None),
            settings,
        })
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn status(&self) -> NodeStatus {
        *self.status.read()
    }

    pub fn is_running(&self) -> bool {
        self.status() == NodeStatus::Running
    }

    pub fn settings(&self) -> &NodeSettings {
        &self.settings
    }

    pub fn envelopes(&self) -> &Arc<EnvelopeStore> {
        &self.envelopes
    }

    /// Agent lookup: this node's cache backed by the network-wide repository.
    pub fn agent_storage(&self) -> &Arc<dyn AgentStorage> {
        &self.agent_storage
    }

    pub fn user_manager(&self) -> &UserAgentManager {
        &self.user_manager
    }

    pub fn service_cache(&self) -> &ServiceCache {
        &self.service_cache
    }

    pub fn contexts(&self) -> &ContextCache {
        &self.contexts
    }

    pub fn add_observer(&self, observer: Arc<dyn NodeObserver>) {
        self.observers.write().push(observer);
    }

    pub(crate) fn notify(&self, event: NodeEvent) {
        let observers: Vec<Arc<dyn NodeObserver>> = self.observers.read().clone();
        for observer in observers {
            observer.log(&event);
        }
    }

    fn set_status(&self, status: NodeStatus) {
        *self.status.write() = status;
        self.notify(NodeEvent::new(Event::NodeStatusChange, self.id).detail(format!("{:?}", status)));
    }

    pub(crate) fn ensure_running(&self) -> Result<(), NodeError> {
        match self.status() {
            NodeStatus::Running => Ok(()),
            other => Err(NodeError::NotRunning(other)),
        }
    }

    /// Start the node: create its anonymous agent and the tidy-up sweep.
    pub async fn launch(self: &Arc<Self>) -> Result<(), NodeError> {
        let status = self.status();
        if status != NodeStatus::Configured {
            return Err(NodeError::InvalidArgument(format!(
                "cannot launch node {} in status {:?}",
                self.id, status
            )));
        }
        self.set_status(NodeStatus::Starting);

        let anonymous: Agent = UserAgent::anonymous(self.settings.kdf())?.into();
        self.agent_cache.register_agent(&anonymous);
        self.user_manager.set_anonymous(anonymous.id());
        *self.anonymous.write() = Some(anonymous);

        self.spawn_tidy_up();
        self.set_status(NodeStatus::Running);
        info!(node = %self.id, "Node launched");
        Ok(())
    }

    /// Stop the sweep, unregister every receiver and fail pending listeners.
    pub async fn shutdown(&self) {
        if matches!(self.status(), NodeStatus::Closing | NodeStatus::Closed) {
            return;
        }
        self.set_status(NodeStatus::Closing);

        if let Some(stop) = self.tidy_up.lock().take() {
            let _ = stop.send(true);
        }

        let receivers: Vec<Arc<dyn MessageReceiver>> =
            self.receivers.write().drain().map(|(_, r)| r).collect();
        let withdrawals = receivers
            .iter()
            .map(|r| r.agent())
            .filter(|agent| agent.as_service().is_some())
            .map(|agent| async move {
                if let Err(e) = self.directory.withdraw(agent.id(), self.id).await {
                    warn!(node = %self.id, agent_id = %agent.id(), error = %e, "Failed to withdraw service");
                }
            });
        futures::future::join_all(withdrawals).await;
        for receiver in &receivers {
            receiver.notify_unregister();
        }

        let listeners: Vec<Arc<ResultListener>> =
            self.listeners.lock().drain().map(|(_, l)| l).collect();
        for listener in listeners {
            listener.collect_exception(NodeError::NotRunning(NodeStatus::Closing));
        }

        self.topics.clear();
        self.contexts.clear();
        self.service_cache.clear();
        self.set_status(NodeStatus::Closed);
        info!(node = %self.id, "Node shut down");
    }

    fn spawn_tidy_up(self: &Arc<Self>) {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let node = Arc::downgrade(self);
        let interval = self.settings.tidy_up_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => match node.upgrade() {
                        Some(node) => node.tidy_up(),
                        None => break,
                    },
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("Tidy-up task stopped");
        });
        *self.tidy_up.lock() = Some(stop_tx);
    }

    /// Evict idle agent contexts and expired answer listeners.
    pub fn tidy_up(&self) {
        let contexts = self.contexts.evict_idle(self.settings.agent_context_lifetime());
        let listeners = {
            let mut map = self.listeners.lock();
            let before = map.len();
            map.retain(|_, listener| {
                listener.check_timeout();
                listener.status() == ListenerStatus::Waiting
            });
            before - map.len()
        };
        let locks = self.agent_locks.prune();
        debug!(node = %self.id, contexts, listeners, locks, "Tidy-up sweep");
    }

    // ----- agents -----

    /// Unlocked copy of an agent registered at this node.
    pub fn local_agent(&self, id: AgentId) -> Option<Agent> {
        self.receivers.read().get(&id).map(|r| r.agent().clone_preserving_lock_state())
    }

    pub fn has_local_agent(&self, id: AgentId) -> bool {
        self.receivers.read().contains_key(&id)
    }

    pub fn anonymous_agent(&self) -> Option<Agent> {
        self.anonymous.read().clone()
    }

    /// Publish a new agent. Users' login and email are claimed as well.
    pub fn store_agent(&self, agent: &Agent) -> Result<(), NodeError> {
        let lock = self.agent_locks.get_lock(agent.id());
        let _guard = lock.lock();

        agent.key_pair()?;
        if let Some(group) = agent.as_group() {
            if group.has_pending_changes() {
                return Err(NodeError::InvalidArgument(format!(
                    "group {} has membership changes that are not applied",
                    group.id()
                )));
            }
        }
        let claims = self.user_manager.register_user_agent(agent)?;
        if let Err(e) = self.repository.store_agent(agent) {
            self.user_manager.release(claims);
            return Err(e);
        }
        self.agent_cache.register_agent(agent);
        Ok(())
    }

    /// Publish a new version of a known agent.
    pub fn update_agent(&self, agent: &Agent) -> Result<(), NodeError> {
        let lock = self.agent_locks.get_lock(agent.id());
        let _guard = lock.lock();

        agent.key_pair()?;
        if let Some(group) = agent.as_group() {
            if group.has_pending_changes() {
                return Err(NodeError::InvalidArgument(format!(
                    "group {} has membership changes that are not applied",
                    group.id()
                )));
            }
        }
        self.repository.update_agent(agent)?;
        self.user_manager.register_user_agent(agent)?;
        self.agent_cache.register_agent(agent);
        Ok(())
    }

    /// Locked copy of any agent known locally or to the network.
    pub fn get_agent(&self, id: AgentId) -> Result<Agent, NodeError> {
        if let Some(agent) = self.local_agent(id) {
            return Ok(agent.clone_locked());
        }
        self.agent_storage.get_agent(id)
    }

    pub fn has_agent(&self, id: AgentId) -> bool {
        self.has_local_agent(id) || self.agent_storage.has_agent(id)
    }

    pub fn get_agent_id_by_login(&self, login: &str) -> Result<AgentId, NodeError> {
        self.user_manager.get_agent_id_by_login(login)
    }

    pub fn get_agent_id_by_email(&self, email: &str) -> Result<AgentId, NodeError> {
        self.user_manager.get_agent_id_by_email(email)
    }

    // ----- receivers -----

    pub async fn register_receiver(&self, receiver: Arc<dyn MessageReceiver>) -> Result<(), NodeError> {
        self.ensure_running()?;
        let agent = receiver.agent();
        let id = agent.id();
        agent.key_pair()?;
        if self.has_local_agent(id) {
            return Err(NodeError::AlreadyRegistered(id));
        }

        receiver.notify_registration(self)?;
        {
            let mut receivers = self.receivers.write();
            if receivers.contains_key(&id) {
                return Err(NodeError::AlreadyRegistered(id));
            }
            receivers.insert(id, receiver.clone());
        }

        if let Some(service) = agent.as_service() {
            self.service_cache.register_local(service.service().clone(), id);
            let announcement = ServiceAnnouncement {
                service: service.service().clone(),
                node: self.id,
                agent: id,
            };
            if let Err(e) = self.directory.announce(announcement).await {
                // Roll back so the registration is all or nothing
                self.service_cache.unregister_local(id);
                self.receivers.write().remove(&id);
                receiver.notify_unregister();
                return Err(e);
            }
        }

        self.agent_cache.register_agent(agent);
        self.notify(NodeEvent::new(Event::AgentRegistered, self.id).agent(id));
        info!(node = %self.id, agent_id = %id, kind = ?agent.kind(), "Registered receiver");
        Ok(())
    }

    /// Host an unlocked agent directly.
    pub async fn register_agent(&self, agent: Agent) -> Result<(), NodeError> {
        self.register_receiver(Arc::new(AgentReceiver::new(agent)?)).await
    }

    /// Create, publish and host a service agent for `instance`.
    pub async fn start_service(
        &self,
        instance: Arc<dyn Service>,
        passphrase: &str,
    ) -> Result<AgentId, NodeError> {
        let agent: Agent = ServiceAgent::for_instance(instance, passphrase, self.settings.kdf())?.into();
        let id = agent.id();
        self.store_agent(&agent)?;
        self.register_agent(agent).await?;
        Ok(id)
    }

    pub async fn unregister_receiver(&self, id: AgentId) -> Result<(), NodeError> {
        let receiver = self
            .receivers
            .write()
            .remove(&id)
            .ok_or_else(|| NodeError::IdentityNotFound(id.to_string()))?;

        self.topics.remove_receiver(id);
        if receiver.agent().as_service().is_some() {
            self.service_cache.unregister_local(id);
            if let Err(e) = self.directory.withdraw(id, self.id).await {
                warn!(node = %self.id, agent_id = %id, error = %e, "Failed to withdraw service");
            }
        }
        receiver.notify_unregister();
        self.notify(NodeEvent::new(Event::AgentUnregistered, self.id).agent(id));
        Ok(())
    }

    pub fn register_receiver_to_topic(&self, id: AgentId, topic: TopicId) -> Result<(), NodeError> {
        if !self.has_local_agent(id) {
            return Err(NodeError::IdentityNotFound(id.to_string()));
        }
        if self.topics.subscribe(topic, id) {
            self.notify(
                NodeEvent::new(Event::TopicSubscribed, self.id)
                    .agent(id)
                    .detail(topic.to_string()),
            );
        }
        Ok(())
    }

    /// No-op when the receiver is not subscribed.
    pub fn unregister_receiver_from_topic(&self, id: AgentId, topic: TopicId) {
        if self.topics.unsubscribe(topic, id) {
            self.notify(
                NodeEvent::new(Event::TopicUnsubscribed, self.id)
                    .agent(id)
                    .detail(topic.to_string()),
            );
        }
    }

    pub fn has_topic(&self, topic: TopicId) -> bool {
        self.topics.has_topic(topic)
    }

    pub fn topic_subscribers(&self, topic: TopicId) -> Vec<AgentId> {
        self.topics.subscribers(topic)
    }

    /// Register a mediator collecting messages for `agent`.
    pub async fn create_mediator(&self, agent: Agent) -> Result<Arc<Mediator>, NodeError> {
        agent.key_pair()?;
        if self.has_local_agent(agent.id()) {
            return Err(NodeError::AlreadyRegistered(agent.id()));
        }
        let mediator = Arc::new(Mediator::new(agent, self.settings.mediator_auto_acknowledge)?);
        self.register_receiver(mediator.clone()).await?;
        Ok(mediator)
    }

    // ----- messaging -----

    /// Send without waiting for answers. Returns how many receivers were
    /// reached.
    pub async fn send_message(
        self: &Arc<Self>,
        message: Message,
        at_node: Option<NodeId>,
        mode: SendMode,
    ) -> Result<usize, NodeError> {
        self.dispatch(message, at_node, mode).await
    }

    /// Send and register `listener` for the answers.
    pub async fn send_message_with_listener(
        self: &Arc<Self>,
        message: Message,
        at_node: Option<NodeId>,
        mode: SendMode,
        listener: Arc<ResultListener>,
    ) -> Result<(), NodeError> {
        let id = message.id();
        listener.begin_dispatch();
        self.listeners.lock().insert(id, listener.clone());
        let result = self.dispatch(message, at_node, mode).await;
        match result {
            Ok(reached) => {
                listener.finish_dispatch(reached);
                Ok(())
            }
            Err(e) => {
                self.listeners.lock().remove(&id);
                listener.finish_dispatch(1);
                Err(e)
            }
        }
    }

    pub async fn send_message_and_wait_for_answer(
        self: &Arc<Self>,
        message: Message,
        at_node: Option<NodeId>,
    ) -> Result<Message, NodeError> {
        let id = message.id();
        let listener = Arc::new(ResultListener::new(message.remaining()));
        self.send_message_with_listener(message, at_node, SendMode::Anycast, listener.clone())
            .await?;
        let answer = listener.wait_for_one_answer().await;
        self.listeners.lock().remove(&id);
        answer
    }

    /// Send and collect one answer per reached receiver.
    pub async fn send_message_and_collect_answers(
        self: &Arc<Self>,
        message: Message,
        mode: SendMode,
    ) -> Result<Vec<Message>, NodeError> {
        let id = message.id();
        let listener = Arc::new(ResultListener::new(message.remaining()));
        self.send_message_with_listener(message, None, mode, listener.clone())
            .await?;
        let answers = listener.wait_for_all_answers().await;
        self.listeners.lock().remove(&id);
        answers
    }

    async fn dispatch(
        self: &Arc<Self>,
        mut message: Message,
        at_node: Option<NodeId>,
        mode: SendMode,
    ) -> Result<usize, NodeError> {
        self.ensure_running()?;
        message.set_sending_node(self.id);
        self.notify(
            NodeEvent::new(Event::MessageSent, self.id)
                .agent(message.sender())
                .detail(message.id().to_string()),
        );

        if message.is_topic() {
            return self.deliver_to_topic(message);
        }
        let recipient = message
            .recipient()
            .ok_or_else(|| NodeError::InvalidArgument("message has no recipient".to_string()))?;

        if let Some(node) = at_node.filter(|n| *n != self.id) {
            self.transport.send_direct(message, node).await?;
            return Ok(1);
        }

        let local = self.has_local_agent(recipient);
        match mode {
            SendMode::Anycast if local => {
                self.deliver_locally(message);
                Ok(1)
            }
            SendMode::Anycast if at_node.is_some() => {
                Err(NodeError::IdentityNotFound(recipient.to_string()))
            }
            SendMode::Anycast => {
                self.transport.send_anycast(message).await?;
                Ok(1)
            }
            SendMode::Broadcast => {
                let mut reached = 0;
                if local {
                    self.deliver_locally(message.clone());
                    reached += 1;
                }
                match self.transport.send_broadcast(message).await {
                    Ok(remote) => reached += remote,
                    Err(e) if reached > 0 => {
                        warn!(node = %self.id, error = %e, "Broadcast reached local holder only")
                    }
                    Err(e) => return Err(e),
                }
                if reached == 0 {
                    return Err(NodeError::IdentityNotFound(recipient.to_string()));
                }
                Ok(reached)
            }
        }
    }

    fn deliver_locally(self: &Arc<Self>, message: Message) {
        let node = self.clone();
        tokio::spawn(async move { node.receive_message(message).await });
    }

    /// Fan a topic message out to every local subscriber. The first
    /// subscriber gets the original, the others get copies.
    fn deliver_to_topic(self: &Arc<Self>, mut message: Message) -> Result<usize, NodeError> {
        let topic = message
            .topic()
            .ok_or_else(|| NodeError::InvalidArgument("message has no topic".to_string()))?;
        let targets: Vec<(AgentId, Arc<dyn MessageReceiver>)> = {
            let subscribers = self.topics.subscribers(topic);
            let receivers = self.receivers.read();
            subscribers
                .into_iter()
                .filter_map(|id| receivers.get(&id).map(|r| (id, r.clone())))
                .collect()
        };

        let Some((first_id, first)) = targets.first().cloned() else {
            self.notify(
                NodeEvent::new(Event::MessageFailed, self.id)
                    .agent(message.sender())
                    .detail(format!("no receiver for topic {}", topic)),
            );
            return Err(NodeError::NoReceiver(topic));
        };

        let mut deliveries: Vec<(Message, Arc<dyn MessageReceiver>)> = targets
            .iter()
            .skip(1)
            .map(|(id, receiver)| (message.for_recipient(*id), receiver.clone()))
            .collect();
        message.set_recipient(first_id);
        deliveries.insert(0, (message, first));

        let reached = deliveries.len();
        for (copy, receiver) in deliveries {
            let node = self.clone();
            tokio::spawn(async move { node.deliver_to_receiver(receiver, copy).await });
        }
        Ok(reached)
    }

    async fn deliver_to_receiver(self: Arc<Self>, receiver: Arc<dyn MessageReceiver>, message: Message) {
        let recipient = receiver.agent().id();
        let message_id = message.id();
        if let Err(e) = receiver.receive_message(message, self.clone()).await {
            error!(node = %self.id, agent_id = %recipient, message_id, error = %e, "Receiver failed");
            self.notify(
                NodeEvent::new(Event::MessageFailed, self.id)
                    .agent(recipient)
                    .detail(e.to_string()),
            );
        }
    }

    /// Entry point for messages arriving from the transport or from local
    /// senders.
    pub async fn receive_message(self: &Arc<Self>, message: Message) {
        if !self.is_running() {
            debug!(node = %self.id, message_id = message.id(), "Dropping message, node not running");
            return;
        }
        self.notify(
            NodeEvent::new(Event::MessageReceived, self.id)
                .agent(message.sender())
                .detail(message.id().to_string()),
        );
        if message.is_expired() {
            self.notify(
                NodeEvent::new(Event::MessageFailed, self.id)
                    .agent(message.sender())
                    .detail(format!("message {} expired", message.id())),
            );
            return;
        }

        if let Some(original) = message.response_to() {
            let listener = self.listeners.lock().get(&original).cloned();
            // Finished listeners stay registered until their waiter or the
            // tidy-up sweep removes them; a broadcast may still be counting
            // its recipients.
            if let Some(listener) = listener {
                listener.collect_answer(message);
                return;
            }
        }

        if message.is_topic() && message.recipient().is_none() {
            if let Err(e) = self.deliver_to_topic(message) {
                debug!(node = %self.id, error = %e, "Topic delivery failed");
            }
            return;
        }

        let Some(recipient) = message.recipient() else {
            return;
        };
        let receiver = self.receivers.read().get(&recipient).cloned();
        match receiver {
            Some(receiver) => self.clone().deliver_to_receiver(receiver, message).await,
            None => {
                warn!(node = %self.id, agent_id = %recipient, "No receiver for message");
                self.notify(
                    NodeEvent::new(Event::MessageFailed, self.id)
                        .agent(recipient)
                        .detail(format!("no receiver for message {}", message.id())),
                );
            }
        }
    }

    /// Route an answer back to the node the original came from.
    pub(crate) async fn send_response(self: &Arc<Self>, mut answer: Message, original: &Message) -> Result<(), NodeError> {
        answer.set_sending_node(self.id);
        match original.sending_node() {
            Some(node) if node != self.id => self.transport.send_direct(answer, node).await,
            _ => {
                self.deliver_locally(answer);
                Ok(())
            }
        }
    }
}
