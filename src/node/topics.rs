//! Topic subscriptions.
//!
//! Both directions of the subscription relation live under one mutex so a
//! delivery always sees a consistent subscriber snapshot.

use crate::types::{AgentId, TopicId};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};

#[derive(Default)]
struct Subscriptions {
    by_topic: HashMap<TopicId, BTreeSet<AgentId>>,
    by_receiver: HashMap<AgentId, BTreeSet<TopicId>>,
}

#[derive(Default)]
pub struct TopicRegistry {
    inner: Mutex<Subscriptions>,
}

impl TopicRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if the receiver was already subscribed.
    pub fn subscribe(&self, topic: TopicId, receiver: AgentId) -> bool {
        let mut inner = self.inner.lock();
        let added = inner.by_topic.entry(topic).or_default().insert(receiver);
        inner.by_receiver.entry(receiver).or_default().insert(topic);
        added
    }

    /// Returns false if the receiver was not subscribed.
    pub fn unsubscribe(&self, topic: TopicId, receiver: AgentId) -> bool {
        let mut inner = self.inner.lock();
        let removed = match inner.by_topic.get_mut(&topic) {
            Some(subscribers) => {
                let removed = subscribers.remove(&receiver);
                if subscribers.is_empty() {
                    inner.by_topic.remove(&topic);
                }
                removed
            }
            None => false,
        };
        if let Some(topics) = inner.by_receiver.get_mut(&receiver) {
            topics.remove(&topic);
            if topics.is_empty() {
                inner.by_receiver.remove(&receiver);
            }
        }
        removed
    }

    /// Drop every subscription of `receiver`, returning the topics it left.
    pub fn remove_receiver(&self, receiver: AgentId) -> Vec<TopicId> {
        let mut inner = self.inner.lock();
        let topics = inner.by_receiver.remove(&receiver).unwrap_or_default();
        for topic in &topics {
            if let Some(subscribers) = inner.by_topic.get_mut(topic) {
                subscribers.remove(&receiver);
                if subscribers.is_empty() {
                    inner.by_topic.remove(topic);
                }
            }
        }
        topics.into_iter().collect()
    }

    pub fn subscribers(&self, topic: TopicId) -> Vec<AgentId> {
        self.inner
            .lock()
            .by_topic
            .get(&topic)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn topics_of(&self, receiver: AgentId) -> Vec<TopicId> {
        self.inner
            .lock()
            .by_receiver
            .get(&receiver)
            .map(|t| t.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn has_topic(&self, topic: TopicId) -> bool {
        self.inner.lock().by_topic.contains_key(&topic)
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.by_topic.clear();
        inner.by_receiver.clear();
    }
}
