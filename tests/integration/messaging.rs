use agentmesh::message::{ListenerStatus, Message, MessageContent, ResultListener, ACKNOWLEDGEMENT};
use agentmesh::node::{Event, LocalNetwork, MemoryObserver, MessageReceiver};
use agentmesh::{NodeError, SendMode};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::integration::support::{eventually, launched_node, settings, user};

const TIMEOUT: Duration = Duration::from_secs(2);

#[tokio::test(flavor = "multi_thread")]
async fn broadcast_collects_one_answer_per_holder() {
    let network = LocalNetwork::new();
    let sender_node = launched_node(&network, settings()).await;
    let holders = [
        launched_node(&network, settings()).await,
        launched_node(&network, settings()).await,
        launched_node(&network, settings()).await,
    ];

    let sender = user("p1");
    let target = user("p2");
    sender_node.register_agent(sender.clone()).await.unwrap();
    for node in &holders {
        node.register_agent(target.clone()).await.unwrap();
    }

    let ping = Message::new(&sender, target.id(), MessageContent::Ping(7), TIMEOUT).unwrap();
    let answers = sender_node
        .send_message_and_collect_answers(ping, SendMode::Broadcast)
        .await
        .unwrap();
    assert_eq!(answers.len(), 3);
    assert!(answers
        .iter()
        .all(|a| matches!(a.content(), MessageContent::Pong(7)) && a.sender() == target.id()));
    let origins: HashSet<_> = answers.iter().filter_map(|a| a.sending_node()).collect();
    assert_eq!(origins.len(), 3);

    let ping = Message::new(&sender, target.id(), MessageContent::Ping(8), TIMEOUT).unwrap();
    let answer = sender_node
        .send_message_and_wait_for_answer(ping, None)
        .await
        .unwrap();
    assert!(matches!(answer.content(), MessageContent::Pong(8)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn broadcast_success_callback_sees_every_answer() {
    let network = LocalNetwork::new();
    let sender_node = launched_node(&network, settings()).await;
    let mut holders = Vec::new();
    for _ in 0..3 {
        holders.push(launched_node(&network, settings()).await);
    }

    let sender = user("p1");
    let target = user("p2");
    sender_node.register_agent(sender.clone()).await.unwrap();
    for node in &holders {
        node.register_agent(target.clone()).await.unwrap();
    }

    for round in 0..5 {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(AtomicUsize::new(0));
        let listener = {
            let calls = calls.clone();
            let seen = seen.clone();
            Arc::new(ResultListener::new(TIMEOUT).on_success(move |results| {
                calls.fetch_add(1, Ordering::SeqCst);
                seen.store(results.len(), Ordering::SeqCst);
            }))
        };
        let ping = Message::new(&sender, target.id(), MessageContent::Ping(round), TIMEOUT).unwrap();
        sender_node
            .send_message_with_listener(ping, None, SendMode::Broadcast, listener.clone())
            .await
            .unwrap();

        assert_eq!(listener.wait_for_all_answers().await.unwrap().len(), 3);
        assert_eq!(listener.expected(), 3);
        assert!(eventually(|| calls.load(Ordering::SeqCst) > 0).await);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(seen.load(Ordering::SeqCst), 3);
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn message_to_unknown_agent_fails() {
    let network = LocalNetwork::new();
    let node = launched_node(&network, settings()).await;
    let sender = user("p1");
    let nobody = user("p2");

    let message = Message::new(&sender, nobody.id(), MessageContent::Ping(1), TIMEOUT).unwrap();
    assert!(matches!(
        node.send_message(message.clone(), None, SendMode::Anycast).await,
        Err(NodeError::IdentityNotFound(_))
    ));
    assert!(matches!(
        node.send_message(message, None, SendMode::Broadcast).await,
        Err(NodeError::IdentityNotFound(_))
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn listener_times_out_without_answers() {
    let network = LocalNetwork::new();
    let mut quiet_settings = settings();
    quiet_settings.mediator_auto_acknowledge = false;
    let node = launched_node(&network, quiet_settings).await;
    let sender = user("p1");
    let quiet = node.create_mediator(user("p2")).await.unwrap();

    let timed_out = Arc::new(AtomicBool::new(false));
    let listener = {
        let timed_out = timed_out.clone();
        Arc::new(
            ResultListener::new(Duration::from_millis(200))
                .on_timeout(move || timed_out.store(true, Ordering::SeqCst)),
        )
    };
    let message = Message::new(
        &sender,
        quiet.agent().id(),
        MessageContent::Text("anyone?".into()),
        Duration::from_millis(200),
    )
    .unwrap();
    node.send_message_with_listener(message, None, SendMode::Anycast, listener.clone())
        .await
        .unwrap();

    assert!(matches!(
        listener.wait_for_one_answer().await,
        Err(NodeError::Timeout(_))
    ));
    assert_eq!(listener.status(), ListenerStatus::TimedOut);
    assert!(timed_out.load(Ordering::SeqCst));
    assert!(quiet.has_messages());
}

#[tokio::test(flavor = "multi_thread")]
async fn mediator_queues_and_acknowledges() {
    let network = LocalNetwork::new();
    let node = launched_node(&network, settings()).await;
    let remote = launched_node(&network, settings()).await;

    let owner = user("p1");
    let sender = user("p2");
    let mediator = node.create_mediator(owner.clone()).await.unwrap();
    remote.register_agent(sender.clone()).await.unwrap();
    assert!(matches!(
        node.create_mediator(owner.clone()).await,
        Err(NodeError::AlreadyRegistered(_))
    ));

    let message = Message::new(
        &sender,
        owner.id(),
        MessageContent::Text("hello".into()),
        TIMEOUT,
    )
    .unwrap();
    let answer = remote
        .send_message_and_wait_for_answer(message, None)
        .await
        .unwrap();
    assert!(answer.content().is_acknowledgement());
    assert!(matches!(answer.content(), MessageContent::Text(t) if t == ACKNOWLEDGEMENT));

    assert!(mediator.has_messages());
    let queued = mediator.next_message().unwrap();
    assert!(matches!(queued.content(), MessageContent::Text(t) if t == "hello"));
    assert!(!mediator.has_messages());
}

#[tokio::test(flavor = "multi_thread")]
async fn topic_fans_out_to_every_subscriber() {
    let network = LocalNetwork::new();
    let node = launched_node(&network, settings()).await;
    let observer = Arc::new(MemoryObserver::new());
    node.add_observer(observer.clone());

    let topic = 42;
    let sender = user("p0");
    let mut mediators = Vec::new();
    for passphrase in ["p1", "p2", "p3"] {
        let mediator = node.create_mediator(user(passphrase)).await.unwrap();
        node.register_receiver_to_topic(mediator.agent().id(), topic)
            .unwrap();
        mediators.push(mediator);
    }
    assert!(node.has_topic(topic));
    assert_eq!(node.topic_subscribers(topic).len(), 3);

    let message = Message::to_topic(&sender, topic, MessageContent::Text("news".into()), TIMEOUT)
        .unwrap();
    let reached = node
        .send_message(message, None, SendMode::Anycast)
        .await
        .unwrap();
    assert_eq!(reached, 3);

    assert!(eventually(|| mediators.iter().all(|m| m.has_messages())).await);
    let mut recipients = HashSet::new();
    for mediator in &mediators {
        let received = mediator.next_message().unwrap();
        assert_eq!(received.recipient(), Some(mediator.agent().id()));
        assert_eq!(received.topic(), Some(topic));
        recipients.insert(received.recipient());
        // One copy per subscriber
        assert!(!mediator.has_messages());
    }
    assert_eq!(recipients.len(), 3);

    // Unsubscribing twice is harmless
    let first = mediators[0].agent().id();
    node.unregister_receiver_from_topic(first, topic);
    node.unregister_receiver_from_topic(first, topic);
    assert_eq!(node.topic_subscribers(topic).len(), 2);

    for mediator in &mediators[1..] {
        node.unregister_receiver(mediator.agent().id()).await.unwrap();
    }
    assert!(!node.has_topic(topic));

    let message = Message::to_topic(&sender, topic, MessageContent::Text("late".into()), TIMEOUT)
        .unwrap();
    assert!(matches!(
        node.send_message(message, None, SendMode::Anycast).await,
        Err(NodeError::NoReceiver(t)) if t == topic
    ));
    assert_eq!(observer.count(Event::MessageFailed), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn topic_subscription_requires_registration() {
    let network = LocalNetwork::new();
    let node = launched_node(&network, settings()).await;
    let stranger = user("p1");
    assert!(matches!(
        node.register_receiver_to_topic(stranger.id(), 1),
        Err(NodeError::IdentityNotFound(_))
    ));
}
