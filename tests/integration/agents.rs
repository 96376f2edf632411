use agentmesh::agent::AgentStorage;
use agentmesh::node::{Event, LocalNetwork, MemoryObserver};
use agentmesh::{Agent, GroupAgent, NodeError, NodeStatus};
use std::sync::Arc;

use crate::integration::support::{launched_node, settings, user, user_with_login};

#[tokio::test(flavor = "multi_thread")]
async fn locked_agent_cannot_be_stored() {
    let network = LocalNetwork::new();
    let node = launched_node(&network, settings()).await;

    let agent = user("p1");
    let locked = agent.clone_locked();
    assert!(matches!(node.store_agent(&locked), Err(NodeError::AccessDenied(_))));
    assert!(locked.sign(b"data").is_err());

    node.store_agent(&agent).unwrap();
    assert!(matches!(
        node.store_agent(&agent),
        Err(NodeError::AlreadyRegistered(id)) if id == agent.id()
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn stored_agent_is_returned_locked_on_every_node() {
    let network = LocalNetwork::new();
    let first = launched_node(&network, settings()).await;
    let second = launched_node(&network, settings()).await;

    let agent = user("p1");
    first.store_agent(&agent).unwrap();

    let mut fetched = second.get_agent(agent.id()).unwrap();
    assert!(fetched.is_locked());
    assert!(fetched.unlock("wrong").is_err());
    fetched.unlock("p1").unwrap();
    assert_eq!(fetched.id(), agent.id());
}

#[tokio::test(flavor = "multi_thread")]
async fn registered_agent_is_returned_locked() {
    let network = LocalNetwork::new();
    let node = launched_node(&network, settings()).await;

    let agent = user("p1");
    node.register_agent(agent.clone()).await.unwrap();
    assert!(node.has_local_agent(agent.id()));
    assert!(node.get_agent(agent.id()).unwrap().is_locked());
    assert!(!node.local_agent(agent.id()).unwrap().is_locked());
}

#[tokio::test(flavor = "multi_thread")]
async fn login_and_email_resolve_to_agent() {
    let network = LocalNetwork::new();
    let node = launched_node(&network, settings()).await;

    let alice = user_with_login("p1", "alice");
    node.store_agent(&alice).unwrap();
    assert_eq!(node.get_agent_id_by_login("alice").unwrap(), alice.id());
    assert!(matches!(
        node.get_agent_id_by_login("nobody"),
        Err(NodeError::IdentityNotFound(_))
    ));

    let impostor = user_with_login("p2", "alice");
    assert!(node.store_agent(&impostor).is_err());

    let anonymous = node.anonymous_agent().unwrap();
    assert_eq!(node.get_agent_id_by_login("anonymous").unwrap(), anonymous.id());
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_store_releases_new_login() {
    let network = LocalNetwork::new();
    let node = launched_node(&network, settings()).await;

    let mut agent = user("p1");
    node.store_agent(&agent).unwrap();

    // The agent is already stored, so the login claimed on the way is
    // given back.
    agent.as_user_mut().unwrap().set_login("late-login").unwrap();
    assert!(matches!(
        node.store_agent(&agent),
        Err(NodeError::AlreadyRegistered(_))
    ));
    assert!(matches!(
        node.get_agent_id_by_login("late-login"),
        Err(NodeError::IdentityNotFound(_))
    ));

    let other = user_with_login("p2", "late-login");
    node.store_agent(&other).unwrap();
    assert_eq!(node.get_agent_id_by_login("late-login").unwrap(), other.id());

    // Claims that already belonged to the agent survive a failed store.
    assert!(matches!(
        node.store_agent(&other),
        Err(NodeError::AlreadyRegistered(_))
    ));
    assert_eq!(node.get_agent_id_by_login("late-login").unwrap(), other.id());
}

#[tokio::test(flavor = "multi_thread")]
async fn nested_group_is_reachable_from_member() {
    let network = LocalNetwork::new();
    let node = launched_node(&network, settings()).await;

    let member = user("p1");
    let outsider = user("p2");
    node.store_agent(&member).unwrap();
    node.store_agent(&outsider).unwrap();

    let mut inner = GroupAgent::create(&[&member]).unwrap();
    inner.unlock(&member).unwrap();
    let inner: Agent = inner.into();
    node.store_agent(&inner).unwrap();

    let mut outer = GroupAgent::create(&[&inner]).unwrap();
    outer.unlock(&inner).unwrap();
    let outer: Agent = outer.into();
    node.store_agent(&outer).unwrap();

    let Agent::Group(mut reopened) = node.get_agent(outer.id()).unwrap() else {
        panic!("expected a group");
    };
    agentmesh::agent::group::unlock_for(&mut reopened, &member, node.agent_storage().as_ref())
        .unwrap();
    assert!(!reopened.is_locked());

    let Agent::Group(mut denied) = node.get_agent(outer.id()).unwrap() else {
        panic!("expected a group");
    };
    assert!(matches!(
        agentmesh::agent::group::unlock_for(&mut denied, &outsider, node.agent_storage().as_ref()),
        Err(NodeError::AccessDenied(_))
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn group_with_staged_changes_is_not_stored() {
    let network = LocalNetwork::new();
    let node = launched_node(&network, settings()).await;

    let first = user("p1");
    let second = user("p2");
    let mut group = GroupAgent::create(&[&first]).unwrap();
    group.unlock(&first).unwrap();
    group.add_member(&second).unwrap();
    let staged: Agent = group.clone().into();
    assert!(matches!(node.store_agent(&staged), Err(NodeError::InvalidArgument(_))));

    group.apply().unwrap();
    let applied: Agent = group.into();
    node.store_agent(&applied).unwrap();
    assert!(node.agent_storage().has_agent(applied.id()));
}

#[tokio::test(flavor = "multi_thread")]
async fn registration_requires_running_node() {
    let network = LocalNetwork::new();
    let node = network.create_node(settings()).unwrap();
    assert_eq!(node.status(), NodeStatus::Configured);
    assert!(matches!(
        node.register_agent(user("p1")).await,
        Err(NodeError::NotRunning(NodeStatus::Configured))
    ));

    node.launch().await.unwrap();
    let observer = Arc::new(MemoryObserver::new());
    node.add_observer(observer.clone());

    let agent = user("p1");
    node.register_agent(agent.clone()).await.unwrap();
    assert!(matches!(
        node.register_agent(agent.clone()).await,
        Err(NodeError::AlreadyRegistered(_))
    ));
    assert!(matches!(
        node.register_agent(user("p3").clone_locked()).await,
        Err(NodeError::AccessDenied(_))
    ));
    assert_eq!(observer.count(Event::AgentRegistered), 1);

    node.unregister_receiver(agent.id()).await.unwrap();
    assert!(matches!(
        node.unregister_receiver(agent.id()).await,
        Err(NodeError::IdentityNotFound(_))
    ));
    assert_eq!(observer.count(Event::AgentUnregistered), 1);

    node.shutdown().await;
    assert_eq!(node.status(), NodeStatus::Closed);
}
