use agentmesh::agent::BasicAgentStorage;
use agentmesh::envelope::{EnvelopeStore, ReaderChange, SledStore};
use agentmesh::node::LocalNetwork;
use agentmesh::{Agent, GroupAgent, NodeError};
use std::sync::Arc;
use tempfile::TempDir;

use crate::integration::support::{launched_node, settings, user};

#[test]
fn envelopes_survive_reopening_the_sled_store() {
    let temp_dir = TempDir::new().unwrap();
    let owner = user("p1");
    let agents = BasicAgentStorage::new();

    {
        let store = EnvelopeStore::new(Arc::new(SledStore::open(temp_dir.path()).unwrap()));
        let envelope = store.create_envelope("notes", b"first", &[&owner]).unwrap();
        store.store(envelope, &owner).unwrap();
    }

    let store = EnvelopeStore::new(Arc::new(SledStore::open(temp_dir.path()).unwrap()));
    let fetched = store.fetch("notes").unwrap();
    fetched.verify_signature().unwrap();
    assert_eq!(store.open(&fetched, &owner, &agents).unwrap(), b"first");

    let next = store
        .create_next_version(&fetched, b"second", ReaderChange::Inherit)
        .unwrap();
    let stored = store.store(next, &owner).unwrap();
    assert_eq!(stored.version(), fetched.version() + 1);
    assert_eq!(store.fetch_and_open("notes", &owner, &agents).unwrap(), b"second");
}

#[test]
fn storing_the_same_version_twice_collides() {
    let temp_dir = TempDir::new().unwrap();
    let store = EnvelopeStore::new(Arc::new(SledStore::open(temp_dir.path()).unwrap()));
    let owner = user("p1");

    let first = store.create_envelope("doc", b"a", &[&owner]).unwrap();
    let second = store.create_envelope("doc", b"b", &[&owner]).unwrap();
    store.store(first, &owner).unwrap();
    assert!(matches!(store.store(second, &owner), Err(NodeError::Collision(_))));
}

#[tokio::test(flavor = "multi_thread")]
async fn group_readers_open_shared_envelopes() {
    let network = LocalNetwork::new();
    let writer_node = launched_node(&network, settings()).await;
    let reader_node = launched_node(&network, settings()).await;

    let member = user("p1");
    let outsider = user("p2");
    writer_node.store_agent(&member).unwrap();

    let mut group = GroupAgent::create(&[&member]).unwrap();
    group.unlock(&member).unwrap();
    let group: Agent = group.into();
    writer_node.store_agent(&group).unwrap();

    let envelopes = writer_node.envelopes();
    let envelope = envelopes
        .create_envelope("team-plan", b"ship it", &[&group])
        .unwrap();
    envelopes.store(envelope, &member).unwrap();

    // Another node sees the same store and resolves the group from it.
    let opened = reader_node
        .envelopes()
        .fetch_and_open("team-plan", &member, reader_node.agent_storage().as_ref())
        .unwrap();
    assert_eq!(opened, b"ship it");

    assert!(matches!(
        reader_node.envelopes().fetch_and_open(
            "team-plan",
            &outsider,
            reader_node.agent_storage().as_ref()
        ),
        Err(NodeError::AccessDenied(_))
    ));
    assert!(matches!(
        reader_node.envelopes().fetch("missing"),
        Err(NodeError::EnvelopeNotFound(_))
    ));
}
