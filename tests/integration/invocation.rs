use agentmesh::node::{Event, LinkState, LocalNetwork, MemoryObserver};
use agentmesh::service::ServiceVersion;
use agentmesh::testing::CounterService;
use agentmesh::{NodeError, Value};
use std::sync::Arc;

use crate::integration::support::{launched_node, settings, user};

#[tokio::test(flavor = "multi_thread")]
async fn counter_state_persists_across_local_calls() {
    let network = LocalNetwork::new();
    let node = launched_node(&network, settings()).await;
    node.start_service(Arc::new(CounterService::new()), "service-pass")
        .await
        .unwrap();

    let mut caller = user("p1");
    node.store_agent(&caller).unwrap();
    node.register_agent(caller.clone()).await.unwrap();
    caller.lock();
    caller.unlock("p1").unwrap();

    let first = node
        .invoke(&caller, "counter", "inc", vec![Value::Int(10)], false, false)
        .await
        .unwrap();
    let second = node
        .invoke(&caller, "counter", "inc", vec![Value::Int(10)], false, false)
        .await
        .unwrap();
    assert_eq!(first, Value::Int(11));
    assert_eq!(second, Value::Int(12));
    assert_eq!(node.service_cache().network_searches(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn locked_caller_is_denied_without_retry() {
    let network = LocalNetwork::new();
    let node = launched_node(&network, settings()).await;
    node.start_service(Arc::new(CounterService::new()), "service-pass")
        .await
        .unwrap();
    let observer = Arc::new(MemoryObserver::new());
    node.add_observer(observer.clone());

    let caller = user("p1").clone_locked();
    let result = node
        .invoke(&caller, "counter", "inc", vec![Value::Int(1)], false, false)
        .await;
    assert!(matches!(result, Err(NodeError::AccessDenied(_))));
    assert_eq!(observer.count(Event::InvocationRetry), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn version_prefix_selects_highest_matching_instance() {
    let network = LocalNetwork::new();
    let node = launched_node(&network, settings()).await;
    for version in [&[1, 0, 5][..], &[1, 0, 2][..], &[2, 0][..]] {
        let service = CounterService::with_version(ServiceVersion::new(version));
        node.start_service(Arc::new(service), "service-pass").await.unwrap();
    }
    let caller = user("p1");

    let version = |requested: &'static str, exact: bool| {
        let node = node.clone();
        let caller = caller.clone();
        async move {
            node.invoke(&caller, requested, "version", vec![], exact, false)
                .await
        }
    };

    assert_eq!(version("counter@1.0", false).await.unwrap(), Value::Str("1.0.5".into()));
    assert_eq!(version("counter@1", false).await.unwrap(), Value::Str("1.0.5".into()));
    assert_eq!(version("counter@2", false).await.unwrap(), Value::Str("2.0".into()));
    assert_eq!(version("counter", false).await.unwrap(), Value::Str("2.0".into()));
    assert_eq!(version("counter@1.0.2", true).await.unwrap(), Value::Str("1.0.2".into()));
    assert!(matches!(
        version("counter@1.0", true).await,
        Err(NodeError::ServiceNotFound(_))
    ));
    assert!(matches!(
        version("counter@3", false).await,
        Err(NodeError::ServiceNotFound(_))
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn method_resolution_and_faults_surface_as_errors() {
    let network = LocalNetwork::new();
    let node = launched_node(&network, settings()).await;
    node.start_service(Arc::new(CounterService::new()), "service-pass")
        .await
        .unwrap();
    let caller = user("p1");

    let sum = node
        .invoke(&caller, "counter", "add", vec![Value::Byte(2), Value::Long(3)], false, false)
        .await
        .unwrap();
    assert_eq!(sum, Value::Long(5));

    match node
        .invoke(&caller, "counter", "inc", vec![Value::Str("x".into())], false, false)
        .await
    {
        Err(NodeError::MethodNotFound { method, signature, .. }) => {
            assert_eq!(method, "inc");
            assert_eq!(signature, "Str");
        }
        other => panic!("expected MethodNotFound, got {:?}", other),
    }

    assert!(matches!(
        node.invoke(&caller, "counter", "fail", vec![Value::Str("broken".into())], false, false)
            .await,
        Err(NodeError::InternalServiceFailure { fault, .. }) if fault.message == "broken"
    ));
    assert!(matches!(
        node.invoke(&caller, "counter", "forbidden", vec![], false, false).await,
        Err(NodeError::AccessDenied(_))
    ));
    assert!(matches!(
        node.invoke(&caller, "missing", "inc", vec![Value::Int(1)], false, false).await,
        Err(NodeError::ServiceNotFound(_))
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn services_invoke_and_store_on_behalf_of_caller() {
    let network = LocalNetwork::new();
    let node = launched_node(&network, settings()).await;
    let service_id = node
        .start_service(Arc::new(CounterService::new()), "service-pass")
        .await
        .unwrap();
    let caller = user("p1");
    node.store_agent(&caller).unwrap();

    node.invoke(&caller, "counter", "inc", vec![Value::Int(0)], false, false)
        .await
        .unwrap();
    let nested = node
        .invoke(
            &caller,
            "counter",
            "call",
            vec![Value::Str("counter".into()), Value::Str("get_counter".into())],
            false,
            false,
        )
        .await
        .unwrap();
    assert_eq!(nested, Value::Long(1));

    let whoami = node
        .invoke(&caller, "counter", "whoami", vec![], false, false)
        .await
        .unwrap();
    assert_eq!(whoami, Value::Str(caller.id().to_string()));

    let as_service = node
        .invoke(
            &caller,
            "counter",
            "call_as_service",
            vec![Value::Str("counter".into()), Value::Str("whoami".into())],
            false,
            false,
        )
        .await
        .unwrap();
    assert_eq!(as_service, Value::Str(service_id.to_string()));

    let args = |content: &str| vec![Value::Str("diary".into()), Value::Str(content.into())];
    let first = node
        .invoke(&caller, "counter", "store", args("monday"), false, false)
        .await
        .unwrap();
    let second = node
        .invoke(&caller, "counter", "store", args("tuesday"), false, false)
        .await
        .unwrap();
    assert_eq!(second.as_i64(), first.as_i64().map(|v| v + 1));

    let fetched = node
        .invoke(&caller, "counter", "fetch", vec![Value::Str("diary".into())], false, false)
        .await
        .unwrap();
    assert_eq!(fetched, Value::Str("tuesday".into()));

    let stranger = user("p2");
    assert!(matches!(
        node.invoke(&stranger, "counter", "fetch", vec![Value::Str("diary".into())], false, false)
            .await,
        Err(NodeError::AccessDenied(_))
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn remote_invocation_forwards_the_passphrase() {
    let network = LocalNetwork::new();
    let host = launched_node(&network, settings()).await;
    let client = launched_node(&network, settings()).await;
    host.start_service(Arc::new(CounterService::new()), "service-pass")
        .await
        .unwrap();

    let caller = user("p1");
    client.store_agent(&caller).unwrap();

    let first = client
        .invoke(&caller, "counter", "inc", vec![Value::Int(10)], false, false)
        .await
        .unwrap();
    let second = client
        .invoke(&caller, "counter", "inc", vec![Value::Int(10)], false, false)
        .await
        .unwrap();
    assert_eq!(first, Value::Int(11));
    assert_eq!(second, Value::Int(12));
    assert_eq!(client.service_cache().network_searches(), 1);

    let whoami = client
        .invoke(&caller, "counter", "whoami", vec![], false, false)
        .await
        .unwrap();
    assert_eq!(whoami, Value::Str(caller.id().to_string()));

    assert!(matches!(
        client
            .invoke(&caller, "counter", "fail", vec![Value::Str("remote".into())], false, false)
            .await,
        Err(NodeError::RemoteFailure { node, .. }) if node == host.id()
    ));
    assert!(matches!(
        client.invoke(&caller, "counter", "forbidden", vec![], false, false).await,
        Err(NodeError::AccessDenied(_))
    ));
    assert!(matches!(
        client.invoke(&caller, "counter", "inc", vec![Value::Int(1)], false, true).await,
        Err(NodeError::ServiceNotFound(_))
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn remote_invocation_without_passphrase_needs_unlock() {
    let network = LocalNetwork::new();
    let host = launched_node(&network, settings()).await;
    let mut client_settings = settings();
    client_settings.forward_passphrase = false;
    let client = launched_node(&network, client_settings).await;
    host.start_service(Arc::new(CounterService::new()), "service-pass")
        .await
        .unwrap();

    let caller = user("p1");
    client.store_agent(&caller).unwrap();

    let result = client
        .invoke(&caller, "counter", "inc", vec![Value::Int(10)], false, false)
        .await;
    assert!(matches!(result, Err(NodeError::UnlockNeeded { node }) if node == host.id()));

    // An agent hosted at the service's node needs no passphrase.
    host.register_agent(caller.clone()).await.unwrap();
    let result = client
        .invoke(&caller, "counter", "inc", vec![Value::Int(10)], false, false)
        .await
        .unwrap();
    assert_eq!(result, Value::Int(11));
}

#[tokio::test(flavor = "multi_thread")]
async fn silent_instance_is_invalidated_on_every_attempt() {
    let network = LocalNetwork::new();
    let host = launched_node(&network, settings()).await;
    let mut client_settings = settings();
    client_settings.message_timeout_ms = 200;
    client_settings.invocation_retry_count = 3;
    let client = launched_node(&network, client_settings).await;
    host.start_service(Arc::new(CounterService::new()), "service-pass")
        .await
        .unwrap();
    let observer = Arc::new(MemoryObserver::new());
    client.add_observer(observer.clone());

    let caller = user("p1");
    client.store_agent(&caller).unwrap();
    network.set_link(host.id(), LinkState::Silent);

    match client
        .invoke(&caller, "counter", "inc", vec![Value::Int(1)], false, false)
        .await
    {
        Err(NodeError::InvocationFailed { attempts, last }) => {
            assert_eq!(attempts, 3);
            assert!(matches!(*last, NodeError::Timeout(_)));
        }
        other => panic!("expected InvocationFailed, got {:?}", other),
    }
    assert_eq!(client.service_cache().network_searches(), 3);
    assert_eq!(observer.count(Event::InvocationRetry), 3);
    assert_eq!(observer.count(Event::ServiceCacheInvalidated), 3);
    assert!(observer
        .events()
        .iter()
        .filter(|e| e.event == Event::ServiceCacheInvalidated)
        .all(|e| e.remote_node == Some(host.id())));

    network.set_link(host.id(), LinkState::Down);
    assert!(matches!(
        client.invoke(&caller, "counter", "inc", vec![Value::Int(1)], false, false).await,
        Err(NodeError::InvocationFailed { last, .. }) if matches!(*last, NodeError::NodeNotFound(_))
    ));

    network.set_link(host.id(), LinkState::Up);
    let value = client
        .invoke(&caller, "counter", "inc", vec![Value::Int(1)], false, false)
        .await
        .unwrap();
    assert_eq!(value, Value::Int(2));
}
