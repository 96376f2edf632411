use agentmesh::config::NodeSettings;
use agentmesh::crypto::KdfParams;
use agentmesh::node::LocalNetwork;
use agentmesh::{Agent, Node, UserAgent};
use std::sync::Arc;
use std::time::Duration;

pub fn light_kdf() -> KdfParams {
    KdfParams::new(256, 1, 1)
}

/// Node settings with a cheap KDF and short timeouts.
pub fn settings() -> NodeSettings {
    NodeSettings {
        kdf_memory_kib: 256,
        kdf_iterations: 1,
        message_timeout_ms: 2_000,
        ..NodeSettings::default()
    }
}

pub async fn launched_node(network: &LocalNetwork, settings: NodeSettings) -> Arc<Node> {
    let node = network.create_node(settings).unwrap();
    node.launch().await.unwrap();
    node
}

pub fn user(passphrase: &str) -> Agent {
    UserAgent::create_with_kdf(passphrase, light_kdf())
        .unwrap()
        .into()
}

pub fn user_with_login(passphrase: &str, login: &str) -> Agent {
    let mut user = UserAgent::create_with_kdf(passphrase, light_kdf()).unwrap();
    user.set_login(login).unwrap();
    user.into()
}

/// Poll `condition` until it holds or five seconds pass.
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    condition()
}
