#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;
use strata_client::{Client, SessionInfo, bootstrap_credential};
use strata_core::{Identity, LayerKind};
use strata_server::{Circuit, Hub, MemoryCircuits, MemoryScene, ServerConfig};

pub const SESSION: &str = "s-1";
pub const SECURE: &str = "secure-1";
pub const CODE: u32 = 1001;

/// Configuration with every layer on an ephemeral port.
pub fn test_config() -> ServerConfig {
    let mut config = ServerConfig {
        server_version: "test-1".to_string(),
        region_name: "Testbed".to_string(),
        ..ServerConfig::default()
    };
    config.layers.cc.port = 0;
    config
        .services
        .insert("assets".to_string(), "http://assets.test/".to_string());
    config
}

pub struct TestHub {
    pub hub: Hub,
    pub scene: Arc<MemoryScene>,
    pub circuits: Arc<MemoryCircuits>,
}

pub async fn start_hub() -> TestHub {
    start_hub_with(test_config()).await
}

pub async fn start_hub_with(config: ServerConfig) -> TestHub {
    config.validate().expect("test config must be valid");
    let scene = Arc::new(MemoryScene::demo(config.region_name.clone()));
    let circuits = Arc::new(MemoryCircuits::new());
    for agent in ["alice", "bob"] {
        circuits.add(Circuit {
            agent_id: agent.to_string(),
            session_id: SESSION.to_string(),
            secure_session_id: SECURE.to_string(),
            circuit_code: CODE,
        });
    }
    let hub = Hub::new(config, scene.clone(), circuits.clone());
    hub.start().await.expect("hub should start");
    TestHub {
        hub,
        scene,
        circuits,
    }
}

impl TestHub {
    pub fn url(&self, kind: LayerKind) -> String {
        self.hub.listener_url(kind).expect("layer should be running")
    }

    /// Connect to the command layer and open a session as `agent`.
    pub async fn bootstrap(&self, agent: &str) -> (Client, SessionInfo) {
        let mut client = Client::connect(&self.url(LayerKind::Cc)).await.unwrap();
        let info = client
            .open_session(&credential(agent))
            .await
            .expect("bootstrap should succeed");
        (client, info)
    }

    /// Bootstrap and follow the invitation to `kind`.
    pub async fn open_layer(&self, agent: &str, kind: LayerKind) -> (Client, Client) {
        let (mut cc, _) = self.bootstrap(agent).await;
        let invitation = cc.invitation_for(kind.as_str()).await.unwrap();
        let (layer, _) = Client::accept_invitation(&invitation).await.unwrap();
        (cc, layer)
    }
}

pub fn credential(agent: &str) -> String {
    bootstrap_credential(agent, SESSION, SECURE, CODE)
}

pub fn identity(agent: &str) -> Identity {
    Identity::new(agent, SESSION)
}

/// Poll `check` until it holds or two seconds pass.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
