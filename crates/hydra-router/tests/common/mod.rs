use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hydra_common::transport::DealerSocket;
use hydra_common::types::Identity;
use hydra_router::{Broker, PeerRegistry, RouterConfig};
use serde_json::{json, Value};
use tokio::sync::watch;

pub fn test_config() -> RouterConfig {
    RouterConfig {
        address: "127.0.0.1".to_string(),
        port: 0,
        ..RouterConfig::default()
    }
}

pub fn test_config_with_timeout(client_timeout: Duration) -> RouterConfig {
    RouterConfig {
        client_timeout,
        heartbeat_check_interval: (client_timeout / 3).max(Duration::from_secs(1)),
        ..test_config()
    }
}

pub struct BrokerHandle {
    pub addr: SocketAddr,
    pub registry: Arc<PeerRegistry>,
    pub shutdown_tx: watch::Sender<bool>,
}

pub async fn start_broker(config: RouterConfig) -> BrokerHandle {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let broker = Broker::bind(config, shutdown_rx).await.unwrap();
    let addr = broker.local_addr();
    let registry = broker.registry();

    tokio::spawn(async move {
        if let Err(e) = broker.run().await {
            eprintln!("broker error in test: {e}");
        }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    BrokerHandle {
        addr,
        registry,
        shutdown_tx,
    }
}

/// Raw dealer speaking the wire protocol directly, for exercising the
/// broker without the client library in the way.
pub struct TestPeer {
    pub socket: DealerSocket,
    pub peer_type: &'static str,
    pub client_id: String,
}

impl TestPeer {
    pub async fn connect(addr: &SocketAddr, peer_type: &'static str, client_id: &str) -> Self {
        let socket = DealerSocket::connect(&addr.to_string(), Some(Identity::from(client_id)))
            .await
            .unwrap();
        Self {
            socket,
            peer_type,
            client_id: client_id.to_string(),
        }
    }

    /// Send a heartbeat and give the broker a beat to register it.
    pub async fn announce(&mut self) {
        self.send_kind("heartbeat", None, None).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
    }

    pub async fn send_kind(
        &mut self,
        elem: &str,
        request_id: Option<&str>,
        data: Option<Value>,
    ) {
        let mut msg = json!({
            "sender": self.peer_type,
            "elem": elem,
            "timestamp": 1_700_000_000.0,
            "client_id": self.client_id,
        });
        if let Some(rid) = request_id {
            msg["request_id"] = json!(rid);
        }
        if let Some(data) = data {
            msg["data"] = data;
        }
        self.send_raw(msg.to_string().as_bytes()).await;
    }

    pub async fn send_raw(&mut self, payload: &[u8]) {
        self.socket.send(payload).await.unwrap();
    }

    pub async fn send_frames(&mut self, frames: &[Vec<u8>]) {
        self.socket.send_multipart(frames).await.unwrap();
    }

    pub async fn recv_json(&mut self) -> Value {
        let payload = tokio::time::timeout(Duration::from_secs(5), self.socket.recv())
            .await
            .expect("timeout waiting for payload")
            .unwrap();
        serde_json::from_slice(&payload).unwrap()
    }

    /// Expect silence for the given window.
    pub async fn recv_none(&mut self, window: Duration) {
        let result = tokio::time::timeout(window, self.socket.recv()).await;
        if let Ok(Ok(payload)) = result {
            let body = String::from_utf8_lossy(&payload).to_string();
            panic!("expected no message, got: {body}");
        }
    }
}
