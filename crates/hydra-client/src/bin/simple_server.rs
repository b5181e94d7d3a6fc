//! Demo server: answers `square_request` with the squared number.

#![forbid(unsafe_code)]

use anyhow::Result;
use clap::Parser;
use hydra_client::{ClientConfig, MessageKind, MqClient, MqMessage, PeerType};
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "simple-server")]
#[command(about = "Demo square-calculation server for the Hydra Router")]
#[command(version)]
struct Args {
    /// Broker address.
    #[arg(long, default_value = "127.0.0.1")]
    address: String,
    /// Broker port.
    #[arg(long, default_value_t = hydra_common::types::DEFAULT_ROUTER_PORT)]
    port: u16,
    /// Logical server id; auto-generated when omitted.
    #[arg(long)]
    server_id: Option<String>,
}

fn square_reply(request: &MqMessage) -> Option<MqMessage> {
    let data = request.data.as_ref()?;
    let number = data.get("number")?;

    let mut out = Map::new();
    out.insert("number".to_string(), number.clone());
    if let Some(n) = number.as_i64() {
        out.insert("result".to_string(), Value::from(n * n));
    } else {
        let n = number.as_f64()?;
        out.insert("result".to_string(), Value::from(n * n));
    }

    let mut reply = MqMessage::with_data(MessageKind::SquareResponse, out);
    reply.request_id = request.request_id.clone();
    Some(reply)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let mut config = ClientConfig::new(
        format!("{}:{}", args.address, args.port),
        PeerType::SimpleServer,
    );
    if let Some(id) = args.server_id {
        config = config.with_client_id(id);
    }

    let client = MqClient::new(config)?;
    client.connect().await?;
    info!(client_id = client.client_id(), "ready to process square requests");

    let request_count = std::sync::Arc::new(std::sync::atomic::AtomicU64::new(0));
    let count_for_heartbeat = std::sync::Arc::clone(&request_count);
    client.set_heartbeat_data_provider(move || {
        let mut extra = Map::new();
        extra.insert(
            "requests_processed".to_string(),
            Value::from(count_for_heartbeat.load(std::sync::atomic::Ordering::Relaxed)),
        );
        extra
    });

    // Handlers run on the receive task and cannot await, so requests are
    // handed to this loop for the actual reply send.
    let (request_tx, mut request_rx) = mpsc::channel::<MqMessage>(64);
    client.register_handler(MessageKind::SquareRequest, move |message| {
        if request_tx.try_send(message).is_err() {
            warn!("request queue full, dropping square request");
        }
        Ok(())
    });

    loop {
        tokio::select! {
            request = request_rx.recv() => {
                let Some(request) = request else { break };
                match square_reply(&request) {
                    Some(reply) => {
                        let processed =
                            request_count.fetch_add(1, std::sync::atomic::Ordering::Relaxed) + 1;
                        info!(
                            from = request.client_id.as_deref().unwrap_or("<anon>"),
                            processed,
                            "answering square request"
                        );
                        if let Err(e) = client.send(reply).await {
                            warn!("failed to send square response: {e}");
                        }
                    }
                    None => {
                        warn!(
                            from = request.client_id.as_deref().unwrap_or("<anon>"),
                            "ignoring square request without a number"
                        );
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("received shutdown signal");
                break;
            }
        }
    }

    client.disconnect().await;
    info!(
        processed = request_count.load(std::sync::atomic::Ordering::Relaxed),
        "server stopped"
    );
    Ok(())
}
