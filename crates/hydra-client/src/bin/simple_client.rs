//! Demo client: sends square requests and prints the results.

#![forbid(unsafe_code)]

use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use hydra_client::{ClientConfig, MessageKind, MqClient, PeerType};
use serde_json::{Map, Value};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "simple-client")]
#[command(about = "Demo square-calculation client for the Hydra Router")]
#[command(version)]
struct Args {
    /// Broker address.
    #[arg(long, default_value = "127.0.0.1")]
    address: String,
    /// Broker port.
    #[arg(long, default_value_t = hydra_common::types::DEFAULT_ROUTER_PORT)]
    port: u16,
    /// Per-request timeout in seconds.
    #[arg(long, default_value_t = 5.0)]
    timeout: f64,
    /// Numbers to square.
    #[arg(default_values_t = vec![2, 3, 7])]
    numbers: Vec<i64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let config = ClientConfig::new(
        format!("{}:{}", args.address, args.port),
        PeerType::SimpleClient,
    );
    let client = MqClient::new(config)?;
    client.connect().await?;
    info!(client_id = client.client_id(), "connected");

    let timeout = Duration::from_secs_f64(args.timeout);
    for number in args.numbers {
        let mut data = Map::new();
        data.insert("number".to_string(), Value::from(number));

        match client
            .request(MessageKind::SquareRequest, data, Some(timeout))
            .await
        {
            Ok(response) if response.kind == MessageKind::SquareResponse => {
                let result = response
                    .data
                    .as_ref()
                    .and_then(|d| d.get("result"))
                    .cloned()
                    .unwrap_or(Value::Null);
                println!("{number}^2 = {result}");
            }
            Ok(response) => {
                let reason = response
                    .data
                    .as_ref()
                    .and_then(|d| d.get("reason"))
                    .and_then(Value::as_str)
                    .unwrap_or("unexpected response");
                warn!(kind = %response.kind.as_elem(), reason, "request not answered");
            }
            Err(e) => warn!("request failed: {e}"),
        }
    }

    client.disconnect().await;
    Ok(())
}
