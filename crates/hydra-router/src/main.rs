#![forbid(unsafe_code)]

use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use hydra_router::{Args, Broker, Command, RouterConfig};
use tokio::sync::watch;
use tracing::{error, info, warn};

/// How long shutdown waits for the broker loop before abandoning it.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let Command::Start(start) = args.command;

    let level = match start.log_level.as_str() {
        "DEBUG" => tracing::Level::DEBUG,
        "WARNING" => tracing::Level::WARN,
        "ERROR" => tracing::Level::ERROR,
        _ => tracing::Level::INFO,
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    let config = RouterConfig::from(start);
    if let Err(e) = config.validate() {
        anyhow::bail!("configuration error: {e}");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let broker = Broker::bind(config, shutdown_rx)
        .await
        .map_err(|e| anyhow::anyhow!("failed to start broker: {e}"))?;

    let mut run_task = tokio::spawn(broker.run());

    tokio::select! {
        result = &mut run_task => {
            match result {
                Ok(Ok(())) => info!("broker exited"),
                Ok(Err(e)) => error!("broker error: {e}"),
                Err(e) => error!("broker task failed: {e}"),
            }
            return Ok(());
        }
        _ = tokio::signal::ctrl_c() => {
            info!("received shutdown signal");
            let _ = shutdown_tx.send(true);
        }
    }

    match tokio::time::timeout(SHUTDOWN_GRACE, run_task).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => error!("broker error during shutdown: {e}"),
        Ok(Err(e)) => error!("broker task failed during shutdown: {e}"),
        Err(_) => warn!("broker did not stop within the grace period"),
    }

    Ok(())
}
