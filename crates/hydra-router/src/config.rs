//! CLI arguments and broker runtime configuration.

use std::time::Duration;

use clap::{Parser, Subcommand};
use hydra_common::types::{
    DEFAULT_CLIENT_TIMEOUT_SECS, DEFAULT_ROUTER_ADDRESS, DEFAULT_ROUTER_PORT, MAX_MESSAGE_SIZE,
};
use hydra_common::HydraError;

const COMPONENT: &str = "router_config";

/// CLI arguments for the broker binary.
#[derive(Parser, Debug, Clone)]
#[command(name = "hydra-router")]
#[command(about = "Hydra Router - central message broker")]
#[command(version)]
pub struct Args {
    /// Subcommand to run.
    #[command(subcommand)]
    pub command: Command,
}

/// Broker subcommands.
#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Start the broker and serve until interrupted.
    Start(StartArgs),
}

/// Flags for the `start` subcommand.
#[derive(clap::Args, Debug, Clone)]
pub struct StartArgs {
    /// Address to bind the router endpoint to.
    #[arg(long, default_value = DEFAULT_ROUTER_ADDRESS, env = "HYDRA_ROUTER_ADDRESS")]
    pub address: String,
    /// Port to bind the router endpoint to.
    #[arg(long, default_value_t = DEFAULT_ROUTER_PORT, env = "HYDRA_ROUTER_PORT")]
    pub port: u16,
    /// Logging level.
    #[arg(long, default_value = "INFO", value_parser = ["DEBUG", "INFO", "WARNING", "ERROR"])]
    pub log_level: String,
    /// Seconds of silence after which a peer is evicted.
    #[arg(long, default_value_t = DEFAULT_CLIENT_TIMEOUT_SECS, env = "HYDRA_CLIENT_TIMEOUT")]
    pub client_timeout: f64,
    /// Soft cap on concurrently registered peers.
    #[arg(long, default_value_t = 100, env = "HYDRA_MAX_CLIENTS")]
    pub max_clients: usize,
    /// Seconds between registry prune passes. Defaults to a third of the
    /// client timeout, with a one second floor.
    #[arg(long, env = "HYDRA_HEARTBEAT_CHECK_INTERVAL")]
    pub heartbeat_check_interval: Option<f64>,
}

/// Runtime configuration derived from [`StartArgs`].
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Address to bind to.
    pub address: String,
    /// Port to bind to. Zero asks the OS for an ephemeral port.
    pub port: u16,
    /// Silence threshold for eviction.
    pub client_timeout: Duration,
    /// Soft cap on concurrently registered peers.
    pub max_clients: usize,
    /// Interval between prune passes.
    pub heartbeat_check_interval: Duration,
    /// Maximum serialized envelope size accepted.
    pub max_message_bytes: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        let client_timeout = Duration::from_secs_f64(DEFAULT_CLIENT_TIMEOUT_SECS);
        Self {
            address: DEFAULT_ROUTER_ADDRESS.to_string(),
            port: DEFAULT_ROUTER_PORT,
            client_timeout,
            max_clients: 100,
            heartbeat_check_interval: prune_interval_for(client_timeout),
            max_message_bytes: MAX_MESSAGE_SIZE,
        }
    }
}

/// A third of the timeout, floored at one second.
fn prune_interval_for(client_timeout: Duration) -> Duration {
    (client_timeout / 3).max(Duration::from_secs(1))
}

impl RouterConfig {
    /// The `host:port` string the router endpoint binds to.
    #[must_use]
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    /// Check the configuration values are within acceptable bounds.
    ///
    /// # Errors
    /// Returns a config error naming the offending field.
    pub fn validate(&self) -> Result<(), HydraError> {
        if self.address.trim().is_empty() {
            return Err(HydraError::config(COMPONENT, "address must not be empty"));
        }
        if self.client_timeout <= Duration::ZERO {
            return Err(HydraError::config(
                COMPONENT,
                "client_timeout must be greater than 0",
            ));
        }
        if self.client_timeout > Duration::from_secs(3600) {
            return Err(HydraError::config(
                COMPONENT,
                "client_timeout exceeds reasonable limit (3600 seconds)",
            ));
        }
        if self.max_clients == 0 {
            return Err(HydraError::config(
                COMPONENT,
                "max_clients must be greater than 0",
            ));
        }
        if self.max_clients > 10_000 {
            return Err(HydraError::config(
                COMPONENT,
                "max_clients exceeds reasonable limit (10,000)",
            ));
        }
        if self.heartbeat_check_interval < Duration::from_secs(1) {
            return Err(HydraError::config(
                COMPONENT,
                "heartbeat_check_interval must be at least 1 second",
            ));
        }
        if self.max_message_bytes == 0 || self.max_message_bytes > 16 * 1024 * 1024 {
            return Err(HydraError::config(
                COMPONENT,
                "max_message_bytes must be between 1 and 16 MiB",
            ));
        }
        Ok(())
    }
}

impl From<StartArgs> for RouterConfig {
    fn from(args: StartArgs) -> Self {
        let client_timeout = Duration::from_secs_f64(args.client_timeout.max(0.0));
        let heartbeat_check_interval = args
            .heartbeat_check_interval
            .map(|secs| Duration::from_secs_f64(secs.max(0.0)))
            .unwrap_or_else(|| prune_interval_for(client_timeout));
        Self {
            address: args.address,
            port: args.port,
            client_timeout,
            max_clients: args.max_clients,
            heartbeat_check_interval,
            max_message_bytes: MAX_MESSAGE_SIZE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(RouterConfig::default().validate().is_ok());
    }

    #[test]
    fn default_prune_interval_is_a_third_of_timeout() {
        let config = RouterConfig::default();
        assert_eq!(config.heartbeat_check_interval, Duration::from_secs(10));
    }

    #[test]
    fn prune_interval_is_floored_at_one_second() {
        assert_eq!(
            prune_interval_for(Duration::from_secs_f64(1.5)),
            Duration::from_secs(1)
        );
    }

    #[test]
    fn zero_timeout_rejected() {
        let mut c = RouterConfig::default();
        c.client_timeout = Duration::ZERO;
        assert!(c.validate().unwrap_err().to_string().contains("client_timeout"));
    }

    #[test]
    fn zero_max_clients_rejected() {
        let mut c = RouterConfig::default();
        c.max_clients = 0;
        assert!(c.validate().unwrap_err().to_string().contains("max_clients"));
    }

    #[test]
    fn empty_address_rejected() {
        let mut c = RouterConfig::default();
        c.address = "  ".to_string();
        assert!(c.validate().unwrap_err().to_string().contains("address"));
    }

    #[test]
    fn start_args_convert_with_prune_default() {
        let args = StartArgs {
            address: "0.0.0.0".to_string(),
            port: 7000,
            log_level: "DEBUG".to_string(),
            client_timeout: 9.0,
            max_clients: 50,
            heartbeat_check_interval: None,
        };
        let config = RouterConfig::from(args);
        assert_eq!(config.bind_addr(), "0.0.0.0:7000");
        assert_eq!(config.heartbeat_check_interval, Duration::from_secs(3));
        assert!(config.validate().is_ok());
    }
}
