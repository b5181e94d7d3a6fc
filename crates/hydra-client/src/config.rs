//! Client session configuration.

use std::time::Duration;

use hydra_common::types::{
    DEFAULT_PEER_MESSAGE_SIZE, DEFAULT_REQUEST_TIMEOUT_SECS, HEARTBEAT_INTERVAL_SECS,
    MAX_MESSAGE_SIZE, PeerType,
};
use hydra_common::HydraError;
use uuid::Uuid;

const COMPONENT: &str = "client_config";

/// Construction parameters for an [`MqClient`](crate::MqClient) session.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// `host:port` of the broker's router endpoint.
    pub router_address: String,
    /// Declared peer type. The broker's own label is not a peer type, so
    /// it cannot be configured here.
    pub peer_type: PeerType,
    /// Stable logical identifier; also used as the transport identity.
    pub client_id: String,
    /// Interval between heartbeats.
    pub heartbeat_interval: Duration,
    /// Default deadline for `request` calls.
    pub request_timeout: Duration,
    /// Serialized envelope ceiling enforced before send.
    pub max_message_bytes: usize,
}

impl ClientConfig {
    /// Config with defaults and an auto-generated client id of the form
    /// `{type}-{8 hex chars}`.
    #[must_use]
    pub fn new(router_address: impl Into<String>, peer_type: PeerType) -> Self {
        let suffix = Uuid::new_v4().simple().to_string();
        Self {
            router_address: router_address.into(),
            peer_type,
            client_id: format!("{}-{}", peer_type.as_label(), &suffix[..8]),
            heartbeat_interval: Duration::from_secs_f64(HEARTBEAT_INTERVAL_SECS),
            request_timeout: Duration::from_secs_f64(DEFAULT_REQUEST_TIMEOUT_SECS),
            max_message_bytes: DEFAULT_PEER_MESSAGE_SIZE,
        }
    }

    /// Replace the auto-generated client id.
    #[must_use]
    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = client_id.into();
        self
    }

    /// Replace the heartbeat interval.
    #[must_use]
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Replace the default request timeout.
    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Check the configuration values are within acceptable bounds.
    ///
    /// # Errors
    /// Returns a config error naming the offending field.
    pub fn validate(&self) -> Result<(), HydraError> {
        if self.router_address.trim().is_empty() || !self.router_address.contains(':') {
            return Err(HydraError::config(
                COMPONENT,
                format!(
                    "router_address must be host:port, got '{}'",
                    self.router_address
                ),
            ));
        }
        if self.client_id.trim().is_empty() {
            return Err(HydraError::config(COMPONENT, "client_id must not be empty"));
        }
        if self.heartbeat_interval <= Duration::ZERO {
            return Err(HydraError::config(
                COMPONENT,
                "heartbeat_interval must be greater than 0",
            ));
        }
        if self.heartbeat_interval > Duration::from_secs(300) {
            return Err(HydraError::config(
                COMPONENT,
                "heartbeat_interval exceeds reasonable limit (300 seconds)",
            ));
        }
        if self.request_timeout <= Duration::ZERO {
            return Err(HydraError::config(
                COMPONENT,
                "request_timeout must be greater than 0",
            ));
        }
        if self.max_message_bytes == 0 || self.max_message_bytes > MAX_MESSAGE_SIZE {
            return Err(HydraError::config(
                COMPONENT,
                format!("max_message_bytes must be between 1 and {MAX_MESSAGE_SIZE}"),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = ClientConfig::new("127.0.0.1:5556", PeerType::SimpleClient);
        assert!(config.validate().is_ok());
        assert_eq!(config.heartbeat_interval, Duration::from_secs(5));
        assert_eq!(config.request_timeout, Duration::from_secs(10));
        assert_eq!(config.max_message_bytes, 65_536);
    }

    #[test]
    fn auto_client_id_carries_the_type_label() {
        let config = ClientConfig::new("127.0.0.1:5556", PeerType::HydraServer);
        assert!(config.client_id.starts_with("HydraServer-"));
        assert_eq!(config.client_id.len(), "HydraServer-".len() + 8);

        let other = ClientConfig::new("127.0.0.1:5556", PeerType::HydraServer);
        assert_ne!(config.client_id, other.client_id);
    }

    #[test]
    fn bad_address_rejected() {
        let config = ClientConfig::new("nonsense", PeerType::SimpleClient);
        assert!(config.validate().unwrap_err().to_string().contains("router_address"));
    }

    #[test]
    fn zero_intervals_rejected() {
        let config = ClientConfig::new("127.0.0.1:5556", PeerType::SimpleClient)
            .with_heartbeat_interval(Duration::ZERO);
        assert!(config.validate().is_err());

        let config = ClientConfig::new("127.0.0.1:5556", PeerType::SimpleClient)
            .with_request_timeout(Duration::ZERO);
        assert!(config.validate().is_err());
    }

    #[test]
    fn empty_client_id_rejected() {
        let config =
            ClientConfig::new("127.0.0.1:5556", PeerType::SimpleClient).with_client_id("  ");
        assert!(config.validate().is_err());
    }
}
