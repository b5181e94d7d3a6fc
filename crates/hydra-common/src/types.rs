//! Core type definitions and protocol constants for the Hydra Router wire
//! protocol.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Default port the broker binds its router endpoint to.
pub const DEFAULT_ROUTER_PORT: u16 = 5556;
/// Default address the broker binds to.
pub const DEFAULT_ROUTER_ADDRESS: &str = "127.0.0.1";
/// Default interval between peer heartbeats, in seconds.
pub const HEARTBEAT_INTERVAL_SECS: f64 = 5.0;
/// Default broker-side timeout after which a silent peer is evicted.
pub const DEFAULT_CLIENT_TIMEOUT_SECS: f64 = 30.0;
/// Default peer-side timeout for a request awaiting its response.
pub const DEFAULT_REQUEST_TIMEOUT_SECS: f64 = 10.0;

/// Maximum serialized envelope size accepted by the broker.
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;
/// Maximum serialized size of the `data` payload alone.
pub const MAX_DATA_SIZE: usize = 512 * 1024;
/// Default peer-side serialized envelope ceiling.
pub const DEFAULT_PEER_MESSAGE_SIZE: usize = 65_536;

/// Wire label the broker stamps on envelopes it synthesizes itself.
pub const ROUTER_LABEL: &str = "HydraRouter";

/// Declared type of a peer connected to the broker.
///
/// The two client labels and the two server labels are routed identically
/// within their category; the distinction only matters to applications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PeerType {
    /// Full client peer.
    #[serde(rename = "HydraClient")]
    HydraClient,
    /// Full server peer.
    #[serde(rename = "HydraServer")]
    HydraServer,
    /// Demo client peer; routed like [`PeerType::HydraClient`].
    #[serde(rename = "SimpleClient")]
    SimpleClient,
    /// Demo server peer; routed like [`PeerType::HydraServer`].
    #[serde(rename = "SimpleServer")]
    SimpleServer,
}

impl PeerType {
    /// All labels accepted in the `sender` field of an inbound envelope.
    ///
    /// [`ROUTER_LABEL`] is deliberately absent: the broker's own label is
    /// only valid on envelopes it synthesizes.
    pub const VALID_SENDERS: [&'static str; 4] = [
        "HydraClient",
        "HydraServer",
        "SimpleClient",
        "SimpleServer",
    ];

    /// Parse a wire label into a peer type.
    pub fn from_label(label: &str) -> Option<Self> {
        match label {
            "HydraClient" => Some(Self::HydraClient),
            "HydraServer" => Some(Self::HydraServer),
            "SimpleClient" => Some(Self::SimpleClient),
            "SimpleServer" => Some(Self::SimpleServer),
            _ => None,
        }
    }

    /// The wire label for this peer type.
    #[must_use]
    pub fn as_label(&self) -> &'static str {
        match self {
            Self::HydraClient => "HydraClient",
            Self::HydraServer => "HydraServer",
            Self::SimpleClient => "SimpleClient",
            Self::SimpleServer => "SimpleServer",
        }
    }

    /// Whether this type belongs to the client category (initiates
    /// requests).
    #[must_use]
    pub fn is_client(&self) -> bool {
        matches!(self, Self::HydraClient | Self::SimpleClient)
    }

    /// Whether this type belongs to the server category (handles requests,
    /// emits broadcasts).
    #[must_use]
    pub fn is_server(&self) -> bool {
        matches!(self, Self::HydraServer | Self::SimpleServer)
    }
}

impl fmt::Display for PeerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_label())
    }
}

/// Opaque transport-assigned bytes naming a peer's connection.
///
/// Distinct from a declared `client_id`: the identity names the wire
/// connection, the `client_id` is a stable logical name the peer picks.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Identity(Vec<u8>);

impl Identity {
    /// Wrap raw identity bytes.
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// The raw identity bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Whether the identity is empty (a dealer that declined to announce
    /// one).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Render the identity for logs and registry snapshots: UTF-8 when the
    /// bytes are printable, hex otherwise.
    #[must_use]
    pub fn display(&self) -> String {
        match std::str::from_utf8(&self.0) {
            Ok(s) if s.chars().all(|c| !c.is_control()) && !s.is_empty() => s.to_string(),
            _ => self.0.iter().map(|b| format!("{b:02x}")).collect(),
        }
    }
}

impl From<&str> for Identity {
    fn from(s: &str) -> Self {
        Self(s.as_bytes().to_vec())
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_round_trip() {
        for label in PeerType::VALID_SENDERS {
            let ty = PeerType::from_label(label).unwrap();
            assert_eq!(ty.as_label(), label);
        }
    }

    #[test]
    fn router_label_is_not_a_valid_sender() {
        assert!(PeerType::from_label(ROUTER_LABEL).is_none());
        assert!(!PeerType::VALID_SENDERS.contains(&ROUTER_LABEL));
    }

    #[test]
    fn categories_are_disjoint() {
        for label in PeerType::VALID_SENDERS {
            let ty = PeerType::from_label(label).unwrap();
            assert_ne!(ty.is_client(), ty.is_server());
        }
        assert!(PeerType::SimpleClient.is_client());
        assert!(PeerType::SimpleServer.is_server());
    }

    #[test]
    fn identity_display_prefers_utf8() {
        assert_eq!(Identity::from("SimpleClient-1").display(), "SimpleClient-1");
        assert_eq!(Identity::new(vec![0x00, 0xab]).display(), "00ab");
    }
}
