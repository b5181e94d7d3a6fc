//! The on-wire envelope and the closed message-kind set.
//!
//! Every payload exchanged with the broker is one JSON [`Envelope`].
//! Message kinds map 1:1 to wire `elem` labels; labels outside the closed
//! set survive as [`MessageKind::Unknown`] so that mixed-version
//! deployments keep working.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// In-process tag corresponding 1:1 with a wire `elem` label.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// Periodic liveness announcement.
    Heartbeat,
    /// Broker- or application-synthesized error notification.
    Error,
    /// Demo request: square a number.
    SquareRequest,
    /// Demo response carrying the squared number.
    SquareResponse,
    /// Ask the broker for its registry snapshot.
    ClientRegistryRequest,
    /// Registry snapshot reply from the broker.
    ClientRegistryResponse,
    /// Simulation control command.
    StartSimulation,
    /// Simulation control command.
    StopSimulation,
    /// Simulation control command.
    PauseSimulation,
    /// Simulation control command.
    ResumeSimulation,
    /// Simulation control command.
    ResetSimulation,
    /// Simulation status query.
    GetSimulationStatus,
    /// Unsolicited status broadcast.
    StatusUpdate,
    /// Simulation state notification.
    SimulationStarted,
    /// Simulation state notification.
    SimulationStopped,
    /// Simulation state notification.
    SimulationPaused,
    /// Simulation state notification.
    SimulationResumed,
    /// Simulation state notification.
    SimulationReset,
    /// Sentinel for an `elem` label outside the closed set; carries the
    /// original label so it can be re-emitted unchanged.
    Unknown(String),
}

impl MessageKind {
    /// The wire `elem` label for this kind.
    #[must_use]
    pub fn as_elem(&self) -> &str {
        match self {
            Self::Heartbeat => "heartbeat",
            Self::Error => "error",
            Self::SquareRequest => "square_request",
            Self::SquareResponse => "square_response",
            Self::ClientRegistryRequest => "client_registry_request",
            Self::ClientRegistryResponse => "client_registry_response",
            Self::StartSimulation => "start_simulation",
            Self::StopSimulation => "stop_simulation",
            Self::PauseSimulation => "pause_simulation",
            Self::ResumeSimulation => "resume_simulation",
            Self::ResetSimulation => "reset_simulation",
            Self::GetSimulationStatus => "get_simulation_status",
            Self::StatusUpdate => "status_update",
            Self::SimulationStarted => "simulation_started",
            Self::SimulationStopped => "simulation_stopped",
            Self::SimulationPaused => "simulation_paused",
            Self::SimulationResumed => "simulation_resumed",
            Self::SimulationReset => "simulation_reset",
            Self::Unknown(label) => label,
        }
    }

    /// Map a wire `elem` label to a kind. Labels outside the closed set
    /// become [`MessageKind::Unknown`].
    #[must_use]
    pub fn from_elem(elem: &str) -> Self {
        match elem {
            "heartbeat" => Self::Heartbeat,
            "error" => Self::Error,
            "square_request" => Self::SquareRequest,
            "square_response" => Self::SquareResponse,
            "client_registry_request" => Self::ClientRegistryRequest,
            "client_registry_response" => Self::ClientRegistryResponse,
            "start_simulation" => Self::StartSimulation,
            "stop_simulation" => Self::StopSimulation,
            "pause_simulation" => Self::PauseSimulation,
            "resume_simulation" => Self::ResumeSimulation,
            "reset_simulation" => Self::ResetSimulation,
            "get_simulation_status" => Self::GetSimulationStatus,
            "status_update" => Self::StatusUpdate,
            "simulation_started" => Self::SimulationStarted,
            "simulation_stopped" => Self::SimulationStopped,
            "simulation_paused" => Self::SimulationPaused,
            "simulation_resumed" => Self::SimulationResumed,
            "simulation_reset" => Self::SimulationReset,
            other => Self::Unknown(other.to_string()),
        }
    }

    /// Whether this kind is in the closed set (not the `Unknown` sentinel).
    #[must_use]
    pub fn is_recognized(&self) -> bool {
        !matches!(self, Self::Unknown(_))
    }
}

/// The single on-wire unit exchanged with the broker.
///
/// Absent optional fields are omitted from the JSON form, never emitted as
/// null. Field ordering on the wire is irrelevant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Peer-type label of the producer.
    pub sender: String,
    /// Message-kind label.
    pub elem: String,
    /// Producer-assigned send time, seconds since epoch.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<f64>,
    /// Stable logical identifier chosen by the peer.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    /// Correlation token for request/response.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    /// Open payload; the broker never inspects it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Map<String, Value>>,
}

impl Envelope {
    /// Build an envelope with the current wall-clock timestamp and no
    /// optional fields.
    #[must_use]
    pub fn new(sender: impl Into<String>, kind: &MessageKind) -> Self {
        Self {
            sender: sender.into(),
            elem: kind.as_elem().to_string(),
            timestamp: Some(unix_now()),
            client_id: None,
            request_id: None,
            data: None,
        }
    }

    /// The message kind this envelope's `elem` maps to.
    #[must_use]
    pub fn kind(&self) -> MessageKind {
        MessageKind::from_elem(&self.elem)
    }

    /// Serialize to JSON bytes.
    ///
    /// # Errors
    /// Returns the underlying serializer error; envelope fields are all
    /// JSON-representable so this only fails on pathological payloads.
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Parse JSON bytes into an envelope.
    ///
    /// # Errors
    /// Returns the parse error for non-JSON input or a JSON value that does
    /// not carry the required `sender`/`elem` strings.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// Current wall-clock time as fractional seconds since the Unix epoch.
#[must_use]
pub fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_ELEMS: [&str; 18] = [
        "heartbeat",
        "error",
        "square_request",
        "square_response",
        "client_registry_request",
        "client_registry_response",
        "start_simulation",
        "stop_simulation",
        "pause_simulation",
        "resume_simulation",
        "reset_simulation",
        "get_simulation_status",
        "status_update",
        "simulation_started",
        "simulation_stopped",
        "simulation_paused",
        "simulation_resumed",
        "simulation_reset",
    ];

    #[test]
    fn elem_mapping_round_trips() {
        for elem in ALL_ELEMS {
            let kind = MessageKind::from_elem(elem);
            assert!(kind.is_recognized(), "{elem} should be recognized");
            assert_eq!(kind.as_elem(), elem);
        }
    }

    #[test]
    fn unknown_elem_keeps_its_label() {
        let kind = MessageKind::from_elem("plasma_vent");
        assert_eq!(kind, MessageKind::Unknown("plasma_vent".to_string()));
        assert_eq!(kind.as_elem(), "plasma_vent");
    }

    #[test]
    fn absent_optionals_are_omitted() {
        let env = Envelope {
            sender: "HydraClient".into(),
            elem: "heartbeat".into(),
            timestamp: Some(1.5),
            client_id: None,
            request_id: None,
            data: None,
        };
        let json = String::from_utf8(env.to_bytes().unwrap()).unwrap();
        assert!(!json.contains("client_id"));
        assert!(!json.contains("request_id"));
        assert!(!json.contains("data"));
        assert!(!json.contains("null"));
    }

    #[test]
    fn wire_round_trip_preserves_fields() {
        let mut data = Map::new();
        data.insert("number".into(), Value::from(7));
        let env = Envelope {
            sender: "SimpleClient".into(),
            elem: "square_request".into(),
            timestamp: Some(1_700_000_000.25),
            client_id: Some("SimpleClient-a1b2c3d4".into()),
            request_id: Some("r-1".into()),
            data: Some(data),
        };
        let parsed = Envelope::from_slice(&env.to_bytes().unwrap()).unwrap();
        assert_eq!(parsed, env);
    }

    #[test]
    fn field_order_is_irrelevant_and_null_data_tolerated() {
        let raw = br#"{"data":null,"elem":"heartbeat","sender":"HydraServer"}"#;
        let env = Envelope::from_slice(raw).unwrap();
        assert_eq!(env.kind(), MessageKind::Heartbeat);
        assert_eq!(env.data, None);
        assert_eq!(env.timestamp, None);
    }
}
