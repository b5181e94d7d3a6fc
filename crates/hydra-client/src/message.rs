//! The typed in-process message and its envelope conversions.

use hydra_common::envelope::{unix_now, Envelope, MessageKind};
use hydra_common::types::PeerType;
use hydra_common::HydraError;
use serde_json::{Map, Value};
use tracing::warn;

const COMPONENT: &str = "mq_client";

/// A message as applications see it: typed kind, optional correlation
/// fields, and an open data payload.
///
/// The application owns the record before send and after delivery to a
/// handler; in between the library owns the wire buffers.
#[derive(Debug, Clone, PartialEq)]
pub struct MqMessage {
    /// Message kind; [`MessageKind::Unknown`] preserves a foreign label.
    pub kind: MessageKind,
    /// Stable logical identifier of the producing peer.
    pub client_id: Option<String>,
    /// Correlation token for request/response.
    pub request_id: Option<String>,
    /// Open payload passed through unchanged.
    pub data: Option<Map<String, Value>>,
    /// Send time, seconds since epoch.
    pub timestamp: f64,
}

impl MqMessage {
    /// A message of the given kind, stamped with the current time.
    #[must_use]
    pub fn new(kind: MessageKind) -> Self {
        Self {
            kind,
            client_id: None,
            request_id: None,
            data: None,
            timestamp: unix_now(),
        }
    }

    /// A message of the given kind carrying a data payload.
    #[must_use]
    pub fn with_data(kind: MessageKind, data: Map<String, Value>) -> Self {
        Self {
            data: Some(data),
            ..Self::new(kind)
        }
    }

    /// Convert to the wire envelope, stamping the sender label.
    ///
    /// # Errors
    /// Returns a format error for [`MessageKind::Unknown`]: foreign labels
    /// are surfaced on receive but never re-emitted by this peer.
    pub fn into_envelope(self, sender: PeerType) -> Result<Envelope, HydraError> {
        if let MessageKind::Unknown(label) = &self.kind {
            return Err(HydraError::format(
                COMPONENT,
                format!("cannot send message of unknown kind '{label}'"),
            )
            .with_context("elem", label.clone()));
        }
        Ok(Envelope {
            sender: sender.as_label().to_string(),
            elem: self.kind.as_elem().to_string(),
            timestamp: Some(self.timestamp),
            client_id: self.client_id,
            request_id: self.request_id,
            data: self.data,
        })
    }

    /// Reconstruct from a received envelope. Labels outside the closed set
    /// become [`MessageKind::Unknown`] and are logged once here.
    #[must_use]
    pub fn from_envelope(envelope: Envelope) -> Self {
        let kind = envelope.kind();
        if !kind.is_recognized() {
            warn!(elem = %envelope.elem, "received message of unrecognized kind");
        }
        Self {
            kind,
            client_id: envelope.client_id,
            request_id: envelope.request_id,
            data: envelope.data,
            timestamp: envelope.timestamp.unwrap_or_else(unix_now),
        }
    }
}
