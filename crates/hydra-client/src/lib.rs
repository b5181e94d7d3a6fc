//! Peer-side session library for the Hydra Router protocol.
//!
//! Applications construct an [`MqClient`], register handlers for
//! unsolicited messages, and exchange typed [`MqMessage`]s; the library
//! handles envelope conversion, heartbeats, and request/response
//! correlation.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod client;
pub mod config;
pub mod message;

pub use client::{ClientInfo, ConnStatus, MqClient};
pub use config::ClientConfig;
pub use message::MqMessage;

pub use hydra_common::{HydraError, MessageKind, PeerType};
