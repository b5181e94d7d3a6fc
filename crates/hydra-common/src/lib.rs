//! Shared protocol pieces for the Hydra Router system.
//!
//! This crate provides:
//! - The on-wire JSON envelope and message-kind set ([`envelope`])
//! - Envelope validation with log-friendly diagnostics ([`validate`])
//! - The dealer/router transport ([`transport`])
//! - Peer types, identities, and protocol constants ([`types`])
//! - The error taxonomy used across broker and peers ([`error`])

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod envelope;
pub mod error;
pub mod transport;
pub mod types;
pub mod validate;

pub use envelope::{Envelope, MessageKind};
pub use error::{ErrorContext, HydraError};
pub use types::{Identity, PeerType};
