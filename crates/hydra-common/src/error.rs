//! Error taxonomy shared across the broker and the peer library.
//!
//! Errors are values: every variant carries a human message, the component
//! it originated in, and a map of diagnostic fields. Hot paths hand these
//! back to callers or log them; they are never used for control flow.

use std::collections::BTreeMap;
use std::time::Duration;

use thiserror::Error;

/// Diagnostic fields attached to an error (observed envelope summary,
/// identities, durations).
pub type ErrorContext = BTreeMap<String, String>;

/// Closed error taxonomy for the Hydra Router system.
#[derive(Debug, Error)]
pub enum HydraError {
    /// Typed→wire conversion of an unknown kind, or wire→typed with
    /// missing required fields.
    #[error("[{component}] format error: {message}")]
    Format {
        /// Originating component.
        component: &'static str,
        /// Human-readable description.
        message: String,
        /// Diagnostic fields.
        context: ErrorContext,
    },
    /// Broker-side rule failure on an inbound envelope.
    #[error("[{component}] validation error: {message}")]
    Validation {
        /// Originating component.
        component: &'static str,
        /// Human-readable description.
        message: String,
        /// Diagnostic fields.
        context: ErrorContext,
    },
    /// No server available when one is required.
    #[error("[{component}] routing error: {message}")]
    Routing {
        /// Originating component.
        component: &'static str,
        /// Human-readable description.
        message: String,
        /// Diagnostic fields.
        context: ErrorContext,
    },
    /// Transport failure on connect, send, or receive.
    #[error("[{component}] connection error: {message}")]
    Connection {
        /// Originating component.
        component: &'static str,
        /// Human-readable description.
        message: String,
        /// Diagnostic fields.
        context: ErrorContext,
    },
    /// A request deadline elapsed before a matching response arrived.
    #[error("[{component}] timeout: {message}")]
    Timeout {
        /// Originating component.
        component: &'static str,
        /// Human-readable description.
        message: String,
        /// Diagnostic fields.
        context: ErrorContext,
    },
    /// Registry invariant violated.
    #[error("[{component}] registration error: {message}")]
    Registration {
        /// Originating component.
        component: &'static str,
        /// Human-readable description.
        message: String,
        /// Diagnostic fields.
        context: ErrorContext,
    },
    /// Invalid construction parameters.
    #[error("[{component}] config error: {message}")]
    Config {
        /// Originating component.
        component: &'static str,
        /// Human-readable description.
        message: String,
        /// Diagnostic fields.
        context: ErrorContext,
    },
}

impl HydraError {
    /// Format error with an empty context.
    pub fn format(component: &'static str, message: impl Into<String>) -> Self {
        Self::Format {
            component,
            message: message.into(),
            context: ErrorContext::new(),
        }
    }

    /// Validation error with an empty context.
    pub fn validation(component: &'static str, message: impl Into<String>) -> Self {
        Self::Validation {
            component,
            message: message.into(),
            context: ErrorContext::new(),
        }
    }

    /// Routing error with an empty context.
    pub fn routing(component: &'static str, message: impl Into<String>) -> Self {
        Self::Routing {
            component,
            message: message.into(),
            context: ErrorContext::new(),
        }
    }

    /// Connection error with an empty context.
    pub fn connection(component: &'static str, message: impl Into<String>) -> Self {
        Self::Connection {
            component,
            message: message.into(),
            context: ErrorContext::new(),
        }
    }

    /// Connection error naming the remote address and the underlying
    /// failure.
    pub fn connection_failed(
        component: &'static str,
        address: &str,
        source: impl std::fmt::Display,
    ) -> Self {
        Self::Connection {
            component,
            message: format!("failed to reach {address}: {source}"),
            context: ErrorContext::from([
                ("address".to_string(), address.to_string()),
                ("underlying_error".to_string(), source.to_string()),
            ]),
        }
    }

    /// Timeout error naming the operation and the elapsed deadline.
    pub fn timed_out(component: &'static str, operation: &str, timeout: Duration) -> Self {
        Self::Timeout {
            component,
            message: format!("{operation} timed out after {:.1}s", timeout.as_secs_f64()),
            context: ErrorContext::from([
                ("operation".to_string(), operation.to_string()),
                (
                    "timeout_secs".to_string(),
                    format!("{:.3}", timeout.as_secs_f64()),
                ),
            ]),
        }
    }

    /// Registration error with an empty context.
    pub fn registration(component: &'static str, message: impl Into<String>) -> Self {
        Self::Registration {
            component,
            message: message.into(),
            context: ErrorContext::new(),
        }
    }

    /// Config error with an empty context.
    pub fn config(component: &'static str, message: impl Into<String>) -> Self {
        Self::Config {
            component,
            message: message.into(),
            context: ErrorContext::new(),
        }
    }

    /// Attach a diagnostic field, builder-style.
    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context_mut().insert(key.into(), value.into());
        self
    }

    /// The component this error originated in.
    #[must_use]
    pub fn component(&self) -> &'static str {
        match self {
            Self::Format { component, .. }
            | Self::Validation { component, .. }
            | Self::Routing { component, .. }
            | Self::Connection { component, .. }
            | Self::Timeout { component, .. }
            | Self::Registration { component, .. }
            | Self::Config { component, .. } => component,
        }
    }

    /// The diagnostic field map.
    #[must_use]
    pub fn context(&self) -> &ErrorContext {
        match self {
            Self::Format { context, .. }
            | Self::Validation { context, .. }
            | Self::Routing { context, .. }
            | Self::Connection { context, .. }
            | Self::Timeout { context, .. }
            | Self::Registration { context, .. }
            | Self::Config { context, .. } => context,
        }
    }

    fn context_mut(&mut self) -> &mut ErrorContext {
        match self {
            Self::Format { context, .. }
            | Self::Validation { context, .. }
            | Self::Routing { context, .. }
            | Self::Connection { context, .. }
            | Self::Timeout { context, .. }
            | Self::Registration { context, .. }
            | Self::Config { context, .. } => context,
        }
    }

    /// Whether this is a timeout error.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Whether this is a connection error.
    #[must_use]
    pub fn is_connection(&self) -> bool {
        matches!(self, Self::Connection { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_names_component_and_message() {
        let err = HydraError::routing("router", "no server connected");
        assert_eq!(
            err.to_string(),
            "[router] routing error: no server connected"
        );
    }

    #[test]
    fn with_context_accumulates_fields() {
        let err = HydraError::connection("transport", "peer gone")
            .with_context("identity", "ab01")
            .with_context("frames", "2");
        assert_eq!(err.context().get("identity").unwrap(), "ab01");
        assert_eq!(err.context().len(), 2);
    }

    #[test]
    fn timeout_helper_records_duration() {
        let err = HydraError::timed_out("mq_client", "request", Duration::from_secs(2));
        assert!(err.is_timeout());
        assert_eq!(err.context().get("operation").unwrap(), "request");
        assert_eq!(err.context().get("timeout_secs").unwrap(), "2.000");
    }
}
