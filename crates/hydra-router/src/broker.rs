//! The broker loop: accept, validate, route, prune.
//!
//! A single task interleaves inbound dispatch, the prune timer, and the
//! shutdown signal. Malformed input of any shape is logged and skipped;
//! the loop itself only stops on shutdown or transport teardown.

use std::net::SocketAddr;
use std::sync::Arc;

use hydra_common::envelope::Envelope;
use hydra_common::transport::RouterSocket;
use hydra_common::types::{Identity, PeerType};
use hydra_common::validate::{validate_envelope, ValidatorLimits};
use hydra_common::HydraError;
use serde_json::Value;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::config::RouterConfig;
use crate::registry::PeerRegistry;
use crate::routing::{route, InboundView, RouteAction};

/// Characters of a non-JSON payload kept in the parse-error log line.
const JSON_LOG_TRUNCATE: usize = 300;

/// The central broker: owns the router endpoint and the peer registry.
pub struct Broker {
    socket: RouterSocket,
    registry: Arc<PeerRegistry>,
    config: RouterConfig,
    shutdown_rx: watch::Receiver<bool>,
}

impl Broker {
    /// Validate the configuration and bind the router endpoint.
    ///
    /// # Errors
    /// Returns a config error for out-of-bounds settings or a connection
    /// error when the address cannot be bound.
    pub async fn bind(
        config: RouterConfig,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Result<Self, HydraError> {
        config.validate()?;
        let socket = RouterSocket::bind(&config.bind_addr()).await?;
        info!(
            addr = %socket.local_addr(),
            client_timeout_secs = config.client_timeout.as_secs_f64(),
            max_clients = config.max_clients,
            "hydra router listening"
        );
        Ok(Self {
            socket,
            registry: Arc::new(PeerRegistry::new()),
            config,
            shutdown_rx,
        })
    }

    /// The bound endpoint address.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.socket.local_addr()
    }

    /// Shared handle to the peer registry.
    #[must_use]
    pub fn registry(&self) -> Arc<PeerRegistry> {
        Arc::clone(&self.registry)
    }

    /// Serve until the shutdown signal fires or the transport goes away.
    ///
    /// # Errors
    /// Currently infallible beyond the `Result` shape; malformed input and
    /// per-peer send failures are recovered in the loop.
    pub async fn run(self) -> Result<(), HydraError> {
        let Broker {
            mut socket,
            registry,
            config,
            mut shutdown_rx,
        } = self;

        let limits = ValidatorLimits {
            max_message_bytes: config.max_message_bytes,
            ..ValidatorLimits::default()
        };
        let mut prune_timer = tokio::time::interval(config.heartbeat_check_interval);
        prune_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                inbound = socket.recv_multipart() => {
                    match inbound {
                        Ok((identity, frames)) => {
                            handle_inbound(&socket, &registry, &config, &limits, &identity, &frames)
                                .await;
                        }
                        Err(e) => {
                            error!("transport receive failed: {e}");
                            break;
                        }
                    }
                }
                _ = prune_timer.tick() => {
                    for record in registry.prune(config.client_timeout) {
                        info!(
                            identity = %record.identity,
                            peer_type = %record.peer_type,
                            "evicted peer after heartbeat timeout"
                        );
                    }
                }
                changed = shutdown_rx.changed() => {
                    // A dropped sender counts as shutdown.
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("shutdown signal received");
                        break;
                    }
                }
            }
        }

        socket.close().await;
        info!("broker stopped");
        Ok(())
    }
}

async fn handle_inbound(
    socket: &RouterSocket,
    registry: &PeerRegistry,
    config: &RouterConfig,
    limits: &ValidatorLimits,
    identity: &Identity,
    frames: &[Vec<u8>],
) {
    let [payload] = frames else {
        warn!(
            identity = %identity,
            frame_count = frames.len(),
            "dropping frame group with unexpected frame count"
        );
        return;
    };

    let raw: Value = match serde_json::from_slice(payload) {
        Ok(value) => value,
        Err(e) => {
            let preview = String::from_utf8_lossy(payload);
            let preview = preview.chars().take(JSON_LOG_TRUNCATE).collect::<String>();
            warn!(
                identity = %identity,
                bytes = payload.len(),
                body = %preview,
                "dropping payload that is not valid JSON: {e}"
            );
            return;
        }
    };

    if let Err(failure) = validate_envelope(&raw, payload.len(), limits) {
        let declared = raw
            .get("sender")
            .and_then(Value::as_str)
            .unwrap_or("<none>");
        warn!(
            identity = %identity,
            declared_sender = declared,
            rule = failure.rule,
            "dropping invalid envelope: {failure}"
        );
        return;
    }

    let envelope = match Envelope::from_slice(payload) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!(identity = %identity, "dropping undecodable envelope: {e}");
            return;
        }
    };
    let Some(sender_type) = PeerType::from_label(&envelope.sender) else {
        warn!(identity = %identity, sender = %envelope.sender, "dropping envelope with unroutable sender");
        return;
    };

    registry.observe(identity, sender_type, envelope.client_id.as_deref());
    let count = registry.len();
    if count > config.max_clients {
        warn!(
            count,
            max_clients = config.max_clients,
            "peer count exceeds configured maximum"
        );
    }

    let inbound = InboundView {
        sender_type,
        kind: envelope.kind(),
        elem: &envelope.elem,
        request_id: envelope.request_id.as_deref(),
    };
    for action in route(identity, &inbound, payload, registry) {
        dispatch(socket, action).await;
    }
}

async fn dispatch(socket: &RouterSocket, action: RouteAction) {
    match action {
        RouteAction::Forward { to, payload } => {
            if let Err(e) = socket.send_multipart(&to, vec![payload]).await {
                warn!(to = %to, "failed to forward message: {e}");
            }
        }
        RouteAction::Reply { to, envelope } => match envelope.to_bytes() {
            Ok(bytes) => {
                if let Err(e) = socket.send_multipart(&to, vec![bytes]).await {
                    warn!(to = %to, elem = %envelope.elem, "failed to send reply: {e}");
                }
            }
            Err(e) => {
                error!(elem = %envelope.elem, "failed to serialize synthesized envelope: {e}");
            }
        },
        RouteAction::Broadcast { to, payload } => {
            for recipient in to {
                if let Err(e) = socket
                    .send_multipart(&recipient, vec![payload.clone()])
                    .await
                {
                    warn!(to = %recipient, "failed to broadcast to peer: {e}");
                }
            }
        }
    }
}
