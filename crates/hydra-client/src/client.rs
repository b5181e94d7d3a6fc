//! The peer-side session: connect, heartbeat, send, receive, correlate.
//!
//! The dealer socket is owned by two background tasks (one per direction)
//! so the receive loop can never stall a send. Applications talk typed
//! [`MqMessage`]s; request/response correlation runs over single-shot
//! slots keyed by `request_id`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use hydra_common::envelope::{Envelope, MessageKind};
use hydra_common::transport::{DealerReader, DealerSocket, DealerWriter};
use hydra_common::types::{Identity, PeerType};
use hydra_common::HydraError;
use serde_json::{Map, Value};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::ClientConfig;
use crate::message::MqMessage;

const COMPONENT: &str = "mq_client";
/// Receive failures in a row before the session gives up.
const MAX_CONSECUTIVE_RECV_ERRORS: u32 = 3;
/// Queue depth of the outbound send channel.
const OUTBOX_QUEUE: usize = 256;
/// How long `disconnect` waits for each background task.
const DISCONNECT_GRACE: Duration = Duration::from_secs(2);

/// Handler for unsolicited inbound messages. Runs on the receive task and
/// must not block it; a returned error is logged and the loop continues.
pub type Handler = Arc<dyn Fn(MqMessage) -> Result<(), HydraError> + Send + Sync>;

/// Supplier of extra fields merged into heartbeat payloads.
pub type HeartbeatDataFn = Arc<dyn Fn() -> Map<String, Value> + Send + Sync>;

/// Connection status of the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnStatus {
    /// No active session.
    Disconnected,
    /// Session established, background tasks running.
    Connected,
}

/// Snapshot of session state for diagnostics.
#[derive(Debug, Clone)]
pub struct ClientInfo {
    /// Configured logical id.
    pub client_id: String,
    /// Declared peer type.
    pub peer_type: PeerType,
    /// Broker endpoint address.
    pub router_address: String,
    /// Whether a session is currently up.
    pub connected: bool,
    /// Requests still awaiting a response.
    pub pending_requests: usize,
    /// Kinds with a registered handler.
    pub registered_handlers: Vec<String>,
}

struct Shared {
    pending: Mutex<HashMap<String, oneshot::Sender<MqMessage>>>,
    handlers: Mutex<HashMap<MessageKind, Handler>>,
    heartbeat_data: Mutex<Option<HeartbeatDataFn>>,
    status_tx: watch::Sender<ConnStatus>,
}

impl Shared {
    fn lock_pending(&self) -> std::sync::MutexGuard<'_, HashMap<String, oneshot::Sender<MqMessage>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_handlers(&self) -> std::sync::MutexGuard<'_, HashMap<MessageKind, Handler>> {
        self.handlers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Drop every pending slot; their requesters see a connection error.
    fn fail_pending(&self, reason: &str) {
        let mut pending = self.lock_pending();
        if !pending.is_empty() {
            debug!(count = pending.len(), reason, "failing pending requests");
        }
        pending.clear();
    }
}

struct Session {
    outbox_tx: mpsc::Sender<Vec<u8>>,
    shutdown_tx: watch::Sender<bool>,
    reader_task: JoinHandle<()>,
    writer_task: JoinHandle<()>,
    heartbeat_task: JoinHandle<()>,
}

/// A peer session with the broker.
pub struct MqClient {
    config: ClientConfig,
    shared: Arc<Shared>,
    status_rx: watch::Receiver<ConnStatus>,
    session: tokio::sync::Mutex<Option<Session>>,
}

impl MqClient {
    /// Create a client for the given configuration.
    ///
    /// # Errors
    /// Returns a config error for out-of-bounds settings.
    pub fn new(config: ClientConfig) -> Result<Self, HydraError> {
        config.validate()?;
        let (status_tx, status_rx) = watch::channel(ConnStatus::Disconnected);
        Ok(Self {
            config,
            shared: Arc::new(Shared {
                pending: Mutex::new(HashMap::new()),
                handlers: Mutex::new(HashMap::new()),
                heartbeat_data: Mutex::new(None),
                status_tx,
            }),
            status_rx,
            session: tokio::sync::Mutex::new(None),
        })
    }

    /// Open the dealer socket, send an initial heartbeat, and start the
    /// background tasks. Calling this while connected is a no-op.
    ///
    /// # Errors
    /// Returns a connection error when the broker endpoint is unreachable.
    pub async fn connect(&self) -> Result<(), HydraError> {
        let mut session = self.session.lock().await;
        if session.is_some() {
            debug!("connect called while already connected");
            return Ok(());
        }

        let socket = DealerSocket::connect(
            &self.config.router_address,
            Some(Identity::from(self.config.client_id.as_str())),
        )
        .await?;
        let (reader, writer) = socket.into_split();

        let (outbox_tx, outbox_rx) = mpsc::channel(OUTBOX_QUEUE);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let writer_task = tokio::spawn(write_loop(writer, outbox_rx, shutdown_rx.clone()));
        let reader_task = tokio::spawn(read_loop(
            reader,
            Arc::clone(&self.shared),
            shutdown_rx.clone(),
            shutdown_tx.clone(),
        ));
        // The heartbeat interval fires immediately, which doubles as the
        // initial registration heartbeat.
        let heartbeat_task = tokio::spawn(heartbeat_loop(
            outbox_tx.clone(),
            self.config.clone(),
            Arc::clone(&self.shared),
            shutdown_rx,
        ));

        self.shared.status_tx.send_replace(ConnStatus::Connected);
        info!(
            client_id = %self.config.client_id,
            peer_type = %self.config.peer_type,
            addr = %self.config.router_address,
            "connected to router"
        );

        *session = Some(Session {
            outbox_tx,
            shutdown_tx,
            reader_task,
            writer_task,
            heartbeat_task,
        });
        Ok(())
    }

    /// Stop background tasks, close the socket, and resolve all pending
    /// requests with a connection error. Idempotent.
    pub async fn disconnect(&self) {
        let Some(session) = self.session.lock().await.take() else {
            return;
        };
        info!(client_id = %self.config.client_id, "disconnecting from router");

        let _ = session.shutdown_tx.send(true);
        self.shared.status_tx.send_replace(ConnStatus::Disconnected);

        for (name, task) in [
            ("heartbeat", session.heartbeat_task),
            ("writer", session.writer_task),
            ("reader", session.reader_task),
        ] {
            let mut task = task;
            if tokio::time::timeout(DISCONNECT_GRACE, &mut task).await.is_err() {
                task.abort();
                warn!(task = name, "task did not stop within grace period");
            }
        }

        self.shared.fail_pending("client disconnected");
        info!(client_id = %self.config.client_id, "disconnected");
    }

    /// Convert, serialize, and queue a message for sending.
    ///
    /// # Errors
    /// Format error for unknown kinds, validation error for oversized
    /// messages, connection error when not connected.
    pub async fn send(&self, mut message: MqMessage) -> Result<(), HydraError> {
        let outbox = {
            let session = self.session.lock().await;
            match session.as_ref() {
                Some(s) => s.outbox_tx.clone(),
                None => {
                    return Err(HydraError::connection(COMPONENT, "not connected to router"));
                }
            }
        };

        if message.client_id.is_none() {
            message.client_id = Some(self.config.client_id.clone());
        }
        let envelope = message.into_envelope(self.config.peer_type)?;
        let bytes = envelope
            .to_bytes()
            .map_err(|e| HydraError::format(COMPONENT, format!("serialization failed: {e}")))?;
        if bytes.len() > self.config.max_message_bytes {
            return Err(HydraError::validation(
                COMPONENT,
                format!(
                    "message size {} bytes exceeds maximum {} bytes",
                    bytes.len(),
                    self.config.max_message_bytes
                ),
            )
            .with_context("elem", envelope.elem));
        }

        outbox
            .send(bytes)
            .await
            .map_err(|_| HydraError::connection(COMPONENT, "session closed while sending"))
    }

    /// Send a request and await the correlated response.
    ///
    /// A fresh `request_id` is generated; the call resolves with whatever
    /// envelope comes back carrying it (including broker-synthesized
    /// errors), or a timeout error after `timeout` (the configured default
    /// when `None`). The pending slot is removed on every exit path.
    ///
    /// # Errors
    /// Everything `send` can return, plus timeout and disconnect errors.
    pub async fn request(
        &self,
        kind: MessageKind,
        data: Map<String, Value>,
        timeout: Option<Duration>,
    ) -> Result<MqMessage, HydraError> {
        let timeout = timeout.unwrap_or(self.config.request_timeout);
        let elem = kind.as_elem().to_string();
        let request_id = Uuid::new_v4().to_string();

        let (tx, rx) = oneshot::channel();
        self.shared.lock_pending().insert(request_id.clone(), tx);

        let mut message = MqMessage::with_data(kind, data);
        message.request_id = Some(request_id.clone());
        if let Err(e) = self.send(message).await {
            self.shared.lock_pending().remove(&request_id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => {
                self.shared.lock_pending().remove(&request_id);
                Err(HydraError::connection(
                    COMPONENT,
                    "disconnected before a response arrived",
                )
                .with_context("request_id", request_id)
                .with_context("elem", elem))
            }
            Err(_) => {
                self.shared.lock_pending().remove(&request_id);
                Err(HydraError::timed_out(COMPONENT, "request", timeout)
                    .with_context("request_id", request_id)
                    .with_context("elem", elem))
            }
        }
    }

    /// Ask the broker for its registry snapshot.
    ///
    /// # Errors
    /// Same as [`MqClient::request`].
    pub async fn query_registry(&self, timeout: Option<Duration>) -> Result<MqMessage, HydraError> {
        self.request(MessageKind::ClientRegistryRequest, Map::new(), timeout)
            .await
    }

    /// Install a handler for unsolicited messages of a kind, replacing any
    /// previous one. Without a handler such messages are logged and
    /// dropped.
    pub fn register_handler<F>(&self, kind: MessageKind, handler: F)
    where
        F: Fn(MqMessage) -> Result<(), HydraError> + Send + Sync + 'static,
    {
        debug!(kind = %kind.as_elem(), "registered message handler");
        self.shared.lock_handlers().insert(kind, Arc::new(handler));
    }

    /// Remove the handler for a kind, if any.
    pub fn unregister_handler(&self, kind: &MessageKind) {
        if self.shared.lock_handlers().remove(kind).is_some() {
            debug!(kind = %kind.as_elem(), "unregistered message handler");
        }
    }

    /// Install a supplier of extra fields for heartbeat payloads, e.g.
    /// request counters.
    pub fn set_heartbeat_data_provider<F>(&self, provider: F)
    where
        F: Fn() -> Map<String, Value> + Send + Sync + 'static,
    {
        *self
            .shared
            .heartbeat_data
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(provider));
    }

    /// Whether a session is currently up.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        *self.status_rx.borrow() == ConnStatus::Connected
    }

    /// Watch for connection status changes.
    #[must_use]
    pub fn status_watch(&self) -> watch::Receiver<ConnStatus> {
        self.status_rx.clone()
    }

    /// The configured client id.
    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.config.client_id
    }

    /// Diagnostic snapshot of the session.
    #[must_use]
    pub fn client_info(&self) -> ClientInfo {
        ClientInfo {
            client_id: self.config.client_id.clone(),
            peer_type: self.config.peer_type,
            router_address: self.config.router_address.clone(),
            connected: self.is_connected(),
            pending_requests: self.shared.lock_pending().len(),
            registered_handlers: self
                .shared
                .lock_handlers()
                .keys()
                .map(|k| k.as_elem().to_string())
                .collect(),
        }
    }
}

async fn write_loop(
    mut writer: DealerWriter,
    mut outbox_rx: mpsc::Receiver<Vec<u8>>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            queued = outbox_rx.recv() => {
                match queued {
                    Some(bytes) => {
                        if let Err(e) = writer.send(&bytes).await {
                            warn!("send to router failed: {e}");
                        }
                    }
                    None => break,
                }
            }
            changed = shutdown_rx.changed() => {
                // A dropped sender counts as shutdown.
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
    writer.close().await;
}

async fn read_loop(
    mut reader: DealerReader,
    shared: Arc<Shared>,
    mut shutdown_rx: watch::Receiver<bool>,
    shutdown_tx: watch::Sender<bool>,
) {
    let mut consecutive_errors = 0u32;
    loop {
        tokio::select! {
            inbound = reader.recv() => {
                match inbound {
                    Ok(payload) => {
                        consecutive_errors = 0;
                        process_inbound(&shared, &payload);
                    }
                    Err(e) => {
                        consecutive_errors += 1;
                        warn!(consecutive_errors, "receive from router failed: {e}");
                        if consecutive_errors >= MAX_CONSECUTIVE_RECV_ERRORS {
                            error!("connection to router lost");
                            shared.fail_pending("connection lost");
                            shared.status_tx.send_replace(ConnStatus::Disconnected);
                            let _ = shutdown_tx.send(true);
                            break;
                        }
                    }
                }
            }
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
}

fn process_inbound(shared: &Shared, payload: &[u8]) {
    let envelope = match Envelope::from_slice(payload) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!(bytes = payload.len(), "discarding undecodable payload: {e}");
            return;
        }
    };

    // Responses resolve their pending slot; everything else goes to a
    // handler.
    if let Some(request_id) = &envelope.request_id {
        let slot = shared.lock_pending().remove(request_id);
        if let Some(tx) = slot {
            let _ = tx.send(MqMessage::from_envelope(envelope));
            return;
        }
    }

    let message = MqMessage::from_envelope(envelope);
    let handler = shared.lock_handlers().get(&message.kind).cloned();
    match handler {
        Some(handler) => {
            let kind_label = message.kind.as_elem().to_string();
            if let Err(e) = handler(message) {
                error!(kind = %kind_label, "message handler failed: {e}");
            }
        }
        None => {
            debug!(kind = %message.kind.as_elem(), "no handler for message kind");
        }
    }
}

async fn heartbeat_loop(
    outbox_tx: mpsc::Sender<Vec<u8>>,
    config: ClientConfig,
    shared: Arc<Shared>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(config.heartbeat_interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let mut data = Map::new();
                data.insert("status".to_string(), Value::from("alive"));
                let provider = shared
                    .heartbeat_data
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clone();
                if let Some(provider) = provider {
                    data.extend(provider());
                }
                let mut message = MqMessage::with_data(MessageKind::Heartbeat, data);
                message.client_id = Some(config.client_id.clone());

                let bytes = message
                    .into_envelope(config.peer_type)
                    .and_then(|envelope| {
                        envelope.to_bytes().map_err(|e| {
                            HydraError::format(COMPONENT, format!("serialization failed: {e}"))
                        })
                    });
                match bytes {
                    Ok(bytes) => {
                        if outbox_tx.send(bytes).await.is_err() {
                            break;
                        }
                        debug!("sent heartbeat");
                    }
                    Err(e) => warn!("failed to build heartbeat: {e}"),
                }
            }
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
}
