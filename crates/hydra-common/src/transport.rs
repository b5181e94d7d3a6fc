//! Dealer/router transport over TCP.
//!
//! A minimal identity-preserving multipart transport with ZeroMQ-style
//! semantics: dealers connect to a router endpoint, the router addresses
//! peers by an opaque identity, and each message is a group of frames.
//!
//! Wire format, per stream message: a 4-byte big-endian group length,
//! then a 4-byte frame count, then each frame as a 4-byte length plus its
//! bytes. On connect a dealer announces its identity in an initial
//! single-frame group; an empty announcement makes the router assign
//! random identity bytes (the dealer stays anonymous, as with an unset
//! socket identity).

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::error::HydraError;
use crate::types::Identity;

const COMPONENT: &str = "transport";

/// Upper bound on a serialized frame group. Comfortably above the broker's
/// envelope ceiling so oversized envelopes reach the validator and produce
/// a diagnostic instead of killing the connection.
pub const MAX_GROUP_BYTES: usize = 2 * 1024 * 1024;
/// Upper bound on frames per group.
pub const MAX_FRAMES_PER_GROUP: usize = 16;
/// How long the router waits for a dealer's identity announcement.
const ANNOUNCE_TIMEOUT: Duration = Duration::from_secs(5);
/// Queue depth of the per-connection delivery channel.
const DELIVER_QUEUE: usize = 256;
/// Queue depth of the router's shared inbound channel.
const INBOUND_QUEUE: usize = 1024;

async fn write_group(writer: &mut OwnedWriteHalf, frames: &[Vec<u8>]) -> io::Result<()> {
    let body_len: usize = 4 + frames.iter().map(|f| 4 + f.len()).sum::<usize>();
    if body_len > MAX_GROUP_BYTES {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("frame group of {body_len} bytes exceeds {MAX_GROUP_BYTES}"),
        ));
    }
    let mut buf = Vec::with_capacity(4 + body_len);
    buf.extend_from_slice(&(body_len as u32).to_be_bytes());
    buf.extend_from_slice(&(frames.len() as u32).to_be_bytes());
    for frame in frames {
        buf.extend_from_slice(&(frame.len() as u32).to_be_bytes());
        buf.extend_from_slice(frame);
    }
    writer.write_all(&buf).await?;
    writer.flush().await
}

async fn read_group(reader: &mut OwnedReadHalf) -> io::Result<Vec<Vec<u8>>> {
    let body_len = reader.read_u32().await? as usize;
    if body_len < 4 || body_len > MAX_GROUP_BYTES {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame group length {body_len} out of bounds"),
        ));
    }
    let mut body = vec![0u8; body_len];
    reader.read_exact(&mut body).await?;

    let count = u32::from_be_bytes([body[0], body[1], body[2], body[3]]) as usize;
    if count > MAX_FRAMES_PER_GROUP {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame count {count} exceeds {MAX_FRAMES_PER_GROUP}"),
        ));
    }
    let mut frames = Vec::with_capacity(count);
    let mut offset = 4;
    for _ in 0..count {
        if offset + 4 > body.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "truncated frame header",
            ));
        }
        let len = u32::from_be_bytes([
            body[offset],
            body[offset + 1],
            body[offset + 2],
            body[offset + 3],
        ]) as usize;
        offset += 4;
        if offset + len > body.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "truncated frame body",
            ));
        }
        frames.push(body[offset..offset + len].to_vec());
        offset += len;
    }
    if offset != body.len() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "trailing bytes after last frame",
        ));
    }
    Ok(frames)
}

fn random_identity() -> Identity {
    let bytes: [u8; 8] = rand::random();
    Identity::new(bytes.to_vec())
}

/// Handle held in the routing table, used to queue frame groups for one
/// connection's writer task.
#[derive(Clone, Debug)]
struct ConnHandle {
    tx: mpsc::Sender<Vec<Vec<u8>>>,
    connected_at: Instant,
}

/// Router-side endpoint: accepts dealer connections and exchanges
/// identity-tagged frame groups with them.
#[derive(Debug)]
pub struct RouterSocket {
    local_addr: SocketAddr,
    conns: Arc<DashMap<Identity, ConnHandle>>,
    inbound_rx: mpsc::Receiver<(Identity, Vec<Vec<u8>>)>,
    shutdown_tx: watch::Sender<bool>,
    accept_task: JoinHandle<()>,
}

impl RouterSocket {
    /// Bind the router endpoint and start accepting dealers.
    ///
    /// # Errors
    /// Returns a connection error if the address cannot be bound.
    pub async fn bind(addr: &str) -> Result<Self, HydraError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| HydraError::connection_failed(COMPONENT, addr, e))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| HydraError::connection_failed(COMPONENT, addr, e))?;

        let conns: Arc<DashMap<Identity, ConnHandle>> = Arc::new(DashMap::new());
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let accept_task = tokio::spawn(accept_loop(
            listener,
            Arc::clone(&conns),
            inbound_tx,
            shutdown_rx,
        ));

        Ok(Self {
            local_addr,
            conns,
            inbound_rx,
            shutdown_tx,
            accept_task,
        })
    }

    /// The address the endpoint is bound to.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of currently connected dealers.
    #[must_use]
    pub fn connected_peers(&self) -> usize {
        self.conns.len()
    }

    /// Receive the next inbound frame group together with the identity of
    /// the dealer that sent it.
    ///
    /// # Errors
    /// Returns a connection error once the endpoint has shut down.
    pub async fn recv_multipart(&mut self) -> Result<(Identity, Vec<Vec<u8>>), HydraError> {
        self.inbound_rx
            .recv()
            .await
            .ok_or_else(|| HydraError::connection(COMPONENT, "router endpoint closed"))
    }

    /// Queue a frame group for delivery to the named dealer.
    ///
    /// # Errors
    /// Returns a connection error when the identity is unknown or its
    /// connection is gone (mandatory routing, as the broker relies on it).
    pub async fn send_multipart(
        &self,
        identity: &Identity,
        frames: Vec<Vec<u8>>,
    ) -> Result<(), HydraError> {
        let handle = self
            .conns
            .get(identity)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| {
                HydraError::connection(COMPONENT, "no route to peer")
                    .with_context("identity", identity.display())
            })?;
        handle.tx.send(frames).await.map_err(|_| {
            HydraError::connection(COMPONENT, "peer connection closed")
                .with_context("identity", identity.display())
        })
    }

    /// Stop accepting, signal all connection tasks, and wait briefly for
    /// the accept loop to wind down.
    pub async fn close(self) {
        let _ = self.shutdown_tx.send(true);
        self.conns.clear();
        if tokio::time::timeout(Duration::from_secs(2), self.accept_task)
            .await
            .is_err()
        {
            warn!("transport accept task did not stop within grace period");
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    conns: Arc<DashMap<Identity, ConnHandle>>,
    inbound_tx: mpsc::Sender<(Identity, Vec<Vec<u8>>)>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, addr)) => {
                        let conns = Arc::clone(&conns);
                        let inbound_tx = inbound_tx.clone();
                        let shutdown_rx = shutdown_rx.clone();
                        tokio::spawn(async move {
                            if let Err(e) =
                                handle_dealer(stream, conns, inbound_tx, shutdown_rx).await
                            {
                                debug!(%addr, "dealer connection closed: {e}");
                            }
                        });
                    }
                    Err(e) => {
                        error!("failed to accept connection: {e}");
                    }
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
}

async fn handle_dealer(
    stream: TcpStream,
    conns: Arc<DashMap<Identity, ConnHandle>>,
    inbound_tx: mpsc::Sender<(Identity, Vec<Vec<u8>>)>,
    shutdown_rx: watch::Receiver<bool>,
) -> io::Result<()> {
    stream.set_nodelay(true)?;
    let (mut read_half, write_half) = stream.into_split();

    // Identity announcement: one group, one frame. Empty bytes mean the
    // dealer left identity assignment to us.
    let announce = tokio::time::timeout(ANNOUNCE_TIMEOUT, read_group(&mut read_half))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "no identity announcement"))??;
    let identity = match announce.as_slice() {
        [bytes] if bytes.is_empty() => random_identity(),
        [bytes] => Identity::new(bytes.clone()),
        _ => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "malformed identity announcement",
            ));
        }
    };

    let (deliver_tx, deliver_rx) = mpsc::channel::<Vec<Vec<u8>>>(DELIVER_QUEUE);
    let connected_at = Instant::now();
    let handle = ConnHandle {
        tx: deliver_tx,
        connected_at,
    };
    // Same identity reconnecting replaces the previous connection; the old
    // writer ends once its delivery channel has no senders left.
    if conns.insert(identity.clone(), handle).is_some() {
        debug!(identity = %identity, "identity takeover, replacing previous connection");
    }

    let writer_task = tokio::spawn(write_loop(write_half, deliver_rx, shutdown_rx.clone()));

    let result = read_loop(&mut read_half, &identity, &inbound_tx, shutdown_rx).await;

    conns.remove_if(&identity, |_k, v| v.connected_at == connected_at);
    writer_task.abort();
    result
}

async fn read_loop(
    read_half: &mut OwnedReadHalf,
    identity: &Identity,
    inbound_tx: &mpsc::Sender<(Identity, Vec<Vec<u8>>)>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> io::Result<()> {
    loop {
        tokio::select! {
            group = read_group(read_half) => {
                let frames = group?;
                if inbound_tx.send((identity.clone(), frames)).await.is_err() {
                    // Router endpoint gone; nothing left to deliver to.
                    return Ok(());
                }
            }
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    return Ok(());
                }
            }
        }
    }
}

async fn write_loop(
    mut write_half: OwnedWriteHalf,
    mut deliver_rx: mpsc::Receiver<Vec<Vec<u8>>>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            group = deliver_rx.recv() => {
                match group {
                    Some(frames) => {
                        if let Err(e) = write_group(&mut write_half, &frames).await {
                            debug!("write to dealer failed: {e}");
                            return;
                        }
                    }
                    None => return,
                }
            }
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    return;
                }
            }
        }
    }
}

/// Dealer-side endpoint: a single connection to a router.
#[derive(Debug)]
pub struct DealerSocket {
    identity: Option<Identity>,
    read_half: OwnedReadHalf,
    write_half: OwnedWriteHalf,
}

impl DealerSocket {
    /// Connect to a router endpoint, announcing the given identity. With
    /// `None` the router assigns opaque identity bytes.
    ///
    /// # Errors
    /// Returns a connection error if the TCP connect or the announcement
    /// fails.
    pub async fn connect(addr: &str, identity: Option<Identity>) -> Result<Self, HydraError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| HydraError::connection_failed(COMPONENT, addr, e))?;
        stream
            .set_nodelay(true)
            .map_err(|e| HydraError::connection_failed(COMPONENT, addr, e))?;
        let (read_half, mut write_half) = stream.into_split();

        let announce = identity
            .as_ref()
            .map(|id| id.as_bytes().to_vec())
            .unwrap_or_default();
        write_group(&mut write_half, &[announce])
            .await
            .map_err(|e| HydraError::connection_failed(COMPONENT, addr, e))?;

        Ok(Self {
            identity,
            read_half,
            write_half,
        })
    }

    /// The identity announced at connect time, if any.
    #[must_use]
    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    /// Send a single payload frame.
    ///
    /// # Errors
    /// Returns a connection error on transport failure.
    pub async fn send(&mut self, payload: &[u8]) -> Result<(), HydraError> {
        self.send_multipart(&[payload.to_vec()]).await
    }

    /// Send an arbitrary frame group. The broker expects exactly one
    /// payload frame; other counts exist to exercise its frame handling.
    ///
    /// # Errors
    /// Returns a connection error on transport failure.
    pub async fn send_multipart(&mut self, frames: &[Vec<u8>]) -> Result<(), HydraError> {
        write_group(&mut self.write_half, frames)
            .await
            .map_err(|e| HydraError::connection(COMPONENT, format!("send failed: {e}")))
    }

    /// Receive the next payload frame from the router.
    ///
    /// # Errors
    /// Returns a connection error on transport failure or a malformed
    /// group from the router.
    pub async fn recv(&mut self) -> Result<Vec<u8>, HydraError> {
        let mut frames = read_group(&mut self.read_half)
            .await
            .map_err(|e| HydraError::connection(COMPONENT, format!("recv failed: {e}")))?;
        if frames.len() != 1 {
            return Err(HydraError::connection(
                COMPONENT,
                format!("expected single-frame group from router, got {}", frames.len()),
            ));
        }
        Ok(frames.remove(0))
    }

    /// Close the connection, flushing the write side.
    pub async fn close(mut self) {
        let _ = self.write_half.shutdown().await;
    }

    /// Split into independently owned read and write ends, so receive and
    /// send loops can run as separate tasks.
    #[must_use]
    pub fn into_split(self) -> (DealerReader, DealerWriter) {
        (
            DealerReader {
                read_half: self.read_half,
            },
            DealerWriter {
                write_half: self.write_half,
            },
        )
    }
}

/// Read end of a split [`DealerSocket`].
#[derive(Debug)]
pub struct DealerReader {
    read_half: OwnedReadHalf,
}

impl DealerReader {
    /// Receive the next payload frame from the router.
    ///
    /// # Errors
    /// Returns a connection error on transport failure or a malformed
    /// group from the router.
    pub async fn recv(&mut self) -> Result<Vec<u8>, HydraError> {
        let mut frames = read_group(&mut self.read_half)
            .await
            .map_err(|e| HydraError::connection(COMPONENT, format!("recv failed: {e}")))?;
        if frames.len() != 1 {
            return Err(HydraError::connection(
                COMPONENT,
                format!("expected single-frame group from router, got {}", frames.len()),
            ));
        }
        Ok(frames.remove(0))
    }
}

/// Write end of a split [`DealerSocket`].
#[derive(Debug)]
pub struct DealerWriter {
    write_half: OwnedWriteHalf,
}

impl DealerWriter {
    /// Send a single payload frame.
    ///
    /// # Errors
    /// Returns a connection error on transport failure.
    pub async fn send(&mut self, payload: &[u8]) -> Result<(), HydraError> {
        write_group(&mut self.write_half, &[payload.to_vec()])
            .await
            .map_err(|e| HydraError::connection(COMPONENT, format!("send failed: {e}")))
    }

    /// Close the connection, flushing buffered writes.
    pub async fn close(mut self) {
        let _ = self.write_half.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn bound_router() -> (RouterSocket, String) {
        let router = RouterSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = router.local_addr().to_string();
        (router, addr)
    }

    #[tokio::test]
    async fn announced_identity_is_preserved() {
        let (mut router, addr) = bound_router().await;
        let mut dealer = DealerSocket::connect(&addr, Some(Identity::from("peer-1")))
            .await
            .unwrap();

        dealer.send(b"hello").await.unwrap();
        let (identity, frames) = router.recv_multipart().await.unwrap();
        assert_eq!(identity, Identity::from("peer-1"));
        assert_eq!(frames, vec![b"hello".to_vec()]);
    }

    #[tokio::test]
    async fn anonymous_dealer_gets_assigned_identity() {
        let (mut router, addr) = bound_router().await;
        let mut dealer = DealerSocket::connect(&addr, None).await.unwrap();

        dealer.send(b"x").await.unwrap();
        let (identity, _) = router.recv_multipart().await.unwrap();
        assert_eq!(identity.as_bytes().len(), 8);
    }

    #[tokio::test]
    async fn router_delivers_to_named_dealer() {
        let (mut router, addr) = bound_router().await;
        let mut a = DealerSocket::connect(&addr, Some(Identity::from("a")))
            .await
            .unwrap();
        let mut b = DealerSocket::connect(&addr, Some(Identity::from("b")))
            .await
            .unwrap();

        // A first message makes each registration observable.
        a.send(b"hi from a").await.unwrap();
        b.send(b"hi from b").await.unwrap();
        let _ = router.recv_multipart().await.unwrap();
        let _ = router.recv_multipart().await.unwrap();

        router
            .send_multipart(&Identity::from("b"), vec![b"for b".to_vec()])
            .await
            .unwrap();
        let payload = tokio::time::timeout(Duration::from_secs(2), b.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(payload, b"for b");
    }

    #[tokio::test]
    async fn send_to_unknown_identity_is_an_error() {
        let (router, _addr) = bound_router().await;
        let err = router
            .send_multipart(&Identity::from("ghost"), vec![b"x".to_vec()])
            .await
            .unwrap_err();
        assert!(err.is_connection());
        assert_eq!(err.context().get("identity").unwrap(), "ghost");
    }

    #[tokio::test]
    async fn empty_frame_group_passes_through() {
        let (mut router, addr) = bound_router().await;
        let mut dealer = DealerSocket::connect(&addr, Some(Identity::from("c")))
            .await
            .unwrap();

        dealer.send_multipart(&[]).await.unwrap();
        let (identity, frames) = router.recv_multipart().await.unwrap();
        assert_eq!(identity, Identity::from("c"));
        assert!(frames.is_empty());
    }

    #[tokio::test]
    async fn identity_takeover_routes_to_newest_connection() {
        let (mut router, addr) = bound_router().await;
        let mut old = DealerSocket::connect(&addr, Some(Identity::from("dup")))
            .await
            .unwrap();
        old.send(b"from old").await.unwrap();
        let _ = router.recv_multipart().await.unwrap();

        let mut new = DealerSocket::connect(&addr, Some(Identity::from("dup")))
            .await
            .unwrap();
        new.send(b"from new").await.unwrap();
        let _ = router.recv_multipart().await.unwrap();

        router
            .send_multipart(&Identity::from("dup"), vec![b"ping".to_vec()])
            .await
            .unwrap();
        let payload = tokio::time::timeout(Duration::from_secs(2), new.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(payload, b"ping");
    }

    #[tokio::test]
    async fn close_stops_the_endpoint() {
        let (router, addr) = bound_router().await;
        router.close().await;
        // New connections either fail outright or are never serviced.
        if let Ok(mut dealer) = DealerSocket::connect(&addr, Some(Identity::from("late"))).await {
            let _ = dealer.send(b"x").await;
        }
    }
}
