//! Peer registry: who is connected, what they declared, when they last
//! spoke.
//!
//! All operations go through one mutex because they need cross-entry
//! consistency (server tracking, the client-id index). The routing loop is
//! nowhere near the scale where this lock matters.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Instant;

use hydra_common::envelope::unix_now;
use hydra_common::types::{Identity, PeerType};
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

/// One registered peer as seen by the broker.
#[derive(Debug, Clone)]
pub struct PeerRecord {
    /// Transport identity of the connection.
    pub identity: Identity,
    /// Declared peer type from the last validated envelope.
    pub peer_type: PeerType,
    /// Declared logical id, when the peer supplied one.
    pub client_id: Option<String>,
    /// Monotonic instant of the last validated envelope, used for pruning.
    pub last_seen: Instant,
    /// Wall-clock seconds of the last validated envelope, reported in
    /// snapshots.
    pub last_heartbeat: f64,
}

/// Read-only view for routing decisions.
#[derive(Debug, Clone, Default)]
pub struct RegistryView {
    /// Identity of the current server, if one is registered.
    pub server: Option<Identity>,
    /// All registered peers with their declared types.
    pub peers: Vec<(Identity, PeerType)>,
}

#[derive(Default)]
struct Inner {
    peers: HashMap<Identity, PeerRecord>,
    server: Option<Identity>,
    by_client_id: HashMap<String, Identity>,
}

/// Concurrent registry of connected peers keyed by transport identity.
#[derive(Default)]
pub struct PeerRegistry {
    inner: Mutex<Inner>,
}

impl PeerRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Upsert a peer from a validated envelope, refreshing its heartbeat.
    ///
    /// A server-category claim displaces any previously registered server;
    /// last writer wins and the displacement is logged. The displaced peer
    /// stays registered and keeps receiving broadcasts.
    pub fn observe(&self, identity: &Identity, peer_type: PeerType, client_id: Option<&str>) {
        let mut inner = self.lock();
        let now = Instant::now();
        let wall = unix_now();

        let is_new = !inner.peers.contains_key(identity);
        if is_new {
            info!(identity = %identity, peer_type = %peer_type, "registered peer");
        }

        let record = PeerRecord {
            identity: identity.clone(),
            peer_type,
            client_id: client_id.map(str::to_string),
            last_seen: now,
            last_heartbeat: wall,
        };
        inner.peers.insert(identity.clone(), record);
        if let Some(id) = client_id {
            inner.by_client_id.insert(id.to_string(), identity.clone());
        }

        if peer_type.is_server() && inner.server.as_ref() != Some(identity) {
            if let Some(old) = &inner.server {
                warn!(
                    displaced = %old,
                    replacement = %identity,
                    "replacing registered server; previous one is treated as a client"
                );
            }
            inner.server = Some(identity.clone());
        }
    }

    /// Remove a peer outright (explicit disconnect).
    pub fn remove(&self, identity: &Identity) -> Option<PeerRecord> {
        let mut inner = self.lock();
        let record = inner.peers.remove(identity)?;
        if inner.server.as_ref() == Some(identity) {
            inner.server = None;
            info!(identity = %identity, "server disconnected");
        }
        if let Some(id) = &record.client_id {
            if inner.by_client_id.get(id) == Some(identity) {
                inner.by_client_id.remove(id);
            }
        }
        info!(identity = %identity, peer_type = %record.peer_type, "removed peer");
        Some(record)
    }

    /// Identities of all registered peers of the given category.
    #[must_use]
    pub fn by_type(&self, server_category: bool) -> Vec<Identity> {
        let inner = self.lock();
        inner
            .peers
            .values()
            .filter(|r| r.peer_type.is_server() == server_category)
            .map(|r| r.identity.clone())
            .collect()
    }

    /// The unique server identity, or none.
    #[must_use]
    pub fn server_identity(&self) -> Option<Identity> {
        self.lock().server.clone()
    }

    /// Look up the identity registered under a declared client id.
    #[must_use]
    pub fn identity_for_client_id(&self, client_id: &str) -> Option<Identity> {
        self.lock().by_client_id.get(client_id).cloned()
    }

    /// Remove and return every peer silent for longer than `timeout`.
    pub fn prune(&self, timeout: std::time::Duration) -> Vec<PeerRecord> {
        let mut inner = self.lock();
        let now = Instant::now();
        let expired: Vec<Identity> = inner
            .peers
            .values()
            .filter(|r| now.duration_since(r.last_seen) > timeout)
            .map(|r| r.identity.clone())
            .collect();

        let mut removed = Vec::with_capacity(expired.len());
        for identity in expired {
            if let Some(record) = inner.peers.remove(&identity) {
                if inner.server.as_ref() == Some(&identity) {
                    inner.server = None;
                    info!(identity = %identity, "server timed out");
                }
                if let Some(id) = &record.client_id {
                    if inner.by_client_id.get(id) == Some(&identity) {
                        inner.by_client_id.remove(id);
                    }
                }
                debug!(identity = %identity, "pruned inactive peer");
                removed.push(record);
            }
        }
        removed
    }

    /// Lightweight view for routing decisions.
    #[must_use]
    pub fn view(&self) -> RegistryView {
        let inner = self.lock();
        RegistryView {
            server: inner.server.clone(),
            peers: inner
                .peers
                .values()
                .map(|r| (r.identity.clone(), r.peer_type))
                .collect(),
        }
    }

    /// Stable wire-shaped copy for registry-query responses: one entry per
    /// peer, keyed by declared client id (or identity rendering), with its
    /// type, last heartbeat, and whether it is the current server.
    #[must_use]
    pub fn snapshot(&self) -> Map<String, Value> {
        let inner = self.lock();
        let mut out = Map::new();
        for record in inner.peers.values() {
            let key = record
                .client_id
                .clone()
                .unwrap_or_else(|| record.identity.display());
            out.insert(
                key,
                json!({
                    "client_type": record.peer_type.as_label(),
                    "last_heartbeat": record.last_heartbeat,
                    "is_server": inner.server.as_ref() == Some(&record.identity),
                }),
            );
        }
        out
    }

    /// Number of registered peers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().peers.len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().peers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn id(s: &str) -> Identity {
        Identity::from(s)
    }

    #[test]
    fn observe_registers_and_refreshes() {
        let registry = PeerRegistry::new();
        registry.observe(&id("c1"), PeerType::HydraClient, Some("c1"));
        assert_eq!(registry.len(), 1);

        let before = registry.view();
        registry.observe(&id("c1"), PeerType::HydraClient, Some("c1"));
        assert_eq!(registry.len(), 1);
        assert_eq!(before.peers.len(), 1);
    }

    #[test]
    fn server_identity_tracks_latest_server() {
        let registry = PeerRegistry::new();
        assert!(registry.server_identity().is_none());

        registry.observe(&id("s1"), PeerType::SimpleServer, Some("s1"));
        assert_eq!(registry.server_identity(), Some(id("s1")));

        // Last writer wins; the displaced server stays registered.
        registry.observe(&id("s2"), PeerType::HydraServer, Some("s2"));
        assert_eq!(registry.server_identity(), Some(id("s2")));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn remove_clears_server_reference() {
        let registry = PeerRegistry::new();
        registry.observe(&id("s1"), PeerType::HydraServer, None);
        registry.remove(&id("s1"));
        assert!(registry.server_identity().is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn by_type_splits_categories() {
        let registry = PeerRegistry::new();
        registry.observe(&id("c1"), PeerType::HydraClient, None);
        registry.observe(&id("c2"), PeerType::SimpleClient, None);
        registry.observe(&id("s1"), PeerType::SimpleServer, None);

        let mut clients = registry.by_type(false);
        clients.sort();
        assert_eq!(clients, vec![id("c1"), id("c2")]);
        assert_eq!(registry.by_type(true), vec![id("s1")]);
    }

    #[test]
    fn prune_evicts_silent_peers_and_server() {
        let registry = PeerRegistry::new();
        registry.observe(&id("c1"), PeerType::HydraClient, Some("c1"));
        registry.observe(&id("s1"), PeerType::HydraServer, Some("s1"));

        std::thread::sleep(Duration::from_millis(30));
        registry.observe(&id("c2"), PeerType::HydraClient, Some("c2"));

        let removed = registry.prune(Duration::from_millis(15));
        let mut names: Vec<String> = removed
            .iter()
            .map(|r| r.client_id.clone().unwrap())
            .collect();
        names.sort();
        assert_eq!(names, vec!["c1", "s1"]);
        assert_eq!(registry.len(), 1);
        assert!(registry.server_identity().is_none());
    }

    #[test]
    fn prune_keeps_fresh_peers() {
        let registry = PeerRegistry::new();
        registry.observe(&id("c1"), PeerType::HydraClient, None);
        assert!(registry.prune(Duration::from_secs(30)).is_empty());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn snapshot_keys_by_client_id_or_identity() {
        let registry = PeerRegistry::new();
        registry.observe(&id("c1"), PeerType::SimpleClient, Some("alpha"));
        registry.observe(&id("anon"), PeerType::HydraClient, None);
        registry.observe(&id("s1"), PeerType::SimpleServer, Some("srv"));

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 3);
        assert_eq!(snapshot["alpha"]["client_type"], "SimpleClient");
        assert_eq!(snapshot["alpha"]["is_server"], false);
        assert_eq!(snapshot["srv"]["is_server"], true);
        assert!(snapshot["anon"]["last_heartbeat"].as_f64().unwrap() > 0.0);
    }

    #[test]
    fn client_id_index_follows_latest_claim() {
        let registry = PeerRegistry::new();
        registry.observe(&id("conn-1"), PeerType::HydraClient, Some("alpha"));
        registry.observe(&id("conn-2"), PeerType::HydraClient, Some("alpha"));
        assert_eq!(registry.identity_for_client_id("alpha"), Some(id("conn-2")));

        // Removing the stale connection must not clobber the new mapping.
        registry.remove(&id("conn-1"));
        assert_eq!(registry.identity_for_client_id("alpha"), Some(id("conn-2")));
    }
}
