//! The routing engine: per-envelope forwarding decisions.
//!
//! Kept free of socket I/O so the decision table is testable on its own.
//! The broker loop executes the returned actions. Forwarded and broadcast
//! messages reuse the original payload bytes, so the broker never mutates
//! `sender`, `elem`, `data`, or correlation tokens.

use hydra_common::envelope::{unix_now, Envelope, MessageKind};
use hydra_common::types::{Identity, PeerType, ROUTER_LABEL};
use serde_json::{Map, Value};
use tracing::debug;

use crate::registry::PeerRegistry;

/// Reason string carried in synthesized no-server errors.
pub const NO_SERVER_REASON: &str = "no server connected";

/// One outbound send the broker must perform for an inbound envelope.
#[derive(Debug)]
pub enum RouteAction {
    /// Forward the original payload bytes to a single peer.
    Forward {
        /// Destination identity.
        to: Identity,
        /// The unmodified inbound wire bytes.
        payload: Vec<u8>,
    },
    /// Send a broker-synthesized envelope to a single peer.
    Reply {
        /// Destination identity.
        to: Identity,
        /// The synthesized envelope.
        envelope: Envelope,
    },
    /// Forward the original payload bytes to many peers, best-effort per
    /// recipient.
    Broadcast {
        /// Destination identities.
        to: Vec<Identity>,
        /// The unmodified inbound wire bytes.
        payload: Vec<u8>,
    },
}

/// The decoded fields routing cares about.
#[derive(Debug)]
pub struct InboundView<'a> {
    /// Declared sender type.
    pub sender_type: PeerType,
    /// Message kind derived from `elem`.
    pub kind: MessageKind,
    /// The raw `elem` label.
    pub elem: &'a str,
    /// Correlation token, echoed into synthesized replies.
    pub request_id: Option<&'a str>,
}

/// Decide what to send for one validated inbound envelope.
///
/// Reads the registry but performs no I/O; the registry side effect
/// (observe) has already happened by the time this runs.
pub fn route(
    sender: &Identity,
    inbound: &InboundView<'_>,
    payload: &[u8],
    registry: &PeerRegistry,
) -> Vec<RouteAction> {
    match &inbound.kind {
        // Heartbeats only refresh the registry.
        MessageKind::Heartbeat => Vec::new(),
        // Registry queries are answered for both categories.
        MessageKind::ClientRegistryRequest => {
            vec![RouteAction::Reply {
                to: sender.clone(),
                envelope: registry_response(registry.snapshot(), inbound.request_id),
            }]
        }
        _ if inbound.sender_type.is_client() => match registry.server_identity() {
            Some(server) => vec![RouteAction::Forward {
                to: server,
                payload: payload.to_vec(),
            }],
            None => {
                debug!(elem = inbound.elem, "no server registered, synthesizing error");
                vec![RouteAction::Reply {
                    to: sender.clone(),
                    envelope: no_server_error(inbound.elem, inbound.request_id),
                }]
            }
        },
        // Server-category traffic fans out to everyone but the sender and
        // the current server (a displaced server keeps receiving).
        _ => {
            let view = registry.view();
            let to: Vec<Identity> = view
                .peers
                .into_iter()
                .map(|(identity, _)| identity)
                .filter(|identity| identity != sender && view.server.as_ref() != Some(identity))
                .collect();
            vec![RouteAction::Broadcast {
                to,
                payload: payload.to_vec(),
            }]
        }
    }
}

/// Synthesized reply for a client command with no server registered.
#[must_use]
pub fn no_server_error(original_elem: &str, request_id: Option<&str>) -> Envelope {
    let mut data = Map::new();
    data.insert("reason".to_string(), Value::from(NO_SERVER_REASON));
    data.insert(
        "original_request".to_string(),
        Value::from(original_elem),
    );
    Envelope {
        sender: ROUTER_LABEL.to_string(),
        elem: MessageKind::Error.as_elem().to_string(),
        timestamp: Some(unix_now()),
        client_id: Some(ROUTER_LABEL.to_string()),
        request_id: request_id.map(str::to_string),
        data: Some(data),
    }
}

/// Synthesized registry-query response carrying the snapshot.
#[must_use]
pub fn registry_response(snapshot: Map<String, Value>, request_id: Option<&str>) -> Envelope {
    Envelope {
        sender: ROUTER_LABEL.to_string(),
        elem: MessageKind::ClientRegistryResponse.as_elem().to_string(),
        timestamp: Some(unix_now()),
        client_id: Some(ROUTER_LABEL.to_string()),
        request_id: request_id.map(str::to_string),
        data: Some(snapshot),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> Identity {
        Identity::from(s)
    }

    fn view<'a>(sender_type: PeerType, elem: &'a str, request_id: Option<&'a str>) -> InboundView<'a> {
        InboundView {
            sender_type,
            kind: MessageKind::from_elem(elem),
            elem,
            request_id,
        }
    }

    fn populated() -> PeerRegistry {
        let registry = PeerRegistry::new();
        registry.observe(&id("c1"), PeerType::SimpleClient, Some("c1"));
        registry.observe(&id("c2"), PeerType::HydraClient, Some("c2"));
        registry.observe(&id("s1"), PeerType::SimpleServer, Some("s1"));
        registry
    }

    #[test]
    fn heartbeat_produces_no_actions() {
        let registry = populated();
        let actions = route(
            &id("c1"),
            &view(PeerType::SimpleClient, "heartbeat", None),
            b"{}",
            &registry,
        );
        assert!(actions.is_empty());
    }

    #[test]
    fn client_command_forwards_to_server_unchanged() {
        let registry = populated();
        let payload = br#"{"sender":"SimpleClient","elem":"square_request","data":{"number":7}}"#;
        let actions = route(
            &id("c1"),
            &view(PeerType::SimpleClient, "square_request", Some("r-1")),
            payload,
            &registry,
        );
        match actions.as_slice() {
            [RouteAction::Forward { to, payload: sent }] => {
                assert_eq!(*to, id("s1"));
                assert_eq!(sent.as_slice(), payload);
            }
            other => panic!("expected Forward, got {other:?}"),
        }
    }

    #[test]
    fn client_command_without_server_gets_error_reply() {
        let registry = PeerRegistry::new();
        registry.observe(&id("c1"), PeerType::SimpleClient, Some("c1"));
        let actions = route(
            &id("c1"),
            &view(PeerType::SimpleClient, "square_request", Some("r-7")),
            b"{}",
            &registry,
        );
        match actions.as_slice() {
            [RouteAction::Reply { to, envelope }] => {
                assert_eq!(*to, id("c1"));
                assert_eq!(envelope.sender, ROUTER_LABEL);
                assert_eq!(envelope.elem, "error");
                assert_eq!(envelope.request_id.as_deref(), Some("r-7"));
                let data = envelope.data.as_ref().unwrap();
                assert_eq!(data["reason"], NO_SERVER_REASON);
                assert_eq!(data["original_request"], "square_request");
            }
            other => panic!("expected Reply, got {other:?}"),
        }
    }

    #[test]
    fn unknown_elem_from_client_is_forwarded_opaquely() {
        let registry = populated();
        let actions = route(
            &id("c1"),
            &view(PeerType::HydraClient, "plasma_vent", None),
            b"raw-bytes",
            &registry,
        );
        assert!(matches!(
            actions.as_slice(),
            [RouteAction::Forward { to, .. }] if *to == id("s1")
        ));
    }

    #[test]
    fn server_message_broadcasts_to_clients_only() {
        let registry = populated();
        let actions = route(
            &id("s1"),
            &view(PeerType::SimpleServer, "status_update", None),
            b"{}",
            &registry,
        );
        match actions.as_slice() {
            [RouteAction::Broadcast { to, .. }] => {
                let mut to = to.clone();
                to.sort();
                assert_eq!(to, vec![id("c1"), id("c2")]);
            }
            other => panic!("expected Broadcast, got {other:?}"),
        }
    }

    #[test]
    fn displaced_server_receives_broadcasts() {
        let registry = populated();
        registry.observe(&id("s2"), PeerType::HydraServer, Some("s2"));
        let actions = route(
            &id("s2"),
            &view(PeerType::HydraServer, "status_update", None),
            b"{}",
            &registry,
        );
        match actions.as_slice() {
            [RouteAction::Broadcast { to, .. }] => {
                let mut to = to.clone();
                to.sort();
                // s1 was displaced by s2 and now receives like a client.
                assert_eq!(to, vec![id("c1"), id("c2"), id("s1")]);
            }
            other => panic!("expected Broadcast, got {other:?}"),
        }
    }

    #[test]
    fn broadcast_with_no_clients_is_empty_not_an_error() {
        let registry = PeerRegistry::new();
        registry.observe(&id("s1"), PeerType::HydraServer, None);
        let actions = route(
            &id("s1"),
            &view(PeerType::HydraServer, "status_update", None),
            b"{}",
            &registry,
        );
        assert!(matches!(
            actions.as_slice(),
            [RouteAction::Broadcast { to, .. }] if to.is_empty()
        ));
    }

    #[test]
    fn registry_request_is_answered_for_both_categories() {
        let registry = populated();
        for (who, ty) in [
            ("c1", PeerType::SimpleClient),
            ("s1", PeerType::SimpleServer),
        ] {
            let actions = route(
                &id(who),
                &view(ty, "client_registry_request", Some("q-1")),
                b"{}",
                &registry,
            );
            match actions.as_slice() {
                [RouteAction::Reply { to, envelope }] => {
                    assert_eq!(*to, id(who));
                    assert_eq!(envelope.elem, "client_registry_response");
                    assert_eq!(envelope.request_id.as_deref(), Some("q-1"));
                    let data = envelope.data.as_ref().unwrap();
                    assert_eq!(data.len(), 3);
                    assert_eq!(data["s1"]["is_server"], true);
                }
                other => panic!("expected Reply for {who}, got {other:?}"),
            }
        }
    }
}
