//! Message router: decodes inbound frames and forwards payloads.
//!
//! Destinations are classified per frame, so allow-list changes apply to
//! the very next message. Delivery is best effort: a miss drops the frame
//! (counted, no signal back to the sender — there is no ack protocol on
//! this wire).

use crate::registry::{ClientRegistry, PeerHandle};
use hydra_core::envelope::{self, Control, Envelope, BROADCAST_TARGET};
use hydra_core::identity::{self, IdentityKind};
use hydra_core::RelayTables;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Frame-level counters, relaxed atomics — for logs and tests, not
/// synchronisation.
#[derive(Debug, Default)]
pub struct RouterCounters {
    pub routed: AtomicU64,
    pub missed: AtomicU64,
    pub malformed: AtomicU64,
    pub unrecognized: AtomicU64,
    pub broadcast_unsupported: AtomicU64,
}

/// Routes decoded envelopes between registered connections.
pub struct MessageRouter {
    registry: Arc<ClientRegistry>,
    tables: Arc<RelayTables>,
    counters: RouterCounters,
}

impl MessageRouter {
    pub fn new(registry: Arc<ClientRegistry>, tables: Arc<RelayTables>) -> Self {
        Self {
            registry,
            tables,
            counters: RouterCounters::default(),
        }
    }

    pub fn counters(&self) -> &RouterCounters {
        &self.counters
    }

    /// Handle one inbound text frame from `source`.
    ///
    /// Malformed JSON never propagates: the frame is dropped with a
    /// warning and the connection lives on.
    pub fn on_frame(&self, source: &PeerHandle, raw: &str) {
        let value = match envelope::decode_value(raw) {
            Ok(value) => value,
            Err(e) => {
                self.counters.malformed.fetch_add(1, Ordering::Relaxed);
                warn!(
                    from = %source.identity,
                    peer = %source.peer_id,
                    error = %e,
                    "malformed frame dropped"
                );
                return;
            }
        };

        let parsed = match envelope::envelope_from_value(value) {
            Some(parsed) => parsed,
            None => {
                self.counters.unrecognized.fetch_add(1, Ordering::Relaxed);
                warn!(
                    from = %source.identity,
                    peer = %source.peer_id,
                    "unrecognized message dropped"
                );
                return;
            }
        };

        match parsed {
            Envelope::Route { to, .. } if to == BROADCAST_TARGET => {
                // Reserved: neither scope ("everyone" vs. the sender's
                // domain) has a caller today, so broadcast stays
                // unsupported rather than guessing.
                self.counters
                    .broadcast_unsupported
                    .fetch_add(1, Ordering::Relaxed);
                warn!(from = %source.identity, "broadcast routing is reserved, frame dropped");
            }
            Envelope::Route { to, message } => self.route(source, &to, message),
            Envelope::Control(Control::Message { message }) => {
                info!(
                    from = %source.identity,
                    peer = %source.peer_id,
                    %message,
                    "legacy message frame"
                );
            }
            Envelope::Control(Control::Uuid { .. }) => {
                // Peers have no business echoing the handshake back.
                debug!(from = %source.identity, "uuid control frame from peer ignored");
            }
        }
    }

    /// Resolve `to` and forward the payload verbatim.
    ///
    /// App names resolve globally; anything else is treated as a PeerId
    /// scoped to the sender's own domain, so external peers can only reach
    /// siblings registered under the same origin.
    fn route(&self, source: &PeerHandle, to: &str, message: Value) {
        let target = match identity::classify(to, &self.tables) {
            IdentityKind::App => self.registry.lookup_app(to),
            IdentityKind::Domain(_) | IdentityKind::Unknown => Uuid::parse_str(to)
                .ok()
                .and_then(|peer_id| self.registry.lookup_peer(&source.identity, peer_id)),
        };

        let Some(target) = target else {
            self.counters.missed.fetch_add(1, Ordering::Relaxed);
            debug!(
                from = %source.identity,
                to,
                "destination not registered, frame dropped"
            );
            return;
        };

        match envelope::encode(&message) {
            Ok(payload) => {
                target.send(Message::text(payload));
                self.counters.routed.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                warn!(to, error = %e, "payload encoding failed, frame dropped");
            }
        }
    }
}
