//! Connection admission: origin screening and registration.
//!
//! Admission is the only writer of new registry entries. The screen runs
//! inside the WebSocket handshake callback (so a bad origin is rejected
//! before the upgrade completes); registration runs after the upgrade and
//! re-checks the single-slot rule under the registry lock, because two
//! handshakes for the same app can pass the screen concurrently.

use crate::registry::{ClientRegistry, PeerHandle};
use hydra_core::identity::{self, IdentityKind};
use hydra_core::RelayTables;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{info, warn};
use uuid::Uuid;

/// Why a handshake was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    /// Origin is neither an internal app, an allow-listed domain, nor a
    /// `<hostname>.local` peer.
    NotAllowed,
    /// The internal app already has a live connection.
    AlreadyConnected,
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::NotAllowed => write!(f, "origin not allowed"),
            Rejection::AlreadyConnected => write!(f, "app already connected"),
        }
    }
}

/// Decides whether a connecting peer may join, and registers it if so.
pub struct AdmissionController {
    registry: Arc<ClientRegistry>,
    tables: Arc<RelayTables>,
}

impl AdmissionController {
    pub fn new(registry: Arc<ClientRegistry>, tables: Arc<RelayTables>) -> Self {
        Self { registry, tables }
    }

    /// Handshake-time policy check.
    ///
    /// Allowed iff the origin is "our own" (an app name or an allow-listed
    /// domain) with no live entry under that identity, or it carries the
    /// machine's `<hostname>.local` suffix. Everything else — including an
    /// origin with no extractable domain — is rejected.
    pub fn screen(&self, origin: &str) -> Result<(), Rejection> {
        let own = identity::is_own_app(origin, &self.tables);
        if own && !self.registry.has_entry(origin) {
            return Ok(());
        }
        if identity::has_local_suffix(origin, &self.tables.hostname) {
            return Ok(());
        }
        Err(if own {
            Rejection::AlreadyConnected
        } else {
            Rejection::NotAllowed
        })
    }

    /// Register an accepted connection: assign a fresh PeerId, insert the
    /// handle in the shape its classification dictates, and return it with
    /// the outbound queue's receiving end.
    ///
    /// The app-slot claim is atomic; losing the race counts as a rejection
    /// even though the upgrade already completed, and the caller must close
    /// the socket.
    pub fn register(
        &self,
        origin: &str,
        remote_addr: SocketAddr,
    ) -> Result<(PeerHandle, mpsc::Receiver<Message>), Rejection> {
        let peer_id = Uuid::new_v4();
        let (handle, receiver) = PeerHandle::new(peer_id, origin, remote_addr);

        match identity::classify(origin, &self.tables) {
            IdentityKind::App => {
                if self.registry.try_insert_app(handle.clone()).is_err() {
                    warn!(origin, "lost the app slot race, connection dropped");
                    return Err(Rejection::AlreadyConnected);
                }
            }
            IdentityKind::Domain(_) | IdentityKind::Unknown => {
                // Unknown only reaches here via the local-suffix clause of
                // the screen; those peers register under their full origin.
                self.registry.insert_domain_peer(handle.clone());
            }
        }

        info!(origin, peer = %peer_id, "connection accepted");
        Ok((handle, receiver))
    }
}
