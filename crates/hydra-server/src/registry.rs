//! Client registry: identity → live connection handles.
//!
//! The registry preserves the relay's dual entry shape as a tagged
//! variant: an internal app owns a single slot, an external domain owns a
//! keyed sub-map of concurrently connected peers. Entries are created on
//! accept and destroyed on close; there is no other deletion path.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::SocketAddr;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::warn;
use uuid::Uuid;

/// Outbound frames queued per connection ahead of the socket send. Sends
/// are fire-and-forget: a slow peer whose buffer fills loses frames.
pub const OUTBOUND_BUFFER: usize = 64;

/// A live, accepted connection as the rest of the relay sees it.
#[derive(Debug, Clone)]
pub struct PeerHandle {
    /// Server-assigned id, generated at accept time.
    pub peer_id: Uuid,
    /// The identity declared at handshake (origin header).
    pub identity: String,
    /// Remote socket address, for disconnect logging.
    pub remote_addr: SocketAddr,
    sender: mpsc::Sender<Message>,
}

impl PeerHandle {
    /// Create a handle plus the receiving end of its outbound queue.
    pub fn new(
        peer_id: Uuid,
        identity: &str,
        remote_addr: SocketAddr,
    ) -> (Self, mpsc::Receiver<Message>) {
        let (sender, receiver) = mpsc::channel(OUTBOUND_BUFFER);
        (
            Self {
                peer_id,
                identity: identity.to_string(),
                remote_addr,
                sender,
            },
            receiver,
        )
    }

    /// Queue a frame for this peer, fire-and-forget.
    ///
    /// A full or closed outbound buffer drops the frame with a warning;
    /// there is no backpressure toward the sender.
    pub fn send(&self, message: Message) {
        if let Err(e) = self.sender.try_send(message) {
            warn!(
                peer = %self.peer_id,
                identity = %self.identity,
                error = %e,
                "outbound queue unavailable, frame dropped"
            );
        }
    }
}

/// A registry entry, shaped by how the identity classified at insert time.
#[derive(Debug)]
pub enum RegistryEntry {
    /// Internal app: at most one live connection.
    App(PeerHandle),
    /// External domain: any number of peers, keyed by id.
    Domain(HashMap<Uuid, PeerHandle>),
}

/// In-memory map from identity to live connection handles.
///
/// Shared by every connection's accept/close path and by every routed
/// frame; the lock is synchronous (never held across an await) so the
/// admission screen can run inside the handshake callback.
#[derive(Debug, Default)]
pub struct ClientRegistry {
    entries: RwLock<HashMap<String, RegistryEntry>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether any live entry exists under `identity`, of either shape.
    pub fn has_entry(&self, identity: &str) -> bool {
        self.entries.read().contains_key(identity)
    }

    /// Claim the single app slot for `handle.identity`.
    ///
    /// Fails when the slot is already held — the admission screen should
    /// have rejected the handshake, but two simultaneous accepts can race
    /// past it, and only one may win.
    pub fn try_insert_app(&self, handle: PeerHandle) -> Result<(), PeerHandle> {
        let mut entries = self.entries.write();
        if entries.contains_key(&handle.identity) {
            return Err(handle);
        }
        entries.insert(handle.identity.clone(), RegistryEntry::App(handle));
        Ok(())
    }

    /// Add a peer under its domain's keyed sub-map.
    pub fn insert_domain_peer(&self, handle: PeerHandle) {
        let mut entries = self.entries.write();
        match entries
            .entry(handle.identity.clone())
            .or_insert_with(|| RegistryEntry::Domain(HashMap::new()))
        {
            RegistryEntry::Domain(peers) => {
                peers.insert(handle.peer_id, handle);
            }
            RegistryEntry::App(_) => {
                // An app already holds this identity; classification picked
                // the other shape, so this insert cannot land.
                warn!(identity = %handle.identity, "domain insert against an app slot ignored");
            }
        }
    }

    /// Resolve an internal app's connection.
    pub fn lookup_app(&self, identity: &str) -> Option<PeerHandle> {
        match self.entries.read().get(identity) {
            Some(RegistryEntry::App(handle)) => Some(handle.clone()),
            _ => None,
        }
    }

    /// Resolve a peer by id among the peers of `identity`'s domain.
    pub fn lookup_peer(&self, identity: &str, peer_id: Uuid) -> Option<PeerHandle> {
        match self.entries.read().get(identity) {
            Some(RegistryEntry::Domain(peers)) => peers.get(&peer_id).cloned(),
            _ => None,
        }
    }

    /// Remove the connection registered under (`identity`, `peer_id`).
    ///
    /// Removing an entry that does not exist (or was already replaced by
    /// a newer connection) is a no-op. A domain whose last peer leaves is
    /// dropped entirely so admission sees a clean slate.
    pub fn remove(&self, identity: &str, peer_id: Uuid) {
        let mut entries = self.entries.write();
        match entries.get_mut(identity) {
            Some(RegistryEntry::App(handle)) => {
                if handle.peer_id == peer_id {
                    entries.remove(identity);
                }
            }
            Some(RegistryEntry::Domain(peers)) => {
                peers.remove(&peer_id);
                if peers.is_empty() {
                    entries.remove(identity);
                }
            }
            None => {}
        }
    }

    /// Total number of live connections across all entries.
    pub fn connection_count(&self) -> usize {
        self.entries
            .read()
            .values()
            .map(|entry| match entry {
                RegistryEntry::App(_) => 1,
                RegistryEntry::Domain(peers) => peers.len(),
            })
            .sum()
    }
}
