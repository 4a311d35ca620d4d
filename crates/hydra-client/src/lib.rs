//! hydra-client: auto-reconnecting client for the hydra relay.
//!
//! Internal apps use this crate to join the relay: resolve its address
//! (vhost or localhost), connect with the fixed subprotocol and their
//! identity as the origin, and keep retrying forever if the relay is
//! away. Callers receive a fresh [`RelayConnection`] on every
//! (re)connect and own all message handling beyond the initial
//! `{"type":"uuid"}` handshake.

pub mod client;
pub mod resolver;

pub use client::{ClientConfig, Inbound, RelayClient, RelayConnection};
pub use resolver::resolve_relay_uri;
