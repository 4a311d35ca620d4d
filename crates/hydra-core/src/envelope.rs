//! JSON wire envelopes exchanged over a relay connection.
//!
//! Every frame is a JSON text message in one of two shapes:
//! - routing envelope `{"to": "<identity>", "message": <any-json>}`
//! - control message `{"type": "uuid", "uuid": "..."}` (handshake) or
//!   `{"type": "message", "message": "..."}` (legacy echo path)
//!
//! Routed payloads are forwarded verbatim: the relay never inspects or
//! rewrites the `message` field.

use crate::error::{HydraError, HydraResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// The fixed WebSocket subprotocol every relay peer speaks.
pub const RELAY_PROTOCOL: &str = "echo-protocol";

/// Reserved destination for broadcast routing (not supported).
pub const BROADCAST_TARGET: &str = "all";

/// A decoded wire message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Envelope {
    /// Addressed frame: forward `message` to the peer named by `to`.
    Route { to: String, message: Value },
    /// Control frame, discriminated by its `type` field.
    Control(Control),
}

/// Control messages, tagged by `type` on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Control {
    /// Handshake: the server tells a freshly accepted peer its own id.
    Uuid { uuid: Uuid },
    /// Legacy echo path: the server logs the content, nothing else.
    Message { message: String },
}

/// Build the handshake envelope sent to every accepted peer.
pub fn uuid_envelope(uuid: Uuid) -> Envelope {
    Envelope::Control(Control::Uuid { uuid })
}

/// Parse raw frame text as JSON.
///
/// A failure here means the frame is malformed and must be dropped; a
/// success that later fails [`envelope_from_value`] means the JSON was
/// valid but is not a recognized envelope shape. The router logs the two
/// cases differently.
pub fn decode_value(raw: &str) -> HydraResult<Value> {
    serde_json::from_str(raw).map_err(|e| HydraError::Protocol(format!("malformed frame: {e}")))
}

/// Interpret parsed JSON as a wire envelope, if it has a recognized shape.
pub fn envelope_from_value(value: Value) -> Option<Envelope> {
    serde_json::from_value(value).ok()
}

/// Encode a wire message (or any routed payload) as JSON text.
pub fn encode<T: Serialize>(value: &T) -> HydraResult<String> {
    Ok(serde_json::to_string(value)?)
}
