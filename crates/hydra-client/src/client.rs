//! Auto-reconnecting relay client.
//!
//! Every internal app joins the relay through this client. The connect
//! loop is an explicit state machine (Resolving → Connecting → Connected
//! → Backoff → Resolving…) driven by one cancellable task, so shutdown
//! can stop a pending retry deterministically. Connect failures retry
//! forever on a fixed cadence with at most one attempt in flight; they
//! are never fatal to the embedding application.

use crate::resolver;
use futures_util::{SinkExt, StreamExt};
use hydra_core::config::DEFAULT_RELAY_PORT;
use hydra_core::envelope::{Control, Envelope};
use hydra_core::{HydraError, HydraResult, RelayTables, RELAY_PROTOCOL};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{ORIGIN, SEC_WEBSOCKET_PROTOCOL};
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

type ClientWs = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Frames queued in either direction between the socket and the caller.
const CHANNEL_BUFFER: usize = 64;

/// Configuration for joining the relay.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Identity declared as the WebSocket `Origin` header.
    pub identity: String,
    /// Explicit relay URI; skips address resolution entirely when set.
    pub uri: Option<String>,
    /// Tables used for vhost resolution when no URI is given.
    pub tables: RelayTables,
    /// Delay between connect attempts.
    pub retry_delay: Duration,
}

impl ClientConfig {
    pub fn new(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            uri: None,
            tables: RelayTables::default(),
            retry_delay: Duration::from_secs(5),
        }
    }
}

/// A message delivered to the caller.
///
/// Only the initial handshake is interpreted; everything else is handed
/// over as raw JSON.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// The server-assigned id, sent right after accept.
    Handshake { uuid: Uuid },
    /// Any other frame, verbatim.
    Frame(Value),
}

/// A live connection to the relay, handed to the caller on every
/// (re)connect.
pub struct RelayConnection {
    identity: String,
    uri: String,
    outbound: mpsc::Sender<Message>,
    inbound: mpsc::Receiver<Inbound>,
}

impl RelayConnection {
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// The URI this connection was established against.
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Send a routing envelope: `{"to": ..., "message": ...}`.
    pub async fn send_to(&self, to: &str, message: Value) -> HydraResult<()> {
        let envelope = Envelope::Route {
            to: to.to_string(),
            message,
        };
        self.send_value(&serde_json::to_value(&envelope)?).await
    }

    /// Send an arbitrary JSON value as one frame.
    pub async fn send_value(&self, value: &Value) -> HydraResult<()> {
        let raw = serde_json::to_string(value)?;
        self.outbound
            .send(Message::text(raw))
            .await
            .map_err(|_| HydraError::Transport("connection closed".into()))
    }

    /// The next inbound message; `None` once the connection is gone.
    pub async fn next(&mut self) -> Option<Inbound> {
        self.inbound.recv().await
    }
}

/// Handle to the background connect loop.
pub struct RelayClient {
    cancel: CancellationToken,
    attempts: Arc<AtomicU64>,
    task: tokio::task::JoinHandle<()>,
}

impl RelayClient {
    /// Spawn the client. Each successful (re)connect delivers a fresh
    /// [`RelayConnection`] on the returned channel.
    pub fn connect(config: ClientConfig) -> (Self, mpsc::Receiver<RelayConnection>) {
        let cancel = CancellationToken::new();
        let attempts = Arc::new(AtomicU64::new(0));
        let (conn_tx, conn_rx) = mpsc::channel(4);
        let task = tokio::spawn(run_loop(
            config,
            cancel.clone(),
            attempts.clone(),
            conn_tx,
        ));
        (
            Self {
                cancel,
                attempts,
                task,
            },
            conn_rx,
        )
    }

    /// Connect attempts so far — reconnect observability.
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::Relaxed)
    }

    /// Cancel the connect loop (including a pending retry) and wait for
    /// it to wind down.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        let _ = self.task.await;
    }
}

enum ClientState {
    Resolving,
    Connecting(String),
    Backoff,
}

async fn run_loop(
    config: ClientConfig,
    cancel: CancellationToken,
    attempts: Arc<AtomicU64>,
    conn_tx: mpsc::Sender<RelayConnection>,
) {
    let port = config.tables.relay_port().unwrap_or(DEFAULT_RELAY_PORT);
    let mut state = ClientState::Resolving;

    loop {
        if cancel.is_cancelled() {
            break;
        }
        state = match state {
            ClientState::Resolving => {
                let uri =
                    resolver::resolve_relay_uri(&config.tables, port, config.uri.as_deref()).await;
                ClientState::Connecting(uri)
            }
            ClientState::Connecting(uri) => {
                attempts.fetch_add(1, Ordering::Relaxed);
                info!(uri = %uri, identity = %config.identity, "connecting to relay");
                let attempt = tokio::select! {
                    result = connect_once(&config.identity, &uri) => result,
                    _ = cancel.cancelled() => break,
                };
                match attempt {
                    Ok(ws) => {
                        let (outbound_tx, outbound_rx) = mpsc::channel(CHANNEL_BUFFER);
                        let (inbound_tx, inbound_rx) = mpsc::channel(CHANNEL_BUFFER);
                        let connection = RelayConnection {
                            identity: config.identity.clone(),
                            uri: uri.clone(),
                            outbound: outbound_tx,
                            inbound: inbound_rx,
                        };
                        if conn_tx.send(connection).await.is_err() {
                            debug!("connection consumer dropped, stopping client");
                            break;
                        }
                        pump(ws, outbound_rx, inbound_tx, cancel.clone()).await;
                        if cancel.is_cancelled() {
                            break;
                        }
                        info!(identity = %config.identity, "relay connection closed, rejoining");
                        ClientState::Resolving
                    }
                    Err(e) => {
                        warn!(
                            error = %e,
                            delay_ms = config.retry_delay.as_millis() as u64,
                            "connect failed, retrying"
                        );
                        ClientState::Backoff
                    }
                }
            }
            ClientState::Backoff => {
                tokio::select! {
                    _ = tokio::time::sleep(config.retry_delay) => ClientState::Resolving,
                    _ = cancel.cancelled() => break,
                }
            }
        };
    }

    debug!(identity = %config.identity, "client loop ended");
}

/// One connect attempt: fixed subprotocol, identity as the origin.
async fn connect_once(identity: &str, uri: &str) -> HydraResult<ClientWs> {
    let mut request = uri
        .into_client_request()
        .map_err(|e| HydraError::Transport(format!("invalid relay uri: {e}")))?;
    request.headers_mut().insert(
        ORIGIN,
        HeaderValue::from_str(identity)
            .map_err(|e| HydraError::Transport(format!("invalid identity: {e}")))?,
    );
    request.headers_mut().insert(
        SEC_WEBSOCKET_PROTOCOL,
        HeaderValue::from_static(RELAY_PROTOCOL),
    );

    let (ws, _response) = connect_async(request)
        .await
        .map_err(|e| HydraError::Transport(format!("connect failed: {e}")))?;
    Ok(ws)
}

/// Bridge the socket and the caller's channels until either side closes
/// or the client shuts down.
async fn pump(
    ws: ClientWs,
    mut outbound_rx: mpsc::Receiver<Message>,
    inbound_tx: mpsc::Sender<Inbound>,
    cancel: CancellationToken,
) {
    let (mut sink, mut source) = ws.split();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
            Some(frame) = outbound_rx.recv() => {
                if sink.send(frame).await.is_err() {
                    break;
                }
            }
            inbound = source.next() => match inbound {
                Some(Ok(Message::Text(text))) => match decode_inbound(&text) {
                    Some(event) => {
                        if inbound_tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    None => warn!("malformed frame from relay dropped"),
                },
                Some(Ok(Message::Ping(payload))) => {
                    let _ = sink.send(Message::Pong(payload)).await;
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {} // binary and pong frames are ignored
                Some(Err(e)) => {
                    debug!(error = %e, "read error");
                    break;
                }
            }
        }
    }
}

/// Decode one inbound text frame, special-casing only the handshake.
fn decode_inbound(raw: &str) -> Option<Inbound> {
    let value: Value = serde_json::from_str(raw).ok()?;
    if let Ok(Control::Uuid { uuid }) = serde_json::from_value::<Control>(value.clone()) {
        return Some(Inbound::Handshake { uuid });
    }
    Some(Inbound::Frame(value))
}
