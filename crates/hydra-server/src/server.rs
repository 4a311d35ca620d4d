//! Relay server: listener, connection lifecycle, frame pump.
//!
//! Owns the listening socket and wires admission, registry, and router
//! together. Every accepted connection runs in its own task: inbound text
//! frames go to the router, outbound frames drain from the peer's bounded
//! queue, and every exit path removes the registry entry.

use crate::admission::AdmissionController;
use crate::config::RelayConfig;
use crate::registry::ClientRegistry;
use crate::router::MessageRouter;
use futures_util::{SinkExt, StreamExt};
use hydra_core::{envelope, HydraError, HydraResult, RELAY_PROTOCOL};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{
    ErrorResponse, Request as HsRequest, Response as HsResponse,
};
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::http::{HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

/// How much of the request head we sniff to tell plain HTTP from an
/// upgrade attempt.
const REQUEST_HEAD_LIMIT: usize = 2048;

/// The relay server instance.
pub struct RelayServer {
    config: RelayConfig,
    registry: Arc<ClientRegistry>,
    admission: AdmissionController,
    router: MessageRouter,
}

impl RelayServer {
    /// Create a new relay from resolved configuration.
    pub fn new(config: RelayConfig) -> Self {
        let tables = Arc::new(config.tables.clone());
        let registry = Arc::new(ClientRegistry::new());
        let admission = AdmissionController::new(registry.clone(), tables.clone());
        let router = MessageRouter::new(registry.clone(), tables);
        Self {
            config,
            registry,
            admission,
            router,
        }
    }

    /// The live connection registry (admission and tests read it).
    pub fn registry(&self) -> &Arc<ClientRegistry> {
        &self.registry
    }

    pub fn router(&self) -> &MessageRouter {
        &self.router
    }

    /// Bind the configured port and serve until the listener fails.
    pub async fn run(self: Arc<Self>) -> HydraResult<()> {
        let addr: SocketAddr = format!("0.0.0.0:{}", self.config.port)
            .parse()
            .map_err(|e| HydraError::Other(format!("invalid address: {e}")))?;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| HydraError::Transport(format!("bind failed: {e}")))?;
        info!(port = self.config.port, "hydra relay listening");
        self.serve(listener).await
    }

    /// Accept connections from an already-bound listener.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> HydraResult<()> {
        loop {
            match listener.accept().await {
                Ok((stream, remote)) => {
                    let server = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = server.handle_connection(stream, remote).await {
                            debug!(remote = %remote, error = %e, "connection ended with error");
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "TCP accept failed");
                }
            }
        }
    }

    /// Drive one TCP connection from sniff through WebSocket teardown.
    async fn handle_connection(&self, stream: TcpStream, remote: SocketAddr) -> HydraResult<()> {
        if !sniff_upgrade(&stream).await? {
            respond_not_found(stream, remote).await;
            return Ok(());
        }

        // Capture the origin and screen it inside the handshake callback,
        // so a bad origin is refused before the upgrade completes.
        let captured_origin: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
        let callback = {
            let captured_origin = captured_origin.clone();
            let admission = &self.admission;
            move |req: &HsRequest, mut response: HsResponse| -> Result<HsResponse, ErrorResponse> {
                let origin = req
                    .headers()
                    .get("origin")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default()
                    .to_string();
                *captured_origin.lock() = Some(origin.clone());

                match admission.screen(&origin) {
                    Ok(()) => {
                        response.headers_mut().append(
                            SEC_WEBSOCKET_PROTOCOL,
                            HeaderValue::from_static(RELAY_PROTOCOL),
                        );
                        Ok(response)
                    }
                    Err(rejection) => {
                        warn!(origin, reason = %rejection, "connection rejected");
                        let mut refused = ErrorResponse::new(Some(rejection.to_string()));
                        *refused.status_mut() = StatusCode::FORBIDDEN;
                        Err(refused)
                    }
                }
            }
        };

        let ws = tokio_tungstenite::accept_hdr_async(stream, callback)
            .await
            .map_err(|e| HydraError::Transport(format!("handshake failed: {e}")))?;

        let origin = captured_origin.lock().clone().unwrap_or_default();
        let (handle, mut outbound_rx) = self
            .admission
            .register(&origin, remote)
            .map_err(|r| HydraError::Admission(format!("{origin}: {r}")))?;

        // First frame on the wire: the peer learns its own id.
        handle.send(Message::text(envelope::encode(&envelope::uuid_envelope(
            handle.peer_id,
        ))?));

        let (mut sink, mut source) = ws.split();
        loop {
            tokio::select! {
                Some(frame) = outbound_rx.recv() => {
                    if sink.send(frame).await.is_err() {
                        break;
                    }
                }
                inbound = source.next() => match inbound {
                    Some(Ok(Message::Text(text))) => self.router.on_frame(&handle, &text),
                    Some(Ok(Message::Ping(payload))) => handle.send(Message::Pong(payload)),
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {} // binary and pong frames are ignored
                    Some(Err(e)) => {
                        debug!(remote = %remote, error = %e, "read error");
                        break;
                    }
                }
            }
        }

        self.registry.remove(&handle.identity, handle.peer_id);
        info!(remote = %remote, peer = %handle.peer_id, "peer disconnected");
        Ok(())
    }
}

/// Best-effort sniff of the request head.
///
/// The head virtually always arrives in one segment. A complete head with
/// no upgrade header is plain HTTP; an incomplete one is handed to the
/// WebSocket handshake parser to decide.
async fn sniff_upgrade(stream: &TcpStream) -> HydraResult<bool> {
    let mut buf = [0u8; REQUEST_HEAD_LIMIT];
    let n = stream.peek(&mut buf).await?;
    let head = String::from_utf8_lossy(&buf[..n]).to_ascii_lowercase();
    if head.contains("upgrade:") && head.contains("websocket") {
        return Ok(true);
    }
    Ok(!head.contains("\r\n\r\n"))
}

/// Any non-WebSocket request gets a 404, nothing else.
async fn respond_not_found(mut stream: TcpStream, remote: SocketAddr) {
    let mut head = [0u8; REQUEST_HEAD_LIMIT];
    let _ = stream.read(&mut head).await;
    let _ = stream
        .write_all(b"HTTP/1.1 404 Not Found\r\ncontent-length: 0\r\nconnection: close\r\n\r\n")
        .await;
    let _ = stream.shutdown().await;
    info!(remote = %remote, "non-websocket request answered 404");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RelayConfig;
    use hydra_core::envelope::Control;
    use hydra_core::RelayTables;
    use std::collections::BTreeMap;
    use std::time::Duration;
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;
    use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
    use uuid::Uuid;

    type ClientWs = WebSocketStream<MaybeTlsStream<TcpStream>>;

    fn test_tables() -> RelayTables {
        RelayTables {
            ports: BTreeMap::from([
                ("cerberus".to_string(), 1232),
                ("medusa".to_string(), 1233),
                ("hydra".to_string(), 0),
            ]),
            allowed_ssl_domains: vec!["acme.studio110.local".to_string()],
            vhosts: BTreeMap::new(),
            hostname: "studio110".to_string(),
        }
    }

    async fn start_relay() -> (Arc<RelayServer>, SocketAddr) {
        let server = Arc::new(RelayServer::new(RelayConfig {
            port: 0,
            tables: test_tables(),
        }));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let serving = server.clone();
        tokio::spawn(async move {
            let _ = serving.serve(listener).await;
        });
        (server, addr)
    }

    async fn connect(
        addr: SocketAddr,
        origin: &str,
    ) -> Result<ClientWs, tokio_tungstenite::tungstenite::Error> {
        let mut request = format!("ws://{addr}/").into_client_request().unwrap();
        request
            .headers_mut()
            .insert("origin", HeaderValue::from_str(origin).unwrap());
        request.headers_mut().insert(
            SEC_WEBSOCKET_PROTOCOL,
            HeaderValue::from_static(RELAY_PROTOCOL),
        );
        connect_async(request).await.map(|(ws, _)| ws)
    }

    async fn next_text(ws: &mut ClientWs) -> String {
        loop {
            match tokio::time::timeout(Duration::from_secs(5), ws.next())
                .await
                .expect("timed out waiting for frame")
                .expect("connection closed")
                .expect("read failed")
            {
                Message::Text(text) => return text,
                _ => continue,
            }
        }
    }

    async fn read_handshake(ws: &mut ClientWs) -> Uuid {
        let raw = next_text(ws).await;
        match serde_json::from_str::<Control>(&raw).unwrap() {
            Control::Uuid { uuid } => uuid,
            other => panic!("expected uuid handshake, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn app_handshake_assigns_peer_id() {
        let (server, addr) = start_relay().await;
        let mut ws = connect(addr, "medusa").await.unwrap();
        let peer_id = read_handshake(&mut ws).await;
        let handle = server.registry().lookup_app("medusa").unwrap();
        assert_eq!(handle.peer_id, peer_id);
    }

    #[tokio::test]
    async fn second_app_connection_is_rejected() {
        let (_server, addr) = start_relay().await;
        let mut first = connect(addr, "medusa").await.unwrap();
        let _ = read_handshake(&mut first).await;
        assert!(connect(addr, "medusa").await.is_err());
        // The first connection is untouched.
        first.send(Message::text(r#"{"type":"message","message":"ok"}"#))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn external_domain_holds_many_peers() {
        let (server, addr) = start_relay().await;
        let mut a = connect(addr, "acme.studio110.local").await.unwrap();
        let mut b = connect(addr, "acme.studio110.local").await.unwrap();
        let id_a = read_handshake(&mut a).await;
        let id_b = read_handshake(&mut b).await;
        assert_ne!(id_a, id_b);
        assert!(server
            .registry()
            .lookup_peer("acme.studio110.local", id_a)
            .is_some());
        assert!(server
            .registry()
            .lookup_peer("acme.studio110.local", id_b)
            .is_some());
    }

    #[tokio::test]
    async fn peers_route_within_their_domain() {
        let (_server, addr) = start_relay().await;
        let mut target = connect(addr, "acme.studio110.local").await.unwrap();
        let target_id = read_handshake(&mut target).await;
        let mut sender = connect(addr, "acme.studio110.local").await.unwrap();
        let _ = read_handshake(&mut sender).await;

        sender
            .send(Message::text(format!(
                r#"{{"to":"{target_id}","message":"hi"}}"#
            )))
            .await
            .unwrap();
        assert_eq!(next_text(&mut target).await, r#""hi""#);
    }

    #[tokio::test]
    async fn payload_reaches_an_app_verbatim() {
        let (_server, addr) = start_relay().await;
        let mut cerberus = connect(addr, "cerberus").await.unwrap();
        let _ = read_handshake(&mut cerberus).await;
        let mut peer = connect(addr, "acme.studio110.local").await.unwrap();
        let _ = read_handshake(&mut peer).await;

        peer.send(Message::text(r#"{"to":"cerberus","message":{"x":1}}"#))
            .await
            .unwrap();
        let delivered = next_text(&mut cerberus).await;
        assert_eq!(
            serde_json::from_str::<serde_json::Value>(&delivered).unwrap(),
            serde_json::json!({"x": 1})
        );
    }

    #[tokio::test]
    async fn rejected_origin_never_registers() {
        let (server, addr) = start_relay().await;
        assert!(connect(addr, "evil.com").await.is_err());
        assert_eq!(server.registry().connection_count(), 0);
    }

    #[tokio::test]
    async fn missing_origin_is_rejected() {
        let (_server, addr) = start_relay().await;
        let request = format!("ws://{addr}/").into_client_request().unwrap();
        assert!(connect_async(request).await.is_err());
    }

    #[tokio::test]
    async fn plain_http_gets_404() {
        let (_server, addr) = start_relay().await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET /anything HTTP/1.1\r\nhost: hydra\r\n\r\n")
            .await
            .unwrap();
        let mut buf = [0u8; 256];
        let n = stream.read(&mut buf).await.unwrap();
        let response = String::from_utf8_lossy(&buf[..n]).to_string();
        assert!(response.starts_with("HTTP/1.1 404"), "got: {response}");
    }

    #[tokio::test]
    async fn close_removes_the_registry_entry() {
        let (server, addr) = start_relay().await;
        let mut ws = connect(addr, "medusa").await.unwrap();
        let _ = read_handshake(&mut ws).await;
        ws.close(None).await.unwrap();
        drop(ws);

        // The close is observed asynchronously; poll briefly.
        for _ in 0..50 {
            if server.registry().lookup_app("medusa").is_none() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("registry entry survived the close");
    }

    #[tokio::test]
    async fn malformed_frame_does_not_kill_the_connection() {
        let (_server, addr) = start_relay().await;
        let mut cerberus = connect(addr, "cerberus").await.unwrap();
        let _ = read_handshake(&mut cerberus).await;
        let mut peer = connect(addr, "acme.studio110.local").await.unwrap();
        let _ = read_handshake(&mut peer).await;

        peer.send(Message::text("{definitely not json"))
            .await
            .unwrap();
        // The connection survives and still routes.
        peer.send(Message::text(r#"{"to":"cerberus","message":"after"}"#))
            .await
            .unwrap();
        assert_eq!(next_text(&mut cerberus).await, r#""after""#);
    }

    #[tokio::test]
    async fn app_slot_frees_for_a_reconnect() {
        let (_server, addr) = start_relay().await;
        let mut first = connect(addr, "medusa").await.unwrap();
        let _ = read_handshake(&mut first).await;
        first.close(None).await.unwrap();
        drop(first);

        // Retry until the server has processed the close.
        for _ in 0..50 {
            if let Ok(mut ws) = connect(addr, "medusa").await {
                let _ = read_handshake(&mut ws).await;
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("slot never freed for reconnection");
    }
}
