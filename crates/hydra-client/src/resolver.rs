//! Relay address resolution.
//!
//! Order: an explicit URI from the caller wins; otherwise, if a vhost is
//! mapped to the relay's port, build `ws://<vhost>.<hostname>.local:<port>`
//! and use it only when a plain HTTP GET confirms it is reachable; in
//! every other case fall back to `ws://localhost:<port>/`.

use hydra_core::RelayTables;
use std::time::Duration;
use tracing::debug;

/// How long the reachability probe waits before giving up on the vhost.
const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// Resolve the relay's WebSocket URI.
pub async fn resolve_relay_uri(tables: &RelayTables, port: u16, explicit: Option<&str>) -> String {
    if let Some(uri) = explicit {
        return uri.to_string();
    }

    if let Some(vhost) = tables.vhost_for_port(port) {
        let candidate = vhost_uri(vhost, &tables.hostname, port);
        if probe_reachable(&candidate).await {
            return candidate;
        }
        debug!(uri = %candidate, "vhost probe failed, falling back to localhost");
    }

    localhost_uri(port)
}

/// `ws://<vhost>.<hostname>.local:<port>`
fn vhost_uri(vhost: &str, hostname: &str, port: u16) -> String {
    format!("ws://{vhost}.{}.local:{port}", hostname.to_lowercase())
}

/// `ws://localhost:<port>/`
fn localhost_uri(port: u16) -> String {
    format!("ws://localhost:{port}/")
}

/// Confirm the candidate answers plain HTTP with a success status.
async fn probe_reachable(uri: &str) -> bool {
    let http_uri = uri.replacen("ws://", "http://", 1);
    let client = match reqwest::Client::builder().timeout(PROBE_TIMEOUT).build() {
        Ok(client) => client,
        Err(_) => return false,
    };
    match client.get(&http_uri).send().await {
        Ok(response) => response.status().is_success(),
        Err(_) => false,
    }
}
