//! hydra-server: private WebSocket message relay.
//!
//! Accepts connections from internal apps (one live connection each) and
//! allow-listed external peers, and routes addressed JSON messages
//! between them. Everything else on the port gets a 404.

mod admission;
mod config;
mod registry;
mod router;
mod server;

use clap::Parser;
use config::RelayConfig;
use server::RelayServer;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{error, info};

/// hydra-server — private message relay
#[derive(Parser, Debug)]
#[command(name = "hydra-server", version, about = "Private message relay")]
struct Cli {
    /// Listen port (overrides the config's `ports.hydra` entry)
    #[arg(short, long)]
    port: Option<u16>,

    /// Config file path
    #[arg(long, default_value = "~/.hydra/config.toml")]
    config: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    use tracing_subscriber::EnvFilter;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    let config_path = PathBuf::from(&cli.config);
    let relay_config = match RelayConfig::load(Some(&config_path), cli.port) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = relay_config.port,
        apps = relay_config.tables.ports.len(),
        allowed_domains = relay_config.tables.allowed_ssl_domains.len(),
        "starting hydra-server"
    );

    let server = Arc::new(RelayServer::new(relay_config));

    tokio::select! {
        result = server.clone().run() => {
            if let Err(e) = result {
                error!(error = %e, "server error");
                std::process::exit(1);
            }
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal");
        }
    }

    let counters = server.router().counters();
    info!(
        connections = server.registry().connection_count(),
        routed = counters.routed.load(Ordering::Relaxed),
        missed = counters.missed.load(Ordering::Relaxed),
        malformed = counters.malformed.load(Ordering::Relaxed),
        "hydra-server stopped"
    );
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
