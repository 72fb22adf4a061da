//! # sshbridge
//!
//! WebSocket to SSH/SFTP session bridge.
//!
//! sshbridge exposes a WebSocket endpoint that browser terminals connect
//! to; each socket is bridged onto one SSH session against a backend host
//! from the connection store, optionally through a SOCKS5 or HTTP CONNECT
//! proxy. The session carries an interactive shell, SFTP file operations
//! with chunked uploads, and periodic host metrics.
//!
//! ## API surface
//!
//! | Method | Path          | Auth | Description                          |
//! |--------|---------------|------|--------------------------------------|
//! | GET    | `/api/health` | No   | Liveness probe                       |
//! | GET    | `/api/ws`     | Yes* | WebSocket session bridge             |
//!
//! *WebSocket auth is via `?token=<key>` query param (no `Authorization`
//! header available during the upgrade handshake).
//!
//! ## Architecture
//!
//! ```text
//! main.rs      — entry point, clap subcommands, router setup, graceful shutdown
//! auth.rs      — pre-shared key check, constant-time comparison
//! config.rs    — TOML + env-var configuration
//! store.rs     — read-only connection/proxy lookup
//! protocol.rs  — {type, payload} message envelope
//! tunnel.rs    — SOCKS5 / HTTP CONNECT proxy tunnels
//! bridge/
//!   driver.rs  — trait seams over the SSH stack
//!   ssh.rs     — russh implementation (handshake, auth, channels)
//!   error.rs   — session error taxonomy
//!   mod.rs     — bring-up state machine and shell relay
//! sftp/
//!   mod.rs     — SFTP backend trait + russh-sftp implementation
//!   upload.rs  — chunked uploads with pause/resume backpressure
//! telemetry/
//!   mod.rs     — per-session metrics poll loop
//!   parse.rs   — parsers for the diagnostic commands
//! registry.rs  — process-wide session table, idempotent teardown
//! ws.rs        — WebSocket upgrade, message dispatch, session lifecycle
//! ```

use std::sync::Arc;
use std::time::Duration;

use axum::{extract::State, routing::get, Json, Router};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use sshbridge::bridge::RusshDriver;
use sshbridge::{AppState, Config, ConnectionStore, SessionRegistry};

/// WebSocket to SSH/SFTP session bridge.
#[derive(Parser)]
#[command(name = "sshbridge", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the server (default when no subcommand given).
    Serve {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Serve { config }) => run_server(config.as_deref()).await,
        None => run_server(None).await,
    }
}

async fn run_server(config_path: Option<&str>) {
    let config = Config::load(config_path);

    // Initialize tracing
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    info!("sshbridge v{} starting", env!("CARGO_PKG_VERSION"));
    info!("Listening on {}", config.server.listen);
    info!(
        "{} connection(s), {} proxy(ies) configured",
        config.connections.len(),
        config.proxies.len()
    );

    if config.auth.api_key == "change-me" {
        warn!("Using default API key, set SSHBRIDGE_API_KEY or update config");
    }

    let store = ConnectionStore::new(config.connections.clone(), config.proxies.clone());
    let driver = RusshDriver::new(Duration::from_secs(config.server.connect_timeout_secs));

    let state = AppState {
        config: Arc::new(config),
        store: Arc::new(store),
        registry: SessionRegistry::new(),
        driver: Arc::new(driver),
    };

    let app = Router::new()
        .route("/api/health", get(health))
        .route("/api/ws", get(sshbridge::ws::ws_upgrade))
        .layer(TraceLayer::new_for_http())
        .with_state(state.clone());

    let listener = TcpListener::bind(&state.config.server.listen)
        .await
        .expect("Failed to bind");

    info!("Server ready");

    // Graceful shutdown
    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("Failed to register SIGTERM");
            tokio::select! {
                _ = ctrl_c => info!("Received SIGINT"),
                _ = sigterm.recv() => info!("Received SIGTERM"),
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
            info!("Received SIGINT");
        }
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .expect("Server error");

    info!("Shutting down...");
    state.registry.teardown_all().await;
    info!("Goodbye");
}

/// `GET /api/health` — liveness probe.
///
/// Returns status, version, and the live session count. No authentication
/// required, suitable for load-balancer health checks.
async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "sessions": state.registry.len().await,
    }))
}
