#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_precision_loss)]

//! sshbridge library — exposes the building blocks of the session bridge:
//!
//! - `config` — TOML + env-var configuration
//! - `auth` — pre-shared token check for the WebSocket upgrade
//! - `store` — read-only connection/proxy lookup with resolved credentials
//! - `protocol` — the `{type, payload}` client message envelope
//! - `tunnel` — SOCKS5 / HTTP CONNECT proxy tunnel establishment
//! - `bridge` — SSH session orchestration (handshake, shell, sftp)
//! - `sftp` — SFTP operations and the chunked upload engine
//! - `telemetry` — periodic host metrics polling over exec channels
//! - `registry` — the process-wide table of live bridge sessions
//! - `ws` — WebSocket upgrade, message dispatch, session lifecycle

pub mod auth;
pub mod bridge;
pub mod config;
pub mod protocol;
pub mod registry;
pub mod sftp;
pub mod store;
pub mod telemetry;
pub mod tunnel;
pub mod ws;

use std::sync::Arc;

pub use config::Config;
pub use registry::SessionRegistry;
pub use store::ConnectionStore;

use bridge::SshDriver;

/// Shared application state passed to every handler via Axum's `State` extractor.
#[derive(Clone)]
pub struct AppState {
    /// Immutable configuration loaded at startup.
    pub config: Arc<Config>,
    /// Read-only connection and proxy definitions.
    pub store: Arc<ConnectionStore>,
    /// The table of live bridge sessions.
    pub registry: SessionRegistry,
    /// SSH stack used to bring sessions up; a trait object so tests can
    /// drive the lifecycle without a network.
    pub driver: Arc<dyn SshDriver>,
}
