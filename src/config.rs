//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables** — `SSHBRIDGE_API_KEY`, `SSHBRIDGE_LISTEN`
//! 2. **Config file** — path via `--config <path>`, or `sshbridge.toml` in CWD
//! 3. **Compiled defaults** — see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [server]
//! listen = "0.0.0.0:8022"
//! connect_timeout_secs = 30     # tunnel + SSH handshake budget
//! write_timeout_secs = 30       # backend-side SFTP writefile guard
//! max_readfile_size = 1048576   # 1 MiB readfile cap
//! upload_queue_depth = 4        # chunks buffered per upload before pause
//!
//! [auth]
//! api_key = "your-secret-key"
//!
//! [telemetry]
//! poll_interval_ms = 1000
//!
//! [logging]
//! level = "info"
//!
//! [[connections]]
//! id = "web-1"
//! host = "203.0.113.10"
//! port = 22
//! username = "deploy"
//! password = "hunter2"          # or private_key_path / private_key (+ passphrase)
//! proxy = "dc-socks"            # optional reference into [[proxies]]
//!
//! [[proxies]]
//! id = "dc-socks"
//! kind = "socks5"               # "socks5" | "http"
//! host = "198.51.100.7"
//! port = 1080
//! username = "proxyuser"        # optional, together with password
//! password = "proxypass"
//! ```

use serde::Deserialize;
use std::path::Path;

use crate::store::{ConnectionEntry, ProxyEntry};

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Connection definitions served by the [`crate::store::ConnectionStore`].
    #[serde(default)]
    pub connections: Vec<ConnectionEntry>,
    /// Proxy definitions referenced by connections.
    #[serde(default)]
    pub proxies: Vec<ProxyEntry>,
}

/// HTTP server and resource-limit settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address to bind (default `0.0.0.0:8022`).
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Budget for tunnel establishment and for the SSH handshake, each
    /// (default 30).
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Last-resort liveness guard for `sftp:writefile` (default 30).
    #[serde(default = "default_write_timeout_secs")]
    pub write_timeout_secs: u64,
    /// Maximum bytes `sftp:readfile` will buffer (default 1 MiB). Larger
    /// files must go through the download path, not the editor view.
    #[serde(default = "default_max_readfile_size")]
    pub max_readfile_size: u64,
    /// Chunks buffered per upload before the client is told to pause
    /// (default 4).
    #[serde(default = "default_upload_queue_depth")]
    pub upload_queue_depth: usize,
}

/// Authentication settings.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// Pre-shared token for the WebSocket upgrade. Override with
    /// `SSHBRIDGE_API_KEY`. Defaults to `"change-me"` which triggers a
    /// startup warning.
    #[serde(default = "default_api_key")]
    pub api_key: String,
}

/// Telemetry poller settings.
#[derive(Debug, Clone, Deserialize)]
pub struct TelemetryConfig {
    /// Milliseconds between metric polls (default 1000). 0 disables polling.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_listen() -> String {
    "0.0.0.0:8022".to_string()
}
fn default_connect_timeout_secs() -> u64 {
    30
}
fn default_write_timeout_secs() -> u64 {
    30
}
fn default_max_readfile_size() -> u64 {
    1024 * 1024 // 1 MiB
}
fn default_upload_queue_depth() -> usize {
    4
}
fn default_api_key() -> String {
    "change-me".to_string()
}
fn default_poll_interval_ms() -> u64 {
    crate::telemetry::DEFAULT_POLL_INTERVAL_MS
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            connect_timeout_secs: default_connect_timeout_secs(),
            write_timeout_secs: default_write_timeout_secs(),
            max_readfile_size: default_max_readfile_size(),
            upload_queue_depth: default_upload_queue_depth(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            api_key: default_api_key(),
        }
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, reads that file (panics on failure). Otherwise looks
    /// for `sshbridge.toml` in the current directory, falling back to compiled
    /// defaults.
    pub fn load(path: Option<&str>) -> Self {
        let mut config: Config = if let Some(p) = path {
            let content = std::fs::read_to_string(p)
                .unwrap_or_else(|e| panic!("Failed to read config file {p}: {e}"));
            toml::from_str(&content)
                .unwrap_or_else(|e| panic!("Failed to parse config file {p}: {e}"))
        } else if Path::new("sshbridge.toml").exists() {
            let content =
                std::fs::read_to_string("sshbridge.toml").expect("Failed to read sshbridge.toml");
            toml::from_str(&content).expect("Failed to parse sshbridge.toml")
        } else {
            Config {
                server: ServerConfig::default(),
                auth: AuthConfig::default(),
                telemetry: TelemetryConfig::default(),
                logging: LoggingConfig::default(),
                connections: Vec::new(),
                proxies: Vec::new(),
            }
        };

        // Env var overrides
        if let Ok(key) = std::env::var("SSHBRIDGE_API_KEY") {
            config.auth.api_key = key;
        }
        if let Ok(listen) = std::env::var("SSHBRIDGE_LISTEN") {
            config.server.listen = listen;
        }

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_missing_sections() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.server.listen, "0.0.0.0:8022");
        assert_eq!(config.server.max_readfile_size, 1024 * 1024);
        assert_eq!(config.telemetry.poll_interval_ms, 1000);
        assert!(config.connections.is_empty());
    }

    #[test]
    fn parses_connection_and_proxy_tables() {
        let config: Config = toml::from_str(
            r#"
            [[connections]]
            id = "web-1"
            host = "203.0.113.10"
            username = "deploy"
            password = "hunter2"
            proxy = "dc-socks"

            [[proxies]]
            id = "dc-socks"
            kind = "socks5"
            host = "198.51.100.7"
            port = 1080
            "#,
        )
        .unwrap();
        assert_eq!(config.connections.len(), 1);
        assert_eq!(config.connections[0].port, 22); // default
        assert_eq!(config.proxies[0].id, "dc-socks");
    }
}
