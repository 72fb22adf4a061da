//! Trait seams between the session orchestrator and the SSH stack.
//!
//! The orchestrator only sees these traits, so its state machine and
//! teardown logic can be exercised against in-process fakes.

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::bridge::error::BridgeError;
use crate::sftp::SftpBackend;
use crate::store::{ConnectionConfig, ProxyConfig};

/// Byte stream carrying the SSH transport, possibly through a proxy.
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Transport for T {}

pub type BoxTransport = Box<dyn Transport>;

/// Output of a one-shot remote command.
#[derive(Debug)]
pub struct ExecOutput {
    pub stdout: String,
    pub exit_code: u32,
}

impl ExecOutput {
    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Establishes transports and SSH connections.
#[async_trait]
pub trait SshDriver: Send + Sync {
    /// Open the raw byte stream to the backend, through the proxy when one
    /// is configured. One timeout covers the whole attempt; no retries.
    async fn establish_tunnel(
        &self,
        conn: &ConnectionConfig,
        proxy: Option<&ProxyConfig>,
    ) -> Result<BoxTransport, BridgeError>;

    /// Run the SSH handshake and authenticate over an established transport.
    async fn handshake(
        &self,
        transport: BoxTransport,
        conn: &ConnectionConfig,
    ) -> Result<Box<dyn SshConnection>, BridgeError>;
}

/// An authenticated SSH connection that can open channels.
#[async_trait]
pub trait SshConnection: Send + Sync {
    async fn open_shell(&self, cols: u32, rows: u32) -> Result<Box<dyn ShellChannel>, BridgeError>;

    async fn open_sftp(&self) -> Result<Box<dyn SftpBackend>, BridgeError>;

    /// Run one command on a fresh exec channel and collect its output.
    async fn exec(&self, command: &str) -> Result<ExecOutput, BridgeError>;

    /// Drop the underlying connection. Must tolerate repeated calls.
    async fn close(&self);
}

/// An interactive shell channel with a PTY.
#[async_trait]
pub trait ShellChannel: Send + Sync {
    async fn write(&self, data: &[u8]) -> Result<(), BridgeError>;

    /// Next chunk of shell output. `None` means the channel closed.
    async fn read(&self) -> Result<Option<Vec<u8>>, BridgeError>;

    async fn resize(&self, cols: u32, rows: u32) -> Result<(), BridgeError>;

    /// Signal EOF to the remote shell. Must tolerate repeated calls.
    async fn close(&self);
}
