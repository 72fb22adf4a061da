//! russh-backed implementation of the driver traits.
//!
//! One [`RusshConnection`] multiplexes the shell, the SFTP subsystem, and
//! transient exec channels over a single SSH transport. The shell channel
//! is split into read and write halves so input and resizes never wait on
//! a blocked read.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{AuthResult, Handle, Msg};
use russh::keys::PrivateKeyWithHashAlg;
use russh::ChannelMsg;
use russh_sftp::client::SftpSession;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::debug;

use crate::bridge::driver::{BoxTransport, ExecOutput, ShellChannel, SshConnection, SshDriver};
use crate::bridge::error::BridgeError;
use crate::sftp::{RusshSftpBackend, SftpBackend};
use crate::store::{ConnectionConfig, Credential, ProxyConfig};
use crate::tunnel;

struct BridgeHandler;

impl russh::client::Handler for BridgeHandler {
    type Error = russh::Error;

    // Host keys are accepted after logging the fingerprint; the backends
    // this bridge fronts are provisioned hosts, not arbitrary targets.
    fn check_server_key(
        &mut self,
        server_public_key: &russh::keys::PublicKey,
    ) -> impl std::future::Future<Output = Result<bool, Self::Error>> + Send {
        let fingerprint = server_public_key.fingerprint(russh::keys::ssh_key::HashAlg::Sha256);
        debug!(%fingerprint, "server host key");
        async { Ok(true) }
    }
}

pub struct RusshDriver {
    connect_timeout: Duration,
}

impl RusshDriver {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    fn timeout_secs(&self) -> u64 {
        self.connect_timeout.as_secs()
    }
}

#[async_trait]
impl SshDriver for RusshDriver {
    async fn establish_tunnel(
        &self,
        conn: &ConnectionConfig,
        proxy: Option<&ProxyConfig>,
    ) -> Result<BoxTransport, BridgeError> {
        let stream = match proxy {
            Some(proxy) => {
                tunnel::connect_via_proxy(proxy, &conn.host, conn.port, self.connect_timeout)
                    .await?
            }
            None => tunnel::connect_direct(&conn.host, conn.port, self.connect_timeout).await?,
        };
        Ok(Box::new(stream))
    }

    async fn handshake(
        &self,
        transport: BoxTransport,
        conn: &ConnectionConfig,
    ) -> Result<Box<dyn SshConnection>, BridgeError> {
        let config = Arc::new(russh::client::Config {
            inactivity_timeout: None,
            keepalive_interval: Some(Duration::from_secs(30)),
            ..Default::default()
        });

        let mut handle = timeout(
            self.connect_timeout,
            russh::client::connect_stream(config, transport, BridgeHandler),
        )
        .await
        .map_err(|_| BridgeError::Timeout(self.timeout_secs()))?
        .map_err(|e| BridgeError::Handshake(e.to_string()))?;

        authenticate(&mut handle, conn).await?;

        Ok(Box::new(RusshConnection {
            handle: Arc::new(handle),
            connected: AtomicBool::new(true),
        }))
    }
}

async fn authenticate(
    handle: &mut Handle<BridgeHandler>,
    conn: &ConnectionConfig,
) -> Result<(), BridgeError> {
    let result = match &conn.credential {
        Credential::Password(password) => handle
            .authenticate_password(&conn.username, password)
            .await
            .map_err(|e| BridgeError::Auth(e.to_string()))?,
        Credential::PrivateKey {
            key,
            key_path,
            passphrase,
        } => {
            let pem = match (key, key_path) {
                (Some(inline), _) => inline.clone(),
                (None, Some(path)) => {
                    let raw = tokio::fs::read(path)
                        .await
                        .map_err(|e| BridgeError::Key(format!("cannot read {path}: {e}")))?;
                    String::from_utf8_lossy(&raw).into_owned()
                }
                (None, None) => {
                    return Err(BridgeError::Key("no key material configured".to_string()))
                }
            };
            let key = russh::keys::decode_secret_key(&pem, passphrase.as_deref())?;
            handle
                .authenticate_publickey(
                    &conn.username,
                    PrivateKeyWithHashAlg::new(Arc::new(key), None),
                )
                .await
                .map_err(|e| BridgeError::Auth(e.to_string()))?
        }
    };

    match result {
        AuthResult::Success => Ok(()),
        AuthResult::Failure {
            remaining_methods,
            partial_success,
        } => {
            if partial_success {
                return Err(BridgeError::Auth(
                    "server requires additional authentication".to_string(),
                ));
            }
            Err(BridgeError::Auth(format!(
                "rejected; server accepts: {remaining_methods:?}"
            )))
        }
    }
}

type RusshChannel = russh::Channel<Msg>;

struct RusshConnection {
    handle: Arc<Handle<BridgeHandler>>,
    connected: AtomicBool,
}

impl RusshConnection {
    async fn open_session(&self) -> Result<RusshChannel, BridgeError> {
        if !self.connected.load(Ordering::Relaxed) {
            return Err(BridgeError::Disconnected);
        }
        Ok(self.handle.channel_open_session().await?)
    }
}

#[async_trait]
impl SshConnection for RusshConnection {
    async fn open_shell(&self, cols: u32, rows: u32) -> Result<Box<dyn ShellChannel>, BridgeError> {
        let channel = self.open_session().await?;
        channel
            .request_pty(false, "xterm-256color", cols, rows, 0, 0, &[])
            .await?;
        channel.request_shell(false).await?;
        let (reader, writer) = channel.split();
        Ok(Box::new(RusshShell {
            reader: Mutex::new(reader),
            writer,
        }))
    }

    async fn open_sftp(&self) -> Result<Box<dyn SftpBackend>, BridgeError> {
        let channel = self.open_session().await?;
        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(|e| BridgeError::Sftp(e.to_string()))?;
        let sftp = SftpSession::new(channel.into_stream())
            .await
            .map_err(|e| BridgeError::Sftp(e.to_string()))?;
        Ok(Box::new(RusshSftpBackend::new(sftp)))
    }

    async fn exec(&self, command: &str) -> Result<ExecOutput, BridgeError> {
        let mut channel = self.open_session().await?;
        channel.exec(true, command).await?;

        let mut stdout = Vec::new();
        let mut exit_code = 0;
        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { data } => stdout.extend_from_slice(&data),
                ChannelMsg::ExitStatus { exit_status } => exit_code = exit_status,
                ChannelMsg::Eof | ChannelMsg::Close => break,
                _ => {}
            }
        }

        Ok(ExecOutput {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            exit_code,
        })
    }

    async fn close(&self) {
        if self.connected.swap(false, Ordering::Relaxed) {
            let _ = self
                .handle
                .disconnect(russh::Disconnect::ByApplication, "", "en")
                .await;
        }
    }
}

/// Shell channel split into halves so writes and resizes never wait on a
/// blocked read.
struct RusshShell {
    reader: Mutex<russh::ChannelReadHalf>,
    writer: russh::ChannelWriteHalf<Msg>,
}

#[async_trait]
impl ShellChannel for RusshShell {
    async fn write(&self, data: &[u8]) -> Result<(), BridgeError> {
        use tokio::io::AsyncWriteExt;
        let mut writer = self.writer.make_writer();
        writer
            .write_all(data)
            .await
            .map_err(|e| BridgeError::Channel(format!("shell write failed: {e}")))
    }

    async fn read(&self) -> Result<Option<Vec<u8>>, BridgeError> {
        let mut reader = self.reader.lock().await;
        loop {
            match reader.wait().await {
                Some(ChannelMsg::Data { data }) => return Ok(Some(data.to_vec())),
                Some(ChannelMsg::ExtendedData { data, .. }) => return Ok(Some(data.to_vec())),
                Some(ChannelMsg::Eof | ChannelMsg::Close | ChannelMsg::ExitStatus { .. })
                | None => return Ok(None),
                Some(_) => {}
            }
        }
    }

    async fn resize(&self, cols: u32, rows: u32) -> Result<(), BridgeError> {
        self.writer.window_change(cols, rows, 0, 0).await?;
        Ok(())
    }

    async fn close(&self) {
        let _ = self.writer.close().await;
    }
}
