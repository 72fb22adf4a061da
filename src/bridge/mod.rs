//! Session bring-up: tunnel, SSH handshake, shell, SFTP.
//!
//! A session walks a fixed ladder of states and reports progress over the
//! outbound event channel. Exactly one terminal bring-up event reaches the
//! client: `connected` when the ladder completes, `error` when it fails.
//! A shell that cannot open is fatal; an SFTP subsystem that cannot open
//! degrades the session to shell-only and bring-up continues.

pub mod driver;
pub mod error;
pub mod ssh;

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub use driver::{ExecOutput, ShellChannel, SshConnection, SshDriver};
pub use error::BridgeError;
pub use ssh::RusshDriver;

use crate::protocol;
use crate::sftp::SftpBackend;
use crate::store::ConnectionConfig;

/// Lifecycle states of one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    TunnelPending,
    Handshaking,
    ShellOpening,
    SftpOpening,
    Ready,
    Closing,
    Closed,
    Failed,
}

/// Transition guard. `Failed` and `Closed` absorb every further request,
/// which is what makes duplicate teardown and late errors harmless.
#[derive(Debug)]
pub struct StateMachine {
    state: SessionState,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine {
    pub fn new() -> Self {
        Self {
            state: SessionState::Idle,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Attempt a transition; returns whether it took effect.
    pub fn advance(&mut self, next: SessionState) -> bool {
        use SessionState::{
            Closed, Closing, Failed, Handshaking, Idle, Ready, SftpOpening, ShellOpening,
            TunnelPending,
        };
        let legal = match (self.state, next) {
            // Direct connections skip the tunnel state.
            (Idle, TunnelPending | Handshaking)
            | (TunnelPending, Handshaking)
            | (Handshaking, ShellOpening)
            | (ShellOpening, SftpOpening)
            | (SftpOpening, Ready)
            | (Ready, Closing)
            | (Closing, Closed) => true,
            // Failure is reachable from every live state.
            (Failed | Closed, _) => false,
            (_, Failed) => true,
            // Teardown may start before the session is ready.
            (_, Closing) => true,
            _ => false,
        };
        if legal {
            debug!(from = ?self.state, to = ?next, "session state");
            self.state = next;
        }
        legal
    }
}

/// Handles of a session that reached `Ready`.
pub struct EstablishedSession {
    pub connection: Arc<dyn SshConnection>,
    pub shell: Arc<dyn ShellChannel>,
    pub sftp: Option<Arc<dyn SftpBackend>>,
}

/// Walk the bring-up ladder. Emits `status` progress messages and the
/// single `connected` event; on failure the caller owns the single
/// `error` emission after moving the machine to `Failed`.
pub async fn establish(
    driver: &dyn SshDriver,
    conn: &ConnectionConfig,
    cols: u32,
    rows: u32,
    machine: &mut StateMachine,
    events: &mpsc::Sender<Value>,
) -> Result<EstablishedSession, BridgeError> {
    if let Some(proxy) = &conn.proxy {
        machine.advance(SessionState::TunnelPending);
        send(
            events,
            protocol::status(&format!(
                "connecting to {}:{} via {}:{}",
                conn.host, conn.port, proxy.host, proxy.port
            )),
        )
        .await;
    } else {
        send(
            events,
            protocol::status(&format!("connecting to {}:{}", conn.host, conn.port)),
        )
        .await;
    }
    let transport = driver.establish_tunnel(conn, conn.proxy.as_ref()).await?;

    machine.advance(SessionState::Handshaking);
    send(events, protocol::status("negotiating SSH session")).await;
    let connection: Arc<dyn SshConnection> = driver.handshake(transport, conn).await?.into();

    machine.advance(SessionState::ShellOpening);
    send(events, protocol::status("opening shell")).await;
    let shell: Arc<dyn ShellChannel> = match connection.open_shell(cols, rows).await {
        Ok(shell) => shell.into(),
        Err(e) => {
            connection.close().await;
            return Err(e);
        }
    };

    machine.advance(SessionState::SftpOpening);
    let sftp: Option<Arc<dyn SftpBackend>> = match connection.open_sftp().await {
        Ok(backend) => Some(backend.into()),
        Err(e) => {
            warn!(connection = %conn.id, "SFTP unavailable, continuing shell-only: {e}");
            send(events, protocol::status("SFTP unavailable on this host")).await;
            None
        }
    };

    machine.advance(SessionState::Ready);
    send(events, protocol::connected(&conn.id)).await;

    Ok(EstablishedSession {
        connection,
        shell,
        sftp,
    })
}

/// Pump shell output to the client until the channel closes, then trip
/// `closed` so the owning socket loop can tear the session down.
pub fn spawn_shell_relay(
    shell: Arc<dyn ShellChannel>,
    events: mpsc::Sender<Value>,
    closed: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match shell.read().await {
                Ok(Some(data)) => {
                    if events.send(protocol::shell_data(&data)).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    debug!("shell read failed: {e}");
                    break;
                }
            }
        }
        closed.cancel();
    })
}

async fn send(events: &mpsc::Sender<Value>, event: Value) {
    let _ = events.send(event).await;
}
