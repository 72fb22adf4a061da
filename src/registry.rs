//! Process-wide table of live sessions.
//!
//! The registry is the only structure shared across sessions. Each entry
//! is owned by its session's socket task; other sessions never touch it.
//! `teardown` removes the entry first and closes handles after, so however
//! many terminal events race (socket close, SSH close, shell close, fatal
//! error), each underlying handle is closed at most once. Errors during
//! close are logged and swallowed; teardown always completes.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::bridge::{ShellChannel, SshConnection};
use crate::sftp::SftpBackend;

/// Child handles of one live session, populated as bring-up progresses.
pub struct BridgeSession {
    pub id: String,
    pub connection: Option<Arc<dyn SshConnection>>,
    pub shell: Option<Arc<dyn ShellChannel>>,
    pub sftp: Option<Arc<dyn SftpBackend>>,
    /// Trips on teardown; the shell relay and telemetry poller watch it.
    pub stop: CancellationToken,
}

impl BridgeSession {
    fn empty(id: String) -> Self {
        Self {
            id,
            connection: None,
            shell: None,
            sftp: None,
            stop: CancellationToken::new(),
        }
    }
}

#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<String, BridgeSession>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate an empty slot for a freshly accepted client connection.
    /// Returns the session's stop token.
    pub async fn register(&self, id: &str) -> CancellationToken {
        let session = BridgeSession::empty(id.to_string());
        let stop = session.stop.clone();
        self.sessions.write().await.insert(id.to_string(), session);
        debug!(session = id, "session registered");
        stop
    }

    /// Attach the SSH handles once bring-up succeeds and hand back the
    /// session's stop token in the same critical section.
    ///
    /// Returns `None` when the session was torn down while bring-up was in
    /// flight; the caller still owns the handles and must close them.
    pub async fn attach(
        &self,
        id: &str,
        connection: Arc<dyn SshConnection>,
        shell: Arc<dyn ShellChannel>,
        sftp: Option<Arc<dyn SftpBackend>>,
    ) -> Option<CancellationToken> {
        let mut sessions = self.sessions.write().await;
        let session = sessions.get_mut(id)?;
        session.connection = Some(connection);
        session.shell = Some(shell);
        session.sftp = sftp;
        Some(session.stop.clone())
    }

    /// Tear down every live session, used on server shutdown.
    pub async fn teardown_all(&self) {
        let ids: Vec<String> = self.sessions.read().await.keys().cloned().collect();
        for id in ids {
            self.teardown(&id).await;
        }
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Close every child handle of a session at most once.
    ///
    /// Returns `true` for the call that actually performed teardown;
    /// concurrent or repeated calls find no entry and return `false`.
    pub async fn teardown(&self, id: &str) -> bool {
        let session = { self.sessions.write().await.remove(id) };
        let Some(session) = session else {
            return false;
        };

        // Stops the shell relay and the telemetry poller before the
        // handles underneath them go away.
        session.stop.cancel();

        if let Some(shell) = session.shell {
            shell.close().await;
        }
        if let Some(connection) = session.connection {
            connection.close().await;
        }
        // The SFTP channel rides the SSH connection; dropping the backend
        // after the disconnect is all that is left to do.
        drop(session.sftp);

        info!(session = id, "session torn down");
        true
    }
}
