//! WebSocket transport: one socket, one bridge session.
//!
//! ## Connection lifecycle
//!
//! 1. Client connects to `GET /api/ws?token=<api_key>` — the token is
//!    validated before the upgrade completes.
//! 2. The client sends `connect` with a connection id from the store; the
//!    server walks the bring-up ladder and answers with `status` progress,
//!    then exactly one of `connected` or `error`.
//! 3. Shell bytes, SFTP requests and telemetry updates flow until a
//!    terminal event (socket close, SSH close, shell close, fatal error),
//!    at which point the registry tears the session down exactly once.
//!
//! Message shapes live in [`crate::protocol`].

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Query, State, WebSocketUpgrade},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::bridge::{self, SessionState, ShellChannel, StateMachine};
use crate::protocol::{self, ClientRequest};
use crate::sftp::{SftpBackend, SftpError, UploadTable};
use crate::telemetry;
use crate::AppState;

/// Query parameters for the WebSocket upgrade request.
#[derive(Deserialize)]
pub struct WsQuery {
    /// API key passed as a query parameter (since HTTP headers aren't available
    /// during a browser WebSocket upgrade).
    pub token: String,
}

/// `GET /api/ws?token=<key>` — WebSocket upgrade handler.
///
/// Validates the token before upgrading. Returns `403 Forbidden` on auth
/// failure.
pub async fn ws_upgrade(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    if !crate::auth::constant_time_eq(state.config.auth.api_key.as_bytes(), query.token.as_bytes())
    {
        return (StatusCode::FORBIDDEN, "Forbidden").into_response();
    }

    ws.on_upgrade(move |socket| handle_ws(socket, state))
}

/// Main WebSocket event loop.
///
/// Splits the socket into a sink (outgoing) and stream (incoming). Outgoing
/// messages are funneled through an mpsc channel so the shell relay, the
/// telemetry poller and upload writers can send without holding the socket.
async fn handle_ws(socket: axum::extract::ws::WebSocket, state: AppState) {
    let (ws_sink, mut ws_stream) = socket.split();

    // Channel for sending messages back to the WebSocket
    let (tx, rx) = mpsc::channel::<Value>(256);

    let session_id = Uuid::new_v4().to_string();
    let stop = state.registry.register(&session_id).await;
    info!(session = %session_id, "client connected");

    let mut send_task = spawn_send_task(rx, ws_sink);

    let mut machine = StateMachine::new();
    let mut shell: Option<Arc<dyn ShellChannel>> = None;
    let mut sftp: Option<Arc<dyn SftpBackend>> = None;
    let mut uploads = UploadTable::new(state.config.server.upload_queue_depth);

    loop {
        tokio::select! {
            // Shell closed, SSH died, or another failure path already tore
            // the session down.
            () = stop.cancelled() => {
                debug!(session = %session_id, "session stopped, closing socket");
                break;
            }
            ws_msg = ws_stream.next() => {
                let Some(Ok(msg)) = ws_msg else { break };
                let text = match msg {
                    axum::extract::ws::Message::Text(text) => text,
                    axum::extract::ws::Message::Close(_) => break,
                    _ => continue,
                };

                let request = match protocol::parse_frame(&text) {
                    Ok(request) => request,
                    Err(e) => {
                        let _ = tx.send(protocol::error(&e.to_string())).await;
                        continue;
                    }
                };

                match request {
                    ClientRequest::Connect { id, cols, rows } => {
                        if machine.state() != SessionState::Idle {
                            let _ = tx.send(protocol::error("session already connected")).await;
                            continue;
                        }
                        match connect(&state, &session_id, &id, cols, rows, &mut machine, &tx).await {
                            Ok((new_shell, new_sftp)) => {
                                shell = Some(new_shell);
                                sftp = new_sftp;
                            }
                            Err(message) => {
                                machine.advance(SessionState::Failed);
                                let _ = tx.send(protocol::error(&message)).await;
                                break;
                            }
                        }
                    }
                    ClientRequest::Input { data } => {
                        if let Some(shell) = &shell {
                            if let Err(e) = shell.write(&data).await {
                                warn!(session = %session_id, "shell input dropped: {e}");
                            }
                        }
                    }
                    ClientRequest::Resize { cols, rows } => {
                        if let Some(shell) = &shell {
                            if let Err(e) = shell.resize(cols, rows).await {
                                debug!(session = %session_id, "resize failed: {e}");
                            }
                        }
                    }
                    ClientRequest::UploadStart { transfer_id, path } => {
                        match require_sftp(&sftp) {
                            Ok(backend) => match backend.open_write(&path).await {
                                Ok(sink) => uploads.start(&transfer_id, &path, sink, &tx).await,
                                Err(e) => {
                                    let _ = tx
                                        .send(protocol::upload_error(&transfer_id, &e.to_string()))
                                        .await;
                                }
                            },
                            Err(e) => {
                                let _ = tx
                                    .send(protocol::upload_error(&transfer_id, &e.to_string()))
                                    .await;
                            }
                        }
                    }
                    ClientRequest::UploadChunk { transfer_id, data, is_last } => {
                        uploads.push_chunk(&transfer_id, data, is_last, &tx).await;
                    }
                    ClientRequest::UploadCancel { transfer_id } => {
                        uploads.cancel(&transfer_id, &tx).await;
                    }
                    // Single-shot SFTP operations run concurrently; replies
                    // carry the originating path for correlation.
                    other => {
                        let sftp = sftp.clone();
                        let tx = tx.clone();
                        let limits = SftpLimits {
                            max_readfile_size: state.config.server.max_readfile_size,
                            write_timeout: Duration::from_secs(state.config.server.write_timeout_secs),
                        };
                        tokio::spawn(async move {
                            let reply = sftp_request(sftp, other, limits).await;
                            let _ = tx.send(reply).await;
                        });
                    }
                }
            }
        }
    }

    // Whichever terminal event got here first wins; the rest find the
    // registry entry already gone.
    if state.registry.teardown(&session_id).await {
        info!(session = %session_id, "client disconnected");
    }

    // A terminal `error` frame may still be queued. Dropping the senders
    // lets the send task drain the channel and exit on its own; the abort
    // only fires if a stuck socket keeps it alive past the deadline.
    drop(uploads);
    drop(tx);
    if tokio::time::timeout(Duration::from_secs(1), &mut send_task)
        .await
        .is_err()
    {
        send_task.abort();
    }
}

/// Forward queued outbound frames to the socket sink until every sender is
/// gone or the sink errors. Draining before exit is what guarantees a
/// terminal error frame reaches the client.
fn spawn_send_task<S>(mut rx: mpsc::Receiver<Value>, mut ws_sink: S) -> tokio::task::JoinHandle<()>
where
    S: futures::Sink<axum::extract::ws::Message> + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let text = match serde_json::to_string(&msg) {
                Ok(t) => t,
                Err(e) => {
                    error!("WS send: failed to serialize message: {e}");
                    continue;
                }
            };
            if ws_sink
                .send(axum::extract::ws::Message::Text(text.into()))
                .await
                .is_err()
            {
                break;
            }
        }
    })
}

/// Handle `connect`: resolve the target, bring the session up, start the
/// shell relay and the telemetry poller.
async fn connect(
    state: &AppState,
    session_id: &str,
    connection_id: &str,
    cols: u32,
    rows: u32,
    machine: &mut StateMachine,
    tx: &mpsc::Sender<Value>,
) -> Result<(Arc<dyn ShellChannel>, Option<Arc<dyn SftpBackend>>), String> {
    let conn = state
        .store
        .get_connection(connection_id)
        .map_err(|e| e.to_string())?;

    let session = bridge::establish(state.driver.as_ref(), &conn, cols, rows, machine, tx)
        .await
        .map_err(|e| e.to_string())?;

    let attached = state
        .registry
        .attach(
            session_id,
            session.connection.clone(),
            session.shell.clone(),
            session.sftp.clone(),
        )
        .await;
    let Some(stop) = attached else {
        // The registry entry is gone: teardown (or server shutdown) raced
        // the bring-up. The handles were never registered, so they are
        // closed here before reporting the failure.
        session.shell.close().await;
        session.connection.close().await;
        return Err("session closed during connect".to_string());
    };
    bridge::spawn_shell_relay(session.shell.clone(), tx.clone(), stop.clone());
    let poll_interval_ms = state.config.telemetry.poll_interval_ms;
    if poll_interval_ms > 0 {
        telemetry::spawn_poller(
            session.connection.clone(),
            Duration::from_millis(poll_interval_ms),
            tx.clone(),
            stop,
        );
    }

    Ok((session.shell, session.sftp))
}

struct SftpLimits {
    max_readfile_size: u64,
    write_timeout: Duration,
}

fn require_sftp(sftp: &Option<Arc<dyn SftpBackend>>) -> Result<Arc<dyn SftpBackend>, SftpError> {
    sftp.clone().ok_or(SftpError::Unavailable)
}

/// Run one single-shot SFTP operation and build its reply envelope.
async fn sftp_request(
    sftp: Option<Arc<dyn SftpBackend>>,
    request: ClientRequest,
    limits: SftpLimits,
) -> Value {
    let (op, path) = match &request {
        ClientRequest::SftpReaddir { path } => ("readdir", path.clone()),
        ClientRequest::SftpStat { path } => ("stat", path.clone()),
        ClientRequest::SftpMkdir { path } => ("mkdir", path.clone()),
        ClientRequest::SftpRmdir { path } => ("rmdir", path.clone()),
        ClientRequest::SftpUnlink { path } => ("unlink", path.clone()),
        ClientRequest::SftpRename { old_path, .. } => ("rename", old_path.clone()),
        ClientRequest::SftpChmod { path, .. } => ("chmod", path.clone()),
        ClientRequest::SftpReadFile { path } => ("readfile", path.clone()),
        ClientRequest::SftpWriteFile { path, .. } => ("writefile", path.clone()),
        // connect/input/resize/upload are handled in the socket loop.
        _ => return protocol::error("internal: not an sftp request"),
    };

    let backend = match require_sftp(&sftp) {
        Ok(backend) => backend,
        Err(e) => return protocol::sftp_error(op, &path, &e.to_string()),
    };

    let result = run_sftp_op(&*backend, request, &limits).await;
    match result {
        Ok(body) => protocol::sftp_success(op, body),
        Err(e) => protocol::sftp_error(op, &path, &e.to_string()),
    }
}

async fn run_sftp_op(
    backend: &dyn SftpBackend,
    request: ClientRequest,
    limits: &SftpLimits,
) -> Result<Value, SftpError> {
    match request {
        ClientRequest::SftpReaddir { path } => {
            let entries = backend.readdir(&path).await?;
            Ok(json!({ "path": path, "entries": entries }))
        }
        ClientRequest::SftpStat { path } => {
            let stat = backend.stat(&path).await?;
            Ok(json!({ "path": path, "stat": stat }))
        }
        ClientRequest::SftpMkdir { path } => {
            backend.mkdir(&path).await?;
            Ok(json!({ "path": path }))
        }
        ClientRequest::SftpRmdir { path } => {
            backend.rmdir(&path).await?;
            Ok(json!({ "path": path }))
        }
        ClientRequest::SftpUnlink { path } => {
            backend.unlink(&path).await?;
            Ok(json!({ "path": path }))
        }
        ClientRequest::SftpRename { old_path, new_path } => {
            backend.rename(&old_path, &new_path).await?;
            Ok(json!({ "oldPath": old_path, "newPath": new_path }))
        }
        ClientRequest::SftpChmod { path, mode } => {
            backend.chmod(&path, mode).await?;
            Ok(json!({ "path": path, "mode": mode }))
        }
        ClientRequest::SftpReadFile { path } => {
            let content = backend.read_file(&path, limits.max_readfile_size).await?;
            Ok(json!({
                "path": path,
                "content": protocol::encode_bytes(&content),
                "size": content.len(),
            }))
        }
        ClientRequest::SftpWriteFile { path, content } => {
            // Last-resort liveness guard: a write that neither finishes nor
            // errors within the window is resolved as failed.
            let write = backend.write_file(&path, &content);
            tokio::time::timeout(limits.write_timeout, write)
                .await
                .map_err(|_| SftpError::Timeout)??;
            Ok(json!({ "path": path, "size": content.len() }))
        }
        _ => Err(SftpError::Other("not an sftp request".to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use tokio::io::AsyncWrite;

    use crate::sftp::{DirEntry, FileKind, FileStat};

    /// Backend where rename fails on collision without touching anything,
    /// and everything else succeeds with canned data.
    struct CannedBackend;

    #[async_trait]
    impl SftpBackend for CannedBackend {
        async fn readdir(&self, _path: &str) -> Result<Vec<DirEntry>, SftpError> {
            Ok(vec![DirEntry {
                name: "notes.txt".to_string(),
                kind: FileKind::File,
                size: 42,
                mtime: Some(1_700_000_000),
                permissions: 0o644,
                uid: Some(1000),
                gid: Some(1000),
            }])
        }
        async fn stat(&self, _path: &str) -> Result<FileStat, SftpError> {
            Ok(FileStat {
                kind: FileKind::Symlink,
                size: 11,
                mtime: None,
                permissions: 0o777,
                uid: None,
                gid: None,
            })
        }
        async fn read_file(&self, path: &str, limit: u64) -> Result<Vec<u8>, SftpError> {
            if path == "/big" {
                return Err(SftpError::TooLarge {
                    size: limit + 1,
                    limit,
                });
            }
            Ok(b"hello".to_vec())
        }
        async fn write_file(&self, path: &str, _content: &[u8]) -> Result<(), SftpError> {
            if path == "/slow" {
                // Never resolves; the caller's timeout must fire.
                std::future::pending::<()>().await;
            }
            Ok(())
        }
        async fn mkdir(&self, _path: &str) -> Result<(), SftpError> {
            Ok(())
        }
        async fn rmdir(&self, _path: &str) -> Result<(), SftpError> {
            Ok(())
        }
        async fn unlink(&self, _path: &str) -> Result<(), SftpError> {
            Ok(())
        }
        async fn rename(&self, _old: &str, new: &str) -> Result<(), SftpError> {
            if new == "/exists" {
                return Err(SftpError::Other("destination exists".to_string()));
            }
            Ok(())
        }
        async fn chmod(&self, _path: &str, _mode: u32) -> Result<(), SftpError> {
            Ok(())
        }
        async fn open_write(
            &self,
            _path: &str,
        ) -> Result<Box<dyn AsyncWrite + Send + Unpin>, SftpError> {
            let (a, _b) = tokio::io::duplex(16);
            Ok(Box::new(a))
        }
    }

    fn limits() -> SftpLimits {
        SftpLimits {
            max_readfile_size: 1024,
            write_timeout: Duration::from_millis(50),
        }
    }

    fn backend() -> Option<Arc<dyn SftpBackend>> {
        Some(Arc::new(CannedBackend))
    }

    #[tokio::test]
    async fn readdir_reply_echoes_the_path() {
        let reply = sftp_request(
            backend(),
            ClientRequest::SftpReaddir {
                path: "/home/user".to_string(),
            },
            limits(),
        )
        .await;
        assert_eq!(reply["type"], "sftp:readdir:success");
        assert_eq!(reply["payload"]["path"], "/home/user");
        assert_eq!(reply["payload"]["entries"][0]["name"], "notes.txt");
        assert_eq!(reply["payload"]["entries"][0]["type"], "file");
    }

    #[tokio::test]
    async fn rename_success_returns_both_paths() {
        let reply = sftp_request(
            backend(),
            ClientRequest::SftpRename {
                old_path: "/a".to_string(),
                new_path: "/b".to_string(),
            },
            limits(),
        )
        .await;
        assert_eq!(reply["type"], "sftp:rename:success");
        assert_eq!(reply["payload"]["oldPath"], "/a");
        assert_eq!(reply["payload"]["newPath"], "/b");
    }

    #[tokio::test]
    async fn rename_collision_is_a_per_request_error() {
        let reply = sftp_request(
            backend(),
            ClientRequest::SftpRename {
                old_path: "/a".to_string(),
                new_path: "/exists".to_string(),
            },
            limits(),
        )
        .await;
        assert_eq!(reply["type"], "sftp:rename:error");
        assert_eq!(reply["payload"]["path"], "/a");
    }

    #[tokio::test]
    async fn oversized_readfile_is_rejected() {
        let reply = sftp_request(
            backend(),
            ClientRequest::SftpReadFile {
                path: "/big".to_string(),
            },
            limits(),
        )
        .await;
        assert_eq!(reply["type"], "sftp:readfile:error");
        let message = reply["payload"]["message"].as_str().unwrap();
        assert!(message.contains("too large"), "got: {message}");
    }

    #[tokio::test]
    async fn stalled_writefile_resolves_as_failed() {
        let reply = sftp_request(
            backend(),
            ClientRequest::SftpWriteFile {
                path: "/slow".to_string(),
                content: b"data".to_vec(),
            },
            limits(),
        )
        .await;
        assert_eq!(reply["type"], "sftp:writefile:error");
        assert!(reply["payload"]["message"]
            .as_str()
            .unwrap()
            .contains("timed out"));
    }

    #[tokio::test]
    async fn sftp_requests_without_backend_fail_per_request() {
        let reply = sftp_request(
            None,
            ClientRequest::SftpStat {
                path: "/etc".to_string(),
            },
            limits(),
        )
        .await;
        assert_eq!(reply["type"], "sftp:stat:error");
        assert!(reply["payload"]["message"]
            .as_str()
            .unwrap()
            .contains("not available"));
    }

    #[tokio::test]
    async fn queued_frames_are_flushed_after_the_last_sender_drops() {
        let (sink_tx, mut sink_rx) = futures::channel::mpsc::unbounded();
        let (tx, rx) = mpsc::channel(8);
        let task = spawn_send_task(rx, sink_tx);

        tx.send(protocol::error("handshake failed")).await.unwrap();
        tx.send(protocol::status("closing")).await.unwrap();
        drop(tx);

        // With every sender gone the task drains the queue and exits; an
        // abort here would lose the error frame.
        task.await.unwrap();

        let mut frames = Vec::new();
        while let Ok(Some(frame)) = sink_rx.try_next() {
            frames.push(frame);
        }
        assert_eq!(frames.len(), 2);
        let axum::extract::ws::Message::Text(text) = &frames[0] else {
            panic!("expected a text frame");
        };
        assert!(text.contains("handshake failed"));
    }

    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::bridge::driver::BoxTransport;
    use crate::bridge::{BridgeError, ExecOutput, SshConnection, SshDriver};
    use crate::store::{ConnectionConfig, ConnectionEntry, ProxyConfig};
    use crate::{Config, ConnectionStore, SessionRegistry};

    struct StubDriver {
        closes: Arc<AtomicUsize>,
    }

    struct StubConnection {
        closes: Arc<AtomicUsize>,
    }

    struct StubShell;

    #[async_trait]
    impl SshDriver for StubDriver {
        async fn establish_tunnel(
            &self,
            _conn: &ConnectionConfig,
            _proxy: Option<&ProxyConfig>,
        ) -> Result<BoxTransport, BridgeError> {
            let (a, _b) = tokio::io::duplex(16);
            Ok(Box::new(a))
        }

        async fn handshake(
            &self,
            _transport: BoxTransport,
            _conn: &ConnectionConfig,
        ) -> Result<Box<dyn SshConnection>, BridgeError> {
            Ok(Box::new(StubConnection {
                closes: self.closes.clone(),
            }))
        }
    }

    #[async_trait]
    impl SshConnection for StubConnection {
        async fn open_shell(
            &self,
            _cols: u32,
            _rows: u32,
        ) -> Result<Box<dyn crate::bridge::ShellChannel>, BridgeError> {
            Ok(Box::new(StubShell))
        }
        async fn open_sftp(&self) -> Result<Box<dyn SftpBackend>, BridgeError> {
            Err(BridgeError::Sftp("no subsystem".to_string()))
        }
        async fn exec(&self, _command: &str) -> Result<ExecOutput, BridgeError> {
            Ok(ExecOutput {
                stdout: String::new(),
                exit_code: 0,
            })
        }
        async fn close(&self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl crate::bridge::ShellChannel for StubShell {
        async fn write(&self, _data: &[u8]) -> Result<(), BridgeError> {
            Ok(())
        }
        async fn read(&self) -> Result<Option<Vec<u8>>, BridgeError> {
            Ok(None)
        }
        async fn resize(&self, _cols: u32, _rows: u32) -> Result<(), BridgeError> {
            Ok(())
        }
        async fn close(&self) {}
    }

    #[tokio::test]
    async fn connect_racing_a_teardown_closes_the_fresh_handles() {
        let closes = Arc::new(AtomicUsize::new(0));
        let config: Config = toml::from_str("").unwrap();
        let store = ConnectionStore::new(
            vec![ConnectionEntry {
                id: "web-1".to_string(),
                host: "203.0.113.10".to_string(),
                port: 22,
                username: "deploy".to_string(),
                password: Some("hunter2".to_string()),
                private_key: None,
                private_key_path: None,
                passphrase: None,
                proxy: None,
            }],
            vec![],
        );
        let state = AppState {
            config: Arc::new(config),
            store: Arc::new(store),
            registry: SessionRegistry::new(),
            driver: Arc::new(StubDriver {
                closes: closes.clone(),
            }),
        };

        // No registry entry for this session id: teardown won the race.
        let (tx, _rx) = mpsc::channel(64);
        let mut machine = StateMachine::new();
        let result = connect(&state, "s1", "web-1", 80, 24, &mut machine, &tx).await;

        assert!(result.is_err());
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert_eq!(state.registry.len().await, 0);
    }
}
