//! Chunked uploads with explicit backpressure.
//!
//! Each transfer gets its own writer task that owns the remote file handle
//! and drains a bounded chunk queue. The WebSocket dispatch pushes chunks
//! into that queue; when the queue is full it emits `sftp:upload:pause`,
//! waits for room, then emits `sftp:upload:resume`. A transfer is therefore
//! either flowing or paused, and the two notifications strictly alternate.
//!
//! Ordering and completeness follow from the structure: one queue, one
//! writer, chunks written in arrival order, `sftp:upload:success` only
//! after the final chunk has been flushed to the remote file.

use std::collections::HashMap;

use serde_json::json;
use serde_json::Value;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::protocol;

/// One queued chunk.
#[derive(Debug)]
pub struct UploadCommand {
    pub data: Vec<u8>,
    pub is_last: bool,
}

/// Dispatch-side handle to a running transfer.
pub struct UploadHandle {
    tx: mpsc::Sender<UploadCommand>,
    cancel: CancellationToken,
    paused: bool,
    /// The final chunk has been queued; no further chunks are accepted.
    /// The id stays reserved until the writer task exits.
    finished: bool,
}

/// Active transfers of one session, keyed by client-chosen transfer id.
///
/// Owned by the session's dispatch loop; dropping the table drops every
/// chunk sender, which stops the writer tasks.
pub struct UploadTable {
    transfers: HashMap<String, UploadHandle>,
    queue_depth: usize,
}

impl UploadTable {
    pub fn new(queue_depth: usize) -> Self {
        Self {
            transfers: HashMap::new(),
            queue_depth: queue_depth.max(1),
        }
    }

    /// Begin a transfer: spawn its writer task over an already-opened sink.
    ///
    /// Replies `sftp:upload:ready` on success. A transfer id that is already
    /// active is rejected without touching the running transfer; an id whose
    /// writer task has already exited is free for reuse.
    pub async fn start(
        &mut self,
        transfer_id: &str,
        path: &str,
        sink: Box<dyn AsyncWrite + Send + Unpin>,
        events: &mpsc::Sender<Value>,
    ) {
        // A closed chunk queue means the writer exited; its terminal event
        // is already out, so the slot can be reclaimed.
        self.transfers.retain(|_, handle| !handle.tx.is_closed());

        if self.transfers.contains_key(transfer_id) {
            emit(
                events,
                protocol::upload_error(transfer_id, "transfer id is already in use"),
            )
            .await;
            return;
        }

        let (tx, rx) = mpsc::channel(self.queue_depth);
        let cancel = CancellationToken::new();
        tokio::spawn(writer_task(
            transfer_id.to_string(),
            path.to_string(),
            sink,
            rx,
            cancel.clone(),
            events.clone(),
        ));

        self.transfers.insert(
            transfer_id.to_string(),
            UploadHandle {
                tx,
                cancel,
                paused: false,
                finished: false,
            },
        );
        emit(
            events,
            protocol::upload_event("ready", transfer_id, Some(json!({ "path": path }))),
        )
        .await;
    }

    /// Queue one chunk, pausing the sender while the queue is full.
    pub async fn push_chunk(
        &mut self,
        transfer_id: &str,
        data: Vec<u8>,
        is_last: bool,
        events: &mpsc::Sender<Value>,
    ) {
        let Some(handle) = self.transfers.get_mut(transfer_id) else {
            emit(
                events,
                protocol::upload_error(transfer_id, "unknown transfer id"),
            )
            .await;
            return;
        };
        if handle.finished {
            emit(
                events,
                protocol::upload_error(transfer_id, "transfer already completed"),
            )
            .await;
            return;
        }

        let command = UploadCommand { data, is_last };
        match handle.tx.try_send(command) {
            Ok(()) => {
                handle.finished = is_last;
            }
            Err(TrySendError::Full(command)) => {
                handle.paused = true;
                emit(events, protocol::upload_event("pause", transfer_id, None)).await;
                let delivered = handle.tx.send(command).await.is_ok();
                handle.paused = false;
                if !delivered {
                    // Writer died while we were blocked; it already reported.
                    self.transfers.remove(transfer_id);
                    return;
                }
                handle.finished = is_last;
                emit(events, protocol::upload_event("resume", transfer_id, None)).await;
            }
            Err(TrySendError::Closed(_)) => {
                // Writer already failed and reported its own error.
                self.transfers.remove(transfer_id);
            }
        }
    }

    /// Abort a transfer. Cancelling an id that is not active, or whose
    /// writer already finished, just acknowledges with `cancelled`.
    pub async fn cancel(&mut self, transfer_id: &str, events: &mpsc::Sender<Value>) {
        match self.transfers.remove(transfer_id) {
            Some(handle) if !handle.tx.is_closed() => handle.cancel.cancel(),
            _ => {
                emit(
                    events,
                    protocol::upload_event("cancelled", transfer_id, None),
                )
                .await;
            }
        }
    }

    pub fn is_paused(&self, transfer_id: &str) -> bool {
        self.transfers
            .get(transfer_id)
            .is_some_and(|h| h.paused)
    }
}

// Flow notifications must not be lost: a dropped `resume` (or terminal
// event) stalls the client forever, so emission waits for channel room
// instead of dropping on a congested socket. The channel only closes when
// the socket is gone, at which point there is nobody left to notify.
async fn emit(events: &mpsc::Sender<Value>, event: Value) {
    if let Err(e) = events.send(event).await {
        debug!("dropping upload event: {e}");
    }
}

async fn writer_task(
    transfer_id: String,
    path: String,
    mut sink: Box<dyn AsyncWrite + Send + Unpin>,
    mut rx: mpsc::Receiver<UploadCommand>,
    cancel: CancellationToken,
    events: mpsc::Sender<Value>,
) {
    let mut bytes_written: u64 = 0;

    loop {
        let command = tokio::select! {
            () = cancel.cancelled() => {
                let _ = sink.shutdown().await;
                emit(&events, protocol::upload_event("cancelled", &transfer_id, None)).await;
                return;
            }
            command = rx.recv() => match command {
                Some(command) => command,
                // Session went away; nothing left to report to.
                None => {
                    let _ = sink.shutdown().await;
                    return;
                }
            },
        };

        if let Err(e) = sink.write_all(&command.data).await {
            emit(
                &events,
                protocol::upload_error(&transfer_id, &format!("write failed: {e}")),
            )
            .await;
            return;
        }
        bytes_written += command.data.len() as u64;

        if command.is_last {
            if let Err(e) = sink.shutdown().await {
                emit(
                    &events,
                    protocol::upload_error(&transfer_id, &format!("close failed: {e}")),
                )
                .await;
                return;
            }
            debug!(transfer_id, path, bytes_written, "upload complete");
            emit(
                &events,
                protocol::upload_event(
                    "success",
                    &transfer_id,
                    Some(json!({ "path": path, "bytesWritten": bytes_written })),
                ),
            )
            .await;
            return;
        }
    }
}
