//! Client message envelope: one JSON object per WebSocket text frame,
//! `{"type": string, "payload": object}`.
//!
//! Inbound frames are decoded into [`ClientRequest`]; unknown `type` values
//! become a single `error` reply, never a crash. Outbound events use the
//! closed set of type strings below. Binary shell and SFTP payloads are
//! base64-encoded inside the JSON envelope.
//!
//! ## Message types (client → server)
//!
//! | Type                 | Payload fields                       |
//! |----------------------|--------------------------------------|
//! | `connect`            | `id`, `cols?`, `rows?`               |
//! | `input`              | `data` (base64)                      |
//! | `resize`             | `cols`, `rows`                       |
//! | `sftp:readdir`       | `path`                               |
//! | `sftp:stat`          | `path`                               |
//! | `sftp:mkdir`         | `path`                               |
//! | `sftp:rmdir`         | `path`                               |
//! | `sftp:unlink`        | `path`                               |
//! | `sftp:rename`        | `oldPath`, `newPath`                 |
//! | `sftp:chmod`         | `path`, `mode`                       |
//! | `sftp:readfile`      | `path`                               |
//! | `sftp:writefile`     | `path`, `content` (base64)           |
//! | `sftp:upload:start`  | `transferId`, `path`                 |
//! | `sftp:upload:chunk`  | `transferId`, `data` (base64), `isLast` |
//! | `sftp:upload:cancel` | `transferId`                         |
//!
//! ## Message types (server → client)
//!
//! `status`, `connected`, `error`, `data` (shell output, base64),
//! `sftp:<op>:success`, `sftp:<op>:error` (payload echoes the original
//! path(s) for correlation), `sftp:upload:ready|pause|resume|success|error|cancelled`,
//! `status:update` (partial metrics object).

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;

/// A decoded inbound frame.
#[derive(Debug)]
pub enum ClientRequest {
    Connect {
        id: String,
        cols: u32,
        rows: u32,
    },
    Input {
        data: Vec<u8>,
    },
    Resize {
        cols: u32,
        rows: u32,
    },
    SftpReaddir {
        path: String,
    },
    SftpStat {
        path: String,
    },
    SftpMkdir {
        path: String,
    },
    SftpRmdir {
        path: String,
    },
    SftpUnlink {
        path: String,
    },
    SftpRename {
        old_path: String,
        new_path: String,
    },
    SftpChmod {
        path: String,
        mode: u32,
    },
    SftpReadFile {
        path: String,
    },
    SftpWriteFile {
        path: String,
        content: Vec<u8>,
    },
    UploadStart {
        transfer_id: String,
        path: String,
    },
    UploadChunk {
        transfer_id: String,
        data: Vec<u8>,
        is_last: bool,
    },
    UploadCancel {
        transfer_id: String,
    },
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("failed to parse JSON message")]
    InvalidJson,
    #[error("message has no type field")]
    MissingType,
    #[error("unsupported message type: {0}")]
    UnsupportedType(String),
    #[error("invalid payload for {0}: {1}")]
    BadPayload(String, String),
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConnectPayload {
    id: String,
    #[serde(default = "default_cols")]
    cols: u32,
    #[serde(default = "default_rows")]
    rows: u32,
}

fn default_cols() -> u32 {
    80
}
fn default_rows() -> u32 {
    24
}

#[derive(Deserialize)]
struct BytesPayload {
    data: String,
}

#[derive(Deserialize)]
struct ResizePayload {
    cols: u32,
    rows: u32,
}

#[derive(Deserialize)]
struct PathPayload {
    path: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RenamePayload {
    old_path: String,
    new_path: String,
}

#[derive(Deserialize)]
struct ChmodPayload {
    path: String,
    mode: u32,
}

#[derive(Deserialize)]
struct WriteFilePayload {
    path: String,
    content: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadStartPayload {
    transfer_id: String,
    path: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadChunkPayload {
    transfer_id: String,
    data: String,
    #[serde(default)]
    is_last: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadCancelPayload {
    transfer_id: String,
}

fn payload<T: serde::de::DeserializeOwned>(
    msg_type: &str,
    payload: Value,
) -> Result<T, ProtocolError> {
    serde_json::from_value(payload)
        .map_err(|e| ProtocolError::BadPayload(msg_type.to_string(), e.to_string()))
}

fn decode_bytes(msg_type: &str, b64: &str) -> Result<Vec<u8>, ProtocolError> {
    BASE64
        .decode(b64)
        .map_err(|e| ProtocolError::BadPayload(msg_type.to_string(), format!("bad base64: {e}")))
}

/// Parse one inbound text frame.
pub fn parse_frame(text: &str) -> Result<ClientRequest, ProtocolError> {
    let value: Value = serde_json::from_str(text).map_err(|_| ProtocolError::InvalidJson)?;
    let msg_type = value["type"]
        .as_str()
        .ok_or(ProtocolError::MissingType)?
        .to_string();
    let body = value.get("payload").cloned().unwrap_or_else(|| json!({}));

    let request = match msg_type.as_str() {
        "connect" => {
            let p: ConnectPayload = payload(&msg_type, body)?;
            ClientRequest::Connect {
                id: p.id,
                cols: p.cols,
                rows: p.rows,
            }
        }
        "input" => {
            let p: BytesPayload = payload(&msg_type, body)?;
            ClientRequest::Input {
                data: decode_bytes(&msg_type, &p.data)?,
            }
        }
        "resize" => {
            let p: ResizePayload = payload(&msg_type, body)?;
            ClientRequest::Resize {
                cols: p.cols,
                rows: p.rows,
            }
        }
        "sftp:readdir" => {
            let p: PathPayload = payload(&msg_type, body)?;
            ClientRequest::SftpReaddir { path: p.path }
        }
        "sftp:stat" => {
            let p: PathPayload = payload(&msg_type, body)?;
            ClientRequest::SftpStat { path: p.path }
        }
        "sftp:mkdir" => {
            let p: PathPayload = payload(&msg_type, body)?;
            ClientRequest::SftpMkdir { path: p.path }
        }
        "sftp:rmdir" => {
            let p: PathPayload = payload(&msg_type, body)?;
            ClientRequest::SftpRmdir { path: p.path }
        }
        "sftp:unlink" => {
            let p: PathPayload = payload(&msg_type, body)?;
            ClientRequest::SftpUnlink { path: p.path }
        }
        "sftp:rename" => {
            let p: RenamePayload = payload(&msg_type, body)?;
            ClientRequest::SftpRename {
                old_path: p.old_path,
                new_path: p.new_path,
            }
        }
        "sftp:chmod" => {
            let p: ChmodPayload = payload(&msg_type, body)?;
            ClientRequest::SftpChmod {
                path: p.path,
                mode: p.mode,
            }
        }
        "sftp:readfile" => {
            let p: PathPayload = payload(&msg_type, body)?;
            ClientRequest::SftpReadFile { path: p.path }
        }
        "sftp:writefile" => {
            let p: WriteFilePayload = payload(&msg_type, body)?;
            ClientRequest::SftpWriteFile {
                path: p.path,
                content: decode_bytes(&msg_type, &p.content)?,
            }
        }
        "sftp:upload:start" => {
            let p: UploadStartPayload = payload(&msg_type, body)?;
            ClientRequest::UploadStart {
                transfer_id: p.transfer_id,
                path: p.path,
            }
        }
        "sftp:upload:chunk" => {
            let p: UploadChunkPayload = payload(&msg_type, body)?;
            ClientRequest::UploadChunk {
                transfer_id: p.transfer_id,
                data: decode_bytes(&msg_type, &p.data)?,
                is_last: p.is_last,
            }
        }
        "sftp:upload:cancel" => {
            let p: UploadCancelPayload = payload(&msg_type, body)?;
            ClientRequest::UploadCancel {
                transfer_id: p.transfer_id,
            }
        }
        other => return Err(ProtocolError::UnsupportedType(other.to_string())),
    };

    Ok(request)
}

// ─── Outbound events ─────────────────────────────────────────────────────────

/// Wrap a payload in the `{type, payload}` envelope.
pub fn envelope(msg_type: &str, payload: Value) -> Value {
    json!({ "type": msg_type, "payload": payload })
}

/// Connect-phase progress message.
pub fn status(message: &str) -> Value {
    envelope("status", json!({ "message": message }))
}

/// The single per-session success event.
pub fn connected(connection_id: &str) -> Value {
    envelope("connected", json!({ "id": connection_id }))
}

/// An error reply or the single fatal error before teardown.
pub fn error(message: &str) -> Value {
    envelope("error", json!({ "message": message }))
}

/// Shell output bytes.
pub fn shell_data(data: &[u8]) -> Value {
    envelope("data", json!({ "data": BASE64.encode(data) }))
}

/// Success reply for an SFTP operation. `body` must echo the originating
/// path(s) so the client can correlate the reply.
pub fn sftp_success(op: &str, body: Value) -> Value {
    envelope(&format!("sftp:{op}:success"), body)
}

/// Error reply for an SFTP operation, echoing the originating path.
pub fn sftp_error(op: &str, path: &str, message: &str) -> Value {
    envelope(
        &format!("sftp:{op}:error"),
        json!({ "path": path, "message": message }),
    )
}

/// Upload flow event (`ready`, `pause`, `resume`, `success`, `cancelled`).
pub fn upload_event(event: &str, transfer_id: &str, extra: Option<Value>) -> Value {
    let mut body = json!({ "transferId": transfer_id });
    if let Some(Value::Object(map)) = extra {
        for (k, v) in map {
            body[k] = v;
        }
    }
    envelope(&format!("sftp:upload:{event}"), body)
}

/// Upload flow error, carrying the transfer id for correlation.
pub fn upload_error(transfer_id: &str, message: &str) -> Value {
    envelope(
        "sftp:upload:error",
        json!({ "transferId": transfer_id, "message": message }),
    )
}

/// Pushed metrics update; `metrics` holds any subset of
/// cpu/mem/swap/disk/net/os fields.
pub fn status_update(metrics: Value) -> Value {
    envelope("status:update", metrics)
}

/// Encode binary content for an outbound payload.
pub fn encode_bytes(data: &[u8]) -> String {
    BASE64.encode(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_connect_with_defaults() {
        let req = parse_frame(r#"{"type":"connect","payload":{"id":"web-1"}}"#).unwrap();
        match req {
            ClientRequest::Connect { id, cols, rows } => {
                assert_eq!(id, "web-1");
                assert_eq!((cols, rows), (80, 24));
            }
            other => panic!("unexpected request: {other:?}"),
        }
    }

    #[test]
    fn parses_upload_chunk() {
        let frame = r#"{"type":"sftp:upload:chunk","payload":{"transferId":"t1","data":"aGVsbG8=","isLast":true}}"#;
        match parse_frame(frame).unwrap() {
            ClientRequest::UploadChunk {
                transfer_id,
                data,
                is_last,
            } => {
                assert_eq!(transfer_id, "t1");
                assert_eq!(data, b"hello");
                assert!(is_last);
            }
            other => panic!("unexpected request: {other:?}"),
        }
    }

    #[test]
    fn parses_rename_paths() {
        let frame = r#"{"type":"sftp:rename","payload":{"oldPath":"/a","newPath":"/b"}}"#;
        match parse_frame(frame).unwrap() {
            ClientRequest::SftpRename { old_path, new_path } => {
                assert_eq!(old_path, "/a");
                assert_eq!(new_path, "/b");
            }
            other => panic!("unexpected request: {other:?}"),
        }
    }

    #[test]
    fn unknown_type_is_reported_not_fatal() {
        let err = parse_frame(r#"{"type":"sftp:teleport","payload":{}}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::UnsupportedType(t) if t == "sftp:teleport"));
    }

    #[test]
    fn garbage_and_missing_type_are_distinct_errors() {
        assert!(matches!(
            parse_frame("not json"),
            Err(ProtocolError::InvalidJson)
        ));
        assert!(matches!(
            parse_frame(r#"{"payload":{}}"#),
            Err(ProtocolError::MissingType)
        ));
    }

    #[test]
    fn bad_base64_is_a_payload_error() {
        let err = parse_frame(r#"{"type":"input","payload":{"data":"%%%"}}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::BadPayload(t, _) if t == "input"));
    }

    #[test]
    fn outbound_events_use_the_envelope() {
        let ev = upload_event("pause", "t1", None);
        assert_eq!(ev["type"], "sftp:upload:pause");
        assert_eq!(ev["payload"]["transferId"], "t1");

        let err = sftp_error("readdir", "/home/user", "permission denied");
        assert_eq!(err["type"], "sftp:readdir:error");
        assert_eq!(err["payload"]["path"], "/home/user");
    }
}
