//! SFTP operations over an established session.
//!
//! The WebSocket layer talks to the [`SftpBackend`] trait; the live
//! implementation wraps a `russh_sftp` session opened on its own channel.
//! Single-shot operations (readdir, stat, plain reads and writes, the
//! metadata calls) resolve to one success or one error reply each. Chunked
//! uploads live in [`upload`].

pub mod upload;

use async_trait::async_trait;
use russh_sftp::client::SftpSession;
use russh_sftp::protocol::{FileAttributes, OpenFlags, StatusCode};
use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub use upload::{UploadCommand, UploadHandle, UploadTable};

#[derive(Debug, Error)]
pub enum SftpError {
    #[error("no such file: {0}")]
    NotFound(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("file too large: {size} bytes exceeds the {limit} byte limit")]
    TooLarge { size: u64, limit: u64 },
    #[error("operation timed out")]
    Timeout,
    #[error("SFTP is not available on this session")]
    Unavailable,
    #[error("{0}")]
    Other(String),
}

/// One entry of a directory listing.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DirEntry {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: FileKind,
    pub size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mtime: Option<u64>,
    pub permissions: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gid: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    File,
    Directory,
    Symlink,
}

/// Attributes of a single path. Symlinks are reported as themselves,
/// not their targets.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileStat {
    #[serde(rename = "type")]
    pub kind: FileKind,
    pub size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mtime: Option<u64>,
    pub permissions: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gid: Option<u32>,
}

/// The seam between the WebSocket dispatch and the SFTP stack.
#[async_trait]
pub trait SftpBackend: Send + Sync {
    async fn readdir(&self, path: &str) -> Result<Vec<DirEntry>, SftpError>;

    async fn stat(&self, path: &str) -> Result<FileStat, SftpError>;

    /// Whole-file read, rejected before transfer when the file exceeds
    /// `limit` bytes.
    async fn read_file(&self, path: &str, limit: u64) -> Result<Vec<u8>, SftpError>;

    /// Whole-file write, replacing any existing content.
    async fn write_file(&self, path: &str, content: &[u8]) -> Result<(), SftpError>;

    async fn mkdir(&self, path: &str) -> Result<(), SftpError>;

    async fn rmdir(&self, path: &str) -> Result<(), SftpError>;

    async fn unlink(&self, path: &str) -> Result<(), SftpError>;

    async fn rename(&self, old_path: &str, new_path: &str) -> Result<(), SftpError>;

    async fn chmod(&self, path: &str, mode: u32) -> Result<(), SftpError>;

    /// Open a remote file for streaming writes. Used by chunked uploads.
    async fn open_write(&self, path: &str)
        -> Result<Box<dyn AsyncWrite + Send + Unpin>, SftpError>;
}

fn map_err(path: &str, e: russh_sftp::client::error::Error) -> SftpError {
    use russh_sftp::client::error::Error;
    match e {
        Error::Status(status) => match status.status_code {
            StatusCode::NoSuchFile => SftpError::NotFound(path.to_string()),
            StatusCode::PermissionDenied => SftpError::PermissionDenied(path.to_string()),
            _ => SftpError::Other(status.error_message),
        },
        other => SftpError::Other(other.to_string()),
    }
}

fn kind_of(attrs: &FileAttributes) -> FileKind {
    if attrs.is_dir() {
        FileKind::Directory
    } else if attrs.is_symlink() {
        FileKind::Symlink
    } else {
        FileKind::File
    }
}

/// Live backend over a `sftp` subsystem channel.
pub struct RusshSftpBackend {
    sftp: SftpSession,
}

impl RusshSftpBackend {
    pub fn new(sftp: SftpSession) -> Self {
        Self { sftp }
    }
}

#[async_trait]
impl SftpBackend for RusshSftpBackend {
    async fn readdir(&self, path: &str) -> Result<Vec<DirEntry>, SftpError> {
        let dir = self
            .sftp
            .read_dir(path)
            .await
            .map_err(|e| map_err(path, e))?;

        let mut entries = Vec::new();
        for entry in dir {
            let name = entry.file_name();
            if name == "." || name == ".." {
                continue;
            }
            let attrs = entry.metadata();
            entries.push(DirEntry {
                name,
                kind: kind_of(&attrs),
                size: attrs.size.unwrap_or(0),
                mtime: attrs.mtime.map(u64::from),
                permissions: attrs.permissions.unwrap_or(0),
                uid: attrs.uid,
                gid: attrs.gid,
            });
        }
        Ok(entries)
    }

    async fn stat(&self, path: &str) -> Result<FileStat, SftpError> {
        let attrs = self
            .sftp
            .symlink_metadata(path)
            .await
            .map_err(|e| map_err(path, e))?;
        Ok(FileStat {
            kind: kind_of(&attrs),
            size: attrs.size.unwrap_or(0),
            mtime: attrs.mtime.map(u64::from),
            permissions: attrs.permissions.unwrap_or(0),
            uid: attrs.uid,
            gid: attrs.gid,
        })
    }

    async fn read_file(&self, path: &str, limit: u64) -> Result<Vec<u8>, SftpError> {
        let attrs = self
            .sftp
            .metadata(path)
            .await
            .map_err(|e| map_err(path, e))?;
        if let Some(size) = attrs.size {
            if size > limit {
                return Err(SftpError::TooLarge { size, limit });
            }
        }

        let mut file = self
            .sftp
            .open_with_flags(path, OpenFlags::READ)
            .await
            .map_err(|e| map_err(path, e))?;

        // The reported size can be stale, so the cap is enforced on the
        // stream as well.
        let mut content = Vec::new();
        let read = (&mut file)
            .take(limit + 1)
            .read_to_end(&mut content)
            .await
            .map_err(|e| SftpError::Other(e.to_string()))?;
        if read as u64 > limit {
            return Err(SftpError::TooLarge {
                size: read as u64,
                limit,
            });
        }
        Ok(content)
    }

    async fn write_file(&self, path: &str, content: &[u8]) -> Result<(), SftpError> {
        let mut file = self
            .sftp
            .open_with_flags(path, OpenFlags::CREATE | OpenFlags::TRUNCATE | OpenFlags::WRITE)
            .await
            .map_err(|e| map_err(path, e))?;
        file.write_all(content)
            .await
            .map_err(|e| SftpError::Other(e.to_string()))?;
        file.shutdown()
            .await
            .map_err(|e| SftpError::Other(e.to_string()))?;
        Ok(())
    }

    async fn mkdir(&self, path: &str) -> Result<(), SftpError> {
        self.sftp
            .create_dir(path)
            .await
            .map_err(|e| map_err(path, e))
    }

    async fn rmdir(&self, path: &str) -> Result<(), SftpError> {
        self.sftp
            .remove_dir(path)
            .await
            .map_err(|e| map_err(path, e))
    }

    async fn unlink(&self, path: &str) -> Result<(), SftpError> {
        self.sftp
            .remove_file(path)
            .await
            .map_err(|e| map_err(path, e))
    }

    async fn rename(&self, old_path: &str, new_path: &str) -> Result<(), SftpError> {
        self.sftp
            .rename(old_path, new_path)
            .await
            .map_err(|e| map_err(old_path, e))
    }

    async fn chmod(&self, path: &str, mode: u32) -> Result<(), SftpError> {
        let attrs = FileAttributes {
            permissions: Some(mode),
            ..Default::default()
        };
        self.sftp
            .set_metadata(path, attrs)
            .await
            .map_err(|e| map_err(path, e))
    }

    async fn open_write(
        &self,
        path: &str,
    ) -> Result<Box<dyn AsyncWrite + Send + Unpin>, SftpError> {
        let file = self
            .sftp
            .open_with_flags(path, OpenFlags::CREATE | OpenFlags::TRUNCATE | OpenFlags::WRITE)
            .await
            .map_err(|e| map_err(path, e))?;
        Ok(Box::new(file))
    }
}
