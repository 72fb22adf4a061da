//! Session-level error taxonomy.
//!
//! Every failure on the SSH side of a session maps into one of these
//! variants, which decides how the session reacts: everything except
//! [`BridgeError::Sftp`] during bring-up is fatal to the session.

use thiserror::Error;

use crate::tunnel::TunnelError;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("tunnel failed: {0}")]
    Tunnel(#[from] TunnelError),

    #[error("SSH handshake failed: {0}")]
    Handshake(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("key error: {0}")]
    Key(String),

    #[error("channel error: {0}")]
    Channel(String),

    #[error("SFTP unavailable: {0}")]
    Sftp(String),

    #[error("session is not connected")]
    Disconnected,

    #[error("operation timed out after {0}s")]
    Timeout(u64),
}

impl From<russh::Error> for BridgeError {
    fn from(e: russh::Error) -> Self {
        BridgeError::Channel(e.to_string())
    }
}

impl From<russh::keys::Error> for BridgeError {
    fn from(e: russh::keys::Error) -> Self {
        BridgeError::Key(e.to_string())
    }
}
