//! Proxy tunnel establishment.
//!
//! Produces a plain [`TcpStream`] to the backend host, optionally routed
//! through a SOCKS5 or HTTP CONNECT proxy. One connection-timeout value
//! covers direct dials, the proxy dial, and the in-proxy handshake alike.
//! A failed attempt is never retried here; the caller decides what to do.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::store::{ProxyConfig, ProxyKind};

#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("failed to resolve {0}: {1}")]
    Resolve(String, String),
    #[error("connection to {0} timed out")]
    Timeout(String),
    #[error("connection to {0} failed: {1}")]
    Connect(String, String),
    #[error("SOCKS5 handshake failed: {0}")]
    Socks(String),
    #[error("HTTP CONNECT failed: {0}")]
    HttpConnect(String),
    #[error("proxy authentication failed")]
    ProxyAuth,
}

/// Dial the backend directly, bypassing any proxy.
pub async fn connect_direct(
    host: &str,
    port: u16,
    connect_timeout: Duration,
) -> Result<TcpStream, TunnelError> {
    let target = format!("{host}:{port}");
    timeout(connect_timeout, TcpStream::connect(&target))
        .await
        .map_err(|_| TunnelError::Timeout(target.clone()))?
        .map_err(|e| TunnelError::Connect(target, e.to_string()))
}

/// Dial the backend through the given proxy.
pub async fn connect_via_proxy(
    proxy: &ProxyConfig,
    target_host: &str,
    target_port: u16,
    connect_timeout: Duration,
) -> Result<TcpStream, TunnelError> {
    let proxy_addr = resolve(&proxy.host, proxy.port, connect_timeout).await?;
    match proxy.kind {
        ProxyKind::Socks5 => {
            connect_socks5(proxy_addr, proxy, target_host, target_port, connect_timeout).await
        }
        ProxyKind::Http => {
            connect_http(proxy_addr, proxy, target_host, target_port, connect_timeout).await
        }
    }
}

// DNS lookups must not stall the runtime, so resolution is async and
// bounded by the same timeout as the dial it precedes.
async fn resolve(
    host: &str,
    port: u16,
    connect_timeout: Duration,
) -> Result<SocketAddr, TunnelError> {
    let addr = format!("{host}:{port}");
    if let Ok(literal) = addr.parse() {
        return Ok(literal);
    }
    let resolved = timeout(connect_timeout, tokio::net::lookup_host(&addr))
        .await
        .map_err(|_| TunnelError::Timeout(addr.clone()))?
        .map_err(|e| TunnelError::Resolve(addr.clone(), e.to_string()))?
        .next();
    resolved.ok_or_else(|| TunnelError::Resolve(addr, "no addresses".to_string()))
}

async fn connect_socks5(
    proxy_addr: SocketAddr,
    proxy: &ProxyConfig,
    target_host: &str,
    target_port: u16,
    connect_timeout: Duration,
) -> Result<TcpStream, TunnelError> {
    use tokio_socks::tcp::Socks5Stream;

    let target = (target_host, target_port);

    let stream = if let Some((username, password)) = &proxy.auth {
        timeout(
            connect_timeout,
            Socks5Stream::connect_with_password(proxy_addr, target, username, password),
        )
        .await
        .map_err(|_| TunnelError::Timeout(proxy_addr.to_string()))?
        .map_err(|e| {
            if matches!(
                e,
                tokio_socks::Error::AuthorizationRequired
                    | tokio_socks::Error::PasswordAuthFailure(_)
            ) {
                TunnelError::ProxyAuth
            } else {
                TunnelError::Socks(e.to_string())
            }
        })?
    } else {
        timeout(connect_timeout, Socks5Stream::connect(proxy_addr, target))
            .await
            .map_err(|_| TunnelError::Timeout(proxy_addr.to_string()))?
            .map_err(|e| TunnelError::Socks(e.to_string()))?
    };

    Ok(stream.into_inner())
}

async fn connect_http(
    proxy_addr: SocketAddr,
    proxy: &ProxyConfig,
    target_host: &str,
    target_port: u16,
    connect_timeout: Duration,
) -> Result<TcpStream, TunnelError> {
    use async_http_proxy::{http_connect_tokio, http_connect_tokio_with_basic_auth};

    let mut stream = timeout(connect_timeout, TcpStream::connect(proxy_addr))
        .await
        .map_err(|_| TunnelError::Timeout(proxy_addr.to_string()))?
        .map_err(|e| TunnelError::Connect(proxy_addr.to_string(), e.to_string()))?;

    if let Some((username, password)) = &proxy.auth {
        timeout(
            connect_timeout,
            http_connect_tokio_with_basic_auth(
                &mut stream,
                target_host,
                target_port,
                username,
                password,
            ),
        )
        .await
        .map_err(|_| TunnelError::Timeout(proxy_addr.to_string()))?
        .map_err(|e| {
            if e.to_string().contains("407") {
                TunnelError::ProxyAuth
            } else {
                TunnelError::HttpConnect(e.to_string())
            }
        })?;
    } else {
        timeout(
            connect_timeout,
            http_connect_tokio(&mut stream, target_host, target_port),
        )
        .await
        .map_err(|_| TunnelError::Timeout(proxy_addr.to_string()))?
        .map_err(|e| TunnelError::HttpConnect(e.to_string()))?;
    }

    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn resolve_accepts_literal_addresses() {
        let addr = resolve("127.0.0.1", 1080, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(addr.port(), 1080);
    }

    #[tokio::test]
    async fn resolve_looks_up_host_names() {
        let addr = resolve("localhost", 1080, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(addr.ip().is_loopback());
        assert_eq!(addr.port(), 1080);
    }

    #[tokio::test]
    async fn direct_dial_times_out() {
        // 192.0.2.0/24 is TEST-NET-1, guaranteed unroutable.
        let err = connect_direct("192.0.2.1", 22, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TunnelError::Timeout(_) | TunnelError::Connect(_, _)
        ));
    }
}
