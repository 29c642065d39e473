//! Proxy-aware dialing with connect and idle timeouts

use super::addr::{Endpoint, Family, NetAddr};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

/// TCP connect timeout, including the SOCKS5 exchange.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Per-read/write timeout once a stream is established.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Debug, Error)]
pub enum DialError {
    #[error("connect timed out")]
    Timeout,
    #[error("connection refused: {0}")]
    Refused(std::io::Error),
    #[error("no route for address family")]
    NoRoute,
    #[error("proxy handshake failed: {0}")]
    ProxyHandshake(String),
}

/// How to reach one address family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Route {
    #[default]
    Direct,
    Socks5(SocketAddr),
}

/// Per-family routing policy. Built once at startup, read by every crawler.
///
/// Onion endpoints are only reachable through a Tor SOCKS5 route; without one
/// they fail with [`DialError::NoRoute`].
#[derive(Debug, Clone, Default)]
pub struct ProxyTable {
    pub ipv4: Route,
    pub ipv6: Route,
    pub onion: Option<SocketAddr>,
}

impl ProxyTable {
    fn route(&self, family: Family) -> Result<Route, DialError> {
        match family {
            Family::Ipv4 => Ok(self.ipv4),
            Family::Ipv6 => Ok(self.ipv6),
            Family::Onion => self.onion.map(Route::Socks5).ok_or(DialError::NoRoute),
        }
    }

    /// Establish a TCP stream to `endpoint` within [`CONNECT_TIMEOUT`].
    pub async fn dial(&self, endpoint: &Endpoint) -> Result<TcpStream, DialError> {
        let route = self.route(endpoint.family())?;
        match timeout(CONNECT_TIMEOUT, self.dial_inner(endpoint, route)).await {
            Ok(result) => result,
            Err(_) => Err(DialError::Timeout),
        }
    }

    async fn dial_inner(&self, endpoint: &Endpoint, route: Route) -> Result<TcpStream, DialError> {
        match route {
            Route::Direct => {
                let sock = endpoint.to_socket_addr().ok_or(DialError::NoRoute)?;
                TcpStream::connect(sock).await.map_err(DialError::Refused)
            }
            Route::Socks5(proxy) => {
                debug!("dialing {} via socks5 {}", endpoint, proxy);
                let stream = TcpStream::connect(proxy).await.map_err(DialError::Refused)?;
                socks5_connect(stream, endpoint).await
            }
        }
    }
}

/// SOCKS5 CONNECT (RFC 1928), no authentication. Onion endpoints are passed
/// as DOMAIN so the Tor proxy resolves the hidden service itself.
async fn socks5_connect(mut stream: TcpStream, endpoint: &Endpoint) -> Result<TcpStream, DialError> {
    let proxy_err = |msg: &str| DialError::ProxyHandshake(msg.to_string());

    // Greeting: version 5, one method, NO AUTH
    stream
        .write_all(&[0x05, 0x01, 0x00])
        .await
        .map_err(|e| DialError::ProxyHandshake(e.to_string()))?;
    let mut reply = [0u8; 2];
    stream
        .read_exact(&mut reply)
        .await
        .map_err(|e| DialError::ProxyHandshake(e.to_string()))?;
    if reply != [0x05, 0x00] {
        return Err(proxy_err("method negotiation rejected"));
    }

    // CONNECT request
    let mut request = vec![0x05, 0x01, 0x00];
    match endpoint.addr {
        NetAddr::V4(v4) => {
            request.push(0x01);
            request.extend_from_slice(&v4.octets());
        }
        NetAddr::V6(v6) => {
            request.push(0x04);
            request.extend_from_slice(&v6.octets());
        }
        NetAddr::OnionV2(_) | NetAddr::OnionV3(_) => {
            let name = endpoint.addr.to_string();
            if name.len() > 255 {
                return Err(proxy_err("domain name too long"));
            }
            request.push(0x03);
            request.push(name.len() as u8);
            request.extend_from_slice(name.as_bytes());
        }
    }
    request.extend_from_slice(&endpoint.port.to_be_bytes());
    stream
        .write_all(&request)
        .await
        .map_err(|e| DialError::ProxyHandshake(e.to_string()))?;

    // Reply: VER REP RSV ATYP BND.ADDR BND.PORT
    let mut head = [0u8; 4];
    stream
        .read_exact(&mut head)
        .await
        .map_err(|e| DialError::ProxyHandshake(e.to_string()))?;
    if head[0] != 0x05 {
        return Err(proxy_err("bad reply version"));
    }
    if head[1] != 0x00 {
        return Err(DialError::ProxyHandshake(format!("connect rejected (rep={})", head[1])));
    }
    let bound_len = match head[3] {
        0x01 => 4,
        0x04 => 16,
        0x03 => {
            let mut len = [0u8; 1];
            stream
                .read_exact(&mut len)
                .await
                .map_err(|e| DialError::ProxyHandshake(e.to_string()))?;
            len[0] as usize
        }
        _ => return Err(proxy_err("bad bound address type")),
    };
    let mut rest = vec![0u8; bound_len + 2];
    stream
        .read_exact(&mut rest)
        .await
        .map_err(|e| DialError::ProxyHandshake(e.to_string()))?;

    Ok(stream)
}

/// Read wrapped in the idle timeout; a stalled peer becomes an error.
pub async fn read_exact_timed(stream: &mut TcpStream, buf: &mut [u8]) -> std::io::Result<()> {
    match timeout(IDLE_TIMEOUT, stream.read_exact(buf)).await {
        Ok(result) => result.map(|_| ()),
        Err(_) => Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "read timed out")),
    }
}

/// Write wrapped in the idle timeout.
pub async fn write_all_timed(stream: &mut TcpStream, buf: &[u8]) -> std::io::Result<()> {
    match timeout(IDLE_TIMEOUT, stream.write_all(buf)).await {
        Ok(result) => result,
        Err(_) => Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "write timed out")),
    }
}
