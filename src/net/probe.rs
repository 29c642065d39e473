//! One-shot peer probe: handshake, field capture, address harvest

use super::message::{
    recv_message, send_message, Message, ProtocolError, VersionMessage, MAX_ADDR_PER_MSG,
};
use super::proxy::{DialError, ProxyTable};
use crate::db::{ProbeResult, ProbeTicket};
use crate::net::addr::Family;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Harvest window for `addr` replies after `getaddr`.
const HARVEST_WINDOW: Duration = Duration::from_secs(10);

/// Skip `getaddr` when the peer answered within the last day.
const GETADDR_INTERVAL: u64 = 86_400;

/// Ban applied for protocol violations.
const BAD_PEER_BAN: u64 = 86_400;

/// Onion endpoints without a Tor route are not retried for a week.
const NO_ROUTE_BAN: u64 = 7 * 86_400;

/// Messages tolerated before the expected handshake message arrives.
const MAX_PREFACE_MESSAGES: usize = 100;

/// Probe a single peer: dial, exchange version/verack, optionally harvest
/// addresses. Never returns an error; every failure mode is folded into the
/// result the database consumes.
pub async fn probe_peer(
    proxies: &ProxyTable,
    magic: [u8; 4],
    user_agent: &str,
    ticket: &ProbeTicket,
) -> ProbeResult {
    let mut result = ProbeResult::failure(ticket.endpoint);

    let mut stream = match proxies.dial(&ticket.endpoint).await {
        Ok(stream) => stream,
        Err(e @ (DialError::NoRoute | DialError::ProxyHandshake(_)))
            if ticket.endpoint.family() == Family::Onion =>
        {
            // Proxy failures are fatal per onion address: without a working
            // Tor route there is no point retrying soon.
            trace!("dial {} failed: {}", ticket.endpoint, e);
            result.ban_secs = NO_ROUTE_BAN;
            return result;
        }
        Err(e) => {
            trace!("dial {} failed: {}", ticket.endpoint, e);
            return result;
        }
    };

    match run_handshake(&mut stream, magic, user_agent, ticket, &mut result).await {
        Ok(()) => result,
        Err(e) => {
            if e.is_bad_peer() {
                debug!("protocol violation from {}: {}", ticket.endpoint, e);
                result.success = false;
                result.ban_secs = BAD_PEER_BAN;
            } else {
                trace!("probe {} failed: {}", ticket.endpoint, e);
            }
            result
        }
    }
}

async fn run_handshake(
    stream: &mut TcpStream,
    magic: [u8; 4],
    user_agent: &str,
    ticket: &ProbeTicket,
    result: &mut ProbeResult,
) -> Result<(), ProtocolError> {
    let nonce: u64 = rand::random();
    let version = Message::Version(VersionMessage::outgoing(nonce, user_agent));
    send_message(stream, magic, &version, Some(&ticket.endpoint)).await?;

    // Peer's version first
    let mut seen = 0;
    let peer_version = loop {
        match recv_message(stream, magic).await? {
            Message::Version(v) => break v,
            Message::Ping(n) => send_message(stream, magic, &Message::Pong(n), None).await?,
            other => trace!("pre-version {} from {}", other.command(), ticket.endpoint),
        }
        seen += 1;
        if seen > MAX_PREFACE_MESSAGES {
            return Err(ProtocolError::Malformed("version"));
        }
    };

    result.services = peer_version.services;
    result.client_version = peer_version.version;
    result.user_agent = peer_version.user_agent;
    result.starting_height = peer_version.start_height;

    send_message(stream, magic, &Message::Verack, None).await?;

    let mut seen = 0;
    loop {
        match recv_message(stream, magic).await? {
            Message::Verack => break,
            Message::Ping(n) => send_message(stream, magic, &Message::Pong(n), None).await?,
            other => trace!("pre-verack {} from {}", other.command(), ticket.endpoint),
        }
        seen += 1;
        if seen > MAX_PREFACE_MESSAGES {
            return Err(ProtocolError::Malformed("verack"));
        }
    }

    // Handshake complete; the peer is reachable.
    result.success = true;

    if crate::types::now().saturating_sub(ticket.last_success) > GETADDR_INTERVAL {
        send_message(stream, magic, &Message::GetAddr, None).await?;
        harvest_addrs(stream, magic, result).await?;
    }

    Ok(())
}

/// Collect `addr` replies for up to [`HARVEST_WINDOW`], bounded to 1000
/// entries total. Transient errors end the harvest without failing the probe;
/// violations propagate.
async fn harvest_addrs(
    stream: &mut TcpStream,
    magic: [u8; 4],
    result: &mut ProbeResult,
) -> Result<(), ProtocolError> {
    let deadline = Instant::now() + HARVEST_WINDOW;
    while Instant::now() < deadline && result.neighbors.len() < MAX_ADDR_PER_MSG {
        let msg = match tokio::time::timeout_at(deadline, recv_message(stream, magic)).await {
            Ok(Ok(msg)) => msg,
            Ok(Err(e)) if e.is_bad_peer() => return Err(e),
            Ok(Err(_)) | Err(_) => break,
        };
        match msg {
            Message::Addr(entries) => {
                let room = MAX_ADDR_PER_MSG - result.neighbors.len();
                result.neighbors.extend(entries.into_iter().take(room));
            }
            Message::Ping(n) => send_message(stream, magic, &Message::Pong(n), None).await?,
            other => trace!("ignoring {} during harvest", other.command()),
        }
    }
    Ok(())
}
