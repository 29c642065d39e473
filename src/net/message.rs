//! Peer protocol messages and the binary framing codec

use super::addr::{Endpoint, NetAddr};
use byteorder::{BigEndian, LittleEndian, ReadBytesExt, WriteBytesExt};
use sha2::{Digest, Sha256};
use std::io::{Cursor, Read};
use thiserror::Error;
use tokio::net::TcpStream;

// =============================================================================
// PROTOCOL IDENTIFICATION
// =============================================================================

/// Protocol version we speak in our `version` message.
pub const PROTOCOL_VERSION: i32 = 70001;

/// Magic bytes for mainnet framing.
pub const MAINNET_MAGIC: [u8; 4] = [0xf9, 0xbe, 0xb4, 0xd9];

/// Magic bytes for testnet framing.
pub const TESTNET_MAGIC: [u8; 4] = [0x0b, 0x11, 0x09, 0x07];

/// Outer limit on any payload. Individual commands are far smaller; anything
/// above this is a protocol violation, not a large message.
pub const MAX_PAYLOAD_SIZE: u32 = 2 * 1024 * 1024;

/// Maximum entries in one `addr` message.
pub const MAX_ADDR_PER_MSG: usize = 1_000;

/// User agent string cap; longer strings are a violation.
pub const MAX_USER_AGENT_LEN: usize = 256;

/// Frame header: magic + command + length + checksum.
pub const HEADER_SIZE: usize = 4 + 12 + 4 + 4;

// =============================================================================
// SERVICE FLAGS
// =============================================================================

/// Full chain history.
pub const NODE_NETWORK: u64 = 1;
/// Bloom-filtered connections.
pub const NODE_BLOOM: u64 = 1 << 2;
/// Segregated witness data.
pub const NODE_WITNESS: u64 = 1 << 3;
/// Compact block filters.
pub const NODE_COMPACT_FILTERS: u64 = 1 << 6;
/// Limited (pruned) history, last ~288 blocks.
pub const NODE_NETWORK_LIMITED: u64 = 1 << 10;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("bad magic bytes")]
    BadMagic,
    #[error("bad command encoding")]
    BadCommand,
    #[error("payload length {0} exceeds limit")]
    Oversized(u32),
    #[error("checksum mismatch")]
    BadChecksum,
    #[error("malformed {0} payload")]
    Malformed(&'static str),
    #[error("addr message with {0} entries")]
    TooManyAddrs(usize),
}

impl ProtocolError {
    /// Violations that feed the ban policy, as opposed to transient I/O.
    pub fn is_bad_peer(&self) -> bool {
        !matches!(self, ProtocolError::Io(_))
    }
}

/// One `addr` entry: last-seen time, advertised services, endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WireAddr {
    pub time: u32,
    pub services: u64,
    pub endpoint: Endpoint,
}

/// The peer's self-description from its `version` message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionMessage {
    pub version: i32,
    pub services: u64,
    pub timestamp: i64,
    pub nonce: u64,
    pub user_agent: String,
    pub start_height: i32,
}

impl VersionMessage {
    /// Our side of the handshake: services 0, height 0, random nonce.
    pub fn outgoing(nonce: u64, user_agent: &str) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            services: 0,
            timestamp: crate::types::now() as i64,
            nonce,
            user_agent: user_agent.to_string(),
            start_height: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Version(VersionMessage),
    Verack,
    GetAddr,
    Addr(Vec<WireAddr>),
    Ping(u64),
    Pong(u64),
    /// Well-framed message with a command we do not handle; payload discarded.
    Unknown(String),
}

impl Message {
    pub fn command(&self) -> &'static str {
        match self {
            Message::Version(_) => "version",
            Message::Verack => "verack",
            Message::GetAddr => "getaddr",
            Message::Addr(_) => "addr",
            Message::Ping(_) => "ping",
            Message::Pong(_) => "pong",
            Message::Unknown(_) => "unknown",
        }
    }
}

fn checksum(payload: &[u8]) -> [u8; 4] {
    let first = Sha256::digest(payload);
    let second = Sha256::digest(first);
    let mut out = [0u8; 4];
    out.copy_from_slice(&second[..4]);
    out
}

// =============================================================================
// ENCODING
// =============================================================================

fn write_var_int(out: &mut Vec<u8>, value: u64) {
    match value {
        0..=0xfc => out.push(value as u8),
        0xfd..=0xffff => {
            out.push(0xfd);
            out.write_u16::<LittleEndian>(value as u16).expect("vec write");
        }
        0x10000..=0xffff_ffff => {
            out.push(0xfe);
            out.write_u32::<LittleEndian>(value as u32).expect("vec write");
        }
        _ => {
            out.push(0xff);
            out.write_u64::<LittleEndian>(value).expect("vec write");
        }
    }
}

fn write_var_str(out: &mut Vec<u8>, s: &str) {
    write_var_int(out, s.len() as u64);
    out.extend_from_slice(s.as_bytes());
}

/// Version-message address: services + 16-byte ip + port, no timestamp.
fn write_short_addr(out: &mut Vec<u8>, services: u64, addr: Option<&Endpoint>) {
    out.write_u64::<LittleEndian>(services).expect("vec write");
    match addr.and_then(|ep| ep.addr.wire_bytes().map(|b| (b, ep.port))) {
        Some((bytes, port)) => {
            out.extend_from_slice(&bytes);
            out.write_u16::<BigEndian>(port).expect("vec write");
        }
        None => {
            out.extend_from_slice(&[0u8; 16]);
            out.write_u16::<BigEndian>(0).expect("vec write");
        }
    }
}

fn encode_payload(msg: &Message, remote: Option<&Endpoint>) -> Vec<u8> {
    let mut out = Vec::new();
    match msg {
        Message::Version(v) => {
            out.write_i32::<LittleEndian>(v.version).expect("vec write");
            out.write_u64::<LittleEndian>(v.services).expect("vec write");
            out.write_i64::<LittleEndian>(v.timestamp).expect("vec write");
            // addr_recv is how we see the peer; addr_from stays null
            write_short_addr(&mut out, v.services, remote);
            write_short_addr(&mut out, 0, None);
            out.write_u64::<LittleEndian>(v.nonce).expect("vec write");
            write_var_str(&mut out, &v.user_agent);
            out.write_i32::<LittleEndian>(v.start_height).expect("vec write");
        }
        Message::Verack | Message::GetAddr | Message::Unknown(_) => {}
        Message::Addr(entries) => {
            write_var_int(&mut out, entries.len() as u64);
            for entry in entries {
                out.write_u32::<LittleEndian>(entry.time).expect("vec write");
                out.write_u64::<LittleEndian>(entry.services).expect("vec write");
                let bytes = entry.endpoint.addr.wire_bytes().unwrap_or([0u8; 16]);
                out.extend_from_slice(&bytes);
                out.write_u16::<BigEndian>(entry.endpoint.port).expect("vec write");
            }
        }
        Message::Ping(nonce) | Message::Pong(nonce) => {
            out.write_u64::<LittleEndian>(*nonce).expect("vec write");
        }
    }
    out
}

/// Frame a message: magic, zero-padded command, length, double-SHA256 checksum.
pub fn encode_message(magic: [u8; 4], msg: &Message, remote: Option<&Endpoint>) -> Vec<u8> {
    let payload = encode_payload(msg, remote);
    let mut out = Vec::with_capacity(HEADER_SIZE + payload.len());
    out.extend_from_slice(&magic);
    let mut command = [0u8; 12];
    command[..msg.command().len()].copy_from_slice(msg.command().as_bytes());
    out.extend_from_slice(&command);
    out.write_u32::<LittleEndian>(payload.len() as u32).expect("vec write");
    out.extend_from_slice(&checksum(&payload));
    out.extend_from_slice(&payload);
    out
}

// =============================================================================
// DECODING
// =============================================================================

fn read_var_int(cursor: &mut Cursor<&[u8]>, what: &'static str) -> Result<u64, ProtocolError> {
    let tag = cursor.read_u8().map_err(|_| ProtocolError::Malformed(what))?;
    let value = match tag {
        0xfd => cursor.read_u16::<LittleEndian>().map_err(|_| ProtocolError::Malformed(what))? as u64,
        0xfe => cursor.read_u32::<LittleEndian>().map_err(|_| ProtocolError::Malformed(what))? as u64,
        0xff => cursor.read_u64::<LittleEndian>().map_err(|_| ProtocolError::Malformed(what))?,
        n => n as u64,
    };
    Ok(value)
}

fn parse_version(payload: &[u8]) -> Result<VersionMessage, ProtocolError> {
    let mut cursor = Cursor::new(payload);
    let err = || ProtocolError::Malformed("version");
    let version = cursor.read_i32::<LittleEndian>().map_err(|_| err())?;
    let services = cursor.read_u64::<LittleEndian>().map_err(|_| err())?;
    let timestamp = cursor.read_i64::<LittleEndian>().map_err(|_| err())?;
    // addr_recv and addr_from, 26 bytes each; contents unused
    let mut skip = [0u8; 26];
    cursor.read_exact(&mut skip).map_err(|_| err())?;
    cursor.read_exact(&mut skip).map_err(|_| err())?;
    let nonce = cursor.read_u64::<LittleEndian>().map_err(|_| err())?;
    let agent_len = read_var_int(&mut cursor, "version")? as usize;
    if agent_len > MAX_USER_AGENT_LEN {
        return Err(ProtocolError::Malformed("version"));
    }
    let mut agent = vec![0u8; agent_len];
    cursor.read_exact(&mut agent).map_err(|_| err())?;
    let user_agent = String::from_utf8_lossy(&agent).into_owned();
    let start_height = cursor.read_i32::<LittleEndian>().map_err(|_| err())?;
    // Trailing fields (relay flag, extensions) are tolerated and ignored.
    Ok(VersionMessage { version, services, timestamp, nonce, user_agent, start_height })
}

fn parse_addr(payload: &[u8]) -> Result<Vec<WireAddr>, ProtocolError> {
    let mut cursor = Cursor::new(payload);
    let err = || ProtocolError::Malformed("addr");
    let count = read_var_int(&mut cursor, "addr")? as usize;
    if count > MAX_ADDR_PER_MSG {
        return Err(ProtocolError::TooManyAddrs(count));
    }
    let mut entries = Vec::with_capacity(count);
    for _ in 0..count {
        let time = cursor.read_u32::<LittleEndian>().map_err(|_| err())?;
        let services = cursor.read_u64::<LittleEndian>().map_err(|_| err())?;
        let mut ip = [0u8; 16];
        cursor.read_exact(&mut ip).map_err(|_| err())?;
        let port = cursor.read_u16::<BigEndian>().map_err(|_| err())?;
        entries.push(WireAddr {
            time,
            services,
            endpoint: Endpoint::new(NetAddr::from_wire_bytes(ip), port),
        });
    }
    Ok(entries)
}

fn parse_nonce(payload: &[u8], what: &'static str) -> Result<u64, ProtocolError> {
    // Pre-nonce pings exist in the wild; answer those with nonce 0.
    if payload.is_empty() {
        return Ok(0);
    }
    Cursor::new(payload)
        .read_u64::<LittleEndian>()
        .map_err(|_| ProtocolError::Malformed(what))
}

fn parse_payload(command: &str, payload: &[u8]) -> Result<Message, ProtocolError> {
    match command {
        "version" => Ok(Message::Version(parse_version(payload)?)),
        "verack" => Ok(Message::Verack),
        "getaddr" => Ok(Message::GetAddr),
        "addr" => Ok(Message::Addr(parse_addr(payload)?)),
        "ping" => Ok(Message::Ping(parse_nonce(payload, "ping")?)),
        "pong" => Ok(Message::Pong(parse_nonce(payload, "pong")?)),
        other => Ok(Message::Unknown(other.to_string())),
    }
}

/// Decode one framed message from a byte buffer. Returns the message and the
/// number of bytes consumed.
pub fn decode_message(magic: [u8; 4], buf: &[u8]) -> Result<(Message, usize), ProtocolError> {
    if buf.len() < HEADER_SIZE {
        return Err(ProtocolError::Malformed("header"));
    }
    if buf[..4] != magic {
        return Err(ProtocolError::BadMagic);
    }
    let command = command_str(&buf[4..16])?;
    let length = Cursor::new(&buf[16..20])
        .read_u32::<LittleEndian>()
        .expect("slice read");
    if length > MAX_PAYLOAD_SIZE {
        return Err(ProtocolError::Oversized(length));
    }
    let total = HEADER_SIZE + length as usize;
    if buf.len() < total {
        return Err(ProtocolError::Malformed("truncated payload"));
    }
    let payload = &buf[HEADER_SIZE..total];
    if checksum(payload) != buf[20..24] {
        return Err(ProtocolError::BadChecksum);
    }
    Ok((parse_payload(&command, payload)?, total))
}

fn command_str(raw: &[u8]) -> Result<String, ProtocolError> {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    // Zero padding must run to the end of the field
    if raw[end..].iter().any(|&b| b != 0) {
        return Err(ProtocolError::BadCommand);
    }
    let command = &raw[..end];
    if command.is_empty() || !command.iter().all(|b| b.is_ascii_graphic()) {
        return Err(ProtocolError::BadCommand);
    }
    Ok(String::from_utf8_lossy(command).into_owned())
}

// =============================================================================
// STREAM I/O
// =============================================================================

/// Write one framed message within the idle timeout.
pub async fn send_message(
    stream: &mut TcpStream,
    magic: [u8; 4],
    msg: &Message,
    remote: Option<&Endpoint>,
) -> Result<(), ProtocolError> {
    let bytes = encode_message(magic, msg, remote);
    super::proxy::write_all_timed(stream, &bytes).await?;
    Ok(())
}

/// Read one framed message within the idle timeout.
///
/// Framing violations (magic, command, length, checksum) surface as
/// `BadPeer`-class errors; short reads and timeouts stay transient.
pub async fn recv_message(stream: &mut TcpStream, magic: [u8; 4]) -> Result<Message, ProtocolError> {
    let mut header = [0u8; HEADER_SIZE];
    super::proxy::read_exact_timed(stream, &mut header).await?;
    if header[..4] != magic {
        return Err(ProtocolError::BadMagic);
    }
    let command = command_str(&header[4..16])?;
    let length = Cursor::new(&header[16..20])
        .read_u32::<LittleEndian>()
        .expect("slice read");
    if length > MAX_PAYLOAD_SIZE {
        return Err(ProtocolError::Oversized(length));
    }
    let mut payload = vec![0u8; length as usize];
    super::proxy::read_exact_timed(stream, &mut payload).await?;
    if checksum(&payload) != header[20..24] {
        return Err(ProtocolError::BadChecksum);
    }
    parse_payload(&command, &payload)
}
