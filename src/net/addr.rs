//! Network address values: IPv4/IPv6/onion endpoints and grouping

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;
use thiserror::Error;

/// OnionCat prefix mapping v2 hidden services into IPv6 (fd87:d87e:eb43::/48).
const ONIONCAT_PREFIX: [u8; 6] = [0xfd, 0x87, 0xd8, 0x7e, 0xeb, 0x43];

const BASE32_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz234567";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddrError {
    #[error("malformed address literal: {0}")]
    MalformedLiteral(String),
    #[error("unsupported address family")]
    UnsupportedFamily,
}

/// Address family, as routed by the dialer and filtered by DNS queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    Ipv4,
    Ipv6,
    Onion,
}

/// A network address without port.
///
/// Onion v2 addresses arriving in OnionCat form (`fd87:d87e:eb43::/48`) are
/// canonicalized to `OnionV2` so the two spellings compare equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum NetAddr {
    V4(Ipv4Addr),
    V6(Ipv6Addr),
    OnionV2([u8; 10]),
    OnionV3([u8; 32]),
}

impl NetAddr {
    pub fn family(&self) -> Family {
        match self {
            NetAddr::V4(_) => Family::Ipv4,
            NetAddr::V6(_) => Family::Ipv6,
            NetAddr::OnionV2(_) | NetAddr::OnionV3(_) => Family::Onion,
        }
    }

    /// Canonicalize an `IpAddr`: IPv4-mapped IPv6 becomes V4, OnionCat
    /// becomes OnionV2.
    pub fn from_ip(ip: IpAddr) -> Self {
        match ip {
            IpAddr::V4(v4) => NetAddr::V4(v4),
            IpAddr::V6(v6) => {
                if let Some(v4) = v6.to_ipv4_mapped() {
                    return NetAddr::V4(v4);
                }
                let octets = v6.octets();
                if octets[..6] == ONIONCAT_PREFIX {
                    let mut onion = [0u8; 10];
                    onion.copy_from_slice(&octets[6..]);
                    return NetAddr::OnionV2(onion);
                }
                NetAddr::V6(v6)
            }
        }
    }

    /// The 16-byte form used in peer `addr` entries: IPv4 mapped, onion v2 as
    /// OnionCat. Onion v3 does not fit and yields `None`.
    pub fn wire_bytes(&self) -> Option<[u8; 16]> {
        match self {
            NetAddr::V4(v4) => Some(v4.to_ipv6_mapped().octets()),
            NetAddr::V6(v6) => Some(v6.octets()),
            NetAddr::OnionV2(onion) => {
                let mut bytes = [0u8; 16];
                bytes[..6].copy_from_slice(&ONIONCAT_PREFIX);
                bytes[6..].copy_from_slice(onion);
                Some(bytes)
            }
            NetAddr::OnionV3(_) => None,
        }
    }

    pub fn from_wire_bytes(bytes: [u8; 16]) -> Self {
        NetAddr::from_ip(IpAddr::V6(Ipv6Addr::from(bytes)))
    }

    /// Coarse diversity bucket: /16 for IPv4, /32 for IPv6, the leading
    /// onion bytes for hidden services. A family tag keeps buckets disjoint
    /// across families.
    pub fn group_key(&self) -> GroupKey {
        match self {
            NetAddr::V4(v4) => {
                let o = v4.octets();
                GroupKey([1, o[0], o[1], 0, 0])
            }
            NetAddr::V6(v6) => {
                let o = v6.octets();
                GroupKey([2, o[0], o[1], o[2], o[3]])
            }
            NetAddr::OnionV2(onion) => GroupKey([3, onion[0], onion[1], onion[2], onion[3]]),
            NetAddr::OnionV3(onion) => GroupKey([4, onion[0], onion[1], onion[2], onion[3]]),
        }
    }

    /// Check if the address is globally routable.
    ///
    /// Filters out private networks, loopback, link-local, documentation,
    /// broadcast, multicast and unspecified ranges; these never belong in
    /// DNS answers or the crawl queue. Onion addresses are always routable
    /// through the Tor proxy.
    pub fn is_routable(&self) -> bool {
        match self {
            NetAddr::V4(ip) => {
                !ip.is_private()
                    && !ip.is_loopback()
                    && !ip.is_link_local()
                    && !ip.is_broadcast()
                    && !ip.is_documentation()
                    && !ip.is_multicast()
                    && !ip.is_unspecified()
            }
            NetAddr::V6(ip) => {
                if ip.is_loopback() || ip.is_unspecified() || ip.is_multicast() {
                    return false;
                }

                let segments = ip.segments();

                // fc00::/7 — Unique Local Address (private IPv6)
                if (segments[0] & 0xfe00) == 0xfc00 {
                    return false;
                }

                // fe80::/10 — Link-local
                if (segments[0] & 0xffc0) == 0xfe80 {
                    return false;
                }

                // 2001:db8::/32 — Documentation
                if segments[0] == 0x2001 && segments[1] == 0x0db8 {
                    return false;
                }

                true
            }
            NetAddr::OnionV2(_) | NetAddr::OnionV3(_) => true,
        }
    }

    /// The socket form for direct dialing; onion has none.
    pub fn to_ip(&self) -> Option<IpAddr> {
        match self {
            NetAddr::V4(v4) => Some(IpAddr::V4(*v4)),
            NetAddr::V6(v6) => Some(IpAddr::V6(*v6)),
            _ => None,
        }
    }
}

impl fmt::Display for NetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetAddr::V4(v4) => write!(f, "{}", v4),
            NetAddr::V6(v6) => write!(f, "{}", v6),
            NetAddr::OnionV2(onion) => write!(f, "{}.onion", base32_encode(onion)),
            NetAddr::OnionV3(onion) => write!(f, "{}.onion", base32_encode(onion)),
        }
    }
}

impl FromStr for NetAddr {
    type Err = AddrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(name) = s.strip_suffix(".onion") {
            let bytes = base32_decode(name)
                .ok_or_else(|| AddrError::MalformedLiteral(s.to_string()))?;
            return match bytes.len() {
                10 => {
                    let mut onion = [0u8; 10];
                    onion.copy_from_slice(&bytes);
                    Ok(NetAddr::OnionV2(onion))
                }
                // v3 names carry pubkey (32) + checksum (2) + version (1)
                35 => {
                    let mut onion = [0u8; 32];
                    onion.copy_from_slice(&bytes[..32]);
                    Ok(NetAddr::OnionV3(onion))
                }
                _ => Err(AddrError::UnsupportedFamily),
            };
        }
        s.parse::<IpAddr>()
            .map(NetAddr::from_ip)
            .map_err(|_| AddrError::MalformedLiteral(s.to_string()))
    }
}

/// Diversity bucket identifier derived from an address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupKey([u8; 5]);

/// An address plus TCP port: the unit the database tracks and DNS serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Endpoint {
    pub addr: NetAddr,
    pub port: u16,
}

impl Endpoint {
    pub fn new(addr: NetAddr, port: u16) -> Self {
        Self { addr, port }
    }

    pub fn from_socket_addr(sock: SocketAddr) -> Self {
        Self {
            addr: NetAddr::from_ip(sock.ip()),
            port: sock.port(),
        }
    }

    pub fn to_socket_addr(&self) -> Option<SocketAddr> {
        self.addr.to_ip().map(|ip| SocketAddr::new(ip, self.port))
    }

    pub fn family(&self) -> Family {
        self.addr.family()
    }

    pub fn group_key(&self) -> GroupKey {
        self.addr.group_key()
    }

    pub fn is_routable(&self) -> bool {
        self.addr.is_routable()
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.addr {
            NetAddr::V6(v6) => write!(f, "[{}]:{}", v6, self.port),
            _ => write!(f, "{}:{}", self.addr, self.port),
        }
    }
}

impl FromStr for Endpoint {
    type Err = AddrError;

    /// Parses `1.2.3.4:port`, `[v6]:port` and `name.onion:port`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(rest) = s.strip_prefix('[') {
            let (host, port) = rest
                .split_once("]:")
                .ok_or_else(|| AddrError::MalformedLiteral(s.to_string()))?;
            let addr = host.parse::<Ipv6Addr>()
                .map_err(|_| AddrError::MalformedLiteral(s.to_string()))?;
            let port = port.parse::<u16>()
                .map_err(|_| AddrError::MalformedLiteral(s.to_string()))?;
            return Ok(Endpoint::new(NetAddr::from_ip(IpAddr::V6(addr)), port));
        }
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| AddrError::MalformedLiteral(s.to_string()))?;
        let port = port.parse::<u16>()
            .map_err(|_| AddrError::MalformedLiteral(s.to_string()))?;
        Ok(Endpoint::new(host.parse::<NetAddr>()?, port))
    }
}

fn base32_encode(data: &[u8]) -> String {
    let mut out = String::with_capacity((data.len() * 8 + 4) / 5);
    let mut acc: u32 = 0;
    let mut bits = 0u32;
    for &byte in data {
        acc = (acc << 8) | byte as u32;
        bits += 8;
        while bits >= 5 {
            bits -= 5;
            out.push(BASE32_ALPHABET[((acc >> bits) & 0x1f) as usize] as char);
        }
    }
    if bits > 0 {
        out.push(BASE32_ALPHABET[((acc << (5 - bits)) & 0x1f) as usize] as char);
    }
    out
}

fn base32_decode(s: &str) -> Option<Vec<u8>> {
    let mut out = Vec::with_capacity(s.len() * 5 / 8);
    let mut acc: u32 = 0;
    let mut bits = 0u32;
    for c in s.bytes() {
        let val = match c {
            b'a'..=b'z' => c - b'a',
            b'A'..=b'Z' => c - b'A',
            b'2'..=b'7' => c - b'2' + 26,
            _ => return None,
        };
        acc = (acc << 5) | val as u32;
        bits += 5;
        if bits >= 8 {
            bits -= 8;
            out.push(((acc >> bits) & 0xff) as u8);
        }
    }
    Some(out)
}
