//! Minimal authoritative DNS wire codec
//!
//! Supports exactly what the seeder answers: single-question IN queries for
//! `A`, `AAAA`, `NS`, `SOA` and `ANY`, with pointer compression for the
//! repeated owner name and hard truncation at the 512-byte UDP budget.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;
use std::net::{Ipv4Addr, Ipv6Addr};
use thiserror::Error;

/// Classic UDP response budget; larger answers are truncated.
pub const MAX_UDP_PAYLOAD: usize = 512;

pub const QTYPE_A: u16 = 1;
pub const QTYPE_NS: u16 = 2;
pub const QTYPE_SOA: u16 = 6;
pub const QTYPE_AAAA: u16 = 28;
pub const QTYPE_ANY: u16 = 255;

const QCLASS_IN: u16 = 1;

const FLAG_QR: u16 = 0x8000;
const FLAG_AA: u16 = 0x0400;
const FLAG_TC: u16 = 0x0200;
const FLAG_RD: u16 = 0x0100;
const RCODE_FORMERR: u16 = 1;

/// Wire size of an `A` answer with a compressed owner name.
pub const A_RECORD_SIZE: usize = 2 + 2 + 2 + 4 + 2 + 4;

/// Wire size of an `AAAA` answer with a compressed owner name.
pub const AAAA_RECORD_SIZE: usize = 2 + 2 + 2 + 4 + 2 + 16;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DnsParseError {
    #[error("truncated packet")]
    Truncated,
    #[error("packet is a response")]
    IsResponse,
    #[error("opcode is not QUERY")]
    BadOpcode,
    #[error("TC bit set in query")]
    TcSet,
    #[error("question count is not one")]
    BadQuestionCount,
    #[error("question class is not IN")]
    NotIn,
    #[error("malformed name")]
    BadName,
}

impl DnsParseError {
    /// Everything except a stray response deserves a FORMERR reply.
    pub fn wants_formerr(&self) -> bool {
        !matches!(self, DnsParseError::IsResponse)
    }
}

/// A parsed single-question query. `qname` keeps the sender's case so the
/// echoed question matches byte-for-byte semantics; match it
/// case-insensitively.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsQuery {
    pub id: u16,
    pub qname: String,
    pub qtype: u16,
    /// RD bit copied back into the response.
    pub recursion_desired: bool,
}

/// Parse a query datagram.
pub fn parse_query(buf: &[u8]) -> Result<DnsQuery, DnsParseError> {
    let mut cursor = Cursor::new(buf);
    let id = cursor.read_u16::<BigEndian>().map_err(|_| DnsParseError::Truncated)?;
    let flags = cursor.read_u16::<BigEndian>().map_err(|_| DnsParseError::Truncated)?;
    let qdcount = cursor.read_u16::<BigEndian>().map_err(|_| DnsParseError::Truncated)?;
    // ancount, nscount, arcount: present but irrelevant for queries
    for _ in 0..3 {
        cursor.read_u16::<BigEndian>().map_err(|_| DnsParseError::Truncated)?;
    }

    if flags & FLAG_QR != 0 {
        return Err(DnsParseError::IsResponse);
    }
    if (flags >> 11) & 0xf != 0 {
        return Err(DnsParseError::BadOpcode);
    }
    if flags & FLAG_TC != 0 {
        return Err(DnsParseError::TcSet);
    }
    if qdcount != 1 {
        return Err(DnsParseError::BadQuestionCount);
    }

    let qname = parse_name(&mut cursor, buf)?;
    let qtype = cursor.read_u16::<BigEndian>().map_err(|_| DnsParseError::Truncated)?;
    let qclass = cursor.read_u16::<BigEndian>().map_err(|_| DnsParseError::Truncated)?;
    if qclass != QCLASS_IN {
        return Err(DnsParseError::NotIn);
    }

    Ok(DnsQuery {
        id,
        qname,
        qtype,
        recursion_desired: flags & FLAG_RD != 0,
    })
}

/// Labels only; compression pointers are not legal in a question we serve.
fn parse_name(cursor: &mut Cursor<&[u8]>, buf: &[u8]) -> Result<String, DnsParseError> {
    let mut name = String::new();
    let mut total = 0usize;
    loop {
        let len = cursor.read_u8().map_err(|_| DnsParseError::Truncated)? as usize;
        if len == 0 {
            break;
        }
        if len & 0xc0 != 0 {
            return Err(DnsParseError::BadName);
        }
        if len > 63 {
            return Err(DnsParseError::BadName);
        }
        total += len + 1;
        if total > 255 {
            return Err(DnsParseError::BadName);
        }
        let start = cursor.position() as usize;
        let end = start + len;
        if end > buf.len() {
            return Err(DnsParseError::Truncated);
        }
        let label = &buf[start..end];
        if !label.iter().all(|b| b.is_ascii() && *b != b'.') {
            return Err(DnsParseError::BadName);
        }
        if !name.is_empty() {
            name.push('.');
        }
        name.push_str(&String::from_utf8_lossy(label));
        cursor.set_position(end as u64);
    }
    Ok(name)
}

fn encode_name(out: &mut Vec<u8>, name: &str) {
    for label in name.split('.') {
        if label.is_empty() {
            continue;
        }
        let bytes = label.as_bytes();
        let len = bytes.len().min(63);
        out.push(len as u8);
        out.extend_from_slice(&bytes[..len]);
    }
    out.push(0);
}

/// A bare FORMERR reply carrying only the echoed id.
pub fn formerr_response(id: u16) -> Vec<u8> {
    let mut out = Vec::with_capacity(12);
    out.write_u16::<BigEndian>(id).expect("vec write");
    out.write_u16::<BigEndian>(FLAG_QR | RCODE_FORMERR).expect("vec write");
    for _ in 0..4 {
        out.write_u16::<BigEndian>(0).expect("vec write");
    }
    out
}

/// SOA timing fields, fixed by zone policy.
#[derive(Debug, Clone, Copy)]
pub struct SoaTimers {
    pub serial: u32,
    pub refresh: u32,
    pub retry: u32,
    pub expire: u32,
    pub minimum: u32,
}

/// Position-independent NS record (owner encoded in full), usable in answer
/// or authority sections.
pub fn encode_ns_record(zone: &str, ns: &str, ttl: u32) -> Vec<u8> {
    let mut out = Vec::new();
    encode_name(&mut out, zone);
    out.write_u16::<BigEndian>(QTYPE_NS).expect("vec write");
    out.write_u16::<BigEndian>(QCLASS_IN).expect("vec write");
    out.write_u32::<BigEndian>(ttl).expect("vec write");
    let mut rdata = Vec::new();
    encode_name(&mut rdata, ns);
    out.write_u16::<BigEndian>(rdata.len() as u16).expect("vec write");
    out.extend_from_slice(&rdata);
    out
}

/// Position-independent SOA record.
pub fn encode_soa_record(zone: &str, ns: &str, rname: &str, ttl: u32, timers: SoaTimers) -> Vec<u8> {
    let mut out = Vec::new();
    encode_name(&mut out, zone);
    out.write_u16::<BigEndian>(QTYPE_SOA).expect("vec write");
    out.write_u16::<BigEndian>(QCLASS_IN).expect("vec write");
    out.write_u32::<BigEndian>(ttl).expect("vec write");
    let mut rdata = Vec::new();
    encode_name(&mut rdata, ns);
    encode_name(&mut rdata, rname);
    rdata.write_u32::<BigEndian>(timers.serial).expect("vec write");
    rdata.write_u32::<BigEndian>(timers.refresh).expect("vec write");
    rdata.write_u32::<BigEndian>(timers.retry).expect("vec write");
    rdata.write_u32::<BigEndian>(timers.expire).expect("vec write");
    rdata.write_u32::<BigEndian>(timers.minimum).expect("vec write");
    out.write_u16::<BigEndian>(rdata.len() as u16).expect("vec write");
    out.extend_from_slice(&rdata);
    out
}

/// Builds one response: header and echoed question up front, `A`/`AAAA`
/// answers with the owner compressed to the question name, then authority
/// records. Every add is budget-checked against [`MAX_UDP_PAYLOAD`]; the TC
/// bit is never set.
pub struct ResponseBuilder {
    buf: Vec<u8>,
    ancount: u16,
    nscount: u16,
}

impl ResponseBuilder {
    pub fn new(query: &DnsQuery) -> Self {
        let mut buf = Vec::with_capacity(MAX_UDP_PAYLOAD);
        buf.write_u16::<BigEndian>(query.id).expect("vec write");
        let mut flags = FLAG_QR | FLAG_AA;
        if query.recursion_desired {
            flags |= FLAG_RD;
        }
        buf.write_u16::<BigEndian>(flags).expect("vec write");
        buf.write_u16::<BigEndian>(1).expect("vec write"); // qdcount
        for _ in 0..3 {
            buf.write_u16::<BigEndian>(0).expect("vec write");
        }
        encode_name(&mut buf, &query.qname);
        buf.write_u16::<BigEndian>(query.qtype).expect("vec write");
        buf.write_u16::<BigEndian>(QCLASS_IN).expect("vec write");
        Self { buf, ancount: 0, nscount: 0 }
    }

    /// Bytes still available given `reserved` for sections added later.
    pub fn remaining(&self, reserved: usize) -> usize {
        MAX_UDP_PAYLOAD.saturating_sub(self.buf.len() + reserved)
    }

    fn owner_pointer(&mut self) {
        // The question name always sits right after the 12-byte header.
        self.buf.write_u16::<BigEndian>(0xc000 | 12).expect("vec write");
    }

    pub fn add_a(&mut self, ip: Ipv4Addr, ttl: u32, reserved: usize) -> bool {
        if self.remaining(reserved) < A_RECORD_SIZE {
            return false;
        }
        self.owner_pointer();
        self.buf.write_u16::<BigEndian>(QTYPE_A).expect("vec write");
        self.buf.write_u16::<BigEndian>(QCLASS_IN).expect("vec write");
        self.buf.write_u32::<BigEndian>(ttl).expect("vec write");
        self.buf.write_u16::<BigEndian>(4).expect("vec write");
        self.buf.extend_from_slice(&ip.octets());
        self.ancount += 1;
        true
    }

    pub fn add_aaaa(&mut self, ip: Ipv6Addr, ttl: u32, reserved: usize) -> bool {
        if self.remaining(reserved) < AAAA_RECORD_SIZE {
            return false;
        }
        self.owner_pointer();
        self.buf.write_u16::<BigEndian>(QTYPE_AAAA).expect("vec write");
        self.buf.write_u16::<BigEndian>(QCLASS_IN).expect("vec write");
        self.buf.write_u32::<BigEndian>(ttl).expect("vec write");
        self.buf.write_u16::<BigEndian>(16).expect("vec write");
        self.buf.extend_from_slice(&ip.octets());
        self.ancount += 1;
        true
    }

    /// Append a pre-encoded record to the answer section.
    pub fn add_answer_record(&mut self, record: &[u8]) -> bool {
        if self.remaining(0) < record.len() {
            return false;
        }
        self.buf.extend_from_slice(record);
        self.ancount += 1;
        true
    }

    /// Append a pre-encoded record to the authority section. Call after all
    /// answers are in.
    pub fn add_authority_record(&mut self, record: &[u8]) -> bool {
        if self.remaining(0) < record.len() {
            return false;
        }
        self.buf.extend_from_slice(record);
        self.nscount += 1;
        true
    }

    pub fn answer_count(&self) -> u16 {
        self.ancount
    }

    pub fn finish(mut self) -> Vec<u8> {
        let ancount = self.ancount;
        let nscount = self.nscount;
        self.buf[6..8].copy_from_slice(&ancount.to_be_bytes());
        self.buf[8..10].copy_from_slice(&nscount.to_be_bytes());
        self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_query(id: u16, qname: &str, qtype: u16) -> Vec<u8> {
        let mut out = Vec::new();
        out.write_u16::<BigEndian>(id).unwrap();
        out.write_u16::<BigEndian>(FLAG_RD).unwrap();
        out.write_u16::<BigEndian>(1).unwrap();
        for _ in 0..3 {
            out.write_u16::<BigEndian>(0).unwrap();
        }
        encode_name(&mut out, qname);
        out.write_u16::<BigEndian>(qtype).unwrap();
        out.write_u16::<BigEndian>(QCLASS_IN).unwrap();
        out
    }

    #[test]
    fn query_roundtrip() {
        let bytes = encode_query(0x1234, "x9.seed.example.com", QTYPE_A);
        let query = parse_query(&bytes).unwrap();
        assert_eq!(query.id, 0x1234);
        assert_eq!(query.qname, "x9.seed.example.com");
        assert_eq!(query.qtype, QTYPE_A);
        assert!(query.recursion_desired);
    }

    #[test]
    fn rejects_multi_question() {
        let mut bytes = encode_query(1, "seed.example.com", QTYPE_A);
        bytes[4..6].copy_from_slice(&2u16.to_be_bytes());
        assert_eq!(parse_query(&bytes), Err(DnsParseError::BadQuestionCount));
        assert!(parse_query(&bytes).unwrap_err().wants_formerr());
    }

    #[test]
    fn rejects_non_in_class() {
        let mut bytes = encode_query(1, "seed.example.com", QTYPE_A);
        let len = bytes.len();
        bytes[len - 2..].copy_from_slice(&3u16.to_be_bytes()); // CH
        assert_eq!(parse_query(&bytes), Err(DnsParseError::NotIn));
    }

    #[test]
    fn rejects_bad_opcode_and_tc() {
        let mut bytes = encode_query(1, "seed.example.com", QTYPE_A);
        bytes[2] |= 0x08; // opcode = 1 (IQUERY)
        assert_eq!(parse_query(&bytes), Err(DnsParseError::BadOpcode));

        let mut bytes = encode_query(1, "seed.example.com", QTYPE_A);
        bytes[2] |= 0x02; // TC
        assert_eq!(parse_query(&bytes), Err(DnsParseError::TcSet));
    }

    #[test]
    fn ignores_responses() {
        let mut bytes = encode_query(1, "seed.example.com", QTYPE_A);
        bytes[2] |= 0x80; // QR
        let err = parse_query(&bytes).unwrap_err();
        assert_eq!(err, DnsParseError::IsResponse);
        assert!(!err.wants_formerr());
    }

    #[test]
    fn rejects_compression_in_question() {
        let mut bytes = encode_query(1, "a.example.com", QTYPE_A);
        bytes[12] = 0xc0; // pointer where a label length belongs
        assert_eq!(parse_query(&bytes), Err(DnsParseError::BadName));
    }

    #[test]
    fn truncated_packet() {
        let bytes = encode_query(1, "seed.example.com", QTYPE_A);
        assert_eq!(parse_query(&bytes[..10]), Err(DnsParseError::Truncated));
        assert_eq!(parse_query(&bytes[..14]), Err(DnsParseError::Truncated));
    }

    #[test]
    fn a_answer_wire_format() {
        let query = parse_query(&encode_query(7, "seed.example.com", QTYPE_A)).unwrap();
        let mut builder = ResponseBuilder::new(&query);
        assert!(builder.add_a(Ipv4Addr::new(1, 2, 3, 4), 3600, 0));
        let bytes = builder.finish();

        // Header: id, QR|AA|RD, counts
        assert_eq!(&bytes[0..2], &7u16.to_be_bytes());
        assert_eq!(&bytes[2..4], &(FLAG_QR | FLAG_AA | FLAG_RD).to_be_bytes());
        assert_eq!(&bytes[4..6], &1u16.to_be_bytes());
        assert_eq!(&bytes[6..8], &1u16.to_be_bytes());

        // Answer owner is a pointer to offset 12
        let answer_start = bytes.len() - A_RECORD_SIZE;
        assert_eq!(&bytes[answer_start..answer_start + 2], &[0xc0, 0x0c]);
        assert_eq!(&bytes[bytes.len() - 4..], &[1, 2, 3, 4]);
    }

    #[test]
    fn budget_stops_adds() {
        let query = parse_query(&encode_query(7, "seed.example.com", QTYPE_A)).unwrap();
        let mut builder = ResponseBuilder::new(&query);
        let mut added = 0;
        while builder.add_a(Ipv4Addr::new(10, 0, 0, 1), 3600, 0) {
            added += 1;
        }
        let bytes = builder.finish();
        assert!(bytes.len() <= MAX_UDP_PAYLOAD);
        assert!(added > 20, "the budget admits many A records, got {}", added);
        // TC must stay clear even when full
        assert_eq!(bytes[2] & 0x02, 0);
    }

    #[test]
    fn soa_and_ns_records_encode() {
        let timers = SoaTimers {
            serial: 1_700_000_000,
            refresh: 604_800,
            retry: 86_400,
            expire: 2_592_000,
            minimum: 3600,
        };
        let soa = encode_soa_record(
            "seed.example.com",
            "ns.example.com",
            "admin.example.com",
            40_000,
            timers,
        );
        let ns = encode_ns_record("seed.example.com", "ns.example.com", 40_000);

        let query = parse_query(&encode_query(9, "seed.example.com", QTYPE_SOA)).unwrap();
        let mut builder = ResponseBuilder::new(&query);
        assert!(builder.add_answer_record(&soa));
        assert!(builder.add_authority_record(&ns));
        let bytes = builder.finish();
        assert_eq!(&bytes[6..8], &1u16.to_be_bytes());
        assert_eq!(&bytes[8..10], &1u16.to_be_bytes());
        // Serial is the last four-plus-sixteen bytes back; just check presence
        let serial = 1_700_000_000u32.to_be_bytes();
        assert!(bytes.windows(4).any(|w| w == serial));
    }
}
