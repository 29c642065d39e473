//! Authoritative DNS: wire codec and cached UDP responders

pub mod codec;
pub mod server;

pub use codec::{DnsParseError, DnsQuery, MAX_UDP_PAYLOAD};
pub use server::{dns_worker, CachePolicy, DnsHandler};
