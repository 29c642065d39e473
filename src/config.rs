//! Configuration record consumed by the seeder core

use crate::net::message::{
    MAINNET_MAGIC, NODE_BLOOM, NODE_COMPACT_FILTERS, NODE_NETWORK, NODE_NETWORK_LIMITED,
    NODE_WITNESS, TESTNET_MAGIC,
};
use std::collections::HashSet;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};

/// Default P2P port crawled on mainnet.
pub const MAINNET_P2P_PORT: u16 = 9265;

/// Default P2P port crawled on testnet.
pub const TESTNET_P2P_PORT: u16 = 19265;

/// Fixed seed nodes resolved by the bootstrap task on mainnet.
pub const MAINNET_SEEDS: &[&str] = &[
    "seed.bitmark.co",
    "radiant.bitmark.co",
    "us.bitmark.co",
    "eu.bitmark.io",
    "jp.bitmark.co",
    "marks.cronobit.com",
];

/// Fixed seed nodes resolved by the bootstrap task on testnet.
pub const TESTNET_SEEDS: &[&str] = &[
    "tz.bitmark.co",
    "tz.bitmark.guru",
    "tz.bitmark.io",
    "tz.bitmark.mx",
    "tz.bitmark.one",
];

/// Service-flag combinations served when the operator configures none.
pub fn default_filter_whitelist() -> HashSet<u64> {
    HashSet::from([
        NODE_NETWORK,                                          // x1
        NODE_NETWORK | NODE_BLOOM,                             // x5
        NODE_NETWORK | NODE_WITNESS,                           // x9
        NODE_NETWORK | NODE_WITNESS | NODE_COMPACT_FILTERS,    // x49
        NODE_NETWORK | NODE_WITNESS | NODE_BLOOM,              // xd
        NODE_NETWORK_LIMITED,                                  // x400
        NODE_NETWORK_LIMITED | NODE_BLOOM,                     // x404
        NODE_NETWORK_LIMITED | NODE_WITNESS,                   // x408
        NODE_NETWORK_LIMITED | NODE_WITNESS | NODE_COMPACT_FILTERS, // x448
        NODE_NETWORK_LIMITED | NODE_WITNESS | NODE_BLOOM,      // x40c
    ])
}

/// Everything the core needs; the CLI merely fills this in.
#[derive(Debug, Clone)]
pub struct SeederConfig {
    /// Zone apex the seeder is authoritative for.
    pub host: String,
    /// Nameserver hostname; absent disables the DNS server.
    pub ns: Option<String>,
    /// SOA mailbox, `user@domain` form.
    pub mbox: Option<String>,
    pub listen_addr: IpAddr,
    pub listen_port: u16,
    pub crawler_threads: usize,
    pub dns_threads: usize,
    pub tor_proxy: Option<SocketAddr>,
    pub ipv4_proxy: Option<SocketAddr>,
    pub ipv6_proxy: Option<SocketAddr>,
    pub filter_whitelist: HashSet<u64>,
    pub testnet: bool,
    pub wipe_ban: bool,
    pub wipe_ignore: bool,
    /// Bootstrap hostnames; empty means the built-in list for the network.
    pub seeds: Vec<String>,
    pub data_ttl: u32,
    pub ns_ttl: u32,
}

impl Default for SeederConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            ns: None,
            mbox: None,
            listen_addr: IpAddr::V6(Ipv6Addr::UNSPECIFIED),
            listen_port: 53,
            crawler_threads: 96,
            dns_threads: 4,
            tor_proxy: None,
            ipv4_proxy: None,
            ipv6_proxy: None,
            filter_whitelist: default_filter_whitelist(),
            testnet: false,
            wipe_ban: false,
            wipe_ignore: false,
            seeds: Vec::new(),
            data_ttl: 3600,
            ns_ttl: 40_000,
        }
    }
}

impl SeederConfig {
    pub fn magic(&self) -> [u8; 4] {
        if self.testnet { TESTNET_MAGIC } else { MAINNET_MAGIC }
    }

    pub fn p2p_port(&self) -> u16 {
        if self.testnet { TESTNET_P2P_PORT } else { MAINNET_P2P_PORT }
    }

    pub fn bootstrap_seeds(&self) -> Vec<String> {
        if !self.seeds.is_empty() {
            return self.seeds.clone();
        }
        let builtin = if self.testnet { TESTNET_SEEDS } else { MAINNET_SEEDS };
        builtin.iter().map(|s| s.to_string()).collect()
    }

    pub fn user_agent(&self) -> String {
        format!("/marks-seeder:{}/", env!("CARGO_PKG_VERSION"))
    }

    /// DNS service is enabled once a nameserver is configured.
    pub fn dns_enabled(&self) -> bool {
        self.ns.is_some()
    }
}
