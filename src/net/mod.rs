//! P2P networking layer

pub mod addr;
pub mod message;
pub mod probe;
pub mod proxy;

// Re-exports
pub use addr::{AddrError, Endpoint, Family, GroupKey, NetAddr};
pub use message::{
    Message, ProtocolError, VersionMessage, WireAddr, MAINNET_MAGIC, MAX_ADDR_PER_MSG,
    NODE_BLOOM, NODE_COMPACT_FILTERS, NODE_NETWORK, NODE_NETWORK_LIMITED, NODE_WITNESS,
    PROTOCOL_VERSION, TESTNET_MAGIC,
};
pub use probe::probe_peer;
pub use proxy::{DialError, ProxyTable, Route, CONNECT_TIMEOUT, IDLE_TIMEOUT};
