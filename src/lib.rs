pub mod config;
pub mod crawler;
pub mod db;
pub mod dns;
pub mod dump;
pub mod net;
pub mod types;

pub use config::SeederConfig;
pub use crawler::{crawler_loop, seeder_loop};
pub use db::{AddrDb, DbStats, ProbeResult, ProbeTicket};
pub use dns::{dns_worker, CachePolicy, DnsHandler};
pub use dump::{dump_once, dumper_loop};
pub use net::{Endpoint, NetAddr, ProxyTable, Route};
