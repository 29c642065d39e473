//! UDP DNS workers answering from a per-service-flag cache

use super::codec::{
    formerr_response, parse_query, DnsQuery, ResponseBuilder, SoaTimers, A_RECORD_SIZE,
    AAAA_RECORD_SIZE, QTYPE_A, QTYPE_AAAA, QTYPE_ANY, QTYPE_NS, QTYPE_SOA,
};
use crate::config::SeederConfig;
use crate::db::AddrDb;
use crate::net::addr::{Endpoint, NetAddr};
use crate::types::now;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::{watch, Mutex};
use tracing::{debug, warn};

/// Cache entries are refreshed with up to this many endpoints.
const CACHE_FILL: usize = 1000;

/// Staleness knobs for the per-flag cache. The constants were tuned
/// empirically in seeder deployments; treat them as configuration.
#[derive(Debug, Clone, Copy)]
pub struct CachePolicy {
    /// Refresh when `hits * hit_size_factor > size^2`.
    pub hit_size_factor: u64,
    /// Refresh when `hits^2 * hit_quad_factor > size` after the holdoff.
    pub hit_quad_factor: u64,
    /// Holdoff for the quadratic clause, seconds.
    pub min_refresh_secs: u64,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            hit_size_factor: 400,
            hit_quad_factor: 20,
            min_refresh_secs: 5,
        }
    }
}

impl CachePolicy {
    pub fn is_stale(&self, hits: u64, size: usize, cache_age_secs: u64, force: bool) -> bool {
        let size = size as u64;
        force
            || hits.saturating_mul(self.hit_size_factor) > size.saturating_mul(size)
            || (hits.saturating_mul(hits).saturating_mul(self.hit_quad_factor) > size
                && cache_age_secs > self.min_refresh_secs)
    }
}

/// Snapshot of eligible endpoints for one flag mask.
#[derive(Debug, Default)]
struct FlagCache {
    cache: Vec<Endpoint>,
    n_ipv4: usize,
    n_ipv6: usize,
    cache_time: u64,
    hits: u64,
}

/// Shared state of the DNS workers: zone data, whitelist, the per-flag cache
/// and counters for the status line.
///
/// The cache lock is a single mutex held across refresh; the refresh itself
/// only takes the database lock briefly inside `snapshot_for_flags`.
pub struct DnsHandler {
    db: Arc<AddrDb>,
    zone: String,
    ns_name: String,
    soa_rname: String,
    data_ttl: u32,
    ns_ttl: u32,
    whitelist: HashSet<u64>,
    policy: CachePolicy,
    perflag: Mutex<HashMap<u64, FlagCache>>,
    requests: AtomicU64,
    db_queries: AtomicU64,
    last_refresh: AtomicU64,
}

impl DnsHandler {
    pub fn new(db: Arc<AddrDb>, config: &SeederConfig) -> Self {
        Self::with_policy(db, config, CachePolicy::default())
    }

    pub fn with_policy(db: Arc<AddrDb>, config: &SeederConfig, policy: CachePolicy) -> Self {
        // RNAME: the first @ becomes a label separator
        let soa_rname = config
            .mbox
            .clone()
            .unwrap_or_default()
            .replacen('@', ".", 1);
        Self {
            db,
            zone: config.host.to_ascii_lowercase(),
            ns_name: config.ns.clone().unwrap_or_default().to_ascii_lowercase(),
            soa_rname,
            data_ttl: config.data_ttl,
            ns_ttl: config.ns_ttl,
            whitelist: config.filter_whitelist.clone(),
            policy,
            perflag: Mutex::new(HashMap::new()),
            requests: AtomicU64::new(0),
            db_queries: AtomicU64::new(0),
            last_refresh: AtomicU64::new(now()),
        }
    }

    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    pub fn db_queries(&self) -> u64 {
        self.db_queries.load(Ordering::Relaxed)
    }

    /// Map a QNAME onto a service-flag mask. The zone apex and the
    /// nameserver name mean "any good peer" (mask 0); `x<hex>.zone` requests
    /// a whitelisted mask; anything else is not ours.
    fn interpret_qname(&self, qname: &str) -> Option<u64> {
        let lower = qname.to_ascii_lowercase();
        if lower == self.zone || lower == self.ns_name {
            return Some(0);
        }
        let rest = lower.strip_suffix(&self.zone)?;
        let label = rest.strip_suffix('.')?;
        let hex = label.strip_prefix('x')?;
        if hex.is_empty() || hex.len() > 16 || hex.starts_with('0') {
            return None;
        }
        if !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
            return None;
        }
        let flags = u64::from_str_radix(hex, 16).ok()?;
        self.whitelist.contains(&flags).then_some(flags)
    }

    fn soa_timers(&self) -> SoaTimers {
        SoaTimers {
            serial: self.last_refresh.load(Ordering::Relaxed) as u32,
            refresh: 604_800,
            retry: 86_400,
            expire: 2_592_000,
            minimum: self.data_ttl,
        }
    }

    /// Fetch the cache entry for `flags`, refreshing it when the staleness
    /// policy fires, then draw a uniform subset by partial Fisher–Yates,
    /// skipping entries of unwanted families.
    async fn pick_answers(
        &self,
        flags: u64,
        want_v4: bool,
        want_v6: bool,
        mut budget: usize,
    ) -> Vec<Endpoint> {
        let mut perflag = self.perflag.lock().await;
        let entry = perflag.entry(flags).or_default();
        entry.hits += 1;
        let at = now();
        let never_filled = entry.cache_time == 0;
        if never_filled
            || self
                .policy
                .is_stale(entry.hits, entry.cache.len(), at.saturating_sub(entry.cache_time), false)
        {
            let snapshot = self.db.snapshot_for_flags(flags, CACHE_FILL, true, true);
            self.db_queries.fetch_add(1, Ordering::Relaxed);
            entry.n_ipv4 = snapshot
                .iter()
                .filter(|ep| matches!(ep.addr, NetAddr::V4(_)))
                .count();
            entry.n_ipv6 = snapshot.len() - entry.n_ipv4;
            entry.cache = snapshot;
            entry.hits = 0;
            entry.cache_time = at;
            self.last_refresh.store(at, Ordering::Relaxed);
            debug!(
                "refreshed flag cache 0x{:x}: {} entries ({} v4, {} v6)",
                flags,
                entry.cache.len(),
                entry.n_ipv4,
                entry.n_ipv6
            );
        }

        let size = entry.cache.len();
        let mut remaining_v4 = if want_v4 { entry.n_ipv4 } else { 0 };
        let mut remaining_v6 = if want_v6 { entry.n_ipv6 } else { 0 };
        // Unpredictable picks: a scraper must not be able to steer which
        // subset of the cache it is served.
        let mut rng = ChaCha20Rng::from_entropy();
        let mut out = Vec::new();
        let mut i = 0;
        while i < size {
            let can_v4 = remaining_v4 > 0 && budget >= A_RECORD_SIZE;
            let can_v6 = remaining_v6 > 0 && budget >= AAAA_RECORD_SIZE;
            if !can_v4 && !can_v6 {
                break;
            }
            // Draw from the unpicked tail, walk forward to an eligible
            // family, then swap into the picked prefix.
            let mut j = rng.gen_range(i..size);
            loop {
                let ok = match entry.cache[j].addr {
                    NetAddr::V4(_) => can_v4,
                    NetAddr::V6(_) => can_v6,
                    _ => false,
                };
                if ok {
                    break;
                }
                j += 1;
                if j == size {
                    j = i;
                }
            }
            entry.cache.swap(i, j);
            let pick = entry.cache[i];
            match pick.addr {
                NetAddr::V4(_) => {
                    remaining_v4 -= 1;
                    budget -= A_RECORD_SIZE;
                }
                NetAddr::V6(_) => {
                    remaining_v6 -= 1;
                    budget -= AAAA_RECORD_SIZE;
                }
                _ => {}
            }
            out.push(pick);
            i += 1;
        }
        out
    }

    /// Turn one datagram into one reply, or nothing for packets we must not
    /// answer (responses, short garbage).
    pub async fn handle_packet(&self, packet: &[u8]) -> Option<Vec<u8>> {
        self.requests.fetch_add(1, Ordering::Relaxed);
        let query = match parse_query(packet) {
            Ok(query) => query,
            Err(e) => {
                return if e.wants_formerr() && packet.len() >= 2 {
                    let id = u16::from_be_bytes([packet[0], packet[1]]);
                    Some(formerr_response(id))
                } else {
                    None
                };
            }
        };
        Some(self.answer(&query).await)
    }

    async fn answer(&self, query: &DnsQuery) -> Vec<u8> {
        let flags = self.interpret_qname(&query.qname);
        let mut builder = ResponseBuilder::new(query);
        let ns_record = super::codec::encode_ns_record(&self.zone, &self.ns_name, self.ns_ttl);
        let soa_record = super::codec::encode_soa_record(
            &self.zone,
            &self.ns_name,
            &self.soa_rname,
            self.ns_ttl,
            self.soa_timers(),
        );

        let Some(flags) = flags else {
            // Not a name we serve (or a non-whitelisted mask): empty answer
            builder.add_authority_record(&soa_record);
            return builder.finish();
        };

        match query.qtype {
            QTYPE_A | QTYPE_AAAA | QTYPE_ANY => {
                let want_v4 = query.qtype != QTYPE_AAAA;
                let want_v6 = query.qtype != QTYPE_A;
                let budget = builder.remaining(ns_record.len());
                for endpoint in self.pick_answers(flags, want_v4, want_v6, budget).await {
                    match endpoint.addr {
                        NetAddr::V4(ip) => builder.add_a(ip, self.data_ttl, ns_record.len()),
                        NetAddr::V6(ip) => builder.add_aaaa(ip, self.data_ttl, ns_record.len()),
                        _ => true,
                    };
                }
                builder.add_authority_record(&ns_record);
                if builder.answer_count() == 0 {
                    builder.add_authority_record(&soa_record);
                }
            }
            QTYPE_NS => {
                builder.add_answer_record(&ns_record);
            }
            QTYPE_SOA => {
                builder.add_answer_record(&soa_record);
                builder.add_authority_record(&ns_record);
            }
            _ => {
                // Supported zone, unsupported type: NOERROR, empty answer
                builder.add_authority_record(&soa_record);
            }
        }
        builder.finish()
    }
}

/// One DNS worker: receive, answer, send. Several workers share the socket;
/// the kernel fans queries out across the blocked `recv_from` calls.
pub async fn dns_worker(
    handler: Arc<DnsHandler>,
    socket: Arc<UdpSocket>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut buf = vec![0u8; 1500];
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
            received = socket.recv_from(&mut buf) => {
                let (len, peer) = match received {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!("dns recv error: {}", e);
                        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                        continue;
                    }
                };
                if let Some(reply) = handler.handle_packet(&buf[..len]).await {
                    if let Err(e) = socket.send_to(&reply, peer).await {
                        debug!("dns send to {} failed: {}", peer, e);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{ProbeResult, MIN_CLIENT_VERSION};
    use crate::net::message::{NODE_NETWORK, NODE_WITNESS};
    use byteorder::{BigEndian, WriteBytesExt};

    fn encode_query(id: u16, qname: &str, qtype: u16) -> Vec<u8> {
        let mut out = Vec::new();
        out.write_u16::<BigEndian>(id).unwrap();
        out.write_u16::<BigEndian>(0x0100).unwrap(); // RD
        out.write_u16::<BigEndian>(1).unwrap();
        for _ in 0..3 {
            out.write_u16::<BigEndian>(0).unwrap();
        }
        for label in qname.split('.') {
            out.push(label.len() as u8);
            out.extend_from_slice(label.as_bytes());
        }
        out.push(0);
        out.write_u16::<BigEndian>(qtype).unwrap();
        out.write_u16::<BigEndian>(1).unwrap();
        out
    }

    fn ancount(reply: &[u8]) -> u16 {
        u16::from_be_bytes([reply[6], reply[7]])
    }

    fn rcode(reply: &[u8]) -> u8 {
        reply[3] & 0x0f
    }

    fn seeded_handler(whitelist: &[u64]) -> DnsHandler {
        let db = Arc::new(AddrDb::default());
        // Three reachable peers advertising NODE_NETWORK|NODE_WITNESS (0x9)
        let endpoints: Vec<Endpoint> = ["8.8.8.8:9265", "1.1.1.1:9265", "9.9.9.9:9265"]
            .iter()
            .map(|s| s.parse().unwrap())
            .collect();
        db.add(&endpoints, true);
        let (batch, _) = db.select_batch(16);
        let results: Vec<ProbeResult> = batch
            .iter()
            .map(|t| ProbeResult {
                endpoint: t.endpoint,
                success: true,
                ban_secs: 0,
                services: NODE_NETWORK | NODE_WITNESS,
                client_version: MIN_CLIENT_VERSION,
                user_agent: "/marks:0.9.7/".into(),
                starting_height: 1,
                neighbors: Vec::new(),
            })
            .collect();
        db.report_batch(&results);

        let config = SeederConfig {
            host: "seed.example.com".into(),
            ns: Some("ns.example.com".into()),
            mbox: Some("admin@example.com".into()),
            filter_whitelist: whitelist.iter().copied().collect(),
            ..Default::default()
        };
        DnsHandler::new(db, &config)
    }

    #[test]
    fn qname_interpretation() {
        let handler = seeded_handler(&[0x9]);
        assert_eq!(handler.interpret_qname("seed.example.com"), Some(0));
        assert_eq!(handler.interpret_qname("SEED.Example.COM"), Some(0));
        assert_eq!(handler.interpret_qname("ns.example.com"), Some(0));
        assert_eq!(handler.interpret_qname("x9.seed.example.com"), Some(0x9));
        assert_eq!(handler.interpret_qname("X9.SEED.EXAMPLE.COM"), Some(0x9));
        // Non-whitelisted mask
        assert_eq!(handler.interpret_qname("x1.seed.example.com"), None);
        // Leading zero is malformed by convention
        assert_eq!(handler.interpret_qname("x0.seed.example.com"), None);
        assert_eq!(handler.interpret_qname("x09.seed.example.com"), None);
        // Too long, not hex, wrong zone
        assert_eq!(handler.interpret_qname("x11111111111111111.seed.example.com"), None);
        assert_eq!(handler.interpret_qname("xzz.seed.example.com"), None);
        assert_eq!(handler.interpret_qname("x9.other.example.com"), None);
        assert_eq!(handler.interpret_qname("example.com"), None);
    }

    #[tokio::test]
    async fn filter_gate() {
        let handler = seeded_handler(&[0x9]);

        // Whitelisted mask with matching peers
        let reply = handler
            .handle_packet(&encode_query(1, "x9.seed.example.com", QTYPE_A))
            .await
            .unwrap();
        assert_eq!(rcode(&reply), 0);
        assert_eq!(ancount(&reply), 3);

        // Mask outside the whitelist: empty
        let reply = handler
            .handle_packet(&encode_query(2, "x1.seed.example.com", QTYPE_A))
            .await
            .unwrap();
        assert_eq!(ancount(&reply), 0);

        // x0 is rejected by the label convention: empty
        let reply = handler
            .handle_packet(&encode_query(3, "x0.seed.example.com", QTYPE_A))
            .await
            .unwrap();
        assert_eq!(ancount(&reply), 0);
    }

    #[tokio::test]
    async fn apex_serves_any_good_peer() {
        let handler = seeded_handler(&[0x9]);
        let reply = handler
            .handle_packet(&encode_query(4, "seed.example.com", QTYPE_A))
            .await
            .unwrap();
        assert_eq!(ancount(&reply), 3);
        assert!(reply.len() <= super::super::codec::MAX_UDP_PAYLOAD);
    }

    #[tokio::test]
    async fn aaaa_and_unsupported_types() {
        let handler = seeded_handler(&[0x9]);
        // Only IPv4 peers seeded: AAAA answer is empty but NOERROR
        let reply = handler
            .handle_packet(&encode_query(5, "seed.example.com", QTYPE_AAAA))
            .await
            .unwrap();
        assert_eq!(rcode(&reply), 0);
        assert_eq!(ancount(&reply), 0);

        // MX (15): NOERROR, empty
        let reply = handler
            .handle_packet(&encode_query(6, "seed.example.com", 15))
            .await
            .unwrap();
        assert_eq!(rcode(&reply), 0);
        assert_eq!(ancount(&reply), 0);

        // NS and SOA answer with one record each
        let reply = handler
            .handle_packet(&encode_query(7, "seed.example.com", QTYPE_NS))
            .await
            .unwrap();
        assert_eq!(ancount(&reply), 1);
        let reply = handler
            .handle_packet(&encode_query(8, "seed.example.com", QTYPE_SOA))
            .await
            .unwrap();
        assert_eq!(ancount(&reply), 1);
    }

    #[tokio::test]
    async fn malformed_packets_get_formerr() {
        let handler = seeded_handler(&[0x9]);
        let mut bytes = encode_query(9, "seed.example.com", QTYPE_A);
        bytes[4..6].copy_from_slice(&2u16.to_be_bytes()); // two questions
        let reply = handler.handle_packet(&bytes).await.unwrap();
        assert_eq!(rcode(&reply), 1);
        assert_eq!(&reply[0..2], &9u16.to_be_bytes());

        // Too short to carry an id: silently dropped
        assert!(handler.handle_packet(&[0x01]).await.is_none());

        // Responses are never answered
        let mut bytes = encode_query(10, "seed.example.com", QTYPE_A);
        bytes[2] |= 0x80;
        assert!(handler.handle_packet(&bytes).await.is_none());
    }

    #[test]
    fn staleness_formula() {
        let policy = CachePolicy::default();

        // Tiny cache: a single hit forces a refresh (400 > 100)
        assert!(policy.is_stale(1, 10, 0, false));
        // Large cache absorbs many hits: 400 < 10_000
        assert!(!policy.is_stale(1, 100, 100, false));
        assert!(policy.is_stale(26, 100, 0, false)); // 10_400 > 10_000
        // Quadratic clause needs the holdoff to pass
        assert!(!policy.is_stale(8, 1000, 3, false)); // 1280 > 1000 but age <= 5
        assert!(policy.is_stale(8, 1000, 6, false));
        // Force wins regardless
        assert!(policy.is_stale(0, 1000, 0, true));
        // No hits, no refresh
        assert!(!policy.is_stale(0, 10, 100, false));
    }

    #[tokio::test]
    async fn cache_refresh_resets_hits() {
        let handler = seeded_handler(&[0x9]);
        // First query populates the cache
        handler
            .handle_packet(&encode_query(1, "seed.example.com", QTYPE_A))
            .await
            .unwrap();
        let after_first = handler.db_queries();
        assert_eq!(after_first, 1);

        // Cache of size 3: every hit satisfies hits*400 > 9, so each query
        // refreshes again; hit counters reset each time.
        handler
            .handle_packet(&encode_query(2, "seed.example.com", QTYPE_A))
            .await
            .unwrap();
        assert_eq!(handler.db_queries(), 2);
        assert_eq!(handler.requests(), 2);
    }
}
