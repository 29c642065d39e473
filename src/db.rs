//! Address database: peer tracking, reliability stats, selection, bans,
//! persistence

use crate::net::addr::{Endpoint, NetAddr};
use crate::net::message::WireAddr;
use crate::types::now;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::collections::{HashMap, HashSet, VecDeque};
use std::io::{self, Read, Write};
use std::sync::Mutex;
use tracing::{debug, warn};

/// Dump file format version.
const DUMP_VERSION: u32 = 1;

/// Retry staircase: first delay after an attempt.
const MIN_RETRY_DELAY: u64 = 60;

/// Retry staircase cap.
const MAX_RETRY_DELAY: u64 = 86_400;

/// Sustained-failure ban threshold: this many consecutive failures...
const BAN_AFTER_FAILURES: u32 = 100;

/// ...spread over at least this long.
const BAN_FAILURE_SPAN: u64 = 7 * 86_400;

/// Ban duration for sustained failure.
const SUSTAINED_FAILURE_BAN: u64 = 30 * 86_400;

/// A never-successful record is ignored after this many failures.
const IGNORE_AFTER_FAILURES: u32 = 10;

/// `last_success` horizon for DNS eligibility.
const GOOD_HORIZON: u64 = 30 * 86_400;

/// 8-hour uptime bar for DNS eligibility.
const GOOD_MIN_UPTIME: f64 = 0.85;

/// Oldest client version still served over DNS.
pub const MIN_CLIENT_VERSION: i32 = 70001;

/// Suggested crawler wait when nothing is due.
const DEFAULT_WAIT: u64 = 5;

/// Reliability windows: 2 h, 8 h, 1 d, 7 d, 30 d.
pub const UPTIME_WINDOWS: [u64; 5] = [7_200, 28_800, 86_400, 604_800, 2_592_000];

/// Exponentially decayed success estimator over one window.
///
/// `f = exp(-age/tau)` per update; the exposed ratio `reliability/weight`
/// stays in [0, 1] and converges toward the recent success rate with a
/// half-life matching the window.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ReliabilityEstimator {
    weight: f64,
    count: f64,
    reliability: f64,
}

impl ReliabilityEstimator {
    pub fn update(&mut self, good: bool, age_secs: f64, tau_secs: f64) {
        let f = (-age_secs / tau_secs).exp();
        self.reliability = self.reliability * f + if good { 1.0 - f } else { 0.0 };
        self.count = self.count * f + 1.0;
        self.weight = self.weight * f + (1.0 - f);
    }

    pub fn ratio(&self) -> f64 {
        if self.weight > 1e-9 {
            (self.reliability / self.weight).clamp(0.0, 1.0)
        } else {
            0.0
        }
    }
}

/// One tracked peer.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerRecord {
    pub endpoint: Endpoint,
    pub services: u64,
    pub last_try: u64,
    pub last_success: u64,
    pub last_good: u64,
    pub client_version: i32,
    pub client_sub_version: String,
    pub starting_height: i32,
    pub ban_until: u64,
    pub uptime: [ReliabilityEstimator; 5],
    pub total_attempts: u32,
    pub total_successes: u32,
    pub consecutive_failures: u32,
    pub failure_since: u64,
    pub ignore: bool,
    /// Inserted from the bootstrap list; exempt from group throttling.
    pub trusted: bool,
    /// Held by a crawler right now. Never serialized.
    pub in_flight: bool,
}

impl PeerRecord {
    fn new(endpoint: Endpoint, trusted: bool) -> Self {
        Self {
            endpoint,
            services: 0,
            last_try: 0,
            last_success: 0,
            last_good: 0,
            client_version: 0,
            client_sub_version: String::new(),
            starting_height: 0,
            ban_until: 0,
            uptime: Default::default(),
            total_attempts: 0,
            total_successes: 0,
            consecutive_failures: 0,
            failure_since: 0,
            ignore: false,
            trusted,
            in_flight: false,
        }
    }

    /// Next-retry delay: 60 s after the first failure, doubling to a 24 h
    /// cap, reset by success.
    pub fn retry_delay(&self) -> u64 {
        let shift = self.consecutive_failures.min(16);
        (MIN_RETRY_DELAY << shift).min(MAX_RETRY_DELAY)
    }

    fn is_due(&self, at: u64) -> bool {
        if self.ignore || self.in_flight {
            return false;
        }
        if self.last_try == 0 {
            return true;
        }
        at.saturating_sub(self.last_try) >= self.retry_delay()
    }

    fn is_good(&self, at: u64, min_version: i32) -> bool {
        self.last_success != 0
            && at.saturating_sub(self.last_success) <= GOOD_HORIZON
            && self.uptime[1].ratio() >= GOOD_MIN_UPTIME
            && self.client_version >= min_version
            && self.endpoint.is_routable()
    }
}

/// Work item handed to a crawler; `last_success` decides whether the probe
/// sends `getaddr`.
#[derive(Debug, Clone, Copy)]
pub struct ProbeTicket {
    pub endpoint: Endpoint,
    pub last_success: u64,
}

/// What a probe produced; consumed by [`AddrDb::report_batch`].
#[derive(Debug, Clone)]
pub struct ProbeResult {
    pub endpoint: Endpoint,
    pub success: bool,
    /// Nonzero requests an immediate ban for that many seconds.
    pub ban_secs: u64,
    pub services: u64,
    pub client_version: i32,
    pub user_agent: String,
    pub starting_height: i32,
    pub neighbors: Vec<WireAddr>,
}

impl ProbeResult {
    pub fn failure(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            success: false,
            ban_secs: 0,
            services: 0,
            client_version: 0,
            user_agent: String::new(),
            starting_height: 0,
            neighbors: Vec::new(),
        }
    }
}

/// Summary counters for the status line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DbStats {
    pub known: usize,
    pub good: usize,
    pub tracked: usize,
    pub fresh: usize,
    pub in_flight: usize,
    pub banned: usize,
}

/// One row of the human-readable report.
#[derive(Debug, Clone)]
pub struct ReportRow {
    pub endpoint: Endpoint,
    pub good: bool,
    pub last_success: u64,
    pub uptime: [f64; 5],
    pub starting_height: i32,
    pub services: u64,
    pub client_version: i32,
    pub client_sub_version: String,
}

struct DbInner {
    records: HashMap<u32, PeerRecord>,
    index: HashMap<Endpoint, u32>,
    /// Never-tried records, probed first.
    fresh_queue: VecDeque<u32>,
    /// Tried records on a rotating cursor.
    tracked_queue: VecDeque<u32>,
    banned: HashMap<Endpoint, u64>,
    next_id: u32,
}

impl DbInner {
    fn empty() -> Self {
        Self {
            records: HashMap::new(),
            index: HashMap::new(),
            fresh_queue: VecDeque::new(),
            tracked_queue: VecDeque::new(),
            banned: HashMap::new(),
            next_id: 0,
        }
    }

    fn ban(&mut self, id: u32, until: u64) {
        if let Some(record) = self.records.remove(&id) {
            debug!("banning {} until {}", record.endpoint, until);
            self.index.remove(&record.endpoint);
            self.banned.insert(record.endpoint, until);
        }
        self.fresh_queue.retain(|&q| q != id);
        self.tracked_queue.retain(|&q| q != id);
    }
}

/// The address database. One writer-at-a-time over a single mutex; none of
/// the critical sections perform I/O or await.
pub struct AddrDb {
    inner: Mutex<DbInner>,
    min_client_version: i32,
}

impl Default for AddrDb {
    fn default() -> Self {
        Self::new(MIN_CLIENT_VERSION)
    }
}

impl AddrDb {
    pub fn new(min_client_version: i32) -> Self {
        Self {
            inner: Mutex::new(DbInner::empty()),
            min_client_version,
        }
    }

    /// Insert endpoints not yet known; returns how many were new. Bootstrap
    /// insertions (`from_dns`) are marked trusted.
    pub fn add(&self, endpoints: &[Endpoint], from_dns: bool) -> usize {
        let mut inner = self.inner.lock().expect("db lock");
        let at = now();
        let mut added = 0;
        for ep in endpoints {
            if ep.port == 0 || !ep.is_routable() {
                continue;
            }
            if let Some(until) = inner.banned.get(ep).copied() {
                if until > at {
                    continue;
                }
                inner.banned.remove(ep);
            }
            if let Some(id) = inner.index.get(ep).copied() {
                if from_dns && let Some(record) = inner.records.get_mut(&id) {
                    record.trusted = true;
                }
                continue;
            }
            let id = inner.next_id;
            inner.next_id += 1;
            inner.records.insert(id, PeerRecord::new(*ep, from_dns));
            inner.index.insert(*ep, id);
            inner.fresh_queue.push_back(id);
            added += 1;
        }
        added
    }

    /// Convenience for harvested gossip: addresses only, services unverified
    /// until we probe them ourselves.
    pub fn add_gossiped(&self, addrs: &[WireAddr]) -> usize {
        let endpoints: Vec<Endpoint> = addrs.iter().map(|a| a.endpoint).collect();
        self.add(&endpoints, false)
    }

    /// Pull up to `limit` due records, marking each in flight. Never-tried
    /// records go first; tried records rotate on a cursor. No two untrusted
    /// records in one batch share a group key. Returns the batch and a
    /// suggested wait (seconds) when the batch is empty.
    pub fn select_batch(&self, limit: usize) -> (Vec<ProbeTicket>, u64) {
        let mut inner = self.inner.lock().expect("db lock");
        let at = now();
        let mut batch = Vec::with_capacity(limit);
        let mut groups = HashSet::new();
        let mut earliest_due: Option<u64> = None;

        for _ in 0..inner.fresh_queue.len() {
            if batch.len() >= limit {
                break;
            }
            let Some(id) = inner.fresh_queue.pop_front() else { break };
            let Some(record) = inner.records.get(&id) else { continue };
            if !record.is_due(at)
                || (!record.trusted && !groups.insert(record.endpoint.group_key()))
            {
                inner.fresh_queue.push_back(id);
                continue;
            }
            let ticket = ProbeTicket {
                endpoint: record.endpoint,
                last_success: record.last_success,
            };
            if let Some(record) = inner.records.get_mut(&id) {
                record.in_flight = true;
            }
            batch.push(ticket);
        }

        for _ in 0..inner.tracked_queue.len() {
            if batch.len() >= limit {
                break;
            }
            let Some(id) = inner.tracked_queue.pop_front() else { break };
            let Some(record) = inner.records.get(&id) else { continue };
            if record.ignore || record.in_flight {
                inner.tracked_queue.push_back(id);
                continue;
            }
            let due_at = record.last_try.saturating_add(record.retry_delay());
            if due_at > at {
                earliest_due = Some(earliest_due.map_or(due_at, |e| e.min(due_at)));
                inner.tracked_queue.push_back(id);
                continue;
            }
            if !record.trusted && !groups.insert(record.endpoint.group_key()) {
                inner.tracked_queue.push_back(id);
                continue;
            }
            let ticket = ProbeTicket {
                endpoint: record.endpoint,
                last_success: record.last_success,
            };
            if let Some(record) = inner.records.get_mut(&id) {
                record.in_flight = true;
            }
            batch.push(ticket);
        }

        let wait = if batch.is_empty() {
            earliest_due
                .map(|t| t.saturating_sub(at).clamp(1, 30))
                .unwrap_or(DEFAULT_WAIT)
        } else {
            0
        };
        (batch, wait)
    }

    /// Deposit probe outcomes. Always clears `in_flight`; applies uptime
    /// updates, success fields, and the ban/ignore policies.
    pub fn report_batch(&self, results: &[ProbeResult]) {
        let mut inner = self.inner.lock().expect("db lock");
        let at = now();
        for result in results {
            let Some(id) = inner.index.get(&result.endpoint).copied() else {
                continue;
            };
            let (ban_until, was_in_flight) = {
                let Some(record) = inner.records.get_mut(&id) else { continue };
                let was_in_flight = record.in_flight;
                if !was_in_flight {
                    warn!("report for {} which is not in flight", result.endpoint);
                }
                record.in_flight = false;

                let age = if record.last_try == 0 {
                    MIN_RETRY_DELAY
                } else {
                    at.saturating_sub(record.last_try)
                };
                for (stat, window) in record.uptime.iter_mut().zip(UPTIME_WINDOWS) {
                    stat.update(result.success, age as f64, window as f64);
                }
                record.last_try = at;
                record.total_attempts += 1;

                if result.success {
                    record.last_success = at;
                    record.total_successes += 1;
                    record.consecutive_failures = 0;
                    record.failure_since = 0;
                    record.services = result.services;
                    record.client_version = result.client_version;
                    record.client_sub_version = result.user_agent.clone();
                    record.starting_height = result.starting_height;
                    if record.is_good(at, self.min_client_version) {
                        record.last_good = at;
                    }
                } else {
                    if record.consecutive_failures == 0 {
                        record.failure_since = at;
                    }
                    record.consecutive_failures += 1;
                }

                let ban_until = if result.ban_secs > 0 {
                    at.saturating_add(result.ban_secs)
                } else if !result.success
                    && record.consecutive_failures >= BAN_AFTER_FAILURES
                    && at.saturating_sub(record.failure_since) >= BAN_FAILURE_SPAN
                {
                    at.saturating_add(SUSTAINED_FAILURE_BAN)
                } else {
                    0
                };

                if ban_until == 0
                    && !result.success
                    && record.last_success == 0
                    && record.consecutive_failures >= IGNORE_AFTER_FAILURES
                {
                    record.ignore = true;
                }
                (ban_until, was_in_flight)
            };

            if ban_until > 0 {
                inner.ban(id, ban_until);
            } else if was_in_flight {
                // A record that was never selected is still queued somewhere.
                inner.tracked_queue.push_back(id);
            }
        }
    }

    /// Good endpoints advertising every bit of `flags`, at most one per
    /// group key, capped at `limit`. Only IP families are eligible (DNS
    /// cannot carry onion addresses).
    pub fn snapshot_for_flags(
        &self,
        flags: u64,
        limit: usize,
        ipv4: bool,
        ipv6: bool,
    ) -> Vec<Endpoint> {
        let inner = self.inner.lock().expect("db lock");
        let at = now();
        let mut by_group: HashMap<_, Endpoint> = HashMap::new();
        for record in inner.records.values() {
            let wanted = match record.endpoint.addr {
                NetAddr::V4(_) => ipv4,
                NetAddr::V6(_) => ipv6,
                _ => false,
            };
            if !wanted
                || record.ignore
                || record.services & flags != flags
                || !record.is_good(at, self.min_client_version)
            {
                continue;
            }
            by_group
                .entry(record.endpoint.group_key())
                .or_insert(record.endpoint);
        }
        by_group.into_values().take(limit).collect()
    }

    pub fn get_stats(&self) -> DbStats {
        let inner = self.inner.lock().expect("db lock");
        let at = now();
        let mut stats = DbStats {
            known: inner.records.len(),
            banned: inner.banned.len(),
            ..Default::default()
        };
        for record in inner.records.values() {
            if record.last_try == 0 {
                stats.fresh += 1;
            } else {
                stats.tracked += 1;
            }
            if record.in_flight {
                stats.in_flight += 1;
            }
            if record.is_good(at, self.min_client_version) {
                stats.good += 1;
            }
        }
        stats
    }

    /// Operator reset: clear the banned table.
    pub fn ban_wipe(&self) {
        let mut inner = self.inner.lock().expect("db lock");
        let wiped = inner.banned.len();
        inner.banned.clear();
        debug!("wiped {} bans", wiped);
    }

    /// Operator reset: clear ignore flags.
    pub fn ignore_wipe(&self) {
        let mut inner = self.inner.lock().expect("db lock");
        let mut wiped = 0;
        for record in inner.records.values_mut() {
            if record.ignore {
                record.ignore = false;
                record.consecutive_failures = 0;
                wiped += 1;
            }
        }
        debug!("wiped {} ignores", wiped);
    }

    /// Rows for the report file, cloned under the lock.
    pub fn report_rows(&self) -> Vec<ReportRow> {
        let inner = self.inner.lock().expect("db lock");
        let at = now();
        inner
            .records
            .values()
            .map(|record| ReportRow {
                endpoint: record.endpoint,
                good: record.is_good(at, self.min_client_version),
                last_success: record.last_success,
                uptime: [
                    record.uptime[0].ratio(),
                    record.uptime[1].ratio(),
                    record.uptime[2].ratio(),
                    record.uptime[3].ratio(),
                    record.uptime[4].ratio(),
                ],
                starting_height: record.starting_height,
                services: record.services,
                client_version: record.client_version,
                client_sub_version: record.client_sub_version.clone(),
            })
            .collect()
    }

    // =========================================================================
    // PERSISTENCE
    // =========================================================================

    /// Serialize the full state. The record table is cloned under the lock
    /// and encoded outside it so writers are not blocked by file I/O.
    pub fn serialize<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        let (records, banned) = {
            let inner = self.inner.lock().expect("db lock");
            let mut records: Vec<PeerRecord> = inner.records.values().cloned().collect();
            records.sort_by_key(|r| r.endpoint);
            let mut banned: Vec<(Endpoint, u64)> =
                inner.banned.iter().map(|(ep, &t)| (*ep, t)).collect();
            banned.sort_by_key(|(ep, _)| *ep);
            (records, banned)
        };

        writer.write_u32::<LittleEndian>(DUMP_VERSION)?;
        writer.write_u32::<LittleEndian>(records.len() as u32)?;
        for record in &records {
            write_endpoint(writer, &record.endpoint)?;
            writer.write_u64::<LittleEndian>(record.services)?;
            writer.write_u64::<LittleEndian>(record.last_try)?;
            writer.write_u64::<LittleEndian>(record.last_success)?;
            writer.write_u64::<LittleEndian>(record.last_good)?;
            writer.write_i32::<LittleEndian>(record.client_version)?;
            write_string(writer, &record.client_sub_version)?;
            writer.write_i32::<LittleEndian>(record.starting_height)?;
            writer.write_u64::<LittleEndian>(record.ban_until)?;
            for stat in &record.uptime {
                writer.write_f64::<LittleEndian>(stat.weight)?;
                writer.write_f64::<LittleEndian>(stat.count)?;
                writer.write_f64::<LittleEndian>(stat.reliability)?;
            }
            writer.write_u32::<LittleEndian>(record.total_attempts)?;
            writer.write_u32::<LittleEndian>(record.total_successes)?;
            writer.write_u32::<LittleEndian>(record.consecutive_failures)?;
            writer.write_u64::<LittleEndian>(record.failure_since)?;
            writer.write_u8(record.ignore as u8)?;
            writer.write_u8(record.trusted as u8)?;
        }
        writer.write_u32::<LittleEndian>(banned.len() as u32)?;
        for (endpoint, until) in &banned {
            write_endpoint(writer, endpoint)?;
            writer.write_u64::<LittleEndian>(*until)?;
        }
        Ok(())
    }

    /// Restore a dump produced by [`serialize`](Self::serialize).
    pub fn deserialize<R: Read>(reader: &mut R, min_client_version: i32) -> io::Result<Self> {
        let version = reader.read_u32::<LittleEndian>()?;
        if version != DUMP_VERSION {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unsupported dump version {}", version),
            ));
        }
        let mut inner = DbInner::empty();
        let n_records = reader.read_u32::<LittleEndian>()?;
        for _ in 0..n_records {
            let endpoint = read_endpoint(reader)?;
            let mut record = PeerRecord::new(endpoint, false);
            record.services = reader.read_u64::<LittleEndian>()?;
            record.last_try = reader.read_u64::<LittleEndian>()?;
            record.last_success = reader.read_u64::<LittleEndian>()?;
            record.last_good = reader.read_u64::<LittleEndian>()?;
            record.client_version = reader.read_i32::<LittleEndian>()?;
            record.client_sub_version = read_string(reader)?;
            record.starting_height = reader.read_i32::<LittleEndian>()?;
            record.ban_until = reader.read_u64::<LittleEndian>()?;
            for stat in record.uptime.iter_mut() {
                stat.weight = reader.read_f64::<LittleEndian>()?;
                stat.count = reader.read_f64::<LittleEndian>()?;
                stat.reliability = reader.read_f64::<LittleEndian>()?;
            }
            record.total_attempts = reader.read_u32::<LittleEndian>()?;
            record.total_successes = reader.read_u32::<LittleEndian>()?;
            record.consecutive_failures = reader.read_u32::<LittleEndian>()?;
            record.failure_since = reader.read_u64::<LittleEndian>()?;
            record.ignore = reader.read_u8()? != 0;
            record.trusted = reader.read_u8()? != 0;

            if inner.index.contains_key(&endpoint) {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "duplicate endpoint in dump",
                ));
            }
            let id = inner.next_id;
            inner.next_id += 1;
            if record.last_try == 0 {
                inner.fresh_queue.push_back(id);
            } else {
                inner.tracked_queue.push_back(id);
            }
            inner.index.insert(endpoint, id);
            inner.records.insert(id, record);
        }
        let n_banned = reader.read_u32::<LittleEndian>()?;
        for _ in 0..n_banned {
            let endpoint = read_endpoint(reader)?;
            let until = reader.read_u64::<LittleEndian>()?;
            inner.banned.insert(endpoint, until);
        }
        Ok(Self {
            inner: Mutex::new(inner),
            min_client_version,
        })
    }

    #[cfg(test)]
    pub(crate) fn record(&self, endpoint: &Endpoint) -> Option<PeerRecord> {
        let inner = self.inner.lock().expect("db lock");
        let id = inner.index.get(endpoint)?;
        inner.records.get(id).cloned()
    }
}

const ADDR_KIND_V4: u8 = 1;
const ADDR_KIND_V6: u8 = 2;
const ADDR_KIND_ONION_V2: u8 = 3;
const ADDR_KIND_ONION_V3: u8 = 4;

fn write_endpoint<W: Write>(writer: &mut W, endpoint: &Endpoint) -> io::Result<()> {
    match endpoint.addr {
        NetAddr::V4(v4) => {
            writer.write_u8(ADDR_KIND_V4)?;
            writer.write_all(&v4.octets())?;
        }
        NetAddr::V6(v6) => {
            writer.write_u8(ADDR_KIND_V6)?;
            writer.write_all(&v6.octets())?;
        }
        NetAddr::OnionV2(bytes) => {
            writer.write_u8(ADDR_KIND_ONION_V2)?;
            writer.write_all(&bytes)?;
        }
        NetAddr::OnionV3(bytes) => {
            writer.write_u8(ADDR_KIND_ONION_V3)?;
            writer.write_all(&bytes)?;
        }
    }
    writer.write_u16::<LittleEndian>(endpoint.port)
}

fn read_endpoint<R: Read>(reader: &mut R) -> io::Result<Endpoint> {
    let kind = reader.read_u8()?;
    let addr = match kind {
        ADDR_KIND_V4 => {
            let mut bytes = [0u8; 4];
            reader.read_exact(&mut bytes)?;
            NetAddr::V4(bytes.into())
        }
        ADDR_KIND_V6 => {
            let mut bytes = [0u8; 16];
            reader.read_exact(&mut bytes)?;
            NetAddr::V6(bytes.into())
        }
        ADDR_KIND_ONION_V2 => {
            let mut bytes = [0u8; 10];
            reader.read_exact(&mut bytes)?;
            NetAddr::OnionV2(bytes)
        }
        ADDR_KIND_ONION_V3 => {
            let mut bytes = [0u8; 32];
            reader.read_exact(&mut bytes)?;
            NetAddr::OnionV3(bytes)
        }
        other => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown address kind {}", other),
            ))
        }
    };
    let port = reader.read_u16::<LittleEndian>()?;
    Ok(Endpoint::new(addr, port))
}

fn write_string<W: Write>(writer: &mut W, s: &str) -> io::Result<()> {
    let bytes = s.as_bytes();
    writer.write_u32::<LittleEndian>(bytes.len() as u32)?;
    writer.write_all(bytes)
}

fn read_string<R: Read>(reader: &mut R) -> io::Result<String> {
    let len = reader.read_u32::<LittleEndian>()? as usize;
    if len > 1024 {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "string too long"));
    }
    let mut bytes = vec![0u8; len];
    reader.read_exact(&mut bytes)?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}
