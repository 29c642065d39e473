//! Crawler worker pool and the bootstrap seeder task

use crate::config::SeederConfig;
use crate::db::{AddrDb, ProbeResult};
use crate::net::addr::Endpoint;
use crate::net::message::WireAddr;
use crate::net::probe::probe_peer;
use crate::net::proxy::ProxyTable;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Records pulled per select call.
const BATCH_SIZE: usize = 16;

/// Bootstrap hostnames are re-resolved this often.
const SEED_INTERVAL: Duration = Duration::from_secs(1800);

/// One crawler worker. Pulls a batch, probes every record concurrently,
/// reports all outcomes, then feeds harvested addresses back. The report
/// runs for every selected record on every path, so nothing stays in
/// flight.
pub async fn crawler_loop(
    db: Arc<AddrDb>,
    proxies: Arc<ProxyTable>,
    config: Arc<SeederConfig>,
    mut shutdown: watch::Receiver<bool>,
) {
    let magic = config.magic();
    let user_agent = config.user_agent();
    loop {
        if *shutdown.borrow() {
            return;
        }
        let (batch, wait) = db.select_batch(BATCH_SIZE);
        if batch.is_empty() {
            let jitter: f64 = rand::thread_rng().gen_range(0.0..0.5);
            let idle = Duration::from_secs_f64(wait as f64 * (1.0 + jitter));
            tokio::select! {
                _ = shutdown.changed() => {}
                _ = tokio::time::sleep(idle) => {}
            }
            continue;
        }

        let probes = batch
            .iter()
            .map(|ticket| probe_peer(proxies.as_ref(), magic, &user_agent, ticket));
        let results: Vec<ProbeResult> = futures::future::join_all(probes).await;

        let neighbors: Vec<WireAddr> = results
            .iter()
            .flat_map(|r| r.neighbors.iter().copied())
            .collect();
        let reachable = results.iter().filter(|r| r.success).count();
        db.report_batch(&results);
        let added = db.add_gossiped(&neighbors);
        debug!(
            "batch done: {}/{} reachable, {} gossiped, {} new",
            reachable,
            results.len(),
            neighbors.len(),
            added
        );
    }
}

/// Re-resolves the fixed bootstrap hostnames and inserts the results as
/// trusted records.
pub async fn seeder_loop(
    db: Arc<AddrDb>,
    config: Arc<SeederConfig>,
    mut shutdown: watch::Receiver<bool>,
) {
    let port = config.p2p_port();
    let seeds = config.bootstrap_seeds();
    loop {
        if *shutdown.borrow() {
            return;
        }
        let mut found: Vec<Endpoint> = Vec::new();
        for seed in &seeds {
            match tokio::net::lookup_host((seed.as_str(), port)).await {
                Ok(addrs) => {
                    let before = found.len();
                    found.extend(addrs.map(Endpoint::from_socket_addr));
                    debug!("resolved {} addresses from {}", found.len() - before, seed);
                }
                Err(e) => warn!("failed to resolve {}: {}", seed, e),
            }
        }
        found.sort();
        found.dedup();
        let added = db.add(&found, true);
        if added > 0 {
            info!("bootstrap added {} new endpoints", added);
        }
        tokio::select! {
            _ = shutdown.changed() => {}
            _ = tokio::time::sleep(SEED_INTERVAL) => {}
        }
    }
}
