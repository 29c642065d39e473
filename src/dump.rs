//! Periodic persistence: binary dump, report table, stats log

use crate::db::{AddrDb, ReportRow};
use crate::types::now;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, warn};

pub const DUMP_FILE: &str = "dnsseed.dat";
pub const REPORT_FILE: &str = "dnsseed.dump";
pub const STATS_LOG_FILE: &str = "dnsstats.log";

/// Dumper task. Sleeps 100 s, 200 s, 400 s, 800 s, 1600 s, then 3200 s
/// forever; a failed cycle is logged and skipped, never fatal.
pub async fn dumper_loop(db: Arc<AddrDb>, dir: std::path::PathBuf, mut shutdown: watch::Receiver<bool>) {
    let mut cycle = 0u32;
    loop {
        let delay = std::time::Duration::from_secs(100u64 << cycle);
        if cycle < 5 {
            cycle += 1;
        }
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
            _ = tokio::time::sleep(delay) => {}
        }
        if let Err(e) = dump_once(&db, &dir) {
            warn!("dump cycle skipped: {}", e);
        }
    }
}

/// One full dump cycle: binary state, report table, stats line.
pub fn dump_once(db: &AddrDb, dir: &Path) -> io::Result<()> {
    write_dump(db, dir)?;
    let mut rows = db.report_rows();
    sort_report(&mut rows);
    write_report(&rows, dir)?;
    append_stats(&rows, dir)?;
    debug!("dumped {} records", rows.len());
    Ok(())
}

/// Serialize into `dnsseed.dat.new`, then rename over the canonical path so
/// a crash never leaves a half-written dump.
fn write_dump(db: &AddrDb, dir: &Path) -> io::Result<()> {
    let tmp = dir.join(format!("{}.new", DUMP_FILE));
    let target = dir.join(DUMP_FILE);
    {
        let mut writer = BufWriter::new(File::create(&tmp)?);
        db.serialize(&mut writer)?;
        writer.flush()?;
    }
    fs::rename(&tmp, &target)
}

/// Best peers first: 30-day uptime, then 7-day, then client version.
fn sort_report(rows: &mut [ReportRow]) {
    rows.sort_by(|a, b| {
        b.uptime[4]
            .total_cmp(&a.uptime[4])
            .then(b.uptime[3].total_cmp(&a.uptime[3]))
            .then(b.client_version.cmp(&a.client_version))
    });
}

fn write_report(rows: &[ReportRow], dir: &Path) -> io::Result<()> {
    let mut out = BufWriter::new(File::create(dir.join(REPORT_FILE))?);
    writeln!(
        out,
        "# address                                        good  lastSuccess    %(2h)   %(8h)   %(1d)   %(7d)  %(30d)  blocks      svcs  version"
    )?;
    for row in rows {
        writeln!(
            out,
            "{:<47}  {:4}  {:11}  {:6.2}% {:6.2}% {:6.2}% {:6.2}% {:6.2}%  {:6}  {:08x}  {:5} \"{}\"",
            row.endpoint.to_string(),
            row.good as u8,
            row.last_success,
            100.0 * row.uptime[0],
            100.0 * row.uptime[1],
            100.0 * row.uptime[2],
            100.0 * row.uptime[3],
            100.0 * row.uptime[4],
            row.starting_height,
            row.services,
            row.client_version,
            row.client_sub_version,
        )?;
    }
    out.flush()
}

/// One appended line per cycle: timestamp and the summed uptime ratios per
/// window.
fn append_stats(rows: &[ReportRow], dir: &Path) -> io::Result<()> {
    let mut sums = [0.0f64; 5];
    for row in rows {
        for (sum, value) in sums.iter_mut().zip(row.uptime) {
            *sum += value;
        }
    }
    let mut out = OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join(STATS_LOG_FILE))?;
    writeln!(
        out,
        "{} {} {} {} {} {}",
        now(),
        sums[0],
        sums[1],
        sums[2],
        sums[3],
        sums[4]
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{ProbeResult, MIN_CLIENT_VERSION};
    use crate::net::addr::Endpoint;
    use crate::net::message::NODE_NETWORK;

    fn seeded_db() -> AddrDb {
        let db = AddrDb::default();
        let endpoints: Vec<Endpoint> = ["8.8.8.8:9265", "1.1.1.1:9265"]
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
                services: NODE_NETWORK,
                client_version: MIN_CLIENT_VERSION,
                user_agent: "/marks:0.9.7/".into(),
                starting_height: 42,
                neighbors: Vec::new(),
            })
            .collect();
        db.report_batch(&results);
        db
    }

    #[test]
    fn dump_cycle_writes_all_files() {
        let dir = tempfile::tempdir().unwrap();
        let db = seeded_db();
        dump_once(&db, dir.path()).unwrap();

        let dump_path = dir.path().join(DUMP_FILE);
        assert!(dump_path.exists());
        assert!(!dir.path().join(format!("{}.new", DUMP_FILE)).exists());

        // The dump loads back with identical stats
        let mut file = File::open(&dump_path).unwrap();
        let restored = AddrDb::deserialize(&mut file, MIN_CLIENT_VERSION).unwrap();
        assert_eq!(restored.get_stats(), db.get_stats());

        let report = fs::read_to_string(dir.path().join(REPORT_FILE)).unwrap();
        assert!(report.starts_with('#'));
        assert_eq!(report.lines().count(), 3);
        assert!(report.contains("8.8.8.8:9265"));

        let stats = fs::read_to_string(dir.path().join(STATS_LOG_FILE)).unwrap();
        let fields: Vec<&str> = stats.lines().next().unwrap().split_whitespace().collect();
        assert_eq!(fields.len(), 6);

        // A second cycle appends another stats line
        dump_once(&db, dir.path()).unwrap();
        let stats = fs::read_to_string(dir.path().join(STATS_LOG_FILE)).unwrap();
        assert_eq!(stats.lines().count(), 2);
    }

    #[test]
    fn report_sorts_best_first() {
        let mut rows = vec![
            ReportRow {
                endpoint: "1.1.1.1:9265".parse().unwrap(),
                good: false,
                last_success: 0,
                uptime: [0.0, 0.0, 0.0, 0.1, 0.2],
                starting_height: 0,
                services: 0,
                client_version: 1,
                client_sub_version: String::new(),
            },
            ReportRow {
                endpoint: "8.8.8.8:9265".parse().unwrap(),
                good: true,
                last_success: 10,
                uptime: [1.0, 1.0, 1.0, 1.0, 0.9],
                starting_height: 0,
                services: 0,
                client_version: 2,
                client_sub_version: String::new(),
            },
        ];
        sort_report(&mut rows);
        assert_eq!(rows[0].endpoint.to_string(), "8.8.8.8:9265");
    }
}
