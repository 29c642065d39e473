//! Marks network DNS seeder
//!
//! Crawls the peer-to-peer network, scores reachability, and serves the
//! best peers over authoritative DNS.

use clap::Parser;
use marks_seeder::config::SeederConfig;
use marks_seeder::crawler::{crawler_loop, seeder_loop};
use marks_seeder::db::{AddrDb, MIN_CLIENT_VERSION};
use marks_seeder::dns::{dns_worker, DnsHandler};
use marks_seeder::dump::{dump_once, dumper_loop, DUMP_FILE};
use marks_seeder::net::proxy::{ProxyTable, Route};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "marks-seeder", version, about = "Marks network DNS seeder")]
struct Args {
    /// Hostname of the DNS seed zone
    #[arg(short = 'H', long)]
    host: Option<String>,

    /// Hostname of the nameserver
    #[arg(short = 'n', long)]
    ns: Option<String>,

    /// E-mail address reported in SOA records
    #[arg(short = 'm', long)]
    mbox: Option<String>,

    /// Number of crawlers to run in parallel
    #[arg(short = 't', long = "threads", default_value_t = 96)]
    threads: usize,

    /// Number of DNS server tasks
    #[arg(short = 'd', long = "dnsthreads", default_value_t = 4)]
    dns_threads: usize,

    /// Address to listen on
    #[arg(short = 'a', long = "address", default_value = "::")]
    address: IpAddr,

    /// UDP port to listen on
    #[arg(short = 'p', long = "port", default_value_t = 53)]
    port: u16,

    /// Tor SOCKS5 proxy ip:port for .onion peers
    #[arg(short = 'o', long = "onion")]
    onion: Option<SocketAddr>,

    /// IPv4 SOCKS5 proxy ip:port
    #[arg(short = 'i', long = "proxyipv4")]
    proxy_ipv4: Option<SocketAddr>,

    /// IPv6 SOCKS5 proxy ip:port
    #[arg(short = 'k', long = "proxyipv6")]
    proxy_ipv6: Option<SocketAddr>,

    /// Allowed service-flag filters, comma separated (hex with 0x, or decimal)
    #[arg(short = 'w', long = "filter", value_delimiter = ',')]
    filter: Vec<String>,

    /// Crawl testnet instead of mainnet
    #[arg(long)]
    testnet: bool,

    /// Wipe the list of banned nodes on startup
    #[arg(long)]
    wipeban: bool,

    /// Wipe the list of ignored nodes on startup
    #[arg(long)]
    wipeignore: bool,

    /// Override the bootstrap seed hostnames, comma separated
    #[arg(long, value_delimiter = ',')]
    seeds: Vec<String>,

    /// Directory for dnsseed.dat, dnsseed.dump and dnsstats.log
    #[arg(long, default_value = ".")]
    data_dir: PathBuf,
}

fn parse_filter_mask(s: &str) -> Option<u64> {
    let s = s.trim();
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).ok()
    } else {
        s.parse().ok()
    }
}

fn build_config(args: &Args) -> SeederConfig {
    let mut config = SeederConfig {
        host: args.host.clone().unwrap_or_default(),
        ns: args.ns.clone(),
        mbox: args.mbox.clone(),
        listen_addr: args.address,
        listen_port: args.port,
        crawler_threads: args.threads.clamp(1, 999),
        dns_threads: args.dns_threads.clamp(1, 999),
        tor_proxy: args.onion,
        ipv4_proxy: args.proxy_ipv4,
        ipv6_proxy: args.proxy_ipv6,
        testnet: args.testnet,
        wipe_ban: args.wipeban,
        wipe_ignore: args.wipeignore,
        seeds: args.seeds.clone(),
        ..Default::default()
    };
    let masks: Vec<u64> = args.filter.iter().filter_map(|s| parse_filter_mask(s)).collect();
    if !masks.is_empty() {
        config.filter_whitelist = masks.into_iter().collect();
    }
    config
}

fn load_database(path: &std::path::Path) -> AddrDb {
    match std::fs::File::open(path) {
        Ok(mut file) => match AddrDb::deserialize(&mut file, MIN_CLIENT_VERSION) {
            Ok(db) => {
                info!("loaded {} from {}", DUMP_FILE, path.display());
                db
            }
            Err(e) => {
                warn!("corrupt {} ({}), starting empty", DUMP_FILE, e);
                AddrDb::default()
            }
        },
        Err(_) => {
            info!("no {} found, starting empty", DUMP_FILE);
            AddrDb::default()
        }
    }
}

#[tokio::main]
async fn main() {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("marks_seeder=info".parse().expect("static directive")),
        )
        .init();

    let args = Args::parse();
    let config = Arc::new(build_config(&args));

    if config.dns_enabled() {
        if config.host.is_empty() {
            eprintln!("No seed hostname set. Please use --host.");
            std::process::exit(1);
        }
        if config.mbox.is_none() {
            eprintln!("No e-mail address set. Please use --mbox.");
            std::process::exit(1);
        }
    } else {
        info!("no nameserver set, not starting the DNS server");
    }

    info!(
        "marks-seeder v{} starting on {} (magic {})",
        env!("CARGO_PKG_VERSION"),
        if config.testnet { "testnet" } else { "mainnet" },
        hex::encode(config.magic())
    );
    let mut whitelist: Vec<u64> = config.filter_whitelist.iter().copied().collect();
    whitelist.sort_unstable();
    info!(
        "supporting whitelisted filters: {}",
        whitelist
            .iter()
            .map(|m| format!("0x{:x}", m))
            .collect::<Vec<_>>()
            .join(",")
    );

    let mut proxies = ProxyTable::default();
    if let Some(proxy) = config.tor_proxy {
        info!("using Tor proxy at {}", proxy);
        proxies.onion = Some(proxy);
    }
    if let Some(proxy) = config.ipv4_proxy {
        info!("using IPv4 proxy at {}", proxy);
        proxies.ipv4 = Route::Socks5(proxy);
    }
    if let Some(proxy) = config.ipv6_proxy {
        info!("using IPv6 proxy at {}", proxy);
        proxies.ipv6 = Route::Socks5(proxy);
    }
    let proxies = Arc::new(proxies);

    let db = Arc::new(load_database(&args.data_dir.join(DUMP_FILE)));
    if config.wipe_ban {
        db.ban_wipe();
        info!("wiped banned nodes");
    }
    if config.wipe_ignore {
        db.ignore_wipe();
        info!("wiped ignored nodes");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // DNS workers share one socket; each task blocks on recv_from
    let dns_handler = if config.dns_enabled() {
        let bind = SocketAddr::new(config.listen_addr, config.listen_port);
        let socket = match UdpSocket::bind(bind).await {
            Ok(socket) => Arc::new(socket),
            Err(e) => {
                error!("cannot bind DNS socket on {}: {}", bind, e);
                std::process::exit(1);
            }
        };
        let handler = Arc::new(DnsHandler::new(db.clone(), &config));
        for _ in 0..config.dns_threads {
            tokio::spawn(dns_worker(handler.clone(), socket.clone(), shutdown_rx.clone()));
        }
        info!(
            "started {} DNS tasks for {} on {}",
            config.dns_threads, config.host, bind
        );
        Some(handler)
    } else {
        None
    };

    tokio::spawn(seeder_loop(db.clone(), config.clone(), shutdown_rx.clone()));
    for _ in 0..config.crawler_threads {
        tokio::spawn(crawler_loop(
            db.clone(),
            proxies.clone(),
            config.clone(),
            shutdown_rx.clone(),
        ));
    }
    info!("started {} crawlers", config.crawler_threads);

    tokio::spawn(dumper_loop(db.clone(), args.data_dir.clone(), shutdown_rx.clone()));

    // Status line, the former ncurses monitor
    {
        let db = db.clone();
        let dns_handler = dns_handler.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(30));
            interval.tick().await; // immediate first tick is skipped
            loop {
                interval.tick().await;
                let stats = db.get_stats();
                let stamp = chrono::Local::now().format("[%y-%m-%d %H:%M:%S]");
                let (requests, queries) = dns_handler
                    .as_ref()
                    .map(|h| (h.requests(), h.db_queries()))
                    .unwrap_or((0, 0));
                info!(
                    "{} {}/{} available ({} tried, {} new, {} active), {} banned; {} DNS requests, {} db queries",
                    stamp,
                    stats.good,
                    stats.known,
                    stats.tracked,
                    stats.fresh,
                    stats.in_flight,
                    stats.banned,
                    requests,
                    queries
                );
            }
        });
    }

    // Signal-driven shutdown: stop the loops, flush one last dump
    tokio::signal::ctrl_c().await.ok();
    info!("shutting down");
    shutdown_tx.send(true).ok();
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    if let Err(e) = dump_once(&db, &args.data_dir) {
        warn!("final dump failed: {}", e);
    }
    info!("bye");
}
