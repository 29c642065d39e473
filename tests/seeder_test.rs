//! End-to-end seeder scenarios against the library API

use marks_seeder::config::SeederConfig;
use marks_seeder::db::{AddrDb, ProbeResult, ProbeTicket, MIN_CLIENT_VERSION};
use marks_seeder::dns::{dns_worker, DnsHandler};
use marks_seeder::dump::{dump_once, DUMP_FILE, REPORT_FILE, STATS_LOG_FILE};
use marks_seeder::net::addr::Endpoint;
use marks_seeder::net::message::{
    recv_message, send_message, Message, VersionMessage, MAINNET_MAGIC, NODE_NETWORK,
    NODE_WITNESS, WireAddr,
};
use marks_seeder::net::probe::probe_peer;
use marks_seeder::net::proxy::ProxyTable;
use std::sync::Arc;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::watch;

fn ep(s: &str) -> Endpoint {
    s.parse().unwrap()
}

fn success(endpoint: Endpoint) -> ProbeResult {
    ProbeResult {
        endpoint,
        success: true,
        ban_secs: 0,
        services: NODE_NETWORK | NODE_WITNESS,
        client_version: MIN_CLIENT_VERSION,
        user_agent: "/marks:0.9.7/".into(),
        starting_height: 700_000,
        neighbors: Vec::new(),
    }
}

/// Run select/report rounds until nothing more is due.
fn crawl(db: &AddrDb, make: impl Fn(Endpoint) -> ProbeResult) {
    loop {
        let (batch, _) = db.select_batch(1000);
        if batch.is_empty() {
            return;
        }
        let results: Vec<ProbeResult> = batch.iter().map(|t| make(t.endpoint)).collect();
        db.report_batch(&results);
    }
}

#[test]
fn bootstrap_three_peers_and_dump() {
    let dir = tempfile::tempdir().unwrap();
    let db = AddrDb::default();
    let endpoints = vec![ep("8.8.8.8:9265"), ep("1.1.1.1:9265"), ep("9.9.9.9:9265")];
    assert_eq!(db.add(&endpoints, true), 3);

    crawl(&db, success);

    dump_once(&db, dir.path()).unwrap();
    assert!(dir.path().join(REPORT_FILE).exists());
    assert!(dir.path().join(STATS_LOG_FILE).exists());

    let mut file = std::fs::File::open(dir.path().join(DUMP_FILE)).unwrap();
    let restored = AddrDb::deserialize(&mut file, MIN_CLIENT_VERSION).unwrap();
    assert_eq!(restored.get_stats().known, 3);

    let served = db.snapshot_for_flags(NODE_NETWORK, 1000, true, true);
    assert_eq!(served.len(), 3);
    for endpoint in &endpoints {
        assert!(served.contains(endpoint));
    }
}

#[test]
fn bad_peer_is_banned_and_never_served() {
    let db = AddrDb::default();
    let target = ep("8.8.8.8:9265");
    db.add(&[target], false);

    let (batch, _) = db.select_batch(16);
    assert_eq!(batch.len(), 1);
    let mut result = ProbeResult::failure(target);
    result.ban_secs = 86_400;
    db.report_batch(&[result]);

    assert_eq!(db.get_stats().banned, 1);
    let (batch, _) = db.select_batch(16);
    assert!(batch.is_empty());
    assert!(db.snapshot_for_flags(0, 1000, true, true).is_empty());
}

#[test]
fn one_answer_per_network_group() {
    let db = AddrDb::default();
    let endpoints: Vec<Endpoint> = (0..50)
        .map(|i| ep(&format!("8.8.{}.{}:9265", i / 8, (i % 8) + 1)))
        .collect();
    db.add(&endpoints, true);
    crawl(&db, success);

    let served = db.snapshot_for_flags(NODE_NETWORK, 1000, true, true);
    assert_eq!(served.len(), 1, "all fifty share the /16 group");
}

#[test]
fn persistence_roundtrip_with_varied_states() {
    let dir = tempfile::tempdir().unwrap();
    let db = AddrDb::default();
    let good = ep("8.8.8.8:9265");
    let flaky = ep("1.1.1.1:9265");
    let untried = ep("9.9.9.9:9265");
    db.add(&[good, flaky], true);
    db.add(&[untried], false);

    crawl(&db, |endpoint| {
        if endpoint == flaky {
            ProbeResult::failure(endpoint)
        } else {
            success(endpoint)
        }
    });

    dump_once(&db, dir.path()).unwrap();
    let mut file = std::fs::File::open(dir.path().join(DUMP_FILE)).unwrap();
    let restored = AddrDb::deserialize(&mut file, MIN_CLIENT_VERSION).unwrap();

    assert_eq!(db.get_stats(), restored.get_stats());
    // Untried records stay selectable after a reload
    let (batch, _) = restored.select_batch(1000);
    assert!(!batch.is_empty());
}

/// A cooperative peer for probe tests: answers the handshake and one
/// getaddr.
async fn fake_peer(listener: TcpListener, neighbors: Vec<WireAddr>) {
    let (mut stream, _) = listener.accept().await.unwrap();
    // Their version
    let msg = recv_message(&mut stream, MAINNET_MAGIC).await.unwrap();
    assert!(matches!(msg, Message::Version(_)));
    // Ours
    let version = VersionMessage {
        version: 70_015,
        services: NODE_NETWORK | NODE_WITNESS,
        timestamp: 0,
        nonce: 1,
        user_agent: "/marks:0.9.7.3/".into(),
        start_height: 712_345,
    };
    send_message(&mut stream, MAINNET_MAGIC, &Message::Version(version), None)
        .await
        .unwrap();
    let msg = recv_message(&mut stream, MAINNET_MAGIC).await.unwrap();
    assert_eq!(msg, Message::Verack);
    send_message(&mut stream, MAINNET_MAGIC, &Message::Verack, None)
        .await
        .unwrap();
    let msg = recv_message(&mut stream, MAINNET_MAGIC).await.unwrap();
    assert_eq!(msg, Message::GetAddr);
    send_message(&mut stream, MAINNET_MAGIC, &Message::Addr(neighbors), None)
        .await
        .unwrap();
}

#[tokio::test]
async fn probe_handshake_end_to_end() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let neighbors = vec![
        WireAddr {
            time: 1_700_000_000,
            services: NODE_NETWORK,
            endpoint: ep("8.8.8.8:9265"),
        },
        WireAddr {
            time: 1_700_000_000,
            services: NODE_NETWORK,
            endpoint: ep("9.9.9.9:9265"),
        },
    ];
    let peer = tokio::spawn(fake_peer(listener, neighbors.clone()));

    let ticket = ProbeTicket {
        endpoint: ep(&format!("127.0.0.1:{}", port)),
        last_success: 0,
    };
    let proxies = ProxyTable::default();
    let result = probe_peer(&proxies, MAINNET_MAGIC, "/marks-seeder:0.3.0/", &ticket).await;

    assert!(result.success);
    assert_eq!(result.ban_secs, 0);
    assert_eq!(result.services, NODE_NETWORK | NODE_WITNESS);
    assert_eq!(result.client_version, 70_015);
    assert_eq!(result.user_agent, "/marks:0.9.7.3/");
    assert_eq!(result.starting_height, 712_345);
    assert_eq!(result.neighbors, neighbors);
    peer.await.unwrap();
}

#[tokio::test]
async fn probe_flags_framing_violation() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        use tokio::io::AsyncWriteExt;
        let (mut stream, _) = listener.accept().await.unwrap();
        // 24 garbage bytes instead of a framed message
        stream.write_all(&[0xa5; 24]).await.unwrap();
        stream.flush().await.unwrap();
        // keep the socket open briefly so the probe reads the header
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    });

    let ticket = ProbeTicket {
        endpoint: ep(&format!("127.0.0.1:{}", port)),
        last_success: 0,
    };
    let proxies = ProxyTable::default();
    let result = probe_peer(&proxies, MAINNET_MAGIC, "/marks-seeder:0.3.0/", &ticket).await;

    assert!(!result.success);
    assert_eq!(result.ban_secs, 86_400);
}

#[tokio::test]
async fn dns_query_over_udp() {
    let db = Arc::new(AddrDb::default());
    let endpoints = vec![ep("8.8.8.8:9265"), ep("1.1.1.1:9265")];
    db.add(&endpoints, true);
    crawl(&db, success);

    let config = SeederConfig {
        host: "seed.example.com".into(),
        ns: Some("ns.example.com".into()),
        mbox: Some("admin@example.com".into()),
        ..Default::default()
    };
    let handler = Arc::new(DnsHandler::new(db, &config));
    let server = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
    let server_addr = server.local_addr().unwrap();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    for _ in 0..2 {
        tokio::spawn(dns_worker(handler.clone(), server.clone(), shutdown_rx.clone()));
    }

    // A query for the apex, by hand: header + QNAME + QTYPE A + QCLASS IN
    let mut query = vec![0x12, 0x34, 0x01, 0x00, 0, 1, 0, 0, 0, 0, 0, 0];
    for label in ["seed", "example", "com"] {
        query.push(label.len() as u8);
        query.extend_from_slice(label.as_bytes());
    }
    query.push(0);
    query.extend_from_slice(&[0, 1, 0, 1]);

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client.send_to(&query, server_addr).await.unwrap();
    let mut buf = [0u8; 512];
    let (len, _) = tokio::time::timeout(
        std::time::Duration::from_secs(5),
        client.recv_from(&mut buf),
    )
    .await
    .unwrap()
    .unwrap();

    let reply = &buf[..len];
    assert_eq!(&reply[0..2], &[0x12, 0x34]);
    let ancount = u16::from_be_bytes([reply[6], reply[7]]);
    assert_eq!(ancount, 2);

    shutdown_tx.send(true).ok();
}
