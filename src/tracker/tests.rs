use super::*;
use crate::config::TrackerConfig;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::mpsc;

const INFO_HASH: [u8; 20] = [0xAB; 20];

fn test_config() -> TrackerConfig {
    TrackerConfig {
        http_timeout: Duration::from_secs(2),
        udp_timeout: Duration::from_millis(200),
        max_retries: 1,
        permit_timeout: Duration::from_secs(1),
        ..TrackerConfig::default()
    }
}

fn request(event: TrackerEvent) -> AnnounceRequest {
    AnnounceRequest {
        info_hash: INFO_HASH,
        peer_id: PeerId::generate(),
        port: 6881,
        uploaded: 100,
        downloaded: 200,
        left: 0,
        event,
        key: 0xDEADBEEF,
        numwant: 50,
    }
}

/// Serves `body` to every HTTP request and reports each request line.
async fn serve_http(body: Vec<u8>) -> (String, mpsc::UnboundedReceiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };

            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                match stream.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => request.extend_from_slice(&buf[..n]),
                }
            }

            let text = String::from_utf8_lossy(&request);
            let _ = tx.send(text.lines().next().unwrap_or_default().to_string());

            let head = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                body.len()
            );
            let _ = stream.write_all(head.as_bytes()).await;
            let _ = stream.write_all(&body).await;
            let _ = stream.shutdown().await;
        }
    });

    (format!("http://{}/announce", addr), rx)
}

/// Answers every datagram with whatever `handler` returns.
async fn fake_udp_tracker<F>(handler: F) -> SocketAddr
where
    F: Fn(&[u8]) -> Option<Vec<u8>> + Send + 'static,
{
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();

    tokio::spawn(async move {
        let mut buf = [0u8; 2048];
        while let Ok((n, from)) = socket.recv_from(&mut buf).await {
            if let Some(reply) = handler(&buf[..n]) {
                let _ = socket.send_to(&reply, from).await;
            }
        }
    });

    addr
}

/// Value of `name` in the query string of an HTTP request line.
fn query_param<'a>(line: &'a str, name: &str) -> Option<&'a str> {
    let path = line.split(' ').nth(1)?;
    let query = path.split_once('?')?.1;
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(k, _)| *k == name)
        .map(|(_, v)| v)
}

fn udp_announce_reply(req: &[u8], seeders: u32) -> Vec<u8> {
    let mut reply = Vec::new();
    reply.extend_from_slice(&1u32.to_be_bytes());
    reply.extend_from_slice(&req[12..16]);
    reply.extend_from_slice(&900u32.to_be_bytes());
    reply.extend_from_slice(&3u32.to_be_bytes());
    reply.extend_from_slice(&seeders.to_be_bytes());
    reply.extend_from_slice(&[5, 6, 7, 8, 0x1A, 0xE1]);
    reply
}

#[test]
fn test_tracker_event() {
    assert_eq!(TrackerEvent::Started.as_str(), "started");
    assert_eq!(TrackerEvent::Stopped.as_str(), "stopped");
    assert_eq!(TrackerEvent::Completed.as_str(), "completed");
    assert_eq!(TrackerEvent::None.as_str(), "");

    assert_eq!(TrackerEvent::None.as_udp_id(), 0);
    assert_eq!(TrackerEvent::Completed.as_udp_id(), 1);
    assert_eq!(TrackerEvent::Started.as_udp_id(), 2);
    assert_eq!(TrackerEvent::Stopped.as_udp_id(), 3);
}

#[test]
fn test_peer_id() {
    let id = PeerId::generate();
    assert_eq!(&id.as_bytes()[..8], b"-SS0001-");
    assert_eq!(id.client_id(), Some("SS0001"));
    assert_ne!(id, PeerId::generate());

    assert!(PeerId::from_bytes(&[0u8; 19]).is_none());
    assert_eq!(PeerId::from_bytes(&[b'x'; 20]).unwrap().client_id(), None);
}

#[test]
fn test_parse_compact_peers() {
    let data = [
        192, 168, 1, 1, 0x1A, 0xE1, // 192.168.1.1:6881
        10, 0, 0, 1, 0x1A, 0xE1, // 10.0.0.1:6881
        1, 2, 3, // trailing partial entry
    ];

    let peers = parse_compact_peers(&data);
    assert_eq!(
        peers,
        vec![
            "192.168.1.1:6881".parse::<SocketAddr>().unwrap(),
            "10.0.0.1:6881".parse().unwrap()
        ]
    );
}

#[test]
fn test_parse_announce_response_compact() {
    let body = b"d8:completei5e10:incompletei2e8:intervali1800e5:peers6:\x01\x02\x03\x04\x1a\xe1e";
    let response = parse_announce_response(body).unwrap();

    assert_eq!(response.complete, Some(5));
    assert_eq!(response.incomplete, Some(2));
    assert_eq!(response.interval, 1800);
    assert_eq!(response.peer_addrs(), vec!["1.2.3.4:6881".parse().unwrap()]);
    assert_eq!(response.peers[0].peer_id, None);
}

#[test]
fn test_parse_announce_response_dict_peers() {
    let body = b"d8:intervali900e5:peersld2:ip8:10.0.0.17:peer id20:-UT3500-abcdefghijkl4:porti51413eed2:ip3:bad4:porti1eeee";
    let response = parse_announce_response(body).unwrap();

    assert_eq!(response.peers.len(), 1);
    let peer = &response.peers[0];
    assert_eq!(peer.addr, "10.0.0.1:51413".parse().unwrap());
    assert_eq!(peer.peer_id.as_ref().map(|id| &id[..8]), Some(b"-UT3500-".as_slice()));
}

#[test]
fn test_parse_announce_response_failure_and_warning() {
    let failure = parse_announce_response(b"d14:failure reason9:not founde");
    assert!(matches!(failure, Err(TrackerError::Failure(msg)) if msg == "not found"));

    let warned =
        parse_announce_response(b"d8:intervali60e15:warning message4:slowe").unwrap();
    assert_eq!(warned.warning_message.as_deref(), Some("slow"));
    assert!(warned.peers.is_empty());

    assert!(matches!(
        parse_announce_response(b"d8:completei1ee"),
        Err(TrackerError::InvalidResponse(_))
    ));
    assert!(matches!(
        parse_announce_response(b"<html>"),
        Err(TrackerError::Bencode(_))
    ));
}

#[test]
fn test_scrape_url() {
    assert_eq!(
        scrape_url("http://t.example.com/announce").as_deref(),
        Some("http://t.example.com/scrape")
    );
    assert_eq!(
        scrape_url("http://t.example.com/x/announce.php?passkey=1").as_deref(),
        Some("http://t.example.com/x/scrape.php?passkey=1")
    );
    assert_eq!(scrape_url("http://t.example.com/a"), None);
    assert_eq!(scrape_url("http://t.example.com/announce/x"), None);
}

#[test]
fn test_parse_scrape_response() {
    let mut body = b"d5:filesd20:".to_vec();
    body.extend_from_slice(&INFO_HASH);
    body.extend_from_slice(b"d8:completei4e10:downloadedi9e10:incompletei1eeee");

    let response = parse_scrape_response(&body).unwrap();
    let file = response.get(&INFO_HASH).unwrap();
    assert_eq!(file.complete, 4);
    assert_eq!(file.incomplete, 1);
    assert_eq!(file.downloaded, 9);
    assert!(response.get(&[0u8; 20]).is_none());
}

#[test]
fn test_encode_udp_announce() {
    let req = request(TrackerEvent::Started);
    let packet = encode_announce(0x41727101980, 7, &req);

    assert_eq!(packet.len(), 98);
    assert_eq!(&packet[..8], &0x41727101980u64.to_be_bytes());
    assert_eq!(&packet[8..12], &1u32.to_be_bytes());
    assert_eq!(&packet[12..16], &7u32.to_be_bytes());
    assert_eq!(&packet[16..36], &INFO_HASH);
    assert_eq!(&packet[36..56], req.peer_id.as_bytes());
    assert_eq!(&packet[56..64], &200u64.to_be_bytes());
    assert_eq!(&packet[72..80], &100u64.to_be_bytes());
    assert_eq!(&packet[80..84], &2u32.to_be_bytes());
    assert_eq!(&packet[88..92], &0xDEADBEEFu32.to_be_bytes());
    assert_eq!(&packet[92..96], &50i32.to_be_bytes());
    assert_eq!(&packet[96..98], &6881u16.to_be_bytes());
}

#[test]
fn test_parse_udp_announce() {
    let mut req = vec![0u8; 16];
    req[12..16].copy_from_slice(&9u32.to_be_bytes());
    let reply = udp_announce_reply(&req, 7);

    let response = parse_udp_announce(&reply).unwrap();
    assert_eq!(response.interval, 900);
    assert_eq!(response.incomplete, Some(3));
    assert_eq!(response.complete, Some(7));
    assert_eq!(response.peer_addrs(), vec!["5.6.7.8:6881".parse().unwrap()]);

    let mut error = 3u32.to_be_bytes().to_vec();
    error.extend_from_slice(&9u32.to_be_bytes());
    error.extend_from_slice(b"torrent not registered");
    error.resize(24, 0);
    assert!(matches!(
        parse_udp_announce(&error),
        Err(TrackerError::Failure(msg)) if msg.starts_with("torrent not registered")
    ));

    assert!(parse_udp_announce(&reply[..12]).is_err());
}

#[test]
fn test_parse_udp_url() {
    assert_eq!(
        parse_udp_url("udp://tracker.example.com:1337/announce").unwrap(),
        "tracker.example.com:1337"
    );
    assert_eq!(parse_udp_url("udp://10.0.0.1:80").unwrap(), "10.0.0.1:80");
    assert!(parse_udp_url("http://tracker.example.com/announce").is_err());
    assert!(parse_udp_url("udp://tracker.example.com/announce").is_err());
}

#[test]
fn test_http_tracker_invalid_url() {
    assert!(matches!(
        HttpTracker::new("ftp://tracker.example.com", &TrackerConfig::default()),
        Err(TrackerError::InvalidUrl(_))
    ));
}

#[test]
fn test_http_announce_url() {
    let tracker =
        HttpTracker::new("http://t.example.com/announce", &TrackerConfig::default()).unwrap();
    let url = tracker.announce_url(&request(TrackerEvent::Started));

    assert!(url.starts_with("http://t.example.com/announce?info_hash=%AB%AB"));
    assert!(url.contains("&peer_id=-SS0001-"));
    assert!(url.contains("&port=6881&uploaded=100&downloaded=200&left=0"));
    assert!(url.contains("&key=DEADBEEF"));
    assert!(url.contains("&compact=0&numwant=50"));
    assert!(url.ends_with("&event=started"));

    let url = tracker.announce_url(&request(TrackerEvent::None));
    assert!(!url.contains("event="));

    let tracker = HttpTracker::new("http://t.example.com/a?pk=1", &TrackerConfig::default())
        .unwrap();
    assert!(tracker
        .announce_url(&request(TrackerEvent::None))
        .starts_with("http://t.example.com/a?pk=1&info_hash="));
}

#[tokio::test]
async fn test_limiter_times_out_and_releases() {
    let limiter = AnnounceLimiter::new(1, Duration::from_millis(50));

    let held = limiter.acquire().await.unwrap();
    assert_eq!(limiter.available(), 0);
    assert!(limiter.acquire().await.is_none());

    drop(held);
    assert_eq!(limiter.available(), 1);
    assert!(limiter.acquire().await.is_some());
    assert_eq!(limiter.available(), 1);
}

#[test]
fn test_seeder_requires_urls() {
    let result = HttpSeeder::new(
        INFO_HASH,
        6881,
        Vec::new(),
        test_config(),
        AnnounceLimiter::from_config(&test_config()),
    );
    assert!(matches!(result, Err(TrackerError::NoTrackers)));
}

#[tokio::test]
async fn test_http_seeder_load_peers() {
    let body = b"d8:completei5e10:incompletei2e8:intervali1800e5:peers6:\x01\x02\x03\x04\x1a\xe1e";
    let (url, mut requests) = serve_http(body.to_vec()).await;

    let seeder = HttpSeeder::new(
        INFO_HASH,
        6881,
        vec![url.clone()],
        test_config(),
        AnnounceLimiter::from_config(&test_config()),
    )
    .unwrap();

    assert!(seeder.load_peers().await);
    assert_eq!(seeder.peers(), vec!["1.2.3.4:6881".parse().unwrap()]);

    let stats = seeder.stats();
    assert_eq!(stats.seeders, 5);
    assert_eq!(stats.leechers, 2);
    assert_eq!(stats.interval, 1800);
    assert!(stats.last_announce.is_some());
    assert_eq!(stats.announces, 1);

    let first = requests.recv().await.unwrap();
    assert!(first.starts_with("GET /announce?info_hash="));
    assert!(first.contains("compact=0"));
    assert!(first.contains("event=started"));

    assert!(seeder.upload(1024, 0, 0).await);
    let second = requests.recv().await.unwrap();
    assert!(second.contains("uploaded=1024"));
    assert!(!second.contains("event="));
    assert_eq!(seeder.active_url(), url);
}

#[tokio::test]
async fn test_http_seeder_fails_over_on_failure_reason() {
    let (bad, _bad_requests) = serve_http(b"d14:failure reason6:deniede".to_vec()).await;
    let (good, _good_requests) = serve_http(b"d8:intervali60e5:peers0:e".to_vec()).await;

    let config = TrackerConfig {
        max_retries: 2,
        ..test_config()
    };
    let seeder = HttpSeeder::new(
        INFO_HASH,
        6881,
        vec![bad, good.clone()],
        config.clone(),
        AnnounceLimiter::from_config(&config),
    )
    .unwrap();

    assert!(seeder.load_peers().await);
    assert_eq!(seeder.active_url(), good);
    assert_eq!(seeder.stats().failures, 1);
    assert_eq!(seeder.stats().interval, 60);
}

#[tokio::test]
async fn test_failover_sends_fresh_key_and_started() {
    let (bad, mut bad_requests) = serve_http(b"d14:failure reason6:deniede".to_vec()).await;
    let (good, mut good_requests) = serve_http(b"d8:intervali60e5:peers0:e".to_vec()).await;

    let config = TrackerConfig {
        max_retries: 2,
        ..test_config()
    };
    let seeder = HttpSeeder::new(
        INFO_HASH,
        6881,
        vec![bad, good],
        config.clone(),
        AnnounceLimiter::from_config(&config),
    )
    .unwrap();

    assert!(seeder.load_peers().await);

    let rejected = bad_requests.recv().await.unwrap();
    let accepted = good_requests.recv().await.unwrap();
    let old_key = query_param(&rejected, "key").unwrap();
    let new_key = query_param(&accepted, "key").unwrap();
    assert_eq!(old_key.len(), 8);
    assert_ne!(old_key, new_key);
    assert_eq!(query_param(&accepted, "event"), Some("started"));

    // the key stays put while the tracker keeps answering
    assert!(seeder.upload(1, 0, 0).await);
    let next = good_requests.recv().await.unwrap();
    assert_eq!(query_param(&next, "key"), Some(new_key));
}

#[tokio::test]
async fn test_http_scrape() {
    let mut body = b"d5:filesd20:".to_vec();
    body.extend_from_slice(&INFO_HASH);
    body.extend_from_slice(b"d8:completei4e10:downloadedi9e10:incompletei1eeee");
    let (url, mut requests) = serve_http(body).await;

    let tracker = HttpTracker::new(&url, &test_config()).unwrap();
    let file = tracker.scrape(&INFO_HASH).await.unwrap();
    assert_eq!(file.complete, 4);

    let line = requests.recv().await.unwrap();
    assert!(line.starts_with("GET /scrape?info_hash=%AB"));
}

#[tokio::test]
async fn test_udp_seeder_direct_announce() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let addr = fake_udp_tracker(move |req| {
        let _ = tx.send(req.to_vec());
        Some(udp_announce_reply(req, 7))
    })
    .await;

    let config = test_config();
    let seeder = UdpSeeder::new(
        INFO_HASH,
        6881,
        vec![format!("udp://{}/announce", addr)],
        config.clone(),
        AnnounceLimiter::from_config(&config),
    )
    .unwrap();

    assert!(seeder.upload(10, 20, 30).await);
    assert_eq!(seeder.peers(), vec!["5.6.7.8:6881".parse().unwrap()]);
    assert_eq!(seeder.stats().seeders, 7);
    assert_eq!(seeder.stats().leechers, 3);

    let sent = rx.recv().await.unwrap();
    assert_eq!(sent.len(), 98);
    assert_eq!(&sent[..8], &0x41727101980u64.to_be_bytes());
    assert_eq!(&sent[64..72], &30u64.to_be_bytes());
}

#[tokio::test]
async fn test_udp_connect_handshake() {
    const CONNECTION_ID: u64 = 0x1122_3344_5566_7788;

    let addr = fake_udp_tracker(|req| {
        let action = u32::from_be_bytes([req[8], req[9], req[10], req[11]]);
        let mut reply = Vec::new();

        if action == 0 {
            reply.extend_from_slice(&0u32.to_be_bytes());
            reply.extend_from_slice(&req[12..16]);
            reply.extend_from_slice(&CONNECTION_ID.to_be_bytes());
            Some(reply)
        } else if req[..8] == CONNECTION_ID.to_be_bytes() {
            Some(udp_announce_reply(req, 1))
        } else {
            reply.extend_from_slice(&3u32.to_be_bytes());
            reply.extend_from_slice(&req[12..16]);
            reply.extend_from_slice(b"bad connection id");
            Some(reply)
        }
    })
    .await;

    let config = TrackerConfig {
        udp_connect: true,
        ..test_config()
    };
    let tracker = UdpTracker::connect(&format!("udp://{}", addr), &config)
        .await
        .unwrap();

    let response = tracker.announce(&request(TrackerEvent::Started)).await.unwrap();
    assert_eq!(response.complete, Some(1));

    let direct = UdpTracker::connect(&format!("udp://{}", addr), &test_config())
        .await
        .unwrap();
    assert!(matches!(
        direct.announce(&request(TrackerEvent::Started)).await,
        Err(TrackerError::Failure(msg)) if msg == "bad connection id"
    ));
}

#[tokio::test]
async fn test_udp_scrape() {
    let addr = fake_udp_tracker(|req| {
        let mut reply = Vec::new();
        reply.extend_from_slice(&2u32.to_be_bytes());
        reply.extend_from_slice(&req[12..16]);
        reply.extend_from_slice(&11u32.to_be_bytes());
        reply.extend_from_slice(&22u32.to_be_bytes());
        reply.extend_from_slice(&33u32.to_be_bytes());
        Some(reply)
    })
    .await;

    let tracker = UdpTracker::connect(&format!("udp://{}", addr), &test_config())
        .await
        .unwrap();
    let file = tracker.scrape(&INFO_HASH).await.unwrap();

    assert_eq!(file.complete, 11);
    assert_eq!(file.downloaded, 22);
    assert_eq!(file.incomplete, 33);
}

#[tokio::test]
async fn test_udp_seeder_timeout_switches_tracker() {
    let silent_a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let silent_b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let url_a = format!("udp://{}/announce", silent_a.local_addr().unwrap());
    let url_b = format!("udp://{}/announce", silent_b.local_addr().unwrap());

    let config = test_config();
    let seeder = UdpSeeder::new(
        INFO_HASH,
        6881,
        vec![url_a.clone(), url_b.clone()],
        config.clone(),
        AnnounceLimiter::from_config(&config),
    )
    .unwrap();

    assert_eq!(seeder.active_url(), url_a);
    assert!(!seeder.load_peers().await);
    assert_eq!(seeder.active_url(), url_b);
    assert_eq!(seeder.stats().failures, 1);
    assert!(seeder.peers().is_empty());
}

#[tokio::test]
async fn test_seeder_permit_timeout_is_soft() {
    let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let url = format!("udp://{}", silent.local_addr().unwrap());

    let limiter = AnnounceLimiter::new(1, Duration::from_millis(50));
    let _held = limiter.acquire().await.unwrap();

    let seeder = UdpSeeder::new(
        INFO_HASH,
        6881,
        vec![url.clone(), "udp://127.0.0.1:9".to_string()],
        test_config(),
        limiter.clone(),
    )
    .unwrap();

    assert!(!seeder.load_peers().await);
    assert_eq!(seeder.active_url(), url);
    assert_eq!(seeder.stats().failures, 0);
}

#[tokio::test]
async fn test_failed_call_never_ends_on_its_first_tracker() {
    let sockets = [
        UdpSocket::bind("127.0.0.1:0").await.unwrap(),
        UdpSocket::bind("127.0.0.1:0").await.unwrap(),
        UdpSocket::bind("127.0.0.1:0").await.unwrap(),
    ];
    let urls: Vec<String> = sockets
        .iter()
        .map(|s| format!("udp://{}/announce", s.local_addr().unwrap()))
        .collect();

    // as many retries as trackers, so the rotation wraps around
    let config = TrackerConfig {
        max_retries: 3,
        ..test_config()
    };
    let seeder = UdpSeeder::new(
        INFO_HASH,
        6881,
        urls.clone(),
        config.clone(),
        AnnounceLimiter::from_config(&config),
    )
    .unwrap();

    assert!(!seeder.load_peers().await);
    assert_eq!(seeder.stats().failures, 3);
    assert_eq!(seeder.active_url(), urls[1]);

    assert!(!seeder.load_peers().await);
    assert_eq!(seeder.stats().failures, 6);
    assert_eq!(seeder.active_url(), urls[2]);
}
