use std::net::SocketAddr;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng as _;
use tokio::net::UdpSocket;
use tracing::{debug, trace};

use super::client::{AnnounceClient, AnnounceRequest};
use super::error::TrackerError;
use super::response::{parse_compact_peers, AnnounceResponse, Peer, ScrapeFile};
use crate::config::TrackerConfig;
use crate::constants::UDP_PROTOCOL_ID;

const ACTION_CONNECT: u32 = 0;
const ACTION_ANNOUNCE: u32 = 1;
const ACTION_SCRAPE: u32 = 2;
const ACTION_ERROR: u32 = 3;

/// Size of an announce request on the wire.
pub const ANNOUNCE_REQUEST_LEN: usize = 98;

/// action, transaction id, interval, leechers, seeders
const ANNOUNCE_HEADER_LEN: usize = 20;

/// BEP-15: a connection id may be reused for one minute.
const CONNECTION_ID_TTL: Duration = Duration::from_secs(60);

/// BEP-15 UDP tracker client.
///
/// By default announces go out directly with the protocol id as connection
/// id. With [`TrackerConfig::udp_connect`] set, the connect handshake runs
/// first and its connection id is cached for a minute.
pub struct UdpTracker {
    socket: UdpSocket,
    addr: SocketAddr,
    url: String,
    handshake: bool,
    connection: Mutex<Option<(u64, Instant)>>,
    timeout: Duration,
}

impl UdpTracker {
    pub async fn connect(url: &str, config: &TrackerConfig) -> Result<Self, TrackerError> {
        let host = parse_udp_url(url)?;
        let addr = tokio::net::lookup_host(host)
            .await?
            .find(SocketAddr::is_ipv4)
            .ok_or_else(|| TrackerError::InvalidUrl(url.to_string()))?;

        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect(addr).await?;

        Ok(Self {
            socket,
            addr,
            url: url.to_string(),
            handshake: config.udp_connect,
            connection: Mutex::new(None),
            timeout: config.udp_timeout,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    async fn connection_id(&self) -> Result<u64, TrackerError> {
        if !self.handshake {
            return Ok(UDP_PROTOCOL_ID);
        }

        let cached = *self.connection.lock();
        if let Some((id, at)) = cached {
            if at.elapsed() < CONNECTION_ID_TTL {
                return Ok(id);
            }
        }

        let transaction_id: u32 = rand::rng().random();

        let mut request = Vec::with_capacity(16);
        request.extend_from_slice(&UDP_PROTOCOL_ID.to_be_bytes());
        request.extend_from_slice(&ACTION_CONNECT.to_be_bytes());
        request.extend_from_slice(&transaction_id.to_be_bytes());

        let response = self.round_trip(&request, transaction_id, 16).await?;
        expect_action(&response, ACTION_CONNECT)?;

        let id = read_u64(&response, 8);
        *self.connection.lock() = Some((id, Instant::now()));
        trace!(tracker = %self.url, "udp connect ok");
        Ok(id)
    }

    /// Sends `request` and waits for the reply carrying `transaction_id`.
    ///
    /// Datagrams with another transaction id are skipped. An error packet
    /// (action 3) becomes [`TrackerError::Failure`].
    async fn round_trip(
        &self,
        request: &[u8],
        transaction_id: u32,
        min_len: usize,
    ) -> Result<Vec<u8>, TrackerError> {
        self.socket.send(request).await?;

        let mut buf = vec![0u8; 2048];
        let deadline = tokio::time::Instant::now() + self.timeout;

        loop {
            let n = match tokio::time::timeout_at(deadline, self.socket.recv(&mut buf)).await {
                Ok(result) => result?,
                Err(_) => return Err(TrackerError::Timeout),
            };

            if n < 8 {
                return Err(TrackerError::InvalidResponse("response too short".into()));
            }
            if read_u32(&buf, 4) != transaction_id {
                trace!(tracker = %self.url, "skipping reply to another transaction");
                continue;
            }
            if read_u32(&buf, 0) == ACTION_ERROR {
                let message = String::from_utf8_lossy(&buf[8..n]).into_owned();
                return Err(TrackerError::Failure(message));
            }
            if n < min_len {
                return Err(TrackerError::InvalidResponse("response too short".into()));
            }

            return Ok(buf[..n].to_vec());
        }
    }
}

#[async_trait]
impl AnnounceClient for UdpTracker {
    async fn open(url: &str, config: &TrackerConfig) -> Result<Self, TrackerError> {
        Self::connect(url, config).await
    }

    async fn announce(&self, request: &AnnounceRequest) -> Result<AnnounceResponse, TrackerError> {
        let connection_id = self.connection_id().await?;
        let transaction_id: u32 = rand::rng().random();
        let packet = encode_announce(connection_id, transaction_id, request);

        let response = self
            .round_trip(&packet, transaction_id, ANNOUNCE_HEADER_LEN)
            .await?;
        let response = parse_udp_announce(&response)?;

        debug!(
            tracker = %self.url,
            peers = response.peers.len(),
            interval = response.interval,
            "udp announce ok"
        );
        Ok(response)
    }

    async fn scrape(&self, info_hash: &[u8; 20]) -> Result<ScrapeFile, TrackerError> {
        let connection_id = self.connection_id().await?;
        let transaction_id: u32 = rand::rng().random();

        let mut request = Vec::with_capacity(36);
        request.extend_from_slice(&connection_id.to_be_bytes());
        request.extend_from_slice(&ACTION_SCRAPE.to_be_bytes());
        request.extend_from_slice(&transaction_id.to_be_bytes());
        request.extend_from_slice(info_hash);

        let response = self.round_trip(&request, transaction_id, 20).await?;
        expect_action(&response, ACTION_SCRAPE)?;

        Ok(ScrapeFile {
            info_hash: *info_hash,
            complete: read_u32(&response, 8),
            downloaded: read_u32(&response, 12),
            incomplete: read_u32(&response, 16),
        })
    }

    fn url(&self) -> &str {
        &self.url
    }
}

/// Builds the fixed-width announce packet.
pub fn encode_announce(connection_id: u64, transaction_id: u32, request: &AnnounceRequest) -> Vec<u8> {
    let numwant = i32::try_from(request.numwant).unwrap_or(-1);

    let mut packet = Vec::with_capacity(ANNOUNCE_REQUEST_LEN);
    packet.extend_from_slice(&connection_id.to_be_bytes());
    packet.extend_from_slice(&ACTION_ANNOUNCE.to_be_bytes());
    packet.extend_from_slice(&transaction_id.to_be_bytes());
    packet.extend_from_slice(&request.info_hash);
    packet.extend_from_slice(request.peer_id.as_bytes());
    packet.extend_from_slice(&request.downloaded.to_be_bytes());
    packet.extend_from_slice(&request.left.to_be_bytes());
    packet.extend_from_slice(&request.uploaded.to_be_bytes());
    packet.extend_from_slice(&request.event.as_udp_id().to_be_bytes());
    packet.extend_from_slice(&0u32.to_be_bytes()); // IP address (0 = default)
    packet.extend_from_slice(&request.key.to_be_bytes());
    packet.extend_from_slice(&numwant.to_be_bytes());
    packet.extend_from_slice(&request.port.to_be_bytes());
    packet
}

/// Parses an announce reply: 20-byte header, then 6-byte peers.
pub fn parse_udp_announce(data: &[u8]) -> Result<AnnounceResponse, TrackerError> {
    if data.len() < ANNOUNCE_HEADER_LEN {
        return Err(TrackerError::InvalidResponse("response too short".into()));
    }
    if read_u32(data, 0) == ACTION_ERROR {
        return Err(TrackerError::Failure(
            String::from_utf8_lossy(&data[8..]).into_owned(),
        ));
    }
    expect_action(data, ACTION_ANNOUNCE)?;

    let mut response = AnnounceResponse::new(read_u32(data, 8));
    response.incomplete = Some(read_u32(data, 12));
    response.complete = Some(read_u32(data, 16));
    response.peers = parse_compact_peers(&data[ANNOUNCE_HEADER_LEN..])
        .into_iter()
        .map(Peer::new)
        .collect();

    Ok(response)
}

fn expect_action(data: &[u8], action: u32) -> Result<(), TrackerError> {
    let got = read_u32(data, 0);
    if got != action {
        return Err(TrackerError::InvalidResponse(format!(
            "expected action {}, got {}",
            action, got
        )));
    }
    Ok(())
}

fn read_u32(data: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]])
}

fn read_u64(data: &[u8], at: usize) -> u64 {
    (u64::from(read_u32(data, at)) << 32) | u64::from(read_u32(data, at + 4))
}

/// `udp://host:port/anything` to `host:port`.
pub fn parse_udp_url(url: &str) -> Result<&str, TrackerError> {
    let rest = url
        .strip_prefix("udp://")
        .ok_or_else(|| TrackerError::InvalidUrl(url.to_string()))?;

    let host = rest.split('/').next().unwrap_or(rest);
    if host.is_empty() || !host.contains(':') {
        return Err(TrackerError::InvalidUrl(url.to_string()));
    }
    Ok(host)
}
