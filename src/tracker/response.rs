use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::Bytes;

use super::error::TrackerError;
use crate::bencode::{decode, Value};

/// A peer returned by a tracker. Only dictionary-style responses carry ids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub addr: SocketAddr,
    pub peer_id: Option<[u8; 20]>,
}

impl Peer {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            peer_id: None,
        }
    }

    pub fn with_id(addr: SocketAddr, peer_id: [u8; 20]) -> Self {
        Self {
            addr,
            peer_id: Some(peer_id),
        }
    }

    fn from_dict(dict: &BTreeMap<Bytes, Value>) -> Option<Self> {
        let ip: IpAddr = dict
            .get(b"ip".as_slice())
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse().ok())?;
        let port = dict
            .get(b"port".as_slice())
            .and_then(|v| v.as_integer())
            .and_then(|p| u16::try_from(p).ok())?;
        let peer_id = dict
            .get(b"peer id".as_slice())
            .and_then(|v| v.as_bytes())
            .and_then(|b| <[u8; 20]>::try_from(b.as_ref()).ok());

        Some(Self {
            addr: SocketAddr::new(ip, port),
            peer_id,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerEvent {
    None,
    Started,
    Stopped,
    Completed,
}

impl TrackerEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackerEvent::None => "",
            TrackerEvent::Started => "started",
            TrackerEvent::Stopped => "stopped",
            TrackerEvent::Completed => "completed",
        }
    }

    pub fn as_udp_id(&self) -> u32 {
        match self {
            TrackerEvent::None => 0,
            TrackerEvent::Completed => 1,
            TrackerEvent::Started => 2,
            TrackerEvent::Stopped => 3,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AnnounceResponse {
    pub interval: u32,
    pub min_interval: Option<u32>,
    /// Seeders.
    pub complete: Option<u32>,
    /// Leechers.
    pub incomplete: Option<u32>,
    pub peers: Vec<Peer>,
    pub warning_message: Option<String>,
    pub tracker_id: Option<String>,
}

impl AnnounceResponse {
    pub fn new(interval: u32) -> Self {
        Self {
            interval,
            ..Self::default()
        }
    }

    pub fn peer_addrs(&self) -> Vec<SocketAddr> {
        self.peers.iter().map(|p| p.addr).collect()
    }
}

/// Swarm counts for one info-hash.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScrapeFile {
    pub info_hash: [u8; 20],
    pub complete: u32,
    pub incomplete: u32,
    pub downloaded: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScrapeResponse {
    pub files: Vec<ScrapeFile>,
}

impl ScrapeResponse {
    pub fn get(&self, info_hash: &[u8; 20]) -> Option<&ScrapeFile> {
        self.files.iter().find(|f| &f.info_hash == info_hash)
    }
}

/// Decodes a bencoded HTTP announce response.
///
/// Accepts both the compact (6 bytes per peer) and the dictionary `peers`
/// format, plus compact `peers6`. A `failure reason` becomes
/// [`TrackerError::Failure`].
pub fn parse_announce_response(body: &[u8]) -> Result<AnnounceResponse, TrackerError> {
    let dict = root_dict(body)?;

    if let Some(failure) = dict
        .get(b"failure reason".as_slice())
        .and_then(|v| v.as_str())
    {
        return Err(TrackerError::Failure(failure.to_string()));
    }

    let interval = int_field(&dict, b"interval")
        .ok_or_else(|| TrackerError::InvalidResponse("missing interval".into()))?;

    let mut response = AnnounceResponse::new(interval);
    response.min_interval = int_field(&dict, b"min interval");
    response.complete = int_field(&dict, b"complete");
    response.incomplete = int_field(&dict, b"incomplete");
    response.warning_message = str_field(&dict, b"warning message");
    response.tracker_id = str_field(&dict, b"tracker id");

    match dict.get(b"peers".as_slice()) {
        Some(Value::Bytes(compact)) => {
            response.peers = parse_compact_peers(compact)
                .into_iter()
                .map(Peer::new)
                .collect();
        }
        Some(Value::List(list)) => {
            response.peers = list
                .iter()
                .filter_map(Value::as_dict)
                .filter_map(Peer::from_dict)
                .collect();
        }
        _ => {}
    }

    if let Some(peers6) = dict.get(b"peers6".as_slice()).and_then(|v| v.as_bytes()) {
        response
            .peers
            .extend(parse_compact_peers6(peers6).into_iter().map(Peer::new));
    }

    Ok(response)
}

/// Decodes a bencoded HTTP scrape response (`files` keyed by info-hash).
pub fn parse_scrape_response(body: &[u8]) -> Result<ScrapeResponse, TrackerError> {
    let dict = root_dict(body)?;

    if let Some(failure) = dict
        .get(b"failure reason".as_slice())
        .and_then(|v| v.as_str())
    {
        return Err(TrackerError::Failure(failure.to_string()));
    }

    let files = dict
        .get(b"files".as_slice())
        .and_then(|v| v.as_dict())
        .ok_or_else(|| TrackerError::InvalidResponse("missing files".into()))?;

    let files = files
        .iter()
        .filter_map(|(hash, stats)| {
            let info_hash = <[u8; 20]>::try_from(hash.as_ref()).ok()?;
            let stats = stats.as_dict()?;
            Some(ScrapeFile {
                info_hash,
                complete: int_field(stats, b"complete").unwrap_or(0),
                incomplete: int_field(stats, b"incomplete").unwrap_or(0),
                downloaded: int_field(stats, b"downloaded").unwrap_or(0),
            })
        })
        .collect();

    Ok(ScrapeResponse { files })
}

/// Derives the scrape URL from an announce URL (BEP-48 convention): the last
/// path segment must start with `announce`, which is replaced by `scrape`.
pub fn scrape_url(announce: &str) -> Option<String> {
    let slash = announce.rfind('/')?;
    let (base, segment) = announce.split_at(slash + 1);
    let rest = segment.strip_prefix("announce")?;
    Some(format!("{}scrape{}", base, rest))
}

pub fn parse_compact_peers(data: &[u8]) -> Vec<SocketAddr> {
    data.chunks_exact(6)
        .map(|c| {
            let ip = Ipv4Addr::new(c[0], c[1], c[2], c[3]);
            SocketAddr::new(IpAddr::V4(ip), u16::from_be_bytes([c[4], c[5]]))
        })
        .collect()
}

pub fn parse_compact_peers6(data: &[u8]) -> Vec<SocketAddr> {
    data.chunks_exact(18)
        .filter_map(|c| {
            let ip: [u8; 16] = c[..16].try_into().ok()?;
            let port = u16::from_be_bytes([c[16], c[17]]);
            Some(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(ip)), port))
        })
        .collect()
}

fn root_dict(body: &[u8]) -> Result<BTreeMap<Bytes, Value>, TrackerError> {
    decode(body)?
        .and_then(Value::into_dict)
        .ok_or_else(|| TrackerError::InvalidResponse("expected dict".into()))
}

fn int_field(dict: &BTreeMap<Bytes, Value>, key: &[u8]) -> Option<u32> {
    dict.get(key)
        .and_then(|v| v.as_integer())
        .and_then(|v| u32::try_from(v).ok())
}

fn str_field(dict: &BTreeMap<Bytes, Value>, key: &[u8]) -> Option<String> {
    dict.get(key).and_then(|v| v.as_str()).map(String::from)
}
