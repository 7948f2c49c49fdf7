//! State the DHT keeps on behalf of other nodes: announced peers and the
//! tokens that authorise announces.

use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use bytes::Bytes;
use sha1::{Digest, Sha1};

use crate::constants::DHT_TOKEN_LEN;

/// Purge expired tokens on issue once this many are held.
const TOKEN_PURGE_THRESHOLD: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub addr: SocketAddr,
    pub discovered_at: Instant,
}

/// Peers announced to us, per info-hash.
///
/// Each info-hash holds at most `max_per_torrent` distinct addresses; adding
/// past that evicts the oldest.
#[derive(Debug)]
pub struct PeerStorage {
    peers: HashMap<[u8; 20], VecDeque<PeerInfo>>,
    max_per_torrent: usize,
}

impl PeerStorage {
    pub fn new(max_per_torrent: usize) -> Self {
        Self {
            peers: HashMap::new(),
            max_per_torrent,
        }
    }

    pub fn add_peer(&mut self, info_hash: [u8; 20], addr: SocketAddr) {
        self.add_peer_at(info_hash, addr, Instant::now());
    }

    pub fn add_peer_at(&mut self, info_hash: [u8; 20], addr: SocketAddr, now: Instant) {
        let peers = self.peers.entry(info_hash).or_default();
        peers.retain(|p| p.addr != addr);

        while peers.len() >= self.max_per_torrent {
            peers.pop_front();
        }

        peers.push_back(PeerInfo {
            addr,
            discovered_at: now,
        });
    }

    pub fn get_peers(&self, info_hash: &[u8; 20]) -> Vec<SocketAddr> {
        self.peers
            .get(info_hash)
            .map(|peers| peers.iter().map(|p| p.addr).collect())
            .unwrap_or_default()
    }

    /// Drops peers older than `max_age`. Returns how many were dropped.
    pub fn purge_older_than(&mut self, max_age: Duration, now: Instant) -> usize {
        let mut removed = 0;

        self.peers.retain(|_, peers| {
            let before = peers.len();
            peers.retain(|p| now.saturating_duration_since(p.discovered_at) <= max_age);
            removed += before - peers.len();
            !peers.is_empty()
        });

        removed
    }

    /// A copy of everything stored, for outside observers.
    pub fn snapshot(&self) -> HashMap<[u8; 20], Vec<SocketAddr>> {
        self.peers
            .iter()
            .map(|(hash, peers)| (*hash, peers.iter().map(|p| p.addr).collect()))
            .collect()
    }

    pub fn torrent_count(&self) -> usize {
        self.peers.len()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.values().map(VecDeque::len).sum()
    }
}

/// Tokens handed out in `get_peers` responses, one live token per IP.
///
/// Issuing a new token for an IP replaces the previous one, so only the most
/// recent token is accepted by [`TokenStore::validate`].
#[derive(Debug)]
pub struct TokenStore {
    secret: [u8; 16],
    counter: u64,
    issued: HashMap<IpAddr, (Bytes, Instant)>,
    ttl: Duration,
}

impl TokenStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            secret: rand::random(),
            counter: 0,
            issued: HashMap::new(),
            ttl,
        }
    }

    pub fn issue(&mut self, ip: IpAddr) -> Bytes {
        self.issue_at(ip, Instant::now())
    }

    pub fn issue_at(&mut self, ip: IpAddr, now: Instant) -> Bytes {
        if self.issued.len() >= TOKEN_PURGE_THRESHOLD {
            self.purge_expired(now);
        }

        self.counter = self.counter.wrapping_add(1);

        let mut hasher = Sha1::new();
        hasher.update(self.secret);
        match ip {
            IpAddr::V4(v4) => hasher.update(v4.octets()),
            IpAddr::V6(v6) => hasher.update(v6.octets()),
        }
        hasher.update(self.counter.to_be_bytes());
        let digest = hasher.finalize();

        let token = Bytes::copy_from_slice(&digest[..DHT_TOKEN_LEN]);
        self.issued.insert(ip, (token.clone(), now));
        token
    }

    pub fn validate(&self, ip: IpAddr, token: &[u8]) -> bool {
        self.validate_at(ip, token, Instant::now())
    }

    pub fn validate_at(&self, ip: IpAddr, token: &[u8], now: Instant) -> bool {
        match self.issued.get(&ip) {
            Some((issued, at)) => {
                issued.as_ref() == token && now.saturating_duration_since(*at) <= self.ttl
            }
            None => false,
        }
    }

    pub fn purge_expired(&mut self, now: Instant) -> usize {
        let before = self.issued.len();
        let ttl = self.ttl;
        self.issued
            .retain(|_, (_, at)| now.saturating_duration_since(*at) <= ttl);
        before - self.issued.len()
    }

    pub fn len(&self) -> usize {
        self.issued.len()
    }

    pub fn is_empty(&self) -> bool {
        self.issued.is_empty()
    }
}
