use super::error::DhtError;
use super::node::NodeId;
use super::server::DhtNode;
use futures::future::join_all;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Announce bookkeeping for one torrent.
#[derive(Debug, Clone)]
pub struct TorrentEntry {
    pub name: String,
    pub added_at: Instant,
    pub announce_port: u16,
    pub last_announce: Option<Instant>,
    pub last_peers_count: usize,
    pub total_announcements: u64,
    pub peers: Vec<SocketAddr>,
}

impl TorrentEntry {
    fn new(name: String, port: u16, now: Instant) -> Self {
        Self {
            name,
            added_at: now,
            announce_port: port,
            last_announce: None,
            last_peers_count: 0,
            total_announcements: 0,
            peers: Vec::new(),
        }
    }

    /// Whether a re-announce is due at `now`.
    pub fn is_due_at(&self, interval: Duration, now: Instant) -> bool {
        match self.last_announce {
            None => true,
            Some(at) => now.saturating_duration_since(at) >= interval,
        }
    }
}

/// Aggregate statistics across every seeded torrent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DhtStats {
    pub node_count: usize,
    pub bucket_occupancy: Vec<usize>,
    pub total_announcements: u64,
    pub torrent_count: usize,
}

/// Keeps a set of torrents announced on the DHT.
///
/// The seeder does its own re-announce scheduling through
/// [`periodic_maintenance`](Self::periodic_maintenance); torrents added here
/// are not tracked by the node's maintenance pass.
pub struct DhtSeeder {
    node: Arc<DhtNode>,
    torrents: RwLock<HashMap<[u8; 20], TorrentEntry>>,
    interval: Duration,
}

impl DhtSeeder {
    pub fn new(node: Arc<DhtNode>) -> Self {
        let interval = node.config().announce_interval;
        Self::with_interval(node, interval)
    }

    pub fn with_interval(node: Arc<DhtNode>, interval: Duration) -> Self {
        Self {
            node,
            torrents: RwLock::new(HashMap::new()),
            interval,
        }
    }

    pub fn node(&self) -> &Arc<DhtNode> {
        &self.node
    }

    /// Starts seeding `info_hash` and announces it right away.
    ///
    /// The torrent stays tracked even if the first announce fails; the next
    /// maintenance pass retries it.
    pub async fn add_torrent(
        &self,
        info_hash: [u8; 20],
        name: impl Into<String>,
        port: u16,
    ) -> Result<usize, DhtError> {
        let name = name.into();
        info!("Seeding {} ({}) on DHT, port {}", name, NodeId(info_hash), port);

        self.torrents
            .write()
            .entry(info_hash)
            .and_modify(|e| e.announce_port = port)
            .or_insert_with(|| TorrentEntry::new(name, port, Instant::now()));

        self.announce_one(info_hash, port).await
    }

    pub fn remove_torrent(&self, info_hash: &[u8; 20]) -> bool {
        let removed = self.torrents.write().remove(info_hash);
        if let Some(entry) = &removed {
            info!("Stopped seeding {} on DHT", entry.name);
        }
        removed.is_some()
    }

    async fn announce_one(&self, info_hash: [u8; 20], port: u16) -> Result<usize, DhtError> {
        let result = self.node.announce_once(info_hash, port).await;
        let peers = self.node.known_peers(&info_hash);

        if let Some(entry) = self.torrents.write().get_mut(&info_hash) {
            entry.last_announce = Some(Instant::now());
            entry.last_peers_count = peers.len();
            entry.peers = peers;
            if result.is_ok() {
                entry.total_announcements += 1;
            }
        }

        match &result {
            Ok(acks) => debug!(info_hash = %NodeId(info_hash), acks, "DHT announce acknowledged"),
            Err(e) => warn!(info_hash = %NodeId(info_hash), error = %e, "DHT announce failed"),
        }
        result
    }

    /// Info-hashes whose last announce is at least one interval old.
    pub fn due_torrents_at(&self, now: Instant) -> Vec<([u8; 20], u16)> {
        self.torrents
            .read()
            .iter()
            .filter(|(_, e)| e.is_due_at(self.interval, now))
            .map(|(hash, e)| (*hash, e.announce_port))
            .collect()
    }

    /// Re-announces every due torrent. Returns how many announces succeeded.
    pub async fn periodic_maintenance(&self) -> usize {
        let due = self.due_torrents_at(Instant::now());
        if due.is_empty() {
            return 0;
        }

        let results = join_all(
            due.iter()
                .map(|(info_hash, port)| self.announce_one(*info_hash, *port)),
        )
        .await;

        let ok = results.iter().filter(|r| r.is_ok()).count();
        info!("DHT seeder re-announced {}/{} torrents", ok, due.len());
        ok
    }

    pub fn peers(&self, info_hash: &[u8; 20]) -> Vec<SocketAddr> {
        self.torrents
            .read()
            .get(info_hash)
            .map(|e| e.peers.clone())
            .unwrap_or_default()
    }

    pub fn torrent_stats(&self, info_hash: &[u8; 20]) -> Option<TorrentEntry> {
        self.torrents.read().get(info_hash).cloned()
    }

    pub fn torrent_count(&self) -> usize {
        self.torrents.read().len()
    }

    pub fn stats(&self) -> DhtStats {
        let torrents = self.torrents.read();
        DhtStats {
            node_count: self.node.node_count(),
            bucket_occupancy: self.node.bucket_occupancy(),
            total_announcements: torrents.values().map(|e| e.total_announcements).sum(),
            torrent_count: torrents.len(),
        }
    }
}
