//! Swarm discovery for a set of torrents.
//!
//! A [`Session`] runs one DHT node (optional) and, per torrent, one tracker
//! seeder per transport. Callers only see info-hashes, transfer counters,
//! merged peer lists and swarm statistics.
//!
//! # Examples
//!
//! ```no_run
//! use swarmseed::config::SessionConfig;
//! use swarmseed::session::Session;
//!
//! # async fn example() -> Result<(), swarmseed::session::SessionError> {
//! let session = Session::new(SessionConfig::default()).await?;
//! let info_hash = [0u8; 20];
//!
//! session
//!     .start_discovery(info_hash, 6881, &["udp://tracker.example.com:1337/announce".into()])
//!     .await?;
//! session.announce(info_hash, 0, 0, 0).await?;
//!
//! let peers = session.get_peers(&info_hash);
//! session.stop();
//! # Ok(())
//! # }
//! ```

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{ConfigError, SessionConfig};
use crate::constants::TRACKER_DEFAULT_INTERVAL;
use crate::dht::{DhtError, DhtNode, DhtSeeder};
use crate::tracker::{
    AnnounceClient, AnnounceLimiter, HttpSeeder, TrackerError, TrackerSeeder, TrackerStats,
    UdpSeeder,
};

/// How often the DHT seeder checks for due re-announces.
const DHT_SEEDER_TICK: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("dht error: {0}")]
    Dht(#[from] DhtError),

    #[error("tracker error: {0}")]
    Tracker(#[from] TrackerError),

    #[error("unknown torrent {0}")]
    UnknownTorrent(String),
}

impl SessionError {
    fn unknown(info_hash: &[u8; 20]) -> Self {
        SessionError::UnknownTorrent(hex::encode(info_hash))
    }
}

/// What the swarm looks like from the trackers' side.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SwarmStats {
    pub seeders: u32,
    pub leechers: u32,
    pub interval: u32,
    pub last_announce: Option<Instant>,
}

#[derive(Clone)]
struct Swarm {
    port: u16,
    http: Option<Arc<HttpSeeder>>,
    udp: Option<Arc<UdpSeeder>>,
}

impl Swarm {
    fn tracker_stats(&self) -> Vec<TrackerStats> {
        let http = self.http.as_ref().map(|s| s.stats());
        let udp = self.udp.as_ref().map(|s| s.stats());
        http.into_iter().chain(udp).collect()
    }

    fn tracker_peers(&self) -> Vec<SocketAddr> {
        let mut peers = self.http.as_ref().map(|s| s.peers()).unwrap_or_default();
        peers.extend(self.udp.as_ref().map(|s| s.peers()).unwrap_or_default());
        peers
    }

    async fn load_peers(&self) -> bool {
        let http = async {
            match &self.http {
                Some(seeder) => seeder.load_peers().await,
                None => false,
            }
        };
        let udp = async {
            match &self.udp {
                Some(seeder) => seeder.load_peers().await,
                None => false,
            }
        };

        let (http, udp) = tokio::join!(http, udp);
        http || udp
    }

    async fn announce(&self, uploaded: u64, downloaded: u64, left: u64) -> bool {
        let http = async {
            match &self.http {
                Some(seeder) => seeder.upload(uploaded, downloaded, left).await,
                None => false,
            }
        };
        let udp = async {
            match &self.udp {
                Some(seeder) => seeder.upload(uploaded, downloaded, left).await,
                None => false,
            }
        };

        let (http, udp) = tokio::join!(http, udp);
        http || udp
    }
}

pub struct Session {
    config: SessionConfig,
    dht: Option<Arc<DhtSeeder>>,
    swarms: RwLock<HashMap<[u8; 20], Swarm>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    stop: Arc<Notify>,
}

impl Session {
    /// Validates `config`, binds and starts the DHT node if one is configured,
    /// and bootstraps it in the background.
    pub async fn new(config: SessionConfig) -> Result<Self, SessionError> {
        config.validate()?;

        let stop = Arc::new(Notify::new());
        let mut tasks = Vec::new();

        let dht = match &config.dht {
            Some(dht_config) => {
                let node = DhtNode::bind(dht_config.clone()).await?;
                tasks.push(node.start());

                let bootstrap = Arc::clone(&node);
                tasks.push(tokio::spawn(async move {
                    bootstrap.bootstrap().await;
                }));

                let seeder = Arc::new(DhtSeeder::new(node));
                tasks.push(tokio::spawn(run_dht_seeder(
                    Arc::clone(&seeder),
                    Arc::clone(&stop),
                )));
                Some(seeder)
            }
            None => None,
        };

        Ok(Self {
            config,
            dht,
            swarms: RwLock::new(HashMap::new()),
            tasks: Mutex::new(tasks),
            stop,
        })
    }

    pub fn dht(&self) -> Option<&Arc<DhtSeeder>> {
        self.dht.as_ref()
    }

    /// Starts discovering peers for `info_hash`.
    ///
    /// Tracker URLs are grouped by transport into one seeder each; unsupported
    /// schemes are skipped. Runs the first tracker and DHT announces before
    /// returning. Calling this again for a known info-hash replaces its
    /// trackers.
    pub async fn start_discovery(
        &self,
        info_hash: [u8; 20],
        port: u16,
        trackers: &[String],
    ) -> Result<(), SessionError> {
        let mut http_urls = Vec::new();
        let mut udp_urls = Vec::new();

        for url in trackers {
            if url.starts_with("http://") || url.starts_with("https://") {
                http_urls.push(url.clone());
            } else if url.starts_with("udp://") {
                udp_urls.push(url.clone());
            } else {
                warn!("Skipping tracker with unsupported scheme: {}", url);
            }
        }

        let limiter = AnnounceLimiter::from_config(&self.config.tracker);
        let http: Option<Arc<HttpSeeder>> =
            build_seeder(info_hash, port, http_urls, &self.config, &limiter)?;
        let udp: Option<Arc<UdpSeeder>> =
            build_seeder(info_hash, port, udp_urls, &self.config, &limiter)?;

        info!(
            info_hash = %hex::encode(info_hash),
            port,
            http = http.is_some(),
            udp = udp.is_some(),
            dht = self.dht.is_some(),
            "starting discovery"
        );

        let swarm = Swarm { port, http, udp };
        self.swarms.write().insert(info_hash, swarm.clone());

        let dht = async {
            if let Some(seeder) = &self.dht {
                let name = hex::encode(&info_hash[..4]);
                if let Err(e) = seeder.add_torrent(info_hash, name, port).await {
                    debug!("initial DHT announce failed: {}", e);
                }
            }
        };
        let (trackers_ok, ()) = tokio::join!(swarm.load_peers(), dht);
        debug!(trackers_ok, "first announce round finished");

        Ok(())
    }

    /// Reports transfer counters to every tracker of the torrent.
    ///
    /// Returns whether at least one tracker accepted the announce.
    pub async fn announce(
        &self,
        info_hash: [u8; 20],
        uploaded: u64,
        downloaded: u64,
        left: u64,
    ) -> Result<bool, SessionError> {
        let swarm = self
            .swarms
            .read()
            .get(&info_hash)
            .cloned()
            .ok_or_else(|| SessionError::unknown(&info_hash))?;

        Ok(swarm.announce(uploaded, downloaded, left).await)
    }

    /// Tracker and DHT peers for `info_hash`, without duplicates.
    pub fn get_peers(&self, info_hash: &[u8; 20]) -> Vec<SocketAddr> {
        let mut peers = self
            .swarms
            .read()
            .get(info_hash)
            .map(Swarm::tracker_peers)
            .unwrap_or_default();

        if let Some(dht) = &self.dht {
            peers.extend(dht.peers(info_hash));
            peers.extend(dht.node().known_peers(info_hash));
        }

        let mut seen = HashSet::new();
        peers.retain(|p| seen.insert(*p));
        peers
    }

    /// Swarm numbers across the torrent's trackers, or `None` if it is unknown.
    ///
    /// Counts are the largest any tracker reported; the interval is the
    /// shortest among trackers that answered.
    pub fn get_stats(&self, info_hash: &[u8; 20]) -> Option<SwarmStats> {
        let swarms = self.swarms.read();
        let stats = swarms.get(info_hash)?.tracker_stats();

        let answered: Vec<&TrackerStats> =
            stats.iter().filter(|s| s.last_announce.is_some()).collect();

        let dht_announce = self
            .dht
            .as_ref()
            .and_then(|d| d.torrent_stats(info_hash))
            .and_then(|e| e.last_announce);

        Some(SwarmStats {
            seeders: answered.iter().map(|s| s.seeders).max().unwrap_or(0),
            leechers: answered.iter().map(|s| s.leechers).max().unwrap_or(0),
            interval: answered
                .iter()
                .map(|s| s.interval)
                .min()
                .unwrap_or(TRACKER_DEFAULT_INTERVAL),
            last_announce: answered
                .iter()
                .filter_map(|s| s.last_announce)
                .chain(dht_announce)
                .max(),
        })
    }

    /// Listen port registered for `info_hash`.
    pub fn port(&self, info_hash: &[u8; 20]) -> Option<u16> {
        self.swarms.read().get(info_hash).map(|s| s.port)
    }

    /// Stops discovering peers for `info_hash`.
    pub fn stop_discovery(&self, info_hash: &[u8; 20]) -> bool {
        if let Some(dht) = &self.dht {
            dht.remove_torrent(info_hash);
        }
        self.swarms.write().remove(info_hash).is_some()
    }

    pub fn torrent_count(&self) -> usize {
        self.swarms.read().len()
    }

    /// Shuts the DHT node down and signals background tasks to exit.
    ///
    /// Tasks observe the signal and finish on their own; use
    /// [`shutdown`](Self::shutdown) to wait for them.
    pub fn stop(&self) {
        info!("Stopping session with {} torrents", self.torrent_count());

        if let Some(dht) = &self.dht {
            dht.node().shutdown();
        }
        self.stop.notify_one();
        self.swarms.write().clear();
    }

    /// Stops the session and waits for its background tasks. Returns how
    /// many of them exited on their own.
    pub async fn shutdown(&self) -> usize {
        self.stop();

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        let total = tasks.len();
        let clean = join_all(tasks)
            .await
            .into_iter()
            .filter(|r| r.is_ok())
            .count();

        if clean < total {
            warn!("{} of {} session tasks did not exit cleanly", total - clean, total);
        }
        clean
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

fn build_seeder<C: AnnounceClient>(
    info_hash: [u8; 20],
    port: u16,
    urls: Vec<String>,
    config: &SessionConfig,
    limiter: &AnnounceLimiter,
) -> Result<Option<Arc<TrackerSeeder<C>>>, SessionError> {
    if urls.is_empty() {
        return Ok(None);
    }

    let seeder = TrackerSeeder::new(
        info_hash,
        port,
        urls,
        config.tracker.clone(),
        limiter.clone(),
    )?;
    Ok(Some(Arc::new(seeder)))
}

async fn run_dht_seeder(seeder: Arc<DhtSeeder>, stop: Arc<Notify>) {
    let mut tick = tokio::time::interval(DHT_SEEDER_TICK);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    tick.tick().await;

    loop {
        tokio::select! {
            _ = stop.notified() => break,
            _ = tick.tick() => {
                if !seeder.node().is_running() {
                    break;
                }
                seeder.periodic_maintenance().await;
            }
        }
    }
}
