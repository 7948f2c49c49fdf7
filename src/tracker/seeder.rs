use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

use super::client::{AnnounceClient, AnnounceRequest};
use super::error::TrackerError;
use super::http::HttpTracker;
use super::peer_id::PeerId;
use super::response::{AnnounceResponse, Peer, ScrapeFile, TrackerEvent};
use super::udp::UdpTracker;
use crate::config::TrackerConfig;
use crate::constants::TRACKER_DEFAULT_INTERVAL;

pub type HttpSeeder = TrackerSeeder<HttpTracker>;
pub type UdpSeeder = TrackerSeeder<UdpTracker>;

/// Caps concurrent tracker round-trips for one torrent.
///
/// Clones share the same permits, so one limiter can be handed to every
/// seeder of a torrent. Acquisition always has a deadline; the permit is
/// released when the guard drops.
#[derive(Debug, Clone)]
pub struct AnnounceLimiter {
    permits: Arc<Semaphore>,
    wait: Duration,
}

impl AnnounceLimiter {
    pub fn new(max_concurrent: usize, wait: Duration) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_concurrent)),
            wait,
        }
    }

    pub fn from_config(config: &TrackerConfig) -> Self {
        Self::new(config.max_concurrent, config.permit_timeout)
    }

    /// Waits up to the configured deadline. `None` means no slot freed up in time.
    pub async fn acquire(&self) -> Option<OwnedSemaphorePermit> {
        tokio::time::timeout(self.wait, Arc::clone(&self.permits).acquire_owned())
            .await
            .ok()?
            .ok()
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}

/// Swarm numbers from the most recent successful announce.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrackerStats {
    pub seeders: u32,
    pub leechers: u32,
    pub interval: u32,
    pub last_announce: Option<Instant>,
    pub announces: u64,
    pub failures: u64,
}

struct SeederState<C> {
    active: usize,
    client: Option<Arc<C>>,
    started: bool,
    /// Sent as `key`; regenerated whenever the seeder moves to another tracker.
    key: u32,
    uploaded: u64,
    downloaded: u64,
    left: u64,
    peers: Vec<Peer>,
    stats: TrackerStats,
}

/// Announces one torrent to a pool of tracker URLs of a single transport.
///
/// The active URL is used until an attempt against it fails; the seeder then
/// rotates to the next URL in the pool with a fresh `key` and a new
/// `started` event. A call whose every attempt failed never leaves the
/// tracker it started on active. Failures never surface as errors:
/// [`load_peers`](Self::load_peers) and [`upload`](Self::upload) report
/// success as a `bool` and the caller retries on its next cycle.
pub struct TrackerSeeder<C> {
    info_hash: [u8; 20],
    peer_id: PeerId,
    port: u16,
    urls: Vec<String>,
    config: TrackerConfig,
    limiter: AnnounceLimiter,
    state: Mutex<SeederState<C>>,
}

impl<C: AnnounceClient> TrackerSeeder<C> {
    pub fn new(
        info_hash: [u8; 20],
        port: u16,
        urls: Vec<String>,
        config: TrackerConfig,
        limiter: AnnounceLimiter,
    ) -> Result<Self, TrackerError> {
        config.validate()?;
        if urls.is_empty() {
            return Err(TrackerError::NoTrackers);
        }

        Ok(Self {
            info_hash,
            peer_id: PeerId::generate(),
            port,
            urls,
            config,
            limiter,
            state: Mutex::new(SeederState {
                active: 0,
                client: None,
                started: false,
                key: rand::random(),
                uploaded: 0,
                downloaded: 0,
                left: 0,
                peers: Vec::new(),
                stats: TrackerStats {
                    interval: TRACKER_DEFAULT_INTERVAL,
                    ..TrackerStats::default()
                },
            }),
        })
    }

    pub fn info_hash(&self) -> &[u8; 20] {
        &self.info_hash
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    pub fn urls(&self) -> &[String] {
        &self.urls
    }

    pub fn active_url(&self) -> &str {
        &self.urls[self.state.lock().active]
    }

    /// Announces with the current counters to refresh the peer list.
    pub async fn load_peers(&self) -> bool {
        self.announce().await
    }

    /// Records new transfer counters and announces them.
    pub async fn upload(&self, uploaded: u64, downloaded: u64, left: u64) -> bool {
        {
            let mut state = self.state.lock();
            state.uploaded = uploaded;
            state.downloaded = downloaded;
            state.left = left;
        }
        self.announce().await
    }

    async fn announce(&self) -> bool {
        let Some(_permit) = self.limiter.acquire().await else {
            debug!(
                tracker = %self.active_url(),
                "no announce slot within {:?}, skipping this cycle",
                self.limiter.wait
            );
            return false;
        };

        let first = self.state.lock().active;

        for attempt in 1..=self.config.max_retries {
            let (client, request) = match self.prepare().await {
                Ok(prepared) => prepared,
                Err(e) => {
                    self.fail_over(attempt, &e);
                    continue;
                }
            };

            match client.announce(&request).await {
                Ok(response) => {
                    self.record(response);
                    return true;
                }
                Err(e) => self.fail_over(attempt, &e),
            }
        }

        // the rotation wrapped around to the tracker that failed first
        let mut state = self.state.lock();
        if state.active == first && self.urls.len() > 1 {
            state.active = (first + 1) % self.urls.len();
            debug!(next = %self.urls[state.active], "skipping tracker that just failed");
        }

        false
    }

    /// The client for the active URL, opened on first use, and the request to send.
    async fn prepare(&self) -> Result<(Arc<C>, AnnounceRequest), TrackerError> {
        let (existing, url) = {
            let state = self.state.lock();
            (state.client.clone(), self.urls[state.active].clone())
        };

        let client = match existing {
            Some(client) => client,
            None => {
                let client = Arc::new(C::open(&url, &self.config).await?);
                let mut state = self.state.lock();
                if self.urls[state.active] == url {
                    state.client = Some(Arc::clone(&client));
                }
                client
            }
        };

        let state = self.state.lock();
        let request = AnnounceRequest {
            info_hash: self.info_hash,
            peer_id: self.peer_id,
            port: self.port,
            uploaded: state.uploaded,
            downloaded: state.downloaded,
            left: state.left,
            event: if state.started {
                TrackerEvent::None
            } else {
                TrackerEvent::Started
            },
            key: state.key,
            numwant: self.config.numwant,
        };

        Ok((client, request))
    }

    fn record(&self, response: AnnounceResponse) {
        let mut state = self.state.lock();
        let url = &self.urls[state.active];

        info!(
            tracker = %url,
            peers = response.peers.len(),
            seeders = response.complete.unwrap_or(0),
            leechers = response.incomplete.unwrap_or(0),
            "tracker announce ok"
        );

        state.started = true;
        state.stats.seeders = response.complete.unwrap_or(0);
        state.stats.leechers = response.incomplete.unwrap_or(0);
        state.stats.interval = response.interval;
        state.stats.last_announce = Some(Instant::now());
        state.stats.announces += 1;
        state.peers = response.peers;
    }

    /// Drops the active client and moves to the next URL with fresh per-tracker state.
    fn fail_over(&self, attempt: u32, error: &TrackerError) {
        let mut state = self.state.lock();
        let failed = state.active;
        state.active = (failed + 1) % self.urls.len();
        state.client = None;
        state.started = false;
        state.key = rand::random();
        state.stats.failures += 1;

        warn!(
            tracker = %self.urls[failed],
            next = %self.urls[state.active],
            attempt,
            "tracker announce failed: {}",
            error
        );
    }

    pub fn peers(&self) -> Vec<SocketAddr> {
        self.state.lock().peers.iter().map(|p| p.addr).collect()
    }

    /// Peers with the ids the tracker reported, if any.
    pub fn peer_list(&self) -> Vec<Peer> {
        self.state.lock().peers.clone()
    }

    pub fn stats(&self) -> TrackerStats {
        self.state.lock().stats.clone()
    }

    /// Scrapes the active tracker for this torrent.
    pub async fn scrape(&self) -> Result<ScrapeFile, TrackerError> {
        let (client, _) = self.prepare().await?;
        client.scrape(&self.info_hash).await
    }
}
