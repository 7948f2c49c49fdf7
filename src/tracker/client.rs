use async_trait::async_trait;

use super::error::TrackerError;
use super::peer_id::PeerId;
use super::response::{AnnounceResponse, ScrapeFile, TrackerEvent};
use crate::config::TrackerConfig;

/// Parameters of one announce round-trip.
#[derive(Debug, Clone)]
pub struct AnnounceRequest {
    pub info_hash: [u8; 20],
    pub peer_id: PeerId,
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    pub event: TrackerEvent,
    /// Stable per-torrent key so the tracker can recognise us across IP changes.
    pub key: u32,
    pub numwant: u32,
}

/// A tracker transport, HTTP or UDP.
#[async_trait]
pub trait AnnounceClient: Send + Sync + Sized + 'static {
    /// Connects to (or prepares requests for) the tracker at `url`.
    async fn open(url: &str, config: &TrackerConfig) -> Result<Self, TrackerError>;

    async fn announce(&self, request: &AnnounceRequest) -> Result<AnnounceResponse, TrackerError>;

    async fn scrape(&self, info_hash: &[u8; 20]) -> Result<ScrapeFile, TrackerError>;

    fn url(&self) -> &str;
}
