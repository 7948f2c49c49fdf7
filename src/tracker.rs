//! Tracker protocol (BEP-3, BEP-15, BEP-48)
//!
//! HTTP and UDP tracker clients behind one [`AnnounceClient`] trait, and a
//! [`TrackerSeeder`] that keeps a torrent announced across a pool of tracker
//! URLs with failover.

mod client;
mod error;
mod http;
mod peer_id;
mod response;
mod seeder;
mod udp;

pub use client::{AnnounceClient, AnnounceRequest};
pub use error::TrackerError;
pub use http::HttpTracker;
pub use peer_id::PeerId;
pub use response::{
    parse_announce_response, parse_compact_peers, parse_scrape_response, scrape_url,
    AnnounceResponse, Peer, ScrapeFile, ScrapeResponse, TrackerEvent,
};
pub use seeder::{AnnounceLimiter, HttpSeeder, TrackerSeeder, TrackerStats, UdpSeeder};
pub use udp::{encode_announce, parse_udp_announce, parse_udp_url, UdpTracker};

#[cfg(test)]
mod tests;
