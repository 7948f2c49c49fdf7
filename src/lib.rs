//! swarmseed - BitTorrent swarm discovery
//!
//! Finds and advertises peers for a set of torrents through the mainline DHT
//! and through HTTP and UDP trackers.
//!
//! # Modules
//!
//! - [`bencode`] - BEP-3 Bencode encoding/decoding
//! - [`dht`] - BEP-5 Distributed Hash Table node, lookups and seeding
//! - [`tracker`] - BEP-3/15/48 HTTP and UDP tracker announces and scrapes
//! - [`session`] - One facade over the DHT and the trackers, keyed by info-hash
//! - [`config`] - Runtime settings and their validation
//! - [`constants`] - Protocol constants and defaults

pub mod bencode;
pub mod config;
pub mod constants;
pub mod dht;
pub mod session;
pub mod tracker;

pub use bencode::{decode, encode, BencodeError, Value};
pub use config::{ConfigError, DhtConfig, SessionConfig, TrackerConfig};
pub use dht::{DhtError, DhtMessage, DhtNode, DhtSeeder, Node, NodeId, RoutingTable};
pub use session::{Session, SessionError, SwarmStats};
pub use tracker::{
    AnnounceResponse, HttpSeeder, HttpTracker, PeerId, ScrapeResponse, TrackerError,
    TrackerEvent, UdpSeeder, UdpTracker,
};
