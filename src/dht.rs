//! Distributed Hash Table (BEP-5)
//!
//! This module implements the Kademlia-based DHT used by BitTorrent
//! for trackerless peer discovery.
//!
//! | Type | Role |
//! |------|------|
//! | [`RoutingTable`] | k-buckets of known contacts, split on demand |
//! | [`PeerDiscovery`] | iterative `get_peers` lookups and inbound handlers |
//! | [`RpcSocket`] | UDP socket and outstanding-query correlation |
//! | [`DhtNode`] | read loop, bootstrap and maintenance |
//! | [`DhtSeeder`] | per-torrent announce bookkeeping |

mod discovery;
mod error;
mod message;
mod node;
mod routing;
mod rpc;
mod seeder;
mod server;
mod storage;

pub use discovery::{LookupOutcome, PeerDiscovery, QueryTransport};
pub use error::DhtError;
pub use message::{DhtMessage, DhtQuery, DhtResponse, QueryKind, TransactionId};
pub use node::{peer_from_compact, peer_to_compact, Node, NodeId};
pub use routing::RoutingTable;
pub use rpc::RpcSocket;
pub use seeder::{DhtSeeder, DhtStats, TorrentEntry};
pub use server::{DhtNode, Engine, MaintenanceReport};
pub use storage::{PeerInfo, PeerStorage, TokenStore};
