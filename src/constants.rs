//! Protocol constants and tuning defaults.
//!
//! These are the defaults used to build [`crate::config`] structs. Protocol
//! values (magic numbers, error codes) are fixed by the relevant BEPs.

use std::time::Duration;

// ============================================================================
// Client identification
// ============================================================================

/// Client ID prefix for peer ID generation (Azureus-style)
pub const CLIENT_PREFIX: &[u8; 8] = b"-SS0001-";

/// User agent string for HTTP tracker requests
pub const USER_AGENT: &str = "swarmseed/0.1.0";

/// Default BitTorrent listen port
pub const DEFAULT_PORT: u16 = 6881;

// ============================================================================
// DHT (BEP-5)
// ============================================================================

/// Kademlia bucket size
pub const DHT_K: usize = 8;

/// Identifier width in bits, and therefore the maximum number of buckets
pub const DHT_ID_BITS: usize = 160;

/// Contacts with this many consecutive failures are no longer good
pub const DHT_QUESTIONABLE_FAILURES: u32 = 3;

/// Contacts are evicted once their failure count exceeds this ceiling
pub const DHT_FAIL_CEILING: u32 = 5;

/// Contacts not heard from in this long are questionable
pub const DHT_NODE_GOOD_AGE: Duration = Duration::from_secs(60 * 60);

/// Timeout for a single outbound KRPC query
pub const DHT_QUERY_TIMEOUT: Duration = Duration::from_secs(15);

/// Maximum outstanding KRPC queries
pub const MAX_PENDING_DHT_QUERIES: usize = 1024;

/// Rounds of an iterative get_peers lookup
pub const DHT_LOOKUP_ROUNDS: usize = 3;

/// A lookup stops early once this many peers are known
pub const DHT_LOOKUP_TARGET_PEERS: usize = 50;

/// Re-announce and maintenance interval
pub const DHT_ANNOUNCE_INTERVAL: Duration = Duration::from_secs(30 * 60);

/// Delay between bootstrap pings
pub const DHT_BOOTSTRAP_DELAY: Duration = Duration::from_millis(100);

/// Lifetime of a token handed out in get_peers responses
pub const DHT_TOKEN_TTL: Duration = Duration::from_secs(10 * 60);

/// Length of issued tokens in bytes
pub const DHT_TOKEN_LEN: usize = 8;

/// Stored peers older than this are pruned
pub const DHT_PEER_MAX_AGE: Duration = Duration::from_secs(30 * 60);

/// Maximum stored peers per info-hash
pub const DHT_MAX_PEERS_PER_TORRENT: usize = 1000;

/// Most peers returned as `values` in one get_peers reply
pub const DHT_MAX_VALUES_PER_REPLY: usize = 50;

/// KRPC protocol error: malformed arguments or a bad announce token
pub const DHT_ERROR_PROTOCOL: i64 = 203;

/// Well-known routers used to join the DHT
pub const DHT_BOOTSTRAP_NODES: &[&str] = &[
    "router.bittorrent.com:6881",
    "dht.transmissionbt.com:6881",
    "router.utorrent.com:6881",
];

/// Largest datagram we are prepared to read
pub const MAX_DATAGRAM_SIZE: usize = 65_535;

// ============================================================================
// Trackers (BEP-3, BEP-15, BEP-23)
// ============================================================================

/// HTTP tracker request timeout
pub const HTTP_TRACKER_TIMEOUT: Duration = Duration::from_secs(30);

/// UDP tracker response timeout
pub const UDP_TRACKER_TIMEOUT: Duration = Duration::from_secs(15);

/// Attempts per announce before reporting failure
pub const TRACKER_MAX_RETRIES: u32 = 3;

/// Peers requested per announce
pub const TRACKER_NUMWANT: u32 = 200;

/// Concurrent tracker round-trips allowed per torrent
pub const TRACKER_MAX_CONCURRENT: usize = 2;

/// How long an announce waits for a round-trip slot
pub const TRACKER_PERMIT_TIMEOUT: Duration = Duration::from_secs(10);

/// Interval assumed until a tracker reports one
pub const TRACKER_DEFAULT_INTERVAL: u32 = 1800;

/// BEP-15 protocol id, also used as the connection id of a direct announce
pub const UDP_PROTOCOL_ID: u64 = 0x41727101980;
