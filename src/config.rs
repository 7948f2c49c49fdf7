//! Runtime configuration.
//!
//! Every component takes its configuration at construction time. Defaults
//! come from [`crate::constants`].

use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

use crate::constants::*;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("bucket size must be between 1 and {max}, got {got}")]
    InvalidBucketSize { got: usize, max: usize },

    #[error("{0} must be non-zero")]
    ZeroDuration(&'static str),

    #[error("{0} must be non-zero")]
    ZeroLimit(&'static str),

    #[error("invalid tracker url: {0}")]
    InvalidTrackerUrl(String),
}

/// Settings for the DHT node and its discovery engine.
#[derive(Debug, Clone)]
pub struct DhtConfig {
    /// Local UDP address to bind.
    pub bind_addr: SocketAddr,
    /// Bucket size `k`; also the replacement cache capacity.
    pub k: usize,
    /// `host:port` routers pinged on bootstrap.
    pub bootstrap_nodes: Vec<String>,
    pub bootstrap_delay: Duration,
    pub query_timeout: Duration,
    pub max_pending_queries: usize,
    pub lookup_rounds: usize,
    pub lookup_target_peers: usize,
    /// Re-announce and maintenance period.
    pub announce_interval: Duration,
    pub token_ttl: Duration,
    /// Contacts idle for longer than this are dropped during maintenance.
    pub node_max_age: Duration,
    pub peer_max_age: Duration,
    pub max_peers_per_torrent: usize,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            k: DHT_K,
            bootstrap_nodes: DHT_BOOTSTRAP_NODES.iter().map(|s| s.to_string()).collect(),
            bootstrap_delay: DHT_BOOTSTRAP_DELAY,
            query_timeout: DHT_QUERY_TIMEOUT,
            max_pending_queries: MAX_PENDING_DHT_QUERIES,
            lookup_rounds: DHT_LOOKUP_ROUNDS,
            lookup_target_peers: DHT_LOOKUP_TARGET_PEERS,
            announce_interval: DHT_ANNOUNCE_INTERVAL,
            token_ttl: DHT_TOKEN_TTL,
            node_max_age: DHT_NODE_GOOD_AGE,
            peer_max_age: DHT_PEER_MAX_AGE,
            max_peers_per_torrent: DHT_MAX_PEERS_PER_TORRENT,
        }
    }
}

impl DhtConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_bucket_size(self.k)?;

        let durations = [
            ("query_timeout", self.query_timeout),
            ("announce_interval", self.announce_interval),
            ("token_ttl", self.token_ttl),
            ("node_max_age", self.node_max_age),
            ("peer_max_age", self.peer_max_age),
        ];
        for (name, value) in durations {
            if value.is_zero() {
                return Err(ConfigError::ZeroDuration(name));
            }
        }

        let limits = [
            ("max_pending_queries", self.max_pending_queries),
            ("lookup_rounds", self.lookup_rounds),
            ("max_peers_per_torrent", self.max_peers_per_torrent),
        ];
        for (name, value) in limits {
            if value == 0 {
                return Err(ConfigError::ZeroLimit(name));
            }
        }

        Ok(())
    }
}

pub(crate) fn validate_bucket_size(k: usize) -> Result<(), ConfigError> {
    if k == 0 || k > 64 {
        return Err(ConfigError::InvalidBucketSize { got: k, max: 64 });
    }
    Ok(())
}

/// Settings shared by the HTTP and UDP tracker seeders.
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    pub http_timeout: Duration,
    pub udp_timeout: Duration,
    /// Attempts per announce call; each failed attempt fails over.
    pub max_retries: u32,
    pub numwant: u32,
    /// Concurrent tracker round-trips per torrent.
    pub max_concurrent: usize,
    pub permit_timeout: Duration,
    /// Perform the BEP-15 connect handshake instead of announcing directly
    /// with the protocol id as connection id.
    pub udp_connect: bool,
    pub user_agent: String,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            http_timeout: HTTP_TRACKER_TIMEOUT,
            udp_timeout: UDP_TRACKER_TIMEOUT,
            max_retries: TRACKER_MAX_RETRIES,
            numwant: TRACKER_NUMWANT,
            max_concurrent: TRACKER_MAX_CONCURRENT,
            permit_timeout: TRACKER_PERMIT_TIMEOUT,
            udp_connect: false,
            user_agent: USER_AGENT.to_string(),
        }
    }
}

impl TrackerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.http_timeout.is_zero() {
            return Err(ConfigError::ZeroDuration("http_timeout"));
        }
        if self.udp_timeout.is_zero() {
            return Err(ConfigError::ZeroDuration("udp_timeout"));
        }
        if self.permit_timeout.is_zero() {
            return Err(ConfigError::ZeroDuration("permit_timeout"));
        }
        if self.max_retries == 0 {
            return Err(ConfigError::ZeroLimit("max_retries"));
        }
        if self.max_concurrent == 0 {
            return Err(ConfigError::ZeroLimit("max_concurrent"));
        }
        Ok(())
    }
}

/// Top-level settings for a [`crate::session::Session`].
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// `None` runs trackers only.
    pub dht: Option<DhtConfig>,
    pub tracker: TrackerConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            dht: Some(DhtConfig::default()),
            tracker: TrackerConfig::default(),
        }
    }
}

impl SessionConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(dht) = &self.dht {
            dht.validate()?;
        }
        self.tracker.validate()
    }
}
