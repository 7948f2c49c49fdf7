use bytes::Bytes;
use thiserror::Error;

use crate::config::ConfigError;
use crate::constants::DHT_ERROR_PROTOCOL;

#[derive(Debug, Error)]
pub enum DhtError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bencode error: {0}")]
    Bencode(#[from] crate::bencode::BencodeError),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("unknown query: {0}")]
    UnknownQuery(String),

    /// A known query with missing or malformed arguments; answered with 203.
    #[error("malformed query: {message}")]
    MalformedQuery {
        transaction_id: Bytes,
        message: String,
    },

    #[error("invalid node id length")]
    InvalidNodeId,

    /// A well-formed message that violates the protocol; sent back as a KRPC error.
    #[error("protocol error {code}: {message}")]
    Protocol { code: i64, message: String },

    #[error("timeout")]
    Timeout,

    #[error("rate limited")]
    RateLimited,

    #[error("dht node is shut down")]
    Shutdown,

    #[error("no node acknowledged the announce")]
    AnnounceFailed,

    #[error("config error: {0}")]
    Config(#[from] ConfigError),
}

impl DhtError {
    pub fn invalid_token() -> Self {
        DhtError::Protocol {
            code: DHT_ERROR_PROTOCOL,
            message: "Invalid token".to_string(),
        }
    }
}
