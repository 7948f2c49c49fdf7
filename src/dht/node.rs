use super::error::DhtError;
use crate::constants::{DHT_FAIL_CEILING, DHT_NODE_GOOD_AGE, DHT_QUESTIONABLE_FAILURES};
use rand::Rng as _;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Instant;

/// Length of a compact node entry: 20-byte id, 4-byte IPv4, 2-byte port.
pub const COMPACT_NODE_LEN: usize = 26;

/// Length of a compact peer entry: 4-byte IPv4, 2-byte port.
pub const COMPACT_PEER_LEN: usize = 6;

/// A 160-bit DHT identifier. Info-hashes share the same keyspace.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub [u8; 20]);

impl NodeId {
    pub fn generate() -> Self {
        let mut id = [0u8; 20];
        rand::rng().fill(&mut id);
        Self(id)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DhtError> {
        let id: [u8; 20] = bytes.try_into().map_err(|_| DhtError::InvalidNodeId)?;
        Ok(Self(id))
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    pub fn distance(&self, other: &NodeId) -> [u8; 20] {
        let mut dist = [0u8; 20];
        for (i, d) in dist.iter_mut().enumerate() {
            *d = self.0[i] ^ other.0[i];
        }
        dist
    }

    /// Number of leading bits shared with `other`, i.e. `160 - bit_length(distance)`.
    ///
    /// Returns 160 for identical ids.
    pub fn shared_prefix_len(&self, other: &NodeId) -> usize {
        let dist = self.distance(other);

        for (i, &byte) in dist.iter().enumerate() {
            if byte != 0 {
                return i * 8 + byte.leading_zeros() as usize;
            }
        }

        160
    }

    /// Returns a random id sharing exactly `prefix_len` leading bits with `self`.
    pub fn random_with_prefix(&self, prefix_len: usize) -> NodeId {
        if prefix_len >= 160 {
            return *self;
        }

        let mut id = NodeId::generate().0;
        let byte_idx = prefix_len / 8;
        let bit_idx = 7 - (prefix_len % 8);

        id[..byte_idx].copy_from_slice(&self.0[..byte_idx]);

        let keep_mask: u8 = !((1u16 << (bit_idx + 1)) - 1) as u8;
        let flip = !self.0[byte_idx] & (1 << bit_idx);
        id[byte_idx] = (self.0[byte_idx] & keep_mask) | flip | (id[byte_idx] & ((1 << bit_idx) - 1));

        NodeId(id)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({:02x}{:02x}..)", self.0[0], self.0[1])
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl From<[u8; 20]> for NodeId {
    fn from(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }
}

/// A routing table contact.
#[derive(Debug, Clone)]
pub struct Node {
    pub id: NodeId,
    pub addr: SocketAddr,
    pub last_seen: Instant,
    pub good_count: u32,
    pub fail_count: u32,
}

impl Node {
    pub fn new(id: NodeId, addr: SocketAddr) -> Self {
        Self::seen_at(id, addr, Instant::now())
    }

    pub fn seen_at(id: NodeId, addr: SocketAddr, last_seen: Instant) -> Self {
        Self {
            id,
            addr,
            last_seen,
            good_count: 0,
            fail_count: 0,
        }
    }

    /// Records a successful exchange.
    pub fn mark_good(&mut self, now: Instant) {
        self.last_seen = now;
        self.good_count = self.good_count.saturating_add(1);
        self.fail_count = 0;
    }

    /// Records a failed exchange.
    pub fn mark_bad(&mut self) {
        self.fail_count = self.fail_count.saturating_add(1);
    }

    pub fn is_good(&self) -> bool {
        self.is_good_at(Instant::now())
    }

    pub fn is_good_at(&self, now: Instant) -> bool {
        self.fail_count < DHT_QUESTIONABLE_FAILURES
            && now.saturating_duration_since(self.last_seen) < DHT_NODE_GOOD_AGE
    }

    pub fn is_questionable_at(&self, now: Instant) -> bool {
        !self.is_good_at(now)
    }

    /// True once the contact has failed often enough to be evicted.
    pub fn is_bad(&self) -> bool {
        self.fail_count > DHT_FAIL_CEILING
    }

    pub fn from_compact(data: &[u8]) -> Option<Self> {
        if data.len() != COMPACT_NODE_LEN {
            return None;
        }

        let id = NodeId::from_bytes(&data[..20]).ok()?;
        let addr = peer_from_compact(&data[20..])?;

        Some(Self::new(id, addr))
    }

    pub fn to_compact(&self) -> Option<[u8; COMPACT_NODE_LEN]> {
        let mut compact = [0u8; COMPACT_NODE_LEN];
        compact[..20].copy_from_slice(&self.id.0);
        compact[20..].copy_from_slice(&peer_to_compact(&self.addr)?);
        Some(compact)
    }
}

/// Parses a 6-byte compact IPv4 peer entry.
pub fn peer_from_compact(data: &[u8]) -> Option<SocketAddr> {
    if data.len() != COMPACT_PEER_LEN {
        return None;
    }
    let ip = Ipv4Addr::new(data[0], data[1], data[2], data[3]);
    let port = u16::from_be_bytes([data[4], data[5]]);
    Some(SocketAddr::new(IpAddr::V4(ip), port))
}

/// Encodes an IPv4 address as a 6-byte compact peer entry. IPv6 is not supported.
pub fn peer_to_compact(addr: &SocketAddr) -> Option<[u8; COMPACT_PEER_LEN]> {
    match addr {
        SocketAddr::V4(v4) => {
            let mut compact = [0u8; COMPACT_PEER_LEN];
            compact[..4].copy_from_slice(&v4.ip().octets());
            compact[4..].copy_from_slice(&v4.port().to_be_bytes());
            Some(compact)
        }
        SocketAddr::V6(_) => None,
    }
}
