use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tracing::trace;

use super::node::{Node, NodeId};
use crate::config::{validate_bucket_size, ConfigError};
use crate::constants::DHT_ID_BITS;

/// Buckets with no contact refreshed in this long are refreshed by lookup.
const BUCKET_REFRESH_AGE: Duration = Duration::from_secs(15 * 60);

#[derive(Debug)]
struct Bucket {
    /// Least recently seen at the front.
    nodes: VecDeque<Node>,
    replacement_cache: VecDeque<Node>,
}

impl Bucket {
    fn new(k: usize) -> Self {
        Self {
            nodes: VecDeque::with_capacity(k),
            replacement_cache: VecDeque::with_capacity(k),
        }
    }

    fn position(&self, id: &NodeId) -> Option<usize> {
        self.nodes.iter().position(|n| &n.id == id)
    }

    fn get_mut(&mut self, id: &NodeId) -> Option<&mut Node> {
        self.nodes.iter_mut().find(|n| &n.id == id)
    }

    /// Moves the contact at `pos` to the most-recently-seen end.
    fn move_to_back(&mut self, pos: usize) {
        if let Some(node) = self.nodes.remove(pos) {
            self.nodes.push_back(node);
        }
    }

    fn remove(&mut self, id: &NodeId) -> Option<Node> {
        let removed = self.nodes.remove(self.position(id)?);

        if let Some(replacement) = self.replacement_cache.pop_front() {
            self.nodes.push_back(replacement);
        }

        removed
    }

    fn push_replacement(&mut self, node: Node, k: usize) {
        self.replacement_cache.retain(|n| n.id != node.id);
        if self.replacement_cache.len() >= k {
            self.replacement_cache.pop_front();
        }
        self.replacement_cache.push_back(node);
    }

    /// Drops the least recently seen questionable contact, if there is one.
    fn evict_questionable(&mut self, now: Instant) -> Option<Node> {
        let pos = self.nodes.iter().position(|n| n.is_questionable_at(now))?;
        self.nodes.remove(pos)
    }
}

/// Kademlia routing table keyed by XOR distance from the local id.
///
/// The table starts with a single bucket covering the whole keyspace. When
/// the last bucket is full it splits: a new bucket is appended and every
/// contact sharing more than `last_index` leading bits with the local id
/// moves into it. Buckets are never merged and there are at most 160.
///
/// Mutating methods take `&mut self`; the DHT node wraps the table in a lock
/// and hands out copies to outside readers.
#[derive(Debug)]
pub struct RoutingTable {
    our_id: NodeId,
    k: usize,
    buckets: Vec<Bucket>,
}

impl RoutingTable {
    pub fn new(our_id: NodeId, k: usize) -> Result<Self, ConfigError> {
        validate_bucket_size(k)?;

        Ok(Self {
            our_id,
            k,
            buckets: vec![Bucket::new(k)],
        })
    }

    pub fn our_id(&self) -> &NodeId {
        &self.our_id
    }

    pub fn k(&self) -> usize {
        self.k
    }

    fn bucket_index(&self, id: &NodeId) -> usize {
        self.our_id
            .shared_prefix_len(id)
            .min(self.buckets.len() - 1)
    }

    /// Inserts or refreshes a contact.
    ///
    /// Returns `false` for the local id, and when the owning bucket is full,
    /// cannot split and holds no questionable contact; the contact then goes
    /// to that bucket's replacement cache.
    pub fn add_node(&mut self, id: NodeId, addr: SocketAddr) -> bool {
        self.add_node_at(id, addr, Instant::now())
    }

    pub fn add_node_at(&mut self, id: NodeId, addr: SocketAddr, now: Instant) -> bool {
        if id == self.our_id {
            return false;
        }

        loop {
            let idx = self.bucket_index(&id);
            let is_last = idx == self.buckets.len() - 1;
            let can_split = is_last && self.buckets.len() < DHT_ID_BITS;
            let k = self.k;
            let bucket = &mut self.buckets[idx];

            if let Some(pos) = bucket.position(&id) {
                if let Some(node) = bucket.nodes.get_mut(pos) {
                    node.addr = addr;
                    node.last_seen = now;
                }
                bucket.move_to_back(pos);
                return true;
            }

            if bucket.nodes.len() < k {
                bucket.nodes.push_back(Node::seen_at(id, addr, now));
                return true;
            }

            if can_split {
                self.split_last();
                continue;
            }

            if let Some(evicted) = bucket.evict_questionable(now) {
                trace!(evicted = %evicted.id, added = %id, "replaced questionable contact");
                bucket.nodes.push_back(Node::seen_at(id, addr, now));
                return true;
            }

            bucket.push_replacement(Node::seen_at(id, addr, now), k);
            return false;
        }
    }

    fn split_last(&mut self) {
        let last = self.buckets.len() - 1;
        let our_id = self.our_id;
        let mut new_bucket = Bucket::new(self.k);
        let old = &mut self.buckets[last];

        let (stay, moved): (VecDeque<Node>, VecDeque<Node>) = old
            .nodes
            .drain(..)
            .partition(|n| our_id.shared_prefix_len(&n.id) == last);
        old.nodes = stay;
        new_bucket.nodes = moved;

        let (stay, moved): (VecDeque<Node>, VecDeque<Node>) = old
            .replacement_cache
            .drain(..)
            .partition(|n| our_id.shared_prefix_len(&n.id) == last);
        old.replacement_cache = stay;
        new_bucket.replacement_cache = moved;

        trace!(
            bucket = last,
            kept = old.nodes.len(),
            moved = new_bucket.nodes.len(),
            "split routing bucket"
        );
        self.buckets.push(new_bucket);
    }

    pub fn remove_node(&mut self, id: &NodeId) -> Option<Node> {
        let idx = self.bucket_index(id);
        self.buckets[idx].remove(id)
    }

    /// Records a response from `id`. Returns `false` if the contact is unknown.
    pub fn mark_good(&mut self, id: &NodeId) -> bool {
        self.mark_good_at(id, Instant::now())
    }

    pub fn mark_good_at(&mut self, id: &NodeId, now: Instant) -> bool {
        let idx = self.bucket_index(id);
        let bucket = &mut self.buckets[idx];

        match bucket.position(id) {
            Some(pos) => {
                if let Some(node) = bucket.nodes.get_mut(pos) {
                    node.mark_good(now);
                }
                bucket.move_to_back(pos);
                true
            }
            None => false,
        }
    }

    /// Records a failed exchange with `id`.
    ///
    /// The contact is evicted past the failure ceiling, or as soon as it is
    /// no longer good while a replacement is waiting for its slot.
    pub fn mark_bad(&mut self, id: &NodeId) {
        self.mark_bad_at(id, Instant::now())
    }

    pub fn mark_bad_at(&mut self, id: &NodeId, now: Instant) {
        let idx = self.bucket_index(id);
        let bucket = &mut self.buckets[idx];
        let has_replacement = !bucket.replacement_cache.is_empty();

        if let Some(node) = bucket.get_mut(id) {
            node.mark_bad();

            if node.is_bad() || (has_replacement && !node.is_good_at(now)) {
                trace!(node = %id, fails = node.fail_count, "evicting failed contact");
                bucket.remove(id);
            }
        }
    }

    /// Removes contacts idle for longer than `max_age`. Returns how many were removed.
    pub fn cleanup_stale(&mut self, max_age: Duration) -> usize {
        self.cleanup_stale_at(max_age, Instant::now())
    }

    pub fn cleanup_stale_at(&mut self, max_age: Duration, now: Instant) -> usize {
        let is_stale = |n: &Node| now.saturating_duration_since(n.last_seen) > max_age;
        let mut removed = 0;

        for bucket in &mut self.buckets {
            let before = bucket.nodes.len();
            bucket.nodes.retain(|n| !is_stale(n));
            bucket.replacement_cache.retain(|n| !is_stale(n));
            removed += before - bucket.nodes.len();

            while bucket.nodes.len() < self.k {
                match bucket.replacement_cache.pop_front() {
                    Some(replacement) => bucket.nodes.push_back(replacement),
                    None => break,
                }
            }
        }

        removed
    }

    /// The `count` good contacts closest to `target`, nearest first.
    pub fn find_closest_nodes(&self, target: &NodeId, count: usize) -> Vec<Node> {
        self.find_closest_nodes_at(target, count, Instant::now())
    }

    pub fn find_closest_nodes_at(&self, target: &NodeId, count: usize, now: Instant) -> Vec<Node> {
        let mut nodes: Vec<Node> = self
            .buckets
            .iter()
            .flat_map(|b| b.nodes.iter())
            .filter(|n| n.is_good_at(now))
            .cloned()
            .collect();

        // stable: equal distances keep table order
        nodes.sort_by_cached_key(|n| n.id.distance(target));
        nodes.truncate(count);
        nodes
    }

    /// Contacts that are no longer good and should be pinged.
    pub fn questionable_nodes_at(&self, now: Instant) -> Vec<Node> {
        self.buckets
            .iter()
            .flat_map(|b| b.nodes.iter())
            .filter(|n| n.is_questionable_at(now))
            .cloned()
            .collect()
    }

    pub fn node_count(&self) -> usize {
        self.buckets.iter().map(|b| b.nodes.len()).sum()
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    pub fn bucket_occupancy(&self) -> Vec<usize> {
        self.buckets.iter().map(|b| b.nodes.len()).collect()
    }

    pub fn replacement_count(&self) -> usize {
        self.buckets.iter().map(|b| b.replacement_cache.len()).sum()
    }

    pub fn all_nodes(&self) -> Vec<Node> {
        self.buckets
            .iter()
            .flat_map(|b| b.nodes.iter().cloned())
            .collect()
    }

    pub fn find_node(&self, id: &NodeId) -> Option<Node> {
        let idx = self.bucket_index(id);
        self.buckets[idx].nodes.iter().find(|n| &n.id == id).cloned()
    }

    /// Indices of buckets whose most recently seen contact is older than the refresh age.
    pub fn stale_buckets(&self) -> Vec<usize> {
        let now = Instant::now();

        self.buckets
            .iter()
            .enumerate()
            .filter(|(_, b)| {
                b.nodes
                    .back()
                    .is_some_and(|n| now.saturating_duration_since(n.last_seen) > BUCKET_REFRESH_AGE)
            })
            .map(|(i, _)| i)
            .collect()
    }
}
