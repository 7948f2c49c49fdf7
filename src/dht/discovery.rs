//! Iterative peer discovery and the inbound side of `get_peers` /
//! `announce_peer`.
//!
//! [`PeerDiscovery`] owns the routing table, the announced-peer storage and
//! the token store. Outbound queries go through a [`QueryTransport`], which
//! the DHT node implements on top of its UDP socket.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::{join_all, BoxFuture, FutureExt, Shared};
use parking_lot::{Mutex, RwLock};
use rand::seq::SliceRandom;
use tracing::{debug, info, trace};

use super::error::DhtError;
use super::message::{DhtQuery, DhtResponse};
use super::node::{Node, NodeId};
use super::routing::RoutingTable;
use super::storage::{PeerStorage, TokenStore};
use crate::config::{ConfigError, DhtConfig};
use crate::constants::DHT_MAX_VALUES_PER_REPLY;

/// Sends one KRPC query and waits for its response.
#[async_trait]
pub trait QueryTransport: Send + Sync + 'static {
    async fn query(&self, addr: SocketAddr, query: DhtQuery) -> Result<DhtResponse, DhtError>;
}

#[async_trait]
impl<T: QueryTransport> QueryTransport for Arc<T> {
    async fn query(&self, addr: SocketAddr, query: DhtQuery) -> Result<DhtResponse, DhtError> {
        (**self).query(addr, query).await
    }
}

/// What one iterative `get_peers` lookup found.
#[derive(Debug, Clone, Default)]
pub struct LookupOutcome {
    pub peers: Vec<SocketAddr>,
    /// Contacts that answered with a token, nearest to the info-hash first.
    pub tokens: Vec<(Node, Bytes)>,
    pub queried: usize,
    pub rounds: usize,
}

enum LookupPhase {
    /// Seed the candidate set from the routing table.
    Init,
    /// Send `get_peers` to every candidate not yet asked.
    Querying { round: usize },
    /// Fold contacts learned in `round` into the candidate set.
    Merging { round: usize, discovered: Vec<Node> },
    Done,
}

type SharedLookup = Shared<BoxFuture<'static, Arc<LookupOutcome>>>;

pub struct PeerDiscovery<T> {
    our_id: NodeId,
    transport: T,
    config: DhtConfig,
    routing: RwLock<RoutingTable>,
    storage: RwLock<PeerStorage>,
    tokens: Mutex<TokenStore>,
    discovered: RwLock<HashMap<[u8; 20], Vec<SocketAddr>>>,
    in_flight: Mutex<HashMap<[u8; 20], SharedLookup>>,
    lookups_started: AtomicUsize,
}

impl<T: QueryTransport> PeerDiscovery<T> {
    pub fn new(our_id: NodeId, transport: T, config: &DhtConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        Ok(Self {
            our_id,
            transport,
            routing: RwLock::new(RoutingTable::new(our_id, config.k)?),
            storage: RwLock::new(PeerStorage::new(config.max_peers_per_torrent)),
            tokens: Mutex::new(TokenStore::new(config.token_ttl)),
            discovered: RwLock::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
            lookups_started: AtomicUsize::new(0),
            config: config.clone(),
        })
    }

    pub fn our_id(&self) -> &NodeId {
        &self.our_id
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Sends `query` and applies the outcome to the routing table: responders
    /// are added and marked good, timed-out contacts are marked bad.
    pub async fn query_node(
        &self,
        addr: SocketAddr,
        id: Option<NodeId>,
        query: DhtQuery,
    ) -> Result<DhtResponse, DhtError> {
        let kind = query.kind();

        match self.transport.query(addr, query).await {
            Ok(response) => {
                let mut routing = self.routing.write();
                routing.add_node(response.id, addr);
                routing.mark_good(&response.id);
                Ok(response)
            }
            Err(e) => {
                trace!(%addr, %kind, error = %e, "query failed");
                if let (Some(id), DhtError::Timeout) = (id, &e) {
                    self.routing.write().mark_bad(&id);
                }
                Err(e)
            }
        }
    }

    pub async fn ping(&self, addr: SocketAddr) -> Result<NodeId, DhtError> {
        self.query_node(addr, None, DhtQuery::Ping)
            .await
            .map(|r| r.id)
    }

    /// Pings every questionable contact once. Contacts that answer are good
    /// again; the rest move towards eviction. Returns how many answered.
    pub async fn ping_questionable(&self) -> usize {
        let questionable = self.routing.read().questionable_nodes_at(Instant::now());
        if questionable.is_empty() {
            return 0;
        }

        let results = join_all(
            questionable
                .iter()
                .map(|n| self.query_node(n.addr, Some(n.id), DhtQuery::Ping)),
        )
        .await;

        let answered = results.iter().filter(|r| r.is_ok()).count();
        debug!(
            pinged = questionable.len(),
            answered, "pinged questionable contacts"
        );
        answered
    }

    /// Iterative `find_node` towards `target`. Returns the closest contacts found.
    pub async fn find_node(&self, target: NodeId) -> Vec<Node> {
        let mut candidates = self.routing.read().find_closest_nodes(&target, self.config.k);
        let mut queried = HashSet::new();

        for _ in 0..self.config.lookup_rounds {
            let batch = unqueried(&candidates, &mut queried);
            if batch.is_empty() {
                break;
            }

            let results = join_all(batch.iter().map(|n| {
                self.query_node(n.addr, Some(n.id), DhtQuery::FindNode { target })
            }))
            .await;

            let discovered: Vec<Node> = results
                .into_iter()
                .filter_map(Result::ok)
                .flat_map(|r| r.nodes.unwrap_or_default())
                .collect();

            if !self.merge_candidates(&mut candidates, discovered, &target, &queried) {
                break;
            }
        }

        candidates
    }

    /// Peers for `info_hash`, from a fresh lookup.
    ///
    /// Concurrent calls for the same info-hash share one lookup.
    pub async fn discover_peers(self: &Arc<Self>, info_hash: [u8; 20]) -> Vec<SocketAddr> {
        self.lookup(info_hash).await.peers.clone()
    }

    /// Runs, or joins, the lookup for `info_hash`.
    pub async fn lookup(self: &Arc<Self>, info_hash: [u8; 20]) -> Arc<LookupOutcome> {
        let shared = {
            let mut in_flight = self.in_flight.lock();
            match in_flight.get(&info_hash) {
                Some(shared) => {
                    trace!(info_hash = %NodeId(info_hash), "joining in-flight lookup");
                    shared.clone()
                }
                None => {
                    let engine = Arc::clone(self);
                    let shared = async move {
                        let outcome = Arc::new(engine.run_lookup(info_hash).await);
                        engine
                            .discovered
                            .write()
                            .insert(info_hash, outcome.peers.clone());
                        engine.in_flight.lock().remove(&info_hash);
                        outcome
                    }
                    .boxed()
                    .shared();
                    in_flight.insert(info_hash, shared.clone());
                    shared
                }
            }
        };

        shared.await
    }

    async fn run_lookup(&self, info_hash: [u8; 20]) -> LookupOutcome {
        self.lookups_started.fetch_add(1, Ordering::Relaxed);

        let target = NodeId(info_hash);
        let mut candidates = Vec::new();
        let mut queried = HashSet::new();
        let mut seen_peers = HashSet::new();
        let mut outcome = LookupOutcome::default();
        let mut phase = LookupPhase::Init;

        loop {
            phase = match phase {
                LookupPhase::Init => {
                    candidates = self.routing.read().find_closest_nodes(&target, self.config.k);
                    if candidates.is_empty() {
                        debug!(info_hash = %target, "no contacts to start lookup from");
                        LookupPhase::Done
                    } else {
                        LookupPhase::Querying { round: 1 }
                    }
                }
                LookupPhase::Querying { round } => {
                    let batch = unqueried(&candidates, &mut queried);
                    if batch.is_empty() {
                        LookupPhase::Done
                    } else {
                        outcome.rounds = round;
                        let results = join_all(batch.iter().map(|n| {
                            self.query_node(n.addr, Some(n.id), DhtQuery::GetPeers { info_hash })
                        }))
                        .await;

                        let mut discovered = Vec::new();
                        for (node, result) in batch.into_iter().zip(results) {
                            let Ok(response) = result else { continue };

                            for peer in response.values.unwrap_or_default() {
                                if seen_peers.insert(peer) {
                                    outcome.peers.push(peer);
                                }
                            }
                            if let Some(token) = response.token {
                                outcome.tokens.push((node, token));
                            }
                            discovered.extend(response.nodes.unwrap_or_default());
                        }

                        if outcome.peers.len() >= self.config.lookup_target_peers
                            || round >= self.config.lookup_rounds
                        {
                            LookupPhase::Done
                        } else {
                            LookupPhase::Merging { round, discovered }
                        }
                    }
                }
                LookupPhase::Merging { round, discovered } => {
                    if self.merge_candidates(&mut candidates, discovered, &target, &queried) {
                        LookupPhase::Querying { round: round + 1 }
                    } else {
                        LookupPhase::Done
                    }
                }
                LookupPhase::Done => break,
            };
        }

        outcome.queried = queried.len();
        outcome
            .tokens
            .sort_by_cached_key(|(node, _)| node.id.distance(&target));

        info!(
            info_hash = %target,
            peers = outcome.peers.len(),
            queried = outcome.queried,
            rounds = outcome.rounds,
            "get_peers lookup finished"
        );
        outcome
    }

    /// Adds `discovered` to the routing table and the candidate set, keeping
    /// the `k` closest. Returns whether any unqueried candidate remains.
    fn merge_candidates(
        &self,
        candidates: &mut Vec<Node>,
        discovered: Vec<Node>,
        target: &NodeId,
        queried: &HashSet<NodeId>,
    ) -> bool {
        {
            let mut routing = self.routing.write();
            for node in &discovered {
                routing.add_node(node.id, node.addr);
            }
        }

        for node in discovered {
            if node.id != self.our_id && !candidates.iter().any(|c| c.id == node.id) {
                candidates.push(node);
            }
        }

        candidates.sort_by_cached_key(|n| n.id.distance(target));
        candidates.truncate(self.config.k);
        candidates.iter().any(|n| !queried.contains(&n.id))
    }

    /// Announces that we serve `info_hash` on `port`.
    ///
    /// Runs a `get_peers` pass to collect tokens, then sends `announce_peer`
    /// to the closest contacts that handed one out. Succeeds if at least one
    /// acknowledges; returns the number of acknowledgements.
    pub async fn announce(self: &Arc<Self>, info_hash: [u8; 20], port: u16) -> Result<usize, DhtError> {
        let outcome = self.lookup(info_hash).await;
        let targets: Vec<(Node, Bytes)> = outcome
            .tokens
            .iter()
            .take(self.config.k)
            .cloned()
            .collect();

        if targets.is_empty() {
            debug!(info_hash = %NodeId(info_hash), "no tokens collected, cannot announce");
            return Err(DhtError::AnnounceFailed);
        }

        let results = join_all(targets.into_iter().map(|(node, token)| {
            let query = DhtQuery::AnnouncePeer {
                info_hash,
                port,
                token,
                implied_port: false,
            };
            async move { self.query_node(node.addr, Some(node.id), query).await }
        }))
        .await;

        let acks = results.iter().filter(|r| r.is_ok()).count();
        info!(info_hash = %NodeId(info_hash), port, acks, "announce_peer finished");

        if acks == 0 {
            Err(DhtError::AnnounceFailed)
        } else {
            Ok(acks)
        }
    }

    /// Records the sender of an inbound query.
    pub fn observe(&self, id: NodeId, addr: SocketAddr) {
        self.routing.write().add_node(id, addr);
    }

    pub fn handle_ping(&self) -> DhtResponse {
        DhtResponse::new(self.our_id)
    }

    pub fn handle_find_node(&self, target: &NodeId) -> DhtResponse {
        let nodes = self.routing.read().find_closest_nodes(target, self.config.k);
        DhtResponse::new(self.our_id).with_nodes(nodes)
    }

    /// Stored peers if we have any, the closest contacts otherwise; always a fresh token.
    ///
    /// At most [`DHT_MAX_VALUES_PER_REPLY`] peers are returned, sampled at
    /// random when more are stored.
    pub fn handle_get_peers(&self, from: SocketAddr, info_hash: &[u8; 20]) -> DhtResponse {
        let token = self.tokens.lock().issue(from.ip());
        let response = DhtResponse::new(self.our_id).with_token(token);

        let mut stored = self.storage.read().get_peers(info_hash);
        if stored.len() > DHT_MAX_VALUES_PER_REPLY {
            stored.shuffle(&mut rand::rng());
            stored.truncate(DHT_MAX_VALUES_PER_REPLY);
        }
        if stored.is_empty() {
            let nodes = self
                .routing
                .read()
                .find_closest_nodes(&NodeId(*info_hash), self.config.k);
            response.with_nodes(nodes)
        } else {
            response.with_values(stored)
        }
    }

    /// Stores the announcing peer if `token` is the one last issued to its IP.
    pub fn handle_announce_peer(
        &self,
        from: SocketAddr,
        info_hash: [u8; 20],
        port: u16,
        token: &[u8],
        implied_port: bool,
    ) -> Result<DhtResponse, DhtError> {
        if !self.tokens.lock().validate(from.ip(), token) {
            debug!(%from, "rejecting announce_peer with invalid token");
            return Err(DhtError::invalid_token());
        }

        let peer_port = if implied_port { from.port() } else { port };
        let peer = SocketAddr::new(from.ip(), peer_port);
        self.storage.write().add_peer(info_hash, peer);
        debug!(%peer, info_hash = %NodeId(info_hash), "stored announced peer");

        Ok(DhtResponse::new(self.our_id))
    }

    /// Drops expired tokens and stored peers older than the configured age.
    pub fn purge(&self, now: Instant) -> (usize, usize) {
        let tokens = self.tokens.lock().purge_expired(now);
        let peers = self
            .storage
            .write()
            .purge_older_than(self.config.peer_max_age, now);
        (tokens, peers)
    }

    pub fn cleanup_stale(&self, max_age: Duration) -> usize {
        self.routing.write().cleanup_stale(max_age)
    }

    pub fn stale_buckets(&self) -> Vec<usize> {
        self.routing.read().stale_buckets()
    }

    /// Peers found by the last completed lookup for `info_hash`.
    pub fn known_peers(&self, info_hash: &[u8; 20]) -> Vec<SocketAddr> {
        self.discovered
            .read()
            .get(info_hash)
            .cloned()
            .unwrap_or_default()
    }

    /// A copy of the peers other nodes announced to us.
    pub fn get_all_incoming_connections(&self) -> HashMap<[u8; 20], Vec<SocketAddr>> {
        self.storage.read().snapshot()
    }

    pub fn add_node(&self, id: NodeId, addr: SocketAddr) -> bool {
        self.routing.write().add_node(id, addr)
    }

    pub fn node_count(&self) -> usize {
        self.routing.read().node_count()
    }

    pub fn bucket_occupancy(&self) -> Vec<usize> {
        self.routing.read().bucket_occupancy()
    }

    pub fn all_nodes(&self) -> Vec<Node> {
        self.routing.read().all_nodes()
    }

    pub fn lookups_started(&self) -> usize {
        self.lookups_started.load(Ordering::Relaxed)
    }
}

fn unqueried(candidates: &[Node], queried: &mut HashSet<NodeId>) -> Vec<Node> {
    candidates
        .iter()
        .filter(|n| queried.insert(n.id))
        .cloned()
        .collect()
}
