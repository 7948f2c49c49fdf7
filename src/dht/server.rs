use super::discovery::PeerDiscovery;
use super::error::DhtError;
use super::message::{DhtMessage, DhtQuery, TransactionId};
use super::node::{Node, NodeId};
use super::rpc::RpcSocket;
use crate::config::DhtConfig;
use crate::constants::{DHT_ERROR_PROTOCOL, MAX_DATAGRAM_SIZE};
use futures::future::join_all;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// KRPC "server error" code, used when a handler fails for a reason other
/// than a protocol violation.
const ERROR_SERVER: i64 = 202;

pub type Engine = PeerDiscovery<Arc<RpcSocket>>;

/// What one maintenance pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub tokens_purged: usize,
    pub peers_purged: usize,
    pub stale_removed: usize,
    pub revived: usize,
    pub reannounced: usize,
}

/// A BEP-5 DHT node.
///
/// The node owns the UDP socket, answers queries from other nodes, and keeps
/// the info-hashes it announces fresh through a periodic maintenance pass.
///
/// # Examples
///
/// ```no_run
/// use swarmseed::config::DhtConfig;
/// use swarmseed::dht::DhtNode;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let node = DhtNode::bind(DhtConfig::default()).await?;
/// node.start();
/// node.bootstrap().await;
///
/// let info_hash = [0u8; 20];
/// node.announce(info_hash, 6881).await?;
/// let peers = node.get_peers(info_hash).await;
/// # Ok(())
/// # }
/// ```
pub struct DhtNode {
    rpc: Arc<RpcSocket>,
    engine: Arc<Engine>,
    config: DhtConfig,
    tracked: RwLock<HashMap<[u8; 20], u16>>,
    shutdown: Notify,
}

impl DhtNode {
    pub async fn bind(config: DhtConfig) -> Result<Arc<Self>, DhtError> {
        Self::bind_with_id(config, NodeId::generate()).await
    }

    pub async fn bind_with_id(config: DhtConfig, our_id: NodeId) -> Result<Arc<Self>, DhtError> {
        config.validate()?;

        let rpc = Arc::new(
            RpcSocket::bind(
                config.bind_addr,
                our_id,
                config.query_timeout,
                config.max_pending_queries,
            )
            .await?,
        );
        let engine = Arc::new(PeerDiscovery::new(our_id, Arc::clone(&rpc), &config)?);

        info!("DHT node bound to {} with id {}", rpc.local_addr()?, our_id);

        Ok(Arc::new(Self {
            rpc,
            engine,
            config,
            tracked: RwLock::new(HashMap::new()),
            shutdown: Notify::new(),
        }))
    }

    pub fn local_id(&self) -> &NodeId {
        self.engine.our_id()
    }

    pub fn local_addr(&self) -> Result<SocketAddr, DhtError> {
        self.rpc.local_addr()
    }

    pub fn config(&self) -> &DhtConfig {
        &self.config
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub fn is_running(&self) -> bool {
        self.rpc.is_running()
    }

    /// Spawns the receive loop, which also drives periodic maintenance.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(Arc::clone(self).run())
    }

    pub async fn run(self: Arc<Self>) {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        let mut maintenance = tokio::time::interval(self.config.announce_interval);
        maintenance.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        maintenance.tick().await;

        while self.rpc.is_running() {
            tokio::select! {
                _ = self.shutdown.notified() => break,
                result = self.rpc.recv_from(&mut buf) => match result {
                    Ok((n, from)) => {
                        let node = Arc::clone(&self);
                        let data = buf[..n].to_vec();
                        tokio::spawn(async move {
                            node.handle_datagram(&data, from).await;
                        });
                    }
                    Err(e) => {
                        // ICMP unreachable surfaces here on some platforms
                        debug!("DHT recv error: {}", e);
                    }
                },
                _ = maintenance.tick() => {
                    let node = Arc::clone(&self);
                    tokio::spawn(async move {
                        node.maintenance().await;
                    });
                }
            }
        }

        info!("DHT node {} stopped", self.local_id());
    }

    async fn handle_datagram(&self, data: &[u8], from: SocketAddr) {
        let msg = match DhtMessage::parse(data) {
            Ok(msg) => msg,
            Err(DhtError::UnknownQuery(name)) => {
                trace!(%from, query = %name, "ignoring unknown query");
                return;
            }
            Err(DhtError::MalformedQuery {
                transaction_id,
                message,
            }) => {
                debug!(%from, %message, "rejecting malformed query");
                let reply = DhtMessage::error(transaction_id, DHT_ERROR_PROTOCOL, message);
                if let Err(e) = self.rpc.send_message(&reply, from).await {
                    debug!(%from, error = %e, "failed to send error reply");
                }
                return;
            }
            Err(e) => {
                debug!("Failed to parse DHT message from {}: {}", from, e);
                return;
            }
        };

        match msg {
            DhtMessage::Query {
                transaction_id,
                sender_id,
                query,
            } => {
                self.engine.observe(sender_id, from);
                let reply = self.handle_query(transaction_id, from, query);
                if let Err(e) = self.rpc.send_message(&reply, from).await {
                    debug!(%from, error = %e, "failed to send reply");
                }
            }
            reply => {
                if !self.rpc.resolve(reply, from) {
                    trace!(%from, "dropping unsolicited or late reply");
                }
            }
        }
    }

    fn handle_query(&self, tid: TransactionId, from: SocketAddr, query: DhtQuery) -> DhtMessage {
        let result = match query {
            DhtQuery::Ping => Ok(self.engine.handle_ping()),
            DhtQuery::FindNode { target } => Ok(self.engine.handle_find_node(&target)),
            DhtQuery::GetPeers { info_hash } => Ok(self.engine.handle_get_peers(from, &info_hash)),
            DhtQuery::AnnouncePeer {
                info_hash,
                port,
                token,
                implied_port,
            } => self
                .engine
                .handle_announce_peer(from, info_hash, port, &token, implied_port),
        };

        match result {
            Ok(response) => DhtMessage::response(tid, response),
            Err(DhtError::Protocol { code, message }) => DhtMessage::error(tid, code, message),
            Err(e) => DhtMessage::error(tid, ERROR_SERVER, e.to_string()),
        }
    }

    /// Pings every bootstrap router once, spaced by the configured delay,
    /// then looks up our own id to fill the routing table.
    ///
    /// Returns the number of routers that answered.
    pub async fn bootstrap(&self) -> usize {
        info!("Starting DHT bootstrap");

        let mut pings = Vec::with_capacity(self.config.bootstrap_nodes.len());

        for (i, host) in self.config.bootstrap_nodes.iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(self.config.bootstrap_delay).await;
            }

            let addr = match tokio::net::lookup_host(host.as_str()).await {
                Ok(mut addrs) => addrs.find(SocketAddr::is_ipv4),
                Err(e) => {
                    warn!("Failed to resolve bootstrap node {}: {}", host, e);
                    continue;
                }
            };

            if let Some(addr) = addr {
                debug!("Pinging bootstrap node {} ({})", host, addr);
                let engine = Arc::clone(&self.engine);
                pings.push(tokio::spawn(async move { engine.ping(addr).await }));
            }
        }

        let answered = join_all(pings)
            .await
            .into_iter()
            .filter(|r| matches!(r, Ok(Ok(_))))
            .count();

        self.engine.find_node(*self.local_id()).await;

        info!(
            "DHT bootstrap complete, {} of {} routers answered, {} nodes in routing table",
            answered,
            self.config.bootstrap_nodes.len(),
            self.engine.node_count()
        );
        answered
    }

    /// Pings a single contact, adding it to the routing table if it answers.
    pub async fn add_contact(&self, addr: SocketAddr) -> Result<NodeId, DhtError> {
        self.engine.ping(addr).await
    }

    /// Announces `info_hash` and keeps re-announcing it during maintenance.
    pub async fn announce(&self, info_hash: [u8; 20], port: u16) -> Result<usize, DhtError> {
        self.tracked.write().insert(info_hash, port);
        self.engine.announce(info_hash, port).await
    }

    /// Announces `info_hash` once without tracking it.
    pub async fn announce_once(&self, info_hash: [u8; 20], port: u16) -> Result<usize, DhtError> {
        self.engine.announce(info_hash, port).await
    }

    /// Stops re-announcing `info_hash`.
    pub fn forget(&self, info_hash: &[u8; 20]) -> bool {
        self.tracked.write().remove(info_hash).is_some()
    }

    pub async fn get_peers(&self, info_hash: [u8; 20]) -> Vec<SocketAddr> {
        self.engine.discover_peers(info_hash).await
    }

    pub fn known_peers(&self, info_hash: &[u8; 20]) -> Vec<SocketAddr> {
        self.engine.known_peers(info_hash)
    }

    /// One maintenance pass: purge expired state, ping questionable contacts,
    /// refresh stale buckets and re-announce every tracked info-hash.
    pub async fn maintenance(&self) -> MaintenanceReport {
        let mut report = MaintenanceReport::default();
        if !self.is_running() {
            return report;
        }

        (report.tokens_purged, report.peers_purged) = self.engine.purge(Instant::now());
        report.stale_removed = self.engine.cleanup_stale(self.config.node_max_age);
        report.revived = self.engine.ping_questionable().await;
        debug!(?report, "purged expired DHT state");

        for bucket in self.engine.stale_buckets() {
            let target = self.local_id().random_with_prefix(bucket);
            self.engine.find_node(target).await;
        }

        let tracked: Vec<([u8; 20], u16)> = self
            .tracked
            .read()
            .iter()
            .map(|(hash, port)| (*hash, *port))
            .collect();

        let results = join_all(
            tracked
                .iter()
                .map(|(info_hash, port)| self.engine.announce(*info_hash, *port)),
        )
        .await;

        report.reannounced = results.iter().filter(|r| r.is_ok()).count();
        info!(
            "DHT maintenance re-announced {}/{} torrents, {} nodes in routing table",
            report.reannounced,
            tracked.len(),
            self.engine.node_count()
        );
        report
    }

    /// Stops the node: no datagram is sent after this returns, and the
    /// receive loop exits.
    pub fn shutdown(&self) {
        info!("Shutting down DHT node {}", self.local_id());
        self.rpc.stop();
        self.shutdown.notify_one();
    }

    pub fn node_count(&self) -> usize {
        self.engine.node_count()
    }

    pub fn bucket_occupancy(&self) -> Vec<usize> {
        self.engine.bucket_occupancy()
    }

    pub fn pending_queries(&self) -> usize {
        self.rpc.pending_count()
    }

    pub fn tracked_count(&self) -> usize {
        self.tracked.read().len()
    }

    pub fn routing_snapshot(&self) -> Vec<Node> {
        self.engine.all_nodes()
    }

    pub fn get_all_incoming_connections(&self) -> HashMap<[u8; 20], Vec<SocketAddr>> {
        self.engine.get_all_incoming_connections()
    }
}
