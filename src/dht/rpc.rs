use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::trace;

use super::discovery::QueryTransport;
use super::error::DhtError;
use super::message::{DhtMessage, DhtQuery, DhtResponse, QueryKind, TransactionId};
use super::node::NodeId;

struct PendingQuery {
    kind: QueryKind,
    addr: SocketAddr,
    target: Option<NodeId>,
    issued_at: Instant,
    reply: oneshot::Sender<Result<DhtResponse, DhtError>>,
}

/// The DHT node's UDP socket plus the table of outstanding queries.
///
/// Responses and errors are matched to queries by transaction id. A reply
/// whose transaction id is no longer pending (timed out, or never sent) is
/// dropped.
pub struct RpcSocket {
    socket: UdpSocket,
    our_id: NodeId,
    pending: Mutex<HashMap<TransactionId, PendingQuery>>,
    query_timeout: Duration,
    max_pending: usize,
    running: AtomicBool,
}

impl RpcSocket {
    pub async fn bind(
        addr: SocketAddr,
        our_id: NodeId,
        query_timeout: Duration,
        max_pending: usize,
    ) -> Result<Self, DhtError> {
        let socket = UdpSocket::bind(addr).await?;

        Ok(Self {
            socket,
            our_id,
            pending: Mutex::new(HashMap::new()),
            query_timeout,
            max_pending,
            running: AtomicBool::new(true),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, DhtError> {
        Ok(self.socket.local_addr()?)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Refuses further sends and fails every outstanding query with
    /// [`DhtError::Shutdown`].
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
        self.pending.lock().clear();
    }

    pub async fn recv_from(&self, buf: &mut [u8]) -> std::io::Result<(usize, SocketAddr)> {
        self.socket.recv_from(buf).await
    }

    pub async fn send_message(&self, msg: &DhtMessage, addr: SocketAddr) -> Result<(), DhtError> {
        if !self.is_running() {
            return Err(DhtError::Shutdown);
        }

        self.socket.send_to(&msg.encode(), addr).await?;
        Ok(())
    }

    /// Completes the pending query a response or error belongs to.
    ///
    /// Returns `false` if nothing was waiting for it.
    pub fn resolve(&self, msg: DhtMessage, from: SocketAddr) -> bool {
        let (tid, result) = match msg {
            DhtMessage::Response {
                transaction_id,
                response,
            } => (transaction_id, Ok(response)),
            DhtMessage::Error {
                transaction_id,
                code,
                message,
            } => (transaction_id, Err(DhtError::Protocol { code, message })),
            DhtMessage::Query { .. } => return false,
        };

        let pending = {
            let mut pending = self.pending.lock();
            match pending.get(&tid) {
                Some(query) if query.addr.ip() == from.ip() => pending.remove(&tid),
                _ => None,
            }
        };

        let Some(query) = pending else {
            return false;
        };

        trace!(
            kind = %query.kind,
            target = ?query.target,
            %from,
            elapsed_ms = query.issued_at.elapsed().as_millis() as u64,
            ok = result.is_ok(),
            "query answered"
        );

        query.reply.send(result).is_ok()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    fn register(
        &self,
        kind: QueryKind,
        addr: SocketAddr,
        target: Option<NodeId>,
    ) -> Result<(TransactionId, oneshot::Receiver<Result<DhtResponse, DhtError>>), DhtError> {
        let mut pending = self.pending.lock();
        if pending.len() >= self.max_pending {
            return Err(DhtError::RateLimited);
        }

        let tid = loop {
            let candidate = Bytes::copy_from_slice(&rand::random::<[u8; 2]>());
            if !pending.contains_key(&candidate) {
                break candidate;
            }
        };

        let (reply, rx) = oneshot::channel();
        pending.insert(
            tid.clone(),
            PendingQuery {
                kind,
                addr,
                target,
                issued_at: Instant::now(),
                reply,
            },
        );

        Ok((tid, rx))
    }
}

#[async_trait]
impl QueryTransport for RpcSocket {
    async fn query(&self, addr: SocketAddr, query: DhtQuery) -> Result<DhtResponse, DhtError> {
        if !self.is_running() {
            return Err(DhtError::Shutdown);
        }

        let (tid, rx) = self.register(query.kind(), addr, query.target())?;
        let msg = DhtMessage::query(tid.clone(), self.our_id, query);

        if let Err(e) = self.send_message(&msg, addr).await {
            self.pending.lock().remove(&tid);
            return Err(e);
        }

        let result = timeout(self.query_timeout, rx).await;
        self.pending.lock().remove(&tid);

        match result {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(DhtError::Shutdown),
            Err(_) => Err(DhtError::Timeout),
        }
    }
}
