use super::error::DhtError;
use super::node::{peer_from_compact, peer_to_compact, Node, NodeId, COMPACT_NODE_LEN};
use crate::bencode::{decode, encode, DictBuilder, Value};
use bytes::Bytes;
use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;

pub type TransactionId = Bytes;

type Dict = BTreeMap<Bytes, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryKind {
    Ping,
    FindNode,
    GetPeers,
    AnnouncePeer,
}

impl QueryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryKind::Ping => "ping",
            QueryKind::FindNode => "find_node",
            QueryKind::GetPeers => "get_peers",
            QueryKind::AnnouncePeer => "announce_peer",
        }
    }

    pub fn from_name(name: &[u8]) -> Option<Self> {
        match name {
            b"ping" => Some(QueryKind::Ping),
            b"find_node" => Some(QueryKind::FindNode),
            b"get_peers" => Some(QueryKind::GetPeers),
            b"announce_peer" => Some(QueryKind::AnnouncePeer),
            _ => None,
        }
    }
}

impl fmt::Display for QueryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Arguments of a KRPC query, without the sender id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DhtQuery {
    Ping,
    FindNode {
        target: NodeId,
    },
    GetPeers {
        info_hash: [u8; 20],
    },
    AnnouncePeer {
        info_hash: [u8; 20],
        port: u16,
        token: Bytes,
        implied_port: bool,
    },
}

impl DhtQuery {
    pub fn kind(&self) -> QueryKind {
        match self {
            DhtQuery::Ping => QueryKind::Ping,
            DhtQuery::FindNode { .. } => QueryKind::FindNode,
            DhtQuery::GetPeers { .. } => QueryKind::GetPeers,
            DhtQuery::AnnouncePeer { .. } => QueryKind::AnnouncePeer,
        }
    }

    /// The key this query is about, if any.
    pub fn target(&self) -> Option<NodeId> {
        match self {
            DhtQuery::Ping => None,
            DhtQuery::FindNode { target } => Some(*target),
            DhtQuery::GetPeers { info_hash } | DhtQuery::AnnouncePeer { info_hash, .. } => {
                Some(NodeId(*info_hash))
            }
        }
    }
}

/// The `r` dictionary of a KRPC response.
///
/// One shape covers all four query kinds; which fields are set depends on
/// the query it answers.
#[derive(Debug, Clone)]
pub struct DhtResponse {
    pub id: NodeId,
    pub token: Option<Bytes>,
    pub nodes: Option<Vec<Node>>,
    pub values: Option<Vec<SocketAddr>>,
}

impl DhtResponse {
    pub fn new(id: NodeId) -> Self {
        Self {
            id,
            token: None,
            nodes: None,
            values: None,
        }
    }

    pub fn with_token(mut self, token: Bytes) -> Self {
        self.token = Some(token);
        self
    }

    pub fn with_nodes(mut self, nodes: Vec<Node>) -> Self {
        self.nodes = Some(nodes);
        self
    }

    pub fn with_values(mut self, values: Vec<SocketAddr>) -> Self {
        self.values = Some(values);
        self
    }
}

#[derive(Debug, Clone)]
pub enum DhtMessage {
    Query {
        transaction_id: TransactionId,
        sender_id: NodeId,
        query: DhtQuery,
    },
    Response {
        transaction_id: TransactionId,
        response: DhtResponse,
    },
    Error {
        transaction_id: TransactionId,
        code: i64,
        message: String,
    },
}

impl DhtMessage {
    pub fn query(transaction_id: TransactionId, sender_id: NodeId, query: DhtQuery) -> Self {
        DhtMessage::Query {
            transaction_id,
            sender_id,
            query,
        }
    }

    pub fn response(transaction_id: TransactionId, response: DhtResponse) -> Self {
        DhtMessage::Response {
            transaction_id,
            response,
        }
    }

    pub fn error(transaction_id: TransactionId, code: i64, message: impl Into<String>) -> Self {
        DhtMessage::Error {
            transaction_id,
            code,
            message: message.into(),
        }
    }

    pub fn transaction_id(&self) -> &TransactionId {
        match self {
            DhtMessage::Query { transaction_id, .. }
            | DhtMessage::Response { transaction_id, .. }
            | DhtMessage::Error { transaction_id, .. } => transaction_id,
        }
    }

    pub fn parse(data: &[u8]) -> Result<Self, DhtError> {
        let dict = decode(data)?
            .and_then(Value::into_dict)
            .ok_or_else(|| DhtError::InvalidMessage("expected dict".into()))?;

        let transaction_id = dict
            .get(b"t".as_slice())
            .and_then(|v| v.as_bytes())
            .cloned()
            .ok_or_else(|| DhtError::InvalidMessage("missing transaction id".into()))?;

        let msg_type = dict
            .get(b"y".as_slice())
            .and_then(|v| v.as_bytes())
            .ok_or_else(|| DhtError::InvalidMessage("missing message type".into()))?;

        match msg_type.as_ref() {
            b"q" => Self::parse_query(transaction_id, &dict),
            b"r" => Self::parse_response(transaction_id, &dict),
            b"e" => Self::parse_error(transaction_id, &dict),
            other => Err(DhtError::InvalidMessage(format!(
                "unknown message type: {}",
                String::from_utf8_lossy(other)
            ))),
        }
    }

    fn parse_query(transaction_id: TransactionId, dict: &Dict) -> Result<Self, DhtError> {
        let name = dict
            .get(b"q".as_slice())
            .and_then(|v| v.as_bytes())
            .ok_or_else(|| DhtError::InvalidMessage("missing query name".into()))?;

        let kind = QueryKind::from_name(name)
            .ok_or_else(|| DhtError::UnknownQuery(String::from_utf8_lossy(name).into_owned()))?;

        let (sender_id, query) =
            query_args(kind, dict).map_err(|e| DhtError::MalformedQuery {
                transaction_id: transaction_id.clone(),
                message: e.to_string(),
            })?;

        Ok(DhtMessage::Query {
            transaction_id,
            sender_id,
            query,
        })
    }

    fn parse_response(transaction_id: TransactionId, dict: &Dict) -> Result<Self, DhtError> {
        let resp = dict
            .get(b"r".as_slice())
            .and_then(|v| v.as_dict())
            .ok_or_else(|| DhtError::InvalidMessage("missing response dict".into()))?;

        let id = resp
            .get(b"id".as_slice())
            .and_then(|v| v.as_bytes())
            .ok_or_else(|| DhtError::InvalidMessage("missing id in response".into()))
            .and_then(|b| NodeId::from_bytes(b))?;

        let nodes = resp
            .get(b"nodes".as_slice())
            .and_then(|v| v.as_bytes())
            .map(|data| {
                data.chunks_exact(COMPACT_NODE_LEN)
                    .filter_map(Node::from_compact)
                    .collect()
            });

        let values = resp
            .get(b"values".as_slice())
            .and_then(|v| v.as_list())
            .map(|list| {
                list.iter()
                    .filter_map(|v| v.as_bytes())
                    .filter_map(|b| peer_from_compact(b))
                    .collect()
            });

        let token = resp
            .get(b"token".as_slice())
            .and_then(|v| v.as_bytes())
            .cloned();

        Ok(DhtMessage::Response {
            transaction_id,
            response: DhtResponse {
                id,
                token,
                nodes,
                values,
            },
        })
    }

    fn parse_error(transaction_id: TransactionId, dict: &Dict) -> Result<Self, DhtError> {
        let error = dict
            .get(b"e".as_slice())
            .and_then(|v| v.as_list())
            .ok_or_else(|| DhtError::InvalidMessage("missing error list".into()))?;

        let code = error.first().and_then(|v| v.as_integer()).unwrap_or(0);

        let message = error
            .get(1)
            .and_then(|v| v.as_str())
            .unwrap_or("unknown error")
            .to_string();

        Ok(DhtMessage::Error {
            transaction_id,
            code,
            message,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let envelope = match self {
            DhtMessage::Query {
                transaction_id,
                sender_id,
                query,
            } => {
                let args = DictBuilder::new().insert("id", Value::bytes(sender_id.as_bytes()));

                let args = match query {
                    DhtQuery::Ping => args,
                    DhtQuery::FindNode { target } => {
                        args.insert("target", Value::bytes(target.as_bytes()))
                    }
                    DhtQuery::GetPeers { info_hash } => {
                        args.insert("info_hash", Value::bytes(info_hash))
                    }
                    DhtQuery::AnnouncePeer {
                        info_hash,
                        port,
                        token,
                        implied_port,
                    } => args
                        .insert("info_hash", Value::bytes(info_hash))
                        .insert("port", i64::from(*port))
                        .insert("token", token.clone())
                        .insert_opt("implied_port", implied_port.then_some(1i64)),
                };

                DictBuilder::new()
                    .insert("t", transaction_id.clone())
                    .insert("y", "q")
                    .insert("q", query.kind().as_str())
                    .insert("a", args.build())
            }
            DhtMessage::Response {
                transaction_id,
                response,
            } => {
                let nodes = response.nodes.as_ref().map(|nodes| {
                    let compact: Vec<u8> = nodes
                        .iter()
                        .filter_map(|n| n.to_compact())
                        .flatten()
                        .collect();
                    Value::Bytes(Bytes::from(compact))
                });

                let values = response.values.as_ref().map(|peers| {
                    Value::List(
                        peers
                            .iter()
                            .filter_map(peer_to_compact)
                            .map(|p| Value::bytes(&p))
                            .collect(),
                    )
                });

                let body = DictBuilder::new()
                    .insert("id", Value::bytes(response.id.as_bytes()))
                    .insert_opt("token", response.token.clone())
                    .insert_opt("nodes", nodes)
                    .insert_opt("values", values);

                DictBuilder::new()
                    .insert("t", transaction_id.clone())
                    .insert("y", "r")
                    .insert("r", body.build())
            }
            DhtMessage::Error {
                transaction_id,
                code,
                message,
            } => DictBuilder::new()
                .insert("t", transaction_id.clone())
                .insert("y", "e")
                .insert(
                    "e",
                    Value::List(vec![Value::Integer(*code), Value::string(message)]),
                ),
        };

        encode(&envelope.build())
    }
}

/// Sender id and typed arguments of a query whose name is known.
fn query_args(kind: QueryKind, dict: &Dict) -> Result<(NodeId, DhtQuery), DhtError> {
    let args = dict
        .get(b"a".as_slice())
        .and_then(|v| v.as_dict())
        .ok_or_else(|| DhtError::InvalidMessage("missing query args".into()))?;

    let sender_id = args
        .get(b"id".as_slice())
        .and_then(|v| v.as_bytes())
        .ok_or_else(|| DhtError::InvalidMessage("missing sender id".into()))
        .and_then(|b| NodeId::from_bytes(b))?;

    let query = match kind {
        QueryKind::Ping => DhtQuery::Ping,
        QueryKind::FindNode => DhtQuery::FindNode {
            target: NodeId(hash_arg(args, b"target")?),
        },
        QueryKind::GetPeers => DhtQuery::GetPeers {
            info_hash: hash_arg(args, b"info_hash")?,
        },
        QueryKind::AnnouncePeer => {
            let port = args
                .get(b"port".as_slice())
                .and_then(|v| v.as_integer())
                .and_then(|p| u16::try_from(p).ok())
                .ok_or_else(|| DhtError::InvalidMessage("missing or invalid port".into()))?;

            let token = args
                .get(b"token".as_slice())
                .and_then(|v| v.as_bytes())
                .cloned()
                .ok_or_else(|| DhtError::InvalidMessage("missing token".into()))?;

            let implied_port = args
                .get(b"implied_port".as_slice())
                .and_then(|v| v.as_integer())
                .is_some_and(|v| v == 1);

            DhtQuery::AnnouncePeer {
                info_hash: hash_arg(args, b"info_hash")?,
                port,
                token,
                implied_port,
            }
        }
    };

    Ok((sender_id, query))
}

fn hash_arg(args: &Dict, key: &[u8]) -> Result<[u8; 20], DhtError> {
    args.get(key)
        .and_then(|v| v.as_bytes())
        .and_then(|b| <[u8; 20]>::try_from(b.as_ref()).ok())
        .ok_or_else(|| {
            DhtError::InvalidMessage(format!("missing or invalid {}", String::from_utf8_lossy(key)))
        })
}
