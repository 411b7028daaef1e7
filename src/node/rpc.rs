//! Node query protocol
//!
//! [`NodeRpc`] is the surface a client fans out to. It is implemented by
//! [`Node`] itself, for in-process clusters, and by [`HttpNodeClient`] for
//! nodes reached over the network. A [`NodeConnector`] turns the node ids of
//! the live view into callable proxies.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use super::Node;
use crate::error::{Error, Result};
use crate::models::{DetailFields, Hits, NodeId, Query, ShardName};

// ============================================================================
// Wire Types
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CountRequest {
    pub query: Query,
    #[serde(default)]
    pub shards: Vec<ShardName>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CountResponse {
    pub count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchRequest {
    pub query: Query,
    #[serde(default)]
    pub shards: Vec<ShardName>,
    pub limit: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetailsRequest {
    pub shard: ShardName,
    pub doc_id: u32,
}

/// Failure kinds a node reports to its callers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RpcFailure {
    ShardUnavailable { target: String },
    StaleHit { shard: String, doc_id: u32 },
    Failed { message: String },
}

/// Error body returned by the node service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    pub success: bool,
    pub error: String,
    #[serde(flatten)]
    pub failure: RpcFailure,
}

impl RpcError {
    pub fn from_error(err: &Error) -> Self {
        let failure = match err {
            Error::ShardUnavailable { target, .. } => RpcFailure::ShardUnavailable {
                target: target.clone(),
            },
            Error::StaleHit { shard, doc_id, .. } => RpcFailure::StaleHit {
                shard: shard.clone(),
                doc_id: *doc_id,
            },
            other => RpcFailure::Failed {
                message: other.to_string(),
            },
        };
        Self {
            success: false,
            error: err.to_string(),
            failure,
        }
    }

    /// Rebuild the error on the calling side
    pub fn into_error(self, node: &NodeId) -> Error {
        let node = node.to_string();
        match self.failure {
            RpcFailure::ShardUnavailable { target } => Error::ShardUnavailable { node, target },
            RpcFailure::StaleHit { shard, doc_id } => Error::StaleHit {
                node,
                shard,
                doc_id,
            },
            RpcFailure::Failed { message } => Error::other(format!("node {node}: {message}")),
        }
    }
}

// ============================================================================
// Traits
// ============================================================================

/// Query operations a node serves
#[async_trait]
pub trait NodeRpc: Send + Sync {
    fn node_id(&self) -> &NodeId;

    async fn count(&self, query: &Query, shards: &[ShardName]) -> Result<u64>;

    async fn search(&self, query: &Query, shards: &[ShardName], limit: usize) -> Result<Hits>;

    async fn details(&self, shard: &ShardName, doc_id: u32) -> Result<DetailFields>;
}

/// Resolves node ids to callable proxies
pub trait NodeConnector: Send + Sync {
    fn connect(&self, node: &NodeId) -> Result<Arc<dyn NodeRpc>>;
}

#[async_trait]
impl NodeRpc for Node {
    fn node_id(&self) -> &NodeId {
        self.id()
    }

    async fn count(&self, query: &Query, shards: &[ShardName]) -> Result<u64> {
        Node::count(self, query, shards).await
    }

    async fn search(&self, query: &Query, shards: &[ShardName], limit: usize) -> Result<Hits> {
        Node::search(self, query, shards, limit).await
    }

    async fn details(&self, shard: &ShardName, doc_id: u32) -> Result<DetailFields> {
        Node::details(self, shard, doc_id).await
    }
}

// ============================================================================
// HTTP
// ============================================================================

/// Proxy for a node reached over HTTP at `http://<node id>`
#[derive(Debug, Clone)]
pub struct HttpNodeClient {
    node: NodeId,
    base_url: String,
    http: Client,
}

impl HttpNodeClient {
    pub fn new(node: NodeId, base_url: impl Into<String>, http: Client) -> Self {
        Self {
            node,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
        }
    }

    async fn call<B, T>(&self, endpoint: &str, body: &B) -> Result<T>
    where
        B: Serialize + Sync,
        T: serde::de::DeserializeOwned,
    {
        let resp = self
            .http
            .post(format!("{}/v1/{endpoint}", self.base_url))
            .json(body)
            .send()
            .await?;

        let status = resp.status();
        if status.is_success() {
            return Ok(resp.json().await?);
        }
        let bytes = resp.bytes().await?;
        match serde_json::from_slice::<RpcError>(&bytes) {
            Ok(err) => Err(err.into_error(&self.node)),
            Err(_) if status == StatusCode::NOT_FOUND => Err(Error::other(format!(
                "node {} has no endpoint {endpoint}",
                self.node
            ))),
            Err(_) => Err(Error::other(format!(
                "node {} returned {status}: {}",
                self.node,
                String::from_utf8_lossy(&bytes)
            ))),
        }
    }
}

#[async_trait]
impl NodeRpc for HttpNodeClient {
    fn node_id(&self) -> &NodeId {
        &self.node
    }

    async fn count(&self, query: &Query, shards: &[ShardName]) -> Result<u64> {
        let request = CountRequest {
            query: query.clone(),
            shards: shards.to_vec(),
        };
        let resp: CountResponse = self.call("count", &request).await?;
        Ok(resp.count)
    }

    async fn search(&self, query: &Query, shards: &[ShardName], limit: usize) -> Result<Hits> {
        let request = SearchRequest {
            query: query.clone(),
            shards: shards.to_vec(),
            limit,
        };
        self.call("search", &request).await
    }

    async fn details(&self, shard: &ShardName, doc_id: u32) -> Result<DetailFields> {
        let request = DetailsRequest {
            shard: shard.clone(),
            doc_id,
        };
        self.call("details", &request).await
    }
}

/// Connects to nodes over HTTP, sharing one connection pool
#[derive(Debug)]
pub struct HttpConnector {
    http: Client,
    proxies: RwLock<HashMap<NodeId, Arc<HttpNodeClient>>>,
}

impl HttpConnector {
    pub fn new(request_timeout: Duration) -> Result<Self> {
        let http = Client::builder().timeout(request_timeout).build()?;
        Ok(Self {
            http,
            proxies: RwLock::new(HashMap::new()),
        })
    }
}

impl NodeConnector for HttpConnector {
    fn connect(&self, node: &NodeId) -> Result<Arc<dyn NodeRpc>> {
        if let Some(proxy) = self
            .proxies
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(node)
        {
            return Ok(Arc::clone(proxy) as Arc<dyn NodeRpc>);
        }

        let proxy = Arc::new(HttpNodeClient::new(
            node.clone(),
            format!("http://{node}"),
            self.http.clone(),
        ));
        self.proxies
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(node.clone(), Arc::clone(&proxy));
        Ok(proxy)
    }
}

/// Connects to nodes running in the same process
#[derive(Default)]
pub struct LocalConnector {
    nodes: RwLock<HashMap<NodeId, Arc<dyn NodeRpc>>>,
}

impl LocalConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, node: Arc<dyn NodeRpc>) {
        self.nodes
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(node.node_id().clone(), node);
    }

    pub fn unregister(&self, node: &NodeId) {
        self.nodes
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(node);
    }
}

impl NodeConnector for LocalConnector {
    fn connect(&self, node: &NodeId) -> Result<Arc<dyn NodeRpc>> {
        self.nodes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(node)
            .cloned()
            .ok_or_else(|| Error::NodeUnreachable {
                node: node.to_string(),
                reason: "not registered with this process".to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rpc_error_roundtrip_keeps_kind() {
        let err = Error::StaleHit {
            node: "n1:2000".to_string(),
            shard: "docs#s0".to_string(),
            doc_id: 4,
        };
        let body = serde_json::to_string(&RpcError::from_error(&err)).unwrap();
        assert!(body.contains("\"kind\":\"stale_hit\""));

        let parsed: RpcError = serde_json::from_str(&body).unwrap();
        let rebuilt = parsed.into_error(&NodeId::from("n1:2000"));
        assert!(matches!(rebuilt, Error::StaleHit { doc_id: 4, .. }));
    }

    #[test]
    fn test_generic_failure_maps_to_other() {
        let err = Error::IndexLibrary("broken".to_string());
        let rebuilt = RpcError::from_error(&err).into_error(&NodeId::from("n1:2000"));
        assert!(matches!(rebuilt, Error::Other { .. }));
    }

    #[test]
    fn test_local_connector_unknown_node() {
        let connector = LocalConnector::new();
        let err = connector.connect(&NodeId::from("nowhere:1")).err().unwrap();
        assert!(matches!(err, Error::NodeUnreachable { .. }));
    }

    #[test]
    fn test_http_connector_reuses_proxies() {
        let connector = HttpConnector::new(Duration::from_secs(1)).unwrap();
        let node = NodeId::from("127.0.0.1:9");
        let a = connector.connect(&node).unwrap();
        let b = connector.connect(&node).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }
}
