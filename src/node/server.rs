//! HTTP surface of a node
//!
//! Serves the query protocol of [`super::rpc`] plus a health endpoint and
//! the Prometheus exposition.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

use super::rpc::{CountRequest, CountResponse, DetailsRequest, RpcError, SearchRequest};
use super::Node;
use crate::error::{Error, Result};
use crate::metrics;
use crate::models::{DetailFields, Hits, NodeStatus};

/// Health endpoint response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeHealth {
    pub node: String,
    pub status: NodeStatus,
    pub version: String,
    pub shards: Vec<ShardSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardSummary {
    pub name: String,
    pub doc_count: u64,
}

/// Create the node router
pub fn create_router(node: Arc<Node>) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/count", post(count))
        .route("/v1/search", post(search))
        .route("/v1/details", post(details))
        .route("/metrics", get(prometheus_metrics))
        .with_state(node)
}

struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::ShardUnavailable { .. } => StatusCode::CONFLICT,
            Error::StaleHit { .. } => StatusCode::GONE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        debug!(status = %status, error = %self.0, "Request failed");
        (status, Json(RpcError::from_error(&self.0))).into_response()
    }
}

async fn health(State(node): State<Arc<Node>>) -> Json<NodeHealth> {
    let shards = node
        .open_shards()
        .await
        .into_iter()
        .map(|s| ShardSummary {
            name: s.name.to_string(),
            doc_count: s.doc_count,
        })
        .collect();
    Json(NodeHealth {
        node: node.id().to_string(),
        status: node.status(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        shards,
    })
}

async fn count(
    State(node): State<Arc<Node>>,
    Json(request): Json<CountRequest>,
) -> std::result::Result<Json<CountResponse>, ApiError> {
    let count = node.count(&request.query, &request.shards).await?;
    Ok(Json(CountResponse { count }))
}

async fn search(
    State(node): State<Arc<Node>>,
    Json(request): Json<SearchRequest>,
) -> std::result::Result<Json<Hits>, ApiError> {
    let hits = node
        .search(&request.query, &request.shards, request.limit)
        .await?;
    Ok(Json(hits))
}

async fn details(
    State(node): State<Arc<Node>>,
    Json(request): Json<DetailsRequest>,
) -> std::result::Result<Json<DetailFields>, ApiError> {
    Ok(Json(node.details(&request.shard, request.doc_id).await?))
}

async fn prometheus_metrics() -> impl IntoResponse {
    match metrics::encode_metrics() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

/// The query surface of a running node
pub struct NodeServer {
    node: Arc<Node>,
}

impl NodeServer {
    pub fn new(node: Arc<Node>) -> Self {
        Self { node }
    }

    pub fn build_router(&self) -> Router {
        create_router(Arc::clone(&self.node)).layer(TraceLayer::new_for_http())
    }

    /// Serve on an already bound listener until `shutdown_signal` resolves
    pub async fn serve(
        &self,
        listener: tokio::net::TcpListener,
        shutdown_signal: impl std::future::Future<Output = ()> + Send + 'static,
    ) -> Result<()> {
        let addr: SocketAddr = listener.local_addr()?;
        info!(node = %self.node.id(), address = %addr, "Node query service listening");

        axum::serve(listener, self.build_router())
            .with_graceful_shutdown(shutdown_signal)
            .await?;

        info!(node = %self.node.id(), "Node query service stopped");
        Ok(())
    }
}
