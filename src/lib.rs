//! shoal - sharded search cluster
//!
//! A master assigns the shards of registered indexes to shard-serving nodes;
//! clients fan queries out to the nodes and merge the answers. All cluster
//! state lives in a coordination store whose ephemeral entries double as
//! the failure detector.
//!
//! # Architecture
//!
//! - [`store`] - Coordination store adapter: sessions, ephemeral entries, watches
//! - [`codec`] - Record encoding for everything kept in the store
//! - [`master`] - Leader election, shard placement, deploy tracking
//! - [`node`] - Shard loading and local count/search/details
//! - [`client`] - Live cluster view, parallel fan-out, result merging
//! - [`admin`] - Index registration and cluster inspection
//! - [`index`] - Local index library and shard storage interfaces
//! - [`monitor`] - Per-node metrics records
//! - [`config`] - Configuration management and settings
//! - [`utils`] - Retry with backoff and small helpers
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use shoal::prelude::*;
//! use shoal::node::rpc::HttpConnector;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_env()?;
//!     let store = RemoteStore::connect(
//!         &config.store.url,
//!         config.heartbeat_interval(),
//!         std::time::Duration::from_millis(config.store.poll_wait_ms),
//!     )
//!     .await?;
//!     let connector = Arc::new(HttpConnector::new(config.request_timeout())?);
//!     let client = Client::connect(store, connector, &config).await?;
//!     let hits = client.search(&Query::new("rust", ["docs"]).with_limit(10)).await?;
//!     println!("{} of {} hits", hits.len(), hits.total);
//!     Ok(())
//! }
//! ```

pub mod admin;
pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod index;
pub mod master;
pub mod metrics;
pub mod models;
pub mod monitor;
pub mod node;
pub mod store;
pub mod utils;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::admin::Admin;
    pub use crate::client::Client;
    pub use crate::config::Config;
    pub use crate::error::{Error, ErrorCategory, Result, ShoalErrorTrait};
    pub use crate::master::Master;
    pub use crate::models::{Hit, Hits, IndexRecord, NodeId, NodeRecord, Query, ShardName};
    pub use crate::node::Node;
    pub use crate::store::{ClusterLayout, ClusterStore, MemoryStore, RemoteStore, StoreExt};
}

// Direct re-exports for convenience
pub use models::{Hit, Hits, Query};
