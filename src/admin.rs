//! Administrative surface
//!
//! Registers and removes indexes and reports on cluster state. The admin
//! only writes index records; placement and deployment are carried out by
//! the active master and observed here through a watch on the index record.

use serde::Serialize;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::codec::{self, Record};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::models::{validate_name, IndexRecord, IndexState, NodeRecord, ShardName};
use crate::store::layout::join;
use crate::store::{watch_data, ClusterLayout, ClusterStore, CreateMode, DataChange, StoreExt};
use crate::utils::retry::RetryConfig;

/// One line of `list-indexes`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndexSummary {
    pub name: String,
    pub state: IndexState,
    pub deployed: bool,
    pub analyzer: String,
    pub location: String,
    pub replication: u32,
    pub shard_count: usize,
}

/// One entry of `show-structure`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TreeEntry {
    pub path: String,
    pub depth: usize,
    pub summary: String,
}

/// Render tree entries as an indented listing
pub fn render_structure(entries: &[TreeEntry]) -> String {
    let mut out = String::new();
    for entry in entries {
        let name = entry.path.rsplit('/').next().unwrap_or(&entry.path);
        let name = if entry.depth == 0 { entry.path.as_str() } else { name };
        out.push_str(&"  ".repeat(entry.depth));
        out.push_str(name);
        if !entry.summary.is_empty() {
            out.push_str("  ");
            out.push_str(&entry.summary);
        }
        out.push('\n');
    }
    out
}

/// Administrative operations over one coordination session
pub struct Admin {
    store: Arc<dyn ClusterStore>,
    layout: ClusterLayout,
    retry: RetryConfig,
    default_replication: u32,
    deploy_timeout: Duration,
}

impl Admin {
    pub fn new(store: Arc<dyn ClusterStore>, config: &Config) -> Self {
        Self {
            store,
            layout: ClusterLayout::new(config.store.root_path.clone()),
            retry: config.store_retry(),
            default_replication: config.master.default_replication,
            deploy_timeout: config.deploy_timeout(),
        }
    }

    /// Register an index and wait until the master reports it deployed
    pub async fn add_index(
        &self,
        name: &str,
        location: &str,
        analyzer: &str,
        replication: Option<u32>,
    ) -> Result<IndexRecord> {
        self.register_index(name, location, analyzer, replication)
            .await?;
        self.wait_until_deployed(name, self.deploy_timeout).await
    }

    /// Write the index record without waiting for deployment
    pub async fn register_index(
        &self,
        name: &str,
        location: &str,
        analyzer: &str,
        replication: Option<u32>,
    ) -> Result<IndexRecord> {
        validate_name("index", name)?;
        if location.trim().is_empty() {
            return Err(Error::config("index location must not be empty"));
        }
        let record = IndexRecord::new(
            name,
            location,
            analyzer,
            replication.unwrap_or(self.default_replication),
        );

        let path = self.layout.index(name);
        match self
            .store
            .ensure_created(&path, record.encode()?, CreateMode::Persistent, &self.retry)
            .await
        {
            Ok(_) => {}
            Err(e) if e.is_already_exists() => return Err(Error::already_exists(path)),
            Err(e) => return Err(e),
        }
        info!(index = %name, location = %location, analyzer = %analyzer, "Index registered");
        Ok(record)
    }

    /// Wait for `deployed=true` on the index record
    pub async fn wait_until_deployed(&self, name: &str, timeout: Duration) -> Result<IndexRecord> {
        let path = self.layout.index(name);
        let mut watch = watch_data(Arc::clone(&self.store), &path).await?;
        let initial = match watch.initial.take() {
            Some(bytes) => IndexRecord::decode(&bytes)?,
            None => return Err(Error::not_found(path)),
        };
        if initial.deployed {
            return Ok(initial);
        }

        let wait = async {
            while let Some(change) = watch.next().await {
                match change {
                    DataChange::Changed(bytes) => {
                        let record = IndexRecord::decode(&bytes)?;
                        if record.deployed {
                            return Ok(record);
                        }
                    }
                    DataChange::Deleted => return Err(Error::not_found(path.clone())),
                }
            }
            Err(Error::connection_lost("index watch ended"))
        };

        match tokio::time::timeout(timeout, wait).await {
            Ok(result) => {
                if let Ok(record) = &result {
                    info!(index = %record.name, "Index deployed");
                }
                result
            }
            Err(_) => Err(Error::DeployTimeout {
                index: name.to_string(),
                timeout_secs: timeout.as_secs(),
            }),
        }
    }

    /// Remove an index with its shards, assignments and serving entries
    pub async fn remove_index(&self, name: &str) -> Result<()> {
        let path = self.layout.index(name);
        if !self.store.exists(&path).await? {
            return Err(Error::not_found(path));
        }
        self.store.ensure_deleted(&path, &self.retry).await?;

        let belongs = |segment: &str| {
            ShardName::parse(segment)
                .map(|shard| shard.index == name)
                .unwrap_or(false)
        };
        for node in self
            .store
            .children_or_empty(&self.layout.node_to_shard())
            .await?
        {
            let node_path = join(&self.layout.node_to_shard(), &node);
            for segment in self.store.children_or_empty(&node_path).await? {
                if belongs(&segment) {
                    self.store
                        .ensure_deleted(&join(&node_path, &segment), &self.retry)
                        .await?;
                }
            }
        }
        for segment in self
            .store
            .children_or_empty(&self.layout.shard_to_node())
            .await?
        {
            if belongs(&segment) {
                let shard_path = join(&self.layout.shard_to_node(), &segment);
                self.store.ensure_deleted(&shard_path, &self.retry).await?;
            }
        }

        info!(index = %name, "Index removed");
        Ok(())
    }

    /// Registered indexes, sorted by name
    pub async fn list_indexes(&self) -> Result<Vec<IndexSummary>> {
        let mut indexes = Vec::new();
        for name in self.store.children_or_empty(&self.layout.indexes()).await? {
            let path = self.layout.index(&name);
            let Some(record) = self.store.try_read_record::<IndexRecord>(&path).await? else {
                continue;
            };
            let shard_count = self.store.children_or_empty(&path).await?.len();
            indexes.push(IndexSummary {
                state: IndexState::of(Some(&record), shard_count),
                name: record.name,
                deployed: record.deployed,
                analyzer: record.analyzer,
                location: record.location,
                replication: record.replication,
                shard_count,
            });
        }
        Ok(indexes)
    }

    /// Lifecycle state of one index
    pub async fn index_state(&self, name: &str) -> Result<IndexState> {
        let path = self.layout.index(name);
        let record = self.store.try_read_record::<IndexRecord>(&path).await?;
        let shard_count = match record {
            Some(_) => self.store.children_or_empty(&path).await?.len(),
            None => 0,
        };
        Ok(IndexState::of(record.as_ref(), shard_count))
    }

    /// Live nodes, sorted by id
    pub async fn list_nodes(&self) -> Result<Vec<NodeRecord>> {
        let mut nodes = Vec::new();
        for id in self.store.children_or_empty(&self.layout.nodes()).await? {
            let path = join(&self.layout.nodes(), &id);
            if let Some(record) = self.store.try_read_record::<NodeRecord>(&path).await? {
                nodes.push(record);
            }
        }
        Ok(nodes)
    }

    /// Every entry under the cluster root with a summary of its record
    pub async fn show_structure(&self) -> Result<Vec<TreeEntry>> {
        let mut entries = Vec::new();
        let root = self.layout.root().to_string();
        if self.store.exists(&root).await? {
            self.walk(root, 0, &mut entries).await?;
        }
        Ok(entries)
    }

    fn walk<'a>(
        &'a self,
        path: String,
        depth: usize,
        entries: &'a mut Vec<TreeEntry>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let summary = match self.store.read_data(&path).await {
                Ok(bytes) => codec::summarize(&bytes),
                // Removed while walking
                Err(e) if e.is_not_found() => return Ok(()),
                Err(e) => return Err(e),
            };
            let children = self.store.children_or_empty(&path).await?;
            entries.push(TreeEntry {
                path: path.clone(),
                depth,
                summary,
            });
            for child in children {
                self.walk(join(&path, &child), depth + 1, entries).await?;
            }
            Ok(())
        })
    }
}
