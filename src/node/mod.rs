//! Shard-serving node
//!
//! A node registers an ephemeral presence record, watches its assignment
//! subtree and keeps the set of locally open shards equal to the set of
//! shards assigned to it. A shard is announced with a serving marker only
//! after it is open, so clients never route to a shard that is still
//! loading.
//!
//! # Lifecycle
//!
//! ```text
//! start ──► register(starting) ──► load initial assignments ──► serving
//!              ▲                                                   │
//!              └──────────── new session (rejoining) ◄─────────────┘
//! ```

pub mod rpc;
pub mod server;

use chrono::Utc;
use futures::future::join_all;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::index::{IndexLibrary, ShardHandle, ShardStorage};
use crate::metrics;
use crate::models::{
    DetailFields, Hit, Hits, NodeId, NodeRecord, NodeStatus, Query, ServingMarker,
    ShardAssignment, ShardName,
};
use crate::monitor::{self, MetricsSource};
use crate::store::watch::ChildWatch;
use crate::store::{watch_children, ClusterLayout, ClusterStore, CreateMode, SessionEvent, StoreExt};
use crate::utils::retry::{with_retry, with_retry_if, RetryConfig};

/// A shard open on this node
#[derive(Debug, Clone)]
struct OpenShard {
    handle: Arc<dyn ShardHandle>,
    assignment: ShardAssignment,
}

/// Snapshot of one open shard, for status output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardInfo {
    pub name: ShardName,
    pub doc_count: u64,
}

/// A shard-serving node bound to one coordination session
pub struct Node {
    id: NodeId,
    name: String,
    store: Arc<dyn ClusterStore>,
    layout: ClusterLayout,
    library: Arc<dyn IndexLibrary>,
    storage: Arc<dyn ShardStorage>,
    shard_dir: PathBuf,
    retry: RetryConfig,
    health_interval: Duration,
    metrics_interval: Duration,
    shards: RwLock<BTreeMap<ShardName, OpenShard>>,
    open_count: AtomicUsize,
    queries_served: AtomicU64,
    status: Mutex<NodeStatus>,
    start_time: chrono::DateTime<Utc>,
    started: Instant,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("status", &self.status())
            .field("open_shards", &self.open_count.load(Ordering::SeqCst))
            .finish()
    }
}

fn is_connection_lost(err: &Error) -> bool {
    err.is_connection_lost()
}

impl Node {
    pub fn new(
        id: NodeId,
        store: Arc<dyn ClusterStore>,
        library: Arc<dyn IndexLibrary>,
        storage: Arc<dyn ShardStorage>,
        config: &Config,
    ) -> Arc<Self> {
        let name = id
            .as_str()
            .split(':')
            .next()
            .unwrap_or(id.as_str())
            .to_string();
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            name,
            store,
            layout: ClusterLayout::new(config.store.root_path.clone()),
            library,
            storage,
            shard_dir: config.node.shard_dir.join(sanitize_dir_name(id.as_str())),
            retry: config.store_retry(),
            health_interval: config.health_interval(),
            metrics_interval: config.metrics_interval(),
            shards: RwLock::new(BTreeMap::new()),
            open_count: AtomicUsize::new(0),
            queries_served: AtomicU64::new(0),
            status: Mutex::new(NodeStatus::Starting),
            start_time: Utc::now(),
            started: Instant::now(),
            shutdown,
            tasks: Mutex::new(Vec::new()),
            id,
        })
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    pub fn status(&self) -> NodeStatus {
        *self.status.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_status(&self, status: NodeStatus) {
        *self.status.lock().unwrap_or_else(|e| e.into_inner()) = status;
    }

    fn lock_tasks(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Shards currently open, sorted by name
    pub async fn open_shards(&self) -> Vec<ShardInfo> {
        self.shards
            .read()
            .await
            .iter()
            .map(|(name, open)| ShardInfo {
                name: name.clone(),
                doc_count: open.handle.doc_count(),
            })
            .collect()
    }

    fn record(&self, status: NodeStatus) -> NodeRecord {
        NodeRecord {
            id: self.id.clone(),
            name: self.name.clone(),
            start_time: self.start_time,
            healthy: true,
            status,
            open_shards: self.open_count.load(Ordering::SeqCst) as u32,
            updated_at: Utc::now(),
        }
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Register, load the initial assignments and start the background tasks.
    ///
    /// Returns once every shard assigned at startup has been processed.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        tokio::fs::create_dir_all(&self.shard_dir).await?;

        let sessions = self.store.session_events();
        self.register(NodeStatus::Starting).await?;
        info!(node = %self.id, "Node registered");

        let watch =
            watch_children(Arc::clone(&self.store), &self.layout.node_assignments(&self.id)).await?;
        let initial = watch.initial.clone();
        self.sync_assignments(&initial).await;

        self.set_status(NodeStatus::Serving);
        self.write_health().await;
        info!(node = %self.id, shards = self.open_count.load(Ordering::SeqCst), "Node serving");

        let event_loop = tokio::spawn(Arc::clone(self).run(watch, sessions, self.shutdown.subscribe()));
        let heartbeat = tokio::spawn(Arc::clone(self).heartbeat_loop(self.shutdown.subscribe()));
        let monitor = monitor::start_monitor(
            Arc::clone(&self.store),
            self.layout.clone(),
            self.id.clone(),
            self.metrics_interval,
            Arc::clone(self) as Arc<dyn MetricsSource>,
        );
        self.lock_tasks().extend([event_loop, heartbeat, monitor]);
        Ok(())
    }

    async fn register(&self, status: NodeStatus) -> Result<()> {
        let path = self.layout.node(&self.id);
        let record = self.record(status);
        let store = self.store.as_ref();
        with_retry_if(
            &self.retry,
            || async {
                match store.create_record(&path, &record, CreateMode::Ephemeral).await {
                    Err(e) if e.is_already_exists() => {
                        // Left over from an earlier session of this node id
                        store.upsert_record(&path, &record, CreateMode::Ephemeral).await
                    }
                    other => other,
                }
            },
            is_connection_lost,
        )
        .await
    }

    async fn write_health(&self) {
        let path = self.layout.node(&self.id);
        let record = self.record(self.status());
        if let Err(e) = self
            .store
            .upsert_record(&path, &record, CreateMode::Ephemeral)
            .await
        {
            warn!(node = %self.id, error = %e, "Failed to write health record");
        }
    }

    async fn heartbeat_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.health_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => self.write_health().await,
                _ = shutdown.changed() => break,
            }
        }
    }

    async fn run(
        self: Arc<Self>,
        mut watch: ChildWatch,
        mut sessions: broadcast::Receiver<SessionEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                change = watch.next() => match change {
                    Some(change) => {
                        debug!(node = %self.id, added = ?change.added, removed = ?change.removed, "Assignments changed");
                        self.sync_assignments(&change.children).await;
                    }
                    None => break,
                },
                event = sessions.recv() => match event {
                    Ok(SessionEvent::NewSession { session }) => self.rejoin(session).await,
                    Ok(SessionEvent::Expired { session }) => {
                        warn!(node = %self.id, session = session, "Session expired");
                        self.set_status(NodeStatus::Rejoining);
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = shutdown.changed() => break,
            }
        }
        debug!(node = %self.id, "Node event loop stopped");
    }

    /// Re-announce everything after the session was replaced
    async fn rejoin(&self, session: u64) {
        info!(node = %self.id, session = session, "Rejoining cluster with new session");
        self.set_status(NodeStatus::Rejoining);
        if let Err(e) = self.register(NodeStatus::Rejoining).await {
            error!(node = %self.id, error = %e, "Failed to re-register");
            return;
        }

        let open: Vec<OpenShard> = self.shards.read().await.values().cloned().collect();
        for shard in open {
            self.announce(&shard).await;
        }

        let assignments = self.layout.node_assignments(&self.id);
        match self.store.children_or_empty(&assignments).await {
            Ok(children) => self.sync_assignments(&children).await,
            Err(e) => warn!(node = %self.id, error = %e, "Failed to re-read assignments"),
        }

        self.set_status(NodeStatus::Serving);
        self.write_health().await;
    }

    /// Stop serving: close every shard and end the session
    pub async fn shutdown(&self) -> Result<()> {
        info!(node = %self.id, "Node shutting down");
        self.set_status(NodeStatus::ShuttingDown);
        self.write_health().await;
        self.shutdown.send_replace(true);
        for task in self.lock_tasks().drain(..) {
            task.abort();
        }

        let open: Vec<ShardName> = self.shards.read().await.keys().cloned().collect();
        for name in open {
            self.unload(&name).await;
        }
        self.store.close().await
    }

    /// Stop all background work without any cleanup, as a crash would
    pub fn abort(&self) {
        self.shutdown.send_replace(true);
        for task in self.lock_tasks().drain(..) {
            task.abort();
        }
    }

    // ========================================================================
    // Assignments
    // ========================================================================

    /// Make the set of open shards equal to `assigned` (child names of the assignment subtree)
    async fn sync_assignments(&self, assigned: &[String]) {
        let wanted: BTreeSet<ShardName> = assigned
            .iter()
            .filter_map(|segment| match ShardName::parse(segment) {
                Ok(name) => Some(name),
                Err(e) => {
                    warn!(node = %self.id, segment = %segment, error = %e, "Ignoring malformed assignment");
                    None
                }
            })
            .collect();
        let open: BTreeSet<ShardName> = self.shards.read().await.keys().cloned().collect();

        for name in open.difference(&wanted) {
            self.unload(name).await;
        }

        let loads = wanted.difference(&open).map(|name| self.load(name));
        join_all(loads).await;

        metrics::update_open_shards(self.open_count.load(Ordering::SeqCst));
    }

    async fn load(&self, name: &ShardName) {
        let path = self.layout.assignment(&self.id, name);
        let assignment: ShardAssignment = match with_retry_if(
            &self.retry,
            || self.store.try_read_record(&path),
            is_connection_lost,
        )
        .await
        {
            Ok(Some(assignment)) => assignment,
            Ok(None) => return,
            Err(e) => {
                warn!(node = %self.id, shard = %name, error = %e, "Unreadable assignment");
                return;
            }
        };

        match self.open(&assignment).await {
            Ok(handle) => {
                let open = OpenShard { handle, assignment };
                let replaced = self.shards.write().await.insert(name.clone(), open.clone());
                match replaced {
                    Some(old) => old.handle.close(),
                    None => {
                        self.open_count.fetch_add(1, Ordering::SeqCst);
                    }
                }
                metrics::record_shard_load("opened");
                self.announce(&open).await;
                info!(node = %self.id, shard = %name, docs = open.handle.doc_count(), "Shard deployed");
            }
            Err(e) => {
                metrics::record_shard_load("failed");
                error!(node = %self.id, shard = %name, error = %e, "Failed to deploy shard");
            }
        }
    }

    async fn open(&self, assignment: &ShardAssignment) -> Result<Arc<dyn ShardHandle>> {
        let dest = self.shard_dir.join(sanitize_dir_name(&assignment.shard.segment()));
        with_retry(&RetryConfig::with_delays(3, 100, 1000), || {
            self.storage.fetch(&assignment.location, &dest)
        })
        .await?;

        let library = Arc::clone(&self.library);
        let analyzer = assignment.analyzer.clone();
        tokio::task::spawn_blocking(move || library.open(&dest, &analyzer))
            .await
            .map_err(|e| Error::with_source("shard open task failed", e))?
    }

    /// Publish the serving marker of an open shard
    async fn announce(&self, shard: &OpenShard) {
        let name = &shard.assignment.shard;
        let path = self.layout.serving_marker(name, &self.id);
        let marker = ServingMarker {
            node: self.id.clone(),
            shard: name.clone(),
            doc_count: shard.handle.doc_count(),
            opened_at: Utc::now(),
        };
        let result = with_retry_if(
            &self.retry,
            || self.store.upsert_record(&path, &marker, CreateMode::Ephemeral),
            is_connection_lost,
        )
        .await;
        if let Err(e) = result {
            error!(node = %self.id, shard = %name, error = %e, "Failed to publish serving marker");
        }
    }

    async fn unload(&self, name: &ShardName) {
        let Some(open) = self.shards.write().await.remove(name) else {
            return;
        };
        self.open_count.fetch_sub(1, Ordering::SeqCst);
        open.handle.close();

        let marker = self.layout.serving_marker(name, &self.id);
        if let Err(e) = self.store.ensure_deleted(&marker, &self.retry).await {
            warn!(node = %self.id, shard = %name, error = %e, "Failed to remove serving marker");
        }

        let dir = self.shard_dir.join(sanitize_dir_name(&name.segment()));
        if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(node = %self.id, dir = %dir.display(), error = %e, "Failed to remove shard data");
            }
        }
        metrics::update_open_shards(self.open_count.load(Ordering::SeqCst));
        info!(node = %self.id, shard = %name, "Shard undeployed");
    }

    // ========================================================================
    // Query Operations
    // ========================================================================

    /// Resolve the shards a request targets. An empty `shards` list means
    /// every open shard of the queried indexes.
    async fn targets(
        &self,
        query: &Query,
        shards: &[ShardName],
    ) -> Result<Vec<(ShardName, Arc<dyn ShardHandle>)>> {
        let open = self.shards.read().await;
        if shards.is_empty() {
            let mut targets = Vec::new();
            for index in &query.indexes {
                let before = targets.len();
                targets.extend(
                    open.iter()
                        .filter(|(name, _)| &name.index == index)
                        .map(|(name, shard)| (name.clone(), Arc::clone(&shard.handle))),
                );
                if targets.len() == before {
                    return Err(Error::ShardUnavailable {
                        node: self.id.to_string(),
                        target: index.clone(),
                    });
                }
            }
            return Ok(targets);
        }

        shards
            .iter()
            .map(|name| match open.get(name) {
                Some(shard) => Ok((name.clone(), Arc::clone(&shard.handle))),
                None => Err(Error::ShardUnavailable {
                    node: self.id.to_string(),
                    target: name.to_string(),
                }),
            })
            .collect()
    }

    /// Number of matching documents across the targeted shards
    pub async fn count(&self, query: &Query, shards: &[ShardName]) -> Result<u64> {
        let targets = self.targets(query, shards).await?;
        let text = query.text.clone();
        let node = self.id.clone();
        let total = tokio::task::spawn_blocking(move || {
            let mut total = 0;
            for (name, handle) in &targets {
                total += handle
                    .count(&text)
                    .map_err(|e| closed_as_unavailable(&node, name, e))?;
            }
            Ok::<_, Error>(total)
        })
        .await
        .map_err(|e| Error::with_source("count task failed", e))??;

        self.queries_served.fetch_add(1, Ordering::Relaxed);
        metrics::record_query_served("count");
        Ok(total)
    }

    /// Node-local top `limit` across the targeted shards, with the true total
    pub async fn search(&self, query: &Query, shards: &[ShardName], limit: usize) -> Result<Hits> {
        let targets = self.targets(query, shards).await?;
        let text = query.text.clone();
        let node = self.id.clone();
        let hits = tokio::task::spawn_blocking(move || {
            let mut parts = Vec::with_capacity(targets.len());
            for (name, handle) in &targets {
                let result = handle
                    .search(&text, limit)
                    .map_err(|e| closed_as_unavailable(&node, name, e))?;
                parts.push(Hits {
                    hits: result
                        .docs
                        .into_iter()
                        .map(|doc| Hit {
                            node: node.clone(),
                            shard: name.clone(),
                            doc_id: doc.doc_id,
                            score: doc.score,
                        })
                        .collect(),
                    total: result.total,
                });
            }
            Ok::<_, Error>(Hits::merge(parts, limit))
        })
        .await
        .map_err(|e| Error::with_source("search task failed", e))??;

        self.queries_served.fetch_add(1, Ordering::Relaxed);
        metrics::record_query_served("search");
        Ok(hits)
    }

    /// Stored fields of one document of an open shard. A shard unloaded
    /// while the lookup runs makes the hit stale.
    pub async fn details(&self, shard: &ShardName, doc_id: u32) -> Result<DetailFields> {
        let stale = || Error::StaleHit {
            node: self.id.to_string(),
            shard: shard.to_string(),
            doc_id,
        };
        let handle = match self.shards.read().await.get(shard) {
            Some(open) => Arc::clone(&open.handle),
            None => return Err(stale()),
        };
        self.queries_served.fetch_add(1, Ordering::Relaxed);
        metrics::record_query_served("details");
        match handle.stored_fields(doc_id) {
            Ok(Some(fields)) => Ok(fields),
            Ok(None) | Err(Error::ShardClosed) => Err(stale()),
            Err(e) => Err(e),
        }
    }
}

/// A handle closed by a concurrent unload reads as the shard no longer being served
fn closed_as_unavailable(node: &NodeId, shard: &ShardName, err: Error) -> Error {
    match err {
        Error::ShardClosed => Error::ShardUnavailable {
            node: node.to_string(),
            target: shard.to_string(),
        },
        other => other,
    }
}

impl MetricsSource for Node {
    fn open_shard_count(&self) -> u64 {
        self.open_count.load(Ordering::SeqCst) as u64
    }

    fn queries_served(&self) -> u64 {
        self.queries_served.load(Ordering::Relaxed)
    }

    fn uptime_secs(&self) -> u64 {
        self.started.elapsed().as_secs()
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        for task in self.lock_tasks().drain(..) {
            task.abort();
        }
    }
}

/// Make a path segment safe to use as a directory name
fn sanitize_dir_name(segment: &str) -> String {
    segment
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' => '_',
            c => c,
        })
        .collect()
}
