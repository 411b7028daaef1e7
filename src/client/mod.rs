//! Query client
//!
//! Keeps a live view of the cluster from watches (live nodes, and the
//! serving markers of every shard), fans queries out to the nodes serving
//! the requested indexes and merges their answers.
//!
//! A node that errors or misses the deadline is left out of the result:
//! counts and totals then undercount instead of failing the whole request.

pub mod rate;
pub mod selection;

use futures::future::join_all;
use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::metrics;
use crate::models::{DetailFields, Hit, Hits, NodeId, Query, ShardName};
use crate::node::rpc::{NodeConnector, NodeRpc};
use crate::store::watch::ChildWatch;
use crate::store::{watch_children, ClusterLayout, ClusterStore};

use rate::QueryRate;
pub use selection::{ClusterView, ReplicaSelector, Selection};

/// Result bound used when a query does not carry one
pub const DEFAULT_SEARCH_LIMIT: usize = 10;

/// Shared live view plus a change counter for waiters
#[derive(Debug)]
struct ViewState {
    view: RwLock<ClusterView>,
    version: watch::Sender<u64>,
}

impl ViewState {
    fn update(&self, f: impl FnOnce(&mut ClusterView)) {
        {
            let mut view = self.view.write().unwrap_or_else(|e| e.into_inner());
            f(&mut view);
        }
        self.version.send_modify(|v| *v += 1);
    }

    fn snapshot(&self) -> ClusterView {
        self.view.read().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

type ShardTasks = Arc<Mutex<HashMap<ShardName, JoinHandle<()>>>>;

/// Fan-out query client
pub struct Client {
    store: Arc<dyn ClusterStore>,
    connector: Arc<dyn NodeConnector>,
    state: Arc<ViewState>,
    selector: ReplicaSelector,
    rate: QueryRate,
    request_timeout: Duration,
    detail_timeout: Duration,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shard_tasks: ShardTasks,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("view", &self.state.snapshot())
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

impl Client {
    /// Install the watches and build the initial view
    pub async fn connect(
        store: Arc<dyn ClusterStore>,
        connector: Arc<dyn NodeConnector>,
        config: &Config,
    ) -> Result<Arc<Self>> {
        let layout = ClusterLayout::new(config.store.root_path.clone());
        let (version, _) = watch::channel(0);
        let state = Arc::new(ViewState {
            view: RwLock::new(ClusterView::default()),
            version,
        });
        let shard_tasks: ShardTasks = Arc::new(Mutex::new(HashMap::new()));

        let nodes = watch_children(Arc::clone(&store), &layout.nodes()).await?;
        let nodes_initial: BTreeSet<NodeId> = nodes.initial.iter().cloned().map(NodeId::new).collect();
        state.update(|view| view.nodes = nodes_initial);

        let shards = watch_children(Arc::clone(&store), &layout.shard_to_node()).await?;
        for segment in &shards.initial {
            follow_shard(&store, &layout, &state, &shard_tasks, segment).await;
        }

        let tasks = vec![
            tokio::spawn(follow_nodes(nodes, Arc::clone(&state))),
            tokio::spawn(follow_shard_set(
                shards,
                Arc::clone(&store),
                layout.clone(),
                Arc::clone(&state),
                Arc::clone(&shard_tasks),
            )),
        ];

        Ok(Arc::new(Self {
            store,
            connector,
            state,
            selector: ReplicaSelector::new(),
            rate: QueryRate::new(),
            request_timeout: config.request_timeout(),
            detail_timeout: config.detail_timeout(),
            tasks: Mutex::new(tasks),
            shard_tasks,
        }))
    }

    /// Current live view
    pub fn view(&self) -> ClusterView {
        self.state.snapshot()
    }

    /// Wait until `check` holds for the live view
    pub async fn wait_for_view<F>(&self, check: F, timeout: Duration) -> bool
    where
        F: Fn(&ClusterView) -> bool,
    {
        let mut changes = self.state.version.subscribe();
        let wait = async {
            loop {
                if check(&self.state.snapshot()) {
                    return;
                }
                if changes.changed().await.is_err() {
                    // Sender lives as long as self
                    std::future::pending::<()>().await;
                }
            }
        };
        tokio::time::timeout(timeout, wait).await.is_ok()
    }

    /// Queries issued during the last minute
    pub fn queries_per_minute(&self) -> f64 {
        self.rate.per_minute()
    }

    /// Stop following the cluster and end the session
    pub async fn close(&self) -> Result<()> {
        self.stop_tasks();
        self.store.close().await
    }

    fn stop_tasks(&self) {
        for task in self.tasks.lock().unwrap_or_else(|e| e.into_inner()).drain(..) {
            task.abort();
        }
        for (_, task) in self
            .shard_tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
        {
            task.abort();
        }
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Matching documents over every requested index
    pub async fn count(&self, query: &Query) -> Result<u64> {
        let started = Instant::now();
        self.rate.record();
        let selection = self.select(query);
        let counts = self
            .fan_out("count", selection, |rpc, shards| async move {
                rpc.count(query, &shards).await
            })
            .await;
        metrics::record_client_query("count", started.elapsed().as_secs_f64());
        Ok(counts.into_iter().sum())
    }

    /// Best `query.limit` hits over every requested index
    pub async fn search(&self, query: &Query) -> Result<Hits> {
        let started = Instant::now();
        self.rate.record();
        let limit = query.limit.unwrap_or(DEFAULT_SEARCH_LIMIT);
        let selection = self.select(query);
        let parts = self
            .fan_out("search", selection, |rpc, shards| async move {
                rpc.search(query, &shards, limit).await
            })
            .await;
        metrics::record_client_query("search", started.elapsed().as_secs_f64());
        Ok(Hits::merge(parts, limit))
    }

    /// Stored fields of a hit, asked from the node that returned it
    pub async fn details(&self, hit: &Hit) -> Result<DetailFields> {
        let started = Instant::now();
        let rpc = self.connector.connect(&hit.node)?;
        let result = match tokio::time::timeout(
            self.detail_timeout,
            rpc.details(&hit.shard, hit.doc_id),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(Error::NodeTimeout {
                node: hit.node.to_string(),
                timeout_ms: self.detail_timeout.as_millis() as u64,
            }),
        };
        metrics::record_client_query("details", started.elapsed().as_secs_f64());
        result
    }

    fn select(&self, query: &Query) -> Selection {
        let view = self.state.view.read().unwrap_or_else(|e| e.into_inner());
        let selection = self.selector.select(&view, &query.indexes);
        if !selection.unserved.is_empty() {
            debug!(unserved = ?selection.unserved, "Shards without a live server");
        }
        selection
    }

    /// Call every selected node in parallel under one deadline. Failed or
    /// late nodes are logged and dropped.
    async fn fan_out<T, F, Fut>(&self, operation: &'static str, selection: Selection, call: F) -> Vec<T>
    where
        F: Fn(Arc<dyn NodeRpc>, Vec<ShardName>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let call = &call;
        let timeout = self.request_timeout;
        let calls = selection.by_node.into_iter().map(|(node, shards)| async move {
            let rpc = match self.connector.connect(&node) {
                Ok(rpc) => rpc,
                Err(e) => {
                    warn!(node = %node, operation = operation, error = %e, "Node unreachable, excluded from fan-out");
                    metrics::record_fanout_failure(operation, "unreachable");
                    return None;
                }
            };
            match tokio::time::timeout(timeout, call(rpc, shards)).await {
                Ok(Ok(value)) => Some(value),
                Ok(Err(e)) => {
                    warn!(node = %node, operation = operation, error = %e, "Node failed, excluded from fan-out");
                    metrics::record_fanout_failure(operation, "error");
                    None
                }
                Err(_) => {
                    warn!(
                        node = %node,
                        operation = operation,
                        timeout_ms = timeout.as_millis() as u64,
                        "Node timed out, excluded from fan-out"
                    );
                    metrics::record_fanout_failure(operation, "timeout");
                    None
                }
            }
        });
        join_all(calls).await.into_iter().flatten().collect()
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.stop_tasks();
    }
}

// ============================================================================
// View Maintenance
// ============================================================================

async fn follow_nodes(mut watch: ChildWatch, state: Arc<ViewState>) {
    while let Some(change) = watch.next().await {
        if !change.added.is_empty() {
            debug!(nodes = ?change.added, "Nodes joined");
        }
        if !change.removed.is_empty() {
            debug!(nodes = ?change.removed, "Nodes left");
        }
        let nodes: BTreeSet<NodeId> = change.children.into_iter().map(NodeId::new).collect();
        state.update(|view| view.nodes = nodes);
    }
}

async fn follow_shard_set(
    mut watch: ChildWatch,
    store: Arc<dyn ClusterStore>,
    layout: ClusterLayout,
    state: Arc<ViewState>,
    tasks: ShardTasks,
) {
    while let Some(change) = watch.next().await {
        for segment in &change.removed {
            let Ok(shard) = ShardName::parse(segment) else {
                continue;
            };
            if let Some(task) = tasks.lock().unwrap_or_else(|e| e.into_inner()).remove(&shard) {
                task.abort();
            }
            state.update(|view| {
                view.servers.remove(&shard);
            });
        }
        for segment in &change.added {
            follow_shard(&store, &layout, &state, &tasks, segment).await;
        }
    }
}

/// Start following the serving markers of one shard
async fn follow_shard(
    store: &Arc<dyn ClusterStore>,
    layout: &ClusterLayout,
    state: &Arc<ViewState>,
    tasks: &ShardTasks,
    segment: &str,
) {
    let shard = match ShardName::parse(segment) {
        Ok(shard) => shard,
        Err(e) => {
            warn!(segment = %segment, error = %e, "Ignoring malformed shard entry");
            return;
        }
    };
    let mut watch = match watch_children(Arc::clone(store), &layout.shard_servers(&shard)).await {
        Ok(watch) => watch,
        Err(e) => {
            warn!(shard = %shard, error = %e, "Cannot watch shard servers");
            return;
        }
    };

    let servers: BTreeSet<NodeId> = watch.initial.iter().cloned().map(NodeId::new).collect();
    state.update(|view| {
        view.servers.insert(shard.clone(), servers);
    });

    let task_state = Arc::clone(state);
    let task_shard = shard.clone();
    let task = tokio::spawn(async move {
        while let Some(change) = watch.next().await {
            let servers: BTreeSet<NodeId> = change.children.into_iter().map(NodeId::new).collect();
            // Never resurrect a shard removed from the view
            task_state.update(|view| {
                if let Some(entry) = view.servers.get_mut(&task_shard) {
                    *entry = servers;
                }
            });
        }
    });
    if let Some(old) = tasks
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .insert(shard, task)
    {
        old.abort();
    }
}
