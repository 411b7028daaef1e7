//! Cluster master
//!
//! Exactly one master is active at a time: the one holding the ephemeral
//! leader marker. The active master keeps the persisted assignments in line
//! with the registered indexes and the live nodes:
//!
//! 1. new indexes get their shards enumerated from the shared storage
//! 2. assignments of dead nodes and removed indexes are deleted
//! 3. shards below their replication level are placed on the least-loaded
//!    live nodes (see [`placement`])
//! 4. an index is flipped to `deployed` once every shard has a serving marker
//!
//! Every pass starts from the persisted tree, never from memory, so a
//! standby that takes over simply resumes where the old leader stopped.

pub mod placement;

use chrono::Utc;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::index::ShardStorage;
use crate::metrics;
use crate::models::{IndexRecord, MasterRecord, NodeId, ShardAssignment, ShardName, ShardRecord};
use crate::store::layout::{join, parent_of};
use crate::store::{
    watch_data, ClusterLayout, ClusterStore, CreateMode, DataChange, SessionEvent, StoreExt,
    TreeEvent, TreeEventKind,
};
use crate::utils::retry::{with_retry_if, RetryConfig};

use placement::AssignmentMap;

fn is_connection_lost(err: &Error) -> bool {
    err.is_connection_lost()
}

/// What one reconcile pass changed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub live_nodes: usize,
    pub assigned: usize,
    pub unassigned: usize,
    /// Indexes flipped to deployed by this pass
    pub deployed: Vec<String>,
    /// Some index could not be processed and needs another pass
    pub incomplete: bool,
}

/// Why the leader loop ended
enum Leadership {
    Lost,
    Stopped,
}

/// A registered index with its shards
struct IndexShards {
    record: IndexRecord,
    shards: Vec<ShardRecord>,
}

/// Master process bound to one coordination session
pub struct Master {
    id: String,
    store: Arc<dyn ClusterStore>,
    layout: ClusterLayout,
    storage: Arc<dyn ShardStorage>,
    retry: RetryConfig,
    leader: AtomicBool,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Master {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Master")
            .field("id", &self.id)
            .field("leader", &self.is_leader())
            .finish()
    }
}

impl Master {
    pub fn new(
        store: Arc<dyn ClusterStore>,
        storage: Arc<dyn ShardStorage>,
        config: &Config,
    ) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            id: format!("{}-{}", crate::utils::hostname(), Uuid::new_v4()),
            store,
            layout: ClusterLayout::new(config.store.root_path.clone()),
            storage,
            retry: config.store_retry(),
            leader: AtomicBool::new(false),
            shutdown,
            task: Mutex::new(None),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Whether this instance currently holds the leader marker
    pub fn is_leader(&self) -> bool {
        self.leader.load(Ordering::SeqCst)
    }

    async fn retry<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        with_retry_if(&self.retry, op, is_connection_lost).await
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Create the cluster layout and start competing for leadership
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.ensure_layout().await?;
        let task = tokio::spawn(Arc::clone(self).run(self.shutdown.subscribe()));
        *self.task.lock().unwrap_or_else(|e| e.into_inner()) = Some(task);
        info!(master = %self.id, "Master started");
        Ok(())
    }

    /// Stop and release leadership
    pub async fn shutdown(&self) -> Result<()> {
        self.abort();
        self.store.close().await
    }

    /// Stop the election and reconcile loop without releasing anything
    pub fn abort(&self) {
        self.shutdown.send_replace(true);
        if let Some(task) = self.task.lock().unwrap_or_else(|e| e.into_inner()).take() {
            task.abort();
        }
        self.leader.store(false, Ordering::SeqCst);
    }

    async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.elect().await {
                Ok(true) => match self.lead(&mut shutdown).await {
                    Leadership::Stopped => break,
                    Leadership::Lost => {
                        self.leader.store(false, Ordering::SeqCst);
                        warn!(master = %self.id, "Leadership lost");
                    }
                },
                Ok(false) => {
                    if !self.stand_by(&mut shutdown).await {
                        break;
                    }
                }
                Err(e) => {
                    error!(master = %self.id, error = %e, "Election failed");
                    tokio::time::sleep(self.retry.calculate_delay(0)).await;
                }
            }
        }
        self.leader.store(false, Ordering::SeqCst);
        debug!(master = %self.id, "Master loop stopped");
    }

    /// Try to take the leader marker
    async fn elect(&self) -> Result<bool> {
        let path = self.layout.master();
        let record = MasterRecord {
            id: self.id.clone(),
            started_at: Utc::now(),
        };
        let store = self.store.as_ref();
        match self
            .retry(|| store.create_record(&path, &record, CreateMode::Ephemeral))
            .await
        {
            Ok(()) => Ok(true),
            Err(e) if e.is_already_exists() => self.holds_marker().await,
            Err(e) => Err(e),
        }
    }

    async fn holds_marker(&self) -> Result<bool> {
        let path = self.layout.master();
        let holder: Option<MasterRecord> = self
            .retry(|| self.store.try_read_record(&path))
            .await?;
        Ok(holder.is_some_and(|h| h.id == self.id))
    }

    /// Wait until the leader marker disappears. Returns false on shutdown.
    async fn stand_by(&self, shutdown: &mut watch::Receiver<bool>) -> bool {
        let mut marker = match watch_data(Arc::clone(&self.store), &self.layout.master()).await {
            Ok(watch) => watch,
            Err(e) => {
                warn!(master = %self.id, error = %e, "Cannot watch leader marker");
                tokio::time::sleep(self.retry.calculate_delay(0)).await;
                return true;
            }
        };
        if marker.initial.is_none() {
            return true;
        }
        info!(master = %self.id, "Standing by as secondary master");

        loop {
            tokio::select! {
                change = marker.next() => match change {
                    Some(DataChange::Changed(_)) => continue,
                    Some(DataChange::Deleted) | None => return true,
                },
                _ = shutdown.changed() => return false,
            }
        }
    }

    async fn lead(&self, shutdown: &mut watch::Receiver<bool>) -> Leadership {
        self.leader.store(true, Ordering::SeqCst);
        info!(master = %self.id, "Master promoted to leader");

        let mut feed = self.store.subscribe();
        let mut sessions = self.store.session_events();
        let master_path = self.layout.master();
        let mut dirty = true;
        let mut failures: u32 = 0;

        loop {
            if dirty {
                dirty = false;
                match self.holds_marker().await {
                    Ok(true) => {}
                    Ok(false) => return Leadership::Lost,
                    Err(e) => warn!(master = %self.id, error = %e, "Cannot verify leadership"),
                }
                match self.reconcile().await {
                    Ok(report) if !report.incomplete => {
                        failures = 0;
                        metrics::record_reconcile(false);
                    }
                    Ok(_) => {
                        failures = failures.saturating_add(1);
                        metrics::record_reconcile(true);
                    }
                    Err(e) => {
                        failures = failures.saturating_add(1);
                        metrics::record_reconcile(true);
                        error!(master = %self.id, error = %e, "Reconcile failed");
                    }
                }
            }

            let backoff = self.retry.calculate_delay(failures.saturating_sub(1));
            tokio::select! {
                event = feed.recv() => match event {
                    Ok(event) if event.path == master_path && event.kind == TreeEventKind::Deleted => {
                        return Leadership::Lost;
                    }
                    Ok(event) => dirty = self.triggers_reconcile(&event),
                    Err(broadcast::error::RecvError::Lagged(_)) => dirty = true,
                    Err(broadcast::error::RecvError::Closed) => return Leadership::Stopped,
                },
                event = sessions.recv() => match event {
                    Ok(SessionEvent::Expired { .. }) | Ok(SessionEvent::NewSession { .. }) => {
                        return Leadership::Lost;
                    }
                    Ok(SessionEvent::Reconnected) => dirty = true,
                    Ok(SessionEvent::Disconnected) => {
                        warn!(master = %self.id, "Disconnected from coordination store");
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => dirty = true,
                    Err(broadcast::error::RecvError::Closed) => return Leadership::Stopped,
                },
                _ = tokio::time::sleep(backoff), if failures > 0 => dirty = true,
                _ = shutdown.changed() => return Leadership::Stopped,
            }
        }
    }

    /// Membership changes that can require placement or deploy work
    fn triggers_reconcile(&self, event: &TreeEvent) -> bool {
        match event.kind {
            TreeEventKind::Reset => true,
            TreeEventKind::DataChanged => false,
            TreeEventKind::Created | TreeEventKind::Deleted => {
                let Some(parent) = parent_of(&event.path) else {
                    return false;
                };
                let grandparent = parent_of(parent);
                parent == self.layout.nodes()
                    || parent == self.layout.indexes()
                    || grandparent == Some(self.layout.shard_to_node().as_str())
                    || grandparent == Some(self.layout.node_to_shard().as_str())
            }
        }
    }

    // ========================================================================
    // Reconcile
    // ========================================================================

    async fn ensure_layout(&self) -> Result<()> {
        for path in self.layout.subtrees() {
            match self
                .store
                .ensure_created(&path, Vec::new(), CreateMode::Persistent, &self.retry)
                .await
            {
                Ok(_) => {}
                Err(e) if e.is_already_exists() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// One full pass from the persisted tree to the desired assignments
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        let store = self.store.as_ref();
        let mut report = ReconcileReport::default();
        self.ensure_layout().await?;

        let nodes_path = self.layout.nodes();
        let live: BTreeSet<NodeId> = self
            .retry(|| store.children_or_empty(&nodes_path))
            .await?
            .into_iter()
            .map(NodeId::new)
            .collect();
        report.live_nodes = live.len();

        let indexes = self.load_indexes(&mut report).await?;
        let mut wanted: BTreeMap<ShardName, u32> = BTreeMap::new();
        let mut sources: BTreeMap<ShardName, (&str, &str)> = BTreeMap::new();
        for index in &indexes {
            for shard in &index.shards {
                wanted.insert(shard.name.clone(), index.record.replication);
                sources.insert(
                    shard.name.clone(),
                    (shard.location.as_str(), index.record.analyzer.as_str()),
                );
            }
        }

        let current = self.load_assignments().await?;
        let plan = placement::plan(&live, &current, &wanted);

        for (node, shard) in &plan.unassign {
            let path = self.layout.assignment(node, shard);
            if store.ensure_deleted(&path, &self.retry).await? {
                report.unassigned += 1;
                debug!(node = %node, shard = %shard, "Shard unassigned");
            }
        }
        for node in current.keys().filter(|n| !live.contains(*n)) {
            store
                .ensure_deleted(&self.layout.node_assignments(node), &self.retry)
                .await?;
            info!(node = %node, "Released assignments of departed node");
        }

        for (node, shard) in &plan.assign {
            let Some((location, analyzer)) = sources.get(shard) else {
                continue;
            };
            let assignment = ShardAssignment {
                shard: shard.clone(),
                node: node.clone(),
                location: location.to_string(),
                analyzer: analyzer.to_string(),
                assigned_at: Utc::now(),
            };
            let path = self.layout.assignment(node, shard);
            match self
                .retry(|| store.create_record(&path, &assignment, CreateMode::Persistent))
                .await
            {
                Ok(()) => {
                    report.assigned += 1;
                    info!(node = %node, shard = %shard, "Shard assigned");
                }
                Err(e) if e.is_already_exists() => {}
                Err(e) => return Err(e),
            }
        }
        metrics::record_assignments("assign", report.assigned);
        metrics::record_assignments("unassign", report.unassigned);

        self.prune_serving_entries(&wanted).await?;

        let mut deployed = 0;
        for index in &indexes {
            if index.record.deployed {
                deployed += 1;
                continue;
            }
            if self.all_shards_serving(index).await? {
                let mut record = index.record.clone();
                record.deployed = true;
                let path = self.layout.index(&record.name);
                self.retry(|| store.write_record(&path, &record)).await?;
                info!(index = %record.name, shards = index.shards.len(), "Index deployed");
                report.deployed.push(record.name);
                deployed += 1;
            }
        }
        metrics::update_cluster_metrics(live.len(), deployed);

        if !plan.is_empty() || !report.deployed.is_empty() {
            debug!(
                assigned = report.assigned,
                unassigned = report.unassigned,
                deployed = report.deployed.len(),
                "Reconcile pass applied changes"
            );
        }
        Ok(report)
    }

    async fn load_indexes(&self, report: &mut ReconcileReport) -> Result<Vec<IndexShards>> {
        let store = self.store.as_ref();
        let indexes_path = self.layout.indexes();
        let names = self
            .retry(|| store.children_or_empty(&indexes_path))
            .await?;

        let mut indexes = Vec::with_capacity(names.len());
        for name in names {
            let path = self.layout.index(&name);
            let record: IndexRecord = match self.retry(|| store.try_read_record(&path)).await {
                Ok(Some(record)) => record,
                Ok(None) => continue,
                Err(Error::Codec { .. }) => {
                    // Parent left behind by a shard write racing a removal
                    warn!(index = %name, "Removing index entry without a record");
                    store.ensure_deleted(&path, &self.retry).await?;
                    continue;
                }
                Err(e) => return Err(e),
            };

            match self.index_shards(&record).await {
                Ok(shards) => indexes.push(IndexShards { record, shards }),
                Err(e) => {
                    report.incomplete = true;
                    warn!(index = %name, location = %record.location, error = %e, "Cannot enumerate shards");
                }
            }
        }
        Ok(indexes)
    }

    /// Shard records of an index, enumerating them from storage on first sight
    async fn index_shards(&self, record: &IndexRecord) -> Result<Vec<ShardRecord>> {
        let store = self.store.as_ref();
        let index_path = self.layout.index(&record.name);
        let children = self.retry(|| store.children_or_empty(&index_path)).await?;

        if !children.is_empty() {
            let mut shards = Vec::with_capacity(children.len());
            for child in children {
                let path = join(&index_path, &child);
                if let Some(shard) = self
                    .retry(|| store.try_read_record::<ShardRecord>(&path))
                    .await?
                {
                    shards.push(shard);
                }
            }
            return Ok(shards);
        }

        let sources = self.storage.list_shards(&record.location).await?;
        if sources.is_empty() {
            return Err(Error::other(format!(
                "no shards found at {}",
                record.location
            )));
        }

        let mut shards = Vec::with_capacity(sources.len());
        for source in sources {
            let shard = ShardRecord {
                name: ShardName::new(&record.name, source.name),
                location: source.location,
            };
            let path = self.layout.index_shard(&shard.name);
            match self
                .retry(|| store.create_record(&path, &shard, CreateMode::Persistent))
                .await
            {
                Ok(()) | Err(Error::AlreadyExists { .. }) => {}
                Err(e) => return Err(e),
            }
            shards.push(shard);
        }
        info!(index = %record.name, shards = shards.len(), "Enumerated index shards");
        Ok(shards)
    }

    async fn load_assignments(&self) -> Result<AssignmentMap> {
        let store = self.store.as_ref();
        let root = self.layout.node_to_shard();
        let nodes = self
            .retry(|| store.children_or_empty(&root))
            .await?;

        let mut current = AssignmentMap::new();
        for node in nodes {
            let node = NodeId::new(node);
            let path = self.layout.node_assignments(&node);
            let segments = self
                .retry(|| store.children_or_empty(&path))
                .await?;
            let shards = segments
                .iter()
                .filter_map(|segment| match ShardName::parse(segment) {
                    Ok(shard) => Some(shard),
                    Err(e) => {
                        warn!(node = %node, segment = %segment, error = %e, "Ignoring malformed assignment");
                        None
                    }
                })
                .collect();
            current.insert(node, shards);
        }
        Ok(current)
    }

    /// Drop serving entries of shards that no longer belong to any index
    async fn prune_serving_entries(&self, wanted: &BTreeMap<ShardName, u32>) -> Result<()> {
        let store = self.store.as_ref();
        let root = self.layout.shard_to_node();
        let segments = self.retry(|| store.children_or_empty(&root)).await?;
        for segment in segments {
            let keep = ShardName::parse(&segment)
                .map(|shard| wanted.contains_key(&shard))
                .unwrap_or(false);
            if !keep {
                let path = join(&root, &segment);
                store.ensure_deleted(&path, &self.retry).await?;
            }
        }
        Ok(())
    }

    async fn all_shards_serving(&self, index: &IndexShards) -> Result<bool> {
        if index.shards.is_empty() {
            return Ok(false);
        }
        let store = self.store.as_ref();
        for shard in &index.shards {
            let path = self.layout.shard_servers(&shard.name);
            let servers = self
                .retry(|| store.children_or_empty(&path))
                .await?;
            if servers.is_empty() {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

impl Drop for Master {
    fn drop(&mut self) {
        if let Some(task) = self.task.lock().unwrap_or_else(|e| e.into_inner()).take() {
            task.abort();
        }
    }
}

/// Wait until `master` holds the leader marker
pub async fn wait_for_leadership(master: &Master, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if master.is_leader() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    master.is_leader()
}
