//! Test fixtures for integration tests
//!
//! Builds an in-process cluster over a shared [`MemoryStore`]: one master,
//! any number of nodes opening JSON-lines shards from a temporary directory,
//! an admin handle and a client wired to the nodes through a
//! [`LocalConnector`].

use std::future::Future;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use shoal::admin::Admin;
use shoal::client::Client;
use shoal::config::Config;
use shoal::index::{FsStorage, JsonlLibrary};
use shoal::master::{wait_for_leadership, Master};
use shoal::models::NodeId;
use shoal::node::rpc::{LocalConnector, NodeRpc};
use shoal::node::Node;
use shoal::store::{ClusterLayout, MemorySession, MemoryStore};
use tempfile::TempDir;

/// Articles of the `docs` index, one inner slice per shard
pub const DOCS_SHARDS: &[&[&str]] = &[
    &[
        "rust search engine",
        "distributed rust cluster",
        "coordination store sessions",
    ],
    &["search cluster master", "rust node shards", "merge hits by score"],
];

/// Articles of the `logs` index
pub const LOGS_SHARDS: &[&[&str]] = &[&["rust panic in node", "master elected"]];

/// A node started by the fixture, together with its store session
pub struct TestNode {
    pub id: NodeId,
    pub node: Arc<Node>,
    pub session: Arc<MemorySession>,
}

pub struct TestCluster {
    pub store: Arc<MemoryStore>,
    pub layout: ClusterLayout,
    pub config: Config,
    pub library: JsonlLibrary,
    pub connector: Arc<LocalConnector>,
    pub master: Arc<Master>,
    pub nodes: Vec<TestNode>,
    pub admin: Admin,
    data: TempDir,
    _work: TempDir,
}

pub fn test_config(work: &TempDir) -> Config {
    let mut config = Config::default();
    config.node.shard_dir = work.path().to_path_buf();
    config.node.health_interval_secs = 1;
    config.node.metrics_interval_ms = 100;
    config.master.retry_base_delay_ms = 5;
    config.master.retry_max_delay_ms = 50;
    config.client.request_timeout_ms = 2_000;
    config.client.detail_timeout_ms = 2_000;
    config.client.deploy_timeout_secs = 10;
    config
}

impl TestCluster {
    /// Start a master and `node_count` nodes
    pub async fn start(node_count: usize) -> Self {
        let data = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        let config = test_config(&work);
        let store = MemoryStore::new();

        let master = Master::new(store.connect(), Arc::new(FsStorage::new()), &config);
        master.start().await.unwrap();
        assert!(wait_for_leadership(&master, Duration::from_secs(5)).await);

        let mut cluster = Self {
            admin: Admin::new(store.connect(), &config),
            layout: ClusterLayout::new(config.store.root_path.clone()),
            store,
            config,
            library: JsonlLibrary::new(),
            connector: Arc::new(LocalConnector::new()),
            master,
            nodes: Vec::new(),
            data,
            _work: work,
        };
        for i in 0..node_count {
            cluster.start_node(&format!("node-{i}:20000")).await;
        }
        cluster
    }

    pub async fn start_node(&mut self, id: &str) -> Arc<Node> {
        let id = NodeId::from(id);
        let session = self.store.connect();
        let node = Node::new(
            id.clone(),
            session.clone(),
            Arc::new(self.library.clone()),
            Arc::new(FsStorage::new()),
            &self.config,
        );
        node.start().await.unwrap();
        self.connector.register(Arc::clone(&node) as Arc<dyn NodeRpc>);
        self.nodes.push(TestNode {
            id,
            node: Arc::clone(&node),
            session,
        });
        node
    }

    pub fn node(&self, id: &str) -> &TestNode {
        self.nodes
            .iter()
            .find(|n| n.id.as_str() == id)
            .unwrap_or_else(|| panic!("no node {id}"))
    }

    /// Write an index of JSON-lines shards and return its location
    pub fn write_index(&self, name: &str, shards: &[&[&str]]) -> String {
        let root = self.data.path().join(name);
        for (i, docs) in shards.iter().enumerate() {
            let dir = root.join(format!("s{i}"));
            std::fs::create_dir_all(&dir).unwrap();
            let mut file = std::fs::File::create(dir.join("part-0.jsonl")).unwrap();
            for (n, text) in docs.iter().enumerate() {
                let doc = serde_json::json!({ "title": text, "position": n.to_string() });
                writeln!(file, "{doc}").unwrap();
            }
        }
        root.to_string_lossy().into_owned()
    }

    /// Write and deploy an index with the given replication
    pub async fn deploy(&self, name: &str, shards: &[&[&str]], replication: u32) {
        let location = self.write_index(name, shards);
        let record = self
            .admin
            .add_index(name, &location, "standard", Some(replication))
            .await
            .unwrap();
        assert!(record.deployed);
    }

    pub async fn client(&self) -> Arc<Client> {
        Client::connect(self.store.connect(), self.connector.clone(), &self.config)
            .await
            .unwrap()
    }

    pub async fn shutdown(self) {
        for node in &self.nodes {
            node.node.abort();
        }
        self.master.abort();
    }
}

/// Poll `check` until it holds or `timeout` passes
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
