//! Persisted cluster layout
//!
//! ```text
//! <root>/master                          leader marker (ephemeral)
//! <root>/indexes/<index>                 IndexRecord
//! <root>/indexes/<index>/<shard>         ShardRecord
//! <root>/nodes/<node>                    NodeRecord (ephemeral)
//! <root>/node-to-shard/<node>/<shard>    ShardAssignment
//! <root>/shard-to-node/<shard>/<node>    ServingMarker (ephemeral)
//! <root>/metrics/<node>                  MetricsRecord (ephemeral)
//! ```
//!
//! Each subtree's children are its full membership.

use crate::models::{NodeId, ShardName};

/// Default root of the cluster tree
pub const DEFAULT_ROOT: &str = "/shoal";

const MASTER: &str = "master";
const INDEXES: &str = "indexes";
const NODES: &str = "nodes";
const NODE_TO_SHARD: &str = "node-to-shard";
const SHARD_TO_NODE: &str = "shard-to-node";
const METRICS: &str = "metrics";

/// Path namespace of one cluster under a configurable root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterLayout {
    root: String,
}

impl Default for ClusterLayout {
    fn default() -> Self {
        Self::new(DEFAULT_ROOT)
    }
}

impl ClusterLayout {
    pub fn new(root: impl Into<String>) -> Self {
        let mut root = root.into();
        while root.len() > 1 && root.ends_with('/') {
            root.pop();
        }
        if !root.starts_with('/') {
            root.insert(0, '/');
        }
        Self { root }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    fn under(&self, segment: &str) -> String {
        join(&self.root, segment)
    }

    pub fn master(&self) -> String {
        self.under(MASTER)
    }

    pub fn indexes(&self) -> String {
        self.under(INDEXES)
    }

    pub fn index(&self, name: &str) -> String {
        join(&self.indexes(), name)
    }

    pub fn index_shard(&self, shard: &ShardName) -> String {
        join(&self.index(&shard.index), &shard.shard)
    }

    pub fn nodes(&self) -> String {
        self.under(NODES)
    }

    pub fn node(&self, node: &NodeId) -> String {
        join(&self.nodes(), node.as_str())
    }

    pub fn node_to_shard(&self) -> String {
        self.under(NODE_TO_SHARD)
    }

    pub fn node_assignments(&self, node: &NodeId) -> String {
        join(&self.node_to_shard(), node.as_str())
    }

    pub fn assignment(&self, node: &NodeId, shard: &ShardName) -> String {
        join(&self.node_assignments(node), &shard.segment())
    }

    pub fn shard_to_node(&self) -> String {
        self.under(SHARD_TO_NODE)
    }

    pub fn shard_servers(&self, shard: &ShardName) -> String {
        join(&self.shard_to_node(), &shard.segment())
    }

    pub fn serving_marker(&self, shard: &ShardName, node: &NodeId) -> String {
        join(&self.shard_servers(shard), node.as_str())
    }

    pub fn metrics(&self) -> String {
        self.under(METRICS)
    }

    pub fn node_metrics(&self, node: &NodeId) -> String {
        join(&self.metrics(), node.as_str())
    }

    /// The persistent subtrees that must exist before the cluster starts
    pub fn subtrees(&self) -> Vec<String> {
        vec![
            self.indexes(),
            self.nodes(),
            self.node_to_shard(),
            self.shard_to_node(),
            self.metrics(),
        ]
    }
}

/// Join a parent path and a child segment
pub fn join(parent: &str, child: &str) -> String {
    if parent == "/" {
        format!("/{child}")
    } else {
        format!("{parent}/{child}")
    }
}

/// Parent of a path; `None` for the root
pub fn parent_of(path: &str) -> Option<&str> {
    if path == "/" {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/"),
        Some(i) => Some(&path[..i]),
        None => None,
    }
}

/// Last segment of a path
pub fn last_segment(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Check that a path is absolute and well formed
pub fn is_valid_path(path: &str) -> bool {
    if path == "/" {
        return true;
    }
    path.starts_with('/') && !path.ends_with('/') && !path[1..].split('/').any(str::is_empty)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_paths() {
        let layout = ClusterLayout::new("/shoal");
        let node = NodeId::from("host-a:2000");
        let shard = ShardName::new("docs", "0");

        assert_eq!(layout.master(), "/shoal/master");
        assert_eq!(layout.index("docs"), "/shoal/indexes/docs");
        assert_eq!(layout.index_shard(&shard), "/shoal/indexes/docs/0");
        assert_eq!(layout.node(&node), "/shoal/nodes/host-a:2000");
        assert_eq!(
            layout.assignment(&node, &shard),
            "/shoal/node-to-shard/host-a:2000/docs#0"
        );
        assert_eq!(
            layout.serving_marker(&shard, &node),
            "/shoal/shard-to-node/docs#0/host-a:2000"
        );
        assert_eq!(layout.node_metrics(&node), "/shoal/metrics/host-a:2000");
    }

    #[test]
    fn test_root_normalization() {
        assert_eq!(ClusterLayout::new("test/cluster/").root(), "/test/cluster");
        assert_eq!(ClusterLayout::default().root(), DEFAULT_ROOT);
    }

    #[test]
    fn test_path_helpers() {
        assert_eq!(join("/", "a"), "/a");
        assert_eq!(join("/a", "b"), "/a/b");
        assert_eq!(parent_of("/a/b"), Some("/a"));
        assert_eq!(parent_of("/a"), Some("/"));
        assert_eq!(parent_of("/"), None);
        assert_eq!(last_segment("/a/b#c"), "b#c");
    }

    #[test]
    fn test_is_valid_path() {
        assert!(is_valid_path("/"));
        assert!(is_valid_path("/a/b"));
        assert!(!is_valid_path("a/b"));
        assert!(!is_valid_path("/a/"));
        assert!(!is_valid_path("/a//b"));
    }
}
