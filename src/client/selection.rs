//! Replica selection for query fan-out
//!
//! Every served shard of the queried indexes is answered by exactly one
//! live node, so replicated shards are never counted twice. Successive
//! requests rotate through the replicas of a shard.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::models::{NodeId, ShardName};

/// Snapshot of who is alive and who serves what
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterView {
    pub nodes: BTreeSet<NodeId>,
    /// Nodes with a serving marker, per shard
    pub servers: BTreeMap<ShardName, BTreeSet<NodeId>>,
}

impl ClusterView {
    /// Live nodes serving `shard`
    pub fn live_servers(&self, shard: &ShardName) -> Vec<&NodeId> {
        self.servers
            .get(shard)
            .map(|servers| servers.iter().filter(|n| self.nodes.contains(*n)).collect())
            .unwrap_or_default()
    }

    /// Shards of `index` known to the view
    pub fn shards_of<'a>(&'a self, index: &'a str) -> impl Iterator<Item = &'a ShardName> + 'a {
        self.servers.keys().filter(move |s| s.index == index)
    }

    /// Whether every known shard of `index` has at least one live server
    pub fn is_served(&self, index: &str) -> bool {
        let mut shards = self.shards_of(index).peekable();
        shards.peek().is_some() && shards.all(|s| !self.live_servers(s).is_empty())
    }
}

/// Shards to ask each node for
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selection {
    pub by_node: BTreeMap<NodeId, Vec<ShardName>>,
    /// Shards of the queried indexes without any live server
    pub unserved: Vec<ShardName>,
}

impl Selection {
    pub fn is_empty(&self) -> bool {
        self.by_node.is_empty()
    }
}

/// Round-robin replica selector
#[derive(Debug, Default)]
pub struct ReplicaSelector {
    round: AtomicUsize,
}

impl ReplicaSelector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn select(&self, view: &ClusterView, indexes: &[String]) -> Selection {
        let round = self.round.fetch_add(1, Ordering::Relaxed);
        let mut selection = Selection::default();
        let wanted: BTreeSet<&str> = indexes.iter().map(String::as_str).collect();

        for (position, shard) in view
            .servers
            .keys()
            .filter(|s| wanted.contains(s.index.as_str()))
            .enumerate()
        {
            let candidates = view.live_servers(shard);
            if candidates.is_empty() {
                selection.unserved.push(shard.clone());
                continue;
            }
            let node = candidates[round.wrapping_add(position) % candidates.len()];
            selection
                .by_node
                .entry(node.clone())
                .or_default()
                .push(shard.clone());
        }
        selection
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn view(entries: &[(&str, &[&str])]) -> ClusterView {
        let mut view = ClusterView::default();
        for (shard, nodes) in entries {
            let name = ShardName::parse(shard).unwrap();
            let set: BTreeSet<NodeId> = nodes.iter().map(|n| NodeId::from(*n)).collect();
            view.nodes.extend(set.iter().cloned());
            view.servers.insert(name, set);
        }
        view
    }

    fn indexes(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_each_shard_selected_once() {
        let view = view(&[("docs#s0", &["a", "b"]), ("docs#s1", &["a", "b"])]);
        let selection = ReplicaSelector::new().select(&view, &indexes(&["docs"]));
        let total: usize = selection.by_node.values().map(Vec::len).sum();
        assert_eq!(total, 2);
        assert!(selection.unserved.is_empty());
    }

    #[test]
    fn test_replicas_rotate() {
        let view = view(&[("docs#s0", &["a", "b"])]);
        let selector = ReplicaSelector::new();
        let first = selector.select(&view, &indexes(&["docs"]));
        let second = selector.select(&view, &indexes(&["docs"]));
        assert_ne!(first.by_node.keys().next(), second.by_node.keys().next());
    }

    #[test]
    fn test_dead_servers_skipped() {
        let mut view = view(&[("docs#s0", &["a"]), ("docs#s1", &["b"])]);
        view.nodes.remove(&NodeId::from("b"));
        let selection = ReplicaSelector::new().select(&view, &indexes(&["docs"]));
        assert_eq!(selection.unserved, vec![ShardName::new("docs", "s1")]);
        assert_eq!(selection.by_node.len(), 1);
        assert!(!view.is_served("docs"));
    }

    #[test]
    fn test_other_indexes_ignored() {
        let view = view(&[("docs#s0", &["a"]), ("logs#s0", &["b"])]);
        let selection = ReplicaSelector::new().select(&view, &indexes(&["logs"]));
        assert_eq!(
            selection.by_node.get(&NodeId::from("b")),
            Some(&vec![ShardName::new("logs", "s0")])
        );
        assert!(view.is_served("docs"));
        assert!(!view.is_served("missing"));
    }
}
