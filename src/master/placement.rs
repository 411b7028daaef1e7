//! Least-loaded shard placement
//!
//! Pure planning over a snapshot of the cluster: which assignments must go
//! (dead nodes, removed shards, surplus copies) and where missing copies
//! should be placed. The node with the fewest assigned shards wins, ties go
//! to the lexicographically smallest node id, and a node never holds two
//! copies of one shard.

use std::collections::{BTreeMap, BTreeSet};

use crate::models::{NodeId, ShardName};

/// Current assignments, keyed by node
pub type AssignmentMap = BTreeMap<NodeId, BTreeSet<ShardName>>;

/// Changes that bring the assignments in line with the desired replication
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Plan {
    pub unassign: Vec<(NodeId, ShardName)>,
    pub assign: Vec<(NodeId, ShardName)>,
}

impl Plan {
    pub fn is_empty(&self) -> bool {
        self.unassign.is_empty() && self.assign.is_empty()
    }
}

/// Compute the placement plan.
///
/// `wanted` maps every shard that should be served to its replication
/// level. Replication is capped at the number of live nodes.
pub fn plan(
    live: &BTreeSet<NodeId>,
    current: &AssignmentMap,
    wanted: &BTreeMap<ShardName, u32>,
) -> Plan {
    let mut plan = Plan::default();
    let mut load: BTreeMap<&NodeId, usize> = live.iter().map(|n| (n, 0)).collect();
    let mut holders: BTreeMap<&ShardName, BTreeSet<&NodeId>> = BTreeMap::new();

    for (node, shards) in current {
        for shard in shards {
            if !live.contains(node) || !wanted.contains_key(shard) {
                plan.unassign.push((node.clone(), shard.clone()));
                continue;
            }
            holders.entry(shard).or_default().insert(node);
            if let Some(count) = load.get_mut(node) {
                *count += 1;
            }
        }
    }

    for (shard, &replication) in wanted {
        let target = (replication.max(1) as usize).min(live.len());
        let held = holders.entry(shard).or_default();

        // Surplus copies leave the most loaded holders first
        while held.len() > target {
            let Some(node) = held
                .iter()
                .copied()
                .max_by(|a, b| load[a].cmp(&load[b]).then_with(|| b.cmp(a)))
            else {
                break;
            };
            held.remove(node);
            if let Some(count) = load.get_mut(node) {
                *count -= 1;
            }
            plan.unassign.push((node.clone(), shard.clone()));
        }

        while held.len() < target {
            let Some(node) = pick_least_loaded(&load, held) else {
                break;
            };
            held.insert(node);
            if let Some(count) = load.get_mut(node) {
                *count += 1;
            }
            plan.assign.push((node.clone(), shard.clone()));
        }
    }

    plan
}

/// The eligible node with the fewest shards, ties broken by node id
fn pick_least_loaded<'a>(
    load: &BTreeMap<&'a NodeId, usize>,
    exclude: &BTreeSet<&'a NodeId>,
) -> Option<&'a NodeId> {
    load.iter()
        .filter(|(node, _)| !exclude.contains(*node))
        .min_by(|(a, la), (b, lb)| la.cmp(lb).then_with(|| a.cmp(b)))
        .map(|(node, _)| *node)
}
