//! Core data structures for the shoal cluster
//!
//! Shard and node identities, the records kept in the coordination store,
//! and the query and hit types exchanged between client and nodes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use crate::error::{Error, Result};

/// Separator between index name and shard name in a shard's path segment
pub const SHARD_SEPARATOR: char = '#';

/// Check that a name can be used as a single path segment
pub fn validate_name(kind: &str, name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::config(format!("{kind} name must not be empty")));
    }
    if name.contains('/') || name.contains(SHARD_SEPARATOR) {
        return Err(Error::config(format!(
            "{kind} name '{name}' must not contain '/' or '{SHARD_SEPARATOR}'"
        )));
    }
    Ok(())
}

/// Identity of a shard-serving node (host:port)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Globally unique shard name: the owning index plus the shard's own name
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ShardName {
    pub index: String,
    pub shard: String,
}

impl ShardName {
    pub fn new(index: impl Into<String>, shard: impl Into<String>) -> Self {
        Self {
            index: index.into(),
            shard: shard.into(),
        }
    }

    /// Encode as a single path segment (`index#shard`)
    pub fn segment(&self) -> String {
        format!("{}{}{}", self.index, SHARD_SEPARATOR, self.shard)
    }

    /// Decode from a path segment produced by [`ShardName::segment`]
    pub fn parse(segment: &str) -> Result<Self> {
        let (index, shard) = segment
            .split_once(SHARD_SEPARATOR)
            .ok_or_else(|| Error::codec("shard name", format!("missing separator in '{segment}'")))?;
        if index.is_empty() || shard.is_empty() {
            return Err(Error::codec("shard name", format!("empty part in '{segment}'")));
        }
        Ok(Self::new(index, shard))
    }
}

impl fmt::Display for ShardName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.index, SHARD_SEPARATOR, self.shard)
    }
}

// ============================================================================
// Persisted records
// ============================================================================

/// Lifecycle of an index as seen by the master
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexState {
    /// No record exists
    Unregistered,
    /// Record written, shards not yet enumerated
    Registered,
    /// Shards enumerated and being placed/opened
    ShardsAssigning,
    /// Every shard has at least one serving node
    Deployed,
}

impl IndexState {
    /// Derive the state from persisted facts
    pub fn of(record: Option<&IndexRecord>, shard_count: usize) -> Self {
        match record {
            None => Self::Unregistered,
            Some(r) if r.deployed => Self::Deployed,
            Some(_) if shard_count == 0 => Self::Registered,
            Some(_) => Self::ShardsAssigning,
        }
    }
}

/// An index registered in the cluster
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexRecord {
    pub name: String,
    /// Location of the shard data in the shared storage
    pub location: String,
    /// Identifier of the analyzer the documents were tokenized with
    pub analyzer: String,
    /// Minimum number of nodes that should serve each shard
    pub replication: u32,
    pub deployed: bool,
    pub created_at: DateTime<Utc>,
}

impl IndexRecord {
    pub fn new(
        name: impl Into<String>,
        location: impl Into<String>,
        analyzer: impl Into<String>,
        replication: u32,
    ) -> Self {
        Self {
            name: name.into(),
            location: location.into(),
            analyzer: analyzer.into(),
            replication: replication.max(1),
            deployed: false,
            created_at: Utc::now(),
        }
    }
}

/// One shard of an index, persisted under the index's subtree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardRecord {
    pub name: ShardName,
    pub location: String,
}

/// A shard assigned to a node by the master
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardAssignment {
    pub shard: ShardName,
    pub node: NodeId,
    pub location: String,
    pub analyzer: String,
    pub assigned_at: DateTime<Utc>,
}

/// Marker a node publishes once an assigned shard is open and queryable
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServingMarker {
    pub node: NodeId,
    pub shard: ShardName,
    pub doc_count: u64,
    pub opened_at: DateTime<Utc>,
}

/// Free-text-like status a node reports about itself
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Starting,
    Serving,
    Rejoining,
    ShuttingDown,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Serving => "serving",
            Self::Rejoining => "rejoining",
            Self::ShuttingDown => "shutting down",
        }
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Presence and health record of a node (ephemeral)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub id: NodeId,
    pub name: String,
    pub start_time: DateTime<Utc>,
    pub healthy: bool,
    pub status: NodeStatus,
    pub open_shards: u32,
    pub updated_at: DateTime<Utc>,
}

impl NodeRecord {
    pub fn new(id: NodeId, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            name: name.into(),
            start_time: now,
            healthy: true,
            status: NodeStatus::Starting,
            open_shards: 0,
            updated_at: now,
        }
    }
}

/// Leader marker written by the active master (ephemeral)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MasterRecord {
    pub id: String,
    pub started_at: DateTime<Utc>,
}

/// Current schema version of [`MetricsRecord`]
pub const METRICS_SCHEMA_VERSION: u32 = 1;

/// Optional resource counters; each is reported only if the platform exposes it
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricValues {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resident_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub virtual_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_time_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub open_shards: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queries_served: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uptime_secs: Option<u64>,
}

/// Per-node resource snapshot, periodically overwritten (ephemeral)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsRecord {
    pub version: u32,
    pub node: NodeId,
    pub taken_at: DateTime<Utc>,
    pub values: MetricValues,
}

impl MetricsRecord {
    pub fn new(node: NodeId, values: MetricValues) -> Self {
        Self {
            version: METRICS_SCHEMA_VERSION,
            node,
            taken_at: Utc::now(),
            values,
        }
    }
}

// ============================================================================
// Query values
// ============================================================================

/// Stored fields of one document
pub type DetailFields = BTreeMap<String, String>;

/// Immutable query: text, target indexes and optional result bound
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Query {
    pub text: String,
    pub indexes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

impl Query {
    pub fn new<I, S>(text: impl Into<String>, indexes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            text: text.into(),
            indexes: indexes.into_iter().map(Into::into).collect(),
            limit: None,
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn targets(&self, index: &str) -> bool {
        self.indexes.iter().any(|i| i == index)
    }
}

/// One matched document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hit {
    pub node: NodeId,
    pub shard: ShardName,
    /// Shard-local document id; only meaningful together with `shard` and `node`
    pub doc_id: u32,
    pub score: f32,
}

impl Hit {
    /// Ranking order: descending score, then node id, shard, doc id
    pub fn rank_cmp(&self, other: &Self) -> Ordering {
        other
            .score
            .total_cmp(&self.score)
            .then_with(|| self.node.cmp(&other.node))
            .then_with(|| self.shard.cmp(&other.shard))
            .then_with(|| self.doc_id.cmp(&other.doc_id))
    }
}

/// Ranked hits plus the total number of matches, which may exceed `hits.len()`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Hits {
    pub hits: Vec<Hit>,
    pub total: u64,
}

impl Hits {
    pub fn len(&self) -> usize {
        self.hits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hits.is_empty()
    }

    /// Merge several partial results: rank all hits, keep the top `limit`, sum totals
    pub fn merge<I>(parts: I, limit: usize) -> Self
    where
        I: IntoIterator<Item = Hits>,
    {
        let mut total = 0u64;
        let mut hits = Vec::new();
        for part in parts {
            total += part.total;
            hits.extend(part.hits);
        }
        hits.sort_by(Hit::rank_cmp);
        hits.truncate(limit);
        Self { hits, total }
    }
}
