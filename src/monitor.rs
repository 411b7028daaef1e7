//! Per-node metrics publisher
//!
//! Samples process statistics and the node's serving counters at a fixed
//! interval and publishes them as an ephemeral [`MetricsRecord`] under
//! `<root>/metrics/<node>`. Statistics the platform cannot provide are left
//! empty.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::models::{MetricValues, MetricsRecord, NodeId};
use crate::store::{ClusterLayout, ClusterStore, CreateMode, StoreExt};

/// USER_HZ on every mainstream Linux build
const CLOCK_TICKS_PER_SEC: u64 = 100;

/// Counters a monitored component exposes
pub trait MetricsSource: Send + Sync {
    fn open_shard_count(&self) -> u64;
    fn queries_served(&self) -> u64;
    fn uptime_secs(&self) -> u64;
}

/// Process statistics read from `/proc/self`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessStats {
    pub resident_bytes: Option<u64>,
    pub virtual_bytes: Option<u64>,
    pub cpu_ticks: Option<u64>,
}

impl ProcessStats {
    /// Sample the current process; missing sources yield `None` fields
    pub fn sample() -> Self {
        let mut stats = std::fs::read_to_string("/proc/self/status")
            .map(|s| parse_status(&s))
            .unwrap_or_default();
        stats.cpu_ticks = std::fs::read_to_string("/proc/self/stat")
            .ok()
            .and_then(|s| parse_cpu_ticks(&s));
        stats
    }
}

/// Parse `VmRSS` and `VmSize` out of `/proc/<pid>/status`
fn parse_status(content: &str) -> ProcessStats {
    let mut stats = ProcessStats::default();
    for line in content.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let number = value
            .split_whitespace()
            .next()
            .and_then(|n| n.parse::<u64>().ok());
        match key {
            "VmRSS" => stats.resident_bytes = number.map(|kb| kb * 1024),
            "VmSize" => stats.virtual_bytes = number.map(|kb| kb * 1024),
            _ => {}
        }
    }
    stats
}

/// utime + stime from `/proc/<pid>/stat`
fn parse_cpu_ticks(content: &str) -> Option<u64> {
    // The command name may contain spaces; fields restart after the last ')'
    let rest = &content[content.rfind(')')? + 1..];
    let fields: Vec<&str> = rest.split_whitespace().collect();
    // fields[0] is the state (field 3); utime and stime are fields 14 and 15
    let utime: u64 = fields.get(11)?.parse().ok()?;
    let stime: u64 = fields.get(12)?.parse().ok()?;
    Some(utime + stime)
}

/// Build the record published for `node`
pub fn collect(node: &NodeId, source: &dyn MetricsSource) -> MetricsRecord {
    let process = ProcessStats::sample();
    MetricsRecord::new(
        node.clone(),
        MetricValues {
            resident_bytes: process.resident_bytes,
            virtual_bytes: process.virtual_bytes,
            cpu_time_ms: process.cpu_ticks.map(|t| t * 1000 / CLOCK_TICKS_PER_SEC),
            open_shards: Some(source.open_shard_count()),
            queries_served: Some(source.queries_served()),
            uptime_secs: Some(source.uptime_secs()),
        },
    )
}

/// Publish metrics for `node` every `interval` until the task is aborted
pub fn start_monitor(
    store: Arc<dyn ClusterStore>,
    layout: ClusterLayout,
    node: NodeId,
    interval: Duration,
    source: Arc<dyn MetricsSource>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let path = layout.node_metrics(&node);
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut failing = false;
        loop {
            ticker.tick().await;
            let record = collect(&node, source.as_ref());
            match store
                .upsert_record(&path, &record, CreateMode::Ephemeral)
                .await
            {
                Ok(()) => {
                    if failing {
                        debug!(node = %node, "Metrics publishing recovered");
                    }
                    failing = false;
                }
                Err(e) => {
                    // Log once per outage
                    if !failing {
                        warn!(node = %node, error = %e, "Failed to publish node metrics");
                    }
                    failing = true;
                }
            }
        }
    })
}
