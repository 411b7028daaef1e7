//! Prometheus metrics for shoal master, nodes and clients
//!
//! This module provides metrics tracking for:
//! - Master: live nodes, deployed indexes, shard assignments, reconcile passes
//! - Node: open shards, shard loads, queries served
//! - Client: queries, fan-out failures, query latency
//!
//! # Usage
//!
//! Call `init_metrics()` at application startup to register all metrics.
//! If initialization fails, metrics operations become no-ops.

use prometheus::{
    register_counter, register_counter_vec, register_gauge, register_histogram_vec, Counter,
    CounterVec, Encoder, Gauge, HistogramVec, TextEncoder,
};
use std::sync::OnceLock;

// ============================================================================
// Metrics Storage
// ============================================================================

/// Container for all master metrics
struct MasterMetrics {
    live_nodes: Gauge,
    deployed_indexes: Gauge,
    assignments: CounterVec,
    reconcile_runs: Counter,
    reconcile_errors: Counter,
}

/// Container for all node metrics
struct NodeMetrics {
    open_shards: Gauge,
    shard_loads: CounterVec,
    queries_served: CounterVec,
}

/// Container for all client metrics
struct ClientMetrics {
    queries: CounterVec,
    fanout_failures: CounterVec,
    query_duration: HistogramVec,
}

/// Global storage for master metrics
static MASTER_METRICS: OnceLock<MasterMetrics> = OnceLock::new();

/// Global storage for node metrics
static NODE_METRICS: OnceLock<NodeMetrics> = OnceLock::new();

/// Global storage for client metrics
static CLIENT_METRICS: OnceLock<ClientMetrics> = OnceLock::new();

/// Flag to track if initialization was attempted
static METRICS_INIT_ATTEMPTED: OnceLock<bool> = OnceLock::new();

// ============================================================================
// Initialization
// ============================================================================

/// Initialize all Prometheus metrics
///
/// This function should be called once at application startup.
/// If metric registration fails, errors are logged and subsequent
/// metric operations become no-ops.
///
/// # Example
///
/// ```ignore
/// if let Err(e) = shoal::metrics::init_metrics() {
///     eprintln!("Warning: Metrics initialization failed: {}", e);
/// }
/// ```
pub fn init_metrics() -> Result<(), Box<dyn std::error::Error>> {
    // Prevent double initialization
    if METRICS_INIT_ATTEMPTED.get().is_some() {
        return Ok(());
    }
    METRICS_INIT_ATTEMPTED.set(true).ok();

    let master = MasterMetrics {
        live_nodes: register_gauge!("shoal_master_live_nodes", "Number of live nodes")?,
        deployed_indexes: register_gauge!(
            "shoal_master_deployed_indexes",
            "Number of indexes with every shard served"
        )?,
        assignments: register_counter_vec!(
            "shoal_master_assignments_total",
            "Shard assignments written and removed by the master",
            &["action"]
        )?,
        reconcile_runs: register_counter!(
            "shoal_master_reconcile_runs_total",
            "Total reconcile passes"
        )?,
        reconcile_errors: register_counter!(
            "shoal_master_reconcile_errors_total",
            "Total reconcile passes that failed"
        )?,
    };

    let node = NodeMetrics {
        open_shards: register_gauge!("shoal_node_open_shards", "Number of shards open on this node")?,
        shard_loads: register_counter_vec!(
            "shoal_node_shard_loads_total",
            "Shard load attempts by outcome",
            &["outcome"]
        )?,
        queries_served: register_counter_vec!(
            "shoal_node_queries_served_total",
            "Queries answered by this node",
            &["operation"]
        )?,
    };

    let client = ClientMetrics {
        queries: register_counter_vec!(
            "shoal_client_queries_total",
            "Queries issued through the client",
            &["operation"]
        )?,
        fanout_failures: register_counter_vec!(
            "shoal_client_fanout_failures_total",
            "Nodes excluded from a fan-out",
            &["operation", "reason"]
        )?,
        query_duration: register_histogram_vec!(
            "shoal_client_query_duration_seconds",
            "End-to-end query duration in seconds",
            &["operation"],
            vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
        )?,
    };

    MASTER_METRICS.set(master).map_err(|_| "Master metrics already initialized")?;
    NODE_METRICS.set(node).map_err(|_| "Node metrics already initialized")?;
    CLIENT_METRICS.set(client).map_err(|_| "Client metrics already initialized")?;

    tracing::info!("Prometheus metrics initialized successfully");
    Ok(())
}

/// Check if metrics have been initialized
pub fn metrics_initialized() -> bool {
    MASTER_METRICS.get().is_some() && NODE_METRICS.get().is_some() && CLIENT_METRICS.get().is_some()
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Encode all metrics to Prometheus text format
pub fn encode_metrics() -> Result<String, Box<dyn std::error::Error>> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

/// Update the master's view of the cluster
pub fn update_cluster_metrics(live_nodes: usize, deployed_indexes: usize) {
    if let Some(m) = MASTER_METRICS.get() {
        m.live_nodes.set(live_nodes as f64);
        m.deployed_indexes.set(deployed_indexes as f64);
    }
}

/// Record assignments written ("assign") or removed ("unassign")
pub fn record_assignments(action: &str, count: usize) {
    if count == 0 {
        return;
    }
    if let Some(m) = MASTER_METRICS.get() {
        m.assignments
            .with_label_values(&[action])
            .inc_by(count as f64);
    }
}

/// Record a reconcile pass
pub fn record_reconcile(failed: bool) {
    let Some(m) = MASTER_METRICS.get() else {
        return;
    };
    m.reconcile_runs.inc();
    if failed {
        m.reconcile_errors.inc();
    }
}

/// Update the number of shards open on this node
pub fn update_open_shards(count: usize) {
    if let Some(m) = NODE_METRICS.get() {
        m.open_shards.set(count as f64);
    }
}

/// Record a shard load ("opened", "failed")
pub fn record_shard_load(outcome: &str) {
    if let Some(m) = NODE_METRICS.get() {
        m.shard_loads.with_label_values(&[outcome]).inc();
    }
}

/// Record a query answered by this node
pub fn record_query_served(operation: &str) {
    if let Some(m) = NODE_METRICS.get() {
        m.queries_served.with_label_values(&[operation]).inc();
    }
}

/// Record a client query and its duration
pub fn record_client_query(operation: &str, duration_secs: f64) {
    let Some(m) = CLIENT_METRICS.get() else {
        return;
    };
    m.queries.with_label_values(&[operation]).inc();
    m.query_duration
        .with_label_values(&[operation])
        .observe(duration_secs);
}

/// Record a node excluded from a fan-out ("timeout", "error")
pub fn record_fanout_failure(operation: &str, reason: &str) {
    if let Some(m) = CLIENT_METRICS.get() {
        m.fanout_failures
            .with_label_values(&[operation, reason])
            .inc();
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn ensure_metrics_initialized() {
        let _ = init_metrics();
    }

    #[test]
    fn test_init_metrics() {
        assert!(init_metrics().is_ok());
        // Second call is a no-op
        assert!(init_metrics().is_ok());
    }

    #[test]
    fn test_metrics_initialized() {
        ensure_metrics_initialized();
        assert!(metrics_initialized());
    }

    #[test]
    fn test_encode_metrics() {
        ensure_metrics_initialized();
        record_reconcile(false);
        let text = encode_metrics().unwrap();
        assert!(text.contains("shoal_master_reconcile_runs_total"));
    }

    #[test]
    fn test_recording_does_not_panic() {
        ensure_metrics_initialized();
        update_cluster_metrics(3, 1);
        record_assignments("assign", 4);
        record_assignments("unassign", 0);
        update_open_shards(2);
        record_shard_load("opened");
        record_query_served("search");
        record_client_query("count", 0.01);
        record_fanout_failure("search", "timeout");
    }
}
