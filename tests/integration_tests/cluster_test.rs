//! Deployment integration tests
//!
//! Tests the index lifecycle across a running cluster:
//! 1. Deployment spreads shards over the least loaded nodes
//! 2. Replication places copies on distinct nodes
//! 3. Removal undeploys and closes every shard
//! 4. An index can be added again after removal
//! 5. Admin listings and the structure dump

use std::time::Duration;

use shoal::admin::render_structure;
use shoal::error::Error;
use shoal::models::{IndexState, NodeStatus, Query};
use shoal::store::StoreExt;

use super::fixtures::{eventually, TestCluster, DOCS_SHARDS, LOGS_SHARDS};

// ============================================================================
// Deployment
// ============================================================================

#[tokio::test]
async fn test_add_index_spreads_shards_over_nodes() {
    let cluster = TestCluster::start(2).await;
    cluster.deploy("docs", DOCS_SHARDS, 1).await;

    for node in &cluster.nodes {
        let open = node.node.open_shards().await;
        assert_eq!(open.len(), 1, "node {} should serve one shard", node.id);
        assert_eq!(open[0].doc_count, 3);
    }
    assert_eq!(cluster.library.open_handles(), 2);

    let state = cluster.admin.index_state("docs").await.unwrap();
    assert_eq!(state, IndexState::Deployed);

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_replicated_index_opens_every_copy() {
    let cluster = TestCluster::start(2).await;
    cluster.deploy("docs", DOCS_SHARDS, 2).await;

    // Copies are only placed once per node; the second copy may still be
    // loading when the first serving copy marks the index deployed
    let library = cluster.library.clone();
    assert!(
        eventually(Duration::from_secs(5), || {
            let library = library.clone();
            async move { library.open_handles() == 4 }
        })
        .await
    );
    for node in &cluster.nodes {
        assert_eq!(node.node.open_shards().await.len(), 2);
    }

    // Each shard is still counted once
    let client = cluster.client().await;
    let count = client.count(&Query::new("rust", ["docs"])).await.unwrap();
    assert_eq!(count, 3);

    client.close().await.unwrap();
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_replication_capped_by_live_nodes() {
    let cluster = TestCluster::start(1).await;
    cluster.deploy("logs", LOGS_SHARDS, 3).await;

    assert_eq!(cluster.library.open_handles(), 1);
    let summary = cluster.admin.list_indexes().await.unwrap();
    assert_eq!(summary[0].replication, 3);
    assert!(summary[0].deployed);

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_add_existing_index_rejected() {
    let cluster = TestCluster::start(1).await;
    cluster.deploy("logs", LOGS_SHARDS, 1).await;

    let location = cluster.write_index("logs", LOGS_SHARDS);
    let err = cluster
        .admin
        .add_index("logs", &location, "standard", None)
        .await
        .unwrap_err();
    assert!(err.is_already_exists());

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_add_index_without_nodes_times_out() {
    let cluster = TestCluster::start(0).await;
    let location = cluster.write_index("docs", DOCS_SHARDS);

    cluster
        .admin
        .register_index("docs", &location, "standard", None)
        .await
        .unwrap();
    let err = cluster
        .admin
        .wait_until_deployed("docs", Duration::from_millis(300))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::DeployTimeout { .. }));
    assert_eq!(
        cluster.admin.index_state("docs").await.unwrap(),
        IndexState::ShardsAssigning
    );

    cluster.shutdown().await;
}

// ============================================================================
// Removal
// ============================================================================

#[tokio::test]
async fn test_remove_index_undeploys_shards() {
    let cluster = TestCluster::start(2).await;
    cluster.deploy("docs", DOCS_SHARDS, 1).await;
    cluster.deploy("logs", LOGS_SHARDS, 1).await;
    assert_eq!(cluster.library.open_handles(), 3);

    cluster.admin.remove_index("docs").await.unwrap();

    let library = cluster.library.clone();
    assert!(
        eventually(Duration::from_secs(5), || {
            let library = library.clone();
            async move { library.open_handles() == 1 }
        })
        .await
    );

    let session = cluster.store.connect();
    for node in &cluster.nodes {
        let assigned = session
            .children_or_empty(&cluster.layout.node_assignments(&node.id))
            .await
            .unwrap();
        assert!(assigned.iter().all(|s| !s.starts_with("docs#")), "{assigned:?}");
    }
    assert_eq!(
        cluster.admin.index_state("docs").await.unwrap(),
        IndexState::Unregistered
    );

    let client = cluster.client().await;
    assert_eq!(client.count(&Query::new("rust", ["docs"])).await.unwrap(), 0);
    assert_eq!(client.count(&Query::new("rust", ["logs"])).await.unwrap(), 1);

    client.close().await.unwrap();
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_remove_unknown_index() {
    let cluster = TestCluster::start(0).await;
    let err = cluster.admin.remove_index("missing").await.unwrap_err();
    assert!(err.is_not_found());
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_index_can_be_added_again_after_removal() {
    let cluster = TestCluster::start(2).await;
    cluster.deploy("docs", DOCS_SHARDS, 1).await;
    cluster.admin.remove_index("docs").await.unwrap();

    let library = cluster.library.clone();
    assert!(
        eventually(Duration::from_secs(5), || {
            let library = library.clone();
            async move { library.open_handles() == 0 }
        })
        .await
    );

    cluster.deploy("docs", DOCS_SHARDS, 1).await;
    assert_eq!(cluster.library.open_handles(), 2);

    let client = cluster.client().await;
    let view_ready = client
        .wait_for_view(|view| view.is_served("docs"), Duration::from_secs(5))
        .await;
    assert!(view_ready);
    assert_eq!(client.count(&Query::new("rust", ["docs"])).await.unwrap(), 3);

    client.close().await.unwrap();
    cluster.shutdown().await;
}

// ============================================================================
// Inspection
// ============================================================================

#[tokio::test]
async fn test_list_nodes_reports_health() {
    let cluster = TestCluster::start(2).await;
    cluster.deploy("docs", DOCS_SHARDS, 1).await;

    let admin = &cluster.admin;
    assert!(
        eventually(Duration::from_secs(5), || async move {
            admin
                .list_nodes()
                .await
                .map(|nodes| nodes.iter().all(|n| n.open_shards == 1))
                .unwrap_or(false)
        })
        .await
    );

    let nodes = cluster.admin.list_nodes().await.unwrap();
    assert_eq!(nodes.len(), 2);
    assert!(nodes.iter().all(|n| n.healthy && n.status == NodeStatus::Serving));

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_show_structure_contains_cluster_tree() {
    let cluster = TestCluster::start(1).await;
    cluster.deploy("logs", LOGS_SHARDS, 1).await;

    let entries = cluster.admin.show_structure().await.unwrap();
    let rendered = render_structure(&entries);

    assert!(rendered.contains("logs"));
    assert!(rendered.contains("logs#s0"));
    assert!(rendered.contains("node-0:20000"));
    assert!(entries.iter().any(|e| e.path == cluster.layout.master()));

    cluster.shutdown().await;
}
