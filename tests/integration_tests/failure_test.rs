//! Failure scenario integration tests
//!
//! Tests how the cluster degrades and recovers:
//! 1. Unreachable nodes are left out of results
//! 2. A crashed node's shards move to the survivors
//! 3. An expired node session is rebuilt
//! 4. A standby master takes over
//! 5. Node error bodies over HTTP

use std::sync::Arc;
use std::time::Duration;

use shoal::error::Error;
use shoal::index::FsStorage;
use shoal::master::{wait_for_leadership, Master};
use shoal::models::{NodeId, Query, ShardName};
use shoal::node::rpc::{HttpNodeClient, NodeRpc};
use shoal::store::ClusterStore;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use super::fixtures::{eventually, TestCluster, DOCS_SHARDS, LOGS_SHARDS};

// ============================================================================
// Partial Results
// ============================================================================

#[tokio::test]
async fn test_unreachable_node_excluded_from_results() {
    let cluster = TestCluster::start(2).await;
    cluster.deploy("docs", DOCS_SHARDS, 1).await;
    let client = cluster.client().await;
    assert_eq!(client.count(&Query::new("rust", ["docs"])).await.unwrap(), 3);

    // node-1 serves s1, which holds one "rust" document
    cluster.connector.unregister(&NodeId::from("node-1:20000"));

    let count = client.count(&Query::new("rust", ["docs"])).await.unwrap();
    assert_eq!(count, 2);
    let hits = client.search(&Query::new("rust", ["docs"])).await.unwrap();
    assert_eq!(hits.total, 2);
    assert!(hits
        .hits
        .iter()
        .all(|h| h.shard == ShardName::new("docs", "s0")));

    client.close().await.unwrap();
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_details_on_unreachable_node_fails() {
    let cluster = TestCluster::start(2).await;
    cluster.deploy("docs", DOCS_SHARDS, 1).await;
    let client = cluster.client().await;

    let hits = client.search(&Query::new("shards", ["docs"])).await.unwrap();
    assert_eq!(hits.len(), 1);
    cluster.connector.unregister(&hits.hits[0].node);

    let err = client.details(&hits.hits[0]).await.unwrap_err();
    assert!(matches!(err, Error::NodeUnreachable { .. }));

    client.close().await.unwrap();
    cluster.shutdown().await;
}

// ============================================================================
// Node Loss
// ============================================================================

#[tokio::test]
async fn test_crashed_node_shards_reassigned() {
    let cluster = TestCluster::start(2).await;
    cluster.deploy("docs", DOCS_SHARDS, 1).await;
    let client = cluster.client().await;

    // Crash: tasks stop and the session ends with its ephemeral entries
    let crashed = cluster.node("node-0:20000");
    crashed.node.abort();
    crashed.session.close().await.unwrap();
    cluster.connector.unregister(&crashed.id);

    let survivor = Arc::clone(&cluster.node("node-1:20000").node);
    assert!(
        eventually(Duration::from_secs(5), || {
            let survivor = Arc::clone(&survivor);
            async move { survivor.open_shards().await.len() == 2 }
        })
        .await
    );

    let view_ready = client
        .wait_for_view(
            |view| {
                view.is_served("docs")
                    && !view.nodes.contains(&NodeId::from("node-0:20000"))
            },
            Duration::from_secs(5),
        )
        .await;
    assert!(view_ready);
    assert_eq!(client.count(&Query::new("rust", ["docs"])).await.unwrap(), 3);

    let nodes = cluster.admin.list_nodes().await.unwrap();
    assert_eq!(nodes.len(), 1);

    client.close().await.unwrap();
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_new_node_takes_shards_of_next_index() {
    let mut cluster = TestCluster::start(1).await;
    cluster.deploy("docs", DOCS_SHARDS, 1).await;
    let late = cluster.start_node("node-9:20000").await;

    // Least loaded placement sends the new shard to the empty node
    cluster.deploy("logs", LOGS_SHARDS, 1).await;
    let open = late.open_shards().await;
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].name, ShardName::new("logs", "s0"));

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_expired_session_rejoins() {
    let cluster = TestCluster::start(1).await;
    cluster.deploy("logs", LOGS_SHARDS, 1).await;
    let client = cluster.client().await;

    let node = cluster.node("node-0:20000");
    let old_session = node.session.session_id();
    node.session.expire();
    assert_ne!(node.session.session_id(), old_session);

    let view_ready = client
        .wait_for_view(
            |view| view.is_served("logs") && view.nodes.contains(&NodeId::from("node-0:20000")),
            Duration::from_secs(5),
        )
        .await;
    assert!(view_ready);

    let admin = &cluster.admin;
    assert!(
        eventually(Duration::from_secs(5), || async move {
            admin.list_nodes().await.map(|n| n.len() == 1).unwrap_or(false)
        })
        .await
    );

    // The master may have released and re-placed the shard meanwhile
    let query_client = Arc::clone(&client);
    assert!(
        eventually(Duration::from_secs(5), || {
            let client = Arc::clone(&query_client);
            async move {
                client
                    .count(&Query::new("rust", ["logs"]))
                    .await
                    .map(|c| c == 1)
                    .unwrap_or(false)
            }
        })
        .await
    );

    client.close().await.unwrap();
    cluster.shutdown().await;
}

// ============================================================================
// Master Failover
// ============================================================================

#[tokio::test]
async fn test_standby_master_takes_over() {
    let mut cluster = TestCluster::start(1).await;
    let standby = Master::new(
        cluster.store.connect(),
        Arc::new(FsStorage::new()),
        &cluster.config,
    );
    standby.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!standby.is_leader());

    cluster.master.shutdown().await.unwrap();
    assert!(wait_for_leadership(&standby, Duration::from_secs(5)).await);

    // The new leader keeps deploying
    cluster.master = standby;
    cluster.deploy("logs", LOGS_SHARDS, 1).await;
    assert_eq!(cluster.library.open_handles(), 1);

    cluster.shutdown().await;
}

// ============================================================================
// HTTP Node Errors
// ============================================================================

#[tokio::test]
async fn test_http_node_client_decodes_answers_and_errors() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/count"))
        .and(body_partial_json(serde_json::json!({ "query": { "text": "rust" } })))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({ "count": 7 })))
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/v1/search"))
        .respond_with(ResponseTemplate::new(409).set_body_json(serde_json::json!({
            "success": false,
            "error": "shard docs#s3 is not served",
            "kind": "shard_unavailable",
            "target": "docs#s3"
        })))
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/v1/details"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .mount(&server)
        .await;

    let node = NodeId::from("remote:1");
    let client = HttpNodeClient::new(node.clone(), server.uri(), reqwest::Client::new());
    let query = Query::new("rust", ["docs"]);

    assert_eq!(client.count(&query, &[]).await.unwrap(), 7);

    match client.search(&query, &[], 10).await.unwrap_err() {
        Error::ShardUnavailable { node: failed, target } => {
            assert_eq!(failed, "remote:1");
            assert_eq!(target, "docs#s3");
        }
        other => panic!("unexpected error: {other}"),
    }

    let err = client
        .details(&ShardName::new("docs", "s0"), 1)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("500"));
    assert_eq!(client.node_id(), &node);
}
