//! Distributed query integration tests
//!
//! Tests the client against deployed indexes:
//! 1. Counts summed over all shards
//! 2. Search merging by score with a global limit
//! 3. Details looked up on the node that produced the hit
//! 4. Multi-index queries and unknown indexes
//! 5. Merge ordering properties

use proptest::prelude::*;
use std::collections::BTreeSet;

use shoal::error::Error;
use shoal::models::{Hit, Hits, NodeId, Query, ShardName};

use super::fixtures::{TestCluster, DOCS_SHARDS, LOGS_SHARDS};

// ============================================================================
// Count and Search
// ============================================================================

#[tokio::test]
async fn test_count_sums_every_shard() {
    let cluster = TestCluster::start(2).await;
    cluster.deploy("docs", DOCS_SHARDS, 1).await;
    let client = cluster.client().await;

    assert_eq!(client.count(&Query::new("rust", ["docs"])).await.unwrap(), 3);
    assert_eq!(client.count(&Query::new("cluster", ["docs"])).await.unwrap(), 2);
    assert_eq!(
        client.count(&Query::new("rust search", ["docs"])).await.unwrap(),
        4
    );
    assert_eq!(client.count(&Query::new("absent", ["docs"])).await.unwrap(), 0);

    client.close().await.unwrap();
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_search_merges_by_score() {
    let cluster = TestCluster::start(2).await;
    cluster.deploy("docs", DOCS_SHARDS, 1).await;
    let client = cluster.client().await;

    let hits = client
        .search(&Query::new("rust search", ["docs"]).with_limit(10))
        .await
        .unwrap();
    assert_eq!(hits.total, 4);
    assert_eq!(hits.len(), 4);
    assert!(hits
        .hits
        .windows(2)
        .all(|pair| pair[0].score >= pair[1].score));

    // Both shards contributed, each answered by the node serving it
    let shards: BTreeSet<&ShardName> = hits.hits.iter().map(|h| &h.shard).collect();
    assert_eq!(shards.len(), 2);
    let nodes: BTreeSet<&NodeId> = hits.hits.iter().map(|h| &h.node).collect();
    assert_eq!(nodes.len(), 2);

    // "rust search engine" matches both terms and ranks first
    let best = client.details(&hits.hits[0]).await.unwrap();
    assert_eq!(best.get("title").map(String::as_str), Some("rust search engine"));

    client.close().await.unwrap();
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_search_limit_keeps_total() {
    let cluster = TestCluster::start(2).await;
    cluster.deploy("docs", DOCS_SHARDS, 1).await;
    let client = cluster.client().await;

    let hits = client
        .search(&Query::new("rust search", ["docs"]).with_limit(2))
        .await
        .unwrap();
    assert_eq!(hits.len(), 2);
    assert_eq!(hits.total, 4);

    let none = client
        .search(&Query::new("rust", ["docs"]).with_limit(0))
        .await
        .unwrap();
    assert!(none.is_empty());
    assert_eq!(none.total, 3);

    client.close().await.unwrap();
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_query_spanning_indexes() {
    let cluster = TestCluster::start(2).await;
    cluster.deploy("docs", DOCS_SHARDS, 1).await;
    cluster.deploy("logs", LOGS_SHARDS, 1).await;
    let client = cluster.client().await;

    assert_eq!(
        client.count(&Query::new("rust", ["docs", "logs"])).await.unwrap(),
        4
    );
    assert_eq!(
        client.count(&Query::new("master", ["docs", "logs"])).await.unwrap(),
        2
    );

    let hits = client
        .search(&Query::new("master", ["logs"]))
        .await
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits.hits[0].shard, ShardName::new("logs", "s0"));

    client.close().await.unwrap();
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_unknown_index_yields_nothing() {
    let cluster = TestCluster::start(1).await;
    cluster.deploy("logs", LOGS_SHARDS, 1).await;
    let client = cluster.client().await;

    assert_eq!(client.count(&Query::new("rust", ["missing"])).await.unwrap(), 0);
    let hits = client.search(&Query::new("rust", ["missing"])).await.unwrap();
    assert!(hits.is_empty());
    assert_eq!(hits.total, 0);

    client.close().await.unwrap();
    cluster.shutdown().await;
}

// ============================================================================
// Details
// ============================================================================

#[tokio::test]
async fn test_details_of_every_hit() {
    let cluster = TestCluster::start(2).await;
    cluster.deploy("docs", DOCS_SHARDS, 1).await;
    let client = cluster.client().await;

    let hits = client.search(&Query::new("cluster", ["docs"])).await.unwrap();
    assert_eq!(hits.len(), 2);
    let mut titles = Vec::new();
    for hit in &hits.hits {
        let fields = client.details(hit).await.unwrap();
        titles.push(fields["title"].clone());
    }
    titles.sort();
    assert_eq!(titles, vec!["distributed rust cluster", "search cluster master"]);

    client.close().await.unwrap();
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_details_of_stale_hit() {
    let cluster = TestCluster::start(1).await;
    cluster.deploy("logs", LOGS_SHARDS, 1).await;
    let client = cluster.client().await;

    let hits = client.search(&Query::new("master", ["logs"])).await.unwrap();
    let mut stale = hits.hits[0].clone();
    stale.doc_id = 999;
    let err = client.details(&stale).await.unwrap_err();
    assert!(matches!(err, Error::StaleHit { doc_id: 999, .. }));

    client.close().await.unwrap();
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_queries_per_minute_counts_requests() {
    let cluster = TestCluster::start(1).await;
    cluster.deploy("logs", LOGS_SHARDS, 1).await;
    let client = cluster.client().await;

    for _ in 0..3 {
        client.count(&Query::new("rust", ["logs"])).await.unwrap();
    }
    client.search(&Query::new("rust", ["logs"])).await.unwrap();
    assert_eq!(client.queries_per_minute(), 4.0);

    client.close().await.unwrap();
    cluster.shutdown().await;
}

// ============================================================================
// Merge Properties
// ============================================================================

fn arb_part() -> impl Strategy<Value = Hits> {
    (
        prop::collection::vec((0u8..3, 0u8..3, 0u32..50, 0u16..1000), 0..8),
        0u64..20,
    )
        .prop_map(|(raw, extra)| {
            let hits: Vec<Hit> = raw
                .into_iter()
                .map(|(node, shard, doc_id, score)| Hit {
                    node: NodeId::new(format!("n{node}:1")),
                    shard: ShardName::new("docs", format!("s{shard}")),
                    doc_id,
                    score: f32::from(score) / 100.0,
                })
                .collect();
            Hits {
                total: hits.len() as u64 + extra,
                hits,
            }
        })
}

proptest! {
    #[test]
    fn prop_merge_is_ranked_and_bounded(
        parts in prop::collection::vec(arb_part(), 0..5),
        limit in 0usize..20,
    ) {
        let total: u64 = parts.iter().map(|p| p.total).sum();
        let available: usize = parts.iter().map(Hits::len).sum();

        let merged = Hits::merge(parts.clone(), limit);

        prop_assert_eq!(merged.total, total);
        prop_assert_eq!(merged.len(), available.min(limit));
        prop_assert!(merged
            .hits
            .windows(2)
            .all(|pair| pair[0].rank_cmp(&pair[1]) != std::cmp::Ordering::Greater));

        // Order of the parts does not matter
        let mut reversed = parts;
        reversed.reverse();
        prop_assert_eq!(Hits::merge(reversed, limit), merged);
    }
}
