//! Integration tests for the complete Cidgraph pipeline
//!
//! These tests verify end-to-end functionality across crates:
//! - Graph model → canonical blocks → CID → retrieve
//! - Query text → IR plan → budgeted execution
//! - Vector store + graph expansion → fused ranking
//! - Transactions → engine → driver
//!
//! Run with: cargo test --test integration_tests

use approx::assert_relative_eq;
use async_trait::async_trait;
use cidgraph_dsl::compile_query;
use cidgraph_engine::{
    driver, execute_plan, track, BudgetDimension, CollaboratorError, Driver, EngineResponse,
    ExecutionBudgets, HybridSearchEngine, HybridSearchRequest, QueryFailure, ResultValue,
    UnifiedQueryEngine, VectorStore,
};
use cidgraph_graph::{props, snapshot_cid, GraphError, KnowledgeGraph, NodeId, Properties};
use cidgraph_storage::{Storage, StorageConfig, StorageError};
use std::collections::BTreeMap;
use std::sync::Arc;
use tempfile::tempdir;

fn chain() -> KnowledgeGraph {
    let mut g = KnowledgeGraph::new();
    let a = g.create_node(["Person"], props([("name", "A")])).unwrap().id;
    let b = g.create_node(["Person"], props([("name", "B")])).unwrap().id;
    let c = g.create_node(["Person"], props([("name", "C")])).unwrap().id;
    g.create_relationship("KNOWS", a, b, Properties::new()).unwrap();
    g.create_relationship("KNOWS", b, c, Properties::new()).unwrap();
    g
}

fn name(value: &ResultValue) -> String {
    match value {
        ResultValue::Node(n) => n.property("name").unwrap().as_str().unwrap().to_string(),
        ResultValue::Value(v) => v.as_str().unwrap_or_default().to_string(),
        ResultValue::Relationship(r) => r.rel_type.clone(),
    }
}

// ============================================================================
// Graph → Store → Retrieve
// ============================================================================

#[tokio::test]
async fn test_store_then_retrieve_alice_and_bob() {
    let storage = Storage::in_memory(&StorageConfig::default());

    let mut graph = KnowledgeGraph::new();
    let a = graph.create_node(["Person"], props([("name", "Alice")])).unwrap();
    let b = graph.create_node(["Person"], props([("name", "Bob")])).unwrap();
    graph
        .create_relationship("KNOWS", a.id, b.id, Properties::new())
        .unwrap();

    let cid1 = storage.snapshots().store(&graph).await.unwrap();
    assert_eq!(cid1, snapshot_cid(&graph).unwrap());

    let retrieved = storage.snapshots().retrieve(&cid1).await.unwrap();
    let people = retrieved.find_nodes(&["Person"], &Properties::new(), None);
    let ids: Vec<NodeId> = people.iter().map(|n| n.id).collect();
    assert_eq!(ids, vec![a.id, b.id]);
    assert_eq!(*people[0], a);
    assert_eq!(*people[1], b);
}

#[tokio::test]
async fn test_identical_graphs_share_a_cid_and_a_file_store() {
    let dir = tempdir().unwrap();
    let config = StorageConfig {
        data_dir: Some(dir.path().to_path_buf()),
        ..StorageConfig::default()
    };
    let storage = Storage::open(&config).await.unwrap();

    let first = storage.snapshots().store(&chain()).await.unwrap();
    let second = storage.snapshots().store(&chain()).await.unwrap();
    assert_eq!(first, second);

    let mut changed = chain();
    changed
        .create_relationship("KNOWS", NodeId::new(2), NodeId::new(0), Properties::new())
        .unwrap();
    let third = storage.snapshots().store(&changed).await.unwrap();
    assert_ne!(first, third);
}

// ============================================================================
// Query text → IR → Budgeted execution
// ============================================================================

#[test]
fn test_compile_and_execute_over_a_snapshot() {
    let graph = chain();
    let plan = compile_query(
        "MATCH (a:Person)-[:KNOWS]->(b:Person) WHERE b.name <> 'B' RETURN a.name AS who LIMIT 5",
    )
    .unwrap();
    let outcome = execute_plan(&graph, &plan, &Properties::new(), &track(ExecutionBudgets::unbounded()));
    assert_eq!(outcome.columns, vec!["who"]);
    let names: Vec<String> = outcome.rows.iter().map(|r| name(&r[0])).collect();
    assert_eq!(names, vec!["B"]);
}

#[tokio::test]
async fn test_max_nodes_one_halts_one_node_past_the_scan() {
    let engine = UnifiedQueryEngine::in_memory().unwrap();
    let mut tx = engine.transactions().begin().await.unwrap();
    let a = tx.create_node(["Person"], props([("name", "A")]));
    let b = tx.create_node(["Person"], props([("name", "B")]));
    let c = tx.create_node(["Person"], props([("name", "C")]));
    tx.create_relationship("KNOWS", a, b, Properties::new());
    tx.create_relationship("KNOWS", b, c, Properties::new());
    tx.commit().await.unwrap();

    let result = engine
        .execute_cypher(
            "MATCH (n)-[]->(m) RETURN n, m",
            &Properties::new(),
            ExecutionBudgets::unbounded().with_max_nodes(1),
        )
        .await
        .unwrap();

    assert!(!result.success);
    let exceeded = result.failure.as_ref().and_then(QueryFailure::budget).unwrap();
    assert_eq!(exceeded.dimension, BudgetDimension::Nodes);
    assert_eq!(exceeded.counters.nodes, 2);
    assert_eq!(result.stats.counters.edges, 1);
    assert!(result.rows.is_empty());
}

#[tokio::test]
async fn test_every_dimension_overshoots_by_at_most_one() {
    let engine = UnifiedQueryEngine::in_memory().unwrap();
    let mut tx = engine.transactions().begin().await.unwrap();
    let ids: Vec<NodeId> = (0..6)
        .map(|i| tx.create_node(["N"], props([("i", i as i64)])))
        .collect();
    for pair in ids.windows(2) {
        tx.create_relationship("NEXT", pair[0], pair[1], Properties::new());
    }
    tx.commit().await.unwrap();

    let cases = [
        (BudgetDimension::Nodes, ExecutionBudgets::unbounded().with_max_nodes(3)),
        (BudgetDimension::Edges, ExecutionBudgets::unbounded().with_max_edges(2)),
        (BudgetDimension::Hops, ExecutionBudgets::unbounded().with_max_hops(2)),
    ];
    for (dimension, budgets) in cases {
        let result = engine
            .execute_cypher(
                "MATCH (a)-->(b)-->(c)-->(d) RETURN a, d",
                &Properties::new(),
                budgets,
            )
            .await
            .unwrap();
        let exceeded = result.failure.as_ref().and_then(QueryFailure::budget).unwrap();
        assert_eq!(exceeded.dimension, dimension);
        let limit = budgets.limit(dimension).unwrap();
        assert_eq!(exceeded.counters.get(dimension), limit + 1);
    }
}

// ============================================================================
// Hybrid search ranking
// ============================================================================

/// Vector store with canned similarity scores.
struct Canned(Vec<(NodeId, f32)>);

#[async_trait]
impl VectorStore for Canned {
    async fn embed(&self, _: &str) -> Result<Vec<f32>, CollaboratorError> {
        Ok(vec![1.0])
    }

    async fn similarity_search(&self, _: &[f32], k: usize) -> Result<Vec<(NodeId, f32)>, CollaboratorError> {
        Ok(self.0.iter().copied().take(k).collect())
    }
}

fn canned(scores: Vec<(NodeId, f32)>) -> Arc<dyn VectorStore> {
    Arc::new(Canned(scores))
}

fn canned_scores() -> Vec<(NodeId, f32)> {
    vec![
        (NodeId::new(2), 0.9),
        (NodeId::new(0), 0.6),
        (NodeId::new(1), 0.2),
    ]
}

#[tokio::test]
async fn test_vector_only_weights_reproduce_vector_ranking() {
    let graph = chain();
    let engine = HybridSearchEngine::new(Some(canned(canned_scores())), 8);
    let request = HybridSearchRequest::new("anything").with_k(3).with_weights(1.0, 0.0);
    let outcome = engine
        .search(&graph, None, &request, &track(ExecutionBudgets::unbounded()))
        .await
        .unwrap();

    let got: Vec<(NodeId, f32)> = outcome.hits.iter().map(|h| (h.id(), h.final_score)).collect();
    assert_eq!(got, canned_scores());
}

#[tokio::test]
async fn test_graph_only_weights_reproduce_expansion_ranking() {
    let graph = chain();
    let engine = HybridSearchEngine::new(Some(canned(vec![(NodeId::new(0), 0.9)])), 8);
    let request = HybridSearchRequest::new("anything")
        .with_k(3)
        .with_weights(0.0, 1.0)
        .with_max_hops(2);
    let outcome = engine
        .search(&graph, None, &request, &track(ExecutionBudgets::unbounded()))
        .await
        .unwrap();

    let by_hops: BTreeMap<NodeId, usize> = outcome.hits.iter().map(|h| (h.id(), h.hops)).collect();
    assert_eq!(
        by_hops,
        BTreeMap::from([(NodeId::new(0), 0), (NodeId::new(1), 1), (NodeId::new(2), 2)])
    );
    for hit in &outcome.hits {
        assert_eq!(hit.final_score, hit.graph_score);
        assert_relative_eq!(hit.graph_score, 1.0 / (1.0 + hit.hops as f32));
    }
}

// ============================================================================
// Transactions → Engine → Driver
// ============================================================================

#[tokio::test]
async fn test_failed_commit_is_invisible_to_queries() {
    let engine = UnifiedQueryEngine::in_memory().unwrap();
    let (alice, before) = engine
        .transactions()
        .run(|tx| Ok::<_, StorageError>(tx.create_node(["Person"], props([("name", "Alice")]))))
        .await
        .unwrap();

    let err = engine
        .transactions()
        .run(|tx| {
            let ghost = NodeId::new(41);
            tx.create_node(["Person"], props([("name", "Mallory")]));
            tx.create_relationship("KNOWS", alice, ghost, Properties::new());
            Ok::<_, StorageError>(())
        })
        .await
        .unwrap_err();
    assert!(matches!(
        err.as_graph_error(),
        Some(GraphError::ReferentialIntegrity { .. })
    ));

    assert_eq!(engine.transactions().head(), Some(before.cid));
    let result = engine
        .execute_cypher(
            "MATCH (p:Person) RETURN p.name AS name",
            &Properties::new(),
            ExecutionBudgets::unbounded(),
        )
        .await
        .unwrap();
    let names: Vec<String> = result.rows.iter().map(|r| name(&r[0])).collect();
    assert_eq!(names, vec!["Alice"]);
}

#[tokio::test]
async fn test_driver_and_engine_agree() {
    let driver: Driver = driver("cidgraph://memory").await.unwrap();
    let engine = driver.engine().clone();
    let mut tx = engine.transactions().begin().await.unwrap();
    let a = tx.create_node(["Person"], props([("name", "Alice")]));
    let b = tx.create_node(["Person"], props([("name", "Bob")]));
    tx.create_relationship("KNOWS", a, b, Properties::new());
    tx.commit().await.unwrap();

    let budgets = engine.default_budgets().unwrap();
    for query in ["MATCH (a)-[:KNOWS]->(b) RETURN a, b.name AS friend", "bob"] {
        let direct = engine.execute(query, &Properties::new(), budgets).await.unwrap();
        let session = driver.session().unwrap();
        let records: Vec<Vec<ResultValue>> = session
            .run(query, Properties::new())
            .await
            .unwrap()
            .map(|r| r.into_values())
            .collect();

        let expected: Vec<Vec<ResultValue>> = match direct {
            EngineResponse::Pattern(result) => result.rows,
            EngineResponse::Hybrid(result) => result
                .results
                .into_iter()
                .map(|hit| vec![ResultValue::Node(hit.node)])
                .collect(),
        };
        assert_eq!(records.len(), expected.len());
        for (got, want) in records.iter().zip(&expected) {
            assert_eq!(got[0], want[0]);
        }
    }
}

#[tokio::test]
async fn test_readers_run_while_a_writer_is_open() {
    let engine = Arc::new(UnifiedQueryEngine::in_memory().unwrap());
    let mut tx = engine.transactions().begin().await.unwrap();
    for i in 0..4 {
        tx.create_node(["N"], props([("i", i as i64)]));
    }
    let first = tx.commit().await.unwrap();

    let mut writer = engine.transactions().begin().await.unwrap();
    writer.create_node(["N"], props([("i", 99i64)]));

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move {
                engine
                    .execute_cypher("MATCH (n:N) RETURN n", &Properties::new(), ExecutionBudgets::unbounded())
                    .await
                    .unwrap()
            })
        })
        .collect();
    for reader in readers {
        let result = reader.await.unwrap();
        assert_eq!(result.rows.len(), 4);
        assert_eq!(result.snapshot, Some(first.cid));
    }

    writer.commit().await.unwrap();
    let after = engine
        .execute_cypher("MATCH (n:N) RETURN n", &Properties::new(), ExecutionBudgets::unbounded())
        .await
        .unwrap();
    assert_eq!(after.rows.len(), 5);
}
