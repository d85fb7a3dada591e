//! End-to-end tests for the query engine and driver

use approx::assert_relative_eq;
use async_trait::async_trait;
use cidgraph_engine::{
    budgets_from_preset, driver, BudgetDimension, BudgetError, BudgetPresets, CollaboratorError,
    Driver, DriverError, EngineConfig, EngineError, EngineResponse, ExecutionBudgets,
    HybridSearchRequest, InMemoryVectorStore, QueryFailure, QueryKind, Reasoner, ResultValue,
    UnifiedQueryEngine,
};
use cidgraph_graph::{props, Cid, Codec, NodeId, Properties, Value};
use cidgraph_storage::StorageError;
use proptest::prelude::*;
use std::sync::Arc;
use tempfile::tempdir;

/// Alice -KNOWS-> Bob -LIKES-> Cheddar, committed as the head.
async fn seeded(engine: &UnifiedQueryEngine) -> Cid {
    let mut tx = engine.transactions().begin().await.unwrap();
    let alice = tx.create_node(["Person"], props([("name", "Alice")]));
    let bob = tx.create_node(["Person"], props([("name", "Bob")]));
    let cheese = tx.create_node(["Food"], props([("name", "Cheddar")]));
    tx.create_relationship("KNOWS", alice, bob, Properties::new());
    tx.create_relationship("LIKES", bob, cheese, Properties::new());
    tx.commit().await.unwrap().cid
}

fn text(value: &ResultValue) -> &str {
    match value {
        ResultValue::Value(v) => v.as_str().unwrap(),
        ResultValue::Node(n) => n.property("name").unwrap().as_str().unwrap(),
        ResultValue::Relationship(r) => &r.rel_type,
    }
}

struct Echo;

#[async_trait]
impl Reasoner for Echo {
    async fn reason(&self, question: &str, context: &str) -> Result<String, CollaboratorError> {
        Ok(format!("{question} ({} context lines)", context.lines().count()))
    }
}

struct Throttled;

#[async_trait]
impl Reasoner for Throttled {
    async fn reason(&self, _: &str, _: &str) -> Result<String, CollaboratorError> {
        Err(CollaboratorError::RateLimited)
    }
}

// ============================================================================
// Unified engine
// ============================================================================

#[tokio::test]
async fn test_execute_routes_match_to_pattern_queries() {
    let engine = UnifiedQueryEngine::in_memory().unwrap();
    let head = seeded(&engine).await;

    let response = engine
        .execute(
            "MATCH (a:Person)-[:KNOWS]->(b) RETURN a.name AS src, b.name AS dst",
            &Properties::new(),
            ExecutionBudgets::unbounded(),
        )
        .await
        .unwrap();
    let EngineResponse::Pattern(result) = response else {
        panic!("expected a pattern result");
    };
    assert!(result.success);
    assert_eq!(result.columns, vec!["src", "dst"]);
    assert_eq!(result.rows.len(), 1);
    assert_eq!(text(&result.rows[0][0]), "Alice");
    assert_eq!(text(&result.rows[0][1]), "Bob");
    assert_eq!(result.snapshot, Some(head));
    assert!(result.stats.exceeded.is_none());
}

#[tokio::test]
async fn test_execute_routes_free_text_to_hybrid_search() {
    let engine = UnifiedQueryEngine::in_memory().unwrap();
    seeded(&engine).await;

    let response = engine
        .execute("alice", &Properties::new(), ExecutionBudgets::unbounded())
        .await
        .unwrap();
    let EngineResponse::Hybrid(result) = response else {
        panic!("expected a hybrid result");
    };
    assert!(result.success);
    let names: Vec<&str> = result
        .results
        .iter()
        .map(|hit| hit.node.property("name").unwrap().as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["Alice", "Bob", "Cheddar"]);
    assert_relative_eq!(result.results[0].graph_score, 1.0);
    assert_relative_eq!(result.results[1].graph_score, 0.5);
    assert_relative_eq!(result.results[2].graph_score, 1.0 / 3.0, epsilon = 1e-6);
}

#[tokio::test]
async fn test_syntax_error_is_a_structured_result() {
    let engine = UnifiedQueryEngine::in_memory().unwrap();
    let query = "MATCH (a:Person RETURN a";
    let result = engine
        .execute_cypher(query, &Properties::new(), ExecutionBudgets::unbounded())
        .await
        .unwrap();
    assert!(!result.success);
    assert!(result.rows.is_empty());
    match result.failure {
        Some(QueryFailure::Syntax(err)) => {
            assert_eq!(err.offset, query.find("RETURN").unwrap());
            assert_eq!(err.token, "RETURN");
        }
        other => panic!("expected syntax failure, got {other:?}"),
    }
}

#[tokio::test]
async fn test_unbound_variable_is_semantic_failure() {
    let engine = UnifiedQueryEngine::in_memory().unwrap();
    let result = engine
        .execute_cypher("MATCH (a) RETURN b", &Properties::new(), ExecutionBudgets::unbounded())
        .await
        .unwrap();
    assert!(matches!(result.failure, Some(QueryFailure::Semantic { .. })));
}

#[tokio::test]
async fn test_budget_trip_returns_partial_result() {
    let engine = UnifiedQueryEngine::in_memory().unwrap();
    seeded(&engine).await;

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
    assert_eq!(exceeded.limit, 1);
    assert_eq!(result.stats.exceeded, Some(BudgetDimension::Nodes));
    assert_eq!(result.stats.counters.nodes, 2);
    assert_eq!(result.columns, vec!["n", "m"]);
}

#[tokio::test]
async fn test_queries_pin_older_snapshots() {
    let engine = UnifiedQueryEngine::in_memory().unwrap();
    let first = seeded(&engine).await;

    let mut tx = engine.transactions().begin().await.unwrap();
    tx.create_node(["Person"], props([("name", "Dave")]));
    tx.commit().await.unwrap();

    let query = "MATCH (p:Person) RETURN p.name AS name";
    let now = engine
        .execute_cypher(query, &Properties::new(), ExecutionBudgets::unbounded())
        .await
        .unwrap();
    let then = engine
        .execute_cypher_at(&first, query, &Properties::new(), ExecutionBudgets::unbounded())
        .await
        .unwrap();
    assert_eq!(now.rows.len(), 3);
    assert_eq!(then.rows.len(), 2);
    assert_eq!(then.snapshot, Some(first));
}

#[tokio::test]
async fn test_unknown_snapshot_is_an_error() {
    let engine = UnifiedQueryEngine::in_memory().unwrap();
    let missing = Cid::for_bytes(Codec::DagCbor, b"never stored");
    let err = engine
        .execute_cypher_at(&missing, "MATCH (n) RETURN n", &Properties::new(), ExecutionBudgets::unbounded())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Storage(StorageError::NotFound(cid)) if cid == missing));
}

#[tokio::test]
async fn test_empty_store_answers_with_no_rows() {
    let engine = UnifiedQueryEngine::in_memory().unwrap();
    let result = engine
        .execute_cypher("MATCH (n) RETURN n", &Properties::new(), ExecutionBudgets::unbounded())
        .await
        .unwrap();
    assert!(result.success);
    assert!(result.rows.is_empty());
    assert_eq!(result.snapshot, None);
}

#[tokio::test]
async fn test_caches_start_lazily() {
    let engine = UnifiedQueryEngine::in_memory().unwrap();
    seeded(&engine).await;
    assert!(engine.plan_cache_stats().is_none());
    assert!(engine.hybrid_cache_stats().is_none());

    for _ in 0..2 {
        engine
            .execute_cypher("MATCH (n) RETURN n", &Properties::new(), ExecutionBudgets::unbounded())
            .await
            .unwrap();
    }
    let plans = engine.plan_cache_stats().unwrap();
    assert_eq!(plans.len, 1);
    assert_eq!(plans.hits, 1);

    let request = HybridSearchRequest::new("bob");
    let first = engine
        .execute_hybrid(&request, ExecutionBudgets::unbounded())
        .await
        .unwrap();
    let second = engine
        .execute_hybrid(&request, ExecutionBudgets::unbounded())
        .await
        .unwrap();
    assert!(!first.cached);
    assert!(second.cached);
    assert_eq!(first.results, second.results);
    assert_eq!(engine.hybrid_cache_stats().unwrap().hits, 1);
}

#[tokio::test]
async fn test_vector_store_seeds_hybrid_search() {
    let store = Arc::new(InMemoryVectorStore::with_hashing_embedder());
    let engine = UnifiedQueryEngine::in_memory()
        .unwrap()
        .with_vector_store(store.clone());
    seeded(&engine).await;
    // Only the cheese is indexed, so it is the sole vector candidate.
    store.index_text(NodeId::new(2), "cheddar");

    let request = HybridSearchRequest::new("cheddar").with_k(1).with_weights(1.0, 0.0);
    let result = engine
        .execute_hybrid(&request, ExecutionBudgets::unbounded())
        .await
        .unwrap();
    assert_eq!(result.results.len(), 1);
    let hit = &result.results[0];
    assert_eq!(hit.node.property("name"), Some(&Value::from("Cheddar")));
    assert!(hit.vector_score > 0.0);
    assert_relative_eq!(hit.final_score, hit.vector_score);
}

#[tokio::test]
async fn test_unknown_preset_is_rejected() {
    let engine = UnifiedQueryEngine::in_memory().unwrap();
    assert!(engine.budgets("strict").is_ok());
    assert!(matches!(engine.budgets("reckless"), Err(EngineError::Budget(_))));

    let config = EngineConfig {
        default_preset: "reckless".to_string(),
        ..EngineConfig::in_memory()
    };
    assert!(matches!(
        UnifiedQueryEngine::open(config).await,
        Err(EngineError::Config(_))
    ));
}

#[tokio::test]
async fn test_presets_file_extends_engine_but_not_builtin_lookup() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("presets.json");
    std::fs::write(&path, r#"{"nightly": {"max_nodes": 7, "max_hops": 2}}"#).unwrap();

    let config = EngineConfig {
        presets_file: Some(path.clone()),
        ..EngineConfig::in_memory()
    };
    let engine = UnifiedQueryEngine::open(config).await.unwrap();
    let nightly = engine.budgets("nightly").unwrap();
    assert_eq!(nightly.max_nodes, Some(7));
    assert_eq!(nightly.max_hops, Some(2));
    assert_eq!(BudgetPresets::load_file(&path).unwrap().get("nightly").unwrap(), nightly);

    assert!(matches!(
        budgets_from_preset("nightly"),
        Err(BudgetError::UnknownPreset { .. })
    ));
    assert_eq!(
        budgets_from_preset("strict").unwrap(),
        engine.budgets("strict").unwrap()
    );
}

// ============================================================================
// GraphRAG
// ============================================================================

#[tokio::test]
async fn test_graphrag_feeds_subgraph_to_reasoner() {
    let engine = UnifiedQueryEngine::in_memory()
        .unwrap()
        .with_reasoner(Arc::new(Echo));
    seeded(&engine).await;

    let result = engine
        .execute_graphrag("who does alice know", "", ExecutionBudgets::unbounded())
        .await
        .unwrap();
    assert!(result.success);
    assert!(result.context.contains("(n0)-[:KNOWS]->(n1)"));
    assert!(result.context.contains("(n1)-[:LIKES]->(n2)"));
    assert_eq!(result.relationships.len(), 2);
    assert!(result.reasoning.starts_with("who does alice know ("));
    assert!(result.warnings.is_empty());
}

#[tokio::test]
async fn test_graphrag_without_reasoner_returns_context() {
    let engine = UnifiedQueryEngine::in_memory().unwrap();
    seeded(&engine).await;

    let result = engine
        .execute_graphrag("bob", "user asked twice", ExecutionBudgets::unbounded())
        .await
        .unwrap();
    assert!(result.success);
    assert!(result.reasoning.is_empty());
    assert!(result.context.starts_with("Context:\nuser asked twice"));
    assert_eq!(result.warnings.len(), 1);
}

#[tokio::test]
async fn test_graphrag_survives_reasoner_failure() {
    let engine = UnifiedQueryEngine::in_memory()
        .unwrap()
        .with_reasoner(Arc::new(Throttled));
    seeded(&engine).await;

    let result = engine
        .execute_graphrag("alice", "", ExecutionBudgets::unbounded())
        .await
        .unwrap();
    assert!(result.success);
    assert!(result.reasoning.is_empty());
    assert!(!result.hits.is_empty());
    assert!(result.warnings.iter().any(|w| w.contains("Rate limited")));
}

// ============================================================================
// Driver / session
// ============================================================================

async fn memory_driver() -> Driver {
    let driver = driver("cidgraph://memory").await.unwrap();
    seeded(driver.engine()).await;
    driver
}

#[tokio::test]
async fn test_session_run_yields_records() {
    let driver = memory_driver().await;
    let session = driver.session().unwrap();

    let mut params = Properties::new();
    params.insert("name".to_string(), Value::from("Bob"));
    let stream = session
        .run("MATCH (p:Person {name: $name})-[:LIKES]->(f) RETURN f.name AS food", params)
        .await
        .unwrap();
    assert_eq!(stream.keys(), ["food".to_string()]);
    let records: Vec<_> = stream.collect();
    assert_eq!(records.len(), 1);
    assert_eq!(text(records[0].get("food").unwrap()), "Cheddar");
    assert!(records[0].get("missing").is_none());
}

#[tokio::test]
async fn test_consume_reports_summary() {
    let driver = memory_driver().await;
    let session = driver.session().unwrap();
    let head = driver.engine().transactions().head();

    let stream = session.run("cheddar", Properties::new()).await.unwrap();
    assert_eq!(stream.keys(), ["node", "score", "vector_score", "graph_score"]);
    let summary = stream.consume();
    assert_eq!(summary.kind, QueryKind::Hybrid);
    assert_eq!(summary.query, "cheddar");
    assert_eq!(summary.snapshot, head);
    assert!(!summary.cached);
    assert!(summary.success);
    assert!(summary.failure.is_none());
    assert!(summary.stats.counters.nodes >= 1);
}

#[tokio::test]
async fn test_run_returns_partial_records_with_failure_summary() {
    let driver = memory_driver().await;

    let session = driver.session().unwrap();
    let stream = session
        .run("MATCH (a:Person RETURN a", Properties::new())
        .await
        .unwrap();
    assert_eq!(stream.remaining(), 0);
    let summary = stream.consume();
    assert!(!summary.success);
    match summary.failure {
        Some(QueryFailure::Syntax(err)) => assert_eq!(err.offset, 16),
        other => panic!("expected syntax failure, got {other:?}"),
    }

    let budgets = ExecutionBudgets::unbounded().with_max_nodes(1);
    let query = "MATCH (n)-[]->(m) RETURN n, m";
    let direct = driver
        .engine()
        .execute(query, &Properties::new(), budgets)
        .await
        .unwrap();

    let session = session.with_budgets(budgets);
    let stream = session.run(query, Properties::new()).await.unwrap();
    let exceeded = stream.failure().and_then(QueryFailure::budget).unwrap();
    assert_eq!(exceeded.dimension, BudgetDimension::Nodes);

    let partial: Vec<Vec<ResultValue>> = stream.clone().map(|r| r.into_values()).collect();
    match &direct {
        EngineResponse::Pattern(result) => assert_eq!(partial, result.rows),
        other => panic!("expected pattern response, got {other:?}"),
    }
    let summary = stream.consume();
    assert!(!summary.success);
    assert_eq!(summary.stats.counters.nodes, 2);
    assert_eq!(
        summary.failure.as_ref().and_then(QueryFailure::budget).map(|e| e.limit),
        direct.failure().and_then(QueryFailure::budget).map(|e| e.limit),
    );
}

#[tokio::test]
async fn test_sessions_are_counted_and_close_refuses_new_ones() {
    let driver = memory_driver().await;
    let first = driver.session().unwrap();
    let second = driver.session().unwrap();
    assert_eq!(driver.open_sessions(), 2);
    drop(first);
    assert_eq!(driver.open_sessions(), 1);
    second.close();
    assert_eq!(driver.open_sessions(), 0);

    driver.verify_connectivity().await.unwrap();
    driver.close();
    assert!(matches!(driver.session(), Err(DriverError::Closed)));
    assert!(matches!(driver.verify_connectivity().await, Err(DriverError::Closed)));
}

#[tokio::test]
async fn test_session_transactions_commit_through_the_engine() {
    let driver = memory_driver().await;
    let session = driver.session().unwrap();

    let mut tx = session.begin_transaction().await.unwrap();
    tx.create_node(["Person"], props([("name", "Erin")]));
    tx.commit().await.unwrap();

    let record = session
        .run("MATCH (p:Person {name: 'Erin'}) RETURN p", Properties::new())
        .await
        .unwrap()
        .single()
        .unwrap();
    assert_eq!(text(&record.values()[0]), "Erin");
}

#[tokio::test]
async fn test_file_uri_persists_across_drivers() {
    let dir = tempdir().unwrap();
    let uri = format!("cidgraph+file://{}", dir.path().display());

    let head = {
        let driver = driver(&uri).await.unwrap();
        seeded(driver.engine()).await
    };

    let reopened = driver(&uri).await.unwrap();
    assert_eq!(reopened.engine().transactions().head(), Some(head));
    let stream = reopened
        .session()
        .unwrap()
        .run("MATCH (p:Person) RETURN p.name AS name", Properties::new())
        .await
        .unwrap();
    assert_eq!(stream.remaining(), 2);
}

#[tokio::test]
async fn test_invalid_uri() {
    for uri in ["bolt://localhost:7687", "cidgraph+file://", ""] {
        assert!(matches!(driver(uri).await, Err(DriverError::InvalidUri(_))));
    }
}

// ============================================================================
// Budget properties
// ============================================================================

proptest! {
    #[test]
    fn prop_counters_overshoot_by_at_most_one(
        limit in 0u64..32,
        workers in 1usize..6,
        per_worker in 0u64..24,
    ) {
        let tracker = cidgraph_engine::track(ExecutionBudgets::unbounded().with_max_nodes(limit));
        std::thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| {
                    for _ in 0..per_worker {
                        if tracker.increment_nodes(1).is_err() {
                            break;
                        }
                    }
                });
            }
        });
        let attempted = workers as u64 * per_worker;
        let stats = tracker.finish();
        prop_assert!(stats.counters.nodes <= limit + 1);
        prop_assert_eq!(stats.counters.nodes, attempted.min(limit + 1));
        prop_assert_eq!(stats.exceeded.is_some(), attempted > limit);
    }
}
