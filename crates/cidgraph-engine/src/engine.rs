//! Unified query engine: one façade over pattern queries, hybrid search and
//! GraphRAG.
//!
//! Queries run against the transaction manager's head unless a snapshot CID
//! is given (`*_at`). Syntax and budget failures come back as results with
//! `success = false`; missing snapshots and storage faults are `Err`.

use crate::budget::{track, BudgetPresets, ExecutionBudgets, ExecutionStats};
use crate::collaborators::{Reasoner, VectorStore};
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult, QueryFailure};
use crate::executor::{execute_plan, ResultValue, Row};
use crate::hybrid::{HybridHit, HybridSearchEngine, HybridSearchRequest};
use crate::rag::retrieve_subgraph;
use cidgraph_dsl::{compile_query, looks_like_pattern_query, CompileError, QueryPlan};
use cidgraph_graph::{Cid, KnowledgeGraph, Node, Properties, Relationship};
use cidgraph_storage::{CacheStats, LruCache, Storage, TransactionManager};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, OnceLock};

// ============================================================================
// Result records
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub success: bool,
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
    pub stats: ExecutionStats,
    pub warnings: Vec<String>,
    pub failure: Option<QueryFailure>,
    /// Snapshot the query ran against (`None` before the first commit).
    pub snapshot: Option<Cid>,
}

impl QueryResult {
    /// Values of `column` across all rows.
    pub fn column(&self, column: &str) -> Option<Vec<&ResultValue>> {
        let idx = self.columns.iter().position(|c| c == column)?;
        Some(self.rows.iter().filter_map(|row| row.get(idx)).collect())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HybridSearchResult {
    pub success: bool,
    pub query: String,
    pub results: Vec<HybridHit>,
    /// Served from the result cache without touching the graph.
    pub cached: bool,
    pub stats: ExecutionStats,
    pub warnings: Vec<String>,
    pub failure: Option<QueryFailure>,
    pub snapshot: Option<Cid>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphRagResult {
    pub success: bool,
    pub question: String,
    /// Reasoner answer; empty when no reasoner is configured or it failed.
    pub reasoning: String,
    /// Text handed to the reasoner.
    pub context: String,
    pub nodes: Vec<Node>,
    pub relationships: Vec<Relationship>,
    pub hits: Vec<HybridHit>,
    pub stats: ExecutionStats,
    pub warnings: Vec<String>,
    pub failure: Option<QueryFailure>,
    pub snapshot: Option<Cid>,
}

/// What [`UnifiedQueryEngine::execute`] routed the input to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EngineResponse {
    Pattern(QueryResult),
    Hybrid(HybridSearchResult),
}

impl EngineResponse {
    pub fn success(&self) -> bool {
        match self {
            EngineResponse::Pattern(r) => r.success,
            EngineResponse::Hybrid(r) => r.success,
        }
    }

    pub fn failure(&self) -> Option<&QueryFailure> {
        match self {
            EngineResponse::Pattern(r) => r.failure.as_ref(),
            EngineResponse::Hybrid(r) => r.failure.as_ref(),
        }
    }

    pub fn stats(&self) -> &ExecutionStats {
        match self {
            EngineResponse::Pattern(r) => &r.stats,
            EngineResponse::Hybrid(r) => &r.stats,
        }
    }

    pub fn warnings(&self) -> &[String] {
        match self {
            EngineResponse::Pattern(r) => &r.warnings,
            EngineResponse::Hybrid(r) => &r.warnings,
        }
    }

    pub fn snapshot(&self) -> Option<Cid> {
        match self {
            EngineResponse::Pattern(r) => r.snapshot,
            EngineResponse::Hybrid(r) => r.snapshot,
        }
    }
}

// ============================================================================
// Engine
// ============================================================================

pub struct UnifiedQueryEngine {
    config: EngineConfig,
    storage: Storage,
    presets: BudgetPresets,
    vector_store: Option<Arc<dyn VectorStore>>,
    reasoner: Option<Arc<dyn Reasoner>>,
    plans: OnceLock<LruCache<String, QueryPlan>>,
    hybrid: OnceLock<HybridSearchEngine>,
}

impl UnifiedQueryEngine {
    /// Open storage as configured (in memory or under `data_dir`).
    pub async fn open(config: EngineConfig) -> EngineResult<Self> {
        let storage = Storage::open(&config.storage_config()).await?;
        Self::with_storage(storage, config)
    }

    pub fn in_memory() -> EngineResult<Self> {
        let config = EngineConfig::in_memory();
        let storage = Storage::in_memory(&config.storage_config());
        Self::with_storage(storage, config)
    }

    pub fn with_storage(storage: Storage, config: EngineConfig) -> EngineResult<Self> {
        let mut presets = BudgetPresets::builtin()?;
        if let Some(path) = &config.presets_file {
            presets.merge(BudgetPresets::load_file(path)?);
        }
        if presets.get(&config.default_preset).is_err() {
            return Err(EngineError::Config(format!(
                "default preset `{}` is not defined",
                config.default_preset
            )));
        }
        tracing::info!(
            data_dir = ?config.data_dir,
            presets = presets.len(),
            default_preset = %config.default_preset,
            "query engine created"
        );
        Ok(Self {
            config,
            storage,
            presets,
            vector_store: None,
            reasoner: None,
            plans: OnceLock::new(),
            hybrid: OnceLock::new(),
        })
    }

    pub fn with_vector_store(mut self, store: Arc<dyn VectorStore>) -> Self {
        self.vector_store = Some(store);
        self.hybrid = OnceLock::new();
        self
    }

    pub fn with_reasoner(mut self, reasoner: Arc<dyn Reasoner>) -> Self {
        self.reasoner = Some(reasoner);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn transactions(&self) -> &TransactionManager {
        self.storage.transactions()
    }

    pub fn presets(&self) -> &BudgetPresets {
        &self.presets
    }

    /// Budgets of the named preset.
    pub fn budgets(&self, name: &str) -> EngineResult<ExecutionBudgets> {
        Ok(self.presets.get(name)?)
    }

    /// Budgets of the configured default preset.
    pub fn default_budgets(&self) -> EngineResult<ExecutionBudgets> {
        self.budgets(&self.config.default_preset)
    }

    /// Plan cache statistics; `None` until the first pattern query.
    pub fn plan_cache_stats(&self) -> Option<CacheStats> {
        self.plans.get().map(LruCache::stats)
    }

    /// Hybrid result cache statistics; `None` until the first search.
    pub fn hybrid_cache_stats(&self) -> Option<CacheStats> {
        self.hybrid.get().map(HybridSearchEngine::cache_stats)
    }

    // ------------------------------------------------------------------------
    // Pattern queries
    // ------------------------------------------------------------------------

    pub async fn execute_cypher(
        &self,
        query: &str,
        params: &Properties,
        budgets: ExecutionBudgets,
    ) -> EngineResult<QueryResult> {
        let (snapshot, graph) = self.snapshot(None).await?;
        Ok(self.run_pattern(snapshot, &graph, query, params, budgets))
    }

    pub async fn execute_cypher_at(
        &self,
        cid: &Cid,
        query: &str,
        params: &Properties,
        budgets: ExecutionBudgets,
    ) -> EngineResult<QueryResult> {
        let (snapshot, graph) = self.snapshot(Some(*cid)).await?;
        Ok(self.run_pattern(snapshot, &graph, query, params, budgets))
    }

    /// Compiled plan for `query`, from the plan cache when possible.
    pub fn plan(&self, query: &str) -> Result<Arc<QueryPlan>, CompileError> {
        let plans = self.plans.get_or_init(|| {
            tracing::debug!(capacity = self.config.plan_cache_capacity, "plan cache initialised");
            LruCache::new(self.config.plan_cache_capacity)
        });
        if let Some(plan) = plans.get(&query.to_string()) {
            return Ok(plan);
        }
        let plan = compile_query(query)?;
        Ok(plans.insert(query.to_string(), plan))
    }

    fn run_pattern(
        &self,
        snapshot: Option<Cid>,
        graph: &KnowledgeGraph,
        query: &str,
        params: &Properties,
        budgets: ExecutionBudgets,
    ) -> QueryResult {
        let tracker = track(budgets);
        let plan = match self.plan(query) {
            Ok(plan) => plan,
            Err(err) => {
                tracing::debug!(error = %err, "pattern query rejected");
                return QueryResult {
                    success: false,
                    columns: Vec::new(),
                    rows: Vec::new(),
                    stats: tracker.finish(),
                    warnings: Vec::new(),
                    failure: Some(err.into()),
                    snapshot,
                };
            }
        };

        let outcome = execute_plan(graph, &plan, params, &tracker);
        let stats = tracker.finish();
        QueryResult {
            success: outcome.exceeded.is_none(),
            columns: outcome.columns,
            rows: outcome.rows,
            stats,
            warnings: outcome.warnings,
            failure: outcome.exceeded.map(QueryFailure::from),
            snapshot,
        }
    }

    // ------------------------------------------------------------------------
    // Hybrid search
    // ------------------------------------------------------------------------

    pub async fn execute_hybrid(
        &self,
        request: &HybridSearchRequest,
        budgets: ExecutionBudgets,
    ) -> EngineResult<HybridSearchResult> {
        let (snapshot, graph) = self.snapshot(None).await?;
        self.run_hybrid(snapshot, &graph, request, budgets).await
    }

    pub async fn execute_hybrid_at(
        &self,
        cid: &Cid,
        request: &HybridSearchRequest,
        budgets: ExecutionBudgets,
    ) -> EngineResult<HybridSearchResult> {
        let (snapshot, graph) = self.snapshot(Some(*cid)).await?;
        self.run_hybrid(snapshot, &graph, request, budgets).await
    }

    fn hybrid_engine(&self) -> &HybridSearchEngine {
        self.hybrid.get_or_init(|| {
            tracing::info!(
                vector_store = self.vector_store.is_some(),
                capacity = self.config.hybrid_cache_capacity,
                "hybrid search engine initialised"
            );
            HybridSearchEngine::new(self.vector_store.clone(), self.config.hybrid_cache_capacity)
        })
    }

    async fn run_hybrid(
        &self,
        snapshot: Option<Cid>,
        graph: &KnowledgeGraph,
        request: &HybridSearchRequest,
        budgets: ExecutionBudgets,
    ) -> EngineResult<HybridSearchResult> {
        let tracker = track(budgets);
        let outcome = self
            .hybrid_engine()
            .search(graph, snapshot, request, &tracker)
            .await?;
        let stats = tracker.finish();
        Ok(HybridSearchResult {
            success: outcome.exceeded.is_none(),
            query: request.query.clone(),
            results: outcome.hits,
            cached: outcome.cached,
            stats,
            warnings: outcome.warnings,
            failure: outcome.exceeded.map(QueryFailure::from),
            snapshot,
        })
    }

    // ------------------------------------------------------------------------
    // GraphRAG
    // ------------------------------------------------------------------------

    pub async fn execute_graphrag(
        &self,
        question: &str,
        context: &str,
        budgets: ExecutionBudgets,
    ) -> EngineResult<GraphRagResult> {
        let (snapshot, graph) = self.snapshot(None).await?;
        self.run_graphrag(snapshot, &graph, question, context, budgets)
            .await
    }

    pub async fn execute_graphrag_at(
        &self,
        cid: &Cid,
        question: &str,
        context: &str,
        budgets: ExecutionBudgets,
    ) -> EngineResult<GraphRagResult> {
        let (snapshot, graph) = self.snapshot(Some(*cid)).await?;
        self.run_graphrag(snapshot, &graph, question, context, budgets)
            .await
    }

    async fn run_graphrag(
        &self,
        snapshot: Option<Cid>,
        graph: &KnowledgeGraph,
        question: &str,
        context: &str,
        budgets: ExecutionBudgets,
    ) -> EngineResult<GraphRagResult> {
        let request = self.config.hybrid.request(question);
        let search = self.run_hybrid(snapshot, graph, &request, budgets).await?;
        let subgraph = retrieve_subgraph(graph, &search.results, context);
        let mut warnings = search.warnings;

        let reasoning = match &self.reasoner {
            Some(reasoner) => match reasoner.reason(question, &subgraph.text).await {
                Ok(answer) => answer,
                Err(err) => {
                    tracing::warn!(error = %err, "reasoner failed; returning retrieved context only");
                    warnings.push(format!("reasoning backend failed: {err}"));
                    String::new()
                }
            },
            None => {
                warnings.push(
                    "no reasoning backend configured; returning retrieved context only"
                        .to_string(),
                );
                String::new()
            }
        };

        Ok(GraphRagResult {
            success: search.success,
            question: question.to_string(),
            reasoning,
            context: subgraph.text,
            nodes: subgraph.nodes,
            relationships: subgraph.relationships,
            hits: search.results,
            stats: search.stats,
            warnings,
            failure: search.failure,
            snapshot,
        })
    }

    // ------------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------------

    /// Route `input`: text starting with `MATCH` is a pattern query,
    /// anything else is a hybrid search with the configured defaults.
    pub async fn execute(
        &self,
        input: &str,
        params: &Properties,
        budgets: ExecutionBudgets,
    ) -> EngineResult<EngineResponse> {
        let (snapshot, graph) = self.snapshot(None).await?;
        self.dispatch(snapshot, &graph, input, params, budgets).await
    }

    pub async fn execute_at(
        &self,
        cid: &Cid,
        input: &str,
        params: &Properties,
        budgets: ExecutionBudgets,
    ) -> EngineResult<EngineResponse> {
        let (snapshot, graph) = self.snapshot(Some(*cid)).await?;
        self.dispatch(snapshot, &graph, input, params, budgets).await
    }

    async fn dispatch(
        &self,
        snapshot: Option<Cid>,
        graph: &KnowledgeGraph,
        input: &str,
        params: &Properties,
        budgets: ExecutionBudgets,
    ) -> EngineResult<EngineResponse> {
        if looks_like_pattern_query(input) {
            Ok(EngineResponse::Pattern(
                self.run_pattern(snapshot, graph, input, params, budgets),
            ))
        } else {
            let request = self.config.hybrid.request(input.trim());
            Ok(EngineResponse::Hybrid(
                self.run_hybrid(snapshot, graph, &request, budgets).await?,
            ))
        }
    }

    /// The snapshot to query: `at` if given, else the current head.
    async fn snapshot(&self, at: Option<Cid>) -> EngineResult<(Option<Cid>, Arc<KnowledgeGraph>)> {
        let cid = at.or_else(|| self.transactions().head());
        let graph = match &cid {
            Some(cid) => self.storage.snapshots().retrieve(cid).await?,
            None => Arc::new(KnowledgeGraph::new()),
        };
        Ok((cid, graph))
    }
}
