//! Cidgraph query engine
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      CIDGRAPH ENGINE                         │
//! ├──────────────────────────────────────────────────────────────┤
//! │                                                              │
//! │  Driver ──► Session::run ──► UnifiedQueryEngine::execute     │
//! │                                      │                       │
//! │             ┌────────────────────────┼──────────────┐        │
//! │             ▼                        ▼              ▼        │
//! │      MATCH … RETURN           hybrid search     GraphRAG     │
//! │      plan cache + IR          seeds + BFS       hits + text  │
//! │      executor                 fuse + LRU        + Reasoner   │
//! │             │                        │              │        │
//! │             └────────────┬───────────┴──────────────┘        │
//! │                          ▼                                   │
//! │           BudgetTracker (nodes/edges/hops/time)              │
//! │                          │                                   │
//! │                          ▼                                   │
//! │      snapshot CID ──► SnapshotStore ──► KnowledgeGraph       │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every execution runs under an [`ExecutionBudgets`] envelope. Exhausting
//! a budget is not an error: the result carries `success = false`, the
//! partial output and the counters at the moment of the trip.

pub mod budget;
pub mod collaborators;
pub mod config;
pub mod driver;
pub mod engine;
pub mod error;
pub mod executor;
pub mod hybrid;
pub mod rag;

pub use budget::{
    budgets_from_preset, track, track_scope, BudgetDimension, BudgetExceeded, BudgetPresets,
    BudgetTracker, ExecutionBudgets, ExecutionCounters, ExecutionStats,
};
pub use collaborators::{
    cosine_similarity, Embedder, HashingEmbedder, InMemoryVectorStore, Reasoner, VectorStore,
};
pub use config::EngineConfig;
pub use driver::{driver, Driver, DriverError, QueryKind, Record, RecordStream, ResultSummary, Session};
pub use engine::{
    EngineResponse, GraphRagResult, HybridSearchResult, QueryResult, UnifiedQueryEngine,
};
pub use error::{BudgetError, CollaboratorError, EngineError, EngineResult, QueryFailure};
pub use executor::{execute_plan, ExecutionOutcome, ResultValue, Row};
pub use hybrid::{HybridDefaults, HybridHit, HybridSearchEngine, HybridSearchRequest};
pub use rag::{retrieve_subgraph, RetrievedSubgraph};
