//! Driver/session façade in the style of conventional graph database
//! drivers. Every call goes straight to [`UnifiedQueryEngine::execute`];
//! this module only reshapes the engine's results into records.
//!
//! `run` fails only where `execute` fails. Syntax errors and budget trips
//! come back as a stream holding whatever rows were produced, with the
//! failure on [`ResultSummary::failure`].
//!
//! ```no_run
//! # async fn demo() -> Result<(), cidgraph_engine::DriverError> {
//! use cidgraph_engine::driver;
//! use cidgraph_graph::props;
//!
//! let driver = driver("cidgraph://memory").await?;
//! let session = driver.session()?;
//! let stream = session
//!     .run("MATCH (p:Person {name: $name}) RETURN p.name AS name", props([("name", "Alice")]))
//!     .await?;
//! for record in stream {
//!     println!("{:?}", record.get("name"));
//! }
//! # Ok(())
//! # }
//! ```

use crate::budget::{ExecutionBudgets, ExecutionStats};
use crate::engine::{EngineResponse, UnifiedQueryEngine};
use crate::error::{EngineError, QueryFailure};
use crate::executor::ResultValue;
use cidgraph_graph::{Cid, Properties, Value};
use cidgraph_storage::Transaction;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;

pub const MEMORY_URI: &str = "cidgraph://memory";
const FILE_SCHEME: &str = "cidgraph+file://";

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("unsupported URI `{0}` (expected {MEMORY_URI} or {FILE_SCHEME}<path>)")]
    InvalidUri(String),

    #[error("driver is closed")]
    Closed,

    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// Open a driver for `uri`: `cidgraph://memory` or `cidgraph+file:///path`.
pub async fn driver(uri: &str) -> Result<Driver, DriverError> {
    let config = match uri.trim() {
        MEMORY_URI => crate::EngineConfig::in_memory(),
        other => match other.strip_prefix(FILE_SCHEME) {
            Some(path) if !path.is_empty() => {
                crate::EngineConfig::in_memory().with_data_dir(PathBuf::from(path))
            }
            _ => return Err(DriverError::InvalidUri(uri.to_string())),
        },
    };
    let engine = UnifiedQueryEngine::open(config).await?;
    tracing::debug!(uri, "driver opened");
    Ok(Driver::from_engine(Arc::new(engine)))
}

// ============================================================================
// Driver
// ============================================================================

#[derive(Clone)]
pub struct Driver {
    engine: Arc<UnifiedQueryEngine>,
    open_sessions: Arc<AtomicUsize>,
    closed: Arc<AtomicBool>,
}

impl Driver {
    pub fn from_engine(engine: Arc<UnifiedQueryEngine>) -> Self {
        Self {
            engine,
            open_sessions: Arc::new(AtomicUsize::new(0)),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn engine(&self) -> &Arc<UnifiedQueryEngine> {
        &self.engine
    }

    /// A session running with the engine's default budgets.
    pub fn session(&self) -> Result<Session, DriverError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DriverError::Closed);
        }
        let budgets = self.engine.default_budgets()?;
        self.open_sessions.fetch_add(1, Ordering::AcqRel);
        Ok(Session {
            engine: Arc::clone(&self.engine),
            budgets,
            open_sessions: Arc::clone(&self.open_sessions),
        })
    }

    pub fn open_sessions(&self) -> usize {
        self.open_sessions.load(Ordering::Acquire)
    }

    /// Check the head snapshot is readable.
    pub async fn verify_connectivity(&self) -> Result<(), DriverError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DriverError::Closed);
        }
        self.engine
            .transactions()
            .head_snapshot()
            .await
            .map_err(EngineError::from)?;
        Ok(())
    }

    /// Refuse new sessions. Open sessions keep working until dropped.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

// ============================================================================
// Session
// ============================================================================

/// Released when dropped.
pub struct Session {
    engine: Arc<UnifiedQueryEngine>,
    budgets: ExecutionBudgets,
    open_sessions: Arc<AtomicUsize>,
}

impl Session {
    pub fn with_budgets(mut self, budgets: ExecutionBudgets) -> Self {
        self.budgets = budgets;
        self
    }

    pub fn budgets(&self) -> &ExecutionBudgets {
        &self.budgets
    }

    pub async fn run(&self, query: &str, params: Properties) -> Result<RecordStream, DriverError> {
        let response = self.engine.execute(query, &params, self.budgets).await?;
        if let Some(failure) = response.failure() {
            tracing::debug!(query, %failure, "query returned a structured failure");
        }
        Ok(RecordStream::from_response(query, response))
    }

    /// Start a write transaction on the engine's transaction manager.
    pub async fn begin_transaction(&self) -> Result<Transaction, DriverError> {
        Ok(self
            .engine
            .transactions()
            .begin()
            .await
            .map_err(EngineError::from)?)
    }

    pub fn close(self) {}
}

impl Drop for Session {
    fn drop(&mut self) {
        self.open_sessions.fetch_sub(1, Ordering::AcqRel);
    }
}

// ============================================================================
// Records
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    keys: Arc<[String]>,
    values: Vec<ResultValue>,
}

impl Record {
    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    pub fn values(&self) -> &[ResultValue] {
        &self.values
    }

    pub fn get(&self, key: &str) -> Option<&ResultValue> {
        let idx = self.keys.iter().position(|k| k == key)?;
        self.values.get(idx)
    }

    pub fn into_values(self) -> Vec<ResultValue> {
        self.values
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryKind {
    Pattern,
    Hybrid,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResultSummary {
    pub query: String,
    pub kind: QueryKind,
    pub stats: ExecutionStats,
    pub warnings: Vec<String>,
    pub snapshot: Option<Cid>,
    pub cached: bool,
    /// `false` when the engine stopped early; records are then partial.
    pub success: bool,
    pub failure: Option<QueryFailure>,
}

/// Records of one `run`, consumed by iteration.
#[derive(Debug, Clone)]
pub struct RecordStream {
    keys: Arc<[String]>,
    records: VecDeque<Record>,
    summary: ResultSummary,
}

impl RecordStream {
    fn from_response(query: &str, response: EngineResponse) -> Self {
        match response {
            EngineResponse::Pattern(result) => {
                let keys: Arc<[String]> = result.columns.into();
                let records = result
                    .rows
                    .into_iter()
                    .map(|values| Record {
                        keys: Arc::clone(&keys),
                        values,
                    })
                    .collect();
                Self {
                    keys,
                    records,
                    summary: ResultSummary {
                        query: query.to_string(),
                        kind: QueryKind::Pattern,
                        stats: result.stats,
                        warnings: result.warnings,
                        snapshot: result.snapshot,
                        cached: false,
                        success: result.success,
                        failure: result.failure,
                    },
                }
            }
            EngineResponse::Hybrid(result) => {
                let keys: Arc<[String]> = ["node", "score", "vector_score", "graph_score"]
                    .iter()
                    .map(|k| k.to_string())
                    .collect();
                let records = result
                    .results
                    .into_iter()
                    .map(|hit| Record {
                        keys: Arc::clone(&keys),
                        values: vec![
                            ResultValue::Node(hit.node),
                            ResultValue::Value(Value::Float(f64::from(hit.final_score))),
                            ResultValue::Value(Value::Float(f64::from(hit.vector_score))),
                            ResultValue::Value(Value::Float(f64::from(hit.graph_score))),
                        ],
                    })
                    .collect();
                Self {
                    keys,
                    records,
                    summary: ResultSummary {
                        query: query.to_string(),
                        kind: QueryKind::Hybrid,
                        stats: result.stats,
                        warnings: result.warnings,
                        snapshot: result.snapshot,
                        cached: result.cached,
                        success: result.success,
                        failure: result.failure,
                    },
                }
            }
        }
    }

    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    /// Records not yet consumed.
    pub fn remaining(&self) -> usize {
        self.records.len()
    }

    /// Why the engine stopped early, if it did.
    pub fn failure(&self) -> Option<&QueryFailure> {
        self.summary.failure.as_ref()
    }

    pub fn single(mut self) -> Option<Record> {
        match self.records.len() {
            1 => self.records.pop_front(),
            _ => None,
        }
    }

    /// Discard remaining records and return the summary.
    pub fn consume(self) -> ResultSummary {
        self.summary
    }
}

impl Iterator for RecordStream {
    type Item = Record;

    fn next(&mut self) -> Option<Record> {
        self.records.pop_front()
    }
}
