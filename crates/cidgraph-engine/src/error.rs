//! Error types for the engine crate.

use crate::budget::BudgetExceeded;
use cidgraph_dsl::{CompileError, QuerySyntaxError};
use cidgraph_graph::GraphError;
use cidgraph_storage::StorageError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Failures reported by pluggable vector / reasoning backends.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
pub enum CollaboratorError {
    #[error("API error: {0}")]
    Api(String),

    #[error("Rate limited")]
    RateLimited,

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Network error: {0}")]
    Network(String),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BudgetError {
    #[error("unknown budget preset `{name}` (available: {})", available.join(", "))]
    UnknownPreset { name: String, available: Vec<String> },

    #[error("invalid budget presets: {0}")]
    InvalidPresets(String),

    #[error("failed to read budget presets from {path}: {message}")]
    PresetsFile { path: PathBuf, message: String },
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Budget(#[from] BudgetError),

    #[error("collaborator failed: {0}")]
    Collaborator(#[from] CollaboratorError),

    #[error("configuration error: {0}")]
    Config(String),
}

impl EngineError {
    /// The graph-level error behind this one, looking through storage.
    pub fn as_graph_error(&self) -> Option<&GraphError> {
        match self {
            EngineError::Graph(err) => Some(err),
            EngineError::Storage(err) => err.as_graph_error(),
            _ => None,
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

// ============================================================================
// Structured query failures
// ============================================================================

/// Why a query returned `success = false`. Carried inside result records
/// rather than raised, so partial rows survive alongside it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QueryFailure {
    Syntax(QuerySyntaxError),
    /// Parsed but not executable (unbound or conflicting variables).
    Semantic { message: String },
    BudgetExceeded(BudgetExceeded),
}

impl QueryFailure {
    pub fn budget(&self) -> Option<&BudgetExceeded> {
        match self {
            QueryFailure::BudgetExceeded(exceeded) => Some(exceeded),
            _ => None,
        }
    }
}

impl From<CompileError> for QueryFailure {
    fn from(err: CompileError) -> Self {
        match err {
            CompileError::Syntax(syntax) => QueryFailure::Syntax(syntax),
            other => QueryFailure::Semantic {
                message: other.to_string(),
            },
        }
    }
}

impl From<BudgetExceeded> for QueryFailure {
    fn from(err: BudgetExceeded) -> Self {
        QueryFailure::BudgetExceeded(err)
    }
}

impl fmt::Display for QueryFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryFailure::Syntax(err) => write!(f, "{err}"),
            QueryFailure::Semantic { message } => write!(f, "{message}"),
            QueryFailure::BudgetExceeded(err) => write!(f, "{err}"),
        }
    }
}
