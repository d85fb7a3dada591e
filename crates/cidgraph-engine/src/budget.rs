//! Execution budgets and the scoped tracker that enforces them.
//!
//! ```text
//!   track(budgets) ──► BudgetTracker ──increment_*──► Ok | BudgetExceeded
//!                          │
//!                     drop / finish
//!                          ▼
//!                    ExecutionStats (frozen)
//! ```
//!
//! Counters are atomics so the parallel workers of one query (hybrid
//! expansion) can share a single tracker. A counter never moves past the
//! first value that exceeds its limit, so at the moment of failure every
//! counter is at most one unit of work over budget.

use crate::error::BudgetError;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use thiserror::Error;

const BUILTIN_PRESETS: &str = include_str!("../presets/budgets.json");

// ============================================================================
// Budgets
// ============================================================================

/// Resource ceilings for one execution. `None` means unbounded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionBudgets {
    pub max_nodes: Option<u64>,
    pub max_edges: Option<u64>,
    pub max_hops: Option<u64>,
    pub max_time_ms: Option<u64>,
}

impl ExecutionBudgets {
    pub fn unbounded() -> Self {
        Self::default()
    }

    pub fn with_max_nodes(mut self, limit: u64) -> Self {
        self.max_nodes = Some(limit);
        self
    }

    pub fn with_max_edges(mut self, limit: u64) -> Self {
        self.max_edges = Some(limit);
        self
    }

    pub fn with_max_hops(mut self, limit: u64) -> Self {
        self.max_hops = Some(limit);
        self
    }

    pub fn with_max_time_ms(mut self, limit: u64) -> Self {
        self.max_time_ms = Some(limit);
        self
    }

    pub fn limit(&self, dimension: BudgetDimension) -> Option<u64> {
        match dimension {
            BudgetDimension::Nodes => self.max_nodes,
            BudgetDimension::Edges => self.max_edges,
            BudgetDimension::Hops => self.max_hops,
            BudgetDimension::Time => self.max_time_ms,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BudgetDimension {
    Nodes,
    Edges,
    Hops,
    Time,
}

impl BudgetDimension {
    pub fn as_str(&self) -> &'static str {
        match self {
            BudgetDimension::Nodes => "nodes",
            BudgetDimension::Edges => "edges",
            BudgetDimension::Hops => "hops",
            BudgetDimension::Time => "time",
        }
    }
}

impl fmt::Display for BudgetDimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionCounters {
    pub nodes: u64,
    pub edges: u64,
    pub hops: u64,
    pub elapsed_ms: u64,
}

impl ExecutionCounters {
    pub fn get(&self, dimension: BudgetDimension) -> u64 {
        match dimension {
            BudgetDimension::Nodes => self.nodes,
            BudgetDimension::Edges => self.edges,
            BudgetDimension::Hops => self.hops,
            BudgetDimension::Time => self.elapsed_ms,
        }
    }
}

/// A counter went strictly past its budget.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
#[error("{dimension} budget exceeded (limit {limit}, reached {})", counters.get(*dimension))]
pub struct BudgetExceeded {
    pub dimension: BudgetDimension,
    pub limit: u64,
    pub counters: ExecutionCounters,
}

/// Final accounting for one execution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionStats {
    pub budgets: ExecutionBudgets,
    pub counters: ExecutionCounters,
    /// First dimension that tripped, if any.
    pub exceeded: Option<BudgetDimension>,
}

// ============================================================================
// Presets
// ============================================================================

/// Named budget configurations, loaded from JSON data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BudgetPresets {
    presets: BTreeMap<String, ExecutionBudgets>,
}

impl BudgetPresets {
    /// The presets shipped in `presets/budgets.json`.
    pub fn builtin() -> Result<Self, BudgetError> {
        Self::from_json(BUILTIN_PRESETS)
    }

    pub fn from_json(text: &str) -> Result<Self, BudgetError> {
        serde_json::from_str(text).map_err(|e| BudgetError::InvalidPresets(e.to_string()))
    }

    pub fn load_file(path: impl AsRef<Path>) -> Result<Self, BudgetError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| BudgetError::PresetsFile {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        Self::from_json(&text)
    }

    /// Entries of `other` replace or extend ours.
    pub fn merge(&mut self, other: BudgetPresets) {
        self.presets.extend(other.presets);
    }

    pub fn insert(&mut self, name: impl Into<String>, budgets: ExecutionBudgets) {
        self.presets.insert(name.into(), budgets);
    }

    pub fn get(&self, name: &str) -> Result<ExecutionBudgets, BudgetError> {
        self.presets
            .get(name)
            .copied()
            .ok_or_else(|| BudgetError::UnknownPreset {
                name: name.to_string(),
                available: self.names().map(str::to_string).collect(),
            })
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.presets.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.presets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.presets.is_empty()
    }
}

/// Resolve a preset by name from the built-in table only.
///
/// Presets from a `presets_file` are merged in by the engine at open time;
/// resolve those with [`UnifiedQueryEngine::budgets`] or a loaded
/// [`BudgetPresets`].
///
/// [`UnifiedQueryEngine::budgets`]: crate::UnifiedQueryEngine::budgets
pub fn budgets_from_preset(name: &str) -> Result<ExecutionBudgets, BudgetError> {
    BudgetPresets::builtin()?.get(name)
}

// ============================================================================
// Tracker
// ============================================================================

/// Start tracking an execution against `budgets`.
pub fn track(budgets: ExecutionBudgets) -> BudgetTracker {
    BudgetTracker::new(budgets)
}

/// Run `f` under a fresh tracker; stats are finalized whatever `f` returns.
pub fn track_scope<R>(
    budgets: ExecutionBudgets,
    f: impl FnOnce(&BudgetTracker) -> R,
) -> (R, ExecutionStats) {
    let tracker = track(budgets);
    let result = f(&tracker);
    (result, tracker.finish())
}

pub struct BudgetTracker {
    budgets: ExecutionBudgets,
    started: Instant,
    nodes: AtomicU64,
    edges: AtomicU64,
    hops: AtomicU64,
    exceeded: Mutex<Option<BudgetExceeded>>,
    finished: Mutex<Option<ExecutionStats>>,
}

impl BudgetTracker {
    pub fn new(budgets: ExecutionBudgets) -> Self {
        Self {
            budgets,
            started: Instant::now(),
            nodes: AtomicU64::new(0),
            edges: AtomicU64::new(0),
            hops: AtomicU64::new(0),
            exceeded: Mutex::new(None),
            finished: Mutex::new(None),
        }
    }

    pub fn budgets(&self) -> &ExecutionBudgets {
        &self.budgets
    }

    pub fn increment_nodes(&self, n: u64) -> Result<(), BudgetExceeded> {
        self.increment(&self.nodes, n, BudgetDimension::Nodes)
    }

    pub fn increment_edges(&self, n: u64) -> Result<(), BudgetExceeded> {
        self.increment(&self.edges, n, BudgetDimension::Edges)
    }

    pub fn increment_hops(&self, n: u64) -> Result<(), BudgetExceeded> {
        self.increment(&self.hops, n, BudgetDimension::Hops)
    }

    /// Raise the hop counter to `depth` if the walk has not been that deep
    /// yet. Each new depth counts as one hop.
    pub fn reach_depth(&self, depth: u64) -> Result<(), BudgetExceeded> {
        self.stop_if_tripped()?;
        let limit = self.budgets.max_hops;
        let previous = self
            .hops
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                let over = limit.is_some_and(|l| current > l);
                (current < depth && !over).then_some(current + 1)
            });
        if let (Ok(previous), Some(limit)) = (previous, limit) {
            if previous + 1 > limit {
                return Err(self.trip(BudgetDimension::Hops, limit));
            }
        }
        if let (Err(current), Some(limit)) = (previous, limit) {
            if current > limit {
                return Err(self.trip(BudgetDimension::Hops, limit));
            }
        }
        self.check_time()
    }

    /// Fail if the wall-clock budget has run out.
    pub fn check_time(&self) -> Result<(), BudgetExceeded> {
        if let Some(limit) = self.budgets.max_time_ms {
            if self.elapsed_ms() > limit {
                return Err(self.trip(BudgetDimension::Time, limit));
            }
        }
        Ok(())
    }

    /// Live counter values (frozen values once finished).
    pub fn counters(&self) -> ExecutionCounters {
        if let Some(stats) = &*self.finished.lock() {
            return stats.counters;
        }
        self.live_counters()
    }

    pub fn get_stats(&self) -> ExecutionStats {
        if let Some(stats) = &*self.finished.lock() {
            return stats.clone();
        }
        ExecutionStats {
            budgets: self.budgets,
            counters: self.live_counters(),
            exceeded: self.exceeded.lock().as_ref().map(|e| e.dimension),
        }
    }

    /// The first budget failure recorded by any worker.
    pub fn exceeded(&self) -> Option<BudgetExceeded> {
        self.exceeded.lock().clone()
    }

    /// Finalize now and return the frozen stats.
    pub fn finish(self) -> ExecutionStats {
        self.finalize()
    }

    fn increment(
        &self,
        counter: &AtomicU64,
        n: u64,
        dimension: BudgetDimension,
    ) -> Result<(), BudgetExceeded> {
        self.stop_if_tripped()?;
        let limit = self.budgets.limit(dimension);
        let previous = counter.fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
            match limit {
                Some(l) if current > l => None,
                _ => Some(current.saturating_add(n)),
            }
        });
        if let Some(limit) = limit {
            let reached = match previous {
                Ok(previous) => previous.saturating_add(n),
                Err(current) => current,
            };
            if reached > limit {
                return Err(self.trip(dimension, limit));
            }
        }
        self.check_time()
    }

    /// Once any dimension trips, every later increment fails with that error
    /// so parallel workers stop too.
    fn stop_if_tripped(&self) -> Result<(), BudgetExceeded> {
        match &*self.exceeded.lock() {
            Some(exceeded) => Err(exceeded.clone()),
            None => Ok(()),
        }
    }

    fn trip(&self, dimension: BudgetDimension, limit: u64) -> BudgetExceeded {
        let mut slot = self.exceeded.lock();
        if let Some(first) = &*slot {
            return first.clone();
        }
        let exceeded = BudgetExceeded {
            dimension,
            limit,
            counters: self.live_counters(),
        };
        tracing::warn!(
            dimension = %dimension,
            limit,
            nodes = exceeded.counters.nodes,
            edges = exceeded.counters.edges,
            hops = exceeded.counters.hops,
            elapsed_ms = exceeded.counters.elapsed_ms,
            "execution budget exceeded"
        );
        *slot = Some(exceeded.clone());
        exceeded
    }

    fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    fn live_counters(&self) -> ExecutionCounters {
        ExecutionCounters {
            nodes: self.nodes.load(Ordering::Acquire),
            edges: self.edges.load(Ordering::Acquire),
            hops: self.hops.load(Ordering::Acquire),
            elapsed_ms: self.elapsed_ms(),
        }
    }

    fn finalize(&self) -> ExecutionStats {
        let mut slot = self.finished.lock();
        if let Some(stats) = &*slot {
            return stats.clone();
        }
        let stats = ExecutionStats {
            budgets: self.budgets,
            counters: self.live_counters(),
            exceeded: self.exceeded.lock().as_ref().map(|e| e.dimension),
        };
        tracing::debug!(
            nodes = stats.counters.nodes,
            edges = stats.counters.edges,
            hops = stats.counters.hops,
            elapsed_ms = stats.counters.elapsed_ms,
            exceeded = ?stats.exceeded,
            "execution finished"
        );
        *slot = Some(stats.clone());
        stats
    }
}

impl Drop for BudgetTracker {
    fn drop(&mut self) {
        self.finalize();
    }
}
