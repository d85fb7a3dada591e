//! Hybrid vector + graph search.
//!
//! ```text
//!   query ──embed──► similarity_search ──► seeds (vector_score)
//!                          │ empty / no store
//!                          ▼
//!                    keyword seeds (vector_score = 0)
//!                          │
//!            ┌─────────────┼─────────────┐   rayon, shared tracker
//!            ▼             ▼             ▼
//!        expand(seed₁) expand(seed₂) expand(seedₙ)   graph_score = 1/(1+hops)
//!            └─────────────┼─────────────┘
//!                          ▼  barrier
//!      final = vector_weight·vector_score + graph_weight·graph_score
//!                 sort desc, id asc on ties, truncate k
//! ```

use crate::budget::{BudgetExceeded, BudgetTracker};
use crate::collaborators::{tokenize, VectorStore};
use crate::error::CollaboratorError;
use crate::executor::{expand_once, Flow};
use cidgraph_dsl::Direction;
use cidgraph_graph::{Cid, KnowledgeGraph, Node, NodeId};
use cidgraph_storage::{CacheStats, LruCache};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

// ============================================================================
// Request / result types
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HybridSearchRequest {
    pub query: String,
    pub k: usize,
    pub vector_weight: f32,
    pub graph_weight: f32,
    pub max_hops: usize,
}

impl HybridSearchRequest {
    pub fn new(query: impl Into<String>) -> Self {
        HybridDefaults::default().request(query)
    }

    pub fn with_k(mut self, k: usize) -> Self {
        self.k = k;
        self
    }

    pub fn with_weights(mut self, vector_weight: f32, graph_weight: f32) -> Self {
        self.vector_weight = vector_weight;
        self.graph_weight = graph_weight;
        self
    }

    pub fn with_max_hops(mut self, max_hops: usize) -> Self {
        self.max_hops = max_hops;
        self
    }
}

/// Default search shape; the weights sum to 1.0.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HybridDefaults {
    pub k: usize,
    pub vector_weight: f32,
    pub graph_weight: f32,
    pub max_hops: usize,
}

impl Default for HybridDefaults {
    fn default() -> Self {
        Self {
            k: 10,
            vector_weight: 0.7,
            graph_weight: 0.3,
            max_hops: 2,
        }
    }
}

impl HybridDefaults {
    pub fn request(&self, query: impl Into<String>) -> HybridSearchRequest {
        HybridSearchRequest {
            query: query.into(),
            k: self.k,
            vector_weight: self.vector_weight,
            graph_weight: self.graph_weight,
            max_hops: self.max_hops,
        }
    }
}

/// One ranked node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HybridHit {
    pub node: Node,
    pub vector_score: f32,
    pub graph_score: f32,
    pub final_score: f32,
    /// Distance to the nearest seed (0 for seeds).
    pub hops: usize,
}

impl HybridHit {
    pub fn id(&self) -> NodeId {
        self.node.id
    }
}

/// Ranked hits plus how they were produced.
#[derive(Debug, Clone, PartialEq)]
pub struct HybridOutcome {
    pub hits: Vec<HybridHit>,
    pub cached: bool,
    pub warnings: Vec<String>,
    pub exceeded: Option<BudgetExceeded>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    snapshot: Option<Cid>,
    vector_generation: u64,
    query: String,
    k: usize,
    vector_weight: u32,
    graph_weight: u32,
    max_hops: usize,
}

impl CacheKey {
    fn new(snapshot: Option<Cid>, vector_generation: u64, request: &HybridSearchRequest) -> Self {
        Self {
            snapshot,
            vector_generation,
            query: request.query.clone(),
            k: request.k,
            vector_weight: request.vector_weight.to_bits(),
            graph_weight: request.graph_weight.to_bits(),
            max_hops: request.max_hops,
        }
    }
}

// ============================================================================
// Engine
// ============================================================================

pub struct HybridSearchEngine {
    vector_store: Option<Arc<dyn VectorStore>>,
    cache: LruCache<CacheKey, Vec<HybridHit>>,
}

impl HybridSearchEngine {
    pub fn new(vector_store: Option<Arc<dyn VectorStore>>, cache_capacity: usize) -> Self {
        Self {
            vector_store,
            cache: LruCache::new(cache_capacity),
        }
    }

    pub fn has_vector_store(&self) -> bool {
        self.vector_store.is_some()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    /// Rank nodes of `graph` (the snapshot named `snapshot`) for `request`.
    ///
    /// Budget exhaustion during expansion yields the partial fusion with
    /// `exceeded` set; such results are not cached.
    pub async fn search(
        &self,
        graph: &KnowledgeGraph,
        snapshot: Option<Cid>,
        request: &HybridSearchRequest,
        tracker: &BudgetTracker,
    ) -> Result<HybridOutcome, CollaboratorError> {
        let generation = self.vector_store.as_ref().map_or(0, |store| store.generation());
        let key = CacheKey::new(snapshot, generation, request);
        if let Some(hits) = self.cache.get(&key) {
            tracing::debug!(query = %request.query, hits = hits.len(), "hybrid cache hit");
            return Ok(HybridOutcome {
                hits: (*hits).clone(),
                cached: true,
                warnings: Vec::new(),
                exceeded: None,
            });
        }

        let mut warnings = Vec::new();
        if request.k == 0 {
            return Ok(HybridOutcome {
                hits: Vec::new(),
                cached: false,
                warnings,
                exceeded: None,
            });
        }

        let mut seeds = self.vector_seeds(graph, request, &mut warnings).await?;
        if seeds.is_empty() {
            seeds = keyword_seeds(graph, &request.query, request.k);
        }

        let mut exceeded = None;
        let mut charged = Vec::with_capacity(seeds.len());
        for seed in seeds {
            if let Err(err) = tracker.increment_nodes(1) {
                exceeded = Some(err);
                break;
            }
            charged.push(seed);
        }
        let seeds = charged;

        let distances: Vec<BTreeMap<NodeId, usize>> =
            if request.graph_weight == 0.0 || exceeded.is_some() {
                seeds.iter().map(|(id, _)| BTreeMap::from([(*id, 0)])).collect()
            } else {
                let expanded: Vec<(BTreeMap<NodeId, usize>, Option<BudgetExceeded>)> = seeds
                    .par_iter()
                    .map(|(seed, _)| expand_seed(graph, tracker, *seed, request.max_hops))
                    .collect();
                let mut maps = Vec::with_capacity(expanded.len());
                for (map, err) in expanded {
                    if exceeded.is_none() {
                        exceeded = err;
                    }
                    maps.push(map);
                }
                maps
            };

        let hits = fuse(graph, request, &seeds, &distances);
        if let Some(err) = &exceeded {
            warnings.push(format!(
                "graph expansion stopped early: {err}; results are partial"
            ));
        } else {
            self.cache.insert(key, hits.clone());
        }
        tracing::debug!(
            query = %request.query,
            seeds = seeds.len(),
            hits = hits.len(),
            partial = exceeded.is_some(),
            "hybrid search finished"
        );
        Ok(HybridOutcome {
            hits,
            cached: false,
            warnings,
            exceeded,
        })
    }

    async fn vector_seeds(
        &self,
        graph: &KnowledgeGraph,
        request: &HybridSearchRequest,
        warnings: &mut Vec<String>,
    ) -> Result<Vec<(NodeId, f32)>, CollaboratorError> {
        let Some(store) = &self.vector_store else {
            return Ok(Vec::new());
        };
        let embedding = store.embed(&request.query).await?;
        let candidates = store.similarity_search(&embedding, request.k).await?;
        let mut seeds = Vec::with_capacity(candidates.len());
        for (id, score) in candidates {
            if graph.contains_node(id) {
                seeds.push((id, score));
            } else {
                warnings.push(format!("vector store returned {id}, which is not in the snapshot"));
            }
        }
        Ok(seeds)
    }
}

/// Nodes whose string properties contain any lower-cased query term, in
/// creation order, capped at `k`.
fn keyword_seeds(graph: &KnowledgeGraph, query: &str, k: usize) -> Vec<(NodeId, f32)> {
    let terms: Vec<String> = tokenize(query).collect();
    if terms.is_empty() {
        return Vec::new();
    }
    graph
        .nodes()
        .filter(|node| {
            let mut fragments = Vec::new();
            for value in node.properties.values() {
                value.text_fragments(&mut fragments);
            }
            fragments.iter().any(|fragment| {
                let fragment = fragment.to_lowercase();
                terms.iter().any(|term| fragment.contains(term.as_str()))
            })
        })
        .take(k)
        .map(|node| (node.id, 0.0))
        .collect()
}

/// Breadth-first hop distances from `seed`, both directions, up to
/// `max_hops`.
fn expand_seed(
    graph: &KnowledgeGraph,
    tracker: &BudgetTracker,
    seed: NodeId,
    max_hops: usize,
) -> (BTreeMap<NodeId, usize>, Option<BudgetExceeded>) {
    let mut distances = BTreeMap::from([(seed, 0)]);
    let mut frontier = vec![seed];
    for hop in 1..=max_hops {
        if let Err(err) = tracker.reach_depth(hop as u64) {
            return (distances, Some(err));
        }
        let mut next = Vec::new();
        for &node in &frontier {
            let step = expand_once(graph, tracker, node, Direction::Either, &[], |_, target| {
                if !distances.contains_key(&target.id) {
                    distances.insert(target.id, hop);
                    next.push(target.id);
                }
                Ok(Flow::Continue)
            });
            if let Err(err) = step {
                return (distances, Some(err));
            }
        }
        if next.is_empty() {
            break;
        }
        frontier = next;
    }
    (distances, None)
}

fn graph_score(hops: usize) -> f32 {
    1.0 / (1.0 + hops as f32)
}

fn fuse(
    graph: &KnowledgeGraph,
    request: &HybridSearchRequest,
    seeds: &[(NodeId, f32)],
    distances: &[BTreeMap<NodeId, usize>],
) -> Vec<HybridHit> {
    let expanded = request.graph_weight != 0.0;
    let vector_scores: BTreeMap<NodeId, f32> = seeds.iter().copied().collect();

    let mut nearest: BTreeMap<NodeId, usize> = BTreeMap::new();
    for map in distances {
        for (id, hops) in map {
            nearest
                .entry(*id)
                .and_modify(|h| *h = (*h).min(*hops))
                .or_insert(*hops);
        }
    }

    let mut hits: Vec<HybridHit> = nearest
        .into_iter()
        .filter_map(|(id, hops)| {
            let node = graph.node(id)?.clone();
            let vector_score = vector_scores.get(&id).copied().unwrap_or(0.0);
            let graph_score = if expanded { graph_score(hops) } else { 0.0 };
            Some(HybridHit {
                node,
                vector_score,
                graph_score,
                final_score: request.vector_weight * vector_score
                    + request.graph_weight * graph_score,
                hops,
            })
        })
        .collect();
    hits.sort_by(|a, b| {
        b.final_score
            .total_cmp(&a.final_score)
            .then(a.node.id.cmp(&b.node.id))
    });
    hits.truncate(request.k);
    hits
}
