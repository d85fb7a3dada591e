//! Pluggable backends: vector similarity and LLM reasoning.
//!
//! The engine only ever talks to these traits. Concrete backends are injected
//! at construction; leaving one out is a valid configuration.

use crate::error::CollaboratorError;
use async_trait::async_trait;
use cidgraph_graph::{KnowledgeGraph, Node, NodeId};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Embed query text into the store's vector space.
    async fn embed(&self, text: &str) -> Result<Vec<f32>, CollaboratorError>;

    /// Up to `k` nearest nodes, best first.
    async fn similarity_search(
        &self,
        query: &[f32],
        k: usize,
    ) -> Result<Vec<(NodeId, f32)>, CollaboratorError>;

    /// Changes whenever the indexed vectors change. Cached hybrid results are
    /// keyed by it; a store whose contents never change can keep the default.
    fn generation(&self) -> u64 {
        0
    }
}

#[async_trait]
pub trait Reasoner: Send + Sync {
    async fn reason(&self, question: &str, context: &str) -> Result<String, CollaboratorError>;
}

/// Text to vector, used by [`InMemoryVectorStore`].
pub trait Embedder: Send + Sync {
    fn dimension(&self) -> usize;
    fn embed(&self, text: &str) -> Vec<f32>;
}

// ============================================================================
// Hashing embedder
// ============================================================================

/// Deterministic signed feature hashing over lower-cased word tokens,
/// L2-normalized. No model, no network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HashingEmbedder {
    dimension: usize,
}

impl HashingEmbedder {
    pub const DEFAULT_DIMENSION: usize = 128;

    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
        }
    }
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new(Self::DEFAULT_DIMENSION)
    }
}

impl Embedder for HashingEmbedder {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn embed(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dimension];
        for token in tokenize(text) {
            let h = fnv1a64(&token);
            let idx = (h % self.dimension as u64) as usize;
            let sign = if (h >> 32) & 1 == 0 { 1.0 } else { -1.0 };
            v[idx] += sign;
        }
        normalize(&mut v);
        v
    }
}

/// Lower-cased alphanumeric runs.
pub fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
}

fn fnv1a64(s: &str) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for b in s.as_bytes() {
        hash ^= u64::from(*b);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

fn normalize(v: &mut [f32]) {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        v.iter_mut().for_each(|x| *x /= norm);
    }
}

/// Cosine similarity; 0 when either vector is all zeros.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        0.0
    } else {
        dot / (na * nb)
    }
}

// ============================================================================
// In-memory vector store
// ============================================================================

/// Brute-force cosine search over registered node vectors.
pub struct InMemoryVectorStore {
    embedder: Arc<dyn Embedder>,
    vectors: RwLock<BTreeMap<NodeId, Vec<f32>>>,
    generation: AtomicU64,
}

impl InMemoryVectorStore {
    pub fn new(embedder: Arc<dyn Embedder>) -> Self {
        Self {
            embedder,
            vectors: RwLock::new(BTreeMap::new()),
            generation: AtomicU64::new(0),
        }
    }

    pub fn with_hashing_embedder() -> Self {
        Self::new(Arc::new(HashingEmbedder::default()))
    }

    pub fn len(&self) -> usize {
        self.vectors.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Register a precomputed vector for `node`.
    pub fn upsert(&self, node: NodeId, vector: Vec<f32>) -> Result<(), CollaboratorError> {
        let expected = self.embedder.dimension();
        if vector.len() != expected {
            return Err(CollaboratorError::DimensionMismatch {
                expected,
                actual: vector.len(),
            });
        }
        self.vectors.write().insert(node, vector);
        self.generation.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Embed `text` and register it for `node`.
    pub fn index_text(&self, node: NodeId, text: &str) {
        let vector = self.embedder.embed(text);
        self.vectors.write().insert(node, vector);
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    /// Index every node of `graph` by its labels and string properties.
    pub fn index_graph(&self, graph: &KnowledgeGraph) {
        for node in graph.nodes() {
            self.index_text(node.id, &node_text(node));
        }
        tracing::debug!(nodes = graph.node_count(), "vector index rebuilt from graph");
    }

    pub fn remove(&self, node: NodeId) -> bool {
        let removed = self.vectors.write().remove(&node).is_some();
        if removed {
            self.generation.fetch_add(1, Ordering::AcqRel);
        }
        removed
    }
}

/// Searchable text for a node: labels followed by its string property values.
pub fn node_text(node: &Node) -> String {
    let mut parts: Vec<&str> = node.labels.iter().map(String::as_str).collect();
    for value in node.properties.values() {
        value.text_fragments(&mut parts);
    }
    parts.join(" ")
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, CollaboratorError> {
        Ok(self.embedder.embed(text))
    }

    async fn similarity_search(
        &self,
        query: &[f32],
        k: usize,
    ) -> Result<Vec<(NodeId, f32)>, CollaboratorError> {
        let expected = self.embedder.dimension();
        if query.len() != expected {
            return Err(CollaboratorError::DimensionMismatch {
                expected,
                actual: query.len(),
            });
        }
        let mut scored: Vec<(NodeId, f32)> = self
            .vectors
            .read()
            .iter()
            .map(|(id, v)| (*id, cosine_similarity(query, v)))
            .filter(|(_, score)| *score > 0.0)
            .collect();
        scored.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        scored.truncate(k);
        Ok(scored)
    }

    fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use cidgraph_graph::props;

    #[test]
    fn hashing_embedder_is_deterministic_and_normalized() {
        let e = HashingEmbedder::default();
        let a = e.embed("graph databases are fun");
        let b = e.embed("Graph   DATABASES are fun!");
        assert_eq!(a, b);
        let single = e.embed("graph");
        let norm: f32 = single.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert_relative_eq!(norm, 1.0, epsilon = 1e-5);
        assert!(e.embed("").iter().all(|x| *x == 0.0));
    }

    #[test]
    fn cosine_of_orthogonal_and_equal() {
        assert_relative_eq!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]), 0.0);
        assert_relative_eq!(cosine_similarity(&[2.0, 2.0], &[1.0, 1.0]), 1.0, epsilon = 1e-6);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
    }

    #[tokio::test]
    async fn in_memory_store_ranks_by_cosine() {
        let store = InMemoryVectorStore::new(Arc::new(HashingEmbedder::new(3)));
        store.upsert(NodeId::new(0), vec![1.0, 0.0, 0.0]).unwrap();
        store.upsert(NodeId::new(1), vec![0.0, 1.0, 0.0]).unwrap();
        store.upsert(NodeId::new(2), vec![0.8, 0.6, 0.0]).unwrap();

        let hits = store.similarity_search(&[1.0, 0.0, 0.0], 5).await.unwrap();
        let ids: Vec<NodeId> = hits.iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, vec![NodeId::new(0), NodeId::new(2)]);
        assert_relative_eq!(hits[1].1, 0.8, epsilon = 1e-6);

        let top1 = store.similarity_search(&[1.0, 0.0, 0.0], 1).await.unwrap();
        assert_eq!(top1.len(), 1);
    }

    #[tokio::test]
    async fn indexed_text_is_found_by_its_own_words() {
        let store = InMemoryVectorStore::with_hashing_embedder();
        store.index_text(NodeId::new(7), "alice");
        let q = store.embed("Alice").await.unwrap();
        let hits = store.similarity_search(&q, 3).await.unwrap();
        assert_eq!(hits[0].0, NodeId::new(7));
        assert_relative_eq!(hits[0].1, 1.0, epsilon = 1e-5);
    }

    #[tokio::test]
    async fn dimension_mismatch_is_reported() {
        let store = InMemoryVectorStore::new(Arc::new(HashingEmbedder::new(8)));
        assert!(matches!(
            store.upsert(NodeId::new(0), vec![1.0; 3]),
            Err(CollaboratorError::DimensionMismatch { expected: 8, actual: 3 })
        ));
        assert!(store.similarity_search(&[1.0; 4], 1).await.is_err());
    }

    #[test]
    fn node_text_includes_labels_and_strings() {
        let mut g = KnowledgeGraph::new();
        let n = g.create_node(["Person"], props([("name", "Alice")])).unwrap();
        let text = node_text(&n);
        assert!(text.contains("Person"));
        assert!(text.contains("Alice"));
    }
}
