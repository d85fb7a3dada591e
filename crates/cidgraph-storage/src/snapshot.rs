//! Snapshot store: graphs in, CIDs out.
//!
//! `store` writes every batch block and then the root block that links them;
//! `retrieve` walks the DAG back into a `KnowledgeGraph` with rebuilt indexes.
//! Decoded snapshots are kept in an LRU since a snapshot never changes once
//! stored.

use crate::block::BlockStore;
use crate::cache::{CacheStats, LruCache};
use crate::error::StorageResult;
use cidgraph_graph::codec::{assemble_snapshot, decode_cbor, decode_root, encode_snapshot};
use cidgraph_graph::{Cid, KnowledgeGraph, NodeBatchV1, RelationshipBatchV1};
use std::sync::Arc;

pub struct SnapshotStore {
    blocks: Arc<dyn BlockStore>,
    snapshots: LruCache<Cid, KnowledgeGraph>,
}

impl SnapshotStore {
    pub fn new(blocks: Arc<dyn BlockStore>, snapshot_cache_capacity: usize) -> Self {
        Self {
            blocks,
            snapshots: LruCache::new(snapshot_cache_capacity),
        }
    }

    pub fn blocks(&self) -> &Arc<dyn BlockStore> {
        &self.blocks
    }

    /// Store `graph` and return its CID. Equal content always yields the same
    /// CID; already-present blocks are not rewritten.
    pub async fn store(&self, graph: &KnowledgeGraph) -> StorageResult<Cid> {
        self.store_shared(Arc::new(graph.clone())).await
    }

    /// Like [`store`](Self::store) but keeps `graph` itself as the cached
    /// decoded snapshot.
    pub async fn store_shared(&self, graph: Arc<KnowledgeGraph>) -> StorageResult<Cid> {
        let encoded = encode_snapshot(&graph)?;
        let cid = encoded.cid();
        let block_count = encoded.batches.len() + 1;

        for block in encoded.batches {
            self.blocks.put_encoded(block).await?;
        }
        self.blocks.put_encoded(encoded.root).await?;

        tracing::debug!(
            %cid,
            nodes = graph.node_count(),
            relationships = graph.relationship_count(),
            blocks = block_count,
            "snapshot stored"
        );
        self.snapshots.insert_arc(cid, graph);
        Ok(cid)
    }

    /// Load the snapshot addressed by `cid`. Unknown CIDs are
    /// `StorageError::NotFound`, never an empty graph.
    pub async fn retrieve(&self, cid: &Cid) -> StorageResult<Arc<KnowledgeGraph>> {
        if let Some(graph) = self.snapshots.get(cid) {
            return Ok(graph);
        }

        let root_bytes = self.blocks.get(cid).await?;
        let root = decode_root(&root_bytes)?;

        let mut node_batches = Vec::with_capacity(root.node_batches.len());
        for batch_cid in &root.node_batches {
            let bytes = self.blocks.get(batch_cid).await?;
            node_batches.push(decode_cbor::<NodeBatchV1>(&bytes)?);
        }
        let mut relationship_batches = Vec::with_capacity(root.relationship_batches.len());
        for batch_cid in &root.relationship_batches {
            let bytes = self.blocks.get(batch_cid).await?;
            relationship_batches.push(decode_cbor::<RelationshipBatchV1>(&bytes)?);
        }

        let graph = assemble_snapshot(&root, node_batches, relationship_batches)?;
        tracing::debug!(
            %cid,
            nodes = graph.node_count(),
            relationships = graph.relationship_count(),
            "snapshot decoded"
        );
        Ok(self.snapshots.insert(*cid, graph))
    }

    pub async fn contains(&self, cid: &Cid) -> StorageResult<bool> {
        if self.snapshots.contains(cid) {
            return Ok(true);
        }
        self.blocks.has(cid).await
    }

    /// Drop decoded snapshots; blocks are untouched.
    pub fn clear_cache(&self) {
        self.snapshots.clear();
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.snapshots.stats()
    }
}
