//! Canonical snapshot blocks.
//!
//! A snapshot is a small Merkle-DAG:
//!
//! ```text
//! SnapshotRootV1 ──► NodeBatchV1 (ids 0..512)
//!                ├─► NodeBatchV1 (ids 512..1024)
//!                └─► RelationshipBatchV1 ...
//! ```
//!
//! Every block is CBOR. Nodes and relationships are emitted in ascending id
//! order and every map/set is sorted, so two graphs with equal content encode
//! to identical bytes regardless of the order they were built in. The root
//! also carries the id counters, which decoding restores.

use crate::cid::{Cid, Codec};
use crate::{GraphError, KnowledgeGraph, Node, NodeId, RelId, Relationship};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const SNAPSHOT_FORMAT_V1: &str = "cidgraph_snapshot_v1";

/// Records per batch block. Part of the encoding: changing it changes CIDs.
pub const SNAPSHOT_BATCH_SIZE: usize = 512;

// ============================================================================
// Block schemas
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotRootV1 {
    pub format: String,
    pub node_count: u64,
    pub relationship_count: u64,
    pub node_batches: Vec<Cid>,
    pub relationship_batches: Vec<Cid>,
    /// Id allocator state. Kept so ids freed by deletes are never reissued.
    #[serde(default)]
    pub next_node_id: u32,
    #[serde(default)]
    pub next_relationship_id: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeBatchV1 {
    pub nodes: Vec<Node>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationshipBatchV1 {
    pub relationships: Vec<Relationship>,
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("CBOR encode failed: {0}")]
    Encode(String),
    #[error("CBOR decode failed: {0}")]
    Decode(String),
    #[error("unsupported snapshot format `{0}`")]
    UnsupportedFormat(String),
    #[error("snapshot count mismatch: root declares {declared} {kind}, batches hold {actual}")]
    CountMismatch {
        kind: &'static str,
        declared: u64,
        actual: u64,
    },
    #[error(transparent)]
    Graph(#[from] GraphError),
}

// ============================================================================
// Encoding
// ============================================================================

pub fn encode_cbor<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
    let mut out = Vec::new();
    ciborium::into_writer(value, &mut out).map_err(|e| CodecError::Encode(e.to_string()))?;
    Ok(out)
}

pub fn decode_cbor<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    ciborium::from_reader(bytes).map_err(|e| CodecError::Decode(e.to_string()))
}

/// One encoded block and its address.
#[derive(Debug, Clone)]
pub struct EncodedBlock {
    pub cid: Cid,
    pub bytes: Vec<u8>,
}

impl EncodedBlock {
    fn dag_cbor<T: Serialize>(value: &T) -> Result<Self, CodecError> {
        let bytes = encode_cbor(value)?;
        Ok(Self {
            cid: Cid::for_bytes(Codec::DagCbor, &bytes),
            bytes,
        })
    }
}

/// All blocks of a snapshot. `batches` come before `root` in write order so
/// the root never links a block that is not yet stored.
#[derive(Debug, Clone)]
pub struct EncodedSnapshot {
    pub root: EncodedBlock,
    pub batches: Vec<EncodedBlock>,
}

impl EncodedSnapshot {
    pub fn cid(&self) -> Cid {
        self.root.cid
    }
}

/// Encode `graph` into canonical blocks. Pure: no I/O.
pub fn encode_snapshot(graph: &KnowledgeGraph) -> Result<EncodedSnapshot, CodecError> {
    let nodes: Vec<&Node> = graph.nodes().collect();
    let rels: Vec<&Relationship> = graph.relationships().collect();

    let mut batches = Vec::new();
    let mut node_batches = Vec::new();
    for chunk in nodes.chunks(SNAPSHOT_BATCH_SIZE) {
        let block = EncodedBlock::dag_cbor(&NodeBatchRef { nodes: chunk })?;
        node_batches.push(block.cid);
        batches.push(block);
    }
    let mut relationship_batches = Vec::new();
    for chunk in rels.chunks(SNAPSHOT_BATCH_SIZE) {
        let block = EncodedBlock::dag_cbor(&RelationshipBatchRef {
            relationships: chunk,
        })?;
        relationship_batches.push(block.cid);
        batches.push(block);
    }

    let root = SnapshotRootV1 {
        format: SNAPSHOT_FORMAT_V1.to_string(),
        node_count: nodes.len() as u64,
        relationship_count: rels.len() as u64,
        node_batches,
        relationship_batches,
        next_node_id: graph.next_node_id().raw(),
        next_relationship_id: graph.next_relationship_id().raw(),
    };
    Ok(EncodedSnapshot {
        root: EncodedBlock::dag_cbor(&root)?,
        batches,
    })
}

/// CID `graph` would be stored under.
pub fn snapshot_cid(graph: &KnowledgeGraph) -> Result<Cid, CodecError> {
    Ok(encode_snapshot(graph)?.cid())
}

// Borrowing twins of the batch schemas; they serialize identically.
#[derive(Serialize)]
struct NodeBatchRef<'a> {
    nodes: &'a [&'a Node],
}

#[derive(Serialize)]
struct RelationshipBatchRef<'a> {
    relationships: &'a [&'a Relationship],
}

// ============================================================================
// Decoding
// ============================================================================

pub fn decode_root(bytes: &[u8]) -> Result<SnapshotRootV1, CodecError> {
    let root: SnapshotRootV1 = decode_cbor(bytes)?;
    if root.format != SNAPSHOT_FORMAT_V1 {
        return Err(CodecError::UnsupportedFormat(root.format));
    }
    Ok(root)
}

/// Rebuild a graph (indexes included) from a root and its decoded batches.
pub fn assemble_snapshot(
    root: &SnapshotRootV1,
    node_batches: Vec<NodeBatchV1>,
    relationship_batches: Vec<RelationshipBatchV1>,
) -> Result<KnowledgeGraph, CodecError> {
    let nodes: Vec<Node> = node_batches.into_iter().flat_map(|b| b.nodes).collect();
    let rels: Vec<Relationship> = relationship_batches
        .into_iter()
        .flat_map(|b| b.relationships)
        .collect();

    check_count("nodes", root.node_count, nodes.len())?;
    check_count("relationships", root.relationship_count, rels.len())?;

    let mut graph = KnowledgeGraph::from_parts(nodes, rels)?;
    graph.reserve_ids(
        NodeId::new(root.next_node_id),
        RelId::new(root.next_relationship_id),
    );
    Ok(graph)
}

fn check_count(kind: &'static str, declared: u64, actual: usize) -> Result<(), CodecError> {
    if declared != actual as u64 {
        return Err(CodecError::CountMismatch {
            kind,
            declared,
            actual: actual as u64,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{props, Properties, Value};

    fn sample() -> KnowledgeGraph {
        let mut g = KnowledgeGraph::new();
        let a = g.create_node(["Person"], props([("name", "Alice")])).unwrap();
        let b = g.create_node(["Person", "Admin"], props([("age", Value::Int(41))])).unwrap();
        g.create_relationship("KNOWS", a.id, b.id, props([("since", 2019)]))
            .unwrap();
        g
    }

    #[test]
    fn encode_decode_preserves_content() {
        let g = sample();
        let encoded = encode_snapshot(&g).unwrap();
        let root = decode_root(&encoded.root.bytes).unwrap();
        assert_eq!(root.node_batches.len(), 1);
        assert_eq!(root.relationship_batches.len(), 1);

        let nodes: NodeBatchV1 = decode_cbor(&encoded.batches[0].bytes).unwrap();
        let rels: RelationshipBatchV1 = decode_cbor(&encoded.batches[1].bytes).unwrap();
        let back = assemble_snapshot(&root, vec![nodes], vec![rels]).unwrap();
        assert_eq!(back, g);
        assert_eq!(back.label_counts().get("Person"), Some(&2));
    }

    #[test]
    fn empty_graph_has_stable_cid() {
        let a = snapshot_cid(&KnowledgeGraph::new()).unwrap();
        let b = snapshot_cid(&KnowledgeGraph::new()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn large_graph_splits_into_batches() {
        let mut g = KnowledgeGraph::new();
        for i in 0..(SNAPSHOT_BATCH_SIZE + 3) {
            g.create_node(["N"], props([("i", i as i64)])).unwrap();
        }
        let encoded = encode_snapshot(&g).unwrap();
        let root = decode_root(&encoded.root.bytes).unwrap();
        assert_eq!(root.node_batches.len(), 2);
        assert!(root.relationship_batches.is_empty());
    }

    #[test]
    fn count_mismatch_is_rejected() {
        let root = SnapshotRootV1 {
            format: SNAPSHOT_FORMAT_V1.to_string(),
            node_count: 2,
            relationship_count: 0,
            node_batches: vec![],
            relationship_batches: vec![],
            next_node_id: 0,
            next_relationship_id: 0,
        };
        let err = assemble_snapshot(&root, vec![], vec![]).unwrap_err();
        assert!(matches!(err, CodecError::CountMismatch { kind: "nodes", .. }));
    }

    #[test]
    fn unknown_format_is_rejected() {
        let root = SnapshotRootV1 {
            format: "other".into(),
            node_count: 0,
            relationship_count: 0,
            node_batches: vec![],
            relationship_batches: vec![],
            next_node_id: 0,
            next_relationship_id: 0,
        };
        let bytes = encode_cbor(&root).unwrap();
        assert!(matches!(
            decode_root(&bytes),
            Err(CodecError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn id_counters_survive_decode_after_delete() {
        let mut g = sample();
        let extra = g.create_node(["Temp"], Properties::new()).unwrap();
        g.delete_node(extra.id, false).unwrap();
        assert_eq!(g.next_node_id(), NodeId::new(3));

        let encoded = encode_snapshot(&g).unwrap();
        let root = decode_root(&encoded.root.bytes).unwrap();
        assert_eq!(root.next_node_id, 3);
        assert_eq!(root.next_relationship_id, 1);

        let nodes: NodeBatchV1 = decode_cbor(&encoded.batches[0].bytes).unwrap();
        let rels: RelationshipBatchV1 = decode_cbor(&encoded.batches[1].bytes).unwrap();
        let mut back = assemble_snapshot(&root, vec![nodes], vec![rels]).unwrap();
        assert_eq!(back.next_node_id(), NodeId::new(3));
        assert_eq!(back, g);
        assert_eq!(back.create_node(["N"], Properties::new()).unwrap().id, NodeId::new(3));
    }

    #[test]
    fn allocator_state_is_part_of_the_cid() {
        let mut fresh = KnowledgeGraph::new();
        fresh.create_node(["Person"], Properties::new()).unwrap();

        let mut churned = KnowledgeGraph::new();
        churned.create_node(["Person"], Properties::new()).unwrap();
        let gone = churned.create_node(["Person"], Properties::new()).unwrap();
        churned.delete_node(gone.id, false).unwrap();

        assert_ne!(fresh, churned);
        assert_ne!(snapshot_cid(&fresh).unwrap(), snapshot_cid(&churned).unwrap());
    }
}
