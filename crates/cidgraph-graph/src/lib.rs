//! Cidgraph graph data model
//!
//! Nodes and relationships live in an arena keyed by integer ids, never as
//! object references, so cycles need no special handling in traversal or
//! storage.
//!
//! Key properties:
//! 1. **Monotonic ids**: creation order equals ascending id order, which is the
//!    iteration order of every read API.
//! 2. **Bitmap label index**: conjunctive label filters are roaring-bitmap
//!    intersections.
//! 3. **Adjacency in creation order**: `outgoing`/`incoming` yield
//!    relationships in the order they were created.
//! 4. **Content identity**: a graph's CID is derived from its nodes,
//!    relationships and id counters (see [`codec`]); indexes are derived
//!    state. Ids freed by deletes are never handed out again.
//!
//! A `KnowledgeGraph` is a mutable working copy. Once stored it becomes an
//! immutable snapshot; later changes always produce a new snapshot.

pub mod cid;
pub mod codec;
pub mod value;

use roaring::RoaringBitmap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use thiserror::Error;

pub use cid::{Cid, CidParseError, Codec};
pub use codec::{
    assemble_snapshot, decode_root, encode_snapshot, snapshot_cid, CodecError, EncodedBlock,
    EncodedSnapshot, NodeBatchV1, RelationshipBatchV1, SnapshotRootV1, SNAPSHOT_BATCH_SIZE,
    SNAPSHOT_FORMAT_V1,
};
pub use value::{props, Properties, Value};

// ============================================================================
// Identifiers
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(u32);

impl NodeId {
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RelId(u32);

impl RelId {
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }
}

impl fmt::Display for RelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

// ============================================================================
// Records
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub labels: BTreeSet<String>,
    pub properties: Properties,
}

impl Node {
    pub fn has_label(&self, label: &str) -> bool {
        self.labels.contains(label)
    }

    pub fn property(&self, key: &str) -> Option<&Value> {
        self.properties.get(key)
    }

    /// Exact-match check for every `(key, value)` in `filter`.
    pub fn matches_properties(&self, filter: &Properties) -> bool {
        filter
            .iter()
            .all(|(k, v)| self.properties.get(k).is_some_and(|actual| actual.loose_eq(v)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Relationship {
    pub id: RelId,
    pub rel_type: String,
    pub start: NodeId,
    pub end: NodeId,
    pub properties: Properties,
}

impl Relationship {
    /// The endpoint opposite `node`, if `node` is one of the endpoints.
    pub fn other_end(&self, node: NodeId) -> Option<NodeId> {
        if self.start == node {
            Some(self.end)
        } else if self.end == node {
            Some(self.start)
        } else {
            None
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error(
        "referential integrity: relationship `{rel_type}` ({start} -> {end}) references missing node {missing}"
    )]
    ReferentialIntegrity {
        rel_type: String,
        start: NodeId,
        end: NodeId,
        missing: NodeId,
    },
    #[error("node {0} not found")]
    NodeNotFound(NodeId),
    #[error("relationship {0} not found")]
    RelationshipNotFound(RelId),
    #[error("node {id} still has {count} relationship(s); delete with detach")]
    NodeHasRelationships { id: NodeId, count: usize },
    #[error("node id {0} already exists")]
    DuplicateNode(NodeId),
    #[error("relationship id {0} already exists")]
    DuplicateRelationship(RelId),
    #[error("{0} id space exhausted")]
    IdSpaceExhausted(&'static str),
}

// ============================================================================
// KnowledgeGraph
// ============================================================================

/// Arena-backed property graph.
#[derive(Debug, Clone, Default)]
pub struct KnowledgeGraph {
    nodes: BTreeMap<NodeId, Node>,
    relationships: BTreeMap<RelId, Relationship>,
    next_node_id: u32,
    next_rel_id: u32,
    /// label -> bitmap of node ids
    label_index: HashMap<String, RoaringBitmap>,
    /// node -> outgoing relationship ids (creation order)
    outgoing: HashMap<NodeId, Vec<RelId>>,
    /// node -> incoming relationship ids (creation order)
    incoming: HashMap<NodeId, Vec<RelId>>,
}

impl PartialEq for KnowledgeGraph {
    fn eq(&self, other: &Self) -> bool {
        self.nodes == other.nodes
            && self.relationships == other.relationships
            && self.next_node_id == other.next_node_id
            && self.next_rel_id == other.next_rel_id
    }
}

impl KnowledgeGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a graph from decoded records, validating endpoints.
    pub fn from_parts(
        nodes: impl IntoIterator<Item = Node>,
        relationships: impl IntoIterator<Item = Relationship>,
    ) -> Result<Self, GraphError> {
        let mut graph = Self::new();
        for node in nodes {
            graph.insert_node(node)?;
        }
        for rel in relationships {
            graph.insert_relationship(rel)?;
        }
        Ok(graph)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn relationship_count(&self) -> usize {
        self.relationships.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.relationships.is_empty()
    }

    /// Next id `create_node` would hand out.
    pub fn next_node_id(&self) -> NodeId {
        NodeId(self.next_node_id)
    }

    /// Next id `create_relationship` would hand out.
    pub fn next_relationship_id(&self) -> RelId {
        RelId(self.next_rel_id)
    }

    /// Raise the id counters to at least `next_node` / `next_rel`. Ids freed
    /// by deletes stay retired once the counters are restored.
    pub fn reserve_ids(&mut self, next_node: NodeId, next_rel: RelId) {
        self.next_node_id = self.next_node_id.max(next_node.0);
        self.next_rel_id = self.next_rel_id.max(next_rel.0);
    }

    // ------------------------------------------------------------------------
    // Mutation
    // ------------------------------------------------------------------------

    /// Create a node with a fresh id.
    pub fn create_node<L, S>(
        &mut self,
        labels: L,
        properties: Properties,
    ) -> Result<Node, GraphError>
    where
        L: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let id = NodeId(self.next_node_id);
        // The counter saturates at u32::MAX, so a taken id means no fresh one is left.
        if self.nodes.contains_key(&id) {
            return Err(GraphError::IdSpaceExhausted("node"));
        }
        let node = Node {
            id,
            labels: labels.into_iter().map(Into::into).collect(),
            properties,
        };
        self.insert_node(node.clone())?;
        Ok(node)
    }

    /// Create a relationship between two existing nodes.
    pub fn create_relationship(
        &mut self,
        rel_type: impl Into<String>,
        start: NodeId,
        end: NodeId,
        properties: Properties,
    ) -> Result<Relationship, GraphError> {
        let id = RelId(self.next_rel_id);
        if self.relationships.contains_key(&id) {
            return Err(GraphError::IdSpaceExhausted("relationship"));
        }
        let rel = Relationship {
            id,
            rel_type: rel_type.into(),
            start,
            end,
            properties,
        };
        self.insert_relationship(rel.clone())?;
        Ok(rel)
    }

    /// Insert a node with a caller-chosen id (used by snapshot decode and
    /// transaction replay). Bumps the id counter past `node.id`.
    pub fn insert_node(&mut self, node: Node) -> Result<(), GraphError> {
        if self.nodes.contains_key(&node.id) {
            return Err(GraphError::DuplicateNode(node.id));
        }
        let id = node.id;
        for label in &node.labels {
            self.label_index
                .entry(label.clone())
                .or_insert_with(RoaringBitmap::new)
                .insert(id.0);
        }
        self.next_node_id = self.next_node_id.max(id.0.saturating_add(1));
        self.nodes.insert(id, node);
        Ok(())
    }

    /// Insert a relationship with a caller-chosen id. Both endpoints must exist.
    pub fn insert_relationship(&mut self, rel: Relationship) -> Result<(), GraphError> {
        if self.relationships.contains_key(&rel.id) {
            return Err(GraphError::DuplicateRelationship(rel.id));
        }
        for endpoint in [rel.start, rel.end] {
            if !self.nodes.contains_key(&endpoint) {
                return Err(GraphError::ReferentialIntegrity {
                    rel_type: rel.rel_type.clone(),
                    start: rel.start,
                    end: rel.end,
                    missing: endpoint,
                });
            }
        }
        let id = rel.id;
        insert_sorted(self.outgoing.entry(rel.start).or_default(), id);
        insert_sorted(self.incoming.entry(rel.end).or_default(), id);
        self.next_rel_id = self.next_rel_id.max(id.0.saturating_add(1));
        self.relationships.insert(id, rel);
        Ok(())
    }

    /// Delete a node. With `detach`, its relationships are deleted first;
    /// otherwise a node that still has relationships is refused.
    pub fn delete_node(&mut self, id: NodeId, detach: bool) -> Result<Node, GraphError> {
        if !self.nodes.contains_key(&id) {
            return Err(GraphError::NodeNotFound(id));
        }
        let attached: Vec<RelId> = self.attached_relationship_ids(id);
        if !attached.is_empty() {
            if !detach {
                return Err(GraphError::NodeHasRelationships {
                    id,
                    count: attached.len(),
                });
            }
            for rel_id in attached {
                self.delete_relationship(rel_id)?;
            }
        }

        let node = self.nodes.remove(&id).ok_or(GraphError::NodeNotFound(id))?;
        for label in &node.labels {
            if let Some(bitmap) = self.label_index.get_mut(label) {
                bitmap.remove(id.0);
                if bitmap.is_empty() {
                    self.label_index.remove(label);
                }
            }
        }
        self.outgoing.remove(&id);
        self.incoming.remove(&id);
        Ok(node)
    }

    pub fn delete_relationship(&mut self, id: RelId) -> Result<Relationship, GraphError> {
        let rel = self
            .relationships
            .remove(&id)
            .ok_or(GraphError::RelationshipNotFound(id))?;
        if let Some(ids) = self.outgoing.get_mut(&rel.start) {
            ids.retain(|r| *r != id);
        }
        if let Some(ids) = self.incoming.get_mut(&rel.end) {
            ids.retain(|r| *r != id);
        }
        Ok(rel)
    }

    pub fn set_node_property(
        &mut self,
        id: NodeId,
        key: impl Into<String>,
        value: Value,
    ) -> Result<(), GraphError> {
        let node = self.nodes.get_mut(&id).ok_or(GraphError::NodeNotFound(id))?;
        node.properties.insert(key.into(), value);
        Ok(())
    }

    pub fn remove_node_property(&mut self, id: NodeId, key: &str) -> Result<Option<Value>, GraphError> {
        let node = self.nodes.get_mut(&id).ok_or(GraphError::NodeNotFound(id))?;
        Ok(node.properties.remove(key))
    }

    pub fn set_relationship_property(
        &mut self,
        id: RelId,
        key: impl Into<String>,
        value: Value,
    ) -> Result<(), GraphError> {
        let rel = self
            .relationships
            .get_mut(&id)
            .ok_or(GraphError::RelationshipNotFound(id))?;
        rel.properties.insert(key.into(), value);
        Ok(())
    }

    pub fn add_label(&mut self, id: NodeId, label: impl Into<String>) -> Result<(), GraphError> {
        let node = self.nodes.get_mut(&id).ok_or(GraphError::NodeNotFound(id))?;
        let label = label.into();
        self.label_index
            .entry(label.clone())
            .or_insert_with(RoaringBitmap::new)
            .insert(id.0);
        node.labels.insert(label);
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------------

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(&id)
    }

    pub fn relationship(&self, id: RelId) -> Option<&Relationship> {
        self.relationships.get(&id)
    }

    pub fn contains_node(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    /// All nodes in creation order.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    /// All relationships in creation order.
    pub fn relationships(&self) -> impl Iterator<Item = &Relationship> {
        self.relationships.values()
    }

    /// Outgoing relationships of `id` in creation order.
    pub fn outgoing(&self, id: NodeId) -> impl Iterator<Item = &Relationship> {
        self.adjacent(&self.outgoing, id)
    }

    /// Incoming relationships of `id` in creation order.
    pub fn incoming(&self, id: NodeId) -> impl Iterator<Item = &Relationship> {
        self.adjacent(&self.incoming, id)
    }

    /// Outgoing and incoming relationships of `id`, merged in creation order.
    ///
    /// A self-loop is reported once.
    pub fn relationships_of(&self, id: NodeId) -> Vec<&Relationship> {
        self.attached_relationship_ids(id)
            .into_iter()
            .filter_map(|rel_id| self.relationships.get(&rel_id))
            .collect()
    }

    fn adjacent<'a>(
        &'a self,
        index: &'a HashMap<NodeId, Vec<RelId>>,
        id: NodeId,
    ) -> impl Iterator<Item = &'a Relationship> + 'a {
        index
            .get(&id)
            .map(|ids| ids.as_slice())
            .unwrap_or(&[])
            .iter()
            .filter_map(move |rel_id| self.relationships.get(rel_id))
    }

    fn attached_relationship_ids(&self, id: NodeId) -> Vec<RelId> {
        let mut ids: Vec<RelId> = Vec::new();
        if let Some(out) = self.outgoing.get(&id) {
            ids.extend(out.iter().copied());
        }
        if let Some(inc) = self.incoming.get(&id) {
            ids.extend(inc.iter().copied());
        }
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    /// Bitmap of node ids carrying every label in `labels`.
    ///
    /// Returns `None` when `labels` is empty (no label constraint).
    pub fn label_bitmap(&self, labels: &[&str]) -> Option<RoaringBitmap> {
        let mut iter = labels.iter();
        let first = iter.next()?;
        let mut acc = self.label_index.get(*first).cloned().unwrap_or_default();
        for label in iter {
            if acc.is_empty() {
                break;
            }
            match self.label_index.get(*label) {
                Some(bitmap) => acc &= bitmap,
                None => acc.clear(),
            }
        }
        Some(acc)
    }

    /// Find nodes carrying all `labels` whose properties exactly match
    /// `properties`, in creation order (ascending id), up to `limit`.
    pub fn find_nodes(
        &self,
        labels: &[&str],
        properties: &Properties,
        limit: Option<usize>,
    ) -> Vec<&Node> {
        let limit = limit.unwrap_or(usize::MAX);
        let candidates: Box<dyn Iterator<Item = &Node>> = match self.label_bitmap(labels) {
            Some(bitmap) => Box::new(
                bitmap
                    .into_iter()
                    .filter_map(move |raw| self.nodes.get(&NodeId(raw))),
            ),
            None => Box::new(self.nodes.values()),
        };
        candidates
            .filter(|node| node.matches_properties(properties))
            .take(limit)
            .collect()
    }

    /// Node count per label (sorted by label).
    pub fn label_counts(&self) -> BTreeMap<String, u64> {
        self.label_index
            .iter()
            .map(|(label, bitmap)| (label.clone(), bitmap.len()))
            .collect()
    }
}

fn insert_sorted(ids: &mut Vec<RelId>, id: RelId) {
    match ids.last() {
        Some(last) if *last > id => {
            let pos = ids.partition_point(|r| *r < id);
            ids.insert(pos, id);
        }
        _ => ids.push(id),
    }
}
