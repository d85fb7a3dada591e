//! GraphRAG: hybrid retrieval, subgraph assembly and optional reasoning.

use crate::hybrid::HybridHit;
use cidgraph_graph::{KnowledgeGraph, Node, NodeId, Relationship};
use std::collections::BTreeSet;
use std::fmt::Write;

/// Nodes of `hits` plus every relationship among them, rendered as text.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RetrievedSubgraph {
    pub nodes: Vec<Node>,
    pub relationships: Vec<Relationship>,
    pub text: String,
}

/// Build the retrieval context for `question`. `extra` is caller-supplied
/// context placed ahead of the graph facts.
pub fn retrieve_subgraph(graph: &KnowledgeGraph, hits: &[HybridHit], extra: &str) -> RetrievedSubgraph {
    let ids: BTreeSet<NodeId> = hits.iter().map(HybridHit::id).collect();
    let nodes: Vec<Node> = hits.iter().map(|h| h.node.clone()).collect();

    let mut seen = BTreeSet::new();
    let mut relationships: Vec<Relationship> = Vec::new();
    for id in &ids {
        for rel in graph.outgoing(*id) {
            if ids.contains(&rel.end) && seen.insert(rel.id) {
                relationships.push(rel.clone());
            }
        }
    }
    relationships.sort_by_key(|r| r.id);

    let text = render_context(&nodes, &relationships, extra);
    RetrievedSubgraph {
        nodes,
        relationships,
        text,
    }
}

fn render_context(nodes: &[Node], relationships: &[Relationship], extra: &str) -> String {
    let mut out = String::new();
    if !extra.trim().is_empty() {
        let _ = writeln!(out, "Context:\n{}\n", extra.trim());
    }
    out.push_str("Nodes:\n");
    for node in nodes {
        let labels: String = node.labels.iter().map(|l| format!(":{l}")).collect();
        let props: Vec<String> = node
            .properties
            .iter()
            .map(|(k, v)| format!("{k}: {v}"))
            .collect();
        let _ = writeln!(out, "- ({}{labels} {{{}}})", node.id, props.join(", "));
    }
    if !relationships.is_empty() {
        out.push_str("Relationships:\n");
        for rel in relationships {
            let _ = writeln!(out, "- ({})-[:{}]->({})", rel.start, rel.rel_type, rel.end);
        }
    }
    out
}
