//! Query IR: a tree of physical operators compiled from a [`PatternQuery`].
//!
//! The shape is always
//!
//! ```text
//! Limit? ( Project ( Filter? ( Expand* ( Scan ) ) ) )
//! ```
//!
//! Anonymous pattern positions get internal names (`#n1`, `#n2`, …) that the
//! surface syntax cannot produce, so they never clash with user variables and
//! are excluded from `RETURN *`.

use crate::ast::{Direction, Expr, NodePattern, Operand, PatternQuery, Projection};
use crate::parser::parse_query;
use crate::QuerySyntaxError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Operator {
    /// Start node-set selection.
    Scan {
        variable: String,
        labels: Vec<String>,
        properties: Vec<(String, Operand)>,
    },
    /// One-hop traversal from `from` to `to`.
    Expand {
        input: Box<Operator>,
        from: String,
        relationship: Option<String>,
        types: Vec<String>,
        rel_properties: Vec<(String, Operand)>,
        direction: Direction,
        to: String,
        to_labels: Vec<String>,
        to_properties: Vec<(String, Operand)>,
        /// `to` was bound earlier in the path (cycle check instead of bind).
        to_bound: bool,
        /// 1-based hop depth.
        depth: usize,
    },
    Filter {
        input: Box<Operator>,
        predicate: Expr,
    },
    Project {
        input: Box<Operator>,
        columns: Vec<Column>,
        distinct: bool,
    },
    Limit {
        input: Box<Operator>,
        count: u64,
    },
}

impl Operator {
    pub fn name(&self) -> &'static str {
        match self {
            Operator::Scan { .. } => "Scan",
            Operator::Expand { .. } => "Expand",
            Operator::Filter { .. } => "Filter",
            Operator::Project { .. } => "Project",
            Operator::Limit { .. } => "Limit",
        }
    }

    pub fn input(&self) -> Option<&Operator> {
        match self {
            Operator::Scan { .. } => None,
            Operator::Expand { input, .. }
            | Operator::Filter { input, .. }
            | Operator::Project { input, .. }
            | Operator::Limit { input, .. } => Some(input),
        }
    }

    /// Operator names from the root down to the scan.
    pub fn chain(&self) -> Vec<&'static str> {
        let mut out = vec![self.name()];
        let mut cur = self.input();
        while let Some(op) = cur {
            out.push(op.name());
            cur = op.input();
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub operand: Operand,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VariableKind {
    Node,
    Relationship,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryPlan {
    pub root: Operator,
    pub columns: Vec<String>,
    /// Every variable the pattern binds (internal names included).
    pub variables: BTreeMap<String, VariableKind>,
    /// Number of `Expand` steps.
    pub max_depth: usize,
}

impl QueryPlan {
    pub fn limit(&self) -> Option<u64> {
        match &self.root {
            Operator::Limit { count, .. } => Some(*count),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CompileError {
    #[error(transparent)]
    Syntax(#[from] QuerySyntaxError),
    #[error("variable `{0}` is not bound by the pattern")]
    UnboundVariable(String),
    #[error("variable `{0}` is used for both a node and a relationship")]
    ConflictingVariable(String),
    #[error("relationship variable `{0}` is bound more than once")]
    DuplicateRelationship(String),
}

/// Parse and compile in one step.
pub fn compile_query(text: &str) -> Result<QueryPlan, CompileError> {
    let query = parse_query(text)?;
    compile(&query)
}

pub fn compile(query: &PatternQuery) -> Result<QueryPlan, CompileError> {
    let mut scope = Scope::default();

    scope.check_operands(&query.pattern.start.properties)?;
    let start_var = scope.bind_node(&query.pattern.start, 0)?;
    let mut root = Operator::Scan {
        variable: start_var.clone(),
        labels: query.pattern.start.labels.clone(),
        properties: query.pattern.start.properties.clone(),
    };

    let mut from = start_var;
    for (i, (rel, node)) in query.pattern.hops.iter().enumerate() {
        let depth = i + 1;
        scope.check_operands(&rel.properties)?;
        let relationship = match &rel.variable {
            Some(name) => {
                scope.bind_relationship(name)?;
                Some(name.clone())
            }
            None => None,
        };
        let already_bound = node
            .variable
            .as_ref()
            .is_some_and(|v| scope.kinds.contains_key(v));
        scope.check_operands(&node.properties)?;
        let to = scope.bind_node(node, depth)?;
        root = Operator::Expand {
            input: Box::new(root),
            from: from.clone(),
            relationship,
            types: rel.types.clone(),
            rel_properties: rel.properties.clone(),
            direction: rel.direction,
            to: to.clone(),
            to_labels: node.labels.clone(),
            to_properties: node.properties.clone(),
            to_bound: already_bound,
            depth,
        };
        from = to;
    }

    if let Some(predicate) = &query.predicate {
        let mut vars = Vec::new();
        predicate.variables(&mut vars);
        scope.check_names(&vars)?;
        root = Operator::Filter {
            input: Box::new(root),
            predicate: predicate.clone(),
        };
    }

    let columns: Vec<Column> = match &query.projection {
        Projection::All { .. } => scope
            .order
            .iter()
            .filter(|v| !v.starts_with('#'))
            .map(|v| Column {
                name: v.clone(),
                operand: Operand::Variable(v.clone()),
            })
            .collect(),
        Projection::Items { items, .. } => {
            let mut vars = Vec::new();
            for item in items {
                item.operand.variables(&mut vars);
            }
            scope.check_names(&vars)?;
            items
                .iter()
                .map(|item| Column {
                    name: item.column_name(),
                    operand: item.operand.clone(),
                })
                .collect()
        }
    };
    let column_names = columns.iter().map(|c| c.name.clone()).collect();
    root = Operator::Project {
        input: Box::new(root),
        columns,
        distinct: query.projection.is_distinct(),
    };

    if let Some(count) = query.limit {
        root = Operator::Limit {
            input: Box::new(root),
            count,
        };
    }

    Ok(QueryPlan {
        root,
        columns: column_names,
        variables: scope.kinds,
        max_depth: query.pattern.hops.len(),
    })
}

#[derive(Default)]
struct Scope {
    kinds: BTreeMap<String, VariableKind>,
    /// Binding order, for `RETURN *`.
    order: Vec<String>,
}

impl Scope {
    fn bind_node(&mut self, node: &NodePattern, position: usize) -> Result<String, CompileError> {
        let name = node
            .variable
            .clone()
            .unwrap_or_else(|| format!("#n{position}"));
        match self.kinds.get(&name) {
            Some(VariableKind::Node) => {}
            Some(VariableKind::Relationship) => return Err(CompileError::ConflictingVariable(name)),
            None => {
                self.kinds.insert(name.clone(), VariableKind::Node);
                self.order.push(name.clone());
            }
        }
        Ok(name)
    }

    fn bind_relationship(&mut self, name: &str) -> Result<(), CompileError> {
        match self.kinds.get(name) {
            Some(VariableKind::Relationship) => {
                Err(CompileError::DuplicateRelationship(name.to_string()))
            }
            Some(VariableKind::Node) => Err(CompileError::ConflictingVariable(name.to_string())),
            None => {
                self.kinds
                    .insert(name.to_string(), VariableKind::Relationship);
                self.order.push(name.to_string());
                Ok(())
            }
        }
    }

    fn check_operands(&self, properties: &[(String, Operand)]) -> Result<(), CompileError> {
        let mut vars = Vec::new();
        for (_, operand) in properties {
            operand.variables(&mut vars);
        }
        self.check_names(&vars)
    }

    fn check_names(&self, vars: &[&str]) -> Result<(), CompileError> {
        match vars.iter().find(|v| !self.kinds.contains_key(**v)) {
            Some(v) => Err(CompileError::UnboundVariable(v.to_string())),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_shape() {
        let plan =
            compile_query("MATCH (a:Person)-[:KNOWS]->(b) WHERE b.age > 3 RETURN b LIMIT 2")
                .unwrap();
        assert_eq!(
            plan.root.chain(),
            vec!["Limit", "Project", "Filter", "Expand", "Scan"]
        );
        assert_eq!(plan.limit(), Some(2));
        assert_eq!(plan.max_depth, 1);
    }

    #[test]
    fn return_star_skips_anonymous_positions() {
        let plan = compile_query("MATCH (a)-[r]->()<-[]-(c) RETURN *").unwrap();
        assert_eq!(plan.columns, vec!["a", "r", "c"]);
        assert!(plan.variables.contains_key("#n1"));
    }

    #[test]
    fn rebinding_a_node_is_a_cycle() {
        let plan = compile_query("MATCH (a)-->(b)-->(a) RETURN a").unwrap();
        match &plan.root {
            Operator::Project { input, .. } => match input.as_ref() {
                Operator::Expand { to, to_bound, .. } => {
                    assert_eq!(to, "a");
                    assert!(*to_bound);
                }
                other => panic!("unexpected {other:?}"),
            },
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn semantic_errors() {
        assert_eq!(
            compile_query("MATCH (a) RETURN b").unwrap_err(),
            CompileError::UnboundVariable("b".into())
        );
        assert_eq!(
            compile_query("MATCH (a)-[a]->(b) RETURN a").unwrap_err(),
            CompileError::ConflictingVariable("a".into())
        );
        assert_eq!(
            compile_query("MATCH (a)-[r]->(b)-[r]->(c) RETURN a").unwrap_err(),
            CompileError::DuplicateRelationship("r".into())
        );
        assert!(matches!(
            compile_query("MATCH (a {x: b.y})-->(b) RETURN a").unwrap_err(),
            CompileError::UnboundVariable(_)
        ));
    }
}
