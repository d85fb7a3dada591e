//! Typed AST for `MATCH … WHERE … RETURN … LIMIT …` queries.

use cidgraph_graph::Value;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternQuery {
    pub pattern: PathPattern,
    pub predicate: Option<Expr>,
    pub projection: Projection,
    pub limit: Option<u64>,
}

/// `(n0)-[r0]->(n1)<-[r1]-(n2) …`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathPattern {
    pub start: NodePattern,
    pub hops: Vec<(RelPattern, NodePattern)>,
}

impl PathPattern {
    pub fn nodes(&self) -> impl Iterator<Item = &NodePattern> {
        std::iter::once(&self.start).chain(self.hops.iter().map(|(_, n)| n))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodePattern {
    pub variable: Option<String>,
    pub labels: Vec<String>,
    pub properties: Vec<(String, Operand)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// `-[]->`
    Outgoing,
    /// `<-[]-`
    Incoming,
    /// `-[]-`
    Either,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelPattern {
    pub variable: Option<String>,
    /// Alternatives (`:A|B`); empty means any type.
    pub types: Vec<String>,
    pub properties: Vec<(String, Operand)>,
    pub direction: Direction,
}

// ============================================================================
// Expressions
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Operand {
    Literal(Value),
    Parameter(String),
    Variable(String),
    Property { variable: String, key: String },
    List(Vec<Operand>),
}

impl Operand {
    /// Pattern variables this operand reads.
    pub fn variables<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Operand::Variable(v) | Operand::Property { variable: v, .. } => out.push(v),
            Operand::List(items) => items.iter().for_each(|i| i.variables(out)),
            Operand::Literal(_) | Operand::Parameter(_) => {}
        }
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Literal(v) => write!(f, "{v}"),
            Operand::Parameter(p) => write!(f, "${p}"),
            Operand::Variable(v) => write!(f, "{v}"),
            Operand::Property { variable, key } => write!(f, "{variable}.{key}"),
            Operand::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    Contains,
    StartsWith,
    EndsWith,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    Or(Vec<Expr>),
    And(Vec<Expr>),
    Not(Box<Expr>),
    Compare {
        op: CompareOp,
        left: Operand,
        right: Operand,
    },
    IsNull {
        operand: Operand,
        negated: bool,
    },
    /// `a:Label1:Label2`
    HasLabels {
        variable: String,
        labels: Vec<String>,
    },
    /// Bare operand used as a condition; true only for `Bool(true)`.
    Truth(Operand),
}

impl Expr {
    pub fn variables<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Expr::Or(items) | Expr::And(items) => items.iter().for_each(|e| e.variables(out)),
            Expr::Not(inner) => inner.variables(out),
            Expr::Compare { left, right, .. } => {
                left.variables(out);
                right.variables(out);
            }
            Expr::IsNull { operand, .. } | Expr::Truth(operand) => operand.variables(out),
            Expr::HasLabels { variable, .. } => out.push(variable),
        }
    }
}

// ============================================================================
// Projection
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Projection {
    /// `RETURN *`
    All { distinct: bool },
    Items {
        distinct: bool,
        items: Vec<ReturnItem>,
    },
}

impl Projection {
    pub fn is_distinct(&self) -> bool {
        match self {
            Projection::All { distinct } | Projection::Items { distinct, .. } => *distinct,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReturnItem {
    pub operand: Operand,
    pub alias: Option<String>,
}

impl ReturnItem {
    /// Output column name: the alias, else the operand's source text.
    pub fn column_name(&self) -> String {
        self.alias
            .clone()
            .unwrap_or_else(|| self.operand.to_string())
    }
}
