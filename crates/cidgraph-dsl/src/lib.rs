//! Cidgraph pattern query language
//!
//! A small declarative language of the shape
//! `MATCH (pattern) WHERE (predicate) RETURN (projection) LIMIT n`,
//! parsed with `nom` into a typed AST ([`ast`]) and compiled into an operator
//! tree ([`ir`]) that the engine executes.

pub mod ast;
pub mod ir;
pub mod parser;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use ast::{
    CompareOp, Direction, Expr, NodePattern, Operand, PathPattern, PatternQuery, Projection,
    RelPattern, ReturnItem,
};
pub use ir::{compile, compile_query, Column, CompileError, Operator, QueryPlan, VariableKind};
pub use parser::parse_query;

// ============================================================================
// Errors
// ============================================================================

/// Malformed query text, located by byte offset.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
#[error("syntax error at offset {offset} near `{token}`: {message}")]
pub struct QuerySyntaxError {
    pub offset: usize,
    pub token: String,
    pub message: String,
}

impl QuerySyntaxError {
    /// Build an error for the point where `rest` (a suffix of `full`) begins.
    pub(crate) fn at(full: &str, rest: &str, message: String) -> Self {
        Self {
            offset: full.len().saturating_sub(rest.len()),
            token: leading_token(rest),
            message,
        }
    }
}

fn leading_token(rest: &str) -> String {
    let mut chars = rest.char_indices();
    let Some((_, first)) = chars.next() else {
        return "<end of input>".to_string();
    };
    if first.is_alphanumeric() || first == '_' || first == '$' {
        let end = chars
            .find(|(_, c)| !(c.is_alphanumeric() || *c == '_'))
            .map(|(i, _)| i)
            .unwrap_or(rest.len());
        rest[..end].to_string()
    } else {
        first.to_string()
    }
}

/// True if `text` reads as a pattern query (leading `MATCH` keyword) rather
/// than free text.
pub fn looks_like_pattern_query(text: &str) -> bool {
    let trimmed = text.trim_start();
    match trimmed.get(..5) {
        Some(head) if head.eq_ignore_ascii_case("MATCH") => trimmed[5..]
            .chars()
            .next()
            .map_or(true, |c| c.is_whitespace() || c == '('),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_pattern_queries() {
        assert!(looks_like_pattern_query("MATCH (n) RETURN n"));
        assert!(looks_like_pattern_query("  match(n) return n"));
        assert!(!looks_like_pattern_query("matchmaking services in Paris"));
        assert!(!looks_like_pattern_query("who knows Alice?"));
    }

    #[test]
    fn leading_token_forms() {
        assert_eq!(leading_token("RETURN a"), "RETURN");
        assert_eq!(leading_token(")x"), ")");
        assert_eq!(leading_token(""), "<end of input>");
    }
}
