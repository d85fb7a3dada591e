//! Depth-first, push-based execution of a compiled [`QueryPlan`].
//!
//! Every operator pushes partial bindings into the continuation of the
//! operator above it, so a row is produced as soon as the deepest `Expand`
//! binds its target. The budget tracker is consulted before every node visit
//! and edge traversal; when it trips the walk unwinds immediately and the
//! rows produced so far are returned with the failure.

use crate::budget::{BudgetExceeded, BudgetTracker};
use cidgraph_dsl::{CompareOp, Column, Direction, Expr, Operand, Operator, QueryPlan};
use cidgraph_graph::{KnowledgeGraph, Node, NodeId, Properties, RelId, Relationship, Value};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};

/// One output cell.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultValue {
    Node(Node),
    Relationship(Relationship),
    Value(Value),
}

impl ResultValue {
    pub fn as_node(&self) -> Option<&Node> {
        match self {
            ResultValue::Node(node) => Some(node),
            _ => None,
        }
    }

    pub fn as_relationship(&self) -> Option<&Relationship> {
        match self {
            ResultValue::Relationship(rel) => Some(rel),
            _ => None,
        }
    }

    pub fn as_value(&self) -> Option<&Value> {
        match self {
            ResultValue::Value(value) => Some(value),
            _ => None,
        }
    }
}

pub type Row = Vec<ResultValue>;

/// Rows plus whatever stopped the walk early.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionOutcome {
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
    pub warnings: Vec<String>,
    pub exceeded: Option<BudgetExceeded>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

/// Run `plan` over `graph`. Never fails: budget exhaustion is reported in
/// [`ExecutionOutcome::exceeded`] next to the rows already materialized.
pub fn execute_plan(
    graph: &KnowledgeGraph,
    plan: &QueryPlan,
    params: &Properties,
    tracker: &BudgetTracker,
) -> ExecutionOutcome {
    let mut executor = Executor {
        graph,
        params,
        tracker,
        rows: Vec::new(),
        seen: HashSet::new(),
        limit: None,
        warnings: Vec::new(),
        missing_params: BTreeSet::new(),
    };
    let exceeded = executor.run_root(&plan.root).err();
    ExecutionOutcome {
        columns: plan.columns.clone(),
        rows: executor.rows,
        warnings: executor.warnings,
        exceeded,
    }
}

// ============================================================================
// One-hop expansion
// ============================================================================

/// Relationships attached to `from` in `direction`, in creation order.
pub fn directed_relationships(
    graph: &KnowledgeGraph,
    from: NodeId,
    direction: Direction,
) -> Vec<&Relationship> {
    match direction {
        Direction::Outgoing => graph.outgoing(from).collect(),
        Direction::Incoming => graph.incoming(from).collect(),
        Direction::Either => graph.relationships_of(from),
    }
}

fn far_end(rel: &Relationship, from: NodeId, direction: Direction) -> NodeId {
    match direction {
        Direction::Outgoing => rel.end,
        Direction::Incoming => rel.start,
        Direction::Either => rel.other_end(from).unwrap_or(rel.end),
    }
}

/// Follow each relationship of `from` whose type is in `types` (any type if
/// empty), charging one edge and one node visit per step, and hand the pair
/// to `visit`. Shared by the pattern executor and hybrid expansion.
pub fn expand_once<'g, F>(
    graph: &'g KnowledgeGraph,
    tracker: &BudgetTracker,
    from: NodeId,
    direction: Direction,
    types: &[String],
    mut visit: F,
) -> Result<Flow, BudgetExceeded>
where
    F: FnMut(&'g Relationship, &'g Node) -> Result<Flow, BudgetExceeded>,
{
    for rel in directed_relationships(graph, from, direction) {
        if !types.is_empty() && !types.iter().any(|t| *t == rel.rel_type) {
            continue;
        }
        tracker.increment_edges(1)?;
        let Some(target) = graph.node(far_end(rel, from, direction)) else {
            continue;
        };
        tracker.increment_nodes(1)?;
        if visit(rel, target)? == Flow::Stop {
            return Ok(Flow::Stop);
        }
    }
    Ok(Flow::Continue)
}

// ============================================================================
// Executor
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Bound {
    Node(NodeId),
    Relationship(RelId),
}

#[derive(Default)]
struct Bindings<'p> {
    vars: HashMap<&'p str, Bound>,
    /// Relationships already used by the current path.
    path: Vec<RelId>,
}

/// Resolved operand: graph entities by reference, everything else by value.
enum Datum<'g> {
    Node(&'g Node),
    Relationship(&'g Relationship),
    Value(Value),
}

impl Datum<'_> {
    fn is_null(&self) -> bool {
        matches!(self, Datum::Value(Value::Null))
    }
}

type Sink<'s, 'p> =
    dyn for<'e> FnMut(&mut Executor<'e>, &mut Bindings<'p>) -> Result<Flow, BudgetExceeded> + 's;

struct Executor<'g> {
    graph: &'g KnowledgeGraph,
    params: &'g Properties,
    tracker: &'g BudgetTracker,
    rows: Vec<Row>,
    /// Rows already emitted, for `RETURN DISTINCT`.
    seen: HashSet<Row>,
    limit: Option<u64>,
    warnings: Vec<String>,
    missing_params: BTreeSet<String>,
}

impl<'g> Executor<'g> {
    fn run_root<'p>(&mut self, op: &'p Operator) -> Result<(), BudgetExceeded> {
        match op {
            Operator::Limit { input, count } => {
                self.limit = Some(*count);
                if *count == 0 {
                    return Ok(());
                }
                self.run_root(input)
            }
            Operator::Project {
                input,
                columns,
                distinct,
            } => {
                let mut bindings = Bindings::default();
                self.produce(input, &mut bindings, &mut |this, b| {
                    this.emit(columns, *distinct, b)
                })?;
                Ok(())
            }
            other => {
                let mut bindings = Bindings::default();
                self.produce(other, &mut bindings, &mut |_, _| Ok(Flow::Continue))?;
                Ok(())
            }
        }
    }

    fn produce<'p>(
        &mut self,
        op: &'p Operator,
        bindings: &mut Bindings<'p>,
        sink: &mut Sink<'_, 'p>,
    ) -> Result<Flow, BudgetExceeded> {
        match op {
            Operator::Scan {
                variable,
                labels,
                properties,
            } => self.scan(variable, labels, properties, bindings, sink),
            Operator::Expand { input, .. } => self.produce(input, bindings, &mut |this, b| {
                this.expand(op, b, sink)
            }),
            Operator::Filter { input, predicate } => {
                self.produce(input, bindings, &mut |this, b| {
                    if this.eval(predicate, b) {
                        sink(this, b)
                    } else {
                        Ok(Flow::Continue)
                    }
                })
            }
            Operator::Project { input, .. } | Operator::Limit { input, .. } => {
                self.produce(input, bindings, sink)
            }
        }
    }

    fn scan<'p>(
        &mut self,
        variable: &'p str,
        labels: &[String],
        properties: &[(String, Operand)],
        bindings: &mut Bindings<'p>,
        sink: &mut Sink<'_, 'p>,
    ) -> Result<Flow, BudgetExceeded> {
        let mut filter = Properties::new();
        for (key, operand) in properties {
            match self.resolve(operand, bindings) {
                Datum::Value(Value::Null) => return Ok(Flow::Continue),
                Datum::Value(value) => {
                    filter.insert(key.clone(), value);
                }
                Datum::Node(_) | Datum::Relationship(_) => return Ok(Flow::Continue),
            }
        }
        let labels: Vec<&str> = labels.iter().map(String::as_str).collect();
        let graph = self.graph;
        for node in graph.find_nodes(&labels, &filter, None) {
            self.tracker.increment_nodes(1)?;
            bindings.vars.insert(variable, Bound::Node(node.id));
            let flow = sink(self, bindings)?;
            bindings.vars.remove(variable);
            if flow == Flow::Stop {
                return Ok(Flow::Stop);
            }
        }
        Ok(Flow::Continue)
    }

    fn expand<'p>(
        &mut self,
        op: &'p Operator,
        bindings: &mut Bindings<'p>,
        sink: &mut Sink<'_, 'p>,
    ) -> Result<Flow, BudgetExceeded> {
        let Operator::Expand {
            from,
            relationship,
            types,
            rel_properties,
            direction,
            to,
            to_labels,
            to_properties,
            to_bound,
            depth,
            ..
        } = op
        else {
            return Ok(Flow::Continue);
        };
        let Some(Bound::Node(from_id)) = bindings.vars.get(from.as_str()).copied() else {
            return Ok(Flow::Continue);
        };
        self.tracker.reach_depth(*depth as u64)?;

        let graph = self.graph;
        let tracker = self.tracker;
        expand_once(graph, tracker, from_id, *direction, types, |rel, target| {
            if bindings.path.contains(&rel.id) {
                return Ok(Flow::Continue);
            }
            if !self.entity_matches(&rel.properties, rel_properties, bindings) {
                return Ok(Flow::Continue);
            }
            if *to_bound {
                if bindings.vars.get(to.as_str()) != Some(&Bound::Node(target.id)) {
                    return Ok(Flow::Continue);
                }
            } else if !to_labels.iter().all(|l| target.has_label(l))
                || !self.entity_matches(&target.properties, to_properties, bindings)
            {
                return Ok(Flow::Continue);
            }

            if !*to_bound {
                bindings.vars.insert(to.as_str(), Bound::Node(target.id));
            }
            if let Some(name) = relationship {
                bindings.vars.insert(name.as_str(), Bound::Relationship(rel.id));
            }
            bindings.path.push(rel.id);

            let flow = sink(self, bindings);

            bindings.path.pop();
            if let Some(name) = relationship {
                bindings.vars.remove(name.as_str());
            }
            if !*to_bound {
                bindings.vars.remove(to.as_str());
            }
            flow
        })
    }

    fn emit(
        &mut self,
        columns: &[Column],
        distinct: bool,
        bindings: &mut Bindings<'_>,
    ) -> Result<Flow, BudgetExceeded> {
        let row: Row = columns
            .iter()
            .map(|column| match self.resolve(&column.operand, bindings) {
                Datum::Node(node) => ResultValue::Node(node.clone()),
                Datum::Relationship(rel) => ResultValue::Relationship(rel.clone()),
                Datum::Value(value) => ResultValue::Value(value),
            })
            .collect();
        if distinct && !self.seen.insert(row.clone()) {
            return Ok(Flow::Continue);
        }
        self.rows.push(row);
        match self.limit {
            Some(limit) if self.rows.len() as u64 >= limit => Ok(Flow::Stop),
            _ => Ok(Flow::Continue),
        }
    }

    fn entity_matches(
        &mut self,
        actual: &Properties,
        expected: &[(String, Operand)],
        bindings: &Bindings<'_>,
    ) -> bool {
        expected.iter().all(|(key, operand)| {
            let Some(have) = actual.get(key) else {
                return false;
            };
            match self.resolve(operand, bindings) {
                Datum::Value(want) => !want.is_null() && have.loose_eq(&want),
                _ => false,
            }
        })
    }

    // ------------------------------------------------------------------------
    // Expressions
    // ------------------------------------------------------------------------

    fn resolve(&mut self, operand: &Operand, bindings: &Bindings<'_>) -> Datum<'g> {
        match operand {
            Operand::Literal(value) => Datum::Value(value.clone()),
            Operand::Parameter(name) => match self.params.get(name) {
                Some(value) => Datum::Value(value.clone()),
                None => {
                    if self.missing_params.insert(name.clone()) {
                        tracing::warn!(parameter = %name, "query parameter not supplied; using null");
                        self.warnings
                            .push(format!("parameter `${name}` was not supplied; evaluated as null"));
                    }
                    Datum::Value(Value::Null)
                }
            },
            Operand::Variable(name) => match bindings.vars.get(name.as_str()) {
                Some(Bound::Node(id)) => self
                    .graph
                    .node(*id)
                    .map_or(Datum::Value(Value::Null), Datum::Node),
                Some(Bound::Relationship(id)) => self
                    .graph
                    .relationship(*id)
                    .map_or(Datum::Value(Value::Null), Datum::Relationship),
                None => Datum::Value(Value::Null),
            },
            Operand::Property { variable, key } => {
                let properties = match bindings.vars.get(variable.as_str()) {
                    Some(Bound::Node(id)) => self.graph.node(*id).map(|n| &n.properties),
                    Some(Bound::Relationship(id)) => {
                        self.graph.relationship(*id).map(|r| &r.properties)
                    }
                    None => None,
                };
                Datum::Value(
                    properties
                        .and_then(|p| p.get(key))
                        .cloned()
                        .unwrap_or(Value::Null),
                )
            }
            Operand::List(items) => {
                let values = items
                    .iter()
                    .map(|item| match self.resolve(item, bindings) {
                        Datum::Value(value) => value,
                        Datum::Node(node) => Value::Int(i64::from(node.id.raw())),
                        Datum::Relationship(rel) => Value::Int(i64::from(rel.id.raw())),
                    })
                    .collect();
                Datum::Value(Value::List(values))
            }
        }
    }

    fn eval(&mut self, expr: &Expr, bindings: &Bindings<'_>) -> bool {
        match expr {
            Expr::Or(items) => items.iter().any(|e| self.eval(e, bindings)),
            Expr::And(items) => items.iter().all(|e| self.eval(e, bindings)),
            Expr::Not(inner) => !self.eval(inner, bindings),
            Expr::Compare { op, left, right } => {
                let left = self.resolve(left, bindings);
                let right = self.resolve(right, bindings);
                compare(*op, &left, &right)
            }
            Expr::IsNull { operand, negated } => {
                self.resolve(operand, bindings).is_null() != *negated
            }
            Expr::HasLabels { variable, labels } => match bindings.vars.get(variable.as_str()) {
                Some(Bound::Node(id)) => self
                    .graph
                    .node(*id)
                    .is_some_and(|node| labels.iter().all(|l| node.has_label(l))),
                _ => false,
            },
            Expr::Truth(operand) => matches!(
                self.resolve(operand, bindings),
                Datum::Value(Value::Bool(true))
            ),
        }
    }
}

/// Comparisons involving null are false (`IS NULL` is the only null test).
fn compare(op: CompareOp, left: &Datum<'_>, right: &Datum<'_>) -> bool {
    if left.is_null() || right.is_null() {
        return false;
    }
    match (left, right) {
        (Datum::Value(l), Datum::Value(r)) => compare_values(op, l, r),
        (Datum::Node(a), Datum::Node(b)) => match op {
            CompareOp::Eq => a.id == b.id,
            CompareOp::Ne => a.id != b.id,
            _ => false,
        },
        (Datum::Relationship(a), Datum::Relationship(b)) => match op {
            CompareOp::Eq => a.id == b.id,
            CompareOp::Ne => a.id != b.id,
            _ => false,
        },
        _ => matches!(op, CompareOp::Ne),
    }
}

fn compare_values(op: CompareOp, left: &Value, right: &Value) -> bool {
    use std::cmp::Ordering;
    match op {
        CompareOp::Eq => left.loose_eq(right),
        CompareOp::Ne => !left.loose_eq(right),
        CompareOp::Lt => left.compare(right) == Some(Ordering::Less),
        CompareOp::Le => matches!(left.compare(right), Some(Ordering::Less | Ordering::Equal)),
        CompareOp::Gt => left.compare(right) == Some(Ordering::Greater),
        CompareOp::Ge => matches!(
            left.compare(right),
            Some(Ordering::Greater | Ordering::Equal)
        ),
        CompareOp::In => match right {
            Value::List(items) => items.iter().any(|item| item.loose_eq(left)),
            _ => false,
        },
        CompareOp::Contains => match (left.as_str(), right.as_str()) {
            (Some(l), Some(r)) => l.contains(r),
            _ => false,
        },
        CompareOp::StartsWith => match (left.as_str(), right.as_str()) {
            (Some(l), Some(r)) => l.starts_with(r),
            _ => false,
        },
        CompareOp::EndsWith => match (left.as_str(), right.as_str()) {
            (Some(l), Some(r)) => l.ends_with(r),
            _ => false,
        },
    }
}
