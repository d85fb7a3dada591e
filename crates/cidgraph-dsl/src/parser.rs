//! nom parser for the pattern query language.
//!
//! ```text
//! MATCH (a:Person {name: $name})-[r:KNOWS|LIKES]->(b)
//! WHERE b.age >= 30 AND NOT b:Bot
//! RETURN DISTINCT b.name AS name
//! LIMIT 10
//! ```
//!
//! Keywords are case-insensitive. Errors report the byte offset of the
//! furthest point any alternative reached, which is almost always the
//! offending token.

use crate::ast::{
    CompareOp, Direction, Expr, NodePattern, Operand, PathPattern, PatternQuery, Projection,
    RelPattern, ReturnItem,
};
use crate::QuerySyntaxError;
use cidgraph_graph::Value;
use nom::branch::alt;
use nom::bytes::complete::{escaped_transform, is_not, tag, take_while, take_while1};
use nom::character::complete::{char as pchar, digit1, multispace0};
use nom::combinator::{all_consuming, cut, map, map_res, opt, recognize, value};
use nom::error::{ErrorKind, FromExternalError, ParseError};
use nom::multi::{many0, separated_list0, separated_list1};
use nom::sequence::{delimited, pair, preceded, separated_pair, terminated, tuple};
use nom::IResult;

const RESERVED: &[&str] = &[
    "MATCH", "WHERE", "RETURN", "LIMIT", "AND", "OR", "NOT", "IS", "NULL", "IN", "CONTAINS",
    "STARTS", "ENDS", "WITH", "AS", "DISTINCT", "TRUE", "FALSE",
];

// ============================================================================
// Entry point
// ============================================================================

pub fn parse_query(input: &str) -> Result<PatternQuery, QuerySyntaxError> {
    let parsed = all_consuming(terminated(
        ws(pattern_query),
        opt(terminated(pchar(';'), multispace0)),
    ))(input);
    match parsed {
        Ok((_, q)) => Ok(q),
        Err(nom::Err::Error(e)) | Err(nom::Err::Failure(e)) => Err(QuerySyntaxError::at(
            input,
            e.input,
            format!("expected {}", e.expected),
        )),
        Err(nom::Err::Incomplete(_)) => Err(QuerySyntaxError::at(
            input,
            "",
            "unexpected end of input".to_string(),
        )),
    }
}

// ============================================================================
// Error type
// ============================================================================

/// Parse failure that remembers what was expected and where.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct SyntaxFailure<'a> {
    input: &'a str,
    expected: String,
}

impl<'a> SyntaxFailure<'a> {
    fn new(input: &'a str, expected: impl Into<String>) -> nom::Err<Self> {
        nom::Err::Error(Self {
            input,
            expected: expected.into(),
        })
    }
}

impl<'a> ParseError<&'a str> for SyntaxFailure<'a> {
    fn from_error_kind(input: &'a str, kind: ErrorKind) -> Self {
        let expected = match kind {
            ErrorKind::Eof => "end of input",
            ErrorKind::Digit => "a number",
            ErrorKind::TakeWhile1 | ErrorKind::AlphaNumeric => "a name",
            ErrorKind::Tag => "a token",
            ErrorKind::EscapedTransform | ErrorKind::IsNot => "a string",
            _ => kind.description(),
        };
        Self {
            input,
            expected: expected.to_string(),
        }
    }

    fn append(_input: &'a str, _kind: ErrorKind, other: Self) -> Self {
        other
    }

    fn from_char(input: &'a str, c: char) -> Self {
        Self {
            input,
            expected: format!("`{c}`"),
        }
    }

    fn or(self, other: Self) -> Self {
        if self.input.len() < other.input.len() {
            self
        } else {
            other
        }
    }
}

impl<'a, E> FromExternalError<&'a str, E> for SyntaxFailure<'a> {
    fn from_external_error(input: &'a str, kind: ErrorKind, _e: E) -> Self {
        Self::from_error_kind(input, kind)
    }
}

type PResult<'a, T> = IResult<&'a str, T, SyntaxFailure<'a>>;

// ============================================================================
// Query
// ============================================================================

fn pattern_query(input: &str) -> PResult<'_, PatternQuery> {
    let (input, _) = keyword("MATCH")(input)?;
    let (input, pattern) = cut(path_pattern)(input)?;
    let (input, predicate) = opt(preceded(ws(keyword("WHERE")), cut(ws(expr))))(input)?;
    let (input, _) = ws(keyword("RETURN"))(input)?;
    let (input, projection) = cut(projection)(input)?;
    let (input, limit) = opt(preceded(ws(keyword("LIMIT")), cut(ws(u64_number))))(input)?;
    Ok((
        input,
        PatternQuery {
            pattern,
            predicate,
            projection,
            limit,
        },
    ))
}

fn projection(input: &str) -> PResult<'_, Projection> {
    let (input, distinct) = opt(ws(keyword("DISTINCT")))(input)?;
    let distinct = distinct.is_some();
    alt((
        value(Projection::All { distinct }, ws(pchar('*'))),
        map(separated_list1(pchar(','), ws(return_item)), move |items| {
            Projection::Items { distinct, items }
        }),
    ))(input)
}

fn return_item(input: &str) -> PResult<'_, ReturnItem> {
    map(
        pair(operand, opt(preceded(ws(keyword("AS")), cut(identifier)))),
        |(operand, alias)| ReturnItem { operand, alias },
    )(input)
}

// ============================================================================
// Patterns
// ============================================================================

fn path_pattern(input: &str) -> PResult<'_, PathPattern> {
    let (input, start) = ws(node_pattern)(input)?;
    let (input, hops) = many0(pair(ws(rel_pattern), cut(ws(node_pattern))))(input)?;
    Ok((input, PathPattern { start, hops }))
}

fn node_pattern(input: &str) -> PResult<'_, NodePattern> {
    let (input, _) = pchar('(')(input)?;
    cut(terminated(node_body, ws(pchar(')'))))(input)
}

fn node_body(input: &str) -> PResult<'_, NodePattern> {
    let (input, variable) = opt(ws(identifier))(input)?;
    let (input, labels) = many0(preceded(ws(pchar(':')), cut(ws(name))))(input)?;
    let (input, properties) = opt(ws(property_map))(input)?;
    Ok((
        input,
        NodePattern {
            variable,
            labels,
            properties: properties.unwrap_or_default(),
        },
    ))
}

#[derive(Default)]
struct RelDetail {
    variable: Option<String>,
    types: Vec<String>,
    properties: Vec<(String, Operand)>,
}

impl RelDetail {
    fn with_direction(self, direction: Direction) -> RelPattern {
        RelPattern {
            variable: self.variable,
            types: self.types,
            properties: self.properties,
            direction,
        }
    }
}

fn rel_pattern(input: &str) -> PResult<'_, RelPattern> {
    alt((incoming_rel, outgoing_or_undirected_rel))(input)
}

/// `<-[..]-` or `<--`
fn incoming_rel(input: &str) -> PResult<'_, RelPattern> {
    let (input, _) = tag("<-")(input)?;
    let (input, detail) = cut(terminated(opt(rel_detail), pchar('-')))(input)?;
    Ok((
        input,
        detail.unwrap_or_default().with_direction(Direction::Incoming),
    ))
}

/// `-[..]->`, `-->`, `-[..]-` or `--`
fn outgoing_or_undirected_rel(input: &str) -> PResult<'_, RelPattern> {
    let (input, _) = pchar('-')(input)?;
    let (input, (detail, _, arrow)) =
        cut(tuple((opt(rel_detail), pchar('-'), opt(pchar('>')))))(input)?;
    let direction = if arrow.is_some() {
        Direction::Outgoing
    } else {
        Direction::Either
    };
    Ok((input, detail.unwrap_or_default().with_direction(direction)))
}

fn rel_detail(input: &str) -> PResult<'_, RelDetail> {
    let (input, _) = pchar('[')(input)?;
    cut(terminated(rel_body, ws(pchar(']'))))(input)
}

fn rel_body(input: &str) -> PResult<'_, RelDetail> {
    let (input, variable) = opt(ws(identifier))(input)?;
    let (input, types) = opt(preceded(
        ws(pchar(':')),
        cut(separated_list1(
            ws(pchar('|')),
            preceded(opt(pchar(':')), ws(name)),
        )),
    ))(input)?;
    let (input, properties) = opt(ws(property_map))(input)?;
    Ok((
        input,
        RelDetail {
            variable,
            types: types.unwrap_or_default(),
            properties: properties.unwrap_or_default(),
        },
    ))
}

fn property_map(input: &str) -> PResult<'_, Vec<(String, Operand)>> {
    preceded(
        pchar('{'),
        cut(terminated(
            separated_list0(pchar(','), ws(property_entry)),
            ws(pchar('}')),
        )),
    )(input)
}

fn property_entry(input: &str) -> PResult<'_, (String, Operand)> {
    separated_pair(name, ws(pchar(':')), cut(operand))(input)
}

// ============================================================================
// Predicates
// ============================================================================

fn expr(input: &str) -> PResult<'_, Expr> {
    let (input, first) = and_expr(input)?;
    let (input, rest) = many0(preceded(ws(keyword("OR")), cut(and_expr)))(input)?;
    Ok((input, fold(first, rest, Expr::Or)))
}

fn and_expr(input: &str) -> PResult<'_, Expr> {
    let (input, first) = not_expr(input)?;
    let (input, rest) = many0(preceded(ws(keyword("AND")), cut(not_expr)))(input)?;
    Ok((input, fold(first, rest, Expr::And)))
}

fn fold(first: Expr, rest: Vec<Expr>, join: fn(Vec<Expr>) -> Expr) -> Expr {
    if rest.is_empty() {
        first
    } else {
        let mut all = Vec::with_capacity(rest.len() + 1);
        all.push(first);
        all.extend(rest);
        join(all)
    }
}

fn not_expr(input: &str) -> PResult<'_, Expr> {
    alt((
        map(preceded(ws(keyword("NOT")), cut(not_expr)), |e| {
            Expr::Not(Box::new(e))
        }),
        ws(primary),
    ))(input)
}

fn primary(input: &str) -> PResult<'_, Expr> {
    alt((
        preceded(pchar('('), cut(terminated(ws(expr), pchar(')')))),
        label_predicate,
        comparison,
    ))(input)
}

fn label_predicate(input: &str) -> PResult<'_, Expr> {
    let (input, variable) = identifier(input)?;
    let (input, first) = preceded(pchar(':'), name)(input)?;
    let (input, more) = many0(preceded(pchar(':'), name))(input)?;
    let mut labels = vec![first];
    labels.extend(more);
    Ok((input, Expr::HasLabels { variable, labels }))
}

enum Tail {
    IsNull { negated: bool },
    Compare(CompareOp, Operand),
}

fn comparison(input: &str) -> PResult<'_, Expr> {
    let (input, left) = operand(input)?;
    let (input, tail) = opt(preceded(multispace0, comparison_tail))(input)?;
    let expr = match tail {
        None => Expr::Truth(left),
        Some(Tail::IsNull { negated }) => Expr::IsNull {
            operand: left,
            negated,
        },
        Some(Tail::Compare(op, right)) => Expr::Compare { op, left, right },
    };
    Ok((input, expr))
}

fn comparison_tail(input: &str) -> PResult<'_, Tail> {
    alt((
        map(
            preceded(
                keyword("IS"),
                cut(pair(opt(ws(keyword("NOT"))), ws(keyword("NULL")))),
            ),
            |(not, _)| Tail::IsNull {
                negated: not.is_some(),
            },
        ),
        map(pair(compare_op, cut(ws(operand))), |(op, rhs)| {
            Tail::Compare(op, rhs)
        }),
    ))(input)
}

fn compare_op(input: &str) -> PResult<'_, CompareOp> {
    alt((
        value(CompareOp::Le, tag("<=")),
        value(CompareOp::Ge, tag(">=")),
        value(CompareOp::Ne, tag("<>")),
        value(CompareOp::Ne, tag("!=")),
        value(CompareOp::Eq, tag("=")),
        value(CompareOp::Lt, tag("<")),
        value(CompareOp::Gt, tag(">")),
        value(CompareOp::In, keyword("IN")),
        value(CompareOp::Contains, keyword("CONTAINS")),
        value(
            CompareOp::StartsWith,
            pair(keyword("STARTS"), ws(keyword("WITH"))),
        ),
        value(
            CompareOp::EndsWith,
            pair(keyword("ENDS"), ws(keyword("WITH"))),
        ),
    ))(input)
}

// ============================================================================
// Operands and literals
// ============================================================================

fn operand(input: &str) -> PResult<'_, Operand> {
    alt((
        map(literal, Operand::Literal),
        map(preceded(pchar('$'), cut(name)), Operand::Parameter),
        map(list_operand, Operand::List),
        property_or_variable,
    ))(input)
}

fn list_operand(input: &str) -> PResult<'_, Vec<Operand>> {
    preceded(
        pchar('['),
        cut(terminated(
            separated_list0(pchar(','), ws(operand)),
            ws(pchar(']')),
        )),
    )(input)
}

fn property_or_variable(input: &str) -> PResult<'_, Operand> {
    let (input, variable) = identifier(input)?;
    let (input, key) = opt(preceded(pchar('.'), cut(name)))(input)?;
    let operand = match key {
        Some(key) => Operand::Property { variable, key },
        None => Operand::Variable(variable),
    };
    Ok((input, operand))
}

fn literal(input: &str) -> PResult<'_, Value> {
    alt((
        map(string_lit, Value::String),
        number,
        value(Value::Bool(true), keyword("true")),
        value(Value::Bool(false), keyword("false")),
        value(Value::Null, keyword("null")),
    ))(input)
}

fn number(input: &str) -> PResult<'_, Value> {
    let (rest, text) = recognize(tuple((
        opt(pchar('-')),
        digit1,
        opt(pair(pchar('.'), digit1)),
    )))(input)?;
    let parsed = if text.contains('.') {
        text.parse::<f64>().ok().map(Value::Float)
    } else {
        text.parse::<i64>().ok().map(Value::Int)
    };
    match parsed {
        Some(v) => Ok((rest, v)),
        None => Err(SyntaxFailure::new(input, "a number in range")),
    }
}

fn string_lit(input: &str) -> PResult<'_, String> {
    alt((quoted('"'), quoted('\'')))(input)
}

fn quoted<'a>(quote: char) -> impl FnMut(&'a str) -> PResult<'a, String> {
    move |input: &'a str| {
        let stop = if quote == '"' { "\\\"" } else { "\\'" };
        let body = escaped_transform(
            is_not(stop),
            '\\',
            alt((
                value("\\", pchar('\\')),
                value("\"", pchar('"')),
                value("'", pchar('\'')),
                value("\n", pchar('n')),
                value("\t", pchar('t')),
                value("\r", pchar('r')),
            )),
        );
        // escaped_transform rejects empty input, hence the opt.
        delimited(
            pchar(quote),
            map(opt(body), |s: Option<String>| s.unwrap_or_default()),
            pchar(quote),
        )(input)
    }
}

fn u64_number(input: &str) -> PResult<'_, u64> {
    map_res(digit1, |s: &str| s.parse::<u64>())(input)
}

/// Variable or alias: an identifier that is not a keyword.
fn identifier(input: &str) -> PResult<'_, String> {
    let (rest, text) = raw_name(input)?;
    if RESERVED.iter().any(|kw| kw.eq_ignore_ascii_case(text)) {
        return Err(SyntaxFailure::new(input, "a variable name"));
    }
    Ok((rest, text.to_string()))
}

/// Label, relationship type or property key. Keywords are allowed here.
fn name(input: &str) -> PResult<'_, String> {
    map(raw_name, str::to_string)(input)
}

fn raw_name(input: &str) -> PResult<'_, &str> {
    recognize(pair(
        take_while1(is_ident_start),
        take_while(is_ident_continue),
    ))(input)
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_ident_continue(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

fn ws<'a, F, O>(inner: F) -> impl FnMut(&'a str) -> PResult<'a, O>
where
    F: FnMut(&'a str) -> PResult<'a, O>,
{
    delimited(multispace0, inner, multispace0)
}

/// Case-insensitive keyword that must not run into an identifier character.
fn keyword<'a>(kw: &'static str) -> impl FnMut(&'a str) -> PResult<'a, &'a str> {
    move |input: &'a str| {
        let n = kw.len();
        match input.get(..n) {
            Some(head)
                if head.eq_ignore_ascii_case(kw) && !input[n..].starts_with(is_ident_continue) =>
            {
                Ok((&input[n..], head))
            }
            _ => Err(SyntaxFailure::new(input, format!("keyword {kw}"))),
        }
    }
}
