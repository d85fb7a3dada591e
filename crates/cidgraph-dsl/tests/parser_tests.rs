use cidgraph_dsl::{
    compile_query, parse_query, CompareOp, CompileError, Direction, Expr, Operand, Projection,
};
use cidgraph_graph::Value;
use proptest::prelude::*;

#[test]
fn test_parse_full_query() {
    let q = parse_query(
        "MATCH (a:Person {name: 'Alice'})-[r:KNOWS|LIKES]->(b:Person) \
         WHERE b.age >= 30 AND NOT b:Bot RETURN DISTINCT b.name AS name, r LIMIT 5",
    )
    .unwrap();

    assert_eq!(q.pattern.start.variable.as_deref(), Some("a"));
    assert_eq!(q.pattern.start.labels, vec!["Person".to_string()]);
    assert_eq!(
        q.pattern.start.properties,
        vec![(
            "name".to_string(),
            Operand::Literal(Value::from("Alice"))
        )]
    );
    let (rel, b) = &q.pattern.hops[0];
    assert_eq!(rel.direction, Direction::Outgoing);
    assert_eq!(rel.types, vec!["KNOWS".to_string(), "LIKES".to_string()]);
    assert_eq!(b.variable.as_deref(), Some("b"));

    match q.predicate.unwrap() {
        Expr::And(items) => {
            assert_eq!(items.len(), 2);
            assert!(matches!(
                &items[0],
                Expr::Compare {
                    op: CompareOp::Ge,
                    ..
                }
            ));
            assert!(matches!(&items[1], Expr::Not(_)));
        }
        other => panic!("unexpected predicate {other:?}"),
    }
    match q.projection {
        Projection::Items { distinct, items } => {
            assert!(distinct);
            assert_eq!(items[0].column_name(), "name");
            assert_eq!(items[1].column_name(), "r");
        }
        other => panic!("unexpected projection {other:?}"),
    }
    assert_eq!(q.limit, Some(5));
}

#[test]
fn test_keywords_are_case_insensitive() {
    let q = parse_query("match (n) where n.x is not null return * limit 1").unwrap();
    assert!(matches!(
        q.predicate,
        Some(Expr::IsNull { negated: true, .. })
    ));
    assert!(matches!(q.projection, Projection::All { distinct: false }));
}

#[test]
fn test_precedence_or_binds_looser_than_and() {
    let q = parse_query("MATCH (n) WHERE n.a = 1 OR n.b = 2 AND n.c = 3 RETURN n").unwrap();
    match q.predicate.unwrap() {
        Expr::Or(items) => {
            assert!(matches!(items[0], Expr::Compare { .. }));
            assert!(matches!(items[1], Expr::And(_)));
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn test_string_operators_lists_and_params() {
    let q = parse_query(
        "MATCH (n) WHERE n.name STARTS WITH 'A' OR n.tag IN ['x', \"y\"] OR n.k = $key RETURN n",
    )
    .unwrap();
    let Some(Expr::Or(items)) = q.predicate else {
        panic!("expected OR");
    };
    assert!(matches!(
        items[0],
        Expr::Compare {
            op: CompareOp::StartsWith,
            ..
        }
    ));
    assert!(matches!(
        &items[1],
        Expr::Compare { op: CompareOp::In, right: Operand::List(l), .. } if l.len() == 2
    ));
    assert!(matches!(
        &items[2],
        Expr::Compare { right: Operand::Parameter(p), .. } if p == "key"
    ));
}

#[test]
fn test_missing_paren_reports_offset_of_offending_token() {
    let input = "MATCH (a:Person RETURN a";
    let err = parse_query(input).unwrap_err();
    assert_eq!(err.offset, input.find("RETURN").unwrap());
    assert_eq!(err.token, "RETURN");
    assert!(err.message.contains("`)`"), "{}", err.message);
}

#[test]
fn test_trailing_garbage_is_located() {
    let input = "MATCH (a) RETURN a LIMIT 3 extra";
    let err = parse_query(input).unwrap_err();
    assert_eq!(err.offset, input.find("extra").unwrap());
    assert_eq!(err.token, "extra");
}

#[test]
fn test_bad_where_clause_points_inside_predicate() {
    let input = "MATCH (a) WHERE a.x = RETURN a";
    let err = parse_query(input).unwrap_err();
    assert_eq!(err.offset, input.find("RETURN").unwrap());
}

#[test]
fn test_missing_return_and_empty_input() {
    assert!(parse_query("MATCH (a)").is_err());
    let err = parse_query("").unwrap_err();
    assert_eq!(err.offset, 0);
    assert_eq!(err.token, "<end of input>");
}

#[test]
fn test_compile_reports_syntax_errors() {
    assert!(matches!(
        compile_query("MATCH (a RETURN a"),
        Err(CompileError::Syntax(_))
    ));
}

proptest! {
    #[test]
    fn prop_errors_point_inside_input(input in "\\PC{0,40}") {
        if let Err(err) = parse_query(&input) {
            prop_assert!(err.offset <= input.len());
            prop_assert!(input.is_char_boundary(err.offset));
        }
    }

    #[test]
    fn prop_limit_roundtrips(n in 0u64..1_000_000) {
        let q = parse_query(&format!("MATCH (n) RETURN n LIMIT {n}")).unwrap();
        prop_assert_eq!(q.limit, Some(n));
    }
}
