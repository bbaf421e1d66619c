//! End-to-end optimizer tests: YAML query → prepared plan → evaluation.

use flwor_core::clause::Clause;
use flwor_core::config::EngineConfig;
use flwor_core::expr::Expr;
use flwor_core::hash::hash_serde;
use flwor_core::types::{Item, Value};
use flwor_exec::{Engine, ExecError, Prepared};
use flwor_planner::{parse_yaml_query, NullSink, Rewrite};

fn engine(optimize: bool) -> Engine {
    let cfg = EngineConfig {
        optimize,
        collect_diagnostics: true,
        ..Default::default()
    };
    Engine::new(cfg).unwrap()
}

fn prepare(yaml: &str, optimize: bool) -> Prepared {
    let parsed = parse_yaml_query(yaml).expect("query should load");
    engine(optimize).prepare(parsed).expect("query should compile")
}

fn run(yaml: &str, optimize: bool) -> Result<Vec<Item>, ExecError> {
    let prepared = prepare(yaml, optimize);
    engine(optimize).evaluate(&prepared)
}

fn ints(items: &[Item]) -> Vec<i64> {
    items
        .iter()
        .map(|i| match i {
            Item::Int(v) => *v,
            other => panic!("expected an integer, got {:?}", other),
        })
        .collect()
}

fn applied(prepared: &Prepared, rewrite: Rewrite) -> bool {
    prepared.diagnostics.iter().any(|d| d.rewrite == rewrite)
}

const JOIN: &str = r#"
query:
  flwor:
    clauses:
      - for: { var: x, in: [1, 2] }
      - for: { var: y, in: [1, 2] }
      - where: { eq: ["$x", "$y"] }
    return: ["$x", "$y"]
"#;

const MERGED_WHERES: &str = r#"
query:
  flwor:
    clauses:
      - for: { var: x, at: i, in: [5, 6, 7, 8] }
      - where: { gt: ["$i", 1] }
      - where: { lt: ["$x", 8] }
    return: "$x"
"#;

const NESTED_COUNT: &str = r#"
query:
  flwor:
    clauses:
      - for: { var: x, in: { range: [1, 4] } }
    return:
      flwor:
        clauses:
          - for: { var: y, in: { range: [1, 4] } }
          - count: index
        return: "$index"
"#;

const ORDERED: &str = r#"
query:
  flwor:
    clauses:
      - for: { var: x, in: [3, 1, 2] }
      - let: { var: y, value: { mul: ["$x", 10] } }
      - order_by: [ { key: "$x", descending: true } ]
    return: "$y"
"#;

#[test]
fn identity_loop_over_constants_collapses_to_the_sequence() {
    let yaml = r#"
query:
  flwor:
    clauses:
      - for: { var: x, in: [1, 2, 3] }
    return: "$x"
"#;
    let prepared = prepare(yaml, true);
    assert_eq!(prepared.expr, Expr::Value(Value::ints([1, 2, 3])));
    assert_eq!(prepared.size, Some(3));
    assert_eq!(ints(&run(yaml, true).unwrap()), vec![1, 2, 3]);
}

#[test]
fn constant_let_is_inlined_and_folded() {
    let yaml = r#"
query:
  flwor:
    clauses:
      - let: { var: x, value: 5 }
    return: { add: ["$x", "$x"] }
"#;
    let prepared = prepare(yaml, true);
    assert_eq!(prepared.expr, Expr::int(10));
    assert!(applied(&prepared, Rewrite::InlineLet));
    assert_eq!(ints(&run(yaml, false).unwrap()), vec![10]);
}

#[test]
fn join_condition_moves_onto_the_inner_source() {
    let prepared = prepare(JOIN, true);
    let Expr::Flwor(f) = &prepared.expr else {
        panic!("expected a flwor, got {:?}", prepared.expr);
    };
    assert_eq!(f.clauses.len(), 2);
    assert!(f.clauses.iter().all(|c| matches!(c, Clause::For(_))));
    let Clause::For(inner) = &f.clauses[1] else {
        unreachable!();
    };
    assert!(matches!(inner.expr, Expr::Filter { .. }));
    assert!(applied(&prepared, Rewrite::WherePredicate));

    let expected = vec![1, 1, 2, 2];
    assert_eq!(ints(&run(JOIN, true).unwrap()), expected);
    assert_eq!(ints(&run(JOIN, false).unwrap()), expected);
}

#[test]
fn leading_false_where_empties_the_flwor() {
    let yaml = r#"
query:
  flwor:
    clauses:
      - where: { call: { name: "false" } }
      - for: { var: x, in: [1, 2] }
    return: "$x"
"#;
    let prepared = prepare(yaml, true);
    assert_eq!(prepared.expr, Expr::empty());
    assert_eq!(prepared.size, Some(0));
    assert!(run(yaml, false).unwrap().is_empty());
}

#[test]
fn adjacent_wheres_are_merged() {
    let prepared = prepare(MERGED_WHERES, true);
    let Expr::Flwor(f) = &prepared.expr else {
        panic!("expected a flwor, got {:?}", prepared.expr);
    };
    assert_eq!(f.clauses.len(), 2);
    assert!(matches!(f.clauses[0], Clause::For(_)));
    assert!(matches!(&f.clauses[1], Clause::Where(w) if matches!(w.pred, Expr::And(ref ops) if ops.len() == 2)));
    assert!(applied(&prepared, Rewrite::MergeWheres));

    assert_eq!(ints(&run(MERGED_WHERES, true).unwrap()), vec![6, 7]);
    assert_eq!(ints(&run(MERGED_WHERES, false).unwrap()), vec![6, 7]);
}

#[test]
fn failing_clause_after_a_for_is_deferred() {
    let yaml = r#"
query:
  flwor:
    clauses:
      - for: { var: x, in: [1, 2] }
      - where: { call: { name: empty, args: [ { call: { name: put, args: ["round", "$x"] } } ] } }
      - let: { var: y, value: { call: { name: fail } } }
    return: "$y"
"#;
    let prepared = prepare(yaml, true);
    let Expr::Flwor(f) = &prepared.expr else {
        panic!("expected a flwor, got {:?}", prepared.expr);
    };
    let kinds: Vec<&str> = f.clauses.iter().map(Clause::kind).collect();
    assert_eq!(kinds, vec!["for", "where"]);
    assert!(matches!(f.ret, Expr::Raise { ref code, .. } if code == "FOER0000"));
    assert!(applied(&prepared, Rewrite::Recovered));

    for optimize in [true, false] {
        let prepared = prepare(yaml, optimize);
        let engine = engine(optimize);
        let mut stream = engine.execute(&prepared);
        let err = stream.next().expect("stream should yield the error").unwrap_err();
        assert_eq!(err.code(), Some("FOER0000"));
        assert!(stream.next().is_none());
        // the first round ran up to the return step before the error surfaced
        let rounds: Vec<(&str, &Value)> = stream
            .updates()
            .iter()
            .map(|u| (u.name.as_str(), &u.value))
            .collect();
        assert_eq!(rounds, vec![("round", &Value::int(1))]);
    }
}

#[test]
fn deferred_error_is_silent_for_empty_input() {
    let yaml = r#"
query:
  flwor:
    clauses:
      - for: { var: x, in: [] }
      - let: { var: y, value: { call: { name: fail } } }
    return: "$y"
"#;
    assert!(run(yaml, true).unwrap().is_empty());
    assert!(run(yaml, false).unwrap().is_empty());
}

#[test]
fn error_before_any_for_fails_compilation() {
    let yaml = r#"
query:
  flwor:
    clauses:
      - let: { var: y, value: { idiv: [1, 0] } }
    return: "$y"
"#;
    let parsed = parse_yaml_query(yaml).unwrap();
    let err = engine(true).prepare(parsed).unwrap_err();
    let ExecError::Query(err) = err else {
        panic!("expected a query error, got {:?}", err);
    };
    assert_eq!(err.code(), Some("FOAR0001"));
}

#[test]
fn counted_inner_loop_restarts_per_outer_round() {
    let prepared = prepare(NESTED_COUNT, true);
    let Expr::Flwor(f) = &prepared.expr else {
        panic!("expected a flwor, got {:?}", prepared.expr);
    };
    assert!(matches!(f.ret, Expr::Flwor(_)));

    let expected: Vec<i64> = (0..4).flat_map(|_| 1..=4).collect();
    assert_eq!(ints(&run(NESTED_COUNT, true).unwrap()), expected);
    assert_eq!(ints(&run(NESTED_COUNT, false).unwrap()), expected);
}

#[test]
fn order_by_keeps_non_key_bindings() {
    assert_eq!(ints(&run(ORDERED, true).unwrap()), vec![30, 20, 10]);
    assert_eq!(ints(&run(ORDERED, false).unwrap()), vec![30, 20, 10]);
}

#[test]
fn optimizing_an_optimized_plan_changes_nothing() {
    let cfg = EngineConfig::default();
    for yaml in [JOIN, MERGED_WHERES, NESTED_COUNT, ORDERED] {
        let prepared = prepare(yaml, true);
        let mut scope = prepared.scope.clone();
        let again = flwor_planner::plan(prepared.expr.clone(), &mut scope, &cfg, &mut NullSink)
            .expect("optimized plan should recompile");
        assert_eq!(again, prepared.expr, "plan changed for {}", yaml);
        assert_eq!(hash_serde(&again).unwrap(), prepared.fingerprint);
    }
}

#[test]
fn disabled_optimizer_keeps_clause_order() {
    let prepared = prepare(JOIN, false);
    let Expr::Flwor(f) = &prepared.expr else {
        panic!("expected a flwor, got {:?}", prepared.expr);
    };
    let kinds: Vec<&str> = f.clauses.iter().map(Clause::kind).collect();
    assert_eq!(kinds, vec!["for", "for", "where"]);
    assert!(!applied(&prepared, Rewrite::WherePredicate));
    assert!(!applied(&prepared, Rewrite::HoistWhere));
}
