// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use verdict::ast::{BoolOp, Expr, LiteralStmt, Module, Query, Rule};
use verdict::{
    compile, to_predicate_tree, CompoundOp, FieldOp, InMemoryStore, PartialEvaluator,
    PredicateNode, ResidualExpr, ResidualTerm, Value,
};

use anyhow::Result;

fn tenant_policy() -> verdict::CompiledPolicy {
    let module = Module::new(
        "example",
        vec![Rule::complete(
            "allow",
            None,
            Query::from_exprs(vec![Expr::eq(
                Expr::ref_path("input.tenant"),
                Expr::string("acme"),
            )]),
        )],
    );
    compile(&[module]).expect("compiles")
}

#[test]
fn unknown_tenant_produces_single_field_predicate() -> Result<()> {
    let policy = tenant_policy();
    let store = InMemoryStore::default();
    let mut pe = PartialEvaluator::new(&policy, &store, Value::new_object(), &["input.tenant"]);

    let query = Query::from_exprs(vec![Expr::ref_path("data.example.allow")]);
    let residuals = pe.partial_eval(&query).map_err(anyhow::Error::msg)?;
    assert_eq!(residuals.len(), 1);
    assert_eq!(residuals[0].exprs.len(), 1);

    let tree = to_predicate_tree(&residuals).expect("lowerable");
    assert_eq!(
        tree,
        PredicateNode::Field {
            operator: FieldOp::Eq,
            field: "input.tenant".to_string(),
            value: Value::from("acme"),
        }
    );
    Ok(())
}

#[test]
fn empty_unknowns_match_concrete_evaluation() -> Result<()> {
    let policy = tenant_policy();
    let store = InMemoryStore::default();

    let query = Query::from_exprs(vec![Expr::ref_path("data.example.allow")]);

    let mut pe = PartialEvaluator::new(
        &policy,
        &store,
        Value::from_json_str(r#"{"tenant": "acme"}"#)?,
        &[],
    );
    let residuals = pe.partial_eval(&query).map_err(anyhow::Error::msg)?;
    assert_eq!(residuals.len(), 1, "satisfiable query yields one empty residual");
    assert!(residuals[0].exprs.is_empty());

    let mut pe = PartialEvaluator::new(
        &policy,
        &store,
        Value::from_json_str(r#"{"tenant": "other"}"#)?,
        &[],
    );
    let residuals = pe.partial_eval(&query).map_err(anyhow::Error::msg)?;
    assert!(residuals.is_empty(), "unsatisfiable query yields none");
    Ok(())
}

#[test]
fn copy_propagation_eliminates_aliases() -> Result<()> {
    // t := input.tenant; t == "acme". The residual references
    // input.tenant directly.
    let module = Module::new(
        "example",
        vec![Rule::complete(
            "allow",
            None,
            Query::from_exprs(vec![
                Expr::assign(Expr::var("t"), Expr::ref_path("input.tenant")),
                Expr::eq(Expr::var("t"), Expr::string("acme")),
            ]),
        )],
    );
    let policy = compile(&[module]).expect("compiles");
    let store = InMemoryStore::default();
    let mut pe = PartialEvaluator::new(&policy, &store, Value::new_object(), &["input.tenant"]);

    let query = Query::from_exprs(vec![Expr::ref_path("data.example.allow")]);
    let residuals = pe.partial_eval(&query).map_err(anyhow::Error::msg)?;
    assert_eq!(residuals.len(), 1);
    match &residuals[0].exprs[..] {
        [ResidualExpr::Compare { lhs: ResidualTerm::Ref(path), .. }] => {
            assert_eq!(ResidualTerm::dotted(path), "input.tenant");
        }
        other => panic!("expected one comparison over input.tenant, got {other:?}"),
    }
    Ok(())
}

#[test]
fn equality_disjuncts_collapse_into_membership() -> Result<()> {
    // Two clauses differing only in the compared constant merge into one
    // membership test.
    let module = Module::new(
        "example",
        vec![
            Rule::complete(
                "allow",
                None,
                Query::from_exprs(vec![Expr::eq(
                    Expr::ref_path("input.role"),
                    Expr::string("admin"),
                )]),
            ),
            Rule::complete(
                "allow",
                None,
                Query::from_exprs(vec![Expr::eq(
                    Expr::ref_path("input.role"),
                    Expr::string("operator"),
                )]),
            ),
        ],
    );
    let policy = compile(&[module]).expect("compiles");
    let store = InMemoryStore::default();
    let mut pe = PartialEvaluator::new(&policy, &store, Value::new_object(), &["input.role"]);

    let query = Query::from_exprs(vec![Expr::ref_path("data.example.allow")]);
    let residuals = pe.partial_eval(&query).map_err(anyhow::Error::msg)?;
    assert_eq!(residuals.len(), 1, "disjuncts collapsed");
    match &residuals[0].exprs[..] {
        [ResidualExpr::In {
            value: ResidualTerm::Ref(path),
            collection: ResidualTerm::Value(Value::Set(items)),
        }] => {
            assert_eq!(ResidualTerm::dotted(path), "input.role");
            assert_eq!(items.len(), 2);
        }
        other => panic!("expected membership residual, got {other:?}"),
    }

    let tree = to_predicate_tree(&residuals).expect("lowerable");
    match tree {
        PredicateNode::Field { operator: FieldOp::In, field, .. } => {
            assert_eq!(field, "input.role");
        }
        other => panic!("expected in-node, got {other:?}"),
    }
    Ok(())
}

#[test]
fn negation_lowers_to_not_node() -> Result<()> {
    let module = Module::new(
        "example",
        vec![Rule::complete(
            "allow",
            None,
            Query::from_stmts(vec![LiteralStmt::not_expr(Expr::eq(
                Expr::ref_path("input.banned"),
                Expr::boolean(true),
            ))]),
        )],
    );
    let policy = compile(&[module]).expect("compiles");
    let store = InMemoryStore::default();
    let mut pe = PartialEvaluator::new(&policy, &store, Value::new_object(), &["input.banned"]);

    let query = Query::from_exprs(vec![Expr::ref_path("data.example.allow")]);
    let residuals = pe.partial_eval(&query).map_err(anyhow::Error::msg)?;
    let tree = to_predicate_tree(&residuals).expect("lowerable");
    match tree {
        PredicateNode::Compound { operator: CompoundOp::Not, children } => {
            assert_eq!(children.len(), 1);
        }
        other => panic!("expected not-node, got {other:?}"),
    }
    Ok(())
}

#[test]
fn comparisons_keep_their_operator() -> Result<()> {
    let module = Module::new(
        "example",
        vec![Rule::complete(
            "adult",
            None,
            Query::from_exprs(vec![Expr::compare(
                BoolOp::Ge,
                Expr::ref_path("input.age"),
                Expr::number(18i64),
            )]),
        )],
    );
    let policy = compile(&[module]).expect("compiles");
    let store = InMemoryStore::default();
    let mut pe = PartialEvaluator::new(&policy, &store, Value::new_object(), &["input.age"]);

    let query = Query::from_exprs(vec![Expr::ref_path("data.example.adult")]);
    let residuals = pe.partial_eval(&query).map_err(anyhow::Error::msg)?;
    let tree = to_predicate_tree(&residuals).expect("lowerable");
    assert_eq!(
        tree,
        PredicateNode::Field {
            operator: FieldOp::Ge,
            field: "input.age".to_string(),
            value: Value::from(18i64),
        }
    );
    Ok(())
}

#[test]
fn unresolved_calls_are_rejected_by_lowering() -> Result<()> {
    let module = Module::new(
        "example",
        vec![Rule::complete(
            "allow",
            None,
            Query::from_exprs(vec![Expr::eq(
                Expr::call("lower", vec![Expr::ref_path("input.tenant")]),
                Expr::string("acme"),
            )]),
        )],
    );
    let policy = compile(&[module]).expect("compiles");
    let store = InMemoryStore::default();
    let mut pe = PartialEvaluator::new(&policy, &store, Value::new_object(), &["input.tenant"]);

    let query = Query::from_exprs(vec![Expr::ref_path("data.example.allow")]);
    let residuals = pe.partial_eval(&query).map_err(anyhow::Error::msg)?;
    // The residual itself is representable; only the lowering rejects it.
    assert!(!residuals.is_empty());
    assert!(to_predicate_tree(&residuals).is_err());
    Ok(())
}

#[test]
fn predicate_tree_round_trips_through_json() -> Result<()> {
    let policy = tenant_policy();
    let store = InMemoryStore::default();
    let mut pe = PartialEvaluator::new(&policy, &store, Value::new_object(), &["input.tenant"]);

    let query = Query::from_exprs(vec![Expr::ref_path("data.example.allow")]);
    let residuals = pe.partial_eval(&query).map_err(anyhow::Error::msg)?;
    let tree = to_predicate_tree(&residuals).expect("lowerable");

    let json = tree.to_json().map_err(anyhow::Error::msg)?;
    let parsed = PredicateNode::from_json(&json).map_err(anyhow::Error::msg)?;
    assert_eq!(parsed, tree);
    Ok(())
}
