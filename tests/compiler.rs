// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use verdict::ast::{Expr, Import, Module, Query, Rule};
use verdict::{compile, CompileError, InMemoryStore, Evaluator, Value};

use anyhow::Result;

#[test]
fn mutual_recursion_names_every_rule_in_the_cycle() {
    // p if q; q if p
    let module = Module::new(
        "example",
        vec![
            Rule::complete("p", None, Query::from_exprs(vec![Expr::var("q")])),
            Rule::complete("q", None, Query::from_exprs(vec![Expr::var("p")])),
        ],
    );
    let errors = compile(&[module]).expect_err("recursive policy must not compile");

    let recursion: Vec<_> = errors
        .iter()
        .filter_map(|e| match e {
            CompileError::Recursion { rule, chain } => Some((rule.clone(), chain.clone())),
            _ => None,
        })
        .collect();
    assert_eq!(recursion.len(), 2, "one error per participating rule");
    for (rule, chain) in recursion {
        assert!(rule == "data.example.p" || rule == "data.example.q");
        assert!(chain.len() >= 2, "chain carries the back-reference path");
        assert_eq!(chain.first(), chain.last(), "chain returns to its origin");
    }
}

#[test]
fn self_recursion_is_rejected() {
    let module = Module::new(
        "example",
        vec![Rule::complete(
            "p",
            None,
            Query::from_exprs(vec![Expr::var("p")]),
        )],
    );
    let errors = compile(&[module]).expect_err("self recursion must not compile");
    assert!(errors
        .iter()
        .any(|e| matches!(e, CompileError::Recursion { .. })));
}

#[test]
fn unsafe_variables_are_reported_individually() {
    // x is never generated; y depends on x. Both are reported.
    let module = Module::new(
        "example",
        vec![Rule::complete(
            "p",
            None,
            Query::from_exprs(vec![
                Expr::compare(verdict::ast::BoolOp::Gt, Expr::var("x"), Expr::number(1i64)),
                Expr::assign(Expr::var("y"), Expr::var("x")),
                Expr::compare(verdict::ast::BoolOp::Gt, Expr::var("y"), Expr::number(0i64)),
            ]),
        )],
    );
    let errors = compile(&[module]).expect_err("unsafe vars must not compile");
    let unsafe_vars: Vec<String> = errors
        .iter()
        .filter_map(|e| match e {
            CompileError::UnsafeVar { var, .. } => Some(var.clone()),
            _ => None,
        })
        .collect();
    assert!(unsafe_vars.contains(&"x".to_string()));
    assert!(unsafe_vars.contains(&"y".to_string()), "cascade is preserved");
}

#[test]
fn unresolved_import_is_an_error() {
    let module = Module::with_imports(
        "example",
        vec![Import::new("foo.bar", None)],
        vec![Rule::complete(
            "p",
            None,
            Query::from_exprs(vec![Expr::boolean(true)]),
        )],
    );
    let errors = compile(&[module]).expect_err("bad import root");
    assert!(errors.iter().any(|e| matches!(e, CompileError::Import { .. })));
}

#[test]
fn head_shape_disagreement_is_an_error() {
    let module = Module::new(
        "example",
        vec![
            Rule::complete("p", None, Query::from_exprs(vec![Expr::boolean(true)])),
            Rule::partial_set(
                "p",
                Expr::number(1i64),
                Query::from_exprs(vec![Expr::boolean(true)]),
            ),
        ],
    );
    let errors = compile(&[module]).expect_err("shape mismatch");
    assert!(errors.iter().any(|e| matches!(e, CompileError::Type { .. })));
}

#[test]
fn unknown_function_is_an_error() {
    let module = Module::new(
        "example",
        vec![Rule::complete(
            "p",
            None,
            Query::from_exprs(vec![Expr::call("no.such.function", vec![Expr::number(1i64)])]),
        )],
    );
    let errors = compile(&[module]).expect_err("unknown function");
    assert!(errors.iter().any(|e| matches!(e, CompileError::Type { .. })));
}

#[test]
fn all_errors_are_accumulated_within_a_pass() {
    // Two independent bad imports surface together.
    let module = Module::with_imports(
        "example",
        vec![Import::new("foo.bar", None), Import::new("baz", None)],
        vec![Rule::complete(
            "p",
            None,
            Query::from_exprs(vec![Expr::boolean(true)]),
        )],
    );
    let errors = compile(&[module]).expect_err("bad imports");
    assert_eq!(errors.len(), 2);
}

fn example_modules() -> Vec<verdict::ast::Ref<Module>> {
    vec![Module::new(
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
            Rule::partial_set(
                "roles",
                Expr::var("r"),
                Query::from_stmts(vec![verdict::ast::LiteralStmt::some_in(
                    None,
                    Expr::var("r"),
                    Expr::ref_path("input.groups"),
                )]),
            ),
        ],
    )]
}

#[test]
fn compilation_is_deterministic() -> Result<()> {
    let a = compile(&example_modules()).expect("compiles");
    let b = compile(&example_modules()).expect("compiles");

    // Identical structure...
    let a_paths: Vec<&str> = a.rule_paths().collect();
    let b_paths: Vec<&str> = b.rule_paths().collect();
    assert_eq!(a_paths, b_paths);
    assert_eq!(a.rules().keys().collect::<Vec<_>>(), b.rules().keys().collect::<Vec<_>>());

    // ...and identical behavior.
    let store = InMemoryStore::default();
    let input = Value::from_json_str(r#"{"role": "admin", "groups": ["dev", "ops"]}"#)?;
    let va = Evaluator::new(&a, &store, input.clone()).eval_rule("data.example")?;
    let vb = Evaluator::new(&b, &store, input).eval_rule("data.example")?;
    assert_eq!(va, vb);
    Ok(())
}

#[test]
fn empty_body_rule_compiles_and_holds() -> Result<()> {
    let module = Module::new(
        "example",
        vec![Rule::complete("p", None, Query::from_exprs(vec![]))],
    );
    let policy = compile(&[module]).expect("compiles");
    let store = InMemoryStore::default();
    let mut ev = Evaluator::new(&policy, &store, Value::new_object());
    assert_eq!(ev.eval_rule("data.example.p")?, Value::Bool(true));
    Ok(())
}
