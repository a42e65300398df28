// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use verdict::ast::{BoolOp, Expr, LiteralStmt, Module, Query, Rule};
use verdict::{compile, CompiledPolicy, EvalError, EvalOptions, Evaluator, InMemoryStore, Value};

use anyhow::Result;

fn eval_with(
    policy: &CompiledPolicy,
    data_json: &str,
    input_json: &str,
) -> Result<Evaluator> {
    let store = InMemoryStore::from_json_str(data_json)?;
    let input = Value::from_json_str(input_json)?;
    Ok(Evaluator::new(policy, &store, input))
}

#[test]
fn admin_role_allows_exactly_once() -> Result<()> {
    let module = Module::new(
        "example",
        vec![Rule::complete(
            "allow",
            None,
            Query::from_exprs(vec![Expr::eq(
                Expr::ref_path("input.role"),
                Expr::string("admin"),
            )]),
        )],
    );
    let policy = compile(&[module]).expect("compiles");

    let mut ev = eval_with(&policy, "{}", r#"{"role": "admin"}"#)?;
    assert_eq!(ev.eval_rule("data.example.allow")?, Value::Bool(true));

    let query = Query::from_exprs(vec![Expr::eq(
        Expr::ref_path("data.example.allow"),
        Expr::boolean(true),
    )]);
    let mut ev = eval_with(&policy, "{}", r#"{"role": "admin"}"#)?;
    let results = ev.eval_query(&query).map_err(anyhow::Error::msg)?;
    assert_eq!(results.result.len(), 1);

    // A guest gets an undefined decision: no solutions, no error.
    let mut ev = eval_with(&policy, "{}", r#"{"role": "guest"}"#)?;
    assert_eq!(ev.eval_rule("data.example.allow")?, Value::Undefined);
    let mut ev = eval_with(&policy, "{}", r#"{"role": "guest"}"#)?;
    let results = ev.eval_query(&query).map_err(anyhow::Error::msg)?;
    assert!(results.result.is_empty());
    Ok(())
}

#[test]
fn incremental_set_clauses_union_regardless_of_order() -> Result<()> {
    let clauses = |first: i64, second: i64| {
        Module::new(
            "example",
            vec![
                Rule::partial_set(
                    "s",
                    Expr::var("x"),
                    Query::from_exprs(vec![Expr::unify(Expr::var("x"), Expr::number(first))]),
                ),
                Rule::partial_set(
                    "s",
                    Expr::var("x"),
                    Query::from_exprs(vec![Expr::unify(Expr::var("x"), Expr::number(second))]),
                ),
            ],
        )
    };

    let expected = {
        let mut s = std::collections::BTreeSet::new();
        s.insert(Value::from(1i64));
        s.insert(Value::from(2i64));
        Value::from(s)
    };

    for (a, b) in [(1i64, 2i64), (2i64, 1i64)] {
        let policy = compile(&[clauses(a, b)]).expect("compiles");
        let mut ev = eval_with(&policy, "{}", "{}")?;
        assert_eq!(ev.eval_rule("data.example.s")?, expected);
    }
    Ok(())
}

#[test]
fn negation_of_undefined_document_succeeds() -> Result<()> {
    // q is a defined rule that derives no value for this input.
    let module = Module::new(
        "example",
        vec![
            Rule::complete(
                "q",
                None,
                Query::from_exprs(vec![Expr::eq(
                    Expr::ref_path("input.missing"),
                    Expr::string("x"),
                )]),
            ),
            Rule::complete(
                "p",
                None,
                Query::from_stmts(vec![LiteralStmt::not_expr(Expr::var("q"))]),
            ),
        ],
    );
    let policy = compile(&[module]).expect("compiles");
    let mut ev = eval_with(&policy, "{}", "{}")?;
    assert_eq!(ev.eval_rule("data.example.p")?, Value::Bool(true));
    Ok(())
}

#[test]
fn default_rule_fires_only_without_derived_value() -> Result<()> {
    let module = Module::new(
        "example",
        vec![
            Rule::default("allow", Expr::boolean(false)),
            Rule::complete(
                "allow",
                None,
                Query::from_exprs(vec![Expr::eq(
                    Expr::ref_path("input.role"),
                    Expr::string("admin"),
                )]),
            ),
        ],
    );
    let policy = compile(&[module]).expect("compiles");

    let mut ev = eval_with(&policy, "{}", r#"{"role": "admin"}"#)?;
    assert_eq!(ev.eval_rule("data.example.allow")?, Value::Bool(true));

    let mut ev = eval_with(&policy, "{}", r#"{"role": "guest"}"#)?;
    assert_eq!(ev.eval_rule("data.example.allow")?, Value::Bool(false));
    Ok(())
}

#[test]
fn conflicting_complete_rules_error() -> Result<()> {
    let module = Module::new(
        "example",
        vec![
            Rule::complete(
                "v",
                Some(Expr::number(1i64)),
                Query::from_exprs(vec![]),
            ),
            Rule::complete(
                "v",
                Some(Expr::number(2i64)),
                Query::from_exprs(vec![]),
            ),
        ],
    );
    let policy = compile(&[module]).expect("compiles");
    let mut ev = eval_with(&policy, "{}", "{}")?;
    match ev.eval_rule("data.example.v") {
        Err(EvalError::Conflict { .. }) => Ok(()),
        other => panic!("expected conflict, got {other:?}"),
    }
}

#[test]
fn iteration_over_input_binds_loop_variables() -> Result<()> {
    // high contains name if input.servers[_].name = name ... modeled with
    // an explicit generator.
    let module = Module::new(
        "example",
        vec![Rule::partial_set(
            "names",
            Expr::var("n"),
            Query::from_stmts(vec![
                LiteralStmt::some_in(None, Expr::var("s"), Expr::ref_path("input.servers")),
                LiteralStmt::expr(Expr::unify(
                    Expr::var("n"),
                    Expr::ref_dot(Expr::var("s"), "name"),
                )),
            ]),
        )],
    );
    let policy = compile(&[module]).expect("compiles");
    let mut ev = eval_with(
        &policy,
        "{}",
        r#"{"servers": [{"name": "web"}, {"name": "db"}]}"#,
    )?;
    let v = ev.eval_rule("data.example.names")?;
    let names = v.as_set().map_err(anyhow::Error::msg)?;
    assert_eq!(names.len(), 2);
    assert!(names.contains(&Value::from("web")));
    assert!(names.contains(&Value::from("db")));
    Ok(())
}

#[test]
fn bracket_iteration_hoists_a_generator() -> Result<()> {
    // has_two if input.arr[x] == 2. x is unbound, so the reference
    // iterates the array.
    let module = Module::new(
        "example",
        vec![Rule::complete(
            "has_two",
            None,
            Query::from_exprs(vec![Expr::eq(
                Expr::ref_brack(Expr::ref_path("input.arr"), Expr::var("x")),
                Expr::number(2i64),
            )]),
        )],
    );
    let policy = compile(&[module]).expect("compiles");

    let mut ev = eval_with(&policy, "{}", r#"{"arr": [1, 2, 3]}"#)?;
    assert_eq!(ev.eval_rule("data.example.has_two")?, Value::Bool(true));

    let mut ev = eval_with(&policy, "{}", r#"{"arr": [1, 3]}"#)?;
    assert_eq!(ev.eval_rule("data.example.has_two")?, Value::Undefined);
    Ok(())
}

#[test]
fn solution_callback_fires_per_binding() -> Result<()> {
    let module = Module::new(
        "example",
        vec![Rule::partial_set(
            "s",
            Expr::var("x"),
            Query::from_stmts(vec![LiteralStmt::some_in(
                None,
                Expr::var("x"),
                Expr::array(vec![Expr::number(1i64), Expr::number(2i64)]),
            )]),
        )],
    );
    let policy = compile(&[module]).expect("compiles");
    let mut ev = eval_with(&policy, "{}", "{}")?;

    let query = Query::from_stmts(vec![LiteralStmt::some_in(
        None,
        Expr::var("v"),
        Expr::ref_path("data.example.s"),
    )]);
    let mut seen = 0;
    ev.eval_query_with(&query, &mut |_solution| seen += 1)
        .map_err(anyhow::Error::msg)?;
    assert_eq!(seen, 2);
    Ok(())
}

#[test]
fn every_statement_requires_all_elements() -> Result<()> {
    let module = Module::new(
        "example",
        vec![Rule::complete(
            "all_positive",
            None,
            Query::from_stmts(vec![LiteralStmt::every(
                None,
                "x",
                Expr::ref_path("input.nums"),
                Query::from_exprs(vec![Expr::compare(
                    BoolOp::Gt,
                    Expr::var("x"),
                    Expr::number(0i64),
                )]),
            )]),
        )],
    );
    let policy = compile(&[module]).expect("compiles");

    let mut ev = eval_with(&policy, "{}", r#"{"nums": [1, 2, 3]}"#)?;
    assert_eq!(ev.eval_rule("data.example.all_positive")?, Value::Bool(true));

    let mut ev = eval_with(&policy, "{}", r#"{"nums": [1, -2, 3]}"#)?;
    assert_eq!(ev.eval_rule("data.example.all_positive")?, Value::Undefined);
    Ok(())
}

#[test]
fn user_functions_apply_and_memoize() -> Result<()> {
    let module = Module::new(
        "example",
        vec![
            Rule::function(
                "add_one",
                vec![Expr::var("x")],
                Some(Expr::arith(
                    verdict::ast::ArithOp::Add,
                    Expr::var("x"),
                    Expr::number(1i64),
                )),
                Query::from_exprs(vec![]),
            ),
            Rule::complete(
                "result",
                Some(Expr::call("add_one", vec![Expr::number(41i64)])),
                Query::from_exprs(vec![]),
            ),
        ],
    );
    let policy = compile(&[module]).expect("compiles");
    let mut ev = eval_with(&policy, "{}", "{}")?;
    assert_eq!(ev.eval_rule("data.example.result")?, Value::from(42i64));
    Ok(())
}

#[test]
fn comprehension_materializes_eagerly() -> Result<()> {
    // doubled := [x * 2 | some x in input.nums]
    let compr_body = Query::from_stmts(vec![LiteralStmt::some_in(
        None,
        Expr::var("x"),
        Expr::ref_path("input.nums"),
    )]);
    let module = Module::new(
        "example",
        vec![Rule::complete(
            "doubled",
            Some(Expr::array_compr(
                Expr::arith(verdict::ast::ArithOp::Mul, Expr::var("x"), Expr::number(2i64)),
                compr_body,
            )),
            Query::from_exprs(vec![]),
        )],
    );
    let policy = compile(&[module]).expect("compiles");
    let mut ev = eval_with(&policy, "{}", r#"{"nums": [1, 2, 3]}"#)?;
    assert_eq!(
        ev.eval_rule("data.example.doubled")?,
        Value::from_json_str("[2, 4, 6]")?
    );
    Ok(())
}

#[test]
fn builtin_dispatch_and_strictness() -> Result<()> {
    let module = Module::new(
        "example",
        vec![Rule::complete(
            "n",
            Some(Expr::call("count", vec![Expr::ref_path("input.role")])),
            Query::from_exprs(vec![]),
        )],
    );
    let policy = compile(&[module]).expect("compiles");

    let mut ev = eval_with(&policy, "{}", r#"{"role": "admin"}"#)?;
    assert_eq!(ev.eval_rule("data.example.n")?, Value::from(5i64));

    // count of a number is a builtin error; strict mode surfaces it.
    let mut ev = eval_with(&policy, "{}", r#"{"role": 42}"#)?;
    assert!(matches!(
        ev.eval_rule("data.example.n"),
        Err(EvalError::Builtin { .. })
    ));

    // Non-strict mode turns it into an undefined decision.
    let store = InMemoryStore::default();
    let mut ev = Evaluator::new(&policy, &store, Value::from_json_str(r#"{"role": 42}"#)?)
        .with_options(EvalOptions {
            strict_builtin_errors: false,
            ..EvalOptions::default()
        });
    assert_eq!(ev.eval_rule("data.example.n")?, Value::Undefined);
    Ok(())
}

#[test]
fn rule_indexing_never_changes_results() -> Result<()> {
    let module = Module::new(
        "example",
        vec![
            Rule::complete(
                "tier",
                Some(Expr::string("gold")),
                Query::from_exprs(vec![Expr::eq(
                    Expr::ref_path("input.role"),
                    Expr::string("admin"),
                )]),
            ),
            Rule::complete(
                "tier",
                Some(Expr::string("bronze")),
                Query::from_exprs(vec![Expr::eq(
                    Expr::ref_path("input.role"),
                    Expr::string("guest"),
                )]),
            ),
        ],
    );
    let policy = compile(&[module]).expect("compiles");

    for input in [r#"{"role": "admin"}"#, r#"{"role": "guest"}"#, r#"{"role": "other"}"#] {
        let store = InMemoryStore::default();
        let mut indexed = Evaluator::new(&policy, &store, Value::from_json_str(input)?);
        let mut scanned = Evaluator::new(&policy, &store, Value::from_json_str(input)?)
            .with_options(EvalOptions {
                enable_rule_index: false,
                ..EvalOptions::default()
            });
        assert_eq!(
            indexed.eval_rule("data.example.tier")?,
            scanned.eval_rule("data.example.tier")?,
        );
    }
    Ok(())
}

#[test]
fn base_and_virtual_documents_merge() -> Result<()> {
    let module = Module::new(
        "example",
        vec![Rule::complete(
            "derived",
            Some(Expr::ref_path("data.config.limit")),
            Query::from_exprs(vec![]),
        )],
    );
    let policy = compile(&[module]).expect("compiles");
    let mut ev = eval_with(&policy, r#"{"config": {"limit": 10}}"#, "{}")?;
    assert_eq!(ev.eval_rule("data.example.derived")?, Value::from(10i64));
    // The base document is still readable alongside the virtual one.
    assert_eq!(ev.eval_rule("data.config.limit")?, Value::from(10i64));
    Ok(())
}

#[test]
fn query_bindings_are_reported_per_solution() -> Result<()> {
    let module = Module::new(
        "example",
        vec![Rule::partial_set(
            "s",
            Expr::var("x"),
            Query::from_stmts(vec![LiteralStmt::some_in(
                None,
                Expr::var("x"),
                Expr::array(vec![
                    Expr::number(1i64),
                    Expr::number(2i64),
                    Expr::number(3i64),
                ]),
            )]),
        )],
    );
    let policy = compile(&[module]).expect("compiles");
    let mut ev = eval_with(&policy, "{}", "{}")?;

    let query = Query::from_stmts(vec![LiteralStmt::some_in(
        None,
        Expr::var("v"),
        Expr::ref_path("data.example.s"),
    )]);
    let results = ev.eval_query(&query).map_err(anyhow::Error::msg)?;
    assert_eq!(results.result.len(), 3);
    let bound: Vec<Value> = results
        .result
        .iter()
        .map(|r| r.bindings["v"].clone())
        .collect();
    assert_eq!(bound, vec![Value::from(1i64), Value::from(2i64), Value::from(3i64)]);
    Ok(())
}

#[test]
fn cancellation_aborts_evaluation() -> Result<()> {
    let module = Module::new(
        "example",
        vec![Rule::complete(
            "p",
            None,
            Query::from_exprs(vec![Expr::eq(
                Expr::ref_path("input.role"),
                Expr::string("admin"),
            )]),
        )],
    );
    let policy = compile(&[module]).expect("compiles");
    let mut ev = eval_with(&policy, "{}", r#"{"role": "admin"}"#)?;
    ev.cancel_flag().cancel();
    assert!(matches!(
        ev.eval_rule("data.example.p"),
        Err(EvalError::Cancelled)
    ));
    Ok(())
}

#[test]
fn engine_front_compiles_once_and_evaluates() -> Result<()> {
    let mut engine = verdict::Engine::new();
    engine.add_module(Module::new(
        "example",
        vec![Rule::complete(
            "allow",
            None,
            Query::from_exprs(vec![Expr::eq(
                Expr::ref_path("input.role"),
                Expr::string("admin"),
            )]),
        )],
    ));
    engine.add_data(Value::from_json_str(r#"{"config": {"x": 1}}"#)?)?;

    engine.set_input(Value::from_json_str(r#"{"role": "admin"}"#)?);
    assert!(engine.allowed("data.example.allow")?);

    engine.set_input(Value::from_json_str(r#"{"role": "guest"}"#)?);
    assert!(!engine.allowed("data.example.allow")?);
    Ok(())
}

#[test]
fn undefined_decision_is_not_an_error() -> Result<()> {
    let module = Module::new(
        "example",
        vec![Rule::complete(
            "p",
            None,
            Query::from_exprs(vec![Expr::eq(
                Expr::ref_path("input.x"),
                Expr::number(1i64),
            )]),
        )],
    );
    let policy = compile(&[module]).expect("compiles");
    let mut ev = eval_with(&policy, "{}", "{}")?;
    // Distinguishable from an error by construction.
    assert_eq!(ev.eval_rule("data.example.p")?, Value::Undefined);
    Ok(())
}
