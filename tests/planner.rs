// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use verdict::ast::{Expr, LiteralStmt, Module, Query, Rule};
use verdict::{compile, Plan, PlanError, Planner, Stmt};

use anyhow::Result;

fn admin_policy() -> verdict::CompiledPolicy {
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
    compile(&[module]).expect("compiles")
}

#[test]
fn plans_entrypoint_into_named_function() -> Result<()> {
    let policy = admin_policy();
    let plan = Planner::plan(&policy, &["data.example.allow"]).map_err(anyhow::Error::msg)?;

    assert_eq!(plan.entrypoints.len(), 1);
    assert_eq!(plan.entrypoints[0].name, "data.example.allow");
    let func = plan
        .funcs
        .get(&plan.entrypoints[0].func)
        .expect("entrypoint function exists");

    // input and data documents are the first two parameters.
    assert_eq!(&func.params[..2], &[0, 1]);
    assert!(func.num_locals > 2);
    // The last block returns the rule's result.
    let last = func.blocks.last().expect("blocks are non-empty");
    assert!(matches!(last.stmts.as_slice(), [Stmt::ReturnLocal { .. }]));
    Ok(())
}

#[test]
fn clause_blocks_contain_dot_and_equal() -> Result<()> {
    let policy = admin_policy();
    let plan = Planner::plan(&policy, &["data.example.allow"]).map_err(anyhow::Error::msg)?;
    let func = plan.funcs.values().next().expect("one function");

    let mut saw_dot = false;
    let mut saw_equal = false;
    let mut saw_assign_once = false;
    for block in &func.blocks {
        for stmt in &block.stmts {
            match stmt {
                Stmt::Dot { .. } => saw_dot = true,
                Stmt::Equal { .. } => saw_equal = true,
                Stmt::AssignVarOnce { .. } => saw_assign_once = true,
                _ => {}
            }
        }
    }
    assert!(saw_dot, "input.role lowers to a dot chain");
    assert!(saw_equal, "the comparison lowers to an equality check");
    assert!(saw_assign_once, "the rule value is assigned once");
    Ok(())
}

#[test]
fn partial_set_rules_lower_to_scans_and_set_adds() -> Result<()> {
    let module = Module::new(
        "example",
        vec![Rule::partial_set(
            "names",
            Expr::var("n"),
            Query::from_stmts(vec![LiteralStmt::some_in(
                None,
                Expr::var("n"),
                Expr::ref_path("input.users"),
            )]),
        )],
    );
    let policy = compile(&[module]).expect("compiles");
    let plan = Planner::plan(&policy, &["data.example.names"]).map_err(anyhow::Error::msg)?;

    let func = plan.funcs.get("g0.data.example.names").expect("function");
    let has_scan = func.blocks.iter().any(|b| {
        b.stmts.iter().any(|s| match s {
            Stmt::Scan { block, .. } => block
                .stmts
                .iter()
                .any(|inner| matches!(inner, Stmt::SetAdd { .. })),
            _ => false,
        })
    });
    assert!(has_scan, "iteration becomes a scan with a set insertion");
    assert!(func
        .blocks
        .first()
        .is_some_and(|b| matches!(b.stmts.as_slice(), [Stmt::MakeSet { .. }])));
    Ok(())
}

#[test]
fn negation_lowers_to_not_block() -> Result<()> {
    let module = Module::new(
        "example",
        vec![
            Rule::complete(
                "q",
                None,
                Query::from_exprs(vec![Expr::eq(
                    Expr::ref_path("input.x"),
                    Expr::number(1i64),
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
    let plan = Planner::plan(&policy, &["data.example.p"]).map_err(anyhow::Error::msg)?;

    let func = plan.funcs.get("g0.data.example.p").expect("function");
    let has_not = func
        .blocks
        .iter()
        .any(|b| b.stmts.iter().any(|s| matches!(s, Stmt::Not { .. })));
    assert!(has_not);
    // The negated rule is planned as its own function.
    assert!(plan.funcs.contains_key("g0.data.example.q"));
    Ok(())
}

#[test]
fn functions_plan_with_argument_parameters() -> Result<()> {
    let module = Module::new(
        "example",
        vec![
            Rule::function(
                "double",
                vec![Expr::var("x")],
                Some(Expr::arith(
                    verdict::ast::ArithOp::Mul,
                    Expr::var("x"),
                    Expr::number(2i64),
                )),
                Query::from_exprs(vec![]),
            ),
            Rule::complete(
                "result",
                Some(Expr::call("double", vec![Expr::number(21i64)])),
                Query::from_exprs(vec![]),
            ),
        ],
    );
    let policy = compile(&[module]).expect("compiles");
    let plan = Planner::plan(&policy, &["data.example.result"]).map_err(anyhow::Error::msg)?;

    let func = plan
        .funcs
        .get("g0.data.example.double")
        .expect("planned function");
    assert_eq!(func.params.len(), 3, "input, data and one argument");
    Ok(())
}

#[test]
fn iteration_inside_negation_is_rejected() {
    // not input.arr[_] requires searching the collection; the planner
    // treats that as a precondition failure.
    let module = Module::new(
        "example",
        vec![Rule::complete(
            "p",
            None,
            Query::from_stmts(vec![LiteralStmt::not_expr(Expr::ref_brack(
                Expr::ref_path("input.arr"),
                Expr::var("_"),
            ))]),
        )],
    );
    let policy = compile(&[module]).expect("compiles");
    match Planner::plan(&policy, &["data.example.p"]) {
        Err(PlanError::NotGround(_)) => {}
        other => panic!("expected NotGround, got {other:?}"),
    }
}

#[test]
fn non_data_entrypoints_are_rejected() {
    let policy = admin_policy();
    assert!(matches!(
        Planner::plan(&policy, &["input.role"]),
        Err(PlanError::NotGround(_))
    ));
}

#[test]
fn plan_serializes_and_round_trips() -> Result<()> {
    let policy = admin_policy();
    let plan = Planner::plan(&policy, &["data.example.allow"]).map_err(anyhow::Error::msg)?;

    let json = plan.to_json().map_err(anyhow::Error::msg)?;
    let parsed: Plan = serde_json::from_str(&json)?;
    assert_eq!(parsed, plan);
    Ok(())
}

#[test]
fn every_lowering_uses_counterexample_flag() -> Result<()> {
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
                    verdict::ast::BoolOp::Gt,
                    Expr::var("x"),
                    Expr::number(0i64),
                )]),
            )]),
        )],
    );
    let policy = compile(&[module]).expect("compiles");
    let plan =
        Planner::plan(&policy, &["data.example.all_positive"]).map_err(anyhow::Error::msg)?;

    let func = plan
        .funcs
        .get("g0.data.example.all_positive")
        .expect("function");
    // A scan recording counterexamples, followed by a not-check.
    let clause = &func.blocks[0];
    let scan_pos = clause
        .stmts
        .iter()
        .position(|s| matches!(s, Stmt::Scan { .. }))
        .expect("scan over the domain");
    assert!(clause.stmts[scan_pos + 1..]
        .iter()
        .any(|s| matches!(s, Stmt::Not { .. })));
    Ok(())
}
