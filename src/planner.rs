// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use crate::ast::*;
use crate::compiled_policy::{CompiledPolicy, RuleKind};
use crate::errors::PlanError;
use crate::plan::*;
use crate::utils::*;
use crate::value::Value;

use std::collections::BTreeMap;
use std::rc::Rc;

use log::debug;

/// Lowers fully-ground entrypoint queries from a compiled policy into the
/// block-structured register IR. Every choice point the evaluator would
/// create becomes an explicit `Scan`; negation becomes `Not`; variable
/// bindings become local slots. Partially-unknown queries belong in the
/// partial evaluator, not here: any residual search requirement is
/// rejected as a precondition failure.
pub struct Planner {
    policy: CompiledPolicy,
    plan: Plan,
    statics_index: BTreeMap<Value, u32>,
    planned: BTreeMap<String, String>,
}

// Per-function lowering state.
struct FuncBuilder {
    vars: BTreeMap<Rc<str>, Local>,
    loop_locals: BTreeMap<ExprRef, Local>,
    next_local: Local,
    module: Option<Ref<Module>>,
}

impl FuncBuilder {
    fn new() -> FuncBuilder {
        FuncBuilder {
            vars: BTreeMap::new(),
            loop_locals: BTreeMap::new(),
            // 0 and 1 are the input and data documents.
            next_local: 2,
            module: None,
        }
    }

    fn alloc(&mut self) -> Local {
        let l = self.next_local;
        self.next_local += 1;
        l
    }

    fn module_path(&self) -> Option<String> {
        let module = self.module.as_ref()?;
        let mut path = String::from("data");
        for p in &module.package.path {
            path.push('.');
            path.push_str(p);
        }
        Some(path)
    }
}

// What to emit when a clause body completes.
#[derive(Clone)]
enum Tail {
    CompleteValue { value: ExprRef, result: Local },
    PartialSet { key: ExprRef, result: Local },
    PartialObject { key: ExprRef, value: ExprRef, result: Local },
    ComprArray { term: ExprRef, target: Local },
    ComprSet { term: ExprRef, target: Local },
    ComprObject { key: ExprRef, value: ExprRef, target: Local },
    Nothing,
}

impl Planner {
    pub fn new(policy: &CompiledPolicy) -> Planner {
        Planner {
            policy: policy.clone(),
            plan: Plan {
                version: 1,
                ..Plan::default()
            },
            statics_index: BTreeMap::new(),
            planned: BTreeMap::new(),
        }
    }

    /// Plan the given entrypoint rule paths (e.g. `data.example.allow`).
    pub fn plan(policy: &CompiledPolicy, entrypoints: &[&str]) -> Result<Plan, PlanError> {
        let mut planner = Planner::new(policy);
        for path in entrypoints {
            if !path.starts_with("data.") {
                return Err(PlanError::NotGround(format!(
                    "entrypoint `{path}` is not a data path"
                )));
            }
            let func = planner.plan_rule_set(path)?;
            planner.plan.entrypoints.push(Entrypoint {
                name: path.to_string(),
                func,
            });
        }
        planner.validate()?;
        debug!(
            "planned {} function(s) for {} entrypoint(s)",
            planner.plan.funcs.len(),
            entrypoints.len()
        );
        Ok(planner.plan)
    }

    fn const_operand(&mut self, v: Value) -> Operand {
        if let Value::Bool(b) = v {
            return Operand::Bool(b);
        }
        if let Some(idx) = self.statics_index.get(&v) {
            return Operand::Const(*idx);
        }
        let idx = self.plan.statics.len() as u32;
        self.plan.statics.push(v.clone());
        self.statics_index.insert(v, idx);
        Operand::Const(idx)
    }

    // ------------------------------------------------------------------
    // Rule sets and functions

    fn plan_rule_set(&mut self, path: &str) -> Result<String, PlanError> {
        if let Some(name) = self.planned.get(path) {
            return Ok(name.clone());
        }
        if self.policy.inner.functions.contains_key(path) {
            return self.plan_function(path);
        }
        let name = format!("g0.{path}");
        self.planned.insert(path.to_string(), name.clone());

        let rules = self
            .policy
            .inner
            .rules
            .get(path)
            .cloned()
            .unwrap_or_default();
        let kind = rules
            .first()
            .and_then(|r| self.policy.rule_info(r))
            .map(|i| i.kind)
            .unwrap_or(RuleKind::CompleteValue);

        let mut fb = FuncBuilder::new();
        let result = fb.alloc();
        let mut blocks: Vec<Block> = vec![];

        match kind {
            RuleKind::PartialSet => blocks.push(Block {
                stmts: vec![Stmt::MakeSet { target: result }],
            }),
            RuleKind::PartialObject => blocks.push(Block {
                stmts: vec![Stmt::MakeObject { target: result }],
            }),
            _ => {}
        }

        for rule in &rules {
            let info = match self.policy.rule_info(rule) {
                Some(i) => i.clone(),
                None => continue,
            };
            let bodies = match rule.as_ref() {
                Rule::Spec { bodies, .. } => bodies,
                Rule::Default { .. } => continue,
            };
            for body in bodies {
                // Fresh variable scope per clause; locals accumulate
                // across the whole function.
                fb.vars.clear();
                fb.loop_locals.clear();
                fb.module = Some(info.module.clone());

                let value_expr = body
                    .assign
                    .as_ref()
                    .map(|a| a.value.clone())
                    .unwrap_or_else(|| info.value.clone());
                let tail = match kind {
                    RuleKind::CompleteValue | RuleKind::Function => Tail::CompleteValue {
                        value: value_expr,
                        result,
                    },
                    RuleKind::PartialSet => Tail::PartialSet {
                        key: info.key.clone().ok_or_else(|| {
                            PlanError::Internal("set rule without key".to_string())
                        })?,
                        result,
                    },
                    RuleKind::PartialObject => Tail::PartialObject {
                        key: info.key.clone().ok_or_else(|| {
                            PlanError::Internal("object rule without key".to_string())
                        })?,
                        value: value_expr,
                        result,
                    },
                };
                let stmts = self.plan_query(&mut fb, &body.query, 0, &tail)?;
                blocks.push(Block { stmts });
            }
        }

        // Complete rules fall back to their default clause.
        if kind == RuleKind::CompleteValue {
            if let Some(default_rule) = self.policy.inner.default_rules.get(path).cloned() {
                if let Rule::Default { value, .. } = default_rule.as_ref() {
                    let mut stmts = vec![Stmt::IsUndefined { source: result }];
                    let op = self.plan_expr(&mut fb, value, &mut stmts)?;
                    stmts.push(Stmt::AssignVar {
                        source: op,
                        target: result,
                    });
                    blocks.push(Block { stmts });
                }
            }
        }

        blocks.push(Block {
            stmts: vec![Stmt::ReturnLocal { source: result }],
        });

        self.plan.funcs.insert(
            name.clone(),
            Func {
                name: name.clone(),
                params: vec![INPUT_LOCAL, DATA_LOCAL],
                return_local: result,
                blocks,
                num_locals: fb.next_local,
            },
        );
        Ok(name)
    }

    fn plan_function(&mut self, path: &str) -> Result<String, PlanError> {
        if let Some(name) = self.planned.get(path) {
            return Ok(name.clone());
        }
        let name = format!("g0.{path}");
        self.planned.insert(path.to_string(), name.clone());

        let (clauses, arity) = self
            .policy
            .inner
            .functions
            .get(path)
            .cloned()
            .ok_or_else(|| PlanError::Internal(format!("unknown function `{path}`")))?;

        let mut fb = FuncBuilder::new();
        let result = fb.alloc();
        let arg_locals: Vec<Local> = (0..arity).map(|_| fb.alloc()).collect();
        let mut params = vec![INPUT_LOCAL, DATA_LOCAL];
        params.extend(arg_locals.iter().copied());

        let mut blocks: Vec<Block> = vec![];
        for rule in &clauses {
            let info = match self.policy.rule_info(rule) {
                Some(i) => i.clone(),
                None => continue,
            };
            let (patterns, bodies) = match rule.as_ref() {
                Rule::Spec {
                    head: RuleHead::Func { args, .. },
                    bodies,
                    ..
                } => (args.clone(), bodies),
                _ => continue,
            };
            for body in bodies {
                fb.vars.clear();
                fb.loop_locals.clear();
                fb.module = Some(info.module.clone());

                let mut stmts = vec![];
                for (pattern, local) in patterns.iter().zip(arg_locals.iter()) {
                    self.unify_pattern(&mut fb, pattern, Operand::Local(*local), &mut stmts)?;
                }
                let value_expr = body
                    .assign
                    .as_ref()
                    .map(|a| a.value.clone())
                    .unwrap_or_else(|| info.value.clone());
                let tail = Tail::CompleteValue {
                    value: value_expr,
                    result,
                };
                stmts.extend(self.plan_query(&mut fb, &body.query, 0, &tail)?);
                blocks.push(Block { stmts });
            }
        }
        blocks.push(Block {
            stmts: vec![Stmt::ReturnLocal { source: result }],
        });

        self.plan.funcs.insert(
            name.clone(),
            Func {
                name: name.clone(),
                params,
                return_local: result,
                blocks,
                num_locals: fb.next_local,
            },
        );
        Ok(name)
    }

    // ------------------------------------------------------------------
    // Query lowering

    fn plan_query(
        &mut self,
        fb: &mut FuncBuilder,
        query: &Ref<Query>,
        idx: usize,
        tail: &Tail,
    ) -> Result<Vec<Stmt>, PlanError> {
        let order: Vec<usize> = match self.policy.inner.schedules.get(query) {
            Some(order) => order.clone(),
            None => (0..query.stmts.len()).collect(),
        };
        if idx >= order.len() {
            return self.emit_tail(fb, tail);
        }
        let stmt = &query.stmts[order[idx]];

        match &stmt.literal {
            Literal::SomeVars { .. } => self.plan_query(fb, query, idx + 1, tail),
            Literal::Expr { expr, .. } => {
                let loops = self.hoist_loops(fb, expr);
                self.plan_loops(fb, &loops, 0, &mut |planner, fb| {
                    let mut stmts = vec![];
                    planner.plan_condition(fb, expr, &mut stmts)?;
                    stmts.extend(planner.plan_query(fb, query, idx + 1, tail)?);
                    Ok(stmts)
                })
            }
            Literal::NotExpr { expr, .. } => {
                let loops = self.hoist_loops(fb, expr);
                if !loops.is_empty() {
                    return Err(PlanError::NotGround(
                        "iteration inside negation requires search".to_string(),
                    ));
                }
                let mut inner = vec![];
                self.plan_condition(fb, expr, &mut inner)?;
                let mut stmts = vec![Stmt::Not {
                    block: Block { stmts: inner },
                }];
                stmts.extend(self.plan_query(fb, query, idx + 1, tail)?);
                Ok(stmts)
            }
            Literal::SomeIn {
                key,
                value,
                collection,
                ..
            } => {
                let mut stmts = vec![];
                let col = self.plan_expr(fb, collection, &mut stmts)?;
                let source = self.materialize(fb, col, &mut stmts);
                let key_local = fb.alloc();
                let value_local = fb.alloc();

                let mut inner = vec![];
                if let Some(kp) = key {
                    self.unify_pattern(fb, kp, Operand::Local(key_local), &mut inner)?;
                }
                self.unify_pattern(fb, value, Operand::Local(value_local), &mut inner)?;
                inner.extend(self.plan_query(fb, query, idx + 1, tail)?);

                stmts.push(Stmt::Scan {
                    source,
                    key: key_local,
                    value: value_local,
                    block: Block { stmts: inner },
                });
                Ok(stmts)
            }
            Literal::Every {
                key,
                value,
                domain,
                query: body,
                ..
            } => {
                let mut stmts = vec![];
                let dom = self.plan_expr(fb, domain, &mut stmts)?;
                let source = self.materialize(fb, dom, &mut stmts);
                // Undefined domains fail the statement.
                stmts.push(Stmt::IsDefined { source });

                let key_local = fb.alloc();
                let value_local = fb.alloc();
                let flag = fb.alloc();

                if let Some(k) = key {
                    fb.vars.insert(k.clone(), key_local);
                }
                fb.vars.insert(value.clone(), value_local);

                let body_stmts = self.plan_query(fb, body, 0, &Tail::Nothing)?;
                // A counterexample is an element whose body fails; record
                // it in the flag and test for its absence afterwards.
                stmts.push(Stmt::Scan {
                    source,
                    key: key_local,
                    value: value_local,
                    block: Block {
                        stmts: vec![
                            Stmt::Not {
                                block: Block { stmts: body_stmts },
                            },
                            Stmt::AssignVarOnce {
                                source: Operand::Bool(true),
                                target: flag,
                            },
                        ],
                    },
                });
                stmts.push(Stmt::Not {
                    block: Block {
                        stmts: vec![Stmt::IsDefined { source: flag }],
                    },
                });
                stmts.extend(self.plan_query(fb, query, idx + 1, tail)?);
                Ok(stmts)
            }
        }
    }

    fn emit_tail(&mut self, fb: &mut FuncBuilder, tail: &Tail) -> Result<Vec<Stmt>, PlanError> {
        let mut stmts = vec![];
        match tail {
            Tail::CompleteValue { value, result } => {
                let op = self.plan_expr(fb, value, &mut stmts)?;
                stmts.push(Stmt::AssignVarOnce {
                    source: op,
                    target: *result,
                });
            }
            Tail::PartialSet { key, result } => {
                let op = self.plan_expr(fb, key, &mut stmts)?;
                stmts.push(Stmt::SetAdd {
                    set: *result,
                    value: op,
                });
            }
            Tail::PartialObject { key, value, result } => {
                let k = self.plan_expr(fb, key, &mut stmts)?;
                let v = self.plan_expr(fb, value, &mut stmts)?;
                stmts.push(Stmt::ObjectInsertOnce {
                    object: *result,
                    key: k,
                    value: v,
                });
            }
            Tail::ComprArray { term, target } => {
                let op = self.plan_expr(fb, term, &mut stmts)?;
                stmts.push(Stmt::ArrayAppend {
                    array: *target,
                    value: op,
                });
            }
            Tail::ComprSet { term, target } => {
                let op = self.plan_expr(fb, term, &mut stmts)?;
                stmts.push(Stmt::SetAdd {
                    set: *target,
                    value: op,
                });
            }
            Tail::ComprObject { key, value, target } => {
                let k = self.plan_expr(fb, key, &mut stmts)?;
                let v = self.plan_expr(fb, value, &mut stmts)?;
                stmts.push(Stmt::ObjectInsertOnce {
                    object: *target,
                    key: k,
                    value: v,
                });
            }
            Tail::Nothing => {}
        }
        Ok(stmts)
    }

    // ------------------------------------------------------------------
    // Loops

    fn is_unbound_index_var(&self, fb: &FuncBuilder, name: &Rc<str>) -> bool {
        if name.as_ref() == "_" {
            return true;
        }
        if fb.vars.contains_key(name) {
            return false;
        }
        match fb.module_path() {
            Some(mp) => {
                let qualified = format!("{mp}.{name}");
                !self
                    .policy
                    .inner
                    .rule_paths
                    .iter()
                    .any(|p| path_overlaps(&qualified, p))
            }
            None => true,
        }
    }

    fn hoist_loops(&self, fb: &FuncBuilder, expr: &ExprRef) -> Vec<(ExprRef, ExprRef, Rc<str>)> {
        let mut loops = vec![];
        self.hoist_loops_impl(fb, expr, &mut loops);
        loops
    }

    fn hoist_loops_impl(
        &self,
        fb: &FuncBuilder,
        expr: &ExprRef,
        loops: &mut Vec<(ExprRef, ExprRef, Rc<str>)>,
    ) {
        use Expr::*;
        match expr.as_ref() {
            RefBrack { refr, index, .. } => {
                self.hoist_loops_impl(fb, refr, loops);
                match index.as_ref() {
                    Var { name, .. } if self.is_unbound_index_var(fb, name) => {
                        loops.push((expr.clone(), refr.clone(), name.clone()));
                    }
                    _ => self.hoist_loops_impl(fb, index, loops),
                }
            }
            String { .. } | Number { .. } | Bool { .. } | Null { .. } | Var { .. } => (),
            Array { items, .. } | Set { items, .. } => {
                for i in items {
                    self.hoist_loops_impl(fb, i, loops);
                }
            }
            Object { fields, .. } => {
                for (k, v) in fields {
                    self.hoist_loops_impl(fb, k, loops);
                    self.hoist_loops_impl(fb, v, loops);
                }
            }
            Call { params, .. } => {
                for p in params {
                    self.hoist_loops_impl(fb, p, loops);
                }
            }
            RefDot { refr, .. } => self.hoist_loops_impl(fb, refr, loops),
            ArithExpr { lhs, rhs, .. } | BoolExpr { lhs, rhs, .. } | AssignExpr { lhs, rhs, .. } => {
                self.hoist_loops_impl(fb, lhs, loops);
                self.hoist_loops_impl(fb, rhs, loops);
            }
            Membership {
                key,
                value,
                collection,
                ..
            } => {
                if let Some(k) = key {
                    self.hoist_loops_impl(fb, k, loops);
                }
                self.hoist_loops_impl(fb, value, loops);
                self.hoist_loops_impl(fb, collection, loops);
            }
            ArrayCompr { .. } | SetCompr { .. } | ObjectCompr { .. } => (),
        }
    }

    fn plan_loops(
        &mut self,
        fb: &mut FuncBuilder,
        loops: &[(ExprRef, ExprRef, Rc<str>)],
        loop_i: usize,
        build: &mut dyn FnMut(&mut Planner, &mut FuncBuilder) -> Result<Vec<Stmt>, PlanError>,
    ) -> Result<Vec<Stmt>, PlanError> {
        if loop_i >= loops.len() {
            return build(self, fb);
        }
        let (expr, collection, index) = &loops[loop_i];

        let mut stmts = vec![];
        let col = self.plan_expr(fb, collection, &mut stmts)?;
        let source = self.materialize(fb, col, &mut stmts);
        let key_local = fb.alloc();
        let value_local = fb.alloc();
        if index.as_ref() != "_" {
            fb.vars.insert(index.clone(), key_local);
        }
        fb.loop_locals.insert(expr.clone(), value_local);

        let inner = self.plan_loops(fb, loops, loop_i + 1, build)?;
        stmts.push(Stmt::Scan {
            source,
            key: key_local,
            value: value_local,
            block: Block { stmts: inner },
        });
        Ok(stmts)
    }

    fn materialize(&mut self, fb: &mut FuncBuilder, op: Operand, out: &mut Vec<Stmt>) -> Local {
        match op {
            Operand::Local(l) => l,
            other => {
                let l = fb.alloc();
                out.push(Stmt::AssignVar {
                    source: other,
                    target: l,
                });
                l
            }
        }
    }

    // ------------------------------------------------------------------
    // Conditions and assignments

    fn plan_condition(
        &mut self,
        fb: &mut FuncBuilder,
        expr: &ExprRef,
        out: &mut Vec<Stmt>,
    ) -> Result<(), PlanError> {
        match expr.as_ref() {
            Expr::BoolExpr { op, lhs, rhs, .. } => {
                let a = self.plan_expr(fb, lhs, out)?;
                let b = self.plan_expr(fb, rhs, out)?;
                match op {
                    BoolOp::Eq => out.push(Stmt::Equal { a, b }),
                    BoolOp::Ne => out.push(Stmt::NotEqual { a, b }),
                    _ => {
                        let result = fb.alloc();
                        out.push(Stmt::Call {
                            func: compare_builtin(*op).to_string(),
                            args: vec![a, b],
                            result,
                        });
                        out.push(Stmt::Equal {
                            a: Operand::Local(result),
                            b: Operand::Bool(true),
                        });
                    }
                }
                Ok(())
            }
            Expr::AssignExpr { op, lhs, rhs, .. } => self.plan_assign(fb, *op, lhs, rhs, out),
            _ => {
                let op = self.plan_expr(fb, expr, out)?;
                out.push(Stmt::NotEqual {
                    a: op,
                    b: Operand::Bool(false),
                });
                Ok(())
            }
        }
    }

    fn plan_assign(
        &mut self,
        fb: &mut FuncBuilder,
        op: AssignOp,
        lhs: &ExprRef,
        rhs: &ExprRef,
        out: &mut Vec<Stmt>,
    ) -> Result<(), PlanError> {
        let lhs_open = self.pattern_is_open(fb, lhs);
        let rhs_open = match op {
            AssignOp::ColEq => false,
            AssignOp::Eq => self.pattern_is_open(fb, rhs),
        };

        match (op, lhs_open, rhs_open) {
            (AssignOp::ColEq, _, _) | (AssignOp::Eq, true, false) => {
                let source = self.plan_expr(fb, rhs, out)?;
                self.unify_pattern(fb, lhs, source, out)
            }
            (AssignOp::Eq, false, true) => {
                let source = self.plan_expr(fb, lhs, out)?;
                self.unify_pattern(fb, rhs, source, out)
            }
            (AssignOp::Eq, false, false) => {
                let a = self.plan_expr(fb, lhs, out)?;
                let b = self.plan_expr(fb, rhs, out)?;
                out.push(Stmt::Equal { a, b });
                Ok(())
            }
            (AssignOp::Eq, true, true) => Err(PlanError::NotGround(
                "unification of two unbound patterns requires search".to_string(),
            )),
        }
    }

    fn pattern_is_open(&self, fb: &FuncBuilder, expr: &ExprRef) -> bool {
        pattern_vars(expr)
            .iter()
            .any(|v| !fb.vars.contains_key(v))
    }

    fn unify_pattern(
        &mut self,
        fb: &mut FuncBuilder,
        pattern: &ExprRef,
        source: Operand,
        out: &mut Vec<Stmt>,
    ) -> Result<(), PlanError> {
        match pattern.as_ref() {
            Expr::Var { name, .. } => {
                if name.as_ref() == "_" {
                    return Ok(());
                }
                match fb.vars.get(name) {
                    Some(existing) => out.push(Stmt::Equal {
                        a: Operand::Local(*existing),
                        b: source,
                    }),
                    None => {
                        let l = fb.alloc();
                        out.push(Stmt::AssignVar { source, target: l });
                        fb.vars.insert(name.clone(), l);
                    }
                }
                Ok(())
            }
            Expr::Array { items, .. } => {
                let len_local = fb.alloc();
                out.push(Stmt::Len {
                    source,
                    target: len_local,
                });
                let expected = fb.alloc();
                out.push(Stmt::AssignInt {
                    value: items.len() as i64,
                    target: expected,
                });
                out.push(Stmt::Equal {
                    a: Operand::Local(len_local),
                    b: Operand::Local(expected),
                });
                for (i, item) in items.iter().enumerate() {
                    let key = self.const_operand(Value::from(i));
                    let elem = fb.alloc();
                    out.push(Stmt::Dot {
                        source,
                        key,
                        target: elem,
                    });
                    self.unify_pattern(fb, item, Operand::Local(elem), out)?;
                }
                Ok(())
            }
            Expr::Object { fields, .. } => {
                for (k_expr, v_pat) in fields {
                    let key = self.plan_expr(fb, k_expr, out)?;
                    let elem = fb.alloc();
                    out.push(Stmt::Dot {
                        source,
                        key,
                        target: elem,
                    });
                    self.unify_pattern(fb, v_pat, Operand::Local(elem), out)?;
                }
                Ok(())
            }
            _ => {
                let v = self.plan_expr(fb, pattern, out)?;
                out.push(Stmt::Equal { a: v, b: source });
                Ok(())
            }
        }
    }

    // ------------------------------------------------------------------
    // Expressions

    fn plan_expr(
        &mut self,
        fb: &mut FuncBuilder,
        expr: &ExprRef,
        out: &mut Vec<Stmt>,
    ) -> Result<Operand, PlanError> {
        if let Some(l) = fb.loop_locals.get(expr) {
            return Ok(Operand::Local(*l));
        }

        match expr.as_ref() {
            Expr::Null { .. } => Ok(self.const_operand(Value::Null)),
            Expr::Bool { value, .. } => Ok(Operand::Bool(*value)),
            Expr::Number { value, .. } => Ok(self.const_operand(Value::Number(value.clone()))),
            Expr::String { value, .. } => Ok(self.const_operand(Value::String(value.clone()))),
            Expr::Var { name, .. } => self.plan_var(fb, name, out),
            Expr::RefDot { .. } | Expr::RefBrack { .. } => self.plan_ref(fb, expr, out),
            Expr::Array { items, .. } => {
                let target = fb.alloc();
                out.push(Stmt::MakeArray {
                    capacity: items.len() as u32,
                    target,
                });
                for item in items {
                    let v = self.plan_expr(fb, item, out)?;
                    out.push(Stmt::ArrayAppend {
                        array: target,
                        value: v,
                    });
                }
                Ok(Operand::Local(target))
            }
            Expr::Set { items, .. } => {
                let target = fb.alloc();
                out.push(Stmt::MakeSet { target });
                for item in items {
                    let v = self.plan_expr(fb, item, out)?;
                    out.push(Stmt::SetAdd {
                        set: target,
                        value: v,
                    });
                }
                Ok(Operand::Local(target))
            }
            Expr::Object { fields, .. } => {
                let target = fb.alloc();
                out.push(Stmt::MakeObject { target });
                for (k, v) in fields {
                    let key = self.plan_expr(fb, k, out)?;
                    let value = self.plan_expr(fb, v, out)?;
                    out.push(Stmt::ObjectInsert {
                        object: target,
                        key,
                        value,
                    });
                }
                Ok(Operand::Local(target))
            }
            Expr::ArrayCompr { term, query, .. } => {
                let target = fb.alloc();
                out.push(Stmt::MakeArray {
                    capacity: 0,
                    target,
                });
                let tail = Tail::ComprArray {
                    term: term.clone(),
                    target,
                };
                let inner = self.plan_query(fb, query, 0, &tail)?;
                out.push(Stmt::Block {
                    block: Block { stmts: inner },
                });
                Ok(Operand::Local(target))
            }
            Expr::SetCompr { term, query, .. } => {
                let target = fb.alloc();
                out.push(Stmt::MakeSet { target });
                let tail = Tail::ComprSet {
                    term: term.clone(),
                    target,
                };
                let inner = self.plan_query(fb, query, 0, &tail)?;
                out.push(Stmt::Block {
                    block: Block { stmts: inner },
                });
                Ok(Operand::Local(target))
            }
            Expr::ObjectCompr {
                key, value, query, ..
            } => {
                let target = fb.alloc();
                out.push(Stmt::MakeObject { target });
                let tail = Tail::ComprObject {
                    key: key.clone(),
                    value: value.clone(),
                    target,
                };
                let inner = self.plan_query(fb, query, 0, &tail)?;
                out.push(Stmt::Block {
                    block: Block { stmts: inner },
                });
                Ok(Operand::Local(target))
            }
            Expr::Call { fcn, params, .. } => {
                let comps = get_ref_components(fcn).ok_or_else(|| {
                    PlanError::Internal("call target is not a simple reference".to_string())
                })?;
                let dotted = join_path(&comps);
                let mut args = vec![];
                for p in params {
                    args.push(self.plan_expr(fb, p, out)?);
                }
                let func = self.resolve_call_target(fb, &dotted)?;
                let result = fb.alloc();
                out.push(Stmt::Call { func, args, result });
                Ok(Operand::Local(result))
            }
            Expr::ArithExpr { op, lhs, rhs, .. } => {
                let a = self.plan_expr(fb, lhs, out)?;
                let b = self.plan_expr(fb, rhs, out)?;
                let result = fb.alloc();
                out.push(Stmt::Call {
                    func: arith_builtin(*op).to_string(),
                    args: vec![a, b],
                    result,
                });
                Ok(Operand::Local(result))
            }
            Expr::BoolExpr { op, lhs, rhs, .. } => {
                let a = self.plan_expr(fb, lhs, out)?;
                let b = self.plan_expr(fb, rhs, out)?;
                let result = fb.alloc();
                out.push(Stmt::Call {
                    func: compare_builtin(*op).to_string(),
                    args: vec![a, b],
                    result,
                });
                Ok(Operand::Local(result))
            }
            Expr::Membership {
                key: None,
                value,
                collection,
                ..
            } => {
                let v = self.plan_expr(fb, value, out)?;
                let c = self.plan_expr(fb, collection, out)?;
                let result = fb.alloc();
                out.push(Stmt::Call {
                    func: "internal.member_2".to_string(),
                    args: vec![v, c],
                    result,
                });
                Ok(Operand::Local(result))
            }
            Expr::Membership { key: Some(_), .. } => Err(PlanError::Internal(
                "keyed membership is not supported in plans".to_string(),
            )),
            Expr::AssignExpr { .. } => Err(PlanError::Internal(
                "nested unification is not supported in plans".to_string(),
            )),
        }
    }

    fn plan_var(
        &mut self,
        fb: &mut FuncBuilder,
        name: &Rc<str>,
        out: &mut Vec<Stmt>,
    ) -> Result<Operand, PlanError> {
        match name.as_ref() {
            "input" => return Ok(Operand::Local(INPUT_LOCAL)),
            "data" => return Ok(Operand::Local(DATA_LOCAL)),
            _ => {}
        }
        if let Some(l) = fb.vars.get(name) {
            return Ok(Operand::Local(*l));
        }
        // Import alias or same-package rule.
        if let Some(module) = &fb.module {
            if let Some(aliases) = self.policy.inner.imports.get(module) {
                if let Some(path) = aliases.get(name).cloned() {
                    return self.plan_path(fb, &path, out);
                }
            }
        }
        if let Some(mp) = fb.module_path() {
            let qualified = format!("{mp}.{name}");
            if self.policy.inner.rule_paths.contains(&qualified) {
                return self.plan_rule_call(fb, &qualified, out);
            }
        }
        Err(PlanError::NotGround(format!(
            "variable `{name}` is unbound at this point"
        )))
    }

    fn plan_rule_call(
        &mut self,
        fb: &mut FuncBuilder,
        path: &str,
        out: &mut Vec<Stmt>,
    ) -> Result<Operand, PlanError> {
        let func = self.plan_rule_set(path)?;
        let result = fb.alloc();
        out.push(Stmt::Call {
            func,
            args: vec![Operand::Local(INPUT_LOCAL), Operand::Local(DATA_LOCAL)],
            result,
        });
        Ok(Operand::Local(result))
    }

    /// Lower a path rooted at `input` or `data` into dot chains, routing
    /// through rule functions where the path crosses a rule set.
    fn plan_path(
        &mut self,
        fb: &mut FuncBuilder,
        segments: &[Rc<str>],
        out: &mut Vec<Stmt>,
    ) -> Result<Operand, PlanError> {
        let root = segments
            .first()
            .ok_or_else(|| PlanError::Internal("empty path".to_string()))?;
        match root.as_ref() {
            "input" => {
                let mut op = Operand::Local(INPUT_LOCAL);
                for s in &segments[1..] {
                    op = self.plan_dot(fb, op, s, out);
                }
                Ok(op)
            }
            "data" => {
                // Find the rule path this reference enters, if any.
                let dotted = join_path(segments);
                let mut best: Option<String> = None;
                for p in self.policy.inner.rule_paths.iter() {
                    if dotted == *p || dotted.starts_with(&format!("{p}.")) {
                        match &best {
                            Some(b) if b.len() >= p.len() => {}
                            _ => best = Some(p.clone()),
                        }
                    }
                }
                if let Some(rule_path) = best {
                    let op = self.plan_rule_call(fb, &rule_path, out)?;
                    let depth = rule_path.split('.').count();
                    let mut cur = op;
                    for s in &segments[depth..] {
                        cur = self.plan_dot(fb, cur, s, out);
                    }
                    return Ok(cur);
                }
                if self
                    .policy
                    .inner
                    .rule_paths
                    .iter()
                    .any(|p| p.starts_with(&format!("{dotted}.")))
                {
                    return Err(PlanError::Internal(format!(
                        "reference `{dotted}` above rule documents is not plannable"
                    )));
                }
                let mut op = Operand::Local(DATA_LOCAL);
                for s in &segments[1..] {
                    op = self.plan_dot(fb, op, s, out);
                }
                Ok(op)
            }
            _ => Err(PlanError::Internal(format!("path root `{root}`"))),
        }
    }

    fn plan_dot(
        &mut self,
        fb: &mut FuncBuilder,
        source: Operand,
        field: &Rc<str>,
        out: &mut Vec<Stmt>,
    ) -> Operand {
        let key = self.const_operand(Value::String(field.clone()));
        let target = fb.alloc();
        out.push(Stmt::Dot {
            source,
            key,
            target,
        });
        Operand::Local(target)
    }

    fn plan_ref(
        &mut self,
        fb: &mut FuncBuilder,
        expr: &ExprRef,
        out: &mut Vec<Stmt>,
    ) -> Result<Operand, PlanError> {
        // Fully static ref chains route through plan_path so rule sets
        // become function calls; dynamic chains evaluate segment by
        // segment.
        if let Some(comps) = get_ref_components(expr) {
            match comps.first().map(|c| c.as_ref()) {
                Some("input") | Some("data") => return self.plan_path(fb, &comps, out),
                _ => {}
            }
        }

        match expr.as_ref() {
            Expr::RefDot { refr, field, .. } => {
                let base = self.plan_expr(fb, refr, out)?;
                Ok(self.plan_dot(fb, base, field, out))
            }
            Expr::RefBrack { refr, index, .. } => {
                let base = self.plan_expr(fb, refr, out)?;
                let key = self.plan_expr(fb, index, out)?;
                let target = fb.alloc();
                out.push(Stmt::Dot {
                    source: base,
                    key,
                    target,
                });
                Ok(Operand::Local(target))
            }
            _ => Err(PlanError::Internal("not a reference".to_string())),
        }
    }

    fn resolve_call_target(
        &mut self,
        fb: &FuncBuilder,
        dotted: &str,
    ) -> Result<String, PlanError> {
        if self.policy.inner.functions.contains_key(dotted) {
            return self.plan_function(dotted);
        }
        if let Some(mp) = fb.module_path() {
            let qualified = format!("{mp}.{dotted}");
            if self.policy.inner.functions.contains_key(&qualified) {
                return self.plan_function(&qualified);
            }
        }
        // Built-ins pass through by name.
        Ok(dotted.to_string())
    }

    // ------------------------------------------------------------------
    // Validation

    /// Structural sanity of the emitted plan: local indices in range,
    /// break indices within their block nesting. Violations are planner
    /// bugs, never shipped downstream.
    fn validate(&self) -> Result<(), PlanError> {
        for func in self.plan.funcs.values() {
            for block in &func.blocks {
                Self::validate_block(func, block, 1)?;
            }
        }
        Ok(())
    }

    fn validate_block(func: &Func, block: &Block, depth: u32) -> Result<(), PlanError> {
        let check_local = |l: Local| {
            if l >= func.num_locals {
                return Err(PlanError::Internal(format!(
                    "local {l} out of range in `{}`",
                    func.name
                )));
            }
            Ok(())
        };
        let check_operand = |op: &Operand| match op {
            Operand::Local(l) => check_local(*l),
            _ => Ok(()),
        };

        for stmt in &block.stmts {
            match stmt {
                Stmt::AssignVar { source, target }
                | Stmt::AssignVarOnce { source, target } => {
                    check_operand(source)?;
                    check_local(*target)?;
                }
                Stmt::AssignInt { target, .. }
                | Stmt::MakeNull { target }
                | Stmt::MakeArray { target, .. }
                | Stmt::MakeObject { target }
                | Stmt::MakeSet { target }
                | Stmt::ResetLocal { target } => check_local(*target)?,
                Stmt::Dot { source, key, target } => {
                    check_operand(source)?;
                    check_operand(key)?;
                    check_local(*target)?;
                }
                Stmt::Len { source, target } => {
                    check_operand(source)?;
                    check_local(*target)?;
                }
                Stmt::Scan {
                    source,
                    key,
                    value,
                    block,
                } => {
                    check_local(*source)?;
                    check_local(*key)?;
                    check_local(*value)?;
                    Self::validate_block(func, block, depth + 1)?;
                }
                Stmt::Not { block } | Stmt::Block { block } => {
                    Self::validate_block(func, block, depth + 1)?;
                }
                Stmt::Equal { a, b } | Stmt::NotEqual { a, b } => {
                    check_operand(a)?;
                    check_operand(b)?;
                }
                Stmt::Call { args, result, .. } => {
                    for a in args {
                        check_operand(a)?;
                    }
                    check_local(*result)?;
                }
                Stmt::ArrayAppend { array, value } => {
                    check_local(*array)?;
                    check_operand(value)?;
                }
                Stmt::SetAdd { set, value } => {
                    check_local(*set)?;
                    check_operand(value)?;
                }
                Stmt::ObjectInsert { object, key, value }
                | Stmt::ObjectInsertOnce { object, key, value } => {
                    check_local(*object)?;
                    check_operand(key)?;
                    check_operand(value)?;
                }
                Stmt::IsDefined { source } | Stmt::IsUndefined { source } => {
                    check_local(*source)?;
                }
                Stmt::Break { index } => {
                    if *index >= depth {
                        return Err(PlanError::Internal(format!(
                            "break index {index} exceeds block depth {depth} in `{}`",
                            func.name
                        )));
                    }
                }
                Stmt::ReturnLocal { source } => check_local(*source)?,
            }
        }
        Ok(())
    }
}

pub(crate) fn arith_builtin(op: ArithOp) -> &'static str {
    match op {
        ArithOp::Add => "plus",
        ArithOp::Sub => "minus",
        ArithOp::Mul => "mul",
        ArithOp::Div => "div",
        ArithOp::Mod => "rem",
    }
}

fn compare_builtin(op: BoolOp) -> &'static str {
    match op {
        BoolOp::Eq => "equal",
        BoolOp::Ne => "neq",
        BoolOp::Lt => "lt",
        BoolOp::Le => "lte",
        BoolOp::Gt => "gt",
        BoolOp::Ge => "gte",
    }
}
