// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use crate::ast::*;
use crate::bindings::Bindings;
use crate::builtins::BuiltinRegistry;
use crate::compiled_policy::*;
use crate::errors::EvalError;
use crate::storage::Storage;
use crate::utils::*;
use crate::value::Value;

use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::debug;
use serde::Serialize;

/// Cooperative cancellation signal. Cloneable; any clone cancels every
/// evaluation holding the flag. Checked at statement boundaries and at
/// each generator iteration.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> CancelFlag {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Per-query evaluation settings.
#[derive(Debug, Clone)]
pub struct EvalOptions {
    /// Errors raised by built-ins abort the query. When false, they are
    /// treated as undefined results instead.
    pub strict_builtin_errors: bool,
    /// Use the rule index for candidate selection. Disabling forces a
    /// full scan of every rule set; results must be identical.
    pub enable_rule_index: bool,
}

impl Default for EvalOptions {
    fn default() -> Self {
        EvalOptions {
            strict_builtin_errors: true,
            enable_rule_index: true,
        }
    }
}

/// One satisfying assignment for a query.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct QueryResult {
    // Expressions is shown first to match the decision log format.
    pub expressions: Vec<Value>,
    #[serde(skip_serializing_if = "Value::is_empty_object")]
    pub bindings: Value,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct QueryResults {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub result: Vec<QueryResult>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ContextKind {
    UserQuery,
    ArrayCompr,
    SetCompr,
    ObjectCompr,
    RuleValue(RuleKind),
    Exists,
}

// One query-evaluation frame: what to do when the statement chain
// completes (yield a solution, collect a comprehension element, merge a
// rule head).
#[derive(Debug)]
struct Context {
    kind: ContextKind,
    key_expr: Option<ExprRef>,
    output_expr: Option<ExprRef>,
    value: Value,
    results: QueryResults,
    expr_values: Vec<Value>,
    count: usize,
    early_stop: bool,
}

impl Context {
    fn new(kind: ContextKind, value: Value) -> Context {
        Context {
            kind,
            key_expr: None,
            output_expr: None,
            value,
            results: QueryResults::default(),
            expr_values: vec![],
            count: 0,
            early_stop: false,
        }
    }
}

#[derive(Debug)]
struct LoopExpr {
    // The whole `refr[index]` node; its per-element value is recorded so
    // chained lookups resolve against the current element.
    expr: ExprRef,
    collection: ExprRef,
    index: Rc<str>,
}

/// The topdown virtual machine: recursive descent over scheduled
/// statements with unification, negation as failure and trail-based
/// backtracking. One evaluator per query; the compiled policy and the
/// document snapshot are shared read-only.
pub struct Evaluator {
    policy: CompiledPolicy,
    input: Value,
    data: Value,
    bindings: Bindings,
    loop_values: BTreeMap<ExprRef, Value>,
    contexts: Vec<Context>,
    current_module: Option<Ref<Module>>,

    // Virtual document cache: rule-set paths already evaluated and merged
    // into `data`.
    evaluated_paths: BTreeSet<String>,
    // Function results per (path, argument values).
    func_cache: BTreeMap<(String, Vec<Value>), Value>,
    // Comprehension results per (body, closed-over bindings).
    compr_cache: BTreeMap<(Ref<Query>, Vec<Value>), Value>,
    // Successful built-in calls per (name, argument values).
    builtin_cache: BTreeMap<(String, Vec<Value>), Value>,

    // Rule sets currently being evaluated. The compiler rejects
    // recursion, so a repeat here is an internal invariant breach.
    active_paths: Vec<String>,

    registry: BuiltinRegistry,
    options: EvalOptions,
    cancel: CancelFlag,
}

impl Evaluator {
    /// Create an evaluator over a point-in-time snapshot. The base
    /// document is materialized once; the snapshot is not consulted
    /// again.
    pub fn new(policy: &CompiledPolicy, snapshot: &dyn Storage, input: Value) -> Evaluator {
        let data = snapshot.read(&[]).unwrap_or_else(|_| Value::new_object());
        Evaluator {
            policy: policy.clone(),
            input,
            data,
            bindings: Bindings::new(),
            loop_values: BTreeMap::new(),
            contexts: vec![],
            current_module: None,
            evaluated_paths: BTreeSet::new(),
            func_cache: BTreeMap::new(),
            compr_cache: BTreeMap::new(),
            builtin_cache: BTreeMap::new(),
            active_paths: vec![],
            registry: BuiltinRegistry::with_defaults(),
            options: EvalOptions::default(),
            cancel: CancelFlag::new(),
        }
    }

    pub fn with_options(mut self, options: EvalOptions) -> Evaluator {
        self.options = options;
        self
    }

    pub fn with_registry(mut self, registry: BuiltinRegistry) -> Evaluator {
        self.registry = registry;
        self
    }

    /// Handle for cancelling this evaluation from another thread.
    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    /// Evaluate a query, returning every satisfying assignment in
    /// deterministic order.
    pub fn eval_query(&mut self, query: &Ref<Query>) -> Result<QueryResults, EvalError> {
        let mut ctx = Context::new(ContextKind::UserQuery, Value::Undefined);
        ctx.expr_values = vec![Value::Undefined; query.stmts.len()];
        self.contexts.push(ctx);

        let outcome = self.eval_query_in_context(query);
        let ctx = self.contexts.pop().ok_or_else(|| internal("context stack underflow"))?;
        outcome?;

        debug!("query produced {} result(s)", ctx.results.result.len());
        Ok(ctx.results)
    }

    /// Evaluate a query, invoking `on_solution` once per distinct
    /// satisfying binding.
    pub fn eval_query_with(
        &mut self,
        query: &Ref<Query>,
        on_solution: &mut dyn FnMut(&QueryResult),
    ) -> Result<(), EvalError> {
        let results = self.eval_query(query)?;
        for r in &results.result {
            on_solution(r);
        }
        Ok(())
    }

    /// Evaluate a query with package-relative name resolution.
    pub fn eval_query_in_module(
        &mut self,
        query: &Ref<Query>,
        module: &Ref<Module>,
    ) -> Result<QueryResults, EvalError> {
        let prev = self.current_module.replace(module.clone());
        let outcome = self.eval_query(query);
        self.current_module = prev;
        outcome
    }

    /// Value of a virtual document path such as `data.example.allow`.
    /// An undefined decision comes back as `Value::Undefined`, which is
    /// distinct from any error.
    pub fn eval_rule(&mut self, path: &str) -> Result<Value, EvalError> {
        let segments: Vec<Rc<str>> = path.split('.').map(Rc::from).collect();
        match segments.first().map(|s| s.as_ref()) {
            Some("data") => self.resolve_data_path(&segments[1..]),
            _ => Err(internal(&format!("`{path}` is not a data path"))),
        }
    }

    fn check_cancelled(&self) -> Result<(), EvalError> {
        if self.cancel.is_cancelled() {
            return Err(EvalError::Cancelled);
        }
        Ok(())
    }

    fn current_module_path(&self) -> Option<String> {
        let module = self.current_module.as_ref()?;
        let mut path = String::from("data");
        for p in &module.package.path {
            path.push('.');
            path.push_str(p);
        }
        Some(path)
    }

    // ------------------------------------------------------------------
    // Statement evaluation

    fn eval_query_in_context(&mut self, query: &Ref<Query>) -> Result<bool, EvalError> {
        let order: Vec<usize> = match self.policy.inner.schedules.get(query) {
            Some(order) => order.clone(),
            None => (0..query.stmts.len()).collect(),
        };
        self.eval_stmt_at(query, &order, 0)
    }

    fn eval_stmt_at(
        &mut self,
        query: &Ref<Query>,
        order: &[usize],
        idx: usize,
    ) -> Result<bool, EvalError> {
        self.check_cancelled()?;

        if idx >= order.len() {
            return self.eval_output();
        }

        let stmt = &query.stmts[order[idx]];
        let loops = self.hoist_loops(&stmt.literal);
        self.eval_stmt_with_loops(query, order, idx, stmt, &loops, 0)
    }

    #[allow(clippy::too_many_arguments)]
    fn eval_stmt_with_loops(
        &mut self,
        query: &Ref<Query>,
        order: &[usize],
        idx: usize,
        stmt: &LiteralStmt,
        loops: &[LoopExpr],
        loop_i: usize,
    ) -> Result<bool, EvalError> {
        if loop_i < loops.len() {
            let le = &loops[loop_i];
            let collection = self.eval_expr(&le.collection)?;
            let entries = collection_entries(&collection);

            let index_name = le.index.clone();
            let mut any = false;
            for (key, elem) in entries {
                self.check_cancelled()?;
                let mark = self.bindings.mark();
                self.bindings.insert(&index_name, key);
                let prev = self.loop_values.insert(le.expr.clone(), elem);
                let r = self.eval_stmt_with_loops(query, order, idx, stmt, loops, loop_i + 1)?;
                match prev {
                    Some(v) => {
                        self.loop_values.insert(le.expr.clone(), v);
                    }
                    None => {
                        self.loop_values.remove(&le.expr);
                    }
                }
                self.bindings.undo_to(mark);
                any |= r;
                if self.top_context_stopped() {
                    break;
                }
            }
            return Ok(any);
        }

        match &stmt.literal {
            Literal::Expr { expr, .. } => {
                let v = self.eval_expr(expr)?;
                if !v.is_truthy() {
                    return Ok(false);
                }
                self.record_expr_value(order[idx], v);
                self.eval_stmt_at(query, order, idx + 1)
            }
            // Bindings made inside a negated block never escape it.
            Literal::NotExpr { expr, .. } => {
                let mark = self.bindings.mark();
                let v = self.eval_expr(expr)?;
                self.bindings.undo_to(mark);
                if v.is_truthy() {
                    return Ok(false);
                }
                self.record_expr_value(order[idx], Value::Bool(true));
                self.eval_stmt_at(query, order, idx + 1)
            }
            Literal::SomeVars { vars, .. } => {
                for v in vars {
                    self.bindings.insert(v, Value::Undefined);
                }
                self.record_expr_value(order[idx], Value::Bool(true));
                self.eval_stmt_at(query, order, idx + 1)
            }
            Literal::SomeIn {
                key,
                value,
                collection,
                ..
            } => {
                let col = self.eval_expr(collection)?;
                let entries = collection_entries(&col);
                let mut any = false;
                for (k, v) in entries {
                    self.check_cancelled()?;
                    let mark = self.bindings.mark();
                    // `some` declares fresh variables; shadow any outer
                    // binding of the same name before unifying.
                    for pat in [key.as_ref(), Some(value)].into_iter().flatten() {
                        for var in pattern_vars(pat) {
                            self.bindings.insert(&var, Value::Undefined);
                        }
                    }
                    let mut ok = true;
                    if let Some(key_pat) = key {
                        ok = self.unify_pattern(key_pat, &k)?;
                    }
                    if ok {
                        ok = self.unify_pattern(value, &v)?;
                    }
                    if ok {
                        self.record_expr_value(order[idx], Value::Bool(true));
                        any |= self.eval_stmt_at(query, order, idx + 1)?;
                    }
                    self.bindings.undo_to(mark);
                    if self.top_context_stopped() {
                        break;
                    }
                }
                Ok(any)
            }
            Literal::Every {
                key,
                value,
                domain,
                query: body,
                ..
            } => {
                let dom = self.eval_expr(domain)?;
                if dom.is_undefined() {
                    return Ok(false);
                }
                let entries = collection_entries(&dom);
                for (k, v) in entries {
                    self.check_cancelled()?;
                    let mark = self.bindings.mark();
                    self.bindings.push_scope();
                    if let Some(k_name) = key {
                        self.bindings.insert(k_name, k);
                    }
                    self.bindings.insert(value, v);
                    let holds = self.eval_exists(body)?;
                    self.bindings.undo_to(mark);
                    // Universal quantification: one counterexample fails
                    // the statement.
                    if !holds {
                        return Ok(false);
                    }
                }
                self.record_expr_value(order[idx], Value::Bool(true));
                self.eval_stmt_at(query, order, idx + 1)
            }
        }
    }

    fn eval_exists(&mut self, query: &Ref<Query>) -> Result<bool, EvalError> {
        self.contexts
            .push(Context::new(ContextKind::Exists, Value::Undefined));
        let outcome = self.eval_query_in_context(query);
        let ctx = self.contexts.pop().ok_or_else(|| internal("context stack underflow"))?;
        outcome?;
        Ok(ctx.count > 0)
    }

    fn top_context_stopped(&self) -> bool {
        self.contexts.last().is_some_and(|c| c.early_stop)
    }

    fn record_expr_value(&mut self, stmt_idx: usize, value: Value) {
        if let Some(ctx) = self.contexts.last_mut() {
            if ctx.kind == ContextKind::UserQuery && stmt_idx < ctx.expr_values.len() {
                ctx.expr_values[stmt_idx] = value;
            }
        }
    }

    // Called when every statement of the current query has succeeded.
    fn eval_output(&mut self) -> Result<bool, EvalError> {
        let kind = match self.contexts.last() {
            Some(ctx) => ctx.kind,
            None => return Err(internal("no active context")),
        };

        match kind {
            ContextKind::Exists => {
                let ctx = self.contexts.last_mut().expect("context checked above");
                ctx.count += 1;
                ctx.early_stop = true;
                Ok(true)
            }
            ContextKind::UserQuery => {
                let bindings = self.scope_bindings();
                let ctx = self.contexts.last_mut().expect("context checked above");
                let result = QueryResult {
                    expressions: ctx.expr_values.clone(),
                    bindings,
                };
                if !ctx.results.result.contains(&result) {
                    ctx.results.result.push(result);
                }
                ctx.count += 1;
                Ok(true)
            }
            ContextKind::ArrayCompr => {
                let term = self.output_expr()?;
                let v = self.eval_expr(&term)?;
                if v.is_undefined() {
                    return Ok(false);
                }
                let ctx = self.contexts.last_mut().expect("context checked above");
                ctx.value
                    .as_array_mut()
                    .map_err(|e| internal(&e.to_string()))?
                    .push(v);
                ctx.count += 1;
                Ok(true)
            }
            ContextKind::SetCompr => {
                let term = self.output_expr()?;
                let v = self.eval_expr(&term)?;
                if v.is_undefined() {
                    return Ok(false);
                }
                let ctx = self.contexts.last_mut().expect("context checked above");
                ctx.value
                    .as_set_mut()
                    .map_err(|e| internal(&e.to_string()))?
                    .insert(v);
                ctx.count += 1;
                Ok(true)
            }
            ContextKind::ObjectCompr => {
                let (key_expr, value_expr) = (self.key_expr()?, self.output_expr()?);
                let k = self.eval_expr(&key_expr)?;
                let v = self.eval_expr(&value_expr)?;
                if k.is_undefined() || v.is_undefined() {
                    return Ok(false);
                }
                self.insert_no_conflict(k, v, "object comprehension")?;
                Ok(true)
            }
            ContextKind::RuleValue(rule_kind) => match rule_kind {
                RuleKind::CompleteValue | RuleKind::Function => {
                    let value_expr = self.output_expr()?;
                    let v = self.eval_expr(&value_expr)?;
                    if v.is_undefined() {
                        return Ok(false);
                    }
                    let ctx = self.contexts.last_mut().expect("context checked above");
                    if ctx.value.is_undefined() {
                        ctx.value = v;
                    } else if ctx.value != v {
                        return Err(EvalError::Conflict {
                            msg: format!(
                                "complete rules must not produce multiple outputs: `{}` and `{}`",
                                ctx.value, v
                            ),
                        });
                    }
                    ctx.count += 1;
                    Ok(true)
                }
                RuleKind::PartialSet => {
                    let key_expr = self.key_expr()?;
                    let k = self.eval_expr(&key_expr)?;
                    if k.is_undefined() {
                        return Ok(false);
                    }
                    let ctx = self.contexts.last_mut().expect("context checked above");
                    ctx.value
                        .as_set_mut()
                        .map_err(|e| internal(&e.to_string()))?
                        .insert(k);
                    ctx.count += 1;
                    Ok(true)
                }
                RuleKind::PartialObject => {
                    let (key_expr, value_expr) = (self.key_expr()?, self.output_expr()?);
                    let k = self.eval_expr(&key_expr)?;
                    let v = self.eval_expr(&value_expr)?;
                    if k.is_undefined() || v.is_undefined() {
                        return Ok(false);
                    }
                    self.insert_no_conflict(k, v, "object rule")?;
                    Ok(true)
                }
            },
        }
    }

    fn output_expr(&self) -> Result<ExprRef, EvalError> {
        self.contexts
            .last()
            .and_then(|c| c.output_expr.clone())
            .ok_or_else(|| internal("context has no output expression"))
    }

    fn key_expr(&self) -> Result<ExprRef, EvalError> {
        self.contexts
            .last()
            .and_then(|c| c.key_expr.clone())
            .ok_or_else(|| internal("context has no key expression"))
    }

    fn insert_no_conflict(&mut self, k: Value, v: Value, what: &str) -> Result<(), EvalError> {
        let ctx = self
            .contexts
            .last_mut()
            .ok_or_else(|| internal("no active context"))?;
        let map = ctx
            .value
            .as_object_mut()
            .map_err(|e| internal(&e.to_string()))?;
        match map.get(&k) {
            Some(existing) if *existing != v => Err(EvalError::Conflict {
                msg: format!("{what} produces conflicting values for key `{k}`"),
            }),
            _ => {
                map.insert(k, v);
                ctx.count += 1;
                Ok(())
            }
        }
    }

    /// Named bindings of the current scope, as an object.
    fn scope_bindings(&self) -> Value {
        let mut out = BTreeMap::new();
        for (name, value) in self.bindings.current_scope() {
            if !value.is_undefined() {
                out.insert(Value::String(name.clone()), value.clone());
            }
        }
        Value::from(out)
    }

    // ------------------------------------------------------------------
    // Loop hoisting

    fn is_loop_index_var(&self, name: &Rc<str>) -> bool {
        if name.as_ref() == "_" {
            return true;
        }
        match self.bindings.get(name) {
            // Vars declared using `some v` can be loop vars.
            Some(Value::Undefined) => true,
            Some(_) => false,
            None => {
                // Unbound and not a rule: the reference iterates.
                match self.current_module_path() {
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
        }
    }

    fn hoist_loops_impl(&self, expr: &ExprRef, loops: &mut Vec<LoopExpr>) {
        use Expr::*;
        match expr.as_ref() {
            RefBrack { refr, index, .. } => {
                // First hoist any loops in refr.
                self.hoist_loops_impl(refr, loops);

                match index.as_ref() {
                    Var { name, .. } if self.is_loop_index_var(name) => loops.push(LoopExpr {
                        expr: expr.clone(),
                        collection: refr.clone(),
                        index: name.clone(),
                    }),
                    _ => self.hoist_loops_impl(index, loops),
                }
            }

            // Primitives
            String { .. } | Number { .. } | Bool { .. } | Null { .. } | Var { .. } => (),

            Array { items, .. } | Set { items, .. } => {
                for item in items {
                    self.hoist_loops_impl(item, loops);
                }
            }

            Object { fields, .. } => {
                for (key, value) in fields {
                    self.hoist_loops_impl(key, loops);
                    self.hoist_loops_impl(value, loops);
                }
            }

            Call { params, .. } => {
                for p in params {
                    self.hoist_loops_impl(p, loops);
                }
            }

            RefDot { refr, .. } => self.hoist_loops_impl(refr, loops),

            ArithExpr { lhs, rhs, .. } | BoolExpr { lhs, rhs, .. } | AssignExpr { lhs, rhs, .. } => {
                self.hoist_loops_impl(lhs, loops);
                self.hoist_loops_impl(rhs, loops);
            }

            Membership {
                key,
                value,
                collection,
                ..
            } => {
                if let Some(key) = key.as_ref() {
                    self.hoist_loops_impl(key, loops);
                }
                self.hoist_loops_impl(value, loops);
                self.hoist_loops_impl(collection, loops);
            }

            // Comprehension bodies are separate queries; their loops are
            // hoisted when the body is evaluated.
            ArrayCompr { .. } | SetCompr { .. } | ObjectCompr { .. } => (),
        }
    }

    fn hoist_loops(&self, literal: &Literal) -> Vec<LoopExpr> {
        let mut loops = vec![];
        use Literal::*;
        match literal {
            SomeVars { .. } => (),
            // Negated blocks are evaluated in isolation; their iteration
            // happens inside the negation.
            NotExpr { .. } => (),
            SomeIn {
                key,
                value,
                collection,
                ..
            } => {
                if let Some(key) = key {
                    self.hoist_loops_impl(key, &mut loops);
                }
                self.hoist_loops_impl(value, &mut loops);
                self.hoist_loops_impl(collection, &mut loops);
            }
            Every { domain, .. } => self.hoist_loops_impl(domain, &mut loops),
            Expr { expr, .. } => self.hoist_loops_impl(expr, &mut loops),
        }
        loops
    }

    // ------------------------------------------------------------------
    // Expression evaluation

    fn eval_expr(&mut self, expr: &ExprRef) -> Result<Value, EvalError> {
        if let Some(v) = self.loop_values.get(expr) {
            return Ok(v.clone());
        }

        match expr.as_ref() {
            Expr::Null { .. } => Ok(Value::Null),
            Expr::Bool { value, .. } => Ok(Value::Bool(*value)),
            Expr::Number { value, .. } => Ok(Value::Number(value.clone())),
            Expr::String { value, .. } => Ok(Value::String(value.clone())),
            Expr::Var { name, .. } => self.eval_var(name),
            Expr::RefDot { .. } | Expr::RefBrack { .. } => self.eval_chained_ref(expr),
            Expr::Array { items, .. } => {
                let mut out = vec![];
                for item in items {
                    let v = self.eval_expr(item)?;
                    if v.is_undefined() {
                        return Ok(Value::Undefined);
                    }
                    out.push(v);
                }
                Ok(Value::from(out))
            }
            Expr::Set { items, .. } => {
                let mut out = BTreeSet::new();
                for item in items {
                    let v = self.eval_expr(item)?;
                    if v.is_undefined() {
                        return Ok(Value::Undefined);
                    }
                    out.insert(v);
                }
                Ok(Value::from(out))
            }
            Expr::Object { fields, .. } => {
                let mut out = BTreeMap::new();
                for (k, v) in fields {
                    let kv = self.eval_expr(k)?;
                    let vv = self.eval_expr(v)?;
                    if kv.is_undefined() || vv.is_undefined() {
                        return Ok(Value::Undefined);
                    }
                    out.insert(kv, vv);
                }
                Ok(Value::from(out))
            }
            Expr::ArrayCompr { term, query, .. } => {
                self.eval_comprehension(ContextKind::ArrayCompr, None, term, query)
            }
            Expr::SetCompr { term, query, .. } => {
                self.eval_comprehension(ContextKind::SetCompr, None, term, query)
            }
            Expr::ObjectCompr {
                key, value, query, ..
            } => self.eval_comprehension(ContextKind::ObjectCompr, Some(key), value, query),
            Expr::Call { fcn, params, .. } => self.eval_call(fcn, params),
            Expr::ArithExpr { op, lhs, rhs, .. } => {
                let l = self.eval_expr(lhs)?;
                let r = self.eval_expr(rhs)?;
                if l.is_undefined() || r.is_undefined() {
                    return Ok(Value::Undefined);
                }
                self.eval_arith(*op, &l, &r)
            }
            Expr::BoolExpr { op, lhs, rhs, .. } => {
                let l = self.eval_expr(lhs)?;
                let r = self.eval_expr(rhs)?;
                if l.is_undefined() || r.is_undefined() {
                    return Ok(Value::Undefined);
                }
                Ok(Value::Bool(match op {
                    BoolOp::Eq => l == r,
                    BoolOp::Ne => l != r,
                    BoolOp::Lt => l < r,
                    BoolOp::Le => l <= r,
                    BoolOp::Gt => l > r,
                    BoolOp::Ge => l >= r,
                }))
            }
            Expr::AssignExpr { op, lhs, rhs, .. } => self.eval_assign(*op, lhs, rhs),
            Expr::Membership {
                key,
                value,
                collection,
                ..
            } => {
                let col = self.eval_expr(collection)?;
                let v = self.eval_expr(value)?;
                if col.is_undefined() || v.is_undefined() {
                    return Ok(Value::Undefined);
                }
                let found = match (key, &col) {
                    (Some(k), _) => {
                        let kv = self.eval_expr(k)?;
                        if kv.is_undefined() {
                            return Ok(Value::Undefined);
                        }
                        col[&kv] == v
                    }
                    (None, Value::Array(items)) => items.iter().any(|e| *e == v),
                    (None, Value::Set(items)) => items.contains(&v),
                    (None, Value::Object(map)) => map.values().any(|e| *e == v),
                    _ => false,
                };
                Ok(Value::Bool(found))
            }
        }
    }

    fn eval_arith(&self, op: ArithOp, l: &Value, r: &Value) -> Result<Value, EvalError> {
        let (a, b) = match (l, r) {
            (Value::Number(a), Value::Number(b)) => (a, b),
            _ => return Ok(Value::Undefined),
        };
        let result = match op {
            ArithOp::Add => a.add(b),
            ArithOp::Sub => a.sub(b),
            ArithOp::Mul => a.mul(b),
            ArithOp::Div => a.divide(b),
            ArithOp::Mod => a.modulo(b),
        };
        // Arithmetic is builtin dispatch in the language; its failures
        // follow builtin error semantics.
        match result {
            Ok(n) => Ok(Value::from(n)),
            Err(e) if self.options.strict_builtin_errors => Err(EvalError::Builtin {
                name: arith_name(op).to_string(),
                msg: e.to_string(),
            }),
            Err(_) => Ok(Value::Undefined),
        }
    }

    fn eval_var(&mut self, name: &Rc<str>) -> Result<Value, EvalError> {
        match name.as_ref() {
            "input" => return Ok(self.input.clone()),
            "data" => return self.resolve_data_path(&[]),
            _ => {}
        }

        if let Some(v) = self.bindings.get(name) {
            return Ok(v.clone());
        }

        // Import alias, then same-package rule.
        if let Some(module) = &self.current_module {
            if let Some(aliases) = self.policy.inner.imports.get(module) {
                if let Some(path) = aliases.get(name).cloned() {
                    return self.resolve_segments(&path);
                }
            }
        }
        if let Some(mp) = self.current_module_path() {
            let qualified = format!("{mp}.{name}");
            if self
                .policy
                .inner
                .rule_paths
                .iter()
                .any(|p| path_overlaps(&qualified, p))
            {
                let segments: Vec<Rc<str>> = qualified.split('.').map(Rc::from).collect();
                return self.resolve_data_path(&segments[1..]);
            }
        }

        Ok(Value::Undefined)
    }

    fn resolve_segments(&mut self, segments: &[Rc<str>]) -> Result<Value, EvalError> {
        match segments.first().map(|s| s.as_ref()) {
            Some("input") => {
                let mut v = self.input.clone();
                for s in &segments[1..] {
                    v = v[s.as_ref()].clone();
                }
                Ok(v)
            }
            Some("data") => self.resolve_data_path(&segments[1..]),
            _ => Ok(Value::Undefined),
        }
    }

    fn eval_chained_ref(&mut self, expr: &ExprRef) -> Result<Value, EvalError> {
        // Collect a chain of '.field' or '["field"]'
        let mut path: Vec<Rc<str>> = vec![];
        let mut cur = expr.clone();
        loop {
            if let Some(v) = self.loop_values.get(&cur) {
                path.reverse();
                return Ok(get_value_chained(v.clone(), &path));
            }
            let next = match cur.as_ref() {
                Expr::RefDot { refr, field, .. } => {
                    path.push(field.clone());
                    refr.clone()
                }
                Expr::RefBrack { refr, index, .. } => match index.as_ref() {
                    // refr["field"] is the same as refr.field
                    Expr::String { value, .. } => {
                        path.push(value.clone());
                        refr.clone()
                    }
                    _ => {
                        path.reverse();
                        let obj = self.eval_expr(refr)?;
                        let idx = self.eval_expr(index)?;
                        if obj.is_undefined() || idx.is_undefined() {
                            return Ok(Value::Undefined);
                        }
                        let v = obj[&idx].clone();
                        return Ok(get_value_chained(v, &path));
                    }
                },
                Expr::Var { name, .. } => {
                    path.reverse();
                    return self.lookup_var_path(name, &path);
                }
                _ => {
                    path.reverse();
                    let v = self.eval_expr(&cur)?;
                    return Ok(get_value_chained(v, &path));
                }
            };
            cur = next;
        }
    }

    fn lookup_var_path(&mut self, name: &Rc<str>, path: &[Rc<str>]) -> Result<Value, EvalError> {
        match name.as_ref() {
            "input" => {
                let mut v = self.input.clone();
                for p in path {
                    v = v[p.as_ref()].clone();
                }
                return Ok(v);
            }
            "data" => return self.resolve_data_path(path),
            _ => {}
        }

        if let Some(v) = self.bindings.get(name) {
            return Ok(get_value_chained(v.clone(), path));
        }

        if let Some(module) = &self.current_module {
            if let Some(aliases) = self.policy.inner.imports.get(module) {
                if let Some(base) = aliases.get(name).cloned() {
                    let mut full = base;
                    full.extend(path.iter().cloned());
                    return self.resolve_segments(&full);
                }
            }
        }
        if let Some(mp) = self.current_module_path() {
            let qualified = format!("{mp}.{name}");
            let mut segments: Vec<Rc<str>> = qualified.split('.').map(Rc::from).collect();
            segments.extend(path.iter().cloned());
            let dotted = join_path(&segments);
            if self
                .policy
                .inner
                .rule_paths
                .iter()
                .any(|p| path_overlaps(&dotted, p))
            {
                return self.resolve_data_path(&segments[1..]);
            }
        }

        Ok(Value::Undefined)
    }

    // ------------------------------------------------------------------
    // Virtual documents

    /// Resolve a path under `data`, evaluating any rule sets that
    /// contribute to it first. `path` excludes the `data` root.
    fn resolve_data_path(&mut self, path: &[Rc<str>]) -> Result<Value, EvalError> {
        let mut dotted = String::from("data");
        for p in path {
            dotted.push('.');
            dotted.push_str(p);
        }
        self.ensure_rules_evaluated(&dotted)?;

        let mut v = self.data.clone();
        for p in path {
            v = v[p.as_ref()].clone();
        }
        Ok(v)
    }

    /// Evaluate every rule set whose path overlaps `dotted`, merging the
    /// results into the data tree. Each rule set is evaluated at most
    /// once per query.
    fn ensure_rules_evaluated(&mut self, dotted: &str) -> Result<(), EvalError> {
        let candidates: Vec<String> = self
            .policy
            .inner
            .rule_paths
            .iter()
            .filter(|p| path_overlaps(dotted, p))
            .filter(|p| !self.evaluated_paths.contains(*p))
            .filter(|p| !self.active_paths.contains(*p))
            // Functions are evaluated per call, not as documents.
            .filter(|p| !self.policy.inner.functions.contains_key(*p))
            .cloned()
            .collect();
        for path in candidates {
            self.eval_rule_set(&path)?;
        }
        // A default may exist without any non-default clause.
        let default_only: Vec<String> = self
            .policy
            .inner
            .default_rules
            .keys()
            .filter(|p| path_overlaps(dotted, p))
            .filter(|p| !self.evaluated_paths.contains(*p))
            .filter(|p| !self.active_paths.contains(*p))
            .cloned()
            .collect();
        for path in default_only {
            self.eval_rule_set(&path)?;
        }
        Ok(())
    }

    /// Evaluate all clauses of one rule set and merge the result into the
    /// data document. This is the virtual document cache fill.
    fn eval_rule_set(&mut self, path: &str) -> Result<(), EvalError> {
        if self.active_paths.iter().any(|p| p == path) {
            return Err(internal(&format!(
                "recursion reached the evaluator for `{path}`"
            )));
        }
        self.active_paths.push(path.to_string());
        let outcome = self.eval_rule_set_inner(path);
        self.active_paths.pop();
        let value = outcome?;

        self.evaluated_paths.insert(path.to_string());
        if !value.is_undefined() {
            let segments: Vec<&str> = path.split('.').skip(1).collect();
            let slot = self
                .data
                .make_or_get_value_mut(&segments)
                .map_err(|e| internal(&e.to_string()))?;
            slot.merge(value)
                .map_err(|e| EvalError::Conflict { msg: e.to_string() })?;
        }
        Ok(())
    }

    fn eval_rule_set_inner(&mut self, path: &str) -> Result<Value, EvalError> {
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

        let initial = match kind {
            RuleKind::PartialSet => Value::new_set(),
            RuleKind::PartialObject => Value::new_object(),
            _ => Value::Undefined,
        };

        // Candidate selection through the index; a miss or a disabled
        // index falls back to scanning every clause in order.
        let selected: Vec<Ref<Rule>> = if self.options.enable_rule_index {
            match self
                .policy
                .inner
                .indices
                .get(path)
                .map(|ix| ix.lookup(Some(&self.input)))
            {
                Some(crate::index::Lookup::Selected(idxs)) => {
                    debug!("rule index selected {}/{} clauses of `{path}`", idxs.len(), rules.len());
                    idxs.into_iter().filter_map(|i| rules.get(i).cloned()).collect()
                }
                _ => rules.clone(),
            }
        } else {
            rules.clone()
        };

        self.contexts
            .push(Context::new(ContextKind::RuleValue(kind), initial));
        let outcome = self.eval_rule_clauses(&selected);
        let ctx = self.contexts.pop().ok_or_else(|| internal("context stack underflow"))?;
        outcome?;

        let mut value = ctx.value;
        // Complete rules with no derived value fall back to the default
        // clause when one exists.
        if value.is_undefined() {
            if let Some(default_rule) = self.policy.inner.default_rules.get(path).cloned() {
                if let Rule::Default { value: vexpr, .. } = default_rule.as_ref() {
                    value = self.eval_expr(vexpr)?;
                }
            }
        }
        Ok(value)
    }

    fn eval_rule_clauses(&mut self, rules: &[Ref<Rule>]) -> Result<(), EvalError> {
        for rule in rules {
            let info = match self.policy.rule_info(rule) {
                Some(i) => i.clone(),
                None => continue,
            };
            let bodies = match rule.as_ref() {
                Rule::Spec { bodies, .. } => bodies,
                Rule::Default { .. } => continue,
            };

            let prev_module = self.current_module.replace(info.module.clone());
            for body in bodies {
                if let Some(ctx) = self.contexts.last_mut() {
                    ctx.key_expr = info.key.clone();
                    ctx.output_expr = Some(
                        body.assign
                            .as_ref()
                            .map(|a| a.value.clone())
                            .unwrap_or_else(|| info.value.clone()),
                    );
                }
                let mark = self.bindings.mark();
                self.bindings.push_barrier_scope();
                let r = self.eval_query_in_context(&body.query);
                self.bindings.undo_to(mark);
                if let Err(e) = r {
                    self.current_module = prev_module;
                    return Err(e);
                }
            }
            self.current_module = prev_module;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Comprehensions

    fn eval_comprehension(
        &mut self,
        kind: ContextKind,
        key: Option<&ExprRef>,
        term: &ExprRef,
        query: &Ref<Query>,
    ) -> Result<Value, EvalError> {
        // The comprehension cache is keyed by the body plus the values of
        // its closed-over variables; hint sets come from the compiler.
        let cache_key = self.policy.inner.compr_hints.get(query).map(|hints| {
            let closed: Vec<Value> = hints
                .iter()
                .map(|h| {
                    self.bindings
                        .get(h)
                        .cloned()
                        .unwrap_or(Value::Undefined)
                })
                .collect();
            (query.clone(), closed)
        });
        if let Some(k) = &cache_key {
            if let Some(v) = self.compr_cache.get(k) {
                debug!("comprehension cache hit");
                return Ok(v.clone());
            }
        }

        let initial = match kind {
            ContextKind::ArrayCompr => Value::new_array(),
            ContextKind::SetCompr => Value::new_set(),
            ContextKind::ObjectCompr => Value::new_object(),
            _ => return Err(internal("not a comprehension context")),
        };
        let mut ctx = Context::new(kind, initial);
        ctx.key_expr = key.cloned();
        ctx.output_expr = Some(term.clone());
        self.contexts.push(ctx);

        let mark = self.bindings.mark();
        self.bindings.push_scope();
        let outcome = self.eval_query_in_context(query);
        self.bindings.undo_to(mark);

        let ctx = self.contexts.pop().ok_or_else(|| internal("context stack underflow"))?;
        outcome?;

        if let Some(k) = cache_key {
            self.compr_cache.insert(k, ctx.value.clone());
        }
        Ok(ctx.value)
    }

    // ------------------------------------------------------------------
    // Calls

    fn eval_call(&mut self, fcn: &ExprRef, params: &[ExprRef]) -> Result<Value, EvalError> {
        let comps = get_ref_components(fcn)
            .ok_or_else(|| internal("call target is not a simple reference"))?;
        let dotted = join_path(&comps);

        // User-defined functions shadow nothing: full path first, then
        // package-relative.
        let func_path = if self.policy.inner.functions.contains_key(&dotted) {
            Some(dotted.clone())
        } else {
            self.current_module_path()
                .map(|mp| format!("{mp}.{dotted}"))
                .filter(|q| self.policy.inner.functions.contains_key(q))
        };

        let mut args = Vec::with_capacity(params.len());
        for p in params {
            let v = self.eval_expr(p)?;
            if v.is_undefined() {
                return Ok(Value::Undefined);
            }
            args.push(v);
        }

        if let Some(path) = func_path {
            return self.eval_user_function(&path, args);
        }

        let decl = match self.registry.lookup(&dotted, params.len() as u8) {
            Some(d) => *d,
            None => {
                return Err(internal(&format!("unknown function `{dotted}`")));
            }
        };

        let cache_key = (dotted.clone(), args.clone());
        if let Some(v) = self.builtin_cache.get(&cache_key) {
            return Ok(v.clone());
        }

        match (decl.fcn)(&args) {
            Ok(v) => {
                self.builtin_cache.insert(cache_key, v.clone());
                Ok(v)
            }
            Err(_) if decl.undefined_on_error || !self.options.strict_builtin_errors => {
                Ok(Value::Undefined)
            }
            Err(e) => Err(EvalError::Builtin {
                name: dotted,
                msg: e.to_string(),
            }),
        }
    }

    // Concrete function evaluation for the partial evaluator's
    // fully-known branches.
    pub(crate) fn eval_function(&mut self, path: &str, args: Vec<Value>) -> Result<Value, EvalError> {
        self.eval_user_function(path, args)
    }

    // Direct built-in dispatch for the partial evaluator.
    pub(crate) fn eval_builtin(&mut self, name: &str, args: &[Value]) -> Result<Value, EvalError> {
        let decl = match self.registry.lookup(name, args.len() as u8) {
            Some(d) => *d,
            None => return Err(internal(&format!("unknown function `{name}`"))),
        };
        match (decl.fcn)(args) {
            Ok(v) => Ok(v),
            Err(_) if decl.undefined_on_error || !self.options.strict_builtin_errors => {
                Ok(Value::Undefined)
            }
            Err(e) => Err(EvalError::Builtin {
                name: name.to_string(),
                msg: e.to_string(),
            }),
        }
    }

    fn eval_user_function(&mut self, path: &str, args: Vec<Value>) -> Result<Value, EvalError> {
        let cache_key = (path.to_string(), args.clone());
        if let Some(v) = self.func_cache.get(&cache_key) {
            return Ok(v.clone());
        }

        if self.active_paths.iter().any(|p| p == path) {
            return Err(internal(&format!(
                "recursion reached the evaluator for `{path}`"
            )));
        }
        self.active_paths.push(path.to_string());

        let clauses = self
            .policy
            .inner
            .functions
            .get(path)
            .map(|(c, _)| c.clone())
            .unwrap_or_default();

        self.contexts.push(Context::new(
            ContextKind::RuleValue(RuleKind::Function),
            Value::Undefined,
        ));
        let outcome = self.eval_function_clauses(&clauses, &args);
        let ctx = self.contexts.pop();
        self.active_paths.pop();
        outcome?;

        let value = ctx.map(|c| c.value).unwrap_or(Value::Undefined);
        self.func_cache.insert(cache_key, value.clone());
        Ok(value)
    }

    fn eval_function_clauses(
        &mut self,
        clauses: &[Ref<Rule>],
        args: &[Value],
    ) -> Result<(), EvalError> {
        for rule in clauses {
            let info = match self.policy.rule_info(rule) {
                Some(i) => i.clone(),
                None => continue,
            };
            let (arg_patterns, bodies) = match rule.as_ref() {
                Rule::Spec {
                    head: RuleHead::Func { args: patterns, .. },
                    bodies,
                    ..
                } => (patterns.clone(), bodies),
                _ => continue,
            };

            let prev_module = self.current_module.replace(info.module.clone());
            for body in bodies {
                if let Some(ctx) = self.contexts.last_mut() {
                    ctx.output_expr = Some(
                        body.assign
                            .as_ref()
                            .map(|a| a.value.clone())
                            .unwrap_or_else(|| info.value.clone()),
                    );
                }
                let mark = self.bindings.mark();
                self.bindings.push_barrier_scope();
                let mut bound = true;
                for (pattern, value) in arg_patterns.iter().zip(args.iter()) {
                    if !self.unify_pattern(pattern, value)? {
                        bound = false;
                        break;
                    }
                }
                let r = if bound {
                    self.eval_query_in_context(&body.query)
                } else {
                    Ok(false)
                };
                self.bindings.undo_to(mark);
                if let Err(e) = r {
                    self.current_module = prev_module;
                    return Err(e);
                }
            }
            self.current_module = prev_module;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Unification

    fn eval_assign(
        &mut self,
        op: AssignOp,
        lhs: &ExprRef,
        rhs: &ExprRef,
    ) -> Result<Value, EvalError> {
        let ok = match op {
            AssignOp::ColEq => {
                let v = self.eval_expr(rhs)?;
                if v.is_undefined() {
                    return Ok(Value::Undefined);
                }
                self.unify_pattern(lhs, &v)?
            }
            AssignOp::Eq => self.unify_exprs(lhs, rhs)?,
        };
        Ok(if ok { Value::Bool(true) } else { Value::Undefined })
    }

    fn has_unbound_vars(&self, expr: &ExprRef) -> bool {
        pattern_vars(expr)
            .iter()
            .any(|v| matches!(self.bindings.get(v), None | Some(Value::Undefined)))
    }

    /// Structural unification of two expressions; binds free variables on
    /// either side. Mismatch is failure, never an error.
    fn unify_exprs(&mut self, lhs: &ExprRef, rhs: &ExprRef) -> Result<bool, EvalError> {
        let lhs_open = self.has_unbound_vars(lhs);
        let rhs_open = self.has_unbound_vars(rhs);
        match (lhs_open, rhs_open) {
            (false, false) => {
                let a = self.eval_expr(lhs)?;
                let b = self.eval_expr(rhs)?;
                Ok(!a.is_undefined() && !b.is_undefined() && a == b)
            }
            (true, false) => {
                let v = self.eval_expr(rhs)?;
                if v.is_undefined() {
                    return Ok(false);
                }
                self.unify_pattern(lhs, &v)
            }
            (false, true) => {
                let v = self.eval_expr(lhs)?;
                if v.is_undefined() {
                    return Ok(false);
                }
                self.unify_pattern(rhs, &v)
            }
            (true, true) => match (lhs.as_ref(), rhs.as_ref()) {
                // Both sides open: only element-wise array unification can
                // make progress.
                (Expr::Array { items: li, .. }, Expr::Array { items: ri, .. }) => {
                    if li.len() != ri.len() {
                        return Ok(false);
                    }
                    for (l, r) in li.iter().zip(ri.iter()) {
                        if !self.unify_exprs(l, r)? {
                            return Ok(false);
                        }
                    }
                    Ok(true)
                }
                _ => Err(internal("cannot unify two unbound expressions")),
            },
        }
    }

    /// Match `pattern` against a concrete value, binding its free
    /// variables.
    fn unify_pattern(&mut self, pattern: &ExprRef, value: &Value) -> Result<bool, EvalError> {
        if value.is_undefined() {
            return Ok(false);
        }
        match pattern.as_ref() {
            Expr::Var { name, .. } => {
                if name.as_ref() == "_" {
                    return Ok(true);
                }
                match self.bindings.get(name).cloned() {
                    None | Some(Value::Undefined) => {
                        self.bindings.set(name, value.clone());
                        Ok(true)
                    }
                    Some(existing) => Ok(existing == *value),
                }
            }
            Expr::Array { items, .. } => match value {
                Value::Array(elems) => {
                    if items.len() != elems.len() {
                        return Ok(false);
                    }
                    for (pat, v) in items.iter().zip(elems.iter()) {
                        if !self.unify_pattern(pat, v)? {
                            return Ok(false);
                        }
                    }
                    Ok(true)
                }
                _ => Ok(false),
            },
            Expr::Object { fields, .. } => match value {
                Value::Object(map) => {
                    for (k_expr, v_pat) in fields {
                        let k = self.eval_expr(k_expr)?;
                        if k.is_undefined() {
                            return Ok(false);
                        }
                        match map.get(&k) {
                            Some(v) => {
                                let v = v.clone();
                                if !self.unify_pattern(v_pat, &v)? {
                                    return Ok(false);
                                }
                            }
                            None => return Ok(false),
                        }
                    }
                    Ok(true)
                }
                _ => Ok(false),
            },
            _ => {
                let v = self.eval_expr(pattern)?;
                Ok(!v.is_undefined() && v == *value)
            }
        }
    }
}

/// Index a value by successive string fields, as the reference chain
/// prescribes; any miss yields `Undefined`.
fn get_value_chained(mut v: Value, path: &[Rc<str>]) -> Value {
    for p in path {
        v = v[p.as_ref()].clone();
    }
    v
}

/// (key, element) pairs for generator iteration, in the deterministic
/// order the value's container defines. Scalars yield nothing.
fn collection_entries(value: &Value) -> Vec<(Value, Value)> {
    match value {
        Value::Array(items) => items
            .iter()
            .enumerate()
            .map(|(i, v)| (Value::from(i), v.clone()))
            .collect(),
        Value::Set(items) => items.iter().map(|v| (v.clone(), v.clone())).collect(),
        Value::Object(map) => map.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        _ => vec![],
    }
}

fn arith_name(op: ArithOp) -> &'static str {
    match op {
        ArithOp::Add => "plus",
        ArithOp::Sub => "minus",
        ArithOp::Mul => "mul",
        ArithOp::Div => "div",
        ArithOp::Mod => "rem",
    }
}

fn internal(msg: &str) -> EvalError {
    EvalError::Internal(msg.to_string())
}
