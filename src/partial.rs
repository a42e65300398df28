// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use crate::ast::*;
use crate::compiled_policy::{CompiledPolicy, RuleKind};
use crate::errors::EvalError;
use crate::interpreter::Evaluator;
use crate::planner::arith_builtin;
use crate::storage::Storage;
use crate::utils::*;
use crate::value::Value;

use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;

use log::debug;

/// A term surviving partial evaluation: either a known constant, an
/// unresolved reference under a declared unknown, or an unresolved call
/// over such references.
#[derive(Debug, Clone, PartialEq)]
pub enum ResidualTerm {
    Value(Value),
    Ref(Vec<Rc<str>>),
    Call { name: String, args: Vec<ResidualTerm> },
}

impl ResidualTerm {
    pub fn dotted(path: &[Rc<str>]) -> String {
        join_path(path)
    }
}

/// One residual constraint over the unknowns.
#[derive(Debug, Clone, PartialEq)]
pub enum ResidualExpr {
    Compare {
        op: BoolOp,
        lhs: ResidualTerm,
        rhs: ResidualTerm,
    },
    In {
        value: ResidualTerm,
        collection: ResidualTerm,
    },
    /// The referenced document exists (is defined and not false).
    Defined { path: Vec<Rc<str>> },
    Not(Box<ResidualExpr>),
}

/// A conjunction of residual constraints; the partial evaluator's result
/// is a disjunction of these support queries.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ResidualQuery {
    pub exprs: Vec<ResidualExpr>,
}

#[derive(Debug, Clone)]
enum PartialValue {
    Known(Value),
    Symbolic(ResidualTerm),
}

use PartialValue::*;

// One speculative evaluation path: local bindings plus the constraints
// accumulated so far.
#[derive(Debug, Clone, Default)]
struct Branch {
    env: BTreeMap<Rc<str>, PartialValue>,
    conj: Vec<ResidualExpr>,
}

type ValBranches = Vec<(PartialValue, Vec<ResidualExpr>)>;

/// Specializes queries against partially-unknown input. References under
/// a declared unknown prefix stay symbolic; everything statically
/// determinable is evaluated concretely, forking down every reachable
/// branch. The result is a residual disjunction of conjunctions.
pub struct PartialEvaluator {
    policy: CompiledPolicy,
    evaluator: Evaluator,
    input: Value,
    unknowns: Vec<Vec<Rc<str>>>,
    // Rule paths whose evaluation transitively reads an unknown.
    tainted: BTreeSet<String>,
}

impl PartialEvaluator {
    /// `unknowns` are dotted path prefixes such as `input.tenant`.
    pub fn new(
        policy: &CompiledPolicy,
        snapshot: &dyn Storage,
        input: Value,
        unknowns: &[&str],
    ) -> PartialEvaluator {
        let unknowns: Vec<Vec<Rc<str>>> = unknowns
            .iter()
            .map(|u| u.split('.').map(Rc::from).collect())
            .collect();
        let tainted = Self::compute_taint(policy, &unknowns);
        debug!("{} rule set(s) depend on unknowns", tainted.len());
        PartialEvaluator {
            policy: policy.clone(),
            evaluator: Evaluator::new(policy, snapshot, input.clone()),
            input,
            unknowns,
            tainted,
        }
    }

    /// Rule paths that read an unknown prefix, directly or through
    /// another tainted rule. Computed as a fixpoint over body references.
    fn compute_taint(policy: &CompiledPolicy, unknowns: &[Vec<Rc<str>>]) -> BTreeSet<String> {
        let mut sets: Vec<(String, Vec<Ref<Rule>>)> = policy
            .rules()
            .iter()
            .map(|(p, rs)| (p.clone(), rs.clone()))
            .collect();
        sets.extend(
            policy
                .inner
                .functions
                .iter()
                .map(|(p, (rs, _))| (p.clone(), rs.clone())),
        );

        let mut direct: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut tainted: BTreeSet<String> = BTreeSet::new();

        for (path, rules) in &sets {
            let mut reads_unknown = false;
            let mut rule_refs: Vec<String> = vec![];
            for rule in rules {
                let info = match policy.rule_info(rule) {
                    Some(i) => i,
                    None => continue,
                };
                let module_path = module_dotted_path(&info.module);
                let aliases = policy.inner.imports.get(&info.module);
                if let Rule::Spec { bodies, .. } = rule.as_ref() {
                    for body in bodies {
                        collect_query_refs(&body.query, &mut |segments: &[Rc<str>]| {
                            // Normalize bare names and aliases to full
                            // paths before classifying.
                            let full: Vec<Rc<str>> =
                                match segments.first().map(|s| s.as_ref()) {
                                    Some("input") | Some("data") => segments.to_vec(),
                                    Some(root) => {
                                        if let Some(base) =
                                            aliases.and_then(|a| a.get(root)).cloned()
                                        {
                                            let mut full = base;
                                            full.extend(segments[1..].iter().cloned());
                                            full
                                        } else {
                                            let mut full: Vec<Rc<str>> = module_path
                                                .split('.')
                                                .map(Rc::from)
                                                .collect();
                                            full.extend(segments.iter().cloned());
                                            full
                                        }
                                    }
                                    None => return,
                                };
                            match full.first().map(|s| s.as_ref()) {
                                Some("input") => {
                                    if unknown_overlaps(unknowns, &full) {
                                        reads_unknown = true;
                                    }
                                }
                                Some("data") => {
                                    let dotted = join_path(&full);
                                    for p in policy.inner.rule_paths.iter() {
                                        if path_overlaps(&dotted, p) {
                                            rule_refs.push(p.clone());
                                        }
                                    }
                                }
                                _ => {}
                            }
                        });
                    }
                }
            }
            if reads_unknown {
                tainted.insert(path.clone());
            }
            direct.insert(path.clone(), rule_refs);
        }

        // Propagate until stable.
        loop {
            let before = tainted.len();
            let newly: Vec<String> = direct
                .iter()
                .filter(|(path, refs)| {
                    !tainted.contains(*path) && refs.iter().any(|r| tainted.contains(r))
                })
                .map(|(path, _)| path.clone())
                .collect();
            tainted.extend(newly);
            if tainted.len() == before {
                return tainted;
            }
        }
    }

    /// Partially evaluate a query. With an empty unknown set this
    /// degenerates to ordinary evaluation: a satisfiable query yields one
    /// empty (always-true) residual, an unsatisfiable one yields none.
    pub fn partial_eval(&mut self, query: &Ref<Query>) -> Result<Vec<ResidualQuery>, EvalError> {
        if self.unknowns.is_empty() {
            let results = self.evaluator.eval_query(query)?;
            return Ok(if results.result.is_empty() {
                vec![]
            } else {
                vec![ResidualQuery::default()]
            });
        }

        let branches = self.peval_query(query, None, Branch::default())?;
        let disjuncts: Vec<ResidualQuery> = branches
            .into_iter()
            .map(|b| ResidualQuery { exprs: b.conj })
            .collect();
        Ok(simplify_membership(disjuncts))
    }

    // ------------------------------------------------------------------
    // Query / statement evaluation

    fn peval_query(
        &mut self,
        query: &Ref<Query>,
        module: Option<&Ref<Module>>,
        branch: Branch,
    ) -> Result<Vec<Branch>, EvalError> {
        let order: Vec<usize> = match self.policy.inner.schedules.get(query) {
            Some(order) => order.clone(),
            None => (0..query.stmts.len()).collect(),
        };
        let mut branches = vec![branch];
        for i in &order {
            let stmt = &query.stmts[*i];
            let mut next = vec![];
            for b in branches {
                next.extend(self.peval_stmt(stmt, module, b)?);
            }
            branches = next;
            if branches.is_empty() {
                break;
            }
        }
        Ok(branches)
    }

    fn peval_stmt(
        &mut self,
        stmt: &LiteralStmt,
        module: Option<&Ref<Module>>,
        branch: Branch,
    ) -> Result<Vec<Branch>, EvalError> {
        match &stmt.literal {
            Literal::SomeVars { .. } => Ok(vec![branch]),
            Literal::Expr { expr, .. } => self.peval_stmt_expr(expr, module, branch, false),
            Literal::NotExpr { expr, .. } => self.peval_stmt_expr(expr, module, branch, true),
            Literal::SomeIn {
                key,
                value,
                collection,
                ..
            } => {
                let mut out = vec![];
                for (pv, extra) in self.peval_expr(collection, module, &branch)? {
                    let mut base = branch.clone();
                    base.conj.extend(extra);
                    match pv {
                        Known(col) => {
                            for (k, v) in known_entries(&col) {
                                let mut b = base.clone();
                                let mut ok = true;
                                if let Some(kp) = key {
                                    ok = bind_known_pattern(kp, &k, &mut b.env);
                                }
                                if ok && bind_known_pattern(value, &v, &mut b.env) {
                                    out.push(b);
                                }
                            }
                        }
                        Symbolic(_) => {
                            return Err(EvalError::Internal(
                                "cannot enumerate an unknown collection".to_string(),
                            ))
                        }
                    }
                }
                Ok(out)
            }
            Literal::Every { .. } => Err(EvalError::Internal(
                "universal quantification is not supported under partial evaluation".to_string(),
            )),
        }
    }

    /// Statement-position expression: produces continuation branches, or
    /// residual constraints when unknowns are involved. `negated` wraps
    /// the constraint in negation-as-failure.
    fn peval_stmt_expr(
        &mut self,
        expr: &ExprRef,
        module: Option<&Ref<Module>>,
        branch: Branch,
        negated: bool,
    ) -> Result<Vec<Branch>, EvalError> {
        // Comparisons, membership and unification are constraint-shaped;
        // everything else is a truthiness test.
        match expr.as_ref() {
            Expr::BoolExpr { op, lhs, rhs, .. } => {
                let mut out = vec![];
                for (l, cl) in self.peval_expr(lhs, module, &branch)? {
                    for (r, cr) in self.peval_expr(rhs, module, &branch)? {
                        let mut b = branch.clone();
                        b.conj.extend(cl.iter().cloned());
                        b.conj.extend(cr);
                        match (&l, &r) {
                            (Known(a), Known(c)) => {
                                if a.is_undefined() || c.is_undefined() {
                                    continue;
                                }
                                let holds = compare_values(*op, a, c);
                                if holds != negated {
                                    out.push(b);
                                }
                            }
                            _ => {
                                let constraint = ResidualExpr::Compare {
                                    op: *op,
                                    lhs: to_term(&l),
                                    rhs: to_term(&r),
                                };
                                b.conj.push(wrap_not(constraint, negated));
                                out.push(b);
                            }
                        }
                    }
                }
                Ok(out)
            }
            Expr::Membership {
                key: None,
                value,
                collection,
                ..
            } => {
                let mut out = vec![];
                for (v, cv) in self.peval_expr(value, module, &branch)? {
                    for (c, cc) in self.peval_expr(collection, module, &branch)? {
                        let mut b = branch.clone();
                        b.conj.extend(cv.iter().cloned());
                        b.conj.extend(cc);
                        match (&v, &c) {
                            (Known(val), Known(col)) => {
                                let holds = known_entries(col).iter().any(|(_, e)| e == val);
                                if holds != negated {
                                    out.push(b);
                                }
                            }
                            _ => {
                                let constraint = ResidualExpr::In {
                                    value: to_term(&v),
                                    collection: to_term(&c),
                                };
                                b.conj.push(wrap_not(constraint, negated));
                                out.push(b);
                            }
                        }
                    }
                }
                Ok(out)
            }
            Expr::AssignExpr { op, lhs, rhs, .. } => {
                if negated {
                    return Err(EvalError::Internal(
                        "negated unification is not supported under partial evaluation"
                            .to_string(),
                    ));
                }
                self.peval_assign(*op, lhs, rhs, module, branch)
            }
            _ => {
                let mut out = vec![];
                for (pv, extra) in self.peval_expr(expr, module, &branch)? {
                    let mut b = branch.clone();
                    b.conj.extend(extra);
                    match pv {
                        Known(v) => {
                            if v.is_truthy() != negated {
                                out.push(b);
                            }
                        }
                        Symbolic(ResidualTerm::Ref(path)) => {
                            b.conj
                                .push(wrap_not(ResidualExpr::Defined { path }, negated));
                            out.push(b);
                        }
                        Symbolic(term) => {
                            // A call result used as a condition: compare
                            // against true so the lowering can reject it
                            // with full context.
                            b.conj.push(wrap_not(
                                ResidualExpr::Compare {
                                    op: BoolOp::Eq,
                                    lhs: term,
                                    rhs: ResidualTerm::Value(Value::Bool(true)),
                                },
                                negated,
                            ));
                            out.push(b);
                        }
                    }
                }
                Ok(out)
            }
        }
    }

    /// Copy propagation happens here: a variable assigned a symbolic term
    /// becomes an alias of it, and no constraint is emitted.
    fn peval_assign(
        &mut self,
        op: AssignOp,
        lhs: &ExprRef,
        rhs: &ExprRef,
        module: Option<&Ref<Module>>,
        branch: Branch,
    ) -> Result<Vec<Branch>, EvalError> {
        let lhs_var = as_free_var(lhs, &branch);
        let rhs_var = match op {
            AssignOp::ColEq => None,
            AssignOp::Eq => as_free_var(rhs, &branch),
        };

        if let Some(name) = lhs_var {
            let mut out = vec![];
            for (pv, extra) in self.peval_expr(rhs, module, &branch)? {
                if matches!(&pv, Known(v) if v.is_undefined()) {
                    continue;
                }
                let mut b = branch.clone();
                b.conj.extend(extra);
                b.env.insert(name.clone(), pv);
                out.push(b);
            }
            return Ok(out);
        }
        if let Some(name) = rhs_var {
            let mut out = vec![];
            for (pv, extra) in self.peval_expr(lhs, module, &branch)? {
                if matches!(&pv, Known(v) if v.is_undefined()) {
                    continue;
                }
                let mut b = branch.clone();
                b.conj.extend(extra);
                b.env.insert(name.clone(), pv);
                out.push(b);
            }
            return Ok(out);
        }

        // Ground on both sides: equality.
        let mut out = vec![];
        for (l, cl) in self.peval_expr(lhs, module, &branch)? {
            for (r, cr) in self.peval_expr(rhs, module, &branch)? {
                let mut b = branch.clone();
                b.conj.extend(cl.iter().cloned());
                b.conj.extend(cr);
                match (&l, &r) {
                    (Known(a), Known(c)) => {
                        if !a.is_undefined() && !c.is_undefined() && a == c {
                            out.push(b);
                        }
                    }
                    _ => {
                        b.conj.push(ResidualExpr::Compare {
                            op: BoolOp::Eq,
                            lhs: to_term(&l),
                            rhs: to_term(&r),
                        });
                        out.push(b);
                    }
                }
            }
        }
        Ok(out)
    }

    // ------------------------------------------------------------------
    // Expression evaluation

    fn peval_expr(
        &mut self,
        expr: &ExprRef,
        module: Option<&Ref<Module>>,
        branch: &Branch,
    ) -> Result<ValBranches, EvalError> {
        match expr.as_ref() {
            Expr::Null { .. } => Ok(vec![(Known(Value::Null), vec![])]),
            Expr::Bool { value, .. } => Ok(vec![(Known(Value::Bool(*value)), vec![])]),
            Expr::Number { value, .. } => {
                Ok(vec![(Known(Value::Number(value.clone())), vec![])])
            }
            Expr::String { value, .. } => {
                Ok(vec![(Known(Value::String(value.clone())), vec![])])
            }
            Expr::Var { .. } | Expr::RefDot { .. } | Expr::RefBrack { .. } => {
                self.peval_ref(expr, module, branch)
            }
            Expr::Array { items, .. } => {
                self.peval_collection(items, module, branch, |vals| Value::from(vals))
            }
            Expr::Set { items, .. } => self.peval_collection(items, module, branch, |vals| {
                Value::from(vals.into_iter().collect::<BTreeSet<Value>>())
            }),
            Expr::Object { fields, .. } => {
                let mut branches: ValBranches = vec![(Known(Value::new_object()), vec![])];
                for (k_expr, v_expr) in fields {
                    let mut next: ValBranches = vec![];
                    for (acc, conj) in &branches {
                        for (k, ck) in self.peval_expr(k_expr, module, branch)? {
                            for (v, cv) in self.peval_expr(v_expr, module, branch)? {
                                match (&acc, &k, &v) {
                                    (Known(obj), Known(kv), Known(vv)) => {
                                        if kv.is_undefined() || vv.is_undefined() {
                                            continue;
                                        }
                                        let mut obj = obj.clone();
                                        if let Ok(map) = obj.as_object_mut() {
                                            map.insert(kv.clone(), vv.clone());
                                        }
                                        let mut c = conj.clone();
                                        c.extend(ck.iter().cloned());
                                        c.extend(cv);
                                        next.push((Known(obj), c));
                                    }
                                    _ => {
                                        return Err(EvalError::Internal(
                                            "object literals over unknowns are not supported"
                                                .to_string(),
                                        ))
                                    }
                                }
                            }
                        }
                    }
                    branches = next;
                }
                Ok(branches)
            }
            Expr::ArithExpr { op, lhs, rhs, .. } => {
                let mut out: ValBranches = vec![];
                for (l, cl) in self.peval_expr(lhs, module, branch)? {
                    for (r, cr) in self.peval_expr(rhs, module, branch)? {
                        let mut conj = cl.clone();
                        conj.extend(cr);
                        match (&l, &r) {
                            (Known(a), Known(b)) => {
                                let v = self.evaluator_arith(*op, a, b)?;
                                out.push((Known(v), conj));
                            }
                            _ => out.push((
                                Symbolic(ResidualTerm::Call {
                                    name: arith_builtin(*op).to_string(),
                                    args: vec![to_term(&l), to_term(&r)],
                                }),
                                conj,
                            )),
                        }
                    }
                }
                Ok(out)
            }
            Expr::BoolExpr { op, lhs, rhs, .. } => {
                let mut out: ValBranches = vec![];
                for (l, cl) in self.peval_expr(lhs, module, branch)? {
                    for (r, cr) in self.peval_expr(rhs, module, branch)? {
                        let mut conj = cl.clone();
                        conj.extend(cr);
                        match (&l, &r) {
                            (Known(a), Known(b)) => {
                                if a.is_undefined() || b.is_undefined() {
                                    out.push((Known(Value::Undefined), conj));
                                } else {
                                    out.push((Known(Value::Bool(compare_values(*op, a, b))), conj));
                                }
                            }
                            _ => {
                                return Err(EvalError::Internal(
                                    "comparison over unknowns in expression position"
                                        .to_string(),
                                ))
                            }
                        }
                    }
                }
                Ok(out)
            }
            Expr::Call { fcn, params, .. } => self.peval_call(fcn, params, module, branch),
            _ => Err(EvalError::Internal(
                "expression form not supported under partial evaluation".to_string(),
            )),
        }
    }

    fn peval_collection(
        &mut self,
        items: &[ExprRef],
        module: Option<&Ref<Module>>,
        branch: &Branch,
        build: impl Fn(Vec<Value>) -> Value,
    ) -> Result<ValBranches, EvalError> {
        let mut branches: Vec<(Vec<Value>, Vec<ResidualExpr>)> = vec![(vec![], vec![])];
        for item in items {
            let mut next = vec![];
            for (acc, conj) in &branches {
                for (pv, extra) in self.peval_expr(item, module, branch)? {
                    match pv {
                        Known(v) => {
                            if v.is_undefined() {
                                continue;
                            }
                            let mut acc = acc.clone();
                            acc.push(v);
                            let mut conj = conj.clone();
                            conj.extend(extra.iter().cloned());
                            next.push((acc, conj));
                        }
                        Symbolic(_) => {
                            return Err(EvalError::Internal(
                                "collection literals over unknowns are not supported".to_string(),
                            ))
                        }
                    }
                }
            }
            branches = next;
        }
        Ok(branches
            .into_iter()
            .map(|(vals, conj)| (Known(build(vals)), conj))
            .collect())
    }

    fn evaluator_arith(
        &self,
        op: ArithOp,
        a: &Value,
        b: &Value,
    ) -> Result<Value, EvalError> {
        let (x, y) = match (a, b) {
            (Value::Number(x), Value::Number(y)) => (x, y),
            _ => return Ok(Value::Undefined),
        };
        let r = match op {
            ArithOp::Add => x.add(y),
            ArithOp::Sub => x.sub(y),
            ArithOp::Mul => x.mul(y),
            ArithOp::Div => x.divide(y),
            ArithOp::Mod => x.modulo(y),
        };
        r.map(Value::from).map_err(|e| EvalError::Builtin {
            name: arith_builtin(op).to_string(),
            msg: e.to_string(),
        })
    }

    fn peval_call(
        &mut self,
        fcn: &ExprRef,
        params: &[ExprRef],
        module: Option<&Ref<Module>>,
        branch: &Branch,
    ) -> Result<ValBranches, EvalError> {
        let comps = get_ref_components(fcn)
            .ok_or_else(|| EvalError::Internal("call target is not a simple reference".into()))?;
        let dotted = join_path(&comps);

        // Argument branches, cartesian across parameters.
        let mut arg_branches: Vec<(Vec<PartialValue>, Vec<ResidualExpr>)> = vec![(vec![], vec![])];
        for p in params {
            let mut next = vec![];
            for (acc, conj) in &arg_branches {
                for (pv, extra) in self.peval_expr(p, module, branch)? {
                    let mut acc = acc.clone();
                    acc.push(pv);
                    let mut conj = conj.clone();
                    conj.extend(extra.iter().cloned());
                    next.push((acc, conj));
                }
            }
            arg_branches = next;
        }

        let func_path = self.resolve_function_path(&dotted, module);
        let mut out: ValBranches = vec![];
        for (args, conj) in arg_branches {
            let all_known: Option<Vec<Value>> = args
                .iter()
                .map(|a| match a {
                    Known(v) => Some(v.clone()),
                    Symbolic(_) => None,
                })
                .collect();
            match (&func_path, all_known) {
                (Some(path), Some(known_args)) => {
                    if self.tainted.contains(path) {
                        return Err(EvalError::Internal(format!(
                            "function `{path}` depends on unknowns"
                        )));
                    }
                    let v = self.evaluator.eval_function(path, known_args)?;
                    out.push((Known(v), conj));
                }
                (Some(path), None) => {
                    return Err(EvalError::Internal(format!(
                        "function `{path}` called with unknown arguments"
                    )));
                }
                (None, Some(known_args)) => {
                    // Built-in with fully known arguments: evaluate now.
                    let v = self.evaluator.eval_builtin(&dotted, &known_args)?;
                    out.push((Known(v), conj));
                }
                (None, None) => {
                    // Built-in over unknowns stays symbolic; the
                    // predicate-tree lowering rejects it.
                    out.push((
                        Symbolic(ResidualTerm::Call {
                            name: dotted.clone(),
                            args: args.iter().map(to_term_ref).collect(),
                        }),
                        conj,
                    ));
                }
            }
        }
        Ok(out)
    }

    fn resolve_function_path(&self, dotted: &str, module: Option<&Ref<Module>>) -> Option<String> {
        if self.policy.inner.functions.contains_key(dotted) {
            return Some(dotted.to_string());
        }
        let module_path = module.map(module_dotted_path)?;
        let qualified = format!("{module_path}.{dotted}");
        self.policy
            .inner
            .functions
            .contains_key(&qualified)
            .then_some(qualified)
    }

    // ------------------------------------------------------------------
    // Reference resolution

    fn peval_ref(
        &mut self,
        expr: &ExprRef,
        module: Option<&Ref<Module>>,
        branch: &Branch,
    ) -> Result<ValBranches, EvalError> {
        // Collect string segments, evaluating computed indices.
        let mut rev: Vec<Rc<str>> = vec![];
        let mut cur = expr.clone();
        loop {
            let next = match cur.as_ref() {
                Expr::RefDot { refr, field, .. } => {
                    rev.push(field.clone());
                    refr.clone()
                }
                Expr::RefBrack { refr, index, .. } => {
                    match index.as_ref() {
                        Expr::String { value, .. } => rev.push(value.clone()),
                        _ => {
                            let idx_branches = self.peval_expr(index, module, branch)?;
                            match idx_branches.as_slice() {
                                [(Known(Value::String(s)), extra)] if extra.is_empty() => {
                                    rev.push(s.clone())
                                }
                                [(Known(v), extra)] if extra.is_empty() && !v.is_undefined() => {
                                    rev.push(Rc::from(v.to_string().trim_matches('"')))
                                }
                                _ => {
                                    return Err(EvalError::Internal(
                                        "computed reference index over unknowns".to_string(),
                                    ))
                                }
                            }
                        }
                    }
                    refr.clone()
                }
                Expr::Var { name, .. } => {
                    rev.reverse();
                    return self.peval_rooted_ref(name, &rev, module, branch);
                }
                _ => return Err(EvalError::Internal("unsupported reference form".into())),
            };
            cur = next;
        }
    }

    fn peval_rooted_ref(
        &mut self,
        root: &Rc<str>,
        path: &[Rc<str>],
        module: Option<&Ref<Module>>,
        branch: &Branch,
    ) -> Result<ValBranches, EvalError> {
        if root.as_ref() == "input" {
            let mut full: Vec<Rc<str>> = vec![root.clone()];
            full.extend(path.iter().cloned());
            if unknown_overlaps(&self.unknowns, &full) {
                return Ok(vec![(Symbolic(ResidualTerm::Ref(full)), vec![])]);
            }
            let mut v = self.input.clone();
            for p in path {
                v = v[p.as_ref()].clone();
            }
            return Ok(vec![(Known(v), vec![])]);
        }

        if root.as_ref() == "data" {
            let mut dotted = String::from("data");
            for p in path {
                dotted.push('.');
                dotted.push_str(p);
            }
            return self.peval_data_path(&dotted);
        }

        // Local binding: aliases propagate (copy propagation through
        // references), known values chain-index.
        if let Some(pv) = branch.env.get(root) {
            return match pv {
                Known(v) => {
                    let mut v = v.clone();
                    for p in path {
                        v = v[p.as_ref()].clone();
                    }
                    Ok(vec![(Known(v), vec![])])
                }
                Symbolic(ResidualTerm::Ref(base)) => {
                    let mut full = base.clone();
                    full.extend(path.iter().cloned());
                    Ok(vec![(Symbolic(ResidualTerm::Ref(full)), vec![])])
                }
                Symbolic(term) => {
                    if path.is_empty() {
                        Ok(vec![(Symbolic(term.clone()), vec![])])
                    } else {
                        Err(EvalError::Internal(
                            "cannot index into an unresolved call result".to_string(),
                        ))
                    }
                }
            };
        }

        // Import alias, then package-relative rule.
        if let Some(m) = module {
            if let Some(aliases) = self.policy.inner.imports.get(m) {
                if let Some(base) = aliases.get(root).cloned() {
                    let mut full = base;
                    full.extend(path.iter().cloned());
                    if let Some((r, rest)) = full.split_first() {
                        let (r, rest) = (r.clone(), rest.to_vec());
                        return self.peval_rooted_ref(&r, &rest, module, branch);
                    }
                }
            }
            let module_path = module_dotted_path(m);
            let mut dotted = format!("{module_path}.{root}");
            for p in path {
                dotted.push('.');
                dotted.push_str(p);
            }
            if self
                .policy
                .inner
                .rule_paths
                .iter()
                .any(|p| path_overlaps(&dotted, p))
            {
                return self.peval_data_path(&dotted);
            }
        }

        Ok(vec![(Known(Value::Undefined), vec![])])
    }

    /// A data path: expand tainted rule sets symbolically, evaluate
    /// everything else concretely.
    fn peval_data_path(&mut self, dotted: &str) -> Result<ValBranches, EvalError> {
        let tainted_hit: Vec<String> = self
            .tainted
            .iter()
            .filter(|p| path_overlaps(dotted, p))
            .cloned()
            .collect();

        if tainted_hit.is_empty() {
            let v = self.evaluator.eval_rule(dotted)?;
            return Ok(vec![(Known(v), vec![])]);
        }

        match tainted_hit.as_slice() {
            [single] if single == dotted => self.expand_rule(dotted),
            _ => Err(EvalError::Internal(format!(
                "reference `{dotted}` partially covers unknown-dependent rules"
            ))),
        }
    }

    /// Inline every clause of a rule set whose value depends on unknowns.
    /// Each body becomes a support branch carrying its residual
    /// constraints and head value.
    fn expand_rule(&mut self, path: &str) -> Result<ValBranches, EvalError> {
        let rules = self
            .policy
            .inner
            .rules
            .get(path)
            .cloned()
            .unwrap_or_default();

        let mut out: ValBranches = vec![];
        for rule in &rules {
            let info = match self.policy.rule_info(rule) {
                Some(i) => i.clone(),
                None => continue,
            };
            if info.kind != RuleKind::CompleteValue {
                return Err(EvalError::Internal(format!(
                    "partial rule set `{path}` depends on unknowns"
                )));
            }
            let bodies = match rule.as_ref() {
                Rule::Spec { bodies, .. } => bodies,
                Rule::Default { .. } => continue,
            };
            for body in bodies {
                let value_expr = body
                    .assign
                    .as_ref()
                    .map(|a| a.value.clone())
                    .unwrap_or_else(|| info.value.clone());
                let body_branches =
                    self.peval_query(&body.query, Some(&info.module), Branch::default())?;
                for b in body_branches {
                    for (pv, extra) in
                        self.peval_expr(&value_expr, Some(&info.module), &b)?
                    {
                        let mut conj = b.conj.clone();
                        conj.extend(extra);
                        out.push((pv, conj));
                    }
                }
            }
        }
        Ok(out)
    }
}

// ----------------------------------------------------------------------
// Helpers

fn to_term(pv: &PartialValue) -> ResidualTerm {
    match pv {
        Known(v) => ResidualTerm::Value(v.clone()),
        Symbolic(t) => t.clone(),
    }
}

fn to_term_ref(pv: &PartialValue) -> ResidualTerm {
    to_term(pv)
}

fn wrap_not(constraint: ResidualExpr, negated: bool) -> ResidualExpr {
    if negated {
        ResidualExpr::Not(Box::new(constraint))
    } else {
        constraint
    }
}

fn compare_values(op: BoolOp, a: &Value, b: &Value) -> bool {
    match op {
        BoolOp::Eq => a == b,
        BoolOp::Ne => a != b,
        BoolOp::Lt => a < b,
        BoolOp::Le => a <= b,
        BoolOp::Gt => a > b,
        BoolOp::Ge => a >= b,
    }
}

fn known_entries(value: &Value) -> Vec<(Value, Value)> {
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

fn as_free_var(expr: &ExprRef, branch: &Branch) -> Option<Rc<str>> {
    match expr.as_ref() {
        Expr::Var { name, .. }
            if name.as_ref() != "_"
                && name.as_ref() != "input"
                && name.as_ref() != "data"
                && !branch.env.contains_key(name) =>
        {
            Some(name.clone())
        }
        _ => None,
    }
}

fn bind_known_pattern(
    pattern: &ExprRef,
    value: &Value,
    env: &mut BTreeMap<Rc<str>, PartialValue>,
) -> bool {
    match pattern.as_ref() {
        Expr::Var { name, .. } => {
            if name.as_ref() != "_" {
                env.insert(name.clone(), Known(value.clone()));
            }
            true
        }
        Expr::Null { .. } => matches!(value, Value::Null),
        Expr::Bool { value: b, .. } => matches!(value, Value::Bool(v) if v == b),
        Expr::Number { value: n, .. } => {
            matches!(value, Value::Number(v) if v == n)
        }
        Expr::String { value: s, .. } => {
            matches!(value, Value::String(v) if v == s)
        }
        Expr::Array { items, .. } => match value {
            Value::Array(elems) if elems.len() == items.len() => items
                .iter()
                .zip(elems.iter())
                .all(|(p, v)| bind_known_pattern(p, v, env)),
            _ => false,
        },
        _ => false,
    }
}

fn unknown_overlaps(unknowns: &[Vec<Rc<str>>], path: &[Rc<str>]) -> bool {
    unknowns.iter().any(|u| {
        let n = u.len().min(path.len());
        u[..n]
            .iter()
            .zip(path[..n].iter())
            .all(|(a, b)| a.as_ref() == b.as_ref())
    })
}

fn module_dotted_path(module: &Ref<Module>) -> String {
    let mut path = String::from("data");
    for p in &module.package.path {
        path.push('.');
        path.push_str(p);
    }
    path
}

/// References (dotted segment chains) appearing anywhere in a query.
fn collect_query_refs(query: &Ref<Query>, visit: &mut impl FnMut(&[Rc<str>])) {
    for stmt in &query.stmts {
        match &stmt.literal {
            Literal::SomeVars { .. } => {}
            Literal::SomeIn {
                key,
                value,
                collection,
                ..
            } => {
                if let Some(k) = key {
                    collect_expr_refs(k, visit);
                }
                collect_expr_refs(value, visit);
                collect_expr_refs(collection, visit);
            }
            Literal::Expr { expr, .. } | Literal::NotExpr { expr, .. } => {
                collect_expr_refs(expr, visit);
            }
            Literal::Every { domain, query, .. } => {
                collect_expr_refs(domain, visit);
                collect_query_refs(query, visit);
            }
        }
    }
}

fn collect_expr_refs(expr: &ExprRef, visit: &mut impl FnMut(&[Rc<str>])) {
    match expr.as_ref() {
        Expr::Var { name, .. } => visit(&[name.clone()]),
        Expr::RefDot { .. } | Expr::RefBrack { .. } => {
            if let Some(comps) = get_ref_components(expr) {
                visit(&comps);
            } else {
                // Walk into the pieces of a dynamic ref.
                let mut cur = expr.clone();
                loop {
                    let next = match cur.as_ref() {
                        Expr::RefDot { refr, .. } => refr.clone(),
                        Expr::RefBrack { refr, index, .. } => {
                            collect_expr_refs(index, visit);
                            refr.clone()
                        }
                        Expr::Var { name, .. } => {
                            visit(&[name.clone()]);
                            break;
                        }
                        _ => break,
                    };
                    cur = next;
                }
            }
        }
        Expr::Null { .. } | Expr::Bool { .. } | Expr::Number { .. } | Expr::String { .. } => {}
        Expr::Array { items, .. } | Expr::Set { items, .. } => {
            for i in items {
                collect_expr_refs(i, visit);
            }
        }
        Expr::Object { fields, .. } => {
            for (k, v) in fields {
                collect_expr_refs(k, visit);
                collect_expr_refs(v, visit);
            }
        }
        Expr::ArrayCompr { term, query, .. } | Expr::SetCompr { term, query, .. } => {
            collect_expr_refs(term, visit);
            collect_query_refs(query, visit);
        }
        Expr::ObjectCompr {
            key, value, query, ..
        } => {
            collect_expr_refs(key, visit);
            collect_expr_refs(value, visit);
            collect_query_refs(query, visit);
        }
        Expr::Call { params, .. } => {
            for p in params {
                collect_expr_refs(p, visit);
            }
        }
        Expr::ArithExpr { lhs, rhs, .. }
        | Expr::BoolExpr { lhs, rhs, .. }
        | Expr::AssignExpr { lhs, rhs, .. } => {
            collect_expr_refs(lhs, visit);
            collect_expr_refs(rhs, visit);
        }
        Expr::Membership {
            key,
            value,
            collection,
            ..
        } => {
            if let Some(k) = key {
                collect_expr_refs(k, visit);
            }
            collect_expr_refs(value, visit);
            collect_expr_refs(collection, visit);
        }
    }
}

/// Set/prefix simplification: disjuncts identical except for the constant
/// of one equality over the same reference collapse into a single
/// membership test against the materialized set of constants.
fn simplify_membership(disjuncts: Vec<ResidualQuery>) -> Vec<ResidualQuery> {
    let mut out: Vec<ResidualQuery> = vec![];
    'outer: for d in disjuncts {
        for existing in &mut out {
            if let Some(merged) = try_merge(existing, &d) {
                *existing = merged;
                continue 'outer;
            }
        }
        out.push(d);
    }
    out
}

fn try_merge(a: &ResidualQuery, b: &ResidualQuery) -> Option<ResidualQuery> {
    if a.exprs.len() != b.exprs.len() {
        return None;
    }
    let mut diff: Option<usize> = None;
    for (i, (x, y)) in a.exprs.iter().zip(b.exprs.iter()).enumerate() {
        if x != y {
            if diff.is_some() {
                return None;
            }
            diff = Some(i);
        }
    }
    let i = diff?;
    let (path_a, vals_a) = eq_or_in_over_ref(&a.exprs[i])?;
    let (path_b, vals_b) = eq_or_in_over_ref(&b.exprs[i])?;
    if path_a != path_b {
        return None;
    }

    let mut set: BTreeSet<Value> = vals_a.into_iter().collect();
    set.extend(vals_b);
    let mut merged = a.clone();
    merged.exprs[i] = ResidualExpr::In {
        value: ResidualTerm::Ref(path_a),
        collection: ResidualTerm::Value(Value::from(set)),
    };
    Some(merged)
}

/// `ref == const` or `ref in {consts}` decomposed for merging.
fn eq_or_in_over_ref(expr: &ResidualExpr) -> Option<(Vec<Rc<str>>, Vec<Value>)> {
    match expr {
        ResidualExpr::Compare {
            op: BoolOp::Eq,
            lhs: ResidualTerm::Ref(p),
            rhs: ResidualTerm::Value(v),
        }
        | ResidualExpr::Compare {
            op: BoolOp::Eq,
            lhs: ResidualTerm::Value(v),
            rhs: ResidualTerm::Ref(p),
        } => Some((p.clone(), vec![v.clone()])),
        ResidualExpr::In {
            value: ResidualTerm::Ref(p),
            collection: ResidualTerm::Value(Value::Set(items)),
        } => Some((p.clone(), items.iter().cloned().collect())),
        _ => None,
    }
}
