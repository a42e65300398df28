// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use crate::ast::*;
use crate::builtins::BuiltinRegistry;
use crate::compiled_policy::*;
use crate::errors::{CompileError, CompileErrors};
use crate::graph::DepGraph;
use crate::index::RuleIndex;
use crate::scheduler::{schedule, Definition, StmtInfo};
use crate::utils::*;

use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;

use log::debug;

/// Compile parsed modules into an immutable policy artifact.
///
/// Passes run in a fixed order: reference resolution, recursion check,
/// head rewriting, safety analysis, index construction. Each pass runs to
/// completion so diagnostics accumulate, but later passes are skipped once
/// any pass has reported errors. No artifact is produced on any error.
pub fn compile(modules: &[Ref<Module>]) -> Result<CompiledPolicy, CompileErrors> {
    Compiler::new(modules.to_vec()).compile()
}

struct Compiler {
    modules: Vec<Ref<Module>>,
    data: CompiledPolicyData,
    errors: Vec<CompileError>,
    // Head shape per rule-set path, for agreement checks.
    shapes: BTreeMap<String, RuleKind>,
    registry: BuiltinRegistry,
}

type Aliases = BTreeMap<Rc<str>, Vec<Rc<str>>>;

impl Compiler {
    fn new(modules: Vec<Ref<Module>>) -> Compiler {
        Compiler {
            modules,
            data: CompiledPolicyData::default(),
            errors: vec![],
            shapes: BTreeMap::new(),
            registry: BuiltinRegistry::with_defaults(),
        }
    }

    fn compile(mut self) -> Result<CompiledPolicy, CompileErrors> {
        self.data.modules = self.modules.clone();

        let passes: &[fn(&mut Compiler)] = &[
            Self::resolve_imports,
            Self::gather_rules,
            Self::check_recursion,
            Self::check_safety,
            Self::build_indices,
        ];
        for pass in passes {
            pass(&mut self);
            if !self.errors.is_empty() {
                return Err(CompileErrors(self.errors));
            }
        }

        debug!(
            "compiled {} rule sets across {} modules",
            self.data.rules.len(),
            self.modules.len()
        );
        Ok(CompiledPolicy::new(Rc::new(self.data)))
    }

    fn module_path(module: &Ref<Module>) -> String {
        let mut path = String::from("data");
        for p in &module.package.path {
            path.push('.');
            path.push_str(p);
        }
        path
    }

    // Pass 1: record import aliases; every alias must resolve to a path
    // rooted at a known document.
    fn resolve_imports(&mut self) {
        for module in &self.modules {
            let mut aliases: Aliases = BTreeMap::new();
            for import in &module.imports {
                let root_ok = matches!(
                    import.path.first().map(|r| r.as_ref()),
                    Some("data") | Some("input")
                );
                if !root_ok || import.path.len() < 2 {
                    self.errors.push(CompileError::Import {
                        span: import.span.clone(),
                        path: join_path(&import.path),
                    });
                    continue;
                }
                let alias = match &import.alias {
                    Some(a) => a.clone(),
                    None => import.path[import.path.len() - 1].clone(),
                };
                aliases.insert(alias, import.path.clone());
            }
            self.data.imports.insert(module.clone(), aliases);
        }
    }

    // Pass 2: group rule clauses by fully-qualified path and normalize
    // their heads. Grouping is the single disjunctive form for
    // incremental rules; a missing head value becomes `:= true`.
    fn gather_rules(&mut self) {
        for module in self.modules.clone() {
            let module_path = Self::module_path(&module);
            for rule in &module.policy {
                match rule.as_ref() {
                    Rule::Spec { head, .. } => {
                        self.gather_spec_rule(&module, &module_path, rule, head)
                    }
                    Rule::Default { span, refr, value } => {
                        let path = match self.head_path(&module_path, refr) {
                            Some((p, None)) => p,
                            _ => {
                                self.type_error(span, "invalid default rule head");
                                continue;
                            }
                        };
                        if !is_constant(value) {
                            self.type_error(span, "default rule value must be a constant");
                            continue;
                        }
                        if self
                            .data
                            .default_rules
                            .insert(path.clone(), rule.clone())
                            .is_some()
                        {
                            self.type_error(span, &format!("multiple default rules for `{path}`"));
                        }
                    }
                }
            }
        }
    }

    fn gather_spec_rule(
        &mut self,
        module: &Ref<Module>,
        module_path: &str,
        rule: &Ref<Rule>,
        head: &RuleHead,
    ) {
        let span = rule.span().clone();

        let (path, kind, key, value) = match head {
            RuleHead::Complete { refr, assign, .. } => {
                let value = match assign {
                    Some(a) => a.value.clone(),
                    None => Expr::boolean(true),
                };
                match self.head_path(module_path, refr) {
                    Some((p, None)) => (p, RuleKind::CompleteValue, None, value),
                    Some((p, Some(key))) => (p, RuleKind::PartialObject, Some(key), value),
                    None => {
                        self.type_error(&span, "invalid rule head reference");
                        return;
                    }
                }
            }
            RuleHead::Set { refr, key, .. } => {
                let key = match key {
                    Some(k) => k.clone(),
                    None => {
                        self.type_error(&span, "set rule requires a key expression");
                        return;
                    }
                };
                match self.head_path(module_path, refr) {
                    Some((p, None)) => (p, RuleKind::PartialSet, Some(key.clone()), key),
                    _ => {
                        self.type_error(&span, "invalid set rule head reference");
                        return;
                    }
                }
            }
            RuleHead::Func {
                refr, args, assign, ..
            } => {
                let value = match assign {
                    Some(a) => a.value.clone(),
                    None => Expr::boolean(true),
                };
                let path = match self.head_path(module_path, refr) {
                    Some((p, None)) => p,
                    _ => {
                        self.type_error(&span, "invalid function rule head reference");
                        return;
                    }
                };
                let arity = args.len() as u8;
                let mismatch = match self.data.functions.get(&path) {
                    Some((_, existing)) if *existing != arity => Some(*existing),
                    _ => None,
                };
                if let Some(existing) = mismatch {
                    self.type_error(
                        &span,
                        &format!("`{path}` was previously defined with {existing} arguments"),
                    );
                    return;
                }
                match self.data.functions.get_mut(&path) {
                    Some((clauses, _)) => {
                        clauses.push(rule.clone());
                    }
                    None => {
                        self.data
                            .functions
                            .insert(path.clone(), (vec![rule.clone()], arity));
                    }
                }
                self.data.rule_paths.insert(path.clone());
                self.data.rule_infos.insert(
                    rule.clone(),
                    RuleInfo {
                        path,
                        kind: RuleKind::Function,
                        key: None,
                        value,
                        module: module.clone(),
                    },
                );
                return;
            }
        };

        match self.shapes.get(&path) {
            Some(existing) if *existing != kind => {
                self.type_error(&span, &format!("rules for `{path}` disagree on head shape"));
                return;
            }
            _ => {
                self.shapes.insert(path.clone(), kind);
            }
        }

        self.data
            .rules
            .entry(path.clone())
            .or_default()
            .push(rule.clone());
        self.data.rule_paths.insert(path.clone());
        self.data.rule_infos.insert(
            rule.clone(),
            RuleInfo {
                path,
                kind,
                key,
                value,
                module: module.clone(),
            },
        );
    }

    /// Resolve a rule head reference to (full path, partial-object key).
    /// `p` -> path p; `p.q["a"]` -> path p.q.a; `p[k]` -> path p, key k.
    fn head_path(&self, module_path: &str, refr: &ExprRef) -> Option<(String, Option<ExprRef>)> {
        match refr.as_ref() {
            Expr::RefBrack {
                refr: base, index, ..
            } => {
                let comps = get_ref_components(base)?;
                let mut path = module_path.to_string();
                for c in &comps {
                    path.push('.');
                    path.push_str(c);
                }
                match index.as_ref() {
                    Expr::String { value, .. } => Some((format!("{path}.{value}"), None)),
                    _ => Some((path, Some(index.clone()))),
                }
            }
            _ => {
                let comps = get_ref_components(refr)?;
                let mut path = module_path.to_string();
                for c in &comps {
                    path.push('.');
                    path.push_str(c);
                }
                Some((path, None))
            }
        }
    }

    // Pass 3: dependency graph over rule paths; any nontrivial strongly
    // connected component is recursion. Dynamic references contribute
    // edges for every rule path under their static prefix, so an unknown
    // suffix can only over-report, never hide a cycle.
    fn check_recursion(&mut self) {
        let mut graph = DepGraph::new();
        let all_paths: Vec<String> = self.data.rule_paths.iter().cloned().collect();
        for p in &all_paths {
            graph.add_node(p);
        }

        let infos: Vec<(Ref<Rule>, RuleInfo)> = self
            .data
            .rule_infos
            .iter()
            .map(|(r, i)| (r.clone(), i.clone()))
            .collect();

        for (rule, info) in &infos {
            let from = match graph.node_id(&info.path) {
                Some(id) => id,
                None => continue,
            };
            let module_path = Self::module_path(&info.module);
            let aliases = self
                .data
                .imports
                .get(&info.module)
                .cloned()
                .unwrap_or_default();

            let mut refs: Vec<String> = vec![];
            {
                let mut visit = |dotted: &str| refs.push(dotted.to_string());
                if let Rule::Spec { bodies, .. } = rule.as_ref() {
                    for body in bodies {
                        if let Some(assign) = &body.assign {
                            self.walk_refs(&assign.value, &module_path, &aliases, &mut visit);
                        }
                        self.walk_query_refs(&body.query, &module_path, &aliases, &mut visit);
                    }
                    if let Some(key) = &info.key {
                        self.walk_refs(key, &module_path, &aliases, &mut visit);
                    }
                    self.walk_refs(&info.value, &module_path, &aliases, &mut visit);
                }
            }

            for dotted in &refs {
                for p in &all_paths {
                    if path_overlaps(dotted, p) {
                        if let Some(to) = graph.node_id(p) {
                            graph.add_edge(from, to);
                        }
                    }
                }
            }
        }

        for scc in graph.sccs() {
            if !graph.is_cyclic_scc(&scc) {
                continue;
            }
            for node in &scc {
                let chain = graph.cycle_chain(&scc, *node);
                self.errors.push(CompileError::Recursion {
                    rule: graph.name(*node).to_string(),
                    chain,
                });
            }
        }
    }

    /// Walk every expression of a query (including nested comprehension
    /// bodies) and report each rule-path reference as a dotted string.
    fn walk_query_refs(
        &self,
        query: &Ref<Query>,
        module_path: &str,
        aliases: &Aliases,
        visit: &mut dyn FnMut(&str),
    ) {
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
                        self.walk_refs(k, module_path, aliases, visit);
                    }
                    self.walk_refs(value, module_path, aliases, visit);
                    self.walk_refs(collection, module_path, aliases, visit);
                }
                Literal::Expr { expr, .. } | Literal::NotExpr { expr, .. } => {
                    self.walk_refs(expr, module_path, aliases, visit);
                }
                Literal::Every { domain, query, .. } => {
                    self.walk_refs(domain, module_path, aliases, visit);
                    self.walk_query_refs(query, module_path, aliases, visit);
                }
            }
        }
    }

    fn walk_refs(
        &self,
        expr: &ExprRef,
        module_path: &str,
        aliases: &Aliases,
        visit: &mut dyn FnMut(&str),
    ) {
        match expr.as_ref() {
            Expr::Var { name, .. } => {
                if let Some(dotted) = self.resolve_name(name, module_path, aliases) {
                    visit(&dotted);
                }
            }
            Expr::RefDot { .. } | Expr::RefBrack { .. } => {
                if let Some(dotted) = self.static_ref_prefix(expr, module_path, aliases) {
                    visit(&dotted);
                }
                // Computed index expressions can reference rules too.
                let mut e = expr.clone();
                loop {
                    let next = match e.as_ref() {
                        Expr::RefDot { refr, .. } => refr.clone(),
                        Expr::RefBrack { refr, index, .. } => {
                            if !matches!(index.as_ref(), Expr::String { .. }) {
                                self.walk_refs(index, module_path, aliases, visit);
                            }
                            refr.clone()
                        }
                        _ => break,
                    };
                    e = next;
                }
            }
            Expr::Array { items, .. } | Expr::Set { items, .. } => {
                for item in items {
                    self.walk_refs(item, module_path, aliases, visit);
                }
            }
            Expr::Object { fields, .. } => {
                for (k, v) in fields {
                    self.walk_refs(k, module_path, aliases, visit);
                    self.walk_refs(v, module_path, aliases, visit);
                }
            }
            Expr::ArrayCompr { term, query, .. } | Expr::SetCompr { term, query, .. } => {
                self.walk_refs(term, module_path, aliases, visit);
                self.walk_query_refs(query, module_path, aliases, visit);
            }
            Expr::ObjectCompr {
                key, value, query, ..
            } => {
                self.walk_refs(key, module_path, aliases, visit);
                self.walk_refs(value, module_path, aliases, visit);
                self.walk_query_refs(query, module_path, aliases, visit);
            }
            Expr::Call { fcn, params, .. } => {
                if let Some(dotted) = self.resolve_function_name(fcn, module_path) {
                    visit(&dotted);
                }
                for p in params {
                    self.walk_refs(p, module_path, aliases, visit);
                }
            }
            Expr::ArithExpr { lhs, rhs, .. }
            | Expr::BoolExpr { lhs, rhs, .. }
            | Expr::AssignExpr { lhs, rhs, .. } => {
                self.walk_refs(lhs, module_path, aliases, visit);
                self.walk_refs(rhs, module_path, aliases, visit);
            }
            Expr::Membership {
                key,
                value,
                collection,
                ..
            } => {
                if let Some(k) = key {
                    self.walk_refs(k, module_path, aliases, visit);
                }
                self.walk_refs(value, module_path, aliases, visit);
                self.walk_refs(collection, module_path, aliases, visit);
            }
            _ => {}
        }
    }

    /// Resolve a bare name: import alias first, then same-package rule.
    fn resolve_name(
        &self,
        name: &Rc<str>,
        module_path: &str,
        aliases: &Aliases,
    ) -> Option<String> {
        if let Some(path) = aliases.get(name) {
            return Some(join_path(path));
        }
        let qualified = format!("{module_path}.{name}");
        if self.data.rule_paths.contains(&qualified) {
            return Some(qualified);
        }
        None
    }

    /// Static dotted prefix of a ref chain. Stops at the first computed
    /// segment; dynamic suffixes are treated conservatively by prefix.
    fn static_ref_prefix(
        &self,
        expr: &ExprRef,
        module_path: &str,
        aliases: &Aliases,
    ) -> Option<String> {
        let mut rev: Vec<Rc<str>> = vec![];
        let mut e = expr.clone();
        loop {
            let next = match e.as_ref() {
                Expr::RefDot { refr, field, .. } => {
                    rev.push(field.clone());
                    refr.clone()
                }
                Expr::RefBrack { refr, index, .. } => {
                    match index.as_ref() {
                        Expr::String { value, .. } => rev.push(value.clone()),
                        // Unknown suffix: drop everything collected so far.
                        _ => rev.clear(),
                    }
                    refr.clone()
                }
                Expr::Var { name, .. } => {
                    rev.reverse();
                    let root = name.clone();
                    return match root.as_ref() {
                        "input" => None,
                        "data" => {
                            let mut dotted = String::from("data");
                            for s in &rev {
                                dotted.push('.');
                                dotted.push_str(s);
                            }
                            Some(dotted)
                        }
                        _ => {
                            let mut dotted = self.resolve_name(&root, module_path, aliases)?;
                            for s in &rev {
                                dotted.push('.');
                                dotted.push_str(s);
                            }
                            Some(dotted)
                        }
                    };
                }
                _ => return None,
            };
            e = next;
        }
    }

    fn resolve_function_name(&self, fcn: &ExprRef, module_path: &str) -> Option<String> {
        let comps = get_ref_components(fcn)?;
        let dotted = join_path(&comps);
        if self.data.functions.contains_key(&dotted) {
            return Some(dotted);
        }
        let qualified = format!("{module_path}.{dotted}");
        if self.data.functions.contains_key(&qualified) {
            return Some(qualified);
        }
        None
    }

    // Pass 4: safety analysis. Every variable must be bound by a
    // generator before use; the statement order that achieves this is
    // recorded as the query's schedule. Closed-over variables of each
    // comprehension become its index hint.
    fn check_safety(&mut self) {
        let infos: Vec<(Ref<Rule>, RuleInfo)> = self
            .data
            .rule_infos
            .iter()
            .map(|(r, i)| (r.clone(), i.clone()))
            .collect();

        for (rule, info) in &infos {
            let module_path = Self::module_path(&info.module);
            let aliases = self
                .data
                .imports
                .get(&info.module)
                .cloned()
                .unwrap_or_default();
            let mut outer: BTreeSet<Rc<str>> = BTreeSet::new();

            // Function arguments are bound by the caller.
            if let Rule::Spec {
                head: RuleHead::Func { args, .. },
                ..
            } = rule.as_ref()
            {
                for arg in args {
                    for v in pattern_vars(arg) {
                        outer.insert(v);
                    }
                }
            }

            if let Rule::Spec { bodies, .. } = rule.as_ref() {
                for body in bodies {
                    let (_, locals) = self.analyze_query(
                        &body.query,
                        &outer,
                        &module_path,
                        &info.module,
                        &info.path,
                    );

                    // Head key/value expressions close over the body
                    // scope; anything else they name must resolve
                    // globally.
                    let mut in_scope = outer.clone();
                    in_scope.extend(locals);
                    let head_exprs: Vec<ExprRef> = [info.key.clone(), Some(info.value.clone())]
                        .into_iter()
                        .flatten()
                        .collect();
                    for e in &head_exprs {
                        let mut unsafe_vars: Vec<Rc<str>> = vec![];
                        collect_var_names(e, &mut |name: &Rc<str>| {
                            if !in_scope.contains(name)
                                && !self.is_global_name(name, &module_path, &aliases)
                                && !unsafe_vars.contains(name)
                            {
                                unsafe_vars.push(name.clone());
                            }
                        });
                        for var in unsafe_vars {
                            self.errors.push(CompileError::UnsafeVar {
                                span: e.span().clone(),
                                rule: info.path.clone(),
                                var: var.to_string(),
                            });
                        }
                    }
                }
            }
        }
    }

    fn is_global_name(&self, name: &Rc<str>, module_path: &str, aliases: &Aliases) -> bool {
        name.as_ref() == "input"
            || name.as_ref() == "data"
            || name.as_ref() == "_"
            || aliases.contains_key(name)
            || self
                .data
                .rule_paths
                .contains(&format!("{module_path}.{name}"))
    }

    /// Analyze one query: register its schedule, report unsafe variables,
    /// recurse into nested queries. Returns (free variables the query
    /// closes over, the query's own local variables).
    fn analyze_query(
        &mut self,
        query: &Ref<Query>,
        enclosing: &BTreeSet<Rc<str>>,
        module_path: &str,
        module: &Ref<Module>,
        rule_path: &str,
    ) -> (BTreeSet<Rc<str>>, BTreeSet<Rc<str>>) {
        let aliases = self
            .data
            .imports
            .get(module)
            .cloned()
            .unwrap_or_default();

        // Candidate local variables: names that resolve to nothing global.
        let mut locals: BTreeSet<Rc<str>> = BTreeSet::new();
        for stmt in &query.stmts {
            self.stmt_var_candidates(stmt, enclosing, module_path, &aliases, &mut locals);
        }

        let mut free: BTreeSet<Rc<str>> = BTreeSet::new();
        let mut infos: Vec<StmtInfo> = vec![];
        for stmt in &query.stmts {
            let mut defs: Vec<Definition> = vec![];
            let mut uses: Vec<Rc<str>> = vec![];
            self.stmt_defs_uses(
                stmt, &locals, enclosing, module_path, module, rule_path, &mut defs, &mut uses,
                &mut free,
            );
            if defs.is_empty() {
                defs.push(Definition {
                    var: "".into(),
                    used_vars: uses.clone(),
                });
            } else if !uses.is_empty() {
                // A defining statement only runs once its guard uses are
                // bound too; fold them into every definition.
                for d in defs.iter_mut() {
                    let extra: Vec<Rc<str>> = uses
                        .iter()
                        .filter(|u| **u != d.var && !d.used_vars.contains(u))
                        .cloned()
                        .collect();
                    d.used_vars.extend(extra);
                }
            }
            infos.push(StmtInfo { definitions: defs });
        }

        let result = schedule(&mut infos);
        for var in &result.unsafe_vars {
            self.errors.push(CompileError::UnsafeVar {
                span: query.span.clone(),
                rule: rule_path.to_string(),
                var: var.to_string(),
            });
        }
        self.data.schedules.insert(query.clone(), result.order);

        free.retain(|v| enclosing.contains(v));
        (free, locals)
    }

    /// Names in this statement that cannot resolve globally and therefore
    /// must be locals of the enclosing query.
    fn stmt_var_candidates(
        &self,
        stmt: &LiteralStmt,
        enclosing: &BTreeSet<Rc<str>>,
        module_path: &str,
        aliases: &Aliases,
        locals: &mut BTreeSet<Rc<str>>,
    ) {
        let rule_paths = &self.data.rule_paths;
        let mut visit = |name: &Rc<str>| {
            let global = name.as_ref() == "input"
                || name.as_ref() == "data"
                || name.as_ref() == "_"
                || enclosing.contains(name)
                || aliases.contains_key(name)
                || rule_paths.contains(&format!("{module_path}.{name}"));
            if !global {
                locals.insert(name.clone());
            }
        };
        match &stmt.literal {
            Literal::SomeVars { vars, .. } => {
                for v in vars {
                    visit(v);
                }
            }
            Literal::SomeIn {
                key,
                value,
                collection,
                ..
            } => {
                if let Some(k) = key {
                    collect_var_names(k, &mut visit);
                }
                collect_var_names(value, &mut visit);
                collect_var_names(collection, &mut visit);
            }
            Literal::Expr { expr, .. } | Literal::NotExpr { expr, .. } => {
                collect_var_names(expr, &mut visit);
            }
            Literal::Every { domain, .. } => {
                // Key/value live in the inner scope only.
                collect_var_names(domain, &mut visit);
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn stmt_defs_uses(
        &mut self,
        stmt: &LiteralStmt,
        locals: &BTreeSet<Rc<str>>,
        enclosing: &BTreeSet<Rc<str>>,
        module_path: &str,
        module: &Ref<Module>,
        rule_path: &str,
        defs: &mut Vec<Definition>,
        uses: &mut Vec<Rc<str>>,
        free: &mut BTreeSet<Rc<str>>,
    ) {
        match &stmt.literal {
            // `some x` declares without defining; a later generator must
            // bind it.
            Literal::SomeVars { .. } => {}
            Literal::SomeIn {
                key,
                value,
                collection,
                ..
            } => {
                let mut col_uses = vec![];
                self.expr_defs_uses(
                    collection, locals, enclosing, module_path, module, rule_path, defs,
                    &mut col_uses, free,
                );
                for pat in [key.as_ref(), Some(value)].into_iter().flatten() {
                    for v in pattern_vars(pat) {
                        if locals.contains(&v) {
                            defs.push(Definition {
                                var: v,
                                used_vars: col_uses.clone(),
                            });
                        }
                    }
                }
                uses.extend(col_uses);
            }
            Literal::Expr { expr, .. } => {
                self.expr_defs_uses(
                    expr, locals, enclosing, module_path, module, rule_path, defs, uses, free,
                );
            }
            // Bindings never escape a negated block; everything inside is
            // a use.
            Literal::NotExpr { expr, .. } => {
                let before = defs.len();
                self.expr_defs_uses(
                    expr, locals, enclosing, module_path, module, rule_path, defs, uses, free,
                );
                for d in defs.drain(before..) {
                    uses.push(d.var);
                    uses.extend(d.used_vars);
                }
            }
            Literal::Every {
                key,
                value,
                domain,
                query,
                ..
            } => {
                self.expr_defs_uses(
                    domain, locals, enclosing, module_path, module, rule_path, defs, uses, free,
                );
                let mut inner: BTreeSet<Rc<str>> = enclosing.clone();
                inner.extend(locals.iter().cloned());
                if let Some(k) = key {
                    inner.insert(k.clone());
                }
                inner.insert(value.clone());
                let (nested_free, _) =
                    self.analyze_query(query, &inner, module_path, module, rule_path);
                for v in nested_free {
                    if locals.contains(&v) {
                        uses.push(v);
                    }
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn expr_defs_uses(
        &mut self,
        expr: &ExprRef,
        locals: &BTreeSet<Rc<str>>,
        enclosing: &BTreeSet<Rc<str>>,
        module_path: &str,
        module: &Ref<Module>,
        rule_path: &str,
        defs: &mut Vec<Definition>,
        uses: &mut Vec<Rc<str>>,
        free: &mut BTreeSet<Rc<str>>,
    ) {
        macro_rules! recurse {
            ($e:expr) => {
                self.expr_defs_uses(
                    $e, locals, enclosing, module_path, module, rule_path, defs, uses, free,
                )
            };
        }
        match expr.as_ref() {
            Expr::Var { name, .. } => {
                if locals.contains(name) {
                    uses.push(name.clone());
                } else if enclosing.contains(name) {
                    free.insert(name.clone());
                }
            }
            Expr::Null { .. } | Expr::Bool { .. } | Expr::Number { .. } | Expr::String { .. } => {}
            Expr::RefDot { refr, .. } => recurse!(refr),
            Expr::RefBrack { refr, index, .. } => {
                // An unbound local in index position is a generator: the
                // reference iteration defines it.
                let mut prefix_uses = vec![];
                self.expr_defs_uses(
                    refr, locals, enclosing, module_path, module, rule_path, defs,
                    &mut prefix_uses, free,
                );
                match index.as_ref() {
                    Expr::Var { name, .. } if locals.contains(name) => {
                        defs.push(Definition {
                            var: name.clone(),
                            used_vars: prefix_uses.clone(),
                        });
                    }
                    _ => recurse!(index),
                }
                uses.extend(prefix_uses);
            }
            Expr::Array { items, .. } | Expr::Set { items, .. } => {
                for i in items {
                    recurse!(i);
                }
            }
            Expr::Object { fields, .. } => {
                for (k, v) in fields {
                    recurse!(k);
                    recurse!(v);
                }
            }
            Expr::ArrayCompr { query, .. }
            | Expr::SetCompr { query, .. }
            | Expr::ObjectCompr { query, .. } => {
                let mut inner: BTreeSet<Rc<str>> = enclosing.clone();
                inner.extend(locals.iter().cloned());
                let (nested_free, _) =
                    self.analyze_query(query, &inner, module_path, module, rule_path);
                let mut hints: Vec<Rc<str>> = vec![];
                for v in nested_free {
                    if locals.contains(&v) {
                        uses.push(v.clone());
                    }
                    if enclosing.contains(&v) {
                        free.insert(v.clone());
                    }
                    hints.push(v);
                }
                hints.sort();
                hints.dedup();
                self.data.compr_hints.insert(query.clone(), hints);
            }
            Expr::Call { fcn, params, .. } => {
                match self.resolve_function_name(fcn, module_path) {
                    Some(path) => {
                        let arity = self.data.functions.get(&path).map(|(_, a)| *a);
                        if arity != Some(params.len() as u8) {
                            self.type_error(
                                expr.span(),
                                &format!("`{path}` called with wrong number of arguments"),
                            );
                        }
                    }
                    None => {
                        let builtin_name = get_ref_components(fcn)
                            .map(|c| join_path(&c))
                            .unwrap_or_default();
                        match self.registry.lookup(&builtin_name, params.len() as u8) {
                            Some(_) => {}
                            None if self.registry.is_builtin(&builtin_name) => {
                                self.type_error(
                                    expr.span(),
                                    &format!(
                                        "`{builtin_name}` called with wrong number of arguments"
                                    ),
                                );
                            }
                            None => {
                                self.type_error(
                                    expr.span(),
                                    &format!(
                                        "unknown function `{builtin_name}` in rule `{rule_path}`"
                                    ),
                                );
                            }
                        }
                    }
                }
                for p in params {
                    recurse!(p);
                }
            }
            Expr::ArithExpr { lhs, rhs, .. } | Expr::BoolExpr { lhs, rhs, .. } => {
                recurse!(lhs);
                recurse!(rhs);
            }
            Expr::AssignExpr { op, lhs, rhs, .. } => {
                let lhs_pat: Vec<Rc<str>> = pattern_vars(lhs)
                    .into_iter()
                    .filter(|v| locals.contains(v))
                    .collect();
                let rhs_pat: Vec<Rc<str>> = pattern_vars(rhs)
                    .into_iter()
                    .filter(|v| locals.contains(v))
                    .collect();

                let mut lhs_uses = vec![];
                let mut rhs_uses = vec![];
                self.expr_defs_uses(
                    lhs, locals, enclosing, module_path, module, rule_path, defs, &mut lhs_uses,
                    free,
                );
                self.expr_defs_uses(
                    rhs, locals, enclosing, module_path, module, rule_path, defs, &mut rhs_uses,
                    free,
                );

                match op {
                    AssignOp::ColEq => {
                        for v in lhs_pat {
                            defs.push(Definition {
                                var: v,
                                used_vars: rhs_uses.clone(),
                            });
                        }
                        uses.extend(rhs_uses);
                    }
                    AssignOp::Eq => {
                        // Unification is bidirectional: either side's
                        // pattern may be the one being generated.
                        for v in &lhs_pat {
                            let mut used = rhs_uses.clone();
                            used.retain(|u| u != v);
                            defs.push(Definition {
                                var: v.clone(),
                                used_vars: used,
                            });
                        }
                        for v in &rhs_pat {
                            let mut used = lhs_uses.clone();
                            used.retain(|u| u != v);
                            defs.push(Definition {
                                var: v.clone(),
                                used_vars: used,
                            });
                        }
                        if lhs_pat.is_empty() && rhs_pat.is_empty() {
                            uses.extend(lhs_uses);
                            uses.extend(rhs_uses);
                        }
                    }
                }
            }
            Expr::Membership {
                key,
                value,
                collection,
                ..
            } => {
                if let Some(k) = key {
                    recurse!(k);
                }
                recurse!(value);
                recurse!(collection);
            }
        }
    }

    // Pass 5: per-rule-set discrimination indices.
    fn build_indices(&mut self) {
        for (path, rules) in &self.data.rules {
            let index = RuleIndex::build(rules);
            self.data.indices.insert(path.clone(), index);
        }
    }

    fn type_error(&mut self, span: &Span, msg: &str) {
        self.errors.push(CompileError::Type {
            span: span.clone(),
            msg: msg.to_string(),
        });
    }
}

/// All variable names mentioned anywhere in an expression (call targets
/// and comprehension-local names excluded).
fn collect_var_names(expr: &ExprRef, visit: &mut impl FnMut(&Rc<str>)) {
    match expr.as_ref() {
        Expr::Var { name, .. } => visit(name),
        Expr::Null { .. } | Expr::Bool { .. } | Expr::Number { .. } | Expr::String { .. } => {}
        Expr::RefDot { refr, .. } => collect_var_names(refr, visit),
        Expr::RefBrack { refr, index, .. } => {
            collect_var_names(refr, visit);
            collect_var_names(index, visit);
        }
        Expr::Array { items, .. } | Expr::Set { items, .. } => {
            for i in items {
                collect_var_names(i, visit);
            }
        }
        Expr::Object { fields, .. } => {
            for (k, v) in fields {
                collect_var_names(k, visit);
                collect_var_names(v, visit);
            }
        }
        // Comprehension-local names stay local; closed-over names are
        // accounted for in the nested analysis.
        Expr::ArrayCompr { .. } | Expr::SetCompr { .. } | Expr::ObjectCompr { .. } => {}
        Expr::Call { params, .. } => {
            for p in params {
                collect_var_names(p, visit);
            }
        }
        Expr::ArithExpr { lhs, rhs, .. }
        | Expr::BoolExpr { lhs, rhs, .. }
        | Expr::AssignExpr { lhs, rhs, .. } => {
            collect_var_names(lhs, visit);
            collect_var_names(rhs, visit);
        }
        Expr::Membership {
            key,
            value,
            collection,
            ..
        } => {
            if let Some(k) = key {
                collect_var_names(k, visit);
            }
            collect_var_names(value, visit);
            collect_var_names(collection, visit);
        }
    }
}

/// Ground constant check for default rule values.
fn is_constant(expr: &ExprRef) -> bool {
    match expr.as_ref() {
        Expr::Null { .. } | Expr::Bool { .. } | Expr::Number { .. } | Expr::String { .. } => true,
        Expr::Array { items, .. } | Expr::Set { items, .. } => items.iter().all(is_constant),
        Expr::Object { fields, .. } => fields.iter().all(|(k, v)| is_constant(k) && is_constant(v)),
        _ => false,
    }
}
