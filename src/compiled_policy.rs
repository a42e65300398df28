// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use crate::ast::*;
use crate::index::RuleIndex;

use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;

/// How a rule set contributes to the virtual document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleKind {
    CompleteValue,
    PartialSet,
    PartialObject,
    Function,
}

/// Normalized head metadata for one rule clause, produced by the rewrite
/// pass. The AST itself stays untouched; normalization lives here.
#[derive(Debug, Clone)]
pub struct RuleInfo {
    /// Full dotted path, e.g. `data.example.allow`.
    pub path: String,
    pub kind: RuleKind,
    /// Set element or object key expression.
    pub key: Option<ExprRef>,
    /// Head value expression. Heads without an explicit assignment are
    /// normalized to `true`.
    pub value: ExprRef,
    /// Owning module, for package-relative name resolution.
    pub module: Ref<Module>,
}

pub(crate) type FunctionTable = BTreeMap<String, (Vec<Ref<Rule>>, u8)>;

/// Everything the compiler produces. Immutable once built; queries share
/// it read-only through [`CompiledPolicy`].
#[derive(Debug, Default)]
pub(crate) struct CompiledPolicyData {
    pub(crate) modules: Vec<Ref<Module>>,

    /// Rule clauses grouped by full path, in module load order then source
    /// order. This is the single disjunctive form for incremental rules.
    pub(crate) rules: BTreeMap<String, Vec<Ref<Rule>>>,
    pub(crate) default_rules: BTreeMap<String, Ref<Rule>>,
    pub(crate) functions: FunctionTable,
    pub(crate) rule_infos: BTreeMap<Ref<Rule>, RuleInfo>,
    pub(crate) rule_paths: BTreeSet<String>,

    /// Per-module import alias -> fully qualified path.
    pub(crate) imports: BTreeMap<Ref<Module>, BTreeMap<Rc<str>, Vec<Rc<str>>>>,

    /// Statement execution order per query, from safety analysis.
    pub(crate) schedules: BTreeMap<Ref<Query>, Vec<usize>>,

    /// Closed-over variables per comprehension query; the evaluator keys
    /// its comprehension cache with their values.
    pub(crate) compr_hints: BTreeMap<Ref<Query>, Vec<Rc<str>>>,

    /// Discrimination index per rule-set path.
    pub(crate) indices: BTreeMap<String, RuleIndex>,
}

/// Shared handle to a compiled policy. Cheap to clone; safe to hand to any
/// number of concurrent evaluations, each of which owns its own caches and
/// binding environment.
#[derive(Debug, Clone)]
pub struct CompiledPolicy {
    pub(crate) inner: Rc<CompiledPolicyData>,
}

impl CompiledPolicy {
    pub(crate) fn new(inner: Rc<CompiledPolicyData>) -> Self {
        Self { inner }
    }

    pub fn modules(&self) -> &Vec<Ref<Module>> {
        &self.inner.modules
    }

    /// Rule clauses grouped by full dotted path, for downstream consumers
    /// like the planner.
    pub fn rules(&self) -> &BTreeMap<String, Vec<Ref<Rule>>> {
        &self.inner.rules
    }

    /// All virtual document paths defined by this policy.
    pub fn rule_paths(&self) -> impl Iterator<Item = &str> {
        self.inner.rule_paths.iter().map(|p| p.as_str())
    }

    pub(crate) fn rule_info(&self, rule: &Ref<Rule>) -> Option<&RuleInfo> {
        self.inner.rule_infos.get(rule)
    }
}
