// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use crate::ast::*;
use crate::utils::*;
use crate::value::Value;

use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;

/// Outcome of a candidate-rule lookup.
#[derive(Debug, PartialEq, Eq)]
pub enum Lookup {
    /// Candidate rules, in declaration order. Rules excluded here can never
    /// match: exclusion happens only on equality constants the caller's
    /// document contradicts.
    Selected(Vec<usize>),
    /// The index cannot narrow the set; scan every rule in order.
    Unindexed,
}

#[derive(Debug, Default)]
struct TrieNode {
    edges: BTreeMap<Value, TrieNode>,
    wildcard: Option<Box<TrieNode>>,
    rules: Vec<usize>,
}

/// Discrimination structure over equality constraints between `input` refs
/// and ground constants in rule bodies. Purely an acceleration: a lookup
/// may over-select, never under-select.
#[derive(Debug, Default)]
pub struct RuleIndex {
    // Constraining refs (segments below the `input` root), one trie level
    // each, in a fixed deterministic order.
    refs: Vec<Vec<Rc<str>>>,
    root: TrieNode,
    indexable: bool,
}

impl RuleIndex {
    pub fn build(rules: &[Ref<Rule>]) -> RuleIndex {
        let mut constraints: Vec<BTreeMap<Vec<Rc<str>>, Value>> = vec![];
        for rule in rules {
            constraints.push(Self::rule_constraints(rule));
        }

        // Index only when at least one rule carries a usable constraint.
        let ref_set: BTreeSet<Vec<Rc<str>>> =
            constraints.iter().flat_map(|c| c.keys().cloned()).collect();
        if ref_set.is_empty() {
            return RuleIndex::default();
        }

        let refs: Vec<Vec<Rc<str>>> = ref_set.into_iter().collect();
        let mut root = TrieNode::default();
        for (idx, cs) in constraints.iter().enumerate() {
            let mut node = &mut root;
            for r in &refs {
                node = match cs.get(r) {
                    Some(v) => node.edges.entry(v.clone()).or_default(),
                    None => node.wildcard.get_or_insert_with(Default::default),
                };
            }
            node.rules.push(idx);
        }

        RuleIndex {
            refs,
            root,
            indexable: true,
        }
    }

    /// Equality constraints of the form `input.a.b == <const>` among the
    /// leading statements of a single-body rule.
    fn rule_constraints(rule: &Ref<Rule>) -> BTreeMap<Vec<Rc<str>>, Value> {
        let mut cs = BTreeMap::new();
        let bodies = match rule.as_ref() {
            Rule::Spec { bodies, .. } if bodies.len() == 1 => bodies,
            _ => return cs,
        };
        for stmt in &bodies[0].query.stmts {
            let expr = match &stmt.literal {
                Literal::Expr { expr, .. } => expr,
                _ => break,
            };
            let (lhs, rhs) = match expr.as_ref() {
                Expr::BoolExpr { op: BoolOp::Eq, lhs, rhs, .. } => (lhs, rhs),
                Expr::AssignExpr { op: AssignOp::Eq, lhs, rhs, .. } => (lhs, rhs),
                _ => break,
            };
            let pair = match (Self::input_ref(lhs), Self::const_value(rhs)) {
                (Some(r), Some(v)) => Some((r, v)),
                _ => match (Self::input_ref(rhs), Self::const_value(lhs)) {
                    (Some(r), Some(v)) => Some((r, v)),
                    _ => None,
                },
            };
            match pair {
                // First constraint per ref wins; later ones are ordinary
                // body statements.
                Some((r, v)) => {
                    cs.entry(r).or_insert(v);
                }
                None => break,
            }
        }
        cs
    }

    fn input_ref(expr: &ExprRef) -> Option<Vec<Rc<str>>> {
        let comps = get_ref_components(expr)?;
        match comps.split_first() {
            Some((root, rest)) if root.as_ref() == "input" && !rest.is_empty() => {
                Some(rest.to_vec())
            }
            _ => None,
        }
    }

    fn const_value(expr: &ExprRef) -> Option<Value> {
        match expr.as_ref() {
            Expr::Null { .. } => Some(Value::Null),
            Expr::Bool { value, .. } => Some(Value::Bool(*value)),
            Expr::Number { value, .. } => Some(Value::Number(value.clone())),
            Expr::String { value, .. } => Some(Value::String(value.clone())),
            _ => None,
        }
    }

    /// Select candidate rules for the given input document. `input` must be
    /// the fully resolved document; when it is not available the caller
    /// passes `None` and gets `Unindexed`.
    pub fn lookup(&self, input: Option<&Value>) -> Lookup {
        let input = match (self.indexable, input) {
            (true, Some(input)) => input,
            _ => return Lookup::Unindexed,
        };

        let mut selected: Vec<usize> = vec![];
        // Frontier walk: each level follows the matching constant edge and
        // the wildcard edge.
        let mut frontier: Vec<&TrieNode> = vec![&self.root];
        for r in &self.refs {
            let key = Self::resolve(input, r);
            let mut next = vec![];
            for node in frontier {
                if let Some(child) = node.edges.get(&key) {
                    next.push(child);
                }
                if let Some(w) = &node.wildcard {
                    next.push(w.as_ref());
                }
            }
            frontier = next;
            if frontier.is_empty() {
                break;
            }
        }
        for node in frontier {
            selected.extend(node.rules.iter().copied());
        }
        selected.sort_unstable();
        selected.dedup();
        Lookup::Selected(selected)
    }

    fn resolve(input: &Value, segments: &[Rc<str>]) -> Value {
        let mut v = input;
        for s in segments {
            v = &v[s.as_ref()];
        }
        v.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eq_rule(path: &str, value: &str) -> Ref<Rule> {
        Rule::complete(
            "allow",
            None,
            Query::from_exprs(vec![Expr::eq(Expr::ref_path(path), Expr::string(value))]),
        )
    }

    #[test]
    fn partitions_by_constant() {
        let rules = vec![
            eq_rule("input.role", "admin"),
            eq_rule("input.role", "guest"),
            eq_rule("input.other", "x"),
        ];
        let index = RuleIndex::build(&rules);

        let input = Value::from_json_str(r#"{"role": "admin"}"#).unwrap();
        match index.lookup(Some(&input)) {
            // rule 2 constrains a different ref; it stays a candidate
            // through the wildcard edge.
            Lookup::Selected(rules) => assert_eq!(rules, vec![0, 2]),
            Lookup::Unindexed => panic!("expected selection"),
        }
    }

    #[test]
    fn unconstrained_rules_always_selected() {
        let rules = vec![
            eq_rule("input.role", "admin"),
            Rule::complete("allow", None, Query::from_exprs(vec![Expr::boolean(true)])),
        ];
        let index = RuleIndex::build(&rules);
        let input = Value::from_json_str(r#"{"role": "nobody"}"#).unwrap();
        match index.lookup(Some(&input)) {
            Lookup::Selected(rules) => assert_eq!(rules, vec![1]),
            Lookup::Unindexed => panic!("expected selection"),
        }
    }

    #[test]
    fn no_constraints_means_unindexed() {
        let rules = vec![Rule::complete(
            "allow",
            None,
            Query::from_exprs(vec![Expr::boolean(true)]),
        )];
        let index = RuleIndex::build(&rules);
        assert_eq!(index.lookup(Some(&Value::new_object())), Lookup::Unindexed);
        assert_eq!(index.lookup(None), Lookup::Unindexed);
    }
}
