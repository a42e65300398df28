// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use crate::value::Value;

use std::collections::BTreeMap;
use std::rc::Rc;

type Scope = BTreeMap<Rc<str>, Value>;

/// Position in the binding trail. Undoing to a mark restores the
/// environment to its state when the mark was taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mark(usize);

#[derive(Debug)]
enum TrailOp {
    // Records the previous state of a binding; None means the name was
    // absent from the scope.
    Bind {
        scope: usize,
        name: Rc<str>,
        prev: Option<Value>,
    },
    PushScope,
}

#[derive(Debug)]
struct ScopeEntry {
    map: Scope,
    // Name resolution stops here: rule and function bodies must not
    // observe their caller's locals. Comprehension scopes are not
    // barriers; they close over the enclosing body.
    barrier: bool,
}

/// Per-evaluation binding environment: a scope stack for name resolution
/// plus an append-only trail so a failed alternative unwinds with O(1)
/// amortized pops instead of cloning environments at every choice point.
#[derive(Debug)]
pub struct Bindings {
    scopes: Vec<ScopeEntry>,
    trail: Vec<TrailOp>,
}

impl Default for Bindings {
    fn default() -> Self {
        Self::new()
    }
}

impl Bindings {
    pub fn new() -> Bindings {
        Bindings {
            scopes: vec![ScopeEntry {
                map: Scope::new(),
                barrier: true,
            }],
            trail: vec![],
        }
    }

    pub fn mark(&self) -> Mark {
        Mark(self.trail.len())
    }

    /// Pop trail entries back to `mark`, restoring every binding and scope
    /// made since.
    pub fn undo_to(&mut self, mark: Mark) {
        while self.trail.len() > mark.0 {
            match self.trail.pop() {
                Some(TrailOp::Bind { scope, name, prev }) => {
                    if let Some(s) = self.scopes.get_mut(scope) {
                        match prev {
                            Some(v) => {
                                s.map.insert(name, v);
                            }
                            None => {
                                s.map.remove(&name);
                            }
                        }
                    }
                }
                Some(TrailOp::PushScope) => {
                    self.scopes.pop();
                }
                None => break,
            }
        }
    }

    /// Enter a nested scope that closes over the current one
    /// (comprehension, `every` body, negated block).
    pub fn push_scope(&mut self) {
        self.scopes.push(ScopeEntry {
            map: Scope::new(),
            barrier: false,
        });
        self.trail.push(TrailOp::PushScope);
    }

    /// Enter an isolated scope (rule or function body). Lookups do not
    /// continue past it into the caller's locals.
    pub fn push_barrier_scope(&mut self) {
        self.scopes.push(ScopeEntry {
            map: Scope::new(),
            barrier: true,
        });
        self.trail.push(TrailOp::PushScope);
    }

    /// Bind `name` in the current scope, shadowing any outer binding.
    /// The wildcard `_` is never stored.
    pub fn insert(&mut self, name: &Rc<str>, value: Value) {
        if name.as_ref() == "_" {
            return;
        }
        let scope = self.scopes.len() - 1;
        let prev = self.scopes[scope].map.insert(name.clone(), value);
        self.trail.push(TrailOp::Bind {
            scope,
            name: name.clone(),
            prev,
        });
    }

    /// Replace the innermost visible binding of `name`; binds in the
    /// current scope when none exists.
    pub fn set(&mut self, name: &Rc<str>, value: Value) {
        if name.as_ref() == "_" {
            return;
        }
        for scope in (0..self.scopes.len()).rev() {
            if self.scopes[scope].map.contains_key(name) {
                let prev = self.scopes[scope].map.insert(name.clone(), value);
                self.trail.push(TrailOp::Bind {
                    scope,
                    name: name.clone(),
                    prev,
                });
                return;
            }
            if self.scopes[scope].barrier {
                break;
            }
        }
        self.insert(name, value);
    }

    /// Innermost visible binding of `name`, if any. A `Value::Undefined`
    /// binding means declared (`some x`) but not yet generated.
    pub fn get(&self, name: &str) -> Option<&Value> {
        for entry in self.scopes.iter().rev() {
            if let Some(v) = entry.map.get(name) {
                return Some(v);
            }
            if entry.barrier {
                break;
            }
        }
        None
    }

    /// Bindings of the current scope, for solution reporting.
    pub fn current_scope(&self) -> &BTreeMap<Rc<str>, Value> {
        &self
            .scopes
            .last()
            .expect("binding environment has no scope")
            .map
    }

    pub fn depth(&self) -> usize {
        self.scopes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(s: &str) -> Rc<str> {
        Rc::from(s)
    }

    #[test]
    fn undo_restores_previous_binding() {
        let mut b = Bindings::new();
        b.insert(&name("x"), Value::from(1i64));
        let m = b.mark();
        b.set(&name("x"), Value::from(2i64));
        b.insert(&name("y"), Value::from(3i64));
        assert_eq!(b.get("x"), Some(&Value::from(2i64)));

        b.undo_to(m);
        assert_eq!(b.get("x"), Some(&Value::from(1i64)));
        assert_eq!(b.get("y"), None);
    }

    #[test]
    fn undo_pops_scopes() {
        let mut b = Bindings::new();
        let m = b.mark();
        b.push_scope();
        b.insert(&name("x"), Value::from(1i64));
        assert_eq!(b.depth(), 2);

        b.undo_to(m);
        assert_eq!(b.depth(), 1);
        assert_eq!(b.get("x"), None);
    }

    #[test]
    fn inner_scope_shadows_outer() {
        let mut b = Bindings::new();
        b.insert(&name("x"), Value::from(1i64));
        b.push_scope();
        b.insert(&name("x"), Value::from(2i64));
        assert_eq!(b.get("x"), Some(&Value::from(2i64)));
    }

    #[test]
    fn barrier_scopes_hide_caller_locals() {
        let mut b = Bindings::new();
        b.insert(&name("x"), Value::from(1i64));
        b.push_scope();
        assert_eq!(b.get("x"), Some(&Value::from(1i64)));
        b.push_barrier_scope();
        assert_eq!(b.get("x"), None);
    }

    #[test]
    fn wildcard_is_never_bound() {
        let mut b = Bindings::new();
        b.insert(&name("_"), Value::from(1i64));
        assert_eq!(b.get("_"), None);
    }
}
