// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use crate::ast::*;

use std::rc::Rc;

/// Collect the string segments of a ref chain, root first. Computed
/// segments stop the walk and yield `None`.
pub fn get_ref_components(refr: &Expr) -> Option<Vec<Rc<str>>> {
    let mut comps: Vec<Rc<str>> = vec![];
    let mut expr = Some(refr);
    while let Some(e) = expr {
        match e {
            Expr::RefDot { refr, field, .. } => {
                comps.push(field.clone());
                expr = Some(refr);
            }
            Expr::RefBrack { refr, index, .. } => match index.as_ref() {
                Expr::String { value, .. } => {
                    comps.push(value.clone());
                    expr = Some(refr);
                }
                _ => return None,
            },
            Expr::Var { name, .. } => {
                comps.push(name.clone());
                expr = None;
            }
            _ => return None,
        }
    }
    comps.reverse();
    Some(comps)
}

/// Dotted rendering of a package-relative rule path.
pub fn join_path(parts: &[Rc<str>]) -> String {
    parts
        .iter()
        .map(|p| p.as_ref())
        .collect::<Vec<&str>>()
        .join(".")
}

/// Two dotted paths overlap when either is a segment-prefix of the other.
pub fn path_overlaps(a: &str, b: &str) -> bool {
    a == b
        || b.strip_prefix(a).is_some_and(|rest| rest.starts_with('.'))
        || a.strip_prefix(b).is_some_and(|rest| rest.starts_with('.'))
}

/// Variables bound when the expression is used as a unification pattern.
pub fn pattern_vars(expr: &ExprRef) -> Vec<Rc<str>> {
    fn walk(expr: &ExprRef, vars: &mut Vec<Rc<str>>) {
        match expr.as_ref() {
            Expr::Var { name, .. } if name.as_ref() != "_" => vars.push(name.clone()),
            Expr::Array { items, .. } => {
                for i in items {
                    walk(i, vars);
                }
            }
            Expr::Object { fields, .. } => {
                for (_, v) in fields {
                    walk(v, vars);
                }
            }
            _ => {}
        }
    }
    let mut vars = vec![];
    walk(expr, &mut vars);
    vars
}
