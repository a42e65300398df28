// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;

#[derive(Debug)]
pub struct Definition {
    // The variable being defined.
    // An empty name indicates that no variable is being defined.
    pub var: Rc<str>,

    // Other variables in the same scope used to compute
    // the value of this variable.
    pub used_vars: Vec<Rc<str>>,
}

#[derive(Debug, Default)]
pub struct StmtInfo {
    // A statement can define multiple variables.
    // A variable can also be defined by multiple statements.
    pub definitions: Vec<Definition>,
}

#[derive(Debug)]
pub struct ScheduleResult {
    // The order in which statements must be executed.
    pub order: Vec<usize>,
    // Variables that no generator can ever bind, in first-use order.
    // Non-empty means the statement set is unsafe; cascading failures are
    // reported per variable, not collapsed to a root cause.
    pub unsafe_vars: Vec<Rc<str>>,
}

pub fn schedule(infos: &mut [StmtInfo]) -> ScheduleResult {
    // Mapping from each var to the list of statements that define it.
    let mut defining_stmts: BTreeMap<Rc<str>, Vec<usize>> = BTreeMap::new();

    for (idx, info) in infos.iter().enumerate() {
        for defn in &info.definitions {
            defining_stmts.entry(defn.var.clone()).or_default().push(idx);
        }
    }

    // Order of execution for statements.
    let mut order = Vec::with_capacity(infos.len());

    // Keep track of whether a var has been defined or not.
    let mut defined_vars: BTreeSet<Rc<str>> = BTreeSet::new();

    // Keep track of whether a statement has been scheduled or not.
    let mut scheduled = vec![false; infos.len()];

    // Vars used anywhere without any defining statement can never become
    // safe; treat them as defined-by-nothing so their users are the ones
    // reported.
    let mut missing: Vec<Rc<str>> = vec![];
    for info in infos.iter() {
        for defn in &info.definitions {
            for used in &defn.used_vars {
                if !defining_stmts.contains_key(used) && !missing.contains(used) {
                    missing.push(used.clone());
                }
            }
        }
    }

    let mut vars_to_process: Vec<Rc<str>> = defining_stmts.keys().cloned().collect();
    let mut tmp = vec![];

    let mut process_var = |var: &Rc<str>,
                           order: &mut Vec<usize>,
                           defined_vars: &mut BTreeSet<Rc<str>>,
                           scheduled: &mut Vec<bool>| {
        let mut stmt_scheduled = false;
        let mut reprocess_var = false;
        // Loop through each statement that defines the var.
        for stmt_idx in defining_stmts.get(var).cloned().unwrap_or_default() {
            if scheduled[stmt_idx] {
                continue;
            }

            // In the statement, find the defn for the var.
            for defn in &infos[stmt_idx].definitions {
                if defn.var != *var {
                    continue;
                }

                // If all the vars used by the definition are defined,
                // then the statement can be scheduled.
                if defn.used_vars.iter().all(|v| defined_vars.contains(v)) {
                    order.push(stmt_idx);
                    scheduled[stmt_idx] = true;
                    if !var.is_empty() {
                        defined_vars.insert(var.clone());
                    }
                    stmt_scheduled = true;
                } else {
                    reprocess_var = true;
                }
            }
        }

        (stmt_scheduled, reprocess_var)
    };

    let mut done = false;
    while !done {
        done = true;

        std::mem::swap(&mut vars_to_process, &mut tmp);

        for var in tmp.drain(..).collect::<Vec<_>>() {
            let (stmt_scheduled, reprocess_var) =
                process_var(&var, &mut order, &mut defined_vars, &mut scheduled);

            if stmt_scheduled {
                done = false;

                // A var became defined; statements that define no var
                // (e.g. `x > 10`) may now be schedulable.
                let anon: Rc<str> = "".into();
                process_var(&anon, &mut order, &mut defined_vars, &mut scheduled);
            }

            if reprocess_var {
                vars_to_process.push(var);
            }
        }
    }

    // Whatever could not be scheduled names its unsatisfied vars.
    let mut unsafe_vars: Vec<Rc<str>> = missing;
    for (idx, info) in infos.iter().enumerate() {
        if scheduled[idx] {
            continue;
        }
        for defn in &info.definitions {
            if !defn.var.is_empty()
                && !defined_vars.contains(&defn.var)
                && !unsafe_vars.contains(&defn.var)
            {
                unsafe_vars.push(defn.var.clone());
            }
        }
    }

    ScheduleResult { order, unsafe_vars }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn defn(var: &str, used: &[&str]) -> Definition {
        Definition {
            var: var.into(),
            used_vars: used.iter().map(|u| Rc::from(*u)).collect(),
        }
    }

    #[test]
    fn reorders_use_before_definition() {
        // stmt0: y = x + 1 (defines y, uses x)
        // stmt1: x = 5     (defines x)
        let mut infos = vec![
            StmtInfo { definitions: vec![defn("y", &["x"])] },
            StmtInfo { definitions: vec![defn("x", &[])] },
        ];
        let result = schedule(&mut infos);
        assert!(result.unsafe_vars.is_empty());
        assert_eq!(result.order, vec![1, 0]);
    }

    #[test]
    fn reports_undefinable_vars() {
        // stmt0: y = x + 1, x never defined anywhere.
        let mut infos = vec![StmtInfo { definitions: vec![defn("y", &["x"])] }];
        let result = schedule(&mut infos);
        let names: Vec<&str> = result.unsafe_vars.iter().map(|v| v.as_ref()).collect();
        assert!(names.contains(&"x"));
        assert!(names.contains(&"y"), "dependent var is reported too");
    }

    #[test]
    fn schedules_guards_after_generators() {
        // stmt0: x > 10 (no definition, uses x)
        // stmt1: x = input-ish generator (defines x)
        let mut infos = vec![
            StmtInfo { definitions: vec![defn("", &["x"])] },
            StmtInfo { definitions: vec![defn("x", &[])] },
        ];
        let result = schedule(&mut infos);
        assert!(result.unsafe_vars.is_empty());
        assert_eq!(result.order, vec![1, 0]);
    }
}
