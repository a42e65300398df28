// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

pub mod aggregates;
pub mod numbers;
pub mod strings;

use crate::value::Value;

use std::collections::HashMap;

use anyhow::{bail, Result};
use lazy_static::lazy_static;

pub type BuiltinFcn = fn(&[Value]) -> Result<Value>;

/// Registration record for one built-in function.
#[derive(Clone, Copy)]
pub struct BuiltinDecl {
    pub fcn: BuiltinFcn,
    pub arity: u8,
    /// When set, an error from the function is treated as an undefined
    /// result (ordinary backtracking) instead of aborting the query.
    pub undefined_on_error: bool,
}

#[rustfmt::skip]
lazy_static! {
    static ref DEFAULTS: HashMap<&'static str, (BuiltinFcn, u8)> = {
	let mut m: HashMap<&'static str, (BuiltinFcn, u8)> = HashMap::new();

	aggregates::register(&mut m);
	numbers::register(&mut m);
	strings::register(&mut m);

	m
    };
}

/// Capability-keyed dispatch table: (name, arity) -> function. The engine
/// treats registered functions as an opaque capability set.
#[derive(Clone)]
pub struct BuiltinRegistry {
    table: HashMap<String, BuiltinDecl>,
}

impl Default for BuiltinRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl BuiltinRegistry {
    pub fn empty() -> BuiltinRegistry {
        BuiltinRegistry {
            table: HashMap::new(),
        }
    }

    pub fn with_defaults() -> BuiltinRegistry {
        let mut r = Self::empty();
        for (name, (fcn, arity)) in DEFAULTS.iter() {
            r.register(name, *arity, *fcn, false);
        }
        // Conversion failures are undefined results, not query aborts.
        if let Some(decl) = r.table.get_mut("to_number") {
            decl.undefined_on_error = true;
        }
        r
    }

    pub fn register(&mut self, name: &str, arity: u8, fcn: BuiltinFcn, undefined_on_error: bool) {
        self.table.insert(
            name.to_string(),
            BuiltinDecl {
                fcn,
                arity,
                undefined_on_error,
            },
        );
    }

    pub fn lookup(&self, name: &str, arity: u8) -> Option<&BuiltinDecl> {
        self.table.get(name).filter(|d| d.arity == arity)
    }

    pub fn is_builtin(&self, name: &str) -> bool {
        self.table.contains_key(name)
    }
}

pub fn ensure_args_count(fcn: &'static str, args: &[Value], expected: usize) -> Result<()> {
    if args.len() != expected {
        if expected == 1 {
            bail!("`{fcn}` expects 1 argument");
        }
        bail!("`{fcn}` expects {expected} arguments");
    }
    Ok(())
}

pub fn ensure_numeric(fcn: &str, v: &Value) -> Result<crate::number::Number> {
    match &v {
        Value::Number(n) => Ok(n.clone()),
        _ => bail!("`{fcn}` expects numeric argument. Got `{v}` instead"),
    }
}

pub fn ensure_string(fcn: &str, v: &Value) -> Result<std::rc::Rc<str>> {
    match &v {
        Value::String(s) => Ok(s.clone()),
        _ => bail!("`{fcn}` expects string argument. Got `{v}` instead"),
    }
}
