// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use crate::builtins::{self, ensure_args_count, ensure_string};
use crate::value::Value;

use std::collections::HashMap;

use anyhow::{bail, Result};

pub fn register(m: &mut HashMap<&'static str, (builtins::BuiltinFcn, u8)>) {
    m.insert("concat", (concat, 2));
    m.insert("contains", (contains, 2));
    m.insert("startswith", (startswith, 2));
    m.insert("endswith", (endswith, 2));
    m.insert("lower", (lower, 1));
    m.insert("upper", (upper, 1));
}

fn concat(args: &[Value]) -> Result<Value> {
    ensure_args_count("concat", args, 2)?;
    let delimiter = ensure_string("concat", &args[0])?;

    let mut parts = vec![];
    match &args[1] {
        Value::Array(a) => {
            for e in a.iter() {
                parts.push(ensure_string("concat", e)?);
            }
        }
        Value::Set(s) => {
            for e in s.iter() {
                parts.push(ensure_string("concat", e)?);
            }
        }
        a => bail!("`concat` requires array/set argument. Got `{a}`."),
    }

    let parts: Vec<&str> = parts.iter().map(|p| p.as_ref()).collect();
    Ok(Value::from(parts.join(delimiter.as_ref())))
}

fn contains(args: &[Value]) -> Result<Value> {
    ensure_args_count("contains", args, 2)?;
    let s = ensure_string("contains", &args[0])?;
    let needle = ensure_string("contains", &args[1])?;
    Ok(Value::Bool(s.contains(needle.as_ref())))
}

fn startswith(args: &[Value]) -> Result<Value> {
    ensure_args_count("startswith", args, 2)?;
    let s = ensure_string("startswith", &args[0])?;
    let prefix = ensure_string("startswith", &args[1])?;
    Ok(Value::Bool(s.starts_with(prefix.as_ref())))
}

fn endswith(args: &[Value]) -> Result<Value> {
    ensure_args_count("endswith", args, 2)?;
    let s = ensure_string("endswith", &args[0])?;
    let suffix = ensure_string("endswith", &args[1])?;
    Ok(Value::Bool(s.ends_with(suffix.as_ref())))
}

fn lower(args: &[Value]) -> Result<Value> {
    ensure_args_count("lower", args, 1)?;
    Ok(Value::from(ensure_string("lower", &args[0])?.to_lowercase()))
}

fn upper(args: &[Value]) -> Result<Value> {
    ensure_args_count("upper", args, 1)?;
    Ok(Value::from(ensure_string("upper", &args[0])?.to_uppercase()))
}
