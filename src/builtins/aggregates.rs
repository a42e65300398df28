// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use crate::builtins::{self, ensure_args_count, ensure_numeric};
use crate::number::Number;
use crate::value::Value;

use std::collections::HashMap;

use anyhow::{bail, Result};

pub fn register(m: &mut HashMap<&'static str, (builtins::BuiltinFcn, u8)>) {
    m.insert("count", (count, 1));
    m.insert("max", (max, 1));
    m.insert("min", (min, 1));
    m.insert("sum", (sum, 1));
}

fn count(args: &[Value]) -> Result<Value> {
    ensure_args_count("count", args, 1)?;

    Ok(Value::from(match &args[0] {
        Value::Array(a) => a.len(),
        Value::Set(s) => s.len(),
        Value::Object(o) => o.len(),
        Value::String(s) => s.chars().count(),
        a => bail!("`count` requires array/object/set/string argument. Got `{a}`."),
    }))
}

fn max(args: &[Value]) -> Result<Value> {
    ensure_args_count("max", args, 1)?;

    Ok(match &args[0] {
        Value::Array(a) => a.iter().max().cloned().unwrap_or(Value::Undefined),
        Value::Set(s) => s.iter().max().cloned().unwrap_or(Value::Undefined),
        a => bail!("`max` requires array/set argument. Got `{a}`."),
    })
}

fn min(args: &[Value]) -> Result<Value> {
    ensure_args_count("min", args, 1)?;

    Ok(match &args[0] {
        Value::Array(a) => a.iter().min().cloned().unwrap_or(Value::Undefined),
        Value::Set(s) => s.iter().min().cloned().unwrap_or(Value::Undefined),
        a => bail!("`min` requires array/set argument. Got `{a}`."),
    })
}

fn sum(args: &[Value]) -> Result<Value> {
    ensure_args_count("sum", args, 1)?;

    let mut total = Number::from(0i64);
    match &args[0] {
        Value::Array(a) => {
            for e in a.iter() {
                total = total.add(&ensure_numeric("sum", e)?)?;
            }
        }
        Value::Set(s) => {
            for e in s.iter() {
                total = total.add(&ensure_numeric("sum", e)?)?;
            }
        }
        a => bail!("`sum` requires array/set argument. Got `{a}`."),
    }
    Ok(Value::from(total))
}
