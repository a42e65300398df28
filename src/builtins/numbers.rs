// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use crate::builtins::{self, ensure_args_count, ensure_numeric};
use crate::number::Number;
use crate::value::Value;

use core::str::FromStr;
use std::collections::HashMap;

use anyhow::{bail, Result};

pub fn register(m: &mut HashMap<&'static str, (builtins::BuiltinFcn, u8)>) {
    m.insert("abs", (abs, 1));
    m.insert("to_number", (to_number, 1));
}

fn abs(args: &[Value]) -> Result<Value> {
    ensure_args_count("abs", args, 1)?;
    Ok(Value::from(ensure_numeric("abs", &args[0])?.abs()))
}

fn to_number(args: &[Value]) -> Result<Value> {
    ensure_args_count("to_number", args, 1)?;

    Ok(match &args[0] {
        Value::Null => Value::from(0i64),
        Value::Bool(true) => Value::from(1i64),
        Value::Bool(false) => Value::from(0i64),
        Value::Number(n) => Value::from(n.clone()),
        Value::String(s) => Value::from(Number::from_str(s)?),
        a => bail!("`to_number` cannot convert `{a}`"),
    })
}
