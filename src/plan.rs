// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use crate::value::Value;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Plan-scoped register index. Locals 0 and 1 are reserved for the input
/// and data documents of every function.
pub type Local = u32;

pub const INPUT_LOCAL: Local = 0;
pub const DATA_LOCAL: Local = 1;

/// A value a statement operates on: a local slot, an index into the
/// plan's static pool, or an inline boolean.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operand {
    Local(Local),
    Const(u32),
    Bool(bool),
}

/// A single register-machine operation. Execution of a statement that is
/// undefined (for example a `dot` on a missing key) aborts the enclosing
/// block; execution then continues after that block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stmt {
    /// target := source
    AssignVar { source: Operand, target: Local },

    /// Like `AssignVar`, but aborts with a conflict error when the target
    /// already holds a different value. Used for complete rule results
    /// and merge-style object construction.
    AssignVarOnce { source: Operand, target: Local },

    AssignInt { value: i64, target: Local },

    /// target := source[key]; undefined when the key is missing or the
    /// source is a scalar.
    Dot {
        source: Operand,
        key: Operand,
        target: Local,
    },

    Len { source: Operand, target: Local },

    /// Iterate a materialized collection, executing `block` once per
    /// element with `key`/`value` bound. Undefined when the source is
    /// not a collection.
    Scan {
        source: Local,
        key: Local,
        value: Local,
        block: Block,
    },

    /// Execute `block`; succeed iff it aborts (negation as failure).
    Not { block: Block },

    /// Undefined unless a == b.
    Equal { a: Operand, b: Operand },

    /// Undefined unless a != b.
    NotEqual { a: Operand, b: Operand },

    /// Invoke a planned function or a built-in by name. An undefined
    /// result aborts the block.
    Call {
        func: String,
        args: Vec<Operand>,
        result: Local,
    },

    MakeNull { target: Local },
    MakeArray { capacity: u32, target: Local },
    MakeObject { target: Local },
    MakeSet { target: Local },

    ArrayAppend { array: Local, value: Operand },
    SetAdd { set: Local, value: Operand },
    ObjectInsert {
        object: Local,
        key: Operand,
        value: Operand,
    },
    /// Object insertion that aborts with a conflict error when the key is
    /// present with a different value (partial object rule semantics).
    ObjectInsertOnce {
        object: Local,
        key: Operand,
        value: Operand,
    },

    /// Undefined unless the local holds a value.
    IsDefined { source: Local },
    /// Undefined unless the local holds no value.
    IsUndefined { source: Local },

    ResetLocal { target: Local },

    /// Abort the current block and `index` enclosing blocks above it.
    /// Index 0 is the current block. Out-of-range indices are a planner
    /// bug; plans are validated before hand-off.
    Break { index: u32 },

    /// A nested block: aborts inside it stop at this boundary.
    Block { block: Block },

    /// Return from the enclosing function with the local's value.
    ReturnLocal { source: Local },
}

/// An ordered statement sequence. Falls through after the last statement
/// unless aborted or returned from.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Block {
    pub stmts: Vec<Stmt>,
}

/// A named, callable unit. By convention the input and data documents are
/// the first two parameters of every function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Func {
    pub name: String,
    pub params: Vec<Local>,
    pub return_local: Local,
    pub blocks: Vec<Block>,
    pub num_locals: u32,
}

/// A query entrypoint exposed by the plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entrypoint {
    pub name: String,
    pub func: String,
}

/// The planner's hand-off artifact: a stable, serializable IR consumed by
/// a downstream bytecode compiler. One-way and versioned; nothing here
/// assumes anything about the target encoding.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Plan {
    pub version: u32,
    /// Constant pool indexed by `Operand::Const`.
    pub statics: Vec<Value>,
    pub funcs: IndexMap<String, Func>,
    pub entrypoints: Vec<Entrypoint>,
}

impl Plan {
    pub fn to_json(&self) -> anyhow::Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
