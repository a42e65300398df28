// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use crate::ast::Span;

use core::fmt;
use thiserror::Error;

/// A single compile-time diagnostic.
#[derive(Debug, Clone, Error)]
pub enum CompileError {
    /// Cyclic rule dependency. Carries every rule on the cycle, in
    /// back-reference order starting from the reported rule.
    #[error("rule `{rule}` is recursive: {}", chain.join(" -> "))]
    Recursion { rule: String, chain: Vec<String> },

    /// A variable with no generator binding it before use. Reported per
    /// variable; failures may cascade to dependent variables.
    #[error("{span}: variable `{var}` is unsafe in rule `{rule}`")]
    UnsafeVar { span: Span, rule: String, var: String },

    #[error("{span}: could not resolve import `{path}`")]
    Import { span: Span, path: String },

    #[error("{span}: {msg}")]
    Type { span: Span, msg: String },
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.module.is_empty() {
            write!(f, "<unknown>")
        } else {
            write!(f, "{}:{}:{}", self.module, self.line, self.col)
        }
    }
}

/// All diagnostics from one compilation. Compilation never partially
/// succeeds: when this is returned, no policy artifact exists.
#[derive(Debug, Clone)]
pub struct CompileErrors(pub Vec<CompileError>);

impl std::error::Error for CompileErrors {}

impl fmt::Display for CompileErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, e) in self.0.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{e}")?;
        }
        Ok(())
    }
}

impl CompileErrors {
    pub fn iter(&self) -> core::slice::Iter<'_, CompileError> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Fatal evaluation errors. Unification mismatches, undefined built-in
/// results and failed negations are not errors; they only steer
/// backtracking.
#[derive(Debug, Clone, Error)]
pub enum EvalError {
    #[error("builtin `{name}`: {msg}")]
    Builtin { name: String, msg: String },

    #[error("evaluation cancelled")]
    Cancelled,

    /// An assign-once slot observed two different values, e.g. a partial
    /// object rule producing conflicting values for one key.
    #[error("conflict: {msg}")]
    Conflict { msg: String },

    #[error("internal error: {0}")]
    Internal(String),
}

/// A residual expression that cannot be expressed over the declared
/// unknowns, e.g. an unresolved function call with no field-predicate
/// equivalent.
#[derive(Debug, Clone, Error)]
#[error("unsupported residual expression: {expr}")]
pub struct UnsupportedResidual {
    pub expr: String,
}

/// Planner rejections.
#[derive(Debug, Clone, Error)]
pub enum PlanError {
    /// The entrypoint query was not fully ground; it must go through
    /// partial evaluation instead of planning.
    #[error("query is not fully ground: {0}")]
    NotGround(String),

    #[error("internal planner error: {0}")]
    Internal(String),
}
