// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use crate::ast::*;
use crate::builtins::BuiltinRegistry;
use crate::compiled_policy::CompiledPolicy;
use crate::compiler::compile;
use crate::errors::{CompileErrors, EvalError};
use crate::interpreter::{EvalOptions, Evaluator, QueryResults};
use crate::storage::{InMemoryStore, Storage};
use crate::value::Value;

use anyhow::{anyhow, Result};

/// The policy engine front: collects modules and data, compiles once,
/// evaluates many times. Thin sugar over [`compile`] and [`Evaluator`]
/// for servers and CLIs that do not manage those pieces themselves.
#[derive(Clone)]
pub struct Engine {
    modules: Vec<Ref<Module>>,
    store: InMemoryStore,
    input: Value,
    registry: BuiltinRegistry,
    options: EvalOptions,
    compiled: Option<CompiledPolicy>,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine {
    pub fn new() -> Self {
        Self {
            modules: vec![],
            store: InMemoryStore::default(),
            input: Value::new_object(),
            registry: BuiltinRegistry::with_defaults(),
            options: EvalOptions::default(),
            compiled: None,
        }
    }

    pub fn add_module(&mut self, module: Ref<Module>) {
        self.modules.push(module);
        // If policies change, the artifact must be rebuilt.
        self.compiled = None;
    }

    pub fn set_input(&mut self, input: Value) {
        self.input = input;
    }

    pub fn add_data(&mut self, data: Value) -> Result<()> {
        let mut root = self.store.root().clone();
        root.merge(data)?;
        self.store = InMemoryStore::new(root);
        self.compiled = None;
        Ok(())
    }

    pub fn set_options(&mut self, options: EvalOptions) {
        self.options = options;
    }

    pub fn register_builtin(
        &mut self,
        name: &str,
        arity: u8,
        fcn: crate::builtins::BuiltinFcn,
        undefined_on_error: bool,
    ) {
        self.registry.register(name, arity, fcn, undefined_on_error);
    }

    /// Compile the added modules. The artifact is cached until modules or
    /// data change.
    pub fn compile(&mut self) -> Result<CompiledPolicy, CompileErrors> {
        if let Some(c) = &self.compiled {
            return Ok(c.clone());
        }
        let compiled = compile(&self.modules)?;
        self.compiled = Some(compiled.clone());
        Ok(compiled)
    }

    fn evaluator(&mut self) -> Result<Evaluator> {
        let policy = self.compile().map_err(|e| anyhow!("{e}"))?;
        Ok(Evaluator::new(&policy, &self.store as &dyn Storage, self.input.clone())
            .with_registry(self.registry.clone())
            .with_options(self.options.clone()))
    }

    /// Evaluate a virtual document path, e.g. `data.example.allow`.
    pub fn eval_rule(&mut self, path: &str) -> Result<Value> {
        let mut evaluator = self.evaluator()?;
        evaluator.eval_rule(path).map_err(into_anyhow)
    }

    /// Evaluate an ad-hoc query against the compiled policy.
    pub fn eval_query(&mut self, query: &Ref<Query>) -> Result<QueryResults> {
        let mut evaluator = self.evaluator()?;
        evaluator.eval_query(query).map_err(into_anyhow)
    }

    /// True when the rule at `path` evaluates to `true`. An undefined
    /// decision is `false` here; use [`Engine::eval_rule`] to tell them
    /// apart.
    pub fn allowed(&mut self, path: &str) -> Result<bool> {
        Ok(self.eval_rule(path)? == Value::Bool(true))
    }
}

fn into_anyhow(e: EvalError) -> anyhow::Error {
    anyhow!("{e}")
}
