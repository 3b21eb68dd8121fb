// Engine: one locality's compile-and-run front end
//
// Owns the pieces a program needs in one place: the default registry, a
// top-level environment that persists across snippets, and the evaluation
// context (executor, communicator, mode) built from EngineConfig.
//
//   let engine = Engine::new(EngineConfig::default())?;
//   engine.eval("define(x, 20)")?;
//   assert_eq!(engine.eval("x * 2 + 2")?, Value::Int(42));
//
// `eval` and `call` block the calling thread until the result is ready.
// Call them from top-level code, not from inside a pool worker.

use std::sync::Arc;

use tracing::info;

use crate::builtins::default_registry;
use crate::compiler::{CompiledFunction, Compiler};
use crate::config::EngineConfig;
use crate::distributed::Communicator;
use crate::environment::Environment;
use crate::error::{EvalError, Error, Result};
use crate::eval::{self, EvalContext, EvalMode};
use crate::executor::Executor;
use crate::future::Future;
use crate::pattern::PatternRegistry;
use crate::transform::TransformRule;
use crate::value::Value;

#[derive(Debug)]
pub struct Engine {
    config: EngineConfig,
    compiler: Compiler,
    environment: Arc<Environment>,
    context: EvalContext,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Result<Self> {
        let executor = match config.worker_threads {
            Some(threads) => Executor::with_threads(threads).map_err(|e| Error::Config(e.to_string()))?,
            None => Executor::Global,
        };
        let mode = if config.async_operands {
            EvalMode::ASYNC_OPERANDS
        } else {
            EvalMode::empty()
        };
        let registry = Arc::new(default_registry()?);
        info!(
            threads = executor.concurrency(),
            async_operands = config.async_operands,
            primitives = registry.len(),
            "engine ready"
        );
        Ok(Self {
            compiler: Compiler::new(registry).with_scheme(config.scheme.as_str()),
            environment: Environment::new(),
            context: EvalContext {
                executor,
                mode,
                ..EvalContext::default()
            },
            config,
        })
    }

    /// Run as one locality of a cluster.
    pub fn with_communicator(mut self, communicator: Arc<dyn Communicator>) -> Self {
        self.context = self.context.with_communicator(communicator);
        self
    }

    /// Rewrite every snippet with `rules` before compiling it.
    pub fn with_rules(mut self, rules: Vec<TransformRule>) -> Self {
        self.compiler = self.compiler.with_rules(rules);
        self
    }

    /// Replace the default registry.
    pub fn with_registry(mut self, registry: PatternRegistry) -> Self {
        self.compiler = Compiler::new(Arc::new(registry)).with_scheme(self.config.scheme.as_str());
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn environment(&self) -> &Arc<Environment> {
        &self.environment
    }

    pub fn registry(&self) -> &Arc<PatternRegistry> {
        self.compiler.registry()
    }

    pub fn context(&self) -> &EvalContext {
        &self.context
    }

    /// Bind a global name to a value.
    pub fn define(&self, name: &str, value: Value) {
        self.environment.define_value(name, value);
    }

    pub fn compile(&self, name: &str, text: &str) -> Result<CompiledFunction> {
        self.compiler.compile(name, text, &self.environment)
    }

    /// Evaluate a compiled snippet without waiting for it.
    pub fn run(&self, compiled: &CompiledFunction, args: Vec<Value>) -> Future<Value> {
        compiled.run_with(&self.context, args)
    }

    /// Compile and evaluate `text`, waiting for the result.
    pub fn eval(&self, text: &str) -> Result<Value> {
        let compiled = self.compile("snippet", text)?;
        Ok(self.run(&compiled, Vec::new()).get()?)
    }

    /// Apply the global function `name` to `args`, waiting for the result.
    pub fn call(&self, name: &str, args: Vec<Value>) -> Result<Value> {
        let function = match self.environment.value_of(name) {
            Some(Value::Function(function)) => function,
            Some(other) => {
                return Err(EvalError::type_mismatch(format!(
                    "'{name}' is {}, not a function",
                    other.type_name()
                ))
                .into())
            }
            None => return Err(crate::error::CompileError::unbound(name, None).into()),
        };
        Ok(eval::invoke(&function, args, &self.context).get()?)
    }
}
