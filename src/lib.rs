//! # physl
//!
//! Parser, execution-tree compiler and asynchronous evaluator for PhySL,
//! a small expression language for (optionally distributed) array math.
//
//   source text ──► Lexer ──► Parser ──► AST ──► transform ──► fold
//               ──► Compiler (pattern registry + environment) ──► Primitive tree
//               ──► eval (futures on a rayon executor) ──► Value
//
// The AST is a faithful, unresolved representation of the snippet. The
// primitive tree is resolved: every name is bound to a slot, every call to a
// registered primitive or a user function.
//
// USAGE:
//   let engine = physl::Engine::new(physl::EngineConfig::default())?;
//   engine.eval("define(f, x, x + 1)")?;
//   assert_eq!(engine.eval("f(41)")?, physl::Value::Int(42));
//
//   // Lower level: compile against an explicit registry and environment.
//   let registry = Arc::new(physl::builtins::default_registry()?);
//   let env = physl::Environment::new();
//   let f = physl::compile("f", "define(f, x, x * 2)", &registry, &env)?;
//   let doubled = f.run(vec![physl::Value::Int(21)]).get()?;

pub mod annotation;
pub mod ast;
pub mod builtins;
pub mod compiler;
pub mod config;
pub mod distributed;
pub mod engine;
pub mod environment;
pub mod error;
pub mod eval;
pub mod executor;
pub mod fold;
pub mod future;
pub mod kernels;
pub mod lexer;
pub mod names;
pub mod parser;
pub mod pattern;
pub mod primitive;
pub mod tiling;
pub mod token;
pub mod transform;
pub mod value;

pub use annotation::Annotation;
pub use ast::Ast;
pub use compiler::{compile, CompiledFunction, Compiler};
pub use config::EngineConfig;
pub use distributed::{Communicator, LocalCluster};
pub use engine::Engine;
pub use environment::Environment;
pub use error::{Error, Result};
pub use eval::{EvalContext, EvalMode};
pub use executor::Executor;
pub use future::Future;
pub use parser::parse;
pub use pattern::PatternRegistry;
pub use transform::{transform, TransformRule};
pub use value::Value;
