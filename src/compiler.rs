// Compiler: AST → execution tree
//
// Pipeline for one snippet:
//
//   text ── parse_with_positions ──▶ [Ast] + PositionTable
//        ── transform (rewrite rules, on the unfolded syntax) ──▶ [Ast]
//        ── fold_operators ──▶ [Ast] with operators as __op calls
//        ── compile ──▶ Node (an implicit block if several expressions)
//
// Calls are resolved in this order: the special forms `define` and
// `lambda`, then the pattern registry, then user-defined functions visible
// in the environment. Compilation of a snippet is all-or-nothing; on error
// the environment is restored to its state before the snippet.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::{debug, trace};

use crate::ast::{Ast, PositionTable};
use crate::environment::{Address, Binding, Environment};
use crate::error::{CompileError, Result};
use crate::eval::{self, EvalContext};
use crate::fold::fold_operators;
use crate::future::Future;
use crate::names::NameGenerator;
use crate::parser::parse_with_positions;
use crate::pattern::{FactoryInput, PatternRegistry};
use crate::primitive::{FunctionBody, FunctionRef, Node, Primitive, PrimitiveKind, SlotRef, VariableSlot};
use crate::token::Span;
use crate::transform::{transform, TransformRule};
use crate::value::Value;

static NEXT_COMPILE_ID: AtomicUsize = AtomicUsize::new(0);

pub const DEFAULT_SCHEME: &str = "physl";

/// Compiles snippets against a pattern registry.
#[derive(Debug, Clone)]
pub struct Compiler {
    registry: Arc<PatternRegistry>,
    rules: Vec<TransformRule>,
    scheme: String,
}

impl Compiler {
    pub fn new(registry: Arc<PatternRegistry>) -> Self {
        Self {
            registry,
            rules: Vec::new(),
            scheme: DEFAULT_SCHEME.to_string(),
        }
    }

    /// Rewrite every snippet with `rules` before compiling it.
    pub fn with_rules(mut self, rules: Vec<TransformRule>) -> Self {
        self.rules = rules;
        self
    }

    /// First segment of generated primitive names.
    pub fn with_scheme(mut self, scheme: impl Into<String>) -> Self {
        self.scheme = scheme.into();
        self
    }

    pub fn registry(&self) -> &Arc<PatternRegistry> {
        &self.registry
    }

    pub fn compile(&self, name: &str, text: &str, env: &Arc<Environment>) -> Result<CompiledFunction> {
        let (exprs, positions) = parse_with_positions(text)?;
        let exprs: Vec<Ast> = exprs
            .iter()
            .map(|e| fold_operators(&transform(e, &self.rules)))
            .collect();

        let compile_id = NEXT_COMPILE_ID.fetch_add(1, Ordering::Relaxed);
        let checkpoint = env.checkpoint();
        let mut unit = Unit {
            registry: &self.registry,
            names: NameGenerator::new(self.scheme.as_str(), compile_id),
            positions: &positions,
        };
        let root = match unit.compile_snippet(&exprs, env) {
            Ok(root) => root,
            Err(e) => {
                env.restore(checkpoint);
                debug!(name, compile_id, error = %e, "compilation failed");
                return Err(e.into());
            }
        };

        let compiled = CompiledFunction {
            name: name.to_string(),
            root,
            positions,
        };
        debug!(
            name,
            compile_id,
            nodes = compiled.primitive_names().len(),
            "compiled snippet"
        );
        Ok(compiled)
    }
}

/// Compile `text` with the default pipeline (no rewrite rules).
pub fn compile(name: &str, text: &str, registry: &Arc<PatternRegistry>, env: &Arc<Environment>) -> Result<CompiledFunction> {
    Compiler::new(Arc::clone(registry)).compile(name, text, env)
}

/// State of one compilation unit.
struct Unit<'a> {
    registry: &'a PatternRegistry,
    names: NameGenerator,
    positions: &'a PositionTable,
}

type CompileResult<T> = std::result::Result<T, CompileError>;

impl Unit<'_> {
    fn node(&mut self, kind: PrimitiveKind, instance: Option<&str>, span: Option<Span>, operands: Vec<Node>) -> Node {
        let name = self.names.next(kind.tag(), instance, span);
        trace!(%name, "emit primitive");
        Primitive::new(name, span, kind, operands)
    }

    fn compile_snippet(&mut self, exprs: &[Ast], env: &Arc<Environment>) -> CompileResult<Node> {
        match exprs {
            [single] => self.compile_expr(single, env),
            _ => {
                let statements = exprs
                    .iter()
                    .map(|e| self.compile_expr(e, env))
                    .collect::<CompileResult<Vec<_>>>()?;
                Ok(self.node(PrimitiveKind::Block, None, None, statements))
            }
        }
    }

    fn compile_expr(&mut self, ast: &Ast, env: &Arc<Environment>) -> CompileResult<Node> {
        let span = self.positions.lookup(ast.first_position());
        let constant = |v: Value| PrimitiveKind::Constant(v);
        match ast {
            Ast::Nil => Ok(self.node(constant(Value::Nil), None, span, vec![])),
            Ast::Bool(b) => Ok(self.node(constant(Value::Bool(*b)), None, span, vec![])),
            Ast::Int(n) => Ok(self.node(constant(Value::Int(*n)), None, span, vec![])),
            Ast::Float(x) => Ok(self.node(constant(Value::Float(*x)), None, span, vec![])),
            Ast::Str(s) => Ok(self.node(constant(Value::Str(s.clone())), None, span, vec![])),
            Ast::Array(items) => self.compile_array(items, span, env),
            Ast::List(items) => {
                let items = self.compile_all(items, env)?;
                match constants(&items) {
                    Some(values) => Ok(self.node(constant(Value::List(values)), None, span, vec![])),
                    None => Ok(self.node(PrimitiveKind::ListLiteral, None, span, items)),
                }
            }
            Ast::Identifier(id) => {
                let (binding, depth) = env
                    .lookup(&id.name)
                    .ok_or_else(|| CompileError::unbound(id.name.as_str(), span))?;
                let slot = binding.address().at_depth(depth);
                Ok(self.node(PrimitiveKind::Variable(slot), Some(&id.name), span, vec![]))
            }
            Ast::Placeholder(p) => Err(CompileError::invalid_operand(
                p.to_string(),
                "placeholders only appear in patterns",
                span,
            )),
            Ast::Unary { .. } | Ast::Expression { .. } => self.compile_expr(&fold_operators(ast), env),
            Ast::Call { name, args } => match name.name.as_str() {
                "define" => self.compile_define(args, span, env),
                "lambda" => self.compile_lambda(args, span, env),
                "__minus" => match args.as_slice() {
                    [Ast::Int(n)] if *n != i64::MIN => Ok(self.node(constant(Value::Int(-n)), None, span, vec![])),
                    [Ast::Float(x)] => Ok(self.node(constant(Value::Float(-x)), None, span, vec![])),
                    _ => self.compile_call(ast, &name.name, args, span, env),
                },
                _ => self.compile_call(ast, &name.name, args, span, env),
            },
        }
    }

    fn compile_all(&mut self, asts: &[Ast], env: &Arc<Environment>) -> CompileResult<Vec<Node>> {
        asts.iter().map(|a| self.compile_expr(a, env)).collect()
    }

    /// Numeric literals fold into a constant array; anything else is
    /// stacked at run time.
    fn compile_array(&mut self, items: &[Ast], span: Option<Span>, env: &Arc<Environment>) -> CompileResult<Node> {
        let items = self.compile_all(items, env)?;
        if let Some(values) = constants(&items) {
            let array = Value::stack(&values).map_err(|e| CompileError::invalid_operand("array", e.kind.to_string(), span))?;
            if array.rank().unwrap_or(0) > crate::value::MAX_RANK {
                return Err(CompileError::invalid_operand("array", "array literal nests too deeply", span));
            }
            return Ok(self.node(PrimitiveKind::Constant(array), None, span, vec![]));
        }
        Ok(self.node(PrimitiveKind::ArrayLiteral, None, span, items))
    }

    /// `define(name, body)` or `define(name, params..., body)`.
    fn compile_define(&mut self, args: &[Ast], span: Option<Span>, env: &Arc<Environment>) -> CompileResult<Node> {
        let [target, params @ .., body] = args else {
            return Err(CompileError::arity("define", "at least 2", args.len(), span));
        };
        let Ast::Identifier(target) = target else {
            return Err(CompileError::invalid_operand(
                "define",
                format!("expected a name to define, got {}", target.kind_name()),
                span,
            ));
        };
        let name = target.name.as_str();
        let params = param_names("define", params, span)?;

        if params.is_empty() {
            // The body sees the enclosing binding of `name`, not this one.
            let init = self.compile_expr(body, env)?;
            let address = if env.is_top_level() {
                Address::Global(VariableSlot::lazy(name, Arc::clone(&init)))
            } else {
                Address::Local(env.allocate_local(name, Arc::clone(&init)))
            };
            let slot = address.at_depth(0);
            env.bind(name, Binding::Variable(address));
            return Ok(self.node(PrimitiveKind::Define(slot), Some(name), span, vec![init]));
        }

        // Functions are bound before their body compiles, so the body can
        // call itself.
        let function = FunctionBody::new(name, params);
        let value_node = self.node(PrimitiveKind::Function(Arc::clone(&function)), Some(name), span, vec![]);
        let address = if env.is_top_level() {
            let closure = Value::Function(FunctionRef {
                body: Arc::clone(&function),
                captured: None,
            });
            Address::Global(VariableSlot::ready(name, closure))
        } else {
            Address::Local(env.allocate_local(name, Arc::clone(&value_node)))
        };
        let slot = address.at_depth(0);
        env.bind(
            name,
            Binding::Function {
                address,
                body: Arc::clone(&function),
            },
        );
        self.compile_body(&function, body, env)?;
        Ok(self.node(PrimitiveKind::Define(slot), Some(name), span, vec![value_node]))
    }

    /// `lambda(params..., body)`: an anonymous function value.
    fn compile_lambda(&mut self, args: &[Ast], span: Option<Span>, env: &Arc<Environment>) -> CompileResult<Node> {
        let [params @ .., body] = args else {
            return Err(CompileError::arity("lambda", "at least 1", 0, span));
        };
        let function = FunctionBody::new("lambda", param_names("lambda", params, span)?);
        self.compile_body(&function, body, env)?;
        Ok(self.node(PrimitiveKind::Function(function), Some("lambda"), span, vec![]))
    }

    fn compile_body(&mut self, function: &Arc<FunctionBody>, body: &Ast, env: &Arc<Environment>) -> CompileResult<()> {
        let scope = Environment::child(env, &function.params);
        let root = self.compile_expr(body, &scope)?;
        function.finish(root, scope.take_locals());
        Ok(())
    }

    fn compile_call(&mut self, ast: &Ast, name: &str, args: &[Ast], span: Option<Span>, env: &Arc<Environment>) -> CompileResult<Node> {
        if let Some(matched) = self.registry.match_call(ast, span)? {
            let operands = self.compile_all(&matched.args, env)?;
            let primitive = self.names.next(&matched.entry.type_name, None, span);
            trace!(name = %primitive, "emit primitive");
            let (kind, operands) = (matched.entry.factory)(FactoryInput {
                name: primitive.clone(),
                operands,
                span,
            })?;
            return Ok(Primitive::new(primitive, span, kind, operands));
        }

        let (binding, depth) = env.lookup(name).ok_or_else(|| CompileError::unbound(name, span))?;
        if let Binding::Function { body, .. } = &binding {
            if body.arity() != args.len() {
                return Err(CompileError::arity(name, body.arity().to_string(), args.len(), span));
            }
        }
        let callee = self.node(PrimitiveKind::Variable(binding.address().at_depth(depth)), Some(name), span, vec![]);
        let mut operands = vec![callee];
        operands.extend(self.compile_all(args, env)?);
        Ok(self.node(PrimitiveKind::Call, Some(name), span, operands))
    }
}

fn constants(nodes: &[Node]) -> Option<Vec<Value>> {
    nodes.iter().map(|n| n.as_constant().cloned()).collect()
}

fn param_names(form: &str, params: &[Ast], span: Option<Span>) -> CompileResult<Vec<String>> {
    params
        .iter()
        .map(|p| match p {
            Ast::Identifier(id) => Ok(id.name.clone()),
            other => Err(CompileError::invalid_operand(
                form,
                format!("parameters must be names, got {}", other.kind_name()),
                span,
            )),
        })
        .collect()
}

/// A compiled snippet, ready to evaluate any number of times.
#[derive(Debug)]
pub struct CompiledFunction {
    name: String,
    root: Node,
    positions: PositionTable,
}

impl CompiledFunction {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn root(&self) -> &Node {
        &self.root
    }

    /// Identifier positions recorded while parsing.
    pub fn positions(&self) -> &PositionTable {
        &self.positions
    }

    /// Evaluate on the global pool with a single locality. With `args`, the
    /// snippet must evaluate to a function, which is then applied to them.
    pub fn run(&self, args: Vec<Value>) -> Future<Value> {
        self.run_with(&EvalContext::default(), args)
    }

    pub fn run_with(&self, ctx: &EvalContext, args: Vec<Value>) -> Future<Value> {
        let result = eval::eval(&self.root, &None, ctx);
        if args.is_empty() {
            return result;
        }
        let ctx = ctx.clone();
        let name = self.root.qualified_name();
        result.then(move |value| match value {
            Value::Function(function) => eval::invoke(&function, args, &ctx),
            other => Future::failed(
                crate::error::EvalError::type_mismatch(format!(
                    "snippet evaluates to {}, which cannot be called",
                    other.type_name()
                ))
                .at(&name, None),
            ),
        })
    }

    /// Fully-qualified names of every node, function bodies included, in
    /// pre-order.
    pub fn primitive_names(&self) -> Vec<String> {
        let mut names = Vec::new();
        let mut seen = HashSet::new();
        let mut pending = vec![Arc::clone(&self.root)];
        while let Some(node) = pending.pop() {
            let mut bodies = Vec::new();
            node.walk(&mut |p| {
                names.push(p.qualified_name());
                if let PrimitiveKind::Function(body) = &p.kind {
                    if seen.insert(Arc::as_ptr(body)) {
                        bodies.push(Arc::clone(body));
                    }
                }
            });
            for body in bodies {
                pending.extend(body.body().cloned());
                pending.extend(body.locals().iter().map(|l| Arc::clone(&l.init)));
            }
        }
        names.sort();
        names.dedup();
        names
    }

    /// Names this snippet defines at top level, in source order.
    pub fn defines(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.root.walk(&mut |p| {
            if let PrimitiveKind::Define(SlotRef::Global(slot)) = &p.kind {
                out.push(slot.name().to_string());
            }
        });
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtins::default_registry;
    use crate::error::{CompileErrorKind, Error};

    fn setup() -> (Arc<PatternRegistry>, Arc<Environment>) {
        (Arc::new(default_registry().unwrap()), Environment::new())
    }

    fn compile_err(text: &str) -> CompileErrorKind {
        let (registry, env) = setup();
        match compile("t", text, &registry, &env).unwrap_err() {
            Error::Compile(e) => e.kind,
            other => panic!("expected compile error, got {other:?}"),
        }
    }

    #[test]
    fn names_follow_the_qualified_format() {
        let (registry, env) = setup();
        let f = compile("t", "define(x, 1)\nx + 2", &registry, &env).unwrap();
        let names = f.primitive_names();
        assert!(names.iter().any(|n| n.starts_with("/physl/__add$0/") && n.ends_with("$2$1")));
        assert!(names.iter().any(|n| n.starts_with("/physl/variable$0$x/")));
        assert!(names.iter().any(|n| n.starts_with("/physl/define-variable$0$x/")));
        assert_eq!(f.defines(), vec!["x".to_string()]);
    }

    #[test]
    fn literals_fold_to_constants() {
        let (registry, env) = setup();
        let f = compile("t", "[[1, 2], [3, -4]]", &registry, &env).unwrap();
        assert_eq!(
            f.root().as_constant(),
            Some(&Value::matrix(2, 2, vec![1i64, 2, 3, -4]).unwrap())
        );
        let f = compile("t", "(1, \"a\")", &registry, &env).unwrap();
        assert!(f.root().as_constant().is_some());
    }

    #[test]
    fn unbound_names_and_arity_errors() {
        assert_eq!(compile_err("y + 1"), CompileErrorKind::UnboundName("y".into()));
        assert!(matches!(compile_err("if(1)"), CompileErrorKind::ArityMismatch { .. }));
        assert!(matches!(
            compile_err("define(f, a, a)\nf(1, 2)"),
            CompileErrorKind::ArityMismatch { got: 2, .. }
        ));
        assert!(matches!(compile_err("store(1, 2)"), CompileErrorKind::InvalidOperand { .. }));
        assert!(matches!(compile_err("define(1, 2)"), CompileErrorKind::InvalidOperand { .. }));
        assert!(matches!(compile_err("[1, \"a\"]"), CompileErrorKind::InvalidOperand { .. }));
    }

    #[test]
    fn failed_compilation_leaves_environment_alone() {
        let (registry, env) = setup();
        compile("ok", "define(x, 1)", &registry, &env).unwrap();
        assert!(compile("bad", "define(y, 2)\nz", &registry, &env).is_err());
        assert_eq!(env.names(), vec!["x".to_string()]);
    }

    #[test]
    fn recursion_resolves_while_compiling() {
        let (registry, env) = setup();
        let text = "define(fact, n, if(n <= 1, 1, n * fact(n - 1)))";
        let f = compile("fact", text, &registry, &env).unwrap();
        assert_eq!(f.run(vec![Value::Int(5)]).get(), Ok(Value::Int(120)));
    }

    #[test]
    fn rules_rewrite_before_compilation() {
        let (registry, env) = setup();
        let rule = TransformRule::new("_1 - _2", "_2 - _1").unwrap();
        let compiler = Compiler::new(registry).with_rules(vec![rule]);
        let f = compiler.compile("t", "10 - 4", &env).unwrap();
        assert_eq!(f.run(vec![]).get(), Ok(Value::Int(-6)));
    }
}
