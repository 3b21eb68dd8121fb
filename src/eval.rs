// Eval: asynchronous evaluation of the execution tree
//
// eval(node) returns a Future<Value>. A node whose operands are already
// resolved computes inline and returns a ready future; a node waiting on a
// pending operand registers a continuation and returns immediately. Nothing
// here blocks a thread.
//
// Control flow:
//
//   block           statements in order; a pending statement suspends the
//                   rest, which resume from the continuation
//   parallel_block  every statement submitted to the executor; resolves to
//                   the last statement's value, or to the first failure
//   while           a loop, not recursion: ready iterations run in place,
//                   a pending condition or body re-enters from its
//                   continuation
//   if / __and / __or
//                   only the selected operand is evaluated
//
// Errors are tagged with the fully-qualified name and span of the node
// they pass through first.

use std::fmt;
use std::ops::BitOr;
use std::sync::Arc;

use tracing::{debug, trace};

use crate::distributed::{self, Communicator, Locality};
use crate::error::{EvalError, EvalErrorKind};
use crate::executor::Executor;
use crate::future::{channel, when_all, Future, Outcome, Promise};
use crate::kernels::Site;
use crate::primitive::{FrameRef, FunctionRef, Node, PrimitiveKind, SlotRead, SlotRef, VariableSlot};
use crate::value::Value;

/// Evaluation flags.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct EvalMode(u8);

impl EvalMode {
    /// Spawn each operand of a multi-operand node onto the executor instead
    /// of evaluating them in turn on the current thread.
    pub const ASYNC_OPERANDS: EvalMode = EvalMode(1);

    pub const fn empty() -> Self {
        EvalMode(0)
    }

    pub fn contains(self, other: EvalMode) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for EvalMode {
    type Output = EvalMode;

    fn bitor(self, rhs: EvalMode) -> EvalMode {
        EvalMode(self.0 | rhs.0)
    }
}

impl fmt::Debug for EvalMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.contains(EvalMode::ASYNC_OPERANDS) {
            f.write_str("EvalMode(ASYNC_OPERANDS)")
        } else {
            f.write_str("EvalMode()")
        }
    }
}

/// Ambient state threaded through one evaluation.
#[derive(Debug, Clone)]
pub struct EvalContext {
    pub executor: Executor,
    pub communicator: Arc<dyn Communicator>,
    pub mode: EvalMode,
}

impl Default for EvalContext {
    fn default() -> Self {
        Self {
            executor: Executor::default(),
            communicator: Arc::new(Locality::single()),
            mode: EvalMode::default(),
        }
    }
}

impl EvalContext {
    pub fn new(executor: Executor, communicator: Arc<dyn Communicator>, mode: EvalMode) -> Self {
        Self {
            executor,
            communicator,
            mode,
        }
    }

    /// Everything on the calling thread, one locality.
    pub fn inline() -> Self {
        Self {
            executor: Executor::Inline,
            ..Self::default()
        }
    }

    pub fn with_mode(mut self, mode: EvalMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_communicator(mut self, communicator: Arc<dyn Communicator>) -> Self {
        self.communicator = communicator;
        self
    }
}

/// Evaluate `node` in `frame`.
pub fn eval(node: &Node, frame: &FrameRef, ctx: &EvalContext) -> Future<Value> {
    let result = match &node.kind {
        PrimitiveKind::Constant(value) => return Future::ready(value.clone()),
        PrimitiveKind::ArrayLiteral => eval_operands(&node.operands, frame, ctx).map(|items| Value::stack(&items)),
        PrimitiveKind::ListLiteral => eval_operands(&node.operands, frame, ctx).map(|items| Ok(Value::List(items))),
        PrimitiveKind::Variable(slot) => read_variable(slot, frame, ctx),
        PrimitiveKind::Define(slot) => {
            let slot = resolve(slot, frame);
            with_operand(node, 0, frame, ctx).map(move |value| {
                let (slot, _) = slot?;
                slot.store(value.clone());
                Ok(value)
            })
        }
        PrimitiveKind::Store(slot) => {
            let slot = resolve(slot, frame);
            with_operand(node, 0, frame, ctx).map(move |value| {
                let (slot, _) = slot?;
                slot.store(value);
                Ok(Value::Nil)
            })
        }
        PrimitiveKind::Function(body) => {
            return Future::ready(Value::Function(FunctionRef {
                body: Arc::clone(body),
                captured: frame.clone(),
            }))
        }
        PrimitiveKind::Call => {
            let ctx2 = ctx.clone();
            eval_operands(&node.operands, frame, ctx).then(move |mut values| {
                if values.is_empty() {
                    return Future::failed(EvalError::type_mismatch("call without a callee"));
                }
                let callee = values.remove(0);
                match callee {
                    Value::Function(function) => invoke(&function, values, &ctx2),
                    other => Future::failed(EvalError::type_mismatch(format!(
                        "{} is not a function",
                        other.type_name()
                    ))),
                }
            })
        }
        PrimitiveKind::Block => eval_block(Arc::clone(node), 0, frame.clone(), ctx.clone()),
        PrimitiveKind::ParallelBlock => eval_parallel(node, frame, ctx),
        PrimitiveKind::If => eval_if(node, frame, ctx),
        PrimitiveKind::While => eval_while(Arc::clone(node), frame.clone(), ctx.clone()),
        PrimitiveKind::And => eval_logical(node, frame, ctx, false),
        PrimitiveKind::Or => eval_logical(node, frame, ctx, true),
        PrimitiveKind::Synchronize(mutex) => {
            let (operand, frame, ctx) = (Arc::clone(&node.operands[0]), frame.clone(), ctx.clone());
            mutex.run(move || eval(&operand, &frame, &ctx))
        }
        PrimitiveKind::WhenAll => {
            let joined = node
                .operands
                .iter()
                .map(|op| {
                    let (op, frame, ctx2) = (Arc::clone(op), frame.clone(), ctx.clone());
                    ctx.executor.submit(move || eval(&op, &frame, &ctx2))
                })
                .collect();
            when_all(joined).map(|values| Ok(Value::List(values)))
        }
        PrimitiveKind::Kernel(kernel) => {
            let (kernel, diagnostic) = (Arc::clone(kernel), node.qualified_name());
            eval_operands(&node.operands, frame, ctx).map(move |args| {
                let site = Site {
                    name: kernel.name(),
                    diagnostic: &diagnostic,
                };
                kernel.eval(&args, &site)
            })
        }
        PrimitiveKind::Distributed(op) => {
            let (op, owner, comm) = (*op, Arc::clone(node), Arc::clone(&ctx.communicator));
            eval_operands(&node.operands, frame, ctx).then(move |args| distributed::evaluate(op, args, &comm, &owner))
        }
    };
    locate(result, node)
}

/// Apply a function value to evaluated arguments.
pub fn invoke(function: &FunctionRef, args: Vec<Value>, ctx: &EvalContext) -> Future<Value> {
    if args.len() != function.arity() {
        return Future::failed(EvalError::new(EvalErrorKind::ArityMismatch {
            expected: function.arity(),
            got: args.len(),
        }));
    }
    let Some(body) = function.body.body() else {
        return Future::failed(EvalError::invalid_argument(format!(
            "function '{}' has no body",
            function.name()
        )));
    };
    debug!(function = function.name(), arity = function.arity(), "invoke function");
    let frame = Some(function.body.new_frame(args, function.captured.clone()));
    eval(body, &frame, ctx)
}

/// Tag a failure with the node it passed through, unless an inner node
/// already claimed it.
fn locate(result: Future<Value>, node: &Node) -> Future<Value> {
    if let Some(Ok(_)) = result.try_get() {
        return result;
    }
    let (name, span) = (node.qualified_name(), node.span);
    result.map_err(move |e| e.at(&name, span))
}

fn with_operand(node: &Node, index: usize, frame: &FrameRef, ctx: &EvalContext) -> Future<Value> {
    match node.operands.get(index) {
        Some(op) => eval(op, frame, ctx),
        None => Future::failed(EvalError::invalid_argument(format!(
            "{} is missing operand {index}",
            node.kind.tag()
        ))),
    }
}

fn eval_operands(operands: &[Node], frame: &FrameRef, ctx: &EvalContext) -> Future<Vec<Value>> {
    let spread = ctx.mode.contains(EvalMode::ASYNC_OPERANDS) && operands.len() > 1;
    let futures = operands
        .iter()
        .map(|op| {
            if spread {
                let (op, frame, ctx2) = (Arc::clone(op), frame.clone(), ctx.clone());
                ctx.executor.submit(move || eval(&op, &frame, &ctx2))
            } else {
                eval(op, frame, ctx)
            }
        })
        .collect();
    when_all(futures)
}

fn resolve(slot: &SlotRef, frame: &FrameRef) -> Outcome<(Arc<VariableSlot>, FrameRef)> {
    slot.resolve(frame)
        .ok_or_else(|| EvalError::invalid_argument(format!("no frame holds {slot:?}")))
}

/// Read a variable, evaluating its definition on first use. The slot lock
/// is not held while the definition runs, so a definition that reads the
/// variable again does not deadlock.
fn read_variable(slot: &SlotRef, frame: &FrameRef, ctx: &EvalContext) -> Future<Value> {
    let (slot, owner) = match resolve(slot, frame) {
        Ok(found) => found,
        Err(e) => return Future::failed(e),
    };
    match slot.read() {
        SlotRead::Ready(value) => Future::ready(value),
        SlotRead::Unbound => Future::failed(EvalError::invalid_argument(format!(
            "variable '{}' has no value",
            slot.name()
        ))),
        SlotRead::Evaluate(init) => eval(&init, &owner, ctx).map(move |value| Ok(slot.complete(value))),
    }
}

fn eval_block(node: Node, start: usize, frame: FrameRef, ctx: EvalContext) -> Future<Value> {
    let count = node.operands.len();
    if count == 0 {
        return Future::ready(Value::Nil);
    }
    let mut i = start;
    loop {
        let result = eval(&node.operands[i], &frame, &ctx);
        if i + 1 == count {
            return result;
        }
        match result.try_get() {
            Some(Ok(_)) => i += 1,
            Some(Err(e)) => return Future::failed(e),
            None => return result.then(move |_| eval_block(node, i + 1, frame, ctx)),
        }
    }
}

/// No join: the result is the last statement's future. A failure of any
/// statement that lands first fails the block.
fn eval_parallel(node: &Node, frame: &FrameRef, ctx: &EvalContext) -> Future<Value> {
    let Some((last, rest)) = node.operands.split_last() else {
        return Future::ready(Value::Nil);
    };
    let (promise, result) = channel();
    for op in rest {
        let (op, frame, ctx2) = (Arc::clone(op), frame.clone(), ctx.clone());
        let promise = promise.clone();
        ctx.executor
            .submit(move || eval(&op, &frame, &ctx2))
            .on_ready(move |outcome| {
                if let Err(e) = outcome {
                    promise.set_error(e);
                }
            });
    }
    let (last, frame, ctx2) = (Arc::clone(last), frame.clone(), ctx.clone());
    ctx.executor.submit(move || eval(&last, &frame, &ctx2)).forward(promise);
    result
}

fn eval_if(node: &Node, frame: &FrameRef, ctx: &EvalContext) -> Future<Value> {
    let (owner, frame2, ctx2) = (Arc::clone(node), frame.clone(), ctx.clone());
    with_operand(node, 0, frame, ctx).then(move |cond| {
        let taken = match cond.truthy() {
            Ok(true) => 1,
            Ok(false) => 2,
            Err(e) => return Future::failed(e),
        };
        trace!(node = %owner.name, branch = taken, "if");
        match owner.operands.get(taken) {
            Some(branch) => eval(branch, &frame2, &ctx2),
            None => Future::ready(Value::Nil),
        }
    })
}

/// `__and` (`short_on` false) and `__or` (`short_on` true).
fn eval_logical(node: &Node, frame: &FrameRef, ctx: &EvalContext, short_on: bool) -> Future<Value> {
    let (owner, frame2, ctx2) = (Arc::clone(node), frame.clone(), ctx.clone());
    with_operand(node, 0, frame, ctx).then(move |left| match left.truthy() {
        Err(e) => Future::failed(e),
        Ok(l) if l == short_on => Future::ready(Value::Bool(l)),
        Ok(_) => with_operand(&owner, 1, &frame2, &ctx2).map(|right| Ok(Value::Bool(right.truthy()?))),
    })
}

#[derive(Clone, Copy)]
enum Step {
    Condition,
    Body,
}

/// A running `while`: the node, where it runs, and the one promise its
/// result goes to.
struct WhileLoop {
    node: Node,
    frame: FrameRef,
    ctx: EvalContext,
    done: Promise<Value>,
}

fn eval_while(node: Node, frame: FrameRef, ctx: EvalContext) -> Future<Value> {
    let (done, result) = channel();
    drive_while(Arc::new(WhileLoop { node, frame, ctx, done }), Step::Condition, None);
    result
}

/// Run steps until the loop settles or an operand is pending. A pending
/// operand resumes the loop from its continuation, and that continuation
/// returns as soon as the next operand suspends, so stack depth stays flat
/// however many iterations suspend.
fn drive_while(state: Arc<WhileLoop>, mut step: Step, mut resumed: Option<Outcome<Value>>) {
    loop {
        let outcome = match resumed.take() {
            Some(outcome) => outcome,
            None => {
                let index = match step {
                    Step::Condition => 0,
                    Step::Body => 1,
                };
                let operand = with_operand(&state.node, index, &state.frame, &state.ctx);
                let next = Arc::clone(&state);
                match operand.defer(move |outcome| drive_while(next, step, Some(outcome))) {
                    Some(outcome) => outcome,
                    None => return,
                }
            }
        };
        let value = match outcome {
            Ok(value) => value,
            Err(e) => {
                state.done.set_error(e);
                return;
            }
        };
        step = match step {
            Step::Body => Step::Condition,
            Step::Condition => match value.truthy() {
                Ok(true) => Step::Body,
                Ok(false) => {
                    trace!(node = %state.node.name, "while done");
                    state.done.set_value(Value::Nil);
                    return;
                }
                Err(e) => {
                    state.done.set_error(e);
                    return;
                }
            },
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtins::default_registry;
    use crate::compiler::compile;
    use crate::environment::Environment;
    use crate::pattern::PatternRegistry;

    fn run_in(env: &Arc<Environment>, text: &str) -> Outcome<Value> {
        let registry = Arc::new(default_registry().unwrap());
        run_with(&registry, env, text, &EvalContext::inline())
    }

    fn run_with(registry: &Arc<PatternRegistry>, env: &Arc<Environment>, text: &str, ctx: &EvalContext) -> Outcome<Value> {
        compile("test", text, registry, env).unwrap().run_with(ctx, vec![]).get()
    }

    fn run(text: &str) -> Outcome<Value> {
        run_in(&Environment::new(), text)
    }

    #[test]
    fn block_keeps_program_order() {
        let env = Environment::new();
        run_in(&env, "define(x, 0)").unwrap();
        assert_eq!(run_in(&env, "block(store(x, 1), store(x, x + 1), x)"), Ok(Value::Int(2)));
        assert_eq!(run("block()"), Ok(Value::Nil));
    }

    #[test]
    fn while_loops_without_recursion() {
        let text = "define(i, 0)\ndefine(acc, 0)\nwhile(i < 10000, block(store(acc, acc + i), store(i, i + 1)))\nacc";
        assert_eq!(run(text), Ok(Value::Int(49_995_000)));
    }

    #[test]
    fn if_skips_the_untaken_branch() {
        assert_eq!(run("if(1 < 2, 10, assert(false))"), Ok(Value::Int(10)));
        assert_eq!(run("if(false, 1)"), Ok(Value::Nil));
        assert_eq!(run("false && assert(false)"), Ok(Value::Bool(false)));
        assert_eq!(run("1 || assert(false)"), Ok(Value::Bool(true)));
    }

    #[test]
    fn variables_are_memoised() {
        let env = Environment::new();
        run_in(&env, "define(n, 0)").unwrap();
        // The definition of `y` runs once.
        run_in(&env, "define(y, block(store(n, n + 1), n))").unwrap();
        assert_eq!(run_in(&env, "y + y"), Ok(Value::Int(2)));
        assert_eq!(env.value_of("n"), Some(Value::Int(1)));
    }

    #[test]
    fn closures_capture_their_defining_frame() {
        let text = "define(adder, a, lambda(b, a + b))\ndefine(add2, adder(2))\nadd2(40)";
        assert_eq!(run(text), Ok(Value::Int(42)));
    }

    #[test]
    fn local_definitions_and_recursion() {
        let text = "define(fib, n, block(define(m, n - 1), if(n < 2, n, fib(m) + fib(n - 2))))\nfib(15)";
        assert_eq!(run(text), Ok(Value::Int(610)));
    }

    #[test]
    fn errors_name_the_failing_primitive() {
        let err = run("define(v, [1, 2])\n\nv + [1, 2, 3]").unwrap_err();
        assert!(matches!(err.kind, EvalErrorKind::ShapeMismatch(_)));
        let name = err.primitive.unwrap();
        assert!(name.starts_with("/physl/__add$0/"), "{name}");
        assert_eq!(err.span.map(|s| (s.line, s.col)), Some((3, 1)));
    }

    #[test]
    fn calling_with_wrong_arity_fails_at_run_time() {
        let err = run("define(k, lambda(a, a))\nk(1, 2)").unwrap_err();
        assert_eq!(err.kind, EvalErrorKind::ArityMismatch { expected: 1, got: 2 });
    }

    #[test]
    fn parallel_branches_join_with_when_all() {
        let registry = Arc::new(default_registry().unwrap());
        let env = Environment::new();
        let ctx = EvalContext {
            executor: Executor::with_threads(4).unwrap(),
            ..EvalContext::default()
        };
        run_with(&registry, &env, "define(a, 0)\ndefine(b, 0)", &ctx).unwrap();
        let text = "when_all(store(a, 1), store(b, 2))\n(a, b)";
        let result = run_with(&registry, &env, text, &ctx);
        assert_eq!(result, Ok(Value::List(vec![Value::Int(1), Value::Int(2)])));
    }

    #[test]
    fn parallel_block_yields_its_last_statement() {
        let env = Environment::new();
        run_in(&env, "define(a, 0)\ndefine(b, 0)").unwrap();
        assert_eq!(run_in(&env, "parallel_block(store(a, 1), b + 2)"), Ok(Value::Int(2)));
        assert_eq!(env.value_of("a"), Some(Value::Int(1)));
        assert_eq!(run("parallel_block()"), Ok(Value::Nil));
    }

    #[test]
    fn parallel_block_reports_a_failing_branch() {
        let ctx = EvalContext {
            executor: Executor::with_threads(2).unwrap(),
            ..EvalContext::default()
        };
        let registry = Arc::new(default_registry().unwrap());
        let err = run_with(&registry, &Environment::new(), "parallel_block(assert(false, \"left\"), 1)", &ctx);
        if let Err(e) = err {
            assert_eq!(e.kind, EvalErrorKind::AssertionFailure("left".into()));
        }
    }

    #[test]
    fn synchronize_serialises_updates() {
        let registry = Arc::new(default_registry().unwrap());
        let env = Environment::new();
        let ctx = EvalContext {
            executor: Executor::with_threads(4).unwrap(),
            mode: EvalMode::ASYNC_OPERANDS,
            ..EvalContext::default()
        };
        run_with(&registry, &env, "define(c, 0)\ndefine(bump, k, synchronize(store(c, c + k)))", &ctx).unwrap();
        let text = "when_all(bump(1), bump(2), bump(3), bump(4))\nc";
        assert_eq!(run_with(&registry, &env, text, &ctx), Ok(Value::Int(10)));
    }

    #[test]
    fn async_operands_give_the_same_results() {
        let registry = Arc::new(default_registry().unwrap());
        let ctx = EvalContext {
            executor: Executor::with_threads(3).unwrap(),
            mode: EvalMode::ASYNC_OPERANDS,
            ..EvalContext::default()
        };
        let text = "define(sq, x, x * x)\nsq(3) + sq(4) * 2";
        assert_eq!(run_with(&registry, &Environment::new(), text, &ctx), Ok(Value::Int(41)));
    }

    #[test]
    fn while_with_pending_iterations_keeps_a_flat_stack() {
        let registry = Arc::new(default_registry().unwrap());
        let ctx = EvalContext {
            executor: Executor::with_threads(2).unwrap(),
            mode: EvalMode::ASYNC_OPERANDS,
            ..EvalContext::default()
        };
        let text = "define(i, 0)\nwhile(i < 20000, store(i, i + 1))\ni";
        assert_eq!(run_with(&registry, &Environment::new(), text, &ctx), Ok(Value::Int(20_000)));
    }

    #[test]
    fn while_reports_a_failing_pending_body() {
        let registry = Arc::new(default_registry().unwrap());
        let ctx = EvalContext {
            executor: Executor::with_threads(2).unwrap(),
            mode: EvalMode::ASYNC_OPERANDS,
            ..EvalContext::default()
        };
        let text = "define(i, 0)\nwhile(i < 10, block(store(i, i + 1), assert(i < 5)))";
        let err = run_with(&registry, &Environment::new(), text, &ctx).unwrap_err();
        assert!(matches!(err.kind, EvalErrorKind::AssertionFailure(_)), "{err:?}");
    }

    #[test]
    fn mode_flags() {
        assert!(!EvalMode::empty().contains(EvalMode::ASYNC_OPERANDS));
        assert!((EvalMode::empty() | EvalMode::ASYNC_OPERANDS).contains(EvalMode::ASYNC_OPERANDS));
    }
}
