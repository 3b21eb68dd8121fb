// Primitive: nodes of the compiled execution tree
//
// A compiled snippet is a tree of Arc<Primitive>. Every node has a
// fully-qualified name, an optional source span, a kind and its operand
// nodes. Kinds are a closed enum; the only open seam is Kernel, which holds
// a trait object supplied through the pattern registry.
//
// Runtime state lives outside the tree:
//
//   VariableSlot  memoised value of one variable (global, argument or local)
//   Frame         argument and local slots of one function invocation, plus
//                 the frame captured when the function value was created
//   FunctionRef   a function body paired with its captured frame (a closure)
//
// Variables are addressed statically. A top-level variable is a shared slot
// held directly by the node; arguments and locals are (depth, index) pairs,
// where depth counts captured-frame links outward from the current frame.

use std::fmt;
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;

use crate::distributed::DistributedOp;
use crate::future::AsyncMutex;
use crate::kernels::Kernel;
use crate::names::PrimitiveName;
use crate::token::Span;
use crate::value::Value;

pub type Node = Arc<Primitive>;

/// One node of the execution tree.
#[derive(Debug)]
pub struct Primitive {
    pub name: PrimitiveName,
    pub span: Option<Span>,
    pub kind: PrimitiveKind,
    pub operands: Vec<Node>,
}

impl Primitive {
    pub fn new(name: PrimitiveName, span: Option<Span>, kind: PrimitiveKind, operands: Vec<Node>) -> Node {
        Arc::new(Self {
            name,
            span,
            kind,
            operands,
        })
    }

    /// Fully-qualified name as text.
    pub fn qualified_name(&self) -> String {
        self.name.to_string()
    }

    /// Pre-order visit of this node and its operands. Function bodies are
    /// not entered.
    pub fn walk(&self, visit: &mut dyn FnMut(&Primitive)) {
        visit(self);
        for op in &self.operands {
            op.walk(visit);
        }
    }

    pub fn as_constant(&self) -> Option<&Value> {
        match &self.kind {
            PrimitiveKind::Constant(v) => Some(v),
            _ => None,
        }
    }
}

pub enum PrimitiveKind {
    /// A literal value.
    Constant(Value),
    /// `[a, b, ...]` with non-constant elements.
    ArrayLiteral,
    /// `(a, b, ...)` with non-constant elements.
    ListLiteral,
    /// Read a variable.
    Variable(SlotRef),
    /// `define(x, body)`: evaluate operand 0, store it, yield it.
    Define(SlotRef),
    /// `store(x, value)`: overwrite operand 0's value into the slot.
    Store(SlotRef),
    /// A function value: evaluates to a closure over the current frame.
    Function(Arc<FunctionBody>),
    /// Apply operand 0 (a function value) to the remaining operands.
    Call,
    Block,
    ParallelBlock,
    If,
    While,
    /// Short-circuit `&&`.
    And,
    /// Short-circuit `||`.
    Or,
    Synchronize(Arc<AsyncMutex>),
    /// Join all operands into a list.
    WhenAll,
    Kernel(Arc<dyn Kernel>),
    Distributed(DistributedOp),
}

impl PrimitiveKind {
    /// Short type tag, used in diagnostics and as the primitive type in
    /// generated names.
    pub fn tag(&self) -> &str {
        match self {
            PrimitiveKind::Constant(_) => "constant",
            PrimitiveKind::ArrayLiteral => "array",
            PrimitiveKind::ListLiteral => "list",
            PrimitiveKind::Variable(SlotRef::Global(_)) => "variable",
            PrimitiveKind::Variable(SlotRef::Argument { .. }) => "access-argument",
            PrimitiveKind::Variable(SlotRef::Local { .. }) => "access-variable",
            PrimitiveKind::Define(_) => "define-variable",
            PrimitiveKind::Store(_) => "store",
            PrimitiveKind::Function(_) => "function",
            PrimitiveKind::Call => "call-function",
            PrimitiveKind::Block => "block",
            PrimitiveKind::ParallelBlock => "parallel_block",
            PrimitiveKind::If => "if",
            PrimitiveKind::While => "while",
            PrimitiveKind::And => "__and",
            PrimitiveKind::Or => "__or",
            PrimitiveKind::Synchronize(_) => "synchronize",
            PrimitiveKind::WhenAll => "when_all",
            PrimitiveKind::Kernel(k) => k.name(),
            PrimitiveKind::Distributed(op) => op.name(),
        }
    }
}

impl fmt::Debug for PrimitiveKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PrimitiveKind::Constant(v) => write!(f, "Constant({v})"),
            PrimitiveKind::Variable(slot) | PrimitiveKind::Define(slot) | PrimitiveKind::Store(slot) => {
                write!(f, "{}({slot:?})", self.tag())
            }
            PrimitiveKind::Function(body) => write!(f, "Function({})", body.name),
            other => f.write_str(other.tag()),
        }
    }
}

// Variables

enum SlotState {
    /// Declared but never defined on this path.
    Unbound,
    /// Defined by a node that has not been evaluated yet.
    Lazy(Node),
    Ready(Value),
}

/// What a reader has to do to get a slot's value.
pub enum SlotRead {
    Ready(Value),
    Evaluate(Node),
    Unbound,
}

/// Memoised storage of one variable.
pub struct VariableSlot {
    name: String,
    /// Frame-local slots do not cache closures: a closure captures the
    /// frame that owns the slot, and caching it would form a cycle.
    cache_functions: bool,
    state: Mutex<SlotState>,
}

impl VariableSlot {
    pub fn lazy(name: impl Into<String>, init: Node) -> Arc<Self> {
        Self::with_state(name, SlotState::Lazy(init), true)
    }

    pub fn ready(name: impl Into<String>, value: Value) -> Arc<Self> {
        Self::with_state(name, SlotState::Ready(value), true)
    }

    pub fn unbound(name: impl Into<String>) -> Arc<Self> {
        Self::with_state(name, SlotState::Unbound, true)
    }

    fn local(name: impl Into<String>, init: Node) -> Arc<Self> {
        Self::with_state(name, SlotState::Lazy(init), false)
    }

    fn with_state(name: impl Into<String>, state: SlotState, cache_functions: bool) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            cache_functions,
            state: Mutex::new(state),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Snapshot of the slot for a reader. The lock is released before the
    /// caller evaluates a lazy definition.
    pub fn read(&self) -> SlotRead {
        match &*self.state.lock() {
            SlotState::Ready(v) => SlotRead::Ready(v.clone()),
            SlotState::Lazy(node) => SlotRead::Evaluate(Arc::clone(node)),
            SlotState::Unbound => SlotRead::Unbound,
        }
    }

    /// Record the result of evaluating the lazy definition. The first
    /// completion wins; a later one (or a value stored meanwhile) yields the
    /// value already held.
    pub fn complete(&self, value: Value) -> Value {
        if !self.cache_functions && matches!(value, Value::Function(_)) {
            return value;
        }
        let mut state = self.state.lock();
        match &*state {
            SlotState::Ready(existing) => existing.clone(),
            _ => {
                *state = SlotState::Ready(value.clone());
                value
            }
        }
    }

    /// Overwrite the value (`store`, `define`).
    pub fn store(&self, value: Value) {
        if !self.cache_functions && matches!(value, Value::Function(_)) {
            return;
        }
        *self.state.lock() = SlotState::Ready(value);
    }

    /// The cached value, if any.
    pub fn peek(&self) -> Option<Value> {
        match &*self.state.lock() {
            SlotState::Ready(v) => Some(v.clone()),
            _ => None,
        }
    }
}

impl fmt::Debug for VariableSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &*self.state.lock() {
            SlotState::Unbound => "unbound",
            SlotState::Lazy(_) => "lazy",
            SlotState::Ready(_) => "ready",
        };
        write!(f, "VariableSlot({}, {state})", self.name)
    }
}

/// Static address of a variable.
#[derive(Clone)]
pub enum SlotRef {
    Global(Arc<VariableSlot>),
    Argument { depth: usize, index: usize },
    Local { depth: usize, index: usize },
}

impl SlotRef {
    /// The slot and the frame its lazy definition runs in.
    pub fn resolve(&self, frame: &FrameRef) -> Option<(Arc<VariableSlot>, FrameRef)> {
        match self {
            SlotRef::Global(slot) => Some((Arc::clone(slot), None)),
            SlotRef::Argument { depth, index } => {
                let owner = ancestor(frame, *depth)?;
                let slot = owner.args.get(*index).cloned()?;
                Some((slot, Some(owner)))
            }
            SlotRef::Local { depth, index } => {
                let owner = ancestor(frame, *depth)?;
                let slot = owner.locals.get(*index).cloned()?;
                Some((slot, Some(owner)))
            }
        }
    }
}

impl fmt::Debug for SlotRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SlotRef::Global(slot) => write!(f, "global {}", slot.name()),
            SlotRef::Argument { depth, index } => write!(f, "argument {index} at depth {depth}"),
            SlotRef::Local { depth, index } => write!(f, "local {index} at depth {depth}"),
        }
    }
}

// Frames and functions

/// Runtime scope of one function invocation.
#[derive(Debug)]
pub struct Frame {
    pub args: Vec<Arc<VariableSlot>>,
    pub locals: Vec<Arc<VariableSlot>>,
    pub parent: FrameRef,
}

/// The current frame; `None` at top level.
pub type FrameRef = Option<Arc<Frame>>;

/// Walk `depth` captured-frame links outward.
pub fn ancestor(frame: &FrameRef, depth: usize) -> Option<Arc<Frame>> {
    let mut current = frame.clone()?;
    for _ in 0..depth {
        current = current.parent.clone()?;
    }
    Some(current)
}

/// A local variable introduced by `define` inside a function body.
#[derive(Debug, Clone)]
pub struct LocalDef {
    pub name: String,
    pub init: Node,
}

/// A compiled function. The body is filled in after the function's own
/// name is bound, so recursive references resolve.
#[derive(Debug)]
pub struct FunctionBody {
    pub name: String,
    pub params: Vec<String>,
    body: OnceLock<Node>,
    locals: OnceLock<Vec<LocalDef>>,
}

impl FunctionBody {
    pub fn new(name: impl Into<String>, params: Vec<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            params,
            body: OnceLock::new(),
            locals: OnceLock::new(),
        })
    }

    pub fn arity(&self) -> usize {
        self.params.len()
    }

    pub fn body(&self) -> Option<&Node> {
        self.body.get()
    }

    pub fn locals(&self) -> &[LocalDef] {
        self.locals.get().map(Vec::as_slice).unwrap_or_default()
    }

    /// Install the compiled body. Only the first call has an effect.
    pub fn finish(&self, body: Node, locals: Vec<LocalDef>) {
        let _ = self.body.set(body);
        let _ = self.locals.set(locals);
    }

    /// A fresh frame for one invocation.
    pub fn new_frame(&self, args: Vec<Value>, parent: FrameRef) -> Arc<Frame> {
        let args = self
            .params
            .iter()
            .zip(args)
            .map(|(name, value)| VariableSlot::ready(name.as_str(), value))
            .collect();
        let locals = self
            .locals()
            .iter()
            .map(|def| VariableSlot::local(def.name.as_str(), Arc::clone(&def.init)))
            .collect();
        Arc::new(Frame { args, locals, parent })
    }
}

/// A function value: body plus the frame captured at creation.
#[derive(Clone)]
pub struct FunctionRef {
    pub body: Arc<FunctionBody>,
    pub captured: FrameRef,
}

impl FunctionRef {
    pub fn name(&self) -> &str {
        &self.body.name
    }

    pub fn arity(&self) -> usize {
        self.body.arity()
    }

    /// Same body and same captured frame.
    pub fn same_function(&self, other: &FunctionRef) -> bool {
        Arc::ptr_eq(&self.body, &other.body)
            && match (&self.captured, &other.captured) {
                (None, None) => true,
                (Some(a), Some(b)) => Arc::ptr_eq(a, b),
                _ => false,
            }
    }
}

impl fmt::Debug for FunctionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionRef")
            .field("name", &self.body.name)
            .field("params", &self.body.params)
            .finish()
    }
}

impl fmt::Display for FunctionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<function {}/{}>", self.body.name, self.body.arity())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn constant(v: Value) -> Node {
        let name = PrimitiveName::parse("/physl/constant$0/0").unwrap();
        Primitive::new(name, None, PrimitiveKind::Constant(v), vec![])
    }

    #[test]
    fn first_completion_wins() {
        let slot = VariableSlot::lazy("x", constant(Value::Int(1)));
        assert!(matches!(slot.read(), SlotRead::Evaluate(_)));
        assert_eq!(slot.complete(Value::Int(1)), Value::Int(1));
        assert_eq!(slot.complete(Value::Int(9)), Value::Int(1));
        slot.store(Value::Int(5));
        assert_eq!(slot.peek(), Some(Value::Int(5)));
    }

    #[test]
    fn frames_resolve_by_depth() {
        let outer = FunctionBody::new("outer", vec!["a".into()]);
        outer.finish(constant(Value::Nil), vec![]);
        let inner = FunctionBody::new("inner", vec!["b".into()]);
        inner.finish(constant(Value::Nil), vec![]);

        let outer_frame = outer.new_frame(vec![Value::Int(1)], None);
        let inner_frame = Some(inner.new_frame(vec![Value::Int(2)], Some(outer_frame)));

        let (slot, _) = SlotRef::Argument { depth: 1, index: 0 }
            .resolve(&inner_frame)
            .unwrap();
        assert_eq!(slot.peek(), Some(Value::Int(1)));
        let (slot, _) = SlotRef::Argument { depth: 0, index: 0 }
            .resolve(&inner_frame)
            .unwrap();
        assert_eq!(slot.peek(), Some(Value::Int(2)));
        assert!(SlotRef::Argument { depth: 2, index: 0 }
            .resolve(&inner_frame)
            .is_none());
    }

    #[test]
    fn local_slots_do_not_cache_closures() {
        let body = FunctionBody::new("f", vec![]);
        let func = Value::Function(FunctionRef {
            body: Arc::clone(&body),
            captured: None,
        });
        let local = VariableSlot::local("g", constant(Value::Nil));
        assert_eq!(local.complete(func.clone()), func);
        assert!(local.peek().is_none());
        let global = VariableSlot::lazy("g", constant(Value::Nil));
        global.complete(func.clone());
        assert_eq!(global.peek(), Some(func));
    }
}
