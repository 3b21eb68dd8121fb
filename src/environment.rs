// Environment: compile-time scope chain
//
// The top-level environment outlives compilations: every snippet compiled
// against it sees the globals earlier snippets defined. A function body is
// compiled in a child environment whose parent is the defining scope, so
// name resolution is lexical. Each child level corresponds to one runtime
// Frame; the depth returned by `lookup` is the number of frame links a
// variable access walks outward.
//
// Compilation of a snippet either succeeds completely or leaves the
// environment as it found it (see `checkpoint`/`restore`).

use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};

use crate::primitive::{FunctionBody, LocalDef, Node, SlotRef, VariableSlot};
use crate::value::Value;

/// Where a bound name lives at run time.
#[derive(Debug, Clone)]
pub enum Address {
    Global(Arc<VariableSlot>),
    Argument(usize),
    Local(usize),
}

impl Address {
    /// Runtime reference from a scope `depth` levels inside the owner.
    pub fn at_depth(&self, depth: usize) -> SlotRef {
        match self {
            Address::Global(slot) => SlotRef::Global(Arc::clone(slot)),
            Address::Argument(index) => SlotRef::Argument { depth, index: *index },
            Address::Local(index) => SlotRef::Local { depth, index: *index },
        }
    }
}

#[derive(Debug, Clone)]
pub enum Binding {
    Variable(Address),
    /// A name introduced by `define(name, params..., body)`. The body is
    /// known statically, which lets calls be arity-checked at compile time.
    Function {
        address: Address,
        body: Arc<FunctionBody>,
    },
}

impl Binding {
    pub fn address(&self) -> &Address {
        match self {
            Binding::Variable(address) | Binding::Function { address, .. } => address,
        }
    }
}

/// Bindings and local count captured before a compilation.
#[derive(Debug, Clone)]
pub struct Checkpoint {
    bindings: IndexMap<String, Binding>,
    locals: usize,
}

pub struct Environment {
    parent: Option<Arc<Environment>>,
    level: usize,
    bindings: RwLock<IndexMap<String, Binding>>,
    locals: Mutex<Vec<LocalDef>>,
}

impl fmt::Debug for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Environment")
            .field("level", &self.level)
            .field("names", &self.names())
            .finish()
    }
}

impl Environment {
    /// A fresh top-level environment.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            parent: None,
            level: 0,
            bindings: RwLock::new(IndexMap::new()),
            locals: Mutex::new(Vec::new()),
        })
    }

    /// Scope of a function body defined in `parent`, with `params` bound to
    /// argument slots.
    pub fn child(parent: &Arc<Self>, params: &[String]) -> Arc<Self> {
        let bindings = params
            .iter()
            .enumerate()
            .map(|(i, name)| (name.clone(), Binding::Variable(Address::Argument(i))))
            .collect();
        Arc::new(Self {
            parent: Some(Arc::clone(parent)),
            level: parent.level + 1,
            bindings: RwLock::new(bindings),
            locals: Mutex::new(Vec::new()),
        })
    }

    pub fn is_top_level(&self) -> bool {
        self.parent.is_none()
    }

    pub fn level(&self) -> usize {
        self.level
    }

    /// Bind `name` in this scope, shadowing outer scopes and replacing an
    /// earlier binding in this one.
    pub fn bind(&self, name: impl Into<String>, binding: Binding) {
        self.bindings.write().insert(name.into(), binding);
    }

    /// Bind a top-level name to an already computed value.
    pub fn define_value(&self, name: &str, value: Value) -> Arc<VariableSlot> {
        let slot = VariableSlot::ready(name, value);
        self.bind(name, Binding::Variable(Address::Global(Arc::clone(&slot))));
        slot
    }

    /// Resolve `name` through the scope chain. The depth counts scopes
    /// crossed; it is 0 for names bound here.
    pub fn lookup(&self, name: &str) -> Option<(Binding, usize)> {
        let mut env = self;
        let mut depth = 0;
        loop {
            if let Some(binding) = env.bindings.read().get(name) {
                return Some((binding.clone(), depth));
            }
            env = env.parent.as_deref()?;
            depth += 1;
        }
    }

    /// Current value of a global, if it has been computed.
    pub fn value_of(&self, name: &str) -> Option<Value> {
        match self.lookup(name)?.0.address() {
            Address::Global(slot) => slot.peek(),
            _ => None,
        }
    }

    /// Reserve a per-invocation slot in this function scope.
    pub fn allocate_local(&self, name: &str, init: Node) -> usize {
        let mut locals = self.locals.lock();
        locals.push(LocalDef {
            name: name.to_string(),
            init,
        });
        locals.len() - 1
    }

    /// The locals allocated so far; the function body owns them from here.
    pub fn take_locals(&self) -> Vec<LocalDef> {
        std::mem::take(&mut *self.locals.lock())
    }

    /// Names bound in this scope, in binding order.
    pub fn names(&self) -> Vec<String> {
        self.bindings.read().keys().cloned().collect()
    }

    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            bindings: self.bindings.read().clone(),
            locals: self.locals.lock().len(),
        }
    }

    /// Undo everything bound or allocated since `checkpoint`.
    pub fn restore(&self, checkpoint: Checkpoint) {
        *self.bindings.write() = checkpoint.bindings;
        self.locals.lock().truncate(checkpoint.locals);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::names::PrimitiveName;
    use crate::primitive::{Primitive, PrimitiveKind};

    fn nil() -> Node {
        let name = PrimitiveName::parse("/physl/constant$0/0").unwrap();
        Primitive::new(name, None, PrimitiveKind::Constant(Value::Nil), vec![])
    }

    #[test]
    fn lookup_counts_scopes() {
        let top = Environment::new();
        top.define_value("g", Value::Int(1));
        let f = Environment::child(&top, &["a".into()]);
        let g = Environment::child(&f, &["b".into()]);

        let (binding, depth) = g.lookup("a").unwrap();
        assert!(matches!(binding.address(), Address::Argument(0)));
        assert_eq!(depth, 1);
        assert_eq!(g.lookup("b").unwrap().1, 0);
        assert!(matches!(g.lookup("g").unwrap().0.address(), Address::Global(_)));
        assert!(g.lookup("missing").is_none());
        assert_eq!(g.level(), 2);
    }

    #[test]
    fn inner_definitions_shadow() {
        let top = Environment::new();
        let f = Environment::child(&top, &["x".into()]);
        let index = f.allocate_local("x", nil());
        f.bind("x", Binding::Variable(Address::Local(index)));
        assert!(matches!(f.lookup("x").unwrap().0.address(), Address::Local(0)));
        assert_eq!(f.take_locals().len(), 1);
        assert!(f.take_locals().is_empty());
    }

    #[test]
    fn restore_discards_partial_work() {
        let top = Environment::new();
        top.define_value("x", Value::Int(1));
        let saved = top.checkpoint();
        top.define_value("y", Value::Int(2));
        top.define_value("x", Value::Int(3));
        top.restore(saved);
        assert_eq!(top.names(), vec!["x".to_string()]);
        assert_eq!(top.value_of("x"), Some(Value::Int(1)));
    }
}
