// AST: abstract syntax tree for PhySL
//
// PhySL is expression-only, so the tree is a single recursive sum type.
// Binary operators are NOT nested by precedence at parse time: a chain like
// `a + b * c` is kept flat as `Expression { first: a, rest: [(+, b), (*, c)] }`
// and folded later (see fold.rs). That keeps the parser free of precedence
// ambiguity and lets rewrite rules match the surface shape of the source.
//
// Trees are immutable once built. Rewriting (transform.rs) produces a new
// tree by substitution.
//
// Identifiers carry an optional id into a PositionTable built by the parser.
// Ids are bookkeeping only: structural equality compares names, never ids.

use std::fmt;

use crate::token::Span;

/// Index into a [`PositionTable`].
pub type PositionId = u32;

/// A name occurrence in source text.
#[derive(Debug, Clone, Eq)]
pub struct Identifier {
    pub name: String,
    pub id: Option<PositionId>,
}

impl Identifier {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            id: None,
        }
    }

    pub fn with_id(name: impl Into<String>, id: PositionId) -> Self {
        Self {
            name: name.into(),
            id: Some(id),
        }
    }
}

impl PartialEq for Identifier {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// A template hole: `_k` binds one subtree, `__k` binds a run of list items
/// or call arguments (zero or more). Only produced by the pattern parser.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Placeholder {
    pub index: usize,
    pub variadic: bool,
}

impl Placeholder {
    /// Recognise `_<digits>` and `__<digits>`.
    pub fn from_name(name: &str) -> Option<Self> {
        let (variadic, digits) = match name.strip_prefix("__") {
            Some(rest) => (true, rest),
            None => (false, name.strip_prefix('_')?),
        };
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        digits.parse().ok().map(|index| Placeholder { index, variadic })
    }
}

impl fmt::Display for Placeholder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.variadic {
            write!(f, "__{}", self.index)
        } else {
            write!(f, "_{}", self.index)
        }
    }
}

/// Binary operators, lowest precedence first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinOp {
    Or,
    And,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

impl BinOp {
    pub fn symbol(self) -> &'static str {
        match self {
            BinOp::Or => "||",
            BinOp::And => "&&",
            BinOp::Eq => "==",
            BinOp::Ne => "!=",
            BinOp::Lt => "<",
            BinOp::Le => "<=",
            BinOp::Gt => ">",
            BinOp::Ge => ">=",
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Mod => "%",
        }
    }

    /// Name of the primitive the operator folds into.
    pub fn primitive_name(self) -> &'static str {
        match self {
            BinOp::Or => "__or",
            BinOp::And => "__and",
            BinOp::Eq => "__eq",
            BinOp::Ne => "__ne",
            BinOp::Lt => "__lt",
            BinOp::Le => "__le",
            BinOp::Gt => "__gt",
            BinOp::Ge => "__ge",
            BinOp::Add => "__add",
            BinOp::Sub => "__sub",
            BinOp::Mul => "__mul",
            BinOp::Div => "__div",
            BinOp::Mod => "__mod",
        }
    }

    /// Binding strength; higher binds tighter. All operators are
    /// left-associative.
    pub fn precedence(self) -> u8 {
        match self {
            BinOp::Or => 1,
            BinOp::And => 2,
            BinOp::Eq | BinOp::Ne => 3,
            BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => 4,
            BinOp::Add | BinOp::Sub => 5,
            BinOp::Mul | BinOp::Div | BinOp::Mod => 6,
        }
    }
}

/// Unary prefix operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Neg,
    Not,
}

impl UnaryOp {
    pub fn symbol(self) -> &'static str {
        match self {
            UnaryOp::Neg => "-",
            UnaryOp::Not => "!",
        }
    }

    pub fn primitive_name(self) -> &'static str {
        match self {
            UnaryOp::Neg => "__minus",
            UnaryOp::Not => "__not",
        }
    }
}

/// One `(operator, right operand)` link of a flat expression chain.
#[derive(Debug, Clone, PartialEq)]
pub struct Operation {
    pub op: BinOp,
    pub operand: Ast,
}

/// A PhySL expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Ast {
    /// `nil`
    Nil,
    /// `true` / `false`
    Bool(bool),
    /// `42`
    Int(i64),
    /// `3.5`, `1e-3`
    Float(f64),
    /// `"text"`
    Str(String),
    /// `[1, 2, 3]`, nested for higher ranks
    Array(Vec<Ast>),
    /// `(a, b)`, `(a,)`, `()`
    List(Vec<Ast>),
    /// `x`
    Identifier(Identifier),
    /// `_1`, `__1` (pattern text only)
    Placeholder(Placeholder),
    /// `-x`, `!x`
    Unary { op: UnaryOp, operand: Box<Ast> },
    /// `a + b * c`, unfolded
    Expression { first: Box<Ast>, rest: Vec<Operation> },
    /// `name(args...)`
    Call { name: Identifier, args: Vec<Ast> },
}

impl Ast {
    pub fn ident(name: impl Into<String>) -> Ast {
        Ast::Identifier(Identifier::new(name))
    }

    pub fn call(name: impl Into<String>, args: Vec<Ast>) -> Ast {
        Ast::Call {
            name: Identifier::new(name),
            args,
        }
    }

    pub fn placeholder(index: usize) -> Ast {
        Ast::Placeholder(Placeholder {
            index,
            variadic: false,
        })
    }

    /// Short tag for diagnostics.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Ast::Nil => "nil",
            Ast::Bool(_) => "bool",
            Ast::Int(_) => "integer",
            Ast::Float(_) => "float",
            Ast::Str(_) => "string",
            Ast::Array(_) => "array literal",
            Ast::List(_) => "list literal",
            Ast::Identifier(_) => "identifier",
            Ast::Placeholder(_) => "placeholder",
            Ast::Unary { .. } => "unary expression",
            Ast::Expression { .. } => "expression",
            Ast::Call { .. } => "function call",
        }
    }

    pub fn as_identifier(&self) -> Option<&Identifier> {
        match self {
            Ast::Identifier(id) => Some(id),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Ast::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Ast::Int(n) => Some(*n),
            _ => None,
        }
    }

    /// Position id of the first identifier reachable from this node, used
    /// to attribute folded operator nodes to a source location.
    pub fn first_position(&self) -> Option<PositionId> {
        match self {
            Ast::Identifier(id) => id.id,
            Ast::Call { name, args } => name.id.or_else(|| args.iter().find_map(Ast::first_position)),
            Ast::Unary { operand, .. } => operand.first_position(),
            Ast::Expression { first, rest } => first
                .first_position()
                .or_else(|| rest.iter().find_map(|o| o.operand.first_position())),
            Ast::Array(items) | Ast::List(items) => items.iter().find_map(Ast::first_position),
            _ => None,
        }
    }

    /// True if any placeholder occurs in the tree.
    pub fn has_placeholders(&self) -> bool {
        let mut found = false;
        self.walk(&mut |node| found |= matches!(node, Ast::Placeholder(_)));
        found
    }

    /// Number of nodes in the tree.
    pub fn node_count(&self) -> usize {
        let mut count = 0;
        self.walk(&mut |_| count += 1);
        count
    }

    /// Pre-order visit of every node.
    pub fn walk(&self, visit: &mut dyn FnMut(&Ast)) {
        visit(self);
        match self {
            Ast::Array(items) | Ast::List(items) => items.iter().for_each(|a| a.walk(visit)),
            Ast::Unary { operand, .. } => operand.walk(visit),
            Ast::Expression { first, rest } => {
                first.walk(visit);
                rest.iter().for_each(|o| o.operand.walk(visit));
            }
            Ast::Call { args, .. } => args.iter().for_each(|a| a.walk(visit)),
            _ => {}
        }
    }
}

// Printing
//
// The printer is the left inverse of the parser: re-parsing the output
// gives a structurally equal tree. Nested flat expressions came from
// parentheses, so they are printed inside parentheses again.

fn write_operand(f: &mut fmt::Formatter<'_>, ast: &Ast) -> fmt::Result {
    match ast {
        Ast::Expression { .. } => write!(f, "({ast})"),
        _ => write!(f, "{ast}"),
    }
}

fn write_items(f: &mut fmt::Formatter<'_>, items: &[Ast]) -> fmt::Result {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        write!(f, "{item}")?;
    }
    Ok(())
}

fn write_escaped(f: &mut fmt::Formatter<'_>, s: &str) -> fmt::Result {
    f.write_str("\"")?;
    for ch in s.chars() {
        match ch {
            '\n' => f.write_str("\\n")?,
            '\t' => f.write_str("\\t")?,
            '\\' => f.write_str("\\\\")?,
            '"' => f.write_str("\\\"")?,
            c => write!(f, "{c}")?,
        }
    }
    f.write_str("\"")
}

impl fmt::Display for Ast {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Ast::Nil => f.write_str("nil"),
            Ast::Bool(b) => write!(f, "{b}"),
            Ast::Int(n) => write!(f, "{n}"),
            // Debug keeps a decimal point or exponent, so the text lexes
            // back as a float
            Ast::Float(x) => write!(f, "{x:?}"),
            Ast::Str(s) => write_escaped(f, s),
            Ast::Array(items) => {
                f.write_str("[")?;
                write_items(f, items)?;
                f.write_str("]")
            }
            Ast::List(items) => {
                f.write_str("(")?;
                write_items(f, items)?;
                if items.len() == 1 {
                    f.write_str(",")?;
                }
                f.write_str(")")
            }
            Ast::Identifier(id) => write!(f, "{id}"),
            Ast::Placeholder(p) => write!(f, "{p}"),
            Ast::Unary { op, operand } => {
                f.write_str(op.symbol())?;
                write_operand(f, operand)
            }
            Ast::Expression { first, rest } => {
                write_operand(f, first)?;
                for link in rest {
                    write!(f, " {} ", link.op.symbol())?;
                    write_operand(f, &link.operand)?;
                }
                Ok(())
            }
            Ast::Call { name, args } => {
                write!(f, "{name}(")?;
                write_items(f, args)?;
                f.write_str(")")
            }
        }
    }
}

/// Source positions of identifier occurrences, indexed by [`PositionId`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PositionTable {
    spans: Vec<Span>,
}

impl PositionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a span and return its id.
    pub fn push(&mut self, span: Span) -> PositionId {
        self.spans.push(span);
        (self.spans.len() - 1) as PositionId
    }

    pub fn get(&self, id: PositionId) -> Option<Span> {
        self.spans.get(id as usize).copied()
    }

    /// Resolve an optional id, as carried by [`Identifier`].
    pub fn lookup(&self, id: Option<PositionId>) -> Option<Span> {
        id.and_then(|id| self.get(id))
    }

    pub fn len(&self) -> usize {
        self.spans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholder_names() {
        assert_eq!(
            Placeholder::from_name("_3"),
            Some(Placeholder {
                index: 3,
                variadic: false
            })
        );
        assert_eq!(
            Placeholder::from_name("__1"),
            Some(Placeholder {
                index: 1,
                variadic: true
            })
        );
        assert_eq!(Placeholder::from_name("_x"), None);
        assert_eq!(Placeholder::from_name("_"), None);
        assert_eq!(Placeholder::from_name("___1"), None);
        assert_eq!(Placeholder::from_name("x1"), None);
    }

    #[test]
    fn identifier_equality_ignores_position() {
        assert_eq!(Identifier::with_id("a", 0), Identifier::with_id("a", 7));
        assert_ne!(Identifier::new("a"), Identifier::new("b"));
    }

    #[test]
    fn print_nested_expression_with_parens() {
        let inner = Ast::Expression {
            first: Box::new(Ast::ident("a")),
            rest: vec![Operation {
                op: BinOp::Add,
                operand: Ast::ident("b"),
            }],
        };
        let outer = Ast::Expression {
            first: Box::new(inner.clone()),
            rest: vec![Operation {
                op: BinOp::Mul,
                operand: Ast::Int(2),
            }],
        };
        assert_eq!(outer.to_string(), "(a + b) * 2");
        let neg = Ast::Unary {
            op: UnaryOp::Neg,
            operand: Box::new(inner),
        };
        assert_eq!(neg.to_string(), "-(a + b)");
    }

    #[test]
    fn print_literals() {
        assert_eq!(Ast::Float(1.0).to_string(), "1.0");
        assert_eq!(Ast::Str("a\"b\n".into()).to_string(), r#""a\"b\n""#);
        assert_eq!(Ast::List(vec![Ast::Int(1)]).to_string(), "(1,)");
        assert_eq!(Ast::List(vec![]).to_string(), "()");
        assert_eq!(
            Ast::call("f", vec![Ast::Array(vec![Ast::Int(1), Ast::Int(2)]), Ast::Nil]).to_string(),
            "f([1, 2], nil)"
        );
    }

    #[test]
    fn node_count_and_placeholders() {
        let ast = Ast::call("f", vec![Ast::placeholder(1), Ast::ident("x")]);
        assert_eq!(ast.node_count(), 3);
        assert!(ast.has_placeholders());
        assert!(!Ast::ident("x").has_placeholders());
    }
}
