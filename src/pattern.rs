// Pattern registry: call shapes → primitive factories
//
// Each entry pairs a primitive type name with one or more call patterns,
// e.g. `if(_1, _2)` and `if(_1, _2, _3)`, and a factory that builds the
// node kind from compiled operands. Patterns are parsed once at
// registration; matching reuses the parsed templates.
//
// Matching a call site looks only at entries whose pattern name equals the
// call's name, in registration order; the first template that fits wins.
// A name that is registered but fits no template is an arity error, never a
// fall-through to user functions.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::ast::Ast;
use crate::error::{CompileError, CompileErrorKind};
use crate::kernels::Kernel;
use crate::names::PrimitiveName;
use crate::parser::parse_pattern;
use crate::primitive::{Node, PrimitiveKind};
use crate::token::Span;
use crate::transform::match_template;

/// What a factory gets to work with.
#[derive(Debug)]
pub struct FactoryInput {
    pub name: PrimitiveName,
    pub operands: Vec<Node>,
    pub span: Option<Span>,
}

/// Builds a node kind and its final operand list.
pub type Factory = Arc<dyn Fn(FactoryInput) -> Result<(PrimitiveKind, Vec<Node>), CompileError> + Send + Sync>;

pub struct PatternEntry {
    pub type_name: String,
    pub patterns: Vec<Ast>,
    pub texts: Vec<String>,
    pub factory: Factory,
}

impl fmt::Debug for PatternEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PatternEntry")
            .field("type_name", &self.type_name)
            .field("patterns", &self.texts)
            .finish()
    }
}

/// A successful match: the entry and the bound arguments in placeholder
/// order, variadic runs flattened.
#[derive(Debug, Clone)]
pub struct PatternMatch {
    pub entry: Arc<PatternEntry>,
    pub args: Vec<Ast>,
}

#[derive(Debug, Default)]
pub struct PatternRegistry {
    entries: Vec<Arc<PatternEntry>>,
    /// call name → (entry, pattern) indices, in registration order
    by_name: HashMap<String, Vec<(usize, usize)>>,
}

fn invalid(pattern: &str, reason: impl Into<String>) -> CompileError {
    CompileError::new(
        CompileErrorKind::InvalidPattern {
            pattern: pattern.to_string(),
            reason: reason.into(),
        },
        None,
    )
}

/// `_k` count and whether a `__k` run is present.
fn arity_of(pattern: &Ast) -> (usize, bool) {
    match pattern {
        Ast::Call { args, .. } => {
            let variadic = args.iter().any(|a| matches!(a, Ast::Placeholder(p) if p.variadic));
            (args.len() - usize::from(variadic), variadic)
        }
        _ => (0, false),
    }
}

impl PatternRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `patterns` for `type_name`.
    pub fn register(&mut self, type_name: &str, patterns: &[&str], factory: Factory) -> Result<(), CompileError> {
        let mut parsed = Vec::with_capacity(patterns.len());
        for &text in patterns {
            let ast = parse_pattern(text).map_err(|e| invalid(text, e.kind.to_string()))?;
            let Ast::Call { name, .. } = &ast else {
                return Err(invalid(text, format!("expected a call, got {}", ast.kind_name())));
            };
            let call_name = name.name.clone();
            let duplicate = self.by_name.get(&call_name).into_iter().flatten().any(|&(e, p)| self.entries[e].patterns[p] == ast)
                || parsed.iter().any(|(_, earlier)| *earlier == ast);
            if duplicate {
                return Err(CompileError::new(
                    CompileErrorKind::DuplicatePattern {
                        name: type_name.to_string(),
                        pattern: text.to_string(),
                    },
                    None,
                ));
            }
            parsed.push((call_name, ast));
        }

        let index = self.entries.len();
        for (p, (call_name, _)) in parsed.iter().enumerate() {
            self.by_name.entry(call_name.clone()).or_default().push((index, p));
        }
        debug!(type_name, patterns = patterns.len(), "registered primitive");
        self.entries.push(Arc::new(PatternEntry {
            type_name: type_name.to_string(),
            patterns: parsed.into_iter().map(|(_, ast)| ast).collect(),
            texts: patterns.iter().map(|t| t.to_string()).collect(),
            factory,
        }));
        Ok(())
    }

    /// Register a kernel under its own name and patterns.
    pub fn register_kernel(&mut self, kernel: Arc<dyn Kernel>) -> Result<(), CompileError> {
        let name = kernel.name().to_string();
        let texts = kernel.patterns();
        let texts: Vec<&str> = texts.iter().map(String::as_str).collect();
        let factory: Factory = Arc::new(move |input: FactoryInput| Ok((PrimitiveKind::Kernel(Arc::clone(&kernel)), input.operands)));
        self.register(&name, &texts, factory)
    }

    pub fn contains(&self, call_name: &str) -> bool {
        self.by_name.contains_key(call_name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[Arc<PatternEntry>] {
        &self.entries
    }

    /// Match a call site. `Ok(None)` means no entry uses this name.
    pub fn match_call(&self, call: &Ast, span: Option<Span>) -> Result<Option<PatternMatch>, CompileError> {
        let Ast::Call { name, args } = call else {
            return Ok(None);
        };
        let Some(candidates) = self.by_name.get(&name.name) else {
            return Ok(None);
        };
        for &(e, p) in candidates {
            let entry = &self.entries[e];
            if let Some(bindings) = match_template(&entry.patterns[p], call) {
                let args = bindings.values().flat_map(|c| c.items().iter().cloned()).collect();
                return Ok(Some(PatternMatch {
                    entry: Arc::clone(entry),
                    args,
                }));
            }
        }

        let mut expected: Vec<String> = candidates
            .iter()
            .map(|&(e, p)| match arity_of(&self.entries[e].patterns[p]) {
                (n, true) => format!("at least {n}"),
                (n, false) => n.to_string(),
            })
            .collect();
        expected.dedup();
        Err(CompileError::arity(name.name.as_str(), expected.join(" or "), args.len(), span))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse;

    fn block_factory() -> Factory {
        Arc::new(|input: FactoryInput| Ok((PrimitiveKind::Block, input.operands)))
    }

    fn registry() -> PatternRegistry {
        let mut r = PatternRegistry::new();
        r.register("if", &["if(_1, _2)", "if(_1, _2, _3)"], block_factory()).unwrap();
        r.register("block", &["block(__1)"], block_factory()).unwrap();
        r
    }

    #[test]
    fn first_fitting_template_binds_args() {
        let r = registry();
        let m = r.match_call(&parse("if(c, a, b)").unwrap(), None).unwrap().unwrap();
        assert_eq!(m.entry.type_name, "if");
        assert_eq!(m.args, vec![Ast::ident("c"), Ast::ident("a"), Ast::ident("b")]);

        let m = r.match_call(&parse("block()").unwrap(), None).unwrap().unwrap();
        assert!(m.args.is_empty());
        let m = r.match_call(&parse("block(1, 2, 3)").unwrap(), None).unwrap().unwrap();
        assert_eq!(m.args.len(), 3);
    }

    #[test]
    fn unknown_names_do_not_match() {
        let r = registry();
        assert!(r.match_call(&parse("f(1)").unwrap(), None).unwrap().is_none());
        assert!(r.match_call(&Ast::Int(1), None).unwrap().is_none());
    }

    #[test]
    fn known_name_with_wrong_arity_is_an_error() {
        let r = registry();
        let err = r.match_call(&parse("if(c)").unwrap(), None).unwrap_err();
        assert_eq!(
            err.kind,
            CompileErrorKind::ArityMismatch {
                name: "if".into(),
                expected: "2 or 3".into(),
                got: 1
            }
        );
    }

    #[test]
    fn duplicate_and_invalid_patterns_are_rejected() {
        let mut r = registry();
        let err = r.register("when", &["if(_1, _2)"], block_factory()).unwrap_err();
        assert!(matches!(err.kind, CompileErrorKind::DuplicatePattern { .. }));
        let err = r.register("x", &["1 + "], block_factory()).unwrap_err();
        assert!(matches!(err.kind, CompileErrorKind::InvalidPattern { .. }));
        let err = r.register("x", &["_1"], block_factory()).unwrap_err();
        assert!(matches!(err.kind, CompileErrorKind::InvalidPattern { .. }));
        assert_eq!(r.len(), 2);
    }

    #[test]
    fn matching_is_deterministic() {
        let r = registry();
        let call = parse("if(x < 1, 0, 1)").unwrap();
        let a = r.match_call(&call, None).unwrap().unwrap();
        let b = r.match_call(&call, None).unwrap().unwrap();
        assert!(Arc::ptr_eq(&a.entry, &b.entry));
        assert_eq!(a.args, b.args);
    }

    #[test]
    fn kernels_register_under_their_patterns() {
        let mut r = PatternRegistry::new();
        let add = crate::kernels::lookup("__add").unwrap();
        r.register_kernel(Arc::new(*add)).unwrap();
        assert!(r.contains("__add"));
        assert!(r.match_call(&Ast::call("__add", vec![Ast::Int(1), Ast::Int(2)]), None).unwrap().is_some());
    }
}
