// Transform: placeholder matching and rewrite rules over the AST
//
// A template is an AST that may contain placeholders:
//
//   _k    matches any single subtree and binds it to k
//   __k   inside an argument or item list, matches a run of zero or more
//         consecutive items (at most one per list)
//
// A placeholder that occurs twice must bind structurally equal subtrees.
// Matching is all-or-nothing: a failed attempt leaves no bindings behind.
//
// transform() rewrites bottom-up: children first, then the node itself. Each
// node is rewritten at most once per pass (the first matching rule wins), so
// a rule whose output contains its own input shape cannot loop.
//
// The pattern registry (pattern.rs) uses the same matcher for call shapes.

use std::collections::BTreeMap;

use crate::ast::*;
use crate::error::{CompileError, CompileErrorKind};
use crate::parser::parse_pattern;

/// What a placeholder captured.
#[derive(Debug, Clone, PartialEq)]
pub enum Capture {
    One(Ast),
    Many(Vec<Ast>),
}

impl Capture {
    /// The captured subtrees in order.
    pub fn items(&self) -> &[Ast] {
        match self {
            Capture::One(ast) => std::slice::from_ref(ast),
            Capture::Many(items) => items,
        }
    }
}

/// Placeholder bindings produced by a successful match, ordered by index.
pub type Bindings = BTreeMap<Placeholder, Capture>;

/// Match `ast` against `template`. Returns the bindings on success.
pub fn match_template(template: &Ast, ast: &Ast) -> Option<Bindings> {
    let mut bindings = Bindings::new();
    match_into(template, ast, &mut bindings).then_some(bindings)
}

fn bind(bindings: &mut Bindings, p: Placeholder, capture: Capture) -> bool {
    match bindings.get(&p) {
        Some(existing) => *existing == capture,
        None => {
            bindings.insert(p, capture);
            true
        }
    }
}

fn match_into(template: &Ast, ast: &Ast, bindings: &mut Bindings) -> bool {
    match (template, ast) {
        (Ast::Placeholder(p), _) => {
            let capture = if p.variadic {
                Capture::Many(vec![ast.clone()])
            } else {
                Capture::One(ast.clone())
            };
            bind(bindings, *p, capture)
        }
        (Ast::Nil, Ast::Nil) => true,
        (Ast::Bool(a), Ast::Bool(b)) => a == b,
        (Ast::Int(a), Ast::Int(b)) => a == b,
        (Ast::Float(a), Ast::Float(b)) => a == b,
        (Ast::Str(a), Ast::Str(b)) => a == b,
        (Ast::Identifier(a), Ast::Identifier(b)) => a == b,
        (Ast::Array(ps), Ast::Array(xs)) | (Ast::List(ps), Ast::List(xs)) => {
            match_items(ps, xs, bindings)
        }
        (Ast::Unary { op: po, operand: pa }, Ast::Unary { op: xo, operand: xa }) => {
            po == xo && match_into(pa, xa, bindings)
        }
        (
            Ast::Expression {
                first: pf,
                rest: pr,
            },
            Ast::Expression {
                first: xf,
                rest: xr,
            },
        ) => {
            pr.len() == xr.len()
                && match_into(pf, xf, bindings)
                && pr
                    .iter()
                    .zip(xr)
                    .all(|(p, x)| p.op == x.op && match_into(&p.operand, &x.operand, bindings))
        }
        (Ast::Call { name: pn, args: pa }, Ast::Call { name: xn, args: xa }) => {
            pn == xn && match_items(pa, xa, bindings)
        }
        _ => false,
    }
}

fn variadic_position(templates: &[Ast]) -> Option<(usize, Placeholder)> {
    templates.iter().enumerate().find_map(|(i, t)| match t {
        Ast::Placeholder(p) if p.variadic => Some((i, *p)),
        _ => None,
    })
}

fn match_items(templates: &[Ast], items: &[Ast], bindings: &mut Bindings) -> bool {
    let Some((at, p)) = variadic_position(templates) else {
        return templates.len() == items.len()
            && templates
                .iter()
                .zip(items)
                .all(|(t, x)| match_into(t, x, bindings));
    };
    let prefix = &templates[..at];
    let suffix = &templates[at + 1..];
    if items.len() < prefix.len() + suffix.len() {
        return false;
    }
    let tail_start = items.len() - suffix.len();
    prefix
        .iter()
        .zip(&items[..prefix.len()])
        .all(|(t, x)| match_into(t, x, bindings))
        && suffix
            .iter()
            .zip(&items[tail_start..])
            .all(|(t, x)| match_into(t, x, bindings))
        && bind(
            bindings,
            p,
            Capture::Many(items[prefix.len()..tail_start].to_vec()),
        )
}

/// Replace the placeholders in `template` by their captures. Placeholders
/// without a binding are left in place.
pub fn substitute(template: &Ast, bindings: &Bindings) -> Ast {
    match template {
        Ast::Placeholder(p) => match bindings.get(p) {
            Some(Capture::One(ast)) => ast.clone(),
            Some(Capture::Many(items)) if items.len() == 1 => items[0].clone(),
            Some(Capture::Many(items)) => Ast::List(items.clone()),
            None => template.clone(),
        },
        Ast::Array(items) => Ast::Array(substitute_items(items, bindings)),
        Ast::List(items) => Ast::List(substitute_items(items, bindings)),
        Ast::Unary { op, operand } => Ast::Unary {
            op: *op,
            operand: Box::new(substitute(operand, bindings)),
        },
        Ast::Expression { first, rest } => Ast::Expression {
            first: Box::new(substitute(first, bindings)),
            rest: rest
                .iter()
                .map(|link| Operation {
                    op: link.op,
                    operand: substitute(&link.operand, bindings),
                })
                .collect(),
        },
        Ast::Call { name, args } => Ast::Call {
            name: name.clone(),
            args: substitute_items(args, bindings),
        },
        leaf => leaf.clone(),
    }
}

fn substitute_items(items: &[Ast], bindings: &Bindings) -> Vec<Ast> {
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        match item {
            Ast::Placeholder(p) if p.variadic => match bindings.get(p) {
                Some(capture) => out.extend(capture.items().iter().cloned()),
                None => out.push(item.clone()),
            },
            _ => out.push(substitute(item, bindings)),
        }
    }
    out
}

/// A rewrite rule: `matcher` → `replacement`.
#[derive(Debug, Clone, PartialEq)]
pub struct TransformRule {
    pub matcher: Ast,
    pub replacement: Ast,
}

impl TransformRule {
    /// Build a rule from pattern text, e.g. `("_1 * _2", "_2 * _1")`.
    pub fn new(matcher: &str, replacement: &str) -> Result<Self, CompileError> {
        let parse = |text: &str| {
            parse_pattern(text).map_err(|e| {
                CompileError::new(
                    CompileErrorKind::InvalidPattern {
                        pattern: text.to_string(),
                        reason: e.kind.to_string(),
                    },
                    None,
                )
            })
        };
        Self::from_ast(parse(matcher)?, parse(replacement)?)
    }

    /// Build a rule from template trees. Every placeholder used by the
    /// replacement must be bound by the matcher.
    pub fn from_ast(matcher: Ast, replacement: Ast) -> Result<Self, CompileError> {
        let mut bound = Vec::new();
        matcher.walk(&mut |n| {
            if let Ast::Placeholder(p) = n {
                bound.push(*p);
            }
        });
        let mut unbound = None;
        replacement.walk(&mut |n| {
            if let Ast::Placeholder(p) = n {
                if !bound.contains(p) && unbound.is_none() {
                    unbound = Some(*p);
                }
            }
        });
        if let Some(p) = unbound {
            return Err(CompileError::new(
                CompileErrorKind::InvalidPattern {
                    pattern: replacement.to_string(),
                    reason: format!("placeholder {p} is not bound by '{matcher}'"),
                },
                None,
            ));
        }
        Ok(Self {
            matcher,
            replacement,
        })
    }

    /// Rewrite `ast` at its root if it matches.
    pub fn apply(&self, ast: &Ast) -> Option<Ast> {
        match_template(&self.matcher, ast).map(|b| substitute(&self.replacement, &b))
    }
}

/// One bottom-up rewriting pass.
pub fn transform(ast: &Ast, rules: &[TransformRule]) -> Ast {
    transform_counted(ast, rules).0
}

/// One bottom-up pass, also returning how many nodes were rewritten.
pub fn transform_counted(ast: &Ast, rules: &[TransformRule]) -> (Ast, usize) {
    let mut count = 0;
    let out = rewrite(ast, rules, &mut count);
    (out, count)
}

/// Repeat passes until nothing changes or `max_passes` is reached.
pub fn transform_to_fixed_point(ast: &Ast, rules: &[TransformRule], max_passes: usize) -> Ast {
    let mut current = ast.clone();
    for _ in 0..max_passes {
        let (next, count) = transform_counted(&current, rules);
        if count == 0 {
            break;
        }
        current = next;
    }
    current
}

fn rewrite(ast: &Ast, rules: &[TransformRule], count: &mut usize) -> Ast {
    let rebuilt = match ast {
        Ast::Array(items) => Ast::Array(items.iter().map(|a| rewrite(a, rules, count)).collect()),
        Ast::List(items) => Ast::List(items.iter().map(|a| rewrite(a, rules, count)).collect()),
        Ast::Unary { op, operand } => Ast::Unary {
            op: *op,
            operand: Box::new(rewrite(operand, rules, count)),
        },
        Ast::Expression { first, rest } => Ast::Expression {
            first: Box::new(rewrite(first, rules, count)),
            rest: rest
                .iter()
                .map(|link| Operation {
                    op: link.op,
                    operand: rewrite(&link.operand, rules, count),
                })
                .collect(),
        },
        Ast::Call { name, args } => Ast::Call {
            name: name.clone(),
            args: args.iter().map(|a| rewrite(a, rules, count)).collect(),
        },
        leaf => leaf.clone(),
    };
    for rule in rules {
        if let Some(out) = rule.apply(&rebuilt) {
            *count += 1;
            return out;
        }
    }
    rebuilt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse;

    #[test]
    fn commute_multiplication() {
        let rule = TransformRule::new("_1 * _2", "_2 * _1").unwrap();
        let out = transform(&parse("A * B").unwrap(), &[rule]);
        assert_eq!(out, parse("B * A").unwrap());
        assert_eq!(out.to_string(), "B * A");
    }

    #[test]
    fn repeated_placeholder_requires_equal_subtrees() {
        let template = parse_pattern("_1 - _1").unwrap();
        assert!(match_template(&template, &parse("f(x) - f(x)").unwrap()).is_some());
        assert!(match_template(&template, &parse("f(x) - f(y)").unwrap()).is_none());
    }

    #[test]
    fn variadic_capture_in_call() {
        let template = parse_pattern("block(_1, __2)").unwrap();
        let b = match_template(&template, &parse("block(a, b, c)").unwrap()).unwrap();
        assert_eq!(b.len(), 2);
        let rest = b
            .get(&Placeholder {
                index: 2,
                variadic: true,
            })
            .unwrap();
        assert_eq!(rest.items(), &[Ast::ident("b"), Ast::ident("c")]);

        let b = match_template(&template, &parse("block(a)").unwrap()).unwrap();
        assert_eq!(
            b[&Placeholder {
                index: 2,
                variadic: true
            }],
            Capture::Many(vec![])
        );
        assert!(match_template(&template, &parse("block()").unwrap()).is_none());
    }

    #[test]
    fn variadic_splices_into_replacement() {
        let rule = TransformRule::new("sum_all(__1)", "fold(add, (__1))").unwrap();
        let out = transform(&parse("sum_all(1, 2, 3)").unwrap(), &[rule]);
        assert_eq!(out.to_string(), "fold(add, (1, 2, 3))");
    }

    #[test]
    fn rewrites_bottom_up() {
        let rule = TransformRule::new("twice(_1)", "_1 + _1").unwrap();
        let out = transform(&parse("twice(twice(x))").unwrap(), &[rule]);
        assert_eq!(out.to_string(), "(x + x) + (x + x)");
    }

    #[test]
    fn no_partial_match() {
        let rule = TransformRule::new("f(_1, _1)", "g(_1)").unwrap();
        let ast = parse("f(a, b)").unwrap();
        assert_eq!(rule.apply(&ast), None);
        assert_eq!(transform_counted(&ast, &[rule]).1, 0);
    }

    #[test]
    fn unbound_replacement_placeholder_rejected() {
        let err = TransformRule::new("f(_1)", "g(_2)").unwrap_err();
        assert!(matches!(err.kind, CompileErrorKind::InvalidPattern { .. }));
    }

    #[test]
    fn second_pass_is_idempotent() {
        let rule = TransformRule::new("neg(neg(_1))", "_1").unwrap();
        let once = transform(&parse("neg(neg(neg(neg(a))))").unwrap(), &[rule.clone()]);
        assert_eq!(once.to_string(), "a");
        assert_eq!(transform(&once, &[rule]), once);
    }

    #[test]
    fn fixed_point_stops_when_stable() {
        let rule = TransformRule::new("wrap(wrap(_1))", "wrap(_1)").unwrap();
        let out = transform_to_fixed_point(&parse("wrap(wrap(wrap(wrap(x))))").unwrap(), &[rule], 10);
        assert_eq!(out.to_string(), "wrap(x)");
    }
}
