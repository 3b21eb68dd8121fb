// Operator folding: flat expression chains → nested primitive calls
//
// The parser leaves `a + b * c` as a flat chain. This pass applies the fixed
// precedence table from BinOp::precedence (all operators left-associative)
// and rewrites every operator into a call of its primitive:
//
//   a + b * c     →  __add(a, __mul(b, c))
//   a - b - c     →  __sub(__sub(a, b), c)
//   -x            →  __minus(x)
//   !p && q       →  __and(__not(p), q)
//
// `__and` / `__or` are short-circuiting primitives; folding keeps the right
// operand as a separate subtree so the evaluator can skip it.
//
// The output contains no Expression or Unary nodes. Folded operator calls
// take the position id of their left-most identifier, so diagnostics still
// point into the source.

use crate::ast::*;

/// Fold every operator chain in the tree.
pub fn fold_operators(ast: &Ast) -> Ast {
    match ast {
        Ast::Expression { first, rest } => {
            let mut operands = Vec::with_capacity(rest.len() + 1);
            operands.push(fold_operators(first));
            operands.extend(rest.iter().map(|link| fold_operators(&link.operand)));
            let ops: Vec<BinOp> = rest.iter().map(|link| link.op).collect();
            fold_chain(&operands, &ops)
        }
        Ast::Unary { op, operand } => {
            let operand = fold_operators(operand);
            operator_call(op.primitive_name(), vec![operand])
        }
        Ast::Call { name, args } => Ast::Call {
            name: name.clone(),
            args: args.iter().map(fold_operators).collect(),
        },
        Ast::Array(items) => Ast::Array(items.iter().map(fold_operators).collect()),
        Ast::List(items) => Ast::List(items.iter().map(fold_operators).collect()),
        leaf => leaf.clone(),
    }
}

/// `operands.len() == ops.len() + 1`. Splits at the loosest-binding
/// operator; ties go to the right-most one, which gives left associativity.
fn fold_chain(operands: &[Ast], ops: &[BinOp]) -> Ast {
    let split = ops
        .iter()
        .enumerate()
        .rev()
        .min_by_key(|(_, op)| op.precedence());
    match split {
        None => operands[0].clone(),
        Some((i, op)) => {
            let lhs = fold_chain(&operands[..=i], &ops[..i]);
            let rhs = fold_chain(&operands[i + 1..], &ops[i + 1..]);
            operator_call(op.primitive_name(), vec![lhs, rhs])
        }
    }
}

fn operator_call(name: &str, args: Vec<Ast>) -> Ast {
    let id = args.iter().find_map(Ast::first_position);
    Ast::Call {
        name: Identifier {
            name: name.to_string(),
            id,
        },
        args,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse;

    fn folded(src: &str) -> String {
        fold_operators(&parse(src).unwrap()).to_string()
    }

    #[test]
    fn multiplication_binds_tighter() {
        assert_eq!(folded("a + b * c"), "__add(a, __mul(b, c))");
        assert_eq!(folded("a * b + c"), "__add(__mul(a, b), c)");
    }

    #[test]
    fn left_associative() {
        assert_eq!(folded("a - b - c"), "__sub(__sub(a, b), c)");
        assert_eq!(folded("a / b * c"), "__mul(__div(a, b), c)");
    }

    #[test]
    fn logical_and_comparison_levels() {
        assert_eq!(
            folded("a < b || c == d && e"),
            "__or(__lt(a, b), __and(__eq(c, d), e))"
        );
    }

    #[test]
    fn parentheses_and_unary() {
        assert_eq!(folded("(a + b) * -c"), "__mul(__add(a, b), __minus(c))");
        assert_eq!(folded("!p"), "__not(p)");
    }

    #[test]
    fn folds_inside_calls_and_literals() {
        assert_eq!(folded("f(x + 1, [1, 2])"), "f(__add(x, 1), [1, 2])");
        assert_eq!(folded("(x * 2, y)"), "(__mul(x, 2), y)");
    }

    #[test]
    fn folded_call_keeps_left_position() {
        let ast = fold_operators(&parse("x + y").unwrap());
        let Ast::Call { name, .. } = ast else {
            panic!("expected call");
        };
        assert_eq!(name.id, Some(0));
    }
}
