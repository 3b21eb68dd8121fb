// Builtins: the default pattern registry
//
// Three groups, registered in this order:
//
//   control flow   block, parallel_block, if, while, synchronize, when_all,
//                  __and, __or, store
//   kernels        everything in kernels::BUILTIN_KERNELS
//   distributed    annotate_d, retile_d, all_gather_d, dot_d, locality,
//                  num_localities
//
// `define` and `lambda` are special forms handled by the compiler itself;
// they bind names rather than build nodes.

use std::sync::Arc;

use crate::distributed::DistributedOp;
use crate::error::CompileError;
use crate::future::AsyncMutex;
use crate::kernels::BUILTIN_KERNELS;
use crate::pattern::{Factory, FactoryInput, PatternRegistry};
use crate::primitive::PrimitiveKind;

/// A factory that builds `kind` over the operands unchanged.
fn plain(kind: fn() -> PrimitiveKind) -> Factory {
    Arc::new(move |input: FactoryInput| Ok((kind(), input.operands)))
}

/// `store(variable, value)`: the target must compile to a variable read.
fn store_factory() -> Factory {
    Arc::new(|input: FactoryInput| {
        let mut operands = input.operands.into_iter();
        let (Some(target), Some(value)) = (operands.next(), operands.next()) else {
            return Err(CompileError::arity("store", "2", 0, input.span));
        };
        match &target.kind {
            PrimitiveKind::Variable(slot) => Ok((PrimitiveKind::Store(slot.clone()), vec![value])),
            other => Err(CompileError::invalid_operand(
                "store",
                format!("the target must be a variable, got {}", other.tag()),
                input.span,
            )),
        }
    })
}

pub fn register_control_flow(registry: &mut PatternRegistry) -> Result<(), CompileError> {
    registry.register("block", &["block(__1)"], plain(|| PrimitiveKind::Block))?;
    registry.register("parallel_block", &["parallel_block(__1)"], plain(|| PrimitiveKind::ParallelBlock))?;
    registry.register("if", &["if(_1, _2)", "if(_1, _2, _3)"], plain(|| PrimitiveKind::If))?;
    registry.register("while", &["while(_1, _2)"], plain(|| PrimitiveKind::While))?;
    // One lock per node: every evaluation of the same synchronize shares it.
    registry.register(
        "synchronize",
        &["synchronize(_1)"],
        Arc::new(|input: FactoryInput| Ok((PrimitiveKind::Synchronize(Arc::new(AsyncMutex::new())), input.operands))),
    )?;
    registry.register("when_all", &["when_all(__1)"], plain(|| PrimitiveKind::WhenAll))?;
    registry.register("__and", &["__and(_1, _2)"], plain(|| PrimitiveKind::And))?;
    registry.register("__or", &["__or(_1, _2)"], plain(|| PrimitiveKind::Or))?;
    registry.register("store", &["store(_1, _2)"], store_factory())
}

pub fn register_kernels(registry: &mut PatternRegistry) -> Result<(), CompileError> {
    for kernel in BUILTIN_KERNELS {
        registry.register_kernel(Arc::new(*kernel))?;
    }
    Ok(())
}

pub fn register_distributed(registry: &mut PatternRegistry) -> Result<(), CompileError> {
    for op in DistributedOp::ALL {
        let factory: Factory = Arc::new(move |input: FactoryInput| Ok((PrimitiveKind::Distributed(op), input.operands)));
        registry.register(op.name(), op.patterns(), factory)?;
    }
    Ok(())
}

/// Registry with every builtin primitive.
pub fn default_registry() -> Result<PatternRegistry, CompileError> {
    let mut registry = PatternRegistry::new();
    register_control_flow(&mut registry)?;
    register_kernels(&mut registry)?;
    register_distributed(&mut registry)?;
    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Ast;
    use crate::parser::parse;

    #[test]
    fn every_builtin_is_registered_once() {
        let registry = default_registry().unwrap();
        assert_eq!(registry.len(), 9 + BUILTIN_KERNELS.len() + DistributedOp::ALL.len());
        for name in ["block", "if", "store", "__add", "dot", "retile_d", "locality"] {
            assert!(registry.contains(name), "{name}");
        }
        assert!(!registry.contains("define"));
    }

    #[test]
    fn operators_match_their_primitives() {
        let registry = default_registry().unwrap();
        let call = crate::fold::fold_operators(&parse("a <= b").unwrap());
        let m = registry.match_call(&call, None).unwrap().unwrap();
        assert_eq!(m.entry.type_name, "__le");
        assert_eq!(m.args, vec![Ast::ident("a"), Ast::ident("b")]);
    }
}
