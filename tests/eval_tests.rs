// Integration tests: compile and evaluate PhySL snippets end to end

use std::sync::Arc;

use physl::builtins::default_registry;
use physl::error::{CompileErrorKind, EvalErrorKind};
use physl::{compile, Engine, EngineConfig, Environment, Error, Value};

fn engine() -> Engine {
    Engine::new(EngineConfig::default().with_worker_threads(4)).unwrap()
}

// Functions

#[test]
fn test_compiled_function_applied_to_argument() {
    let registry = Arc::new(default_registry().unwrap());
    let env = Environment::new();
    let f = compile("f", "define(f, x, x + 1)", &registry, &env).unwrap();
    assert_eq!(f.run(vec![Value::Int(41)]).get(), Ok(Value::Int(42)));
}

#[test]
fn test_functions_defined_in_one_snippet_called_from_another() {
    let engine = engine();
    engine
        .eval(
            "define(fact, n, if(n <= 1, 1, n * fact(n - 1)))
             define(twice, g, x, g(g(x)))",
        )
        .unwrap();
    assert_eq!(engine.eval("fact(10)").unwrap(), Value::Int(3_628_800));
    assert_eq!(engine.eval("twice(lambda(y, y * 3), 2)").unwrap(), Value::Int(18));
}

#[test]
fn test_closures_capture_their_frame() {
    let engine = engine();
    engine.eval("define(adder, k, lambda(x, x + k))").unwrap();
    assert_eq!(engine.eval("define(add5, adder(5))\nadd5(10)").unwrap(), Value::Int(15));
}

// Sequencing and state

#[test]
fn test_block_stores_in_program_order() {
    let engine = engine();
    engine.eval("define(x, 0)").unwrap();
    assert_eq!(engine.eval("block(store(x, 1), store(x, x + 1), x)").unwrap(), Value::Int(2));
}

#[test]
fn test_parallel_stores_visible_after_join() {
    let engine = engine();
    engine.eval("define(a, 0)\ndefine(b, 0)").unwrap();
    let both = engine.eval("when_all(store(a, 1), store(b, 2))\n(a == 1, b == 2)").unwrap();
    assert_eq!(both, Value::List(vec![Value::Bool(true), Value::Bool(true)]));
}

#[test]
fn test_while_loop_accumulates() {
    let engine = engine();
    let text = "
        define(i, 0)
        define(total, 0)
        while(i < 100, block(store(total, total + i), store(i, i + 1)))
        total
    ";
    assert_eq!(engine.eval(text).unwrap(), Value::Int(4950));
}

// Arrays

#[test]
fn test_array_arithmetic_and_reductions() {
    let engine = engine();
    engine.eval("define(v, [1.0, 2.0, 3.0])").unwrap();
    assert_eq!(engine.eval("sum(v * 2.0)").unwrap(), Value::Float(12.0));
    assert_eq!(engine.eval("dot(v, v)").unwrap(), Value::Float(14.0));
    assert_eq!(
        engine.eval("shape([[1, 2, 3], [4, 5, 6]])").unwrap(),
        Value::List(vec![Value::Int(2), Value::Int(3)])
    );
}

#[test]
fn test_async_operands_give_the_same_answer() {
    let engine = Engine::new(
        EngineConfig::default()
            .with_worker_threads(4)
            .with_async_operands(true),
    )
    .unwrap();
    engine.eval("define(sq, x, x * x)").unwrap();
    assert_eq!(engine.eval("sq(3) + sq(4) + sq(5)").unwrap(), Value::Int(50));
}

#[test]
fn test_while_with_async_operands_runs_many_iterations() {
    let engine = Engine::new(
        EngineConfig::default()
            .with_worker_threads(2)
            .with_async_operands(true),
    )
    .unwrap();
    let text = "
        define(i, 0)
        define(total, 0)
        while(i < 5000, block(store(total, total + i), store(i, i + 1)))
        total
    ";
    assert_eq!(engine.eval(text).unwrap(), Value::Int(12_497_500));
}

// Errors

#[test]
fn test_unbound_name_is_a_compile_error() {
    let err = engine().eval("y + 1").unwrap_err();
    match err {
        Error::Compile(e) => assert_eq!(e.kind, CompileErrorKind::UnboundName("y".into())),
        other => panic!("expected a compile error, got {other:?}"),
    }
}

#[test]
fn test_failed_compile_leaves_environment_untouched() {
    let engine = engine();
    assert!(engine.eval("define(z, 1)\nnope(z)").is_err());
    assert!(engine.environment().lookup("z").is_none());
}

#[test]
fn test_runtime_error_names_its_primitive() {
    let err = engine().eval("define(m, [1, 2])\nm + [1, 2, 3]").unwrap_err();
    let Error::Eval(e) = err else {
        panic!("expected an evaluation error");
    };
    assert!(matches!(e.kind, EvalErrorKind::ShapeMismatch(_)));
    assert!(e.primitive.as_deref().is_some_and(|p| p.starts_with("/physl/__add$")));
}
