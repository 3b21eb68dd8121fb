// Integration tests: PhySL programs running on a LocalCluster, one engine
// per locality, each on its own thread

use std::sync::Arc;
use std::thread;

use physl::annotation::Axis;
use physl::error::EvalErrorKind;
use physl::{Communicator, Engine, EngineConfig, Error, LocalCluster, Value};

/// Evaluate `program(locality)` on every locality of an `n`-locality cluster.
fn run_cluster<F>(n: usize, program: F) -> Vec<physl::Result<Value>>
where
    F: Fn(usize) -> String + Send + Sync + 'static,
{
    let cluster = LocalCluster::new(n);
    let program = Arc::new(program);
    let handles: Vec<_> = cluster
        .localities()
        .into_iter()
        .enumerate()
        .map(|(id, locality)| {
            let program = Arc::clone(&program);
            thread::spawn(move || {
                let communicator: Arc<dyn Communicator> = Arc::new(locality);
                let engine = Engine::new(EngineConfig::default())?.with_communicator(communicator);
                engine.eval(&program(id))
            })
        })
        .collect();
    handles.into_iter().map(|h| h.join().unwrap()).collect()
}

fn float_list(range: std::ops::Range<usize>) -> String {
    let items: Vec<String> = range.map(|i| format!("{i}.0")).collect();
    format!("[{}]", items.join(", "))
}

const OLD: [(usize, usize); 3] = [(0, 5), (5, 9), (9, 13)];
const NEW: [(usize, usize); 3] = [(0, 4), (4, 9), (9, 13)];

#[test]
fn test_retile_thirteen_elements_over_three_localities() {
    let results = run_cluster(3, |me| {
        let (start, stop) = OLD[me];
        let (a, b) = NEW[me];
        format!(
            "define(v, annotate_d({data}, \"v\", (\"tile\", (\"columns\", {start}, {stop}))))
             retile_d(v, (\"tile\", (\"columns\", {a}, {b})))",
            data = float_list(start..stop)
        )
    });
    let mut all = Vec::new();
    for (me, result) in results.into_iter().enumerate() {
        let value = result.unwrap();
        let annotation = value.annotation().unwrap();
        assert_eq!(annotation.locality, me);
        assert_eq!(annotation.num_localities, 3);
        let span = annotation.span(Axis::Columns).unwrap();
        assert_eq!((span.start, span.stop), NEW[me]);
        all.extend(value.as_array().unwrap().storage().to_f64());
    }
    let expected: Vec<f64> = (0..13).map(|i| i as f64).collect();
    assert_eq!(all, expected);
}

#[test]
fn test_all_gather_after_retile_restores_the_whole_vector() {
    let results = run_cluster(3, |me| {
        let (start, stop) = OLD[me];
        let (a, b) = NEW[me];
        format!(
            "define(v, annotate_d({data}, \"w\", (\"tile\", (\"columns\", {start}, {stop}))))
             all_gather_d(retile_d(v, (\"tile\", (\"columns\", {a}, {b}))))",
            data = float_list(start..stop)
        )
    });
    let expected = Value::vector((0..13).map(|i| i as f64).collect::<Vec<_>>());
    for result in results {
        assert_eq!(result.unwrap(), expected);
    }
}

#[test]
fn test_retile_joins_pieces_in_global_order() {
    // Locality 0 holds the upper half, so locality order differs from
    // span order.
    const FROM: [(usize, usize); 2] = [(5, 10), (0, 5)];
    const TO: [(usize, usize); 2] = [(0, 10), (10, 10)];
    let results = run_cluster(2, |me| {
        let (start, stop) = FROM[me];
        let (a, b) = TO[me];
        format!(
            "define(v, annotate_d({data}, \"p\", (\"tile\", (\"columns\", {start}, {stop}))))
             retile_d(v, (\"tile\", (\"columns\", {a}, {b})))",
            data = float_list(start..stop)
        )
    });
    let values: Vec<Value> = results.into_iter().map(|r| r.unwrap()).collect();
    let expected: Vec<f64> = (0..10).map(|i| i as f64).collect();
    assert_eq!(values[0].as_array().unwrap().storage().to_f64(), expected);
    assert!(values[1].as_array().unwrap().storage().to_f64().is_empty());
    let span = values[1].annotation().unwrap().span(Axis::Columns).unwrap();
    assert_eq!((span.start, span.stop), (10, 10));
}

#[test]
fn test_distributed_dot_product() {
    let results = run_cluster(2, |me| {
        let (start, stop) = [(0, 2), (2, 4)][me];
        format!(
            "define(x, annotate_d({data}, \"x\", (\"tile\", (\"columns\", {start}, {stop}))))
             define(y, annotate_d({data}, \"y\", (\"tile\", (\"columns\", {start}, {stop}))))
             dot_d(x, y)",
            data = float_list(start..stop)
        )
    });
    for result in results {
        // 0^2 + 1^2 + 2^2 + 3^2
        assert_eq!(result.unwrap(), Value::Float(14.0));
    }
}

#[test]
fn test_locality_introspection() {
    let results = run_cluster(2, |_| "(locality(), num_localities())".to_string());
    for (me, result) in results.into_iter().enumerate() {
        assert_eq!(
            result.unwrap(),
            Value::List(vec![Value::Int(me as i64), Value::Int(2)])
        );
    }
}

#[test]
fn test_overlapping_tiles_fail_on_every_locality() {
    let results = run_cluster(2, |me| {
        let start = me * 2;
        format!(
            "annotate_d([1, 2, 3], \"bad\", (\"tile\", (\"columns\", {start}, {})))",
            start + 3
        )
    });
    for result in results {
        match result {
            Err(Error::Eval(e)) => assert!(matches!(e.kind, EvalErrorKind::DistributionInvariantViolation(_))),
            other => panic!("expected a distribution error, got {other:?}"),
        }
    }
}
