//! End-to-end tests for whole-graph execution.

use crate::prelude::*;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn unit(f: impl Fn(&Pipeline) -> UnitStart + Send + Sync + 'static) -> Arc<dyn WorkUnit> {
    Arc::new(FnUnit::new(f))
}

fn noop_unit() -> Arc<dyn WorkUnit> {
    unit(|_| Ok(None))
}

fn value_unit(value: Value) -> Arc<dyn WorkUnit> {
    unit(move |_| Ok(Some(Signal::ready(value.clone()))))
}

fn fail_unit(message: &str) -> Arc<dyn WorkUnit> {
    let message = message.to_string();
    unit(move |_| Err(WorkflowError::message(message.clone())))
}

/// Everything a destination callback observed, for later assertions.
#[derive(Debug, Default)]
struct FinishRecord {
    calls: usize,
    origin_error: Option<String>,
    node_errors: Vec<String>,
    results: HashMap<String, Result<Value, String>>,
}

fn recording_destination(
    record: &Arc<Mutex<FinishRecord>>,
    nodes: &[&str],
) -> impl Destination + 'static {
    let record = Arc::clone(record);
    let nodes: Vec<String> = nodes.iter().map(ToString::to_string).collect();
    destination_fn(move |origin_error, node_errors, results, _context| {
        let mut rec = record.lock();
        rec.calls += 1;
        rec.origin_error = origin_error.map(ToString::to_string);
        rec.node_errors = node_errors.iter().map(ToString::to_string).collect();
        for name in &nodes {
            rec.results.insert(
                name.clone(),
                results.get_result(name).map_err(|e| e.to_string()),
            );
        }
        Ok(())
    })
}

#[tokio::test]
async fn test_scenario_single_success_with_dependent() {
    // origin succeeds with 42; B depends on origin and returns 43
    let record = Arc::new(Mutex::new(FinishRecord::default()));
    let graph = WorkflowGraph::new(
        unit(|pipeline| {
            pipeline.add_child_node("B", Value::Null, vec![value_unit(json!(43))]);
            Ok(Some(Signal::ready(json!(42))))
        }),
        recording_destination(&record, &[ORIGIN_NODE, "B"]),
    );

    graph.start(Duration::from_secs(5)).await;

    let rec = record.lock();
    assert_eq!(rec.calls, 1);
    assert_eq!(rec.origin_error, None);
    assert!(rec.node_errors.is_empty());
    assert_eq!(rec.results[ORIGIN_NODE], Ok(json!(42)));
    assert_eq!(rec.results["B"], Ok(json!(43)));
}

#[tokio::test]
async fn test_scenario_origin_failure_skips_dependents() {
    let b_started = Arc::new(AtomicUsize::new(0));
    let b_probe = Arc::clone(&b_started);
    let b_wrapper = Arc::new(Mutex::new(None::<bool>));
    let b_sink = Arc::clone(&b_wrapper);

    let record = Arc::new(Mutex::new(FinishRecord::default()));
    let rec_sink = Arc::clone(&record);
    let graph = WorkflowGraph::new(
        unit(move |pipeline| {
            let b_probe = Arc::clone(&b_probe);
            pipeline.add_node(
                "B",
                &[],
                Value::Null,
                vec![unit(move |_| {
                    b_probe.fetch_add(1, Ordering::SeqCst);
                    Ok(None)
                })],
            );
            Err(WorkflowError::message("origin blew up"))
        }),
        destination_fn(move |origin_error, node_errors, results, _context| {
            let mut rec = rec_sink.lock();
            rec.calls += 1;
            rec.origin_error = origin_error.map(ToString::to_string);
            rec.node_errors = node_errors.iter().map(ToString::to_string).collect();
            *b_sink.lock() = results.has_failed("B").map(|e| e.is_dependency_failure());
            Ok(())
        }),
    );

    graph.start(Duration::from_secs(5)).await;

    let rec = record.lock();
    assert_eq!(rec.calls, 1);
    assert_eq!(rec.origin_error.as_deref(), Some("origin blew up"));
    // B's dependency failure is bookkeeping, not a root cause
    assert!(rec.node_errors.is_empty());
    assert_eq!(b_started.load(Ordering::SeqCst), 0);
    assert_eq!(*b_wrapper.lock(), Some(true));
}

#[tokio::test]
async fn test_scenario_failure_inside_nested_sub_batch() {
    // B spawns a sub-batch of two stages and the second one fails; the
    // sub-batch tail error becomes the enclosing stage's and the node's
    let record = Arc::new(Mutex::new(FinishRecord::default()));
    let graph = WorkflowGraph::new(
        unit(|pipeline| {
            pipeline.add_node(
                "B",
                &[],
                Value::Null,
                vec![unit(|pipeline| {
                    pipeline.add_stage(Value::Null, vec![noop_unit(), fail_unit("sub-batch boom")]);
                    Ok(None)
                })],
            );
            Ok(None)
        }),
        recording_destination(&record, &["B"]),
    );

    graph.start(Duration::from_secs(5)).await;

    let rec = record.lock();
    assert_eq!(rec.calls, 1);
    assert_eq!(rec.origin_error, None);
    assert_eq!(rec.node_errors, vec!["sub-batch boom".to_string()]);
    assert_eq!(rec.results["B"], Err("sub-batch boom".to_string()));
}

#[tokio::test]
async fn test_scenario_timeout_sweep_forces_origin_failure() {
    init_tracing();

    let record = Arc::new(Mutex::new(FinishRecord::default()));
    let registry = Arc::new(GraphRegistry::new());
    let sweeper = TimeoutSweeper::new(Arc::clone(&registry), Duration::from_millis(20));
    sweeper.start();

    // the origin's signal is never completed
    let graph = WorkflowGraph::builder(
        unit(|_| Ok(Some(Signal::Deferred(Arc::new(AsyncSignal::new()))))),
        recording_destination(&record, &[]),
    )
    .registry(Arc::clone(&registry))
    .build();

    graph.start(Duration::from_millis(10)).await;

    let rec = record.lock();
    assert_eq!(rec.calls, 1);
    assert!(
        rec.origin_error
            .as_deref()
            .is_some_and(|e| e.contains("timed out")),
        "expected a timeout error, got {:?}",
        rec.origin_error
    );
    assert!(registry.is_empty());
    sweeper.shutdown();
}

#[tokio::test]
async fn test_scenario_dynamic_node_on_completed_dependency() {
    // C is added with a dependency on the already-completed A; it starts
    // right away, and the destination still waits for it
    let c_started = Arc::new(AtomicBool::new(false));
    let c_probe = Arc::clone(&c_started);

    let record = Arc::new(Mutex::new(FinishRecord::default()));
    let graph = WorkflowGraph::new(
        unit(move |pipeline| {
            pipeline.add_node("A", &[], Value::Null, vec![value_unit(json!("a"))]);
            let c_probe = Arc::clone(&c_probe);
            pipeline.add_node(
                "B",
                &["A"],
                Value::Null,
                vec![unit(move |pipeline| {
                    let for_unit = Arc::clone(&c_probe);
                    pipeline.add_node_after(
                        "C",
                        "A",
                        Value::Null,
                        vec![unit(move |_| {
                            for_unit.store(true, Ordering::SeqCst);
                            Ok(Some(Signal::spawn(async {
                                tokio::time::sleep(Duration::from_millis(20)).await;
                                Ok(json!("c"))
                            })))
                        })],
                    );
                    // the spawning node is itself a predecessor of C, so C
                    // cannot start until this unit's node completes
                    assert!(!c_probe.load(Ordering::SeqCst));
                    Ok(None)
                })],
            );
            Ok(None)
        }),
        recording_destination(&record, &["C"]),
    );

    graph.start(Duration::from_secs(5)).await;

    let rec = record.lock();
    assert_eq!(rec.calls, 1);
    assert_eq!(rec.results["C"], Ok(json!("c")));
    assert!(c_started.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_batch_order_waits_for_sub_batches() {
    let events = Arc::new(Mutex::new(Vec::<&'static str>::new()));

    let push = |label: &'static str, events: &Arc<Mutex<Vec<&'static str>>>| {
        let events = Arc::clone(events);
        move || events.lock().push(label)
    };

    let e1 = push("u1", &events);
    let e2 = push("u2", &events);
    let s1 = push("s1", &events);
    let s2 = push("s2", &events);

    let u1 = unit(move |pipeline| {
        e1();
        let s1 = s1.clone();
        let s2 = s2.clone();
        pipeline.add_stage(
            Value::Null,
            vec![
                unit(move |_| {
                    s1();
                    Ok(Some(Signal::spawn(async {
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Ok(Value::Null)
                    })))
                }),
                unit(move |_| {
                    s2();
                    Ok(None)
                }),
            ],
        );
        Ok(None)
    });
    let u2 = unit(move |_| {
        e2();
        Ok(None)
    });

    let graph = WorkflowGraph::new(
        unit(move |pipeline| {
            pipeline.add_node("B", &[], Value::Null, vec![Arc::clone(&u1), Arc::clone(&u2)]);
            Ok(None)
        }),
        destination_fn(move |_, _, _, _| Ok(())),
    );

    graph.start(Duration::from_secs(5)).await;

    assert_eq!(*events.lock(), vec!["u1", "s1", "s2", "u2"]);
}

#[tokio::test]
async fn test_node_waits_for_every_dependency() {
    let events = Arc::new(Mutex::new(Vec::<&'static str>::new()));

    let slow = |label: &'static str, delay_ms: u64, events: &Arc<Mutex<Vec<&'static str>>>| {
        let events = Arc::clone(events);
        unit(move |_| {
            let events = Arc::clone(&events);
            Ok(Some(Signal::spawn(async move {
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                events.lock().push(label);
                Ok(Value::Null)
            })))
        })
    };

    let a = slow("A-done", 10, &events);
    let b = slow("B-done", 30, &events);
    let d_events = Arc::clone(&events);
    let d = unit(move |_| {
        d_events.lock().push("D");
        Ok(None)
    });

    let graph = WorkflowGraph::new(
        unit(move |pipeline| {
            pipeline.add_node("A", &[], Value::Null, vec![Arc::clone(&a)]);
            pipeline.add_node("B", &[], Value::Null, vec![Arc::clone(&b)]);
            pipeline.add_node("D", &["A", "B"], Value::Null, vec![Arc::clone(&d)]);
            Ok(None)
        }),
        destination_fn(|_, _, _, _| Ok(())),
    );

    graph.start(Duration::from_secs(5)).await;

    let seen = events.lock();
    let d_pos = seen.iter().position(|e| *e == "D");
    assert!(d_pos > seen.iter().position(|e| *e == "A-done"));
    assert!(d_pos > seen.iter().position(|e| *e == "B-done"));
}

#[tokio::test]
async fn test_failure_cascades_down_the_chain() {
    let started = Arc::new(AtomicUsize::new(0));
    let probe = |started: &Arc<AtomicUsize>| {
        let started = Arc::clone(started);
        unit(move |_| {
            started.fetch_add(1, Ordering::SeqCst);
            Ok(None)
        })
    };

    let b_unit = probe(&started);
    let c_unit = probe(&started);
    let c_wrapper = Arc::new(Mutex::new(None::<(bool, String)>));
    let c_sink = Arc::clone(&c_wrapper);

    let record = Arc::new(Mutex::new(FinishRecord::default()));
    let rec_sink = Arc::clone(&record);
    let graph = WorkflowGraph::new(
        unit(move |pipeline| {
            pipeline.add_node("A", &[], Value::Null, vec![fail_unit("root boom")]);
            pipeline.add_node("B", &["A"], Value::Null, vec![Arc::clone(&b_unit)]);
            pipeline.add_node("C", &["B"], Value::Null, vec![Arc::clone(&c_unit)]);
            Ok(None)
        }),
        destination_fn(move |origin_error, node_errors, results, _context| {
            let mut rec = rec_sink.lock();
            rec.calls += 1;
            rec.origin_error = origin_error.map(ToString::to_string);
            rec.node_errors = node_errors.iter().map(ToString::to_string).collect();
            if let Some(error) = results.has_failed("C") {
                *c_sink.lock() = Some((error.is_dependency_failure(), error.to_string()));
            }
            Ok(())
        }),
    );

    graph.start(Duration::from_secs(5)).await;

    let rec = record.lock();
    assert_eq!(rec.calls, 1);
    assert_eq!(rec.origin_error, None);
    // only the root cause is reported, not the two cascaded wrappers
    assert_eq!(rec.node_errors, vec!["root boom".to_string()]);
    assert_eq!(started.load(Ordering::SeqCst), 0);

    // the wrapper that reached C still names A, the node that actually failed
    let c = c_wrapper.lock();
    let (is_wrapper, text) = c.as_ref().expect("C should have failed");
    assert!(is_wrapper);
    assert!(text.contains("dependency A failed"));
}

#[tokio::test]
async fn test_accept_previous_failure_runs_and_recovers() {
    let record = Arc::new(Mutex::new(FinishRecord::default()));
    let recover = Arc::new(
        FnUnit::new(|pipeline: &Pipeline| {
            let failure = pipeline.previous_failed();
            assert!(failure.is_some_and(|e| e.to_string() == "first boom"));
            Ok(Some(Signal::ready(json!(7))))
        })
        .with_accept_previous_failure(true),
    );

    let graph = WorkflowGraph::new(
        unit(move |pipeline| {
            pipeline.add_node(
                "B",
                &[],
                Value::Null,
                vec![fail_unit("first boom"), Arc::clone(&recover) as Arc<dyn WorkUnit>],
            );
            Ok(None)
        }),
        recording_destination(&record, &["B"]),
    );

    graph.start(Duration::from_secs(5)).await;

    let rec = record.lock();
    // the node's outcome is the last stage's, which recovered
    assert!(rec.node_errors.is_empty());
    assert_eq!(rec.results["B"], Ok(json!(7)));
}

#[tokio::test]
async fn test_inherit_previous_failure_keeps_root_error() {
    let record = Arc::new(Mutex::new(FinishRecord::default()));
    let inheriting =
        Arc::new(FnUnit::new(|_: &Pipeline| Ok(None)).with_inherit_previous_failure(true));

    let graph = WorkflowGraph::new(
        unit(move |pipeline| {
            // B inherits: its node error stays the root cause
            pipeline.add_node(
                "B",
                &[],
                Value::Null,
                vec![fail_unit("boom"), Arc::clone(&inheriting) as Arc<dyn WorkUnit>],
            );
            // C wraps by default: its node error is propagation bookkeeping
            pipeline.add_node(
                "C",
                &[],
                Value::Null,
                vec![fail_unit("other boom"), noop_unit()],
            );
            Ok(None)
        }),
        recording_destination(&record, &["B"]),
    );

    graph.start(Duration::from_secs(5)).await;

    let rec = record.lock();
    // B's inherited error is a root cause; C's wrapper is filtered out
    assert_eq!(rec.node_errors, vec!["boom".to_string()]);
    assert_eq!(rec.results["B"], Err("boom".to_string()));
}

#[tokio::test]
async fn test_stage_data_and_previous_value_flow() {
    let graph = WorkflowGraph::new(
        unit(|pipeline| {
            pipeline.add_node(
                "B",
                &[],
                json!({"shared": true}),
                vec![
                    unit(|pipeline| {
                        assert_eq!(pipeline.param(), json!({"shared": true}));
                        pipeline.set_data(json!("handoff"));
                        Ok(Some(Signal::ready(json!(1))))
                    }),
                    unit(|pipeline| {
                        assert!(matches!(pipeline.previous_value(), Ok(v) if v == json!(1)));
                        assert_eq!(pipeline.previous_data(), json!("handoff"));
                        assert!(pipeline.previous_failed().is_none());
                        Ok(None)
                    }),
                ],
            );
            assert!(pipeline.contains_node("B"));
            assert!(!pipeline.contains_node("missing"));
            Ok(None)
        }),
        destination_fn(|_, _, _, _| Ok(())),
    );

    graph.start(Duration::from_secs(5)).await;
    assert!(graph.is_completed());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_destination_fires_exactly_once_under_concurrency() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);

    let graph = WorkflowGraph::new(
        unit(|pipeline| {
            for (i, delay) in [7u64, 3, 11, 5].into_iter().enumerate() {
                pipeline.add_node(
                    &format!("P{i}"),
                    &[],
                    Value::Null,
                    vec![unit(move |_| {
                        Ok(Some(Signal::spawn(async move {
                            tokio::time::sleep(Duration::from_millis(delay)).await;
                            Ok(Value::Null)
                        })))
                    })],
                );
            }
            Ok(None)
        }),
        destination_fn(move |_, _, results, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            for i in 0..4 {
                assert!(results.has_completed(&format!("P{i}")));
            }
            Ok(())
        }),
    );

    graph.start(Duration::from_secs(5)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_late_signal_after_timeout_is_ignored() {
    let handle = Arc::new(AsyncSignal::new());
    let stuck = Arc::clone(&handle);

    let record = Arc::new(Mutex::new(FinishRecord::default()));
    let registry = Arc::new(GraphRegistry::new());
    let graph = WorkflowGraph::builder(
        unit(move |_| Ok(Some(Signal::Deferred(Arc::clone(&stuck))))),
        recording_destination(&record, &[ORIGIN_NODE]),
    )
    .registry(Arc::clone(&registry))
    .build();

    let completion = graph.start(Duration::from_millis(10));
    tokio::time::sleep(Duration::from_millis(30)).await;
    registry.sweep(Instant::now());
    completion.await;

    // the real completion arrives after the sweep; the recorded timeout stands
    handle.success(json!("too late"));

    let rec = record.lock();
    assert_eq!(rec.calls, 1);
    assert!(rec.results[ORIGIN_NODE]
        .as_ref()
        .is_err_and(|e| e.contains("timed out")));
}

#[tokio::test]
async fn test_destination_error_is_swallowed() {
    let graph = WorkflowGraph::new(
        noop_unit(),
        destination_fn(|_, _, _, _| Err(anyhow::anyhow!("destination blew up"))),
    );

    // the completion future still resolves
    graph.start(Duration::from_secs(5)).await;
    assert!(graph.is_completed());
}

#[tokio::test]
async fn test_origin_with_no_result_reports_null() {
    let record = Arc::new(Mutex::new(FinishRecord::default()));
    let graph = WorkflowGraph::new(noop_unit(), recording_destination(&record, &[ORIGIN_NODE]));

    graph.start(Duration::from_secs(5)).await;

    assert_eq!(record.lock().results[ORIGIN_NODE], Ok(Value::Null));
}

#[tokio::test]
#[should_panic(expected = "batch must contain at least one work unit")]
async fn test_empty_batch_panics() {
    let graph = WorkflowGraph::new(
        unit(|pipeline| {
            pipeline.add_node("B", &[], Value::Null, vec![]);
            Ok(None)
        }),
        destination_fn(|_, _, _, _| Ok(())),
    );
    graph.start(Duration::from_secs(5)).await;
}
