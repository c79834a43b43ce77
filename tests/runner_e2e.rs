//! End-to-end tests of the circuit runner: phases, initialization,
//! supervision and shutdown.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;

use kyrocircuit::blocklib::{Counter, Memory};
use kyrocircuit::{
    Block, BlockLogic, Circuit, CircuitError, CircuitPhase, CircuitResult, ErrorKind, EventData,
    HandlerTable, InitFunction, InitTask, InitValue, Job, Value,
};

/// Routes runtime diagnostics to the test output; `RUST_LOG=kyrocircuit=debug` to see them.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A job that shuts the circuit down as soon as it runs.
fn stop_when_running(circuit: &Circuit) -> Job {
    let circuit = circuit.clone();
    Job::new("stopper", move |token| async move {
        circuit.wait_for(CircuitPhase::Running).await;
        circuit.shutdown();
        token.cancelled().await;
        Ok(())
    })
}

#[tokio::test]
async fn test_phases_are_monotonic() {
    init_tracing();
    let circuit = Circuit::new();
    Block::builder("m").initial_value(1).build(&circuit, Memory).unwrap();

    let mut rx = circuit.subscribe_phase();
    let observer = tokio::spawn(async move {
        let mut seen = vec![*rx.borrow_and_update()];
        while rx.changed().await.is_ok() {
            let phase = *rx.borrow_and_update();
            seen.push(phase);
            if phase == CircuitPhase::Closed {
                break;
            }
        }
        seen
    });

    circuit.run([stop_when_running(&circuit)]).await.unwrap();
    let seen = observer.await.unwrap();
    assert!(seen.windows(2).all(|w| w[0] < w[1]), "phases went backwards: {seen:?}");
    assert_eq!(seen.first(), Some(&CircuitPhase::UnderConstruction));
    assert_eq!(seen.last(), Some(&CircuitPhase::Closed));
}

#[tokio::test]
async fn test_construction_errors() {
    let circuit = Circuit::new();
    Block::builder("x").initial_value(0).build(&circuit, Memory).unwrap();
    let err = Block::builder("x").build(&circuit, Counter::new()).unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::DuplicateName { .. }));
    assert!(circuit.errors().is_empty());

    let runner = circuit.clone();
    let handle = tokio::spawn(async move { runner.run([]).await });
    circuit.wait_for(CircuitPhase::Running).await;
    let err = Block::builder("late").build(&circuit, Memory).unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::PhaseViolation { .. }));
    circuit.shutdown();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_failing_initializers_are_skipped() {
    let circuit = Circuit::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let failing = |calls: Arc<AtomicUsize>| {
        InitFunction::new(move || {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(CircuitError::failed("no data"))
        })
    };
    let block = Block::builder("m")
        .initial(failing(calls.clone()))
        .initial(failing(calls.clone()))
        .initial(InitValue::new(0))
        .build(&circuit, Memory)
        .unwrap();

    circuit.run([stop_when_running(&circuit)]).await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(block.output().into_value(), Some(Value::Int(0)));
}

#[tokio::test]
async fn test_uninitialized_blocks_are_all_named() {
    let circuit = Circuit::new();
    for name in ["first", "second"] {
        Block::builder(name)
            .initial(InitFunction::new(|| Err(CircuitError::failed("no data"))))
            .build(&circuit, Memory)
            .unwrap();
    }
    Block::builder("fine").initial_value(1).build(&circuit, Memory).unwrap();

    let err = circuit.run([]).await.unwrap_err();
    let names = err
        .errors
        .iter()
        .find_map(|e| match e.kind() {
            ErrorKind::NotInitialized { names } => Some(names.clone()),
            _ => None,
        })
        .expect("a NotInitialized error");
    assert_eq!(names, vec!["first".to_string(), "second".to_string()]);
    assert_eq!(circuit.phase(), CircuitPhase::Closed);
}

#[tokio::test(start_paused = true)]
async fn test_async_initializer_timeout_falls_through() {
    let circuit = Circuit::new();
    let block = Block::builder("m")
        .initial(
            InitTask::new(|| async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(Some(Value::Int(1)))
            })
            .timeout(Duration::from_millis(100)),
        )
        .initial(InitValue::new(2))
        .build(&circuit, Memory)
        .unwrap();

    circuit.run([stop_when_running(&circuit)]).await.unwrap();
    assert_eq!(block.output().into_value(), Some(Value::Int(2)));
}

struct SlowStop {
    stopped: Arc<AtomicUsize>,
}

impl BlockLogic for SlowStop {
    const TYPE_NAME: &'static str = "SlowStop";
    const ASYNC_STOP: bool = true;

    fn astop<'a>(&'a self, _block: &'a Block) -> BoxFuture<'a, CircuitResult<()>> {
        Box::pin(async move {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            self.stopped.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }
}

#[tokio::test(start_paused = true)]
async fn test_async_stop_deadline_only_warns() {
    init_tracing();
    let circuit = Circuit::new();
    let stopped = Arc::new(AtomicUsize::new(0));
    let block = Block::builder("slow")
        .stop_timeout(Duration::from_millis(50))
        .build(&circuit, SlowStop { stopped: stopped.clone() })
        .unwrap();
    assert_eq!(block.stop_timeout(), Some(Duration::from_millis(50)));

    circuit.run([stop_when_running(&circuit)]).await.unwrap();
    assert_eq!(stopped.load(Ordering::SeqCst), 0);
    assert_eq!(circuit.phase(), CircuitPhase::Closed);
}

struct FailingStop;

impl BlockLogic for FailingStop {
    const TYPE_NAME: &'static str = "FailingStop";

    fn stop(&self, _block: &Block) -> CircuitResult<()> {
        Err(CircuitError::failed("stop failed"))
    }
}

struct FailingClose;

impl BlockLogic for FailingClose {
    const TYPE_NAME: &'static str = "FailingClose";

    fn close(&self, _block: &Block) -> CircuitResult<()> {
        Err(CircuitError::failed("close failed"))
    }
}

#[tokio::test]
async fn test_shutdown_failures_are_all_reported_once() {
    init_tracing();
    let circuit = Circuit::new();
    Block::builder("a").build(&circuit, FailingStop).unwrap();
    Block::builder("b").build(&circuit, FailingClose).unwrap();

    let err = circuit.run([stop_when_running(&circuit)]).await.unwrap_err();
    let messages: Vec<String> = err.errors.iter().map(|e| e.kind().to_string()).collect();
    assert_eq!(messages.len(), 2, "{messages:?}");
    assert_eq!(messages.iter().filter(|m| *m == "stop failed").count(), 1);
    assert_eq!(messages.iter().filter(|m| *m == "close failed").count(), 1);
}

struct Echo;

impl BlockLogic for Echo {
    const TYPE_NAME: &'static str = "Echo";

    fn handlers(table: &mut HandlerTable<Self>) {
        table.on("ping", |_, block, data| block.event("ping", data.clone()));
    }
}

#[tokio::test]
async fn test_reentrant_event_aborts_the_circuit() {
    let circuit = Circuit::new();
    let echo = Block::builder("echo").build(&circuit, Echo).unwrap();

    let observed = Arc::new(std::sync::Mutex::new(None));
    let seen = observed.clone();
    let worker = circuit.clone();
    let job = Job::new("pinger", move |token| async move {
        worker.wait_for(CircuitPhase::Running).await;
        let err = echo.event("ping", EventData::new()).unwrap_err();
        *seen.lock().unwrap() = Some((err.is_reentrancy(), worker.phase()));
        token.cancelled().await;
        Ok(())
    });

    let err = circuit.run([job]).await.unwrap_err();
    assert_eq!(
        *observed.lock().unwrap(),
        Some((true, CircuitPhase::ShuttingDown))
    );
    assert!(err.any(kyrocircuit::CircuitError::is_reentrancy));
}

#[tokio::test]
async fn test_events_refused_after_shutdown() {
    let circuit = Circuit::new();
    let m = Block::builder("m").initial_value(1).build(&circuit, Memory).unwrap();
    circuit.run([stop_when_running(&circuit)]).await.unwrap();

    let err = m.event("store", EventData::from_value(2)).unwrap_err();
    assert!(err.is_shut_down());
    assert_eq!(m.event("_get_output", EventData::new()).unwrap(), Value::Int(1));
}

#[tokio::test]
async fn test_service_ending_early_aborts() {
    let circuit = Circuit::new();
    Block::builder("m").initial_value(1).build(&circuit, Memory).unwrap();
    circuit
        .create_service("quitter", |_| async { Ok(()) }, false, true)
        .unwrap();

    let err = circuit.run([]).await.unwrap_err();
    assert!(err.any(|e| matches!(e.kind(), ErrorKind::ServiceTerminated { .. })));
}

#[tokio::test]
async fn test_deferred_service_never_starts_after_failed_init() {
    let circuit = Circuit::new();
    Block::builder("m")
        .initial(InitFunction::new(|| Ok(None)))
        .build(&circuit, Memory)
        .unwrap();
    let started = Arc::new(AtomicUsize::new(0));
    let counter = started.clone();
    circuit
        .create_service(
            "late",
            move |token| async move {
                counter.fetch_add(1, Ordering::SeqCst);
                token.cancelled().await;
                Ok(())
            },
            false,
            true,
        )
        .unwrap();

    let err = circuit.run([]).await.unwrap_err();
    assert_eq!(err.errors.len(), 1);
    assert_eq!(started.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_phase_unit_follows_the_circuit() {
    let circuit = Circuit::new();
    let phase = circuit.resolve("_phase").unwrap();
    let runner = circuit.clone();
    let handle = tokio::spawn(async move { runner.run([]).await });

    circuit.wait_for(CircuitPhase::Running).await;
    assert_eq!(phase.output().into_value(), Some(Value::from("running")));
    circuit.shutdown();
    handle.await.unwrap().unwrap();
    assert_eq!(phase.output().into_value(), Some(Value::from("closed")));
    assert!(circuit.runtime() > Duration::ZERO);
}

/// A job storing `rounds` values into `target`; the last writer to finish shuts down.
fn busy_writer(
    circuit: &Circuit,
    id: usize,
    target: Block,
    rounds: i64,
    remaining: Arc<AtomicUsize>,
) -> Job {
    let circuit = circuit.clone();
    Job::new(format!("writer_{id}"), move |token| async move {
        circuit.wait_for(CircuitPhase::Running).await;
        for i in 0..rounds {
            target.event("store", EventData::from_value(i))?;
            if i % 16 == 0 {
                tokio::task::yield_now().await;
            }
        }
        if remaining.fetch_sub(1, Ordering::SeqCst) == 1 {
            circuit.shutdown();
        }
        token.cancelled().await;
        Ok(())
    })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_events_take_turns() {
    init_tracing();
    let circuit = Circuit::new();
    let m = Block::builder("m").initial_value(0).build(&circuit, Memory).unwrap();

    let remaining = Arc::new(AtomicUsize::new(4));
    let jobs: Vec<Job> = (0..4)
        .map(|id| busy_writer(&circuit, id, m.clone(), 500, remaining.clone()))
        .collect();

    circuit.run(jobs).await.unwrap();
    assert!(circuit.errors().is_empty());
    assert!(m.output().is_defined());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_inputs_are_not_a_dependency_loop() {
    init_tracing();
    let circuit = Circuit::new();
    let a = Block::builder("a").initial_value(0).build(&circuit, Memory).unwrap();
    let b = Block::builder("b").initial_value(0).build(&circuit, Memory).unwrap();
    let sum = kyrocircuit::Formula::builder("sum")
        .inputs([&a, &b])
        .build(&circuit, |v| {
            let total: i64 = v.values().iter().filter_map(Value::as_int).sum();
            Ok(Value::Int(total))
        })
        .unwrap();

    let remaining = Arc::new(AtomicUsize::new(2));
    let jobs = [
        busy_writer(&circuit, 0, a.clone(), 500, remaining.clone()),
        busy_writer(&circuit, 1, b.clone(), 500, remaining),
    ];

    circuit.run(jobs).await.unwrap();
    assert_eq!(sum.output().into_value(), Some(Value::Int(998)));
}
