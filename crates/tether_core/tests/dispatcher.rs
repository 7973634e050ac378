use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use tether_core::{Dispatcher, EnvConfig, Environment, Reference, ShutdownState, UsageFault, Value};
use tether_script::HeapEngine;

fn spawn_env() -> Environment {
    Environment::spawn(EnvConfig::default(), || Ok(HeapEngine::new())).unwrap()
}

#[test]
fn test_work_enqueued_mid_drain_runs_after_the_batch() {
    let dispatcher = Dispatcher::for_current_thread(4);
    let log = Arc::new(Mutex::new(Vec::new()));

    let (inner, entries) = (dispatcher.clone(), log.clone());
    dispatcher.try_enqueue(Box::new(move || {
        entries.lock().unwrap().push('A');
        let entries = entries.clone();
        inner.try_enqueue(Box::new(move || entries.lock().unwrap().push('D')));
    }));
    for name in ['B', 'C'] {
        let entries = log.clone();
        dispatcher.try_enqueue(Box::new(move || entries.lock().unwrap().push(name)));
    }

    while dispatcher.pending() > 0 {
        dispatcher.pump().unwrap();
    }
    assert_eq!(*log.lock().unwrap(), vec!['A', 'B', 'C', 'D']);
}

#[test]
fn test_submission_order_holds_for_a_foreign_producer() {
    let env = spawn_env();
    let log = Arc::new(Mutex::new(Vec::new()));
    let dispatcher = env.dispatcher().clone();

    let (inner, entries) = (dispatcher.clone(), log.clone());
    dispatcher.try_enqueue(Box::new(move || {
        entries.lock().unwrap().push('A');
        let entries = entries.clone();
        inner.try_enqueue(Box::new(move || entries.lock().unwrap().push('D')));
    }));
    // The loop may drain A before B is queued; only relative order is fixed
    for name in ['B', 'C'] {
        let entries = log.clone();
        dispatcher.try_enqueue(Box::new(move || entries.lock().unwrap().push(name)));
    }
    // Anything queued after A's follow-up runs after it
    dispatcher.run(false, || ()).unwrap();
    dispatcher.run(false, || ()).unwrap();
    env.shutdown().unwrap();

    let log = log.lock().unwrap();
    let position = |c| log.iter().position(|x| *x == c).unwrap();
    assert_eq!(log.len(), 4);
    assert!(position('A') < position('B'));
    assert!(position('B') < position('C'));
    assert!(position('A') < position('D'));
}

#[test]
fn test_shutdown_with_outstanding_deferral_completes_once() {
    let env = spawn_env();
    let dispatcher = env.dispatcher().clone();
    let completions = Arc::new(AtomicUsize::new(0));

    let deferral = dispatcher.create_deferral().unwrap();
    for _ in 0..3 {
        let counter = completions.clone();
        dispatcher.shutdown(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
    }
    assert_eq!(dispatcher.shutdown_state(), ShutdownState::Requested);
    // Still accepting work while the deferral is out
    assert_eq!(dispatcher.run(false, || 5).unwrap(), 5);
    assert_eq!(completions.load(Ordering::SeqCst), 0);

    drop(deferral);
    dispatcher.shutdown_blocking().unwrap();
    assert_eq!(dispatcher.shutdown_state(), ShutdownState::Completed);
    // Each subscriber ran exactly once
    assert_eq!(completions.load(Ordering::SeqCst), 3);

    let counter = completions.clone();
    dispatcher.shutdown(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    assert_eq!(completions.load(Ordering::SeqCst), 4);
    env.shutdown().unwrap();

    assert!(!dispatcher.try_enqueue(Box::new(|| {})));
    assert!(matches!(
        dispatcher.run(false, || ()).unwrap_err().as_usage(),
        Some(UsageFault::DispatcherClosed { .. })
    ));
}

#[test]
fn test_allow_sync_runs_inline_on_owner() {
    let engine = Rc::new(HeapEngine::new());
    let (env, _root) = Environment::attach(engine, EnvConfig::default()).unwrap();
    let dispatcher = env.dispatcher();

    let ran_on = dispatcher.run(true, || thread::current().id()).unwrap();
    assert_eq!(ran_on, thread::current().id());
    assert_eq!(dispatcher.pending(), 0);
    assert!(matches!(
        dispatcher.run(false, || ()).unwrap_err().as_usage(),
        Some(UsageFault::WouldDeadlock { .. })
    ));
}

#[test]
fn test_nested_run_inside_loop_does_not_deadlock() {
    let env = spawn_env();
    let dispatcher = env.dispatcher().clone();
    let inner = dispatcher.clone();
    let value = dispatcher
        .run(false, move || inner.run(true, || 21 * 2))
        .unwrap()
        .unwrap();
    assert_eq!(value, 42);
    env.shutdown().unwrap();
}

#[test]
fn test_foreign_thread_reads_property_through_reference() {
    let env = spawn_env();
    let reference = env
        .run_scoped(|_| {
            let obj = Value::object()?;
            obj.set("answer", &Value::number(42.0)?)?;
            obj.set("name", &Value::string("tether")?)?;
            Reference::new(&obj, false)
        })
        .unwrap();

    let (answer, name) = reference
        .run(|value| Ok((value.get("answer")?.as_f64()?, value.get("name")?.as_string()?)))
        .unwrap()
        .expect("strong target");
    assert_eq!(answer, 42.0);
    assert_eq!(name, "tether");

    // Values resolved for this thread still belong to the engine thread
    let resolved = reference.resolve().unwrap().expect("strong target");
    assert!(resolved.get("answer").unwrap_err().is_wrong_thread());

    reference.dispose().unwrap();
    env.shutdown().unwrap();
}

#[test]
fn test_references_shared_across_threads() {
    let env = spawn_env();
    let reference = Arc::new(
        env.run_scoped(|_| {
            let counter = Value::object()?;
            counter.set("hits", &Value::number(0.0)?)?;
            Reference::new(&counter, false)
        })
        .unwrap(),
    );

    let workers: Vec<_> = (0..4)
        .map(|_| {
            let reference = reference.clone();
            thread::spawn(move || {
                for _ in 0..25 {
                    reference
                        .run(|counter| {
                            let hits = counter.get("hits")?.as_f64()?;
                            counter.set("hits", &Value::number(hits + 1.0)?)
                        })
                        .unwrap();
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    let hits = reference
        .run(|counter| counter.get("hits")?.as_f64())
        .unwrap();
    assert_eq!(hits, Some(100.0));
    drop(reference);
    env.shutdown().unwrap();
}
