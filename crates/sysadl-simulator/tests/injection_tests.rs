//! Event injection timing, batches and lifecycle hooks

use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use sysadl_simulator::{
    BatchInjection, BatchMode, ConfigDefaults, EngineConfig, EngineError, EventDefinition,
    InjectionOptions, InjectionStatus, InjectionTiming, LifecycleRef, ParameterType,
    SimulationEngine, Task,
};
use tokio::time::{sleep, Instant};

type Journal = Arc<Mutex<Vec<String>>>;

fn engine_with(events: &[&str]) -> (SimulationEngine, Journal) {
    let engine = SimulationEngine::with_config(EngineConfig::testing_defaults()).unwrap();
    let journal: Journal = Arc::default();
    for event in events {
        engine.register_event(EventDefinition::new(*event)).unwrap();
        let sink = journal.clone();
        engine
            .register_task(Task::sync(format!("record_{event}"), *event, move |tc| {
                sink.lock().push(tc.event().to_string());
                Ok(Value::Null)
            }))
            .unwrap();
    }
    (engine, journal)
}

fn detached() -> InjectionOptions {
    InjectionOptions {
        detach: true,
        ..InjectionOptions::default()
    }
}

#[tokio::test(start_paused = true)]
async fn immediate_injection_is_delivered() {
    let (engine, journal) = engine_with(&["Ping"]);
    let outcome = engine
        .inject_event("Ping", json!({}), InjectionTiming::Immediate, InjectionOptions::default())
        .await
        .unwrap();

    assert_eq!(outcome.status, InjectionStatus::Delivered);
    assert!(outcome.report.unwrap().all_succeeded());
    assert_eq!(*journal.lock(), vec!["Ping"]);
}

#[tokio::test(start_paused = true)]
async fn delay_is_never_delivered_early() {
    let (engine, journal) = engine_with(&["Ping"]);
    let outcome = engine
        .inject_event("Ping", Value::Null, InjectionTiming::delay(250), detached())
        .await
        .unwrap();
    assert_eq!(outcome.status, InjectionStatus::Scheduled);
    assert_eq!(outcome.delay_ms, Some(250));

    sleep(Duration::from_millis(249)).await;
    assert!(journal.lock().is_empty());

    sleep(Duration::from_millis(2)).await;
    assert_eq!(*journal.lock(), vec!["Ping"]);
}

#[tokio::test(start_paused = true)]
async fn awaited_delay_respects_speed() {
    let (engine, _) = engine_with(&["Ping"]);
    assert_eq!(engine.set_speed(4.0), 4.0);

    let started = Instant::now();
    engine
        .inject_event("Ping", Value::Null, InjectionTiming::delay(1000), InjectionOptions::default())
        .await
        .unwrap();
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(250));
    assert!(elapsed < Duration::from_millis(1000));
}

#[tokio::test(start_paused = true)]
async fn sequential_batch_preserves_order() {
    let (engine, journal) = engine_with(&["A", "B", "C"]);
    let batch = vec![
        BatchInjection::from("A"),
        BatchInjection::new("B", Value::Null).with_timing(InjectionTiming::delay(100)),
        BatchInjection::from("C"),
    ];

    let outcomes = engine.inject_batch(batch, BatchMode::Sequential).await.unwrap();
    assert_eq!(outcomes.len(), 3);
    assert_eq!(*journal.lock(), vec!["A", "B", "C"]);
}

#[tokio::test(start_paused = true)]
async fn parallel_batch_does_not_wait_for_delays() {
    let (engine, journal) = engine_with(&["A", "B", "C"]);
    let batch = vec![
        BatchInjection::from("A"),
        BatchInjection::new("B", Value::Null).with_timing(InjectionTiming::delay(100)),
        BatchInjection::from("C"),
    ];

    let started = Instant::now();
    let outcomes = engine.inject_batch(batch, BatchMode::Parallel).await.unwrap();
    assert!(started.elapsed() < Duration::from_millis(200));
    assert!(outcomes
        .iter()
        .all(|outcome| outcome.status == InjectionStatus::Delivered));
    assert_eq!(*journal.lock(), vec!["A", "C", "B"]);
}

#[tokio::test(start_paused = true)]
async fn condition_injection_waits_for_edge() {
    let (engine, journal) = engine_with(&["Alarm"]);
    engine.bind_state_path("sensor.smoke", json!(false)).unwrap();

    let outcome = engine
        .inject_event(
            "Alarm",
            json!({ "zone": 3 }),
            InjectionTiming::condition("sensor.smoke").unwrap(),
            InjectionOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(outcome.status, InjectionStatus::Scheduled);
    assert_eq!(engine.context().watcher().len(), 1);

    engine.update_state("sensor.smoke", json!(true)).unwrap();
    sleep(Duration::from_millis(1)).await;
    assert_eq!(*journal.lock(), vec!["Alarm"]);
    assert!(engine.context().watcher().is_empty());

    // Delivered once only
    engine.update_state("sensor.smoke", json!(false)).unwrap();
    engine.update_state("sensor.smoke", json!(true)).unwrap();
    sleep(Duration::from_millis(1)).await;
    assert_eq!(journal.lock().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn awaited_condition_injection_returns_report() {
    let (engine, journal) = engine_with(&["Open"]);
    engine.bind_state_path("gate.ready", json!(false)).unwrap();

    let writer = engine.clone();
    tokio::spawn(async move {
        sleep(Duration::from_millis(100)).await;
        writer.update_state("gate.ready", json!(true)).unwrap();
    });

    let started = Instant::now();
    let outcome = engine
        .inject_event(
            "Open",
            Value::Null,
            InjectionTiming::condition("gate.ready == true").unwrap(),
            InjectionOptions {
                await_trigger: true,
                ..InjectionOptions::default()
            },
        )
        .await
        .unwrap();
    assert!(started.elapsed() >= Duration::from_millis(100));
    assert_eq!(outcome.status, InjectionStatus::Delivered);
    assert_eq!(outcome.report.unwrap().event, "Open");
    assert_eq!(*journal.lock(), vec!["Open"]);
}

#[tokio::test(start_paused = true)]
async fn lifecycle_hooks_surround_event() {
    let (engine, journal) = engine_with(&["Tick", "Pre", "Post"]);
    let tick = LifecycleRef::Event("Tick".to_string());
    engine
        .inject_event("Pre", Value::Null, InjectionTiming::before(tick.clone()), InjectionOptions::default())
        .await
        .unwrap();
    engine
        .inject_event("Post", Value::Null, InjectionTiming::after(tick), InjectionOptions::default())
        .await
        .unwrap();
    assert_eq!(engine.context().dispatcher().pending_hooks(), 2);

    engine.fire_event("Tick", Value::Null).await.unwrap();
    assert_eq!(*journal.lock(), vec!["Pre", "Tick", "Post"]);
    assert_eq!(engine.context().dispatcher().pending_hooks(), 0);

    // Hooks are consumed
    engine.fire_event("Tick", Value::Null).await.unwrap();
    assert_eq!(*journal.lock(), vec!["Pre", "Tick", "Post", "Tick"]);
}

#[tokio::test(start_paused = true)]
async fn invalid_parameters_are_rejected() {
    let engine = SimulationEngine::with_config(EngineConfig::testing_defaults()).unwrap();
    engine
        .register_event(EventDefinition::new("Move").with_required("speed", ParameterType::Number))
        .unwrap();

    let err = engine
        .inject_event("Move", json!({ "label": "x" }), InjectionTiming::Immediate, InjectionOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::MissingParameters { .. }));

    let err = engine
        .inject_event("Stay", Value::Null, InjectionTiming::Immediate, InjectionOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "unknown_event");
}

#[tokio::test(start_paused = true)]
async fn pause_holds_delivery_until_play() {
    let (engine, journal) = engine_with(&["Ping"]);
    engine.pause();
    engine
        .inject_event("Ping", Value::Null, InjectionTiming::delay(100), detached())
        .await
        .unwrap();

    sleep(Duration::from_millis(500)).await;
    assert!(journal.lock().is_empty());

    engine.play();
    sleep(Duration::from_millis(150)).await;
    assert_eq!(*journal.lock(), vec!["Ping"]);
}

#[tokio::test(start_paused = true)]
async fn stop_cancels_pending_delay() {
    let (engine, journal) = engine_with(&["Ping"]);
    engine
        .inject_event("Ping", Value::Null, InjectionTiming::delay(1000), detached())
        .await
        .unwrap();

    sleep(Duration::from_millis(10)).await;
    engine.stop();
    sleep(Duration::from_millis(2000)).await;
    assert!(journal.lock().is_empty());

    // New work after a stop runs normally
    engine
        .inject_event("Ping", Value::Null, InjectionTiming::Immediate, InjectionOptions::default())
        .await
        .unwrap();
    assert_eq!(*journal.lock(), vec!["Ping"]);
}
