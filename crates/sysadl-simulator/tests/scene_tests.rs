//! Scene state machine runs against a live dispatcher

use serde_json::{json, Value};
use std::time::Duration;
use sysadl_simulator::{
    ConfigDefaults, EngineConfig, EventDefinition, EventInjector, ExecutionStatus,
    InjectionOptions, InjectionTiming, LogCategory, SceneDefinition, SceneOptions, SceneState,
    SimulationEngine, Task, TaskContext, TaskError,
};
use tokio::time::{sleep, Instant};

fn engine() -> SimulationEngine {
    let engine = SimulationEngine::with_config(EngineConfig::testing_defaults()).unwrap();
    engine.register_event(EventDefinition::new("Start")).unwrap();
    engine.register_event(EventDefinition::new("Finish")).unwrap();
    engine
}

/// Start task that schedules `Finish` after `ms`
fn finish_after(ms: u64) -> Task {
    Task::from_fn("schedule_finish", "Start", move |tc: TaskContext| async move {
        EventInjector::new(tc.engine().clone())
            .inject(
                "Finish",
                Value::Null,
                InjectionTiming::delay(ms),
                InjectionOptions {
                    detach: true,
                    ..InjectionOptions::default()
                },
            )
            .await?;
        Ok::<_, TaskError>(Value::Null)
    })
}

fn transitions(engine: &SimulationEngine) -> Vec<String> {
    engine
        .log_entries(LogCategory::SceneTransition)
        .into_iter()
        .map(|entry| entry.summary)
        .collect()
}

#[tokio::test(start_paused = true)]
async fn scene_runs_start_to_finish() {
    let engine = engine();
    engine.bind_state_path("dock.free", json!(true)).unwrap();
    engine.register_task(finish_after(500)).unwrap();
    engine
        .register_scene(
            SceneDefinition::new("Docking", "Start", "Finish")
                .with_pre_condition("dock.free")
                .unwrap()
                .with_effect("dock.free", "false")
                .unwrap()
                .with_post_condition("dock.free == false")
                .unwrap(),
        )
        .unwrap();

    let started = Instant::now();
    let result = engine
        .execute_scene("Docking", SceneOptions::default())
        .await
        .unwrap();

    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.status, ExecutionStatus::Completed);
    assert_eq!(result.scene_state, Some(SceneState::Completed));
    assert!(started.elapsed() >= Duration::from_millis(500));
    assert_eq!(engine.get_state("dock.free"), Some(json!(false)));
    assert_eq!(
        transitions(&engine),
        vec![
            "Pending -> WaitingStart",
            "WaitingStart -> Running",
            "Running -> WaitingFinish",
            "WaitingFinish -> Completed",
        ]
    );

    let recorded = engine.scene_transitions("Docking");
    assert_eq!(recorded.len(), 4);
    assert_eq!(recorded[0].from, SceneState::Pending);
    assert_eq!(recorded[3].to, SceneState::Completed);
    assert!(recorded.iter().all(|t| t.run_id == result.run_id && t.reason.is_none()));

    // Log timestamps run on the paused runtime clock
    let finished = engine.log_entries(LogCategory::SceneTransition);
    assert!(finished.last().is_some_and(|entry| entry.when >= 500));
}

#[tokio::test(start_paused = true)]
async fn finish_fired_by_start_task_is_not_missed() {
    let engine = engine();
    engine
        .register_task(Task::from_fn("finish_now", "Start", |tc: TaskContext| async move {
            tc.fire("Finish", Value::Null).await?;
            Ok::<_, TaskError>(Value::Null)
        }))
        .unwrap();
    engine
        .register_scene(SceneDefinition::new("Blink", "Start", "Finish").with_timeout(1000))
        .unwrap();

    let result = engine.execute_scene("Blink", SceneOptions::default()).await.unwrap();
    assert!(result.success);
    assert_eq!(result.scene_state, Some(SceneState::Completed));
}

#[tokio::test(start_paused = true)]
async fn false_precondition_fails_before_start() {
    let engine = engine();
    engine.bind_state_path("dock.free", json!(false)).unwrap();
    engine
        .register_scene(
            SceneDefinition::new("Docking", "Start", "Finish")
                .with_pre_condition("dock.free")
                .unwrap(),
        )
        .unwrap();

    let result = engine.execute_scene("Docking", SceneOptions::default()).await.unwrap();
    assert!(!result.success);
    assert_eq!(result.status, ExecutionStatus::Failed);
    assert_eq!(result.error_kind.as_deref(), Some("precondition"));
    assert_eq!(result.scene_state, Some(SceneState::Failed));
    assert!(engine.log_entries(LogCategory::Dispatch).is_empty());
}

#[tokio::test(start_paused = true)]
async fn false_postcondition_fails_after_finish() {
    let engine = engine();
    engine.bind_state_path("cargo.loaded", json!(false)).unwrap();
    engine.register_task(finish_after(10)).unwrap();
    engine
        .register_scene(
            SceneDefinition::new("Loading", "Start", "Finish")
                .with_post_condition("cargo.loaded")
                .unwrap(),
        )
        .unwrap();

    let result = engine.execute_scene("Loading", SceneOptions::default()).await.unwrap();
    assert_eq!(result.error_kind.as_deref(), Some("postcondition"));
    assert_eq!(
        transitions(&engine).last().map(String::as_str),
        Some("WaitingFinish -> Failed")
    );
}

#[tokio::test(start_paused = true)]
async fn missing_finish_times_out() {
    let engine = engine();
    engine
        .register_scene(SceneDefinition::new("Stuck", "Start", "Finish").with_timeout(1000))
        .unwrap();

    let started = Instant::now();
    let result = engine.execute_scene("Stuck", SceneOptions::default()).await.unwrap();
    assert_eq!(result.status, ExecutionStatus::TimedOut);
    assert_eq!(result.scene_state, Some(SceneState::TimedOut));
    assert!(started.elapsed() >= Duration::from_millis(1000));
    assert_eq!(
        transitions(&engine).last().map(String::as_str),
        Some("WaitingFinish -> TimedOut")
    );
}

#[tokio::test(start_paused = true)]
async fn external_start_waits_for_both_events() {
    let engine = engine();
    engine
        .register_scene(SceneDefinition::new("Relay", "Start", "Finish"))
        .unwrap();

    let driver = engine.clone();
    tokio::spawn(async move {
        sleep(Duration::from_millis(100)).await;
        driver.fire_event("Start", Value::Null).await.unwrap();
        sleep(Duration::from_millis(100)).await;
        driver.fire_event("Finish", Value::Null).await.unwrap();
    });

    let options = SceneOptions {
        external_start: true,
        ..SceneOptions::default()
    };
    let started = Instant::now();
    let result = engine.execute_scene("Relay", options).await.unwrap();
    assert!(result.success);
    assert!(started.elapsed() >= Duration::from_millis(200));
    assert_eq!(engine.log_entries(LogCategory::Dispatch).len(), 2);
}

#[tokio::test(start_paused = true)]
async fn stop_interrupts_waiting_scene() {
    let engine = engine();
    engine
        .register_scene(SceneDefinition::new("Idle", "Start", "Finish"))
        .unwrap();

    let controller = engine.clone();
    tokio::spawn(async move {
        sleep(Duration::from_millis(100)).await;
        controller.stop();
    });

    let result = engine.execute_scene("Idle", SceneOptions::default()).await.unwrap();
    assert_eq!(result.status, ExecutionStatus::Stopped);
    assert_eq!(result.error_kind.as_deref(), Some("stopped"));
    assert_eq!(result.scene_state, Some(SceneState::Failed));
}

#[tokio::test(start_paused = true)]
async fn unknown_scene_and_events_are_errors() {
    let engine = engine();
    assert_eq!(
        engine
            .execute_scene("Nowhere", SceneOptions::default())
            .await
            .unwrap_err()
            .kind(),
        "unknown_scene"
    );

    engine
        .register_scene(SceneDefinition::new("Ghost", "Start", "Vanish"))
        .unwrap();
    assert_eq!(
        engine
            .execute_scene("Ghost", SceneOptions::default())
            .await
            .unwrap_err()
            .kind(),
        "unknown_event"
    );
}

#[tokio::test(start_paused = true)]
async fn scene_needs_distinct_start_and_finish() {
    let engine = engine();
    engine.register_event(EventDefinition::new("Go")).unwrap();

    let err = engine
        .register_scene(SceneDefinition::new("Loop", "Go", "Go"))
        .unwrap_err();
    assert_eq!(err.kind(), "invalid_definition");
    assert_eq!(
        engine
            .execute_scene("Loop", SceneOptions::default())
            .await
            .unwrap_err()
            .kind(),
        "unknown_scene"
    );
    // Rejected registration, then the failed lookup
    assert_eq!(engine.log_entries(LogCategory::Error).len(), 2);
}
