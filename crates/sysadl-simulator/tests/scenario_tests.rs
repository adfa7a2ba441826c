//! Scenario interpreter: control flow, scopes, waits and scene steps

use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use sysadl_simulator::{
    ConfigDefaults, EngineConfig, EventDefinition, ExecutionStatus, LogCategory, ParameterType,
    ScenarioDefinition, SceneDefinition, SimulationEngine, Task,
};
use tokio::time::{sleep, Instant};

fn engine() -> SimulationEngine {
    SimulationEngine::with_config(EngineConfig::testing_defaults()).unwrap()
}

fn register(engine: &SimulationEngine, definition: Value) {
    engine
        .register_scenario(ScenarioDefinition::from_json(definition).unwrap())
        .unwrap();
}

#[tokio::test(start_paused = true)]
async fn for_loop_accumulates() {
    let engine = engine();
    register(
        &engine,
        json!({
            "name": "Sum",
            "variables": { "total": 0 },
            "body": [{
                "type": "for",
                "variable": "i",
                "start": "1",
                "end": "5",
                "body": [
                    { "type": "variable_assignment", "variable": "total", "value": "total + i" }
                ]
            }]
        }),
    );

    let result = engine.execute_scenario("Sum").await.unwrap();
    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.variable("total"), Some(&json!(15)));
    assert_eq!(result.variable("i"), None);
}

#[tokio::test(start_paused = true)]
async fn for_loop_with_negative_step() {
    let engine = engine();
    register(
        &engine,
        json!({
            "name": "Countdown",
            "variables": { "seen": "" },
            "body": [{
                "type": "for",
                "variable": "i",
                "start": "3",
                "end": "1",
                "step": "-1",
                "body": [
                    { "type": "variable_assignment", "variable": "seen", "value": "seen + i" }
                ]
            }]
        }),
    );

    let result = engine.execute_scenario("Countdown").await.unwrap();
    assert_eq!(result.variable("seen"), Some(&json!("321")));
}

#[tokio::test(start_paused = true)]
async fn while_loop_breaks() {
    let engine = engine();
    register(
        &engine,
        json!({
            "name": "Counter",
            "variables": { "count": 0 },
            "body": [{
                "type": "while",
                "condition": "true",
                "body": [
                    { "type": "variable_assignment", "variable": "count", "value": "count + 1" },
                    {
                        "type": "if",
                        "condition": "count == 3",
                        "then_body": [{ "type": "break" }]
                    }
                ]
            }]
        }),
    );

    let result = engine.execute_scenario("Counter").await.unwrap();
    assert!(result.success);
    assert_eq!(result.variable("count"), Some(&json!(3)));
}

#[tokio::test(start_paused = true)]
async fn runaway_loop_hits_limit() {
    let config = EngineConfig {
        max_loop_iterations: 10,
        ..EngineConfig::testing_defaults()
    };
    let engine = SimulationEngine::with_config(config).unwrap();
    register(
        &engine,
        json!({
            "name": "Forever",
            "variables": { "n": 0 },
            "body": [{
                "type": "while",
                "condition": "n >= 0",
                "body": [{ "type": "variable_assignment", "variable": "n", "value": "n + 1" }]
            }]
        }),
    );

    let result = engine.execute_scenario("Forever").await.unwrap();
    assert_eq!(result.status, ExecutionStatus::Failed);
    assert_eq!(result.error_kind.as_deref(), Some("loop_limit"));
    assert_eq!(result.variable("n"), Some(&json!(10)));
}

#[tokio::test(start_paused = true)]
async fn else_branch_and_state_updates() {
    let engine = engine();
    engine.bind_state_path("valve.pressure", json!(12)).unwrap();
    register(
        &engine,
        json!({
            "name": "Relief",
            "body": [{
                "type": "if",
                "condition": "valve.pressure > 50",
                "then_body": [{ "type": "state_update", "path": "valve.open", "value": "true" }],
                "else_body": [
                    { "type": "sleep", "duration": "200" },
                    { "type": "state_update", "path": "valve.pressure", "value": "valve.pressure * 2" }
                ]
            }]
        }),
    );

    let started = Instant::now();
    let result = engine.execute_scenario("Relief").await.unwrap();
    assert!(result.success);
    assert!(started.elapsed() >= Duration::from_millis(200));
    assert_eq!(engine.get_state("valve.pressure"), Some(json!(24)));
    assert_eq!(engine.get_state("valve.open"), None);
}

#[tokio::test(start_paused = true)]
async fn nested_scenario_exports_only_marked_variables() {
    let engine = engine();
    register(
        &engine,
        json!({
            "name": "Child",
            "body": [
                { "type": "variable_assignment", "variable": "tmp", "value": "limit + 1" },
                { "type": "variable_assignment", "variable": "limit", "value": "0" },
                { "type": "variable_assignment", "variable": "result", "value": "tmp * 2", "export": true }
            ]
        }),
    );
    register(
        &engine,
        json!({
            "name": "Parent",
            "variables": { "limit": 3 },
            "body": [{ "type": "nested_scenario", "scenario": "Child" }]
        }),
    );

    let result = engine.execute_scenario("Parent").await.unwrap();
    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.variable("result"), Some(&json!(8)));
    assert_eq!(result.variable("limit"), Some(&json!(3)));
    assert_eq!(result.variable("tmp"), None);
}

#[tokio::test(start_paused = true)]
async fn recursive_nesting_is_rejected() {
    let engine = engine();
    register(
        &engine,
        json!({ "name": "Ping", "body": [{ "type": "nested_scenario", "scenario": "Pong" }] }),
    );
    register(
        &engine,
        json!({ "name": "Pong", "body": [{ "type": "nested_scenario", "scenario": "Ping" }] }),
    );

    let result = engine.execute_scenario("Ping").await.unwrap();
    assert_eq!(result.error_kind.as_deref(), Some("nesting_limit"));
}

#[tokio::test(start_paused = true)]
async fn wait_until_resumes_on_state_change() {
    let engine = engine();
    engine.bind_state_path("plant.ready", json!(false)).unwrap();
    register(
        &engine,
        json!({
            "name": "Startup",
            "body": [
                { "type": "wait_until", "condition": "plant.ready" },
                { "type": "state_update", "path": "plant.running", "value": "true" }
            ]
        }),
    );

    let writer = engine.clone();
    tokio::spawn(async move {
        sleep(Duration::from_millis(300)).await;
        writer.update_state("plant.ready", json!(true)).unwrap();
    });

    let started = Instant::now();
    let result = engine.execute_scenario("Startup").await.unwrap();
    assert!(result.success, "{:?}", result.error);
    assert!(started.elapsed() >= Duration::from_millis(300));
    assert_eq!(engine.get_state("plant.running"), Some(json!(true)));
    assert!(engine.context().watcher().is_empty());
}

#[tokio::test(start_paused = true)]
async fn wait_until_uses_scenario_variables() {
    let engine = engine();
    engine.bind_state_path("tank.level", json!(0)).unwrap();
    register(
        &engine,
        json!({
            "name": "Fill",
            "variables": { "target": 80 },
            "body": [{ "type": "wait_until", "condition": "tank.level >= target", "timeout_ms": 1000 }]
        }),
    );

    let writer = engine.clone();
    tokio::spawn(async move {
        sleep(Duration::from_millis(100)).await;
        writer.update_state("tank.level", json!(50)).unwrap();
        sleep(Duration::from_millis(100)).await;
        writer.update_state("tank.level", json!(90)).unwrap();
    });

    let result = engine.execute_scenario("Fill").await.unwrap();
    assert!(result.success, "{:?}", result.error);
}

#[tokio::test(start_paused = true)]
async fn wait_until_times_out() {
    let engine = engine();
    engine.bind_state_path("signal", json!(false)).unwrap();
    register(
        &engine,
        json!({
            "name": "Patience",
            "body": [{ "type": "wait_until", "condition": "signal", "timeout_ms": 100 }]
        }),
    );

    let result = engine.execute_scenario("Patience").await.unwrap();
    assert_eq!(result.status, ExecutionStatus::TimedOut);
    assert_eq!(result.error_kind.as_deref(), Some("timeout"));
    assert!(engine.context().watcher().is_empty());
}

#[tokio::test(start_paused = true)]
async fn injection_parameters_are_evaluated() {
    let engine = engine();
    engine
        .register_event(EventDefinition::new("Move").with_required("speed", ParameterType::Number))
        .unwrap();
    let speeds = Arc::new(Mutex::new(Vec::new()));
    let sink = speeds.clone();
    engine
        .register_task(Task::sync("drive", "Move", move |tc| {
            sink.lock().push(tc.param("speed").cloned().unwrap_or(Value::Null));
            Ok(Value::Null)
        }))
        .unwrap();
    register(
        &engine,
        json!({
            "name": "Drive",
            "variables": { "base": 5 },
            "body": [{ "type": "inject", "event": "Move", "parameters": { "speed": "base * 2" } }]
        }),
    );

    let result = engine.execute_scenario("Drive").await.unwrap();
    assert!(result.success, "{:?}", result.error);
    assert_eq!(*speeds.lock(), vec![json!(10)]);
}

#[tokio::test(start_paused = true)]
async fn failed_scene_fails_scenario() {
    let engine = engine();
    engine.register_event(EventDefinition::new("Start")).unwrap();
    engine.register_event(EventDefinition::new("Finish")).unwrap();
    engine
        .register_scene(SceneDefinition::new("Never", "Start", "Finish").with_timeout(50))
        .unwrap();
    register(
        &engine,
        json!({
            "name": "Doomed",
            "variables": { "reached": false },
            "body": [
                { "type": "run_scene", "scene": "Never" },
                { "type": "variable_assignment", "variable": "reached", "value": "true" }
            ]
        }),
    );

    let result = engine.execute_scenario("Doomed").await.unwrap();
    assert_eq!(result.error_kind.as_deref(), Some("scene_failed"));
    assert_eq!(result.variable("reached"), Some(&json!(false)));
}

#[tokio::test(start_paused = true)]
async fn stop_ends_sleeping_scenario() {
    let engine = engine();
    engine.bind_state_path("door", json!(false)).unwrap();
    register(
        &engine,
        json!({
            "name": "Sleeper",
            "body": [
                { "type": "sleep", "duration": "10000" },
                { "type": "state_update", "path": "door", "value": "true" }
            ]
        }),
    );

    let controller = engine.clone();
    tokio::spawn(async move {
        sleep(Duration::from_millis(100)).await;
        controller.stop();
    });

    let started = Instant::now();
    let result = engine.execute_scenario("Sleeper").await.unwrap();
    assert_eq!(result.status, ExecutionStatus::Stopped);
    assert_eq!(result.error_kind.as_deref(), Some("stopped"));
    assert!(started.elapsed() < Duration::from_millis(10000));
    assert_eq!(engine.get_state("door"), Some(json!(false)));
    assert!(engine.context().active_runs().is_empty());
}

#[tokio::test(start_paused = true)]
async fn scenario_lifecycle_is_logged() {
    let engine = engine();
    register(&engine, json!({ "name": "Empty", "body": [] }));

    engine.execute_scenario("Empty").await.unwrap();
    let summaries: Vec<String> = engine
        .log_entries(LogCategory::Scenario)
        .into_iter()
        .map(|entry| entry.summary)
        .collect();
    assert_eq!(summaries, vec!["scenario started", "scenario completed"]);

    assert_eq!(
        engine.execute_scenario("Missing").await.unwrap_err().kind(),
        "unknown_scenario"
    );
}
