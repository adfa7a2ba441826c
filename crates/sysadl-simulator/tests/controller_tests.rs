//! Scenario executions and simulation control

use serde_json::json;
use std::time::Duration;
use sysadl_simulator::{
    ConfigDefaults, EngineConfig, ExecutionMode, ExecutionOptions, ExecutionStatus, LogCategory,
    ScenarioDefinition, ScenarioEntry, ScenarioExecutionDefinition, SimulationEngine,
};
use tokio::time::{sleep, Instant};

/// Engine with `First` (sleeps 200ms, appends 1) and `Second` (sleeps 100ms,
/// appends 2) writing into `trail`, plus a `Broken` scenario
fn engine() -> SimulationEngine {
    let _ = tracing_subscriber::fmt::try_init();
    let config = EngineConfig {
        mirror_to_tracing: true,
        ..EngineConfig::testing_defaults()
    };
    let engine = SimulationEngine::with_config(config).unwrap();
    engine.bind_state_path("trail", json!(0)).unwrap();
    for (name, delay, digit) in [("First", 200, 1), ("Second", 100, 2)] {
        let scenario = ScenarioDefinition::from_json(json!({
            "name": name,
            "body": [
                { "type": "sleep", "duration": delay.to_string() },
                { "type": "state_update", "path": "trail", "value": format!("trail * 10 + {digit}") }
            ]
        }))
        .unwrap();
        engine.register_scenario(scenario).unwrap();
    }
    engine
        .register_scenario(
            ScenarioDefinition::from_json(json!({
                "name": "Broken",
                "body": [{ "type": "nested_scenario", "scenario": "Missing" }]
            }))
            .unwrap(),
        )
        .unwrap();
    engine
}

fn execution(
    engine: &SimulationEngine,
    name: &str,
    mode: ExecutionMode,
    scenarios: Vec<ScenarioEntry>,
) {
    engine
        .register_scenario_execution(ScenarioExecutionDefinition::new(name, mode, scenarios))
        .unwrap();
}

#[tokio::test(start_paused = true)]
async fn sequential_runs_in_order() {
    let engine = engine();
    execution(&engine, "Run", ExecutionMode::Sequential, vec!["First".into(), "Second".into()]);

    let started = Instant::now();
    let aggregate = engine
        .execute_scenario_execution("Run", ExecutionOptions::default())
        .await
        .unwrap();

    assert!(aggregate.success);
    assert_eq!(aggregate.completed_scenarios, 2);
    assert_eq!(aggregate.max_concurrency, 1);
    assert_eq!(engine.get_state("trail"), Some(json!(12)));
    assert!(started.elapsed() >= Duration::from_millis(300));
}

#[tokio::test(start_paused = true)]
async fn parallel_runs_concurrently() {
    let engine = engine();
    execution(&engine, "Run", ExecutionMode::Parallel, vec!["First".into(), "Second".into()]);

    let started = Instant::now();
    let aggregate = engine
        .execute_scenario_execution("Run", ExecutionOptions::default())
        .await
        .unwrap();

    assert!(aggregate.success);
    assert_eq!(aggregate.max_concurrency, 2);
    assert_eq!(engine.get_state("trail"), Some(json!(21)));
    assert!(started.elapsed() < Duration::from_millis(300));
    // Results stay in entry order
    let names: Vec<&str> = aggregate.results.iter().map(|r| r.name.as_str()).collect();
    assert_eq!(names, vec!["First", "Second"]);
}

#[tokio::test(start_paused = true)]
async fn conditional_skips_false_preconditions() {
    let engine = engine();
    engine.bind_state_path("mode.auto", json!(false)).unwrap();
    execution(
        &engine,
        "Run",
        ExecutionMode::Conditional,
        vec![
            ScenarioEntry::new("First").with_pre_condition("mode.auto").unwrap(),
            ScenarioEntry::new("Second").with_pre_condition("trail == 0").unwrap(),
        ],
    );

    let aggregate = engine
        .execute_scenario_execution("Run", ExecutionOptions::default())
        .await
        .unwrap();

    assert!(aggregate.success);
    assert_eq!(aggregate.skipped_scenarios, vec!["First".to_string()]);
    assert_eq!(aggregate.completed_scenarios, 1);
    assert_eq!(aggregate.results[0].status, ExecutionStatus::Skipped);
    assert_eq!(engine.get_state("trail"), Some(json!(2)));

    let stats = engine.statistics();
    assert_eq!(stats.per_scenario["First"].skips, 1);
    assert_eq!(stats.per_scenario["First"].runs, 0);
    assert_eq!(stats.per_scenario["Second"].successes, 1);
}

#[tokio::test(start_paused = true)]
async fn failure_aborts_unless_continuing() {
    let engine = engine();
    execution(&engine, "Run", ExecutionMode::Sequential, vec!["Broken".into(), "Second".into()]);

    let aborted = engine
        .execute_scenario_execution("Run", ExecutionOptions::default())
        .await
        .unwrap();
    assert!(!aborted.success);
    assert!(aborted.aborted);
    assert_eq!(aborted.results.len(), 1);
    assert_eq!(aborted.failed_scenarios, 1);
    assert_eq!(engine.get_state("trail"), Some(json!(0)));

    let continued = engine
        .execute_scenario_execution(
            "Run",
            ExecutionOptions {
                continue_on_error: Some(true),
            },
        )
        .await
        .unwrap();
    assert!(!continued.success);
    assert!(!continued.aborted);
    assert_eq!(continued.completed_scenarios, 1);
    assert_eq!(continued.failed_scenarios, 1);
    assert_eq!(engine.get_state("trail"), Some(json!(2)));

    let stats = engine.statistics();
    assert_eq!(stats.total_executions, 2);
    assert_eq!(stats.failed_executions, 2);
    assert_eq!(stats.per_scenario["Broken"].failures, 2);
}

#[tokio::test(start_paused = true)]
async fn statistics_accumulate() {
    let engine = engine();
    execution(&engine, "Run", ExecutionMode::Sequential, vec!["Second".into()]);

    for _ in 0..3 {
        engine
            .execute_scenario_execution("Run", ExecutionOptions::default())
            .await
            .unwrap();
    }
    let stats = engine.statistics();
    assert_eq!(stats.total_executions, 3);
    assert_eq!(stats.successful_executions, 3);
    assert_eq!(stats.per_scenario["Second"].runs, 3);
    assert!(stats.average_execution_time_ms >= 100.0);
}

#[tokio::test(start_paused = true)]
async fn speed_scales_scenario_sleeps() {
    let engine = engine();
    execution(&engine, "Run", ExecutionMode::Sequential, vec!["First".into()]);
    assert_eq!(engine.set_speed(10.0), 10.0);

    let started = Instant::now();
    engine
        .execute_scenario_execution("Run", ExecutionOptions::default())
        .await
        .unwrap();
    assert!(started.elapsed() < Duration::from_millis(200));
    assert!(started.elapsed() >= Duration::from_millis(20));
}

#[tokio::test(start_paused = true)]
async fn pause_holds_scenarios_until_play() {
    let engine = engine();
    execution(&engine, "Run", ExecutionMode::Sequential, vec!["Second".into()]);

    let started = Instant::now();
    let run = engine.execute_scenario_execution("Run", ExecutionOptions::default());
    let control = async {
        sleep(Duration::from_millis(50)).await;
        engine.pause();
        assert!(engine.is_paused());
        sleep(Duration::from_millis(500)).await;
        assert_eq!(engine.get_state("trail"), Some(json!(0)));
        engine.play();
    };
    let (aggregate, ()) = tokio::join!(run, control);

    assert!(aggregate.unwrap().success);
    assert_eq!(engine.get_state("trail"), Some(json!(2)));
    assert!(started.elapsed() >= Duration::from_millis(550));
}

#[tokio::test(start_paused = true)]
async fn stop_ends_every_running_scenario() {
    let engine = engine();
    engine
        .register_scenario(
            ScenarioDefinition::from_json(json!({
                "name": "Waiter",
                "body": [{ "type": "wait_until", "condition": "trail > 100" }]
            }))
            .unwrap(),
        )
        .unwrap();
    execution(
        &engine,
        "Run",
        ExecutionMode::Parallel,
        vec!["First".into(), "Waiter".into()],
    );

    let run = engine.execute_scenario_execution("Run", ExecutionOptions::default());
    let control = async {
        sleep(Duration::from_millis(100)).await;
        engine.stop();
    };
    let (aggregate, ()) = tokio::join!(run, control);
    let aggregate = aggregate.unwrap();

    assert!(aggregate.stopped);
    assert!(!aggregate.success);
    assert!(aggregate
        .results
        .iter()
        .all(|r| r.status == ExecutionStatus::Stopped && r.error_kind.as_deref() == Some("stopped")));
    assert_eq!(engine.get_state("trail"), Some(json!(0)));
    assert!(engine.context().watcher().is_empty());
    assert!(engine
        .log_entries(LogCategory::Control)
        .iter()
        .any(|entry| entry.summary == "stopped"));

    // The engine stays usable after a stop
    execution(&engine, "Again", ExecutionMode::Sequential, vec!["Second".into()]);
    let again = engine
        .execute_scenario_execution("Again", ExecutionOptions::default())
        .await
        .unwrap();
    assert!(again.success);
}

#[tokio::test(start_paused = true)]
async fn unknown_names_are_errors() {
    let engine = engine();
    let err = engine
        .execute_scenario_execution("Nothing", ExecutionOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "unknown_scenario_execution");

    execution(&engine, "Run", ExecutionMode::Sequential, vec!["First".into(), "Ghost".into()]);
    let err = engine
        .execute_scenario_execution("Run", ExecutionOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "unknown_scenario");
    assert_eq!(engine.get_state("trail"), Some(json!(0)));
}
