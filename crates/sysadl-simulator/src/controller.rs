//! Execution controller
//!
//! Runs a named group of scenarios sequentially, in parallel, or
//! conditionally on per-scenario pre-conditions, and owns the engine-wide
//! pause, speed and stop controls.

use crate::clock::RunToken;
use crate::context::EngineContext;
use crate::error::{EngineError, Result};
use crate::results::{ExecutionResult, ExecutionStatus};
use crate::scenario::ScenarioExecutor;
use futures::future::join_all;
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use sysadl_core::{EvaluationError, Expression, LogCategory};
use tokio::time::Instant;
use tracing::info;

/// How the scenarios of an execution are scheduled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// One after another
    #[default]
    Sequential,
    /// All at once
    Parallel,
    /// One after another, skipping scenarios whose pre-conditions are false
    Conditional,
}

/// A scenario reference inside an execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioEntry {
    /// Scenario name
    pub scenario: String,
    /// Checked just before the scenario would start, in conditional mode
    #[serde(default)]
    pub pre_conditions: Vec<Expression>,
}

impl ScenarioEntry {
    /// Unconditional entry
    pub fn new(scenario: impl Into<String>) -> Self {
        Self {
            scenario: scenario.into(),
            pre_conditions: Vec::new(),
        }
    }

    /// Add a pre-condition
    pub fn with_pre_condition(mut self, source: &str) -> std::result::Result<Self, EvaluationError> {
        self.pre_conditions.push(Expression::parse(source)?);
        Ok(self)
    }
}

impl From<&str> for ScenarioEntry {
    fn from(scenario: &str) -> Self {
        Self::new(scenario)
    }
}

/// A registered scenario execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioExecutionDefinition {
    /// Unique name
    pub name: String,
    /// Scheduling mode
    #[serde(default)]
    pub mode: ExecutionMode,
    /// Scenarios in order
    pub scenarios: Vec<ScenarioEntry>,
    /// Keep going after a failed scenario (sequential and conditional modes)
    #[serde(default)]
    pub continue_on_error: bool,
}

impl ScenarioExecutionDefinition {
    /// Execution of `scenarios` in `mode`
    pub fn new(
        name: impl Into<String>,
        mode: ExecutionMode,
        scenarios: impl IntoIterator<Item = ScenarioEntry>,
    ) -> Self {
        Self {
            name: name.into(),
            mode,
            scenarios: scenarios.into_iter().collect(),
            continue_on_error: false,
        }
    }

    /// Keep going after failures
    pub fn continue_on_error(mut self, enabled: bool) -> Self {
        self.continue_on_error = enabled;
        self
    }

    /// Structural checks run at registration
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(EngineError::invalid_definition("<execution>", "execution name is empty"));
        }
        if self.scenarios.iter().any(|e| e.scenario.trim().is_empty()) {
            return Err(EngineError::invalid_definition(&self.name, "scenario entry without a name"));
        }
        Ok(())
    }
}

/// Per-call overrides
#[derive(Debug, Clone, Default)]
pub struct ExecutionOptions {
    /// Override the definition's `continue_on_error`
    pub continue_on_error: Option<bool>,
}

/// Outcome of one scenario execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateResult {
    /// Execution name
    pub name: String,
    /// Scheduling mode
    pub mode: ExecutionMode,
    /// No scenario failed and the run was not stopped
    pub success: bool,
    /// Number of scenario entries
    pub total_scenarios: usize,
    /// Scenarios that completed successfully
    pub completed_scenarios: usize,
    /// Scenarios that ran and failed
    pub failed_scenarios: usize,
    /// Scenarios skipped by a false pre-condition
    pub skipped_scenarios: Vec<String>,
    /// Highest number of scenarios running at the same time
    pub max_concurrency: usize,
    /// Remaining scenarios were not started after a failure
    pub aborted: bool,
    /// The run was stopped
    pub stopped: bool,
    /// Wall-clock duration
    pub duration_ms: u64,
    /// Per-scenario results, in entry order
    pub results: Vec<ExecutionResult>,
}

/// Counters for one scenario across executions
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScenarioCounters {
    /// Times started
    pub runs: u64,
    /// Times completed
    pub successes: u64,
    /// Times failed
    pub failures: u64,
    /// Times skipped
    pub skips: u64,
}

/// Controller statistics, one sample per scenario execution run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionStatistics {
    /// Scenario executions run
    pub total_executions: u64,
    /// Executions that succeeded
    pub successful_executions: u64,
    /// Executions that failed
    pub failed_executions: u64,
    /// Sum of execution durations
    pub total_execution_time_ms: u64,
    /// Mean execution duration
    pub average_execution_time_ms: f64,
    /// Counters per scenario
    pub per_scenario: IndexMap<String, ScenarioCounters>,
}

/// Runs scenario executions and exposes pause, play, speed and stop
#[derive(Debug)]
pub struct ExecutionController {
    ctx: Arc<EngineContext>,
    stats: Mutex<ExecutionStatistics>,
}

impl ExecutionController {
    /// Controller bound to an engine context
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        Self {
            ctx,
            stats: Mutex::new(ExecutionStatistics::default()),
        }
    }

    /// Run the scenario execution `name`
    pub async fn execute(&self, name: &str, options: ExecutionOptions) -> Result<AggregateResult> {
        let ctx = &self.ctx;
        let Some(execution) = ctx.executions().get(name) else {
            let err = EngineError::unknown_scenario_execution(name);
            ctx.log_error(name, &err);
            return Err(err);
        };
        if let Some(missing) = execution
            .scenarios
            .iter()
            .find(|entry| !ctx.scenarios().contains(&entry.scenario))
        {
            let err = EngineError::unknown_scenario(&missing.scenario);
            ctx.log_error(name, &err);
            return Err(err);
        }

        let continue_on_error = options
            .continue_on_error
            .unwrap_or(execution.continue_on_error);
        let token = ctx.clock().token();
        ctx.logger().record(
            LogCategory::Execution,
            name,
            "execution started",
            json!({
                "mode": execution.mode,
                "scenarios": execution.scenarios.iter().map(|e| e.scenario.as_str()).collect::<Vec<_>>(),
            }),
        );

        info!(execution = %name, mode = ?execution.mode, "Running scenario execution");
        let started = Instant::now();
        let tracker = Concurrency::default();
        let mut results = Vec::with_capacity(execution.scenarios.len());
        let mut skipped = Vec::new();
        let mut aborted = false;

        match execution.mode {
            ExecutionMode::Parallel => {
                let runs = execution
                    .scenarios
                    .iter()
                    .map(|entry| self.run_tracked(&entry.scenario, &token, &tracker));
                for result in join_all(runs).await {
                    results.push(result?);
                }
            }
            ExecutionMode::Sequential | ExecutionMode::Conditional => {
                for entry in &execution.scenarios {
                    if token.is_stopped() {
                        break;
                    }
                    if execution.mode == ExecutionMode::Conditional {
                        match self.preconditions_hold(entry) {
                            Ok(true) => {}
                            Ok(false) => {
                                ctx.logger().record(
                                    LogCategory::Execution,
                                    &entry.scenario,
                                    "scenario skipped",
                                    json!({ "execution": name }),
                                );
                                skipped.push(entry.scenario.clone());
                                results.push(ExecutionResult::skipped(&entry.scenario));
                                continue;
                            }
                            Err(err) => {
                                ctx.log_error(&entry.scenario, &err);
                                results.push(ExecutionResult::failed(
                                    &entry.scenario,
                                    "",
                                    0,
                                    IndexMap::new(),
                                    &err,
                                ));
                                if !continue_on_error {
                                    aborted = true;
                                    break;
                                }
                                continue;
                            }
                        }
                    }

                    let result = self.run_tracked(&entry.scenario, &token, &tracker).await?;
                    let failed = !result.success;
                    results.push(result);
                    if failed && !continue_on_error {
                        aborted = true;
                        break;
                    }
                }
            }
        }

        let stopped = token.is_stopped();
        let completed = results.iter().filter(|r| r.success).count();
        let failed = results
            .iter()
            .filter(|r| !r.success && r.status != ExecutionStatus::Skipped)
            .count();
        let aggregate = AggregateResult {
            name: name.to_string(),
            mode: execution.mode,
            success: failed == 0 && !stopped,
            total_scenarios: execution.scenarios.len(),
            completed_scenarios: completed,
            failed_scenarios: failed,
            skipped_scenarios: skipped,
            max_concurrency: tracker.peak(),
            aborted: aborted || (stopped && results.len() < execution.scenarios.len()),
            stopped,
            duration_ms: started.elapsed().as_millis() as u64,
            results,
        };

        self.record_statistics(&aggregate);
        info!(
            execution = %name,
            success = aggregate.success,
            completed = aggregate.completed_scenarios,
            failed = aggregate.failed_scenarios,
            duration_ms = aggregate.duration_ms,
            "Scenario execution finished"
        );
        ctx.logger().record(
            LogCategory::Execution,
            name,
            if aggregate.success {
                "execution completed"
            } else {
                "execution failed"
            },
            json!({
                "completed": aggregate.completed_scenarios,
                "failed": aggregate.failed_scenarios,
                "skipped": aggregate.skipped_scenarios,
                "max_concurrency": aggregate.max_concurrency,
                "duration_ms": aggregate.duration_ms,
            }),
        );
        Ok(aggregate)
    }

    async fn run_tracked(
        &self,
        scenario: &str,
        token: &RunToken,
        tracker: &Concurrency,
    ) -> Result<ExecutionResult> {
        tracker.enter();
        let result = ScenarioExecutor::new(self.ctx.clone())
            .with_token(token.clone())
            .execute(scenario)
            .await;
        tracker.leave();
        result
    }

    fn preconditions_hold(&self, entry: &ScenarioEntry) -> Result<bool> {
        for condition in &entry.pre_conditions {
            if !condition.evaluate_bool(self.ctx.store())? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn record_statistics(&self, aggregate: &AggregateResult) {
        let mut stats = self.stats.lock();
        stats.total_executions += 1;
        if aggregate.success {
            stats.successful_executions += 1;
        } else {
            stats.failed_executions += 1;
        }
        stats.total_execution_time_ms += aggregate.duration_ms;
        stats.average_execution_time_ms =
            stats.total_execution_time_ms as f64 / stats.total_executions as f64;

        for result in &aggregate.results {
            let counters = stats.per_scenario.entry(result.name.clone()).or_default();
            match result.status {
                ExecutionStatus::Skipped => counters.skips += 1,
                _ if result.success => {
                    counters.runs += 1;
                    counters.successes += 1;
                }
                _ => {
                    counters.runs += 1;
                    counters.failures += 1;
                }
            }
        }
    }

    /// Snapshot of the statistics
    pub fn statistics(&self) -> ExecutionStatistics {
        self.stats.lock().clone()
    }

    /// Pause every running scenario at its next await boundary
    pub fn pause(&self) {
        self.ctx.clock().pause();
        self.ctx
            .logger()
            .record(LogCategory::Control, "controller", "paused", json!({}));
    }

    /// Resume paused scenarios
    pub fn play(&self) {
        self.ctx.clock().play();
        self.ctx
            .logger()
            .record(LogCategory::Control, "controller", "resumed", json!({}));
    }

    /// Whether the controller is paused
    pub fn is_paused(&self) -> bool {
        self.ctx.clock().is_paused()
    }

    /// Set the speed factor, clamped to the configured bounds. Returns the
    /// factor applied.
    pub fn set_speed(&self, factor: f64) -> f64 {
        let applied = self.ctx.config().clamp_speed(factor);
        self.ctx.clock().set_speed(applied);
        self.ctx.logger().record(
            LogCategory::Control,
            "controller",
            format!("speed set to {applied}"),
            json!({ "requested": factor, "applied": applied }),
        );
        applied
    }

    /// Current speed factor
    pub fn speed(&self) -> f64 {
        self.ctx.clock().speed()
    }

    /// Stop every running scenario and drop the watches and hooks they own
    pub fn stop(&self) {
        let generation = self.ctx.clock().stop();
        let released = self.ctx.release_active_runs();
        info!(generation, released, "Simulation stopped");
        self.ctx.logger().record(
            LogCategory::Control,
            "controller",
            "stopped",
            json!({ "generation": generation, "released": released }),
        );
    }
}

#[derive(Default)]
struct Concurrency {
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl Concurrency {
    fn enter(&self) {
        let now = self.active.fetch_add(1, Ordering::AcqRel) + 1;
        self.peak.fetch_max(now, Ordering::AcqRel);
    }

    fn leave(&self) {
        self.active.fetch_sub(1, Ordering::AcqRel);
    }

    fn peak(&self) -> usize {
        self.peak.load(Ordering::Acquire)
    }
}
