//! Simulation engine facade
//!
//! [`SimulationEngine`] is the boundary the model side talks to: it registers
//! events, tasks, scenes, scenarios and executions, exposes the state store
//! through change-tracked writes, and runs and controls simulations. It is a
//! cheap handle; clones share the same engine.

use crate::config::{ConfigDefaults, EngineConfig};
use crate::context::EngineContext;
use crate::controller::{
    AggregateResult, ExecutionController, ExecutionOptions, ExecutionStatistics,
    ScenarioExecutionDefinition,
};
use crate::dispatcher::{dispatch, DispatchChain, DispatchReport, EventDefinition, EventNotice, Task};
use crate::error::{EngineError, Result};
use crate::injector::{
    BatchInjection, BatchMode, EventInjector, InjectionOptions, InjectionOutcome, InjectionTiming,
};
use crate::results::ExecutionResult;
use crate::scenario::{ScenarioDefinition, ScenarioExecutor};
use crate::scene::{SceneDefinition, SceneExecutor, SceneOptions, SceneTransition};
use crate::watcher::{StateChange, StateSubscription, WatchCallback, WatchInfo, WatchOptions};
use indexmap::IndexMap;
use serde_json::{json, Value};
use std::sync::Arc;
use sysadl_core::{Expression, LogCategory, LogEntry, StatePath, StateWrite};
use tokio::sync::broadcast;

/// Handle to one simulation engine
#[derive(Debug, Clone)]
pub struct SimulationEngine {
    ctx: Arc<EngineContext>,
    controller: Arc<ExecutionController>,
}

impl SimulationEngine {
    /// Engine with production defaults
    pub fn new() -> Result<Self> {
        Self::with_config(EngineConfig::production_defaults())
    }

    /// Engine with an explicit configuration
    pub fn with_config(config: EngineConfig) -> Result<Self> {
        let ctx = EngineContext::new(config)?;
        let controller = Arc::new(ExecutionController::new(ctx.clone()));
        Ok(Self { ctx, controller })
    }

    /// Engine configured from a TOML document
    pub fn from_toml_str(text: &str) -> Result<Self> {
        Self::with_config(EngineConfig::from_toml_str(text)?)
    }

    /// Shared context, for components built outside the facade
    pub fn context(&self) -> &Arc<EngineContext> {
        &self.ctx
    }

    // Registration

    /// Declare an event
    pub fn register_event(&self, definition: EventDefinition) -> Result<()> {
        self.ctx.dispatcher().register_event(&self.ctx, definition)
    }

    /// Attach a task to its trigger event
    pub fn register_task(&self, task: Task) -> Result<()> {
        self.ctx.dispatcher().register_task(&self.ctx, task)
    }

    /// Register a scene
    pub fn register_scene(&self, definition: SceneDefinition) -> Result<()> {
        self.register(definition.validate(), "scene", &definition.name.clone(), || {
            self.ctx.scenes().insert(definition.name.clone(), definition)
        })
    }

    /// Register a scenario
    pub fn register_scenario(&self, definition: ScenarioDefinition) -> Result<()> {
        self.register(definition.validate(), "scenario", &definition.name.clone(), || {
            self.ctx.scenarios().insert(definition.name.clone(), definition)
        })
    }

    /// Register a scenario execution
    pub fn register_scenario_execution(&self, definition: ScenarioExecutionDefinition) -> Result<()> {
        self.register(definition.validate(), "scenario execution", &definition.name.clone(), || {
            self.ctx.executions().insert(definition.name.clone(), definition)
        })
    }

    fn register<T>(
        &self,
        valid: Result<()>,
        kind: &str,
        name: &str,
        insert: impl FnOnce() -> Result<Arc<T>>,
    ) -> Result<()> {
        let outcome = valid.and_then(|()| insert().map(|_| ()));
        match &outcome {
            Ok(()) => {
                self.ctx.logger().record(
                    LogCategory::Registration,
                    name,
                    format!("{kind} registered"),
                    json!({}),
                );
            }
            Err(err) => self.ctx.log_error(name, err),
        }
        outcome
    }

    /// Bind a state path to its initial value
    pub fn bind_state_path(&self, path: &str, initial: Value) -> Result<StateWrite> {
        self.ctx.bind_state_path(path, initial)
    }

    // State

    /// Value visible at `path`
    pub fn get_state(&self, path: &str) -> Option<Value> {
        self.ctx.get_state(path)
    }

    /// Write a state path, notifying dependent watches and subscribers
    pub fn update_state(&self, path: &str, value: Value) -> Result<StateWrite> {
        self.ctx.update_state(path, value)
    }

    /// Copy of every state binding
    pub fn state_snapshot(&self) -> IndexMap<String, Value> {
        self.ctx.state_snapshot()
    }

    /// Call `listener` whenever `path`, an ancestor or a descendant changes
    pub fn subscribe_to_state_change<F>(&self, path: &str, listener: F) -> Result<StateSubscription>
    where
        F: Fn(&StateChange) + Send + Sync + 'static,
    {
        let path = StatePath::parse(path)?;
        Ok(self.ctx.watcher().subscribe(path, Arc::new(listener)))
    }

    // Conditions

    /// Register a one-shot watch on `condition`
    pub fn watch_condition(&self, id: &str, condition: &str, callback: WatchCallback) -> Result<bool> {
        self.watch_condition_with(id, condition, WatchOptions::default(), callback)
    }

    /// Register a watch with explicit options
    pub fn watch_condition_with(
        &self,
        id: &str,
        condition: &str,
        options: WatchOptions,
        callback: WatchCallback,
    ) -> Result<bool> {
        let expression = Expression::parse(condition).map_err(|err| {
            let err = EngineError::from(err);
            self.ctx.log_error(id, &err);
            err
        })?;
        self.ctx
            .watcher()
            .watch(&self.ctx, id, expression, options, callback)
    }

    /// Arm a one-shot watch again
    pub fn rearm_watch(&self, id: &str) -> Result<()> {
        self.ctx.watcher().rearm(&self.ctx, id)
    }

    /// Stop a watch from firing
    pub fn disarm_watch(&self, id: &str) -> Result<()> {
        self.ctx.watcher().disarm(&self.ctx, id)
    }

    /// Remove a watch
    pub fn remove_watch(&self, id: &str) -> bool {
        self.ctx.watcher().remove(&self.ctx, id)
    }

    /// Snapshot of a watch
    pub fn watch_info(&self, id: &str) -> Option<WatchInfo> {
        self.ctx.watcher().info(id)
    }

    // Events

    /// Dispatch `event` right away on a fresh chain
    pub async fn fire_event(&self, event: &str, payload: Value) -> Result<DispatchReport> {
        dispatch(&self.ctx, event, payload, DispatchChain::default()).await
    }

    /// Inject `event` with `timing`
    pub async fn inject_event(
        &self,
        event: &str,
        parameters: Value,
        timing: InjectionTiming,
        options: InjectionOptions,
    ) -> Result<InjectionOutcome> {
        EventInjector::new(self.ctx.clone())
            .inject(event, parameters, timing, options)
            .await
    }

    /// Inject several events
    pub async fn inject_batch(
        &self,
        batch: Vec<BatchInjection>,
        mode: BatchMode,
    ) -> Result<Vec<InjectionOutcome>> {
        EventInjector::new(self.ctx.clone())
            .inject_batch(batch, mode, InjectionOptions::default())
            .await
    }

    /// Receive a notice after every completed dispatch
    pub fn subscribe_events(&self) -> broadcast::Receiver<EventNotice> {
        self.ctx.dispatcher().subscribe()
    }

    // Execution

    /// Run a scene
    pub async fn execute_scene(&self, name: &str, options: SceneOptions) -> Result<ExecutionResult> {
        SceneExecutor::new(self.ctx.clone())
            .execute(name, options)
            .await
    }

    /// Run a scenario
    pub async fn execute_scenario(&self, name: &str) -> Result<ExecutionResult> {
        ScenarioExecutor::new(self.ctx.clone()).execute(name).await
    }

    /// Run a scenario execution
    pub async fn execute_scenario_execution(
        &self,
        name: &str,
        options: ExecutionOptions,
    ) -> Result<AggregateResult> {
        self.controller.execute(name, options).await
    }

    // Control

    /// Pause at the next await boundary
    pub fn pause(&self) {
        self.controller.pause();
    }

    /// Resume
    pub fn play(&self) {
        self.controller.play();
    }

    /// Whether paused
    pub fn is_paused(&self) -> bool {
        self.controller.is_paused()
    }

    /// Set the speed factor; returns the clamped factor applied
    pub fn set_speed(&self, factor: f64) -> f64 {
        self.controller.set_speed(factor)
    }

    /// Stop everything running
    pub fn stop(&self) {
        self.controller.stop();
    }

    /// Controller statistics
    pub fn statistics(&self) -> ExecutionStatistics {
        self.controller.statistics()
    }

    // Log

    /// Every log entry in sequence order
    pub fn get_log(&self) -> Vec<LogEntry> {
        self.ctx.logger().entries()
    }

    /// Log entries of one category
    pub fn log_entries(&self, category: LogCategory) -> Vec<LogEntry> {
        self.ctx.logger().entries_by_category(category)
    }

    /// Log as JSON lines
    pub fn export_log(&self) -> String {
        self.ctx.logger().to_json_lines()
    }

    /// Transitions recorded for `scene`, across all its runs
    pub fn scene_transitions(&self, scene: &str) -> Vec<SceneTransition> {
        self.ctx
            .logger()
            .entries_for(scene)
            .iter()
            .filter_map(SceneTransition::from_log_entry)
            .collect()
    }
}

impl Default for SimulationEngine {
    fn default() -> Self {
        // The default configuration always validates
        match Self::with_config(EngineConfig::default()) {
            Ok(engine) => engine,
            Err(err) => unreachable!("default configuration rejected: {err}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> SimulationEngine {
        SimulationEngine::with_config(EngineConfig::testing_defaults()).unwrap()
    }

    #[test]
    fn test_registration_is_logged() {
        let engine = engine();
        engine.register_event(EventDefinition::new("Arrive")).unwrap();
        engine.register_event(EventDefinition::new("Leave")).unwrap();
        engine
            .register_scene(SceneDefinition::new("Dock", "Arrive", "Leave"))
            .unwrap();
        assert!(engine
            .register_scene(SceneDefinition::new("Dock", "Arrive", "Leave"))
            .is_err());

        let registrations = engine.log_entries(LogCategory::Registration);
        assert_eq!(registrations.len(), 3);
        assert_eq!(registrations[2].summary, "scene registered");
        assert_eq!(engine.log_entries(LogCategory::Error).len(), 1);
    }

    #[test]
    fn test_registration_errors_are_logged() {
        let engine = engine();
        let noop = || Task::sync("noop", "Arrive", |_| Ok(Value::Null));
        let callback: WatchCallback = Arc::new(|_: &Arc<EngineContext>, _: &crate::WatchFired| {});

        engine.register_event(EventDefinition::new("Arrive")).unwrap();
        engine.register_task(noop()).unwrap();
        engine.watch_condition("docked", "dock.busy", callback.clone()).unwrap();

        assert!(engine.register_event(EventDefinition::new("Arrive")).is_err());
        assert!(engine
            .register_task(Task::sync("lost", "Ghost", |_| Ok(Value::Null)))
            .is_err());
        assert!(engine.register_task(noop()).is_err());
        assert!(engine.bind_state_path("dock..busy", json!(false)).is_err());
        assert!(engine.watch_condition("docked", "dock.busy", callback).is_err());

        let kinds: Vec<Value> = engine
            .log_entries(LogCategory::Error)
            .into_iter()
            .map(|entry| entry.trace["kind"].clone())
            .collect();
        assert_eq!(
            kinds,
            vec![
                json!("duplicate_event"),
                json!("unknown_event"),
                json!("duplicate_definition"),
                json!("state"),
                json!("duplicate_definition"),
            ]
        );
    }

    #[test]
    fn test_malformed_condition_rejected() {
        let engine = engine();
        let callback: WatchCallback = Arc::new(|_: &Arc<EngineContext>, _: &crate::WatchFired| {});
        assert!(engine.watch_condition("w", "a >", callback).is_err());
        assert!(engine.watch_info("w").is_none());
    }

    #[test]
    fn test_engines_are_isolated() {
        let a = engine();
        let b = engine();
        a.update_state("x", json!(1)).unwrap();
        assert_eq!(b.get_state("x"), None);
    }

    #[test]
    fn test_speed_is_clamped() {
        let engine = engine();
        assert_eq!(engine.set_speed(1e9), 1000.0);
        assert_eq!(engine.set_speed(-1.0), 0.01);
    }

    #[test]
    fn test_from_toml() {
        let engine = SimulationEngine::from_toml_str("max_nesting_depth = 4").unwrap();
        assert_eq!(engine.context().config().max_nesting_depth, 4);
        assert!(SimulationEngine::from_toml_str("max_nesting_depth = 0").is_err());
    }
}
