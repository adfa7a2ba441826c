//! Shared engine context
//!
//! One [`EngineContext`] is created per engine and handed to every component
//! as an `Arc`. There are no process-wide singletons: two engines in the same
//! process share nothing.

use crate::clock::SimulationClock;
use crate::config::{ConfigValidation, EngineConfig};
use crate::controller::ScenarioExecutionDefinition;
use crate::dispatcher::EventDispatcher;
use crate::error::{EngineError, Result};
use crate::scenario::ScenarioDefinition;
use crate::scene::SceneDefinition;
use crate::watcher::ConditionWatcher;
use indexmap::{IndexMap, IndexSet};
use parking_lot::{Mutex, RwLock};
use serde_json::json;
use std::sync::Arc;
use sysadl_core::{ExecutionLogger, LogCategory, StatePath, StateStore, StateWrite, Value};

/// Named definitions of one kind, in registration order
#[derive(Debug)]
pub struct Registry<T> {
    kind: &'static str,
    items: RwLock<IndexMap<String, Arc<T>>>,
}

impl<T> Registry<T> {
    /// Create an empty registry for definitions of `kind`
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            items: RwLock::new(IndexMap::new()),
        }
    }

    /// Insert a definition. Names are unique.
    pub fn insert(&self, name: impl Into<String>, item: T) -> Result<Arc<T>> {
        let name = name.into();
        let mut items = self.items.write();
        if items.contains_key(&name) {
            return Err(EngineError::duplicate_definition(self.kind, name));
        }
        let item = Arc::new(item);
        items.insert(name, item.clone());
        Ok(item)
    }

    /// Look up a definition
    pub fn get(&self, name: &str) -> Option<Arc<T>> {
        self.items.read().get(name).cloned()
    }

    /// Whether `name` is registered
    pub fn contains(&self, name: &str) -> bool {
        self.items.read().contains_key(name)
    }

    /// Registered names in registration order
    pub fn names(&self) -> Vec<String> {
        self.items.read().keys().cloned().collect()
    }

    /// Number of definitions
    pub fn len(&self) -> usize {
        self.items.read().len()
    }

    /// Whether the registry is empty
    pub fn is_empty(&self) -> bool {
        self.items.read().is_empty()
    }
}

/// Everything one engine's components share
#[derive(Debug)]
pub struct EngineContext {
    config: EngineConfig,
    logger: ExecutionLogger,
    state: StateStore,
    watcher: ConditionWatcher,
    dispatcher: EventDispatcher,
    clock: SimulationClock,
    scenes: Registry<SceneDefinition>,
    scenarios: Registry<ScenarioDefinition>,
    executions: Registry<ScenarioExecutionDefinition>,
    active_runs: Mutex<IndexSet<String>>,
}

impl EngineContext {
    /// Build a context after validating `config`
    pub fn new(config: EngineConfig) -> Result<Arc<Self>> {
        config.validate()?;
        Ok(Arc::new(Self {
            logger: ExecutionLogger::with_mirroring(config.mirror_to_tracing),
            state: StateStore::new(),
            watcher: ConditionWatcher::new(),
            dispatcher: EventDispatcher::new(config.event_channel_capacity),
            clock: SimulationClock::new(),
            scenes: Registry::new("scene"),
            scenarios: Registry::new("scenario"),
            executions: Registry::new("scenario execution"),
            active_runs: Mutex::new(IndexSet::new()),
            config,
        }))
    }

    /// Engine configuration
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Execution log
    pub fn logger(&self) -> &ExecutionLogger {
        &self.logger
    }

    /// Condition watcher
    pub fn watcher(&self) -> &ConditionWatcher {
        &self.watcher
    }

    /// Event catalog and dispatcher
    pub fn dispatcher(&self) -> &EventDispatcher {
        &self.dispatcher
    }

    /// Pause, speed and stop controls
    pub fn clock(&self) -> &SimulationClock {
        &self.clock
    }

    /// Registered scenes
    pub fn scenes(&self) -> &Registry<SceneDefinition> {
        &self.scenes
    }

    /// Registered scenarios
    pub fn scenarios(&self) -> &Registry<ScenarioDefinition> {
        &self.scenarios
    }

    /// Registered scenario executions
    pub fn executions(&self) -> &Registry<ScenarioExecutionDefinition> {
        &self.executions
    }

    /// Read-only access to the store for expression evaluation.
    ///
    /// Writes must go through [`EngineContext::update_state`].
    pub(crate) fn store(&self) -> &StateStore {
        &self.state
    }

    /// Value visible at `path`
    pub fn get_state(&self, path: &str) -> Option<Value> {
        self.state.get(path)
    }

    /// Copy of every state binding
    pub fn state_snapshot(&self) -> IndexMap<String, Value> {
        self.state.snapshot()
    }

    /// Write a state path and notify dependent watches and subscribers
    pub fn update_state(self: &Arc<Self>, path: &str, value: Value) -> Result<StateWrite> {
        let write = self.state.set(path, value).map_err(|err| {
            let err = EngineError::from(err);
            self.log_error(path, &err);
            err
        })?;
        self.logger.record(
            LogCategory::State,
            write.path.as_str(),
            "state updated",
            json!({
                "previous": write.previous,
                "value": write.value,
                "version": write.version,
            }),
        );
        self.watcher.on_write(self, &write);
        Ok(write)
    }

    /// Bind a path to its initial value
    pub fn bind_state_path(self: &Arc<Self>, path: &str, initial: Value) -> Result<StateWrite> {
        let path = StatePath::parse(path).map_err(|err| {
            let err = EngineError::from(err);
            self.log_error(path, &err);
            err
        })?;
        let write = self.state.bind(&path, initial);
        self.logger.record(
            LogCategory::Registration,
            path.as_str(),
            "state path bound",
            json!({ "initial": write.value }),
        );
        self.watcher.on_write(self, &write);
        Ok(write)
    }

    /// Record an error entry
    pub fn log_error(&self, who: &str, err: &EngineError) {
        self.logger.record(
            LogCategory::Error,
            who,
            err.to_string(),
            json!({ "kind": err.kind() }),
        );
    }

    pub(crate) fn begin_run(&self, run_id: &str) {
        self.active_runs.lock().insert(run_id.to_string());
    }

    pub(crate) fn end_run(&self, run_id: &str) {
        self.active_runs.lock().shift_remove(run_id);
    }

    /// Identifiers of runs that have not finished yet
    pub fn active_runs(&self) -> Vec<String> {
        self.active_runs.lock().iter().cloned().collect()
    }

    /// Drop watches and lifecycle hooks owned by any active run
    pub(crate) fn release_active_runs(&self) -> usize {
        let runs = self.active_runs();
        runs.iter()
            .map(|run| {
                self.watcher.remove_owned_by(self, run) + self.dispatcher.remove_hooks_owned_by(run)
            })
            .sum()
    }
}
