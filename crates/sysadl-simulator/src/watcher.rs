//! Reactive condition watcher
//!
//! Watches are indexed by the property paths their expression reads. A write
//! to `P` re-evaluates only the watches that depend on `P`, on an ancestor
//! record of `P`, or on a path below `P`. A callback fires on the rising edge
//! of its condition (false to true) and never for the state present at
//! registration.
//!
//! Callbacks and state listeners run after the watcher lock is released, so
//! they may write state, register watches or fire events.

use crate::context::EngineContext;
use crate::error::{EngineError, Result};
use indexmap::{IndexMap, IndexSet};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use sysadl_core::{EvaluationError, Expression, LogCategory, StatePath, StateWrite, Value};

/// Callback invoked when a watch fires
pub type WatchCallback = Arc<dyn Fn(&Arc<EngineContext>, &WatchFired) + Send + Sync>;

/// Callback invoked when a subscribed path changes
pub type StateListener = Arc<dyn Fn(&StateChange) + Send + Sync>;

/// Box a closure as a [`WatchCallback`]
pub fn watch_callback<F>(f: F) -> WatchCallback
where
    F: Fn(&Arc<EngineContext>, &WatchFired) + Send + Sync + 'static,
{
    Arc::new(f)
}

/// How a watch behaves after it fires
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchMode {
    /// Disarm after the first firing until explicitly rearmed
    #[default]
    OneShot,
    /// Fire on every rising edge
    Persistent,
}

/// Registration options
#[derive(Debug, Clone, Default)]
pub struct WatchOptions {
    /// Firing behaviour
    pub mode: WatchMode,
    /// Run that owns the watch; stopping the run removes it
    pub owner: Option<String>,
}

impl WatchOptions {
    /// Options for a persistent watch
    pub fn persistent() -> Self {
        Self {
            mode: WatchMode::Persistent,
            owner: None,
        }
    }

    /// Attach an owner
    pub fn owned_by(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }
}

/// Passed to a watch callback when it fires
#[derive(Debug, Clone, PartialEq)]
pub struct WatchFired {
    /// Watch identifier
    pub id: String,
    /// Condition source
    pub expression: String,
    /// Path whose write caused the rising edge
    pub trigger: StatePath,
    /// Number of times this watch has fired, including this one
    pub fire_count: u64,
}

/// Passed to a state listener
#[derive(Debug, Clone, PartialEq)]
pub struct StateChange {
    /// Written path
    pub path: StatePath,
    /// Visible value before the write
    pub previous: Option<Value>,
    /// Written value
    pub value: Value,
}

/// Read-only view of a registered watch
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WatchInfo {
    /// Watch identifier
    pub id: String,
    /// Condition source
    pub expression: String,
    /// Paths the condition reads
    pub dependent_paths: Vec<String>,
    /// Value of the condition after the last evaluation
    pub last_value: bool,
    /// Whether the watch can fire
    pub armed: bool,
    /// Firing behaviour
    pub mode: WatchMode,
    /// Owning run
    pub owner: Option<String>,
    /// Number of firings so far
    pub fire_count: u64,
}

struct Watch {
    expression: Expression,
    last_value: bool,
    armed: bool,
    mode: WatchMode,
    owner: Option<String>,
    fire_count: u64,
    callback: WatchCallback,
}

struct Listener {
    path: StatePath,
    callback: StateListener,
}

#[derive(Default)]
struct WatcherState {
    watches: IndexMap<String, Watch>,
    /// Dependent path -> watch ids
    by_path: HashMap<String, IndexSet<String>>,
    /// Proper prefix of a dependent path -> watch ids
    by_prefix: HashMap<String, IndexSet<String>>,
    listeners: IndexMap<u64, Listener>,
    next_listener: u64,
    evaluations: u64,
}

impl WatcherState {
    fn index(&mut self, id: &str, expression: &Expression) {
        for path in expression.dependent_paths() {
            self.by_path
                .entry(path.clone())
                .or_default()
                .insert(id.to_string());
            if let Ok(parsed) = StatePath::parse(path.as_str()) {
                for prefix in parsed.ancestors() {
                    self.by_prefix
                        .entry(prefix.to_string())
                        .or_default()
                        .insert(id.to_string());
                }
            }
        }
    }

    fn unindex(&mut self, id: &str) {
        for index in [&mut self.by_path, &mut self.by_prefix] {
            index.retain(|_, ids| {
                ids.shift_remove(id);
                !ids.is_empty()
            });
        }
    }

    /// Watches that may observe a write to `path`, in registration order
    fn candidates(&self, path: &StatePath) -> Vec<String> {
        let mut lookups: Vec<(&HashMap<String, IndexSet<String>>, &str)> =
            vec![(&self.by_path, path.as_str()), (&self.by_prefix, path.as_str())];
        lookups.extend(path.ancestors().into_iter().map(|a| (&self.by_path, a)));

        let mut ids: IndexSet<&String> = IndexSet::new();
        for (index, key) in lookups {
            if let Some(found) = index.get(key) {
                ids.extend(found.iter());
            }
        }

        let mut ordered: Vec<(usize, String)> = ids
            .into_iter()
            .filter_map(|id| self.watches.get_index_of(id).map(|pos| (pos, id.clone())))
            .collect();
        ordered.sort_by_key(|(pos, _)| *pos);
        ordered.into_iter().map(|(_, id)| id).collect()
    }
}

/// Registry of condition watches and state listeners
pub struct ConditionWatcher {
    state: Arc<Mutex<WatcherState>>,
}

impl fmt::Debug for ConditionWatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ConditionWatcher")
            .field("watches", &state.watches.len())
            .field("listeners", &state.listeners.len())
            .finish()
    }
}

impl Default for ConditionWatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl ConditionWatcher {
    /// Create an empty watcher
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(WatcherState::default())),
        }
    }

    /// Register a watch and seed its last value from the current state.
    ///
    /// Returns the seeded value. A watch whose condition already holds does
    /// not fire until the condition falls and rises again.
    pub fn watch(
        &self,
        ctx: &EngineContext,
        id: impl Into<String>,
        expression: Expression,
        options: WatchOptions,
        callback: WatchCallback,
    ) -> Result<bool> {
        let id = id.into();
        let seeded = seed(ctx, &id, &expression);
        {
            let mut state = self.state.lock();
            if state.watches.contains_key(&id) {
                drop(state);
                let err = EngineError::duplicate_definition("watch", &id);
                ctx.log_error(&id, &err);
                return Err(err);
            }
            state.index(&id, &expression);
            state.watches.insert(
                id.clone(),
                Watch {
                    expression: expression.clone(),
                    last_value: seeded,
                    armed: true,
                    mode: options.mode,
                    owner: options.owner.clone(),
                    fire_count: 0,
                    callback,
                },
            );
        }
        ctx.logger().record(
            LogCategory::Watch,
            &id,
            "watch registered",
            json!({
                "expression": expression.source(),
                "dependent_paths": expression.dependent_paths(),
                "initial": seeded,
                "mode": options.mode,
                "owner": options.owner,
            }),
        );
        Ok(seeded)
    }

    /// Re-evaluate the watches affected by `write`, then notify listeners
    pub(crate) fn on_write(&self, ctx: &Arc<EngineContext>, write: &StateWrite) {
        if !write.changed() {
            return;
        }

        let mut fired = Vec::new();
        let mut failures: Vec<(String, EvaluationError)> = Vec::new();
        let listeners: Vec<StateListener> = {
            let mut state = self.state.lock();
            let candidates = state.candidates(&write.path);
            for id in candidates {
                state.evaluations += 1;
                let Some(watch) = state.watches.get_mut(&id) else {
                    continue;
                };
                if !watch.armed {
                    continue;
                }
                match watch.expression.evaluate_bool(ctx.store()) {
                    Ok(now) => {
                        let rising = now && !watch.last_value;
                        watch.last_value = now;
                        if rising {
                            watch.fire_count += 1;
                            if watch.mode == WatchMode::OneShot {
                                watch.armed = false;
                            }
                            fired.push((
                                watch.callback.clone(),
                                WatchFired {
                                    id,
                                    expression: watch.expression.source().to_string(),
                                    trigger: write.path.clone(),
                                    fire_count: watch.fire_count,
                                },
                            ));
                        }
                    }
                    // last value is left untouched
                    Err(err) => failures.push((id, err)),
                }
            }
            state
                .listeners
                .values()
                .filter(|listener| listener.path.overlaps(&write.path))
                .map(|listener| listener.callback.clone())
                .collect()
        };

        for (id, err) in failures {
            ctx.log_error(&id, &EngineError::from(err));
        }
        for (callback, event) in fired {
            ctx.logger().record(
                LogCategory::Watch,
                &event.id,
                "condition satisfied",
                json!({
                    "expression": event.expression,
                    "trigger": event.trigger,
                    "fire_count": event.fire_count,
                }),
            );
            callback(ctx, &event);
        }
        if !listeners.is_empty() {
            let change = StateChange {
                path: write.path.clone(),
                previous: write.previous.clone(),
                value: write.value.clone(),
            };
            for listener in listeners {
                listener(&change);
            }
        }
    }

    /// Arm a watch again, re-seeding its last value from the current state
    pub fn rearm(&self, ctx: &EngineContext, id: &str) -> Result<()> {
        let expression = self
            .state
            .lock()
            .watches
            .get(id)
            .map(|watch| watch.expression.clone())
            .ok_or_else(|| unknown_watch(id))?;
        let seeded = seed(ctx, id, &expression);
        {
            let mut state = self.state.lock();
            let watch = state.watches.get_mut(id).ok_or_else(|| unknown_watch(id))?;
            watch.armed = true;
            watch.last_value = seeded;
        }
        ctx.logger()
            .record(LogCategory::Watch, id, "watch rearmed", json!({ "initial": seeded }));
        Ok(())
    }

    /// Stop a watch from firing without removing it
    pub fn disarm(&self, ctx: &EngineContext, id: &str) -> Result<()> {
        {
            let mut state = self.state.lock();
            let watch = state.watches.get_mut(id).ok_or_else(|| unknown_watch(id))?;
            watch.armed = false;
        }
        ctx.logger()
            .record(LogCategory::Watch, id, "watch disarmed", json!({}));
        Ok(())
    }

    /// Remove a watch. Returns whether it existed.
    pub fn remove(&self, ctx: &EngineContext, id: &str) -> bool {
        let removed = {
            let mut state = self.state.lock();
            let removed = state.watches.shift_remove(id).is_some();
            if removed {
                state.unindex(id);
            }
            removed
        };
        if removed {
            ctx.logger()
                .record(LogCategory::Watch, id, "watch removed", json!({}));
        }
        removed
    }

    /// Remove every watch owned by `owner`. Returns how many were removed.
    pub fn remove_owned_by(&self, ctx: &EngineContext, owner: &str) -> usize {
        let ids: Vec<String> = self
            .state
            .lock()
            .watches
            .iter()
            .filter(|(_, watch)| watch.owner.as_deref() == Some(owner))
            .map(|(id, _)| id.clone())
            .collect();
        ids.iter().filter(|id| self.remove(ctx, id)).count()
    }

    /// Snapshot of a watch
    pub fn info(&self, id: &str) -> Option<WatchInfo> {
        let state = self.state.lock();
        state.watches.get(id).map(|watch| WatchInfo {
            id: id.to_string(),
            expression: watch.expression.source().to_string(),
            dependent_paths: watch.expression.dependent_paths().to_vec(),
            last_value: watch.last_value,
            armed: watch.armed,
            mode: watch.mode,
            owner: watch.owner.clone(),
            fire_count: watch.fire_count,
        })
    }

    /// Registered watch ids in registration order
    pub fn ids(&self) -> Vec<String> {
        self.state.lock().watches.keys().cloned().collect()
    }

    /// Number of registered watches
    pub fn len(&self) -> usize {
        self.state.lock().watches.len()
    }

    /// Whether no watch is registered
    pub fn is_empty(&self) -> bool {
        self.state.lock().watches.is_empty()
    }

    /// Number of watch evaluations triggered by writes so far
    pub fn evaluation_count(&self) -> u64 {
        self.state.lock().evaluations
    }

    /// Call `callback` whenever `path`, an ancestor or a descendant changes
    pub fn subscribe(&self, path: StatePath, callback: StateListener) -> StateSubscription {
        let mut state = self.state.lock();
        let id = state.next_listener;
        state.next_listener += 1;
        state.listeners.insert(id, Listener { path, callback });
        StateSubscription {
            id,
            state: Arc::downgrade(&self.state),
        }
    }
}

fn seed(ctx: &EngineContext, id: &str, expression: &Expression) -> bool {
    match expression.evaluate_bool(ctx.store()) {
        Ok(value) => value,
        Err(err) => {
            ctx.log_error(id, &EngineError::from(err));
            false
        }
    }
}

fn unknown_watch(id: &str) -> EngineError {
    EngineError::invalid_definition(id, "no watch registered under this id")
}

/// Handle to a state listener
#[derive(Debug)]
pub struct StateSubscription {
    id: u64,
    state: Weak<Mutex<WatcherState>>,
}

impl StateSubscription {
    /// Stop receiving changes. Returns whether the listener was still registered.
    pub fn unsubscribe(&self) -> bool {
        self.state
            .upgrade()
            .is_some_and(|state| state.lock().listeners.shift_remove(&self.id).is_some())
    }

    /// Whether the listener is still registered
    pub fn is_active(&self) -> bool {
        self.state
            .upgrade()
            .is_some_and(|state| state.lock().listeners.contains_key(&self.id))
    }
}

/// Removes its watch when dropped
pub(crate) struct WatchGuard {
    ctx: Arc<EngineContext>,
    id: String,
}

impl WatchGuard {
    pub(crate) fn new(ctx: Arc<EngineContext>, id: String) -> Self {
        Self { ctx, id }
    }
}

impl Drop for WatchGuard {
    fn drop(&mut self) {
        self.ctx.watcher().remove(&self.ctx, &self.id);
    }
}
