//! Scene execution
//!
//! A scene is a start/finish event pair guarded by pre- and post-conditions.
//! Its state machine only moves forward:
//!
//! ```text
//! Pending -> WaitingStart -> Running -> WaitingFinish -> Completed
//!    \____________\_____________\______________\______-> Failed | TimedOut
//! ```
//!
//! The executor subscribes to dispatch notices before checking
//! pre-conditions, so a start or finish event fired concurrently is never
//! missed.

use crate::clock::RunToken;
use crate::context::EngineContext;
use crate::dispatcher::{
    dispatch, run_lifecycle_hooks, DispatchChain, EventNotice, LifecyclePhase, LifecycleRef,
};
use crate::error::{EngineError, Result};
use crate::results::ExecutionResult;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use sysadl_core::{EvaluationError, Expression, LogCategory, LogEntry, StatePath};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::Instant;
use uuid::Uuid;

/// Scene state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SceneState {
    /// Created, pre-conditions not yet checked
    Pending,
    /// Waiting for the start event
    WaitingStart,
    /// Start event observed, effects being applied
    Running,
    /// Waiting for the finish event
    WaitingFinish,
    /// Finished with post-conditions satisfied
    Completed,
    /// A condition failed or an error occurred
    Failed,
    /// The scene timeout elapsed
    TimedOut,
}

impl SceneState {
    /// Whether no further transition is possible
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::TimedOut)
    }

    fn next(self) -> Option<Self> {
        match self {
            Self::Pending => Some(Self::WaitingStart),
            Self::WaitingStart => Some(Self::Running),
            Self::Running => Some(Self::WaitingFinish),
            Self::WaitingFinish => Some(Self::Completed),
            _ => None,
        }
    }

    /// Whether `self -> to` is a legal transition
    pub fn can_transition(self, to: SceneState) -> bool {
        !self.is_terminal() && (matches!(to, Self::Failed | Self::TimedOut) || self.next() == Some(to))
    }
}

impl fmt::Display for SceneState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// State write applied once the scene is running
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneEffect {
    /// Target path
    pub path: String,
    /// Value to write, evaluated against the current state
    pub value: Expression,
}

/// A registered scene
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneDefinition {
    /// Unique scene name
    pub name: String,
    /// Event that starts the scene
    pub start_event: String,
    /// Event that finishes the scene
    pub finish_event: String,
    /// Conditions that must hold before the start event
    #[serde(default)]
    pub pre_conditions: Vec<Expression>,
    /// Conditions that must hold once the finish event is observed
    #[serde(default)]
    pub post_conditions: Vec<Expression>,
    /// Scene timeout; the engine default when absent
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// State writes applied between start and finish
    #[serde(default)]
    pub effects: Vec<SceneEffect>,
}

impl SceneDefinition {
    /// Scene bounded by `start_event` and `finish_event`
    pub fn new(
        name: impl Into<String>,
        start_event: impl Into<String>,
        finish_event: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            start_event: start_event.into(),
            finish_event: finish_event.into(),
            pre_conditions: Vec::new(),
            post_conditions: Vec::new(),
            timeout_ms: None,
            effects: Vec::new(),
        }
    }

    /// Add a pre-condition
    pub fn with_pre_condition(mut self, source: &str) -> std::result::Result<Self, EvaluationError> {
        self.pre_conditions.push(Expression::parse(source)?);
        Ok(self)
    }

    /// Add a post-condition
    pub fn with_post_condition(mut self, source: &str) -> std::result::Result<Self, EvaluationError> {
        self.post_conditions.push(Expression::parse(source)?);
        Ok(self)
    }

    /// Add a state effect
    pub fn with_effect(mut self, path: &str, value: &str) -> std::result::Result<Self, EvaluationError> {
        self.effects.push(SceneEffect {
            path: path.to_string(),
            value: Expression::parse(value)?,
        });
        Ok(self)
    }

    /// Set the timeout
    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    /// Structural checks run at registration
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(EngineError::invalid_definition("<scene>", "scene name is empty"));
        }
        if self.start_event.trim().is_empty() || self.finish_event.trim().is_empty() {
            return Err(EngineError::invalid_definition(
                &self.name,
                "start and finish events are required",
            ));
        }
        if self.start_event == self.finish_event {
            return Err(EngineError::invalid_definition(
                &self.name,
                "start and finish events must differ",
            ));
        }
        if self.timeout_ms == Some(0) {
            return Err(EngineError::invalid_definition(&self.name, "timeout must be positive"));
        }
        for effect in &self.effects {
            StatePath::parse(effect.path.as_str())?;
        }
        Ok(())
    }
}

/// Per-run scene options
#[derive(Debug, Clone, Default)]
pub struct SceneOptions {
    /// Do not fire the start event; wait for someone else to
    pub external_start: bool,
    /// Parameters for the start event
    pub start_parameters: Value,
    /// Pause and stop token; a fresh clock token when absent
    pub token: Option<RunToken>,
    /// Dispatch chain for the start event
    pub chain: DispatchChain,
}

/// One recorded state change, as carried in the trace of a
/// [`LogCategory::SceneTransition`] entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneTransition {
    /// Previous state
    pub from: SceneState,
    /// New state
    pub to: SceneState,
    /// Failure reason
    pub reason: Option<String>,
    /// Scene run the transition belongs to
    pub run_id: String,
}

impl SceneTransition {
    /// Read a transition back from its log entry
    pub fn from_log_entry(entry: &LogEntry) -> Option<Self> {
        if entry.what != LogCategory::SceneTransition {
            return None;
        }
        serde_json::from_value(entry.trace.clone()).ok()
    }
}

struct SceneMachine {
    scene: String,
    run_id: String,
    state: Mutex<SceneState>,
}

impl SceneMachine {
    fn new(scene: &str, run_id: &str) -> Self {
        Self {
            scene: scene.to_string(),
            run_id: run_id.to_string(),
            state: Mutex::new(SceneState::Pending),
        }
    }

    fn state(&self) -> SceneState {
        *self.state.lock()
    }

    fn transition(&self, ctx: &EngineContext, to: SceneState, reason: Option<&str>) -> bool {
        let from = {
            let mut state = self.state.lock();
            let from = *state;
            if !from.can_transition(to) {
                return false;
            }
            *state = to;
            from
        };
        ctx.logger().record(
            LogCategory::SceneTransition,
            &self.scene,
            format!("{from} -> {to}"),
            json!({
                "from": from,
                "to": to,
                "reason": reason,
                "run_id": self.run_id,
            }),
        );
        true
    }
}

/// Drives scene state machines
#[derive(Debug, Clone)]
pub struct SceneExecutor {
    ctx: Arc<EngineContext>,
}

impl SceneExecutor {
    /// Executor bound to an engine context
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        Self { ctx }
    }

    /// Run scene `name` to a terminal state.
    ///
    /// Fails only for unknown scenes or events. Condition failures, timeouts
    /// and stops are reported in the returned result.
    pub async fn execute(&self, name: &str, options: SceneOptions) -> Result<ExecutionResult> {
        let ctx = &self.ctx;
        let Some(scene) = ctx.scenes().get(name) else {
            let err = EngineError::unknown_scene(name);
            ctx.log_error(name, &err);
            return Err(err);
        };
        for event in [&scene.start_event, &scene.finish_event] {
            if !ctx.dispatcher().has_event(event) {
                let err = EngineError::unknown_event(event.as_str());
                ctx.log_error(name, &err);
                return Err(err);
            }
        }

        let run_id = Uuid::new_v4().to_string();
        let token = options
            .token
            .clone()
            .unwrap_or_else(|| ctx.clock().token());
        let started = Instant::now();
        let point = LifecycleRef::Scene(scene.name.clone());
        run_lifecycle_hooks(ctx, point.clone(), LifecyclePhase::Before, options.chain.clone()).await;

        let machine = SceneMachine::new(&scene.name, &run_id);
        let notices = ctx.dispatcher().subscribe();
        let timeout_ms = scene.timeout_ms.unwrap_or(ctx.config().default_scene_timeout_ms);
        let limit = if ctx.config().scale_scene_timeouts {
            ctx.clock().scaled(timeout_ms)
        } else {
            Duration::from_millis(timeout_ms)
        };

        let run = self.drive(&scene, &machine, notices, &options, &token);
        let outcome = match tokio::time::timeout(limit, token.guard(run)).await {
            Err(_) => Err(EngineError::timeout(format!("scene {}", scene.name), timeout_ms)),
            Ok(Err(stopped)) => Err(stopped),
            Ok(Ok(result)) => result,
        };
        if let Err(err) = &outcome {
            let to = match err {
                EngineError::Timeout { .. } => SceneState::TimedOut,
                _ => SceneState::Failed,
            };
            machine.transition(ctx, to, Some(err.kind()));
            ctx.log_error(&scene.name, err);
        }

        run_lifecycle_hooks(ctx, point, LifecyclePhase::After, options.chain).await;

        let duration_ms = started.elapsed().as_millis() as u64;
        let result = match outcome {
            Ok(()) => ExecutionResult::completed(&scene.name, &run_id, duration_ms, Default::default()),
            Err(err) => {
                ExecutionResult::failed(&scene.name, &run_id, duration_ms, Default::default(), &err)
            }
        };
        Ok(result.with_scene_state(machine.state()))
    }

    async fn drive(
        &self,
        scene: &SceneDefinition,
        machine: &SceneMachine,
        mut notices: broadcast::Receiver<EventNotice>,
        options: &SceneOptions,
        token: &RunToken,
    ) -> Result<()> {
        let ctx = &self.ctx;
        for condition in &scene.pre_conditions {
            if !condition.evaluate_bool(ctx.store())? {
                return Err(EngineError::PreconditionFailure {
                    scene: scene.name.clone(),
                    condition: condition.source().to_string(),
                });
            }
        }
        machine.transition(ctx, SceneState::WaitingStart, None);

        if !options.external_start {
            dispatch(
                ctx,
                &scene.start_event,
                options.start_parameters.clone(),
                options.chain.clone(),
            )
            .await?;
        }
        // A start task may fire the finish event before the start notice lands
        let finish_seen =
            wait_for(ctx, &mut notices, &scene.start_event, Some(&scene.finish_event), token).await?;
        machine.transition(ctx, SceneState::Running, None);

        for effect in &scene.effects {
            let value = effect.value.evaluate(ctx.store())?;
            ctx.update_state(&effect.path, value)?;
        }
        machine.transition(ctx, SceneState::WaitingFinish, None);

        if !finish_seen {
            wait_for(ctx, &mut notices, &scene.finish_event, None, token).await?;
        }

        for condition in &scene.post_conditions {
            if !condition.evaluate_bool(ctx.store())? {
                return Err(EngineError::PostconditionFailure {
                    scene: scene.name.clone(),
                    condition: condition.source().to_string(),
                });
            }
        }
        machine.transition(ctx, SceneState::Completed, None);
        Ok(())
    }
}

/// Wait for a notice of `event`. Returns whether `also` was seen first.
async fn wait_for(
    ctx: &EngineContext,
    notices: &mut broadcast::Receiver<EventNotice>,
    event: &str,
    also: Option<&str>,
    token: &RunToken,
) -> Result<bool> {
    let mut also_seen = false;
    loop {
        token.checkpoint().await?;
        match notices.recv().await {
            Ok(notice) if notice.event == event => return Ok(also_seen),
            Ok(notice) => {
                if also == Some(notice.event.as_str()) {
                    also_seen = true;
                }
            }
            Err(RecvError::Lagged(missed)) => {
                ctx.logger().record(
                    LogCategory::Error,
                    event,
                    "event notices lagged",
                    json!({ "missed": missed }),
                );
            }
            Err(RecvError::Closed) => return Err(EngineError::Stopped),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transitions_only_move_forward() {
        use SceneState::*;
        assert!(Pending.can_transition(WaitingStart));
        assert!(!Pending.can_transition(Running));
        assert!(WaitingFinish.can_transition(Completed));
        assert!(Running.can_transition(TimedOut));
        assert!(!Completed.can_transition(Failed));
        assert!(!Failed.can_transition(Pending));
    }

    #[test]
    fn test_definition_validation() {
        assert!(SceneDefinition::new("Dock", "Arrive", "Leave").validate().is_ok());
        assert!(SceneDefinition::new("Dock", "", "Leave").validate().is_err());
        assert!(SceneDefinition::new("Dock", "Arrive", "Leave")
            .with_timeout(0)
            .validate()
            .is_err());
        assert!(SceneDefinition::new("Dock", "Arrive", "Leave")
            .with_effect("a..b", "1")
            .unwrap()
            .validate()
            .is_err());
    }

    #[test]
    fn test_definition_from_json() {
        let scene: SceneDefinition = serde_json::from_value(json!({
            "name": "Dock",
            "start_event": "Arrive",
            "finish_event": "Leave",
            "pre_conditions": ["bay.free"],
            "timeout_ms": 2000
        }))
        .unwrap();
        assert_eq!(scene.pre_conditions[0].source(), "bay.free");
        assert_eq!(scene.timeout_ms, Some(2000));
        assert!(scene.effects.is_empty());
    }
}
