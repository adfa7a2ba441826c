//! Event catalog and dispatcher
//!
//! Events are declared once with an optional parameter schema. Tasks attach
//! to an event by name and run in registration order whenever the event is
//! fired. A failing or panicking task is logged and does not stop its
//! siblings.
//!
//! Re-entrancy is tracked per dispatch chain: a task that fires an event
//! already being dispatched further up its own chain gets a skipped report
//! instead of recursing.
//!
//! Lifecycle hooks registered through the injector (`before`/`after` an
//! event, scene or scenario) are consumed here when their point is reached.

use crate::context::EngineContext;
use crate::error::{EngineError, Result};
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use sysadl_core::{EvaluationError, LogCategory, StateWrite};
use tokio::sync::{broadcast, oneshot};

/// Accepted type of an event parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterType {
    /// Anything
    #[default]
    Any,
    /// JSON number
    Number,
    /// JSON string
    String,
    /// JSON boolean
    Boolean,
    /// JSON object
    Object,
    /// JSON array
    Array,
}

impl ParameterType {
    fn accepts(self, value: &Value) -> bool {
        match self {
            Self::Any => true,
            Self::Number => value.is_number(),
            Self::String => value.is_string(),
            Self::Boolean => value.is_boolean(),
            Self::Object => value.is_object(),
            Self::Array => value.is_array(),
        }
    }
}

/// A declared event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventDefinition {
    /// Unique event name
    pub name: String,
    /// Expected type per parameter
    #[serde(default)]
    pub parameter_schema: IndexMap<String, ParameterType>,
    /// Parameters that must be present and non-null
    #[serde(default)]
    pub required_fields: Vec<String>,
}

impl EventDefinition {
    /// An event without parameters
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            parameter_schema: IndexMap::new(),
            required_fields: Vec::new(),
        }
    }

    /// Declare an optional parameter
    pub fn with_parameter(mut self, name: impl Into<String>, ty: ParameterType) -> Self {
        self.parameter_schema.insert(name.into(), ty);
        self
    }

    /// Declare a required parameter
    pub fn with_required(mut self, name: impl Into<String>, ty: ParameterType) -> Self {
        let name = name.into();
        self.parameter_schema.insert(name.clone(), ty);
        self.required_fields.push(name);
        self
    }

    /// Check a payload against the schema
    pub fn validate(&self, payload: &Map<String, Value>) -> Result<()> {
        for field in &self.required_fields {
            if payload.get(field).map_or(true, Value::is_null) {
                return Err(EngineError::missing_parameters(
                    &self.name,
                    format!("missing required field '{field}'"),
                ));
            }
        }
        for (field, ty) in &self.parameter_schema {
            if let Some(value) = payload.get(field).filter(|v| !v.is_null()) {
                if !ty.accepts(value) {
                    return Err(EngineError::missing_parameters(
                        &self.name,
                        format!(
                            "field '{field}' expected {ty:?}, got {}",
                            sysadl_core::value::type_name(value)
                        ),
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Error returned by a task effect
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{message}")]
pub struct TaskError {
    /// Description
    pub message: String,
}

impl TaskError {
    /// Create a task error
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl TaskError {
    /// Failure for an effect that panicked
    fn from_panic(panic: Box<dyn Any + Send>) -> Self {
        let detail = panic
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        Self::new(format!("task panicked: {detail}"))
    }
}

impl From<EngineError> for TaskError {
    fn from(err: EngineError) -> Self {
        Self::new(err.to_string())
    }
}

impl From<EvaluationError> for TaskError {
    fn from(err: EvaluationError) -> Self {
        Self::new(err.to_string())
    }
}

impl From<String> for TaskError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<&str> for TaskError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

/// Result of a task effect
pub type TaskResult = std::result::Result<Value, TaskError>;

/// Side effect run when a task's trigger event is dispatched
#[async_trait]
pub trait TaskEffect: Send + Sync {
    /// Run the effect
    async fn execute(&self, ctx: TaskContext) -> TaskResult;
}

struct FnEffect<F>(F);

#[async_trait]
impl<F, Fut> TaskEffect for FnEffect<F>
where
    F: Fn(TaskContext) -> Fut + Send + Sync,
    Fut: Future<Output = TaskResult> + Send,
{
    async fn execute(&self, ctx: TaskContext) -> TaskResult {
        (self.0)(ctx).await
    }
}

struct SyncEffect<F>(F);

#[async_trait]
impl<F> TaskEffect for SyncEffect<F>
where
    F: Fn(&TaskContext) -> TaskResult + Send + Sync,
{
    async fn execute(&self, ctx: TaskContext) -> TaskResult {
        (self.0)(&ctx)
    }
}

/// A named effect bound to a trigger event
#[derive(Clone)]
pub struct Task {
    name: String,
    trigger: String,
    effect: Arc<dyn TaskEffect>,
}

impl Task {
    /// Bind an effect to `trigger`
    pub fn new(
        name: impl Into<String>,
        trigger: impl Into<String>,
        effect: impl TaskEffect + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            trigger: trigger.into(),
            effect: Arc::new(effect),
        }
    }

    /// Bind an async closure to `trigger`
    pub fn from_fn<F, Fut>(name: impl Into<String>, trigger: impl Into<String>, f: F) -> Self
    where
        F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TaskResult> + Send + 'static,
    {
        Self::new(name, trigger, FnEffect(f))
    }

    /// Bind a synchronous closure to `trigger`
    pub fn sync<F>(name: impl Into<String>, trigger: impl Into<String>, f: F) -> Self
    where
        F: Fn(&TaskContext) -> TaskResult + Send + Sync + 'static,
    {
        Self::new(name, trigger, SyncEffect(f))
    }

    /// Task name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Trigger event
    pub fn trigger(&self) -> &str {
        &self.trigger
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("trigger", &self.trigger)
            .finish_non_exhaustive()
    }
}

/// Events currently being dispatched along one causal chain
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchChain(Vec<String>);

impl DispatchChain {
    /// Whether `event` is already being dispatched on this chain
    pub fn contains(&self, event: &str) -> bool {
        self.0.iter().any(|e| e == event)
    }

    /// Chain extended with `event`
    pub fn push(&self, event: &str) -> Self {
        let mut next = self.0.clone();
        next.push(event.to_string());
        Self(next)
    }

    /// Events on the chain, outermost first
    pub fn events(&self) -> &[String] {
        &self.0
    }
}

/// Handed to a task effect
#[derive(Debug, Clone)]
pub struct TaskContext {
    engine: Arc<EngineContext>,
    task: String,
    event: String,
    payload: Value,
    chain: DispatchChain,
}

impl TaskContext {
    /// Name of the running task
    pub fn task(&self) -> &str {
        &self.task
    }

    /// Triggering event
    pub fn event(&self) -> &str {
        &self.event
    }

    /// Event payload (always an object)
    pub fn payload(&self) -> &Value {
        &self.payload
    }

    /// A single payload parameter
    pub fn param(&self, name: &str) -> Option<&Value> {
        self.payload.get(name)
    }

    /// Read state
    pub fn state(&self, path: &str) -> Option<Value> {
        self.engine.get_state(path)
    }

    /// Write state, notifying dependent watches
    pub fn update_state(&self, path: &str, value: Value) -> Result<StateWrite> {
        self.engine.update_state(path, value)
    }

    /// Fire another event on the same dispatch chain
    pub async fn fire(&self, event: &str, payload: Value) -> Result<DispatchReport> {
        dispatch(&self.engine, event, payload, self.chain.clone()).await
    }

    /// Dispatch chain of this invocation, including the triggering event
    pub fn chain(&self) -> &DispatchChain {
        &self.chain
    }

    /// Shared engine context
    pub fn engine(&self) -> &Arc<EngineContext> {
        &self.engine
    }
}

/// Result of one task invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskOutcome {
    /// Task name
    pub task: String,
    /// Whether the effect returned `Ok`
    pub success: bool,
    /// Value returned by the effect
    pub output: Option<Value>,
    /// Error message
    pub error: Option<String>,
}

/// Result of one dispatch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchReport {
    /// Dispatched event
    pub event: String,
    /// Normalized payload
    pub payload: Value,
    /// True when the dispatch was skipped as re-entrant
    pub skipped: bool,
    /// Task outcomes in execution order
    pub tasks: Vec<TaskOutcome>,
    /// Sequence number of the broadcast notice
    pub notice_seq: Option<u64>,
}

impl DispatchReport {
    fn skipped(event: &str, payload: Value) -> Self {
        Self {
            event: event.to_string(),
            payload,
            skipped: true,
            tasks: Vec::new(),
            notice_seq: None,
        }
    }

    /// Number of failed tasks
    pub fn failed_tasks(&self) -> usize {
        self.tasks.iter().filter(|t| !t.success).count()
    }

    /// Whether every task succeeded
    pub fn all_succeeded(&self) -> bool {
        self.failed_tasks() == 0
    }
}

/// Broadcast after every completed dispatch
#[derive(Debug, Clone, PartialEq)]
pub struct EventNotice {
    /// Monotonic notice number
    pub seq: u64,
    /// Dispatched event
    pub event: String,
    /// Normalized payload
    pub payload: Value,
    /// Number of tasks that failed
    pub failed_tasks: usize,
}

/// Reference to a lifecycle point
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "name", rename_all = "snake_case")]
pub enum LifecycleRef {
    /// Dispatch of an event
    Event(String),
    /// Execution of a scene
    Scene(String),
    /// Execution of a scenario
    Scenario(String),
}

impl fmt::Display for LifecycleRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Event(name) => write!(f, "event:{name}"),
            Self::Scene(name) => write!(f, "scene:{name}"),
            Self::Scenario(name) => write!(f, "scenario:{name}"),
        }
    }
}

/// Side of a lifecycle point
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecyclePhase {
    /// Before the point starts
    Before,
    /// After the point completes
    After,
}

/// An injection waiting for a lifecycle point
pub(crate) struct PendingHook {
    pub(crate) id: String,
    pub(crate) target: LifecycleRef,
    pub(crate) phase: LifecyclePhase,
    pub(crate) event: String,
    pub(crate) payload: Value,
    pub(crate) owner: Option<String>,
    pub(crate) reply: Option<oneshot::Sender<Result<DispatchReport>>>,
}

/// Event catalog, task table and lifecycle hooks
pub struct EventDispatcher {
    events: RwLock<IndexMap<String, Arc<EventDefinition>>>,
    tasks: RwLock<IndexMap<String, Vec<Task>>>,
    hooks: Mutex<Vec<PendingHook>>,
    notices: broadcast::Sender<EventNotice>,
    next_notice: AtomicU64,
}

impl fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("events", &self.events.read().len())
            .field("hooks", &self.hooks.lock().len())
            .finish_non_exhaustive()
    }
}

impl EventDispatcher {
    /// Create an empty dispatcher whose notice channel holds `capacity` notices
    pub fn new(capacity: usize) -> Self {
        let (notices, _) = broadcast::channel(capacity.max(1));
        Self {
            events: RwLock::new(IndexMap::new()),
            tasks: RwLock::new(IndexMap::new()),
            hooks: Mutex::new(Vec::new()),
            notices,
            next_notice: AtomicU64::new(1),
        }
    }

    /// Declare an event. Names are unique.
    pub fn register_event(&self, ctx: &EngineContext, definition: EventDefinition) -> Result<()> {
        let name = definition.name.clone();
        {
            let mut events = self.events.write();
            if events.contains_key(&name) {
                let err = EngineError::duplicate_event(&name);
                ctx.log_error(&name, &err);
                return Err(err);
            }
            events.insert(name.clone(), Arc::new(definition));
        }
        ctx.logger()
            .record(LogCategory::Registration, &name, "event registered", json!({}));
        Ok(())
    }

    /// Attach a task to its trigger event, which must already be declared
    pub fn register_task(&self, ctx: &EngineContext, task: Task) -> Result<()> {
        if !self.has_event(task.trigger()) {
            let err = EngineError::unknown_event(task.trigger());
            ctx.log_error(&task.name, &err);
            return Err(err);
        }
        let (name, trigger) = (task.name.clone(), task.trigger.clone());
        {
            let mut tasks = self.tasks.write();
            let bound = tasks.entry(trigger.clone()).or_default();
            if bound.iter().any(|t| t.name == name) {
                drop(tasks);
                let err = EngineError::duplicate_definition("task", &name);
                ctx.log_error(&name, &err);
                return Err(err);
            }
            bound.push(task);
        }
        ctx.logger().record(
            LogCategory::Registration,
            &name,
            "task registered",
            json!({ "trigger": trigger }),
        );
        Ok(())
    }

    /// Declared event
    pub fn event(&self, name: &str) -> Option<Arc<EventDefinition>> {
        self.events.read().get(name).cloned()
    }

    /// Whether `name` is declared
    pub fn has_event(&self, name: &str) -> bool {
        self.events.read().contains_key(name)
    }

    /// Declared event names in registration order
    pub fn event_names(&self) -> Vec<String> {
        self.events.read().keys().cloned().collect()
    }

    /// Names of the tasks bound to `event`, in execution order
    pub fn task_names(&self, event: &str) -> Vec<String> {
        self.tasks
            .read()
            .get(event)
            .map(|tasks| tasks.iter().map(|t| t.name.clone()).collect())
            .unwrap_or_default()
    }

    /// Receive a notice after every completed dispatch
    pub fn subscribe(&self) -> broadcast::Receiver<EventNotice> {
        self.notices.subscribe()
    }

    pub(crate) fn add_hook(&self, hook: PendingHook) {
        self.hooks.lock().push(hook);
    }

    /// Number of lifecycle hooks waiting to fire
    pub fn pending_hooks(&self) -> usize {
        self.hooks.lock().len()
    }

    /// Drop the hook with `id`. Returns whether it was pending.
    pub fn remove_hook(&self, id: &str) -> bool {
        let mut hooks = self.hooks.lock();
        let before = hooks.len();
        hooks.retain(|hook| hook.id != id);
        hooks.len() != before
    }

    /// Drop every hook owned by `owner`
    pub fn remove_hooks_owned_by(&self, owner: &str) -> usize {
        let mut hooks = self.hooks.lock();
        let before = hooks.len();
        hooks.retain(|hook| hook.owner.as_deref() != Some(owner));
        before - hooks.len()
    }

    fn take_hooks(&self, target: &LifecycleRef, phase: LifecyclePhase) -> Vec<PendingHook> {
        let mut hooks = self.hooks.lock();
        let (due, keep): (Vec<_>, Vec<_>) = std::mem::take(&mut *hooks)
            .into_iter()
            .partition(|hook| hook.phase == phase && &hook.target == target);
        *hooks = keep;
        due
    }

    fn tasks_for(&self, event: &str) -> Vec<Task> {
        self.tasks.read().get(event).cloned().unwrap_or_default()
    }
}

fn normalize_payload(event: &str, payload: Value) -> Result<Value> {
    match payload {
        Value::Null => Ok(Value::Object(Map::new())),
        object @ Value::Object(_) => Ok(object),
        other => Err(EngineError::missing_parameters(
            event,
            format!(
                "payload must be an object, got {}",
                sysadl_core::value::type_name(&other)
            ),
        )),
    }
}

/// Dispatch `event` to its tasks on `chain`.
///
/// Fails for undeclared events and payloads that violate the schema. Task
/// failures are reported in the returned [`DispatchReport`].
pub fn dispatch(
    ctx: &Arc<EngineContext>,
    event: &str,
    payload: Value,
    chain: DispatchChain,
) -> BoxFuture<'static, Result<DispatchReport>> {
    let ctx = ctx.clone();
    let event = event.to_string();
    async move {
        let dispatcher = ctx.dispatcher();
        let definition = match dispatcher.event(&event) {
            Some(definition) => definition,
            None => {
                let err = EngineError::unknown_event(&event);
                ctx.log_error(&event, &err);
                return Err(err);
            }
        };
        let checked = normalize_payload(&event, payload).and_then(|payload| {
            if let Value::Object(fields) = &payload {
                definition.validate(fields)?;
            }
            Ok(payload)
        });
        let payload = checked.map_err(|err| {
            ctx.log_error(&event, &err);
            err
        })?;

        if chain.contains(&event) {
            ctx.logger().record(
                LogCategory::Skip,
                &event,
                "re-entrant dispatch skipped",
                json!({ "chain": chain.events() }),
            );
            return Ok(DispatchReport::skipped(&event, payload));
        }
        let chain = chain.push(&event);
        let point = LifecycleRef::Event(event.clone());

        run_lifecycle_hooks(&ctx, point.clone(), LifecyclePhase::Before, chain.clone()).await;

        let tasks = dispatcher.tasks_for(&event);
        ctx.logger().record(
            LogCategory::Dispatch,
            &event,
            "event dispatched",
            json!({ "payload": payload, "tasks": tasks.len(), "chain": chain.events() }),
        );

        let mut outcomes = Vec::with_capacity(tasks.len());
        for task in tasks {
            let task_ctx = TaskContext {
                engine: ctx.clone(),
                task: task.name.clone(),
                event: event.clone(),
                payload: payload.clone(),
                chain: chain.clone(),
            };
            let effect = &task.effect;
            let run =
                AssertUnwindSafe(async move { effect.execute(task_ctx).await }).catch_unwind();
            match run.await.unwrap_or_else(|panic| Err(TaskError::from_panic(panic))) {
                Ok(output) => {
                    ctx.logger().record(
                        LogCategory::Task,
                        &task.name,
                        "task completed",
                        json!({ "event": event, "output": output }),
                    );
                    outcomes.push(TaskOutcome {
                        task: task.name,
                        success: true,
                        output: Some(output),
                        error: None,
                    });
                }
                Err(err) => {
                    let failure = EngineError::TaskExecution {
                        task: task.name.clone(),
                        event: event.clone(),
                        message: err.message.clone(),
                    };
                    ctx.log_error(&task.name, &failure);
                    outcomes.push(TaskOutcome {
                        task: task.name,
                        success: false,
                        output: None,
                        error: Some(err.message),
                    });
                }
            }
        }

        let mut report = DispatchReport {
            event: event.clone(),
            payload: payload.clone(),
            skipped: false,
            tasks: outcomes,
            notice_seq: None,
        };
        let seq = dispatcher.next_notice.fetch_add(1, Ordering::AcqRel);
        report.notice_seq = Some(seq);
        // No receivers is fine
        let _ = dispatcher.notices.send(EventNotice {
            seq,
            event: event.clone(),
            payload,
            failed_tasks: report.failed_tasks(),
        });

        run_lifecycle_hooks(&ctx, point, LifecyclePhase::After, chain).await;
        Ok(report)
    }
    .boxed()
}

/// Deliver every injection waiting on `target` at `phase`
pub fn run_lifecycle_hooks(
    ctx: &Arc<EngineContext>,
    target: LifecycleRef,
    phase: LifecyclePhase,
    chain: DispatchChain,
) -> BoxFuture<'static, ()> {
    let ctx = ctx.clone();
    async move {
        let due = ctx.dispatcher().take_hooks(&target, phase);
        for hook in due {
            ctx.logger().record(
                LogCategory::Injection,
                &hook.event,
                format!("{phase:?} {target} reached"),
                json!({ "injection_id": hook.id }),
            );
            let result = dispatch(&ctx, &hook.event, hook.payload, chain.clone()).await;
            match hook.reply {
                Some(reply) => {
                    let _ = reply.send(result);
                }
                None => {
                    if let Err(err) = result {
                        ctx.log_error(&hook.event, &err);
                    }
                }
            }
        }
    }
    .boxed()
}
