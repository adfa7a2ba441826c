//! Event injection with timing
//!
//! An injection fires a declared event either right away, after a delay
//! scaled by the clock speed, when a state condition becomes true, or around
//! a lifecycle point of another event, scene or scenario. Every injection gets
//! a fresh identifier that appears in its log entries.

use crate::clock::RunToken;
use crate::context::EngineContext;
use crate::dispatcher::{
    dispatch, DispatchChain, DispatchReport, LifecyclePhase, LifecycleRef, PendingHook,
};
use crate::error::{EngineError, Result};
use crate::watcher::{watch_callback, WatchGuard, WatchMode, WatchOptions};
use futures::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use sysadl_core::{EvaluationError, Expression, LogCategory};
use tokio::sync::oneshot;
use tracing::debug;
use uuid::Uuid;

/// When an injected event is delivered
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InjectionTiming {
    /// Deliver now
    #[default]
    Immediate,
    /// Deliver after `ms` simulated milliseconds
    Delay {
        /// Delay before delivery
        ms: u64,
    },
    /// Deliver when `expression` becomes true
    Condition {
        /// State condition
        expression: Expression,
    },
    /// Deliver right before a lifecycle point starts
    Before {
        /// Lifecycle point
        target: LifecycleRef,
    },
    /// Deliver right after a lifecycle point completes
    After {
        /// Lifecycle point
        target: LifecycleRef,
    },
}

impl InjectionTiming {
    /// Delay timing
    pub fn delay(ms: u64) -> Self {
        Self::Delay { ms }
    }

    /// Condition timing, parsing `source`
    pub fn condition(source: &str) -> std::result::Result<Self, EvaluationError> {
        Ok(Self::Condition {
            expression: Expression::parse(source)?,
        })
    }

    /// Before timing
    pub fn before(target: LifecycleRef) -> Self {
        Self::Before { target }
    }

    /// After timing
    pub fn after(target: LifecycleRef) -> Self {
        Self::After { target }
    }
}

/// How a batch is delivered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchMode {
    /// One after another, each awaited before the next starts
    #[default]
    Sequential,
    /// All at once
    Parallel,
}

/// Per-call injection options
#[derive(Debug, Clone, Default)]
pub struct InjectionOptions {
    /// Return right away for `Immediate` and `Delay` timings and deliver in
    /// the background
    pub detach: bool,
    /// Wait for `Condition`, `Before` and `After` injections to be delivered
    pub await_trigger: bool,
    /// Run that owns pending watches and hooks
    pub owner: Option<String>,
    /// Pause and stop token; a fresh clock token when absent
    pub token: Option<RunToken>,
    /// Dispatch chain the delivery belongs to
    pub chain: DispatchChain,
}

/// Delivery state of an injection when `inject` returns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InjectionStatus {
    /// Dispatched
    Delivered,
    /// Dispatch skipped as re-entrant
    Skipped,
    /// Waiting for its delay, condition or lifecycle point
    Scheduled,
}

/// Result of an injection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InjectionOutcome {
    /// Unique injection id
    pub id: String,
    /// Injected event
    pub event: String,
    /// Delivery state
    pub status: InjectionStatus,
    /// Dispatch report once delivered
    pub report: Option<DispatchReport>,
    /// Requested delay for `Delay` timings
    pub delay_ms: Option<u64>,
}

impl InjectionOutcome {
    fn scheduled(id: String, event: &str, delay_ms: Option<u64>) -> Self {
        Self {
            id,
            event: event.to_string(),
            status: InjectionStatus::Scheduled,
            report: None,
            delay_ms,
        }
    }

    fn delivered(id: String, report: DispatchReport, delay_ms: Option<u64>) -> Self {
        let status = if report.skipped {
            InjectionStatus::Skipped
        } else {
            InjectionStatus::Delivered
        };
        Self {
            id,
            event: report.event.clone(),
            status,
            report: Some(report),
            delay_ms,
        }
    }
}

/// One entry of a batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchInjection {
    /// Event to inject
    pub event: String,
    /// Event parameters
    #[serde(default)]
    pub parameters: Value,
    /// Timing
    #[serde(default)]
    pub timing: InjectionTiming,
}

impl BatchInjection {
    /// Immediate injection of `event` with `parameters`
    pub fn new(event: impl Into<String>, parameters: Value) -> Self {
        Self {
            event: event.into(),
            parameters,
            timing: InjectionTiming::Immediate,
        }
    }

    /// Set the timing
    pub fn with_timing(mut self, timing: InjectionTiming) -> Self {
        self.timing = timing;
        self
    }
}

impl From<&str> for BatchInjection {
    fn from(event: &str) -> Self {
        Self::new(event, Value::Null)
    }
}

/// Schedules events against the dispatcher
#[derive(Debug, Clone)]
pub struct EventInjector {
    ctx: Arc<EngineContext>,
}

impl EventInjector {
    /// Injector bound to an engine context
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        Self { ctx }
    }

    /// Inject `event` with `parameters` at `timing`
    pub async fn inject(
        &self,
        event: &str,
        parameters: Value,
        timing: InjectionTiming,
        options: InjectionOptions,
    ) -> Result<InjectionOutcome> {
        let ctx = &self.ctx;
        if !ctx.dispatcher().has_event(event) {
            let err = EngineError::unknown_event(event);
            ctx.log_error(event, &err);
            return Err(err);
        }

        let id = Uuid::new_v4().to_string();
        ctx.logger().record(
            LogCategory::Injection,
            event,
            "injection scheduled",
            json!({ "injection_id": id, "timing": timing, "owner": options.owner }),
        );
        let token = options
            .token
            .clone()
            .unwrap_or_else(|| ctx.clock().token());

        match timing {
            InjectionTiming::Immediate => {
                let delivery = deliver(
                    ctx.clone(),
                    id.clone(),
                    event.to_string(),
                    parameters,
                    options.chain,
                    token,
                    0,
                );
                if options.detach {
                    spawn_delivery(ctx, event, delivery);
                    Ok(InjectionOutcome::scheduled(id, event, None))
                } else {
                    Ok(InjectionOutcome::delivered(id, delivery.await?, None))
                }
            }
            InjectionTiming::Delay { ms } => {
                let delivery = deliver(
                    ctx.clone(),
                    id.clone(),
                    event.to_string(),
                    parameters,
                    options.chain,
                    token,
                    ms,
                );
                if options.detach {
                    spawn_delivery(ctx, event, delivery);
                    Ok(InjectionOutcome::scheduled(id, event, Some(ms)))
                } else {
                    Ok(InjectionOutcome::delivered(id, delivery.await?, Some(ms)))
                }
            }
            InjectionTiming::Condition { expression } => {
                self.inject_on_condition(id, event, parameters, expression, options, token)
                    .await
            }
            InjectionTiming::Before { target } => {
                self.inject_at(id, event, parameters, target, LifecyclePhase::Before, options, token)
                    .await
            }
            InjectionTiming::After { target } => {
                self.inject_at(id, event, parameters, target, LifecyclePhase::After, options, token)
                    .await
            }
        }
    }

    /// Inject several events, sequentially or all at once
    pub async fn inject_batch(
        &self,
        batch: Vec<BatchInjection>,
        mode: BatchMode,
        options: InjectionOptions,
    ) -> Result<Vec<InjectionOutcome>> {
        self.ctx.logger().record(
            LogCategory::Injection,
            "batch",
            format!("{mode:?} batch of {}", batch.len()),
            json!({ "events": batch.iter().map(|b| b.event.as_str()).collect::<Vec<_>>() }),
        );
        match mode {
            BatchMode::Sequential => {
                let mut outcomes = Vec::with_capacity(batch.len());
                for item in batch {
                    outcomes.push(
                        self.inject(&item.event, item.parameters, item.timing, options.clone())
                            .await?,
                    );
                }
                Ok(outcomes)
            }
            BatchMode::Parallel => join_all(batch.into_iter().map(|item| {
                let options = options.clone();
                async move {
                    self.inject(&item.event, item.parameters, item.timing, options)
                        .await
                }
            }))
            .await
            .into_iter()
            .collect(),
        }
    }

    async fn inject_on_condition(
        &self,
        id: String,
        event: &str,
        parameters: Value,
        expression: Expression,
        options: InjectionOptions,
        token: RunToken,
    ) -> Result<InjectionOutcome> {
        let ctx = &self.ctx;
        if ctx.config().fire_condition_injection_if_already_true
            && expression.evaluate_bool(ctx.store()).unwrap_or(false)
        {
            let report = deliver(
                ctx.clone(),
                id.clone(),
                event.to_string(),
                parameters,
                options.chain,
                token,
                0,
            )
            .await?;
            return Ok(InjectionOutcome::delivered(id, report, None));
        }

        let (reply, delivered) = oneshot::channel();
        let reply = Arc::new(Mutex::new(options.await_trigger.then_some(reply)));
        let watch_id = format!("injection:{id}");
        let callback = {
            let (id, event, chain, token) = (
                id.clone(),
                event.to_string(),
                options.chain.clone(),
                token.clone(),
            );
            watch_callback(move |ctx, fired| {
                ctx.watcher().remove(ctx, &fired.id);
                let delivery = deliver(
                    ctx.clone(),
                    id.clone(),
                    event.clone(),
                    parameters.clone(),
                    chain.clone(),
                    token.clone(),
                    0,
                );
                match reply.lock().take() {
                    Some(reply) => spawn_reply(ctx, &event, delivery, reply),
                    None => spawn_delivery(ctx, &event, delivery),
                }
            })
        };
        let mode = WatchOptions {
            mode: WatchMode::OneShot,
            owner: options.owner.clone(),
        };
        ctx.watcher()
            .watch(ctx, watch_id.clone(), expression, mode, callback)?;

        if !options.await_trigger {
            return Ok(InjectionOutcome::scheduled(id, event, None));
        }
        let _guard = WatchGuard::new(ctx.clone(), watch_id);
        let report = token
            .guard(delivered)
            .await?
            .map_err(|_| EngineError::Stopped)??;
        Ok(InjectionOutcome::delivered(id, report, None))
    }

    #[allow(clippy::too_many_arguments)]
    async fn inject_at(
        &self,
        id: String,
        event: &str,
        parameters: Value,
        target: LifecycleRef,
        phase: LifecyclePhase,
        options: InjectionOptions,
        token: RunToken,
    ) -> Result<InjectionOutcome> {
        let ctx = &self.ctx;
        let known = match &target {
            LifecycleRef::Event(name) => ctx.dispatcher().has_event(name),
            LifecycleRef::Scene(name) => ctx.scenes().contains(name),
            LifecycleRef::Scenario(name) => ctx.scenarios().contains(name),
        };
        if !known {
            let err = match &target {
                LifecycleRef::Event(name) => EngineError::unknown_event(name),
                LifecycleRef::Scene(name) => EngineError::unknown_scene(name),
                LifecycleRef::Scenario(name) => EngineError::unknown_scenario(name),
            };
            ctx.log_error(event, &err);
            return Err(err);
        }

        let (reply, delivered) = oneshot::channel();
        ctx.dispatcher().add_hook(PendingHook {
            id: id.clone(),
            target,
            phase,
            event: event.to_string(),
            payload: parameters,
            owner: options.owner.clone(),
            reply: options.await_trigger.then_some(reply),
        });

        if !options.await_trigger {
            return Ok(InjectionOutcome::scheduled(id, event, None));
        }
        let outcome = token.guard(delivered).await;
        let report = match outcome {
            Ok(Ok(result)) => result?,
            Ok(Err(_)) | Err(_) => {
                ctx.dispatcher().remove_hook(&id);
                return Err(EngineError::Stopped);
            }
        };
        Ok(InjectionOutcome::delivered(id, report, None))
    }
}

async fn deliver(
    ctx: Arc<EngineContext>,
    id: String,
    event: String,
    parameters: Value,
    chain: DispatchChain,
    token: RunToken,
    delay_ms: u64,
) -> Result<DispatchReport> {
    if delay_ms > 0 {
        token.sleep(delay_ms).await?;
    } else {
        token.checkpoint().await?;
    }
    ctx.logger().record(
        LogCategory::Injection,
        &event,
        "injection delivered",
        json!({ "injection_id": id, "delay_ms": delay_ms }),
    );
    dispatch(&ctx, &event, parameters, chain).await
}

fn spawn_delivery(
    ctx: &Arc<EngineContext>,
    event: &str,
    delivery: impl std::future::Future<Output = Result<DispatchReport>> + Send + 'static,
) {
    let Ok(handle) = tokio::runtime::Handle::try_current() else {
        ctx.log_error(event, &EngineError::configuration("no async runtime to deliver on"));
        return;
    };
    debug!(event = %event, "Spawning detached delivery");
    let (ctx, event) = (ctx.clone(), event.to_string());
    handle.spawn(async move {
        if let Err(err) = delivery.await {
            ctx.log_error(&event, &err);
        }
    });
}

fn spawn_reply(
    ctx: &Arc<EngineContext>,
    event: &str,
    delivery: impl std::future::Future<Output = Result<DispatchReport>> + Send + 'static,
    reply: oneshot::Sender<Result<DispatchReport>>,
) {
    let Ok(handle) = tokio::runtime::Handle::try_current() else {
        ctx.log_error(event, &EngineError::configuration("no async runtime to deliver on"));
        return;
    };
    handle.spawn(async move {
        let _ = reply.send(delivery.await);
    });
}
