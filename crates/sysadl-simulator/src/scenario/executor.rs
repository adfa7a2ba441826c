//! Scenario interpreter
//!
//! Runs a scenario body step by step. Loops are bounded by the configured
//! iteration limit and nested scenarios by the nesting limit; a scenario
//! that reaches itself through nesting is rejected. Every suspension point
//! goes through the run token, so pause and stop take effect between steps.

use super::scope::Scope;
use super::types::{ScenarioDefinition, ScenarioNode};
use crate::clock::RunToken;
use crate::context::EngineContext;
use crate::dispatcher::{run_lifecycle_hooks, DispatchChain, LifecyclePhase, LifecycleRef};
use crate::error::{EngineError, Result};
use crate::injector::{EventInjector, InjectionOptions};
use crate::results::{ExecutionResult, ExecutionStatus};
use crate::scene::{SceneExecutor, SceneOptions};
use crate::watcher::{watch_callback, WatchGuard, WatchOptions};
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use sysadl_core::{EvaluationError, Expression, LogCategory, Resolver};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

/// Control-flow signal of a block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Next,
    Break,
}

/// Position of the interpreter: scenario being run and the nesting stack
#[derive(Clone, Copy)]
struct Frame<'a> {
    scenario: &'a str,
    run_id: &'a str,
    stack: &'a [String],
}

/// Interprets registered scenarios
#[derive(Debug, Clone)]
pub struct ScenarioExecutor {
    ctx: Arc<EngineContext>,
    token: RunToken,
    chain: DispatchChain,
}

impl ScenarioExecutor {
    /// Executor with a fresh clock token
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        let token = ctx.clock().token();
        Self {
            ctx,
            token,
            chain: DispatchChain::default(),
        }
    }

    /// Use `token` for pause and stop
    pub fn with_token(mut self, token: RunToken) -> Self {
        self.token = token;
        self
    }

    /// Run scenario `name`.
    ///
    /// Fails only when the scenario is unknown. Errors raised by the body
    /// abort the run and are reported in the result, together with the
    /// variables as they were when it stopped.
    pub async fn execute(&self, name: &str) -> Result<ExecutionResult> {
        let ctx = &self.ctx;
        let Some(scenario) = ctx.scenarios().get(name) else {
            let err = EngineError::unknown_scenario(name);
            ctx.log_error(name, &err);
            return Err(err);
        };

        let run_id = Uuid::new_v4().to_string();
        ctx.begin_run(&run_id);
        ctx.logger().record(
            LogCategory::Scenario,
            name,
            "scenario started",
            json!({ "run_id": run_id }),
        );

        debug!(scenario = %name, run_id = %run_id, "Running scenario");
        let started = Instant::now();
        let mut scope = Scope::new(scenario.variables.clone());
        let stack = vec![scenario.name.clone()];
        let frame = Frame {
            scenario: &scenario.name,
            run_id: &run_id,
            stack: &stack,
        };
        let outcome = self.run_scenario(frame, &scenario, &mut scope).await;
        ctx.end_run(&run_id);

        let duration_ms = started.elapsed().as_millis() as u64;
        let result = match outcome {
            Ok(()) => ExecutionResult::completed(name, &run_id, duration_ms, scope.visible()),
            Err(err) => {
                ctx.log_error(name, &err);
                ExecutionResult::failed(name, &run_id, duration_ms, scope.visible(), &err)
            }
        };
        ctx.logger().record(
            LogCategory::Scenario,
            name,
            if result.success {
                "scenario completed"
            } else {
                "scenario failed"
            },
            json!({
                "run_id": run_id,
                "duration_ms": duration_ms,
                "status": result.status,
                "error": result.error,
            }),
        );
        Ok(result)
    }

    fn run_scenario<'a>(
        &'a self,
        frame: Frame<'a>,
        scenario: &'a ScenarioDefinition,
        scope: &'a mut Scope,
    ) -> BoxFuture<'a, Result<()>> {
        async move {
            let point = LifecycleRef::Scenario(scenario.name.clone());
            run_lifecycle_hooks(&self.ctx, point.clone(), LifecyclePhase::Before, self.chain.clone())
                .await;
            let outcome = self.run_block(frame, &scenario.body, scope).await;
            run_lifecycle_hooks(&self.ctx, point, LifecyclePhase::After, self.chain.clone()).await;
            outcome.map(|_| ())
        }
        .boxed()
    }

    fn run_block<'a>(
        &'a self,
        frame: Frame<'a>,
        nodes: &'a [ScenarioNode],
        scope: &'a mut Scope,
    ) -> BoxFuture<'a, Result<Flow>> {
        async move {
            for node in nodes {
                self.token.ensure_running()?;
                if self.run_node(frame, node, scope).await? == Flow::Break {
                    return Ok(Flow::Break);
                }
            }
            Ok(Flow::Next)
        }
        .boxed()
    }

    async fn run_node(&self, frame: Frame<'_>, node: &ScenarioNode, scope: &mut Scope) -> Result<Flow> {
        match node {
            ScenarioNode::VariableAssignment {
                variable,
                value,
                export,
            } => {
                let value = self.evaluate(value, scope)?;
                scope.assign(variable, value, *export);
            }

            ScenarioNode::IfStatement {
                condition,
                then_body,
                else_body,
            } => {
                let branch = if self.condition(condition, scope)? {
                    then_body
                } else {
                    else_body
                };
                return self.run_block(frame, branch, scope).await;
            }

            ScenarioNode::ForLoop {
                variable,
                start,
                end,
                step,
                body,
            } => {
                let start = self.number(start, scope)?;
                let end = self.number(end, scope)?;
                let step = match step {
                    Some(step) => self.number(step, scope)?,
                    None => 1.0,
                };
                if step == 0.0 {
                    return Err(EngineError::invalid_definition(frame.scenario, "for loop step is zero"));
                }

                let limit = self.ctx.config().max_loop_iterations;
                let mut iterations = 0u64;
                let mut i = start;
                while (step > 0.0 && i <= end) || (step < 0.0 && i >= end) {
                    iterations += 1;
                    if iterations > limit {
                        return Err(EngineError::LoopLimitExceeded {
                            scenario: frame.scenario.to_string(),
                            limit,
                        });
                    }
                    scope.push_frame();
                    scope.define_local(variable, sysadl_core::value::number(i));
                    let flow = self.run_block(frame, body, scope).await;
                    scope.pop_frame();
                    if flow? == Flow::Break {
                        break;
                    }
                    tokio::task::yield_now().await;
                    i += step;
                }
            }

            ScenarioNode::WhileLoop { condition, body } => {
                let limit = self.ctx.config().max_loop_iterations;
                let mut iterations = 0u64;
                while self.condition(condition, scope)? {
                    iterations += 1;
                    if iterations > limit {
                        return Err(EngineError::LoopLimitExceeded {
                            scenario: frame.scenario.to_string(),
                            limit,
                        });
                    }
                    if self.run_block(frame, body, scope).await? == Flow::Break {
                        break;
                    }
                    tokio::task::yield_now().await;
                }
            }

            ScenarioNode::Break => return Ok(Flow::Break),

            ScenarioNode::Sleep { duration } => {
                let ms = self.number(duration, scope)?;
                if ms < 0.0 {
                    return Err(EvaluationError::type_mismatch(format!(
                        "sleep duration must not be negative, got {ms}"
                    ))
                    .into());
                }
                self.token.sleep(ms as u64).await?;
            }

            ScenarioNode::StateUpdate { path, value } => {
                let value = self.evaluate(value, scope)?;
                self.ctx.update_state(path, value)?;
            }

            ScenarioNode::EventInjection {
                event,
                parameters,
                timing,
            } => {
                let mut payload = Map::new();
                for (name, expr) in parameters {
                    payload.insert(name.clone(), self.evaluate(expr, scope)?);
                }
                let options = InjectionOptions {
                    owner: Some(frame.run_id.to_string()),
                    token: Some(self.token.clone()),
                    chain: self.chain.clone(),
                    ..InjectionOptions::default()
                };
                EventInjector::new(self.ctx.clone())
                    .inject(event, Value::Object(payload), timing.clone(), options)
                    .await?;
            }

            ScenarioNode::NestedScenario { scenario } => {
                self.run_nested(frame, scenario, scope).await?;
            }

            ScenarioNode::RunScene { scene } => {
                let options = SceneOptions {
                    token: Some(self.token.clone()),
                    chain: self.chain.clone(),
                    ..SceneOptions::default()
                };
                let result = SceneExecutor::new(self.ctx.clone())
                    .execute(scene, options)
                    .await?;
                if result.status == ExecutionStatus::Stopped {
                    return Err(EngineError::Stopped);
                }
                if !result.success {
                    return Err(EngineError::SceneFailed {
                        scene: scene.clone(),
                        status: result
                            .scene_state
                            .map(|state| state.to_string())
                            .unwrap_or_default(),
                        message: result.error.unwrap_or_default(),
                    });
                }
            }

            ScenarioNode::WaitUntil {
                condition,
                timeout_ms,
            } => {
                self.wait_until(frame, condition, *timeout_ms, scope).await?;
            }
        }
        Ok(Flow::Next)
    }

    async fn run_nested(&self, frame: Frame<'_>, name: &str, scope: &mut Scope) -> Result<()> {
        if frame.stack.iter().any(|s| s == name) {
            return Err(EngineError::NestingLimitExceeded {
                scenario: name.to_string(),
                message: format!("recursive nesting through {}", frame.stack.join(" -> ")),
            });
        }
        let limit = self.ctx.config().max_nesting_depth;
        if frame.stack.len() >= limit {
            return Err(EngineError::NestingLimitExceeded {
                scenario: name.to_string(),
                message: format!("depth limit of {limit} reached"),
            });
        }
        let Some(child) = self.ctx.scenarios().get(name) else {
            return Err(EngineError::unknown_scenario(name));
        };

        self.ctx.logger().record(
            LogCategory::Scenario,
            name,
            "nested scenario started",
            json!({ "parent": frame.scenario, "run_id": frame.run_id, "depth": frame.stack.len() }),
        );
        let mut child_scope = scope.child(child.variables.clone());
        let mut stack = frame.stack.to_vec();
        stack.push(child.name.clone());
        let child_frame = Frame {
            scenario: &child.name,
            run_id: frame.run_id,
            stack: &stack,
        };
        self.run_scenario(child_frame, &child, &mut child_scope).await?;

        let exported = child_scope.exported();
        self.ctx.logger().record(
            LogCategory::Scenario,
            name,
            "nested scenario completed",
            json!({ "exported": exported.keys().collect::<Vec<_>>() }),
        );
        for (variable, value) in exported {
            scope.assign(&variable, value, false);
        }
        Ok(())
    }

    async fn wait_until(
        &self,
        frame: Frame<'_>,
        condition: &Expression,
        timeout_ms: Option<u64>,
        scope: &Scope,
    ) -> Result<()> {
        // Scenario variables are frozen into the condition so the watcher
        // only sees state paths
        let bound = condition.bind(&|path: &[String]| scope.resolve(path));
        if bound.evaluate_bool(self.ctx.store())? {
            return Ok(());
        }

        let (reply, satisfied) = oneshot::channel::<()>();
        let reply = Mutex::new(Some(reply));
        let id = format!("wait:{}:{}", frame.run_id, Uuid::new_v4());
        let seeded = self.ctx.watcher().watch(
            &self.ctx,
            id.clone(),
            bound,
            WatchOptions::default().owned_by(frame.run_id),
            watch_callback(move |_, _| {
                if let Some(reply) = reply.lock().take() {
                    let _ = reply.send(());
                }
            }),
        )?;
        let _guard = WatchGuard::new(self.ctx.clone(), id);
        if seeded {
            return Ok(());
        }

        self.ctx.logger().record(
            LogCategory::Scenario,
            frame.scenario,
            "waiting for condition",
            json!({ "condition": condition.source(), "timeout_ms": timeout_ms }),
        );
        let wait = self.token.guard(satisfied);
        let received = match timeout_ms {
            Some(ms) => tokio::time::timeout(self.ctx.clock().scaled(ms), wait)
                .await
                .map_err(|_| {
                    EngineError::timeout(format!("wait_until {}", condition.source()), ms)
                })??,
            None => wait.await?,
        };
        // Sender dropped: the watch was removed by a stop
        received.map_err(|_| EngineError::Stopped)?;
        self.token.checkpoint().await
    }

    fn evaluate(&self, expr: &Expression, scope: &Scope) -> Result<Value> {
        let store = self.ctx.store();
        let resolver = |path: &[String]| scope.resolve(path).or_else(|| store.resolve(path));
        Ok(expr.evaluate(&resolver)?)
    }

    fn condition(&self, expr: &Expression, scope: &Scope) -> Result<bool> {
        let value = self.evaluate(expr, scope)?;
        Ok(sysadl_core::value::as_condition(&value)?)
    }

    fn number(&self, expr: &Expression, scope: &Scope) -> Result<f64> {
        let value = self.evaluate(expr, scope)?;
        value.as_f64().ok_or_else(|| {
            EvaluationError::type_mismatch(format!(
                "{} must be a number, got {}",
                expr.source(),
                sysadl_core::value::type_name(&value)
            ))
            .into()
        })
    }
}
