//! SysADL Simulator - runtime orchestration for SysADL models
//!
//! Drives simulations of architecture models: entity properties live in a
//! shared state store, conditions over that state are watched reactively,
//! events are dispatched to the tasks bound to them, and scenes, scenarios
//! and scenario executions compose those events into timed, controllable
//! runs with a complete execution trace.
//!
//! # Architecture
//!
//! All components hang off one [`EngineContext`] per engine; nothing is
//! process-global, so engines are isolated from each other.
//!
//! - [`ConditionWatcher`]: re-evaluates only the conditions that depend on a
//!   written path and fires on false-to-true edges
//! - [`EventDispatcher`]: event catalog, task bindings and the dispatch loop
//!   with re-entrancy protection
//! - [`EventInjector`]: immediate, delayed, conditional and lifecycle-bound
//!   injections, alone or in batches
//! - [`SceneExecutor`]: a scene's state machine between its start and finish
//!   events
//! - [`ScenarioExecutor`]: interpreter for scenario programs
//! - [`ExecutionController`]: sequential, parallel and conditional scenario
//!   executions plus pause, play, speed and stop
//! - [`SimulationClock`]: speed-scaled time and the stop/pause signal every
//!   run observes at its await points
//!
//! [`SimulationEngine`] wraps all of the above behind one handle.
//!
//! # Example
//!
//! ```rust,ignore
//! use serde_json::json;
//! use sysadl_simulator::{EventDefinition, SceneDefinition, SceneOptions, SimulationEngine, Task};
//!
//! let engine = SimulationEngine::new()?;
//! engine.register_event(EventDefinition::new("Start"))?;
//! engine.register_event(EventDefinition::new("Finish"))?;
//! engine.register_task(Task::sync("mark", "Start", |ctx| {
//!     ctx.update_state("vehicle.moving", json!(true))?;
//!     Ok(json!(null))
//! }))?;
//! engine.register_scene(SceneDefinition::new("Drive", "Start", "Finish"))?;
//!
//! let result = engine.execute_scene("Drive", SceneOptions::default()).await?;
//! assert!(result.success);
//! ```

#![forbid(unsafe_code)]

/// Speed-scaled clock and run tokens
pub mod clock;

/// Engine configuration
pub mod config;

/// Shared engine context and registries
pub mod context;

/// Scenario executions and simulation control
pub mod controller;

/// Event catalog, tasks and dispatch
pub mod dispatcher;

/// Public engine facade
pub mod engine;

/// Engine error types
pub mod error;

/// Event injection
pub mod injector;

/// Execution results
pub mod results;

/// Scenario programs and their interpreter
pub mod scenario;

/// Scene definitions and executor
pub mod scene;

/// Reactive condition watcher
pub mod watcher;

pub use clock::{ClockState, RunToken, SimulationClock};
pub use config::{ConfigDefaults, ConfigValidation, EngineConfig};
pub use context::{EngineContext, Registry};
pub use controller::{
    AggregateResult, ExecutionController, ExecutionMode, ExecutionOptions, ExecutionStatistics,
    ScenarioCounters, ScenarioEntry, ScenarioExecutionDefinition,
};
pub use dispatcher::{
    dispatch, run_lifecycle_hooks, DispatchChain, DispatchReport, EventDefinition, EventDispatcher,
    EventNotice, LifecyclePhase, LifecycleRef, ParameterType, Task, TaskContext, TaskEffect,
    TaskError, TaskOutcome, TaskResult,
};
pub use engine::SimulationEngine;
pub use error::{EngineError, Result};
pub use injector::{
    BatchInjection, BatchMode, EventInjector, InjectionOptions, InjectionOutcome, InjectionStatus,
    InjectionTiming,
};
pub use results::{ExecutionResult, ExecutionStatus};
pub use scenario::{ScenarioDefinition, ScenarioExecutor, ScenarioNode, Scope};
pub use scene::{SceneDefinition, SceneEffect, SceneExecutor, SceneOptions, SceneState, SceneTransition};
pub use watcher::{
    watch_callback, ConditionWatcher, StateChange, StateListener, StateSubscription,
    WatchCallback, WatchFired, WatchInfo, WatchMode, WatchOptions,
};

pub use sysadl_core::{
    Expression, ExecutionLogger, LogCategory, LogEntry, StatePath, StateStore, StateWrite, Value,
};
