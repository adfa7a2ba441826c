//! Result types shared by the scene, scenario and execution layers

use crate::error::EngineError;
use crate::scene::SceneState;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Final status of a scene or scenario run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Ran to completion
    Completed,
    /// Failed with an error
    Failed,
    /// Exceeded its timeout
    TimedOut,
    /// Stopped by the controller
    Stopped,
    /// Not started because its precondition was false
    Skipped,
}

impl ExecutionStatus {
    fn of(err: &EngineError) -> Self {
        match err {
            EngineError::Stopped => Self::Stopped,
            EngineError::Timeout { .. } => Self::TimedOut,
            _ => Self::Failed,
        }
    }
}

/// Outcome of one scene or scenario run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Scene or scenario name
    pub name: String,
    /// Identifier of this run
    pub run_id: String,
    /// Whether the run completed without error
    pub success: bool,
    /// Final status
    pub status: ExecutionStatus,
    /// Wall-clock duration of the run
    pub duration_ms: u64,
    /// Scenario variables at the end of the run (partial on failure)
    pub variables: IndexMap<String, Value>,
    /// Error message when the run failed
    pub error: Option<String>,
    /// Error kind tag, e.g. `precondition` or `stopped`
    pub error_kind: Option<String>,
    /// Final scene state, for scene runs
    pub scene_state: Option<SceneState>,
}

impl ExecutionResult {
    pub(crate) fn completed(
        name: &str,
        run_id: &str,
        duration_ms: u64,
        variables: IndexMap<String, Value>,
    ) -> Self {
        Self {
            name: name.to_string(),
            run_id: run_id.to_string(),
            success: true,
            status: ExecutionStatus::Completed,
            duration_ms,
            variables,
            error: None,
            error_kind: None,
            scene_state: None,
        }
    }

    pub(crate) fn failed(
        name: &str,
        run_id: &str,
        duration_ms: u64,
        variables: IndexMap<String, Value>,
        err: &EngineError,
    ) -> Self {
        Self {
            name: name.to_string(),
            run_id: run_id.to_string(),
            success: false,
            status: ExecutionStatus::of(err),
            duration_ms,
            variables,
            error: Some(err.to_string()),
            error_kind: Some(err.kind().to_string()),
            scene_state: None,
        }
    }

    pub(crate) fn skipped(name: &str) -> Self {
        Self {
            name: name.to_string(),
            run_id: String::new(),
            success: false,
            status: ExecutionStatus::Skipped,
            duration_ms: 0,
            variables: IndexMap::new(),
            error: None,
            error_kind: None,
            scene_state: None,
        }
    }

    pub(crate) fn with_scene_state(mut self, state: SceneState) -> Self {
        self.scene_state = Some(state);
        self
    }

    /// Variable value at the end of the run
    pub fn variable(&self, name: &str) -> Option<&Value> {
        self.variables.get(name)
    }
}
