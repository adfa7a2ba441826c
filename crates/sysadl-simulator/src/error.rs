//! Unified error type for the simulation runtime
//!
//! Registration errors are returned from the registering call. Runtime
//! scene/scenario errors are captured into the corresponding
//! `ExecutionResult` instead of aborting sibling work.

use serde::{Deserialize, Serialize};
use sysadl_core::{CoreError, EvaluationError};

/// Unified error type for all runtime operations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
pub enum EngineError {
    /// Malformed or unsupported expression
    #[error("Evaluation error: {0}")]
    Evaluation(#[from] EvaluationError),

    /// State store failure
    #[error("State error: {0}")]
    Core(CoreError),

    /// An event name was registered twice
    #[error("Event already registered: {name}")]
    DuplicateEvent {
        /// Event name
        name: String,
    },

    /// An event name that was never registered
    #[error("Unknown event: {name}")]
    UnknownEvent {
        /// Event name
        name: String,
    },

    /// Event parameters did not satisfy the event's schema
    #[error("Invalid parameters for event {event}: {message}")]
    MissingParameters {
        /// Event name
        event: String,
        /// What was missing or mistyped
        message: String,
    },

    /// A scene, scenario or scenario execution name was registered twice
    #[error("{kind} already registered: {name}")]
    DuplicateDefinition {
        /// Definition kind
        kind: String,
        /// Definition name
        name: String,
    },

    /// A scene that was never registered
    #[error("Unknown scene: {name}")]
    UnknownScene {
        /// Scene name
        name: String,
    },

    /// A scenario that was never registered
    #[error("Unknown scenario: {name}")]
    UnknownScenario {
        /// Scenario name
        name: String,
    },

    /// A scenario execution that was never registered
    #[error("Unknown scenario execution: {name}")]
    UnknownScenarioExecution {
        /// Scenario execution name
        name: String,
    },

    /// Structurally invalid definition
    #[error("Invalid definition {name}: {message}")]
    InvalidDefinition {
        /// Definition name
        name: String,
        /// What is wrong with it
        message: String,
    },

    /// A scene pre-condition did not hold
    #[error("Precondition failed for scene {scene}: {condition}")]
    PreconditionFailure {
        /// Scene name
        scene: String,
        /// The failing condition
        condition: String,
    },

    /// A scene post-condition did not hold
    #[error("Postcondition failed for scene {scene}: {condition}")]
    PostconditionFailure {
        /// Scene name
        scene: String,
        /// The failing condition
        condition: String,
    },

    /// A scene run from a scenario did not complete
    #[error("Scene {scene} ended {status}: {message}")]
    SceneFailed {
        /// Scene name
        scene: String,
        /// Final scene status
        status: String,
        /// Underlying error
        message: String,
    },

    /// A scene or wait exceeded its timeout
    #[error("{subject} timed out after {timeout_ms}ms")]
    Timeout {
        /// What timed out
        subject: String,
        /// Timeout that elapsed
        timeout_ms: u64,
    },

    /// A task's effect returned an error
    #[error("Task {task} failed on event {event}: {message}")]
    TaskExecution {
        /// Task name
        task: String,
        /// Event that triggered the task
        event: String,
        /// Error message from the effect
        message: String,
    },

    /// Execution was stopped by the controller
    #[error("stopped")]
    Stopped,

    /// A loop ran past the configured iteration limit
    #[error("Loop in scenario {scenario} exceeded {limit} iterations")]
    LoopLimitExceeded {
        /// Scenario name
        scenario: String,
        /// Configured limit
        limit: u64,
    },

    /// Nested scenarios went too deep or recursed
    #[error("Scenario nesting limit exceeded at {scenario}: {message}")]
    NestingLimitExceeded {
        /// Scenario where the limit was hit
        scenario: String,
        /// Description
        message: String,
    },

    /// Invalid engine configuration
    #[error("Configuration error: {message}")]
    Configuration {
        /// What is wrong
        message: String,
    },
}

impl EngineError {
    /// Create a duplicate event error
    pub fn duplicate_event(name: impl Into<String>) -> Self {
        Self::DuplicateEvent { name: name.into() }
    }

    /// Create an unknown event error
    pub fn unknown_event(name: impl Into<String>) -> Self {
        Self::UnknownEvent { name: name.into() }
    }

    /// Create an invalid parameters error
    pub fn missing_parameters(event: impl Into<String>, message: impl Into<String>) -> Self {
        Self::MissingParameters {
            event: event.into(),
            message: message.into(),
        }
    }

    /// Create a duplicate definition error
    pub fn duplicate_definition(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::DuplicateDefinition {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Create an unknown scene error
    pub fn unknown_scene(name: impl Into<String>) -> Self {
        Self::UnknownScene { name: name.into() }
    }

    /// Create an unknown scenario error
    pub fn unknown_scenario(name: impl Into<String>) -> Self {
        Self::UnknownScenario { name: name.into() }
    }

    /// Create an unknown scenario execution error
    pub fn unknown_scenario_execution(name: impl Into<String>) -> Self {
        Self::UnknownScenarioExecution { name: name.into() }
    }

    /// Create an invalid definition error
    pub fn invalid_definition(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidDefinition {
            name: name.into(),
            message: message.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(subject: impl Into<String>, timeout_ms: u64) -> Self {
        Self::Timeout {
            subject: subject.into(),
            timeout_ms,
        }
    }

    /// Create a configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Short kind tag used in logs and results
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Evaluation(_) => "evaluation",
            Self::Core(_) => "state",
            Self::DuplicateEvent { .. } => "duplicate_event",
            Self::UnknownEvent { .. } => "unknown_event",
            Self::MissingParameters { .. } => "invalid_parameters",
            Self::DuplicateDefinition { .. } => "duplicate_definition",
            Self::UnknownScene { .. } => "unknown_scene",
            Self::UnknownScenario { .. } => "unknown_scenario",
            Self::UnknownScenarioExecution { .. } => "unknown_scenario_execution",
            Self::InvalidDefinition { .. } => "invalid_definition",
            Self::PreconditionFailure { .. } => "precondition",
            Self::PostconditionFailure { .. } => "postcondition",
            Self::SceneFailed { .. } => "scene_failed",
            Self::Timeout { .. } => "timeout",
            Self::TaskExecution { .. } => "task_execution",
            Self::Stopped => "stopped",
            Self::LoopLimitExceeded { .. } => "loop_limit",
            Self::NestingLimitExceeded { .. } => "nesting_limit",
            Self::Configuration { .. } => "configuration",
        }
    }
}

impl From<CoreError> for EngineError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Evaluation(inner) => Self::Evaluation(inner),
            other => Self::Core(other),
        }
    }
}

/// Standard Result type for runtime operations
pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = EngineError::unknown_event("Arrive");
        assert_eq!(err.to_string(), "Unknown event: Arrive");
        assert_eq!(err.kind(), "unknown_event");
        assert_eq!(EngineError::Stopped.to_string(), "stopped");
    }

    #[test]
    fn test_core_conversion_unwraps_evaluation() {
        let err: EngineError = CoreError::Evaluation(EvaluationError::Empty).into();
        assert!(matches!(err, EngineError::Evaluation(EvaluationError::Empty)));

        let err: EngineError = CoreError::invalid_path("a..b", "empty segment").into();
        assert!(matches!(err, EngineError::Core(_)));
    }
}
