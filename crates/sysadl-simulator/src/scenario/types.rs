//! Scenario program tree
//!
//! Scenarios are declarative: they deserialize from JSON or TOML with a
//! `type` tag per step. Expressions are parsed while deserializing, so a
//! malformed condition fails the load rather than the run.

use crate::error::{EngineError, Result};
use crate::injector::InjectionTiming;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sysadl_core::{EvaluationError, Expression, StatePath};
use sysadl_core::expression::Expr;

/// One step of a scenario body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ScenarioNode {
    /// Assign a scenario variable
    #[serde(rename = "variable_assignment")]
    VariableAssignment {
        /// Variable name
        variable: String,
        /// Value expression
        value: Expression,
        /// Copy the variable into the parent scenario when this one is nested
        #[serde(default)]
        export: bool,
    },

    /// Conditional branch
    #[serde(rename = "if")]
    IfStatement {
        /// Branch condition
        condition: Expression,
        /// Steps run when the condition holds
        #[serde(default)]
        then_body: Vec<ScenarioNode>,
        /// Steps run otherwise
        #[serde(default)]
        else_body: Vec<ScenarioNode>,
    },

    /// Counted loop over `start..=end`
    #[serde(rename = "for")]
    ForLoop {
        /// Loop variable, local to each iteration
        variable: String,
        /// First value
        start: Expression,
        /// Last value (inclusive)
        end: Expression,
        /// Increment; 1 when absent
        #[serde(default)]
        step: Option<Expression>,
        /// Loop body
        #[serde(default)]
        body: Vec<ScenarioNode>,
    },

    /// Loop while a condition holds
    #[serde(rename = "while")]
    WhileLoop {
        /// Loop condition, checked before each iteration
        condition: Expression,
        /// Loop body
        #[serde(default)]
        body: Vec<ScenarioNode>,
    },

    /// Leave the innermost loop
    #[serde(rename = "break")]
    Break,

    /// Wait for a number of simulated milliseconds
    #[serde(rename = "sleep")]
    Sleep {
        /// Duration in milliseconds
        duration: Expression,
    },

    /// Write a state path
    #[serde(rename = "state_update")]
    StateUpdate {
        /// Target path
        path: String,
        /// Value expression
        value: Expression,
    },

    /// Inject an event
    #[serde(rename = "inject")]
    EventInjection {
        /// Event name
        event: String,
        /// Parameter expressions
        #[serde(default)]
        parameters: IndexMap<String, Expression>,
        /// Delivery timing
        #[serde(default)]
        timing: InjectionTiming,
    },

    /// Run another scenario in an isolated child scope
    #[serde(rename = "nested_scenario")]
    NestedScenario {
        /// Scenario name
        scenario: String,
    },

    /// Run a scene to completion
    #[serde(rename = "run_scene")]
    RunScene {
        /// Scene name
        scene: String,
    },

    /// Block until a condition holds
    #[serde(rename = "wait_until")]
    WaitUntil {
        /// Condition over state and scenario variables
        condition: Expression,
        /// Give up after this many simulated milliseconds
        #[serde(default)]
        timeout_ms: Option<u64>,
    },
}

impl ScenarioNode {
    /// `variable = value`
    pub fn assign(variable: &str, value: &str) -> std::result::Result<Self, EvaluationError> {
        Ok(Self::VariableAssignment {
            variable: variable.to_string(),
            value: Expression::parse(value)?,
            export: false,
        })
    }

    /// `path := value` on the state store
    pub fn update_state(path: &str, value: &str) -> std::result::Result<Self, EvaluationError> {
        Ok(Self::StateUpdate {
            path: path.to_string(),
            value: Expression::parse(value)?,
        })
    }

    /// Sleep a fixed number of milliseconds
    pub fn sleep(ms: u64) -> Self {
        Self::Sleep {
            duration: Expression::literal(json!(ms)),
        }
    }

    /// Immediate injection without parameters
    pub fn inject(event: &str) -> Self {
        Self::EventInjection {
            event: event.to_string(),
            parameters: IndexMap::new(),
            timing: InjectionTiming::Immediate,
        }
    }

    /// Run `scenario` nested
    pub fn nested(scenario: &str) -> Self {
        Self::NestedScenario {
            scenario: scenario.to_string(),
        }
    }

    /// Run `scene`
    pub fn run_scene(scene: &str) -> Self {
        Self::RunScene {
            scene: scene.to_string(),
        }
    }
}

/// A registered scenario
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioDefinition {
    /// Unique scenario name
    pub name: String,
    /// Initial variables
    #[serde(default)]
    pub variables: IndexMap<String, Value>,
    /// Steps
    #[serde(default)]
    pub body: Vec<ScenarioNode>,
}

impl ScenarioDefinition {
    /// Scenario with `body`
    pub fn new(name: impl Into<String>, body: Vec<ScenarioNode>) -> Self {
        Self {
            name: name.into(),
            variables: IndexMap::new(),
            body,
        }
    }

    /// Set an initial variable
    pub fn with_variable(mut self, name: impl Into<String>, value: Value) -> Self {
        self.variables.insert(name.into(), value);
        self
    }

    /// Load from JSON
    pub fn from_json(value: Value) -> Result<Self> {
        let scenario: Self = serde_json::from_value(value)
            .map_err(|e| EngineError::invalid_definition("<scenario>", e.to_string()))?;
        scenario.validate()?;
        Ok(scenario)
    }

    /// Load from TOML
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let scenario: Self = toml::from_str(text)
            .map_err(|e| EngineError::invalid_definition("<scenario>", e.to_string()))?;
        scenario.validate()?;
        Ok(scenario)
    }

    /// Structural checks run at registration
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(EngineError::invalid_definition("<scenario>", "scenario name is empty"));
        }
        for name in self.variables.keys() {
            check_identifier(&self.name, name)?;
        }
        validate_body(&self.name, &self.body, false)
    }
}

fn check_identifier(scenario: &str, name: &str) -> Result<()> {
    let valid = name
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(EngineError::invalid_definition(
            scenario,
            format!("'{name}' is not a valid variable name"),
        ))
    }
}

fn is_zero_literal(expr: &Expression) -> bool {
    matches!(expr.ast(), Expr::Literal(Value::Number(n)) if n.as_f64() == Some(0.0))
}

fn validate_body(scenario: &str, nodes: &[ScenarioNode], in_loop: bool) -> Result<()> {
    for node in nodes {
        match node {
            ScenarioNode::VariableAssignment { variable, .. } => check_identifier(scenario, variable)?,
            ScenarioNode::IfStatement {
                then_body,
                else_body,
                ..
            } => {
                validate_body(scenario, then_body, in_loop)?;
                validate_body(scenario, else_body, in_loop)?;
            }
            ScenarioNode::ForLoop {
                variable,
                step,
                body,
                ..
            } => {
                check_identifier(scenario, variable)?;
                if step.as_ref().is_some_and(is_zero_literal) {
                    return Err(EngineError::invalid_definition(scenario, "for loop step is zero"));
                }
                validate_body(scenario, body, true)?;
            }
            ScenarioNode::WhileLoop { body, .. } => validate_body(scenario, body, true)?,
            ScenarioNode::Break if !in_loop => {
                return Err(EngineError::invalid_definition(scenario, "break outside of a loop"));
            }
            ScenarioNode::StateUpdate { path, .. } => {
                StatePath::parse(path.as_str())?;
            }
            ScenarioNode::EventInjection { event, .. } if event.trim().is_empty() => {
                return Err(EngineError::invalid_definition(scenario, "injection without an event"));
            }
            _ => {}
        }
    }
    Ok(())
}
