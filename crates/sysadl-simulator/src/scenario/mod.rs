//! Scenarios: declarative programs over scenes, events and state
//!
//! A scenario body is a tree of [`ScenarioNode`]s interpreted by the
//! [`ScenarioExecutor`]. Variables live in a [`Scope`] that scenarios nested
//! through `nested_scenario` steps can read but not modify, except through
//! exported assignments.

mod executor;
mod scope;
mod types;

pub use executor::ScenarioExecutor;
pub use scope::Scope;
pub use types::{ScenarioDefinition, ScenarioNode};
