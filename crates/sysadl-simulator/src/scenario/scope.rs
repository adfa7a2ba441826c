//! Scenario variable scopes
//!
//! Lookups walk the frames innermost first, then the snapshot inherited from
//! a parent scenario. Assignment updates the innermost frame that already
//! holds the variable and otherwise defines it in the scenario's own base
//! frame, so a loop body can accumulate into an outer variable.
//!
//! A nested scenario gets a child scope: it reads its parent's variables but
//! its writes stay local unless the assignment is marked for export.

use indexmap::{IndexMap, IndexSet};
use serde_json::Value;

/// Variable environment of one scenario run
#[derive(Debug, Clone)]
pub struct Scope {
    inherited: IndexMap<String, Value>,
    frames: Vec<IndexMap<String, Value>>,
    exports: IndexSet<String>,
}

impl Default for Scope {
    fn default() -> Self {
        Self::new(IndexMap::new())
    }
}

impl Scope {
    /// Root scope with initial variables
    pub fn new(initial: IndexMap<String, Value>) -> Self {
        Self {
            inherited: IndexMap::new(),
            frames: vec![initial],
            exports: IndexSet::new(),
        }
    }

    /// Child scope that can read every variable visible here
    pub fn child(&self, initial: IndexMap<String, Value>) -> Self {
        Self {
            inherited: self.visible(),
            frames: vec![initial],
            exports: IndexSet::new(),
        }
    }

    /// Look up a variable
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.frames
            .iter()
            .rev()
            .find_map(|frame| frame.get(name))
            .or_else(|| self.inherited.get(name))
    }

    /// Whether a variable is visible
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Assign a variable, optionally marking it for export to the parent
    pub fn assign(&mut self, name: &str, value: Value, export: bool) {
        let slot = self
            .frames
            .iter_mut()
            .rev()
            .find_map(|frame| frame.get_mut(name));
        match slot {
            Some(slot) => *slot = value,
            None => {
                if let Some(base) = self.frames.first_mut() {
                    base.insert(name.to_string(), value);
                }
            }
        }
        if export {
            self.exports.insert(name.to_string());
        }
    }

    /// Define a variable in the innermost frame, shadowing outer ones
    pub fn define_local(&mut self, name: &str, value: Value) {
        if let Some(frame) = self.frames.last_mut() {
            frame.insert(name.to_string(), value);
        }
    }

    /// Open a frame
    pub fn push_frame(&mut self) {
        self.frames.push(IndexMap::new());
    }

    /// Close the innermost frame. The base frame is never popped.
    pub fn pop_frame(&mut self) {
        if self.frames.len() > 1 {
            self.frames.pop();
        }
    }

    /// Every visible variable, inner definitions winning
    pub fn visible(&self) -> IndexMap<String, Value> {
        let mut all = self.inherited.clone();
        for frame in &self.frames {
            for (name, value) in frame {
                all.insert(name.clone(), value.clone());
            }
        }
        all
    }

    /// Exported variables with their current values
    pub fn exported(&self) -> IndexMap<String, Value> {
        self.exports
            .iter()
            .filter_map(|name| self.get(name).map(|value| (name.clone(), value.clone())))
            .collect()
    }

    /// Resolve a dotted path whose first segment names a variable
    pub fn resolve(&self, path: &[String]) -> Option<Value> {
        let (head, rest) = path.split_first()?;
        let value = self.get(head)?;
        if rest.is_empty() {
            Some(value.clone())
        } else {
            sysadl_core::value::lookup(value, rest).cloned()
        }
    }
}
