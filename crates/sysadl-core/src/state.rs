//! State store: the single source of truth for simulated entity properties
//!
//! The store maps dotted paths to JSON values. A path that is not bound
//! itself may still resolve through a bound ancestor holding a record, so
//! `vehicle.position.x` reads through a record bound at `vehicle.position`.
//!
//! The store performs no change notification on its own. The simulator wraps
//! every write so that condition watches observe it.

use crate::errors::Result;
use crate::expression::Resolver;
use crate::value::{self, StatePath, Value};
use indexmap::IndexMap;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};

/// Mutable mapping from dotted property paths to values
#[derive(Debug, Default)]
pub struct StateStore {
    entries: RwLock<IndexMap<String, Value>>,
    version: AtomicU64,
}

/// Outcome of a single write
#[derive(Debug, Clone, PartialEq)]
pub struct StateWrite {
    /// Path that was written
    pub path: StatePath,
    /// Value visible at the path before the write
    pub previous: Option<Value>,
    /// Value written
    pub value: Value,
    /// Store version after the write
    pub version: u64,
}

impl StateWrite {
    /// Whether the write actually changed the visible value
    pub fn changed(&self) -> bool {
        self.previous.as_ref() != Some(&self.value)
    }
}

impl StateStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a path to its initial value, replacing any previous binding
    pub fn bind(&self, path: &StatePath, initial: Value) -> StateWrite {
        let previous = {
            let mut entries = self.entries.write();
            entries.insert(path.as_str().to_string(), initial.clone())
        };
        StateWrite {
            path: path.clone(),
            previous,
            value: initial,
            version: self.bump(),
        }
    }

    /// Read the value visible at `path`
    pub fn get(&self, path: &str) -> Option<Value> {
        let entries = self.entries.read();
        Self::read_locked(&entries, path)
    }

    /// Write `value` at `path`.
    ///
    /// Writes land in the nearest bound ancestor record when one exists,
    /// otherwise the path becomes a new binding.
    pub fn set(&self, path: &str, value: Value) -> Result<StateWrite> {
        let path = StatePath::parse(path)?;
        let previous = {
            let mut entries = self.entries.write();
            let previous = Self::read_locked(&entries, path.as_str());

            let key = path.as_str();
            if let Some(slot) = entries.get_mut(key) {
                *slot = value.clone();
            } else {
                let owner = path
                    .ancestors()
                    .into_iter()
                    .rev()
                    .find(|ancestor| entries.get(*ancestor).is_some_and(Value::is_object))
                    .map(str::to_string);

                let written = owner.is_some_and(|owner| {
                    let rest: Vec<&str> = key[owner.len() + 1..].split('.').collect();
                    entries
                        .get_mut(&owner)
                        .is_some_and(|record| value::assign(record, &rest, value.clone()))
                });
                if !written {
                    entries.insert(key.to_string(), value.clone());
                }
            }
            previous
        };

        Ok(StateWrite {
            path,
            previous,
            value,
            version: self.bump(),
        })
    }

    /// Whether a path resolves to a value
    pub fn contains(&self, path: &str) -> bool {
        self.get(path).is_some()
    }

    /// Bound paths in binding order
    pub fn paths(&self) -> Vec<String> {
        self.entries.read().keys().cloned().collect()
    }

    /// Copy of every binding in binding order
    pub fn snapshot(&self) -> IndexMap<String, Value> {
        self.entries.read().clone()
    }

    /// Number of writes applied so far
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    fn bump(&self) -> u64 {
        self.version.fetch_add(1, Ordering::AcqRel) + 1
    }

    fn read_locked(entries: &IndexMap<String, Value>, path: &str) -> Option<Value> {
        if let Some(value) = entries.get(path) {
            return Some(value.clone());
        }
        // Fall back to the nearest bound ancestor record
        let mut split = path.len();
        while let Some(idx) = path[..split].rfind('.') {
            if let Some(record) = entries.get(&path[..idx]) {
                let rest: Vec<&str> = path[idx + 1..].split('.').collect();
                return value::lookup(record, &rest).cloned();
            }
            split = idx;
        }
        None
    }
}

impl Resolver for StateStore {
    fn resolve(&self, path: &[String]) -> Option<Value> {
        self.get(&path.join("."))
    }
}
