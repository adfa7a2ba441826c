//! State paths and value helpers
//!
//! Values are plain JSON values: scalars or records. A [`StatePath`] is the
//! canonical dotted key into the state store.

use crate::errors::{CoreError, EvaluationError, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

pub use serde_json::Value;

/// Canonical dotted key into the state store, e.g. `station.sensor.temperature`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StatePath(String);

impl StatePath {
    /// Parse and validate a dotted path
    pub fn parse(path: impl Into<String>) -> Result<Self> {
        let path = path.into();
        let trimmed = path.trim();
        if trimmed.is_empty() {
            return Err(CoreError::invalid_path(path, "path is empty"));
        }
        if trimmed.split('.').any(|segment| segment.trim().is_empty()) {
            return Err(CoreError::invalid_path(path, "path has an empty segment"));
        }
        Ok(Self(trimmed.to_string()))
    }

    /// Build a path from already-split segments
    pub fn from_segments<S: AsRef<str>>(segments: &[S]) -> Result<Self> {
        let joined = segments
            .iter()
            .map(AsRef::as_ref)
            .collect::<Vec<_>>()
            .join(".");
        Self::parse(joined)
    }

    /// The dotted string form
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Iterate the path segments
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('.')
    }

    /// Every proper prefix of this path, shortest first (`a`, `a.b` for `a.b.c`)
    pub fn ancestors(&self) -> Vec<&str> {
        self.0
            .match_indices('.')
            .map(|(idx, _)| &self.0[..idx])
            .collect()
    }

    /// Whether `self` is a strict ancestor of `other`
    pub fn is_ancestor_of(&self, other: &StatePath) -> bool {
        other.0.len() > self.0.len()
            && other.0.starts_with(&self.0)
            && other.0.as_bytes()[self.0.len()] == b'.'
    }

    /// Equal, ancestor or descendant
    pub fn overlaps(&self, other: &StatePath) -> bool {
        self == other || self.is_ancestor_of(other) || other.is_ancestor_of(self)
    }
}

impl fmt::Display for StatePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for StatePath {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(value)
    }
}

impl TryFrom<&str> for StatePath {
    type Error = CoreError;

    fn try_from(value: &str) -> Result<Self> {
        Self::parse(value)
    }
}

impl From<StatePath> for String {
    fn from(path: StatePath) -> Self {
        path.0
    }
}

impl AsRef<str> for StatePath {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Navigate into nested records
pub fn lookup<'a, S: AsRef<str>>(value: &'a Value, segments: &[S]) -> Option<&'a Value> {
    segments.iter().try_fold(value, |current, segment| match current {
        Value::Object(map) => map.get(segment.as_ref()),
        Value::Array(items) => segment
            .as_ref()
            .parse::<usize>()
            .ok()
            .and_then(|idx| items.get(idx)),
        _ => None,
    })
}

/// Write into nested records, creating intermediate objects as needed.
///
/// Returns `false` when a non-record value sits in the way.
pub fn assign<S: AsRef<str>>(target: &mut Value, segments: &[S], value: Value) -> bool {
    let Some((last, parents)) = segments.split_last() else {
        *target = value;
        return true;
    };

    let mut current = target;
    for segment in parents {
        if current.is_null() {
            *current = Value::Object(serde_json::Map::new());
        }
        current = match current {
            Value::Object(map) => map
                .entry(segment.as_ref().to_string())
                .or_insert(Value::Null),
            _ => return false,
        };
    }

    if current.is_null() {
        *current = Value::Object(serde_json::Map::new());
    }
    match current {
        Value::Object(map) => {
            map.insert(last.as_ref().to_string(), value);
            true
        }
        _ => false,
    }
}

/// Produce a JSON number, keeping integral results integral
pub fn number(value: f64) -> Value {
    if value.fract() == 0.0 && value.abs() < (i64::MAX as f64) {
        Value::from(value as i64)
    } else {
        serde_json::Number::from_f64(value).map_or(Value::Null, Value::Number)
    }
}

/// Interpret a value as a condition result. `null` (an unbound path) is false.
pub fn as_condition(value: &Value) -> std::result::Result<bool, EvaluationError> {
    match value {
        Value::Bool(b) => Ok(*b),
        Value::Null => Ok(false),
        other => Err(EvaluationError::type_mismatch(format!(
            "expected a boolean condition, found {}",
            type_name(other)
        ))),
    }
}

/// Equality with numeric normalisation (`1 == 1.0`)
pub fn loose_eq(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        _ => left == right,
    }
}

/// Ordering for numbers and strings only
pub fn compare(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

/// Short type name used in error messages
pub fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
