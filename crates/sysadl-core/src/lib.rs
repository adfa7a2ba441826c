//! SysADL Core - simulation primitives
//!
//! Leaf building blocks shared by the SysADL simulation runtime. Nothing in
//! this crate is asynchronous; the runtime in `sysadl-simulator` composes
//! these pieces into watchers, schedulers and interpreters.
//!
//! # Contents
//!
//! - [`StateStore`]: mutable mapping from dotted property paths to values,
//!   the only source of truth for simulated entity properties
//! - [`Expression`]: narrow expression language (comparisons, `&&`/`||`,
//!   negation, dotted paths, literals) parsed once into an AST
//! - [`ExecutionLogger`]: append-only structured trace, exportable as JSON lines
//! - [`EvaluationError`] / [`CoreError`]: the error types of this layer

#![forbid(unsafe_code)]

/// Unified error handling
pub mod errors;

/// Expression lexer, parser and evaluator
pub mod expression;

/// Append-only execution trace
pub mod logging;

/// Property state store
pub mod state;

/// State paths and JSON value helpers
pub mod value;

pub use errors::{CoreError, EvaluationError, Result};
pub use expression::{Expression, Resolver};
pub use logging::{ExecutionLogger, LogCategory, LogEntry};
pub use state::{StateStore, StateWrite};
pub use value::{StatePath, Value};
