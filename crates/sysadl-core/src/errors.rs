//! Error types shared by the simulation primitives
//!
//! Expression problems are always reported as [`EvaluationError`]; they are
//! never folded into a `false` result. Everything else that can go wrong in
//! this crate is a [`CoreError`].

use serde::{Deserialize, Serialize};

/// Malformed or unsupported expression
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum EvaluationError {
    /// The expression text could not be tokenized or parsed
    #[error("Syntax error at offset {offset} in `{source_text}`: {message}")]
    Syntax {
        /// Full expression text
        source_text: String,
        /// Byte offset of the offending token
        offset: usize,
        /// What went wrong
        message: String,
    },

    /// The expression was empty or whitespace only
    #[error("Empty expression")]
    Empty,

    /// Operands of the wrong type for an operator
    #[error("Type mismatch: {message}")]
    TypeMismatch {
        /// Description of the offending operation
        message: String,
    },

    /// Division by zero in an arithmetic expression
    #[error("Division by zero in `{expression}`")]
    DivisionByZero {
        /// Rendered sub-expression
        expression: String,
    },
}

impl EvaluationError {
    /// Create a syntax error
    pub fn syntax(source_text: impl Into<String>, offset: usize, message: impl Into<String>) -> Self {
        Self::Syntax {
            source_text: source_text.into(),
            offset,
            message: message.into(),
        }
    }

    /// Create a type mismatch error
    pub fn type_mismatch(message: impl Into<String>) -> Self {
        Self::TypeMismatch {
            message: message.into(),
        }
    }
}

/// Errors raised by the state store and path handling
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum CoreError {
    /// A state path was empty or contained an empty segment
    #[error("Invalid state path `{path}`: {message}")]
    InvalidPath {
        /// The rejected path
        path: String,
        /// Why it was rejected
        message: String,
    },

    /// Expression failure surfaced through a core operation
    #[error(transparent)]
    Evaluation(#[from] EvaluationError),
}

impl CoreError {
    /// Create an invalid path error
    pub fn invalid_path(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidPath {
            path: path.into(),
            message: message.into(),
        }
    }
}

/// Standard Result type for core operations
pub type Result<T> = std::result::Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = EvaluationError::syntax("a &&", 4, "expected operand");
        assert_eq!(
            err.to_string(),
            "Syntax error at offset 4 in `a &&`: expected operand"
        );

        let err = CoreError::invalid_path("a..b", "empty segment");
        assert!(matches!(err, CoreError::InvalidPath { .. }));
    }

    #[test]
    fn test_evaluation_conversion() {
        let err: CoreError = EvaluationError::Empty.into();
        assert!(matches!(err, CoreError::Evaluation(EvaluationError::Empty)));
    }
}
