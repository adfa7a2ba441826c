//! # Condition and value expressions
//!
//! The expression grammar is deliberately narrow: literals, dotted property
//! paths, `!`, `&&`, `||`, comparisons and basic arithmetic. There are no
//! calls, no indexing and no assignment.
//!
//! An [`Expression`] is parsed exactly once, when it is created. It keeps the
//! AST and the set of property paths it reads, so condition watches can be
//! indexed by dependency without re-parsing.
//!
//! ```rust,ignore
//! use sysadl_core::expression::Expression;
//!
//! let cond = Expression::parse("tank.level > 80 && !tank.alarm")?;
//! assert_eq!(cond.dependent_paths(), &["tank.level", "tank.alarm"]);
//! ```

mod ast;
mod eval;
mod lexer;
mod parser;

pub use ast::{BinaryOp, Expr, UnaryOp};
pub use eval::{evaluate, Resolver};

use crate::errors::EvaluationError;
use crate::value::{self, Value};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// A parsed, immutable expression with its dependent paths
#[derive(Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Expression {
    source: Arc<str>,
    ast: Arc<Expr>,
    paths: Arc<[String]>,
}

impl Expression {
    /// Parse `source`, failing fast on anything malformed
    pub fn parse(source: &str) -> Result<Self, EvaluationError> {
        let ast = parser::parse(source)?;
        Ok(Self::from_ast(source.trim(), ast))
    }

    /// Expression that always evaluates to `value`
    pub fn literal(value: Value) -> Self {
        let ast = Expr::Literal(value);
        let source = ast.to_string();
        Self::from_ast(&source, ast)
    }

    fn from_ast(source: &str, ast: Expr) -> Self {
        let mut paths: Vec<String> = Vec::new();
        ast.for_each_path(&mut |segments| {
            let joined = segments.join(".");
            if !paths.contains(&joined) {
                paths.push(joined);
            }
        });
        Self {
            source: Arc::from(source),
            ast: Arc::new(ast),
            paths: paths.into(),
        }
    }

    /// Original text
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Parsed tree
    pub fn ast(&self) -> &Expr {
        &self.ast
    }

    /// Distinct property paths referenced, in first-occurrence order
    pub fn dependent_paths(&self) -> &[String] {
        &self.paths
    }

    /// Evaluate to a value
    pub fn evaluate(&self, resolver: &dyn Resolver) -> Result<Value, EvaluationError> {
        evaluate(&self.ast, resolver)
    }

    /// Evaluate as a condition (`null` is false, non-booleans are errors)
    pub fn evaluate_bool(&self, resolver: &dyn Resolver) -> Result<bool, EvaluationError> {
        value::as_condition(&self.evaluate(resolver)?)
    }

    /// Replace every path `bindings` resolves with its value.
    ///
    /// Used to turn a scenario-scoped condition into a pure state condition
    /// before handing it to the condition watcher.
    pub fn bind(&self, bindings: &impl Fn(&[String]) -> Option<Value>) -> Expression {
        let ast = self.ast.substitute(bindings);
        if *self.ast == ast {
            return self.clone();
        }
        let source = ast.to_string();
        Self::from_ast(&source, ast)
    }
}

impl fmt::Debug for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Expression").field(&self.source).finish()
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl PartialEq for Expression {
    fn eq(&self, other: &Self) -> bool {
        self.ast == other.ast
    }
}

impl TryFrom<String> for Expression {
    type Error = EvaluationError;

    fn try_from(source: String) -> Result<Self, Self::Error> {
        Self::parse(&source)
    }
}

impl TryFrom<&str> for Expression {
    type Error = EvaluationError;

    fn try_from(source: &str) -> Result<Self, Self::Error> {
        Self::parse(source)
    }
}

impl From<Expression> for String {
    fn from(expression: Expression) -> Self {
        expression.source.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_dependent_paths_are_deduplicated() {
        let expr = Expression::parse("a.x > 1 && (b || a.x < 9)").unwrap();
        assert_eq!(expr.dependent_paths(), &["a.x".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_bind_substitutes_variables() {
        let expr = Expression::parse("tank.level >= target").unwrap();
        let bound = expr.bind(&|path: &[String]| {
            (path == ["target".to_string()]).then(|| json!(40))
        });
        assert_eq!(bound.dependent_paths(), &["tank.level".to_string()]);
        assert_eq!(bound.source(), "(tank.level >= 40)");
    }

    #[test]
    fn test_serde_roundtrip_validates() {
        let expr: Expression = serde_json::from_value(json!("x == 'on'")).unwrap();
        assert_eq!(expr.source(), "x == 'on'");
        assert!(serde_json::from_value::<Expression>(json!("x ==")).is_err());
    }
}
