//! Evaluation of parsed expressions against a path resolver

use super::ast::{BinaryOp, Expr, UnaryOp};
use crate::errors::EvaluationError;
use crate::value::{self, Value};
use std::cmp::Ordering;

/// Source of values for property paths
pub trait Resolver {
    /// Value at `path`, or `None` when nothing is bound there
    fn resolve(&self, path: &[String]) -> Option<Value>;
}

impl<F> Resolver for F
where
    F: Fn(&[String]) -> Option<Value>,
{
    fn resolve(&self, path: &[String]) -> Option<Value> {
        self(path)
    }
}

/// Evaluate `expr`. Unbound paths evaluate to `null`.
pub fn evaluate(expr: &Expr, resolver: &dyn Resolver) -> Result<Value, EvaluationError> {
    match expr {
        Expr::Literal(value) => Ok(value.clone()),
        Expr::Path(segments) => Ok(resolver.resolve(segments).unwrap_or(Value::Null)),
        Expr::Unary { op, operand } => {
            let value = evaluate(operand, resolver)?;
            match op {
                UnaryOp::Not => Ok(Value::Bool(!value::as_condition(&value)?)),
                UnaryOp::Neg => {
                    let n = as_number(&value, expr)?;
                    Ok(value::number(-n))
                }
            }
        }
        Expr::Binary { op, left, right } => match op {
            BinaryOp::And => {
                if !value::as_condition(&evaluate(left, resolver)?)? {
                    return Ok(Value::Bool(false));
                }
                Ok(Value::Bool(value::as_condition(&evaluate(right, resolver)?)?))
            }
            BinaryOp::Or => {
                if value::as_condition(&evaluate(left, resolver)?)? {
                    return Ok(Value::Bool(true));
                }
                Ok(Value::Bool(value::as_condition(&evaluate(right, resolver)?)?))
            }
            _ => {
                let lhs = evaluate(left, resolver)?;
                let rhs = evaluate(right, resolver)?;
                apply_binary(*op, &lhs, &rhs, expr)
            }
        },
    }
}

fn apply_binary(op: BinaryOp, lhs: &Value, rhs: &Value, expr: &Expr) -> Result<Value, EvaluationError> {
    match op {
        BinaryOp::Eq => Ok(Value::Bool(value::loose_eq(lhs, rhs))),
        BinaryOp::NotEq => Ok(Value::Bool(!value::loose_eq(lhs, rhs))),
        BinaryOp::Less | BinaryOp::LessEq | BinaryOp::Greater | BinaryOp::GreaterEq => {
            // Comparisons against an unbound path are simply false
            if lhs.is_null() || rhs.is_null() {
                return Ok(Value::Bool(false));
            }
            let ordering = value::compare(lhs, rhs).ok_or_else(|| {
                EvaluationError::type_mismatch(format!(
                    "cannot compare {} with {} in `{expr}`",
                    value::type_name(lhs),
                    value::type_name(rhs)
                ))
            })?;
            let result = match op {
                BinaryOp::Less => ordering == Ordering::Less,
                BinaryOp::LessEq => ordering != Ordering::Greater,
                BinaryOp::Greater => ordering == Ordering::Greater,
                _ => ordering != Ordering::Less,
            };
            Ok(Value::Bool(result))
        }
        BinaryOp::Add => match (lhs, rhs) {
            (Value::String(a), b) => Ok(Value::String(format!("{a}{}", display(b)))),
            (a, Value::String(b)) => Ok(Value::String(format!("{}{b}", display(a)))),
            _ => Ok(value::number(as_number(lhs, expr)? + as_number(rhs, expr)?)),
        },
        BinaryOp::Sub => Ok(value::number(as_number(lhs, expr)? - as_number(rhs, expr)?)),
        BinaryOp::Mul => Ok(value::number(as_number(lhs, expr)? * as_number(rhs, expr)?)),
        BinaryOp::Div => {
            let divisor = as_number(rhs, expr)?;
            if divisor == 0.0 {
                return Err(EvaluationError::DivisionByZero {
                    expression: expr.to_string(),
                });
            }
            Ok(value::number(as_number(lhs, expr)? / divisor))
        }
        BinaryOp::And | BinaryOp::Or => unreachable!("logical operators short-circuit above"),
    }
}

fn as_number(value: &Value, expr: &Expr) -> Result<f64, EvaluationError> {
    value.as_f64().ok_or_else(|| {
        EvaluationError::type_mismatch(format!(
            "expected a number, found {} in `{expr}`",
            value::type_name(value)
        ))
    })
}

fn display(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
