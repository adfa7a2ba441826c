//! Expression AST

use crate::value::Value;
use std::fmt;

/// Unary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    /// `!`
    Not,
    /// `-`
    Neg,
}

/// Binary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Or,
    And,
    Eq,
    NotEq,
    Less,
    LessEq,
    Greater,
    GreaterEq,
    Add,
    Sub,
    Mul,
    Div,
}

impl BinaryOp {
    /// Source symbol for the operator
    pub fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Or => "||",
            BinaryOp::And => "&&",
            BinaryOp::Eq => "==",
            BinaryOp::NotEq => "!=",
            BinaryOp::Less => "<",
            BinaryOp::LessEq => "<=",
            BinaryOp::Greater => ">",
            BinaryOp::GreaterEq => ">=",
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
        }
    }
}

/// Parsed expression tree
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Number, string, boolean or null literal
    Literal(Value),
    /// Dotted property path, one entry per segment
    Path(Vec<String>),
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
}

impl Expr {
    /// Visit every property path in the tree, left to right
    pub fn for_each_path<'a>(&'a self, visit: &mut impl FnMut(&'a [String])) {
        match self {
            Expr::Literal(_) => {}
            Expr::Path(segments) => visit(segments),
            Expr::Unary { operand, .. } => operand.for_each_path(visit),
            Expr::Binary { left, right, .. } => {
                left.for_each_path(visit);
                right.for_each_path(visit);
            }
        }
    }

    /// Rewrite paths, replacing those `substitute` resolves with literals
    pub fn substitute(&self, substitute: &impl Fn(&[String]) -> Option<Value>) -> Expr {
        match self {
            Expr::Literal(value) => Expr::Literal(value.clone()),
            Expr::Path(segments) => match substitute(segments) {
                Some(value) => Expr::Literal(value),
                None => Expr::Path(segments.clone()),
            },
            Expr::Unary { op, operand } => Expr::Unary {
                op: *op,
                operand: Box::new(operand.substitute(substitute)),
            },
            Expr::Binary { op, left, right } => Expr::Binary {
                op: *op,
                left: Box::new(left.substitute(substitute)),
                right: Box::new(right.substitute(substitute)),
            },
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            // JSON rendering keeps strings quoted and escaped
            Expr::Literal(value) => write!(f, "{value}"),
            Expr::Path(segments) => f.write_str(&segments.join(".")),
            Expr::Unary { op: UnaryOp::Not, operand } => write!(f, "!{operand}"),
            Expr::Unary { op: UnaryOp::Neg, operand } => write!(f, "-{operand}"),
            Expr::Binary { op, left, right } => write!(f, "({left} {} {right})", op.symbol()),
        }
    }
}
