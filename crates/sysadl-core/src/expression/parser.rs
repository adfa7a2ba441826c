//! Recursive-descent parser.
//!
//! Precedence (lowest → highest):
//! 6. `||`
//! 5. `&&`
//! 4. `==`, `!=`
//! 3. `<`, `<=`, `>`, `>=` (no chaining)
//! 2. `+`, `-`
//! 1. `*`, `/`
//! 0. unary `!`, `-`; literals, paths, parentheses

use super::ast::{BinaryOp, Expr, UnaryOp};
use super::lexer::{tokenize, Token, TokenKind};
use crate::errors::EvaluationError;
use serde_json::Value;

const MAX_DEPTH: usize = 64;

/// Parse a complete expression
pub fn parse(source: &str) -> Result<Expr, EvaluationError> {
    if source.trim().is_empty() {
        return Err(EvaluationError::Empty);
    }
    let tokens = tokenize(source)?;
    let mut parser = Parser {
        source,
        tokens,
        pos: 0,
        depth: 0,
    };
    let expr = parser.parse_or()?;
    match parser.peek() {
        TokenKind::Eof => Ok(expr),
        other => Err(parser.error(format!("unexpected trailing token {other:?}"))),
    }
}

struct Parser<'src> {
    source: &'src str,
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl<'src> Parser<'src> {
    /// `OrExpr = AndExpr { "||" AndExpr }`
    fn parse_or(&mut self) -> Result<Expr, EvaluationError> {
        let mut left = self.parse_and()?;
        while self.eat(&TokenKind::OrOr) {
            let right = self.parse_and()?;
            left = binary(BinaryOp::Or, left, right);
        }
        Ok(left)
    }

    /// `AndExpr = EqExpr { "&&" EqExpr }`
    fn parse_and(&mut self) -> Result<Expr, EvaluationError> {
        let mut left = self.parse_equality()?;
        while self.eat(&TokenKind::AndAnd) {
            let right = self.parse_equality()?;
            left = binary(BinaryOp::And, left, right);
        }
        Ok(left)
    }

    /// `EqExpr = CmpExpr { ("==" | "!=") CmpExpr }`
    fn parse_equality(&mut self) -> Result<Expr, EvaluationError> {
        let mut left = self.parse_comparison()?;
        loop {
            let op = match self.peek() {
                TokenKind::EqEq => BinaryOp::Eq,
                TokenKind::BangEq => BinaryOp::NotEq,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.parse_comparison()?;
            left = binary(op, left, right);
        }
    }

    /// `CmpExpr = AddExpr [ CmpOp AddExpr ]`
    ///
    /// Comparisons do not chain: `a < b < c` is rejected.
    fn parse_comparison(&mut self) -> Result<Expr, EvaluationError> {
        let left = self.parse_additive()?;
        let Some(op) = self.comparison_op() else {
            return Ok(left);
        };
        self.advance();
        let right = self.parse_additive()?;
        if self.comparison_op().is_some() {
            return Err(self.error("comparison operators cannot be chained; combine with `&&`"));
        }
        Ok(binary(op, left, right))
    }

    fn comparison_op(&self) -> Option<BinaryOp> {
        match self.peek() {
            TokenKind::Less => Some(BinaryOp::Less),
            TokenKind::LessEq => Some(BinaryOp::LessEq),
            TokenKind::Greater => Some(BinaryOp::Greater),
            TokenKind::GreaterEq => Some(BinaryOp::GreaterEq),
            _ => None,
        }
    }

    /// `AddExpr = MulExpr { ("+" | "-") MulExpr }`
    fn parse_additive(&mut self) -> Result<Expr, EvaluationError> {
        let mut left = self.parse_multiplicative()?;
        loop {
            let op = match self.peek() {
                TokenKind::Plus => BinaryOp::Add,
                TokenKind::Minus => BinaryOp::Sub,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.parse_multiplicative()?;
            left = binary(op, left, right);
        }
    }

    /// `MulExpr = UnaryExpr { ("*" | "/") UnaryExpr }`
    fn parse_multiplicative(&mut self) -> Result<Expr, EvaluationError> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                TokenKind::Star => BinaryOp::Mul,
                TokenKind::Slash => BinaryOp::Div,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.parse_unary()?;
            left = binary(op, left, right);
        }
    }

    /// `UnaryExpr = ("!" | "-") UnaryExpr | Primary`
    fn parse_unary(&mut self) -> Result<Expr, EvaluationError> {
        let op = match self.peek() {
            TokenKind::Bang => UnaryOp::Not,
            TokenKind::Minus => UnaryOp::Neg,
            _ => return self.parse_primary(),
        };
        self.advance();
        self.enter()?;
        let operand = self.parse_unary();
        self.depth -= 1;
        Ok(Expr::Unary {
            op,
            operand: Box::new(operand?),
        })
    }

    fn parse_primary(&mut self) -> Result<Expr, EvaluationError> {
        let kind = self.peek().clone();
        let expr = match kind {
            TokenKind::Number(n) => Expr::Literal(crate::value::number(n)),
            TokenKind::Str(s) => Expr::Literal(Value::String(s)),
            TokenKind::True => Expr::Literal(Value::Bool(true)),
            TokenKind::False => Expr::Literal(Value::Bool(false)),
            TokenKind::Null => Expr::Literal(Value::Null),
            TokenKind::Path(segments) => Expr::Path(segments),
            TokenKind::LParen => {
                self.advance();
                self.enter()?;
                let inner = self.parse_or();
                self.depth -= 1;
                let inner = inner?;
                if !self.eat(&TokenKind::RParen) {
                    return Err(self.error("expected `)`"));
                }
                return Ok(inner);
            }
            TokenKind::Eof => return Err(self.error("unexpected end of expression")),
            other => return Err(self.error(format!("expected an operand, found {other:?}"))),
        };
        self.advance();
        Ok(expr)
    }

    fn enter(&mut self) -> Result<(), EvaluationError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            self.depth -= 1;
            return Err(self.error(format!("expression nesting exceeds {MAX_DEPTH} levels")));
        }
        Ok(())
    }

    fn peek(&self) -> &TokenKind {
        self.tokens
            .get(self.pos)
            .map_or(&TokenKind::Eof, |token| &token.kind)
    }

    fn advance(&mut self) {
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
    }

    fn eat(&mut self, kind: &TokenKind) -> bool {
        if self.peek() == kind {
            self.advance();
            true
        } else {
            false
        }
    }

    fn error(&self, message: impl Into<String>) -> EvaluationError {
        let offset = self
            .tokens
            .get(self.pos)
            .map_or(self.source.len(), |token| token.offset);
        EvaluationError::syntax(self.source, offset, message)
    }
}

fn binary(op: BinaryOp, left: Expr, right: Expr) -> Expr {
    Expr::Binary {
        op,
        left: Box::new(left),
        right: Box::new(right),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn path(p: &str) -> Expr {
        Expr::Path(p.split('.').map(str::to_string).collect())
    }

    #[test]
    fn test_precedence() {
        let expr = parse("a || b && c").unwrap();
        assert_eq!(
            expr,
            binary(BinaryOp::Or, path("a"), binary(BinaryOp::And, path("b"), path("c")))
        );

        let expr = parse("x + 2 * 3 > 7").unwrap();
        assert_eq!(
            expr,
            binary(
                BinaryOp::Greater,
                binary(
                    BinaryOp::Add,
                    path("x"),
                    binary(BinaryOp::Mul, Expr::Literal(json!(2)), Expr::Literal(json!(3)))
                ),
                Expr::Literal(json!(7))
            )
        );
    }

    #[test]
    fn test_negation_and_grouping() {
        let expr = parse("!(door.open || door.locked)").unwrap();
        assert!(matches!(expr, Expr::Unary { op: UnaryOp::Not, .. }));
        assert_eq!(expr.to_string(), "!(door.open || door.locked)");
    }

    #[test]
    fn test_rejects_malformed() {
        assert!(matches!(parse("   "), Err(EvaluationError::Empty)));
        assert!(parse("a &&").is_err());
        assert!(parse("(a").is_err());
        assert!(parse("a < b < c").is_err());
        assert!(parse("a b").is_err());
        assert!(parse(")").is_err());
    }

    #[test]
    fn test_depth_limit() {
        let deep = format!("{}x{}", "(".repeat(100), ")".repeat(100));
        assert!(parse(&deep).is_err());
    }
}
