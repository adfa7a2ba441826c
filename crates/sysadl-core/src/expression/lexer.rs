//! Tokenizer for condition and value expressions

use crate::errors::EvaluationError;

/// Token kinds
#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Number(f64),
    Str(String),
    /// Dotted path, already split into segments
    Path(Vec<String>),
    True,
    False,
    Null,
    Bang,
    AndAnd,
    OrOr,
    EqEq,
    BangEq,
    Less,
    LessEq,
    Greater,
    GreaterEq,
    Plus,
    Minus,
    Star,
    Slash,
    LParen,
    RParen,
    Eof,
}

/// A token with its byte offset in the source
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub offset: usize,
}

/// Split `source` into tokens, always ending with [`TokenKind::Eof`]
pub fn tokenize(source: &str) -> Result<Vec<Token>, EvaluationError> {
    Lexer::new(source).run()
}

struct Lexer<'src> {
    source: &'src str,
    bytes: &'src [u8],
    pos: usize,
}

impl<'src> Lexer<'src> {
    fn new(source: &'src str) -> Self {
        Self {
            source,
            bytes: source.as_bytes(),
            pos: 0,
        }
    }

    fn run(mut self) -> Result<Vec<Token>, EvaluationError> {
        let mut tokens = Vec::new();
        loop {
            self.skip_whitespace();
            let offset = self.pos;
            let Some(&byte) = self.bytes.get(self.pos) else {
                tokens.push(Token {
                    kind: TokenKind::Eof,
                    offset,
                });
                return Ok(tokens);
            };

            let kind = match byte {
                b'(' => self.single(TokenKind::LParen),
                b')' => self.single(TokenKind::RParen),
                b'+' => self.single(TokenKind::Plus),
                b'-' => self.single(TokenKind::Minus),
                b'*' => self.single(TokenKind::Star),
                b'/' => self.single(TokenKind::Slash),
                b'&' => self.double(b'&', TokenKind::AndAnd, "expected `&&`")?,
                b'|' => self.double(b'|', TokenKind::OrOr, "expected `||`")?,
                b'=' => {
                    // `==` and the strict `===` spelling are the same operator
                    self.double(b'=', TokenKind::EqEq, "assignment is not an expression; use `==`")?;
                    self.eat(b'=');
                    TokenKind::EqEq
                }
                b'!' => {
                    self.pos += 1;
                    if self.eat(b'=') {
                        self.eat(b'=');
                        TokenKind::BangEq
                    } else {
                        TokenKind::Bang
                    }
                }
                b'<' => {
                    self.pos += 1;
                    if self.eat(b'=') {
                        TokenKind::LessEq
                    } else {
                        TokenKind::Less
                    }
                }
                b'>' => {
                    self.pos += 1;
                    if self.eat(b'=') {
                        TokenKind::GreaterEq
                    } else {
                        TokenKind::Greater
                    }
                }
                b'"' | b'\'' => self.string(byte)?,
                b'0'..=b'9' => self.number()?,
                b'.' if self.peek_at(1).is_some_and(|b| b.is_ascii_digit()) => self.number()?,
                b if is_ident_start(b) => self.path()?,
                _ => {
                    let ch = self.source[self.pos..].chars().next().unwrap_or('?');
                    return Err(self.error(offset, format!("unexpected character `{ch}`")));
                }
            };
            tokens.push(Token { kind, offset });
        }
    }

    fn skip_whitespace(&mut self) {
        while self
            .bytes
            .get(self.pos)
            .is_some_and(|b| b.is_ascii_whitespace())
        {
            self.pos += 1;
        }
    }

    fn peek_at(&self, ahead: usize) -> Option<u8> {
        self.bytes.get(self.pos + ahead).copied()
    }

    fn eat(&mut self, expected: u8) -> bool {
        if self.bytes.get(self.pos) == Some(&expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn single(&mut self, kind: TokenKind) -> TokenKind {
        self.pos += 1;
        kind
    }

    fn double(
        &mut self,
        second: u8,
        kind: TokenKind,
        message: &str,
    ) -> Result<TokenKind, EvaluationError> {
        let offset = self.pos;
        self.pos += 1;
        if self.eat(second) {
            Ok(kind)
        } else {
            Err(self.error(offset, message))
        }
    }

    fn string(&mut self, quote: u8) -> Result<TokenKind, EvaluationError> {
        let start = self.pos;
        self.pos += 1;
        let mut text = String::new();
        loop {
            let Some(ch) = self.source[self.pos..].chars().next() else {
                return Err(self.error(start, "unterminated string literal"));
            };
            self.pos += ch.len_utf8();
            match ch {
                c if c as u32 == u32::from(quote) => return Ok(TokenKind::Str(text)),
                '\\' => {
                    let Some(escaped) = self.source[self.pos..].chars().next() else {
                        return Err(self.error(start, "unterminated string literal"));
                    };
                    self.pos += escaped.len_utf8();
                    text.push(match escaped {
                        'n' => '\n',
                        't' => '\t',
                        'r' => '\r',
                        other => other,
                    });
                }
                c => text.push(c),
            }
        }
    }

    fn number(&mut self) -> Result<TokenKind, EvaluationError> {
        let start = self.pos;
        while self
            .bytes
            .get(self.pos)
            .is_some_and(|b| b.is_ascii_digit() || *b == b'.')
        {
            self.pos += 1;
        }
        let text = &self.source[start..self.pos];
        text.parse::<f64>()
            .map(TokenKind::Number)
            .map_err(|_| self.error(start, format!("invalid number `{text}`")))
    }

    fn path(&mut self) -> Result<TokenKind, EvaluationError> {
        let start = self.pos;
        let mut segments = Vec::new();
        loop {
            let seg_start = self.pos;
            while self.bytes.get(self.pos).is_some_and(|b| is_ident_continue(*b)) {
                self.pos += 1;
            }
            if seg_start == self.pos {
                return Err(self.error(seg_start, "expected a path segment after `.`"));
            }
            segments.push(self.source[seg_start..self.pos].to_string());
            if !self.eat(b'.') {
                break;
            }
        }

        if segments.len() == 1 {
            match segments[0].as_str() {
                "true" => return Ok(TokenKind::True),
                "false" => return Ok(TokenKind::False),
                "null" | "undefined" => return Ok(TokenKind::Null),
                _ => {}
            }
        }
        if segments[0].as_bytes().first().is_some_and(u8::is_ascii_digit) {
            return Err(self.error(start, "path must start with a letter or `_`"));
        }
        Ok(TokenKind::Path(segments))
    }

    fn error(&self, offset: usize, message: impl Into<String>) -> EvaluationError {
        EvaluationError::syntax(self.source, offset, message)
    }
}

fn is_ident_start(byte: u8) -> bool {
    byte.is_ascii_alphabetic() || byte == b'_' || byte == b'$'
}

fn is_ident_continue(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || byte == b'_' || byte == b'$'
}
