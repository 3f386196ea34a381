//! # Attribute Filter Expressions
//!
//! Parser and evaluator for the attribute-filter language of the message
//! bus, restricted to the forms subscriptions are created with:
//!
//! ```text
//! expr    := unary (("AND" | "OR") unary)*     -- one operator per level
//! unary   := "NOT" unary | primary
//! primary := "(" expr ")"
//!          | "attributes" ":" key
//!          | "attributes" "." key ("=" | "!=") string
//!          | "hasPrefix" "(" "attributes" "." key "," string ")"
//! key     := string | identifier
//! ```

use super::BusError;
use std::collections::BTreeMap;

/// A parsed attribute filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttributeFilter {
    Has(String),
    Equals(String, String),
    /// Also matches when the attribute is absent.
    NotEquals(String, String),
    HasPrefix(String, String),
    Not(Box<AttributeFilter>),
    And(Vec<AttributeFilter>),
    Or(Vec<AttributeFilter>),
}

impl AttributeFilter {
    /// Parse a filter string.
    ///
    /// # Errors
    ///
    /// `BusError::InvalidArgument` describing the first syntax problem.
    pub fn parse(input: &str) -> Result<Self, BusError> {
        let tokens = tokenize(input)?;
        let mut parser = Parser { tokens, pos: 0 };
        let filter = parser.parse_expr()?;
        if parser.pos != parser.tokens.len() {
            return Err(invalid(format!(
                "unexpected trailing input at token {}",
                parser.pos
            )));
        }
        Ok(filter)
    }

    /// Evaluate against a message's attributes.
    #[must_use]
    pub fn matches(&self, attributes: &BTreeMap<String, String>) -> bool {
        match self {
            Self::Has(key) => attributes.contains_key(key),
            Self::Equals(key, value) => attributes.get(key) == Some(value),
            Self::NotEquals(key, value) => attributes.get(key) != Some(value),
            Self::HasPrefix(key, prefix) => attributes
                .get(key)
                .is_some_and(|v| v.starts_with(prefix.as_str())),
            Self::Not(inner) => !inner.matches(attributes),
            Self::And(terms) => terms.iter().all(|t| t.matches(attributes)),
            Self::Or(terms) => terms.iter().any(|t| t.matches(attributes)),
        }
    }
}

fn invalid(message: impl Into<String>) -> BusError {
    BusError::InvalidArgument(format!("invalid filter: {}", message.into()))
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    LParen,
    RParen,
    Colon,
    Dot,
    Comma,
    Eq,
    NotEq,
    Str(String),
    Ident(String),
}

fn tokenize(input: &str) -> Result<Vec<Token>, BusError> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '(' | ')' | ':' | '.' | ',' | '=' => {
                chars.next();
                tokens.push(match c {
                    '(' => Token::LParen,
                    ')' => Token::RParen,
                    ':' => Token::Colon,
                    '.' => Token::Dot,
                    ',' => Token::Comma,
                    _ => Token::Eq,
                });
            }
            '!' => {
                chars.next();
                if chars.next() != Some('=') {
                    return Err(invalid("expected '=' after '!'"));
                }
                tokens.push(Token::NotEq);
            }
            '"' => {
                chars.next();
                let mut value = String::new();
                loop {
                    match chars.next() {
                        Some('\\') => match chars.next() {
                            Some(escaped) => value.push(escaped),
                            None => return Err(invalid("unterminated escape")),
                        },
                        Some('"') => break,
                        Some(other) => value.push(other),
                        None => return Err(invalid("unterminated string")),
                    }
                }
                tokens.push(Token::Str(value));
            }
            c if c.is_alphanumeric() || c == '_' || c == '-' => {
                let mut ident = String::new();
                while let Some(&next) = chars.peek() {
                    if next.is_alphanumeric() || next == '_' || next == '-' {
                        ident.push(next);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Ident(ident));
            }
            other => return Err(invalid(format!("unexpected character {other:?}"))),
        }
    }
    Ok(tokens)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Combinator {
    And,
    Or,
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn expect(&mut self, expected: &Token) -> Result<(), BusError> {
        match self.advance() {
            Some(ref token) if token == expected => Ok(()),
            other => Err(invalid(format!("expected {expected:?}, found {other:?}"))),
        }
    }

    fn peek_keyword(&self, keyword: &str) -> bool {
        matches!(self.peek(), Some(Token::Ident(word)) if word == keyword)
    }

    fn parse_expr(&mut self) -> Result<AttributeFilter, BusError> {
        let first = self.parse_unary()?;
        let mut combinator = None;
        let mut rest = Vec::new();

        loop {
            let next = if self.peek_keyword("AND") {
                Combinator::And
            } else if self.peek_keyword("OR") {
                Combinator::Or
            } else {
                break;
            };
            if combinator.is_some_and(|existing| existing != next) {
                return Err(invalid("AND and OR must not be mixed without parentheses"));
            }
            combinator = Some(next);
            self.advance();
            rest.push(self.parse_unary()?);
        }

        let Some(combinator) = combinator else {
            return Ok(first);
        };
        let mut terms = Vec::with_capacity(rest.len() + 1);
        terms.push(first);
        terms.extend(rest);
        Ok(match combinator {
            Combinator::And => AttributeFilter::And(terms),
            Combinator::Or => AttributeFilter::Or(terms),
        })
    }

    fn parse_unary(&mut self) -> Result<AttributeFilter, BusError> {
        if self.peek_keyword("NOT") {
            self.advance();
            return Ok(AttributeFilter::Not(Box::new(self.parse_unary()?)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<AttributeFilter, BusError> {
        match self.advance() {
            Some(Token::LParen) => {
                let inner = self.parse_expr()?;
                self.expect(&Token::RParen)?;
                Ok(inner)
            }
            Some(Token::Ident(word)) if word == "attributes" => match self.advance() {
                Some(Token::Colon) => Ok(AttributeFilter::Has(self.parse_key()?)),
                Some(Token::Dot) => {
                    let key = self.parse_key()?;
                    let negated = match self.advance() {
                        Some(Token::Eq) => false,
                        Some(Token::NotEq) => true,
                        other => {
                            return Err(invalid(format!("expected '=' or '!=', found {other:?}")))
                        }
                    };
                    let value = self.parse_string()?;
                    Ok(if negated {
                        AttributeFilter::NotEquals(key, value)
                    } else {
                        AttributeFilter::Equals(key, value)
                    })
                }
                other => Err(invalid(format!(
                    "expected ':' or '.' after attributes, found {other:?}"
                ))),
            },
            Some(Token::Ident(word)) if word == "hasPrefix" => {
                self.expect(&Token::LParen)?;
                self.expect(&Token::Ident("attributes".to_string()))?;
                self.expect(&Token::Dot)?;
                let key = self.parse_key()?;
                self.expect(&Token::Comma)?;
                let prefix = self.parse_string()?;
                self.expect(&Token::RParen)?;
                Ok(AttributeFilter::HasPrefix(key, prefix))
            }
            other => Err(invalid(format!("unexpected token {other:?}"))),
        }
    }

    fn parse_key(&mut self) -> Result<String, BusError> {
        match self.advance() {
            Some(Token::Str(key)) | Some(Token::Ident(key)) => Ok(key),
            other => Err(invalid(format!("expected attribute key, found {other:?}"))),
        }
    }

    fn parse_string(&mut self) -> Result<String, BusError> {
        match self.advance() {
            Some(Token::Str(value)) => Ok(value),
            other => Err(invalid(format!("expected quoted string, found {other:?}"))),
        }
    }
}
