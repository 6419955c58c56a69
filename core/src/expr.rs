//! Restricted arithmetic expression evaluator.
//!
//! RULE: formulas are NEVER handed to a general-purpose evaluator.
//! The grammar below is closed: qualified field references
//! (`alias.field`), bare references to earlier formula outputs, numeric
//! literals, the four arithmetic operators, unary minus and
//! parentheses. Nothing else parses, so nothing else can execute.
//!
//! Grammar (standard precedence, left associative):
//!   expr    := term (('+' | '-') term)*
//!   term    := factor (('*' | '/') factor)*
//!   factor  := '-' factor | primary
//!   primary := number | ident ('.' ident)? | '(' expr ')'

use crate::{
    error::{EngineError, EngineResult},
    types::Document,
};
use serde_json::Value;
use std::collections::BTreeSet;

/// A qualified `alias.field` reference, as written in formula text.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct FieldRef {
    pub alias: String,
    pub field: String,
}

impl FieldRef {
    /// The flattened key used to store this field inside an output row.
    pub fn qualified(&self) -> String {
        format!("{}.{}", self.alias, self.field)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    /// `alias.field` — bound to a source record's field at evaluation.
    Field(FieldRef),
    /// Bare identifier — bound to an earlier formula output. Only delta
    /// column expressions make use of this in practice.
    Output(String),
    Neg(Box<Expr>),
    Add(Box<Expr>, Box<Expr>),
    Sub(Box<Expr>, Box<Expr>),
    Mul(Box<Expr>, Box<Expr>),
    Div(Box<Expr>, Box<Expr>),
}

/// Name bindings for one evaluation: the merged output row (qualified
/// `alias.field` keys) plus the formula outputs computed so far.
pub struct Scope<'a> {
    pub fields: &'a Document,
    pub outputs: &'a Document,
}

impl Expr {
    pub fn parse(text: &str) -> EngineResult<Expr> {
        let tokens = lex(text).map_err(|reason| EngineError::ExprParse {
            expr: text.to_string(),
            reason,
        })?;
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.expr().map_err(|reason| EngineError::ExprParse {
            expr: text.to_string(),
            reason,
        })?;
        if parser.pos != parser.tokens.len() {
            return Err(EngineError::ExprParse {
                expr: text.to_string(),
                reason: format!("unexpected trailing input at token {}", parser.pos),
            });
        }
        Ok(expr)
    }

    /// Every qualified field this expression reads. Collected once at
    /// configuration-load time so each report declares its required
    /// fields up front instead of resolving them ad hoc per record.
    pub fn referenced_fields(&self, out: &mut BTreeSet<FieldRef>) {
        match self {
            Expr::Number(_) | Expr::Output(_) => {}
            Expr::Field(f) => {
                out.insert(f.clone());
            }
            Expr::Neg(inner) => inner.referenced_fields(out),
            Expr::Add(a, b) | Expr::Sub(a, b) | Expr::Mul(a, b) | Expr::Div(a, b) => {
                a.referenced_fields(out);
                b.referenced_fields(out);
            }
        }
    }

    /// Bare output names this expression reads.
    pub fn referenced_outputs(&self, out: &mut BTreeSet<String>) {
        match self {
            Expr::Number(_) | Expr::Field(_) => {}
            Expr::Output(name) => {
                out.insert(name.clone());
            }
            Expr::Neg(inner) => inner.referenced_outputs(out),
            Expr::Add(a, b) | Expr::Sub(a, b) | Expr::Mul(a, b) | Expr::Div(a, b) => {
                a.referenced_outputs(out);
                b.referenced_outputs(out);
            }
        }
    }

    /// True when every name this expression reads is present in scope.
    /// Presence only — a present-but-non-numeric value still fails in
    /// `eval`, and that failure is a record error rather than a deferral.
    pub fn is_ready(&self, scope: &Scope<'_>) -> bool {
        match self {
            Expr::Number(_) => true,
            Expr::Field(f) => scope.fields.contains_key(&f.qualified()),
            Expr::Output(name) => scope.outputs.contains_key(name),
            Expr::Neg(inner) => inner.is_ready(scope),
            Expr::Add(a, b) | Expr::Sub(a, b) | Expr::Mul(a, b) | Expr::Div(a, b) => {
                a.is_ready(scope) && b.is_ready(scope)
            }
        }
    }

    pub fn eval(&self, scope: &Scope<'_>) -> EngineResult<f64> {
        match self {
            Expr::Number(n) => Ok(*n),
            Expr::Field(f) => {
                let key = f.qualified();
                let value = scope
                    .fields
                    .get(&key)
                    .ok_or_else(|| EngineError::Eval(format!("missing field '{key}'")))?;
                numeric(value).ok_or_else(|| {
                    EngineError::Eval(format!("field '{key}' is not numeric: {value}"))
                })
            }
            Expr::Output(name) => {
                let value = scope
                    .outputs
                    .get(name)
                    .ok_or_else(|| EngineError::Eval(format!("missing output '{name}'")))?;
                numeric(value).ok_or_else(|| {
                    EngineError::Eval(format!("output '{name}' is not numeric: {value}"))
                })
            }
            Expr::Neg(inner) => Ok(-inner.eval(scope)?),
            Expr::Add(a, b) => Ok(a.eval(scope)? + b.eval(scope)?),
            Expr::Sub(a, b) => Ok(a.eval(scope)? - b.eval(scope)?),
            Expr::Mul(a, b) => Ok(a.eval(scope)? * b.eval(scope)?),
            Expr::Div(a, b) => {
                let denom = b.eval(scope)?;
                if denom == 0.0 {
                    return Err(EngineError::Eval("division by zero".into()));
                }
                Ok(a.eval(scope)? / denom)
            }
        }
    }
}

/// Coerce a JSON value to f64. Source data arrives from spreadsheet
/// uploads, so numeric strings ("100", " 12.5 ") count as numeric.
pub fn numeric(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

// ── Lexer ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Ident(String),
    Plus,
    Minus,
    Star,
    Slash,
    Dot,
    LParen,
    RParen,
}

fn lex(text: &str) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let mut chars = text.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' | '\r' | '\n' => {
                chars.next();
            }
            '+' => {
                chars.next();
                tokens.push(Token::Plus);
            }
            '-' => {
                chars.next();
                tokens.push(Token::Minus);
            }
            '*' => {
                chars.next();
                tokens.push(Token::Star);
            }
            '/' => {
                chars.next();
                tokens.push(Token::Slash);
            }
            '.' => {
                chars.next();
                tokens.push(Token::Dot);
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            '0'..='9' => {
                let mut raw = String::new();
                while let Some(&d) = chars.peek() {
                    if d.is_ascii_digit() || d == '.' {
                        raw.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let n = raw
                    .parse::<f64>()
                    .map_err(|_| format!("invalid number literal '{raw}'"))?;
                tokens.push(Token::Number(n));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut ident = String::new();
                while let Some(&d) = chars.peek() {
                    if d.is_ascii_alphanumeric() || d == '_' {
                        ident.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Ident(ident));
            }
            other => return Err(format!("unexpected character '{other}'")),
        }
    }

    Ok(tokens)
}

// ── Parser ─────────────────────────────────────────────────────────

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).cloned();
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn expr(&mut self) -> Result<Expr, String> {
        let mut lhs = self.term()?;
        loop {
            match self.peek() {
                Some(Token::Plus) => {
                    self.pos += 1;
                    let rhs = self.term()?;
                    lhs = Expr::Add(Box::new(lhs), Box::new(rhs));
                }
                Some(Token::Minus) => {
                    self.pos += 1;
                    let rhs = self.term()?;
                    lhs = Expr::Sub(Box::new(lhs), Box::new(rhs));
                }
                _ => return Ok(lhs),
            }
        }
    }

    fn term(&mut self) -> Result<Expr, String> {
        let mut lhs = self.factor()?;
        loop {
            match self.peek() {
                Some(Token::Star) => {
                    self.pos += 1;
                    let rhs = self.factor()?;
                    lhs = Expr::Mul(Box::new(lhs), Box::new(rhs));
                }
                Some(Token::Slash) => {
                    self.pos += 1;
                    let rhs = self.factor()?;
                    lhs = Expr::Div(Box::new(lhs), Box::new(rhs));
                }
                _ => return Ok(lhs),
            }
        }
    }

    fn factor(&mut self) -> Result<Expr, String> {
        if let Some(Token::Minus) = self.peek() {
            self.pos += 1;
            let inner = self.factor()?;
            return Ok(Expr::Neg(Box::new(inner)));
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Expr, String> {
        match self.next() {
            Some(Token::Number(n)) => Ok(Expr::Number(n)),
            Some(Token::Ident(alias)) => {
                if let Some(Token::Dot) = self.peek() {
                    self.pos += 1;
                    match self.next() {
                        Some(Token::Ident(field)) => Ok(Expr::Field(FieldRef { alias, field })),
                        other => Err(format!("expected field name after '{alias}.', got {other:?}")),
                    }
                } else {
                    Ok(Expr::Output(alias))
                }
            }
            Some(Token::LParen) => {
                let inner = self.expr()?;
                match self.next() {
                    Some(Token::RParen) => Ok(inner),
                    other => Err(format!("expected ')', got {other:?}")),
                }
            }
            other => Err(format!("expected value, got {other:?}")),
        }
    }
}
