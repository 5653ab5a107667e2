//! Condition expressions for gating jobs and steps.
//!
//! ```text
//! ${git.ref} == 'refs/heads/master' && ${repo.name} == 'commaai/openpilot'
//! startsWith(${git.ref}, 'refs/tags/') || !${event.action}
//! ```
//!
//! Operands are quoted strings, `${var}` references, bare dotted names
//! (`git.ref`), `true`/`false`, and the functions `startsWith`, `endsWith`
//! and `contains`. Unknown variables evaluate to the empty string.

use crate::variables::VariableContext;
use crate::{ConfigError, ConfigResult};

/// A parsed condition expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(String),
    Bool(bool),
    Var(String),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Eq(Box<Expr>, Box<Expr>),
    Ne(Box<Expr>, Box<Expr>),
    Call(Function, Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Function {
    StartsWith,
    EndsWith,
    Contains,
}

#[derive(Debug, Clone, PartialEq)]
enum Value {
    Str(String),
    Bool(bool),
}

impl Value {
    fn truthy(&self) -> bool {
        match self {
            Value::Bool(b) => *b,
            Value::Str(s) => !s.is_empty() && s != "false",
        }
    }

    fn into_string(self) -> String {
        match self {
            Value::Bool(b) => b.to_string(),
            Value::Str(s) => s,
        }
    }
}

impl Expr {
    pub fn parse(source: &str) -> ConfigResult<Self> {
        let tokens = tokenize(source).map_err(|message| ConfigError::Condition {
            expression: source.to_string(),
            message,
        })?;
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.parse_or().and_then(|expr| {
            if parser.pos < parser.tokens.len() {
                Err(format!("unexpected token {:?}", parser.tokens[parser.pos]))
            } else {
                Ok(expr)
            }
        });
        expr.map_err(|message| ConfigError::Condition {
            expression: source.to_string(),
            message,
        })
    }

    /// Evaluate against a variable context.
    pub fn evaluate(&self, ctx: &VariableContext) -> bool {
        self.eval(ctx).truthy()
    }

    fn eval(&self, ctx: &VariableContext) -> Value {
        match self {
            Expr::Literal(s) => Value::Str(s.clone()),
            Expr::Bool(b) => Value::Bool(*b),
            Expr::Var(name) => Value::Str(ctx.resolve(name).unwrap_or_default()),
            Expr::Not(inner) => Value::Bool(!inner.eval(ctx).truthy()),
            Expr::And(l, r) => Value::Bool(l.eval(ctx).truthy() && r.eval(ctx).truthy()),
            Expr::Or(l, r) => Value::Bool(l.eval(ctx).truthy() || r.eval(ctx).truthy()),
            Expr::Eq(l, r) => Value::Bool(l.eval(ctx).into_string() == r.eval(ctx).into_string()),
            Expr::Ne(l, r) => Value::Bool(l.eval(ctx).into_string() != r.eval(ctx).into_string()),
            Expr::Call(func, a, b) => {
                let a = a.eval(ctx).into_string();
                let b = b.eval(ctx).into_string();
                Value::Bool(match func {
                    Function::StartsWith => a.starts_with(&b),
                    Function::EndsWith => a.ends_with(&b),
                    Function::Contains => a.contains(&b),
                })
            }
        }
    }
}

/// Parse and evaluate in one go.
pub fn evaluate(source: &str, ctx: &VariableContext) -> ConfigResult<bool> {
    Ok(Expr::parse(source)?.evaluate(ctx))
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    LParen,
    RParen,
    Comma,
    Eq,
    Ne,
    And,
    Or,
    Not,
    Str(String),
    Var(String),
    Ident(String),
}

fn tokenize(source: &str) -> Result<Vec<Token>, String> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '=' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Eq);
                i += 2;
            }
            '!' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Ne);
                i += 2;
            }
            '!' => {
                tokens.push(Token::Not);
                i += 1;
            }
            '&' if chars.get(i + 1) == Some(&'&') => {
                tokens.push(Token::And);
                i += 2;
            }
            '|' if chars.get(i + 1) == Some(&'|') => {
                tokens.push(Token::Or);
                i += 2;
            }
            '\'' | '"' => {
                let quote = c;
                let start = i + 1;
                let end = chars[start..]
                    .iter()
                    .position(|&ch| ch == quote)
                    .map(|p| start + p)
                    .ok_or_else(|| "unterminated string literal".to_string())?;
                tokens.push(Token::Str(chars[start..end].iter().collect()));
                i = end + 1;
            }
            '$' if chars.get(i + 1) == Some(&'{') => {
                let start = i + 2;
                let end = chars[start..]
                    .iter()
                    .position(|&ch| ch == '}')
                    .map(|p| start + p)
                    .ok_or_else(|| "unterminated variable reference".to_string())?;
                let name: String = chars[start..end].iter().collect();
                if name.is_empty() {
                    return Err("empty variable reference".to_string());
                }
                tokens.push(Token::Var(name));
                i = end + 1;
            }
            c if c.is_alphanumeric() || c == '_' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_alphanumeric() || matches!(chars[i], '_' | '.' | '-'))
                {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            other => return Err(format!("unexpected character '{}'", other)),
        }
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn expect(&mut self, expected: Token) -> Result<(), String> {
        match self.next() {
            Some(token) if token == expected => Ok(()),
            Some(token) => Err(format!("expected {:?}, found {:?}", expected, token)),
            None => Err(format!("expected {:?}, found end of expression", expected)),
        }
    }

    fn parse_or(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_unary()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            let right = self.parse_unary()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, String> {
        if self.peek() == Some(&Token::Not) {
            self.pos += 1;
            return Ok(Expr::Not(Box::new(self.parse_unary()?)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr, String> {
        let left = self.parse_primary()?;
        match self.peek() {
            Some(Token::Eq) => {
                self.pos += 1;
                let right = self.parse_primary()?;
                Ok(Expr::Eq(Box::new(left), Box::new(right)))
            }
            Some(Token::Ne) => {
                self.pos += 1;
                let right = self.parse_primary()?;
                Ok(Expr::Ne(Box::new(left), Box::new(right)))
            }
            _ => Ok(left),
        }
    }

    fn parse_primary(&mut self) -> Result<Expr, String> {
        match self.next() {
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Some(Token::Str(s)) => Ok(Expr::Literal(s)),
            Some(Token::Var(name)) => Ok(Expr::Var(name)),
            Some(Token::Ident(ident)) => {
                if self.peek() == Some(&Token::LParen) {
                    let func = match ident.as_str() {
                        "startsWith" => Function::StartsWith,
                        "endsWith" => Function::EndsWith,
                        "contains" => Function::Contains,
                        other => return Err(format!("unknown function '{}'", other)),
                    };
                    self.pos += 1;
                    let a = self.parse_or()?;
                    self.expect(Token::Comma)?;
                    let b = self.parse_or()?;
                    self.expect(Token::RParen)?;
                    return Ok(Expr::Call(func, Box::new(a), Box::new(b)));
                }
                match ident.as_str() {
                    "true" => Ok(Expr::Bool(true)),
                    "false" => Ok(Expr::Bool(false)),
                    _ => Ok(Expr::Var(ident)),
                }
            }
            Some(token) => Err(format!("unexpected token {:?}", token)),
            None => Err("unexpected end of expression".to_string()),
        }
    }
}
