//! A tiny restricted expression language with move-only semantics.
//!
//! Supports simple assignments and arithmetic over numbers. `move(x)` reads
//! a binding and marks it moved; any later use of `x` raises `Ownership`.
//! Everything else (calls, attributes, control flow) is a syntax error.

use std::collections::HashMap;

use warden_protocol::error::SandboxErr;

#[derive(Debug, Clone)]
struct Owned {
    value: f64,
    moved: bool,
}

/// Evaluator holding the environment across `exec` calls.
#[derive(Default)]
pub struct RestrictedExec {
    env: HashMap<String, Owned>,
}

impl RestrictedExec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Execute source statements. Returns the value of the last bare
    /// expression, if any.
    pub fn exec(&mut self, src: &str) -> Result<Option<f64>, SandboxErr> {
        let mut last = None;
        for line in src.split(['\n', ';']) {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            last = self.exec_stmt(line)?;
        }
        Ok(last)
    }

    fn exec_stmt(&mut self, stmt: &str) -> Result<Option<f64>, SandboxErr> {
        // An assignment has a single `=` not part of `==` (not supported
        // anyway).
        if let Some((target, expr)) = stmt.split_once('=') {
            let target = target.trim();
            if !is_ident(target) {
                return Err(syntax(format!("invalid assignment target '{target}'")));
            }
            let value = self.eval(expr)?;
            self.env.insert(
                target.to_string(),
                Owned {
                    value,
                    moved: false,
                },
            );
            return Ok(None);
        }
        Ok(Some(self.eval(stmt)?))
    }

    fn eval(&mut self, expr: &str) -> Result<f64, SandboxErr> {
        let tokens = tokenize(expr)?;
        let mut parser = Parser {
            tokens,
            pos: 0,
            env: &mut self.env,
        };
        let value = parser.expr()?;
        if parser.pos != parser.tokens.len() {
            return Err(syntax("trailing input"));
        }
        Ok(value)
    }
}

fn is_ident(text: &str) -> bool {
    !text.is_empty()
        && text.chars().next().is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && text.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn syntax(msg: impl std::fmt::Display) -> SandboxErr {
    SandboxErr::Sandbox(format!("syntax error: {msg}"))
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Num(f64),
    Ident(String),
    Plus,
    Minus,
    Star,
    Slash,
    LParen,
    RParen,
}

fn tokenize(src: &str) -> Result<Vec<Token>, SandboxErr> {
    let mut tokens = Vec::new();
    let mut chars = src.chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' => {
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
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            '0'..='9' | '.' => {
                let mut num = String::new();
                while let Some(&d) = chars.peek() {
                    if d.is_ascii_digit() || d == '.' {
                        num.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let value = num
                    .parse::<f64>()
                    .map_err(|_| syntax(format!("bad number '{num}'")))?;
                tokens.push(Token::Num(value));
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
            other => return Err(syntax(format!("unexpected character '{other}'"))),
        }
    }
    Ok(tokens)
}

struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    env: &'a mut HashMap<String, Owned>,
}

impl Parser<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn expr(&mut self) -> Result<f64, SandboxErr> {
        let mut value = self.term()?;
        while let Some(op) = self.peek().cloned() {
            match op {
                Token::Plus => {
                    self.next();
                    value += self.term()?;
                }
                Token::Minus => {
                    self.next();
                    value -= self.term()?;
                }
                _ => break,
            }
        }
        Ok(value)
    }

    fn term(&mut self) -> Result<f64, SandboxErr> {
        let mut value = self.factor()?;
        while let Some(op) = self.peek().cloned() {
            match op {
                Token::Star => {
                    self.next();
                    value *= self.factor()?;
                }
                Token::Slash => {
                    self.next();
                    value /= self.factor()?;
                }
                _ => break,
            }
        }
        Ok(value)
    }

    fn factor(&mut self) -> Result<f64, SandboxErr> {
        match self.next() {
            Some(Token::Num(value)) => Ok(value),
            Some(Token::Minus) => Ok(-self.factor()?),
            Some(Token::LParen) => {
                let value = self.expr()?;
                match self.next() {
                    Some(Token::RParen) => Ok(value),
                    _ => Err(syntax("expected ')'")),
                }
            }
            Some(Token::Ident(name)) if name == "move" => {
                if self.next() != Some(Token::LParen) {
                    return Err(syntax("move() expects a variable"));
                }
                let Some(Token::Ident(target)) = self.next() else {
                    return Err(syntax("move() expects a variable"));
                };
                if self.next() != Some(Token::RParen) {
                    return Err(syntax("expected ')'"));
                }
                let slot = self
                    .env
                    .get_mut(&target)
                    .ok_or_else(|| syntax(format!("undefined name '{target}'")))?;
                if slot.moved {
                    return Err(SandboxErr::Ownership(format!("'{target}' has been moved")));
                }
                slot.moved = true;
                Ok(slot.value)
            }
            Some(Token::Ident(name)) => {
                let slot = self
                    .env
                    .get(&name)
                    .ok_or_else(|| syntax(format!("undefined name '{name}'")))?;
                if slot.moved {
                    return Err(SandboxErr::Ownership(format!("'{name}' has been moved")));
                }
                Ok(slot.value)
            }
            _ => Err(syntax("unsupported expression")),
        }
    }
}
