//! Parser and static safety analysis for the expression language.
//!
//! Parsing produces an [`Expr`] tree; [`analyze`] then walks it enforcing
//! the call allowlist and the forbidden-identifier rules. Both phases
//! fail with `ExpressionRejected` — nothing is ever evaluated for an
//! expression that does not pass.

use cf_domain::{Error, Result};

use crate::eval::FunctionRegistry;
use crate::lexer::{tokenize, Token};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Allowlists
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub const STRING_METHODS: &[&str] = &[
    "toLowerCase",
    "toUpperCase",
    "trim",
    "padStart",
    "padEnd",
    "charAt",
    "charCodeAt",
    "indexOf",
    "lastIndexOf",
    "substring",
    "substr",
    "slice",
    "split",
    "includes",
    "startsWith",
    "endsWith",
    "match",
    "search",
    "replace",
    "repeat",
    "concat",
    "toString",
    "valueOf",
    "length",
    "localeCompare",
    "normalize",
];

pub const ARRAY_METHODS: &[&str] = &[
    "length",
    "includes",
    "indexOf",
    "lastIndexOf",
    "slice",
    "join",
    "toString",
    "valueOf",
];

pub const MATH_FUNCTIONS: &[&str] = &[
    "abs", "ceil", "floor", "round", "max", "min", "pow", "sqrt", "random",
];

pub const FREE_FUNCTIONS: &[&str] = &[
    "parseInt",
    "parseFloat",
    "isNaN",
    "isFinite",
    "String",
    "Number",
    "Boolean",
    "encodeURIComponent",
    "decodeURIComponent",
    "encodeURI",
    "decodeURI",
];

/// Identifiers that are rejected anywhere they appear — as a variable, a
/// property, or a call target. Referencing any of these is a sandbox
/// escape attempt, not a user error.
pub const FORBIDDEN_IDENTIFIERS: &[&str] =
    &["constructor", "prototype", "__proto__", "eval", "Function"];

fn is_method_allowed(name: &str) -> bool {
    STRING_METHODS.contains(&name) || ARRAY_METHODS.contains(&name)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// AST
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Null,
    Bool(bool),
    Num(f64),
    Str(String),
    Ident(String),
    Member {
        object: Box<Expr>,
        property: String,
    },
    Index {
        object: Box<Expr>,
        index: Box<Expr>,
    },
    Call {
        target: CallTarget,
        args: Vec<Expr>,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Ternary {
        cond: Box<Expr>,
        then_branch: Box<Expr>,
        else_branch: Box<Expr>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum CallTarget {
    /// `parseInt(…)` or a host-approved function.
    Free(String),
    /// `Math.abs(…)`.
    Math(String),
    /// `value.toLowerCase(…)`.
    Method { receiver: Box<Expr>, name: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    EqLoose,
    EqStrict,
    NeLoose,
    NeStrict,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Parser
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

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
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn eat(&mut self, expected: &Token) -> bool {
        if self.peek() == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, expected: &Token) -> Result<()> {
        if self.eat(expected) {
            Ok(())
        } else {
            Err(reject(format!(
                "expected {expected:?}, found {:?}",
                self.peek()
            )))
        }
    }

    // ── precedence levels, lowest first ────────────────────────────

    fn ternary(&mut self) -> Result<Expr> {
        let cond = self.or()?;
        if self.eat(&Token::Question) {
            let then_branch = self.ternary()?;
            self.expect(&Token::Colon)?;
            let else_branch = self.ternary()?;
            return Ok(Expr::Ternary {
                cond: Box::new(cond),
                then_branch: Box::new(then_branch),
                else_branch: Box::new(else_branch),
            });
        }
        Ok(cond)
    }

    fn or(&mut self) -> Result<Expr> {
        let mut left = self.and()?;
        while self.eat(&Token::OrOr) {
            let right = self.and()?;
            left = binary(BinaryOp::Or, left, right);
        }
        Ok(left)
    }

    fn and(&mut self) -> Result<Expr> {
        let mut left = self.equality()?;
        while self.eat(&Token::AndAnd) {
            let right = self.equality()?;
            left = binary(BinaryOp::And, left, right);
        }
        Ok(left)
    }

    fn equality(&mut self) -> Result<Expr> {
        let mut left = self.relational()?;
        loop {
            let op = match self.peek() {
                Some(Token::EqEq) => BinaryOp::EqLoose,
                Some(Token::EqEqEq) => BinaryOp::EqStrict,
                Some(Token::NotEq) => BinaryOp::NeLoose,
                Some(Token::NotEqEq) => BinaryOp::NeStrict,
                _ => break,
            };
            self.pos += 1;
            let right = self.relational()?;
            left = binary(op, left, right);
        }
        Ok(left)
    }

    fn relational(&mut self) -> Result<Expr> {
        let mut left = self.additive()?;
        loop {
            let op = match self.peek() {
                Some(Token::Lt) => BinaryOp::Lt,
                Some(Token::Le) => BinaryOp::Le,
                Some(Token::Gt) => BinaryOp::Gt,
                Some(Token::Ge) => BinaryOp::Ge,
                _ => break,
            };
            self.pos += 1;
            let right = self.additive()?;
            left = binary(op, left, right);
        }
        Ok(left)
    }

    fn additive(&mut self) -> Result<Expr> {
        let mut left = self.multiplicative()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinaryOp::Add,
                Some(Token::Minus) => BinaryOp::Sub,
                _ => break,
            };
            self.pos += 1;
            let right = self.multiplicative()?;
            left = binary(op, left, right);
        }
        Ok(left)
    }

    fn multiplicative(&mut self) -> Result<Expr> {
        let mut left = self.unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinaryOp::Mul,
                Some(Token::Slash) => BinaryOp::Div,
                Some(Token::Percent) => BinaryOp::Rem,
                _ => break,
            };
            self.pos += 1;
            let right = self.unary()?;
            left = binary(op, left, right);
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Expr> {
        if self.eat(&Token::Not) {
            let operand = self.unary()?;
            return Ok(Expr::Unary {
                op: UnaryOp::Not,
                operand: Box::new(operand),
            });
        }
        if self.eat(&Token::Minus) {
            let operand = self.unary()?;
            return Ok(Expr::Unary {
                op: UnaryOp::Neg,
                operand: Box::new(operand),
            });
        }
        self.postfix()
    }

    /// Member access, numeric indexing, and calls.
    fn postfix(&mut self) -> Result<Expr> {
        let mut expr = self.primary()?;
        loop {
            if self.eat(&Token::Dot) {
                let property = match self.next() {
                    Some(Token::Ident(name)) => name,
                    other => return Err(reject(format!("expected property, found {other:?}"))),
                };
                if self.peek() == Some(&Token::LParen) {
                    let args = self.call_args()?;
                    let target = match expr {
                        Expr::Ident(ref name) if name == "Math" => CallTarget::Math(property),
                        receiver => CallTarget::Method {
                            receiver: Box::new(receiver),
                            name: property,
                        },
                    };
                    expr = Expr::Call { target, args };
                } else {
                    expr = Expr::Member {
                        object: Box::new(expr),
                        property,
                    };
                }
            } else if self.eat(&Token::LBracket) {
                let index = self.ternary()?;
                self.expect(&Token::RBracket)?;
                expr = Expr::Index {
                    object: Box::new(expr),
                    index: Box::new(index),
                };
            } else if self.peek() == Some(&Token::LParen) {
                let name = match expr {
                    Expr::Ident(name) => name,
                    other => {
                        return Err(reject(format!("cannot call {other:?}")));
                    }
                };
                let args = self.call_args()?;
                expr = Expr::Call {
                    target: CallTarget::Free(name),
                    args,
                };
            } else {
                return Ok(expr);
            }
        }
    }

    fn call_args(&mut self) -> Result<Vec<Expr>> {
        self.expect(&Token::LParen)?;
        let mut args = Vec::new();
        if self.eat(&Token::RParen) {
            return Ok(args);
        }
        loop {
            args.push(self.ternary()?);
            if self.eat(&Token::Comma) {
                continue;
            }
            self.expect(&Token::RParen)?;
            return Ok(args);
        }
    }

    fn primary(&mut self) -> Result<Expr> {
        match self.next() {
            Some(Token::Num(n)) => Ok(Expr::Num(n)),
            Some(Token::Str(s)) => Ok(Expr::Str(s)),
            Some(Token::True) => Ok(Expr::Bool(true)),
            Some(Token::False) => Ok(Expr::Bool(false)),
            Some(Token::Null) => Ok(Expr::Null),
            Some(Token::Ident(name)) => Ok(Expr::Ident(name)),
            Some(Token::LParen) => {
                let inner = self.ternary()?;
                self.expect(&Token::RParen)?;
                Ok(inner)
            }
            other => Err(reject(format!("unexpected token {other:?}"))),
        }
    }
}

fn binary(op: BinaryOp, left: Expr, right: Expr) -> Expr {
    Expr::Binary {
        op,
        left: Box::new(left),
        right: Box::new(right),
    }
}

fn reject(message: String) -> Error {
    Error::ExpressionRejected(message)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Static analysis
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Enforce the sandbox rules on a parsed tree. Rejects forbidden
/// identifiers anywhere, non-allowlisted call targets, and string-keyed
/// indexing.
pub fn analyze(expr: &Expr, approved: &FunctionRegistry) -> Result<()> {
    match expr {
        Expr::Null | Expr::Bool(_) | Expr::Num(_) | Expr::Str(_) => Ok(()),
        Expr::Ident(name) => {
            if FORBIDDEN_IDENTIFIERS.contains(&name.as_str()) {
                return Err(reject(format!("forbidden identifier '{name}'")));
            }
            Ok(())
        }
        Expr::Member { object, property } => {
            if FORBIDDEN_IDENTIFIERS.contains(&property.as_str()) {
                return Err(reject(format!("forbidden property '{property}'")));
            }
            analyze(object, approved)
        }
        Expr::Index { object, index } => {
            if matches!(**index, Expr::Str(_)) {
                return Err(reject("string-keyed indexing is not allowed".into()));
            }
            analyze(object, approved)?;
            analyze(index, approved)
        }
        Expr::Call { target, args } => {
            match target {
                CallTarget::Free(name) => {
                    if FORBIDDEN_IDENTIFIERS.contains(&name.as_str()) {
                        return Err(reject(format!("forbidden identifier '{name}'")));
                    }
                    if !FREE_FUNCTIONS.contains(&name.as_str()) && !approved.contains(name) {
                        return Err(reject(format!("'{name}' is not an allowed function")));
                    }
                }
                CallTarget::Math(name) => {
                    if !MATH_FUNCTIONS.contains(&name.as_str()) {
                        return Err(reject(format!("'Math.{name}' is not allowed")));
                    }
                }
                CallTarget::Method { receiver, name } => {
                    if FORBIDDEN_IDENTIFIERS.contains(&name.as_str()) {
                        return Err(reject(format!("forbidden property '{name}'")));
                    }
                    if !is_method_allowed(name) {
                        return Err(reject(format!("method '{name}' is not allowed")));
                    }
                    analyze(receiver, approved)?;
                }
            }
            for arg in args {
                analyze(arg, approved)?;
            }
            Ok(())
        }
        Expr::Unary { operand, .. } => analyze(operand, approved),
        Expr::Binary { left, right, .. } => {
            analyze(left, approved)?;
            analyze(right, approved)
        }
        Expr::Ternary {
            cond,
            then_branch,
            else_branch,
        } => {
            analyze(cond, approved)?;
            analyze(then_branch, approved)?;
            analyze(else_branch, approved)
        }
    }
}

/// Lex, parse, and statically check an expression.
pub fn compile(source: &str, approved: &FunctionRegistry) -> Result<Expr> {
    let tokens = tokenize(source)?;
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.ternary()?;
    if parser.pos != parser.tokens.len() {
        return Err(reject(format!(
            "trailing tokens after expression in '{source}'"
        )));
    }
    analyze(&expr, approved)?;
    Ok(expr)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
