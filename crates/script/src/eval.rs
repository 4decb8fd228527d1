//! Evaluator for compiled expressions.
//!
//! Semantics follow the scripting conventions flow authors expect:
//! truthiness, loose vs strict equality, `+` concatenating when either
//! side is a string, and `&&`/`||` returning operand values. Values are
//! `serde_json::Value`; a missing variable evaluates as `null`.
//!
//! Numeric results that land on an integer are stored as JSON integers so
//! they interpolate without a trailing `.0`. A `NaN` result surfaces as
//! `null` (JSON has no NaN).

use std::collections::HashMap;
use std::sync::Arc;

use cf_domain::{Error, Result};
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde_json::Value;

use crate::parser::{BinaryOp, CallTarget, Expr, UnaryOp};
use crate::path::Scope;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Function registry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub type NativeFn = Arc<dyn Fn(&[Value]) -> Result<Value> + Send + Sync>;

/// Host-approved functions callable from expressions (and from function
/// tools). Registered once at engine construction, immutable afterwards.
#[derive(Clone, Default)]
pub struct FunctionRegistry {
    functions: HashMap<String, NativeFn>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        name: impl Into<String>,
        f: impl Fn(&[Value]) -> Result<Value> + Send + Sync + 'static,
    ) {
        self.functions.insert(name.into(), Arc::new(f));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&NativeFn> {
        self.functions.get(name)
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

impl std::fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionRegistry")
            .field("functions", &self.functions.keys().collect::<Vec<_>>())
            .finish()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Value helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Truthiness: `null`, `false`, `0`, and `""` are falsy; everything else
/// (including empty arrays and objects) is truthy.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Interpolation text: `null` renders empty, scalars render plainly,
/// arrays and objects render as compact JSON.
pub fn to_display(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.clone(),
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

/// `String()`-style coercion, where `null` spells itself out.
fn js_string(value: &Value) -> String {
    match value {
        Value::Null => "null".to_owned(),
        other => to_display(other),
    }
}

/// Numeric coercion. `None` means the value has no numeric meaning.
pub fn to_number(value: &Value) -> Option<f64> {
    match value {
        Value::Null => Some(0.0),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        Value::Number(n) => n.as_f64(),
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                Some(0.0)
            } else {
                trimmed.parse::<f64>().ok()
            }
        }
        _ => None,
    }
}

/// Wrap an f64, preferring the integer representation when exact.
pub fn number_value(f: f64) -> Value {
    if f.is_nan() || f.is_infinite() {
        return Value::Null;
    }
    if f.fract() == 0.0 && f.abs() < 9_007_199_254_740_992.0 {
        Value::from(f as i64)
    } else {
        serde_json::Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null)
    }
}

fn eq_strict(a: &Value, b: &Value) -> bool {
    match (a, b) {
        // Normalize 1 vs 1.0 before comparing.
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(a, b)| eq_strict(a, b))
        }
        _ => a == b,
    }
}

fn eq_loose(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Null, Value::Null) => true,
        (Value::Null, _) | (_, Value::Null) => false,
        (Value::Number(_), Value::String(_))
        | (Value::String(_), Value::Number(_))
        | (Value::Bool(_), _)
        | (_, Value::Bool(_)) => match (to_number(a), to_number(b)) {
            (Some(x), Some(y)) => x == y,
            _ => false,
        },
        _ => eq_strict(a, b),
    }
}

fn runtime(message: impl Into<String>) -> Error {
    Error::ExpressionRuntime(message.into())
}

fn require_number(value: &Value, context: &str) -> Result<f64> {
    to_number(value).ok_or_else(|| runtime(format!("{context}: not a number")))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Evaluation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub fn evaluate(expr: &Expr, scope: &Scope<'_>, funcs: &FunctionRegistry) -> Result<Value> {
    match expr {
        Expr::Null => Ok(Value::Null),
        Expr::Bool(b) => Ok(Value::Bool(*b)),
        Expr::Num(n) => Ok(number_value(*n)),
        Expr::Str(s) => Ok(Value::String(s.clone())),

        Expr::Ident(name) => Ok(scope
            .lookup(&[crate::path::Segment::Key(name.clone())])
            .unwrap_or(Value::Null)),

        Expr::Member { object, property } => {
            let value = evaluate(object, scope, funcs)?;
            Ok(member(&value, property))
        }

        Expr::Index { object, index } => {
            let value = evaluate(object, scope, funcs)?;
            let idx = evaluate(index, scope, funcs)?;
            let i = match to_number(&idx) {
                Some(f) if f >= 0.0 && f.fract() == 0.0 => f as usize,
                _ => return Ok(Value::Null),
            };
            Ok(match &value {
                Value::Array(items) => items.get(i).cloned().unwrap_or(Value::Null),
                Value::String(s) => s
                    .chars()
                    .nth(i)
                    .map(|c| Value::String(c.to_string()))
                    .unwrap_or(Value::Null),
                _ => Value::Null,
            })
        }

        Expr::Unary { op, operand } => {
            let value = evaluate(operand, scope, funcs)?;
            match op {
                UnaryOp::Not => Ok(Value::Bool(!truthy(&value))),
                UnaryOp::Neg => {
                    let n = require_number(&value, "unary '-'")?;
                    Ok(number_value(-n))
                }
            }
        }

        Expr::Binary { op, left, right } => eval_binary(*op, left, right, scope, funcs),

        Expr::Ternary {
            cond,
            then_branch,
            else_branch,
        } => {
            let c = evaluate(cond, scope, funcs)?;
            if truthy(&c) {
                evaluate(then_branch, scope, funcs)
            } else {
                evaluate(else_branch, scope, funcs)
            }
        }

        Expr::Call { target, args } => {
            let mut evaluated = Vec::with_capacity(args.len());
            for arg in args {
                evaluated.push(evaluate(arg, scope, funcs)?);
            }
            match target {
                CallTarget::Free(name) => call_free(name, &evaluated, funcs),
                CallTarget::Math(name) => call_math(name, &evaluated),
                CallTarget::Method { receiver, name } => {
                    let value = evaluate(receiver, scope, funcs)?;
                    call_method(&value, name, &evaluated)
                }
            }
        }
    }
}

fn member(value: &Value, property: &str) -> Value {
    match (value, property) {
        (Value::String(s), "length") => Value::from(s.chars().count()),
        (Value::Array(items), "length") => Value::from(items.len()),
        (Value::Object(map), _) => map.get(property).cloned().unwrap_or(Value::Null),
        _ => Value::Null,
    }
}

fn eval_binary(
    op: BinaryOp,
    left: &Expr,
    right: &Expr,
    scope: &Scope<'_>,
    funcs: &FunctionRegistry,
) -> Result<Value> {
    // Short-circuit forms first; they return operand values, not booleans.
    if op == BinaryOp::And {
        let l = evaluate(left, scope, funcs)?;
        return if truthy(&l) {
            evaluate(right, scope, funcs)
        } else {
            Ok(l)
        };
    }
    if op == BinaryOp::Or {
        let l = evaluate(left, scope, funcs)?;
        return if truthy(&l) {
            Ok(l)
        } else {
            evaluate(right, scope, funcs)
        };
    }

    let l = evaluate(left, scope, funcs)?;
    let r = evaluate(right, scope, funcs)?;

    match op {
        BinaryOp::Add => {
            if l.is_string() || r.is_string() {
                Ok(Value::String(format!("{}{}", js_string(&l), js_string(&r))))
            } else {
                let a = require_number(&l, "'+'")?;
                let b = require_number(&r, "'+'")?;
                Ok(number_value(a + b))
            }
        }
        BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Rem => {
            let a = require_number(&l, "arithmetic")?;
            let b = require_number(&r, "arithmetic")?;
            let result = match op {
                BinaryOp::Sub => a - b,
                BinaryOp::Mul => a * b,
                BinaryOp::Div => {
                    if b == 0.0 {
                        return Err(runtime("division by zero"));
                    }
                    a / b
                }
                BinaryOp::Rem => {
                    if b == 0.0 {
                        return Err(runtime("remainder by zero"));
                    }
                    a % b
                }
                _ => unreachable!(),
            };
            Ok(number_value(result))
        }
        BinaryOp::EqLoose => Ok(Value::Bool(eq_loose(&l, &r))),
        BinaryOp::NeLoose => Ok(Value::Bool(!eq_loose(&l, &r))),
        BinaryOp::EqStrict => Ok(Value::Bool(eq_strict(&l, &r))),
        BinaryOp::NeStrict => Ok(Value::Bool(!eq_strict(&l, &r))),
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            let ordering = match (&l, &r) {
                (Value::String(a), Value::String(b)) => a.partial_cmp(b),
                _ => match (to_number(&l), to_number(&r)) {
                    (Some(a), Some(b)) => a.partial_cmp(&b),
                    _ => None,
                },
            };
            let result = match ordering {
                None => false,
                Some(ord) => match op {
                    BinaryOp::Lt => ord.is_lt(),
                    BinaryOp::Le => ord.is_le(),
                    BinaryOp::Gt => ord.is_gt(),
                    BinaryOp::Ge => ord.is_ge(),
                    _ => unreachable!(),
                },
            };
            Ok(Value::Bool(result))
        }
        BinaryOp::And | BinaryOp::Or => unreachable!("handled above"),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Free functions
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// `encodeURIComponent` keeps `A-Za-z0-9 - _ . ! ~ * ' ( )`.
const URI_COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

/// `encodeURI` additionally keeps the URI reserved set.
const URI_FULL: &AsciiSet = &URI_COMPONENT
    .remove(b'#')
    .remove(b'$')
    .remove(b'&')
    .remove(b'+')
    .remove(b',')
    .remove(b'/')
    .remove(b':')
    .remove(b';')
    .remove(b'=')
    .remove(b'?')
    .remove(b'@');

fn call_free(name: &str, args: &[Value], funcs: &FunctionRegistry) -> Result<Value> {
    if let Some(f) = funcs.get(name) {
        return f(args);
    }

    let first = args.first().unwrap_or(&Value::Null);
    match name {
        "parseInt" => {
            let radix = args
                .get(1)
                .and_then(to_number)
                .map(|r| r as u32)
                .filter(|r| (2..=36).contains(r))
                .unwrap_or(10);
            Ok(parse_int(&js_string(first), radix))
        }
        "parseFloat" => Ok(parse_float(&js_string(first))),
        "isNaN" => Ok(Value::Bool(match first {
            // NaN results surface as null in this engine.
            Value::Null => true,
            other => to_number(other).is_none(),
        })),
        "isFinite" => Ok(Value::Bool(
            to_number(first).is_some_and(|n| n.is_finite()),
        )),
        "String" => Ok(Value::String(js_string(first))),
        "Number" => Ok(to_number(first).map(number_value).unwrap_or(Value::Null)),
        "Boolean" => Ok(Value::Bool(truthy(first))),
        "encodeURIComponent" => Ok(Value::String(
            utf8_percent_encode(&js_string(first), URI_COMPONENT).to_string(),
        )),
        "encodeURI" => Ok(Value::String(
            utf8_percent_encode(&js_string(first), URI_FULL).to_string(),
        )),
        "decodeURIComponent" | "decodeURI" => percent_decode_str(&js_string(first))
            .decode_utf8()
            .map(|s| Value::String(s.into_owned()))
            .map_err(|e| runtime(format!("{name}: {e}"))),
        other => Err(runtime(format!("unknown function '{other}'"))),
    }
}

fn parse_int(text: &str, radix: u32) -> Value {
    let trimmed = text.trim();
    let (sign, rest) = match trimmed.strip_prefix('-') {
        Some(rest) => (-1.0, rest),
        None => (1.0, trimmed.strip_prefix('+').unwrap_or(trimmed)),
    };
    let rest = if radix == 16 {
        rest.strip_prefix("0x").or_else(|| rest.strip_prefix("0X")).unwrap_or(rest)
    } else {
        rest
    };
    let digits: String = rest.chars().take_while(|c| c.is_digit(radix)).collect();
    if digits.is_empty() {
        return Value::Null;
    }
    match i64::from_str_radix(&digits, radix) {
        Ok(n) => number_value(sign * n as f64),
        Err(_) => Value::Null,
    }
}

fn parse_float(text: &str) -> Value {
    let trimmed = text.trim();
    let mut end = 0;
    let bytes = trimmed.as_bytes();
    let mut seen_dot = false;
    let mut seen_exp = false;
    while end < bytes.len() {
        let c = bytes[end] as char;
        let ok = c.is_ascii_digit()
            || (end == 0 && (c == '+' || c == '-'))
            || (c == '.' && !seen_dot && !seen_exp)
            || ((c == 'e' || c == 'E') && !seen_exp && end > 0)
            || ((c == '+' || c == '-') && end > 0 && matches!(bytes[end - 1], b'e' | b'E'));
        if !ok {
            break;
        }
        if c == '.' {
            seen_dot = true;
        }
        if c == 'e' || c == 'E' {
            seen_exp = true;
        }
        end += 1;
    }
    trimmed[..end]
        .parse::<f64>()
        .map(number_value)
        .unwrap_or(Value::Null)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Math namespace
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn call_math(name: &str, args: &[Value]) -> Result<Value> {
    let one = |i: usize| -> Result<f64> {
        require_number(args.get(i).unwrap_or(&Value::Null), &format!("Math.{name}"))
    };
    let result = match name {
        "abs" => one(0)?.abs(),
        "ceil" => one(0)?.ceil(),
        "floor" => one(0)?.floor(),
        "round" => {
            // Half-away-from-zero.
            let n = one(0)?;
            if n < 0.0 { -(-n).round() } else { n.round() }
        }
        "sqrt" => {
            let n = one(0)?;
            if n < 0.0 {
                return Ok(Value::Null);
            }
            n.sqrt()
        }
        "pow" => one(0)?.powf(one(1)?),
        "max" | "min" => {
            if args.is_empty() {
                return Ok(Value::Null);
            }
            let mut acc = one(0)?;
            for i in 1..args.len() {
                let n = one(i)?;
                acc = if name == "max" { acc.max(n) } else { acc.min(n) };
            }
            acc
        }
        "random" => rand::random::<f64>(),
        other => return Err(runtime(format!("unknown Math function '{other}'"))),
    };
    Ok(number_value(result))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Methods
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn call_method(receiver: &Value, name: &str, args: &[Value]) -> Result<Value> {
    match receiver {
        Value::String(s) => string_method(s, name, args),
        Value::Array(items) => array_method(items, name, args),
        Value::Number(_) | Value::Bool(_) => match name {
            "toString" => Ok(Value::String(js_string(receiver))),
            "valueOf" => Ok(receiver.clone()),
            other => Err(runtime(format!("method '{other}' not supported here"))),
        },
        Value::Null => Err(runtime(format!("cannot call '{name}' on null"))),
        _ => Err(runtime(format!(
            "method '{name}' not supported on this value"
        ))),
    }
}

fn arg_str(args: &[Value], i: usize) -> String {
    args.get(i).map(js_string).unwrap_or_default()
}

fn arg_usize(args: &[Value], i: usize) -> Option<usize> {
    args.get(i)
        .and_then(to_number)
        .filter(|n| *n >= 0.0)
        .map(|n| n as usize)
}

fn arg_isize(args: &[Value], i: usize) -> Option<isize> {
    args.get(i).and_then(to_number).map(|n| n as isize)
}

/// Clamp a possibly-negative index into `[0, len]`, counting from the end
/// when negative.
fn rel_index(i: isize, len: usize) -> usize {
    if i < 0 {
        len.saturating_sub(i.unsigned_abs())
    } else {
        (i as usize).min(len)
    }
}

fn char_index_of(haystack: &[char], needle: &[char], from: usize) -> Option<usize> {
    if needle.is_empty() {
        return Some(from.min(haystack.len()));
    }
    if needle.len() > haystack.len() {
        return None;
    }
    (from..=haystack.len() - needle.len()).find(|&i| haystack[i..i + needle.len()] == *needle)
}

fn string_method(s: &str, name: &str, args: &[Value]) -> Result<Value> {
    let chars: Vec<char> = s.chars().collect();
    let len = chars.len();

    let result = match name {
        "toLowerCase" => Value::String(s.to_lowercase()),
        "toUpperCase" => Value::String(s.to_uppercase()),
        "trim" => Value::String(s.trim().to_owned()),
        "length" => Value::from(len),
        "padStart" | "padEnd" => {
            let target = arg_usize(args, 0).unwrap_or(0);
            let pad = args
                .get(1)
                .map(js_string)
                .filter(|p| !p.is_empty())
                .unwrap_or_else(|| " ".to_owned());
            if target <= len {
                Value::String(s.to_owned())
            } else {
                let fill: String = pad.chars().cycle().take(target - len).collect();
                if name == "padStart" {
                    Value::String(format!("{fill}{s}"))
                } else {
                    Value::String(format!("{s}{fill}"))
                }
            }
        }
        "charAt" => {
            let i = arg_usize(args, 0).unwrap_or(0);
            Value::String(chars.get(i).map(|c| c.to_string()).unwrap_or_default())
        }
        "charCodeAt" => {
            let i = arg_usize(args, 0).unwrap_or(0);
            chars
                .get(i)
                .map(|c| Value::from(*c as u32))
                .unwrap_or(Value::Null)
        }
        "indexOf" => {
            let needle: Vec<char> = arg_str(args, 0).chars().collect();
            let from = arg_usize(args, 1).unwrap_or(0);
            char_index_of(&chars, &needle, from)
                .map(|i| Value::from(i as i64))
                .unwrap_or(Value::from(-1))
        }
        "lastIndexOf" => {
            let needle: Vec<char> = arg_str(args, 0).chars().collect();
            let mut found: i64 = -1;
            let mut from = 0;
            while let Some(i) = char_index_of(&chars, &needle, from) {
                found = i as i64;
                from = i + 1;
                if needle.is_empty() {
                    break;
                }
            }
            Value::from(found)
        }
        "substring" => {
            let a = arg_usize(args, 0).unwrap_or(0).min(len);
            let b = arg_usize(args, 1).unwrap_or(len).min(len);
            let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
            Value::String(chars[lo..hi].iter().collect())
        }
        "substr" => {
            let start = rel_index(arg_isize(args, 0).unwrap_or(0), len);
            let count = arg_usize(args, 1).unwrap_or(len - start).min(len - start);
            Value::String(chars[start..start + count].iter().collect())
        }
        "slice" => {
            let a = rel_index(arg_isize(args, 0).unwrap_or(0), len);
            let b = rel_index(arg_isize(args, 1).unwrap_or(len as isize), len);
            if a < b {
                Value::String(chars[a..b].iter().collect())
            } else {
                Value::String(String::new())
            }
        }
        "split" => match args.first() {
            None | Some(Value::Null) => Value::Array(vec![Value::String(s.to_owned())]),
            Some(sep) => {
                let sep = js_string(sep);
                if sep.is_empty() {
                    Value::Array(chars.iter().map(|c| Value::String(c.to_string())).collect())
                } else {
                    Value::Array(
                        s.split(sep.as_str())
                            .map(|part| Value::String(part.to_owned()))
                            .collect(),
                    )
                }
            }
        },
        "includes" => {
            let needle: Vec<char> = arg_str(args, 0).chars().collect();
            Value::Bool(char_index_of(&chars, &needle, 0).is_some())
        }
        "startsWith" => {
            let needle = arg_str(args, 0);
            let from = arg_usize(args, 1).unwrap_or(0).min(len);
            let tail: String = chars[from..].iter().collect();
            Value::Bool(tail.starts_with(&needle))
        }
        "endsWith" => {
            let needle = arg_str(args, 0);
            let end = arg_usize(args, 1).unwrap_or(len).min(len);
            let head: String = chars[..end].iter().collect();
            Value::Bool(head.ends_with(&needle))
        }
        "match" => {
            let pattern = arg_str(args, 0);
            let re = regex::Regex::new(&pattern)
                .map_err(|e| runtime(format!("match: bad pattern: {e}")))?;
            match re.captures(s) {
                None => Value::Null,
                Some(caps) => Value::Array(
                    caps.iter()
                        .map(|m| {
                            m.map(|m| Value::String(m.as_str().to_owned()))
                                .unwrap_or(Value::Null)
                        })
                        .collect(),
                ),
            }
        }
        "search" => {
            let pattern = arg_str(args, 0);
            let re = regex::Regex::new(&pattern)
                .map_err(|e| runtime(format!("search: bad pattern: {e}")))?;
            match re.find(s) {
                None => Value::from(-1),
                Some(m) => Value::from(s[..m.start()].chars().count()),
            }
        }
        "replace" => {
            // String pattern: literal, first occurrence only.
            let pattern = arg_str(args, 0);
            let replacement = arg_str(args, 1);
            Value::String(s.replacen(&pattern, &replacement, 1))
        }
        "repeat" => {
            let n = arg_isize(args, 0).unwrap_or(0);
            if n < 0 {
                return Err(runtime("repeat: negative count"));
            }
            Value::String(s.repeat(n as usize))
        }
        "concat" => {
            let mut out = s.to_owned();
            for arg in args {
                out.push_str(&js_string(arg));
            }
            Value::String(out)
        }
        "toString" | "valueOf" | "normalize" => Value::String(s.to_owned()),
        "localeCompare" => {
            let other = arg_str(args, 0);
            Value::from(match s.cmp(other.as_str()) {
                std::cmp::Ordering::Less => -1,
                std::cmp::Ordering::Equal => 0,
                std::cmp::Ordering::Greater => 1,
            })
        }
        other => return Err(runtime(format!("unknown string method '{other}'"))),
    };
    Ok(result)
}

fn array_method(items: &[Value], name: &str, args: &[Value]) -> Result<Value> {
    let len = items.len();
    let result = match name {
        "length" => Value::from(len),
        "includes" => {
            let needle = args.first().unwrap_or(&Value::Null);
            Value::Bool(items.iter().any(|item| eq_strict(item, needle)))
        }
        "indexOf" => {
            let needle = args.first().unwrap_or(&Value::Null);
            items
                .iter()
                .position(|item| eq_strict(item, needle))
                .map(|i| Value::from(i as i64))
                .unwrap_or(Value::from(-1))
        }
        "lastIndexOf" => {
            let needle = args.first().unwrap_or(&Value::Null);
            items
                .iter()
                .rposition(|item| eq_strict(item, needle))
                .map(|i| Value::from(i as i64))
                .unwrap_or(Value::from(-1))
        }
        "slice" => {
            let a = rel_index(arg_isize(args, 0).unwrap_or(0), len);
            let b = rel_index(arg_isize(args, 1).unwrap_or(len as isize), len);
            if a < b {
                Value::Array(items[a..b].to_vec())
            } else {
                Value::Array(Vec::new())
            }
        }
        "join" => {
            let sep = args.first().map(js_string).unwrap_or_else(|| ",".to_owned());
            Value::String(
                items
                    .iter()
                    .map(to_display)
                    .collect::<Vec<_>>()
                    .join(&sep),
            )
        }
        "toString" => Value::String(
            items
                .iter()
                .map(to_display)
                .collect::<Vec<_>>()
                .join(","),
        ),
        "valueOf" => Value::Array(items.to_vec()),
        other => return Err(runtime(format!("unknown array method '{other}'"))),
    };
    Ok(result)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::compile;
    use serde_json::{json, Map};

    fn eval_with(source: &str, vars: Value) -> Result<Value> {
        let vars: Map<String, Value> = vars.as_object().cloned().unwrap_or_default();
        let funcs = FunctionRegistry::default();
        let expr = compile(source, &funcs)?;
        let scope = Scope::new(Some(&vars), None);
        evaluate(&expr, &scope, &funcs)
    }

    fn eval(source: &str) -> Result<Value> {
        eval_with(source, json!({}))
    }

    #[test]
    fn arithmetic_and_precedence() {
        assert_eq!(eval("1 + 2 * 3").unwrap(), json!(7));
        assert_eq!(eval("(1 + 2) * 3").unwrap(), json!(9));
        assert_eq!(eval("7 % 4").unwrap(), json!(3));
        assert_eq!(eval("10 / 4").unwrap(), json!(2.5));
    }

    #[test]
    fn division_by_zero_is_runtime_error() {
        match eval("1 / 0") {
            Err(Error::ExpressionRuntime(_)) => {}
            other => panic!("expected runtime error, got {other:?}"),
        }
    }

    #[test]
    fn plus_concatenates_with_strings() {
        assert_eq!(eval("'age: ' + 30").unwrap(), json!("age: 30"));
        assert_eq!(eval("1 + '2'").unwrap(), json!("12"));
    }

    #[test]
    fn loose_and_strict_equality() {
        assert_eq!(eval("1 == '1'").unwrap(), json!(true));
        assert_eq!(eval("1 === '1'").unwrap(), json!(false));
        assert_eq!(eval("1 === 1").unwrap(), json!(true));
        assert_eq!(eval("null == null").unwrap(), json!(true));
        assert_eq!(eval("null == 0").unwrap(), json!(false));
        assert_eq!(eval("2 != '2'").unwrap(), json!(false));
        assert_eq!(eval("2 !== '2'").unwrap(), json!(true));
    }

    #[test]
    fn logical_operators_return_operands() {
        assert_eq!(eval("'a' || 'b'").unwrap(), json!("a"));
        assert_eq!(eval("'' || 'b'").unwrap(), json!("b"));
        assert_eq!(eval("'a' && 'b'").unwrap(), json!("b"));
        assert_eq!(eval("0 && 'b'").unwrap(), json!(0));
    }

    #[test]
    fn ternary_on_truthiness() {
        assert_eq!(
            eval_with("age >= 18 ? 'adult' : 'minor'", json!({"age": 17})).unwrap(),
            json!("minor")
        );
        assert_eq!(
            eval_with("age >= 18 ? 'adult' : 'minor'", json!({"age": 21})).unwrap(),
            json!("adult")
        );
    }

    #[test]
    fn identifiers_resolve_and_missing_is_null() {
        assert_eq!(eval_with("x + 1", json!({"x": 2})).unwrap(), json!(3));
        assert_eq!(eval("missing").unwrap(), Value::Null);
    }

    #[test]
    fn member_and_index_access() {
        let vars = json!({"user": {"name": "Ada"}, "xs": [10, 20]});
        assert_eq!(eval_with("user.name", vars.clone()).unwrap(), json!("Ada"));
        assert_eq!(eval_with("xs[1]", vars.clone()).unwrap(), json!(20));
        assert_eq!(eval_with("xs[9]", vars.clone()).unwrap(), Value::Null);
        assert_eq!(eval_with("user.name.length", vars).unwrap(), json!(3));
    }

    #[test]
    fn string_methods() {
        assert_eq!(eval("'HeLLo'.toLowerCase()").unwrap(), json!("hello"));
        assert_eq!(eval("'  x  '.trim()").unwrap(), json!("x"));
        assert_eq!(eval("'abc'.indexOf('b')").unwrap(), json!(1));
        assert_eq!(eval("'abc'.indexOf('z')").unwrap(), json!(-1));
        assert_eq!(eval("'abcdef'.slice(1, -1)").unwrap(), json!("bcde"));
        assert_eq!(eval("'abcdef'.substring(4, 2)").unwrap(), json!("cd"));
        assert_eq!(eval("'a-b-c'.split('-')").unwrap(), json!(["a", "b", "c"]));
        assert_eq!(eval("'ab'.repeat(3)").unwrap(), json!("ababab"));
        assert_eq!(eval("'5'.padStart(3, '0')").unwrap(), json!("005"));
        assert_eq!(eval("'a b a'.replace('a', 'x')").unwrap(), json!("x b a"));
        assert_eq!(eval("'order 42'.match('[0-9]+')").unwrap(), json!(["42"]));
        assert_eq!(eval("'order 42'.search('4')").unwrap(), json!(6));
        assert_eq!(eval("'abc'.startsWith('ab')").unwrap(), json!(true));
        assert_eq!(eval("'abc'.charCodeAt(0)").unwrap(), json!(97));
    }

    #[test]
    fn array_methods() {
        let vars = json!({"xs": [1, 2, 3, 2]});
        assert_eq!(eval_with("xs.length", vars.clone()).unwrap(), json!(4));
        assert_eq!(eval_with("xs.includes(2)", vars.clone()).unwrap(), json!(true));
        assert_eq!(eval_with("xs.indexOf(2)", vars.clone()).unwrap(), json!(1));
        assert_eq!(eval_with("xs.lastIndexOf(2)", vars.clone()).unwrap(), json!(3));
        assert_eq!(eval_with("xs.join('-')", vars.clone()).unwrap(), json!("1-2-3-2"));
        assert_eq!(eval_with("xs.slice(1, 3)", vars).unwrap(), json!([2, 3]));
    }

    #[test]
    fn math_namespace() {
        assert_eq!(eval("Math.abs(-3)").unwrap(), json!(3));
        assert_eq!(eval("Math.max(1, 9, 4)").unwrap(), json!(9));
        assert_eq!(eval("Math.pow(2, 10)").unwrap(), json!(1024));
        assert_eq!(eval("Math.round(2.5)").unwrap(), json!(3));
        assert_eq!(eval("Math.round(-2.5)").unwrap(), json!(-3));
    }

    #[test]
    fn free_functions() {
        assert_eq!(eval("parseInt('42px')").unwrap(), json!(42));
        assert_eq!(eval("parseInt('ff', 16)").unwrap(), json!(255));
        assert_eq!(eval("parseInt('zzz')").unwrap(), Value::Null);
        assert_eq!(eval("parseFloat('3.5kg')").unwrap(), json!(3.5));
        assert_eq!(eval("Number('12')").unwrap(), json!(12));
        assert_eq!(eval("String(12)").unwrap(), json!("12"));
        assert_eq!(eval("Boolean('')").unwrap(), json!(false));
        assert_eq!(eval("isNaN('abc')").unwrap(), json!(true));
        assert_eq!(eval("isNaN('12')").unwrap(), json!(false));
        assert_eq!(
            eval("encodeURIComponent('a b&c')").unwrap(),
            json!("a%20b%26c")
        );
        assert_eq!(
            eval("decodeURIComponent('a%20b%26c')").unwrap(),
            json!("a b&c")
        );
        assert_eq!(
            eval("encodeURI('http://x/y z')").unwrap(),
            json!("http://x/y%20z")
        );
    }

    #[test]
    fn approved_functions_invoke() {
        let mut funcs = FunctionRegistry::default();
        funcs.register("double", |args| {
            let n = to_number(args.first().unwrap_or(&Value::Null)).unwrap_or(0.0);
            Ok(number_value(n * 2.0))
        });
        let expr = compile("double(21)", &funcs).unwrap();
        let vars = Map::new();
        let scope = Scope::new(Some(&vars), None);
        assert_eq!(evaluate(&expr, &scope, &funcs).unwrap(), json!(42));
    }

    #[test]
    fn unary_operators() {
        assert_eq!(eval("!''").unwrap(), json!(true));
        assert_eq!(eval("!!'x'").unwrap(), json!(true));
        assert_eq!(eval("-(3 + 4)").unwrap(), json!(-7));
    }

    #[test]
    fn integer_results_display_without_fraction() {
        assert_eq!(to_display(&eval("4 / 2").unwrap()), "2");
        assert_eq!(to_display(&eval("5 / 2").unwrap()), "2.5");
    }
}
