//! The transform algebra: pure functions from one value to another,
//! described by a [`Transform`] record.
//!
//! Every transform is total when a `fallback` is supplied: coercion
//! failures, divide-by-zero, and empty aggregates all land on the
//! fallback instead of producing an absent value.

use cf_domain::{Error, Result, Transform, TransformOp};
use chrono::{Datelike, NaiveDate, TimeZone, Utc};
use serde_json::Value;

use cf_script::{number_value, render, to_display, to_number, FunctionRegistry, Scope};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Entry point
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Apply a transform to `input` (`None` = the source path was absent).
///
/// Operand strings containing `{{…}}` are rendered in `scope` before the
/// transform runs, so catalogs can write `{"type":"divide","divisor":
/// "{{limit}}"}`.
pub fn apply_transform(
    transform: &Transform,
    input: Option<&Value>,
    scope: &Scope<'_>,
    funcs: &FunctionRegistry,
) -> Result<Value> {
    let missing = transform.missing_operands();
    if !missing.is_empty() {
        return Err(Error::TransformInvalid(format!(
            "{:?} is missing {}",
            transform.op,
            missing.join(", ")
        )));
    }

    let fallback = || transform.fallback.clone().unwrap_or(Value::Null);
    let input_value = input.cloned().unwrap_or(Value::Null);

    let result = match transform.op {
        TransformOp::ParseInt => match to_number(&input_value) {
            Some(n) if n.is_finite() => Value::from(n.trunc() as i64),
            _ => fallback(),
        },
        TransformOp::ParseFloat => match to_number(&input_value) {
            Some(n) if n.is_finite() => number_value(n),
            _ => fallback(),
        },

        TransformOp::ToLowerCase => Value::String(coerce_string(&input_value).to_lowercase()),
        TransformOp::ToUpperCase => Value::String(coerce_string(&input_value).to_uppercase()),
        TransformOp::Trim => Value::String(coerce_string(&input_value).trim().to_owned()),

        TransformOp::Replace => {
            let pattern = operand_string(transform.pattern.as_deref(), scope, funcs)?;
            let replacement = operand_string(transform.replacement.as_deref(), scope, funcs)?;
            let flags = transform.flags.as_deref().unwrap_or("");
            let pattern = if flags.contains('i') {
                format!("(?i){pattern}")
            } else {
                pattern
            };
            let re = regex::Regex::new(&pattern)
                .map_err(|e| Error::TransformInvalid(format!("replace: bad pattern: {e}")))?;
            let subject = coerce_string(&input_value);
            if flags.contains('g') {
                Value::String(re.replace_all(&subject, replacement.as_str()).into_owned())
            } else {
                Value::String(re.replacen(&subject, 1, replacement.as_str()).into_owned())
            }
        }

        TransformOp::Concat => {
            let prefix = operand_string(transform.prefix.as_deref(), scope, funcs)?;
            let suffix = operand_string(transform.suffix.as_deref(), scope, funcs)?;
            Value::String(format!("{prefix}{}{suffix}", coerce_string(&input_value)))
        }

        TransformOp::Regex => {
            let pattern = operand_string(transform.pattern.as_deref(), scope, funcs)?;
            let re = regex::Regex::new(&pattern)
                .map_err(|e| Error::TransformInvalid(format!("regex: bad pattern: {e}")))?;
            let subject = coerce_string(&input_value);
            // Default to the first capture group when the pattern has one.
            let group = transform
                .group
                .unwrap_or(if re.captures_len() > 1 { 1 } else { 0 });
            match re.captures(&subject).and_then(|caps| {
                caps.get(group).map(|m| Value::String(m.as_str().to_owned()))
            }) {
                Some(found) => found,
                None => fallback(),
            }
        }

        TransformOp::Date => match coerce_date_iso(&input_value) {
            Some(iso) => Value::String(iso),
            None => fallback(),
        },

        TransformOp::Default => {
            if is_emptyish(input, &input_value) {
                fallback()
            } else {
                input_value
            }
        }

        TransformOp::Add | TransformOp::Subtract | TransformOp::Multiply | TransformOp::Divide => {
            let operand = match transform.op {
                TransformOp::Add => &transform.addend,
                TransformOp::Subtract => &transform.subtrahend,
                TransformOp::Multiply => &transform.multiplier,
                _ => &transform.divisor,
            };
            let operand = operand_number(operand.as_ref(), scope, funcs)?;
            match (to_number(&input_value), operand) {
                (Some(a), Some(b)) => match transform.op {
                    TransformOp::Add => number_value(a + b),
                    TransformOp::Subtract => number_value(a - b),
                    TransformOp::Multiply => number_value(a * b),
                    _ if b == 0.0 => fallback(),
                    _ => number_value(a / b),
                },
                _ => fallback(),
            }
        }

        TransformOp::Percentage => {
            let divisor = operand_number(transform.divisor.as_ref(), scope, funcs)?;
            match (to_number(&input_value), divisor) {
                (Some(_), Some(d)) if d == 0.0 => fallback(),
                (Some(v), Some(d)) => number_value(v / d * 100.0),
                _ => fallback(),
            }
        }

        TransformOp::Abs | TransformOp::Round | TransformOp::Floor | TransformOp::Ceil => {
            match to_number(&input_value) {
                Some(n) => number_value(match transform.op {
                    TransformOp::Abs => n.abs(),
                    TransformOp::Round => n.round(),
                    TransformOp::Floor => n.floor(),
                    _ => n.ceil(),
                }),
                None => fallback(),
            }
        }

        TransformOp::CurrentYear => Value::from(Utc::now().year()),

        TransformOp::YearDifference => {
            let year = to_number(&input_value)
                .filter(|n| n.is_finite() && *n > 0.0)
                .map(|n| n as i32)
                .or_else(|| parse_date(&coerce_string(&input_value)).map(|d| d.year()));
            match year {
                Some(y) => Value::from(Utc::now().year() - y),
                None => fallback(),
            }
        }

        TransformOp::Sum
        | TransformOp::Average
        | TransformOp::Count
        | TransformOp::Min
        | TransformOp::Max => aggregate(transform, &input_value, fallback()),
    };

    Ok(apply_precision(result, transform.precision))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Aggregates
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn aggregate(transform: &Transform, input: &Value, fallback: Value) -> Value {
    let Some(items) = input.as_array() else {
        return zero_or(transform.op, fallback);
    };
    if items.is_empty() {
        return zero_or(transform.op, fallback);
    }

    let selected: Vec<Value> = items
        .iter()
        .map(|item| match (&transform.field, item) {
            (Some(field), Value::Object(map)) => map.get(field).cloned().unwrap_or(Value::Null),
            _ => item.clone(),
        })
        .collect();

    if transform.op == TransformOp::Count {
        let present = selected.iter().filter(|v| !v.is_null()).count();
        return Value::from(present);
    }

    // Non-numeric elements are skipped.
    let nums: Vec<f64> = selected.iter().filter_map(to_number).collect();
    if nums.is_empty() {
        return zero_or(transform.op, fallback);
    }

    match transform.op {
        TransformOp::Sum => number_value(nums.iter().sum()),
        TransformOp::Average => number_value(nums.iter().sum::<f64>() / nums.len() as f64),
        TransformOp::Min => number_value(nums.iter().copied().fold(f64::INFINITY, f64::min)),
        TransformOp::Max => number_value(nums.iter().copied().fold(f64::NEG_INFINITY, f64::max)),
        _ => unreachable!(),
    }
}

/// Sum and count default to 0 when no explicit fallback exists.
fn zero_or(op: TransformOp, fallback: Value) -> Value {
    if fallback.is_null() && matches!(op, TransformOp::Sum | TransformOp::Count) {
        Value::from(0)
    } else {
        fallback
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn coerce_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => to_display(other),
    }
}

/// Render an operand that may contain `{{…}}` templates.
fn operand_string(
    operand: Option<&str>,
    scope: &Scope<'_>,
    funcs: &FunctionRegistry,
) -> Result<String> {
    match operand {
        None => Ok(String::new()),
        Some(text) if text.contains("{{") => render(text, scope, funcs),
        Some(text) => Ok(text.to_owned()),
    }
}

fn operand_number(
    operand: Option<&Value>,
    scope: &Scope<'_>,
    funcs: &FunctionRegistry,
) -> Result<Option<f64>> {
    let Some(operand) = operand else {
        return Ok(None);
    };
    if let Value::String(text) = operand {
        if text.contains("{{") {
            let rendered = render(text, scope, funcs)?;
            return Ok(rendered.trim().parse::<f64>().ok());
        }
    }
    Ok(to_number(operand))
}

fn is_emptyish(input: Option<&Value>, value: &Value) -> bool {
    match input {
        None => true,
        Some(_) => match value {
            Value::Null => true,
            Value::String(s) => s.is_empty(),
            Value::Array(items) => items.is_empty(),
            _ => false,
        },
    }
}

fn parse_date(text: &str) -> Option<chrono::NaiveDateTime> {
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(text) {
        return Some(dt.naive_utc());
    }
    if let Ok(d) = NaiveDate::parse_from_str(text, "%Y-%m-%d") {
        return d.and_hms_opt(0, 0, 0);
    }
    if let Ok(d) = NaiveDate::parse_from_str(text, "%m/%d/%Y") {
        return d.and_hms_opt(0, 0, 0);
    }
    None
}

fn coerce_date_iso(value: &Value) -> Option<String> {
    match value {
        // Numbers are epoch milliseconds.
        Value::Number(n) => {
            let ms = n.as_f64()? as i64;
            Utc.timestamp_millis_opt(ms)
                .single()
                .map(|dt| dt.to_rfc3339())
        }
        Value::String(s) => parse_date(s).map(|naive| naive.and_utc().to_rfc3339()),
        _ => None,
    }
}

/// Round a numeric result half-away-from-zero to `precision` digits.
fn apply_precision(value: Value, precision: Option<u32>) -> Value {
    let Some(p) = precision else { return value };
    let Some(n) = value.as_f64() else { return value };
    let factor = 10f64.powi(p as i32);
    // f64::round already rounds half away from zero.
    number_value((n * factor).round() / factor)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn t(spec: Value) -> Transform {
        serde_json::from_value(spec).unwrap()
    }

    fn apply(spec: Value, input: Value) -> Value {
        let funcs = FunctionRegistry::default();
        let scope = Scope::default();
        apply_transform(&t(spec), Some(&input), &scope, &funcs).unwrap()
    }

    #[test]
    fn parse_int_and_fallback() {
        assert_eq!(apply(json!({"type": "parseInt"}), json!("42")), json!(42));
        assert_eq!(apply(json!({"type": "parseInt"}), json!(7.9)), json!(7));
        assert_eq!(
            apply(json!({"type": "parseInt", "fallback": -1}), json!("abc")),
            json!(-1)
        );
    }

    #[test]
    fn string_transforms_coerce() {
        assert_eq!(apply(json!({"type": "toUpperCase"}), json!("ok")), json!("OK"));
        assert_eq!(apply(json!({"type": "trim"}), json!("  x ")), json!("x"));
        assert_eq!(apply(json!({"type": "toLowerCase"}), json!(12)), json!("12"));
    }

    #[test]
    fn replace_regex_semantics() {
        assert_eq!(
            apply(
                json!({"type": "replace", "pattern": "[0-9]+", "replacement": "#"}),
                json!("a1b22c")
            ),
            json!("a#b22c")
        );
        assert_eq!(
            apply(
                json!({"type": "replace", "pattern": "[0-9]+", "replacement": "#", "flags": "g"}),
                json!("a1b22c")
            ),
            json!("a#b#c")
        );
        assert_eq!(
            apply(
                json!({"type": "replace", "pattern": "abc", "replacement": "x", "flags": "i"}),
                json!("ABCd")
            ),
            json!("xd")
        );
    }

    #[test]
    fn replace_requires_operands() {
        let funcs = FunctionRegistry::default();
        let scope = Scope::default();
        let result = apply_transform(
            &t(json!({"type": "replace", "pattern": "a"})),
            Some(&json!("aa")),
            &scope,
            &funcs,
        );
        assert!(matches!(result, Err(Error::TransformInvalid(_))));
    }

    #[test]
    fn concat_prefix_suffix() {
        assert_eq!(
            apply(
                json!({"type": "concat", "prefix": "$", "suffix": " USD"}),
                json!(100)
            ),
            json!("$100 USD")
        );
    }

    #[test]
    fn regex_extracts_group() {
        assert_eq!(
            apply(
                json!({"type": "regex", "pattern": "order-([0-9]+)"}),
                json!("ref order-991 end")
            ),
            json!("991")
        );
        assert_eq!(
            apply(
                json!({"type": "regex", "pattern": "x([0-9])", "fallback": "none"}),
                json!("no digits")
            ),
            json!("none")
        );
    }

    #[test]
    fn date_coercion() {
        assert_eq!(
            apply(json!({"type": "date"}), json!("2024-03-01")),
            json!("2024-03-01T00:00:00+00:00")
        );
        assert_eq!(
            apply(json!({"type": "date", "fallback": "invalid"}), json!("nope")),
            json!("invalid")
        );
        let from_epoch = apply(json!({"type": "date"}), json!(0));
        assert_eq!(from_epoch, json!("1970-01-01T00:00:00+00:00"));
    }

    #[test]
    fn default_fills_empty() {
        let spec = json!({"type": "default", "fallback": "n/a"});
        assert_eq!(apply(spec.clone(), json!(null)), json!("n/a"));
        assert_eq!(apply(spec.clone(), json!("")), json!("n/a"));
        assert_eq!(apply(spec.clone(), json!("x")), json!("x"));
        assert_eq!(apply(spec, json!(0)), json!(0));
    }

    #[test]
    fn arithmetic_with_fallback_on_zero_divisor() {
        assert_eq!(
            apply(json!({"type": "add", "addend": 5}), json!(37)),
            json!(42)
        );
        assert_eq!(
            apply(json!({"type": "divide", "divisor": 4}), json!(10)),
            json!(2.5)
        );
        assert_eq!(
            apply(json!({"type": "divide", "divisor": 0, "fallback": null}), json!(10)),
            json!(null)
        );
    }

    #[test]
    fn percentage_with_precision() {
        // Seed scenario: 11.7M / 20M * 100, 1 decimal digit.
        assert_eq!(
            apply(
                json!({"type": "percentage", "divisor": 20000000, "precision": 1}),
                json!(11700000)
            ),
            json!(58.5)
        );
    }

    #[test]
    fn precision_rounds_half_away_from_zero() {
        assert_eq!(
            apply(json!({"type": "multiply", "multiplier": 1, "precision": 2}), json!(2.005)),
            json!(2.01)
        );
        assert_eq!(
            apply(json!({"type": "multiply", "multiplier": 1, "precision": 2}), json!(-2.005)),
            json!(-2.01)
        );
    }

    #[test]
    fn aggregates_over_object_arrays() {
        // Seed scenario: department budgets.
        let input = json!([{"budget": 8500000}, {"budget": 3200000}]);
        assert_eq!(
            apply(json!({"type": "sum", "field": "budget"}), input.clone()),
            json!(11700000)
        );
        assert_eq!(
            apply(json!({"type": "average", "field": "budget"}), input.clone()),
            json!(5850000)
        );
        assert_eq!(
            apply(json!({"type": "min", "field": "budget"}), input.clone()),
            json!(3200000)
        );
        assert_eq!(
            apply(json!({"type": "max", "field": "budget"}), input.clone()),
            json!(8500000)
        );
        assert_eq!(apply(json!({"type": "count"}), input), json!(2));
    }

    #[test]
    fn aggregates_skip_non_numeric() {
        let input = json!([1, "x", 2, null]);
        assert_eq!(apply(json!({"type": "sum"}), input), json!(3));
    }

    #[test]
    fn empty_aggregates_fall_back() {
        assert_eq!(apply(json!({"type": "sum"}), json!([])), json!(0));
        assert_eq!(apply(json!({"type": "count"}), json!([])), json!(0));
        assert_eq!(
            apply(json!({"type": "average", "fallback": null}), json!([])),
            json!(null)
        );
        assert_eq!(
            apply(json!({"type": "sum", "fallback": -1}), json!([])),
            json!(-1)
        );
    }

    #[test]
    fn operands_may_be_templates() {
        let vars = json!({"limit": 200}).as_object().cloned().unwrap();
        let funcs = FunctionRegistry::default();
        let scope = Scope::new(Some(&vars), None);
        let result = apply_transform(
            &t(json!({"type": "divide", "divisor": "{{limit}}"})),
            Some(&json!(100)),
            &scope,
            &funcs,
        )
        .unwrap();
        assert_eq!(result, json!(0.5));
    }

    #[test]
    fn fallback_makes_transforms_total() {
        // With a fallback supplied, no input produces an absent result.
        let inputs = [json!(null), json!("zz"), json!([]), json!({})];
        for spec in [
            json!({"type": "parseInt", "fallback": 0}),
            json!({"type": "parseFloat", "fallback": 0}),
            json!({"type": "date", "fallback": "-"}),
            json!({"type": "divide", "divisor": 0, "fallback": 0}),
            json!({"type": "average", "fallback": 0}),
            json!({"type": "yearDifference", "fallback": 0}),
        ] {
            for input in &inputs {
                let funcs = FunctionRegistry::default();
                let scope = Scope::default();
                let out =
                    apply_transform(&t(spec.clone()), Some(input), &scope, &funcs).unwrap();
                assert!(
                    !out.is_null() || t(spec.clone()).fallback == Some(Value::Null),
                    "transform {spec} returned null for {input}"
                );
            }
        }
    }

    #[test]
    fn current_year_and_difference() {
        let year = Utc::now().year();
        assert_eq!(apply(json!({"type": "currentYear"}), json!(null)), json!(year));
        assert_eq!(
            apply(json!({"type": "yearDifference"}), json!(2000)),
            json!(year - 2000)
        );
    }
}
