//! Response mapper: reshapes a raw tool response into the value bound to
//! the step's result variable.

use cf_domain::{
    Filter, FilterOperator, JsonPathSpec, MappingValue, ResponseMapping, Result,
};
use serde_json::{Map, Value};

use cf_script::{get_path, parse_path, render, to_number, FunctionRegistry, Scope};

use crate::transform::apply_transform;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Entry point
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Apply a response mapping. `args` is the assembled tool-argument object,
/// reachable from templates and fallbacks as `$args.*`.
pub fn apply_mapping(
    mapping: &ResponseMapping,
    response: &Value,
    args: Option<&Value>,
    funcs: &FunctionRegistry,
) -> Result<Value> {
    let empty = Map::new();
    let root = response.as_object().unwrap_or(&empty);
    let mut scope = Scope::of_value(root);
    if let Some(args) = args {
        scope = scope.with_args(args);
    }

    apply_inner(mapping, response, &scope, funcs)
}

fn apply_inner(
    mapping: &ResponseMapping,
    response: &Value,
    scope: &Scope<'_>,
    funcs: &FunctionRegistry,
) -> Result<Value> {
    match mapping {
        ResponseMapping::JsonPath { mappings } => {
            let mut out = Map::new();
            for (key, spec) in mappings {
                out.insert(key.clone(), json_path_entry(spec, response, scope, funcs)?);
            }
            Ok(Value::Object(out))
        }

        ResponseMapping::Object { mappings } => {
            Ok(Value::Object(remap_object(mappings, response, scope, funcs)?))
        }

        ResponseMapping::Array {
            source,
            limit,
            filter,
            item_mapping,
        } => {
            let items = match resolve(response, source) {
                Some(Value::Array(items)) => items,
                _ => Vec::new(),
            };
            let mut out = Vec::new();
            for item in items {
                if let Some(filter) = filter {
                    if !matches_filter(filter, &item) {
                        continue;
                    }
                }
                out.push(apply_inner(item_mapping, &item, scope, funcs)?);
                if let Some(limit) = limit {
                    if out.len() >= *limit {
                        break;
                    }
                }
            }
            Ok(Value::Array(out))
        }

        ResponseMapping::Template { template } => {
            Ok(Value::String(render(template, scope, funcs)?))
        }

        ResponseMapping::Conditional {
            conditions,
            otherwise,
        } => {
            for arm in conditions {
                if matches_filter(&arm.condition, response) {
                    return apply_inner(&arm.then, response, scope, funcs);
                }
            }
            match otherwise {
                Some(mapping) => apply_inner(mapping, response, scope, funcs),
                None => Ok(Value::Null),
            }
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// jsonPath entries
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn json_path_entry(
    spec: &JsonPathSpec,
    response: &Value,
    scope: &Scope<'_>,
    funcs: &FunctionRegistry,
) -> Result<Value> {
    let found = resolve(response, spec.path());

    let (transform, fallback) = match spec {
        JsonPathSpec::Path(_) => (None, None),
        JsonPathSpec::Full {
            transform,
            fallback,
            ..
        } => (transform.as_ref(), fallback.as_ref()),
    };

    if let Some(transform) = transform {
        return apply_transform(transform, found.as_ref(), scope, funcs);
    }

    match found {
        Some(value) => Ok(value),
        None => match fallback {
            // A string fallback may be a template referencing `$args.*`.
            Some(Value::String(text)) if text.contains("{{") => {
                Ok(Value::String(render(text, scope, funcs)?))
            }
            Some(value) => Ok(value.clone()),
            None => Ok(Value::Null),
        },
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// object remap
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn remap_object(
    mappings: &std::collections::HashMap<String, MappingValue>,
    response: &Value,
    scope: &Scope<'_>,
    funcs: &FunctionRegistry,
) -> Result<Map<String, Value>> {
    let mut out = Map::new();
    for (key, value) in mappings {
        let mapped = match value {
            MappingValue::Text(text) if text.contains("{{") => {
                Value::String(render(text, scope, funcs)?)
            }
            MappingValue::Text(path) => resolve(response, path).unwrap_or(Value::Null),
            MappingValue::Nested(nested) => {
                Value::Object(remap_object(nested, response, scope, funcs)?)
            }
            MappingValue::Literal(value) => value.clone(),
        };
        out.insert(key.clone(), mapped);
    }
    Ok(out)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Filters
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Evaluate a field predicate against a value (an array item or the
/// whole response).
pub fn matches_filter(filter: &Filter, target: &Value) -> bool {
    let found = resolve(target, &filter.field);
    let expected = filter.value.as_ref();

    match filter.operator {
        FilterOperator::Exists => matches!(found, Some(v) if !v.is_null()),
        FilterOperator::Equals => match (found, expected) {
            (Some(a), Some(b)) => values_equal(&a, b),
            (None, Some(Value::Null)) | (None, None) => true,
            _ => false,
        },
        FilterOperator::NotEquals => match (found, expected) {
            (Some(a), Some(b)) => !values_equal(&a, b),
            (None, Some(Value::Null)) | (None, None) => false,
            _ => true,
        },
        FilterOperator::Gt | FilterOperator::Gte | FilterOperator::Lt | FilterOperator::Lte => {
            let (Some(a), Some(b)) = (found.as_ref().and_then(to_number), expected.and_then(to_number))
            else {
                return false;
            };
            match filter.operator {
                FilterOperator::Gt => a > b,
                FilterOperator::Gte => a >= b,
                FilterOperator::Lt => a < b,
                FilterOperator::Lte => a <= b,
                _ => unreachable!(),
            }
        }
        FilterOperator::Contains => match (found, expected) {
            (Some(Value::String(haystack)), Some(Value::String(needle))) => {
                haystack.contains(needle.as_str())
            }
            (Some(Value::Array(items)), Some(needle)) => {
                items.iter().any(|item| values_equal(item, needle))
            }
            _ => false,
        },
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

/// Resolve a dotted path against an arbitrary value tree.
fn resolve(root: &Value, path: &str) -> Option<Value> {
    let segments = parse_path(path).ok()?;
    get_path(root, &segments).cloned()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
