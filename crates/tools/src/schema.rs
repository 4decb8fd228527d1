//! Structural argument checking against the tool's parameter schema.
//!
//! This is the narrow subset the engine enforces itself: required keys,
//! primitive `type` tags, `enum` membership, and `additionalProperties:
//! false`. Full JSON-Schema validation is a host collaborator.

use cf_domain::{Error, Result};
use serde_json::{Map, Value};

/// Check assembled arguments against a JSON-Schema-shaped object schema.
/// Collects every offense before failing.
pub fn validate_arguments(schema: &Value, args: &Map<String, Value>) -> Result<()> {
    let Some(schema) = schema.as_object() else {
        // Absent or non-object schemas accept anything.
        return Ok(());
    };

    let mut offenses = Vec::new();

    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for name in required.iter().filter_map(Value::as_str) {
            if !args.contains_key(name) {
                offenses.push(format!("missing required argument '{name}'"));
            }
        }
    }

    let properties = schema.get("properties").and_then(Value::as_object);
    if let Some(properties) = properties {
        for (name, prop) in properties {
            let Some(value) = args.get(name) else { continue };
            if let Some(expected) = prop.get("type").and_then(Value::as_str) {
                if !type_matches(expected, value) {
                    offenses.push(format!(
                        "argument '{name}' should be {expected}, got {}",
                        type_name(value)
                    ));
                }
            }
            if let Some(allowed) = prop.get("enum").and_then(Value::as_array) {
                if !allowed.contains(value) {
                    offenses.push(format!("argument '{name}' not in allowed set"));
                }
            }
        }

        if schema.get("additionalProperties") == Some(&Value::Bool(false)) {
            for name in args.keys() {
                if !properties.contains_key(name) {
                    offenses.push(format!("unexpected argument '{name}'"));
                }
            }
        }
    }

    if offenses.is_empty() {
        Ok(())
    } else {
        Err(Error::SchemaValidation(offenses.join("; ")))
    }
}

fn type_matches(expected: &str, value: &Value) -> bool {
    match expected {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        "null" => value.is_null(),
        _ => true,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
