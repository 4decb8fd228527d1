use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Transforms
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A declarative value transform: one operation plus its operands.
///
/// Operand strings may contain `{{…}}` templates; they are resolved in the
/// caller's scope before the transform runs. `fallback` substitutes the
/// result on coercion failure; `precision` rounds numeric results
/// half-away-from-zero to that many decimal digits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transform {
    #[serde(rename = "type")]
    pub op: TransformOp,
    #[serde(default)]
    pub pattern: Option<String>,
    #[serde(default)]
    pub replacement: Option<String>,
    #[serde(default)]
    pub flags: Option<String>,
    #[serde(default)]
    pub group: Option<usize>,
    #[serde(default)]
    pub prefix: Option<String>,
    #[serde(default)]
    pub suffix: Option<String>,
    #[serde(default)]
    pub addend: Option<Value>,
    #[serde(default)]
    pub subtrahend: Option<Value>,
    #[serde(default)]
    pub multiplier: Option<Value>,
    #[serde(default)]
    pub divisor: Option<Value>,
    /// For array aggregates over arrays of objects: the scalar field.
    #[serde(default)]
    pub field: Option<String>,
    #[serde(default)]
    pub fallback: Option<Value>,
    #[serde(default)]
    pub precision: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TransformOp {
    ParseInt,
    ParseFloat,
    ToLowerCase,
    ToUpperCase,
    Trim,
    Replace,
    Concat,
    Regex,
    Date,
    Default,
    Add,
    Subtract,
    Multiply,
    Divide,
    Percentage,
    Abs,
    Round,
    Floor,
    Ceil,
    CurrentYear,
    YearDifference,
    Sum,
    Average,
    Count,
    Min,
    Max,
}

impl Transform {
    /// The operand keys this operation requires to be present.
    ///
    /// Used by catalog validation so that a malformed transform fails at
    /// construction rather than mid-conversation.
    pub fn required_operands(&self) -> &'static [&'static str] {
        match self.op {
            TransformOp::Replace => &["pattern", "replacement"],
            TransformOp::Regex => &["pattern"],
            TransformOp::Add => &["addend"],
            TransformOp::Subtract => &["subtrahend"],
            TransformOp::Multiply => &["multiplier"],
            TransformOp::Divide | TransformOp::Percentage => &["divisor"],
            _ => &[],
        }
    }

    /// Which required operand keys are missing, by name.
    pub fn missing_operands(&self) -> Vec<&'static str> {
        self.required_operands()
            .iter()
            .copied()
            .filter(|key| match *key {
                "pattern" => self.pattern.is_none(),
                "replacement" => self.replacement.is_none(),
                "addend" => self.addend.is_none(),
                "subtrahend" => self.subtrahend.is_none(),
                "multiplier" => self.multiplier.is_none(),
                "divisor" => self.divisor.is_none(),
                _ => false,
            })
            .collect()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Response mappings
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Declarative transformation from a raw tool response to the value bound
/// to the step's result variable.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ResponseMapping {
    /// Per-output-key path extraction with optional transform/fallback.
    JsonPath {
        mappings: HashMap<String, JsonPathSpec>,
    },
    /// Recursive key-remap: leaf strings are source paths (or templates),
    /// nested objects nest, literal values pass through.
    Object {
        mappings: HashMap<String, MappingValue>,
    },
    /// Extract an array, filter and truncate it, then map each item.
    Array {
        source: String,
        #[serde(default)]
        limit: Option<usize>,
        #[serde(default)]
        filter: Option<Filter>,
        #[serde(rename = "itemMapping")]
        item_mapping: Box<ResponseMapping>,
    },
    /// Render a single template string against the response.
    Template { template: String },
    /// First matching condition's mapping applies, else the `else` arm.
    Conditional {
        conditions: Vec<ConditionalArm>,
        #[serde(default, rename = "else")]
        otherwise: Option<Box<ResponseMapping>>,
    },
}

/// One `jsonPath` output entry: either a bare source path or the full
/// `{path, transform?, fallback?}` record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JsonPathSpec {
    Path(String),
    Full {
        path: String,
        #[serde(default)]
        transform: Option<Transform>,
        /// May itself be a template referencing `$args.*`.
        #[serde(default)]
        fallback: Option<Value>,
    },
}

impl JsonPathSpec {
    pub fn path(&self) -> &str {
        match self {
            JsonPathSpec::Path(p) => p,
            JsonPathSpec::Full { path, .. } => path,
        }
    }
}

/// Value position inside an `object` mapping.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MappingValue {
    /// Source path, or a `{{…}}` template when it contains one.
    Text(String),
    /// Nested remap.
    Nested(HashMap<String, MappingValue>),
    /// Any other literal passes through unchanged.
    Literal(Value),
}

/// One arm of a `conditional` mapping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionalArm {
    #[serde(rename = "if")]
    pub condition: Filter,
    pub then: Box<ResponseMapping>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Filters
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Field predicate used by `array` filters and `conditional` arms.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Filter {
    pub field: String,
    pub operator: FilterOperator,
    #[serde(default)]
    pub value: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FilterOperator {
    Equals,
    NotEquals,
    Exists,
    Gt,
    Gte,
    Lt,
    Lte,
    Contains,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transform_op_uses_camel_case_tags() {
        let t: Transform =
            serde_json::from_value(serde_json::json!({ "type": "parseInt", "fallback": 0 }))
                .unwrap();
        assert_eq!(t.op, TransformOp::ParseInt);

        let t: Transform =
            serde_json::from_value(serde_json::json!({ "type": "yearDifference" })).unwrap();
        assert_eq!(t.op, TransformOp::YearDifference);
    }

    #[test]
    fn missing_operands_reported() {
        let t: Transform =
            serde_json::from_value(serde_json::json!({ "type": "divide" })).unwrap();
        assert_eq!(t.missing_operands(), vec!["divisor"]);

        let t: Transform = serde_json::from_value(
            serde_json::json!({ "type": "replace", "pattern": "a" }),
        )
        .unwrap();
        assert_eq!(t.missing_operands(), vec!["replacement"]);
    }

    #[test]
    fn array_mapping_parses_seed_shape() {
        let json = serde_json::json!({
            "type": "array",
            "source": "results",
            "filter": { "field": "active", "operator": "equals", "value": true },
            "itemMapping": { "type": "object", "mappings": { "label": "name" } }
        });
        let mapping: ResponseMapping = serde_json::from_value(json).unwrap();
        match mapping {
            ResponseMapping::Array { source, filter, item_mapping, .. } => {
                assert_eq!(source, "results");
                assert_eq!(filter.unwrap().operator, FilterOperator::Equals);
                assert!(matches!(*item_mapping, ResponseMapping::Object { .. }));
            }
            _ => panic!("expected array mapping"),
        }
    }

    #[test]
    fn json_path_spec_accepts_bare_string() {
        let spec: JsonPathSpec = serde_json::from_value(serde_json::json!("user.name")).unwrap();
        assert_eq!(spec.path(), "user.name");
    }

    #[test]
    fn object_mapping_value_shapes() {
        let text: MappingValue = serde_json::from_value(serde_json::json!("a.b")).unwrap();
        assert!(matches!(text, MappingValue::Text(_)));

        let nested: MappingValue =
            serde_json::from_value(serde_json::json!({ "inner": "x" })).unwrap();
        assert!(matches!(nested, MappingValue::Nested(_)));

        let literal: MappingValue = serde_json::from_value(serde_json::json!(42)).unwrap();
        assert!(matches!(literal, MappingValue::Literal(_)));
    }
}
