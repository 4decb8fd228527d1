//! Construction-time catalog validation.
//!
//! Walks every flow, step, trigger, tool, and response mapping, and
//! collects **all** offenses before failing, so a broken catalog is
//! fixed in one round instead of one error at a time.

use serde_json::Value;

use cf_domain::{
    Error, FlowDefinition, JsonPathSpec, MappingValue, ResponseMapping, Result, Step,
    ToolImplementation,
};
use cf_script::{parse_path, template, FunctionRegistry};
use cf_tools::ToolCatalog;

pub(crate) fn validate_catalog(
    flows: &[FlowDefinition],
    tools: &ToolCatalog,
    functions: &FunctionRegistry,
) -> Result<()> {
    let mut offenses = Vec::new();
    let flow_ids: std::collections::HashSet<&str> =
        flows.iter().map(|f| f.id.as_str()).collect();

    // Duplicate ids.
    let mut seen = std::collections::HashSet::new();
    for flow in flows {
        if !seen.insert(flow.id.as_str()) {
            offenses.push(format!("duplicate flow id '{}'", flow.id));
        }
    }

    for flow in flows {
        let ctx = Context {
            flow_id: &flow.id,
            flow_ids: &flow_ids,
            tools,
            functions,
        };

        for parameter in &flow.parameters {
            if !is_variable_name(&parameter.name) {
                offenses.push(format!(
                    "flow '{}': parameter '{}' is not an identifier",
                    flow.id, parameter.name
                ));
            }
        }

        for trigger in &flow.triggers {
            if let Some(pattern) = trigger
                .strip_prefix('/')
                .and_then(|t| t.strip_suffix('/'))
            {
                if let Err(e) = regex::Regex::new(pattern) {
                    offenses.push(format!(
                        "flow '{}': trigger pattern '{}' does not compile: {e}",
                        flow.id, trigger
                    ));
                }
            }
        }

        validate_steps(&flow.steps, &ctx, &mut offenses);
    }

    for tool in tools.iter() {
        match &tool.implementation {
            ToolImplementation::Function { name } => {
                if !functions.contains(name) {
                    offenses.push(format!(
                        "tool '{}': approved function '{}' is not registered",
                        tool.name, name
                    ));
                }
            }
            ToolImplementation::Http(http) => {
                if http.url.trim().is_empty() {
                    offenses.push(format!("tool '{}': empty url", tool.name));
                }
                if let Some(mapping) = &http.response_mapping {
                    validate_mapping(
                        mapping,
                        &format!("tool '{}' responseMapping", tool.name),
                        functions,
                        &mut offenses,
                    );
                }
            }
        }
    }

    if offenses.is_empty() {
        Ok(())
    } else {
        Err(Error::CatalogInvalid(offenses))
    }
}

struct Context<'a> {
    flow_id: &'a str,
    flow_ids: &'a std::collections::HashSet<&'a str>,
    tools: &'a ToolCatalog,
    functions: &'a FunctionRegistry,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Steps
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn validate_steps(steps: &[Step], ctx: &Context<'_>, offenses: &mut Vec<String>) {
    for (index, step) in steps.iter().enumerate() {
        let at = format!("flow '{}' step {} ({})", ctx.flow_id, index, step.kind());

        match step {
            Step::Say { message, .. } => {
                check_template(message, &at, ctx.functions, offenses);
            }
            Step::SayGet {
                message,
                variable,
                validator,
            } => {
                check_template(message, &at, ctx.functions, offenses);
                if !is_variable_name(variable) {
                    offenses.push(format!("{at}: variable '{variable}' is not an identifier"));
                }
                if let Some(validator) = validator {
                    check_expression(validator, &at, ctx.functions, offenses);
                }
            }
            Step::Set {
                variable,
                value,
                expression,
                ..
            } => {
                check_write_path(variable, &at, offenses);
                if let Some(expression) = expression {
                    check_expression(expression, &at, ctx.functions, offenses);
                }
                if let Some(value) = value {
                    check_value_templates(value, &at, ctx.functions, offenses);
                }
            }
            Step::CallTool {
                tool_name,
                arguments,
                result_variable,
                on_fail,
            } => {
                if !ctx.tools.contains(tool_name) {
                    offenses.push(format!("{at}: unknown tool '{tool_name}'"));
                }
                check_write_path(result_variable, &at, offenses);
                for value in arguments.values() {
                    check_value_templates(value, &at, ctx.functions, offenses);
                }
                if let Some(on_fail) = on_fail {
                    validate_steps(&on_fail.steps, ctx, offenses);
                }
            }
            Step::Flow {
                flow_id,
                arguments,
                result_variable,
                ..
            } => {
                if !ctx.flow_ids.contains(flow_id.as_str()) {
                    offenses.push(format!("{at}: unknown flow '{flow_id}'"));
                }
                if let Some(result_variable) = result_variable {
                    check_write_path(result_variable, &at, offenses);
                }
                for value in arguments.values() {
                    check_value_templates(value, &at, ctx.functions, offenses);
                }
            }
            Step::Switch {
                expression,
                branches,
                default,
            } => {
                check_expression(expression, &at, ctx.functions, offenses);
                for (bi, branch) in branches.iter().enumerate() {
                    if branch.match_value.is_none() && branch.condition.is_none() {
                        offenses.push(format!(
                            "{at}: branch {bi} has neither 'match' nor 'condition'"
                        ));
                    }
                    if let Some(condition) = &branch.condition {
                        check_expression(condition, &at, ctx.functions, offenses);
                    }
                    validate_steps(&branch.steps, ctx, offenses);
                }
                if let Some(default) = default {
                    validate_steps(default, ctx, offenses);
                }
            }
            Step::Return { value } => {
                if let Some(value) = value {
                    check_value_templates(value, &at, ctx.functions, offenses);
                }
            }
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Response mappings
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn validate_mapping(
    mapping: &ResponseMapping,
    at: &str,
    functions: &FunctionRegistry,
    offenses: &mut Vec<String>,
) {
    match mapping {
        ResponseMapping::JsonPath { mappings } => {
            for (key, spec) in mappings {
                if parse_path(spec.path()).is_err() {
                    offenses.push(format!("{at}: '{key}' has invalid path '{}'", spec.path()));
                }
                if let JsonPathSpec::Full {
                    transform: Some(transform),
                    ..
                } = spec
                {
                    let missing = transform.missing_operands();
                    if !missing.is_empty() {
                        offenses.push(format!(
                            "{at}: '{key}' transform {:?} missing {}",
                            transform.op,
                            missing.join(", ")
                        ));
                    }
                }
            }
        }
        ResponseMapping::Object { mappings } => {
            for (key, value) in mappings {
                validate_mapping_value(value, &format!("{at}.{key}"), functions, offenses);
            }
        }
        ResponseMapping::Array {
            source,
            item_mapping,
            ..
        } => {
            if parse_path(source).is_err() {
                offenses.push(format!("{at}: invalid array source '{source}'"));
            }
            validate_mapping(item_mapping, at, functions, offenses);
        }
        ResponseMapping::Template { template: text } => {
            check_template(text, at, functions, offenses);
        }
        ResponseMapping::Conditional {
            conditions,
            otherwise,
        } => {
            for arm in conditions {
                validate_mapping(&arm.then, at, functions, offenses);
            }
            if let Some(otherwise) = otherwise {
                validate_mapping(otherwise, at, functions, offenses);
            }
        }
    }
}

fn validate_mapping_value(
    value: &MappingValue,
    at: &str,
    functions: &FunctionRegistry,
    offenses: &mut Vec<String>,
) {
    match value {
        MappingValue::Text(text) if text.contains("{{") => {
            check_template(text, at, functions, offenses);
        }
        MappingValue::Text(_) | MappingValue::Literal(_) => {}
        MappingValue::Nested(nested) => {
            for (key, value) in nested {
                validate_mapping_value(value, &format!("{at}.{key}"), functions, offenses);
            }
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Leaf checks
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Simple identifier: no dots, no reserved prefixes.
fn is_variable_name(name: &str) -> bool {
    cf_script::path::is_identifier(name) && !name.starts_with('@') && !name.starts_with('$')
}

/// A write target: dotted identifiers with optional numeric subscripts,
/// never reaching into reserved namespaces.
fn check_write_path(path: &str, at: &str, offenses: &mut Vec<String>) {
    if path.starts_with('@') || path.starts_with('$') {
        offenses.push(format!("{at}: cannot write to reserved path '{path}'"));
        return;
    }
    if parse_path(path).is_err() {
        offenses.push(format!("{at}: invalid variable path '{path}'"));
    }
}

fn check_template(
    text: &str,
    at: &str,
    functions: &FunctionRegistry,
    offenses: &mut Vec<String>,
) {
    if let Err(e) = template::validate(text, functions) {
        offenses.push(format!("{at}: {e}"));
    }
}

fn check_expression(
    source: &str,
    at: &str,
    functions: &FunctionRegistry,
    offenses: &mut Vec<String>,
) {
    if let Err(e) = cf_script::compile(source, functions) {
        offenses.push(format!("{at}: {e}"));
    }
}

/// Walk a literal and validate every templated string inside it.
fn check_value_templates(
    value: &Value,
    at: &str,
    functions: &FunctionRegistry,
    offenses: &mut Vec<String>,
) {
    match value {
        Value::String(text) if text.contains("{{") => {
            check_template(text, at, functions, offenses);
        }
        Value::Array(items) => {
            for item in items {
                check_value_templates(item, at, functions, offenses);
            }
        }
        Value::Object(map) => {
            for item in map.values() {
                check_value_templates(item, at, functions, offenses);
            }
        }
        _ => {}
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
