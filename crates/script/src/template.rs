//! The `{{…}}` template renderer.
//!
//! Supports inline expressions, `{{#each collection}}…{{/each}}`, and
//! `{{#unless cond}}…{{/unless}}`, with arbitrary nesting. Inside an
//! `#each` body the scope binds `this` (the item), `@index`, and `@last`.
//! A string with no `{{` renders as itself.

use cf_domain::{Error, Result};
use serde_json::Value;

use crate::eval::{evaluate, to_display, truthy, FunctionRegistry};
use crate::parser::compile;
use crate::path::Scope;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Parsing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, PartialEq)]
enum Node {
    Text(String),
    Interp(String),
    Each { expr: String, body: Vec<Node> },
    Unless { expr: String, body: Vec<Node> },
}

fn syntax(message: impl Into<String>) -> Error {
    Error::TemplateSyntax(message.into())
}

/// Parse until end of input or until the `closing` tag is consumed.
fn parse_nodes(input: &str, pos: &mut usize, closing: Option<&str>) -> Result<Vec<Node>> {
    let mut nodes = Vec::new();

    loop {
        let rest = &input[*pos..];
        let Some(open) = rest.find("{{") else {
            if let Some(tag) = closing {
                return Err(syntax(format!("missing closing tag '{{{{{tag}}}}}'")));
            }
            if !rest.is_empty() {
                nodes.push(Node::Text(rest.to_owned()));
            }
            *pos = input.len();
            return Ok(nodes);
        };

        if open > 0 {
            nodes.push(Node::Text(rest[..open].to_owned()));
        }

        let after_open = &rest[open + 2..];
        let close = after_open
            .find("}}")
            .ok_or_else(|| syntax(format!("unterminated '{{{{' in template")))?;
        let tag = after_open[..close].trim().to_owned();
        *pos += open + 2 + close + 2;

        if let Some(rest_tag) = tag.strip_prefix('/') {
            return match closing {
                Some(expected) if rest_tag == expected => Ok(nodes),
                Some(expected) => Err(syntax(format!(
                    "mismatched closing tag '{{{{/{rest_tag}}}}}', expected '{{{{/{expected}}}}}'"
                ))),
                None => Err(syntax(format!("unexpected closing tag '{{{{/{rest_tag}}}}}'"))),
            };
        }

        if let Some(header) = tag.strip_prefix('#') {
            let (kind, expr) = match header.split_once(char::is_whitespace) {
                Some((kind, expr)) => (kind, expr.trim().to_owned()),
                None => (header, String::new()),
            };
            if expr.is_empty() {
                return Err(syntax(format!("block '{{{{#{kind}}}}}' needs an expression")));
            }
            let body = parse_nodes(input, pos, Some(kind_tag(kind)?))?;
            nodes.push(match kind {
                "each" => Node::Each { expr, body },
                "unless" => Node::Unless { expr, body },
                _ => unreachable!(),
            });
            continue;
        }

        if tag.is_empty() {
            return Err(syntax("empty '{{}}' tag"));
        }
        nodes.push(Node::Interp(tag));
    }
}

fn kind_tag(kind: &str) -> Result<&'static str> {
    match kind {
        "each" => Ok("each"),
        "unless" => Ok("unless"),
        other => Err(syntax(format!("unknown block tag '{{{{#{other}}}}}'"))),
    }
}

fn parse(template: &str) -> Result<Vec<Node>> {
    let mut pos = 0;
    parse_nodes(template, &mut pos, None)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Rendering
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Render a template against a scope. Pure: no I/O, no clocks.
pub fn render(template: &str, scope: &Scope<'_>, funcs: &FunctionRegistry) -> Result<String> {
    // Fast path: nothing to interpolate.
    if !template.contains("{{") {
        return Ok(template.to_owned());
    }
    let nodes = parse(template)?;
    let mut out = String::with_capacity(template.len());
    render_nodes(&nodes, scope, funcs, &mut out)?;
    Ok(out)
}

fn render_nodes(
    nodes: &[Node],
    scope: &Scope<'_>,
    funcs: &FunctionRegistry,
    out: &mut String,
) -> Result<()> {
    for node in nodes {
        match node {
            Node::Text(text) => out.push_str(text),
            Node::Interp(expr_src) => {
                let expr = compile(expr_src, funcs)?;
                let value = evaluate(&expr, scope, funcs)?;
                out.push_str(&to_display(&value));
            }
            Node::Each { expr: expr_src, body } => {
                let expr = compile(expr_src, funcs)?;
                let value = evaluate(&expr, scope, funcs)?;
                let items = match value {
                    Value::Array(items) => items,
                    Value::Null => Vec::new(),
                    other => vec![other],
                };
                let count = items.len();
                for (index, item) in items.into_iter().enumerate() {
                    let child = scope
                        .with_local("this", item)
                        .with_local("@index", Value::from(index))
                        .with_local("@last", Value::Bool(index + 1 == count));
                    render_nodes(body, &child, funcs, out)?;
                }
            }
            Node::Unless { expr: expr_src, body } => {
                let expr = compile(expr_src, funcs)?;
                let value = evaluate(&expr, scope, funcs)?;
                if !truthy(&value) {
                    render_nodes(body, scope, funcs, out)?;
                }
            }
        }
    }
    Ok(())
}

/// Parse the template and compile every embedded expression without
/// rendering. Used by catalog validation.
pub fn validate(template: &str, funcs: &FunctionRegistry) -> Result<()> {
    fn walk(nodes: &[Node], funcs: &FunctionRegistry) -> Result<()> {
        for node in nodes {
            match node {
                Node::Text(_) => {}
                Node::Interp(expr) => {
                    compile(expr, funcs)?;
                }
                Node::Each { expr, body } | Node::Unless { expr, body } => {
                    compile(expr, funcs)?;
                    walk(body, funcs)?;
                }
            }
        }
        Ok(())
    }
    if !template.contains("{{") {
        return Ok(());
    }
    walk(&parse(template)?, funcs)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Map};

    fn render_with(template: &str, vars: Value) -> Result<String> {
        let vars: Map<String, Value> = vars.as_object().cloned().unwrap_or_default();
        let funcs = FunctionRegistry::default();
        let scope = Scope::new(Some(&vars), None);
        render(template, &scope, &funcs)
    }

    #[test]
    fn plain_text_round_trips() {
        let text = "no tags here, just { braces } and }} stray";
        assert_eq!(render_with(text, json!({})).unwrap(), text);
    }

    #[test]
    fn inline_interpolation() {
        assert_eq!(
            render_with("Hi, {{name}}!", json!({"name": "Ada"})).unwrap(),
            "Hi, Ada!"
        );
        // Missing variables render as empty text.
        assert_eq!(render_with("Hi, {{name}}", json!({})).unwrap(), "Hi, ");
    }

    #[test]
    fn inline_expressions() {
        assert_eq!(
            render_with("{{age >= 18 ? 'adult' : 'minor'}}", json!({"age": 17})).unwrap(),
            "minor"
        );
        assert_eq!(
            render_with("total: {{price * qty}}", json!({"price": 3, "qty": 4})).unwrap(),
            "total: 12"
        );
    }

    #[test]
    fn objects_interpolate_as_json() {
        assert_eq!(
            render_with("{{user}}", json!({"user": {"id": 1}})).unwrap(),
            r#"{"id":1}"#
        );
    }

    #[test]
    fn each_binds_item_index_and_last() {
        let out = render_with(
            "{{#each items}}{{@index}}:{{this}}{{#unless @last}}, {{/unless}}{{/each}}",
            json!({"items": ["a", "b", "c"]}),
        )
        .unwrap();
        assert_eq!(out, "0:a, 1:b, 2:c");
    }

    #[test]
    fn each_over_objects_reads_fields() {
        let out = render_with(
            "{{#each users}}{{this.name}};{{/each}}",
            json!({"users": [{"name": "A"}, {"name": "B"}]}),
        )
        .unwrap();
        assert_eq!(out, "A;B;");
    }

    #[test]
    fn each_over_missing_renders_nothing() {
        assert_eq!(render_with("{{#each xs}}x{{/each}}", json!({})).unwrap(), "");
    }

    #[test]
    fn unless_renders_on_falsy() {
        assert_eq!(
            render_with("{{#unless done}}pending{{/unless}}", json!({"done": false})).unwrap(),
            "pending"
        );
        assert_eq!(
            render_with("{{#unless done}}pending{{/unless}}", json!({"done": true})).unwrap(),
            ""
        );
    }

    #[test]
    fn nested_blocks() {
        let out = render_with(
            "{{#each rows}}{{#each this}}{{this}}{{/each}}|{{/each}}",
            json!({"rows": [[1, 2], [3]]}),
        )
        .unwrap();
        assert_eq!(out, "12|3|");
    }

    #[test]
    fn unknown_tags_are_syntax_errors() {
        for bad in [
            "{{#if x}}y{{/if}}",
            "{{#each xs}}no close",
            "{{/each}}",
            "{{unclosed",
            "{{}}",
            "{{#each xs}}{{/unless}}",
        ] {
            match render_with(bad, json!({"xs": [1]})) {
                Err(Error::TemplateSyntax(_)) => {}
                other => panic!("'{bad}' should be a syntax error, got {other:?}"),
            }
        }
    }

    #[test]
    fn rejected_expression_inside_template_propagates() {
        match render_with("{{this.constructor('x')()}}", json!({})) {
            Err(Error::ExpressionRejected(_)) => {}
            other => panic!("expected ExpressionRejected, got {other:?}"),
        }
    }

    #[test]
    fn validate_accepts_and_rejects() {
        let funcs = FunctionRegistry::default();
        assert!(validate("Hi {{name}}", &funcs).is_ok());
        assert!(validate("{{#each xs}}{{this}}{{/each}}", &funcs).is_ok());
        assert!(validate("{{#bogus x}}{{/bogus}}", &funcs).is_err());
        assert!(validate("{{x +}}", &funcs).is_err());
    }
}
