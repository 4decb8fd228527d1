//! Dotted-path access over `serde_json::Value` trees, plus the read scope
//! that layers frame variables, session globals, tool arguments, and
//! iteration locals.

use cf_domain::{Error, Result};
use serde_json::{Map, Value};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Path parsing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One segment of a parsed path: an identifier key or an array index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Key(String),
    Index(usize),
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_' || c == '$' || c == '@'
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '$'
}

/// Whether `name` is a bare identifier usable as a variable name or path
/// segment. `@`-prefixed names are reserved for iteration locals.
pub fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if is_ident_start(c) => {}
        _ => return false,
    }
    chars.all(is_ident_char)
}

/// Parse `a.b[0].c` into segments. Any segment that is not an identifier
/// or a non-negative integer index is refused.
pub fn parse_path(path: &str) -> Result<Vec<Segment>> {
    if path.is_empty() {
        return Err(Error::Internal("empty variable path".into()));
    }

    let mut segments = Vec::new();
    let mut rest = path;

    loop {
        // Identifier segment.
        let end = rest
            .char_indices()
            .find(|(_, c)| *c == '.' || *c == '[')
            .map(|(i, _)| i)
            .unwrap_or(rest.len());
        let (ident, tail) = rest.split_at(end);
        if !is_identifier(ident) {
            return Err(Error::Internal(format!(
                "invalid path segment '{ident}' in '{path}'"
            )));
        }
        segments.push(Segment::Key(ident.to_owned()));
        rest = tail;

        // Zero or more `[n]` subscripts.
        while let Some(stripped) = rest.strip_prefix('[') {
            let close = stripped.find(']').ok_or_else(|| {
                Error::Internal(format!("unterminated subscript in '{path}'"))
            })?;
            let digits = &stripped[..close];
            let index: usize = digits.parse().map_err(|_| {
                Error::Internal(format!("invalid subscript '[{digits}]' in '{path}'"))
            })?;
            segments.push(Segment::Index(index));
            rest = &stripped[close + 1..];
        }

        match rest.strip_prefix('.') {
            Some(tail) if !tail.is_empty() => rest = tail,
            Some(_) => {
                return Err(Error::Internal(format!("trailing '.' in '{path}'")));
            }
            None if rest.is_empty() => return Ok(segments),
            None => {
                return Err(Error::Internal(format!(
                    "unexpected '{rest}' in path '{path}'"
                )));
            }
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Get / set
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Resolve `segments` against a value tree. `None` means the path is
/// absent (the engine's `undefined`).
pub fn get_path<'a>(root: &'a Value, segments: &[Segment]) -> Option<&'a Value> {
    let mut current = root;
    for segment in segments {
        current = match segment {
            Segment::Key(key) => current.as_object()?.get(key)?,
            Segment::Index(i) => current.as_array()?.get(*i)?,
        };
    }
    Some(current)
}

/// Write `value` at `segments`, creating intermediate objects (and
/// null-padding arrays) as needed.
pub fn set_path(root: &mut Map<String, Value>, segments: &[Segment], value: Value) -> Result<()> {
    let (first, rest) = match segments.split_first() {
        Some((Segment::Key(key), rest)) => (key, rest),
        _ => return Err(Error::Internal("path must start with an identifier".into())),
    };

    if rest.is_empty() {
        root.insert(first.clone(), value);
        return Ok(());
    }

    let slot = root.entry(first.clone()).or_insert(Value::Null);
    set_in_value(slot, rest, value);
    Ok(())
}

fn set_in_value(slot: &mut Value, segments: &[Segment], value: Value) {
    let (head, rest) = match segments.split_first() {
        Some(pair) => pair,
        None => {
            *slot = value;
            return;
        }
    };

    match head {
        Segment::Key(key) => {
            if !slot.is_object() {
                *slot = Value::Object(Map::new());
            }
            let map = slot.as_object_mut().unwrap();
            let child = map.entry(key.clone()).or_insert(Value::Null);
            set_in_value(child, rest, value);
        }
        Segment::Index(i) => {
            if !slot.is_array() {
                *slot = Value::Array(Vec::new());
            }
            let arr = slot.as_array_mut().unwrap();
            while arr.len() <= *i {
                arr.push(Value::Null);
            }
            set_in_value(&mut arr[*i], rest, value);
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Read scope
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A read-only view used by expression evaluation and template rendering.
///
/// Resolution order for the first path segment: iteration locals
/// (`this`, `@index`, `@last`), then frame variables, then session
/// globals. `$args` resolves into the tool-argument scope when one is
/// active. Writes never go through a scope; they target the frame
/// directly.
#[derive(Clone, Default)]
pub struct Scope<'a> {
    variables: Option<&'a Map<String, Value>>,
    globals: Option<&'a Map<String, Value>>,
    args: Option<&'a Value>,
    locals: Vec<(String, Value)>,
}

impl<'a> Scope<'a> {
    pub fn new(
        variables: Option<&'a Map<String, Value>>,
        globals: Option<&'a Map<String, Value>>,
    ) -> Self {
        Self {
            variables,
            globals,
            args: None,
            locals: Vec::new(),
        }
    }

    /// A scope over a bare value tree, used by response mapping where the
    /// tool response plays the role of the variable store.
    pub fn of_value(root: &'a Map<String, Value>) -> Self {
        Self::new(Some(root), None)
    }

    pub fn with_args(mut self, args: &'a Value) -> Self {
        self.args = Some(args);
        self
    }

    /// Child scope with one extra local binding (e.g. `this`, `@index`).
    pub fn with_local(&self, name: impl Into<String>, value: Value) -> Scope<'a> {
        let mut child = self.clone();
        child.locals.push((name.into(), value));
        child
    }

    /// Resolve a parsed path. `None` is `undefined`.
    pub fn lookup(&self, segments: &[Segment]) -> Option<Value> {
        let (first, rest) = segments.split_first()?;
        let key = match first {
            Segment::Key(k) => k.as_str(),
            Segment::Index(_) => return None,
        };

        // $args.* reaches into the active tool-argument scope.
        if key == "$args" {
            let args = self.args?;
            return get_path(args, rest).cloned();
        }

        // Iteration locals shadow everything (latest binding wins).
        if let Some((_, value)) = self.locals.iter().rev().find(|(name, _)| name == key) {
            return if rest.is_empty() {
                Some(value.clone())
            } else {
                get_path(value, rest).cloned()
            };
        }

        for store in [self.variables, self.globals].into_iter().flatten() {
            if let Some(root) = store.get(key) {
                return if rest.is_empty() {
                    Some(root.clone())
                } else {
                    get_path(root, rest).cloned()
                };
            }
        }
        None
    }

    /// Resolve a textual path like `user.address.city`.
    pub fn lookup_str(&self, path: &str) -> Result<Option<Value>> {
        Ok(self.lookup(&parse_path(path)?))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(value: Value) -> Map<String, Value> {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn parse_simple_and_subscripted_paths() {
        assert_eq!(
            parse_path("a.b").unwrap(),
            vec![Segment::Key("a".into()), Segment::Key("b".into())]
        );
        assert_eq!(
            parse_path("a.b[0].c").unwrap(),
            vec![
                Segment::Key("a".into()),
                Segment::Key("b".into()),
                Segment::Index(0),
                Segment::Key("c".into()),
            ]
        );
    }

    #[test]
    fn parse_rejects_bad_segments() {
        assert!(parse_path("").is_err());
        assert!(parse_path("a..b").is_err());
        assert!(parse_path("a.b[x]").is_err());
        assert!(parse_path("a.b[-1]").is_err());
        assert!(parse_path("a.b[1").is_err());
        assert!(parse_path("a.1b").is_err());
        assert!(parse_path("a.").is_err());
    }

    #[test]
    fn get_traverses_objects_and_arrays() {
        let root = json!({"a": {"b": [{"c": 7}]}});
        let segs = parse_path("a.b[0].c").unwrap();
        assert_eq!(get_path(&root, &segs), Some(&json!(7)));

        let missing = parse_path("a.b[1].c").unwrap();
        assert_eq!(get_path(&root, &missing), None);
    }

    #[test]
    fn set_auto_vivifies_intermediates() {
        let mut vars = Map::new();
        set_path(&mut vars, &parse_path("order.items[1].sku").unwrap(), json!("X9")).unwrap();
        let root = Value::Object(vars);
        assert_eq!(root["order"]["items"][0], Value::Null);
        assert_eq!(root["order"]["items"][1]["sku"], json!("X9"));
    }

    #[test]
    fn set_overwrites_non_container() {
        let mut vars = obj(json!({"a": 3}));
        set_path(&mut vars, &parse_path("a.b").unwrap(), json!(true)).unwrap();
        assert_eq!(Value::Object(vars)["a"]["b"], json!(true));
    }

    #[test]
    fn scope_resolution_order() {
        let vars = obj(json!({"x": "frame", "only_frame": 1}));
        let globals = obj(json!({"x": "global", "only_global": 2}));
        let scope = Scope::new(Some(&vars), Some(&globals));

        assert_eq!(scope.lookup_str("x").unwrap(), Some(json!("frame")));
        assert_eq!(scope.lookup_str("only_global").unwrap(), Some(json!(2)));
        assert_eq!(scope.lookup_str("nope").unwrap(), None);
    }

    #[test]
    fn locals_shadow_variables() {
        let vars = obj(json!({"this": "outer"}));
        let scope = Scope::new(Some(&vars), None).with_local("this", json!("item"));
        assert_eq!(scope.lookup_str("this").unwrap(), Some(json!("item")));
    }

    #[test]
    fn args_scope_resolves_dollar_args() {
        let vars = Map::new();
        let args = json!({"userId": 42});
        let scope = Scope::new(Some(&vars), None).with_args(&args);
        assert_eq!(scope.lookup_str("$args.userId").unwrap(), Some(json!(42)));
        assert_eq!(scope.lookup_str("$args.missing").unwrap(), None);
    }
}
