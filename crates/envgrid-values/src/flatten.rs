//! Flattening of values documents into dotted-path keys.
//!
//! `{image: {tag: v1}, ports: [80, 443]}` flattens to
//! `image.tag = v1`, `ports[0] = 80`, `ports[1] = 443`. Empty mappings and
//! empty sequences are kept as leaves so no key disappears.

use std::collections::BTreeMap;

use serde_yaml::Value;

use crate::error::ValuesResult;
use crate::parse_document;

/// Dotted-path key → leaf value. Ordered for deterministic output.
pub type FlatMap = BTreeMap<String, Value>;

/// Flatten a parsed document.
pub fn flatten(value: &Value) -> FlatMap {
    let mut out = FlatMap::new();
    walk("", value, &mut out);
    out
}

/// Parse then flatten a YAML document.
pub fn flatten_document(text: &str) -> ValuesResult<FlatMap> {
    Ok(flatten(&parse_document(text)?))
}

fn walk(prefix: &str, value: &Value, out: &mut FlatMap) {
    match value {
        Value::Mapping(map) if !map.is_empty() => {
            for (key, child) in map {
                let key = scalar_to_string(key);
                let path = if prefix.is_empty() {
                    key
                } else {
                    format!("{prefix}.{key}")
                };
                walk(&path, child, out);
            }
        }
        Value::Sequence(items) if !items.is_empty() => {
            for (i, child) in items.iter().enumerate() {
                walk(&format!("{prefix}[{i}]"), child, out);
            }
        }
        Value::Tagged(tagged) => walk(prefix, &tagged.value, out),
        leaf => {
            if !prefix.is_empty() {
                out.insert(prefix.to_string(), leaf.clone());
            }
        }
    }
}

/// The first path segment of a flat key with any list index stripped:
/// `image.tag` → `image`, `hosts[0].name` → `hosts`.
pub fn root_key(flat_key: &str) -> &str {
    let first = flat_key.split('.').next().unwrap_or(flat_key);
    first.split('[').next().unwrap_or(first)
}

/// Render a scalar the way it would appear in a manifest.
pub fn scalar_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null => String::new(),
        other => serde_yaml::to_string(other)
            .map(|s| s.trim_end().to_string())
            .unwrap_or_default(),
    }
}
