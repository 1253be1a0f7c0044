//! envgrid-values — YAML values documents as used by the render pipeline.
//!
//! Every layer that feeds a render (global defaults, chart `values.yaml`,
//! service override YAML, flattened override key/values) is a YAML mapping.
//! This crate holds the value-level operations the engine composes:
//!
//! - `flatten`: mapping → dotted-path flat map (`a.b[0].c`), root keys
//! - `path`: dotted-path assignment into a document (helm `--set` style)
//! - `merge`: deep merge (mappings union, sequences replaced wholesale)
//! - `kv`: key/value list → YAML conversion and YAML equality
//! - `image`: image URI derivation from a flat map and a search pattern
//!
//! Documents are `serde_yaml::Value`; an empty or `null` document is treated
//! as an empty mapping.

pub mod error;
pub mod flatten;
pub mod image;
pub mod kv;
pub mod merge;
pub mod path;

pub use error::{ValuesError, ValuesResult};
pub use flatten::{FlatMap, flatten, flatten_document, root_key, scalar_to_string};
pub use image::{ImageSearchPattern, derive_image_uri};
pub use kv::{KeyValue, apply_key_values, key_values_to_yaml, yaml_equal};
pub use merge::{deep_merge, merge_documents};
pub use path::{MAX_INDEX, set_path};

use serde_yaml::{Mapping, Value};

/// Parse a values document. Blank text and `null` yield an empty mapping.
pub fn parse_document(text: &str) -> ValuesResult<Value> {
    if text.trim().is_empty() {
        return Ok(Value::Mapping(Mapping::new()));
    }
    let value: Value =
        serde_yaml::from_str(text).map_err(|e| ValuesError::Parse(e.to_string()))?;
    match value {
        Value::Null => Ok(Value::Mapping(Mapping::new())),
        Value::Mapping(_) => Ok(value),
        Value::Sequence(_) => Err(ValuesError::NotAMapping("sequence")),
        _ => Err(ValuesError::NotAMapping("scalar")),
    }
}

/// Serialize a document back to YAML text. An empty mapping becomes `""`.
pub fn to_yaml_string(value: &Value) -> ValuesResult<String> {
    if matches!(value, Value::Mapping(m) if m.is_empty()) || value.is_null() {
        return Ok(String::new());
    }
    serde_yaml::to_string(value).map_err(|e| ValuesError::Serialize(e.to_string()))
}
