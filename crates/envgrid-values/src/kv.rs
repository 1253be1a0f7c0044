//! Key/value lists and their YAML form.
//!
//! A key/value list is the flattened form of a values document: each entry
//! assigns one dotted path. Converting a list to YAML applies the entries in
//! order to an empty document, so a later entry wins over an earlier one.

use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};

use crate::error::ValuesResult;
use crate::flatten::flatten_document;
use crate::path::set_path;
use crate::to_yaml_string;

/// One dotted-path assignment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: String,
    pub value: Value,
}

impl KeyValue {
    pub fn new(key: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Apply each entry to `doc` in order.
pub fn apply_key_values(doc: &mut Value, kvs: &[KeyValue]) -> ValuesResult<()> {
    for kv in kvs {
        set_path(doc, &kv.key, kv.value.clone())?;
    }
    Ok(())
}

/// Build the canonical YAML document for a key/value list.
pub fn key_values_to_yaml(kvs: &[KeyValue]) -> ValuesResult<String> {
    let mut doc = Value::Mapping(Mapping::new());
    apply_key_values(&mut doc, kvs)?;
    to_yaml_string(&doc)
}

/// Semantic equality of two documents, ignoring key order and formatting.
pub fn yaml_equal(a: &str, b: &str) -> ValuesResult<bool> {
    Ok(flatten_document(a)? == flatten_document(b)?)
}
