//! Deep merge of values documents.
//!
//! Mappings merge recursively (key union, overlay wins per key). Sequences
//! and scalars from the overlay replace the base node wholesale; lists are
//! never concatenated or merged by index.

use serde_yaml::{Mapping, Value};

use crate::error::ValuesResult;
use crate::parse_document;

/// Merge `overlay` into `base` in place.
pub fn deep_merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Mapping(base_map), Value::Mapping(overlay_map)) => {
            for (key, value) in overlay_map {
                let both_mappings = matches!(
                    (base_map.get(&key), &value),
                    (Some(Value::Mapping(_)), Value::Mapping(_))
                );
                if both_mappings {
                    if let Some(existing) = base_map.get_mut(&key) {
                        deep_merge(existing, value);
                    }
                } else {
                    base_map.insert(key, value);
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

/// Parse and merge documents in increasing precedence order.
pub fn merge_documents<'a, I>(documents: I) -> ValuesResult<Value>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut merged = Value::Mapping(Mapping::new());
    for text in documents {
        deep_merge(&mut merged, parse_document(text)?);
    }
    Ok(merged)
}
