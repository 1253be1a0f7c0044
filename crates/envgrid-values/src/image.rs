//! Container image derivation from merged values.
//!
//! A search pattern names the flat keys holding each part of an image
//! reference, e.g. `repo = image.repository`, `tag = image.tag`. The URI is
//! `[repo/][namespace/]image[:tag]`; only `image` is mandatory. Derivation
//! is a pure function of the flat map, so deriving twice from the same
//! merged values yields the same URI.

use serde::{Deserialize, Serialize};

use crate::error::{ValuesError, ValuesResult};
use crate::flatten::{FlatMap, scalar_to_string};

/// Flat keys locating each part of an image reference.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSearchPattern {
    #[serde(default)]
    pub repo: Option<String>,
    #[serde(default)]
    pub namespace: Option<String>,
    pub image: String,
    #[serde(default)]
    pub tag: Option<String>,
}

fn lookup(flat: &FlatMap, key: Option<&str>) -> Option<String> {
    let value = flat.get(key?)?;
    let s = scalar_to_string(value);
    (!s.is_empty()).then_some(s)
}

/// Build the image URI for `pattern` from a flattened values document.
pub fn derive_image_uri(pattern: &ImageSearchPattern, flat: &FlatMap) -> ValuesResult<String> {
    let image = lookup(flat, Some(&pattern.image)).ok_or_else(|| {
        ValuesError::MissingImageField {
            field: "image",
            key: pattern.image.clone(),
        }
    })?;

    let mut parts = Vec::with_capacity(3);
    if let Some(repo) = lookup(flat, pattern.repo.as_deref()) {
        parts.push(repo.trim_end_matches('/').to_string());
    }
    if let Some(namespace) = lookup(flat, pattern.namespace.as_deref()) {
        parts.push(namespace.trim_matches('/').to_string());
    }
    parts.push(image);

    let mut uri = parts.join("/");
    if let Some(tag) = lookup(flat, pattern.tag.as_deref()) {
        uri.push(':');
        uri.push_str(&tag);
    }
    Ok(uri)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flatten::flatten_document;

    fn pattern() -> ImageSearchPattern {
        ImageSearchPattern {
            repo: Some("image.repository".to_string()),
            namespace: None,
            image: "image.name".to_string(),
            tag: Some("image.tag".to_string()),
        }
    }

    #[test]
    fn derives_full_uri() {
        let flat = flatten_document(
            "image:\n  repository: registry.local/\n  name: web\n  tag: v3\n",
        )
        .unwrap();
        assert_eq!(
            derive_image_uri(&pattern(), &flat).unwrap(),
            "registry.local/web:v3"
        );
    }

    #[test]
    fn optional_parts_are_skipped() {
        let flat = flatten_document("image:\n  name: web\n").unwrap();
        assert_eq!(derive_image_uri(&pattern(), &flat).unwrap(), "web");
    }

    #[test]
    fn missing_image_is_an_error() {
        let flat = flatten_document("image:\n  tag: v1\n").unwrap();
        assert!(matches!(
            derive_image_uri(&pattern(), &flat),
            Err(ValuesError::MissingImageField { field: "image", .. })
        ));
    }

    #[test]
    fn derivation_is_idempotent() {
        let flat = flatten_document(
            "image:\n  repository: r\n  name: api\n  tag: \"1.2\"\n",
        )
        .unwrap();
        let first = derive_image_uri(&pattern(), &flat).unwrap();
        let second = derive_image_uri(&pattern(), &flat).unwrap();
        assert_eq!(first, second);
        assert_eq!(first, "r/api:1.2");
    }
}
