//! Dotted-path assignment (`image.tag=v2`, `hosts[0].name=a`).
//!
//! Intermediate nodes are created as needed; a node of the wrong shape on
//! the way down is replaced, so the assignment always lands on a leaf.

use serde_yaml::{Mapping, Value};

use crate::error::{ValuesError, ValuesResult};

/// Largest list index a path may address; the sequence is padded up to it.
pub const MAX_INDEX: usize = 65536;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Key(String),
    Index(usize),
}

fn parse_path(path: &str) -> ValuesResult<Vec<Segment>> {
    let invalid = || ValuesError::InvalidPath(path.to_string());
    let mut segments = Vec::new();
    for part in path.split('.') {
        let (name, mut rest) = match part.find('[') {
            Some(pos) => part.split_at(pos),
            None => (part, ""),
        };
        if name.is_empty() {
            return Err(invalid());
        }
        segments.push(Segment::Key(name.to_string()));
        while !rest.is_empty() {
            let close = rest.find(']').ok_or_else(invalid)?;
            if !rest.starts_with('[') {
                return Err(invalid());
            }
            let index = rest[1..close].parse::<usize>().map_err(|_| invalid())?;
            if index > MAX_INDEX {
                return Err(invalid());
            }
            segments.push(Segment::Index(index));
            rest = &rest[close + 1..];
        }
    }
    Ok(segments)
}

/// Assign `value` at `path` inside `doc`, overwriting whatever leaf is there.
pub fn set_path(doc: &mut Value, path: &str, value: Value) -> ValuesResult<()> {
    let segments = parse_path(path)?;
    set_at(doc, &segments, value);
    Ok(())
}

fn set_at(node: &mut Value, segments: &[Segment], value: Value) {
    let Some((head, rest)) = segments.split_first() else {
        *node = value;
        return;
    };
    match head {
        Segment::Key(key) => {
            if !node.is_mapping() {
                *node = Value::Mapping(Mapping::new());
            }
            if let Value::Mapping(map) = node {
                let key = Value::String(key.clone());
                if !map.contains_key(&key) {
                    map.insert(key.clone(), Value::Null);
                }
                if let Some(child) = map.get_mut(&key) {
                    set_at(child, rest, value);
                }
            }
        }
        Segment::Index(index) => {
            if !node.is_sequence() {
                *node = Value::Sequence(Vec::new());
            }
            if let Value::Sequence(items) = node {
                if items.len() <= *index {
                    items.resize(*index + 1, Value::Null);
                }
                set_at(&mut items[*index], rest, value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse_document;

    #[test]
    fn sets_nested_key_creating_parents() {
        let mut doc = parse_document("").unwrap();
        set_path(&mut doc, "image.tag", Value::from("v2")).unwrap();
        assert_eq!(doc, parse_document("image:\n  tag: v2\n").unwrap());
    }

    #[test]
    fn overwrites_existing_leaf_and_keeps_siblings() {
        let mut doc = parse_document("image:\n  repo: r\n  tag: v1\n").unwrap();
        set_path(&mut doc, "image.tag", Value::from("v2")).unwrap();
        assert_eq!(doc, parse_document("image:\n  repo: r\n  tag: v2\n").unwrap());
    }

    #[test]
    fn sets_list_elements() {
        let mut doc = parse_document("hosts:\n  - name: a\n").unwrap();
        set_path(&mut doc, "hosts[1].name", Value::from("b")).unwrap();
        assert_eq!(
            doc,
            parse_document("hosts:\n  - name: a\n  - name: b\n").unwrap()
        );
    }

    #[test]
    fn rejects_malformed_paths() {
        let mut doc = parse_document("").unwrap();
        assert!(set_path(&mut doc, "", Value::Null).is_err());
        assert!(set_path(&mut doc, "a..b", Value::Null).is_err());
        assert!(set_path(&mut doc, "a[x]", Value::Null).is_err());
        assert!(set_path(&mut doc, "a[1", Value::Null).is_err());
    }

    #[test]
    fn list_index_is_bounded() {
        let mut doc = parse_document("").unwrap();
        let err = set_path(&mut doc, "a[2000000]", Value::from(1)).unwrap_err();
        assert!(matches!(err, ValuesError::InvalidPath(_)));
        assert_eq!(doc, parse_document("").unwrap());

        set_path(&mut doc, &format!("b[{MAX_INDEX}]"), Value::from(1)).unwrap();
        assert_eq!(doc["b"].as_sequence().map(Vec::len), Some(MAX_INDEX + 1));
    }
}
