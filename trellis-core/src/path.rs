//! Dotted-path addressing into nested values.
//!
//! `"a.0.b"` means: key `a` of a mapping, item `0` of a list or tuple, key `b`
//! of a mapping. A segment that does not resolve is an error, never a default.

use crate::error::PathError;
use crate::value::Value;

/// Resolve `path` inside `value`.
///
/// ```
/// use std::collections::BTreeMap;
/// use trellis_core::{dict_by_key, Value};
///
/// let mut inner = BTreeMap::new();
/// inner.insert("b".to_string(), Value::Int(42));
/// let mut outer = BTreeMap::new();
/// outer.insert("a".to_string(), Value::List(vec![Value::Map(inner)]));
///
/// let v = Value::Map(outer);
/// assert_eq!(dict_by_key(&v, "a.0.b").unwrap(), &Value::Int(42));
/// assert!(dict_by_key(&v, "a.1.b").is_err());
/// ```
pub fn dict_by_key<'a>(value: &'a Value, path: &str) -> Result<&'a Value, PathError> {
    let mut current = value;
    for segment in path.split('.') {
        current = step(current, segment, path)?;
    }
    Ok(current)
}

/// Resolve the first segment of `path` in a mapping, then the rest inside it.
pub(crate) fn resolve_in_map<'a>(
    map: &'a std::collections::BTreeMap<String, Value>,
    path: &str,
) -> Result<&'a Value, PathError> {
    let (head, rest) = match path.split_once('.') {
        Some((head, rest)) => (head, Some(rest)),
        None => (path, None),
    };
    let first = map.get(head).ok_or_else(|| PathError::KeyNotFound {
        path: path.to_string(),
        segment: head.to_string(),
    })?;
    let mut current = first;
    if let Some(rest) = rest {
        for segment in rest.split('.') {
            current = step(current, segment, path)?;
        }
    }
    Ok(current)
}

fn step<'a>(current: &'a Value, segment: &str, path: &str) -> Result<&'a Value, PathError> {
    match current {
        Value::Map(map) => map.get(segment).ok_or_else(|| PathError::KeyNotFound {
            path: path.to_string(),
            segment: segment.to_string(),
        }),
        Value::List(items) | Value::Tuple(items) => {
            let index: usize = segment.parse().map_err(|_| PathError::InvalidIndex {
                path: path.to_string(),
                segment: segment.to_string(),
            })?;
            items.get(index).ok_or(PathError::IndexOutOfRange {
                path: path.to_string(),
                index,
                len: items.len(),
            })
        }
        other => Err(PathError::NotIndexable {
            path: path.to_string(),
            segment: segment.to_string(),
            kind: other.kind(),
        }),
    }
}
