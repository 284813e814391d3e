//! JSON manipulation utilities for field-mapped workflow data.
//!
//! Node inputs and outputs are `serde_json::Map<String, Value>` values
//! addressed by [`FieldPath`] segments. This module provides the path-based
//! accessors the resolver and runtime lean on, plus deep merging for
//! combining partial maps (carry-overs, stream chunks).

use miette::Diagnostic;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::types::FieldPath;

/// A node's input or output payload.
pub type ValueMap = Map<String, Value>;

/// Errors that can occur during JSON path operations.
#[derive(Debug, Error, Diagnostic)]
pub enum JsonError {
    /// A path segment traversed into a non-object value.
    #[error("cannot descend into non-object at '{path}'")]
    #[diagnostic(code(graphloom::json::not_an_object))]
    NotAnObject { path: String },

    /// Two values of incompatible shapes were merged.
    #[error("merge conflict at '{path}': cannot merge {left_type} with {right_type}")]
    #[diagnostic(code(graphloom::json::merge_conflict))]
    MergeConflict {
        path: String,
        left_type: &'static str,
        right_type: &'static str,
    },
}

/// Get a reference to the value at `path` within `map`, if present.
///
/// An empty path has no meaning here; the caller decides whether an empty
/// path means "the whole map" before descending.
///
/// # Examples
///
/// ```rust
/// use graphloom::types::FieldPath;
/// use graphloom::utils::json_ext::get_map_value;
/// use serde_json::json;
///
/// let map = json!({"user": {"name": "Ada"}});
/// let map = map.as_object().unwrap();
/// let name = get_map_value(map, &FieldPath::from(["user", "name"]));
/// assert_eq!(name, Some(&json!("Ada")));
/// ```
#[must_use]
pub fn get_map_value<'a>(map: &'a ValueMap, path: &FieldPath) -> Option<&'a Value> {
    let mut segs = path.segments().iter();
    let first = segs.next()?;
    let mut current = map.get(first)?;
    for seg in segs {
        current = current.as_object()?.get(seg)?;
    }
    Some(current)
}

/// Remove and return the value at `path` within `map`, if present.
pub fn take_map_value(map: &mut ValueMap, path: &FieldPath) -> Option<Value> {
    let segs = path.segments();
    match segs {
        [] => None,
        [only] => map.remove(only),
        [first, rest @ ..] => {
            let mut current = map.get_mut(first)?;
            for seg in &rest[..rest.len() - 1] {
                current = current.as_object_mut()?.get_mut(seg)?;
            }
            current
                .as_object_mut()?
                .remove(rest.last().map(String::as_str)?)
        }
    }
}

/// Set `value` at `path` within `map`, creating intermediate objects as
/// needed. Fails when a segment traverses into a non-object value.
pub fn set_map_value(map: &mut ValueMap, path: &FieldPath, value: Value) -> Result<(), JsonError> {
    let segs = path.segments();
    if segs.is_empty() {
        return match value {
            Value::Object(obj) => {
                for (k, v) in obj {
                    map.insert(k, v);
                }
                Ok(())
            }
            _ => Err(JsonError::NotAnObject {
                path: String::new(),
            }),
        };
    }

    let mut current = map;
    for (i, seg) in segs[..segs.len() - 1].iter().enumerate() {
        let slot = current
            .entry(seg.clone())
            .or_insert_with(|| Value::Object(Map::new()));
        current = slot.as_object_mut().ok_or_else(|| JsonError::NotAnObject {
            path: segs[..=i].join("."),
        })?;
    }
    current.insert(segs[segs.len() - 1].clone(), value);
    Ok(())
}

/// Deep-merge `right` into `left`. Objects merge recursively, everything
/// else prefers `right`. Used for carry-over assembly and stream chunk
/// accumulation where later chunks refine earlier ones.
pub fn deep_merge_maps(left: &mut ValueMap, right: ValueMap) {
    for (k, rv) in right {
        match (left.get_mut(&k), rv) {
            (Some(Value::Object(lo)), Value::Object(ro)) => deep_merge_maps(lo, ro),
            (_, rv) => {
                left.insert(k, rv);
            }
        }
    }
}

/// Human-readable JSON type name, used in diagnostics.
#[must_use]
pub fn value_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(v: Value) -> ValueMap {
        match v {
            Value::Object(m) => m,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn get_and_set_round_trip() {
        let mut map = ValueMap::new();
        set_map_value(&mut map, &FieldPath::from(["a", "b", "c"]), json!(42)).unwrap();
        assert_eq!(
            get_map_value(&map, &FieldPath::from(["a", "b", "c"])),
            Some(&json!(42))
        );
        assert_eq!(get_map_value(&map, &FieldPath::from(["a", "x"])), None);
    }

    #[test]
    fn set_through_scalar_fails() {
        let mut map = obj(json!({"a": 1}));
        let err = set_map_value(&mut map, &FieldPath::from(["a", "b"]), json!(2));
        assert!(err.is_err());
    }

    #[test]
    fn take_removes_nested() {
        let mut map = obj(json!({"a": {"b": {"c": 1}, "d": 2}}));
        let taken = take_map_value(&mut map, &FieldPath::from(["a", "b", "c"]));
        assert_eq!(taken, Some(json!(1)));
        assert_eq!(get_map_value(&map, &FieldPath::from(["a", "b", "c"])), None);
        assert_eq!(get_map_value(&map, &FieldPath::from(["a", "d"])), Some(&json!(2)));
    }

    #[test]
    fn empty_path_set_merges_object() {
        let mut map = obj(json!({"keep": true}));
        set_map_value(
            &mut map,
            &FieldPath::new(),
            json!({"added": 1}),
        )
        .unwrap();
        assert_eq!(map.get("keep"), Some(&json!(true)));
        assert_eq!(map.get("added"), Some(&json!(1)));
    }

    #[test]
    fn deep_merge_recurses_objects() {
        let mut left = obj(json!({"a": {"x": 1}, "b": 1}));
        let right = obj(json!({"a": {"y": 2}, "b": 2}));
        deep_merge_maps(&mut left, right);
        assert_eq!(Value::Object(left), json!({"a": {"x": 1, "y": 2}, "b": 2}));
    }
}
