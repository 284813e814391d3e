//! Schema construction shorthand.

use graphloom::schema::{
    Connection, FieldInfo, FieldRef, FieldSource, NodeConfig, NodeSchema,
};
use graphloom::types::{FieldPath, NodeKey};
use graphloom::utils::ValueMap;
use serde_json::Value;

/// Parse a dotted string into a field path; the empty string is the
/// whole-map path.
pub fn path(dotted: &str) -> FieldPath {
    if dotted.is_empty() {
        FieldPath::new()
    } else {
        FieldPath::from(
            dotted
                .split('.')
                .map(str::to_string)
                .collect::<Vec<String>>(),
        )
    }
}

/// A field filled from another node's output.
pub fn mapped(to: &str, from: impl Into<NodeKey>, from_path: &str) -> FieldInfo {
    FieldInfo::new(
        path(to),
        FieldSource::Ref(FieldRef::node_output(from, path(from_path))),
    )
}

/// A field fixed at authoring time.
pub fn fixed(to: &str, value: Value) -> FieldInfo {
    FieldInfo::new(path(to), FieldSource::Static { value })
}

/// A lambda node resolved by executor name.
pub fn lambda_node(key: &str, executor: &str) -> NodeSchema {
    NodeSchema::new(
        key,
        NodeConfig::Lambda {
            executor: executor.to_string(),
        },
    )
}

pub fn edge(from: impl Into<NodeKey>, to: impl Into<NodeKey>) -> Connection {
    Connection::new(from, to)
}

/// Build an input map from key/value pairs.
pub fn input_map(pairs: &[(&str, Value)]) -> ValueMap {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}
