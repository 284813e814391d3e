//! Field-level typing and data-mapping primitives.
//!
//! A workflow's data flow is declared field by field: every input field of a
//! node names where its value comes from ([`FieldSource`]), and every field
//! carries a [`TypeInfo`] so the engine can synthesize zero values, detect
//! array drill-down positions, and validate mappings at compile time.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{FieldPath, NodeKey};

/// Shape of a field's value, rich enough to produce zero values and drive
/// array drill-down in the dependency resolver.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TypeInfo {
    String,
    Integer,
    Number,
    Boolean,
    Object {
        #[serde(default)]
        properties: FxHashMap<String, TypeInfo>,
    },
    Array {
        element: Box<TypeInfo>,
    },
}

impl TypeInfo {
    /// An object type with no declared properties.
    #[must_use]
    pub fn any_object() -> Self {
        TypeInfo::Object {
            properties: FxHashMap::default(),
        }
    }

    /// The zero value of this type, used to backfill fields whose producer
    /// finished without supplying them.
    #[must_use]
    pub fn zero(&self) -> Value {
        match self {
            TypeInfo::String => Value::String(String::new()),
            TypeInfo::Integer => Value::from(0i64),
            TypeInfo::Number => Value::from(0f64),
            TypeInfo::Boolean => Value::Bool(false),
            TypeInfo::Object { .. } => Value::Object(serde_json::Map::new()),
            TypeInfo::Array { .. } => Value::Array(Vec::new()),
        }
    }

    /// Returns `true` when this is an array type.
    #[must_use]
    pub fn is_array(&self) -> bool {
        matches!(self, TypeInfo::Array { .. })
    }

    /// Walk a path through this type, returning the type at the end of the
    /// path. Array segments descend into the element type.
    #[must_use]
    pub fn at_path(&self, path: &FieldPath) -> Option<&TypeInfo> {
        let mut current = self;
        for seg in path.segments() {
            current = match current {
                TypeInfo::Object { properties } => properties.get(seg)?,
                TypeInfo::Array { element } => {
                    // numeric segments index into the element type
                    if seg.parse::<usize>().is_ok() {
                        element.as_ref()
                    } else {
                        return None;
                    }
                }
                _ => return None,
            };
        }
        Some(current)
    }

    /// Best-effort coercion of a raw value into this type; falls back to the
    /// zero value when the value cannot be interpreted. Strings accept any
    /// raw data verbatim.
    #[must_use]
    pub fn coerce_or_zero(&self, value: Value) -> Value {
        match (self, &value) {
            (TypeInfo::String, Value::String(_)) => value,
            (TypeInfo::String, other) => Value::String(other.to_string()),
            (TypeInfo::Integer, Value::Number(n)) if n.is_i64() || n.is_u64() => value,
            (TypeInfo::Number, Value::Number(_)) => value,
            (TypeInfo::Boolean, Value::Bool(_)) => value,
            (TypeInfo::Object { .. }, Value::Object(_)) => value,
            (TypeInfo::Array { .. }, Value::Array(_)) => value,
            _ => self.zero(),
        }
    }
}

/// Which variable store a variable-backed field reads from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VarKind {
    /// Intermediate variable owned by the enclosing loop node.
    ParentIntermediate,
    /// Read-only system variables.
    GlobalSystem,
    /// Per-user variables.
    GlobalUser,
    /// Application-scoped variables, read through the app-variable cache.
    GlobalApp,
}

/// A reference to another node's output field or to a variable store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FieldRef {
    /// Producing node. `None` for variable references and for references
    /// that address the enclosing scope's whole input.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_node: Option<NodeKey>,
    /// Path within the producer's output (or variable store).
    #[serde(default)]
    pub from_path: FieldPath,
    /// Present when this reference reads a variable store instead of a node
    /// output. Variable references never create graph edges.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variable: Option<VarKind>,
}

impl FieldRef {
    #[must_use]
    pub fn node_output(from_node: impl Into<NodeKey>, from_path: FieldPath) -> Self {
        FieldRef {
            from_node: Some(from_node.into()),
            from_path,
            variable: None,
        }
    }

    #[must_use]
    pub fn variable(kind: VarKind, from_path: FieldPath) -> Self {
        FieldRef {
            from_node: None,
            from_path,
            variable: Some(kind),
        }
    }

    /// A reference with no node, no path, and no variable carries no
    /// information and is rejected at compile time.
    #[must_use]
    pub fn is_vacuous(&self) -> bool {
        self.from_node.is_none() && self.from_path.is_empty() && self.variable.is_none()
    }
}

/// Where an input field's value comes from.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum FieldSource {
    /// Another node's output field or a variable store.
    Ref(FieldRef),
    /// A literal value fixed at authoring time.
    Static { value: Value },
}

impl FieldSource {
    #[must_use]
    pub fn as_ref_source(&self) -> Option<&FieldRef> {
        match self {
            FieldSource::Ref(r) => Some(r),
            FieldSource::Static { .. } => None,
        }
    }
}

/// One declared input (or composite output) field: the position it occupies
/// on the consuming node and the source that fills it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FieldInfo {
    pub path: FieldPath,
    pub source: FieldSource,
}

impl FieldInfo {
    #[must_use]
    pub fn new(path: FieldPath, source: FieldSource) -> Self {
        FieldInfo { path, source }
    }
}
