//! Declarative workflow description.
//!
//! A [`WorkflowSchema`] is the authoring-time artifact: a set of
//! [`NodeSchema`]s, the connections between them, and the scope hierarchy for
//! composite nodes. It carries no executable code; the engine compiles it
//! against a [`crate::registry::NodeRegistry`] into a runnable graph.
//!
//! # Examples
//!
//! ```rust
//! use graphloom::schema::{Connection, NodeSchema, WorkflowSchema};
//! use graphloom::schema::config::NodeConfig;
//! use graphloom::types::NodeKey;
//!
//! let schema = WorkflowSchema::new()
//!     .with_node(NodeSchema::new("greet", NodeConfig::Lambda {
//!         executor: "greeter".to_string(),
//!     }))
//!     .with_connection(Connection::new(NodeKey::entry(), "greet"))
//!     .with_connection(Connection::new("greet", NodeKey::exit()));
//! assert!(schema.node(&NodeKey::from("greet")).is_some());
//! ```

pub mod config;
pub mod field;

use miette::Diagnostic;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use config::{
    AggregatorConfig, AggregatorGroup, AnswerMode, BatchConfig, CONCURRENT_SIZE_KEY, ChoiceSpec,
    Clause, ClauseRelation, EmitterConfig, ErrorProcess, ExceptionConfig, LOOP_COUNT_KEY,
    LoopConfig, LoopKind, NodeConfig, Operator, QaConfig, ReceiverConfig, SelectorBranch,
    SelectorConfig, StreamConfig, SubWorkflowConfig,
};
pub use field::{FieldInfo, FieldRef, FieldSource, TypeInfo, VarKind};

use crate::types::{FieldPath, NodeKey, NodeType, Port};

/// A directed connection between two nodes in the same scope.
///
/// A connection without a port is an unconditional edge; a ported connection
/// only activates when the source node selects that port.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Connection {
    pub from: NodeKey,
    pub to: NodeKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<Port>,
}

impl Connection {
    #[must_use]
    pub fn new(from: impl Into<NodeKey>, to: impl Into<NodeKey>) -> Self {
        Connection {
            from: from.into(),
            to: to.into(),
            port: None,
        }
    }

    #[must_use]
    pub fn with_port(mut self, port: Port) -> Self {
        self.port = Some(port);
        self
    }
}

/// Declarative description of one node.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeSchema {
    pub key: NodeKey,
    #[serde(default)]
    pub name: String,
    pub config: NodeConfig,
    /// Declared type per top-level input field.
    #[serde(default)]
    pub input_types: FxHashMap<String, TypeInfo>,
    /// Field mappings filling this node's input.
    #[serde(default)]
    pub input_sources: Vec<FieldInfo>,
    /// Declared type per top-level output field.
    #[serde(default)]
    pub output_types: FxHashMap<String, TypeInfo>,
    /// For composites and exit nodes: where each output field is read from
    /// within the inner scope.
    #[serde(default)]
    pub output_sources: Vec<FieldInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exception: Option<ExceptionConfig>,
    #[serde(default)]
    pub stream: StreamConfig,
    /// Inner workflow hosted by composite nodes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_schema: Option<Box<WorkflowSchema>>,
}

impl NodeSchema {
    #[must_use]
    pub fn new(key: impl Into<NodeKey>, config: NodeConfig) -> Self {
        NodeSchema {
            key: key.into(),
            name: String::new(),
            config,
            input_types: FxHashMap::default(),
            input_sources: Vec::new(),
            output_types: FxHashMap::default(),
            output_sources: Vec::new(),
            exception: None,
            stream: StreamConfig::default(),
            sub_schema: None,
        }
    }

    /// The node's behavioral type, derived from its configuration.
    #[must_use]
    pub fn node_type(&self) -> NodeType {
        self.config.node_type()
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    #[must_use]
    pub fn with_input_type(mut self, field: impl Into<String>, t: TypeInfo) -> Self {
        self.input_types.insert(field.into(), t);
        self
    }

    #[must_use]
    pub fn with_input_source(mut self, info: FieldInfo) -> Self {
        self.input_sources.push(info);
        self
    }

    #[must_use]
    pub fn with_output_type(mut self, field: impl Into<String>, t: TypeInfo) -> Self {
        self.output_types.insert(field.into(), t);
        self
    }

    #[must_use]
    pub fn with_output_source(mut self, info: FieldInfo) -> Self {
        self.output_sources.push(info);
        self
    }

    #[must_use]
    pub fn with_exception(mut self, exception: ExceptionConfig) -> Self {
        self.exception = Some(exception);
        self
    }

    #[must_use]
    pub fn with_stream(mut self, stream: StreamConfig) -> Self {
        self.stream = stream;
        self
    }

    #[must_use]
    pub fn with_sub_schema(mut self, sub: WorkflowSchema) -> Self {
        self.sub_schema = Some(Box::new(sub));
        self
    }

    /// Declared type at a path within this node's output.
    #[must_use]
    pub fn output_type_at(&self, path: &FieldPath) -> Option<&TypeInfo> {
        let segs = path.segments();
        let first = segs.first()?;
        let root = self.output_types.get(first)?;
        root.at_path(&FieldPath::from(&segs[1..]))
    }

    /// Declared type at a path within this node's input.
    #[must_use]
    pub fn input_type_at(&self, path: &FieldPath) -> Option<&TypeInfo> {
        let segs = path.segments();
        let first = segs.first()?;
        let root = self.input_types.get(first)?;
        root.at_path(&FieldPath::from(&segs[1..]))
    }

    /// Whether running this node can suspend the workflow, directly or
    /// through a nested scope.
    #[must_use]
    pub fn requires_checkpoint(&self) -> bool {
        if self.node_type().is_interactive() {
            return true;
        }
        self.sub_schema
            .as_deref()
            .is_some_and(WorkflowSchema::requires_checkpoint)
    }
}

/// Declarative description of one workflow scope.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSchema {
    pub nodes: Vec<NodeSchema>,
    pub connections: Vec<Connection>,
    /// Field mappings assembling this scope's output at the synthetic exit.
    /// For inner scopes these are derived from the hosting composite's
    /// `output_sources` during compilation.
    #[serde(default)]
    pub output_sources: Vec<FieldInfo>,
    /// Declared type per top-level output field of this scope.
    #[serde(default)]
    pub output_types: FxHashMap<String, TypeInfo>,
}

impl WorkflowSchema {
    #[must_use]
    pub fn new() -> Self {
        WorkflowSchema::default()
    }

    #[must_use]
    pub fn with_node(mut self, node: NodeSchema) -> Self {
        self.nodes.push(node);
        self
    }

    #[must_use]
    pub fn with_connection(mut self, connection: Connection) -> Self {
        self.connections.push(connection);
        self
    }

    #[must_use]
    pub fn with_output_source(mut self, info: FieldInfo) -> Self {
        self.output_sources.push(info);
        self
    }

    #[must_use]
    pub fn with_output_type(mut self, field: impl Into<String>, t: TypeInfo) -> Self {
        self.output_types.insert(field.into(), t);
        self
    }

    #[must_use]
    pub fn node(&self, key: &NodeKey) -> Option<&NodeSchema> {
        self.nodes.iter().find(|n| &n.key == key)
    }

    /// Total node count including nested scopes (synthetic nodes excluded).
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes
            .iter()
            .map(|n| 1 + n.sub_schema.as_deref().map_or(0, WorkflowSchema::node_count))
            .sum()
    }

    /// Connections whose source is `key`.
    pub fn connections_from<'a>(
        &'a self,
        key: &'a NodeKey,
    ) -> impl Iterator<Item = &'a Connection> + 'a {
        self.connections.iter().filter(move |c| &c.from == key)
    }

    /// Connections whose target is `key`.
    pub fn connections_to<'a>(
        &'a self,
        key: &'a NodeKey,
    ) -> impl Iterator<Item = &'a Connection> + 'a {
        self.connections.iter().filter(move |c| &c.to == key)
    }

    /// Whether any connection links `from` directly to `to`.
    #[must_use]
    pub fn connected(&self, from: &NodeKey, to: &NodeKey) -> bool {
        self.connections
            .iter()
            .any(|c| &c.from == from && &c.to == to)
    }

    /// Whether this scope (or any nested scope) contains a node that can
    /// suspend execution.
    #[must_use]
    pub fn requires_checkpoint(&self) -> bool {
        self.nodes.iter().any(NodeSchema::requires_checkpoint)
    }

    /// Whether any node in this scope produces streaming output, which
    /// forces streaming classification to run.
    #[must_use]
    pub fn requires_streaming(&self) -> bool {
        self.nodes.iter().any(|n| match &n.config {
            NodeConfig::OutputEmitter(cfg) => cfg.streaming,
            _ => n.stream.can_generate_stream,
        })
    }

    /// Validate structural integrity: key uniqueness, connection endpoints,
    /// config/sub-schema pairing, selector port shape, and field-source
    /// sanity. Called by the engine before compilation.
    pub fn validate(&self) -> Result<(), SchemaError> {
        let mut keys: FxHashSet<&NodeKey> = FxHashSet::default();
        for node in &self.nodes {
            if node.key.is_entry() || node.key.is_exit() {
                return Err(SchemaError::ReservedKey {
                    key: node.key.clone(),
                });
            }
            if !keys.insert(&node.key) {
                return Err(SchemaError::DuplicateKey {
                    key: node.key.clone(),
                });
            }
            if node.node_type().is_composite() && node.sub_schema.is_none() {
                return Err(SchemaError::MissingSubSchema {
                    key: node.key.clone(),
                });
            }
            for info in &node.input_sources {
                if let FieldSource::Ref(r) = &info.source {
                    if r.is_vacuous() {
                        return Err(SchemaError::VacuousSource {
                            key: node.key.clone(),
                            field: info.path.to_string(),
                        });
                    }
                    if r.from_node.as_ref() == Some(&node.key) {
                        return Err(SchemaError::SelfReference {
                            key: node.key.clone(),
                            field: info.path.to_string(),
                        });
                    }
                }
            }
            if let Some(sub) = node.sub_schema.as_deref() {
                sub.validate()?;
            }
        }

        let known = |k: &NodeKey| k.is_entry() || k.is_exit() || keys.contains(k);
        for conn in &self.connections {
            if !known(&conn.from) || !known(&conn.to) {
                return Err(SchemaError::DanglingConnection {
                    from: conn.from.clone(),
                    to: conn.to.clone(),
                });
            }
        }

        for node in &self.nodes {
            if node.node_type() == NodeType::Selector {
                let branch_count = match &node.config {
                    NodeConfig::Selector(cfg) => cfg.branches.len(),
                    _ => 0,
                };
                for conn in self.connections_from(&node.key) {
                    match conn.port {
                        Some(Port::Branch(i)) if i < branch_count => {}
                        Some(Port::Default) => {}
                        _ => {
                            return Err(SchemaError::InvalidPort {
                                key: node.key.clone(),
                                port: conn.port.map(|p| p.encode()).unwrap_or_default(),
                            });
                        }
                    }
                }
            }
        }

        Ok(())
    }

    /// Build a map from child key to parent composite key, one level deep.
    #[must_use]
    pub fn child_to_parent(&self) -> FxHashMap<NodeKey, NodeKey> {
        let mut out = FxHashMap::default();
        for node in &self.nodes {
            if let Some(sub) = node.sub_schema.as_deref() {
                for child in &sub.nodes {
                    out.insert(child.key.clone(), node.key.clone());
                }
            }
        }
        out
    }
}

/// Structural errors detected before compilation.
#[derive(Debug, Error, Diagnostic)]
pub enum SchemaError {
    #[error("node key '{key}' is reserved for synthetic nodes")]
    #[diagnostic(
        code(graphloom::schema::reserved_key),
        help("Entry/exit nodes are implicit; pick a different key.")
    )]
    ReservedKey { key: NodeKey },

    #[error("duplicate node key '{key}'")]
    #[diagnostic(code(graphloom::schema::duplicate_key))]
    DuplicateKey { key: NodeKey },

    #[error("composite node '{key}' has no inner workflow")]
    #[diagnostic(
        code(graphloom::schema::missing_sub_schema),
        help("Batch, loop, and sub-workflow nodes must carry a sub_schema.")
    )]
    MissingSubSchema { key: NodeKey },

    #[error("field '{field}' of node '{key}' has a source with no node, path, or variable")]
    #[diagnostic(code(graphloom::schema::vacuous_source))]
    VacuousSource { key: NodeKey, field: String },

    #[error("field '{field}' of node '{key}' references its own output")]
    #[diagnostic(code(graphloom::schema::self_reference))]
    SelfReference { key: NodeKey, field: String },

    #[error("connection references unknown node ('{from}' -> '{to}')")]
    #[diagnostic(code(graphloom::schema::dangling_connection))]
    DanglingConnection { from: NodeKey, to: NodeKey },

    #[error("selector '{key}' has an out-of-range or missing port '{port}'")]
    #[diagnostic(
        code(graphloom::schema::invalid_port),
        help("Selector edges must carry branch_<i> within range or default.")
    )]
    InvalidPort { key: NodeKey, port: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn lambda(key: &str) -> NodeSchema {
        NodeSchema::new(
            key,
            NodeConfig::Lambda {
                executor: "noop".to_string(),
            },
        )
    }

    #[test]
    fn validate_accepts_simple_chain() {
        let schema = WorkflowSchema::new()
            .with_node(lambda("a"))
            .with_node(lambda("b"))
            .with_connection(Connection::new(NodeKey::entry(), "a"))
            .with_connection(Connection::new("a", "b"))
            .with_connection(Connection::new("b", NodeKey::exit()));
        assert!(schema.validate().is_ok());
    }

    #[test]
    fn validate_rejects_duplicate_keys() {
        let schema = WorkflowSchema::new().with_node(lambda("a")).with_node(lambda("a"));
        assert!(matches!(
            schema.validate(),
            Err(SchemaError::DuplicateKey { .. })
        ));
    }

    #[test]
    fn validate_rejects_self_reference() {
        let node = lambda("a").with_input_source(FieldInfo::new(
            FieldPath::single("x"),
            FieldSource::Ref(FieldRef::node_output("a", FieldPath::single("x"))),
        ));
        let schema = WorkflowSchema::new().with_node(node);
        assert!(matches!(
            schema.validate(),
            Err(SchemaError::SelfReference { .. })
        ));
    }

    #[test]
    fn validate_rejects_dangling_connection() {
        let schema = WorkflowSchema::new()
            .with_node(lambda("a"))
            .with_connection(Connection::new("a", "ghost"));
        assert!(matches!(
            schema.validate(),
            Err(SchemaError::DanglingConnection { .. })
        ));
    }

    #[test]
    fn validate_rejects_composite_without_inner() {
        let schema = WorkflowSchema::new().with_node(NodeSchema::new(
            "b",
            NodeConfig::Batch(BatchConfig {
                input_arrays: vec!["a".to_string()],
            }),
        ));
        assert!(matches!(
            schema.validate(),
            Err(SchemaError::MissingSubSchema { .. })
        ));
    }

    #[test]
    fn checkpoint_requirement_propagates_from_nested_scope() {
        let inner = WorkflowSchema::new().with_node(NodeSchema::new(
            "ask",
            NodeConfig::InputReceiver(ReceiverConfig {
                prompt: "value?".to_string(),
                output_fields: Default::default(),
            }),
        ));
        let outer = WorkflowSchema::new().with_node(
            NodeSchema::new(
                "host",
                NodeConfig::Loop(LoopConfig {
                    kind: LoopKind::ByIteration,
                    input_arrays: vec![],
                    intermediate_vars: Default::default(),
                }),
            )
            .with_sub_schema(inner),
        );
        assert!(outer.requires_checkpoint());
    }

    #[test]
    fn schema_serde_round_trip() {
        let schema = WorkflowSchema::new()
            .with_node(
                lambda("a")
                    .with_input_type("x", TypeInfo::String)
                    .with_input_source(FieldInfo::new(
                        FieldPath::single("x"),
                        FieldSource::Static { value: json!("v") },
                    )),
            )
            .with_connection(Connection::new(NodeKey::entry(), "a"));
        let text = serde_json::to_string(&schema).unwrap();
        let back: WorkflowSchema = serde_json::from_str(&text).unwrap();
        assert_eq!(back, schema);
    }
}
