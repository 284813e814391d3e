//! Core identifier types for the graphloom workflow engine.
//!
//! This module defines the fundamental vocabulary used throughout the crate:
//! node keys, node types, field paths, and branch ports. These are the domain
//! concepts that describe what a workflow *is*; runtime concerns (execute IDs,
//! interrupt events) live under [`crate::runtime`].
//!
//! # Key Types
//!
//! - [`NodeKey`]: Unique identifier of a node within one workflow scope
//! - [`NodeType`]: The behavioral category of a node
//! - [`FieldPath`]: Ordered segments addressing a (possibly nested) field
//! - [`Port`]: Branch selection emitted by routing nodes
//!
//! # Examples
//!
//! ```rust
//! use graphloom::types::{FieldPath, NodeKey, NodeType, Port};
//!
//! let key = NodeKey::from("llm_1");
//! assert_eq!(key.as_str(), "llm_1");
//!
//! let path = FieldPath::from(["result", "text"]);
//! assert_eq!(path.join("."), "result.text");
//!
//! assert_eq!(Port::Branch(2).encode(), "branch_2");
//! assert_eq!(NodeType::Batch.encode(), "Batch");
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

/// Segment separator used when a field path must be flattened into a single
/// map key, e.g. when a composite node proxies parent-scope fields through
/// its inner entry node.
pub const PATH_JOIN: &str = "#";

/// Reserved key of the synthetic entry node of every workflow scope.
pub const ENTRY_NODE_KEY: &str = "__entry__";

/// Reserved key of the synthetic exit node of every workflow scope.
pub const EXIT_NODE_KEY: &str = "__exit__";

/// Unique identifier of a node within a single workflow scope.
///
/// Keys are plain strings supplied by the workflow description. Nested scopes
/// (batch/loop bodies, sub-workflows) each have their own key namespace plus
/// the synthetic [`ENTRY_NODE_KEY`]/[`EXIT_NODE_KEY`] pair.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeKey(pub String);

impl NodeKey {
    /// The synthetic entry node key for a workflow scope.
    #[must_use]
    pub fn entry() -> Self {
        NodeKey(ENTRY_NODE_KEY.to_string())
    }

    /// The synthetic exit node key for a workflow scope.
    #[must_use]
    pub fn exit() -> Self {
        NodeKey(EXIT_NODE_KEY.to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns `true` if this is the synthetic entry node.
    #[must_use]
    pub fn is_entry(&self) -> bool {
        self.0 == ENTRY_NODE_KEY
    }

    /// Returns `true` if this is the synthetic exit node.
    #[must_use]
    pub fn is_exit(&self) -> bool {
        self.0 == EXIT_NODE_KEY
    }
}

impl fmt::Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for NodeKey {
    fn from(s: &str) -> Self {
        NodeKey(s.to_string())
    }
}

impl From<String> for NodeKey {
    fn from(s: String) -> Self {
        NodeKey(s)
    }
}

/// Behavioral category of a workflow node.
///
/// The type selects which executor the [`crate::registry::NodeRegistry`]
/// instantiates and drives special handling in the dependency and streaming
/// resolvers (composites host inner workflows, emitters produce streams,
/// selectors route ports, and so on).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeType {
    /// Synthetic entry of a workflow scope; always counts as executed.
    Entry,
    /// Synthetic exit of a workflow scope; assembles the workflow output.
    Exit,
    /// Lambda-style leaf supplied by the embedding application.
    Lambda,
    /// Renders a template against upstream fields, possibly as a stream.
    OutputEmitter,
    /// Picks the first non-null candidate per declared group.
    VariableAggregator,
    /// Asks the user a question and suspends until answered.
    QuestionAnswer,
    /// Suspends until external input arrives.
    InputReceiver,
    /// Routes exactly one branch port based on ordered conditions.
    Selector,
    /// Concurrent composite over input arrays.
    Batch,
    /// Sequential composite (by array, by iteration count, or infinite).
    Loop,
    /// Terminates the innermost enclosing loop.
    Break,
    /// Hosts a nested workflow as a single node.
    SubWorkflow,
}

impl NodeType {
    /// Encode into the persisted string form.
    #[must_use]
    pub fn encode(&self) -> &'static str {
        match self {
            NodeType::Entry => "Entry",
            NodeType::Exit => "Exit",
            NodeType::Lambda => "Lambda",
            NodeType::OutputEmitter => "OutputEmitter",
            NodeType::VariableAggregator => "VariableAggregator",
            NodeType::QuestionAnswer => "QuestionAnswer",
            NodeType::InputReceiver => "InputReceiver",
            NodeType::Selector => "Selector",
            NodeType::Batch => "Batch",
            NodeType::Loop => "Loop",
            NodeType::Break => "Break",
            NodeType::SubWorkflow => "SubWorkflow",
        }
    }

    /// Decode a persisted string form. Unknown strings map to `Lambda` so
    /// that older checkpoints keep loading.
    #[must_use]
    pub fn decode(s: &str) -> Self {
        match s {
            "Entry" => NodeType::Entry,
            "Exit" => NodeType::Exit,
            "OutputEmitter" => NodeType::OutputEmitter,
            "VariableAggregator" => NodeType::VariableAggregator,
            "QuestionAnswer" => NodeType::QuestionAnswer,
            "InputReceiver" => NodeType::InputReceiver,
            "Selector" => NodeType::Selector,
            "Batch" => NodeType::Batch,
            "Loop" => NodeType::Loop,
            "Break" => NodeType::Break,
            "SubWorkflow" => NodeType::SubWorkflow,
            _ => NodeType::Lambda,
        }
    }

    /// Composite nodes host an inner workflow scope.
    #[must_use]
    pub fn is_composite(&self) -> bool {
        matches!(self, NodeType::Batch | NodeType::Loop | NodeType::SubWorkflow)
    }

    /// Interactive nodes can suspend the run and therefore force the
    /// enclosing workflow to be checkpointable.
    #[must_use]
    pub fn is_interactive(&self) -> bool {
        matches!(self, NodeType::QuestionAnswer | NodeType::InputReceiver)
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.encode())
    }
}

/// Ordered segments addressing a field inside a node's input or output map.
///
/// An empty path addresses the whole map. Flattened cross-scope positions
/// join segments with [`PATH_JOIN`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FieldPath(pub Vec<String>);

impl FieldPath {
    #[must_use]
    pub fn new() -> Self {
        FieldPath(Vec::new())
    }

    #[must_use]
    pub fn single(segment: impl Into<String>) -> Self {
        FieldPath(vec![segment.into()])
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn segments(&self) -> &[String] {
        &self.0
    }

    /// Joins the segments with the given separator.
    #[must_use]
    pub fn join(&self, sep: &str) -> String {
        self.0.join(sep)
    }

    /// Flattens this path into a single-segment path using [`PATH_JOIN`],
    /// prefixed with the producing node's key. This is the position a parent
    /// field occupies when proxied through a composite's entry node.
    #[must_use]
    pub fn proxied_through_entry(&self, from_node: &NodeKey) -> FieldPath {
        let mut joined = from_node.0.clone();
        for seg in &self.0 {
            joined.push_str(PATH_JOIN);
            joined.push_str(seg);
        }
        FieldPath(vec![joined])
    }

    /// Returns a new path with `segment` appended.
    #[must_use]
    pub fn child(&self, segment: impl Into<String>) -> FieldPath {
        let mut segs = self.0.clone();
        segs.push(segment.into());
        FieldPath(segs)
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join("."))
    }
}

impl<const N: usize> From<[&str; N]> for FieldPath {
    fn from(segs: [&str; N]) -> Self {
        FieldPath(segs.iter().map(|s| s.to_string()).collect())
    }
}

impl From<Vec<String>> for FieldPath {
    fn from(segs: Vec<String>) -> Self {
        FieldPath(segs)
    }
}

impl From<&[String]> for FieldPath {
    fn from(segs: &[String]) -> Self {
        FieldPath(segs.to_vec())
    }
}

/// Branch selection emitted by routing nodes (selector conditions, exception
/// branches).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Port {
    /// The i-th condition branch.
    Branch(usize),
    /// Fallback branch when no condition matched.
    Default,
    /// Error branch routed by the exception policy.
    Exception,
}

impl Port {
    /// Encode into the wire/persisted form (`branch_<i>`, `default`,
    /// `branch_error`).
    #[must_use]
    pub fn encode(&self) -> String {
        match self {
            Port::Branch(i) => format!("branch_{i}"),
            Port::Default => "default".to_string(),
            Port::Exception => "branch_error".to_string(),
        }
    }

    /// Decode the wire form. Returns `None` for unrecognized strings.
    #[must_use]
    pub fn decode(s: &str) -> Option<Self> {
        match s {
            "default" => Some(Port::Default),
            "branch_error" => Some(Port::Exception),
            _ => s
                .strip_prefix("branch_")
                .and_then(|rest| rest.parse::<usize>().ok())
                .map(Port::Branch),
        }
    }
}

impl fmt::Display for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.encode())
    }
}
