//! Interrupt events and resume plans.
//!
//! When an interactive node asks for input, the run suspends and surfaces an
//! [`InterruptEvent`] describing what is needed and exactly where in the node
//! tree the request originated. A later resume carries the event ID plus the
//! caller's data; the engine turns that pair into a [`ResumePlan`] that is
//! threaded down through composite scopes until it reaches the waiting node.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::types::{NodeKey, NodeType};

/// One step in a node path: either a node key within a scope, or an index
/// into a composite node's per-element runs.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum PathSeg {
    Node(NodeKey),
    Index(usize),
}

/// Absolute location of a node, from the root scope down.
///
/// A node directly in the root scope has a single [`PathSeg::Node`] segment.
/// A node inside the third element of a batch named `b` has the path
/// `[Node(b), Index(2), Node(inner)]`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodePath(pub Vec<PathSeg>);

impl NodePath {
    #[must_use]
    pub fn root(node: NodeKey) -> Self {
        NodePath(vec![PathSeg::Node(node)])
    }

    /// Prefix this path with a composite node and element index.
    #[must_use]
    pub fn nested_under(mut self, composite: NodeKey, index: usize) -> Self {
        let mut segs = vec![PathSeg::Node(composite), PathSeg::Index(index)];
        segs.append(&mut self.0);
        NodePath(segs)
    }

    /// First node key on the path, if any.
    #[must_use]
    pub fn head(&self) -> Option<&NodeKey> {
        match self.0.first() {
            Some(PathSeg::Node(key)) => Some(key),
            _ => None,
        }
    }

    /// Split off the leading `Node(..), Index(..)` pair, returning the index
    /// and the remainder. `None` when the path terminates in this scope.
    #[must_use]
    pub fn descend(&self) -> Option<(usize, NodePath)> {
        match (self.0.first(), self.0.get(1)) {
            (Some(PathSeg::Node(_)), Some(PathSeg::Index(i))) => {
                Some((*i, NodePath(self.0[2..].to_vec())))
            }
            _ => None,
        }
    }

    #[must_use]
    pub fn is_leaf(&self) -> bool {
        self.0.len() == 1
    }
}

impl fmt::Display for NodePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, seg) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, "/")?;
            }
            match seg {
                PathSeg::Node(key) => write!(f, "{key}")?,
                PathSeg::Index(idx) => write!(f, "{idx}")?,
            }
        }
        Ok(())
    }
}

/// What an interrupting node is waiting for.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InterruptKind {
    /// An input-receiver node wants structured data from the caller.
    InputRequired { prompt: String },
    /// A question node wants an answer; `data` is the serialized conversation
    /// so far (questions asked, answers given, choices offered).
    Question { data: String },
    /// A composite node aggregating interrupts from its element runs. The
    /// per-element events are in [`InterruptEvent::nested`].
    Composite,
}

/// A single suspension point surfaced to the caller.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InterruptEvent {
    /// Unique ID the caller passes back when resuming.
    pub id: i64,
    pub node_key: NodeKey,
    pub node_type: NodeType,
    /// Absolute path from the root scope to the interrupting node.
    pub node_path: NodePath,
    pub kind: InterruptKind,
    /// For composite events: per-element-index interrupts still outstanding.
    #[serde(default, skip_serializing_if = "FxHashMap::is_empty")]
    pub nested: FxHashMap<usize, InterruptEvent>,
}

impl InterruptEvent {
    #[must_use]
    pub fn new(id: i64, node_key: NodeKey, node_type: NodeType, kind: InterruptKind) -> Self {
        let node_path = NodePath::root(node_key.clone());
        InterruptEvent {
            id,
            node_key,
            node_type,
            node_path,
            kind,
            nested: FxHashMap::default(),
        }
    }

    /// Build a composite event wrapping per-index element interrupts. Paths
    /// of the nested events (and their descendants) are re-rooted under the
    /// composite node.
    #[must_use]
    pub fn composite(
        id: i64,
        node_key: NodeKey,
        node_type: NodeType,
        nested: FxHashMap<usize, InterruptEvent>,
    ) -> Self {
        let nested = nested
            .into_iter()
            .map(|(idx, mut ev)| {
                let prefix = [PathSeg::Node(node_key.clone()), PathSeg::Index(idx)];
                ev.prefix_path(&prefix);
                (idx, ev)
            })
            .collect();
        InterruptEvent {
            id,
            node_key: node_key.clone(),
            node_type,
            node_path: NodePath::root(node_key),
            kind: InterruptKind::Composite,
            nested,
        }
    }

    fn prefix_path(&mut self, prefix: &[PathSeg]) {
        let mut segs = prefix.to_vec();
        segs.append(&mut self.node_path.0);
        self.node_path.0 = segs;
        for sub in self.nested.values_mut() {
            sub.prefix_path(prefix);
        }
    }

    /// Find the event with the given ID in this event or its descendants.
    #[must_use]
    pub fn locate(&self, event_id: i64) -> Option<&InterruptEvent> {
        if self.id == event_id {
            return Some(self);
        }
        self.nested.values().find_map(|ev| ev.locate(event_id))
    }

    /// The nested event a resume of `self` with the given inner event ID
    /// targets, along with its element index.
    #[must_use]
    pub fn find_nested(&self, event_id: i64) -> Option<(usize, &InterruptEvent)> {
        self.nested
            .iter()
            .find(|(_, ev)| ev.id == event_id || ev.find_nested(event_id).is_some())
            .map(|(idx, ev)| (*idx, ev))
    }
}

/// A resume request routed toward a suspended node.
///
/// Composite executors consult the plan: when the leading path segments name
/// the composite and an element index, the plan's remainder is handed to that
/// element's restored inner run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResumePlan {
    /// ID of the interrupt event being answered.
    pub event_id: i64,
    /// Caller-supplied resume payload (answer text or serialized input).
    pub data: String,
    /// Remaining path from the current scope to the waiting node.
    pub path: NodePath,
}

impl ResumePlan {
    /// Narrow the plan to the scope of one composite element, if it targets
    /// the given composite. Returns the element index and the inner plan.
    #[must_use]
    pub fn descend_into(&self, composite: &NodeKey) -> Option<(usize, ResumePlan)> {
        if self.path.head() != Some(composite) {
            return None;
        }
        let (index, rest) = self.path.descend()?;
        Some((
            index,
            ResumePlan {
                event_id: self.event_id,
                data: self.data.clone(),
                path: rest,
            },
        ))
    }

    /// Whether the plan terminates at the given node in the current scope.
    #[must_use]
    pub fn targets(&self, node: &NodeKey) -> bool {
        self.path.is_leaf() && self.path.head() == Some(node)
    }
}
