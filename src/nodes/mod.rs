//! Node executors.
//!
//! Every node behavior implements [`NodeExecutor`]. The run loop assembles
//! the node's input map, then calls [`NodeExecutor::invoke`] — or
//! [`NodeExecutor::transform`] when the node consumes its inputs as a chunk
//! stream. A node finishes by producing an output map, selecting a branch
//! port, or suspending the run with an interrupt.

pub mod aggregator;
pub mod emitter;
pub mod qa;
pub mod receiver;
pub mod selector;
pub mod template;

use async_trait::async_trait;
use miette::Diagnostic;
use rustc_hash::FxHashMap;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;

use crate::resolver::ResolverError;
use crate::runtime::context::{ExecutionContext, VariableStoreError};
use crate::runtime::interrupt::{InterruptEvent, InterruptKind};
use crate::runtime::state::StateError;
use crate::types::{NodeKey, Port};
use crate::utils::{JsonError, ValueMap};

pub use aggregator::AggregatorExecutor;
pub use emitter::EmitterExecutor;
pub use qa::{AnswerExtractor, IntentDetector, QaExecutor};
pub use receiver::ReceiverExecutor;
pub use selector::SelectorExecutor;

/// Suffix a streaming producer appends to a string field's final chunk.
/// Input preprocessing strips it before the consumer sees the value.
pub const FINISH_MARKER: &str = "\u{001F}";

#[derive(Debug, Error, Diagnostic)]
pub enum NodeError {
    #[error("node '{node}' failed: {message}")]
    #[diagnostic(code(graphloom::node::execution))]
    Execution { node: NodeKey, message: String },

    #[error("node '{node}' is misconfigured: {reason}")]
    #[diagnostic(code(graphloom::node::invalid_config))]
    InvalidConfig { node: NodeKey, reason: String },

    #[error("node '{node}' is missing required input '{field}'")]
    #[diagnostic(code(graphloom::node::missing_input))]
    MissingInput { node: NodeKey, field: String },

    #[error(transparent)]
    #[diagnostic(transparent)]
    Resolver(#[from] ResolverError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Json(#[from] JsonError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Variables(#[from] VariableStoreError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    State(#[from] StateError),

    #[error("node '{node}' timed out after {ms}ms")]
    #[diagnostic(code(graphloom::node::timeout))]
    Timeout { node: NodeKey, ms: u64 },

    #[error("node '{node}' panicked: {message}")]
    #[diagnostic(code(graphloom::node::panicked))]
    Panicked { node: NodeKey, message: String },

    #[error("node '{node}' was cancelled")]
    #[diagnostic(code(graphloom::node::cancelled))]
    Cancelled { node: NodeKey },

    #[error("node invariant violated: {0}")]
    #[diagnostic(code(graphloom::node::internal))]
    Internal(String),
}

/// Why a node invocation suspended.
#[derive(Clone, Debug, PartialEq)]
pub enum Suspension {
    /// A leaf node raised an interrupt of the given kind.
    Event(InterruptKind),
    /// A composite node aggregated per-element interrupts.
    Nested(FxHashMap<usize, InterruptEvent>),
}

/// Result of a successful node invocation.
#[derive(Clone, Debug, PartialEq)]
pub enum NodeOutcome {
    Output(ValueMap),
    /// Output plus an explicit branch selection (selector nodes).
    Routed { port: Port, output: ValueMap },
    Suspend(Suspension),
}

impl NodeOutcome {
    #[must_use]
    pub fn is_suspend(&self) -> bool {
        matches!(self, NodeOutcome::Suspend(_))
    }
}

/// One item on an input chunk stream.
#[derive(Clone, Debug, PartialEq)]
pub enum StreamItem {
    /// Incremental values, keyed like the consumer's assembled input map.
    /// String values are deltas to concatenate; other values replace.
    Delta(ValueMap),
    /// The named upstream producer finished; no further deltas from it.
    SourceFinished(NodeKey),
}

/// Receiving end of a chunk stream.
pub struct StreamReader {
    rx: flume::Receiver<StreamItem>,
}

/// Sending end of a chunk stream.
#[derive(Clone)]
pub struct StreamWriter {
    tx: flume::Sender<StreamItem>,
}

#[must_use]
pub fn stream_channel() -> (StreamWriter, StreamReader) {
    let (tx, rx) = flume::unbounded();
    (StreamWriter { tx }, StreamReader { rx })
}

impl StreamWriter {
    /// Send an item; a dropped reader ends the stream silently.
    pub fn send(&self, item: StreamItem) {
        let _ = self.tx.send(item);
    }
}

impl StreamReader {
    /// A reader over pre-recorded items. Retries replay the same recording
    /// so every attempt sees the full stream.
    #[must_use]
    pub fn replay(items: Vec<StreamItem>) -> StreamReader {
        let (writer, reader) = stream_channel();
        for item in items {
            writer.send(item);
        }
        reader
    }

    /// Next item, or `None` once all writers are dropped.
    pub async fn next(&self) -> Option<StreamItem> {
        self.rx.recv_async().await.ok()
    }

    /// Drain the stream into one accumulated map.
    pub async fn collect_map(self) -> ValueMap {
        let mut acc = ValueMap::new();
        while let Some(item) = self.next().await {
            if let StreamItem::Delta(delta) = item {
                merge_delta(&mut acc, delta);
            }
        }
        trim_finish_markers(&mut acc);
        acc
    }
}

/// Merge a delta into an accumulator: strings concatenate, objects merge
/// recursively, everything else replaces.
pub fn merge_delta(acc: &mut ValueMap, delta: ValueMap) {
    for (key, value) in delta {
        match (acc.get_mut(&key), value) {
            (Some(Value::String(existing)), Value::String(chunk)) => {
                existing.push_str(&chunk);
            }
            (Some(Value::Object(existing)), Value::Object(incoming)) => {
                merge_delta(existing, incoming);
            }
            (slot, value) => {
                if let Some(slot) = slot {
                    *slot = value;
                } else {
                    acc.insert(key, value);
                }
            }
        }
    }
}

/// Strip trailing [`FINISH_MARKER`]s from every string leaf in place.
pub fn trim_finish_markers(map: &mut ValueMap) {
    for value in map.values_mut() {
        trim_value(value);
    }
}

fn trim_value(value: &mut Value) {
    match value {
        Value::String(s) => {
            while let Some(trimmed) = s.strip_suffix(FINISH_MARKER) {
                let len = trimmed.len();
                s.truncate(len);
            }
        }
        Value::Object(map) => trim_finish_markers(map),
        Value::Array(items) => {
            for item in items {
                trim_value(item);
            }
        }
        _ => {}
    }
}

/// Behavior of a single node.
#[async_trait]
pub trait NodeExecutor: Send + Sync {
    /// Run with a fully assembled input map.
    async fn invoke(
        &self,
        ctx: &ExecutionContext,
        input: ValueMap,
    ) -> Result<NodeOutcome, NodeError>;

    /// Run with inputs arriving as a chunk stream. The default collects the
    /// stream and delegates to [`NodeExecutor::invoke`].
    async fn transform(
        &self,
        ctx: &ExecutionContext,
        stream: StreamReader,
    ) -> Result<NodeOutcome, NodeError> {
        let input = stream.collect_map().await;
        self.invoke(ctx, input).await
    }
}

/// Adapter turning a plain closure into a lambda-node executor.
///
/// # Example
///
/// ```rust
/// use graphloom::nodes::{Lambda, NodeOutcome};
/// use serde_json::json;
///
/// let upper = Lambda::new(|_, mut input| {
///     if let Some(v) = input.get("text").and_then(|v| v.as_str()) {
///         let up = v.to_uppercase();
///         input.insert("text".into(), json!(up));
///     }
///     Ok(input)
/// });
/// ```
#[derive(Clone)]
pub struct Lambda {
    func: Arc<dyn Fn(&ExecutionContext, ValueMap) -> Result<ValueMap, NodeError> + Send + Sync>,
}

impl Lambda {
    pub fn new<F>(func: F) -> Self
    where
        F: Fn(&ExecutionContext, ValueMap) -> Result<ValueMap, NodeError> + Send + Sync + 'static,
    {
        Lambda {
            func: Arc::new(func),
        }
    }
}

#[async_trait]
impl NodeExecutor for Lambda {
    async fn invoke(
        &self,
        ctx: &ExecutionContext,
        input: ValueMap,
    ) -> Result<NodeOutcome, NodeError> {
        (self.func)(ctx, input).map(NodeOutcome::Output)
    }
}
