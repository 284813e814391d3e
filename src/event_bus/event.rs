use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::runtime::interrupt::InterruptEvent;
use crate::types::{NodeKey, NodeType};

/// Lifecycle and streaming events emitted during a workflow run.
///
/// Every event carries the execute ID so sinks can demultiplex events from
/// nested scopes and concurrent runs.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub enum RunEvent {
    NodeStart {
        execute_id: i64,
        node_key: NodeKey,
        node_type: NodeType,
        timestamp: DateTime<Utc>,
    },
    NodeEnd {
        execute_id: i64,
        node_key: NodeKey,
        node_type: NodeType,
        timestamp: DateTime<Utc>,
    },
    NodeError {
        execute_id: i64,
        node_key: NodeKey,
        message: String,
        /// Whether the node's exception policy absorbed the failure.
        recovered: bool,
        timestamp: DateTime<Utc>,
    },
    /// Incremental output produced by a streaming node.
    StreamDelta {
        execute_id: i64,
        node_key: NodeKey,
        field: String,
        delta: Value,
        timestamp: DateTime<Utc>,
    },
    /// The run suspended on an interrupt.
    Suspended {
        execute_id: i64,
        event: InterruptEvent,
        timestamp: DateTime<Utc>,
    },
    /// The run reached the exit node.
    Completed {
        execute_id: i64,
        timestamp: DateTime<Utc>,
    },
    /// The run failed terminally.
    Failed {
        execute_id: i64,
        message: String,
        timestamp: DateTime<Utc>,
    },
}

impl RunEvent {
    pub fn node_start(execute_id: i64, node_key: NodeKey, node_type: NodeType) -> Self {
        RunEvent::NodeStart {
            execute_id,
            node_key,
            node_type,
            timestamp: Utc::now(),
        }
    }

    pub fn node_end(execute_id: i64, node_key: NodeKey, node_type: NodeType) -> Self {
        RunEvent::NodeEnd {
            execute_id,
            node_key,
            node_type,
            timestamp: Utc::now(),
        }
    }

    pub fn node_error(
        execute_id: i64,
        node_key: NodeKey,
        message: impl Into<String>,
        recovered: bool,
    ) -> Self {
        RunEvent::NodeError {
            execute_id,
            node_key,
            message: message.into(),
            recovered,
            timestamp: Utc::now(),
        }
    }

    pub fn stream_delta(
        execute_id: i64,
        node_key: NodeKey,
        field: impl Into<String>,
        delta: Value,
    ) -> Self {
        RunEvent::StreamDelta {
            execute_id,
            node_key,
            field: field.into(),
            delta,
            timestamp: Utc::now(),
        }
    }

    pub fn suspended(execute_id: i64, event: InterruptEvent) -> Self {
        RunEvent::Suspended {
            execute_id,
            event,
            timestamp: Utc::now(),
        }
    }

    pub fn completed(execute_id: i64) -> Self {
        RunEvent::Completed {
            execute_id,
            timestamp: Utc::now(),
        }
    }

    pub fn failed(execute_id: i64, message: impl Into<String>) -> Self {
        RunEvent::Failed {
            execute_id,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    /// The execute ID this event belongs to.
    #[must_use]
    pub fn execute_id(&self) -> i64 {
        match self {
            RunEvent::NodeStart { execute_id, .. }
            | RunEvent::NodeEnd { execute_id, .. }
            | RunEvent::NodeError { execute_id, .. }
            | RunEvent::StreamDelta { execute_id, .. }
            | RunEvent::Suspended { execute_id, .. }
            | RunEvent::Completed { execute_id, .. }
            | RunEvent::Failed { execute_id, .. } => *execute_id,
        }
    }

    /// Terminal events end the run's event stream.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunEvent::Suspended { .. } | RunEvent::Completed { .. } | RunEvent::Failed { .. }
        )
    }
}

impl fmt::Display for RunEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunEvent::NodeStart { node_key, .. } => write!(f, "[{node_key}] start"),
            RunEvent::NodeEnd { node_key, .. } => write!(f, "[{node_key}] end"),
            RunEvent::NodeError {
                node_key,
                message,
                recovered,
                ..
            } => write!(
                f,
                "[{node_key}] error ({}): {message}",
                if *recovered { "recovered" } else { "fatal" }
            ),
            RunEvent::StreamDelta { node_key, field, .. } => {
                write!(f, "[{node_key}] stream delta on '{field}'")
            }
            RunEvent::Suspended { event, .. } => {
                write!(f, "suspended on '{}'", event.node_key)
            }
            RunEvent::Completed { execute_id, .. } => write!(f, "run {execute_id} completed"),
            RunEvent::Failed { execute_id, message, .. } => {
                write!(f, "run {execute_id} failed: {message}")
            }
        }
    }
}
