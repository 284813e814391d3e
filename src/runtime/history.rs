//! Execution history records.
//!
//! History is the queryable audit trail of runs and node executions, kept
//! separately from checkpoints: checkpoints exist to resume, history exists
//! to inspect. The engine writes records as the run progresses.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use miette::Diagnostic;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use thiserror::Error;

use crate::runtime::checkpoint::RunStatus;
use crate::types::NodeKey;
use crate::utils::ValueMap;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub execute_id: i64,
    /// Root execute ID; differs for nested scope runs.
    pub root_execute_id: i64,
    pub status: RunStatus,
    pub input: ValueMap,
    pub output: Option<ValueMap>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub execute_id: i64,
    pub node_key: NodeKey,
    pub status: RunStatus,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Error, Diagnostic)]
pub enum HistoryError {
    #[error("no run record for execution {execute_id}")]
    #[diagnostic(code(graphloom::history::not_found))]
    NotFound { execute_id: i64 },

    #[error("history backend failure: {0}")]
    #[diagnostic(code(graphloom::history::backend))]
    Backend(String),
}

#[async_trait]
pub trait HistoryStore: Send + Sync {
    async fn create_run(&self, record: RunRecord) -> Result<(), HistoryError>;

    async fn finish_run(
        &self,
        execute_id: i64,
        status: RunStatus,
        output: Option<ValueMap>,
        error: Option<String>,
    ) -> Result<(), HistoryError>;

    async fn record_node(&self, record: NodeRecord) -> Result<(), HistoryError>;

    async fn run(&self, execute_id: i64) -> Result<Option<RunRecord>, HistoryError>;

    async fn nodes(&self, execute_id: i64) -> Result<Vec<NodeRecord>, HistoryError>;
}

#[derive(Default)]
pub struct InMemoryHistoryStore {
    runs: Mutex<FxHashMap<i64, RunRecord>>,
    nodes: Mutex<FxHashMap<i64, Vec<NodeRecord>>>,
}

impl InMemoryHistoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

fn lock_or_recover<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[async_trait]
impl HistoryStore for InMemoryHistoryStore {
    async fn create_run(&self, record: RunRecord) -> Result<(), HistoryError> {
        lock_or_recover(&self.runs).insert(record.execute_id, record);
        Ok(())
    }

    async fn finish_run(
        &self,
        execute_id: i64,
        status: RunStatus,
        output: Option<ValueMap>,
        error: Option<String>,
    ) -> Result<(), HistoryError> {
        let mut runs = lock_or_recover(&self.runs);
        let record = runs
            .get_mut(&execute_id)
            .ok_or(HistoryError::NotFound { execute_id })?;
        record.status = status;
        record.output = output;
        record.error = error;
        record.finished_at = Some(Utc::now());
        Ok(())
    }

    async fn record_node(&self, record: NodeRecord) -> Result<(), HistoryError> {
        lock_or_recover(&self.nodes)
            .entry(record.execute_id)
            .or_default()
            .push(record);
        Ok(())
    }

    async fn run(&self, execute_id: i64) -> Result<Option<RunRecord>, HistoryError> {
        Ok(lock_or_recover(&self.runs).get(&execute_id).cloned())
    }

    async fn nodes(&self, execute_id: i64) -> Result<Vec<NodeRecord>, HistoryError> {
        Ok(lock_or_recover(&self.nodes)
            .get(&execute_id)
            .cloned()
            .unwrap_or_default())
    }
}
