//! Checkpoint persistence and the resume lock.
//!
//! A checkpoint is the serialized [`RunState`] of a suspended run plus its
//! status. Resuming is guarded by a per-execution lock so that concurrent
//! resume attempts against the same suspended run cannot both proceed: the
//! first caller flips the run to `Running` and records which interrupt event
//! it is answering; later callers observe the busy lock and fail fast.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use miette::Diagnostic;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use thiserror::Error;

use crate::runtime::interrupt::InterruptEvent;
use crate::runtime::state::RunState;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Suspended,
    Succeeded,
    Failed,
    Cancelled,
}

impl RunStatus {
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Succeeded | RunStatus::Failed | RunStatus::Cancelled
        )
    }
}

/// A persisted snapshot of one run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub execute_id: i64,
    pub status: RunStatus,
    pub state: RunState,
    /// Interrupt event a resume currently holds the lock for, if any.
    pub resuming_event_id: Option<i64>,
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    #[must_use]
    pub fn new(execute_id: i64, status: RunStatus, state: RunState) -> Self {
        Checkpoint {
            execute_id,
            status,
            state,
            resuming_event_id: None,
            updated_at: Utc::now(),
        }
    }
}

/// Outcome of a resume-lock attempt.
#[derive(Clone, Debug, PartialEq)]
pub enum ResumeLock {
    Acquired,
    /// Another resume already holds the lock for the given event.
    Busy { resuming_event_id: i64 },
    /// The run is not in a resumable state.
    WrongStatus { status: RunStatus },
}

#[derive(Debug, Error, Diagnostic)]
pub enum CheckpointError {
    #[error("no checkpoint recorded for execution {execute_id}")]
    #[diagnostic(code(graphloom::checkpoint::not_found))]
    NotFound { execute_id: i64 },

    #[error("checkpoint backend failure: {0}")]
    #[diagnostic(code(graphloom::checkpoint::backend))]
    Backend(String),
}

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn save(&self, checkpoint: Checkpoint) -> Result<(), CheckpointError>;

    async fn load(&self, execute_id: i64) -> Result<Option<Checkpoint>, CheckpointError>;

    async fn set_status(&self, execute_id: i64, status: RunStatus) -> Result<(), CheckpointError>;

    /// The oldest outstanding interrupt event of a suspended run.
    async fn first_interrupt_event(
        &self,
        execute_id: i64,
    ) -> Result<Option<InterruptEvent>, CheckpointError>;

    /// Atomically claim the right to resume. Succeeds only when the run is
    /// suspended and no other resume holds the lock; on success the run is
    /// marked running with `event_id` recorded.
    async fn try_lock_resume(
        &self,
        execute_id: i64,
        event_id: i64,
    ) -> Result<ResumeLock, CheckpointError>;

    /// Drop the resume lock, leaving status untouched.
    async fn release_resume_lock(&self, execute_id: i64) -> Result<(), CheckpointError>;
}

/// Process-local checkpoint store.
#[derive(Default)]
pub struct InMemoryCheckpointStore {
    checkpoints: Mutex<FxHashMap<i64, Checkpoint>>,
}

impl InMemoryCheckpointStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn with_map<R>(&self, f: impl FnOnce(&mut FxHashMap<i64, Checkpoint>) -> R) -> R {
        let mut guard = match self.checkpoints.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn save(&self, mut checkpoint: Checkpoint) -> Result<(), CheckpointError> {
        checkpoint.updated_at = Utc::now();
        self.with_map(|map| {
            // A fresh save keeps an already-held resume lock.
            if checkpoint.resuming_event_id.is_none() {
                if let Some(existing) = map.get(&checkpoint.execute_id) {
                    checkpoint.resuming_event_id = existing.resuming_event_id;
                }
            }
            map.insert(checkpoint.execute_id, checkpoint);
        });
        Ok(())
    }

    async fn load(&self, execute_id: i64) -> Result<Option<Checkpoint>, CheckpointError> {
        Ok(self.with_map(|map| map.get(&execute_id).cloned()))
    }

    async fn set_status(&self, execute_id: i64, status: RunStatus) -> Result<(), CheckpointError> {
        self.with_map(|map| match map.get_mut(&execute_id) {
            Some(cp) => {
                cp.status = status;
                cp.updated_at = Utc::now();
                Ok(())
            }
            None => Err(CheckpointError::NotFound { execute_id }),
        })
    }

    async fn first_interrupt_event(
        &self,
        execute_id: i64,
    ) -> Result<Option<InterruptEvent>, CheckpointError> {
        Ok(self.with_map(|map| {
            map.get(&execute_id)
                .and_then(|cp| cp.state.first_interrupt_event().cloned())
        }))
    }

    async fn try_lock_resume(
        &self,
        execute_id: i64,
        event_id: i64,
    ) -> Result<ResumeLock, CheckpointError> {
        self.with_map(|map| match map.get_mut(&execute_id) {
            Some(cp) => {
                if let Some(holder) = cp.resuming_event_id {
                    return Ok(ResumeLock::Busy {
                        resuming_event_id: holder,
                    });
                }
                if cp.status != RunStatus::Suspended {
                    return Ok(ResumeLock::WrongStatus { status: cp.status });
                }
                cp.resuming_event_id = Some(event_id);
                cp.status = RunStatus::Running;
                cp.updated_at = Utc::now();
                Ok(ResumeLock::Acquired)
            }
            None => Err(CheckpointError::NotFound { execute_id }),
        })
    }

    async fn release_resume_lock(&self, execute_id: i64) -> Result<(), CheckpointError> {
        self.with_map(|map| match map.get_mut(&execute_id) {
            Some(cp) => {
                cp.resuming_event_id = None;
                cp.updated_at = Utc::now();
                Ok(())
            }
            None => Err(CheckpointError::NotFound { execute_id }),
        })
    }
}
