//! Run-time machinery: compiled scopes, state, checkpoints, interrupts.
//!
//! The [`engine`] module compiles a schema and drives it; [`state`] holds the
//! serializable progress record; [`checkpoint`] persists it across
//! suspensions; [`interrupt`] describes what a suspended run is waiting for;
//! [`composite`] hosts nested scopes; [`wrapper`] applies per-node policy;
//! [`context`] and [`history`] carry the ambient services every node sees.

pub mod checkpoint;
pub mod composite;
pub mod context;
pub mod engine;
pub mod history;
pub mod interrupt;
pub mod state;
pub mod wrapper;

pub use checkpoint::{
    Checkpoint, CheckpointError, CheckpointStore, InMemoryCheckpointStore, ResumeLock, RunStatus,
};
pub use context::{
    CancelHandle, CancelToken, ExecutionContext, IdGenerator, InMemoryVariableStore,
    SequentialIdGenerator, UuidIdGenerator, VariableStore, VariableStoreError, cancel_pair,
};
pub use engine::{EngineError, RunOutcome, WorkflowApp, WorkflowAppBuilder, compile};
pub use history::{HistoryError, HistoryStore, InMemoryHistoryStore, NodeRecord, RunRecord};
pub use interrupt::{InterruptEvent, InterruptKind, NodePath, PathSeg, ResumePlan};
pub use state::{NestedWorkflowState, RunState, SharedState, StateError};
