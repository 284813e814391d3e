//! Per-run execution context handed to every node invocation.

use async_trait::async_trait;
use miette::Diagnostic;
use serde_json::Value;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::watch;
use uuid::Uuid;

use crate::event_bus::RunEvent;
use crate::runtime::state::SharedState;
use crate::schema::field::VarKind;
use crate::types::{FieldPath, NodeKey};
use crate::utils::{ValueMap, get_map_value, set_map_value};

/// Generates execute and interrupt-event IDs.
pub trait IdGenerator: Send + Sync {
    fn next_id(&self) -> i64;
}

/// Default generator: positive 63-bit IDs drawn from random UUIDs.
#[derive(Debug, Default)]
pub struct UuidIdGenerator;

impl IdGenerator for UuidIdGenerator {
    fn next_id(&self) -> i64 {
        let id = Uuid::new_v4().as_u128() as i64;
        id.unsigned_abs().min(i64::MAX as u64) as i64
    }
}

/// Monotonic generator, handy for deterministic tests.
#[derive(Debug)]
pub struct SequentialIdGenerator {
    next: AtomicI64,
}

impl SequentialIdGenerator {
    #[must_use]
    pub fn starting_at(first: i64) -> Self {
        Self {
            next: AtomicI64::new(first),
        }
    }
}

impl Default for SequentialIdGenerator {
    fn default() -> Self {
        Self::starting_at(1)
    }
}

impl IdGenerator for SequentialIdGenerator {
    fn next_id(&self) -> i64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

/// Cooperative cancellation: the run loop holds the [`CancelHandle`], every
/// node invocation holds a cloned [`CancelToken`].
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

#[derive(Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

#[must_use]
pub fn cancel_pair() -> (CancelHandle, CancelToken) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, CancelToken { rx })
}

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

impl CancelToken {
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves when cancellation fires. Never resolves if the handle is
    /// dropped without cancelling.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        if *rx.borrow() {
            return;
        }
        while rx.changed().await.is_ok() {
            if *rx.borrow() {
                return;
            }
        }
        std::future::pending::<()>().await;
    }
}

#[derive(Debug, Error, Diagnostic)]
pub enum VariableStoreError {
    #[error("variable kind {kind:?} is not served by this store")]
    #[diagnostic(code(graphloom::variables::unsupported_kind))]
    UnsupportedKind { kind: VarKind },

    #[error("variable store backend failure: {0}")]
    #[diagnostic(code(graphloom::variables::backend))]
    Backend(String),
}

/// Read/write access to global variables referenced by workflow fields.
///
/// Parent intermediate variables are not served here; the run loop reads
/// those from the enclosing loop's state.
#[async_trait]
pub trait VariableStore: Send + Sync {
    async fn get(&self, kind: VarKind, path: &FieldPath)
    -> Result<Option<Value>, VariableStoreError>;

    async fn set(
        &self,
        kind: VarKind,
        path: &FieldPath,
        value: Value,
    ) -> Result<(), VariableStoreError>;
}

/// In-memory variable store, one namespace per [`VarKind`].
#[derive(Default)]
pub struct InMemoryVariableStore {
    system: Mutex<ValueMap>,
    user: Mutex<ValueMap>,
    app: Mutex<ValueMap>,
}

impl InMemoryVariableStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn namespace(&self, kind: VarKind) -> Result<&Mutex<ValueMap>, VariableStoreError> {
        match kind {
            VarKind::GlobalSystem => Ok(&self.system),
            VarKind::GlobalUser => Ok(&self.user),
            VarKind::GlobalApp => Ok(&self.app),
            VarKind::ParentIntermediate => Err(VariableStoreError::UnsupportedKind { kind }),
        }
    }
}

#[async_trait]
impl VariableStore for InMemoryVariableStore {
    async fn get(
        &self,
        kind: VarKind,
        path: &FieldPath,
    ) -> Result<Option<Value>, VariableStoreError> {
        let ns = self.namespace(kind)?;
        let guard = match ns.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        Ok(get_map_value(&guard, path).cloned())
    }

    async fn set(
        &self,
        kind: VarKind,
        path: &FieldPath,
        value: Value,
    ) -> Result<(), VariableStoreError> {
        let ns = self.namespace(kind)?;
        let mut guard = match ns.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        set_map_value(&mut guard, path, value)
            .map_err(|e| VariableStoreError::Backend(e.to_string()))
    }
}

/// Everything a node invocation can reach at run time.
///
/// Cloning is cheap; the run loop clones one context per node and stamps the
/// node key via [`ExecutionContext::for_node`].
#[derive(Clone)]
pub struct ExecutionContext {
    /// Execute ID of the current scope's run.
    pub execute_id: i64,
    /// Execute ID of the outermost run, stable across nested scopes.
    pub root_execute_id: i64,
    /// Node currently being invoked.
    pub node_key: NodeKey,
    pub state: SharedState,
    pub events: flume::Sender<RunEvent>,
    pub cancel: CancelToken,
    pub id_gen: Arc<dyn IdGenerator>,
    pub variables: Arc<dyn VariableStore>,
}

impl ExecutionContext {
    #[must_use]
    pub fn for_node(&self, node_key: NodeKey) -> Self {
        let mut ctx = self.clone();
        ctx.node_key = node_key;
        ctx
    }

    /// Fire-and-forget event emission; a closed bus never fails a node.
    pub fn emit(&self, event: RunEvent) {
        let _ = self.events.send(event);
    }

    pub fn emit_delta(&self, field: impl Into<String>, delta: Value) {
        self.emit(RunEvent::stream_delta(
            self.execute_id,
            self.node_key.clone(),
            field,
            delta,
        ));
    }
}
