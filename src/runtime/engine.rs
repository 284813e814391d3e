//! Scope compilation and the run loop.
//!
//! [`compile`] turns a validated [`WorkflowSchema`] plus a
//! [`NodeRegistry`] into a [`CompiledScope`]: per-node dependency plans,
//! executors, and stream classification, with inner scopes compiled
//! recursively into their composite executors. [`WorkflowApp`] drives a
//! compiled scope through supersteps: every node whose predecessors have
//! settled runs concurrently, branch routing skips unselected subgraphs,
//! interrupts collect into FIFO events, and the scope either completes with
//! the assembled exit output or suspends on its oldest outstanding event.

use chrono::Utc;
use futures_util::future::{BoxFuture, join_all};
use miette::Diagnostic;
use rustc_hash::{FxHashMap, FxHashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::event_bus::{ChannelSink, EventBus, RunEvent};
use crate::nodes::{
    AggregatorExecutor, EmitterExecutor, NodeError, NodeExecutor, NodeOutcome, QaExecutor,
    ReceiverExecutor, SelectorExecutor, StreamItem, Suspension,
};
use crate::registry::NodeRegistry;
use crate::resolver::{
    DependencyInfo, ResolverError, SourceInfo, build_source_info, derive_inner_outputs,
    resolve_scope,
};
use crate::runtime::checkpoint::{
    Checkpoint, CheckpointError, CheckpointStore, InMemoryCheckpointStore, ResumeLock, RunStatus,
};
use crate::runtime::composite::{BatchExecutor, BreakExecutor, LoopExecutor, SubWorkflowExecutor};
use crate::runtime::context::{
    ExecutionContext, IdGenerator, InMemoryVariableStore, UuidIdGenerator, VariableStore,
    cancel_pair,
};
use crate::runtime::history::{
    HistoryError, HistoryStore, InMemoryHistoryStore, NodeRecord, RunRecord,
};
use crate::runtime::interrupt::{InterruptEvent, InterruptKind};
use crate::runtime::state::{RunState, SharedState};
use crate::runtime::wrapper::{NodeInput, WrappedOutcome, run_node};
use crate::schema::config::ExceptionConfig;
use crate::schema::{
    Connection, NodeConfig, NodeSchema, SchemaError, TypeInfo, VarKind, WorkflowSchema,
};
use crate::types::{NodeKey, NodeType, Port};
use crate::utils::{ValueMap, get_map_value, set_map_value};

/// Errors raised while compiling or running a workflow.
#[derive(Debug, Error, Diagnostic)]
pub enum EngineError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Resolver(#[from] ResolverError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Node(#[from] NodeError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    History(#[from] HistoryError),

    #[error("no executor registered under name '{name}'")]
    #[diagnostic(
        code(graphloom::engine::unknown_executor),
        help("Register the executor on the NodeRegistry before building the app.")
    )]
    UnknownExecutor { name: String },

    #[error("node '{key}' carries a synthetic entry/exit configuration")]
    #[diagnostic(code(graphloom::engine::synthetic_config))]
    SyntheticConfig { key: NodeKey },

    #[error("run {execute_id} stalled; unrunnable nodes: {pending}")]
    #[diagnostic(
        code(graphloom::engine::stalled),
        help("Check for dependency cycles or references to never-settling nodes.")
    )]
    Stalled { execute_id: i64, pending: String },

    #[error("run {execute_id} was cancelled")]
    #[diagnostic(code(graphloom::engine::cancelled))]
    Cancelled { execute_id: i64 },

    #[error("run {execute_id} is not suspended (status {status:?})")]
    #[diagnostic(code(graphloom::engine::not_suspended))]
    NotSuspended { execute_id: i64, status: RunStatus },

    #[error("run {execute_id} has no answerable interrupt event {event_id}")]
    #[diagnostic(
        code(graphloom::engine::unknown_interrupt_event),
        help("Only the oldest outstanding event (or one nested within it) can be resumed.")
    )]
    UnknownInterruptEvent { execute_id: i64, event_id: i64 },

    #[error("event {event_id} of run {execute_id} aggregates several pending interrupts")]
    #[diagnostic(
        code(graphloom::engine::ambiguous_resume),
        help("Resume one of the nested events instead of the composite envelope.")
    )]
    AmbiguousResumeTarget { execute_id: i64, event_id: i64 },

    #[error("run {execute_id} is already being resumed for event {resuming_event_id}")]
    #[diagnostic(code(graphloom::engine::resume_locked))]
    ResumeLocked {
        execute_id: i64,
        resuming_event_id: i64,
    },
}

/// One node ready to run: its dependency plan, executor, and policy.
pub struct CompiledNode {
    pub key: NodeKey,
    pub node_type: NodeType,
    pub deps: DependencyInfo,
    pub executor: Arc<dyn NodeExecutor>,
    pub exception: ExceptionConfig,
    pub input_types: FxHashMap<String, TypeInfo>,
    pub output_types: FxHashMap<String, TypeInfo>,
    /// The node consumes its input as a chunk stream via `transform`.
    pub requires_stream_input: bool,
}

/// A fully compiled workflow scope.
pub struct CompiledScope {
    pub nodes: FxHashMap<NodeKey, CompiledNode>,
    /// Node keys in declaration order, for deterministic scheduling.
    pub order: Vec<NodeKey>,
    /// Dependency plan of the synthetic exit node.
    pub exit_deps: DependencyInfo,
    pub connections: Vec<Connection>,
    /// Source trees of every aggregator in scope, shared with emitters for
    /// run-time stream resolution.
    pub aggregator_sources: Arc<FxHashMap<NodeKey, FxHashMap<String, SourceInfo>>>,
}

/// Validate and compile a workflow schema against a registry.
pub fn compile(
    schema: &WorkflowSchema,
    registry: &NodeRegistry,
) -> Result<Arc<CompiledScope>, EngineError> {
    schema.validate()?;
    compile_scope(schema.clone(), None, registry)
}

fn compile_scope(
    mut schema: WorkflowSchema,
    parent: Option<&WorkflowSchema>,
    registry: &NodeRegistry,
) -> Result<Arc<CompiledScope>, EngineError> {
    // Inner scopes first: derive their exit sources from the hosting
    // composite, resolve them to learn which parent fields must travel
    // inward, append those carry-overs to the composite's own inputs, then
    // compile the inner scope.
    let mut inner: FxHashMap<NodeKey, Arc<CompiledScope>> = FxHashMap::default();
    for i in 0..schema.nodes.len() {
        if schema.nodes[i].sub_schema.is_none() {
            continue;
        }
        let derived = derive_inner_outputs(&schema.nodes[i]);
        let Some(boxed) = schema.nodes[i].sub_schema.clone() else {
            continue;
        };
        let mut sub = *boxed;
        sub.output_sources = derived;

        let key = schema.nodes[i].key.clone();
        let resolution = resolve_scope(&sub, Some(&schema))?;
        for carry in &resolution.carry_overs {
            // References to the composite itself (element values, the
            // element index) are injected by the composite executor, not
            // carried over from the parent scope.
            let self_ref = carry
                .source
                .as_ref_source()
                .and_then(|r| r.from_node.as_ref())
                == Some(&key);
            if !self_ref && !schema.nodes[i].input_sources.contains(carry) {
                schema.nodes[i].input_sources.push(carry.clone());
            }
        }

        let compiled = compile_scope(sub, Some(&schema), registry)?;
        inner.insert(key, compiled);
    }

    let resolution = resolve_scope(&schema, parent)?;

    let mut agg_sources: FxHashMap<NodeKey, FxHashMap<String, SourceInfo>> = FxHashMap::default();
    for node in &schema.nodes {
        if matches!(node.config, NodeConfig::VariableAggregator(_)) {
            let tree = build_source_info(&node.input_sources, &node.input_types, &schema)?;
            agg_sources.insert(node.key.clone(), tree);
        }
    }
    let aggregator_sources = Arc::new(agg_sources);

    let mut nodes: FxHashMap<NodeKey, CompiledNode> = FxHashMap::default();
    let mut order = Vec::with_capacity(schema.nodes.len());
    for node in &schema.nodes {
        let deps = resolution
            .per_node
            .get(&node.key)
            .cloned()
            .unwrap_or_default();
        let executor = build_executor(node, &schema, registry, &aggregator_sources, &inner)?;
        nodes.insert(
            node.key.clone(),
            CompiledNode {
                key: node.key.clone(),
                node_type: node.node_type(),
                deps,
                executor,
                exception: node.exception.clone().unwrap_or_default(),
                input_types: node.input_types.clone(),
                output_types: node.output_types.clone(),
                requires_stream_input: node.stream.require_streaming_input,
            },
        );
        order.push(node.key.clone());
    }

    let exit_deps = resolution
        .per_node
        .get(&NodeKey::exit())
        .cloned()
        .unwrap_or_default();

    Ok(Arc::new(CompiledScope {
        nodes,
        order,
        exit_deps,
        connections: schema.connections,
        aggregator_sources,
    }))
}

fn build_executor(
    node: &NodeSchema,
    schema: &WorkflowSchema,
    registry: &NodeRegistry,
    aggregator_sources: &Arc<FxHashMap<NodeKey, FxHashMap<String, SourceInfo>>>,
    inner: &FxHashMap<NodeKey, Arc<CompiledScope>>,
) -> Result<Arc<dyn NodeExecutor>, EngineError> {
    let inner_scope = |key: &NodeKey| -> Result<Arc<CompiledScope>, EngineError> {
        inner
            .get(key)
            .cloned()
            .ok_or_else(|| SchemaError::MissingSubSchema { key: key.clone() }.into())
    };

    let executor: Arc<dyn NodeExecutor> = match &node.config {
        NodeConfig::Entry | NodeConfig::Exit => {
            return Err(EngineError::SyntheticConfig {
                key: node.key.clone(),
            });
        }
        NodeConfig::Lambda { executor } => {
            registry
                .executor(executor)
                .ok_or_else(|| EngineError::UnknownExecutor {
                    name: executor.clone(),
                })?
        }
        NodeConfig::OutputEmitter(cfg) => {
            let sources = build_source_info(&node.input_sources, &node.input_types, schema)?;
            Arc::new(EmitterExecutor::new(
                cfg.clone(),
                sources,
                aggregator_sources.clone(),
            ))
        }
        NodeConfig::VariableAggregator(cfg) => Arc::new(AggregatorExecutor::new(cfg.clone())),
        NodeConfig::QuestionAnswer(cfg) => Arc::new(QaExecutor::new(
            cfg.clone(),
            registry.answer_extractor(),
            registry.intent_detector(),
        )),
        NodeConfig::InputReceiver(cfg) => Arc::new(ReceiverExecutor::new(cfg.clone())),
        NodeConfig::Selector(cfg) => Arc::new(SelectorExecutor::new(cfg.clone())),
        NodeConfig::Batch(cfg) => Arc::new(BatchExecutor::new(
            node.key.clone(),
            cfg.clone(),
            inner_scope(&node.key)?,
            node.output_sources.clone(),
        )),
        NodeConfig::Loop(cfg) => Arc::new(LoopExecutor::new(
            node.key.clone(),
            cfg.clone(),
            inner_scope(&node.key)?,
            node.output_sources.clone(),
        )),
        NodeConfig::Break => Arc::new(BreakExecutor),
        NodeConfig::SubWorkflow(cfg) => Arc::new(SubWorkflowExecutor::new(
            node.key.clone(),
            cfg.clone(),
            inner_scope(&node.key)?,
            node.output_sources.clone(),
        )),
    };
    Ok(executor)
}

/// How one scope run ended.
pub(crate) enum ScopeOutcome {
    Completed { output: ValueMap, state: RunState },
    Suspended { event: InterruptEvent, state: RunState },
}

/// Run one compiled scope to completion or suspension. Boxed so composite
/// executors can recurse into their inner scopes.
pub(crate) fn execute_scope(
    scope: Arc<CompiledScope>,
    state: RunState,
    ctx: ExecutionContext,
) -> BoxFuture<'static, Result<ScopeOutcome, EngineError>> {
    Box::pin(run_scope(scope, state, ctx))
}

async fn run_scope(
    scope: Arc<CompiledScope>,
    state: RunState,
    mut ctx: ExecutionContext,
) -> Result<ScopeOutcome, EngineError> {
    let shared = SharedState::new(state);
    ctx.state = shared.clone();

    deliver_leaf_resume(&scope, &shared)?;

    // Nodes that suspended during this call; they wait for the next resume.
    let mut suspended: FxHashSet<NodeKey> = FxHashSet::default();

    loop {
        if ctx.cancel.is_cancelled() {
            return Err(EngineError::Cancelled {
                execute_id: ctx.execute_id,
            });
        }

        propagate_skips(&scope, &shared);
        let snapshot = shared.snapshot();

        let ready: Vec<NodeKey> = scope
            .order
            .iter()
            .filter(|key| {
                !snapshot.is_settled(key)
                    && !suspended.contains(*key)
                    && scope.nodes[*key]
                        .deps
                        .execution_predecessors()
                        .iter()
                        .all(|p| snapshot.is_settled(p))
            })
            .cloned()
            .collect();

        if ready.is_empty() {
            if let Some(event) = snapshot.first_interrupt_event() {
                debug!(execute_id = ctx.execute_id, event_id = event.id, "scope suspended");
                return Ok(ScopeOutcome::Suspended {
                    event: event.clone(),
                    state: snapshot,
                });
            }
            let exit_ready = scope
                .exit_deps
                .execution_predecessors()
                .iter()
                .all(|p| snapshot.is_settled(p));
            if exit_ready {
                let output =
                    assemble_input(&scope.exit_deps, &snapshot, ctx.variables.as_ref()).await?;
                return Ok(ScopeOutcome::Completed {
                    output,
                    state: snapshot,
                });
            }
            let pending: Vec<String> = scope
                .order
                .iter()
                .filter(|key| !snapshot.is_settled(key))
                .map(ToString::to_string)
                .collect();
            return Err(EngineError::Stalled {
                execute_id: ctx.execute_id,
                pending: pending.join(", "),
            });
        }

        debug!(execute_id = ctx.execute_id, nodes = ?ready, "running superstep");
        let wave = ready
            .iter()
            .map(|key| run_one(scope.clone(), key.clone(), ctx.clone()));
        let results = join_all(wave).await;

        for (key, result) in results {
            let node = &scope.nodes[&key];
            let wrapped = result?;
            match wrapped.outcome {
                NodeOutcome::Output(output) => {
                    shared.with(|s| {
                        s.record_output(key.clone(), output);
                        s.interrupt_events.retain(|e| e.node_key != key);
                        s.nested.remove(&key);
                    });
                }
                NodeOutcome::Routed { port, output } => {
                    shared.with(|s| {
                        s.record_output(key.clone(), output);
                        s.selected_ports.insert(key.clone(), port);
                        s.interrupt_events.retain(|e| e.node_key != key);
                    });
                }
                NodeOutcome::Suspend(suspension) => {
                    suspended.insert(key.clone());
                    let event = build_interrupt_event(&shared, node, &ctx, suspension);
                    shared.with(|s| s.push_interrupt_event(event));
                }
            }
        }
    }
}

/// Hand a leaf-targeted resume payload to its node before the loop starts.
fn deliver_leaf_resume(scope: &CompiledScope, shared: &SharedState) -> Result<(), EngineError> {
    let plan = shared.with(|s| {
        let leaf = s
            .pending_resume
            .as_ref()
            .is_some_and(|p| p.path.is_leaf());
        if leaf { s.pending_resume.take() } else { None }
    });
    let Some(plan) = plan else { return Ok(()) };
    let Some(target) = plan.path.head().cloned() else {
        return Ok(());
    };
    if let Some(node) = scope.nodes.get(&target) {
        let node_type = node.node_type;
        shared
            .with(|s| s.apply_resume_data(&target, node_type, &plan.data))
            .map_err(NodeError::from)?;
    }
    Ok(())
}

async fn run_one(
    scope: Arc<CompiledScope>,
    key: NodeKey,
    ctx: ExecutionContext,
) -> (NodeKey, Result<WrappedOutcome, NodeError>) {
    let node = &scope.nodes[&key];
    let node_ctx = ctx.for_node(key.clone());
    node_ctx.emit(RunEvent::node_start(
        node_ctx.execute_id,
        key.clone(),
        node.node_type,
    ));

    let result = invoke_node(node, node_ctx.clone()).await;

    match &result {
        Ok(wrapped) => {
            if let Some(message) = &wrapped.recovered_error {
                node_ctx.emit(RunEvent::node_error(
                    node_ctx.execute_id,
                    key.clone(),
                    message,
                    true,
                ));
            }
            node_ctx.emit(RunEvent::node_end(
                node_ctx.execute_id,
                key.clone(),
                node.node_type,
            ));
        }
        Err(err) => {
            warn!(node = %key, error = %err, "node failed");
            node_ctx.emit(RunEvent::node_error(
                node_ctx.execute_id,
                key.clone(),
                err.to_string(),
                false,
            ));
        }
    }
    (key, result)
}

async fn invoke_node(
    node: &CompiledNode,
    ctx: ExecutionContext,
) -> Result<WrappedOutcome, NodeError> {
    let snapshot = ctx.state.snapshot();
    let input = if node.requires_stream_input {
        NodeInput::Stream(replay_items(node, &snapshot, ctx.variables.as_ref()).await?)
    } else {
        let mut input = assemble_input(&node.deps, &snapshot, ctx.variables.as_ref()).await?;
        prefill_declared_inputs(node, &mut input);
        NodeInput::Map(input)
    };
    run_node(
        node.executor.clone(),
        ctx,
        input,
        &node.exception,
        &node.output_types,
    )
    .await
}

/// Assemble a node's input map from settled producer outputs, static values,
/// and variable references. Mappings from skipped producers are omitted.
async fn assemble_input(
    deps: &DependencyInfo,
    state: &RunState,
    variables: &dyn VariableStore,
) -> Result<ValueMap, NodeError> {
    let empty = ValueMap::new();
    let mut input = ValueMap::new();

    for from in deps.full_inputs.iter().chain(&deps.full_indirect_inputs) {
        if state.skipped.contains(from) {
            continue;
        }
        let output = state.node_outputs.get(from).unwrap_or(&empty);
        for (k, v) in output {
            input.insert(k.clone(), v.clone());
        }
    }

    for (from, mappings) in deps.inputs.iter().chain(&deps.indirect_inputs) {
        if state.skipped.contains(from) {
            continue;
        }
        let output = state.node_outputs.get(from).unwrap_or(&empty);
        for mapping in mappings {
            if let Some(value) = mapping.extract(output)? {
                set_map_value(&mut input, &mapping.to_path, value)?;
            }
        }
    }

    for sv in &deps.static_values {
        set_map_value(&mut input, &sv.to_path, sv.value.clone())?;
    }

    for var in &deps.variable_refs {
        let value = match var.kind {
            VarKind::ParentIntermediate => {
                get_map_value(&state.intermediate_vars, &var.from_path).cloned()
            }
            kind => variables.get(kind, &var.from_path).await?,
        };
        if let Some(value) = value {
            set_map_value(&mut input, &var.to_path, value)?;
        }
    }

    Ok(input)
}

/// Nodes that interpret their input positionally get declared-but-absent
/// fields backfilled with type zeros.
fn prefill_declared_inputs(node: &CompiledNode, input: &mut ValueMap) {
    if !matches!(
        node.node_type,
        NodeType::OutputEmitter | NodeType::Selector | NodeType::QuestionAnswer
    ) {
        return;
    }
    for (field, type_info) in &node.input_types {
        input
            .entry(field.clone())
            .or_insert_with(|| type_info.zero());
    }
}

/// Record a stream-consuming node's settled inputs as replayable chunks:
/// one delta per producer followed by that producer's finish notice. The
/// wrapper rebuilds a fresh reader from the recording for every attempt.
async fn replay_items(
    node: &CompiledNode,
    state: &RunState,
    variables: &dyn VariableStore,
) -> Result<Vec<StreamItem>, NodeError> {
    let mut items = Vec::new();
    let empty = ValueMap::new();

    let mut base = ValueMap::new();
    for sv in &node.deps.static_values {
        set_map_value(&mut base, &sv.to_path, sv.value.clone())?;
    }
    for var in &node.deps.variable_refs {
        let value = match var.kind {
            VarKind::ParentIntermediate => {
                get_map_value(&state.intermediate_vars, &var.from_path).cloned()
            }
            kind => variables.get(kind, &var.from_path).await?,
        };
        if let Some(value) = value {
            set_map_value(&mut base, &var.to_path, value)?;
        }
    }
    if !base.is_empty() {
        items.push(StreamItem::Delta(base));
    }

    let mut finished: Vec<NodeKey> = Vec::new();
    for from in node
        .deps
        .full_inputs
        .iter()
        .chain(&node.deps.full_indirect_inputs)
    {
        if state.skipped.contains(from) {
            continue;
        }
        let output = state.node_outputs.get(from).unwrap_or(&empty);
        items.push(StreamItem::Delta(output.clone()));
        finished.push(from.clone());
    }
    for (from, mappings) in node.deps.inputs.iter().chain(&node.deps.indirect_inputs) {
        if state.skipped.contains(from) {
            continue;
        }
        let output = state.node_outputs.get(from).unwrap_or(&empty);
        let mut delta = ValueMap::new();
        for mapping in mappings {
            if let Some(value) = mapping.extract(output)? {
                set_map_value(&mut delta, &mapping.to_path, value)?;
            }
        }
        items.push(StreamItem::Delta(delta));
        finished.push(from.clone());
    }
    for from in finished {
        items.push(StreamItem::SourceFinished(from));
    }

    Ok(items)
}

/// A suspended node re-raising keeps its event ID stable across runs.
fn build_interrupt_event(
    shared: &SharedState,
    node: &CompiledNode,
    ctx: &ExecutionContext,
    suspension: Suspension,
) -> InterruptEvent {
    let existing = shared.with(|s| {
        s.interrupt_events
            .iter()
            .find(|e| e.node_key == node.key)
            .map(|e| e.id)
    });
    let id = existing.unwrap_or_else(|| ctx.id_gen.next_id());
    match suspension {
        Suspension::Event(kind) => InterruptEvent::new(id, node.key.clone(), node.node_type, kind),
        Suspension::Nested(nested) => {
            InterruptEvent::composite(id, node.key.clone(), node.node_type, nested)
        }
    }
}

/// Mark nodes whose every incoming edge is dead as skipped, transitively.
fn propagate_skips(scope: &CompiledScope, shared: &SharedState) {
    shared.with(|state| loop {
        let mut changed = false;
        for key in &scope.order {
            if state.is_settled(key) {
                continue;
            }
            let mut incoming = scope.connections.iter().filter(|c| &c.to == key);
            let mut any = false;
            let all_dead = incoming.all(|c| {
                any = true;
                edge_dead(c, state)
            });
            if any && all_dead {
                debug!(node = %key, "skipping unreachable node");
                state.skipped.insert(key.clone());
                changed = true;
            }
        }
        if !changed {
            break;
        }
    });
}

/// An edge is dead when its source settled without activating it. A routing
/// node activates exactly its selected port; a node that finished without
/// routing activates its portless and default edges.
fn edge_dead(conn: &Connection, state: &RunState) -> bool {
    if state.skipped.contains(&conn.from) {
        return true;
    }
    if !state.executed.contains(&conn.from) && !conn.from.is_entry() {
        return false;
    }
    match (state.selected_ports.get(&conn.from), conn.port) {
        (Some(selected), Some(port)) => port != *selected,
        (Some(_), None) => true,
        (None, Some(Port::Default)) | (None, None) => false,
        (None, Some(_)) => true,
    }
}

/// The result surfaced by [`WorkflowApp::run`] and [`WorkflowApp::resume`].
#[derive(Clone, Debug)]
pub enum RunOutcome {
    Completed {
        execute_id: i64,
        output: ValueMap,
    },
    /// The run checkpointed on its oldest outstanding interrupt.
    Suspended {
        execute_id: i64,
        event: InterruptEvent,
    },
}

impl RunOutcome {
    #[must_use]
    pub fn execute_id(&self) -> i64 {
        match self {
            RunOutcome::Completed { execute_id, .. }
            | RunOutcome::Suspended { execute_id, .. } => *execute_id,
        }
    }
}

/// A compiled workflow bound to its stores and event bus.
///
/// # Examples
///
/// ```rust
/// use graphloom::nodes::Lambda;
/// use graphloom::registry::NodeRegistry;
/// use graphloom::runtime::engine::{RunOutcome, WorkflowApp};
/// use graphloom::schema::config::NodeConfig;
/// use graphloom::schema::{Connection, NodeSchema, WorkflowSchema};
/// use graphloom::schema::{FieldInfo, FieldRef, FieldSource};
/// use graphloom::types::{FieldPath, NodeKey};
/// use serde_json::json;
///
/// # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
/// let schema = WorkflowSchema::new()
///     .with_node(
///         NodeSchema::new("shout", NodeConfig::Lambda { executor: "shout".into() })
///             .with_input_source(FieldInfo::new(
///                 FieldPath::single("text"),
///                 FieldSource::Ref(FieldRef::node_output(
///                     NodeKey::entry(),
///                     FieldPath::single("text"),
///                 )),
///             )),
///     )
///     .with_connection(Connection::new(NodeKey::entry(), "shout"))
///     .with_connection(Connection::new("shout", NodeKey::exit()))
///     .with_output_source(FieldInfo::new(
///         FieldPath::single("text"),
///         FieldSource::Ref(FieldRef::node_output("shout", FieldPath::single("text"))),
///     ));
/// let registry = NodeRegistry::new().with_executor(
///     "shout",
///     Lambda::new(|_, mut input| {
///         if let Some(s) = input.get("text").and_then(|v| v.as_str()) {
///             let up = s.to_uppercase();
///             input.insert("text".into(), json!(up));
///         }
///         Ok(input)
///     }),
/// );
/// let app = WorkflowApp::builder(schema, registry).build()?;
/// let mut input = serde_json::Map::new();
/// input.insert("text".into(), json!("hi"));
/// let RunOutcome::Completed { output, .. } = app.run(input).await? else {
///     unreachable!()
/// };
/// assert_eq!(output["text"], json!("HI"));
/// # Ok(())
/// # }
/// ```
pub struct WorkflowApp {
    scope: Arc<CompiledScope>,
    checkpoints: Arc<dyn CheckpointStore>,
    history: Arc<dyn HistoryStore>,
    variables: Arc<dyn VariableStore>,
    id_gen: Arc<dyn IdGenerator>,
    bus: EventBus,
    node_recorder_started: AtomicBool,
}

impl std::fmt::Debug for WorkflowApp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowApp").finish_non_exhaustive()
    }
}

/// Fluent construction of a [`WorkflowApp`]; unset stores default to their
/// in-memory implementations.
pub struct WorkflowAppBuilder {
    schema: WorkflowSchema,
    registry: NodeRegistry,
    checkpoints: Option<Arc<dyn CheckpointStore>>,
    history: Option<Arc<dyn HistoryStore>>,
    variables: Option<Arc<dyn VariableStore>>,
    id_gen: Option<Arc<dyn IdGenerator>>,
    bus: Option<EventBus>,
}

impl WorkflowAppBuilder {
    #[must_use]
    pub fn with_checkpoint_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoints = Some(store);
        self
    }

    #[must_use]
    pub fn with_history_store(mut self, store: Arc<dyn HistoryStore>) -> Self {
        self.history = Some(store);
        self
    }

    #[must_use]
    pub fn with_variable_store(mut self, store: Arc<dyn VariableStore>) -> Self {
        self.variables = Some(store);
        self
    }

    #[must_use]
    pub fn with_id_generator(mut self, id_gen: Arc<dyn IdGenerator>) -> Self {
        self.id_gen = Some(id_gen);
        self
    }

    #[must_use]
    pub fn with_event_bus(mut self, bus: EventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Compile the schema and assemble the app.
    pub fn build(self) -> Result<WorkflowApp, EngineError> {
        let scope = compile(&self.schema, &self.registry)?;
        Ok(WorkflowApp {
            scope,
            checkpoints: self
                .checkpoints
                .unwrap_or_else(|| Arc::new(InMemoryCheckpointStore::new())),
            history: self
                .history
                .unwrap_or_else(|| Arc::new(InMemoryHistoryStore::new())),
            variables: self
                .variables
                .unwrap_or_else(|| Arc::new(InMemoryVariableStore::new())),
            id_gen: self.id_gen.unwrap_or_else(|| Arc::new(UuidIdGenerator)),
            bus: self.bus.unwrap_or_default(),
            node_recorder_started: AtomicBool::new(false),
        })
    }
}

impl WorkflowApp {
    #[must_use]
    pub fn builder(schema: WorkflowSchema, registry: NodeRegistry) -> WorkflowAppBuilder {
        WorkflowAppBuilder {
            schema,
            registry,
            checkpoints: None,
            history: None,
            variables: None,
            id_gen: None,
            bus: None,
        }
    }

    /// Attach a channel sink and return its receiving end; every event of
    /// subsequent runs (node lifecycle, stream deltas, terminal events) is
    /// forwarded to it.
    #[must_use]
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<RunEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.bus.add_sink(ChannelSink::new(tx));
        rx
    }

    /// Drain node lifecycle events into the history store. Started once,
    /// alongside the bus listener; timestamps come from the events.
    fn ensure_node_recorder(&self) {
        if self.node_recorder_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let (tx, mut rx) = mpsc::unbounded_channel();
        self.bus.add_sink(ChannelSink::new(tx));
        let history = self.history.clone();
        tokio::spawn(async move {
            let mut starts: FxHashMap<(i64, NodeKey), chrono::DateTime<Utc>> =
                FxHashMap::default();
            while let Some(event) = rx.recv().await {
                let record = match event {
                    RunEvent::NodeStart {
                        execute_id,
                        node_key,
                        timestamp,
                        ..
                    } => {
                        starts.insert((execute_id, node_key), timestamp);
                        continue;
                    }
                    RunEvent::NodeEnd {
                        execute_id,
                        node_key,
                        timestamp,
                        ..
                    } => NodeRecord {
                        execute_id,
                        started_at: starts
                            .remove(&(execute_id, node_key.clone()))
                            .unwrap_or(timestamp),
                        node_key,
                        status: RunStatus::Succeeded,
                        error: None,
                        finished_at: Some(timestamp),
                    },
                    RunEvent::NodeError {
                        execute_id,
                        node_key,
                        message,
                        recovered: false,
                        timestamp,
                    } => NodeRecord {
                        execute_id,
                        started_at: starts
                            .remove(&(execute_id, node_key.clone()))
                            .unwrap_or(timestamp),
                        node_key,
                        status: RunStatus::Failed,
                        error: Some(message),
                        finished_at: Some(timestamp),
                    },
                    _ => continue,
                };
                if let Err(err) = history.record_node(record).await {
                    warn!(error = %err, "node history write failed");
                }
            }
        });
    }

    /// Run the workflow from the top with the given input.
    pub async fn run(&self, input: ValueMap) -> Result<RunOutcome, EngineError> {
        let execute_id = self.id_gen.next_id();
        info!(execute_id, "starting workflow run");
        self.bus.listen_for_events();
        self.ensure_node_recorder();
        self.history
            .create_run(RunRecord {
                execute_id,
                root_execute_id: execute_id,
                status: RunStatus::Running,
                input: input.clone(),
                output: None,
                error: None,
                started_at: Utc::now(),
                finished_at: None,
            })
            .await?;

        let mut state = RunState::new();
        state.record_output(NodeKey::entry(), input);
        self.drive(execute_id, state).await
    }

    /// Resume a suspended run by answering one of its interrupt events.
    ///
    /// Only the oldest outstanding event, or a leaf nested within it, can be
    /// answered. Concurrent resumes of the same run are serialized through
    /// the checkpoint store's resume lock.
    pub async fn resume(
        &self,
        execute_id: i64,
        event_id: i64,
        data: impl Into<String>,
    ) -> Result<RunOutcome, EngineError> {
        let data = data.into();
        let checkpoint = self
            .checkpoints
            .load(execute_id)
            .await?
            .ok_or(CheckpointError::NotFound { execute_id })?;
        let Some(first) = checkpoint.state.first_interrupt_event() else {
            return Err(EngineError::NotSuspended {
                execute_id,
                status: checkpoint.status,
            });
        };
        let Some(located) = first.locate(event_id) else {
            return Err(EngineError::UnknownInterruptEvent {
                execute_id,
                event_id,
            });
        };

        // A composite envelope with a single pending element forwards to it.
        let mut target = located;
        while matches!(target.kind, InterruptKind::Composite) {
            let mut pending = target.nested.values();
            match (pending.next(), pending.next()) {
                (Some(only), None) => target = only,
                _ => break,
            }
        }
        if matches!(target.kind, InterruptKind::Composite) {
            return Err(EngineError::AmbiguousResumeTarget {
                execute_id,
                event_id,
            });
        }
        let path = target.node_path.clone();

        match self.checkpoints.try_lock_resume(execute_id, event_id).await? {
            ResumeLock::Acquired => {}
            ResumeLock::Busy { resuming_event_id } => {
                return Err(EngineError::ResumeLocked {
                    execute_id,
                    resuming_event_id,
                });
            }
            ResumeLock::WrongStatus { status } => {
                return Err(EngineError::NotSuspended { execute_id, status });
            }
        }

        info!(execute_id, event_id, "resuming workflow run");
        self.bus.listen_for_events();
        self.ensure_node_recorder();
        let mut state = checkpoint.state;
        state.pending_resume = Some(crate::runtime::interrupt::ResumePlan {
            event_id,
            data,
            path,
        });
        self.drive(execute_id, state).await
    }

    async fn drive(&self, execute_id: i64, state: RunState) -> Result<RunOutcome, EngineError> {
        let (handle, cancel) = cancel_pair();
        let ctx = ExecutionContext {
            execute_id,
            root_execute_id: execute_id,
            node_key: NodeKey::entry(),
            state: SharedState::default(),
            events: self.bus.sender(),
            cancel,
            id_gen: self.id_gen.clone(),
            variables: self.variables.clone(),
        };

        let result = execute_scope(self.scope.clone(), state, ctx).await;
        drop(handle);

        match result {
            Ok(ScopeOutcome::Completed { output, state }) => {
                self.checkpoints
                    .save(Checkpoint::new(execute_id, RunStatus::Succeeded, state))
                    .await?;
                self.checkpoints.release_resume_lock(execute_id).await?;
                self.history
                    .finish_run(execute_id, RunStatus::Succeeded, Some(output.clone()), None)
                    .await?;
                let _ = self.bus.sender().send(RunEvent::completed(execute_id));
                info!(execute_id, "workflow run completed");
                Ok(RunOutcome::Completed { execute_id, output })
            }
            Ok(ScopeOutcome::Suspended { event, state }) => {
                self.checkpoints
                    .save(Checkpoint::new(execute_id, RunStatus::Suspended, state))
                    .await?;
                self.checkpoints.release_resume_lock(execute_id).await?;
                self.history
                    .finish_run(execute_id, RunStatus::Suspended, None, None)
                    .await?;
                let _ = self
                    .bus
                    .sender()
                    .send(RunEvent::suspended(execute_id, event.clone()));
                info!(execute_id, event_id = event.id, "workflow run suspended");
                Ok(RunOutcome::Suspended { execute_id, event })
            }
            Err(err) => {
                let message = err.to_string();
                warn!(execute_id, error = %message, "workflow run failed");
                let _ = self
                    .checkpoints
                    .save(Checkpoint::new(
                        execute_id,
                        RunStatus::Failed,
                        RunState::new(),
                    ))
                    .await;
                let _ = self.checkpoints.release_resume_lock(execute_id).await;
                let _ = self
                    .history
                    .finish_run(execute_id, RunStatus::Failed, None, Some(message.clone()))
                    .await;
                let _ = self.bus.sender().send(RunEvent::failed(execute_id, message));
                Err(err)
            }
        }
    }
}
