//! Composite node executors: batch, loop, sub-workflow, break.
//!
//! A composite hosts a compiled inner scope and runs it once per element
//! (batch), per iteration (loop), or once (sub-workflow). Element runs are
//! full scope executions: they can suspend, and the composite then suspends
//! with a nested interrupt map while finished elements keep their outputs.
//! On resume the engine threads a [`ResumePlan`] down to the composite,
//! which restores the targeted element's saved state and re-enters it;
//! untargeted outstanding interrupts are re-raised untouched.

use futures_util::StreamExt;
use futures_util::stream::FuturesUnordered;
use rustc_hash::FxHashMap;
use serde_json::{Value, json};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::debug;

use crate::nodes::{NodeError, NodeExecutor, NodeOutcome, Suspension};
use crate::runtime::context::ExecutionContext;
use crate::runtime::engine::{CompiledScope, EngineError, ScopeOutcome, execute_scope};
use crate::runtime::interrupt::{InterruptEvent, ResumePlan};
use crate::runtime::state::{NestedWorkflowState, RunState};
use crate::schema::config::{
    BATCH_SIZE_KEY, BatchConfig, CONCURRENT_SIZE_KEY, DEFAULT_CONCURRENCY, DEFAULT_MAX_BATCH_SIZE,
    LOOP_COUNT_KEY, LoopConfig, LoopKind, SubWorkflowConfig,
};
use crate::schema::{FieldInfo, FieldRef, FieldSource, VarKind};
use crate::types::{FieldPath, NodeKey, PATH_JOIN};
use crate::utils::{ValueMap, get_map_value, set_map_value};

/// Take the part of a pending resume plan that targets this composite, if
/// any. The plan is consumed so it cannot be delivered twice.
fn consume_plan(ctx: &ExecutionContext, key: &NodeKey) -> Option<(usize, ResumePlan)> {
    ctx.state.with(|s| {
        let hit = s
            .pending_resume
            .as_ref()
            .and_then(|plan| plan.descend_into(key));
        if hit.is_some() {
            s.pending_resume = None;
        }
        hit
    })
}

/// Pull the named arrays out of the composite's input.
fn collect_arrays(
    node: &NodeKey,
    input: &ValueMap,
    names: &[String],
) -> Result<Vec<(String, Vec<Value>)>, NodeError> {
    let mut arrays = Vec::with_capacity(names.len());
    for name in names {
        let value = input.get(name).ok_or_else(|| NodeError::MissingInput {
            node: node.clone(),
            field: name.clone(),
        })?;
        let Value::Array(items) = value else {
            return Err(NodeError::Execution {
                node: node.clone(),
                message: format!("input '{name}' is not an array"),
            });
        };
        arrays.push((name.clone(), items.clone()));
    }
    Ok(arrays)
}

/// Entry output for one element run: the composite's own input (carry-overs
/// included) plus the element index and current array elements, flattened
/// under the composite's key.
fn element_entry(
    base: &ValueMap,
    key: &NodeKey,
    index: usize,
    arrays: &[(String, Vec<Value>)],
) -> ValueMap {
    let mut entry = base.clone();
    entry.insert(format!("{key}{PATH_JOIN}index"), json!(index));
    for (name, items) in arrays {
        if let Some(item) = items.get(index) {
            entry.insert(format!("{key}{PATH_JOIN}{name}"), item.clone());
        }
    }
    entry
}

/// Path of an inner node's value inside an element run's output map, which
/// is keyed by inner node first.
fn inner_value_path(r: &FieldRef) -> Option<FieldPath> {
    let from = r.from_node.as_ref()?;
    let mut segs = vec![from.0.clone()];
    segs.extend(r.from_path.0.iter().cloned());
    Some(FieldPath(segs))
}

fn scope_err(key: &NodeKey, err: EngineError) -> NodeError {
    match err {
        EngineError::Cancelled { .. } => NodeError::Cancelled { node: key.clone() },
        other => NodeError::Execution {
            node: key.clone(),
            message: other.to_string(),
        },
    }
}

fn fresh_element_state(entry: ValueMap) -> RunState {
    let mut state = RunState::new();
    state.record_output(NodeKey::entry(), entry);
    state
}

/// Restore a suspended element's saved state, or start it fresh, and plant
/// the inner resume plan when this element is the resume target.
fn element_state(
    nested: &mut NestedWorkflowState,
    index: usize,
    entry: ValueMap,
    plan: &mut Option<(usize, ResumePlan)>,
) -> RunState {
    let targeted = plan.as_ref().is_some_and(|(i, _)| *i == index);
    if targeted {
        let mut state = nested
            .index_states
            .remove(&index)
            .unwrap_or_else(|| fresh_element_state(entry));
        if let Some((_, inner_plan)) = plan.take() {
            state.pending_resume = Some(inner_plan);
        }
        state
    } else {
        fresh_element_state(entry)
    }
}

fn persist_nested(ctx: &ExecutionContext, key: &NodeKey, nested: NestedWorkflowState) {
    ctx.state
        .with(|s| s.nested.insert(key.clone(), nested));
}

/// Runs the inner scope once per array element, bounded by the configured
/// concurrency. Element outputs assemble into arrays on the declared output
/// fields; elements that never produced a value contribute `null`.
pub struct BatchExecutor {
    key: NodeKey,
    config: BatchConfig,
    scope: Arc<CompiledScope>,
    output_sources: Vec<FieldInfo>,
}

impl BatchExecutor {
    pub fn new(
        key: NodeKey,
        config: BatchConfig,
        scope: Arc<CompiledScope>,
        output_sources: Vec<FieldInfo>,
    ) -> Self {
        BatchExecutor {
            key,
            config,
            scope,
            output_sources,
        }
    }

    fn assemble_output(
        &self,
        nested: &NestedWorkflowState,
        count: usize,
    ) -> Result<ValueMap, NodeError> {
        let mut output = ValueMap::new();
        for info in &self.output_sources {
            match &info.source {
                FieldSource::Static { value } => {
                    set_map_value(&mut output, &info.path, value.clone())?;
                }
                FieldSource::Ref(r) => {
                    let Some(path) = inner_value_path(r) else {
                        continue;
                    };
                    let items: Vec<Value> = (0..count)
                        .map(|i| {
                            nested
                                .index_outputs
                                .get(&i)
                                .and_then(|out| get_map_value(out, &path).cloned())
                                .unwrap_or(Value::Null)
                        })
                        .collect();
                    set_map_value(&mut output, &info.path, Value::Array(items))?;
                }
            }
        }
        Ok(output)
    }
}

#[async_trait::async_trait]
impl NodeExecutor for BatchExecutor {
    async fn invoke(
        &self,
        ctx: &ExecutionContext,
        input: ValueMap,
    ) -> Result<NodeOutcome, NodeError> {
        let arrays = collect_arrays(&self.key, &input, &self.config.input_arrays)?;
        let mut count = arrays
            .iter()
            .map(|(_, items)| items.len())
            .min()
            .unwrap_or(0);
        if let Some(cap) = input.get(BATCH_SIZE_KEY).and_then(Value::as_u64) {
            count = count.min(cap as usize);
        }
        count = count.min(DEFAULT_MAX_BATCH_SIZE);
        let concurrency = input
            .get(CONCURRENT_SIZE_KEY)
            .and_then(Value::as_u64)
            .map_or(DEFAULT_CONCURRENCY, |n| n as usize)
            .max(1);

        let mut nested = ctx
            .state
            .with(|s| s.nested.get(&self.key).cloned())
            .unwrap_or_default();
        let mut plan = consume_plan(ctx, &self.key);
        let targeted = plan.as_ref().map(|(i, _)| *i);

        // Elements with an outstanding interrupt only re-enter when this
        // resume targets them; the rest keep waiting.
        let mut queue: VecDeque<(usize, RunState)> = VecDeque::new();
        for index in 0..count {
            if nested.is_done(index) {
                continue;
            }
            if nested.index_interrupts.contains_key(&index) && targeted != Some(index) {
                continue;
            }
            let entry = element_entry(&input, &self.key, index, &arrays);
            let state = element_state(&mut nested, index, entry, &mut plan);
            queue.push_back((index, state));
        }

        debug!(node = %self.key, count, concurrency, pending = queue.len(), "running batch");
        let mut running = FuturesUnordered::new();
        let mut admit_more = true;
        loop {
            while admit_more && running.len() < concurrency {
                let Some((index, state)) = queue.pop_front() else {
                    break;
                };
                let scope = self.scope.clone();
                let job_ctx = ctx.clone();
                running.push(async move { (index, execute_scope(scope, state, job_ctx).await) });
            }
            let Some((index, result)) = running.next().await else {
                break;
            };
            match result.map_err(|e| scope_err(&self.key, e))? {
                ScopeOutcome::Completed { output, .. } => {
                    nested.index_outputs.insert(index, output);
                    nested.index_interrupts.remove(&index);
                    nested.index_states.remove(&index);
                }
                ScopeOutcome::Suspended { event, state } => {
                    nested.index_interrupts.insert(index, event);
                    nested.index_states.insert(index, state);
                    admit_more = false;
                }
            }
        }

        let interrupts = nested.index_interrupts.clone();
        persist_nested(ctx, &self.key, nested.clone());
        if !interrupts.is_empty() {
            return Ok(NodeOutcome::Suspend(Suspension::Nested(interrupts)));
        }
        Ok(NodeOutcome::Output(self.assemble_output(&nested, count)?))
    }
}

/// Runs the inner scope sequentially, by array, by count, or until a break
/// node fires. Intermediate variables persist across iterations and
/// suspensions; output fields referencing inner nodes collect one value per
/// completed iteration.
pub struct LoopExecutor {
    key: NodeKey,
    config: LoopConfig,
    scope: Arc<CompiledScope>,
    output_sources: Vec<FieldInfo>,
}

impl LoopExecutor {
    pub fn new(
        key: NodeKey,
        config: LoopConfig,
        scope: Arc<CompiledScope>,
        output_sources: Vec<FieldInfo>,
    ) -> Self {
        LoopExecutor {
            key,
            config,
            scope,
            output_sources,
        }
    }

    fn iteration_count(&self, input: &ValueMap, arrays: &[(String, Vec<Value>)]) -> Result<usize, NodeError> {
        match self.config.kind {
            LoopKind::ByArray => Ok(arrays
                .iter()
                .map(|(_, items)| items.len())
                .min()
                .unwrap_or(0)),
            LoopKind::ByIteration => input
                .get(LOOP_COUNT_KEY)
                .and_then(Value::as_u64)
                .map(|n| n as usize)
                .ok_or_else(|| NodeError::MissingInput {
                    node: self.key.clone(),
                    field: LOOP_COUNT_KEY.to_string(),
                }),
            LoopKind::Infinite => Ok(usize::MAX),
        }
    }

    fn seed_intermediate_vars(&self, nested: &mut NestedWorkflowState, input: &ValueMap) {
        if nested.next_iteration > 0 || !nested.intermediate_vars.is_empty() {
            return;
        }
        for (name, type_info) in &self.config.intermediate_vars {
            let value = input
                .get(name)
                .cloned()
                .map_or_else(|| type_info.zero(), |v| type_info.coerce_or_zero(v));
            nested.intermediate_vars.insert(name.clone(), value);
        }
    }

    fn assemble_output(&self, nested: &NestedWorkflowState) -> Result<ValueMap, NodeError> {
        let mut completed: Vec<usize> = nested.index_outputs.keys().copied().collect();
        completed.sort_unstable();
        let mut output = ValueMap::new();
        for info in &self.output_sources {
            match &info.source {
                FieldSource::Static { value } => {
                    set_map_value(&mut output, &info.path, value.clone())?;
                }
                FieldSource::Ref(r) if r.variable == Some(VarKind::ParentIntermediate) => {
                    let value = get_map_value(&nested.intermediate_vars, &r.from_path)
                        .cloned()
                        .unwrap_or(Value::Null);
                    set_map_value(&mut output, &info.path, value)?;
                }
                FieldSource::Ref(r) => {
                    let Some(path) = inner_value_path(r) else {
                        continue;
                    };
                    let items: Vec<Value> = completed
                        .iter()
                        .map(|i| {
                            nested
                                .index_outputs
                                .get(i)
                                .and_then(|out| get_map_value(out, &path).cloned())
                                .unwrap_or(Value::Null)
                        })
                        .collect();
                    set_map_value(&mut output, &info.path, Value::Array(items))?;
                }
            }
        }
        Ok(output)
    }
}

#[async_trait::async_trait]
impl NodeExecutor for LoopExecutor {
    async fn invoke(
        &self,
        ctx: &ExecutionContext,
        input: ValueMap,
    ) -> Result<NodeOutcome, NodeError> {
        let arrays = collect_arrays(&self.key, &input, &self.config.input_arrays)?;
        let count = self.iteration_count(&input, &arrays)?;

        let mut nested = ctx
            .state
            .with(|s| s.nested.get(&self.key).cloned())
            .unwrap_or_default();
        self.seed_intermediate_vars(&mut nested, &input);
        let mut plan = consume_plan(ctx, &self.key);

        let mut index = nested.next_iteration;
        while index < count {
            if let Some(event) = nested.index_interrupts.get(&index) {
                let targeted = plan.as_ref().is_some_and(|(i, _)| *i == index);
                if !targeted {
                    // Still waiting for its answer; raise it again.
                    let event = event.clone();
                    persist_nested(ctx, &self.key, nested);
                    let mut interrupts = FxHashMap::default();
                    interrupts.insert(index, event);
                    return Ok(NodeOutcome::Suspend(Suspension::Nested(interrupts)));
                }
            }

            let entry = element_entry(&input, &self.key, index, &arrays);
            let mut state = element_state(&mut nested, index, entry, &mut plan);
            state.intermediate_vars = nested.intermediate_vars.clone();

            debug!(node = %self.key, iteration = index, "running loop iteration");
            let outcome = execute_scope(self.scope.clone(), state, ctx.clone())
                .await
                .map_err(|e| scope_err(&self.key, e))?;
            match outcome {
                ScopeOutcome::Completed { output, state } => {
                    nested.intermediate_vars = state.intermediate_vars;
                    nested.index_outputs.insert(index, output);
                    nested.index_interrupts.remove(&index);
                    nested.index_states.remove(&index);
                    nested.next_iteration = index + 1;
                    if state.break_requested {
                        break;
                    }
                }
                ScopeOutcome::Suspended { event, state } => {
                    nested.index_interrupts.insert(index, event.clone());
                    nested.index_states.insert(index, state);
                    nested.next_iteration = index;
                    persist_nested(ctx, &self.key, nested);
                    let mut interrupts = FxHashMap::default();
                    interrupts.insert(index, event);
                    return Ok(NodeOutcome::Suspend(Suspension::Nested(interrupts)));
                }
            }
            index += 1;
        }

        persist_nested(ctx, &self.key, nested.clone());
        Ok(NodeOutcome::Output(self.assemble_output(&nested)?))
    }
}

/// Runs a hosted workflow once, forwarding the node's assembled input as the
/// inner run's entry output.
pub struct SubWorkflowExecutor {
    key: NodeKey,
    config: SubWorkflowConfig,
    scope: Arc<CompiledScope>,
    output_sources: Vec<FieldInfo>,
}

impl SubWorkflowExecutor {
    pub fn new(
        key: NodeKey,
        config: SubWorkflowConfig,
        scope: Arc<CompiledScope>,
        output_sources: Vec<FieldInfo>,
    ) -> Self {
        SubWorkflowExecutor {
            key,
            config,
            scope,
            output_sources,
        }
    }
}

#[async_trait::async_trait]
impl NodeExecutor for SubWorkflowExecutor {
    async fn invoke(
        &self,
        ctx: &ExecutionContext,
        input: ValueMap,
    ) -> Result<NodeOutcome, NodeError> {
        let mut nested = ctx
            .state
            .with(|s| s.nested.get(&self.key).cloned())
            .unwrap_or_default();
        let mut plan = consume_plan(ctx, &self.key);

        if let Some(event) = nested.index_interrupts.get(&0) {
            let targeted = plan.as_ref().is_some_and(|(i, _)| *i == 0);
            if !targeted {
                let event = event.clone();
                persist_nested(ctx, &self.key, nested);
                let mut interrupts = FxHashMap::default();
                interrupts.insert(0, event);
                return Ok(NodeOutcome::Suspend(Suspension::Nested(interrupts)));
            }
        }

        debug!(node = %self.key, workflow_id = %self.config.workflow_id, "running sub-workflow");
        let state = element_state(&mut nested, 0, input.clone(), &mut plan);
        let outcome = execute_scope(self.scope.clone(), state, ctx.clone())
            .await
            .map_err(|e| scope_err(&self.key, e))?;
        match outcome {
            ScopeOutcome::Completed { output, .. } => {
                nested.index_outputs.insert(0, output.clone());
                nested.index_interrupts.remove(&0);
                nested.index_states.remove(&0);
                persist_nested(ctx, &self.key, nested);

                let mut shaped = ValueMap::new();
                for info in &self.output_sources {
                    match &info.source {
                        FieldSource::Static { value } => {
                            set_map_value(&mut shaped, &info.path, value.clone())?;
                        }
                        FieldSource::Ref(r) => {
                            let Some(path) = inner_value_path(r) else {
                                continue;
                            };
                            let value =
                                get_map_value(&output, &path).cloned().unwrap_or(Value::Null);
                            set_map_value(&mut shaped, &info.path, value)?;
                        }
                    }
                }
                Ok(NodeOutcome::Output(shaped))
            }
            ScopeOutcome::Suspended { event, state } => {
                nested.index_interrupts.insert(0, event.clone());
                nested.index_states.insert(0, state);
                persist_nested(ctx, &self.key, nested);
                let mut interrupts = FxHashMap::default();
                interrupts.insert(0, event);
                Ok(NodeOutcome::Suspend(Suspension::Nested(interrupts)))
            }
        }
    }
}

/// Requests that the enclosing loop stop after the current iteration.
pub struct BreakExecutor;

#[async_trait::async_trait]
impl NodeExecutor for BreakExecutor {
    async fn invoke(
        &self,
        ctx: &ExecutionContext,
        _input: ValueMap,
    ) -> Result<NodeOutcome, NodeError> {
        ctx.state.with(|s| s.break_requested = true);
        Ok(NodeOutcome::Output(ValueMap::new()))
    }
}
