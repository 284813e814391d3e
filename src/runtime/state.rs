//! Checkpointable run state.
//!
//! [`RunState`] is the complete record of one workflow scope's progress:
//! node outputs, the executed/skipped frontier, branch selections, interrupt
//! events, and per-composite nested state. It is a plain serde structure so
//! a checkpoint is just the state serialized as-is; resuming deserializes it
//! and re-enters the run loop, which skips everything already executed.

use miette::Diagnostic;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use thiserror::Error;

use crate::runtime::interrupt::{InterruptEvent, ResumePlan};
use crate::types::{NodeKey, NodeType, Port};
use crate::utils::ValueMap;

/// Input key under which a resumed input-receiver finds its payload.
pub const RECEIVED_DATA_KEY: &str = "USER_RESPONSE";

#[derive(Debug, Error, Diagnostic)]
pub enum StateError {
    #[error("resume payload for node '{node}' is not a JSON object")]
    #[diagnostic(
        code(graphloom::state::invalid_resume_payload),
        help("Input-receiver resumes must carry a JSON object string.")
    )]
    InvalidResumePayload {
        node: NodeKey,
        #[source]
        source: serde_json::Error,
    },
}

/// Progress of a single composite node across suspensions.
///
/// Batch elements record their finished outputs in `index_outputs` and any
/// outstanding interrupts in `index_interrupts`; suspended elements keep a
/// full inner [`RunState`] snapshot in `index_states` so a resume restores
/// the element run exactly where it stopped. Loops use the same structure
/// with the iteration number as the index.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct NestedWorkflowState {
    pub index_outputs: FxHashMap<usize, ValueMap>,
    pub index_interrupts: FxHashMap<usize, InterruptEvent>,
    pub index_states: FxHashMap<usize, RunState>,
    /// Loop intermediate variable values carried across suspensions.
    pub intermediate_vars: ValueMap,
    /// Next loop iteration to run when resuming.
    pub next_iteration: usize,
}

impl NestedWorkflowState {
    #[must_use]
    pub fn is_done(&self, index: usize) -> bool {
        self.index_outputs.contains_key(&index)
    }

    /// Element indexes with interrupts still outstanding.
    #[must_use]
    pub fn pending_indexes(&self) -> Vec<usize> {
        let mut idx: Vec<usize> = self.index_interrupts.keys().copied().collect();
        idx.sort_unstable();
        idx
    }
}

/// The complete, serializable record of one workflow scope's progress.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    /// Final output map of every executed node, keyed by node.
    pub node_outputs: FxHashMap<NodeKey, ValueMap>,
    pub executed: FxHashSet<NodeKey>,
    /// Nodes ruled out by branch routing; they count as settled dependencies.
    pub skipped: FxHashSet<NodeKey>,
    /// Port chosen by each routing node that has executed.
    pub selected_ports: FxHashMap<NodeKey, Port>,
    /// Questions asked so far, per question node, in ask order.
    pub questions: FxHashMap<NodeKey, Vec<String>>,
    /// Answers received so far, per question node, in arrival order.
    pub answers: FxHashMap<NodeKey, Vec<String>>,
    /// Structured payloads delivered to input-receiver nodes on resume.
    pub received_inputs: FxHashMap<NodeKey, ValueMap>,
    /// Outstanding interrupt events, oldest first.
    pub interrupt_events: Vec<InterruptEvent>,
    /// Per-composite nested progress.
    pub nested: FxHashMap<NodeKey, NestedWorkflowState>,
    /// Group choices recorded by aggregators, for dynamic stream resolution.
    pub group_choices: FxHashMap<NodeKey, FxHashMap<String, i64>>,
    /// Intermediate variables of the enclosing loop scope.
    pub intermediate_vars: ValueMap,
    /// Set by a break node; the enclosing loop stops after this iteration.
    pub break_requested: bool,
    /// Resume request still traveling toward its target node.
    pub pending_resume: Option<ResumePlan>,
}

impl RunState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a node has settled, either by executing or by being skipped.
    /// The synthetic entry node always counts as executed.
    #[must_use]
    pub fn is_settled(&self, node: &NodeKey) -> bool {
        node.is_entry() || self.executed.contains(node) || self.skipped.contains(node)
    }

    pub fn record_output(&mut self, node: NodeKey, output: ValueMap) {
        self.node_outputs.insert(node.clone(), output);
        self.executed.insert(node);
    }

    #[must_use]
    pub fn output_of(&self, node: &NodeKey) -> Option<&ValueMap> {
        self.node_outputs.get(node)
    }

    /// Oldest outstanding interrupt event, the one a caller must answer next.
    #[must_use]
    pub fn first_interrupt_event(&self) -> Option<&InterruptEvent> {
        self.interrupt_events.first()
    }

    /// Append an interrupt event, keeping at most one per event ID.
    pub fn push_interrupt_event(&mut self, event: InterruptEvent) {
        if let Some(existing) = self.interrupt_events.iter_mut().find(|e| e.id == event.id) {
            *existing = event;
        } else {
            self.interrupt_events.push(event);
        }
    }

    pub fn remove_interrupt_event(&mut self, event_id: i64) {
        self.interrupt_events.retain(|e| e.id != event_id);
    }

    pub fn add_question(&mut self, node: &NodeKey, question: impl Into<String>) {
        self.questions
            .entry(node.clone())
            .or_default()
            .push(question.into());
    }

    /// Whether a question node has asked more than it has been answered.
    #[must_use]
    pub fn awaiting_answer(&self, node: &NodeKey) -> bool {
        let asked = self.questions.get(node).map_or(0, Vec::len);
        let answered = self.answers.get(node).map_or(0, Vec::len);
        asked > answered
    }

    pub fn nested_mut(&mut self, node: &NodeKey) -> &mut NestedWorkflowState {
        self.nested.entry(node.clone()).or_default()
    }

    /// Deliver resume data to the node the plan terminates at. Question nodes
    /// get the raw text as their next answer; input receivers get the parsed
    /// JSON object.
    pub fn apply_resume_data(
        &mut self,
        node: &NodeKey,
        node_type: NodeType,
        data: &str,
    ) -> Result<(), StateError> {
        match node_type {
            NodeType::QuestionAnswer => {
                self.answers
                    .entry(node.clone())
                    .or_default()
                    .push(data.to_string());
            }
            NodeType::InputReceiver => {
                let map: ValueMap = serde_json::from_str(data).map_err(|source| {
                    StateError::InvalidResumePayload {
                        node: node.clone(),
                        source,
                    }
                })?;
                self.received_inputs.insert(node.clone(), map);
            }
            _ => {
                // Composite targets descend further; nothing to deliver here.
            }
        }
        Ok(())
    }
}

/// Shared handle to a [`RunState`], cloned into every node invocation.
#[derive(Clone, Default)]
pub struct SharedState(Arc<Mutex<RunState>>);

impl SharedState {
    #[must_use]
    pub fn new(state: RunState) -> Self {
        SharedState(Arc::new(Mutex::new(state)))
    }

    /// Run a closure under the state lock, recovering from poisoning.
    pub fn with<R>(&self, f: impl FnOnce(&mut RunState) -> R) -> R {
        let mut guard = match self.0.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }

    /// Clone the current state, e.g. for checkpointing.
    #[must_use]
    pub fn snapshot(&self) -> RunState {
        self.with(|state| state.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::interrupt::InterruptKind;
    use serde_json::json;

    fn key(s: &str) -> NodeKey {
        NodeKey::from(s)
    }

    #[test]
    fn entry_is_always_settled() {
        let state = RunState::new();
        assert!(state.is_settled(&NodeKey::entry()));
        assert!(!state.is_settled(&key("a")));
    }

    #[test]
    fn interrupt_events_keep_fifo_order_and_dedupe_by_id() {
        let mut state = RunState::new();
        let ev = |id: i64| {
            InterruptEvent::new(
                id,
                key("recv"),
                NodeType::InputReceiver,
                InterruptKind::InputRequired { prompt: "p".into() },
            )
        };
        state.push_interrupt_event(ev(1));
        state.push_interrupt_event(ev(2));
        state.push_interrupt_event(ev(1));
        assert_eq!(state.interrupt_events.len(), 2);
        assert_eq!(state.first_interrupt_event().unwrap().id, 1);
        state.remove_interrupt_event(1);
        assert_eq!(state.first_interrupt_event().unwrap().id, 2);
    }

    #[test]
    fn question_answer_bookkeeping() {
        let mut state = RunState::new();
        let qa = key("qa");
        assert!(!state.awaiting_answer(&qa));
        state.add_question(&qa, "name?");
        assert!(state.awaiting_answer(&qa));
        state
            .apply_resume_data(&qa, NodeType::QuestionAnswer, "Ada")
            .unwrap();
        assert!(!state.awaiting_answer(&qa));
        assert_eq!(state.answers[&qa], vec!["Ada".to_string()]);
    }

    #[test]
    fn receiver_resume_parses_object() {
        let mut state = RunState::new();
        let recv = key("recv");
        state
            .apply_resume_data(&recv, NodeType::InputReceiver, r#"{"city":"Oslo"}"#)
            .unwrap();
        assert_eq!(state.received_inputs[&recv]["city"], json!("Oslo"));

        let err = state
            .apply_resume_data(&recv, NodeType::InputReceiver, "not json")
            .unwrap_err();
        assert!(matches!(err, StateError::InvalidResumePayload { .. }));
    }

    #[test]
    fn state_serde_round_trip() {
        let mut state = RunState::new();
        state.record_output(key("a"), ValueMap::new());
        state.selected_ports.insert(key("sel"), Port::Branch(1));
        state.nested_mut(&key("batch")).next_iteration = 3;
        let json = serde_json::to_string(&state).unwrap();
        let back: RunState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, state);
    }
}
