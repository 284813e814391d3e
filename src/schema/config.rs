//! Per-node-type configuration as a tagged union.
//!
//! Every [`crate::schema::NodeSchema`] carries exactly one `NodeConfig`
//! variant matching its [`crate::types::NodeType`]; the pairing is checked at
//! compile time so executors never downcast.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use super::field::TypeInfo;
use crate::types::NodeType;

/// Input key a batch node reads its per-run size cap from.
pub const BATCH_SIZE_KEY: &str = "batchSize";
/// Input key a batch node reads its worker count from.
pub const CONCURRENT_SIZE_KEY: &str = "concurrentSize";
/// Input key a by-iteration loop reads its iteration count from.
pub const LOOP_COUNT_KEY: &str = "loopCount";

/// Hard ceiling on batch iterations when the run does not cap it.
pub const DEFAULT_MAX_BATCH_SIZE: usize = 100;
/// Worker count used when the run does not configure one.
pub const DEFAULT_CONCURRENCY: usize = 10;

/// Node-type-specific configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeConfig {
    Entry,
    Exit,
    /// Leaf executor resolved by name from the node registry.
    Lambda { executor: String },
    OutputEmitter(EmitterConfig),
    VariableAggregator(AggregatorConfig),
    QuestionAnswer(QaConfig),
    InputReceiver(ReceiverConfig),
    Selector(SelectorConfig),
    Batch(BatchConfig),
    Loop(LoopConfig),
    Break,
    SubWorkflow(SubWorkflowConfig),
}

impl NodeConfig {
    /// The node type this configuration belongs to.
    #[must_use]
    pub fn node_type(&self) -> NodeType {
        match self {
            NodeConfig::Entry => NodeType::Entry,
            NodeConfig::Exit => NodeType::Exit,
            NodeConfig::Lambda { .. } => NodeType::Lambda,
            NodeConfig::OutputEmitter(_) => NodeType::OutputEmitter,
            NodeConfig::VariableAggregator(_) => NodeType::VariableAggregator,
            NodeConfig::QuestionAnswer(_) => NodeType::QuestionAnswer,
            NodeConfig::InputReceiver(_) => NodeType::InputReceiver,
            NodeConfig::Selector(_) => NodeType::Selector,
            NodeConfig::Batch(_) => NodeType::Batch,
            NodeConfig::Loop(_) => NodeType::Loop,
            NodeConfig::Break => NodeType::Break,
            NodeConfig::SubWorkflow(_) => NodeType::SubWorkflow,
        }
    }
}

/// Output emitter: renders a `{{variable}}` template over mapped fields.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EmitterConfig {
    pub template: String,
    /// When set, the emitter transforms its input incrementally and its
    /// `output` field classifies as a stream.
    #[serde(default)]
    pub streaming: bool,
}

/// One candidate group of a variable aggregator.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AggregatorGroup {
    pub name: String,
    /// Number of candidates; candidate fields occupy paths
    /// `[name, "0"] .. [name, len-1]`.
    pub len: usize,
}

/// Variable aggregator: first non-null candidate per group, in declared
/// group order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AggregatorConfig {
    pub groups: Vec<AggregatorGroup>,
}

impl AggregatorConfig {
    #[must_use]
    pub fn group_len(&self, name: &str) -> Option<usize> {
        self.groups.iter().find(|g| g.name == name).map(|g| g.len)
    }
}

/// How a question-answer node interprets the user's reply.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum AnswerMode {
    /// Free-form answer; optionally extract structured fields from it.
    Direct {
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        extract_fields: Vec<String>,
    },
    /// Answer must pick one of the offered choices.
    ByChoices { choices: ChoiceSpec },
}

/// Where a choice-based question gets its options.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChoiceSpec {
    /// Options fixed at authoring time; each may contain template variables.
    Fixed { options: Vec<String> },
    /// Options arrive at run time on the `dynamic_option` input field.
    Dynamic,
}

/// Question-answer node configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QaConfig {
    pub question_template: String,
    pub answer: AnswerMode,
    /// Declared shape of extracted fields when `AnswerMode::Direct` extracts.
    #[serde(default)]
    pub output_fields: FxHashMap<String, TypeInfo>,
}

/// Input receiver: suspends until external input arrives.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReceiverConfig {
    /// Prompt surfaced to the caller in the interrupt payload.
    #[serde(default)]
    pub prompt: String,
    /// Declared shape of the received payload.
    #[serde(default)]
    pub output_fields: FxHashMap<String, TypeInfo>,
}

/// Comparison operators available to selector clauses.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Equal,
    NotEqual,
    Greater,
    GreaterOrEqual,
    Lesser,
    LesserOrEqual,
    Empty,
    NotEmpty,
    Contains,
    NotContains,
    IsTrue,
    IsFalse,
    LengthGreater,
}

impl Operator {
    /// Unary operators take no right operand.
    #[must_use]
    pub fn is_unary(&self) -> bool {
        matches!(
            self,
            Operator::Empty | Operator::NotEmpty | Operator::IsTrue | Operator::IsFalse
        )
    }
}

/// How a branch combines its clauses.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClauseRelation {
    And,
    Or,
}

/// One comparison within a selector branch. Operands name top-level keys of
/// the selector's assembled input map.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Clause {
    pub left: String,
    pub op: Operator,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub right: Option<String>,
}

/// One ordered condition branch of a selector.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SelectorBranch {
    pub clauses: Vec<Clause>,
    #[serde(default = "default_relation")]
    pub relation: ClauseRelation,
}

fn default_relation() -> ClauseRelation {
    ClauseRelation::And
}

/// Selector node configuration: branches evaluate in order, first match
/// routes its port, otherwise the default port routes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SelectorConfig {
    pub branches: Vec<SelectorBranch>,
}

/// Batch composite configuration. The inner workflow lives on the node's
/// `sub_schema`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Input keys holding the arrays iterated over; iteration count is the
    /// shortest array.
    pub input_arrays: Vec<String>,
}

/// What drives a loop's iteration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopKind {
    ByArray,
    ByIteration,
    Infinite,
}

/// Loop composite configuration. The inner workflow lives on the node's
/// `sub_schema`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LoopConfig {
    pub kind: LoopKind,
    #[serde(default)]
    pub input_arrays: Vec<String>,
    /// Mutable variables scoped to the loop, readable from inner nodes via
    /// `VarKind::ParentIntermediate`.
    #[serde(default)]
    pub intermediate_vars: FxHashMap<String, TypeInfo>,
}

/// Sub-workflow node configuration; the hosted workflow lives on the node's
/// `sub_schema`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SubWorkflowConfig {
    /// Identity of the hosted workflow, recorded on history entries.
    pub workflow_id: String,
}

/// Exception handling policy attached to a node.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorProcess {
    /// Propagate the failure (default).
    #[default]
    ThrowError,
    /// Substitute the configured default output and continue.
    ReturnDefaultData,
    /// Emit an error body and route the exception port.
    ExceptionBranch,
}

/// Timeout, retry, and error-policy settings for one node.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ExceptionConfig {
    /// Wall-clock budget per node execution, including retries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Additional attempts after the first failure.
    #[serde(default)]
    pub max_retry: u32,
    #[serde(default)]
    pub process: ErrorProcess,
    /// Output substituted under `ReturnDefaultData`, serialized as JSON text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_output: Option<String>,
}

/// Streaming capabilities of a node.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamConfig {
    /// The node can produce its output incrementally.
    #[serde(default)]
    pub can_generate_stream: bool,
    /// The node must receive its input incrementally.
    #[serde(default)]
    pub require_streaming_input: bool,
}
