//! Question-answer node.
//!
//! On first execution the node renders its question (plus choices, when
//! configured) and suspends. A resume delivers the user's reply as the next
//! recorded answer; re-running the node then interprets the reply according
//! to the configured answer mode. The node is idempotent across the
//! suspend/resume boundary: re-running without a new answer re-raises the
//! same question.

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::debug;

use crate::runtime::context::ExecutionContext;
use crate::runtime::interrupt::InterruptKind;
use crate::schema::config::{AnswerMode, ChoiceSpec, QaConfig};
use crate::schema::field::TypeInfo;
use crate::utils::ValueMap;

use super::template::render;
use super::{NodeError, NodeExecutor, NodeOutcome, Suspension};

/// Output key holding every question asked so far.
pub const QUESTIONS_KEY: &str = "$questions";
/// Output key holding every answer received so far.
pub const ANSWERS_KEY: &str = "$answers";
/// Output key holding the raw reply in direct mode.
pub const USER_RESPONSE_KEY: &str = "USER_RESPONSE";
/// Output key holding the chosen option's ID in choice mode.
pub const OPTION_ID_KEY: &str = "optionId";
/// Output key holding the chosen option's content in choice mode.
pub const OPTION_CONTENT_KEY: &str = "optionContent";
/// Input key dynamic choice options arrive on.
pub const DYNAMIC_OPTION_KEY: &str = "dynamic_option";
/// Option ID reported when the reply matches none of the offered choices.
pub const OTHER_OPTION_ID: &str = "other";

/// Most options addressable with single letters A-Z.
const MAX_OPTIONS: usize = 26;

/// Structured interrupt payload surfaced to the caller.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QuestionPayload {
    pub question: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<QuestionOption>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QuestionOption {
    pub id: String,
    pub content: String,
}

/// Pulls structured fields out of free-form answers (typically LLM-backed).
#[async_trait]
pub trait AnswerExtractor: Send + Sync {
    async fn extract(
        &self,
        fields: &FxHashMap<String, TypeInfo>,
        question: &str,
        answers: &[String],
    ) -> Result<ValueMap, NodeError>;
}

/// Maps a free-form reply onto one of the offered options (typically
/// LLM-backed). `None` means no option fits.
#[async_trait]
pub trait IntentDetector: Send + Sync {
    async fn choose(&self, options: &[String], answer: &str) -> Result<Option<usize>, NodeError>;
}

pub struct QaExecutor {
    config: QaConfig,
    extractor: Option<Arc<dyn AnswerExtractor>>,
    intent: Option<Arc<dyn IntentDetector>>,
}

impl QaExecutor {
    #[must_use]
    pub fn new(
        config: QaConfig,
        extractor: Option<Arc<dyn AnswerExtractor>>,
        intent: Option<Arc<dyn IntentDetector>>,
    ) -> Self {
        QaExecutor {
            config,
            extractor,
            intent,
        }
    }

    fn option_contents(
        &self,
        ctx: &ExecutionContext,
        input: &ValueMap,
    ) -> Result<Vec<String>, NodeError> {
        let AnswerMode::ByChoices { choices } = &self.config.answer else {
            return Ok(Vec::new());
        };
        let contents: Vec<String> = match choices {
            ChoiceSpec::Fixed { options } => {
                options.iter().map(|opt| render(opt, input)).collect()
            }
            ChoiceSpec::Dynamic => match input.get(DYNAMIC_OPTION_KEY) {
                Some(Value::Array(items)) => items
                    .iter()
                    .map(|v| match v {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    })
                    .collect(),
                _ => {
                    return Err(NodeError::MissingInput {
                        node: ctx.node_key.clone(),
                        field: DYNAMIC_OPTION_KEY.to_string(),
                    });
                }
            },
        };
        if contents.len() > MAX_OPTIONS {
            return Err(NodeError::InvalidConfig {
                node: ctx.node_key.clone(),
                reason: format!("at most {MAX_OPTIONS} choice options are supported"),
            });
        }
        Ok(contents)
    }

    fn payload(question: &str, options: &[String]) -> Result<String, NodeError> {
        let payload = QuestionPayload {
            question: question.to_string(),
            options: options
                .iter()
                .enumerate()
                .map(|(i, content)| QuestionOption {
                    id: option_letter(i),
                    content: content.clone(),
                })
                .collect(),
        };
        serde_json::to_string(&payload)
            .map_err(|e| NodeError::Internal(format!("question payload serialization: {e}")))
    }

    fn conversation(&self, ctx: &ExecutionContext) -> (Vec<String>, Vec<String>) {
        ctx.state.with(|state| {
            (
                state.questions.get(&ctx.node_key).cloned().unwrap_or_default(),
                state.answers.get(&ctx.node_key).cloned().unwrap_or_default(),
            )
        })
    }

    async fn conclude(
        &self,
        ctx: &ExecutionContext,
        questions: Vec<String>,
        answers: Vec<String>,
        options: Vec<String>,
    ) -> Result<NodeOutcome, NodeError> {
        let last_answer = answers
            .last()
            .cloned()
            .ok_or_else(|| NodeError::Internal("concluding without any answer".to_string()))?;

        let mut output = ValueMap::new();
        match &self.config.answer {
            AnswerMode::Direct { extract_fields } if extract_fields.is_empty() => {
                output.insert(USER_RESPONSE_KEY.to_string(), json!(last_answer));
            }
            AnswerMode::Direct { extract_fields } => {
                let extractor =
                    self.extractor
                        .as_ref()
                        .ok_or_else(|| NodeError::InvalidConfig {
                            node: ctx.node_key.clone(),
                            reason: "field extraction requires an answer extractor".to_string(),
                        })?;
                let declared: FxHashMap<String, TypeInfo> = extract_fields
                    .iter()
                    .map(|name| {
                        let type_info = self
                            .config
                            .output_fields
                            .get(name)
                            .cloned()
                            .unwrap_or(TypeInfo::String);
                        (name.clone(), type_info)
                    })
                    .collect();
                let question = questions.last().map(String::as_str).unwrap_or_default();
                let extracted = extractor.extract(&declared, question, &answers).await?;
                for (name, type_info) in &declared {
                    let value = extracted
                        .get(name)
                        .cloned()
                        .map_or_else(|| type_info.zero(), |v| type_info.coerce_or_zero(v));
                    output.insert(name.clone(), value);
                }
            }
            AnswerMode::ByChoices { .. } => {
                let (id, content) = self.match_choice(&options, &last_answer).await?;
                output.insert(OPTION_ID_KEY.to_string(), json!(id));
                output.insert(OPTION_CONTENT_KEY.to_string(), json!(content));
            }
        }
        output.insert(QUESTIONS_KEY.to_string(), json!(questions));
        output.insert(ANSWERS_KEY.to_string(), json!(answers));
        Ok(NodeOutcome::Output(output))
    }

    /// Match a reply against the offered options: exact content match first,
    /// then letter-ID match, then intent detection, then "other".
    async fn match_choice(
        &self,
        options: &[String],
        answer: &str,
    ) -> Result<(String, String), NodeError> {
        if let Some(i) = options.iter().position(|opt| opt == answer) {
            return Ok((option_letter(i), options[i].clone()));
        }
        if answer.len() == 1 {
            let upper = answer.to_ascii_uppercase();
            if let Some(i) = (0..options.len()).find(|&i| option_letter(i) == upper) {
                return Ok((option_letter(i), options[i].clone()));
            }
        }
        if let Some(detector) = &self.intent {
            if let Some(i) = detector.choose(options, answer).await? {
                if i < options.len() {
                    return Ok((option_letter(i), options[i].clone()));
                }
            }
        }
        Ok((OTHER_OPTION_ID.to_string(), answer.to_string()))
    }
}

#[async_trait]
impl NodeExecutor for QaExecutor {
    async fn invoke(
        &self,
        ctx: &ExecutionContext,
        input: ValueMap,
    ) -> Result<NodeOutcome, NodeError> {
        let (questions, answers) = self.conversation(ctx);
        let options = self.option_contents(ctx, &input)?;

        if questions.is_empty() {
            let question = render(&self.config.question_template, &input);
            let data = Self::payload(&question, &options)?;
            ctx.state.with(|state| state.add_question(&ctx.node_key, &question));
            debug!(node = %ctx.node_key, "asking question");
            return Ok(NodeOutcome::Suspend(Suspension::Event(
                InterruptKind::Question { data },
            )));
        }

        if questions.len() > answers.len() {
            // Re-run without a fresh answer: re-raise the pending question.
            let question = questions
                .last()
                .cloned()
                .unwrap_or_default();
            let data = Self::payload(&question, &options)?;
            return Ok(NodeOutcome::Suspend(Suspension::Event(
                InterruptKind::Question { data },
            )));
        }

        self.conclude(ctx, questions, answers, options).await
    }
}

fn option_letter(i: usize) -> String {
    char::from(b'A' + (i as u8 % 26)).to_string()
}
