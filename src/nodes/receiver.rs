//! Input receiver node: suspends until external input arrives.

use async_trait::async_trait;
use tracing::debug;

use crate::runtime::context::ExecutionContext;
use crate::runtime::interrupt::InterruptKind;
use crate::schema::config::ReceiverConfig;
use crate::utils::ValueMap;

use super::{NodeError, NodeExecutor, NodeOutcome, Suspension};

pub struct ReceiverExecutor {
    config: ReceiverConfig,
}

impl ReceiverExecutor {
    #[must_use]
    pub fn new(config: ReceiverConfig) -> Self {
        ReceiverExecutor { config }
    }

    /// Shape the received payload to the declared output fields: declared
    /// fields are coerced to their type (zero when absent), undeclared fields
    /// pass through untouched.
    fn shape_output(&self, mut received: ValueMap) -> ValueMap {
        for (field, type_info) in &self.config.output_fields {
            let value = match received.remove(field) {
                Some(value) => type_info.coerce_or_zero(value),
                None => type_info.zero(),
            };
            received.insert(field.clone(), value);
        }
        received
    }
}

#[async_trait]
impl NodeExecutor for ReceiverExecutor {
    async fn invoke(
        &self,
        ctx: &ExecutionContext,
        _input: ValueMap,
    ) -> Result<NodeOutcome, NodeError> {
        let received = ctx
            .state
            .with(|state| state.received_inputs.remove(&ctx.node_key));
        match received {
            Some(payload) => {
                debug!(node = %ctx.node_key, "input receiver resumed with payload");
                Ok(NodeOutcome::Output(self.shape_output(payload)))
            }
            None => Ok(NodeOutcome::Suspend(Suspension::Event(
                InterruptKind::InputRequired {
                    prompt: self.config.prompt.clone(),
                },
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::context::{InMemoryVariableStore, SequentialIdGenerator, cancel_pair};
    use crate::runtime::state::{RunState, SharedState};
    use crate::schema::field::TypeInfo;
    use crate::types::{NodeKey, NodeType};
    use rustc_hash::FxHashMap;
    use serde_json::json;
    use std::sync::Arc;

    fn ctx_with_state(state: RunState) -> ExecutionContext {
        let (_handle, cancel) = cancel_pair();
        let (events, _rx) = flume::unbounded();
        ExecutionContext {
            execute_id: 1,
            root_execute_id: 1,
            node_key: NodeKey::from("recv"),
            state: SharedState::new(state),
            events,
            cancel,
            id_gen: Arc::new(SequentialIdGenerator::default()),
            variables: Arc::new(InMemoryVariableStore::new()),
        }
    }

    fn config() -> ReceiverConfig {
        let mut fields = FxHashMap::default();
        fields.insert("city".to_string(), TypeInfo::String);
        fields.insert("count".to_string(), TypeInfo::Integer);
        ReceiverConfig {
            prompt: "where to?".to_string(),
            output_fields: fields,
        }
    }

    #[tokio::test]
    async fn suspends_until_input_arrives() {
        let exec = ReceiverExecutor::new(config());
        let ctx = ctx_with_state(RunState::new());
        let outcome = exec.invoke(&ctx, ValueMap::new()).await.unwrap();
        assert_eq!(
            outcome,
            NodeOutcome::Suspend(Suspension::Event(InterruptKind::InputRequired {
                prompt: "where to?".to_string()
            }))
        );
    }

    #[tokio::test]
    async fn resumed_payload_is_shaped_to_declared_fields() {
        let exec = ReceiverExecutor::new(config());
        let mut state = RunState::new();
        state
            .apply_resume_data(
                &NodeKey::from("recv"),
                NodeType::InputReceiver,
                r#"{"city": "Oslo", "extra": true}"#,
            )
            .unwrap();
        let ctx = ctx_with_state(state);

        let outcome = exec.invoke(&ctx, ValueMap::new()).await.unwrap();
        let NodeOutcome::Output(output) = outcome else {
            panic!("expected output");
        };
        assert_eq!(output["city"], json!("Oslo"));
        assert_eq!(output["count"], json!(0));
        assert_eq!(output["extra"], json!(true));
    }
}
