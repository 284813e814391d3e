//! Variable aggregator node.
//!
//! Each declared group holds an ordered list of candidate fields at paths
//! `group/0 .. group/len-1` of the assembled input. The output carries the
//! first non-null candidate per group; the winning index is recorded into
//! run state as the group choice, which downstream stream classification
//! consults and never revisits. A group with no non-null candidate records
//! choice `-1` and produces no output field.

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use tracing::debug;

use crate::runtime::context::ExecutionContext;
use crate::schema::config::AggregatorConfig;
use crate::utils::ValueMap;

use super::{NodeError, NodeExecutor, NodeOutcome};

/// Choice recorded when every candidate of a group was null or skipped.
pub const NO_CHOICE: i64 = -1;

pub struct AggregatorExecutor {
    config: AggregatorConfig,
}

impl AggregatorExecutor {
    #[must_use]
    pub fn new(config: AggregatorConfig) -> Self {
        AggregatorExecutor { config }
    }
}

#[async_trait]
impl NodeExecutor for AggregatorExecutor {
    async fn invoke(
        &self,
        ctx: &ExecutionContext,
        input: ValueMap,
    ) -> Result<NodeOutcome, NodeError> {
        let mut output = ValueMap::new();
        let mut choices: FxHashMap<String, i64> = FxHashMap::default();

        for group in &self.config.groups {
            let mut choice = NO_CHOICE;
            if let Some(candidates) = input.get(&group.name).and_then(|v| v.as_object()) {
                for i in 0..group.len {
                    let Some(value) = candidates.get(&i.to_string()) else {
                        continue;
                    };
                    if value.is_null() {
                        continue;
                    }
                    choice = i as i64;
                    output.insert(group.name.clone(), value.clone());
                    break;
                }
            }
            debug!(node = %ctx.node_key, group = %group.name, choice, "aggregator group settled");
            choices.insert(group.name.clone(), choice);
        }

        ctx.state.with(|state| {
            state.group_choices.insert(ctx.node_key.clone(), choices);
        });
        Ok(NodeOutcome::Output(output))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::context::{InMemoryVariableStore, SequentialIdGenerator, cancel_pair};
    use crate::runtime::state::{RunState, SharedState};
    use crate::schema::config::AggregatorGroup;
    use crate::types::NodeKey;
    use serde_json::{Value, json};
    use std::sync::Arc;

    fn test_ctx() -> ExecutionContext {
        let (_handle, cancel) = cancel_pair();
        let (events, _rx) = flume::unbounded();
        ExecutionContext {
            execute_id: 1,
            root_execute_id: 1,
            node_key: NodeKey::from("agg"),
            state: SharedState::new(RunState::new()),
            events,
            cancel,
            id_gen: Arc::new(SequentialIdGenerator::default()),
            variables: Arc::new(InMemoryVariableStore::new()),
        }
    }

    fn obj(v: Value) -> ValueMap {
        match v {
            Value::Object(m) => m,
            _ => panic!("expected object"),
        }
    }

    fn config() -> AggregatorConfig {
        AggregatorConfig {
            groups: vec![
                AggregatorGroup {
                    name: "Group1".to_string(),
                    len: 2,
                },
                AggregatorGroup {
                    name: "Group2".to_string(),
                    len: 2,
                },
            ],
        }
    }

    #[tokio::test]
    async fn picks_first_non_null_per_group() {
        let exec = AggregatorExecutor::new(config());
        let ctx = test_ctx();
        let input = obj(json!({
            "Group1": {"0": null, "1": "str_v1"},
            "Group2": {"0": 1, "1": 2},
        }));

        let NodeOutcome::Output(output) = exec.invoke(&ctx, input).await.unwrap() else {
            panic!("expected output");
        };
        assert_eq!(output["Group1"], json!("str_v1"));
        assert_eq!(output["Group2"], json!(1));

        let choices = ctx
            .state
            .with(|s| s.group_choices[&NodeKey::from("agg")].clone());
        assert_eq!(choices["Group1"], 1);
        assert_eq!(choices["Group2"], 0);
    }

    #[tokio::test]
    async fn all_null_group_records_no_choice_and_no_output() {
        let exec = AggregatorExecutor::new(config());
        let ctx = test_ctx();
        let input = obj(json!({
            "Group1": {"0": null, "1": null},
            "Group2": {"1": false},
        }));

        let NodeOutcome::Output(output) = exec.invoke(&ctx, input).await.unwrap() else {
            panic!("expected output");
        };
        assert!(!output.contains_key("Group1"));
        assert_eq!(output["Group2"], json!(false));

        let choices = ctx
            .state
            .with(|s| s.group_choices[&NodeKey::from("agg")].clone());
        assert_eq!(choices["Group1"], NO_CHOICE);
        assert_eq!(choices["Group2"], 1);
    }
}
