//! Selector node: routes exactly one branch port.
//!
//! Branches evaluate in declared order against the assembled input map; the
//! first branch whose clauses hold routes `Port::Branch(i)`. When nothing
//! matches the default port routes, and downstream skip propagation handles
//! the case where no default connection exists.

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::runtime::context::ExecutionContext;
use crate::schema::config::{Clause, ClauseRelation, Operator, SelectorConfig};
use crate::types::Port;
use crate::utils::ValueMap;

use super::{NodeError, NodeExecutor, NodeOutcome};

pub struct SelectorExecutor {
    config: SelectorConfig,
}

impl SelectorExecutor {
    #[must_use]
    pub fn new(config: SelectorConfig) -> Self {
        SelectorExecutor { config }
    }

    fn eval_branch(&self, clauses: &[Clause], relation: ClauseRelation, input: &ValueMap) -> bool {
        match relation {
            ClauseRelation::And => clauses.iter().all(|c| eval_clause(c, input)),
            ClauseRelation::Or => clauses.iter().any(|c| eval_clause(c, input)),
        }
    }
}

#[async_trait]
impl NodeExecutor for SelectorExecutor {
    async fn invoke(
        &self,
        ctx: &ExecutionContext,
        input: ValueMap,
    ) -> Result<NodeOutcome, NodeError> {
        for (i, branch) in self.config.branches.iter().enumerate() {
            if self.eval_branch(&branch.clauses, branch.relation, &input) {
                debug!(node = %ctx.node_key, branch = i, "selector matched");
                return Ok(NodeOutcome::Routed {
                    port: Port::Branch(i),
                    output: ValueMap::new(),
                });
            }
        }
        debug!(node = %ctx.node_key, "selector fell through to default");
        Ok(NodeOutcome::Routed {
            port: Port::Default,
            output: ValueMap::new(),
        })
    }
}

fn eval_clause(clause: &Clause, input: &ValueMap) -> bool {
    let left = input.get(clause.left.as_str());
    if clause.op.is_unary() {
        return eval_unary(clause.op, left);
    }
    let right = clause.right.as_deref().and_then(|key| input.get(key));
    eval_binary(clause.op, left, right)
}

fn eval_unary(op: Operator, left: Option<&Value>) -> bool {
    match op {
        Operator::Empty => is_empty(left),
        Operator::NotEmpty => !is_empty(left),
        Operator::IsTrue => left.and_then(Value::as_bool) == Some(true),
        Operator::IsFalse => left.and_then(Value::as_bool) == Some(false),
        _ => false,
    }
}

fn eval_binary(op: Operator, left: Option<&Value>, right: Option<&Value>) -> bool {
    match op {
        Operator::Equal => values_equal(left, right),
        Operator::NotEqual => !values_equal(left, right),
        Operator::Greater => compare(left, right).is_some_and(|o| o == std::cmp::Ordering::Greater),
        Operator::GreaterOrEqual => {
            compare(left, right).is_some_and(|o| o != std::cmp::Ordering::Less)
        }
        Operator::Lesser => compare(left, right).is_some_and(|o| o == std::cmp::Ordering::Less),
        Operator::LesserOrEqual => {
            compare(left, right).is_some_and(|o| o != std::cmp::Ordering::Greater)
        }
        Operator::Contains => contains(left, right),
        Operator::NotContains => !contains(left, right),
        Operator::LengthGreater => match (left, right.and_then(Value::as_f64)) {
            (Some(l), Some(n)) => length_of(l).is_some_and(|len| (len as f64) > n),
            _ => false,
        },
        _ => false,
    }
}

fn is_empty(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.is_empty(),
        Some(Value::Array(items)) => items.is_empty(),
        Some(Value::Object(map)) => map.is_empty(),
        Some(_) => false,
    }
}

fn values_equal(left: Option<&Value>, right: Option<&Value>) -> bool {
    match (left, right) {
        (Some(l), Some(r)) => {
            // Numbers compare by value regardless of integer/float form.
            if let (Some(lf), Some(rf)) = (l.as_f64(), r.as_f64()) {
                return lf == rf;
            }
            l == r
        }
        _ => false,
    }
}

fn compare(left: Option<&Value>, right: Option<&Value>) -> Option<std::cmp::Ordering> {
    match (left?, right?) {
        (Value::String(l), Value::String(r)) => Some(l.cmp(r)),
        (l, r) => l.as_f64()?.partial_cmp(&r.as_f64()?),
    }
}

fn contains(left: Option<&Value>, right: Option<&Value>) -> bool {
    match (left, right) {
        (Some(Value::String(haystack)), Some(Value::String(needle))) => haystack.contains(needle),
        (Some(Value::Array(items)), Some(needle)) => items.iter().any(|v| v == needle),
        (Some(Value::Object(map)), Some(Value::String(key))) => map.contains_key(key),
        _ => false,
    }
}

fn length_of(value: &Value) -> Option<usize> {
    match value {
        Value::String(s) => Some(s.chars().count()),
        Value::Array(items) => Some(items.len()),
        Value::Object(map) => Some(map.len()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::config::SelectorBranch;
    use serde_json::json;

    fn obj(v: Value) -> ValueMap {
        match v {
            Value::Object(m) => m,
            _ => panic!("expected object"),
        }
    }

    fn clause(left: &str, op: Operator, right: Option<&str>) -> Clause {
        Clause {
            left: left.to_string(),
            op,
            right: right.map(str::to_string),
        }
    }

    #[test]
    fn binary_operators() {
        let input = obj(json!({"a": 3, "b": 3.0, "c": "hello", "d": "ell", "e": [1, 2], "f": 1}));
        assert!(eval_clause(&clause("a", Operator::Equal, Some("b")), &input));
        assert!(eval_clause(&clause("a", Operator::Greater, Some("f")), &input));
        assert!(eval_clause(&clause("c", Operator::Contains, Some("d")), &input));
        assert!(eval_clause(&clause("e", Operator::Contains, Some("f")), &input));
        assert!(eval_clause(&clause("c", Operator::LengthGreater, Some("a")), &input));
        assert!(!eval_clause(&clause("a", Operator::Equal, Some("missing")), &input));
    }

    #[test]
    fn unary_operators() {
        let input = obj(json!({"s": "", "arr": [0], "t": true}));
        assert!(eval_clause(&clause("s", Operator::Empty, None), &input));
        assert!(eval_clause(&clause("missing", Operator::Empty, None), &input));
        assert!(eval_clause(&clause("arr", Operator::NotEmpty, None), &input));
        assert!(eval_clause(&clause("t", Operator::IsTrue, None), &input));
        assert!(!eval_clause(&clause("t", Operator::IsFalse, None), &input));
    }

    fn test_ctx() -> ExecutionContext {
        use crate::runtime::context::{
            InMemoryVariableStore, SequentialIdGenerator, cancel_pair,
        };
        use crate::runtime::state::{RunState, SharedState};
        use std::sync::Arc;
        let (_handle, cancel) = cancel_pair();
        let (events, _rx) = flume::unbounded();
        ExecutionContext {
            execute_id: 1,
            root_execute_id: 1,
            node_key: crate::types::NodeKey::from("sel"),
            state: SharedState::new(RunState::new()),
            events,
            cancel,
            id_gen: Arc::new(SequentialIdGenerator::default()),
            variables: Arc::new(InMemoryVariableStore::new()),
        }
    }

    #[tokio::test]
    async fn first_matching_branch_wins() {
        let exec = SelectorExecutor::new(SelectorConfig {
            branches: vec![
                SelectorBranch {
                    clauses: vec![clause("score", Operator::Greater, Some("high"))],
                    relation: ClauseRelation::And,
                },
                SelectorBranch {
                    clauses: vec![clause("score", Operator::Greater, Some("low"))],
                    relation: ClauseRelation::And,
                },
            ],
        });
        let input = obj(json!({"score": 5, "high": 10, "low": 1}));
        let outcome = exec.invoke(&test_ctx(), input).await.unwrap();
        assert_eq!(
            outcome,
            NodeOutcome::Routed {
                port: Port::Branch(1),
                output: ValueMap::new(),
            }
        );
    }

    #[tokio::test]
    async fn no_match_routes_default_with_empty_output() {
        let exec = SelectorExecutor::new(SelectorConfig {
            branches: vec![SelectorBranch {
                clauses: vec![clause("flag", Operator::IsTrue, None)],
                relation: ClauseRelation::And,
            }],
        });
        let input = obj(json!({"flag": false}));
        let outcome = exec.invoke(&test_ctx(), input).await.unwrap();
        assert_eq!(
            outcome,
            NodeOutcome::Routed {
                port: Port::Default,
                output: ValueMap::new(),
            }
        );
    }
}
