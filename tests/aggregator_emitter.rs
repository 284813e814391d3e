//! Variable aggregation and template emission, end to end.

mod common;
use common::*;

use std::time::Duration;

use graphloom::event_bus::RunEvent;
use graphloom::nodes::Lambda;
use graphloom::registry::NodeRegistry;
use graphloom::runtime::WorkflowApp;
use graphloom::schema::{
    AggregatorConfig, AggregatorGroup, Clause, ClauseRelation, EmitterConfig, NodeConfig,
    NodeSchema, Operator, SelectorBranch, SelectorConfig, WorkflowSchema,
};
use graphloom::types::{NodeKey, Port};
use graphloom::utils::ValueMap;
use serde_json::{Value, json};

fn value_registry() -> NodeRegistry {
    NodeRegistry::new()
        .with_executor(
            "str_producer",
            Lambda::new(|_, _| {
                let mut out = ValueMap::new();
                out.insert("s".to_string(), json!("str_v1"));
                Ok(out)
            }),
        )
        .with_executor(
            "int_producer",
            Lambda::new(|_, _| {
                let mut out = ValueMap::new();
                out.insert("n".to_string(), json!(1));
                Ok(out)
            }),
        )
}

fn two_groups() -> NodeConfig {
    NodeConfig::VariableAggregator(AggregatorConfig {
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
    })
}

#[tokio::test]
async fn aggregator_picks_first_non_null_candidate_per_group() {
    let schema = WorkflowSchema::new()
        .with_node(lambda_node("p_str", "str_producer"))
        .with_node(lambda_node("p_int", "int_producer"))
        .with_node(
            NodeSchema::new("agg", two_groups())
                .with_input_source(fixed("Group1.0", Value::Null))
                .with_input_source(mapped("Group1.1", "p_str", "s"))
                .with_input_source(mapped("Group2.0", "p_int", "n"))
                .with_input_source(fixed("Group2.1", json!(2))),
        )
        .with_connection(edge(NodeKey::entry(), "p_str"))
        .with_connection(edge(NodeKey::entry(), "p_int"))
        .with_connection(edge("p_str", "agg"))
        .with_connection(edge("p_int", "agg"))
        .with_connection(edge("agg", NodeKey::exit()))
        .with_output_source(mapped("Group1", "agg", "Group1"))
        .with_output_source(mapped("Group2", "agg", "Group2"));

    let app = WorkflowApp::builder(schema, value_registry()).build().unwrap();
    let output = run_to_completion(&app, ValueMap::new()).await;
    assert_eq!(output["Group1"], json!("str_v1"));
    assert_eq!(output["Group2"], json!(1));
}

#[tokio::test]
async fn exhausted_group_produces_no_output_field() {
    let schema = WorkflowSchema::new()
        .with_node(
            NodeSchema::new(
                "agg",
                NodeConfig::VariableAggregator(AggregatorConfig {
                    groups: vec![AggregatorGroup {
                        name: "Group1".to_string(),
                        len: 2,
                    }],
                }),
            )
            .with_input_source(fixed("Group1.0", Value::Null))
            .with_input_source(fixed("Group1.1", Value::Null)),
        )
        .with_connection(edge(NodeKey::entry(), "agg"))
        .with_connection(edge("agg", NodeKey::exit()))
        .with_output_source(mapped("Group1", "agg", "Group1"));

    let app = WorkflowApp::builder(schema, NodeRegistry::new())
        .build()
        .unwrap();
    let output = run_to_completion(&app, ValueMap::new()).await;
    assert!(!output.contains_key("Group1"));
}

#[tokio::test]
async fn skipped_candidate_falls_through_to_the_next() {
    let registry = value_registry();
    let schema = WorkflowSchema::new()
        .with_node(
            NodeSchema::new(
                "gate",
                NodeConfig::Selector(SelectorConfig {
                    branches: vec![SelectorBranch {
                        clauses: vec![Clause {
                            left: "use_primary".to_string(),
                            op: Operator::IsTrue,
                            right: None,
                        }],
                        relation: ClauseRelation::And,
                    }],
                }),
            )
            .with_input_source(mapped("use_primary", NodeKey::entry(), "use_primary")),
        )
        .with_node(lambda_node("primary", "str_producer"))
        .with_node(lambda_node("fallback", "int_producer"))
        .with_node(
            NodeSchema::new(
                "agg",
                NodeConfig::VariableAggregator(AggregatorConfig {
                    groups: vec![AggregatorGroup {
                        name: "Group1".to_string(),
                        len: 2,
                    }],
                }),
            )
            .with_input_source(mapped("Group1.0", "primary", "s"))
            .with_input_source(mapped("Group1.1", "fallback", "n")),
        )
        .with_connection(edge(NodeKey::entry(), "gate"))
        .with_connection(edge("gate", "primary").with_port(Port::Branch(0)))
        .with_connection(edge("gate", "fallback").with_port(Port::Default))
        .with_connection(edge("primary", "agg"))
        .with_connection(edge("fallback", "agg"))
        .with_connection(edge("agg", NodeKey::exit()))
        .with_output_source(mapped("Group1", "agg", "Group1"));

    let app = WorkflowApp::builder(schema, registry).build().unwrap();
    let output =
        run_to_completion(&app, input_map(&[("use_primary", json!(false))])).await;
    assert_eq!(output["Group1"], json!(1));
}

#[tokio::test]
async fn emitter_renders_its_template_over_mapped_fields() {
    let registry = NodeRegistry::new().with_executor(
        "count",
        Lambda::new(|_, _| {
            let mut out = ValueMap::new();
            out.insert("n".to_string(), json!(3));
            Ok(out)
        }),
    );
    let schema = WorkflowSchema::new()
        .with_node(lambda_node("count", "count"))
        .with_node(
            NodeSchema::new(
                "emit",
                NodeConfig::OutputEmitter(EmitterConfig {
                    template: "Hello {{name}}, you have {{n}} items".to_string(),
                    streaming: false,
                }),
            )
            .with_input_source(mapped("name", NodeKey::entry(), "name"))
            .with_input_source(mapped("n", "count", "n")),
        )
        .with_connection(edge(NodeKey::entry(), "count"))
        .with_connection(edge("count", "emit"))
        .with_connection(edge("emit", NodeKey::exit()))
        .with_output_source(mapped("text", "emit", "output"));

    let app = WorkflowApp::builder(schema, registry).build().unwrap();
    let output = run_to_completion(&app, input_map(&[("name", json!("Ada"))])).await;
    assert_eq!(output["text"], json!("Hello Ada, you have 3 items"));
}

#[tokio::test]
async fn streaming_emitter_publishes_deltas_on_the_bus() {
    let schema = WorkflowSchema::new()
        .with_node(
            NodeSchema::new(
                "emit",
                NodeConfig::OutputEmitter(EmitterConfig {
                    template: "Hi {{name}}".to_string(),
                    streaming: true,
                }),
            )
            .with_input_source(mapped("name", NodeKey::entry(), "name")),
        )
        .with_connection(edge(NodeKey::entry(), "emit"))
        .with_connection(edge("emit", NodeKey::exit()))
        .with_output_source(mapped("text", "emit", "output"));

    let app = WorkflowApp::builder(schema, NodeRegistry::new())
        .build()
        .unwrap();
    let mut events = app.subscribe();
    let output = run_to_completion(&app, input_map(&[("name", json!("Ada"))])).await;
    assert_eq!(output["text"], json!("Hi Ada"));

    let mut deltas = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("event bus stalled")
            .expect("event bus closed");
        match event {
            RunEvent::StreamDelta { field, delta, .. } => deltas.push((field, delta)),
            RunEvent::Completed { .. } => break,
            _ => {}
        }
    }
    assert_eq!(deltas, vec![("output".to_string(), json!("Hi Ada"))]);
}
