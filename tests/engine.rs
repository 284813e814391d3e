//! End-to-end runs of flat leaf-node graphs: field mapping, static values,
//! compile rejection, stall detection, and run bookkeeping.

mod common;
use common::*;

use std::sync::Arc;

use graphloom::nodes::Lambda;
use graphloom::registry::NodeRegistry;
use graphloom::runtime::{
    EngineError, HistoryStore, InMemoryHistoryStore, RunOutcome, RunStatus, SequentialIdGenerator,
    WorkflowApp,
};
use graphloom::schema::WorkflowSchema;
use graphloom::types::NodeKey;
use graphloom::utils::ValueMap;
use serde_json::json;

fn greeting_registry() -> NodeRegistry {
    NodeRegistry::new()
        .with_executor(
            "greet",
            Lambda::new(|_, input| {
                let name = input.get("name").and_then(|v| v.as_str()).unwrap_or("?");
                let mut out = ValueMap::new();
                out.insert("greeting".to_string(), json!(format!("Hello {name}")));
                Ok(out)
            }),
        )
        .with_executor(
            "shout",
            Lambda::new(|_, input| {
                let text = input.get("text").and_then(|v| v.as_str()).unwrap_or("");
                let punct = input.get("punct").and_then(|v| v.as_str()).unwrap_or("");
                let mut out = ValueMap::new();
                out.insert(
                    "text".to_string(),
                    json!(format!("{}{punct}", text.to_uppercase())),
                );
                Ok(out)
            }),
        )
}

fn greeting_schema() -> WorkflowSchema {
    WorkflowSchema::new()
        .with_node(lambda_node("greet", "greet").with_input_source(mapped(
            "name",
            NodeKey::entry(),
            "name",
        )))
        .with_node(
            lambda_node("shout", "shout")
                .with_input_source(mapped("text", "greet", "greeting"))
                .with_input_source(fixed("punct", json!("!"))),
        )
        .with_connection(edge(NodeKey::entry(), "greet"))
        .with_connection(edge("greet", "shout"))
        .with_connection(edge("shout", NodeKey::exit()))
        .with_output_source(mapped("result", "shout", "text"))
}

#[tokio::test]
async fn linear_pipeline_maps_fields_through() {
    let app = WorkflowApp::builder(greeting_schema(), greeting_registry())
        .build()
        .unwrap();
    let output = run_to_completion(&app, input_map(&[("name", json!("Ada"))])).await;
    assert_eq!(output["result"], json!("HELLO ADA!"));
}

#[tokio::test]
async fn nested_paths_drill_into_producer_output() {
    let registry = NodeRegistry::new().with_executor(
        "wrap",
        Lambda::new(|_, input| {
            let mut out = ValueMap::new();
            out.insert("meta".to_string(), json!({ "inner": input.get("v") }));
            Ok(out)
        }),
    );
    let schema = WorkflowSchema::new()
        .with_node(lambda_node("wrap", "wrap").with_input_source(mapped(
            "v",
            NodeKey::entry(),
            "payload.value",
        )))
        .with_connection(edge(NodeKey::entry(), "wrap"))
        .with_connection(edge("wrap", NodeKey::exit()))
        .with_output_source(mapped("got", "wrap", "meta.inner"));

    let app = WorkflowApp::builder(schema, registry).build().unwrap();
    let output = run_to_completion(
        &app,
        input_map(&[("payload", json!({ "value": 7 }))]),
    )
    .await;
    assert_eq!(output["got"], json!(7));
}

#[tokio::test]
async fn independent_nodes_run_in_the_same_superstep() {
    let registry = NodeRegistry::new()
        .with_executor(
            "echo",
            Lambda::new(|_, input| Ok(input)),
        )
        .with_executor(
            "join",
            Lambda::new(|_, input| {
                let a = input.get("a").and_then(|v| v.as_str()).unwrap_or("");
                let b = input.get("b").and_then(|v| v.as_str()).unwrap_or("");
                let mut out = ValueMap::new();
                out.insert("joined".to_string(), json!(format!("{a}+{b}")));
                Ok(out)
            }),
        );
    let schema = WorkflowSchema::new()
        .with_node(lambda_node("left", "echo").with_input_source(fixed("x", json!("l"))))
        .with_node(lambda_node("right", "echo").with_input_source(fixed("x", json!("r"))))
        .with_node(
            lambda_node("join", "join")
                .with_input_source(mapped("a", "left", "x"))
                .with_input_source(mapped("b", "right", "x")),
        )
        .with_connection(edge(NodeKey::entry(), "left"))
        .with_connection(edge(NodeKey::entry(), "right"))
        .with_connection(edge("left", "join"))
        .with_connection(edge("right", "join"))
        .with_connection(edge("join", NodeKey::exit()))
        .with_output_source(mapped("joined", "join", "joined"));

    let app = WorkflowApp::builder(schema, registry).build().unwrap();
    let output = run_to_completion(&app, ValueMap::new()).await;
    assert_eq!(output["joined"], json!("l+r"));
}

#[tokio::test]
async fn unregistered_executor_is_a_compile_error() {
    let schema = WorkflowSchema::new()
        .with_node(lambda_node("ghost", "missing"))
        .with_connection(edge(NodeKey::entry(), "ghost"))
        .with_connection(edge("ghost", NodeKey::exit()));

    let err = WorkflowApp::builder(schema, NodeRegistry::new())
        .build()
        .unwrap_err();
    assert!(matches!(err, EngineError::UnknownExecutor { name } if name == "missing"));
}

#[tokio::test]
async fn dependency_cycle_stalls_the_run() {
    let registry = NodeRegistry::new().with_executor("echo", Lambda::new(|_, input| Ok(input)));
    let schema = WorkflowSchema::new()
        .with_node(lambda_node("a", "echo").with_input_source(mapped("x", "b", "x")))
        .with_node(lambda_node("b", "echo").with_input_source(mapped("x", "a", "x")))
        .with_connection(edge("a", "b"))
        .with_connection(edge("b", "a"))
        .with_connection(edge("b", NodeKey::exit()))
        .with_output_source(mapped("x", "b", "x"));

    let app = WorkflowApp::builder(schema, registry).build().unwrap();
    let err = app.run(ValueMap::new()).await.unwrap_err();
    assert!(matches!(err, EngineError::Stalled { .. }));
}

#[tokio::test]
async fn failing_node_fails_the_run_under_throw_policy() {
    let registry = NodeRegistry::new().with_executor(
        "boom",
        Lambda::new(|ctx, _| {
            Err(graphloom::nodes::NodeError::Execution {
                node: ctx.node_key.clone(),
                message: "no luck".to_string(),
            })
        }),
    );
    let schema = WorkflowSchema::new()
        .with_node(lambda_node("boom", "boom"))
        .with_connection(edge(NodeKey::entry(), "boom"))
        .with_connection(edge("boom", NodeKey::exit()));

    let app = WorkflowApp::builder(schema, registry).build().unwrap();
    let err = app.run(ValueMap::new()).await.unwrap_err();
    assert!(matches!(err, EngineError::Node(_)));
}

#[tokio::test]
async fn history_records_success_and_failure() {
    let history = Arc::new(InMemoryHistoryStore::new());

    let app = WorkflowApp::builder(greeting_schema(), greeting_registry())
        .with_history_store(history.clone())
        .build()
        .unwrap();
    let outcome = app
        .run(input_map(&[("name", json!("Ada"))]))
        .await
        .unwrap();
    let record = history
        .run(outcome.execute_id())
        .await
        .unwrap()
        .expect("run record");
    assert_eq!(record.status, RunStatus::Succeeded);
    assert!(record.output.is_some());
    assert!(record.finished_at.is_some());

    let registry = NodeRegistry::new().with_executor(
        "boom",
        Lambda::new(|_, _| Err(graphloom::nodes::NodeError::Internal("boom".to_string()))),
    );
    let schema = WorkflowSchema::new()
        .with_node(lambda_node("boom", "boom"))
        .with_connection(edge(NodeKey::entry(), "boom"))
        .with_connection(edge("boom", NodeKey::exit()));
    let failing_history = Arc::new(InMemoryHistoryStore::new());
    let failing = WorkflowApp::builder(schema, registry)
        .with_history_store(failing_history.clone())
        .with_id_generator(Arc::new(SequentialIdGenerator::default()))
        .build()
        .unwrap();
    failing.run(ValueMap::new()).await.unwrap_err();

    let record = failing_history.run(1).await.unwrap().expect("run record");
    assert_eq!(record.status, RunStatus::Failed);
    assert!(record.error.is_some());
}

#[tokio::test]
async fn stream_consumers_see_replayed_upstream_output() {
    use graphloom::schema::StreamConfig;

    // The collector's default transform drains the replayed chunk stream
    // back into a map, so the observable result matches map delivery.
    let registry = greeting_registry().with_executor(
        "collect",
        Lambda::new(|_, input| {
            let text = input.get("text").and_then(|v| v.as_str()).unwrap_or("");
            let mut out = ValueMap::new();
            out.insert("seen".to_string(), json!(text.to_string()));
            Ok(out)
        }),
    );
    let schema = WorkflowSchema::new()
        .with_node(lambda_node("greet", "greet").with_input_source(mapped(
            "name",
            NodeKey::entry(),
            "name",
        )))
        .with_node(
            lambda_node("collect", "collect")
                .with_input_source(mapped("text", "greet", "greeting"))
                .with_stream(StreamConfig {
                    can_generate_stream: false,
                    require_streaming_input: true,
                }),
        )
        .with_connection(edge(NodeKey::entry(), "greet"))
        .with_connection(edge("greet", "collect"))
        .with_connection(edge("collect", NodeKey::exit()))
        .with_output_source(mapped("seen", "collect", "seen"));

    let app = WorkflowApp::builder(schema, registry).build().unwrap();
    let output = run_to_completion(&app, input_map(&[("name", json!("Ada"))])).await;
    assert_eq!(output["seen"], json!("Hello Ada"));
}

#[tokio::test]
async fn node_lifecycle_events_reach_subscribers() {
    use graphloom::event_bus::RunEvent;
    use std::time::Duration;

    let app = WorkflowApp::builder(greeting_schema(), greeting_registry())
        .build()
        .unwrap();
    let mut events = app.subscribe();
    run_to_completion(&app, input_map(&[("name", json!("Ada"))])).await;

    let mut started = Vec::new();
    let mut ended = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("event bus stalled")
            .expect("event bus closed");
        match event {
            RunEvent::NodeStart { node_key, .. } => started.push(node_key),
            RunEvent::NodeEnd { node_key, .. } => ended.push(node_key),
            RunEvent::Completed { .. } => break,
            _ => {}
        }
    }
    assert_eq!(started, vec![NodeKey::from("greet"), NodeKey::from("shout")]);
    assert_eq!(ended, started);
}

#[tokio::test]
async fn variable_refs_read_from_the_bound_store() {
    use graphloom::runtime::{InMemoryVariableStore, VariableStore};
    use graphloom::schema::{FieldInfo, FieldRef, FieldSource, VarKind};
    use graphloom::types::FieldPath;

    let variables = Arc::new(InMemoryVariableStore::new());
    variables
        .set(
            VarKind::GlobalUser,
            &FieldPath::single("locale"),
            json!("nb-NO"),
        )
        .await
        .unwrap();

    let registry = NodeRegistry::new().with_executor("echo", Lambda::new(|_, input| Ok(input)));
    let schema = WorkflowSchema::new()
        .with_node(lambda_node("echo", "echo").with_input_source(FieldInfo::new(
            FieldPath::single("locale"),
            FieldSource::Ref(FieldRef::variable(
                VarKind::GlobalUser,
                FieldPath::single("locale"),
            )),
        )))
        .with_connection(edge(NodeKey::entry(), "echo"))
        .with_connection(edge("echo", NodeKey::exit()))
        .with_output_source(mapped("locale", "echo", "locale"));

    let app = WorkflowApp::builder(schema, registry)
        .with_variable_store(variables)
        .build()
        .unwrap();
    let output = run_to_completion(&app, ValueMap::new()).await;
    assert_eq!(output["locale"], json!("nb-NO"));
}

#[tokio::test]
async fn run_outcome_carries_execute_id() {
    let app = WorkflowApp::builder(greeting_schema(), greeting_registry())
        .build()
        .unwrap();
    let outcome = app
        .run(input_map(&[("name", json!("Ada"))]))
        .await
        .unwrap();
    let RunOutcome::Completed { execute_id, .. } = outcome else {
        panic!("expected completion");
    };
    assert!(execute_id != 0);
}
