//! Checkpointed suspension and the resume protocol, including its error
//! surface.

mod common;
use common::*;

use std::sync::Arc;

use graphloom::registry::NodeRegistry;
use graphloom::runtime::{
    CheckpointStore, EngineError, InMemoryCheckpointStore, InterruptKind, ResumeLock, RunStatus,
    WorkflowApp,
};
use graphloom::schema::{NodeConfig, NodeSchema, ReceiverConfig, TypeInfo, WorkflowSchema};
use graphloom::types::NodeKey;
use rustc_hash::FxHashMap;
use serde_json::json;

fn receiver_schema() -> WorkflowSchema {
    let mut output_fields = FxHashMap::default();
    output_fields.insert("city".to_string(), TypeInfo::String);
    output_fields.insert("days".to_string(), TypeInfo::Integer);
    WorkflowSchema::new()
        .with_node(NodeSchema::new(
            "recv",
            NodeConfig::InputReceiver(ReceiverConfig {
                prompt: "where to?".to_string(),
                output_fields,
            }),
        ))
        .with_connection(edge(NodeKey::entry(), "recv"))
        .with_connection(edge("recv", NodeKey::exit()))
        .with_output_source(mapped("city", "recv", "city"))
        .with_output_source(mapped("days", "recv", "days"))
}

#[tokio::test]
async fn receiver_suspends_and_resumes_with_payload() {
    let app = WorkflowApp::builder(receiver_schema(), NodeRegistry::new())
        .build()
        .unwrap();

    let (execute_id, event) = run_to_suspension(&app, Default::default()).await;
    assert_eq!(
        event.kind,
        InterruptKind::InputRequired {
            prompt: "where to?".to_string()
        }
    );
    assert_eq!(event.node_path.to_string(), "recv");

    let output =
        resume_to_completion(&app, execute_id, event.id, r#"{"city": "Oslo"}"#).await;
    assert_eq!(output["city"], json!("Oslo"));
    assert_eq!(output["days"], json!(0));
}

#[tokio::test]
async fn resume_replays_executed_nodes_without_rerunning_them() {
    use graphloom::nodes::Lambda;
    use graphloom::utils::ValueMap;
    use std::sync::atomic::{AtomicU32, Ordering};

    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let registry = NodeRegistry::new().with_executor(
        "tally",
        Lambda::new(move |_, input| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(input)
        }),
    );
    let mut output_fields = FxHashMap::default();
    output_fields.insert("city".to_string(), TypeInfo::String);
    let schema = WorkflowSchema::new()
        .with_node(lambda_node("tally", "tally").with_input_source(fixed("v", json!("once"))))
        .with_node(NodeSchema::new(
            "recv",
            NodeConfig::InputReceiver(ReceiverConfig {
                prompt: "where to?".to_string(),
                output_fields,
            }),
        ))
        .with_connection(edge(NodeKey::entry(), "tally"))
        .with_connection(edge("tally", "recv"))
        .with_connection(edge("recv", NodeKey::exit()))
        .with_output_source(mapped("city", "recv", "city"))
        .with_output_source(mapped("v", "tally", "v"));

    let app = WorkflowApp::builder(schema, registry).build().unwrap();
    let (execute_id, event) = run_to_suspension(&app, ValueMap::new()).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // The resumed run replays the recorded output instead of re-invoking.
    let output =
        resume_to_completion(&app, execute_id, event.id, r#"{"city": "Oslo"}"#).await;
    assert_eq!(output["city"], json!("Oslo"));
    assert_eq!(output["v"], json!("once"));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn malformed_receiver_payload_fails_the_resume() {
    let app = WorkflowApp::builder(receiver_schema(), NodeRegistry::new())
        .build()
        .unwrap();
    let (execute_id, event) = run_to_suspension(&app, Default::default()).await;

    let err = app
        .resume(execute_id, event.id, "definitely not json")
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Node(_)));
}

#[tokio::test]
async fn resume_with_unknown_event_id_is_rejected() {
    let app = WorkflowApp::builder(receiver_schema(), NodeRegistry::new())
        .build()
        .unwrap();
    let (execute_id, event) = run_to_suspension(&app, Default::default()).await;

    let err = app
        .resume(execute_id, event.id + 999, "{}")
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::UnknownInterruptEvent { .. }));
}

#[tokio::test]
async fn completed_run_cannot_be_resumed() {
    let app = WorkflowApp::builder(receiver_schema(), NodeRegistry::new())
        .build()
        .unwrap();
    let (execute_id, event) = run_to_suspension(&app, Default::default()).await;
    resume_to_completion(&app, execute_id, event.id, "{}").await;

    let err = app.resume(execute_id, event.id, "{}").await.unwrap_err();
    assert!(matches!(err, EngineError::NotSuspended { .. }));
}

#[tokio::test]
async fn resume_of_unknown_run_is_rejected() {
    let app = WorkflowApp::builder(receiver_schema(), NodeRegistry::new())
        .build()
        .unwrap();
    let err = app.resume(424242, 1, "{}").await.unwrap_err();
    assert!(matches!(err, EngineError::Checkpoint(_)));
}

#[tokio::test]
async fn concurrent_resume_is_locked_out() {
    let checkpoints = Arc::new(InMemoryCheckpointStore::new());
    let app = WorkflowApp::builder(receiver_schema(), NodeRegistry::new())
        .with_checkpoint_store(checkpoints.clone())
        .build()
        .unwrap();
    let (execute_id, event) = run_to_suspension(&app, Default::default()).await;

    // Another caller claims the resume first.
    let lock = checkpoints
        .try_lock_resume(execute_id, event.id)
        .await
        .unwrap();
    assert_eq!(lock, ResumeLock::Acquired);

    let err = app
        .resume(execute_id, event.id, r#"{"city": "Oslo"}"#)
        .await
        .unwrap_err();
    let EngineError::ResumeLocked {
        resuming_event_id, ..
    } = err
    else {
        panic!("expected resume lock error, got {err}");
    };
    assert_eq!(resuming_event_id, event.id);

    // Releasing the lock lets the resume proceed.
    checkpoints.release_resume_lock(execute_id).await.unwrap();
    checkpoints
        .set_status(execute_id, RunStatus::Suspended)
        .await
        .unwrap();
    let output =
        resume_to_completion(&app, execute_id, event.id, r#"{"city": "Oslo"}"#).await;
    assert_eq!(output["city"], json!("Oslo"));
}

#[tokio::test]
async fn suspended_runs_are_isolated_by_execute_id() {
    let app = WorkflowApp::builder(receiver_schema(), NodeRegistry::new())
        .build()
        .unwrap();
    let (first_id, first_event) = run_to_suspension(&app, Default::default()).await;
    let (second_id, second_event) = run_to_suspension(&app, Default::default()).await;
    assert_ne!(first_id, second_id);

    let second = resume_to_completion(
        &app,
        second_id,
        second_event.id,
        r#"{"city": "Bergen"}"#,
    )
    .await;
    let first =
        resume_to_completion(&app, first_id, first_event.id, r#"{"city": "Oslo"}"#).await;
    assert_eq!(first["city"], json!("Oslo"));
    assert_eq!(second["city"], json!("Bergen"));
}
