//! Per-node retry, timeout, and error-policy behavior observed from a full
//! run rather than from the wrapper in isolation.

mod common;
use common::*;

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use graphloom::nodes::{Lambda, NodeError};
use graphloom::registry::NodeRegistry;
use graphloom::runtime::{EngineError, WorkflowApp};
use graphloom::schema::{ErrorProcess, ExceptionConfig, TypeInfo, WorkflowSchema};
use graphloom::types::{NodeKey, Port};
use graphloom::utils::ValueMap;
use serde_json::json;

fn failing_until(succeed_on: u32) -> (Lambda, Arc<AtomicU32>) {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let exec = Lambda::new(move |_, input| {
        let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
        if n < succeed_on {
            Err(NodeError::Internal(format!("attempt {n} failed")))
        } else {
            Ok(input)
        }
    });
    (exec, calls)
}

#[tokio::test]
async fn retries_recover_a_flaky_node() {
    let (exec, calls) = failing_until(3);
    let registry = NodeRegistry::new().with_executor("flaky", exec);
    let schema = WorkflowSchema::new()
        .with_node(
            lambda_node("flaky", "flaky")
                .with_input_source(fixed("v", json!("ok")))
                .with_exception(ExceptionConfig {
                    max_retry: 3,
                    ..ExceptionConfig::default()
                }),
        )
        .with_connection(edge(NodeKey::entry(), "flaky"))
        .with_connection(edge("flaky", NodeKey::exit()))
        .with_output_source(mapped("v", "flaky", "v"));

    let app = WorkflowApp::builder(schema, registry).build().unwrap();
    let output = run_to_completion(&app, ValueMap::new()).await;
    assert_eq!(output["v"], json!("ok"));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn retries_recover_a_flaky_stream_consumer() {
    use graphloom::schema::StreamConfig;

    let (exec, calls) = failing_until(2);
    let registry = NodeRegistry::new()
        .with_executor("upstream", Lambda::new(|_, input| Ok(input)))
        .with_executor("flaky", exec);
    let schema = WorkflowSchema::new()
        .with_node(lambda_node("upstream", "upstream").with_input_source(fixed("v", json!("ok"))))
        .with_node(
            lambda_node("flaky", "flaky")
                .with_input_source(mapped("v", "upstream", "v"))
                .with_stream(StreamConfig {
                    can_generate_stream: false,
                    require_streaming_input: true,
                })
                .with_exception(ExceptionConfig {
                    max_retry: 3,
                    ..ExceptionConfig::default()
                }),
        )
        .with_connection(edge(NodeKey::entry(), "upstream"))
        .with_connection(edge("upstream", "flaky"))
        .with_connection(edge("flaky", NodeKey::exit()))
        .with_output_source(mapped("v", "flaky", "v"));

    // The second attempt must see the full input stream again.
    let app = WorkflowApp::builder(schema, registry).build().unwrap();
    let output = run_to_completion(&app, ValueMap::new()).await;
    assert_eq!(output["v"], json!("ok"));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn default_data_policy_keeps_the_run_going() {
    let registry = NodeRegistry::new()
        .with_executor(
            "boom",
            Lambda::new(|_, _| Err(NodeError::Internal("backend down".to_string()))),
        )
        .with_executor("pass", Lambda::new(|_, input| Ok(input)));
    let schema = WorkflowSchema::new()
        .with_node(
            lambda_node("boom", "boom")
                .with_output_type("answer", TypeInfo::String)
                .with_exception(ExceptionConfig {
                    process: ErrorProcess::ReturnDefaultData,
                    default_output: Some(r#"{"answer": "fallback"}"#.to_string()),
                    ..ExceptionConfig::default()
                }),
        )
        .with_node(
            lambda_node("consume", "pass")
                .with_input_source(mapped("answer", "boom", "answer"))
                .with_input_source(mapped("ok", "boom", "isSuccess")),
        )
        .with_connection(edge(NodeKey::entry(), "boom"))
        .with_connection(edge("boom", "consume"))
        .with_connection(edge("consume", NodeKey::exit()))
        .with_output_source(mapped("answer", "consume", "answer"))
        .with_output_source(mapped("ok", "consume", "ok"))
        .with_output_source(mapped("why", "boom", "errorBody.errorMessage"));

    let app = WorkflowApp::builder(schema, registry).build().unwrap();
    let output = run_to_completion(&app, ValueMap::new()).await;
    assert_eq!(output["answer"], json!("fallback"));
    assert_eq!(output["ok"], json!(false));
    assert!(output["why"].as_str().unwrap().contains("backend down"));
}

#[tokio::test]
async fn exception_branch_routes_the_failure_path() {
    let registry = NodeRegistry::new()
        .with_executor(
            "boom",
            Lambda::new(|_, _| Err(NodeError::Internal("no quota".to_string()))),
        )
        .with_executor("pass", Lambda::new(|_, input| Ok(input)));
    let schema = WorkflowSchema::new()
        .with_node(lambda_node("boom", "boom").with_exception(ExceptionConfig {
            process: ErrorProcess::ExceptionBranch,
            ..ExceptionConfig::default()
        }))
        .with_node(
            lambda_node("handler", "pass")
                .with_input_source(mapped("msg", "boom", "errorBody.errorMessage")),
        )
        .with_node(
            lambda_node("normal", "pass").with_input_source(fixed("msg", json!("all good"))),
        )
        .with_connection(edge(NodeKey::entry(), "boom"))
        .with_connection(edge("boom", "handler").with_port(Port::Exception))
        .with_connection(edge("boom", "normal"))
        .with_connection(edge("handler", NodeKey::exit()))
        .with_connection(edge("normal", NodeKey::exit()))
        .with_output_source(mapped("handled", "handler", "msg"))
        .with_output_source(mapped("normal", "normal", "msg"));

    let app = WorkflowApp::builder(schema, registry).build().unwrap();
    let output = run_to_completion(&app, ValueMap::new()).await;
    assert!(output["handled"].as_str().unwrap().contains("no quota"));
    assert!(!output.contains_key("normal"));
}

#[tokio::test]
async fn exception_branch_success_takes_the_normal_path() {
    let registry = NodeRegistry::new()
        .with_executor(
            "fine",
            Lambda::new(|_, mut input| {
                input.insert("v".to_string(), json!("worked"));
                Ok(input)
            }),
        )
        .with_executor("pass", Lambda::new(|_, input| Ok(input)));
    let schema = WorkflowSchema::new()
        .with_node(lambda_node("fine", "fine").with_exception(ExceptionConfig {
            process: ErrorProcess::ExceptionBranch,
            ..ExceptionConfig::default()
        }))
        .with_node(
            lambda_node("handler", "pass")
                .with_input_source(mapped("msg", "fine", "errorBody.errorMessage")),
        )
        .with_node(lambda_node("normal", "pass").with_input_source(mapped("v", "fine", "v")))
        .with_connection(edge(NodeKey::entry(), "fine"))
        .with_connection(edge("fine", "handler").with_port(Port::Exception))
        .with_connection(edge("fine", "normal"))
        .with_connection(edge("handler", NodeKey::exit()))
        .with_connection(edge("normal", NodeKey::exit()))
        .with_output_source(mapped("handled", "handler", "msg"))
        .with_output_source(mapped("v", "normal", "v"));

    let app = WorkflowApp::builder(schema, registry).build().unwrap();
    let output = run_to_completion(&app, ValueMap::new()).await;
    assert_eq!(output["v"], json!("worked"));
    assert!(!output.contains_key("handled"));
}

#[tokio::test]
async fn timeout_with_throw_policy_fails_the_run() {
    let registry = NodeRegistry::new().with_executor(
        "pass",
        Lambda::new(|_, input| Ok(input)),
    );
    // A lambda cannot sleep, so the timeout is exercised through an executor
    // that never yields its output in time.
    struct Sleeper;
    #[async_trait::async_trait]
    impl graphloom::nodes::NodeExecutor for Sleeper {
        async fn invoke(
            &self,
            _ctx: &graphloom::runtime::ExecutionContext,
            _input: ValueMap,
        ) -> Result<graphloom::nodes::NodeOutcome, NodeError> {
            tokio::time::sleep(std::time::Duration::from_secs(30)).await;
            Ok(graphloom::nodes::NodeOutcome::Output(ValueMap::new()))
        }
    }
    let registry = registry.with_executor_arc("sleeper", Arc::new(Sleeper));
    let schema = WorkflowSchema::new()
        .with_node(lambda_node("slow", "sleeper").with_exception(ExceptionConfig {
            timeout_ms: Some(20),
            ..ExceptionConfig::default()
        }))
        .with_connection(edge(NodeKey::entry(), "slow"))
        .with_connection(edge("slow", NodeKey::exit()));

    let app = WorkflowApp::builder(schema, registry).build().unwrap();
    let err = app.run(ValueMap::new()).await.unwrap_err();
    let EngineError::Node(NodeError::Timeout { ms, .. }) = err else {
        panic!("expected timeout, got {err}");
    };
    assert_eq!(ms, 20);
}
