//! Node execution policy: timeout, retry, panic capture, error handling.
//!
//! Every node invocation goes through [`run_node`]. The wall-clock budget
//! covers all attempts; a suspend is returned immediately and never retried;
//! panics inside executors are caught and treated as node failures. What a
//! failure means is decided by the node's [`ErrorProcess`]: propagate,
//! substitute the configured default output, or route the exception port.

use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::nodes::{
    NodeError, NodeExecutor, NodeOutcome, StreamItem, StreamReader, trim_finish_markers,
};
use crate::runtime::context::ExecutionContext;
use crate::schema::config::{ErrorProcess, ExceptionConfig};
use crate::schema::field::TypeInfo;
use crate::types::Port;
use crate::utils::ValueMap;

use rustc_hash::FxHashMap;

/// Output key flagging whether a policy-bearing node succeeded.
pub const IS_SUCCESS_KEY: &str = "isSuccess";
/// Output key carrying the absorbed error body.
pub const ERROR_BODY_KEY: &str = "errorBody";

/// What a node's input looks like to the wrapper. Stream inputs arrive as
/// recorded items so every retry attempt can replay a fresh reader.
pub enum NodeInput {
    Map(ValueMap),
    Stream(Vec<StreamItem>),
}

/// A node result after policy application.
#[derive(Debug)]
pub struct WrappedOutcome {
    pub outcome: NodeOutcome,
    /// The failure message the error policy absorbed, if any.
    pub recovered_error: Option<String>,
}

/// Run one node under its exception policy.
pub async fn run_node(
    executor: Arc<dyn NodeExecutor>,
    ctx: ExecutionContext,
    input: NodeInput,
    exception: &ExceptionConfig,
    output_types: &FxHashMap<String, TypeInfo>,
) -> Result<WrappedOutcome, NodeError> {
    let attempts_fut = run_attempts(executor, ctx.clone(), input, exception.max_retry);
    let result = match exception.timeout_ms {
        Some(ms) => match tokio::time::timeout(Duration::from_millis(ms), attempts_fut).await {
            Ok(result) => result,
            Err(_) => Err(NodeError::Timeout {
                node: ctx.node_key.clone(),
                ms,
            }),
        },
        None => attempts_fut.await,
    };

    match result {
        Ok(NodeOutcome::Suspend(suspension)) => Ok(WrappedOutcome {
            outcome: NodeOutcome::Suspend(suspension),
            recovered_error: None,
        }),
        Ok(NodeOutcome::Output(mut output)) => {
            postfill(&mut output, output_types);
            if exception.process != ErrorProcess::ThrowError {
                output.insert(IS_SUCCESS_KEY.to_string(), json!(true));
            }
            Ok(WrappedOutcome {
                outcome: NodeOutcome::Output(output),
                recovered_error: None,
            })
        }
        Ok(routed @ NodeOutcome::Routed { .. }) => Ok(WrappedOutcome {
            outcome: routed,
            recovered_error: None,
        }),
        Err(err @ NodeError::Cancelled { .. }) => Err(err),
        Err(err) => apply_error_process(&ctx, err, exception, output_types),
    }
}

/// Retry loop. Each attempt sees a fresh input: map inputs are cloned,
/// stream inputs are replayed from their recorded items.
async fn run_attempts(
    executor: Arc<dyn NodeExecutor>,
    ctx: ExecutionContext,
    mut input: NodeInput,
    max_retry: u32,
) -> Result<NodeOutcome, NodeError> {
    if let NodeInput::Map(map) = &mut input {
        trim_finish_markers(map);
    }
    let mut last_err = None;
    for attempt in 0..=max_retry {
        if ctx.cancel.is_cancelled() {
            return Err(NodeError::Cancelled {
                node: ctx.node_key.clone(),
            });
        }
        let result = match &input {
            NodeInput::Map(map) => attempt_map(executor.clone(), ctx.clone(), map.clone()).await,
            NodeInput::Stream(items) => {
                attempt_stream(
                    executor.clone(),
                    ctx.clone(),
                    StreamReader::replay(items.clone()),
                )
                .await
            }
        };
        match result {
            Ok(outcome) => return Ok(outcome),
            Err(err) => {
                if attempt < max_retry {
                    warn!(
                        node = %ctx.node_key,
                        attempt = attempt + 1,
                        error = %err,
                        "node attempt failed, retrying"
                    );
                }
                last_err = Some(err);
            }
        }
    }
    Err(last_err.unwrap_or_else(|| {
        NodeError::Internal("retry loop finished without a result".to_string())
    }))
}

async fn attempt_map(
    executor: Arc<dyn NodeExecutor>,
    ctx: ExecutionContext,
    input: ValueMap,
) -> Result<NodeOutcome, NodeError> {
    let node = ctx.node_key.clone();
    let handle = tokio::spawn(async move { executor.invoke(&ctx, input).await });
    join_attempt(AttemptGuard(handle), node).await
}

async fn attempt_stream(
    executor: Arc<dyn NodeExecutor>,
    ctx: ExecutionContext,
    stream: StreamReader,
) -> Result<NodeOutcome, NodeError> {
    let node = ctx.node_key.clone();
    let handle = tokio::spawn(async move { executor.transform(&ctx, stream).await });
    join_attempt(AttemptGuard(handle), node).await
}

/// Aborts the spawned attempt when the caller stops waiting, so work past
/// the timeout does not keep running unobserved.
struct AttemptGuard(tokio::task::JoinHandle<Result<NodeOutcome, NodeError>>);

impl Drop for AttemptGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

async fn join_attempt(
    mut guard: AttemptGuard,
    node: crate::types::NodeKey,
) -> Result<NodeOutcome, NodeError> {
    match (&mut guard.0).await {
        Ok(result) => result,
        Err(join_err) if join_err.is_panic() => {
            let payload = join_err.into_panic();
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| (*s).to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic payload".to_string());
            Err(NodeError::Panicked { node, message })
        }
        Err(_) => Err(NodeError::Cancelled { node }),
    }
}

fn apply_error_process(
    ctx: &ExecutionContext,
    err: NodeError,
    exception: &ExceptionConfig,
    output_types: &FxHashMap<String, TypeInfo>,
) -> Result<WrappedOutcome, NodeError> {
    let message = err.to_string();
    match exception.process {
        ErrorProcess::ThrowError => Err(err),
        ErrorProcess::ReturnDefaultData => {
            warn!(node = %ctx.node_key, error = %message, "substituting default output");
            let mut output = default_output(exception.default_output.as_deref(), output_types);
            attach_error_body(&mut output, &message);
            Ok(WrappedOutcome {
                outcome: NodeOutcome::Output(output),
                recovered_error: Some(message),
            })
        }
        ErrorProcess::ExceptionBranch => {
            warn!(node = %ctx.node_key, error = %message, "routing exception branch");
            let mut output = ValueMap::new();
            attach_error_body(&mut output, &message);
            Ok(WrappedOutcome {
                outcome: NodeOutcome::Routed {
                    port: Port::Exception,
                    output,
                },
                recovered_error: Some(message),
            })
        }
    }
}

fn attach_error_body(output: &mut ValueMap, message: &str) {
    output.insert(
        ERROR_BODY_KEY.to_string(),
        json!({ "errorMessage": message, "errorCode": -1 }),
    );
    output.insert(IS_SUCCESS_KEY.to_string(), json!(false));
}

/// Parse the configured default output and shape it to the declared output
/// types; anything unparseable or undeclared falls back to zero values.
fn default_output(
    configured: Option<&str>,
    output_types: &FxHashMap<String, TypeInfo>,
) -> ValueMap {
    let parsed: ValueMap = configured
        .and_then(|text| serde_json::from_str::<ValueMap>(text).ok())
        .unwrap_or_default();
    let mut output = ValueMap::new();
    for (field, type_info) in output_types {
        let value = match parsed.get(field) {
            Some(value) => type_info.coerce_or_zero(value.clone()),
            None => type_info.zero(),
        };
        output.insert(field.clone(), value);
    }
    output
}

/// Backfill declared output fields the executor left unset.
fn postfill(output: &mut ValueMap, output_types: &FxHashMap<String, TypeInfo>) {
    for (field, type_info) in output_types {
        match output.get(field) {
            None | Some(Value::Null) => {
                output.insert(field.clone(), type_info.zero());
            }
            Some(_) => {}
        }
    }
}
