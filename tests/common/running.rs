//! Drivers that run an app and insist on a particular outcome.

use graphloom::runtime::{InterruptEvent, RunOutcome, WorkflowApp};
use graphloom::utils::ValueMap;

pub async fn run_to_completion(app: &WorkflowApp, input: ValueMap) -> ValueMap {
    match app.run(input).await.expect("run failed") {
        RunOutcome::Completed { output, .. } => output,
        RunOutcome::Suspended { event, .. } => {
            panic!("run suspended unexpectedly on {}", event.node_path)
        }
    }
}

pub async fn run_to_suspension(app: &WorkflowApp, input: ValueMap) -> (i64, InterruptEvent) {
    match app.run(input).await.expect("run failed") {
        RunOutcome::Suspended { execute_id, event } => (execute_id, event),
        RunOutcome::Completed { output, .. } => {
            panic!("run completed instead of suspending: {output:?}")
        }
    }
}

pub async fn resume_to_completion(
    app: &WorkflowApp,
    execute_id: i64,
    event_id: i64,
    data: &str,
) -> ValueMap {
    match app
        .resume(execute_id, event_id, data)
        .await
        .expect("resume failed")
    {
        RunOutcome::Completed { output, .. } => output,
        RunOutcome::Suspended { event, .. } => {
            panic!("resume suspended unexpectedly on {}", event.node_path)
        }
    }
}

pub async fn resume_to_suspension(
    app: &WorkflowApp,
    execute_id: i64,
    event_id: i64,
    data: &str,
) -> (i64, InterruptEvent) {
    match app
        .resume(execute_id, event_id, data)
        .await
        .expect("resume failed")
    {
        RunOutcome::Suspended { execute_id, event } => (execute_id, event),
        RunOutcome::Completed { output, .. } => {
            panic!("resume completed instead of suspending: {output:?}")
        }
    }
}
