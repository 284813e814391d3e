//! # Graphloom: Suspendable Typed Workflow Engine
//!
//! Graphloom executes declarative workflow graphs: nodes declare their
//! configuration and field-level data mappings in a serializable
//! [`schema::WorkflowSchema`], and the engine compiles that into an
//! executable scope. Execution proceeds in supersteps, running every node
//! whose dependencies have settled concurrently, routing around unselected
//! branches, and suspending into a checkpoint whenever an interactive node
//! asks the caller for input.
//!
//! ## Core Concepts
//!
//! - **Schema**: nodes, connections, and per-field data mappings, all serde
//!   types ([`schema`])
//! - **Registry**: named executors that make a schema runnable ([`registry`])
//! - **Engine**: compilation, the superstep loop, and the run/resume surface
//!   ([`runtime::engine`])
//! - **Interrupts**: typed suspension events with paths into nested scopes
//!   ([`runtime::interrupt`])
//! - **Composites**: batch, loop, and sub-workflow nodes hosting inner
//!   scopes ([`runtime::composite`])
//! - **Events**: a bus of node lifecycle and stream-delta events, fanned out
//!   to pluggable sinks ([`event_bus`])
//!
//! ## Quick Start
//!
//! ```
//! use graphloom::nodes::Lambda;
//! use graphloom::registry::NodeRegistry;
//! use graphloom::runtime::{RunOutcome, WorkflowApp};
//! use graphloom::schema::{
//!     Connection, FieldInfo, FieldRef, FieldSource, NodeConfig, NodeSchema, WorkflowSchema,
//! };
//! use graphloom::types::{FieldPath, NodeKey};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let schema = WorkflowSchema::new()
//!         .with_node(
//!             NodeSchema::new("double", NodeConfig::Lambda { executor: "double".into() })
//!                 .with_input_source(FieldInfo::new(
//!                     FieldPath::single("n"),
//!                     FieldSource::Ref(FieldRef::node_output(
//!                         NodeKey::entry(),
//!                         FieldPath::single("n"),
//!                     )),
//!                 )),
//!         )
//!         .with_connection(Connection::new(NodeKey::entry(), "double"))
//!         .with_connection(Connection::new("double", NodeKey::exit()))
//!         .with_output_source(FieldInfo::new(
//!             FieldPath::single("n"),
//!             FieldSource::Ref(FieldRef::node_output("double", FieldPath::single("n"))),
//!         ));
//!
//!     let registry = NodeRegistry::new().with_executor(
//!         "double",
//!         Lambda::new(|_, mut input| {
//!             let n = input.get("n").and_then(|v| v.as_i64()).unwrap_or(0);
//!             input.insert("n".into(), json!(n * 2));
//!             Ok(input)
//!         }),
//!     );
//!
//!     let app = WorkflowApp::builder(schema, registry).build()?;
//!     let RunOutcome::Completed { output, .. } = app.run(
//!         serde_json::Map::from_iter([("n".to_string(), json!(21))]),
//!     )
//!     .await?
//!     else {
//!         unreachable!()
//!     };
//!     assert_eq!(output["n"], json!(42));
//!     Ok(())
//! }
//! ```
//!
//! ## Suspension and Resume
//!
//! Interactive nodes (question/answer, input receivers) return interrupt
//! events instead of output. The run checkpoints, [`runtime::WorkflowApp::run`]
//! returns [`runtime::RunOutcome::Suspended`], and a later call to
//! [`runtime::WorkflowApp::resume`] with the event's ID and the caller's data
//! restores the state and continues exactly where it stopped. Interrupts
//! inside batch and loop elements surface as composite events whose nested
//! entries carry full paths down the scope tree.
//!
//! ## Module Guide
//!
//! - [`schema`] - workflow, node, and field-mapping declarations
//! - [`resolver`] - compile-time dependency and stream classification
//! - [`registry`] - executor and answer-service registration
//! - [`nodes`] - executor trait, built-in node executors, chunk streams
//! - [`runtime`] - engine, state, checkpoints, interrupts, composites
//! - [`event_bus`] - run events and pluggable sinks
//! - [`telemetry`] - tracing subscriber setup

pub mod event_bus;
pub mod nodes;
pub mod registry;
pub mod resolver;
pub mod runtime;
pub mod schema;
pub mod telemetry;
pub mod types;
pub mod utils;
