//! Dependency and streaming resolution over workflow schemas.
//!
//! [`dependency`] turns declared field sources into execution dependencies
//! and input-assembly plans; [`stream`] classifies every field source's
//! streaming behavior, statically where possible and through run-time group
//! choices where not.

pub mod dependency;
pub mod stream;

use miette::Diagnostic;
use thiserror::Error;

pub use dependency::{
    ArrayDrill, DependencyInfo, FieldMapping, ScopeResolution, StaticValue, VariableMapping,
    derive_inner_outputs, resolve_scope,
};
pub use stream::{
    FieldStreamType, SourceInfo, StreamContext, build_source_info, classify_field, resolve_dynamic,
};

use crate::types::NodeKey;

/// Errors raised while resolving dependencies or stream classifications.
#[derive(Debug, Error, Diagnostic)]
pub enum ResolverError {
    #[error("field '{field}' of node '{node}' has a reference with no producer")]
    #[diagnostic(
        code(graphloom::resolver::invalid_source),
        help("A reference must name a producing node or a variable store.")
    )]
    InvalidSource { node: NodeKey, field: String },

    #[error("node '{node}' references its own output")]
    #[diagnostic(code(graphloom::resolver::self_reference))]
    SelfReference { node: NodeKey },

    #[error("node '{node}' references unknown node '{from}'")]
    #[diagnostic(
        code(graphloom::resolver::unknown_source),
        help("Sources may only name nodes in the same scope or one level up.")
    )]
    UnknownSourceNode { node: NodeKey, from: NodeKey },

    #[error("array drill-down on '{node}' hit an empty array at '{path}'")]
    #[diagnostic(code(graphloom::resolver::drill_empty_array))]
    DrillEmptyArray { node: NodeKey, path: String },

    #[error("array drill-down on '{node}' expected an array at '{path}'")]
    #[diagnostic(code(graphloom::resolver::drill_not_array))]
    DrillNotAnArray { node: NodeKey, path: String },

    #[error("array drill-down on '{node}' expected an object at '{path}'")]
    #[diagnostic(code(graphloom::resolver::drill_not_object))]
    DrillNotAnObject { node: NodeKey, path: String },

    #[error("array drill-down on '{node}' found no field at '{path}'")]
    #[diagnostic(code(graphloom::resolver::drill_missing_field))]
    DrillMissingField { node: NodeKey, path: String },

    #[error("no group choice recorded for aggregator '{node}' group '{group}'")]
    #[diagnostic(
        code(graphloom::resolver::missing_group_choice),
        help("The aggregator must run before consumers of its maybe-stream fields.")
    )]
    MissingGroupChoice { node: NodeKey, group: String },

    #[error("stream resolution invariant violated: {0}")]
    #[diagnostic(code(graphloom::resolver::internal))]
    InternalInvariant(String),
}
