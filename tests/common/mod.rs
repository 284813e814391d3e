//! Shared helpers for the integration suite.
//!
//! `builders` holds schema shorthand so tests read as graph descriptions;
//! `running` drives a [`graphloom::runtime::WorkflowApp`] to a known outcome
//! and panics with context when the run goes the other way.

pub mod builders;
pub mod running;

pub use builders::*;
pub use running::*;
