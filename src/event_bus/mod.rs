//! Run event broadcasting.
//!
//! Nodes and the run loop publish [`RunEvent`]s through a cloned channel
//! sender; the [`EventBus`] fans them out to registered [`EventSink`]s.
//! Streaming run variants attach a [`ChannelSink`] to surface node deltas
//! to the caller as they happen.

pub mod bus;
pub mod event;
pub mod sink;

pub use bus::EventBus;
pub use event::RunEvent;
pub use sink::{ChannelSink, EventSink, MemorySink, StdOutSink};
