//! Lifecycle events emitted by the orchestrator.
//!
//! The sink is injected into the orchestrator and threaded through every
//! run; there is no process-wide sink.

mod sink;

pub use sink::{CollectingEventSink, EventKind, EventSink, LoggingEventSink, NoOpEventSink};
