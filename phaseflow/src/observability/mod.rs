//! Tracing subscriber setup and run/stage spans.

mod spans;
mod subscriber;

pub use spans::{RunSpanAttributes, SpanTimer, StageSpanAttributes};
pub use subscriber::init_tracing;
