//! Per-stage instrumentation: progress, throughput, latency percentiles,
//! resource snapshots, warnings and errors.

mod phase;
mod registry;

pub use phase::{
    percentile, InstrumentationEvent, LatencyPercentiles, PhaseInstrumentation, PhaseMetrics,
};
pub use registry::MetricsRegistry;
