//! Resource monitoring and adaptive worker sizing.

mod monitor;
mod pool;
mod probe;

pub use monitor::{ResourceMonitor, ResourceSnapshot};
pub use pool::AdaptiveWorkerPool;
pub use probe::{
    FixedResourceProbe, ProcResourceProbe, ResourceError, ResourceProbe, ResourceReading,
    CLOCK_TICKS_PER_SEC,
};
