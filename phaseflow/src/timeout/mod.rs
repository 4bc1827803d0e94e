//! Per-stage deadlines, scaled by runtime mode, with an early warning.

mod guard;

pub use guard::{TimeoutGuard, TimeoutHooks, TimeoutRecord, TimeoutWarning, WarningCallback};
