//! Stage definitions, handlers, execution context and results.
//!
//! Stages are the fixed, ordered units of work an orchestrator runs. Each
//! one pairs an identity and limits ([`StageDescriptor`]) with a typed
//! handler ([`StageHandler`]) that receives a [`StageContext`].

mod context;
mod descriptor;
mod handler;
mod result;

pub use context::{FanOutReport, Interruption, StageContext};
pub use descriptor::{StageDescriptor, StageTolerance};
pub use handler::{
    BlockingHandler, CooperativeHandler, ExecutionMode, FnBlockingHandler, FnCooperativeHandler,
    StageHandler,
};
pub use result::{StageResult, StageStatus};
