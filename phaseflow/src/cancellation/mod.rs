//! Cancellation primitives.
//!
//! - [`AbortSignal`]: run-wide, first-writer-wins abort flag
//! - [`CancellationToken`]: stage-local cooperative cancellation, used by
//!   the timeout guard

mod abort;
mod token;

pub use abort::{AbortSignal, AbortState, AbortView};
pub use token::{CancelCallback, CancellationToken};
