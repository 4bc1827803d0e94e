//! Stage-local cancellation token for cooperative cancellation.

use parking_lot::Mutex;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::OnceLock;
use tokio::sync::Notify;
use tracing::warn;

/// A callback run once when a token is cancelled.
pub type CancelCallback = Box<dyn FnOnce() + Send + 'static>;

/// A token requesting cooperative cancellation of one stage's work.
///
/// Independent of the run-wide abort signal: the timeout guard cancels the
/// offending stage only. Cancellation is idempotent and only the first
/// reason is kept.
#[derive(Default)]
pub struct CancellationToken {
    /// The reason for cancellation (first one wins). Set means cancelled.
    reason: OnceLock<String>,
    /// Callbacks still waiting for cancellation.
    callbacks: Mutex<Vec<CancelCallback>>,
    notify: Notify,
}

impl CancellationToken {
    /// Creates a new cancellation token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation with a reason.
    ///
    /// Registered callbacks run on the calling thread before this returns.
    /// Panics in callbacks are logged and suppressed.
    pub fn cancel(&self, reason: impl Into<String>) {
        let reason = reason.into();
        let mut won = false;
        self.reason.get_or_init(|| {
            won = true;
            reason
        });
        if !won {
            return;
        }

        self.notify.notify_waiters();
        let callbacks = std::mem::take(&mut *self.callbacks.lock());
        for callback in callbacks {
            run_callback(callback);
        }
    }

    /// Registers a callback to run once on cancellation.
    ///
    /// If already cancelled, the callback runs immediately.
    pub fn on_cancel<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut callbacks = self.callbacks.lock();
        if self.is_cancelled() {
            drop(callbacks);
            run_callback(Box::new(callback));
        } else {
            callbacks.push(Box::new(callback));
        }
    }

    /// Returns whether cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.reason.get().is_some()
    }

    /// Returns the cancellation reason, if any.
    #[must_use]
    pub fn reason(&self) -> Option<String> {
        self.reason.get().cloned()
    }

    /// Waits until cancellation is requested.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

fn run_callback(callback: CancelCallback) {
    if let Err(e) = catch_unwind(AssertUnwindSafe(callback)) {
        warn!("Cancellation callback panicked: {:?}", e);
    }
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .field("reason", &self.reason())
            .finish()
    }
}
