//! Run-wide abort signal.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, OnceLock};
use tokio::sync::Notify;
use tracing::warn;

/// Point-in-time view of an [`AbortSignal`].
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AbortState {
    /// Whether abort has been requested.
    pub aborted: bool,
    /// The first reason given.
    pub reason: Option<String>,
    /// When the first abort was requested.
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct AbortRecord {
    reason: String,
    timestamp: DateTime<Utc>,
}

/// Idempotent, thread-safe cancellation flag shared by a whole run.
///
/// The first call to [`abort`](Self::abort) wins: its reason and timestamp
/// are fixed and later calls are ignored. The signal is never cleared, and
/// every caller observes it as set once `abort` returns.
#[derive(Debug, Default)]
pub struct AbortSignal {
    record: OnceLock<AbortRecord>,
    notify: Notify,
}

impl AbortSignal {
    /// Creates an unset signal.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests abort. Returns true if this call set the signal.
    pub fn abort(&self, reason: impl Into<String>) -> bool {
        let reason = reason.into();
        let mut won = false;
        self.record.get_or_init(|| {
            won = true;
            AbortRecord {
                reason: reason.clone(),
                timestamp: Utc::now(),
            }
        });

        if won {
            self.notify.notify_waiters();
            warn!(reason = %reason, "Abort requested");
        }
        won
    }

    /// Returns whether abort has been requested.
    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.record.get().is_some()
    }

    /// Returns the first abort reason.
    #[must_use]
    pub fn get_reason(&self) -> Option<String> {
        self.record.get().map(|r| r.reason.clone())
    }

    /// Returns when abort was first requested.
    #[must_use]
    pub fn get_timestamp(&self) -> Option<DateTime<Utc>> {
        self.record.get().map(|r| r.timestamp)
    }

    /// Returns a snapshot of the signal.
    #[must_use]
    pub fn state(&self) -> AbortState {
        match self.record.get() {
            Some(r) => AbortState {
                aborted: true,
                reason: Some(r.reason.clone()),
                timestamp: Some(r.timestamp),
            },
            None => AbortState::default(),
        }
    }

    /// Waits until abort is requested.
    pub async fn aborted(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_aborted() {
                return;
            }
            notified.await;
        }
    }
}

/// Read-only handle to an [`AbortSignal`], handed to stage handlers.
#[derive(Debug, Clone)]
pub struct AbortView(Arc<AbortSignal>);

impl AbortView {
    /// Wraps a shared signal.
    #[must_use]
    pub fn new(signal: Arc<AbortSignal>) -> Self {
        Self(signal)
    }

    /// Returns whether abort has been requested.
    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.0.is_aborted()
    }

    /// Returns the first abort reason.
    #[must_use]
    pub fn reason(&self) -> Option<String> {
        self.0.get_reason()
    }

    /// Waits until abort is requested.
    pub async fn aborted(&self) {
        self.0.aborted().await;
    }
}
