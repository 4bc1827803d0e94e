//! Mock handlers for testing.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::errors::HandlerError;
use crate::stages::{BlockingHandler, CooperativeHandler, StageContext};

/// A cooperative handler that records calls and returns a fixed value.
#[derive(Debug)]
pub struct RecordingHandler {
    output: Value,
    calls: AtomicUsize,
    seen_outputs: Mutex<Vec<Vec<String>>>,
}

impl RecordingHandler {
    /// Creates a handler returning `output`.
    #[must_use]
    pub fn new(output: Value) -> Self {
        Self {
            output,
            calls: AtomicUsize::new(0),
            seen_outputs: Mutex::new(Vec::new()),
        }
    }

    /// Returns the number of calls.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Returns, per call, the output names visible to the handler.
    #[must_use]
    pub fn seen_outputs(&self) -> Vec<Vec<String>> {
        self.seen_outputs.lock().clone()
    }
}

#[async_trait]
impl CooperativeHandler for RecordingHandler {
    async fn run(&self, ctx: &StageContext) -> Result<Value, HandlerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let names = ["ingest", "grid", "score", "report"]
            .iter()
            .filter(|name| ctx.output(name).is_some())
            .map(|name| (*name).to_string())
            .collect();
        self.seen_outputs.lock().push(names);
        Ok(self.output.clone())
    }
}

/// A blocking handler that always fails.
#[derive(Debug, Clone)]
pub struct FailingHandler {
    message: String,
}

impl FailingHandler {
    /// Creates a handler failing with `message`.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl BlockingHandler for FailingHandler {
    fn run(&self, _ctx: &StageContext) -> Result<Value, HandlerError> {
        Err(HandlerError::failed(&self.message))
    }
}

/// A cooperative handler that sleeps in steps, publishing progress.
///
/// Stops early with the matching error if the run is aborted or the stage
/// is cancelled.
#[derive(Debug, Clone)]
pub struct SlowHandler {
    duration: Duration,
    step: Duration,
}

impl SlowHandler {
    /// Creates a handler that takes `duration` in total.
    #[must_use]
    pub fn new(duration: Duration) -> Self {
        Self {
            duration,
            step: Duration::from_millis(100),
        }
    }

    /// Creates a handler that never finishes on its own.
    #[must_use]
    pub fn hanging() -> Self {
        Self::new(Duration::MAX)
    }
}

#[async_trait]
impl CooperativeHandler for SlowHandler {
    async fn run(&self, ctx: &StageContext) -> Result<Value, HandlerError> {
        let mut elapsed = Duration::ZERO;
        let mut steps = 0_u64;
        while elapsed < self.duration {
            ctx.check_continue()?;
            let step = self.step.min(self.duration - elapsed);
            tokio::time::sleep(step).await;
            elapsed += step;
            steps += 1;
            ctx.publish_partial(json!({ "steps": steps }));
        }
        Ok(json!({ "steps": steps }))
    }
}

/// A blocking handler that busy-waits until told to stop or `limit` passes.
#[derive(Debug, Clone)]
pub struct SpinningHandler {
    limit: Duration,
}

impl SpinningHandler {
    /// Creates a handler that spins for at most `limit`.
    #[must_use]
    pub fn new(limit: Duration) -> Self {
        Self { limit }
    }
}

impl BlockingHandler for SpinningHandler {
    fn run(&self, ctx: &StageContext) -> Result<Value, HandlerError> {
        let started = std::time::Instant::now();
        while started.elapsed() < self.limit {
            ctx.check_continue()?;
            std::thread::sleep(Duration::from_millis(5));
        }
        let spun_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        Ok(json!({ "spun_ms": spun_ms }))
    }
}

/// A cooperative handler that fans out over `items` sub-items, failing the
/// indices in `failing`.
#[derive(Debug, Clone)]
pub struct GridHandler {
    items: usize,
    failing: BTreeSet<usize>,
    item_delay: Duration,
}

impl GridHandler {
    /// Creates a grid of `items` cells where `failures` evenly spaced cells fail.
    #[must_use]
    pub fn with_failures(items: usize, failures: usize) -> Self {
        let failing = (0..failures)
            .map(|i| i * items / failures.max(1))
            .collect();
        Self {
            items,
            failing,
            item_delay: Duration::ZERO,
        }
    }

    /// Sets a per-cell delay.
    #[must_use]
    pub fn with_item_delay(mut self, delay: Duration) -> Self {
        self.item_delay = delay;
        self
    }
}

#[async_trait]
impl CooperativeHandler for GridHandler {
    async fn run(&self, ctx: &StageContext) -> Result<Value, HandlerError> {
        let delay = self.item_delay;
        let report = ctx
            .fan_out((0..self.items).collect(), |index, cell: usize| {
                let fails = self.failing.contains(&index);
                async move {
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    if fails {
                        Err(HandlerError::failed(format!("cell {cell} failed")))
                    } else {
                        Ok(cell * 2)
                    }
                }
            })
            .await
            .into_complete()?;

        Ok(json!({
            "cells": report.results.len(),
            "failed": report.failures.keys().collect::<Vec<_>>(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grid_failure_spacing() {
        let grid = GridHandler::with_failures(100, 8);
        assert_eq!(grid.failing.len(), 8);
        assert!(grid.failing.iter().all(|i| *i < 100));
    }

    #[tokio::test]
    async fn test_recording_handler_counts_calls() {
        let handler = RecordingHandler::new(json!("ok"));
        let ctx = StageContext::detached("a", "A");
        assert_eq!(handler.run(&ctx).await.unwrap(), json!("ok"));
        assert_eq!(handler.call_count(), 1);
        assert_eq!(handler.seen_outputs(), vec![Vec::<String>::new()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_handler_stops_on_cancel() {
        let ctx = StageContext::detached("a", "A");
        let token = ctx.cancel_token().clone();
        let handler = SlowHandler::hanging();
        let run = handler.run(&ctx);
        let cancel = async {
            tokio::time::sleep(Duration::from_millis(350)).await;
            token.cancel("stop");
        };
        let (result, ()) = tokio::join!(run, cancel);
        assert!(matches!(result, Err(HandlerError::Cancelled { .. })));
        // the step in flight when the token fired still completes
        assert_eq!(ctx.partial(), Some(json!({ "steps": 4 })));
    }
}
