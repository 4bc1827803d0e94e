//! Typed stage handlers.
//!
//! A handler is either blocking (offloaded to the blocking thread pool and
//! guarded by a deadline watchdog) or cooperative (polled on the
//! coordinating task, free to fan out sub-items).

use super::StageContext;
use crate::errors::HandlerError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// How a stage handler is executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Offloaded to a blocking thread; cancellation is best-effort.
    Blocking,
    /// Runs natively on the runtime; observes cancellation at await points.
    Cooperative,
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Blocking => write!(f, "blocking"),
            Self::Cooperative => write!(f, "cooperative"),
        }
    }
}

/// A synchronous stage body.
///
/// Long-running implementations should poll
/// [`StageContext::should_stop`] between units of work.
pub trait BlockingHandler: Send + Sync {
    /// Runs the stage.
    fn run(&self, ctx: &StageContext) -> Result<serde_json::Value, HandlerError>;
}

/// An asynchronous stage body.
#[async_trait]
pub trait CooperativeHandler: Send + Sync {
    /// Runs the stage.
    async fn run(&self, ctx: &StageContext) -> Result<serde_json::Value, HandlerError>;
}

/// Tagged handler variant. The execution mode is the variant.
#[derive(Clone)]
pub enum StageHandler {
    /// Blocking-offload handler.
    Blocking(Arc<dyn BlockingHandler>),
    /// Natively cooperative handler.
    Cooperative(Arc<dyn CooperativeHandler>),
}

impl fmt::Debug for StageHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("StageHandler").field(&self.mode()).finish()
    }
}

impl StageHandler {
    /// Wraps a closure as a blocking handler.
    pub fn blocking<F>(func: F) -> Self
    where
        F: Fn(&StageContext) -> Result<serde_json::Value, HandlerError> + Send + Sync + 'static,
    {
        Self::Blocking(Arc::new(FnBlockingHandler::new(func)))
    }

    /// Wraps an async closure as a cooperative handler.
    ///
    /// The closure receives an owned clone of the context so the returned
    /// future can be `'static`.
    pub fn cooperative<F, Fut>(func: F) -> Self
    where
        F: Fn(StageContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<serde_json::Value, HandlerError>> + Send + 'static,
    {
        Self::Cooperative(Arc::new(FnCooperativeHandler::new(func)))
    }

    /// Returns the execution mode.
    #[must_use]
    pub fn mode(&self) -> ExecutionMode {
        match self {
            Self::Blocking(_) => ExecutionMode::Blocking,
            Self::Cooperative(_) => ExecutionMode::Cooperative,
        }
    }
}

/// Closure-backed [`BlockingHandler`].
pub struct FnBlockingHandler<F> {
    func: F,
}

impl<F> FnBlockingHandler<F>
where
    F: Fn(&StageContext) -> Result<serde_json::Value, HandlerError> + Send + Sync,
{
    /// Creates a new closure handler.
    pub fn new(func: F) -> Self {
        Self { func }
    }
}

impl<F> BlockingHandler for FnBlockingHandler<F>
where
    F: Fn(&StageContext) -> Result<serde_json::Value, HandlerError> + Send + Sync,
{
    fn run(&self, ctx: &StageContext) -> Result<serde_json::Value, HandlerError> {
        (self.func)(ctx)
    }
}

/// Closure-backed [`CooperativeHandler`].
pub struct FnCooperativeHandler<F, Fut>
where
    F: Fn(StageContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<serde_json::Value, HandlerError>> + Send,
{
    func: F,
}

impl<F, Fut> FnCooperativeHandler<F, Fut>
where
    F: Fn(StageContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<serde_json::Value, HandlerError>> + Send,
{
    /// Creates a new closure handler.
    pub fn new(func: F) -> Self {
        Self { func }
    }
}

#[async_trait]
impl<F, Fut> CooperativeHandler for FnCooperativeHandler<F, Fut>
where
    F: Fn(StageContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<serde_json::Value, HandlerError>> + Send,
{
    async fn run(&self, ctx: &StageContext) -> Result<serde_json::Value, HandlerError> {
        (self.func)(ctx.clone()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_mode_follows_variant() {
        let b = StageHandler::blocking(|_| Ok(json!(1)));
        let c = StageHandler::cooperative(|_| async { Ok::<_, HandlerError>(json!(2)) });
        assert_eq!(b.mode(), ExecutionMode::Blocking);
        assert_eq!(c.mode(), ExecutionMode::Cooperative);
        assert_eq!(format!("{b:?}"), "StageHandler(Blocking)");
    }

    #[tokio::test]
    async fn test_closure_handlers_run() {
        let ctx = StageContext::detached("s", "S");
        let StageHandler::Blocking(b) = StageHandler::blocking(|ctx| Ok(json!(ctx.stage_id()))) else {
            panic!("expected blocking variant");
        };
        assert_eq!(b.run(&ctx).unwrap(), json!("s"));

        let StageHandler::Cooperative(c) =
            StageHandler::cooperative(|ctx| async move { Ok::<_, HandlerError>(json!(ctx.stage_name().to_string())) })
        else {
            panic!("expected cooperative variant");
        };
        assert_eq!(c.run(&ctx).await.unwrap(), json!("S"));
    }
}
