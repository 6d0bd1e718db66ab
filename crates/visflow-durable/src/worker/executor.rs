//! Executor contract and registry
//!
//! An executor is a value implementing [`Executor`], registered into a named
//! map. Failures are classified values rather than control flow: executors
//! return [`ExecError`] and the worker records the outcome; only executor
//! bodies may carry `anyhow` errors, which map to the transient class at
//! this boundary.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;
use uuid::Uuid;

use crate::reliability::BreakerRejected;
use crate::workflow::Context;

/// Classified executor failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecError {
    /// Network errors, timeouts from dependencies, breaker-open, lease-lost.
    /// Retried with backoff.
    Transient(String),

    /// Bad input, contract violations, missing required context keys.
    /// Routed to the dead letter without retry.
    Permanent(String),

    /// External cancel, workflow cancel, stage timeout. Not retried.
    Cancelled(String),
}

impl ExecError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent(message.into())
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::Cancelled(message.into())
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Transient(m) | Self::Permanent(m) | Self::Cancelled(m) => m,
        }
    }
}

impl std::fmt::Display for ExecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transient(m) => write!(f, "transient: {m}"),
            Self::Permanent(m) => write!(f, "permanent: {m}"),
            Self::Cancelled(m) => write!(f, "cancelled: {m}"),
        }
    }
}

impl std::error::Error for ExecError {}

impl From<anyhow::Error> for ExecError {
    fn from(err: anyhow::Error) -> Self {
        Self::Transient(err.to_string())
    }
}

impl From<BreakerRejected> for ExecError {
    fn from(err: BreakerRejected) -> Self {
        // Breaker rejections count against the task's own retry budget.
        Self::Transient(err.to_string())
    }
}

/// Handle used to signal cooperative cancellation to an executor.
#[derive(Debug, Clone)]
pub struct CancellationHandle {
    cancelled: Arc<AtomicBool>,
}

impl CancellationHandle {
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }
}

/// Context provided to executors during execution.
///
/// # Example
///
/// ```ignore
/// async fn execute(&self, ctx: &ExecContext, params: Value, context: &Context)
///     -> Result<Value, ExecError>
/// {
///     for chunk in chunks {
///         if ctx.is_cancelled() {
///             return Err(ExecError::cancelled("stopped at a safe point"));
///         }
///         process(chunk).await?;
///     }
///     Ok(json!({"rows": n}))
/// }
/// ```
#[derive(Debug)]
pub struct ExecContext {
    pub task_id: Uuid,

    /// Current attempt number (1-based).
    pub attempt: u32,

    pub max_attempts: u32,

    cancelled: Arc<AtomicBool>,
}

impl ExecContext {
    pub fn new(task_id: Uuid, attempt: u32, max_attempts: u32) -> Self {
        Self {
            task_id,
            attempt,
            max_attempts,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn cancellation_handle(&self) -> CancellationHandle {
        CancellationHandle {
            cancelled: self.cancelled.clone(),
        }
    }

    /// Check for cooperative cancellation; executors should call this at
    /// safe points.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    /// Resolve when cancellation is requested, for `select!` patterns.
    pub async fn cancelled(&self) {
        loop {
            if self.is_cancelled() {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
    }

    pub fn is_last_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

/// A stage executor.
///
/// Executors must be reentrant: the same `(task_id, attempt)` may re-execute
/// after a crash between execution and the completion write. Side effects
/// should be idempotent or externally deduplicated.
#[async_trait]
pub trait Executor: Send + Sync + 'static {
    async fn execute(
        &self,
        ctx: &ExecContext,
        params: Value,
        context: &Context,
    ) -> Result<Value, ExecError>;
}

type BoxedExecFn =
    Box<dyn Fn(Value, Context) -> BoxFuture<'static, Result<Value, ExecError>> + Send + Sync>;

/// Adapter for closure-based executors that do not need the exec context.
struct FnExecutor {
    f: BoxedExecFn,
}

#[async_trait]
impl Executor for FnExecutor {
    async fn execute(
        &self,
        _ctx: &ExecContext,
        params: Value,
        context: &Context,
    ) -> Result<Value, ExecError> {
        (self.f)(params, context.clone()).await
    }
}

/// Registry mapping executor names to implementations.
///
/// Built once at startup; workers refuse to start when an expected name is
/// missing.
#[derive(Default)]
pub struct ExecutorRegistry {
    executors: HashMap<String, Arc<dyn Executor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an executor value.
    pub fn register<E: Executor>(&mut self, name: impl Into<String>, executor: E) {
        self.executors.insert(name.into(), Arc::new(executor));
    }

    /// Register a closure executor.
    pub fn register_fn<F, Fut>(&mut self, name: impl Into<String>, f: F)
    where
        F: Fn(Value, Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ExecError>> + Send + 'static,
    {
        let f: BoxedExecFn = Box::new(move |params, context| Box::pin(f(params, context)));
        self.executors
            .insert(name.into(), Arc::new(FnExecutor { f }));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Executor>> {
        self.executors.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.executors.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.executors.keys().map(|s| s.as_str())
    }

    /// Names from `expected` with no registered executor.
    pub fn missing(&self, expected: &[String]) -> Vec<String> {
        expected
            .iter()
            .filter(|name| !self.executors.contains_key(*name))
            .cloned()
            .collect()
    }
}

impl std::fmt::Debug for ExecutorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorRegistry")
            .field("executors", &self.executors.keys().collect::<Vec<_>>())
            .finish()
    }
}
