//! Worker pool
//!
//! Loop: claim one task per free slot, execute its registered executor under
//! a heartbeat ticker, classify the outcome, report. Graceful shutdown stops
//! claiming and drains in-flight tasks within a bounded timeout; anything
//! left behind loses its lease and is recovered by the reaper.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

#[cfg(test)]
use super::executor::Executor;
use super::executor::{CancellationHandle, ExecContext, ExecError, ExecutorRegistry};
use crate::metrics::names;
use crate::persistence::{ClaimedTask, StoreError};
use crate::queue::TaskQueue;
use crate::workflow::{assemble_context, AssemblyError, Context};

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Unique worker id (generated if not provided).
    pub worker_id: String,

    /// Queue this worker claims from.
    pub queue: String,

    /// Parallel task executions.
    pub concurrency: usize,

    /// Delay between empty claims.
    pub poll_interval: Duration,

    /// Claim lease; heartbeats extend it.
    pub lease: Duration,

    /// Heartbeat cadence; defaults to a third of the lease.
    pub heartbeat_interval: Option<Duration>,

    /// Graceful shutdown drain timeout.
    pub drain_timeout: Duration,

    /// Executor names that must be registered before `start` succeeds.
    pub expected_executors: Vec<String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", Uuid::now_v7()),
            queue: "default".to_string(),
            concurrency: 4,
            poll_interval: Duration::from_secs(1),
            lease: Duration::from_secs(60),
            heartbeat_interval: None,
            drain_timeout: Duration::from_secs(30),
            expected_executors: vec![],
        }
    }
}

impl WorkerConfig {
    pub fn new(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            ..Default::default()
        }
    }

    pub fn with_worker_id(mut self, id: impl Into<String>) -> Self {
        self.worker_id = id.into();
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = Some(interval);
        self
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    pub fn with_expected_executors<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.expected_executors = names.into_iter().map(Into::into).collect();
        self
    }

    fn heartbeat(&self) -> Duration {
        self.heartbeat_interval.unwrap_or(self.lease / 3)
    }
}

/// Worker lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    Running,
    Draining,
    Stopped,
}

/// Worker errors
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    /// Store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Worker already running
    #[error("worker is already running")]
    AlreadyRunning,

    /// Graceful shutdown timed out; stragglers fall to the reaper
    #[error("graceful shutdown timed out")]
    ShutdownTimeout,

    /// Expected executors are not registered
    #[error("no executor registered for: {0:?}")]
    MissingExecutors(Vec<String>),
}

/// Claims and executes tasks from one queue.
///
/// # Example
///
/// ```ignore
/// let mut registry = ExecutorRegistry::new();
/// registry.register_fn("subband_convert", |params, context| async move {
///     Ok(json!({"ms_path": "/data/out.ms"}))
/// });
///
/// let worker = Worker::new(queue, Arc::new(registry), WorkerConfig::new("imaging"));
/// worker.start()?;
/// // ...
/// worker.shutdown().await?;
/// ```
pub struct Worker {
    queue: TaskQueue,
    registry: Arc<ExecutorRegistry>,
    config: WorkerConfig,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    status: parking_lot::RwLock<WorkerStatus>,
    slots: Arc<Semaphore>,
    tracker: TaskTracker,
    active: Arc<DashMap<Uuid, CancellationHandle>>,
    poll_handle: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl Worker {
    pub fn new(queue: TaskQueue, registry: Arc<ExecutorRegistry>, config: WorkerConfig) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            queue,
            registry,
            slots: Arc::new(Semaphore::new(config.concurrency)),
            config,
            shutdown_tx,
            shutdown_rx,
            status: parking_lot::RwLock::new(WorkerStatus::Stopped),
            tracker: TaskTracker::new(),
            active: Arc::new(DashMap::new()),
            poll_handle: parking_lot::Mutex::new(None),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    pub fn status(&self) -> WorkerStatus {
        *self.status.read()
    }

    /// Tasks currently executing.
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Start the claim loop.
    #[instrument(skip(self), fields(worker_id = %self.config.worker_id))]
    pub fn start(&self) -> Result<(), WorkerError> {
        {
            let mut status = self.status.write();
            if *status == WorkerStatus::Running {
                return Err(WorkerError::AlreadyRunning);
            }
            *status = WorkerStatus::Running;
        }

        let missing = self.registry.missing(&self.config.expected_executors);
        if !missing.is_empty() {
            *self.status.write() = WorkerStatus::Stopped;
            return Err(WorkerError::MissingExecutors(missing));
        }

        info!(
            worker_id = %self.config.worker_id,
            queue = %self.config.queue,
            concurrency = self.config.concurrency,
            "starting worker"
        );
        self.queue.metrics().gauge(
            names::ACTIVE_WORKERS,
            &[("worker", &self.config.worker_id)],
            1.0,
        );

        let handle = tokio::spawn(poll_loop(
            self.queue.clone(),
            self.registry.clone(),
            self.config.clone(),
            self.slots.clone(),
            self.tracker.clone(),
            self.active.clone(),
            self.shutdown_rx.clone(),
        ));
        *self.poll_handle.lock() = Some(handle);
        Ok(())
    }

    /// Stop claiming, drain in-flight tasks, then exit.
    ///
    /// After the drain timeout, remaining executors get a cooperative cancel
    /// and their leases are left to lapse; the reaper recovers them.
    #[instrument(skip(self), fields(worker_id = %self.config.worker_id))]
    pub async fn shutdown(&self) -> Result<(), WorkerError> {
        {
            let mut status = self.status.write();
            if *status == WorkerStatus::Stopped {
                return Ok(());
            }
            *status = WorkerStatus::Draining;
        }

        info!(worker_id = %self.config.worker_id, "draining worker");
        let _ = self.shutdown_tx.send(true);
        self.tracker.close();

        let drained = tokio::time::timeout(self.config.drain_timeout, self.tracker.wait())
            .await
            .is_ok();

        *self.status.write() = WorkerStatus::Stopped;
        self.queue.metrics().gauge(
            names::ACTIVE_WORKERS,
            &[("worker", &self.config.worker_id)],
            0.0,
        );

        if drained {
            info!(worker_id = %self.config.worker_id, "worker stopped");
            Ok(())
        } else {
            warn!(
                remaining = self.active.len(),
                "drain timeout; releasing stragglers to the reaper"
            );
            for entry in self.active.iter() {
                entry.value().cancel();
            }
            Err(WorkerError::ShutdownTimeout)
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn poll_loop(
    queue: TaskQueue,
    registry: Arc<ExecutorRegistry>,
    config: WorkerConfig,
    slots: Arc<Semaphore>,
    tracker: TaskTracker,
    active: Arc<DashMap<Uuid, CancellationHandle>>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        // Hold a concurrency slot before claiming so we never claim a task
        // we cannot run.
        let permit = tokio::select! {
            permit = slots.clone().acquire_owned() => permit.expect("semaphore is never closed"),
            _ = shutdown_rx.changed() => break,
        };

        match queue
            .claim(&config.queue, &config.worker_id, config.lease)
            .await
        {
            Ok(Some(task)) => {
                let queue = queue.clone();
                let registry = registry.clone();
                let config = config.clone();
                let active = active.clone();
                tracker.spawn(async move {
                    run_task(queue, registry, config, active, task).await;
                    drop(permit);
                });
            }
            Ok(None) => {
                drop(permit);
                tokio::select! {
                    _ = tokio::time::sleep(config.poll_interval) => {}
                    _ = shutdown_rx.changed() => break,
                }
            }
            Err(e) => {
                // Infrastructure failure: back off for a poll interval.
                error!("claim failed: {}", e);
                drop(permit);
                tokio::select! {
                    _ = tokio::time::sleep(config.poll_interval) => {}
                    _ = shutdown_rx.changed() => break,
                }
            }
        }
    }

    debug!("poll loop exited");
}

async fn run_task(
    queue: TaskQueue,
    registry: Arc<ExecutorRegistry>,
    config: WorkerConfig,
    active: Arc<DashMap<Uuid, CancellationHandle>>,
    task: ClaimedTask,
) {
    let worker_id = config.worker_id.clone();
    let exec_ctx = ExecContext::new(task.id, task.attempts + 1, task.max_attempts);
    let cancel = exec_ctx.cancellation_handle();
    active.insert(task.id, cancel.clone());

    // Heartbeat ticker at lease/3; a rejected heartbeat means the lease was
    // lost to the reaper and the execution result no longer matters.
    let heartbeat_handle = tokio::spawn({
        let queue = queue.clone();
        let worker_id = worker_id.clone();
        let cancel = cancel.clone();
        let lease = config.lease;
        let interval = config.heartbeat();
        let task_id = task.id;
        async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // first tick fires immediately
            loop {
                ticker.tick().await;
                match queue.heartbeat(task_id, &worker_id, lease).await {
                    Ok(ack) => {
                        if ack.cancel_requested {
                            debug!(%task_id, "cancel requested via heartbeat");
                            cancel.cancel();
                        }
                    }
                    Err(StoreError::NotOwner { .. }) => {
                        warn!(%task_id, "lease lost; cancelling execution");
                        cancel.cancel();
                        break;
                    }
                    Err(e) => {
                        warn!(%task_id, "heartbeat failed: {}", e);
                    }
                }
            }
        }
    });

    let started = std::time::Instant::now();
    let result = execute(&queue, &registry, &exec_ctx, &cancel, &task).await;
    let exec_time = started.elapsed();

    heartbeat_handle.abort();
    active.remove(&task.id);

    let report = match result {
        Ok(value) => queue.complete(&task, &worker_id, value, exec_time).await,
        Err(ExecError::Transient(msg)) => {
            queue.fail(&task, &worker_id, &msg, true).await.map(|_| ())
        }
        Err(ExecError::Permanent(msg)) => {
            queue.fail(&task, &worker_id, &msg, false).await.map(|_| ())
        }
        Err(ExecError::Cancelled(msg)) => queue.confirm_cancelled(&task, &worker_id, &msg).await,
    };

    if let Err(e) = report {
        match e {
            // The reaper won the race; its outcome stands.
            StoreError::NotOwner { .. } => {
                debug!(task_id = %task.id, "report rejected; claim was reaped")
            }
            e => error!(task_id = %task.id, "failed to report task outcome: {}", e),
        }
    }
}

async fn execute(
    queue: &TaskQueue,
    registry: &ExecutorRegistry,
    exec_ctx: &ExecContext,
    cancel: &CancellationHandle,
    task: &ClaimedTask,
) -> Result<Value, ExecError> {
    // Workflow tasks carry a stage envelope; plain tasks resolve their
    // executor by task name and run with an empty context.
    let (executor_ref, params, context, timeout) = if task.workflow_id.is_some() {
        match assemble_context(queue, task).await {
            Ok((envelope, context)) => {
                let timeout = envelope.timeout();
                (envelope.executor_ref, envelope.config, context, timeout)
            }
            Err(AssemblyError::Store(e)) => {
                return Err(ExecError::transient(format!("context assembly: {e}")))
            }
            Err(e) => return Err(ExecError::permanent(format!("context assembly: {e}"))),
        }
    } else {
        (task.name.clone(), task.params.clone(), Context::new(), None)
    };

    let Some(executor) = registry.get(&executor_ref) else {
        return Err(ExecError::permanent(format!(
            "no executor registered for '{executor_ref}'"
        )));
    };

    match timeout {
        Some(limit) => {
            match tokio::time::timeout(limit, executor.execute(exec_ctx, params, &context)).await {
                Ok(result) => result,
                Err(_) => {
                    // Timeout is a scheduled cancellation, not a retry.
                    cancel.cancel();
                    Err(ExecError::cancelled(format!(
                        "timed out after {:.1}s",
                        limit.as_secs_f64()
                    )))
                }
            }
        }
        None => executor.execute(exec_ctx, params, &context).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::metrics::InMemoryMetrics;
    use crate::persistence::{InMemoryQueueStore, TaskSpec, TaskState};
    use crate::reliability::BackoffPolicy;
    use crate::workflow::{StageDef, StageRetry, WorkflowRunner};
    use serde_json::json;

    fn test_queue() -> TaskQueue {
        TaskQueue::new(
            Arc::new(InMemoryQueueStore::new()),
            Arc::new(InMemoryMetrics::new()),
            Arc::new(SystemClock),
        )
    }

    fn fast_config(queue: &str) -> WorkerConfig {
        WorkerConfig::new(queue)
            .with_worker_id("w-test")
            .with_poll_interval(Duration::from_millis(10))
            .with_drain_timeout(Duration::from_secs(2))
    }

    async fn wait_for_state(queue: &TaskQueue, id: Uuid, state: TaskState) {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if queue.get_task(id).await.unwrap().state == state {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("task never reached {state}"));
    }

    #[tokio::test]
    async fn executes_and_completes_tasks() {
        let queue = test_queue();
        let mut registry = ExecutorRegistry::new();
        registry.register_fn("echo", |params, _context| async move {
            Ok(json!({"echoed": params}))
        });

        let id = queue
            .spawn(TaskSpec::new("q", "echo", json!({"x": 1})))
            .await
            .unwrap()
            .task_id();

        let worker = Worker::new(queue.clone(), Arc::new(registry), fast_config("q"));
        worker.start().unwrap();

        wait_for_state(&queue, id, TaskState::Completed).await;
        let record = queue.get_task(id).await.unwrap();
        assert_eq!(record.result, Some(json!({"echoed": {"x": 1}})));

        worker.shutdown().await.unwrap();
        assert_eq!(worker.status(), WorkerStatus::Stopped);
    }

    #[tokio::test]
    async fn start_refuses_missing_expected_executor() {
        let queue = test_queue();
        let registry = ExecutorRegistry::new();

        let worker = Worker::new(
            queue,
            Arc::new(registry),
            fast_config("q").with_expected_executors(["subband_convert"]),
        );

        let err = worker.start().unwrap_err();
        assert!(matches!(err, WorkerError::MissingExecutors(names) if names == ["subband_convert"]));
        assert_eq!(worker.status(), WorkerStatus::Stopped);
    }

    #[tokio::test]
    async fn permanent_failure_goes_straight_to_dead() {
        let queue = test_queue();
        let mut registry = ExecutorRegistry::new();
        registry.register_fn("bad_input", |_params, _context| async move {
            Err(ExecError::permanent("params failed validation"))
        });

        let id = queue
            .spawn(TaskSpec::new("q", "bad_input", json!({})).with_max_attempts(3))
            .await
            .unwrap()
            .task_id();

        let worker = Worker::new(queue.clone(), Arc::new(registry), fast_config("q"));
        worker.start().unwrap();

        wait_for_state(&queue, id, TaskState::Dead).await;
        let record = queue.get_task(id).await.unwrap();
        assert_eq!(record.attempts, 1);
        assert_eq!(record.error.as_deref(), Some("params failed validation"));

        worker.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn transient_failure_schedules_retry() {
        let queue = test_queue();
        let mut registry = ExecutorRegistry::new();
        registry.register_fn("flaky", |_params, _context| async move {
            Err(ExecError::transient("connection refused"))
        });

        let id = queue
            .spawn(
                TaskSpec::new("q", "flaky", json!({}))
                    .with_max_attempts(3)
                    .with_backoff(BackoffPolicy::fixed(Duration::from_secs(60))),
            )
            .await
            .unwrap()
            .task_id();

        let worker = Worker::new(queue.clone(), Arc::new(registry), fast_config("q"));
        worker.start().unwrap();

        wait_for_state(&queue, id, TaskState::Retrying).await;
        let record = queue.get_task(id).await.unwrap();
        assert_eq!(record.attempts, 1);
        assert!(record.wake_at.is_some());

        worker.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn unregistered_task_name_is_a_contract_violation() {
        let queue = test_queue();
        let registry = ExecutorRegistry::new();

        let id = queue
            .spawn(TaskSpec::new("q", "ghost", json!({})))
            .await
            .unwrap()
            .task_id();

        let worker = Worker::new(queue.clone(), Arc::new(registry), fast_config("q"));
        worker.start().unwrap();

        wait_for_state(&queue, id, TaskState::Dead).await;
        let record = queue.get_task(id).await.unwrap();
        assert!(record.error.unwrap().contains("no executor registered"));

        worker.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn stage_timeout_cancels_the_task() {
        let queue = test_queue();
        let mut registry = ExecutorRegistry::new();
        registry.register_fn("slow", |_params, _context| async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(json!({}))
        });

        let runner = WorkflowRunner::new(queue.clone());
        let submission = runner
            .submit(
                "q",
                "wf",
                vec![StageDef::new("slow", "slow")
                    .with_timeout(Duration::from_millis(50))
                    .with_retry(StageRetry::none())],
                Context::new(),
                None,
            )
            .await
            .unwrap();
        let id = submission.task_ids["slow"];

        let worker = Worker::new(queue.clone(), Arc::new(registry), fast_config("q"));
        worker.start().unwrap();

        wait_for_state(&queue, id, TaskState::Cancelled).await;
        let record = queue.get_task(id).await.unwrap();
        assert!(record.error.unwrap().contains("timed out"));

        worker.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn cooperative_cancellation_via_heartbeat() {
        let queue = test_queue();
        let mut registry = ExecutorRegistry::new();
        registry.register("waiter", Waiter);

        let id = queue
            .spawn(TaskSpec::new("q", "waiter", json!({})))
            .await
            .unwrap()
            .task_id();

        // Short lease so the heartbeat ticker runs quickly
        let config = fast_config("q").with_lease(Duration::from_millis(300));
        let worker = Worker::new(queue.clone(), Arc::new(registry), config);
        worker.start().unwrap();

        wait_for_state(&queue, id, TaskState::Claimed).await;
        queue.cancel(id).await.unwrap();

        wait_for_state(&queue, id, TaskState::Cancelled).await;
        worker.shutdown().await.unwrap();
    }

    struct Waiter;

    #[async_trait::async_trait]
    impl Executor for Waiter {
        async fn execute(
            &self,
            ctx: &ExecContext,
            _params: Value,
            _context: &Context,
        ) -> Result<Value, ExecError> {
            ctx.cancelled().await;
            Err(ExecError::cancelled("observed cancel at a safe point"))
        }
    }

    #[tokio::test]
    async fn workflow_stage_runs_with_assembled_context() {
        let queue = test_queue();
        let mut registry = ExecutorRegistry::new();
        registry.register_fn("produce", |_params, _context| async move {
            Ok(json!({"ms_path": "/data/t0.ms"}))
        });
        registry.register_fn("consume", |_params, context: Context| async move {
            let path = context
                .get("ms_path")
                .and_then(|v| v.as_str())
                .ok_or_else(|| ExecError::permanent("missing ms_path"))?;
            Ok(json!({"imaged": path}))
        });

        let runner = WorkflowRunner::new(queue.clone());
        let submission = runner
            .submit(
                "q",
                "wf",
                vec![
                    StageDef::new("produce", "produce").with_outputs(["ms_path"]),
                    StageDef::new("consume", "consume").depends_on(["produce"]),
                ],
                Context::new(),
                None,
            )
            .await
            .unwrap();

        let worker = Worker::new(queue.clone(), Arc::new(registry), fast_config("q"));
        worker.start().unwrap();

        wait_for_state(&queue, submission.task_ids["consume"], TaskState::Completed).await;
        let record = queue
            .get_task(submission.task_ids["consume"])
            .await
            .unwrap();
        assert_eq!(record.result, Some(json!({"imaged": "/data/t0.ms"})));

        worker.shutdown().await.unwrap();
    }
}
