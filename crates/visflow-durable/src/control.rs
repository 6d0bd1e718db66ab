//! Control surface
//!
//! [`Coordinator`] is the programmatic facade external code drives: spawn
//! and inspect tasks, submit and cancel workflows, register triggers, and
//! inspect ingest groups. It owns the background maintenance loops (reaper,
//! retention, scheduler) and the process-wide breaker registry.
//!
//! Everything is constructed explicitly at startup through
//! [`CoordinatorBuilder`] and torn down with [`Coordinator::shutdown`]; there
//! are no lazily-initialized globals.
//!
//! Marking an ingest group `completed` is the embedder's call: wire the final
//! stage of the ingest workflow (or a completion observer) to
//! [`Coordinator::complete_group`].

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::info;
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};
use crate::metrics::{NullMetrics, SharedMetrics};
use crate::persistence::{
    GroupCounts, IngestGroup, QueueStats, QueueStore, SpawnOutcome, StoreError, TaskFilter,
    TaskRecord, TaskSpec,
};
use crate::queue::{Reaper, ReaperConfig, Retention, RetentionConfig, TaskQueue};
use crate::reliability::{BreakerRegistry, CircuitBreakerConfig};
use crate::scheduler::{CronTrigger, GroupFactory, GroupReady, Scheduler, SchedulerConfig, TriggerInfo};
use crate::workflow::{
    Context, StageDef, SubmitError, WorkflowRunner, WorkflowSubmission, WorkflowView,
};

/// Builder for [`Coordinator`].
pub struct CoordinatorBuilder {
    store: Arc<dyn QueueStore>,
    clock: Arc<dyn Clock>,
    metrics: SharedMetrics,
    reaper: ReaperConfig,
    retention: RetentionConfig,
    scheduler: SchedulerConfig,
    breaker_defaults: CircuitBreakerConfig,
}

impl CoordinatorBuilder {
    pub fn new(store: Arc<dyn QueueStore>) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
            metrics: Arc::new(NullMetrics),
            reaper: ReaperConfig::default(),
            retention: RetentionConfig::default(),
            scheduler: SchedulerConfig::default(),
            breaker_defaults: CircuitBreakerConfig::default(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_metrics(mut self, metrics: SharedMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_reaper(mut self, config: ReaperConfig) -> Self {
        self.reaper = config;
        self
    }

    pub fn with_retention(mut self, config: RetentionConfig) -> Self {
        self.retention = config;
        self
    }

    pub fn with_scheduler(mut self, config: SchedulerConfig) -> Self {
        self.scheduler = config;
        self
    }

    pub fn with_breaker_defaults(mut self, config: CircuitBreakerConfig) -> Self {
        self.breaker_defaults = config;
        self
    }

    pub fn build(self) -> Coordinator {
        let queue = TaskQueue::new(self.store.clone(), self.metrics.clone(), self.clock.clone());
        let runner = WorkflowRunner::new(queue.clone());
        let scheduler = Arc::new(Scheduler::new(
            runner.clone(),
            self.clock.clone(),
            self.scheduler,
        ));
        let breakers = Arc::new(BreakerRegistry::new(
            self.breaker_defaults,
            self.clock.clone(),
            self.metrics.clone(),
        ));
        let (shutdown_tx, _) = watch::channel(false);

        Coordinator {
            store: self.store,
            clock: self.clock,
            metrics: self.metrics,
            queue,
            runner,
            scheduler,
            breakers,
            reaper_config: self.reaper,
            retention_config: self.retention,
            shutdown_tx,
            loops: parking_lot::Mutex::new(vec![]),
        }
    }
}

/// The coordination core's programmatic API.
pub struct Coordinator {
    store: Arc<dyn QueueStore>,
    clock: Arc<dyn Clock>,
    metrics: SharedMetrics,
    queue: TaskQueue,
    runner: WorkflowRunner,
    scheduler: Arc<Scheduler>,
    breakers: Arc<BreakerRegistry>,
    reaper_config: ReaperConfig,
    retention_config: RetentionConfig,
    shutdown_tx: watch::Sender<bool>,
    loops: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl Coordinator {
    pub fn builder(store: Arc<dyn QueueStore>) -> CoordinatorBuilder {
        CoordinatorBuilder::new(store)
    }

    // =========================================================================
    // Component access
    // =========================================================================

    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    pub fn runner(&self) -> &WorkflowRunner {
        &self.runner
    }

    pub fn breakers(&self) -> &Arc<BreakerRegistry> {
        &self.breakers
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn metrics(&self) -> &SharedMetrics {
        &self.metrics
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Start the maintenance loops. `group_rx` carries `GroupReady` events
    /// from the ingest grouper into the scheduler.
    pub fn start(&self, group_rx: mpsc::Receiver<GroupReady>) {
        info!("starting coordinator loops");
        let mut loops = self.loops.lock();

        let reaper = Reaper::new(
            self.store.clone(),
            self.metrics.clone(),
            self.reaper_config.clone(),
        );
        loops.push(tokio::spawn(reaper.run(self.shutdown_tx.subscribe())));

        let retention = Retention::new(
            self.store.clone(),
            self.clock.clone(),
            self.retention_config.clone(),
        );
        loops.push(tokio::spawn(retention.run(self.shutdown_tx.subscribe())));

        loops.push(tokio::spawn(
            self.scheduler
                .clone()
                .run(group_rx, self.shutdown_tx.subscribe()),
        ));
    }

    /// Stop the maintenance loops.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let handles: Vec<_> = self.loops.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
        info!("coordinator stopped");
    }

    // =========================================================================
    // Tasks
    // =========================================================================

    pub async fn spawn_task(&self, spec: TaskSpec) -> Result<SpawnOutcome, StoreError> {
        self.queue.spawn(spec).await
    }

    pub async fn get_task(&self, task_id: Uuid) -> Result<TaskRecord, StoreError> {
        self.queue.get_task(task_id).await
    }

    pub async fn list_tasks(&self, filter: TaskFilter) -> Result<Vec<TaskRecord>, StoreError> {
        self.queue.list_tasks(filter).await
    }

    pub async fn cancel_task(&self, task_id: Uuid) -> Result<bool, StoreError> {
        self.queue.cancel(task_id).await
    }

    /// Resurrect a dead-letter task.
    pub async fn replay_task(&self, task_id: Uuid) -> Result<(), StoreError> {
        self.queue.replay(task_id).await
    }

    pub async fn queue_stats(&self, queue: &str) -> Result<QueueStats, StoreError> {
        self.queue.stats(queue).await
    }

    // =========================================================================
    // Workflows
    // =========================================================================

    pub async fn submit_workflow(
        &self,
        queue: &str,
        workflow_name: &str,
        stages: Vec<StageDef>,
        context_root: Context,
    ) -> Result<WorkflowSubmission, SubmitError> {
        self.runner
            .submit(queue, workflow_name, stages, context_root, None)
            .await
    }

    pub async fn get_workflow(&self, workflow_id: Uuid) -> Result<WorkflowView, StoreError> {
        self.runner.workflow(workflow_id).await
    }

    pub async fn cancel_workflow(&self, workflow_id: Uuid) -> Result<u64, StoreError> {
        self.runner.cancel(workflow_id).await
    }

    // =========================================================================
    // Triggers
    // =========================================================================

    pub fn register_trigger(&self, trigger: CronTrigger) {
        self.scheduler.register_trigger(trigger);
    }

    pub fn list_triggers(&self) -> Vec<TriggerInfo> {
        self.scheduler.list_triggers()
    }

    pub fn on_group_ready(&self, factory: GroupFactory) {
        self.scheduler.on_group_ready(factory);
    }

    // =========================================================================
    // Ingest groups
    // =========================================================================

    pub async fn get_group(&self, group_key: &str) -> Result<IngestGroup, StoreError> {
        self.store.get_group(group_key).await
    }

    pub async fn group_counts(&self) -> Result<GroupCounts, StoreError> {
        self.store.group_counts().await
    }

    /// Operator retry of a failed group.
    pub async fn retry_group(&self, group_key: &str) -> Result<(), StoreError> {
        self.store.retry_group(group_key).await
    }

    /// Mark a group's workflow as terminally successful.
    pub async fn complete_group(&self, group_key: &str) -> Result<bool, StoreError> {
        self.store.complete_group(group_key).await
    }

    pub async fn fail_group(&self, group_key: &str, error: &str) -> Result<(), StoreError> {
        self.store.fail_group(group_key, error).await
    }

    /// Operator purge of a group row.
    pub async fn purge_group(&self, group_key: &str) -> Result<bool, StoreError> {
        self.store.purge_group(group_key).await
    }

    /// Prune terminal tasks finished before the cutoff.
    pub async fn prune_tasks(
        &self,
        before: DateTime<Utc>,
        states: &[crate::persistence::TaskState],
    ) -> Result<u64, StoreError> {
        self.queue.prune(before, states).await
    }
}
