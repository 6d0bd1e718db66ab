//! Task queue client
//!
//! A thin layer over [`QueueStore`] that instruments every operation and
//! applies the workflow failure policy: a dead non-optional workflow task
//! cancels the rest of its workflow.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::metrics::{names, SharedMetrics};
use crate::persistence::{
    ClaimedTask, FailOutcome, HeartbeatAck, QueueStats, QueueStore, SpawnOutcome, StoreError,
    TaskFilter, TaskRecord, TaskSpec, TaskState,
};

/// Instrumented client over the queue store.
///
/// Cheap to clone; workers, the workflow runner and the control facade all
/// share one.
#[derive(Clone)]
pub struct TaskQueue {
    store: Arc<dyn QueueStore>,
    metrics: SharedMetrics,
    clock: Arc<dyn Clock>,
}

impl TaskQueue {
    pub fn new(store: Arc<dyn QueueStore>, metrics: SharedMetrics, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            metrics,
            clock,
        }
    }

    pub fn store(&self) -> &Arc<dyn QueueStore> {
        &self.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn metrics(&self) -> &SharedMetrics {
        &self.metrics
    }

    /// Spawn a task; dedupe collisions return the existing open task's id.
    pub async fn spawn(&self, spec: TaskSpec) -> Result<SpawnOutcome, StoreError> {
        let labels = [("queue", spec.queue.as_str()), ("task", spec.name.as_str())];
        let outcome = self.store.spawn(spec.clone()).await?;
        match outcome {
            SpawnOutcome::Created(_) => {
                self.metrics.counter(names::TASKS_SPAWNED, &labels, 1);
            }
            SpawnOutcome::Deduplicated(id) => {
                self.metrics.counter(names::TASKS_DUPLICATED, &labels, 1);
                debug!(%id, queue = %spec.queue, name = %spec.name, "spawn deduplicated");
            }
        }
        Ok(outcome)
    }

    /// Claim at most one eligible task with the given lease.
    pub async fn claim(
        &self,
        queue: &str,
        worker_id: &str,
        lease: Duration,
    ) -> Result<Option<ClaimedTask>, StoreError> {
        let task = self.store.claim(queue, worker_id, lease).await?;
        if let Some(task) = &task {
            let labels = [("queue", task.queue.as_str()), ("task", task.name.as_str())];
            self.metrics.counter(names::TASKS_CLAIMED, &labels, 1);
            let waited = (self.clock.now() - task.created_at)
                .to_std()
                .unwrap_or_default();
            self.metrics
                .histogram(names::TASK_WAIT_SECONDS, &labels, waited.as_secs_f64());
        }
        Ok(task)
    }

    pub async fn heartbeat(
        &self,
        task_id: Uuid,
        worker_id: &str,
        lease: Duration,
    ) -> Result<HeartbeatAck, StoreError> {
        self.store.heartbeat(task_id, worker_id, lease).await
    }

    /// Complete a claimed task with its result payload.
    pub async fn complete(
        &self,
        task: &ClaimedTask,
        worker_id: &str,
        result: serde_json::Value,
        exec_time: Duration,
    ) -> Result<(), StoreError> {
        self.store.complete(task.id, worker_id, result).await?;

        let labels = [("queue", task.queue.as_str()), ("task", task.name.as_str())];
        self.metrics.counter(names::TASKS_COMPLETED, &labels, 1);
        self.metrics
            .histogram(names::TASK_EXEC_SECONDS, &labels, exec_time.as_secs_f64());
        let total = (self.clock.now() - task.created_at)
            .to_std()
            .unwrap_or_default();
        self.metrics
            .histogram(names::TASK_TOTAL_SECONDS, &labels, total.as_secs_f64());
        Ok(())
    }

    /// Fail a claimed task. A dead non-optional workflow task fails its
    /// workflow: the remaining tasks are cancelled.
    pub async fn fail(
        &self,
        task: &ClaimedTask,
        worker_id: &str,
        error: &str,
        retry: bool,
    ) -> Result<FailOutcome, StoreError> {
        let outcome = self.store.fail(task.id, worker_id, error, retry).await?;

        let labels = [("queue", task.queue.as_str()), ("task", task.name.as_str())];
        self.metrics.counter(names::TASKS_FAILED, &labels, 1);

        if let FailOutcome::Dead { attempts } = &outcome {
            self.metrics.counter(names::TASKS_DEAD, &labels, 1);
            warn!(
                task_id = %task.id,
                name = %task.name,
                attempts,
                error,
                "task moved to dead letter"
            );

            if let Some(workflow_id) = task.workflow_id {
                if !task.optional {
                    let cancelled = self.store.cancel_workflow(workflow_id).await?;
                    info!(
                        %workflow_id,
                        cancelled,
                        "workflow failed; cancelled remaining tasks"
                    );
                }
            }
        }
        Ok(outcome)
    }

    /// Cancel a task (terminal for pending/retrying, cooperative for claimed).
    pub async fn cancel(&self, task_id: Uuid) -> Result<bool, StoreError> {
        let cancelled = self.store.cancel(task_id).await?;
        if cancelled {
            self.metrics.counter(names::TASKS_CANCELLED, &[], 1);
        }
        Ok(cancelled)
    }

    /// Record a cancelled outcome reported by a worker that observed the
    /// cancellation cooperatively (or hit a stage timeout).
    pub async fn confirm_cancelled(
        &self,
        task: &ClaimedTask,
        worker_id: &str,
        reason: &str,
    ) -> Result<(), StoreError> {
        match self.store.mark_cancelled(task.id, worker_id, reason).await {
            Ok(()) => {}
            // The lease already lapsed; the reaper owns the outcome.
            Err(StoreError::NotOwner { .. }) => return Ok(()),
            Err(e) => return Err(e),
        }
        let labels = [("queue", task.queue.as_str()), ("task", task.name.as_str())];
        self.metrics.counter(names::TASKS_CANCELLED, &labels, 1);
        Ok(())
    }

    pub async fn replay(&self, task_id: Uuid) -> Result<(), StoreError> {
        self.store.replay(task_id).await
    }

    pub async fn prune(
        &self,
        before: DateTime<Utc>,
        states: &[TaskState],
    ) -> Result<u64, StoreError> {
        self.store.prune(before, states).await
    }

    pub async fn get_task(&self, task_id: Uuid) -> Result<TaskRecord, StoreError> {
        self.store.get_task(task_id).await
    }

    pub async fn list_tasks(&self, filter: TaskFilter) -> Result<Vec<TaskRecord>, StoreError> {
        self.store.list_tasks(filter).await
    }

    pub async fn results_for(
        &self,
        task_ids: &[Uuid],
    ) -> Result<HashMap<Uuid, serde_json::Value>, StoreError> {
        self.store.results_for(task_ids).await
    }

    /// Counts by state; also refreshes the queue depth and oldest-pending
    /// gauges for this queue.
    pub async fn stats(&self, queue: &str) -> Result<QueueStats, StoreError> {
        let stats = self.store.stats(queue).await?;

        for (state, value) in [
            ("pending", stats.pending),
            ("claimed", stats.claimed),
            ("retrying", stats.retrying),
            ("completed", stats.completed),
            ("cancelled", stats.cancelled),
            ("dead", stats.dead),
        ] {
            self.metrics.gauge(
                names::QUEUE_DEPTH,
                &[("queue", queue), ("state", state)],
                value as f64,
            );
        }

        let oldest = self.store.oldest_pending(queue).await?;
        let age = oldest
            .map(|at| (self.clock.now() - at).to_std().unwrap_or_default())
            .unwrap_or_default();
        self.metrics.gauge(
            names::OLDEST_PENDING_AGE,
            &[("queue", queue)],
            age.as_secs_f64(),
        );

        Ok(stats)
    }
}
