//! In-memory implementation of QueueStore
//!
//! Backs tests and single-process deployments. Unlike a toy mock, this
//! implements the full store semantics: leases, wake times, dependency
//! gating, dedupe keys and the ingest group state machine, against an
//! injectable [`Clock`]. A single write lock serializes mutations, which
//! makes claim trivially atomic.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use super::store::*;
use crate::clock::{Clock, SystemClock};

/// In-memory implementation of [`QueueStore`].
///
/// # Example
///
/// ```
/// use visflow_durable::persistence::InMemoryQueueStore;
///
/// let store = InMemoryQueueStore::new();
/// ```
pub struct InMemoryQueueStore {
    tasks: RwLock<HashMap<Uuid, TaskRecord>>,
    groups: RwLock<HashMap<String, IngestGroup>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryQueueStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create a store reading time from the given clock.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            tasks: RwLock::new(HashMap::new()),
            groups: RwLock::new(HashMap::new()),
            clock,
        }
    }

    /// Number of stored tasks (any state), for tests.
    pub fn task_count(&self) -> usize {
        self.tasks.read().len()
    }

    /// Number of stored groups, for tests.
    pub fn group_count(&self) -> usize {
        self.groups.read().len()
    }

    fn dep_satisfied(tasks: &HashMap<Uuid, TaskRecord>, dep: &Uuid) -> bool {
        match tasks.get(dep) {
            Some(t) => {
                t.state == TaskState::Completed || (t.optional && t.state == TaskState::Dead)
            }
            // Unknown dependency never satisfies; the graph validator
            // prevents this at submission.
            None => false,
        }
    }
}

impl Default for InMemoryQueueStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QueueStore for InMemoryQueueStore {
    async fn spawn(&self, spec: TaskSpec) -> Result<SpawnOutcome, StoreError> {
        let now = self.clock.now();
        let mut tasks = self.tasks.write();

        if let Some(key) = &spec.dedupe_key {
            let existing = tasks.values().find(|t| {
                t.queue == spec.queue
                    && t.name == spec.name
                    && t.dedupe_key.as_deref() == Some(key)
                    && t.state.is_open()
            });
            if let Some(task) = existing {
                return Ok(SpawnOutcome::Deduplicated(task.id));
            }
        }

        let id = spec.id.unwrap_or_else(Uuid::now_v7);
        tasks.insert(
            id,
            TaskRecord {
                id,
                queue: spec.queue,
                name: spec.name,
                params: spec.params,
                priority: spec.priority,
                state: TaskState::Pending,
                claimed_by: None,
                claim_deadline: None,
                wake_at: None,
                attempts: 0,
                max_attempts: spec.max_attempts,
                backoff: spec.backoff,
                result: None,
                error: None,
                created_at: now,
                started_at: None,
                finished_at: None,
                depends_on: spec.depends_on,
                workflow_id: spec.workflow_id,
                schedule_key: spec.schedule_key,
                dedupe_key: spec.dedupe_key,
                optional: spec.optional,
                cancel_requested: false,
            },
        );
        Ok(SpawnOutcome::Created(id))
    }

    async fn claim(
        &self,
        queue: &str,
        worker_id: &str,
        lease: Duration,
    ) -> Result<Option<ClaimedTask>, StoreError> {
        let now = self.clock.now();
        let mut tasks = self.tasks.write();

        let mut eligible: Vec<&TaskRecord> = tasks
            .values()
            .filter(|t| {
                t.queue == queue
                    && matches!(t.state, TaskState::Pending | TaskState::Retrying)
                    && t.wake_at.map(|w| w <= now).unwrap_or(true)
                    && t.depends_on.iter().all(|d| Self::dep_satisfied(&tasks, d))
            })
            .collect();

        eligible.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.created_at.cmp(&b.created_at))
                .then(a.id.cmp(&b.id))
        });

        let Some(id) = eligible.first().map(|t| t.id) else {
            return Ok(None);
        };

        let deadline = now + chrono::Duration::from_std(lease).unwrap_or_default();
        let task = tasks.get_mut(&id).expect("selected task exists");
        task.state = TaskState::Claimed;
        task.claimed_by = Some(worker_id.to_string());
        task.claim_deadline = Some(deadline);
        task.started_at.get_or_insert(now);

        Ok(Some(ClaimedTask {
            id: task.id,
            queue: task.queue.clone(),
            name: task.name.clone(),
            params: task.params.clone(),
            attempts: task.attempts,
            max_attempts: task.max_attempts,
            depends_on: task.depends_on.clone(),
            workflow_id: task.workflow_id,
            optional: task.optional,
            claim_deadline: deadline,
            created_at: task.created_at,
        }))
    }

    async fn heartbeat(
        &self,
        task_id: Uuid,
        worker_id: &str,
        lease: Duration,
    ) -> Result<HeartbeatAck, StoreError> {
        let now = self.clock.now();
        let mut tasks = self.tasks.write();
        let task = tasks
            .get_mut(&task_id)
            .ok_or(StoreError::TaskNotFound(task_id))?;

        if task.state != TaskState::Claimed || task.claimed_by.as_deref() != Some(worker_id) {
            return Err(StoreError::NotOwner {
                task_id,
                worker_id: worker_id.to_string(),
            });
        }

        task.claim_deadline = Some(now + chrono::Duration::from_std(lease).unwrap_or_default());
        Ok(HeartbeatAck {
            cancel_requested: task.cancel_requested,
        })
    }

    async fn complete(
        &self,
        task_id: Uuid,
        worker_id: &str,
        result: serde_json::Value,
    ) -> Result<(), StoreError> {
        let now = self.clock.now();
        let mut tasks = self.tasks.write();
        let task = tasks
            .get_mut(&task_id)
            .ok_or(StoreError::TaskNotFound(task_id))?;

        // Re-delivered completion for an already-completed task is a no-op.
        if task.state == TaskState::Completed {
            return Ok(());
        }

        if task.state != TaskState::Claimed || task.claimed_by.as_deref() != Some(worker_id) {
            return Err(StoreError::NotOwner {
                task_id,
                worker_id: worker_id.to_string(),
            });
        }

        task.state = TaskState::Completed;
        task.result = Some(result);
        task.claimed_by = None;
        task.claim_deadline = None;
        task.finished_at = Some(now);
        Ok(())
    }

    async fn fail(
        &self,
        task_id: Uuid,
        worker_id: &str,
        error: &str,
        retry: bool,
    ) -> Result<FailOutcome, StoreError> {
        let now = self.clock.now();
        let mut tasks = self.tasks.write();
        let task = tasks
            .get_mut(&task_id)
            .ok_or(StoreError::TaskNotFound(task_id))?;

        if task.state != TaskState::Claimed || task.claimed_by.as_deref() != Some(worker_id) {
            return Err(StoreError::NotOwner {
                task_id,
                worker_id: worker_id.to_string(),
            });
        }

        task.attempts += 1;
        task.error = Some(error.to_string());
        task.claimed_by = None;
        task.claim_deadline = None;

        if !retry || task.attempts >= task.max_attempts {
            task.state = TaskState::Dead;
            task.finished_at = Some(now);
            return Ok(FailOutcome::Dead {
                attempts: task.attempts,
            });
        }

        let delay = task.backoff.delay_for_attempt(task.attempts);
        let wake_at = now + chrono::Duration::from_std(delay).unwrap_or_default();
        task.state = TaskState::Retrying;
        task.wake_at = Some(wake_at);
        Ok(FailOutcome::WillRetry {
            attempts: task.attempts,
            wake_at,
        })
    }

    async fn cancel(&self, task_id: Uuid) -> Result<bool, StoreError> {
        let now = self.clock.now();
        let mut tasks = self.tasks.write();
        let task = tasks
            .get_mut(&task_id)
            .ok_or(StoreError::TaskNotFound(task_id))?;

        match task.state {
            TaskState::Pending | TaskState::Retrying => {
                task.state = TaskState::Cancelled;
                task.finished_at = Some(now);
                Ok(true)
            }
            TaskState::Claimed => {
                // Cooperative: the worker discovers this on its next heartbeat.
                task.cancel_requested = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_cancelled(
        &self,
        task_id: Uuid,
        worker_id: &str,
        reason: &str,
    ) -> Result<(), StoreError> {
        let now = self.clock.now();
        let mut tasks = self.tasks.write();
        let task = tasks
            .get_mut(&task_id)
            .ok_or(StoreError::TaskNotFound(task_id))?;

        if task.state != TaskState::Claimed || task.claimed_by.as_deref() != Some(worker_id) {
            return Err(StoreError::NotOwner {
                task_id,
                worker_id: worker_id.to_string(),
            });
        }

        task.state = TaskState::Cancelled;
        task.error = Some(reason.to_string());
        task.claimed_by = None;
        task.claim_deadline = None;
        task.finished_at = Some(now);
        Ok(())
    }

    async fn replay(&self, task_id: Uuid) -> Result<(), StoreError> {
        let mut tasks = self.tasks.write();
        let task = tasks
            .get_mut(&task_id)
            .ok_or(StoreError::TaskNotFound(task_id))?;

        if task.state != TaskState::Dead {
            return Err(StoreError::NotDead(task_id));
        }

        task.state = TaskState::Pending;
        task.attempts = 0;
        task.wake_at = None;
        task.error = None;
        task.finished_at = None;
        task.cancel_requested = false;
        Ok(())
    }

    async fn prune(
        &self,
        before: DateTime<Utc>,
        states: &[TaskState],
    ) -> Result<u64, StoreError> {
        let mut tasks = self.tasks.write();
        let before_len = tasks.len();
        tasks.retain(|_, t| {
            let cutoff = t.finished_at.unwrap_or(t.created_at);
            !(states.contains(&t.state) && t.state.is_terminal() && cutoff < before)
        });
        Ok((before_len - tasks.len()) as u64)
    }

    async fn stats(&self, queue: &str) -> Result<QueueStats, StoreError> {
        let tasks = self.tasks.read();
        let mut stats = QueueStats::default();
        for task in tasks.values().filter(|t| t.queue == queue) {
            match task.state {
                TaskState::Pending => stats.pending += 1,
                TaskState::Claimed => stats.claimed += 1,
                TaskState::Retrying => stats.retrying += 1,
                TaskState::Completed => stats.completed += 1,
                TaskState::Cancelled => stats.cancelled += 1,
                TaskState::Dead => stats.dead += 1,
            }
        }
        Ok(stats)
    }

    async fn get_task(&self, task_id: Uuid) -> Result<TaskRecord, StoreError> {
        self.tasks
            .read()
            .get(&task_id)
            .cloned()
            .ok_or(StoreError::TaskNotFound(task_id))
    }

    async fn list_tasks(&self, filter: TaskFilter) -> Result<Vec<TaskRecord>, StoreError> {
        let tasks = self.tasks.read();
        let mut matched: Vec<TaskRecord> = tasks
            .values()
            .filter(|t| {
                filter.queue.as_deref().map(|q| t.queue == q).unwrap_or(true)
                    && filter.state.map(|s| t.state == s).unwrap_or(true)
                    && filter
                        .workflow_id
                        .map(|w| t.workflow_id == Some(w))
                        .unwrap_or(true)
                    && filter.name.as_deref().map(|n| t.name == n).unwrap_or(true)
            })
            .cloned()
            .collect();

        matched.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        matched.truncate(filter.limit.unwrap_or(100));
        Ok(matched)
    }

    async fn reap_expired(&self) -> Result<Vec<Uuid>, StoreError> {
        let now = self.clock.now();
        let mut tasks = self.tasks.write();
        let mut reaped = vec![];

        for task in tasks.values_mut() {
            if task.state == TaskState::Claimed
                && task.claim_deadline.map(|d| d < now).unwrap_or(false)
            {
                task.claimed_by = None;
                task.claim_deadline = None;
                if task.cancel_requested {
                    // Cancellation was requested while the worker was dying;
                    // honor it instead of requeueing.
                    task.state = TaskState::Cancelled;
                    task.finished_at = Some(now);
                } else {
                    task.state = TaskState::Pending;
                }
                reaped.push(task.id);
            }
        }

        Ok(reaped)
    }

    async fn results_for(
        &self,
        task_ids: &[Uuid],
    ) -> Result<HashMap<Uuid, serde_json::Value>, StoreError> {
        let tasks = self.tasks.read();
        let mut results = HashMap::new();
        for id in task_ids {
            if let Some(task) = tasks.get(id) {
                if task.state == TaskState::Completed {
                    if let Some(result) = &task.result {
                        results.insert(*id, result.clone());
                    }
                }
            }
        }
        Ok(results)
    }

    async fn workflow_tasks(&self, workflow_id: Uuid) -> Result<Vec<TaskRecord>, StoreError> {
        let tasks = self.tasks.read();
        let mut matched: Vec<TaskRecord> = tasks
            .values()
            .filter(|t| t.workflow_id == Some(workflow_id))
            .cloned()
            .collect();
        matched.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(matched)
    }

    async fn cancel_workflow(&self, workflow_id: Uuid) -> Result<u64, StoreError> {
        let now = self.clock.now();
        let mut tasks = self.tasks.write();
        let mut affected = 0;

        for task in tasks
            .values_mut()
            .filter(|t| t.workflow_id == Some(workflow_id))
        {
            match task.state {
                TaskState::Pending | TaskState::Retrying => {
                    task.state = TaskState::Cancelled;
                    task.finished_at = Some(now);
                    affected += 1;
                }
                TaskState::Claimed => {
                    task.cancel_requested = true;
                    affected += 1;
                }
                _ => {}
            }
        }
        Ok(affected)
    }

    async fn oldest_pending(&self, queue: &str) -> Result<Option<DateTime<Utc>>, StoreError> {
        let tasks = self.tasks.read();
        Ok(tasks
            .values()
            .filter(|t| t.queue == queue && t.state == TaskState::Pending)
            .map(|t| t.created_at)
            .min())
    }

    // =========================================================================
    // Ingest groups
    // =========================================================================

    async fn find_group_near(
        &self,
        raw_at: DateTime<Utc>,
        tolerance: Duration,
    ) -> Result<Option<String>, StoreError> {
        let tolerance = chrono::Duration::from_std(tolerance).unwrap_or_default();
        let groups = self.groups.read();
        Ok(groups
            .values()
            .filter(|g| (g.canonical_at - raw_at).abs() <= tolerance)
            .min_by_key(|g| (g.canonical_at - raw_at).abs())
            .map(|g| g.group_key.clone()))
    }

    async fn resolve_group(
        &self,
        raw_at: DateTime<Utc>,
        tolerance: Duration,
        expected_subbands: u16,
    ) -> Result<ResolvedGroup, StoreError> {
        let now = self.clock.now();
        let tolerance = chrono::Duration::from_std(tolerance).unwrap_or_default();
        let mut groups = self.groups.write();

        let nearest = groups
            .values()
            .filter(|g| (g.canonical_at - raw_at).abs() <= tolerance)
            .min_by_key(|g| (g.canonical_at - raw_at).abs())
            .map(|g| g.group_key.clone());

        if let Some(group_key) = nearest {
            return Ok(ResolvedGroup {
                group_key,
                created: false,
            });
        }

        let group_key = group_key_for(raw_at);
        groups.insert(
            group_key.clone(),
            IngestGroup {
                group_key: group_key.clone(),
                canonical_at: raw_at,
                state: GroupState::Collecting,
                received_at: now,
                last_update: now,
                expected_subbands,
                present_bitmap: 0,
                semi_complete: false,
                retry_count: 0,
                error: None,
            },
        );
        Ok(ResolvedGroup {
            group_key,
            created: true,
        })
    }

    async fn record_subband(
        &self,
        group_key: &str,
        subband: u16,
    ) -> Result<SubbandOutcome, StoreError> {
        if subband >= 64 {
            return Err(StoreError::Conflict(format!(
                "subband index {subband} exceeds bitmap width"
            )));
        }

        let now = self.clock.now();
        let mut groups = self.groups.write();
        let group = groups
            .get_mut(group_key)
            .ok_or_else(|| StoreError::GroupNotFound(group_key.to_string()))?;

        let bit = 1u64 << subband;
        if group.present_bitmap & bit != 0 {
            return Ok(SubbandOutcome::Duplicate);
        }

        group.present_bitmap |= bit;
        group.last_update = now;
        Ok(SubbandOutcome::Added {
            present: group.present_count(),
        })
    }

    async fn get_group(&self, group_key: &str) -> Result<IngestGroup, StoreError> {
        self.groups
            .read()
            .get(group_key)
            .cloned()
            .ok_or_else(|| StoreError::GroupNotFound(group_key.to_string()))
    }

    async fn promote_group(
        &self,
        group_key: &str,
        semi_complete: bool,
    ) -> Result<bool, StoreError> {
        let now = self.clock.now();
        let mut groups = self.groups.write();
        let group = groups
            .get_mut(group_key)
            .ok_or_else(|| StoreError::GroupNotFound(group_key.to_string()))?;

        if group.state != GroupState::Collecting {
            return Ok(false);
        }
        group.state = GroupState::Pending;
        group.semi_complete = semi_complete;
        group.last_update = now;
        Ok(true)
    }

    async fn start_group(&self, group_key: &str) -> Result<bool, StoreError> {
        let now = self.clock.now();
        let mut groups = self.groups.write();
        let group = groups
            .get_mut(group_key)
            .ok_or_else(|| StoreError::GroupNotFound(group_key.to_string()))?;

        if group.state != GroupState::Pending {
            return Ok(false);
        }
        group.state = GroupState::InProgress;
        group.last_update = now;
        Ok(true)
    }

    async fn complete_group(&self, group_key: &str) -> Result<bool, StoreError> {
        let now = self.clock.now();
        let mut groups = self.groups.write();
        let group = groups
            .get_mut(group_key)
            .ok_or_else(|| StoreError::GroupNotFound(group_key.to_string()))?;

        if group.state != GroupState::InProgress {
            return Ok(false);
        }
        group.state = GroupState::Completed;
        group.last_update = now;
        Ok(true)
    }

    async fn fail_group(&self, group_key: &str, error: &str) -> Result<(), StoreError> {
        let now = self.clock.now();
        let mut groups = self.groups.write();
        let group = groups
            .get_mut(group_key)
            .ok_or_else(|| StoreError::GroupNotFound(group_key.to_string()))?;

        if group.state == GroupState::Completed {
            return Err(StoreError::InvalidTransition {
                group_key: group_key.to_string(),
                from: group.state,
                to: GroupState::Failed,
            });
        }
        group.state = GroupState::Failed;
        group.error = Some(error.to_string());
        group.last_update = now;
        Ok(())
    }

    async fn retry_group(&self, group_key: &str) -> Result<(), StoreError> {
        let now = self.clock.now();
        let mut groups = self.groups.write();
        let group = groups
            .get_mut(group_key)
            .ok_or_else(|| StoreError::GroupNotFound(group_key.to_string()))?;

        if group.state != GroupState::Failed {
            return Err(StoreError::InvalidTransition {
                group_key: group_key.to_string(),
                from: group.state,
                to: GroupState::Pending,
            });
        }
        group.state = GroupState::Pending;
        group.retry_count += 1;
        group.error = None;
        group.last_update = now;
        Ok(())
    }

    async fn stale_collecting(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<IngestGroup>, StoreError> {
        let groups = self.groups.read();
        let mut stale: Vec<IngestGroup> = groups
            .values()
            .filter(|g| g.state == GroupState::Collecting && g.last_update < older_than)
            .cloned()
            .collect();
        stale.sort_by(|a, b| a.last_update.cmp(&b.last_update));
        Ok(stale)
    }

    async fn group_counts(&self) -> Result<GroupCounts, StoreError> {
        let groups = self.groups.read();
        let mut counts = GroupCounts::default();
        for group in groups.values() {
            match group.state {
                GroupState::Collecting => counts.collecting += 1,
                GroupState::Pending => counts.pending += 1,
                GroupState::InProgress => counts.in_progress += 1,
                GroupState::Completed => counts.completed += 1,
                GroupState::Failed => counts.failed += 1,
            }
        }
        Ok(counts)
    }

    async fn purge_group(&self, group_key: &str) -> Result<bool, StoreError> {
        Ok(self.groups.write().remove(group_key).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::reliability::BackoffPolicy;
    use serde_json::json;

    fn store_with_clock() -> (InMemoryQueueStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        let store = InMemoryQueueStore::with_clock(clock.clone());
        (store, clock)
    }

    fn spec(queue: &str, name: &str) -> TaskSpec {
        TaskSpec::new(queue, name, json!({}))
            .with_backoff(BackoffPolicy::default().with_jitter(false))
    }

    #[tokio::test]
    async fn spawn_claim_complete() {
        let (store, _clock) = store_with_clock();

        let id = store.spawn(spec("q", "convert")).await.unwrap().task_id();

        let claimed = store
            .claim("q", "w1", Duration::from_secs(60))
            .await
            .unwrap()
            .expect("task claimable");
        assert_eq!(claimed.id, id);

        // Second claim sees nothing
        assert!(store
            .claim("q", "w2", Duration::from_secs(60))
            .await
            .unwrap()
            .is_none());

        store.complete(id, "w1", json!({"ok": true})).await.unwrap();
        let task = store.get_task(id).await.unwrap();
        assert_eq!(task.state, TaskState::Completed);
        assert_eq!(task.result, Some(json!({"ok": true})));
    }

    #[tokio::test]
    async fn dedupe_collapses_open_spawns() {
        let (store, _clock) = store_with_clock();

        let first = store
            .spawn(spec("q", "n").with_dedupe_key("k"))
            .await
            .unwrap();
        let second = store
            .spawn(spec("q", "n").with_dedupe_key("k"))
            .await
            .unwrap();

        assert!(matches!(first, SpawnOutcome::Created(_)));
        assert!(matches!(second, SpawnOutcome::Deduplicated(_)));
        assert_eq!(first.task_id(), second.task_id());
        assert_eq!(store.task_count(), 1);

        // A terminal task releases the key
        store.cancel(first.task_id()).await.unwrap();
        let third = store
            .spawn(spec("q", "n").with_dedupe_key("k"))
            .await
            .unwrap();
        assert!(matches!(third, SpawnOutcome::Created(_)));
    }

    #[tokio::test]
    async fn claim_respects_priority_then_age() {
        let (store, clock) = store_with_clock();

        let low = store
            .spawn(spec("q", "a").with_priority(0))
            .await
            .unwrap()
            .task_id();
        clock.advance(chrono::Duration::seconds(1));
        let high = store
            .spawn(spec("q", "b").with_priority(5))
            .await
            .unwrap()
            .task_id();

        let first = store
            .claim("q", "w", Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.id, high);

        let second = store
            .claim("q", "w", Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.id, low);
    }

    #[tokio::test]
    async fn dependencies_gate_claims() {
        let (store, _clock) = store_with_clock();

        let dep = store.spawn(spec("q", "first")).await.unwrap().task_id();
        let succ = store
            .spawn(spec("q", "second").with_depends_on(vec![dep]))
            .await
            .unwrap()
            .task_id();

        // Only the dependency is claimable
        let claimed = store
            .claim("q", "w", Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.id, dep);
        assert!(store
            .claim("q", "w", Duration::from_secs(60))
            .await
            .unwrap()
            .is_none());

        store.complete(dep, "w", json!(null)).await.unwrap();
        let claimed = store
            .claim("q", "w", Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.id, succ);
    }

    #[tokio::test]
    async fn dead_optional_dependency_satisfies_edge() {
        let (store, _clock) = store_with_clock();

        let dep = store
            .spawn(spec("q", "opt").with_max_attempts(1).with_optional(true))
            .await
            .unwrap()
            .task_id();
        let succ = store
            .spawn(spec("q", "next").with_depends_on(vec![dep]))
            .await
            .unwrap()
            .task_id();

        store.claim("q", "w", Duration::from_secs(60)).await.unwrap();
        let outcome = store.fail(dep, "w", "boom", true).await.unwrap();
        assert!(matches!(outcome, FailOutcome::Dead { attempts: 1 }));

        let claimed = store
            .claim("q", "w", Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.id, succ);
    }

    #[tokio::test]
    async fn retry_backoff_sets_wake_time() {
        let (store, clock) = store_with_clock();
        let t0 = clock.now();

        let id = store
            .spawn(spec("q", "flaky").with_max_attempts(3))
            .await
            .unwrap()
            .task_id();

        store.claim("q", "w", Duration::from_secs(60)).await.unwrap();
        let outcome = store.fail(id, "w", "err 1", true).await.unwrap();
        assert_eq!(
            outcome,
            FailOutcome::WillRetry {
                attempts: 1,
                wake_at: t0 + chrono::Duration::seconds(1)
            }
        );

        // Not yet eligible
        assert!(store
            .claim("q", "w", Duration::from_secs(60))
            .await
            .unwrap()
            .is_none());

        clock.advance(chrono::Duration::seconds(1));
        assert!(store
            .claim("q", "w", Duration::from_secs(60))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn reaper_recovers_expired_claims() {
        let (store, clock) = store_with_clock();

        let id = store.spawn(spec("q", "t")).await.unwrap().task_id();
        store.claim("q", "w1", Duration::from_secs(60)).await.unwrap();

        // Lease still valid: nothing reaped
        assert!(store.reap_expired().await.unwrap().is_empty());

        clock.advance(chrono::Duration::seconds(61));
        let reaped = store.reap_expired().await.unwrap();
        assert_eq!(reaped, vec![id]);

        let task = store.get_task(id).await.unwrap();
        assert_eq!(task.state, TaskState::Pending);
        assert_eq!(task.attempts, 0);

        // Late completion from the dead worker is rejected
        let err = store.complete(id, "w1", json!(null)).await.unwrap_err();
        assert!(matches!(err, StoreError::NotOwner { .. }));
    }

    #[tokio::test]
    async fn heartbeat_extends_and_checks_owner() {
        let (store, clock) = store_with_clock();

        let id = store.spawn(spec("q", "t")).await.unwrap().task_id();
        store.claim("q", "w1", Duration::from_secs(60)).await.unwrap();

        clock.advance(chrono::Duration::seconds(50));
        store
            .heartbeat(id, "w1", Duration::from_secs(60))
            .await
            .unwrap();

        // Deadline was pushed out past the original lease
        clock.advance(chrono::Duration::seconds(30));
        assert!(store.reap_expired().await.unwrap().is_empty());

        let err = store
            .heartbeat(id, "w2", Duration::from_secs(60))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotOwner { .. }));
    }

    #[tokio::test]
    async fn cancel_claimed_is_cooperative() {
        let (store, _clock) = store_with_clock();

        let id = store.spawn(spec("q", "t")).await.unwrap().task_id();
        store.claim("q", "w", Duration::from_secs(60)).await.unwrap();

        assert!(store.cancel(id).await.unwrap());
        let task = store.get_task(id).await.unwrap();
        assert_eq!(task.state, TaskState::Claimed);
        assert!(task.cancel_requested);

        let ack = store
            .heartbeat(id, "w", Duration::from_secs(60))
            .await
            .unwrap();
        assert!(ack.cancel_requested);
    }

    #[tokio::test]
    async fn replay_resets_dead_task() {
        let (store, _clock) = store_with_clock();

        let id = store
            .spawn(spec("q", "t").with_max_attempts(1))
            .await
            .unwrap()
            .task_id();
        store.claim("q", "w", Duration::from_secs(60)).await.unwrap();
        store.fail(id, "w", "fatal", false).await.unwrap();

        let task = store.get_task(id).await.unwrap();
        assert_eq!(task.state, TaskState::Dead);
        assert_eq!(task.error.as_deref(), Some("fatal"));

        store.replay(id).await.unwrap();
        let task = store.get_task(id).await.unwrap();
        assert_eq!(task.state, TaskState::Pending);
        assert_eq!(task.attempts, 0);

        // Replay is only valid from the DLQ
        assert!(matches!(
            store.replay(id).await.unwrap_err(),
            StoreError::NotDead(_)
        ));
    }

    #[tokio::test]
    async fn prune_removes_old_terminal_tasks() {
        let (store, clock) = store_with_clock();

        let done = store.spawn(spec("q", "a")).await.unwrap().task_id();
        store.claim("q", "w", Duration::from_secs(60)).await.unwrap();
        store.complete(done, "w", json!(null)).await.unwrap();

        let open = store.spawn(spec("q", "b")).await.unwrap().task_id();

        clock.advance(chrono::Duration::days(8));
        let pruned = store
            .prune(
                clock.now() - chrono::Duration::days(7),
                &[TaskState::Completed],
            )
            .await
            .unwrap();

        assert_eq!(pruned, 1);
        assert!(store.get_task(done).await.is_err());
        assert!(store.get_task(open).await.is_ok());
    }

    #[tokio::test]
    async fn group_resolution_adopts_within_tolerance() {
        let (store, _clock) = store_with_clock();
        let t = Utc::now();

        let first = store
            .resolve_group(t, Duration::from_secs(60), 16)
            .await
            .unwrap();
        assert!(first.created);

        // Jittered arrival adopts the canonical key
        let second = store
            .resolve_group(t + chrono::Duration::seconds(4), Duration::from_secs(60), 16)
            .await
            .unwrap();
        assert!(!second.created);
        assert_eq!(first.group_key, second.group_key);

        // Outside the tolerance a new group forms
        let third = store
            .resolve_group(t + chrono::Duration::seconds(120), Duration::from_secs(60), 16)
            .await
            .unwrap();
        assert!(third.created);
        assert_eq!(store.group_count(), 2);
    }

    #[tokio::test]
    async fn duplicate_subband_is_rejected() {
        let (store, _clock) = store_with_clock();
        let resolved = store
            .resolve_group(Utc::now(), Duration::from_secs(60), 16)
            .await
            .unwrap();

        let added = store.record_subband(&resolved.group_key, 3).await.unwrap();
        assert_eq!(added, SubbandOutcome::Added { present: 1 });

        let dup = store.record_subband(&resolved.group_key, 3).await.unwrap();
        assert_eq!(dup, SubbandOutcome::Duplicate);

        let group = store.get_group(&resolved.group_key).await.unwrap();
        assert_eq!(group.present_count(), 1);
    }

    #[tokio::test]
    async fn group_state_machine_cas() {
        let (store, _clock) = store_with_clock();
        let key = store
            .resolve_group(Utc::now(), Duration::from_secs(60), 16)
            .await
            .unwrap()
            .group_key;

        assert!(store.promote_group(&key, false).await.unwrap());
        // Second promote misses the CAS
        assert!(!store.promote_group(&key, false).await.unwrap());

        assert!(store.start_group(&key).await.unwrap());
        assert!(store.complete_group(&key).await.unwrap());

        // Completed groups cannot be failed
        assert!(matches!(
            store.fail_group(&key, "late").await.unwrap_err(),
            StoreError::InvalidTransition { .. }
        ));
    }

    #[tokio::test]
    async fn failed_group_operator_retry() {
        let (store, _clock) = store_with_clock();
        let key = store
            .resolve_group(Utc::now(), Duration::from_secs(60), 16)
            .await
            .unwrap()
            .group_key;

        store.fail_group(&key, "incomplete").await.unwrap();
        let group = store.get_group(&key).await.unwrap();
        assert_eq!(group.state, GroupState::Failed);
        assert_eq!(group.error.as_deref(), Some("incomplete"));

        store.retry_group(&key).await.unwrap();
        let group = store.get_group(&key).await.unwrap();
        assert_eq!(group.state, GroupState::Pending);
        assert_eq!(group.retry_count, 1);
        assert!(group.error.is_none());
    }
}
