//! QueueStore trait definition
//!
//! The store owns the two logical tables the coordinator persists:
//! `tasks` (workflow lifecycle) and `ingest_queue` (group lifecycle).
//! Implementations must be thread-safe; claim must be atomic so that two
//! concurrent claimers never observe the same task.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::reliability::BackoffPolicy;

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Task not found
    #[error("task not found: {0}")]
    TaskNotFound(Uuid),

    /// Ingest group not found
    #[error("ingest group not found: {0}")]
    GroupNotFound(String),

    /// No tasks exist for the given workflow id
    #[error("workflow not found: {0}")]
    WorkflowNotFound(Uuid),

    /// The caller does not hold the task's claim
    #[error("task {task_id} is not claimed by {worker_id}")]
    NotOwner { task_id: Uuid, worker_id: String },

    /// Replay requested for a task that is not in the dead-letter state
    #[error("task {0} is not in the dead-letter queue")]
    NotDead(Uuid),

    /// State transition rejected
    #[error("invalid transition for group {group_key}: {from} -> {to}")]
    InvalidTransition {
        group_key: String,
        from: GroupState,
        to: GroupState,
    },

    /// Lost a canonicalization or claim race; safe to retry
    #[error("store conflict: {0}")]
    Conflict(String),

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Task lifecycle states.
///
/// `dead` is the dead-letter terminal; [`QueueStore::replay`] is the only
/// path back out of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Claimed,
    Retrying,
    Completed,
    Cancelled,
    Dead,
}

impl TaskState {
    /// Terminal states are never claimed again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Dead)
    }

    /// States in which a dedupe key keeps collapsing spawns.
    pub fn is_open(self) -> bool {
        !self.is_terminal()
    }

    pub fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "pending" => Ok(Self::Pending),
            "claimed" => Ok(Self::Claimed),
            "retrying" => Ok(Self::Retrying),
            "completed" => Ok(Self::Completed),
            "cancelled" => Ok(Self::Cancelled),
            "dead" => Ok(Self::Dead),
            _ => Err(StoreError::Database(format!("unknown task state: {s}"))),
        }
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Claimed => write!(f, "claimed"),
            Self::Retrying => write!(f, "retrying"),
            Self::Completed => write!(f, "completed"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Dead => write!(f, "dead"),
        }
    }
}

/// Specification of a task to spawn.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    /// Pre-minted id; minted by the store when absent. The workflow runner
    /// mints ids up front so `depends_on` edges can reference them.
    pub id: Option<Uuid>,
    pub queue: String,
    pub name: String,
    pub params: serde_json::Value,
    pub priority: i32,
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
    pub depends_on: Vec<Uuid>,
    pub dedupe_key: Option<String>,
    pub workflow_id: Option<Uuid>,
    pub schedule_key: Option<String>,
    /// Optional workflow stages do not fail their successors when dead.
    pub optional: bool,
}

impl TaskSpec {
    pub fn new(
        queue: impl Into<String>,
        name: impl Into<String>,
        params: serde_json::Value,
    ) -> Self {
        Self {
            id: None,
            queue: queue.into(),
            name: name.into(),
            params,
            priority: 0,
            max_attempts: 3,
            backoff: BackoffPolicy::default(),
            depends_on: vec![],
            dedupe_key: None,
            workflow_id: None,
            schedule_key: None,
            optional: false,
        }
    }

    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_depends_on(mut self, deps: Vec<Uuid>) -> Self {
        self.depends_on = deps;
        self
    }

    pub fn with_dedupe_key(mut self, key: impl Into<String>) -> Self {
        self.dedupe_key = Some(key.into());
        self
    }

    pub fn with_workflow_id(mut self, workflow_id: Uuid) -> Self {
        self.workflow_id = Some(workflow_id);
        self
    }

    pub fn with_schedule_key(mut self, key: impl Into<String>) -> Self {
        self.schedule_key = Some(key.into());
        self
    }

    pub fn with_optional(mut self, optional: bool) -> Self {
        self.optional = optional;
        self
    }
}

/// Result of a spawn call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnOutcome {
    /// A new row was inserted.
    Created(Uuid),
    /// An open task with the same dedupe key already existed.
    Deduplicated(Uuid),
}

impl SpawnOutcome {
    pub fn task_id(self) -> Uuid {
        match self {
            Self::Created(id) | Self::Deduplicated(id) => id,
        }
    }
}

/// A task handed to a worker by `claim`.
#[derive(Debug, Clone)]
pub struct ClaimedTask {
    pub id: Uuid,
    pub queue: String,
    pub name: String,
    pub params: serde_json::Value,
    /// Failures recorded so far; the current attempt is `attempts + 1`.
    pub attempts: u32,
    pub max_attempts: u32,
    pub depends_on: Vec<Uuid>,
    pub workflow_id: Option<Uuid>,
    pub optional: bool,
    pub claim_deadline: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Response to a heartbeat.
#[derive(Debug, Clone, Copy)]
pub struct HeartbeatAck {
    /// Cooperative cancellation was requested for this task.
    pub cancel_requested: bool,
}

/// Outcome of failing a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailOutcome {
    /// Requeued as `retrying`, eligible again at `wake_at`.
    WillRetry { attempts: u32, wake_at: DateTime<Utc> },
    /// Moved to the dead-letter terminal.
    Dead { attempts: u32 },
}

/// Full persisted task row.
#[derive(Debug, Clone)]
pub struct TaskRecord {
    pub id: Uuid,
    pub queue: String,
    pub name: String,
    pub params: serde_json::Value,
    pub priority: i32,
    pub state: TaskState,
    pub claimed_by: Option<String>,
    pub claim_deadline: Option<DateTime<Utc>>,
    pub wake_at: Option<DateTime<Utc>>,
    pub attempts: u32,
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub depends_on: Vec<Uuid>,
    pub workflow_id: Option<Uuid>,
    pub schedule_key: Option<String>,
    pub dedupe_key: Option<String>,
    pub optional: bool,
    pub cancel_requested: bool,
}

/// Counts by state for one queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub pending: u64,
    pub claimed: u64,
    pub retrying: u64,
    pub completed: u64,
    pub cancelled: u64,
    pub dead: u64,
}

impl QueueStats {
    pub fn total(&self) -> u64 {
        self.pending + self.claimed + self.retrying + self.completed + self.cancelled + self.dead
    }

    pub fn open(&self) -> u64 {
        self.pending + self.claimed + self.retrying
    }
}

/// Filter for task listings.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub queue: Option<String>,
    pub state: Option<TaskState>,
    pub workflow_id: Option<Uuid>,
    pub name: Option<String>,
    pub limit: Option<usize>,
}

// =============================================================================
// Ingest groups
// =============================================================================

/// Ingest group lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupState {
    Collecting,
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl GroupState {
    pub fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "collecting" => Ok(Self::Collecting),
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(StoreError::Database(format!("unknown group state: {s}"))),
        }
    }
}

impl std::fmt::Display for GroupState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Collecting => write!(f, "collecting"),
            Self::Pending => write!(f, "pending"),
            Self::InProgress => write!(f, "in_progress"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Timestamp format shared by group keys and subband filenames.
pub const GROUP_KEY_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Canonical group key for an observation timestamp.
pub fn group_key_for(at: DateTime<Utc>) -> String {
    at.format(GROUP_KEY_FORMAT).to_string()
}

/// Parse a group key back into its canonical timestamp.
pub fn parse_group_key(key: &str) -> Option<DateTime<Utc>> {
    chrono::NaiveDateTime::parse_from_str(key, GROUP_KEY_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

/// Persisted ingest group row.
#[derive(Debug, Clone)]
pub struct IngestGroup {
    pub group_key: String,
    pub canonical_at: DateTime<Utc>,
    pub state: GroupState,
    pub received_at: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
    pub expected_subbands: u16,
    pub present_bitmap: u64,
    pub semi_complete: bool,
    pub retry_count: u32,
    pub error: Option<String>,
}

impl IngestGroup {
    /// Number of distinct subbands recorded.
    pub fn present_count(&self) -> u16 {
        self.present_bitmap.count_ones() as u16
    }

    pub fn has_subband(&self, index: u16) -> bool {
        index < 64 && self.present_bitmap & (1 << index) != 0
    }

    pub fn present_indices(&self) -> Vec<u16> {
        (0..self.expected_subbands)
            .filter(|&i| self.has_subband(i))
            .collect()
    }

    pub fn missing_indices(&self) -> Vec<u16> {
        (0..self.expected_subbands)
            .filter(|&i| !self.has_subband(i))
            .collect()
    }
}

/// Result of resolving a raw timestamp to a canonical group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedGroup {
    pub group_key: String,
    /// True when this call created the group.
    pub created: bool,
}

/// Result of recording a subband on a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubbandOutcome {
    /// Bit newly set; `present` is the updated distinct count.
    Added { present: u16 },
    /// Index was already present; the event is ignored.
    Duplicate,
}

/// Group counts by state, for watermarks and dashboards.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GroupCounts {
    pub collecting: u64,
    pub pending: u64,
    pub in_progress: u64,
    pub completed: u64,
    pub failed: u64,
}

impl GroupCounts {
    /// Groups not yet handed to a workflow; the grouper's backpressure input.
    pub fn backlog(&self) -> u64 {
        self.collecting + self.pending
    }
}

/// Store for queue and ingest state.
///
/// Mutations are transactional at row granularity. Eligibility for `claim`:
/// state is `pending` or `retrying`, the wake time (if any) has passed, and
/// every dependency is `completed` (a dead *optional* dependency also
/// satisfies the edge). Selection order is `(priority desc, created_at asc)`,
/// ties broken by id.
#[async_trait]
pub trait QueueStore: Send + Sync + 'static {
    // =========================================================================
    // Task queue operations
    // =========================================================================

    /// Insert a task, or return the open task owning this dedupe key.
    async fn spawn(&self, spec: TaskSpec) -> Result<SpawnOutcome, StoreError>;

    /// Atomically select and claim at most one eligible task.
    async fn claim(
        &self,
        queue: &str,
        worker_id: &str,
        lease: Duration,
    ) -> Result<Option<ClaimedTask>, StoreError>;

    /// Extend a claim's deadline; errors with `NotOwner` when the lease was
    /// lost. Multiple heartbeats within a lease are equivalent to the last.
    async fn heartbeat(
        &self,
        task_id: Uuid,
        worker_id: &str,
        lease: Duration,
    ) -> Result<HeartbeatAck, StoreError>;

    /// Record successful completion with its result payload.
    async fn complete(
        &self,
        task_id: Uuid,
        worker_id: &str,
        result: serde_json::Value,
    ) -> Result<(), StoreError>;

    /// Record a failure; retries with backoff or routes to the dead letter.
    async fn fail(
        &self,
        task_id: Uuid,
        worker_id: &str,
        error: &str,
        retry: bool,
    ) -> Result<FailOutcome, StoreError>;

    /// Cancel a task. Pending/retrying tasks become `cancelled` immediately;
    /// claimed tasks get a cooperative cancel request surfaced via heartbeat.
    /// Returns false when the task was already terminal.
    async fn cancel(&self, task_id: Uuid) -> Result<bool, StoreError>;

    /// Terminal cancellation reported by the claim holder after it observed
    /// a cooperative cancel (or a timeout).
    async fn mark_cancelled(
        &self,
        task_id: Uuid,
        worker_id: &str,
        reason: &str,
    ) -> Result<(), StoreError>;

    /// Resurrect a dead task as `pending` with attempts reset.
    async fn replay(&self, task_id: Uuid) -> Result<(), StoreError>;

    /// Bulk-delete terminal tasks finished before the cutoff.
    async fn prune(
        &self,
        before: DateTime<Utc>,
        states: &[TaskState],
    ) -> Result<u64, StoreError>;

    /// Counts by state for one queue.
    async fn stats(&self, queue: &str) -> Result<QueueStats, StoreError>;

    /// Fetch one task row.
    async fn get_task(&self, task_id: Uuid) -> Result<TaskRecord, StoreError>;

    /// List task rows matching a filter, newest first.
    async fn list_tasks(&self, filter: TaskFilter) -> Result<Vec<TaskRecord>, StoreError>;

    /// Return expired claims to `pending`, preserving attempt counts.
    async fn reap_expired(&self) -> Result<Vec<Uuid>, StoreError>;

    /// Results of completed tasks, keyed by id (for context assembly).
    async fn results_for(
        &self,
        task_ids: &[Uuid],
    ) -> Result<HashMap<Uuid, serde_json::Value>, StoreError>;

    /// All tasks belonging to a workflow.
    async fn workflow_tasks(&self, workflow_id: Uuid) -> Result<Vec<TaskRecord>, StoreError>;

    /// Cancel every non-terminal task of a workflow; returns affected count.
    async fn cancel_workflow(&self, workflow_id: Uuid) -> Result<u64, StoreError>;

    /// Creation time of the oldest claim-eligible pending task, if any.
    async fn oldest_pending(&self, queue: &str) -> Result<Option<DateTime<Utc>>, StoreError>;

    // =========================================================================
    // Ingest group operations
    // =========================================================================

    /// Key of the group whose canonical time lies within ±`tolerance` of
    /// `raw_at`, if one exists. Never creates.
    async fn find_group_near(
        &self,
        raw_at: DateTime<Utc>,
        tolerance: Duration,
    ) -> Result<Option<String>, StoreError>;

    /// Find the group whose canonical time lies within ±`tolerance` of
    /// `raw_at`, or create one keyed by `raw_at`. First-committer wins races;
    /// the loser retries against the now-visible group.
    async fn resolve_group(
        &self,
        raw_at: DateTime<Utc>,
        tolerance: Duration,
        expected_subbands: u16,
    ) -> Result<ResolvedGroup, StoreError>;

    /// Set a subband bit on a group and bump `last_update`.
    async fn record_subband(
        &self,
        group_key: &str,
        subband: u16,
    ) -> Result<SubbandOutcome, StoreError>;

    /// Fetch one group row.
    async fn get_group(&self, group_key: &str) -> Result<IngestGroup, StoreError>;

    /// `collecting -> pending`; returns false when the CAS misses.
    async fn promote_group(&self, group_key: &str, semi_complete: bool)
        -> Result<bool, StoreError>;

    /// `pending -> in_progress`; returns false when the CAS misses.
    async fn start_group(&self, group_key: &str) -> Result<bool, StoreError>;

    /// `in_progress -> completed`; returns false when the CAS misses.
    async fn complete_group(&self, group_key: &str) -> Result<bool, StoreError>;

    /// Move a non-terminal group to `failed` with a reason.
    async fn fail_group(&self, group_key: &str, error: &str) -> Result<(), StoreError>;

    /// Operator retry: `failed -> pending`, bumping `retry_count`.
    async fn retry_group(&self, group_key: &str) -> Result<(), StoreError>;

    /// Collecting groups whose `last_update` is older than the cutoff.
    async fn stale_collecting(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<IngestGroup>, StoreError>;

    /// Group counts by state.
    async fn group_counts(&self) -> Result<GroupCounts, StoreError>;

    /// Operator purge; returns false when the group does not exist.
    async fn purge_group(&self, group_key: &str) -> Result<bool, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_state_round_trip() {
        for state in [
            TaskState::Pending,
            TaskState::Claimed,
            TaskState::Retrying,
            TaskState::Completed,
            TaskState::Cancelled,
            TaskState::Dead,
        ] {
            assert_eq!(TaskState::parse(&state.to_string()).unwrap(), state);
        }
        assert!(TaskState::parse("bogus").is_err());
    }

    #[test]
    fn terminal_states() {
        assert!(TaskState::Completed.is_terminal());
        assert!(TaskState::Cancelled.is_terminal());
        assert!(TaskState::Dead.is_terminal());
        assert!(!TaskState::Pending.is_terminal());
        assert!(!TaskState::Claimed.is_terminal());
        assert!(!TaskState::Retrying.is_terminal());
    }

    #[test]
    fn group_key_round_trip() {
        let at = chrono::NaiveDate::from_ymd_opt(2025, 8, 1)
            .unwrap()
            .and_hms_opt(12, 30, 5)
            .unwrap()
            .and_utc();

        let key = group_key_for(at);
        assert_eq!(key, "2025-08-01T12:30:05");
        assert_eq!(parse_group_key(&key), Some(at));
        assert_eq!(parse_group_key("not-a-key"), None);
    }

    #[test]
    fn bitmap_accessors() {
        let group = IngestGroup {
            group_key: "2025-08-01T12:30:05".into(),
            canonical_at: Utc::now(),
            state: GroupState::Collecting,
            received_at: Utc::now(),
            last_update: Utc::now(),
            expected_subbands: 16,
            present_bitmap: 0b1011,
            semi_complete: false,
            retry_count: 0,
            error: None,
        };

        assert_eq!(group.present_count(), 3);
        assert!(group.has_subband(0));
        assert!(!group.has_subband(2));
        assert_eq!(group.present_indices(), vec![0, 1, 3]);
        assert_eq!(group.missing_indices().len(), 13);
    }

    #[test]
    fn spawn_outcome_task_id() {
        let id = Uuid::now_v7();
        assert_eq!(SpawnOutcome::Created(id).task_id(), id);
        assert_eq!(SpawnOutcome::Deduplicated(id).task_id(), id);
    }
}
