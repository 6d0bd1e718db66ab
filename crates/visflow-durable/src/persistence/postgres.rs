//! PostgreSQL implementation of QueueStore
//!
//! Production persistence with:
//! - Atomic task claiming via `FOR UPDATE SKIP LOCKED`
//! - Spawn deduplication via a partial unique index
//! - Lease and wake comparisons against the database clock, so workers on
//!   different hosts agree on time

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::{debug, error, instrument};
use uuid::Uuid;

use super::store::*;
use crate::reliability::BackoffPolicy;

/// Embedded schema migrations.
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!();

/// PostgreSQL implementation of [`QueueStore`].
///
/// # Example
///
/// ```ignore
/// use visflow_durable::persistence::PostgresQueueStore;
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://localhost/visflow").await?;
/// let store = PostgresQueueStore::new(pool);
/// store.migrate().await?;
/// ```
#[derive(Clone)]
pub struct PostgresQueueStore {
    pool: PgPool,
}

impl PostgresQueueStore {
    /// Create a store over an existing connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply embedded migrations.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        MIGRATOR
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))
    }
}

fn db_err(e: sqlx::Error) -> StoreError {
    StoreError::Database(e.to_string())
}

fn task_from_row(row: &PgRow) -> Result<TaskRecord, StoreError> {
    let state: String = row.get("state");
    let backoff_json: serde_json::Value = row.get("backoff");
    let backoff: BackoffPolicy = serde_json::from_value(backoff_json)
        .map_err(|e| StoreError::Serialization(e.to_string()))?;

    Ok(TaskRecord {
        id: row.get("id"),
        queue: row.get("queue"),
        name: row.get("name"),
        params: row.get("params"),
        priority: row.get("priority"),
        state: TaskState::parse(&state)?,
        claimed_by: row.get("claimed_by"),
        claim_deadline: row.get("claim_deadline"),
        wake_at: row.get("wake_at"),
        attempts: row.get::<i32, _>("attempts") as u32,
        max_attempts: row.get::<i32, _>("max_attempts") as u32,
        backoff,
        result: row.get("result"),
        error: row.get("error"),
        created_at: row.get("created_at"),
        started_at: row.get("started_at"),
        finished_at: row.get("finished_at"),
        depends_on: row.get("depends_on"),
        workflow_id: row.get("workflow_id"),
        schedule_key: row.get("schedule_key"),
        dedupe_key: row.get("dedupe_key"),
        optional: row.get("optional"),
        cancel_requested: row.get("cancel_requested"),
    })
}

fn group_from_row(row: &PgRow) -> Result<IngestGroup, StoreError> {
    let state: String = row.get("state");
    Ok(IngestGroup {
        group_key: row.get("group_key"),
        canonical_at: row.get("canonical_at"),
        state: GroupState::parse(&state)?,
        received_at: row.get("received_at"),
        last_update: row.get("last_update"),
        expected_subbands: row.get::<i32, _>("expected_subbands") as u16,
        present_bitmap: row.get::<i64, _>("present_bitmap") as u64,
        semi_complete: row.get("semi_complete"),
        retry_count: row.get::<i32, _>("retry_count") as u32,
        error: row.get("error"),
    })
}

const TASK_COLUMNS: &str = "id, queue, name, params, priority, state, claimed_by, \
     claim_deadline, wake_at, attempts, max_attempts, backoff, result, error, \
     created_at, started_at, finished_at, depends_on, workflow_id, schedule_key, \
     dedupe_key, optional, cancel_requested";

const GROUP_COLUMNS: &str = "group_key, canonical_at, state, received_at, last_update, \
     expected_subbands, present_bitmap, semi_complete, retry_count, error";

#[async_trait]
impl QueueStore for PostgresQueueStore {
    #[instrument(skip(self, spec), fields(queue = %spec.queue, name = %spec.name))]
    async fn spawn(&self, spec: TaskSpec) -> Result<SpawnOutcome, StoreError> {
        let id = spec.id.unwrap_or_else(Uuid::now_v7);
        let backoff_json = serde_json::to_value(&spec.backoff)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO vf_tasks (
                id, queue, name, params, priority, max_attempts, backoff,
                depends_on, workflow_id, schedule_key, dedupe_key, optional
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (queue, name, dedupe_key)
                WHERE dedupe_key IS NOT NULL AND state IN ('pending', 'claimed', 'retrying')
                DO NOTHING
            RETURNING id
            "#,
        )
        .bind(id)
        .bind(&spec.queue)
        .bind(&spec.name)
        .bind(&spec.params)
        .bind(spec.priority)
        .bind(spec.max_attempts as i32)
        .bind(&backoff_json)
        .bind(&spec.depends_on)
        .bind(spec.workflow_id)
        .bind(&spec.schedule_key)
        .bind(&spec.dedupe_key)
        .bind(spec.optional)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to spawn task: {}", e);
            db_err(e)
        })?;

        if inserted.is_some() {
            debug!(%id, "spawned task");
            return Ok(SpawnOutcome::Created(id));
        }

        // Dedupe conflict: return the open task that owns the key.
        let dedupe_key = spec
            .dedupe_key
            .as_deref()
            .expect("conflict implies a dedupe key");
        let row = sqlx::query(
            r#"
            SELECT id FROM vf_tasks
            WHERE queue = $1 AND name = $2 AND dedupe_key = $3
              AND state IN ('pending', 'claimed', 'retrying')
            "#,
        )
        .bind(&spec.queue)
        .bind(&spec.name)
        .bind(dedupe_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .ok_or_else(|| {
            // The open task completed between the insert and this read.
            StoreError::Conflict(format!("dedupe key {dedupe_key} vanished; retry spawn"))
        })?;

        debug!(existing = %row.get::<Uuid, _>("id"), "spawn deduplicated");
        Ok(SpawnOutcome::Deduplicated(row.get("id")))
    }

    #[instrument(skip(self))]
    async fn claim(
        &self,
        queue: &str,
        worker_id: &str,
        lease: Duration,
    ) -> Result<Option<ClaimedTask>, StoreError> {
        // Single atomic select-and-update:
        // 1. Finds the best eligible task (state, wake time, dependencies)
        // 2. Locks it with SKIP LOCKED so concurrent claimers never collide
        // 3. Marks it claimed with a fresh lease deadline
        let row = sqlx::query(
            r#"
            WITH claimable AS (
                SELECT t.id
                FROM vf_tasks t
                WHERE t.queue = $1
                  AND t.state IN ('pending', 'retrying')
                  AND (t.wake_at IS NULL OR t.wake_at <= NOW())
                  AND NOT EXISTS (
                      SELECT 1
                      FROM unnest(t.depends_on) AS dep_id
                      LEFT JOIN vf_tasks d ON d.id = dep_id
                      WHERE d.id IS NULL
                         OR (d.state <> 'completed'
                             AND NOT (d.optional AND d.state = 'dead'))
                  )
                ORDER BY t.priority DESC, t.created_at, t.id
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE vf_tasks t
            SET state = 'claimed',
                claimed_by = $2,
                claim_deadline = NOW() + make_interval(secs => $3),
                started_at = COALESCE(t.started_at, NOW())
            FROM claimable c
            WHERE t.id = c.id
            RETURNING t.id, t.queue, t.name, t.params, t.attempts, t.max_attempts,
                      t.depends_on, t.workflow_id, t.optional, t.claim_deadline, t.created_at
            "#,
        )
        .bind(queue)
        .bind(worker_id)
        .bind(lease.as_secs_f64())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to claim task: {}", e);
            db_err(e)
        })?;

        let Some(row) = row else {
            return Ok(None);
        };

        let task = ClaimedTask {
            id: row.get("id"),
            queue: row.get("queue"),
            name: row.get("name"),
            params: row.get("params"),
            attempts: row.get::<i32, _>("attempts") as u32,
            max_attempts: row.get::<i32, _>("max_attempts") as u32,
            depends_on: row.get("depends_on"),
            workflow_id: row.get("workflow_id"),
            optional: row.get("optional"),
            claim_deadline: row.get("claim_deadline"),
            created_at: row.get("created_at"),
        };
        debug!(task_id = %task.id, worker_id, "claimed task");
        Ok(Some(task))
    }

    #[instrument(skip(self))]
    async fn heartbeat(
        &self,
        task_id: Uuid,
        worker_id: &str,
        lease: Duration,
    ) -> Result<HeartbeatAck, StoreError> {
        let row = sqlx::query(
            r#"
            UPDATE vf_tasks
            SET claim_deadline = NOW() + make_interval(secs => $3)
            WHERE id = $1 AND claimed_by = $2 AND state = 'claimed'
            RETURNING cancel_requested
            "#,
        )
        .bind(task_id)
        .bind(worker_id)
        .bind(lease.as_secs_f64())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        match row {
            Some(row) => Ok(HeartbeatAck {
                cancel_requested: row.get("cancel_requested"),
            }),
            None => Err(StoreError::NotOwner {
                task_id,
                worker_id: worker_id.to_string(),
            }),
        }
    }

    #[instrument(skip(self, result))]
    async fn complete(
        &self,
        task_id: Uuid,
        worker_id: &str,
        result: serde_json::Value,
    ) -> Result<(), StoreError> {
        let updated = sqlx::query(
            r#"
            UPDATE vf_tasks
            SET state = 'completed',
                result = $3,
                claimed_by = NULL,
                claim_deadline = NULL,
                finished_at = NOW()
            WHERE id = $1 AND claimed_by = $2 AND state = 'claimed'
            "#,
        )
        .bind(task_id)
        .bind(worker_id)
        .bind(&result)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if updated.rows_affected() > 0 {
            debug!(%task_id, "completed task");
            return Ok(());
        }

        // Re-delivered completion for an already-completed task is a no-op;
        // anything else lost its claim to the reaper.
        let state: Option<String> =
            sqlx::query_scalar("SELECT state FROM vf_tasks WHERE id = $1")
                .bind(task_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(db_err)?;

        match state.as_deref() {
            None => Err(StoreError::TaskNotFound(task_id)),
            Some("completed") => Ok(()),
            Some(_) => Err(StoreError::NotOwner {
                task_id,
                worker_id: worker_id.to_string(),
            }),
        }
    }

    #[instrument(skip(self))]
    async fn fail(
        &self,
        task_id: Uuid,
        worker_id: &str,
        error: &str,
        retry: bool,
    ) -> Result<FailOutcome, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let row = sqlx::query(
            r#"
            SELECT attempts, max_attempts, backoff
            FROM vf_tasks
            WHERE id = $1 AND claimed_by = $2 AND state = 'claimed'
            FOR UPDATE
            "#,
        )
        .bind(task_id)
        .bind(worker_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?
        .ok_or_else(|| StoreError::NotOwner {
            task_id,
            worker_id: worker_id.to_string(),
        })?;

        let attempts = row.get::<i32, _>("attempts") as u32 + 1;
        let max_attempts = row.get::<i32, _>("max_attempts") as u32;
        let backoff: BackoffPolicy = serde_json::from_value(row.get("backoff"))
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        let outcome = if !retry || attempts >= max_attempts {
            sqlx::query(
                r#"
                UPDATE vf_tasks
                SET state = 'dead',
                    attempts = $2,
                    error = $3,
                    claimed_by = NULL,
                    claim_deadline = NULL,
                    finished_at = NOW()
                WHERE id = $1
                "#,
            )
            .bind(task_id)
            .bind(attempts as i32)
            .bind(error)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

            debug!(%task_id, attempts, "task moved to dead letter");
            FailOutcome::Dead { attempts }
        } else {
            let delay = backoff.delay_for_attempt(attempts);
            let wake_at: DateTime<Utc> = sqlx::query_scalar(
                r#"
                UPDATE vf_tasks
                SET state = 'retrying',
                    attempts = $2,
                    error = $3,
                    claimed_by = NULL,
                    claim_deadline = NULL,
                    wake_at = NOW() + make_interval(secs => $4)
                WHERE id = $1
                RETURNING wake_at
                "#,
            )
            .bind(task_id)
            .bind(attempts as i32)
            .bind(error)
            .bind(delay.as_secs_f64())
            .fetch_one(&mut *tx)
            .await
            .map_err(db_err)?;

            debug!(%task_id, attempts, %wake_at, "task will retry");
            FailOutcome::WillRetry { attempts, wake_at }
        };

        tx.commit().await.map_err(db_err)?;
        Ok(outcome)
    }

    #[instrument(skip(self))]
    async fn cancel(&self, task_id: Uuid) -> Result<bool, StoreError> {
        let updated = sqlx::query(
            r#"
            UPDATE vf_tasks
            SET state = CASE WHEN state IN ('pending', 'retrying') THEN 'cancelled' ELSE state END,
                cancel_requested = CASE WHEN state = 'claimed' THEN TRUE ELSE cancel_requested END,
                finished_at = CASE WHEN state IN ('pending', 'retrying') THEN NOW() ELSE finished_at END
            WHERE id = $1 AND state IN ('pending', 'retrying', 'claimed')
            "#,
        )
        .bind(task_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if updated.rows_affected() > 0 {
            debug!(%task_id, "cancel recorded");
            return Ok(true);
        }

        let exists: Option<i32> = sqlx::query_scalar("SELECT 1 FROM vf_tasks WHERE id = $1")
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        match exists {
            Some(_) => Ok(false),
            None => Err(StoreError::TaskNotFound(task_id)),
        }
    }

    #[instrument(skip(self))]
    async fn mark_cancelled(
        &self,
        task_id: Uuid,
        worker_id: &str,
        reason: &str,
    ) -> Result<(), StoreError> {
        let updated = sqlx::query(
            r#"
            UPDATE vf_tasks
            SET state = 'cancelled',
                error = $3,
                claimed_by = NULL,
                claim_deadline = NULL,
                finished_at = NOW()
            WHERE id = $1 AND claimed_by = $2 AND state = 'claimed'
            "#,
        )
        .bind(task_id)
        .bind(worker_id)
        .bind(reason)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if updated.rows_affected() > 0 {
            debug!(%task_id, "task cancelled by claim holder");
            return Ok(());
        }
        Err(StoreError::NotOwner {
            task_id,
            worker_id: worker_id.to_string(),
        })
    }

    #[instrument(skip(self))]
    async fn replay(&self, task_id: Uuid) -> Result<(), StoreError> {
        let updated = sqlx::query(
            r#"
            UPDATE vf_tasks
            SET state = 'pending',
                attempts = 0,
                wake_at = NULL,
                error = NULL,
                finished_at = NULL,
                cancel_requested = FALSE
            WHERE id = $1 AND state = 'dead'
            "#,
        )
        .bind(task_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if updated.rows_affected() > 0 {
            debug!(%task_id, "replayed dead task");
            return Ok(());
        }

        let exists: Option<i32> = sqlx::query_scalar("SELECT 1 FROM vf_tasks WHERE id = $1")
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        match exists {
            Some(_) => Err(StoreError::NotDead(task_id)),
            None => Err(StoreError::TaskNotFound(task_id)),
        }
    }

    #[instrument(skip(self))]
    async fn prune(
        &self,
        before: DateTime<Utc>,
        states: &[TaskState],
    ) -> Result<u64, StoreError> {
        let states: Vec<String> = states
            .iter()
            .filter(|s| s.is_terminal())
            .map(|s| s.to_string())
            .collect();

        let deleted = sqlx::query(
            r#"
            DELETE FROM vf_tasks
            WHERE state = ANY($1)
              AND COALESCE(finished_at, created_at) < $2
            "#,
        )
        .bind(&states)
        .bind(before)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(deleted.rows_affected())
    }

    #[instrument(skip(self))]
    async fn stats(&self, queue: &str) -> Result<QueueStats, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT state, COUNT(*) AS n
            FROM vf_tasks
            WHERE queue = $1
            GROUP BY state
            "#,
        )
        .bind(queue)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        let mut stats = QueueStats::default();
        for row in rows {
            let n = row.get::<i64, _>("n") as u64;
            match TaskState::parse(row.get("state"))? {
                TaskState::Pending => stats.pending = n,
                TaskState::Claimed => stats.claimed = n,
                TaskState::Retrying => stats.retrying = n,
                TaskState::Completed => stats.completed = n,
                TaskState::Cancelled => stats.cancelled = n,
                TaskState::Dead => stats.dead = n,
            }
        }
        Ok(stats)
    }

    #[instrument(skip(self))]
    async fn get_task(&self, task_id: Uuid) -> Result<TaskRecord, StoreError> {
        let row = sqlx::query(&format!("SELECT {TASK_COLUMNS} FROM vf_tasks WHERE id = $1"))
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .ok_or(StoreError::TaskNotFound(task_id))?;

        task_from_row(&row)
    }

    #[instrument(skip(self))]
    async fn list_tasks(&self, filter: TaskFilter) -> Result<Vec<TaskRecord>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {TASK_COLUMNS} FROM vf_tasks
            WHERE ($1::text IS NULL OR queue = $1)
              AND ($2::text IS NULL OR state = $2)
              AND ($3::uuid IS NULL OR workflow_id = $3)
              AND ($4::text IS NULL OR name = $4)
            ORDER BY created_at DESC, id DESC
            LIMIT $5
            "#
        ))
        .bind(&filter.queue)
        .bind(filter.state.map(|s| s.to_string()))
        .bind(filter.workflow_id)
        .bind(&filter.name)
        .bind(filter.limit.unwrap_or(100) as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter().map(task_from_row).collect()
    }

    #[instrument(skip(self))]
    async fn reap_expired(&self) -> Result<Vec<Uuid>, StoreError> {
        let rows = sqlx::query(
            r#"
            UPDATE vf_tasks
            SET state = CASE WHEN cancel_requested THEN 'cancelled' ELSE 'pending' END,
                finished_at = CASE WHEN cancel_requested THEN NOW() ELSE finished_at END,
                claimed_by = NULL,
                claim_deadline = NULL
            WHERE state = 'claimed' AND claim_deadline < NOW()
            RETURNING id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to reap expired claims: {}", e);
            db_err(e)
        })?;

        let reaped: Vec<Uuid> = rows.iter().map(|r| r.get("id")).collect();
        if !reaped.is_empty() {
            debug!(count = reaped.len(), "reaped expired claims");
        }
        Ok(reaped)
    }

    #[instrument(skip(self, task_ids))]
    async fn results_for(
        &self,
        task_ids: &[Uuid],
    ) -> Result<HashMap<Uuid, serde_json::Value>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, result FROM vf_tasks
            WHERE id = ANY($1) AND state = 'completed' AND result IS NOT NULL
            "#,
        )
        .bind(task_ids)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(rows
            .into_iter()
            .map(|row| (row.get("id"), row.get("result")))
            .collect())
    }

    #[instrument(skip(self))]
    async fn workflow_tasks(&self, workflow_id: Uuid) -> Result<Vec<TaskRecord>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {TASK_COLUMNS} FROM vf_tasks
            WHERE workflow_id = $1
            ORDER BY created_at, id
            "#
        ))
        .bind(workflow_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter().map(task_from_row).collect()
    }

    #[instrument(skip(self))]
    async fn cancel_workflow(&self, workflow_id: Uuid) -> Result<u64, StoreError> {
        let updated = sqlx::query(
            r#"
            UPDATE vf_tasks
            SET state = CASE WHEN state IN ('pending', 'retrying') THEN 'cancelled' ELSE state END,
                cancel_requested = CASE WHEN state = 'claimed' THEN TRUE ELSE cancel_requested END,
                finished_at = CASE WHEN state IN ('pending', 'retrying') THEN NOW() ELSE finished_at END
            WHERE workflow_id = $1 AND state IN ('pending', 'retrying', 'claimed')
            "#,
        )
        .bind(workflow_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        debug!(%workflow_id, count = updated.rows_affected(), "workflow cancel recorded");
        Ok(updated.rows_affected())
    }

    #[instrument(skip(self))]
    async fn oldest_pending(&self, queue: &str) -> Result<Option<DateTime<Utc>>, StoreError> {
        sqlx::query_scalar(
            r#"
            SELECT MIN(created_at) FROM vf_tasks
            WHERE queue = $1 AND state = 'pending'
            "#,
        )
        .bind(queue)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)
    }

    // =========================================================================
    // Ingest groups
    // =========================================================================

    #[instrument(skip(self))]
    async fn find_group_near(
        &self,
        raw_at: DateTime<Utc>,
        tolerance: Duration,
    ) -> Result<Option<String>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT group_key FROM vf_ingest_queue
            WHERE canonical_at BETWEEN $1 - make_interval(secs => $2)
                                   AND $1 + make_interval(secs => $2)
            ORDER BY ABS(EXTRACT(EPOCH FROM (canonical_at - $1)))
            LIMIT 1
            "#,
        )
        .bind(raw_at)
        .bind(tolerance.as_secs_f64())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(row.map(|r| r.get("group_key")))
    }

    #[instrument(skip(self))]
    async fn resolve_group(
        &self,
        raw_at: DateTime<Utc>,
        tolerance: Duration,
        expected_subbands: u16,
    ) -> Result<ResolvedGroup, StoreError> {
        // First-committer wins: a concurrent create for the same key hits the
        // primary key, and the loser retries against the now-visible row.
        for _ in 0..2 {
            if let Some(group_key) = self.find_group_near(raw_at, tolerance).await? {
                return Ok(ResolvedGroup {
                    group_key,
                    created: false,
                });
            }

            let group_key = group_key_for(raw_at);
            let inserted = sqlx::query(
                r#"
                INSERT INTO vf_ingest_queue (group_key, canonical_at, expected_subbands)
                VALUES ($1, $2, $3)
                "#,
            )
            .bind(&group_key)
            .bind(raw_at)
            .bind(expected_subbands as i32)
            .execute(&self.pool)
            .await;

            match inserted {
                Ok(_) => {
                    debug!(%group_key, "created ingest group");
                    return Ok(ResolvedGroup {
                        group_key,
                        created: true,
                    });
                }
                Err(e)
                    if e.as_database_error()
                        .map(|d| d.is_unique_violation())
                        .unwrap_or(false) =>
                {
                    // Lost the race; loop to adopt the winner's group.
                    continue;
                }
                Err(e) => return Err(db_err(e)),
            }
        }

        Err(StoreError::Conflict(
            "group canonicalization did not converge".into(),
        ))
    }

    #[instrument(skip(self))]
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

        let row = sqlx::query(
            r#"
            UPDATE vf_ingest_queue
            SET present_bitmap = present_bitmap | (1::BIGINT << $2),
                last_update = NOW()
            WHERE group_key = $1
              AND present_bitmap & (1::BIGINT << $2) = 0
            RETURNING present_bitmap
            "#,
        )
        .bind(group_key)
        .bind(subband as i32)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        if let Some(row) = row {
            let bitmap = row.get::<i64, _>("present_bitmap") as u64;
            return Ok(SubbandOutcome::Added {
                present: bitmap.count_ones() as u16,
            });
        }

        // Either a duplicate index or a missing group.
        let exists: Option<i32> =
            sqlx::query_scalar("SELECT 1 FROM vf_ingest_queue WHERE group_key = $1")
                .bind(group_key)
                .fetch_optional(&self.pool)
                .await
                .map_err(db_err)?;
        match exists {
            Some(_) => Ok(SubbandOutcome::Duplicate),
            None => Err(StoreError::GroupNotFound(group_key.to_string())),
        }
    }

    #[instrument(skip(self))]
    async fn get_group(&self, group_key: &str) -> Result<IngestGroup, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {GROUP_COLUMNS} FROM vf_ingest_queue WHERE group_key = $1"
        ))
        .bind(group_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .ok_or_else(|| StoreError::GroupNotFound(group_key.to_string()))?;

        group_from_row(&row)
    }

    #[instrument(skip(self))]
    async fn promote_group(
        &self,
        group_key: &str,
        semi_complete: bool,
    ) -> Result<bool, StoreError> {
        let updated = sqlx::query(
            r#"
            UPDATE vf_ingest_queue
            SET state = 'pending', semi_complete = $2, last_update = NOW()
            WHERE group_key = $1 AND state = 'collecting'
            "#,
        )
        .bind(group_key)
        .bind(semi_complete)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(updated.rows_affected() > 0)
    }

    #[instrument(skip(self))]
    async fn start_group(&self, group_key: &str) -> Result<bool, StoreError> {
        let updated = sqlx::query(
            r#"
            UPDATE vf_ingest_queue
            SET state = 'in_progress', last_update = NOW()
            WHERE group_key = $1 AND state = 'pending'
            "#,
        )
        .bind(group_key)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(updated.rows_affected() > 0)
    }

    #[instrument(skip(self))]
    async fn complete_group(&self, group_key: &str) -> Result<bool, StoreError> {
        let updated = sqlx::query(
            r#"
            UPDATE vf_ingest_queue
            SET state = 'completed', last_update = NOW()
            WHERE group_key = $1 AND state = 'in_progress'
            "#,
        )
        .bind(group_key)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(updated.rows_affected() > 0)
    }

    #[instrument(skip(self))]
    async fn fail_group(&self, group_key: &str, error: &str) -> Result<(), StoreError> {
        let updated = sqlx::query(
            r#"
            UPDATE vf_ingest_queue
            SET state = 'failed', error = $2, last_update = NOW()
            WHERE group_key = $1 AND state <> 'completed'
            "#,
        )
        .bind(group_key)
        .bind(error)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if updated.rows_affected() > 0 {
            return Ok(());
        }

        match self.get_group(group_key).await {
            Ok(group) => Err(StoreError::InvalidTransition {
                group_key: group_key.to_string(),
                from: group.state,
                to: GroupState::Failed,
            }),
            Err(e) => Err(e),
        }
    }

    #[instrument(skip(self))]
    async fn retry_group(&self, group_key: &str) -> Result<(), StoreError> {
        let updated = sqlx::query(
            r#"
            UPDATE vf_ingest_queue
            SET state = 'pending',
                retry_count = retry_count + 1,
                error = NULL,
                last_update = NOW()
            WHERE group_key = $1 AND state = 'failed'
            "#,
        )
        .bind(group_key)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if updated.rows_affected() > 0 {
            return Ok(());
        }

        match self.get_group(group_key).await {
            Ok(group) => Err(StoreError::InvalidTransition {
                group_key: group_key.to_string(),
                from: group.state,
                to: GroupState::Pending,
            }),
            Err(e) => Err(e),
        }
    }

    #[instrument(skip(self))]
    async fn stale_collecting(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<IngestGroup>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {GROUP_COLUMNS} FROM vf_ingest_queue
            WHERE state = 'collecting' AND last_update < $1
            ORDER BY last_update
            "#
        ))
        .bind(older_than)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter().map(group_from_row).collect()
    }

    #[instrument(skip(self))]
    async fn group_counts(&self) -> Result<GroupCounts, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT state, COUNT(*) AS n
            FROM vf_ingest_queue
            GROUP BY state
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        let mut counts = GroupCounts::default();
        for row in rows {
            let n = row.get::<i64, _>("n") as u64;
            match GroupState::parse(row.get("state"))? {
                GroupState::Collecting => counts.collecting = n,
                GroupState::Pending => counts.pending = n,
                GroupState::InProgress => counts.in_progress = n,
                GroupState::Completed => counts.completed = n,
                GroupState::Failed => counts.failed = n,
            }
        }
        Ok(counts)
    }

    #[instrument(skip(self))]
    async fn purge_group(&self, group_key: &str) -> Result<bool, StoreError> {
        let deleted = sqlx::query("DELETE FROM vf_ingest_queue WHERE group_key = $1")
            .bind(group_key)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;

        Ok(deleted.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    // Integration tests require PostgreSQL; see tests/postgres_integration_test.rs
}
