//! Workflow runner
//!
//! Compiles a validated stage graph into queue tasks and reconstructs
//! workflow views from task state. There is no workflow table: tasks own an
//! id-reference to their workflow, and the workflow object is derived.

use std::collections::HashMap;

use tracing::{debug, info, instrument};
use uuid::Uuid;

use super::context::{Context, ContextError};
use super::graph::{GraphError, StageGraph};
use super::stage::{StageDef, StageEnvelope};
use crate::persistence::{
    ClaimedTask, SpawnOutcome, StoreError, TaskRecord, TaskSpec, TaskState,
};
use crate::queue::TaskQueue;

/// Workflow submission errors
#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    /// Graph validation failed
    #[error(transparent)]
    Graph(#[from] GraphError),

    /// A stage output shadows a root context key
    #[error("stage '{stage}' output '{key}' shadows a root context key")]
    RootCollision { stage: String, key: String },

    /// Stage envelope could not be serialized
    #[error("failed to encode stage envelope: {0}")]
    Encode(#[from] serde_json::Error),

    /// Store error
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Context assembly errors (worker side)
#[derive(Debug, thiserror::Error)]
pub enum AssemblyError {
    /// Task params did not contain a stage envelope
    #[error("task params are not a stage envelope: {0}")]
    Envelope(#[from] serde_json::Error),

    /// Predecessor output collided during the merge
    #[error(transparent)]
    Context(#[from] ContextError),

    /// Store error
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Derived workflow state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowState {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl std::fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Per-stage status inside a workflow view.
#[derive(Debug, Clone)]
pub struct StageStatus {
    pub stage: String,
    pub task_id: Uuid,
    pub state: TaskState,
    pub optional: bool,
    pub attempts: u32,
    pub error: Option<String>,
}

/// Reconstructed view of a workflow.
#[derive(Debug, Clone)]
pub struct WorkflowView {
    pub id: Uuid,
    pub name: String,
    pub state: WorkflowState,
    pub stages: Vec<StageStatus>,
}

/// Result of a submission.
#[derive(Debug, Clone)]
pub struct WorkflowSubmission {
    pub workflow_id: Uuid,
    /// Stage name to task id.
    pub task_ids: HashMap<String, Uuid>,
    /// True when an earlier submission with the same dedupe scope was found.
    pub deduplicated: bool,
}

/// Submits workflows and reconstructs their state.
#[derive(Clone)]
pub struct WorkflowRunner {
    queue: TaskQueue,
}

impl WorkflowRunner {
    pub fn new(queue: TaskQueue) -> Self {
        Self { queue }
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    /// Validate and submit a workflow.
    ///
    /// One task is inserted per stage, in topological order so dependency
    /// edges always reference existing rows. `dedupe_scope` defaults to the
    /// fresh workflow id; schedulers pass a deterministic scope so a double
    /// submission collapses onto the original tasks.
    #[instrument(skip(self, stages, context_root), fields(workflow = %workflow_name))]
    pub async fn submit(
        &self,
        queue_name: &str,
        workflow_name: &str,
        stages: Vec<StageDef>,
        context_root: Context,
        dedupe_scope: Option<String>,
    ) -> Result<WorkflowSubmission, SubmitError> {
        let graph = StageGraph::new(stages)?;

        for stage in graph.topo_order() {
            for key in &stage.outputs {
                if context_root.contains(key) {
                    return Err(SubmitError::RootCollision {
                        stage: stage.name.clone(),
                        key: key.clone(),
                    });
                }
            }
        }

        let workflow_id = Uuid::now_v7();
        let scope = dedupe_scope.unwrap_or_else(|| workflow_id.to_string());

        // Mint ids up front so depends_on can point at them before insert.
        let minted: HashMap<String, Uuid> = graph
            .topo_order()
            .map(|s| (s.name.clone(), Uuid::now_v7()))
            .collect();

        let mut task_ids: HashMap<String, Uuid> = HashMap::new();
        let mut deduplicated = false;
        let mut effective_workflow_id = workflow_id;

        for stage in graph.topo_order() {
            let envelope = StageEnvelope {
                workflow: workflow_name.to_string(),
                stage: stage.name.clone(),
                executor_ref: stage.executor_ref.clone(),
                optional: stage.optional,
                timeout_ms: stage.timeout.map(|t| t.as_millis() as u64),
                outputs: stage.outputs.clone(),
                context_root: context_root.clone(),
                config: stage.config.clone(),
            };

            // Predecessors were processed earlier in topological order, so
            // their effective ids are already recorded.
            let deps: Vec<Uuid> = stage.depends_on.iter().map(|d| task_ids[d]).collect();

            let spec = TaskSpec::new(
                queue_name,
                format!("{workflow_name}.{}", stage.name),
                envelope.to_params()?,
            )
            .with_id(minted[&stage.name])
            .with_depends_on(deps)
            .with_max_attempts(stage.retry.max_attempts)
            .with_backoff(stage.retry.backoff.clone())
            .with_dedupe_key(format!("{scope}.{}", stage.name))
            .with_workflow_id(workflow_id)
            .with_optional(stage.optional)
            .with_priority(stage.priority);

            match self.queue.spawn(spec).await? {
                SpawnOutcome::Created(id) => {
                    task_ids.insert(stage.name.clone(), id);
                }
                SpawnOutcome::Deduplicated(id) => {
                    // An earlier submission with this scope owns the stage;
                    // later edges must reference its task, not our mint.
                    deduplicated = true;
                    if let Ok(existing) = self.queue.get_task(id).await {
                        if let Some(owner) = existing.workflow_id {
                            effective_workflow_id = owner;
                        }
                    }
                    task_ids.insert(stage.name.clone(), id);
                }
            }
        }

        if deduplicated {
            debug!(%effective_workflow_id, "workflow submission deduplicated");
        } else {
            info!(%workflow_id, stages = graph.len(), "workflow submitted");
        }

        Ok(WorkflowSubmission {
            workflow_id: effective_workflow_id,
            task_ids,
            deduplicated,
        })
    }

    /// Reconstruct a workflow view from its tasks.
    pub async fn workflow(&self, workflow_id: Uuid) -> Result<WorkflowView, StoreError> {
        let tasks = self.queue.store().workflow_tasks(workflow_id).await?;
        if tasks.is_empty() {
            return Err(StoreError::WorkflowNotFound(workflow_id));
        }

        let name = workflow_name_of(&tasks);
        let state = derive_state(&tasks);
        let stages = tasks
            .iter()
            .map(|t| StageStatus {
                stage: stage_name_of(t),
                task_id: t.id,
                state: t.state,
                optional: t.optional,
                attempts: t.attempts,
                error: t.error.clone(),
            })
            .collect();

        Ok(WorkflowView {
            id: workflow_id,
            name,
            state,
            stages,
        })
    }

    /// Cancel a workflow's non-terminal tasks; completed tasks remain.
    pub async fn cancel(&self, workflow_id: Uuid) -> Result<u64, StoreError> {
        let cancelled = self.queue.store().cancel_workflow(workflow_id).await?;
        info!(%workflow_id, cancelled, "workflow cancelled");
        Ok(cancelled)
    }
}

/// Assemble the context a stage executor sees: the workflow's root context
/// merged with the outputs of every completed predecessor. A dead optional
/// predecessor simply contributes nothing.
pub async fn assemble_context(
    queue: &TaskQueue,
    task: &ClaimedTask,
) -> Result<(StageEnvelope, Context), AssemblyError> {
    let envelope = StageEnvelope::from_params(&task.params)?;

    let mut context = envelope.context_root.clone();
    let results = queue.results_for(&task.depends_on).await?;
    // Deterministic merge order keeps collision reports stable.
    let mut ordered: Vec<_> = results.into_iter().collect();
    ordered.sort_by_key(|(id, _)| *id);

    for (_, result) in ordered {
        if result.is_null() {
            continue;
        }
        let produced = Context::from_value(result)?;
        context = context.merged(&produced)?;
    }

    Ok((envelope, context))
}

fn stage_name_of(task: &TaskRecord) -> String {
    StageEnvelope::from_params(&task.params)
        .map(|e| e.stage)
        .unwrap_or_else(|_| task.name.clone())
}

fn workflow_name_of(tasks: &[TaskRecord]) -> String {
    tasks
        .first()
        .and_then(|t| StageEnvelope::from_params(&t.params).ok())
        .map(|e| e.workflow)
        .unwrap_or_default()
}

fn derive_state(tasks: &[TaskRecord]) -> WorkflowState {
    let failed = tasks
        .iter()
        .any(|t| t.state == TaskState::Dead && !t.optional);
    if failed {
        return WorkflowState::Failed;
    }

    let settled = |t: &TaskRecord| {
        t.state == TaskState::Completed || (t.optional && t.state == TaskState::Dead)
    };
    if tasks.iter().all(settled) {
        return WorkflowState::Completed;
    }

    if tasks.iter().any(|t| t.state == TaskState::Cancelled) {
        return WorkflowState::Cancelled;
    }

    if tasks.iter().all(|t| t.state == TaskState::Pending) {
        WorkflowState::Pending
    } else {
        WorkflowState::Running
    }
}

#[cfg(test)]
mod tests {
    use super::super::stage::StageRetry;
    use super::*;
    use crate::clock::ManualClock;
    use crate::metrics::InMemoryMetrics;
    use crate::persistence::InMemoryQueueStore;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    fn runner() -> (WorkflowRunner, TaskQueue) {
        let clock = Arc::new(ManualClock::default());
        let store = Arc::new(InMemoryQueueStore::with_clock(clock.clone()));
        let queue = TaskQueue::new(store, Arc::new(InMemoryMetrics::new()), clock);
        (WorkflowRunner::new(queue.clone()), queue)
    }

    fn pipeline() -> Vec<StageDef> {
        vec![
            StageDef::new("convert", "subband_convert").with_outputs(["ms_path"]),
            StageDef::new("solve", "solve_calibration")
                .depends_on(["convert"])
                .with_outputs(["gain_table"]),
            StageDef::new("image", "wsclean_image").depends_on(["solve"]),
        ]
    }

    #[tokio::test]
    async fn submit_inserts_one_task_per_stage() {
        let (runner, queue) = runner();

        let submission = runner
            .submit("imaging", "standard_imaging", pipeline(), Context::new(), None)
            .await
            .unwrap();

        assert_eq!(submission.task_ids.len(), 3);
        assert!(!submission.deduplicated);

        // Dependency edges reference the sibling tasks
        let image = queue
            .get_task(submission.task_ids["image"])
            .await
            .unwrap();
        assert_eq!(image.depends_on, vec![submission.task_ids["solve"]]);
        assert_eq!(image.name, "standard_imaging.image");
        assert_eq!(image.workflow_id, Some(submission.workflow_id));

        // Only the root stage is claimable
        let claimed = queue
            .claim("imaging", "w", Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.id, submission.task_ids["convert"]);
    }

    #[tokio::test]
    async fn submit_rejects_root_shadowing() {
        let (runner, _queue) = runner();
        let root = Context::new().with("ms_path", json!("/pre")).unwrap();

        let err = runner
            .submit("imaging", "standard_imaging", pipeline(), root, None)
            .await
            .unwrap_err();
        assert!(matches!(err, SubmitError::RootCollision { .. }));
    }

    #[tokio::test]
    async fn deterministic_scope_collapses_double_submission() {
        let (runner, _queue) = runner();

        let first = runner
            .submit(
                "imaging",
                "standard_imaging",
                pipeline(),
                Context::new(),
                Some("trigger@t0".into()),
            )
            .await
            .unwrap();
        let second = runner
            .submit(
                "imaging",
                "standard_imaging",
                pipeline(),
                Context::new(),
                Some("trigger@t0".into()),
            )
            .await
            .unwrap();

        assert!(second.deduplicated);
        assert_eq!(first.workflow_id, second.workflow_id);
        assert_eq!(first.task_ids, second.task_ids);
    }

    #[tokio::test]
    async fn context_flows_to_successors() {
        let (runner, queue) = runner();
        let root = Context::new().with("group_key", json!("t0")).unwrap();

        let submission = runner
            .submit("imaging", "wf", pipeline(), root, None)
            .await
            .unwrap();

        // Run convert, producing ms_path
        let convert = queue
            .claim("imaging", "w", Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();
        queue
            .complete(
                &convert,
                "w",
                json!({"ms_path": "/data/t0.ms"}),
                Duration::ZERO,
            )
            .await
            .unwrap();

        // Solve sees root + convert's output
        let solve = queue
            .claim("imaging", "w", Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(solve.id, submission.task_ids["solve"]);
        let (envelope, context) = assemble_context(&queue, &solve).await.unwrap();
        assert_eq!(envelope.stage, "solve");
        assert_eq!(context.get("group_key"), Some(&json!("t0")));
        assert_eq!(context.get("ms_path"), Some(&json!("/data/t0.ms")));
    }

    #[tokio::test]
    async fn workflow_view_tracks_task_states() {
        let (runner, queue) = runner();

        let submission = runner
            .submit("imaging", "wf", pipeline(), Context::new(), None)
            .await
            .unwrap();

        let view = runner.workflow(submission.workflow_id).await.unwrap();
        assert_eq!(view.state, WorkflowState::Pending);
        assert_eq!(view.name, "wf");
        assert_eq!(view.stages.len(), 3);

        let convert = queue
            .claim("imaging", "w", Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();
        let view = runner.workflow(submission.workflow_id).await.unwrap();
        assert_eq!(view.state, WorkflowState::Running);

        queue
            .complete(&convert, "w", json!({}), Duration::ZERO)
            .await
            .unwrap();

        // Drive the remaining stages to completion
        for _ in 0..2 {
            let task = queue
                .claim("imaging", "w", Duration::from_secs(60))
                .await
                .unwrap()
                .unwrap();
            queue
                .complete(&task, "w", json!({}), Duration::ZERO)
                .await
                .unwrap();
        }

        let view = runner.workflow(submission.workflow_id).await.unwrap();
        assert_eq!(view.state, WorkflowState::Completed);
    }

    #[tokio::test]
    async fn non_optional_dead_stage_fails_workflow() {
        let (runner, queue) = runner();
        let stages = vec![
            StageDef::new("a", "a").with_retry(StageRetry::none()),
            StageDef::new("b", "b").depends_on(["a"]),
        ];

        let submission = runner
            .submit("q", "wf", stages, Context::new(), None)
            .await
            .unwrap();

        let task = queue
            .claim("q", "w", Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();
        queue.fail(&task, "w", "fatal", true).await.unwrap();

        let view = runner.workflow(submission.workflow_id).await.unwrap();
        assert_eq!(view.state, WorkflowState::Failed);

        // Downstream was cancelled
        let b = queue.get_task(submission.task_ids["b"]).await.unwrap();
        assert_eq!(b.state, TaskState::Cancelled);
    }

    #[tokio::test]
    async fn optional_dead_stage_leaves_workflow_completable() {
        let (runner, queue) = runner();
        let stages = vec![
            StageDef::new("photometry", "photometry")
                .with_retry(StageRetry::none())
                .optional()
                .with_outputs(["fluxes"]),
            StageDef::new("report", "report").depends_on(["photometry"]),
        ];

        let submission = runner
            .submit("q", "wf", stages, Context::new(), None)
            .await
            .unwrap();

        let task = queue
            .claim("q", "w", Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();
        queue.fail(&task, "w", "no sources", true).await.unwrap();

        // Successor runs with the key missing
        let report = queue
            .claim("q", "w", Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();
        let (_, context) = assemble_context(&queue, &report).await.unwrap();
        assert!(context.get("fluxes").is_none());
        queue
            .complete(&report, "w", json!({}), Duration::ZERO)
            .await
            .unwrap();

        let view = runner.workflow(submission.workflow_id).await.unwrap();
        assert_eq!(view.state, WorkflowState::Completed);
    }

    #[tokio::test]
    async fn cancel_leaves_completed_stages() {
        let (runner, queue) = runner();

        let submission = runner
            .submit("q", "wf", pipeline(), Context::new(), None)
            .await
            .unwrap();

        let convert = queue
            .claim("q", "w", Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();
        queue
            .complete(&convert, "w", json!({}), Duration::ZERO)
            .await
            .unwrap();

        runner.cancel(submission.workflow_id).await.unwrap();

        let view = runner.workflow(submission.workflow_id).await.unwrap();
        assert_eq!(view.state, WorkflowState::Cancelled);
        let convert_record = queue
            .get_task(submission.task_ids["convert"])
            .await
            .unwrap();
        assert_eq!(convert_record.state, TaskState::Completed);
    }
}
