//! # Durable Coordination Core
//!
//! A PostgreSQL-backed ingest and workflow coordination engine for a
//! continuum imaging pipeline: a persistent task queue with leases and
//! crash recovery, stage-graph workflows with append-only context
//! propagation, circuit breakers, and cron/event scheduling.
//!
//! ## Features
//!
//! - **Persistent task queue**: at most one concurrent execution per task,
//!   enforced by atomic claims with time-bounded leases
//! - **Automatic retries**: per-task exponential backoff with jitter; retries
//!   exhausted land in an inspectable dead-letter state
//! - **Crash recovery**: heartbeats extend leases; a reaper returns expired
//!   claims to the queue with attempt counts intact
//! - **Stage graphs**: DAG-validated workflows whose stages communicate
//!   through an append-only context
//! - **Circuit breakers**: per-service failure windows gate calls to flaky
//!   external tools
//! - **Scheduling**: cron triggers with bounded catch-up, plus event triggers
//!   fed by the ingest grouper
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       Coordinator                            │
//! │   (control facade: tasks, workflows, triggers, groups)      │
//! └─────────────────────────────────────────────────────────────┘
//!         │                    │                      │
//!         ▼                    ▼                      ▼
//! ┌───────────────┐   ┌────────────────┐   ┌──────────────────┐
//! │ WorkflowRunner │   │   Scheduler    │   │ Reaper/Retention │
//! │ (DAG → tasks)  │   │ (cron, events) │   │  (maintenance)   │
//! └───────────────┘   └────────────────┘   └──────────────────┘
//!         │                    │                      │
//!         └────────────────────┼──────────────────────┘
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        QueueStore                            │
//! │        (PostgreSQL: vf_tasks, vf_ingest_queue)              │
//! └─────────────────────────────────────────────────────────────┘
//!                              ▲
//!                              │ claim / heartbeat / report
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         Worker                               │
//! │     (executes registered executors under heartbeat)         │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use visflow_durable::prelude::*;
//!
//! let store = Arc::new(PostgresQueueStore::new(pool));
//! store.migrate().await?;
//!
//! let coordinator = Coordinator::builder(store.clone()).build();
//! let (group_tx, group_rx) = tokio::sync::mpsc::channel(64);
//! coordinator.start(group_rx);
//!
//! let mut registry = ExecutorRegistry::new();
//! registry.register_fn("subband_convert", |params, context| async move {
//!     // convert subband files into a measurement set...
//!     Ok(json!({"ms_path": "/data/t0.ms"}))
//! });
//!
//! let worker = Worker::new(
//!     coordinator.queue().clone(),
//!     Arc::new(registry),
//!     WorkerConfig::new("imaging"),
//! );
//! worker.start()?;
//! ```

pub mod clock;
pub mod control;
pub mod metrics;
pub mod persistence;
pub mod queue;
pub mod reliability;
pub mod scheduler;
pub mod worker;
pub mod workflow;

/// Prelude for common imports
pub mod prelude {
    pub use crate::clock::{Clock, ManualClock, SystemClock};
    pub use crate::control::{Coordinator, CoordinatorBuilder};
    pub use crate::metrics::{InMemoryMetrics, MetricsSink, NullMetrics};
    pub use crate::persistence::{
        ClaimedTask, FailOutcome, GroupState, InMemoryQueueStore, IngestGroup,
        PostgresQueueStore, QueueStats, QueueStore, SpawnOutcome, StoreError, TaskFilter,
        TaskRecord, TaskSpec, TaskState,
    };
    pub use crate::queue::{Reaper, ReaperConfig, Retention, RetentionConfig, TaskQueue};
    pub use crate::reliability::{
        BackoffPolicy, BreakerRegistry, CircuitBreaker, CircuitBreakerConfig, CircuitState,
    };
    pub use crate::scheduler::{
        CatchUpPolicy, CronTrigger, GroupReady, Scheduler, SchedulerConfig, WorkflowRequest,
    };
    pub use crate::worker::{
        ExecContext, ExecError, Executor, ExecutorRegistry, Worker, WorkerConfig,
    };
    pub use crate::workflow::{
        Context, StageDef, StageRetry, WorkflowRunner, WorkflowState, WorkflowView,
    };
}

// Re-export key types at crate root
pub use clock::{Clock, ManualClock, SystemClock};
pub use control::{Coordinator, CoordinatorBuilder};
pub use metrics::{InMemoryMetrics, MetricsSink, NullMetrics};
pub use persistence::{InMemoryQueueStore, PostgresQueueStore, QueueStore, StoreError};
pub use queue::TaskQueue;
pub use reliability::{BackoffPolicy, BreakerRegistry, CircuitBreaker, CircuitBreakerConfig};
pub use scheduler::{CronTrigger, GroupReady, Scheduler};
pub use worker::{ExecError, Executor, ExecutorRegistry, Worker, WorkerConfig};
pub use workflow::{Context, StageDef, WorkflowRunner};
