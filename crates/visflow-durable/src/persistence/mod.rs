//! Persistence layer for queue and ingest state
//!
//! The [`QueueStore`] trait defines the coordinator's durable surface;
//! [`PostgresQueueStore`] is the production implementation and
//! [`InMemoryQueueStore`] provides identical semantics for tests and
//! single-process use.

mod memory;
mod postgres;
mod store;

pub use memory::InMemoryQueueStore;
pub use postgres::{PostgresQueueStore, MIGRATOR};
pub use store::{
    group_key_for, parse_group_key, ClaimedTask, FailOutcome, GroupCounts, GroupState,
    HeartbeatAck, IngestGroup, QueueStats, QueueStore, ResolvedGroup, SpawnOutcome, StoreError,
    SubbandOutcome, TaskFilter, TaskRecord, TaskSpec, TaskState, GROUP_KEY_FORMAT,
};
