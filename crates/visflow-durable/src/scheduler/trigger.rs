//! Trigger definitions for the scheduler

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::workflow::{Context, StageDef};

/// A workflow submission produced by a trigger factory.
pub struct WorkflowRequest {
    pub queue: String,
    pub workflow_name: String,
    pub stages: Vec<StageDef>,
    pub context_root: Context,
}

/// Factory turning a cron fire instant into a workflow submission.
pub type WorkflowFactory = Arc<dyn Fn(DateTime<Utc>) -> WorkflowRequest + Send + Sync>;

/// Factory turning a ready ingest group into a workflow submission.
pub type GroupFactory = Arc<dyn Fn(&GroupReady) -> WorkflowRequest + Send + Sync>;

/// Emitted by the ingest grouper when a group becomes ready to process.
///
/// `missing` is non-empty exactly when `semi_complete` is set; the conversion
/// executor decides how to pad those subbands.
#[derive(Debug, Clone)]
pub struct GroupReady {
    pub group_key: String,
    pub semi_complete: bool,
    pub present: Vec<u16>,
    pub missing: Vec<u16>,
    /// Directory holding the normalized subband files.
    pub directory: PathBuf,
}

/// Startup catch-up policy for missed cron fires.
///
/// Fires within `lookback` of startup are resubmitted (deduplication makes
/// this safe); older misses are skipped.
#[derive(Debug, Clone, Default)]
pub struct CatchUpPolicy {
    pub lookback: Duration,
}

impl CatchUpPolicy {
    /// No catch-up: missed fires are dropped.
    pub fn none() -> Self {
        Self::default()
    }

    pub fn lookback(lookback: Duration) -> Self {
        Self { lookback }
    }
}

/// A cron-driven workflow trigger.
///
/// Cron specs use the 6-field form with leading seconds, e.g.
/// `"0 0 3 * * *"` for 03:00:00 daily.
#[derive(Clone)]
pub struct CronTrigger {
    pub name: String,
    pub schedule: cron::Schedule,
    pub factory: WorkflowFactory,
    pub catch_up: CatchUpPolicy,
}

impl CronTrigger {
    pub fn new(
        name: impl Into<String>,
        cron_spec: &str,
        factory: WorkflowFactory,
    ) -> Result<Self, cron::error::Error> {
        Ok(Self {
            name: name.into(),
            schedule: cron::Schedule::from_str(cron_spec)?,
            factory,
            catch_up: CatchUpPolicy::none(),
        })
    }

    pub fn with_catch_up(mut self, policy: CatchUpPolicy) -> Self {
        self.catch_up = policy;
        self
    }

    /// Next fire strictly after the given instant.
    pub fn next_fire(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&after).next()
    }
}

impl std::fmt::Debug for CronTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CronTrigger")
            .field("name", &self.name)
            .field("schedule", &self.schedule.to_string())
            .finish()
    }
}
