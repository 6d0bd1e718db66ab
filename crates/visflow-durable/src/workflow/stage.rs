//! Stage definitions and the task-parameter envelope

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::context::Context;
use crate::reliability::BackoffPolicy;

/// Per-stage retry policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StageRetry {
    /// Maximum attempts (including the first).
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
}

impl Default for StageRetry {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: BackoffPolicy::default(),
        }
    }
}

impl StageRetry {
    pub fn new(max_attempts: u32, backoff: BackoffPolicy) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    /// Single attempt, no retry.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// A node in a workflow DAG.
///
/// # Example
///
/// ```
/// use visflow_durable::workflow::StageDef;
/// use serde_json::json;
///
/// let stage = StageDef::new("applycal", "apply_calibration")
///     .depends_on(["convert", "solve"])
///     .with_outputs(["calibrated_ms"])
///     .with_config(json!({"field": "0"}));
/// ```
#[derive(Debug, Clone)]
pub struct StageDef {
    /// Unique within the workflow.
    pub name: String,

    /// Key into the worker's executor registry.
    pub executor_ref: String,

    /// Names of stages whose outputs this stage observes.
    pub depends_on: Vec<String>,

    pub retry: StageRetry,

    /// Scheduled cancellation after this long, when set.
    pub timeout: Option<Duration>,

    /// An optional stage that dies does not fail its successors.
    pub optional: bool,

    /// Context keys this stage's result contributes. Declared up front so
    /// collisions are refused at submission rather than at merge time.
    pub outputs: Vec<String>,

    /// Stage-specific configuration passed through to the executor.
    pub config: Value,

    pub priority: i32,
}

impl StageDef {
    pub fn new(name: impl Into<String>, executor_ref: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            executor_ref: executor_ref.into(),
            depends_on: vec![],
            retry: StageRetry::default(),
            timeout: None,
            optional: false,
            outputs: vec![],
            config: Value::Null,
            priority: 0,
        }
    }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_retry(mut self, retry: StageRetry) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    pub fn with_outputs<I, S>(mut self, outputs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.outputs = outputs.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_config(mut self, config: Value) -> Self {
        self.config = config;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

/// Payload stored in a workflow task's `params` column.
///
/// Everything a worker needs to run the stage without a workflow table:
/// the workflow is a reconstructable view over its tasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageEnvelope {
    pub workflow: String,
    pub stage: String,
    pub executor_ref: String,
    pub optional: bool,
    pub timeout_ms: Option<u64>,
    pub outputs: Vec<String>,
    pub context_root: Context,
    pub config: Value,
}

impl StageEnvelope {
    pub fn to_params(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }

    pub fn from_params(params: &Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(params.clone())
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn stage_builder() {
        let stage = StageDef::new("image", "wsclean_image")
            .depends_on(["applycal"])
            .with_timeout(Duration::from_secs(3600))
            .with_outputs(["image_path"])
            .with_priority(2);

        assert_eq!(stage.name, "image");
        assert_eq!(stage.executor_ref, "wsclean_image");
        assert_eq!(stage.depends_on, vec!["applycal"]);
        assert_eq!(stage.timeout, Some(Duration::from_secs(3600)));
        assert!(!stage.optional);
        assert_eq!(stage.priority, 2);
    }

    #[test]
    fn envelope_round_trip() {
        let envelope = StageEnvelope {
            workflow: "standard_imaging".into(),
            stage: "convert".into(),
            executor_ref: "subband_convert".into(),
            optional: false,
            timeout_ms: Some(60_000),
            outputs: vec!["ms_path".into()],
            context_root: Context::new().with("group_key", json!("t0")).unwrap(),
            config: json!({"pad_missing": true}),
        };

        let params = envelope.to_params().unwrap();
        let back = StageEnvelope::from_params(&params).unwrap();

        assert_eq!(back.workflow, "standard_imaging");
        assert_eq!(back.timeout(), Some(Duration::from_secs(60)));
        assert_eq!(back.context_root.get("group_key"), Some(&json!("t0")));
    }
}
