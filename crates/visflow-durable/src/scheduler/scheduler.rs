//! Workflow scheduler
//!
//! Spawns workflows from cron triggers and from `GroupReady` events emitted
//! by the ingest grouper. Every submission carries a deterministic dedupe
//! scope, so a double fire (restart overlap, duplicate event) collapses onto
//! the original workflow.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, instrument, warn};

use super::trigger::{CronTrigger, GroupFactory, GroupReady, WorkflowRequest};
use crate::clock::Clock;
use crate::workflow::WorkflowRunner;

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Cron poll cadence.
    pub tick_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(1),
        }
    }
}

/// Registered trigger state.
struct TriggerState {
    trigger: CronTrigger,
    next_fire: Option<DateTime<Utc>>,
}

/// Summary of a registered trigger.
#[derive(Debug, Clone)]
pub struct TriggerInfo {
    pub name: String,
    pub cron: String,
    pub next_fire: Option<DateTime<Utc>>,
}

/// Cron and event-driven workflow spawner.
pub struct Scheduler {
    runner: WorkflowRunner,
    clock: Arc<dyn Clock>,
    config: SchedulerConfig,
    triggers: Mutex<Vec<TriggerState>>,
    group_factory: RwLock<Option<GroupFactory>>,
}

impl Scheduler {
    pub fn new(runner: WorkflowRunner, clock: Arc<dyn Clock>, config: SchedulerConfig) -> Self {
        Self {
            runner,
            clock,
            config,
            triggers: Mutex::new(vec![]),
            group_factory: RwLock::new(None),
        }
    }

    /// Register a cron trigger; its first fire is the next match after now.
    pub fn register_trigger(&self, trigger: CronTrigger) {
        let next_fire = trigger.next_fire(self.clock.now());
        info!(name = %trigger.name, ?next_fire, "registered cron trigger");
        self.triggers.lock().push(TriggerState {
            trigger,
            next_fire,
        });
    }

    pub fn list_triggers(&self) -> Vec<TriggerInfo> {
        self.triggers
            .lock()
            .iter()
            .map(|s| TriggerInfo {
                name: s.trigger.name.clone(),
                cron: s.trigger.schedule.to_string(),
                next_fire: s.next_fire,
            })
            .collect()
    }

    /// Install the factory that turns ready ingest groups into workflows.
    pub fn on_group_ready(&self, factory: GroupFactory) {
        *self.group_factory.write() = Some(factory);
    }

    /// Resubmit fires missed within each trigger's look-back window.
    ///
    /// Deduplication makes resubmission idempotent; fires older than the
    /// window are skipped.
    #[instrument(skip(self))]
    pub async fn catch_up(&self) {
        let now = self.clock.now();

        // Collect due fires under the lock, submit outside it.
        let mut missed: Vec<(CronTrigger, DateTime<Utc>)> = vec![];
        {
            let triggers = self.triggers.lock();
            for state in triggers.iter() {
                let lookback =
                    chrono::Duration::from_std(state.trigger.catch_up.lookback).unwrap_or_default();
                if lookback.is_zero() {
                    continue;
                }
                let from = now - lookback;
                for fire in state.trigger.schedule.after(&from) {
                    if fire > now {
                        break;
                    }
                    missed.push((state.trigger.clone(), fire));
                }
            }
        }

        if missed.is_empty() {
            return;
        }

        info!(count = missed.len(), "catching up missed fires");
        for (trigger, fire) in missed {
            self.fire(&trigger, fire).await;
        }
    }

    /// Fire all triggers whose next fire time has passed.
    pub async fn tick(&self) {
        let now = self.clock.now();

        let due: Vec<(CronTrigger, DateTime<Utc>)> = {
            let mut triggers = self.triggers.lock();
            let mut due = vec![];
            for state in triggers.iter_mut() {
                if let Some(fire) = state.next_fire {
                    if fire <= now {
                        due.push((state.trigger.clone(), fire));
                        state.next_fire = state.trigger.next_fire(now);
                    }
                }
            }
            due
        };

        for (trigger, fire) in due {
            self.fire(&trigger, fire).await;
        }
    }

    /// Submit a workflow for a ready ingest group and move the group to
    /// `in_progress`.
    #[instrument(skip(self, event), fields(group_key = %event.group_key))]
    pub async fn handle_group_ready(&self, event: GroupReady) {
        let factory = match self.group_factory.read().clone() {
            Some(f) => f,
            None => {
                warn!("group ready but no factory registered; dropping event");
                return;
            }
        };

        let request = factory(&event);
        let scope = format!("ingest@{}", event.group_key);
        match self.submit(request, scope).await {
            Ok(()) => {
                // Late subbands are ignored from here on.
                match self
                    .runner
                    .queue()
                    .store()
                    .start_group(&event.group_key)
                    .await
                {
                    Ok(true) => {}
                    Ok(false) => {
                        debug!(group_key = %event.group_key, "group already in progress")
                    }
                    Err(e) => error!(group_key = %event.group_key, "failed to start group: {}", e),
                }
            }
            Err(e) => {
                // Leave the group pending so an operator (or a retry event)
                // can resubmit.
                error!(group_key = %event.group_key, "group workflow submission failed: {}", e);
            }
        }
    }

    async fn fire(&self, trigger: &CronTrigger, fire: DateTime<Utc>) {
        let request = (trigger.factory)(fire);
        let scope = format!("{}@{}", trigger.name, fire.to_rfc3339());
        debug!(trigger = %trigger.name, %fire, "cron trigger fired");
        if let Err(e) = self.submit(request, scope).await {
            error!(trigger = %trigger.name, "trigger submission failed: {}", e);
        }
    }

    async fn submit(
        &self,
        request: WorkflowRequest,
        scope: String,
    ) -> Result<(), crate::workflow::SubmitError> {
        let submission = self
            .runner
            .submit(
                &request.queue,
                &request.workflow_name,
                request.stages,
                request.context_root,
                Some(scope),
            )
            .await?;

        if submission.deduplicated {
            debug!(
                workflow_id = %submission.workflow_id,
                "submission collapsed onto existing workflow"
            );
        } else {
            info!(
                workflow_id = %submission.workflow_id,
                workflow = %request.workflow_name,
                "workflow spawned by scheduler"
            );
        }
        Ok(())
    }

    /// Run until shutdown: poll cron triggers and consume group events.
    pub async fn run(
        self: Arc<Self>,
        mut group_rx: mpsc::Receiver<GroupReady>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        self.catch_up().await;
        let mut ticker = tokio::time::interval(self.config.tick_interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick().await;
                }
                event = group_rx.recv() => {
                    match event {
                        Some(event) => self.handle_group_ready(event).await,
                        None => {
                            debug!("group event channel closed");
                            break;
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    debug!("scheduler: shutdown requested");
                    break;
                }
            }
        }

        debug!("scheduler exited");
    }
}
