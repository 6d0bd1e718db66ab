//! Lease reaper
//!
//! Workers may die at any instant between two store operations. The reaper
//! scans for claims whose deadline has passed and returns them to `pending`
//! (attempt counts preserved), so a dead lease is indistinguishable from a
//! crash and recovery needs no worker cooperation.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::metrics::{names, SharedMetrics};
use crate::persistence::QueueStore;

/// Reaper configuration.
#[derive(Debug, Clone)]
pub struct ReaperConfig {
    /// Scan interval.
    pub interval: Duration,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
        }
    }
}

/// Background loop recovering expired claims.
pub struct Reaper {
    store: Arc<dyn QueueStore>,
    metrics: SharedMetrics,
    config: ReaperConfig,
}

impl Reaper {
    pub fn new(store: Arc<dyn QueueStore>, metrics: SharedMetrics, config: ReaperConfig) -> Self {
        Self {
            store,
            metrics,
            config,
        }
    }

    /// Run one sweep; returns the number of recovered tasks.
    pub async fn sweep(&self) -> usize {
        match self.store.reap_expired().await {
            Ok(reaped) => {
                if !reaped.is_empty() {
                    info!(count = reaped.len(), "recovered tasks from dead workers");
                    self.metrics
                        .counter(names::TASKS_RECOVERED, &[], reaped.len() as u64);
                }
                reaped.len()
            }
            Err(e) => {
                // Infrastructure failure: keep the loop alive and retry on
                // the next tick.
                error!("reaper sweep failed: {}", e);
                0
            }
        }
    }

    /// Run until the shutdown channel flips.
    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.sweep().await;
                }
                _ = shutdown_rx.changed() => {
                    debug!("reaper: shutdown requested");
                    break;
                }
            }
        }

        debug!("reaper exited");
    }
}
