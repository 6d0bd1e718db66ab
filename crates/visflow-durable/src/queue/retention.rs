//! Retention-based pruning of terminal tasks

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::clock::Clock;
use crate::persistence::{QueueStore, TaskState};

/// Retention windows for terminal tasks.
#[derive(Debug, Clone)]
pub struct RetentionConfig {
    /// Keep completed and cancelled tasks this long after finishing.
    pub completed_after: Duration,

    /// Keep dead-letter tasks this long for inspection.
    pub dead_after: Duration,

    /// Prune interval.
    pub interval: Duration,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            completed_after: Duration::from_secs(7 * 24 * 3600),
            dead_after: Duration::from_secs(30 * 24 * 3600),
            interval: Duration::from_secs(3600),
        }
    }
}

/// Background loop pruning terminal tasks past their retention window.
pub struct Retention {
    store: Arc<dyn QueueStore>,
    clock: Arc<dyn Clock>,
    config: RetentionConfig,
}

impl Retention {
    pub fn new(store: Arc<dyn QueueStore>, clock: Arc<dyn Clock>, config: RetentionConfig) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    /// Run one prune pass; returns the number of deleted tasks.
    pub async fn prune_once(&self) -> u64 {
        let now = self.clock.now();
        let mut deleted = 0;

        let completed_cutoff =
            now - chrono::Duration::from_std(self.config.completed_after).unwrap_or_default();
        match self
            .store
            .prune(
                completed_cutoff,
                &[TaskState::Completed, TaskState::Cancelled],
            )
            .await
        {
            Ok(n) => deleted += n,
            Err(e) => error!("retention prune (completed) failed: {}", e),
        }

        let dead_cutoff =
            now - chrono::Duration::from_std(self.config.dead_after).unwrap_or_default();
        match self.store.prune(dead_cutoff, &[TaskState::Dead]).await {
            Ok(n) => deleted += n,
            Err(e) => error!("retention prune (dead) failed: {}", e),
        }

        if deleted > 0 {
            info!(deleted, "pruned terminal tasks");
        }
        deleted
    }

    /// Run until the shutdown channel flips.
    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.prune_once().await;
                }
                _ = shutdown_rx.changed() => {
                    debug!("retention: shutdown requested");
                    break;
                }
            }
        }

        debug!("retention exited");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::persistence::{InMemoryQueueStore, TaskSpec};
    use serde_json::json;

    #[tokio::test]
    async fn prunes_by_state_specific_windows() {
        let clock = Arc::new(ManualClock::default());
        let store = Arc::new(InMemoryQueueStore::with_clock(clock.clone()));
        let retention = Retention::new(store.clone(), clock.clone(), RetentionConfig::default());

        // One completed, one dead
        let done = store
            .spawn(TaskSpec::new("q", "a", json!({})))
            .await
            .unwrap()
            .task_id();
        store.claim("q", "w", Duration::from_secs(60)).await.unwrap();
        store.complete(done, "w", json!(null)).await.unwrap();

        let dead = store
            .spawn(TaskSpec::new("q", "b", json!({})).with_max_attempts(1))
            .await
            .unwrap()
            .task_id();
        store.claim("q", "w", Duration::from_secs(60)).await.unwrap();
        store.fail(dead, "w", "boom", true).await.unwrap();

        // 8 days: completed is past its window, dead is not
        clock.advance(chrono::Duration::days(8));
        assert_eq!(retention.prune_once().await, 1);
        assert!(store.get_task(done).await.is_err());
        assert!(store.get_task(dead).await.is_ok());

        // 31 days total: dead goes too
        clock.advance(chrono::Duration::days(23));
        assert_eq!(retention.prune_once().await, 1);
        assert!(store.get_task(dead).await.is_err());
    }
}
