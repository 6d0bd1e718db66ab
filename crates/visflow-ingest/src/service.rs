//! Ingest service wiring
//!
//! Runs the watcher, grouper and stale sweep as background loops with a
//! shared shutdown channel, feeding `GroupReady` events into the channel the
//! coordinator's scheduler consumes.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::grouper::{Grouper, GrouperConfig, GrouperError};
use crate::watcher::{DirectoryWatcher, WatchError};
use visflow_durable::clock::Clock;
use visflow_durable::metrics::SharedMetrics;
use visflow_durable::persistence::QueueStore;
use visflow_durable::scheduler::GroupReady;

/// Ingest service errors
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    /// Watcher failed to start
    #[error(transparent)]
    Watch(#[from] WatchError),

    /// Grouper configuration or store failure
    #[error(transparent)]
    Grouper(#[from] GrouperError),

    /// Service already running
    #[error("ingest service is already running")]
    AlreadyRunning,
}

/// Filesystem-watching ingest frontend.
///
/// # Example
///
/// ```ignore
/// let (ready_tx, ready_rx) = tokio::sync::mpsc::channel(64);
/// coordinator.start(ready_rx);
///
/// let config = GrouperConfig::new("/data/incoming");
/// let mut service = IngestService::new(store, clock, metrics, config, ready_tx)?;
/// service.start()?;
/// ```
pub struct IngestService {
    watcher: DirectoryWatcher,
    grouper: Arc<Grouper>,
    sweep_interval: std::time::Duration,
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl IngestService {
    pub fn new(
        store: Arc<dyn QueueStore>,
        clock: Arc<dyn Clock>,
        metrics: SharedMetrics,
        config: GrouperConfig,
        ready_tx: mpsc::Sender<GroupReady>,
    ) -> Result<Self, IngestError> {
        let watcher = DirectoryWatcher::new(config.directory.clone(), clock.clone());
        let sweep_interval = config.sweep_interval;
        let grouper = Arc::new(Grouper::new(store, clock, metrics, config, ready_tx)?);
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            watcher,
            grouper,
            sweep_interval,
            shutdown_tx,
            handles: vec![],
        })
    }

    pub fn grouper(&self) -> &Arc<Grouper> {
        &self.grouper
    }

    /// Start the watcher, event loop and sweep loop.
    pub fn start(&mut self) -> Result<(), IngestError> {
        if !self.handles.is_empty() {
            return Err(IngestError::AlreadyRunning);
        }

        let mut events = self.watcher.start()?;
        info!(directory = %self.watcher.directory().display(), "ingest service started");

        // Event loop
        let grouper = self.grouper.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        self.handles.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = events.recv() => {
                        match event {
                            Some(event) => {
                                if let Err(e) = grouper.handle_event(&event).await {
                                    // Store trouble is process-wide health, not
                                    // a per-file verdict; the file stays put
                                    // and is replayed on the next scan.
                                    error!(path = %event.path.display(), "grouper error: {}", e);
                                }
                            }
                            None => {
                                debug!("watcher channel closed");
                                break;
                            }
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        debug!("ingest event loop: shutdown requested");
                        break;
                    }
                }
            }
        }));

        // Stale sweep loop
        let grouper = self.grouper.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let interval = self.sweep_interval;
        self.handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match grouper.sweep().await {
                            Ok(outcome) if outcome.promoted + outcome.failed > 0 => {
                                info!(
                                    promoted = outcome.promoted,
                                    failed = outcome.failed,
                                    "stale sweep"
                                );
                            }
                            Ok(_) => {}
                            Err(e) => error!("stale sweep failed: {}", e),
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        debug!("sweep loop: shutdown requested");
                        break;
                    }
                }
            }
        }));

        Ok(())
    }

    /// Stop watching and drain the loops.
    pub async fn shutdown(&mut self) {
        self.watcher.stop();
        let _ = self.shutdown_tx.send(true);
        for handle in self.handles.drain(..) {
            let _ = handle.await;
        }
        info!("ingest service stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use visflow_durable::clock::SystemClock;
    use visflow_durable::metrics::InMemoryMetrics;
    use visflow_durable::persistence::InMemoryQueueStore;

    #[tokio::test]
    async fn start_is_exclusive_and_shutdown_drains() {
        let dir = tempfile::tempdir().unwrap();
        let (ready_tx, _ready_rx) = mpsc::channel(16);
        let mut service = IngestService::new(
            Arc::new(InMemoryQueueStore::new()),
            Arc::new(SystemClock),
            Arc::new(InMemoryMetrics::new()),
            GrouperConfig::new(dir.path()),
            ready_tx,
        )
        .unwrap();

        service.start().unwrap();
        assert!(matches!(
            service.start(),
            Err(IngestError::AlreadyRunning)
        ));

        tokio::time::timeout(Duration::from_secs(2), service.shutdown())
            .await
            .expect("shutdown completes");
    }
}
