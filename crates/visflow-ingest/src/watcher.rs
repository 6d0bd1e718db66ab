//! Incoming-directory watcher
//!
//! Bridges `notify` filesystem events into a tokio channel of parsed
//! [`SubbandEvent`]s. Upstream writers deposit files atomically
//! (write-then-rename), so a create or rename-into-place event means the
//! file is complete. An initial scan on startup replays files that arrived
//! while the process was down; re-observing a file the grouper already
//! normalized is harmless because normalization and recording are
//! idempotent.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use notify::event::{CreateKind, EventKind, ModifyKind, RenameMode};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::filename::SubbandFilename;
use visflow_durable::clock::Clock;

/// A discovered subband file.
#[derive(Debug, Clone)]
pub struct SubbandEvent {
    pub path: PathBuf,
    /// Timestamp parsed from the file name (raw until normalized).
    pub raw_at: DateTime<Utc>,
    pub subband: u16,
    pub size_bytes: u64,
    pub discovered_at: DateTime<Utc>,
}

/// Watcher errors
#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    /// Backend watcher failed
    #[error("filesystem watcher error: {0}")]
    Notify(#[from] notify::Error),

    /// Initial scan failed
    #[error("initial scan of {path} failed: {source}")]
    Scan {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Watches one incoming directory for subband files.
pub struct DirectoryWatcher {
    directory: PathBuf,
    clock: Arc<dyn Clock>,
    // Dropping the backend stops event delivery.
    backend: Option<RecommendedWatcher>,
}

impl DirectoryWatcher {
    pub fn new(directory: impl Into<PathBuf>, clock: Arc<dyn Clock>) -> Self {
        Self {
            directory: directory.into(),
            clock,
            backend: None,
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Start watching; returns the event stream.
    ///
    /// Existing files are replayed first, then live events follow.
    pub fn start(&mut self) -> Result<mpsc::UnboundedReceiver<SubbandEvent>, WatchError> {
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        self.initial_scan(&event_tx)?;

        let clock = self.clock.clone();
        let tx = event_tx.clone();
        let mut backend = notify::recommended_watcher(
            move |result: Result<notify::Event, notify::Error>| match result {
                Ok(event) => {
                    if !is_arrival(&event.kind) {
                        return;
                    }
                    for path in event.paths {
                        if let Some(subband_event) = convert(&path, clock.now()) {
                            if tx.send(subband_event).is_err() {
                                // Receiver dropped; the service is stopping.
                                return;
                            }
                        }
                    }
                }
                Err(e) => error!("watch error: {}", e),
            },
        )?;
        backend.watch(&self.directory, RecursiveMode::NonRecursive)?;
        self.backend = Some(backend);

        info!(directory = %self.directory.display(), "watching incoming directory");
        Ok(event_rx)
    }

    /// Stop delivering events.
    pub fn stop(&mut self) {
        self.backend = None;
    }

    fn initial_scan(
        &self,
        tx: &mpsc::UnboundedSender<SubbandEvent>,
    ) -> Result<(), WatchError> {
        let entries = std::fs::read_dir(&self.directory).map_err(|source| WatchError::Scan {
            path: self.directory.clone(),
            source,
        })?;

        let mut replayed = 0usize;
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            if let Some(event) = convert(&path, self.clock.now()) {
                replayed += 1;
                if tx.send(event).is_err() {
                    break;
                }
            }
        }

        if replayed > 0 {
            info!(count = replayed, "replayed existing files from initial scan");
        }
        Ok(())
    }
}

fn is_arrival(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(CreateKind::File)
            | EventKind::Create(CreateKind::Any)
            | EventKind::Modify(ModifyKind::Name(RenameMode::To))
            | EventKind::Modify(ModifyKind::Name(RenameMode::Any))
    )
}

fn convert(path: &Path, discovered_at: DateTime<Utc>) -> Option<SubbandEvent> {
    let parsed = match SubbandFilename::parse(path) {
        Ok(parsed) => parsed,
        Err(e) => {
            debug!(path = %path.display(), "skipping non-subband file: {}", e);
            return None;
        }
    };

    let size_bytes = match std::fs::metadata(path) {
        Ok(meta) => meta.len(),
        Err(e) => {
            // The file may have been renamed away between the event and the
            // stat (our own normalization does this).
            warn!(path = %path.display(), "could not stat file: {}", e);
            return None;
        }
    };

    Some(SubbandEvent {
        path: path.to_path_buf(),
        raw_at: parsed.raw_at,
        subband: parsed.subband,
        size_bytes,
        discovered_at,
    })
}
