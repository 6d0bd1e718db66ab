//! Subband grouper
//!
//! Turns a chaotic arrival of files into a clean stream of ready-to-process
//! observation groups. Arrival timestamps jitter by a few seconds across the
//! subbands of one observation; the grouper adopts the earliest-seen
//! timestamp within the cluster tolerance as canonical, renames files to
//! embed it, and tracks per-group completeness in a bitmap.
//!
//! Late or missing subbands are handled by a stale sweep: a collecting group
//! past `incomplete_timeout` either proceeds semi-complete (the conversion
//! executor pads the missing subbands) or fails with reason `incomplete`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use crate::filename::{canonical_path, SubbandFilename};
use crate::watcher::SubbandEvent;
use visflow_durable::clock::Clock;
use visflow_durable::metrics::{names, SharedMetrics};
use visflow_durable::persistence::{GroupState, QueueStore, StoreError, SubbandOutcome};
use visflow_durable::scheduler::GroupReady;

/// Grouper configuration.
#[derive(Debug, Clone)]
pub struct GrouperConfig {
    /// Directory the watcher feeds from; ready events reference it.
    pub directory: PathBuf,

    /// Subbands per observation.
    pub expected_subbands: u16,

    /// Maximum timestamp jitter between subbands of one observation.
    pub cluster_tolerance: Duration,

    /// Minimum subbands for a semi-complete spawn.
    pub semi_complete_threshold: u16,

    /// Age at which a collecting group goes stale.
    pub incomplete_timeout: Duration,

    /// Stale sweep cadence.
    pub sweep_interval: Duration,

    /// Decline new groups while collecting+pending exceeds this.
    pub pending_watermark: u64,

    /// Rename attempts on transient filesystem errors.
    pub rename_retries: u32,
}

impl GrouperConfig {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            expected_subbands: 16,
            cluster_tolerance: Duration::from_secs(60),
            semi_complete_threshold: 12,
            incomplete_timeout: Duration::from_secs(4 * 3600),
            sweep_interval: Duration::from_secs(60),
            pending_watermark: 256,
            rename_retries: 3,
        }
    }

    pub fn with_expected_subbands(mut self, n: u16) -> Self {
        self.expected_subbands = n;
        self
    }

    pub fn with_cluster_tolerance(mut self, tolerance: Duration) -> Self {
        self.cluster_tolerance = tolerance;
        self
    }

    pub fn with_semi_complete_threshold(mut self, threshold: u16) -> Self {
        self.semi_complete_threshold = threshold;
        self
    }

    pub fn with_incomplete_timeout(mut self, timeout: Duration) -> Self {
        self.incomplete_timeout = timeout;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn with_pending_watermark(mut self, watermark: u64) -> Self {
        self.pending_watermark = watermark;
        self
    }

    pub fn validate(&self) -> Result<(), GrouperError> {
        if self.expected_subbands == 0 || self.expected_subbands > 64 {
            return Err(GrouperError::BadConfig(format!(
                "expected_subbands must be in 1..=64, got {}",
                self.expected_subbands
            )));
        }
        if self.semi_complete_threshold > self.expected_subbands {
            return Err(GrouperError::BadConfig(format!(
                "semi_complete_threshold {} exceeds expected_subbands {}",
                self.semi_complete_threshold, self.expected_subbands
            )));
        }
        Ok(())
    }
}

/// Grouper errors
#[derive(Debug, thiserror::Error)]
pub enum GrouperError {
    /// Invalid configuration
    #[error("invalid grouper configuration: {0}")]
    BadConfig(String),

    /// Store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// What the grouper did with one file event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Subband recorded; group still collecting.
    Recorded { group_key: String, present: u16 },

    /// This subband completed the group; a ready event was emitted.
    Completed { group_key: String },

    /// Index already present in the group; event ignored.
    DuplicateIgnored { group_key: String },

    /// Group already handed to a workflow; late subband ignored.
    LateIgnored { group_key: String },

    /// Backpressure: refusing to start a new group until the backlog drains.
    Declined,

    /// File could not be processed (bad index, rename failure, conflict).
    Rejected { reason: String },
}

/// Outcome of one stale sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepOutcome {
    /// Groups promoted semi-complete.
    pub promoted: usize,
    /// Groups failed as incomplete.
    pub failed: usize,
}

/// Assembles subband files into observation groups.
pub struct Grouper {
    store: Arc<dyn QueueStore>,
    clock: Arc<dyn Clock>,
    metrics: SharedMetrics,
    config: GrouperConfig,
    ready_tx: mpsc::Sender<GroupReady>,
}

impl Grouper {
    pub fn new(
        store: Arc<dyn QueueStore>,
        clock: Arc<dyn Clock>,
        metrics: SharedMetrics,
        config: GrouperConfig,
        ready_tx: mpsc::Sender<GroupReady>,
    ) -> Result<Self, GrouperError> {
        config.validate()?;
        Ok(Self {
            store,
            clock,
            metrics,
            config,
            ready_tx,
        })
    }

    pub fn config(&self) -> &GrouperConfig {
        &self.config
    }

    /// Process one file event through the canonicalization policy.
    #[instrument(skip(self, event), fields(path = %event.path.display()))]
    pub async fn handle_event(&self, event: &SubbandEvent) -> Result<Disposition, GrouperError> {
        if event.subband >= self.config.expected_subbands {
            let reason = format!(
                "subband index {} out of range (expected < {})",
                event.subband, self.config.expected_subbands
            );
            warn!(path = %event.path.display(), "{reason}");
            self.metrics.counter(names::INGEST_FILES_REJECTED, &[], 1);
            return Ok(Disposition::Rejected { reason });
        }

        // Backpressure: joining an existing group is always allowed, but new
        // groups wait until the backlog drains.
        let existing = self
            .store
            .find_group_near(event.raw_at, self.config.cluster_tolerance)
            .await?;
        if existing.is_none() {
            let counts = self.store.group_counts().await?;
            if counts.backlog() >= self.config.pending_watermark {
                warn!(
                    backlog = counts.backlog(),
                    watermark = self.config.pending_watermark,
                    "ingest backlog above watermark; declining new group"
                );
                self.metrics.counter(names::INGEST_BACKPRESSURE, &[], 1);
                return Ok(Disposition::Declined);
            }
        }

        let resolved = self
            .store
            .resolve_group(
                event.raw_at,
                self.config.cluster_tolerance,
                self.config.expected_subbands,
            )
            .await?;
        let group_key = resolved.group_key;

        let group = self.store.get_group(&group_key).await?;
        if group.state != GroupState::Collecting {
            debug!(%group_key, state = %group.state, "late subband ignored");
            return Ok(Disposition::LateIgnored { group_key });
        }

        // Normalize: embed the canonical timestamp in the file name.
        if let Some(disposition) = self.normalize(&event.path, &group_key, event.subband).await {
            return Ok(disposition);
        }

        match self.store.record_subband(&group_key, event.subband).await? {
            SubbandOutcome::Duplicate => {
                info!(%group_key, subband = event.subband, "duplicate subband index ignored");
                self.metrics
                    .counter(names::INGEST_DUPLICATE_SUBBANDS, &[], 1);
                Ok(Disposition::DuplicateIgnored { group_key })
            }
            SubbandOutcome::Added { present } => {
                debug!(%group_key, subband = event.subband, present, "subband recorded");
                if present == self.config.expected_subbands {
                    if self.store.promote_group(&group_key, false).await? {
                        info!(%group_key, "group complete");
                        self.emit_ready(&group_key, false).await;
                        return Ok(Disposition::Completed { group_key });
                    }
                }
                Ok(Disposition::Recorded { group_key, present })
            }
        }
    }

    /// Sweep stale collecting groups: promote semi-complete ones, fail the
    /// rest.
    #[instrument(skip(self))]
    pub async fn sweep(&self) -> Result<SweepOutcome, GrouperError> {
        let cutoff = self.clock.now()
            - chrono::Duration::from_std(self.config.incomplete_timeout).unwrap_or_default();
        let stale = self.store.stale_collecting(cutoff).await?;

        let mut outcome = SweepOutcome::default();
        for group in stale {
            if group.present_count() >= self.config.semi_complete_threshold {
                if self.store.promote_group(&group.group_key, true).await? {
                    info!(
                        group_key = %group.group_key,
                        present = group.present_count(),
                        expected = group.expected_subbands,
                        "stale group proceeding semi-complete"
                    );
                    self.emit_ready(&group.group_key, true).await;
                    outcome.promoted += 1;
                }
            } else {
                warn!(
                    group_key = %group.group_key,
                    present = group.present_count(),
                    "stale group failed: incomplete"
                );
                self.store.fail_group(&group.group_key, "incomplete").await?;
                outcome.failed += 1;
            }
        }

        self.refresh_gauges().await?;
        Ok(outcome)
    }

    /// Rename the file to its canonical name. Returns a terminal disposition
    /// on failure, `None` on success (including the already-normalized
    /// no-op).
    async fn normalize(
        &self,
        path: &Path,
        group_key: &str,
        subband: u16,
    ) -> Option<Disposition> {
        let extension = match SubbandFilename::parse(path) {
            Ok(parsed) => parsed.extension,
            Err(e) => {
                self.metrics.counter(names::INGEST_FILES_REJECTED, &[], 1);
                return Some(Disposition::Rejected {
                    reason: e.to_string(),
                });
            }
        };

        let parent = path.parent().unwrap_or(&self.config.directory);
        let target = canonical_path(parent, group_key, subband, &extension);
        if target == path {
            // Re-running normalization on a normalized file is a no-op, but
            // the file must still be there to be recorded.
            if !tokio::fs::try_exists(path).await.unwrap_or(false) {
                self.metrics.counter(names::INGEST_FILES_REJECTED, &[], 1);
                return Some(Disposition::Rejected {
                    reason: format!("file vanished before normalization: {}", path.display()),
                });
            }
            return None;
        }

        // POSIX rename would silently replace the target, so a pre-existing
        // target is a merge conflict, not a rename.
        if tokio::fs::try_exists(&target).await.unwrap_or(false) {
            warn!(
                from = %path.display(),
                to = %target.display(),
                "normalization conflict: target already exists"
            );
            self.metrics.counter(names::INGEST_FILES_REJECTED, &[], 1);
            return Some(Disposition::Rejected {
                reason: format!("normalization conflict: {} exists", target.display()),
            });
        }

        let mut last_error = None;
        for attempt in 1..=self.config.rename_retries {
            match tokio::fs::rename(path, &target).await {
                Ok(()) => {
                    debug!(from = %path.display(), to = %target.display(), "normalized file");
                    return None;
                }
                Err(e)
                    if matches!(
                        e.kind(),
                        std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied
                    ) =>
                {
                    warn!(path = %path.display(), "rename failed fatally: {}", e);
                    self.metrics.counter(names::INGEST_FILES_REJECTED, &[], 1);
                    return Some(Disposition::Rejected {
                        reason: format!("rename failed: {e}"),
                    });
                }
                Err(e) => {
                    debug!(path = %path.display(), attempt, "transient rename failure: {}", e);
                    last_error = Some(e);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            }
        }

        self.metrics.counter(names::INGEST_FILES_REJECTED, &[], 1);
        Some(Disposition::Rejected {
            reason: format!(
                "rename failed after {} attempts: {}",
                self.config.rename_retries,
                last_error.map(|e| e.to_string()).unwrap_or_default()
            ),
        })
    }

    async fn emit_ready(&self, group_key: &str, semi_complete: bool) {
        let group = match self.store.get_group(group_key).await {
            Ok(group) => group,
            Err(e) => {
                warn!(%group_key, "could not load group for ready event: {}", e);
                return;
            }
        };

        let event = GroupReady {
            group_key: group_key.to_string(),
            semi_complete,
            present: group.present_indices(),
            missing: group.missing_indices(),
            directory: self.config.directory.clone(),
        };

        if self.ready_tx.send(event).await.is_err() {
            warn!(%group_key, "ready channel closed; event dropped");
        }
    }

    async fn refresh_gauges(&self) -> Result<(), GrouperError> {
        let counts = self.store.group_counts().await?;
        for (state, value) in [
            ("collecting", counts.collecting),
            ("pending", counts.pending),
            ("in_progress", counts.in_progress),
            ("completed", counts.completed),
            ("failed", counts.failed),
        ] {
            self.metrics
                .gauge(names::INGEST_GROUPS, &[("state", state)], value as f64);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};
    use std::path::PathBuf;
    use visflow_durable::clock::ManualClock;
    use visflow_durable::metrics::InMemoryMetrics;
    use visflow_durable::persistence::InMemoryQueueStore;

    struct Fixture {
        grouper: Grouper,
        store: Arc<InMemoryQueueStore>,
        clock: Arc<ManualClock>,
        ready_rx: mpsc::Receiver<GroupReady>,
        dir: tempfile::TempDir,
    }

    fn fixture_with(configure: impl FnOnce(GrouperConfig) -> GrouperConfig) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::default());
        let store = Arc::new(InMemoryQueueStore::with_clock(clock.clone()));
        let (ready_tx, ready_rx) = mpsc::channel(16);
        let config = configure(GrouperConfig::new(dir.path()));
        let grouper = Grouper::new(
            store.clone(),
            clock.clone(),
            Arc::new(InMemoryMetrics::new()),
            config,
            ready_tx,
        )
        .unwrap();
        Fixture {
            grouper,
            store,
            clock,
            ready_rx,
            dir,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(|c| c)
    }

    fn base_time() -> DateTime<Utc> {
        chrono::NaiveDate::from_ymd_opt(2025, 8, 1)
            .unwrap()
            .and_hms_opt(12, 30, 0)
            .unwrap()
            .and_utc()
    }

    /// Write a file and build the event the watcher would emit for it.
    fn deposit(dir: &Path, raw_at: DateTime<Utc>, subband: u16) -> SubbandEvent {
        let name = format!(
            "{}_sb{:02}.hdf5",
            visflow_durable::persistence::group_key_for(raw_at),
            subband
        );
        let path = dir.join(name);
        std::fs::write(&path, b"visibilities").unwrap();
        SubbandEvent {
            path,
            raw_at,
            subband,
            size_bytes: 12,
            discovered_at: raw_at,
        }
    }

    #[tokio::test]
    async fn jittered_subbands_join_one_group_and_complete() {
        let mut fx = fixture();
        let t0 = base_time();

        // 16 files with 0..4s jitter; the first arrival's timestamp wins
        for i in 0..16u16 {
            let jitter = chrono::Duration::seconds((i % 5) as i64);
            let event = deposit(fx.dir.path(), t0 + jitter, i);
            let disposition = fx.grouper.handle_event(&event).await.unwrap();

            if i < 15 {
                assert_eq!(
                    disposition,
                    Disposition::Recorded {
                        group_key: "2025-08-01T12:30:00".into(),
                        present: i + 1
                    }
                );
            } else {
                assert_eq!(
                    disposition,
                    Disposition::Completed {
                        group_key: "2025-08-01T12:30:00".into()
                    }
                );
            }
        }

        // One group, pending, all bits set
        let group = fx.store.get_group("2025-08-01T12:30:00").await.unwrap();
        assert_eq!(group.state, GroupState::Pending);
        assert_eq!(group.present_count(), 16);
        assert!(!group.semi_complete);
        assert_eq!(fx.store.group_count(), 1);

        // Jittered files were renamed to the canonical prefix
        for i in 0..16u16 {
            let canonical = fx
                .dir
                .path()
                .join(format!("2025-08-01T12:30:00_sb{i:02}.hdf5"));
            assert!(canonical.exists(), "sb{i:02} not normalized");
        }

        let ready = fx.ready_rx.recv().await.unwrap();
        assert_eq!(ready.group_key, "2025-08-01T12:30:00");
        assert!(!ready.semi_complete);
        assert_eq!(ready.present.len(), 16);
        assert!(ready.missing.is_empty());
    }

    #[tokio::test]
    async fn duplicate_index_is_ignored() {
        let mut fx = fixture();
        let t0 = base_time();

        let event = deposit(fx.dir.path(), t0, 3);
        fx.grouper.handle_event(&event).await.unwrap();

        // Same index again, slightly jittered (different raw name)
        let dup = deposit(fx.dir.path(), t0 + chrono::Duration::seconds(2), 3);
        let disposition = fx.grouper.handle_event(&dup).await.unwrap();
        assert!(matches!(disposition, Disposition::Rejected { .. }));

        // The canonical target existed, so the duplicate was a conflict and
        // the group is unchanged
        let group = fx.store.get_group("2025-08-01T12:30:00").await.unwrap();
        assert_eq!(group.present_count(), 1);
        assert!(fx.ready_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn renormalizing_a_normalized_file_is_a_noop() {
        let fx = fixture();
        let t0 = base_time();

        let event = deposit(fx.dir.path(), t0, 5);
        fx.grouper.handle_event(&event).await.unwrap();

        // The watcher re-observes the canonical file (e.g. rename event)
        let canonical = fx.dir.path().join("2025-08-01T12:30:00_sb05.hdf5");
        assert!(canonical.exists());
        let replay = SubbandEvent {
            path: canonical.clone(),
            raw_at: t0,
            subband: 5,
            size_bytes: 12,
            discovered_at: t0,
        };
        let disposition = fx.grouper.handle_event(&replay).await.unwrap();
        assert_eq!(
            disposition,
            Disposition::DuplicateIgnored {
                group_key: "2025-08-01T12:30:00".into()
            }
        );

        assert!(canonical.exists());
        assert_eq!(fx.store.group_count(), 1);
    }

    #[tokio::test]
    async fn stale_group_above_threshold_goes_semi_complete() {
        let mut fx = fixture();
        let t0 = base_time();

        // 13 of 16 subbands
        for i in 0..13u16 {
            let event = deposit(fx.dir.path(), t0, i);
            fx.grouper.handle_event(&event).await.unwrap();
        }

        // Not yet stale
        let outcome = fx.grouper.sweep().await.unwrap();
        assert_eq!(outcome, SweepOutcome::default());

        fx.clock.advance(chrono::Duration::hours(5));
        let outcome = fx.grouper.sweep().await.unwrap();
        assert_eq!(outcome.promoted, 1);
        assert_eq!(outcome.failed, 0);

        let group = fx.store.get_group("2025-08-01T12:30:00").await.unwrap();
        assert_eq!(group.state, GroupState::Pending);
        assert!(group.semi_complete);

        let ready = fx.ready_rx.recv().await.unwrap();
        assert!(ready.semi_complete);
        assert_eq!(ready.present.len(), 13);
        assert_eq!(ready.missing, vec![13, 14, 15]);
    }

    #[tokio::test]
    async fn stale_group_below_threshold_fails_incomplete() {
        let fx = fixture();
        let t0 = base_time();

        for i in 0..5u16 {
            let event = deposit(fx.dir.path(), t0, i);
            fx.grouper.handle_event(&event).await.unwrap();
        }

        fx.clock.advance(chrono::Duration::hours(5));
        let outcome = fx.grouper.sweep().await.unwrap();
        assert_eq!(outcome.failed, 1);

        let group = fx.store.get_group("2025-08-01T12:30:00").await.unwrap();
        assert_eq!(group.state, GroupState::Failed);
        assert_eq!(group.error.as_deref(), Some("incomplete"));
        // Bitmap preserved for missing-data diagnosis
        assert_eq!(group.present_count(), 5);
    }

    #[tokio::test]
    async fn late_subband_after_spawn_is_ignored() {
        let fx = fixture();
        let t0 = base_time();

        let event = deposit(fx.dir.path(), t0, 0);
        fx.grouper.handle_event(&event).await.unwrap();

        // The group is handed to a workflow
        fx.store
            .promote_group("2025-08-01T12:30:00", true)
            .await
            .unwrap();
        fx.store.start_group("2025-08-01T12:30:00").await.unwrap();

        let late = deposit(fx.dir.path(), t0 + chrono::Duration::seconds(3), 9);
        let disposition = fx.grouper.handle_event(&late).await.unwrap();
        assert_eq!(
            disposition,
            Disposition::LateIgnored {
                group_key: "2025-08-01T12:30:00".into()
            }
        );

        let group = fx.store.get_group("2025-08-01T12:30:00").await.unwrap();
        assert_eq!(group.present_count(), 1);
    }

    #[tokio::test]
    async fn out_of_range_index_is_rejected() {
        let fx = fixture();

        let event = deposit(fx.dir.path(), base_time(), 16);
        let disposition = fx.grouper.handle_event(&event).await.unwrap();
        assert!(matches!(disposition, Disposition::Rejected { .. }));
        assert_eq!(fx.store.group_count(), 0);
    }

    #[tokio::test]
    async fn watermark_declines_new_groups_but_not_existing() {
        let fx = fixture_with(|c| c.with_pending_watermark(1));
        let t0 = base_time();

        // First group starts the backlog
        let event = deposit(fx.dir.path(), t0, 0);
        fx.grouper.handle_event(&event).await.unwrap();

        // A second observation far outside tolerance is declined
        let other = deposit(fx.dir.path(), t0 + chrono::Duration::seconds(600), 0);
        let disposition = fx.grouper.handle_event(&other).await.unwrap();
        assert_eq!(disposition, Disposition::Declined);
        assert_eq!(fx.store.group_count(), 1);
        // Declined file stays in place for a later replay
        assert!(other.path.exists());

        // Another subband of the existing group is still accepted
        let sibling = deposit(fx.dir.path(), t0 + chrono::Duration::seconds(1), 1);
        let disposition = fx.grouper.handle_event(&sibling).await.unwrap();
        assert!(matches!(disposition, Disposition::Recorded { .. }));
    }

    #[tokio::test]
    async fn vanished_file_is_rejected_not_recorded() {
        let fx = fixture();
        let t0 = base_time();

        let mut event = deposit(fx.dir.path(), t0, 2);
        std::fs::remove_file(&event.path).unwrap();
        event.size_bytes = 0;

        let disposition = fx.grouper.handle_event(&event).await.unwrap();
        assert!(matches!(disposition, Disposition::Rejected { .. }));

        let group = fx.store.get_group("2025-08-01T12:30:00").await.unwrap();
        assert_eq!(group.present_count(), 0);
    }
}
