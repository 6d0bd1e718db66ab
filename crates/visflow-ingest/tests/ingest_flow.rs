//! End-to-end ingest: files on disk through watcher, grouper and scheduler
//! into a spawned workflow.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc;

use visflow_durable::clock::SystemClock;
use visflow_durable::metrics::InMemoryMetrics;
use visflow_durable::persistence::{GroupState, InMemoryQueueStore, QueueStore, TaskFilter};
use visflow_durable::scheduler::{GroupReady, WorkflowRequest};
use visflow_durable::workflow::{Context, StageDef};
use visflow_durable::Coordinator;
use visflow_ingest::{GrouperConfig, IngestService};

fn write_subband(dir: &std::path::Path, timestamp: &str, subband: u16) {
    std::fs::write(
        dir.join(format!("{timestamp}_sb{subband:02}.hdf5")),
        b"visibilities",
    )
    .unwrap();
}

async fn wait_until<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
}

/// Sixteen jittered subband files arrive; one group forms, normalizes the
/// stragglers, goes pending on the sixteenth, and the scheduler spawns the
/// imaging workflow and marks the group in progress.
#[tokio::test]
async fn clean_ingest_spawns_workflow() {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<InMemoryQueueStore> = Arc::new(InMemoryQueueStore::new());
    let metrics = Arc::new(InMemoryMetrics::new());

    let coordinator = Coordinator::builder(store.clone())
        .with_metrics(metrics.clone())
        .build();
    coordinator.on_group_ready(Arc::new(|event: &GroupReady| WorkflowRequest {
        queue: "imaging".into(),
        workflow_name: "standard_imaging".into(),
        stages: vec![StageDef::new("convert", "subband_convert")
            .with_outputs(["ms_path"])
            .with_config(json!({"pad_missing": true}))],
        context_root: Context::new()
            .with("group_key", json!(event.group_key))
            .unwrap()
            .with("directory", json!(event.directory.display().to_string()))
            .unwrap()
            .with("present", json!(event.present))
            .unwrap()
            .with("missing", json!(event.missing))
            .unwrap(),
    }));

    let (ready_tx, ready_rx) = mpsc::channel(16);
    coordinator.start(ready_rx);

    let mut service = IngestService::new(
        store.clone(),
        Arc::new(SystemClock),
        metrics,
        GrouperConfig::new(dir.path()),
        ready_tx,
    )
    .unwrap();
    service.start().unwrap();

    // The first arrival's timestamp becomes canonical; land it before the
    // jittered stragglers so the group key is deterministic
    write_subband(dir.path(), "2025-08-01T12:30:00", 0);
    wait_until("first subband to form the group", || {
        let store = store.clone();
        async move {
            store
                .get_group("2025-08-01T12:30:00")
                .await
                .map(|g| g.present_count() >= 1)
                .unwrap_or(false)
        }
    })
    .await;

    // Remaining subbands jitter across 5 seconds
    for i in 1..16u16 {
        let second = i % 5;
        write_subband(dir.path(), &format!("2025-08-01T12:30:0{second}"), i);
    }

    wait_until("group to reach in_progress", || {
        let store = store.clone();
        async move {
            store
                .get_group("2025-08-01T12:30:00")
                .await
                .map(|g| g.state == GroupState::InProgress)
                .unwrap_or(false)
        }
    })
    .await;

    let group = store.get_group("2025-08-01T12:30:00").await.unwrap();
    assert_eq!(group.present_count(), 16);
    assert!(!group.semi_complete);

    // All files carry the canonical prefix now
    for i in 0..16u16 {
        assert!(dir
            .path()
            .join(format!("2025-08-01T12:30:00_sb{i:02}.hdf5"))
            .exists());
    }

    // Exactly one conversion task was spawned, with the group in its context
    let tasks = store.list_tasks(TaskFilter::default()).await.unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].name, "standard_imaging.convert");

    service.shutdown().await;
    coordinator.shutdown().await;
}

/// Thirteen of sixteen subbands arrive and the group goes stale: it proceeds
/// semi-complete and the ready event names the synthetic (missing) indices.
#[tokio::test]
async fn semi_complete_ingest_proceeds_with_missing_indices() {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<InMemoryQueueStore> = Arc::new(InMemoryQueueStore::new());

    let (ready_tx, mut ready_rx) = mpsc::channel(16);
    let mut service = IngestService::new(
        store.clone(),
        Arc::new(SystemClock),
        Arc::new(InMemoryMetrics::new()),
        GrouperConfig::new(dir.path())
            .with_incomplete_timeout(Duration::from_millis(200))
            .with_sweep_interval(Duration::from_millis(50)),
        ready_tx,
    )
    .unwrap();
    service.start().unwrap();

    for i in 0..13u16 {
        write_subband(dir.path(), "2025-08-01T12:45:00", i);
    }

    let ready = tokio::time::timeout(Duration::from_secs(10), ready_rx.recv())
        .await
        .expect("ready event before timeout")
        .expect("channel open");

    assert_eq!(ready.group_key, "2025-08-01T12:45:00");
    assert!(ready.semi_complete);
    assert_eq!(ready.present.len(), 13);
    assert_eq!(ready.missing, vec![13, 14, 15]);

    let group = store.get_group("2025-08-01T12:45:00").await.unwrap();
    assert_eq!(group.state, GroupState::Pending);
    assert!(group.semi_complete);

    service.shutdown().await;
}
