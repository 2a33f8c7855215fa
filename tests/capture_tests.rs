//! End-to-end captures against the in-memory source.

use std::sync::Arc;

use checkpoint::{CheckpointConfig, CheckpointManager, SyncPhase};
use chunk_sync::capture::{run_capture, verify_output};
use chunk_sync::checkpoint::latest_checkpoint;
use chunk_sync::config::{CaptureConfig, TableConfig, WorkloadConfig};
use chunk_sync_enumerator::EnumeratorCheckpoint;
use chunk_sync_memory_source::{MemoryDatabase, MemorySink};
use tokio_test::assert_ok;
use tokio_util::sync::CancellationToken;

fn small_config(readers: usize, mutations: u64) -> CaptureConfig {
    CaptureConfig {
        tables: vec![
            TableConfig {
                name: "shop.orders".to_string(),
                rows: 1000,
            },
            TableConfig {
                name: "shop.items".to_string(),
                rows: 300,
            },
        ],
        chunk_size: 100,
        split_meta_group_size: 3,
        readers,
        checkpoint_interval: "20ms".to_string(),
        workload: WorkloadConfig {
            mutations,
            pause: "0".to_string(),
            seed: Some(11),
            ..Default::default()
        },
        ..Default::default()
    }
}

// =============================================================================
// Capture runs
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_capture_with_workload_matches_source() {
    let config = small_config(3, 400);
    let db = MemoryDatabase::new();
    let sink = MemorySink::new();
    let checkpoints = CheckpointManager::new(CheckpointConfig::memory());

    let report = assert_ok!(
        run_capture(
            &config,
            db.clone(),
            Arc::new(sink.clone()),
            &checkpoints,
            CancellationToken::new(),
        )
        .await
    );

    assert_eq!(report.tables.len(), 2);
    assert!(report.snapshot_splits >= 10);
    assert_eq!(report.readers.len(), 3);
    assert_eq!(report.workload.total(), 400);
    assert!(!report.interrupted);
    assert_eq!(
        report.readers.iter().filter(|r| r.ran_stream_split).count(),
        1
    );
    assert_eq!(
        report
            .readers
            .iter()
            .map(|r| r.snapshot_splits)
            .sum::<usize>(),
        report.snapshot_splits
    );

    let records = sink.records().await;
    let mismatches = assert_ok!(verify_output(&db, &report.tables, &records).await);
    assert!(mismatches.is_empty(), "{mismatches:?}");

    let last: Option<EnumeratorCheckpoint> =
        assert_ok!(checkpoints.read_checkpoint(SyncPhase::Stream).await);
    let last = last.expect("stream checkpoint");
    assert_eq!(last.finished.len(), report.snapshot_splits);
    assert!(last.stream_split.is_some());
}

#[tokio::test]
async fn test_capture_without_workload_emits_each_row_once() {
    let config = small_config(2, 0);
    let db = MemoryDatabase::new();
    let sink = MemorySink::new();
    let checkpoints = CheckpointManager::new(CheckpointConfig::disabled());

    let report = run_capture(
        &config,
        db.clone(),
        Arc::new(sink.clone()),
        &checkpoints,
        CancellationToken::new(),
    )
    .await
    .unwrap();

    assert_eq!(report.snapshot_records(), 1300);
    assert_eq!(report.stream_records(), 0);
    assert_eq!(report.checkpoints_emitted, 0);
    assert_eq!(sink.len().await, 1300);
    assert!(verify_output(&db, &report.tables, &sink.records().await)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_invalid_config_is_rejected_before_seeding() {
    let config = CaptureConfig {
        readers: 0,
        ..small_config(1, 0)
    };
    let db = MemoryDatabase::new();
    let result = run_capture(
        &config,
        db.clone(),
        Arc::new(MemorySink::new()),
        &CheckpointManager::new(CheckpointConfig::disabled()),
        CancellationToken::new(),
    )
    .await;
    assert!(result.is_err());
    assert_eq!(db.log_len().await, 0);
}

// =============================================================================
// Checkpoint files
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_capture_leaves_readable_checkpoints() {
    let dir = tempfile::tempdir().unwrap();
    let config = small_config(2, 50);
    let checkpoints = CheckpointManager::new(CheckpointConfig::filesystem(
        dir.path().to_string_lossy(),
    ));

    let report = run_capture(
        &config,
        MemoryDatabase::new(),
        Arc::new(MemorySink::new()),
        &checkpoints,
        CancellationToken::new(),
    )
    .await
    .unwrap();
    assert!(report.checkpoints_emitted >= 2);

    let latest = latest_checkpoint(dir.path(), None).await.unwrap();
    assert_eq!(latest.file.phase(), &SyncPhase::Stream);
    assert_eq!(latest.state.splits.len(), report.snapshot_splits);
    assert_eq!(latest.state.tables.len(), 2);
}
