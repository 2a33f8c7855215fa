//! Unit tests for the checkpoint crate.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tempfile::TempDir;

use crate::{
    Checkpoint, CheckpointConfig, CheckpointFile, CheckpointID, CheckpointManager,
    CheckpointStore, FilesystemStore, MemoryStore, SyncPhase,
};

/// Minimal checkpoint type exercising the trait without a coordinator.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
struct TestCheckpoint {
    finished: u32,
    stream_started: bool,
}

impl Checkpoint for TestCheckpoint {
    const KIND: &'static str = "test";

    fn to_cli_string(&self) -> String {
        format!("{}:{}", self.finished, self.stream_started)
    }

    fn from_cli_string(s: &str) -> anyhow::Result<Self> {
        let (finished, stream) = s.split_once(':').ok_or_else(|| {
            anyhow::anyhow!("Invalid test checkpoint format: expected 'finished:stream'")
        })?;
        Ok(Self {
            finished: finished.parse()?,
            stream_started: stream.parse()?,
        })
    }
}

fn checkpoint(finished: u32) -> TestCheckpoint {
    TestCheckpoint {
        finished,
        stream_started: false,
    }
}

// ============================================================================
// CheckpointFile Tests
// ============================================================================

#[test]
fn test_checkpoint_file_roundtrip() {
    let original = checkpoint(12);
    let file = CheckpointFile::new(&original, SyncPhase::Stream).unwrap();
    assert_eq!(file.kind(), "test");
    assert_eq!(file.phase(), &SyncPhase::Stream);

    let json = serde_json::to_string_pretty(&file).unwrap();
    let loaded: CheckpointFile = serde_json::from_str(&json).unwrap();
    let parsed: TestCheckpoint = loaded.parse().unwrap();
    assert_eq!(parsed, original);
}

#[test]
fn test_checkpoint_type_mismatch() {
    let mut file = CheckpointFile::new(&checkpoint(1), SyncPhase::Snapshot).unwrap();
    file.kind = "wrong".to_string();

    let err = file.parse::<TestCheckpoint>().unwrap_err().to_string();
    assert!(err.contains("type mismatch"));
    assert!(err.contains("expected 'test'"));
    assert!(err.contains("found 'wrong'"));
}

// ============================================================================
// SyncPhase Tests
// ============================================================================

#[test]
fn test_sync_phase_strings() {
    assert_eq!(SyncPhase::Snapshot.as_str(), "snapshot");
    assert_eq!(SyncPhase::Stream.to_string(), "stream");
    assert_eq!(SyncPhase::parse("stream").unwrap(), SyncPhase::Stream);
    assert!(SyncPhase::parse("full_sync_start").is_err());
}

// ============================================================================
// Config Tests
// ============================================================================

#[test]
fn test_checkpoint_config_should_emit() {
    assert!(CheckpointConfig::default().should_emit_checkpoints());
    assert!(CheckpointConfig::memory().should_emit_checkpoints());
    assert!(!CheckpointConfig::disabled().should_emit_checkpoints());

    let mut config = CheckpointConfig::filesystem("/tmp/x");
    config.emit_checkpoints = false;
    assert!(!config.should_emit_checkpoints());
}

// ============================================================================
// Store Tests
// ============================================================================

#[tokio::test]
async fn test_filesystem_store_returns_latest_for_phase() {
    let tmp = TempDir::new().unwrap();
    let store = FilesystemStore::new(tmp.path());
    let snapshot = CheckpointID {
        kind: "test".to_string(),
        phase: "snapshot".to_string(),
    };
    let stream = CheckpointID {
        kind: "test".to_string(),
        phase: "stream".to_string(),
    };

    store.store_checkpoint(&snapshot, "1".to_string()).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    store.store_checkpoint(&snapshot, "2".to_string()).await.unwrap();
    store.store_checkpoint(&stream, "3".to_string()).await.unwrap();

    let latest = store.read_checkpoint(&snapshot).await.unwrap().unwrap();
    assert_eq!(latest.checkpoint_data, "2");
    let latest = store.read_checkpoint(&stream).await.unwrap().unwrap();
    assert_eq!(latest.checkpoint_data, "3");
    assert_eq!(store.list().await.unwrap().len(), 3);
}

#[tokio::test]
async fn test_filesystem_store_missing_dir_reads_none() {
    let tmp = TempDir::new().unwrap();
    let store = FilesystemStore::new(tmp.path().join("absent"));
    let id = CheckpointID {
        kind: "test".to_string(),
        phase: "snapshot".to_string(),
    };
    assert!(store.read_checkpoint(&id).await.unwrap().is_none());
}

// ============================================================================
// CheckpointManager Tests
// ============================================================================

#[tokio::test]
async fn test_manager_emit_and_read_filesystem() {
    let tmp = TempDir::new().unwrap();
    let manager = CheckpointManager::new(CheckpointConfig::filesystem(
        tmp.path().to_string_lossy().to_string(),
    ));

    manager
        .emit_checkpoint(&checkpoint(4), SyncPhase::Snapshot)
        .await
        .unwrap();

    let read: TestCheckpoint = manager
        .read_checkpoint(SyncPhase::Snapshot)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(read, checkpoint(4));

    let none: Option<TestCheckpoint> = manager.read_checkpoint(SyncPhase::Stream).await.unwrap();
    assert!(none.is_none());
}

#[tokio::test]
async fn test_manager_memory_keeps_latest() {
    let manager = CheckpointManager::new(CheckpointConfig::memory());
    for finished in [1, 2, 3] {
        manager
            .emit_checkpoint(&checkpoint(finished), SyncPhase::Snapshot)
            .await
            .unwrap();
    }
    let read: TestCheckpoint = manager
        .read_checkpoint(SyncPhase::Snapshot)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(read.finished, 3);
}

#[tokio::test]
async fn test_manager_emit_disabled_is_noop() {
    let manager = CheckpointManager::new(CheckpointConfig::disabled());
    manager
        .emit_checkpoint(&checkpoint(1), SyncPhase::Snapshot)
        .await
        .unwrap();
    let read: Option<TestCheckpoint> = manager.read_checkpoint(SyncPhase::Snapshot).await.unwrap();
    assert!(read.is_none());
}

#[tokio::test]
async fn test_manager_emit_without_store_fails() {
    let config = CheckpointConfig {
        emit_checkpoints: true,
        storage: crate::CheckpointStorage::Disabled,
    };
    let manager = CheckpointManager::new(config);
    let err = manager
        .emit_checkpoint(&checkpoint(1), SyncPhase::Snapshot)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("No checkpoint store configured"));
}

#[tokio::test]
async fn test_manager_shared_store() {
    let store = Arc::new(MemoryStore::new());
    let writer = CheckpointManager::with_store(CheckpointConfig::memory(), store.clone());
    let reader = CheckpointManager::with_store(CheckpointConfig::memory(), store);

    writer
        .emit_checkpoint(&checkpoint(9), SyncPhase::Stream)
        .await
        .unwrap();
    let read: TestCheckpoint = reader
        .read_checkpoint(SyncPhase::Stream)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(read.finished, 9);
}

// ============================================================================
// CLI string Tests
// ============================================================================

#[test]
fn test_checkpoint_cli_string_roundtrip() {
    let cp = TestCheckpoint {
        finished: 7,
        stream_started: true,
    };
    let parsed = TestCheckpoint::from_cli_string(&cp.to_cli_string()).unwrap();
    assert_eq!(parsed, cp);
    assert_eq!(cp.summary(), "7:true");
    assert!(TestCheckpoint::from_cli_string("garbage").is_err());
}
