//! Checkpoint storage trait and types
//!
//! This module defines the CheckpointStore trait for backend-agnostic
//! checkpoint storage operations, plus shared types.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{CheckpointFile, SyncPhase};

/// Checkpoint identifier for storage
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CheckpointID {
    /// Checkpoint type (e.g. "split-enumerator")
    pub kind: String,
    /// Sync phase ("snapshot" or "stream")
    pub phase: String,
}

/// Checkpoint data stored in backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredCheckpoint {
    /// JSON-serialized checkpoint
    pub checkpoint_data: String,
    /// Checkpoint type for validation
    pub kind: String,
    /// Sync phase for validation
    pub phase: String,
    /// Timestamp when checkpoint was created
    pub created_at: DateTime<Utc>,
}

impl StoredCheckpoint {
    /// Convert into the storage-agnostic file form.
    pub fn into_file(self) -> Result<CheckpointFile> {
        Ok(CheckpointFile {
            kind: self.kind,
            checkpoint: serde_json::from_str(&self.checkpoint_data)?,
            phase: SyncPhase::parse(&self.phase)?,
            created_at: self.created_at,
        })
    }
}

/// Trait for checkpoint storage operations.
///
/// Implemented by:
/// - Filesystem storage (`FilesystemStore`)
/// - Process-local storage (`MemoryStore`)
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Store a checkpoint in the storage backend.
    async fn store_checkpoint(&self, id: &CheckpointID, checkpoint_data: String) -> Result<()>;

    /// Read the latest checkpoint for `id`.
    ///
    /// Returns None if the checkpoint doesn't exist.
    async fn read_checkpoint(&self, id: &CheckpointID) -> Result<Option<StoredCheckpoint>>;
}
