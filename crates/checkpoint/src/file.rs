//! Checkpoint file wrapper for storage-agnostic serialization.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Checkpoint, SyncPhase};

/// Storage-agnostic checkpoint file wrapper.
///
/// # File Format
///
/// ```json
/// {
///     "kind": "split-enumerator",
///     "checkpoint": { "tables": ["shop.orders"], "splits": [...], ... },
///     "phase": "Snapshot",
///     "created_at": "2024-01-01T00:00:00Z"
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointFile {
    /// Checkpoint type identifier
    pub kind: String,
    /// Serialized checkpoint data as JSON Value
    pub checkpoint: serde_json::Value,
    /// Sync phase when this checkpoint was created
    pub phase: SyncPhase,
    /// Timestamp when this checkpoint file was created
    pub created_at: DateTime<Utc>,
}

impl CheckpointFile {
    pub fn new<C: Checkpoint>(checkpoint: &C, phase: SyncPhase) -> anyhow::Result<Self> {
        Ok(Self {
            kind: C::KIND.to_string(),
            checkpoint: serde_json::to_value(checkpoint)?,
            phase,
            created_at: Utc::now(),
        })
    }

    /// Parse checkpoint into its concrete type.
    ///
    /// Fails if the stored `kind` doesn't match `C::KIND` or the data can't be
    /// deserialized into `C`.
    pub fn parse<C: Checkpoint>(&self) -> anyhow::Result<C> {
        if self.kind != C::KIND {
            anyhow::bail!(
                "Checkpoint type mismatch: expected '{}', found '{}'",
                C::KIND,
                self.kind
            );
        }
        Ok(serde_json::from_value(self.checkpoint.clone())?)
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn phase(&self) -> &SyncPhase {
        &self.phase
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}
