//! Capture phase enumeration for checkpoint tracking.

use serde::{Deserialize, Serialize};

/// Phase of a capture run a checkpoint was taken in.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyncPhase {
    /// Chunks are still being read. A checkpoint taken here records which
    /// chunks finished and with which watermarks; unfinished chunks are
    /// re-read after restore.
    Snapshot,

    /// Every chunk finished and the stream split exists. Restoring from here
    /// resumes tailing the change stream.
    Stream,
}

impl SyncPhase {
    /// Used in checkpoint file names (e.g. `checkpoint_snapshot_20240101T000000Z.json`).
    pub fn as_str(&self) -> &str {
        match self {
            SyncPhase::Snapshot => "snapshot",
            SyncPhase::Stream => "stream",
        }
    }

    pub fn parse(phase: &str) -> anyhow::Result<Self> {
        match phase {
            "snapshot" => Ok(SyncPhase::Snapshot),
            "stream" => Ok(SyncPhase::Stream),
            other => Err(anyhow::anyhow!("Unknown sync phase: {other}")),
        }
    }
}

impl std::fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
