//! Checkpoint helpers for the command line.
//!
//! Reads the enumerator checkpoints a capture left in a directory.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use ::checkpoint::{Checkpoint, CheckpointFile, FilesystemStore, SyncPhase};
use chunk_sync_enumerator::EnumeratorCheckpoint;

/// One stored enumerator checkpoint.
#[derive(Debug, Clone)]
pub struct FoundCheckpoint {
    pub path: PathBuf,
    pub file: CheckpointFile,
    pub state: EnumeratorCheckpoint,
}

/// Every enumerator checkpoint in `dir`, oldest first, optionally limited to
/// one phase.
pub async fn list_checkpoints(
    dir: &Path,
    phase: Option<SyncPhase>,
) -> Result<Vec<FoundCheckpoint>> {
    let store = FilesystemStore::new(dir);
    let mut found = Vec::new();
    for (path, stored) in store.list().await? {
        if stored.kind != EnumeratorCheckpoint::KIND {
            continue;
        }
        let file = stored
            .into_file()
            .with_context(|| format!("Invalid checkpoint file {}", path.display()))?;
        if phase.as_ref().is_some_and(|p| p != file.phase()) {
            continue;
        }
        let state = file
            .parse::<EnumeratorCheckpoint>()
            .with_context(|| format!("Invalid enumerator state in {}", path.display()))?;
        found.push(FoundCheckpoint { path, file, state });
    }
    Ok(found)
}

/// The newest enumerator checkpoint in `dir`.
///
/// # Errors
/// Fails if the directory holds no matching checkpoint.
pub async fn latest_checkpoint(dir: &Path, phase: Option<SyncPhase>) -> Result<FoundCheckpoint> {
    list_checkpoints(dir, phase.clone())
        .await?
        .pop()
        .ok_or_else(|| match phase {
            Some(phase) => anyhow::anyhow!(
                "No {} checkpoint found in {}",
                phase,
                dir.display()
            ),
            None => anyhow::anyhow!("No checkpoint files found in {}", dir.display()),
        })
}
