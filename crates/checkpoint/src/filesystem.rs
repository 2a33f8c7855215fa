//! Filesystem-based checkpoint storage implementation.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::path::{Path, PathBuf};

use crate::store::{CheckpointID, CheckpointStore, StoredCheckpoint};

/// Stores checkpoints as JSON files named
/// `checkpoint_{phase}_{timestamp}.json`. Reads return the newest file for
/// the requested phase and kind.
pub struct FilesystemStore {
    dir: PathBuf,
}

impl FilesystemStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Every checkpoint file in the directory, oldest first.
    pub async fn list(&self) -> Result<Vec<(PathBuf, StoredCheckpoint)>> {
        let mut found = Vec::new();
        if !tokio::fs::try_exists(&self.dir).await? {
            return Ok(found);
        }
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_checkpoint = path
                .file_name()
                .and_then(|name| name.to_str())
                .map(|name| name.starts_with("checkpoint_") && name.ends_with(".json"))
                .unwrap_or(false);
            if !is_checkpoint {
                continue;
            }
            let content = tokio::fs::read_to_string(&path)
                .await
                .with_context(|| format!("Failed to read {}", path.display()))?;
            let stored: StoredCheckpoint = serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse {}", path.display()))?;
            found.push((path, stored));
        }
        found.sort_by_key(|(_, stored)| stored.created_at);
        Ok(found)
    }
}

#[async_trait]
impl CheckpointStore for FilesystemStore {
    async fn store_checkpoint(&self, id: &CheckpointID, checkpoint_data: String) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;

        let created_at = Utc::now();
        let stored = StoredCheckpoint {
            checkpoint_data,
            kind: id.kind.clone(),
            phase: id.phase.clone(),
            created_at,
        };

        let timestamp = created_at.format("%Y%m%dT%H%M%S%.6fZ");
        let filename = self
            .dir
            .join(format!("checkpoint_{}_{}.json", id.phase, timestamp));

        tokio::fs::write(&filename, serde_json::to_string_pretty(&stored)?).await?;
        tracing::info!("Stored checkpoint to {}", filename.display());
        Ok(())
    }

    async fn read_checkpoint(&self, id: &CheckpointID) -> Result<Option<StoredCheckpoint>> {
        let latest = self
            .list()
            .await?
            .into_iter()
            .rev()
            .map(|(_, stored)| stored)
            .find(|stored| stored.phase == id.phase && stored.kind == id.kind);
        Ok(latest)
    }
}
