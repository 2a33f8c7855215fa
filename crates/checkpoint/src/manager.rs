//! Checkpoint manager: picks a store from configuration and moves typed
//! checkpoints in and out of it.

use std::sync::Arc;

use crate::{
    store::CheckpointStore, Checkpoint, CheckpointConfig, CheckpointFile, CheckpointID,
    CheckpointStorage, FilesystemStore, MemoryStore, SyncPhase,
};

/// # Example
///
/// ```rust,ignore
/// use checkpoint::{CheckpointConfig, CheckpointManager, SyncPhase};
///
/// let manager = CheckpointManager::new(CheckpointConfig::filesystem("/tmp/checkpoints"));
/// manager.emit_checkpoint(&enumerator_state, SyncPhase::Snapshot).await?;
/// let restored: Option<EnumeratorCheckpoint> =
///     manager.read_checkpoint(SyncPhase::Snapshot).await?;
/// ```
pub struct CheckpointManager {
    config: CheckpointConfig,
    store: Option<Arc<dyn CheckpointStore>>,
}

impl CheckpointManager {
    pub fn new(config: CheckpointConfig) -> Self {
        let store: Option<Arc<dyn CheckpointStore>> = match &config.storage {
            CheckpointStorage::Disabled => None,
            CheckpointStorage::Filesystem { dir } => Some(Arc::new(FilesystemStore::new(dir))),
            CheckpointStorage::Memory => Some(Arc::new(MemoryStore::new())),
        };
        Self { config, store }
    }

    /// Use an explicit store, e.g. one shared with another manager.
    pub fn with_store(config: CheckpointConfig, store: Arc<dyn CheckpointStore>) -> Self {
        Self {
            config,
            store: Some(store),
        }
    }

    pub fn config(&self) -> &CheckpointConfig {
        &self.config
    }

    /// Save a checkpoint. A no-op when emission is turned off.
    ///
    /// # Errors
    ///
    /// Fails if emission is on but no backend is configured, or the backend
    /// write fails.
    pub async fn emit_checkpoint<C: Checkpoint>(
        &self,
        checkpoint: &C,
        phase: SyncPhase,
    ) -> anyhow::Result<()> {
        if !self.config.emit_checkpoints {
            return Ok(());
        }
        let store = self.store.as_ref().ok_or_else(|| {
            anyhow::anyhow!("No checkpoint store configured (checkpoint storage is disabled)")
        })?;

        let id = CheckpointID {
            kind: C::KIND.to_string(),
            phase: phase.as_str().to_string(),
        };
        store
            .store_checkpoint(&id, serde_json::to_string(checkpoint)?)
            .await?;

        tracing::info!("Emitted {} checkpoint: {}", phase, checkpoint.summary());
        Ok(())
    }

    /// Latest checkpoint of type `C` for `phase`, without parsing it.
    pub async fn read_latest_checkpoint<C: Checkpoint>(
        &self,
        phase: SyncPhase,
    ) -> anyhow::Result<Option<CheckpointFile>> {
        let Some(store) = self.store.as_ref() else {
            return Ok(None);
        };
        let id = CheckpointID {
            kind: C::KIND.to_string(),
            phase: phase.as_str().to_string(),
        };
        store
            .read_checkpoint(&id)
            .await?
            .map(|stored| stored.into_file())
            .transpose()
    }

    /// Read and parse the latest checkpoint of type `C` for `phase`.
    pub async fn read_checkpoint<C: Checkpoint>(
        &self,
        phase: SyncPhase,
    ) -> anyhow::Result<Option<C>> {
        self.read_latest_checkpoint::<C>(phase)
            .await?
            .map(|file| file.parse::<C>())
            .transpose()
    }
}
