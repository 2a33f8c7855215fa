//! Process-local checkpoint storage.

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use crate::store::{CheckpointID, CheckpointStore, StoredCheckpoint};

/// Keeps the latest checkpoint per id in memory. Used for runs that do not
/// need to survive a restart and in tests.
#[derive(Default)]
pub struct MemoryStore {
    latest: RwLock<HashMap<CheckpointID, StoredCheckpoint>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for MemoryStore {
    async fn store_checkpoint(&self, id: &CheckpointID, checkpoint_data: String) -> Result<()> {
        let stored = StoredCheckpoint {
            checkpoint_data,
            kind: id.kind.clone(),
            phase: id.phase.clone(),
            created_at: Utc::now(),
        };
        self.latest.write().await.insert(id.clone(), stored);
        Ok(())
    }

    async fn read_checkpoint(&self, id: &CheckpointID) -> Result<Option<StoredCheckpoint>> {
        Ok(self.latest.read().await.get(id).cloned())
    }
}
