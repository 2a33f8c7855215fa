//! Checkpoint storage configuration.

/// Where checkpoints are written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckpointStorage {
    /// No backend configured.
    Disabled,
    /// JSON files in a directory.
    Filesystem { dir: String },
    /// Process memory; lost on exit.
    Memory,
}

/// Controls checkpoint emission and storage behavior.
#[derive(Debug, Clone)]
pub struct CheckpointConfig {
    /// Whether to emit checkpoints at all.
    pub emit_checkpoints: bool,

    pub storage: CheckpointStorage,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            emit_checkpoints: true,
            storage: CheckpointStorage::Filesystem {
                dir: ".chunk-sync-checkpoints".to_string(),
            },
        }
    }
}

impl CheckpointConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filesystem(dir: impl Into<String>) -> Self {
        Self {
            emit_checkpoints: true,
            storage: CheckpointStorage::Filesystem { dir: dir.into() },
        }
    }

    pub fn memory() -> Self {
        Self {
            emit_checkpoints: true,
            storage: CheckpointStorage::Memory,
        }
    }

    pub fn disabled() -> Self {
        Self {
            emit_checkpoints: false,
            storage: CheckpointStorage::Disabled,
        }
    }

    /// Check if checkpoint emission is enabled and a backend is configured.
    pub fn should_emit_checkpoints(&self) -> bool {
        self.emit_checkpoints && self.storage != CheckpointStorage::Disabled
    }
}
