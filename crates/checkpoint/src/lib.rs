//! Checkpoint management for chunk-sync
//!
//! Provides storage-agnostic checkpoint file handling for any state that
//! implements the [`Checkpoint`] trait (in practice, the split enumerator's
//! assignment state).
//!
//! # Architecture
//!
//! - `Checkpoint` trait for typed checkpoint state
//! - `CheckpointFile` wrapper for storage-agnostic serialization
//! - `CheckpointManager` for saving/loading against a configured backend
//! - `CheckpointStore` trait for storage backends
//!
//! ## Storage Backends
//!
//! - `FilesystemStore` - Stores checkpoints as JSON files
//! - `MemoryStore` - Keeps the latest checkpoint in process memory

mod config;
mod file;
mod filesystem;
mod manager;
mod memory;
mod phase;
pub mod store;

#[cfg(test)]
mod tests;

pub use config::{CheckpointConfig, CheckpointStorage};
pub use file::CheckpointFile;
pub use filesystem::FilesystemStore;
pub use manager::CheckpointManager;
pub use memory::MemoryStore;
pub use phase::SyncPhase;
pub use store::{CheckpointID, CheckpointStore, StoredCheckpoint};

/// Trait that checkpointable state must implement.
///
/// # Example
///
/// ```rust
/// use checkpoint::Checkpoint;
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Debug, Clone, Serialize, Deserialize)]
/// pub struct ReaderPosition {
///     pub sequence: i64,
/// }
///
/// impl Checkpoint for ReaderPosition {
///     const KIND: &'static str = "reader-position";
///
///     fn to_cli_string(&self) -> String {
///         format!("sequence:{}", self.sequence)
///     }
///
///     fn from_cli_string(s: &str) -> anyhow::Result<Self> {
///         let seq = s
///             .strip_prefix("sequence:")
///             .ok_or_else(|| anyhow::anyhow!("Invalid checkpoint format"))?;
///         Ok(Self { sequence: seq.parse()? })
///     }
/// }
/// ```
pub trait Checkpoint: serde::Serialize + for<'de> serde::Deserialize<'de> + Clone {
    /// Checkpoint type identifier.
    ///
    /// Written into every stored checkpoint and validated on load.
    const KIND: &'static str;

    /// Convert to a short, human-readable string for CLI output and logs.
    fn to_cli_string(&self) -> String;

    /// Parse from CLI string format.
    ///
    /// Should parse the format produced by `to_cli_string()`.
    fn from_cli_string(s: &str) -> anyhow::Result<Self>
    where
        Self: Sized;

    /// One-line description for log output.
    fn summary(&self) -> String {
        self.to_cli_string()
    }
}
