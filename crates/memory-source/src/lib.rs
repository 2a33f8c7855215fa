//! In-memory source for chunk-sync.
//!
//! [`MemoryDatabase`] keeps tables and a change log in process memory and
//! implements both [`sync_core::SourceConnection`] and
//! [`sync_core::SplitKeySource`], so the whole capture protocol can run
//! without a real database. Faults can be injected into chunk reads and
//! stream reads. [`MemorySink`] collects output records.

mod database;
mod sink;

pub use database::{MemoryChangeStream, MemoryDatabase};
pub use sink::{materialize, MemorySink};

/// Build a row image from `(column, value)` pairs.
pub fn fields<I, K>(pairs: I) -> sync_core::Fields
where
    I: IntoIterator<Item = (K, serde_json::Value)>,
    K: Into<String>,
{
    pairs.into_iter().map(|(k, v)| (k.into(), v)).collect()
}
