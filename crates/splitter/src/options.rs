//! Splitter tuning knobs.

use serde::{Deserialize, Serialize};
use sync_core::{Result, SyncError};

pub const DEFAULT_CHUNK_SIZE: usize = 8096;
pub const DEFAULT_DISTRIBUTION_FACTOR_UPPER: f64 = 1000.0;
pub const DEFAULT_DISTRIBUTION_FACTOR_LOWER: f64 = 0.05;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SplitterOptions {
    /// Approximate number of rows per chunk.
    pub chunk_size: usize,
    /// Upper bound of `(max - min + 1) / row_count` for which an integer key
    /// is treated as evenly distributed.
    pub distribution_factor_upper: f64,
    /// Lower bound of the same factor.
    pub distribution_factor_lower: f64,
    /// Split on this primary key column instead of the declared one.
    pub chunk_key_column: Option<String>,
}

impl Default for SplitterOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            distribution_factor_upper: DEFAULT_DISTRIBUTION_FACTOR_UPPER,
            distribution_factor_lower: DEFAULT_DISTRIBUTION_FACTOR_LOWER,
            chunk_key_column: None,
        }
    }
}

impl SplitterOptions {
    pub fn with_chunk_size(chunk_size: usize) -> Self {
        Self {
            chunk_size,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(SyncError::config("chunk size must be at least 1"));
        }
        if self.distribution_factor_lower > self.distribution_factor_upper {
            return Err(SyncError::config(format!(
                "distribution factor lower bound {} exceeds upper bound {}",
                self.distribution_factor_lower, self.distribution_factor_upper
            )));
        }
        Ok(())
    }
}
