//! Enumerator configuration.

use chunk_sync_splitter::SplitterOptions;
use serde::{Deserialize, Serialize};

pub const DEFAULT_SPLIT_META_GROUP_SIZE: usize = 1000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnumeratorOptions {
    pub splitter: SplitterOptions,
    /// Finished-split entries per metadata response group.
    pub split_meta_group_size: usize,
}

impl Default for EnumeratorOptions {
    fn default() -> Self {
        Self {
            splitter: SplitterOptions::default(),
            split_meta_group_size: DEFAULT_SPLIT_META_GROUP_SIZE,
        }
    }
}
