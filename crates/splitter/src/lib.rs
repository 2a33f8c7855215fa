//! Splits tables into bounded, ordered key-range chunks.
//!
//! Chunks of one table are contiguous and disjoint: the first has no lower
//! bound, the last no upper bound, and each chunk's end is the next chunk's
//! start. Boundaries are fixed from statistics read once; rows inserted later
//! land in existing ranges and are picked up by the change stream.

mod options;
mod splitter;

pub use options::{
    SplitterOptions, DEFAULT_CHUNK_SIZE, DEFAULT_DISTRIBUTION_FACTOR_LOWER,
    DEFAULT_DISTRIBUTION_FACTOR_UPPER,
};
pub use splitter::{distribution_factor, split_table, ChunkPlan, SplitterCursor, TableSplitter};
