//! Readers for chunk-sync.
//!
//! A [`SplitReader`] asks the split enumerator for work. Snapshot splits are
//! read between a low and a high watermark and reconciled with the change
//! events in between ([`read_snapshot_split`]), so every chunk is emitted as
//! of its high watermark. The stream split starts at the smallest low
//! watermark; [`StreamFilter`] drops the events that the chunk output already
//! covers.

mod filter;
mod meta;
mod options;
mod reader;
mod reconcile;

pub use filter::StreamFilter;
pub use meta::{fetch_finished_splits, MetaExchange, MetaGroupFetcher};
pub use options::{
    ReaderOptions, DEFAULT_MAX_CHUNK_RETRIES, DEFAULT_MAX_STREAM_RETRIES, DEFAULT_META_ATTEMPTS,
    DEFAULT_META_REQUEST_TIMEOUT,
};
pub use reader::{create_reader, ReaderSummary, SplitReader};
pub use reconcile::{read_snapshot_split, reconcile_chunk, ChunkOutput};
