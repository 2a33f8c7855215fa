//! chunk-sync
//!
//! Captures tables without locking them: each table is cut into key-range
//! chunks that several readers copy in parallel, and a single reader then
//! tails the change stream. Every chunk is bracketed by a low and a high
//! watermark read from the change stream, so the copied rows plus the
//! changes between the two watermarks give the chunk's contents as of its
//! high watermark. The stream reader drops changes already covered by a
//! finished chunk.
//!
//! # Crates
//!
//! - `sync_core` - offsets, splits, rows and the source/sink traits
//! - `chunk_sync_splitter` - cuts a table into chunks by key distribution
//! - `chunk_sync_enumerator` - split assignment and the metadata exchange
//! - `chunk_sync_reader` - watermark reconciliation and stream filtering
//! - `chunk_sync_memory_source` - in-memory source with a change log
//! - `checkpoint` - durable enumerator state
//!
//! # CLI Usage
//!
//! ```bash
//! # Capture two seeded tables with 4 readers while 500 random changes run
//! chunk-sync run --tables shop.orders,shop.items --rows 20000 --readers 4 --mutations 500
//!
//! # Inspect the last enumerator checkpoint
//! chunk-sync checkpoint show --dir .chunk-sync-checkpoints
//! ```

pub mod capture;
pub mod checkpoint;
pub mod config;
pub mod sink;
pub mod workload;

pub use capture::{run_capture, CaptureReport};
pub use config::{CaptureConfig, TableConfig, WorkloadConfig};
pub use sink::JsonlSink;
