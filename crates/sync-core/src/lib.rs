//! Core types for chunk-sync.
//!
//! This crate provides the vocabulary shared by the splitter, the split
//! enumerator and the readers:
//!
//! - [`Offset`] / [`OffsetFactory`] - ordered change-stream positions
//! - [`ChunkDescriptor`], [`SnapshotSplit`], [`StreamSplit`] - units of work
//! - [`MetaRequestEvent`] / [`MetaResponseGroup`] - finished-split metadata pages
//! - [`Row`], [`ChangeEvent`], [`StreamEvent`], [`OutputRecord`] - data in flight
//! - [`SourceConnection`], [`SplitKeySource`], [`RecordSink`] - driver seams
//! - [`SyncError`] - the error type every component returns
//!
//! # Architecture
//!
//! ```text
//! sync-core (this crate)
//!    │
//!    ├─── chunk-sync-splitter     (plans chunk boundaries)
//!    ├─── chunk-sync-enumerator   (assigns splits, serves metadata)
//!    ├─── chunk-sync-reader       (watermark reconciliation, stream filter)
//!    └─── chunk-sync-memory-source (in-memory driver for tests and demos)
//! ```

pub mod error;
pub mod offset;
pub mod row;
pub mod schema;
pub mod sink;
pub mod source;
pub mod split;

pub use error::{Result, SyncError};
pub use offset::{BinlogPosition, Bounded, Construction, Offset, OffsetFactory, OffsetKind};
pub use row::{
    ChangeEvent, ChangeOp, Fields, KeyValue, OutputRecord, RecordOrigin, Row, StreamEvent,
    WatermarkKind,
};
pub use schema::{ColumnDef, ColumnType, TableId, TableSchema};
pub use sink::RecordSink;
pub use source::{ChangeStream, SourceConnection, SplitKeySource};
pub use split::{
    ChunkDescriptor, FinishedSplitInfo, MetaRequestEvent, MetaResponseGroup, SnapshotSplit,
    StreamSplit, STREAM_SPLIT_ID,
};
