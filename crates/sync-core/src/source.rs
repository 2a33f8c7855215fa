//! Interfaces a concrete database driver implements to take part in capture.
//!
//! The capture core never issues SQL itself. It asks a [`SourceConnection`]
//! for chunk reads, stream positions and change streams, and a
//! [`SplitKeySource`] for the key statistics the splitter needs.

use async_trait::async_trait;

use crate::error::Result;
use crate::offset::{Offset, OffsetKind};
use crate::row::{KeyValue, Row, StreamEvent, WatermarkKind};
use crate::schema::{TableId, TableSchema};
use crate::split::ChunkDescriptor;

/// A stream of change-log events starting at some offset.
#[async_trait]
pub trait ChangeStream: Send {
    /// Next event, or `None` once the stream is closed. Live streams wait for
    /// new events instead of returning `None`.
    async fn next(&mut self) -> Option<Result<StreamEvent>>;
}

#[async_trait]
pub trait SourceConnection: Send + Sync {
    /// Kind of offsets this source produces.
    fn offset_kind(&self) -> OffsetKind;

    async fn table_schema(&self, table: &TableId) -> Result<TableSchema>;

    /// Consistent read of every row in the chunk's key range, ordered by key.
    async fn read_chunk(&self, chunk: &ChunkDescriptor) -> Result<Vec<Row>>;

    async fn current_stream_position(&self) -> Result<Offset>;

    /// Record a watermark for `split_id` and return its offset. Sources that
    /// can write a marker into the change log override this; the default uses
    /// the current stream position.
    async fn signal_watermark(&self, _split_id: &str, _kind: WatermarkKind) -> Result<Offset> {
        self.current_stream_position().await
    }

    /// Open the change stream at `offset`. Every event at or after `offset` is
    /// yielded in log order.
    async fn stream_from(&self, offset: &Offset) -> Result<Box<dyn ChangeStream>>;
}

/// Key statistics used to plan chunk boundaries.
#[async_trait]
pub trait SplitKeySource: Send + Sync {
    /// Minimum and maximum key, or `None` for an empty table.
    async fn query_min_max(&self, table: &TableId, column: &str)
        -> Result<Option<(KeyValue, KeyValue)>>;

    async fn approximate_row_count(&self, table: &TableId) -> Result<u64>;

    /// Largest key among the next `chunk_size` keys at or above `start`.
    async fn query_next_chunk_max(
        &self,
        table: &TableId,
        column: &str,
        chunk_size: usize,
        start: &KeyValue,
    ) -> Result<Option<KeyValue>>;

    /// Smallest key strictly greater than `value`.
    async fn query_min_above(
        &self,
        table: &TableId,
        column: &str,
        value: &KeyValue,
    ) -> Result<Option<KeyValue>>;
}
