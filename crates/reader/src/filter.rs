//! Stream-phase filtering against finished snapshot splits.

use std::collections::BTreeMap;

use sync_core::{
    ChangeEvent, FinishedSplitInfo, KeyValue, Offset, OutputRecord, Result, StreamEvent,
    StreamSplit, SyncError, TableId, TableSchema,
};
use tracing::{debug, info};

#[derive(Debug, Default)]
struct TableWatermarks {
    /// Finished chunks ordered by range start.
    chunks: Vec<FinishedSplitInfo>,
    max_high: Option<Offset>,
}

impl TableWatermarks {
    fn chunk_for(&self, key: &KeyValue) -> Option<&FinishedSplitInfo> {
        let after = self.chunks.partition_point(|info| {
            info.split_key_start
                .as_ref()
                .map_or(true, |start| start <= key)
        });
        after
            .checked_sub(1)
            .map(|i| &self.chunks[i])
            .filter(|info| info.contains(key))
    }
}

/// Decides which stream events reach the output once the snapshot is done.
///
/// A change is dropped when its key lies in a finished chunk and its offset
/// is at or below that chunk's high watermark: the chunk output already
/// contains it. Everything above the table's highest watermark passes.
#[derive(Debug)]
pub struct StreamFilter {
    schemas: BTreeMap<TableId, TableSchema>,
    tables: BTreeMap<TableId, TableWatermarks>,
}

impl StreamFilter {
    /// Build from a stream split whose finished-split metadata is complete.
    pub fn new(stream: &StreamSplit) -> Result<Self> {
        if !stream.is_complete() {
            return Err(SyncError::protocol(
                &stream.split_id,
                format!(
                    "stream split has {} of {} finished split entries",
                    stream.finished_splits_info.len(),
                    stream.total_finished_split_size
                ),
            ));
        }

        let mut tables: BTreeMap<TableId, TableWatermarks> = BTreeMap::new();
        for info in &stream.finished_splits_info {
            let table = tables.entry(info.table_id.clone()).or_default();
            let is_higher = match &table.max_high {
                Some(max) => info.high_watermark.is_after(max),
                None => true,
            };
            if is_higher {
                table.max_high = Some(info.high_watermark.clone());
            }
            table.chunks.push(info.clone());
        }
        for table in tables.values_mut() {
            table
                .chunks
                .sort_by(|a, b| a.split_key_start.cmp(&b.split_key_start));
        }

        info!(
            "Stream filter covers {} tables with {} finished splits",
            tables.len(),
            stream.finished_splits_info.len()
        );
        Ok(Self {
            schemas: stream.table_schemas.clone(),
            tables,
        })
    }

    /// Current schema of a captured table.
    pub fn schema(&self, table: &TableId) -> Option<&TableSchema> {
        self.schemas.get(table)
    }

    /// Whether a change for a captured table must be emitted.
    pub fn should_emit(&self, change: &ChangeEvent) -> bool {
        let Some(table) = self.tables.get(&change.table_id) else {
            return true;
        };
        if let Some(max) = &table.max_high {
            if change.offset.is_after(max) {
                return true;
            }
        }
        match table.chunk_for(&change.key) {
            Some(info) => change.offset.is_after(&info.high_watermark),
            None => true,
        }
    }

    /// Turn one stream event into at most one output record.
    ///
    /// Fails with [`SyncError::SchemaDrift`] when a captured table changes
    /// incompatibly.
    pub fn apply(&mut self, event: StreamEvent) -> Result<Option<OutputRecord>> {
        match event {
            StreamEvent::Watermark { .. } => Ok(None),
            StreamEvent::SchemaChange { schema, offset } => {
                if let Some(current) = self.schemas.get(&schema.table_id) {
                    current.check_compatible(&schema)?;
                    info!("Table {} schema changed at {}", schema.table_id, offset);
                    self.schemas.insert(schema.table_id.clone(), schema);
                }
                Ok(None)
            }
            StreamEvent::Change(change) => {
                if !self.schemas.contains_key(&change.table_id) {
                    return Ok(None);
                }
                if !self.should_emit(&change) {
                    debug!(
                        "Dropped change for {} key {} at {}, covered by snapshot",
                        change.table_id, change.key, change.offset
                    );
                    return Ok(None);
                }
                Ok(Some(OutputRecord::stream(change)))
            }
        }
    }
}
