//! Units of work handed out by the split enumerator.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::offset::Offset;
use crate::row::KeyValue;
use crate::schema::{TableId, TableSchema};

/// Split id of the single stream split.
pub const STREAM_SPLIT_ID: &str = "stream-split";

/// Key range `[split_key_start, split_key_end)` of one table chunk. A missing
/// start marks the first chunk, a missing end the last.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkDescriptor {
    pub table_id: TableId,
    pub chunk_id: u32,
    pub split_key_start: Option<KeyValue>,
    pub split_key_end: Option<KeyValue>,
}

impl ChunkDescriptor {
    pub fn new(
        table_id: TableId,
        chunk_id: u32,
        split_key_start: Option<KeyValue>,
        split_key_end: Option<KeyValue>,
    ) -> Self {
        Self {
            table_id,
            chunk_id,
            split_key_start,
            split_key_end,
        }
    }

    /// Single chunk covering the whole table.
    pub fn whole_table(table_id: TableId) -> Self {
        Self::new(table_id, 0, None, None)
    }

    pub fn split_id(&self) -> String {
        format!("{}:{}", self.table_id, self.chunk_id)
    }

    pub fn contains(&self, key: &KeyValue) -> bool {
        key_in_range(key, self.split_key_start.as_ref(), self.split_key_end.as_ref())
    }
}

fn key_in_range(key: &KeyValue, start: Option<&KeyValue>, end: Option<&KeyValue>) -> bool {
    start.map_or(true, |s| key >= s) && end.map_or(true, |e| key < e)
}

/// A chunk plus the watermarks recorded when it was read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotSplit {
    pub descriptor: ChunkDescriptor,
    pub low_watermark: Option<Offset>,
    pub high_watermark: Option<Offset>,
    pub finished: bool,
}

impl SnapshotSplit {
    pub fn new(descriptor: ChunkDescriptor) -> Self {
        Self {
            descriptor,
            low_watermark: None,
            high_watermark: None,
            finished: false,
        }
    }

    pub fn split_id(&self) -> String {
        self.descriptor.split_id()
    }

    pub fn table_id(&self) -> &TableId {
        &self.descriptor.table_id
    }
}

/// What the stream reader needs to know about one finished chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinishedSplitInfo {
    pub table_id: TableId,
    pub split_id: String,
    pub split_key_start: Option<KeyValue>,
    pub split_key_end: Option<KeyValue>,
    pub low_watermark: Offset,
    pub high_watermark: Offset,
}

impl FinishedSplitInfo {
    pub fn contains(&self, key: &KeyValue) -> bool {
        key_in_range(key, self.split_key_start.as_ref(), self.split_key_end.as_ref())
    }
}

/// The single unbounded split that tails the change stream once every chunk
/// has finished.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamSplit {
    pub split_id: String,
    pub starting_offset: Offset,
    pub ending_offset: Offset,
    pub table_schemas: BTreeMap<TableId, TableSchema>,
    pub finished_splits_info: Vec<FinishedSplitInfo>,
    pub total_finished_split_size: usize,
    pub is_suspended: bool,
}

impl StreamSplit {
    /// Copy without finished-split metadata; readers fetch it through the
    /// metadata exchange.
    pub fn to_stub(&self) -> Self {
        Self {
            finished_splits_info: Vec::new(),
            ..self.clone()
        }
    }

    pub fn is_complete(&self) -> bool {
        self.finished_splits_info.len() == self.total_finished_split_size
    }

    pub fn with_finished_splits(mut self, infos: Vec<FinishedSplitInfo>) -> Self {
        self.finished_splits_info = infos;
        self
    }
}

/// Reader to enumerator: "send me metadata group N of this split".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaRequestEvent {
    pub split_id: String,
    pub request_meta_group_id: usize,
}

/// Enumerator to reader: one bounded page of finished-split metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaResponseGroup {
    pub split_id: String,
    pub group_id: usize,
    pub total_groups: usize,
    pub entries: Vec<FinishedSplitInfo>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_id_format() {
        let chunk = ChunkDescriptor::new(TableId::from("db.orders"), 4, None, None);
        assert_eq!(chunk.split_id(), "db.orders:4");
    }

    #[test]
    fn test_half_open_range() {
        let chunk = ChunkDescriptor::new(
            TableId::from("t"),
            1,
            Some(KeyValue::Int(10)),
            Some(KeyValue::Int(20)),
        );
        assert!(chunk.contains(&KeyValue::Int(10)));
        assert!(chunk.contains(&KeyValue::Int(19)));
        assert!(!chunk.contains(&KeyValue::Int(20)));
        assert!(!chunk.contains(&KeyValue::Int(9)));

        let whole = ChunkDescriptor::whole_table(TableId::from("t"));
        assert!(whole.contains(&KeyValue::Int(i64::MIN)));
        assert!(whole.contains(&KeyValue::from("zzz")));
    }

    #[test]
    fn test_stub_drops_metadata_only() {
        let info = FinishedSplitInfo {
            table_id: TableId::from("t"),
            split_id: "t:0".to_string(),
            split_key_start: None,
            split_key_end: None,
            low_watermark: Offset::sequence(1),
            high_watermark: Offset::sequence(2),
        };
        let split = StreamSplit {
            split_id: STREAM_SPLIT_ID.to_string(),
            starting_offset: Offset::sequence(1),
            ending_offset: Offset::no_stopping(crate::OffsetKind::Sequence),
            table_schemas: BTreeMap::new(),
            finished_splits_info: vec![info.clone()],
            total_finished_split_size: 1,
            is_suspended: false,
        };
        let stub = split.to_stub();
        assert!(stub.finished_splits_info.is_empty());
        assert_eq!(stub.total_finished_split_size, 1);
        assert!(!stub.is_complete());
        assert!(stub.with_finished_splits(vec![info]).is_complete());
    }
}
