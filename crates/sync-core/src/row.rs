//! Rows, change events and output records.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::offset::Offset;
use crate::schema::{TableId, TableSchema};

/// Value of a single-column key. Ordered; a table only ever uses one variant.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeyValue {
    Int(i64),
    Text(String),
}

impl fmt::Display for KeyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyValue::Int(v) => write!(f, "{v}"),
            KeyValue::Text(v) => f.write_str(v),
        }
    }
}

impl From<i64> for KeyValue {
    fn from(v: i64) -> Self {
        KeyValue::Int(v)
    }
}

impl From<&str> for KeyValue {
    fn from(v: &str) -> Self {
        KeyValue::Text(v.to_string())
    }
}

/// Column name to value.
pub type Fields = BTreeMap<String, serde_json::Value>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    pub key: KeyValue,
    pub fields: Fields,
}

impl Row {
    pub fn new(key: impl Into<KeyValue>, fields: Fields) -> Self {
        Self {
            key: key.into(),
            fields,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeOp {
    Insert,
    Update,
    Delete,
}

/// A row-level change read from the change stream. `after` is the full row
/// image for inserts and updates and `None` for deletes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub table_id: TableId,
    pub op: ChangeOp,
    pub key: KeyValue,
    pub after: Option<Fields>,
    pub offset: Offset,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatermarkKind {
    Low,
    High,
}

/// Anything the change stream can yield.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Change(ChangeEvent),
    /// Marker written by a snapshot reader around its chunk read.
    Watermark {
        split_id: String,
        kind: WatermarkKind,
        offset: Offset,
    },
    SchemaChange {
        schema: TableSchema,
        offset: Offset,
    },
}

impl StreamEvent {
    pub fn offset(&self) -> &Offset {
        match self {
            StreamEvent::Change(event) => &event.offset,
            StreamEvent::Watermark { offset, .. } | StreamEvent::SchemaChange { offset, .. } => {
                offset
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordOrigin {
    Snapshot,
    Stream,
}

/// One record of the unified downstream sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputRecord {
    pub table_id: TableId,
    pub op: ChangeOp,
    pub key: KeyValue,
    pub fields: Option<Fields>,
    pub offset: Offset,
    pub origin: RecordOrigin,
}

impl OutputRecord {
    /// Snapshot rows are delivered as inserts stamped with the chunk's high
    /// watermark.
    pub fn snapshot(table_id: TableId, row: Row, high_watermark: Offset) -> Self {
        Self {
            table_id,
            op: ChangeOp::Insert,
            key: row.key,
            fields: Some(row.fields),
            offset: high_watermark,
            origin: RecordOrigin::Snapshot,
        }
    }

    pub fn stream(event: ChangeEvent) -> Self {
        Self {
            table_id: event.table_id,
            op: event.op,
            key: event.key,
            fields: event.after,
            offset: event.offset,
            origin: RecordOrigin::Stream,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_value_ordering_and_json() {
        assert!(KeyValue::Int(-1) < KeyValue::Int(0));
        assert!(KeyValue::from("a") < KeyValue::from("b"));
        assert_eq!(serde_json::to_string(&KeyValue::Int(7)).unwrap(), "7");
        let text: KeyValue = serde_json::from_str("\"abc\"").unwrap();
        assert_eq!(text, KeyValue::from("abc"));
    }

    #[test]
    fn test_snapshot_record_uses_high_watermark() {
        let row = Row::new(3i64, Fields::from([("v".to_string(), serde_json::json!("x"))]));
        let record = OutputRecord::snapshot(TableId::from("t"), row, Offset::sequence(12));
        assert_eq!(record.op, ChangeOp::Insert);
        assert_eq!(record.offset, Offset::sequence(12));
        assert_eq!(record.origin, RecordOrigin::Snapshot);
    }
}
