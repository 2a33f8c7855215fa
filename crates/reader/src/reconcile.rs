//! Watermark-based chunk reconciliation.
//!
//! A chunk is read between two watermarks taken on the same connection:
//!
//! 1. low watermark at the current stream position
//! 2. consistent read of the chunk's key range
//! 3. high watermark
//! 4. bounded stream read of `[low, high]`
//!
//! Changes from step 4 whose key falls in the chunk are applied to the rows of
//! step 2, so the output reflects the chunk as of the high watermark no matter
//! where inside the window the read itself landed.

use std::collections::BTreeMap;

use sync_core::{
    ChangeEvent, ChangeOp, ChunkDescriptor, Fields, KeyValue, Offset, OutputRecord, Result, Row,
    SnapshotSplit, SourceConnection, StreamEvent, SyncError, WatermarkKind,
};
use tracing::debug;

/// Output of one chunk plus the watermarks to report.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkOutput {
    pub split_id: String,
    pub low_watermark: Offset,
    pub high_watermark: Offset,
    /// Insert records ordered by key, stamped with the high watermark.
    pub records: Vec<OutputRecord>,
    /// Number of in-window change events that touched the chunk.
    pub applied_changes: usize,
}

/// Apply `changes` to `rows` in stream order. Changes for keys outside
/// `chunk`, or for another table, are ignored.
pub fn reconcile_chunk(
    chunk: &ChunkDescriptor,
    rows: Vec<Row>,
    changes: &[ChangeEvent],
) -> Vec<Row> {
    let mut merged: BTreeMap<KeyValue, Fields> =
        rows.into_iter().map(|row| (row.key, row.fields)).collect();

    for change in changes {
        if change.table_id != chunk.table_id || !chunk.contains(&change.key) {
            continue;
        }
        match (&change.op, &change.after) {
            (ChangeOp::Delete, _) | (_, None) => {
                merged.remove(&change.key);
            }
            (_, Some(after)) => {
                merged.insert(change.key.clone(), after.clone());
            }
        }
    }

    merged
        .into_iter()
        .map(|(key, fields)| Row { key, fields })
        .collect()
}

/// Run the full low/read/high/backfill sequence for one snapshot split.
pub async fn read_snapshot_split<S>(source: &S, split: &SnapshotSplit) -> Result<ChunkOutput>
where
    S: SourceConnection + ?Sized,
{
    let chunk = &split.descriptor;
    let split_id = chunk.split_id();

    let low = source.signal_watermark(&split_id, WatermarkKind::Low).await?;
    let rows = source.read_chunk(chunk).await?;
    let high = source.signal_watermark(&split_id, WatermarkKind::High).await?;

    if low.is_after(&high) {
        return Err(SyncError::protocol(
            &split_id,
            format!("source returned low watermark {low} after high watermark {high}"),
        ));
    }

    let changes = if low == high {
        Vec::new()
    } else {
        read_window(source, chunk, &low, &high).await?
    };
    debug!(
        "Chunk {} read {} rows with {} in-window changes in [{}, {}]",
        split_id,
        rows.len(),
        changes.len(),
        low,
        high
    );

    let applied_changes = changes.len();
    let records = reconcile_chunk(chunk, rows, &changes)
        .into_iter()
        .map(|row| OutputRecord::snapshot(chunk.table_id.clone(), row, high.clone()))
        .collect();

    Ok(ChunkOutput {
        split_id,
        low_watermark: low,
        high_watermark: high,
        records,
        applied_changes,
    })
}

/// Change events for `chunk` with `low <= offset <= high`, in stream order.
async fn read_window<S>(
    source: &S,
    chunk: &ChunkDescriptor,
    low: &Offset,
    high: &Offset,
) -> Result<Vec<ChangeEvent>>
where
    S: SourceConnection + ?Sized,
{
    let mut stream = source.stream_from(low).await?;
    let mut changes = Vec::new();

    loop {
        let event = match stream.next().await {
            Some(event) => event?,
            None => {
                return Err(SyncError::transient(format!(
                    "change stream ended before high watermark {high} of chunk {}",
                    chunk.split_id()
                )))
            }
        };
        let offset = event.offset().clone();
        if offset.is_before(low) {
            continue;
        }
        if offset.is_after(high) {
            break;
        }
        if let StreamEvent::Change(change) = event {
            if change.table_id == chunk.table_id && chunk.contains(&change.key) {
                changes.push(change);
            }
        }
        if offset.is_at_or_after(high) {
            break;
        }
    }
    Ok(changes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sync_core::TableId;

    fn row(key: i64, v: &str) -> Row {
        Row::new(key, Fields::from([("v".to_string(), json!(v))]))
    }

    fn change(op: ChangeOp, key: i64, v: Option<&str>, seq: i64) -> ChangeEvent {
        ChangeEvent {
            table_id: TableId::from("t"),
            op,
            key: KeyValue::Int(key),
            after: v.map(|v| Fields::from([("v".to_string(), json!(v))])),
            offset: Offset::sequence(seq),
        }
    }

    fn chunk() -> ChunkDescriptor {
        ChunkDescriptor::new(TableId::from("t"), 0, None, Some(KeyValue::Int(10)))
    }

    #[test]
    fn test_update_then_delete_removes_row() {
        let out = reconcile_chunk(
            &chunk(),
            vec![row(1, "a")],
            &[
                change(ChangeOp::Update, 1, Some("b"), 5),
                change(ChangeOp::Delete, 1, None, 6),
            ],
        );
        assert!(out.is_empty());
    }

    #[test]
    fn test_changes_overwrite_and_add_in_order() {
        let out = reconcile_chunk(
            &chunk(),
            vec![row(1, "a"), row(2, "b")],
            &[
                change(ChangeOp::Insert, 3, Some("c"), 5),
                change(ChangeOp::Update, 2, Some("x"), 6),
                change(ChangeOp::Update, 2, Some("y"), 7),
                change(ChangeOp::Delete, 3, None, 8),
                change(ChangeOp::Insert, 3, Some("z"), 9),
            ],
        );
        assert_eq!(out, vec![row(1, "a"), row(2, "y"), row(3, "z")]);
    }

    #[test]
    fn test_out_of_range_changes_are_ignored() {
        let mut other_table = change(ChangeOp::Delete, 1, None, 7);
        other_table.table_id = TableId::from("other");
        let out = reconcile_chunk(
            &chunk(),
            vec![row(1, "a")],
            &[change(ChangeOp::Insert, 10, Some("c"), 5), other_table],
        );
        assert_eq!(out, vec![row(1, "a")]);
    }

    #[test]
    fn test_no_changes_passes_rows_through_sorted() {
        let out = reconcile_chunk(&chunk(), vec![row(5, "e"), row(2, "b")], &[]);
        assert_eq!(out, vec![row(2, "b"), row(5, "e")]);
    }
}
