//! Tables plus an append-only change log, all behind one lock.
//!
//! Log entry `i` has offset `sequence:(i + 1)`; `sequence:0` is the position
//! before any change. Every mutation appends to the log under the same lock
//! that guards the rows, so a chunk read is consistent with a log position.

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::Arc;

use async_trait::async_trait;
use sync_core::{
    Bounded, ChangeEvent, ChangeOp, ChangeStream, ChunkDescriptor, Fields, KeyValue, Offset,
    OffsetKind, Result, Row, SourceConnection, SplitKeySource, StreamEvent, SyncError, TableId,
    TableSchema, WatermarkKind,
};
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info};

struct MemoryTable {
    schema: TableSchema,
    rows: BTreeMap<KeyValue, Fields>,
}

#[derive(Default)]
struct Inner {
    tables: BTreeMap<TableId, MemoryTable>,
    log: Vec<StreamEvent>,
    chunk_read_faults: HashMap<String, usize>,
    stream_faults: usize,
    closed: bool,
}

impl Inner {
    fn next_offset(&self) -> Offset {
        Offset::sequence(self.log.len() as i64 + 1)
    }

    fn table(&self, table: &TableId) -> Result<&MemoryTable> {
        self.tables
            .get(table)
            .ok_or_else(|| SyncError::config(format!("Table {table} doesn't exist")))
    }

    fn table_mut(&mut self, table: &TableId) -> Result<&mut MemoryTable> {
        self.tables
            .get_mut(table)
            .ok_or_else(|| SyncError::config(format!("Table {table} doesn't exist")))
    }
}

#[derive(Default)]
struct Shared {
    inner: Mutex<Inner>,
    appended: Notify,
}

/// Cheaply cloneable handle to an in-memory database.
#[derive(Clone, Default)]
pub struct MemoryDatabase {
    shared: Arc<Shared>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn create_table(&self, schema: TableSchema) {
        let mut inner = self.shared.inner.lock().await;
        info!("Created in-memory table {}", schema.table_id);
        inner.tables.insert(
            schema.table_id.clone(),
            MemoryTable {
                schema,
                rows: BTreeMap::new(),
            },
        );
    }

    /// Load rows that existed before capture started. Nothing is logged.
    pub async fn bulk_load(
        &self,
        table: &TableId,
        rows: impl IntoIterator<Item = Row>,
    ) -> Result<()> {
        let mut inner = self.shared.inner.lock().await;
        let target = inner.table_mut(table)?;
        for row in rows {
            target.rows.insert(row.key, row.fields);
        }
        Ok(())
    }

    pub async fn insert(&self, table: &TableId, key: KeyValue, fields: Fields) -> Result<Offset> {
        self.apply(table, ChangeOp::Insert, key, Some(fields)).await
    }

    pub async fn update(&self, table: &TableId, key: KeyValue, fields: Fields) -> Result<Offset> {
        self.apply(table, ChangeOp::Update, key, Some(fields)).await
    }

    pub async fn delete(&self, table: &TableId, key: KeyValue) -> Result<Offset> {
        self.apply(table, ChangeOp::Delete, key, None).await
    }

    async fn apply(
        &self,
        table: &TableId,
        op: ChangeOp,
        key: KeyValue,
        after: Option<Fields>,
    ) -> Result<Offset> {
        let mut inner = self.shared.inner.lock().await;
        let offset = inner.next_offset();
        let rows = &mut inner.table_mut(table)?.rows;
        match (&op, &after) {
            (ChangeOp::Delete, _) => {
                rows.remove(&key);
            }
            (_, Some(fields)) => {
                rows.insert(key.clone(), fields.clone());
            }
            (_, None) => {
                return Err(SyncError::config(format!(
                    "{op:?} on {table} requires a row image"
                )))
            }
        }
        inner.log.push(StreamEvent::Change(ChangeEvent {
            table_id: table.clone(),
            op,
            key,
            after,
            offset: offset.clone(),
        }));
        drop(inner);
        self.shared.appended.notify_waiters();
        Ok(offset)
    }

    /// Replace a table's schema and log the change.
    pub async fn alter_table(&self, schema: TableSchema) -> Result<Offset> {
        let mut inner = self.shared.inner.lock().await;
        let offset = inner.next_offset();
        inner.table_mut(&schema.table_id)?.schema = schema.clone();
        inner
            .log
            .push(StreamEvent::SchemaChange { schema, offset: offset.clone() });
        drop(inner);
        self.shared.appended.notify_waiters();
        Ok(offset)
    }

    /// Make the next `failures` reads of `split_id` fail transiently.
    pub async fn fail_chunk_reads(&self, split_id: &str, failures: usize) {
        let mut inner = self.shared.inner.lock().await;
        inner.chunk_read_faults.insert(split_id.to_string(), failures);
    }

    /// Make the next `failures` stream reads fail transiently.
    pub async fn fail_stream_reads(&self, failures: usize) {
        self.shared.inner.lock().await.stream_faults = failures;
    }

    /// End every live change stream.
    pub async fn close(&self) {
        self.shared.inner.lock().await.closed = true;
        self.shared.appended.notify_waiters();
    }

    pub async fn rows(&self, table: &TableId) -> Result<BTreeMap<KeyValue, Fields>> {
        Ok(self.shared.inner.lock().await.table(table)?.rows.clone())
    }

    pub async fn log_len(&self) -> usize {
        self.shared.inner.lock().await.log.len()
    }

    fn start_index(offset: &Offset) -> Result<usize> {
        match offset {
            Offset::Sequence(Bounded::Initial) => Ok(0),
            Offset::Sequence(Bounded::At(seq)) => Ok((*seq).max(1) as usize - 1),
            Offset::Sequence(Bounded::NoStopping) => Err(SyncError::config(
                "cannot stream from the no-stopping offset",
            )),
            other => Err(SyncError::config(format!(
                "in-memory source only understands sequence offsets, got {other}"
            ))),
        }
    }
}

#[async_trait]
impl SourceConnection for MemoryDatabase {
    fn offset_kind(&self) -> OffsetKind {
        OffsetKind::Sequence
    }

    async fn table_schema(&self, table: &TableId) -> Result<TableSchema> {
        Ok(self.shared.inner.lock().await.table(table)?.schema.clone())
    }

    async fn read_chunk(&self, chunk: &ChunkDescriptor) -> Result<Vec<Row>> {
        let mut inner = self.shared.inner.lock().await;
        let split_id = chunk.split_id();
        if let Some(remaining) = inner.chunk_read_faults.get_mut(&split_id) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(SyncError::transient(format!(
                    "injected read failure for {split_id}"
                )));
            }
        }

        let lower = match &chunk.split_key_start {
            Some(start) => Bound::Included(start),
            None => Bound::Unbounded,
        };
        let upper = match &chunk.split_key_end {
            Some(end) => Bound::Excluded(end),
            None => Bound::Unbounded,
        };
        let rows: Vec<Row> = inner
            .table(&chunk.table_id)?
            .rows
            .range::<KeyValue, _>((lower, upper))
            .map(|(key, fields)| Row {
                key: key.clone(),
                fields: fields.clone(),
            })
            .collect();
        debug!("Read {} rows for chunk {}", rows.len(), split_id);
        Ok(rows)
    }

    async fn current_stream_position(&self) -> Result<Offset> {
        Ok(Offset::sequence(
            self.shared.inner.lock().await.log.len() as i64,
        ))
    }

    /// Writes a marker into the log, like a signal table would.
    async fn signal_watermark(&self, split_id: &str, kind: WatermarkKind) -> Result<Offset> {
        let mut inner = self.shared.inner.lock().await;
        let offset = inner.next_offset();
        inner.log.push(StreamEvent::Watermark {
            split_id: split_id.to_string(),
            kind,
            offset: offset.clone(),
        });
        drop(inner);
        self.shared.appended.notify_waiters();
        Ok(offset)
    }

    async fn stream_from(&self, offset: &Offset) -> Result<Box<dyn ChangeStream>> {
        let position = Self::start_index(offset)?;
        Ok(Box::new(MemoryChangeStream {
            shared: self.shared.clone(),
            position,
        }))
    }
}

#[async_trait]
impl SplitKeySource for MemoryDatabase {
    async fn query_min_max(
        &self,
        table: &TableId,
        _column: &str,
    ) -> Result<Option<(KeyValue, KeyValue)>> {
        let inner = self.shared.inner.lock().await;
        let rows = &inner.table(table)?.rows;
        Ok(rows
            .keys()
            .next()
            .cloned()
            .zip(rows.keys().next_back().cloned()))
    }

    async fn approximate_row_count(&self, table: &TableId) -> Result<u64> {
        Ok(self.shared.inner.lock().await.table(table)?.rows.len() as u64)
    }

    async fn query_next_chunk_max(
        &self,
        table: &TableId,
        _column: &str,
        chunk_size: usize,
        start: &KeyValue,
    ) -> Result<Option<KeyValue>> {
        let inner = self.shared.inner.lock().await;
        Ok(inner
            .table(table)?
            .rows
            .range::<KeyValue, _>((Bound::Included(start), Bound::Unbounded))
            .take(chunk_size)
            .map(|(key, _)| key)
            .last()
            .cloned())
    }

    async fn query_min_above(
        &self,
        table: &TableId,
        _column: &str,
        value: &KeyValue,
    ) -> Result<Option<KeyValue>> {
        let inner = self.shared.inner.lock().await;
        Ok(inner
            .table(table)?
            .rows
            .range::<KeyValue, _>((Bound::Excluded(value), Bound::Unbounded))
            .next()
            .map(|(key, _)| key.clone()))
    }
}

/// Live tail of the log. Waits for new entries instead of ending; ends once
/// the database is closed and the reader has caught up.
pub struct MemoryChangeStream {
    shared: Arc<Shared>,
    position: usize,
}

#[async_trait]
impl ChangeStream for MemoryChangeStream {
    async fn next(&mut self) -> Option<Result<StreamEvent>> {
        loop {
            let appended = self.shared.appended.notified();
            {
                let mut inner = self.shared.inner.lock().await;
                if inner.stream_faults > 0 {
                    inner.stream_faults -= 1;
                    return Some(Err(SyncError::transient("injected stream failure")));
                }
                if let Some(event) = inner.log.get(self.position) {
                    self.position += 1;
                    return Some(Ok(event.clone()));
                }
                if inner.closed {
                    return None;
                }
            }
            appended.await;
        }
    }
}
