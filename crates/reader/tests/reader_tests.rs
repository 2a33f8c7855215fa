//! Readers against the in-memory source: chunk reconciliation under
//! concurrent writes, stream handover, retries, cancellation and drift.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chunk_sync_enumerator::{
    create_split_enumerator, spawn_enumerator, Assignment, EnumeratorHandle, EnumeratorOptions,
    EnumeratorPhase,
};
use chunk_sync_memory_source::{fields, MemoryDatabase, MemorySink};
use chunk_sync_reader::{create_reader, read_snapshot_split, ReaderOptions, SplitReader};
use chunk_sync_splitter::SplitterOptions;
use serde_json::json;
use sync_core::{
    ChangeStream, ChunkDescriptor, ColumnDef, ColumnType, KeyValue, Offset, OffsetFactory,
    OffsetKind, OutputRecord, RecordOrigin, RecordSink, Result, Row, SnapshotSplit,
    SourceConnection, SyncError, TableId, TableSchema, WatermarkKind,
};
use tokio_util::sync::CancellationToken;

fn items() -> TableId {
    TableId::from("shop.items")
}

fn items_schema() -> TableSchema {
    TableSchema::new(
        items(),
        vec![
            ColumnDef::new("id", ColumnType::Integer),
            ColumnDef::new("v", ColumnType::Text),
        ],
        Some("id"),
    )
}

fn value(v: &str) -> sync_core::Fields {
    fields([("v", json!(v))])
}

async fn seeded(rows: i64) -> MemoryDatabase {
    let db = MemoryDatabase::new();
    db.create_table(items_schema()).await;
    db.bulk_load(&items(), (1..=rows).map(|i| Row::new(i, value(&format!("row-{i}")))))
        .await
        .unwrap();
    db
}

async fn start_enumerator(db: &MemoryDatabase, chunk_size: usize) -> EnumeratorHandle {
    let options = EnumeratorOptions {
        splitter: SplitterOptions::with_chunk_size(chunk_size),
        split_meta_group_size: 2,
    };
    let enumerator = create_split_enumerator(&[items()], db, &options)
        .await
        .unwrap();
    spawn_enumerator(enumerator).0
}

fn reader<S: SourceConnection>(
    id: &str,
    handle: &EnumeratorHandle,
    source: Arc<S>,
    sink: &MemorySink,
    options: ReaderOptions,
) -> SplitReader<S, MemorySink> {
    create_reader(
        id,
        handle.clone(),
        source,
        Arc::new(sink.clone()),
        OffsetFactory::new(OffsetKind::Sequence),
        options,
    )
    .unwrap()
}

async fn wait_for_stream_split(handle: &EnumeratorHandle) {
    let mut status = handle.subscribe();
    tokio::time::timeout(Duration::from_secs(30), async {
        while !handle.status().stream_split_created {
            status.changed().await.unwrap();
        }
    })
    .await
    .expect("snapshot phase did not finish");
}

async fn wait_for_phase(handle: &EnumeratorHandle, phase: EnumeratorPhase) {
    let mut status = handle.subscribe();
    tokio::time::timeout(Duration::from_secs(30), async {
        while handle.status().phase != phase {
            status.changed().await.unwrap();
        }
    })
    .await
    .expect("enumerator did not reach the expected phase");
}

fn key_in(record_key: &KeyValue, from: i64, to: i64) -> bool {
    matches!(record_key, KeyValue::Int(k) if (from..to).contains(k))
}

/// Delegates to the database but updates two rows around the read of one
/// chunk: one before the rows are read, one after.
struct UpdateDuringRead {
    db: MemoryDatabase,
    split_id: String,
    done: AtomicBool,
}

#[async_trait]
impl SourceConnection for UpdateDuringRead {
    fn offset_kind(&self) -> OffsetKind {
        self.db.offset_kind()
    }

    async fn table_schema(&self, table: &TableId) -> Result<TableSchema> {
        self.db.table_schema(table).await
    }

    async fn read_chunk(&self, chunk: &ChunkDescriptor) -> Result<Vec<Row>> {
        if chunk.split_id() != self.split_id || self.done.swap(true, Ordering::SeqCst) {
            return self.db.read_chunk(chunk).await;
        }
        self.db
            .update(&items(), KeyValue::Int(3000), value("before-read"))
            .await?;
        let rows = self.db.read_chunk(chunk).await?;
        self.db
            .update(&items(), KeyValue::Int(4000), value("after-read"))
            .await?;
        Ok(rows)
    }

    async fn current_stream_position(&self) -> Result<Offset> {
        self.db.current_stream_position().await
    }

    async fn signal_watermark(&self, split_id: &str, kind: WatermarkKind) -> Result<Offset> {
        self.db.signal_watermark(split_id, kind).await
    }

    async fn stream_from(&self, offset: &Offset) -> Result<Box<dyn ChangeStream>> {
        self.db.stream_from(offset).await
    }
}

/// Chunk reads never complete.
struct StuckReads {
    db: MemoryDatabase,
}

#[async_trait]
impl SourceConnection for StuckReads {
    fn offset_kind(&self) -> OffsetKind {
        self.db.offset_kind()
    }

    async fn table_schema(&self, table: &TableId) -> Result<TableSchema> {
        self.db.table_schema(table).await
    }

    async fn read_chunk(&self, _chunk: &ChunkDescriptor) -> Result<Vec<Row>> {
        std::future::pending().await
    }

    async fn current_stream_position(&self) -> Result<Offset> {
        self.db.current_stream_position().await
    }

    async fn stream_from(&self, offset: &Offset) -> Result<Box<dyn ChangeStream>> {
        self.db.stream_from(offset).await
    }
}

// =============================================================================
// Chunk reconciliation
// =============================================================================

#[tokio::test]
async fn test_chunk_updated_during_read_is_emitted_once_with_new_values() {
    let db = seeded(10_000).await;
    let handle = start_enumerator(&db, 2500).await;
    assert_eq!(handle.status().total_splits, 4);

    let source = Arc::new(UpdateDuringRead {
        db: db.clone(),
        split_id: "shop.items:1".to_string(),
        done: AtomicBool::new(false),
    });
    let sink = MemorySink::new();
    let r1 = reader("r1", &handle, source, &sink, ReaderOptions::default());
    let run = tokio::spawn(async move { r1.run().await });

    wait_for_stream_split(&handle).await;
    db.update(&items(), KeyValue::Int(10), value("late"))
        .await
        .unwrap();
    db.delete(&items(), KeyValue::Int(9000)).await.unwrap();
    db.close().await;

    let summary = run.await.unwrap().unwrap();
    assert_eq!(summary.snapshot_splits, 4);
    assert_eq!(summary.snapshot_records, 10_000);
    assert!(summary.ran_stream_split);
    assert_eq!(summary.stream_records, 2);

    let records = sink.records().await;
    let chunk: Vec<_> = records
        .iter()
        .filter(|r| key_in(&r.key, 2501, 5001))
        .collect();
    assert_eq!(chunk.len(), 2500);
    assert!(chunk.iter().all(|r| r.origin == RecordOrigin::Snapshot));
    let v = |key: i64| {
        chunk
            .iter()
            .find(|r| r.key == KeyValue::Int(key))
            .and_then(|r| r.fields.as_ref())
            .map(|f| f["v"].clone())
    };
    assert_eq!(v(3000), Some(json!("before-read")));
    assert_eq!(v(4000), Some(json!("after-read")));

    assert_eq!(sink.materialize().await[&items()], db.rows(&items()).await.unwrap());
}

#[tokio::test]
async fn test_concurrent_readers_and_writer_converge() {
    let db = seeded(1000).await;
    let handle = start_enumerator(&db, 100).await;
    let sink = MemorySink::new();

    let mut runs = Vec::new();
    for id in ["r1", "r2", "r3"] {
        let r = reader(id, &handle, Arc::new(db.clone()), &sink, ReaderOptions::default());
        runs.push(tokio::spawn(async move { r.run().await }));
    }

    let writer_db = db.clone();
    let writer = tokio::spawn(async move {
        for i in 0..300i64 {
            let key = KeyValue::Int((i * 37) % 1000 + 1);
            if i % 7 == 0 {
                writer_db.delete(&items(), key).await.unwrap();
            } else if i % 11 == 0 {
                writer_db
                    .insert(&items(), KeyValue::Int(1000 + i), value("new"))
                    .await
                    .unwrap();
            } else {
                writer_db
                    .update(&items(), key, value(&format!("w{i}")))
                    .await
                    .unwrap();
            }
            tokio::task::yield_now().await;
        }
    });

    writer.await.unwrap();
    wait_for_stream_split(&handle).await;
    db.close().await;

    let mut stream_readers = 0;
    let mut snapshot_records = 0;
    for run in runs {
        let summary = run.await.unwrap().unwrap();
        stream_readers += usize::from(summary.ran_stream_split);
        snapshot_records += summary.snapshot_records;
    }
    assert_eq!(stream_readers, 1);

    let snapshot_keys: Vec<_> = sink
        .records()
        .await
        .into_iter()
        .filter(|r| r.origin == RecordOrigin::Snapshot)
        .map(|r| r.key)
        .collect();
    assert_eq!(snapshot_keys.len(), snapshot_records);
    let mut unique = snapshot_keys.clone();
    unique.sort();
    unique.dedup();
    assert_eq!(unique.len(), snapshot_keys.len());

    let state = handle.snapshot_state().await.unwrap();
    assert_eq!(state.finished.len(), state.splits.len());
    assert!(state
        .finished
        .values()
        .all(|(low, high)| low.is_at_or_before(high)));

    assert_eq!(sink.materialize().await[&items()], db.rows(&items()).await.unwrap());
}

#[tokio::test]
async fn test_quiet_chunk_reports_watermarks_around_read() {
    let db = seeded(10).await;
    let handle = start_enumerator(&db, 100).await;
    let split = match handle.request_split("manual").await.unwrap() {
        Assignment::Snapshot(split) => split,
        other => panic!("unexpected {other:?}"),
    };

    let output = read_snapshot_split(&db, &split).await.unwrap();
    assert_eq!(output.records.len(), 10);
    assert_eq!(output.applied_changes, 0);
    assert!(output.low_watermark.is_before(&output.high_watermark));
    assert!(output
        .records
        .iter()
        .all(|r| r.offset == output.high_watermark));
}

// =============================================================================
// Failures and cancellation
// =============================================================================

#[tokio::test]
async fn test_transient_chunk_failures_are_retried() {
    let db = seeded(10).await;
    let handle = start_enumerator(&db, 100).await;
    db.fail_chunk_reads("shop.items:0", 2).await;

    let sink = MemorySink::new();
    let r1 = reader("r1", &handle, Arc::new(db.clone()), &sink, ReaderOptions::default());
    let run = tokio::spawn(async move { r1.run().await });
    wait_for_stream_split(&handle).await;
    db.close().await;

    let summary = run.await.unwrap().unwrap();
    assert_eq!(summary.snapshot_records, 10);
    assert_eq!(sink.len().await, 10);
}

#[tokio::test]
async fn test_exhausted_retries_return_the_split() {
    let db = seeded(10).await;
    let handle = start_enumerator(&db, 100).await;
    db.fail_chunk_reads("shop.items:0", 10).await;

    let sink = MemorySink::new();
    let options = ReaderOptions {
        max_chunk_retries: 2,
        ..Default::default()
    };
    let err = reader("r1", &handle, Arc::new(db.clone()), &sink, options)
        .run()
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::TransientRead(_)));
    assert!(sink.is_empty().await);

    match handle.request_split("r2").await.unwrap() {
        Assignment::Snapshot(split) => assert_eq!(split.split_id(), "shop.items:0"),
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn test_cancellation_mid_chunk_returns_the_split() {
    let db = seeded(10).await;
    let handle = start_enumerator(&db, 100).await;
    let sink = MemorySink::new();

    let token = CancellationToken::new();
    let r1 = reader(
        "r1",
        &handle,
        Arc::new(StuckReads { db: db.clone() }),
        &sink,
        ReaderOptions::default(),
    )
    .with_cancellation(token.clone());
    let run = tokio::spawn(async move { r1.run().await });

    wait_for_phase(&handle, EnumeratorPhase::AwaitingFinish).await;
    token.cancel();
    let summary = run.await.unwrap().unwrap();
    assert!(summary.cancelled);
    assert_eq!(summary.snapshot_splits, 0);
    assert!(sink.is_empty().await);

    match handle.request_split("r2").await.unwrap() {
        Assignment::Snapshot(split) => assert_eq!(split.split_id(), "shop.items:0"),
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn test_stream_failure_reopens_without_duplicates() {
    let db = seeded(10).await;
    let handle = start_enumerator(&db, 100).await;
    let sink = MemorySink::new();
    let r1 = reader("r1", &handle, Arc::new(db.clone()), &sink, ReaderOptions::default());
    let run = tokio::spawn(async move { r1.run().await });

    wait_for_stream_split(&handle).await;
    db.fail_stream_reads(1).await;
    db.update(&items(), KeyValue::Int(1), value("changed"))
        .await
        .unwrap();
    db.insert(&items(), KeyValue::Int(11), value("added"))
        .await
        .unwrap();
    db.close().await;

    let summary = run.await.unwrap().unwrap();
    assert_eq!(summary.stream_records, 2);
    assert_eq!(sink.len().await, 12);
    assert_eq!(sink.materialize().await[&items()], db.rows(&items()).await.unwrap());
}

// =============================================================================
// Split ownership during delivery
// =============================================================================

fn distinct_keys(records: &[OutputRecord]) -> usize {
    let mut keys: Vec<_> = records.iter().map(|r| r.key.clone()).collect();
    keys.sort();
    keys.dedup();
    keys.len()
}

/// Declares reader r1 failed while it reads its first chunk and hands the
/// chunk to r2.
struct ReassignDuringRead {
    db: MemoryDatabase,
    handle: EnumeratorHandle,
    reassigned: Mutex<Option<SnapshotSplit>>,
    done: AtomicBool,
}

#[async_trait]
impl SourceConnection for ReassignDuringRead {
    fn offset_kind(&self) -> OffsetKind {
        self.db.offset_kind()
    }

    async fn table_schema(&self, table: &TableId) -> Result<TableSchema> {
        self.db.table_schema(table).await
    }

    async fn read_chunk(&self, chunk: &ChunkDescriptor) -> Result<Vec<Row>> {
        if !self.done.swap(true, Ordering::SeqCst) {
            self.handle.return_splits("r1").await?;
            if let Assignment::Snapshot(split) = self.handle.request_split("r2").await? {
                *self.reassigned.lock().unwrap() = Some(split);
            }
        }
        self.db.read_chunk(chunk).await
    }

    async fn current_stream_position(&self) -> Result<Offset> {
        self.db.current_stream_position().await
    }

    async fn signal_watermark(&self, split_id: &str, kind: WatermarkKind) -> Result<Offset> {
        self.db.signal_watermark(split_id, kind).await
    }

    async fn stream_from(&self, offset: &Offset) -> Result<Box<dyn ChangeStream>> {
        self.db.stream_from(offset).await
    }
}

/// Declares reader r1 failed during its first emit and lets r2 ask for work.
struct ReturnDuringEmit {
    inner: MemorySink,
    handle: EnumeratorHandle,
    second_request: Mutex<Option<Assignment>>,
    done: AtomicBool,
}

#[async_trait]
impl RecordSink for ReturnDuringEmit {
    async fn emit(&self, records: Vec<OutputRecord>) -> Result<()> {
        if !self.done.swap(true, Ordering::SeqCst) {
            self.handle.return_splits("r1").await?;
            let assignment = self.handle.request_split("r2").await?;
            *self.second_request.lock().unwrap() = Some(assignment);
        }
        self.inner.emit(records).await
    }
}

/// The first emit fails.
struct FailFirstEmit {
    inner: MemorySink,
    done: AtomicBool,
}

#[async_trait]
impl RecordSink for FailFirstEmit {
    async fn emit(&self, records: Vec<OutputRecord>) -> Result<()> {
        if !self.done.swap(true, Ordering::SeqCst) {
            return Err(SyncError::Io(std::io::Error::other("sink unavailable")));
        }
        self.inner.emit(records).await
    }
}

#[tokio::test]
async fn test_split_reassigned_during_read_is_delivered_once() {
    let db = seeded(10).await;
    let handle = start_enumerator(&db, 100).await;
    let sink = MemorySink::new();
    let source = Arc::new(ReassignDuringRead {
        db: db.clone(),
        handle: handle.clone(),
        reassigned: Mutex::new(None),
        done: AtomicBool::new(false),
    });

    let err = reader("r1", &handle, source.clone(), &sink, ReaderOptions::default())
        .run()
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::ProtocolViolation { .. }));
    assert!(sink.is_empty().await);

    let split = source.reassigned.lock().unwrap().take().expect("r2 got the chunk");
    let output = read_snapshot_split(&db, &split).await.unwrap();
    handle
        .commit_finished(
            "r2",
            &output.split_id,
            output.low_watermark,
            output.high_watermark,
        )
        .await
        .unwrap();
    sink.emit(output.records).await.unwrap();
    handle
        .confirm_delivered("r2", &output.split_id)
        .await
        .unwrap();
    wait_for_stream_split(&handle).await;

    let records = sink.records().await;
    assert_eq!(records.len(), 10);
    assert_eq!(distinct_keys(&records), 10);
}

#[tokio::test]
async fn test_split_returned_during_emit_is_not_handed_out_again() {
    let db = seeded(10).await;
    let handle = start_enumerator(&db, 100).await;
    let sink = MemorySink::new();
    let hooked = Arc::new(ReturnDuringEmit {
        inner: sink.clone(),
        handle: handle.clone(),
        second_request: Mutex::new(None),
        done: AtomicBool::new(false),
    });

    let r1 = create_reader(
        "r1",
        handle.clone(),
        Arc::new(db.clone()),
        hooked.clone(),
        OffsetFactory::new(OffsetKind::Sequence),
        ReaderOptions::default(),
    )
    .unwrap();
    let summary = r1.run().await.unwrap();
    assert_eq!(summary.snapshot_splits, 1);
    assert!(!summary.ran_stream_split);

    // The committed chunk stays finished, so r2 is offered the stream split.
    let second = hooked.second_request.lock().unwrap().take();
    assert!(matches!(second, Some(Assignment::Stream(_))));

    let records = sink.records().await;
    assert_eq!(records.len(), 10);
    assert_eq!(distinct_keys(&records), 10);
}

#[tokio::test]
async fn test_failed_emit_puts_the_split_back() {
    let db = seeded(10).await;
    let handle = start_enumerator(&db, 100).await;
    let sink = MemorySink::new();

    let r1 = create_reader(
        "r1",
        handle.clone(),
        Arc::new(db.clone()),
        Arc::new(FailFirstEmit {
            inner: sink.clone(),
            done: AtomicBool::new(false),
        }),
        OffsetFactory::new(OffsetKind::Sequence),
        ReaderOptions::default(),
    )
    .unwrap();
    let err = r1.run().await.unwrap_err();
    assert!(matches!(err, SyncError::Io(_)));
    assert!(sink.is_empty().await);
    assert!(!handle.status().stream_split_created);
    assert_eq!(handle.remaining_splits(), 1);

    let r2 = reader("r2", &handle, Arc::new(db.clone()), &sink, ReaderOptions::default());
    let run = tokio::spawn(async move { r2.run().await });
    wait_for_stream_split(&handle).await;
    db.close().await;
    let summary = run.await.unwrap().unwrap();
    assert_eq!(summary.snapshot_records, 10);
    assert_eq!(distinct_keys(&sink.records().await), 10);
}

// =============================================================================
// Stream split control
// =============================================================================

/// Finish every snapshot split by hand so the stream split exists before any
/// reader task starts.
async fn finish_snapshot_by_hand(
    db: &MemoryDatabase,
    handle: &EnumeratorHandle,
    sink: &MemorySink,
) {
    for _ in 0..handle.status().total_splits {
        let split = match handle.request_split("manual").await.unwrap() {
            Assignment::Snapshot(split) => split,
            other => panic!("unexpected {other:?}"),
        };
        let output = read_snapshot_split(db, &split).await.unwrap();
        sink.emit(output.records).await.unwrap();
        handle
            .report_finished(
                "manual",
                &output.split_id,
                output.low_watermark,
                output.high_watermark,
            )
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn test_suspended_stream_pauses_until_resumed() {
    let db = seeded(10).await;
    let handle = start_enumerator(&db, 4).await;
    let sink = MemorySink::new();
    finish_snapshot_by_hand(&db, &handle, &sink).await;
    assert_eq!(sink.len().await, 10);

    handle.suspend_stream().await.unwrap();
    db.update(&items(), KeyValue::Int(2), value("while-suspended"))
        .await
        .unwrap();

    let r1 = reader("r1", &handle, Arc::new(db.clone()), &sink, ReaderOptions::default());
    let run = tokio::spawn(async move { r1.run().await });
    wait_for_phase(&handle, EnumeratorPhase::StreamAssigned).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(sink.len().await, 10);

    handle.resume_stream().await.unwrap();
    db.close().await;
    let summary = run.await.unwrap().unwrap();
    assert_eq!(summary.stream_records, 1);
    assert_eq!(sink.materialize().await[&items()], db.rows(&items()).await.unwrap());
}

#[tokio::test]
async fn test_incompatible_schema_change_stops_stream_reader() {
    let db = seeded(10).await;
    let handle = start_enumerator(&db, 100).await;
    let sink = MemorySink::new();
    finish_snapshot_by_hand(&db, &handle, &sink).await;

    db.alter_table(TableSchema::new(
        items(),
        vec![ColumnDef::new("id", ColumnType::Integer)],
        Some("id"),
    ))
    .await
    .unwrap();

    let err = reader("r1", &handle, Arc::new(db.clone()), &sink, ReaderOptions::default())
        .run()
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::SchemaDrift { .. }));

    // The stream split went back to the enumerator.
    assert!(matches!(
        handle.request_split("r2").await.unwrap(),
        Assignment::Stream(_)
    ));
}

#[tokio::test]
async fn test_mismatched_offset_factory_is_rejected() {
    let db = seeded(1).await;
    let handle = start_enumerator(&db, 100).await;
    let result = create_reader(
        "r1",
        handle,
        Arc::new(db),
        Arc::new(MemorySink::new()),
        OffsetFactory::new(OffsetKind::Lsn),
        ReaderOptions::default(),
    );
    assert!(matches!(result, Err(SyncError::Configuration(_))));
}
