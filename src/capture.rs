//! One complete capture against the in-memory source: seed, split, read
//! snapshot chunks with several readers while a workload mutates the tables,
//! then hand over to the stream reader until the workload is done.

use std::sync::Arc;

use anyhow::Context;
use checkpoint::CheckpointManager;
use chunk_sync_enumerator::{create_split_enumerator, spawn_enumerator, EnumeratorHandle};
use chunk_sync_memory_source::{materialize, MemoryDatabase};
use chunk_sync_reader::{create_reader, ReaderSummary};
use futures::future::join_all;
use sync_core::{OffsetFactory, OutputRecord, RecordSink, SourceConnection, TableId};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::CaptureConfig;
use crate::workload::{run_mutations, seed_tables, WorkloadReport};

/// Outcome of [`run_capture`].
#[derive(Debug, Clone, Default)]
pub struct CaptureReport {
    pub tables: Vec<TableId>,
    pub snapshot_splits: usize,
    pub readers: Vec<ReaderSummary>,
    pub workload: WorkloadReport,
    pub checkpoints_emitted: usize,
    pub interrupted: bool,
}

impl CaptureReport {
    pub fn snapshot_records(&self) -> usize {
        self.readers.iter().map(|r| r.snapshot_records).sum()
    }

    pub fn stream_records(&self) -> usize {
        self.readers.iter().map(|r| r.stream_records).sum()
    }
}

/// Run a capture into `sink`. `db` is seeded from `config.tables` first.
///
/// `shutdown` interrupts the capture: readers return their splits and the
/// enumerator state is checkpointed once more before returning.
pub async fn run_capture(
    config: &CaptureConfig,
    db: MemoryDatabase,
    sink: Arc<dyn RecordSink>,
    checkpoints: &CheckpointManager,
    shutdown: CancellationToken,
) -> anyhow::Result<CaptureReport> {
    config.validate()?;
    let reader_options = config.reader_options()?;
    let interval = config.checkpoint_interval()?;

    let tables = seed_tables(&db, &config.tables).await?;
    let enumerator = create_split_enumerator(&tables, &db, &config.enumerator_options())
        .await
        .context("Failed to create split enumerator")?;
    let snapshot_splits = enumerator.splits().len();
    let (handle, enumerator_task) = spawn_enumerator(enumerator);

    let mut readers: Vec<JoinHandle<sync_core::Result<ReaderSummary>>> = Vec::new();
    for i in 0..config.readers {
        let reader = create_reader(
            format!("reader-{i}"),
            handle.clone(),
            Arc::new(db.clone()),
            sink.clone(),
            OffsetFactory::new(db.offset_kind()),
            reader_options.clone(),
        )?
        .with_cancellation(shutdown.child_token());
        readers.push(tokio::spawn(async move { reader.run().await }));
    }
    info!(
        "Started {} readers on {} snapshot splits",
        config.readers, snapshot_splits
    );

    let workload = tokio::spawn(run_mutations(
        db.clone(),
        tables
            .iter()
            .cloned()
            .zip(config.tables.iter().map(|t| t.rows))
            .collect(),
        config.workload.clone(),
        config.workload_pause()?,
        shutdown.child_token(),
    ));

    let mut report = CaptureReport {
        tables,
        snapshot_splits,
        ..Default::default()
    };
    let result = supervise(&handle, workload, checkpoints, interval, &shutdown, &mut report).await;

    // Let the stream reader drain the log and stop.
    db.close().await;
    for joined in join_all(readers).await {
        match joined.context("Reader task panicked")? {
            Ok(summary) => report.readers.push(summary),
            Err(e) => warn!("Reader failed: {}", e),
        }
    }

    emit_checkpoint(&handle, checkpoints, &mut report).await?;
    handle.close().await?;
    drop(handle);
    enumerator_task
        .await
        .context("Split enumerator task panicked")?;

    result?;
    report.interrupted = shutdown.is_cancelled();
    info!(
        "Capture done: {} snapshot records, {} stream records, {} changes applied",
        report.snapshot_records(),
        report.stream_records(),
        report.workload.total()
    );
    Ok(report)
}

/// Checkpoint periodically and at the snapshot-to-stream transition until
/// the workload is done and the stream split exists.
async fn supervise(
    handle: &EnumeratorHandle,
    mut workload: JoinHandle<anyhow::Result<WorkloadReport>>,
    checkpoints: &CheckpointManager,
    interval: std::time::Duration,
    shutdown: &CancellationToken,
    report: &mut CaptureReport,
) -> anyhow::Result<()> {
    let mut status = handle.subscribe();
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    let mut workload_done = false;
    let mut stream_checkpointed = false;
    if status.borrow().stream_split_created {
        emit_checkpoint(handle, checkpoints, report).await?;
        stream_checkpointed = true;
    }

    while !(workload_done && stream_checkpointed) {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Shutdown requested, stopping capture");
                if !workload_done {
                    report.workload = (&mut workload).await.context("Workload task panicked")??;
                }
                return Ok(());
            }
            _ = ticker.tick() => {
                emit_checkpoint(handle, checkpoints, report).await?;
            }
            changed = status.changed() => {
                if changed.is_err() {
                    anyhow::bail!("Split enumerator stopped unexpectedly");
                }
                let created = status.borrow_and_update().stream_split_created;
                if created && !stream_checkpointed {
                    emit_checkpoint(handle, checkpoints, report).await?;
                    stream_checkpointed = true;
                }
            }
            result = &mut workload, if !workload_done => {
                report.workload = result.context("Workload task panicked")??;
                workload_done = true;
            }
        }
    }
    Ok(())
}

async fn emit_checkpoint(
    handle: &EnumeratorHandle,
    checkpoints: &CheckpointManager,
    report: &mut CaptureReport,
) -> anyhow::Result<()> {
    if !checkpoints.config().should_emit_checkpoints() {
        return Ok(());
    }
    let state = handle.snapshot_state().await?;
    checkpoints
        .emit_checkpoint(&state, state.phase())
        .await
        .context("Failed to emit enumerator checkpoint")?;
    report.checkpoints_emitted += 1;
    Ok(())
}

/// Compare the table contents implied by `records` with the source rows.
/// Returns one line per table that differs; empty when they match.
pub async fn verify_output(
    db: &MemoryDatabase,
    tables: &[TableId],
    records: &[OutputRecord],
) -> anyhow::Result<Vec<String>> {
    let mut output = materialize(records);
    let mut mismatches = Vec::new();
    for table in tables {
        let expected = db.rows(table).await?;
        let actual = output.remove(table).unwrap_or_default();
        if expected == actual {
            continue;
        }
        let missing = expected.keys().filter(|k| !actual.contains_key(k)).count();
        let extra = actual.keys().filter(|k| !expected.contains_key(k)).count();
        let stale = expected
            .iter()
            .filter(|(k, v)| actual.get(k).is_some_and(|a| a != *v))
            .count();
        mismatches.push(format!(
            "{table}: {missing} missing, {extra} unexpected, {stale} stale rows"
        ));
    }
    Ok(mismatches)
}
