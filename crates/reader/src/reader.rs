//! The reader task: pulls splits from the enumerator until there is nothing
//! left, then (if it won the stream split) tails the change stream.

use std::sync::Arc;

use chunk_sync_enumerator::{Assignment, EnumeratorHandle, EnumeratorPhase, EnumeratorStatus};
use sync_core::{
    Offset, OffsetFactory, RecordSink, Result, SnapshotSplit, SourceConnection, StreamSplit,
    SyncError,
};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::filter::StreamFilter;
use crate::meta::fetch_finished_splits;
use crate::options::ReaderOptions;
use crate::reconcile::{read_snapshot_split, ChunkOutput};

/// What one reader did before it stopped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReaderSummary {
    pub reader_id: String,
    pub snapshot_splits: usize,
    pub snapshot_records: usize,
    pub stream_records: usize,
    pub ran_stream_split: bool,
    pub cancelled: bool,
}

pub struct SplitReader<S: ?Sized, K: ?Sized> {
    reader_id: String,
    enumerator: EnumeratorHandle,
    source: Arc<S>,
    sink: Arc<K>,
    offset_factory: OffsetFactory,
    options: ReaderOptions,
    cancel: CancellationToken,
}

/// Build a reader whose watermarks are checked against `offset_factory`.
///
/// Fails if the factory and the source disagree on the offset kind.
pub fn create_reader<S, K>(
    reader_id: impl Into<String>,
    enumerator: EnumeratorHandle,
    source: Arc<S>,
    sink: Arc<K>,
    offset_factory: OffsetFactory,
    options: ReaderOptions,
) -> Result<SplitReader<S, K>>
where
    S: SourceConnection + ?Sized,
    K: RecordSink + ?Sized,
{
    if offset_factory.kind() != source.offset_kind() {
        return Err(SyncError::config(format!(
            "offset factory produces {} offsets but the source uses {}",
            offset_factory.kind(),
            source.offset_kind()
        )));
    }
    Ok(SplitReader {
        reader_id: reader_id.into(),
        enumerator,
        source,
        sink,
        offset_factory,
        options,
        cancel: CancellationToken::new(),
    })
}

enum Step<T> {
    Done(T),
    Cancelled,
}

impl<S, K> SplitReader<S, K>
where
    S: SourceConnection + ?Sized,
    K: RecordSink + ?Sized,
{
    /// Stop the reader through `token` instead of its own.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn reader_id(&self) -> &str {
        &self.reader_id
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Process splits until none are left, the enumerator closes or the
    /// reader is cancelled.
    ///
    /// On cancellation or on an error every split the reader holds is
    /// returned to the enumerator.
    pub async fn run(&self) -> Result<ReaderSummary> {
        let mut summary = ReaderSummary {
            reader_id: self.reader_id.clone(),
            ..Default::default()
        };
        info!("Reader {} started", self.reader_id);

        match self.run_splits(&mut summary).await {
            Ok(Step::Done(())) => {
                info!(
                    "Reader {} finished: {} snapshot splits, {} snapshot records, \
                     {} stream records",
                    self.reader_id,
                    summary.snapshot_splits,
                    summary.snapshot_records,
                    summary.stream_records
                );
                Ok(summary)
            }
            Ok(Step::Cancelled) => {
                info!("Reader {} cancelled", self.reader_id);
                self.give_back().await;
                summary.cancelled = true;
                Ok(summary)
            }
            Err(e) => {
                error!("Reader {} failed: {}", self.reader_id, e);
                self.give_back().await;
                Err(e)
            }
        }
    }

    async fn give_back(&self) {
        match self.enumerator.return_splits(&self.reader_id).await {
            Ok(returned) if !returned.is_empty() => {
                info!("Reader {} returned splits {:?}", self.reader_id, returned)
            }
            Ok(_) => {}
            Err(e) => debug!("Reader {} could not return splits: {}", self.reader_id, e),
        }
    }

    async fn run_splits(&self, summary: &mut ReaderSummary) -> Result<Step<()>> {
        loop {
            let mut status = self.enumerator.subscribe();
            let assignment = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(Step::Cancelled),
                assignment = self.enumerator.request_split(&self.reader_id) => assignment,
            };
            let assignment = match assignment {
                Ok(assignment) => assignment,
                Err(SyncError::Closed) => {
                    info!("Split enumerator closed, reader {} stops", self.reader_id);
                    return Ok(Step::Done(()));
                }
                Err(e) => return Err(e),
            };

            match assignment {
                Assignment::Snapshot(split) => {
                    if let Step::Cancelled = self.run_snapshot_split(split, summary).await? {
                        return Ok(Step::Cancelled);
                    }
                }
                Assignment::Stream(stub) => {
                    summary.ran_stream_split = true;
                    return self.run_stream_split(stub, summary).await;
                }
                Assignment::Wait => {
                    debug!("Reader {} waits for other readers", self.reader_id);
                    tokio::select! {
                        _ = self.cancel.cancelled() => return Ok(Step::Cancelled),
                        changed = status.changed() => {
                            if changed.is_err() {
                                return Ok(Step::Done(()));
                            }
                        }
                    }
                }
                Assignment::NoMoreSplits => return Ok(Step::Done(())),
            }
        }
    }

    async fn run_snapshot_split(
        &self,
        split: SnapshotSplit,
        summary: &mut ReaderSummary,
    ) -> Result<Step<()>> {
        let split_id = split.split_id();
        let mut failures = 0;
        let output = loop {
            let attempt = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(Step::Cancelled),
                output = read_snapshot_split(self.source.as_ref(), &split) => output,
            };
            match attempt {
                Ok(output) => break output,
                Err(e) if e.is_retryable() && failures < self.options.max_chunk_retries => {
                    failures += 1;
                    warn!(
                        "Reading chunk {} failed ({}/{}): {}, re-running it",
                        split_id, failures, self.options.max_chunk_retries, e
                    );
                }
                Err(e) => return Err(e),
            }
        };

        let ChunkOutput {
            split_id,
            low_watermark,
            high_watermark,
            records,
            applied_changes,
        } = output;
        self.offset_factory.validate(&low_watermark)?;
        self.offset_factory.validate(&high_watermark)?;

        let emitted = records.len();
        let committed = self
            .enumerator
            .commit_finished(
                &self.reader_id,
                &split_id,
                low_watermark.clone(),
                high_watermark.clone(),
            )
            .await;
        match committed {
            Ok(()) => {}
            Err(SyncError::Closed) => {
                info!(
                    "Split enumerator closed, reader {} drops {} records of chunk {}",
                    self.reader_id, emitted, split_id
                );
                return Ok(Step::Done(()));
            }
            Err(e) => {
                warn!(
                    "Reader {} dropping {} records of chunk {}: {}",
                    self.reader_id, emitted, split_id, e
                );
                return Err(e);
            }
        }

        if let Err(e) = self.sink.emit(records).await {
            if let Err(abort) = self.enumerator.abort_delivery(&self.reader_id, &split_id).await {
                warn!("Could not abort delivery of chunk {}: {}", split_id, abort);
            }
            return Err(e);
        }
        match self.enumerator.confirm_delivered(&self.reader_id, &split_id).await {
            Ok(()) | Err(SyncError::Closed) => {}
            Err(e) => return Err(e),
        }

        summary.snapshot_splits += 1;
        summary.snapshot_records += emitted;
        info!(
            "Reader {} finished chunk {} with {} records ({} in-window changes) in [{}, {}]",
            self.reader_id, split_id, emitted, applied_changes, low_watermark, high_watermark
        );
        Ok(Step::Done(()))
    }

    async fn run_stream_split(
        &self,
        stub: StreamSplit,
        summary: &mut ReaderSummary,
    ) -> Result<Step<()>> {
        info!(
            "Reader {} took the stream split starting at {}",
            self.reader_id, stub.starting_offset
        );
        self.offset_factory.validate(&stub.starting_offset)?;

        let stream = tokio::select! {
            _ = self.cancel.cancelled() => return Ok(Step::Cancelled),
            stream = fetch_finished_splits(
                &self.enumerator,
                stub,
                self.options.meta_request_timeout,
                self.options.meta_attempts,
            ) => stream?,
        };
        let mut filter = StreamFilter::new(&stream)?;
        let mut status = self.enumerator.subscribe();

        // Last offset taken off the stream, filtered or not.
        let mut position: Option<Offset> = None;
        let mut failures = 0;
        'reopen: loop {
            let from = position.clone().unwrap_or_else(|| stream.starting_offset.clone());
            let mut changes = match self.source.stream_from(&from).await {
                Ok(changes) => changes,
                Err(e) if e.is_retryable() && failures < self.options.max_stream_retries => {
                    failures += 1;
                    warn!("Opening change stream at {} failed: {}, retrying", from, e);
                    continue 'reopen;
                }
                Err(e) => return Err(e),
            };
            debug!("Reader {} streaming from {}", self.reader_id, from);

            loop {
                if let Step::Cancelled = self.wait_while_suspended(&mut status).await? {
                    return Ok(Step::Cancelled);
                }
                if status.borrow().phase == EnumeratorPhase::Closed {
                    info!("Split enumerator closed, stream reader stops at {:?}", position);
                    return Ok(Step::Done(()));
                }

                let next = tokio::select! {
                    _ = self.cancel.cancelled() => return Ok(Step::Cancelled),
                    next = changes.next() => next,
                };
                let event = match next {
                    None => {
                        info!("Change stream ended at {:?}", position);
                        return Ok(Step::Done(()));
                    }
                    Some(Ok(event)) => event,
                    Some(Err(e))
                        if e.is_retryable() && failures < self.options.max_stream_retries =>
                    {
                        failures += 1;
                        warn!(
                            "Change stream failed ({}/{}): {}, reopening at {:?}",
                            failures, self.options.max_stream_retries, e, position
                        );
                        continue 'reopen;
                    }
                    Some(Err(e)) => return Err(e),
                };
                failures = 0;

                if let Some(last) = &position {
                    if event.offset().is_at_or_before(last) {
                        continue;
                    }
                }
                position = Some(event.offset().clone());

                if let Some(record) = filter.apply(event)? {
                    self.sink.emit(vec![record]).await?;
                    summary.stream_records += 1;
                }
            }
        }
    }

    async fn wait_while_suspended(
        &self,
        status: &mut watch::Receiver<EnumeratorStatus>,
    ) -> Result<Step<()>> {
        let mut logged = false;
        while status.borrow_and_update().stream_suspended {
            if !logged {
                info!("Stream split suspended, reader {} pauses", self.reader_id);
                logged = true;
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(Step::Cancelled),
                changed = status.changed() => changed.map_err(|_| SyncError::Closed)?,
            }
        }
        if logged {
            info!("Stream split resumed, reader {} continues", self.reader_id);
        }
        Ok(Step::Done(()))
    }
}
