//! Split assignment state machine.
//!
//! `AssigningSnapshot → AwaitingFinish → StreamAssigned → Closed`
//!
//! Snapshot splits leave the backlog in descriptor order, first requester
//! wins. Finishing a split takes two steps: the reader commits its
//! watermarks, emits the chunk, then confirms delivery. Once every split is
//! committed and delivered the single stream split is created; it is granted
//! to the first reader that asks after that.
//! A reader failure puts its splits back into the backlog, which moves the
//! machine back to `AssigningSnapshot`.
//!
//! Every rejected message leaves the state untouched.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use sync_core::{
    ChunkDescriptor, FinishedSplitInfo, MetaRequestEvent, MetaResponseGroup, Offset, OffsetKind,
    Result, SnapshotSplit, StreamSplit, SyncError, TableId, TableSchema, STREAM_SPLIT_ID,
};
use tracing::{debug, info, warn};

use crate::checkpoint::EnumeratorCheckpoint;
use crate::meta;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EnumeratorPhase {
    /// Unassigned snapshot splits remain.
    AssigningSnapshot,
    /// Every snapshot split is assigned or finished; the stream split is not
    /// granted yet.
    AwaitingFinish,
    /// The stream split is held by a reader.
    StreamAssigned,
    Closed,
}

impl EnumeratorPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnumeratorPhase::AssigningSnapshot => "assigning_snapshot",
            EnumeratorPhase::AwaitingFinish => "awaiting_finish",
            EnumeratorPhase::StreamAssigned => "stream_assigned",
            EnumeratorPhase::Closed => "closed",
        }
    }
}

impl std::fmt::Display for EnumeratorPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Answer to a split request.
#[derive(Debug, Clone, PartialEq)]
pub enum Assignment {
    Snapshot(SnapshotSplit),
    /// The stream split without finished-split metadata.
    Stream(StreamSplit),
    /// Nothing to hand out until other readers finish or fail.
    Wait,
    NoMoreSplits,
}

/// Point-in-time view published to readers and monitors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnumeratorStatus {
    pub phase: EnumeratorPhase,
    pub total_splits: usize,
    pub remaining_splits: usize,
    pub stream_split_created: bool,
    pub stream_suspended: bool,
}

pub struct SplitEnumerator {
    offset_kind: OffsetKind,
    tables: Vec<TableId>,
    table_schemas: BTreeMap<TableId, TableSchema>,
    splits: Vec<SnapshotSplit>,
    index: HashMap<String, usize>,
    backlog: BTreeSet<usize>,
    assigned: HashMap<usize, String>,
    /// Committed splits whose records are still being emitted, by reader.
    delivering: HashMap<usize, String>,
    finished_count: usize,
    stream_split: Option<StreamSplit>,
    stream_assignee: Option<String>,
    meta_group_size: usize,
    closed: bool,
}

impl SplitEnumerator {
    /// `chunks` must be ordered by table, then chunk id.
    pub fn new(
        offset_kind: OffsetKind,
        schemas: Vec<TableSchema>,
        chunks: Vec<ChunkDescriptor>,
        meta_group_size: usize,
    ) -> Result<Self> {
        if schemas.is_empty() {
            return Err(SyncError::config("at least one table is required"));
        }
        if chunks.is_empty() {
            return Err(SyncError::config("at least one snapshot split is required"));
        }
        if meta_group_size == 0 {
            return Err(SyncError::config("split meta group size must be at least 1"));
        }

        let tables: Vec<TableId> = schemas.iter().map(|s| s.table_id.clone()).collect();
        let table_schemas = schemas
            .into_iter()
            .map(|s| (s.table_id.clone(), s))
            .collect::<BTreeMap<_, _>>();

        let mut index = HashMap::with_capacity(chunks.len());
        let mut splits = Vec::with_capacity(chunks.len());
        for (pos, chunk) in chunks.into_iter().enumerate() {
            if !table_schemas.contains_key(&chunk.table_id) {
                return Err(SyncError::config(format!(
                    "chunk {} belongs to an unknown table",
                    chunk.split_id()
                )));
            }
            if index.insert(chunk.split_id(), pos).is_some() {
                return Err(SyncError::config(format!(
                    "duplicate split id {}",
                    chunk.split_id()
                )));
            }
            splits.push(SnapshotSplit::new(chunk));
        }

        info!(
            "Created split enumerator for {} tables with {} snapshot splits",
            tables.len(),
            splits.len()
        );

        Ok(Self {
            offset_kind,
            tables,
            table_schemas,
            backlog: (0..splits.len()).collect(),
            splits,
            index,
            assigned: HashMap::new(),
            delivering: HashMap::new(),
            finished_count: 0,
            stream_split: None,
            stream_assignee: None,
            meta_group_size,
            closed: false,
        })
    }

    pub fn phase(&self) -> EnumeratorPhase {
        if self.closed {
            EnumeratorPhase::Closed
        } else if self.stream_assignee.is_some() {
            EnumeratorPhase::StreamAssigned
        } else if !self.backlog.is_empty() {
            EnumeratorPhase::AssigningSnapshot
        } else {
            EnumeratorPhase::AwaitingFinish
        }
    }

    pub fn status(&self) -> EnumeratorStatus {
        EnumeratorStatus {
            phase: self.phase(),
            total_splits: self.splits.len(),
            remaining_splits: self.remaining_splits(),
            stream_split_created: self.stream_split.is_some(),
            stream_suspended: self
                .stream_split
                .as_ref()
                .map(|s| s.is_suspended)
                .unwrap_or(false),
        }
    }

    pub fn offset_kind(&self) -> OffsetKind {
        self.offset_kind
    }

    pub fn tables(&self) -> &[TableId] {
        &self.tables
    }

    pub fn splits(&self) -> &[SnapshotSplit] {
        &self.splits
    }

    pub fn stream_split(&self) -> Option<&StreamSplit> {
        self.stream_split.as_ref()
    }

    /// Snapshot splits not yet finished.
    pub fn remaining_splits(&self) -> usize {
        self.splits.len() - self.finished_count
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(SyncError::Closed);
        }
        Ok(())
    }

    pub fn request_split(&mut self, reader_id: &str) -> Result<Assignment> {
        self.ensure_open()?;

        if let Some(pos) = self.backlog.pop_first() {
            self.assigned.insert(pos, reader_id.to_string());
            let split = self.splits[pos].clone();
            info!("Assigned snapshot split {} to reader {}", split.split_id(), reader_id);
            return Ok(Assignment::Snapshot(split));
        }

        if let Some(stream) = &self.stream_split {
            if self.stream_assignee.is_none() {
                self.stream_assignee = Some(reader_id.to_string());
                info!(
                    "Assigned stream split starting at {} to reader {}",
                    stream.starting_offset, reader_id
                );
                return Ok(Assignment::Stream(stream.to_stub()));
            }
            return Ok(Assignment::NoMoreSplits);
        }

        debug!(
            "Reader {} waits, {} snapshot splits still running",
            reader_id,
            self.assigned.len()
        );
        Ok(Assignment::Wait)
    }

    fn reject(&self, reader_id: &str, split_id: &str, message: impl Into<String>) -> SyncError {
        let message = message.into();
        warn!(
            "Rejected message from reader {} for split {}: {}",
            reader_id, split_id, message
        );
        SyncError::protocol(split_id, message)
    }

    fn position(&self, reader_id: &str, split_id: &str) -> Result<usize> {
        self.index
            .get(split_id)
            .copied()
            .ok_or_else(|| self.reject(reader_id, split_id, "unknown snapshot split"))
    }

    /// Commit a finished snapshot split and confirm its delivery in one step.
    /// For callers that emitted the split's records beforehand.
    pub fn report_finished(
        &mut self,
        reader_id: &str,
        split_id: &str,
        low: Offset,
        high: Offset,
    ) -> Result<()> {
        self.commit_finished(reader_id, split_id, low, high)?;
        self.confirm_delivered(reader_id, split_id)
    }

    /// Record a finished snapshot split with its watermarks. The reader may
    /// emit the split's records only after this is accepted, and must follow
    /// up with [`confirm_delivered`](Self::confirm_delivered) or
    /// [`abort_delivery`](Self::abort_delivery).
    ///
    /// A split that was returned to the backlog after its reader was declared
    /// failed may still be committed by that reader; the commit is accepted
    /// and the split leaves the backlog. A commit for a split currently
    /// assigned to a different reader is rejected.
    pub fn commit_finished(
        &mut self,
        reader_id: &str,
        split_id: &str,
        low: Offset,
        high: Offset,
    ) -> Result<()> {
        self.ensure_open()?;

        let pos = self.position(reader_id, split_id)?;
        if self.splits[pos].finished {
            return Err(self.reject(reader_id, split_id, "snapshot split already finished"));
        }
        if let Some(owner) = self.assigned.get(&pos) {
            if owner != reader_id {
                return Err(self.reject(
                    reader_id,
                    split_id,
                    format!("split is assigned to reader {owner}, not {reader_id}"),
                ));
            }
        }
        for watermark in [&low, &high] {
            if watermark.kind() != self.offset_kind {
                return Err(self.reject(
                    reader_id,
                    split_id,
                    format!("watermark {watermark} is not a {} offset", self.offset_kind),
                ));
            }
        }
        if low.compare(&high)? == Ordering::Greater {
            return Err(self.reject(
                reader_id,
                split_id,
                format!("low watermark {low} is after high watermark {high}"),
            ));
        }

        if self.backlog.remove(&pos) {
            warn!(
                "Accepted late finish of returned split {} from reader {}",
                split_id, reader_id
            );
        }
        self.assigned.remove(&pos);
        self.delivering.insert(pos, reader_id.to_string());
        let split = &mut self.splits[pos];
        split.low_watermark = Some(low);
        split.high_watermark = Some(high);
        split.finished = true;
        self.finished_count += 1;
        info!(
            "Snapshot split {} finished by reader {} ({}/{})",
            split_id,
            reader_id,
            self.finished_count,
            self.splits.len()
        );
        Ok(())
    }

    /// The records of a committed split reached the sink. Creates the stream
    /// split once every split is finished and delivered.
    ///
    /// Confirming a split whose pending delivery was already released by
    /// [`return_splits`](Self::return_splits) is a no-op.
    pub fn confirm_delivered(&mut self, reader_id: &str, split_id: &str) -> Result<()> {
        self.ensure_open()?;

        let pos = self.position(reader_id, split_id)?;
        let pending = self.delivering.get(&pos).cloned();
        match pending {
            Some(owner) if owner == reader_id => {
                self.delivering.remove(&pos);
                debug!("Reader {} delivered split {}", reader_id, split_id);
            }
            Some(owner) => {
                let message = format!("split is being delivered by reader {owner}");
                return Err(self.reject(reader_id, split_id, message));
            }
            None if self.splits[pos].finished => {}
            None => return Err(self.reject(reader_id, split_id, "snapshot split not committed")),
        }
        self.maybe_create_stream_split()
    }

    /// Emitting a committed split failed. The split is un-finished and goes
    /// back to the backlog.
    pub fn abort_delivery(&mut self, reader_id: &str, split_id: &str) -> Result<()> {
        self.ensure_open()?;

        let pos = self.position(reader_id, split_id)?;
        if self.delivering.get(&pos).map(String::as_str) != Some(reader_id) {
            return Err(self.reject(reader_id, split_id, "no pending delivery for this reader"));
        }
        self.delivering.remove(&pos);
        let split = &mut self.splits[pos];
        split.low_watermark = None;
        split.high_watermark = None;
        split.finished = false;
        self.finished_count -= 1;
        self.backlog.insert(pos);
        warn!(
            "Reader {} could not deliver split {}, split goes back to the backlog",
            reader_id, split_id
        );
        Ok(())
    }

    fn maybe_create_stream_split(&mut self) -> Result<()> {
        if self.stream_split.is_none()
            && self.finished_count == self.splits.len()
            && self.delivering.is_empty()
        {
            self.create_stream_split()?;
        }
        Ok(())
    }

    /// Create the stream split. Only legal once, after every snapshot split
    /// finished and was delivered; `confirm_delivered` calls this for the
    /// last split.
    pub fn create_stream_split(&mut self) -> Result<&StreamSplit> {
        self.ensure_open()?;
        if self.stream_split.is_some() {
            return Err(SyncError::protocol(
                STREAM_SPLIT_ID,
                "stream split already created",
            ));
        }
        if self.finished_count != self.splits.len() {
            return Err(SyncError::protocol(
                STREAM_SPLIT_ID,
                format!(
                    "only {}/{} snapshot splits finished",
                    self.finished_count,
                    self.splits.len()
                ),
            ));
        }
        if !self.delivering.is_empty() {
            return Err(SyncError::protocol(
                STREAM_SPLIT_ID,
                format!("{} snapshot splits still being delivered", self.delivering.len()),
            ));
        }

        let infos = self.finished_split_infos();
        let starting_offset = infos
            .iter()
            .map(|info| &info.low_watermark)
            .min_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal))
            .cloned()
            .unwrap_or_else(|| Offset::initial(self.offset_kind));

        info!(
            "All {} snapshot splits finished, created stream split starting at {}",
            infos.len(),
            starting_offset
        );
        let stream = StreamSplit {
            split_id: STREAM_SPLIT_ID.to_string(),
            starting_offset,
            ending_offset: Offset::no_stopping(self.offset_kind),
            table_schemas: self.table_schemas.clone(),
            total_finished_split_size: infos.len(),
            finished_splits_info: infos,
            is_suspended: false,
        };
        Ok(&*self.stream_split.insert(stream))
    }

    fn finished_split_infos(&self) -> Vec<FinishedSplitInfo> {
        self.splits
            .iter()
            .filter_map(|split| {
                let low = split.low_watermark.clone()?;
                let high = split.high_watermark.clone()?;
                Some(FinishedSplitInfo {
                    table_id: split.descriptor.table_id.clone(),
                    split_id: split.split_id(),
                    split_key_start: split.descriptor.split_key_start.clone(),
                    split_key_end: split.descriptor.split_key_end.clone(),
                    low_watermark: low,
                    high_watermark: high,
                })
            })
            .collect()
    }

    /// Put every split held by `reader_id` back into the backlog. Returns the
    /// ids of the returned splits.
    ///
    /// Splits the reader already committed stay finished; their pending
    /// delivery is released as if confirmed.
    pub fn return_splits(&mut self, reader_id: &str) -> Vec<String> {
        let mut released: Vec<usize> = self
            .delivering
            .iter()
            .filter(|(_, owner)| owner.as_str() == reader_id)
            .map(|(pos, _)| *pos)
            .collect();
        released.sort_unstable();
        for pos in released {
            self.delivering.remove(&pos);
            warn!(
                "Reader {} left split {} committed, releasing its delivery",
                reader_id,
                self.splits[pos].split_id()
            );
        }
        if !self.closed {
            if let Err(e) = self.maybe_create_stream_split() {
                warn!("Could not create stream split: {}", e);
            }
        }

        let mut positions: Vec<usize> = self
            .assigned
            .iter()
            .filter(|(_, owner)| owner.as_str() == reader_id)
            .map(|(pos, _)| *pos)
            .collect();
        positions.sort_unstable();

        let mut returned = Vec::with_capacity(positions.len() + 1);
        for pos in positions {
            self.assigned.remove(&pos);
            self.backlog.insert(pos);
            returned.push(self.splits[pos].split_id());
        }
        if self.stream_assignee.as_deref() == Some(reader_id) {
            self.stream_assignee = None;
            returned.push(STREAM_SPLIT_ID.to_string());
        }
        if !returned.is_empty() {
            warn!("Reader {} returned splits {:?}", reader_id, returned);
        }
        returned
    }

    pub fn suspend_stream(&mut self) -> Result<()> {
        self.set_stream_suspended(true)
    }

    pub fn resume_stream(&mut self) -> Result<()> {
        self.set_stream_suspended(false)
    }

    fn set_stream_suspended(&mut self, suspended: bool) -> Result<()> {
        self.ensure_open()?;
        let stream = self
            .stream_split
            .as_mut()
            .ok_or_else(|| SyncError::protocol(STREAM_SPLIT_ID, "stream split not created yet"))?;
        stream.is_suspended = suspended;
        info!(
            "Stream split {}",
            if suspended { "suspended" } else { "resumed" }
        );
        Ok(())
    }

    /// Serve one group of finished-split metadata. Requests come from the
    /// reader holding the stream split.
    pub fn handle_meta_request(&self, request: &MetaRequestEvent) -> Result<MetaResponseGroup> {
        self.ensure_open()?;
        let reader_id = self.stream_assignee.as_deref().unwrap_or("<none>");
        let stream = self.stream_split.as_ref().ok_or_else(|| {
            self.reject(reader_id, &request.split_id, "stream split not created yet")
        })?;
        let response = meta::meta_group(
            &stream.split_id,
            &stream.finished_splits_info,
            self.meta_group_size,
            request,
        )
        .inspect_err(|e| {
            warn!(
                "Rejected metadata request from reader {} for split {}: {}",
                reader_id, request.split_id, e
            )
        })?;
        debug!(
            "Served metadata group {}/{} with {} entries",
            response.group_id,
            response.total_groups,
            response.entries.len()
        );
        Ok(response)
    }

    pub fn close(&mut self) {
        if !self.closed {
            info!("Closing split enumerator in phase {}", self.phase());
            self.closed = true;
        }
    }

    /// Durable state: finished splits with their watermarks and the stream
    /// split. In-flight assignments and splits whose delivery is not
    /// confirmed are not recorded.
    pub fn snapshot_state(&self) -> EnumeratorCheckpoint {
        EnumeratorCheckpoint {
            offset_kind: self.offset_kind,
            tables: self.tables.clone(),
            table_schemas: self.table_schemas.clone(),
            splits: self.splits.iter().map(|s| s.descriptor.clone()).collect(),
            finished: self
                .splits
                .iter()
                .enumerate()
                .filter(|(pos, _)| !self.delivering.contains_key(pos))
                .filter_map(|(_, s)| {
                    Some((
                        s.split_id(),
                        (s.low_watermark.clone()?, s.high_watermark.clone()?),
                    ))
                })
                .collect(),
            stream_split: self.stream_split.as_ref().map(StreamSplit::to_stub),
            meta_group_size: self.meta_group_size,
        }
    }

    /// Rebuild from a checkpoint. Unfinished splits, including ones that were
    /// assigned when the checkpoint was taken, go back to the backlog.
    pub fn restore(state: EnumeratorCheckpoint) -> Result<Self> {
        let schemas = state
            .tables
            .iter()
            .map(|table| {
                state.table_schemas.get(table).cloned().ok_or_else(|| {
                    SyncError::config(format!("checkpoint has no schema for table {table}"))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let mut enumerator = Self::new(
            state.offset_kind,
            schemas,
            state.splits,
            state.meta_group_size,
        )?;

        for (split_id, (low, high)) in state.finished {
            let pos = *enumerator.index.get(&split_id).ok_or_else(|| {
                SyncError::config(format!("checkpoint finishes unknown split {split_id}"))
            })?;
            if low.kind() != state.offset_kind
                || high.kind() != state.offset_kind
                || low.is_after(&high)
            {
                return Err(SyncError::config(format!(
                    "checkpoint has invalid watermarks for split {split_id}: [{low}, {high}]"
                )));
            }
            let split = &mut enumerator.splits[pos];
            split.low_watermark = Some(low);
            split.high_watermark = Some(high);
            split.finished = true;
            enumerator.backlog.remove(&pos);
            enumerator.finished_count += 1;
        }

        let all_finished = enumerator.finished_count == enumerator.splits.len();
        match state.stream_split {
            Some(stub) => {
                if !all_finished {
                    return Err(SyncError::config(
                        "checkpoint has a stream split but unfinished snapshot splits",
                    ));
                }
                let infos = enumerator.finished_split_infos();
                let total = infos.len();
                let mut stream = stub.with_finished_splits(infos);
                stream.total_finished_split_size = total;
                enumerator.stream_split = Some(stream);
            }
            None if all_finished => {
                enumerator.create_stream_split()?;
            }
            None => {}
        }

        info!(
            "Restored split enumerator: {}/{} snapshot splits finished, stream split {}",
            enumerator.finished_count,
            enumerator.splits.len(),
            if enumerator.stream_split.is_some() {
                "created"
            } else {
                "pending"
            }
        );
        Ok(enumerator)
    }
}
