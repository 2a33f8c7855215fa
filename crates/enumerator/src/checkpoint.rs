//! Durable enumerator state.

use std::collections::BTreeMap;

use ::checkpoint::{Checkpoint, SyncPhase};
use serde::{Deserialize, Serialize};
use sync_core::{ChunkDescriptor, Offset, OffsetKind, StreamSplit, TableId, TableSchema};

/// Everything needed to rebuild a [`SplitEnumerator`](crate::SplitEnumerator)
/// after a restart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnumeratorCheckpoint {
    pub offset_kind: OffsetKind,
    pub tables: Vec<TableId>,
    pub table_schemas: BTreeMap<TableId, TableSchema>,
    /// All snapshot splits in assignment order.
    pub splits: Vec<ChunkDescriptor>,
    /// Split id to `(low, high)` watermark of every finished split.
    pub finished: BTreeMap<String, (Offset, Offset)>,
    /// Stream split without finished-split metadata, if created.
    pub stream_split: Option<StreamSplit>,
    pub meta_group_size: usize,
}

impl EnumeratorCheckpoint {
    /// Phase this state belongs to.
    pub fn phase(&self) -> SyncPhase {
        if self.stream_split.is_some() {
            SyncPhase::Stream
        } else {
            SyncPhase::Snapshot
        }
    }
}

impl Checkpoint for EnumeratorCheckpoint {
    const KIND: &'static str = "split-enumerator";

    fn to_cli_string(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    fn from_cli_string(s: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(s)?)
    }

    fn summary(&self) -> String {
        match &self.stream_split {
            Some(stream) => format!(
                "{}/{} snapshot splits finished, stream split from {}{}",
                self.finished.len(),
                self.splits.len(),
                stream.starting_offset,
                if stream.is_suspended { " (suspended)" } else { "" }
            ),
            None => format!(
                "{}/{} snapshot splits finished",
                self.finished.len(),
                self.splits.len()
            ),
        }
    }
}
