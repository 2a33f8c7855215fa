//! Split enumerator: owns the assignment state of one capture.
//!
//! Tables are cut into snapshot splits up front. Readers pull splits through
//! an [`EnumeratorHandle`], report each finished split with its low and high
//! watermark, and once every split is done one reader receives the stream
//! split and pages its finished-split metadata in with
//! [`EnumeratorHandle::request_meta_group`].

mod actor;
mod checkpoint;
mod meta;
mod options;
mod state;

pub use actor::{spawn_enumerator, EnumeratorHandle};
pub use checkpoint::EnumeratorCheckpoint;
pub use meta::{meta_group, total_groups};
pub use options::{EnumeratorOptions, DEFAULT_SPLIT_META_GROUP_SIZE};
pub use state::{Assignment, EnumeratorPhase, EnumeratorStatus, SplitEnumerator};

use chunk_sync_splitter::split_table;
use sync_core::{Result, SourceConnection, SplitKeySource, SyncError, TableId};
use tracing::info;

/// Read each table's schema, split it into chunks and build the enumerator.
///
/// Fails with a configuration error for an empty table list or any table
/// that cannot be read.
pub async fn create_split_enumerator<S>(
    tables: &[TableId],
    source: &S,
    options: &EnumeratorOptions,
) -> Result<SplitEnumerator>
where
    S: SourceConnection + SplitKeySource,
{
    if tables.is_empty() {
        return Err(SyncError::config("no tables to capture"));
    }

    let mut schemas = Vec::with_capacity(tables.len());
    let mut chunks = Vec::new();
    for table in tables {
        let schema = source.table_schema(table).await.map_err(|e| {
            SyncError::config(format!("Failed to read schema of table {table}: {e}"))
        })?;
        let table_chunks = split_table(source, &schema, &options.splitter).await?;
        info!("Table {} contributes {} snapshot splits", table, table_chunks.len());
        chunks.extend(table_chunks);
        schemas.push(schema);
    }

    SplitEnumerator::new(
        source.offset_kind(),
        schemas,
        chunks,
        options.split_meta_group_size,
    )
}
