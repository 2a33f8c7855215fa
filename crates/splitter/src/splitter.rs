//! Chunk boundary planning.
//!
//! Integer keys whose values are spread roughly evenly over `[min, max]` are
//! cut arithmetically into fixed-width ranges. Anything else (text keys,
//! sparse or skewed integer keys) is cut by asking the source for the key
//! that closes the next `chunk_size` rows. Tables without a usable key
//! become a single unbounded chunk.

use serde::{Deserialize, Serialize};
use sync_core::{
    ChunkDescriptor, ColumnDef, KeyValue, Result, SplitKeySource, SyncError, TableId, TableSchema,
};
use tracing::{debug, info};

use crate::options::SplitterOptions;

/// How a table's key range is cut, decided once from key statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum ChunkPlan {
    /// One chunk covering the whole table.
    Single,
    /// Fixed-width integer ranges starting at `min + step`.
    Even { min: i64, max: i64, step: i64 },
    /// Boundaries discovered row-count-wise from the source.
    Uneven {
        column: String,
        min: KeyValue,
        max: KeyValue,
        chunk_size: usize,
    },
}

/// Resumable position of a [`TableSplitter`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SplitterCursor {
    pub table_id: TableId,
    pub plan: ChunkPlan,
    pub next_chunk_id: u32,
    pub next_start: Option<KeyValue>,
    pub exhausted: bool,
}

/// Lazy, finite sequence of chunk descriptors for one table.
pub struct TableSplitter<'a> {
    source: &'a dyn SplitKeySource,
    cursor: SplitterCursor,
}

impl<'a> TableSplitter<'a> {
    /// Read key statistics and decide how to cut the table.
    ///
    /// Fails with a configuration error if the table cannot be read or the
    /// configured chunk key is not its primary key.
    pub async fn plan(
        source: &'a dyn SplitKeySource,
        schema: &TableSchema,
        options: &SplitterOptions,
    ) -> Result<TableSplitter<'a>> {
        options.validate()?;
        info!("Start splitting table {} into chunks", schema.table_id);

        let plan = match split_column(schema, options)? {
            Some(column) => plan_by_statistics(source, &schema.table_id, column, options)
                .await
                .map_err(|e| {
                    SyncError::config(format!(
                        "Failed to split table {}: {e}",
                        schema.table_id
                    ))
                })?,
            None => {
                info!(
                    "Table {} has no orderable primary key, reading it as a single chunk",
                    schema.table_id
                );
                ChunkPlan::Single
            }
        };

        Ok(Self {
            source,
            cursor: SplitterCursor {
                table_id: schema.table_id.clone(),
                plan,
                next_chunk_id: 0,
                next_start: None,
                exhausted: false,
            },
        })
    }

    /// Continue from a previously captured cursor without re-reading statistics.
    pub fn resume(source: &'a dyn SplitKeySource, cursor: SplitterCursor) -> Self {
        Self { source, cursor }
    }

    pub fn cursor(&self) -> &SplitterCursor {
        &self.cursor
    }

    pub fn plan_kind(&self) -> &ChunkPlan {
        &self.cursor.plan
    }

    pub async fn next_chunk(&mut self) -> Result<Option<ChunkDescriptor>> {
        if self.cursor.exhausted {
            return Ok(None);
        }
        let start = self.cursor.next_start.clone();

        let end = match &self.cursor.plan {
            ChunkPlan::Single => None,
            ChunkPlan::Even { min, max, step } => {
                let from = match &start {
                    None => *min,
                    Some(KeyValue::Int(v)) => *v,
                    Some(other) => {
                        return Err(SyncError::config(format!(
                            "Non-integer boundary {other} in evenly split table {}",
                            self.cursor.table_id
                        )))
                    }
                };
                // Overflow ends the sequence with an open last chunk.
                from.checked_add(*step)
                    .filter(|end| end <= max)
                    .map(KeyValue::Int)
            }
            ChunkPlan::Uneven {
                column,
                min,
                max,
                chunk_size,
            } => {
                let from = start.clone().unwrap_or_else(|| min.clone());
                self.next_chunk_end(column, &from, max, *chunk_size)
                    .await
                    .map_err(|e| {
                        SyncError::config(format!(
                            "Failed to split table {}: {e}",
                            self.cursor.table_id
                        ))
                    })?
            }
        };

        let descriptor = ChunkDescriptor::new(
            self.cursor.table_id.clone(),
            self.cursor.next_chunk_id,
            start,
            end.clone(),
        );
        self.cursor.next_chunk_id += 1;
        match end {
            Some(end) => self.cursor.next_start = Some(end),
            None => {
                self.cursor.exhausted = true;
                info!(
                    "Split table {} into {} chunks",
                    self.cursor.table_id, self.cursor.next_chunk_id
                );
            }
        }
        debug!("Planned chunk {}", descriptor.split_id());
        Ok(Some(descriptor))
    }

    async fn next_chunk_end(
        &self,
        column: &str,
        previous: &KeyValue,
        max: &KeyValue,
        chunk_size: usize,
    ) -> Result<Option<KeyValue>> {
        let table = &self.cursor.table_id;
        let mut end = self
            .source
            .query_next_chunk_max(table, column, chunk_size, previous)
            .await?;
        if end.as_ref() == Some(previous) {
            end = self.source.query_min_above(table, column, previous).await?;
        }
        Ok(end.filter(|end| end < max))
    }

    /// Drain the remaining chunks.
    pub async fn collect_all(mut self) -> Result<Vec<ChunkDescriptor>> {
        let mut chunks = Vec::new();
        while let Some(chunk) = self.next_chunk().await? {
            chunks.push(chunk);
        }
        Ok(chunks)
    }
}

/// Plan and drain a table in one call.
pub async fn split_table(
    source: &dyn SplitKeySource,
    schema: &TableSchema,
    options: &SplitterOptions,
) -> Result<Vec<ChunkDescriptor>> {
    TableSplitter::plan(source, schema, options)
        .await?
        .collect_all()
        .await
}

/// The primary key column to split on, or `None` when the table has no key
/// with a total order.
fn split_column<'s>(
    schema: &'s TableSchema,
    options: &SplitterOptions,
) -> Result<Option<&'s ColumnDef>> {
    if let Some(requested) = &options.chunk_key_column {
        if schema.primary_key.as_deref() != Some(requested.as_str()) {
            return Err(SyncError::config(format!(
                "Chunk key column '{requested}' doesn't exist in the primary key [{}] \
                 of the table {}",
                schema.primary_key.as_deref().unwrap_or_default(),
                schema.table_id
            )));
        }
    }
    Ok(schema
        .key_column()
        .filter(|column| column.column_type.is_orderable()))
}

async fn plan_by_statistics(
    source: &dyn SplitKeySource,
    table: &TableId,
    column: &ColumnDef,
    options: &SplitterOptions,
) -> Result<ChunkPlan> {
    let Some((min, max)) = source.query_min_max(table, &column.name).await? else {
        return Ok(ChunkPlan::Single);
    };
    if min == max {
        return Ok(ChunkPlan::Single);
    }

    if let (KeyValue::Int(lo), KeyValue::Int(hi)) = (&min, &max) {
        let row_count = source.approximate_row_count(table).await?;
        let factor = distribution_factor(*lo, *hi, row_count);
        let evenly_distributed = factor >= options.distribution_factor_lower
            && factor <= options.distribution_factor_upper;
        if evenly_distributed {
            let step = ((factor * options.chunk_size as f64) as i64).max(1);
            info!(
                "Use evenly-sized chunks for table {}, the approximate row count is {}, \
                 the chunk size is {}, the dynamic chunk size is {}",
                table, row_count, options.chunk_size, step
            );
            if row_count <= options.chunk_size as u64 {
                return Ok(ChunkPlan::Single);
            }
            return Ok(ChunkPlan::Even {
                min: *lo,
                max: *hi,
                step,
            });
        }
        debug!(
            "Table {} key distribution factor {} is outside [{}, {}]",
            table, factor, options.distribution_factor_lower, options.distribution_factor_upper
        );
    }

    info!(
        "Use unevenly-sized chunks for table {}, the chunk size is {}",
        table, options.chunk_size
    );
    Ok(ChunkPlan::Uneven {
        column: column.name.clone(),
        min,
        max,
        chunk_size: options.chunk_size,
    })
}

/// `(max - min + 1) / row_count`, rounded up to four decimals. An empty row
/// count estimate yields `f64::MAX`.
pub fn distribution_factor(min: i64, max: i64, row_count: u64) -> f64 {
    if row_count == 0 {
        return f64::MAX;
    }
    let span = (i128::from(max) - i128::from(min) + 1) as f64;
    let factor = span / row_count as f64;
    (factor * 10_000.0).ceil() / 10_000.0
}
