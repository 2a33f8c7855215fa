//! Seed data and random changes for the in-memory source.

use std::time::Duration;

use anyhow::Context;
use chunk_sync_memory_source::MemoryDatabase;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::json;
use sync_core::{ColumnDef, ColumnType, Fields, KeyValue, Row, TableId, TableSchema};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::{TableConfig, WorkloadConfig};

/// Schema every generated table uses.
pub fn table_schema(table: &TableId) -> TableSchema {
    TableSchema::new(
        table.clone(),
        vec![
            ColumnDef::new("id", ColumnType::Integer),
            ColumnDef::new("name", ColumnType::Text),
            ColumnDef::new("score", ColumnType::Float),
            ColumnDef::new("updated_at", ColumnType::Timestamp),
        ],
        Some("id"),
    )
}

fn row_fields(id: i64, score: f64) -> Fields {
    Fields::from([
        ("name".to_string(), json!(format!("item-{id}"))),
        ("score".to_string(), json!(score)),
        (
            "updated_at".to_string(),
            json!(chrono::Utc::now().to_rfc3339()),
        ),
    ])
}

/// Create each table with keys `1..=rows`.
pub async fn seed_tables(
    db: &MemoryDatabase,
    tables: &[TableConfig],
) -> anyhow::Result<Vec<TableId>> {
    let mut ids = Vec::with_capacity(tables.len());
    for table in tables {
        let id = TableId::new(table.name.clone());
        db.create_table(table_schema(&id)).await;
        let rows = (1..=table.rows as i64).map(|key| Row::new(key, row_fields(key, key as f64)));
        db.bulk_load(&id, rows)
            .await
            .with_context(|| format!("Failed to seed table {id}"))?;
        info!("Seeded table {} with {} rows", id, table.rows);
        ids.push(id);
    }
    Ok(ids)
}

/// Counts of applied changes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkloadReport {
    pub inserts: u64,
    pub updates: u64,
    pub deletes: u64,
}

impl WorkloadReport {
    pub fn total(&self) -> u64 {
        self.inserts + self.updates + self.deletes
    }
}

/// Apply `config.mutations` random changes spread over `tables`, pausing
/// `pause` between them. Stops early when `cancel` fires.
pub async fn run_mutations(
    db: MemoryDatabase,
    tables: Vec<(TableId, u64)>,
    config: WorkloadConfig,
    pause: Duration,
    cancel: CancellationToken,
) -> anyhow::Result<WorkloadReport> {
    let seed = config.seed.unwrap_or_else(rand::random);
    let mut rng = StdRng::seed_from_u64(seed);
    let mut report = WorkloadReport::default();
    if tables.is_empty() || config.mutations == 0 {
        return Ok(report);
    }
    info!(
        "Applying {} random changes (seed {})",
        config.mutations, seed
    );

    // Next fresh key per table.
    let mut next_keys: Vec<i64> = tables.iter().map(|(_, rows)| *rows as i64 + 1).collect();

    for n in 0..config.mutations {
        if cancel.is_cancelled() {
            info!("Workload cancelled after {} changes", n);
            break;
        }
        let t = rng.random_range(0..tables.len());
        let (table, _) = &tables[t];
        let existing = next_keys[t] - 1;
        let roll: f64 = rng.random();

        if roll < config.delete_ratio && existing > 0 {
            let key = KeyValue::Int(rng.random_range(1..=existing));
            db.delete(table, key).await?;
            report.deletes += 1;
        } else if roll < config.delete_ratio + config.insert_ratio || existing == 0 {
            let key = next_keys[t];
            next_keys[t] += 1;
            db.insert(table, KeyValue::Int(key), row_fields(key, rng.random_range(0.0..100.0)))
                .await?;
            report.inserts += 1;
        } else {
            let key = rng.random_range(1..=existing);
            db.update(table, KeyValue::Int(key), row_fields(key, rng.random_range(0.0..100.0)))
                .await?;
            report.updates += 1;
        }

        if n % 100 == 99 {
            debug!("Applied {} changes", n + 1);
        }
        if !pause.is_zero() {
            tokio::time::sleep(pause).await;
        } else {
            tokio::task::yield_now().await;
        }
    }

    info!(
        "Workload done: {} inserts, {} updates, {} deletes",
        report.inserts, report.updates, report.deletes
    );
    Ok(report)
}
