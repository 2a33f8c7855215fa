//! Record sink that keeps everything it receives.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use sync_core::{ChangeOp, Fields, KeyValue, OutputRecord, RecordSink, Result, TableId};
use tokio::sync::Mutex;

#[derive(Clone, Default)]
pub struct MemorySink {
    records: Arc<Mutex<Vec<OutputRecord>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn records(&self) -> Vec<OutputRecord> {
        self.records.lock().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.lock().await.is_empty()
    }

    /// Table contents obtained by applying every received record in order.
    pub async fn materialize(&self) -> BTreeMap<TableId, BTreeMap<KeyValue, Fields>> {
        materialize(&self.records.lock().await)
    }
}

#[async_trait]
impl RecordSink for MemorySink {
    async fn emit(&self, records: Vec<OutputRecord>) -> Result<()> {
        self.records.lock().await.extend(records);
        Ok(())
    }
}

/// Apply records in order: inserts and updates overwrite, deletes remove.
pub fn materialize(records: &[OutputRecord]) -> BTreeMap<TableId, BTreeMap<KeyValue, Fields>> {
    let mut tables: BTreeMap<TableId, BTreeMap<KeyValue, Fields>> = BTreeMap::new();
    for record in records {
        let rows = tables.entry(record.table_id.clone()).or_default();
        match (&record.op, &record.fields) {
            (ChangeOp::Delete, _) | (_, None) => {
                rows.remove(&record.key);
            }
            (_, Some(fields)) => {
                rows.insert(record.key.clone(), fields.clone());
            }
        }
    }
    tables
}
