//! Downstream record delivery.

use async_trait::async_trait;

use crate::error::Result;
use crate::row::OutputRecord;

/// Receives the unified, per-table ordered record sequence.
#[async_trait]
pub trait RecordSink: Send + Sync {
    async fn emit(&self, records: Vec<OutputRecord>) -> Result<()>;
}
