//! Record output: JSON Lines and fan-out to several sinks.

use std::sync::Arc;

use async_trait::async_trait;
use sync_core::{OutputRecord, RecordSink, Result};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

/// Writes one JSON object per record and flushes after every batch.
pub struct JsonlSink<W> {
    writer: Mutex<W>,
}

impl<W: AsyncWrite + Unpin + Send> JsonlSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }
}

impl JsonlSink<tokio::io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(tokio::io::stdout())
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> RecordSink for JsonlSink<W> {
    async fn emit(&self, records: Vec<OutputRecord>) -> Result<()> {
        let mut buffer = Vec::with_capacity(records.len() * 128);
        for record in &records {
            serde_json::to_writer(&mut buffer, record)?;
            buffer.push(b'\n');
        }
        let mut writer = self.writer.lock().await;
        writer.write_all(&buffer).await?;
        writer.flush().await?;
        Ok(())
    }
}

/// Hands every batch to each inner sink in order.
pub struct FanoutSink {
    sinks: Vec<Arc<dyn RecordSink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Arc<dyn RecordSink>>) -> Self {
        Self { sinks }
    }
}

#[async_trait]
impl RecordSink for FanoutSink {
    async fn emit(&self, records: Vec<OutputRecord>) -> Result<()> {
        if let Some((last, rest)) = self.sinks.split_last() {
            for sink in rest {
                sink.emit(records.clone()).await?;
            }
            last.emit(records).await?;
        }
        Ok(())
    }
}
