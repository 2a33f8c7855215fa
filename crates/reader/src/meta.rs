//! Reader side of the finished-split metadata exchange.

use std::time::Duration;

use async_trait::async_trait;
use chunk_sync_enumerator::EnumeratorHandle;
use sync_core::{
    FinishedSplitInfo, MetaRequestEvent, MetaResponseGroup, Result, StreamSplit, SyncError,
};
use tracing::{debug, info, warn};

/// Anything that answers metadata group requests.
#[async_trait]
pub trait MetaExchange: Send + Sync {
    async fn request_meta_group(&self, request: MetaRequestEvent) -> Result<MetaResponseGroup>;
}

#[async_trait]
impl MetaExchange for EnumeratorHandle {
    async fn request_meta_group(&self, request: MetaRequestEvent) -> Result<MetaResponseGroup> {
        EnumeratorHandle::request_meta_group(self, request).await
    }
}

/// Pulls metadata groups `0, 1, 2, ...` for one stream split.
///
/// A request that times out or fails transiently is repeated with the same
/// group id. Groups are immutable on the enumerator side, so a repeat always
/// yields the same answer.
pub struct MetaGroupFetcher<'a, M: MetaExchange + ?Sized> {
    exchange: &'a M,
    split_id: String,
    next_group_id: usize,
    total_groups: Option<usize>,
    timeout: Duration,
    attempts: u32,
}

impl<'a, M: MetaExchange + ?Sized> MetaGroupFetcher<'a, M> {
    pub fn new(
        exchange: &'a M,
        split_id: impl Into<String>,
        timeout: Duration,
        attempts: u32,
    ) -> Self {
        Self {
            exchange,
            split_id: split_id.into(),
            next_group_id: 0,
            total_groups: None,
            timeout,
            attempts: attempts.max(1),
        }
    }

    /// Id of the group the next call asks for.
    pub fn next_group_id(&self) -> usize {
        self.next_group_id
    }

    pub fn total_groups(&self) -> Option<usize> {
        self.total_groups
    }

    /// Next group, or `None` once the last one was received.
    pub async fn next_group(&mut self) -> Result<Option<MetaResponseGroup>> {
        if let Some(total) = self.total_groups {
            if self.next_group_id >= total {
                return Ok(None);
            }
        }

        let group = self.request_with_retry(self.next_group_id).await?;
        self.check_group(&group)?;
        self.total_groups = Some(group.total_groups);
        self.next_group_id += 1;
        debug!(
            "Received metadata group {}/{} with {} entries",
            group.group_id + 1,
            group.total_groups,
            group.entries.len()
        );
        Ok(Some(group))
    }

    async fn request_with_retry(&self, group_id: usize) -> Result<MetaResponseGroup> {
        let request = MetaRequestEvent {
            split_id: self.split_id.clone(),
            request_meta_group_id: group_id,
        };
        let mut attempt = 0;
        loop {
            attempt += 1;
            let failure = match tokio::time::timeout(
                self.timeout,
                self.exchange.request_meta_group(request.clone()),
            )
            .await
            {
                Ok(Ok(group)) => return Ok(group),
                Ok(Err(e)) if e.is_retryable() => e.to_string(),
                Ok(Err(e)) => return Err(e),
                Err(_) => format!("no response within {:?}", self.timeout),
            };
            if attempt >= self.attempts {
                return Err(SyncError::transient(format!(
                    "metadata group {group_id} of split {} failed after {attempt} attempts: \
                     {failure}",
                    self.split_id
                )));
            }
            warn!(
                "Metadata group {} of split {} failed (attempt {}/{}): {}, retrying",
                group_id, self.split_id, attempt, self.attempts, failure
            );
        }
    }

    fn check_group(&self, group: &MetaResponseGroup) -> Result<()> {
        if group.split_id != self.split_id {
            return Err(SyncError::protocol(
                &self.split_id,
                format!("metadata group belongs to split '{}'", group.split_id),
            ));
        }
        if group.group_id != self.next_group_id {
            return Err(SyncError::protocol(
                &self.split_id,
                format!(
                    "requested metadata group {}, received {}",
                    self.next_group_id, group.group_id
                ),
            ));
        }
        if group.total_groups == 0 || group.group_id >= group.total_groups {
            return Err(SyncError::protocol(
                &self.split_id,
                format!(
                    "metadata group {} claims {} groups in total",
                    group.group_id, group.total_groups
                ),
            ));
        }
        if let Some(total) = self.total_groups {
            if total != group.total_groups {
                return Err(SyncError::protocol(
                    &self.split_id,
                    format!(
                        "metadata group count changed from {total} to {}",
                        group.total_groups
                    ),
                ));
            }
        }
        Ok(())
    }
}

/// Fill `stub` with every finished-split entry from `exchange`.
pub async fn fetch_finished_splits<M>(
    exchange: &M,
    stub: StreamSplit,
    timeout: Duration,
    attempts: u32,
) -> Result<StreamSplit>
where
    M: MetaExchange + ?Sized,
{
    let mut fetcher = MetaGroupFetcher::new(exchange, stub.split_id.clone(), timeout, attempts);
    let mut entries: Vec<FinishedSplitInfo> = Vec::with_capacity(stub.total_finished_split_size);
    while let Some(group) = fetcher.next_group().await? {
        entries.extend(group.entries);
    }

    if entries.len() != stub.total_finished_split_size {
        return Err(SyncError::protocol(
            &stub.split_id,
            format!(
                "received {} finished split entries, expected {}",
                entries.len(),
                stub.total_finished_split_size
            ),
        ));
    }
    info!(
        "Fetched {} finished split entries in {} groups",
        entries.len(),
        fetcher.total_groups().unwrap_or_default()
    );
    Ok(stub.with_finished_splits(entries))
}
