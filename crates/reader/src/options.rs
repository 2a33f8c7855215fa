use std::time::Duration;

pub const DEFAULT_META_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_META_ATTEMPTS: u32 = 3;
pub const DEFAULT_MAX_CHUNK_RETRIES: u32 = 3;
pub const DEFAULT_MAX_STREAM_RETRIES: u32 = 3;

#[derive(Debug, Clone, PartialEq)]
pub struct ReaderOptions {
    /// How long to wait for one metadata group before asking again.
    pub meta_request_timeout: Duration,
    /// Requests per metadata group before giving up.
    pub meta_attempts: u32,
    /// Re-runs of a chunk after a transient read failure.
    pub max_chunk_retries: u32,
    /// Consecutive reopenings of the change stream after transient failures.
    pub max_stream_retries: u32,
}

impl Default for ReaderOptions {
    fn default() -> Self {
        Self {
            meta_request_timeout: DEFAULT_META_REQUEST_TIMEOUT,
            meta_attempts: DEFAULT_META_ATTEMPTS,
            max_chunk_retries: DEFAULT_MAX_CHUNK_RETRIES,
            max_stream_retries: DEFAULT_MAX_STREAM_RETRIES,
        }
    }
}
