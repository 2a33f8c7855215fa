//! Capture configuration.
//!
//! Values come from an optional TOML file; command-line flags override them.
//!
//! ```toml
//! readers = 4
//! chunk_size = 2500
//! checkpoint_interval = "5s"
//!
//! [[tables]]
//! name = "shop.orders"
//! rows = 10000
//!
//! [workload]
//! mutations = 500
//! seed = 7
//! ```

mod duration;

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use chunk_sync_enumerator::{EnumeratorOptions, DEFAULT_SPLIT_META_GROUP_SIZE};
use chunk_sync_reader::ReaderOptions;
use chunk_sync_splitter::{
    SplitterOptions, DEFAULT_CHUNK_SIZE, DEFAULT_DISTRIBUTION_FACTOR_LOWER,
    DEFAULT_DISTRIBUTION_FACTOR_UPPER,
};
use serde::{Deserialize, Serialize};

pub use duration::parse_duration;

/// A table of the in-memory source and how many rows to seed it with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableConfig {
    pub name: String,
    pub rows: u64,
}

/// Random changes applied while the capture runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WorkloadConfig {
    /// Total number of inserts, updates and deletes.
    pub mutations: u64,
    /// Share of mutations that are deletes.
    pub delete_ratio: f64,
    /// Share of mutations that insert new keys.
    pub insert_ratio: f64,
    /// Pause between mutations.
    pub pause: String,
    /// Fixed RNG seed for reproducible runs.
    pub seed: Option<u64>,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            mutations: 1000,
            delete_ratio: 0.1,
            insert_ratio: 0.2,
            pause: "1ms".to_string(),
            seed: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CaptureConfig {
    pub tables: Vec<TableConfig>,
    pub chunk_size: usize,
    pub split_meta_group_size: usize,
    pub distribution_factor_upper: f64,
    pub distribution_factor_lower: f64,
    pub readers: usize,
    pub meta_request_timeout: String,
    pub meta_attempts: u32,
    pub max_chunk_retries: u32,
    pub max_stream_retries: u32,
    pub checkpoint_interval: String,
    /// `None` disables checkpoints.
    pub checkpoint_dir: Option<String>,
    pub workload: WorkloadConfig,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            tables: vec![TableConfig {
                name: "shop.orders".to_string(),
                rows: 10_000,
            }],
            chunk_size: DEFAULT_CHUNK_SIZE,
            split_meta_group_size: DEFAULT_SPLIT_META_GROUP_SIZE,
            distribution_factor_upper: DEFAULT_DISTRIBUTION_FACTOR_UPPER,
            distribution_factor_lower: DEFAULT_DISTRIBUTION_FACTOR_LOWER,
            readers: 4,
            meta_request_timeout: "5s".to_string(),
            meta_attempts: 3,
            max_chunk_retries: 3,
            max_stream_retries: 3,
            checkpoint_interval: "10s".to_string(),
            checkpoint_dir: Some(".chunk-sync-checkpoints".to_string()),
            workload: WorkloadConfig::default(),
        }
    }
}

impl CaptureConfig {
    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        toml::from_str(content).context("Failed to parse capture configuration")
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml(&content).with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.tables.is_empty() {
            anyhow::bail!("At least one table must be configured");
        }
        if self.readers == 0 {
            anyhow::bail!("At least one reader is required");
        }
        if self.split_meta_group_size == 0 {
            anyhow::bail!("split_meta_group_size must be at least 1");
        }
        let ratios = self.workload.delete_ratio + self.workload.insert_ratio;
        if self.workload.delete_ratio < 0.0 || self.workload.insert_ratio < 0.0 || ratios > 1.0 {
            anyhow::bail!(
                "Workload ratios must be non-negative and sum to at most 1, \
                 got delete {} insert {}",
                self.workload.delete_ratio,
                self.workload.insert_ratio
            );
        }
        self.splitter_options()
            .validate()
            .context("Invalid splitter settings")?;
        self.reader_options()?;
        self.checkpoint_interval()?;
        self.workload_pause()?;
        Ok(())
    }

    pub fn splitter_options(&self) -> SplitterOptions {
        SplitterOptions {
            chunk_size: self.chunk_size,
            distribution_factor_upper: self.distribution_factor_upper,
            distribution_factor_lower: self.distribution_factor_lower,
            chunk_key_column: None,
        }
    }

    pub fn enumerator_options(&self) -> EnumeratorOptions {
        EnumeratorOptions {
            splitter: self.splitter_options(),
            split_meta_group_size: self.split_meta_group_size,
        }
    }

    pub fn reader_options(&self) -> anyhow::Result<ReaderOptions> {
        Ok(ReaderOptions {
            meta_request_timeout: parse_duration(&self.meta_request_timeout)
                .context("Invalid meta_request_timeout")?,
            meta_attempts: self.meta_attempts,
            max_chunk_retries: self.max_chunk_retries,
            max_stream_retries: self.max_stream_retries,
        })
    }

    pub fn checkpoint_interval(&self) -> anyhow::Result<Duration> {
        let interval =
            parse_duration(&self.checkpoint_interval).context("Invalid checkpoint_interval")?;
        if interval.is_zero() {
            anyhow::bail!("checkpoint_interval must be positive");
        }
        Ok(interval)
    }

    pub fn workload_pause(&self) -> anyhow::Result<Duration> {
        parse_duration(&self.workload.pause).context("Invalid workload pause")
    }
}
