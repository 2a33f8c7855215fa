//! Command-line interface for chunk-sync
//!
//! # Usage Examples
//!
//! ## Capture
//! ```bash
//! # Default capture: one table of 10000 rows, 4 readers, 1000 random changes
//! chunk-sync run
//!
//! # Settings from a file, overridden on the command line, records to a file
//! chunk-sync run --config capture.toml --readers 8 --output records.jsonl
//!
//! # Reproducible workload, output checked against the source
//! chunk-sync run --tables shop.orders,shop.items --rows 5000 --seed 7 --verify
//! ```
//!
//! ## Checkpoints
//! ```bash
//! chunk-sync checkpoint show --dir .chunk-sync-checkpoints
//! chunk-sync checkpoint show --dir .chunk-sync-checkpoints --phase snapshot
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use checkpoint::{Checkpoint, CheckpointConfig, CheckpointManager, SyncPhase};
use chunk_sync::capture::{run_capture, verify_output};
use chunk_sync::checkpoint::latest_checkpoint;
use chunk_sync::config::{CaptureConfig, TableConfig};
use chunk_sync::sink::{FanoutSink, JsonlSink};
use chunk_sync_memory_source::{MemoryDatabase, MemorySink};
use clap::{Args, Parser, Subcommand, ValueEnum};
use sync_core::RecordSink;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "chunk-sync")]
#[command(about = "Lock-free table capture coordinated by chunk watermarks")]
#[command(long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Capture seeded in-memory tables while a random workload changes them
    Run(RunArgs),

    /// Inspect stored enumerator checkpoints
    #[command(subcommand)]
    Checkpoint(CheckpointCommand),
}

#[derive(Args)]
struct RunArgs {
    /// TOML file with capture settings; flags below override it
    #[arg(long)]
    config: Option<PathBuf>,

    /// Tables to create and capture (comma-separated)
    #[arg(long, value_delimiter = ',')]
    tables: Option<Vec<String>>,

    /// Rows seeded into each table given by --tables
    #[arg(long, default_value = "10000")]
    rows: u64,

    /// Target rows per snapshot chunk
    #[arg(long)]
    chunk_size: Option<usize>,

    /// Number of concurrent readers
    #[arg(long)]
    readers: Option<usize>,

    /// Finished-split entries per metadata group
    #[arg(long)]
    meta_group_size: Option<usize>,

    /// Random changes applied during the capture
    #[arg(long)]
    mutations: Option<u64>,

    /// Seed for the random workload
    #[arg(long)]
    seed: Option<u64>,

    /// Directory for enumerator checkpoints
    #[arg(long, env = "CHUNK_SYNC_CHECKPOINT_DIR")]
    checkpoint_dir: Option<String>,

    /// Do not write checkpoints
    #[arg(long)]
    no_checkpoints: bool,

    /// Checkpoint interval (e.g. "500ms", "10s")
    #[arg(long)]
    checkpoint_interval: Option<String>,

    /// Write records as JSON lines to this file, or "-" for stdout
    #[arg(long)]
    output: Option<String>,

    /// Compare the captured output with the source tables at the end
    #[arg(long)]
    verify: bool,
}

#[derive(Subcommand)]
enum CheckpointCommand {
    /// Print the newest checkpoint in a directory
    Show {
        /// Checkpoint directory
        #[arg(long, env = "CHUNK_SYNC_CHECKPOINT_DIR")]
        dir: PathBuf,

        /// Only consider checkpoints of this phase
        #[arg(long, value_enum)]
        phase: Option<PhaseArg>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum PhaseArg {
    Snapshot,
    Stream,
}

impl From<PhaseArg> for SyncPhase {
    fn from(phase: PhaseArg) -> Self {
        match phase {
            PhaseArg::Snapshot => SyncPhase::Snapshot,
            PhaseArg::Stream => SyncPhase::Stream,
        }
    }
}

impl RunArgs {
    fn into_config(self) -> anyhow::Result<(CaptureConfig, Option<String>, bool)> {
        let mut config = match &self.config {
            Some(path) => CaptureConfig::from_file(path)?,
            None => CaptureConfig::default(),
        };
        if let Some(tables) = self.tables {
            config.tables = tables
                .into_iter()
                .map(|name| TableConfig {
                    name,
                    rows: self.rows,
                })
                .collect();
        }
        if let Some(chunk_size) = self.chunk_size {
            config.chunk_size = chunk_size;
        }
        if let Some(readers) = self.readers {
            config.readers = readers;
        }
        if let Some(size) = self.meta_group_size {
            config.split_meta_group_size = size;
        }
        if let Some(mutations) = self.mutations {
            config.workload.mutations = mutations;
        }
        if self.seed.is_some() {
            config.workload.seed = self.seed;
        }
        if let Some(dir) = self.checkpoint_dir {
            config.checkpoint_dir = Some(dir);
        }
        if self.no_checkpoints {
            config.checkpoint_dir = None;
        }
        if let Some(interval) = self.checkpoint_interval {
            config.checkpoint_interval = interval;
        }
        config.validate()?;
        Ok((config, self.output, self.verify))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = run().await {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
    Ok(())
}

async fn run() -> anyhow::Result<()> {
    // Logs go to stderr so stdout can carry records.
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => {
            let (config, output, verify) = args.into_config()?;
            run_command(config, output, verify).await
        }
        Commands::Checkpoint(CheckpointCommand::Show { dir, phase }) => {
            let found = latest_checkpoint(&dir, phase.map(SyncPhase::from)).await?;
            println!("File: {}", found.path.display());
            println!("Phase: {}", found.file.phase());
            println!("Created: {}", found.file.created_at().to_rfc3339());
            println!("Summary: {}", found.state.summary());
            println!("{}", serde_json::to_string_pretty(&found.state)?);
            Ok(())
        }
    }
}

async fn run_command(
    config: CaptureConfig,
    output: Option<String>,
    verify: bool,
) -> anyhow::Result<()> {
    let checkpoints = match &config.checkpoint_dir {
        Some(dir) => CheckpointManager::new(CheckpointConfig::filesystem(dir.clone())),
        None => CheckpointManager::new(CheckpointConfig::disabled()),
    };

    let collected = MemorySink::new();
    let mut sinks: Vec<Arc<dyn RecordSink>> = Vec::new();
    match output.as_deref() {
        Some("-") => sinks.push(Arc::new(JsonlSink::stdout())),
        Some(path) => {
            let file = tokio::fs::File::create(path)
                .await
                .with_context(|| format!("Failed to create output file {path}"))?;
            sinks.push(Arc::new(JsonlSink::new(tokio::io::BufWriter::new(file))));
        }
        None => {}
    }
    if verify || sinks.is_empty() {
        sinks.push(Arc::new(collected.clone()));
    }
    let sink: Arc<dyn RecordSink> = Arc::new(FanoutSink::new(sinks));

    let shutdown = CancellationToken::new();
    let ctrl_c = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received interrupt");
            ctrl_c.cancel();
        }
    });

    let db = MemoryDatabase::new();
    let report = run_capture(&config, db.clone(), sink, &checkpoints, shutdown).await?;

    info!(
        "Read {} snapshot splits with {} readers; {} checkpoints written",
        report.snapshot_splits,
        report.readers.len(),
        report.checkpoints_emitted
    );
    if report.interrupted {
        warn!("Capture was interrupted before the workload finished");
    }

    if verify {
        let records = collected.records().await;
        let mismatches = verify_output(&db, &report.tables, &records).await?;
        if !mismatches.is_empty() {
            anyhow::bail!("Captured output differs from source: {}", mismatches.join("; "));
        }
        info!(
            "Verified {} tables against {} records",
            report.tables.len(),
            records.len()
        );
    }
    Ok(())
}
