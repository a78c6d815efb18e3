//! Tokentrace - payment-network log ingestion and duplicate-token audit
//!
//! Each path argument becomes one batch: a directory contributes all of its
//! .log/.txt files, a plain file is a single-file batch. Batches run
//! concurrently on a fixed-size worker pool; the ingest reports are printed
//! as JSON when every batch has finished.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use tokentrace_backend::ingest::BatchIngestor;
use tokentrace_backend::models::Config;
use tokentrace_backend::pipeline::{Batch, BatchFile, Pipeline};
use tokentrace_backend::storage::{SqliteTokenRegistry, TokenRegistry, TransactionStore};

#[derive(Parser, Debug)]
#[command(name = "tokentrace")]
#[command(about = "Ingest payment-network protocol logs and audit duplicate token spends")]
struct Args {
    /// Log files or directories; each becomes one batch
    #[arg(required = true)]
    paths: Vec<PathBuf>,

    /// Path to the SQLite database (overrides DATABASE_PATH)
    #[arg(long)]
    db: Option<String>,

    /// Caller identity used to tag this upload in the audit trail
    #[arg(long, default_value = "cli")]
    caller: String,

    /// Maximum concurrent batch workers (overrides MAX_BATCH_WORKERS)
    #[arg(long)]
    workers: Option<usize>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("tokentrace=info".parse().unwrap())
                .add_directive("tokentrace_backend=info".parse().unwrap()),
        )
        .init();

    let args = Args::parse();
    let config = Config::from_env()?;

    let db_path = args.db.unwrap_or(config.database_path);
    let workers = args.workers.unwrap_or(config.max_batch_workers);

    let store = Arc::new(TransactionStore::new(&db_path)?);
    let registry: Arc<dyn TokenRegistry> = Arc::new(SqliteTokenRegistry::new(&db_path)?);
    let ingestor = Arc::new(BatchIngestor::new(store, registry));
    let pipeline = Arc::new(Pipeline::new(ingestor));

    let mut batches = Vec::new();
    for path in &args.paths {
        match load_batch(path, &args.caller) {
            Ok(Some(batch)) => batches.push(batch),
            Ok(None) => warn!("no log files found under {}", path.display()),
            Err(e) => warn!("skipping {}: {}", path.display(), e),
        }
    }

    if batches.is_empty() {
        anyhow::bail!("nothing to ingest");
    }

    info!("starting {} batches with {} workers", batches.len(), workers);
    let reports = pipeline.process_batches(batches, workers).await?;

    println!("{}", serde_json::to_string_pretty(&reports)?);
    Ok(())
}

/// Build one batch from a path. Directories contribute every .log/.txt file
/// in name order; the batch source tag combines the caller identity with the
/// path.
fn load_batch(path: &Path, caller: &str) -> Result<Option<Batch>> {
    let source = format!("{}:{}", caller, path.display());

    if path.is_file() {
        let files = vec![read_file(path)?];
        return Ok(Some(Batch { source, files }));
    }

    let mut names: Vec<PathBuf> = fs::read_dir(path)
        .with_context(|| format!("Failed to read directory {}", path.display()))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|p| {
            p.is_file()
                && matches!(
                    p.extension().and_then(|e| e.to_str()),
                    Some("log") | Some("txt")
                )
        })
        .collect();
    names.sort();

    if names.is_empty() {
        return Ok(None);
    }

    let files = names
        .iter()
        .map(|p| read_file(p))
        .collect::<Result<Vec<_>>>()?;

    Ok(Some(Batch { source, files }))
}

fn read_file(path: &Path) -> Result<BatchFile> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    Ok(BatchFile {
        name: path.display().to_string(),
        content,
    })
}
