//! Per-batch pipeline: parse files in parallel, correlate as one stream,
//! ingest.
//!
//! File parsing is pure and fans out over rayon. Correlation is deliberately
//! single-stream per batch — a request and its response are only guaranteed
//! to meet if the whole batch flows through one correlator. Batches are
//! independent of each other and run on a fixed-size tokio worker pool; the
//! token registry is the only shared synchronization point between them.

use std::sync::Arc;

use anyhow::{Context, Result};
use rayon::prelude::*;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info};

use crate::correlator::TransactionCorrelator;
use crate::ingest::BatchIngestor;
use crate::models::{IngestReport, LogEntry};
use crate::parser::extract_entries;

/// One decompressed text file of a batch archive.
#[derive(Debug, Clone)]
pub struct BatchFile {
    pub name: String,
    pub content: String,
}

/// A batch: one uploaded archive, tagged with the caller identity.
#[derive(Debug, Clone)]
pub struct Batch {
    pub source: String,
    pub files: Vec<BatchFile>,
}

pub struct Pipeline {
    ingestor: Arc<BatchIngestor>,
}

impl Pipeline {
    pub fn new(ingestor: Arc<BatchIngestor>) -> Self {
        Self { ingestor }
    }

    /// Process one batch end to end.
    pub fn process_batch(&self, batch: &Batch) -> Result<IngestReport> {
        info!(
            "📥 Processing batch '{}' ({} files)",
            batch.source,
            batch.files.len()
        );

        // Parse files in parallel; each file's entry order is preserved and
        // files are re-joined in their given order before correlation.
        let per_file: Vec<Vec<LogEntry>> = batch
            .files
            .par_iter()
            .map(|file| {
                let entries: Vec<LogEntry> = extract_entries(&file.content).collect();
                debug!("parsed {} entries from {}", entries.len(), file.name);
                entries
            })
            .collect();

        let mut correlator = TransactionCorrelator::new();
        for entries in &per_file {
            for entry in entries {
                correlator.observe(entry);
            }
        }
        let outcome = correlator.finish();

        let mut report = self.ingestor.ingest(&batch.source, outcome.records)?;
        report.errors.extend(outcome.decode_errors);
        Ok(report)
    }

    /// Process independent batches concurrently on a fixed-size worker pool.
    /// Reports come back in submission order.
    pub async fn process_batches(
        self: Arc<Self>,
        batches: Vec<Batch>,
        max_workers: usize,
    ) -> Result<Vec<IngestReport>> {
        let semaphore = Arc::new(Semaphore::new(max_workers.max(1)));
        let mut set = JoinSet::new();

        for (index, batch) in batches.into_iter().enumerate() {
            let pipeline = Arc::clone(&self);
            let semaphore = Arc::clone(&semaphore);
            set.spawn(async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore open");
                let report = tokio::task::spawn_blocking(move || pipeline.process_batch(&batch))
                    .await
                    .context("batch worker panicked")?;
                report.map(|r| (index, r))
            });
        }

        let mut reports: Vec<(usize, IngestReport)> = Vec::new();
        while let Some(joined) = set.join_next().await {
            let (index, report) = joined.context("batch task failed")??;
            reports.push((index, report));
        }

        reports.sort_by_key(|(index, _)| *index);
        Ok(reports.into_iter().map(|(_, report)| report).collect())
    }
}
