//! Batch Ingestion & Duplicate Scan
//!
//! Takes a completed batch of transaction records, persists them, and runs
//! every input token of every complete, successful record through the token
//! registry. Per-item failures accumulate into the report; only batch-wide
//! infrastructure failures abort.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use tracing::{info, warn};

use crate::models::{IngestReport, TokenOccurrence, TokenRegistryEntry, TransactionRecord};
use crate::storage::{RegisterOutcome, TokenRegistry, TransactionStore};

pub struct BatchIngestor {
    store: Arc<TransactionStore>,
    registry: Arc<dyn TokenRegistry>,
}

impl BatchIngestor {
    pub fn new(store: Arc<TransactionStore>, registry: Arc<dyn TokenRegistry>) -> Self {
        Self { store, registry }
    }

    /// Ingest one batch. Safe to re-run on an already-ingested batch: stored
    /// rows are skipped as per-row errors and registrations append further
    /// occurrences rather than being a no-op.
    pub fn ingest(&self, source: &str, batch: Vec<TransactionRecord>) -> Result<IngestReport> {
        let mut report = IngestReport::new(source);

        // Validation filter: a record without a parseable request timestamp
        // is rejected outright. Incomplete records pass — they are stored but
        // never scanned for duplicates.
        let (accepted, rejected): (Vec<_>, Vec<_>) = batch
            .into_iter()
            .partition(|r| r.request_timestamp.is_some());

        report.records_rejected = rejected.len();
        for record in &rejected {
            warn!(
                "rejecting record msg_id={} with missing request timestamp",
                record.message_id
            );
        }

        report.incomplete_records = accepted.iter().filter(|r| !r.is_complete()).count();

        report.records_persisted =
            self.store
                .insert_batch(&accepted, source, &mut report.errors)?;

        // Duplicate scan: one audit entry per token id per batch, carrying
        // the token's entire occurrence history at the time of the last
        // collision.
        let mut audits: HashMap<String, TokenRegistryEntry> = HashMap::new();
        let mut audit_order: Vec<String> = Vec::new();

        for record in accepted.iter().filter(|r| r.is_successful()) {
            for token in &record.input_tokens {
                let Some(token_id) = token.id.as_deref() else {
                    continue;
                };

                let occurrence = TokenOccurrence {
                    transaction_id: record.transaction_id.clone(),
                    sender_org: record.sender_org_id.clone(),
                    receiver_org: record.receiver_org_id.clone(),
                    amount: token.value,
                    timestamp: record.request_timestamp,
                };

                match self.registry.register(token_id, occurrence) {
                    Ok(RegisterOutcome::First) => report.tokens_registered += 1,
                    Ok(RegisterOutcome::Duplicate(entry)) => {
                        warn!(
                            "duplicate consumption of token {} ({} occurrences)",
                            token_id, entry.consumption_count
                        );
                        if !audits.contains_key(token_id) {
                            audit_order.push(token_id.to_string());
                        }
                        audits.insert(token_id.to_string(), entry);
                    }
                    Err(e) => {
                        warn!("failed to register token {}: {}", token_id, e);
                        report.errors.push(format!("token {}: {}", token_id, e));
                    }
                }
            }
        }

        report.duplicate_audits = audit_order
            .into_iter()
            .filter_map(|id| audits.remove(&id))
            .collect();

        info!(
            "✅ Batch '{}' ingested: {} persisted, {} rejected, {} incomplete, {} new tokens, {} duplicate tokens",
            source,
            report.records_persisted,
            report.records_rejected,
            report.incomplete_records,
            report.tokens_registered,
            report.duplicate_audits.len()
        );

        Ok(report)
    }
}
