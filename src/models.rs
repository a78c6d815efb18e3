use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One parsed log entry: header fields plus everything up to the next header.
///
/// Ephemeral — produced by the extractor, consumed by the correlator, never
/// persisted.
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: String,
    pub module: String,
    pub message: String,
}

/// A token embedded in a request or response message.
///
/// `id` is absent for newly minted outputs until the response assigns one.
/// Immutable once decoded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenDescriptor {
    pub id: Option<String>,
    pub serial_no: String,
    pub value: f64,
    pub currency: String,
    pub creation_timestamp: String,
    pub issuer_signature: String,
    pub owner_address: String,
}

/// A request-side output: a value and its position, no id assigned yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputSlot {
    pub value: f64,
    pub output_index: i64,
}

/// The declared `<Amount value curr>` on a request, as written by the sender.
/// Kept separate from the requested total computed from input tokens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeclaredAmount {
    pub value: f64,
    pub currency: String,
}

/// Normalized transaction result, decided once at record completion and never
/// re-interpreted downstream. `Unknown` counts as failure for audit purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxOutcome {
    Success,
    Failure,
    Unknown,
}

impl TxOutcome {
    /// Normalize the dynamic wire encoding: "SUCCESS"/"1" means success,
    /// "FAILURE"/"0" means failure, anything else (including absent) is
    /// unknown.
    pub fn from_wire(raw: Option<&str>) -> Self {
        match raw {
            Some("SUCCESS") | Some("1") => TxOutcome::Success,
            Some("FAILURE") | Some("0") => TxOutcome::Failure,
            _ => TxOutcome::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TxOutcome::Success => "success",
            TxOutcome::Failure => "failure",
            TxOutcome::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "success" => TxOutcome::Success,
            "failure" => TxOutcome::Failure,
            _ => TxOutcome::Unknown,
        }
    }
}

/// The central entity: one logical transaction assembled from a request log
/// line and its matching response, correlated by message id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub message_id: String,
    pub transaction_id: Option<String>,

    // Request side
    pub request_timestamp: Option<DateTime<Utc>>,
    pub sender_org_id: Option<String>,
    pub receiver_org_id: Option<String>,
    pub declared_amount: Option<DeclaredAmount>,
    pub requested_amount: f64,
    pub input_tokens: Vec<TokenDescriptor>,
    pub output_slots: Vec<OutputSlot>,

    // Response side
    pub response_timestamp: Option<DateTime<Utc>>,
    pub transaction_type: Option<String>,
    pub operation: Option<String>,
    pub outcome: TxOutcome,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub response_tokens: Vec<TokenDescriptor>,

    // Derived at completion
    pub processing_latency_ms: i64,
    pub number_of_inputs: usize,
    pub number_of_outputs: usize,

    pub has_request: bool,
    pub has_response: bool,
}

impl TransactionRecord {
    pub fn new(message_id: &str) -> Self {
        Self {
            message_id: message_id.to_string(),
            transaction_id: None,
            request_timestamp: None,
            sender_org_id: None,
            receiver_org_id: None,
            declared_amount: None,
            requested_amount: 0.0,
            input_tokens: Vec::new(),
            output_slots: Vec::new(),
            response_timestamp: None,
            transaction_type: None,
            operation: None,
            outcome: TxOutcome::Unknown,
            error_code: None,
            error_message: None,
            response_tokens: Vec::new(),
            processing_latency_ms: 0,
            number_of_inputs: 0,
            number_of_outputs: 0,
            has_request: false,
            has_response: false,
        }
    }

    /// Both halves present.
    pub fn is_complete(&self) -> bool {
        self.has_request && self.has_response
    }

    /// Complete and successful. An incomplete record is never successful for
    /// duplicate-detection purposes, whatever its outcome field says.
    pub fn is_successful(&self) -> bool {
        self.is_complete() && self.outcome == TxOutcome::Success
    }

    /// Recompute derived fields. Latency is zero unless both timestamps are
    /// present.
    pub fn finalize_derived(&mut self) {
        self.processing_latency_ms = match (self.request_timestamp, self.response_timestamp) {
            (Some(req), Some(res)) => (res - req).num_milliseconds(),
            _ => 0,
        };
        self.number_of_inputs = self.input_tokens.len();
        self.number_of_outputs = self.output_slots.len();
    }
}

/// One consumption event for a registered token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenOccurrence {
    pub transaction_id: Option<String>,
    pub sender_org: Option<String>,
    pub receiver_org: Option<String>,
    pub amount: f64,
    pub timestamp: Option<DateTime<Utc>>,
}

/// Registry state for one token id: first/last sighting, full occurrence
/// history, and rollup figures. Append-only; never deleted in normal
/// operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenRegistryEntry {
    pub token_id: String,
    pub first_seen: Option<DateTime<Utc>>,
    pub last_seen: Option<DateTime<Utc>>,
    pub consumption_count: u64,
    pub distinct_sender_orgs: usize,
    pub distinct_receiver_orgs: usize,
    pub total_amount: f64,
    pub occurrences: Vec<TokenOccurrence>,
}

impl TokenRegistryEntry {
    /// Build an entry snapshot from the full occurrence history.
    pub fn from_occurrences(token_id: &str, occurrences: Vec<TokenOccurrence>) -> Self {
        let mut first_seen: Option<DateTime<Utc>> = None;
        let mut last_seen: Option<DateTime<Utc>> = None;
        let mut total_amount = 0.0;
        let mut senders: HashSet<&str> = HashSet::new();
        let mut receivers: HashSet<&str> = HashSet::new();

        for occ in &occurrences {
            if let Some(ts) = occ.timestamp {
                first_seen = Some(first_seen.map_or(ts, |cur| cur.min(ts)));
                last_seen = Some(last_seen.map_or(ts, |cur| cur.max(ts)));
            }
            total_amount += occ.amount;
            if let Some(s) = occ.sender_org.as_deref() {
                senders.insert(s);
            }
            if let Some(r) = occ.receiver_org.as_deref() {
                receivers.insert(r);
            }
        }

        Self {
            token_id: token_id.to_string(),
            first_seen,
            last_seen,
            consumption_count: occurrences.len() as u64,
            distinct_sender_orgs: senders.len(),
            distinct_receiver_orgs: receivers.len(),
            total_amount,
            occurrences,
        }
    }
}

/// Per-batch ingestion summary. Partial success is the normal case: per-item
/// errors accumulate here instead of aborting the batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestReport {
    pub source: String,
    pub records_persisted: usize,
    pub records_rejected: usize,
    pub incomplete_records: usize,
    pub tokens_registered: usize,
    pub duplicate_audits: Vec<TokenRegistryEntry>,
    pub errors: Vec<String>,
}

impl IngestReport {
    pub fn new(source: &str) -> Self {
        Self {
            source: source.to_string(),
            records_persisted: 0,
            records_rejected: 0,
            incomplete_records: 0,
            tokens_registered: 0,
            duplicate_audits: Vec::new(),
            errors: Vec::new(),
        }
    }
}

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: String,
    pub max_batch_workers: usize,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        let database_path =
            std::env::var("DATABASE_PATH").unwrap_or_else(|_| "./tokentrace.db".to_string());

        let max_batch_workers = std::env::var("MAX_BATCH_WORKERS")
            .unwrap_or_else(|_| "4".to_string())
            .parse()
            .unwrap_or(4);

        Ok(Self {
            database_path,
            max_batch_workers,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn occ(tx: &str, sender: &str, receiver: &str, amount: f64, secs: i64) -> TokenOccurrence {
        TokenOccurrence {
            transaction_id: Some(tx.to_string()),
            sender_org: Some(sender.to_string()),
            receiver_org: Some(receiver.to_string()),
            amount,
            timestamp: Some(ts(secs)),
        }
    }

    #[test]
    fn test_outcome_normalization() {
        assert_eq!(TxOutcome::from_wire(Some("SUCCESS")), TxOutcome::Success);
        assert_eq!(TxOutcome::from_wire(Some("1")), TxOutcome::Success);
        assert_eq!(TxOutcome::from_wire(Some("FAILURE")), TxOutcome::Failure);
        assert_eq!(TxOutcome::from_wire(Some("0")), TxOutcome::Failure);
        assert_eq!(TxOutcome::from_wire(Some("weird")), TxOutcome::Unknown);
        assert_eq!(TxOutcome::from_wire(None), TxOutcome::Unknown);
    }

    #[test]
    fn test_incomplete_record_never_successful() {
        let mut rec = TransactionRecord::new("m1");
        rec.has_response = true;
        rec.outcome = TxOutcome::Success;
        assert!(!rec.is_successful());

        rec.has_request = true;
        assert!(rec.is_successful());
    }

    #[test]
    fn test_latency_zero_when_half_missing() {
        let mut rec = TransactionRecord::new("m1");
        rec.request_timestamp = Some(ts(100));
        rec.finalize_derived();
        assert_eq!(rec.processing_latency_ms, 0);

        rec.response_timestamp = Some(ts(101));
        rec.finalize_derived();
        assert_eq!(rec.processing_latency_ms, 1000);
    }

    #[test]
    fn test_registry_entry_rollup() {
        let entry = TokenRegistryEntry::from_occurrences(
            "tok-1",
            vec![
                occ("tx-2", "ORG-A", "ORG-B", 10.0, 200),
                occ("tx-1", "ORG-A", "ORG-C", 5.0, 100),
            ],
        );

        assert_eq!(entry.consumption_count, 2);
        assert_eq!(entry.first_seen, Some(ts(100)));
        assert_eq!(entry.last_seen, Some(ts(200)));
        assert_eq!(entry.distinct_sender_orgs, 1);
        assert_eq!(entry.distinct_receiver_orgs, 2);
        assert!((entry.total_amount - 15.0).abs() < f64::EPSILON);
    }
}
