//! Main transaction store.
//!
//! One row per transaction record, unique on transaction id. Batch writes run
//! inside a single transaction but are best-effort per row: an individual
//! constraint violation is recorded as an error and does not abort the batch.

use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::models::{DeclaredAmount, TransactionRecord, TxOutcome};

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA temp_store = MEMORY;
PRAGMA busy_timeout = 5000;

CREATE TABLE IF NOT EXISTS transactions (
    transaction_id TEXT PRIMARY KEY,
    message_id TEXT NOT NULL,
    request_ts_ms INTEGER NOT NULL,
    response_ts_ms INTEGER,
    sender_org_id TEXT,
    receiver_org_id TEXT,
    transaction_type TEXT,
    operation TEXT,
    outcome TEXT NOT NULL,
    error_code TEXT,
    error_message TEXT,
    requested_amount REAL NOT NULL,
    declared_amount REAL,
    declared_currency TEXT,
    processing_latency_ms INTEGER NOT NULL,
    number_of_inputs INTEGER NOT NULL,
    number_of_outputs INTEGER NOT NULL,
    complete INTEGER NOT NULL,
    inputs_json TEXT NOT NULL,
    outputs_json TEXT NOT NULL,
    response_tokens_json TEXT NOT NULL,
    source TEXT NOT NULL,
    processed_at_ms INTEGER NOT NULL,
    version INTEGER NOT NULL DEFAULT 1
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_transactions_processed_at
    ON transactions(processed_at_ms DESC);

CREATE INDEX IF NOT EXISTS idx_transactions_message
    ON transactions(message_id);
"#;

pub struct TransactionStore {
    conn: Arc<Mutex<Connection>>,
}

impl TransactionStore {
    pub fn new(db_path: &str) -> Result<Self> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX; // We handle our own locking

        let conn = Connection::open_with_flags(db_path, flags)
            .with_context(|| format!("Failed to open transaction store at {}", db_path))?;

        conn.execute_batch(SCHEMA_SQL)
            .context("Failed to initialize transaction store schema")?;

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM transactions", [], |row| row.get(0))
            .unwrap_or(0);
        info!("📊 Transaction store ready at {} ({} rows)", db_path, count);

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Persist a batch. Returns the number of rows written; per-row failures
    /// land in `errors` and leave the rest of the batch untouched.
    pub fn insert_batch(
        &self,
        records: &[TransactionRecord],
        source: &str,
        errors: &mut Vec<String>,
    ) -> Result<usize> {
        if records.is_empty() {
            return Ok(0);
        }

        // Pre-serialize token lists outside the lock.
        let serialized: Vec<_> = records
            .iter()
            .map(|r| {
                let inputs = serde_json::to_string(&r.input_tokens).unwrap_or_default();
                let outputs = serde_json::to_string(&r.output_slots).unwrap_or_default();
                let response = serde_json::to_string(&r.response_tokens).unwrap_or_default();
                (r, inputs, outputs, response)
            })
            .collect();

        let processed_at_ms = Utc::now().timestamp_millis();
        let conn = self.conn.lock();

        conn.execute("BEGIN IMMEDIATE", [])?;

        let mut inserted = 0usize;
        for (record, inputs_json, outputs_json, response_json) in &serialized {
            let row_key = storage_key(record);
            let outcome = conn.execute(
                "INSERT OR IGNORE INTO transactions
                 (transaction_id, message_id, request_ts_ms, response_ts_ms,
                  sender_org_id, receiver_org_id, transaction_type, operation,
                  outcome, error_code, error_message, requested_amount,
                  declared_amount, declared_currency, processing_latency_ms,
                  number_of_inputs, number_of_outputs, complete,
                  inputs_json, outputs_json, response_tokens_json,
                  source, processed_at_ms, version)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12,
                         ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, 1)",
                params![
                    row_key,
                    record.message_id,
                    record
                        .request_timestamp
                        .map(|t| t.timestamp_millis())
                        .unwrap_or(0),
                    record.response_timestamp.map(|t| t.timestamp_millis()),
                    record.sender_org_id,
                    record.receiver_org_id,
                    record.transaction_type,
                    record.operation,
                    record.outcome.as_str(),
                    record.error_code,
                    record.error_message,
                    record.requested_amount,
                    record.declared_amount.as_ref().map(|a| a.value),
                    record.declared_amount.as_ref().map(|a| a.currency.clone()),
                    record.processing_latency_ms,
                    record.number_of_inputs as i64,
                    record.number_of_outputs as i64,
                    record.is_complete() as i64,
                    inputs_json,
                    outputs_json,
                    response_json,
                    source,
                    processed_at_ms,
                ],
            );

            match outcome {
                Ok(0) => {
                    warn!("transaction {} already stored, skipping", row_key);
                    errors.push(format!("transaction {} already stored", row_key));
                }
                Ok(_) => inserted += 1,
                Err(e) => {
                    warn!("failed to store transaction {}: {}", row_key, e);
                    errors.push(format!("transaction {}: {}", row_key, e));
                }
            }
        }

        conn.execute("COMMIT", [])?;

        debug!("📦 Batch inserted {} transactions", inserted);
        Ok(inserted)
    }

    /// Records whose ingestion time falls inside `[start_ms, end_ms]` — the
    /// read path for the downstream analytics aggregator.
    pub fn fetch_window(&self, start_ms: i64, end_ms: i64) -> Result<Vec<TransactionRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT message_id, transaction_id, request_ts_ms, response_ts_ms,
                    sender_org_id, receiver_org_id, transaction_type, operation,
                    outcome, error_code, error_message, requested_amount,
                    declared_amount, declared_currency, processing_latency_ms,
                    number_of_inputs, number_of_outputs, complete,
                    inputs_json, outputs_json, response_tokens_json
             FROM transactions
             WHERE processed_at_ms >= ?1 AND processed_at_ms <= ?2
             ORDER BY processed_at_ms, transaction_id",
        )?;

        let records = stmt
            .query_map(params![start_ms, end_ms], row_to_record)?
            .filter_map(|r| r.ok())
            .collect();

        Ok(records)
    }

    pub fn len(&self) -> usize {
        let conn = self.conn.lock();
        conn.query_row("SELECT COUNT(*) FROM transactions", [], |row| {
            row.get::<_, i64>(0)
        })
        .unwrap_or(0) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Storage key: the business transaction id when present, otherwise the
/// message id (orphan responses have no transaction id).
fn storage_key(record: &TransactionRecord) -> String {
    record
        .transaction_id
        .clone()
        .unwrap_or_else(|| format!("msg:{}", record.message_id))
}

fn ts_from_ms(ms: Option<i64>) -> Option<DateTime<Utc>> {
    ms.and_then(|v| Utc.timestamp_millis_opt(v).single())
}

fn row_to_record(row: &rusqlite::Row) -> rusqlite::Result<TransactionRecord> {
    let message_id: String = row.get(0)?;
    let transaction_id: Option<String> = row.get(1)?;
    let request_ts_ms: i64 = row.get(2)?;
    let response_ts_ms: Option<i64> = row.get(3)?;
    let declared_amount: Option<f64> = row.get(12)?;
    let declared_currency: Option<String> = row.get(13)?;
    let complete: i64 = row.get(17)?;
    let inputs_json: String = row.get(18)?;
    let outputs_json: String = row.get(19)?;
    let response_json: String = row.get(20)?;
    let outcome_str: String = row.get(8)?;

    let to_json_err =
        |e: serde_json::Error| rusqlite::Error::ToSqlConversionFailure(Box::new(e));

    Ok(TransactionRecord {
        message_id,
        transaction_id,
        request_timestamp: ts_from_ms(Some(request_ts_ms)),
        response_timestamp: ts_from_ms(response_ts_ms),
        sender_org_id: row.get(4)?,
        receiver_org_id: row.get(5)?,
        transaction_type: row.get(6)?,
        operation: row.get(7)?,
        outcome: TxOutcome::parse(&outcome_str),
        error_code: row.get(9)?,
        error_message: row.get(10)?,
        requested_amount: row.get(11)?,
        declared_amount: declared_amount.zip(declared_currency).map(
            |(value, currency)| DeclaredAmount { value, currency },
        ),
        processing_latency_ms: row.get(14)?,
        number_of_inputs: row.get::<_, i64>(15)? as usize,
        number_of_outputs: row.get::<_, i64>(16)? as usize,
        input_tokens: serde_json::from_str(&inputs_json).map_err(to_json_err)?,
        output_slots: serde_json::from_str(&outputs_json).map_err(to_json_err)?,
        response_tokens: serde_json::from_str(&response_json).map_err(to_json_err)?,
        has_request: true,
        has_response: complete == 1,
    })
}
