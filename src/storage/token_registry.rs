//! Duplicate-token registry.
//!
//! Every input token consumed by a successful transaction is registered here
//! exactly once; any later registration of the same token id is the duplicate
//! signal. First-writer-wins is decided by the storage layer itself
//! (`INSERT OR IGNORE` + changes inside an immediate transaction), not by a
//! read-then-write check — concurrent batches racing on the same token id
//! still produce exactly one winner.
//!
//! The registry is append-only: occurrences are never deleted in normal
//! operation, so re-ingesting a batch appends history rather than corrupting
//! it.

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

use crate::models::{TokenOccurrence, TokenRegistryEntry};

/// Outcome of one registration attempt. A `Duplicate` carries a snapshot of
/// the token's entire occurrence history, including the new one.
#[derive(Debug, Clone)]
pub enum RegisterOutcome {
    First,
    Duplicate(TokenRegistryEntry),
}

/// Injectable registry seam: SQLite in production, in-memory in tests.
pub trait TokenRegistry: Send + Sync {
    /// Register one consumption. Appends the occurrence unconditionally and
    /// reports whether this token id was seen before.
    fn register(&self, token_id: &str, occurrence: TokenOccurrence) -> Result<RegisterOutcome>;

    /// Current state for one token id.
    fn snapshot(&self, token_id: &str) -> Result<Option<TokenRegistryEntry>>;

    /// Every token consumed more than once, most-consumed first.
    fn duplicates(&self) -> Result<Vec<TokenRegistryEntry>>;
}

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA busy_timeout = 5000;

CREATE TABLE IF NOT EXISTS token_registry (
    token_id TEXT PRIMARY KEY,
    first_seen_ms INTEGER,
    last_seen_ms INTEGER,
    consumption_count INTEGER NOT NULL,
    total_amount REAL NOT NULL
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS token_occurrences (
    token_id TEXT NOT NULL,
    transaction_id TEXT,
    sender_org TEXT,
    receiver_org TEXT,
    amount REAL NOT NULL,
    timestamp_ms INTEGER,
    recorded_at_ms INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_token_occurrences_token
    ON token_occurrences(token_id, timestamp_ms);
"#;

pub struct SqliteTokenRegistry {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteTokenRegistry {
    pub fn new(db_path: &str) -> Result<Self> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;

        let conn = Connection::open_with_flags(db_path, flags)
            .with_context(|| format!("Failed to open token registry at {}", db_path))?;

        conn.execute_batch(SCHEMA_SQL)
            .context("Failed to initialize token registry schema")?;

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM token_registry", [], |row| row.get(0))
            .unwrap_or(0);
        info!("🔑 Token registry ready at {} ({} tokens)", db_path, count);

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn snapshot_locked(
        conn: &Connection,
        token_id: &str,
    ) -> Result<Option<TokenRegistryEntry>> {
        let occurrences = occurrences_locked(conn, token_id)?;
        if occurrences.is_empty() {
            return Ok(None);
        }
        Ok(Some(TokenRegistryEntry::from_occurrences(
            token_id,
            occurrences,
        )))
    }
}

fn occurrences_locked(conn: &Connection, token_id: &str) -> Result<Vec<TokenOccurrence>> {
    let mut stmt = conn.prepare_cached(
        "SELECT transaction_id, sender_org, receiver_org, amount, timestamp_ms
         FROM token_occurrences
         WHERE token_id = ?1
         ORDER BY timestamp_ms, recorded_at_ms",
    )?;

    let rows = stmt
        .query_map([token_id], |row| {
            let ts_ms: Option<i64> = row.get(4)?;
            Ok(TokenOccurrence {
                transaction_id: row.get(0)?,
                sender_org: row.get(1)?,
                receiver_org: row.get(2)?,
                amount: row.get(3)?,
                timestamp: ts_ms.and_then(|v| chrono::DateTime::from_timestamp_millis(v)),
            })
        })?
        .filter_map(|r| r.ok())
        .collect();

    Ok(rows)
}

impl TokenRegistry for SqliteTokenRegistry {
    fn register(&self, token_id: &str, occurrence: TokenOccurrence) -> Result<RegisterOutcome> {
        let ts_ms = occurrence.timestamp.map(|t| t.timestamp_millis());
        let recorded_at_ms = chrono::Utc::now().timestamp_millis();

        let conn = self.conn.lock();
        conn.execute("BEGIN IMMEDIATE", [])?;

        // Insert-and-detect-conflict: the unique primary key decides who is
        // first; everyone else takes the duplicate path.
        let changes = conn.execute(
            "INSERT OR IGNORE INTO token_registry
             (token_id, first_seen_ms, last_seen_ms, consumption_count, total_amount)
             VALUES (?1, ?2, ?2, 1, ?3)",
            params![token_id, ts_ms, occurrence.amount],
        )?;
        let first = changes > 0;

        if !first {
            conn.execute(
                "UPDATE token_registry SET
                    consumption_count = consumption_count + 1,
                    total_amount = total_amount + ?2,
                    first_seen_ms = CASE
                        WHEN first_seen_ms IS NULL THEN ?3
                        WHEN ?3 IS NULL THEN first_seen_ms
                        ELSE MIN(first_seen_ms, ?3) END,
                    last_seen_ms = CASE
                        WHEN last_seen_ms IS NULL THEN ?3
                        WHEN ?3 IS NULL THEN last_seen_ms
                        ELSE MAX(last_seen_ms, ?3) END
                 WHERE token_id = ?1",
                params![token_id, occurrence.amount, ts_ms],
            )?;
        }

        conn.execute(
            "INSERT INTO token_occurrences
             (token_id, transaction_id, sender_org, receiver_org, amount, timestamp_ms, recorded_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                token_id,
                occurrence.transaction_id,
                occurrence.sender_org,
                occurrence.receiver_org,
                occurrence.amount,
                ts_ms,
                recorded_at_ms,
            ],
        )?;

        let outcome = if first {
            RegisterOutcome::First
        } else {
            let entry = Self::snapshot_locked(&conn, token_id)?
                .context("registry row exists but has no occurrences")?;
            RegisterOutcome::Duplicate(entry)
        };

        conn.execute("COMMIT", [])?;
        Ok(outcome)
    }

    fn snapshot(&self, token_id: &str) -> Result<Option<TokenRegistryEntry>> {
        let conn = self.conn.lock();
        Self::snapshot_locked(&conn, token_id)
    }

    fn duplicates(&self) -> Result<Vec<TokenRegistryEntry>> {
        let conn = self.conn.lock();
        let token_ids: Vec<String> = {
            let mut stmt = conn.prepare_cached(
                "SELECT token_id FROM token_registry
                 WHERE consumption_count > 1
                 ORDER BY consumption_count DESC, token_id",
            )?;
            let ids = stmt
                .query_map([], |row| row.get(0))?
                .filter_map(|r| r.ok())
                .collect();
            ids
        };

        let mut entries = Vec::with_capacity(token_ids.len());
        for token_id in token_ids {
            if let Some(entry) = Self::snapshot_locked(&conn, &token_id)? {
                entries.push(entry);
            }
        }
        Ok(entries)
    }
}

/// In-memory registry for tests and dry runs. Same first-writer-wins
/// semantics, one mutex as the critical section.
#[derive(Default)]
pub struct MemoryTokenRegistry {
    tokens: Mutex<HashMap<String, Vec<TokenOccurrence>>>,
}

impl MemoryTokenRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TokenRegistry for MemoryTokenRegistry {
    fn register(&self, token_id: &str, occurrence: TokenOccurrence) -> Result<RegisterOutcome> {
        let mut tokens = self.tokens.lock();
        let occurrences = tokens.entry(token_id.to_string()).or_default();
        occurrences.push(occurrence);

        if occurrences.len() == 1 {
            Ok(RegisterOutcome::First)
        } else {
            Ok(RegisterOutcome::Duplicate(
                TokenRegistryEntry::from_occurrences(token_id, occurrences.clone()),
            ))
        }
    }

    fn snapshot(&self, token_id: &str) -> Result<Option<TokenRegistryEntry>> {
        let tokens = self.tokens.lock();
        Ok(tokens
            .get(token_id)
            .map(|occs| TokenRegistryEntry::from_occurrences(token_id, occs.clone())))
    }

    fn duplicates(&self) -> Result<Vec<TokenRegistryEntry>> {
        let tokens = self.tokens.lock();
        let mut entries: Vec<TokenRegistryEntry> = tokens
            .iter()
            .filter(|(_, occs)| occs.len() > 1)
            .map(|(id, occs)| TokenRegistryEntry::from_occurrences(id, occs.clone()))
            .collect();
        entries.sort_by(|a, b| {
            b.consumption_count
                .cmp(&a.consumption_count)
                .then_with(|| a.token_id.cmp(&b.token_id))
        });
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn occurrence(tx: &str, secs: i64, amount: f64) -> TokenOccurrence {
        TokenOccurrence {
            transaction_id: Some(tx.to_string()),
            sender_org: Some("ORG-A".to_string()),
            receiver_org: Some("ORG-B".to_string()),
            amount,
            timestamp: Some(Utc.timestamp_opt(secs, 0).unwrap()),
        }
    }

    fn registries() -> Vec<Box<dyn TokenRegistry>> {
        vec![
            Box::new(SqliteTokenRegistry::new(":memory:").expect("sqlite registry")),
            Box::new(MemoryTokenRegistry::new()),
        ]
    }

    #[test]
    fn test_first_registration_wins() {
        for registry in registries() {
            let outcome = registry
                .register("tok-1", occurrence("tx-1", 100, 10.0))
                .expect("register");
            assert!(matches!(outcome, RegisterOutcome::First));

            let entry = registry.snapshot("tok-1").expect("snapshot").unwrap();
            assert_eq!(entry.consumption_count, 1);
            assert!(registry.duplicates().expect("duplicates").is_empty());
        }
    }

    #[test]
    fn test_second_registration_is_duplicate_with_full_history() {
        for registry in registries() {
            registry
                .register("tok-1", occurrence("tx-1", 100, 10.0))
                .expect("first");
            let outcome = registry
                .register("tok-1", occurrence("tx-2", 200, 10.0))
                .expect("second");

            let RegisterOutcome::Duplicate(entry) = outcome else {
                panic!("expected duplicate");
            };
            assert_eq!(entry.consumption_count, 2);
            assert_eq!(entry.occurrences.len(), 2);
            assert_eq!(
                entry.first_seen,
                Some(Utc.timestamp_opt(100, 0).unwrap())
            );
            assert_eq!(entry.last_seen, Some(Utc.timestamp_opt(200, 0).unwrap()));
            assert!((entry.total_amount - 20.0).abs() < f64::EPSILON);

            let dupes = registry.duplicates().expect("duplicates");
            assert_eq!(dupes.len(), 1);
            assert_eq!(dupes[0].token_id, "tok-1");
        }
    }

    #[test]
    fn test_min_max_monotonicity_on_out_of_order_registration() {
        for registry in registries() {
            registry
                .register("tok-1", occurrence("tx-2", 200, 5.0))
                .expect("first");
            registry
                .register("tok-1", occurrence("tx-1", 100, 5.0))
                .expect("second");
            registry
                .register("tok-1", occurrence("tx-3", 300, 5.0))
                .expect("third");

            let entry = registry.snapshot("tok-1").expect("snapshot").unwrap();
            assert_eq!(entry.first_seen, Some(Utc.timestamp_opt(100, 0).unwrap()));
            assert_eq!(entry.last_seen, Some(Utc.timestamp_opt(300, 0).unwrap()));
            assert_eq!(entry.consumption_count, 3);
        }
    }

    #[test]
    fn test_distinct_tokens_do_not_collide() {
        for registry in registries() {
            assert!(matches!(
                registry
                    .register("tok-1", occurrence("tx-1", 100, 1.0))
                    .unwrap(),
                RegisterOutcome::First
            ));
            assert!(matches!(
                registry
                    .register("tok-2", occurrence("tx-2", 101, 2.0))
                    .unwrap(),
                RegisterOutcome::First
            ));
            assert!(registry.duplicates().unwrap().is_empty());
        }
    }

    #[test]
    fn test_sqlite_registry_races_produce_one_winner() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let registry = Arc::new(SqliteTokenRegistry::new(":memory:").expect("registry"));
        let firsts = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8i64)
            .map(|i| {
                let registry = Arc::clone(&registry);
                let firsts = Arc::clone(&firsts);
                std::thread::spawn(move || {
                    let outcome = registry
                        .register("tok-race", occurrence(&format!("tx-{}", i), 100 + i, 1.0))
                        .expect("register");
                    if matches!(outcome, RegisterOutcome::First) {
                        firsts.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().expect("thread");
        }

        assert_eq!(firsts.load(Ordering::SeqCst), 1);
        let entry = registry.snapshot("tok-race").expect("snapshot").unwrap();
        assert_eq!(entry.consumption_count, 8);
    }
}
