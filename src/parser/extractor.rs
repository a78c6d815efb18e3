//! Log Line Extractor
//!
//! Splits raw multi-line text into discrete timestamped entries. Entries are
//! delimited by a timestamp-prefixed header line; everything up to the next
//! header (or end of input) belongs to the current entry's message body.
//! Output order equals input order — no reordering, no deduplication.

use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use tracing::warn;

use crate::models::LogEntry;

lazy_static! {
    /// Header: ISO-8601 UTC timestamp, level, module path (optionally with a
    /// trailing `{span}` block), then a colon and the message body.
    static ref HEADER_RE: Regex = Regex::new(
        r"(\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}\.\d+Z)\s+(\w+)\s+([\w:]+(?:\{[^}]+\})?):\s?"
    )
    .expect("valid header regex");
}

/// Lazily yield entries from raw log text, in input order.
///
/// Text before the first header is dropped. A header whose timestamp fails to
/// parse is dropped with a warning and the stream continues.
pub fn extract_entries(raw: &str) -> impl Iterator<Item = LogEntry> + '_ {
    let mut headers = HEADER_RE.captures_iter(raw).peekable();

    std::iter::from_fn(move || {
        loop {
            let caps = headers.next()?;
            let header = caps.get(0).expect("group 0 always present");

            let body_start = header.end();
            let body_end = headers
                .peek()
                .and_then(|next| next.get(0))
                .map(|m| m.start())
                .unwrap_or(raw.len());

            let raw_ts = &caps[1];
            let timestamp = match parse_header_timestamp(raw_ts) {
                Some(ts) => ts,
                None => {
                    warn!("dropping entry with unparseable timestamp: {}", raw_ts);
                    continue;
                }
            };

            return Some(LogEntry {
                timestamp,
                level: caps[2].to_string(),
                module: caps[3].to_string(),
                message: raw[body_start..body_end].trim().to_string(),
            });
        }
    })
}

fn parse_header_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
