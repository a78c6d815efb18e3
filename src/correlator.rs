//! Transaction Correlator
//!
//! Merges request and response log entries into transaction records, keyed by
//! message id. Correlation is order-independent: the two halves of a
//! transaction land on the same record no matter which arrives first or how
//! entries for other message ids interleave between them.

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::models::{DeclaredAmount, LogEntry, TransactionRecord, TxOutcome};
use crate::parser::{codec, fields};

/// Result of correlating one batch stream.
#[derive(Debug, Default)]
pub struct CorrelationOutcome {
    /// All records, in first-seen order. Incomplete records are included —
    /// they are stored downstream but excluded from duplicate scanning.
    pub records: Vec<TransactionRecord>,
    /// Records still missing a half at end-of-stream.
    pub correlation_gaps: usize,
    /// Per-token decode failures (token skipped, record kept).
    pub decode_errors: Vec<String>,
}

/// Per-batch correlation state. Private to one batch stream; not shared.
pub struct TransactionCorrelator {
    in_flight: HashMap<String, TransactionRecord>,
    first_seen: Vec<String>,
    decode_errors: Vec<String>,
}

impl TransactionCorrelator {
    pub fn new() -> Self {
        Self {
            in_flight: HashMap::new(),
            first_seen: Vec::new(),
            decode_errors: Vec::new(),
        }
    }

    /// Route one log entry to its transaction record. Entries without a
    /// message id or request/response marker are ignored.
    pub fn observe(&mut self, entry: &LogEntry) {
        let message = entry.message.as_str();
        let Some(message_id) = fields::message_id(message) else {
            return;
        };

        if fields::is_request(message) {
            self.apply_request(&message_id, entry);
        } else if fields::is_response(message) {
            self.apply_response(&message_id, entry);
        }
    }

    /// Freeze the batch. Records come back in first-seen order; anything
    /// still incomplete is surfaced as a correlation gap.
    pub fn finish(mut self) -> CorrelationOutcome {
        let mut records = Vec::with_capacity(self.first_seen.len());
        let mut gaps = 0usize;

        for message_id in self.first_seen {
            let Some(record) = self.in_flight.remove(&message_id) else {
                continue;
            };
            if !record.is_complete() {
                gaps += 1;
                warn!(
                    "batch ended with incomplete record for msg_id={} (request={}, response={})",
                    message_id, record.has_request, record.has_response
                );
            }
            records.push(record);
        }

        debug!(
            "correlation finished: {} records, {} gaps",
            records.len(),
            gaps
        );

        CorrelationOutcome {
            records,
            correlation_gaps: gaps,
            decode_errors: self.decode_errors,
        }
    }

    fn record_for(&mut self, message_id: &str) -> &mut TransactionRecord {
        if !self.in_flight.contains_key(message_id) {
            self.first_seen.push(message_id.to_string());
            self.in_flight
                .insert(message_id.to_string(), TransactionRecord::new(message_id));
        }
        self.in_flight.get_mut(message_id).expect("just inserted")
    }

    fn apply_request(&mut self, message_id: &str, entry: &LogEntry) {
        let message = entry.message.as_str();

        let transaction_id = fields::attr_value(message, "transactionId");
        let sender_org_id = fields::attr_value(message, "senderOrgId");
        let receiver_org_id = fields::attr_value(message, "receiverOrgId");
        let declared_amount = fields::amount(message).map(|(value, currency)| DeclaredAmount {
            value,
            currency,
        });

        let mut decode_errors = Vec::new();
        let mut inputs = Vec::new();
        let mut outputs = Vec::new();
        for blob in fields::token_blobs(message) {
            match codec::decode_request_tokens(&blob) {
                Ok(mut tokens) => {
                    inputs.append(&mut tokens.inputs);
                    outputs.append(&mut tokens.outputs);
                }
                Err(e) => {
                    warn!("skipping undecodable request token on msg_id={}: {}", message_id, e);
                    decode_errors.push(format!("msg_id={}: {}", message_id, e));
                }
            }
        }
        self.decode_errors.append(&mut decode_errors);

        let requested_amount = inputs.iter().map(|t| t.value).sum();

        let record = self.record_for(message_id);
        record.request_timestamp = Some(entry.timestamp);
        record.transaction_id = transaction_id;
        record.sender_org_id = sender_org_id;
        record.receiver_org_id = receiver_org_id;
        record.declared_amount = declared_amount;
        record.input_tokens = inputs;
        record.output_slots = outputs;
        record.requested_amount = requested_amount;
        record.has_request = true;

        if record.is_complete() {
            record.finalize_derived();
        }
    }

    fn apply_response(&mut self, message_id: &str, entry: &LogEntry) {
        let message = entry.message.as_str();

        let (transaction_type, operation) = fields::response_detail(message);
        let raw_result = fields::response_result(message);
        let outcome = TxOutcome::from_wire(raw_result.as_deref());
        let error_code = fields::error_code(message);
        let error_message = fields::error_message(message);

        let mut decode_errors = Vec::new();
        let mut response_tokens = Vec::new();
        for blob in fields::token_blobs(message) {
            match codec::decode_response_token(&blob) {
                Ok(token) => response_tokens.push(token),
                Err(e) => {
                    warn!("skipping undecodable response token on msg_id={}: {}", message_id, e);
                    decode_errors.push(format!("msg_id={}: {}", message_id, e));
                }
            }
        }
        self.decode_errors.append(&mut decode_errors);

        // A response with no prior request still gets a record: it must not
        // crash, but with an empty input list it contributes nothing to
        // duplicate detection.
        let record = self.record_for(message_id);
        record.response_timestamp = Some(entry.timestamp);
        record.transaction_type = transaction_type;
        record.operation = operation;
        record.outcome = outcome;
        record.error_code = Some(error_code);
        record.error_message = Some(error_message);
        record.response_tokens = response_tokens;
        record.has_response = true;

        if record.is_complete() {
            record.finalize_derived();
        }
    }
}

impl Default for TransactionCorrelator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{OutputSlot, TokenDescriptor};
    use crate::parser::codec::{encode_request_tokens, encode_response_token};
    use crate::parser::RequestTokens;
    use chrono::{TimeZone, Utc};

    fn entry(secs: i64, message: &str) -> LogEntry {
        LogEntry {
            timestamp: Utc.timestamp_opt(secs, 0).unwrap(),
            level: "INFO".to_string(),
            module: "attestation::api".to_string(),
            message: message.to_string(),
        }
    }

    fn token(id: &str, value: f64) -> TokenDescriptor {
        TokenDescriptor {
            id: Some(id.to_string()),
            serial_no: format!("SN-{}", id),
            value,
            currency: "INR".to_string(),
            creation_timestamp: "2025-04-20T10:00:00Z".to_string(),
            issuer_signature: "sig".to_string(),
            owner_address: "addr".to_string(),
        }
    }

    fn request_message(msg_id: &str, tx_id: &str, inputs: Vec<TokenDescriptor>) -> String {
        let blob = encode_request_tokens(&RequestTokens {
            inputs,
            outputs: vec![OutputSlot {
                value: 10.0,
                output_index: 0,
            }],
        });
        format!(
            r#"<TxnReq msgId="{msg_id}"><ReqDetails><Detail name="senderOrgId" value="ORG-A"/><Detail name="receiverOrgId" value="ORG-B"/><Detail name="transactionId" value="{tx_id}"/><Amount value="10.0" curr="INR"><Detail name="tag" value="{blob}"/></ReqDetails>"#
        )
    }

    fn response_message(msg_id: &str, result: &str) -> String {
        let blob = encode_response_token(&token("minted-1", 10.0));
        format!(
            r#"<TxnRes msgId="res-{msg_id}"><ResDetails type="TRANSFER" Operation="DEBIT"><Resp reqMsgId="{msg_id}" result="{result}" errCode="E00" msg="done"/><Detail name="tag" value="{blob}"/></ResDetails>"#
        )
    }

    #[test]
    fn test_request_then_response_completes_record() {
        let mut correlator = TransactionCorrelator::new();
        correlator.observe(&entry(
            100,
            &request_message("m1", "TX-1", vec![token("tok-a", 4.0), token("tok-b", 6.0)]),
        ));
        correlator.observe(&entry(101, &response_message("m1", "SUCCESS")));

        let outcome = correlator.finish();
        assert_eq!(outcome.records.len(), 1);
        assert_eq!(outcome.correlation_gaps, 0);

        let rec = &outcome.records[0];
        assert!(rec.is_complete());
        assert_eq!(rec.outcome, TxOutcome::Success);
        assert_eq!(rec.transaction_id.as_deref(), Some("TX-1"));
        assert_eq!(rec.number_of_inputs, 2);
        assert_eq!(rec.number_of_outputs, 1);
        assert!((rec.requested_amount - 10.0).abs() < f64::EPSILON);
        assert_eq!(rec.processing_latency_ms, 1000);
        assert_eq!(rec.response_tokens.len(), 1);
    }

    #[test]
    fn test_correlation_is_order_independent() {
        let req = entry(100, &request_message("m1", "TX-1", vec![token("tok-a", 4.0)]));
        let res = entry(101, &response_message("m1", "SUCCESS"));

        let mut fwd = TransactionCorrelator::new();
        fwd.observe(&req);
        fwd.observe(&res);
        let fwd_rec = fwd.finish().records.pop().unwrap();

        let mut rev = TransactionCorrelator::new();
        rev.observe(&res);
        rev.observe(&req);
        let rev_rec = rev.finish().records.pop().unwrap();

        assert!(fwd_rec.is_complete());
        assert!(rev_rec.is_complete());
        assert_eq!(fwd_rec.message_id, rev_rec.message_id);
        assert_eq!(fwd_rec.outcome, rev_rec.outcome);
        assert_eq!(fwd_rec.processing_latency_ms, rev_rec.processing_latency_ms);
        assert_eq!(fwd_rec.number_of_inputs, rev_rec.number_of_inputs);
        assert_eq!(fwd_rec.requested_amount, rev_rec.requested_amount);
    }

    #[test]
    fn test_interleaved_transactions_do_not_cross() {
        let mut correlator = TransactionCorrelator::new();
        // Two transactions with responses out of lockstep with requests.
        correlator.observe(&entry(100, &request_message("m1", "TX-1", vec![token("a", 1.0)])));
        correlator.observe(&entry(101, &request_message("m2", "TX-2", vec![token("b", 2.0)])));
        correlator.observe(&entry(103, &response_message("m2", "FAILURE")));
        correlator.observe(&entry(102, &response_message("m1", "SUCCESS")));

        let outcome = correlator.finish();
        assert_eq!(outcome.records.len(), 2);

        let m1 = outcome.records.iter().find(|r| r.message_id == "m1").unwrap();
        let m2 = outcome.records.iter().find(|r| r.message_id == "m2").unwrap();
        assert_eq!(m1.outcome, TxOutcome::Success);
        assert_eq!(m1.transaction_id.as_deref(), Some("TX-1"));
        assert_eq!(m2.outcome, TxOutcome::Failure);
        assert_eq!(m2.transaction_id.as_deref(), Some("TX-2"));
    }

    #[test]
    fn test_orphan_response_yields_incomplete_record_with_no_inputs() {
        let mut correlator = TransactionCorrelator::new();
        correlator.observe(&entry(101, &response_message("m-orphan", "SUCCESS")));

        let outcome = correlator.finish();
        assert_eq!(outcome.records.len(), 1);
        assert_eq!(outcome.correlation_gaps, 1);

        let rec = &outcome.records[0];
        assert!(!rec.is_complete());
        assert!(!rec.is_successful());
        assert!(rec.input_tokens.is_empty());
        assert_eq!(rec.processing_latency_ms, 0);
    }

    #[test]
    fn test_unanswered_request_is_a_gap() {
        let mut correlator = TransactionCorrelator::new();
        correlator.observe(&entry(100, &request_message("m1", "TX-1", vec![token("a", 1.0)])));

        let outcome = correlator.finish();
        assert_eq!(outcome.correlation_gaps, 1);
        assert!(!outcome.records[0].is_complete());
    }

    #[test]
    fn test_bad_token_blob_keeps_record() {
        let message = r#"<TxnReq msgId="m1"><ReqDetails><Detail name="transactionId" value="TX-1"/><Detail name="tag" value="!!!not-base64!!!"/></ReqDetails>"#;
        let mut correlator = TransactionCorrelator::new();
        correlator.observe(&entry(100, message));

        let outcome = correlator.finish();
        assert_eq!(outcome.records.len(), 1);
        assert_eq!(outcome.decode_errors.len(), 1);
        assert!(outcome.records[0].input_tokens.is_empty());
        assert!(outcome.records[0].has_request);
    }

    #[test]
    fn test_entries_without_message_id_are_ignored() {
        let mut correlator = TransactionCorrelator::new();
        correlator.observe(&entry(100, "starting worker pool"));
        let outcome = correlator.finish();
        assert!(outcome.records.is_empty());
    }

    #[test]
    fn test_unknown_result_not_successful() {
        let mut correlator = TransactionCorrelator::new();
        correlator.observe(&entry(100, &request_message("m1", "TX-1", vec![token("a", 1.0)])));
        correlator.observe(&entry(101, &response_message("m1", "PENDING")));

        let outcome = correlator.finish();
        let rec = &outcome.records[0];
        assert!(rec.is_complete());
        assert_eq!(rec.outcome, TxOutcome::Unknown);
        assert!(!rec.is_successful());
    }
}
