//! Tokentrace Backend Library
//!
//! Core ingestion engine for token payment-network protocol logs: parses raw
//! archives into log entries, correlates request/response pairs into
//! transaction records, persists them, and flags duplicate token
//! consumption.

pub mod correlator;
pub mod ingest;
pub mod models;
pub mod parser;
pub mod pipeline;
pub mod storage;
