//! Raw log text parsing: header extraction, message field lookup, and token
//! blob decoding.

pub mod codec;
pub mod extractor;
pub mod fields;

pub use codec::{DecodeError, RequestTokens};
pub use extractor::extract_entries;
