//! Token Codec
//!
//! Decodes the base64+JSON blob embedded in log messages into token
//! descriptors. Request blobs carry `inputs` (existing tokens being spent,
//! each with an id) and `outputs` (value + position only, no id yet).
//! Response blobs are single fully specified tokens carrying ids.
//!
//! A decode failure is per-token: callers skip the offending blob and keep
//! processing the rest of the message.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::models::{OutputSlot, TokenDescriptor};

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("invalid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("decoded bytes are not utf-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
    #[error("invalid token JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Input and output descriptors separated from one request blob.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RequestTokens {
    pub inputs: Vec<TokenDescriptor>,
    pub outputs: Vec<OutputSlot>,
}

// Wire shapes as emitted by the network nodes. `value` arrives either as a
// JSON number or a quoted string depending on node version.

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct TokenTagWire {
    currency: String,
    creation_timestamp: String,
    issuer_signature: String,
    owner_address: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct TokenWire {
    id: Option<String>,
    serial_no: String,
    value: Value,
    tag: TokenTagWire,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct OutputWire {
    value: Value,
    output_index: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct RequestWire {
    inputs: Vec<TokenWire>,
    outputs: Vec<OutputWire>,
}

fn value_to_f64(value: &Value) -> f64 {
    match value {
        Value::Number(n) => n.as_f64().unwrap_or(0.0),
        Value::String(s) => s.parse().unwrap_or(0.0),
        _ => 0.0,
    }
}

fn token_from_wire(wire: TokenWire) -> TokenDescriptor {
    TokenDescriptor {
        value: value_to_f64(&wire.value),
        id: wire.id,
        serial_no: wire.serial_no,
        currency: wire.tag.currency,
        creation_timestamp: wire.tag.creation_timestamp,
        issuer_signature: wire.tag.issuer_signature,
        owner_address: wire.tag.owner_address,
    }
}

fn token_to_wire(token: &TokenDescriptor) -> TokenWire {
    TokenWire {
        id: token.id.clone(),
        serial_no: token.serial_no.clone(),
        value: serde_json::json!(token.value),
        tag: TokenTagWire {
            currency: token.currency.clone(),
            creation_timestamp: token.creation_timestamp.clone(),
            issuer_signature: token.issuer_signature.clone(),
            owner_address: token.owner_address.clone(),
        },
    }
}

fn decode_json<T: serde::de::DeserializeOwned>(blob: &str) -> Result<T, DecodeError> {
    let bytes = BASE64.decode(blob)?;
    let text = String::from_utf8(bytes)?;
    Ok(serde_json::from_str(&text)?)
}

/// Decode a response-side blob: one fully specified token.
pub fn decode_response_token(blob: &str) -> Result<TokenDescriptor, DecodeError> {
    decode_json::<TokenWire>(blob).map(token_from_wire)
}

/// Decode a request-side blob into input tokens and output slots.
pub fn decode_request_tokens(blob: &str) -> Result<RequestTokens, DecodeError> {
    let wire: RequestWire = decode_json(blob)?;
    Ok(RequestTokens {
        inputs: wire.inputs.into_iter().map(token_from_wire).collect(),
        outputs: wire
            .outputs
            .into_iter()
            .map(|o| OutputSlot {
                value: value_to_f64(&o.value),
                output_index: o.output_index,
            })
            .collect(),
    })
}

/// Encode a token back into its base64+JSON wire form.
pub fn encode_response_token(token: &TokenDescriptor) -> String {
    let json = serde_json::to_string(&token_to_wire(token)).expect("wire token serializes");
    BASE64.encode(json)
}

/// Encode inputs/outputs back into a request wire blob.
pub fn encode_request_tokens(tokens: &RequestTokens) -> String {
    let wire = RequestWire {
        inputs: tokens.inputs.iter().map(token_to_wire).collect(),
        outputs: tokens
            .outputs
            .iter()
            .map(|o| OutputWire {
                value: serde_json::json!(o.value),
                output_index: o.output_index,
            })
            .collect(),
    };
    let json = serde_json::to_string(&wire).expect("wire request serializes");
    BASE64.encode(json)
}
