//! Message-body field extraction.
//!
//! Request and response bodies are XML-ish markup; these helpers pull out the
//! correlation id, org attributes, result fields, and embedded token blobs.
//! All lookups are best-effort: a missing field is `None`, never an error.

use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref REQ_MSG_ID_RE: Regex =
        Regex::new(r#"reqMsgId="([^"]+)""#).expect("valid regex");
    static ref MSG_ID_RE: Regex = Regex::new(r#"\bmsgId="([^"]+)""#).expect("valid regex");
    static ref DETAIL_RE: Regex =
        Regex::new(r#"<Detail name="([^"]+)" value="([^"]+)""#).expect("valid regex");
    static ref RES_DETAILS_RE: Regex =
        Regex::new(r#"<ResDetails type="([^"]+)" Operation="([^"]+)">"#).expect("valid regex");
    static ref RESP_RESULT_RE: Regex =
        Regex::new(r#"<Resp reqMsgId="[^"]+" result="([^"]+)""#).expect("valid regex");
    static ref RESP_ERR_CODE_RE: Regex =
        Regex::new(r#"<Resp [^>]*errCode="([^"]+)""#).expect("valid regex");
    static ref RESP_ERR_MSG_RE: Regex =
        Regex::new(r#"<Resp [^>]*\bmsg="([^"]+)""#).expect("valid regex");
    static ref AMOUNT_RE: Regex =
        Regex::new(r#"<Amount value="([^"]+)" curr="([^"]+)">"#).expect("valid regex");
}

pub fn is_request(message: &str) -> bool {
    message.contains("<ReqDetails")
}

pub fn is_response(message: &str) -> bool {
    message.contains("<ResDetails")
}

/// Correlation key for a message. Responses carry the originating request's
/// id as `reqMsgId`; requests carry their own `msgId`.
pub fn message_id(message: &str) -> Option<String> {
    if is_response(message) {
        if let Some(caps) = REQ_MSG_ID_RE.captures(message) {
            return Some(caps[1].to_string());
        }
    }
    MSG_ID_RE.captures(message).map(|caps| caps[1].to_string())
}

/// Look up a `<Detail name="X" value="Y"/>` attribute by name.
pub fn attr_value(message: &str, name: &str) -> Option<String> {
    DETAIL_RE
        .captures_iter(message)
        .find(|caps| &caps[1] == name)
        .map(|caps| caps[2].to_string())
}

/// Every base64 token blob embedded as `<Detail name="tag" value="…"/>`.
pub fn token_blobs(message: &str) -> Vec<String> {
    DETAIL_RE
        .captures_iter(message)
        .filter(|caps| &caps[1] == "tag")
        .map(|caps| caps[2].to_string())
        .collect()
}

/// `(type, operation)` from `<ResDetails type="T" Operation="O">`.
pub fn response_detail(message: &str) -> (Option<String>, Option<String>) {
    match RES_DETAILS_RE.captures(message) {
        Some(caps) => (Some(caps[1].to_string()), Some(caps[2].to_string())),
        None => (None, None),
    }
}

/// Raw result attribute from the `<Resp>` tag, unnormalized.
pub fn response_result(message: &str) -> Option<String> {
    RESP_RESULT_RE
        .captures(message)
        .map(|caps| caps[1].to_string())
}

/// Error code from the `<Resp>` tag; "No error" when absent.
pub fn error_code(message: &str) -> String {
    RESP_ERR_CODE_RE
        .captures(message)
        .map(|caps| caps[1].to_string())
        .unwrap_or_else(|| "No error".to_string())
}

/// Error message from the `<Resp>` tag; "No error" when absent.
pub fn error_message(message: &str) -> String {
    RESP_ERR_MSG_RE
        .captures(message)
        .map(|caps| caps[1].to_string())
        .unwrap_or_else(|| "No error".to_string())
}

/// Declared `(value, currency)` from `<Amount value="…" curr="…">`.
pub fn amount(message: &str) -> Option<(f64, String)> {
    AMOUNT_RE.captures(message).and_then(|caps| {
        caps[1]
            .parse::<f64>()
            .ok()
            .map(|value| (value, caps[2].to_string()))
    })
}
