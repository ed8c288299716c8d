//! Response normalization
//!
//! The service has returned upload and download locations under several JSON
//! shapes over time. Everything is mapped to one canonical value here so the
//! job state machine never probes response structure itself.

use serde_json::Value;

use crate::types::{CreditBalance, RemoteStatus, StatusReport};

fn non_empty(value: Option<&Value>) -> Option<String> {
    value
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn first_of(value: Option<&Value>) -> Option<String> {
    value
        .and_then(Value::as_array)
        .and_then(|items| items.first())
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Upload URL from an accept response.
///
/// Checked in order: `urls[0]`, `uploadUrls[0]`, `uploadUrl`.
pub fn upload_url(body: &Value) -> Option<String> {
    first_of(body.get("urls"))
        .or_else(|| first_of(body.get("uploadUrls")))
        .or_else(|| non_empty(body.get("uploadUrl")))
}

/// Download URL from a status response.
///
/// Checked in order: `download.url`, `downloadUrl`, `download` as a string.
pub fn download_url(body: &Value) -> Option<String> {
    non_empty(body.get("download").and_then(|d| d.get("url")))
        .or_else(|| non_empty(body.get("downloadUrl")))
        .or_else(|| non_empty(body.get("download")))
}

/// Build a status report from a status response body.
pub fn status_report(body: &Value) -> StatusReport {
    let status = body
        .get("status")
        .and_then(Value::as_str)
        .map(RemoteStatus::parse)
        .unwrap_or_else(|| RemoteStatus::Unknown("unknown".into()));
    let progress = body.get("progress").and_then(Value::as_f64);
    StatusReport {
        status,
        progress,
        download_url: download_url(body),
        message: non_empty(body.get("message")),
    }
}

/// Credit balance from the balance endpoint; missing fields count as zero.
pub fn credit_balance(body: &Value) -> CreditBalance {
    let field = |name: &str| body.get(name).and_then(Value::as_f64).unwrap_or(0.0);
    CreditBalance {
        available: field("available_credits"),
        reserved: field("reserved_credits"),
        total: field("total_credits"),
    }
}
