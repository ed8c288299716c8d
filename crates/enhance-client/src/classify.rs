//! Error classification for enhancement service responses
//!
//! Distinguishes credit exhaustion (rotate to another key after refreshing
//! balances), rate limiting (back the key off), rejected keys, and everything
//! else (generic retry).

use std::time::Duration;

use crate::error::Error;

/// Message fragments the service uses when an account cannot pay for a job.
const CREDIT_PATTERNS: &[&str] = &["credit refill in progress", "insufficient credits", "no credits"];

/// Whether a message indicates credit exhaustion (case-insensitive).
pub fn is_credit_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    CREDIT_PATTERNS.iter().any(|pattern| lower.contains(pattern))
}

/// Pull a human-readable message out of an error body.
///
/// Accepts `{"message": ..}`, `{"error": {"message": ..}}`, `{"error": ".."}`
/// and falls back to the raw (trimmed) body.
pub fn error_message(body: &str) -> String {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(body) {
        let candidates = [
            value.get("message"),
            value.get("error").and_then(|e| e.get("message")),
            value.get("error"),
        ];
        for candidate in candidates.into_iter().flatten() {
            if let Some(text) = candidate.as_str() {
                if !text.is_empty() {
                    return text.to_string();
                }
            }
        }
    }
    let trimmed = body.trim();
    if trimmed.is_empty() {
        "<no body>".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Classify a non-success response by HTTP status and body.
///
/// 401/403 reject the key, 402 and credit messages are credit exhaustion,
/// 429 is a rate limit (unless the body talks about credits), everything else
/// is a generic API error.
pub fn classify_status(status: u16, body: &str, retry_after: Option<Duration>) -> Error {
    let message = error_message(body);
    if is_credit_message(&message) || status == 402 {
        return Error::CreditExhausted(message);
    }
    match status {
        401 | 403 => Error::InvalidCredential(message),
        429 => Error::RateLimited {
            message,
            retry_after,
        },
        _ => Error::Api { status, message },
    }
}

/// Parse a `Retry-After` header given in whole seconds.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}
