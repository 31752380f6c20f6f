//! Failure classification
//!
//! An error is retryable if its kind is in the configured retryable list, or
//! if its message matches one of the category heuristics. Anything else is
//! final.

use crate::utils::errors::GovernorError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Broad failure category used for strategy selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureCategory {
    Timeout,
    RateLimit,
    Network,
    Auth,
    Unknown,
}

impl FailureCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureCategory::Timeout => "timeout",
            FailureCategory::RateLimit => "rate-limit",
            FailureCategory::Network => "network",
            FailureCategory::Auth => "auth",
            FailureCategory::Unknown => "unknown",
        }
    }
}

impl fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors the retry coordinator can classify
pub trait RetryableError: fmt::Display {
    /// Stable kind matched against `RetryOptions::retryable_kinds`
    fn error_kind(&self) -> Option<&str> {
        None
    }
}

impl RetryableError for GovernorError {
    fn error_kind(&self) -> Option<&str> {
        match self {
            GovernorError::Io(e) => Some(io_kind(e)),
            other => Some(other.kind()),
        }
    }
}

impl RetryableError for std::io::Error {
    fn error_kind(&self) -> Option<&str> {
        Some(io_kind(self))
    }
}

impl RetryableError for anyhow::Error {
    fn error_kind(&self) -> Option<&str> {
        if let Some(e) = self.downcast_ref::<GovernorError>() {
            return e.error_kind();
        }
        self.downcast_ref::<std::io::Error>().map(io_kind)
    }
}

impl RetryableError for String {}

impl RetryableError for str {}

impl<T: RetryableError + ?Sized> RetryableError for &T {
    fn error_kind(&self) -> Option<&str> {
        (**self).error_kind()
    }
}

fn io_kind(error: &std::io::Error) -> &'static str {
    use std::io::ErrorKind;
    match error.kind() {
        ErrorKind::TimedOut => "timed_out",
        ErrorKind::ConnectionRefused => "connection_refused",
        ErrorKind::ConnectionReset => "connection_reset",
        ErrorKind::ConnectionAborted => "connection_aborted",
        ErrorKind::NotConnected => "not_connected",
        ErrorKind::BrokenPipe => "broken_pipe",
        ErrorKind::WouldBlock => "would_block",
        ErrorKind::Interrupted => "interrupted",
        ErrorKind::PermissionDenied => "permission_denied",
        ErrorKind::NotFound => "not_found",
        _ => "io",
    }
}

const TIMEOUT_PATTERNS: &[&str] = &["timeout", "timed out", "etimedout", "deadline exceeded"];

const RATE_LIMIT_PATTERNS: &[&str] = &[
    "rate limit",
    "rate-limit",
    "ratelimit",
    "quota",
    "too many requests",
];

const NETWORK_PATTERNS: &[&str] = &[
    "econnreset",
    "econnrefused",
    "enotfound",
    "enetunreach",
    "ehostunreach",
    "epipe",
    "connection reset",
    "connection refused",
    "connection aborted",
    "broken pipe",
    "socket hang up",
    "network",
];

const AUTH_PATTERNS: &[&str] = &[
    "unauthorized",
    "unauthenticated",
    "authentication",
    "invalid api key",
    "invalid token",
    "token expired",
    "forbidden",
];

const RATE_LIMIT_STATUS: &[&str] = &["429"];
const AUTH_STATUS: &[&str] = &["401", "403"];

/// Words that mark a nearby number as an HTTP status
const STATUS_CONTEXT: &[&str] = &["http", "status"];
const STATUS_CONTEXT_WINDOW: usize = 3;

/// Whether one of `codes` appears as a whole token shortly after `http` or `status`
///
/// Bare digits are too common in test output (line numbers, counts, names)
/// to classify on their own.
fn has_http_status(lower: &str, codes: &[&str]) -> bool {
    let tokens: Vec<&str> = lower
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|token| !token.is_empty())
        .collect();

    tokens.iter().enumerate().any(|(i, token)| {
        codes.contains(token)
            && tokens[i.saturating_sub(STATUS_CONTEXT_WINDOW)..i]
                .iter()
                .any(|word| STATUS_CONTEXT.contains(word))
    })
}

/// Category from message heuristics alone
pub fn categorize_message(message: &str) -> Option<FailureCategory> {
    let lower = message.to_lowercase();
    let matches = |patterns: &[&str]| patterns.iter().any(|p| lower.contains(p));

    if matches(TIMEOUT_PATTERNS) {
        Some(FailureCategory::Timeout)
    } else if matches(RATE_LIMIT_PATTERNS) || has_http_status(&lower, RATE_LIMIT_STATUS) {
        Some(FailureCategory::RateLimit)
    } else if matches(NETWORK_PATTERNS) {
        Some(FailureCategory::Network)
    } else if matches(AUTH_PATTERNS) || has_http_status(&lower, AUTH_STATUS) {
        Some(FailureCategory::Auth)
    } else {
        None
    }
}

fn categorize_kind(kind: &str) -> Option<FailureCategory> {
    match kind {
        "execution_timeout_exceeded" | "timed_out" => Some(FailureCategory::Timeout),
        "connection_refused" | "connection_reset" | "connection_aborted" | "not_connected"
        | "broken_pipe" => Some(FailureCategory::Network),
        "permission_denied" => Some(FailureCategory::Auth),
        _ => None,
    }
}

/// Result of classifying one failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub category: FailureCategory,
    pub retryable: bool,

    /// Category plus normalized message; equal signatures mean "same failure"
    pub signature: String,
}

/// Classify `error` against the configured retryable kinds, then heuristics
pub fn classify<E: RetryableError + ?Sized>(error: &E, retryable_kinds: &[String]) -> Classification {
    let message = error.to_string();
    let heuristic = categorize_message(&message);

    let explicit = error
        .error_kind()
        .filter(|kind| retryable_kinds.iter().any(|k| k == kind));

    let (category, retryable) = match (explicit, heuristic) {
        (Some(kind), heuristic) => (
            heuristic
                .or_else(|| categorize_kind(kind))
                .unwrap_or(FailureCategory::Unknown),
            true,
        ),
        (None, Some(category)) => (category, true),
        (None, None) => (FailureCategory::Unknown, false),
    };

    Classification {
        category,
        retryable,
        signature: signature(category, &message),
    }
}

/// Digits are masked so ids, ports and counters do not split signatures
fn signature(category: FailureCategory, message: &str) -> String {
    let normalized: String = message
        .chars()
        .take(160)
        .map(|c| if c.is_ascii_digit() { '#' } else { c.to_ascii_lowercase() })
        .collect();
    format!("{}:{}", category, normalized.trim())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heuristic_categories() {
        assert_eq!(categorize_message("Request timed out"), Some(FailureCategory::Timeout));
        assert_eq!(categorize_message("Daily quota reached"), Some(FailureCategory::RateLimit));
        assert_eq!(categorize_message("HTTP 429 Too Many Requests"), Some(FailureCategory::RateLimit));
        assert_eq!(categorize_message("read ECONNRESET"), Some(FailureCategory::Network));
        assert_eq!(categorize_message("401 Unauthorized"), Some(FailureCategory::Auth));
        assert_eq!(categorize_message("syntax error in test file"), None);
    }

    #[test]
    fn test_status_codes_need_http_context() {
        assert_eq!(
            categorize_message("request failed with status 429"),
            Some(FailureCategory::RateLimit)
        );
        assert_eq!(categorize_message("HTTP/1.1 401"), Some(FailureCategory::Auth));
        assert_eq!(categorize_message("status_code=403"), Some(FailureCategory::Auth));

        assert_eq!(categorize_message("assertion failed at line 4017"), None);
        assert_eq!(categorize_message("test_parse_1429 failed: expected 3"), None);
        assert_eq!(categorize_message("expected 401 rows, got 403"), None);
    }

    #[test]
    fn test_digits_in_test_output_are_final() {
        for message in ["assertion failed at line 4017", "test_parse_1429 failed: expected 3"] {
            let c = classify(message, &[]);
            assert!(!c.retryable, "{}", message);
            assert_eq!(c.category, FailureCategory::Unknown);
        }
    }

    #[test]
    fn test_unmatched_error_is_final() {
        let c = classify("assertion failed: expected 3", &[]);
        assert!(!c.retryable);
        assert_eq!(c.category, FailureCategory::Unknown);
    }

    #[test]
    fn test_explicit_kind_makes_retryable() {
        let error = GovernorError::AdmissionDenied("ai-assistant process limit exceeded: 5/5".into());
        assert!(!classify(&error, &[]).retryable);

        let c = classify(&error, &["admission_denied".to_string()]);
        assert!(c.retryable);
        assert_eq!(c.category, FailureCategory::Unknown);
    }

    #[test]
    fn test_io_kind_maps_category() {
        let error = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused by peer");
        let c = classify(&error, &["connection_refused".to_string()]);
        assert!(c.retryable);
        assert_eq!(c.category, FailureCategory::Network);
    }

    #[test]
    fn test_anyhow_downcasts_kind() {
        let error = anyhow::Error::new(GovernorError::ExecutionTimeoutExceeded);
        assert_eq!(error.error_kind(), Some("execution_timeout_exceeded"));
        assert_eq!(classify(&error, &[]).category, FailureCategory::Timeout);
    }

    #[test]
    fn test_signature_masks_digits() {
        let a = classify("connection refused on port 8080", &[]);
        let b = classify("connection refused on port 9090", &[]);
        assert_eq!(a.signature, b.signature);
        assert!(a.signature.starts_with("network:"));
    }
}
