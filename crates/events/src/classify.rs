//! Failure classification for the retry path.
//!
//! Errors are matched case-insensitively against their name, code, and
//! message. The non-retryable set takes precedence; anything that matches
//! neither set is treated as retryable so transient-looking failures get
//! a chance instead of being dropped.

use crate::types::ErrorInfo;

/// Errors that will never succeed on retry. Multi-word classes carry the
/// spaced, underscored, and collapsed forms so conventional camelCase
/// names ("NotFoundError") match after lowercasing.
const NON_RETRYABLE_PATTERNS: &[&str] = &[
    "validation",
    "authentication",
    "authorization",
    "not found",
    "not_found",
    "notfound",
    "duplicate",
];

/// Errors that are expected to be transient.
const RETRYABLE_PATTERNS: &[&str] = &[
    "network",
    "timeout",
    "timed out",
    "timedout",
    "rate limit",
    "rate_limit",
    "ratelimit",
    "temporary",
    "service unavailable",
    "service_unavailable",
    "serviceunavailable",
];

/// Decide whether a failure should be retried.
pub fn is_retryable(error: &ErrorInfo) -> bool {
    if matches_any(error, NON_RETRYABLE_PATTERNS) {
        return false;
    }
    if matches_any(error, RETRYABLE_PATTERNS) {
        return true;
    }
    // Unclassified errors default to retryable; they exhaust max_retries
    // rather than being silently dropped.
    true
}

fn matches_any(error: &ErrorInfo, patterns: &[&str]) -> bool {
    [
        error.name.as_deref(),
        error.code.as_deref(),
        Some(error.message.as_str()),
    ]
    .into_iter()
    .flatten()
    .any(|field| {
        let field = field.to_lowercase();
        patterns.iter().any(|pattern| field.contains(pattern))
    })
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    #[test]
    fn retryable_patterns_match_by_code() {
        let error = ErrorInfo::new("request failed").with_code("TIMEOUT_ERROR");
        assert!(is_retryable(&error));
    }

    #[test]
    fn retryable_patterns_match_by_name() {
        let error = ErrorInfo::new("request failed").with_name("NetworkError");
        assert!(is_retryable(&error));
    }

    #[test]
    fn retryable_patterns_match_message_substring() {
        let error = ErrorInfo::new("upstream Service Unavailable (503)");
        assert!(is_retryable(&error));
    }

    #[test]
    fn non_retryable_patterns_match() {
        for code in [
            "VALIDATION_ERROR",
            "AUTHENTICATION_FAILED",
            "AUTHORIZATION_DENIED",
            "NOT_FOUND",
            "DUPLICATE_EVENT",
        ] {
            let error = ErrorInfo::new("rejected").with_code(code);
            assert!(!is_retryable(&error), "{code} should not be retryable");
        }
    }

    #[test]
    fn camel_case_names_match_collapsed_patterns() {
        let not_found = ErrorInfo::new("no such deployment").with_name("NotFoundError");
        assert!(!is_retryable(&not_found));

        let rate_limited = ErrorInfo::new("slow down").with_name("RateLimitError");
        assert!(is_retryable(&rate_limited));

        let unavailable = ErrorInfo::new("upstream down").with_name("ServiceUnavailableError");
        assert!(is_retryable(&unavailable));
    }

    #[test]
    fn non_retryable_takes_precedence_over_retryable() {
        // Both sets match; the non-retryable classification wins.
        let error = ErrorInfo::new("validation failed due to network timeout");
        assert!(!is_retryable(&error));
    }

    #[test]
    fn unknown_errors_default_to_retryable() {
        let error = ErrorInfo::new("something odd happened");
        assert!(is_retryable(&error));
    }
}
