// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Pure mapping from raw agent errors to stable user-facing messages.
//!
//! Only the ask executor's error path calls this; a successful reply that
//! happens to contain "503" in its text is never classified.

use regex::Regex;
use std::sync::OnceLock;

/// Classify a raw error message into a stable user-facing one.
///
/// Rules are applied in order on the stringified message; the first match
/// wins and anything unrecognized passes through unchanged.
pub fn classify(raw: &str) -> String {
    static AUTH_STATUS: OnceLock<Regex> = OnceLock::new();
    let auth = AUTH_STATUS.get_or_init(|| Regex::new(r"\b(401|403)\b").unwrap());

    if auth.is_match(raw) {
        return "API key invalid or expired. Check your key.".to_string();
    }
    if raw.contains("429") {
        return "Rate limited. Check proxy quota.".to_string();
    }
    if raw.contains("503") {
        return "Service unavailable. Check proxy status.".to_string();
    }
    if raw.contains("ECONNREFUSED") {
        return "Connection refused. Check base URL.".to_string();
    }
    if raw.contains("ENOTFOUND") {
        return "DNS resolution failed. Check network.".to_string();
    }
    raw.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_statuses_require_standalone_number() {
        assert_eq!(
            classify("upstream returned 401 unauthorized"),
            "API key invalid or expired. Check your key."
        );
        assert_eq!(
            classify("status 403 for request"),
            "API key invalid or expired. Check your key."
        );
        // 4013 is not a standalone 401
        assert_eq!(classify("error code 4013"), "error code 4013");
    }

    #[test]
    fn rate_limit_and_availability() {
        assert_eq!(
            classify("request failed with status 429 too many requests"),
            "Rate limited. Check proxy quota."
        );
        assert_eq!(
            classify("got 503 from upstream"),
            "Service unavailable. Check proxy status."
        );
    }

    #[test]
    fn network_errors() {
        assert_eq!(
            classify("connect ECONNREFUSED 127.0.0.1:4000"),
            "Connection refused. Check base URL."
        );
        assert_eq!(
            classify("getaddrinfo ENOTFOUND api.invalid"),
            "DNS resolution failed. Check network."
        );
    }

    #[test]
    fn first_matching_rule_wins() {
        // 401 outranks 429 because rules are ordered.
        assert_eq!(
            classify("401 then 429"),
            "API key invalid or expired. Check your key."
        );
    }

    #[test]
    fn unknown_errors_pass_through() {
        assert_eq!(classify("model exploded"), "model exploded");
        assert_eq!(classify(""), "");
    }
}
