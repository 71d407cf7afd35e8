//! Error classification for fallback decisions.
//!
//! [`classify`] is a pure function: given an error and its rendered message,
//! it returns the [`ErrorClass`] that [`crate::chain::ProviderChain`] uses to
//! decide whether to fail over to the next provider. It never stores
//! anything and never string-matches anywhere else in the crate — this is
//! the sole authority for "is this retriable".

use crate::Error;

/// The fixed taxonomy a raw error is mapped to before a fallback decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    Network,
    Timeout,
    ServerError,
    ClientError,
    ContextWindow,
    RateLimit,
    Unknown,
}

impl ErrorClass {
    /// Whether the default `FallbackCondition` retries on this class.
    ///
    /// network=on, timeout=on, server-error=on, context-window=on,
    /// rate-limit=off, client-error=off, unknown=off.
    pub fn default_fallback_on(&self) -> bool {
        matches!(
            self,
            ErrorClass::Network
                | ErrorClass::Timeout
                | ErrorClass::ServerError
                | ErrorClass::ContextWindow
        )
    }
}

const TIMEOUT_SUBSTRINGS: &[&str] = &["timeout", "deadline"];
const NETWORK_SUBSTRINGS: &[&str] = &[
    "connection refused",
    "no such host",
    "network is unreachable",
];
const CONTEXT_WINDOW_SUBSTRINGS: &[&str] = &[
    "context length exceeds",
    "token limit",
    "context too large",
    "maximum context length",
    "possible context length exceeded",
    "empty response from llm",
];
const RATE_LIMIT_SUBSTRINGS: &[&str] = &["rate limit", "too many requests", "quota"];

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| haystack.contains(n))
}

/// Classify a raw error into the fixed taxonomy. Order of tests matters: the
/// first matching rule wins.
pub fn classify(err: &Error) -> ErrorClass {
    let msg = err.to_string().to_lowercase();

    if matches!(err, Error::Timeout | Error::Cancelled) || contains_any(&msg, TIMEOUT_SUBSTRINGS) {
        return ErrorClass::Timeout;
    }

    if matches!(err, Error::Http(e) if e.is_connect()) || contains_any(&msg, NETWORK_SUBSTRINGS) {
        return ErrorClass::Network;
    }

    if contains_any(&msg, CONTEXT_WINDOW_SUBSTRINGS)
        || (msg.contains("unexpected end of json input") && msg.contains("failed to parse"))
    {
        return ErrorClass::ContextWindow;
    }

    if contains_any(&msg, RATE_LIMIT_SUBSTRINGS) {
        return ErrorClass::RateLimit;
    }

    if msg.contains("http 5") {
        return ErrorClass::ServerError;
    }
    if msg.contains("http 4") {
        return ErrorClass::ClientError;
    }

    ErrorClass::Unknown
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_timeout() {
        assert_eq!(classify(&Error::timeout()), ErrorClass::Timeout);
        assert_eq!(
            classify(&Error::api("request deadline exceeded")),
            ErrorClass::Timeout
        );
    }

    #[test]
    fn test_classify_network() {
        assert_eq!(
            classify(&Error::api("connection refused")),
            ErrorClass::Network
        );
        assert_eq!(
            classify(&Error::stream("no such host localhost")),
            ErrorClass::Network
        );
    }

    #[test]
    fn test_classify_context_window() {
        assert_eq!(
            classify(&Error::api("possible context length exceeded")),
            ErrorClass::ContextWindow
        );
        assert_eq!(
            classify(&Error::stream(
                "unexpected end of JSON input: failed to parse body"
            )),
            ErrorClass::ContextWindow
        );
    }

    #[test]
    fn test_classify_rate_limit() {
        assert_eq!(
            classify(&Error::api("429 too many requests")),
            ErrorClass::RateLimit
        );
    }

    #[test]
    fn test_classify_server_error() {
        assert_eq!(
            classify(&Error::api("HTTP 503 Service Unavailable")),
            ErrorClass::ServerError
        );
    }

    #[test]
    fn test_classify_client_error() {
        assert_eq!(
            classify(&Error::api("HTTP 401 Unauthorized")),
            ErrorClass::ClientError
        );
    }

    #[test]
    fn test_classify_unknown() {
        assert_eq!(
            classify(&Error::other("something strange happened")),
            ErrorClass::Unknown
        );
    }

    #[test]
    fn test_classify_precedence_timeout_before_network() {
        // "timeout" substring should win even if message also looks network-ish.
        assert_eq!(
            classify(&Error::api("connection refused after timeout")),
            ErrorClass::Timeout
        );
    }

    #[test]
    fn test_default_fallback_on_classes() {
        assert!(ErrorClass::Network.default_fallback_on());
        assert!(ErrorClass::Timeout.default_fallback_on());
        assert!(ErrorClass::ServerError.default_fallback_on());
        assert!(ErrorClass::ContextWindow.default_fallback_on());
        assert!(!ErrorClass::RateLimit.default_fallback_on());
        assert!(!ErrorClass::ClientError.default_fallback_on());
        assert!(!ErrorClass::Unknown.default_fallback_on());
    }
}
