//! Provider failure classification.
//!
//! Every failed generation attempt is turned into a [`ProviderFailure`] and
//! classified into an [`ErrorKind`]. The kind decides whether the request may
//! be retried once on the fallback provider and which message the user sees.
//!
//! Classification is applied in a fixed priority order:
//! rate-limit code or message, HTTP 429, HTTP 5xx, HTTP 401, other HTTP 4xx,
//! timeout, network failure, invalid prompt text, and finally `unknown`.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Trait for errors that can be classified as retryable or non-retryable
pub trait RetryableError {
    /// Returns true if the error is transient and another provider may succeed
    fn is_retryable(&self) -> bool;

    /// Returns the error type for logging purposes
    fn error_type(&self) -> String;

    /// Returns the error message
    fn error_message(&self) -> String;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    RateLimit,
    ServerError,
    AuthError,
    ClientError,
    Timeout,
    NetworkError,
    InvalidPrompt,
    Unknown,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::RateLimit => "rate_limit",
            ErrorKind::ServerError => "server_error",
            ErrorKind::AuthError => "auth_error",
            ErrorKind::ClientError => "client_error",
            ErrorKind::Timeout => "timeout",
            ErrorKind::NetworkError => "network_error",
            ErrorKind::InvalidPrompt => "invalid_prompt",
            ErrorKind::Unknown => "unknown",
        }
    }

    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::RateLimit
                | ErrorKind::ServerError
                | ErrorKind::Timeout
                | ErrorKind::NetworkError
        )
    }

    /// Short, non-technical text shown to the end user.
    pub fn user_message(self) -> &'static str {
        match self {
            ErrorKind::RateLimit => "Usage limit reached, trying alternate provider.",
            ErrorKind::ServerError => "The provider is having issues, retrying.",
            ErrorKind::AuthError => "There was an authentication problem.",
            ErrorKind::ClientError => "The request was invalid.",
            ErrorKind::Timeout => "Connection timeout, retrying.",
            ErrorKind::NetworkError => "Network issue, retrying.",
            ErrorKind::InvalidPrompt => "Invalid message format.",
            ErrorKind::Unknown => "Something went wrong while generating a response. Please try again.",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a failure was observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureOrigin {
    /// Provider answered with a non-success HTTP status
    Http,
    Timeout,
    /// Connect, DNS or reset before or during the body
    Network,
    /// Body arrived but could not be decoded
    Stream,
    Other,
}

/// One failed attempt against one provider.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ProviderFailure {
    pub origin: FailureOrigin,
    pub status: Option<u16>,
    /// Provider error code from the response body, if any
    pub code: Option<String>,
    pub message: String,
}

const RATE_LIMIT_MARKERS: &[&str] = &[
    "rate limit",
    "rate_limit",
    "rate-limit",
    "ratelimit",
    "too many requests",
    "quota",
];

const TIMEOUT_MARKERS: &[&str] = &["timeout", "timed out", "etimedout", "deadline exceeded"];

const NETWORK_MARKERS: &[&str] = &[
    "econnreset",
    "econnrefused",
    "enotfound",
    "connection reset",
    "connection refused",
    "dns",
    "socket hang up",
    "network",
];

const INVALID_PROMPT_MARKERS: &[&str] = &[
    "invalid prompt",
    "invalid_prompt",
    "invalid request",
    "invalid_request",
    "invalid message",
];

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| haystack.contains(n))
}

impl ProviderFailure {
    pub fn new(origin: FailureOrigin, message: impl Into<String>) -> Self {
        Self {
            origin,
            status: None,
            code: None,
            message: message.into(),
        }
    }

    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            ..Self::new(FailureOrigin::Http, message)
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(FailureOrigin::Timeout, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(FailureOrigin::Network, message)
    }

    pub fn stream(message: impl Into<String>) -> Self {
        Self::new(FailureOrigin::Stream, message)
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// Maps a transport-level reqwest error.
    pub fn from_reqwest_error(error: &reqwest::Error) -> Self {
        let failure = if error.is_timeout() {
            Self::timeout(error.to_string())
        } else if error.is_connect() || error.is_request() {
            Self::network(error.to_string())
        } else if error.is_decode() || error.is_body() {
            Self::stream(error.to_string())
        } else {
            Self::new(FailureOrigin::Other, error.to_string())
        };
        match error.status() {
            Some(status) => Self {
                status: Some(status.as_u16()),
                ..failure
            },
            None => failure,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        let message = self.message.to_ascii_lowercase();
        let code = self
            .code
            .as_deref()
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();

        if contains_any(&code, RATE_LIMIT_MARKERS) || contains_any(&message, RATE_LIMIT_MARKERS) {
            return ErrorKind::RateLimit;
        }
        if let Some(status) = self.status {
            match status {
                429 => return ErrorKind::RateLimit,
                500..=599 => return ErrorKind::ServerError,
                401 => return ErrorKind::AuthError,
                400..=499 => return ErrorKind::ClientError,
                _ => {}
            }
        }
        if self.origin == FailureOrigin::Timeout
            || contains_any(&code, TIMEOUT_MARKERS)
            || contains_any(&message, TIMEOUT_MARKERS)
        {
            return ErrorKind::Timeout;
        }
        if self.origin == FailureOrigin::Network
            || contains_any(&code, NETWORK_MARKERS)
            || contains_any(&message, NETWORK_MARKERS)
        {
            return ErrorKind::NetworkError;
        }
        if contains_any(&code, INVALID_PROMPT_MARKERS)
            || contains_any(&message, INVALID_PROMPT_MARKERS)
        {
            return ErrorKind::InvalidPrompt;
        }
        ErrorKind::Unknown
    }

    pub fn classify(&self) -> Classification {
        let kind = self.kind();
        Classification {
            kind,
            retryable: kind.is_retryable(),
            user_message: kind.user_message(),
        }
    }
}

impl RetryableError for ProviderFailure {
    fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }

    fn error_type(&self) -> String {
        self.kind().as_str().to_string()
    }

    fn error_message(&self) -> String {
        self.message.clone()
    }
}

/// Result of classifying a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub kind: ErrorKind,
    pub retryable: bool,
    pub user_message: &'static str,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(ProviderFailure::http(429, "slow down").kind(), ErrorKind::RateLimit);
        assert_eq!(ProviderFailure::http(503, "unavailable").kind(), ErrorKind::ServerError);
        assert_eq!(ProviderFailure::http(401, "bad key").kind(), ErrorKind::AuthError);
        assert_eq!(ProviderFailure::http(404, "no such model").kind(), ErrorKind::ClientError);
        assert_eq!(ProviderFailure::http(408, "request took long").kind(), ErrorKind::ClientError);
    }

    #[test]
    fn test_rate_limit_message_wins_over_status() {
        let failure = ProviderFailure::http(400, "Rate limit exceeded for this key");
        assert_eq!(failure.kind(), ErrorKind::RateLimit);

        let failure = ProviderFailure::http(403, "forbidden").with_code("insufficient_quota");
        assert_eq!(failure.kind(), ErrorKind::RateLimit);
        assert!(failure.is_retryable());
    }

    #[test]
    fn test_transport_failures() {
        assert_eq!(ProviderFailure::timeout("deadline").kind(), ErrorKind::Timeout);
        assert_eq!(
            ProviderFailure::new(FailureOrigin::Other, "Request timed out").kind(),
            ErrorKind::Timeout
        );
        assert_eq!(ProviderFailure::network("connect").kind(), ErrorKind::NetworkError);
        assert_eq!(
            ProviderFailure::stream("read ECONNRESET").kind(),
            ErrorKind::NetworkError
        );
    }

    #[test]
    fn test_invalid_prompt_and_unknown() {
        let failure = ProviderFailure::stream("Invalid prompt: content filtered");
        assert_eq!(failure.kind(), ErrorKind::InvalidPrompt);
        assert!(!failure.is_retryable());

        let failure = ProviderFailure::stream("unexpected end of data");
        assert_eq!(failure.kind(), ErrorKind::Unknown);
        assert_eq!(failure.error_type(), "unknown");
    }

    #[test]
    fn test_retryable_kinds() {
        let retryable: Vec<ErrorKind> = [
            ErrorKind::RateLimit,
            ErrorKind::ServerError,
            ErrorKind::AuthError,
            ErrorKind::ClientError,
            ErrorKind::Timeout,
            ErrorKind::NetworkError,
            ErrorKind::InvalidPrompt,
            ErrorKind::Unknown,
        ]
        .into_iter()
        .filter(|k| k.is_retryable())
        .collect();
        assert_eq!(
            retryable,
            vec![
                ErrorKind::RateLimit,
                ErrorKind::ServerError,
                ErrorKind::Timeout,
                ErrorKind::NetworkError
            ]
        );
    }

    #[test]
    fn test_classification_carries_user_message() {
        let c = ProviderFailure::http(500, "boom").classify();
        assert!(c.retryable);
        assert_eq!(c.kind, ErrorKind::ServerError);
        assert!(!c.user_message.contains("500"));
    }
}
