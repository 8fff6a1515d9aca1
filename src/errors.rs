//! Typed error hierarchy for the Nexus client core.
//!
//! Two top-level types cover the two transports:
//! - `ConnectionError` — WebSocket dial, auth, and framing failures
//! - `ApiError` — HTTP failures, normalized from the server envelope

use thiserror::Error;

/// Largest client frame we will put on the wire, in bytes.
pub const MAX_FRAME_BYTES: usize = 64 * 1024;

/// Errors from the live connection subsystem.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("No auth token available; call ensure_open with a valid token")]
    AuthMissing,

    #[error("Server rejected the auth token (close code 4401)")]
    AuthExpired,

    #[error("Frame of {size} bytes exceeds the {limit} byte limit")]
    FrameTooLarge { size: usize, limit: usize },

    #[error("Failed to parse inbound frame: {0}")]
    Parse(String),

    #[error("Connection closed by user")]
    Closed,
}

/// Classification of a normalized HTTP failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorKind {
    /// Request never reached the server (DNS, refused, timeout).
    Network,
    /// Server answered with a 5xx status.
    Server,
    /// Server rejected the request body or parameters (400/422).
    Validation,
    /// Caller lacks permission or the resource is missing (403/404).
    Rejected,
    /// 429 from the server.
    RateLimited,
    /// 401 — the bearer token is no longer accepted.
    AuthExpired,
    /// The caller tore down the request before completion.
    Canceled,
    /// Anything we could not classify.
    Unknown,
}

/// A normalized HTTP API failure.
///
/// Built by the API client from the server envelope
/// `{error, error_code, message}` when present, falling back to `detail`,
/// then to a generic per-status message.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ApiError {
    pub kind: ApiErrorKind,
    pub message: String,
    /// Machine-readable code from the server envelope, if any.
    pub error_code: Option<String>,
    /// HTTP status, absent for network-level failures.
    pub status: Option<u16>,
}

impl ApiError {
    pub fn network(message: impl Into<String>) -> Self {
        Self {
            kind: ApiErrorKind::Network,
            message: message.into(),
            error_code: None,
            status: None,
        }
    }

    pub fn canceled() -> Self {
        Self {
            kind: ApiErrorKind::Canceled,
            message: "Request canceled".to_string(),
            error_code: None,
            status: None,
        }
    }

    /// Classify an HTTP status into an error kind.
    pub fn kind_for_status(status: u16) -> ApiErrorKind {
        match status {
            401 => ApiErrorKind::AuthExpired,
            400 | 422 => ApiErrorKind::Validation,
            403 | 404 => ApiErrorKind::Rejected,
            429 => ApiErrorKind::RateLimited,
            500..=599 => ApiErrorKind::Server,
            _ => ApiErrorKind::Unknown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_too_large_carries_sizes() {
        let err = ConnectionError::FrameTooLarge {
            size: 70_000,
            limit: MAX_FRAME_BYTES,
        };
        assert!(err.to_string().contains("70000"));
        assert!(err.to_string().contains("65536"));
    }

    #[test]
    fn auth_errors_are_matchable() {
        assert!(matches!(
            ConnectionError::AuthMissing,
            ConnectionError::AuthMissing
        ));
        assert!(matches!(
            ConnectionError::AuthExpired,
            ConnectionError::AuthExpired
        ));
    }

    #[test]
    fn status_classification() {
        assert_eq!(ApiError::kind_for_status(401), ApiErrorKind::AuthExpired);
        assert_eq!(ApiError::kind_for_status(400), ApiErrorKind::Validation);
        assert_eq!(ApiError::kind_for_status(422), ApiErrorKind::Validation);
        assert_eq!(ApiError::kind_for_status(403), ApiErrorKind::Rejected);
        assert_eq!(ApiError::kind_for_status(404), ApiErrorKind::Rejected);
        assert_eq!(ApiError::kind_for_status(429), ApiErrorKind::RateLimited);
        assert_eq!(ApiError::kind_for_status(500), ApiErrorKind::Server);
        assert_eq!(ApiError::kind_for_status(503), ApiErrorKind::Server);
        assert_eq!(ApiError::kind_for_status(418), ApiErrorKind::Unknown);
    }

    #[test]
    fn api_error_displays_message() {
        let err = ApiError {
            kind: ApiErrorKind::Server,
            message: "Something went wrong on the server.".to_string(),
            error_code: Some("internal_error".to_string()),
            status: Some(500),
        };
        assert_eq!(err.to_string(), "Something went wrong on the server.");
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&ConnectionError::AuthMissing);
        assert_std_error(&ApiError::canceled());
    }
}
