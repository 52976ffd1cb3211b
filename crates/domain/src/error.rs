//! The shared error vocabulary.
//!
//! Every failure the proxy reports to a caller carries a machine-readable
//! [`ErrorKind`] tag plus a human-readable message.  Secret values must never
//! appear in messages — constructors take names, not values.

use serde::{Deserialize, Serialize};

/// Machine-readable failure tags, serialized verbatim onto the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    BadConfig,
    MissingSecret,
    UnknownCaller,
    UnknownConnection,
    CallerLacksConnection,
    EndpointDenied,
    RateLimited,
    NotAuthorized,
    UnknownPeer,
    InvalidSignature,
    TimestampSkew,
    MalformedMessage,
    ReplayDetected,
    HandshakeTimeout,
    SessionNotFound,
    IngestorStartFailed,
    IngestorNotRunning,
    WebhookSignatureInvalid,
    WebhookBadJson,
    UpstreamError,
}

/// A tagged proxy error: `kind` for machines, `message` for humans.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
#[error("{kind:?}: {message}")]
pub struct ProxyError {
    pub kind: ErrorKind,
    pub message: String,
}

impl ProxyError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn bad_config(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::BadConfig, message)
    }

    /// Takes the secret *name* only; the value never reaches an error.
    pub fn missing_secret(name: &str) -> Self {
        Self::new(
            ErrorKind::MissingSecret,
            format!("secret reference ${{{name}}} is not set"),
        )
    }

    pub fn unknown_caller(alias: &str) -> Self {
        Self::new(ErrorKind::UnknownCaller, format!("unknown caller: {alias}"))
    }

    pub fn unknown_connection(alias: &str) -> Self {
        Self::new(
            ErrorKind::UnknownConnection,
            format!("unknown connection: {alias}"),
        )
    }

    pub fn not_authorized() -> Self {
        Self::new(ErrorKind::NotAuthorized, "admin role required")
    }
}

pub type Result<T> = std::result::Result<T, ProxyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_serializes_as_bare_tag() {
        let json = serde_json::to_string(&ErrorKind::EndpointDenied).unwrap();
        assert_eq!(json, "\"EndpointDenied\"");
    }

    #[test]
    fn error_roundtrips_through_json() {
        let err = ProxyError::unknown_connection("github");
        let json = serde_json::to_string(&err).unwrap();
        let parsed: ProxyError = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, err);
        assert_eq!(parsed.kind, ErrorKind::UnknownConnection);
    }

    #[test]
    fn missing_secret_names_the_variable_not_the_value() {
        let err = ProxyError::missing_secret("GITHUB_TOKEN");
        assert!(err.message.contains("${GITHUB_TOKEN}"));
    }
}
