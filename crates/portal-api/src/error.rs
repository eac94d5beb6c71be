//! Error types for calls to protected resources.
//!
//! [`ApiError`] carries a coarse [`ApiErrorKind`] so the presentation layer
//! can render a specific message, the human-readable `message` it renders,
//! and the HTTP status when the resource server answered.

use portal_auth::{AuthError, AuthErrorKind};
use serde::{Deserialize, Serialize};

/// What went wrong with a protected call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiErrorKind {
    /// The session is not signed in; no request was sent.
    Unauthenticated,
    /// No token could be acquired.
    Auth(AuthErrorKind),
    /// The resource server answered with a non-success status.
    Http,
    /// The request never produced a response.
    Transport,
    /// The response body was not the expected JSON.
    Decode,
}

/// Failure of an authorized request.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct ApiError {
    pub kind: ApiErrorKind,
    pub message: String,
    /// Status returned by the resource server, if it answered.
    pub http_status: Option<u16>,
}

impl ApiError {
    pub fn unauthenticated() -> Self {
        Self {
            kind: ApiErrorKind::Unauthenticated,
            message: "sign in before calling protected resources".to_string(),
            http_status: None,
        }
    }

    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self {
            kind: ApiErrorKind::Http,
            message: message.into(),
            http_status: Some(status),
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self {
            kind: ApiErrorKind::Transport,
            message: message.into(),
            http_status: None,
        }
    }

    pub fn decode(message: impl Into<String>) -> Self {
        Self {
            kind: ApiErrorKind::Decode,
            message: message.into(),
            http_status: None,
        }
    }
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        Self {
            kind: ApiErrorKind::Auth(err.kind()),
            message: err.to_string(),
            http_status: None,
        }
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        Self::transport(err.to_string())
    }
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<ApiError>();
    }

    #[test]
    fn auth_failures_keep_their_kind() {
        let err = ApiError::from(AuthError::NoAccount);
        assert_eq!(err.kind, ApiErrorKind::Auth(AuthErrorKind::NoAccount));
        assert_eq!(err.http_status, None);
        assert_eq!(err.to_string(), AuthError::NoAccount.to_string());
    }

    #[test]
    fn http_error_displays_message_only() {
        let err = ApiError::http(500, "database offline");
        assert_eq!(err.to_string(), "database offline");
        assert_eq!(err.http_status, Some(500));
    }

    #[test]
    fn kind_serializes_snake_case() {
        let json = serde_json::to_string(&ApiErrorKind::Unauthenticated).unwrap();
        assert_eq!(json, "\"unauthenticated\"");
    }
}
