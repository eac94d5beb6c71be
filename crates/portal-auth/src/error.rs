//! Error types for the auth crate.
//!
//! Three layers of failure are modelled separately:
//!
//! - [`ProviderError`]: what the identity-provider collaborator reports.
//! - [`StoreError`]: persistence failures of the session cache.
//! - [`AuthError`]: what token acquisition and session transitions surface
//!   to callers. It is `Clone` so a single in-flight interactive outcome can
//!   be handed to every caller waiting on it.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// AuthError
// ---------------------------------------------------------------------------

/// Failure surfaced by the token acquisition engine and session controller.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    /// No authenticated account is available to acquire a token for.
    #[error("no signed-in account is available")]
    NoAccount,

    /// The interactive flow was cancelled by the user or rejected by the
    /// identity provider.
    #[error("interactive sign-in failed: {reason}")]
    InteractionFailed {
        /// Explanation from the provider or the callback.
        reason: String,
        /// Whether the user dismissed the sign-in surface.
        cancelled: bool,
    },

    /// A network or server error occurred while talking to the provider.
    #[error("token acquisition failed: {message}")]
    TransientAuthFailure {
        /// Transport or server message.
        message: String,
    },

    /// A caller-imposed deadline elapsed.
    #[error("token acquisition timed out after {after_secs} seconds")]
    Timeout {
        /// The deadline that elapsed.
        after_secs: u64,
    },

    /// A redirect-mode interaction was started; the flow resumes on the next
    /// boot with the provider's callback URL.
    #[error("redirect sign-in started, continue at {authorization_url}")]
    RedirectStarted {
        /// URL the user agent must navigate to.
        authorization_url: String,
    },

    /// The session cache could not be read or written.
    #[error("session cache error: {message}")]
    Store {
        /// Underlying store failure.
        message: String,
    },

    /// Configuration is missing or malformed.
    #[error("invalid configuration: {reason}")]
    InvalidConfig {
        /// What is wrong with the configuration.
        reason: String,
    },
}

/// Coarse classification of an [`AuthError`], suitable for rendering a
/// specific message or deciding whether to offer a manual retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthErrorKind {
    NoAccount,
    InteractionFailed,
    TransientAuthFailure,
    Timeout,
    RedirectStarted,
    Store,
    InvalidConfig,
}

impl AuthErrorKind {
    /// Stable string form, used in logs and CLI output.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoAccount => "no_account",
            Self::InteractionFailed => "interaction_failed",
            Self::TransientAuthFailure => "transient_auth_failure",
            Self::Timeout => "timeout",
            Self::RedirectStarted => "redirect_started",
            Self::Store => "store",
            Self::InvalidConfig => "invalid_config",
        }
    }
}

impl std::fmt::Display for AuthErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl AuthError {
    /// The classification of this error.
    pub fn kind(&self) -> AuthErrorKind {
        match self {
            Self::NoAccount => AuthErrorKind::NoAccount,
            Self::InteractionFailed { .. } => AuthErrorKind::InteractionFailed,
            Self::TransientAuthFailure { .. } => AuthErrorKind::TransientAuthFailure,
            Self::Timeout { .. } => AuthErrorKind::Timeout,
            Self::RedirectStarted { .. } => AuthErrorKind::RedirectStarted,
            Self::Store { .. } => AuthErrorKind::Store,
            Self::InvalidConfig { .. } => AuthErrorKind::InvalidConfig,
        }
    }

    /// Whether a manual retry by the user has a reasonable chance to succeed.
    ///
    /// Nothing in this crate retries automatically; this only informs the
    /// presentation layer.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::TransientAuthFailure { .. } | Self::Timeout { .. } => true,
            Self::InteractionFailed { cancelled, .. } => *cancelled,
            Self::NoAccount
            | Self::RedirectStarted { .. }
            | Self::Store { .. }
            | Self::InvalidConfig { .. } => false,
        }
    }
}

impl From<StoreError> for AuthError {
    fn from(err: StoreError) -> Self {
        Self::Store {
            message: err.to_string(),
        }
    }
}

impl From<ProviderError> for AuthError {
    /// Map a collaborator failure that happened outside the silent path.
    ///
    /// `InteractionRequired` cannot occur on an interactive path; should a
    /// provider report it there anyway it is treated as a rejection so no
    /// further escalation is possible.
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::Cancelled { reason } => Self::InteractionFailed {
                reason,
                cancelled: true,
            },
            ProviderError::Rejected { reason }
            | ProviderError::InteractionRequired { reason } => Self::InteractionFailed {
                reason,
                cancelled: false,
            },
            ProviderError::StateMismatch => Self::InteractionFailed {
                reason: "state parameter did not match the pending request".to_string(),
                cancelled: false,
            },
            ProviderError::Transport { message } => Self::TransientAuthFailure { message },
            ProviderError::Store(err) => Self::Store {
                message: err.to_string(),
            },
            ProviderError::InvalidConfig { reason } => Self::InvalidConfig { reason },
        }
    }
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, AuthError>;

// ---------------------------------------------------------------------------
// ProviderError
// ---------------------------------------------------------------------------

/// Failure reported by an [`IdentityProvider`](crate::provider::IdentityProvider).
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// Silent acquisition cannot proceed without user interaction: the
    /// refresh credential is absent, expired or revoked, or the provider
    /// demands consent or a fresh sign-in.
    #[error("interaction required: {reason}")]
    InteractionRequired {
        /// Provider explanation.
        reason: String,
    },

    /// The user dismissed the sign-in surface.
    #[error("user cancelled sign-in: {reason}")]
    Cancelled {
        /// Provider explanation.
        reason: String,
    },

    /// The provider rejected the request for a reason interaction cannot fix.
    #[error("request rejected by identity provider: {reason}")]
    Rejected {
        /// Provider explanation.
        reason: String,
    },

    /// Network failure or a server-side error from the provider.
    #[error("identity provider unreachable: {message}")]
    Transport {
        /// Transport or server message.
        message: String,
    },

    /// The `state` echoed in a callback does not match the pending request.
    #[error("callback state mismatch")]
    StateMismatch,

    /// The provider could not persist or read its session artifacts.
    #[error("session cache error: {0}")]
    Store(#[from] StoreError),

    /// Configuration is missing or malformed.
    #[error("invalid configuration: {reason}")]
    InvalidConfig {
        /// What is wrong with the configuration.
        reason: String,
    },
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        Self::Transport {
            message: err.to_string(),
        }
    }
}

impl From<url::ParseError> for ProviderError {
    fn from(err: url::ParseError) -> Self {
        Self::InvalidConfig {
            reason: format!("invalid URL: {err}"),
        }
    }
}

impl From<std::io::Error> for ProviderError {
    fn from(err: std::io::Error) -> Self {
        Self::Transport {
            message: err.to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// StoreError
// ---------------------------------------------------------------------------

/// Failure of the session cache backing the account store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Reading or writing the session cache file failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The session cache file is not valid JSON.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The store mutex was poisoned by a panicking writer.
    #[error("account store lock poisoned")]
    Poisoned,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
