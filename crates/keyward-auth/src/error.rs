//! Error types for the auth engine.
//!
//! Every public operation returns [`AuthError`]. Variants map one-to-one
//! onto the failure kinds callers act on: configuration problems are
//! fatal, provider failures may be retried by the device-flow poll loop,
//! and callback validation failures are rendered without detail.

use keyward_store::StoreError;

/// Unified error type for the keyward auth engine.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// Missing client id/secret or malformed endpoint configuration.
    #[error("configuration error: {reason}")]
    Configuration { reason: String },

    /// A provider endpoint answered with a non-2xx status or an
    /// unrecognized body.
    #[error("provider error (HTTP {status}): {message}")]
    Provider { status: u16, message: String },

    /// Transport failure talking to a provider.
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// The device code expired before the user finished authorizing.
    #[error("device authorization expired")]
    AuthExpired,

    /// The user declined the device authorization request.
    #[error("device authorization denied by user")]
    AuthDenied,

    /// The caller-supplied poll ceiling was reached.
    #[error("gave up polling after {attempts} attempts")]
    PollLimitExceeded { attempts: u32 },

    /// The caller cancelled an in-flight operation.
    #[error("operation cancelled")]
    Cancelled,

    /// The callback `state` does not identify a redeemable session.
    #[error("invalid state")]
    InvalidState,

    /// The callback request is missing required parameters.
    #[error("invalid request")]
    InvalidRequest,

    /// The token endpoint rejected an authorization code or refresh token.
    #[error("token exchange failed{}", .description.as_deref().map(|d| format!(": {d}")).unwrap_or_default())]
    TokenExchangeFailed { description: Option<String> },

    /// No session, verifier or usable token for the current owner.
    #[error("unauthorized: {reason}")]
    Unauthorized { reason: String },

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("url parse error: {0}")]
    UrlParse(#[from] url::ParseError),
}

impl AuthError {
    pub(crate) fn config(reason: impl Into<String>) -> Self {
        Self::Configuration {
            reason: reason.into(),
        }
    }

    pub(crate) fn unauthorized(reason: impl Into<String>) -> Self {
        Self::Unauthorized {
            reason: reason.into(),
        }
    }

    /// The provider's `error_description` for a failed exchange, if any.
    /// Other variants return `None` so internal details never reach a
    /// rendered callback page.
    pub fn exchange_description(&self) -> Option<&str> {
        match self {
            Self::TokenExchangeFailed { description } => description.as_deref(),
            _ => None,
        }
    }
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, AuthError>;
