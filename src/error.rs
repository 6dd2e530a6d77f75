use std::time::Duration;

use thiserror::Error;

use crate::auth::Provider;

/// Failure to hand out a usable access token.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("authorization required for {0}")]
    AuthRequired(Provider),

    #[error("token refresh for {provider} failed temporarily: {message}")]
    Transient { provider: Provider, message: String },
}

/// Outcome of a refresh-token grant that did not produce new credentials.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RefreshError {
    /// The refresh token was rejected (revoked, expired, unknown client).
    #[error("refresh token rejected: {0}")]
    InvalidGrant(String),

    #[error("token endpoint unavailable: {0}")]
    Transient(String),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SourceError {
    #[error("authorization required for the payment source")]
    AuthRequired,

    #[error("payment source rate limited the request")]
    RateLimited { retry_after: Option<Duration> },

    #[error("payment source rejected the access token")]
    Unauthorized,

    #[error("payment source unavailable: {0}")]
    Transient(String),

    #[error("payment source refused the request: {0}")]
    Permanent(String),
}

impl From<TokenError> for SourceError {
    fn from(err: TokenError) -> Self {
        match err {
            TokenError::AuthRequired(_) => SourceError::AuthRequired,
            TokenError::Transient { message, .. } => SourceError::Transient(message),
        }
    }
}

/// Per-payment delivery failure. All but `AuthRequired` count as a failed attempt.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SendError {
    #[error("authorization required for the alert sink")]
    AuthRequired,

    #[error("alert sink rejected the access token")]
    Unauthorized,

    /// The request may or may not have reached the provider.
    #[error("alert request timed out with unknown outcome")]
    Timeout,

    #[error("alert sink rate limited the request")]
    RateLimited,

    #[error("alert sink unavailable: {0}")]
    Transient(String),

    #[error("alert rejected: {0}")]
    Rejected(String),
}

impl From<TokenError> for SendError {
    fn from(err: TokenError) -> Self {
        match err {
            TokenError::AuthRequired(_) => SendError::AuthRequired,
            TokenError::Transient { message, .. } => SendError::Transient(message),
        }
    }
}

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("ledger serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("payment {payment_id}: cannot move from {from} to {to}")]
    InvalidTransition {
        payment_id: String,
        from: &'static str,
        to: &'static str,
    },
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),
}
