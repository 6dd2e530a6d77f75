pub mod lolzteam;
pub mod mock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::StatusCode;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::SourceError;

/// A received payment, normalized across providers. Never mutated after fetch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payment {
    pub id: String,
    pub amount: Decimal,
    pub currency: String,
    pub sender: String,
    pub message: String,
    pub received_at: DateTime<Utc>,
}

#[async_trait]
pub trait PaymentSource: Send + Sync {
    fn name(&self) -> &str;

    /// Payments received at or after `since`, in whatever order the provider returns them.
    async fn list_recent(&self, since: DateTime<Utc>) -> Result<Vec<Payment>, SourceError>;
}

pub(crate) fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

pub(crate) fn classify_status(status: StatusCode, headers: &HeaderMap) -> SourceError {
    match status {
        StatusCode::TOO_MANY_REQUESTS => SourceError::RateLimited {
            retry_after: retry_after(headers),
        },
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => SourceError::Unauthorized,
        s if s.is_server_error() || s == StatusCode::REQUEST_TIMEOUT => {
            SourceError::Transient(format!("HTTP {s}"))
        }
        s => SourceError::Permanent(format!("HTTP {s}")),
    }
}

/// Network failures, including timeouts, are always retryable.
pub(crate) fn classify_transport(err: reqwest::Error) -> SourceError {
    if err.is_timeout() {
        SourceError::Transient("request timed out".to_string())
    } else {
        SourceError::Transient(err.to_string())
    }
}
