use async_trait::async_trait;
use reqwest::StatusCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error};

use super::{Alert, AlertSink};
use crate::auth::{Provider, TokenStore};
use crate::error::SendError;
use crate::filter::TextFilter;
use crate::psp::Payment;

/// Posts custom alerts to the streamer's alert widget.
pub struct DonationAlertsSink {
    api_base: String,
    tokens: Arc<TokenStore>,
    filter: TextFilter,
    client: reqwest::Client,
}

impl DonationAlertsSink {
    pub fn new(
        api_base: impl Into<String>,
        tokens: Arc<TokenStore>,
        filter: TextFilter,
        timeout: Duration,
    ) -> reqwest::Result<Self> {
        Ok(Self {
            api_base: api_base.into().trim_end_matches('/').to_string(),
            tokens,
            filter,
            client: reqwest::Client::builder().timeout(timeout).build()?,
        })
    }
}

fn classify_status(status: StatusCode, body: &str) -> SendError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => SendError::Unauthorized,
        StatusCode::TOO_MANY_REQUESTS => SendError::RateLimited,
        s if s.is_server_error() => SendError::Transient(format!("HTTP {s}")),
        s => SendError::Rejected(format!("HTTP {s}: {body}")),
    }
}

#[async_trait]
impl AlertSink for DonationAlertsSink {
    fn name(&self) -> &str {
        "DonationAlerts"
    }

    async fn send(&self, payment: &Payment) -> Result<(), SendError> {
        let token = self.tokens.access_token(Provider::Sink).await?;
        let alert = Alert::render(payment, &self.filter);

        let mut form = vec![("header", alert.header.as_str())];
        if let Some(message) = alert.message.as_deref() {
            form.push(("message", message));
        }

        let resp = self
            .client
            .post(format!("{}/custom_alert", self.api_base))
            .bearer_auth(&token)
            .form(&form)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    SendError::Timeout
                } else {
                    error!(payment_id = %payment.id, error = %e, "Failed to post alert");
                    SendError::Transient(e.to_string())
                }
            })?;

        let status = resp.status();
        if status.is_success() {
            debug!(payment_id = %payment.id, status = %status, "Alert accepted");
            return Ok(());
        }

        let body = resp.text().await.unwrap_or_default();
        Err(classify_status(status, &body))
    }
}
