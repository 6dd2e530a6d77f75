use super::{classify_status, classify_transport, Payment, PaymentSource};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde_json::Value;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::auth::{Provider, TokenStore};
use crate::error::SourceError;

const UNKNOWN_SENDER: &str = "Unknown";

/// Incoming transfers from the market's payment history.
pub struct LolzteamSource {
    api_base: String,
    currency: String,
    tokens: Arc<TokenStore>,
    client: reqwest::Client,
}

impl LolzteamSource {
    pub fn new(api_base: impl Into<String>, tokens: Arc<TokenStore>, timeout: Duration) -> reqwest::Result<Self> {
        Ok(Self {
            api_base: api_base.into().trim_end_matches('/').to_string(),
            currency: "RUB".to_string(),
            tokens,
            client: reqwest::Client::builder().timeout(timeout).build()?,
        })
    }
}

#[async_trait]
impl PaymentSource for LolzteamSource {
    fn name(&self) -> &str {
        "Lolzteam"
    }

    async fn list_recent(&self, since: DateTime<Utc>) -> Result<Vec<Payment>, SourceError> {
        let token = self.tokens.access_token(Provider::Source).await?;

        let resp = self
            .client
            .get(format!("{}/user/payments", self.api_base))
            .bearer_auth(&token)
            .query(&[
                ("type", "receiving_money"),
                ("show_payment_stats", "false"),
                ("is_hold", "false"),
            ])
            .send()
            .await
            .map_err(classify_transport)?;

        if !resp.status().is_success() {
            return Err(classify_status(resp.status(), resp.headers()));
        }

        let body: Value = resp
            .json()
            .await
            .map_err(|e| SourceError::Permanent(format!("malformed payment list: {e}")))?;

        let payments = parse_payments(&body, since, &self.currency)?;
        debug!(count = payments.len(), since = %since, "Fetched payments");
        Ok(payments)
    }
}

/// Normalizes the `payments` map (id -> entry) of the history response.
fn parse_payments(body: &Value, since: DateTime<Utc>, currency: &str) -> Result<Vec<Payment>, SourceError> {
    let entries = match body.get("payments") {
        Some(Value::Object(map)) => map,
        // An empty history is serialized as a JSON list.
        Some(Value::Array(list)) if list.is_empty() => return Ok(Vec::new()),
        _ => {
            return Err(SourceError::Permanent(
                "payment list response has no 'payments' object".to_string(),
            ))
        }
    };

    let mut payments = Vec::new();
    for (id, entry) in entries {
        let Some(received_at) = entry
            .get("operation_date")
            .and_then(Value::as_i64)
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
        else {
            warn!(payment_id = %id, "Skipping payment without operation date");
            continue;
        };
        if received_at < since {
            continue;
        }

        let Some(amount) = entry.get("incoming_sum").and_then(parse_amount) else {
            warn!(payment_id = %id, "Skipping payment with unreadable amount");
            continue;
        };

        let data = entry.get("data");
        let text = |key: &str| {
            data.and_then(|d| d.get(key))
                .and_then(Value::as_str)
                .map(str::to_string)
        };

        payments.push(Payment {
            id: id.clone(),
            amount,
            currency: currency.to_string(),
            sender: text("username").unwrap_or_else(|| UNKNOWN_SENDER.to_string()),
            message: text("commentPlain").unwrap_or_default(),
            received_at,
        });
    }

    Ok(payments)
}

fn parse_amount(value: &Value) -> Option<Decimal> {
    let amount = match value {
        Value::String(s) => Decimal::from_str(s.trim()).ok()?,
        // Go through the textual form to avoid binary float artifacts.
        Value::Number(n) => Decimal::from_str(&n.to_string())
            .or_else(|_| Decimal::from_scientific(&n.to_string()))
            .ok()?,
        _ => return None,
    };
    (!amount.is_sign_negative()).then(|| amount.normalize())
}
