use super::{Payment, PaymentSource};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use rust_decimal::Decimal;
use std::sync::Mutex;

use crate::error::SourceError;

const SENDERS: &[&str] = &["alice", "bob", "carol", "dave"];
const MESSAGES: &[&str] = &["", "great stream!", "hello from chat", "check www.example.com"];

/// Demo source: every poll may produce one new random payment.
/// Produced payments are replayed on later polls, like a real history endpoint.
pub struct MockSource {
    history: Mutex<Vec<Payment>>,
}

impl MockSource {
    pub fn new() -> Self {
        Self {
            history: Mutex::new(Vec::new()),
        }
    }
}

impl Default for MockSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PaymentSource for MockSource {
    fn name(&self) -> &str {
        "Mock"
    }

    async fn list_recent(&self, since: DateTime<Utc>) -> Result<Vec<Payment>, SourceError> {
        let mut history = self
            .history
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let mut rng = rand::thread_rng();
        if rng.gen_bool(0.5) {
            let now = Utc::now();
            let amount_units: i64 = rng.gen_range(2..=150);
            history.push(Payment {
                id: format!("mock_{}", now.timestamp_nanos_opt().unwrap_or(0)),
                amount: Decimal::new(amount_units, 0),
                currency: "RUB".to_string(),
                sender: SENDERS[rng.gen_range(0..SENDERS.len())].to_string(),
                message: MESSAGES[rng.gen_range(0..MESSAGES.len())].to_string(),
                received_at: now,
            });
        }

        Ok(history
            .iter()
            .filter(|p| p.received_at >= since)
            .cloned()
            .collect())
    }
}
