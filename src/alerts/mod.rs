pub mod donation_alerts;
pub mod log;

use async_trait::async_trait;

use crate::error::SendError;
use crate::filter::TextFilter;
use crate::psp::Payment;

/// Text shown on stream for a forwarded payment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alert {
    pub header: String,
    pub message: Option<String>,
}

impl Alert {
    pub fn render(payment: &Payment, filter: &TextFilter) -> Self {
        let sender = filter.apply(&payment.sender);
        let message = filter.apply(payment.message.trim());
        Self {
            header: format!("{} — {} {}", sender, payment.amount.normalize(), payment.currency),
            message: (!message.is_empty()).then_some(message),
        }
    }
}

#[async_trait]
pub trait AlertSink: Send + Sync {
    fn name(&self) -> &str;

    /// Ok only after the provider confirmed the alert was created.
    async fn send(&self, payment: &Payment) -> Result<(), SendError>;
}
