use async_trait::async_trait;
use tracing::info;

use super::{Alert, AlertSink};
use crate::error::SendError;
use crate::filter::TextFilter;
use crate::psp::Payment;

/// Demo sink that writes alerts to the log instead of a provider.
pub struct LogSink {
    filter: TextFilter,
}

impl LogSink {
    pub fn new(filter: TextFilter) -> Self {
        Self { filter }
    }
}

#[async_trait]
impl AlertSink for LogSink {
    fn name(&self) -> &str {
        "Log"
    }

    async fn send(&self, payment: &Payment) -> Result<(), SendError> {
        let alert = Alert::render(payment, &self.filter);
        info!(
            payment_id = %payment.id,
            header = %alert.header,
            message = alert.message.as_deref().unwrap_or(""),
            "Alert"
        );
        Ok(())
    }
}
