use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::auth::Provider;
use crate::engine::EngineState;
use crate::psp::Payment;

#[derive(Debug, Clone)]
pub enum SyncEvent {
    PaymentForwarded {
        payment: Payment,
    },
    AuthRequired {
        provider: Provider,
    },
    CycleError {
        message: String,
        /// Set when the engine backs off before the next attempt.
        retry_in: Option<Duration>,
    },
    PermanentFailure {
        payment: Payment,
        attempts: u32,
        reason: String,
    },
    StateChanged {
        state: EngineState,
    },
}

/// Fan-out of engine events to observers.
///
/// Backed by a bounded broadcast channel: publishing never waits, and an
/// observer that falls behind loses the oldest events instead of stalling the
/// engine. The engine works the same with zero subscribers.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<SyncEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn publish(&self, event: SyncEvent) {
        if self.sender.send(event).is_err() {
            debug!("Event dropped, no subscribers");
        }
    }

    pub fn subscribe_channel(&self) -> broadcast::Receiver<SyncEvent> {
        self.sender.subscribe()
    }

    /// Runs `handler` for every event on its own task. A handler that panics
    /// only ends its own task.
    pub fn subscribe<F>(&self, mut handler: F) -> JoinHandle<()>
    where
        F: FnMut(SyncEvent) + Send + 'static,
    {
        let mut receiver = self.sender.subscribe();
        tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(event) => handler(event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Event subscriber lagging, events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
