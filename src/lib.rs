//! Forwards payments received on a payment provider as on-stream alerts,
//! exactly once each, surviving restarts and token expiry.

pub mod alerts;
pub mod auth;
pub mod backoff;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod filter;
pub mod ledger;
pub mod psp;

pub use alerts::{Alert, AlertSink};
pub use auth::{Credentials, Provider, TokenStore};
pub use config::{AppConfig, SyncConfig};
pub use engine::{CycleOutcome, CycleReport, EngineHandle, EngineState, PauseReason, SyncEngine};
pub use events::{EventBus, SyncEvent};
pub use ledger::{ForwardRecord, ForwardStatus, Ledger};
pub use psp::{Payment, PaymentSource};
