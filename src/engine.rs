//! The poll → filter → forward loop.
//!
//! One [`SyncEngine`] runs on a single task and is the only writer of the
//! [`Ledger`]. Front-ends steer it through a cloneable [`EngineHandle`] and
//! observe it through the [`EventBus`].
//!
//! ```text
//!            credentials ok                 transient / rate limited
//!   Idle ───────────────────▶ Polling ─────────────────────────────▶ Backoff
//!    ▲                          │  ▲                                   │
//!    │ re-auth / resume         │  └──────────── delay elapsed ────────┘
//!    │                          ▼
//!    └───────────────────── Paused (operator or AuthRequired)
//! ```

use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::alerts::AlertSink;
use crate::auth::{Credentials, Provider, TokenStore};
use crate::backoff::Backoff;
use crate::clock::Clock;
use crate::config::SyncConfig;
use crate::error::{LedgerError, SendError, SourceError, TokenError};
use crate::events::{EventBus, SyncEvent};
use crate::ledger::{ForwardStatus, Ledger};
use crate::psp::{Payment, PaymentSource};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PauseReason {
    Operator,
    AuthRequired(Provider),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    Polling,
    Backoff { delay: Duration },
    Paused(PauseReason),
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Run,
    Pause,
    Shutdown,
}

/// Counters for one cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub fetched: usize,
    pub forwarded: usize,
    pub already_resolved: usize,
    pub below_minimum: usize,
    pub retry_pending: usize,
    pub failed_permanent: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    Completed(CycleReport),
    /// Listing failed in a way worth retrying; wait this long first.
    Backoff(Duration),
    /// Listing was refused; nothing forwarded, try again next interval.
    Skipped,
    AuthRequired(Provider),
    /// A pause or shutdown arrived between two sends.
    Interrupted(CycleReport),
}

enum ForwardResult {
    Done(CycleReport),
    Interrupted(CycleReport),
    AuthRequired(Provider),
}

/// Remote control for a running engine.
#[derive(Clone)]
pub struct EngineHandle {
    commands: Arc<watch::Sender<Command>>,
    state: watch::Receiver<EngineState>,
    tokens: Arc<TokenStore>,
}

impl EngineHandle {
    pub fn pause(&self) {
        info!("Pause requested");
        self.commands.send_replace(Command::Pause);
    }

    pub fn resume(&self) {
        info!("Resume requested");
        self.commands.send_replace(Command::Run);
    }

    /// Stops the loop after the send in flight, if any, has been recorded.
    pub fn shutdown(&self) {
        info!("Shutdown requested");
        self.commands.send_replace(Command::Shutdown);
    }

    /// Drops the provider's credentials so the operator must authorize again.
    pub fn force_auth(&self, provider: Provider) {
        self.tokens.clear(provider);
    }

    /// Hands over credentials from a completed authorization; a paused engine picks them up.
    pub fn supply_credentials(&self, credentials: Credentials) {
        self.tokens.set_credentials(credentials);
    }

    pub fn state(&self) -> EngineState {
        self.state.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<EngineState> {
        self.state.clone()
    }
}

pub struct SyncEngine {
    config: SyncConfig,
    tokens: Arc<TokenStore>,
    source: Arc<dyn PaymentSource>,
    sink: Arc<dyn AlertSink>,
    ledger: Ledger,
    events: EventBus,
    clock: Arc<dyn Clock>,
    backoff: Backoff,
    state: watch::Sender<EngineState>,
    commands: watch::Receiver<Command>,
    handle_alive: bool,
    token_changes: watch::Receiver<u64>,
}

impl SyncEngine {
    pub fn new(
        config: SyncConfig,
        tokens: Arc<TokenStore>,
        source: Arc<dyn PaymentSource>,
        sink: Arc<dyn AlertSink>,
        ledger: Ledger,
        events: EventBus,
        clock: Arc<dyn Clock>,
    ) -> (Self, EngineHandle) {
        let (command_tx, commands) = watch::channel(Command::Run);
        let (state, state_rx) = watch::channel(EngineState::Idle);
        let handle = EngineHandle {
            commands: Arc::new(command_tx),
            state: state_rx,
            tokens: tokens.clone(),
        };
        let engine = Self {
            backoff: config.backoff(),
            token_changes: tokens.subscribe_changes(),
            config,
            tokens,
            source,
            sink,
            ledger,
            events,
            clock,
            state,
            commands,
            handle_alive: true,
        };
        (engine, handle)
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn into_ledger(self) -> Ledger {
        self.ledger
    }

    pub fn state(&self) -> EngineState {
        self.state.borrow().clone()
    }

    pub fn backoff(&self) -> &Backoff {
        &self.backoff
    }

    fn set_state(&self, next: EngineState) {
        let changed = self.state.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next.clone();
            true
        });
        if changed {
            debug!(state = ?next, "Engine state changed");
            self.events.publish(SyncEvent::StateChanged { state: next });
        }
    }

    fn command(&self) -> Command {
        *self.commands.borrow()
    }

    fn stop_requested(&self) -> bool {
        self.command() != Command::Run
    }

    /// Runs until shut down and hands back the ledger.
    pub async fn run(mut self) -> Ledger {
        info!(
            source = self.source.name(),
            sink = self.sink.name(),
            min_amount = %self.config.min_amount,
            interval_secs = self.config.poll_interval_secs,
            "Sync engine started"
        );

        loop {
            if let EngineState::Paused(reason) = self.state() {
                if !self.wait_while_paused(reason).await {
                    break;
                }
                continue;
            }
            match self.command() {
                Command::Shutdown => break,
                Command::Pause => {
                    self.set_state(EngineState::Paused(PauseReason::Operator));
                    continue;
                }
                Command::Run => {}
            }

            self.set_state(EngineState::Polling);
            let delay = match self.run_cycle().await {
                CycleOutcome::Completed(_) | CycleOutcome::Skipped => self.config.poll_interval(),
                CycleOutcome::Backoff(delay) => {
                    self.set_state(EngineState::Backoff { delay });
                    delay
                }
                CycleOutcome::AuthRequired(provider) => {
                    self.set_state(EngineState::Paused(PauseReason::AuthRequired(provider)));
                    continue;
                }
                CycleOutcome::Interrupted(_) => continue,
            };
            self.sleep_or_command(delay).await;
        }

        self.set_state(EngineState::Stopped);
        info!("Sync engine stopped");
        self.ledger
    }

    /// Sleeps for `delay`, waking early on pause or shutdown.
    async fn sleep_or_command(&mut self, delay: Duration) {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return,
                changed = self.commands.changed(), if self.handle_alive => {
                    match changed {
                        Ok(()) => {
                            if *self.commands.borrow_and_update() != Command::Run {
                                return;
                            }
                        }
                        Err(_) => self.handle_alive = false,
                    }
                }
            }
        }
    }

    /// Returns false when the engine should shut down instead of resuming.
    async fn wait_while_paused(&mut self, reason: PauseReason) -> bool {
        info!(reason = ?reason, "Engine paused");
        loop {
            let command = *self.commands.borrow_and_update();
            self.token_changes.borrow_and_update();

            match command {
                Command::Shutdown => return false,
                Command::Run => {
                    let ready = match reason {
                        PauseReason::Operator => true,
                        PauseReason::AuthRequired(_) => Provider::ALL
                            .iter()
                            .all(|provider| self.tokens.has_credentials(*provider)),
                    };
                    if ready {
                        info!("Engine resuming");
                        self.set_state(EngineState::Idle);
                        return true;
                    }
                }
                Command::Pause => {}
            }

            // Nobody can resume an operator pause once every handle is gone.
            if !self.handle_alive && reason == PauseReason::Operator {
                return false;
            }

            tokio::select! {
                changed = self.commands.changed(), if self.handle_alive => {
                    if changed.is_err() {
                        self.handle_alive = false;
                    }
                }
                _ = self.token_changes.changed() => {}
            }
        }
    }

    /// One poll → filter → forward pass.
    pub async fn run_cycle(&mut self) -> CycleOutcome {
        for provider in Provider::ALL {
            if let Err(err) = self.tokens.get_token(provider).await {
                return self.token_failure(err);
            }
        }

        let since = self.ledger.high_water_mark();
        let payments = match self.fetch(since).await {
            Ok(payments) => payments,
            Err(outcome) => return outcome,
        };

        match self.forward_all(payments).await {
            Ok(ForwardResult::Done(report)) => {
                self.backoff.reset();
                info!(
                    fetched = report.fetched,
                    forwarded = report.forwarded,
                    pending = report.retry_pending,
                    failed = report.failed_permanent,
                    "Cycle complete"
                );
                CycleOutcome::Completed(report)
            }
            Ok(ForwardResult::Interrupted(report)) => {
                info!(forwarded = report.forwarded, "Cycle interrupted");
                CycleOutcome::Interrupted(report)
            }
            Ok(ForwardResult::AuthRequired(provider)) => self.auth_required(provider),
            Err(err) => {
                error!(error = %err, "Ledger write failed, stopping cycle");
                self.back_off(format!("ledger write failed: {err}"), None)
            }
        }
    }

    async fn fetch(&mut self, since: DateTime<Utc>) -> Result<Vec<Payment>, CycleOutcome> {
        let mut result = self.source.list_recent(since).await;

        if matches!(result, Err(SourceError::Unauthorized)) {
            warn!("Payment source rejected the access token, forcing refresh");
            if let Err(err) = self.tokens.force_refresh(Provider::Source).await {
                return Err(self.token_failure(err));
            }
            result = self.source.list_recent(since).await;
        }

        match result {
            Ok(payments) => Ok(payments),
            Err(SourceError::AuthRequired) => Err(self.auth_required(Provider::Source)),
            Err(SourceError::RateLimited { retry_after }) => {
                Err(self.back_off("payment source rate limited".to_string(), retry_after))
            }
            Err(SourceError::Transient(message)) => Err(self.back_off(message, None)),
            Err(err @ (SourceError::Unauthorized | SourceError::Permanent(_))) => {
                error!(error = %err, "Payment listing failed, skipping cycle");
                self.events.publish(SyncEvent::CycleError {
                    message: err.to_string(),
                    retry_in: None,
                });
                Err(CycleOutcome::Skipped)
            }
        }
    }

    async fn forward_all(&mut self, mut payments: Vec<Payment>) -> Result<ForwardResult, LedgerError> {
        // Equal timestamps are ordered by id so reruns see a stable order.
        payments.sort_by(|a, b| {
            a.received_at
                .cmp(&b.received_at)
                .then_with(|| a.id.cmp(&b.id))
        });

        let mut report = CycleReport {
            fetched: payments.len(),
            ..CycleReport::default()
        };
        let mut seen: HashSet<&str> = HashSet::new();
        // The mark must not pass a payment that still needs another attempt.
        let mut first_pending: Option<DateTime<Utc>> = None;

        for payment in &payments {
            if self.stop_requested() {
                return Ok(ForwardResult::Interrupted(report));
            }
            if !seen.insert(payment.id.as_str()) {
                continue;
            }

            if matches!(
                self.ledger.status(&payment.id),
                Some(ForwardStatus::Sent | ForwardStatus::FailedPermanent)
            ) {
                report.already_resolved += 1;
                self.resolve(payment.received_at, first_pending)?;
                continue;
            }

            if payment.amount < self.config.min_amount {
                debug!(payment_id = %payment.id, amount = %payment.amount, "Below minimum amount, skipped");
                report.below_minimum += 1;
                self.resolve(payment.received_at, first_pending)?;
                continue;
            }

            match self.sink.send(payment).await {
                Ok(()) => {
                    self.ledger
                        .mark_sent(&payment.id, payment.amount, self.clock.now())?;
                    self.resolve(payment.received_at, first_pending)?;
                    report.forwarded += 1;
                    info!(
                        payment_id = %payment.id,
                        amount = %payment.amount,
                        sender = %payment.sender,
                        "Payment forwarded"
                    );
                    self.events.publish(SyncEvent::PaymentForwarded {
                        payment: payment.clone(),
                    });
                }
                // Nothing was sent; the payment is untouched and retried after re-auth.
                Err(SendError::AuthRequired) => {
                    return Ok(ForwardResult::AuthRequired(Provider::Sink));
                }
                Err(err) => {
                    let attempts = self.ledger.record_failure(&payment.id, self.clock.now())?;
                    if attempts > self.config.max_retry_attempts {
                        self.ledger.mark_failed(&payment.id, self.clock.now())?;
                        self.resolve(payment.received_at, first_pending)?;
                        report.failed_permanent += 1;
                        error!(payment_id = %payment.id, attempts, error = %err, "Giving up on payment");
                        self.events.publish(SyncEvent::PermanentFailure {
                            payment: payment.clone(),
                            attempts,
                            reason: err.to_string(),
                        });
                    } else {
                        report.retry_pending += 1;
                        first_pending.get_or_insert(payment.received_at);
                        warn!(payment_id = %payment.id, attempts, error = %err, "Alert failed, will retry");
                    }

                    if err == SendError::Unauthorized {
                        if let Err(TokenError::AuthRequired(provider)) =
                            self.tokens.force_refresh(Provider::Sink).await
                        {
                            return Ok(ForwardResult::AuthRequired(provider));
                        }
                    }
                }
            }
        }

        Ok(ForwardResult::Done(report))
    }

    fn resolve(&mut self, received_at: DateTime<Utc>, first_pending: Option<DateTime<Utc>>) -> Result<(), LedgerError> {
        let target = match first_pending {
            Some(pending) => received_at.min(pending),
            None => received_at,
        };
        self.ledger.advance_high_water_mark(target)?;
        Ok(())
    }

    fn token_failure(&mut self, err: TokenError) -> CycleOutcome {
        match err {
            TokenError::AuthRequired(provider) => self.auth_required(provider),
            TokenError::Transient { .. } => self.back_off(err.to_string(), None),
        }
    }

    fn auth_required(&mut self, provider: Provider) -> CycleOutcome {
        warn!(provider = %provider, "Authorization required, pausing");
        self.events.publish(SyncEvent::AuthRequired { provider });
        CycleOutcome::AuthRequired(provider)
    }

    fn back_off(&mut self, message: String, retry_after: Option<Duration>) -> CycleOutcome {
        let delay = self
            .backoff
            .next_delay()
            .max(retry_after.unwrap_or_default());
        warn!(error = %message, delay_secs = delay.as_secs(), "Cycle failed, backing off");
        self.events.publish(SyncEvent::CycleError {
            message,
            retry_in: Some(delay),
        });
        CycleOutcome::Backoff(delay)
    }
}
