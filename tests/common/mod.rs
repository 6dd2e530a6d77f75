#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;

use donate_bridge::auth::{TokenGrant, TokenRefresher};
use donate_bridge::clock::Clock;
use donate_bridge::error::{RefreshError, SendError, SourceError};
use donate_bridge::{
    AlertSink, Credentials, EngineHandle, EventBus, Ledger, Payment, PaymentSource, Provider,
    SyncConfig, SyncEngine, SyncEvent, TokenStore,
};

pub fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).unwrap()
}

pub fn payment(id: &str, amount: Decimal, ts: i64) -> Payment {
    Payment {
        id: id.to_string(),
        amount,
        currency: "RUB".to_string(),
        sender: format!("sender-{id}"),
        message: String::new(),
        received_at: at(ts),
    }
}

pub fn credentials(provider: Provider, expires_at: Option<DateTime<Utc>>) -> Credentials {
    Credentials {
        provider,
        access_token: format!("{provider}-access"),
        refresh_token: Some(format!("{provider}-refresh")),
        expires_at,
    }
}

pub fn sync_config(min_amount: Decimal, max_retry_attempts: u32) -> SyncConfig {
    SyncConfig {
        min_amount,
        max_retry_attempts,
        poll_interval_secs: 10,
        backoff_base_secs: 5,
        backoff_max_secs: 40,
        backoff_multiplier: 2,
        ..SyncConfig::default()
    }
}

pub struct FakeClock {
    now: Mutex<DateTime<Utc>>,
}

impl FakeClock {
    pub fn new(now: DateTime<Utc>) -> Arc<Self> {
        Arc::new(Self {
            now: Mutex::new(now),
        })
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().unwrap() = now;
    }

    pub fn advance(&self, by: chrono::Duration) {
        *self.now.lock().unwrap() += by;
    }
}

impl Clock for FakeClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

/// Serves a fixed payment history, honouring `since`, with optional queued failures.
#[derive(Default)]
pub struct ScriptedSource {
    payments: Mutex<Vec<Payment>>,
    failures: Mutex<VecDeque<SourceError>>,
    sinces: Mutex<Vec<DateTime<Utc>>>,
    calls: AtomicUsize,
}

impl ScriptedSource {
    pub fn new(payments: Vec<Payment>) -> Arc<Self> {
        Arc::new(Self {
            payments: Mutex::new(payments),
            ..Self::default()
        })
    }

    pub fn push_payment(&self, payment: Payment) {
        self.payments.lock().unwrap().push(payment);
    }

    pub fn fail_next(&self, err: SourceError) {
        self.failures.lock().unwrap().push_back(err);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn sinces(&self) -> Vec<DateTime<Utc>> {
        self.sinces.lock().unwrap().clone()
    }
}

#[async_trait]
impl PaymentSource for ScriptedSource {
    fn name(&self) -> &str {
        "Scripted"
    }

    async fn list_recent(&self, since: DateTime<Utc>) -> Result<Vec<Payment>, SourceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.sinces.lock().unwrap().push(since);
        if let Some(err) = self.failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        // Newest first, like most history endpoints.
        Ok(self
            .payments
            .lock()
            .unwrap()
            .iter()
            .rev()
            .filter(|p| p.received_at >= since)
            .cloned()
            .collect())
    }
}

/// Records every attempt; fails per payment according to a script.
#[derive(Default)]
pub struct ScriptedSink {
    scripted: Mutex<HashMap<String, VecDeque<SendError>>>,
    always_fail: Mutex<HashSet<String>>,
    attempts: Mutex<Vec<String>>,
    delivered: Mutex<Vec<String>>,
}

impl ScriptedSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_times(&self, payment_id: &str, times: usize, err: SendError) {
        let mut scripted = self.scripted.lock().unwrap();
        let queue = scripted.entry(payment_id.to_string()).or_default();
        for _ in 0..times {
            queue.push_back(err.clone());
        }
    }

    pub fn fail_always(&self, payment_id: &str) {
        self.always_fail.lock().unwrap().insert(payment_id.to_string());
    }

    pub fn attempts(&self) -> Vec<String> {
        self.attempts.lock().unwrap().clone()
    }

    pub fn attempts_for(&self, payment_id: &str) -> usize {
        self.attempts().iter().filter(|id| *id == payment_id).count()
    }

    pub fn delivered(&self) -> Vec<String> {
        self.delivered.lock().unwrap().clone()
    }
}

#[async_trait]
impl AlertSink for ScriptedSink {
    fn name(&self) -> &str {
        "Scripted"
    }

    async fn send(&self, payment: &Payment) -> Result<(), SendError> {
        self.attempts.lock().unwrap().push(payment.id.clone());
        if self.always_fail.lock().unwrap().contains(&payment.id) {
            return Err(SendError::Transient("HTTP 503".into()));
        }
        let scripted = self
            .scripted
            .lock()
            .unwrap()
            .get_mut(&payment.id)
            .and_then(|queue| queue.pop_front());
        if let Some(err) = scripted {
            return Err(err);
        }
        self.delivered.lock().unwrap().push(payment.id.clone());
        Ok(())
    }
}

/// Token endpoint double: queued results, then fresh one-hour tokens.
#[derive(Default)]
pub struct ScriptedRefresher {
    results: Mutex<VecDeque<Result<TokenGrant, RefreshError>>>,
    delay: Option<Duration>,
    calls: AtomicUsize,
}

impl ScriptedRefresher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay: Some(delay),
            ..Self::default()
        })
    }

    pub fn push(&self, result: Result<TokenGrant, RefreshError>) {
        self.results.lock().unwrap().push_back(result);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TokenRefresher for ScriptedRefresher {
    async fn refresh(&self, _refresh_token: &str) -> Result<TokenGrant, RefreshError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let scripted = self.results.lock().unwrap().pop_front();
        scripted.unwrap_or_else(|| {
            Ok(TokenGrant {
                access_token: format!("refreshed-{call}"),
                refresh_token: None,
                expires_in: Some(3600),
            })
        })
    }
}

pub struct Harness {
    pub engine: SyncEngine,
    pub handle: EngineHandle,
    pub source: Arc<ScriptedSource>,
    pub sink: Arc<ScriptedSink>,
    pub refresher: Arc<ScriptedRefresher>,
    pub tokens: Arc<TokenStore>,
    pub clock: Arc<FakeClock>,
    pub events: broadcast::Receiver<SyncEvent>,
}

impl Harness {
    /// Engine over an in-memory ledger starting at t=0, with valid tokens for both providers.
    pub fn new(config: SyncConfig, source: Arc<ScriptedSource>) -> Self {
        Self::with_ledger(config, source, ScriptedSink::new(), Ledger::in_memory(at(0)))
    }

    pub fn with_ledger(
        config: SyncConfig,
        source: Arc<ScriptedSource>,
        sink: Arc<ScriptedSink>,
        ledger: Ledger,
    ) -> Self {
        let clock = FakeClock::new(at(1_000));
        let refresher = ScriptedRefresher::new();
        let valid_until = Some(at(1_000) + chrono::Duration::hours(1));
        let tokens = Arc::new(
            TokenStore::new(clock.clone(), chrono::Duration::seconds(60))
                .with_refresher(Provider::Source, refresher.clone())
                .with_refresher(Provider::Sink, refresher.clone())
                .with_credentials(Some(credentials(Provider::Source, valid_until)))
                .with_credentials(Some(credentials(Provider::Sink, valid_until))),
        );
        let bus = EventBus::new(64);
        let events = bus.subscribe_channel();
        let (engine, handle) = SyncEngine::new(
            config,
            tokens.clone(),
            source.clone(),
            sink.clone(),
            ledger,
            bus,
            clock.clone(),
        );
        Self {
            engine,
            handle,
            source,
            sink,
            refresher,
            tokens,
            clock,
            events,
        }
    }

    pub fn drain_events(&mut self) -> Vec<SyncEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }
}

pub fn forwarded_ids(events: &[SyncEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|e| match e {
            SyncEvent::PaymentForwarded { payment } => Some(payment.id.clone()),
            _ => None,
        })
        .collect()
}

pub fn permanent_failures(events: &[SyncEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|e| match e {
            SyncEvent::PermanentFailure { payment, .. } => Some(payment.id.clone()),
            _ => None,
        })
        .collect()
}
