//! Access tokens for the two providers the bridge talks to.
//!
//! [`TokenStore`] hands out credentials that are valid for at least the
//! configured safety margin, refreshing them through the provider's
//! [`TokenRefresher`] when they are about to expire. Refreshes are serialized
//! per provider: callers that arrive while a refresh is running wait for it and
//! reuse its result instead of starting their own.

pub mod oauth;

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::error::{ConfigError, RefreshError, TokenError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    /// Where payments are read from.
    Source,
    /// Where alerts are posted to.
    Sink,
}

impl Provider {
    pub const ALL: [Provider; 2] = [Provider::Source, Provider::Sink];

    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Source => "source",
            Provider::Sink => "sink",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "source" => Ok(Provider::Source),
            "sink" => Ok(Provider::Sink),
            other => Err(ConfigError::Invalid(format!(
                "unknown provider '{other}', expected 'source' or 'sink'"
            ))),
        }
    }
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub provider: Provider,
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// `None` means the provider issued a non-expiring token.
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl Credentials {
    pub fn needs_refresh(&self, now: DateTime<Utc>, margin: chrono::Duration) -> bool {
        match self.expires_at {
            Some(expires_at) => now >= expires_at - margin,
            None => false,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| now >= expires_at)
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("provider", &self.provider)
            .field("access_token", &"<redacted>")
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Tokens returned by a successful grant.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenGrant {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<i64>,
}

impl TokenGrant {
    /// Providers may omit the refresh token on refresh; the previous one then stays valid.
    /// An `expires_in` too large to represent is treated as no expiry.
    pub fn into_credentials(
        self,
        provider: Provider,
        previous_refresh_token: Option<String>,
        now: DateTime<Utc>,
    ) -> Credentials {
        let expires_at = self.expires_in.and_then(|secs| {
            let expires_at = chrono::Duration::try_seconds(secs)
                .and_then(|lifetime| now.checked_add_signed(lifetime));
            if expires_at.is_none() {
                warn!(provider = %provider, expires_in = secs, "Token lifetime out of range, ignoring expiry");
            }
            expires_at
        });
        Credentials {
            provider,
            access_token: self.access_token,
            refresh_token: self.refresh_token.or(previous_refresh_token),
            expires_at,
        }
    }
}

#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant, RefreshError>;
}

struct Slot {
    credentials: RwLock<Option<Credentials>>,
    // Bumped on every swap of this provider's credentials.
    generation: AtomicU64,
    refresh_gate: Mutex<()>,
    refresher: Option<Arc<dyn TokenRefresher>>,
}

impl Slot {
    fn new() -> Self {
        Self {
            credentials: RwLock::new(None),
            generation: AtomicU64::new(0),
            refresh_gate: Mutex::new(()),
            refresher: None,
        }
    }

    fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }
}

pub struct TokenStore {
    clock: Arc<dyn Clock>,
    margin: chrono::Duration,
    source: Slot,
    sink: Slot,
    // Bumped on any provider's credential swap; wakes observers such as a paused engine.
    changes: watch::Sender<u64>,
}

impl TokenStore {
    pub fn new(clock: Arc<dyn Clock>, margin: chrono::Duration) -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            clock,
            margin,
            source: Slot::new(),
            sink: Slot::new(),
            changes,
        }
    }

    pub fn with_refresher(mut self, provider: Provider, refresher: Arc<dyn TokenRefresher>) -> Self {
        match provider {
            Provider::Source => self.source.refresher = Some(refresher),
            Provider::Sink => self.sink.refresher = Some(refresher),
        }
        self
    }

    pub fn with_credentials(self, credentials: Option<Credentials>) -> Self {
        if let Some(credentials) = credentials {
            self.swap(credentials.provider, Some(credentials));
        }
        self
    }

    fn slot(&self, provider: Provider) -> &Slot {
        match provider {
            Provider::Source => &self.source,
            Provider::Sink => &self.sink,
        }
    }

    /// Snapshot of the stored credentials, without any refresh.
    pub fn credentials(&self, provider: Provider) -> Option<Credentials> {
        self.slot(provider)
            .credentials
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn has_credentials(&self, provider: Provider) -> bool {
        self.credentials(provider).is_some()
    }

    /// Installs credentials obtained outside the store (e.g. a fresh login).
    pub fn set_credentials(&self, credentials: Credentials) {
        info!(provider = %credentials.provider, "Credentials supplied");
        self.swap(credentials.provider, Some(credentials));
    }

    /// Discards stored credentials, e.g. on logout.
    pub fn clear(&self, provider: Provider) {
        info!(provider = %provider, "Credentials discarded");
        self.swap(provider, None);
    }

    /// Receives a notification each time credentials are stored, refreshed or discarded.
    pub fn subscribe_changes(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    fn swap(&self, provider: Provider, credentials: Option<Credentials>) {
        let slot = self.slot(provider);
        {
            let mut guard = slot
                .credentials
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            *guard = credentials;
            slot.generation.fetch_add(1, Ordering::AcqRel);
        }
        self.changes.send_modify(|generation| *generation += 1);
    }

    /// Returns credentials valid for at least the safety margin, refreshing if needed.
    pub async fn get_token(&self, provider: Provider) -> Result<Credentials, TokenError> {
        let now = self.clock.now();
        match self.credentials(provider) {
            None => return Err(TokenError::AuthRequired(provider)),
            Some(credentials) if !credentials.needs_refresh(now, self.margin) => {
                return Ok(credentials)
            }
            Some(_) => {}
        }

        let _gate = self.slot(provider).refresh_gate.lock().await;

        // A refresh may have completed while we waited on the gate.
        match self.credentials(provider) {
            None => Err(TokenError::AuthRequired(provider)),
            Some(credentials) if !credentials.needs_refresh(self.clock.now(), self.margin) => {
                debug!(provider = %provider, "Reusing credentials refreshed by another caller");
                Ok(credentials)
            }
            Some(credentials) => self.refresh_locked(provider, credentials).await,
        }
    }

    /// Convenience for clients that only need the bearer token.
    pub async fn access_token(&self, provider: Provider) -> Result<String, TokenError> {
        self.get_token(provider).await.map(|c| c.access_token)
    }

    /// Refreshes regardless of expiry, after the provider rejected the current token.
    pub async fn force_refresh(&self, provider: Provider) -> Result<Credentials, TokenError> {
        let slot = self.slot(provider);
        let seen = slot.generation();
        let _gate = slot.refresh_gate.lock().await;

        let credentials = self
            .credentials(provider)
            .ok_or(TokenError::AuthRequired(provider))?;
        if slot.generation() != seen {
            debug!(provider = %provider, "Credentials changed while waiting, skipping forced refresh");
            return Ok(credentials);
        }
        self.refresh_locked(provider, credentials).await
    }

    // Caller holds the provider's refresh gate.
    async fn refresh_locked(
        &self,
        provider: Provider,
        current: Credentials,
    ) -> Result<Credentials, TokenError> {
        let slot = self.slot(provider);
        let (Some(refresh_token), Some(refresher)) =
            (current.refresh_token.clone(), slot.refresher.clone())
        else {
            warn!(provider = %provider, "Access token expired and cannot be refreshed");
            self.swap(provider, None);
            return Err(TokenError::AuthRequired(provider));
        };

        debug!(provider = %provider, "Refreshing access token");
        match refresher.refresh(&refresh_token).await {
            Ok(grant) => {
                let credentials = grant.into_credentials(provider, Some(refresh_token), self.clock.now());
                self.swap(provider, Some(credentials.clone()));
                info!(provider = %provider, expires_at = ?credentials.expires_at, "Access token refreshed");
                Ok(credentials)
            }
            Err(RefreshError::InvalidGrant(message)) => {
                warn!(provider = %provider, error = %message, "Refresh token rejected, credentials discarded");
                self.swap(provider, None);
                Err(TokenError::AuthRequired(provider))
            }
            Err(RefreshError::Transient(message)) => {
                // The old token is still usable until it actually expires.
                if !current.is_expired(self.clock.now()) {
                    warn!(provider = %provider, error = %message, "Token refresh failed, using current token");
                    return Ok(current);
                }
                warn!(provider = %provider, error = %message, "Token refresh failed");
                Err(TokenError::Transient { provider, message })
            }
        }
    }
}
