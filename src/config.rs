use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::auth::{Credentials, Provider, TokenStore};
use crate::backoff::Backoff;
use crate::error::ConfigError;

/// Per-cycle knobs for the sync engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    #[serde(with = "rust_decimal::serde::str")]
    pub min_amount: Decimal,
    pub poll_interval_secs: u64,
    pub max_retry_attempts: u32,
    pub backoff_base_secs: u64,
    pub backoff_max_secs: u64,
    pub backoff_multiplier: u32,
    pub request_timeout_secs: u64,
    pub refresh_margin_secs: i64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            min_amount: Decimal::ONE,
            poll_interval_secs: 10,
            max_retry_attempts: 3,
            backoff_base_secs: 5,
            backoff_max_secs: 300,
            backoff_multiplier: 2,
            request_timeout_secs: 15,
            refresh_margin_secs: 60,
        }
    }
}

impl SyncConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_amount.is_sign_negative() {
            return Err(ConfigError::Invalid("min_amount must not be negative".into()));
        }
        if self.poll_interval_secs == 0 {
            return Err(ConfigError::Invalid("poll_interval_secs must be positive".into()));
        }
        if self.max_retry_attempts == 0 {
            return Err(ConfigError::Invalid("max_retry_attempts must be positive".into()));
        }
        if self.backoff_base_secs == 0 || self.backoff_max_secs < self.backoff_base_secs {
            return Err(ConfigError::Invalid(
                "backoff_base_secs must be positive and not exceed backoff_max_secs".into(),
            ));
        }
        if self.backoff_multiplier == 0 {
            return Err(ConfigError::Invalid("backoff_multiplier must be at least 1".into()));
        }
        if self.request_timeout_secs == 0 {
            return Err(ConfigError::Invalid("request_timeout_secs must be positive".into()));
        }
        if self.refresh_margin_secs < 0 {
            return Err(ConfigError::Invalid("refresh_margin_secs must not be negative".into()));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn refresh_margin(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.refresh_margin_secs)
    }

    pub fn backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_secs(self.backoff_base_secs),
            Duration::from_secs(self.backoff_max_secs),
            self.backoff_multiplier,
        )
    }
}

/// OAuth application settings and stored credentials for one provider.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderSettings {
    pub client_id: String,
    pub client_secret: Option<String>,
    pub redirect_uri: String,
    pub authorize_url: String,
    pub token_url: String,
    pub api_base: String,
    pub scopes: Vec<String>,
    pub credentials: Option<Credentials>,
}

impl ProviderSettings {
    fn market_defaults() -> Self {
        Self {
            client_id: "t93p9fol5e".to_string(),
            redirect_uri: "http://127.0.0.1:5228/lzt_login".to_string(),
            authorize_url: "https://lolz.live/account/authorize".to_string(),
            token_url: "https://prod-api.lolz.live/oauth/token".to_string(),
            api_base: "https://prod-api.lzt.market".to_string(),
            scopes: vec!["basic".to_string(), "payment".to_string()],
            ..Self::default()
        }
    }

    fn donation_alerts_defaults() -> Self {
        Self {
            client_id: "14617".to_string(),
            redirect_uri: "http://127.0.0.1:5228/login".to_string(),
            authorize_url: "https://www.donationalerts.com/oauth/authorize".to_string(),
            token_url: "https://www.donationalerts.com/oauth/token".to_string(),
            api_base: "https://www.donationalerts.com/api/v1".to_string(),
            scopes: vec![
                "oauth-user-show".to_string(),
                "oauth-custom_alert-store".to_string(),
            ],
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    pub banwords: Vec<String>,
    pub filter_urls: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub sync: SyncConfig,
    pub source: ProviderSettings,
    pub sink: ProviderSettings,
    pub filter: FilterConfig,
    pub state_path: Option<PathBuf>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            sync: SyncConfig::default(),
            source: ProviderSettings::market_defaults(),
            sink: ProviderSettings::donation_alerts_defaults(),
            filter: FilterConfig::default(),
            state_path: None,
        }
    }
}

impl AppConfig {
    pub fn provider(&self, provider: Provider) -> &ProviderSettings {
        match provider {
            Provider::Source => &self.source,
            Provider::Sink => &self.sink,
        }
    }

    pub fn provider_mut(&mut self, provider: Provider) -> &mut ProviderSettings {
        match provider {
            Provider::Source => &mut self.source,
            Provider::Sink => &mut self.sink,
        }
    }

    /// Ledger file; defaults to `ledger.json` beside the config file.
    pub fn ledger_path(&self, config_path: &Path) -> PathBuf {
        match &self.state_path {
            Some(path) => path.clone(),
            None => config_path
                .parent()
                .map(|dir| dir.join("ledger.json"))
                .unwrap_or_else(|| PathBuf::from("ledger.json")),
        }
    }
}

pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("donate-bridge")
        .join("config.json")
}

/// Loads the config, falling back to defaults when the file does not exist yet.
pub fn load_config(path: &Path) -> Result<AppConfig> {
    if !path.exists() {
        return Ok(AppConfig::default());
    }
    let data = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    let config: AppConfig = serde_json::from_str(&data)
        .with_context(|| format!("parsing config {}", path.display()))?;
    config.sync.validate()?;
    Ok(config)
}

/// Replaces the config file atomically; readers see the old or the new file, never a mix.
pub fn save_config(path: &Path, config: &AppConfig) -> Result<()> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&dir)?;
    let data = serde_json::to_string_pretty(config)?;
    let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
    tmp.write_all(data.as_bytes())?;
    tmp.persist(path)
        .with_context(|| format!("writing config {}", path.display()))?;
    Ok(())
}

/// Writes every credential change back to the config file as it happens, so a
/// rotated refresh token survives a crash. Runs until aborted.
pub fn spawn_credential_writer(
    path: PathBuf,
    mut config: AppConfig,
    tokens: Arc<TokenStore>,
) -> JoinHandle<()> {
    let mut changes = tokens.subscribe_changes();
    tokio::spawn(async move {
        while changes.changed().await.is_ok() {
            changes.borrow_and_update();
            for provider in Provider::ALL {
                config.provider_mut(provider).credentials = tokens.credentials(provider);
            }
            match save_config(&path, &config) {
                Ok(()) => debug!(path = %path.display(), "Credentials saved"),
                Err(e) => error!(path = %path.display(), error = %e, "Failed to save credentials"),
            }
        }
    })
}
