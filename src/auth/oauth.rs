use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, error, info};

use super::{Credentials, Provider, TokenGrant, TokenRefresher};
use crate::config::ProviderSettings;
use crate::error::RefreshError;

/// OAuth2 client for one provider: authorization URL, code exchange, refresh grant.
pub struct OAuthClient {
    provider: Provider,
    settings: ProviderSettings,
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct OAuthErrorBody {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

impl OAuthClient {
    pub fn new(provider: Provider, settings: ProviderSettings, timeout: Duration) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            provider,
            settings,
            client,
        })
    }

    /// URL the operator opens in a browser to grant access.
    pub fn authorize_url(&self) -> String {
        let scope = self.settings.scopes.join(" ");
        let params = [
            ("client_id", self.settings.client_id.as_str()),
            ("redirect_uri", self.settings.redirect_uri.as_str()),
            ("response_type", "code"),
            ("scope", scope.as_str()),
        ];
        match reqwest::Url::parse_with_params(&self.settings.authorize_url, &params) {
            Ok(url) => url.to_string(),
            Err(_) => self.settings.authorize_url.clone(),
        }
    }

    /// Authorization-code grant.
    pub async fn exchange_code(&self, code: &str, now: chrono::DateTime<chrono::Utc>) -> Result<Credentials, RefreshError> {
        let mut params = vec![
            ("grant_type", "authorization_code"),
            ("code", code),
            ("client_id", self.settings.client_id.as_str()),
            ("redirect_uri", self.settings.redirect_uri.as_str()),
        ];
        if let Some(secret) = self.settings.client_secret.as_deref() {
            params.push(("client_secret", secret));
        }

        let grant = self.request_token(&params).await?;
        info!(provider = %self.provider, "Authorization code exchanged");
        Ok(grant.into_credentials(self.provider, None, now))
    }

    async fn request_token(&self, params: &[(&str, &str)]) -> Result<TokenGrant, RefreshError> {
        let response = self
            .client
            .post(&self.settings.token_url)
            .form(params)
            .send()
            .await
            .map_err(|e| {
                error!(provider = %self.provider, error = %e, "Failed to reach token endpoint");
                RefreshError::Transient(e.to_string())
            })?;

        let status = response.status();
        debug!(provider = %self.provider, status = %status, "Received token response");

        if status.is_success() {
            return response
                .json::<TokenGrant>()
                .await
                .map_err(|e| RefreshError::Transient(format!("malformed token response: {e}")));
        }

        let body = response.text().await.unwrap_or_default();
        Err(classify_token_failure(status, &body))
    }
}

/// 5xx and throttling are worth retrying; any other refusal means the grant is dead.
fn classify_token_failure(status: StatusCode, body: &str) -> RefreshError {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        return RefreshError::Transient(format!("HTTP {status}"));
    }
    let detail = match serde_json::from_str::<OAuthErrorBody>(body) {
        Ok(parsed) => match parsed.error_description {
            Some(description) => format!("{}: {}", parsed.error, description),
            None => parsed.error,
        },
        Err(_) => format!("HTTP {status}"),
    };
    RefreshError::InvalidGrant(detail)
}

#[async_trait]
impl TokenRefresher for OAuthClient {
    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant, RefreshError> {
        let scope = self.settings.scopes.join(" ");
        let mut params = vec![
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", self.settings.client_id.as_str()),
        ];
        if let Some(secret) = self.settings.client_secret.as_deref() {
            params.push(("client_secret", secret));
        }
        if !scope.is_empty() {
            params.push(("scope", scope.as_str()));
        }
        self.request_token(&params).await
    }
}
