use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;

pub const DEFAULT_TOKEN_URL: &str = "https://identity.xero.com/connect/token";
pub const DEFAULT_CONNECTIONS_URL: &str = "https://api.xero.com/connections";

#[derive(Debug, Clone)]
pub struct XeroConfig {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
    pub token_url: String,
    pub connections_url: String,
}

/// Access/refresh token pair returned by the token endpoint. `expires_in`
/// is relative seconds; callers convert it with [`absolute_expiry`].
#[derive(Debug, Clone, Deserialize)]
pub struct TokenSet {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_in: i64,
}

/// One authorized organization, as listed by the connections endpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tenant {
    pub tenant_id: String,
    #[serde(default)]
    pub tenant_name: Option<String>,
}

/// Provider seam: the HTTP client implements this for production and tests
/// substitute a fake, so callback handling stays testable offline.
#[async_trait]
pub trait XeroApi: Send + Sync {
    /// Exchanges an authorization code for a token pair. Authenticates with
    /// HTTP Basic auth using the configured client id/secret.
    async fn exchange_code(&self, code: &str) -> Result<TokenSet>;

    /// Lists the organizations the granted token is authorized for.
    async fn connections(&self, access_token: &str) -> Result<Vec<Tenant>>;
}

pub struct XeroClient {
    http: reqwest::Client,
    config: XeroConfig,
}

impl XeroClient {
    pub fn new(config: XeroConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
        }
    }
}

#[async_trait]
impl XeroApi for XeroClient {
    async fn exchange_code(&self, code: &str) -> Result<TokenSet> {
        let response = self
            .http
            .post(&self.config.token_url)
            .basic_auth(&self.config.client_id, Some(&self.config.client_secret))
            .form(&[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", self.config.redirect_uri.as_str()),
            ])
            .send()
            .await
            .context("token endpoint unreachable")?;

        let status = response.status();
        if !status.is_success() {
            bail!("token endpoint returned {status}");
        }

        response
            .json::<TokenSet>()
            .await
            .context("malformed token response")
    }

    async fn connections(&self, access_token: &str) -> Result<Vec<Tenant>> {
        let response = self
            .http
            .get(&self.config.connections_url)
            .bearer_auth(access_token)
            .send()
            .await
            .context("connections endpoint unreachable")?;

        let status = response.status();
        if !status.is_success() {
            bail!("connections endpoint returned {status}");
        }

        response
            .json::<Vec<Tenant>>()
            .await
            .context("malformed connections response")
    }
}

/// Converts the provider's relative expiry into an absolute timestamp.
/// `None` for non-positive or out-of-range values.
pub fn absolute_expiry(now: DateTime<Utc>, expires_in_seconds: i64) -> Option<DateTime<Utc>> {
    if expires_in_seconds <= 0 {
        return None;
    }
    now.checked_add_signed(Duration::seconds(expires_in_seconds))
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
