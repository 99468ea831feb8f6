//! Authorization-code callback for the accounting integration. A single
//! linear pass: every step has its own tagged failure exit, nothing is
//! retried, and underlying errors are logged rather than leaked into the
//! redirect.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::Utc;
use serde::Deserialize;
use shared::domain::BusinessId;
use storage::StoredConnection;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::ApiContext;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
}

/// One variant per failure exit; `tag()` is the machine-readable value
/// carried back to the results page.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CallbackError {
    #[error("provider denied the authorization request")]
    Denied,
    #[error("callback is missing code or state")]
    MissingParams,
    #[error("state parameter could not be decoded")]
    InvalidState,
    #[error("authorization code exchange failed")]
    TokenExchange,
    #[error("authorized tenant lookup failed")]
    Connections,
    #[error("no authorized organizations were returned")]
    NoOrganizations,
    #[error("storing the connection failed")]
    Database,
    #[error("unexpected callback failure")]
    Unknown,
}

impl CallbackError {
    pub fn tag(&self) -> &'static str {
        match self {
            CallbackError::Denied => "xero_denied",
            CallbackError::MissingParams => "missing_params",
            CallbackError::InvalidState => "invalid_state",
            CallbackError::TokenExchange => "token_exchange_failed",
            CallbackError::Connections => "connections_failed",
            CallbackError::NoOrganizations => "no_organizations",
            CallbackError::Database => "database_error",
            CallbackError::Unknown => "unknown_error",
        }
    }
}

#[derive(Debug, Deserialize)]
struct StatePayload {
    #[serde(rename = "businessId")]
    business_id: i64,
}

fn decode_state(state: &str) -> anyhow::Result<BusinessId> {
    let raw = STANDARD.decode(state.as_bytes())?;
    let payload: StatePayload = serde_json::from_slice(&raw)?;
    Ok(BusinessId(payload.business_id))
}

/// Completes the OAuth flow: code exchange, tenant lookup, first tenant
/// selected deterministically, credential stored via transactional upsert.
/// At-most-once; a failed step ends the flow at its own exit.
pub async fn handle_xero_callback(
    ctx: &ApiContext,
    params: &CallbackParams,
) -> Result<BusinessId, CallbackError> {
    if let Some(provider_error) = params.error.as_deref() {
        warn!(provider_error, "provider reported authorization denial");
        return Err(CallbackError::Denied);
    }

    let (Some(code), Some(state)) = (params.code.as_deref(), params.state.as_deref()) else {
        return Err(CallbackError::MissingParams);
    };

    let business_id = decode_state(state).map_err(|err| {
        warn!(%err, "rejecting undecodable callback state");
        CallbackError::InvalidState
    })?;

    let tokens = ctx.xero.exchange_code(code).await.map_err(|err| {
        error!(%err, business_id = business_id.0, "token exchange failed");
        CallbackError::TokenExchange
    })?;

    let expires_at = xero::absolute_expiry(Utc::now(), tokens.expires_in).ok_or_else(|| {
        error!(
            expires_in = tokens.expires_in,
            business_id = business_id.0,
            "provider returned a nonsensical token lifetime"
        );
        CallbackError::Unknown
    })?;

    let tenants = ctx.xero.connections(&tokens.access_token).await.map_err(|err| {
        error!(%err, business_id = business_id.0, "tenant lookup failed");
        CallbackError::Connections
    })?;

    let Some(tenant) = tenants.into_iter().next() else {
        warn!(business_id = business_id.0, "authorization granted zero tenants");
        return Err(CallbackError::NoOrganizations);
    };

    let tenant_name = tenant.tenant_name.unwrap_or_else(|| tenant.tenant_id.clone());
    ctx.storage
        .upsert_connection(&StoredConnection {
            business_id,
            tenant_id: tenant.tenant_id,
            tenant_name,
            access_token: tokens.access_token,
            refresh_token: tokens.refresh_token,
            expires_at,
            status: "active".into(),
        })
        .await
        .map_err(|err| {
            error!(%err, business_id = business_id.0, "failed to store connection");
            CallbackError::Database
        })?;

    info!(business_id = business_id.0, "accounting connection stored");
    Ok(business_id)
}

#[cfg(test)]
#[path = "tests/callback_tests.rs"]
mod tests;
