use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::Utc;
use shared::domain::BusinessId;
use storage::Storage;
use xero::{Tenant, TokenSet, XeroApi};

use super::*;

#[derive(Default)]
struct FakeXero {
    fail_exchange: bool,
    fail_connections: bool,
    expires_in: i64,
    tenants: Vec<Tenant>,
    exchange_calls: AtomicUsize,
    connections_calls: AtomicUsize,
}

#[async_trait]
impl XeroApi for FakeXero {
    async fn exchange_code(&self, _code: &str) -> anyhow::Result<TokenSet> {
        self.exchange_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_exchange {
            anyhow::bail!("token endpoint returned 400 Bad Request");
        }
        Ok(TokenSet {
            access_token: "access-token".into(),
            refresh_token: "refresh-token".into(),
            expires_in: self.expires_in,
        })
    }

    async fn connections(&self, _access_token: &str) -> anyhow::Result<Vec<Tenant>> {
        self.connections_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_connections {
            anyhow::bail!("connections endpoint returned 401 Unauthorized");
        }
        Ok(self.tenants.clone())
    }
}

fn granted_tenant() -> Tenant {
    Tenant {
        tenant_id: "tenant-1".into(),
        tenant_name: Some("Acme Ltd".into()),
    }
}

async fn setup(fake: FakeXero) -> (ApiContext, Arc<FakeXero>) {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let fake = Arc::new(fake);
    (
        ApiContext {
            storage,
            xero: fake.clone(),
        },
        fake,
    )
}

fn encoded_state(business_id: i64) -> String {
    STANDARD.encode(format!("{{\"businessId\":{business_id}}}"))
}

fn accepted_params(business_id: i64) -> CallbackParams {
    CallbackParams {
        code: Some("auth-code".into()),
        state: Some(encoded_state(business_id)),
        error: None,
    }
}

#[tokio::test]
async fn provider_denial_short_circuits_without_provider_calls() {
    let (ctx, fake) = setup(FakeXero {
        expires_in: 1800,
        tenants: vec![granted_tenant()],
        ..FakeXero::default()
    })
    .await;

    let params = CallbackParams {
        code: Some("auth-code".into()),
        state: Some(encoded_state(7)),
        error: Some("access_denied".into()),
    };
    let err = handle_xero_callback(&ctx, &params)
        .await
        .expect_err("denied");

    assert_eq!(err, CallbackError::Denied);
    assert_eq!(err.tag(), "xero_denied");
    assert_eq!(fake.exchange_calls.load(Ordering::SeqCst), 0);
    assert_eq!(fake.connections_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn missing_code_or_state_is_rejected() {
    let (ctx, _) = setup(FakeXero::default()).await;

    let no_code = CallbackParams {
        state: Some(encoded_state(7)),
        ..CallbackParams::default()
    };
    assert_eq!(
        handle_xero_callback(&ctx, &no_code).await.expect_err("err"),
        CallbackError::MissingParams
    );

    let no_state = CallbackParams {
        code: Some("auth-code".into()),
        ..CallbackParams::default()
    };
    assert_eq!(
        handle_xero_callback(&ctx, &no_state).await.expect_err("err"),
        CallbackError::MissingParams
    );
}

#[tokio::test]
async fn undecodable_state_is_rejected() {
    let (ctx, fake) = setup(FakeXero::default()).await;

    let garbage = CallbackParams {
        code: Some("auth-code".into()),
        state: Some("!!!not-base64!!!".into()),
        error: None,
    };
    assert_eq!(
        handle_xero_callback(&ctx, &garbage).await.expect_err("err"),
        CallbackError::InvalidState
    );

    let not_json = CallbackParams {
        code: Some("auth-code".into()),
        state: Some(STANDARD.encode("plain text")),
        error: None,
    };
    assert_eq!(
        handle_xero_callback(&ctx, &not_json).await.expect_err("err"),
        CallbackError::InvalidState
    );
    assert_eq!(fake.exchange_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn token_exchange_failure_stops_before_tenant_lookup() {
    let (ctx, fake) = setup(FakeXero {
        fail_exchange: true,
        expires_in: 1800,
        tenants: vec![granted_tenant()],
        ..FakeXero::default()
    })
    .await;

    let err = handle_xero_callback(&ctx, &accepted_params(7))
        .await
        .expect_err("exchange fails");

    assert_eq!(err, CallbackError::TokenExchange);
    assert_eq!(err.tag(), "token_exchange_failed");
    assert_eq!(fake.connections_calls.load(Ordering::SeqCst), 0);
    let stored = ctx
        .storage
        .connection_for_business(BusinessId(7))
        .await
        .expect("lookup");
    assert!(stored.is_none(), "nothing may be persisted");
}

#[tokio::test]
async fn tenant_lookup_failure_is_tagged_and_not_persisted() {
    let (ctx, _) = setup(FakeXero {
        fail_connections: true,
        expires_in: 1800,
        ..FakeXero::default()
    })
    .await;

    let err = handle_xero_callback(&ctx, &accepted_params(7))
        .await
        .expect_err("lookup fails");
    assert_eq!(err, CallbackError::Connections);
    assert!(ctx
        .storage
        .connection_for_business(BusinessId(7))
        .await
        .expect("lookup")
        .is_none());
}

#[tokio::test]
async fn zero_tenants_is_its_own_exit() {
    let (ctx, _) = setup(FakeXero {
        expires_in: 1800,
        tenants: vec![],
        ..FakeXero::default()
    })
    .await;

    let err = handle_xero_callback(&ctx, &accepted_params(7))
        .await
        .expect_err("no tenants");
    assert_eq!(err, CallbackError::NoOrganizations);
    assert_eq!(err.tag(), "no_organizations");
}

#[tokio::test]
async fn nonsensical_token_lifetime_maps_to_unknown() {
    let (ctx, _) = setup(FakeXero {
        expires_in: 0,
        tenants: vec![granted_tenant()],
        ..FakeXero::default()
    })
    .await;

    let err = handle_xero_callback(&ctx, &accepted_params(7))
        .await
        .expect_err("bad expiry");
    assert_eq!(err, CallbackError::Unknown);
    assert_eq!(err.tag(), "unknown_error");
}

#[tokio::test]
async fn success_stores_first_tenant_with_absolute_expiry() {
    let (ctx, _) = setup(FakeXero {
        expires_in: 1800,
        tenants: vec![
            granted_tenant(),
            Tenant {
                tenant_id: "tenant-2".into(),
                tenant_name: Some("Second Org".into()),
            },
        ],
        ..FakeXero::default()
    })
    .await;

    let before = Utc::now();
    let business_id = handle_xero_callback(&ctx, &accepted_params(7))
        .await
        .expect("success");
    assert_eq!(business_id, BusinessId(7));

    let stored = ctx
        .storage
        .connection_for_business(BusinessId(7))
        .await
        .expect("lookup")
        .expect("row");
    assert_eq!(stored.tenant_id, "tenant-1", "first tenant wins");
    assert_eq!(stored.tenant_name, "Acme Ltd");
    assert_eq!(stored.access_token, "access-token");
    assert_eq!(stored.refresh_token, "refresh-token");
    assert_eq!(stored.status, "active");
    assert!(stored.expires_at >= before + chrono::Duration::seconds(1799));
}

#[tokio::test]
async fn reconnecting_replaces_the_stored_credential() {
    let (ctx, _) = setup(FakeXero {
        expires_in: 1800,
        tenants: vec![granted_tenant()],
        ..FakeXero::default()
    })
    .await;
    handle_xero_callback(&ctx, &accepted_params(7))
        .await
        .expect("first connect");

    let (reconnect_ctx, _) = setup(FakeXero {
        expires_in: 900,
        tenants: vec![Tenant {
            tenant_id: "tenant-9".into(),
            tenant_name: None,
        }],
        ..FakeXero::default()
    })
    .await;
    let ctx = ApiContext {
        storage: ctx.storage,
        xero: reconnect_ctx.xero,
    };
    handle_xero_callback(&ctx, &accepted_params(7))
        .await
        .expect("reconnect");

    let stored = ctx
        .storage
        .connection_for_business(BusinessId(7))
        .await
        .expect("lookup")
        .expect("row");
    assert_eq!(stored.tenant_id, "tenant-9");
    // Name falls back to the tenant id when the provider omits it.
    assert_eq!(stored.tenant_name, "tenant-9");
}
