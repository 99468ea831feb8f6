use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use axum::{
    body::{to_bytes, Body},
    http::{header, Request},
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use tower::ServiceExt;
use xero::{Tenant, TokenSet, XeroApi};

use super::*;

#[derive(Default)]
struct FakeXero {
    fail_exchange: bool,
    tenants: Vec<Tenant>,
    exchange_calls: AtomicUsize,
    connections_calls: AtomicUsize,
}

#[async_trait]
impl XeroApi for FakeXero {
    async fn exchange_code(&self, _code: &str) -> anyhow::Result<TokenSet> {
        self.exchange_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_exchange {
            anyhow::bail!("token endpoint returned 500");
        }
        Ok(TokenSet {
            access_token: "at".into(),
            refresh_token: "rt".into(),
            expires_in: 1800,
        })
    }

    async fn connections(&self, _access_token: &str) -> anyhow::Result<Vec<Tenant>> {
        self.connections_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.tenants.clone())
    }
}

async fn test_app(fake: FakeXero) -> (Router, Arc<FakeXero>, Storage) {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let fake = Arc::new(fake);
    let state = AppState {
        api: ApiContext {
            storage: storage.clone(),
            xero: fake.clone(),
        },
        results_redirect_url: "/integrations/xero".into(),
    };
    (build_router(Arc::new(state)), fake, storage)
}

fn json_request(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .expect("request")
}

async fn json_body(response: axum::response::Response) -> serde_json::Value {
    let bytes = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    serde_json::from_slice(&bytes).expect("json body")
}

fn location(response: &axum::response::Response) -> &str {
    response
        .headers()
        .get(header::LOCATION)
        .expect("location header")
        .to_str()
        .expect("utf-8 location")
}

#[tokio::test]
async fn healthz_answers_ok() {
    let (app, _, _) = test_app(FakeXero::default()).await;
    let response = app
        .oneshot(Request::get("/healthz").body(Body::empty()).expect("request"))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn kpi_create_and_list_round_trip() {
    let (app, _, _) = test_app(FakeXero::default()).await;

    let create = json_request(
        "POST",
        "/api/kpis",
        serde_json::json!({
            "business_id": 1,
            "name": "revenue",
            "target": 100.0,
            "current_value": 80.0
        }),
    );
    let response = app.clone().oneshot(create).await.expect("create response");
    assert_eq!(response.status(), StatusCode::CREATED);
    let created = json_body(response).await;
    assert_eq!(created["success"], serde_json::json!(true));
    assert_eq!(created["kpi"]["name"], serde_json::json!("revenue"));

    let list = Request::get("/api/kpis?business_id=1")
        .body(Body::empty())
        .expect("request");
    let response = app.oneshot(list).await.expect("list response");
    assert_eq!(response.status(), StatusCode::OK);
    let listed = json_body(response).await;
    assert_eq!(listed["kpis"].as_array().expect("array").len(), 1);
}

#[tokio::test]
async fn list_kpis_requires_business_id() {
    let (app, _, _) = test_app(FakeXero::default()).await;
    let response = app
        .oneshot(Request::get("/api/kpis").body(Body::empty()).expect("request"))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn deleting_missing_kpi_is_not_found() {
    let (app, _, _) = test_app(FakeXero::default()).await;
    let response = app
        .oneshot(
            Request::delete("/api/kpis/42?business_id=1")
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = json_body(response).await;
    assert_eq!(body["success"], serde_json::json!(false));
}

#[tokio::test]
async fn kpi_stats_reports_summary() {
    let (app, _, _) = test_app(FakeXero::default()).await;
    let create = json_request(
        "POST",
        "/api/kpis",
        serde_json::json!({
            "business_id": 1,
            "name": "revenue",
            "target": 100.0,
            "current_value": 120.0
        }),
    );
    app.clone().oneshot(create).await.expect("create");

    let response = app
        .oneshot(
            Request::get("/api/kpis/stats?business_id=1")
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["stats"]["total"], serde_json::json!(1));
    assert_eq!(body["stats"]["on_target"], serde_json::json!(1));
}

#[tokio::test]
async fn unknown_task_status_filter_is_rejected() {
    let (app, _, _) = test_app(FakeXero::default()).await;
    let response = app
        .oneshot(
            Request::get("/api/tasks?business_id=1&status=paused")
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn completing_recurring_task_over_http_returns_follow_up() {
    let (app, _, _) = test_app(FakeXero::default()).await;

    let create = json_request(
        "POST",
        "/api/tasks",
        serde_json::json!({
            "business_id": 1,
            "title": "send invoices",
            "due_date": "2024-01-01",
            "recurrence_pattern": "every 3 days"
        }),
    );
    let response = app.clone().oneshot(create).await.expect("create");
    assert_eq!(response.status(), StatusCode::CREATED);
    let created = json_body(response).await;
    let task_id = created["task"]["task_id"].as_i64().expect("task id");

    let complete = json_request(
        "POST",
        &format!("/api/tasks/{task_id}/complete"),
        serde_json::json!({ "business_id": 1, "completed_on": "2024-01-01" }),
    );
    let response = app.oneshot(complete).await.expect("complete");
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["completed"]["status"], serde_json::json!("completed"));
    assert_eq!(
        body["regenerated"]["due_date"],
        serde_json::json!("2024-01-04")
    );
}

#[tokio::test]
async fn callback_denial_redirects_without_provider_calls() {
    let (app, fake, _) = test_app(FakeXero::default()).await;
    let response = app
        .oneshot(
            Request::get("/oauth/xero/callback?error=access_denied&code=c&state=s")
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");

    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    assert_eq!(location(&response), "/integrations/xero?error=xero_denied");
    assert_eq!(fake.exchange_calls.load(Ordering::SeqCst), 0);
    assert_eq!(fake.connections_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn callback_token_failure_redirects_with_exchange_tag() {
    let (app, fake, storage) = test_app(FakeXero {
        fail_exchange: true,
        ..FakeXero::default()
    })
    .await;
    let state = STANDARD.encode(r#"{"businessId":7}"#);
    let response = app
        .oneshot(
            Request::get(format!("/oauth/xero/callback?code=c&state={state}"))
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");

    assert_eq!(
        location(&response),
        "/integrations/xero?error=token_exchange_failed"
    );
    assert_eq!(fake.connections_calls.load(Ordering::SeqCst), 0);
    assert!(storage
        .connection_for_business(shared::domain::BusinessId(7))
        .await
        .expect("lookup")
        .is_none());
}

#[tokio::test]
async fn callback_success_redirects_and_stores_connection() {
    let (app, _, storage) = test_app(FakeXero {
        tenants: vec![Tenant {
            tenant_id: "tenant-1".into(),
            tenant_name: Some("Acme Ltd".into()),
        }],
        ..FakeXero::default()
    })
    .await;
    let state = STANDARD.encode(r#"{"businessId":7}"#);
    let response = app
        .oneshot(
            Request::get(format!("/oauth/xero/callback?code=c&state={state}"))
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");

    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    assert_eq!(location(&response), "/integrations/xero?success=true");

    let stored = storage
        .connection_for_business(shared::domain::BusinessId(7))
        .await
        .expect("lookup")
        .expect("row");
    assert_eq!(stored.tenant_name, "Acme Ltd");
    assert_eq!(stored.status, "active");
}

#[tokio::test]
async fn missing_callback_params_redirect_with_tag() {
    let (app, _, _) = test_app(FakeXero::default()).await;
    let response = app
        .oneshot(
            Request::get("/oauth/xero/callback")
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");
    assert_eq!(
        location(&response),
        "/integrations/xero?error=missing_params"
    );
}
