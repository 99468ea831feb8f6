use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Redirect,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use server_api::{
    callback::{handle_xero_callback, CallbackParams},
    complete_task, create_kpi, create_task, delete_kpi, kpi_stats, list_kpis, list_tasks,
    update_kpi, ApiContext,
};
use shared::{
    domain::{BusinessId, KpiId, TaskId, TaskStatus},
    error::ApiError,
    protocol::{
        CompleteTaskRequest, CreateKpiRequest, CreateTaskRequest, KpiDeleteResponse,
        KpiListResponse, KpiResponse, KpiStatsResponse, TaskCompletionResponse, TaskListResponse,
        TaskResponse, UpdateKpiRequest,
    },
};
use storage::Storage;
use tracing::{error, info};
use xero::{XeroClient, XeroConfig};

mod config;

use config::{load_settings, prepare_database_url};

#[derive(Clone)]
struct AppState {
    api: ApiContext,
    results_redirect_url: String,
}

#[derive(Debug, Deserialize)]
struct BusinessQuery {
    business_id: i64,
}

#[derive(Debug, Deserialize)]
struct TaskListQuery {
    business_id: i64,
    status: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let settings = load_settings();
    let database_url = prepare_database_url(&settings.database_url)?;
    let storage = Storage::new(&database_url).await.map_err(|error| {
        error!(
            %database_url,
            %error,
            "failed to open SQLite database; verify parent directory exists and permissions are correct"
        );
        error
    })?;

    let xero_client = XeroClient::new(XeroConfig {
        client_id: settings.xero_client_id,
        client_secret: settings.xero_client_secret,
        redirect_uri: settings.xero_redirect_uri,
        token_url: settings.xero_token_url,
        connections_url: settings.xero_connections_url,
    });
    let api = ApiContext {
        storage,
        xero: Arc::new(xero_client),
    };

    let state = AppState {
        api,
        results_redirect_url: settings.results_redirect_url,
    };
    let app = build_router(Arc::new(state));

    let addr: SocketAddr = settings.server_bind.parse()?;
    info!(%addr, "server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/api/kpis", get(http_list_kpis).post(http_create_kpi))
        .route("/api/kpis/stats", get(http_kpi_stats))
        .route(
            "/api/kpis/:kpi_id",
            axum::routing::patch(http_update_kpi).delete(http_delete_kpi),
        )
        .route("/api/tasks", get(http_list_tasks).post(http_create_task))
        .route("/api/tasks/:task_id/complete", post(http_complete_task))
        .route("/oauth/xero/callback", get(http_xero_callback))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

fn reject(err: ApiError) -> (StatusCode, Json<ApiError>) {
    let status = match err.code {
        shared::error::ErrorCode::Validation => StatusCode::BAD_REQUEST,
        shared::error::ErrorCode::NotFound => StatusCode::NOT_FOUND,
        shared::error::ErrorCode::Upstream => StatusCode::BAD_GATEWAY,
        shared::error::ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(err))
}

async fn http_list_kpis(
    State(state): State<Arc<AppState>>,
    Query(q): Query<BusinessQuery>,
) -> Result<Json<KpiListResponse>, (StatusCode, Json<ApiError>)> {
    let kpis = list_kpis(&state.api, BusinessId(q.business_id))
        .await
        .map_err(reject)?;
    Ok(Json(KpiListResponse {
        success: true,
        kpis,
    }))
}

async fn http_create_kpi(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateKpiRequest>,
) -> Result<(StatusCode, Json<KpiResponse>), (StatusCode, Json<ApiError>)> {
    let kpi = create_kpi(&state.api, req).await.map_err(reject)?;
    Ok((
        StatusCode::CREATED,
        Json(KpiResponse { success: true, kpi }),
    ))
}

async fn http_update_kpi(
    State(state): State<Arc<AppState>>,
    Path(kpi_id): Path<i64>,
    Json(req): Json<UpdateKpiRequest>,
) -> Result<Json<KpiResponse>, (StatusCode, Json<ApiError>)> {
    let kpi = update_kpi(&state.api, KpiId(kpi_id), req)
        .await
        .map_err(reject)?;
    Ok(Json(KpiResponse { success: true, kpi }))
}

async fn http_delete_kpi(
    State(state): State<Arc<AppState>>,
    Path(kpi_id): Path<i64>,
    Query(q): Query<BusinessQuery>,
) -> Result<Json<KpiDeleteResponse>, (StatusCode, Json<ApiError>)> {
    let deleted = delete_kpi(&state.api, KpiId(kpi_id), BusinessId(q.business_id))
        .await
        .map_err(reject)?;
    Ok(Json(KpiDeleteResponse {
        success: true,
        deleted,
    }))
}

async fn http_kpi_stats(
    State(state): State<Arc<AppState>>,
    Query(q): Query<BusinessQuery>,
) -> Result<Json<KpiStatsResponse>, (StatusCode, Json<ApiError>)> {
    let stats = kpi_stats(&state.api, BusinessId(q.business_id))
        .await
        .map_err(reject)?;
    Ok(Json(KpiStatsResponse {
        success: true,
        stats,
    }))
}

async fn http_list_tasks(
    State(state): State<Arc<AppState>>,
    Query(q): Query<TaskListQuery>,
) -> Result<Json<TaskListResponse>, (StatusCode, Json<ApiError>)> {
    let status = match q.status.as_deref() {
        None => None,
        Some(raw) => Some(TaskStatus::parse(raw).ok_or_else(|| {
            reject(ApiError::validation(format!("unknown task status '{raw}'")))
        })?),
    };
    let tasks = list_tasks(&state.api, BusinessId(q.business_id), status)
        .await
        .map_err(reject)?;
    Ok(Json(TaskListResponse {
        success: true,
        tasks,
    }))
}

async fn http_create_task(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateTaskRequest>,
) -> Result<(StatusCode, Json<TaskResponse>), (StatusCode, Json<ApiError>)> {
    let task = create_task(&state.api, req).await.map_err(reject)?;
    Ok((
        StatusCode::CREATED,
        Json(TaskResponse {
            success: true,
            task,
        }),
    ))
}

async fn http_complete_task(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<i64>,
    Json(req): Json<CompleteTaskRequest>,
) -> Result<Json<TaskCompletionResponse>, (StatusCode, Json<ApiError>)> {
    let (completed, regenerated) = complete_task(
        &state.api,
        BusinessId(req.business_id),
        TaskId(task_id),
        req.completed_on,
    )
    .await
    .map_err(reject)?;
    Ok(Json(TaskCompletionResponse {
        success: true,
        completed,
        regenerated,
    }))
}

async fn http_xero_callback(
    State(state): State<Arc<AppState>>,
    Query(params): Query<CallbackParams>,
) -> Redirect {
    let target = match handle_xero_callback(&state.api, &params).await {
        Ok(_) => results_url(&state.results_redirect_url, "success", "true"),
        Err(err) => results_url(&state.results_redirect_url, "error", err.tag()),
    };
    Redirect::to(&target)
}

fn results_url(base: &str, key: &str, value: &str) -> String {
    let query = url::form_urlencoded::Serializer::new(String::new())
        .append_pair(key, value)
        .finish();
    let separator = if base.contains('?') { '&' } else { '?' };
    format!("{base}{separator}{query}")
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
