use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::coordinator::{Coordinator, HealthSummary};
use crate::error::CoordinatorError;
use crate::ledger::{Credits, LedgerEntry};
use crate::scheduler::{Job, JobSpec, JobTransition, StatusReport};
use crate::worker::Worker;

#[derive(Clone)]
pub struct ApiState {
    pub coordinator: Arc<Coordinator>,
    pub admin_token: Arc<str>,
}

impl ApiState {
    pub fn new(coordinator: Arc<Coordinator>, admin_token: impl Into<Arc<str>>) -> Self {
        Self {
            coordinator,
            admin_token: admin_token.into(),
        }
    }
}

/// Error returned by handlers, rendered as `{"error": "..."}`.
#[derive(Debug)]
pub enum ApiError {
    Unauthorized,
    Coordinator(CoordinatorError),
}

impl From<CoordinatorError> for ApiError {
    fn from(e: CoordinatorError) -> Self {
        ApiError::Coordinator(e)
    }
}

/// HTTP status for each error kind.
pub fn status_for(error: &CoordinatorError) -> StatusCode {
    match error {
        CoordinatorError::Validation(_) => StatusCode::BAD_REQUEST,
        CoordinatorError::WorkerNotFound(_)
        | CoordinatorError::JobNotFound(_)
        | CoordinatorError::AccountNotFound(_) => StatusCode::NOT_FOUND,
        CoordinatorError::Conflict(_) | CoordinatorError::InvalidTransition { .. } => {
            StatusCode::CONFLICT
        }
        CoordinatorError::InsufficientCredits { .. } => StatusCode::PAYMENT_REQUIRED,
        CoordinatorError::QueueFull(_) => StatusCode::TOO_MANY_REQUESTS,
        CoordinatorError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        CoordinatorError::Degraded => StatusCode::SERVICE_UNAVAILABLE,
        CoordinatorError::StorageTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                "Admin token required".to_string(),
            ),
            ApiError::Coordinator(e) => (status_for(&e), e.to_string()),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

fn require_admin(headers: &HeaderMap, token: &str) -> ApiResult<()> {
    let provided = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or(ApiError::Unauthorized)?;
    if !token.is_empty()
        && constant_time_eq::constant_time_eq(provided.as_bytes(), token.as_bytes())
    {
        Ok(())
    } else {
        tracing::warn!("Rejected admin request with invalid token");
        Err(ApiError::Unauthorized)
    }
}

// =============================================================================
// Request / response bodies
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    #[serde(default)]
    pub worker_id: Option<String>,
    pub cpu_cores: u32,
    pub ram_mb: u64,
}

#[derive(Debug, Deserialize)]
pub struct WorkerRequest {
    pub worker_id: String,
}

#[derive(Debug, Serialize)]
struct UnregisterResponse {
    worker_id: String,
    requeued_jobs: Vec<Uuid>,
}

#[derive(Debug, Serialize)]
struct TaskResponse {
    job: Option<Job>,
}

#[derive(Debug, Deserialize)]
pub struct SubmitRequest {
    pub account_id: String,
    #[serde(flatten)]
    pub spec: JobSpec,
}

#[derive(Debug, Serialize)]
struct BalanceResponse {
    account_id: String,
    balance: Credits,
}

#[derive(Debug, Deserialize)]
pub struct TransferRequest {
    pub from: String,
    pub to: String,
    pub amount: Credits,
}

#[derive(Debug, Deserialize)]
pub struct AwardRequest {
    pub account_id: String,
    pub amount: Credits,
}

#[derive(Debug, Serialize)]
struct LedgerChangeResponse {
    success: bool,
}

// =============================================================================
// Router
// =============================================================================

pub fn router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api = Router::new()
        .route("/health", get(health_handler))
        .route("/workers", get(list_workers_handler))
        .route("/register", post(register_handler))
        .route("/unregister", post(unregister_handler))
        .route("/heartbeat", post(heartbeat_handler))
        .route("/task", get(task_handler))
        .route("/status", post(status_handler))
        .route("/submit", post(submit_handler))
        .route("/jobs", get(list_jobs_handler))
        .route("/jobs/:id", get(get_job_handler))
        .route("/jobs/:id/history", get(job_history_handler))
        .route("/credits/transfer", post(transfer_handler))
        .route("/credits/award", post(award_handler))
        .route("/credits/:account", get(balance_handler))
        .route("/credits/:account/entries", get(entries_handler));

    Router::new()
        .nest("/api/v1", api)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Serve the API until `shutdown` is cancelled.
pub async fn serve(
    addr: SocketAddr,
    state: ApiState,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %addr, "HTTP API listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

// =============================================================================
// Handlers
// =============================================================================

async fn health_handler(State(state): State<ApiState>) -> Json<HealthSummary> {
    Json(state.coordinator.health().await)
}

async fn list_workers_handler(State(state): State<ApiState>) -> Json<Vec<Worker>> {
    Json(state.coordinator.list_workers().await)
}

async fn register_handler(
    State(state): State<ApiState>,
    Json(req): Json<RegisterRequest>,
) -> ApiResult<Json<Worker>> {
    let worker = state
        .coordinator
        .register_worker(req.worker_id, req.cpu_cores, req.ram_mb)
        .await?;
    Ok(Json(worker))
}

async fn unregister_handler(
    State(state): State<ApiState>,
    Json(req): Json<WorkerRequest>,
) -> ApiResult<Json<UnregisterResponse>> {
    let requeued_jobs = state.coordinator.unregister_worker(&req.worker_id).await?;
    Ok(Json(UnregisterResponse {
        worker_id: req.worker_id,
        requeued_jobs,
    }))
}

async fn heartbeat_handler(
    State(state): State<ApiState>,
    Json(req): Json<WorkerRequest>,
) -> ApiResult<Json<Worker>> {
    Ok(Json(state.coordinator.heartbeat(&req.worker_id).await?))
}

async fn task_handler(
    State(state): State<ApiState>,
    Query(req): Query<WorkerRequest>,
) -> ApiResult<Json<TaskResponse>> {
    let job = state.coordinator.next_job(&req.worker_id).await?;
    Ok(Json(TaskResponse { job }))
}

async fn status_handler(
    State(state): State<ApiState>,
    Json(report): Json<StatusReport>,
) -> ApiResult<Json<Job>> {
    Ok(Json(state.coordinator.report_status(report).await?))
}

async fn submit_handler(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(req): Json<SubmitRequest>,
) -> ApiResult<(StatusCode, Json<Job>)> {
    require_admin(&headers, &state.admin_token)?;
    let job = state
        .coordinator
        .submit_job(&req.account_id, req.spec)
        .await?;
    Ok((StatusCode::CREATED, Json(job)))
}

async fn list_jobs_handler(State(state): State<ApiState>) -> Json<Vec<Job>> {
    Json(state.coordinator.list_jobs().await)
}

async fn get_job_handler(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Job>> {
    Ok(Json(state.coordinator.get_job(&id).await?))
}

async fn job_history_handler(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Vec<JobTransition>>> {
    Ok(Json(state.coordinator.job_history(&id).await?))
}

async fn balance_handler(
    State(state): State<ApiState>,
    Path(account_id): Path<String>,
) -> ApiResult<Json<BalanceResponse>> {
    let balance = state.coordinator.get_balance(&account_id).await?;
    Ok(Json(BalanceResponse {
        account_id,
        balance,
    }))
}

async fn entries_handler(
    State(state): State<ApiState>,
    Path(account_id): Path<String>,
) -> ApiResult<Json<Vec<LedgerEntry>>> {
    Ok(Json(state.coordinator.ledger_entries(&account_id).await?))
}

async fn transfer_handler(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(req): Json<TransferRequest>,
) -> ApiResult<Json<LedgerChangeResponse>> {
    require_admin(&headers, &state.admin_token)?;
    let success = state
        .coordinator
        .transfer(&req.from, &req.to, req.amount)
        .await?;
    Ok(Json(LedgerChangeResponse { success }))
}

async fn award_handler(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(req): Json<AwardRequest>,
) -> ApiResult<Json<LedgerChangeResponse>> {
    require_admin(&headers, &state.admin_token)?;
    let success = state
        .coordinator
        .credit(&req.account_id, req.amount)
        .await?;
    Ok(Json(LedgerChangeResponse { success }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use std::time::Duration;

    #[test]
    fn error_status_mapping() {
        assert_eq!(
            status_for(&CoordinatorError::Validation("x".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_for(&CoordinatorError::JobNotFound(Uuid::nil())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_for(&CoordinatorError::InsufficientCredits {
                required: Credits::from_micros(2),
                available: Credits::from_micros(1),
            }),
            StatusCode::PAYMENT_REQUIRED
        );
        assert_eq!(
            status_for(&CoordinatorError::QueueFull(10)),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            status_for(&CoordinatorError::Degraded),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_for(&CoordinatorError::StorageTimeout(Duration::from_secs(1))),
            StatusCode::GATEWAY_TIMEOUT
        );
    }

    #[test]
    fn admin_token_check() {
        let mut headers = HeaderMap::new();
        assert!(require_admin(&headers, "secret").is_err());

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer nope"));
        assert!(require_admin(&headers, "secret").is_err());

        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_static("Bearer secret"),
        );
        assert!(require_admin(&headers, "secret").is_ok());
        assert!(require_admin(&headers, "").is_err());
    }

    #[test]
    fn admin_token_must_match_exactly() {
        let mut headers = HeaderMap::new();
        for provided in ["Bearer secre", "Bearer secret2", "Bearer Secret", "Bearer  secret"] {
            headers.insert(header::AUTHORIZATION, HeaderValue::from_static(provided));
            assert!(require_admin(&headers, "secret").is_err(), "{provided} accepted");
        }
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("secret"));
        assert!(require_admin(&headers, "secret").is_err());
    }
}
