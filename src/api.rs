//! HTTP surface: job submission, the worker trigger, job status and
//! reconciliation sessions.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::config::WorkerSettings;
use crate::db::{Pool, ReverseJob, Shortfall, ValidationSession};
use crate::error::{ErrorBody, Result};
use crate::movement::MovementSink;
use crate::reconciliation::{self, CompleteSession, StartSession};
use crate::reverse::{self, FilteredRequest, SpoiledRequest, SubmittedJob, WorkerOutcome};

#[derive(Clone)]
pub struct AppState {
    pub pool: Pool,
    pub worker_token: String,
    pub settings: WorkerSettings,
    pub movements: Arc<dyn MovementSink>,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanRequest {
    pub code: String,
    #[serde(default)]
    pub scanned_by: Option<i64>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/reverse-jobs/spoiled", post(submit_spoiled))
        .route("/api/v1/reverse-jobs/filtered", post(submit_filtered))
        .route("/api/v1/reverse-jobs/process", post(process_next))
        .route("/api/v1/reverse-jobs/:id", get(get_job))
        .route("/api/v1/reverse-jobs/:id/requeue", post(requeue_job))
        .route("/api/v1/validation-sessions", post(start_session))
        .route(
            "/api/v1/validation-sessions/:id",
            get(get_session).delete(cancel_session),
        )
        .route("/api/v1/validation-sessions/:id/scan-master", post(scan_master))
        .route("/api/v1/validation-sessions/:id/scan-code", post(scan_code))
        .route("/api/v1/validation-sessions/:id/shortfalls", post(record_shortfall))
        .route("/api/v1/validation-sessions/:id/complete", post(complete_session))
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::new(state))
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

async fn submit_spoiled(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SpoiledRequest>,
) -> Result<(StatusCode, Json<SubmittedJob>)> {
    let job = reverse::submit_spoiled(&state.pool, &req).await?;
    Ok((StatusCode::CREATED, Json(job)))
}

async fn submit_filtered(
    State(state): State<Arc<AppState>>,
    Json(req): Json<FilteredRequest>,
) -> Result<(StatusCode, Json<SubmittedJob>)> {
    let job = reverse::submit_filtered(&state.pool, &req).await?;
    Ok((StatusCode::CREATED, Json(job)))
}

/// Exact match against the configured shared secret.
fn authorized(headers: &HeaderMap, token: &str) -> bool {
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .is_some_and(|presented| presented == token)
}

async fn process_next(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if !authorized(&headers, &state.worker_token) {
        warn!("worker trigger rejected: bad or missing bearer token");
        return (
            StatusCode::UNAUTHORIZED,
            Json(ErrorBody {
                error: "unauthorized",
                message: "a valid bearer token is required".to_string(),
            }),
        )
            .into_response();
    }
    match reverse::run_once(&state.pool, &state.settings).await {
        Ok(outcome) => Json::<WorkerOutcome>(outcome).into_response(),
        Err(err) => err.into_response(),
    }
}

async fn get_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<ReverseJob>> {
    Ok(Json(reverse::get_job(&state.pool, id).await?))
}

async fn requeue_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<ReverseJob>> {
    Ok(Json(reverse::requeue_job(&state.pool, id).await?))
}

async fn start_session(
    State(state): State<Arc<AppState>>,
    Json(req): Json<StartSession>,
) -> Result<(StatusCode, Json<ValidationSession>)> {
    let session = reconciliation::start_session(&state.pool, &req).await?;
    Ok((StatusCode::CREATED, Json(session)))
}

async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<ValidationSession>> {
    Ok(Json(reconciliation::get_session(&state.pool, id).await?))
}

async fn scan_master(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(req): Json<ScanRequest>,
) -> Result<Json<ValidationSession>> {
    let session = reconciliation::scan_master(
        &state.pool,
        id,
        &req.code,
        req.scanned_by,
        state.movements.as_ref(),
    )
    .await?;
    Ok(Json(session))
}

async fn scan_code(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(req): Json<ScanRequest>,
) -> Result<Json<ValidationSession>> {
    let session = reconciliation::scan_code(
        &state.pool,
        id,
        &req.code,
        req.scanned_by,
        state.movements.as_ref(),
    )
    .await?;
    Ok(Json(session))
}

async fn record_shortfall(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(shortfall): Json<Shortfall>,
) -> Result<Json<ValidationSession>> {
    Ok(Json(
        reconciliation::record_shortfall(&state.pool, id, shortfall).await?,
    ))
}

async fn complete_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(req): Json<CompleteSession>,
) -> Result<Json<ValidationSession>> {
    Ok(Json(
        reconciliation::complete_session(&state.pool, id, &req).await?,
    ))
}

async fn cancel_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<StatusCode> {
    reconciliation::cancel_session(&state.pool, id, state.movements.as_ref()).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn bearer_token_must_match_exactly() {
        let mut headers = HeaderMap::new();
        assert!(!authorized(&headers, "s3cret"));
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer s3cret"));
        assert!(authorized(&headers, "s3cret"));
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer s3cret "));
        assert!(!authorized(&headers, "s3cret"));
        headers.insert(AUTHORIZATION, HeaderValue::from_static("bearer s3cret"));
        assert!(!authorized(&headers, "s3cret"));
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer S3CRET"));
        assert!(!authorized(&headers, "s3cret"));
    }
}
