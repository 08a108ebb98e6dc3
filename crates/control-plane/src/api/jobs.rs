// Job submission and status HTTP routes

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use framefarm_scheduler::{
    DecomposeError, JobDecomposer, JobSpec, JobStatusReport, SubmittedJob, TaskStore,
};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use super::common::{store_error, ApiError, ErrorResponse};

/// Result of cancelling a job
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CancelJobResponse {
    pub job_id: Uuid,
    /// Queued tasks moved to `failed`; in-flight tasks are left to finish
    #[schema(example = 42)]
    pub cancelled_tasks: u64,
}

/// App state for job routes
#[derive(Clone)]
pub struct AppState {
    pub decomposer: Arc<JobDecomposer>,
    pub store: Arc<dyn TaskStore>,
}

impl AppState {
    pub fn new(decomposer: Arc<JobDecomposer>, store: Arc<dyn TaskStore>) -> Self {
        Self { decomposer, store }
    }
}

/// Create job routes
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/v1/jobs", post(create_job))
        .route("/v1/jobs/:job_id", get(get_job))
        .route("/v1/jobs/:job_id/cancel", post(cancel_job))
        .with_state(state)
}

/// POST /v1/jobs - Submit a job and decompose it into tasks
#[utoipa::path(
    post,
    path = "/v1/jobs",
    request_body = JobSpec,
    responses(
        (status = 201, description = "Job accepted", body = SubmittedJob),
        (status = 400, description = "Invalid job", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    tag = "jobs"
)]
pub async fn create_job(
    State(state): State<AppState>,
    payload: Result<Json<JobSpec>, JsonRejection>,
) -> Result<(StatusCode, Json<SubmittedJob>), ApiError> {
    let Json(spec) = payload.map_err(|rejection| {
        ErrorResponse::new(rejection.body_text()).into_response(StatusCode::BAD_REQUEST)
    })?;

    match state.decomposer.submit(spec).await {
        Ok(submitted) => Ok((StatusCode::CREATED, Json(submitted))),
        Err(DecomposeError::InvalidJob(reason)) => {
            Err(ErrorResponse::new(reason).into_response(StatusCode::BAD_REQUEST))
        }
        Err(DecomposeError::Store(e)) => Err(store_error("Failed to submit job", e)),
    }
}

/// GET /v1/jobs/{job_id} - Job status derived from its tasks
#[utoipa::path(
    get,
    path = "/v1/jobs/{job_id}",
    params(
        ("job_id" = Uuid, Path, description = "Job ID")
    ),
    responses(
        (status = 200, description = "Job status", body = JobStatusReport),
        (status = 404, description = "Job not found", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    tag = "jobs"
)]
pub async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<JobStatusReport>, ApiError> {
    let report = state
        .store
        .job_status(job_id)
        .await
        .map_err(|e| store_error("Failed to get job status", e))?;

    Ok(Json(report))
}

/// POST /v1/jobs/{job_id}/cancel - Fail every queued task of a job
#[utoipa::path(
    post,
    path = "/v1/jobs/{job_id}/cancel",
    params(
        ("job_id" = Uuid, Path, description = "Job ID")
    ),
    responses(
        (status = 200, description = "Job cancelled", body = CancelJobResponse),
        (status = 404, description = "Job not found", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    tag = "jobs"
)]
pub async fn cancel_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<CancelJobResponse>, ApiError> {
    let cancelled_tasks = state
        .store
        .cancel_job(job_id)
        .await
        .map_err(|e| store_error("Failed to cancel job", e))?;

    tracing::info!(%job_id, cancelled_tasks, "Job cancelled");
    Ok(Json(CancelJobResponse {
        job_id,
        cancelled_tasks,
    }))
}
