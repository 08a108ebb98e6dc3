// Task inspection HTTP routes

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    routing::get,
    Json, Router,
};
use framefarm_scheduler::{Task, TaskStore};
use serde::Deserialize;
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

use super::common::{store_error, ApiError, ErrorResponse, ListResponse};

const DEFAULT_PENDING_LIMIT: usize = 100;
const MAX_PENDING_LIMIT: usize = 1000;

/// Query parameters for the pending task listing
#[derive(Debug, Clone, Deserialize, ToSchema, IntoParams)]
pub struct PendingQuery {
    /// Maximum tasks to return (default 100, capped at 1000)
    pub limit: Option<usize>,
}

/// App state for task routes
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn TaskStore>,
}

impl AppState {
    pub fn new(store: Arc<dyn TaskStore>) -> Self {
        Self { store }
    }
}

/// Create task routes
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/v1/tasks/pending", get(list_pending))
        .route("/v1/tasks/:task_id", get(get_task))
        .with_state(state)
}

/// GET /v1/tasks/pending - Queued tasks in claim order
#[utoipa::path(
    get,
    path = "/v1/tasks/pending",
    params(PendingQuery),
    responses(
        (status = 200, description = "Pending tasks", body = ListResponse<Task>),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    tag = "tasks"
)]
pub async fn list_pending(
    State(state): State<AppState>,
    Query(query): Query<PendingQuery>,
) -> Result<Json<ListResponse<Task>>, ApiError> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_PENDING_LIMIT)
        .min(MAX_PENDING_LIMIT);

    let tasks = state
        .store
        .list_pending(limit)
        .await
        .map_err(|e| store_error("Failed to list pending tasks", e))?;

    Ok(Json(ListResponse::new(tasks)))
}

/// GET /v1/tasks/{task_id} - Full task record
#[utoipa::path(
    get,
    path = "/v1/tasks/{task_id}",
    params(
        ("task_id" = Uuid, Path, description = "Task ID")
    ),
    responses(
        (status = 200, description = "Task found", body = Task),
        (status = 404, description = "Task not found", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    tag = "tasks"
)]
pub async fn get_task(
    State(state): State<AppState>,
    Path(task_id): Path<Uuid>,
) -> Result<Json<Task>, ApiError> {
    let task = state
        .store
        .get_task(task_id)
        .await
        .map_err(|e| store_error("Failed to get task", e))?;

    Ok(Json(task))
}
