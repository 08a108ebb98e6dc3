// Worker node heartbeat HTTP routes

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use framefarm_scheduler::{Node, NodeRegistry};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use super::common::{ApiError, ErrorResponse, ListResponse, OkResponse};

/// Heartbeat sent by a worker node
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct HeartbeatRequest {
    #[schema(example = "render-node-03")]
    pub node_id: String,
    /// Free-form node facts; `load` (0.0-1.0) drives scale-down victim choice
    #[serde(default)]
    #[schema(value_type = Object, example = json!({"gpu": "rtx4090", "load": 0.25}))]
    pub info: serde_json::Value,
}

/// App state for node routes
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<dyn NodeRegistry>,
}

impl AppState {
    pub fn new(registry: Arc<dyn NodeRegistry>) -> Self {
        Self { registry }
    }
}

/// Create node routes
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/v1/nodes", get(list_nodes))
        .route("/v1/nodes/heartbeat", post(heartbeat))
        .with_state(state)
}

/// POST /v1/nodes/heartbeat - Register or refresh a node
#[utoipa::path(
    post,
    path = "/v1/nodes/heartbeat",
    request_body = HeartbeatRequest,
    responses(
        (status = 200, description = "Heartbeat recorded", body = OkResponse),
        (status = 400, description = "Invalid heartbeat", body = ErrorResponse)
    ),
    tag = "nodes"
)]
pub async fn heartbeat(
    State(state): State<AppState>,
    payload: Result<Json<HeartbeatRequest>, JsonRejection>,
) -> Result<Json<OkResponse>, ApiError> {
    let Json(req) = payload.map_err(|rejection| {
        ErrorResponse::new(rejection.body_text()).into_response(StatusCode::BAD_REQUEST)
    })?;
    if req.node_id.trim().is_empty() {
        return Err(ErrorResponse::new("node_id must not be empty")
            .into_response(StatusCode::BAD_REQUEST));
    }

    state.registry.heartbeat(&req.node_id, req.info).await;
    Ok(Json(OkResponse::ok()))
}

/// GET /v1/nodes - Nodes currently considered live
#[utoipa::path(
    get,
    path = "/v1/nodes",
    responses(
        (status = 200, description = "Known nodes", body = ListResponse<Node>)
    ),
    tag = "nodes"
)]
pub async fn list_nodes(State(state): State<AppState>) -> Json<ListResponse<Node>> {
    Json(ListResponse::new(state.registry.list_nodes().await))
}
