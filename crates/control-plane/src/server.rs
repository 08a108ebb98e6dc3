// HTTP application assembly
//
// Route modules are merged under an optional prefix; health stays at the root.

use std::sync::Arc;

use axum::http::{header, HeaderValue, Method};
use axum::{routing::get, Json, Router};
use framefarm_scheduler::{JobDecomposer, NodeRegistry, TaskStore};
use serde::{Deserialize, Serialize};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use utoipa::{OpenApi, ToSchema};
use utoipa_swagger_ui::SwaggerUi;

use crate::api;
use crate::openapi::ApiDoc;

/// Services the HTTP layer talks to
#[derive(Clone)]
pub struct Services {
    pub store: Arc<dyn TaskStore>,
    pub decomposer: Arc<JobDecomposer>,
    pub registry: Arc<dyn NodeRegistry>,
}

/// Liveness probe payload
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct HealthResponse {
    #[schema(example = "ok")]
    pub status: String,
    #[schema(example = "0.1.0")]
    pub version: String,
}

/// GET /health - Liveness probe
#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Service is up", body = HealthResponse)
    ),
    tag = "health"
)]
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// All API routes, unprefixed and without middleware
pub fn api_routes(services: &Services) -> Router {
    Router::new()
        .merge(api::jobs::routes(api::jobs::AppState::new(
            services.decomposer.clone(),
            services.store.clone(),
        )))
        .merge(api::tasks::routes(api::tasks::AppState::new(
            services.store.clone(),
        )))
        .merge(api::nodes::routes(api::nodes::AppState::new(
            services.registry.clone(),
        )))
}

/// Full application: health, prefixed API, Swagger UI, CORS and tracing
pub fn build_app(services: &Services, api_prefix: &str, cors_origins: &[HeaderValue]) -> Router {
    let app = Router::new()
        .route("/health", get(health))
        .merge(build_router_with_prefix(api_routes(services), api_prefix))
        .merge(SwaggerUi::new("/swagger-ui").url("/api-doc/openapi.json", ApiDoc::openapi()));

    // CORS only when the UI is served from another origin
    let app = if cors_origins.is_empty() {
        app
    } else {
        app.layer(
            CorsLayer::new()
                .allow_origin(AllowOrigin::list(cors_origins.iter().cloned()))
                .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
                .allow_headers([header::CONTENT_TYPE, header::ACCEPT, header::ORIGIN]),
        )
    };

    app.layer(TraceLayer::new_for_http())
}

/// Nest routes under `api_prefix` unless it is empty
pub fn build_router_with_prefix<S: Clone + Send + Sync + 'static>(
    api_routes: Router<S>,
    api_prefix: &str,
) -> Router<S> {
    if api_prefix.is_empty() {
        api_routes
    } else {
        Router::new().nest(api_prefix, api_routes)
    }
}
