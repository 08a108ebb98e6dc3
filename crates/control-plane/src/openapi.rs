// OpenAPI specification generation
//
// Shared by the API server (Swagger UI) and the export-openapi binary
// (static spec generation).

use crate::api;
use crate::api::{ErrorResponse, ListResponse, OkResponse};
use crate::server::HealthResponse;
use framefarm_scheduler::{
    JobSpec, JobStats, JobStatus, JobStatusReport, Node, SubmittedJob, Task, TaskPayload,
    TaskStatus,
};
use utoipa::OpenApi;

/// OpenAPI documentation for the framefarm control plane
#[derive(OpenApi)]
#[openapi(
    paths(
        crate::server::health,
        api::jobs::create_job,
        api::jobs::get_job,
        api::jobs::cancel_job,
        api::tasks::list_pending,
        api::tasks::get_task,
        api::nodes::heartbeat,
        api::nodes::list_nodes,
    ),
    components(
        schemas(
            JobSpec, SubmittedJob, JobStatus, JobStats, JobStatusReport,
            Task, TaskStatus, TaskPayload,
            Node,
            api::jobs::CancelJobResponse,
            api::tasks::PendingQuery,
            api::nodes::HeartbeatRequest,
            ListResponse<Task>,
            ListResponse<Node>,
            ErrorResponse, OkResponse, HealthResponse,
        )
    ),
    tags(
        (name = "jobs", description = "Job submission and status"),
        (name = "tasks", description = "Task inspection"),
        (name = "nodes", description = "Worker node heartbeats"),
        (name = "health", description = "Liveness probe")
    ),
    info(
        title = "Framefarm API",
        version = "0.1.0",
        description = "Render-farm control plane: submit jobs, follow their tasks, track worker nodes",
        license(name = "MIT", url = "https://opensource.org/licenses/MIT")
    )
)]
pub struct ApiDoc;

impl ApiDoc {
    /// Generate the OpenAPI spec as a pretty-printed JSON string
    pub fn to_json() -> Result<String, serde_json::Error> {
        Self::openapi().to_pretty_json()
    }
}
