// HTTP API routes
//
// Each submodule handles one resource type with its own AppState.

pub mod common;
pub mod jobs;
pub mod nodes;
pub mod tasks;

// Re-export common types
pub use common::{ErrorResponse, ListResponse, OkResponse};
