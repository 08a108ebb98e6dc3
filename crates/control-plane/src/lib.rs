// Framefarm Control Plane Library
// Decision: Shared library for binaries (API server, OpenAPI export) and router tests

// API routes and types (shared for OpenAPI generation)
pub mod api;

// Environment configuration
pub mod config;

// OpenAPI spec generation
pub mod openapi;

// Router assembly
pub mod server;

// Logging setup
pub mod telemetry;

pub use config::{ConfigError, FarmConfig};
pub use server::{build_app, Services};
