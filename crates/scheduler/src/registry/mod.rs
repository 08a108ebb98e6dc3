//! Node registry
//!
//! Liveness table of worker nodes, fed by heartbeats and pruned on timeout.
//! It is a cache, not an audit log: nothing here survives a restart.

mod memory;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

pub use memory::InMemoryNodeRegistry;

/// Info key marking a node that runs inside a control-plane process
///
/// The fleet controller did not provision such nodes and never counts or
/// terminates them.
pub const LOCAL_NODE_KEY: &str = "local";

/// A worker node as last reported
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Node {
    #[schema(example = "render-node-03")]
    pub node_id: String,
    pub last_seen: DateTime<Utc>,
    /// Free-form node facts (cpu, gpu, `load`, ...)
    #[schema(value_type = Object)]
    pub info: serde_json::Value,
}

impl Node {
    /// Reported load, 0.0 when absent
    pub fn load(&self) -> f64 {
        self.info
            .get("load")
            .and_then(serde_json::Value::as_f64)
            .unwrap_or(0.0)
    }

    /// In-process worker, outside the autoscaled fleet
    pub fn is_local(&self) -> bool {
        self.info
            .get(LOCAL_NODE_KEY)
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false)
    }

    /// Not heard from within `threshold` of `now`
    pub fn is_stale(&self, threshold: Duration, now: DateTime<Utc>) -> bool {
        match chrono::Duration::from_std(threshold) {
            Ok(threshold) => now.signed_duration_since(self.last_seen) > threshold,
            Err(_) => false,
        }
    }
}

/// Liveness table of worker nodes
#[async_trait]
pub trait NodeRegistry: Send + Sync + 'static {
    /// Upsert a node, stamping `last_seen` with the current time
    async fn heartbeat(&self, node_id: &str, info: serde_json::Value) -> Node;

    /// All known nodes, ordered by id
    async fn list_nodes(&self) -> Vec<Node>;

    /// Drop nodes not seen within `threshold`; returns their ids
    async fn prune(&self, threshold: Duration) -> Vec<String>;

    async fn get(&self, node_id: &str) -> Option<Node>;
}
