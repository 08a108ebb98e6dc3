//! DashMap-backed node registry

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use tracing::{debug, info};

use super::{Node, NodeRegistry};

/// In-process node registry
///
/// Each heartbeat is a single-entry upsert; no global lock is taken.
#[derive(Default)]
pub struct InMemoryNodeRegistry {
    nodes: DashMap<String, Node>,
}

impl InMemoryNodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Insert a node with an explicit timestamp (for testing)
    pub fn insert(&self, node: Node) {
        self.nodes.insert(node.node_id.clone(), node);
    }
}

#[async_trait]
impl NodeRegistry for InMemoryNodeRegistry {
    async fn heartbeat(&self, node_id: &str, info: serde_json::Value) -> Node {
        let node = Node {
            node_id: node_id.to_string(),
            last_seen: Utc::now(),
            info,
        };
        if self.nodes.insert(node_id.to_string(), node.clone()).is_none() {
            info!(node_id, "node joined");
        } else {
            debug!(node_id, "node heartbeat");
        }
        node
    }

    async fn list_nodes(&self) -> Vec<Node> {
        let mut nodes: Vec<Node> = self.nodes.iter().map(|e| e.value().clone()).collect();
        nodes.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        nodes
    }

    async fn prune(&self, threshold: Duration) -> Vec<String> {
        let now = Utc::now();
        let mut removed = Vec::new();
        self.nodes.retain(|id, node| {
            let stale = node.is_stale(threshold, now);
            if stale {
                removed.push(id.clone());
            }
            !stale
        });

        removed.sort();
        if !removed.is_empty() {
            info!(count = removed.len(), nodes = ?removed, "pruned stale nodes");
        }
        removed
    }

    async fn get(&self, node_id: &str) -> Option<Node> {
        self.nodes.get(node_id).map(|e| e.value().clone())
    }
}
