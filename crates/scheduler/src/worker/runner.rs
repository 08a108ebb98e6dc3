//! In-process worker fed by a local dispatch queue

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::executor::ExecutorRegistry;
use crate::dispatch::{DispatchQueue, DispatchedTask};
use crate::duration_millis;
use crate::registry::{NodeRegistry, LOCAL_NODE_KEY};

/// Local worker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Node id reported in heartbeats (generated if not provided)
    pub node_id: String,

    #[serde(with = "duration_millis")]
    pub heartbeat_interval: Duration,

    /// Static facts merged into every heartbeat
    #[serde(default)]
    pub info: serde_json::Value,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            node_id: format!("local-worker-{}", Uuid::now_v7()),
            heartbeat_interval: Duration::from_secs(10),
            info: serde_json::json!({}),
        }
    }
}

impl WorkerConfig {
    pub fn with_node_id(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = node_id.into();
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_info(mut self, info: serde_json::Value) -> Self {
        self.info = info;
        self
    }
}

struct RunnerState {
    busy: AtomicBool,
    completed: AtomicU64,
}

/// Executes dispatched tasks one at a time and heartbeats into a registry
pub struct WorkerRunner {
    config: WorkerConfig,
    queue: DispatchQueue,
    executors: Arc<ExecutorRegistry>,
    registry: Arc<dyn NodeRegistry>,
    state: Arc<RunnerState>,
    shutdown_tx: watch::Sender<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerRunner {
    pub fn new(
        config: WorkerConfig,
        queue: DispatchQueue,
        executors: Arc<ExecutorRegistry>,
        registry: Arc<dyn NodeRegistry>,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            config,
            queue,
            executors,
            registry,
            state: Arc::new(RunnerState {
                busy: AtomicBool::new(false),
                completed: AtomicU64::new(0),
            }),
            shutdown_tx,
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.config.node_id
    }

    /// Tasks executed so far
    pub fn completed(&self) -> u64 {
        self.state.completed.load(Ordering::Relaxed)
    }

    /// Spawn the execution and heartbeat loops
    #[instrument(skip(self), fields(node_id = %self.config.node_id))]
    pub fn start(&self) {
        info!(job_types = ?self.executors.job_types(), "Starting local worker");

        let execute = tokio::spawn(execution_loop(
            self.config.node_id.clone(),
            self.queue.clone(),
            Arc::clone(&self.executors),
            Arc::clone(&self.state),
            self.shutdown_tx.subscribe(),
        ));
        let heartbeat = tokio::spawn(heartbeat_loop(
            self.config.clone(),
            Arc::clone(&self.registry),
            Arc::clone(&self.state),
            self.shutdown_tx.subscribe(),
        ));

        self.handles.lock().extend([execute, heartbeat]);
    }

    /// Stop after the current task, if any
    pub async fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(node_id = %self.config.node_id, "Worker loop ended abnormally: {}", e);
            }
        }
        info!(node_id = %self.config.node_id, "Local worker stopped");
    }
}

async fn execution_loop(
    node_id: String,
    queue: DispatchQueue,
    executors: Arc<ExecutorRegistry>,
    state: Arc<RunnerState>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        let dispatched = tokio::select! {
            next = queue.recv() => next,
            _ = shutdown_rx.changed() => break,
        };
        let Some(DispatchedTask { task, reply }) = dispatched else {
            debug!(%node_id, "Dispatch queue closed");
            break;
        };

        if reply.is_closed() || task.lease_remaining().is_zero() {
            debug!(%node_id, task_id = %task.id, "Skipping abandoned task");
            continue;
        }

        state.busy.store(true, Ordering::Relaxed);
        let result = executors.execute(&task).await;
        state.busy.store(false, Ordering::Relaxed);
        state.completed.fetch_add(1, Ordering::Relaxed);

        debug!(
            %node_id,
            task_id = %task.id,
            unit = task.unit_index,
            ok = result.is_ok(),
            "Executed task"
        );
        if !reply.send(result.into_report()) {
            warn!(%node_id, task_id = %task.id, "Scheduler stopped waiting for result");
        }
    }
}

async fn heartbeat_loop(
    config: WorkerConfig,
    registry: Arc<dyn NodeRegistry>,
    state: Arc<RunnerState>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(config.heartbeat_interval);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let mut info = match &config.info {
                    serde_json::Value::Object(map) => map.clone(),
                    _ => serde_json::Map::new(),
                };
                let load = if state.busy.load(Ordering::Relaxed) { 1.0 } else { 0.0 };
                info.insert(LOCAL_NODE_KEY.to_string(), serde_json::json!(true));
                info.insert("load".to_string(), serde_json::json!(load));
                info.insert(
                    "completed".to_string(),
                    serde_json::json!(state.completed.load(Ordering::Relaxed)),
                );
                registry
                    .heartbeat(&config.node_id, serde_json::Value::Object(info))
                    .await;
            }
            _ = shutdown_rx.changed() => {
                debug!(node_id = %config.node_id, "Heartbeat loop: shutdown requested");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{DispatchChannel, LocalDispatchChannel};
    use crate::model::{ClaimedTask, ReportStatus, TaskPayload};
    use crate::registry::InMemoryNodeRegistry;
    use crate::worker::ExecutionResult;

    fn claimed(unit_index: i64) -> ClaimedTask {
        ClaimedTask {
            id: Uuid::now_v7(),
            job_id: Uuid::now_v7(),
            unit_index,
            priority: 5,
            payload: TaskPayload {
                job_type: "render".to_string(),
                unit_index,
                job_payload: serde_json::Value::Null,
            },
            attempt: 1,
            max_attempts: 3,
            claimed_by: "test".to_string(),
            lease_expires_at: chrono::Utc::now() + chrono::Duration::seconds(60),
        }
    }

    #[tokio::test]
    async fn test_runner_executes_and_heartbeats() {
        let (channel, queue) = LocalDispatchChannel::new(4);
        let mut executors = ExecutorRegistry::new();
        executors.register_fn("render", |task| async move {
            if task.unit_index % 2 == 0 {
                ExecutionResult::success(None)
            } else {
                ExecutionResult::failure("odd frame")
            }
        });
        let registry = Arc::new(InMemoryNodeRegistry::new());

        let runner = WorkerRunner::new(
            WorkerConfig::default()
                .with_node_id("local-1")
                .with_heartbeat_interval(Duration::from_millis(20))
                .with_info(serde_json::json!({"gpu": "none"})),
            queue,
            Arc::new(executors),
            registry.clone(),
        );
        runner.start();

        let even = channel.dispatch(claimed(2)).await.unwrap();
        let odd = channel.dispatch(claimed(3)).await.unwrap();
        assert_eq!(
            even.wait(Duration::from_secs(1)).await.unwrap().status,
            ReportStatus::Done
        );
        let failed = odd.wait(Duration::from_secs(1)).await.unwrap();
        assert_eq!(failed.status, ReportStatus::Failed);
        assert_eq!(failed.error.as_deref(), Some("odd frame"));

        tokio::time::sleep(Duration::from_millis(50)).await;
        let node = registry.get("local-1").await.unwrap();
        assert_eq!(node.info["gpu"], "none");
        assert_eq!(node.info["completed"], 2);
        assert!(node.is_local());

        runner.shutdown().await;
        assert_eq!(runner.completed(), 2);
    }
}
