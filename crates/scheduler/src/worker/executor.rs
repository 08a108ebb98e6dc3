//! Work executor contract and routing

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, warn};

use crate::model::{ClaimedTask, TaskReport};

/// Outcome of executing one task
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionResult {
    Success {
        /// Where the produced artifact lives, if the executor knows
        artifact_ref: Option<String>,
        /// Extra fields merged into the stored result
        details: serde_json::Value,
    },
    Failure {
        error: String,
        details: serde_json::Value,
    },
}

impl ExecutionResult {
    pub fn success(artifact_ref: Option<String>) -> Self {
        Self::Success {
            artifact_ref,
            details: serde_json::Value::Null,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self::Failure {
            error: error.into(),
            details: serde_json::Value::Null,
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    /// `{ok: true, artifact_ref, ..details}` or `{ok: false, error, ..details}`
    pub fn to_json(&self) -> serde_json::Value {
        let (mut value, details) = match self {
            Self::Success {
                artifact_ref,
                details,
            } => (json!({ "ok": true, "artifact_ref": artifact_ref }), details),
            Self::Failure { error, details } => (json!({ "ok": false, "error": error }), details),
        };

        if let (Some(target), Some(extra)) = (value.as_object_mut(), details.as_object()) {
            for (key, field) in extra {
                target.entry(key.clone()).or_insert_with(|| field.clone());
            }
        }
        value
    }

    pub fn into_report(self) -> TaskReport {
        let payload = self.to_json();
        match self {
            Self::Success { .. } => TaskReport::done(payload),
            Self::Failure { error, .. } => TaskReport {
                status: crate::model::ReportStatus::Failed,
                payload,
                error: Some(error),
            },
        }
    }
}

/// Runs the actual work for a task
///
/// Implementations must finish within the task's lease; a task still running
/// after that is considered abandoned and may be executed again elsewhere.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, task: &ClaimedTask) -> ExecutionResult;
}

type ExecutorFn =
    dyn Fn(ClaimedTask) -> Pin<Box<dyn Future<Output = ExecutionResult> + Send>> + Send + Sync;

struct FnExecutor(Box<ExecutorFn>);

#[async_trait]
impl Executor for FnExecutor {
    async fn execute(&self, task: &ClaimedTask) -> ExecutionResult {
        (self.0)(task.clone()).await
    }
}

/// Routes tasks to executors by `job_type`
#[derive(Default, Clone)]
pub struct ExecutorRegistry {
    executors: HashMap<String, Arc<dyn Executor>>,
    fallback: Option<Arc<dyn Executor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an executor for a job type, replacing any previous one
    pub fn register(&mut self, job_type: impl Into<String>, executor: Arc<dyn Executor>) {
        self.executors.insert(job_type.into(), executor);
    }

    /// Register a closure as the executor for a job type
    pub fn register_fn<F, Fut>(&mut self, job_type: impl Into<String>, handler: F)
    where
        F: Fn(ClaimedTask) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ExecutionResult> + Send + 'static,
    {
        let handler: Box<ExecutorFn> = Box::new(move |task| Box::pin(handler(task)));
        self.register(job_type, Arc::new(FnExecutor(handler)));
    }

    /// Executor used for job types with no registration
    pub fn with_fallback(mut self, executor: Arc<dyn Executor>) -> Self {
        self.fallback = Some(executor);
        self
    }

    pub fn get(&self, job_type: &str) -> Option<Arc<dyn Executor>> {
        self.executors
            .get(job_type)
            .or(self.fallback.as_ref())
            .cloned()
    }

    pub fn job_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.executors.keys().cloned().collect();
        types.sort();
        types
    }

    /// Execute a task through its executor; unknown job types fail
    pub async fn execute(&self, task: &ClaimedTask) -> ExecutionResult {
        match self.get(task.job_type()) {
            Some(executor) => executor.execute(task).await,
            None => {
                warn!(job_type = %task.job_type(), "No executor registered");
                ExecutionResult::failure(format!(
                    "no executor registered for job type: {}",
                    task.job_type()
                ))
            }
        }
    }
}

/// Characters of stdout/stderr kept in the task result
pub const DEFAULT_OUTPUT_LIMIT: usize = 2000;

/// Runs `payload.cmd` through `sh -c` with `FRAME` set to the unit index
///
/// Succeeds on exit code 0. `payload.outdir`, when present, is reported as
/// the artifact reference.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    shell: String,
    output_limit: usize,
    timeout: Duration,
}

impl Default for CommandExecutor {
    fn default() -> Self {
        Self {
            shell: "sh".to_string(),
            output_limit: DEFAULT_OUTPUT_LIMIT,
            timeout: Duration::from_secs(1800),
        }
    }
}

impl CommandExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = shell.into();
        self
    }

    pub fn with_output_limit(mut self, limit: usize) -> Self {
        self.output_limit = limit;
        self
    }

    /// Upper bound on a single command; the lease still applies on top
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn truncate(&self, bytes: &[u8]) -> String {
        String::from_utf8_lossy(bytes)
            .chars()
            .take(self.output_limit)
            .collect()
    }
}

#[async_trait]
impl Executor for CommandExecutor {
    async fn execute(&self, task: &ClaimedTask) -> ExecutionResult {
        let job_payload = &task.payload.job_payload;
        let Some(cmd) = job_payload.get("cmd").and_then(serde_json::Value::as_str) else {
            return ExecutionResult::failure("payload has no cmd");
        };

        let deadline = self.timeout.min(task.lease_remaining());
        debug!(task_id = %task.id, frame = task.unit_index, cmd, "running command");

        let child = tokio::process::Command::new(&self.shell)
            .arg("-c")
            .arg(cmd)
            .env("FRAME", task.unit_index.to_string())
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();

        let output = match tokio::time::timeout(deadline, child).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return ExecutionResult::failure(format!("failed to spawn: {e}")),
            Err(_) => {
                return ExecutionResult::failure(format!(
                    "command timed out after {}s",
                    deadline.as_secs()
                ))
            }
        };

        let details = json!({
            "exit_code": output.status.code(),
            "stdout": self.truncate(&output.stdout),
            "stderr": self.truncate(&output.stderr),
        });

        if output.status.success() {
            ExecutionResult::Success {
                artifact_ref: job_payload
                    .get("outdir")
                    .and_then(serde_json::Value::as_str)
                    .map(str::to_string),
                details,
            }
        } else {
            ExecutionResult::Failure {
                error: format!("command exited with {}", output.status),
                details,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use uuid::Uuid;

    use super::*;
    use crate::model::{ReportStatus, TaskPayload};

    fn task(job_type: &str, unit_index: i64, job_payload: serde_json::Value) -> ClaimedTask {
        ClaimedTask {
            id: Uuid::now_v7(),
            job_id: Uuid::now_v7(),
            unit_index,
            priority: 5,
            payload: TaskPayload {
                job_type: job_type.to_string(),
                unit_index,
                job_payload,
            },
            attempt: 1,
            max_attempts: 3,
            claimed_by: "test".to_string(),
            lease_expires_at: Utc::now() + chrono::Duration::seconds(60),
        }
    }

    #[test]
    fn test_result_json_shape() {
        let ok = ExecutionResult::success(Some("s3://frames/0001.exr".to_string()));
        assert_eq!(
            ok.to_json(),
            json!({"ok": true, "artifact_ref": "s3://frames/0001.exr"})
        );

        let failed = ExecutionResult::Failure {
            error: "boom".to_string(),
            details: json!({"stderr": "trace", "ok": "ignored"}),
        };
        assert_eq!(
            failed.to_json(),
            json!({"ok": false, "error": "boom", "stderr": "trace"})
        );

        let report = failed.into_report();
        assert_eq!(report.status, ReportStatus::Failed);
        assert_eq!(report.error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn test_registry_routes_by_job_type() {
        let mut registry = ExecutorRegistry::new();
        registry.register_fn("render", |task| async move {
            ExecutionResult::success(Some(format!("frame-{}", task.unit_index)))
        });

        let result = registry.execute(&task("render", 42, json!({}))).await;
        assert_eq!(result, ExecutionResult::success(Some("frame-42".to_string())));

        let missing = registry.execute(&task("encode", 1, json!({}))).await;
        assert!(!missing.is_ok());
        assert_eq!(registry.job_types(), vec!["render".to_string()]);
    }

    #[tokio::test]
    async fn test_fallback_executor() {
        let mut fallback = ExecutorRegistry::new();
        fallback.register_fn("noop", |_| async { ExecutionResult::success(None) });
        let registry = ExecutorRegistry::new().with_fallback(
            fallback.get("noop").expect("noop executor registered"),
        );

        assert!(registry.execute(&task("anything", 1, json!({}))).await.is_ok());
    }

    #[tokio::test]
    async fn test_command_sees_frame_env() {
        let executor = CommandExecutor::new();
        let result = executor
            .execute(&task(
                "composite",
                17,
                json!({"cmd": "echo frame=$FRAME", "outdir": "/tmp/out"}),
            ))
            .await;

        let ExecutionResult::Success {
            artifact_ref,
            details,
        } = result
        else {
            panic!("expected success, got {result:?}");
        };
        assert_eq!(artifact_ref.as_deref(), Some("/tmp/out"));
        assert_eq!(details["stdout"], "frame=17\n");
        assert_eq!(details["exit_code"], 0);
    }

    #[tokio::test]
    async fn test_command_failure_and_truncation() {
        let executor = CommandExecutor::new().with_output_limit(5);
        let result = executor
            .execute(&task(
                "composite",
                1,
                json!({"cmd": "echo 0123456789 >&2; exit 3"}),
            ))
            .await;

        let ExecutionResult::Failure { details, .. } = result else {
            panic!("expected failure, got {result:?}");
        };
        assert_eq!(details["stderr"], "01234");
        assert_eq!(details["exit_code"], 3);
    }

    #[tokio::test]
    async fn test_missing_cmd_fails() {
        let result = CommandExecutor::new()
            .execute(&task("composite", 1, json!({})))
            .await;
        assert_eq!(result, ExecutionResult::failure("payload has no cmd"));
    }
}
