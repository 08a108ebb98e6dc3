//! Jobs, tasks and the values that flow between the farm components

use std::ops::RangeInclusive;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

/// Priority given to jobs submitted without one
pub const DEFAULT_PRIORITY: i32 = 5;

/// Retries granted to jobs submitted without a `max_retries`
pub const DEFAULT_MAX_RETRIES: u32 = 2;

fn default_frame() -> i64 {
    1
}

/// A job as submitted by a client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct JobSpec {
    /// Routing key for the executor (e.g. "composite", "render")
    #[schema(example = "composite")]
    pub job_type: String,

    /// Optional display name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schema(example = "shot_010_comp")]
    pub job_name: Option<String>,

    /// First unit of the range (inclusive)
    #[serde(default = "default_frame")]
    #[schema(example = 1)]
    pub start_frame: i64,

    /// Last unit of the range (inclusive). Clamped to `start_frame` when lower.
    #[serde(default = "default_frame")]
    #[schema(example = 250)]
    pub end_frame: i64,

    /// Higher is more urgent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,

    /// Opaque executor payload, copied into every task
    #[serde(default)]
    #[schema(value_type = Object)]
    pub payload: serde_json::Value,

    /// Failed attempts tolerated before a task becomes terminal
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
}

impl JobSpec {
    pub fn new(job_type: impl Into<String>, start_frame: i64, end_frame: i64) -> Self {
        Self {
            job_type: job_type.into(),
            job_name: None,
            start_frame,
            end_frame,
            priority: None,
            payload: serde_json::Value::Null,
            max_retries: None,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_job_name(mut self, name: impl Into<String>) -> Self {
        self.job_name = Some(name.into());
        self
    }
}

/// Persisted job record
///
/// Never mutated after submission except for the `decomposed` flag; the
/// displayed status is always aggregated from the job's tasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub job_type: String,
    pub job_name: Option<String>,
    pub start_frame: i64,
    pub end_frame: i64,
    pub priority: i32,
    pub payload: serde_json::Value,
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
    /// True once every task of the range exists. Tasks of undecomposed
    /// jobs are invisible to the scheduler.
    pub decomposed: bool,
}

impl Job {
    /// Build a job record from a spec, applying defaults and range clamping
    pub fn from_spec(spec: JobSpec) -> Self {
        let end_frame = spec.end_frame.max(spec.start_frame);
        Self {
            id: Uuid::now_v7(),
            job_type: spec.job_type,
            job_name: spec.job_name,
            start_frame: spec.start_frame,
            end_frame,
            priority: spec.priority.unwrap_or(DEFAULT_PRIORITY),
            payload: spec.payload,
            max_retries: spec.max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
            created_at: Utc::now(),
            decomposed: false,
        }
    }

    pub fn units(&self) -> RangeInclusive<i64> {
        self.start_frame..=self.end_frame
    }

    pub fn unit_count(&self) -> u64 {
        self.end_frame.abs_diff(self.start_frame).saturating_add(1)
    }

    /// Total claims allowed per task: the first attempt plus `max_retries`
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Task record for one unit of this job
    pub fn task_for_unit(&self, unit_index: i64) -> NewTask {
        NewTask {
            id: Uuid::now_v7(),
            job_id: self.id,
            unit_index,
            priority: self.priority,
            max_attempts: self.max_attempts(),
            payload: TaskPayload {
                job_type: self.job_type.clone(),
                unit_index,
                job_payload: self.payload.clone(),
            },
            created_at: Utc::now(),
        }
    }
}

/// Task status in the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Claimed,
    Running,
    Done,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Claimed => "claimed",
            Self::Running => "running",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "queued" => Some(Self::Queued),
            "claimed" => Some(Self::Claimed),
            "running" => Some(Self::Running),
            "done" => Some(Self::Done),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    /// Holding a lease (claimed by a scheduler or acknowledged by a worker)
    pub fn is_in_flight(&self) -> bool {
        matches!(self, Self::Claimed | Self::Running)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a worker receives for one unit of work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct TaskPayload {
    pub job_type: String,
    pub unit_index: i64,
    /// The job payload, verbatim
    #[schema(value_type = Object)]
    pub job_payload: serde_json::Value,
}

/// A task ready to be written by the decomposer
#[derive(Debug, Clone, PartialEq)]
pub struct NewTask {
    pub id: Uuid,
    pub job_id: Uuid,
    pub unit_index: i64,
    pub priority: i32,
    pub max_attempts: u32,
    pub payload: TaskPayload,
    pub created_at: DateTime<Utc>,
}

/// Full task record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Task {
    pub id: Uuid,
    pub job_id: Uuid,
    pub unit_index: i64,
    pub status: TaskStatus,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub priority: i32,
    pub payload: TaskPayload,
    #[schema(value_type = Option<Object>)]
    pub result: Option<serde_json::Value>,
    pub last_error: Option<String>,
    pub claimed_by: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn from_new(task: NewTask) -> Self {
        Self {
            id: task.id,
            job_id: task.job_id,
            unit_index: task.unit_index,
            status: TaskStatus::Queued,
            attempt_count: 0,
            max_attempts: task.max_attempts,
            priority: task.priority,
            payload: task.payload,
            result: None,
            last_error: None,
            claimed_by: None,
            claimed_at: None,
            lease_expires_at: None,
            created_at: task.created_at,
            finished_at: None,
        }
    }

    pub fn has_attempts_remaining(&self) -> bool {
        self.attempt_count < self.max_attempts
    }

    /// Lease passed without a result
    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.status.is_in_flight() && self.lease_expires_at.is_some_and(|deadline| deadline < now)
    }

    /// Queued, or holding a dead lease, with attempts left
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.has_attempts_remaining()
            && (self.status == TaskStatus::Queued || self.lease_expired(now))
    }
}

/// A task handed to a claimant, carrying the lease it holds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaimedTask {
    pub id: Uuid,
    pub job_id: Uuid,
    pub unit_index: i64,
    pub priority: i32,
    pub payload: TaskPayload,
    /// Attempt number of this claim (1-based)
    pub attempt: u32,
    pub max_attempts: u32,
    pub claimed_by: String,
    pub lease_expires_at: DateTime<Utc>,
}

impl ClaimedTask {
    pub fn job_type(&self) -> &str {
        &self.payload.job_type
    }

    /// Time left on the lease, zero once it has passed
    pub fn lease_remaining(&self) -> std::time::Duration {
        (self.lease_expires_at - Utc::now())
            .to_std()
            .unwrap_or_default()
    }
}

/// Terminal status a worker reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportStatus {
    Done,
    Failed,
}

/// Result of one execution, as written back to the store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskReport {
    pub status: ReportStatus,
    pub payload: serde_json::Value,
    pub error: Option<String>,
}

impl TaskReport {
    pub fn done(payload: serde_json::Value) -> Self {
        Self {
            status: ReportStatus::Done,
            payload,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        let error = error.into();
        Self {
            status: ReportStatus::Failed,
            payload: serde_json::json!({ "ok": false, "error": error }),
            error: Some(error),
        }
    }
}

/// What `report_result` did with a report
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportOutcome {
    /// Task is now done
    Completed,
    /// Failure recorded, task requeued for another attempt
    WillRetry { next_attempt: u32 },
    /// Failure recorded, attempts exhausted, task is terminal failed
    Exhausted,
    /// Task was already done or failed; nothing changed
    AlreadyTerminal,
    /// Failure from an attempt that no longer holds the task (requeued after
    /// lease expiry, or claimed again since)
    Ignored,
}

/// Tasks touched by one lease sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepSummary {
    /// Returned to the queue
    pub requeued: Vec<Uuid>,
    /// Lease expired on the last allowed attempt; now terminal failed
    pub exhausted: Vec<Uuid>,
}

impl SweepSummary {
    pub fn is_empty(&self) -> bool {
        self.requeued.is_empty() && self.exhausted.is_empty()
    }
}

/// Aggregated job status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Done,
    Failed,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Done => write!(f, "done"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Per-status task counts of a job. `running` covers claimed and running.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct JobStats {
    pub total: u64,
    pub done: u64,
    pub failed: u64,
    pub running: u64,
    pub queued: u64,
}

impl JobStats {
    pub fn record(&mut self, status: TaskStatus) {
        self.add(status, 1);
    }

    pub fn add(&mut self, status: TaskStatus, count: u64) {
        self.total += count;
        match status {
            TaskStatus::Queued => self.queued += count,
            TaskStatus::Claimed | TaskStatus::Running => self.running += count,
            TaskStatus::Done => self.done += count,
            TaskStatus::Failed => self.failed += count,
        }
    }

    /// `done` iff every task is done, `failed` iff any task is terminally
    /// failed, `running` once any work has started, else `pending`
    pub fn status(&self) -> JobStatus {
        if self.failed > 0 {
            JobStatus::Failed
        } else if self.total > 0 && self.done == self.total {
            JobStatus::Done
        } else if self.running > 0 || self.done > 0 {
            JobStatus::Running
        } else {
            JobStatus::Pending
        }
    }
}

/// Job status as returned to clients
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct JobStatusReport {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub stats: JobStats,
}

impl JobStatusReport {
    pub fn from_stats(job_id: Uuid, stats: JobStats) -> Self {
        Self {
            job_id,
            status: stats.status(),
            stats,
        }
    }
}
