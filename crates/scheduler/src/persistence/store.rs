//! TaskStore trait definition

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::model::{
    ClaimedTask, Job, JobStatusReport, NewTask, ReportOutcome, SweepSummary, Task, TaskReport,
};

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Job not found
    #[error("job not found: {0}")]
    JobNotFound(Uuid),

    /// Task not found
    #[error("task not found: {0}")]
    TaskNotFound(Uuid),

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Error recorded on tasks whose last lease ran out
pub const LEASE_EXPIRED_ERROR: &str = "lease expired";

/// Error recorded on queued tasks failed by job cancellation
pub const CANCELLED_ERROR: &str = "cancelled";

/// Lease deadline for a claim made at `now`, saturating instead of overflowing
pub(crate) fn lease_deadline(now: DateTime<Utc>, lease: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(lease)
        .ok()
        .and_then(|lease| now.checked_add_signed(lease))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Durable record of jobs and their tasks
///
/// Implementations must be thread-safe and support concurrent access from
/// several scheduler instances. `claim_next` is the only operation that needs
/// mutual exclusion and must be atomic at the storage level.
#[async_trait]
pub trait TaskStore: Send + Sync + 'static {
    // =========================================================================
    // Job Operations
    // =========================================================================

    /// Persist a job record (tasks are inserted separately)
    async fn create_job(&self, job: &Job) -> Result<(), StoreError>;

    /// Get a job record
    async fn get_job(&self, job_id: Uuid) -> Result<Job, StoreError>;

    /// Flag a job as fully decomposed, making its tasks claimable
    async fn mark_job_decomposed(&self, job_id: Uuid) -> Result<(), StoreError>;

    /// Jobs whose decomposition never finished
    async fn list_undecomposed_jobs(&self) -> Result<Vec<Job>, StoreError>;

    /// Unit indices that already have a task
    async fn existing_units(&self, job_id: Uuid) -> Result<HashSet<i64>, StoreError>;

    /// Aggregate task states of a job
    async fn job_status(&self, job_id: Uuid) -> Result<JobStatusReport, StoreError>;

    /// Fail every queued task of a job. In-flight tasks are left alone.
    ///
    /// Returns the number of tasks cancelled.
    async fn cancel_job(&self, job_id: Uuid) -> Result<u64, StoreError>;

    // =========================================================================
    // Task Operations
    // =========================================================================

    /// Insert tasks, skipping units that already exist for their job
    ///
    /// Returns the number of rows actually inserted.
    async fn insert_tasks(&self, tasks: &[NewTask]) -> Result<u64, StoreError>;

    /// Claim the next eligible task
    ///
    /// Eligible: belongs to a decomposed job, has attempts remaining, and is
    /// either queued or holds an expired lease. Ordered by attempt count
    /// ascending, priority descending, creation ascending, id ascending.
    /// The claim sets a fresh lease and increments the attempt count.
    ///
    /// No two concurrent calls return the same task. Returns `None` when
    /// nothing is claimable (including when a race was lost).
    async fn claim_next(
        &self,
        claimant: &str,
        lease: Duration,
    ) -> Result<Option<ClaimedTask>, StoreError>;

    /// Acknowledge dispatch: `claimed` → `running` for the given attempt
    ///
    /// Returns false when the task moved on (stale acknowledgement).
    async fn mark_running(&self, task_id: Uuid, attempt: u32) -> Result<bool, StoreError>;

    /// Return a claim that could not be dispatched to the queue
    ///
    /// The attempt stays counted. Returns false when the claim is no longer held.
    async fn release_claim(&self, task_id: Uuid, attempt: u32) -> Result<bool, StoreError>;

    /// Record the result of attempt `attempt`
    ///
    /// Never changes the attempt count. Reports for terminal tasks are no-ops.
    /// A failure from any attempt but the one in flight is `Ignored`, so a
    /// late report cannot requeue a task another claimant holds.
    async fn report_result(
        &self,
        task_id: Uuid,
        attempt: u32,
        report: TaskReport,
    ) -> Result<ReportOutcome, StoreError>;

    /// Requeue (or exhaust) in-flight tasks whose lease has passed
    async fn sweep_expired_claims(&self) -> Result<SweepSummary, StoreError>;

    /// Get a single task
    async fn get_task(&self, task_id: Uuid) -> Result<Task, StoreError>;

    /// Number of queued tasks of decomposed jobs
    async fn count_pending(&self) -> Result<u64, StoreError>;

    /// Queued tasks of decomposed jobs, in claim order
    async fn list_pending(&self, limit: usize) -> Result<Vec<Task>, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lease_deadline_saturates() {
        let now = Utc::now();
        assert_eq!(
            lease_deadline(now, Duration::from_secs(300)),
            now + chrono::Duration::seconds(300)
        );
        assert_eq!(
            lease_deadline(now, Duration::MAX),
            DateTime::<Utc>::MAX_UTC
        );
    }
}
