//! Job decomposition
//!
//! Splits a submitted job into one task per unit and writes the tasks in
//! batches. A job only becomes visible to schedulers once every unit has a
//! task; a submission that dies halfway is finished by [`JobDecomposer::repair_incomplete`].

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::{debug, error, info, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::model::{Job, JobSpec, NewTask};
use crate::persistence::{StoreError, TaskStore};
use crate::reliability::RetryPolicy;

/// Largest frame range a single submission may expand into
pub const MAX_UNITS_PER_JOB: u64 = 1_000_000;

/// Largest `max_retries` a submission may ask for
pub const MAX_RETRIES_PER_JOB: u32 = 1_000;

/// Decomposer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecomposerConfig {
    /// Tasks written per insert statement
    pub batch_size: usize,

    /// Retry policy for each batch
    pub retry_policy: RetryPolicy,
}

impl Default for DecomposerConfig {
    fn default() -> Self {
        Self {
            batch_size: 500,
            retry_policy: RetryPolicy::exponential(),
        }
    }
}

impl DecomposerConfig {
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }
}

/// Decomposition errors
#[derive(Debug, thiserror::Error)]
pub enum DecomposeError {
    /// The job spec was rejected before anything was written
    #[error("invalid job: {0}")]
    InvalidJob(String),

    /// Persistence failed after retries; the job stays hidden until repaired
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Acknowledgement of an accepted job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct SubmittedJob {
    pub job_id: Uuid,
    pub task_count: u64,
}

/// Splits jobs into tasks and writes them to the store
pub struct JobDecomposer {
    store: Arc<dyn TaskStore>,
    config: DecomposerConfig,
    wake: Option<Arc<Notify>>,
}

impl JobDecomposer {
    pub fn new(store: Arc<dyn TaskStore>, config: DecomposerConfig) -> Self {
        Self {
            store,
            config,
            wake: None,
        }
    }

    /// Notify a scheduler whenever new tasks become claimable
    pub fn with_wake(mut self, wake: Arc<Notify>) -> Self {
        self.wake = Some(wake);
        self
    }

    pub fn config(&self) -> &DecomposerConfig {
        &self.config
    }

    /// Validate, persist and decompose a job
    #[instrument(skip(self, spec), fields(job_type = %spec.job_type))]
    pub async fn submit(&self, spec: JobSpec) -> Result<SubmittedJob, DecomposeError> {
        validate(&spec)?;

        let job = Job::from_spec(spec);
        self.store.create_job(&job).await?;

        let inserted = self.write_missing(&job).await?;
        self.store.mark_job_decomposed(job.id).await?;
        self.notify();

        info!(
            job_id = %job.id,
            units = job.unit_count(),
            inserted,
            priority = job.priority,
            "job decomposed"
        );

        Ok(SubmittedJob {
            job_id: job.id,
            task_count: job.unit_count(),
        })
    }

    /// Finish every job whose decomposition was interrupted
    ///
    /// Returns the number of jobs repaired. A job that still cannot be written
    /// is logged and left for the next pass.
    #[instrument(skip(self))]
    pub async fn repair_incomplete(&self) -> Result<usize, StoreError> {
        let jobs = self.store.list_undecomposed_jobs().await?;
        let mut repaired = 0;

        for job in jobs {
            match self.write_missing(&job).await {
                Ok(inserted) => {
                    self.store.mark_job_decomposed(job.id).await?;
                    repaired += 1;
                    info!(job_id = %job.id, inserted, "repaired partially decomposed job");
                }
                Err(e) => {
                    error!(job_id = %job.id, "Failed to repair job: {}", e);
                }
            }
        }

        if repaired > 0 {
            self.notify();
        }
        Ok(repaired)
    }

    /// Insert tasks for every unit that has none yet
    async fn write_missing(&self, job: &Job) -> Result<u64, StoreError> {
        let existing = self.store.existing_units(job.id).await?;
        let missing: Vec<i64> = job.units().filter(|u| !existing.contains(u)).collect();
        if missing.is_empty() {
            return Ok(0);
        }

        let mut inserted = 0;
        for chunk in missing.chunks(self.config.batch_size.max(1)) {
            let batch: Vec<NewTask> = chunk.iter().map(|&u| job.task_for_unit(u)).collect();
            let written = self
                .config
                .retry_policy
                .retry("insert task batch", |_| self.store.insert_tasks(&batch))
                .await
                .inspect_err(|e| warn!(job_id = %job.id, "Giving up on task batch: {}", e))?;
            inserted += written;
            debug!(job_id = %job.id, written, "wrote task batch");
        }
        Ok(inserted)
    }

    fn notify(&self) {
        if let Some(wake) = &self.wake {
            wake.notify_one();
        }
    }
}

fn validate(spec: &JobSpec) -> Result<(), DecomposeError> {
    if spec.job_type.trim().is_empty() {
        return Err(DecomposeError::InvalidJob(
            "job_type must not be empty".to_string(),
        ));
    }
    let units = spec
        .end_frame
        .max(spec.start_frame)
        .abs_diff(spec.start_frame)
        .saturating_add(1);
    if let Some(max_retries) = spec.max_retries.filter(|&r| r > MAX_RETRIES_PER_JOB) {
        return Err(DecomposeError::InvalidJob(format!(
            "max_retries {max_retries} exceeds the limit of {MAX_RETRIES_PER_JOB}"
        )));
    }
    if units > MAX_UNITS_PER_JOB {
        return Err(DecomposeError::InvalidJob(format!(
            "frame range expands to {units} tasks, limit is {MAX_UNITS_PER_JOB}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::model::{JobStatus, TaskStatus};
    use crate::persistence::InMemoryTaskStore;

    fn fast_retries() -> DecomposerConfig {
        DecomposerConfig::default()
            .with_retry_policy(RetryPolicy::fixed(Duration::from_millis(1), 3))
    }

    #[tokio::test]
    async fn test_submit_creates_one_task_per_unit() {
        let store = Arc::new(InMemoryTaskStore::new());
        let decomposer = JobDecomposer::new(store.clone(), DecomposerConfig::default());

        let submitted = decomposer
            .submit(JobSpec::new("composite", 1, 250))
            .await
            .unwrap();
        assert_eq!(submitted.task_count, 250);
        assert_eq!(store.task_count(), 250);

        let job = store.get_job(submitted.job_id).await.unwrap();
        assert!(job.decomposed);

        let units: Vec<i64> = store
            .tasks_for_job(submitted.job_id)
            .iter()
            .map(|t| t.unit_index)
            .collect();
        assert_eq!(units, (1..=250).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_inverted_range_yields_single_task() {
        let store = Arc::new(InMemoryTaskStore::new());
        let decomposer = JobDecomposer::new(store.clone(), DecomposerConfig::default());

        let submitted = decomposer.submit(JobSpec::new("render", 10, 8)).await.unwrap();
        assert_eq!(submitted.task_count, 1);

        let tasks = store.tasks_for_job(submitted.job_id);
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].unit_index, 10);
        assert_eq!(tasks[0].status, TaskStatus::Queued);
    }

    #[tokio::test]
    async fn test_empty_job_type_rejected() {
        let store = Arc::new(InMemoryTaskStore::new());
        let decomposer = JobDecomposer::new(store.clone(), DecomposerConfig::default());

        let err = decomposer.submit(JobSpec::new("  ", 1, 5)).await.unwrap_err();
        assert!(matches!(err, DecomposeError::InvalidJob(_)));
        assert_eq!(store.job_count(), 0);
    }

    #[tokio::test]
    async fn test_oversized_range_rejected() {
        let store = Arc::new(InMemoryTaskStore::new());
        let decomposer = JobDecomposer::new(store.clone(), DecomposerConfig::default());

        let err = decomposer
            .submit(JobSpec::new("render", i64::MIN, i64::MAX))
            .await
            .unwrap_err();
        assert!(matches!(err, DecomposeError::InvalidJob(_)));
        assert_eq!(store.job_count(), 0);
    }

    #[tokio::test]
    async fn test_excessive_max_retries_rejected() {
        let store = Arc::new(InMemoryTaskStore::new());
        let decomposer = JobDecomposer::new(store.clone(), DecomposerConfig::default());

        let err = decomposer
            .submit(JobSpec::new("render", 1, 3).with_max_retries(u32::MAX))
            .await
            .unwrap_err();
        assert!(matches!(err, DecomposeError::InvalidJob(_)));
        assert_eq!(store.job_count(), 0);

        let submitted = decomposer
            .submit(JobSpec::new("render", 1, 3).with_max_retries(MAX_RETRIES_PER_JOB))
            .await
            .unwrap();
        let job = store.get_job(submitted.job_id).await.unwrap();
        assert_eq!(job.max_attempts(), MAX_RETRIES_PER_JOB + 1);
    }

    #[tokio::test]
    async fn test_batches_retry_without_duplicates() {
        let store = Arc::new(InMemoryTaskStore::new());
        let decomposer = JobDecomposer::new(store.clone(), fast_retries().with_batch_size(4));

        store.fail_next_inserts(2);
        let submitted = decomposer.submit(JobSpec::new("render", 1, 10)).await.unwrap();

        assert_eq!(store.task_count(), 10);
        let status = store.job_status(submitted.job_id).await.unwrap();
        assert_eq!(status.stats.queued, 10);
        assert_eq!(status.status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn test_exhausted_retries_hide_job_until_repaired() {
        let store = Arc::new(InMemoryTaskStore::new());
        let decomposer = JobDecomposer::new(store.clone(), fast_retries());

        store.fail_next_inserts(3);
        let err = decomposer.submit(JobSpec::new("render", 1, 6)).await.unwrap_err();
        assert!(matches!(err, DecomposeError::Store(_)));

        // Partial rows exist but nothing is claimable
        assert!(store.task_count() > 0);
        assert_eq!(store.count_pending().await.unwrap(), 0);
        assert!(store
            .claim_next("s1", Duration::from_secs(60))
            .await
            .unwrap()
            .is_none());

        assert_eq!(decomposer.repair_incomplete().await.unwrap(), 1);
        assert_eq!(store.task_count(), 6);
        assert_eq!(store.count_pending().await.unwrap(), 6);
        assert_eq!(decomposer.repair_incomplete().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_submit_wakes_scheduler() {
        let store = Arc::new(InMemoryTaskStore::new());
        let wake = Arc::new(Notify::new());
        let decomposer =
            JobDecomposer::new(store, DecomposerConfig::default()).with_wake(wake.clone());

        decomposer.submit(JobSpec::new("render", 1, 1)).await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), wake.notified())
            .await
            .expect("submission should wake the scheduler");
    }
}
