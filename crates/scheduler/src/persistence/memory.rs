//! In-memory implementation of TaskStore

use std::cmp::Reverse;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use uuid::Uuid;

use super::store::*;
use crate::model::{
    ClaimedTask, Job, JobStats, JobStatusReport, NewTask, ReportOutcome, ReportStatus,
    SweepSummary, Task, TaskReport, TaskStatus,
};

/// Tasks plus the `(job_id, unit_index)` uniqueness index
#[derive(Default)]
struct TaskTable {
    by_id: HashMap<Uuid, Task>,
    by_unit: HashMap<(Uuid, i64), Uuid>,
}

/// Claim order: fewer attempts, higher priority, older, lower id
fn claim_key(task: &Task) -> (u32, Reverse<i32>, chrono::DateTime<Utc>, Uuid) {
    (
        task.attempt_count,
        Reverse(task.priority),
        task.created_at,
        task.id,
    )
}

fn clear_lease(task: &mut Task) {
    task.claimed_by = None;
    task.claimed_at = None;
    task.lease_expires_at = None;
}

/// In-memory implementation of TaskStore
///
/// Used by tests and single-process deployments. Same semantics as the
/// PostgreSQL implementation; the claim runs inside one write-lock critical
/// section, which is what makes it atomic.
///
/// Lock order is always `jobs` before `tasks`.
///
/// # Example
///
/// ```
/// use framefarm_scheduler::InMemoryTaskStore;
///
/// let store = InMemoryTaskStore::new();
/// assert_eq!(store.task_count(), 0);
/// ```
pub struct InMemoryTaskStore {
    jobs: RwLock<HashMap<Uuid, Job>>,
    tasks: RwLock<TaskTable>,
    insert_failures: AtomicU32,
}

impl InMemoryTaskStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            tasks: RwLock::new(TaskTable::default()),
            insert_failures: AtomicU32::new(0),
        }
    }

    /// Get the number of jobs
    pub fn job_count(&self) -> usize {
        self.jobs.read().len()
    }

    /// Get the number of tasks
    pub fn task_count(&self) -> usize {
        self.tasks.read().by_id.len()
    }

    /// All tasks of a job, ordered by unit
    pub fn tasks_for_job(&self, job_id: Uuid) -> Vec<Task> {
        let mut tasks: Vec<Task> = self
            .tasks
            .read()
            .by_id
            .values()
            .filter(|t| t.job_id == job_id)
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.unit_index);
        tasks
    }

    /// Make the next `count` calls to `insert_tasks` fail after writing
    /// half of their batch (for testing partial decomposition)
    pub fn fail_next_inserts(&self, count: u32) {
        self.insert_failures.store(count, Ordering::SeqCst);
    }

    /// Move a task's lease deadline into the past (for testing)
    pub fn expire_lease(&self, task_id: Uuid) {
        if let Some(task) = self.tasks.write().by_id.get_mut(&task_id) {
            task.lease_expires_at = Some(Utc::now() - chrono::Duration::seconds(1));
        }
    }

    /// Clear all data (for testing)
    pub fn clear(&self) {
        self.jobs.write().clear();
        let mut tasks = self.tasks.write();
        tasks.by_id.clear();
        tasks.by_unit.clear();
    }

    fn take_insert_failure(&self) -> bool {
        self.insert_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn decomposed_jobs(&self) -> HashSet<Uuid> {
        self.jobs
            .read()
            .values()
            .filter(|j| j.decomposed)
            .map(|j| j.id)
            .collect()
    }

    fn insert_into(table: &mut TaskTable, tasks: &[NewTask]) -> u64 {
        let mut inserted = 0;
        for new_task in tasks {
            let key = (new_task.job_id, new_task.unit_index);
            if table.by_unit.contains_key(&key) {
                continue;
            }
            table.by_unit.insert(key, new_task.id);
            table
                .by_id
                .insert(new_task.id, Task::from_new(new_task.clone()));
            inserted += 1;
        }
        inserted
    }
}

impl Default for InMemoryTaskStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn create_job(&self, job: &Job) -> Result<(), StoreError> {
        self.jobs.write().insert(job.id, job.clone());
        Ok(())
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Job, StoreError> {
        self.jobs
            .read()
            .get(&job_id)
            .cloned()
            .ok_or(StoreError::JobNotFound(job_id))
    }

    async fn mark_job_decomposed(&self, job_id: Uuid) -> Result<(), StoreError> {
        let mut jobs = self.jobs.write();
        let job = jobs
            .get_mut(&job_id)
            .ok_or(StoreError::JobNotFound(job_id))?;
        job.decomposed = true;
        Ok(())
    }

    async fn list_undecomposed_jobs(&self) -> Result<Vec<Job>, StoreError> {
        let mut jobs: Vec<Job> = self
            .jobs
            .read()
            .values()
            .filter(|j| !j.decomposed)
            .cloned()
            .collect();
        jobs.sort_by_key(|j| (j.created_at, j.id));
        Ok(jobs)
    }

    async fn existing_units(&self, job_id: Uuid) -> Result<HashSet<i64>, StoreError> {
        Ok(self
            .tasks
            .read()
            .by_unit
            .keys()
            .filter(|(job, _)| *job == job_id)
            .map(|(_, unit)| *unit)
            .collect())
    }

    async fn job_status(&self, job_id: Uuid) -> Result<JobStatusReport, StoreError> {
        if !self.jobs.read().contains_key(&job_id) {
            return Err(StoreError::JobNotFound(job_id));
        }

        let mut stats = JobStats::default();
        for task in self.tasks.read().by_id.values() {
            if task.job_id == job_id {
                stats.record(task.status);
            }
        }
        Ok(JobStatusReport::from_stats(job_id, stats))
    }

    async fn cancel_job(&self, job_id: Uuid) -> Result<u64, StoreError> {
        if !self.jobs.read().contains_key(&job_id) {
            return Err(StoreError::JobNotFound(job_id));
        }

        let now = Utc::now();
        let mut cancelled = 0;
        for task in self.tasks.write().by_id.values_mut() {
            if task.job_id == job_id && task.status == TaskStatus::Queued {
                task.status = TaskStatus::Failed;
                task.last_error = Some(CANCELLED_ERROR.to_string());
                task.finished_at = Some(now);
                cancelled += 1;
            }
        }
        Ok(cancelled)
    }

    async fn insert_tasks(&self, tasks: &[NewTask]) -> Result<u64, StoreError> {
        let mut table = self.tasks.write();

        if self.take_insert_failure() {
            Self::insert_into(&mut table, &tasks[..tasks.len() / 2]);
            return Err(StoreError::Database("injected insert failure".to_string()));
        }

        Ok(Self::insert_into(&mut table, tasks))
    }

    async fn claim_next(
        &self,
        claimant: &str,
        lease: Duration,
    ) -> Result<Option<ClaimedTask>, StoreError> {
        let decomposed = self.decomposed_jobs();
        let now = Utc::now();

        let mut table = self.tasks.write();
        let Some(task) = table
            .by_id
            .values_mut()
            .filter(|t| decomposed.contains(&t.job_id) && t.is_claimable(now))
            .min_by_key(|t| claim_key(t))
        else {
            return Ok(None);
        };

        let lease_expires_at = lease_deadline(now, lease);
        task.status = TaskStatus::Claimed;
        task.attempt_count += 1;
        task.claimed_by = Some(claimant.to_string());
        task.claimed_at = Some(now);
        task.lease_expires_at = Some(lease_expires_at);

        Ok(Some(ClaimedTask {
            id: task.id,
            job_id: task.job_id,
            unit_index: task.unit_index,
            priority: task.priority,
            payload: task.payload.clone(),
            attempt: task.attempt_count,
            max_attempts: task.max_attempts,
            claimed_by: claimant.to_string(),
            lease_expires_at,
        }))
    }

    async fn mark_running(&self, task_id: Uuid, attempt: u32) -> Result<bool, StoreError> {
        let mut table = self.tasks.write();
        let task = table
            .by_id
            .get_mut(&task_id)
            .ok_or(StoreError::TaskNotFound(task_id))?;

        if task.status != TaskStatus::Claimed || task.attempt_count != attempt {
            return Ok(false);
        }
        task.status = TaskStatus::Running;
        Ok(true)
    }

    async fn release_claim(&self, task_id: Uuid, attempt: u32) -> Result<bool, StoreError> {
        let mut table = self.tasks.write();
        let task = table
            .by_id
            .get_mut(&task_id)
            .ok_or(StoreError::TaskNotFound(task_id))?;

        if !task.status.is_in_flight() || task.attempt_count != attempt {
            return Ok(false);
        }
        task.status = TaskStatus::Queued;
        clear_lease(task);
        Ok(true)
    }

    async fn report_result(
        &self,
        task_id: Uuid,
        attempt: u32,
        report: TaskReport,
    ) -> Result<ReportOutcome, StoreError> {
        let mut table = self.tasks.write();
        let task = table
            .by_id
            .get_mut(&task_id)
            .ok_or(StoreError::TaskNotFound(task_id))?;

        if task.status.is_terminal() {
            return Ok(ReportOutcome::AlreadyTerminal);
        }

        let now = Utc::now();
        match report.status {
            ReportStatus::Done => {
                task.status = TaskStatus::Done;
                task.result = Some(report.payload);
                task.finished_at = Some(now);
                task.lease_expires_at = None;
                Ok(ReportOutcome::Completed)
            }
            ReportStatus::Failed => {
                if !task.status.is_in_flight() || task.attempt_count != attempt {
                    return Ok(ReportOutcome::Ignored);
                }

                task.result = Some(report.payload);
                task.last_error = report.error;
                if task.has_attempts_remaining() {
                    task.status = TaskStatus::Queued;
                    clear_lease(task);
                    Ok(ReportOutcome::WillRetry {
                        next_attempt: task.attempt_count + 1,
                    })
                } else {
                    task.status = TaskStatus::Failed;
                    task.finished_at = Some(now);
                    task.lease_expires_at = None;
                    Ok(ReportOutcome::Exhausted)
                }
            }
        }
    }

    async fn sweep_expired_claims(&self) -> Result<SweepSummary, StoreError> {
        let now = Utc::now();
        let mut summary = SweepSummary::default();

        for task in self.tasks.write().by_id.values_mut() {
            if !task.lease_expired(now) {
                continue;
            }

            if task.has_attempts_remaining() {
                task.status = TaskStatus::Queued;
                clear_lease(task);
                summary.requeued.push(task.id);
            } else {
                task.status = TaskStatus::Failed;
                task.last_error = Some(LEASE_EXPIRED_ERROR.to_string());
                task.finished_at = Some(now);
                task.lease_expires_at = None;
                summary.exhausted.push(task.id);
            }
        }

        Ok(summary)
    }

    async fn get_task(&self, task_id: Uuid) -> Result<Task, StoreError> {
        self.tasks
            .read()
            .by_id
            .get(&task_id)
            .cloned()
            .ok_or(StoreError::TaskNotFound(task_id))
    }

    async fn count_pending(&self) -> Result<u64, StoreError> {
        let decomposed = self.decomposed_jobs();
        Ok(self
            .tasks
            .read()
            .by_id
            .values()
            .filter(|t| t.status == TaskStatus::Queued && decomposed.contains(&t.job_id))
            .count() as u64)
    }

    async fn list_pending(&self, limit: usize) -> Result<Vec<Task>, StoreError> {
        let decomposed = self.decomposed_jobs();
        let mut pending: Vec<Task> = self
            .tasks
            .read()
            .by_id
            .values()
            .filter(|t| t.status == TaskStatus::Queued && decomposed.contains(&t.job_id))
            .cloned()
            .collect();
        pending.sort_by_key(claim_key);
        pending.truncate(limit);
        Ok(pending)
    }
}
