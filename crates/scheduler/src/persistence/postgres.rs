//! PostgreSQL implementation of TaskStore
//!
//! Production persistence using PostgreSQL with:
//! - Claiming via `FOR UPDATE SKIP LOCKED` in a single statement
//! - Idempotent batch inserts on `(job_id, unit_index)`
//! - Row-locked result reporting

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use tracing::{debug, error, info, instrument};
use uuid::Uuid;

use super::store::*;
use crate::model::{
    ClaimedTask, Job, JobStats, JobStatusReport, NewTask, ReportOutcome, ReportStatus,
    SweepSummary, Task, TaskPayload, TaskReport, TaskStatus,
};

/// Longest lease Postgres is asked to add to `NOW()` (about ten years)
const MAX_LEASE_SECS: f64 = 10.0 * 365.0 * 24.0 * 3600.0;

const TASK_COLUMNS: &str = "t.id, t.job_id, t.unit_index, t.status, t.attempt_count, \
    t.max_attempts, t.priority, t.payload, t.result, t.last_error, t.claimed_by, \
    t.claimed_at, t.lease_expires_at, t.created_at, t.finished_at";

fn db_error(context: &'static str) -> impl Fn(sqlx::Error) -> StoreError {
    move |e| {
        error!("Failed to {}: {}", context, e);
        StoreError::Database(e.to_string())
    }
}

/// Counters are `u32` in Rust and `INTEGER` in the schema
fn db_int(value: u32, field: &'static str) -> Result<i32, StoreError> {
    i32::try_from(value)
        .map_err(|_| StoreError::Serialization(format!("{field} {value} exceeds INTEGER range")))
}

fn parse_status(value: &str) -> Result<TaskStatus, StoreError> {
    TaskStatus::parse(value)
        .ok_or_else(|| StoreError::Serialization(format!("unknown task status: {value}")))
}

fn parse_payload(value: serde_json::Value) -> Result<TaskPayload, StoreError> {
    serde_json::from_value(value).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn job_from_row(row: &PgRow) -> Job {
    Job {
        id: row.get("id"),
        job_type: row.get("job_type"),
        job_name: row.get("job_name"),
        start_frame: row.get("start_frame"),
        end_frame: row.get("end_frame"),
        priority: row.get("priority"),
        payload: row.get("payload"),
        max_retries: row.get::<i32, _>("max_retries") as u32,
        created_at: row.get("created_at"),
        decomposed: row.get("decomposed"),
    }
}

fn task_from_row(row: &PgRow) -> Result<Task, StoreError> {
    let status: String = row.get("status");
    Ok(Task {
        id: row.get("id"),
        job_id: row.get("job_id"),
        unit_index: row.get("unit_index"),
        status: parse_status(&status)?,
        attempt_count: row.get::<i32, _>("attempt_count") as u32,
        max_attempts: row.get::<i32, _>("max_attempts") as u32,
        priority: row.get("priority"),
        payload: parse_payload(row.get("payload"))?,
        result: row.get("result"),
        last_error: row.get("last_error"),
        claimed_by: row.get("claimed_by"),
        claimed_at: row.get("claimed_at"),
        lease_expires_at: row.get("lease_expires_at"),
        created_at: row.get("created_at"),
        finished_at: row.get("finished_at"),
    })
}

/// PostgreSQL implementation of TaskStore
///
/// Safe to share between any number of scheduler instances and processes.
///
/// # Example
///
/// ```ignore
/// use framefarm_scheduler::PostgresTaskStore;
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://localhost/framefarm").await?;
/// let store = PostgresTaskStore::new(pool);
/// store.migrate().await?;
/// ```
#[derive(Clone)]
pub struct PostgresTaskStore {
    pool: PgPool,
}

impl PostgresTaskStore {
    /// Create a new PostgreSQL store with the given connection pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the bundled schema migrations
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to run migrations: {}", e);
                StoreError::Database(e.to_string())
            })?;
        info!("task store migrations applied");
        Ok(())
    }

    async fn job_exists(&self, job_id: Uuid) -> Result<bool, StoreError> {
        sqlx::query_scalar::<_, bool>("SELECT EXISTS (SELECT 1 FROM farm_jobs WHERE id = $1)")
            .bind(job_id)
            .fetch_one(&self.pool)
            .await
            .map_err(db_error("check job"))
    }

    async fn ensure_task_exists(&self, task_id: Uuid) -> Result<(), StoreError> {
        let exists = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS (SELECT 1 FROM farm_tasks WHERE id = $1)",
        )
        .bind(task_id)
        .fetch_one(&self.pool)
        .await
        .map_err(db_error("check task"))?;

        if exists {
            Ok(())
        } else {
            Err(StoreError::TaskNotFound(task_id))
        }
    }
}

#[async_trait]
impl TaskStore for PostgresTaskStore {
    #[instrument(skip(self, job), fields(job_id = %job.id))]
    async fn create_job(&self, job: &Job) -> Result<(), StoreError> {
        let max_retries = db_int(job.max_retries, "max_retries")?;
        sqlx::query(
            r#"
            INSERT INTO farm_jobs (id, job_type, job_name, start_frame, end_frame,
                                   priority, payload, max_retries, decomposed, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(job.id)
        .bind(&job.job_type)
        .bind(&job.job_name)
        .bind(job.start_frame)
        .bind(job.end_frame)
        .bind(job.priority)
        .bind(&job.payload)
        .bind(max_retries)
        .bind(job.decomposed)
        .bind(job.created_at)
        .execute(&self.pool)
        .await
        .map_err(db_error("create job"))?;

        debug!(job_id = %job.id, job_type = %job.job_type, "created job");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_job(&self, job_id: Uuid) -> Result<Job, StoreError> {
        let row = sqlx::query("SELECT * FROM farm_jobs WHERE id = $1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error("get job"))?
            .ok_or(StoreError::JobNotFound(job_id))?;

        Ok(job_from_row(&row))
    }

    #[instrument(skip(self))]
    async fn mark_job_decomposed(&self, job_id: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE farm_jobs SET decomposed = TRUE WHERE id = $1")
            .bind(job_id)
            .execute(&self.pool)
            .await
            .map_err(db_error("mark job decomposed"))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::JobNotFound(job_id));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn list_undecomposed_jobs(&self) -> Result<Vec<Job>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM farm_jobs WHERE NOT decomposed ORDER BY created_at, id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("list undecomposed jobs"))?;

        Ok(rows.iter().map(job_from_row).collect())
    }

    #[instrument(skip(self))]
    async fn existing_units(&self, job_id: Uuid) -> Result<HashSet<i64>, StoreError> {
        let units = sqlx::query_scalar::<_, i64>(
            "SELECT unit_index FROM farm_tasks WHERE job_id = $1",
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("load existing units"))?;

        Ok(units.into_iter().collect())
    }

    #[instrument(skip(self))]
    async fn job_status(&self, job_id: Uuid) -> Result<JobStatusReport, StoreError> {
        if !self.job_exists(job_id).await? {
            return Err(StoreError::JobNotFound(job_id));
        }

        let rows = sqlx::query(
            r#"
            SELECT status, COUNT(*) AS n
            FROM farm_tasks
            WHERE job_id = $1
            GROUP BY status
            "#,
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("aggregate job status"))?;

        let mut stats = JobStats::default();
        for row in rows {
            let status: String = row.get("status");
            let count: i64 = row.get("n");
            stats.add(parse_status(&status)?, count as u64);
        }

        Ok(JobStatusReport::from_stats(job_id, stats))
    }

    #[instrument(skip(self))]
    async fn cancel_job(&self, job_id: Uuid) -> Result<u64, StoreError> {
        if !self.job_exists(job_id).await? {
            return Err(StoreError::JobNotFound(job_id));
        }

        let result = sqlx::query(
            r#"
            UPDATE farm_tasks
            SET status = 'failed',
                last_error = $2,
                finished_at = NOW()
            WHERE job_id = $1 AND status = 'queued'
            "#,
        )
        .bind(job_id)
        .bind(CANCELLED_ERROR)
        .execute(&self.pool)
        .await
        .map_err(db_error("cancel job"))?;

        Ok(result.rows_affected())
    }

    #[instrument(skip(self, tasks), fields(count = tasks.len()))]
    async fn insert_tasks(&self, tasks: &[NewTask]) -> Result<u64, StoreError> {
        if tasks.is_empty() {
            return Ok(0);
        }

        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO farm_tasks (id, job_id, unit_index, status, attempt_count, \
             max_attempts, priority, payload, created_at) ",
        );
        let mut rows = Vec::with_capacity(tasks.len());
        for task in tasks {
            let payload = serde_json::to_value(&task.payload)
                .map_err(|e| StoreError::Serialization(e.to_string()))?;
            rows.push((payload, db_int(task.max_attempts, "max_attempts")?));
        }
        builder.push_values(tasks.iter().zip(rows), |mut b, (task, (payload, max_attempts))| {
            b.push_bind(task.id)
                .push_bind(task.job_id)
                .push_bind(task.unit_index)
                .push_bind(TaskStatus::Queued.as_str())
                .push_bind(0_i32)
                .push_bind(max_attempts)
                .push_bind(task.priority)
                .push_bind(payload)
                .push_bind(task.created_at);
        });
        builder.push(" ON CONFLICT (job_id, unit_index) DO NOTHING");

        let result = builder
            .build()
            .execute(&self.pool)
            .await
            .map_err(db_error("insert tasks"))?;

        Ok(result.rows_affected())
    }

    #[instrument(skip(self))]
    async fn claim_next(
        &self,
        claimant: &str,
        lease: Duration,
    ) -> Result<Option<ClaimedTask>, StoreError> {
        // Lock only the task row (OF t) so claimers of the same job never
        // skip each other's candidates.
        let row = sqlx::query(
            r#"
            WITH claimable AS (
                SELECT t.id
                FROM farm_tasks t
                JOIN farm_jobs j ON j.id = t.job_id
                WHERE j.decomposed
                  AND t.attempt_count < t.max_attempts
                  AND (t.status = 'queued'
                       OR (t.status IN ('claimed', 'running') AND t.lease_expires_at < NOW()))
                ORDER BY t.attempt_count ASC, t.priority DESC, t.created_at ASC, t.id ASC
                LIMIT 1
                FOR UPDATE OF t SKIP LOCKED
            )
            UPDATE farm_tasks t
            SET status = 'claimed',
                claimed_by = $1,
                claimed_at = NOW(),
                lease_expires_at = NOW() + make_interval(secs => $2),
                attempt_count = t.attempt_count + 1
            FROM claimable c
            WHERE t.id = c.id
            RETURNING t.id, t.job_id, t.unit_index, t.priority, t.payload,
                      t.attempt_count, t.max_attempts, t.lease_expires_at
            "#,
        )
        .bind(claimant)
        .bind(lease.as_secs_f64().min(MAX_LEASE_SECS))
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("claim task"))?;

        let Some(row) = row else {
            return Ok(None);
        };

        let claimed = ClaimedTask {
            id: row.get("id"),
            job_id: row.get("job_id"),
            unit_index: row.get("unit_index"),
            priority: row.get("priority"),
            payload: parse_payload(row.get("payload"))?,
            attempt: row.get::<i32, _>("attempt_count") as u32,
            max_attempts: row.get::<i32, _>("max_attempts") as u32,
            claimed_by: claimant.to_string(),
            lease_expires_at: row.get("lease_expires_at"),
        };

        debug!(task_id = %claimed.id, attempt = claimed.attempt, "claimed task");
        Ok(Some(claimed))
    }

    #[instrument(skip(self))]
    async fn mark_running(&self, task_id: Uuid, attempt: u32) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE farm_tasks
            SET status = 'running'
            WHERE id = $1 AND status = 'claimed' AND attempt_count = $2
            "#,
        )
        .bind(task_id)
        .bind(db_int(attempt, "attempt")?)
        .execute(&self.pool)
        .await
        .map_err(db_error("mark task running"))?;

        if result.rows_affected() == 0 {
            self.ensure_task_exists(task_id).await?;
            return Ok(false);
        }
        Ok(true)
    }

    #[instrument(skip(self))]
    async fn release_claim(&self, task_id: Uuid, attempt: u32) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE farm_tasks
            SET status = 'queued',
                claimed_by = NULL,
                claimed_at = NULL,
                lease_expires_at = NULL
            WHERE id = $1
              AND status IN ('claimed', 'running')
              AND attempt_count = $2
            "#,
        )
        .bind(task_id)
        .bind(db_int(attempt, "attempt")?)
        .execute(&self.pool)
        .await
        .map_err(db_error("release claim"))?;

        if result.rows_affected() == 0 {
            self.ensure_task_exists(task_id).await?;
            return Ok(false);
        }
        Ok(true)
    }

    #[instrument(skip(self, report), fields(status = ?report.status))]
    async fn report_result(
        &self,
        task_id: Uuid,
        attempt: u32,
        report: TaskReport,
    ) -> Result<ReportOutcome, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_error("begin report"))?;

        let row = sqlx::query(
            r#"
            SELECT status, attempt_count, max_attempts
            FROM farm_tasks
            WHERE id = $1
            FOR UPDATE
            "#,
        )
        .bind(task_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_error("lock task for report"))?
        .ok_or(StoreError::TaskNotFound(task_id))?;

        let status: String = row.get("status");
        let status = parse_status(&status)?;
        let attempt_count = row.get::<i32, _>("attempt_count") as u32;
        let max_attempts = row.get::<i32, _>("max_attempts") as u32;

        if status.is_terminal() {
            return Ok(ReportOutcome::AlreadyTerminal);
        }

        let outcome = match report.status {
            ReportStatus::Done => {
                sqlx::query(
                    r#"
                    UPDATE farm_tasks
                    SET status = 'done',
                        result = $2,
                        finished_at = NOW(),
                        lease_expires_at = NULL
                    WHERE id = $1
                    "#,
                )
                .bind(task_id)
                .bind(&report.payload)
                .execute(&mut *tx)
                .await
                .map_err(db_error("complete task"))?;
                ReportOutcome::Completed
            }
            ReportStatus::Failed if !status.is_in_flight() || attempt_count != attempt => {
                ReportOutcome::Ignored
            }
            ReportStatus::Failed if attempt_count < max_attempts => {
                sqlx::query(
                    r#"
                    UPDATE farm_tasks
                    SET status = 'queued',
                        result = $2,
                        last_error = $3,
                        claimed_by = NULL,
                        claimed_at = NULL,
                        lease_expires_at = NULL
                    WHERE id = $1
                    "#,
                )
                .bind(task_id)
                .bind(&report.payload)
                .bind(&report.error)
                .execute(&mut *tx)
                .await
                .map_err(db_error("requeue task"))?;
                ReportOutcome::WillRetry {
                    next_attempt: attempt_count + 1,
                }
            }
            ReportStatus::Failed => {
                sqlx::query(
                    r#"
                    UPDATE farm_tasks
                    SET status = 'failed',
                        result = $2,
                        last_error = $3,
                        finished_at = NOW(),
                        lease_expires_at = NULL
                    WHERE id = $1
                    "#,
                )
                .bind(task_id)
                .bind(&report.payload)
                .bind(&report.error)
                .execute(&mut *tx)
                .await
                .map_err(db_error("fail task"))?;
                ReportOutcome::Exhausted
            }
        };

        tx.commit().await.map_err(db_error("commit report"))?;
        debug!(%task_id, ?outcome, "recorded task result");
        Ok(outcome)
    }

    #[instrument(skip(self))]
    async fn sweep_expired_claims(&self) -> Result<SweepSummary, StoreError> {
        // SET expressions all read the pre-update row
        let rows = sqlx::query(
            r#"
            UPDATE farm_tasks
            SET status = CASE WHEN attempt_count < max_attempts THEN 'queued' ELSE 'failed' END,
                last_error = CASE WHEN attempt_count < max_attempts THEN last_error ELSE $1 END,
                finished_at = CASE WHEN attempt_count < max_attempts THEN NULL ELSE NOW() END,
                claimed_by = CASE WHEN attempt_count < max_attempts THEN NULL ELSE claimed_by END,
                claimed_at = CASE WHEN attempt_count < max_attempts THEN NULL ELSE claimed_at END,
                lease_expires_at = NULL
            WHERE status IN ('claimed', 'running')
              AND lease_expires_at < NOW()
            RETURNING id, status
            "#,
        )
        .bind(LEASE_EXPIRED_ERROR)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("sweep expired claims"))?;

        let mut summary = SweepSummary::default();
        for row in rows {
            let status: String = row.get("status");
            let id: Uuid = row.get("id");
            if parse_status(&status)? == TaskStatus::Queued {
                summary.requeued.push(id);
            } else {
                summary.exhausted.push(id);
            }
        }

        if !summary.is_empty() {
            debug!(
                requeued = summary.requeued.len(),
                exhausted = summary.exhausted.len(),
                "swept expired claims"
            );
        }
        Ok(summary)
    }

    #[instrument(skip(self))]
    async fn get_task(&self, task_id: Uuid) -> Result<Task, StoreError> {
        let row = sqlx::query(&format!("SELECT {TASK_COLUMNS} FROM farm_tasks t WHERE t.id = $1"))
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error("get task"))?
            .ok_or(StoreError::TaskNotFound(task_id))?;

        task_from_row(&row)
    }

    #[instrument(skip(self))]
    async fn count_pending(&self) -> Result<u64, StoreError> {
        let count = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(*)
            FROM farm_tasks t
            JOIN farm_jobs j ON j.id = t.job_id
            WHERE j.decomposed AND t.status = 'queued'
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(db_error("count pending tasks"))?;

        Ok(count as u64)
    }

    #[instrument(skip(self))]
    async fn list_pending(&self, limit: usize) -> Result<Vec<Task>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {TASK_COLUMNS}
            FROM farm_tasks t
            JOIN farm_jobs j ON j.id = t.job_id
            WHERE j.decomposed AND t.status = 'queued'
            ORDER BY t.attempt_count ASC, t.priority DESC, t.created_at ASC, t.id ASC
            LIMIT $1
            "#
        ))
        .bind(limit.min(i64::MAX as usize) as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("list pending tasks"))?;

        rows.iter().map(task_from_row).collect()
    }
}
