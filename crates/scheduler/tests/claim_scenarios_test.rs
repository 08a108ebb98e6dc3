//! Claiming, lease recovery and retry behaviour against the in-memory store

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use uuid::Uuid;

use framefarm_scheduler::model::{JobSpec, JobStats, JobStatus, TaskReport, TaskStatus};
use framefarm_scheduler::{
    DecomposerConfig, InMemoryTaskStore, JobDecomposer, ReportOutcome, TaskStore,
};

const LEASE: Duration = Duration::from_secs(300);

async fn submit(store: &Arc<InMemoryTaskStore>, spec: JobSpec) -> Uuid {
    JobDecomposer::new(store.clone(), DecomposerConfig::default())
        .submit(spec)
        .await
        .unwrap()
        .job_id
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn concurrent_claimers_never_share_a_task() {
    let store = Arc::new(InMemoryTaskStore::new());
    for _ in 0..4 {
        submit(&store, JobSpec::new("render", 1, 50)).await;
    }

    let claimers = (0..32).map(|i| {
        let store = store.clone();
        tokio::spawn(async move {
            let mut mine = Vec::new();
            while let Some(task) = store.claim_next(&format!("claimer-{i}"), LEASE).await.unwrap() {
                mine.push(task.id);
                tokio::task::yield_now().await;
            }
            mine
        })
    });

    let claimed: Vec<Uuid> = join_all(claimers)
        .await
        .into_iter()
        .flat_map(|r| r.unwrap())
        .collect();
    let unique: HashSet<Uuid> = claimed.iter().copied().collect();

    assert_eq!(claimed.len(), 200);
    assert_eq!(unique.len(), 200);
    assert_eq!(store.count_pending().await.unwrap(), 0);
}

#[test_log::test(tokio::test)]
async fn five_frame_job_with_one_exhausted_failure() {
    let store = Arc::new(InMemoryTaskStore::new());
    let job_id = submit(&store, JobSpec::new("composite", 1, 5).with_max_retries(0)).await;
    assert_eq!(store.tasks_for_job(job_id).len(), 5);
    assert!(store
        .tasks_for_job(job_id)
        .iter()
        .all(|t| t.status == TaskStatus::Queued));

    let claims = join_all((0..5).map(|i| {
        let store = store.clone();
        async move { store.claim_next(&format!("s{i}"), LEASE).await.unwrap() }
    }))
    .await;
    let claims: Vec<_> = claims.into_iter().map(|c| c.unwrap()).collect();
    let distinct: HashSet<Uuid> = claims.iter().map(|c| c.id).collect();
    assert_eq!(distinct.len(), 5);
    assert!(store.claim_next("s6", LEASE).await.unwrap().is_none());

    for claim in &claims[..4] {
        let outcome = store
            .report_result(
                claim.id,
                claim.attempt,
                TaskReport::done(serde_json::json!({"ok": true})),
            )
            .await
            .unwrap();
        assert_eq!(outcome, ReportOutcome::Completed);
    }
    let outcome = store
        .report_result(
            claims[4].id,
            claims[4].attempt,
            TaskReport::failed("render crashed"),
        )
        .await
        .unwrap();
    assert_eq!(outcome, ReportOutcome::Exhausted);

    let report = store.job_status(job_id).await.unwrap();
    assert_eq!(
        report.stats,
        JobStats {
            total: 5,
            done: 4,
            failed: 1,
            running: 0,
            queued: 0,
        }
    );
    assert_eq!(report.status, JobStatus::Failed);
}

#[tokio::test]
async fn inverted_range_is_a_single_task() {
    let store = Arc::new(InMemoryTaskStore::new());
    let job_id = submit(&store, JobSpec::new("render", 10, 8)).await;

    let tasks = store.tasks_for_job(job_id);
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].unit_index, 10);
}

#[tokio::test]
async fn lease_recovery_counts_each_claim_once() {
    let store = Arc::new(InMemoryTaskStore::new());
    submit(&store, JobSpec::new("render", 1, 1).with_max_retries(3)).await;

    let mut attempts = Vec::new();
    for round in 0..4 {
        let claim = store
            .claim_next(&format!("s{round}"), LEASE)
            .await
            .unwrap()
            .expect("task should be reclaimable");
        attempts.push(claim.attempt);

        // Worker crashes: no result, lease runs out
        store.expire_lease(claim.id);
        if round % 2 == 0 {
            store.sweep_expired_claims().await.unwrap();
        }
    }
    assert_eq!(attempts, vec![1, 2, 3, 4]);

    // Attempts exhausted: the sweep makes it terminal
    let summary = store.sweep_expired_claims().await.unwrap();
    assert_eq!(summary.exhausted.len(), 1);
    assert!(store.claim_next("late", LEASE).await.unwrap().is_none());
}

#[tokio::test]
async fn retries_stop_after_max_retries_plus_one_failures() {
    let store = Arc::new(InMemoryTaskStore::new());
    let job_id = submit(&store, JobSpec::new("render", 1, 1)).await;

    let mut outcomes = Vec::new();
    while let Some(claim) = store.claim_next("s1", LEASE).await.unwrap() {
        outcomes.push(
            store
                .report_result(claim.id, claim.attempt, TaskReport::failed("exit 1"))
                .await
                .unwrap(),
        );
    }

    // Default max_retries = 2 → three attempts
    assert_eq!(
        outcomes,
        vec![
            ReportOutcome::WillRetry { next_attempt: 2 },
            ReportOutcome::WillRetry { next_attempt: 3 },
            ReportOutcome::Exhausted,
        ]
    );
    let task = &store.tasks_for_job(job_id)[0];
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.attempt_count, 3);
    assert_eq!(task.last_error.as_deref(), Some("exit 1"));
}

#[tokio::test]
async fn duplicate_reports_are_no_ops() {
    let store = Arc::new(InMemoryTaskStore::new());
    let job_id = submit(&store, JobSpec::new("render", 1, 1)).await;
    let claim = store.claim_next("s1", LEASE).await.unwrap().unwrap();

    let report = TaskReport::done(serde_json::json!({"ok": true}));
    let mut outcomes = Vec::new();
    for _ in 0..3 {
        outcomes.push(
            store
                .report_result(claim.id, claim.attempt, report.clone())
                .await
                .unwrap(),
        );
    }
    assert_eq!(
        outcomes,
        vec![
            ReportOutcome::Completed,
            ReportOutcome::AlreadyTerminal,
            ReportOutcome::AlreadyTerminal,
        ]
    );
    assert_eq!(
        store.job_status(job_id).await.unwrap().status,
        JobStatus::Done
    );
}
