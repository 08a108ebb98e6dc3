//! Scheduler, local dispatch and worker runners wired together

use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use framefarm_scheduler::dispatch::LocalDispatchChannel;
use framefarm_scheduler::model::{JobSpec, JobStatus, JobStatusReport};
use framefarm_scheduler::worker::{ExecutionResult, ExecutorRegistry, WorkerConfig, WorkerRunner};
use framefarm_scheduler::{
    DecomposerConfig, InMemoryNodeRegistry, InMemoryTaskStore, JobDecomposer, NodeRegistry,
    Scheduler, SchedulerConfig, TaskStore,
};

fn executors() -> Arc<ExecutorRegistry> {
    let mut registry = ExecutorRegistry::new();
    registry.register_fn("render", |task| async move {
        tokio::time::sleep(Duration::from_millis(5)).await;
        ExecutionResult::success(Some(format!("frame-{:04}.exr", task.unit_index)))
    });
    // Every unit fails its first attempt
    registry.register_fn("flaky", |task| async move {
        if task.attempt == 1 {
            ExecutionResult::failure("transient render error")
        } else {
            ExecutionResult::success(None)
        }
    });
    Arc::new(registry)
}

async fn wait_for_terminal(store: &InMemoryTaskStore, job_id: Uuid) -> JobStatusReport {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let report = store.job_status(job_id).await.unwrap();
            if matches!(report.status, JobStatus::Done | JobStatus::Failed) {
                return report;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("job did not finish in time")
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn jobs_run_to_completion_through_local_workers() {
    let store = Arc::new(InMemoryTaskStore::new());
    let nodes = Arc::new(InMemoryNodeRegistry::new());
    let (channel, queue) = LocalDispatchChannel::new(16);

    let scheduler = Scheduler::new(
        store.clone(),
        Arc::new(channel),
        SchedulerConfig::default()
            .with_max_concurrent(4)
            .with_poll_interval(Duration::from_millis(20)),
    );
    let decomposer = JobDecomposer::new(store.clone(), DecomposerConfig::default())
        .with_wake(scheduler.wake_handle());

    let workers: Vec<WorkerRunner> = (0..2)
        .map(|i| {
            WorkerRunner::new(
                WorkerConfig::default()
                    .with_node_id(format!("local-{i}"))
                    .with_heartbeat_interval(Duration::from_millis(50)),
                queue.clone(),
                executors(),
                nodes.clone(),
            )
        })
        .collect();
    for worker in &workers {
        worker.start();
    }
    scheduler.start().unwrap();

    let render = decomposer
        .submit(JobSpec::new("render", 1, 24))
        .await
        .unwrap();
    let flaky = decomposer
        .submit(JobSpec::new("flaky", 1, 3).with_priority(9))
        .await
        .unwrap();
    let unknown = decomposer
        .submit(JobSpec::new("simulate", 1, 1).with_max_retries(0))
        .await
        .unwrap();

    let report = wait_for_terminal(&store, render.job_id).await;
    assert_eq!(report.status, JobStatus::Done);
    assert_eq!(report.stats.done, 24);

    let report = wait_for_terminal(&store, flaky.job_id).await;
    assert_eq!(report.status, JobStatus::Done);
    for task in store.tasks_for_job(flaky.job_id) {
        assert_eq!(task.attempt_count, 2);
    }

    let report = wait_for_terminal(&store, unknown.job_id).await;
    assert_eq!(report.status, JobStatus::Failed);
    let task = &store.tasks_for_job(unknown.job_id)[0];
    assert!(task
        .last_error
        .as_deref()
        .is_some_and(|e| e.contains("no executor registered")));

    let artifact = store
        .tasks_for_job(render.job_id)
        .into_iter()
        .find(|t| t.unit_index == 7)
        .and_then(|t| t.result)
        .unwrap();
    assert_eq!(artifact["artifact_ref"], "frame-0007.exr");

    scheduler.shutdown().await.unwrap();
    assert_eq!(scheduler.in_flight(), 0);

    let completed: u64 = workers.iter().map(WorkerRunner::completed).sum();
    assert_eq!(completed, 24 + 6 + 1);
    for worker in &workers {
        worker.shutdown().await;
    }

    let seen = nodes.list_nodes().await;
    assert_eq!(seen.len(), 2);
    assert!(seen.iter().all(|n| n.info.get("completed").is_some()));
}
