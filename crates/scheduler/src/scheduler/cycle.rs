//! One scheduling cycle: sweep, claim, dispatch

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::config::SchedulerConfig;
use crate::dispatch::{DispatchChannel, DispatchReceipt};
use crate::persistence::{StoreError, TaskStore};

/// What a single cycle did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// A task was claimed and accepted by the channel
    Dispatched(Uuid),
    /// Nothing claimable
    Idle,
    /// Every in-flight permit is taken
    AtCapacity,
    /// Claimed, but the channel refused it; the claim was released
    DispatchFailed(Uuid),
}

/// State shared between the scheduler handle, its loop and result waiters
pub(super) struct SchedulerCore {
    pub(super) store: Arc<dyn TaskStore>,
    pub(super) channel: Arc<dyn DispatchChannel>,
    pub(super) config: SchedulerConfig,
    pub(super) permits: Arc<Semaphore>,
    pub(super) wake: Arc<Notify>,
    last_sweep: Mutex<Option<Instant>>,
}

impl SchedulerCore {
    pub(super) fn new(
        store: Arc<dyn TaskStore>,
        channel: Arc<dyn DispatchChannel>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            store,
            channel,
            permits: Arc::new(Semaphore::new(config.max_concurrent)),
            config,
            wake: Arc::new(Notify::new()),
            last_sweep: Mutex::new(None),
        }
    }

    pub(super) fn in_flight(&self) -> usize {
        self.config.max_concurrent - self.permits.available_permits()
    }

    pub(super) async fn run_cycle(&self) -> Result<CycleOutcome, StoreError> {
        self.maybe_sweep().await?;

        let Ok(permit) = Arc::clone(&self.permits).try_acquire_owned() else {
            return Ok(CycleOutcome::AtCapacity);
        };

        let Some(task) = self
            .store
            .claim_next(&self.config.instance_id, self.config.lease_duration)
            .await?
        else {
            return Ok(CycleOutcome::Idle);
        };

        let task_id = task.id;
        let attempt = task.attempt;
        let remaining = task.lease_remaining();
        debug!(
            %task_id,
            job_id = %task.job_id,
            unit = task.unit_index,
            attempt,
            "claimed task"
        );

        match self.channel.dispatch(task).await {
            Ok(receipt) => {
                tokio::spawn(await_result(
                    Arc::clone(&self.store),
                    receipt,
                    permit,
                    remaining,
                    Arc::clone(&self.wake),
                ));

                match self.store.mark_running(task_id, attempt).await {
                    Ok(true) => {}
                    Ok(false) => debug!(%task_id, attempt, "stale dispatch acknowledgement"),
                    Err(e) => warn!(%task_id, "Failed to mark task running: {}", e),
                }
                Ok(CycleOutcome::Dispatched(task_id))
            }
            Err(e) => {
                warn!(%task_id, attempt, "Dispatch failed, releasing claim: {}", e);
                self.store.release_claim(task_id, attempt).await?;
                Ok(CycleOutcome::DispatchFailed(task_id))
            }
        }
    }

    /// Sweep expired leases at most once per `sweep_interval`
    async fn maybe_sweep(&self) -> Result<(), StoreError> {
        {
            let mut last = self.last_sweep.lock();
            if last.is_some_and(|at| at.elapsed() < self.config.sweep_interval) {
                return Ok(());
            }
            *last = Some(Instant::now());
        }

        let summary = self.store.sweep_expired_claims().await?;
        if !summary.is_empty() {
            info!(
                requeued = summary.requeued.len(),
                exhausted = summary.exhausted.len(),
                "recovered expired leases"
            );
        }
        Ok(())
    }
}

/// Wait for one dispatched attempt, record its result, free its permit
async fn await_result(
    store: Arc<dyn TaskStore>,
    receipt: DispatchReceipt,
    permit: OwnedSemaphorePermit,
    timeout: Duration,
    wake: Arc<Notify>,
) {
    let task_id = receipt.task_id();
    let attempt = receipt.attempt();

    match receipt.wait(timeout).await {
        Ok(report) => match store.report_result(task_id, attempt, report).await {
            Ok(outcome) => debug!(%task_id, attempt, ?outcome, "task result recorded"),
            Err(e) => error!(%task_id, "Failed to record task result: {}", e),
        },
        Err(e) => {
            warn!(%task_id, attempt, "No result before lease end, leaving to sweep: {}", e);
        }
    }

    drop(permit);
    wake.notify_one();
}
