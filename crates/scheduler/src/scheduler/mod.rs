//! Scheduler loop
//!
//! This module provides:
//! - [`Scheduler`] - claims tasks and hands them to a dispatch channel
//! - [`SchedulerConfig`] - concurrency gate, poll interval, lease length
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                          Scheduler                            │
//! │                                                               │
//! │  loop:  sweep (every sweep_interval)                          │
//! │           │                                                   │
//! │           ▼                                                   │
//! │         permit? ──no──► wait (poll_interval / wake)           │
//! │           │                                                   │
//! │           ▼                                                   │
//! │         claim_next ──none──► wait (poll_interval / wake)      │
//! │           │                                                   │
//! │           ▼                                                   │
//! │         dispatch ──err──► release_claim                       │
//! │           │                                                   │
//! │           ▼                                                   │
//! │         result waiter (holds permit until report_result)      │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Several schedulers may share one store; `claim_next` is the only
//! coordination between them. The permit count is local and only caches how
//! much work this instance has in flight.

mod config;
mod cycle;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

pub use config::SchedulerConfig;
pub use cycle::CycleOutcome;

use crate::dispatch::DispatchChannel;
use crate::persistence::{StoreError, TaskStore};
use cycle::SchedulerCore;

/// Scheduler status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerStatus {
    /// Claiming and dispatching
    Running,
    /// No new claims; waiting for in-flight results
    Draining,
    /// Not running
    Stopped,
}

/// Scheduler errors
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    /// Store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Scheduler already running
    #[error("scheduler is already running")]
    AlreadyRunning,

    /// In-flight results did not arrive in time
    #[error("graceful shutdown timed out with {0} tasks in flight")]
    ShutdownTimeout(usize),
}

/// Claims tasks from a [`TaskStore`] and dispatches them
///
/// # Example
///
/// ```ignore
/// use framefarm_scheduler::prelude::*;
///
/// let (channel, queue) = LocalDispatchChannel::new(64);
/// let scheduler = Scheduler::new(store, Arc::new(channel), SchedulerConfig::default());
///
/// scheduler.start()?;
/// // ... later
/// scheduler.shutdown().await?;
/// ```
pub struct Scheduler {
    core: Arc<SchedulerCore>,
    shutdown_tx: watch::Sender<bool>,
    status: RwLock<SchedulerStatus>,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn TaskStore>,
        channel: Arc<dyn DispatchChannel>,
        config: SchedulerConfig,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            core: Arc::new(SchedulerCore::new(store, channel, config)),
            shutdown_tx,
            status: RwLock::new(SchedulerStatus::Stopped),
            loop_handle: Mutex::new(None),
        }
    }

    /// Handle that wakes the loop early (e.g. on job submission)
    pub fn wake_handle(&self) -> Arc<Notify> {
        Arc::clone(&self.core.wake)
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.core.config
    }

    pub fn instance_id(&self) -> &str {
        &self.core.config.instance_id
    }

    pub fn status(&self) -> SchedulerStatus {
        *self.status.read()
    }

    /// Tasks dispatched by this instance and not yet reported
    pub fn in_flight(&self) -> usize {
        self.core.in_flight()
    }

    /// Run a single cycle without the background loop
    pub async fn run_cycle(&self) -> Result<CycleOutcome, SchedulerError> {
        Ok(self.core.run_cycle().await?)
    }

    /// Start the background loop
    #[instrument(skip(self), fields(instance_id = %self.core.config.instance_id))]
    pub fn start(&self) -> Result<(), SchedulerError> {
        {
            let mut status = self.status.write();
            if *status != SchedulerStatus::Stopped {
                return Err(SchedulerError::AlreadyRunning);
            }
            *status = SchedulerStatus::Running;
        }
        self.shutdown_tx.send_replace(false);

        info!(
            instance_id = %self.core.config.instance_id,
            max_concurrent = self.core.config.max_concurrent,
            poll_interval_ms = self.core.config.poll_interval.as_millis() as u64,
            lease_secs = self.core.config.lease_duration.as_secs(),
            "Starting scheduler"
        );

        let core = Arc::clone(&self.core);
        let shutdown_rx = self.shutdown_tx.subscribe();
        let handle = tokio::spawn(run_loop(core, shutdown_rx));
        *self.loop_handle.lock() = Some(handle);
        Ok(())
    }

    /// Stop claiming and wait for in-flight results
    ///
    /// Tasks still in flight when `shutdown_timeout` passes keep their leases
    /// and are recovered by whichever scheduler sweeps next.
    #[instrument(skip(self), fields(instance_id = %self.core.config.instance_id))]
    pub async fn shutdown(&self) -> Result<(), SchedulerError> {
        {
            let mut status = self.status.write();
            if *status == SchedulerStatus::Stopped {
                return Ok(());
            }
            *status = SchedulerStatus::Draining;
        }

        info!("Initiating graceful shutdown");
        self.shutdown_tx.send_replace(true);

        let handle = self.loop_handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("Scheduler loop ended abnormally: {}", e);
            }
        }

        let deadline = tokio::time::Instant::now() + self.core.config.shutdown_timeout;
        loop {
            let in_flight = self.core.in_flight();
            if in_flight == 0 {
                debug!("All in-flight tasks reported");
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(in_flight, "Shutdown timeout reached");
                *self.status.write() = SchedulerStatus::Stopped;
                return Err(SchedulerError::ShutdownTimeout(in_flight));
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        *self.status.write() = SchedulerStatus::Stopped;
        info!("Scheduler stopped");
        Ok(())
    }
}

async fn run_loop(core: Arc<SchedulerCore>, mut shutdown_rx: watch::Receiver<bool>) {
    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let outcome = match core.run_cycle().await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("Scheduling cycle failed: {}", e);
                CycleOutcome::Idle
            }
        };

        // Keep claiming while work flows
        if matches!(outcome, CycleOutcome::Dispatched(_)) {
            continue;
        }

        tokio::select! {
            _ = tokio::time::sleep(core.config.poll_interval) => {}
            _ = core.wake.notified() => {}
            _ = shutdown_rx.changed() => {
                debug!("Scheduler loop: shutdown requested");
                break;
            }
        }
    }

    debug!("Scheduler loop exited");
}
