//! # Render Farm Scheduler
//!
//! Turns coarse render jobs into per-frame tasks, hands them out to an
//! unreliable fleet of workers, and keeps that fleet sized to the backlog.
//!
//! ## Features
//!
//! - **Lease-based claiming**: every claim carries a lease; expiry is the only failure detector
//! - **Atomic `claim_next`**: no two schedulers ever receive the same task
//! - **Bounded retries**: `max_retries + 1` attempts, then terminal failure
//! - **Hidden decomposition**: a job's tasks become claimable only once all of them exist
//! - **Autoscaling with hysteresis**: one node up or down per tick, never past the bounds
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐     ┌──────────────┐     ┌──────────────┐     ┌─────────┐
//! │ JobDecomposer│ ──► │  TaskStore   │ ──► │  Scheduler   │ ──► │ Dispatch│ ──► worker
//! └──────────────┘     │ (Postgres /  │ ◄── │ (claim_next, │ ◄── │ Channel │ ◄── result
//!                      │  in-memory)  │     │  permits)    │     └─────────┘
//!                      └──────┬───────┘     └──────────────┘
//!                             │ count_pending
//!                      ┌──────▼───────┐     ┌──────────────┐
//!                      │FleetController│ ──► │ Provisioner  │
//!                      └──────▲───────┘     └──────────────┘
//!                             │ prune / list
//!                      ┌──────┴───────┐
//!                      │ NodeRegistry │ ◄── heartbeats
//!                      └──────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use framefarm_scheduler::prelude::*;
//!
//! let store: Arc<dyn TaskStore> = Arc::new(InMemoryTaskStore::new());
//! let (channel, queue) = LocalDispatchChannel::new(64);
//! let scheduler = Scheduler::new(store.clone(), Arc::new(channel), SchedulerConfig::default());
//!
//! let decomposer = JobDecomposer::new(store.clone(), DecomposerConfig::default())
//!     .with_wake(scheduler.wake_handle());
//! decomposer.submit(JobSpec::new("composite", 1, 250)).await?;
//!
//! scheduler.start()?;
//! ```

pub mod decomposer;
pub mod dispatch;
pub mod fleet;
pub mod model;
pub mod persistence;
pub mod registry;
pub mod reliability;
pub mod scheduler;
pub mod worker;

/// Prelude for common imports
pub mod prelude {
    pub use std::sync::Arc;

    pub use crate::decomposer::{DecomposeError, DecomposerConfig, JobDecomposer, SubmittedJob};
    pub use crate::dispatch::{
        DispatchChannel, DispatchError, DispatchQueue, DispatchReceipt, LocalDispatchChannel,
    };
    pub use crate::fleet::{
        DryRunProvisioner, FleetConfig, FleetController, HttpProvisioner, Provisioner,
    };
    pub use crate::model::{
        ClaimedTask, Job, JobSpec, JobStats, JobStatus, JobStatusReport, ReportOutcome, Task,
        TaskReport, TaskStatus,
    };
    pub use crate::persistence::{InMemoryTaskStore, PostgresTaskStore, StoreError, TaskStore};
    pub use crate::registry::{InMemoryNodeRegistry, Node, NodeRegistry};
    pub use crate::reliability::RetryPolicy;
    pub use crate::scheduler::{CycleOutcome, Scheduler, SchedulerConfig, SchedulerError};
    pub use crate::worker::{
        CommandExecutor, ExecutionResult, Executor, ExecutorRegistry, WorkerConfig, WorkerRunner,
    };
}

// Re-export key types at crate root
pub use decomposer::{DecomposeError, DecomposerConfig, JobDecomposer, SubmittedJob};
pub use dispatch::{DispatchChannel, DispatchError, LocalDispatchChannel};
pub use model::{
    ClaimedTask, Job, JobSpec, JobStats, JobStatus, JobStatusReport, ReportOutcome, SweepSummary,
    Task, TaskPayload, TaskReport, TaskStatus,
};
pub use persistence::{InMemoryTaskStore, PostgresTaskStore, StoreError, TaskStore};
pub use registry::{InMemoryNodeRegistry, Node, NodeRegistry};
pub use reliability::RetryPolicy;
pub use scheduler::{Scheduler, SchedulerConfig, SchedulerError};

/// Serde support for Duration as milliseconds
pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis().min(u64::MAX as u128) as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
