//! Work execution
//!
//! This module provides:
//! - [`Executor`] - the contract every work executor implements
//! - [`ExecutorRegistry`] - routes tasks to executors by `job_type`
//! - [`CommandExecutor`] - runs `payload.cmd` in a shell with `FRAME` set
//! - [`WorkerRunner`] - in-process worker draining a local dispatch queue
//!
//! # Example
//!
//! ```ignore
//! use framefarm_scheduler::prelude::*;
//!
//! let mut executors = ExecutorRegistry::new();
//! executors.register("composite", Arc::new(CommandExecutor::new()));
//!
//! let runner = WorkerRunner::new(WorkerConfig::default(), queue, Arc::new(executors), registry);
//! runner.start();
//! ```

mod executor;
mod runner;

pub use executor::{
    CommandExecutor, ExecutionResult, Executor, ExecutorRegistry, DEFAULT_OUTPUT_LIMIT,
};
pub use runner::{WorkerConfig, WorkerRunner};
