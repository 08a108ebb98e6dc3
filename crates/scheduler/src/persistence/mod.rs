//! Persistence layer for jobs and tasks
//!
//! This module provides:
//! - [`TaskStore`] trait with the atomic `claim_next` primitive
//! - [`InMemoryTaskStore`] for tests and single-process runs
//! - [`PostgresTaskStore`] for production

mod memory;
mod postgres;
mod store;

pub use memory::InMemoryTaskStore;
pub use postgres::PostgresTaskStore;
pub use store::{StoreError, TaskStore, CANCELLED_ERROR, LEASE_EXPIRED_ERROR};
