//! Reliability patterns
//!
//! - [`RetryPolicy`] - exponential backoff for transient store failures

mod retry;

pub use retry::RetryPolicy;
