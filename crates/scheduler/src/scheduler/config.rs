//! Scheduler loop configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::duration_millis;

/// Scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SchedulerConfig {
    /// Recorded as `claimed_by` on every claim (generated if not provided)
    pub instance_id: String,

    /// Maximum tasks dispatched and not yet reported
    pub max_concurrent: usize,

    /// Back-off when nothing is claimable
    #[serde(with = "duration_millis")]
    pub poll_interval: Duration,

    /// Lease granted with every claim
    #[serde(with = "duration_millis")]
    pub lease_duration: Duration,

    /// Minimum spacing between expired-lease sweeps
    #[serde(with = "duration_millis")]
    pub sweep_interval: Duration,

    /// How long `shutdown` waits for in-flight results
    #[serde(with = "duration_millis")]
    pub shutdown_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            instance_id: format!("scheduler-{}", Uuid::now_v7()),
            max_concurrent: 8,
            poll_interval: Duration::from_secs(3),
            lease_duration: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl SchedulerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_instance_id(mut self, id: impl Into<String>) -> Self {
        self.instance_id = id.into();
        self
    }

    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max.max(1);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_lease_duration(mut self, lease: Duration) -> Self {
        self.lease_duration = lease;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SchedulerConfig::default();
        assert!(config.instance_id.starts_with("scheduler-"));
        assert_eq!(config.max_concurrent, 8);
        assert_eq!(config.poll_interval, Duration::from_secs(3));
        assert_eq!(config.lease_duration, Duration::from_secs(300));
        assert_eq!(config.sweep_interval, Duration::from_secs(30));
    }

    #[test]
    fn test_zero_concurrency_clamped() {
        assert_eq!(SchedulerConfig::new().with_max_concurrent(0).max_concurrent, 1);
    }

    #[test]
    fn test_durations_serialize_as_millis() {
        let config = SchedulerConfig::new().with_poll_interval(Duration::from_millis(1500));
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["poll_interval"], 1500);
        assert_eq!(json["lease_duration"], 300_000);
    }
}
