//! Fleet controller configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::duration_millis;

/// Fleet configuration errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FleetConfigError {
    #[error("scale_up_threshold ({up}) must be greater than scale_down_threshold ({down})")]
    ThresholdsInverted { up: u64, down: u64 },

    #[error("min_instances ({min}) must not exceed max_instances ({max})")]
    InstanceBounds { min: usize, max: usize },
}

/// Autoscaling configuration
///
/// The gap between `scale_down_threshold` and `scale_up_threshold` is the
/// hysteresis band: a backlog inside it never triggers an action.
///
/// # Example
///
/// ```
/// use framefarm_scheduler::fleet::FleetConfig;
///
/// let config = FleetConfig::default()
///     .with_instance_bounds(1, 10)
///     .with_thresholds(100, 20);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FleetConfig {
    pub min_instances: usize,
    pub max_instances: usize,

    /// Scale up while more tasks than this are queued
    pub scale_up_threshold: u64,

    /// Scale down while fewer tasks than this are queued
    pub scale_down_threshold: u64,

    /// Nodes silent for longer are pruned from the registry
    #[serde(with = "duration_millis")]
    pub node_timeout: Duration,

    #[serde(with = "duration_millis")]
    pub tick_interval: Duration,

    /// How long a requested node counts toward the fleet before it heartbeats
    #[serde(with = "duration_millis")]
    pub provision_grace: Duration,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            min_instances: 0,
            max_instances: 6,
            scale_up_threshold: 50,
            scale_down_threshold: 10,
            node_timeout: Duration::from_secs(300),
            tick_interval: Duration::from_secs(30),
            provision_grace: Duration::from_secs(600),
        }
    }
}

impl FleetConfig {
    pub fn with_instance_bounds(mut self, min: usize, max: usize) -> Self {
        self.min_instances = min;
        self.max_instances = max;
        self
    }

    pub fn with_thresholds(mut self, up: u64, down: u64) -> Self {
        self.scale_up_threshold = up;
        self.scale_down_threshold = down;
        self
    }

    pub fn with_node_timeout(mut self, timeout: Duration) -> Self {
        self.node_timeout = timeout;
        self
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    pub fn with_provision_grace(mut self, grace: Duration) -> Self {
        self.provision_grace = grace;
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), FleetConfigError> {
        if self.scale_up_threshold <= self.scale_down_threshold {
            return Err(FleetConfigError::ThresholdsInverted {
                up: self.scale_up_threshold,
                down: self.scale_down_threshold,
            });
        }
        if self.min_instances > self.max_instances {
            return Err(FleetConfigError::InstanceBounds {
                min: self.min_instances,
                max: self.max_instances,
            });
        }
        Ok(())
    }
}
