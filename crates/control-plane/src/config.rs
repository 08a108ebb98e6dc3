// Control plane configuration
//
// Everything is read from the environment (after `.env` is loaded) and mapped
// onto the library configs of the scheduler crate.

use std::str::FromStr;
use std::time::Duration;

use axum::http::HeaderValue;
use framefarm_scheduler::fleet::{FleetConfig, FleetConfigError};
use framefarm_scheduler::SchedulerConfig;

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{name} has an invalid value {value:?}")]
    Invalid { name: &'static str, value: String },

    #[error(transparent)]
    Fleet(#[from] FleetConfigError),
}

/// Complete control plane configuration
#[derive(Debug, Clone)]
pub struct FarmConfig {
    /// Postgres URL; `None` runs on the in-memory store
    pub database_url: Option<String>,
    pub http_addr: String,
    /// e.g. "/api" turns `/v1/jobs` into `/api/v1/jobs`
    pub api_prefix: String,
    pub cors_origins: Vec<HeaderValue>,
    pub scheduler: SchedulerConfig,
    pub fleet: FleetConfig,
    /// Webhook of the provisioning service; `None` uses the dry-run provisioner
    pub provision_webhook_url: Option<String>,
    /// In-process workers fed by the local dispatch channel
    pub local_workers: usize,
    /// Capacity of the local dispatch queue
    pub dispatch_capacity: usize,
}

impl Default for FarmConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            http_addr: "0.0.0.0:9000".to_string(),
            api_prefix: String::new(),
            cors_origins: Vec::new(),
            scheduler: SchedulerConfig::default(),
            fleet: FleetConfig::default(),
            provision_webhook_url: None,
            local_workers: 2,
            dispatch_capacity: 64,
        }
    }
}

impl FarmConfig {
    /// Create configuration from environment variables
    ///
    /// Environment variables:
    /// - `DATABASE_URL`: Postgres URL (in-memory store when unset)
    /// - `HTTP_ADDR`: listen address (default: "0.0.0.0:9000")
    /// - `API_PREFIX`, `CORS_ALLOWED_ORIGINS` (comma separated)
    /// - `SCHED_INSTANCE_ID`, `SCHED_POLL_SECS` (3), `SCHED_MAX_CONCURRENT` (8),
    ///   `SCHED_CLAIM_TTL` (300), `SCHED_SWEEP_SECS` (30)
    /// - `SCALE_MIN` (0), `SCALE_MAX` (6), `QUEUE_UP` (50), `QUEUE_DOWN` (10),
    ///   `NODE_TIMEOUT_SECS` (300), `AUTOSCALE_TICK_SECS` (30)
    /// - `PROVISION_WEBHOOK_URL` (dry-run when unset)
    /// - `LOCAL_WORKERS` (2), `DISPATCH_CAPACITY` (64)
    ///
    /// Durations are seconds (fractions allowed) and must be positive.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any variable lookup; empty values count as unset
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        let mut scheduler = defaults.scheduler;
        if let Some(id) = get("SCHED_INSTANCE_ID") {
            scheduler.instance_id = id;
        }
        scheduler.poll_interval = secs(&get, "SCHED_POLL_SECS", scheduler.poll_interval)?;
        scheduler.max_concurrent =
            parse(&get, "SCHED_MAX_CONCURRENT", scheduler.max_concurrent)?;
        scheduler.lease_duration = secs(&get, "SCHED_CLAIM_TTL", scheduler.lease_duration)?;
        scheduler.sweep_interval = secs(&get, "SCHED_SWEEP_SECS", scheduler.sweep_interval)?;
        if scheduler.max_concurrent == 0 {
            return Err(ConfigError::Invalid {
                name: "SCHED_MAX_CONCURRENT",
                value: "0".to_string(),
            });
        }

        let fleet = defaults.fleet;
        let fleet = FleetConfig {
            min_instances: parse(&get, "SCALE_MIN", fleet.min_instances)?,
            max_instances: parse(&get, "SCALE_MAX", fleet.max_instances)?,
            scale_up_threshold: parse(&get, "QUEUE_UP", fleet.scale_up_threshold)?,
            scale_down_threshold: parse(&get, "QUEUE_DOWN", fleet.scale_down_threshold)?,
            node_timeout: secs(&get, "NODE_TIMEOUT_SECS", fleet.node_timeout)?,
            tick_interval: secs(&get, "AUTOSCALE_TICK_SECS", fleet.tick_interval)?,
            provision_grace: fleet.provision_grace,
        };
        fleet.validate()?;

        let cors_origins = get("CORS_ALLOWED_ORIGINS")
            .map(|s| s.split(',').filter_map(|s| s.trim().parse().ok()).collect())
            .unwrap_or_default();

        Ok(Self {
            database_url: get("DATABASE_URL"),
            http_addr: get("HTTP_ADDR").unwrap_or(defaults.http_addr),
            api_prefix: get("API_PREFIX").unwrap_or_default(),
            cors_origins,
            scheduler,
            fleet,
            provision_webhook_url: get("PROVISION_WEBHOOK_URL"),
            local_workers: parse(&get, "LOCAL_WORKERS", defaults.local_workers)?,
            dispatch_capacity: parse(&get, "DISPATCH_CAPACITY", defaults.dispatch_capacity)?
                .max(1),
        })
    }
}

fn parse<T, G>(get: &G, name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    G: Fn(&str) -> Option<String>,
{
    match get(name) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { name, value }),
        None => Ok(default),
    }
}

fn secs<G>(get: &G, name: &'static str, default: Duration) -> Result<Duration, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    match get(name) {
        Some(value) => value
            .trim()
            .parse::<f64>()
            .ok()
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
            .filter(|d| !d.is_zero())
            .ok_or(ConfigError::Invalid { name, value }),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from_vars(vars: &[(&str, &str)]) -> Result<FarmConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        FarmConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn test_defaults_without_environment() {
        let config = from_vars(&[]).unwrap();
        assert!(config.database_url.is_none());
        assert_eq!(config.http_addr, "0.0.0.0:9000");
        assert_eq!(config.scheduler.max_concurrent, 8);
        assert_eq!(config.scheduler.poll_interval, Duration::from_secs(3));
        assert_eq!(config.scheduler.lease_duration, Duration::from_secs(300));
        assert_eq!(config.fleet, FleetConfig::default());
        assert_eq!(config.local_workers, 2);
    }

    #[test]
    fn test_overrides() {
        let config = from_vars(&[
            ("DATABASE_URL", "postgres://farm@db/farm"),
            ("SCHED_INSTANCE_ID", "sched-a"),
            ("SCHED_POLL_SECS", "0.5"),
            ("SCHED_CLAIM_TTL", "60"),
            ("SCALE_MAX", "12"),
            ("QUEUE_UP", "200"),
            ("QUEUE_DOWN", "20"),
            ("LOCAL_WORKERS", "4"),
            ("CORS_ALLOWED_ORIGINS", "https://a.example, https://b.example"),
        ])
        .unwrap();

        assert_eq!(config.database_url.as_deref(), Some("postgres://farm@db/farm"));
        assert_eq!(config.scheduler.instance_id, "sched-a");
        assert_eq!(config.scheduler.poll_interval, Duration::from_millis(500));
        assert_eq!(config.scheduler.lease_duration, Duration::from_secs(60));
        assert_eq!(config.fleet.max_instances, 12);
        assert_eq!(config.fleet.scale_up_threshold, 200);
        assert_eq!(config.local_workers, 4);
        assert_eq!(config.cors_origins.len(), 2);
    }

    #[test]
    fn test_empty_values_count_as_unset() {
        let config = from_vars(&[("DATABASE_URL", ""), ("PROVISION_WEBHOOK_URL", "  ")]).unwrap();
        assert!(config.database_url.is_none());
        assert!(config.provision_webhook_url.is_none());
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(matches!(
            from_vars(&[("SCALE_MAX", "many")]),
            Err(ConfigError::Invalid { name: "SCALE_MAX", .. })
        ));
        assert!(matches!(
            from_vars(&[("SCHED_POLL_SECS", "-1")]),
            Err(ConfigError::Invalid { name: "SCHED_POLL_SECS", .. })
        ));
        assert!(matches!(
            from_vars(&[("AUTOSCALE_TICK_SECS", "0")]),
            Err(ConfigError::Invalid { name: "AUTOSCALE_TICK_SECS", .. })
        ));
        assert!(matches!(
            from_vars(&[("SCHED_MAX_CONCURRENT", "0")]),
            Err(ConfigError::Invalid { .. })
        ));
        assert!(matches!(
            from_vars(&[("QUEUE_UP", "5"), ("QUEUE_DOWN", "10")]),
            Err(ConfigError::Fleet(FleetConfigError::ThresholdsInverted { .. }))
        ));
    }
}
