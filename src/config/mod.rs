//! # ModelOps Configuration System
//!
//! YAML-based configuration with environment-specific overrides. A single
//! `modelops-config.yaml` carries the base values plus optional top-level
//! `development` / `test` / `production` sections that are deep-merged over
//! the base for the active environment.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use modelops_core::config::ConfigManager;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = ConfigManager::load()?;
//! let threshold = manager.config().monitor.drift_threshold;
//! let max_tasks = manager.config().pipeline.max_concurrent_tasks;
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod loader;

use serde::{Deserialize, Serialize};
use std::time::Duration;

pub use error::{ConfigResult, ConfigurationError};
pub use loader::ConfigManager;

/// Root configuration structure mirroring modelops-config.yaml
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ModelOpsConfig {
    /// Model registry persistence settings
    pub registry: RegistryConfig,

    /// A/B experiment settings
    pub ab_testing: AbTestingConfig,

    /// Health, drift and alert evaluation settings
    pub monitor: MonitorConfig,

    /// Retraining pipeline settings
    pub pipeline: PipelineSettings,

    /// Retry backoff for pipeline tasks
    pub backoff: BackoffConfig,

    /// Logging output settings
    pub telemetry: TelemetryConfig,
}

impl ModelOpsConfig {
    /// Reject configurations that would make components misbehave
    pub fn validate(&self) -> ConfigResult<()> {
        if self.registry.backend == StoreBackend::Sqlite && self.registry.sqlite_url.is_empty() {
            return Err(ConfigurationError::missing_required_field(
                "registry.sqlite_url",
                "registry configuration",
            ));
        }

        if self.ab_testing.result_buffer_capacity == 0 {
            return Err(ConfigurationError::invalid_value(
                "ab_testing.result_buffer_capacity",
                0,
                "buffer capacity must be greater than 0",
            ));
        }

        let alpha = self.ab_testing.significance_level;
        if !(alpha > 0.0 && alpha < 1.0) {
            return Err(ConfigurationError::invalid_value(
                "ab_testing.significance_level",
                alpha,
                "significance level must be within (0, 1)",
            ));
        }

        if self.monitor.bucket_seconds == 0 {
            return Err(ConfigurationError::invalid_value(
                "monitor.bucket_seconds",
                0,
                "bucket size must be greater than 0",
            ));
        }

        if self.monitor.retention_seconds < self.monitor.bucket_seconds {
            return Err(ConfigurationError::invalid_value(
                "monitor.retention_seconds",
                self.monitor.retention_seconds,
                "retention must cover at least one bucket",
            ));
        }

        if self.monitor.drift_bins < 2 {
            return Err(ConfigurationError::invalid_value(
                "monitor.drift_bins",
                self.monitor.drift_bins,
                "at least two bins are needed to compare distributions",
            ));
        }

        if self.monitor.drift_threshold <= 0.0 {
            return Err(ConfigurationError::invalid_value(
                "monitor.drift_threshold",
                self.monitor.drift_threshold,
                "drift threshold must be positive",
            ));
        }

        if self.pipeline.max_concurrent_tasks == 0 {
            return Err(ConfigurationError::invalid_value(
                "pipeline.max_concurrent_tasks",
                0,
                "at least one task must be allowed to run",
            ));
        }

        if self.backoff.backoff_multiplier <= 1.0 {
            return Err(ConfigurationError::invalid_value(
                "backoff.backoff_multiplier",
                self.backoff.backoff_multiplier,
                "multiplier must be greater than 1 for delays to grow",
            ));
        }

        if !(0.0..1.0).contains(&self.backoff.jitter_factor) {
            return Err(ConfigurationError::invalid_value(
                "backoff.jitter_factor",
                self.backoff.jitter_factor,
                "jitter factor must be within [0, 1)",
            ));
        }

        Ok(())
    }
}

/// Persistence backend for registry and experiment state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub backend: StoreBackend,
    pub sqlite_url: String,
    pub max_connections: u32,
    /// How long `register`/`promote` wait for the per-model lock
    pub promotion_lock_timeout_ms: u64,
}

impl RegistryConfig {
    pub fn promotion_lock_timeout(&self) -> Duration {
        Duration::from_millis(self.promotion_lock_timeout_ms.max(1))
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            sqlite_url: "sqlite://modelops.db?mode=rwc".to_string(),
            max_connections: 4,
            promotion_lock_timeout_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AbTestingConfig {
    /// Capacity of the in-memory result buffer in front of the store
    pub result_buffer_capacity: usize,
    /// How often the background writer drains the buffer
    pub flush_interval_ms: u64,
    /// Two-sided significance level for winner decisions
    pub significance_level: f64,
    /// Used when an experiment does not set its own minimum
    pub default_minimum_sample_size: u64,
}

impl AbTestingConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

impl Default for AbTestingConfig {
    fn default() -> Self {
        Self {
            result_buffer_capacity: 10_000,
            flush_interval_ms: 250,
            significance_level: 0.05,
            default_minimum_sample_size: 1000,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Width of one aggregation bucket
    pub bucket_seconds: u64,
    /// How much history each series keeps
    pub retention_seconds: u64,
    /// Cadence of the background alert evaluation loop
    pub evaluation_interval_seconds: u64,
    /// Cadence of resource snapshots taken by the background loop
    pub resource_sample_interval_seconds: u64,
    /// The serving facade samples resources once every N predictions
    pub resource_sample_every_n_requests: u64,
    /// PSI above which drift is reported
    pub drift_threshold: f64,
    /// Number of quantile bins per feature in a baseline
    pub drift_bins: usize,
    /// Rolling number of observed feature vectors kept per series
    pub drift_window: usize,
    /// Observed vectors required before a drift score is computed
    pub min_drift_samples: usize,
    /// Relative success-rate change treated as a trend
    pub trend_band: f64,
}

impl MonitorConfig {
    pub fn evaluation_interval(&self) -> Duration {
        Duration::from_secs(self.evaluation_interval_seconds.max(1))
    }

    pub fn resource_sample_interval(&self) -> Duration {
        Duration::from_secs(self.resource_sample_interval_seconds.max(1))
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            bucket_seconds: 10,
            retention_seconds: 3600,
            evaluation_interval_seconds: 30,
            resource_sample_interval_seconds: 60,
            resource_sample_every_n_requests: 100,
            drift_threshold: 0.2,
            drift_bins: 10,
            drift_window: 1000,
            min_drift_samples: 50,
            trend_band: 0.02,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PipelineSettings {
    pub max_concurrent_tasks: usize,
    pub default_retry_count: u32,
    pub default_timeout_seconds: u64,
    /// `@hourly`, `@daily` or `0 H * * *`; `None` disables scheduled runs
    pub schedule_interval: Option<String>,
    /// How often trigger watchers poll the monitor
    pub trigger_poll_interval_seconds: u64,
    /// How long shutdown waits for triggered runs before aborting them
    pub shutdown_timeout_seconds: u64,
}

impl PipelineSettings {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_seconds)
    }

    pub fn trigger_poll_interval(&self) -> Duration {
        Duration::from_secs(self.trigger_poll_interval_seconds.max(1))
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_seconds)
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 4,
            default_retry_count: 3,
            default_timeout_seconds: 3600,
            schedule_interval: Some("0 2 * * *".to_string()),
            trigger_poll_interval_seconds: 300,
            shutdown_timeout_seconds: 30,
        }
    }
}

/// Exponential backoff between task attempts
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub base_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub max_delay_ms: u64,
    pub jitter_factor: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1000,
            backoff_multiplier: 2.0,
            max_delay_ms: 300_000,
            jitter_factor: 0.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Overrides the per-environment default level when set
    pub log_level: Option<String>,
    pub log_directory: String,
    pub file_output: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: None,
            log_directory: "log".to_string(),
            file_output: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(ModelOpsConfig::default().validate().is_ok());
    }

    #[test]
    fn test_rejects_out_of_range_significance() {
        let mut config = ModelOpsConfig::default();
        config.ab_testing.significance_level = 1.5;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("significance_level"));
    }

    #[test]
    fn test_rejects_non_growing_backoff() {
        let mut config = ModelOpsConfig::default();
        config.backoff.backoff_multiplier = 1.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let yaml = "monitor:\n  drift_threshold: 0.3\n";
        let config: ModelOpsConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.monitor.drift_threshold, 0.3);
        assert_eq!(config.monitor.bucket_seconds, 10);
        assert_eq!(config.pipeline.max_concurrent_tasks, 4);
    }
}
