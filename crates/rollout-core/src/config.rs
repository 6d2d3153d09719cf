//! Reconciler configuration
//!
//! Every tunable has a default, so a TOML file only needs the keys it
//! overrides.

use crate::error::ConfigError;
use crate::health::Thresholds;
use crate::retry::RetryConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Reconciler configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcilerConfig {
    /// Bound on a single telemetry query
    pub probe_timeout_ms: u64,
    /// Health check cadence while validating
    pub probe_interval_ms: u64,
    /// Data points a sample needs to be trusted
    pub min_data_points: u32,
    /// Shadow observation window
    pub shadow_window_secs: u64,
    /// Dwell per traffic step when the request has no override
    pub default_dwell_secs: u64,
    /// Hard cap on a whole rollout
    pub rollout_timeout_secs: u64,
    /// Bound on deploying the target slot
    pub deploy_timeout_secs: u64,
    /// Consecutive WARNING verdicts tolerated before rollback
    pub warning_tolerance: u32,
    /// Finished rollouts kept for status queries; older ones are evicted
    /// and only remain in the history log
    pub finished_retention: usize,
    /// Retry bounds for deploy and routing calls
    pub backend_retry: RetryConfig,
    /// Retry bounds for reverting traffic during rollback
    pub rollback_retry: RetryConfig,
    /// Default health thresholds
    pub thresholds: Thresholds,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            probe_timeout_ms: 5_000,
            probe_interval_ms: 1_000,
            min_data_points: 3,
            shadow_window_secs: 60,
            default_dwell_secs: 30,
            rollout_timeout_secs: 30 * 60,
            deploy_timeout_secs: 300,
            warning_tolerance: 3,
            finished_retention: 256,
            backend_retry: RetryConfig::default(),
            rollback_retry: RetryConfig {
                max_attempts: 3,
                initial_delay_ms: 500,
                ..RetryConfig::default()
            },
            thresholds: Thresholds::default(),
        }
    }
}

impl ReconcilerConfig {
    /// Create default configuration
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse from TOML
    ///
    /// # Errors
    /// Returns `ConfigError::Parse` on malformed TOML and
    /// `ConfigError::Invalid` on inconsistent values.
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file
    ///
    /// # Errors
    /// Returns `ConfigError::Io` if the file cannot be read, otherwise as
    /// [`ReconcilerConfig::from_toml_str`].
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let source = std::fs::read_to_string(path)?;
        Self::from_toml_str(&source)
    }

    /// Check values are usable
    ///
    /// # Errors
    /// Returns `ConfigError::Invalid` describing the first bad value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.probe_interval_ms == 0 {
            return Err(ConfigError::Invalid("probe_interval_ms must be > 0".to_string()));
        }
        if self.probe_timeout_ms == 0 {
            return Err(ConfigError::Invalid("probe_timeout_ms must be > 0".to_string()));
        }
        if self.default_dwell_secs == 0 {
            return Err(ConfigError::Invalid("default_dwell_secs must be > 0".to_string()));
        }
        if self.rollout_timeout_secs == 0 {
            return Err(ConfigError::Invalid("rollout_timeout_secs must be > 0".to_string()));
        }
        self.backend_retry
            .validate("backend_retry")
            .map_err(ConfigError::Invalid)?;
        self.rollback_retry
            .validate("rollback_retry")
            .map_err(ConfigError::Invalid)?;
        self.thresholds.validate().map_err(ConfigError::Invalid)
    }

    /// With shadow window
    #[inline]
    #[must_use]
    pub fn with_shadow_window(mut self, window: Duration) -> Self {
        self.shadow_window_secs = window.as_secs();
        self
    }

    /// With default dwell
    #[inline]
    #[must_use]
    pub fn with_default_dwell(mut self, dwell: Duration) -> Self {
        self.default_dwell_secs = dwell.as_secs();
        self
    }

    /// With rollout timeout
    #[inline]
    #[must_use]
    pub fn with_rollout_timeout(mut self, timeout: Duration) -> Self {
        self.rollout_timeout_secs = timeout.as_secs();
        self
    }

    /// With warning tolerance
    #[inline]
    #[must_use]
    pub fn with_warning_tolerance(mut self, tolerance: u32) -> Self {
        self.warning_tolerance = tolerance;
        self
    }

    /// With finished-rollout retention
    #[inline]
    #[must_use]
    pub fn with_finished_retention(mut self, retention: usize) -> Self {
        self.finished_retention = retention;
        self
    }

    /// With default thresholds
    #[inline]
    #[must_use]
    pub fn with_thresholds(mut self, thresholds: Thresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    #[inline]
    #[must_use]
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    #[inline]
    #[must_use]
    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    #[inline]
    #[must_use]
    pub fn shadow_window(&self) -> Duration {
        Duration::from_secs(self.shadow_window_secs)
    }

    #[inline]
    #[must_use]
    pub fn default_dwell(&self) -> Duration {
        Duration::from_secs(self.default_dwell_secs)
    }

    #[inline]
    #[must_use]
    pub fn rollout_timeout(&self) -> Duration {
        Duration::from_secs(self.rollout_timeout_secs)
    }

    #[inline]
    #[must_use]
    pub fn deploy_timeout(&self) -> Duration {
        Duration::from_secs(self.deploy_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = ReconcilerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.probe_timeout(), Duration::from_secs(5));
        assert_eq!(config.probe_interval(), Duration::from_secs(1));
        assert_eq!(config.shadow_window(), Duration::from_secs(60));
        assert_eq!(config.rollout_timeout(), Duration::from_secs(1800));
        assert_eq!(config.warning_tolerance, 3);
        assert_eq!(config.rollback_retry.max_attempts, 3);
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = ReconcilerConfig::from_toml_str(
            r#"
            shadow_window_secs = 10
            warning_tolerance = 1

            [thresholds]
            hard_latency_delta = 25.0
            zero_tolerance = ["compliance_violations"]
            "#,
        )
        .unwrap();

        assert_eq!(config.shadow_window_secs, 10);
        assert_eq!(config.warning_tolerance, 1);
        assert_eq!(config.probe_interval_ms, 1_000);
        assert!((config.thresholds.hard_latency_delta - 25.0).abs() < f64::EPSILON);
        assert!((config.thresholds.soft_latency_fraction - 0.10).abs() < f64::EPSILON);
        assert!(config.thresholds.zero_tolerance.contains("compliance_violations"));
    }

    #[test]
    fn rejects_zero_interval() {
        let err = ReconcilerConfig::from_toml_str("probe_interval_ms = 0").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn rejects_inconsistent_thresholds() {
        let err = ReconcilerConfig::from_toml_str(
            r#"
            [thresholds]
            hard_throughput_drop = 0.05
            soft_throughput_drop = 0.10
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn rejects_negative_backoff_multiplier() {
        let err = ReconcilerConfig::from_toml_str(
            r#"
            [backend_retry]
            backoff_multiplier = -1.0
            "#,
        )
        .unwrap_err();
        assert!(matches!(&err, ConfigError::Invalid(msg) if msg.starts_with("backend_retry.")));

        let err = ReconcilerConfig::from_toml_str(
            r#"
            [rollback_retry]
            backoff_multiplier = 0.5
            "#,
        )
        .unwrap_err();
        assert!(matches!(&err, ConfigError::Invalid(msg) if msg.starts_with("rollback_retry.")));
    }

    #[test]
    fn rejects_zero_rollback_attempts() {
        let err = ReconcilerConfig::from_toml_str(
            r#"
            [rollback_retry]
            max_attempts = 0
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn rejects_malformed_toml() {
        let err = ReconcilerConfig::from_toml_str("shadow_window_secs = \"soon\"").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn loads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reconciler.toml");
        std::fs::write(&path, "default_dwell_secs = 45\n").unwrap();

        let config = ReconcilerConfig::load(&path).unwrap();
        assert_eq!(config.default_dwell(), Duration::from_secs(45));
    }
}
