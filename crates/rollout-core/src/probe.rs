//! Metrics probe
//!
//! Wraps a telemetry backend with the two guards every sample needs: a
//! bounded query time and a minimum number of underlying data points.

use crate::config::ReconcilerConfig;
use crate::error::ProbeError;
use crate::types::{Environment, MetricSnapshot};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

#[cfg(test)]
use mockall::automock;

/// Raw aggregate returned by a telemetry backend
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct TelemetryReading {
    /// Latency in milliseconds
    pub latency_ms: f64,
    /// Requests per second
    pub throughput: f64,
    /// Error ratio in 0..=1
    pub error_rate: f64,
    /// Domain-specific signals
    #[serde(default)]
    pub extensions: BTreeMap<String, f64>,
    /// Underlying data points aggregated
    pub data_points: u32,
}

impl TelemetryReading {
    /// Create reading
    #[inline]
    #[must_use]
    pub fn new(latency_ms: f64, throughput: f64, error_rate: f64, data_points: u32) -> Self {
        Self {
            latency_ms,
            throughput,
            error_rate,
            extensions: BTreeMap::new(),
            data_points,
        }
    }

    /// With extension signal
    #[inline]
    #[must_use]
    pub fn with_extension(mut self, name: impl Into<String>, value: f64) -> Self {
        self.extensions.insert(name.into(), value);
        self
    }
}

/// External telemetry source (metrics store, APM, mesh telemetry)
#[cfg_attr(test, automock)]
#[async_trait]
pub trait TelemetryBackend: Send + Sync {
    /// Query the current aggregate for an environment
    async fn query(&self, environment: &Environment) -> Result<TelemetryReading, ProbeError>;
}

/// Read-only sampler with timeout and sample-size guards
#[derive(Clone)]
pub struct MetricsProbe {
    backend: Arc<dyn TelemetryBackend>,
    timeout: Duration,
    min_data_points: u32,
}

impl std::fmt::Debug for MetricsProbe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsProbe")
            .field("timeout", &self.timeout)
            .field("min_data_points", &self.min_data_points)
            .finish_non_exhaustive()
    }
}

impl MetricsProbe {
    /// Create probe
    #[inline]
    #[must_use]
    pub fn new(backend: Arc<dyn TelemetryBackend>, timeout: Duration, min_data_points: u32) -> Self {
        Self {
            backend,
            timeout,
            min_data_points,
        }
    }

    /// Create probe with configured bounds
    #[inline]
    #[must_use]
    pub fn from_config(backend: Arc<dyn TelemetryBackend>, config: &ReconcilerConfig) -> Self {
        Self::new(backend, config.probe_timeout(), config.min_data_points)
    }

    /// Sample current metrics
    ///
    /// # Errors
    /// - `ProbeError::Unavailable` if the backend fails or exceeds the timeout
    /// - `ProbeError::IncompleteSample` if too few data points back the sample
    pub async fn sample(&self, environment: &Environment) -> Result<MetricSnapshot, ProbeError> {
        let reading = tokio::time::timeout(self.timeout, self.backend.query(environment))
            .await
            .map_err(|_| {
                ProbeError::unavailable(
                    environment,
                    format!("no response within {}ms", self.timeout.as_millis()),
                )
            })??;

        if reading.data_points < self.min_data_points {
            return Err(ProbeError::IncompleteSample {
                environment: environment.to_string(),
                got: reading.data_points,
                required: self.min_data_points,
            });
        }

        Ok(MetricSnapshot {
            environment: environment.clone(),
            latency_ms: reading.latency_ms,
            throughput: reading.throughput,
            error_rate: reading.error_rate,
            extensions: reading.extensions,
            data_points: reading.data_points,
            captured_at: Utc::now(),
        })
    }
}
