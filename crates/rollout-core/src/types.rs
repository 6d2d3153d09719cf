//! Core types for the reconciler
//!
//! Defines the fundamental values a rollout works with:
//! - Identifiers for rollouts, environments and artifacts
//! - Deployment requests and their rollback policy
//! - Metric snapshots and baselines
//! - Rollout phases and the mutable rollout state

use crate::error::ValidationError;
use crate::health::{HealthVerdict, Thresholds};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use ulid::Ulid;

/// Unique rollout identifier (ULID for sortability)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RolloutId(pub Ulid);

impl RolloutId {
    /// Generate new rollout ID
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for RolloutId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RolloutId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Target environment name
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Environment(String);

impl Environment {
    /// Create environment name
    #[inline]
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Borrow as str
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Environment {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for Environment {
    fn from(name: String) -> Self {
        Self(name)
    }
}

impl std::fmt::Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(&self.0)
    }
}

/// Artifact identifier (e.g. image tag)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArtifactRef(String);

impl ArtifactRef {
    /// Create artifact reference
    #[inline]
    pub fn new(reference: impl Into<String>) -> Self {
        Self(reference.into())
    }

    /// Borrow as str
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ArtifactRef {
    fn from(reference: &str) -> Self {
        Self::new(reference)
    }
}

impl std::fmt::Display for ArtifactRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(&self.0)
    }
}

/// Urgency class of a rollout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UrgencyClass {
    /// Regular release train
    #[default]
    Standard,
    /// Prioritised release
    Expedited,
    /// Hotfix: observation windows are halved
    Emergency,
}

impl UrgencyClass {
    /// Scale an observation window for this class
    ///
    /// Emergency rollouts halve the window, never dropping below `floor`.
    #[inline]
    #[must_use]
    pub fn scale(&self, window: Duration, floor: Duration) -> Duration {
        match self {
            Self::Standard | Self::Expedited => window,
            Self::Emergency => (window / 2).max(floor),
        }
    }
}

/// Rollback behaviour requested by the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RollbackPolicy {
    /// Consecutive warnings tolerated; `None` uses the configured default
    pub warning_tolerance: Option<u32>,
    /// Remove the target slot after traffic is reverted
    pub cleanup_target: bool,
}

impl Default for RollbackPolicy {
    fn default() -> Self {
        Self {
            warning_tolerance: None,
            cleanup_target: true,
        }
    }
}

/// Request to move an environment to a new artifact
///
/// Read-only for the lifetime of one rollout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentRequest {
    /// Artifact to roll out
    pub artifact: ArtifactRef,
    /// Environment to roll out to
    pub environment: Environment,
    /// Urgency class
    #[serde(default)]
    pub urgency: UrgencyClass,
    /// Ordered traffic percentages for the new version
    #[serde(default = "default_steps")]
    pub steps: Vec<u8>,
    /// Per-step dwell override in milliseconds
    #[serde(default)]
    pub dwell_ms: Option<u64>,
    /// Rollback behaviour
    #[serde(default)]
    pub rollback_policy: RollbackPolicy,
    /// Threshold override
    #[serde(default)]
    pub thresholds: Option<Thresholds>,
}

fn default_steps() -> Vec<u8> {
    DeploymentRequest::DEFAULT_STEPS.to_vec()
}

impl DeploymentRequest {
    /// Default schedule when none is supplied
    pub const DEFAULT_STEPS: [u8; 4] = [1, 5, 25, 100];

    /// Create new request with the default schedule
    #[inline]
    pub fn new(environment: impl Into<Environment>, artifact: impl Into<ArtifactRef>) -> Self {
        Self {
            artifact: artifact.into(),
            environment: environment.into(),
            urgency: UrgencyClass::Standard,
            steps: Self::DEFAULT_STEPS.to_vec(),
            dwell_ms: None,
            rollback_policy: RollbackPolicy::default(),
            thresholds: None,
        }
    }

    /// With traffic schedule
    #[inline]
    #[must_use]
    pub fn with_steps(mut self, steps: Vec<u8>) -> Self {
        self.steps = steps;
        self
    }

    /// With per-step dwell
    #[inline]
    #[must_use]
    pub fn with_dwell(mut self, dwell: Duration) -> Self {
        self.dwell_ms = Some(u64::try_from(dwell.as_millis()).unwrap_or(u64::MAX));
        self
    }

    /// With urgency class
    #[inline]
    #[must_use]
    pub fn with_urgency(mut self, urgency: UrgencyClass) -> Self {
        self.urgency = urgency;
        self
    }

    /// With rollback policy
    #[inline]
    #[must_use]
    pub fn with_rollback_policy(mut self, policy: RollbackPolicy) -> Self {
        self.rollback_policy = policy;
        self
    }

    /// With threshold override
    #[inline]
    #[must_use]
    pub fn with_thresholds(mut self, thresholds: Thresholds) -> Self {
        self.thresholds = Some(thresholds);
        self
    }

    /// Dwell override, if any
    #[inline]
    #[must_use]
    pub fn dwell(&self) -> Option<Duration> {
        self.dwell_ms.map(Duration::from_millis)
    }

    /// Check request shape
    ///
    /// # Errors
    /// Returns the first violation found.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.environment.as_str().trim().is_empty() {
            return Err(ValidationError::EmptyEnvironment);
        }
        if self.artifact.as_str().trim().is_empty() {
            return Err(ValidationError::EmptyArtifact);
        }
        if self.dwell_ms == Some(0) {
            return Err(ValidationError::ZeroDwell);
        }

        let Some(&last) = self.steps.last() else {
            return Err(ValidationError::EmptySchedule);
        };

        let mut previous = 0u8;
        for (index, &value) in self.steps.iter().enumerate() {
            if value == 0 || value > 100 {
                return Err(ValidationError::PercentageOutOfRange { index, value });
            }
            if index > 0 && value <= previous {
                return Err(ValidationError::NonMonotonicSchedule {
                    index,
                    previous,
                    value,
                });
            }
            previous = value;
        }

        if last != 100 {
            return Err(ValidationError::FinalStepNotFull { last });
        }
        Ok(())
    }
}

/// Point-in-time metrics for one environment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSnapshot {
    /// Environment sampled
    pub environment: Environment,
    /// Latency in milliseconds
    pub latency_ms: f64,
    /// Requests per second
    pub throughput: f64,
    /// Error ratio in 0..=1
    pub error_rate: f64,
    /// Domain-specific signals (e.g. compliance violation counts)
    #[serde(default)]
    pub extensions: BTreeMap<String, f64>,
    /// Underlying data points aggregated into this sample
    pub data_points: u32,
    /// Capture time
    pub captured_at: DateTime<Utc>,
}

impl MetricSnapshot {
    /// Create snapshot captured now
    #[inline]
    pub fn new(
        environment: impl Into<Environment>,
        latency_ms: f64,
        throughput: f64,
        error_rate: f64,
    ) -> Self {
        Self {
            environment: environment.into(),
            latency_ms,
            throughput,
            error_rate,
            extensions: BTreeMap::new(),
            data_points: 1,
            captured_at: Utc::now(),
        }
    }

    /// With extension signal
    #[inline]
    #[must_use]
    pub fn with_extension(mut self, name: impl Into<String>, value: f64) -> Self {
        self.extensions.insert(name.into(), value);
        self
    }

    /// With data point count
    #[inline]
    #[must_use]
    pub fn with_data_points(mut self, data_points: u32) -> Self {
        self.data_points = data_points;
        self
    }
}

/// Last known-good snapshot for an environment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Baseline {
    /// Accepted snapshot
    pub snapshot: MetricSnapshot,
    /// When the snapshot was accepted
    pub captured_at: DateTime<Utc>,
    /// Rollout that promoted it; `None` for bootstrapped or provisional baselines
    pub committed_by: Option<RolloutId>,
}

impl Baseline {
    /// Uncommitted baseline used when an environment has none on record
    #[inline]
    #[must_use]
    pub fn provisional(snapshot: MetricSnapshot) -> Self {
        Self {
            captured_at: snapshot.captured_at,
            snapshot,
            committed_by: None,
        }
    }

    /// Environment this baseline belongs to
    #[inline]
    #[must_use]
    pub fn environment(&self) -> &Environment {
        &self.snapshot.environment
    }
}

/// Rollout phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum Phase {
    /// Accepted, not yet started
    Pending,
    /// Running pre-deployment validations
    Precheck,
    /// Deploying the artifact to a 0% target slot
    DeployingTarget,
    /// Observing the target without live traffic
    ShadowValidating,
    /// Holding traffic step `step`
    Migrating { step: usize },
    /// Retiring the old version and promoting the baseline
    Finalizing,
    /// Terminal success
    Completed,
    /// Compensating actions in progress
    RollingBack,
    /// Terminal failure, traffic restored
    RolledBack,
    /// Terminal failure, traffic could not be restored
    RollbackFailed,
    /// Terminal, cancelled by an operator
    Aborted,
}

impl Phase {
    /// Whether no further transitions are possible
    #[inline]
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::RolledBack | Self::RollbackFailed | Self::Aborted
        )
    }

    /// Whether the phase observes health on a cadence
    #[inline]
    #[must_use]
    pub fn is_validating(&self) -> bool {
        matches!(self, Self::ShadowValidating | Self::Migrating { .. })
    }

    /// Check whether `next` is a legal successor
    #[must_use]
    pub fn can_transition_to(&self, next: Phase) -> bool {
        use Phase::*;
        if self.is_terminal() {
            return false;
        }
        match (*self, next) {
            (RollingBack, RolledBack | RollbackFailed) => true,
            (RollingBack, _) => false,
            (_, Aborted) => true,
            (Pending, Precheck) => true,
            (Precheck, DeployingTarget | RolledBack) => true,
            (DeployingTarget, ShadowValidating) => true,
            (ShadowValidating, Migrating { step: 0 }) => true,
            (Migrating { step: a }, Migrating { step: b }) => b == a + 1,
            (Migrating { .. }, Finalizing) => true,
            (Finalizing, Completed) => true,
            (_, RollingBack) => true,
            // Abort compensation that cannot revert escalates directly
            (_, RollbackFailed) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => f.write_str("PENDING"),
            Self::Precheck => f.write_str("PRECHECK"),
            Self::DeployingTarget => f.write_str("DEPLOYING_TARGET"),
            Self::ShadowValidating => f.write_str("SHADOW_VALIDATING"),
            Self::Migrating { step } => write!(f, "MIGRATING(step={step})"),
            Self::Finalizing => f.write_str("FINALIZING"),
            Self::Completed => f.write_str("COMPLETED"),
            Self::RollingBack => f.write_str("ROLLING_BACK"),
            Self::RolledBack => f.write_str("ROLLED_BACK"),
            Self::RollbackFailed => f.write_str("ROLLBACK_FAILED"),
            Self::Aborted => f.write_str("ABORTED"),
        }
    }
}

/// Why a rollout left the happy path
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureReport {
    /// Human-readable cause
    pub reason: String,
    /// Verdict that drove the escalation, if health-related
    pub verdict: Option<HealthVerdict>,
}

/// Mutable state of one rollout
///
/// Owned by a single orchestrator task; everyone else reads snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RolloutState {
    /// Rollout identifier
    pub id: RolloutId,
    /// Originating request
    pub request: DeploymentRequest,
    /// Current phase
    pub phase: Phase,
    /// Percentage of traffic on the new version
    pub traffic_percent: u8,
    /// Index into the schedule, once migrating
    pub step_index: Option<usize>,
    /// Start time
    pub started_at: DateTime<Utc>,
    /// Last mutation time
    pub updated_at: DateTime<Utc>,
    /// Time a terminal phase was reached
    pub finished_at: Option<DateTime<Utc>>,
    /// Most recent health verdict
    pub last_verdict: Option<HealthVerdict>,
    /// Consecutive warning verdicts
    pub violation_count: u32,
    /// Shadow validation ended in WARNING
    pub degraded_start: bool,
    /// Target slot has been (or is being) deployed
    pub target_deployed: bool,
    /// Cause of any escalation
    pub failure: Option<FailureReport>,
}

impl RolloutState {
    /// Create pending state for a request
    #[must_use]
    pub fn new(id: RolloutId, request: DeploymentRequest) -> Self {
        let now = Utc::now();
        Self {
            id,
            request,
            phase: Phase::Pending,
            traffic_percent: 0,
            step_index: None,
            started_at: now,
            updated_at: now,
            finished_at: None,
            last_verdict: None,
            violation_count: 0,
            degraded_start: false,
            target_deployed: false,
            failure: None,
        }
    }

    /// Environment being rolled out to
    #[inline]
    #[must_use]
    pub fn environment(&self) -> &Environment {
        &self.request.environment
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(steps: Vec<u8>) -> DeploymentRequest {
        DeploymentRequest::new("prod", "api:v2").with_steps(steps)
    }

    #[test]
    fn request_defaults_validate() {
        assert!(DeploymentRequest::new("prod", "api:v2").validate().is_ok());
    }

    #[test]
    fn request_rejects_blank_names() {
        assert_eq!(
            DeploymentRequest::new(" ", "api:v2").validate(),
            Err(ValidationError::EmptyEnvironment)
        );
        assert_eq!(
            DeploymentRequest::new("prod", "").validate(),
            Err(ValidationError::EmptyArtifact)
        );
    }

    #[test]
    fn request_rejects_bad_schedules() {
        assert_eq!(request(vec![]).validate(), Err(ValidationError::EmptySchedule));
        assert_eq!(
            request(vec![0, 100]).validate(),
            Err(ValidationError::PercentageOutOfRange { index: 0, value: 0 })
        );
        assert_eq!(
            request(vec![10, 120]).validate(),
            Err(ValidationError::PercentageOutOfRange { index: 1, value: 120 })
        );
        assert_eq!(
            request(vec![25, 25, 100]).validate(),
            Err(ValidationError::NonMonotonicSchedule {
                index: 1,
                previous: 25,
                value: 25
            })
        );
        assert_eq!(
            request(vec![5, 50]).validate(),
            Err(ValidationError::FinalStepNotFull { last: 50 })
        );
    }

    #[test]
    fn request_rejects_zero_dwell() {
        let req = request(vec![100]).with_dwell(Duration::ZERO);
        assert_eq!(req.validate(), Err(ValidationError::ZeroDwell));
    }

    #[test]
    fn emergency_halves_windows_with_floor() {
        let floor = Duration::from_secs(1);
        assert_eq!(
            UrgencyClass::Emergency.scale(Duration::from_secs(60), floor),
            Duration::from_secs(30)
        );
        assert_eq!(UrgencyClass::Emergency.scale(Duration::from_secs(1), floor), floor);
        assert_eq!(
            UrgencyClass::Standard.scale(Duration::from_secs(60), floor),
            Duration::from_secs(60)
        );
    }

    #[test]
    fn phase_transitions_follow_state_machine() {
        assert!(Phase::Pending.can_transition_to(Phase::Precheck));
        assert!(Phase::Precheck.can_transition_to(Phase::RolledBack));
        assert!(Phase::ShadowValidating.can_transition_to(Phase::Migrating { step: 0 }));
        assert!(Phase::Migrating { step: 1 }.can_transition_to(Phase::Migrating { step: 2 }));
        assert!(!Phase::Migrating { step: 1 }.can_transition_to(Phase::Migrating { step: 0 }));
        assert!(!Phase::Migrating { step: 1 }.can_transition_to(Phase::Migrating { step: 3 }));
        assert!(Phase::Migrating { step: 3 }.can_transition_to(Phase::RollingBack));
        assert!(Phase::RollingBack.can_transition_to(Phase::RolledBack));
        assert!(!Phase::RollingBack.can_transition_to(Phase::Completed));
        assert!(!Phase::Completed.can_transition_to(Phase::RollingBack));
        assert!(!Phase::Aborted.can_transition_to(Phase::Aborted));
    }

    #[test]
    fn phase_display() {
        assert_eq!(Phase::Migrating { step: 2 }.to_string(), "MIGRATING(step=2)");
        assert_eq!(Phase::RolledBack.to_string(), "ROLLED_BACK");
    }
}
