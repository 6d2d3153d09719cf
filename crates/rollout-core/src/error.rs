//! Error types for the rollout reconciler
//!
//! Provides the failure taxonomy for:
//! - Malformed deployment requests (rejected before any side effect)
//! - Deploy, routing and notification backend failures
//! - Telemetry gaps
//! - Concurrency guard rejections
//! - Rollbacks that could not restore traffic (human escalation)

use crate::types::{Environment, Phase, RolloutId};

/// Top-level reconciler error
#[derive(Debug, thiserror::Error)]
pub enum RolloutError {
    /// Malformed deployment request
    #[error("invalid request: {0}")]
    Validation(#[from] ValidationError),

    /// Deploy or routing backend failed
    #[error("backend failure: {0}")]
    Backend(#[from] BackendError),

    /// Telemetry could not produce a usable sample
    #[error("probe failure: {0}")]
    Probe(#[from] ProbeError),

    /// Control surface rejected the call
    #[error("control error: {0}")]
    Control(#[from] ControlError),

    /// Baseline store failure
    #[error("baseline error: {0}")]
    Baseline(#[from] BaselineError),

    /// History log failure
    #[error("history error: {0}")]
    History(#[from] HistoryError),

    /// Configuration failure
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Rollback could not revert traffic
    #[error(transparent)]
    RollbackFailed(#[from] RollbackFailed),
}

impl RolloutError {
    /// Check if error requires a human to act
    #[inline]
    #[must_use]
    pub fn requires_human(&self) -> bool {
        matches!(self, Self::RollbackFailed(_))
    }

    /// Check if error is retryable
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Backend(e) => e.transient,
            _ => false,
        }
    }
}

/// Request shape violations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// Environment name is blank
    #[error("environment name must not be empty")]
    EmptyEnvironment,

    /// Artifact reference is blank
    #[error("artifact reference must not be empty")]
    EmptyArtifact,

    /// No traffic steps given
    #[error("traffic schedule must contain at least one step")]
    EmptySchedule,

    /// Step outside 1..=100
    #[error("step {index} has percentage {value}, expected 1..=100")]
    PercentageOutOfRange { index: usize, value: u8 },

    /// Steps must strictly increase
    #[error("step {index} ({value}%) does not increase on previous step ({previous}%)")]
    NonMonotonicSchedule { index: usize, previous: u8, value: u8 },

    /// Final step must route all traffic
    #[error("final step must be 100%, got {last}%")]
    FinalStepNotFull { last: u8 },

    /// Dwell of zero would skip observation
    #[error("dwell duration must be greater than zero")]
    ZeroDwell,
}

/// Which external collaborator failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Artifact deploy backend
    Deploy,
    /// Traffic routing backend
    Routing,
    /// Notification sink
    Notification,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Deploy => "deploy",
            Self::Routing => "routing",
            Self::Notification => "notification",
        };
        f.write_str(name)
    }
}

/// Failure reported by an external backend
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind} backend: {message}")]
pub struct BackendError {
    /// Failing collaborator
    pub kind: BackendKind,
    /// Backend-provided description
    pub message: String,
    /// Whether a retry may succeed
    pub transient: bool,
}

impl BackendError {
    /// Permanent deploy backend failure
    #[inline]
    pub fn deploy(message: impl Into<String>) -> Self {
        Self {
            kind: BackendKind::Deploy,
            message: message.into(),
            transient: false,
        }
    }

    /// Permanent routing backend failure
    #[inline]
    pub fn routing(message: impl Into<String>) -> Self {
        Self {
            kind: BackendKind::Routing,
            message: message.into(),
            transient: false,
        }
    }

    /// Notification delivery failure
    #[inline]
    pub fn notification(message: impl Into<String>) -> Self {
        Self {
            kind: BackendKind::Notification,
            message: message.into(),
            transient: true,
        }
    }

    /// Mark as transient
    #[inline]
    #[must_use]
    pub fn transient(mut self) -> Self {
        self.transient = true;
        self
    }
}

/// Telemetry gaps
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProbeError {
    /// Backend unreachable or did not answer in time
    #[error("telemetry for {environment} unavailable: {reason}")]
    Unavailable { environment: String, reason: String },

    /// Too few underlying data points to trust the sample
    #[error("telemetry for {environment} incomplete: {got} data points, need {required}")]
    IncompleteSample {
        environment: String,
        got: u32,
        required: u32,
    },
}

impl ProbeError {
    /// Backend unreachable
    #[inline]
    pub fn unavailable(environment: &Environment, reason: impl Into<String>) -> Self {
        Self::Unavailable {
            environment: environment.to_string(),
            reason: reason.into(),
        }
    }
}

/// Control surface rejections
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ControlError {
    /// Environment already has an active rollout
    #[error("rollout {active} already in progress for {environment}")]
    RolloutInProgress {
        environment: String,
        active: RolloutId,
    },

    /// Unknown rollout id
    #[error("rollout not found: {0}")]
    NotFound(RolloutId),

    /// Rollout already reached a terminal phase
    #[error("rollout {id} already finished in {phase}")]
    AlreadyFinished { id: RolloutId, phase: Phase },

    /// Rollout has not reached a terminal phase yet
    #[error("rollout {id} still active in {phase}")]
    StillActive { id: RolloutId, phase: Phase },

    /// Request rejected before any side effect
    #[error("invalid request: {0}")]
    Validation(#[from] ValidationError),

    /// Rollout task panicked or was cancelled by the runtime
    #[error("rollout task failed: {0}")]
    TaskFailed(String),
}

/// Baseline store failures
#[derive(Debug, thiserror::Error)]
pub enum BaselineError {
    /// No baseline recorded for environment
    #[error("no baseline for environment {0}")]
    NotFound(String),

    /// Baseline already recorded, bootstrap refused
    #[error("baseline for environment {0} already exists")]
    AlreadyPresent(String),

    /// Grant and snapshot disagree on environment
    #[error("finalize grant for {grant} cannot commit snapshot of {snapshot}")]
    EnvironmentMismatch { grant: String, snapshot: String },

    /// Backing file could not be read or written
    #[error("baseline persistence failed: {0}")]
    Persistence(String),
}

/// History log failures
#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    /// Backing file I/O failed
    #[error("history I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// Record could not be (de)serialized
    #[error("history record malformed at line {line}: {message}")]
    Malformed { line: usize, message: String },

    /// Record could not be encoded
    #[error("history encode failed: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Configuration failures
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// File could not be read
    #[error("config I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// TOML could not be parsed
    #[error("config parse failed: {0}")]
    Parse(#[from] toml::de::Error),

    /// Parsed values are inconsistent
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Traffic could not be reverted; a human must intervene
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("rollback of {rollout_id} in {environment} failed after {attempts} attempts: {last_error}")]
pub struct RollbackFailed {
    /// Rollout being reverted
    pub rollout_id: RolloutId,
    /// Environment left with mixed traffic
    pub environment: String,
    /// Revert attempts made
    pub attempts: u32,
    /// Last routing failure
    pub last_error: BackendError,
}
