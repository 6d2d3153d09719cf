//! Rollout Core - progressive deployment reconciler
//!
//! Drives an environment from its current version to a requested artifact
//! through a series of traffic-shifting steps:
//! - Pre-deployment checks and target slot deployment
//! - Shadow validation of the target before it receives traffic
//! - Stepwise traffic migration with continuous health evaluation
//! - Automatic rollback on health violations, timeouts or backend failures
//! - Baseline promotion once a rollout completes
//!
//! # Example
//!
//! ```rust,ignore
//! use rollout_core::prelude::*;
//!
//! # async fn example(deps: Collaborators) -> Result<(), Box<dyn std::error::Error>> {
//! let controller = RolloutController::new(ReconcilerConfig::default(), deps)?;
//!
//! let request = DeploymentRequest::new("payments", "payments:v2.4.1")
//!     .with_steps(vec![5, 25, 100]);
//! let id = controller.start_rollout(request)?;
//!
//! let state = controller.wait(id).await?;
//! println!("rollout {} finished in {}", id, state.phase);
//! # Ok(())
//! # }
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

pub mod baseline;
pub mod config;
pub mod controller;
pub mod deploy;
pub mod error;
pub mod events;
pub mod health;
pub mod history;
pub mod orchestrator;
pub mod probe;
pub mod retry;
pub mod rollback;
pub mod simulation;
pub mod traffic;
pub mod types;

// Re-exports for convenience
pub use baseline::{BaselineStore, FinalizeGrant};
pub use config::ReconcilerConfig;
pub use controller::RolloutController;
pub use deploy::{DeployBackend, PreDeploymentValidator, PrecheckReport};
pub use error::{
    BackendError, BackendKind, BaselineError, ConfigError, ControlError, HistoryError,
    ProbeError, RollbackFailed, RolloutError, ValidationError,
};
pub use events::{ChannelSink, FanoutSink, NotificationSink, RolloutEvent, RolloutEventKind, TracingSink};
pub use health::{Check, HealthEvaluator, HealthVerdict, Thresholds, Trigger, Verdict};
pub use history::{HistoryEntry, HistoryLog, HistoryRecord, Outcome};
pub use orchestrator::{Collaborators, DeploymentOrchestrator};
pub use probe::{MetricsProbe, TelemetryBackend, TelemetryReading};
pub use retry::{retry_with_backoff, RetryConfig, Retryable};
pub use rollback::{RollbackCoordinator, RollbackOutcome, RollbackTrigger};
pub use traffic::{InMemoryTrafficController, RoutingChange, TrafficController};
pub use types::{
    ArtifactRef, Baseline, DeploymentRequest, Environment, FailureReport, MetricSnapshot, Phase,
    RollbackPolicy, RolloutId, RolloutState, UrgencyClass,
};

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for driving rollouts
    pub use crate::{
        BaselineStore, Collaborators, DeploymentRequest, Environment, HealthVerdict, HistoryLog,
        MetricSnapshot, Phase, ReconcilerConfig, RolloutController, RolloutId, RolloutState,
        Thresholds, Verdict,
    };
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
