//! Rollback coordination
//!
//! Compensating actions for a failed or aborted rollout, in order:
//! 1. Revert traffic to 0% (retried with backoff; exhaustion is fatal)
//! 2. Remove the target slot (best effort)
//! 3. Alert with the triggering verdict (best effort)
//!
//! The baseline is never touched here.

use crate::deploy::DeployBackend;
use crate::error::RollbackFailed;
use crate::events::{NotificationSink, RolloutEvent, RolloutEventKind};
use crate::retry::{retry_with_backoff, RetryConfig};
use crate::traffic::TrafficController;
use crate::types::RolloutState;
use std::sync::Arc;

/// Why compensating actions are running
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollbackTrigger {
    /// Health, backend or timeout failure
    Failure,
    /// Operator abort with traffic already shifted
    OperatorAbort,
}

/// What the compensating actions achieved
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollbackOutcome {
    /// Traffic is back at 0%
    pub reverted: bool,
    /// Revert calls made
    pub revert_attempts: u32,
    /// Target slot removal result; `None` when not attempted
    pub target_removed: Option<bool>,
    /// Alert delivered
    pub alert_sent: bool,
}

impl RollbackOutcome {
    /// Whether every attempted step succeeded
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.reverted && self.target_removed != Some(false)
    }
}

/// Executes rollbacks against the routing and deploy backends
#[derive(Clone)]
pub struct RollbackCoordinator {
    traffic: Arc<dyn TrafficController>,
    deploy: Arc<dyn DeployBackend>,
    sink: Arc<dyn NotificationSink>,
    retry: RetryConfig,
}

impl std::fmt::Debug for RollbackCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RollbackCoordinator")
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl RollbackCoordinator {
    /// Create coordinator
    #[must_use]
    pub fn new(
        traffic: Arc<dyn TrafficController>,
        deploy: Arc<dyn DeployBackend>,
        sink: Arc<dyn NotificationSink>,
        retry: RetryConfig,
    ) -> Self {
        Self {
            traffic,
            deploy,
            sink,
            retry,
        }
    }

    /// Run the compensating actions for `state`
    ///
    /// # Errors
    /// Returns [`RollbackFailed`] when traffic could not be reverted within
    /// the retry bound. A `RollbackFailed` event has already been published.
    pub async fn execute(
        &self,
        state: &RolloutState,
        trigger: RollbackTrigger,
    ) -> Result<RollbackOutcome, RollbackFailed> {
        let environment = state.environment();
        let reason = state
            .failure
            .as_ref()
            .map_or_else(|| "operator abort".to_string(), |f| f.reason.clone());

        tracing::warn!(
            rollout_id = %state.id,
            environment = %environment,
            traffic = state.traffic_percent,
            trigger = ?trigger,
            reason = %reason,
            "Reverting traffic"
        );

        let (reverted, revert_attempts) =
            retry_with_backoff(&self.retry, "traffic.revert", || self.traffic.revert(environment))
                .await;

        if let Err(last_error) = reverted {
            let failure = RollbackFailed {
                rollout_id: state.id,
                environment: environment.to_string(),
                attempts: revert_attempts,
                last_error,
            };
            self.notify(
                state,
                RolloutEventKind::RollbackFailed {
                    reason,
                    attempts: revert_attempts,
                    error: failure.last_error.to_string(),
                },
            )
            .await;
            return Err(failure);
        }

        let target_removed = if state.target_deployed && state.request.rollback_policy.cleanup_target
        {
            Some(self.release_target(state).await)
        } else {
            None
        };

        let alert_sent = match trigger {
            RollbackTrigger::Failure => {
                self.notify(
                    state,
                    RolloutEventKind::RolledBack {
                        reason,
                        cleanup_ok: target_removed != Some(false),
                    },
                )
                .await
            }
            RollbackTrigger::OperatorAbort => false,
        };

        tracing::info!(
            rollout_id = %state.id,
            environment = %environment,
            attempts = revert_attempts,
            target_removed = ?target_removed,
            "Traffic reverted"
        );

        Ok(RollbackOutcome {
            reverted: true,
            revert_attempts,
            target_removed,
            alert_sent,
        })
    }

    /// Remove the target slot; failures are logged and reported as `false`
    pub async fn release_target(&self, state: &RolloutState) -> bool {
        match self
            .deploy
            .remove_target(state.environment(), &state.request.artifact)
            .await
        {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(
                    rollout_id = %state.id,
                    environment = %state.environment(),
                    error = %e,
                    "Target slot cleanup failed"
                );
                false
            }
        }
    }

    async fn notify(&self, state: &RolloutState, kind: RolloutEventKind) -> bool {
        let event = RolloutEvent::new(state.id, state.environment().clone(), kind);
        match self.sink.publish(event).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(rollout_id = %state.id, error = %e, "Alert delivery failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deploy::MockDeployBackend;
    use crate::error::BackendError;
    use crate::events::{ChannelSink, MockNotificationSink};
    use crate::traffic::MockTrafficController;
    use crate::types::{DeploymentRequest, FailureReport, RolloutId};

    fn failed_state() -> RolloutState {
        let mut state =
            RolloutState::new(RolloutId::new(), DeploymentRequest::new("prod", "api:v2"));
        state.traffic_percent = 25;
        state.target_deployed = true;
        state.failure = Some(FailureReport {
            reason: "latency regression".to_string(),
            verdict: None,
        });
        state
    }

    fn fast_retry() -> RetryConfig {
        RetryConfig::with_max_attempts(3).with_initial_delay(std::time::Duration::from_millis(10))
    }

    #[tokio::test(start_paused = true)]
    async fn reverts_once_and_cleans_up() {
        let mut traffic = MockTrafficController::new();
        traffic.expect_revert().times(1).returning(|_| Ok(()));
        let mut deploy = MockDeployBackend::new();
        deploy.expect_remove_target().times(1).returning(|_, _| Ok(()));
        let (sink, mut rx) = ChannelSink::new();

        let coordinator =
            RollbackCoordinator::new(Arc::new(traffic), Arc::new(deploy), Arc::new(sink), fast_retry());
        let outcome = coordinator
            .execute(&failed_state(), RollbackTrigger::Failure)
            .await
            .unwrap();

        assert!(outcome.is_clean());
        assert_eq!(outcome.revert_attempts, 1);
        assert_eq!(outcome.target_removed, Some(true));
        assert!(outcome.alert_sent);
        assert!(matches!(
            rx.try_recv().unwrap().kind,
            RolloutEventKind::RolledBack { cleanup_ok: true, .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_revert_failure_is_retried() {
        let mut traffic = MockTrafficController::new();
        let mut seq = mockall::Sequence::new();
        traffic
            .expect_revert()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Err(BackendError::routing("503").transient()));
        traffic
            .expect_revert()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        let mut deploy = MockDeployBackend::new();
        deploy.expect_remove_target().returning(|_, _| Ok(()));
        let (sink, _rx) = ChannelSink::new();

        let coordinator =
            RollbackCoordinator::new(Arc::new(traffic), Arc::new(deploy), Arc::new(sink), fast_retry());
        let outcome = coordinator
            .execute(&failed_state(), RollbackTrigger::Failure)
            .await
            .unwrap();
        assert_eq!(outcome.revert_attempts, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_revert_escalates() {
        let mut traffic = MockTrafficController::new();
        traffic
            .expect_revert()
            .times(3)
            .returning(|_| Err(BackendError::routing("mesh unreachable").transient()));
        let mut deploy = MockDeployBackend::new();
        deploy.expect_remove_target().never();
        let (sink, mut rx) = ChannelSink::new();

        let coordinator =
            RollbackCoordinator::new(Arc::new(traffic), Arc::new(deploy), Arc::new(sink), fast_retry());
        let err = coordinator
            .execute(&failed_state(), RollbackTrigger::Failure)
            .await
            .unwrap_err();

        assert_eq!(err.attempts, 3);
        assert_eq!(err.environment, "prod");
        let event = rx.try_recv().unwrap();
        assert!(event.requires_human());
    }

    #[tokio::test(start_paused = true)]
    async fn cleanup_and_alert_failures_do_not_fail_rollback() {
        let mut traffic = MockTrafficController::new();
        traffic.expect_revert().times(1).returning(|_| Ok(()));
        let mut deploy = MockDeployBackend::new();
        deploy
            .expect_remove_target()
            .returning(|_, _| Err(BackendError::deploy("slot busy")));
        let mut sink = MockNotificationSink::new();
        sink.expect_publish()
            .returning(|_| Err(BackendError::notification("webhook down")));

        let coordinator =
            RollbackCoordinator::new(Arc::new(traffic), Arc::new(deploy), Arc::new(sink), fast_retry());
        let outcome = coordinator
            .execute(&failed_state(), RollbackTrigger::Failure)
            .await
            .unwrap();

        assert!(outcome.reverted);
        assert_eq!(outcome.target_removed, Some(false));
        assert!(!outcome.alert_sent);
        assert!(!outcome.is_clean());
    }

    #[tokio::test(start_paused = true)]
    async fn abort_skips_alert_and_respects_cleanup_policy() {
        let mut traffic = MockTrafficController::new();
        traffic.expect_revert().times(1).returning(|_| Ok(()));
        let mut deploy = MockDeployBackend::new();
        deploy.expect_remove_target().never();
        let mut sink = MockNotificationSink::new();
        sink.expect_publish().never();

        let mut state = failed_state();
        state.failure = None;
        state.request.rollback_policy.cleanup_target = false;

        let coordinator =
            RollbackCoordinator::new(Arc::new(traffic), Arc::new(deploy), Arc::new(sink), fast_retry());
        let outcome = coordinator
            .execute(&state, RollbackTrigger::OperatorAbort)
            .await
            .unwrap();

        assert_eq!(outcome.target_removed, None);
        assert!(!outcome.alert_sent);
    }
}
