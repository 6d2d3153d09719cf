//! Rollout event stream
//!
//! Every phase change, step advance and escalation is published as a
//! [`RolloutEvent`] to a [`NotificationSink`]. Sinks are the audit trail:
//! - [`ChannelSink`] forwards into a tokio channel (CLI, tests, webhooks)
//! - [`TracingSink`] mirrors events into the log stream
//! - [`FanoutSink`] delivers to several sinks at once

use crate::error::BackendError;
use crate::health::HealthVerdict;
use crate::types::{ArtifactRef, Environment, Phase, RolloutId, UrgencyClass};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;

#[cfg(test)]
use mockall::automock;

/// One structured event about one rollout
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RolloutEvent {
    pub rollout_id: RolloutId,
    pub environment: Environment,
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: RolloutEventKind,
}

impl RolloutEvent {
    /// Create event stamped now
    #[must_use]
    pub fn new(rollout_id: RolloutId, environment: Environment, kind: RolloutEventKind) -> Self {
        Self {
            rollout_id,
            environment,
            at: Utc::now(),
            kind,
        }
    }

    /// Whether a human must act on this event
    #[inline]
    #[must_use]
    pub fn requires_human(&self) -> bool {
        matches!(self.kind, RolloutEventKind::RollbackFailed { .. })
    }
}

/// Event payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RolloutEventKind {
    /// Request accepted
    Started {
        artifact: ArtifactRef,
        urgency: UrgencyClass,
        steps: Vec<u8>,
    },
    /// Phase transition
    PhaseChanged { from: Phase, to: Phase },
    /// Traffic split applied for a schedule step
    StepAdvanced { step: usize, traffic_percent: u8 },
    /// WARNING verdict observed
    HealthDegraded {
        verdict: HealthVerdict,
        consecutive: u32,
    },
    /// Compensating actions starting
    RollingBack {
        reason: String,
        verdict: Option<HealthVerdict>,
    },
    /// Traffic restored to the previous version
    RolledBack { reason: String, cleanup_ok: bool },
    /// Traffic could not be restored
    RollbackFailed {
        reason: String,
        attempts: u32,
        error: String,
    },
    /// Cancelled by an operator
    Aborted { traffic_reverted: bool },
    /// All traffic on the new version, baseline promoted
    Completed {
        degraded_start: bool,
        baseline_committed: bool,
    },
}

impl RolloutEventKind {
    /// Short name for logs
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Started { .. } => "started",
            Self::PhaseChanged { .. } => "phase_changed",
            Self::StepAdvanced { .. } => "step_advanced",
            Self::HealthDegraded { .. } => "health_degraded",
            Self::RollingBack { .. } => "rolling_back",
            Self::RolledBack { .. } => "rolled_back",
            Self::RollbackFailed { .. } => "rollback_failed",
            Self::Aborted { .. } => "aborted",
            Self::Completed { .. } => "completed",
        }
    }
}

/// Destination for rollout events (chat, pager, webhook)
#[cfg_attr(test, automock)]
#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// Deliver one event
    async fn publish(&self, event: RolloutEvent) -> Result<(), BackendError>;
}

/// Forwards events into an unbounded tokio channel
#[derive(Debug, Clone)]
pub struct ChannelSink {
    sender: mpsc::UnboundedSender<RolloutEvent>,
}

impl ChannelSink {
    /// Create sink and its receiving end
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<RolloutEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl NotificationSink for ChannelSink {
    async fn publish(&self, event: RolloutEvent) -> Result<(), BackendError> {
        self.sender
            .send(event)
            .map_err(|_| BackendError::notification("event receiver dropped"))
    }
}

/// Writes events to the `tracing` log stream
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

#[async_trait]
impl NotificationSink for TracingSink {
    async fn publish(&self, event: RolloutEvent) -> Result<(), BackendError> {
        let rollout_id = event.rollout_id.to_string();
        let environment = event.environment.as_str();
        let kind = event.kind.name();

        match &event.kind {
            RolloutEventKind::RollbackFailed {
                reason,
                attempts,
                error,
            } => tracing::error!(
                rollout_id = %rollout_id,
                environment = %environment,
                kind = kind,
                attempts = attempts,
                reason = %reason,
                error = %error,
                "Rollback failed, human intervention required"
            ),
            RolloutEventKind::RollingBack { reason, .. }
            | RolloutEventKind::RolledBack { reason, .. } => tracing::warn!(
                rollout_id = %rollout_id,
                environment = %environment,
                kind = kind,
                reason = %reason,
                "Rollout event"
            ),
            RolloutEventKind::HealthDegraded {
                verdict,
                consecutive,
            } => tracing::warn!(
                rollout_id = %rollout_id,
                environment = %environment,
                kind = kind,
                consecutive = consecutive,
                verdict = %verdict.summary(),
                "Rollout event"
            ),
            RolloutEventKind::PhaseChanged { from, to } => tracing::debug!(
                rollout_id = %rollout_id,
                environment = %environment,
                kind = kind,
                from = %from,
                to = %to,
                "Rollout event"
            ),
            _ => tracing::info!(
                rollout_id = %rollout_id,
                environment = %environment,
                kind = kind,
                "Rollout event"
            ),
        }
        Ok(())
    }
}

/// Delivers each event to every inner sink concurrently
///
/// Fails if any sink fails, after all deliveries have been attempted.
#[derive(Clone, Default)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn NotificationSink>>,
}

impl std::fmt::Debug for FanoutSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FanoutSink")
            .field("sinks", &self.sinks.len())
            .finish()
    }
}

impl FanoutSink {
    /// Create empty fanout
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// With another sink
    #[inline]
    #[must_use]
    pub fn with(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

#[async_trait]
impl NotificationSink for FanoutSink {
    async fn publish(&self, event: RolloutEvent) -> Result<(), BackendError> {
        let deliveries = self.sinks.iter().map(|sink| sink.publish(event.clone()));
        futures::future::join_all(deliveries)
            .await
            .into_iter()
            .collect::<Result<Vec<()>, BackendError>>()
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(kind: RolloutEventKind) -> RolloutEvent {
        RolloutEvent::new(RolloutId::new(), Environment::new("prod"), kind)
    }

    #[tokio::test]
    async fn channel_sink_forwards() {
        let (sink, mut rx) = ChannelSink::new();
        sink.publish(event(RolloutEventKind::StepAdvanced {
            step: 1,
            traffic_percent: 25,
        }))
        .await
        .unwrap();

        let received = rx.recv().await.unwrap();
        assert_eq!(
            received.kind,
            RolloutEventKind::StepAdvanced {
                step: 1,
                traffic_percent: 25
            }
        );
    }

    #[tokio::test]
    async fn channel_sink_reports_dropped_receiver() {
        let (sink, rx) = ChannelSink::new();
        drop(rx);
        let err = sink
            .publish(event(RolloutEventKind::Aborted {
                traffic_reverted: false,
            }))
            .await
            .unwrap_err();
        assert!(err.transient);
    }

    #[tokio::test]
    async fn fanout_delivers_to_all_even_when_one_fails() {
        let (first, mut first_rx) = ChannelSink::new();
        let mut failing = MockNotificationSink::new();
        failing
            .expect_publish()
            .times(1)
            .returning(|_| Err(BackendError::notification("webhook 502")));

        let fanout = FanoutSink::new()
            .with(Arc::new(first))
            .with(Arc::new(failing))
            .with(Arc::new(TracingSink));

        let result = fanout
            .publish(event(RolloutEventKind::Completed {
                degraded_start: false,
                baseline_committed: true,
            }))
            .await;

        assert!(result.is_err());
        assert!(first_rx.try_recv().is_ok());
    }

    #[test]
    fn event_serializes_flat_with_kind_tag() {
        let ev = event(RolloutEventKind::PhaseChanged {
            from: Phase::Migrating { step: 0 },
            to: Phase::RollingBack,
        });
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["kind"], "phase_changed");
        assert_eq!(json["environment"], "prod");
        assert_eq!(json["from"]["phase"], "migrating");
        assert_eq!(json["from"]["step"], 0);
    }

    #[test]
    fn only_rollback_failure_requires_human() {
        assert!(event(RolloutEventKind::RollbackFailed {
            reason: "x".to_string(),
            attempts: 3,
            error: "mesh down".to_string(),
        })
        .requires_human());
        assert!(!event(RolloutEventKind::Aborted {
            traffic_reverted: true
        })
        .requires_human());
    }
}
