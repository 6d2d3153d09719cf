//! Deployment orchestrator
//!
//! The per-rollout state machine:
//!
//! ```text
//! PENDING -> PRECHECK -> DEPLOYING_TARGET -> SHADOW_VALIDATING
//!         -> MIGRATING(0..n) -> FINALIZING -> COMPLETED
//!
//! any non-terminal -> ROLLING_BACK -> ROLLED_BACK | ROLLBACK_FAILED
//! any non-terminal -> ABORTED
//! ```
//!
//! One orchestrator task owns one [`RolloutState`]; the controller reads
//! snapshots of it through a shared lock. The only suspension points are the
//! observation ticks of shadow validation and step dwell, and both give way
//! to operator abort and to the overall rollout deadline.

use crate::baseline::{BaselineStore, FinalizeGrant};
use crate::config::ReconcilerConfig;
use crate::deploy::{DeployBackend, PreDeploymentValidator};
use crate::error::BaselineError;
use crate::events::{NotificationSink, RolloutEvent, RolloutEventKind};
use crate::health::{HealthEvaluator, HealthVerdict, Thresholds, Verdict};
use crate::history::HistoryLog;
use crate::probe::{MetricsProbe, TelemetryBackend};
use crate::retry::retry_with_backoff;
use crate::rollback::{RollbackCoordinator, RollbackTrigger};
use crate::traffic::TrafficController;
use crate::types::{Baseline, FailureReport, MetricSnapshot, Phase, RolloutState};
use chrono::Utc;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// External collaborators and shared stores a rollout works against
#[derive(Clone)]
pub struct Collaborators {
    pub telemetry: Arc<dyn TelemetryBackend>,
    pub traffic: Arc<dyn TrafficController>,
    pub deploy: Arc<dyn DeployBackend>,
    pub validator: Arc<dyn PreDeploymentValidator>,
    pub sink: Arc<dyn NotificationSink>,
    pub baselines: Arc<BaselineStore>,
    pub history: Arc<HistoryLog>,
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators")
            .field("baselines", &self.baselines)
            .field("history", &self.history.path())
            .finish_non_exhaustive()
    }
}

/// Why the happy path stopped
#[derive(Debug)]
enum Halt {
    /// Pre-deployment validation failed; nothing was deployed
    Precheck(String),
    /// Health, backend or deadline failure
    Failure(FailureReport),
    /// Operator cancellation
    Aborted,
}

impl Halt {
    fn failure(reason: impl Into<String>, verdict: Option<HealthVerdict>) -> Self {
        Self::Failure(FailureReport {
            reason: reason.into(),
            verdict,
        })
    }
}

/// How an observation window treats WARNING verdicts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    /// Aggregate only; a WARNING flags a degraded start
    Shadow,
    /// Count consecutive warnings against the tolerance
    Dwell,
}

/// Drives one rollout to a terminal phase
pub struct DeploymentOrchestrator {
    config: ReconcilerConfig,
    deps: Collaborators,
    probe: MetricsProbe,
    rollback: RollbackCoordinator,
    state: Arc<RwLock<RolloutState>>,
    cancel: watch::Receiver<bool>,
    thresholds: Thresholds,
    warning_tolerance: u32,
    dwell: Duration,
    shadow_window: Duration,
    deadline: Instant,
    last_snapshot: Option<MetricSnapshot>,
}

impl std::fmt::Debug for DeploymentOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeploymentOrchestrator")
            .field("state", &*self.state.read())
            .field("dwell", &self.dwell)
            .field("shadow_window", &self.shadow_window)
            .finish_non_exhaustive()
    }
}

impl DeploymentOrchestrator {
    /// Prepare a rollout for the request held in `state`
    ///
    /// The rollout deadline starts now. Setting `cancel` to `true` aborts the
    /// rollout at its next phase boundary or observation tick.
    #[must_use]
    pub fn new(
        config: ReconcilerConfig,
        deps: Collaborators,
        state: Arc<RwLock<RolloutState>>,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        let (thresholds, warning_tolerance, dwell, shadow_window) = {
            let guard = state.read();
            let request = &guard.request;
            let floor = config.probe_interval();
            let dwell = request.dwell().unwrap_or_else(|| config.default_dwell());
            (
                request
                    .thresholds
                    .clone()
                    .unwrap_or_else(|| config.thresholds.clone()),
                request
                    .rollback_policy
                    .warning_tolerance
                    .unwrap_or(config.warning_tolerance),
                request.urgency.scale(dwell, floor),
                request.urgency.scale(config.shadow_window(), floor),
            )
        };

        Self {
            probe: MetricsProbe::from_config(Arc::clone(&deps.telemetry), &config),
            rollback: RollbackCoordinator::new(
                Arc::clone(&deps.traffic),
                Arc::clone(&deps.deploy),
                Arc::clone(&deps.sink),
                config.rollback_retry,
            ),
            deadline: Instant::now() + config.rollout_timeout(),
            config,
            deps,
            state,
            cancel,
            thresholds,
            warning_tolerance,
            dwell,
            shadow_window,
            last_snapshot: None,
        }
    }

    /// Run to a terminal phase and return the final state
    pub async fn run(mut self) -> RolloutState {
        let started = self.snapshot();
        if let Err(e) = self.deps.history.record_started(&started) {
            tracing::warn!(rollout_id = %started.id, error = %e, "Failed to record rollout start");
        }
        self.emit(RolloutEventKind::Started {
            artifact: started.request.artifact.clone(),
            urgency: started.request.urgency,
            steps: started.request.steps.clone(),
        })
        .await;

        tracing::info!(
            rollout_id = %started.id,
            environment = %started.environment(),
            artifact = %started.request.artifact,
            steps = ?started.request.steps,
            dwell_ms = self.dwell.as_millis(),
            "Rollout started"
        );

        match self.drive().await {
            Ok(()) => {}
            Err(Halt::Precheck(reason)) => self.fail_precheck(reason).await,
            Err(Halt::Failure(report)) => self.roll_back(report).await,
            Err(Halt::Aborted) => self.abort().await,
        }

        let finished = self.snapshot();
        if let Err(e) = self.deps.history.record_finished(&finished) {
            tracing::warn!(rollout_id = %finished.id, error = %e, "Failed to record rollout outcome");
        }
        tracing::info!(
            rollout_id = %finished.id,
            environment = %finished.environment(),
            phase = %finished.phase,
            traffic = finished.traffic_percent,
            "Rollout finished"
        );
        finished
    }

    async fn drive(&mut self) -> Result<(), Halt> {
        self.checkpoint()?;
        self.transition(Phase::Precheck).await;
        let baseline = self.precheck().await?;

        self.checkpoint()?;
        self.transition(Phase::DeployingTarget).await;
        self.deploy_target().await?;

        self.checkpoint()?;
        self.transition(Phase::ShadowValidating).await;
        self.shadow_validate(&baseline).await?;

        let steps = self.state.read().request.steps.clone();
        for (step, percent) in steps.into_iter().enumerate() {
            self.checkpoint()?;
            self.transition(Phase::Migrating { step }).await;
            self.shift_traffic(step, percent).await?;
            self.observe(&baseline, self.dwell, Stage::Dwell).await?;
        }

        self.checkpoint()?;
        self.transition(Phase::Finalizing).await;
        self.finalize().await;
        Ok(())
    }

    /// Run caller validations and resolve the comparison baseline
    async fn precheck(&mut self) -> Result<Baseline, Halt> {
        let request = self.state.read().request.clone();

        let report = self.deps.validator.validate(&request).await;
        if !report.passed {
            return Err(Halt::Precheck(format!(
                "pre-deployment validation failed: {}",
                report.summary()
            )));
        }

        match self.deps.baselines.get(&request.environment) {
            Ok(baseline) => Ok(baseline),
            Err(BaselineError::NotFound(_)) => {
                let snapshot = self.probe.sample(&request.environment).await.map_err(|e| {
                    Halt::Precheck(format!("no baseline on record and sampling failed: {e}"))
                })?;
                tracing::info!(
                    environment = %request.environment,
                    latency_ms = snapshot.latency_ms,
                    "No baseline on record, using provisional sample"
                );
                Ok(Baseline::provisional(snapshot))
            }
            Err(e) => Err(Halt::Precheck(e.to_string())),
        }
    }

    async fn deploy_target(&mut self) -> Result<(), Halt> {
        let (environment, artifact) = {
            let mut state = self.state.write();
            // Set before the call so a partial deploy is still cleaned up
            state.target_deployed = true;
            (state.environment().clone(), state.request.artifact.clone())
        };

        let deploy = &self.deps.deploy;
        let attempt = retry_with_backoff(&self.config.backend_retry, "deploy.deploy_target", || {
            deploy.deploy_target(&environment, &artifact)
        });

        match tokio::time::timeout(self.config.deploy_timeout(), attempt).await {
            Ok((Ok(()), attempts)) => {
                tracing::info!(
                    environment = %environment,
                    artifact = %artifact,
                    attempts = attempts,
                    "Target slot ready"
                );
                Ok(())
            }
            Ok((Err(e), attempts)) => Err(Halt::failure(
                format!("deploy of {artifact} failed after {attempts} attempts: {e}"),
                None,
            )),
            Err(_) => Err(Halt::failure(
                format!(
                    "target slot not ready within {}s",
                    self.config.deploy_timeout().as_secs()
                ),
                None,
            )),
        }
    }

    async fn shadow_validate(&mut self, baseline: &Baseline) -> Result<(), Halt> {
        let aggregate = self
            .observe(baseline, self.shadow_window, Stage::Shadow)
            .await?;

        if aggregate.verdict == Verdict::Warning {
            self.state.write().degraded_start = true;
            tracing::warn!(
                rollout_id = %self.state.read().id,
                verdict = %aggregate.summary(),
                "Shadow validation degraded, proceeding"
            );
            self.emit(RolloutEventKind::HealthDegraded {
                verdict: aggregate,
                consecutive: 0,
            })
            .await;
        }
        Ok(())
    }

    async fn shift_traffic(&mut self, step: usize, percent: u8) -> Result<(), Halt> {
        let environment = self.state.read().environment().clone();
        let traffic = &self.deps.traffic;
        let (result, attempts) =
            retry_with_backoff(&self.config.backend_retry, "traffic.set_split", || {
                traffic.set_split(&environment, percent)
            })
            .await;

        if let Err(e) = result {
            return Err(Halt::failure(
                format!("routing to {percent}% at step {step} failed after {attempts} attempts: {e}"),
                None,
            ));
        }

        {
            let mut state = self.state.write();
            state.traffic_percent = percent;
            state.step_index = Some(step);
            state.updated_at = Utc::now();
        }
        tracing::info!(environment = %environment, step = step, traffic = percent, "Traffic shifted");
        self.emit(RolloutEventKind::StepAdvanced {
            step,
            traffic_percent: percent,
        })
        .await;
        Ok(())
    }

    /// Sample health every probe interval for `window`
    ///
    /// A window that is not a multiple of the interval gets one extra
    /// tick, so it is never observed for less than requested. Returns the worst verdict seen. Fails fast on CRITICAL; in dwell,
    /// also fails once consecutive warnings exceed the tolerance.
    async fn observe(
        &mut self,
        baseline: &Baseline,
        window: Duration,
        stage: Stage,
    ) -> Result<HealthVerdict, Halt> {
        let interval = self.config.probe_interval();
        let ticks = observation_ticks(window, interval);
        let mut aggregate = HealthVerdict::ok(Utc::now());

        for _ in 0..ticks {
            self.pause(interval).await?;
            let verdict = self.check_health(baseline).await;
            aggregate = aggregate.merge(verdict.clone());

            match (verdict.verdict, stage) {
                (Verdict::Critical, _) => {
                    return Err(Halt::failure(
                        format!("critical health verdict: {}", verdict.summary()),
                        Some(verdict),
                    ));
                }
                (Verdict::Warning, Stage::Dwell) => {
                    let consecutive = {
                        let mut state = self.state.write();
                        state.violation_count += 1;
                        state.violation_count
                    };
                    self.emit(RolloutEventKind::HealthDegraded {
                        verdict: verdict.clone(),
                        consecutive,
                    })
                    .await;
                    if consecutive > self.warning_tolerance {
                        return Err(Halt::failure(
                            format!(
                                "{consecutive} consecutive warnings exceed tolerance of {}",
                                self.warning_tolerance
                            ),
                            Some(verdict),
                        ));
                    }
                }
                (Verdict::Ok, Stage::Dwell) => self.state.write().violation_count = 0,
                _ => {}
            }
        }
        Ok(aggregate)
    }

    /// One probe + evaluate tick; telemetry gaps fail closed
    async fn check_health(&mut self, baseline: &Baseline) -> HealthVerdict {
        let environment = self.state.read().environment().clone();
        let verdict = match self.probe.sample(&environment).await {
            Ok(snapshot) => {
                let verdict = HealthEvaluator::evaluate(&snapshot, baseline, &self.thresholds);
                self.last_snapshot = Some(snapshot);
                verdict
            }
            Err(e) => {
                tracing::warn!(environment = %environment, error = %e, "Probe failed, treating as critical");
                HealthVerdict::probe_failure(&e)
            }
        };

        tracing::debug!(
            environment = %environment,
            verdict = %verdict.verdict,
            "Health check"
        );
        let mut state = self.state.write();
        state.last_verdict = Some(verdict.clone());
        state.updated_at = Utc::now();
        verdict
    }

    async fn finalize(&mut self) {
        let (id, environment, artifact, degraded_start) = {
            let state = self.state.read();
            (
                state.id,
                state.environment().clone(),
                state.request.artifact.clone(),
                state.degraded_start,
            )
        };

        if let Err(e) = self.deps.deploy.retire_previous(&environment, &artifact).await {
            tracing::warn!(environment = %environment, error = %e, "Retiring previous version failed");
        }

        let grant = FinalizeGrant::issue(id, environment.clone());
        let baseline_committed = match self.last_snapshot.take() {
            Some(snapshot) => match self.deps.baselines.commit(grant, snapshot) {
                Ok(_) => true,
                Err(BaselineError::Persistence(e)) => {
                    tracing::error!(environment = %environment, error = %e, "Baseline committed but not persisted");
                    true
                }
                Err(e) => {
                    tracing::error!(environment = %environment, error = %e, "Baseline commit refused");
                    false
                }
            },
            None => {
                tracing::warn!(environment = %environment, "No snapshot to promote");
                false
            }
        };

        self.transition(Phase::Completed).await;
        self.emit(RolloutEventKind::Completed {
            degraded_start,
            baseline_committed,
        })
        .await;
    }

    async fn fail_precheck(&mut self, reason: String) {
        tracing::warn!(rollout_id = %self.state.read().id, reason = %reason, "Precheck failed");
        self.state.write().failure = Some(FailureReport {
            reason: reason.clone(),
            verdict: None,
        });
        self.transition(Phase::RolledBack).await;
        self.emit(RolloutEventKind::RolledBack {
            reason,
            cleanup_ok: true,
        })
        .await;
    }

    async fn roll_back(&mut self, report: FailureReport) {
        let (id, phase) = {
            let state = self.state.read();
            (state.id, state.phase)
        };
        tracing::warn!(rollout_id = %id, phase = %phase, reason = %report.reason, "Rolling back");
        self.state.write().failure = Some(report.clone());
        self.transition(Phase::RollingBack).await;
        self.emit(RolloutEventKind::RollingBack {
            reason: report.reason,
            verdict: report.verdict,
        })
        .await;

        let snapshot = self.snapshot();
        match self.rollback.execute(&snapshot, RollbackTrigger::Failure).await {
            Ok(_) => {
                self.state.write().traffic_percent = 0;
                self.transition(Phase::RolledBack).await;
            }
            Err(failed) => {
                tracing::error!(
                    rollout_id = %snapshot.id,
                    environment = %snapshot.environment(),
                    error = %failed,
                    "Rollback failed, human intervention required"
                );
                self.transition(Phase::RollbackFailed).await;
            }
        }
    }

    async fn abort(&mut self) {
        let snapshot = self.snapshot();
        tracing::warn!(
            rollout_id = %snapshot.id,
            phase = %snapshot.phase,
            traffic = snapshot.traffic_percent,
            "Rollout aborted by operator"
        );

        if snapshot.traffic_percent == 0 {
            if snapshot.target_deployed && snapshot.request.rollback_policy.cleanup_target {
                self.rollback.release_target(&snapshot).await;
            }
            self.transition(Phase::Aborted).await;
            self.emit(RolloutEventKind::Aborted {
                traffic_reverted: false,
            })
            .await;
            return;
        }

        match self
            .rollback
            .execute(&snapshot, RollbackTrigger::OperatorAbort)
            .await
        {
            Ok(_) => {
                self.state.write().traffic_percent = 0;
                self.transition(Phase::Aborted).await;
                self.emit(RolloutEventKind::Aborted {
                    traffic_reverted: true,
                })
                .await;
            }
            Err(failed) => {
                tracing::error!(
                    rollout_id = %snapshot.id,
                    error = %failed,
                    "Abort could not revert traffic, human intervention required"
                );
                self.state.write().failure = Some(FailureReport {
                    reason: failed.to_string(),
                    verdict: None,
                });
                self.transition(Phase::RollbackFailed).await;
            }
        }
    }

    /// Sleep for `duration`, giving way to abort and the rollout deadline
    async fn pause(&mut self, duration: Duration) -> Result<(), Halt> {
        let until = (Instant::now() + duration).min(self.deadline);
        tokio::select! {
            biased;
            () = cancelled(&mut self.cancel) => return Err(Halt::Aborted),
            () = tokio::time::sleep_until(until) => {}
        }
        self.checkpoint()
    }

    fn checkpoint(&self) -> Result<(), Halt> {
        if *self.cancel.borrow() {
            return Err(Halt::Aborted);
        }
        if Instant::now() >= self.deadline {
            return Err(Halt::failure(
                format!(
                    "rollout exceeded timeout of {}s",
                    self.config.rollout_timeout().as_secs()
                ),
                None,
            ));
        }
        Ok(())
    }

    /// Move to `next` if legal; illegal moves are logged and ignored
    async fn transition(&mut self, next: Phase) {
        let from = {
            let mut state = self.state.write();
            let from = state.phase;
            if !from.can_transition_to(next) {
                tracing::error!(rollout_id = %state.id, from = %from, to = %next, "Illegal phase transition");
                return;
            }
            let now = Utc::now();
            state.phase = next;
            state.updated_at = now;
            if next.is_terminal() {
                state.finished_at = Some(now);
            }
            from
        };

        tracing::info!(
            rollout_id = %self.state.read().id,
            from = %from,
            to = %next,
            "Phase transition"
        );
        self.emit(RolloutEventKind::PhaseChanged { from, to: next }).await;
    }

    async fn emit(&self, kind: RolloutEventKind) {
        let (id, environment) = {
            let state = self.state.read();
            (state.id, state.environment().clone())
        };
        let name = kind.name();
        if let Err(e) = self
            .deps
            .sink
            .publish(RolloutEvent::new(id, environment, kind))
            .await
        {
            tracing::warn!(rollout_id = %id, event = name, error = %e, "Event delivery failed");
        }
    }

    fn snapshot(&self) -> RolloutState {
        self.state.read().clone()
    }
}

/// Resolves once cancellation is requested; never if the sender is gone
async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    if cancel.wait_for(|requested| *requested).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Probe ticks needed to cover `window`, at least one
fn observation_ticks(window: Duration, interval: Duration) -> u128 {
    window
        .as_millis()
        .div_ceil(interval.as_millis().max(1))
        .max(1)
}
