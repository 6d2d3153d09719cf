//! Scripted collaborators
//!
//! Deterministic stand-ins for the external backends, used by `rolloutctl
//! simulate` and by tests. Telemetry can follow a fixed script or key its
//! readings off the current traffic split, which is how a regression that
//! only shows up at a given step is modelled.

use crate::deploy::{DeployBackend, PreDeploymentValidator, PrecheckReport};
use crate::error::{BackendError, ProbeError};
use crate::events::{NotificationSink, RolloutEvent};
use crate::probe::{TelemetryBackend, TelemetryReading};
use crate::traffic::InMemoryTrafficController;
use crate::types::{ArtifactRef, DeploymentRequest, Environment};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// One scripted telemetry answer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScriptedSample {
    /// Return this reading
    Reading(TelemetryReading),
    /// Fail as if the backend were unreachable
    Unavailable { reason: String },
    /// Never answer
    Hang,
}

impl ScriptedSample {
    /// Reading with enough data points for the default probe
    #[must_use]
    pub fn reading(latency_ms: f64, throughput: f64, error_rate: f64) -> Self {
        Self::Reading(TelemetryReading::new(latency_ms, throughput, error_rate, 10))
    }

    /// Unreachable backend
    #[must_use]
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::Unavailable {
            reason: reason.into(),
        }
    }
}

/// Telemetry that replays a script, repeating its last sample
#[derive(Debug, Default)]
pub struct ScriptedTelemetry {
    script: Vec<ScriptedSample>,
    cursor: AtomicUsize,
    calls: AtomicUsize,
    routing: Option<(Arc<InMemoryTrafficController>, BTreeMap<u8, ScriptedSample>)>,
}

impl ScriptedTelemetry {
    /// Create from a script
    #[must_use]
    pub fn new(script: Vec<ScriptedSample>) -> Self {
        Self {
            script,
            ..Self::default()
        }
    }

    /// Answer with `by_split[p]` whenever `traffic` routes exactly `p`% to
    /// the new version; other splits fall back to the script
    #[must_use]
    pub fn with_routing(
        mut self,
        traffic: Arc<InMemoryTrafficController>,
        by_split: BTreeMap<u8, ScriptedSample>,
    ) -> Self {
        self.routing = Some((traffic, by_split));
        self
    }

    /// Queries received
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn next_sample(&self, environment: &Environment) -> Option<ScriptedSample> {
        if let Some((traffic, by_split)) = &self.routing {
            if let Some(sample) = by_split.get(&traffic.current(environment)) {
                return Some(sample.clone());
            }
        }
        let index = self.cursor.fetch_add(1, Ordering::SeqCst);
        self.script
            .get(index)
            .or_else(|| self.script.last())
            .cloned()
    }
}

#[async_trait]
impl TelemetryBackend for ScriptedTelemetry {
    async fn query(&self, environment: &Environment) -> Result<TelemetryReading, ProbeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.next_sample(environment) {
            Some(ScriptedSample::Reading(reading)) => Ok(reading),
            Some(ScriptedSample::Unavailable { reason }) => {
                Err(ProbeError::unavailable(environment, reason))
            }
            Some(ScriptedSample::Hang) => std::future::pending().await,
            None => Err(ProbeError::unavailable(environment, "no scripted samples")),
        }
    }
}

/// Deploy backend that records calls
#[derive(Debug, Default)]
pub struct SimulatedDeployBackend {
    deploys: AtomicUsize,
    removals: AtomicUsize,
    retirements: AtomicUsize,
    failing_deploys: AtomicU32,
    transient_failures: AtomicBool,
    deploy_delay: Option<Duration>,
}

impl SimulatedDeployBackend {
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Take `delay` to report ready
    #[must_use]
    pub fn with_deploy_delay(mut self, delay: Duration) -> Self {
        self.deploy_delay = Some(delay);
        self
    }

    /// Fail the next `count` deploys
    pub fn fail_next_deploys(&self, count: u32, transient: bool) {
        self.transient_failures.store(transient, Ordering::SeqCst);
        self.failing_deploys.store(count, Ordering::SeqCst);
    }

    /// `deploy_target` calls
    #[must_use]
    pub fn deployed(&self) -> usize {
        self.deploys.load(Ordering::SeqCst)
    }

    /// `remove_target` calls
    #[must_use]
    pub fn removed(&self) -> usize {
        self.removals.load(Ordering::SeqCst)
    }

    /// `retire_previous` calls
    #[must_use]
    pub fn retired(&self) -> usize {
        self.retirements.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DeployBackend for SimulatedDeployBackend {
    async fn deploy_target(
        &self,
        environment: &Environment,
        artifact: &ArtifactRef,
    ) -> Result<(), BackendError> {
        self.deploys.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.deploy_delay {
            tokio::time::sleep(delay).await;
        }
        let failing = self
            .failing_deploys
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            let err = BackendError::deploy(format!("{artifact} rejected by {environment}"));
            return Err(if self.transient_failures.load(Ordering::SeqCst) {
                err.transient()
            } else {
                err
            });
        }
        Ok(())
    }

    async fn remove_target(&self, _: &Environment, _: &ArtifactRef) -> Result<(), BackendError> {
        self.removals.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn retire_previous(&self, _: &Environment, _: &ArtifactRef) -> Result<(), BackendError> {
        self.retirements.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Validator returning a fixed report
#[derive(Debug, Default)]
pub struct StaticValidator {
    report: PrecheckReport,
    calls: AtomicUsize,
}

impl StaticValidator {
    #[must_use]
    pub fn pass() -> Self {
        Self::with_report(PrecheckReport::pass())
    }

    #[must_use]
    pub fn fail(reason: impl Into<String>) -> Self {
        Self::with_report(PrecheckReport::fail([reason.into()]))
    }

    #[must_use]
    pub fn with_report(report: PrecheckReport) -> Self {
        Self {
            report,
            calls: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PreDeploymentValidator for StaticValidator {
    async fn validate(&self, _: &DeploymentRequest) -> PrecheckReport {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.report.clone()
    }
}

/// Sink that keeps every event in memory
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<RolloutEvent>>,
}

impl RecordingSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Events received so far, in order
    #[must_use]
    pub fn events(&self) -> Vec<RolloutEvent> {
        self.events.lock().clone()
    }
}

#[async_trait]
impl NotificationSink for RecordingSink {
    async fn publish(&self, event: RolloutEvent) -> Result<(), BackendError> {
        self.events.lock().push(event);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traffic::TrafficController;

    fn env() -> Environment {
        Environment::new("prod")
    }

    #[tokio::test]
    async fn script_repeats_last_sample() {
        let telemetry = ScriptedTelemetry::new(vec![
            ScriptedSample::reading(10.0, 100.0, 0.0),
            ScriptedSample::reading(20.0, 100.0, 0.0),
        ]);

        let mut latencies = Vec::new();
        for _ in 0..4 {
            latencies.push(telemetry.query(&env()).await.unwrap().latency_ms);
        }

        assert_eq!(latencies, vec![10.0, 20.0, 20.0, 20.0]);
        assert_eq!(telemetry.calls(), 4);
    }

    #[tokio::test]
    async fn empty_script_is_unavailable() {
        let telemetry = ScriptedTelemetry::new(Vec::new());
        assert!(matches!(
            telemetry.query(&env()).await,
            Err(ProbeError::Unavailable { .. })
        ));
    }

    #[tokio::test]
    async fn routing_keyed_samples_follow_split() {
        let traffic = Arc::new(InMemoryTrafficController::new());
        let telemetry = ScriptedTelemetry::new(vec![ScriptedSample::reading(10.0, 100.0, 0.0)])
            .with_routing(
                Arc::clone(&traffic),
                BTreeMap::from([(25, ScriptedSample::reading(80.0, 100.0, 0.0))]),
            );

        assert!((telemetry.query(&env()).await.unwrap().latency_ms - 10.0).abs() < f64::EPSILON);
        traffic.set_split(&env(), 25).await.unwrap();
        assert!((telemetry.query(&env()).await.unwrap().latency_ms - 80.0).abs() < f64::EPSILON);
    }

    #[test]
    fn samples_parse_from_toml() {
        #[derive(Deserialize)]
        struct Script {
            samples: Vec<ScriptedSample>,
        }

        let script: Script = toml::from_str(
            r#"
            [[samples]]
            kind = "reading"
            latency_ms = 10.0
            throughput = 1000.0
            error_rate = 0.001
            data_points = 10

            [[samples]]
            kind = "unavailable"
            reason = "prometheus down"

            [[samples]]
            kind = "hang"
            "#,
        )
        .unwrap();

        assert_eq!(script.samples.len(), 3);
        assert_eq!(script.samples[2], ScriptedSample::Hang);
    }

    #[tokio::test]
    async fn deploy_failures_are_consumed() {
        let deploy = SimulatedDeployBackend::new();
        deploy.fail_next_deploys(1, true);
        let artifact = ArtifactRef::new("api:v2");

        assert!(deploy.deploy_target(&env(), &artifact).await.unwrap_err().transient);
        assert!(deploy.deploy_target(&env(), &artifact).await.is_ok());
        assert_eq!(deploy.deployed(), 2);
    }
}
