//! Testing utilities for the rollout workspace
//!
//! Fixtures for snapshots, readings and requests, plus a [`Harness`] that
//! wires scripted collaborators to a [`RolloutController`].

#![allow(missing_docs)]

use rollout_core::simulation::{
    RecordingSink, ScriptedSample, ScriptedTelemetry, SimulatedDeployBackend, StaticValidator,
};
use rollout_core::{
    BaselineStore, Collaborators, DeploymentRequest, Environment, HistoryLog,
    InMemoryTrafficController, MetricSnapshot, ReconcilerConfig, RetryConfig, RolloutController,
    RolloutEventKind, RolloutId, RolloutState,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

pub const ENV: &str = "prod";

pub fn snapshot(env: &str, latency_ms: f64) -> MetricSnapshot {
    MetricSnapshot::new(env, latency_ms, 1000.0, 0.001).with_data_points(10)
}

pub fn reading(latency_ms: f64) -> ScriptedSample {
    ScriptedSample::reading(latency_ms, 1000.0, 0.001)
}

pub fn request(steps: Vec<u8>) -> DeploymentRequest {
    DeploymentRequest::new(ENV, "api:v2").with_steps(steps)
}

/// Config with short windows and fast retries, for paused-clock tests
pub fn fast_config() -> ReconcilerConfig {
    let retry = RetryConfig::with_max_attempts(3).with_initial_delay(Duration::from_millis(10));
    let mut config = ReconcilerConfig::default()
        .with_shadow_window(Duration::from_secs(2))
        .with_default_dwell(Duration::from_secs(1));
    config.backend_retry = retry;
    config.rollback_retry = retry;
    config
}

/// Wired controller plus handles on every scripted collaborator
pub struct Harness {
    pub controller: RolloutController,
    pub traffic: Arc<InMemoryTrafficController>,
    pub deploy: Arc<SimulatedDeployBackend>,
    pub telemetry: Arc<ScriptedTelemetry>,
    pub validator: Arc<StaticValidator>,
    pub sink: Arc<RecordingSink>,
    pub baselines: Arc<BaselineStore>,
    pub history: Arc<HistoryLog>,
}

impl Harness {
    pub fn builder() -> HarnessBuilder {
        HarnessBuilder::default()
    }

    pub fn env(&self) -> Environment {
        Environment::new(ENV)
    }

    pub fn baseline_latency(&self) -> Option<f64> {
        self.baselines
            .get(&self.env())
            .ok()
            .map(|b| b.snapshot.latency_ms)
    }

    /// Start and wait for a rollout
    pub async fn run(&self, request: DeploymentRequest) -> RolloutState {
        let id = self.controller.start_rollout(request).unwrap();
        self.controller.wait(id).await.unwrap()
    }

    /// Poll until `id` satisfies `predicate` or finishes
    ///
    /// Sleeps between polls so a paused clock keeps advancing.
    pub async fn until(&self, id: RolloutId, predicate: impl Fn(&RolloutState) -> bool) {
        loop {
            let state = self.controller.status(id).unwrap();
            if predicate(&state) || state.phase.is_terminal() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Kinds of every event published for `id`
    pub fn event_kinds(&self, id: RolloutId) -> Vec<RolloutEventKind> {
        self.sink
            .events()
            .into_iter()
            .filter(|e| e.rollout_id == id)
            .map(|e| e.kind)
            .collect()
    }

    /// Traffic percentages applied, in order
    pub fn applied_splits(&self) -> Vec<u8> {
        self.traffic.changes().into_iter().map(|c| c.to).collect()
    }
}

pub struct HarnessBuilder {
    config: ReconcilerConfig,
    script: Vec<ScriptedSample>,
    by_split: BTreeMap<u8, ScriptedSample>,
    baseline: Option<MetricSnapshot>,
    validator: StaticValidator,
    deploy: SimulatedDeployBackend,
    baselines: Option<BaselineStore>,
    history: Option<HistoryLog>,
}

impl Default for HarnessBuilder {
    fn default() -> Self {
        Self {
            config: fast_config(),
            script: vec![reading(10.0)],
            by_split: BTreeMap::new(),
            baseline: Some(snapshot(ENV, 10.0)),
            validator: StaticValidator::pass(),
            deploy: SimulatedDeployBackend::new(),
            baselines: None,
            history: None,
        }
    }
}

impl HarnessBuilder {
    #[must_use]
    pub fn config(mut self, config: ReconcilerConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn script(mut self, script: Vec<ScriptedSample>) -> Self {
        self.script = script;
        self
    }

    /// Answer with `sample` while `percent`% of traffic is on the new version
    #[must_use]
    pub fn at_split(mut self, percent: u8, sample: ScriptedSample) -> Self {
        self.by_split.insert(percent, sample);
        self
    }

    /// Baseline latency recorded before the rollout; `None` for no baseline
    #[must_use]
    pub fn baseline(mut self, latency_ms: Option<f64>) -> Self {
        self.baseline = latency_ms.map(|l| snapshot(ENV, l));
        self
    }

    #[must_use]
    pub fn validator(mut self, validator: StaticValidator) -> Self {
        self.validator = validator;
        self
    }

    #[must_use]
    pub fn deploy(mut self, deploy: SimulatedDeployBackend) -> Self {
        self.deploy = deploy;
        self
    }

    #[must_use]
    pub fn baselines(mut self, store: BaselineStore) -> Self {
        self.baselines = Some(store);
        self
    }

    #[must_use]
    pub fn history(mut self, history: HistoryLog) -> Self {
        self.history = Some(history);
        self
    }

    pub fn build(self) -> Harness {
        let traffic = Arc::new(InMemoryTrafficController::new());
        let mut telemetry = ScriptedTelemetry::new(self.script);
        if !self.by_split.is_empty() {
            telemetry = telemetry.with_routing(Arc::clone(&traffic), self.by_split);
        }
        let telemetry = Arc::new(telemetry);
        let deploy = Arc::new(self.deploy);
        let validator = Arc::new(self.validator);
        let sink = Arc::new(RecordingSink::new());
        let baselines = Arc::new(self.baselines.unwrap_or_default());
        let history = Arc::new(self.history.unwrap_or_default());

        if let Some(snapshot) = self.baseline {
            baselines.bootstrap(snapshot).unwrap();
        }

        let deps = Collaborators {
            telemetry: telemetry.clone(),
            traffic: traffic.clone(),
            deploy: deploy.clone(),
            validator: validator.clone(),
            sink: sink.clone(),
            baselines: Arc::clone(&baselines),
            history: Arc::clone(&history),
        };
        let controller = RolloutController::new(self.config, deps).unwrap();

        Harness {
            controller,
            traffic,
            deploy,
            telemetry,
            validator,
            sink,
            baselines,
            history,
        }
    }
}
