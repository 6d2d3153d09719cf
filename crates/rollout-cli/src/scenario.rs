//! Scenario files for `rolloutctl simulate`
//!
//! A scenario describes one rollout request plus how the scripted
//! collaborators behave while it runs:
//!
//! ```toml
//! abort_after_ms = 2500
//!
//! [request]
//! environment = "prod"
//! artifact = "api:v2"
//! steps = [10, 100]
//! dwell_ms = 1000
//!
//! [baseline]
//! latency_ms = 10.0
//!
//! [[samples]]
//! kind = "reading"
//! latency_ms = 10.2
//! throughput = 1000.0
//! error_rate = 0.001
//! data_points = 10
//!
//! [[at_split]]
//! percent = 10
//! sample = { kind = "reading", latency_ms = 80.0, throughput = 1000.0, error_rate = 0.001, data_points = 10 }
//! ```

use rollout_core::simulation::{
    RecordingSink, ScriptedSample, ScriptedTelemetry, SimulatedDeployBackend, StaticValidator,
};
use rollout_core::{
    BaselineStore, Collaborators, DeploymentRequest, FanoutSink, HistoryLog,
    InMemoryTrafficController, MetricSnapshot, TracingSink, ValidationError,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

/// Baseline recorded before the rollout starts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub(crate) struct BaselineSpec {
    pub(crate) latency_ms: f64,
    pub(crate) throughput: f64,
    pub(crate) error_rate: f64,
}

impl Default for BaselineSpec {
    fn default() -> Self {
        Self {
            latency_ms: 10.0,
            throughput: 1000.0,
            error_rate: 0.001,
        }
    }
}

/// Telemetry answer while a given split is live
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct SplitSample {
    pub(crate) percent: u8,
    pub(crate) sample: ScriptedSample,
}

/// One scripted rollout
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct Scenario {
    pub(crate) request: DeploymentRequest,
    /// `None` starts without a baseline
    #[serde(default)]
    pub(crate) baseline: Option<BaselineSpec>,
    #[serde(default)]
    pub(crate) samples: Vec<ScriptedSample>,
    #[serde(default)]
    pub(crate) at_split: Vec<SplitSample>,
    /// Make the pre-deployment checks fail with this reason
    #[serde(default)]
    pub(crate) precheck_failure: Option<String>,
    /// Deploy calls that fail before one succeeds
    #[serde(default)]
    pub(crate) deploy_failures: u32,
    /// Traffic reverts that fail before one succeeds
    #[serde(default)]
    pub(crate) revert_failures: u32,
    /// Operator abort this long after start
    #[serde(default)]
    pub(crate) abort_after_ms: Option<u64>,
}

/// Collaborators wired for one scenario, plus the handles the report reads
pub(crate) struct Wiring {
    pub(crate) deps: Collaborators,
    pub(crate) sink: Arc<RecordingSink>,
    pub(crate) traffic: Arc<InMemoryTrafficController>,
}

impl Scenario {
    /// Parse and validate TOML
    pub(crate) fn from_toml_str(source: &str) -> anyhow::Result<Self> {
        let scenario: Self = toml::from_str(source)?;
        scenario.validate()?;
        Ok(scenario)
    }

    pub(crate) fn load(path: &Path) -> anyhow::Result<Self> {
        let source = std::fs::read_to_string(path)?;
        Self::from_toml_str(&source)
    }

    fn validate(&self) -> Result<(), ValidationError> {
        self.request.validate()?;
        if let Some((index, bad)) = self
            .at_split
            .iter()
            .enumerate()
            .find(|(_, s)| s.percent > 100)
        {
            return Err(ValidationError::PercentageOutOfRange {
                index,
                value: bad.percent,
            });
        }
        Ok(())
    }

    /// Build scripted collaborators
    ///
    /// History and baselines go to `state_dir` when given, otherwise they
    /// live in memory for the run.
    pub(crate) fn wire(&self, state_dir: Option<&Path>) -> anyhow::Result<Wiring> {
        let traffic = Arc::new(InMemoryTrafficController::new());
        traffic.fail_next_reverts(self.revert_failures);

        let samples = if self.samples.is_empty() {
            let base = self.baseline.clone().unwrap_or_default();
            vec![ScriptedSample::reading(
                base.latency_ms,
                base.throughput,
                base.error_rate,
            )]
        } else {
            self.samples.clone()
        };
        let mut telemetry = ScriptedTelemetry::new(samples);
        if !self.at_split.is_empty() {
            let by_split: BTreeMap<u8, ScriptedSample> = self
                .at_split
                .iter()
                .map(|s| (s.percent, s.sample.clone()))
                .collect();
            telemetry = telemetry.with_routing(Arc::clone(&traffic), by_split);
        }

        let deploy = SimulatedDeployBackend::new();
        if self.deploy_failures > 0 {
            deploy.fail_next_deploys(self.deploy_failures, true);
        }
        let validator = match &self.precheck_failure {
            Some(reason) => StaticValidator::fail(reason.clone()),
            None => StaticValidator::pass(),
        };

        let (baselines, history) = match state_dir {
            Some(dir) => (
                BaselineStore::open(dir.join("baselines.json"))?,
                HistoryLog::open(dir.join("history.jsonl"))?,
            ),
            None => (BaselineStore::new(), HistoryLog::in_memory()),
        };
        if let Some(base) = &self.baseline {
            if baselines.get(&self.request.environment).is_err() {
                baselines.bootstrap(
                    MetricSnapshot::new(
                        self.request.environment.clone(),
                        base.latency_ms,
                        base.throughput,
                        base.error_rate,
                    )
                    .with_data_points(10),
                )?;
            }
        }

        let recorder = Arc::new(RecordingSink::new());
        let sink = FanoutSink::new()
            .with(Arc::new(TracingSink))
            .with(recorder.clone());

        let deps = Collaborators {
            telemetry: Arc::new(telemetry),
            traffic: traffic.clone(),
            deploy: Arc::new(deploy),
            validator: Arc::new(validator),
            sink: Arc::new(sink),
            baselines: Arc::new(baselines),
            history: Arc::new(history),
        };
        Ok(Wiring {
            deps,
            sink: recorder,
            traffic,
        })
    }
}
