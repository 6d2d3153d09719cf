//! Health evaluation against a baseline
//!
//! Every check runs independently; the verdict is the worst classification
//! across all checks and carries the list of checks that fired.
//!
//! | signal | CRITICAL | WARNING |
//! |---|---|---|
//! | latency | absolute increase > `hard_latency_delta` | increase > `soft_latency_fraction` of baseline |
//! | throughput | drop > `hard_throughput_drop` of baseline | drop > `soft_throughput_drop` of baseline |
//! | error rate | above `hard_error_ceiling` | above baseline + `soft_error_delta` |
//! | extensions | nonzero on a zero-tolerance signal | - |

use crate::error::ProbeError;
use crate::types::{Baseline, MetricSnapshot};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Health classification, ordered by severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    /// All checks pass
    Ok,
    /// A soft threshold was exceeded
    Warning,
    /// A hard threshold was exceeded
    Critical,
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Ok => "OK",
            Self::Warning => "WARNING",
            Self::Critical => "CRITICAL",
        };
        f.write_str(name)
    }
}

/// Individual health check
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Check {
    /// Latency versus baseline
    Latency,
    /// Throughput versus baseline
    Throughput,
    /// Error ratio
    ErrorRate,
    /// Named domain signal
    Extension(String),
    /// Telemetry could not be sampled
    Probe,
    /// Sample carried non-finite values
    Sanity,
}

/// One fired check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trigger {
    /// Check that fired
    pub check: Check,
    /// Severity it fired at
    pub severity: Verdict,
    /// Current value
    pub observed: f64,
    /// Baseline value compared against
    pub baseline: f64,
    /// `observed - baseline`
    pub delta: f64,
    /// Description for operators
    pub detail: String,
}

/// Result of one health check cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthVerdict {
    /// Worst classification across checks
    pub verdict: Verdict,
    /// Every check that fired
    pub triggers: Vec<Trigger>,
    /// Time of the sample evaluated
    pub observed_at: DateTime<Utc>,
}

impl HealthVerdict {
    /// Clean verdict
    #[inline]
    #[must_use]
    pub fn ok(observed_at: DateTime<Utc>) -> Self {
        Self {
            verdict: Verdict::Ok,
            triggers: Vec::new(),
            observed_at,
        }
    }

    /// Fail-closed verdict for a tick without usable telemetry
    #[must_use]
    pub fn probe_failure(error: &ProbeError) -> Self {
        Self {
            verdict: Verdict::Critical,
            triggers: vec![Trigger {
                check: Check::Probe,
                severity: Verdict::Critical,
                observed: 0.0,
                baseline: 0.0,
                delta: 0.0,
                detail: error.to_string(),
            }],
            observed_at: Utc::now(),
        }
    }

    /// Build verdict from fired triggers
    #[must_use]
    pub fn from_triggers(triggers: Vec<Trigger>, observed_at: DateTime<Utc>) -> Self {
        let verdict = triggers
            .iter()
            .map(|t| t.severity)
            .max()
            .unwrap_or(Verdict::Ok);
        Self {
            verdict,
            triggers,
            observed_at,
        }
    }

    /// Whether a hard threshold fired
    #[inline]
    #[must_use]
    pub fn is_critical(&self) -> bool {
        self.verdict == Verdict::Critical
    }

    /// Fold another verdict into this one, keeping the worst classification
    #[must_use]
    pub fn merge(mut self, other: HealthVerdict) -> Self {
        self.verdict = self.verdict.max(other.verdict);
        self.observed_at = self.observed_at.max(other.observed_at);
        self.triggers.extend(other.triggers);
        self
    }

    /// One-line summary of fired checks
    #[must_use]
    pub fn summary(&self) -> String {
        if self.triggers.is_empty() {
            return self.verdict.to_string();
        }
        let details: Vec<&str> = self.triggers.iter().map(|t| t.detail.as_str()).collect();
        format!("{}: {}", self.verdict, details.join("; "))
    }
}

/// Threshold policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    /// Absolute latency increase (ms) that is CRITICAL
    pub hard_latency_delta: f64,
    /// Relative latency increase that is WARNING
    pub soft_latency_fraction: f64,
    /// Relative throughput drop that is CRITICAL
    pub hard_throughput_drop: f64,
    /// Relative throughput drop that is WARNING
    pub soft_throughput_drop: f64,
    /// Absolute error ratio that is CRITICAL
    pub hard_error_ceiling: f64,
    /// Error ratio increase over baseline that is WARNING
    pub soft_error_delta: f64,
    /// Extension signals that must stay at zero
    pub zero_tolerance: BTreeSet<String>,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            hard_latency_delta: 50.0,
            soft_latency_fraction: 0.10,
            hard_throughput_drop: 0.20,
            soft_throughput_drop: 0.05,
            hard_error_ceiling: 0.05,
            soft_error_delta: 0.01,
            zero_tolerance: BTreeSet::new(),
        }
    }
}

impl Thresholds {
    /// Mark an extension signal zero-tolerance
    #[inline]
    #[must_use]
    pub fn with_zero_tolerance(mut self, signal: impl Into<String>) -> Self {
        self.zero_tolerance.insert(signal.into());
        self
    }

    /// Check internal consistency
    ///
    /// # Errors
    /// Returns a description of the first inconsistent value.
    pub fn validate(&self) -> Result<(), String> {
        let fractions = [
            ("soft_latency_fraction", self.soft_latency_fraction),
            ("hard_throughput_drop", self.hard_throughput_drop),
            ("soft_throughput_drop", self.soft_throughput_drop),
            ("hard_error_ceiling", self.hard_error_ceiling),
            ("soft_error_delta", self.soft_error_delta),
        ];
        for (name, value) in fractions {
            if !value.is_finite() || !(0.0..=1.0).contains(&value) {
                return Err(format!("{name} must be within 0..=1, got {value}"));
            }
        }
        if !self.hard_latency_delta.is_finite() || self.hard_latency_delta <= 0.0 {
            return Err(format!(
                "hard_latency_delta must be positive, got {}",
                self.hard_latency_delta
            ));
        }
        // Soft bounds must trip before hard ones
        if self.soft_throughput_drop >= self.hard_throughput_drop {
            return Err("soft_throughput_drop must be below hard_throughput_drop".to_string());
        }
        if self.soft_error_delta >= self.hard_error_ceiling {
            return Err("soft_error_delta must be below hard_error_ceiling".to_string());
        }
        Ok(())
    }
}

/// Stateless evaluator
#[derive(Debug, Clone, Copy, Default)]
pub struct HealthEvaluator;

impl HealthEvaluator {
    /// Classify `current` against `baseline`
    #[must_use]
    pub fn evaluate(
        current: &MetricSnapshot,
        baseline: &Baseline,
        thresholds: &Thresholds,
    ) -> HealthVerdict {
        let base = &baseline.snapshot;
        let mut triggers = Vec::new();

        let values = [current.latency_ms, current.throughput, current.error_rate];
        if values.iter().any(|v| !v.is_finite()) {
            triggers.push(Trigger {
                check: Check::Sanity,
                severity: Verdict::Critical,
                observed: 0.0,
                baseline: 0.0,
                delta: 0.0,
                detail: "sample contains non-finite values".to_string(),
            });
            return HealthVerdict::from_triggers(triggers, current.captured_at);
        }

        triggers.extend(check_latency(current, base, thresholds));
        triggers.extend(check_throughput(current, base, thresholds));
        triggers.extend(check_error_rate(current, base, thresholds));

        for signal in &thresholds.zero_tolerance {
            let observed = current.extensions.get(signal).copied().unwrap_or(0.0);
            if observed != 0.0 {
                let baseline_value = base.extensions.get(signal).copied().unwrap_or(0.0);
                triggers.push(Trigger {
                    check: Check::Extension(signal.clone()),
                    severity: Verdict::Critical,
                    observed,
                    baseline: baseline_value,
                    delta: observed - baseline_value,
                    detail: format!("{signal} is {observed}, zero tolerance"),
                });
            }
        }

        HealthVerdict::from_triggers(triggers, current.captured_at)
    }
}

fn check_latency(current: &MetricSnapshot, base: &MetricSnapshot, t: &Thresholds) -> Option<Trigger> {
    let delta = current.latency_ms - base.latency_ms;
    let severity = if delta > t.hard_latency_delta {
        Verdict::Critical
    } else if delta > base.latency_ms * t.soft_latency_fraction {
        Verdict::Warning
    } else {
        return None;
    };
    Some(Trigger {
        check: Check::Latency,
        severity,
        observed: current.latency_ms,
        baseline: base.latency_ms,
        delta,
        detail: format!(
            "latency {:.2}ms vs baseline {:.2}ms (+{delta:.2}ms)",
            current.latency_ms, base.latency_ms
        ),
    })
}

fn check_throughput(current: &MetricSnapshot, base: &MetricSnapshot, t: &Thresholds) -> Option<Trigger> {
    let severity = if current.throughput < base.throughput * (1.0 - t.hard_throughput_drop) {
        Verdict::Critical
    } else if current.throughput < base.throughput * (1.0 - t.soft_throughput_drop) {
        Verdict::Warning
    } else {
        return None;
    };
    let delta = current.throughput - base.throughput;
    Some(Trigger {
        check: Check::Throughput,
        severity,
        observed: current.throughput,
        baseline: base.throughput,
        delta,
        detail: format!(
            "throughput {:.1} vs baseline {:.1} ({delta:.1})",
            current.throughput, base.throughput
        ),
    })
}

fn check_error_rate(current: &MetricSnapshot, base: &MetricSnapshot, t: &Thresholds) -> Option<Trigger> {
    let severity = if current.error_rate > t.hard_error_ceiling {
        Verdict::Critical
    } else if current.error_rate > base.error_rate + t.soft_error_delta {
        Verdict::Warning
    } else {
        return None;
    };
    let delta = current.error_rate - base.error_rate;
    Some(Trigger {
        check: Check::ErrorRate,
        severity,
        observed: current.error_rate,
        baseline: base.error_rate,
        delta,
        detail: format!(
            "error rate {:.4} vs baseline {:.4}",
            current.error_rate, base.error_rate
        ),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn baseline(latency: f64, throughput: f64, error_rate: f64) -> Baseline {
        Baseline::provisional(MetricSnapshot::new("prod", latency, throughput, error_rate))
    }

    fn sample(latency: f64, throughput: f64, error_rate: f64) -> MetricSnapshot {
        MetricSnapshot::new("prod", latency, throughput, error_rate)
    }

    #[test]
    fn healthy_sample_is_ok() {
        let verdict = HealthEvaluator::evaluate(
            &sample(10.2, 1000.0, 0.001),
            &baseline(10.0, 1000.0, 0.001),
            &Thresholds::default(),
        );
        assert_eq!(verdict.verdict, Verdict::Ok);
        assert!(verdict.triggers.is_empty());
    }

    #[test]
    fn large_latency_jump_is_critical() {
        let verdict = HealthEvaluator::evaluate(
            &sample(80.0, 1000.0, 0.001),
            &baseline(10.0, 1000.0, 0.001),
            &Thresholds::default(),
        );
        assert_eq!(verdict.verdict, Verdict::Critical);
        assert_eq!(verdict.triggers[0].check, Check::Latency);
        assert!((verdict.triggers[0].delta - 70.0).abs() < f64::EPSILON);
    }

    #[test]
    fn relative_latency_increase_is_warning() {
        let verdict = HealthEvaluator::evaluate(
            &sample(12.0, 1000.0, 0.001),
            &baseline(10.0, 1000.0, 0.001),
            &Thresholds::default(),
        );
        assert_eq!(verdict.verdict, Verdict::Warning);
    }

    #[test]
    fn throughput_drops_classified() {
        let t = Thresholds::default();
        let base = baseline(10.0, 1000.0, 0.001);

        let warn = HealthEvaluator::evaluate(&sample(10.0, 900.0, 0.001), &base, &t);
        assert_eq!(warn.verdict, Verdict::Warning);
        assert_eq!(warn.triggers[0].check, Check::Throughput);

        let crit = HealthEvaluator::evaluate(&sample(10.0, 700.0, 0.001), &base, &t);
        assert_eq!(crit.verdict, Verdict::Critical);
    }

    #[test]
    fn error_rate_ceiling_and_delta() {
        let t = Thresholds::default();
        let base = baseline(10.0, 1000.0, 0.001);

        let warn = HealthEvaluator::evaluate(&sample(10.0, 1000.0, 0.02), &base, &t);
        assert_eq!(warn.verdict, Verdict::Warning);

        let crit = HealthEvaluator::evaluate(&sample(10.0, 1000.0, 0.08), &base, &t);
        assert_eq!(crit.verdict, Verdict::Critical);
    }

    #[test]
    fn zero_tolerance_extension_is_critical() {
        let t = Thresholds::default().with_zero_tolerance("compliance_violations");
        let base = baseline(10.0, 1000.0, 0.001);

        let clean = sample(10.0, 1000.0, 0.001).with_extension("compliance_violations", 0.0);
        assert_eq!(HealthEvaluator::evaluate(&clean, &base, &t).verdict, Verdict::Ok);

        let dirty = sample(10.0, 1000.0, 0.001).with_extension("compliance_violations", 2.0);
        let verdict = HealthEvaluator::evaluate(&dirty, &base, &t);
        assert_eq!(verdict.verdict, Verdict::Critical);
        assert_eq!(
            verdict.triggers[0].check,
            Check::Extension("compliance_violations".to_string())
        );
    }

    #[test]
    fn worst_check_wins_and_all_triggers_listed() {
        let verdict = HealthEvaluator::evaluate(
            &sample(12.0, 700.0, 0.001),
            &baseline(10.0, 1000.0, 0.001),
            &Thresholds::default(),
        );
        assert_eq!(verdict.verdict, Verdict::Critical);
        assert_eq!(verdict.triggers.len(), 2);
    }

    #[test]
    fn non_finite_sample_fails_closed() {
        let verdict = HealthEvaluator::evaluate(
            &sample(f64::NAN, 1000.0, 0.0),
            &baseline(10.0, 1000.0, 0.001),
            &Thresholds::default(),
        );
        assert!(verdict.is_critical());
        assert_eq!(verdict.triggers[0].check, Check::Sanity);
    }

    #[test]
    fn probe_failure_is_critical() {
        let err = ProbeError::Unavailable {
            environment: "prod".to_string(),
            reason: "timeout".to_string(),
        };
        let verdict = HealthVerdict::probe_failure(&err);
        assert!(verdict.is_critical());
        assert_eq!(verdict.triggers[0].check, Check::Probe);
    }

    #[test]
    fn merge_keeps_worst() {
        let now = Utc::now();
        let warn = HealthVerdict::from_triggers(
            vec![Trigger {
                check: Check::Latency,
                severity: Verdict::Warning,
                observed: 12.0,
                baseline: 10.0,
                delta: 2.0,
                detail: "latency".to_string(),
            }],
            now,
        );
        let merged = HealthVerdict::ok(now).merge(warn).merge(HealthVerdict::ok(now));
        assert_eq!(merged.verdict, Verdict::Warning);
        assert_eq!(merged.triggers.len(), 1);
    }

    #[test]
    fn default_thresholds_validate() {
        assert!(Thresholds::default().validate().is_ok());
        let bad = Thresholds {
            soft_throughput_drop: 0.5,
            ..Thresholds::default()
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn soft_bounds_must_be_tighter_than_hard() {
        let loose_errors = Thresholds {
            soft_error_delta: 0.05,
            hard_error_ceiling: 0.05,
            ..Thresholds::default()
        };
        assert_eq!(
            loose_errors.validate().unwrap_err(),
            "soft_error_delta must be below hard_error_ceiling"
        );

        let equal_drops = Thresholds {
            soft_throughput_drop: 0.20,
            ..Thresholds::default()
        };
        assert!(equal_drops.validate().is_err());
    }

    #[test]
    fn non_finite_fractions_are_rejected() {
        for value in [f64::NAN, f64::INFINITY, -0.1] {
            let bad = Thresholds {
                soft_latency_fraction: value,
                ..Thresholds::default()
            };
            let err = bad.validate().unwrap_err();
            assert!(err.starts_with("soft_latency_fraction"), "{err}");
        }
    }

    proptest! {
        #[test]
        fn critical_iff_hard_threshold_exceeded(
            latency in 0.0f64..200.0,
            throughput in 0.0f64..2000.0,
            error_rate in 0.0f64..0.2,
        ) {
            let t = Thresholds::default();
            let base = baseline(10.0, 1000.0, 0.001);
            let verdict = HealthEvaluator::evaluate(&sample(latency, throughput, error_rate), &base, &t);

            let hard = latency - 10.0 > t.hard_latency_delta
                || throughput < 1000.0 * (1.0 - t.hard_throughput_drop)
                || error_rate > t.hard_error_ceiling;
            prop_assert_eq!(verdict.is_critical(), hard);
            prop_assert_eq!(verdict.verdict == Verdict::Ok, verdict.triggers.is_empty());
        }

        #[test]
        fn verdict_matches_worst_trigger(
            latency in 0.0f64..200.0,
            throughput in 0.0f64..2000.0,
        ) {
            let verdict = HealthEvaluator::evaluate(
                &sample(latency, throughput, 0.001),
                &baseline(10.0, 1000.0, 0.001),
                &Thresholds::default(),
            );
            let worst = verdict.triggers.iter().map(|t| t.severity).max().unwrap_or(Verdict::Ok);
            prop_assert_eq!(verdict.verdict, worst);
        }
    }
}
