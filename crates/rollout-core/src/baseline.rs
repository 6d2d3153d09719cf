//! Baseline store
//!
//! Holds the last known-good snapshot per environment. Reads never block one
//! another; writes are serialized per environment key by the underlying
//! sharded map.
//!
//! Overwriting a baseline requires a [`FinalizeGrant`], which only the
//! orchestrator can mint and only while a rollout is finalizing. A failed
//! rollout therefore has no way to touch the baseline.

use crate::error::BaselineError;
use crate::types::{Baseline, Environment, MetricSnapshot, RolloutId};
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Right to promote a snapshot to baseline, held by a finalizing rollout
#[derive(Debug)]
pub struct FinalizeGrant {
    rollout_id: RolloutId,
    environment: Environment,
}

impl FinalizeGrant {
    pub(crate) fn issue(rollout_id: RolloutId, environment: Environment) -> Self {
        Self {
            rollout_id,
            environment,
        }
    }

    /// Rollout holding the grant
    #[inline]
    #[must_use]
    pub fn rollout_id(&self) -> RolloutId {
        self.rollout_id
    }

    /// Environment the grant covers
    #[inline]
    #[must_use]
    pub fn environment(&self) -> &Environment {
        &self.environment
    }
}

/// Per-environment baseline map with optional JSON file backing
#[derive(Debug, Default)]
pub struct BaselineStore {
    baselines: DashMap<Environment, Baseline>,
    path: Option<PathBuf>,
    /// Serializes file writes
    persist_lock: Mutex<()>,
}

impl BaselineStore {
    /// Create in-memory store
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a file-backed store, loading any existing baselines
    ///
    /// # Errors
    /// Returns `BaselineError::Persistence` if an existing file cannot be
    /// read or parsed.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, BaselineError> {
        let path = path.into();
        let baselines = DashMap::new();

        if path.exists() {
            let raw = std::fs::read_to_string(&path)
                .map_err(|e| BaselineError::Persistence(format!("{}: {e}", path.display())))?;
            let stored: BTreeMap<Environment, Baseline> = serde_json::from_str(&raw)
                .map_err(|e| BaselineError::Persistence(format!("{}: {e}", path.display())))?;
            for (env, baseline) in stored {
                baselines.insert(env, baseline);
            }
            tracing::debug!(path = %path.display(), count = baselines.len(), "Loaded baselines");
        }

        Ok(Self {
            baselines,
            path: Some(path),
            persist_lock: Mutex::new(()),
        })
    }

    /// Get baseline for an environment
    ///
    /// # Errors
    /// Returns `BaselineError::NotFound` if none has been recorded.
    pub fn get(&self, environment: &Environment) -> Result<Baseline, BaselineError> {
        self.baselines
            .get(environment)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| BaselineError::NotFound(environment.to_string()))
    }

    /// Record the first baseline for an environment
    ///
    /// Refuses to overwrite an existing baseline; only a finalizing rollout
    /// may do that.
    ///
    /// # Errors
    /// Returns `BaselineError::AlreadyPresent` if a baseline exists.
    pub fn bootstrap(&self, snapshot: MetricSnapshot) -> Result<Baseline, BaselineError> {
        let environment = snapshot.environment.clone();
        let baseline = Baseline {
            snapshot,
            captured_at: Utc::now(),
            committed_by: None,
        };

        match self.baselines.entry(environment.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(BaselineError::AlreadyPresent(environment.to_string()));
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(baseline.clone());
            }
        }

        self.persist()?;
        Ok(baseline)
    }

    /// Promote a snapshot to baseline
    ///
    /// The in-memory baseline is updated before the file is written, so a
    /// persistence failure leaves the store consistent with the completed
    /// rollout and is reported to the caller.
    ///
    /// # Errors
    /// - `BaselineError::EnvironmentMismatch` if grant and snapshot disagree
    /// - `BaselineError::Persistence` if the backing file cannot be written
    pub fn commit(
        &self,
        grant: FinalizeGrant,
        snapshot: MetricSnapshot,
    ) -> Result<Baseline, BaselineError> {
        if grant.environment != snapshot.environment {
            return Err(BaselineError::EnvironmentMismatch {
                grant: grant.environment.to_string(),
                snapshot: snapshot.environment.to_string(),
            });
        }

        let baseline = Baseline {
            snapshot,
            captured_at: Utc::now(),
            committed_by: Some(grant.rollout_id),
        };
        self.baselines.insert(grant.environment.clone(), baseline.clone());
        tracing::info!(
            environment = %grant.environment,
            rollout_id = %grant.rollout_id,
            latency_ms = baseline.snapshot.latency_ms,
            "Baseline committed"
        );

        self.persist()?;
        Ok(baseline)
    }

    /// Environments with a baseline
    #[must_use]
    pub fn environments(&self) -> Vec<Environment> {
        let mut envs: Vec<Environment> = self.baselines.iter().map(|e| e.key().clone()).collect();
        envs.sort();
        envs
    }

    /// Backing file, if any
    #[inline]
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Write all baselines to the backing file (temp file + rename)
    fn persist(&self) -> Result<(), BaselineError> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let _guard = self.persist_lock.lock();
        let stored: BTreeMap<Environment, Baseline> = self
            .baselines
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();

        let encoded = serde_json::to_vec_pretty(&stored)
            .map_err(|e| BaselineError::Persistence(e.to_string()))?;
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, encoded)
            .and_then(|()| std::fs::rename(&tmp, path))
            .map_err(|e| BaselineError::Persistence(format!("{}: {e}", path.display())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(env: &str, latency: f64) -> MetricSnapshot {
        MetricSnapshot::new(env, latency, 1000.0, 0.001)
    }

    #[test]
    fn get_missing_is_not_found() {
        let store = BaselineStore::new();
        let err = store.get(&Environment::new("prod")).unwrap_err();
        assert!(matches!(err, BaselineError::NotFound(env) if env == "prod"));
    }

    #[test]
    fn bootstrap_only_once() {
        let store = BaselineStore::new();
        store.bootstrap(snapshot("prod", 10.0)).unwrap();

        let err = store.bootstrap(snapshot("prod", 99.0)).unwrap_err();
        assert!(matches!(err, BaselineError::AlreadyPresent(_)));

        let baseline = store.get(&Environment::new("prod")).unwrap();
        assert!((baseline.snapshot.latency_ms - 10.0).abs() < f64::EPSILON);
        assert_eq!(baseline.committed_by, None);
    }

    #[test]
    fn commit_overwrites_with_grant() {
        let store = BaselineStore::new();
        store.bootstrap(snapshot("prod", 10.0)).unwrap();

        let id = RolloutId::new();
        let grant = FinalizeGrant::issue(id, Environment::new("prod"));
        store.commit(grant, snapshot("prod", 10.2)).unwrap();

        let baseline = store.get(&Environment::new("prod")).unwrap();
        assert!((baseline.snapshot.latency_ms - 10.2).abs() < f64::EPSILON);
        assert_eq!(baseline.committed_by, Some(id));
    }

    #[test]
    fn commit_rejects_mismatched_environment() {
        let store = BaselineStore::new();
        let grant = FinalizeGrant::issue(RolloutId::new(), Environment::new("prod"));

        let err = store.commit(grant, snapshot("staging", 10.0)).unwrap_err();
        assert!(matches!(err, BaselineError::EnvironmentMismatch { .. }));
        assert!(store.get(&Environment::new("staging")).is_err());
    }

    #[test]
    fn file_backed_store_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("baselines.json");

        {
            let store = BaselineStore::open(&path).unwrap();
            store.bootstrap(snapshot("prod", 10.0)).unwrap();
            let grant = FinalizeGrant::issue(RolloutId::new(), Environment::new("staging"));
            store.commit(grant, snapshot("staging", 7.5)).unwrap();
        }

        let reopened = BaselineStore::open(&path).unwrap();
        assert_eq!(
            reopened.environments(),
            vec![Environment::new("prod"), Environment::new("staging")]
        );
        let staging = reopened.get(&Environment::new("staging")).unwrap();
        assert!((staging.snapshot.latency_ms - 7.5).abs() < f64::EPSILON);
    }

    #[test]
    fn corrupt_file_is_persistence_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("baselines.json");
        std::fs::write(&path, "not json").unwrap();

        assert!(matches!(
            BaselineStore::open(&path),
            Err(BaselineError::Persistence(_))
        ));
    }
}
