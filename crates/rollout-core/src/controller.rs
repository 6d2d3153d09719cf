//! Rollout controller
//!
//! The control surface callers use: start a rollout, read its status, abort
//! it, wait for it to finish. Each rollout runs as its own tokio task.
//!
//! At most one rollout may be active per environment. The environment lease
//! is taken before the task is spawned and released when the task ends, so a
//! second request for a busy environment is rejected, never queued.
//!
//! Finished rollouts stay queryable until `finished_retention` newer ones
//! have finished; after that only the history log remembers them.

use crate::config::ReconcilerConfig;
use crate::error::{ConfigError, ControlError};
use crate::history::HistoryEntry;
use crate::orchestrator::{Collaborators, DeploymentOrchestrator};
use crate::types::{DeploymentRequest, Environment, RolloutId, RolloutState};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::watch;

/// Live handle on one rollout
#[derive(Debug)]
struct RolloutHandle {
    state: Arc<RwLock<RolloutState>>,
    cancel: watch::Sender<bool>,
    done: watch::Receiver<bool>,
}

/// Releases an environment when its rollout task ends (or unwinds)
struct EnvironmentLease {
    leases: Arc<DashMap<Environment, RolloutId>>,
    environment: Environment,
    id: RolloutId,
}

impl Drop for EnvironmentLease {
    fn drop(&mut self) {
        self.leases
            .remove_if(&self.environment, |_, active| *active == self.id);
    }
}

/// Live and recently finished rollouts
#[derive(Debug)]
struct Registry {
    rollouts: DashMap<RolloutId, RolloutHandle>,
    finished: Mutex<VecDeque<RolloutId>>,
    retention: usize,
}

impl Registry {
    /// Record `id` as finished and evict whatever falls out of retention
    fn retire(&self, id: RolloutId) {
        let evicted: Vec<RolloutId> = {
            let mut finished = self.finished.lock();
            finished.push_back(id);
            let excess = finished.len().saturating_sub(self.retention);
            finished.drain(..excess).collect()
        };
        for old in evicted {
            self.rollouts.remove(&old);
            tracing::debug!(rollout_id = %old, "Finished rollout evicted");
        }
    }

    fn forget(&self, id: RolloutId) {
        self.rollouts.remove(&id);
        self.finished.lock().retain(|f| *f != id);
    }
}

/// Entry point for starting and supervising rollouts
pub struct RolloutController {
    config: ReconcilerConfig,
    deps: Collaborators,
    leases: Arc<DashMap<Environment, RolloutId>>,
    registry: Arc<Registry>,
}

impl std::fmt::Debug for RolloutController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RolloutController")
            .field("active", &self.leases.len())
            .field("rollouts", &self.registry.rollouts.len())
            .finish_non_exhaustive()
    }
}

impl RolloutController {
    /// Create controller
    ///
    /// Rollouts the history log reports as abandoned are logged; they are
    /// never resumed.
    ///
    /// # Errors
    /// Returns `ConfigError::Invalid` if the configuration is unusable.
    pub fn new(config: ReconcilerConfig, deps: Collaborators) -> Result<Self, ConfigError> {
        config.validate()?;

        for entry in deps.history.abandoned() {
            tracing::warn!(
                rollout_id = %entry.id,
                environment = %entry.environment,
                artifact = %entry.artifact,
                started_at = %entry.started_at,
                "Rollout abandoned in flight, reconcile manually"
            );
        }

        let registry = Arc::new(Registry {
            rollouts: DashMap::new(),
            finished: Mutex::new(VecDeque::new()),
            retention: config.finished_retention,
        });
        Ok(Self {
            config,
            deps,
            leases: Arc::new(DashMap::new()),
            registry,
        })
    }

    /// Start a rollout
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    /// - `ControlError::Validation` if the request is malformed (no side effects)
    /// - `ControlError::RolloutInProgress` if the environment is busy
    pub fn start_rollout(&self, request: DeploymentRequest) -> Result<RolloutId, ControlError> {
        request.validate()?;

        let id = RolloutId::new();
        let environment = request.environment.clone();
        match self.leases.entry(environment.clone()) {
            Entry::Occupied(active) => {
                tracing::info!(
                    environment = %environment,
                    active = %active.get(),
                    "Rollout rejected, environment busy"
                );
                return Err(ControlError::RolloutInProgress {
                    environment: environment.to_string(),
                    active: *active.get(),
                });
            }
            Entry::Vacant(slot) => {
                slot.insert(id);
            }
        }
        let lease = EnvironmentLease {
            leases: Arc::clone(&self.leases),
            environment,
            id,
        };

        let state = Arc::new(RwLock::new(RolloutState::new(id, request)));
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (done_tx, done_rx) = watch::channel(false);
        let orchestrator = DeploymentOrchestrator::new(
            self.config.clone(),
            self.deps.clone(),
            Arc::clone(&state),
            cancel_rx,
        );

        self.registry.rollouts.insert(
            id,
            RolloutHandle {
                state,
                cancel: cancel_tx,
                done: done_rx,
            },
        );

        let registry = Arc::clone(&self.registry);
        tokio::spawn(async move {
            let final_state = orchestrator.run().await;
            drop(lease);
            tracing::debug!(rollout_id = %final_state.id, phase = %final_state.phase, "Rollout task done");
            done_tx.send_replace(true);
            registry.retire(final_state.id);
        });

        Ok(id)
    }

    /// Current state of a rollout
    ///
    /// # Errors
    /// Returns `ControlError::NotFound` for an unknown or evicted id; see
    /// [`RolloutController::archived`] for evicted ones.
    pub fn status(&self, id: RolloutId) -> Result<RolloutState, ControlError> {
        self.registry
            .rollouts
            .get(&id)
            .map(|handle| handle.state.read().clone())
            .ok_or(ControlError::NotFound(id))
    }

    /// Request operator cancellation
    ///
    /// The rollout reaches `ABORTED` at its next phase boundary or
    /// observation tick; use [`RolloutController::wait`] to observe it.
    ///
    /// # Errors
    /// - `ControlError::NotFound` for an unknown id
    /// - `ControlError::AlreadyFinished` if the rollout is terminal
    pub fn abort(&self, id: RolloutId) -> Result<(), ControlError> {
        let handle = self
            .registry
            .rollouts
            .get(&id)
            .ok_or(ControlError::NotFound(id))?;
        let phase = handle.state.read().phase;
        if phase.is_terminal() {
            return Err(ControlError::AlreadyFinished { id, phase });
        }

        tracing::info!(rollout_id = %id, phase = %phase, "Abort requested");
        handle.cancel.send_replace(true);
        Ok(())
    }

    /// Wait for a rollout to reach a terminal phase
    ///
    /// # Errors
    /// - `ControlError::NotFound` for an unknown id
    /// - `ControlError::TaskFailed` if the rollout task died without finishing
    pub async fn wait(&self, id: RolloutId) -> Result<RolloutState, ControlError> {
        let (mut done, state) = {
            let handle = self
                .registry
                .rollouts
                .get(&id)
                .ok_or(ControlError::NotFound(id))?;
            (handle.done.clone(), Arc::clone(&handle.state))
        };

        done.wait_for(|finished| *finished)
            .await
            .map_err(|_| ControlError::TaskFailed(format!("rollout {id} task ended unexpectedly")))?;
        let snapshot = state.read().clone();
        Ok(snapshot)
    }

    /// Drop a finished rollout from the registry
    ///
    /// # Errors
    /// - `ControlError::NotFound` for an unknown id
    /// - `ControlError::StillActive` if the rollout has not finished
    pub fn forget(&self, id: RolloutId) -> Result<(), ControlError> {
        let phase = self
            .registry
            .rollouts
            .get(&id)
            .map(|handle| handle.state.read().phase)
            .ok_or(ControlError::NotFound(id))?;
        if !phase.is_terminal() {
            return Err(ControlError::StillActive { id, phase });
        }
        self.registry.forget(id);
        Ok(())
    }

    /// History record of a rollout, including evicted ones
    #[must_use]
    pub fn archived(&self, id: RolloutId) -> Option<HistoryEntry> {
        self.deps.history.get(id)
    }

    /// Active rollout for an environment, if any
    #[must_use]
    pub fn active(&self, environment: &Environment) -> Option<RolloutId> {
        self.leases.get(environment).map(|id| *id)
    }

    /// Active and retained rollouts, oldest first
    #[must_use]
    pub fn list(&self) -> Vec<RolloutState> {
        let mut states: Vec<RolloutState> = self
            .registry
            .rollouts
            .iter()
            .map(|entry| entry.value().state.read().clone())
            .collect();
        states.sort_by_key(|s| s.id);
        states
    }

    /// Effective configuration
    #[inline]
    #[must_use]
    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    /// Shared collaborators
    #[inline]
    #[must_use]
    pub fn collaborators(&self) -> &Collaborators {
        &self.deps
    }
}
