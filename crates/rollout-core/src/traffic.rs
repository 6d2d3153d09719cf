//! Traffic control
//!
//! Abstraction over whatever splits traffic between the old and new version
//! (service mesh weights, ingress selectors, load balancer pools). Every
//! implementation must make `set_split` idempotent and `revert` a single
//! jump to 0%.

use crate::error::BackendError;
use crate::types::Environment;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

#[cfg(test)]
use mockall::automock;

/// Routing backend contract
#[cfg_attr(test, automock)]
#[async_trait]
pub trait TrafficController: Send + Sync {
    /// Route `new_version_percent` of traffic to the new version
    async fn set_split(&self, environment: &Environment, new_version_percent: u8)
        -> Result<(), BackendError>;

    /// Current percentage on the new version
    async fn get_split(&self, environment: &Environment) -> Result<u8, BackendError>;

    /// Send all traffic back to the old version
    async fn revert(&self, environment: &Environment) -> Result<(), BackendError>;
}

/// Observable change made by the in-memory controller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingChange {
    /// Environment changed
    pub environment: Environment,
    /// Previous new-version percentage
    pub from: u8,
    /// New new-version percentage
    pub to: u8,
}

/// Routing table held in memory
///
/// Used by simulations and tests. Failures can be injected to exercise the
/// orchestrator's backend error handling.
#[derive(Debug, Default)]
pub struct InMemoryTrafficController {
    splits: DashMap<Environment, u8>,
    changes: Mutex<Vec<RoutingChange>>,
    revert_calls: AtomicUsize,
    fail_sets: AtomicU32,
    fail_reverts: AtomicU32,
}

impl InMemoryTrafficController {
    /// Create empty routing table (every environment at 0%)
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` `set_split` calls with a transient error
    pub fn fail_next_sets(&self, count: u32) {
        self.fail_sets.store(count, Ordering::SeqCst);
    }

    /// Fail the next `count` `revert` calls with a transient error
    pub fn fail_next_reverts(&self, count: u32) {
        self.fail_reverts.store(count, Ordering::SeqCst);
    }

    /// Current split without going through the async contract
    #[must_use]
    pub fn current(&self, environment: &Environment) -> u8 {
        self.splits.get(environment).map_or(0, |v| *v)
    }

    /// Every effective change, in order
    #[must_use]
    pub fn changes(&self) -> Vec<RoutingChange> {
        self.changes.lock().clone()
    }

    /// Number of `revert` calls received, successful or not
    #[must_use]
    pub fn revert_calls(&self) -> usize {
        self.revert_calls.load(Ordering::SeqCst)
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn apply(&self, environment: &Environment, to: u8) {
        let mut entry = self.splits.entry(environment.clone()).or_insert(0);
        let from = *entry;
        if from == to {
            return;
        }
        *entry = to;
        drop(entry);

        self.changes.lock().push(RoutingChange {
            environment: environment.clone(),
            from,
            to,
        });
    }
}

#[async_trait]
impl TrafficController for InMemoryTrafficController {
    async fn set_split(
        &self,
        environment: &Environment,
        new_version_percent: u8,
    ) -> Result<(), BackendError> {
        if new_version_percent > 100 {
            return Err(BackendError::routing(format!(
                "split {new_version_percent}% out of range"
            )));
        }
        if Self::take_failure(&self.fail_sets) {
            return Err(BackendError::routing("injected set_split failure").transient());
        }
        self.apply(environment, new_version_percent);
        Ok(())
    }

    async fn get_split(&self, environment: &Environment) -> Result<u8, BackendError> {
        Ok(self.current(environment))
    }

    async fn revert(&self, environment: &Environment) -> Result<(), BackendError> {
        self.revert_calls.fetch_add(1, Ordering::SeqCst);
        if Self::take_failure(&self.fail_reverts) {
            return Err(BackendError::routing("injected revert failure").transient());
        }
        self.apply(environment, 0);
        Ok(())
    }
}
