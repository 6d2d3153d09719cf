//! Deploy collaborators
//!
//! The artifact deploy backend and the caller-supplied pre-deployment
//! validator. Both are external to the reconciler; it only sequences them.

use crate::error::BackendError;
use crate::types::{ArtifactRef, DeploymentRequest, Environment};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[cfg(test)]
use mockall::automock;

/// Container orchestration / artifact deploy API
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DeployBackend: Send + Sync {
    /// Deploy `artifact` to a target slot receiving no traffic.
    /// Returns once the slot reports ready.
    async fn deploy_target(
        &self,
        environment: &Environment,
        artifact: &ArtifactRef,
    ) -> Result<(), BackendError>;

    /// Scale down and remove the target slot
    async fn remove_target(
        &self,
        environment: &Environment,
        artifact: &ArtifactRef,
    ) -> Result<(), BackendError>;

    /// Retire the previous version once `artifact` serves all traffic
    async fn retire_previous(
        &self,
        environment: &Environment,
        artifact: &ArtifactRef,
    ) -> Result<(), BackendError>;
}

/// Outcome of pre-deployment validation
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PrecheckReport {
    /// Whether the rollout may proceed
    pub passed: bool,
    /// Why it may not (or advisory notes when passed)
    pub reasons: Vec<String>,
}

impl PrecheckReport {
    /// Passing report
    #[inline]
    #[must_use]
    pub fn pass() -> Self {
        Self {
            passed: true,
            reasons: Vec::new(),
        }
    }

    /// Failing report
    #[inline]
    #[must_use]
    pub fn fail<I, S>(reasons: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            passed: false,
            reasons: reasons.into_iter().map(Into::into).collect(),
        }
    }

    /// Reasons joined for display
    #[must_use]
    pub fn summary(&self) -> String {
        if self.reasons.is_empty() {
            if self.passed {
                "passed".to_string()
            } else {
                "failed".to_string()
            }
        } else {
            self.reasons.join("; ")
        }
    }
}

/// Caller-supplied checks run in PRECHECK (infrastructure health,
/// dependency checks)
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PreDeploymentValidator: Send + Sync {
    async fn validate(&self, request: &DeploymentRequest) -> PrecheckReport;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fail_collects_reasons() {
        let report = PrecheckReport::fail(["db migration pending", "quota exceeded"]);
        assert!(!report.passed);
        assert_eq!(report.summary(), "db migration pending; quota exceeded");
    }

    #[test]
    fn pass_summary() {
        assert_eq!(PrecheckReport::pass().summary(), "passed");
        assert_eq!(PrecheckReport::fail(Vec::<String>::new()).summary(), "failed");
    }

    #[tokio::test]
    async fn mock_validator_sees_request() {
        let mut validator = MockPreDeploymentValidator::new();
        validator
            .expect_validate()
            .withf(|req| req.environment.as_str() == "prod")
            .times(1)
            .returning(|_| PrecheckReport::pass());

        let request = DeploymentRequest::new("prod", "api:v2");
        assert!(validator.validate(&request).await.passed);
    }
}
