//! Per-environment mutual exclusion

use rollout_core::{ControlError, DeploymentRequest, Phase};
use rollout_test_utils::{request, Harness};
use std::time::Duration;

#[tokio::test(start_paused = true)]
async fn second_rollout_for_busy_environment_is_rejected() {
    let harness = Harness::builder().build();
    let first = harness
        .controller
        .start_rollout(request(vec![25, 100]).with_dwell(Duration::from_secs(30)))
        .unwrap();
    harness
        .until(first, |s| matches!(s.phase, Phase::Migrating { .. }))
        .await;
    let before = harness.controller.status(first).unwrap();

    let err = harness
        .controller
        .start_rollout(DeploymentRequest::new("prod", "api:v3"))
        .unwrap_err();

    assert_eq!(
        err,
        ControlError::RolloutInProgress {
            environment: "prod".to_string(),
            active: first,
        }
    );
    let after = harness.controller.status(first).unwrap();
    assert_eq!(after.phase, before.phase);
    assert_eq!(after.traffic_percent, before.traffic_percent);
    assert_eq!(after.request, before.request);
    assert_eq!(harness.controller.list().len(), 1);

    let done = harness.controller.wait(first).await.unwrap();
    assert_eq!(done.phase, Phase::Completed);
    assert!(harness
        .controller
        .start_rollout(DeploymentRequest::new("prod", "api:v3"))
        .is_ok());
}

#[tokio::test(start_paused = true)]
async fn rejected_request_does_not_touch_routing() {
    let harness = Harness::builder().build();
    let first = harness
        .controller
        .start_rollout(request(vec![100]).with_dwell(Duration::from_secs(30)))
        .unwrap();
    harness.until(first, |s| s.traffic_percent == 100).await;
    let changes_before = harness.traffic.changes().len();

    for _ in 0..5 {
        assert!(harness
            .controller
            .start_rollout(DeploymentRequest::new("prod", "api:v9"))
            .is_err());
    }

    assert_eq!(harness.traffic.changes().len(), changes_before);
    assert_eq!(harness.deploy.deployed(), 1);
    harness.controller.abort(first).unwrap();
    assert_eq!(
        harness.controller.wait(first).await.unwrap().phase,
        Phase::Aborted
    );
}

#[tokio::test(start_paused = true)]
async fn other_environments_are_not_blocked() {
    let harness = Harness::builder().build();
    let prod = harness
        .controller
        .start_rollout(request(vec![100]).with_dwell(Duration::from_secs(30)))
        .unwrap();
    let staging = harness
        .controller
        .start_rollout(DeploymentRequest::new("staging", "api:v2").with_steps(vec![100]))
        .unwrap();

    assert_ne!(prod, staging);
    assert_eq!(harness.controller.active(&"prod".into()), Some(prod));
    assert_eq!(harness.controller.active(&"staging".into()), Some(staging));

    let staging_state = harness.controller.wait(staging).await.unwrap();
    assert_eq!(staging_state.phase, Phase::Completed);
    assert!(!harness.controller.status(prod).unwrap().phase.is_terminal());
}
