//! Properties over arbitrary traffic schedules

use proptest::prelude::*;
use rollout_core::{Phase, RolloutEventKind};
use rollout_test_utils::{reading, request, Harness};
use std::future::Future;

fn paused_runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .start_paused(true)
        .build()
        .unwrap()
}

fn block_on<F: Future>(future: F) -> F::Output {
    paused_runtime().block_on(future)
}

/// Strictly increasing percentages ending at 100
fn schedule() -> impl Strategy<Value = Vec<u8>> {
    proptest::collection::btree_set(1u8..100, 0..5).prop_map(|set| {
        let mut steps: Vec<u8> = set.into_iter().collect();
        steps.push(100);
        steps
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn clean_run_visits_every_step_in_order(steps in schedule()) {
        let (state, applied, advanced) = block_on(async {
            let harness = Harness::builder().script(vec![reading(10.1)]).build();
            let state = harness.run(request(steps.clone())).await;
            let advanced: Vec<u8> = harness
                .event_kinds(state.id)
                .into_iter()
                .filter_map(|k| match k {
                    RolloutEventKind::StepAdvanced { traffic_percent, .. } => Some(traffic_percent),
                    _ => None,
                })
                .collect();
            (state, harness.applied_splits(), advanced)
        });

        prop_assert_eq!(state.phase, Phase::Completed);
        prop_assert_eq!(state.traffic_percent, 100);
        prop_assert_eq!(&applied, &steps);
        prop_assert_eq!(&advanced, &steps);
    }

    #[test]
    fn critical_verdict_never_completes(
        steps in schedule(),
        pick in any::<prop::sample::Index>(),
        spike in 61.0f64..500.0,
    ) {
        let bad = steps[pick.index(steps.len())];
        let (phase, baseline) = block_on(async {
            let harness = Harness::builder()
                .script(vec![reading(10.0)])
                .at_split(bad, reading(spike))
                .build();
            let state = harness.run(request(steps.clone())).await;
            (state.phase, harness.baseline_latency())
        });

        prop_assert!(matches!(phase, Phase::RolledBack | Phase::RollbackFailed));
        prop_assert_eq!(baseline, Some(10.0));
    }

    #[test]
    fn baseline_changes_only_on_completion(
        steps in schedule(),
        latency in 5.0f64..200.0,
    ) {
        let (phase, baseline) = block_on(async {
            let harness = Harness::builder().script(vec![reading(latency)]).build();
            let state = harness.run(request(steps.clone())).await;
            (state.phase, harness.baseline_latency())
        });

        let Some(baseline) = baseline else {
            return Err(TestCaseError::fail("baseline disappeared"));
        };
        if phase == Phase::Completed {
            prop_assert!((baseline - latency).abs() < 1e-9);
        } else {
            prop_assert!((baseline - 10.0).abs() < 1e-9);
        }
    }
}
