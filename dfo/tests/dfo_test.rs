use std::time::Duration;

use dfo::test_helpers::{
    decision_for_run,
    test_config,
    wait_until,
    TestHarness,
    TEST_RUN,
};
use lib::types::TriggerDecisionToken;
use tracing_test::traced_test;

#[traced_test]
#[tokio::test]
async fn decisions_round_robin_across_registered_endpoints() {
    let mut harness = TestHarness::with_endpoints(&["trb-a", "trb-b"]);
    harness.start().await;
    harness.register_endpoint("trb-a").await;
    harness.register_endpoint("trb-b").await;

    for trigger_number in 1..=4 {
        harness.send_decision(trigger_number).await;
    }

    assert_eq!(1, harness.expect_forwarded("trb-a").await.trigger_number);
    assert_eq!(2, harness.expect_forwarded("trb-b").await.trigger_number);
    assert_eq!(3, harness.expect_forwarded("trb-a").await.trigger_number);
    assert_eq!(4, harness.expect_forwarded("trb-b").await.trigger_number);

    for trigger_number in [1u64, 3] {
        harness.send_token("trb-a", trigger_number).await;
    }
    for trigger_number in [2u64, 4] {
        harness.send_token("trb-b", trigger_number).await;
    }
    let orchestrator = harness.orchestrator.clone();
    wait_until(move || orchestrator.is_empty()).await;

    // Nobody ever went busy, so the inhibit line stays silent.
    assert!(harness.no_pending_inhibit());
    assert!(!logs_contain("UnableToAssign"));

    harness.orchestrator.drain_stop().await.unwrap();
    assert!(!logs_contain("IncompleteTriggerDecision"));
}

#[traced_test]
#[tokio::test]
async fn saturating_the_only_endpoint_raises_and_clears_the_inhibit() {
    let mut harness = TestHarness::with_endpoints(&["trb-a"]);
    harness.start().await;
    harness.register_endpoint("trb-a").await;

    // busy_threshold is 5: the fifth assignment promotes the endpoint.
    for trigger_number in 1..=5 {
        harness.send_decision(trigger_number).await;
        harness.expect_forwarded("trb-a").await;
    }
    let inhibit = harness.expect_inhibit().await;
    assert!(inhibit.busy);
    assert_eq!(TEST_RUN, inhibit.run_number);

    // free_threshold is 3: the second completion demotes it again.
    for trigger_number in 1..=3 {
        harness.send_token("trb-a", trigger_number).await;
    }
    let inhibit = harness.expect_inhibit().await;
    assert!(!inhibit.busy);

    let orchestrator = harness.orchestrator.clone();
    wait_until(move || orchestrator.used_slots() == 2).await;
    assert!(harness.no_pending_inhibit());
}

#[traced_test]
#[tokio::test]
async fn occupancy_inside_the_hysteresis_band_does_not_chatter() {
    let mut harness = TestHarness::with_endpoints(&["trb-a"]);
    harness.start().await;
    harness.register_endpoint("trb-a").await;

    // 0 -> 4: inside the band coming from below, still free.
    for trigger_number in 1..=4 {
        harness.send_decision(trigger_number).await;
        harness.expect_forwarded("trb-a").await;
    }
    assert!(harness.no_pending_inhibit());

    // 4 -> 5 crosses the busy threshold.
    harness.send_decision(5).await;
    harness.expect_forwarded("trb-a").await;
    assert!(harness.expect_inhibit().await.busy);

    // 5 -> 4 stays inside the band, no transmission.
    harness.send_token("trb-a", 1).await;
    let orchestrator = harness.orchestrator.clone();
    wait_until(move || orchestrator.used_slots() == 4).await;
    assert!(harness.no_pending_inhibit());

    // 4 -> 3 crosses the free threshold.
    harness.send_token("trb-a", 2).await;
    assert!(!harness.expect_inhibit().await.busy);
    assert!(harness.no_pending_inhibit());
}

#[traced_test]
#[tokio::test]
async fn failed_dispatch_marks_the_endpoint_and_reroutes() {
    let mut harness = TestHarness::with_endpoints(&["trb-a", "trb-b"]);
    harness.start().await;
    harness.register_endpoint("trb-a").await;
    harness.register_endpoint("trb-b").await;

    // Kill trb-a's inbound channel: every send to it now fails.
    drop(harness.trb_inboxes.remove("trb-a").unwrap());

    harness.send_decision(1).await;
    assert_eq!(1, harness.expect_forwarded("trb-b").await.trigger_number);

    let endpoint = harness.orchestrator.endpoint("trb-a").unwrap();
    assert!(endpoint.is_in_error());
    assert!(logs_contain("OperationFailed"));
    logs_assert(|lines: &[&str]| {
        let updates = lines
            .iter()
            .filter(|line| {
                line.contains("could not forward the trigger decision")
            })
            .count();
        match updates {
            1 => Ok(()),
            n => Err(format!("expected one endpoint update, saw {n}")),
        }
    });

    // A real token from trb-a proves it is back; traffic resumes there.
    harness.send_token("trb-a", 999).await;
    let orchestrator = harness.orchestrator.clone();
    wait_until(move || {
        orchestrator
            .endpoint("trb-a")
            .is_some_and(|e| !e.is_in_error())
    })
    .await;
    assert!(logs_contain("AssignedTriggerDecisionNotFound"));
}

#[traced_test]
#[tokio::test]
async fn messages_from_another_run_are_dropped() {
    let mut harness = TestHarness::with_endpoints(&["trb-a"]);
    harness.start().await;
    harness.register_endpoint("trb-a").await;

    harness
        .tokens
        .send(TriggerDecisionToken {
            run_number: 41,
            trigger_number: 1,
            decision_destination: "trb-a".to_owned(),
        })
        .await
        .unwrap();
    harness
        .decisions
        .send(decision_for_run(1, 41))
        .await
        .unwrap();

    wait_until(|| logs_contain("from MLT")).await;
    wait_until(|| logs_contain("TRB at connection trb-a")).await;
    assert!(logs_contain("RunNumberMismatch"));

    // Neither message changed any state.
    assert_eq!(0, harness.orchestrator.used_slots());
    assert!(harness.no_pending_inhibit());
    assert!(
        tokio::time::timeout(
            Duration::from_millis(50),
            harness.expect_forwarded("trb-a")
        )
        .await
        .is_err()
    );
}

#[traced_test]
#[tokio::test]
async fn tokens_from_unknown_endpoints_are_dropped() {
    let harness = TestHarness::with_endpoints(&["trb-a"]);
    harness.start().await;
    harness.register_endpoint("trb-a").await;

    harness.send_token("trb-nowhere", 1).await;
    wait_until(|| logs_contain("UnknownTokenSource")).await;
    assert_eq!(0, harness.orchestrator.used_slots());
}

#[traced_test]
#[tokio::test]
async fn drain_reports_one_incomplete_decision_per_residual() {
    let mut config = test_config();
    config.stop_timeout_ms = 200;
    let mut harness = TestHarness::new(&["trb-a"], config);
    harness.start().await;
    harness.register_endpoint("trb-a").await;

    harness.send_decision(1).await;
    harness.send_decision(2).await;
    harness.expect_forwarded("trb-a").await;
    harness.expect_forwarded("trb-a").await;
    let orchestrator = harness.orchestrator.clone();
    wait_until(move || orchestrator.used_slots() == 2).await;

    harness.orchestrator.drain_stop().await.unwrap();

    assert!(harness.orchestrator.is_empty());
    assert!(logs_contain("trigger decision 1 of run 42"));
    assert!(logs_contain("trigger decision 2 of run 42"));
    logs_assert(|lines: &[&str]| {
        let residuals = lines
            .iter()
            .filter(|line| line.contains("IncompleteTriggerDecision"))
            .count();
        match residuals {
            2 => Ok(()),
            n => Err(format!("expected two residuals, saw {n}")),
        }
    });
}

#[traced_test]
#[tokio::test]
async fn decisions_wait_out_an_endpoint_that_has_not_proven_liveness() {
    let mut harness = TestHarness::with_endpoints(&["trb-a"]);
    harness.start().await;
    // A single sentinel announces the endpoint but does not clear the
    // admission guard.
    harness.announce_endpoint("trb-a").await;
    assert!(harness.orchestrator.endpoint("trb-a").unwrap().is_in_error());

    harness.send_decision(1).await;
    wait_until(|| logs_contain("UnableToAssign")).await;
    // All capacity is masked, so the trigger gets inhibited while the
    // decision waits.
    assert!(harness.expect_inhibit().await.busy);

    // The first real token proves liveness; the held decision goes out and
    // the inhibit clears.
    harness.send_token("trb-a", 999).await;
    assert_eq!(1, harness.expect_forwarded("trb-a").await.trigger_number);
    assert!(!harness.expect_inhibit().await.busy);
    assert!(logs_contain("AssignedTriggerDecisionNotFound"));

    let orchestrator = harness.orchestrator.clone();
    wait_until(move || orchestrator.used_slots() == 1).await;
    harness.send_token("trb-a", 1).await;
    let orchestrator = harness.orchestrator.clone();
    wait_until(move || orchestrator.is_empty()).await;
}

#[traced_test]
#[tokio::test]
async fn a_lone_saturated_endpoint_still_absorbs_decisions() {
    let mut config = test_config();
    config.busy_threshold = 2;
    config.free_threshold = 1;
    let mut harness = TestHarness::new(&["trb-a"], config);
    harness.start().await;
    harness.register_endpoint("trb-a").await;

    for trigger_number in 1..=3 {
        harness.send_decision(trigger_number).await;
        harness.expect_forwarded("trb-a").await;
    }

    let endpoint = harness.orchestrator.endpoint("trb-a").unwrap();
    assert_eq!(3, endpoint.used_slots());
    assert!(logs_contain("AssignedToBusyApp"));
    assert!(harness.expect_inhibit().await.busy);
}

#[traced_test]
#[tokio::test]
async fn scrap_forgets_every_endpoint() {
    let harness = TestHarness::with_endpoints(&["trb-a"]);
    harness.start().await;
    harness.register_endpoint("trb-a").await;

    harness.orchestrator.drain_stop().await.unwrap();
    harness.orchestrator.scrap().unwrap();
    assert!(harness.orchestrator.endpoint("trb-a").is_none());

    // Scrapped means unconfigured: a bare start is rejected.
    assert!(harness.orchestrator.clone().start(TEST_RUN).await.is_err());
}

#[traced_test]
#[tokio::test]
async fn lifecycle_commands_are_rejected_out_of_order() {
    let harness = TestHarness::with_endpoints(&["trb-a"]);

    // Not running yet.
    assert!(harness.orchestrator.drain_stop().await.is_err());
    assert!(harness.orchestrator.scrap().is_ok());

    // Scrap moved us back to unconfigured.
    assert!(harness.orchestrator.clone().start(TEST_RUN).await.is_err());

    harness.orchestrator.configure(&test_config()).unwrap();
    harness.orchestrator.clone().start(TEST_RUN).await.unwrap();
    assert!(harness.orchestrator.configure(&test_config()).is_err());
    harness.orchestrator.drain_stop().await.unwrap();
}

#[traced_test]
#[tokio::test]
async fn inconsistent_thresholds_abort_configuration() {
    let mut config = test_config();
    config.busy_threshold = 2;
    config.free_threshold = 4;
    let harness = TestHarness::with_endpoints(&["trb-a"]);
    let err = harness.orchestrator.configure(&config).unwrap_err();
    assert!(err.to_string().contains("busy threshold"));
}
