//! Dispatcher protocol tests.
//!
//! Exact wire sequences are checked against the scripted mock port; queueing, retries and fault
//! tolerance run against the simulated board.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod common;

use common::*;
use servo_line::prelude::*;
use servo_line::telemetry::Report;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

fn open_action() -> ActuatorAction {
    ActuatorAction::new("open", 2000)
        .with_limits(false, true)
        .with_time_limit(5.0)
}

/// Report for channel 3 holding `open_action()`.
fn report(channel: u8, pulses: bool, limit1_engaged: bool, elapsed: f64) -> String {
    Report {
        channel,
        drive_signal: 2000,
        pulses_enabled: pulses,
        limit0_enabled: false,
        limit0_engaged: false,
        limit1_enabled: true,
        limit1_engaged,
        current_limit: 0,
        current: if pulses { 120 } else { 0 },
        time_limit: 5.0,
        elapsed,
        voltage: 24.0,
        error_bits: 0,
    }
    .to_string()
}

const CONFIGURE: &str = "c03 d2000 a0 b1 i0000 t005.00 r";

// =============================================================================
// Wire sequences (mock port)
// =============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn test_request_runs_configure_go_poll_sequence() {
    let (_line, a, mut board) = mock_line(3, vec![open_action()], patient_options());
    let (tx, mut rx) = mpsc::unbounded_channel();

    a.request_then(Some(open_action()), report_to(&tx, 0)).unwrap();
    assert_eq!(a.pending(), 1);

    board
        .expect_and_respond(CONFIGURE, &report(3, false, false, 0.0))
        .await;
    board
        .expect_and_respond("c03 g r", &report(3, true, false, 0.0))
        .await;
    board
        .expect_and_respond("c03 r", &report(3, true, false, 0.1))
        .await;
    board
        .expect_and_respond("c03 r", &report(3, false, true, 0.2))
        .await;

    let (_, outcome) = within("completion", rx.recv()).await.unwrap();
    assert_eq!(outcome, Outcome::Succeeded);
    within("idle", a.wait_idle()).await;

    assert!(a.action_succeeded());
    assert!(!a.is_active());
    assert_eq!(a.telemetry().report_count, 4);
    assert_eq!(a.controller().unwrap().state(), ProtocolState::Free);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_request_without_action_sends_nothing() {
    let (_line, a, mut board) = mock_line(3, vec![open_action()], patient_options());

    a.request(None).unwrap();
    within("idle", a.wait_idle()).await;
    board.expect_silence(Duration::from_millis(100)).await;

    assert_eq!(a.pending(), 0);
    assert_eq!(a.requested_action(), None);
    assert!(a.action_succeeded());
    assert_eq!(a.telemetry().report_count, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_lost_response_repeats_the_command() {
    let options = DispatchOptions {
        response_timeout: Duration::from_millis(150),
        max_confirm_attempts: Some(25),
    };
    let (_line, a, mut board) = mock_line(3, vec![open_action()], options);

    a.request_named("open").unwrap();

    // first configuration goes unanswered
    board.expect_exchange(CONFIGURE).await;
    board
        .expect_and_respond(CONFIGURE, &report(3, false, false, 0.0))
        .await;
    // already at the open stop: the run is accepted but inhibited
    board
        .expect_and_respond("c03 g r", &report(3, false, true, 0.0))
        .await;

    within("idle", a.wait_idle()).await;
    assert!(a.action_succeeded());
    board.expect_silence(Duration::from_millis(50)).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_out_of_turn_report_is_dropped() {
    let (_line, a, mut board) = mock_line(3, vec![open_action()], patient_options());

    a.request_named("open").unwrap();

    board
        .expect_and_respond(CONFIGURE, &report(4, false, false, 0.0))
        .await;
    // the report for channel 4 confirmed nothing, so configuration is sent again
    board
        .expect_and_respond(CONFIGURE, &report(3, false, false, 0.0))
        .await;
    board
        .expect_and_respond("c03 g r", &report(3, false, true, 0.0))
        .await;

    within("idle", a.wait_idle()).await;
    assert_eq!(a.telemetry().channel, 3);
    assert_eq!(a.telemetry().report_count, 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_stop_without_evidence_is_unconfirmed() {
    let (_line, a, mut board) = mock_line(3, vec![open_action()], patient_options());
    let (tx, mut rx) = mpsc::unbounded_channel();

    a.request_then(Some(open_action()), report_to(&tx, 0)).unwrap();

    board
        .expect_and_respond(CONFIGURE, &report(3, false, false, 0.0))
        .await;
    board
        .expect_and_respond("c03 g r", &report(3, true, false, 0.0))
        .await;
    // pulses dropped mid-travel: no limit, no current trip, time limit not reached
    board
        .expect_and_respond("c03 r", &report(3, false, false, 1.5))
        .await;

    let (_, outcome) = within("completion", rx.recv()).await.unwrap();
    assert_eq!(outcome, Outcome::Unconfirmed);
    within("idle", a.wait_idle()).await;
    assert!(!a.action_succeeded());
}

// =============================================================================
// Queueing and fault tolerance (simulated board)
// =============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn test_requests_retire_in_order_one_at_a_time() {
    let mut sim = SimLine::new(fast_options());
    let v1 = sim.actuator("v1", 1, quick_profile(), valve_actions());
    let v2 = sim.actuator("v2", 2, quick_profile(), valve_actions());
    let (tx, mut rx) = mpsc::unbounded_channel();

    let plan = [
        (&v1, "open"),
        (&v2, "open"),
        (&v1, "close"),
        (&v2, "close"),
        (&v1, "open"),
    ];
    for (i, (actuator, action)) in plan.iter().enumerate() {
        let me = Arc::clone(actuator);
        let other = if Arc::ptr_eq(actuator, &v1) {
            Arc::clone(&v2)
        } else {
            Arc::clone(&v1)
        };
        let tx = tx.clone();
        actuator
            .request_then(
                actuator.action(action).cloned(),
                Box::new(move |completion: &Completion| {
                    let _ = tx.send((i, completion.outcome, me.is_active(), other.is_active()));
                }),
            )
            .unwrap();
    }
    assert!(v1.pending() <= 3);
    assert!(v2.pending() <= 2);

    for expected in 0..plan.len() {
        let (i, outcome, me_active, other_active) =
            within("completion", rx.recv()).await.unwrap();
        assert_eq!(i, expected);
        assert_eq!(outcome, Outcome::Succeeded);
        assert!(me_active, "hook runs while its actuator is serviced");
        assert!(!other_active, "only one actuator is active at a time");
    }

    within("idle", sim.line.wait_idle()).await;
    assert_eq!(v1.pending(), 0);
    assert_eq!(v2.pending(), 0);
    assert_eq!(sim.board.position(1), Some(20.0));
    assert_eq!(sim.board.position(2), Some(0.0));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unconfirmed_configuration_gives_up() {
    let options = DispatchOptions {
        max_confirm_attempts: Some(3),
        ..fast_options()
    };
    let mut sim = SimLine::new(options);
    let v1 = sim.actuator("v1", 1, quick_profile(), valve_actions());
    sim.board.inject(Fault::IgnoreConfiguration(1000));
    let (tx, mut rx) = mpsc::unbounded_channel();

    v1.request_then(v1.action("open").cloned(), report_to(&tx, 0))
        .unwrap();

    let (_, outcome) = within("completion", rx.recv()).await.unwrap();
    assert_eq!(outcome, Outcome::Failed);
    within("idle", v1.wait_idle()).await;

    let configures = sim
        .board
        .exchanges()
        .iter()
        .filter(|line| line.starts_with("c01 d2000"))
        .count();
    assert_eq!(configures, 3);
    assert!(!sim.board.exchanges().iter().any(|line| line.contains(" g ")));
    assert_eq!(sim.controller().state(), ProtocolState::Free);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_dropped_and_garbled_responses_are_survived() {
    let mut sim = SimLine::new(fast_options());
    let v1 = sim.actuator("v1", 1, quick_profile(), valve_actions());
    let mut telemetry = v1.subscribe_telemetry();

    sim.board.inject(Fault::DropResponses(3));
    sim.board.inject(Fault::GarbleReports(2));
    v1.request_named("open").unwrap();

    within("telemetry", telemetry.changed()).await.unwrap();
    within("idle", v1.wait_idle()).await;

    assert!(v1.action_succeeded());
    assert!(v1.telemetry().limit1_engaged);
    assert_eq!(sim.board.position(1), Some(20.0));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_time_limit_alone_completes_a_move() {
    let mut sim = SimLine::new(fast_options());
    let nudge = ActuatorAction::new("nudge", 1600).with_time_limit(0.5);
    let v1 = sim.actuator("v1", 1, quick_profile(), vec![nudge]);
    let (tx, mut rx) = mpsc::unbounded_channel();

    v1.request_then(v1.action("nudge").cloned(), report_to(&tx, 0))
        .unwrap();

    let (_, outcome) = within("completion", rx.recv()).await.unwrap();
    assert_eq!(outcome, Outcome::Succeeded);
    let telemetry = v1.telemetry();
    assert!(telemetry.time_limit_detected());
    assert!(!telemetry.position_detected());
    // 5 units/s for half a second
    let position = sim.board.position(1).unwrap();
    assert!((position - 2.5).abs() < 1e-6, "position {}", position);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_shutdown_refuses_new_requests() {
    let mut sim = SimLine::new(fast_options());
    let v1 = sim.actuator("v1", 1, quick_profile(), valve_actions());

    sim.line.shutdown().await;
    let err = v1.request_named("open").unwrap_err();
    assert!(matches!(err, ServoError::ControllerStopped(_)));
    assert_eq!(v1.pending(), 0);
}
