//! Abort and drain behaviour.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod common;

use common::*;
use servo_line::prelude::*;
use servo_line::telemetry::Report;
use std::collections::HashMap;
use tokio::sync::mpsc;

fn open_action() -> ActuatorAction {
    ActuatorAction::new("open", 2000)
        .with_limits(false, true)
        .with_time_limit(5.0)
}

fn report(pulses: bool, limit1_engaged: bool) -> String {
    Report {
        channel: 3,
        drive_signal: 2000,
        pulses_enabled: pulses,
        limit1_enabled: true,
        limit1_engaged,
        time_limit: 5.0,
        voltage: 24.0,
        ..Report::default()
    }
    .to_string()
}

const CONFIGURE: &str = "c03 d2000 a0 b1 i0000 t005.00 r";

#[tokio::test(flavor = "multi_thread")]
async fn test_stop_aborts_in_flight_and_drains_queue() {
    let (_line, a, mut board) = mock_line(3, vec![open_action()], patient_options());
    let (tx, mut rx) = mpsc::unbounded_channel();

    a.request_then(Some(open_action()), report_to(&tx, 0)).unwrap();
    a.request_then(Some(open_action()), report_to(&tx, 1)).unwrap();
    a.request_then(None, report_to(&tx, 2)).unwrap();
    assert_eq!(a.pending(), 3);

    board
        .expect_and_respond(CONFIGURE, &report(false, false))
        .await;
    board.expect_and_respond("c03 g r", &report(true, false)).await;

    // abort while the first request is waiting for motion to finish
    board.expect_exchange("c03 r").await;
    a.stop().unwrap();
    board.respond(&report(true, false));

    board.expect_and_respond("c03 s r", &report(false, false)).await;

    let mut outcomes = HashMap::new();
    for _ in 0..3 {
        let (tag, outcome) = within("completion", rx.recv()).await.unwrap();
        outcomes.insert(tag, outcome);
    }
    assert_eq!(outcomes[&0], Outcome::Aborted);
    assert_eq!(outcomes[&1], Outcome::Skipped);
    assert_eq!(outcomes[&2], Outcome::Skipped);

    within("idle", a.wait_idle()).await;
    assert_eq!(a.pending(), 0);
    assert!(!a.is_active());
    assert!(!a.action_succeeded());

    // the abort was consumed and does not cancel the next request
    a.request_then(Some(open_action()), report_to(&tx, 3)).unwrap();
    board
        .expect_and_respond(CONFIGURE, &report(false, false))
        .await;
    board.expect_and_respond("c03 g r", &report(false, true)).await;

    let (tag, outcome) = within("completion", rx.recv()).await.unwrap();
    assert_eq!((tag, outcome), (3, Outcome::Succeeded));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_abort_keeps_stopping_until_pulses_drop() {
    let (_line, a, mut board) = mock_line(3, vec![open_action()], patient_options());
    let (tx, mut rx) = mpsc::unbounded_channel();

    a.request_then(Some(open_action()), report_to(&tx, 0)).unwrap();
    board
        .expect_and_respond(CONFIGURE, &report(false, false))
        .await;
    board.expect_exchange("c03 g r").await;
    a.controller().unwrap().abort();
    board.respond(&report(true, false));

    // the board ignores the first stop
    board.expect_and_respond("c03 s r", &report(true, false)).await;
    board.expect_and_respond("c03 s r", &report(false, false)).await;

    let (_, outcome) = within("completion", rx.recv()).await.unwrap();
    assert_eq!(outcome, Outcome::Aborted);
    within("idle", a.wait_idle()).await;
    assert_eq!(a.controller().unwrap().state(), ProtocolState::Free);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_abort_drains_every_actuator_on_the_controller() {
    let mut sim = SimLine::new(fast_options());
    let slow = ChannelProfile {
        open_gain: 0.0001,
        ..quick_profile()
    };
    // 400 s of travel at 0.05 units/s; the move cannot finish before the abort lands
    let actions = vec![
        ActuatorAction::new("open", 2000)
            .with_limits(false, true)
            .with_time_limit(900.0),
        ActuatorAction::new("close", 1000)
            .with_limits(true, false)
            .with_time_limit(900.0),
    ];
    let v1 = sim.actuator("v1", 1, slow.clone(), actions.clone());
    let v2 = sim.actuator("v2", 2, slow, actions);
    let (tx, mut rx) = mpsc::unbounded_channel();

    v1.request_then(v1.action("open").cloned(), report_to(&tx, 0))
        .unwrap();
    v2.request_then(v2.action("open").cloned(), report_to(&tx, 1))
        .unwrap();
    v1.request_then(v1.action("close").cloned(), report_to(&tx, 2))
        .unwrap();

    // wait for the first move to get under way, then abort from the other actuator
    let mut state = sim.controller().subscribe_state();
    within(
        "motion",
        state.wait_for(|s| matches!(s, ProtocolState::AwaitingFinish)),
    )
    .await
    .unwrap();
    v2.stop().unwrap();

    let mut outcomes = HashMap::new();
    for _ in 0..3 {
        let (tag, outcome) = within("completion", rx.recv()).await.unwrap();
        outcomes.insert(tag, outcome);
    }
    assert_eq!(outcomes[&0], Outcome::Aborted);
    assert_eq!(outcomes[&1], Outcome::Skipped);
    assert_eq!(outcomes[&2], Outcome::Skipped);

    within("idle", sim.line.wait_idle()).await;
    assert!(sim.board.exchanges().iter().any(|line| line == "c01 s r"));
    assert!(!sim.board.exchanges().iter().any(|line| line.starts_with("c02")));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_abort_after_lost_run_response_still_sends_stop() {
    let (_line, a, mut board) = mock_line(3, vec![open_action()], patient_options());
    let (tx, mut rx) = mpsc::unbounded_channel();

    a.request_then(Some(open_action()), report_to(&tx, 0)).unwrap();
    board
        .expect_and_respond(CONFIGURE, &report(false, false))
        .await;
    // the run reaches the board but its answer is lost; the last report still shows pulses off
    board.expect_exchange("c03 g r").await;
    a.stop().unwrap();

    board.expect_and_respond("c03 s r", &report(false, false)).await;
    let (_, outcome) = within("completion", rx.recv()).await.unwrap();
    assert_eq!(outcome, Outcome::Aborted);
    within("idle", a.wait_idle()).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_shutdown_gives_up_on_a_silent_board() {
    let options = DispatchOptions {
        response_timeout: std::time::Duration::from_millis(20),
        max_confirm_attempts: None,
    };
    let (line, a, mut board) = mock_line(3, vec![open_action()], options);
    let (tx, mut rx) = mpsc::unbounded_channel();

    a.request_then(Some(open_action()), report_to(&tx, 0)).unwrap();
    a.request_then(Some(open_action()), report_to(&tx, 1)).unwrap();
    // the board never answers, so configuration is resent without limit
    board.expect_exchange(CONFIGURE).await;
    board.expect_exchange(CONFIGURE).await;

    within("shutdown", line.shutdown()).await;

    let mut outcomes = HashMap::new();
    for _ in 0..2 {
        let (tag, outcome) = within("completion", rx.recv()).await.unwrap();
        outcomes.insert(tag, outcome);
    }
    assert_eq!(outcomes[&0], Outcome::Aborted);
    assert_eq!(outcomes[&1], Outcome::Skipped);
    assert_eq!(a.pending(), 0);

    let mut stops = 0;
    while let Some(line) = board
        .next_exchange(std::time::Duration::from_millis(50))
        .await
    {
        if line == "c03 s r" {
            stops += 1;
        }
    }
    assert!(stops > 0, "shutdown should try to stop the moving channel");
    assert!(matches!(
        a.request_named("open"),
        Err(ServoError::ControllerStopped(_))
    ));
}
