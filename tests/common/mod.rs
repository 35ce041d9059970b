//! Shared fixtures for the servo line integration tests.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic, dead_code)]

use servo_line::prelude::*;
use servo_line::sim::mock_serial::{self, ServoHarness};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Upper bound for any single wait in these tests.
pub const TEST_DEADLINE: Duration = Duration::from_secs(10);

/// Fast dispatcher settings so lost-response scenarios finish quickly.
pub fn fast_options() -> DispatchOptions {
    DispatchOptions {
        response_timeout: Duration::from_millis(30),
        max_confirm_attempts: Some(25),
    }
}

pub async fn within<F: Future>(what: &str, future: F) -> F::Output {
    tokio::time::timeout(TEST_DEADLINE, future)
        .await
        .unwrap_or_else(|_| panic!("timed out: {}", what))
}

/// Open/close actions for a limit-switched valve.
pub fn valve_actions() -> Vec<ActuatorAction> {
    vec![
        ActuatorAction::new("open", 2000)
            .with_limits(false, true)
            .with_time_limit(30.0),
        ActuatorAction::new("close", 1000)
            .with_limits(true, false)
            .with_time_limit(30.0),
    ]
}

/// A quick valve on the simulated board: 25 units/s over 20 units of travel.
pub fn quick_profile() -> ChannelProfile {
    ChannelProfile {
        open_gain: 0.05,
        close_gain: 0.05,
        travel: 20.0,
        ..ChannelProfile::default()
    }
}

/// A line with one controller on a simulated board.
pub struct SimLine {
    pub board: SimulatedBoard,
    pub line: LineRegistry,
    pub controller: ControllerId,
}

impl SimLine {
    pub fn new(options: DispatchOptions) -> Self {
        let board = SimulatedBoard::new();
        let mut line = LineRegistry::new();
        let controller = line.spawn_controller("servo-a", board.link(), options);
        Self {
            board,
            line,
            controller,
        }
    }

    pub fn controller(&self) -> &ServoController {
        self.line.controller(self.controller).unwrap()
    }

    pub fn actuator(
        &mut self,
        name: &str,
        channel: u8,
        profile: ChannelProfile,
        actions: Vec<ActuatorAction>,
    ) -> Arc<Actuator> {
        self.board.add_channel(channel, profile);
        let id = self
            .line
            .add_actuator(self.controller, name, channel, actions)
            .unwrap();
        Arc::clone(self.line.actuator(id).unwrap())
    }
}

/// Settings for scripted-port tests, where the test itself answers every exchange.
pub fn patient_options() -> DispatchOptions {
    DispatchOptions {
        response_timeout: Duration::from_millis(500),
        max_confirm_attempts: Some(25),
    }
}

/// A line with one controller on a scripted mock port.
pub fn mock_line(
    channel: u8,
    actions: Vec<ActuatorAction>,
    options: DispatchOptions,
) -> (LineRegistry, Arc<Actuator>, ServoHarness) {
    let (port, harness) = mock_serial::new();
    let mut line = LineRegistry::new();
    let controller = line.spawn_controller("bench", LineTransport::link(Box::new(port)), options);
    let id = line.add_actuator(controller, "a", channel, actions).unwrap();
    let actuator = Arc::clone(line.actuator(id).unwrap());
    (line, actuator, harness)
}

/// Completion hook that reports `(tag, outcome)` on `tx`.
pub fn report_to(tx: &mpsc::UnboundedSender<(usize, Outcome)>, tag: usize) -> CompletionHook {
    let tx = tx.clone();
    Box::new(move |completion: &Completion| {
        let _ = tx.send((tag, completion.outcome));
    })
}
