//! Valves: open/closed status derived from an actuator's requests and telemetry.
//!
//! A valve has no "am I open" sensor. Its status comes from the direction of the most recent
//! request and whether that request completed with evidence (limit switch, current or time
//! limit). Metering valves additionally integrate relative sub-moves into an absolute step
//! position, counted from fully closed.

use crate::action::{ActuatorAction, Motion};
use crate::actuator::{Actuator, Completion};
use crate::error::{ServoError, ServoResult};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;
use tracing::instrument;

/// Stable identifier of a valve within a line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ValveId(pub(crate) usize);

impl ValveId {
    /// Position in the line's valve table.
    pub fn index(&self) -> usize {
        self.0
    }
}

/// What a valve is known to be doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValveStatus {
    /// No evidence either way.
    Unknown,
    /// Seated, by limit switch, current or position evidence.
    Closed,
    /// Fully open, or open by some amount for a metering valve.
    Opened,
    /// A closing action is in flight.
    Closing,
    /// An opening action is in flight.
    Opening,
}

impl fmt::Display for ValveStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ValveStatus::Unknown => "unknown",
            ValveStatus::Closed => "closed",
            ValveStatus::Opened => "opened",
            ValveStatus::Closing => "closing",
            ValveStatus::Opening => "opening",
        };
        f.pad(s)
    }
}

/// Direction of `current`.
///
/// An explicit [`ActuatorAction::direction`] always wins. Otherwise the drive signal is compared
/// with the previous action's signal, or with `neutral` when there is no previous action or both
/// share the same signal. `open_above` says whether opening means a larger drive signal.
/// Returns `None` when the signal sits exactly on the reference.
pub fn infer_motion(
    current: &ActuatorAction,
    previous: Option<&ActuatorAction>,
    neutral: u16,
    open_above: bool,
) -> Option<Motion> {
    if let Some(direction) = current.direction {
        return Some(direction);
    }

    let reference = match previous {
        Some(previous) if previous.drive_signal != current.drive_signal => previous.drive_signal,
        _ => neutral,
    };
    let above = match current.drive_signal.cmp(&reference) {
        Ordering::Greater => true,
        Ordering::Less => false,
        Ordering::Equal => return None,
    };

    Some(if above == open_above {
        Motion::Opening
    } else {
        Motion::Closing
    })
}

/// Status for a request moving in `motion`.
pub fn derive_status(motion: Option<Motion>, succeeded: bool, active: bool) -> ValveStatus {
    match (motion, succeeded, active) {
        (Some(Motion::Opening), true, _) => ValveStatus::Opened,
        (Some(Motion::Opening), false, true) => ValveStatus::Opening,
        (Some(Motion::Closing), true, _) => ValveStatus::Closed,
        (Some(Motion::Closing), false, true) => ValveStatus::Closing,
        _ => ValveStatus::Unknown,
    }
}

// =============================================================================
// Metering
// =============================================================================

/// Metering parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeteringConfig {
    /// Absolute position `open()` moves to.
    pub open_position: i32,
    /// Largest magnitude of one sub-move, in steps.
    pub max_increment: i32,
    /// Drive-signal offset from neutral per step.
    pub signal_per_step: i32,
    /// Template for sub-moves; its limits and time limit are reused as-is.
    pub move_action: ActuatorAction,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct Steps {
    /// Confirmed position.
    position: i32,
    /// Sum of sub-moves requested but not yet retired.
    queued: i32,
}

impl Steps {
    fn planned(&self) -> i32 {
        self.position + self.queued
    }
}

/// Position bookkeeping of a metering valve.
#[derive(Debug)]
pub struct MeteringState {
    config: MeteringConfig,
    steps: Arc<Mutex<Steps>>,
}

impl MeteringState {
    /// Fresh bookkeeping; the valve is assumed seated.
    pub fn new(config: MeteringConfig) -> Self {
        Self {
            config,
            steps: Arc::new(Mutex::new(Steps::default())),
        }
    }

    /// Metering parameters.
    pub fn config(&self) -> &MeteringConfig {
        &self.config
    }

    /// Confirmed position in steps from fully closed.
    pub fn position(&self) -> i32 {
        self.steps.lock().position
    }

    /// Position once every queued sub-move has completed as requested.
    pub fn planned_position(&self) -> i32 {
        self.steps.lock().planned()
    }

    /// Clamp a relative move from `planned` to the travel left between closed and fully open.
    fn clamp(&self, planned: i32, delta: i32) -> i32 {
        let headroom = (self.config.open_position - planned).max(0);
        delta.clamp(-planned.max(0), headroom)
    }

    /// Split `delta` into sub-moves no larger than `max_increment`.
    fn split(&self, delta: i32) -> Vec<i32> {
        let max = self.config.max_increment.max(1);
        let mut remaining = delta;
        let mut moves = Vec::new();
        while remaining != 0 {
            let step = remaining.clamp(-max, max);
            moves.push(step);
            remaining -= step;
        }
        moves
    }

    /// Action for one sub-move of `steps`, offset from `neutral`.
    fn sub_move(&self, steps: i32, neutral: u16) -> ActuatorAction {
        let template = &self.config.move_action;
        let signal = (i32::from(neutral) + steps * self.config.signal_per_step)
            .clamp(0, i32::from(ActuatorAction::MAX_DRIVE_SIGNAL));
        let mut action = template.with_drive_signal(
            format!("{} {:+}", template.name, steps),
            u16::try_from(signal).unwrap_or(ActuatorAction::MAX_DRIVE_SIGNAL),
        );
        action.direction = Motion::of_steps(steps);
        action
    }
}

/// Fold a retired sub-move into the position.
///
/// Only a confirmed completion moves the position. A current-limit stop means the valve hit its
/// closed seat, as does any result below zero; both reset to 0.
fn settle(steps: &Mutex<Steps>, delta: i32, completion: &Completion) {
    let mut steps = steps.lock();
    steps.queued -= delta;
    if !completion.outcome.is_success() {
        tracing::debug!(delta, outcome = ?completion.outcome, "Sub-move not confirmed; position unchanged");
        return;
    }

    let next = steps.position + delta;
    steps.position = if completion.telemetry.current_limit_detected() || next < 0 {
        0
    } else {
        next
    };
    tracing::debug!(delta, position = steps.position, "Metering position updated");
}

// =============================================================================
// Valve
// =============================================================================

/// Simple open/close valve, or one that also tracks position.
#[derive(Debug)]
pub enum ValveKind {
    /// Open or closed, no position.
    Simple,
    /// Tracks a step position between zero and its open position.
    Metering(MeteringState),
}

/// A valve driven by one actuator.
#[derive(Debug)]
pub struct Valve {
    id: ValveId,
    name: String,
    actuator: Arc<Actuator>,
    open_action: ActuatorAction,
    close_action: ActuatorAction,
    neutral_signal: u16,
    kind: ValveKind,
}

impl Valve {
    /// Simple valve; see [`Valve::metering`] for position tracking.
    pub fn new(
        id: ValveId,
        name: impl Into<String>,
        actuator: Arc<Actuator>,
        open_action: ActuatorAction,
        close_action: ActuatorAction,
        neutral_signal: u16,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            actuator,
            open_action,
            close_action,
            neutral_signal,
            kind: ValveKind::Simple,
        }
    }

    /// Turn this valve into a metering valve.
    pub fn metering(mut self, config: MeteringConfig) -> Self {
        self.set_metering(config);
        self
    }

    pub(crate) fn set_metering(&mut self, config: MeteringConfig) {
        self.kind = ValveKind::Metering(MeteringState::new(config));
    }

    /// Identifier assigned at registration.
    pub fn id(&self) -> ValveId {
        self.id
    }

    /// Valve name, unique within a line.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The actuator driving this valve.
    pub fn actuator(&self) -> &Arc<Actuator> {
        &self.actuator
    }

    /// Simple or metering, with the metering bookkeeping.
    pub fn kind(&self) -> &ValveKind {
        &self.kind
    }

    /// True for valves that track position.
    pub fn is_metering(&self) -> bool {
        matches!(self.kind, ValveKind::Metering(_))
    }

    /// Whether opening means a larger drive signal than closing.
    fn open_above(&self) -> bool {
        match self.open_action.drive_signal.cmp(&self.close_action.drive_signal) {
            Ordering::Equal => self.open_action.drive_signal >= self.neutral_signal,
            ordering => ordering == Ordering::Greater,
        }
    }

    /// Open the valve; a metering valve moves to its open position.
    #[instrument(skip(self), fields(valve = %self.name), err)]
    pub fn open(&self) -> ServoResult<()> {
        match &self.kind {
            ValveKind::Simple => self.actuator.request(Some(self.open_action.clone())),
            ValveKind::Metering(state) => self.move_to(state.config.open_position).map(|_| ()),
        }
    }

    /// Close the valve; a metering valve moves to zero.
    #[instrument(skip(self), fields(valve = %self.name), err)]
    pub fn close(&self) -> ServoResult<()> {
        match &self.kind {
            ValveKind::Simple => self.actuator.request(Some(self.close_action.clone())),
            ValveKind::Metering(_) => self.move_to(0).map(|_| ()),
        }
    }

    /// Stop the valve's controller; queued requests on it are dropped.
    pub fn stop(&self) -> ServoResult<()> {
        self.actuator.stop()
    }

    /// Status inferred from the requested action and the latest telemetry.
    pub fn status(&self) -> ValveStatus {
        let Some(current) = self.actuator.requested_action() else {
            return ValveStatus::Unknown;
        };
        let previous = self.actuator.previous_action();
        let motion = infer_motion(
            &current,
            previous.as_ref(),
            self.neutral_signal,
            self.open_above(),
        );
        derive_status(
            motion,
            self.actuator.action_succeeded(),
            self.actuator.is_active(),
        )
    }

    /// Confirmed position of a metering valve.
    pub fn position(&self) -> Option<i32> {
        match &self.kind {
            ValveKind::Simple => None,
            ValveKind::Metering(state) => Some(state.position()),
        }
    }

    /// Move a metering valve to an absolute step position.
    ///
    /// The target is taken relative to the position the valve will reach once already queued
    /// sub-moves complete. Returns the relative move actually requested.
    pub fn move_to(&self, position: i32) -> ServoResult<i32> {
        let state = self.metering_state("move_to")?;
        self.submit_moves(state, |planned| position - planned)
    }

    /// Move a metering valve by `delta` steps, clamped to the available travel.
    ///
    /// Returns the clamped move; 0 means nothing was requested.
    #[instrument(skip(self), fields(valve = %self.name), err)]
    pub fn move_by(&self, delta: i32) -> ServoResult<i32> {
        let state = self.metering_state("move_by")?;
        self.submit_moves(state, |_| delta)
    }

    /// Clamp, reserve and enqueue the sub-moves for one relative move.
    ///
    /// The clamp and the reservation happen under one lock, so concurrent callers never share
    /// the same headroom.
    fn submit_moves(
        &self,
        state: &MeteringState,
        delta_from: impl FnOnce(i32) -> i32,
    ) -> ServoResult<i32> {
        let (requested, clamped) = {
            let mut steps = state.steps.lock();
            let planned = steps.planned();
            let requested = delta_from(planned);
            let clamped = state.clamp(planned, requested);
            steps.queued += clamped;
            (requested, clamped)
        };
        if clamped != requested {
            tracing::info!(
                valve = %self.name,
                requested,
                clamped,
                "Metering move clamped to available travel"
            );
        }

        let moves = state.split(clamped);
        for (i, &step) in moves.iter().enumerate() {
            let action = state.sub_move(step, self.neutral_signal);
            let steps = Arc::clone(&state.steps);
            let hook = Box::new(move |completion: &Completion| settle(&steps, step, completion));
            if let Err(err) = self.actuator.request_then(Some(action), hook) {
                // release the part of the reservation that never reached the queue
                let unsent: i32 = moves[i..].iter().sum();
                state.steps.lock().queued -= unsent;
                return Err(err);
            }
        }
        Ok(clamped)
    }

    fn metering_state(&self, operation: &'static str) -> ServoResult<&MeteringState> {
        match &self.kind {
            ValveKind::Metering(state) => Ok(state),
            ValveKind::Simple => Err(ServoError::Unsupported {
                valve: self.name.clone(),
                operation,
            }),
        }
    }

    /// Wait until the valve's actuator has retired every request.
    pub async fn wait_idle(&self) {
        self.actuator.wait_idle().await;
    }
}
