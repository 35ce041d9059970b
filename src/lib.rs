//! # Servo Line
//!
//! Motion control for the valves of a vacuum/gas processing line, driven through servo boards
//! on a serial command/response link.
//!
//! ## Crate Structure
//!
//! - **`action`**: `ActuatorAction`, the "configure and move like this" request, and `Motion`.
//! - **`telemetry`**: the fixed-column report line and the completion predicates derived from it.
//! - **`command`**: wire tokens and `Exchange`, one space-joined command line.
//! - **`actuator`**: one channel on a board: request queueing, pending count, latest telemetry.
//! - **`controller`**: `ServoController`, the per-board dispatcher task running the protocol
//!   state machine (configure, confirm, go, await motion, await finish, abort).
//! - **`transport`**: the `Transport` seam and a line transport over any async byte stream.
//! - **`valve`**: open/closed status inference and metering-valve position tracking.
//! - **`registry`**: `LineRegistry`, the arena of controllers, actuators and valves.
//! - **`sim`**: a simulated servo board and a scripted mock port for tests.
//! - **`config`** / **`logging`**: figment configuration and tracing setup.
//!
//! ## Example
//!
//! ```rust,ignore
//! use servo_line::prelude::*;
//!
//! let board = SimulatedBoard::new();
//! let mut line = LineRegistry::new();
//! let servo = line.spawn_controller("servo-a", board.link(), DispatchOptions::default());
//! let v1 = line.add_actuator(servo, "v1", 3, actions)?;
//! let inlet = line.add_valve(v1, "inlet", "open", "close", 1500)?;
//!
//! let valve = line.valve(inlet).unwrap();
//! valve.open()?;
//! valve.wait_idle().await;
//! assert_eq!(valve.status(), ValveStatus::Opened);
//! ```

/// Actuator actions and motion direction.
pub mod action;
/// Actuators, request outcomes and completion hooks.
pub mod actuator;
/// Wire tokens and command lines.
pub mod command;
/// Line configuration.
pub mod config;
/// Per-board dispatcher.
pub mod controller;
/// Error types.
pub mod error;
/// Tracing subscriber setup.
pub mod logging;
/// The line registry.
pub mod registry;
/// Simulated hardware for tests and dry runs.
pub mod sim;
/// Report parsing and actuator telemetry.
pub mod telemetry;
/// Serial transport.
pub mod transport;
/// Valve status and metering.
pub mod valve;

pub use error::{ServoError, ServoResult};

/// Commonly used types.
pub mod prelude {
    pub use crate::action::{ActuatorAction, Motion};
    pub use crate::actuator::{Actuator, ActuatorId, Completion, CompletionHook, Outcome};
    pub use crate::config::LineConfig;
    pub use crate::controller::{DispatchOptions, ProtocolState, ServoController};
    pub use crate::error::{ServoError, ServoResult};
    pub use crate::registry::{ControllerId, LineRegistry};
    pub use crate::sim::{ChannelProfile, Fault, SimulatedBoard};
    pub use crate::telemetry::ActuatorTelemetry;
    pub use crate::transport::{Link, LineTransport, Transport};
    pub use crate::valve::{MeteringConfig, Valve, ValveId, ValveKind, ValveStatus};
}
