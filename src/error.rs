//! Error types for the servo line.
//!
//! `ServoError` covers everything a caller of this crate can see: configuration and assembly
//! problems (channel conflicts, dangling names), requests against actuators that were never
//! bound to a controller, and I/O failures while opening transports.
//!
//! Protocol trouble on the wire (lost responses, malformed reports, a device that never
//! confirms) deliberately does *not* surface here. The dispatcher absorbs it, keeps resending,
//! and reports the end result as an [`Outcome`](crate::actuator::Outcome). Callers see it as an
//! actuator that stays busy or finishes without completion evidence.

use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type ServoResult<T> = std::result::Result<T, ServoError>;

/// Primary error type for the servo line.
#[derive(Error, Debug)]
pub enum ServoError {
    /// Two actuators claim the same channel of one controller.
    ///
    /// The second registration is refused; the channel keeps its original owner.
    #[error("Channel {channel} on controller '{controller}' is already bound to '{existing}', refusing '{requested}'")]
    ChannelConflict {
        controller: String,
        channel: u8,
        existing: String,
        requested: String,
    },

    /// Channel number outside the 64-entry channel table.
    #[error("Channel {0} is out of range (0-63)")]
    ChannelOutOfRange(u8),

    /// The actuator already belongs to a different controller.
    #[error("Actuator '{actuator}' is already bound to controller '{controller}'")]
    AlreadyBound { actuator: String, controller: String },

    /// The actuator was never registered with a controller.
    #[error("Actuator '{0}' is not bound to a controller")]
    Unbound(String),

    /// No action with this name is configured for the actuator.
    #[error("Actuator '{actuator}' has no action named '{action}'")]
    UnknownAction { actuator: String, action: String },

    /// Assembly-time lookup of a controller, actuator or valve failed.
    #[error("Unknown {kind} '{name}'")]
    UnknownName { kind: &'static str, name: String },

    /// The operation needs a metering valve.
    #[error("Valve '{valve}' does not support {operation}")]
    Unsupported {
        valve: String,
        operation: &'static str,
    },

    /// The dispatcher task has exited and no longer accepts work.
    #[error("Controller '{0}' is no longer running")]
    ControllerStopped(String),

    /// Semantic configuration error (values parse but make no sense).
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Configuration file or environment could not be loaded.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// I/O failure on a transport.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<figment::Error> for ServoError {
    fn from(err: figment::Error) -> Self {
        ServoError::Config(Box::new(err))
    }
}

/// Why a report line was rejected.
///
/// Parse failures never modify the previously accepted telemetry.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReportParseError {
    /// The line ends before the last column.
    #[error("report too short: {len} bytes, need {needed}")]
    TooShort { len: usize, needed: usize },

    /// A column does not hold a value of its type.
    #[error("field '{field}' is not valid: '{raw}'")]
    InvalidField { field: &'static str, raw: String },

    /// The report answers a different channel.
    #[error("report for channel {got} while servicing channel {expected}")]
    WrongChannel { expected: u8, got: u8 },
}
