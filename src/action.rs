//! Actuator actions: the "how to move and when to consider motion bounded" request.
//!
//! An action is a plain value. Named actions are built once at assembly time and reused; the
//! metering layer clones a template and varies the drive signal for each relative sub-move.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Intended direction of an action relative to the valve it drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Motion {
    /// Drives the valve towards open.
    Opening,
    /// Drives the valve towards closed.
    Closing,
}

impl Motion {
    /// Direction of a signed step count (`0` has no direction).
    pub fn of_steps(steps: i32) -> Option<Self> {
        match steps {
            s if s > 0 => Some(Motion::Opening),
            s if s < 0 => Some(Motion::Closing),
            _ => None,
        }
    }
}

/// A configuration request for one actuator channel.
///
/// `limit0`/`limit1` enable the two limit switches, `current_limit` is in mA and `time_limit`
/// in seconds. A zero current or time limit disables that completion signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActuatorAction {
    /// Name the action is requested by.
    pub name: String,
    /// Servo drive signal; the neutral signal holds still.
    pub drive_signal: u16,
    /// Stop at the closed limit switch.
    #[serde(default)]
    pub limit0_enabled: bool,
    /// Stop at the open limit switch.
    #[serde(default)]
    pub limit1_enabled: bool,
    /// Current limit in mA; 0 disables.
    #[serde(default)]
    pub current_limit: u16,
    /// Time limit in seconds; 0 disables.
    #[serde(default)]
    pub time_limit: f64,
    /// Explicit direction; when absent, valves fall back to drive-signal inference.
    #[serde(default)]
    pub direction: Option<Motion>,
}

impl ActuatorAction {
    /// Largest drive signal the four-digit wire field can carry.
    pub const MAX_DRIVE_SIGNAL: u16 = 9999;
    /// Largest time limit the `NNN.NN` wire field can carry.
    pub const MAX_TIME_LIMIT: f64 = 999.99;

    /// Action with no limits enabled.
    pub fn new(name: impl Into<String>, drive_signal: u16) -> Self {
        Self {
            name: name.into(),
            drive_signal,
            limit0_enabled: false,
            limit1_enabled: false,
            current_limit: 0,
            time_limit: 0.0,
            direction: None,
        }
    }

    /// Enable or disable the closed (`limit0`) and open (`limit1`) switches.
    pub fn with_limits(mut self, limit0: bool, limit1: bool) -> Self {
        self.limit0_enabled = limit0;
        self.limit1_enabled = limit1;
        self
    }

    /// Stop when the motor current reaches `milliamps`.
    pub fn with_current_limit(mut self, milliamps: u16) -> Self {
        self.current_limit = milliamps;
        self
    }

    /// Stop after `seconds` of motion.
    pub fn with_time_limit(mut self, seconds: f64) -> Self {
        self.time_limit = seconds;
        self
    }

    /// Declare which way this action moves the valve.
    pub fn with_direction(mut self, direction: Motion) -> Self {
        self.direction = Some(direction);
        self
    }

    /// Derived action with a different drive signal, keeping every limit.
    pub fn with_drive_signal(&self, name: impl Into<String>, drive_signal: u16) -> Self {
        Self {
            name: name.into(),
            drive_signal,
            ..self.clone()
        }
    }

    /// Time limit as the device stores it (hundredths of a second).
    ///
    /// Comparing at wire resolution keeps `configured()` from failing on float noise.
    pub fn time_limit_centis(&self) -> u32 {
        centis(self.time_limit)
    }

    /// Check the fields fit their wire columns.
    pub fn validate(&self) -> Result<(), String> {
        if self.drive_signal > Self::MAX_DRIVE_SIGNAL {
            return Err(format!(
                "action '{}': drive_signal {} exceeds {}",
                self.name,
                self.drive_signal,
                Self::MAX_DRIVE_SIGNAL
            ));
        }
        if self.current_limit > 9999 {
            return Err(format!(
                "action '{}': current_limit {} exceeds 9999 mA",
                self.name, self.current_limit
            ));
        }
        if !(0.0..=Self::MAX_TIME_LIMIT).contains(&self.time_limit) {
            return Err(format!(
                "action '{}': time_limit {} outside 0-{} s",
                self.name,
                self.time_limit,
                Self::MAX_TIME_LIMIT
            ));
        }
        Ok(())
    }
}

impl fmt::Display for ActuatorAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (d{} l{}{} i{} t{:.2})",
            self.name,
            self.drive_signal,
            u8::from(self.limit0_enabled),
            u8::from(self.limit1_enabled),
            self.current_limit,
            self.time_limit
        )
    }
}

pub(crate) fn centis(seconds: f64) -> u32 {
    (seconds.max(0.0) * 100.0).round() as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derived_action_keeps_limits() {
        let base = ActuatorAction::new("move", 1500)
            .with_current_limit(400)
            .with_time_limit(1.5)
            .with_limits(true, false);
        let derived = base.with_drive_signal("move +10", 1510);

        assert_eq!(derived.drive_signal, 1510);
        assert_eq!(derived.name, "move +10");
        assert_eq!(derived.current_limit, 400);
        assert!(derived.limit0_enabled);
        assert_eq!(derived.time_limit_centis(), 150);
        // the template is untouched
        assert_eq!(base.drive_signal, 1500);
    }

    #[test]
    fn test_validate_rejects_out_of_column_values() {
        assert!(ActuatorAction::new("ok", 9999).validate().is_ok());
        assert!(ActuatorAction::new("wide", 10_000).validate().is_err());
        assert!(ActuatorAction::new("slow", 1500)
            .with_time_limit(1000.0)
            .validate()
            .is_err());
    }

    #[test]
    fn test_action_deserializes_with_defaults() {
        let action: ActuatorAction = toml::from_str(
            r#"
            name = "open"
            drive_signal = 2000
            limit1_enabled = true
            direction = "opening"
            "#,
        )
        .unwrap();

        assert_eq!(action.drive_signal, 2000);
        assert!(!action.limit0_enabled);
        assert!(action.limit1_enabled);
        assert_eq!(action.current_limit, 0);
        assert_eq!(action.direction, Some(Motion::Opening));
    }

    #[test]
    fn test_motion_of_steps() {
        assert_eq!(Motion::of_steps(5), Some(Motion::Opening));
        assert_eq!(Motion::of_steps(-1), Some(Motion::Closing));
        assert_eq!(Motion::of_steps(0), None);
    }
}
