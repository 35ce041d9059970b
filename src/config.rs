//! Line configuration using Figment.
//!
//! Configuration is loaded from:
//! 1. a TOML file (base configuration)
//! 2. environment variables prefixed with `SERVO_LINE_`, `__` separating nested keys
//!
//! # Example
//! ```no_run
//! use servo_line::config::LineConfig;
//!
//! let config = LineConfig::load_from("line.toml")?;
//! println!("Line: {}", config.application.name);
//! # Ok::<(), servo_line::ServoError>(())
//! ```
//!
//! ```toml
//! [application]
//! name = "extraction line"
//! log_level = "info"
//!
//! [dispatch]
//! response_timeout_ms = 200
//! max_confirm_attempts = 25
//!
//! [[controllers]]
//! name = "servo-a"
//! port = "/dev/ttyUSB0"
//!
//! [[actuators]]
//! name = "v_ip"
//! controller = "servo-a"
//! channel = 3
//!
//! [[actuators.actions]]
//! name = "open"
//! drive_signal = 2000
//! limit1_enabled = true
//! time_limit = 8.0
//!
//! [[actuators.actions]]
//! name = "close"
//! drive_signal = 1000
//! limit0_enabled = true
//! time_limit = 8.0
//!
//! [[valves]]
//! name = "ion pump"
//! actuator = "v_ip"
//! open_action = "open"
//! close_action = "close"
//! ```

use crate::action::ActuatorAction;
use crate::controller::{DispatchOptions, CHANNEL_COUNT};
use crate::error::{ServoError, ServoResult};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

/// Top-level line configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LineConfig {
    /// Application name and log level
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Timeouts and retry budget for every dispatcher
    #[serde(default)]
    pub dispatch: DispatchConfig,
    /// Servo boards on the line
    #[serde(default)]
    pub controllers: Vec<ControllerConfig>,
    /// Channels and their named actions
    #[serde(default)]
    pub actuators: Vec<ActuatorConfig>,
    /// Valves and the actuators that drive them
    #[serde(default)]
    pub valves: Vec<ValveConfig>,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name (appears in logs)
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "servo_line".to_string(),
            log_level: "info".to_string(),
        }
    }
}

/// Dispatcher tuning shared by every controller
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Wait per exchange before the command is considered lost
    #[serde(default = "default_response_timeout")]
    pub response_timeout_ms: u64,
    /// Configuration resends before giving up (0 = never give up)
    #[serde(default = "default_max_confirm_attempts")]
    pub max_confirm_attempts: u32,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            response_timeout_ms: default_response_timeout(),
            max_confirm_attempts: default_max_confirm_attempts(),
        }
    }
}

impl DispatchConfig {
    /// Dispatcher options with the timeout as a `Duration`.
    pub fn options(&self) -> DispatchOptions {
        DispatchOptions {
            response_timeout: Duration::from_millis(self.response_timeout_ms),
            max_confirm_attempts: (self.max_confirm_attempts > 0)
                .then_some(self.max_confirm_attempts),
        }
    }
}

/// One servo board on a serial port
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Unique controller name
    pub name: String,
    /// Serial port path (e.g., "/dev/ttyUSB0")
    pub port: String,
    /// Serial baud rate
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
}

/// One actuator channel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActuatorConfig {
    /// Unique actuator name
    pub name: String,
    /// Name of the owning controller
    pub controller: String,
    /// Channel on the controller (0-63)
    pub channel: u8,
    /// Named actions available to valves
    #[serde(default)]
    pub actions: Vec<ActuatorAction>,
}

/// One valve
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValveConfig {
    /// Unique valve name
    pub name: String,
    /// Name of the driving actuator
    pub actuator: String,
    /// Name of the actuator action that opens the valve
    pub open_action: String,
    /// Name of the actuator action that closes the valve
    pub close_action: String,
    /// Drive signal at rest, used to infer direction
    #[serde(default = "default_neutral_signal")]
    pub neutral_signal: u16,
    /// Present for metering valves
    #[serde(default)]
    pub metering: Option<MeteringDefinition>,
}

/// Metering parameters as written in the file; `move_action` names an actuator action
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeteringDefinition {
    /// Step count of the fully open position
    pub open_position: i32,
    /// Largest single sub-move, in steps
    pub max_increment: i32,
    /// Drive-signal offset from neutral per step of a sub-move
    pub signal_per_step: i32,
    /// Actuator action used as the template for sub-moves
    pub move_action: String,
}

// Default value functions
fn default_response_timeout() -> u64 {
    200
}

fn default_max_confirm_attempts() -> u32 {
    25
}

fn default_baud_rate() -> u32 {
    115_200
}

fn default_neutral_signal() -> u16 {
    1500
}

impl LineConfig {
    /// Load configuration from a TOML file and `SERVO_LINE_` environment variables
    ///
    /// Example: `SERVO_LINE_DISPATCH__RESPONSE_TIMEOUT_MS=500`
    pub fn load_from<P: AsRef<Path>>(path: P) -> ServoResult<Self> {
        Ok(Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("SERVO_LINE_").split("__"))
            .extract()?)
    }

    /// Load and validate in one step.
    pub fn load_validated<P: AsRef<Path>>(path: P) -> ServoResult<Self> {
        let config = Self::load_from(path)?;
        config.validate().map_err(ServoError::Configuration)?;
        Ok(config)
    }

    /// Validate configuration after loading
    ///
    /// Channel conflicts are left to registration, which logs and refuses them.
    pub fn validate(&self) -> Result<(), String> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            ));
        }

        if self.dispatch.response_timeout_ms == 0 {
            return Err("dispatch.response_timeout_ms must be greater than 0".to_string());
        }

        unique("controller", self.controllers.iter().map(|c| &c.name))?;
        unique("actuator", self.actuators.iter().map(|a| &a.name))?;
        unique("valve", self.valves.iter().map(|v| &v.name))?;

        for actuator in &self.actuators {
            if usize::from(actuator.channel) >= CHANNEL_COUNT {
                return Err(format!(
                    "Actuator '{}': channel {} out of range 0-{}",
                    actuator.name,
                    actuator.channel,
                    CHANNEL_COUNT - 1
                ));
            }
            if !self.controllers.iter().any(|c| c.name == actuator.controller) {
                return Err(format!(
                    "Actuator '{}' references unknown controller '{}'",
                    actuator.name, actuator.controller
                ));
            }
            unique(
                &format!("action on actuator '{}'", actuator.name),
                actuator.actions.iter().map(|a| &a.name),
            )?;
            for action in &actuator.actions {
                action.validate()?;
            }
        }

        for valve in &self.valves {
            let actuator = self
                .actuators
                .iter()
                .find(|a| a.name == valve.actuator)
                .ok_or_else(|| {
                    format!(
                        "Valve '{}' references unknown actuator '{}'",
                        valve.name, valve.actuator
                    )
                })?;
            let has_action = |name: &str| actuator.actions.iter().any(|a| a.name == name);

            for action in [&valve.open_action, &valve.close_action] {
                if !has_action(action) {
                    return Err(format!(
                        "Valve '{}': actuator '{}' has no action '{}'",
                        valve.name, actuator.name, action
                    ));
                }
            }

            if let Some(metering) = &valve.metering {
                if metering.open_position <= 0
                    || metering.max_increment <= 0
                    || metering.signal_per_step <= 0
                {
                    return Err(format!(
                        "Valve '{}': metering open_position, max_increment and signal_per_step must be positive",
                        valve.name
                    ));
                }
                if !has_action(&metering.move_action) {
                    return Err(format!(
                        "Valve '{}': actuator '{}' has no action '{}'",
                        valve.name, actuator.name, metering.move_action
                    ));
                }
            }
        }

        Ok(())
    }
}

fn unique<'a>(kind: &str, names: impl Iterator<Item = &'a String>) -> Result<(), String> {
    let mut seen = HashSet::new();
    for name in names {
        if !seen.insert(name) {
            return Err(format!("Duplicate {} name: {}", kind, name));
        }
    }
    Ok(())
}
