//! Actuator telemetry: the fixed-column status report and the predicates derived from it.
//!
//! Report layout (48 ASCII bytes, then a line break):
//!
//! ```text
//! 0         1         2         3         4
//! 012345678901234567890123456789012345678901234567
//! 03 1500 1 10 01 0250 0012 010.00 003.20 24.01 00
//! |  |    | || || |    |    |      |      |     +- error bits (hex)
//! |  |    | || || |    |    |      |      +------- supply voltage, V
//! |  |    | || || |    |    |      +-------------- elapsed, s
//! |  |    | || || |    |    +--------------------- time limit, s
//! |  |    | || || |    +-------------------------- measured current, mA
//! |  |    | || || +------------------------------- current limit, mA
//! |  |    | || |+--------------------------------- limit 1 engaged
//! |  |    | || +---------------------------------- limit 1 enabled
//! |  |    | |+------------------------------------ limit 0 engaged
//! |  |    | +------------------------------------- limit 0 enabled
//! |  |    +--------------------------------------- drive pulses enabled
//! |  +-------------------------------------------- drive signal
//! +----------------------------------------------- channel
//! ```

use crate::action::{centis, ActuatorAction};
use crate::error::ReportParseError;
use std::fmt;

/// Length of a report line without its terminator.
pub const REPORT_LEN: usize = 48;

#[derive(Clone, Copy)]
struct Column {
    name: &'static str,
    start: usize,
    end: usize,
}

const fn col(name: &'static str, start: usize, end: usize) -> Column {
    Column { name, start, end }
}

const CHANNEL: Column = col("channel", 0, 2);
const DRIVE_SIGNAL: Column = col("drive_signal", 3, 7);
const PULSES: Column = col("pulses", 8, 9);
const LIMIT0_ENABLED: Column = col("limit0_enabled", 10, 11);
const LIMIT0_ENGAGED: Column = col("limit0_engaged", 11, 12);
const LIMIT1_ENABLED: Column = col("limit1_enabled", 13, 14);
const LIMIT1_ENGAGED: Column = col("limit1_engaged", 14, 15);
const CURRENT_LIMIT: Column = col("current_limit", 16, 20);
const CURRENT: Column = col("current", 21, 25);
const TIME_LIMIT: Column = col("time_limit", 26, 32);
const ELAPSED: Column = col("elapsed", 33, 39);
const VOLTAGE: Column = col("voltage", 40, 45);
const ERROR_BITS: Column = col("error_bits", 46, 48);

/// One parsed report line.
///
/// This is the wire form; [`ActuatorTelemetry`] is the accepted snapshot an actuator keeps.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Report {
    /// Channel the report describes.
    pub channel: u8,
    /// Configured drive signal.
    pub drive_signal: u16,
    /// Drive pulses are being generated.
    pub pulses_enabled: bool,
    /// Closed limit switch enabled.
    pub limit0_enabled: bool,
    /// Closed limit switch reached.
    pub limit0_engaged: bool,
    /// Open limit switch enabled.
    pub limit1_enabled: bool,
    /// Open limit switch reached.
    pub limit1_engaged: bool,
    /// Configured current limit, mA.
    pub current_limit: u16,
    /// Measured motor current, mA.
    pub current: u16,
    /// Configured time limit, s.
    pub time_limit: f64,
    /// Time since the last run command, s.
    pub elapsed: f64,
    /// Supply voltage, V.
    pub voltage: f64,
    /// Board error flags.
    pub error_bits: u8,
}

impl Report {
    /// Parse a report line by byte offset. Trailing `\r`/`\n` are ignored.
    pub fn parse(line: &str) -> Result<Self, ReportParseError> {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.len() < REPORT_LEN || !line.is_ascii() {
            return Err(ReportParseError::TooShort {
                len: line.len(),
                needed: REPORT_LEN,
            });
        }

        Ok(Self {
            channel: number(line, CHANNEL)?,
            drive_signal: number(line, DRIVE_SIGNAL)?,
            pulses_enabled: flag(line, PULSES)?,
            limit0_enabled: flag(line, LIMIT0_ENABLED)?,
            limit0_engaged: flag(line, LIMIT0_ENGAGED)?,
            limit1_enabled: flag(line, LIMIT1_ENABLED)?,
            limit1_engaged: flag(line, LIMIT1_ENGAGED)?,
            current_limit: number(line, CURRENT_LIMIT)?,
            current: number(line, CURRENT)?,
            time_limit: number(line, TIME_LIMIT)?,
            elapsed: number(line, ELAPSED)?,
            voltage: number(line, VOLTAGE)?,
            error_bits: hex(line, ERROR_BITS)?,
        })
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02} {:04} {} {}{} {}{} {:04} {:04} {:06.2} {:06.2} {:05.2} {:02X}",
            self.channel.min(99),
            self.drive_signal.min(9999),
            u8::from(self.pulses_enabled),
            u8::from(self.limit0_enabled),
            u8::from(self.limit0_engaged),
            u8::from(self.limit1_enabled),
            u8::from(self.limit1_engaged),
            self.current_limit.min(9999),
            self.current.min(9999),
            self.time_limit.clamp(0.0, 999.99),
            self.elapsed.clamp(0.0, 999.99),
            self.voltage.clamp(0.0, 99.99),
            self.error_bits
        )
    }
}

fn raw(line: &str, column: Column) -> &str {
    // length was checked against REPORT_LEN and every column ends within it
    &line[column.start..column.end]
}

fn invalid(line: &str, column: Column) -> ReportParseError {
    ReportParseError::InvalidField {
        field: column.name,
        raw: raw(line, column).to_string(),
    }
}

fn number<T: std::str::FromStr>(line: &str, column: Column) -> Result<T, ReportParseError> {
    raw(line, column)
        .trim()
        .parse()
        .map_err(|_| invalid(line, column))
}

fn flag(line: &str, column: Column) -> Result<bool, ReportParseError> {
    match raw(line, column) {
        "0" => Ok(false),
        "1" => Ok(true),
        _ => Err(invalid(line, column)),
    }
}

fn hex(line: &str, column: Column) -> Result<u8, ReportParseError> {
    u8::from_str_radix(raw(line, column), 16).map_err(|_| invalid(line, column))
}

/// Latest accepted telemetry for one actuator.
///
/// Only the dispatcher writes this, and only while the actuator is being serviced. A rejected
/// report clears `valid` and leaves every other field as it was.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ActuatorTelemetry {
    /// Channel the report describes.
    pub channel: u8,
    /// Configured drive signal.
    pub drive_signal: u16,
    /// Drive pulses are being generated.
    pub pulses_enabled: bool,
    /// Closed limit switch enabled.
    pub limit0_enabled: bool,
    /// Closed limit switch reached.
    pub limit0_engaged: bool,
    /// Open limit switch enabled.
    pub limit1_enabled: bool,
    /// Open limit switch reached.
    pub limit1_engaged: bool,
    /// Configured current limit, mA.
    pub current_limit: u16,
    /// Measured motor current, mA.
    pub current: u16,
    /// Configured time limit, s.
    pub time_limit: f64,
    /// Time since the last run command, s.
    pub elapsed: f64,
    /// Supply voltage, V.
    pub voltage: f64,
    /// Board error flags.
    pub error_bits: u8,
    /// Number of reports accepted so far. Never decreases.
    pub report_count: u64,
    /// The most recent report was accepted.
    pub valid: bool,
}

impl ActuatorTelemetry {
    /// Apply a raw report line received while servicing `expected_channel`.
    pub fn apply(&mut self, line: &str, expected_channel: u8) -> Result<(), ReportParseError> {
        let parsed = Report::parse(line).and_then(|report| {
            if report.channel == expected_channel {
                Ok(report)
            } else {
                Err(ReportParseError::WrongChannel {
                    expected: expected_channel,
                    got: report.channel,
                })
            }
        });

        match parsed {
            Ok(report) => {
                self.accept(report);
                Ok(())
            }
            Err(err) => {
                self.valid = false;
                Err(err)
            }
        }
    }

    fn accept(&mut self, report: Report) {
        self.channel = report.channel;
        self.drive_signal = report.drive_signal;
        self.pulses_enabled = report.pulses_enabled;
        self.limit0_enabled = report.limit0_enabled;
        self.limit0_engaged = report.limit0_engaged;
        self.limit1_enabled = report.limit1_enabled;
        self.limit1_engaged = report.limit1_engaged;
        self.current_limit = report.current_limit;
        self.current = report.current;
        self.time_limit = report.time_limit;
        self.elapsed = report.elapsed;
        self.voltage = report.voltage;
        self.error_bits = report.error_bits;
        self.report_count += 1;
        self.valid = true;
    }

    /// Drive pulses are enabled.
    pub fn in_motion(&self) -> bool {
        self.valid && self.pulses_enabled
    }

    /// Drive pulses are disabled.
    ///
    /// Use this rather than `!in_motion()`, which is also true when telemetry is invalid.
    pub fn stopped(&self) -> bool {
        self.valid && !self.pulses_enabled
    }

    /// An enabled limit switch is engaged, in either direction.
    pub fn position_detected(&self) -> bool {
        self.valid
            && ((self.limit0_enabled && self.limit0_engaged)
                || (self.limit1_enabled && self.limit1_engaged))
    }

    /// The motor current reached the configured limit.
    pub fn current_limit_detected(&self) -> bool {
        self.valid && self.current_limit > 0 && self.current >= self.current_limit
    }

    /// The run lasted its configured time limit.
    pub fn time_limit_detected(&self) -> bool {
        let limit = centis(self.time_limit);
        self.valid && limit > 0 && centis(self.elapsed) >= limit
    }

    /// Motion in the engaged direction is physically blocked.
    ///
    /// Same test as [`position_detected`](Self::position_detected); the dispatcher uses it to
    /// recognise that a run command was accepted even though no pulses followed.
    pub fn motion_inhibited(&self) -> bool {
        self.position_detected()
    }

    /// The device holds exactly the configuration `action` asks for.
    pub fn matches(&self, action: &ActuatorAction) -> bool {
        self.valid
            && self.drive_signal == action.drive_signal
            && self.limit0_enabled == action.limit0_enabled
            && self.limit1_enabled == action.limit1_enabled
            && self.current_limit == action.current_limit
            && centis(self.time_limit) == action.time_limit_centis()
    }

    /// Any of the three completion signals.
    pub fn completion_detected(&self) -> bool {
        self.position_detected() || self.current_limit_detected() || self.time_limit_detected()
    }
}
