//! Servo-board command tokens and their serialization.
//!
//! One exchange is a space-joined run of tokens terminated by `\r`. The dispatcher always ends
//! an exchange with [`ServoCommand::Report`] so the board answers with exactly one report line.

use crate::action::ActuatorAction;
use std::fmt;

/// Line terminator for outgoing exchanges.
pub const LINE_ENDING: &str = "\r";

/// One token of an outgoing command line.
#[derive(Debug, Clone, PartialEq)]
pub enum ServoCommand {
    /// Select the channel subsequent tokens apply to
    ///
    /// Command: `cNN`
    SelectChannel(u8),
    /// Command: `dNNNN`
    DriveSignal(u16),
    /// Command: `a<0|1>`
    Limit0Enable(bool),
    /// Command: `b<0|1>`
    Limit1Enable(bool),
    /// Current limit in mA, 0 disables
    ///
    /// Command: `iNNNN`
    CurrentLimit(u16),
    /// Time limit in seconds, 0 disables
    ///
    /// Command: `tNNN.NN`
    TimeLimit(f64),
    /// Enable drive pulses on the selected channel
    ///
    /// Command: `g`
    Go,
    /// Disable drive pulses on the selected channel
    ///
    /// Command: `s`
    Stop,
    /// Send one report line for the selected channel
    ///
    /// Command: `r`
    Report,
}

impl fmt::Display for ServoCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServoCommand::SelectChannel(channel) => write!(f, "c{:02}", channel),
            ServoCommand::DriveSignal(signal) => write!(f, "d{:04}", signal),
            ServoCommand::Limit0Enable(on) => write!(f, "a{}", u8::from(*on)),
            ServoCommand::Limit1Enable(on) => write!(f, "b{}", u8::from(*on)),
            ServoCommand::CurrentLimit(ma) => write!(f, "i{:04}", ma),
            ServoCommand::TimeLimit(seconds) => write!(f, "t{:06.2}", seconds),
            ServoCommand::Go => write!(f, "g"),
            ServoCommand::Stop => write!(f, "s"),
            ServoCommand::Report => write!(f, "r"),
        }
    }
}

/// Parse error for a single token; only the simulated board reads commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownToken(pub String);

impl std::str::FromStr for ServoCommand {
    type Err = UnknownToken;

    fn from_str(token: &str) -> Result<Self, Self::Err> {
        let unknown = || UnknownToken(token.to_string());
        let mut chars = token.chars();
        let head = chars.next().ok_or_else(unknown)?;
        let tail = chars.as_str();
        let bit = |s: &str| match s {
            "0" => Ok(false),
            "1" => Ok(true),
            _ => Err(unknown()),
        };

        match (head, tail) {
            ('c', n) => n.parse().map(ServoCommand::SelectChannel).map_err(|_| unknown()),
            ('d', n) => n.parse().map(ServoCommand::DriveSignal).map_err(|_| unknown()),
            ('a', n) => bit(n).map(ServoCommand::Limit0Enable),
            ('b', n) => bit(n).map(ServoCommand::Limit1Enable),
            ('i', n) => n.parse().map(ServoCommand::CurrentLimit).map_err(|_| unknown()),
            ('t', n) => n.parse().map(ServoCommand::TimeLimit).map_err(|_| unknown()),
            ('g', "") => Ok(ServoCommand::Go),
            ('s', "") => Ok(ServoCommand::Stop),
            ('r', "") => Ok(ServoCommand::Report),
            _ => Err(unknown()),
        }
    }
}

/// One outgoing line: a channel select followed by commands, ending in a report request.
#[derive(Debug, Clone, PartialEq)]
pub struct Exchange {
    commands: Vec<ServoCommand>,
}

impl Exchange {
    fn on_channel(channel: u8, body: impl IntoIterator<Item = ServoCommand>) -> Self {
        let mut commands = vec![ServoCommand::SelectChannel(channel)];
        commands.extend(body);
        commands.push(ServoCommand::Report);
        Self { commands }
    }

    /// Send every configurable field of `action`.
    pub fn configure(channel: u8, action: &ActuatorAction) -> Self {
        Self::on_channel(
            channel,
            [
                ServoCommand::DriveSignal(action.drive_signal),
                ServoCommand::Limit0Enable(action.limit0_enabled),
                ServoCommand::Limit1Enable(action.limit1_enabled),
                ServoCommand::CurrentLimit(action.current_limit),
                ServoCommand::TimeLimit(action.time_limit),
            ],
        )
    }

    /// Start motion with the configuration already on the channel.
    pub fn go(channel: u8) -> Self {
        Self::on_channel(channel, [ServoCommand::Go])
    }

    /// Cut the drive pulses.
    pub fn stop(channel: u8) -> Self {
        Self::on_channel(channel, [ServoCommand::Stop])
    }

    /// Select the channel and ask for a report, nothing else.
    pub fn poll(channel: u8) -> Self {
        Self::on_channel(channel, [])
    }

    /// Tokens in send order.
    pub fn commands(&self) -> &[ServoCommand] {
        &self.commands
    }
}

impl fmt::Display for Exchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, command) in self.commands.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{}", command)?;
        }
        Ok(())
    }
}
