//! Simulated servo board.
//!
//! Speaks the real wire protocol over an in-memory duplex stream, so the whole stack from
//! [`LineTransport`](crate::transport::LineTransport) up runs unchanged against it.
//!
//! Each channel drives a rate actuator: while pulses are enabled its position moves by
//! `(drive_signal - neutral) * gain` units per second, between the closed stop at 0 (limit 0)
//! and the open stop at `travel` (limit 1). Simulated time advances by one tick each time the
//! channel is selected, i.e. once per exchange. Pulses drop when an enabled limit switch is hit
//! in the direction of travel, when current reaches the current limit, or when the time limit
//! expires. Driving against a stop draws stall current.
//!
//! Faults are injected per exchange and counted down:
//!
//! ```rust,ignore
//! let board = SimulatedBoard::new();
//! board.add_channel(3, ChannelProfile::default());
//! board.inject(Fault::DropResponses(2));
//! let link = board.link();
//! ```

use crate::command::ServoCommand;
use crate::telemetry::Report;
use crate::transport::{DynSerial, Link, LineTransport};
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};

/// Number of exchanges a board remembers for inspection.
pub const EXCHANGE_HISTORY: usize = 1024;

/// Physical behaviour of one simulated channel.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelProfile {
    /// Drive signal at which the actuator does not move.
    pub neutral_signal: u16,
    /// Units per second per drive-signal unit above neutral.
    pub open_gain: f64,
    /// Units per second per drive-signal unit below neutral.
    pub close_gain: f64,
    /// Distance between the two stops.
    pub travel: f64,
    /// Current drawn while moving freely, mA.
    pub running_current: u16,
    /// Current drawn while driving against a stop, mA.
    pub stall_current: u16,
    /// Supply voltage reported, V.
    pub voltage: f64,
}

impl Default for ChannelProfile {
    fn default() -> Self {
        Self {
            neutral_signal: 1500,
            open_gain: 0.01,
            close_gain: 0.01,
            travel: 20.0,
            running_current: 120,
            stall_current: 800,
            voltage: 24.0,
        }
    }
}

/// Misbehaviour to inject, each applying to the next `n` exchanges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Execute the exchange but send no response.
    DropResponses(u32),
    /// Ignore configuration tokens (drive signal, limits), still answering.
    IgnoreConfiguration(u32),
    /// Answer with a truncated report.
    GarbleReports(u32),
}

#[derive(Debug, Default)]
struct FaultCounters {
    drop_responses: u32,
    ignore_configuration: u32,
    garble_reports: u32,
}

fn take(counter: &mut u32) -> bool {
    if *counter > 0 {
        *counter -= 1;
        true
    } else {
        false
    }
}

#[derive(Debug, Clone)]
struct Channel {
    profile: ChannelProfile,
    position: f64,
    drive_signal: u16,
    limit0_enabled: bool,
    limit1_enabled: bool,
    current_limit: u16,
    /// Hundredths of a second, as on the wire.
    time_limit: u32,
    elapsed: u32,
    pulses: bool,
    current: u16,
}

impl Channel {
    fn new(profile: ChannelProfile) -> Self {
        Self {
            drive_signal: profile.neutral_signal,
            profile,
            position: 0.0,
            limit0_enabled: false,
            limit1_enabled: false,
            current_limit: 0,
            time_limit: 0,
            elapsed: 0,
            pulses: false,
            current: 0,
        }
    }

    fn at_closed_stop(&self) -> bool {
        self.position <= 0.0
    }

    fn at_open_stop(&self) -> bool {
        self.position >= self.profile.travel
    }

    /// Signed velocity in units per second.
    fn velocity(&self) -> f64 {
        let offset = f64::from(self.drive_signal) - f64::from(self.profile.neutral_signal);
        if offset >= 0.0 {
            offset * self.profile.open_gain
        } else {
            offset * self.profile.close_gain
        }
    }

    /// An enabled limit switch blocks the current direction of travel.
    fn limit_blocks(&self) -> bool {
        let v = self.velocity();
        (v > 0.0 && self.limit1_enabled && self.at_open_stop())
            || (v < 0.0 && self.limit0_enabled && self.at_closed_stop())
    }

    fn go(&mut self) {
        if self.pulses {
            return;
        }
        self.elapsed = 0;
        self.current = 0;
        self.pulses = !self.limit_blocks();
    }

    fn stop(&mut self) {
        self.pulses = false;
        self.current = 0;
    }

    fn advance(&mut self, tick_centis: u32) {
        if !self.pulses {
            return;
        }

        let v = self.velocity();
        self.elapsed += tick_centis;
        self.position =
            (self.position + v * f64::from(tick_centis) / 100.0).clamp(0.0, self.profile.travel);

        let stalled = (v > 0.0 && self.at_open_stop()) || (v < 0.0 && self.at_closed_stop());
        self.current = if stalled {
            self.profile.stall_current
        } else if v == 0.0 {
            0
        } else {
            self.profile.running_current
        };

        // the last current reading stays latched after a trip
        let current_trip = self.current_limit > 0 && self.current >= self.current_limit;
        let time_trip = self.time_limit > 0 && self.elapsed >= self.time_limit;
        if self.limit_blocks() || current_trip || time_trip {
            self.pulses = false;
        }
    }

    fn report(&self, channel: u8) -> Report {
        Report {
            channel,
            drive_signal: self.drive_signal,
            pulses_enabled: self.pulses,
            limit0_enabled: self.limit0_enabled,
            limit0_engaged: self.at_closed_stop(),
            limit1_enabled: self.limit1_enabled,
            limit1_engaged: self.at_open_stop(),
            current_limit: self.current_limit,
            current: self.current,
            time_limit: f64::from(self.time_limit) / 100.0,
            elapsed: f64::from(self.elapsed) / 100.0,
            voltage: self.profile.voltage,
            error_bits: 0,
        }
    }
}

#[derive(Debug)]
struct BoardState {
    channels: BTreeMap<u8, Channel>,
    selected: u8,
    tick_centis: u32,
    faults: FaultCounters,
    /// Most recent exchanges, oldest first.
    exchanges: VecDeque<String>,
}

impl BoardState {
    fn channel(&mut self, channel: u8) -> &mut Channel {
        self.channels
            .entry(channel)
            .or_insert_with(|| Channel::new(ChannelProfile::default()))
    }

    /// Execute one exchange; returns the response line, if any.
    fn handle(&mut self, line: &str) -> Option<String> {
        if self.exchanges.len() == EXCHANGE_HISTORY {
            self.exchanges.pop_front();
        }
        self.exchanges.push_back(line.to_string());

        let ignore_config = take(&mut self.faults.ignore_configuration);
        let mut report = false;
        for token in line.split_whitespace() {
            let command = match token.parse::<ServoCommand>() {
                Ok(command) => command,
                Err(_) => {
                    tracing::warn!(%token, "Simulated board ignoring unknown token");
                    continue;
                }
            };

            let tick = self.tick_centis;
            match command {
                ServoCommand::SelectChannel(channel) => {
                    self.selected = channel;
                    self.channel(channel).advance(tick);
                }
                ServoCommand::Go => {
                    let selected = self.selected;
                    self.channel(selected).go();
                }
                ServoCommand::Stop => {
                    let selected = self.selected;
                    self.channel(selected).stop();
                }
                ServoCommand::Report => report = true,
                _ if ignore_config => {}
                ServoCommand::DriveSignal(signal) => {
                    let selected = self.selected;
                    self.channel(selected).drive_signal = signal;
                }
                ServoCommand::Limit0Enable(on) => {
                    let selected = self.selected;
                    self.channel(selected).limit0_enabled = on;
                }
                ServoCommand::Limit1Enable(on) => {
                    let selected = self.selected;
                    self.channel(selected).limit1_enabled = on;
                }
                ServoCommand::CurrentLimit(ma) => {
                    let selected = self.selected;
                    self.channel(selected).current_limit = ma;
                }
                ServoCommand::TimeLimit(seconds) => {
                    let selected = self.selected;
                    self.channel(selected).time_limit = crate::action::centis(seconds);
                }
            }
        }

        if !report || take(&mut self.faults.drop_responses) {
            return None;
        }
        let selected = self.selected;
        let mut response = self.channel(selected).report(selected).to_string();
        if take(&mut self.faults.garble_reports) {
            response.truncate(response.len() / 2);
        }
        response.push_str("\r\n");
        Some(response)
    }
}

/// Handle to a simulated board. Cheap to clone; all clones share one board.
#[derive(Debug, Clone)]
pub struct SimulatedBoard {
    state: Arc<Mutex<BoardState>>,
}

impl Default for SimulatedBoard {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedBoard {
    /// Seconds of simulated time per exchange.
    pub const DEFAULT_TICK: f64 = 0.1;

    /// A board with default channels and no faults.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(BoardState {
                channels: BTreeMap::new(),
                selected: 0,
                tick_centis: crate::action::centis(Self::DEFAULT_TICK),
                faults: FaultCounters::default(),
                exchanges: VecDeque::with_capacity(EXCHANGE_HISTORY),
            })),
        }
    }

    /// Give `channel` a specific profile; unknown channels use the default one.
    pub fn add_channel(&self, channel: u8, profile: ChannelProfile) {
        self.state
            .lock()
            .channels
            .insert(channel, Channel::new(profile));
    }

    /// Change the simulated time per exchange.
    pub fn set_tick(&self, seconds: f64) {
        self.state.lock().tick_centis = crate::action::centis(seconds).max(1);
    }

    /// Place the actuator on `channel` at `position`, clamped to its travel.
    pub fn set_position(&self, channel: u8, position: f64) {
        let mut state = self.state.lock();
        let channel = state.channel(channel);
        channel.position = position.clamp(0.0, channel.profile.travel);
    }

    /// Position of `channel`, if it has been addressed.
    pub fn position(&self, channel: u8) -> Option<f64> {
        self.state.lock().channels.get(&channel).map(|c| c.position)
    }

    /// Queue a fault; counts add up.
    pub fn inject(&self, fault: Fault) {
        let mut state = self.state.lock();
        match fault {
            Fault::DropResponses(n) => state.faults.drop_responses += n,
            Fault::IgnoreConfiguration(n) => state.faults.ignore_configuration += n,
            Fault::GarbleReports(n) => state.faults.garble_reports += n,
        }
    }

    /// The most recent exchanges (at most [`EXCHANGE_HISTORY`]), oldest first, without
    /// terminators.
    pub fn exchanges(&self) -> Vec<String> {
        self.state.lock().exchanges.iter().cloned().collect()
    }

    /// Execute one exchange directly, bypassing any stream.
    pub fn handle(&self, line: &str) -> Option<String> {
        self.state.lock().handle(line)
    }

    /// Open a byte stream to the board. Must be called within a Tokio runtime.
    pub fn connect(&self) -> DynSerial {
        let (host, device) = tokio::io::duplex(4096);
        tokio::spawn(serve(self.clone(), device));
        Box::new(host)
    }

    /// Convenience: a ready [`Link`] to the board.
    pub fn link(&self) -> Link {
        LineTransport::link(self.connect())
    }
}

async fn serve(board: SimulatedBoard, stream: DuplexStream) {
    let (reader, mut writer) = tokio::io::split(stream);
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::with_capacity(64);

    loop {
        buf.clear();
        match reader.read_until(b'\r', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let Some(response) = board.handle(line) else {
                    continue;
                };
                if let Err(e) = writer.write_all(response.as_bytes()).await {
                    tracing::debug!(error = %e, "Simulated board lost its host");
                    break;
                }
            }
            Err(e) => {
                tracing::debug!(error = %e, "Simulated board read failed");
                break;
            }
        }
    }
}
