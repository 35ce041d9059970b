//! Hardware-free servo boards: a physics simulation and a hand-scripted mock port.

mod board;
/// Scripted serial port for protocol-level tests.
pub mod mock_serial;

pub use board::{ChannelProfile, Fault, SimulatedBoard, EXCHANGE_HISTORY};
