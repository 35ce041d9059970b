//! Transport seam between the dispatcher and the serial link.
//!
//! Framing, checksums and reconnection belong to the link itself. The dispatcher only needs two
//! things: a way to send one command line, and a stream of response lines. Responses are
//! forwarded over an mpsc channel that the dispatcher alone consumes, so telemetry has exactly
//! one writer no matter which task the bytes arrive on.
//!
//! # Example
//!
//! ```rust,ignore
//! use servo_line::transport::{open_serial_async, LineTransport};
//!
//! let port = open_serial_async("/dev/ttyUSB0", 115200, "servo board").await?;
//! let link = LineTransport::link(Box::new(port));
//! let controller = ServoController::spawn("servo-a", link, DispatchOptions::default());
//! ```

use crate::command::LINE_ENDING;
use async_trait::async_trait;
use std::io;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, WriteHalf};
use tokio::sync::mpsc;

/// Trait alias for async byte streams usable as a servo link.
///
/// Implemented by `tokio_serial::SerialStream`, `tokio::io::DuplexStream` and the mock port.
pub trait SerialPortIO: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> SerialPortIO for T {}

/// Type-erased byte stream.
pub type DynSerial = Box<dyn SerialPortIO>;

/// Outgoing half of a link.
#[async_trait]
pub trait Transport: Send {
    /// Send one command line; the terminator is added by the transport.
    async fn send(&mut self, line: &str) -> io::Result<()>;
}

/// A transport plus the stream of response lines it produces.
pub struct Link {
    /// Outgoing half.
    pub transport: Box<dyn Transport>,
    /// Response lines, terminators stripped.
    pub responses: mpsc::UnboundedReceiver<String>,
}

/// Line-oriented transport over any async byte stream.
pub struct LineTransport {
    writer: WriteHalf<DynSerial>,
}

impl LineTransport {
    /// Split `port` and start forwarding its response lines.
    ///
    /// Must be called from within a Tokio runtime; the reader task ends when the port reaches
    /// EOF or the receiving side is dropped.
    pub fn link(port: DynSerial) -> Link {
        let (reader, writer) = tokio::io::split(port);
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(forward_lines(BufReader::new(reader), tx));

        Link {
            transport: Box::new(LineTransport { writer }),
            responses: rx,
        }
    }
}

#[async_trait]
impl Transport for LineTransport {
    async fn send(&mut self, line: &str) -> io::Result<()> {
        let framed = format!("{}{}", line, LINE_ENDING);
        self.writer.write_all(framed.as_bytes()).await?;
        self.writer.flush().await
    }
}

async fn forward_lines<R: AsyncBufRead + Unpin>(mut reader: R, tx: mpsc::UnboundedSender<String>) {
    let mut buf = Vec::with_capacity(64);
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => {
                tracing::debug!("Servo link reached EOF");
                break;
            }
            Ok(_) => {
                // Non-UTF8 noise becomes replacement chars and fails report parsing downstream
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end_matches(['\r', '\n']);
                if line.is_empty() {
                    continue;
                }
                tracing::trace!(response = %line, "Servo link received line");
                if tx.send(line.to_string()).is_err() {
                    break;
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Servo link read failed");
                break;
            }
        }
    }
}

/// Open a serial port asynchronously using spawn_blocking (8N1, no flow control).
#[cfg(feature = "instrument_serial")]
pub async fn open_serial_async(
    port_path: &str,
    baud_rate: u32,
    device_name: &str,
) -> anyhow::Result<tokio_serial::SerialStream> {
    use anyhow::Context;
    use tokio::task::spawn_blocking;
    use tokio_serial::SerialPortBuilderExt;

    let port_path_owned = port_path.to_string();
    let device_name_owned = device_name.to_string();

    spawn_blocking(move || {
        tokio_serial::new(&port_path_owned, baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .context(format!(
                "Failed to open {} serial port: {}",
                device_name_owned, port_path_owned
            ))
    })
    .await
    .context("spawn_blocking for serial port opening failed")?
}
