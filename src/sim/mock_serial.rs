//! Scripted serial port for exchange-level tests.
//!
//! `MockServoPort` implements `AsyncRead` and `AsyncWrite` and is handed to
//! [`LineTransport::link`](crate::transport::LineTransport::link) in place of a real port.
//! The test keeps the `ServoHarness` and plays the board by hand: assert each exchange the
//! dispatcher writes, then answer with a report line (or stay silent).
//!
//! ```rust,ignore
//! let (port, mut harness) = mock_serial::new();
//! let link = LineTransport::link(Box::new(port));
//! let controller = ServoController::spawn("bench", link, DispatchOptions::default());
//!
//! harness.expect_exchange("c03 d2000 a0 b1 i0000 t000.00 r").await;
//! harness.respond("03 2000 0 00 10 0000 0000 000.00 000.00 24.00 00");
//! ```
//!
//! Use [`SimulatedBoard`](super::SimulatedBoard) when the test cares about motion rather than
//! the exact bytes.

#![allow(clippy::panic)]

use crate::command::LINE_ENDING;
use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

/// How long `expect_exchange` waits before failing the test.
const EXPECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Port side, given to the code under test.
#[derive(Debug)]
pub struct MockServoPort {
    writes_tx: UnboundedSender<Vec<u8>>,
    reads_rx: UnboundedReceiver<Vec<u8>>,
    read_buffer: VecDeque<u8>,
}

/// Board side, kept by the test.
#[derive(Debug)]
pub struct ServoHarness {
    writes_rx: UnboundedReceiver<Vec<u8>>,
    reads_tx: UnboundedSender<Vec<u8>>,
    write_buffer: Vec<u8>,
}

/// Create a connected port/harness pair.
pub fn new() -> (MockServoPort, ServoHarness) {
    let (writes_tx, writes_rx) = mpsc::unbounded_channel();
    let (reads_tx, reads_rx) = mpsc::unbounded_channel();

    (
        MockServoPort {
            writes_tx,
            reads_rx,
            read_buffer: VecDeque::new(),
        },
        ServoHarness {
            writes_rx,
            reads_tx,
            write_buffer: Vec::new(),
        },
    )
}

// =============================================================================
// MockServoPort
// =============================================================================

impl MockServoPort {
    fn fill(&mut self, buf: &mut ReadBuf<'_>) {
        let n = buf.remaining().min(self.read_buffer.len());
        let chunk: Vec<u8> = self.read_buffer.drain(..n).collect();
        buf.put_slice(&chunk);
    }
}

impl AsyncRead for MockServoPort {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.read_buffer.is_empty() {
            match self.reads_rx.poll_recv(cx) {
                Poll::Ready(Some(chunk)) => self.read_buffer.extend(chunk),
                // harness dropped: EOF
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }
        self.fill(buf);
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for MockServoPort {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.writes_tx.send(buf.to_vec()) {
            Ok(()) => Poll::Ready(Ok(buf.len())),
            Err(_) => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "servo harness disconnected",
            ))),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

// =============================================================================
// ServoHarness
// =============================================================================

impl ServoHarness {
    /// Send one report line; the line break is added here.
    ///
    /// # Panics
    /// Panics if the port side was dropped.
    pub fn respond(&self, report: &str) {
        let line = format!("{}\r\n", report);
        if self.reads_tx.send(line.into_bytes()).is_err() {
            panic!("servo port dropped before response '{}'", report);
        }
    }

    /// Wait for the next exchange and assert it equals `expected` (without terminator).
    ///
    /// # Panics
    /// Panics on mismatch, or when nothing arrives within two seconds.
    pub async fn expect_exchange(&mut self, expected: &str) {
        let actual = self.next_exchange(EXPECT_TIMEOUT).await.unwrap_or_else(|| {
            panic!(
                "timed out waiting for exchange '{}', buffered '{}'",
                expected,
                String::from_utf8_lossy(&self.write_buffer)
            )
        });
        assert_eq!(actual, expected, "unexpected exchange");
    }

    /// Expect an exchange, then answer it.
    pub async fn expect_and_respond(&mut self, expected: &str, report: &str) {
        self.expect_exchange(expected).await;
        self.respond(report);
    }

    /// Next complete exchange, or `None` if none arrives within `wait`.
    pub async fn next_exchange(&mut self, wait: Duration) -> Option<String> {
        let terminator = LINE_ENDING.as_bytes();
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            if let Some(end) = self
                .write_buffer
                .windows(terminator.len())
                .position(|w| w == terminator)
            {
                let line: Vec<u8> = self.write_buffer.drain(..end + terminator.len()).collect();
                return Some(String::from_utf8_lossy(&line[..end]).into_owned());
            }
            match tokio::time::timeout_at(deadline, self.writes_rx.recv()).await {
                Ok(Some(chunk)) => self.write_buffer.extend_from_slice(&chunk),
                Ok(None) | Err(_) => return None,
            }
        }
    }

    /// Assert nothing is written for `quiet`.
    ///
    /// # Panics
    /// Panics with the offending exchange if one arrives.
    pub async fn expect_silence(&mut self, quiet: Duration) {
        if let Some(line) = self.next_exchange(quiet).await {
            panic!("expected no traffic, got '{}'", line);
        }
    }
}
