//! Byte-stream link transports.
//!
//! The link worker is written against [`LinkTransport`]: blocking,
//! line-oriented I/O with a bounded read timeout. Production uses a serial
//! port (8-N-1, path and baud from config); tests drive the worker with the
//! in-memory transport behind the `test-helpers` feature.

use std::fmt;
use std::io::{Read, Write};
use std::time::Duration;

/// Bound on a single blocking read; also paces the worker tick.
pub const READ_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug)]
pub enum LinkError {
    Io(std::io::Error),
    Open(String),
}

impl fmt::Display for LinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkError::Io(e) => write!(f, "link I/O error: {}", e),
            LinkError::Open(s) => write!(f, "link open failed: {}", s),
        }
    }
}

impl std::error::Error for LinkError {}

impl From<std::io::Error> for LinkError {
    fn from(e: std::io::Error) -> Self {
        LinkError::Io(e)
    }
}

/// One byte-stream link. A read timeout is not an error, just an empty tick.
pub trait LinkTransport: Send {
    /// Read one line, stripped of its terminator. `Ok(None)` when no full
    /// line arrived within the timeout.
    fn read_line(&mut self) -> Result<Option<String>, LinkError>;

    /// Write one line followed by CR-LF.
    fn write_line(&mut self, line: &str) -> Result<(), LinkError>;
}

// ---------------------------------------------------------------------------
// Serial transport
// ---------------------------------------------------------------------------

/// Serial link to a gateway (8-N-1).
pub struct SerialLink {
    port: Box<dyn serialport::SerialPort>,
    pending: Vec<u8>,
}

impl SerialLink {
    pub fn open(path: &str, baud: u32) -> Result<Self, LinkError> {
        let port = serialport::new(path, baud)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .timeout(READ_TIMEOUT)
            .open()
            .map_err(|e| LinkError::Open(format!("{}: {}", path, e)))?;
        tracing::info!(path, baud, "serial link open");
        Ok(SerialLink {
            port,
            pending: Vec::new(),
        })
    }

    fn take_line(&mut self) -> Option<String> {
        let pos = self.pending.iter().position(|b| *b == b'\n')?;
        let line: Vec<u8> = self.pending.drain(..=pos).collect();
        Some(latin1(&line))
    }
}

impl LinkTransport for SerialLink {
    fn read_line(&mut self) -> Result<Option<String>, LinkError> {
        if let Some(line) = self.take_line() {
            return Ok(Some(line));
        }
        let mut buf = [0u8; 256];
        match self.port.read(&mut buf) {
            Ok(0) => Ok(None),
            Ok(n) => {
                self.pending.extend_from_slice(&buf[..n]);
                Ok(self.take_line())
            }
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(None),
            Err(e) => Err(LinkError::Io(e)),
        }
    }

    fn write_line(&mut self, line: &str) -> Result<(), LinkError> {
        self.port.write_all(line.as_bytes())?;
        self.port.write_all(b"\r\n")?;
        self.port.flush()?;
        Ok(())
    }
}

/// Latin-1 decode: every byte is a code point. Gateways occasionally emit
/// non-ASCII garbage mid-line; tolerating it beats dropping the frame.
fn latin1(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| char::from_u32(u32::from(*b)).unwrap_or('\u{fffd}'))
        .collect()
}

// ---------------------------------------------------------------------------
// In-memory transport (tests)
// ---------------------------------------------------------------------------

#[cfg(any(test, feature = "test-helpers"))]
pub use memory::{MemoryHandle, MemoryLink};

#[cfg(any(test, feature = "test-helpers"))]
mod memory {
    use super::{LinkError, LinkTransport};
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct MemoryState {
        incoming: VecDeque<String>,
        sent: Vec<String>,
        fail_writes: bool,
    }

    /// In-memory link transport for worker tests.
    pub struct MemoryLink {
        state: Arc<Mutex<MemoryState>>,
    }

    /// Test-side handle to the same buffers.
    #[derive(Clone)]
    pub struct MemoryHandle {
        state: Arc<Mutex<MemoryState>>,
    }

    impl MemoryLink {
        pub fn new() -> (MemoryLink, MemoryHandle) {
            let state = Arc::new(Mutex::new(MemoryState::default()));
            (
                MemoryLink {
                    state: state.clone(),
                },
                MemoryHandle { state },
            )
        }
    }

    impl LinkTransport for MemoryLink {
        fn read_line(&mut self) -> Result<Option<String>, LinkError> {
            Ok(self.state.lock().expect("memory link lock").incoming.pop_front())
        }

        fn write_line(&mut self, line: &str) -> Result<(), LinkError> {
            let mut state = self.state.lock().expect("memory link lock");
            if state.fail_writes {
                return Err(LinkError::Io(std::io::Error::other("injected write failure")));
            }
            state.sent.push(line.to_owned());
            Ok(())
        }
    }

    impl MemoryHandle {
        pub fn push_incoming(&self, line: &str) {
            self.state
                .lock()
                .expect("memory link lock")
                .incoming
                .push_back(line.to_owned());
        }

        pub fn take_sent(&self) -> Vec<String> {
            std::mem::take(&mut self.state.lock().expect("memory link lock").sent)
        }

        pub fn set_fail_writes(&self, fail: bool) {
            self.state.lock().expect("memory link lock").fail_writes = fail;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latin1_passes_ascii_through() {
        assert_eq!(latin1(b"G>S:GTIME\r\n"), "G>S:GTIME\r\n");
    }

    #[test]
    fn latin1_maps_high_bytes_to_code_points() {
        assert_eq!(latin1(&[0x47, 0xE9, 0x0A]), "G\u{e9}\n");
    }

    #[test]
    fn memory_link_round_trips() {
        let (mut link, handle) = MemoryLink::new();
        handle.push_incoming("G>S:GTIME");
        assert_eq!(link.read_line().expect("read"), Some("G>S:GTIME".to_owned()));
        assert_eq!(link.read_line().expect("read"), None);
        link.write_line("S>G:STIME;1").expect("write");
        assert_eq!(handle.take_sent(), vec!["S>G:STIME;1".to_owned()]);
    }
}
