//! Byte-stream link to the instrument
//!
//! The session never touches a serial port directly; it talks to a [`Link`]
//! obtained from a [`LinkOpener`].

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{ProtocolError, DEFAULT_BAUD_RATE, DEFAULT_QUIET_MS, DEFAULT_TIMEOUT_MS};

/// Where and how to open the link
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkDescriptor {
    /// Serial port name (e.g., "/dev/ttyUSB1" or "COM4")
    pub port_name: String,
    /// Baud rate
    pub baud_rate: u32,
    /// Time to wait for an expected response line, in milliseconds
    pub timeout_ms: u64,
    /// Quiet period that ends a "read everything available" drain
    pub quiet_ms: u64,
}

impl Default for LinkDescriptor {
    fn default() -> Self {
        Self {
            port_name: String::new(),
            baud_rate: DEFAULT_BAUD_RATE,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            quiet_ms: DEFAULT_QUIET_MS,
        }
    }
}

impl LinkDescriptor {
    pub fn new(port_name: impl Into<String>) -> Self {
        Self {
            port_name: port_name.into(),
            ..Self::default()
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn quiet(&self) -> Duration {
        Duration::from_millis(self.quiet_ms)
    }
}

/// In-order byte transport with line-oriented reads
pub trait Link: Send {
    /// Write all bytes
    fn send(&mut self, bytes: &[u8]) -> Result<(), ProtocolError>;

    /// Read one line without its terminator. `None` when nothing arrived
    /// within `timeout`.
    fn read_line(&mut self, timeout: Duration) -> Result<Option<String>, ProtocolError>;

    /// Read every line that arrives until the link goes quiet
    fn read_all_available(&mut self) -> Result<Vec<String>, ProtocolError>;
}

/// Opens links from descriptors
pub trait LinkOpener {
    fn open(&self, descriptor: &LinkDescriptor) -> Result<Box<dyn Link>, ProtocolError>;
}

/// Split complete lines off the front of `pending`
pub(crate) fn take_line(pending: &mut Vec<u8>) -> Option<String> {
    let pos = pending.iter().position(|&b| b == b'\n')?;
    let line: Vec<u8> = pending.drain(..=pos).collect();
    Some(
        String::from_utf8_lossy(&line)
            .trim_end_matches(['\r', '\n'])
            .to_string(),
    )
}

/// Whatever is left in `pending` once the link is quiet; blank leftovers
/// such as a stray `\r` are discarded
pub(crate) fn take_fragment(pending: &mut Vec<u8>) -> Option<String> {
    let rest: Vec<u8> = pending.drain(..).collect();
    let line = String::from_utf8_lossy(&rest).trim().to_string();
    if line.is_empty() {
        None
    } else {
        Some(line)
    }
}
