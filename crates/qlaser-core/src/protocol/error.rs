//! Protocol errors

use thiserror::Error;

/// Errors that can occur while talking to the instrument
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Serial port error: {0}")]
    SerialError(String),

    #[error("Response timeout")]
    Timeout,

    #[error("Not connected to instrument")]
    NotConnected,

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Already connected")]
    AlreadyConnected,

    #[error("No response to version query: no device on the link")]
    NoDevice,

    #[error("Firmware version mismatch: expected tokens {expected:?}, got '{received}'")]
    VersionMismatch {
        expected: Vec<String>,
        received: String,
    },

    #[error("Invalid channel {channel}: must be below {limit}")]
    InvalidChannel { channel: u32, limit: u32 },

    #[error("Invalid address: {field} = {value} exceeds {limit}")]
    InvalidAddress {
        field: &'static str,
        value: u64,
        limit: u64,
    },

    #[error("Alignment error: {field} = {value} must be even")]
    AlignmentError { field: &'static str, value: u32 },

    #[error("Out of range: {field} = {value} exceeds {bound}")]
    OutOfRange {
        field: String,
        value: i64,
        bound: i64,
    },

    #[error("Device reported error: {0}")]
    DeviceError(String),

    #[error("Invalid response from instrument: {0}")]
    InvalidResponse(String),

    #[error("Wave store error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl ProtocolError {
    /// Transport failures leave the session disconnected
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            ProtocolError::SerialError(_) | ProtocolError::Timeout | ProtocolError::IoError(_)
        )
    }
}
