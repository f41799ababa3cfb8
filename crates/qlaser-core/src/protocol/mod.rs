//! Serial Protocol Communication
//!
//! Implements the QLaser command protocol: ASCII decimal arguments terminated
//! by single command bytes, with decimal or comma-separated replies.
//!
//! Supports both the legacy per-block protocol and the unified protocol with
//! packed address/value frames and bulk reads.

pub mod allocator;
pub mod channel_errors;
pub mod commands;
mod error;
pub mod frame;
mod link;
pub mod profile;
pub mod pulse;
mod range;
pub mod serial;
mod session;

pub use allocator::{FirstEmptySlot, FixedSlot, SlotAllocation, SlotAllocator, SlotSource};
pub use channel_errors::{
    decode_channel_errors, decode_error_line, parse_error_masks, ChannelError, ChannelErrorReport,
    ErrorRegisters,
};
pub use commands::{Command, CommandTable};
pub use error::ProtocolError;
pub use frame::{FrameBuilder, RegisterWrite};
pub use link::{Link, LinkDescriptor, LinkOpener};
pub use profile::{FixedPointRounding, ProtocolProfile, ProtocolRevision};
pub use pulse::{decode_pulse_definition, encode_pulse_definition, EncodedDefinition, PulseConfig, WaveId};
pub use range::{RangeViolation, Strictness};
pub use serial::{find_port, list_ports, open_port, PortInfo, SerialLink, SerialOpener};
pub use session::{ChannelSelection, DefinitionWrite, Session, SessionState, TableWrite};

/// Default baud rate for the instrument UART
pub const DEFAULT_BAUD_RATE: u32 = 115200;

/// Default timeout for an expected response line in milliseconds
pub const DEFAULT_TIMEOUT_MS: u64 = 1000;

/// Default quiet period that ends a drain, in milliseconds
pub const DEFAULT_QUIET_MS: u64 = 100;
