//! Frame Builder
//!
//! Builds the byte frames sent to the instrument and parses its replies.
//!
//! Every frame is one or more ASCII decimal integers, each terminated by a
//! raw command byte:
//! - legacy write : `<value>` SET_DATA, `<address>` block byte
//! - unified write: `<(address & 0xFFFF) << 32 | value>` block byte
//! - read         : `<address>` read byte (a bulk read first stages the count
//!                  with SET_DATA)
//!
//! Replies are newline-terminated decimal integers or comma-separated lists.

use super::commands::{Command, CommandTable};
use super::profile::{ProtocolProfile, ProtocolRevision};
use super::ProtocolError;

/// A single register write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterWrite {
    /// Register address within the selected block
    pub address: u32,
    /// 32-bit register value
    pub value: u32,
    /// Block-select commit command
    pub block: Command,
}

impl RegisterWrite {
    pub fn new(address: u32, value: u32, block: Command) -> Self {
        Self {
            address,
            value,
            block,
        }
    }
}

/// Build frames for one protocol revision
#[derive(Debug, Clone)]
pub struct FrameBuilder {
    revision: ProtocolRevision,
    commands: CommandTable,
}

impl FrameBuilder {
    pub fn new(profile: &ProtocolProfile) -> Self {
        Self {
            revision: profile.revision,
            commands: profile.commands.clone(),
        }
    }

    /// Encode a register write (stage then commit)
    pub fn encode_write(&self, write: &RegisterWrite) -> Vec<u8> {
        let mut frame = Vec::with_capacity(24);
        match self.revision {
            ProtocolRevision::Legacy => {
                self.push_number(&mut frame, write.value as u64, Command::SetData);
                self.push_number(&mut frame, write.address as u64, write.block);
            }
            ProtocolRevision::Unified => {
                let packed = ((write.address as u64 & 0xFFFF) << 32) | write.value as u64;
                self.push_number(&mut frame, packed, write.block);
            }
        }
        frame
    }

    /// Encode a read of `count` consecutive words starting at `address`.
    /// A count of one is a plain read; larger counts stage the count first.
    /// A packed count would be indistinguishable from a plain read of address 0.
    pub fn encode_read(&self, block: Command, address: u32, count: u32) -> Vec<u8> {
        let mut frame = Vec::with_capacity(16);
        if count > 1 {
            self.push_number(&mut frame, count as u64, Command::SetData);
        }
        self.push_number(&mut frame, address as u64, block);
        frame
    }

    /// Encode a command with a decimal argument, e.g. `12c`
    pub fn encode_argument(&self, cmd: Command, argument: u64) -> Vec<u8> {
        let mut frame = Vec::with_capacity(12);
        self.push_number(&mut frame, argument, cmd);
        frame
    }

    /// Encode a bare command byte
    pub fn encode_command(&self, cmd: Command) -> Vec<u8> {
        vec![self.commands.byte(cmd)]
    }

    fn push_number(&self, frame: &mut Vec<u8>, number: u64, cmd: Command) {
        frame.extend_from_slice(number.to_string().as_bytes());
        frame.push(self.commands.byte(cmd));
    }
}

/// Parse a reply line holding a single decimal integer
pub fn parse_value(line: &str) -> Result<u64, ProtocolError> {
    let text = line.trim();
    text.parse::<u64>()
        .map_err(|_| ProtocolError::InvalidResponse(format!("expected decimal integer, got '{}'", text)))
}

/// Parse a reply line holding a comma-separated list of decimal integers
pub fn parse_value_list(line: &str) -> Result<Vec<u64>, ProtocolError> {
    line.trim()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(parse_value)
        .collect()
}

/// Parse a misc register reply. The firmware also uses this register for
/// debug prints of the form `<message>: 0x<value>`.
pub fn parse_misc_value(line: &str) -> Result<u32, ProtocolError> {
    let text = line.trim();
    if let Some((_, hex)) = text.rsplit_once("0x") {
        let digits: String = hex.chars().take_while(|c| c.is_ascii_hexdigit()).collect();
        return u32::from_str_radix(&digits, 16)
            .map_err(|_| ProtocolError::InvalidResponse(format!("bad hex value in '{}'", text)));
    }
    let value = parse_value(text)?;
    u32::try_from(value).map_err(|_| {
        ProtocolError::InvalidResponse(format!("misc value {} exceeds 32 bits", value))
    })
}
