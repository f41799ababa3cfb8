//! Protocol commands
//!
//! Defines the single-byte commands understood by the pulse sequencer
//! firmware. The byte values are a firmware contract and live in a
//! [`CommandTable`] carried by the protocol profile.

use serde::{Deserialize, Serialize};

/// Commands understood by the instrument
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Command {
    /// Query firmware version banner
    VersionQuery,
    /// Dump all registers as text
    RegisterDump,
    /// Enable/disable command echo (`0e` turns it off)
    Echo,
    /// Soft reset of the pulse sequencer
    Reset,
    /// Select the channel subsequent writes apply to
    ChannelSelect,
    /// Enable pulse channels
    ChannelEnable,
    /// Set the total sequence length
    SequenceLength,
    /// Start the loaded pulse sequence
    Trigger,
    /// Stage a 32-bit value for the next commit
    SetData,
    /// Commit staged value into a pulse definition register
    PulseDefinitionWrite,
    /// Read pulse definition register(s)
    PulseDefinitionRead,
    /// Commit staged value into waveform RAM
    WaveRamWrite,
    /// Read waveform RAM word(s)
    WaveRamRead,
    /// Commit staged value into a DC channel
    DcWrite,
    /// Read the general purpose (misc) register
    MiscRead,
    /// Write the general purpose (misc) register
    MiscWrite,
    /// Query per-channel error masks
    ChannelErrorQuery,
}

impl Command {
    /// Check if this command produces response lines
    pub fn expects_response(&self) -> bool {
        matches!(
            self,
            Command::VersionQuery
                | Command::RegisterDump
                | Command::PulseDefinitionRead
                | Command::WaveRamRead
                | Command::MiscRead
                | Command::ChannelErrorQuery
        )
    }

    /// Check if this is a commit byte that applies the staged value
    pub fn is_commit(&self) -> bool {
        matches!(
            self,
            Command::PulseDefinitionWrite | Command::WaveRamWrite | Command::DcWrite
        )
    }
}

/// Byte values for every [`Command`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandTable {
    pub version_query: u8,
    pub register_dump: u8,
    pub echo: u8,
    pub reset: u8,
    pub channel_select: u8,
    pub channel_enable: u8,
    pub sequence_length: u8,
    pub trigger: u8,
    pub set_data: u8,
    pub pulse_definition_write: u8,
    pub pulse_definition_read: u8,
    pub wave_ram_write: u8,
    pub wave_ram_read: u8,
    pub dc_write: u8,
    pub misc_read: u8,
    pub misc_write: u8,
    pub channel_error_query: u8,
}

impl Default for CommandTable {
    fn default() -> Self {
        Self {
            version_query: b'V',
            register_dump: b'P',
            echo: b'e',
            reset: 0x52,
            channel_select: b'c',
            channel_enable: b'C',
            sequence_length: b's',
            trigger: 0x80,
            set_data: 0xDD,
            pulse_definition_write: 0x8A,
            pulse_definition_read: 0xAA,
            wave_ram_write: 0x9A,
            wave_ram_read: 0xBA,
            dc_write: 0x8D,
            misc_read: b'r',
            misc_write: b'o',
            channel_error_query: b'E',
        }
    }
}

impl CommandTable {
    /// Get the wire byte for a command
    pub fn byte(&self, cmd: Command) -> u8 {
        match cmd {
            Command::VersionQuery => self.version_query,
            Command::RegisterDump => self.register_dump,
            Command::Echo => self.echo,
            Command::Reset => self.reset,
            Command::ChannelSelect => self.channel_select,
            Command::ChannelEnable => self.channel_enable,
            Command::SequenceLength => self.sequence_length,
            Command::Trigger => self.trigger,
            Command::SetData => self.set_data,
            Command::PulseDefinitionWrite => self.pulse_definition_write,
            Command::PulseDefinitionRead => self.pulse_definition_read,
            Command::WaveRamWrite => self.wave_ram_write,
            Command::WaveRamRead => self.wave_ram_read,
            Command::DcWrite => self.dc_write,
            Command::MiscRead => self.misc_read,
            Command::MiscWrite => self.misc_write,
            Command::ChannelErrorQuery => self.channel_error_query,
        }
    }

    /// Reverse lookup, used by the simulator to interpret incoming bytes
    pub fn command_for(&self, byte: u8) -> Option<Command> {
        ALL_COMMANDS.iter().copied().find(|&cmd| self.byte(cmd) == byte)
    }
}

const ALL_COMMANDS: [Command; 17] = [
    Command::VersionQuery,
    Command::RegisterDump,
    Command::Echo,
    Command::Reset,
    Command::ChannelSelect,
    Command::ChannelEnable,
    Command::SequenceLength,
    Command::Trigger,
    Command::SetData,
    Command::PulseDefinitionWrite,
    Command::PulseDefinitionRead,
    Command::WaveRamWrite,
    Command::WaveRamRead,
    Command::DcWrite,
    Command::MiscRead,
    Command::MiscWrite,
    Command::ChannelErrorQuery,
];
