//! Simulated Instrument
//!
//! An in-process pulse sequencer that speaks the serial protocol, for tests and
//! offline runs without hardware. It interprets the same frames the session
//! sends and keeps per-channel pulse definition and waveform memory.
//!
//! [`SimulatedInstrument`] is a cheap handle: clones share one instrument, so a
//! test can keep a handle while the session owns the link.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::protocol::{Command, Link, LinkDescriptor, LinkOpener, ProtocolError, ProtocolProfile, ProtocolRevision};

/// Simulated pulse sequencer
#[derive(Clone)]
pub struct SimulatedInstrument {
    state: Arc<Mutex<InstrumentState>>,
}

struct InstrumentState {
    profile: ProtocolProfile,
    /// Lines sent in reply to the version query
    banner: Vec<String>,
    echo: bool,
    /// Decimal digits received since the last command byte
    digits: String,
    /// Value staged by SET_DATA
    staged: Option<u64>,
    selected: u32,
    enabled: u64,
    sequence_length: u64,
    triggers: u32,
    resets: u32,
    /// Per channel: pulse definition registers, indexed by register address
    definitions: Vec<Vec<u32>>,
    /// Per channel: waveform RAM words, two samples each
    wave_words: Vec<Vec<u32>>,
    dc: Vec<u32>,
    misc: VecDeque<String>,
    misc_value: u32,
    error_line: String,
    /// Lines queued ahead of the next reply
    injected: VecDeque<String>,
    output: VecDeque<String>,
    sent: Vec<u8>,
    fail_io: bool,
    opens: u32,
}

impl InstrumentState {
    fn new(profile: ProtocolProfile) -> Self {
        let channels = profile.max_channels as usize;
        let definition_words =
            profile.slot_register_address(profile.pulse_slots, 0) as usize;
        let wave_words = (profile.wave_capacity / 2) as usize;
        let banner = vec![format!("{} v2.1", profile.version_tokens.join(" "))];
        Self {
            banner,
            echo: true,
            digits: String::new(),
            staged: None,
            selected: 0,
            enabled: 0,
            sequence_length: 0,
            triggers: 0,
            resets: 0,
            definitions: vec![vec![0; definition_words]; channels],
            wave_words: vec![vec![0; wave_words]; channels],
            dc: vec![0; profile.dc_channels as usize],
            misc: VecDeque::new(),
            misc_value: 0,
            error_line: String::new(),
            injected: VecDeque::new(),
            output: VecDeque::new(),
            sent: Vec::new(),
            fail_io: false,
            opens: 0,
            profile,
        }
    }

    fn receive(&mut self, bytes: &[u8]) {
        self.sent.extend_from_slice(bytes);
        for &byte in bytes {
            if byte.is_ascii_digit() {
                self.digits.push(byte as char);
                continue;
            }
            let digits = std::mem::take(&mut self.digits);
            let argument = digits.parse::<u64>().ok();
            if self.echo {
                self.output
                    .push_back(format!("{}{}", digits, String::from_utf8_lossy(&[byte])));
            }
            match self.profile.commands.command_for(byte) {
                Some(cmd) => self.execute(cmd, argument),
                None => self.reply(format!("ERROR: unknown command 0x{:02X}", byte)),
            }
        }
    }

    fn reply(&mut self, line: String) {
        while let Some(injected) = self.injected.pop_front() {
            self.output.push_back(injected);
        }
        self.output.push_back(line);
    }

    fn execute(&mut self, cmd: Command, argument: Option<u64>) {
        match cmd {
            Command::VersionQuery => {
                for line in self.banner.clone() {
                    self.reply(line);
                }
            }
            Command::RegisterDump => {
                self.reply(format!("selected: {}", self.selected));
                self.reply(format!("enabled: 0x{:08x}", self.enabled));
                self.reply(format!("sequence_length: {}", self.sequence_length));
            }
            Command::Echo => self.echo = argument.unwrap_or(0) != 0,
            Command::Reset => {
                self.resets += 1;
                self.selected = 0;
                self.enabled = 0;
                self.sequence_length = 0;
                self.staged = None;
                for channel in &mut self.definitions {
                    channel.fill(0);
                }
            }
            Command::ChannelSelect => self.selected = argument.unwrap_or(0) as u32,
            // A bare enable re-arms the channels with the current mask
            Command::ChannelEnable => {
                if let Some(mask) = argument {
                    self.enabled = mask;
                }
            }
            Command::SequenceLength => self.sequence_length = argument.unwrap_or(0),
            Command::Trigger => self.triggers += 1,
            Command::SetData => self.staged = argument,
            Command::PulseDefinitionWrite | Command::WaveRamWrite | Command::DcWrite => {
                self.commit(cmd, argument.unwrap_or(0))
            }
            Command::PulseDefinitionRead | Command::WaveRamRead => {
                let count = self.staged.take().unwrap_or(1).max(1) as usize;
                self.read(cmd, argument.unwrap_or(0) as usize, count);
            }
            Command::MiscRead => {
                let line = self
                    .misc
                    .pop_front()
                    .unwrap_or_else(|| self.misc_value.to_string());
                self.reply(line);
            }
            Command::MiscWrite => self.misc_value = argument.unwrap_or(0) as u32,
            Command::ChannelErrorQuery => {
                let line = self.error_line.clone();
                self.reply(line);
            }
        }
    }

    fn commit(&mut self, cmd: Command, argument: u64) {
        let (address, value) = match self.profile.revision {
            ProtocolRevision::Unified => ((argument >> 32) as usize & 0xFFFF, argument as u32),
            ProtocolRevision::Legacy => match self.staged.take() {
                Some(value) => (argument as usize, value as u32),
                None => {
                    self.reply("ERROR: commit without staged value".to_string());
                    return;
                }
            },
        };

        if cmd == Command::DcWrite {
            match self.dc.get_mut(address) {
                Some(slot) => *slot = value,
                None => self.reply(format!("ERROR: dc channel {}", address)),
            }
            return;
        }

        let channels = self.target_channels();
        let memory = if cmd == Command::WaveRamWrite {
            &mut self.wave_words
        } else {
            &mut self.definitions
        };
        let mut out_of_range = false;
        for channel in channels {
            match memory.get_mut(channel).and_then(|words| words.get_mut(address)) {
                Some(word) => *word = value,
                None => out_of_range = true,
            }
        }
        if out_of_range {
            self.reply(format!("ERROR: address {}", address));
        }
    }

    fn read(&mut self, cmd: Command, address: usize, count: usize) {
        let channel = self.selected.min(self.profile.max_channels.saturating_sub(1)) as usize;
        let memory = if cmd == Command::WaveRamRead {
            &self.wave_words[channel]
        } else {
            &self.definitions[channel]
        };
        match memory.get(address..address + count) {
            Some(words) => {
                let line = words
                    .iter()
                    .map(u32::to_string)
                    .collect::<Vec<_>>()
                    .join(",");
                self.reply(line);
            }
            None => self.reply(format!("ERROR: address {}", address)),
        }
    }

    fn target_channels(&self) -> Vec<usize> {
        if self.selected == self.profile.all_channels_selector {
            (0..self.profile.max_channels as usize).collect()
        } else {
            vec![self.selected as usize]
        }
    }
}

impl SimulatedInstrument {
    /// Instrument answering with the profile's version tokens
    pub fn new(profile: ProtocolProfile) -> Self {
        Self {
            state: Arc::new(Mutex::new(InstrumentState::new(profile))),
        }
    }

    fn lock(&self) -> MutexGuard<'_, InstrumentState> {
        // A panicking test thread must not hide the instrument from the others
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Replace the version banner; an empty banner simulates a silent port
    pub fn set_banner(&self, lines: &[&str]) {
        self.lock().banner = lines.iter().map(|s| s.to_string()).collect();
    }

    /// Reply line for the channel error query, e.g. `overrun:0x1,underrun:0`
    pub fn set_error_line(&self, line: &str) {
        self.lock().error_line = line.to_string();
    }

    /// Queue a line in front of the next reply
    pub fn inject_line(&self, line: &str) {
        self.lock().injected.push_back(line.to_string());
    }

    /// Put an unsolicited line on the link right away, like a status print
    pub fn emit_line(&self, line: &str) {
        self.lock().output.push_back(line.to_string());
    }

    /// Queue replies for the next misc reads
    pub fn push_misc_reply(&self, line: &str) {
        self.lock().misc.push_back(line.to_string());
    }

    /// Make every send and read fail with an I/O error
    pub fn fail_io(&self, fail: bool) {
        self.lock().fail_io = fail;
    }

    /// Every byte received since the last [`clear_sent`](Self::clear_sent)
    pub fn sent(&self) -> Vec<u8> {
        self.lock().sent.clone()
    }

    pub fn clear_sent(&self) {
        self.lock().sent.clear();
    }

    pub fn echo_enabled(&self) -> bool {
        self.lock().echo
    }

    pub fn selected(&self) -> u32 {
        self.lock().selected
    }

    pub fn enabled_mask(&self) -> u64 {
        self.lock().enabled
    }

    pub fn sequence_length(&self) -> u64 {
        self.lock().sequence_length
    }

    pub fn trigger_count(&self) -> u32 {
        self.lock().triggers
    }

    pub fn reset_count(&self) -> u32 {
        self.lock().resets
    }

    pub fn open_count(&self) -> u32 {
        self.lock().opens
    }

    pub fn misc_value(&self) -> u32 {
        self.lock().misc_value
    }

    pub fn dc_code(&self, channel: usize) -> Option<u32> {
        self.lock().dc.get(channel).copied()
    }

    /// The four registers of `slot` on `channel`
    pub fn definition_registers(&self, channel: usize, slot: u16) -> [u32; 4] {
        let state = self.lock();
        let mut raw = [0u32; 4];
        if let Some(words) = state.definitions.get(channel) {
            for (i, reg) in raw.iter_mut().enumerate() {
                let address = state.profile.slot_register_address(slot, i as u32) as usize;
                *reg = words.get(address).copied().unwrap_or(0);
            }
        }
        raw
    }

    /// Unpacked samples of `channel` starting at an even address
    pub fn wave_samples(&self, channel: usize, start: usize, length: usize) -> Vec<u32> {
        let state = self.lock();
        let bits = state.profile.addr_bits;
        let low_mask = ((1u64 << bits) - 1) as u32;
        let Some(words) = state.wave_words.get(channel) else {
            return Vec::new();
        };
        words
            .iter()
            .skip(start / 2)
            .flat_map(|&w| [w & low_mask, (w >> bits) & low_mask])
            .take(length)
            .collect()
    }
}

impl LinkOpener for SimulatedInstrument {
    fn open(&self, descriptor: &LinkDescriptor) -> Result<Box<dyn Link>, ProtocolError> {
        let mut state = self.lock();
        if state.fail_io {
            return Err(ProtocolError::ConnectionFailed(format!(
                "simulated open failure on {}",
                descriptor.port_name
            )));
        }
        state.opens += 1;
        state.output.clear();
        drop(state);
        Ok(Box::new(SimulatedLink {
            instrument: self.clone(),
        }))
    }
}

/// Link end held by the session
pub struct SimulatedLink {
    instrument: SimulatedInstrument,
}

impl SimulatedLink {
    fn io_error() -> ProtocolError {
        ProtocolError::IoError(std::io::Error::new(
            std::io::ErrorKind::BrokenPipe,
            "simulated link failure",
        ))
    }
}

impl Link for SimulatedLink {
    fn send(&mut self, bytes: &[u8]) -> Result<(), ProtocolError> {
        let mut state = self.instrument.lock();
        if state.fail_io {
            return Err(Self::io_error());
        }
        state.receive(bytes);
        Ok(())
    }

    /// Replies are produced synchronously, so an empty queue is a timeout
    fn read_line(&mut self, _timeout: Duration) -> Result<Option<String>, ProtocolError> {
        let mut state = self.instrument.lock();
        if state.fail_io {
            return Err(Self::io_error());
        }
        Ok(state.output.pop_front())
    }

    fn read_all_available(&mut self) -> Result<Vec<String>, ProtocolError> {
        let mut state = self.instrument.lock();
        if state.fail_io {
            return Err(Self::io_error());
        }
        Ok(state.output.drain(..).collect())
    }
}
