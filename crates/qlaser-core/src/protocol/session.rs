//! Device session
//!
//! Owns the link and the negotiated firmware version, and turns codec frames
//! into strictly sequential request/response exchanges with the instrument.
//! Every command is fully answered (or drained) before the next one is sent.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::allocator::{FirstEmptySlot, SlotAllocator, SlotSource};
use super::channel_errors::{decode_error_line, ChannelErrorReport, ErrorRegisters};
use super::commands::Command;
use super::frame::{parse_misc_value, parse_value, parse_value_list, FrameBuilder, RegisterWrite};
use super::link::{Link, LinkOpener};
use super::profile::{mask, ProtocolProfile};
use super::pulse::{decode_pulse_definition, encode_pulse_definition, EncodedDefinition, PulseConfig, WaveId};
use super::range::{RangeChecker, RangeViolation};
use super::ProtocolError;
use crate::config::SessionConfig;
use crate::report::{Event, EventKind, ReportSink, Severity, TracingSink};
use crate::waveform::{voltage_to_dac_code, WaveSample};

/// Session state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    /// No link
    Disconnected,
    /// Opening the link
    Connecting,
    /// Waiting for the version banner
    VersionChecking,
    /// Connected and ready for commands
    Ready,
    /// Reset in progress
    Resetting,
    /// Firmware did not identify as expected. Terminal: build a new session
    /// after reflashing.
    VersionMismatch,
}

/// Channel selection target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelSelection {
    One(u32),
    All,
}

/// Result of a waveform table write
#[derive(Debug, Clone, PartialEq)]
pub struct TableWrite {
    /// Samples written, including the padding sample
    pub samples_written: usize,
    /// Samples that did not fit the sample width and were truncated
    pub violations: Vec<RangeViolation>,
}

impl TableWrite {
    pub fn is_lossy(&self) -> bool {
        !self.violations.is_empty()
    }
}

/// Result of a pulse definition write
#[derive(Debug, Clone, PartialEq)]
pub struct DefinitionWrite {
    /// Slot written
    pub slot: u16,
    /// An occupied slot was overwritten
    pub overwrote: bool,
    /// Encoded registers
    pub encoded: EncodedDefinition,
}

/// Start time of the placeholder definition written on reset: end of time
const SEED_START_TIME: u32 = 0x00FF_FFFF;

/// Session with one instrument
pub struct Session {
    /// Link handle
    link: Option<Box<dyn Link>>,
    /// Current state
    state: SessionState,
    /// Configuration
    config: SessionConfig,
    /// Frame encoder for the configured revision
    frames: FrameBuilder,
    /// Event sink
    sink: Arc<dyn ReportSink>,
    /// Version banner from the handshake
    version: Option<String>,
    /// Last channel selection written by this session
    selected: Option<ChannelSelection>,
    /// Metrics: bytes sent and lines received
    tx_bytes: u64,
    rx_lines: u64,
}

impl Session {
    /// Create a session reporting through `tracing`
    pub fn new(config: SessionConfig) -> Self {
        Self::with_sink(config, Arc::new(TracingSink))
    }

    /// Create a session reporting to `sink`
    pub fn with_sink(config: SessionConfig, sink: Arc<dyn ReportSink>) -> Self {
        let frames = FrameBuilder::new(&config.profile);
        Self {
            link: None,
            state: SessionState::Disconnected,
            config,
            frames,
            sink,
            version: None,
            selected: None,
            tx_bytes: 0,
            rx_lines: 0,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Version banner (also kept after a mismatch)
    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    /// Channel selection last written by this session
    pub fn selected_channel(&self) -> Option<ChannelSelection> {
        self.selected
    }

    pub fn profile(&self) -> &ProtocolProfile {
        &self.config.profile
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn sink(&self) -> &dyn ReportSink {
        self.sink.as_ref()
    }

    /// Bytes sent and lines received so far
    pub fn get_counters(&self) -> (u64, u64) {
        (self.tx_bytes, self.rx_lines)
    }

    /// Open the link and check the firmware version
    pub fn connect(&mut self, opener: &dyn LinkOpener) -> Result<(), ProtocolError> {
        match self.state {
            SessionState::Disconnected => {}
            SessionState::VersionMismatch => return Err(self.mismatch_error()),
            _ => return Err(ProtocolError::AlreadyConnected),
        }

        self.state = SessionState::Connecting;
        let link = match opener.open(&self.config.link) {
            Ok(link) => link,
            Err(e) => {
                self.state = SessionState::Disconnected;
                return Err(e);
            }
        };
        self.link = Some(link);
        info!("connect: opened {}", self.config.link.port_name);

        match self.handshake() {
            Ok(banner) => {
                info!("connect: firmware '{}'", banner);
                self.version = Some(banner);
                self.state = SessionState::Ready;
                Ok(())
            }
            Err(e) => {
                self.link = None;
                if !matches!(e, ProtocolError::VersionMismatch { .. }) {
                    self.state = SessionState::Disconnected;
                }
                Err(e)
            }
        }
    }

    fn handshake(&mut self) -> Result<String, ProtocolError> {
        // Echo off, otherwise every frame comes back as a response line
        let echo_off = self.frames.encode_argument(Command::Echo, 0);
        self.send(&echo_off)?;
        self.drain()?;

        self.state = SessionState::VersionChecking;
        let query = self.frames.encode_command(Command::VersionQuery);
        self.send(&query)?;
        let lines: Vec<String> = self
            .read_all()?
            .into_iter()
            .filter(|line| !line.trim().is_empty())
            .collect();
        if lines.is_empty() {
            warn!("handshake: no response to version query");
            return Err(ProtocolError::NoDevice);
        }

        let banner = lines.join("\n");
        if !self.config.profile.banner_matches(&banner) {
            warn!("handshake: unexpected banner '{}'", banner);
            self.version = Some(banner);
            self.state = SessionState::VersionMismatch;
            return Err(self.mismatch_error());
        }
        Ok(banner)
    }

    fn mismatch_error(&self) -> ProtocolError {
        ProtocolError::VersionMismatch {
            expected: self.config.profile.version_tokens.clone(),
            received: self.version.clone().unwrap_or_default(),
        }
    }

    /// Drop the link
    pub fn disconnect(&mut self) {
        self.link = None;
        self.selected = None;
        if self.state != SessionState::VersionMismatch {
            self.state = SessionState::Disconnected;
        }
    }

    /// Soft reset. Does not verify that the device cleared its state.
    pub fn reset(&mut self) -> Result<(), ProtocolError> {
        self.require_ready()?;
        self.state = SessionState::Resetting;
        let result = self.reset_inner();
        if self.state == SessionState::Resetting {
            self.state = SessionState::Ready;
        }
        result
    }

    fn reset_inner(&mut self) -> Result<(), ProtocolError> {
        let reset = self.frames.encode_command(Command::Reset);
        self.send(&reset)?;
        debug!("reset: sent reset command");

        if self.config.profile.seed_on_reset {
            // Keep no register with garbage: park entry 0 of every channel at the end of time
            self.select_inner(ChannelSelection::All)?;
            let seed = PulseConfig::new(SEED_START_TIME, WaveId::new(0, 2), 1.0, 1.0, 0);
            let encoded = encode_pulse_definition(
                &self.config.profile,
                0,
                &seed,
                self.config.strictness,
                self.sink.as_ref(),
            )?;
            self.write_registers(&encoded.writes)?;
        }
        self.drain()
    }

    /// Select the channel that subsequent definition writes apply to
    pub fn select_channel(&mut self, selection: ChannelSelection) -> Result<(), ProtocolError> {
        self.require_ready()?;
        self.select_inner(selection)
    }

    fn select_inner(&mut self, selection: ChannelSelection) -> Result<(), ProtocolError> {
        let number = match selection {
            ChannelSelection::One(channel) => {
                self.check_channel(channel)?;
                channel
            }
            ChannelSelection::All => self.config.profile.all_channels_selector,
        };
        let frame = self.frames.encode_argument(Command::ChannelSelect, number as u64);
        self.send(&frame)?;
        self.selected = Some(selection);
        Ok(())
    }

    /// Enable the given channels, disabling all others
    pub fn enable_channels(&mut self, channels: &[u32]) -> Result<(), ProtocolError> {
        self.require_ready()?;
        let max = self.config.profile.max_channels;
        let mut bits = 0u64;
        for &channel in channels {
            self.check_channel(channel)?;
            bits |= 1u64.checked_shl(max - 1 - channel).unwrap_or(0);
        }
        let frame = self.frames.encode_argument(Command::ChannelEnable, bits);
        self.send(&frame)
    }

    /// Set the total sequence length for all channels and re-arm them
    pub fn set_sequence_length(&mut self, ticks: u32) -> Result<(), ProtocolError> {
        self.require_ready()?;
        let mut frame = self.frames.encode_argument(Command::SequenceLength, ticks as u64);
        frame.extend(self.frames.encode_command(Command::ChannelEnable));
        self.send(&frame)?;
        self.drain()
    }

    /// Start the loaded pulse sequence
    pub fn trigger(&mut self) -> Result<(), ProtocolError> {
        self.require_ready()?;
        let frame = self.frames.encode_command(Command::Trigger);
        self.send(&frame)?;
        debug!("trigger: sent");
        self.drain()
    }

    /// Write samples into waveform RAM starting at an even address.
    ///
    /// Samples are packed two per register (`hi << addr_bits | lo`); an odd
    /// count is padded with one zero sample.
    pub fn write_waveform_table(
        &mut self,
        start_address: u32,
        samples: &[WaveSample],
        broadcast_all: bool,
    ) -> Result<TableWrite, ProtocolError> {
        self.require_ready()?;
        if start_address % 2 != 0 {
            return Err(ProtocolError::AlignmentError {
                field: "start_address",
                value: start_address,
            });
        }
        let padded_len = samples.len() + samples.len() % 2;
        self.check_wave_span(start_address, padded_len)?;

        let profile = &self.config.profile;
        let bits = profile.addr_bits;
        let sample_mask = mask(bits);
        let mut checker = RangeChecker::new(
            self.config.strictness,
            self.sink.as_ref(),
            format!("waveform[{}]", start_address),
        );
        let mut writes = Vec::with_capacity(padded_len / 2);
        for (pair, chunk) in samples.chunks(2).enumerate() {
            let lo = chunk[0];
            let hi = chunk.get(1).copied().unwrap_or(0);
            let index = pair * 2;
            checker.check(&format!("sample[{}]", index), lo as i64, sample_mask as i64)?;
            checker.check(&format!("sample[{}]", index + 1), hi as i64, sample_mask as i64)?;
            let value = (((hi as u64 & sample_mask) << bits) | (lo as u64 & sample_mask)) as u32;
            writes.push(RegisterWrite::new(
                start_address / 2 + pair as u32,
                value,
                Command::WaveRamWrite,
            ));
        }
        let violations = checker.finish();

        if broadcast_all {
            self.select_inner(ChannelSelection::All)?;
        }
        self.write_registers(&writes)?;
        debug!(
            "write_waveform_table: {} samples at {}",
            padded_len, start_address
        );
        Ok(TableWrite {
            samples_written: padded_len,
            violations,
        })
    }

    /// Read `length` samples of waveform RAM starting at an even address
    pub fn read_waveform_table(
        &mut self,
        start_address: u32,
        length: usize,
    ) -> Result<Vec<WaveSample>, ProtocolError> {
        self.require_ready()?;
        if start_address % 2 != 0 {
            return Err(ProtocolError::AlignmentError {
                field: "start_address",
                value: start_address,
            });
        }
        self.check_wave_span(start_address, length)?;
        if length == 0 {
            return Ok(Vec::new());
        }

        let pairs = length.div_ceil(2);
        let words = self.read_words(Command::WaveRamRead, start_address / 2, pairs as u32, 1)?;

        let bits = self.config.profile.addr_bits;
        let sample_mask = mask(bits);
        let mut samples = Vec::with_capacity(pairs * 2);
        for word in words {
            samples.push((word & sample_mask) as WaveSample);
            samples.push(((word >> bits) & sample_mask) as WaveSample);
        }
        samples.truncate(length);
        Ok(samples)
    }

    /// Write a pulse definition into the slot chosen by `allocator`
    pub fn write_pulse_definition(
        &mut self,
        config: &PulseConfig,
        allocator: &mut dyn SlotAllocator,
    ) -> Result<DefinitionWrite, ProtocolError> {
        self.require_ready()?;
        let sink = Arc::clone(&self.sink);
        let allocation = allocator.allocate(self, sink.as_ref())?;
        let encoded = encode_pulse_definition(
            &self.config.profile,
            allocation.index,
            config,
            self.config.strictness,
            sink.as_ref(),
        )?;
        self.write_registers(&encoded.writes)?;
        debug!(
            "write_pulse_definition: slot {} start={} wave={}",
            allocation.index, encoded.start_time, config.wave
        );
        Ok(DefinitionWrite {
            slot: allocation.index,
            overwrote: allocation.overwrites,
            encoded,
        })
    }

    /// Write a pulse definition into the first empty slot
    pub fn append_pulse_definition(&mut self, config: &PulseConfig) -> Result<DefinitionWrite, ProtocolError> {
        self.write_pulse_definition(config, &mut FirstEmptySlot)
    }

    /// Read every definition slot of the selected channel
    pub fn read_pulse_definitions(&mut self) -> Result<Vec<Option<PulseConfig>>, ProtocolError> {
        self.require_ready()?;
        (0..self.config.profile.pulse_slots)
            .map(|index| self.read_slot(index))
            .collect()
    }

    /// Definitions of the selected channel up to the first empty slot
    pub fn pulse_definitions(&mut self) -> Result<Vec<PulseConfig>, ProtocolError> {
        self.require_ready()?;
        let mut defs = Vec::new();
        for index in 0..self.config.profile.pulse_slots {
            match self.read_slot(index)? {
                Some(def) => defs.push(def),
                None => break,
            }
        }
        Ok(defs)
    }

    /// Zero every definition slot of the selected channel
    pub fn clear_pulse_definitions(&mut self) -> Result<(), ProtocolError> {
        self.require_ready()?;
        let profile = &self.config.profile;
        let writes: Vec<RegisterWrite> = (0..profile.pulse_slots)
            .flat_map(|slot| {
                (0..4).map(move |i| {
                    RegisterWrite::new(
                        profile.slot_register_address(slot, i),
                        0,
                        Command::PulseDefinitionWrite,
                    )
                })
            })
            .collect();
        self.write_registers(&writes)?;
        debug!("clear_pulse_definitions: {} slots", self.config.profile.pulse_slots);
        Ok(())
    }

    /// Zero all of waveform RAM
    pub fn clear_waveform_table(&mut self) -> Result<(), ProtocolError> {
        self.require_ready()?;
        let writes: Vec<RegisterWrite> = (0..self.config.profile.wave_capacity / 2)
            .map(|addr| RegisterWrite::new(addr, 0, Command::WaveRamWrite))
            .collect();
        self.write_registers(&writes)?;
        debug!("clear_waveform_table: {} words", writes.len());
        Ok(())
    }

    /// Query per-channel error masks
    pub fn read_channel_errors(&mut self) -> Result<ChannelErrorReport, ProtocolError> {
        self.require_ready()?;
        self.drain()?;
        let query = self.frames.encode_command(Command::ChannelErrorQuery);
        self.send(&query)?;
        let line = self.read_response()?;
        let report = decode_error_line(&line, self.config.profile.max_channels)?;
        for error in &report.errors {
            warn!("channel {} reports '{}'", error.channel, error.kind);
        }
        Ok(report)
    }

    /// Legacy error registers, read through the misc register
    pub fn read_error_registers(&mut self) -> Result<ErrorRegisters, ProtocolError> {
        let low = self.read_misc()? & 0xFF;
        let high = (self.read_misc()? >> 8) & 0xFF;
        Ok(ErrorRegisters {
            high: high as u8,
            low: low as u8,
        })
    }

    /// Read the general purpose register
    pub fn read_misc(&mut self) -> Result<u32, ProtocolError> {
        self.require_ready()?;
        self.drain()?;
        let frame = self.frames.encode_command(Command::MiscRead);
        self.send(&frame)?;
        let line = self.read_response()?;
        parse_misc_value(&line)
    }

    /// Write the general purpose register
    pub fn write_misc(&mut self, value: u32) -> Result<(), ProtocolError> {
        self.require_ready()?;
        let frame = self.frames.encode_argument(Command::MiscWrite, value as u64);
        self.send(&frame)
    }

    /// Write a raw code to a DC channel
    pub fn write_dc(&mut self, channel: u32, code: u32) -> Result<Vec<RangeViolation>, ProtocolError> {
        self.require_ready()?;
        let limit = self.config.profile.dc_channels;
        if channel >= limit {
            return Err(ProtocolError::InvalidChannel { channel, limit });
        }
        let max_code = self.config.profile.max_dac_code();
        let mut checker = RangeChecker::new(
            self.config.strictness,
            self.sink.as_ref(),
            format!("dc[{}]", channel),
        );
        checker.check("code", code as i64, max_code as i64)?;
        let violations = checker.finish();
        self.write_registers(&[RegisterWrite::new(channel, code & max_code, Command::DcWrite)])?;
        Ok(violations)
    }

    /// Set a DC channel to `voltage`; returns the DAC code written
    pub fn set_dc_voltage(&mut self, channel: u32, voltage: f64) -> Result<u32, ProtocolError> {
        let code = voltage_to_dac_code(
            voltage,
            &self.config.dac_reference,
            self.config.profile.dac_bits,
            self.sink.as_ref(),
        );
        self.write_dc(channel, code)?;
        Ok(code)
    }

    /// Register dump as text lines
    pub fn dump_registers(&mut self) -> Result<Vec<String>, ProtocolError> {
        self.require_ready()?;
        self.drain()?;
        let frame = self.frames.encode_command(Command::RegisterDump);
        self.send(&frame)?;
        self.read_all()
    }

    /// Read everything the device has sent and report it
    pub fn drain(&mut self) -> Result<(), ProtocolError> {
        let lines = self.read_all()?;
        for line in lines {
            if line.trim().is_empty() {
                continue;
            }
            if line.contains(self.config.profile.error_marker.as_str()) {
                self.sink
                    .report(Event::new(Severity::Error, EventKind::DeviceError(line)));
            } else {
                self.sink.report(Event::debug(EventKind::DeviceOutput(line)));
            }
        }
        Ok(())
    }

    fn require_ready(&self) -> Result<(), ProtocolError> {
        match self.state {
            SessionState::Ready => Ok(()),
            SessionState::VersionMismatch => Err(self.mismatch_error()),
            _ => Err(ProtocolError::NotConnected),
        }
    }

    fn check_channel(&self, channel: u32) -> Result<(), ProtocolError> {
        let limit = self.config.profile.max_channels;
        if channel >= limit {
            return Err(ProtocolError::InvalidChannel { channel, limit });
        }
        Ok(())
    }

    fn check_wave_span(&self, start_address: u32, length: usize) -> Result<(), ProtocolError> {
        let capacity = self.config.profile.wave_capacity as u64;
        let end = start_address as u64 + length as u64;
        if end > capacity {
            return Err(ProtocolError::InvalidAddress {
                field: "waveform end address",
                value: end,
                limit: capacity,
            });
        }
        Ok(())
    }

    fn write_registers(&mut self, writes: &[RegisterWrite]) -> Result<(), ProtocolError> {
        for write in writes {
            let frame = self.frames.encode_write(write);
            self.send(&frame)?;
        }
        Ok(())
    }

    /// Read `count` words starting at `address`, `stride` apart.
    /// Bulk-capable firmware answers contiguous reads with one comma list.
    fn read_words(
        &mut self,
        block: Command,
        address: u32,
        count: u32,
        stride: u32,
    ) -> Result<Vec<u64>, ProtocolError> {
        // Leftover device output would otherwise be parsed as the reply
        self.drain()?;

        // A bulk read covers consecutive addresses only
        if self.config.profile.bulk_reads && (stride == 1 || count == 1) {
            let frame = self.frames.encode_read(block, address, count);
            self.send(&frame)?;
            let line = self.read_response()?;
            let words = parse_value_list(&line)?;
            if words.len() != count as usize {
                return Err(ProtocolError::InvalidResponse(format!(
                    "expected {} values, got {}",
                    count,
                    words.len()
                )));
            }
            return Ok(words);
        }

        let mut words = Vec::with_capacity(count as usize);
        for i in 0..count {
            let frame = self.frames.encode_read(block, address + i * stride, 1);
            self.send(&frame)?;
            let line = self.read_response()?;
            words.push(parse_value(&line)?);
        }
        Ok(words)
    }

    fn send(&mut self, bytes: &[u8]) -> Result<(), ProtocolError> {
        let link = self.link.as_mut().ok_or(ProtocolError::NotConnected)?;
        let result = link.send(bytes);
        if result.is_ok() {
            self.tx_bytes = self.tx_bytes.saturating_add(bytes.len() as u64);
        }
        self.check_transport(result)
    }

    fn read_all(&mut self) -> Result<Vec<String>, ProtocolError> {
        let link = self.link.as_mut().ok_or(ProtocolError::NotConnected)?;
        let result = link.read_all_available();
        if let Ok(lines) = &result {
            self.rx_lines = self.rx_lines.saturating_add(lines.len() as u64);
        }
        self.check_transport(result)
    }

    /// Next data line; error-marked lines are reported and skipped
    fn read_response(&mut self) -> Result<String, ProtocolError> {
        let timeout = self.config.link.timeout();
        loop {
            let link = self.link.as_mut().ok_or(ProtocolError::NotConnected)?;
            let line = match link.read_line(timeout) {
                Ok(Some(line)) => line,
                Ok(None) => return self.check_transport(Err(ProtocolError::Timeout)),
                Err(e) => return self.check_transport(Err(e)),
            };
            self.rx_lines = self.rx_lines.saturating_add(1);
            if line.contains(self.config.profile.error_marker.as_str()) {
                self.sink
                    .report(Event::new(Severity::Error, EventKind::DeviceError(line)));
                continue;
            }
            return Ok(line);
        }
    }

    /// Transport failures are fatal: drop the link, no retry
    fn check_transport<T>(&mut self, result: Result<T, ProtocolError>) -> Result<T, ProtocolError> {
        if let Err(e) = &result {
            if e.is_transport() {
                warn!("transport failure, disconnecting: {}", e);
                self.link = None;
                self.selected = None;
                self.state = SessionState::Disconnected;
            }
        }
        result
    }
}

impl SlotSource for Session {
    fn slot_count(&self) -> u16 {
        self.config.profile.pulse_slots
    }

    fn read_slot(&mut self, index: u16) -> Result<Option<PulseConfig>, ProtocolError> {
        let profile = &self.config.profile;
        let address = profile.slot_register_address(index, 0);
        let stride = profile.slot_address_stride;
        let words = self.read_words(Command::PulseDefinitionRead, address, 4, stride)?;
        let mut raw = [0u32; 4];
        for (slot, word) in raw.iter_mut().zip(words) {
            *slot = word as u32;
        }
        Ok(decode_pulse_definition(&self.config.profile, raw))
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.disconnect();
    }
}
