//! Sequence loading
//!
//! Loads a whole pulse sequence onto one channel (or all of them): sequence
//! length, channel selection, one definition per entry in slots `0..n` and the
//! synthesized waveform table of each entry.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::protocol::{
    ChannelSelection, DefinitionWrite, FixedSlot, ProtocolError, PulseConfig, Session, TableWrite, WaveId,
};
use crate::storage::DefinitionStore;
use crate::waveform::Synthesizer;

/// How entry start times are interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeBase {
    /// Offset from the previous entry
    #[default]
    Relative,
    /// Exact start tick
    Absolute,
}

/// One pulse of a sequence with the shape of its waveform
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaveEntry {
    pub start_time: u32,
    /// Even waveform RAM address of the table
    pub start_address: u16,
    pub wave_length: u16,
    pub scale_gain: f64,
    pub scale_addr: f64,
    pub sustain: u32,
    /// Shape polynomial coefficients, power 1 upward
    pub coefficients: Vec<f64>,
}

/// Steps around the entry writes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadOptions {
    /// Soft reset before loading
    pub reset: bool,
    /// Trigger once loaded
    pub trigger: bool,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            reset: true,
            trigger: false,
        }
    }
}

/// What a load wrote, per entry
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadReport {
    pub definitions: Vec<DefinitionWrite>,
    pub tables: Vec<TableWrite>,
}

impl LoadReport {
    pub fn is_lossy(&self) -> bool {
        self.definitions.iter().any(|d| d.encoded.is_lossy()) || self.tables.iter().any(|t| t.is_lossy())
    }
}

/// Start tick of every entry.
///
/// Relative entries follow `prev.start_time + 2 * prev.wave_length +
/// prev.sustain + start_time`, where `prev.start_time` is the previous entry's
/// own field and not its computed start. Firmware revisions disagree on this
/// accumulation and it has not been validated on hardware, so it is kept as
/// the reference tooling computes it.
pub fn start_times(entries: &[WaveEntry], time_base: TimeBase) -> Vec<u64> {
    entries
        .iter()
        .enumerate()
        .map(|(i, entry)| match (time_base, i) {
            (TimeBase::Relative, i) if i > 0 => {
                let prev = &entries[i - 1];
                prev.start_time as u64
                    + 2 * prev.wave_length as u64
                    + prev.sustain as u64
                    + entry.start_time as u64
            }
            _ => entry.start_time as u64,
        })
        .collect()
}

/// Load `entries` into slots `0..n` of `channel` (`None` for all channels).
///
/// Every entry is validated before the first byte is sent.
pub fn load_waves(
    session: &mut Session,
    entries: &[WaveEntry],
    seq_length: u32,
    channel: Option<u32>,
    time_base: TimeBase,
    options: LoadOptions,
) -> Result<LoadReport, ProtocolError> {
    check_slot_count(session, entries.len())?;
    let capacity = session.profile().wave_capacity as u64;
    for entry in entries {
        if entry.start_address % 2 != 0 {
            return Err(ProtocolError::AlignmentError {
                field: "start_address",
                value: entry.start_address as u32,
            });
        }
        let padded = entry.wave_length as u64 + entry.wave_length as u64 % 2;
        let end = entry.start_address as u64 + padded;
        if end > capacity {
            return Err(ProtocolError::InvalidAddress {
                field: "waveform end address",
                value: end,
                limit: capacity,
            });
        }
    }
    let mut configs = Vec::with_capacity(entries.len());
    for (i, (entry, start)) in entries.iter().zip(start_times(entries, time_base)).enumerate() {
        let start_time = u32::try_from(start).map_err(|_| ProtocolError::OutOfRange {
            field: format!("entries[{}].start_time", i),
            value: i64::try_from(start).unwrap_or(i64::MAX),
            bound: u32::MAX as i64,
        })?;
        configs.push(PulseConfig::new(
            start_time,
            WaveId::new(entry.start_address, entry.wave_length),
            entry.scale_gain,
            entry.scale_addr,
            entry.sustain,
        ));
    }

    if options.reset {
        session.reset()?;
    }
    session.set_sequence_length(seq_length)?;
    let selection = channel.map_or(ChannelSelection::All, ChannelSelection::One);
    session.select_channel(selection)?;
    session.drain()?;

    let synth = Synthesizer::for_profile(session.profile());
    let mut report = LoadReport::default();
    for (i, (entry, config)) in entries.iter().zip(&configs).enumerate() {
        info!("load_waves: entry {} start={} wave={}", i, config.start_time, config.wave);
        let definition = session.write_pulse_definition(config, &mut FixedSlot(i as u16))?;
        let table = synth.synthesize_table(entry.wave_length as usize, &entry.coefficients, session.sink());
        let written = session.write_waveform_table(entry.start_address as u32, &table, false)?;
        report.definitions.push(definition);
        report.tables.push(written);
    }
    session.drain()?;

    if options.trigger {
        session.trigger()?;
    }
    debug!("load_waves: {} entries loaded", entries.len());
    Ok(report)
}

/// Replace the definitions of `channel` with `definitions` in slots `0..n`
/// and record the set in `history`
pub fn set_definitions(
    session: &mut Session,
    definitions: &[PulseConfig],
    seq_length: u32,
    channel: u32,
    history: &mut dyn DefinitionStore,
) -> Result<Vec<DefinitionWrite>, ProtocolError> {
    check_slot_count(session, definitions.len())?;

    session.set_sequence_length(seq_length)?;
    session.select_channel(ChannelSelection::One(channel))?;
    info!("set_definitions: clearing definitions on channel {}", channel);
    session.clear_pulse_definitions()?;
    session.drain()?;

    let mut written = Vec::with_capacity(definitions.len());
    for (i, config) in definitions.iter().enumerate() {
        written.push(session.write_pulse_definition(config, &mut FixedSlot(i as u16))?);
    }
    session.drain()?;
    history.append(channel, seq_length, definitions)?;
    Ok(written)
}

fn check_slot_count(session: &Session, count: usize) -> Result<(), ProtocolError> {
    let slots = session.profile().pulse_slots as u64;
    if count as u64 > slots {
        return Err(ProtocolError::InvalidAddress {
            field: "pulse definition slot",
            value: count as u64 - 1,
            limit: slots - 1,
        });
    }
    Ok(())
}
