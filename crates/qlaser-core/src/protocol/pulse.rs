//! Pulse definition register group
//!
//! A definition slot is four consecutive registers:
//!
//! | # | contents                                                  |
//! |---|-----------------------------------------------------------|
//! | 0 | start time, 24 bits                                       |
//! | 1 | packed WaveID (unified) or `len[27:16] \| addr[11:0]` (legacy) |
//! | 2 | `gain << 16 \| time_factor`, both 16-bit fixed point      |
//! | 3 | sustain, 17 bits                                          |
//!
//! An all-zero group is an empty slot.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::commands::Command;
use super::frame::RegisterWrite;
use super::profile::{mask, ProtocolProfile, ProtocolRevision};
use super::range::{RangeChecker, RangeViolation, Strictness};
use super::ProtocolError;
use crate::report::{Event, EventKind, ReportSink};

const START_TIME_MASK: u32 = 0x00FF_FFFF;
const SUSTAIN_MASK: u32 = 0x0001_FFFF;
const LEGACY_WAVE_FIELD_MASK: u32 = 0x0FFF;

/// Packed handle of a waveform in RAM: `length << 16 | start_address`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WaveId {
    pub start_address: u16,
    pub length: u16,
}

impl WaveId {
    pub fn new(start_address: u16, length: u16) -> Self {
        Self {
            start_address,
            length,
        }
    }

    pub fn from_packed(packed: u32) -> Self {
        Self {
            start_address: (packed & 0xFFFF) as u16,
            length: (packed >> 16) as u16,
        }
    }

    pub fn packed(&self) -> u32 {
        ((self.length as u32) << 16) | self.start_address as u32
    }

    /// First address after the waveform
    pub fn end_address(&self) -> u32 {
        self.start_address as u32 + self.length as u32
    }
}

impl fmt::Display for WaveId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.packed())
    }
}

/// Timing and shape parameters of one pulse
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PulseConfig {
    /// Start time in ticks (24 bits)
    pub start_time: u32,
    /// Waveform the pulse plays
    pub wave: WaveId,
    /// Amplitude scale in (0, 1]
    pub scale_gain: f64,
    /// Time step through the waveform, >= 1
    pub scale_addr: f64,
    /// Flat-top duration in ticks (17 bits)
    pub sustain: u32,
}

impl PulseConfig {
    pub fn new(start_time: u32, wave: WaveId, scale_gain: f64, scale_addr: f64, sustain: u32) -> Self {
        Self {
            start_time,
            wave,
            scale_gain,
            scale_addr,
            sustain,
        }
    }
}

/// Encoded register writes of one definition slot
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedDefinition {
    pub writes: [RegisterWrite; 4],
    /// Start time actually encoded (after the entry 0 minimum)
    pub start_time: u32,
    /// Fields that were truncated
    pub violations: Vec<RangeViolation>,
}

impl EncodedDefinition {
    /// True when the device will not receive exactly what was requested
    pub fn is_lossy(&self) -> bool {
        !self.violations.is_empty()
    }

    pub fn raw(&self) -> [u32; 4] {
        [
            self.writes[0].value,
            self.writes[1].value,
            self.writes[2].value,
            self.writes[3].value,
        ]
    }
}

/// Encode a definition into the four registers of slot `entry`
pub fn encode_pulse_definition(
    profile: &ProtocolProfile,
    entry: u16,
    config: &PulseConfig,
    strictness: Strictness,
    sink: &dyn ReportSink,
) -> Result<EncodedDefinition, ProtocolError> {
    let mut checker = RangeChecker::new(strictness, sink, format!("pulse_definition[{}]", entry));

    let gain_fixed = profile
        .rounding
        .apply(config.scale_gain * (1u64 << profile.gain_frac_bits()) as f64) as i64;
    let time_fixed = profile
        .rounding
        .apply(config.scale_addr * (1u64 << profile.frac_bits) as f64) as i64;

    checker.check("start_time", config.start_time as i64, START_TIME_MASK as i64)?;

    let mut start_time = config.start_time;
    if entry == 0 && start_time < profile.pulse_start_min {
        sink.report(Event::info(EventKind::StartTimeRaised {
            requested: start_time,
            minimum: profile.pulse_start_min,
        }));
        start_time = profile.pulse_start_min;
    }

    let wave_field = match profile.revision {
        ProtocolRevision::Unified => config.wave.packed(),
        ProtocolRevision::Legacy => {
            let limit = LEGACY_WAVE_FIELD_MASK as i64;
            checker.check("wave_addr", config.wave.start_address as i64, limit)?;
            checker.check("wave_len", config.wave.length as i64, limit)?;
            ((config.wave.length as u32 & LEGACY_WAVE_FIELD_MASK) << 16)
                | (config.wave.start_address as u32 & LEGACY_WAVE_FIELD_MASK)
        }
    };

    checker.check("scale_gain", gain_fixed, 0xFFFF)?;
    checker.check("scale_addr", time_fixed, 0xFFFF)?;
    checker.check("sustain", config.sustain as i64, SUSTAIN_MASK as i64)?;

    // Negative fixed-point values wrap as two's complement, like the hardware field
    let scale_field = (((gain_fixed as u64 & 0xFFFF) << 16) | (time_fixed as u64 & 0xFFFF)) as u32;

    let values = [
        start_time & START_TIME_MASK,
        wave_field,
        scale_field,
        config.sustain & SUSTAIN_MASK,
    ];
    let writes = [0u32, 1, 2, 3].map(|i| {
        RegisterWrite::new(
            profile.slot_register_address(entry, i),
            values[i as usize],
            Command::PulseDefinitionWrite,
        )
    });

    Ok(EncodedDefinition {
        writes,
        start_time,
        violations: checker.finish(),
    })
}

/// Decode the four registers of a slot. An all-zero slot is empty.
pub fn decode_pulse_definition(profile: &ProtocolProfile, raw: [u32; 4]) -> Option<PulseConfig> {
    if raw.iter().all(|&r| r == 0) {
        return None;
    }

    let wave = match profile.revision {
        ProtocolRevision::Unified => WaveId::from_packed(raw[1]),
        ProtocolRevision::Legacy => WaveId::new(
            (raw[1] & LEGACY_WAVE_FIELD_MASK) as u16,
            ((raw[1] >> 16) & LEGACY_WAVE_FIELD_MASK) as u16,
        ),
    };
    let gain_fixed = (raw[2] >> 16) as u64 & mask(16);
    let time_fixed = raw[2] as u64 & mask(16);

    Some(PulseConfig {
        start_time: raw[0] & START_TIME_MASK,
        wave,
        scale_gain: gain_fixed as f64 / (1u64 << profile.gain_frac_bits()) as f64,
        scale_addr: time_fixed as f64 / (1u64 << profile.frac_bits) as f64,
        sustain: raw[3] & SUSTAIN_MASK,
    })
}
