//! Protocol profile
//!
//! Every firmware-revision dependent constant (bit widths, command bytes,
//! address layout) is carried by a [`ProtocolProfile`] injected into the
//! codec and the session.

use serde::{Deserialize, Serialize};

use super::commands::CommandTable;
use super::error::ProtocolError;

/// Firmware protocol revision. Selected explicitly, never auto-detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProtocolRevision {
    /// Two-step frames (`<value>` SET_DATA, `<address>` block byte),
    /// 12-bit address/length field in pulse definitions
    Legacy,
    /// Single packed frame `((address << 32) | value)` + block byte,
    /// packed WaveID in pulse definitions
    Unified,
}

/// How real values become fixed-point register fields
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FixedPointRounding {
    /// Round to nearest
    Nearest,
    /// Truncate toward zero
    Truncate,
}

impl FixedPointRounding {
    pub fn apply(&self, value: f64) -> f64 {
        match self {
            FixedPointRounding::Nearest => value.round(),
            FixedPointRounding::Truncate => value.trunc(),
        }
    }
}

/// Firmware constants for one protocol revision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolProfile {
    /// Protocol revision
    pub revision: ProtocolRevision,

    /// Waveform RAM address and sample width in bits (C_BITS_ADDR_WAVE)
    pub addr_bits: u32,

    /// Gain factor width in bits; gain uses `gain_bits - 1` fraction bits
    pub gain_bits: u32,

    /// Time factor fraction bits (BIT_FRAC)
    pub frac_bits: u32,

    /// DC DAC resolution in bits
    pub dac_bits: u32,

    /// Number of pulse channels (C_MAX_CHANNELS)
    pub max_channels: u32,

    /// Number of DC channels
    pub dc_channels: u32,

    /// Width of each byte of the legacy error register (C_ERR_BITS)
    pub err_bits: u32,

    /// Minimum start time of the first pulse entry
    pub pulse_start_min: u32,

    /// Waveform RAM capacity in samples
    pub wave_capacity: u32,

    /// Pulse definition slots per channel
    pub pulse_slots: u16,

    /// Address increment between consecutive definition registers
    /// (4 = byte offsets, 1 = register index)
    pub slot_address_stride: u32,

    /// Channel number meaning "all channels" for channel select
    pub all_channels_selector: u32,

    /// Fixed-point conversion for gain and time factor
    pub rounding: FixedPointRounding,

    /// Whether the firmware answers a staged count with a comma list
    pub bulk_reads: bool,

    /// Seed slot 0 of every channel with a far-future entry on reset
    pub seed_on_reset: bool,

    /// Marker identifying diagnostic error lines
    pub error_marker: String,

    /// Both tokens must appear in the version banner
    pub version_tokens: Vec<String>,

    /// Command bytes
    pub commands: CommandTable,
}

impl ProtocolProfile {
    /// Legacy two-step protocol of the first ZCU firmware
    pub fn legacy() -> Self {
        Self {
            revision: ProtocolRevision::Legacy,
            pulse_start_min: 4,
            slot_address_stride: 4,
            rounding: FixedPointRounding::Truncate,
            bulk_reads: false,
            seed_on_reset: true,
            commands: CommandTable {
                trigger: b't',
                ..CommandTable::default()
            },
            ..Self::unified()
        }
    }

    /// Unified packed-frame protocol
    pub fn unified() -> Self {
        Self {
            revision: ProtocolRevision::Unified,
            addr_bits: 16,
            gain_bits: 16,
            frac_bits: 8,
            dac_bits: 12,
            max_channels: 32,
            dc_channels: 16,
            err_bits: 8,
            pulse_start_min: 5,
            wave_capacity: 4096,
            pulse_slots: 32,
            slot_address_stride: 1,
            all_channels_selector: 99,
            rounding: FixedPointRounding::Nearest,
            bulk_reads: true,
            seed_on_reset: false,
            error_marker: "ERROR".to_string(),
            version_tokens: vec!["QLASER".to_string(), "PULSE".to_string()],
            commands: CommandTable::default(),
        }
    }

    /// Largest sample value that fits one waveform RAM half-word
    pub fn max_sample(&self) -> u32 {
        mask(self.addr_bits) as u32
    }

    /// Largest DAC code
    pub fn max_dac_code(&self) -> u32 {
        mask(self.dac_bits) as u32
    }

    /// Fraction bits of the gain field
    pub fn gain_frac_bits(&self) -> u32 {
        self.gain_bits.saturating_sub(1)
    }

    /// Address of register `index` (0..4) of definition slot `entry`
    pub fn slot_register_address(&self, entry: u16, index: u32) -> u32 {
        (4 * entry as u32 + index) * self.slot_address_stride
    }

    /// Reject bit widths and counts the register layout cannot hold
    pub fn validate(&self) -> Result<(), ProtocolError> {
        let checks = [
            ("addr_bits", self.addr_bits, 1, 16),
            ("gain_bits", self.gain_bits, 2, 16),
            ("frac_bits", self.frac_bits, 0, 16),
            ("dac_bits", self.dac_bits, 1, 32),
            ("err_bits", self.err_bits, 1, 32),
            ("max_channels", self.max_channels, 1, 64),
            ("slot_address_stride", self.slot_address_stride, 1, 4),
        ];
        for (field, value, min, max) in checks {
            if value < min || value > max {
                return Err(ProtocolError::Config(format!(
                    "profile {} = {} outside {}..={}",
                    field, value, min, max
                )));
            }
        }
        if self.wave_capacity > 1 << 16 {
            return Err(ProtocolError::Config(format!(
                "profile wave_capacity = {} exceeds the 16-bit address field",
                self.wave_capacity
            )));
        }
        Ok(())
    }

    /// Check the version banner for the expected tokens
    pub fn banner_matches(&self, banner: &str) -> bool {
        self.version_tokens
            .iter()
            .all(|token| banner.contains(token.as_str()))
    }
}

impl Default for ProtocolProfile {
    fn default() -> Self {
        Self::unified()
    }
}

/// All-ones mask of `bits` width
pub(crate) fn mask(bits: u32) -> u64 {
    if bits >= 64 {
        u64::MAX
    } else {
        (1u64 << bits) - 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets_differ_where_firmware_differs() {
        let legacy = ProtocolProfile::legacy();
        let unified = ProtocolProfile::unified();
        assert_eq!(legacy.pulse_start_min, 4);
        assert_eq!(unified.pulse_start_min, 5);
        assert_eq!(legacy.commands.trigger, b't');
        assert_eq!(unified.commands.trigger, 0x80);
        assert_eq!(legacy.addr_bits, unified.addr_bits);
    }

    #[test]
    fn test_slot_register_addresses() {
        let legacy = ProtocolProfile::legacy();
        assert_eq!(legacy.slot_register_address(0, 0), 0);
        assert_eq!(legacy.slot_register_address(1, 0), 16);
        assert_eq!(legacy.slot_register_address(1, 3), 28);

        let unified = ProtocolProfile::unified();
        assert_eq!(unified.slot_register_address(2, 0), 8);
        assert_eq!(unified.slot_register_address(2, 3), 11);
    }

    #[test]
    fn test_limits() {
        let profile = ProtocolProfile::unified();
        assert_eq!(profile.max_sample(), 0xFFFF);
        assert_eq!(profile.max_dac_code(), 4095);
        assert_eq!(profile.gain_frac_bits(), 15);
    }

    #[test]
    fn test_banner_requires_every_token() {
        let profile = ProtocolProfile::unified();
        assert!(profile.banner_matches("QLASER fw 2.1 PULSE sequencer"));
        assert!(!profile.banner_matches("QLASER fw 2.1"));
        assert!(!profile.banner_matches(""));
    }

    #[test]
    fn test_profile_json_roundtrip() {
        let profile = ProtocolProfile::legacy();
        let json = serde_json::to_string(&profile).unwrap();
        let back: ProtocolProfile = serde_json::from_str(&json).unwrap();
        assert_eq!(back, profile);
    }

    #[test]
    fn test_presets_validate() {
        assert!(ProtocolProfile::legacy().validate().is_ok());
        assert!(ProtocolProfile::unified().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_wide_fields() {
        let mut profile = ProtocolProfile::unified();
        profile.max_channels = 64;
        assert!(profile.validate().is_ok());
        profile.max_channels = 65;
        assert!(matches!(profile.validate(), Err(ProtocolError::Config(_))));

        let mut profile = ProtocolProfile::unified();
        profile.dac_bits = 64;
        assert!(matches!(profile.validate(), Err(ProtocolError::Config(_))));

        let mut profile = ProtocolProfile::unified();
        profile.addr_bits = 0;
        assert!(matches!(profile.validate(), Err(ProtocolError::Config(_))));
    }

    #[test]
    fn test_rounding() {
        assert_eq!(FixedPointRounding::Nearest.apply(2.6), 3.0);
        assert_eq!(FixedPointRounding::Truncate.apply(2.6), 2.0);
    }
}
