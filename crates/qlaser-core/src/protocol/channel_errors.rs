//! Channel error reports
//!
//! The firmware reports one 32-bit mask per error kind. Bit `j` of a mask
//! belongs to channel `max_channels - 1 - j`: bit 0 is the highest channel.

use serde::{Deserialize, Serialize};

use super::frame::parse_misc_value;
use super::ProtocolError;

/// One channel flagged for one error kind
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelError {
    pub kind: String,
    pub channel: u32,
}

/// Decoded error query reply
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelErrorReport {
    /// Raw masks in reply order
    pub masks: Vec<(String, u32)>,
    /// Flagged channels
    pub errors: Vec<ChannelError>,
}

impl ChannelErrorReport {
    /// Number of flagged (kind, channel) pairs; 0 means clean
    pub fn violation_count(&self) -> usize {
        self.errors.len()
    }

    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }

    /// Channels flagged for `kind`
    pub fn channels_for(&self, kind: &str) -> Vec<u32> {
        self.errors
            .iter()
            .filter(|e| e.kind == kind)
            .map(|e| e.channel)
            .collect()
    }
}

/// Map every set bit of each mask to its channel
pub fn decode_channel_errors(masks: &[(String, u32)], max_channels: u32) -> Vec<ChannelError> {
    let width = max_channels.min(32);
    let mut errors = Vec::new();
    for (kind, mask) in masks {
        for bit in 0..width {
            if mask & (1u32 << bit) != 0 {
                errors.push(ChannelError {
                    kind: kind.clone(),
                    channel: max_channels - 1 - bit,
                });
            }
        }
    }
    errors
}

/// Parse an error query line: `kind:mask` pairs separated by commas.
/// Masks may be decimal or `0x` hex; `=` is accepted in place of `:`.
pub fn parse_error_masks(line: &str) -> Result<Vec<(String, u32)>, ProtocolError> {
    let mut masks = Vec::new();
    for pair in line.trim().split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (kind, value) = pair
            .split_once(|c| c == ':' || c == '=')
            .ok_or_else(|| ProtocolError::InvalidResponse(format!("malformed error pair '{}'", pair)))?;
        let mask = parse_misc_value(value.trim())?;
        masks.push((kind.trim().to_string(), mask));
    }
    Ok(masks)
}

/// Decode a full error query reply line
pub fn decode_error_line(line: &str, max_channels: u32) -> Result<ChannelErrorReport, ProtocolError> {
    let masks = parse_error_masks(line)?;
    let errors = decode_channel_errors(&masks, max_channels);
    Ok(ChannelErrorReport { masks, errors })
}

/// Legacy two-byte error register read through the misc register
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorRegisters {
    pub high: u8,
    pub low: u8,
}

impl ErrorRegisters {
    /// Render both bytes as `err_bits` wide binary strings (high, low)
    pub fn to_bit_strings(&self, err_bits: u32) -> (String, String) {
        let width = err_bits as usize;
        (
            format!("{:0width$b}", self.high, width = width),
            format!("{:0width$b}", self.low, width = width),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bit_zero_is_highest_channel() {
        let errors = decode_channel_errors(&[("X".to_string(), 0b0001)], 32);
        assert_eq!(
            errors,
            vec![ChannelError {
                kind: "X".to_string(),
                channel: 31
            }]
        );
    }

    #[test]
    fn test_multiple_kinds_and_bits() {
        let masks = vec![
            ("overflow".to_string(), 0x8000_0001),
            ("underflow".to_string(), 0),
        ];
        let errors = decode_channel_errors(&masks, 32);
        let channels: Vec<u32> = errors.iter().map(|e| e.channel).collect();
        assert_eq!(channels, vec![31, 0]);
    }

    #[test]
    fn test_parse_error_line() {
        let report = decode_error_line("overflow:0x3, timing=4\r\n", 32).unwrap();
        assert_eq!(
            report.masks,
            vec![("overflow".to_string(), 3), ("timing".to_string(), 4)]
        );
        assert_eq!(report.violation_count(), 3);
        assert_eq!(report.channels_for("overflow"), vec![31, 30]);
        assert_eq!(report.channels_for("timing"), vec![29]);
    }

    #[test]
    fn test_clean_report() {
        let report = decode_error_line("overflow:0,timing:0", 32).unwrap();
        assert!(report.is_clean());
        assert_eq!(report.violation_count(), 0);
    }

    #[test]
    fn test_malformed_pair() {
        assert!(decode_error_line("overflow", 32).is_err());
    }

    #[test]
    fn test_error_register_bits() {
        let regs = ErrorRegisters { high: 0x81, low: 0x02 };
        assert_eq!(
            regs.to_bit_strings(8),
            ("10000001".to_string(), "00000010".to_string())
        );
    }
}
