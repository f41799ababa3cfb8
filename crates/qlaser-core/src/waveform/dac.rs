//! Voltage to DC DAC code conversion

use serde::{Deserialize, Serialize};

use crate::protocol::profile::mask;
use crate::report::{Event, EventKind, ReportSink};

/// DAC voltage reference source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReferenceMode {
    /// Internal reference, output range is twice the reference
    #[default]
    Internal,
    /// External reference, output range equals the reference
    External,
}

/// DAC reference settings
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DacReference {
    pub voltage: f64,
    pub mode: ReferenceMode,
}

impl Default for DacReference {
    fn default() -> Self {
        Self {
            voltage: 1.25,
            mode: ReferenceMode::Internal,
        }
    }
}

impl DacReference {
    /// Full-scale output voltage
    pub fn range(&self) -> f64 {
        match self.mode {
            ReferenceMode::Internal => 2.0 * self.voltage,
            ReferenceMode::External => self.voltage,
        }
    }
}

/// Convert `voltage` to a DAC code of `dac_bits` resolution.
///
/// The voltage is clamped to `[0, range]` and the code to `2^dac_bits - 1`;
/// every clamp is reported as a warning.
pub fn voltage_to_dac_code(
    voltage: f64,
    reference: &DacReference,
    dac_bits: u32,
    sink: &dyn ReportSink,
) -> u32 {
    let range = reference.range();
    let mut voltage = voltage;
    if voltage > range {
        sink.report(Event::warning(EventKind::Clamped {
            field: "voltage".to_string(),
            value: voltage,
            bound: range,
        }));
        voltage = range;
    } else if voltage < 0.0 || voltage.is_nan() {
        sink.report(Event::warning(EventKind::Clamped {
            field: "voltage".to_string(),
            value: voltage,
            bound: 0.0,
        }));
        voltage = 0.0;
    }

    let levels = 2f64.powi(dac_bits.min(64) as i32);
    let step = range / levels;
    let max_code = mask(dac_bits).min(u32::MAX as u64);
    let code = if step > 0.0 {
        (voltage / step).floor() as u64
    } else {
        0
    };

    if code > max_code {
        sink.report(Event::warning(EventKind::Clamped {
            field: "dac_code".to_string(),
            value: code as f64,
            bound: max_code as f64,
        }));
        return max_code as u32;
    }
    code as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::{MemorySink, NullSink, Severity};

    #[test]
    fn test_internal_overvoltage_clamps_to_full_scale() {
        let sink = MemorySink::new();
        let code = voltage_to_dac_code(5.0, &DacReference::default(), 12, &sink);
        assert_eq!(code, 4095);

        let warnings = sink.at_least(Severity::Warning);
        assert_eq!(warnings.len(), 2);
        assert_eq!(
            warnings[0].kind,
            EventKind::Clamped {
                field: "voltage".to_string(),
                value: 5.0,
                bound: 2.5
            }
        );
    }

    #[test]
    fn test_external_reference_range() {
        let reference = DacReference {
            voltage: 3.3,
            mode: ReferenceMode::External,
        };
        let sink = MemorySink::new();
        assert_eq!(voltage_to_dac_code(3.0, &reference, 12, &sink), 3723);
        assert!(sink.events().is_empty());
        assert_eq!(voltage_to_dac_code(4.0, &reference, 12, &sink), 4095);
    }

    #[test]
    fn test_negative_voltage_clamps_to_zero() {
        let sink = MemorySink::new();
        assert_eq!(voltage_to_dac_code(-1.0, &DacReference::default(), 12, &sink), 0);
        assert_eq!(sink.events().len(), 1);
    }

    #[test]
    fn test_wide_resolution_does_not_overflow() {
        let sink = MemorySink::new();
        assert_eq!(voltage_to_dac_code(2.5, &DacReference::default(), 64, &sink), u32::MAX);
        assert_eq!(voltage_to_dac_code(0.0, &DacReference::default(), 64, &sink), 0);
    }

    #[test]
    fn test_midscale() {
        let code = voltage_to_dac_code(1.25, &DacReference::default(), 12, &NullSink);
        assert_eq!(code, 2048);
    }
}
