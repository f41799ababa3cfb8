//! Waveform Synthesis
//!
//! Evaluates the normalized polynomial pulse shape and quantizes it into
//! waveform RAM samples.
//!
//! The shape polynomial has no constant term: coefficient `k - 1` multiplies
//! `x^k`. The sum is divided by `degree + 1` and scaled by `2^(addr_bits - 1)`,
//! so coefficients summing to at most `degree + 1` keep `x` in `[0, 1]` inside
//! the lower half of the sample range.

mod dac;

pub use dac::{voltage_to_dac_code, DacReference, ReferenceMode};

use serde::{Deserialize, Serialize};

use crate::protocol::profile::mask;
use crate::protocol::ProtocolProfile;
use crate::report::{Event, EventKind, ReportSink};

/// One waveform RAM sample
pub type WaveSample = u32;

/// Parameters of a rise / hold / fall pulse
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PulseShape {
    /// Tick at which the rise begins
    pub start_time: i64,
    /// Length of the unscaled rise edge in samples
    pub rise_ticks: u32,
    /// Step through the rise per tick
    pub time_factor: f64,
    /// Ticks held at the peak between rise and fall
    pub hold_ticks: u32,
    /// Amplitude scale
    pub gain: f64,
    /// Shape polynomial coefficients, power 1 upward
    pub coefficients: Vec<f64>,
}

impl PulseShape {
    /// Ticks spent on one edge: `ceil((rise_ticks - 1) / time_factor)`
    pub fn edge_ticks(&self) -> f64 {
        ((self.rise_ticks as f64 - 1.0) / self.time_factor).ceil()
    }

    /// Total ticks from the start of the rise to the end of the fall
    pub fn duration(&self) -> f64 {
        2.0 * self.edge_ticks() + self.hold_ticks as f64 - 1.0
    }
}

/// Polynomial evaluator for one sample width
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Synthesizer {
    addr_bits: u32,
}

impl Synthesizer {
    pub fn new(addr_bits: u32) -> Self {
        Self { addr_bits }
    }

    pub fn for_profile(profile: &ProtocolProfile) -> Self {
        Self::new(profile.addr_bits)
    }

    /// Largest sample the waveform RAM can hold
    pub fn max_sample(&self) -> WaveSample {
        mask(self.addr_bits).min(WaveSample::MAX as u64) as WaveSample
    }

    /// `sum(c[k-1] * x^k, k = 1..=degree) / (degree + 1) * 2^(addr_bits - 1)`
    pub fn evaluate_polynomial(&self, degree: usize, x: f64, coefficients: &[f64]) -> f64 {
        let sum: f64 = coefficients
            .iter()
            .take(degree)
            .enumerate()
            .map(|(i, c)| c * x.powi(i as i32 + 1))
            .sum();
        sum / (degree as f64 + 1.0) * 2f64.powi(self.addr_bits.saturating_sub(1) as i32)
    }

    /// Pulse value at `current_time`.
    ///
    /// With `w = ceil((rise - 1) / time_factor)` and `rel = current_time - start_time`:
    /// rise for `0 <= rel < w`, hold for `w <= rel < w + hold`, fall for
    /// `w + hold <= rel < 2w + hold - 1`, zero elsewhere.
    pub fn pulse_shape_value(&self, shape: &PulseShape, current_time: i64) -> f64 {
        let rel = (current_time - shape.start_time) as f64;
        let width = shape.edge_ticks();
        let hold = shape.hold_ticks as f64;

        let x = if 0.0 <= rel && rel < width {
            rel * shape.time_factor
        } else if width <= rel && rel < width + hold {
            shape.rise_ticks as f64 - 1.0
        } else if width + hold <= rel && rel < 2.0 * width + hold - 1.0 {
            (2.0 * width + hold - rel - 1.0) * shape.time_factor
        } else {
            0.0
        };

        self.evaluate_polynomial(
            shape.coefficients.len(),
            x / shape.rise_ticks as f64,
            &shape.coefficients,
        ) * shape.gain
    }

    /// Quantize the rise edge into `wave_length` samples, padded to even length.
    ///
    /// Negative values become 0. Values above the sample width are kept and
    /// reported; the table writer decides what to do with them.
    pub fn synthesize_table(
        &self,
        wave_length: usize,
        coefficients: &[f64],
        sink: &dyn ReportSink,
    ) -> Vec<WaveSample> {
        let degree = coefficients.len();
        let mut samples: Vec<WaveSample> = (0..wave_length)
            .map(|i| {
                let value = self
                    .evaluate_polynomial(degree, i as f64 / wave_length as f64, coefficients)
                    .trunc();
                if value <= 0.0 {
                    0
                } else {
                    value.min(u32::MAX as f64) as WaveSample
                }
            })
            .collect();

        if let Some((index, &peak)) = samples.iter().enumerate().max_by_key(|(_, &s)| s) {
            if peak > self.max_sample() {
                sink.report(Event::warning(EventKind::OutOfRange {
                    field: format!("samples[{}]", index),
                    value: peak as i64,
                    bound: self.max_sample() as i64,
                }));
            }
        }

        if wave_length % 2 != 0 {
            samples.push(0);
        }
        samples
    }
}

impl Default for Synthesizer {
    fn default() -> Self {
        Self::new(16)
    }
}
