//! # Configuration Module
//!
//! The compile-time configuration table of the tuner and the [`TunerConfig`] record
//! built from it. Every component reads its rates and capacities from a validated
//! `TunerConfig`; nothing is re-checked at runtime.

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::tone::period_length;
use crate::tuning::Pitch;

/// Rate at which the playback buffer is streamed to the analog output.
pub const OUTPUT_SAMPLE_RATE_HZ: u32 = 48_000;

/// Rate at which the analog input is polled.
pub const INPUT_SAMPLE_RATE_HZ: u32 = 96_000;

/// Samples per playback slot.
pub const PLAYBACK_CAPACITY: usize = 1024;

/// Samples per acquisition window. Must stay a power of two.
pub const WINDOW_CAPACITY: usize = 1024;

/// Tick scheduler cadence.
pub const TICKS_PER_SECOND: u32 = 16;

/// Peak magnitude of the synthesized sine (fixed-point sine scale of a 12-bit DAC).
pub const TONE_AMPLITUDE: i16 = 2037;

/// Analog input channel sampled by the acquisition loop.
pub const ADC_CHANNEL: u8 = 23;

/// Bit width and signedness of acquired samples, passed to the pitch estimator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleEncoding {
    pub bits: u8,
    pub signed: bool,
}

impl SampleEncoding {
    pub const SIGNED_16: SampleEncoding = SampleEncoding { bits: 16, signed: true };
    pub const UNSIGNED_16: SampleEncoding = SampleEncoding { bits: 16, signed: false };

    /// Widths outside `2..=16` are clamped; [`TunerConfig::validate`] rejects them.
    fn half_scale(self) -> f32 {
        let bits = self.bits.clamp(2, 16);
        f32::from(1u16 << (bits - 1))
    }

    /// Level of a raw sample on this encoding's own scale, used for window statistics.
    ///
    /// Signed samples keep their value; unsigned samples read as `0..=u16::MAX`.
    pub fn level(self, raw: i16) -> i32 {
        if self.signed {
            i32::from(raw)
        } else {
            i32::from(raw as u16)
        }
    }

    /// Converts a raw sample to a zero-centred value in `[-1.0, 1.0)`.
    ///
    /// Unsigned samples travel as the bit pattern of their `u16` reading.
    pub fn decode(self, raw: i16) -> f32 {
        let half = self.half_scale();
        if self.signed {
            raw as f32 / half
        } else {
            (raw as u16 as f32 - half) / half
        }
    }

    /// Converts a value in `[-1.0, 1.0]` to a raw sample of this encoding.
    pub fn quantize(self, value: f32) -> i16 {
        let half = self.half_scale();
        let value = value.clamp(-1.0, 1.0);
        if self.signed {
            (value * (half - 1.0)).round() as i16
        } else {
            let max = (2.0 * half) - 1.0;
            ((value + 1.0) * half).round().min(max) as u16 as i16
        }
    }
}

impl Default for SampleEncoding {
    fn default() -> Self {
        SampleEncoding::SIGNED_16
    }
}

/// How the estimator's period is turned into the reported period and frequency.
///
/// `Unity` reports the period as returned and `rate / period`. `Halved` reports
/// `period >> 1` and `(rate / period) << 1`, for estimators that count periods in
/// half-samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeriodScale {
    #[default]
    Unity,
    Halved,
}

/// Which pitch estimator the application wires in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EstimatorKind {
    #[default]
    Yin,
    Autocorrelation,
}

/// Tuner configuration parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TunerConfig {
    /// Output stream rate in Hz (default: 48000)
    pub output_sample_rate: u32,

    /// Input polling rate in Hz (default: 96000)
    pub input_sample_rate: u32,

    /// Samples per playback slot (default: 1024)
    pub playback_capacity: usize,

    /// Samples per acquisition window, power of two (default: 1024)
    pub window_capacity: usize,

    /// Tick scheduler cadence (default: 16)
    pub ticks_per_second: u32,

    /// Pitch rotation order; the first entry plays at startup
    pub rotation: Vec<Pitch>,

    /// Peak magnitude of the synthesized sine (default: 2037)
    pub amplitude: i16,

    /// Analog input channel (default: 23)
    pub adc_channel: u8,

    /// Encoding of acquired samples (default: signed 16-bit)
    pub encoding: SampleEncoding,

    /// Period-to-frequency convention (default: unity)
    pub period_scale: PeriodScale,

    /// Pitch estimator used by the application (default: YIN)
    pub estimator: EstimatorKind,
}

impl Default for TunerConfig {
    fn default() -> Self {
        Self {
            output_sample_rate: OUTPUT_SAMPLE_RATE_HZ,
            input_sample_rate: INPUT_SAMPLE_RATE_HZ,
            playback_capacity: PLAYBACK_CAPACITY,
            window_capacity: WINDOW_CAPACITY,
            ticks_per_second: TICKS_PER_SECOND,
            rotation: Pitch::ALL.to_vec(),
            amplitude: TONE_AMPLITUDE,
            adc_channel: ADC_CHANNEL,
            encoding: SampleEncoding::default(),
            period_scale: PeriodScale::default(),
            estimator: EstimatorKind::default(),
        }
    }
}

impl TunerConfig {
    /// Checks the invariants every component relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let nonzero = [
            ("output_sample_rate", self.output_sample_rate as usize),
            ("input_sample_rate", self.input_sample_rate as usize),
            ("playback_capacity", self.playback_capacity),
            ("window_capacity", self.window_capacity),
            ("ticks_per_second", self.ticks_per_second as usize),
        ];
        if let Some(&(field, _)) = nonzero.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::Zero(field));
        }
        if !self.window_capacity.is_power_of_two() {
            return Err(ConfigError::WindowNotPowerOfTwo(self.window_capacity));
        }
        if self.rotation.is_empty() {
            return Err(ConfigError::EmptyRotation);
        }
        for (i, &pitch) in self.rotation.iter().enumerate() {
            if self.rotation[..i].contains(&pitch) {
                return Err(ConfigError::DuplicatePitch(pitch));
            }
            if pitch.frequency_hz() * 2 >= self.output_sample_rate {
                return Err(ConfigError::AboveNyquist {
                    pitch,
                    frequency: pitch.frequency_hz(),
                    rate: self.output_sample_rate,
                });
            }
            let period = period_length(self.output_sample_rate, pitch.frequency_hz());
            if period > self.playback_capacity {
                return Err(ConfigError::PeriodExceedsCapacity {
                    pitch,
                    period,
                    capacity: self.playback_capacity,
                });
            }
        }
        if self.amplitude <= 0 {
            return Err(ConfigError::Amplitude(self.amplitude));
        }
        if !(2..=16).contains(&self.encoding.bits) {
            return Err(ConfigError::Encoding(self.encoding.bits));
        }
        Ok(())
    }

    /// The pitch entered at startup.
    pub fn initial_pitch(&self) -> Pitch {
        self.rotation.first().copied().unwrap_or(Pitch::A4)
    }
}
