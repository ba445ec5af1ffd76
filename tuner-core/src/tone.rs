//! # Tone Synthesis Module
//!
//! Precomputes one sine period per reference pitch and tiles it into playback buffers.
//!
//! ## Period quantization
//! A period holds `round(output_rate / frequency)` whole samples, so the tone that is
//! actually played sits at `output_rate / period_length` Hz. For A4 at 48 kHz that is
//! 109 samples, or about 440.37 Hz. This offset is expected and is reported alongside
//! the nominal frequency rather than corrected.

use serde::Serialize;

use crate::tuning::Pitch;

/// Number of whole samples spanning one cycle of `frequency_hz` at `sample_rate`,
/// rounded to the nearest integer.
pub fn period_length(sample_rate: u32, frequency_hz: u32) -> usize {
    let rate = u64::from(sample_rate);
    let freq = u64::from(frequency_hz.max(1));
    ((rate + freq / 2) / freq) as usize
}

/// Exactly one period of a sampled sine. Created once, never mutated.
#[derive(Debug, Clone, PartialEq)]
pub struct WaveformPeriod {
    samples: Box<[i16]>,
}

impl WaveformPeriod {
    /// Samples a full 0°..360° cycle in `period_length` equal phase steps.
    pub fn synthesize(period_length: usize, amplitude: i16) -> Self {
        let step_degrees = 360.0 / period_length as f32;
        let samples = (0..period_length)
            .map(|i| {
                let phase = (i as f32 * step_degrees).to_radians();
                (f32::from(amplitude) * phase.sin()).round() as i16
            })
            .collect();
        Self { samples }
    }

    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// One row of the per-pitch lookup table.
#[derive(Debug, Clone, PartialEq)]
pub struct ToneEntry {
    pub pitch: Pitch,
    pub frequency_hz: u32,
    pub period_length: usize,
    pub period: WaveformPeriod,
}

/// Result of tiling a period into a playback buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FillStats {
    pub pitch: Pitch,
    pub frequency_hz: u32,
    pub period_length: usize,
    pub full_periods: usize,
    /// `period_length * full_periods`; the transfer length of the buffer
    pub full_sample_count: usize,
}

/// Lookup table keyed by pitch, holding `(frequency, period length, waveform)`.
#[derive(Debug, Clone)]
pub struct ToneTable {
    output_sample_rate: u32,
    entries: Vec<ToneEntry>,
}

impl ToneTable {
    /// Computes the waveform period of every supported pitch.
    pub fn synthesize(output_sample_rate: u32, amplitude: i16) -> Self {
        let entries = Pitch::ALL
            .iter()
            .map(|&pitch| {
                let frequency_hz = pitch.frequency_hz();
                let period_length = period_length(output_sample_rate, frequency_hz);
                ToneEntry {
                    pitch,
                    frequency_hz,
                    period_length,
                    period: WaveformPeriod::synthesize(period_length, amplitude),
                }
            })
            .collect::<Vec<_>>();

        for entry in &entries {
            log::debug!(
                "[TONE] {} @ {} Hz -> {} samples per period",
                entry.pitch,
                entry.frequency_hz,
                entry.period_length
            );
        }

        Self { output_sample_rate, entries }
    }

    pub fn entry(&self, pitch: Pitch) -> &ToneEntry {
        &self.entries[pitch.index()]
    }

    /// Frequency actually produced for `pitch` after period quantization.
    pub fn effective_frequency(&self, pitch: Pitch) -> f32 {
        self.output_sample_rate as f32 / self.entry(pitch).period_length as f32
    }

    /// Tiles the period of `pitch` across the whole of `buffer`.
    ///
    /// Every index is written, including the tail past the last whole period; only
    /// the whole periods count towards `full_sample_count`.
    ///
    /// # Arguments
    /// * `pitch` - Reference pitch whose precomputed period is tiled
    /// * `buffer` - Playback slot to overwrite
    ///
    /// # Returns
    /// The period length and how many whole periods (and samples) fit in `buffer`.
    /// A `full_sample_count` of 0 means the slot is shorter than one period.
    pub fn fill_playback_buffer(&self, pitch: Pitch, buffer: &mut [i16]) -> FillStats {
        let entry = self.entry(pitch);
        let period = entry.period.samples();
        if period.is_empty() {
            buffer.fill(0);
        } else {
            for (slot, &sample) in buffer.iter_mut().zip(period.iter().cycle()) {
                *slot = sample;
            }
        }

        let full_periods = buffer.len().checked_div(entry.period_length).unwrap_or(0);
        FillStats {
            pitch,
            frequency_hz: entry.frequency_hz,
            period_length: entry.period_length,
            full_periods,
            full_sample_count: full_periods * entry.period_length,
        }
    }
}
