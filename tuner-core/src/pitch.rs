//! # Pitch Estimation Module
//!
//! The estimator contract used by input acquisition, plus two estimators that honour it.
//!
//! An estimator receives one complete acquisition window and the encoding of its
//! samples and returns the fundamental period in samples. A period of 0 means that
//! no pitch was found; the caller never divides by it.
//!
//! ## Features
//! - YIN with a first-dip search to avoid octave errors
//! - FFT autocorrelation for comparison on the host
//! - Amplitude gating and clarity checking
//! - Parabolic interpolation before rounding to whole samples

use crate::config::{EstimatorKind, SampleEncoding};
use crate::fft::{self, Autocorrelator};

/// Windows quieter than this RMS (in normalized units) are treated as silence.
pub const AMPLITUDE_THRESHOLD: f32 = 0.01;

/// Fundamental period estimator over a window of raw samples.
pub trait PitchEstimator {
    /// Returns the period in samples, or 0 when no periodicity was found.
    fn estimate_period(&mut self, samples: &[i16], encoding: SampleEncoding) -> u32;
}

impl<F> PitchEstimator for F
where
    F: FnMut(&[i16], SampleEncoding) -> u32,
{
    fn estimate_period(&mut self, samples: &[i16], encoding: SampleEncoding) -> u32 {
        self(samples, encoding)
    }
}

/// Decodes `samples` into `out`, removes DC and returns the RMS of the result.
fn condition(samples: &[i16], encoding: SampleEncoding, out: &mut Vec<f32>) -> f32 {
    out.clear();
    out.extend(samples.iter().map(|&s| encoding.decode(s)));
    fft::remove_dc_offset(out);
    if out.is_empty() {
        return 0.0;
    }
    (out.iter().map(|&s| s * s).sum::<f32>() / out.len() as f32).sqrt()
}

/// Vertex offset of the parabola through three equally spaced points.
fn parabolic_shift(y1: f32, y2: f32, y3: f32) -> f32 {
    let denominator = y1 - 2.0 * y2 + y3;
    if denominator.abs() < f32::EPSILON {
        0.0
    } else {
        ((y1 - y3) / (2.0 * denominator)).clamp(-0.5, 0.5)
    }
}

fn round_period(period: f32) -> u32 {
    if period.is_finite() && period >= 1.0 {
        period.round() as u32
    } else {
        0
    }
}

/// YIN estimator with buffers sized once for a fixed window length.
#[derive(Debug, Clone)]
pub struct YinEstimator {
    signal: Vec<f32>,
    yin_buffer: Vec<f32>,
}

impl YinEstimator {
    /// Lower CMND values mean a clearer period; anything above is rejected as noise.
    const CLARITY_THRESHOLD: f32 = 0.1;

    pub fn new(window_len: usize) -> Self {
        Self {
            signal: Vec::with_capacity(window_len),
            yin_buffer: vec![0.0; window_len / 2],
        }
    }
}

impl PitchEstimator for YinEstimator {
    fn estimate_period(&mut self, samples: &[i16], encoding: SampleEncoding) -> u32 {
        let rms = condition(samples, encoding, &mut self.signal);
        if rms < AMPLITUDE_THRESHOLD {
            return 0;
        }

        let half = (self.signal.len() / 2).min(self.yin_buffer.len());
        if half < 4 {
            return 0;
        }
        let signal = &self.signal;
        let yin = &mut self.yin_buffer[..half];

        // Difference function
        for tau in 1..half {
            let mut diff = 0.0;
            for i in 0..half {
                let delta = signal[i] - signal[i + tau];
                diff += delta * delta;
            }
            yin[tau] = diff;
        }

        // Cumulative mean normalized difference
        let mut running_sum = 0.0;
        yin[0] = 1.0;
        for tau in 1..half {
            running_sum += yin[tau];
            if running_sum != 0.0 {
                yin[tau] *= tau as f32 / running_sum;
            } else {
                yin[tau] = 1.0;
            }
        }

        // First significant dip, then down to the bottom of that dip
        let min_val = yin.iter().skip(1).copied().fold(f32::INFINITY, f32::min);
        let threshold = min_val + 0.05;
        let Some(mut period) = (2..half).find(|&tau| yin[tau] < threshold && yin[tau] < yin[tau - 1])
        else {
            return 0;
        };
        while period + 1 < half && yin[period + 1] < yin[period] {
            period += 1;
        }

        if yin[period] > Self::CLARITY_THRESHOLD || period + 1 >= half {
            return 0;
        }

        let shift = parabolic_shift(yin[period - 1], yin[period], yin[period + 1]);
        round_period(period as f32 + shift)
    }
}

/// Autocorrelation estimator: strongest correlation peak after the first zero crossing.
#[derive(Debug)]
pub struct AutocorrelationEstimator {
    signal: Vec<f32>,
    acf: Vec<f32>,
    autocorrelator: Autocorrelator,
}

impl AutocorrelationEstimator {
    /// Peaks below this fraction of the zero-lag energy are not periodic enough.
    const MIN_PEAK_RATIO: f32 = 0.3;

    pub fn new(window_len: usize) -> Self {
        Self {
            signal: Vec::with_capacity(window_len),
            acf: vec![0.0; window_len / 2 + 1],
            autocorrelator: Autocorrelator::new(window_len),
        }
    }
}

impl PitchEstimator for AutocorrelationEstimator {
    fn estimate_period(&mut self, samples: &[i16], encoding: SampleEncoding) -> u32 {
        let rms = condition(samples, encoding, &mut self.signal);
        if rms < AMPLITUDE_THRESHOLD {
            return 0;
        }

        self.autocorrelator.compute(&self.signal, &mut self.acf);
        let acf = &self.acf;
        let energy = acf[0];
        if energy <= f32::EPSILON || acf.len() < 3 {
            return 0;
        }

        let Some(crossing) = acf.iter().position(|&r| r < 0.0) else {
            return 0;
        };
        let Some((lag, &peak)) = acf
            .iter()
            .enumerate()
            .skip(crossing)
            .take(acf.len() - 1 - crossing)
            .max_by(|a, b| a.1.total_cmp(b.1))
        else {
            return 0;
        };
        if lag == 0 || peak / energy < Self::MIN_PEAK_RATIO {
            return 0;
        }

        // Parabola opens downward here, so negate to reuse the minimum formula.
        let shift = parabolic_shift(-acf[lag - 1], -peak, -acf[lag + 1]);
        round_period(lag as f32 + shift)
    }
}

/// Estimator selected by [`EstimatorKind`], dispatched statically.
#[derive(Debug)]
pub enum Estimator {
    Yin(YinEstimator),
    Autocorrelation(AutocorrelationEstimator),
}

impl Estimator {
    pub fn build(kind: EstimatorKind, window_len: usize) -> Self {
        log::debug!("[PITCH] using {:?} estimator over {} samples", kind, window_len);
        match kind {
            EstimatorKind::Yin => Estimator::Yin(YinEstimator::new(window_len)),
            EstimatorKind::Autocorrelation => {
                Estimator::Autocorrelation(AutocorrelationEstimator::new(window_len))
            }
        }
    }
}

impl PitchEstimator for Estimator {
    fn estimate_period(&mut self, samples: &[i16], encoding: SampleEncoding) -> u32 {
        match self {
            Estimator::Yin(yin) => yin.estimate_period(samples, encoding),
            Estimator::Autocorrelation(acf) => acf.estimate_period(samples, encoding),
        }
    }
}
