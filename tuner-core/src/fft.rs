//! # FFT Module
//!
//! Signal conditioning and FFT-accelerated autocorrelation for the pitch estimators.
//!
//! ## Features
//! - DC offset removal
//! - Autocorrelation as `IFFT(|FFT(x)|²)` with plans and scratch allocated once

use std::sync::Arc;

use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};

/// Removes the DC offset from a signal by making its average value zero.
pub(crate) fn remove_dc_offset(signal: &mut [f32]) {
    let len = signal.len();
    if len == 0 {
        return;
    }
    let avg = signal.iter().sum::<f32>() / len as f32;
    if avg.abs() > 1e-6 {
        for sample in signal.iter_mut() {
            *sample -= avg;
        }
    }
}

/// Computes the linear (zero-padded) autocorrelation of fixed-length frames.
pub struct Autocorrelator {
    frame_len: usize,
    forward: Arc<dyn Fft<f32>>,
    inverse: Arc<dyn Fft<f32>>,
    buffer: Vec<Complex<f32>>,
    scratch: Vec<Complex<f32>>,
}

impl std::fmt::Debug for Autocorrelator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Autocorrelator")
            .field("frame_len", &self.frame_len)
            .field("fft_len", &self.buffer.len())
            .finish()
    }
}

impl Autocorrelator {
    pub fn new(frame_len: usize) -> Self {
        // Padding to at least twice the frame keeps the circular correlation linear.
        let fft_len = (2 * frame_len.max(1)).next_power_of_two();
        let mut planner = FftPlanner::new();
        let forward = planner.plan_fft_forward(fft_len);
        let inverse = planner.plan_fft_inverse(fft_len);
        let scratch_len = forward
            .get_inplace_scratch_len()
            .max(inverse.get_inplace_scratch_len());
        Self {
            frame_len,
            forward,
            inverse,
            buffer: vec![Complex::new(0.0, 0.0); fft_len],
            scratch: vec![Complex::new(0.0, 0.0); scratch_len],
        }
    }

    pub fn frame_len(&self) -> usize {
        self.frame_len
    }

    /// Writes `acf[lag]` for `lag` in `0..out.len()` into `out`.
    ///
    /// `signal` is truncated or zero-padded to the frame length.
    ///
    /// # Arguments
    /// * `signal` - DC-free input samples
    /// * `out` - Destination for the autocorrelation, one lag per element
    pub fn compute(&mut self, signal: &[f32], out: &mut [f32]) {
        let fft_len = self.buffer.len();
        for (i, bin) in self.buffer.iter_mut().enumerate() {
            let sample = if i < self.frame_len {
                signal.get(i).copied().unwrap_or(0.0)
            } else {
                0.0
            };
            *bin = Complex::new(sample, 0.0);
        }

        self.forward
            .process_with_scratch(&mut self.buffer, &mut self.scratch);
        for bin in self.buffer.iter_mut() {
            *bin = Complex::new(bin.norm_sqr(), 0.0);
        }
        self.inverse
            .process_with_scratch(&mut self.buffer, &mut self.scratch);

        let scale = 1.0 / fft_len as f32;
        for (lag, value) in out.iter_mut().enumerate() {
            *value = self.buffer.get(lag).map_or(0.0, |c| c.re * scale);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn dc_offset_is_removed() {
        let mut signal = vec![1.5, 2.5, 1.5, 2.5];
        remove_dc_offset(&mut signal);
        assert_abs_diff_eq!(signal.iter().sum::<f32>(), 0.0, epsilon = 1e-6);
        assert_abs_diff_eq!(signal[0], -0.5, epsilon = 1e-6);
    }

    #[test]
    fn matches_direct_autocorrelation() {
        let signal: Vec<f32> = (0..64).map(|i| ((i * 7) % 11) as f32 - 5.0).collect();
        let mut acf = Autocorrelator::new(signal.len());
        let mut out = vec![0.0; 32];
        acf.compute(&signal, &mut out);

        for (lag, &value) in out.iter().enumerate() {
            let direct: f32 = (0..signal.len() - lag)
                .map(|i| signal[i] * signal[i + lag])
                .sum();
            assert_abs_diff_eq!(value, direct, epsilon = 0.5);
        }
    }
}
