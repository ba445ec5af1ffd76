// tuner-core/src/lib.rs

//! The core logic of the reference-tone tuner.
//! This crate plays a rotating set of reference pitches through a double-buffered,
//! interrupt-reloaded output pipeline, samples the analog input into fixed windows,
//! and reports the period a pitch estimator finds in each window. It is headless;
//! board backends plug in through the timer, transfer and sampler traits.

pub mod acquisition;
pub mod audio;
pub mod config;
pub mod control;
pub mod error;
pub mod fft;
pub mod output;
pub mod pitch;
pub mod sim;
pub mod tick;
pub mod tone;
pub mod tuning;

use std::fmt;

use serde::Serialize;

use crate::tuning::Pitch;

/// Outcome of pitch estimation on one window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Detection {
    /// A usable period, already converted by the configured period scale.
    Pitch {
        period: u32,
        frequency_hz: u32,
        /// Deviation of the detected frequency from the reference pitch.
        cents: f32,
    },
    /// The estimator found nothing usable. `raw_period` is what it returned.
    NoPitch { raw_period: u32 },
}

impl Detection {
    pub fn frequency_hz(&self) -> Option<u32> {
        match self {
            Detection::Pitch { frequency_hz, .. } => Some(*frequency_hz),
            Detection::NoPitch { .. } => None,
        }
    }
}

/// Represents the result of a single acquisition window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WindowReport {
    /// Pitch being played while the window was captured.
    pub reference: Pitch,
    /// Lowest sample level in the window.
    pub min: i32,
    pub max: i32,
    pub average: i32,
    pub detection: Detection,
}

impl fmt::Display for WindowReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "min = {}, max = {}, avg = {}, ", self.min, self.max, self.average)?;
        match self.detection {
            Detection::Pitch { period, frequency_hz, .. } => {
                write!(f, "period = {period} samples, frequency = {frequency_hz} Hz")
            }
            Detection::NoPitch { .. } => write!(f, "no pitch detected"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_lines() {
        let mut report = WindowReport {
            reference: Pitch::A4,
            min: -2037,
            max: 2037,
            average: 0,
            detection: Detection::Pitch { period: 218, frequency_hz: 440, cents: 1.4 },
        };
        assert_eq!(
            report.to_string(),
            "min = -2037, max = 2037, avg = 0, period = 218 samples, frequency = 440 Hz"
        );

        report.detection = Detection::NoPitch { raw_period: 0 };
        assert_eq!(report.to_string(), "min = -2037, max = 2037, avg = 0, no pitch detected");
        assert_eq!(report.detection.frequency_hz(), None);
    }
}
