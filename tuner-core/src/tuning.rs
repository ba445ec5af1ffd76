//! # Musical Tuning Module
//!
//! This module defines the reference pitches the tuner plays and the small amount of
//! musical arithmetic needed to describe a measurement against them.
//!
//! ## Features
//! - The fixed reference set used for guitar tuning practice (A4, D5, E5, A5)
//! - Round-robin rotation through a configurable ordering of that set
//! - Cent deviation between a measured and a reference frequency

use serde::{Deserialize, Serialize};
use std::fmt;

/// A reference pitch the tone synthesizer can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Pitch {
    A4,
    D5,
    E5,
    A5,
}

impl Pitch {
    /// Every supported pitch, in rotation order.
    pub const ALL: [Pitch; 4] = [Pitch::A4, Pitch::D5, Pitch::E5, Pitch::A5];

    /// Nominal frequency in whole Hz.
    pub const fn frequency_hz(self) -> u32 {
        match self {
            Pitch::A4 => 440,
            Pitch::D5 => 587,
            Pitch::E5 => 659,
            Pitch::A5 => 880,
        }
    }

    /// Note name (e.g. "A4").
    pub const fn name(self) -> &'static str {
        match self {
            Pitch::A4 => "A4",
            Pitch::D5 => "D5",
            Pitch::E5 => "E5",
            Pitch::A5 => "A5",
        }
    }

    /// Position of this pitch in [`Pitch::ALL`], used to key per-pitch tables.
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Returns the pitch that follows `self` in `rotation`, wrapping at the end.
    ///
    /// A pitch that is not part of `rotation` restarts the cycle at its first entry.
    /// An empty rotation leaves the pitch unchanged.
    pub fn next_in(self, rotation: &[Pitch]) -> Pitch {
        match rotation.iter().position(|&p| p == self) {
            Some(i) => rotation[(i + 1) % rotation.len()],
            None => rotation.first().copied().unwrap_or(self),
        }
    }
}

impl fmt::Display for Pitch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Calculates the deviation from a target frequency in cents.
///
/// Cents are a logarithmic unit of pitch measurement where:
/// - 100 cents = 1 semitone
/// - 1200 cents = 1 octave
/// - Positive values indicate sharpness, negative values indicate flatness
pub fn calculate_cents_deviation(freq: f32, target_freq: f32) -> f32 {
    1200.0 * (freq / target_freq).log2()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn rotation_follows_the_fixed_cycle() {
        let mut pitch = Pitch::A4;
        let mut seen = Vec::new();
        for _ in 0..4 {
            pitch = pitch.next_in(&Pitch::ALL);
            seen.push(pitch);
        }
        assert_eq!(seen, vec![Pitch::D5, Pitch::E5, Pitch::A5, Pitch::A4]);
    }

    #[test]
    fn pitch_outside_rotation_restarts_cycle() {
        let rotation = [Pitch::E5, Pitch::A5];
        assert_eq!(Pitch::A4.next_in(&rotation), Pitch::E5);
        assert_eq!(Pitch::A5.next_in(&rotation), Pitch::E5);
        assert_eq!(Pitch::D5.next_in(&[]), Pitch::D5);
    }

    #[test]
    fn cents_are_signed_and_logarithmic() {
        assert_abs_diff_eq!(calculate_cents_deviation(880.0, 440.0), 1200.0, epsilon = 1e-3);
        assert_abs_diff_eq!(calculate_cents_deviation(440.0, 440.0), 0.0, epsilon = 1e-6);
        assert!(calculate_cents_deviation(435.0, 440.0) < 0.0);
    }

    #[test]
    fn names_match_display() {
        for pitch in Pitch::ALL {
            assert_eq!(pitch.to_string(), pitch.name());
            assert_eq!(Pitch::ALL[pitch.index()], pitch);
        }
    }
}
