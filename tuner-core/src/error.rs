//! Error types for the tuner pipeline

use std::time::Duration;

use crate::tuning::Pitch;

/// Rejected configuration values. Raised before any buffer is armed.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A rate, capacity or tick cadence was zero
    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    /// Window averages are computed with a shift
    #[error("window capacity {0} is not a power of two")]
    WindowNotPowerOfTwo(usize),

    /// No pitches to rotate through
    #[error("pitch rotation is empty")]
    EmptyRotation,

    /// A pitch cannot be represented at the output rate
    #[error("{pitch} ({frequency} Hz) is at or above the Nyquist limit of a {rate} Hz output")]
    AboveNyquist { pitch: Pitch, frequency: u32, rate: u32 },

    /// A playback slot must hold at least one whole period of every pitch
    #[error("{pitch} needs {period} samples per period, playback capacity is {capacity}")]
    PeriodExceedsCapacity { pitch: Pitch, period: usize, capacity: usize },

    /// Each pitch may appear in the rotation once
    #[error("{0} appears more than once in the pitch rotation")]
    DuplicatePitch(Pitch),

    /// Waveform scale must be positive
    #[error("tone amplitude must be positive, got {0}")]
    Amplitude(i16),

    /// Sample width outside what an i16 sample can carry
    #[error("sample encoding of {0} bits is not supported")]
    Encoding(u8),
}

/// Output pipeline errors
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum OutputError {
    /// A transfer of zero samples cannot be armed
    #[error("cannot arm a zero-length transfer")]
    EmptyTransfer,

    /// Transfer length does not fit the playback slot
    #[error("transfer length {length} exceeds playback capacity {capacity}")]
    CapacityExceeded { length: usize, capacity: usize },

    /// Start was requested before any buffer was armed
    #[error("output pipeline is not armed")]
    NotArmed,

    /// Start was requested twice
    #[error("output pipeline is already streaming")]
    AlreadyStreaming,
}

/// Analog sampler errors
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum SamplerError {
    /// No conversion result arrived within the bounded wait
    #[error("conversion did not complete within {0:?}")]
    Timeout(Duration),

    /// The sample source went away
    #[error("sample source disconnected")]
    Disconnected,
}

/// Error type for tuner pipeline operations
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TunerError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Output error: {0}")]
    Output(#[from] OutputError),

    #[error("Acquisition error: {0}")]
    Sampler(#[from] SamplerError),
}

/// Result type for tuner pipeline operations
pub type Result<T> = std::result::Result<T, TunerError>;
