//! # Input Acquisition Module
//!
//! Polls the analog input one conversion at a time into a fixed-capacity
//! [`AcquisitionWindow`], keeping running min/max/sum, and turns a completed window
//! into a [`WindowReport`] with the help of a [`PitchEstimator`].

use crate::config::{PeriodScale, SampleEncoding, TunerConfig};
use crate::error::SamplerError;
use crate::pitch::PitchEstimator;
use crate::tuning::{self, Pitch};
use crate::{Detection, WindowReport};

/// Single-conversion analog sampler capability.
pub trait AnalogSampler {
    /// Triggers one conversion on `channel`.
    fn start_conversion(&mut self, channel: u8);

    /// Waits (bounded) for the pending conversion and returns its result.
    fn blocking_read(&mut self) -> Result<i16, SamplerError>;
}

/// Fixed-capacity window of consecutive input samples with running statistics.
///
/// Appends stop once the window is complete; only [`reset`](Self::reset) reopens it.
/// Samples are stored raw. Min, max and sum are taken over
/// [`SampleEncoding::level`], so unsigned readings count on their `u16` scale.
#[derive(Debug, Clone)]
pub struct AcquisitionWindow {
    samples: Box<[i16]>,
    encoding: SampleEncoding,
    index: usize,
    complete: bool,
    min: i32,
    max: i32,
    sum: i64,
}

impl AcquisitionWindow {
    pub fn new(capacity: usize, encoding: SampleEncoding) -> Self {
        Self {
            samples: vec![0; capacity].into_boxed_slice(),
            encoding,
            index: 0,
            complete: capacity == 0,
            min: i32::MAX,
            max: i32::MIN,
            sum: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.samples.len()
    }

    /// Fill index in `[0, capacity]`.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Samples written so far.
    pub fn samples(&self) -> &[i16] {
        &self.samples[..self.index]
    }

    pub fn encoding(&self) -> SampleEncoding {
        self.encoding
    }

    pub fn min(&self) -> i32 {
        self.min
    }

    pub fn max(&self) -> i32 {
        self.max
    }

    pub fn sum(&self) -> i64 {
        self.sum
    }

    /// Mean of a full window. A power-of-two capacity makes this a plain shift.
    pub fn average(&self) -> i32 {
        let capacity = self.capacity();
        if capacity == 0 {
            return 0;
        }
        if capacity.is_power_of_two() {
            (self.sum >> capacity.trailing_zeros()) as i32
        } else {
            (self.sum / capacity as i64) as i32
        }
    }

    /// Appends `sample`, returning false if the window was already complete.
    pub fn push(&mut self, sample: i16) -> bool {
        if self.complete {
            return false;
        }
        let level = self.encoding.level(sample);
        self.samples[self.index] = sample;
        self.index += 1;
        self.sum += i64::from(level);
        self.min = self.min.min(level);
        self.max = self.max.max(level);
        if self.index == self.samples.len() {
            self.complete = true;
        }
        true
    }

    /// Reopens the window for a new cycle.
    pub fn reset(&mut self) {
        self.index = 0;
        self.complete = self.samples.is_empty();
        self.min = i32::MAX;
        self.max = i32::MIN;
        self.sum = 0;
    }
}

/// Converts an estimated period into the reported `(period, frequency)` pair, or
/// `None` when the period cannot describe a pitch in a window of `capacity` samples.
pub fn period_to_frequency(
    period: u32,
    sample_rate: u32,
    capacity: usize,
    scale: PeriodScale,
) -> Option<(u32, u32)> {
    if period == 0 || period as usize >= capacity {
        return None;
    }
    let (reported, frequency) = match scale {
        PeriodScale::Unity => (period, sample_rate / period),
        PeriodScale::Halved => (period >> 1, (sample_rate / period) << 1),
    };
    (reported > 0).then_some((reported, frequency))
}

/// Drives an [`AnalogSampler`] into acquisition windows.
#[derive(Debug)]
pub struct InputAcquisition<S> {
    sampler: S,
    channel: u8,
    encoding: SampleEncoding,
    sample_rate: u32,
    period_scale: PeriodScale,
}

impl<S: AnalogSampler> InputAcquisition<S> {
    pub fn new(sampler: S, config: &TunerConfig) -> Self {
        Self {
            sampler,
            channel: config.adc_channel,
            encoding: config.encoding,
            sample_rate: config.input_sample_rate,
            period_scale: config.period_scale,
        }
    }

    pub fn sampler(&self) -> &S {
        &self.sampler
    }

    pub fn sampler_mut(&mut self) -> &mut S {
        &mut self.sampler
    }

    /// Takes one sample into `window`. Returns whether the window is complete.
    ///
    /// A complete window is left untouched and no conversion is started.
    pub fn poll_once(&mut self, window: &mut AcquisitionWindow) -> Result<bool, SamplerError> {
        if window.is_complete() {
            return Ok(true);
        }
        self.sampler.start_conversion(self.channel);
        let sample = self.sampler.blocking_read()?;
        window.push(sample);
        Ok(window.is_complete())
    }

    /// Estimates the pitch of a complete window, builds its report and resets it.
    ///
    /// # Arguments
    /// * `window` - A complete acquisition window; it is empty again on return
    /// * `estimator` - Pitch estimator run over the window's raw samples
    /// * `reference` - Pitch playing while the window was captured
    ///
    /// # Returns
    /// The window's level statistics and either the period and frequency after the
    /// configured [`PeriodScale`], or [`Detection::NoPitch`] when the estimated period
    /// is 0 or not shorter than the window.
    pub fn consume_window<P>(
        &self,
        window: &mut AcquisitionWindow,
        estimator: &mut P,
        reference: Pitch,
    ) -> WindowReport
    where
        P: PitchEstimator + ?Sized,
    {
        let period = estimator.estimate_period(window.samples(), self.encoding);
        let detection = match period_to_frequency(
            period,
            self.sample_rate,
            window.capacity(),
            self.period_scale,
        ) {
            Some((reported, frequency_hz)) => {
                let exact = match self.period_scale {
                    PeriodScale::Unity => self.sample_rate as f32 / period as f32,
                    PeriodScale::Halved => 2.0 * self.sample_rate as f32 / period as f32,
                };
                Detection::Pitch {
                    period: reported,
                    frequency_hz,
                    cents: tuning::calculate_cents_deviation(
                        exact,
                        reference.frequency_hz() as f32,
                    ),
                }
            }
            None => Detection::NoPitch { raw_period: period },
        };

        let report = WindowReport {
            reference,
            min: window.min(),
            max: window.max(),
            average: window.average(),
            detection,
        };
        window.reset();
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WINDOW_CAPACITY;
    use approx::assert_abs_diff_eq;

    /// Returns a fixed value and counts conversions.
    struct ConstantSampler {
        value: i16,
        conversions: usize,
    }

    impl AnalogSampler for ConstantSampler {
        fn start_conversion(&mut self, _channel: u8) {
            self.conversions += 1;
        }

        fn blocking_read(&mut self) -> Result<i16, SamplerError> {
            Ok(self.value)
        }
    }

    fn acquisition(value: i16, config: &TunerConfig) -> InputAcquisition<ConstantSampler> {
        InputAcquisition::new(ConstantSampler { value, conversions: 0 }, config)
    }

    fn fill(acq: &mut InputAcquisition<ConstantSampler>, window: &mut AcquisitionWindow) {
        while !acq.poll_once(window).unwrap() {}
    }

    #[test]
    fn constant_window_statistics() {
        let config = TunerConfig::default();
        let mut acq = acquisition(100, &config);
        let mut window = AcquisitionWindow::new(WINDOW_CAPACITY, config.encoding);
        fill(&mut acq, &mut window);

        assert_eq!(window.index(), WINDOW_CAPACITY);
        assert!(window.is_complete());
        assert_eq!(window.min(), 100);
        assert_eq!(window.max(), 100);
        assert_eq!(window.average(), 100);

        let mut estimator = |_: &[i16], _: SampleEncoding| 0u32;
        let report = acq.consume_window(&mut window, &mut estimator, Pitch::A4);
        assert_eq!((report.min, report.max, report.average), (100, 100, 100));
        assert_eq!(window.index(), 0);
        assert!(!window.is_complete());
    }

    #[test]
    fn complete_window_is_not_appended_to() {
        let config = TunerConfig::default();
        let mut acq = acquisition(5, &config);
        let mut window = AcquisitionWindow::new(8, config.encoding);
        fill(&mut acq, &mut window);
        assert_eq!(acq.sampler().conversions, 8);

        assert!(acq.poll_once(&mut window).unwrap());
        assert_eq!(acq.sampler().conversions, 8);
        assert_eq!(window.index(), 8);
        assert!(!window.push(1));
    }

    #[test]
    fn mock_period_converts_at_input_rate() {
        let config = TunerConfig::default();
        let mut acq = acquisition(0, &config);
        let mut window = AcquisitionWindow::new(WINDOW_CAPACITY, config.encoding);
        fill(&mut acq, &mut window);

        let mut estimator = |samples: &[i16], encoding: SampleEncoding| {
            assert_eq!(samples.len(), WINDOW_CAPACITY);
            assert_eq!(encoding, SampleEncoding::SIGNED_16);
            218u32
        };
        let report = acq.consume_window(&mut window, &mut estimator, Pitch::A4);
        match report.detection {
            Detection::Pitch { period, frequency_hz, cents } => {
                assert_eq!(period, 218);
                assert_eq!(frequency_hz, 96_000 / 218);
                assert_abs_diff_eq!(cents, 1200.0 * (96_000.0f32 / 218.0 / 440.0).log2(), epsilon = 1e-3);
            }
            other => panic!("expected a pitch, got {other:?}"),
        }
    }

    #[test]
    fn zero_period_is_no_pitch() {
        let config = TunerConfig::default();
        let mut acq = acquisition(0, &config);
        let mut window = AcquisitionWindow::new(16, config.encoding);
        fill(&mut acq, &mut window);
        let mut estimator = |_: &[i16], _: SampleEncoding| 0u32;
        let report = acq.consume_window(&mut window, &mut estimator, Pitch::E5);
        assert_eq!(report.detection, Detection::NoPitch { raw_period: 0 });
        assert_eq!(report.reference, Pitch::E5);
    }

    #[test]
    fn halved_convention() {
        assert_eq!(period_to_frequency(218, 96_000, 1024, PeriodScale::Halved), Some((109, 880)));
        assert_eq!(period_to_frequency(218, 96_000, 1024, PeriodScale::Unity), Some((218, 440)));
        assert_eq!(period_to_frequency(1, 96_000, 1024, PeriodScale::Halved), None);
        assert_eq!(period_to_frequency(1024, 96_000, 1024, PeriodScale::Unity), None);
        assert_eq!(period_to_frequency(0, 96_000, 1024, PeriodScale::Unity), None);
    }

    #[test]
    fn negative_average_is_an_arithmetic_shift() {
        let mut window = AcquisitionWindow::new(4, SampleEncoding::SIGNED_16);
        for sample in [-3, -3, -3, -2] {
            window.push(sample);
        }
        assert_eq!(window.sum(), -11);
        assert_eq!(window.average(), -3);
        assert_eq!((window.min(), window.max()), (-3, -2));

        window.reset();
        assert_eq!(window.sum(), 0);
        assert_eq!(window.samples(), &[] as &[i16]);
    }

    #[test]
    fn unsigned_statistics_use_the_unsigned_scale() {
        let config = TunerConfig {
            encoding: SampleEncoding::UNSIGNED_16,
            ..TunerConfig::default()
        };
        let mut window = AcquisitionWindow::new(4, config.encoding);
        // Mid-scale +/- 0x4000: raw bit patterns 0xC000 and 0x4000.
        for reading in [0xC000u16, 0x4000, 0xC000, 0x4000] {
            window.push(reading as i16);
        }
        assert_eq!((window.min(), window.max()), (0x4000, 0xC000));
        assert_eq!(window.average(), 0x8000);

        let acq = acquisition(0, &config);
        let mut estimator = |_: &[i16], _: SampleEncoding| 0u32;
        let report = acq.consume_window(&mut window, &mut estimator, Pitch::A4);
        assert_eq!((report.min, report.max, report.average), (0x4000, 0xC000, 0x8000));
        assert_eq!(window.min(), i32::MAX);
    }
}
