//! # Simulation Board Module
//!
//! A deterministic stand-in for the reference board. The analog output is wired back to
//! the analog input through an [`AnalogLine`], and a discrete-event driver
//! ([`Simulation`]) owns virtual time. Between two main-loop iterations it fires every
//! sample-clock and tick interrupt that has fallen due, in time order, so a run is
//! reproducible down to the sample.
//!
//! Event times are exact rationals (`index / rate`) compared in integer arithmetic;
//! there is no accumulated rounding drift.

use std::convert::Infallible;
use std::sync::Arc;
use std::sync::atomic::{AtomicI16, Ordering};
use std::time::Duration;

use crate::acquisition::AnalogSampler;
use crate::config::TunerConfig;
use crate::control::{ControlLoop, ReportSink};
use crate::error::{Result, SamplerError};
use crate::output::{CompletionHandler, PipelineState, SampleRateTimer, StreamEngine};
use crate::pitch::PitchEstimator;
use crate::tick::{ManualTicker, TickTimer};

/// The wire between the analog output and the analog input.
#[derive(Debug, Clone, Default)]
pub struct AnalogLine(Arc<AtomicI16>);

impl AnalogLine {
    pub fn set(&self, sample: i16) {
        self.0.store(sample, Ordering::Release);
    }

    pub fn get(&self) -> i16 {
        self.0.load(Ordering::Acquire)
    }
}

/// Analog sampler reading an [`AnalogLine`].
///
/// The line is latched when the conversion starts. `blocking_read` spins for the
/// configured latency before returning, like the reference board's busy-wait on the
/// conversion-complete flag.
#[derive(Debug)]
pub struct LoopbackSampler {
    line: AnalogLine,
    latency_spins: u32,
    pending: Option<i16>,
    conversions: u64,
    last_channel: Option<u8>,
}

impl LoopbackSampler {
    pub fn new(line: AnalogLine) -> Self {
        Self {
            line,
            latency_spins: 0,
            pending: None,
            conversions: 0,
            last_channel: None,
        }
    }

    pub fn with_latency(mut self, spins: u32) -> Self {
        self.latency_spins = spins;
        self
    }

    pub fn conversions(&self) -> u64 {
        self.conversions
    }

    pub fn last_channel(&self) -> Option<u8> {
        self.last_channel
    }
}

impl AnalogSampler for LoopbackSampler {
    fn start_conversion(&mut self, channel: u8) {
        self.pending = Some(self.line.get());
        self.last_channel = Some(channel);
        self.conversions += 1;
    }

    fn blocking_read(&mut self) -> std::result::Result<i16, SamplerError> {
        for _ in 0..self.latency_spins {
            std::hint::spin_loop();
        }
        // Reading without a started conversion never completes on hardware.
        self.pending.take().ok_or(SamplerError::Timeout(Duration::ZERO))
    }
}

/// Analog sampler backed by a closure, one call per conversion.
pub struct FnSampler<F>(F);

impl<F> FnSampler<F>
where
    F: FnMut() -> i16,
{
    pub fn new(source: F) -> Self {
        Self(source)
    }
}

impl<F> AnalogSampler for FnSampler<F>
where
    F: FnMut() -> i16,
{
    fn start_conversion(&mut self, _channel: u8) {}

    fn blocking_read(&mut self) -> std::result::Result<i16, SamplerError> {
        Ok((self.0)())
    }
}

/// Sample-rate timer of the simulated board. Gates the stream engine.
#[derive(Debug, Default)]
pub struct SimSampleClock {
    period: Option<Duration>,
    running: bool,
}

impl SimSampleClock {
    pub fn period(&self) -> Option<Duration> {
        self.period
    }

    pub fn is_running(&self) -> bool {
        self.running
    }
}

impl SampleRateTimer for SimSampleClock {
    type Error = Infallible;

    fn configure(&mut self, period: Duration) {
        self.period = Some(period);
    }

    fn start(&mut self) -> std::result::Result<(), Self::Error> {
        self.running = true;
        Ok(())
    }
}

/// Exact due check for event `index` of a `rate` Hz event stream at main-loop step
/// `step` of a `step_rate` Hz loop.
fn is_due(index: u64, rate: u32, step: u64, step_rate: u32) -> bool {
    u128::from(index) * u128::from(step_rate) <= u128::from(step) * u128::from(rate)
}

/// Discrete-event driver for a loopback board running the real control loop.
///
/// Main-loop iteration `k` runs at virtual time `k / input_rate`. Before it runs, every
/// output sample and tick due at or before that time is fired, output samples first.
pub struct Simulation<P> {
    control: ControlLoop<LoopbackSampler, P>,
    engine: StreamEngine,
    completion: CompletionHandler,
    clock: SimSampleClock,
    ticker: ManualTicker,
    line: AnalogLine,
    output_rate: u32,
    input_rate: u32,
    ticks_per_second: u32,
    steps: u64,
    samples_out: u64,
    ticks_fired: u64,
}

impl<P: PitchEstimator> Simulation<P> {
    /// Builds a board whose analog output feeds its analog input.
    pub fn loopback(config: TunerConfig, estimator: P) -> Result<Self> {
        Self::with_sampler(config, estimator, LoopbackSampler::new)
    }

    /// Like [`loopback`](Self::loopback) with a custom-built sampler on the same line.
    pub fn with_sampler<F>(config: TunerConfig, estimator: P, build: F) -> Result<Self>
    where
        F: FnOnce(AnalogLine) -> LoopbackSampler,
    {
        let line = AnalogLine::default();
        let output_rate = config.output_sample_rate;
        let input_rate = config.input_sample_rate;
        let ticks_per_second = config.ticks_per_second;

        let control = ControlLoop::new(config, build(line.clone()), estimator)?;
        let engine = control.stream_engine();
        let completion = control.completion_handler();

        let mut ticker = ManualTicker::default();
        let ticks = control.tick_handler();
        ticker.configure(ticks.interval());
        let Ok(()) = ticker.start(ticks);

        let mut clock = SimSampleClock::default();
        clock.configure(Duration::from_secs(1) / output_rate);

        log::debug!(
            "[SIM] loopback board: output {} Hz, input {} Hz, {} ticks/s",
            output_rate,
            input_rate,
            ticks_per_second
        );

        Ok(Self {
            control,
            engine,
            completion,
            clock,
            ticker,
            line,
            output_rate,
            input_rate,
            ticks_per_second,
            steps: 0,
            samples_out: 0,
            ticks_fired: 0,
        })
    }

    /// Starts the output stream and the sample clock. Idempotent once streaming.
    pub fn start<K>(&mut self, sink: &mut K) -> Result<()>
    where
        K: ReportSink + ?Sized,
    {
        if self.control.output_state() == PipelineState::Armed {
            self.control.start_output(&mut self.engine, sink)?;
            let Ok(()) = self.clock.start();
        }
        Ok(())
    }

    /// Runs main-loop iterations until `duration` of virtual time has passed.
    pub fn run_for<K>(&mut self, duration: Duration, sink: &mut K) -> Result<()>
    where
        K: ReportSink + ?Sized,
    {
        self.start(sink)?;
        let budget = duration.as_nanos() * u128::from(self.input_rate) / 1_000_000_000;
        let end = self.steps.saturating_add(u64::try_from(budget).unwrap_or(u64::MAX));
        while self.steps < end {
            self.fire_due_events();
            self.control.step(sink)?;
            self.steps += 1;
        }
        Ok(())
    }

    fn fire_due_events(&mut self) {
        if self.clock.is_running() {
            while is_due(self.samples_out + 1, self.output_rate, self.steps, self.input_rate) {
                self.samples_out += 1;
                if let Some(sample) = self.engine.service(&self.completion) {
                    self.line.set(sample);
                }
            }
        }
        while is_due(self.ticks_fired + 1, self.ticks_per_second, self.steps, self.input_rate) {
            self.ticks_fired += 1;
            self.ticker.fire();
        }
    }

    /// Virtual time elapsed.
    pub fn now(&self) -> Duration {
        let nanos = u128::from(self.steps) * 1_000_000_000 / u128::from(self.input_rate);
        Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
    }

    pub fn control(&self) -> &ControlLoop<LoopbackSampler, P> {
        &self.control
    }

    pub fn engine(&self) -> &StreamEngine {
        &self.engine
    }

    pub fn clock(&self) -> &SimSampleClock {
        &self.clock
    }

    pub fn line(&self) -> &AnalogLine {
        &self.line
    }

    pub fn ticks_fired(&self) -> u64 {
        self.ticks_fired
    }

    pub fn samples_out(&self) -> u64 {
        self.samples_out
    }
}
