//! # Control Loop Module
//!
//! The cooperative main loop. It owns every piece of main-loop state (the tone table,
//! the output pipeline's write side, the acquisition window and the estimator) and
//! shares only the tick counters and the playback arena with interrupt context.
//!
//! One [`ControlLoop::step`] polls the input once if the window is still filling,
//! consumes the window if it is complete, and then services a pending tick. A window
//! that completed is therefore always reported before a pitch change can reset it.

use std::convert::Infallible;
use std::fmt;
use std::sync::Arc;

use crossbeam_channel::Sender;
use serde::Serialize;

use crate::acquisition::{AcquisitionWindow, AnalogSampler, InputAcquisition};
use crate::config::TunerConfig;
use crate::error::{Result, SamplerError, TunerError};
use crate::output::{
    CompletionHandler, OutputPipeline, PipelineState, StreamEngine, Transfer, TransferEngine,
};
use crate::pitch::PitchEstimator;
use crate::tick::TickState;
use crate::tone::{FillStats, ToneTable};
use crate::tuning::Pitch;
use crate::WindowReport;

/// Status emitted by the control loop.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StatusEvent {
    /// A playback buffer was generated for a new pitch.
    ToneGenerated(FillStats),
    /// An acquisition window was analysed.
    Window(WindowReport),
}

impl fmt::Display for StatusEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatusEvent::ToneGenerated(stats) => write!(
                f,
                "Generated {} samples at {} Hz. Computed period = {} samples",
                stats.full_sample_count, stats.frequency_hz, stats.period_length
            ),
            StatusEvent::Window(report) => report.fmt(f),
        }
    }
}

/// Destination for status events.
pub trait ReportSink {
    fn emit(&mut self, event: StatusEvent);
}

impl ReportSink for Vec<StatusEvent> {
    fn emit(&mut self, event: StatusEvent) {
        self.push(event);
    }
}

impl ReportSink for Sender<StatusEvent> {
    fn emit(&mut self, event: StatusEvent) {
        if self.send(event).is_err() {
            log::warn!("[CONTROL] status receiver is gone, dropping event");
        }
    }
}

impl<T: ReportSink + ?Sized> ReportSink for &mut T {
    fn emit(&mut self, event: StatusEvent) {
        (**self).emit(event);
    }
}

/// Snapshot of the control loop's progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlState {
    /// Pitch currently playing
    pub pitch: Pitch,
    /// Pitch changes since startup
    pub rotations: u64,
    /// Windows consumed since startup
    pub windows: u64,
}

pub struct ControlLoop<S, P> {
    config: TunerConfig,
    tones: ToneTable,
    output: OutputPipeline,
    acquisition: InputAcquisition<S>,
    window: AcquisitionWindow,
    estimator: P,
    ticks: Arc<TickState>,
    state: ControlState,
    last_fill: FillStats,
}

impl<S, P> ControlLoop<S, P>
where
    S: AnalogSampler,
    P: PitchEstimator,
{
    /// Validates `config`, synthesizes every period and arms the output with the
    /// first pitch of the rotation.
    pub fn new(config: TunerConfig, sampler: S, estimator: P) -> Result<Self> {
        config.validate()?;

        let tones = ToneTable::synthesize(config.output_sample_rate, config.amplitude);
        let pitch = config.initial_pitch();
        let mut output = OutputPipeline::new(config.playback_capacity);
        let last_fill = load_pitch(&tones, &mut output, pitch)?;

        log::info!(
            "[CONTROL] armed {} ({} Hz), window of {} samples at {} Hz",
            pitch,
            pitch.frequency_hz(),
            config.window_capacity,
            config.input_sample_rate
        );

        Ok(Self {
            acquisition: InputAcquisition::new(sampler, &config),
            window: AcquisitionWindow::new(config.window_capacity, config.encoding),
            ticks: Arc::new(TickState::new(config.ticks_per_second)),
            state: ControlState {
                pitch,
                rotations: 0,
                windows: 0,
            },
            config,
            tones,
            output,
            estimator,
            last_fill,
        })
    }

    pub fn config(&self) -> &TunerConfig {
        &self.config
    }

    pub fn state(&self) -> ControlState {
        self.state
    }

    pub fn pitch(&self) -> Pitch {
        self.state.pitch
    }

    pub fn window(&self) -> &AcquisitionWindow {
        &self.window
    }

    pub fn tones(&self) -> &ToneTable {
        &self.tones
    }

    pub fn output_state(&self) -> PipelineState {
        self.output.state()
    }

    pub fn sampler(&self) -> &S {
        self.acquisition.sampler()
    }

    pub fn sampler_mut(&mut self) -> &mut S {
        self.acquisition.sampler_mut()
    }

    /// Body of the tick interrupt, to hand to a [`TickTimer`](crate::tick::TickTimer).
    pub fn tick_handler(&self) -> Arc<TickState> {
        Arc::clone(&self.ticks)
    }

    /// Body of the transfer-completion interrupt.
    pub fn completion_handler(&self) -> CompletionHandler {
        self.output.completion_handler()
    }

    /// A software transfer engine reading this loop's playback arena.
    pub fn stream_engine(&self) -> StreamEngine {
        StreamEngine::new(Arc::clone(self.output.arena()))
    }

    /// Starts streaming the armed buffer and reports the generated tone.
    pub fn start_output<E, K>(&mut self, engine: &mut E, sink: &mut K) -> Result<Transfer>
    where
        E: TransferEngine + ?Sized,
        K: ReportSink + ?Sized,
    {
        let transfer = self.output.start(engine)?;
        sink.emit(StatusEvent::ToneGenerated(self.last_fill));
        Ok(transfer)
    }

    /// Runs one main-loop iteration.
    pub fn step<K>(&mut self, sink: &mut K) -> Result<()>
    where
        K: ReportSink + ?Sized,
    {
        if !self.window.is_complete() {
            self.acquisition.poll_once(&mut self.window)?;
        }

        if self.window.is_complete() {
            let pitch = self.state.pitch;
            let report =
                self.acquisition.consume_window(&mut self.window, &mut self.estimator, pitch);
            self.state.windows += 1;
            log::trace!("[ACQ] window {} -> {:?}", self.state.windows, report.detection);
            sink.emit(StatusEvent::Window(report));
        }

        if self.ticks.take_tick() {
            // Rewind only once the next pitch is armed.
            while self.ticks.second_elapsed() {
                self.rotate(sink)?;
                self.ticks.rewind_pitch_timer();
            }
        }
        Ok(())
    }

    /// Runs forever. Conversion timeouts are logged and retried; any other error ends
    /// the loop.
    pub fn run<K>(&mut self, sink: &mut K) -> Result<Infallible>
    where
        K: ReportSink + ?Sized,
    {
        log::info!("[CONTROL] entering main loop");
        loop {
            match self.step(sink) {
                Ok(()) => {}
                Err(TunerError::Sampler(SamplerError::Timeout(waited))) => {
                    log::warn!("[ACQ] conversion not ready after {:?}, retrying", waited);
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn rotate<K>(&mut self, sink: &mut K) -> Result<()>
    where
        K: ReportSink + ?Sized,
    {
        let next = self.state.pitch.next_in(&self.config.rotation);
        let stats = load_pitch(&self.tones, &mut self.output, next)?;
        self.state.pitch = next;
        self.state.rotations += 1;
        self.last_fill = stats;
        self.window.reset();

        log::info!("[CONTROL] pitch -> {} at {} ms", next, self.ticks.now_ms());
        sink.emit(StatusEvent::ToneGenerated(stats));
        Ok(())
    }
}

impl<S, P> fmt::Debug for ControlLoop<S, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControlLoop")
            .field("state", &self.state)
            .field("output", &self.output.state())
            .field("window_index", &self.window.index())
            .finish_non_exhaustive()
    }
}

fn load_pitch(tones: &ToneTable, output: &mut OutputPipeline, pitch: Pitch) -> Result<FillStats> {
    let mut stats = None;
    output.load(|buffer| {
        let fill = tones.fill_playback_buffer(pitch, buffer);
        stats = Some(fill);
        fill.full_sample_count
    })?;
    // `load` always runs the fill closure before committing.
    stats.ok_or(TunerError::Output(crate::error::OutputError::EmptyTransfer))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SampleEncoding;
    use crate::error::{ConfigError, OutputError};
    use crate::tick::{ManualTicker, TickTimer};

    struct ConstantSampler(i16);

    impl AnalogSampler for ConstantSampler {
        fn start_conversion(&mut self, _channel: u8) {}

        fn blocking_read(&mut self) -> std::result::Result<i16, SamplerError> {
            Ok(self.0)
        }
    }

    type MockEstimator = fn(&[i16], SampleEncoding) -> u32;

    fn no_pitch(_: &[i16], _: SampleEncoding) -> u32 {
        0
    }

    fn control(config: TunerConfig) -> ControlLoop<ConstantSampler, MockEstimator> {
        ControlLoop::new(config, ConstantSampler(100), no_pitch as MockEstimator).unwrap()
    }

    fn tone_events(events: &[StatusEvent]) -> Vec<Pitch> {
        events
            .iter()
            .filter_map(|e| match e {
                StatusEvent::ToneGenerated(stats) => Some(stats.pitch),
                StatusEvent::Window(_) => None,
            })
            .collect()
    }

    #[test]
    fn startup_arms_then_streams_first_pitch() {
        let mut control = control(TunerConfig::default());
        assert_eq!(control.output_state(), PipelineState::Armed);
        assert_eq!(control.pitch(), Pitch::A4);

        let mut engine = control.stream_engine();
        let mut events = Vec::new();
        let transfer = control.start_output(&mut engine, &mut events).unwrap();
        assert_eq!(transfer.length, 981);
        assert!(transfer.auto_reload);
        assert_eq!(control.output_state(), PipelineState::Streaming);
        assert_eq!(
            events[0].to_string(),
            "Generated 981 samples at 440 Hz. Computed period = 109 samples"
        );

        let err = control.start_output(&mut engine, &mut events).unwrap_err();
        assert!(matches!(err, TunerError::Output(OutputError::AlreadyStreaming)));
    }

    #[test]
    fn rotates_once_per_second_of_ticks() {
        let mut control = control(TunerConfig::default());
        let mut ticker = ManualTicker::default();
        ticker.start(control.tick_handler()).unwrap();
        let mut events = Vec::new();

        for _ in 0..15 {
            ticker.fire();
            control.step(&mut events).unwrap();
        }
        assert_eq!(control.pitch(), Pitch::A4);

        ticker.fire();
        control.step(&mut events).unwrap();
        assert_eq!(control.pitch(), Pitch::D5);

        for _ in 0..48 {
            ticker.fire();
            control.step(&mut events).unwrap();
        }
        assert_eq!(control.pitch(), Pitch::A4);
        assert_eq!(control.state().rotations, 4);
        assert_eq!(
            tone_events(&events),
            vec![Pitch::D5, Pitch::E5, Pitch::A5, Pitch::A4]
        );
    }

    #[test]
    fn lagging_loop_catches_up_without_skipping() {
        let mut control = control(TunerConfig::default());
        let ticks = control.tick_handler();
        let mut events = Vec::new();
        for _ in 0..33 {
            ticks.on_tick();
        }
        control.step(&mut events).unwrap();
        assert_eq!(control.pitch(), Pitch::E5);
        assert_eq!(ticks.ticks_since_last_pitch_change(), 1);
        assert_eq!(tone_events(&events), vec![Pitch::D5, Pitch::E5]);
    }

    #[test]
    fn complete_window_is_reported_before_pitch_change() {
        let config = TunerConfig {
            window_capacity: 4,
            ..TunerConfig::default()
        };
        let mut control = control(config);
        let ticks = control.tick_handler();
        let mut events = Vec::new();

        for _ in 0..3 {
            control.step(&mut events).unwrap();
        }
        assert!(events.is_empty());

        for _ in 0..16 {
            ticks.on_tick();
        }
        control.step(&mut events).unwrap();

        assert!(matches!(events[0], StatusEvent::Window(ref r) if r.reference == Pitch::A4));
        assert!(matches!(events[1], StatusEvent::ToneGenerated(ref s) if s.pitch == Pitch::D5));
        assert_eq!(
            events[0].to_string(),
            "min = 100, max = 100, avg = 100, no pitch detected"
        );
        assert_eq!(control.window().index(), 0);
    }

    #[test]
    fn pitch_change_discards_partial_window() {
        let config = TunerConfig {
            window_capacity: 8,
            ..TunerConfig::default()
        };
        let mut control = control(config);
        let ticks = control.tick_handler();
        let mut events = Vec::new();

        control.step(&mut events).unwrap();
        control.step(&mut events).unwrap();
        assert_eq!(control.window().index(), 2);

        for _ in 0..16 {
            ticks.on_tick();
        }
        control.step(&mut events).unwrap();
        assert_eq!(control.window().index(), 0);
        assert_eq!(control.state().windows, 0);
    }

    #[test]
    fn rotation_follows_configured_order() {
        let config = TunerConfig {
            rotation: vec![Pitch::E5, Pitch::A4],
            ..TunerConfig::default()
        };
        let mut control = control(config);
        assert_eq!(control.pitch(), Pitch::E5);
        let ticks = control.tick_handler();
        let mut events = Vec::new();
        for expected in [Pitch::A4, Pitch::E5, Pitch::A4] {
            for _ in 0..16 {
                ticks.on_tick();
            }
            control.step(&mut events).unwrap();
            assert_eq!(control.pitch(), expected);
        }
    }

    #[test]
    fn buffer_shorter_than_a_period_is_rejected() {
        let config = TunerConfig {
            playback_capacity: 64,
            ..TunerConfig::default()
        };
        let err = ControlLoop::new(config, ConstantSampler(0), no_pitch as MockEstimator)
            .unwrap_err();
        assert_eq!(
            err,
            TunerError::Config(ConfigError::PeriodExceedsCapacity {
                pitch: Pitch::A4,
                period: 109,
                capacity: 64,
            })
        );
    }

    #[test]
    fn later_pitch_too_long_for_buffer_is_rejected_at_startup() {
        let config = TunerConfig {
            playback_capacity: 60,
            rotation: vec![Pitch::A5, Pitch::A4],
            ..TunerConfig::default()
        };
        let err = ControlLoop::new(config, ConstantSampler(0), no_pitch as MockEstimator)
            .unwrap_err();
        assert!(matches!(
            err,
            TunerError::Config(ConfigError::PeriodExceedsCapacity { pitch: Pitch::A4, .. })
        ));
    }

    #[test]
    fn repeated_pitch_in_rotation_is_rejected() {
        let config = TunerConfig {
            rotation: vec![Pitch::A4, Pitch::D5, Pitch::A4, Pitch::E5],
            ..TunerConfig::default()
        };
        let err = ControlLoop::new(config, ConstantSampler(0), no_pitch as MockEstimator)
            .unwrap_err();
        assert_eq!(err, TunerError::Config(ConfigError::DuplicatePitch(Pitch::A4)));
    }

    #[test]
    fn every_configured_pitch_plays_over_a_full_cycle() {
        let config = TunerConfig {
            rotation: vec![Pitch::A5, Pitch::D5, Pitch::A4, Pitch::E5],
            ..TunerConfig::default()
        };
        let mut control = control(config);
        let ticks = control.tick_handler();
        let mut events = Vec::new();
        for _ in 0..4 * 16 {
            ticks.on_tick();
            control.step(&mut events).unwrap();
        }
        assert_eq!(
            tone_events(&events),
            vec![Pitch::D5, Pitch::A4, Pitch::E5, Pitch::A5]
        );
        assert_eq!(ticks.ticks_since_last_pitch_change(), 0);
    }

    #[test]
    fn status_events_reach_a_channel() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let mut control = control(TunerConfig::default());
        let mut engine = control.stream_engine();
        let mut sink = tx;
        control.start_output(&mut engine, &mut sink).unwrap();
        let event = rx.try_recv().unwrap();
        assert!(matches!(event, StatusEvent::ToneGenerated(s) if s.pitch == Pitch::A4));
    }
}
