//! # Tuner - Reference Tone Player and Pitch Monitor
//!
//! Plays each reference pitch for one second in turn and prints what the input hears.
//!
//! ## Architecture
//! - **Main Thread**: the control loop, blocking on one conversion at a time
//! - **Tick Thread**: the periodic tick interrupt
//! - **Output Callback**: the sample-rate timer driving the transfer engine
//! - **Printer Thread**: writes status lines to stdout
//!
//! ## Environment
//! - `TUNER_CONFIG`: path to a JSON file overriding any configuration field
//! - `TUNER_BACKEND`: `host` (default) for the audio devices, `sim` for the loopback board
//! - `TUNER_SIM_SECONDS`: virtual seconds the simulation runs (default 4)
//! - `TUNER_REPORT_FORMAT`: `text` (default) or `json`

use std::fs;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use crossbeam_channel::{Receiver, Sender};
use tuner_core::audio::{HostOutput, HostSampler};
use tuner_core::config::TunerConfig;
use tuner_core::control::{ControlLoop, StatusEvent};
use tuner_core::output::SampleRateTimer;
use tuner_core::pitch::Estimator;
use tuner_core::sim::Simulation;
use tuner_core::tick::{ThreadTicker, TickTimer};

const CONFIG_ENV: &str = "TUNER_CONFIG";
const BACKEND_ENV: &str = "TUNER_BACKEND";
const SIM_SECONDS_ENV: &str = "TUNER_SIM_SECONDS";
const REPORT_FORMAT_ENV: &str = "TUNER_REPORT_FORMAT";

const DEFAULT_SIM_SECONDS: f64 = 4.0;

#[derive(Debug, Clone, Copy, PartialEq)]
enum Backend {
    Host,
    Sim { seconds: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReportFormat {
    Text,
    Json,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    log::info!("[MAIN] Starting tuner...");

    let config = load_config()?;
    let backend = backend_from_env()?;
    let format = match std::env::var(REPORT_FORMAT_ENV).ok().as_deref() {
        None | Some("text") => ReportFormat::Text,
        Some("json") => ReportFormat::Json,
        Some(other) => bail!("{REPORT_FORMAT_ENV} must be `text` or `json`, got `{other}`"),
    };

    let printer = StatusPrinter::spawn(format)?;
    let result = match backend {
        Backend::Host => run_host(config, printer.sink()),
        Backend::Sim { seconds } => run_sim(config, printer.sink(), seconds),
    };
    printer.finish();
    log::info!("[MAIN] Tuner finished");
    result
}

/// Default configuration, overridden by the JSON file named in `TUNER_CONFIG`.
fn load_config() -> Result<TunerConfig> {
    let config = match std::env::var(CONFIG_ENV) {
        Ok(path) => {
            log::info!("[MAIN] Loading configuration from {}", path);
            let json = fs::read_to_string(&path)
                .with_context(|| format!("reading configuration file {path}"))?;
            parse_config(&json).with_context(|| format!("parsing configuration file {path}"))?
        }
        Err(_) => TunerConfig::default(),
    };
    config.validate().context("validating configuration")?;
    Ok(config)
}

fn parse_config(json: &str) -> Result<TunerConfig> {
    Ok(serde_json::from_str(json)?)
}

fn backend_from_env() -> Result<Backend> {
    match std::env::var(BACKEND_ENV).ok().as_deref() {
        None | Some("host") => Ok(Backend::Host),
        Some("sim") => {
            let seconds = match std::env::var(SIM_SECONDS_ENV) {
                Ok(value) => value
                    .parse::<f64>()
                    .with_context(|| format!("{SIM_SECONDS_ENV} is not a number: {value}"))?,
                Err(_) => DEFAULT_SIM_SECONDS,
            };
            if !seconds.is_finite() || seconds < 0.0 {
                bail!("{SIM_SECONDS_ENV} must be a non-negative number of seconds");
            }
            Ok(Backend::Sim { seconds })
        }
        Some(other) => bail!("{BACKEND_ENV} must be `host` or `sim`, got `{other}`"),
    }
}

/// Runs on the default audio devices until the process is killed.
fn run_host(mut config: TunerConfig, mut sink: Sender<StatusEvent>) -> Result<()> {
    let mut output = HostOutput::open(config.output_sample_rate)?;
    let sampler = HostSampler::open(config.input_sample_rate, config.encoding)?;
    config.output_sample_rate = output.sample_rate();
    config.input_sample_rate = sampler.sample_rate();

    let estimator = Estimator::build(config.estimator, config.window_capacity);
    let mut control = ControlLoop::new(config, sampler, estimator)?;

    let mut engine = control.stream_engine();
    control.start_output(&mut engine, &mut sink)?;
    output.attach(engine, control.completion_handler());
    output.configure(Duration::from_secs(1) / control.config().output_sample_rate);
    output.start()?;

    let ticks = control.tick_handler();
    let mut ticker = ThreadTicker::new();
    ticker.configure(ticks.interval());
    ticker.start(ticks).context("starting tick thread")?;

    match control.run(&mut sink)? {}
}

/// Runs the loopback board for `seconds` of virtual time.
fn run_sim(config: TunerConfig, mut sink: Sender<StatusEvent>, seconds: f64) -> Result<()> {
    let estimator = Estimator::build(config.estimator, config.window_capacity);
    let mut sim = Simulation::loopback(config, estimator)?;
    sim.run_for(Duration::from_secs_f64(seconds), &mut sink)?;

    let state = sim.control().state();
    log::info!(
        "[MAIN] Simulated {:?}: {} windows, {} pitch changes, {} samples out, {} torn reads",
        sim.now(),
        state.windows,
        state.rotations,
        sim.samples_out(),
        sim.engine().torn_reads()
    );
    Ok(())
}

fn render(event: &StatusEvent, format: ReportFormat) -> Result<String> {
    Ok(match format {
        ReportFormat::Text => event.to_string(),
        ReportFormat::Json => serde_json::to_string(event)?,
    })
}

/// Prints status events on a dedicated thread so stdout never stalls the main loop.
struct StatusPrinter {
    sender: Sender<StatusEvent>,
    thread_handle: JoinHandle<()>,
}

impl StatusPrinter {
    fn spawn(format: ReportFormat) -> Result<Self> {
        let (sender, receiver) = crossbeam_channel::unbounded::<StatusEvent>();
        let thread_handle = thread::Builder::new()
            .name("status".into())
            .spawn(move || print_events(&receiver, format))
            .context("spawning status printer")?;
        Ok(Self {
            sender,
            thread_handle,
        })
    }

    fn sink(&self) -> Sender<StatusEvent> {
        self.sender.clone()
    }

    /// Waits until every queued event is printed. All sinks must be dropped first.
    fn finish(self) {
        let StatusPrinter {
            sender,
            thread_handle,
        } = self;
        drop(sender);
        if thread_handle.join().is_err() {
            log::error!("[MAIN] status printer panicked");
        }
    }
}

fn print_events(receiver: &Receiver<StatusEvent>, format: ReportFormat) {
    for event in receiver.iter() {
        match render(&event, format) {
            Ok(line) => println!("{line}"),
            Err(err) => log::error!("[MAIN] could not render status event: {}", err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tuner_core::config::{EstimatorKind, PeriodScale};
    use tuner_core::tuning::Pitch;

    #[test]
    fn default_config_round_trips_through_json() {
        let config = TunerConfig::default();
        let json = serde_json::to_string_pretty(&config).unwrap();
        assert_eq!(parse_config(&json).unwrap(), config);
    }

    #[test]
    fn partial_override_keeps_defaults() {
        let config = parse_config(
            r#"{ "rotation": ["E5", "A4"], "period_scale": "halved", "estimator": "autocorrelation" }"#,
        )
        .unwrap();
        assert_eq!(config.rotation, vec![Pitch::E5, Pitch::A4]);
        assert_eq!(config.period_scale, PeriodScale::Halved);
        assert_eq!(config.estimator, EstimatorKind::Autocorrelation);
        assert_eq!(config.output_sample_rate, 48_000);
        assert_eq!(config.window_capacity, 1024);
    }

    #[test]
    fn unknown_pitch_is_rejected() {
        assert!(parse_config(r#"{ "rotation": ["C4"] }"#).is_err());
    }

    #[test]
    fn printer_drains_queued_events() {
        let printer = StatusPrinter::spawn(ReportFormat::Text).unwrap();
        let mut sink = printer.sink();
        let config = TunerConfig::default();
        let estimator = Estimator::build(config.estimator, config.window_capacity);
        let mut sim = Simulation::loopback(config, estimator).unwrap();
        sim.run_for(Duration::from_millis(50), &mut sink).unwrap();
        drop(sink);
        printer.finish();
    }

    #[test]
    fn json_report_is_tagged() {
        let config = TunerConfig {
            window_capacity: 16,
            ..TunerConfig::default()
        };
        let estimator = Estimator::build(config.estimator, config.window_capacity);
        let mut sim = Simulation::loopback(config, estimator).unwrap();
        let mut events = Vec::new();
        sim.run_for(Duration::from_millis(1), &mut events).unwrap();

        let tone = render(&events[0], ReportFormat::Json).unwrap();
        assert!(tone.contains(r#""event":"tone_generated""#), "{tone}");
        assert!(tone.contains(r#""period_length":109"#), "{tone}");

        let window = render(&events[1], ReportFormat::Json).unwrap();
        assert!(window.contains(r#""event":"window""#), "{window}");
        assert!(window.contains(r#""reference":"A4""#), "{window}");
    }
}
