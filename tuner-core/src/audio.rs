//! # Host Audio Board Module
//!
//! Runs the tuner on a desktop with CPAL (Cross-Platform Audio Library). The default
//! output device stands in for the DAC and its stream callback is the sample-rate
//! timer; the default input device stands in for the ADC.
//!
//! ## Features
//! - Automatic device and stream format selection
//! - Output callback that steps the transfer engine and runs the completion interrupt
//! - Input stream buffered through a bounded channel with a bounded conversion wait

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SupportedStreamConfig, SupportedStreamConfigRange};
use crossbeam_channel::{Receiver, RecvTimeoutError};

use crate::acquisition::AnalogSampler;
use crate::config::SampleEncoding;
use crate::error::SamplerError;
use crate::output::{CompletionHandler, SampleRateTimer, StreamEngine};

/// Playback samples are scaled as if driving a 12-bit DAC around mid-scale.
pub const DAC_HALF_SCALE: f32 = 2048.0;

/// How long a conversion may wait on the input stream before it counts as lost.
pub const CONVERSION_TIMEOUT: Duration = Duration::from_millis(250);

/// Picks the f32 stream format closest to `target_rate`, preferring fewer channels.
///
/// # Arguments
/// * `configs` - Stream format ranges reported by the device
/// * `target_rate` - Desired sample rate in Hz
///
/// # Returns
/// * `Some(config)` - The format at `target_rate` clamped into its supported range
/// * `None` - The device offers no f32 format
fn find_supported_config(
    configs: impl IntoIterator<Item = SupportedStreamConfigRange>,
    target_rate: u32,
) -> Option<SupportedStreamConfig> {
    let best = configs
        .into_iter()
        .filter(|c| c.sample_format() == cpal::SampleFormat::F32)
        .min_by_key(|c| {
            let rate = target_rate.clamp(c.min_sample_rate().0, c.max_sample_rate().0);
            (rate.abs_diff(target_rate), c.channels())
        })?;
    let rate = target_rate.clamp(best.min_sample_rate().0, best.max_sample_rate().0);
    Some(best.with_sample_rate(cpal::SampleRate(rate)))
}

/// Analog sampler fed by the default input device.
///
/// The stream runs freely; each conversion takes the next captured sample (first
/// channel only) in order.
pub struct HostSampler {
    _stream: cpal::Stream,
    receiver: Receiver<i16>,
    sample_rate: u32,
    timeout: Duration,
    dropped: Arc<AtomicU64>,
}

impl HostSampler {
    /// Opens the default input device as close to `target_rate` as it supports.
    pub fn open(target_rate: u32, encoding: SampleEncoding) -> Result<Self> {
        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or_else(|| anyhow!("No input device available"))?;
        log::info!("[AUDIO] input device: {}", device.name()?);

        let supported = find_supported_config(device.supported_input_configs()?, target_rate)
            .ok_or_else(|| anyhow!("No suitable f32 input format found"))?;
        let sample_rate = supported.sample_rate().0;
        let channels = usize::from(supported.channels()).max(1);
        let config: cpal::StreamConfig = supported.into();
        if sample_rate != target_rate {
            log::warn!(
                "[AUDIO] input runs at {} Hz instead of {} Hz",
                sample_rate,
                target_rate
            );
        }

        // A quarter second of slack before samples are dropped.
        let (sender, receiver) = crossbeam_channel::bounded(sample_rate as usize / 4);
        let dropped = Arc::new(AtomicU64::new(0));
        let dropped_in_callback = Arc::clone(&dropped);

        let stream = device
            .build_input_stream(
                &config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    for frame in data.chunks(channels) {
                        let sample = encoding.quantize(frame[0]);
                        if sender.try_send(sample).is_err() {
                            dropped_in_callback.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                },
                |err| log::error!("[AUDIO] input stream error: {}", err),
                None,
            )
            .context("building input stream")?;
        stream.play().context("starting input stream")?;

        Ok(Self {
            _stream: stream,
            receiver,
            sample_rate,
            timeout: CONVERSION_TIMEOUT,
            dropped,
        })
    }

    /// Rate the device actually captures at.
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Captured samples discarded because the main loop fell behind.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl AnalogSampler for HostSampler {
    fn start_conversion(&mut self, _channel: u8) {}

    fn blocking_read(&mut self) -> std::result::Result<i16, SamplerError> {
        self.receiver
            .recv_timeout(self.timeout)
            .map_err(|err| match err {
                RecvTimeoutError::Timeout => SamplerError::Timeout(self.timeout),
                RecvTimeoutError::Disconnected => SamplerError::Disconnected,
            })
    }
}

/// The default output device, paced by its own stream callback.
///
/// [`SampleRateTimer::start`] builds and plays the stream; every frame the callback
/// services the attached [`StreamEngine`] once and writes the sample to all channels.
pub struct HostOutput {
    device: cpal::Device,
    config: cpal::StreamConfig,
    sample_rate: u32,
    period: Duration,
    engine: Option<(StreamEngine, CompletionHandler)>,
    stream: Option<cpal::Stream>,
}

impl HostOutput {
    /// Selects the default output device as close to `target_rate` as it supports.
    pub fn open(target_rate: u32) -> Result<Self> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| anyhow!("No output device available"))?;
        log::info!("[AUDIO] output device: {}", device.name()?);

        let supported = find_supported_config(device.supported_output_configs()?, target_rate)
            .ok_or_else(|| anyhow!("No suitable f32 output format found"))?;
        let sample_rate = supported.sample_rate().0;
        if sample_rate != target_rate {
            log::warn!(
                "[AUDIO] output runs at {} Hz instead of {} Hz",
                sample_rate,
                target_rate
            );
        }

        Ok(Self {
            device,
            config: supported.into(),
            sample_rate,
            period: Duration::from_secs(1) / sample_rate.max(1),
            engine: None,
            stream: None,
        })
    }

    /// Rate the device actually plays at.
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Hands the transfer engine and its completion interrupt to the output callback.
    pub fn attach(&mut self, engine: StreamEngine, completion: CompletionHandler) {
        self.engine = Some((engine, completion));
    }
}

impl SampleRateTimer for HostOutput {
    type Error = anyhow::Error;

    fn configure(&mut self, period: Duration) {
        if period != self.period {
            log::warn!(
                "[AUDIO] requested sample period {:?}, device paces at {:?}",
                period,
                self.period
            );
        }
    }

    fn start(&mut self) -> Result<()> {
        let (mut engine, completion) = self
            .engine
            .take()
            .ok_or_else(|| anyhow!("No transfer engine attached to the output"))?;
        let channels = usize::from(self.config.channels).max(1);

        let stream = self
            .device
            .build_output_stream(
                &self.config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    for frame in data.chunks_mut(channels) {
                        let value = engine
                            .service(&completion)
                            .map_or(0.0, |sample| f32::from(sample) / DAC_HALF_SCALE);
                        frame.fill(value);
                    }
                },
                |err| log::error!("[AUDIO] output stream error: {}", err),
                None,
            )
            .context("building output stream")?;
        stream.play().context("starting output stream")?;
        log::info!("[AUDIO] output streaming at {} Hz", self.sample_rate);
        self.stream = Some(stream);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cpal::{SampleFormat, SupportedBufferSize};

    fn range(channels: u16, min: u32, max: u32, format: SampleFormat) -> SupportedStreamConfigRange {
        SupportedStreamConfigRange::new(
            channels,
            cpal::SampleRate(min),
            cpal::SampleRate(max),
            SupportedBufferSize::Unknown,
            format,
        )
    }

    #[test]
    fn prefers_exact_rate_then_fewer_channels() {
        let configs = vec![
            range(2, 8_000, 192_000, SampleFormat::F32),
            range(1, 44_100, 48_000, SampleFormat::F32),
            range(1, 8_000, 192_000, SampleFormat::I16),
        ];
        let picked = find_supported_config(configs.clone(), 96_000).unwrap();
        assert_eq!(picked.sample_rate().0, 96_000);
        assert_eq!(picked.channels(), 2);

        let picked = find_supported_config(configs, 48_000).unwrap();
        assert_eq!(picked.channels(), 1);
    }

    #[test]
    fn clamps_to_nearest_supported_rate() {
        let configs = vec![range(1, 44_100, 48_000, SampleFormat::F32)];
        let picked = find_supported_config(configs, 96_000).unwrap();
        assert_eq!(picked.sample_rate().0, 48_000);
    }

    #[test]
    fn ignores_non_float_formats() {
        let configs = vec![range(1, 8_000, 96_000, SampleFormat::I16)];
        assert!(find_supported_config(configs, 96_000).is_none());
    }
}
