//! Audio output using cpal.
//!
//! The [`RenderConsumer`] is moved into the device callback. Each callback
//! renders stereo into a scratch block allocated before the stream starts and
//! maps it onto the device's channel layout.

use cpal::{
    traits::{DeviceTrait, HostTrait, StreamTrait},
    Device, SampleFormat, SampleRate, Stream, StreamConfig, SupportedStreamConfig,
};
use loopstream_core::{Error, Result};
use tracing::{debug, error, info};

use crate::chunk::CHANNELS;
use crate::consumer::RenderConsumer;

/// Frames rendered per scratch block.
const SCRATCH_FRAMES: usize = 1024;

/// Negotiated output stream parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputConfig {
    pub sample_rate: u32,
    pub channels: u16,
}

/// Running output stream. Dropping it stops playback.
pub struct AudioOutput {
    _stream: Stream,
    config: OutputConfig,
    device_name: String,
}

impl AudioOutput {
    /// Open the default output device and start rendering.
    ///
    /// `make_consumer` receives the negotiated sample rate and builds the
    /// consumer the callback will drive.
    pub fn new(
        sample_rate: Option<u32>,
        make_consumer: impl FnOnce(u32) -> RenderConsumer,
    ) -> Result<Self> {
        let host = cpal::default_host();

        let device = host
            .default_output_device()
            .ok_or_else(|| Error::AudioOutput("No output device found".to_string()))?;

        let device_name = device.name().unwrap_or_else(|_| "Unknown".to_string());
        info!("Using audio output device: {device_name}");

        let supported = Self::select_config(&device, sample_rate)?;
        debug!("Supported output config: {:?}", supported);

        let sample_format = supported.sample_format();
        let config: StreamConfig = supported.into();
        let output_config = OutputConfig {
            sample_rate: config.sample_rate.0,
            channels: config.channels,
        };

        let consumer = make_consumer(output_config.sample_rate);

        let stream = match sample_format {
            SampleFormat::F32 => Self::build_stream::<f32>(&device, &config, consumer)?,
            SampleFormat::I16 => Self::build_stream::<i16>(&device, &config, consumer)?,
            SampleFormat::U16 => Self::build_stream::<u16>(&device, &config, consumer)?,
            _ => {
                return Err(Error::AudioOutput(format!(
                    "Unsupported sample format: {sample_format:?}"
                )));
            }
        };

        stream
            .play()
            .map_err(|e| Error::AudioOutput(format!("Failed to start stream: {e}")))?;

        info!(
            "Audio output started: {} Hz, {} channels",
            output_config.sample_rate, output_config.channels
        );

        Ok(Self {
            _stream: stream,
            config: output_config,
            device_name,
        })
    }

    /// Device default, or the first range that supports the forced rate.
    fn select_config(device: &Device, sample_rate: Option<u32>) -> Result<SupportedStreamConfig> {
        let Some(rate) = sample_rate else {
            return device
                .default_output_config()
                .map_err(|e| Error::AudioOutput(format!("Failed to get output config: {e}")));
        };

        let mut ranges = device
            .supported_output_configs()
            .map_err(|e| Error::AudioOutput(format!("Failed to query output configs: {e}")))?;

        ranges
            .find(|range| {
                range.min_sample_rate() <= SampleRate(rate) && SampleRate(rate) <= range.max_sample_rate()
            })
            .map(|range| range.with_sample_rate(SampleRate(rate)))
            .ok_or_else(|| {
                Error::Configuration(format!("Output device does not support {rate} Hz"))
            })
    }

    fn build_stream<T: cpal::SizedSample + cpal::FromSample<f32>>(
        device: &Device,
        config: &StreamConfig,
        mut consumer: RenderConsumer,
    ) -> Result<Stream> {
        let channels = usize::from(config.channels);
        let mut scratch = vec![0.0f32; SCRATCH_FRAMES * CHANNELS];

        let err_fn = |err| {
            error!("Audio stream error: {err}");
        };

        let stream = device
            .build_output_stream(
                config,
                move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                    for block in data.chunks_mut(SCRATCH_FRAMES * channels) {
                        let frames = block.len() / channels;
                        let stereo = &mut scratch[..frames * CHANNELS];
                        consumer.render(stereo);
                        write_block(block, stereo, channels);
                    }
                },
                err_fn,
                None,
            )
            .map_err(|e| Error::AudioOutput(format!("Failed to build stream: {e}")))?;

        Ok(stream)
    }

    /// Get the output configuration.
    pub const fn config(&self) -> &OutputConfig {
        &self.config
    }

    /// Get the device name.
    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    /// Get the sample rate.
    pub const fn sample_rate(&self) -> u32 {
        self.config.sample_rate
    }

    /// Get the number of channels.
    pub const fn channels(&self) -> u16 {
        self.config.channels
    }
}

/// Map interleaved stereo onto a device block of `channels` channels.
///
/// Mono devices get the average of both sides; channels past the second are
/// silent.
fn write_block<T: cpal::FromSample<f32>>(block: &mut [T], stereo: &[f32], channels: usize) {
    for (out, frame) in block.chunks_mut(channels).zip(stereo.chunks(CHANNELS)) {
        if channels == 1 {
            out[0] = T::from_sample_((frame[0] + frame[1]) * 0.5);
            continue;
        }
        for (index, sample) in out.iter_mut().enumerate() {
            let value = frame.get(index).copied().unwrap_or(0.0);
            *sample = T::from_sample_(value);
        }
    }
}

/// List available output devices.
pub fn list_output_devices() -> Result<Vec<String>> {
    let host = cpal::default_host();

    let devices: Vec<String> = host
        .output_devices()
        .map_err(|e| Error::AudioOutput(format!("Failed to list devices: {e}")))?
        .filter_map(|d| d.name().ok())
        .collect();

    Ok(devices)
}

/// Get the default output device name.
pub fn default_device_name() -> Option<String> {
    let host = cpal::default_host();
    host.default_output_device().and_then(|d| d.name().ok())
}
