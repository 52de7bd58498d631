//! Audio device seam.
//!
//! Bridges talk to an [`AudioBackend`] rather than to `cpal` directly, so the
//! session can be driven by a scripted backend in tests.

use crate::{error::DeviceError, pcm};
use cpal::{
    SampleFormat, SampleRate, StreamConfig, SupportedStreamConfig,
    traits::{DeviceTrait, HostTrait, StreamTrait},
};
use std::{sync::mpsc as std_mpsc, thread};
use tracing::{info, warn};

/// Receives mono f32 samples from the device thread. Must not block.
pub type InputCallback = Box<dyn FnMut(&[f32]) + Send + 'static>;

/// Fills a mono f32 buffer for the device thread. Must not block.
pub type OutputCallback = Box<dyn FnMut(&mut [f32]) + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamSpec {
    /// Preferred rate. Backends may open the device at another rate and report it.
    pub sample_rate: u32,
}

impl Default for StreamSpec {
    fn default() -> Self {
        Self {
            sample_rate: pcm::REALTIME_SAMPLE_RATE,
        }
    }
}

/// A running device stream. Dropping it stops the stream and releases the device.
pub struct ActiveStream {
    sample_rate: u32,
    _keepalive: Box<dyn Send>,
}

impl ActiveStream {
    pub fn new(sample_rate: u32, keepalive: impl Send + 'static) -> Self {
        Self {
            sample_rate,
            _keepalive: Box::new(keepalive),
        }
    }

    /// Rate the device actually runs at.
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

impl std::fmt::Debug for ActiveStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActiveStream")
            .field("sample_rate", &self.sample_rate)
            .finish()
    }
}

pub trait AudioBackend: Send + Sync {
    fn open_input(&self, spec: StreamSpec, on_samples: InputCallback) -> Result<ActiveStream, DeviceError>;
    fn open_output(&self, spec: StreamSpec, fill: OutputCallback) -> Result<ActiveStream, DeviceError>;
}

/// The host's default input and output devices via `cpal`.
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalBackend;

impl AudioBackend for CpalBackend {
    fn open_input(&self, spec: StreamSpec, mut on_samples: InputCallback) -> Result<ActiveStream, DeviceError> {
        spawn_stream_thread("oracle-capture", move || {
            let device = cpal::default_host()
                .default_input_device()
                .ok_or(DeviceError::NoDevice("input"))?;
            info!(
                "Using input device: {}",
                device.name().unwrap_or_else(|_| "Unknown".to_string())
            );
            let supported = pick_config(device.supported_input_configs()?, spec.sample_rate)
                .map_or_else(|| device.default_input_config(), Ok)?;
            let config: StreamConfig = supported.config();
            let channels = usize::from(config.channels);
            let rate = config.sample_rate.0;
            let mut mono = Vec::new();

            let stream = match supported.sample_format() {
                SampleFormat::F32 => device.build_input_stream(
                    &config,
                    move |data: &[f32], _: &cpal::InputCallbackInfo| {
                        pcm::downmix_into(data, channels, &mut mono);
                        on_samples(&mono);
                    },
                    |err| warn!("Audio input stream error: {}", err),
                    None,
                )?,
                SampleFormat::I16 => {
                    let mut converted = Vec::new();
                    device.build_input_stream(
                        &config,
                        move |data: &[i16], _: &cpal::InputCallbackInfo| {
                            converted.clear();
                            converted.extend(data.iter().map(|&s| s as f32 / 32768.0));
                            pcm::downmix_into(&converted, channels, &mut mono);
                            on_samples(&mono);
                        },
                        |err| warn!("Audio input stream error: {}", err),
                        None,
                    )?
                }
                other => {
                    return Err(DeviceError::Unsupported(format!("input sample format {other:?}")));
                }
            };
            Ok((stream, rate))
        })
    }

    fn open_output(&self, spec: StreamSpec, mut fill: OutputCallback) -> Result<ActiveStream, DeviceError> {
        spawn_stream_thread("oracle-playback", move || {
            let device = cpal::default_host()
                .default_output_device()
                .ok_or(DeviceError::NoDevice("output"))?;
            info!(
                "Using output device: {}",
                device.name().unwrap_or_else(|_| "Unknown".to_string())
            );
            let supported = pick_config(device.supported_output_configs()?, spec.sample_rate)
                .map_or_else(|| device.default_output_config(), Ok)?;
            let config: StreamConfig = supported.config();
            let channels = usize::from(config.channels).max(1);
            let rate = config.sample_rate.0;
            let mut mono = Vec::new();

            let stream = match supported.sample_format() {
                SampleFormat::F32 => device.build_output_stream(
                    &config,
                    move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                        mono.resize(data.len() / channels, 0.0);
                        fill(&mut mono);
                        for (frame, &sample) in data.chunks_mut(channels).zip(&mono) {
                            frame.fill(sample);
                        }
                    },
                    |err| warn!("Audio output stream error: {}", err),
                    None,
                )?,
                SampleFormat::I16 => device.build_output_stream(
                    &config,
                    move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                        mono.resize(data.len() / channels, 0.0);
                        fill(&mut mono);
                        for (frame, &sample) in data.chunks_mut(channels).zip(&mono) {
                            frame.fill((sample * i16::MAX as f32).clamp(i16::MIN as f32, i16::MAX as f32) as i16);
                        }
                    },
                    |err| warn!("Audio output stream error: {}", err),
                    None,
                )?,
                other => {
                    return Err(DeviceError::Unsupported(format!("output sample format {other:?}")));
                }
            };
            Ok((stream, rate))
        })
    }
}

/// Prefers a config that runs natively at `rate` with the fewest channels.
fn pick_config(
    configs: impl Iterator<Item = cpal::SupportedStreamConfigRange>,
    rate: u32,
) -> Option<SupportedStreamConfig> {
    configs
        .filter(|c| matches!(c.sample_format(), SampleFormat::F32 | SampleFormat::I16))
        .filter(|c| c.min_sample_rate().0 <= rate && rate <= c.max_sample_rate().0)
        .min_by_key(|c| (c.channels(), c.sample_format() != SampleFormat::F32))
        .map(|c| c.with_sample_rate(SampleRate(rate)))
}

/// Builds and plays a stream on a dedicated thread (cpal streams are not
/// `Send`) and parks that thread until the returned handle is dropped.
fn spawn_stream_thread<F>(name: &str, build: F) -> Result<ActiveStream, DeviceError>
where
    F: FnOnce() -> Result<(cpal::Stream, u32), DeviceError> + Send + 'static,
{
    let (ready_tx, ready_rx) = std_mpsc::sync_channel::<Result<u32, DeviceError>>(1);
    let (stop_tx, stop_rx) = std_mpsc::channel::<()>();

    thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            let stream = match build() {
                Ok((stream, rate)) => match stream.play() {
                    Ok(()) => {
                        let _ = ready_tx.send(Ok(rate));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e.into()));
                        return;
                    }
                },
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };
            // Returns once the sender side is dropped.
            let _ = stop_rx.recv();
            drop(stream);
        })
        .map_err(|e| DeviceError::Stream(e.to_string()))?;

    let rate = ready_rx
        .recv()
        .map_err(|_| DeviceError::Stream(format!("{name} thread exited before the stream started")))??;
    info!(thread = name, sample_rate = rate, "Audio stream started");
    Ok(ActiveStream::new(rate, stop_tx))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_active_stream_drop_releases_keepalive() {
        let (tx, rx) = std_mpsc::channel::<()>();
        let stream = ActiveStream::new(24_000, tx);
        assert_eq!(stream.sample_rate(), 24_000);
        drop(stream);
        assert!(rx.recv().is_err());
    }

    #[test]
    fn test_default_spec_is_realtime_rate() {
        assert_eq!(StreamSpec::default().sample_rate, 24_000);
    }
}
