//! Microphone bridge.
//!
//! The device callback copies samples into a lock-free ring buffer and wakes a
//! pump task. The pump resamples to 24 kHz when needed, slices the stream into
//! fixed-size PCM16 frames and hands them to the recording callback. When the
//! ring is full the callback drops the overflow instead of waiting.

use crate::{
    device::{ActiveStream, AudioBackend, StreamSpec},
    error::DeviceError,
    pcm::{self, REALTIME_SAMPLE_RATE, StreamResampler},
};
use ringbuf::{HeapCons, HeapRb, traits::*};
use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicU64, Ordering},
};
use tokio::{
    sync::{Notify, oneshot},
    task::JoinHandle,
};
use tracing::{debug, info, instrument, warn};

/// Samples per emitted frame at 24 kHz.
pub const DEFAULT_FRAME_SAMPLES: usize = 8192;
const RING_SECONDS: usize = 2;
const RESAMPLER_CHUNK: usize = 1024;
const DRAIN_CHUNK: usize = 4096;

/// One mono PCM16 frame at 24 kHz.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    pub samples: Vec<i16>,
}

impl AudioFrame {
    /// The frame as the base64 payload of an audio append.
    pub fn to_base64(&self) -> String {
        pcm::encode_i16(&self.samples)
    }
}

/// Microphone state reported by [`AudioCaptureBridge::status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureStatus {
    Disarmed,
    /// Stream open, frames discarded.
    Armed,
    Recording,
}

struct Armed {
    stream: ActiveStream,
    consumer: Option<HeapCons<f32>>,
    recording: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

struct Pump {
    stop: oneshot::Sender<()>,
    handle: JoinHandle<HeapCons<f32>>,
}

pub struct AudioCaptureBridge {
    backend: Arc<dyn AudioBackend>,
    frame_samples: usize,
    armed: Option<Armed>,
    pump: Option<Pump>,
    dropped: Arc<AtomicU64>,
}

impl std::fmt::Debug for AudioCaptureBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioCaptureBridge")
            .field("status", &self.status())
            .field("frame_samples", &self.frame_samples)
            .finish()
    }
}

impl AudioCaptureBridge {
    pub fn new(backend: Arc<dyn AudioBackend>) -> Self {
        Self::with_frame_samples(backend, DEFAULT_FRAME_SAMPLES)
    }

    pub fn with_frame_samples(backend: Arc<dyn AudioBackend>, frame_samples: usize) -> Self {
        Self {
            backend,
            frame_samples: frame_samples.max(1),
            armed: None,
            pump: None,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn status(&self) -> CaptureStatus {
        match (&self.armed, &self.pump) {
            (None, _) => CaptureStatus::Disarmed,
            (Some(_), None) => CaptureStatus::Armed,
            (Some(_), Some(_)) => CaptureStatus::Recording,
        }
    }

    pub fn is_armed(&self) -> bool {
        self.armed.is_some()
    }

    pub fn is_recording(&self) -> bool {
        self.pump.is_some()
    }

    /// Acquires the microphone. Arming twice keeps the existing stream.
    #[instrument(skip(self))]
    pub async fn arm(&mut self) -> Result<(), DeviceError> {
        if self.armed.is_some() {
            return Ok(());
        }
        let recording = Arc::new(AtomicBool::new(false));
        let notify = Arc::new(Notify::new());
        // Sized generously for any native rate; the pump drains it continuously.
        let ring = HeapRb::<f32>::new(48_000 * RING_SECONDS);
        let (mut producer, consumer) = ring.split();

        let callback = {
            let recording = recording.clone();
            let notify = notify.clone();
            let dropped = self.dropped.clone();
            Box::new(move |samples: &[f32]| {
                if !recording.load(Ordering::Acquire) {
                    return;
                }
                let pushed = producer.push_slice(samples);
                if pushed < samples.len() {
                    dropped.fetch_add((samples.len() - pushed) as u64, Ordering::Relaxed);
                }
                notify.notify_one();
            })
        };

        let backend = self.backend.clone();
        let stream = tokio::task::spawn_blocking(move || {
            backend.open_input(StreamSpec::default(), callback)
        })
        .await
        .map_err(|e| DeviceError::Stream(e.to_string()))??;

        info!(sample_rate = stream.sample_rate(), "Microphone armed");
        self.armed = Some(Armed {
            stream,
            consumer: Some(consumer),
            recording,
            notify,
        });
        Ok(())
    }

    /// Starts emitting frames to `on_frame`. A no-op while already recording.
    pub fn record<F>(&mut self, on_frame: F) -> Result<(), DeviceError>
    where
        F: FnMut(AudioFrame) + Send + 'static,
    {
        if self.pump.is_some() {
            return Ok(());
        }
        let armed = self.armed.as_mut().ok_or(DeviceError::NotArmed)?;
        let mut consumer = armed
            .consumer
            .take()
            .ok_or_else(|| DeviceError::Stream("capture buffer was lost".to_string()))?;
        consumer.clear();

        let device_rate = armed.stream.sample_rate();
        let resampler = if device_rate != REALTIME_SAMPLE_RATE {
            match StreamResampler::new(device_rate, REALTIME_SAMPLE_RATE, RESAMPLER_CHUNK) {
                Ok(resampler) => Some(resampler),
                Err(e) => {
                    armed.consumer = Some(consumer);
                    return Err(e.into());
                }
            }
        } else {
            None
        };

        let (stop_tx, stop_rx) = oneshot::channel();
        let handle = tokio::spawn(run_pump(
            consumer,
            armed.notify.clone(),
            stop_rx,
            resampler,
            self.frame_samples,
            on_frame,
        ));
        armed.recording.store(true, Ordering::Release);
        self.pump = Some(Pump { stop: stop_tx, handle });
        debug!(device_rate, "Capture recording");
        Ok(())
    }

    /// Stops emitting frames after flushing the partial tail. Safe when idle.
    pub async fn pause(&mut self) {
        let Some(pump) = self.pump.take() else {
            return;
        };
        if let Some(armed) = &self.armed {
            armed.recording.store(false, Ordering::Release);
        }
        let _ = pump.stop.send(());
        match pump.handle.await {
            Ok(consumer) => {
                if let Some(armed) = self.armed.as_mut() {
                    armed.consumer = Some(consumer);
                }
            }
            Err(e) => warn!(error = %e, "Capture pump did not finish cleanly"),
        }
        debug!("Capture paused");
    }

    /// Releases the microphone. Idempotent.
    pub async fn disarm(&mut self) {
        self.pause().await;
        if self.armed.take().is_some() {
            let dropped = self.dropped.swap(0, Ordering::Relaxed);
            if dropped > 0 {
                warn!(dropped, "Capture buffer overflowed while armed");
            }
            info!("Microphone released");
        }
    }
}

impl Drop for AudioCaptureBridge {
    fn drop(&mut self) {
        if let Some(pump) = &self.pump {
            pump.handle.abort();
        }
    }
}

async fn run_pump<F>(
    mut consumer: HeapCons<f32>,
    notify: Arc<Notify>,
    mut stop: oneshot::Receiver<()>,
    mut resampler: Option<StreamResampler>,
    frame_samples: usize,
    mut on_frame: F,
) -> HeapCons<f32>
where
    F: FnMut(AudioFrame) + Send + 'static,
{
    let mut scratch = vec![0f32; DRAIN_CHUNK];
    let mut pending: Vec<f32> = Vec::with_capacity(frame_samples * 2);

    loop {
        tokio::select! {
            biased;
            _ = &mut stop => break,
            _ = notify.notified() => {}
        }
        drain(&mut consumer, &mut scratch, resampler.as_mut(), &mut pending);
        emit_full_frames(&mut pending, frame_samples, &mut on_frame);
    }

    drain(&mut consumer, &mut scratch, resampler.as_mut(), &mut pending);
    emit_full_frames(&mut pending, frame_samples, &mut on_frame);
    if !pending.is_empty() {
        on_frame(AudioFrame {
            samples: pcm::convert_f32_to_i16(&pending),
        });
        pending.clear();
    }
    consumer
}

fn drain(
    consumer: &mut HeapCons<f32>,
    scratch: &mut [f32],
    mut resampler: Option<&mut StreamResampler>,
    pending: &mut Vec<f32>,
) {
    loop {
        let read = consumer.pop_slice(scratch);
        if read == 0 {
            break;
        }
        match resampler.as_deref_mut() {
            Some(resampler) => resampler.process_into(&scratch[..read], pending),
            None => pending.extend_from_slice(&scratch[..read]),
        }
    }
}

fn emit_full_frames<F: FnMut(AudioFrame)>(pending: &mut Vec<f32>, frame_samples: usize, on_frame: &mut F) {
    while pending.len() >= frame_samples {
        let frame: Vec<f32> = pending.drain(..frame_samples).collect();
        on_frame(AudioFrame {
            samples: pcm::convert_f32_to_i16(&frame),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockBackend;
    use std::sync::Mutex;
    use std::time::Duration;

    fn collector() -> (Arc<Mutex<Vec<AudioFrame>>>, impl FnMut(AudioFrame) + Send + 'static) {
        let frames = Arc::new(Mutex::new(Vec::new()));
        let sink = frames.clone();
        (frames, move |frame| sink.lock().unwrap().push(frame))
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn test_record_requires_arm() {
        let backend = MockBackend::new();
        let mut capture = AudioCaptureBridge::new(Arc::new(backend));
        let (_, on_frame) = collector();
        assert!(matches!(capture.record(on_frame), Err(DeviceError::NotArmed)));
        assert_eq!(capture.status(), CaptureStatus::Disarmed);
    }

    #[tokio::test]
    async fn test_arm_failure_surfaces_device_error() {
        let backend = MockBackend::new();
        backend.fail_input(true);
        let mut capture = AudioCaptureBridge::new(Arc::new(backend.clone()));
        assert!(matches!(capture.arm().await, Err(DeviceError::NoDevice("input"))));
        assert!(!capture.is_armed());
        assert!(!backend.input_open());
    }

    #[tokio::test]
    async fn test_frames_are_fixed_size_and_tail_is_flushed() {
        let backend = MockBackend::new();
        let mut capture = AudioCaptureBridge::with_frame_samples(Arc::new(backend.clone()), 100);
        capture.arm().await.unwrap();
        let (frames, on_frame) = collector();
        capture.record(on_frame).unwrap();

        backend.push_input(&vec![0.5; 250]);
        settle().await;
        assert_eq!(frames.lock().unwrap().len(), 2);

        capture.pause().await;
        let frames = frames.lock().unwrap();
        let sizes: Vec<usize> = frames.iter().map(|f| f.samples.len()).collect();
        assert_eq!(sizes, vec![100, 100, 50]);
        assert_eq!(frames[0].samples[0], 16383);
    }

    #[tokio::test]
    async fn test_samples_outside_recording_are_ignored() {
        let backend = MockBackend::new();
        let mut capture = AudioCaptureBridge::with_frame_samples(Arc::new(backend.clone()), 10);
        capture.arm().await.unwrap();
        backend.push_input(&[0.1; 40]);

        let (frames, on_frame) = collector();
        capture.record(on_frame).unwrap();
        capture.pause().await;
        assert!(frames.lock().unwrap().is_empty());

        backend.push_input(&[0.1; 40]);
        let (frames, on_frame) = collector();
        capture.record(on_frame).unwrap();
        backend.push_input(&[0.1; 10]);
        settle().await;
        capture.pause().await;
        assert_eq!(frames.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_record_twice_keeps_first_consumer() {
        let backend = MockBackend::new();
        let mut capture = AudioCaptureBridge::with_frame_samples(Arc::new(backend.clone()), 10);
        capture.arm().await.unwrap();
        let (first, on_first) = collector();
        let (second, on_second) = collector();
        capture.record(on_first).unwrap();
        capture.record(on_second).unwrap();

        backend.push_input(&[0.2; 10]);
        settle().await;
        capture.pause().await;
        assert_eq!(first.lock().unwrap().len(), 1);
        assert!(second.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_native_rate_is_resampled() {
        let backend = MockBackend::new().with_input_rate(48_000);
        let mut capture = AudioCaptureBridge::with_frame_samples(Arc::new(backend.clone()), 1000);
        capture.arm().await.unwrap();
        let (frames, on_frame) = collector();
        capture.record(on_frame).unwrap();

        backend.push_input(&vec![0.0; 9600]);
        settle().await;
        capture.pause().await;
        let total: usize = frames.lock().unwrap().iter().map(|f| f.samples.len()).sum();
        assert!(total > 4000 && total <= 4800, "got {total}");
    }

    #[tokio::test]
    async fn test_disarm_is_idempotent_and_releases_device() {
        let backend = MockBackend::new();
        let mut capture = AudioCaptureBridge::new(Arc::new(backend.clone()));
        capture.arm().await.unwrap();
        assert!(backend.input_open());
        let (_, on_frame) = collector();
        capture.record(on_frame).unwrap();

        capture.disarm().await;
        capture.disarm().await;
        assert_eq!(capture.status(), CaptureStatus::Disarmed);
        assert!(!backend.input_open());
        capture.pause().await;
    }
}
