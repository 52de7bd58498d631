//! Speaker bridge.
//!
//! Chunks are queued per track id in arrival order. Every track keeps a
//! cumulative count of samples that actually reached the device, so an
//! interruption can report exactly how much of the track the listener heard.

use crate::{
    device::{ActiveStream, AudioBackend, StreamSpec},
    error::DeviceError,
    pcm::REALTIME_SAMPLE_RATE,
};
use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU32, Ordering},
    },
};
use tracing::{debug, info, instrument};

/// Where playback of a track stood when it was observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackPosition {
    pub track_id: String,
    /// Samples of this track played so far, at 24 kHz.
    pub offset: u64,
}

#[derive(Debug)]
struct Chunk {
    track_id: Arc<str>,
    samples: Vec<i16>,
    cursor: usize,
}

/// Device-independent playback state.
#[derive(Debug, Default)]
pub struct PlaybackQueue {
    chunks: VecDeque<Chunk>,
    offsets: HashMap<Arc<str>, u64>,
    interrupted: HashSet<String>,
}

impl PlaybackQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a chunk for `track_id`. Returns false when the track was
    /// interrupted earlier and the chunk is discarded.
    pub fn enqueue(&mut self, track_id: &str, samples: &[i16]) -> bool {
        if self.interrupted.contains(track_id) {
            return false;
        }
        if samples.is_empty() {
            return true;
        }
        let track_id: Arc<str> = match self.offsets.get_key_value(track_id) {
            Some((key, _)) => key.clone(),
            None => {
                let key: Arc<str> = Arc::from(track_id);
                self.offsets.insert(key.clone(), 0);
                key
            }
        };
        self.chunks.push_back(Chunk {
            track_id,
            samples: samples.to_vec(),
            cursor: 0,
        });
        true
    }

    /// Fills `out` with queued audio followed by silence and returns how many
    /// samples came from the queue.
    pub fn render(&mut self, out: &mut [f32]) -> usize {
        let mut written = 0;
        while written < out.len() {
            let Some(chunk) = self.chunks.front_mut() else {
                break;
            };
            let take = (chunk.samples.len() - chunk.cursor).min(out.len() - written);
            for (dst, &src) in out[written..written + take]
                .iter_mut()
                .zip(&chunk.samples[chunk.cursor..chunk.cursor + take])
            {
                *dst = f32::from(src) / 32768.0;
            }
            chunk.cursor += take;
            written += take;
            if let Some(offset) = self.offsets.get_mut(&chunk.track_id) {
                *offset += take as u64;
            }
            if chunk.cursor == chunk.samples.len() {
                self.chunks.pop_front();
            }
        }
        out[written..].fill(0.0);
        written
    }

    /// The track at the head of the queue and how far into it playback is.
    pub fn current(&self) -> Option<TrackPosition> {
        let chunk = self.chunks.front()?;
        Some(TrackPosition {
            track_id: chunk.track_id.to_string(),
            offset: self.offsets.get(&chunk.track_id).copied().unwrap_or(0),
        })
    }

    pub fn is_playing(&self) -> bool {
        !self.chunks.is_empty()
    }

    /// Stops playback, marks every queued track as interrupted and reports the
    /// position of the track that was playing.
    pub fn interrupt(&mut self) -> Option<TrackPosition> {
        let position = self.current();
        for chunk in self.chunks.drain(..) {
            self.interrupted.insert(chunk.track_id.to_string());
        }
        position
    }

    pub fn queued_samples(&self) -> usize {
        self.chunks.iter().map(|c| c.samples.len() - c.cursor).sum()
    }

    /// Forgets every track, including interruption marks.
    pub fn reset(&mut self) {
        self.chunks.clear();
        self.offsets.clear();
        self.interrupted.clear();
    }
}

/// Linear-interpolating adapter for output devices that cannot run at 24 kHz.
#[derive(Debug)]
struct RateAdapter {
    step: f64,
    phase: f64,
    last: f32,
    scratch: Vec<f32>,
}

impl RateAdapter {
    fn new(device_rate: u32) -> Self {
        Self {
            step: f64::from(REALTIME_SAMPLE_RATE) / f64::from(device_rate.max(1)),
            phase: 0.0,
            last: 0.0,
            scratch: Vec::new(),
        }
    }

    // Position 0 is `last`; position k is scratch[k - 1].
    fn fill(&mut self, queue: &mut PlaybackQueue, out: &mut [f32]) {
        let end = self.phase + out.len() as f64 * self.step;
        let needed = end.floor() as usize;
        if needed == 0 {
            out.fill(self.last);
            self.phase = end;
            return;
        }
        self.scratch.resize(needed, 0.0);
        queue.render(&mut self.scratch);
        for (i, sample) in out.iter_mut().enumerate() {
            let pos = self.phase + i as f64 * self.step;
            let idx = pos.floor() as usize;
            let frac = (pos - idx as f64) as f32;
            let a = if idx == 0 { self.last } else { self.scratch[idx - 1] };
            let b = self.scratch.get(idx).copied().unwrap_or(a);
            *sample = a + (b - a) * frac;
        }
        self.phase = end - needed as f64;
        self.last = self.scratch[needed - 1];
    }
}

fn lock(queue: &Mutex<PlaybackQueue>) -> MutexGuard<'_, PlaybackQueue> {
    queue.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct AudioPlaybackBridge {
    backend: Arc<dyn AudioBackend>,
    queue: Arc<Mutex<PlaybackQueue>>,
    stream: Option<ActiveStream>,
}

impl std::fmt::Debug for AudioPlaybackBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioPlaybackBridge")
            .field("connected", &self.stream.is_some())
            .finish()
    }
}

impl AudioPlaybackBridge {
    pub fn new(backend: Arc<dyn AudioBackend>) -> Self {
        Self {
            backend,
            queue: Arc::new(Mutex::new(PlaybackQueue::new())),
            stream: None,
        }
    }

    pub fn sample_rate(&self) -> u32 {
        REALTIME_SAMPLE_RATE
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// Opens the output device. Connecting twice keeps the existing stream.
    #[instrument(skip(self))]
    pub async fn connect(&mut self) -> Result<(), DeviceError> {
        if self.stream.is_some() {
            return Ok(());
        }
        lock(&self.queue).reset();
        let backend = self.backend.clone();
        let queue = self.queue.clone();
        // Zero until the backend reports the rate it opened the device at.
        let device_rate = Arc::new(AtomicU32::new(0));
        let rate_for_callback = device_rate.clone();
        let mut adapter: Option<RateAdapter> = None;
        let fill = Box::new(move |out: &mut [f32]| {
            let rate = rate_for_callback.load(Ordering::Acquire);
            // The device thread never waits on the queue; a contended lock
            // costs one buffer of silence.
            let queue = if rate == 0 { None } else { queue.try_lock().ok() };
            let Some(mut queue) = queue else {
                out.fill(0.0);
                return;
            };
            if rate == REALTIME_SAMPLE_RATE {
                queue.render(out);
            } else {
                adapter.get_or_insert_with(|| RateAdapter::new(rate)).fill(&mut queue, out);
            }
        });
        let stream = tokio::task::spawn_blocking(move || backend.open_output(StreamSpec::default(), fill))
            .await
            .map_err(|e| DeviceError::Stream(e.to_string()))??;
        device_rate.store(stream.sample_rate(), Ordering::Release);
        info!(sample_rate = stream.sample_rate(), "Speaker connected");
        self.stream = Some(stream);
        Ok(())
    }

    /// Queues a PCM16 chunk for `track_id`; false if the track was interrupted.
    pub fn enqueue(&self, track_id: &str, samples: &[i16]) -> bool {
        let accepted = lock(&self.queue).enqueue(track_id, samples);
        if !accepted {
            debug!(track_id, "Dropping audio for interrupted track");
        }
        accepted
    }

    /// Stops playback and returns the interrupted track's position, if any.
    pub fn interrupt(&self) -> Option<TrackPosition> {
        lock(&self.queue).interrupt()
    }

    pub fn current(&self) -> Option<TrackPosition> {
        lock(&self.queue).current()
    }

    pub fn is_playing(&self) -> bool {
        lock(&self.queue).is_playing()
    }

    /// Releases the output device and forgets all tracks. Idempotent.
    pub fn disconnect(&mut self) {
        if self.stream.take().is_some() {
            info!("Speaker released");
        }
        lock(&self.queue).reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockBackend;

    #[test]
    fn test_offsets_track_rendered_samples() {
        let mut queue = PlaybackQueue::new();
        assert!(queue.enqueue("item_a", &[1000; 1000]));
        assert!(queue.enqueue("item_a", &[1000; 1000]));

        let mut out = vec![0.0; 1500];
        assert_eq!(queue.render(&mut out), 1500);
        assert_eq!(
            queue.current(),
            Some(TrackPosition {
                track_id: "item_a".into(),
                offset: 1500,
            })
        );
    }

    #[test]
    fn test_interrupt_mid_stream_reports_partial_offset() {
        let mut queue = PlaybackQueue::new();
        queue.enqueue("item_a", &[1; 2400]);
        queue.enqueue("item_a", &[1; 2400]);
        let mut out = vec![0.0; 1000];
        queue.render(&mut out);

        let position = queue.interrupt().unwrap();
        assert_eq!(position.track_id, "item_a");
        assert!(position.offset > 0 && position.offset < 4800);
        assert!(!queue.is_playing());
    }

    #[test]
    fn test_interrupted_track_rejects_late_chunks() {
        let mut queue = PlaybackQueue::new();
        queue.enqueue("item_a", &[1; 10]);
        queue.interrupt();
        assert!(!queue.enqueue("item_a", &[1; 10]));
        assert!(queue.enqueue("item_b", &[1; 10]));
        assert_eq!(queue.current().unwrap().track_id, "item_b");

        queue.reset();
        assert!(queue.enqueue("item_a", &[1; 10]));
    }

    #[test]
    fn test_interrupt_with_nothing_playing() {
        let mut queue = PlaybackQueue::new();
        assert_eq!(queue.interrupt(), None);

        queue.enqueue("item_a", &[1; 10]);
        let mut out = vec![0.0; 20];
        assert_eq!(queue.render(&mut out), 10);
        assert_eq!(out[15], 0.0);
        assert_eq!(queue.interrupt(), None);
    }

    #[test]
    fn test_tracks_count_independently() {
        let mut queue = PlaybackQueue::new();
        queue.enqueue("item_a", &[1; 100]);
        queue.enqueue("item_b", &[1; 100]);
        let mut out = vec![0.0; 150];
        queue.render(&mut out);
        assert_eq!(
            queue.current(),
            Some(TrackPosition {
                track_id: "item_b".into(),
                offset: 50,
            })
        );
        assert_eq!(queue.queued_samples(), 50);
    }

    #[tokio::test]
    async fn test_bridge_plays_through_backend() {
        let backend = MockBackend::new();
        let mut playback = AudioPlaybackBridge::new(Arc::new(backend.clone()));
        playback.connect().await.unwrap();
        assert!(backend.output_open());

        playback.enqueue("item_a", &[16384; 300]);
        let out = backend.pull_output(200).unwrap();
        assert!((out[0] - 0.5).abs() < 1e-4);
        assert_eq!(playback.current().unwrap().offset, 200);

        let position = playback.interrupt().unwrap();
        assert_eq!(position.offset, 200);
        assert!(!playback.enqueue("item_a", &[1; 10]));
        assert!(backend.pull_output(50).unwrap().iter().all(|&s| s == 0.0));

        playback.disconnect();
        assert!(!backend.output_open());
        assert!(!playback.is_connected());
    }

    #[tokio::test]
    async fn test_bridge_adapts_to_device_rate() {
        let backend = MockBackend::new().with_output_rate(48_000);
        let mut playback = AudioPlaybackBridge::new(Arc::new(backend.clone()));
        playback.connect().await.unwrap();

        playback.enqueue("item_a", &[8192; 1000]);
        backend.pull_output(400).unwrap();
        // Two device samples per source sample.
        assert_eq!(playback.current().unwrap().offset, 200);
    }
}
