//! Native audio plumbing for the voice session.
//!
//! - `device`: the [`AudioBackend`] seam and its `cpal` implementation.
//! - `capture`: microphone bridge that turns device callbacks into fixed-size frames.
//! - `playback`: speaker bridge with per-track, sample-accurate interruption.
//! - `pcm`: PCM16 / base64 codecs and resampling helpers.
//! - `wav`: in-memory WAV assets for finished audio items.

pub mod capture;
pub mod device;
pub mod error;
#[cfg(any(test, feature = "test-util"))]
pub mod mock;
pub mod pcm;
pub mod playback;
pub mod wav;

pub use capture::{AudioCaptureBridge, AudioFrame, CaptureStatus};
pub use device::{ActiveStream, AudioBackend, CpalBackend, StreamSpec};
pub use error::DeviceError;
pub use playback::{AudioPlaybackBridge, PlaybackQueue, TrackPosition};
pub use wav::DecodedAudio;
