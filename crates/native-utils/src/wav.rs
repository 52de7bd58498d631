use std::{io::Cursor, sync::Arc, time::Duration};

/// A finished audio item encoded as an in-memory mono PCM16 WAV file.
///
/// Cloning shares the underlying bytes, so a snapshot of an item can be taken
/// without copying its audio.
#[derive(Debug, Clone)]
pub struct DecodedAudio {
    wav: Arc<[u8]>,
    sample_rate: u32,
    samples: usize,
}

impl DecodedAudio {
    pub fn from_pcm16(samples: &[i16], sample_rate: u32) -> Result<Self, hound::Error> {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut cursor = Cursor::new(Vec::with_capacity(44 + samples.len() * 2));
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec)?;
            let mut pcm = writer.get_i16_writer(samples.len() as u32);
            for &sample in samples {
                pcm.write_sample(sample);
            }
            pcm.flush()?;
            writer.finalize()?;
        }
        Ok(Self {
            wav: Arc::from(cursor.into_inner()),
            sample_rate,
            samples: samples.len(),
        })
    }

    pub fn bytes(&self) -> &[u8] {
        &self.wav
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn samples(&self) -> usize {
        self.samples
    }

    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.samples as f64 / f64::from(self.sample_rate))
    }

    /// True when both values point at the same encoded buffer.
    pub fn shares_storage(&self, other: &DecodedAudio) -> bool {
        Arc::ptr_eq(&self.wav, &other.wav)
    }
}

impl PartialEq for DecodedAudio {
    fn eq(&self, other: &Self) -> bool {
        self.sample_rate == other.sample_rate && self.wav == other.wav
    }
}
