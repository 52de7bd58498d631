use base64::Engine;
use rubato::{FastFixedIn, PolynomialDegree, Resampler};

/// Sample rate of every PCM16 stream exchanged with the realtime service.
pub const REALTIME_SAMPLE_RATE: u32 = 24_000;

/// Creates a mono resampler converting `in_sampling_rate` to `out_sampling_rate`.
pub fn create_resampler(
    in_sampling_rate: f64,
    out_sampling_rate: f64,
    chunk_size: usize,
) -> Result<FastFixedIn<f32>, rubato::ResamplerConstructionError> {
    FastFixedIn::<f32>::new(
        out_sampling_rate / in_sampling_rate,
        1.0,
        PolynomialDegree::Cubic,
        chunk_size,
        1,
    )
}

/// Feeds arbitrary-length input through a fixed-chunk resampler, carrying the
/// remainder over to the next call.
pub struct StreamResampler {
    resampler: FastFixedIn<f32>,
    carry: Vec<f32>,
}

impl StreamResampler {
    pub fn new(in_rate: u32, out_rate: u32, chunk_size: usize) -> Result<Self, rubato::ResamplerConstructionError> {
        Ok(Self {
            resampler: create_resampler(f64::from(in_rate), f64::from(out_rate), chunk_size)?,
            carry: Vec::with_capacity(chunk_size * 2),
        })
    }

    /// Resamples `input`, appending whatever output is ready to `out`.
    pub fn process_into(&mut self, input: &[f32], out: &mut Vec<f32>) {
        self.carry.extend_from_slice(input);
        loop {
            let needed = self.resampler.input_frames_next();
            if self.carry.len() < needed {
                break;
            }
            let chunk: Vec<f32> = self.carry.drain(..needed).collect();
            match self.resampler.process(&[chunk], None) {
                Ok(resampled) => out.extend_from_slice(&resampled[0]),
                Err(e) => tracing::warn!(error = %e, "Dropping audio chunk that failed to resample"),
            }
        }
    }
}

/// Converts normalized f32 samples to PCM16.
pub fn convert_f32_to_i16(pcm32: &[f32]) -> Vec<i16> {
    pcm32
        .iter()
        .map(|&sample| (sample * i16::MAX as f32).clamp(i16::MIN as f32, i16::MAX as f32) as i16)
        .collect()
}

/// Encodes PCM16 samples as little-endian bytes in base64, the wire format of
/// audio appends.
pub fn encode_i16(pcm16: &[i16]) -> String {
    let bytes: Vec<u8> = pcm16.iter().flat_map(|&sample| sample.to_le_bytes()).collect();
    base64::engine::general_purpose::STANDARD.encode(&bytes)
}

/// Decodes a base64 audio delta into PCM16 samples. Invalid input yields no
/// samples; a trailing odd byte is ignored.
pub fn decode_i16(base64_fragment: &str) -> Vec<i16> {
    match base64::engine::general_purpose::STANDARD.decode(base64_fragment) {
        Ok(bytes) => bytes
            .chunks_exact(2)
            .map(|chunk| i16::from_le_bytes([chunk[0], chunk[1]]))
            .collect(),
        Err(e) => {
            tracing::error!(error = %e, "Failed to decode base64 audio fragment");
            Vec::new()
        }
    }
}

/// Averages interleaved frames down to one channel, reusing `out`.
pub fn downmix_into(interleaved: &[f32], channels: usize, out: &mut Vec<f32>) {
    out.clear();
    if channels <= 1 {
        out.extend_from_slice(interleaved);
        return;
    }
    out.extend(
        interleaved
            .chunks(channels)
            .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_decode_i16_reads_little_endian() {
        // 0x4000 = 16384, 0x8000 = -32768
        let encoded = base64::engine::general_purpose::STANDARD.encode([0x00u8, 0x40, 0x00, 0x80]);
        assert_eq!(decode_i16(&encoded), vec![16384, -32768]);
    }

    #[test]
    fn test_decode_i16_tolerates_bad_input() {
        assert!(decode_i16("invalid_base64!").is_empty());
        assert!(decode_i16("").is_empty());
        let odd = base64::engine::general_purpose::STANDARD.encode([0x01u8, 0x00, 0x7f]);
        assert_eq!(decode_i16(&odd), vec![1]);
    }

    #[test]
    fn test_encode_i16_matches_wire_bytes() {
        let encoded = encode_i16(&[1, -1]);
        let bytes = base64::engine::general_purpose::STANDARD.decode(encoded).unwrap();
        assert_eq!(bytes, vec![0x01, 0x00, 0xff, 0xff]);
    }

    #[test]
    fn test_convert_f32_to_i16_clamps() {
        let result = convert_f32_to_i16(&[1.0, -1.0, 0.0, 2.0, -2.0]);
        assert_eq!(result, vec![i16::MAX, -32767, 0, i16::MAX, i16::MIN]);
    }

    #[test]
    fn test_downmix_averages_frames() {
        let mut out = Vec::new();
        downmix_into(&[0.5, -0.5, 1.0, 0.0], 2, &mut out);
        assert_eq!(out.len(), 2);
        assert_abs_diff_eq!(out[0], 0.0, epsilon = 0.0001);
        assert_abs_diff_eq!(out[1], 0.5, epsilon = 0.0001);

        downmix_into(&[0.25, 0.75], 1, &mut out);
        assert_eq!(out, vec![0.25, 0.75]);
    }

    #[test]
    fn test_stream_resampler_halves_rate() {
        let mut resampler = StreamResampler::new(48_000, 24_000, 480).unwrap();
        let mut out = Vec::new();
        resampler.process_into(&vec![0.0; 4800], &mut out);
        // 4800 input samples at half rate; allow for resampler latency.
        assert!(out.len() > 2000 && out.len() <= 2400, "got {}", out.len());
    }

    #[test]
    fn test_stream_resampler_carries_partial_chunks() {
        let mut resampler = StreamResampler::new(48_000, 24_000, 480).unwrap();
        let mut out = Vec::new();
        resampler.process_into(&vec![0.0; 100], &mut out);
        assert!(out.is_empty());
        resampler.process_into(&vec![0.0; 400], &mut out);
        assert!(!out.is_empty());
    }
}
