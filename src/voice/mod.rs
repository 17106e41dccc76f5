//! Audio plumbing: PCM conversions, utterance segmentation, and the
//! speech-engine adapters.

pub mod segmenter;
#[cfg(feature = "silero")]
pub mod silero;
pub mod stt;
pub mod tts;

pub use segmenter::{Segmenter, SegmenterConfig};
pub use stt::{HttpStt, SpeechToText};
pub use tts::{HttpTts, TextToSpeech};

/// Reinterpret little-endian 16-bit PCM bytes as samples. A trailing odd
/// byte is ignored.
pub fn bytes_to_samples(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|c| i16::from_le_bytes([c[0], c[1]]))
        .collect()
}

/// Serialize samples back to little-endian bytes.
pub fn samples_to_bytes(samples: &[i16]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for s in samples {
        out.extend_from_slice(&s.to_le_bytes());
    }
    out
}

/// RMS energy of a PCM frame.
pub fn rms_energy(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    (samples.iter().map(|&s| (s as f32).powi(2)).sum::<f32>() / samples.len() as f32).sqrt()
}

/// Convert i16 PCM samples to f32 normalized [-1.0, 1.0].
#[cfg(feature = "silero")]
pub fn i16_to_f32(samples: &[i16]) -> Vec<f32> {
    samples.iter().map(|&s| s as f32 / 32768.0).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_sample_roundtrip() {
        let samples = vec![0i16, 1, -1, i16::MAX, i16::MIN];
        assert_eq!(bytes_to_samples(&samples_to_bytes(&samples)), samples);
    }

    #[test]
    fn odd_trailing_byte_ignored() {
        let mut bytes = samples_to_bytes(&[100, 200]);
        bytes.push(0x7f);
        assert_eq!(bytes_to_samples(&bytes), vec![100, 200]);
    }

    #[test]
    fn rms_of_silence_and_tone() {
        assert_eq!(rms_energy(&[]), 0.0);
        assert!(rms_energy(&[0; 160]) < 1.0);
        assert!(rms_energy(&[2000, -2000, 2000, -2000]) > 1900.0);
    }
}
