//! Text-to-speech adapter.
//!
//! Posts one sentence at a time to an OpenAI-compatible
//! `/v1/audio/speech` endpoint, requests WAV, and converts the payload to
//! raw 16 kHz 16-bit LE mono PCM for WebSocket streaming. The WAV walk is
//! manual: streaming servers emit 0xFFFFFFFF chunk sizes that strict
//! parsers reject.

use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use tracing::debug;

use crate::error::TtsError;

#[async_trait]
pub trait TextToSpeech: Send + Sync {
    /// Synthesize one sentence to PCM bytes. Empty input yields empty bytes.
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>, TtsError>;
}

/// HTTP client for a speech-synthesis server.
pub struct HttpTts {
    base_url: String,
    voice: String,
    http: reqwest::Client,
    timeout: Duration,
}

#[derive(Serialize)]
struct SpeechRequest<'a> {
    model: &'a str,
    input: &'a str,
    voice: &'a str,
    response_format: &'a str,
}

impl HttpTts {
    pub fn new(base_url: &str, voice: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            voice: voice.to_string(),
            http: reqwest::Client::new(),
            timeout: Duration::from_secs(30),
        }
    }
}

#[async_trait]
impl TextToSpeech for HttpTts {
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>, TtsError> {
        if text.is_empty() {
            return Ok(Vec::new());
        }

        let request = SpeechRequest {
            model: "tts-1",
            input: text,
            voice: &self.voice,
            response_format: "wav",
        };

        let response = self
            .http
            .post(format!("{}/v1/audio/speech", self.base_url))
            .json(&request)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| TtsError(format!("request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(TtsError(format!("{}: {}", status, body)));
        }

        let wav = response
            .bytes()
            .await
            .map_err(|e| TtsError(format!("read failed: {}", e)))?;

        let pcm = wav_to_pcm_i16(&wav).map_err(TtsError)?;
        debug!(
            "TTS produced {} bytes ({:.1}s of audio)",
            pcm.len(),
            pcm.len() as f64 / (16000.0 * 2.0)
        );
        Ok(pcm)
    }
}

/// Convert WAV bytes to raw PCM Int16 LE bytes.
///
/// Walks the chunk list by hand, tolerating 0xFFFFFFFF sizes from streaming
/// encoders, and converts IEEE float32 or int32 samples to int16.
pub(crate) fn wav_to_pcm_i16(wav: &[u8]) -> Result<Vec<u8>, String> {
    if wav.len() < 44 {
        return Err(format!("WAV data too short: {} bytes", wav.len()));
    }
    if &wav[0..4] != b"RIFF" || &wav[8..12] != b"WAVE" {
        return Err("not a valid WAV file".to_string());
    }

    let mut pos = 12;
    let mut data_start = 0usize;
    let mut audio_format = 0u16;
    let mut bits_per_sample = 0u16;

    while pos + 8 <= wav.len() {
        let chunk_id = &wav[pos..pos + 4];
        let chunk_size =
            u32::from_le_bytes([wav[pos + 4], wav[pos + 5], wav[pos + 6], wav[pos + 7]]);

        if chunk_id == b"fmt " {
            if pos + 8 + 16 <= wav.len() {
                audio_format = u16::from_le_bytes([wav[pos + 8], wav[pos + 9]]);
                bits_per_sample = u16::from_le_bytes([wav[pos + 22], wav[pos + 23]]);
            }
            let real_size = if chunk_size == 0xFFFFFFFF { 16 } else { chunk_size as usize };
            pos += 8 + real_size;
        } else if chunk_id == b"data" {
            data_start = pos + 8;
            break;
        } else {
            let real_size = if chunk_size == 0xFFFFFFFF { 0 } else { chunk_size as usize };
            pos += 8 + real_size;
        }
    }

    if data_start == 0 || data_start >= wav.len() {
        return Err("could not find data chunk in WAV".to_string());
    }

    let audio = &wav[data_start..];
    let mut pcm = Vec::new();

    match (audio_format, bits_per_sample) {
        // IEEE float32 -> int16
        (3, _) => {
            for chunk in audio.chunks_exact(4) {
                let f = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                let v = (f * 32767.0).clamp(-32768.0, 32767.0) as i16;
                pcm.extend_from_slice(&v.to_le_bytes());
            }
        }
        // Already int16 LE
        (1, 16) => pcm.extend_from_slice(audio),
        // int32 -> int16
        (1, 32) => {
            for chunk in audio.chunks_exact(4) {
                let v = i32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                pcm.extend_from_slice(&(((v >> 16) as i16).to_le_bytes()));
            }
        }
        (1, bits) => return Err(format!("unsupported WAV bit depth: {}", bits)),
        (fmt, _) => return Err(format!("unsupported WAV audio format: {}", fmt)),
    }

    Ok(pcm)
}
