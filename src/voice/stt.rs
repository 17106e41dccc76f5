//! Speech-to-text adapter.
//!
//! The engine is an external collaborator; the bridge only knows its HTTP
//! contract. PCM is wrapped in an in-memory WAV and posted to an
//! OpenAI-compatible transcription endpoint.

use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::SttError;

/// Audio shorter than this is treated as silence and skipped entirely.
const MIN_AUDIO_MS: usize = 300;
const SAMPLE_RATE: u32 = 16000;

#[async_trait]
pub trait SpeechToText: Send + Sync {
    /// Best-effort transcript of a 16 kHz 16-bit mono buffer. Empty string
    /// for silent or too-short audio.
    async fn transcribe(&self, pcm: &[i16]) -> Result<String, SttError>;
}

/// HTTP client for a whisper-style transcription server.
pub struct HttpStt {
    base_url: String,
    http: reqwest::Client,
    timeout: Duration,
}

impl HttpStt {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
            timeout: Duration::from_secs(30),
        }
    }
}

#[async_trait]
impl SpeechToText for HttpStt {
    async fn transcribe(&self, pcm: &[i16]) -> Result<String, SttError> {
        if pcm.len() < SAMPLE_RATE as usize * MIN_AUDIO_MS / 1000 {
            debug!(samples = pcm.len(), "Audio too short; skipping transcription");
            return Ok(String::new());
        }

        debug!(
            "Transcribing {} samples ({:.1}s of audio)",
            pcm.len(),
            pcm.len() as f64 / SAMPLE_RATE as f64
        );

        let wav = pcm_to_wav(pcm, SAMPLE_RATE).map_err(|e| SttError(e.to_string()))?;
        let part = reqwest::multipart::Part::bytes(wav)
            .file_name("audio.wav")
            .mime_str("audio/wav")
            .map_err(|e| SttError(e.to_string()))?;
        let form = reqwest::multipart::Form::new().part("file", part);

        let response = self
            .http
            .post(format!("{}/v1/audio/transcriptions", self.base_url))
            .multipart(form)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| SttError(format!("request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(SttError(format!("{}: {}", status, body)));
        }

        let result: serde_json::Value = response
            .json()
            .await
            .map_err(|e| SttError(format!("bad response: {}", e)))?;

        let text = result
            .get("text")
            .and_then(|t| t.as_str())
            .unwrap_or("")
            .trim()
            .to_string();

        info!("Transcribed: \"{}\"", text);
        Ok(text)
    }
}

/// Convert PCM i16 samples to WAV bytes in memory.
pub(crate) fn pcm_to_wav(samples: &[i16], sample_rate: u32) -> anyhow::Result<Vec<u8>> {
    let mut cursor = std::io::Cursor::new(Vec::new());

    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut writer = hound::WavWriter::new(&mut cursor, spec)?;
    for &sample in samples {
        writer.write_sample(sample)?;
    }
    writer.finalize()?;
    Ok(cursor.into_inner())
}
