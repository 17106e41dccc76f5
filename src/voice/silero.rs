//! Silero VAD speech probability via ONNX Runtime.
//!
//! The model takes one 512-sample window (16 kHz, f32 normalized) plus a
//! recurrent state tensor and returns a speech probability. The state
//! persists across windows within an utterance and is cleared between
//! utterances. The segmenter owns all boundary logic; this type only scores
//! windows.

use anyhow::{Context, Result};
use ort::session::Session;
use std::path::Path;
use tracing::info;

const SAMPLE_RATE: i64 = 16000;

pub struct SileroVad {
    session: Session,
    /// Hidden state tensor (2, 1, 128), threaded through every call.
    state: Vec<f32>,
}

impl SileroVad {
    /// Load the ONNX model from a configured path.
    pub fn load<P: AsRef<Path>>(model_path: P) -> Result<Self> {
        let session = Session::builder()?
            .with_intra_threads(1)?
            .commit_from_file(model_path.as_ref())
            .context("Failed to create ONNX session for Silero VAD")?;

        info!("Silero VAD loaded from {}", model_path.as_ref().display());
        Ok(Self { session, state: vec![0.0f32; 2 * 128] })
    }

    /// Speech probability for one 512-sample window of f32 audio in
    /// [-1.0, 1.0].
    pub fn probability(&mut self, window: &[f32]) -> Result<f32> {
        use ort::value::Value;

        let input = Value::from_array(([1usize, window.len()], window.to_vec()))?;
        let state = Value::from_array(([2usize, 1usize, 128usize], self.state.clone()))?;
        let sr = Value::from_array(([1usize], vec![SAMPLE_RATE]))?;

        let outputs = self.session.run(ort::inputs![input, state, sr])?;

        let (_shape, prob) = outputs[0].try_extract_tensor::<f32>()?;
        let probability = prob.first().copied().unwrap_or(0.0);

        let (_shape, new_state) = outputs[1].try_extract_tensor::<f32>()?;
        if new_state.len() == self.state.len() {
            self.state.copy_from_slice(new_state);
        }

        Ok(probability)
    }

    /// Clear the recurrent state (between utterances).
    pub fn reset(&mut self) {
        self.state.fill(0.0);
    }
}
