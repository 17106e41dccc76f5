//! Utterance segmentation over a stream of PCM chunks.
//!
//! The segmenter is stateful per session. Incoming chunks may be any size;
//! they are re-framed into fixed analysis windows, each scored with a
//! speech probability (neural model when available, RMS threshold
//! otherwise). An utterance completes when trailing low-probability audio
//! reaches the silence threshold, or when the hard recording cap is hit.
//!
//! Lifecycle: the segmenter starts *armed* (push-to-talk — the client only
//! streams while engaged, so the first audio opens an utterance whether or
//! not it contains speech). After an utterance completes it idles,
//! discarding silence, until a speech window opens the next utterance.
//! `arm()` restores the initial behavior after a client reset.

use tracing::{debug, warn};

use crate::config::AudioConfig;

/// Analysis window: 512 samples = 32 ms at 16 kHz, the frame the neural
/// model expects.
pub const WINDOW_SAMPLES: usize = 512;

/// Speech probability above which a window counts as voiced.
const SPEECH_THRESHOLD: f32 = 0.5;

/// RMS level above which the fallback detector calls a window voiced.
const RMS_SPEECH_LEVEL: f32 = 200.0;

/// Soft cap on buffered audio (~10 s at 16 kHz).
const MAX_BUFFER_SECONDS: usize = 10;

#[derive(Debug, Clone, Copy)]
pub struct SegmenterConfig {
    pub sample_rate: u32,
    pub silence_ms: u32,
    pub max_recording_ms: u32,
}

impl From<AudioConfig> for SegmenterConfig {
    fn from(a: AudioConfig) -> Self {
        Self {
            sample_rate: a.sample_rate,
            silence_ms: a.silence_ms,
            max_recording_ms: a.max_recording_ms,
        }
    }
}

/// Per-window speech scorer.
pub enum SpeechDetector {
    /// RMS threshold fallback: cheap and always available.
    Rms,
    #[cfg(feature = "silero")]
    Silero(crate::voice::silero::SileroVad),
}

impl SpeechDetector {
    fn probability(&mut self, window: &[i16]) -> f32 {
        match self {
            SpeechDetector::Rms => {
                if crate::voice::rms_energy(window) > RMS_SPEECH_LEVEL {
                    1.0
                } else {
                    0.0
                }
            }
            #[cfg(feature = "silero")]
            SpeechDetector::Silero(vad) => {
                let samples = crate::voice::i16_to_f32(window);
                vad.probability(&samples).unwrap_or_else(|e| {
                    warn!("VAD inference error, treating window as silence: {}", e);
                    0.0
                })
            }
        }
    }

    fn reset(&mut self) {
        #[cfg(feature = "silero")]
        if let SpeechDetector::Silero(vad) = self {
            vad.reset();
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Next window opens an utterance unconditionally.
    Armed,
    /// Accumulating an utterance.
    Utterance,
    /// Between utterances; silence is discarded until speech resumes.
    Idle,
}

pub struct Segmenter {
    cfg: SegmenterConfig,
    detector: SpeechDetector,
    phase: Phase,
    /// Samples not yet forming a full analysis window.
    pending: Vec<i16>,
    /// The utterance being accumulated.
    buffer: Vec<i16>,
    /// Consecutive trailing low-probability samples.
    trailing_silence: usize,
}

impl Segmenter {
    pub fn new(cfg: SegmenterConfig, detector: SpeechDetector) -> Self {
        Self {
            cfg,
            detector,
            phase: Phase::Armed,
            pending: Vec::with_capacity(WINDOW_SAMPLES * 2),
            buffer: Vec::new(),
            trailing_silence: 0,
        }
    }

    pub fn with_rms(cfg: SegmenterConfig) -> Self {
        Self::new(cfg, SpeechDetector::Rms)
    }

    /// Feed one PCM chunk of any size. Returns the utterances this chunk
    /// completed — usually none or one, but a large chunk can close more.
    pub fn push(&mut self, chunk: &[i16]) -> Vec<Vec<i16>> {
        self.pending.extend_from_slice(chunk);

        let mut completed = Vec::new();
        while self.pending.len() >= WINDOW_SAMPLES {
            let window: Vec<i16> = self.pending.drain(..WINDOW_SAMPLES).collect();
            if let Some(utterance) = self.process_window(&window) {
                completed.push(utterance);
            }
        }
        completed
    }

    /// Force-close the current utterance (`end_of_speech`), if any audio is
    /// buffered.
    pub fn force_close(&mut self) -> Option<Vec<i16>> {
        self.buffer.extend(self.pending.drain(..));
        if self.buffer.is_empty() {
            return None;
        }
        Some(self.finish())
    }

    /// Restore push-to-talk arming (client reset).
    pub fn arm(&mut self) {
        self.pending.clear();
        self.buffer.clear();
        self.trailing_silence = 0;
        self.phase = Phase::Armed;
        self.detector.reset();
    }

    fn process_window(&mut self, window: &[i16]) -> Option<Vec<i16>> {
        let voiced = self.detector.probability(window) >= SPEECH_THRESHOLD;

        match self.phase {
            Phase::Armed => {
                self.phase = Phase::Utterance;
            }
            Phase::Idle => {
                if !voiced {
                    return None;
                }
                debug!("Speech resumed; opening new utterance");
                self.phase = Phase::Utterance;
            }
            Phase::Utterance => {}
        }

        self.buffer.extend_from_slice(window);
        if voiced {
            self.trailing_silence = 0;
        } else {
            self.trailing_silence += window.len();
        }

        self.enforce_soft_cap();

        let silence_samples = self.ms_to_samples(self.cfg.silence_ms);
        let max_samples = self.ms_to_samples(self.cfg.max_recording_ms);

        if self.trailing_silence >= silence_samples {
            debug!(
                buffered_ms = self.samples_to_ms(self.buffer.len()),
                "Trailing silence reached threshold; closing utterance"
            );
            return Some(self.finish());
        }
        if self.buffer.len() >= max_samples {
            debug!("Max recording length reached; closing utterance");
            return Some(self.finish());
        }
        None
    }

    fn finish(&mut self) -> Vec<i16> {
        self.phase = Phase::Idle;
        self.trailing_silence = 0;
        self.detector.reset();
        std::mem::take(&mut self.buffer)
    }

    fn enforce_soft_cap(&mut self) {
        let cap = self.cfg.sample_rate as usize * MAX_BUFFER_SECONDS;
        if self.buffer.len() > cap {
            let excess = self.buffer.len() - cap;
            self.buffer.drain(..excess);
            warn!(trimmed_samples = excess, "Audio buffer over soft cap; trimming oldest PCM");
        }
    }

    fn ms_to_samples(&self, ms: u32) -> usize {
        (self.cfg.sample_rate as usize * ms as usize) / 1000
    }

    fn samples_to_ms(&self, samples: usize) -> usize {
        samples * 1000 / self.cfg.sample_rate as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> SegmenterConfig {
        SegmenterConfig { sample_rate: 16000, silence_ms: 500, max_recording_ms: 10_000 }
    }

    fn silence(ms: usize) -> Vec<i16> {
        vec![0i16; 16 * ms]
    }

    fn speech(ms: usize) -> Vec<i16> {
        // Square wave well above the RMS threshold.
        (0..16 * ms).map(|i| if i % 2 == 0 { 3000 } else { -3000 }).collect()
    }

    /// Stream audio in 10 ms chunks, collecting completed utterances.
    fn stream(seg: &mut Segmenter, samples: &[i16]) -> Vec<Vec<i16>> {
        let mut out = Vec::new();
        for chunk in samples.chunks(160) {
            out.extend(seg.push(chunk));
        }
        out
    }

    #[test]
    fn armed_silence_fires_exactly_once() {
        let mut seg = Segmenter::with_rms(cfg());
        let utterances = stream(&mut seg, &silence(3000));
        assert_eq!(utterances.len(), 1);
        // Closed right around the silence threshold.
        let ms = utterances[0].len() / 16;
        assert!((500..=600).contains(&ms), "closed after {} ms", ms);
    }

    #[test]
    fn speech_then_silence_closes_with_content() {
        let mut seg = Segmenter::with_rms(cfg());
        let mut audio = speech(1000);
        audio.extend(silence(800));
        let utterances = stream(&mut seg, &audio);
        assert_eq!(utterances.len(), 1);
        let ms = utterances[0].len() / 16;
        assert!(ms >= 1400, "utterance too short: {} ms", ms);
    }

    #[test]
    fn idle_discards_silence_until_speech_resumes() {
        let mut seg = Segmenter::with_rms(cfg());
        // First utterance closes, then a long stretch of silence.
        let mut audio = speech(600);
        audio.extend(silence(4000));
        let utterances = stream(&mut seg, &audio);
        assert_eq!(utterances.len(), 1);

        // Speech again: a second utterance opens and closes.
        let mut audio = speech(600);
        audio.extend(silence(800));
        let utterances = stream(&mut seg, &audio);
        assert_eq!(utterances.len(), 1);
    }

    #[test]
    fn max_recording_closes_despite_continuous_speech() {
        let mut seg = Segmenter::with_rms(SegmenterConfig {
            max_recording_ms: 2000,
            ..cfg()
        });
        let utterances = stream(&mut seg, &speech(5000));
        assert!(!utterances.is_empty());
        let ms = utterances[0].len() / 16;
        assert!((1900..=2100).contains(&ms), "cap closed at {} ms", ms);
    }

    #[test]
    fn force_close_yields_buffered_audio() {
        let mut seg = Segmenter::with_rms(cfg());
        assert!(seg.push(&speech(200)).is_empty());
        let utt = seg.force_close().expect("buffered audio");
        assert!(!utt.is_empty());
        // Nothing left afterwards.
        assert!(seg.force_close().is_none());
    }

    #[test]
    fn arbitrary_chunk_sizes_are_reframed() {
        let mut seg = Segmenter::with_rms(cfg());
        let mut audio = speech(600);
        audio.extend(silence(800));
        // Deliver in ragged chunks: 7, 333, 1024, ... samples.
        let mut utterances = Vec::new();
        let mut i = 0usize;
        let sizes = [7usize, 333, 1024, 160, 2048, 51];
        let mut s = 0;
        while i < audio.len() {
            let n = sizes[s % sizes.len()].min(audio.len() - i);
            utterances.extend(seg.push(&audio[i..i + n]));
            i += n;
            s += 1;
        }
        assert_eq!(utterances.len(), 1);
    }

    #[test]
    fn rearm_after_reset_accepts_silence_again() {
        let mut seg = Segmenter::with_rms(cfg());
        assert_eq!(stream(&mut seg, &silence(1000)).len(), 1);
        // Idle now: more silence does nothing.
        assert!(stream(&mut seg, &silence(1000)).is_empty());
        seg.arm();
        assert_eq!(stream(&mut seg, &silence(1000)).len(), 1);
    }
}
