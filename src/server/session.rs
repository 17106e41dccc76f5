//! Per-connection session pipeline.
//!
//! One session owns the WebSocket, the utterance segmenter, and a
//! conversation handle. The receive path and the send path are separate
//! tasks so neither can stall the other; each user turn (STT → assistant →
//! TTS) runs as its own cancellable task while audio keeps accumulating for
//! the next utterance.
//!
//! States: Listening → Transcribing → Reasoning ⇄ Speaking → Listening,
//! with Closed entered from anywhere on disconnect or shutdown.

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::agent::Assistant;
use crate::error::LlmError;
use crate::server::ServerState;
#[cfg(feature = "silero")]
use crate::voice::segmenter::SpeechDetector;
use crate::voice::{bytes_to_samples, samples_to_bytes, Segmenter, SpeechToText, TextToSpeech};

/// Outbound binary frame size: 320 bytes = 10 ms at 16 kHz 16-bit mono.
const CHUNK_BYTES: usize = 320;
const CHUNK_MS: u64 = 10;
/// Bounded outbound queue: the TTS producer blocks here if the client
/// reads slowly.
const OUTBOUND_CAPACITY: usize = 8;

const STT_FALLBACK: &str = "I didn't catch that. Please try again.";
const LLM_FALLBACK: &str = "Sorry, I'm having trouble thinking right now. Please try again.";

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientMessage {
    Ping,
    Reset,
    EndOfSpeech,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ServerMessage {
    Connected { sample_rate: u32, chunk_size_ms: u32 },
    Pong,
    Status { state: String },
    Done { latency: TurnLatency },
    Error { message: String, code: String },
    /// Textual fallback when synthesis fails: the reply the client would
    /// have heard.
    Text { text: String },
}

#[derive(Debug, Default, Serialize)]
struct TurnLatency {
    stt_ms: u64,
    llm_ms: u64,
    tts_ms: u64,
    total_ms: u64,
}

/// Messages flowing to the sender task. The `turn` lane preserves the order
/// of status/audio/done within a turn; the `control` lane lets pongs and
/// acks jump ahead of queued audio.
enum Outbound {
    Json(ServerMessage),
    Audio(Vec<u8>),
}

pub async fn handle_socket(socket: WebSocket, state: ServerState) {
    use std::sync::atomic::Ordering;

    let session_id = Uuid::new_v4();
    state.connections.fetch_add(1, Ordering::Relaxed);
    info!(%session_id, "Voice session connected");

    run_session(socket, &state, session_id).await;

    state.connections.fetch_sub(1, Ordering::Relaxed);
    info!(%session_id, "Voice session closed");
}

fn build_segmenter(state: &ServerState) -> Segmenter {
    #[cfg(feature = "silero")]
    if let Some(path) = &state.config.engines.vad_model_path {
        match crate::voice::silero::SileroVad::load(path) {
            Ok(vad) => {
                return Segmenter::new(state.config.audio.into(), SpeechDetector::Silero(vad))
            }
            Err(e) => warn!("Silero VAD unavailable, falling back to RMS: {}", e),
        }
    }
    Segmenter::with_rms(state.config.audio.into())
}

async fn run_session(socket: WebSocket, state: &ServerState, session_id: Uuid) {
    let (ws_tx, mut ws_rx) = socket.split();

    let (turn_tx, turn_rx) = mpsc::channel::<Outbound>(OUTBOUND_CAPACITY);
    let (control_tx, control_rx) = mpsc::channel::<ServerMessage>(OUTBOUND_CAPACITY);
    let sender = tokio::spawn(sender_task(ws_tx, turn_rx, control_rx));

    let _ = control_tx
        .send(ServerMessage::Connected {
            sample_rate: state.config.audio.sample_rate,
            chunk_size_ms: CHUNK_MS as u32,
        })
        .await;
    let _ = control_tx.send(status("listening")).await;

    let assistant = Arc::new(Mutex::new(Assistant::new(
        state.provider.clone(),
        state.registry.clone(),
        state.store.clone(),
        state.config.llm.clone(),
    )));

    let mut segmenter = build_segmenter(state);
    let mut pending: VecDeque<Vec<i16>> = VecDeque::new();
    let (done_tx, mut done_rx) = mpsc::channel::<()>(1);
    let mut turn: Option<(JoinHandle<()>, CancellationToken)> = None;

    let deps = TurnDeps {
        assistant: assistant.clone(),
        stt: state.stt.clone(),
        tts: state.tts.clone(),
        out: turn_tx.clone(),
        done: done_tx.clone(),
        session: state.shutdown.child_token(),
    };

    loop {
        tokio::select! {
            _ = deps.session.cancelled() => {
                debug!(%session_id, "Server shutdown; closing session");
                break;
            }
            _ = done_rx.recv() => {
                turn = None;
                if let Some(utterance) = pending.pop_front() {
                    turn = Some(spawn_turn(&deps, utterance));
                }
            }
            incoming = ws_rx.next() => {
                let msg = match incoming {
                    Some(Ok(msg)) => msg,
                    Some(Err(e)) => {
                        debug!(%session_id, "Transport error: {}", e);
                        break;
                    }
                    None => break,
                };
                match msg {
                    Message::Binary(data) => {
                        let samples = bytes_to_samples(&data);
                        for utterance in segmenter.push(&samples) {
                            dispatch_utterance(utterance, &deps, &mut turn, &mut pending);
                        }
                    }
                    Message::Text(text) => match serde_json::from_str::<ClientMessage>(&text) {
                        Ok(ClientMessage::Ping) => {
                            let _ = control_tx.send(ServerMessage::Pong).await;
                        }
                        Ok(ClientMessage::Reset) => {
                            if let Some((handle, cancel)) = turn.take() {
                                cancel.cancel();
                                handle.abort();
                            }
                            while done_rx.try_recv().is_ok() {}
                            pending.clear();
                            segmenter.arm();
                            assistant.lock().await.reset();
                            let _ = control_tx.send(status("idle")).await;
                        }
                        Ok(ClientMessage::EndOfSpeech) => {
                            if let Some(utterance) = segmenter.force_close() {
                                dispatch_utterance(utterance, &deps, &mut turn, &mut pending);
                            }
                        }
                        Err(e) => debug!(%session_id, "Unrecognized control message: {}", e),
                    },
                    Message::Close(_) => break,
                    _ => {}
                }
            }
        }
    }

    // Closed: cancel in-flight work, stop sending.
    if let Some((handle, cancel)) = turn.take() {
        cancel.cancel();
        handle.abort();
    }
    drop(deps);
    drop(turn_tx);
    drop(control_tx);
    let _ = sender.await;
}

/// Start the utterance now, or queue it if a turn is already in flight.
fn dispatch_utterance(
    utterance: Vec<i16>,
    deps: &TurnDeps,
    turn: &mut Option<(JoinHandle<()>, CancellationToken)>,
    pending: &mut VecDeque<Vec<i16>>,
) {
    if turn.is_some() {
        debug!("Turn in flight; queueing utterance ({} samples)", utterance.len());
        pending.push_back(utterance);
    } else {
        *turn = Some(spawn_turn(deps, utterance));
    }
}

struct TurnDeps {
    assistant: Arc<Mutex<Assistant>>,
    stt: Arc<dyn SpeechToText>,
    tts: Arc<dyn TextToSpeech>,
    out: mpsc::Sender<Outbound>,
    done: mpsc::Sender<()>,
    session: CancellationToken,
}

fn spawn_turn(deps: &TurnDeps, utterance: Vec<i16>) -> (JoinHandle<()>, CancellationToken) {
    let cancel = deps.session.child_token();
    let turn = Turn {
        assistant: deps.assistant.clone(),
        stt: deps.stt.clone(),
        tts: deps.tts.clone(),
        out: deps.out.clone(),
        done: deps.done.clone(),
        cancel: cancel.clone(),
    };
    let handle = tokio::spawn(async move { turn.run(utterance).await });
    (handle, cancel)
}

struct Turn {
    assistant: Arc<Mutex<Assistant>>,
    stt: Arc<dyn SpeechToText>,
    tts: Arc<dyn TextToSpeech>,
    out: mpsc::Sender<Outbound>,
    done: mpsc::Sender<()>,
    cancel: CancellationToken,
}

impl Turn {
    async fn run(self, utterance: Vec<i16>) {
        let started = Instant::now();
        self.send_status("transcribing").await;

        let transcript = tokio::select! {
            _ = self.cancel.cancelled() => {
                let _ = self.done.try_send(());
                return;
            }
            res = self.stt.transcribe(&utterance) => res,
        };
        let stt_ms = started.elapsed().as_millis() as u64;

        let transcript = match transcript {
            Ok(text) => text,
            Err(e) => {
                warn!("STT failed: {}", e);
                self.send_error("stt", "Transcription failed").await;
                self.speak_fallback(STT_FALLBACK).await;
                self.finish_listening().await;
                return;
            }
        };

        // Silence or noise: nothing to reason about.
        if transcript.trim().is_empty() {
            debug!("Empty transcript; returning to listening");
            self.send_status("idle").await;
            let _ = self.done.try_send(());
            return;
        }

        self.send_status("reasoning").await;
        let llm_started = Instant::now();
        let (sentence_tx, mut sentence_rx) = mpsc::channel::<String>(8);
        let assistant = self.assistant.clone();
        let text = transcript.clone();
        let chat = tokio::spawn(async move {
            assistant.lock().await.chat(&text, sentence_tx).await
        });

        let mut tts_ms = 0u64;
        loop {
            let sentence = tokio::select! {
                _ = self.cancel.cancelled() => {
                    // Dropping the receiver cancels the chat at its next emit.
                    drop(sentence_rx);
                    chat.abort();
                    let _ = self.done.try_send(());
                    return;
                }
                s = sentence_rx.recv() => s,
            };
            let Some(sentence) = sentence else { break };

            self.send_status("speaking").await;
            tts_ms += self.speak(&sentence).await;
            // More sentences may still be streaming.
            self.send_status("reasoning").await;
        }

        match chat.await {
            Ok(Ok(metrics)) => {
                let latency = TurnLatency {
                    stt_ms,
                    llm_ms: (llm_started.elapsed().as_millis() as u64).saturating_sub(tts_ms),
                    tts_ms,
                    total_ms: started.elapsed().as_millis() as u64,
                };
                debug!(model = %metrics.model, rounds = metrics.tool_rounds, "Turn metrics recorded");
                let _ = self.out.send(Outbound::Json(ServerMessage::Done { latency })).await;
            }
            Ok(Err(LlmError::Cancelled)) => {}
            Ok(Err(e)) => {
                warn!("Assistant turn failed: {}", e);
                self.send_error("llm", "Assistant unavailable").await;
                self.speak_fallback(LLM_FALLBACK).await;
            }
            Err(e) => warn!("Chat task failed: {}", e),
        }

        self.finish_listening().await;
    }

    /// Synthesize one sentence and stream it as paced binary frames.
    /// Returns the synthesis time in milliseconds.
    async fn speak(&self, sentence: &str) -> u64 {
        let t0 = Instant::now();
        match self.tts.synthesize(sentence).await {
            Ok(pcm) => {
                let elapsed = t0.elapsed().as_millis() as u64;
                for frame in pcm.chunks(CHUNK_BYTES) {
                    if self.out.send(Outbound::Audio(frame.to_vec())).await.is_err() {
                        break;
                    }
                }
                elapsed
            }
            Err(e) => {
                warn!("TTS failed, sending text fallback: {}", e);
                let _ = self
                    .out
                    .send(Outbound::Json(ServerMessage::Text { text: sentence.to_string() }))
                    .await;
                t0.elapsed().as_millis() as u64
            }
        }
    }

    /// Spoken apology for a failed turn; falls back to text if TTS is also
    /// down.
    async fn speak_fallback(&self, message: &str) {
        let _ = self.speak(message).await;
    }

    async fn finish_listening(&self) {
        self.send_status("listening").await;
        let _ = self.done.try_send(());
    }

    async fn send_status(&self, state: &str) {
        let _ = self.out.send(Outbound::Json(status(state))).await;
    }

    async fn send_error(&self, code: &str, message: &str) {
        let _ = self
            .out
            .send(Outbound::Json(ServerMessage::Error {
                message: message.to_string(),
                code: code.to_string(),
            }))
            .await;
    }
}

fn status(state: &str) -> ServerMessage {
    ServerMessage::Status { state: state.to_string() }
}

/// Drains both outbound lanes onto the socket. Control messages (pong,
/// acks) take priority; audio frames are paced to real time so the client
/// buffer stays shallow. Send errors after a disconnect are absorbed.
async fn sender_task(
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut turn_rx: mpsc::Receiver<Outbound>,
    mut control_rx: mpsc::Receiver<ServerMessage>,
) {
    loop {
        let item = tokio::select! {
            biased;
            ctrl = control_rx.recv() => match ctrl {
                Some(msg) => Outbound::Json(msg),
                None => break,
            },
            out = turn_rx.recv() => match out {
                Some(item) => item,
                None => break,
            },
        };

        let result = match item {
            Outbound::Json(msg) => {
                let text = serde_json::to_string(&msg).unwrap_or_default();
                ws_tx.send(Message::Text(text.into())).await
            }
            Outbound::Audio(frame) => {
                let sent = ws_tx.send(Message::Binary(frame.into())).await;
                // Pace playback-rate delivery.
                tokio::time::sleep(Duration::from_millis(CHUNK_MS)).await;
                sent
            }
        };
        if result.is_err() {
            break;
        }
    }
}

/// Re-chunk a PCM buffer into wire-sized frames (used by tests to mirror
/// the client side).
#[allow(dead_code)]
fn frames(pcm: &[i16]) -> Vec<Vec<u8>> {
    samples_to_bytes(pcm).chunks(CHUNK_BYTES).map(|c| c.to_vec()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_messages_parse() {
        assert!(matches!(
            serde_json::from_str::<ClientMessage>(r#"{"type":"ping"}"#).unwrap(),
            ClientMessage::Ping
        ));
        assert!(matches!(
            serde_json::from_str::<ClientMessage>(r#"{"type":"reset"}"#).unwrap(),
            ClientMessage::Reset
        ));
        assert!(matches!(
            serde_json::from_str::<ClientMessage>(r#"{"type":"end_of_speech"}"#).unwrap(),
            ClientMessage::EndOfSpeech
        ));
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"bogus"}"#).is_err());
    }

    #[test]
    fn connected_message_shape() {
        let msg = ServerMessage::Connected { sample_rate: 16000, chunk_size_ms: 10 };
        let v: serde_json::Value = serde_json::to_value(&msg).unwrap();
        assert_eq!(v["type"], "connected");
        assert_eq!(v["sample_rate"], 16000);
        assert_eq!(v["chunk_size_ms"], 10);
    }

    #[test]
    fn done_message_carries_latency() {
        let msg = ServerMessage::Done {
            latency: TurnLatency { stt_ms: 120, llm_ms: 300, tts_ms: 80, total_ms: 500 },
        };
        let v: serde_json::Value = serde_json::to_value(&msg).unwrap();
        assert_eq!(v["type"], "done");
        assert_eq!(v["latency"]["stt_ms"], 120);
        assert_eq!(v["latency"]["total_ms"], 500);
    }

    #[test]
    fn frames_are_chunk_sized() {
        let pcm = vec![100i16; 1000];
        let frames = frames(&pcm);
        assert!(frames.iter().all(|f| f.len() <= CHUNK_BYTES));
        assert_eq!(frames.iter().map(Vec::len).sum::<usize>(), 2000);
    }
}
