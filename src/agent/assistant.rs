//! The per-session conversation handle.
//!
//! Owns bounded history, picks the model tier for each utterance, runs the
//! provider tool loop, and exposes the assistant's reply as an ordered
//! stream of sentences. One instance exists per WebSocket session; the
//! provider gate it shares with every other instance lives at process scope.

use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::agent::context::ContextBuilder;
use crate::agent::llm::{
    ChatProvider, ContentBlock, Message, ProviderTurn, StopReason, SystemBlock, TurnRequest,
};
use crate::agent::sentence::SentenceSplitter;
use crate::config::LlmConfig;
use crate::error::LlmError;
use crate::store::Store;
use crate::tools::ToolRegistry;

const PERSONA: &str = "You are the voice of a small wearable pendant, a personal health and \
spending companion. You are in a live spoken conversation: keep replies to one or two short \
sentences, speak naturally, and never use markdown, bullet points, or code blocks. Be warm \
and direct.";

const TOOL_POLICY: &str = "Use the tools for anything involving the user's health or spending \
data: log what they tell you, and look up real numbers before answering questions about them. \
Never fabricate or estimate stored data. If a tool reports an error, read it, correct your \
call if you can, and otherwise tell the user plainly what went wrong.";

const TOOL_CAP_APOLOGY: &str = "I wasn't able to complete that request.";

const DEEP_KEYWORDS: [&str; 6] = ["analyze", "correlate", "optimize", "forecast", "pattern", "why"];

/// Rough token estimate; precision is not needed for tier routing.
pub(crate) fn estimate_tokens(text: &str) -> usize {
    text.len().div_ceil(4)
}

/// One history entry: a user message, or the whole accumulated assistant
/// turn (tool-use rounds included).
#[derive(Debug, Clone, PartialEq)]
pub enum HistoryEntry {
    User(Message),
    Assistant(Vec<Message>),
}

/// Timings observed for one completed turn.
#[derive(Debug, Clone)]
pub struct TurnMetrics {
    pub model: String,
    pub first_sentence_ms: Option<u64>,
    pub total_ms: u64,
    pub tool_ms: u64,
    pub tool_rounds: usize,
}

pub struct Assistant {
    provider: Arc<dyn ChatProvider>,
    registry: Arc<ToolRegistry>,
    context: ContextBuilder,
    store: Arc<Store>,
    cfg: LlmConfig,
    history: Vec<HistoryEntry>,
}

impl Assistant {
    pub fn new(
        provider: Arc<dyn ChatProvider>,
        registry: Arc<ToolRegistry>,
        store: Arc<Store>,
        cfg: LlmConfig,
    ) -> Self {
        Self {
            provider,
            registry,
            context: ContextBuilder::new(store.clone()),
            store,
            cfg,
            history: Vec::new(),
        }
    }

    /// Clear conversation history.
    pub fn reset(&mut self) {
        self.history.clear();
        info!("Conversation history reset");
    }

    pub fn history(&self) -> &[HistoryEntry] {
        &self.history
    }

    /// Run one user turn, emitting sentences in order on `sentences`.
    ///
    /// Returns after the turn fully closes (all tool rounds done, residual
    /// text flushed). Dropping the receiver cancels the turn.
    pub async fn chat(
        &mut self,
        user_text: &str,
        sentences: mpsc::Sender<String>,
    ) -> Result<TurnMetrics, LlmError> {
        let started = Instant::now();
        let model = self.select_model(user_text);
        let system = self.system_blocks().await;

        let user_msg = Message::user(user_text);
        let mut turn_msgs: Vec<Message> = Vec::new();
        let mut splitter = SentenceSplitter::new();
        let mut first_sentence_ms: Option<u64> = None;
        let mut tool_ms: u64 = 0;
        let mut rounds = 0usize;
        let final_text;

        loop {
            if rounds >= self.cfg.max_tool_rounds {
                // The model is still asking for tools after the final round;
                // stop here rather than issue another call.
                warn!(rounds, "Tool loop cap reached; ending turn");
                emit_sentence(
                    &sentences,
                    &mut first_sentence_ms,
                    started,
                    TOOL_CAP_APOLOGY.to_string(),
                )
                .await?;
                turn_msgs.push(Message::assistant(vec![ContentBlock::Text {
                    text: TOOL_CAP_APOLOGY.to_string(),
                }]));
                final_text = TOOL_CAP_APOLOGY.to_string();
                break;
            }
            rounds += 1;
            let req = TurnRequest {
                model: model.clone(),
                max_tokens: self.cfg.max_tokens,
                system: system.clone(),
                messages: self.wire_messages(&user_msg, &turn_msgs),
                tools: self.registry.definitions().to_vec(),
            };

            let turn = self
                .stream_round(req, &mut splitter, &sentences, &mut first_sentence_ms, started)
                .await?;

            let tool_uses: Vec<(String, String, Value)> = turn
                .tool_uses()
                .into_iter()
                .map(|(id, name, input)| (id.to_string(), name.to_string(), input.clone()))
                .collect();

            if turn.stop_reason == StopReason::ToolUse && !tool_uses.is_empty() {
                let mut results = Vec::with_capacity(tool_uses.len());
                for (id, name, input) in tool_uses {
                    let t0 = Instant::now();
                    let registry = self.registry.clone();
                    let out = tokio::task::spawn_blocking(move || registry.dispatch(&name, &input))
                        .await
                        .map_err(|e| LlmError::Provider(format!("tool task failed: {}", e)))?;
                    tool_ms += t0.elapsed().as_millis() as u64;
                    results.push((id, out));
                }

                turn_msgs.push(Message::assistant(turn.blocks));
                turn_msgs.push(Message::tool_results(results));
                continue;
            }

            if let Some(rest) = splitter.flush() {
                emit_sentence(&sentences, &mut first_sentence_ms, started, rest).await?;
            }
            final_text = turn
                .blocks
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("");
            turn_msgs.push(Message::assistant(turn.blocks));
            break;
        }

        self.history.push(HistoryEntry::User(user_msg));
        self.history.push(HistoryEntry::Assistant(turn_msgs));
        self.trim_history();

        let metrics = TurnMetrics {
            model: model.clone(),
            first_sentence_ms,
            total_ms: started.elapsed().as_millis() as u64,
            tool_ms,
            tool_rounds: rounds,
        };
        info!(
            model = %metrics.model,
            first_sentence_ms = ?metrics.first_sentence_ms,
            total_ms = metrics.total_ms,
            tool_ms = metrics.tool_ms,
            rounds = metrics.tool_rounds,
            "Turn complete"
        );

        self.record_turn(user_text, &final_text, &model, metrics.total_ms as i64)
            .await;

        Ok(metrics)
    }

    /// Convenience wrapper that drains `chat()` into one string.
    pub async fn full_response(&mut self, user_text: &str) -> Result<String, LlmError> {
        let (tx, mut rx) = mpsc::channel(1024);
        self.chat(user_text, tx).await?;
        let mut parts = Vec::new();
        while let Ok(s) = rx.try_recv() {
            parts.push(s);
        }
        Ok(parts.join(" "))
    }

    /// Drive one provider round, forwarding sentences as deltas arrive.
    async fn stream_round(
        &self,
        req: TurnRequest,
        splitter: &mut SentenceSplitter,
        sentences: &mpsc::Sender<String>,
        first_sentence_ms: &mut Option<u64>,
        started: Instant,
    ) -> Result<ProviderTurn, LlmError> {
        let (dtx, mut drx) = mpsc::channel::<String>(32);
        let provider = self.provider.clone();
        let mut fut = std::pin::pin!(provider.stream_turn(req, dtx));
        let mut channel_open = true;

        loop {
            tokio::select! {
                maybe = drx.recv(), if channel_open => match maybe {
                    Some(chunk) => {
                        for s in splitter.push(&chunk) {
                            emit_sentence(sentences, first_sentence_ms, started, s).await?;
                        }
                    }
                    None => channel_open = false,
                },
                res = &mut fut => {
                    let turn = res?;
                    // The provider future resolved; drain whatever it queued.
                    while let Ok(chunk) = drx.try_recv() {
                        for s in splitter.push(&chunk) {
                            emit_sentence(sentences, first_sentence_ms, started, s).await?;
                        }
                    }
                    return Ok(turn);
                }
            }
        }
    }

    fn select_model(&self, text: &str) -> String {
        let estimate = estimate_tokens(text);
        let lowered = text.to_lowercase();
        let deep = estimate >= 1000 || DEEP_KEYWORDS.iter().any(|k| lowered.contains(k));
        let model = if deep { &self.cfg.deep_model } else { &self.cfg.fast_model };
        info!(model = %model, est_tokens = estimate, deep, "Selected model for turn");
        model.clone()
    }

    /// Persona and tool policy are fixed and provider-cacheable; the user
    /// context in between is regenerated every turn.
    async fn system_blocks(&self) -> Vec<SystemBlock> {
        let ctx = {
            let builder = self.context.clone();
            tokio::task::spawn_blocking(move || builder.build(7))
                .await
                .unwrap_or_default()
        };
        let mut blocks = vec![SystemBlock::cached(PERSONA)];
        if !ctx.is_empty() {
            blocks.push(SystemBlock::dynamic(ctx));
        }
        blocks.push(SystemBlock::cached(TOOL_POLICY));
        blocks
    }

    fn wire_messages(&self, user_msg: &Message, turn_msgs: &[Message]) -> Vec<Message> {
        let mut out = Vec::new();
        for entry in &self.history {
            match entry {
                HistoryEntry::User(m) => out.push(m.clone()),
                HistoryEntry::Assistant(msgs) => out.extend(msgs.iter().cloned()),
            }
        }
        out.push(user_msg.clone());
        out.extend(turn_msgs.iter().cloned());
        out
    }

    fn trim_history(&mut self) {
        while self.history.len() > self.cfg.history_max {
            self.history.remove(0);
        }
    }

    async fn record_turn(&self, user_text: &str, reply: &str, model: &str, latency_ms: i64) {
        let store = self.store.clone();
        let user_text = user_text.to_string();
        let reply = reply.to_string();
        let model = model.to_string();
        let result = tokio::task::spawn_blocking(move || {
            store.record_conversation("user", &user_text, &model, 0)?;
            store.record_conversation("assistant", &reply, &model, latency_ms)
        })
        .await;
        match result {
            Ok(Err(e)) => warn!("Failed to record conversation turn: {}", e),
            Err(e) => warn!("Conversation recording task failed: {}", e),
            Ok(Ok(_)) => {}
        }
    }
}

async fn emit_sentence(
    sentences: &mpsc::Sender<String>,
    first_sentence_ms: &mut Option<u64>,
    started: Instant,
    sentence: String,
) -> Result<(), LlmError> {
    if first_sentence_ms.is_none() {
        *first_sentence_ms = Some(started.elapsed().as_millis() as u64);
    }
    sentences.send(sentence).await.map_err(|_| LlmError::Cancelled)
}
