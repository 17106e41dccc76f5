//! Streaming LLM provider client.
//!
//! Speaks the messages wire format: a system block array (fixed segments
//! marked cacheable), user/assistant messages whose content is a list of
//! typed blocks, and tool definitions from the registry. Responses stream as
//! server-sent events; text deltas are forwarded to the caller the moment
//! they arrive, and tool-use blocks are assembled from partial-JSON deltas.
//!
//! Every outbound request passes through one process-wide semaphore, and
//! rate-limit responses retry with exponential backoff plus jitter.

use async_trait::async_trait;
use futures_util::StreamExt;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, info, warn};

use crate::config::LlmConfig;
use crate::error::LlmError;
use crate::tools::ToolSpec;

const ANTHROPIC_VERSION: &str = "2023-06-01";
const PROVIDER_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_ATTEMPTS: usize = 5;

/// One content block inside a message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text { text: String },
    ToolUse { id: String, name: String, input: Value },
    ToolResult { tool_use_id: String, content: String },
}

/// One wire message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub role: String,
    pub content: Vec<ContentBlock>,
}

impl Message {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: vec![ContentBlock::Text { text: text.into() }],
        }
    }

    pub fn assistant(blocks: Vec<ContentBlock>) -> Self {
        Self { role: "assistant".to_string(), content: blocks }
    }

    /// The user-role message carrying tool results back to the provider.
    pub fn tool_results(results: Vec<(String, String)>) -> Self {
        Self {
            role: "user".to_string(),
            content: results
                .into_iter()
                .map(|(tool_use_id, content)| ContentBlock::ToolResult { tool_use_id, content })
                .collect(),
        }
    }

    /// Concatenated text content, ignoring tool blocks.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }
}

/// One segment of the system prompt. Fixed segments are marked cacheable so
/// the provider can reuse them; the dynamic context segment is not.
#[derive(Debug, Clone, Serialize)]
pub struct SystemBlock {
    #[serde(rename = "type")]
    kind: &'static str,
    text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    cache_control: Option<Value>,
}

impl SystemBlock {
    pub fn cached(text: impl Into<String>) -> Self {
        Self {
            kind: "text",
            text: text.into(),
            cache_control: Some(json!({ "type": "ephemeral" })),
        }
    }

    pub fn dynamic(text: impl Into<String>) -> Self {
        Self { kind: "text", text: text.into(), cache_control: None }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
    Other,
}

impl StopReason {
    fn parse(raw: &str) -> Self {
        match raw {
            "end_turn" | "stop_sequence" => StopReason::EndTurn,
            "tool_use" => StopReason::ToolUse,
            "max_tokens" => StopReason::MaxTokens,
            _ => StopReason::Other,
        }
    }
}

/// Everything needed for one provider round.
#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub model: String,
    pub max_tokens: u32,
    pub system: Vec<SystemBlock>,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolSpec>,
}

/// A completed provider round: the assembled content blocks and why the
/// stream stopped.
#[derive(Debug, Clone)]
pub struct ProviderTurn {
    pub blocks: Vec<ContentBlock>,
    pub stop_reason: StopReason,
}

impl ProviderTurn {
    pub fn tool_uses(&self) -> Vec<(&str, &str, &Value)> {
        self.blocks
            .iter()
            .filter_map(|b| match b {
                ContentBlock::ToolUse { id, name, input } => {
                    Some((id.as_str(), name.as_str(), input))
                }
                _ => None,
            })
            .collect()
    }
}

/// Seam between the assistant and the concrete provider transport; tests
/// drive the tool loop with a scripted implementation.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    /// Run one streaming round. Text deltas go down `deltas` as they arrive;
    /// the assembled turn is returned when the stream closes.
    async fn stream_turn(
        &self,
        req: TurnRequest,
        deltas: mpsc::Sender<String>,
    ) -> Result<ProviderTurn, LlmError>;
}

/// HTTP client for the provider, sharing the process-wide request gate.
pub struct AnthropicClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    gate: Arc<Semaphore>,
}

impl AnthropicClient {
    pub fn new(cfg: &LlmConfig, gate: Arc<Semaphore>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            api_key: cfg.api_key.clone(),
            gate,
        }
    }

    async fn send_request(&self, req: &TurnRequest) -> Result<reqwest::Response, LlmError> {
        let body = json!({
            "model": req.model,
            "max_tokens": req.max_tokens,
            "stream": true,
            "system": req.system,
            "messages": req.messages,
            "tools": req.tools,
        });

        self.http
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(|e| LlmError::Provider(format!("request failed: {}", e)))
    }
}

#[async_trait]
impl ChatProvider for AnthropicClient {
    async fn stream_turn(
        &self,
        req: TurnRequest,
        deltas: mpsc::Sender<String>,
    ) -> Result<ProviderTurn, LlmError> {
        for attempt in 1..=MAX_ATTEMPTS {
            // Hold a permit for the whole request, including body streaming.
            let _permit = self
                .gate
                .acquire()
                .await
                .map_err(|_| LlmError::Cancelled)?;

            let response = tokio::time::timeout(PROVIDER_TIMEOUT, self.send_request(&req))
                .await
                .map_err(|_| LlmError::Timeout)??;

            let status = response.status();
            if status.as_u16() == 429 {
                drop(_permit);
                if attempt == MAX_ATTEMPTS {
                    warn!(attempt, "Rate limit retries exhausted");
                    return Err(LlmError::RateLimit);
                }
                let delay = backoff_delay(attempt);
                info!(attempt, delay_ms = delay.as_millis() as u64,
                      "Rate limited; backing off before retry");
                tokio::time::sleep(delay).await;
                continue;
            }
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(LlmError::Provider(format!("{}: {}", status, body)));
            }

            return tokio::time::timeout(PROVIDER_TIMEOUT, consume_stream(response, &deltas))
                .await
                .map_err(|_| LlmError::Timeout)?;
        }
        Err(LlmError::RateLimit)
    }
}

/// Exponential backoff base {1,2,4,8}s for retries 1..=4, with additive
/// jitter of ±(0.1–0.3)s.
fn backoff_delay(attempt: usize) -> Duration {
    let base = backoff_base_secs(attempt);
    let mut rng = rand::rng();
    let magnitude = rng.random_range(0.1..0.3);
    let jitter = if rng.random_bool(0.5) { magnitude } else { -magnitude };
    Duration::from_secs_f64((base as f64 + jitter).max(0.0))
}

fn backoff_base_secs(attempt: usize) -> u64 {
    // attempt is 1-based: first retry waits 1s, then 2, 4, 8.
    1u64 << (attempt.min(4) - 1)
}

/// Walk the SSE stream, forwarding text deltas and assembling blocks.
async fn consume_stream(
    response: reqwest::Response,
    deltas: &mpsc::Sender<String>,
) -> Result<ProviderTurn, LlmError> {
    let mut stream = response.bytes_stream();
    let mut buffer = String::new();
    let mut assembler = BlockAssembler::default();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| LlmError::Provider(format!("stream read: {}", e)))?;
        buffer.push_str(&String::from_utf8_lossy(&chunk));

        while let Some(pos) = buffer.find("\n\n") {
            let event = buffer[..pos].to_string();
            buffer = buffer[pos + 2..].to_string();

            for line in event.lines() {
                let Some(data) = line.strip_prefix("data: ") else { continue };
                let Ok(value) = serde_json::from_str::<Value>(data) else {
                    debug!("Skipping unparseable SSE data line");
                    continue;
                };
                if let Some(text) = assembler.apply(&value) {
                    if deltas.send(text).await.is_err() {
                        // Receiver gone: the turn was cancelled downstream.
                        return Err(LlmError::Cancelled);
                    }
                }
                if assembler.finished {
                    return Ok(assembler.into_turn());
                }
            }
        }
    }

    Ok(assembler.into_turn())
}

/// Accumulates streamed events into finished content blocks.
#[derive(Default)]
struct BlockAssembler {
    blocks: Vec<ContentBlock>,
    current_text: Option<String>,
    current_tool: Option<(String, String, String)>,
    stop_reason: Option<StopReason>,
    finished: bool,
}

impl BlockAssembler {
    /// Apply one event; returns text to forward downstream, if any.
    fn apply(&mut self, event: &Value) -> Option<String> {
        match event["type"].as_str()? {
            "content_block_start" => {
                let block = &event["content_block"];
                match block["type"].as_str() {
                    Some("tool_use") => {
                        self.current_tool = Some((
                            block["id"].as_str().unwrap_or_default().to_string(),
                            block["name"].as_str().unwrap_or_default().to_string(),
                            String::new(),
                        ));
                    }
                    _ => {
                        let initial = block["text"].as_str().unwrap_or_default();
                        self.current_text = Some(initial.to_string());
                        if !initial.is_empty() {
                            return Some(initial.to_string());
                        }
                    }
                }
                None
            }
            "content_block_delta" => {
                let delta = &event["delta"];
                match delta["type"].as_str() {
                    Some("text_delta") => {
                        let text = delta["text"].as_str().unwrap_or_default().to_string();
                        if let Some(buf) = self.current_text.as_mut() {
                            buf.push_str(&text);
                        }
                        (!text.is_empty()).then_some(text)
                    }
                    Some("input_json_delta") => {
                        if let Some((_, _, input)) = self.current_tool.as_mut() {
                            input.push_str(delta["partial_json"].as_str().unwrap_or_default());
                        }
                        None
                    }
                    _ => None,
                }
            }
            "content_block_stop" => {
                if let Some(text) = self.current_text.take() {
                    self.blocks.push(ContentBlock::Text { text });
                }
                if let Some((id, name, input)) = self.current_tool.take() {
                    let input = if input.trim().is_empty() {
                        json!({})
                    } else {
                        serde_json::from_str(&input).unwrap_or_else(|_| json!({}))
                    };
                    self.blocks.push(ContentBlock::ToolUse { id, name, input });
                }
                None
            }
            "message_delta" => {
                if let Some(reason) = event["delta"]["stop_reason"].as_str() {
                    self.stop_reason = Some(StopReason::parse(reason));
                }
                None
            }
            "message_stop" => {
                self.finished = true;
                None
            }
            _ => None,
        }
    }

    fn into_turn(mut self) -> ProviderTurn {
        // Close any block left open by a truncated stream.
        if let Some(text) = self.current_text.take() {
            self.blocks.push(ContentBlock::Text { text });
        }
        ProviderTurn {
            blocks: self.blocks,
            stop_reason: self.stop_reason.unwrap_or(StopReason::EndTurn),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_base_schedule() {
        assert_eq!(backoff_base_secs(1), 1);
        assert_eq!(backoff_base_secs(2), 2);
        assert_eq!(backoff_base_secs(3), 4);
        assert_eq!(backoff_base_secs(4), 8);
    }

    #[test]
    fn backoff_jitter_stays_in_band() {
        for attempt in 1..=4 {
            let base = backoff_base_secs(attempt) as f64;
            for _ in 0..50 {
                let d = backoff_delay(attempt).as_secs_f64();
                assert!(d >= base - 0.3 && d <= base + 0.3, "delay {} out of band", d);
            }
        }
    }

    #[test]
    fn message_text_ignores_tool_blocks() {
        let msg = Message::assistant(vec![
            ContentBlock::Text { text: "Logged ".into() },
            ContentBlock::ToolUse { id: "t1".into(), name: "log_health".into(), input: json!({}) },
            ContentBlock::Text { text: "it.".into() },
        ]);
        assert_eq!(msg.text(), "Logged it.");
    }

    #[test]
    fn system_block_cache_marker_serialization() {
        let cached = serde_json::to_value(SystemBlock::cached("persona")).unwrap();
        assert_eq!(cached["cache_control"]["type"], "ephemeral");
        let dynamic = serde_json::to_value(SystemBlock::dynamic("context")).unwrap();
        assert!(dynamic.get("cache_control").is_none());
    }

    #[test]
    fn assembler_builds_text_and_tool_blocks() {
        let mut a = BlockAssembler::default();
        let events = [
            json!({ "type": "message_start" }),
            json!({ "type": "content_block_start", "index": 0,
                    "content_block": { "type": "text", "text": "" } }),
            json!({ "type": "content_block_delta", "index": 0,
                    "delta": { "type": "text_delta", "text": "Checking. " } }),
            json!({ "type": "content_block_stop", "index": 0 }),
            json!({ "type": "content_block_start", "index": 1,
                    "content_block": { "type": "tool_use", "id": "tu_1", "name": "get_spending_today" } }),
            json!({ "type": "content_block_delta", "index": 1,
                    "delta": { "type": "input_json_delta", "partial_json": "{\"da" } }),
            json!({ "type": "content_block_delta", "index": 1,
                    "delta": { "type": "input_json_delta", "partial_json": "ys\": 3}" } }),
            json!({ "type": "content_block_stop", "index": 1 }),
            json!({ "type": "message_delta", "delta": { "stop_reason": "tool_use" } }),
            json!({ "type": "message_stop" }),
        ];

        let mut forwarded = String::new();
        for e in &events {
            if let Some(text) = a.apply(e) {
                forwarded.push_str(&text);
            }
        }
        assert!(a.finished);
        assert_eq!(forwarded, "Checking. ");

        let turn = a.into_turn();
        assert_eq!(turn.stop_reason, StopReason::ToolUse);
        assert_eq!(turn.blocks.len(), 2);
        match &turn.blocks[1] {
            ContentBlock::ToolUse { id, name, input } => {
                assert_eq!(id, "tu_1");
                assert_eq!(name, "get_spending_today");
                assert_eq!(input["days"], 3);
            }
            other => panic!("expected tool_use, got {:?}", other),
        }
    }

    #[test]
    fn stop_reason_parsing() {
        assert_eq!(StopReason::parse("end_turn"), StopReason::EndTurn);
        assert_eq!(StopReason::parse("tool_use"), StopReason::ToolUse);
        assert_eq!(StopReason::parse("max_tokens"), StopReason::MaxTokens);
        assert_eq!(StopReason::parse("weird"), StopReason::Other);
    }
}
