//! Assistant integration tests driven by a scripted provider.
//!
//! The scripted provider plays back predetermined turns, which makes the
//! tool loop, history bookkeeping, and sentence stream fully deterministic
//! while still dispatching real tool calls against an in-memory store.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::mpsc;

use pendant_bridge::agent::llm::{ProviderTurn, StopReason, SystemBlock, TurnRequest};
use pendant_bridge::agent::{Assistant, ChatProvider, ContentBlock, HistoryEntry, Message};
use pendant_bridge::config::LlmConfig;
use pendant_bridge::error::LlmError;
use pendant_bridge::store::Store;
use pendant_bridge::tools::ToolRegistry;

/// One pre-scripted provider round.
#[derive(Clone)]
struct ScriptTurn {
    deltas: Vec<&'static str>,
    blocks: Vec<ContentBlock>,
    stop: StopReason,
}

impl ScriptTurn {
    fn text(text: &'static str) -> Self {
        Self {
            deltas: vec![text],
            blocks: vec![ContentBlock::Text { text: text.to_string() }],
            stop: StopReason::EndTurn,
        }
    }

    fn tool_use(id: &str, name: &str, input: serde_json::Value) -> Self {
        Self {
            deltas: Vec::new(),
            blocks: vec![ContentBlock::ToolUse {
                id: id.to_string(),
                name: name.to_string(),
                input,
            }],
            stop: StopReason::ToolUse,
        }
    }
}

/// Plays back scripted turns and records every request it saw.
struct ScriptedProvider {
    script: Mutex<VecDeque<ScriptTurn>>,
    requests: Mutex<Vec<TurnRequest>>,
    calls: AtomicUsize,
}

impl ScriptedProvider {
    fn new(turns: Vec<ScriptTurn>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(turns.into()),
            requests: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn request(&self, idx: usize) -> TurnRequest {
        self.requests.lock().unwrap()[idx].clone()
    }
}

#[async_trait]
impl ChatProvider for ScriptedProvider {
    async fn stream_turn(
        &self,
        req: TurnRequest,
        deltas: mpsc::Sender<String>,
    ) -> Result<ProviderTurn, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(req);

        let turn = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .expect("script exhausted: unexpected provider call");
        for d in &turn.deltas {
            let _ = deltas.send(d.to_string()).await;
        }
        Ok(ProviderTurn { blocks: turn.blocks, stop_reason: turn.stop })
    }
}

fn build(script: Vec<ScriptTurn>) -> (Assistant, Arc<ScriptedProvider>, Arc<Store>) {
    let store = Arc::new(Store::open_in_memory().unwrap());
    let registry = Arc::new(ToolRegistry::new(store.clone()));
    let provider = ScriptedProvider::new(script);
    let assistant = Assistant::new(provider.clone(), registry, store.clone(), LlmConfig::default());
    (assistant, provider, store)
}

async fn chat_collect(assistant: &mut Assistant, text: &str) -> Vec<String> {
    let (tx, mut rx) = mpsc::channel(64);
    assistant.chat(text, tx).await.unwrap();
    let mut out = Vec::new();
    while let Ok(s) = rx.try_recv() {
        out.push(s);
    }
    out
}

/// Find every tool_result block across a request's messages.
fn tool_results(req: &TurnRequest) -> Vec<(String, String)> {
    req.messages
        .iter()
        .flat_map(|m| m.content.iter())
        .filter_map(|b| match b {
            ContentBlock::ToolResult { tool_use_id, content } => {
                Some((tool_use_id.clone(), content.clone()))
            }
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn savings_goal_turn_runs_tool_and_streams_sentences() {
    let (mut assistant, provider, _store) = build(vec![
        ScriptTurn::tool_use(
            "tu_1",
            "calculate_savings_goal",
            json!({ "target_amount": 1200.0, "target_months": 6, "monthly_income": 4000.0 }),
        ),
        ScriptTurn::text("You need to save 200 dollars a month, and that is feasible. "),
    ]);

    let sentences =
        chat_collect(&mut assistant, "I want to save 1200 dollars in 6 months, I earn 4000 a month")
            .await;

    assert_eq!(sentences, vec!["You need to save 200 dollars a month, and that is feasible."]);
    assert!(sentences[0].contains("200"));
    assert!(sentences[0].contains("feasible"));
    assert_eq!(assistant.history().len(), 2);
    assert_eq!(provider.calls(), 2);

    // Fast model for a short, keyword-free request.
    assert_eq!(provider.request(0).model, LlmConfig::default().fast_model);

    // The second request must carry the real tool result back.
    let results = tool_results(&provider.request(1));
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].0, "tu_1");
    let payload: serde_json::Value = serde_json::from_str(&results[0].1).unwrap();
    assert_eq!(payload["monthly_savings_needed"], 200.0);
    assert_eq!(payload["feasible"], true);
    assert_eq!(payload["percentage_of_income"], 5.0);
    assert_eq!(payload["remaining_after_savings"], 3800.0);
}

#[tokio::test]
async fn expense_then_recall_sees_earlier_write() {
    let (mut assistant, provider, _store) = build(vec![
        ScriptTurn::tool_use(
            "tu_1",
            "track_expense",
            json!({ "amount": 45.5, "category": "food", "description": "dinner" }),
        ),
        ScriptTurn::text("Tracked 45 dollars 50 for dinner. "),
        ScriptTurn::tool_use("tu_2", "get_spending_today", json!({})),
        ScriptTurn::text("You spent 45 dollars 50 today, all on food. "),
    ]);

    chat_collect(&mut assistant, "I spent 45.50 on dinner").await;
    chat_collect(&mut assistant, "what did I spend today").await;

    // The second turn's tool result includes the first turn's expense.
    let results = tool_results(&provider.request(3));
    let today: serde_json::Value = serde_json::from_str(&results.last().unwrap().1).unwrap();
    assert_eq!(today["total"], 45.5);
    assert_eq!(today["by_category"]["food"], 45.5);

    assert_eq!(assistant.history().len(), 4);
}

#[tokio::test]
async fn tool_loop_cap_emits_one_apology_and_stops_calling() {
    // The model asks for a tool every round, far past the cap.
    let mut script = Vec::new();
    for i in 0..10 {
        script.push(ScriptTurn::tool_use(
            Box::leak(format!("tu_{}", i).into_boxed_str()),
            "get_health_today",
            json!({}),
        ));
    }
    let (mut assistant, provider, _store) = build(script);

    let sentences = chat_collect(&mut assistant, "log everything forever").await;

    // Exactly one final sentence, and the sixth provider call never happens.
    assert_eq!(sentences.len(), 1);
    assert!(sentences[0].contains("wasn't able"), "{}", sentences[0]);
    assert_eq!(provider.calls(), 5);
    assert_eq!(assistant.history().len(), 2);
}

#[tokio::test]
async fn tool_uses_equal_tool_results_and_stay_bounded() {
    let (mut assistant, _provider, _store) = build(vec![
        ScriptTurn::tool_use("tu_1", "log_health", json!({ "steps": 8000 })),
        ScriptTurn::tool_use("tu_2", "get_health_today", json!({})),
        ScriptTurn::text("Logged 8000 steps. "),
    ]);

    chat_collect(&mut assistant, "log 8000 steps and read it back").await;

    let HistoryEntry::Assistant(turn) = &assistant.history()[1] else {
        panic!("expected assistant entry");
    };
    let uses: usize = turn
        .iter()
        .flat_map(|m| m.content.iter())
        .filter(|b| matches!(b, ContentBlock::ToolUse { .. }))
        .count();
    let results: usize = turn
        .iter()
        .flat_map(|m| m.content.iter())
        .filter(|b| matches!(b, ContentBlock::ToolResult { .. }))
        .count();
    assert_eq!(uses, results);
    assert!(uses <= 5);
}

#[tokio::test]
async fn history_trims_fifo_at_twenty_entries() {
    let script: Vec<ScriptTurn> = (0..15).map(|_| ScriptTurn::text("Noted. ")).collect();
    let (mut assistant, _provider, _store) = build(script);

    for i in 0..15 {
        chat_collect(&mut assistant, &format!("message {}", i)).await;
    }

    assert_eq!(assistant.history().len(), 20);
    // Oldest turns dropped: the first surviving entry is turn 5's user message.
    match &assistant.history()[0] {
        HistoryEntry::User(m) => assert_eq!(m.text(), "message 5"),
        other => panic!("expected user entry, got {:?}", other),
    }
}

#[tokio::test]
async fn reset_then_chat_matches_fresh_assistant() {
    let (mut warmed, _p1, _s1) = build(vec![
        ScriptTurn::text("First answer. "),
        ScriptTurn::text("Hello there. "),
    ]);
    chat_collect(&mut warmed, "warm up question").await;
    warmed.reset();
    assert!(warmed.history().is_empty());
    chat_collect(&mut warmed, "hello").await;

    let (mut fresh, _p2, _s2) = build(vec![ScriptTurn::text("Hello there. ")]);
    chat_collect(&mut fresh, "hello").await;

    assert_eq!(warmed.history(), fresh.history());
}

#[tokio::test]
async fn full_response_drains_the_sentence_stream() {
    let (mut assistant, _provider, _store) =
        build(vec![ScriptTurn::text("One. Two! And three. ")]);
    let reply = assistant.full_response("say three things").await.unwrap();
    assert_eq!(reply, "One. Two! And three.");
}

#[tokio::test]
async fn completed_turns_are_recorded_in_the_store() {
    let (mut assistant, _provider, store) = build(vec![ScriptTurn::text("Done. ")]);
    chat_collect(&mut assistant, "quick one").await;

    let (turns, _avg) = store.turn_stats().unwrap();
    assert_eq!(turns, 1);
}

#[tokio::test]
async fn deep_keyword_selects_deep_model() {
    let (mut assistant, provider, _store) =
        build(vec![ScriptTurn::text("Your sleep trends down on weekdays. ")]);
    chat_collect(&mut assistant, "analyze my sleep this month").await;
    assert_eq!(provider.request(0).model, LlmConfig::default().deep_model);
}

#[tokio::test]
async fn system_prompt_marks_fixed_segments_cacheable() {
    let (mut assistant, provider, store) = build(vec![ScriptTurn::text("Okay. ")]);
    // Give the context builder something to summarize.
    store.log_health("steps", 9000.0, "", None).unwrap();

    chat_collect(&mut assistant, "hello").await;

    let system: Vec<SystemBlock> = provider.request(0).system;
    let values: Vec<serde_json::Value> =
        system.iter().map(|b| serde_json::to_value(b).unwrap()).collect();
    assert_eq!(values.len(), 3);
    // Persona and tool policy are cacheable; the middle context block is not.
    assert!(values[0].get("cache_control").is_some());
    assert!(values[1].get("cache_control").is_none());
    assert!(values[2].get("cache_control").is_some());
    assert!(values[1]["text"].as_str().unwrap().contains("steps"));
}

#[tokio::test]
async fn validation_error_envelope_flows_back_to_provider() {
    let (mut assistant, provider, store) = build(vec![
        ScriptTurn::tool_use("tu_1", "track_expense", json!({ "amount": 0.0, "category": "food" })),
        ScriptTurn::text("That amount doesn't look right. "),
    ]);

    chat_collect(&mut assistant, "track a zero dollar expense").await;

    let results = tool_results(&provider.request(1));
    let envelope: serde_json::Value = serde_json::from_str(&results[0].1).unwrap();
    assert!(envelope["error"].as_str().unwrap().contains("positive"));
    // Nothing was written.
    assert!(store.query_expenses(None, None, None, None).unwrap().is_empty());
}

#[tokio::test]
async fn dropping_receiver_cancels_turn_without_history_write() {
    let (mut assistant, _provider, _store) = build(vec![ScriptTurn {
        deltas: vec!["First sentence. ", "Second sentence. "],
        blocks: vec![ContentBlock::Text { text: "First sentence. Second sentence. ".into() }],
        stop: StopReason::EndTurn,
    }]);

    let (tx, rx) = mpsc::channel(1);
    drop(rx);
    let err = assistant.chat("hello", tx).await.unwrap_err();
    assert!(matches!(err, LlmError::Cancelled));
    assert!(assistant.history().is_empty());
}

#[test]
fn message_helpers_shape() {
    let m = Message::tool_results(vec![("tu_9".into(), "{\"ok\":true}".into())]);
    assert_eq!(m.role, "user");
    assert!(matches!(&m.content[0], ContentBlock::ToolResult { tool_use_id, .. } if tool_use_id == "tu_9"));
}
