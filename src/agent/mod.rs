//! LLM orchestration: provider transport, conversation handle, sentence
//! streaming, and the dynamic context segment.

pub mod assistant;
pub mod context;
pub mod llm;
pub mod sentence;

pub use assistant::{Assistant, HistoryEntry, TurnMetrics};
pub use llm::{AnthropicClient, ChatProvider, ContentBlock, Message, ProviderTurn, StopReason};
