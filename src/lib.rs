//! Pendant Bridge - real-time voice assistant server.
//!
//! Bridges a low-power pendant client to three external collaborators:
//! a speech-to-text engine, a streaming LLM, and a speech synthesizer.
//! Audio arrives over a WebSocket, is segmented into utterances,
//! transcribed, answered (with tool calls against the local health and
//! expense store), and streamed back as paced PCM.
//!
//! Module map:
//! - [`store`] - durable SQLite tables and aggregate queries
//! - [`tools`] - the tool catalog the LLM may invoke
//! - [`agent`] - provider client, conversation handle, sentence streaming
//! - [`voice`] - segmentation plus STT/TTS adapters
//! - [`server`] - the WebSocket session pipeline and HTTP surface
//! - [`memory`] - embedding codec and similarity recall

pub mod agent;
pub mod cli;
pub mod config;
pub mod error;
pub mod memory;
pub mod seed;
pub mod server;
pub mod store;
pub mod tools;
pub mod voice;

pub use agent::{Assistant, ChatProvider};
pub use config::Config;
pub use store::Store;
pub use tools::ToolRegistry;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
