//! Configuration management.
//!
//! Every option is read from the environment; CLI flags may override the
//! bind address. `Config::from_env()` is called once at startup and the
//! resulting value is shared by reference.

use serde::{Deserialize, Serialize};
use std::env;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub audio: AudioConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub engines: EngineConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Store file path; `:memory:` selects an in-memory database.
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AudioConfig {
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    #[serde(default = "default_channels")]
    pub channels: u16,
    /// Trailing silence that closes an utterance.
    #[serde(default = "default_silence_ms")]
    pub silence_ms: u32,
    /// Hard cap on a single utterance.
    #[serde(default = "default_max_recording_ms")]
    pub max_recording_ms: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Provider credential. Empty means unauthenticated (local gateway).
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_fast_model")]
    pub fast_model: String,
    #[serde(default = "default_deep_model")]
    pub deep_model: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Process-wide cap on concurrent provider requests.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_max_tool_rounds")]
    pub max_tool_rounds: usize,
    #[serde(default = "default_history_max")]
    pub history_max: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_stt_url")]
    pub stt_url: String,
    #[serde(default = "default_tts_url")]
    pub tts_url: String,
    #[serde(default = "default_tts_voice")]
    pub tts_voice: String,
    /// Optional path to a Silero VAD ONNX model (feature `silero`).
    #[serde(default)]
    pub vad_model_path: Option<String>,
}

fn default_host() -> String { "0.0.0.0".to_string() }
fn default_port() -> u16 { 8080 }
fn default_db_path() -> String { "pendant.db".to_string() }
fn default_sample_rate() -> u32 { 16000 }
fn default_channels() -> u16 { 1 }
fn default_silence_ms() -> u32 { 500 }
fn default_max_recording_ms() -> u32 { 10_000 }
fn default_base_url() -> String { "https://api.anthropic.com".to_string() }
fn default_fast_model() -> String { "claude-3-5-haiku-latest".to_string() }
fn default_deep_model() -> String { "claude-sonnet-4-20250514".to_string() }
fn default_max_tokens() -> u32 { 1024 }
fn default_concurrency() -> usize { 3 }
fn default_max_tool_rounds() -> usize { 5 }
fn default_history_max() -> usize { 20 }
fn default_stt_url() -> String { "http://127.0.0.1:8001".to_string() }
fn default_tts_url() -> String { "http://127.0.0.1:8002".to_string() }
fn default_tts_voice() -> String { "af_heart".to_string() }

impl Default for ServerConfig {
    fn default() -> Self {
        Self { host: default_host(), port: default_port(), db_path: default_db_path() }
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: default_sample_rate(),
            channels: default_channels(),
            silence_ms: default_silence_ms(),
            max_recording_ms: default_max_recording_ms(),
        }
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key: String::new(),
            fast_model: default_fast_model(),
            deep_model: default_deep_model(),
            max_tokens: default_max_tokens(),
            concurrency: default_concurrency(),
            max_tool_rounds: default_max_tool_rounds(),
            history_max: default_history_max(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            stt_url: default_stt_url(),
            tts_url: default_tts_url(),
            tts_voice: default_tts_voice(),
            vad_model_path: None,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            audio: AudioConfig::default(),
            llm: LlmConfig::default(),
            engines: EngineConfig::default(),
        }
    }
}

fn env_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    match env_var(name).map(|v| v.parse::<T>()) {
        Some(Ok(v)) => v,
        Some(Err(_)) => {
            tracing::warn!("Ignoring unparseable {} value", name);
            default
        }
        None => default,
    }
}

impl Config {
    /// Build a configuration from the process environment.
    pub fn from_env() -> Self {
        Self {
            server: ServerConfig {
                host: env_var("HOST").unwrap_or_else(default_host),
                port: env_parse("PORT", default_port()),
                db_path: env_var("DB_PATH").unwrap_or_else(default_db_path),
            },
            audio: AudioConfig {
                sample_rate: env_parse("SAMPLE_RATE", default_sample_rate()),
                channels: env_parse("CHANNELS", default_channels()),
                silence_ms: env_parse("SILENCE_MS", default_silence_ms()),
                max_recording_ms: env_parse("MAX_RECORDING_MS", default_max_recording_ms()),
            },
            llm: LlmConfig {
                base_url: env_var("LLM_BASE_URL").unwrap_or_else(default_base_url),
                api_key: env_var("LLM_API_KEY").unwrap_or_default(),
                fast_model: env_var("LLM_FAST_MODEL").unwrap_or_else(default_fast_model),
                deep_model: env_var("LLM_DEEP_MODEL").unwrap_or_else(default_deep_model),
                max_tokens: env_parse("LLM_MAX_TOKENS", default_max_tokens()),
                concurrency: env_parse("LLM_CONCURRENCY", default_concurrency()),
                max_tool_rounds: env_parse("LLM_MAX_TOOL_ROUNDS", default_max_tool_rounds()),
                history_max: env_parse("LLM_HISTORY_MAX", default_history_max()),
            },
            engines: EngineConfig {
                stt_url: env_var("STT_URL").unwrap_or_else(default_stt_url),
                tts_url: env_var("TTS_URL").unwrap_or_else(default_tts_url),
                tts_voice: env_var("TTS_VOICE").unwrap_or_else(default_tts_voice),
                vad_model_path: env_var("VAD_MODEL_PATH"),
            },
        }
    }

    /// True when the store should open an in-memory database.
    pub fn in_memory_store(&self) -> bool {
        self.server.db_path == ":memory:"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = Config::default();
        assert_eq!(cfg.audio.sample_rate, 16000);
        assert_eq!(cfg.audio.channels, 1);
        assert_eq!(cfg.audio.silence_ms, 500);
        assert_eq!(cfg.audio.max_recording_ms, 10_000);
        assert_eq!(cfg.llm.concurrency, 3);
        assert_eq!(cfg.llm.max_tool_rounds, 5);
        assert_eq!(cfg.llm.history_max, 20);
    }

    #[test]
    fn in_memory_selector() {
        let mut cfg = Config::default();
        assert!(!cfg.in_memory_store());
        cfg.server.db_path = ":memory:".to_string();
        assert!(cfg.in_memory_store());
    }
}
