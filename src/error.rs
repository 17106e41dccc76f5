//! Error taxonomy shared across the bridge.
//!
//! Each variant maps to a distinct handling policy: validation errors are
//! returned to the LLM as tool envelopes, engine errors fail a single turn,
//! transport errors close the session, and cancellation is always silent.

use thiserror::Error;

/// Store-level failures.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Foreign-key or constraint violation.
    #[error("integrity violation: {0}")]
    Integrity(String),
    /// Underlying SQLite / I/O failure.
    #[error("storage error: {0}")]
    Storage(String),
    #[error("not found")]
    NotFound,
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        match &e {
            rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
            rusqlite::Error::SqliteFailure(err, msg) => {
                if err.code == rusqlite::ErrorCode::ConstraintViolation {
                    StoreError::Integrity(msg.clone().unwrap_or_else(|| err.to_string()))
                } else {
                    StoreError::Storage(e.to_string())
                }
            }
            _ => StoreError::Storage(e.to_string()),
        }
    }
}

/// Tool handler failures. `Validation` is caller-visible (the LLM reads the
/// envelope and corrects itself); `Internal` is logged and replaced by a
/// generic envelope at the dispatch boundary.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    Internal(String),
}

impl From<StoreError> for ToolError {
    fn from(e: StoreError) -> Self {
        match e {
            // FK violations inside a tool mean the tool was handed a bad id.
            StoreError::Integrity(msg) => ToolError::Validation(msg),
            other => ToolError::Internal(other.to_string()),
        }
    }
}

/// LLM provider failures.
#[derive(Debug, Error)]
pub enum LlmError {
    /// HTTP 429. Retried internally with backoff; surfaces only on exhaustion.
    #[error("rate limited by provider")]
    RateLimit,
    #[error("provider error: {0}")]
    Provider(String),
    #[error("provider call timed out")]
    Timeout,
    #[error("turn cancelled")]
    Cancelled,
}

#[derive(Debug, Error)]
#[error("speech-to-text failed: {0}")]
pub struct SttError(pub String);

#[derive(Debug, Error)]
#[error("text-to-speech failed: {0}")]
pub struct TtsError(pub String);
