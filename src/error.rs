//! Error types for the aura runtime.

use crate::state::State;

/// Top-level error type for the voice assistant runtime.
#[derive(Debug, thiserror::Error)]
pub enum AuraError {
    /// Audio device, capture, or playback error.
    #[error("audio error: {0}")]
    Audio(String),

    /// Voice activity detection error.
    #[error("VAD error: {0}")]
    Vad(String),

    /// Speech-to-text session error.
    #[error("STT error: {0}")]
    Stt(String),

    /// Language model request or streaming error.
    #[error("LLM error: {0}")]
    Llm(String),

    /// Text-to-speech synthesis error.
    #[error("TTS error: {0}")]
    Tts(String),

    /// Attempted a state transition not in the transition table.
    #[error("invalid transition: {from} -> {to}")]
    InvalidTransition { from: State, to: State },

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// GraphRAG store error.
    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),

    /// Memory extraction / retrieval error.
    #[error("memory error: {0}")]
    Memory(String),

    /// Tool registry / execution error.
    #[error("tool error: {0}")]
    Tool(String),

    /// Channel send/receive error.
    #[error("channel error: {0}")]
    Channel(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encode/decode error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, AuraError>;
