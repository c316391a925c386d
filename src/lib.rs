//! Aura: real-time, always-on voice assistant runtime.
//!
//! A microphone stream is continuously analyzed for voice activity; detected
//! speech is transcribed by a streaming STT session; completed utterances
//! drive a streaming LLM reply that is synthesized sentence-by-sentence and
//! played back, with barge-in support. Completed turns feed a GraphRAG
//! memory subsystem (entity/relationship extraction, community detection,
//! budgeted retrieval).
//!
//! # Architecture
//!
//! - **Audio capture**: microphone via `cpal`, posting s16le chunks to the
//!   orchestrator from the driver thread
//! - **VAD**: Silero ONNX scoring with hysteresis and a pre-trigger ring
//! - **STT**: Deepgram-style WebSocket streaming session
//! - **LLM**: Anthropic Messages SSE streaming with tool use
//! - **TTS**: ElevenLabs streaming synthesis
//! - **Playback**: `paplay` subprocess sink
//! - **Memory**: pgvector-backed entity graph with Louvain communities

pub mod audio;
pub mod community;
pub mod config;
pub mod context;
pub mod conversation_log;
pub mod embeddings;
pub mod error;
pub mod hass;
pub mod llm;
pub mod memory;
pub mod persona;
pub mod pipeline;
pub mod processing;
pub mod reranker;
pub mod server;
pub mod state;
pub mod store;
pub mod stt;
pub mod tts;
pub mod turn;
pub mod vad;

pub use config::Config;
pub use error::{AuraError, Result};
pub use pipeline::{Pipeline, PipelineDeps};
pub use state::{State, StateMachine};
