//! Voice pipeline for the Parley backend.
//!
//! Defines the speech-to-text, language-model and text-to-speech
//! collaborator traits, their subprocess and HTTP adapters, and the
//! [`ConversationEngine`] that ties them to the cache, circuit breakers and
//! latency metrics.
//!
//! Each collaborator has a local stand-in (`PlaceholderStt`, `EchoLlm`,
//! `SilenceTts`) so the server runs end to end without whisper.cpp, Piper
//! or a model provider.

pub mod config;
pub mod engine;
pub mod error;
pub mod llm;
pub mod sse;
pub mod stt;
pub mod tts;

pub use config::{
    EngineConfig, LlmBackend, LlmConfig, SttBackend, SttConfig, TtsBackend, TtsConfig,
};
pub use engine::{
    reply_cache_key, AiReply, CachedReply, ConversationEngine, EngineSettings, EngineStats,
};
pub use error::{EngineError, VoiceError};
pub use llm::{ChunkSource, Completion, EchoLlm, LanguageModel, OpenAiCompatibleLlm, StreamChunk};
pub use stt::{PlaceholderStt, SpeechToText, WhisperStt};
pub use tts::{PiperTts, SilenceTts, TextToSpeech};
