use crate::engine::EngineSettings;
use crate::llm::{EchoLlm, LanguageModel, OpenAiCompatibleLlm};
use crate::stt::{PlaceholderStt, SpeechToText, WhisperStt};
use crate::tts::{PiperTts, SilenceTts, TextToSpeech};
use parley_resilience::{ProviderQuotaConfig, RetryPolicy};
use parley_types::{Persona, VoiceProfile};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SttBackend {
    /// Canned transcripts, no external binary.
    #[default]
    Placeholder,
    Whisper,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SttConfig {
    #[serde(default)]
    pub backend: SttBackend,
    #[serde(default = "default_whisper_binary")]
    pub binary_path: String,
    #[serde(default = "default_whisper_model")]
    pub model_path: String,
    #[serde(default = "default_language")]
    pub language: String,
}

fn default_whisper_binary() -> String {
    "whisper-cpp".to_string()
}

fn default_whisper_model() -> String {
    "/usr/local/share/whisper/models/ggml-base.en.bin".to_string()
}

fn default_language() -> String {
    "en".to_string()
}

impl Default for SttConfig {
    fn default() -> Self {
        Self {
            backend: SttBackend::default(),
            binary_path: default_whisper_binary(),
            model_path: default_whisper_model(),
            language: default_language(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TtsBackend {
    /// Silent PCM, one chunk per word.
    #[default]
    Silence,
    Piper,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtsConfig {
    #[serde(default)]
    pub backend: TtsBackend,
    #[serde(default = "default_piper_binary")]
    pub piper_binary: String,
    #[serde(default = "default_voices_dir")]
    pub voices_dir: String,
    #[serde(default)]
    pub profile: VoiceProfile,
    /// Bytes of PCM per emitted chunk.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

fn default_piper_binary() -> String {
    "piper".to_string()
}

fn default_voices_dir() -> String {
    "assets/voices".to_string()
}

fn default_chunk_size() -> usize {
    4096
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            backend: TtsBackend::default(),
            piper_binary: default_piper_binary(),
            voices_dir: default_voices_dir(),
            profile: VoiceProfile::default(),
            chunk_size: default_chunk_size(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LlmBackend {
    /// Echoes the user's message back. No network.
    #[default]
    Echo,
    /// Any `/chat/completions` endpoint speaking the OpenAI wire format.
    OpenAi,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default)]
    pub backend: LlmBackend,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default, skip_serializing)]
    pub api_key: String,
    #[serde(default = "default_model")]
    pub model: String,
    /// Models rotated to, in order, when the provider rate-limits the
    /// current one.
    #[serde(default)]
    pub fallback_models: Vec<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default)]
    pub quota: ProviderQuotaConfig,
}

fn default_base_url() -> String {
    "https://openrouter.ai/api/v1".to_string()
}

fn default_model() -> String {
    "meta-llama/llama-3.2-3b-instruct:free".to_string()
}

fn default_max_tokens() -> u32 {
    150
}

fn default_temperature() -> f32 {
    0.7
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            backend: LlmBackend::default(),
            base_url: default_base_url(),
            api_key: String::new(),
            model: default_model(),
            fallback_models: Vec::new(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            quota: ProviderQuotaConfig::default(),
        }
    }
}

impl fmt::Debug for LlmConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LlmConfig")
            .field("backend", &self.backend)
            .field("base_url", &self.base_url)
            .field("api_key", &"[REDACTED]")
            .field("model", &self.model)
            .field("fallback_models", &self.fallback_models)
            .field("max_tokens", &self.max_tokens)
            .field("temperature", &self.temperature)
            .field("quota", &self.quota)
            .finish()
    }
}

/// The `[engine]` configuration section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Bound on every STT, LLM and TTS call.
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
    /// TTL of cached replies.
    #[serde(default = "default_response_ttl_secs")]
    pub response_ttl_secs: u64,
    /// Total LLM attempts per reply, including the first.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    #[serde(default)]
    pub persona: Persona,
    #[serde(default)]
    pub stt: SttConfig,
    #[serde(default)]
    pub tts: TtsConfig,
    #[serde(default)]
    pub llm: LlmConfig,
}

fn default_call_timeout_ms() -> u64 {
    30_000
}

fn default_response_ttl_secs() -> u64 {
    3600
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    1000
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            call_timeout_ms: default_call_timeout_ms(),
            response_ttl_secs: default_response_ttl_secs(),
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            persona: Persona::default(),
            stt: SttConfig::default(),
            tts: TtsConfig::default(),
            llm: LlmConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn settings(&self) -> EngineSettings {
        EngineSettings {
            call_timeout: Duration::from_millis(self.call_timeout_ms),
            response_ttl: Duration::from_secs(self.response_ttl_secs),
            retry: RetryPolicy {
                max_retries: self.max_retries,
                base_delay: Duration::from_millis(self.retry_base_delay_ms),
            },
        }
    }

    pub fn build_stt(&self) -> Arc<dyn SpeechToText> {
        match self.stt.backend {
            SttBackend::Placeholder => Arc::new(PlaceholderStt::new()),
            SttBackend::Whisper => Arc::new(
                WhisperStt::new(&self.stt.model_path, &self.stt.binary_path)
                    .with_language(&self.stt.language),
            ),
        }
    }

    pub fn build_tts(&self) -> Arc<dyn TextToSpeech> {
        match self.tts.backend {
            TtsBackend::Silence => Arc::new(SilenceTts::new(self.tts.chunk_size)),
            TtsBackend::Piper => Arc::new(PiperTts::new(
                &self.tts.voices_dir,
                &self.tts.piper_binary,
                self.tts.profile.clone(),
                self.tts.chunk_size,
            )),
        }
    }

    /// Builds the configured language model. An OpenAI-compatible backend
    /// without an API key is a configuration error.
    pub fn build_llm(&self) -> Result<Arc<dyn LanguageModel>, crate::VoiceError> {
        match self.llm.backend {
            LlmBackend::Echo => Ok(Arc::new(EchoLlm::new())),
            LlmBackend::OpenAi => {
                if self.llm.api_key.trim().is_empty() {
                    return Err(crate::VoiceError::Config(
                        "llm.api_key is required for the open_ai backend. Set it in config \
                         or the PARLEY_LLM_API_KEY environment variable."
                            .to_string(),
                    ));
                }
                Ok(Arc::new(OpenAiCompatibleLlm::new(self.llm.clone())))
            }
        }
    }
}
