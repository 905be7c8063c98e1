//! The conversation engine: transcription, guarded reply generation and
//! speech synthesis.
//!
//! Every collaborator call goes through the circuit breaker named after its
//! stage (`stt`, `llm`, `tts`) and is bounded by the call timeout. Reply
//! generation is additionally retried with backoff and cached.

use crate::error::{EngineError, VoiceError};
use crate::llm::{LanguageModel, StreamChunk};
use crate::stt::SpeechToText;
use crate::tts::TextToSpeech;
use futures_util::stream::{self, BoxStream, StreamExt};
use parley_cache::{generate_key, hash_key, TwoTierCache};
use parley_observe::{LatencyStats, Metrics};
use parley_resilience::{retry_operation, CircuitBreakerManager, RetryPolicy};
use parley_types::{AudioChunk, AudioFrame, Persona, TranscriptResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

const STT_SERVICE: &str = "stt";
const LLM_SERVICE: &str = "llm";
const TTS_SERVICE: &str = "tts";

/// Timing knobs for [`ConversationEngine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineSettings {
    pub call_timeout: Duration,
    pub response_ttl: Duration,
    pub retry: RetryPolicy,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(30),
            response_ttl: Duration::from_secs(3600),
            retry: RetryPolicy::default(),
        }
    }
}

/// Reply payload as stored in the cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedReply {
    pub response: String,
    pub model: String,
    pub persona: String,
    pub timestamp: i64,
}

/// A generated (or cached) reply.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AiReply {
    pub response: String,
    pub latency_ms: u64,
    pub model: String,
    pub persona: String,
    pub cached: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStats {
    pub latency: BTreeMap<String, LatencyStats>,
    pub stt: String,
    pub tts: String,
    pub model: String,
    pub persona: String,
}

pub struct ConversationEngine {
    stt: Arc<dyn SpeechToText>,
    llm: Arc<dyn LanguageModel>,
    tts: Arc<dyn TextToSpeech>,
    cache: Arc<TwoTierCache>,
    breakers: Arc<CircuitBreakerManager>,
    metrics: Metrics,
    persona: Persona,
    settings: EngineSettings,
}

impl ConversationEngine {
    pub fn new(
        stt: Arc<dyn SpeechToText>,
        llm: Arc<dyn LanguageModel>,
        tts: Arc<dyn TextToSpeech>,
        cache: Arc<TwoTierCache>,
        breakers: Arc<CircuitBreakerManager>,
    ) -> Self {
        Self {
            stt,
            llm,
            tts,
            cache,
            breakers,
            metrics: Metrics::new(),
            persona: Persona::default(),
            settings: EngineSettings::default(),
        }
    }

    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_persona(mut self, persona: Persona) -> Self {
        self.persona = persona;
        self
    }

    pub fn with_settings(mut self, settings: EngineSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn persona(&self) -> &Persona {
        &self.persona
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Transcribes one frame. Returns `None` when the frame yields no text.
    pub async fn process_audio_frame(
        &self,
        frame: &AudioFrame,
    ) -> Result<Option<TranscriptResult>, EngineError> {
        let started = Instant::now();
        let stt = &self.stt;
        let partial = self
            .guarded(STT_SERVICE, || stt.transcribe(frame))
            .await
            .inspect_err(|e| tracing::error!(seq = frame.seq, "STT processing error: {}", e))?;

        let partial = partial.filter(|p| !p.text.trim().is_empty());
        if let Some(p) = &partial {
            self.metrics
                .record("stt_partial_latency_ms", elapsed_ms(started));
            tracing::info!(text = %p.text, confidence = p.confidence, "STT partial");
        }
        Ok(partial)
    }

    /// Asks the STT collaborator to finalize a run of partials.
    pub async fn process_final_transcription(
        &self,
        partials: &[TranscriptResult],
    ) -> Result<Option<TranscriptResult>, EngineError> {
        let started = Instant::now();
        let stt = &self.stt;
        let result = self
            .guarded(STT_SERVICE, || stt.finalize(partials))
            .await
            .inspect_err(|e| tracing::error!("STT final processing error: {}", e))?;

        if let Some(f) = &result {
            self.metrics.record("stt_final_latency_ms", elapsed_ms(started));
            tracing::info!(text = %f.text, confidence = f.confidence, "STT final");
        }
        Ok(result)
    }

    /// Produces a reply for `message`, serving it from the cache when the same
    /// message and context were answered within the response TTL.
    pub async fn generate_ai_response(
        &self,
        message: &str,
        context: Option<&str>,
    ) -> Result<AiReply, EngineError> {
        if message.trim().is_empty() {
            return Err(EngineError::EmptyMessage);
        }
        let started = Instant::now();
        let key = reply_cache_key(message, context);

        if let Some(raw) = self.cache.get(&key).await {
            match serde_json::from_str::<CachedReply>(&raw) {
                Ok(cached) => {
                    tracing::info!(model = %cached.model, "cache hit for AI response");
                    return Ok(AiReply {
                        response: cached.response,
                        latency_ms: elapsed_ms(started),
                        model: cached.model,
                        persona: cached.persona,
                        cached: true,
                    });
                }
                Err(e) => {
                    tracing::warn!("failed to parse cached response, clearing entry: {}", e);
                    self.cache.del(&key).await;
                }
            }
        }

        let messages = self.persona.frame(message, context);
        let llm = &self.llm;
        let messages = &messages;
        let policy = self.settings.retry;
        let limit = self.settings.call_timeout;
        let completion = self
            .breakers
            .breaker(LLM_SERVICE)
            .execute(|| {
                retry_operation(&policy, move || {
                    bounded(LLM_SERVICE, limit, llm.complete(messages))
                })
            })
            .await
            .map_err(EngineError::from)
            .inspect_err(|e| tracing::error!("AI response generation error: {}", e))?;

        if completion.content.trim().is_empty() {
            return Err(EngineError::EmptyReply);
        }

        let latency_ms = elapsed_ms(started);
        let payload = CachedReply {
            response: completion.content.clone(),
            model: completion.model.clone(),
            persona: self.persona.name.clone(),
            timestamp: parley_types::now_millis(),
        };
        match serde_json::to_string(&payload) {
            Ok(json) => {
                self.cache
                    .set_with_ttl(&key, json, self.settings.response_ttl)
                    .await
            }
            Err(e) => tracing::warn!("failed to serialize reply for caching: {}", e),
        }

        self.metrics.record("llm_response_latency_ms", latency_ms);
        tracing::info!(
            latency_ms,
            model = %completion.model,
            persona = %self.persona.name,
            preview = %preview(&completion.content, 100),
            "AI response generated"
        );

        Ok(AiReply {
            response: completion.content,
            latency_ms,
            model: completion.model,
            persona: self.persona.name.clone(),
            cached: false,
        })
    }

    /// Streams a reply into `sink`. Not cached and not retried: fragments
    /// may already have been delivered when a failure occurs.
    pub async fn generate_streaming_ai_response(
        &self,
        message: &str,
        context: Option<&str>,
        sink: mpsc::Sender<StreamChunk>,
    ) -> Result<(), EngineError> {
        if message.trim().is_empty() {
            return Err(EngineError::EmptyMessage);
        }
        tracing::info!("starting streaming AI response");
        let started = Instant::now();
        let messages = self.persona.frame(message, context);
        let llm = &self.llm;
        let limit = self.settings.call_timeout;
        let completion = self
            .breakers
            .breaker(LLM_SERVICE)
            .execute(|| bounded(LLM_SERVICE, limit, llm.stream(&messages, sink)))
            .await
            .map_err(EngineError::from)
            .inspect_err(|e| tracing::error!("streaming AI response error: {}", e))?;

        self.metrics
            .record("llm_response_latency_ms", elapsed_ms(started));
        tracing::info!(
            model = %completion.model,
            chars = completion.content.len(),
            "streaming AI response completed"
        );
        Ok(())
    }

    /// Synthesizes `text` lazily: nothing happens until the stream is first
    /// polled. The stream is finite; call again to resynthesize.
    pub fn speak_text(&self, text: &str) -> BoxStream<'static, Result<AudioChunk, EngineError>> {
        let tts = Arc::clone(&self.tts);
        let breaker = self.breakers.breaker(TTS_SERVICE);
        let metrics = self.metrics.clone();
        let limit = self.settings.call_timeout;

        stream::unfold(Speak::Pending(text.to_string()), move |state| {
            let tts = Arc::clone(&tts);
            let breaker = Arc::clone(&breaker);
            let metrics = metrics.clone();
            async move {
                match state {
                    Speak::Pending(text) => {
                        let started = Instant::now();
                        tracing::info!(preview = %preview(&text, 50), "TTS starting");
                        let result = breaker
                            .execute(|| bounded(TTS_SERVICE, limit, tts.synthesize(&text)))
                            .await
                            .map_err(EngineError::from);
                        match result {
                            Ok(chunks) => emit(chunks.into_iter(), started, &metrics),
                            Err(e) => {
                                tracing::error!("TTS error: {}", e);
                                Some((Err(e), Speak::Done))
                            }
                        }
                    }
                    Speak::Emitting { chunks, started } => emit(chunks, started, &metrics),
                    Speak::Done => None,
                }
            }
        })
        .boxed()
    }

    pub fn greeting(&self) -> &str {
        &self.persona.greeting
    }

    pub fn farewell(&self) -> &str {
        &self.persona.farewell
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            latency: self.metrics.snapshot(),
            stt: self.stt.name().to_string(),
            tts: self.tts.name().to_string(),
            model: self.llm.model_name(),
            persona: self.persona.name.clone(),
        }
    }

    async fn guarded<T, F, Fut>(&self, service: &'static str, op: F) -> Result<T, EngineError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, VoiceError>>,
    {
        let limit = self.settings.call_timeout;
        self.breakers
            .breaker(service)
            .execute(|| bounded(service, limit, op()))
            .await
            .map_err(EngineError::from)
    }
}

enum Speak {
    Pending(String),
    Emitting {
        chunks: std::vec::IntoIter<AudioChunk>,
        started: Instant,
    },
    Done,
}

fn emit(
    mut chunks: std::vec::IntoIter<AudioChunk>,
    started: Instant,
    metrics: &Metrics,
) -> Option<(Result<AudioChunk, EngineError>, Speak)> {
    let chunk = chunks.next()?;
    metrics.record("tts_chunk_latency_ms", elapsed_ms(started));
    if chunk.is_last {
        tracing::info!("TTS completed");
    }
    Some((Ok(chunk), Speak::Emitting { chunks, started }))
}

async fn bounded<T>(
    stage: &'static str,
    limit: Duration,
    call: impl Future<Output = Result<T, VoiceError>>,
) -> Result<T, EngineError> {
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result.map_err(EngineError::from),
        Err(_) => Err(EngineError::Timeout {
            stage,
            after: limit,
        }),
    }
}

/// `llm:response:<sha256(message ":" context)>`
pub fn reply_cache_key(message: &str, context: Option<&str>) -> String {
    let content = format!("{}:{}", message, context.unwrap_or(""));
    generate_key("llm", "response", &hash_key(&content))
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

fn preview(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}
