use crate::config::LlmConfig;
use crate::error::VoiceError;
use crate::sse::{SseEvent, SseParser};
use async_trait::async_trait;
use futures_util::StreamExt;
use parley_resilience::{backoff_delay, next_model, ProviderQuota};
use parley_types::{ChatMessage, ChatRole};
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Where a streamed fragment was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkSource {
    Local,
    Cloud,
}

/// One incremental fragment of a streamed reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamChunk {
    pub text: String,
    pub source: ChunkSource,
}

/// A finished reply and the model that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub content: String,
    pub model: String,
}

/// Language-model collaborator.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Model currently used for requests.
    fn model_name(&self) -> String;

    async fn complete(&self, messages: &[ChatMessage]) -> Result<Completion, VoiceError>;

    /// Streams the reply into `sink` fragment by fragment and returns the
    /// assembled completion. Stops early, without error, once the receiver
    /// is dropped.
    async fn stream(
        &self,
        messages: &[ChatMessage],
        sink: mpsc::Sender<StreamChunk>,
    ) -> Result<Completion, VoiceError>;
}

/// Replies by echoing the last user message. For development and tests.
#[derive(Debug, Clone, Default)]
pub struct EchoLlm;

impl EchoLlm {
    pub fn new() -> Self {
        Self
    }

    fn reply(messages: &[ChatMessage]) -> String {
        let last = messages
            .iter()
            .rev()
            .find(|m| m.role == ChatRole::User)
            .map(|m| m.content.trim())
            .unwrap_or_default();
        format!("You said: {}", last)
    }
}

#[async_trait]
impl LanguageModel for EchoLlm {
    fn model_name(&self) -> String {
        "echo".to_string()
    }

    async fn complete(&self, messages: &[ChatMessage]) -> Result<Completion, VoiceError> {
        Ok(Completion {
            content: Self::reply(messages),
            model: self.model_name(),
        })
    }

    async fn stream(
        &self,
        messages: &[ChatMessage],
        sink: mpsc::Sender<StreamChunk>,
    ) -> Result<Completion, VoiceError> {
        let content = Self::reply(messages);
        let words: Vec<&str> = content.split(' ').collect();
        for (i, word) in words.iter().enumerate() {
            let text = if i + 1 < words.len() {
                format!("{word} ")
            } else {
                word.to_string()
            };
            let chunk = StreamChunk {
                text,
                source: ChunkSource::Local,
            };
            if sink.send(chunk).await.is_err() {
                break;
            }
        }
        Ok(Completion {
            content,
            model: self.model_name(),
        })
    }
}

const QUOTA_KEY: &str = "provider";

/// Cool-down after the second consecutive 429, doubling per further one.
const THROTTLE_BACKOFF_BASE: Duration = Duration::from_secs(1);
const THROTTLE_BACKOFF_CAP: Duration = Duration::from_secs(60);

#[derive(Debug, Default)]
struct Throttle {
    consecutive: u32,
    until: Option<Instant>,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    max_tokens: u32,
    temperature: f32,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    #[serde(default)]
    message: Option<Content>,
    #[serde(default)]
    delta: Option<Content>,
}

#[derive(Debug, Deserialize)]
struct Content {
    #[serde(default)]
    content: Option<String>,
}

/// Client for any `/chat/completions` endpoint speaking the OpenAI wire
/// format (OpenRouter, OpenAI, llama.cpp server, vLLM).
///
/// Every request first passes the provider quota. A 429 from the provider
/// rotates to the next configured model for subsequent requests; repeated
/// 429s also start a jittered cool-down during which requests fail without
/// reaching the provider.
pub struct OpenAiCompatibleLlm {
    config: LlmConfig,
    client: reqwest::Client,
    current_model: Mutex<String>,
    quota: ProviderQuota,
    throttle: Mutex<Throttle>,
}

impl std::fmt::Debug for OpenAiCompatibleLlm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiCompatibleLlm")
            .field("base_url", &self.config.base_url)
            .field("model", &self.model_name())
            .finish()
    }
}

impl OpenAiCompatibleLlm {
    pub fn new(config: LlmConfig) -> Self {
        Self {
            current_model: Mutex::new(config.model.clone()),
            quota: ProviderQuota::new(config.quota),
            client: reqwest::Client::new(),
            throttle: Mutex::new(Throttle::default()),
            config,
        }
    }

    fn lock_throttle(&self) -> MutexGuard<'_, Throttle> {
        match self.throttle.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Time left in the current cool-down, if any.
    pub fn cooldown_remaining(&self) -> Option<Duration> {
        let until = self.lock_throttle().until?;
        let now = Instant::now();
        (until > now).then(|| until - now)
    }

    fn note_throttled(&self) {
        let mut throttle = self.lock_throttle();
        throttle.consecutive += 1;
        if throttle.consecutive < 2 {
            return;
        }
        let delay = backoff_delay(
            throttle.consecutive - 2,
            THROTTLE_BACKOFF_BASE,
            THROTTLE_BACKOFF_CAP,
        );
        throttle.until = Some(Instant::now() + delay);
        tracing::warn!(
            consecutive = throttle.consecutive,
            delay_ms = delay.as_millis() as u64,
            "provider keeps rate limiting, backing off"
        );
    }

    fn note_accepted(&self) {
        let mut throttle = self.lock_throttle();
        throttle.consecutive = 0;
        throttle.until = None;
    }

    pub fn quota(&self) -> &ProviderQuota {
        &self.quota
    }

    fn rotate_model(&self, failed: &str) {
        let models: Vec<String> = std::iter::once(self.config.model.clone())
            .chain(self.config.fallback_models.iter().cloned())
            .collect();
        let Some(next) = next_model(failed, &models) else {
            return;
        };
        if next == failed {
            return;
        }
        let mut current = match self.current_model.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        // Another request may already have rotated away from `failed`.
        if *current == failed {
            tracing::warn!(from = failed, to = next, "provider rate limited, rotating model");
            *current = next.to_string();
        }
    }

    async fn send(
        &self,
        messages: &[ChatMessage],
        stream: bool,
    ) -> Result<(reqwest::Response, String), VoiceError> {
        if let Some(wait) = self.cooldown_remaining() {
            return Err(VoiceError::RateLimited(format!(
                "backing off for {}ms after repeated provider rate limits",
                wait.as_millis()
            )));
        }
        self.quota
            .try_acquire(QUOTA_KEY)
            .map_err(|e| VoiceError::RateLimited(e.to_string()))?;

        let model = self.model_name();
        let url = format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        );
        let body = ChatRequest {
            model: &model,
            messages,
            max_tokens: self.config.max_tokens,
            temperature: self.config.temperature,
            stream,
        };

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .header("X-Title", "Parley")
            .json(&body)
            .send()
            .await
            .map_err(map_transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                self.rotate_model(&model);
                self.note_throttled();
            }
            return Err(map_http_error(status, &body_text));
        }
        self.note_accepted();
        Ok((response, model))
    }
}

#[async_trait]
impl LanguageModel for OpenAiCompatibleLlm {
    fn model_name(&self) -> String {
        match self.current_model.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    async fn complete(&self, messages: &[ChatMessage]) -> Result<Completion, VoiceError> {
        let (response, model) = self.send(messages, false).await?;
        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| VoiceError::Llm(format!("malformed completion body: {}", e)))?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message)
            .and_then(|m| m.content)
            .unwrap_or_default();
        Ok(Completion {
            content,
            model: parsed.model.unwrap_or(model),
        })
    }

    async fn stream(
        &self,
        messages: &[ChatMessage],
        sink: mpsc::Sender<StreamChunk>,
    ) -> Result<Completion, VoiceError> {
        let (response, mut model) = self.send(messages, true).await?;
        let mut body = response.bytes_stream();
        let mut parser = SseParser::new();
        let mut content = String::new();

        'read: while let Some(next) = body.next().await {
            let bytes = next.map_err(map_transport_error)?;
            for event in parser.push(&bytes) {
                if event.is_done() {
                    break 'read;
                }
                if !forward_delta(&event, &sink, &mut content, &mut model).await {
                    tracing::debug!("stream receiver dropped, abandoning provider stream");
                    break 'read;
                }
            }
        }
        if let Some(event) = parser.finish().filter(|e| !e.is_done()) {
            forward_delta(&event, &sink, &mut content, &mut model).await;
        }

        Ok(Completion { content, model })
    }
}

/// Sends the text delta carried by `event`, if any. Returns `false` once the
/// receiver is gone.
async fn forward_delta(
    event: &SseEvent,
    sink: &mpsc::Sender<StreamChunk>,
    content: &mut String,
    model: &mut String,
) -> bool {
    let Some((delta, reported)) = parse_delta(&event.data) else {
        return true;
    };
    if let Some(reported) = reported {
        *model = reported;
    }
    if delta.is_empty() {
        return true;
    }
    content.push_str(&delta);
    sink.send(StreamChunk {
        text: delta,
        source: ChunkSource::Cloud,
    })
    .await
    .is_ok()
}

fn parse_delta(data: &str) -> Option<(String, Option<String>)> {
    let parsed: ChatResponse = match serde_json::from_str(data) {
        Ok(parsed) => parsed,
        Err(e) => {
            tracing::debug!("skipping unparseable stream event: {}", e);
            return None;
        }
    };
    let delta = parsed
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.delta)
        .and_then(|d| d.content)
        .unwrap_or_default();
    Some((delta, parsed.model))
}

fn map_transport_error(e: reqwest::Error) -> VoiceError {
    if e.is_timeout() {
        VoiceError::Timeout(e.to_string())
    } else if e.is_connect() || e.is_request() {
        VoiceError::Network(e.to_string())
    } else {
        VoiceError::Llm(e.to_string())
    }
}

fn map_http_error(status: reqwest::StatusCode, body: &str) -> VoiceError {
    let message = extract_error_message(body);
    let code = status.as_u16();
    match code {
        401 | 403 => VoiceError::Auth(format!("HTTP {code}: {message}")),
        429 => VoiceError::RateLimited(format!("HTTP 429: {message}")),
        502..=504 => VoiceError::Unavailable(format!("HTTP {code}: {message}")),
        400 => VoiceError::Llm(format!("invalid request (HTTP 400): {message}")),
        _ => VoiceError::Llm(format!("HTTP {code}: {message}")),
    }
}

fn extract_error_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| {
            v.get("error")
                .and_then(|e| e.get("message"))
                .and_then(|m| m.as_str())
                .map(String::from)
        })
        .unwrap_or_else(|| body.trim().to_string())
}
