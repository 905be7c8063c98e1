//! HTTP chat endpoints: one-shot replies, streamed replies and persona info.

use crate::api_ws::ANONYMOUS_USER;
use crate::error::{ApiError, ApiFailure};
use crate::AppState;
use axum::{
    extract::{rejection::JsonRejection, Extension},
    http::HeaderMap,
    response::{sse::Event, IntoResponse, Sse},
    Json,
};
use futures_util::{stream, Stream, StreamExt};
use parley_resilience::RateLimiter;
use parley_types::now_millis;
use parley_voice::{AiReply, EngineError, StreamChunk, VoiceError};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;

/// Buffered fragments per streamed reply.
const STREAM_BUFFER: usize = 64;

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    #[serde(default)]
    pub context: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ChatResponse {
    #[serde(flatten)]
    pub reply: AiReply,
    pub timestamp: i64,
}

/// Caller named by `x-user-id`, or the anonymous user.
pub(crate) fn user_id(headers: &HeaderMap) -> String {
    headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or(ANONYMOUS_USER)
        .to_string()
}

/// Parses the body and charges the caller's `chat` window.
fn admit(
    state: &AppState,
    headers: &HeaderMap,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> Result<ChatRequest, ApiError> {
    let Json(request) = payload.map_err(|e| ApiError::Validation(e.body_text()))?;
    let key = RateLimiter::user_key(&user_id(headers), "chat");
    state.limiter.check(&key).into_result(&key)?;
    Ok(request)
}

/// `POST /llm/chat`
pub async fn chat_handler(
    Extension(state): Extension<Arc<AppState>>,
    headers: HeaderMap,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> Result<Json<ChatResponse>, ApiFailure> {
    let result = async {
        let request = admit(&state, &headers, payload)?;
        let reply = state
            .engine
            .generate_ai_response(&request.message, request.context.as_deref())
            .await?;
        Ok::<_, ApiError>(reply)
    }
    .await;

    match result {
        Ok(reply) => Ok(Json(ChatResponse {
            reply,
            timestamp: now_millis(),
        })),
        Err(e) => {
            tracing::warn!(kind = e.kind().as_str(), "chat request failed: {}", e);
            Err(ApiFailure(state.error_response(&e)))
        }
    }
}

/// `POST /llm/chat/stream`
///
/// Emits one `data:` event per fragment, then a `done` event, or an `error`
/// event carrying the client-facing error payload.
pub async fn chat_stream_handler(
    Extension(state): Extension<Arc<AppState>>,
    headers: HeaderMap,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiFailure> {
    let request = admit(&state, &headers, payload).map_err(|e| {
        tracing::warn!(kind = e.kind().as_str(), "stream request rejected: {}", e);
        ApiFailure(state.error_response(&e))
    })?;

    let (tx, rx) = mpsc::channel::<StreamChunk>(STREAM_BUFFER);
    let (done_tx, done_rx) = oneshot::channel();
    let engine = Arc::clone(&state.engine);
    tokio::spawn(async move {
        let result = engine
            .generate_streaming_ai_response(&request.message, request.context.as_deref(), tx)
            .await;
        let _ = done_tx.send(result);
    });

    let fragments = ReceiverStream::new(rx).filter_map(|chunk| async move {
        match serde_json::to_string(&chunk) {
            Ok(data) => Some(Ok::<_, Infallible>(Event::default().data(data))),
            Err(e) => {
                tracing::error!("failed to serialize stream chunk: {}", e);
                None
            }
        }
    });

    let end_state = Arc::clone(&state);
    let end = stream::once(async move {
        let outcome = match done_rx.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(ApiError::from(e)),
            Err(_) => Err(ApiError::from(EngineError::Voice(VoiceError::Llm(
                "stream task ended before reporting a result".to_string(),
            )))),
        };
        let event = match outcome {
            Ok(()) => Event::default().event("done").data("{}"),
            Err(e) => {
                let body = serde_json::to_string(&end_state.error_response(&e))
                    .unwrap_or_else(|_| "{}".to_string());
                Event::default().event("error").data(body)
            }
        };
        Ok::<_, Infallible>(event)
    });

    Ok(Sse::new(fragments.chain(end)).keep_alive(axum::response::sse::KeepAlive::default()))
}

/// `GET /persona/info`
pub async fn persona_handler(Extension(state): Extension<Arc<AppState>>) -> impl IntoResponse {
    let persona = state.engine.persona();
    Json(json!({
        "persona": persona.name,
        "greeting": persona.greeting,
        "farewell": persona.farewell,
    }))
}
