//! Single-shot speech endpoints: transcribe one frame, synthesize one text.

use crate::api_chat::user_id;
use crate::error::{ApiError, ApiFailure};
use crate::AppState;
use axum::{
    extract::{rejection::JsonRejection, Extension},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use futures_util::StreamExt;
use parley_resilience::RateLimiter;
use parley_types::AudioFrame;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

#[derive(Debug, Deserialize)]
pub struct SynthesizeRequest {
    pub text: String,
}

fn failure(state: &AppState, err: ApiError) -> ApiFailure {
    tracing::warn!(kind = err.kind().as_str(), "speech request failed: {}", err);
    ApiFailure(state.error_response(&err))
}

fn charge(state: &AppState, headers: &HeaderMap, op: &str) -> Result<(), ApiError> {
    let key = RateLimiter::user_key(&user_id(headers), op);
    state.limiter.check(&key).into_result(&key)?;
    Ok(())
}

/// `POST /stt/process`: transcribes one frame carrying audio. Answers 204
/// when the frame yields no transcript.
pub async fn stt_handler(
    Extension(state): Extension<Arc<AppState>>,
    headers: HeaderMap,
    payload: Result<Json<AudioFrame>, JsonRejection>,
) -> Result<Response, ApiFailure> {
    let Json(frame) = payload.map_err(|e| failure(&state, ApiError::Validation(e.body_text())))?;
    if frame.data.as_deref().map_or(true, str::is_empty) {
        return Err(failure(
            &state,
            ApiError::UserInput("audio frame data is required".to_string()),
        ));
    }
    charge(&state, &headers, "stt").map_err(|e| failure(&state, e))?;

    let transcript = state
        .engine
        .process_audio_frame(&frame)
        .await
        .map_err(|e| failure(&state, e.into()))?;

    Ok(match transcript {
        Some(transcript) => Json(transcript).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    })
}

/// `POST /tts/synthesize`: speaks `text` and returns every chunk at once.
pub async fn tts_handler(
    Extension(state): Extension<Arc<AppState>>,
    headers: HeaderMap,
    payload: Result<Json<SynthesizeRequest>, JsonRejection>,
) -> Result<Json<Value>, ApiFailure> {
    let Json(request) =
        payload.map_err(|e| failure(&state, ApiError::Validation(e.body_text())))?;
    let text = request.text.trim();
    if text.is_empty() {
        return Err(failure(
            &state,
            ApiError::UserInput("text is required".to_string()),
        ));
    }
    charge(&state, &headers, "tts").map_err(|e| failure(&state, e))?;

    let mut chunks = state.engine.speak_text(text);
    let mut audio_chunks = Vec::new();
    while let Some(chunk) = chunks.next().await {
        let chunk = chunk.map_err(|e| failure(&state, e.into()))?;
        audio_chunks.push(json!({
            "data": chunk.data_base64(),
            "sequence": audio_chunks.len(),
            "timestamp": chunk.timestamp,
            "isLast": chunk.is_last,
        }));
    }

    Ok(Json(json!({ "audioChunks": audio_chunks })))
}
