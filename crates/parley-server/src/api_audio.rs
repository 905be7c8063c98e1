//! Request/reply audio ingress: one frame per call, with aggregate counters
//! and partials buffered per client stream.

use crate::error::{ApiError, ApiFailure};
use crate::AppState;
use axum::{
    extract::{rejection::JsonRejection, Extension},
    http::HeaderMap,
    response::IntoResponse,
    Json,
};
use parley_types::{AudioFrame, TranscriptResult};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

/// Partials kept per stream between finalize calls; older ones are dropped
/// first.
const MAX_BUFFERED_PARTIALS: usize = 256;

/// Streams buffered at once; the least recently fed is dropped first.
const MAX_STREAMS: usize = 1024;

/// Header naming the audio stream a frame belongs to.
pub const STREAM_ID_HEADER: &str = "x-stream-id";

#[derive(Debug)]
struct StreamBuffer {
    partials: Vec<TranscriptResult>,
    updated: Instant,
}

/// Frame counters plus, per stream, the partials awaiting finalization.
/// Frames themselves are never retained.
#[derive(Clone, Default)]
pub struct AudioIngress {
    total_frames: Arc<AtomicU64>,
    speech_frames: Arc<AtomicU64>,
    streams: Arc<Mutex<HashMap<String, StreamBuffer>>>,
}

impl AudioIngress {
    pub fn new() -> Self {
        Self::default()
    }

    fn streams(&self) -> MutexGuard<'_, HashMap<String, StreamBuffer>> {
        match self.streams.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!("audio stream buffer lock poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    pub fn count(&self, frame: &AudioFrame) {
        self.total_frames.fetch_add(1, Ordering::Relaxed);
        if frame.is_speech() {
            self.speech_frames.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn buffer(&self, stream: &str, partial: TranscriptResult) {
        let mut streams = self.streams();
        if streams.len() >= MAX_STREAMS && !streams.contains_key(stream) {
            let stalest = streams
                .iter()
                .min_by_key(|(_, buffer)| buffer.updated)
                .map(|(id, _)| id.clone());
            if let Some(id) = stalest {
                streams.remove(&id);
                tracing::debug!(stream = %id, "dropped stalest audio stream buffer");
            }
        }

        let buffer = streams
            .entry(stream.to_string())
            .or_insert_with(|| StreamBuffer {
                partials: Vec::new(),
                updated: Instant::now(),
            });
        if buffer.partials.len() >= MAX_BUFFERED_PARTIALS {
            buffer.partials.remove(0);
        }
        buffer.partials.push(partial);
        buffer.updated = Instant::now();
    }

    /// Takes every partial buffered for `stream`, forgetting the stream.
    pub fn take_partials(&self, stream: &str) -> Vec<TranscriptResult> {
        self.streams()
            .remove(stream)
            .map(|buffer| buffer.partials)
            .unwrap_or_default()
    }

    /// Drops streams not fed for longer than `max_idle`. Returns how many.
    pub fn sweep(&self, max_idle: Duration) -> usize {
        let mut streams = self.streams();
        let before = streams.len();
        streams.retain(|_, buffer| buffer.updated.elapsed() <= max_idle);
        before - streams.len()
    }

    pub fn buffered_streams(&self) -> usize {
        self.streams().len()
    }

    pub fn total_frames(&self) -> u64 {
        self.total_frames.load(Ordering::Relaxed)
    }

    pub fn speech_frames(&self) -> u64 {
        self.speech_frames.load(Ordering::Relaxed)
    }

    /// Share of frames flagged as speech; 0 before any frame arrives.
    pub fn speech_ratio(&self) -> f64 {
        let total = self.total_frames();
        if total == 0 {
            return 0.0;
        }
        self.speech_frames() as f64 / total as f64
    }

    pub fn reset(&self) {
        self.total_frames.store(0, Ordering::Relaxed);
        self.speech_frames.store(0, Ordering::Relaxed);
        self.streams().clear();
    }
}

/// The stream a request belongs to: `x-stream-id`, else `x-user-id`.
fn stream_id(headers: &HeaderMap) -> Option<String> {
    [STREAM_ID_HEADER, "x-user-id"].iter().find_map(|name| {
        headers
            .get(*name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    })
}

fn failure(state: &AppState, err: ApiError) -> ApiFailure {
    tracing::warn!(kind = err.kind().as_str(), "audio request failed: {}", err);
    ApiFailure(state.error_response(&err))
}

/// `POST /audio/frame`
///
/// Partials are buffered under the caller's stream. A caller that names no
/// stream still gets its partial back, but nothing is kept for finalize.
pub async fn frame_handler(
    Extension(state): Extension<Arc<AppState>>,
    headers: HeaderMap,
    payload: Result<Json<AudioFrame>, JsonRejection>,
) -> Result<Json<Value>, ApiFailure> {
    let Json(frame) = payload.map_err(|e| failure(&state, ApiError::Validation(e.body_text())))?;
    state.ingress.count(&frame);

    let partial = state
        .engine
        .process_audio_frame(&frame)
        .await
        .map_err(|e| failure(&state, e.into()))?;

    Ok(Json(match partial {
        Some(partial) => {
            match stream_id(&headers) {
                Some(stream) => state.ingress.buffer(&stream, partial.clone()),
                None => tracing::debug!("frame without a stream id, partial not buffered"),
            }
            json!({ "type": "partial", "data": partial })
        }
        None => json!({ "type": "no_partial" }),
    }))
}

/// `POST /audio/finalize`: finalizes the partials buffered for the caller's
/// stream since its last finalize.
pub async fn finalize_handler(
    Extension(state): Extension<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiFailure> {
    let stream = stream_id(&headers).ok_or_else(|| {
        failure(
            &state,
            ApiError::Validation(format!(
                "finalize requires an {STREAM_ID_HEADER} or x-user-id header"
            )),
        )
    })?;
    let partials = state.ingress.take_partials(&stream);
    let result = state
        .engine
        .process_final_transcription(&partials)
        .await
        .map_err(|e| failure(&state, e.into()))?;

    Ok(Json(match result {
        Some(result) => json!({ "type": "final", "data": result }),
        None => json!({ "type": "no_final" }),
    }))
}

/// `GET /audio/stats`
pub async fn stats_handler(Extension(state): Extension<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "totalFrames": state.ingress.total_frames(),
        "speechFrames": state.ingress.speech_frames(),
        "speechRatio": state.ingress.speech_ratio(),
        "bufferedStreams": state.ingress.buffered_streams(),
        "engine": state.engine.stats(),
    }))
}

/// `POST /audio/reset-stats`
pub async fn reset_stats_handler(Extension(state): Extension<Arc<AppState>>) -> impl IntoResponse {
    state.ingress.reset();
    tracing::info!("audio stats reset");
    Json(json!({ "status": "reset" }))
}

/// `GET /audio/health`: collaborator names and their breaker states.
pub async fn health_handler(Extension(state): Extension<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.engine.stats();
    Json(json!({
        "status": "ok",
        "stt": {
            "engine": stats.stt,
            "circuit": state.breakers.breaker("stt").state(),
        },
        "tts": {
            "engine": stats.tts,
            "circuit": state.breakers.breaker("tts").state(),
        },
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_types::Vad;

    fn frame(vad: Vad) -> AudioFrame {
        AudioFrame {
            seq: 0,
            timestamp: 0,
            format: Default::default(),
            vad,
            rms: 0.0,
            data: None,
        }
    }

    fn partial(text: &str) -> TranscriptResult {
        TranscriptResult {
            text: text.into(),
            confidence: 0.9,
            is_final: false,
            timestamp: 0,
        }
    }

    #[test]
    fn counts_frames_and_speech_ratio() {
        let ingress = AudioIngress::new();
        assert_eq!(ingress.speech_ratio(), 0.0);

        ingress.count(&frame(Vad::Speech));
        ingress.count(&frame(Vad::Silence));
        ingress.count(&frame(Vad::Speech));
        ingress.count(&frame(Vad::Speech));
        assert_eq!(ingress.total_frames(), 4);
        assert_eq!(ingress.speech_frames(), 3);
        assert!((ingress.speech_ratio() - 0.75).abs() < f64::EPSILON);

        ingress.reset();
        assert_eq!(ingress.total_frames(), 0);
        assert_eq!(ingress.speech_frames(), 0);
    }

    #[test]
    fn take_partials_empties_only_that_stream() {
        let ingress = AudioIngress::new();
        ingress.buffer("a", partial("hello"));
        ingress.buffer("b", partial("other"));
        ingress.buffer("a", partial("world"));

        let taken = ingress.take_partials("a");
        assert_eq!(taken.len(), 2);
        assert_eq!(taken[0].text, "hello");
        assert!(ingress.take_partials("a").is_empty());
        assert_eq!(ingress.take_partials("b")[0].text, "other");
    }

    #[test]
    fn buffer_drops_oldest_beyond_capacity() {
        let ingress = AudioIngress::new();
        for i in 0..MAX_BUFFERED_PARTIALS + 2 {
            ingress.buffer("a", partial(&i.to_string()));
        }
        let taken = ingress.take_partials("a");
        assert_eq!(taken.len(), MAX_BUFFERED_PARTIALS);
        assert_eq!(taken[0].text, "2");
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_drops_idle_streams() {
        let ingress = AudioIngress::new();
        ingress.buffer("idle", partial("hello"));
        tokio::time::advance(Duration::from_secs(200)).await;
        ingress.buffer("active", partial("hi"));
        tokio::time::advance(Duration::from_secs(150)).await;

        assert_eq!(ingress.sweep(Duration::from_secs(300)), 1);
        assert!(ingress.take_partials("idle").is_empty());
        assert_eq!(ingress.take_partials("active").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stalest_stream_is_dropped_at_capacity() {
        let ingress = AudioIngress::new();
        for i in 0..MAX_STREAMS {
            ingress.buffer(&format!("s{i}"), partial("x"));
            tokio::time::advance(Duration::from_millis(1)).await;
        }
        ingress.buffer("newcomer", partial("y"));
        assert_eq!(ingress.buffered_streams(), MAX_STREAMS);
        assert!(ingress.take_partials("s0").is_empty());
        assert_eq!(ingress.take_partials("newcomer").len(), 1);
    }

    #[test]
    fn stream_id_prefers_explicit_header() {
        let mut headers = HeaderMap::new();
        assert_eq!(stream_id(&headers), None);
        headers.insert("x-user-id", "alice".parse().unwrap());
        assert_eq!(stream_id(&headers).as_deref(), Some("alice"));
        headers.insert(STREAM_ID_HEADER, "mic-2".parse().unwrap());
        assert_eq!(stream_id(&headers).as_deref(), Some("mic-2"));
    }
}
