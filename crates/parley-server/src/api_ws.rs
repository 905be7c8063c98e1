//! WebSocket chat sessions: connection handling and the session registry.
//!
//! Each connection is served by three tasks. The socket reader only
//! enqueues inbound text; a per-session worker handles messages one at a
//! time in arrival order; a writer forwards the outbound queue and pushes
//! keep-alives. Closing either side cancels the session token, which stops
//! all three and any speech still being streamed.

use crate::error::ApiError;
use crate::AppState;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        Extension, Query, WebSocketUpgrade,
    },
    http::HeaderMap,
    response::IntoResponse,
    Json,
};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use parley_resilience::{ErrorResponse, RateLimiter};
use parley_types::{now_millis, AudioFrame};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// User id assumed when a client does not identify itself.
pub const ANONYMOUS_USER: &str = "anonymous";

/// Inbound messages queued per session before the reader waits.
const INBOUND_QUEUE: usize = 64;

/// Query parameters for `GET /ws/chat`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WsConnectParams {
    pub user_id: Option<String>,
}

/// Inbound envelope. `type` stays a string so unknown kinds can be reported
/// back to the client instead of failing to parse.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundMessage {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub timestamp: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboundKind {
    TextResponse,
    VoiceResponse,
    Status,
    Error,
    Pong,
}

/// Outbound envelope.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundMessage {
    #[serde(rename = "type")]
    pub kind: OutboundKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    pub timestamp: i64,
}

impl OutboundMessage {
    pub fn new(kind: OutboundKind, data: Option<Value>) -> Self {
        Self {
            kind,
            data,
            conversation_id: None,
            timestamp: now_millis(),
        }
    }

    pub fn pong() -> Self {
        Self::new(OutboundKind::Pong, None)
    }

    pub fn status(data: Value) -> Self {
        Self::new(OutboundKind::Status, Some(data))
    }

    pub fn error(response: &ErrorResponse) -> Self {
        let data = serde_json::to_value(response).unwrap_or_else(|_| json!({}));
        Self::new(OutboundKind::Error, Some(data))
    }

    pub fn in_conversation(mut self, conversation_id: Option<String>) -> Self {
        self.conversation_id = conversation_id;
        self
    }
}

/// Mutable per-session state. Only held for short, non-awaiting sections.
#[derive(Debug, Clone)]
pub struct SessionState {
    pub user_id: String,
    pub conversation_id: Option<String>,
    pub is_listening: bool,
    pub listening_since: Option<Instant>,
    pub last_activity: Instant,
}

/// One live connection.
#[derive(Debug)]
pub struct SessionHandle {
    pub id: Uuid,
    state: Mutex<SessionState>,
    outbound: mpsc::Sender<String>,
    cancel: CancellationToken,
    /// Set when the message being handled hit a server-side error.
    server_failed: AtomicBool,
}

impl SessionHandle {
    fn new(user_id: String, outbound: mpsc::Sender<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            state: Mutex::new(SessionState {
                user_id,
                conversation_id: None,
                is_listening: false,
                listening_since: None,
                last_activity: Instant::now(),
            }),
            outbound,
            cancel: CancellationToken::new(),
            server_failed: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SessionState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!(session_id = %self.id, "session state lock poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    pub fn snapshot(&self) -> SessionState {
        self.lock().clone()
    }

    pub fn user_id(&self) -> String {
        self.lock().user_id.clone()
    }

    pub fn conversation_id(&self) -> Option<String> {
        self.lock().conversation_id.clone()
    }

    pub fn is_listening(&self) -> bool {
        self.lock().is_listening
    }

    pub fn touch(&self) {
        self.lock().last_activity = Instant::now();
    }

    /// An anonymous session takes the first user id a client sends.
    pub fn adopt_user(&self, user_id: Option<&str>) {
        let Some(user_id) = user_id.map(str::trim).filter(|u| !u.is_empty()) else {
            return;
        };
        let mut state = self.lock();
        if state.user_id == ANONYMOUS_USER {
            tracing::debug!(session_id = %self.id, user_id, "session identified");
            state.user_id = user_id.to_string();
        }
    }

    pub fn start_listening(&self, conversation_id: Option<String>) {
        let mut state = self.lock();
        state.is_listening = true;
        state.listening_since = Some(Instant::now());
        if conversation_id.is_some() {
            state.conversation_id = conversation_id;
        }
    }

    pub fn stop_listening(&self) {
        let mut state = self.lock();
        state.is_listening = false;
        state.listening_since = None;
    }

    /// Stops listening if it has lasted longer than `limit`. Returns whether
    /// it did.
    fn expire_listening(&self, now: Instant, limit: Duration) -> bool {
        let mut state = self.lock();
        match state.listening_since {
            Some(since) if state.is_listening && now.duration_since(since) > limit => {
                state.is_listening = false;
                state.listening_since = None;
                true
            }
            _ => false,
        }
    }

    fn idle_for(&self, now: Instant) -> Duration {
        now.duration_since(self.lock().last_activity)
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the session is closed.
    pub async fn closed(&self) {
        self.cancel.cancelled().await
    }

    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Queues `message` for the writer. A no-op once the session is closed;
    /// dropped with a warning when the client is not keeping up.
    pub fn send(&self, message: &OutboundMessage) {
        if self.is_closed() {
            return;
        }
        let text = match serde_json::to_string(message) {
            Ok(text) => text,
            Err(e) => {
                tracing::error!(session_id = %self.id, "failed to serialize outbound message: {}", e);
                return;
            }
        };
        if let Err(e) = self.outbound.try_send(text) {
            tracing::warn!(
                session_id = %self.id,
                kind = ?message.kind,
                "dropping outbound message for slow consumer: {}",
                e
            );
        }
    }
}

/// Per-connection row of [`SessionStats`].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    pub id: Uuid,
    pub user_id: String,
    pub is_listening: bool,
    pub idle_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStats {
    pub total_connections: usize,
    pub listening_connections: usize,
    pub connections: Vec<ConnectionInfo>,
}

/// What one sweep did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub closed: usize,
    pub listening_expired: usize,
}

/// Registry of live sessions, keyed by session id.
#[derive(Clone, Default)]
pub struct SessionManager {
    sessions: Arc<RwLock<HashMap<Uuid, Arc<SessionHandle>>>>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new session whose outbound messages go to `outbound`.
    pub async fn register(
        &self,
        user_id: String,
        outbound: mpsc::Sender<String>,
    ) -> Arc<SessionHandle> {
        let session = Arc::new(SessionHandle::new(user_id, outbound));
        let total = {
            let mut sessions = self.sessions.write().await;
            sessions.insert(session.id, Arc::clone(&session));
            sessions.len()
        };
        tracing::info!(
            session_id = %session.id,
            user_id = %session.user_id(),
            total_connections = total,
            "WebSocket session established"
        );
        session
    }

    pub async fn get(&self, id: Uuid) -> Option<Arc<SessionHandle>> {
        self.sessions.read().await.get(&id).cloned()
    }

    /// Closes and forgets a session. Removing an unknown id is a no-op.
    pub async fn remove(&self, id: Uuid) {
        let (removed, total) = {
            let mut sessions = self.sessions.write().await;
            let removed = sessions.remove(&id);
            (removed, sessions.len())
        };
        if let Some(session) = removed {
            session.close();
            tracing::info!(
                session_id = %id,
                user_id = %session.user_id(),
                total_connections = total,
                "WebSocket session closed"
            );
        }
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    pub async fn stats(&self) -> SessionStats {
        let now = Instant::now();
        let sessions = self.sessions.read().await;
        let connections: Vec<ConnectionInfo> = sessions
            .values()
            .map(|session| {
                let state = session.snapshot();
                ConnectionInfo {
                    id: session.id,
                    user_id: state.user_id,
                    is_listening: state.is_listening,
                    idle_ms: now.duration_since(state.last_activity).as_millis() as u64,
                }
            })
            .collect();
        SessionStats {
            total_connections: connections.len(),
            listening_connections: connections.iter().filter(|c| c.is_listening).count(),
            connections,
        }
    }

    /// Closes sessions idle for longer than `inactivity` and ends listening
    /// periods longer than `max_listening`.
    pub async fn sweep(
        &self,
        inactivity: Duration,
        max_listening: Option<Duration>,
    ) -> SweepReport {
        let now = Instant::now();
        let sessions: Vec<Arc<SessionHandle>> =
            self.sessions.read().await.values().cloned().collect();

        let mut report = SweepReport::default();
        for session in sessions {
            let idle = session.idle_for(now);
            if idle > inactivity {
                tracing::info!(
                    session_id = %session.id,
                    idle_secs = idle.as_secs(),
                    "closing inactive session"
                );
                self.remove(session.id).await;
                report.closed += 1;
                continue;
            }
            if let Some(limit) = max_listening {
                if session.expire_listening(now, limit) {
                    tracing::info!(session_id = %session.id, "listening time limit reached");
                    session.send(
                        &OutboundMessage::status(json!({
                            "message": "Stopped listening: time limit reached",
                            "isListening": false,
                        }))
                        .in_conversation(session.conversation_id()),
                    );
                    report.listening_expired += 1;
                }
            }
        }
        report
    }

    /// Closes every session, e.g. on shutdown.
    pub async fn close_all(&self) {
        let drained: Vec<Arc<SessionHandle>> =
            self.sessions.write().await.drain().map(|(_, s)| s).collect();
        for session in &drained {
            session.close();
        }
        if !drained.is_empty() {
            tracing::info!(count = drained.len(), "closed all WebSocket sessions");
        }
    }
}

/// `GET /ws/stats`
pub async fn stats_handler(Extension(state): Extension<Arc<AppState>>) -> Json<SessionStats> {
    Json(state.sessions.stats().await)
}

/// WebSocket handler: `GET /ws/chat?userId=...`, or the `x-user-id` header.
/// Unidentified clients start as `anonymous`.
pub async fn ws_handler(
    Extension(state): Extension<Arc<AppState>>,
    headers: HeaderMap,
    Query(params): Query<WsConnectParams>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let user_id = params
        .user_id
        .or_else(|| {
            headers
                .get("x-user-id")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        })
        .map(|u| u.trim().to_string())
        .filter(|u| !u.is_empty())
        .unwrap_or_else(|| ANONYMOUS_USER.to_string());

    ws.on_upgrade(move |socket| handle_socket(socket, state, user_id))
}

/// Serves one connection until either side closes it.
async fn handle_socket(socket: WebSocket, state: Arc<AppState>, user_id: String) {
    let (sender, mut receiver) = socket.split();

    // Bounded so a slow client cannot grow memory without limit; beyond the
    // buffer, messages are dropped.
    let (tx, rx) = mpsc::channel::<String>(state.session_config.outbound_buffer.max(1));
    let session = state.sessions.register(user_id, tx).await;

    session.send(&OutboundMessage::status(json!({
        "message": "Connected to Parley",
        "connectionId": session.id,
        "userId": session.user_id(),
    })));

    let writer = tokio::spawn(write_loop(
        sender,
        rx,
        state.session_config.keep_alive(),
        Arc::clone(&session),
    ));

    let (inbound_tx, inbound_rx) = mpsc::channel::<String>(INBOUND_QUEUE);
    let worker = tokio::spawn(run_session(
        Arc::clone(&state),
        Arc::clone(&session),
        inbound_rx,
    ));

    loop {
        let next = tokio::select! {
            () = session.closed() => break,
            next = receiver.next() => next,
        };
        match next {
            Some(Ok(Message::Text(text))) => {
                session.touch();
                if inbound_tx.send(text.as_str().to_string()).await.is_err() {
                    break;
                }
            }
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => session.touch(),
            Some(Err(e)) => {
                tracing::debug!(session_id = %session.id, "WebSocket receive error: {}", e);
                break;
            }
        }
    }

    state.sessions.remove(session.id).await;
    drop(inbound_tx);
    if let Err(e) = worker.await {
        tracing::error!(session_id = %session.id, "session worker failed: {}", e);
    }
    if let Err(e) = writer.await {
        tracing::error!(session_id = %session.id, "session writer failed: {}", e);
    }
}

/// Forwards queued messages to the socket and pushes a `pong` every
/// `keep_alive`. Sends a close frame once the session is closed.
async fn write_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<String>,
    keep_alive: Duration,
    session: Arc<SessionHandle>,
) {
    let mut ticker = (!keep_alive.is_zero())
        .then(|| tokio::time::interval_at(Instant::now() + keep_alive, keep_alive));

    loop {
        let text = tokio::select! {
            biased;
            next = rx.recv() => match next {
                Some(text) => text,
                None => break,
            },
            () = session.closed() => break,
            () = tick(&mut ticker) => match serde_json::to_string(&OutboundMessage::pong()) {
                Ok(text) => text,
                Err(_) => continue,
            },
        };
        if sender.send(Message::Text(text.into())).await.is_err() {
            session.close();
            break;
        }
    }
    let _ = sender.send(Message::Close(None)).await;
}

async fn tick(ticker: &mut Option<tokio::time::Interval>) {
    match ticker {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

/// Handles inbound messages one at a time, in arrival order.
async fn run_session(
    state: Arc<AppState>,
    session: Arc<SessionHandle>,
    mut inbound: mpsc::Receiver<String>,
) {
    while let Some(text) = inbound.recv().await {
        if session.is_closed() {
            break;
        }
        // Each message counts as one request, like an HTTP call, so errors
        // reported from here have a denominator in the error rate.
        let started = Instant::now();
        handle_message(&state, &session, &text).await;
        let failed = session.server_failed.swap(false, Ordering::Relaxed);
        state.monitor.record_request(!failed, started.elapsed());
    }
}

async fn handle_message(state: &AppState, session: &SessionHandle, text: &str) {
    let message = match serde_json::from_str::<InboundMessage>(text) {
        Ok(message) => message,
        Err(e) => {
            send_error(
                state,
                session,
                ApiError::Validation(format!("malformed message: {e}")),
            );
            return;
        }
    };
    session.adopt_user(message.user_id.as_deref());

    match message.kind.as_str() {
        "start_listening" => start_listening(state, session, message.conversation_id),
        "stop_listening" => {
            session.stop_listening();
            session.send(
                &OutboundMessage::status(json!({
                    "message": "Stopped listening",
                    "isListening": false,
                }))
                .in_conversation(session.conversation_id()),
            );
            tracing::info!(session_id = %session.id, "stopped listening");
        }
        "voice_chunk" => voice_chunk(state, session, message.data).await,
        "text_message" => {
            let text = message
                .data
                .as_ref()
                .and_then(|d| d.get("text"))
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|t| !t.is_empty());
            match text {
                Some(text) => generate_reply(state, session, text).await,
                None => send_error(
                    state,
                    session,
                    ApiError::UserInput("text message is required".to_string()),
                ),
            }
        }
        "ping" => session.send(&OutboundMessage::pong()),
        // Clients may answer keep-alives.
        "pong" => {}
        other => send_error(
            state,
            session,
            ApiError::UserInput(format!("unknown message type: {other}")),
        ),
    }
}

fn start_listening(state: &AppState, session: &SessionHandle, conversation_id: Option<String>) {
    let user_id = session.user_id();
    let key = RateLimiter::user_key(&user_id, "voice_stream");
    if let Err(e) = state.limiter.check(&key).into_result(&key) {
        tracing::warn!(session_id = %session.id, %user_id, "start_listening rate limited");
        send_error(state, session, e.into());
        return;
    }

    session.start_listening(conversation_id);
    session.send(
        &OutboundMessage::status(json!({
            "message": "Started listening",
            "isListening": true,
        }))
        .in_conversation(session.conversation_id()),
    );
    tracing::info!(session_id = %session.id, %user_id, "started listening");
}

async fn voice_chunk(state: &AppState, session: &SessionHandle, data: Option<Value>) {
    if !session.is_listening() {
        return;
    }
    let user_id = session.user_id();
    let burst_key = format!("burst:{user_id}");
    if let Err(e) = state.limiter.check_burst(&user_id).into_result(&burst_key) {
        tracing::warn!(session_id = %session.id, %user_id, "voice_chunk burst limited");
        send_error(state, session, e.into());
        return;
    }
    let frame = match data.map(serde_json::from_value::<AudioFrame>) {
        Some(Ok(frame)) => frame,
        Some(Err(e)) => {
            send_error(
                state,
                session,
                ApiError::Validation(format!("invalid audio frame: {e}")),
            );
            return;
        }
        None => {
            send_error(
                state,
                session,
                ApiError::Validation("voice_chunk requires an audio frame".to_string()),
            );
            return;
        }
    };

    match state.engine.process_audio_frame(&frame).await {
        Ok(Some(partial)) => {
            session.send(
                &OutboundMessage::new(
                    OutboundKind::TextResponse,
                    Some(json!({
                        "text": partial.text,
                        "isPartial": true,
                        "confidence": partial.confidence,
                    })),
                )
                .in_conversation(session.conversation_id()),
            );
            if partial.is_final {
                generate_reply(state, session, &partial.text).await;
            }
        }
        Ok(None) => {}
        Err(e) => send_error(state, session, e.into()),
    }
}

/// Rate-limits, generates a reply, sends it as text, then streams it as
/// speech.
async fn generate_reply(state: &AppState, session: &SessionHandle, text: &str) {
    let user_id = session.user_id();
    let key = RateLimiter::user_key(&user_id, "ai_response");
    if let Err(e) = state.limiter.check(&key).into_result(&key) {
        send_error(state, session, e.into());
        return;
    }

    let reply = match state.engine.generate_ai_response(text, None).await {
        Ok(reply) => reply,
        Err(e) => {
            send_error(state, session, e.into());
            return;
        }
    };

    let conversation_id = session.conversation_id();
    session.send(
        &OutboundMessage::new(
            OutboundKind::TextResponse,
            Some(json!({
                "text": reply.response,
                "isPartial": false,
                "model": reply.model,
                "persona": reply.persona,
                "latency": reply.latency_ms,
                "cached": reply.cached,
            })),
        )
        .in_conversation(conversation_id.clone()),
    );

    stream_speech(state, session, &reply.response, conversation_id).await;

    state
        .metrics
        .record("websocket_ai_response_latency_ms", reply.latency_ms);
    tracing::info!(
        session_id = %session.id,
        %user_id,
        text_len = text.len(),
        response_len = reply.response.len(),
        latency_ms = reply.latency_ms,
        cached = reply.cached,
        "AI response delivered"
    );
}

async fn stream_speech(
    state: &AppState,
    session: &SessionHandle,
    text: &str,
    conversation_id: Option<String>,
) {
    let mut chunks = state.engine.speak_text(text);
    let mut sequence: u64 = 0;
    loop {
        let next = tokio::select! {
            biased;
            () = session.closed() => {
                tracing::debug!(session_id = %session.id, "session closed, abandoning speech");
                return;
            }
            next = chunks.next() => next,
        };
        match next {
            Some(Ok(chunk)) => {
                session.send(
                    &OutboundMessage::new(
                        OutboundKind::VoiceResponse,
                        Some(json!({
                            "audioData": chunk.data_base64(),
                            "sequence": sequence,
                            "isLast": chunk.is_last,
                            "timestamp": chunk.timestamp,
                        })),
                    )
                    .in_conversation(conversation_id.clone()),
                );
                sequence += 1;
            }
            Some(Err(e)) => {
                send_error(state, session, e.into());
                return;
            }
            None => break,
        }
    }
    tracing::debug!(session_id = %session.id, chunks = sequence, "speech streamed");
}

/// Reports `err` to the client as an `error` message carrying the kind's
/// fallback text.
fn send_error(state: &AppState, session: &SessionHandle, err: ApiError) {
    tracing::warn!(
        session_id = %session.id,
        kind = err.kind().as_str(),
        "session request failed: {}",
        err
    );
    let response = state.error_response(&err);
    if response.status_code >= 500 {
        session.server_failed.store(true, Ordering::Relaxed);
    }
    session.send(&OutboundMessage::error(&response).in_conversation(session.conversation_id()));
}
