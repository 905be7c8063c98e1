use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use parley_resilience::RateLimitConfig;
use parley_server::config::{Config, ProbeConfig};
use parley_server::{app, AppState};
use serde_json::{json, Value};
use tower::ServiceExt;

async fn state_with(config: Config) -> AppState {
    AppState::from_config(&config).await.unwrap()
}

async fn call(app: &Router, req: Request<Body>) -> (StatusCode, axum::http::HeaderMap, Vec<u8>) {
    let response = app.clone().oneshot(req).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, headers, body.to_vec())
}

async fn get_json(app: &Router, uri: &str) -> (StatusCode, Value) {
    let req = Request::builder().uri(uri).body(Body::empty()).unwrap();
    let (status, _, body) = call(app, req).await;
    (status, serde_json::from_slice(&body).unwrap())
}

fn post(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .header("x-user-id", "tester")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn post_json(app: &Router, uri: &str, body: Value) -> (StatusCode, Value) {
    let (status, _, body) = call(app, post(uri, body)).await;
    (status, serde_json::from_slice(&body).unwrap())
}

fn frame(seq: u64, vad: &str) -> Value {
    json!({
        "seq": seq,
        "timestamp": 1_700_000_000_000_i64,
        "format": {"sampleRate": 16000, "channels": 1, "encoding": "pcm16"},
        "vad": vad,
        "rms": 0.4,
    })
}

#[tokio::test]
async fn health_check_returns_ok() {
    let app = app(state_with(Config::default()).await);

    let (status, json) = get_json(&app, "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "ok");
    assert_eq!(json["version"], env!("CARGO_PKG_VERSION"));

    let (status, json) = get_json(&app, "/health/live").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "alive");
    assert!(json["uptimeMs"].is_u64());
}

#[tokio::test]
async fn readiness_follows_dependency_probes() {
    let app_state = state_with(Config::default()).await;
    let monitor = app_state.monitor.clone();
    let app = app(app_state);

    let (status, _) = get_json(&app, "/health/ready").await;
    assert_eq!(status, StatusCode::OK);

    // Without a shared tier the cache is degraded, which is still ready.
    monitor.check_dependencies().await;
    let (status, _) = get_json(&app, "/health/ready").await;
    assert_eq!(status, StatusCode::OK);

    let closed = {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };
    let mut config = Config::default();
    config.health.probes.push(ProbeConfig {
        name: "speech_farm".into(),
        url: format!("http://{closed}/healthz"),
        bearer_token: None,
    });
    let app_state = state_with(config).await;
    let monitor = app_state.monitor.clone();
    let app = self::app(app_state);

    monitor.check_dependencies().await;
    let (status, json) = get_json(&app, "/health/ready").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(json["status"], "not_ready");
    let services = json["services"].as_array().unwrap();
    assert!(services
        .iter()
        .any(|s| s["name"] == "speech_farm" && s["status"] == "unhealthy"));
}

#[tokio::test]
async fn metrics_count_requests_and_errors() {
    let app_state = state_with(Config::default()).await;
    let monitor = app_state.monitor.clone();
    let app = app(app_state);

    get_json(&app, "/health").await;
    let (status, _) = post_json(&app, "/llm/chat", json!({"message": "  "})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let requests = monitor.request_stats();
    assert_eq!(requests.total, 2);
    // A client error is not a server failure.
    assert_eq!(requests.failed, 0);

    let (status, json) = get_json(&app, "/health/metrics").await;
    assert_eq!(status, StatusCode::OK);
    assert!(json["status"].is_string());
    assert_eq!(json["metrics"]["errorsByKind"]["USER_INPUT"], 1);
    assert!(json["metrics"]["circuitBreakers"].is_object());
}

#[tokio::test]
async fn chat_replies_and_serves_repeats_from_cache() {
    let app = app(state_with(Config::default()).await);

    let (status, first) = post_json(&app, "/llm/chat", json!({"message": "hello"})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(first["response"], "You said: hello");
    assert_eq!(first["model"], "echo");
    assert_eq!(first["persona"], "Parley");
    assert_eq!(first["cached"], false);
    assert!(first["latencyMs"].is_u64());
    assert!(first["timestamp"].as_i64().unwrap() > 0);

    let (_, second) = post_json(&app, "/llm/chat", json!({"message": "hello"})).await;
    assert_eq!(second["cached"], true);
    assert_eq!(second["response"], first["response"]);

    let (_, other) = post_json(
        &app,
        "/llm/chat",
        json!({"message": "hello", "context": "kitchen"}),
    )
    .await;
    assert_eq!(other["cached"], false);
}

#[tokio::test]
async fn chat_rejects_malformed_body() {
    let app = app(state_with(Config::default()).await);

    let req = Request::builder()
        .method("POST")
        .uri("/llm/chat")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from("{\"message\":"))
        .unwrap();
    let (status, _, body) = call(&app, req).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let json: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["error"]["code"], "VALIDATION_ERROR");
    assert!(json["error"].get("detail").is_none());
}

#[tokio::test]
async fn chat_is_rate_limited_with_retry_after() {
    let mut config = Config::default();
    config.rate_limit.user = RateLimitConfig {
        max_requests: 1,
        window_ms: 60_000,
    };
    let app = app(state_with(config).await);

    let (status, _) = post_json(&app, "/llm/chat", json!({"message": "one"})).await;
    assert_eq!(status, StatusCode::OK);

    let (status, headers, body) = call(&app, post("/llm/chat", json!({"message": "two"}))).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    let retry_after: u64 = headers[header::RETRY_AFTER]
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    assert!((1..=60).contains(&retry_after));
    let json: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["error"]["code"], "RATE_LIMIT_EXCEEDED");
    assert_eq!(json["error"]["retryable"], true);
}

#[tokio::test]
async fn chat_stream_emits_fragments_then_done() {
    let app = app(state_with(Config::default()).await);

    let (status, headers, body) =
        call(&app, post("/llm/chat/stream", json!({"message": "hi there"}))).await;
    assert_eq!(status, StatusCode::OK);
    assert!(headers[header::CONTENT_TYPE]
        .to_str()
        .unwrap()
        .starts_with("text/event-stream"));

    let body = String::from_utf8(body).unwrap();
    let fragments: Vec<Value> = body
        .lines()
        .filter_map(|l| l.strip_prefix("data: "))
        .filter(|d| *d != "{}")
        .map(|d| serde_json::from_str(d).unwrap())
        .collect();
    let text: String = fragments
        .iter()
        .map(|f| f["text"].as_str().unwrap())
        .collect();
    assert_eq!(text, "You said: hi there");
    assert!(fragments.iter().all(|f| f["source"] == "local"));
    assert!(body.contains("event: done"));
}

#[tokio::test]
async fn persona_info_reports_greeting_and_farewell() {
    let app = app(state_with(Config::default()).await);
    let (status, json) = get_json(&app, "/persona/info").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["persona"], "Parley");
    assert!(!json["greeting"].as_str().unwrap().is_empty());
    assert!(!json["farewell"].as_str().unwrap().is_empty());
}

#[tokio::test]
async fn audio_frames_partials_and_finalize() {
    let app = app(state_with(Config::default()).await);

    let (status, json) = post_json(&app, "/audio/frame", frame(0, "speech")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["type"], "partial");
    assert_eq!(json["data"]["text"], "Hello world");
    assert_eq!(json["data"]["isFinal"], false);

    let (_, json) = post_json(&app, "/audio/frame", frame(1, "silence")).await;
    assert_eq!(json["type"], "no_partial");

    let (_, json) = post_json(&app, "/audio/frame", frame(1, "speech")).await;
    assert_eq!(json["data"]["text"], "How are you today");

    let (status, json) = post_json(&app, "/audio/finalize", json!({})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["type"], "final");
    assert_eq!(json["data"]["text"], "Hello world How are you today");
    assert_eq!(json["data"]["isFinal"], true);

    // The buffer was consumed.
    let (_, json) = post_json(&app, "/audio/finalize", json!({})).await;
    assert_eq!(json["type"], "no_final");

    let (_, stats) = get_json(&app, "/audio/stats").await;
    assert_eq!(stats["totalFrames"], 3);
    assert_eq!(stats["speechFrames"], 2);
    assert!((stats["speechRatio"].as_f64().unwrap() - 2.0 / 3.0).abs() < 1e-9);
    assert_eq!(stats["engine"]["stt"], "placeholder");
    assert!(stats["engine"]["latency"]["stt_partial_latency_ms"].is_object());

    let (status, _) = post_json(&app, "/audio/reset-stats", json!({})).await;
    assert_eq!(status, StatusCode::OK);
    let (_, stats) = get_json(&app, "/audio/stats").await;
    assert_eq!(stats["totalFrames"], 0);
    assert_eq!(stats["speechRatio"], 0.0);
}

fn post_to_stream(uri: &str, body: Value, stream: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .header("x-stream-id", stream)
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn stream_json(app: &Router, uri: &str, body: Value, stream: &str) -> Value {
    let (status, _, body) = call(app, post_to_stream(uri, body, stream)).await;
    assert_eq!(status, StatusCode::OK);
    serde_json::from_slice(&body).unwrap()
}

#[tokio::test]
async fn interleaved_streams_finalize_their_own_partials() {
    let app = app(state_with(Config::default()).await);

    stream_json(&app, "/audio/frame", frame(0, "speech"), "mic-a").await;
    stream_json(&app, "/audio/frame", frame(1, "speech"), "mic-b").await;
    stream_json(&app, "/audio/frame", frame(2, "speech"), "mic-a").await;

    let a = stream_json(&app, "/audio/finalize", json!({}), "mic-a").await;
    assert_eq!(a["type"], "final");
    let a_text = a["data"]["text"].as_str().unwrap();
    assert!(a_text.starts_with("Hello world"));
    assert!(!a_text.contains("How are you today"));

    let b = stream_json(&app, "/audio/finalize", json!({}), "mic-b").await;
    assert_eq!(b["data"]["text"], "How are you today");

    let a_again = stream_json(&app, "/audio/finalize", json!({}), "mic-a").await;
    assert_eq!(a_again["type"], "no_final");
}

#[tokio::test]
async fn finalize_without_stream_is_rejected() {
    let app = app(state_with(Config::default()).await);
    let req = Request::builder()
        .method("POST")
        .uri("/audio/finalize")
        .body(Body::empty())
        .unwrap();
    let (status, _, body) = call(&app, req).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let json: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["error"]["code"], "VALIDATION_ERROR");
}

#[tokio::test]
async fn audio_frame_rejects_invalid_payload() {
    let app = app(state_with(Config::default()).await);
    let (status, _, body) = call(&app, post("/audio/frame", json!({"seq": "first"}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let json: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["error"]["code"], "VALIDATION_ERROR");
}

#[tokio::test]
async fn audio_health_reports_collaborators() {
    let app = app(state_with(Config::default()).await);
    let (status, json) = get_json(&app, "/audio/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["stt"]["engine"], "placeholder");
    assert_eq!(json["tts"]["engine"], "silence");
    assert_eq!(json["stt"]["circuit"], "CLOSED");
}

#[tokio::test]
async fn ws_stats_start_empty() {
    let app = app(state_with(Config::default()).await);
    let (status, json) = get_json(&app, "/ws/stats").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["totalConnections"], 0);
    assert_eq!(json["listeningConnections"], 0);
    assert_eq!(json["connections"], json!([]));
}

#[tokio::test]
async fn prometheus_metrics_expose_request_counters() {
    let app = app(state_with(Config::default()).await);
    get_json(&app, "/health").await;

    let req = Request::builder().uri("/metrics").body(Body::empty()).unwrap();
    let (status, headers, body) = call(&app, req).await;
    assert_eq!(status, StatusCode::OK);
    assert!(headers[header::CONTENT_TYPE]
        .to_str()
        .unwrap()
        .starts_with("text/plain"));
    let text = String::from_utf8(body).unwrap();
    assert!(text.contains(r#"parley_requests_total{outcome="success"} 1"#));
    assert!(text.contains("parley_ws_connections 0"));
    assert!(text.contains("parley_error_rate"));
}

#[tokio::test]
async fn llm_health_follows_the_circuit() {
    let app_state = state_with(Config::default()).await;
    let breakers = app_state.breakers.clone();
    let app = app(app_state);

    let (status, json) = get_json(&app, "/llm/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "ok");
    assert_eq!(json["model"], "echo");
    assert_eq!(json["circuit"], "CLOSED");
    assert_eq!(json["features"]["streaming"], true);

    let llm = breakers.breaker("llm");
    for _ in 0..llm.config().failure_threshold {
        let _ = llm.execute(|| async { Err::<(), _>("provider down") }).await;
    }
    let (status, json) = get_json(&app, "/llm/health").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(json["status"], "error");
    assert_eq!(json["circuit"], "OPEN");
}

#[tokio::test]
async fn stt_process_transcribes_one_frame() {
    let app = app(state_with(Config::default()).await);

    let mut speech = frame(0, "speech");
    speech["data"] = json!("AAAAAA==");
    let (status, json) = post_json(&app, "/stt/process", speech).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["text"], "Hello world");
    assert_eq!(json["isFinal"], false);

    let mut silence = frame(1, "silence");
    silence["data"] = json!("AAAAAA==");
    let (status, _, body) = call(&app, post("/stt/process", silence)).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert!(body.is_empty());

    let (status, json) = post_json(&app, "/stt/process", frame(2, "speech")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["error"]["code"], "USER_INPUT_ERROR");
}

#[tokio::test]
async fn tts_synthesize_returns_all_chunks() {
    let app = app(state_with(Config::default()).await);

    let (status, json) =
        post_json(&app, "/tts/synthesize", json!({"text": "hello there friend"})).await;
    assert_eq!(status, StatusCode::OK);
    let chunks = json["audioChunks"].as_array().unwrap();
    assert_eq!(chunks.len(), 3);
    assert!(chunks.iter().all(|c| c["data"].is_string()));
    assert_eq!(chunks[2]["sequence"], 2);
    assert_eq!(chunks[2]["isLast"], true);
    assert_eq!(chunks[0]["isLast"], false);

    let (status, json) = post_json(&app, "/tts/synthesize", json!({"text": "  "})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["error"]["code"], "USER_INPUT_ERROR");
}
