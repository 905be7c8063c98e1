//! Parley server library logic.

pub mod api_audio;
pub mod api_chat;
pub mod api_health;
pub mod api_speech;
pub mod api_ws;
pub mod background;
pub mod config;
pub mod error;
pub mod middleware;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Extension, Router,
};
use config::{CacheSection, Config, SessionConfig};
use error::{ApiError, StartupError};
use parley_cache::TwoTierCache;
use parley_observe::{
    CacheProbe, HealthMonitor, HealthSources, HttpProbe, Metrics, PrometheusExporter,
};
use prometheus::IntGauge;
use parley_resilience::{CircuitBreakerManager, ErrorResponse, RateLimiter};
use parley_voice::{ConversationEngine, LlmBackend};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Dependency probe name for the hosted language model provider.
pub const LLM_PROVIDER_PROBE: &str = "llm_provider";

/// Application state shared across all request handlers and sessions.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<ConversationEngine>,
    pub cache: Arc<TwoTierCache>,
    pub breakers: Arc<CircuitBreakerManager>,
    /// Per-user fixed-window limiter.
    pub limiter: RateLimiter,
    pub monitor: Arc<HealthMonitor>,
    pub metrics: Metrics,
    /// Live WebSocket sessions.
    pub sessions: api_ws::SessionManager,
    /// Frame counters and buffered partials for the request/reply audio path.
    pub ingress: api_audio::AudioIngress,
    pub exporter: Arc<PrometheusExporter>,
    /// Open WebSocket sessions, refreshed on every scrape.
    pub ws_connections: IntGauge,
    pub session_config: SessionConfig,
    pub expose_error_details: bool,
}

impl AppState {
    /// Composition root: builds every shared component from `config`.
    ///
    /// An unreachable shared cache is not fatal; the process continues with
    /// local caching only.
    pub async fn from_config(config: &Config) -> Result<Self, StartupError> {
        let cache = Arc::new(build_cache(&config.cache).await);
        let breakers = Arc::new(CircuitBreakerManager::with_overrides(
            config.breakers.default.clone(),
            config.breakers.services.clone(),
        ));
        let limiter = RateLimiter::new(config.rate_limit.user);
        let metrics = Metrics::new();

        let engine = ConversationEngine::new(
            config.engine.build_stt(),
            config.engine.build_llm()?,
            config.engine.build_tts(),
            Arc::clone(&cache),
            Arc::clone(&breakers),
        )
        .with_metrics(metrics.clone())
        .with_persona(config.engine.persona.clone())
        .with_settings(config.engine.settings());

        let sources = HealthSources {
            cache: Some(Arc::clone(&cache)),
            breakers: Some(Arc::clone(&breakers)),
            limiter: Some(limiter.clone()),
            metrics: Some(metrics.clone()),
        };
        let mut monitor = HealthMonitor::new(config.health.thresholds, sources)
            .with_probe(Arc::new(CacheProbe::new(Arc::clone(&cache))));
        if config.engine.llm.backend == LlmBackend::OpenAi {
            let url = format!(
                "{}/models",
                config.engine.llm.base_url.trim_end_matches('/')
            );
            monitor = monitor.with_probe(Arc::new(
                HttpProbe::new(LLM_PROVIDER_PROBE, url).with_bearer(config.engine.llm.api_key.clone()),
            ));
        }
        for probe in &config.health.probes {
            let mut http = HttpProbe::new(probe.name.clone(), probe.url.clone());
            if let Some(token) = &probe.bearer_token {
                http = http.with_bearer(token.clone());
            }
            monitor = monitor.with_probe(Arc::new(http));
        }

        let exporter = PrometheusExporter::new()?;
        let ws_connections = IntGauge::new("ws_connections", "Open WebSocket sessions")
            .map_err(parley_observe::ObserveError::from)?;
        exporter
            .registry()
            .register(Box::new(ws_connections.clone()))
            .map_err(parley_observe::ObserveError::from)?;

        Ok(Self {
            engine: Arc::new(engine),
            cache,
            breakers,
            limiter,
            monitor: Arc::new(monitor),
            metrics,
            sessions: api_ws::SessionManager::new(),
            ingress: api_audio::AudioIngress::new(),
            exporter: Arc::new(exporter),
            ws_connections,
            session_config: config.session.clone(),
            expose_error_details: config.server.expose_error_details,
        })
    }

    /// Counts `err` against the health monitor and renders it for a client.
    pub fn error_response(&self, err: &ApiError) -> ErrorResponse {
        self.monitor.record_error(err.kind());
        err.to_response(self.expose_error_details)
    }
}

#[cfg(feature = "redis")]
async fn build_cache(section: &CacheSection) -> TwoTierCache {
    let config = section.cache_config();
    let Some(url) = section.redis_url.as_deref() else {
        return TwoTierCache::new(config);
    };
    match parley_cache::RedisStore::connect(url).await {
        Ok(store) => {
            tracing::info!("shared cache connected");
            TwoTierCache::with_remote(config, Arc::new(store))
        }
        Err(e) => {
            tracing::warn!(
                "shared cache not available, continuing with local cache only: {}",
                e
            );
            TwoTierCache::new(config)
        }
    }
}

#[cfg(not(feature = "redis"))]
async fn build_cache(section: &CacheSection) -> TwoTierCache {
    if section.redis_url.is_some() {
        tracing::warn!("cache.redis_url is set but the redis feature is disabled; using local cache only");
    }
    TwoTierCache::new(section.cache_config())
}

/// Maximum request body size (2 MiB). Audio frames carry at most a few
/// hundred milliseconds of base64 PCM.
const MAX_REQUEST_BODY_BYTES: usize = 2 * 1024 * 1024;

/// Builds the application router with all routes.
pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(api_health::health_handler))
        .route("/health/live", get(api_health::live_handler))
        .route("/health/ready", get(api_health::ready_handler))
        .route("/health/metrics", get(api_health::metrics_handler))
        .route("/metrics", get(api_health::prometheus_handler))
        .route("/llm/health", get(api_health::llm_health_handler))
        .route("/llm/chat", post(api_chat::chat_handler))
        .route("/llm/chat/stream", post(api_chat::chat_stream_handler))
        .route("/persona/info", get(api_chat::persona_handler))
        .route("/audio/frame", post(api_audio::frame_handler))
        .route("/audio/finalize", post(api_audio::finalize_handler))
        .route("/audio/stats", get(api_audio::stats_handler))
        .route("/audio/reset-stats", post(api_audio::reset_stats_handler))
        .route("/audio/health", get(api_audio::health_handler))
        .route("/stt/process", post(api_speech::stt_handler))
        .route("/tts/synthesize", post(api_speech::tts_handler))
        .route("/ws/chat", get(api_ws::ws_handler))
        .route("/ws/stats", get(api_ws::stats_handler))
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_BYTES))
        .layer(axum::middleware::from_fn(
            middleware::request_accounting_middleware,
        ))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(Extension(Arc::new(state)))
}
