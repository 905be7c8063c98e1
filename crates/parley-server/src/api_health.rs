//! Liveness, readiness and metrics endpoints.

use crate::{AppState, LLM_PROVIDER_PROBE};
use axum::{
    extract::Extension,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use parley_observe::HealthStatus;
use parley_resilience::CircuitState;
use parley_types::now_millis;
use serde_json::json;
use std::sync::Arc;

/// `GET /health`
pub async fn health_handler() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// `GET /health/live`: the process is up and serving.
pub async fn live_handler(Extension(state): Extension<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "alive",
        "uptimeMs": state.monitor.uptime().as_millis() as u64,
    }))
}

/// `GET /health/ready`: 503 while any dependency was last seen unhealthy.
pub async fn ready_handler(Extension(state): Extension<Arc<AppState>>) -> impl IntoResponse {
    if state.monitor.is_ready() {
        (StatusCode::OK, Json(json!({ "status": "ready" })))
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "not_ready",
                "services": state.monitor.services(),
            })),
        )
    }
}

/// `GET /health/metrics`: overall status plus the full metrics view.
pub async fn metrics_handler(Extension(state): Extension<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": state.monitor.overall_health(),
        "metrics": state.monitor.health_metrics(),
        "services": state.monitor.services(),
    }))
}

/// `GET /llm/health`: 503 while the language model circuit is open or its
/// provider was last seen unhealthy.
pub async fn llm_health_handler(Extension(state): Extension<Arc<AppState>>) -> impl IntoResponse {
    let circuit = state.breakers.breaker("llm").state();
    let provider = state
        .monitor
        .services()
        .into_iter()
        .find(|s| s.name == LLM_PROVIDER_PROBE);
    let model = state.engine.stats().model;

    let problem = if circuit == CircuitState::Open {
        Some("language model circuit is open".to_string())
    } else {
        provider
            .as_ref()
            .filter(|p| p.status == HealthStatus::Unhealthy)
            .map(|p| {
                p.error
                    .clone()
                    .unwrap_or_else(|| "provider is unhealthy".to_string())
            })
    };

    match problem {
        Some(error) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "error",
                "timestamp": now_millis(),
                "model": model,
                "circuit": circuit,
                "error": error,
            })),
        ),
        None => (
            StatusCode::OK,
            Json(json!({
                "status": "ok",
                "timestamp": now_millis(),
                "model": model,
                "circuit": circuit,
                "provider": provider.map(|p| p.status),
                "features": {
                    "streaming": true,
                    "caching": true,
                    "circuitBreaker": true,
                },
            })),
        ),
    }
}

/// `GET /metrics`: Prometheus text exposition.
pub async fn prometheus_handler(Extension(state): Extension<Arc<AppState>>) -> Response {
    state
        .ws_connections
        .set(i64::try_from(state.sessions.len().await).unwrap_or(i64::MAX));

    match state.exporter.render(&state.monitor.health_metrics()) {
        Ok(body) => (
            [(header::CONTENT_TYPE, state.exporter.content_type())],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!("failed to render metrics: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
