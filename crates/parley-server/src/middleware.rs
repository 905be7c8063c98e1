use axum::{body::Body, http::Request, middleware::Next, response::Response};
use std::sync::Arc;
use std::time::Instant;

use crate::AppState;

/// Times every request and feeds the outcome to the health monitor.
///
/// Only server-side failures (5xx) count against the error rate; a rejected
/// or malformed request is the client's problem.
pub async fn request_accounting_middleware(req: Request<Body>, next: Next) -> Response {
    let Some(state) = req.extensions().get::<Arc<AppState>>().cloned() else {
        return next.run(req).await;
    };
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    let started = Instant::now();
    let response = next.run(req).await;
    let elapsed = started.elapsed();

    let status = response.status();
    state
        .monitor
        .record_request(!status.is_server_error(), elapsed);
    tracing::debug!(
        %method,
        path,
        status = status.as_u16(),
        elapsed_ms = elapsed.as_millis() as u64,
        "request completed"
    );
    response
}
