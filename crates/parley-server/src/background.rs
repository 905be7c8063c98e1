//! Background tasks for the Parley server.
//!
//! Includes:
//! - Sweeping idle WebSocket sessions and over-long listening periods.
//! - Dropping audio stream buffers that stopped receiving frames.

use crate::AppState;
use std::sync::Arc;
use tokio::time::sleep;

/// Starts the session sweep task.
///
/// Runs indefinitely. Each pass closes sessions idle longer than the
/// configured inactivity timeout and stops listening periods that exceeded
/// the listening limit. Audio stream buffers idle past the same timeout are
/// dropped.
pub async fn start_session_sweep_task(state: Arc<AppState>) {
    let config = &state.session_config;
    let interval = config.sweep_interval();
    if interval.is_zero() {
        tracing::warn!("session sweep task disabled (sweep_interval_secs=0)");
        return;
    }
    let inactivity = config.inactivity_timeout();
    let max_listening = config.max_listening();

    tracing::info!(
        interval_secs = interval.as_secs(),
        inactivity_secs = inactivity.as_secs(),
        max_listening_secs = max_listening.map(|d| d.as_secs()).unwrap_or(0),
        "starting session sweep task"
    );

    loop {
        sleep(interval).await;

        let report = state.sessions.sweep(inactivity, max_listening).await;
        if report.closed > 0 || report.listening_expired > 0 {
            let remaining = state.sessions.len().await;
            tracing::info!(
                closed = report.closed,
                listening_expired = report.listening_expired,
                remaining,
                "session sweep completed"
            );
        }

        let dropped = state.ingress.sweep(inactivity);
        if dropped > 0 {
            tracing::info!(dropped, "dropped idle audio stream buffers");
        }
    }
}
