//! Error types for the observability layer.

/// Failures reported by dependency probes and the metrics exporter.
#[derive(Debug, thiserror::Error)]
pub enum ObserveError {
    /// The dependency answered that it is not usable.
    #[error("dependency unavailable: {0}")]
    Unavailable(String),

    /// The HTTP probe could not complete.
    #[error("probe request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// A metrics series could not be registered or encoded.
    #[error("metrics export failed: {0}")]
    Prometheus(#[from] prometheus::Error),

    #[error("metrics export failed: {0}")]
    Export(String),
}
